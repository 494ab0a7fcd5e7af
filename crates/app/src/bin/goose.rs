use goose::prelude::*;
use rand::Rng;
use serde_json::json;

const RESOURCE_KINDS: [&str; 4] = ["document", "album", "invoice", "report"];
const ACTIONS: [&str; 4] = ["view", "edit", "delete", "share"];

async fn setup_custom_client(user: &mut GooseUser) -> TransactionResult {
    use reqwest::Client;

    let builder = Client::builder().gzip(true);
    user.set_client_builder(builder).await?;
    Ok(())
}

fn check_resources_payload() -> serde_json::Value {
    let mut rng = rand::rng();
    let resources: Vec<serde_json::Value> = (0..rng.random_range(1..=5))
        .map(|_| {
            let kind = RESOURCE_KINDS[rng.random_range(0..RESOURCE_KINDS.len())];
            let action_count = rng.random_range(1..=ACTIONS.len());
            json!({
                "resource": {
                    "kind": kind,
                    "id": format!("{kind}-{}", rng.random_range(0..10_000)),
                    "attr": {"owner": format!("user-{}", rng.random_range(0..100))},
                },
                "actions": &ACTIONS[..action_count],
            })
        })
        .collect();
    json!({
        "requestId": format!("goose-{}", rng.random::<u64>()),
        "principal": {
            "id": format!("user-{}", rng.random_range(0..100)),
            "roles": ["user"],
            "attr": {"department": "engineering"},
        },
        "resources": resources,
    })
}

async fn check_resources_roundtrip(user: &mut GooseUser) -> TransactionResult {
    let payload = check_resources_payload();
    let mut goose = user.post_json("/v1/check-resources", &payload).await?;
    let response = goose
        .response
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    if !status.is_success() {
        return user.set_failure(
            &format!("status {}", status.as_u16()),
            &mut goose.request,
            None,
            Some(&body),
        );
    }
    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) => return user.set_failure("invalid json", &mut goose.request, None, Some(&body)),
    };
    let expected = payload["resources"].as_array().map_or(0, Vec::len);
    let results = parsed
        .get("results")
        .and_then(|value| value.as_array())
        .map_or(0, Vec::len);
    if results != expected {
        return user.set_failure("result count mismatch", &mut goose.request, None, Some(&body));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("check_resources")
                .register_transaction(transaction!(setup_custom_client).set_on_start())
                .register_transaction(transaction!(check_resources_roundtrip)),
        )
        .execute()
        .await?;
    Ok(())
}
