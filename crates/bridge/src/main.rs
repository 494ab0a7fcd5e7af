use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use bridge::engine::{Effect, StaticEngine};
use bridge::logger::{LogConfig, init_logging};
use bridge::loopback::Loopback;
use bridge::{BridgeConfig, CallbackHandlers, InitOptions};
use serde_json::json;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const IMAGE_BYTES: usize = 600 * 1024;
const CONCURRENT_CHECKS: usize = 25;

fn generate_engine_image(len: usize) -> Vec<u8> {
    println!("Generating a {len}-byte stand-in engine image");
    let mut rng = rand::rng();
    let mut image = vec![0u8; len];
    rng.fill(image.as_mut_slice());
    image[..4].copy_from_slice(b"\0asm");
    image
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging(&LogConfig::from_env())?;

    println!("Loopback PDP bridge: upload, init and {CONCURRENT_CHECKS} concurrent checks.");
    let config = BridgeConfig::from_env()?;
    let loopback = Loopback::start(config, Arc::new(StaticEngine::new(Effect::Allow))).await?;
    let bridge = loopback.bridge().clone();

    let image = tokio::task::spawn_blocking(|| generate_engine_image(IMAGE_BYTES)).await?;
    let start = Instant::now();
    bridge.upload_wasm(image).await?;
    println!("Upload took {:.3} seconds", start.elapsed().as_secs_f64());

    let decisions = Arc::new(AtomicUsize::new(0));
    let counter = decisions.clone();
    let handlers = CallbackHandlers::new()
        .on_decision(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .on_policy_update(|update| {
            println!("Policy update: {update}");
            Ok(())
        });
    let init = bridge
        .init(InitOptions::new(json!({"policies": []})).with_handlers(handlers))
        .await?;
    println!("Init: {init}");

    let start = Instant::now();
    let mut checks = tokio::task::JoinSet::new();
    for i in 0..CONCURRENT_CHECKS {
        let bridge = bridge.clone();
        checks.spawn(async move {
            bridge
                .check_resources(json!({
                    "requestId": format!("demo-{i}"),
                    "principal": {"id": "demo-user", "roles": ["user"], "attr": {}},
                    "resources": [
                        {"resource": {"kind": "document", "id": format!("doc-{i}")}, "actions": ["view"]}
                    ],
                }))
                .await
        });
    }
    let mut allowed = 0;
    while let Some(joined) = checks.join_next().await {
        let result = joined??;
        if result["results"][0]["actions"]["view"]["effect"] == "EFFECT_ALLOW" {
            allowed += 1;
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    println!("Time taken: {elapsed} seconds");
    println!("Allowed: {allowed}/{CONCURRENT_CHECKS}");
    println!(
        "Decision log entries so far: {}",
        decisions.load(Ordering::Relaxed)
    );
    loopback.shutdown();
    Ok(())
}
