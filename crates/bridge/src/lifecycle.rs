use std::fmt;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Loading,
    Ready,
    Reloading,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Reloading => write!(f, "reloading"),
            Self::TornDown => write!(f, "torn_down"),
        }
    }
}

struct LifecycleInner {
    state: LifecycleState,
    epoch: u64,
    waiters: Vec<oneshot::Sender<Result<(), BridgeError>>>,
}

/// Readiness of the sandbox plus the callers parked until it is ready.
///
/// The epoch advances on every restart so work started against an older
/// sandbox can tell its results no longer apply.
pub struct Lifecycle {
    inner: Mutex<LifecycleInner>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LifecycleInner {
                state: LifecycleState::Loading,
                epoch: 0,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn waiter_count(&self) -> usize {
        self.inner
            .lock()
            .waiters
            .iter()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }

    /// Handles the sandbox's `Ready` signal. Returns false when nothing
    /// changed (already ready, or torn down).
    pub fn mark_ready(&self) -> bool {
        let waiters = {
            let mut inner = self.inner.lock();
            match inner.state {
                LifecycleState::Ready | LifecycleState::TornDown => return false,
                LifecycleState::Loading | LifecycleState::Reloading => {}
            }
            inner.state = LifecycleState::Ready;
            std::mem::take(&mut inner.waiters)
        };
        let released = waiters
            .into_iter()
            .filter_map(|waiter| waiter.send(Ok(())).ok())
            .count();
        tracing::info!(released, "sandbox ready");
        true
    }

    /// Moves to `Reloading` (or stays `Loading` if the sandbox never became
    /// ready), advances the epoch and rejects parked callers. Returns the
    /// number of rejected waiters, or `None` once torn down.
    pub fn begin_reload(&self) -> Option<usize> {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.state = match inner.state {
                LifecycleState::TornDown => return None,
                LifecycleState::Loading => LifecycleState::Loading,
                LifecycleState::Ready | LifecycleState::Reloading => LifecycleState::Reloading,
            };
            inner.epoch += 1;
            std::mem::take(&mut inner.waiters)
        };
        Some(reject_waiters(waiters, &BridgeError::Reloaded))
    }

    /// Terminal transition. Returns the number of rejected waiters.
    pub fn tear_down(&self) -> usize {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.state == LifecycleState::TornDown {
                return 0;
            }
            inner.state = LifecycleState::TornDown;
            inner.epoch += 1;
            std::mem::take(&mut inner.waiters)
        };
        reject_waiters(waiters, &BridgeError::unavailable("bridge torn down"))
    }

    /// Resolves once the sandbox is ready. Fails immediately after teardown
    /// and with `Reloaded` if the sandbox restarts while waiting.
    pub async fn wait_ready(&self) -> Result<(), BridgeError> {
        let receiver = {
            let mut inner = self.inner.lock();
            match inner.state {
                LifecycleState::Ready => return Ok(()),
                LifecycleState::TornDown => {
                    return Err(BridgeError::unavailable("bridge torn down"));
                }
                LifecycleState::Loading | LifecycleState::Reloading => {}
            }
            inner.waiters.retain(|waiter| !waiter.is_closed());
            let (sender, receiver) = oneshot::channel();
            inner.waiters.push(sender);
            receiver
        };
        receiver
            .await
            .unwrap_or_else(|_| Err(BridgeError::unavailable("readiness waiter dropped")))
    }
}

fn reject_waiters(
    waiters: Vec<oneshot::Sender<Result<(), BridgeError>>>,
    error: &BridgeError,
) -> usize {
    waiters
        .into_iter()
        .filter_map(|waiter| waiter.send(Err(error.clone())).ok())
        .count()
}
