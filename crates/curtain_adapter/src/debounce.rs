#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use curtain_os::vis_events::DebounceToken;

use crate::{AdapterRuntime, SignalDispatch};

/// Owns the one live debounce timer. Tokens only move forward: arming a
/// token older than the one already armed is ignored, so a late handler can
/// never abort the timer of a newer run.
pub struct DebouncedRunScheduler {
    runtime: Arc<Mutex<AdapterRuntime>>,
    timer: Mutex<ArmedTimer>,
}

#[derive(Default)]
struct ArmedTimer {
    token: Option<DebounceToken>,
    handle: Option<JoinHandle<()>>,
}

impl DebouncedRunScheduler {
    pub fn new(runtime: Arc<Mutex<AdapterRuntime>>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            timer: Mutex::new(ArmedTimer::default()),
        })
    }

    pub fn runtime(&self) -> &Arc<Mutex<AdapterRuntime>> {
        &self.runtime
    }

    pub fn armed_token(&self) -> Option<DebounceToken> {
        self.timer.lock().ok().and_then(|slot| slot.token)
    }

    pub fn arm_if_scheduled(&self, dispatch: &SignalDispatch) {
        if let SignalDispatch::Scheduled { token, delay_ms } = dispatch {
            self.arm(*token, *delay_ms);
        }
    }

    fn arm(&self, token: DebounceToken, delay_ms: u64) {
        let mut slot = match self.timer.lock() {
            Ok(slot) => slot,
            Err(_) => {
                warn!(token = token.0, "debounce timer lock poisoned");
                return;
            }
        };
        if slot.token.is_some_and(|armed| armed >= token) {
            debug!(token = token.0, "debounce arm ignored: newer token already armed");
            return;
        }
        let runtime = Arc::clone(&self.runtime);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let fired = tokio::task::spawn_blocking(move || {
                let mut rt = runtime
                    .lock()
                    .map_err(|_| "adapter runtime lock poisoned".to_string())?;
                Ok::<_, String>(rt.fire_debounced(token, None))
            })
            .await;
            match fired {
                Ok(Ok(Some(outcome))) => {
                    debug!(token = token.0, outcome = ?outcome, "debounced run finished")
                }
                Ok(Ok(None)) => debug!(token = token.0, "debounced run dropped"),
                Ok(Err(err)) => warn!(token = token.0, error = %err, "debounced run failed"),
                Err(err) => warn!(token = token.0, error = %err, "debounced run task failed"),
            }
        });
        slot.token = Some(token);
        if let Some(previous) = slot.handle.replace(handle) {
            previous.abort();
        }
    }

    /// Aborts the armed timer. The token high-water mark is kept.
    pub fn cancel(&self) {
        match self.timer.lock() {
            Ok(mut slot) => {
                if let Some(previous) = slot.handle.take() {
                    previous.abort();
                }
            }
            Err(_) => warn!("debounce timer lock poisoned"),
        }
    }
}
