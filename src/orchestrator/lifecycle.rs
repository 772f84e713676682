// 9.3 orchestrator/lifecycle.rs: start/stop. the timer task is the only owner of the cycle loop.
// stop lets an in-flight cycle finish; it never aborts mid-cycle.

use super::core::{LoopHandle, Orchestrator};
use super::results::OrchestratorError;
use crate::events::EventPayload;
use std::sync::atomic::Ordering;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl Orchestrator {
    /// Spawn the cycle loop. Calling it again while running is a logged no-op.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| OrchestratorError::NoRuntime)?;

        let mut lifecycle = self.shared.lifecycle.lock().await;
        if lifecycle.is_some() {
            info!("orchestrator already running, start ignored");
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let this = self.clone();
        let token = shutdown.clone();
        let task = runtime.spawn(async move { this.run_loop(token).await });

        *lifecycle = Some(LoopHandle { shutdown, task });
        self.shared.running.store(true, Ordering::SeqCst);
        self.emit(EventPayload::Started);
        info!(interval_ms = self.interval().as_millis() as u64, "orchestrator started");
        Ok(())
    }

    /// Stop the loop and wait for any in-flight cycle. No-op when stopped.
    pub async fn stop(&self) {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        let Some(LoopHandle { shutdown, task }) = lifecycle.take() else {
            info!("orchestrator not running, stop ignored");
            return;
        };

        shutdown.cancel();
        if let Err(e) = task.await {
            warn!(error = %e, "cycle loop ended abnormally");
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.emit(EventPayload::Stopped);
        info!("orchestrator stopped");
    }

    async fn run_loop(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    // the cycle runs outside the select, so cancellation waits for it
                    let outcome = self.run_cycle().await;
                    debug!(?outcome, "cycle finished");
                }
            }
        }
        debug!("cycle loop exited");
    }
}
