//! The cooperative driver pumping the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::session::engine::Engine;

/// Engine tick cadence.
pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Spawn the tick loop. The task runs until `running` goes false (and the
/// `shutdown` notify wakes it), then performs the session teardown.
pub(crate) fn spawn(
    engine: Arc<Mutex<Engine>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    engine.lock().await.tick().await;
                }
                () = shutdown.notified() => break,
            }
        }

        engine.lock().await.end().await;
        debug!("driver stopped");
    })
}
