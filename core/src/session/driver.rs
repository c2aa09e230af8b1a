//! Event loop
//!
//! Feeds transport events into a `ConnectionOrchestrator` one at a time and
//! interleaves periodic `Tick`s for time-based checks.

use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::orchestrator::ConnectionOrchestrator;
use super::OrchestratorError;
use crate::nonce::NonceStore;
use crate::transport::{EventReceiver, Transport, TransportEvent};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Start `orchestrator` and process events until `stop` resolves or every
/// sender is dropped.
///
/// Per-event errors are logged and the loop keeps going; only a failed
/// start is returned.
pub async fn run<T, S, F>(
    orchestrator: &mut ConnectionOrchestrator<T, S>,
    mut events: EventReceiver,
    tick_interval: Duration,
    stop: F,
) -> Result<(), OrchestratorError>
where
    T: Transport,
    S: NonceStore,
    F: Future<Output = ()>,
{
    orchestrator.start()?;

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => {
                info!("Event loop stopping");
                orchestrator.shutdown();
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => dispatch(orchestrator, event),
                    None => {
                        debug!("Event channel closed");
                        break;
                    }
                }
            }
            tick = ticker.tick() => {
                dispatch(orchestrator, TransportEvent::Tick { now: tick.into_std() });
            }
        }
    }

    Ok(())
}

fn dispatch<T: Transport, S: NonceStore>(
    orchestrator: &mut ConnectionOrchestrator<T, S>,
    event: TransportEvent,
) {
    match orchestrator.handle_event(event) {
        Ok(()) => {}
        Err(e @ OrchestratorError::Fault(_)) => error!("{}", e),
        Err(e) => warn!("{}", e),
    }
}
