//! Background refresh of every parameter slot
//!
//! The reader walks the metas in [`MetaEnum::READ_ORDER`] and, for each,
//! every multiplex group with one `read_multiple` at cyclic priority. Limits
//! are therefore fresh before the value they bound.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::NvError;
use crate::meta::MetaEnum;
use crate::pause::{PauseGate, PauseToken};
use crate::protocol::{NvProtocol, RequestContext};
use crate::registry::ParamId;

/// Handle of the background reader task
///
/// Dropping the handle stops the loop at its next suspension point.
pub struct CyclicReader {
    cancel: CancellationToken,
    gate: PauseGate,
    passes: watch::Receiver<u64>,
    task: Option<JoinHandle<()>>,
}

impl CyclicReader {
    /// Start polling through `protocol`
    pub fn spawn(protocol: NvProtocol, gate: PauseGate, delay: Duration) -> Self {
        let cancel = CancellationToken::new();
        let (passes_tx, passes) = watch::channel(0);
        let task = tokio::spawn(run(protocol, gate.clone(), delay, cancel.clone(), passes_tx));
        info!(delay_ms = delay.as_millis() as u64, "Cyclic reader started");
        Self {
            cancel,
            gate,
            passes,
            task: Some(task),
        }
    }

    /// Suspend polling while the token lives
    pub fn pause(&self) -> PauseToken {
        self.gate.pause()
    }

    pub fn gate(&self) -> &PauseGate {
        &self.gate
    }

    /// Completed passes over all groups and metas
    pub fn passes(&self) -> watch::Receiver<u64> {
        self.passes.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the loop and wait for it to finish
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CyclicReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Readable parameters per multiplex group
fn read_groups(protocol: &NvProtocol) -> Vec<Vec<ParamId>> {
    let registry = protocol.registry().read();
    registry
        .muxes()
        .iter()
        .map(|mux| {
            mux.params
                .iter()
                .copied()
                .filter(|id| {
                    registry
                        .param(*id)
                        .map(|p| p.capabilities().readable)
                        .unwrap_or(false)
                })
                .collect::<Vec<_>>()
        })
        .filter(|group| !group.is_empty())
        .collect()
}

async fn run(
    protocol: NvProtocol,
    gate: PauseGate,
    delay: Duration,
    cancel: CancellationToken,
    passes: watch::Sender<u64>,
) {
    let ctx = RequestContext::cyclic(gate, cancel.clone());
    let metas: Vec<MetaEnum> = MetaEnum::READ_ORDER
        .into_iter()
        .filter(|m| protocol.metas().contains(m))
        .collect();
    let groups = read_groups(&protocol);

    loop {
        for &meta in &metas {
            for group in &groups {
                match protocol.read_multiple(&ctx, group, meta).await {
                    Ok(_) => {}
                    Err(NvError::Canceled) => {
                        debug!("Cyclic reader canceled");
                        return;
                    }
                    Err(e @ NvError::RequestTimeout { .. }) => {
                        debug!(%meta, error = %e, "Cyclic read timed out");
                        let mut registry = protocol.registry().write();
                        for id in group {
                            let _ = registry.mark_stale(*id, meta);
                        }
                    }
                    Err(e) if e.is_expected_in_background() => {
                        debug!(%meta, error = %e, "Cyclic read failed");
                    }
                    Err(e) => warn!(%meta, error = %e, "Cyclic read failed"),
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        if groups.is_empty() || metas.is_empty() {
            // nothing to poll; idle instead of spinning
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay.max(Duration::from_millis(100))) => {}
            }
        }
        passes.send_modify(|n| *n += 1);
    }
}
