//! Simulated NV parameter responder
//!
//! Plays the device side of the set/status exchange: writes (`read = 0`)
//! store the carried values and echo them, reads (`read = 1`) answer with
//! the stored values of every signal in the requested sub-frame. A save
//! request answers with `SaveToEE_status = 1`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use epc_bus::{CanBus, CanFrame, MockBus};
use epc_conv::{pack_frame, unpack, Frame, SignalValues};
use epc_nv::protocol::{READ_COMMAND, READ_STATUS, SAVE_COMMAND, SAVE_STATUS};
use epc_nv::{MetaEnum, ProtocolFrames};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct NvState {
    /// `(signal, meta tag)` → raw
    memory: BTreeMap<(String, i64), i64>,
    requests: usize,
    dropped: BTreeSet<usize>,
    read_only: BTreeSet<String>,
    saves: usize,
}

/// NV device simulator for one set/status frame pair
#[derive(Clone)]
pub struct NvSimulator {
    set: Arc<Frame>,
    status: Arc<Frame>,
    meta_signal: Option<String>,
    state: Arc<Mutex<NvState>>,
}

impl NvSimulator {
    /// Simulator for the given set and status frames
    ///
    /// The meta selector is used when both frames carry a `Meta` signal.
    pub fn new(set: Frame, status: Frame) -> Self {
        let meta_signal = (set.common_signal("Meta").is_some()
            && status.common_signal("Meta").is_some())
        .then(|| "Meta".to_string());
        Self {
            set: Arc::new(set),
            status: Arc::new(status),
            meta_signal,
            state: Arc::default(),
        }
    }

    pub fn from_frames(frames: &ProtocolFrames) -> Self {
        let mut sim = Self::new(frames.set.clone(), frames.status.clone());
        sim.meta_signal = frames.meta_signal.clone();
        sim
    }

    /// Answer every frame sent on `bus`
    pub fn attach(&self, bus: &MockBus) {
        let sim = self.clone();
        bus.set_responder(move |frame| sim.handle(frame));
    }

    /// Answer requests from a live bus until `cancel` fires
    pub async fn serve(self, bus: Arc<dyn CanBus>, cancel: CancellationToken) {
        let mut rx = bus.subscribe();
        info!(
            set = %self.set.name,
            status = %self.status.name,
            "NV simulator serving"
        );
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(frame) => frame,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "NV simulator lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            for reply in self.handle(&frame) {
                if let Err(e) = bus.send(&reply).await {
                    warn!(error = %e, "NV simulator reply failed");
                }
            }
        }
        info!("NV simulator stopped");
    }

    /// Replies to one received frame
    pub fn handle(&self, frame: &CanFrame) -> Vec<CanFrame> {
        if !frame.matches(self.set.id, self.set.extended) {
            return Vec::new();
        }
        let mut values = match unpack(&self.set, &frame.data) {
            Ok(values) => values,
            Err(e) => {
                debug!(error = %e, "Undecodable NV request ignored");
                return Vec::new();
            }
        };

        let mut state = self.state.lock();
        let index = state.requests;
        state.requests += 1;
        if state.dropped.remove(&index) {
            debug!(index, "Dropping NV request");
            return Vec::new();
        }

        let read = values.remove(READ_COMMAND).unwrap_or(1);
        let meta = self
            .meta_signal
            .as_ref()
            .and_then(|m| values.get(m).copied())
            .unwrap_or(MetaEnum::Value.tag());
        let save = values.remove(SAVE_COMMAND) == Some(1);
        let mux_signal = self.set.multiplexer.as_deref().unwrap_or("MUX");

        let mut reply = SignalValues::new();
        for (name, raw) in values {
            if name == mux_signal || Some(&name) == self.meta_signal.as_ref() {
                reply.insert(name, raw);
                continue;
            }
            let key = (name.clone(), meta);
            let stored = if read == 0 && !state.read_only.contains(&name) {
                state.memory.insert(key, raw);
                raw
            } else {
                state.memory.get(&key).copied().unwrap_or(0)
            };
            reply.insert(name, stored);
        }
        reply.insert(READ_STATUS.to_string(), read);
        if save {
            state.saves += 1;
            reply.insert(SAVE_STATUS.to_string(), 1);
            info!(saves = state.saves, "Parameters saved");
        }

        // only signals the status layout knows are sent back
        let mux = reply.get(mux_signal).copied().unwrap_or(0) as u64;
        let layout: BTreeSet<String> = match self.status.layout(Some(mux)) {
            Ok(layout) => layout.into_iter().map(|s| s.name.clone()).collect(),
            Err(e) => {
                warn!(mux, error = %e, "No status layout for request");
                return Vec::new();
            }
        };
        reply.retain(|name, _| layout.contains(name));

        match pack_frame(&self.status, &reply) {
            Ok(frame) => vec![frame],
            Err(e) => {
                warn!(error = %e, "Failed to pack NV status");
                Vec::new()
            }
        }
    }

    /// Preload a slot
    pub fn set_value(&self, signal: &str, meta: MetaEnum, raw: i64) {
        self.state
            .lock()
            .memory
            .insert((signal.to_string(), meta.tag()), raw);
    }

    pub fn value(&self, signal: &str, meta: MetaEnum) -> Option<i64> {
        self.state
            .lock()
            .memory
            .get(&(signal.to_string(), meta.tag()))
            .copied()
    }

    /// Leave the request with this 0-based index unanswered
    pub fn drop_request(&self, index: usize) {
        self.state.lock().dropped.insert(index);
    }

    /// Ignore writes to `signal`; its echo carries the stored value
    pub fn set_read_only(&self, signal: &str) {
        self.state.lock().read_only.insert(signal.to_string());
    }

    /// Requests received so far, dropped ones included
    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    pub fn saves(&self) -> usize {
        self.state.lock().saves
    }
}
