//! NV request/response protocol
//!
//! A request is one set frame: the multiplexor selects the sub-frame, the
//! `ReadParam_command` flag chooses read or write and, on the extended
//! variant, `Meta` selects the slot. The device answers with a status frame
//! echoing the multiplexor, the meta and the flag as `ReadParam_status`,
//! plus the current contents of every signal in the sub-frame.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use epc_bus::CanBus;
use epc_conv::{pack_frame, unpack, CanFrame, CanMatrix, CodecError, Frame, SignalValues};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{DeviceConfig, ProtocolVariant};
use crate::error::{ConfigError, NvError, NvResult};
use crate::meta::MetaEnum;
use crate::pause::PauseGate;
use crate::registry::{ParamId, SharedRegistry};
use crate::scheduler::{Priority, RequestScheduler, SlotPermit};

/// Set-frame flag: 1 reads, 0 writes
pub const READ_COMMAND: &str = "ReadParam_command";
/// Status-frame echo of [`READ_COMMAND`]
pub const READ_STATUS: &str = "ReadParam_status";
pub const SAVE_COMMAND: &str = "SaveToEE_command";
pub const SAVE_STATUS: &str = "SaveToEE_status";

// =============================================================================
// Frames
// =============================================================================

/// The set/status frame pair and the names of their role signals
#[derive(Debug, Clone)]
pub struct ProtocolFrames {
    pub variant: ProtocolVariant,
    pub set: Frame,
    pub status: Frame,
    pub meta_signal: Option<String>,
    pub save_command: Option<String>,
    pub save_status: Option<String>,
}

fn has_signal(frame: &Frame, name: &str) -> bool {
    frame.common_signal(name).is_some() || frame.multiplexed.iter().any(|m| m.signal(name).is_some())
}

impl ProtocolFrames {
    /// Locate and check the frames of `variant` in the matrix
    pub fn from_matrix(matrix: &CanMatrix, variant: ProtocolVariant) -> Result<Self, ConfigError> {
        let find = |name: &str| {
            matrix
                .find_frame(name)
                .cloned()
                .ok_or_else(|| ConfigError::MissingFrame(name.to_string()))
        };
        let set = find(variant.set_frame())?;
        let status = find(variant.status_frame())?;

        for (frame, flag) in [(&set, READ_COMMAND), (&status, READ_STATUS)] {
            if !frame.is_multiplexed() {
                return Err(ConfigError::Invalid(format!(
                    "frame {} must be multiplexed",
                    frame.name
                )));
            }
            if !has_signal(frame, flag) {
                return Err(ConfigError::Invalid(format!(
                    "frame {} lacks the {} signal",
                    frame.name, flag
                )));
            }
        }

        let meta_signal = match variant.meta_signal() {
            Some(meta) if has_signal(&set, meta) && has_signal(&status, meta) => {
                Some(meta.to_string())
            }
            Some(meta) => {
                return Err(ConfigError::Invalid(format!(
                    "{} and {} must both carry the {} signal",
                    set.name, status.name, meta
                )))
            }
            None => None,
        };

        let save = has_signal(&set, SAVE_COMMAND) && has_signal(&status, SAVE_STATUS);
        Ok(Self {
            variant,
            meta_signal,
            save_command: save.then(|| SAVE_COMMAND.to_string()),
            save_status: save.then(|| SAVE_STATUS.to_string()),
            set,
            status,
        })
    }

    fn mux_signal<'a>(frame: &'a Frame) -> &'a str {
        frame.multiplexer.as_deref().unwrap_or("MUX")
    }

    fn in_layout(frame: &Frame, mux: u64, name: &str) -> bool {
        frame.signal(Some(mux), name).is_ok()
    }
}

// =============================================================================
// Request context
// =============================================================================

/// Per-call scheduling options
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub priority: Priority,
    pub cancel: CancellationToken,
    /// Checked before the request starts; background requests wait while paused
    pub gate: Option<PauseGate>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::user()
    }
}

impl RequestContext {
    /// Foreground request
    pub fn user() -> Self {
        Self {
            priority: Priority::User,
            cancel: CancellationToken::new(),
            gate: None,
        }
    }

    /// Background request that yields to pause tokens
    pub fn cyclic(gate: PauseGate, cancel: CancellationToken) -> Self {
        Self {
            priority: Priority::Cyclic,
            cancel,
            gate: Some(gate),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Echoed raw value and the `ReadParam_status` flag of the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Echo {
    pub raw: i64,
    pub read_flag: bool,
}

struct Request {
    mux_id: u64,
    mux_name: String,
    meta: MetaEnum,
    read: bool,
    params: SignalValues,
    expect: Vec<String>,
    status_flag: Option<String>,
}

// =============================================================================
// Protocol
// =============================================================================

struct Inner {
    bus: Arc<dyn CanBus>,
    registry: SharedRegistry,
    frames: ProtocolFrames,
    scheduler: RequestScheduler,
    metas: Vec<MetaEnum>,
    timeout: Duration,
    retries: u32,
    send_delay: Duration,
}

/// Request/response coordinator over a CAN bus
#[derive(Clone)]
pub struct NvProtocol {
    inner: Arc<Inner>,
}

impl NvProtocol {
    pub fn new(
        bus: Arc<dyn CanBus>,
        registry: SharedRegistry,
        frames: ProtocolFrames,
        config: &DeviceConfig,
    ) -> Self {
        let metas = match frames.variant {
            ProtocolVariant::Legacy => vec![MetaEnum::Value],
            ProtocolVariant::Extended => config.metas.clone(),
        };
        Self {
            inner: Arc::new(Inner {
                bus,
                registry,
                frames,
                scheduler: RequestScheduler::new(),
                metas,
                timeout: config.request_timeout,
                retries: config.request_retries,
                send_delay: config.send_delay,
            }),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    pub fn bus(&self) -> &Arc<dyn CanBus> {
        &self.inner.bus
    }

    pub fn frames(&self) -> &ProtocolFrames {
        &self.inner.frames
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.inner.scheduler
    }

    /// Metas the device answers for
    pub fn metas(&self) -> &[MetaEnum] {
        &self.inner.metas
    }

    fn check_meta(&self, meta: MetaEnum) -> NvResult<()> {
        if self.inner.metas.contains(&meta) {
            Ok(())
        } else {
            Err(NvError::UnsupportedMeta(meta))
        }
    }

    /// Read one slot from the device
    pub async fn read(&self, ctx: &RequestContext, id: ParamId, meta: MetaEnum) -> NvResult<Echo> {
        self.check_meta(meta)?;
        let (request, members) = self.read_request(&[id], meta)?;
        let values = self.transact(ctx, &request).await?;
        let applied = self.apply(&members, meta, &values)?;
        Ok(Echo {
            raw: applied.get(&id).copied().unwrap_or_default(),
            read_flag: self.read_flag(&values),
        })
    }

    /// Read one slot of several parameters, one request per multiplex id
    pub async fn read_multiple(
        &self,
        ctx: &RequestContext,
        ids: &[ParamId],
        meta: MetaEnum,
    ) -> NvResult<BTreeMap<ParamId, i64>> {
        self.check_meta(meta)?;
        let groups = self.inner.registry.read().group_by_mux(ids)?;

        let mut out = BTreeMap::new();
        for members in groups.values() {
            let (request, members) = self.read_request(members, meta)?;
            let values = self.transact(ctx, &request).await?;
            out.extend(self.apply(&members, meta, &values)?);
        }
        Ok(out)
    }

    /// Write one slot and return the device's echo
    pub async fn write(
        &self,
        ctx: &RequestContext,
        id: ParamId,
        raw: i64,
        meta: MetaEnum,
    ) -> NvResult<Echo> {
        self.check_meta(meta)?;
        let values = BTreeMap::from([(id, raw)]);
        let (echo, read_flag) = self.write_group(ctx, &values, meta, &BTreeMap::new()).await?;
        Ok(Echo {
            raw: echo.get(&id).copied().unwrap_or_default(),
            read_flag,
        })
    }

    /// Write one slot of several parameters, one request per multiplex id
    ///
    /// Sub-frame siblings that are not written are sent with their cached
    /// value; unknown siblings are read first so the device never receives
    /// placeholder zeros for them. A sibling that is unknown and cannot be
    /// read fails the request before anything is sent.
    pub async fn write_multiple(
        &self,
        ctx: &RequestContext,
        values: &BTreeMap<ParamId, i64>,
        meta: MetaEnum,
    ) -> NvResult<BTreeMap<ParamId, i64>> {
        self.write_multiple_with(ctx, values, meta, &BTreeMap::new()).await
    }

    /// [`write_multiple`](Self::write_multiple) with sibling values that
    /// take precedence over the cache without being written themselves
    pub async fn write_multiple_with(
        &self,
        ctx: &RequestContext,
        values: &BTreeMap<ParamId, i64>,
        meta: MetaEnum,
        carry: &BTreeMap<ParamId, i64>,
    ) -> NvResult<BTreeMap<ParamId, i64>> {
        self.check_meta(meta)?;
        let ids: Vec<ParamId> = values.keys().copied().collect();
        let groups = self.inner.registry.read().group_by_mux(&ids)?;

        let mut out = BTreeMap::new();
        for members in groups.values() {
            let group: BTreeMap<ParamId, i64> =
                members.iter().map(|id| (*id, values[id])).collect();
            let (echo, _) = self.write_group(ctx, &group, meta, carry).await?;
            out.extend(echo);
        }
        Ok(out)
    }

    /// Ask the device to persist its parameters to non-volatile memory
    pub async fn save_to_nv(&self, ctx: &RequestContext) -> NvResult<()> {
        let frames = &self.inner.frames;
        let (Some(command), Some(status)) = (&frames.save_command, &frames.save_status) else {
            return Err(NvError::NotFound(SAVE_COMMAND.to_string()));
        };
        let sub = frames
            .set
            .multiplexed
            .iter()
            .find(|m| ProtocolFrames::in_layout(&frames.set, m.id, command))
            .ok_or_else(|| NvError::NotFound(SAVE_COMMAND.to_string()))?;

        let request = Request {
            mux_id: sub.id,
            mux_name: sub.name.clone(),
            meta: MetaEnum::Value,
            read: true,
            params: SignalValues::from([(command.clone(), 1)]),
            expect: Vec::new(),
            status_flag: Some(status.clone()),
        };
        self.transact(ctx, &request).await?;
        info!("Parameters saved to non-volatile memory");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Request building
    // -------------------------------------------------------------------------

    fn read_request(
        &self,
        ids: &[ParamId],
        meta: MetaEnum,
    ) -> NvResult<(Request, Vec<(ParamId, String)>)> {
        let registry = self.inner.registry.read();
        let mut members = Vec::with_capacity(ids.len());
        let mut mux = None;
        for &id in ids {
            let param = registry.param(id)?;
            mux.get_or_insert((param.mux_id(), param.mux_name().to_string()));
            members.push((id, param.name().to_string()));
        }
        let (mux_id, mux_name) = mux.ok_or_else(|| NvError::NotFound("empty request".to_string()))?;
        let request = Request {
            mux_id,
            mux_name,
            meta,
            read: true,
            params: SignalValues::new(),
            expect: members.iter().map(|(_, n)| n.clone()).collect(),
            status_flag: None,
        };
        Ok((request, members))
    }

    async fn write_group(
        &self,
        ctx: &RequestContext,
        values: &BTreeMap<ParamId, i64>,
        meta: MetaEnum,
        carry: &BTreeMap<ParamId, i64>,
    ) -> NvResult<(BTreeMap<ParamId, i64>, bool)> {
        // Fill in unknown siblings before composing the frame
        let unknown: Vec<ParamId> = {
            let registry = self.inner.registry.read();
            let Some(first) = values.keys().next() else {
                return Ok((BTreeMap::new(), false));
            };
            let mux_id = registry.param(*first)?.mux_id();
            registry
                .mux(mux_id)
                .map(|m| m.params.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|id| !values.contains_key(id) && !carry.contains_key(id))
                .filter(|id| {
                    registry
                        .param(*id)
                        .map(|p| p.get(meta).is_none() && p.capabilities().readable)
                        .unwrap_or(false)
                })
                .collect()
        };
        if !unknown.is_empty() {
            debug!(count = unknown.len(), %meta, "Reading unknown siblings before write");
            self.read_multiple(ctx, &unknown, meta).await?;
        }

        let (request, members) = {
            let registry = self.inner.registry.read();
            let mut members = Vec::with_capacity(values.len());
            let mut params = SignalValues::new();
            let mut mux = None;
            for (&id, &raw) in values {
                let param = registry.param(id)?;
                param.signal().check_width(raw)?;
                mux.get_or_insert((param.mux_id(), param.mux_name().to_string()));
                params.insert(param.name().to_string(), raw);
                members.push((id, param.name().to_string()));
            }
            let (mux_id, mux_name) =
                mux.ok_or_else(|| NvError::NotFound("empty request".to_string()))?;
            for sibling in registry.mux(mux_id).map(|m| m.params.as_slice()).unwrap_or_default() {
                if values.contains_key(sibling) {
                    continue;
                }
                let param = registry.param(*sibling)?;
                let raw = carry
                    .get(sibling)
                    .copied()
                    .or_else(|| param.get(meta))
                    .ok_or_else(|| NvError::UnknownSibling {
                        mux: mux_name.clone(),
                        name: param.name().to_string(),
                    })?;
                params.insert(param.name().to_string(), raw);
            }
            let request = Request {
                mux_id,
                mux_name,
                meta,
                read: false,
                params,
                expect: members.iter().map(|(_, n)| n.clone()).collect(),
                status_flag: None,
            };
            (request, members)
        };

        let values = self.transact(ctx, &request).await?;
        let echo = self.apply(&members, meta, &values)?;
        Ok((echo, self.read_flag(&values)))
    }

    fn build_frame(&self, request: &Request) -> NvResult<CanFrame> {
        let set = &self.inner.frames.set;
        let mut values = request.params.clone();
        values.insert(
            ProtocolFrames::mux_signal(set).to_string(),
            request.mux_id as i64,
        );
        if ProtocolFrames::in_layout(set, request.mux_id, READ_COMMAND) {
            values.insert(READ_COMMAND.to_string(), request.read as i64);
        }
        if let Some(meta) = &self.inner.frames.meta_signal {
            values.insert(meta.clone(), request.meta.tag());
        }
        Ok(pack_frame(set, &values)?)
    }

    fn read_flag(&self, values: &SignalValues) -> bool {
        values.get(READ_STATUS).copied() == Some(1)
    }

    fn apply(
        &self,
        members: &[(ParamId, String)],
        meta: MetaEnum,
        values: &SignalValues,
    ) -> NvResult<BTreeMap<ParamId, i64>> {
        let mut registry = self.inner.registry.write();
        let mut out = BTreeMap::new();
        for (id, name) in members {
            if let Some(&raw) = values.get(name) {
                // Secrets are echoed to the caller but never kept
                if !registry.param(*id)?.flags().secret {
                    registry.apply_device_value(*id, meta, raw)?;
                }
                out.insert(*id, raw);
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Exchange
    // -------------------------------------------------------------------------

    async fn transact(&self, ctx: &RequestContext, request: &Request) -> NvResult<SignalValues> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transact_once(ctx, request).await {
                Ok(values) => return Ok(values),
                Err(e) if e.is_retryable() && attempt <= self.inner.retries => {
                    warn!(
                        mux = %request.mux_name,
                        meta = %request.meta,
                        attempt,
                        error = %e,
                        "NV request failed, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn acquire(&self, ctx: &RequestContext, request: &Request) -> NvResult<SlotPermit> {
        let key = (request.mux_id, request.meta);
        loop {
            if let Some(gate) = &ctx.gate {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(NvError::Canceled),
                    _ = gate.wait_resumed() => {}
                }
            }
            let permit = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(NvError::Canceled),
                permit = self.inner.scheduler.acquire(key, ctx.priority) => permit,
            };
            // A token taken while queued still holds off background requests
            match &ctx.gate {
                Some(gate) if gate.is_paused() => drop(permit),
                _ => return Ok(permit),
            }
        }
    }

    async fn transact_once(&self, ctx: &RequestContext, request: &Request) -> NvResult<SignalValues> {
        let frame = self.build_frame(request)?;
        let _permit = loop {
            let permit = self.acquire(ctx, request).await?;
            if !self.inner.send_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(NvError::Canceled),
                    _ = tokio::time::sleep(self.inner.send_delay) => {}
                }
            }
            // No background frame leaves once a token is taken, even mid-delay
            match &ctx.gate {
                Some(gate) if gate.is_paused() => drop(permit),
                _ => break permit,
            }
        };

        // Subscribe before sending so the response cannot slip past
        let mut rx = self.inner.bus.subscribe();
        debug!(
            mux = %request.mux_name,
            meta = %request.meta,
            read = request.read,
            %frame,
            "Sending NV request"
        );
        self.inner.bus.send(&frame).await?;

        let deadline = Instant::now() + self.inner.timeout;
        loop {
            let received = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(NvError::Canceled),
                received = tokio::time::timeout_at(deadline, rx.recv()) => received,
            };
            match received {
                Err(_) => {
                    return Err(NvError::RequestTimeout {
                        mux: request.mux_name.clone(),
                        meta: request.meta,
                    })
                }
                Ok(Ok(frame)) => {
                    if let Some(values) = self.match_response(&frame, request)? {
                        return Ok(values);
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "NV response receiver lagged");
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(NvError::SendFailed(epc_bus::BusError::ConnectionFailed(
                        "receive channel closed".to_string(),
                    )))
                }
            }
        }
    }

    /// `Some(values)` if `frame` answers `request`
    fn match_response(&self, frame: &CanFrame, request: &Request) -> NvResult<Option<SignalValues>> {
        let status = &self.inner.frames.status;
        if !frame.matches(status.id, status.extended) {
            return Ok(None);
        }
        let values = match unpack(status, &frame.data) {
            Ok(values) => values,
            Err(CodecError::UnknownMultiplex { value, .. }) => {
                warn!(value, "Status frame with unknown multiplex value ignored");
                return Ok(None);
            }
            Err(e) => {
                debug!(error = %e, "Undecodable status frame ignored");
                return Ok(None);
            }
        };

        let expect = |name: &str, wanted: i64| values.get(name).copied() == Some(wanted);
        if !expect(ProtocolFrames::mux_signal(status), request.mux_id as i64) {
            return Ok(None);
        }
        if let Some(meta) = &self.inner.frames.meta_signal {
            if !expect(meta, request.meta.tag()) {
                return Ok(None);
            }
        }
        if !expect(READ_STATUS, request.read as i64) {
            trace!(mux = %request.mux_name, "Response with the other read flag ignored");
            return Ok(None);
        }
        if let Some(flag) = &request.status_flag {
            if !expect(flag, 1) {
                return Ok(None);
            }
        }

        let missing: Vec<String> = request
            .expect
            .iter()
            .filter(|name| !values.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(NvError::PartialResponse {
                mux: request.mux_name.clone(),
                missing,
            });
        }
        debug!(mux = %request.mux_name, meta = %request.meta, "NV response matched");
        Ok(Some(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use epc_bus::MockBus;
    use epc_conv::{Signal, SubFrame};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn frames(extended: bool) -> (Frame, Frame) {
        let sub_frames = |read_flag: &str| {
            vec![
                SubFrame::new(
                    3,
                    "Frequency",
                    vec![
                        Signal::new(read_flag, 8, 1),
                        Signal::new("FrequencyReference", 16, 16).with_scaling("0.1", "0"),
                        Signal::new("FrequencyLimit", 32, 16),
                    ],
                ),
                SubFrame::new(12, "Modulation", vec![Signal::new(read_flag, 8, 1), Signal::new("OvermodulationLimit", 16, 16)]),
            ]
        };
        let build = |name: &str, id: u32, flag: &str| {
            let mut frame = Frame::new(name, id, true).with_multiplexer(Signal::new("MUX", 0, 8));
            if extended {
                frame = frame.with_signal(Signal::new("Meta", 9, 3));
            }
            for sub in sub_frames(flag) {
                frame = frame.with_sub_frame(sub);
            }
            frame
        };
        if extended {
            (
                build("ParameterQuery", 0x1FF00, READ_COMMAND),
                build("ParameterResponse", 0x1FF01, READ_STATUS),
            )
        } else {
            (
                build("CommandSetNVParam", 0x1FF00, READ_COMMAND),
                build("StatusNVParam", 0x1FF01, READ_STATUS),
            )
        }
    }

    struct Fixture {
        bus: Arc<MockBus>,
        protocol: NvProtocol,
        status: Frame,
    }

    fn fixture(variant: ProtocolVariant) -> Fixture {
        fixture_with_retries(variant, 2)
    }

    fn fixture_with_retries(variant: ProtocolVariant, retries: u32) -> Fixture {
        let (set, status) = frames(variant == ProtocolVariant::Extended);
        let matrix = CanMatrix::from_frames(Default::default(), vec![set, status.clone()]).unwrap();
        let mut config = DeviceConfig::new(variant);
        config.request_retries = retries;
        let registry = Registry::from_matrix(&matrix, &config).unwrap().into_shared();
        let frames = ProtocolFrames::from_matrix(&matrix, variant).unwrap();
        let bus = MockBus::shared();
        let protocol = NvProtocol::new(bus.clone(), registry, frames, &config);
        Fixture {
            bus,
            protocol,
            status,
        }
    }

    /// Device that keeps one raw value per (signal, meta) and echoes requests
    fn install_device(fx: &Fixture, set: Frame, store: Arc<Mutex<BTreeMap<(String, i64), i64>>>) {
        let status = fx.status.clone();
        let has_meta = status.common_signal("Meta").is_some();
        fx.bus.set_responder(move |frame| {
            let Ok(request) = unpack(&set, &frame.data) else {
                return vec![];
            };
            let mux = request["MUX"];
            let meta = request.get("Meta").copied().unwrap_or(0);
            let read = request[READ_COMMAND];
            let mut store = store.lock();
            let mut reply = SignalValues::from([("MUX".to_string(), mux), (READ_STATUS.to_string(), read)]);
            if has_meta {
                reply.insert("Meta".to_string(), meta);
            }
            for (name, raw) in &request {
                if ["MUX", "Meta", READ_COMMAND].contains(&name.as_str()) {
                    continue;
                }
                if read == 0 {
                    store.insert((name.clone(), meta), *raw);
                }
                reply.insert(name.clone(), store.get(&(name.clone(), meta)).copied().unwrap_or(0));
            }
            vec![pack_frame(&status, &reply).unwrap()]
        });
    }

    fn lookup(fx: &Fixture, name: &str) -> ParamId {
        fx.protocol.registry().read().lookup_name(name).unwrap()
    }

    #[tokio::test]
    async fn test_read_extended() {
        let fx = fixture(ProtocolVariant::Extended);
        let store = Arc::new(Mutex::new(BTreeMap::from([(("FrequencyReference".to_string(), 0), 0x0258)])));
        install_device(&fx, fx.protocol.frames().set.clone(), store);

        let id = lookup(&fx, "FrequencyReference");
        let echo = fx
            .protocol
            .read(&RequestContext::user(), id, MetaEnum::Value)
            .await
            .unwrap();
        assert_eq!(echo, Echo { raw: 600, read_flag: true });

        let sent = fx.bus.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data[0], 3);
        assert_eq!(sent[0].data[1] & 0x01, 1);

        let registry = fx.protocol.registry().read();
        let param = registry.param(id).unwrap();
        assert_eq!(param.current_value(), Some(600));
        assert!(!param.is_stale(MetaEnum::Value));
        assert_eq!(param.format(MetaEnum::Value), "60.0");
    }

    #[tokio::test]
    async fn test_write_legacy_echo() {
        let fx = fixture(ProtocolVariant::Legacy);
        let store = Arc::new(Mutex::new(BTreeMap::new()));
        install_device(&fx, fx.protocol.frames().set.clone(), store);

        let id = lookup(&fx, "OvermodulationLimit");
        let echo = fx
            .protocol
            .write(&RequestContext::user(), id, 950, MetaEnum::Value)
            .await
            .unwrap();
        assert_eq!(echo.raw, 950);
        assert!(!echo.read_flag);

        let sent = fx.bus.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].data[..4], &[12, 0, 0xB6, 0x03]);
        assert_eq!(
            fx.protocol.registry().read().get_meta(id, MetaEnum::Value).unwrap(),
            Some(950)
        );
    }

    #[tokio::test]
    async fn test_legacy_rejects_other_metas() {
        let fx = fixture(ProtocolVariant::Legacy);
        let id = lookup(&fx, "OvermodulationLimit");
        let err = fx
            .protocol
            .read(&RequestContext::user(), id, MetaEnum::Maximum)
            .await
            .unwrap_err();
        assert!(matches!(err, NvError::UnsupportedMeta(MetaEnum::Maximum)));
        assert_eq!(fx.bus.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_write_reads_unknown_siblings_first() {
        let fx = fixture(ProtocolVariant::Extended);
        let store = Arc::new(Mutex::new(BTreeMap::from([(("FrequencyLimit".to_string(), 0), 777)])));
        install_device(&fx, fx.protocol.frames().set.clone(), store.clone());

        let id = lookup(&fx, "FrequencyReference");
        fx.protocol
            .write(&RequestContext::user(), id, 500, MetaEnum::Value)
            .await
            .unwrap();

        let sent = fx.bus.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data[1] & 0x01, 1, "sibling read comes first");
        // The sibling keeps its device value
        assert_eq!(store.lock()[&("FrequencyLimit".to_string(), 0)], 777);
        assert_eq!(store.lock()[&("FrequencyReference".to_string(), 0)], 500);
    }

    #[tokio::test]
    async fn test_read_multiple_groups_by_mux() {
        let fx = fixture(ProtocolVariant::Extended);
        install_device(&fx, fx.protocol.frames().set.clone(), Arc::new(Mutex::new(BTreeMap::new())));

        let ids = vec![
            lookup(&fx, "FrequencyReference"),
            lookup(&fx, "OvermodulationLimit"),
            lookup(&fx, "FrequencyLimit"),
        ];
        let values = fx
            .protocol
            .read_multiple(&RequestContext::user(), &ids, MetaEnum::Minimum)
            .await
            .unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(fx.bus.sent_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_then_fails() {
        let fx = fixture(ProtocolVariant::Extended);
        let id = lookup(&fx, "FrequencyReference");
        let err = fx
            .protocol
            .read(&RequestContext::user(), id, MetaEnum::Value)
            .await
            .unwrap_err();
        assert!(matches!(err, NvError::RequestTimeout { .. }));
        // first attempt plus two retries
        assert_eq!(fx.bus.sent_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_does_not_resolve() {
        let fx = fixture_with_retries(ProtocolVariant::Extended, 0);
        install_device(&fx, fx.protocol.frames().set.clone(), Arc::new(Mutex::new(BTreeMap::new())));
        fx.bus.set_reply_delay(Duration::from_millis(501));

        let id = lookup(&fx, "FrequencyReference");
        let err = fx
            .protocol
            .read(&RequestContext::user(), id, MetaEnum::Value)
            .await
            .unwrap_err();
        assert!(matches!(err, NvError::RequestTimeout { .. }));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let registry = fx.protocol.registry().read();
        assert_eq!(registry.get_meta(id, MetaEnum::Value).unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_failure_retried() {
        let fx = fixture(ProtocolVariant::Extended);
        install_device(&fx, fx.protocol.frames().set.clone(), Arc::new(Mutex::new(BTreeMap::new())));
        fx.bus.fail_next_sends(2);

        let id = lookup(&fx, "FrequencyReference");
        fx.protocol
            .read(&RequestContext::user(), id, MetaEnum::Value)
            .await
            .unwrap();
        assert_eq!(fx.bus.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_response() {
        let fx = fixture(ProtocolVariant::Extended);
        let store = BTreeMap::from([(("FrequencyReference".to_string(), 0), 42)]);
        install_device(&fx, fx.protocol.frames().set.clone(), Arc::new(Mutex::new(store)));
        fx.bus.set_reply_delay(Duration::from_millis(100));

        let cancel = CancellationToken::new();
        let ctx = RequestContext::user().with_cancel(cancel.clone());
        let id = lookup(&fx, "FrequencyReference");

        let protocol = fx.protocol.clone();
        let task = tokio::spawn(async move { protocol.read(&ctx, id, MetaEnum::Value).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert!(matches!(task.await.unwrap(), Err(NvError::Canceled)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            fx.protocol.registry().read().get_meta(id, MetaEnum::Value).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_wrong_flag_ignored_then_matched() {
        let fx = fixture(ProtocolVariant::Extended);
        let status = fx.status.clone();
        fx.bus.set_responder(move |_| {
            let reply = |read: i64, value: i64| {
                pack_frame(
                    &status,
                    &SignalValues::from([
                        ("MUX".to_string(), 3),
                        ("Meta".to_string(), 0),
                        (READ_STATUS.to_string(), read),
                        ("FrequencyReference".to_string(), value),
                        ("FrequencyLimit".to_string(), 0),
                    ]),
                )
                .unwrap()
            };
            vec![reply(0, 1), reply(1, 2)]
        });

        let id = lookup(&fx, "FrequencyReference");
        let echo = fx
            .protocol
            .read(&RequestContext::user(), id, MetaEnum::Value)
            .await
            .unwrap();
        assert_eq!(echo.raw, 2);
    }

    #[tokio::test]
    async fn test_partial_response() {
        let fx = fixture(ProtocolVariant::Extended);
        fx.bus.set_responder(|_| {
            // Echo truncated before the parameter payload
            vec![CanFrame::new(0x1FF01, true, vec![3, 0x01])]
        });

        let id = lookup(&fx, "FrequencyReference");
        let err = fx
            .protocol
            .read(&RequestContext::user(), id, MetaEnum::Value)
            .await
            .unwrap_err();
        match err {
            NvError::PartialResponse { missing, .. } => {
                assert_eq!(missing, vec!["FrequencyReference".to_string()])
            }
            other => panic!("unexpected {other:?}"),
        }
        // no partial commit
        assert_eq!(fx.protocol.registry().read().get_meta(id, MetaEnum::Value).unwrap(), None);
    }
}
