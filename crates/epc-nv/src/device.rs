//! Device facade
//!
//! [`NvDevice`] wires manifest, matrix, registry, protocol, transactions and
//! the cyclic reader together for one device on one bus.

use std::path::Path;
use std::sync::Arc;

use epc_bus::{BusStatus, CanBus};
use epc_conv::CanMatrix;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{DeviceConfig, DeviceManifest};
use crate::cyclic::CyclicReader;
use crate::error::{NvError, NvResult};
use crate::meta::MetaEnum;
use crate::pause::{PauseGate, PauseToken};
use crate::protocol::{Echo, NvProtocol, ProtocolFrames, RequestContext};
use crate::registry::{ParamId, Registry, SharedRegistry};
use crate::transaction::{CommitReport, TransactionManager};

/// Everything a manifest describes, without a bus
pub struct DeviceModel {
    pub manifest: DeviceManifest,
    pub config: DeviceConfig,
    pub matrix: CanMatrix,
    pub registry: Registry,
}

impl DeviceModel {
    /// Load manifest, matrix and defaults; apply addressing
    pub fn load(manifest_path: impl AsRef<Path>) -> NvResult<Self> {
        let manifest = DeviceManifest::from_file(manifest_path.as_ref())?;
        Self::from_manifest(manifest)
    }

    pub fn from_manifest(manifest: DeviceManifest) -> NvResult<Self> {
        let config = DeviceConfig::from_manifest(&manifest)?;
        let mut matrix = manifest.load_matrix()?;
        config.apply_addressing(&mut matrix)?;

        let mut registry = Registry::from_matrix(&matrix, &config)?;
        if let Some(defaults) = manifest.load_defaults()? {
            let applied = registry.apply_defaults(&defaults)?;
            info!(applied, "Applied parameter defaults");
        }
        Ok(Self {
            manifest,
            config,
            matrix,
            registry,
        })
    }
}

/// One NV device on a CAN bus
pub struct NvDevice {
    manifest: DeviceManifest,
    config: DeviceConfig,
    matrix: CanMatrix,
    protocol: NvProtocol,
    transactions: TransactionManager,
    gate: PauseGate,
    cyclic: Mutex<Option<CyclicReader>>,
    status_task: JoinHandle<()>,
}

impl NvDevice {
    /// Open the device described by a manifest file
    ///
    /// Must be called within a Tokio runtime.
    pub fn open(manifest_path: impl AsRef<Path>, bus: Arc<dyn CanBus>) -> NvResult<Self> {
        Self::from_model(DeviceModel::load(manifest_path)?, bus)
    }

    pub fn from_model(model: DeviceModel, bus: Arc<dyn CanBus>) -> NvResult<Self> {
        let DeviceModel {
            manifest,
            config,
            matrix,
            registry,
        } = model;
        let frames = ProtocolFrames::from_matrix(&matrix, config.variant)?;
        let registry = registry.into_shared();
        let status_task = spawn_status_watch(bus.as_ref(), registry.clone());
        let protocol = NvProtocol::new(bus, registry, frames, &config);
        let transactions = TransactionManager::new(protocol.clone(), config.enforce_range);

        info!(
            variant = ?config.variant,
            parameters = protocol.registry().read().len(),
            "NV device opened"
        );
        Ok(Self {
            manifest,
            config,
            matrix,
            protocol,
            transactions,
            gate: PauseGate::new(),
            cyclic: Mutex::new(None),
            status_task,
        })
    }

    pub fn manifest(&self) -> &DeviceManifest {
        &self.manifest
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn matrix(&self) -> &CanMatrix {
        &self.matrix
    }

    pub fn registry(&self) -> &SharedRegistry {
        self.protocol.registry()
    }

    pub fn protocol(&self) -> &NvProtocol {
        &self.protocol
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Resolve a parameter by name or `;`-separated path
    pub fn lookup(&self, name: &str) -> NvResult<ParamId> {
        self.registry().read().lookup_path(name)
    }

    pub async fn read(&self, name: &str, meta: MetaEnum) -> NvResult<Echo> {
        let id = self.lookup(name)?;
        self.protocol.read(&RequestContext::user(), id, meta).await
    }

    /// Write one slot through a single-edit transaction
    pub async fn write(&self, name: &str, meta: MetaEnum, raw: i64) -> NvResult<CommitReport> {
        let id = self.lookup(name)?;
        self.transactions.begin()?;
        if let Err(e) = self.transactions.stage(id, meta, raw) {
            self.transactions.abort();
            return Err(e);
        }
        self.transactions.commit(&RequestContext::user()).await
    }

    /// Change the access level; the password goes out in the same commit
    pub async fn set_access_level(&self, level: i64, password: i64) -> NvResult<CommitReport> {
        let (level_id, password_id) = {
            let registry = self.registry().read();
            let level_id = registry
                .access_level_param()
                .ok_or_else(|| NvError::NotFound("access level parameter".to_string()))?;
            let password_id = registry
                .access_password_param()
                .ok_or_else(|| NvError::NotFound("access password parameter".to_string()))?;
            (level_id, password_id)
        };

        self.transactions.begin()?;
        let staged = self
            .transactions
            .stage(password_id, MetaEnum::Value, password)
            .and_then(|_| self.transactions.stage(level_id, MetaEnum::Value, level));
        if let Err(e) = staged {
            self.transactions.abort();
            return Err(e);
        }
        self.transactions.commit(&RequestContext::user()).await
    }

    pub async fn save_to_nv(&self) -> NvResult<()> {
        self.protocol.save_to_nv(&RequestContext::user()).await
    }

    /// Start background polling; a running reader is kept
    pub fn start_cyclic(&self) {
        let mut cyclic = self.cyclic.lock();
        if cyclic.as_ref().is_some_and(CyclicReader::is_running) {
            return;
        }
        *cyclic = Some(CyclicReader::spawn(
            self.protocol.clone(),
            self.gate.clone(),
            self.config.cyclic_delay,
        ));
    }

    pub async fn stop_cyclic(&self) {
        let reader = self.cyclic.lock().take();
        if let Some(reader) = reader {
            reader.stop().await;
        }
    }

    /// Hold off background polling while the token lives
    pub fn pause(&self) -> PauseToken {
        self.gate.pause()
    }

    /// Completed cyclic passes, if the reader runs
    pub fn cyclic_passes(&self) -> Option<tokio::sync::watch::Receiver<u64>> {
        self.cyclic.lock().as_ref().map(CyclicReader::passes)
    }
}

impl Drop for NvDevice {
    fn drop(&mut self) {
        self.status_task.abort();
    }
}

/// Mark every parameter stale when the bus goes offline
fn spawn_status_watch(bus: &dyn CanBus, registry: SharedRegistry) -> JoinHandle<()> {
    let mut status = bus.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            if current == BusStatus::Offline {
                warn!("Bus offline, marking parameters stale");
                registry.write().mark_all_stale();
            } else {
                info!("Bus online");
            }
        }
    })
}
