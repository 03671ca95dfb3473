//! CCP client for bulk memory upload
//!
//! Every command is one 8-byte frame on the command id:
//! `[command, counter, parameters...]`. The device answers on the response
//! id with a command return message `[0xFF, status, counter, data...]`.
//! Only the commands needed to read a memory block are implemented.

use std::sync::Arc;
use std::time::Duration;

use epc_bus::{CanBus, CanFrame};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cache::{Chunk, MemoryCache};
use crate::error::{CcpError, CcpResult};
use crate::progress::{EtaEstimator, UploadProgress};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_RETRIES: u32 = 3;

/// Octets of payload an UPLOAD response can carry
pub const MAX_UPLOAD_OCTETS: usize = 5;

/// Command codes
pub mod command {
    pub const CONNECT: u8 = 0x01;
    pub const SET_MTA: u8 = 0x02;
    pub const UPLOAD: u8 = 0x04;
    pub const DISCONNECT: u8 = 0x07;

    pub fn name(code: u8) -> &'static str {
        match code {
            CONNECT => "CONNECT",
            SET_MTA => "SET_MTA",
            UPLOAD => "UPLOAD",
            DISCONNECT => "DISCONNECT",
            _ => "UNKNOWN",
        }
    }
}

/// Packet id of a command return message
pub const CRM_PID: u8 = 0xFF;

/// Build a command return message payload
pub fn command_return(status: u8, counter: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; 8];
    payload[0] = CRM_PID;
    payload[1] = status;
    payload[2] = counter;
    let n = data.len().min(5);
    payload[3..3 + n].copy_from_slice(&data[..n]);
    payload
}

/// Identifiers and session parameters of one CCP slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcpConfig {
    /// Command receive object (host → device)
    pub command_id: u32,
    /// Data transmission object (device → host)
    pub response_id: u32,
    pub extended: bool,
    pub station_address: u16,
    /// Bits per addressable memory unit; 8 or a multiple of it
    pub bits_per_byte: u32,
}

impl CcpConfig {
    pub fn new(command_id: u32, response_id: u32, extended: bool) -> Self {
        Self {
            command_id,
            response_id,
            extended,
            station_address: 0,
            bits_per_byte: 8,
        }
    }

    pub fn with_station_address(mut self, station_address: u16) -> Self {
        self.station_address = station_address;
        self
    }

    pub fn with_bits_per_byte(mut self, bits_per_byte: u32) -> Self {
        self.bits_per_byte = bits_per_byte;
        self
    }

    /// Octets per addressable unit
    pub fn octets_per_unit(&self) -> CcpResult<usize> {
        if self.bits_per_byte == 0 || self.bits_per_byte % 8 != 0 {
            return Err(CcpError::InvalidRequest(format!(
                "bits_per_byte must be a non-zero multiple of 8, got {}",
                self.bits_per_byte
            )));
        }
        Ok((self.bits_per_byte / 8) as usize)
    }
}

/// CCP master session
///
/// The session owns the command counter, so commands are issued through
/// `&mut self` one at a time.
pub struct CcpClient {
    bus: Arc<dyn CanBus>,
    config: CcpConfig,
    timeout: Duration,
    retries: u32,
    counter: u8,
    connected: bool,
}

impl CcpClient {
    pub fn new(bus: Arc<dyn CanBus>, config: CcpConfig) -> Self {
        Self {
            bus,
            config,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            counter: 0,
            connected: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attempts per upload frame beyond the first
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn config(&self) -> &CcpConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Send one command and return the data bytes of its return message
    async fn send_command(&mut self, code: u8, params: &[u8]) -> CcpResult<Vec<u8>> {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);

        let mut payload = vec![0u8; 8];
        payload[0] = code;
        payload[1] = counter;
        let n = params.len().min(6);
        payload[2..2 + n].copy_from_slice(&params[..n]);
        let frame = CanFrame::new(self.config.command_id, self.config.extended, payload);

        let mut rx = self.bus.subscribe();
        debug!(
            command = command::name(code),
            counter,
            data = %hex::encode(&frame.data),
            "Sending CCP command"
        );
        self.bus.send(&frame).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let received = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    return Err(CcpError::Timeout {
                        command: command::name(code),
                        timeout_ms: self.timeout.as_millis() as u64,
                    })
                }
                Ok(Ok(frame)) => frame,
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "CCP response receiver lagged");
                    continue;
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(CcpError::Bus(epc_bus::BusError::ConnectionFailed(
                        "receive channel closed".to_string(),
                    )))
                }
            };

            if !received.matches(self.config.response_id, self.config.extended) {
                continue;
            }
            let data = &received.data;
            if data.len() < 3 {
                return Err(CcpError::InvalidResponse(format!(
                    "short response to {}: {}",
                    command::name(code),
                    hex::encode(data)
                )));
            }
            if data[0] != CRM_PID {
                // event messages and DAQ traffic share the response id
                debug!(pid = data[0], "Ignoring non-CRM CCP frame");
                continue;
            }
            if data[2] != counter {
                return Err(CcpError::CommandCounterMismatch {
                    expected: counter,
                    actual: data[2],
                });
            }
            if data[1] != 0 {
                return Err(CcpError::CommandRejected {
                    command: command::name(code),
                    status: data[1],
                });
            }
            return Ok(data[3..].to_vec());
        }
    }

    pub async fn connect(&mut self) -> CcpResult<()> {
        let station = self.config.station_address.to_le_bytes();
        self.send_command(command::CONNECT, &station).await?;
        self.connected = true;
        info!(station = self.config.station_address, "CCP connected");
        Ok(())
    }

    /// End the session; the device keeps its state for a later reconnect
    pub async fn disconnect(&mut self) -> CcpResult<()> {
        let station = self.config.station_address.to_le_bytes();
        let result = self
            .send_command(command::DISCONNECT, &[0x01, 0x00, station[0], station[1]])
            .await;
        self.connected = false;
        result.map(|_| info!("CCP disconnected"))
    }

    /// Point the memory transfer address at `address`
    pub async fn set_mta(&mut self, extension: u8, address: u32) -> CcpResult<()> {
        if !self.connected {
            return Err(CcpError::NotConnected);
        }
        let a = address.to_be_bytes();
        self.send_command(command::SET_MTA, &[0, extension, a[0], a[1], a[2], a[3]])
            .await?;
        Ok(())
    }

    /// Read `units` addressable units at the MTA, which then advances past them
    pub async fn upload(&mut self, units: u8) -> CcpResult<Vec<u8>> {
        if !self.connected {
            return Err(CcpError::NotConnected);
        }
        let octets = units as usize * self.config.octets_per_unit()?;
        if units == 0 || octets > MAX_UPLOAD_OCTETS {
            return Err(CcpError::InvalidRequest(format!(
                "cannot upload {} units in one frame",
                units
            )));
        }
        let data = self.send_command(command::UPLOAD, &[units]).await?;
        if data.len() < octets {
            return Err(CcpError::InvalidResponse(format!(
                "UPLOAD returned {} of {} octets",
                data.len(),
                octets
            )));
        }
        Ok(data[..octets].to_vec())
    }

    async fn upload_at(
        &mut self,
        extension: u8,
        address: u32,
        units: u8,
        set_address: bool,
    ) -> CcpResult<Vec<u8>> {
        if set_address {
            self.set_mta(extension, address).await?;
        }
        self.upload(units).await
    }

    /// Read `octets` octets starting at `address`
    ///
    /// Connects first if needed and disconnects when done. A failed frame
    /// is retried after re-issuing SET_MTA at the address it should have
    /// read; once the retries are used up the block fails with
    /// [`CcpError::BulkReadFailed`].
    #[instrument(skip(self, progress))]
    pub async fn upload_block<F>(
        &mut self,
        extension: u8,
        address: u32,
        octets: usize,
        mut progress: Option<F>,
    ) -> CcpResult<Vec<u8>>
    where
        F: FnMut(&UploadProgress),
    {
        let per_unit = self.config.octets_per_unit()?;
        if octets % per_unit != 0 {
            return Err(CcpError::InvalidRequest(format!(
                "{} octets is not a whole number of {}-octet units",
                octets, per_unit
            )));
        }
        if !self.connected {
            self.connect().await?;
        }

        let result = self
            .read_block(extension, address, octets, per_unit, &mut progress)
            .await;

        if let Err(e) = self.disconnect().await {
            warn!(error = %e, "CCP disconnect failed");
        }
        result
    }

    async fn read_block<F>(
        &mut self,
        extension: u8,
        address: u32,
        octets: usize,
        per_unit: usize,
        progress: &mut Option<F>,
    ) -> CcpResult<Vec<u8>>
    where
        F: FnMut(&UploadProgress),
    {
        let max_units = MAX_UPLOAD_OCTETS / per_unit;
        let mut data = Vec::with_capacity(octets);
        let mut estimator = EtaEstimator::new(octets);
        let mut set_address = true;

        while data.len() < octets {
            let offset = (data.len() / per_unit) as u32;
            let current = address.checked_add(offset).ok_or_else(|| {
                CcpError::InvalidRequest(format!("block at {:#010x} wraps around", address))
            })?;
            let units = max_units.min((octets - data.len()) / per_unit) as u8;

            let mut attempt = 0;
            let bytes = loop {
                match self.upload_at(extension, current, units, set_address).await {
                    Ok(bytes) => break bytes,
                    Err(e) if e.is_retryable() && attempt < self.retries => {
                        attempt += 1;
                        warn!(
                            address = format_args!("{:#010x}", current),
                            attempt,
                            error = %e,
                            "CCP upload failed, resetting MTA"
                        );
                        set_address = true;
                    }
                    Err(e) => {
                        return Err(CcpError::BulkReadFailed {
                            address,
                            octets,
                            attempts: attempt + 1,
                            reason: e.to_string(),
                        })
                    }
                }
            };
            set_address = false;
            data.extend_from_slice(&bytes);

            let snapshot = estimator.record(data.len());
            if let Some(callback) = progress.as_mut() {
                callback(&snapshot);
            }
        }

        info!(octets, "CCP block uploaded");
        Ok(data)
    }

    /// Upload a block and store it in `cache` at its octet address
    pub async fn upload_to_cache<F>(
        &mut self,
        cache: &mut MemoryCache,
        extension: u8,
        address: u32,
        octets: usize,
        progress: Option<F>,
    ) -> CcpResult<()>
    where
        F: FnMut(&UploadProgress),
    {
        let bytes = self
            .upload_block(extension, address, octets, progress)
            .await?;
        let per_unit = self.config.octets_per_unit()? as u64;
        cache.update(&Chunk::with_bytes(address as u64 * per_unit, bytes));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epc_bus::MockBus;
    use epc_sim::{CcpSimConfig, CcpSimulator};
    use pretty_assertions::assert_eq;

    const CCP_COMMAND: u32 = 0x700;
    const CCP_RESPONSE: u32 = 0x701;

    fn attach_device(bus: &MockBus, address: u32, memory: Vec<u8>) -> CcpSimulator {
        attach_device_with(bus, address, memory, 1)
    }

    fn attach_device_with(
        bus: &MockBus,
        address: u32,
        memory: Vec<u8>,
        octets_per_unit: usize,
    ) -> CcpSimulator {
        let sim = CcpSimulator::new(CcpSimConfig {
            octets_per_unit,
            ..Default::default()
        });
        sim.load(address, &memory);
        sim.attach(bus);
        sim
    }

    fn client(bus: Arc<MockBus>) -> CcpClient {
        CcpClient::new(bus, CcpConfig::new(CCP_COMMAND, CCP_RESPONSE, false))
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_counter() {
        let bus = MockBus::shared();
        attach_device(&bus, 0x1000, image(16));
        let mut ccp = client(bus.clone()).with_timeout(Duration::from_millis(50));

        ccp.connect().await.unwrap();
        ccp.set_mta(0, 0x1000).await.unwrap();
        assert_eq!(ccp.upload(4).await.unwrap(), image(16)[..4].to_vec());
        ccp.disconnect().await.unwrap();

        let sent = bus.sent_with_id(CCP_COMMAND);
        let counters: Vec<u8> = sent.iter().map(|f| f.data[1]).collect();
        assert_eq!(counters, vec![0, 1, 2, 3]);
        assert_eq!(sent[1].data, vec![0x02, 1, 0, 0, 0x00, 0x00, 0x10, 0x00]);
        assert!(!ccp.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_mismatch() {
        let bus = MockBus::shared();
        bus.set_responder(|frame| {
            let counter = frame.data[1].wrapping_add(1);
            vec![CanFrame::new(CCP_RESPONSE, false, command_return(0, counter, &[]))]
        });
        let mut ccp = client(bus);
        let err = ccp.connect().await.unwrap_err();
        assert!(matches!(
            err,
            CcpError::CommandCounterMismatch {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_requires_connection() {
        let bus = MockBus::shared();
        let mut ccp = client(bus);
        assert!(matches!(ccp.upload(1).await, Err(CcpError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_command() {
        let bus = MockBus::shared();
        bus.set_responder(|frame| {
            vec![CanFrame::new(
                CCP_RESPONSE,
                false,
                command_return(0x33, frame.data[1], &[]),
            )]
        });
        let mut ccp = client(bus);
        let err = ccp.connect().await.unwrap_err();
        assert!(matches!(
            err,
            CcpError::CommandRejected {
                command: "CONNECT",
                status: 0x33
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_block_reports_progress() {
        let bus = MockBus::shared();
        let memory = image(12);
        attach_device(&bus, 0x2000, memory.clone());
        let mut ccp = client(bus.clone());

        let mut seen = Vec::new();
        let data = ccp
            .upload_block(0, 0x2000, 12, Some(|p: &UploadProgress| seen.push(p.uploaded)))
            .await
            .unwrap();
        assert_eq!(data, memory);
        assert_eq!(seen, vec![5, 10, 12]);

        // CONNECT, SET_MTA, 3 × UPLOAD, DISCONNECT
        let codes: Vec<u8> = bus.sent_with_id(CCP_COMMAND).iter().map(|f| f.data[0]).collect();
        assert_eq!(codes, vec![0x01, 0x02, 0x04, 0x04, 0x04, 0x07]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_block_resets_mta_after_timeout() {
        let bus = MockBus::shared();
        let memory = image(20);
        let device = attach_device(&bus, 0x3000, memory.clone());
        device.drop_upload(2);
        let mut ccp = client(bus.clone());

        let data = ccp
            .upload_block(0, 0x3000, 20, None::<fn(&UploadProgress)>)
            .await
            .unwrap();
        assert_eq!(data, memory);

        let set_mta: Vec<Vec<u8>> = bus
            .sent_with_id(CCP_COMMAND)
            .into_iter()
            .filter(|f| f.data[0] == command::SET_MTA)
            .map(|f| f.data[4..8].to_vec())
            .collect();
        // the retry re-addresses the third frame
        assert_eq!(set_mta, vec![vec![0, 0, 0x30, 0x00], vec![0, 0, 0x30, 0x0A]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_block_gives_up() {
        let bus = MockBus::shared();
        let device = attach_device(&bus, 0x3000, image(10));
        for index in [1, 2, 3] {
            device.drop_upload(index);
        }
        let mut ccp = client(bus.clone()).with_retries(2);

        let err = ccp
            .upload_block(0, 0x3000, 10, None::<fn(&UploadProgress)>)
            .await
            .unwrap_err();
        match err {
            CcpError::BulkReadFailed {
                address, attempts, ..
            } => {
                assert_eq!(address, 0x3000);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {other}"),
        }
        // disconnect still goes out
        assert_eq!(
            bus.sent_with_id(CCP_COMMAND).last().map(|f| f.data[0]),
            Some(command::DISCONNECT)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixteen_bit_units() {
        let bus = MockBus::shared();
        let memory = image(12);
        attach_device_with(&bus, 0x100, memory.clone(), 2);
        let mut ccp = CcpClient::new(
            bus.clone(),
            CcpConfig::new(CCP_COMMAND, CCP_RESPONSE, false).with_bits_per_byte(16),
        );

        let data = ccp
            .upload_block(0, 0x100, 12, None::<fn(&UploadProgress)>)
            .await
            .unwrap();
        assert_eq!(data, memory);
        let sizes: Vec<u8> = bus
            .sent_with_id(CCP_COMMAND)
            .iter()
            .filter(|f| f.data[0] == command::UPLOAD)
            .map(|f| f.data[2])
            .collect();
        assert_eq!(sizes, vec![2, 2, 2]);

        let err = ccp
            .upload_block(0, 0x100, 3, None::<fn(&UploadProgress)>)
            .await
            .unwrap_err();
        assert!(matches!(err, CcpError::InvalidRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_to_cache() {
        let bus = MockBus::shared();
        let memory = image(8);
        attach_device(&bus, 0x40, memory.clone());
        let mut ccp = client(bus);
        let mut cache = MemoryCache::new();

        ccp.upload_to_cache(&mut cache, 0, 0x40, 8, None::<fn(&UploadProgress)>)
            .await
            .unwrap();
        assert_eq!(cache.read(0x40, 8), Some(memory));
    }
}
