//! Raw SocketCAN bus (Linux only)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use epc_conv::CanFrame;
use parking_lot::Mutex;
use socketcan::{
    CanFrame as RawFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, StandardId,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::bus::check_frame;
use crate::{BusError, BusStatus, CanBus};

/// CAN bus on a raw SocketCAN interface
///
/// A blocking listener task reads frames from the socket and fans them out
/// through a broadcast channel.
pub struct SocketCanBus {
    interface: String,
    socket: Arc<CanSocket>,
    incoming_tx: broadcast::Sender<CanFrame>,
    status_tx: Arc<watch::Sender<BusStatus>>,
    running: Arc<AtomicBool>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCanBus {
    pub fn open(interface: &str) -> Result<Self, BusError> {
        let socket = CanSocket::open(interface).map_err(|e| {
            BusError::ConnectionFailed(format!("Failed to open CAN socket on {}: {}", interface, e))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| BusError::InvalidConfig(format!("Failed to set non-blocking: {}", e)))?;

        let (incoming_tx, _) = broadcast::channel(1024);
        let (status_tx, _) = watch::channel(BusStatus::Online);

        let bus = Self {
            interface: interface.to_string(),
            socket: Arc::new(socket),
            incoming_tx,
            status_tx: Arc::new(status_tx),
            running: Arc::new(AtomicBool::new(true)),
            listener_handle: Mutex::new(None),
        };
        bus.start_listener();

        tracing::info!(interface = %interface, "SocketCAN bus opened");
        Ok(bus)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn start_listener(&self) {
        let socket = self.socket.clone();
        let incoming_tx = self.incoming_tx.clone();
        let status_tx = self.status_tx.clone();
        let running = self.running.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                match socket.read_frame() {
                    Ok(raw) => {
                        status_tx.send_if_modified(|s| {
                            let changed = *s != BusStatus::Online;
                            *s = BusStatus::Online;
                            changed
                        });
                        if let Some(frame) = from_raw(&raw) {
                            tracing::trace!(%frame, "Frame received");
                            let _ = incoming_tx.send(frame);
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "SocketCAN read error");
                        status_tx.send_replace(BusStatus::Offline);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            tracing::debug!("SocketCAN listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }
}

impl Drop for SocketCanBus {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn to_raw(frame: &CanFrame) -> Result<RawFrame, BusError> {
    let id: Id = if frame.extended {
        ExtendedId::new(frame.id)
            .ok_or_else(|| BusError::InvalidFrame(format!("Invalid extended id 0x{:X}", frame.id)))?
            .into()
    } else {
        let id = u16::try_from(frame.id)
            .ok()
            .and_then(StandardId::new)
            .ok_or_else(|| BusError::InvalidFrame(format!("Invalid standard id 0x{:X}", frame.id)))?;
        id.into()
    };
    RawFrame::new(id, &frame.data)
        .ok_or_else(|| BusError::InvalidFrame(format!("Cannot build frame {}", frame)))
}

fn from_raw(raw: &RawFrame) -> Option<CanFrame> {
    match raw {
        RawFrame::Data(_) => Some(CanFrame::new(
            Frame::raw_id(raw),
            EmbeddedFrame::is_extended(raw),
            EmbeddedFrame::data(raw).to_vec(),
        )),
        _ => None,
    }
}

#[async_trait]
impl CanBus for SocketCanBus {
    async fn send(&self, frame: &CanFrame) -> Result<(), BusError> {
        check_frame(frame)?;
        let raw = to_raw(frame)?;
        let socket = self.socket.clone();

        tokio::task::spawn_blocking(move || socket.write_frame(&raw))
            .await
            .map_err(|e| BusError::SendFailed(format!("Send task join error: {}", e)))?
            .map_err(|e| {
                tracing::warn!(error = %e, "SocketCAN write failed");
                BusError::SendFailed(e.to_string())
            })?;

        tracing::debug!(%frame, "Frame sent");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }

    fn status(&self) -> watch::Receiver<BusStatus> {
        self.status_tx.subscribe()
    }
}
