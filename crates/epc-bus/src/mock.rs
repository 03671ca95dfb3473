//! Mock CAN bus for testing

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use epc_conv::CanFrame;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::bus::check_frame;
use crate::{BusError, BusStatus, CanBus};

/// Closure answering each transmitted frame with zero or more frames
pub type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

/// In-memory CAN bus
///
/// Every transmitted frame is recorded. An optional responder plays the
/// device side: its replies are broadcast to subscribers, either at once
/// or after the configured reply delay.
pub struct MockBus {
    incoming_tx: broadcast::Sender<CanFrame>,
    status_tx: watch::Sender<BusStatus>,
    sent: Mutex<Vec<CanFrame>>,
    responder: Mutex<Option<Responder>>,
    reply_delay: Mutex<Duration>,
    failing_sends: AtomicUsize,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        let (incoming_tx, _) = broadcast::channel(1024);
        let (status_tx, _) = watch::channel(BusStatus::Online);
        Self {
            incoming_tx,
            status_tx,
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            reply_delay: Mutex::new(Duration::ZERO),
            failing_sends: AtomicUsize::new(0),
        }
    }

    /// Shared handle, the usual way a bus is passed to protocols
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Install the device-side responder, replacing any previous one
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Remove the responder; transmitted frames go unanswered
    pub fn clear_responder(&self) {
        *self.responder.lock() = None;
    }

    /// Delay between a transmitted frame and the responder's replies
    pub fn set_reply_delay(&self, delay: Duration) {
        *self.reply_delay.lock() = delay;
    }

    /// Inject a received frame (simulates unsolicited device traffic)
    pub fn inject(&self, frame: CanFrame) {
        let _ = self.incoming_tx.send(frame);
    }

    /// Inject a received frame after `delay`
    pub fn inject_after(&self, frame: CanFrame, delay: Duration) {
        let tx = self.incoming_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(frame);
        });
    }

    /// Make the next `count` sends fail
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Switch the link state
    pub fn set_online(&self, online: bool) {
        let status = if online {
            BusStatus::Online
        } else {
            BusStatus::Offline
        };
        self.status_tx.send_replace(status);
        tracing::debug!(?status, "Mock bus: status changed");
    }

    /// Snapshot of every transmitted frame
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    /// Transmitted frames carrying `id`
    pub fn sent_with_id(&self, id: u32) -> Vec<CanFrame> {
        self.sent
            .lock()
            .iter()
            .filter(|f| f.id == id)
            .cloned()
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    fn take_failure(&self) -> bool {
        self.failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CanBus for MockBus {
    async fn send(&self, frame: &CanFrame) -> Result<(), BusError> {
        check_frame(frame)?;
        if *self.status_tx.borrow() == BusStatus::Offline {
            return Err(BusError::Offline);
        }
        if self.take_failure() {
            return Err(BusError::SendFailed("injected failure".to_string()));
        }

        tracing::debug!(%frame, "Mock bus: sent frame");
        self.sent.lock().push(frame.clone());

        let replies = match self.responder.lock().as_mut() {
            Some(responder) => responder(frame),
            None => Vec::new(),
        };
        if replies.is_empty() {
            return Ok(());
        }

        let delay = *self.reply_delay.lock();
        if delay.is_zero() {
            for reply in replies {
                let _ = self.incoming_tx.send(reply);
            }
        } else {
            let tx = self.incoming_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for reply in replies {
                    let _ = tx.send(reply);
                }
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }

    fn status(&self) -> watch::Receiver<BusStatus> {
        self.status_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_responder_answers() {
        let bus = MockBus::new();
        bus.set_responder(|frame| vec![CanFrame::new(frame.id + 1, frame.extended, frame.data.clone())]);

        let mut rx = bus.subscribe();
        bus.send(&CanFrame::new(0x100, false, vec![1, 2])).await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply, CanFrame::new(0x101, false, vec![1, 2]));
        assert_eq!(bus.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_refuses_send() {
        let bus = MockBus::new();
        let status = bus.status();
        bus.set_online(false);
        assert_eq!(*status.borrow(), BusStatus::Offline);
        assert!(!bus.is_online());

        let err = bus.send(&CanFrame::new(0x100, false, vec![])).await.unwrap_err();
        assert_eq!(err, BusError::Offline);
        assert_eq!(bus.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = MockBus::new();
        bus.fail_next_sends(2);
        let frame = CanFrame::new(0x100, false, vec![0]);
        assert!(bus.send(&frame).await.is_err());
        assert!(bus.send(&frame).await.is_err());
        assert!(bus.send(&frame).await.is_ok());
        assert_eq!(bus.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let bus = MockBus::new();
        let frame = CanFrame::new(0x100, false, vec![0; 9]);
        assert!(matches!(
            bus.send(&frame).await,
            Err(BusError::InvalidFrame(_))
        ));
        let frame = CanFrame::new(0x800, false, vec![]);
        assert!(bus.send(&frame).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_reply() {
        let bus = MockBus::new();
        bus.set_responder(|frame| vec![frame.clone()]);
        bus.set_reply_delay(Duration::from_millis(50));

        let mut rx = bus.subscribe();
        bus.send(&CanFrame::new(0x10, false, vec![7])).await.unwrap();
        assert!(rx.try_recv().is_err());

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.data, vec![7]);
    }
}
