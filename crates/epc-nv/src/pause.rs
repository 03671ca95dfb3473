//! Pause tokens for background polling

use std::sync::Arc;

use tokio::sync::watch;

/// Counts outstanding pause tokens
///
/// While any [`PauseToken`] is alive, requests carrying this gate wait before
/// they start.
#[derive(Debug, Clone)]
pub struct PauseGate {
    holders: Arc<watch::Sender<usize>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            holders: Arc::new(tx),
        }
    }

    /// Acquire a token; polling resumes when every token is dropped
    pub fn pause(&self) -> PauseToken {
        self.holders.send_modify(|n| *n += 1);
        PauseToken {
            holders: self.holders.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.holders.borrow() > 0
    }

    /// Wait until no token is held
    pub async fn wait_resumed(&self) {
        let mut rx = self.holders.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Scoped pause; released on drop
#[derive(Debug)]
#[must_use = "polling resumes as soon as the token is dropped"]
pub struct PauseToken {
    holders: Arc<watch::Sender<usize>>,
}

impl Drop for PauseToken {
    fn drop(&mut self) {
        self.holders.send_modify(|n| *n = n.saturating_sub(1));
    }
}
