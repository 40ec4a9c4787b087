use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::protocol::{normalize_banner, Inbound};

/// Tracks the single banner exchange performed at session start.
#[derive(Debug, Default)]
pub(crate) struct Handshake {
    pending: Option<u64>,
    banner: Option<Map<String, Value>>,
    sent_at: Option<Instant>,
    overdue_reported: bool,
}

impl Handshake {
    /// Record a freshly sent handshake request; any earlier banner is dropped.
    pub(crate) fn begin(&mut self, id: u64) {
        *self = Self {
            pending: Some(id),
            sent_at: Some(Instant::now()),
            ..Self::default()
        };
    }

    /// Consume the response to the pending handshake, caching its banner.
    ///
    /// Returns true when the message was the handshake response and must not
    /// be handed to the caller.
    pub(crate) fn intercept(&mut self, message: &Inbound) -> bool {
        match self.pending {
            Some(id) if message.id() == Some(id) => {
                self.banner = Some(normalize_banner(message.result()));
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn banner(&self) -> Option<&Map<String, Value>> {
        self.banner.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> Option<u64> {
        self.pending
    }

    /// Report, once, that the handshake has waited longer than `timeout`.
    pub(crate) fn overdue(&mut self, timeout: Duration) -> Option<Duration> {
        if self.overdue_reported || timeout.is_zero() {
            return None;
        }
        self.pending?;
        let waited = self.sent_at?.elapsed();
        if waited < timeout {
            return None;
        }
        self.overdue_reported = true;
        Some(waited)
    }
}
