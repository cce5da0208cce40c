//! Side channels from the core to the embedding shell
//!
//! The core never talks to a UI directly: progress goes through
//! [ProgressCallbacks], session-level happenings through [EventSink], and
//! cancellation comes back in through a [CancelToken] checked at every
//! suspension point.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::targets::Chip;

/// Session-level events the shell must react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The port is about to disappear and re-enumerate; the current handle
    /// becomes invalid and a new port must be selected by a higher layer
    PortWillChange,
    /// A chip family was identified on the wire
    ChipDetected { chip: Chip, revision: u32 },
}

/// Receiver for [Event]s
pub trait EventSink {
    fn event(&mut self, event: Event);
}

/// Sink that drops every event, for embedders that do not care
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn event(&mut self, _event: Event) {}
}

/// Progress updates for long flash operations
pub trait ProgressCallbacks {
    /// A new operation over `total` units starting at flash address `addr`
    fn init(&mut self, addr: u32, total: usize);
    /// `current` units are done
    fn update(&mut self, current: usize);
    /// The operation finished
    fn finish(&mut self);
}

/// Cooperative cancellation flag
///
/// Cloning shares the flag; any clone may cancel. The device is left in an
/// indeterminate state when a command is torn down half-way, so callers
/// are expected to hard-reset afterwards.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_canceled());

        token.cancel();
        assert!(clone.is_canceled());
    }
}
