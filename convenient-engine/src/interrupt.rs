//! Build interruption

use tokio::sync::watch;

/// Cloneable trigger that interrupts a running build
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    sender: watch::Sender<bool>,
}

impl InterruptHandle {
    /// Untriggered handle
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Interrupt the build
    pub fn interrupt(&self) {
        let _ = self.sender.send_replace(true);
    }

    /// Whether [`InterruptHandle::interrupt`] was called
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        *self.sender.borrow()
    }

    /// Completes once the build is interrupted
    pub async fn interrupted(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so this only ends on interrupt.
        let _ = receiver.wait_for(|interrupted| *interrupted).await;
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_wakes_waiter() {
        let handle = InterruptHandle::new();
        let waiter = handle.clone();
        let thread = std::thread::spawn(move || futures::executor::block_on(waiter.interrupted()));
        handle.interrupt();
        thread.join().unwrap();
        assert!(handle.is_interrupted());
    }

    #[test]
    fn test_interrupt_before_wait_is_seen() {
        let handle = InterruptHandle::new();
        handle.interrupt();
        futures::executor::block_on(handle.interrupted());
    }
}
