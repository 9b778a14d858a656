use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag, shared down the Flow → Step → Call
/// hierarchy. Checked at every suspension point; setting it never
/// interrupts a write in progress.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Shared run controls: pause quiesces (no new step starts, in-flight steps
/// commit or time out), cancel interrupts in-flight calls.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pause: Arc<AtomicBool>,
    cancel: CancelToken,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_propagates_to_clones() {
        let token = CancelToken::new();
        let child = token.clone();
        assert!(!child.is_cancelled());
        token.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn run_control_pause_and_cancel_are_independent() {
        let control = RunControl::new();
        control.pause();
        assert!(control.is_paused());
        assert!(!control.is_cancelled());
        control.unpause();
        control.cancel();
        assert!(control.is_cancelled());
        assert!(control.cancel_token().is_cancelled());
    }
}
