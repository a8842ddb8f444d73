use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Token for cooperative cancellation of a run.
///
/// Uses an AtomicBool internally. Clone is cheap and shares state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    signal: Arc<AtomicI32>,
}

impl CancellationToken {
    /// Create a new cancellation token (not cancelled).
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Request cancellation on behalf of a received signal.
    pub fn cancel_with_signal(&self, signal: i32) {
        self.signal.store(signal, Ordering::SeqCst);
        self.cancel();
    }

    /// Signal number that caused cancellation, if any.
    pub fn signal(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }
}

/// Route SIGINT/SIGTERM/SIGHUP into `token`.
///
/// The run keeps going until its current blocking step observes the token,
/// so the lock and mount guards are dropped on the normal return path.
pub fn install_signal_handlers(token: &CancellationToken) -> std::io::Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let token = token.clone();
    std::thread::spawn(move || {
        for sig in signals.forever() {
            warn!("Received signal {}, cancelling archive run...", sig);
            token.cancel_with_signal(sig);
        }
    });
    Ok(())
}
