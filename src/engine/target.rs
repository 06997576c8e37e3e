//! Attached speaker endpoint

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-speaker RTP endpoints registered with the engine at open time.
///
/// The device owns the `Arc` and flips `open` off when it closes; the engine
/// holds the same `Arc` in its attachment list and checks the flag before
/// every send, so a closing device never races a packet in flight.
#[derive(Debug)]
pub struct StreamTarget {
    /// Speaker's audio data endpoint
    pub audio_addr: SocketAddr,
    /// Speaker's control endpoint (sync, resend)
    pub control_addr: SocketAddr,
    /// Speaker's timing endpoint
    pub timing_addr: SocketAddr,
    /// Whether this stream is AES encrypted
    pub secured: bool,
    open: AtomicBool,
}

impl StreamTarget {
    /// Create an open endpoint set.
    #[must_use]
    pub fn new(
        audio_addr: SocketAddr,
        control_addr: SocketAddr,
        timing_addr: SocketAddr,
        secured: bool,
    ) -> Self {
        Self {
            audio_addr,
            control_addr,
            timing_addr,
            secured,
            open: AtomicBool::new(true),
        }
    }

    /// Whether the owning device still streams.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Mark the endpoint closed; the engine skips it from now on.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
