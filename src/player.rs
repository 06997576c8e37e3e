//! Ports implemented by the host player integration
//!
//! The engine never talks to the player directly; the host wires these
//! traits in. Everything here is out of the streaming core's scope by
//! design: the core calls, the host decides.

/// Transport and volume commands a speaker can issue through DACP.
pub trait Player: Send + Sync {
    /// Start or resume playback.
    fn play(&self);
    /// Pause playback.
    fn pause(&self);
    /// Stop playback.
    fn stop(&self);
    /// Restart the current item.
    fn restart(&self);
    /// Skip to the next item.
    fn start_next(&self);
    /// Return to the previous item.
    fn start_prev(&self);
    /// Raise the player volume one step.
    fn increase_volume(&self);
    /// Lower the player volume one step.
    fn decrease_volume(&self);
    /// Toggle mute.
    fn toggle_mute(&self);
    /// Toggle shuffle.
    fn toggle_shuffle(&self);
}

/// Result of asking the user for a device password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordReply {
    /// The entered secret
    pub secret: String,
    /// Persist it for future sessions
    pub remember: bool,
}

/// Modal password prompt; `None` means the user cancelled.
pub trait PasswordPrompt: Send + Sync {
    /// Ask for the password of `device_name`.
    fn request_password(&self, device_name: &str) -> Option<PasswordReply>;
}

/// User-visible, non-blocking status reports from the device manager.
pub trait StatusSink: Send + Sync {
    /// No speakers were selected when playback started.
    fn no_devices_selected(&self);
    /// A speaker refused the session because another player holds it.
    fn device_in_use(&self, device_name: &str);
    /// Session negotiation failed with an error code.
    fn device_failed(&self, device_name: &str, code: i32);
    /// The speaker's audio jack is reported disconnected.
    fn jack_disconnected(&self, device_name: &str);
}

/// A status sink that logs and nothing else, for headless hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStatusSink;

impl StatusSink for LoggingStatusSink {
    fn no_devices_selected(&self) {
        tracing::warn!("no remote speakers are selected for output");
    }

    fn device_in_use(&self, device_name: &str) {
        tracing::warn!(device = device_name, "speakers are in use by another player");
    }

    fn device_failed(&self, device_name: &str, code: i32) {
        tracing::warn!(device = device_name, code, "session negotiation failed");
    }

    fn jack_disconnected(&self, device_name: &str) {
        tracing::warn!(device = device_name, "audio jack is not connected");
    }
}
