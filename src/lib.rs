//! # raopcast
//!
//! Streams PCM audio from a local media player to AirPlay-v1 (RAOP)
//! speakers over the local network.
//!
//! The core pieces:
//!
//! - mDNS discovery and TXT-record classification of speakers
//! - an RTSP session negotiator (challenge-response, digest auth)
//! - the RAOP engine: ALAC encoding, AES-CBC packet encryption, paced RTP
//!   data/sync loops, NTP timing reflection, and resend-on-demand
//! - a bounded staging buffer and a sample-rate/bit-depth/channel
//!   reformatter in front of the engine
//! - a device manager fanning sessions, volume, and metadata out to every
//!   selected speaker
//! - a DACP HTTP server that lets speakers drive the player
//!
//! ## Example
//!
//! ```rust,no_run
//! use raopcast::device::manager::DeviceManager;
//! use raopcast::engine::OutputObserver;
//! use raopcast::options::OptionsStore;
//! use raopcast::player::LoggingStatusSink;
//! use std::sync::Arc;
//!
//! struct NoopObserver;
//! impl OutputObserver for NoopObserver {
//!     fn on_bytes_output(&self, _length: usize) {}
//! }
//!
//! struct NoPassword;
//! impl raopcast::player::PasswordPrompt for NoPassword {
//!     fn request_password(&self, _device: &str) -> Option<raopcast::player::PasswordReply> {
//!         None
//!     }
//! }
//!
//! # fn main() -> Result<(), raopcast::RaopCastError> {
//! let options = Arc::new(OptionsStore::default());
//! let user_agent = "raopcast/0.1";
//! let dacp_id = raopcast::dacp::dacp_id(user_agent);
//!
//! let manager = DeviceManager::new(
//!     options,
//!     Arc::new(NoopObserver),
//!     Arc::new(NoPassword),
//!     Arc::new(LoggingStatusSink),
//!     None,
//!     user_agent,
//!     dacp_id,
//! )?;
//!
//! let pipeline = manager.build_pipeline(manager.output_format())?;
//! manager.open_devices();
//! // feed PCM into `pipeline` from the player's output thread
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Audio pipeline: staging buffer, reformatter, ALAC adapter
pub mod audio;
/// DACP remote-control server
pub mod dacp;
/// Per-speaker session state machines and the device manager
pub mod device;
/// mDNS discovery and device classification
pub mod discovery;
/// The RAOP streaming engine
pub mod engine;
/// Error types
pub mod error;
/// Configuration snapshots and the notification bus
pub mod options;
/// Host player ports
pub mod player;
/// Wire protocols (RTSP, RTP, SDP, DMAP, crypto)
pub mod protocol;
/// Core types
pub mod types;

pub use error::RaopCastError;
pub use types::{DeviceAddr, DeviceInfo, DeviceType, OutputFormat, OutputMetadata};
