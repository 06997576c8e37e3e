//! Core types

/// Speaker identity and classification
pub mod device;
/// Audio stream format
pub mod format;
/// Track metadata
pub mod metadata;

pub use device::{DeviceAddr, DeviceInfo, DeviceType};
pub use format::OutputFormat;
pub use metadata::OutputMetadata;

/// Half-open interval of RTP timestamps describing the current track:
/// (begin, end) of the playing chapter relative to the stream clock.
pub type OutputInterval = (u32, u32);
