//! Speaker identity and classification

use serde::{Deserialize, Serialize};

/// Metadata capability bit: device accepts DMAP text metadata.
pub const MD_TEXT: u8 = 0x01;
/// Metadata capability bit: device accepts artwork images.
pub const MD_IMAGE: u8 = 0x02;
/// Metadata capability bit: device accepts playback progress.
pub const MD_PROGRESS: u8 = 0x04;
/// Capability bit: device requires RSA handshake and AES stream encryption.
pub const CAP_ENCRYPTION: u8 = 0x08;

/// Classified device type, derived from the mDNS TXT record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// AirPort Express
    Apx,
    /// Apple TV
    Atv,
    /// Audio-video receiver (Denon, Pioneer, Yamaha, ...)
    Avr,
    /// Airfoil Speakers
    Afs,
    /// AirServer Classic
    As3,
    /// AirServer 4+
    As4,
    /// Anything else: low three bits are the metadata mask,
    /// bit 3 set means the stream must be encrypted.
    Any(u8),
}

impl DeviceType {
    /// Whether the audio stream to this device must be AES encrypted.
    #[must_use]
    pub fn secure_stream(&self) -> bool {
        match self {
            Self::Apx | Self::Atv | Self::Avr | Self::As4 => false,
            Self::Afs | Self::As3 => true,
            Self::Any(bits) => bits & CAP_ENCRYPTION != 0,
        }
    }

    /// Metadata kinds the device accepts, as an `MD_*` bit mask.
    #[must_use]
    pub fn metadata_flags(&self) -> u8 {
        match self {
            Self::Apx | Self::As3 => 0,
            Self::Atv | Self::Avr | Self::As4 | Self::Afs => MD_TEXT | MD_IMAGE | MD_PROGRESS,
            Self::Any(bits) => bits & (MD_TEXT | MD_IMAGE | MD_PROGRESS),
        }
    }
}

/// How a device is reached: either a discovered DNS-SD service or a
/// manually entered host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceAddr {
    /// Discovered `_raop._tcp.` service instance.
    Service {
        /// Service instance name
        name: String,
        /// Service type (e.g. `_raop._tcp.`)
        ty: String,
    },
    /// Manually configured endpoint.
    Host {
        /// Host name or IP literal
        host: String,
        /// TCP port of the RTSP listener
        port: u16,
    },
}

/// Identity and classification of one remote speaker.
///
/// Discovered entries are ephemeral; manual entries are persisted by the
/// host. The `name` is the unique key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Classified type
    pub device_type: DeviceType,
    /// Unique display name (UTF-8)
    pub name: String,
    /// Where to reach it
    pub addr: DeviceAddr,
    /// True when the record came from mDNS
    pub zero_conf: bool,
}

impl DeviceInfo {
    /// Create a new device record.
    #[must_use]
    pub fn new(device_type: DeviceType, name: impl Into<String>, addr: DeviceAddr, zero_conf: bool) -> Self {
        Self {
            device_type,
            name: name.into(),
            addr,
            zero_conf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_mapping() {
        assert!(!DeviceType::Apx.secure_stream());
        assert_eq!(DeviceType::Apx.metadata_flags(), 0);

        assert!(DeviceType::As3.secure_stream());
        assert_eq!(DeviceType::As3.metadata_flags(), 0);

        assert!(!DeviceType::As4.secure_stream());
        assert_eq!(
            DeviceType::As4.metadata_flags(),
            MD_TEXT | MD_IMAGE | MD_PROGRESS
        );

        assert!(DeviceType::Afs.secure_stream());
        assert_eq!(
            DeviceType::Afs.metadata_flags(),
            MD_TEXT | MD_IMAGE | MD_PROGRESS
        );
    }

    #[test]
    fn any_bits_unpack() {
        let ty = DeviceType::Any(0b0111);
        assert!(!ty.secure_stream());
        assert_eq!(ty.metadata_flags(), MD_TEXT | MD_IMAGE | MD_PROGRESS);

        let ty = DeviceType::Any(0b1001);
        assert!(ty.secure_stream());
        assert_eq!(ty.metadata_flags(), MD_TEXT);
    }

    #[test]
    fn serde_round_trip() {
        let info = DeviceInfo::new(
            DeviceType::Any(7),
            "Kitchen",
            DeviceAddr::Service {
                name: "Kitchen".into(),
                ty: "_raop._tcp.".into(),
            },
            true,
        );
        let json = serde_json::to_string(&info).unwrap();
        let back: DeviceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
