//! Maps mDNS TXT records to a device capability profile
//!
//! The rules mirror the advertisement shapes of the receivers seen in the
//! wild: AirPort Express, Apple TV, AV receivers, Airfoil Speakers,
//! AirServer and X-Mirage in their several generations. Rules are tried
//! top-down; the first match wins.

use crate::types::device::{DeviceType, CAP_ENCRYPTION, MD_IMAGE, MD_PROGRESS, MD_TEXT};
use std::collections::BTreeMap;

/// Key-value view of an mDNS TXT record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtRecord {
    entries: BTreeMap<String, String>,
}

impl TxtRecord {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key-value pair.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Value of `key`, or the empty string.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.entries.get(key).map_or("", String::as_str)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for TxtRecord {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Classification failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClassifyError {
    /// The service duplicates another advertisement from the same receiver;
    /// the collector should drop it.
    #[error("redundant service advertisement: {0}")]
    RedundantService(String),

    /// Firmware generation this engine cannot stream to.
    #[error("unsupported device: {0}")]
    Unsupported(String),
}

fn list_contains(value: &str, item: &str) -> bool {
    value.split(',').any(|v| v.trim() == item)
}

fn starts_airport(am: &str) -> bool {
    am.starts_with("AirPort") || am.starts_with("Airport")
}

const AVR_MODEL_PREFIXES: &[&str] = &[
    "PIONEER", "DENON", "AVR", "DNP", "HTR", "JB2", "NR", "RX-", "YHA", "YHT",
];

/// Derive the device type from a TXT record.
///
/// # Errors
///
/// Returns [`ClassifyError::RedundantService`] for advertisements that
/// double an already discoverable device and [`ClassifyError::Unsupported`]
/// for firmware this engine cannot serve.
pub fn classify(txt: &TxtRecord) -> Result<DeviceType, ClassifyError> {
    // Airfoil Speakers
    if txt.has("rast") || txt.has("rastx") || txt.has("raver") || txt.has("ramach") {
        return Ok(DeviceType::Afs);
    }

    // AirServer Classic advertises no metadata support at all
    if txt.has("rhd") && !txt.has("md") {
        return Ok(DeviceType::As3);
    }

    // AirServer 4+
    if (txt.has("rhd") && !txt.has("rmodel"))
        || (txt.get("cn") == "0,1,2" && txt.has("ft") && txt.get("sv") == "true")
    {
        if txt.has("am") && starts_airport(txt.get("am")) {
            return Err(ClassifyError::RedundantService(
                "AirServer also advertises as AirPort Express".into(),
            ));
        }
        return Ok(DeviceType::As4);
    }

    // X-Mirage / AirReceiver claim stream encryption but cannot decrypt it,
    // so pin them to a clear stream with full metadata
    if txt.has("rmodel")
        || (txt.has("am")
            && txt.get("vv") == "1"
            && txt.get("ek") == "1"
            && txt.get("et") == "0,1,3"
            && txt.get("md") == "0,1,2"
            && txt.get("sm") == "false"
            && txt.get("vn") == "65537"
            && (txt.get("vs") == "150.33" || txt.get("vs") == "105.1"))
    {
        if txt.has("am") && starts_airport(txt.get("am")) {
            return Err(ClassifyError::RedundantService(
                "X-Mirage also advertises as AirPort Express".into(),
            ));
        }
        return Ok(DeviceType::Any(MD_TEXT | MD_IMAGE | MD_PROGRESS));
    }

    // first-generation AirPort Express firmware (6.1.x) offers none of the
    // newer keys and speaks a protocol dialect this engine does not
    if !txt.has("am")
        && !txt.has("da")
        && !txt.has("fv")
        && !txt.has("md")
        && !txt.has("tp")
        && !txt.has("vs")
    {
        return Err(ClassifyError::Unsupported(
            "AirPort Express 6.1.1/6.2 firmware".into(),
        ));
    }

    // AirPort Express
    if (txt.has("am") && starts_airport(txt.get("am")) && !txt.has("md"))
        || (!txt.has("am") && txt.get("tp") == "TCP,UDP")
    {
        return Ok(DeviceType::Apx);
    }

    // Apple TV
    if txt.get("am").starts_with("AppleTV") && !txt.has("ek") {
        return Ok(DeviceType::Atv);
    }

    // Audio-video receivers; old Klipsch G-17 fakes the model string but
    // supports no metadata, hence the md requirement
    if AVR_MODEL_PREFIXES
        .iter()
        .any(|prefix| txt.get("am").starts_with(prefix))
        && txt.has("md")
    {
        return Ok(DeviceType::Avr);
    }

    // anything else: derive capabilities directly from the record
    let mut bits = 0u8;
    let md = txt.get("md");
    if txt.has("md") && list_contains(md, "0") {
        bits |= MD_TEXT;
    }
    if txt.has("md") && list_contains(md, "1") {
        bits |= MD_IMAGE;
    }
    if txt.has("md") && list_contains(md, "2") {
        bits |= MD_PROGRESS;
    }
    if txt.get("ek") == "1" {
        bits |= CAP_ENCRYPTION;
    }

    Ok(DeviceType::Any(bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txt(pairs: &[(&str, &str)]) -> TxtRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn airfoil_speakers() {
        let record = txt(&[
            ("txtvers", "1"),
            ("cn", "0,1"),
            ("ek", "1"),
            ("et", "0,1"),
            ("md", "0,1,2"),
            ("rast", "afs"),
            ("rastx", "iafs"),
            ("ramach", "Macmini3,1"),
            ("tp", "UDP"),
            ("vn", "3"),
        ]);
        assert_eq!(classify(&record), Ok(DeviceType::Afs));
    }

    #[test]
    fn airserver_classic() {
        let record = txt(&[
            ("cn", "0,1"),
            ("ek", "1"),
            ("et", "0,1"),
            ("rhd", "3.1.2"),
            ("tp", "UDP"),
            ("vn", "3"),
        ]);
        assert_eq!(classify(&record), Ok(DeviceType::As3));
    }

    #[test]
    fn airserver_4_by_rhd() {
        let record = txt(&[
            ("cn", "0,1,2,3"),
            ("ek", "1"),
            ("et", "0,3"),
            ("md", "0,1,2"),
            ("am", "AppleTV2,1"),
            ("rhd", "4.0.1"),
            ("tp", "UDP"),
            ("vs", "120.2"),
        ]);
        assert_eq!(classify(&record), Ok(DeviceType::As4));
    }

    #[test]
    fn airserver_redundant_airport_shape_rejected() {
        let record = txt(&[
            ("cn", "0,1,2"),
            ("ft", "0x5A7FFFF7"),
            ("sv", "true"),
            ("am", "AirPort10,115"),
        ]);
        assert_eq!(
            classify(&record),
            Err(ClassifyError::RedundantService(
                "AirServer also advertises as AirPort Express".into()
            ))
        );
    }

    #[test]
    fn x_mirage_gets_clear_stream_with_full_metadata() {
        let record = txt(&[
            ("am", "AppleTV3,1"),
            ("cn", "0,1,2,3"),
            ("ek", "1"),
            ("et", "0,1,3"),
            ("md", "0,1,2"),
            ("sm", "false"),
            ("vn", "65537"),
            ("vs", "150.33"),
            ("vv", "1"),
        ]);
        assert_eq!(classify(&record), Ok(DeviceType::Any(0b0111)));
    }

    #[test]
    fn old_airport_firmware_unsupported() {
        let record = txt(&[("cn", "0,1"), ("ek", "1"), ("et", "0,1")]);
        assert!(matches!(
            classify(&record),
            Err(ClassifyError::Unsupported(_))
        ));
    }

    #[test]
    fn airport_express_by_model() {
        let record = txt(&[
            ("am", "AirPort4,107"),
            ("cn", "0,1"),
            ("da", "true"),
            ("ek", "1"),
            ("et", "0,1"),
            ("fv", "76400.10"),
            ("tp", "TCP,UDP"),
            ("vn", "65537"),
            ("vs", "105.1"),
        ]);
        assert_eq!(classify(&record), Ok(DeviceType::Apx));
    }

    #[test]
    fn airport_express_by_transport() {
        let record = txt(&[("cn", "0,1"), ("et", "0,1"), ("tp", "TCP,UDP"), ("vn", "3")]);
        assert_eq!(classify(&record), Ok(DeviceType::Apx));
    }

    #[test]
    fn apple_tv() {
        let record = txt(&[
            ("am", "AppleTV1,1"),
            ("cn", "0,1"),
            ("da", "true"),
            ("et", "0,2"),
            ("md", "0,1,2"),
            ("tp", "TCP,UDP"),
            ("vn", "65537"),
            ("vs", "101.9"),
        ]);
        assert_eq!(classify(&record), Ok(DeviceType::Atv));
    }

    #[test]
    fn denon_receiver() {
        let record = txt(&[
            ("am", "DENON,1"),
            ("cn", "0,1"),
            ("da", "true"),
            ("et", "0,4"),
            ("fv", "66.8570"),
            ("md", "0,1,2"),
            ("tp", "UDP"),
            ("vn", "65537"),
            ("vs", "103.2"),
        ]);
        assert_eq!(classify(&record), Ok(DeviceType::Avr));
    }

    #[test]
    fn klipsch_without_metadata_is_not_avr() {
        let record = txt(&[
            ("am", "JB2 Gen"),
            ("cn", "0,1"),
            ("da", "true"),
            ("et", "0,4"),
            ("tp", "UDP"),
            ("vs", "103.2"),
        ]);
        // falls through to capability bits: nothing advertised
        assert_eq!(classify(&record), Ok(DeviceType::Any(0)));
    }

    #[test]
    fn shairport_like_fallback_bits() {
        let record = txt(&[
            ("cn", "0,1"),
            ("ek", "1"),
            ("et", "0,1"),
            ("md", "0,2"),
            ("tp", "UDP"),
            ("vs", "130.14"),
        ]);
        // text + progress + encryption, no artwork
        assert_eq!(
            classify(&record),
            Ok(DeviceType::Any(MD_TEXT | MD_PROGRESS | CAP_ENCRYPTION))
        );
    }
}
