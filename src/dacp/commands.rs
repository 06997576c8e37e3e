//! DACP request parsing

use std::collections::BTreeMap;

/// Commands a speaker's remote-control client can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DacpCommand {
    /// Not understood; answered 501
    None,
    /// `play` / `playpause`
    Play,
    /// `pause`
    Pause,
    /// `stop`
    Stop,
    /// `restartitem`
    Restart,
    /// `nextitem`
    NextTrack,
    /// `previtem`
    PrevTrack,
    /// `volumeup`
    VolumeUp,
    /// `volumedown`
    VolumeDown,
    /// `mutetoggle`
    ToggleMute,
    /// `shufflesongs`
    ToggleShuffle,
    /// `setproperty` with query parameters
    SetProperty,
}

/// One parsed DACP request.
#[derive(Debug, Clone)]
pub struct DacpRequest {
    /// Decoded command
    pub command: DacpCommand,
    /// Query parameters, URL-decoded
    pub params: BTreeMap<String, String>,
    /// Value of the `Active-Remote` header; zero when absent or invalid
    pub remote_control_id: u32,
}

fn command_from_segment(segment: &str) -> DacpCommand {
    match segment {
        "play" | "playpause" => DacpCommand::Play,
        "pause" => DacpCommand::Pause,
        "stop" => DacpCommand::Stop,
        "restartitem" => DacpCommand::Restart,
        "nextitem" => DacpCommand::NextTrack,
        "previtem" => DacpCommand::PrevTrack,
        "volumeup" => DacpCommand::VolumeUp,
        "volumedown" => DacpCommand::VolumeDown,
        "mutetoggle" => DacpCommand::ToggleMute,
        "shufflesongs" => DacpCommand::ToggleShuffle,
        "setproperty" => DacpCommand::SetProperty,
        _ => DacpCommand::None,
    }
}

fn url_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse an HTTP request head into a [`DacpRequest`]. `None` for anything
/// that is not an HTTP/1.1 GET. A request with an unrecognized path, or
/// without a numeric `Active-Remote` header, parses to `DacpCommand::None`.
#[must_use]
pub fn parse_request(text: &str) -> Option<DacpRequest> {
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;

    let mut parts = request_line.split(' ');
    let method = parts.next()?;
    let resource = parts.next()?;
    let protocol = parts.next()?;
    if method != "GET" || !protocol.starts_with("HTTP/1.1") {
        return None;
    }

    let (path, query) = resource.split_once('?').unwrap_or((resource, ""));

    let mut command = DacpCommand::None;
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if segments.len() == 3 && segments[0] == "ctrl-int" && segments[1] == "1" {
        command = command_from_segment(segments[2]);
    }

    let params: BTreeMap<String, String> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = url_decode(key);
            (!key.is_empty()).then(|| (key, url_decode(value)))
        })
        .collect();

    let mut remote_control_id = 0u32;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Active-Remote") {
                remote_control_id = value.trim().parse().unwrap_or(0);
            }
        }
    }

    // commands without a valid correlator are refused
    if remote_control_id == 0 {
        command = DacpCommand::None;
    }

    Some(DacpRequest {
        command,
        params,
        remote_control_id,
    })
}
