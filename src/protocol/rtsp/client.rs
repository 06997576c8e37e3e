//! Blocking RTSP client for one speaker session

use super::auth::DigestState;
use super::headers::names;
use super::request::{Method, RtspRequest};
use super::response::RtspResponse;
use super::{AudioJackStatus, RtspError, STATUS_OK, STATUS_UNAUTHORIZED};
use crate::protocol::crypto::{base64_repadded, base64_unpadded, RaopRsaKey};
use crate::protocol::sdp;
use rand::RngCore;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{trace, warn};

/// Speaker answered the RSA challenge without an `Apple-Response` header.
pub const ERR_CHALLENGE_RESPONSE_MISSING: i32 = -200_000;
/// `Apple-Response` did not decode to one RSA block.
pub const ERR_CHALLENGE_RESPONSE_SIZE: i32 = -200_001;
/// The RSA public operation failed on the response block.
pub const ERR_CHALLENGE_DECRYPT: i32 = -200_002;
/// Decrypted response was shorter than the challenge.
pub const ERR_CHALLENGE_SHORT: i32 = -200_003;
/// Decrypted response did not match the challenge we sent.
pub const ERR_CHALLENGE_MISMATCH: i32 = -200_004;
/// SETUP response carried no `Session` header.
pub const ERR_SETUP_SESSION_MISSING: i32 = -200_100;
/// SETUP response `Session` header was empty.
pub const ERR_SETUP_SESSION_EMPTY: i32 = -200_101;
/// SETUP response carried no `Transport` header.
pub const ERR_SETUP_TRANSPORT_MISSING: i32 = -200_102;

/// Transport parameters returned by SETUP.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetupResult {
    /// Speaker's audio data port
    pub server_port: u16,
    /// Speaker's control port
    pub control_port: u16,
    /// Speaker's timing port
    pub timing_port: u16,
    /// Speaker playback latency in samples, when reported
    pub audio_latency: Option<u32>,
    /// Audio jack state, when reported
    pub jack_status: Option<AudioJackStatus>,
}

/// Blocking request/response RTSP client bound to one TCP connection.
///
/// All requests carry the shared headers (`User-Agent`, `CSeq`,
/// `Active-Remote`, `Client-Instance`, `DACP-ID`, optional `Session` and
/// `Authorization`). Responses are read byte-by-byte until the blank line,
/// then `Content-Length` body bytes.
pub struct RtspClient {
    stream: TcpStream,
    user_agent: String,
    dacp_id: u64,
    remote_control_id: u32,
    sequence: u32,
    local_session_id: u32,
    remote_session_id: String,
    digest: DigestState,
    teardown_required: bool,
}

impl RtspClient {
    /// Wrap a connected socket. Applies the session socket options
    /// (no-delay, 10 s send/receive timeouts).
    ///
    /// # Errors
    ///
    /// Returns `RtspError::Io` if socket options cannot be applied.
    pub fn new(
        stream: TcpStream,
        user_agent: impl Into<String>,
        dacp_id: u64,
        remote_control_id: u32,
    ) -> Result<Self, RtspError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;

        Ok(Self {
            stream,
            user_agent: user_agent.into(),
            dacp_id,
            remote_control_id,
            sequence: 0,
            local_session_id: 0,
            remote_session_id: String::new(),
            digest: DigestState::default(),
            teardown_required: false,
        })
    }

    /// Store the device password for digest retries.
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.digest.set_password(password);
    }

    /// Whether a successful RECORD obliges us to TEARDOWN on close.
    #[must_use]
    pub fn teardown_required(&self) -> bool {
        self.teardown_required
    }

    /// The connected speaker's address.
    ///
    /// # Errors
    ///
    /// Returns `RtspError::Io` when the socket is gone.
    pub fn peer_addr(&self) -> Result<std::net::SocketAddr, RtspError> {
        Ok(self.stream.peer_addr()?)
    }

    /// Probe the TCP connection without consuming data. `true` when the
    /// peer is still reachable.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let ready = match self.stream.peek(&mut probe) {
            Ok(n) => n > 0,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        };
        let _ = self.stream.set_nonblocking(false);
        ready
    }

    /// Send `OPTIONS *`. With `rsa_key` set, attach an `Apple-Challenge`
    /// and verify the speaker's `Apple-Response`.
    ///
    /// Returns the RTSP status code, or one of the negative
    /// `ERR_CHALLENGE_*` sentinels on a verification failure.
    ///
    /// # Errors
    ///
    /// Returns `RtspError` on transport failure.
    pub fn do_options(&mut self, rsa_key: Option<&RaopRsaKey>) -> Result<i32, RtspError> {
        let mut request = RtspRequest::new(Method::Options);

        let mut challenge = [0u8; 16];
        if rsa_key.is_some() {
            rand::thread_rng().fill_bytes(&mut challenge);
            request
                .headers
                .insert(names::APPLE_CHALLENGE, base64_unpadded(&challenge));
        }

        let response = self.exchange(request)?;

        // a 401 flows through so the challenge still gets checked
        if response.status != STATUS_OK && response.status != STATUS_UNAUTHORIZED {
            return Ok(response.status);
        }

        if let Some(rsa_key) = rsa_key {
            let Some(encoded) = response.headers.get(names::APPLE_RESPONSE) else {
                return Ok(ERR_CHALLENGE_RESPONSE_MISSING);
            };

            let mut block = match base64_repadded(encoded) {
                Ok(block) => block,
                Err(_) => return Ok(ERR_CHALLENGE_RESPONSE_SIZE),
            };
            while block.len() > rsa_key.size() && block.last() == Some(&0) {
                block.pop();
            }
            if block.len() != rsa_key.size() {
                return Ok(ERR_CHALLENGE_RESPONSE_SIZE);
            }

            let Some(cleartext) = rsa_key.public_decrypt_pkcs1(&block) else {
                return Ok(ERR_CHALLENGE_DECRYPT);
            };
            if cleartext.len() < challenge.len() {
                return Ok(ERR_CHALLENGE_SHORT);
            }
            if cleartext[..challenge.len()] != challenge {
                return Ok(ERR_CHALLENGE_MISMATCH);
            }
        }

        Ok(response.status)
    }

    /// Send ANNOUNCE with the stream's SDP description. Keys are the
    /// base64 session key material; pass empty strings for a clear stream.
    ///
    /// # Errors
    ///
    /// Returns `RtspError` on transport failure.
    pub fn do_announce(&mut self, aes_key_b64: &str, aes_iv_b64: &str) -> Result<i32, RtspError> {
        self.local_session_id = rand::thread_rng().next_u32();

        let local_ip = self.stream.local_addr()?.ip();
        let peer_ip = self.stream.peer_addr()?.ip();
        let body = sdp::announce_body(
            self.local_session_id,
            &local_ip,
            &peer_ip,
            aes_key_b64,
            aes_iv_b64,
        );

        let mut request = RtspRequest::new(Method::Announce);
        request.set_body(body, "application/sdp");

        let response = self.exchange(request)?;
        Ok(response.status)
    }

    /// Send SETUP advertising our `control_port`/`timing_port`; parse the
    /// speaker's ports, latency, and jack status from the response.
    ///
    /// Returns the status code (or a negative `ERR_SETUP_*` sentinel) along
    /// with the parsed transport.
    ///
    /// # Errors
    ///
    /// Returns `RtspError` on transport failure.
    pub fn do_setup(
        &mut self,
        control_port: u16,
        timing_port: u16,
    ) -> Result<(i32, SetupResult), RtspError> {
        let mut request = RtspRequest::new(Method::Setup);
        request.headers.insert(
            names::TRANSPORT,
            format!(
                "RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;\
                 control_port={control_port};timing_port={timing_port}"
            ),
        );

        let response = self.exchange(request)?;
        let mut result = SetupResult::default();

        if response.status != STATUS_OK {
            return Ok((response.status, result));
        }

        let Some(session) = response.headers.get(names::SESSION) else {
            return Ok((ERR_SETUP_SESSION_MISSING, result));
        };
        if session.is_empty() {
            return Ok((ERR_SETUP_SESSION_EMPTY, result));
        }
        self.remote_session_id = session.split(';').next().unwrap_or(session).to_string();

        let Some(transport) = response.headers.get(names::TRANSPORT) else {
            return Ok((ERR_SETUP_TRANSPORT_MISSING, result));
        };
        for part in transport.split(';') {
            if let Some((key, value)) = part.split_once('=') {
                match key.trim() {
                    "server_port" => result.server_port = value.parse().unwrap_or(0),
                    "control_port" => result.control_port = value.parse().unwrap_or(0),
                    "timing_port" => result.timing_port = value.parse().unwrap_or(0),
                    _ => {}
                }
            }
        }

        if let Some(latency) = response.headers.get(names::AUDIO_LATENCY) {
            result.audio_latency = latency.trim().parse().ok();
        }
        if let Some(jack) = response.headers.get(names::AUDIO_JACK_STATUS) {
            result.jack_status = Some(if jack.trim() == "disconnected" {
                AudioJackStatus::Disconnected
            } else {
                AudioJackStatus::Connected
            });
        }

        Ok((response.status, result))
    }

    /// Send RECORD with the stream position. A 200 establishes the session
    /// (TEARDOWN becomes mandatory on close). Returns the status and any
    /// refined audio latency.
    ///
    /// # Errors
    ///
    /// Returns `RtspError` on transport failure.
    pub fn do_record(
        &mut self,
        rtp_seq_num: u16,
        rtp_time: u32,
    ) -> Result<(i32, Option<u32>), RtspError> {
        let mut request = RtspRequest::new(Method::Record);
        request.headers.insert(names::RANGE, "npt=0-");
        request.headers.insert(
            names::RTP_INFO,
            format!("seq={rtp_seq_num};rtptime={rtp_time}"),
        );

        let response = self.exchange(request)?;

        if response.status != STATUS_OK {
            return Ok((response.status, None));
        }

        let latency = response
            .headers
            .get(names::AUDIO_LATENCY)
            .and_then(|v| v.trim().parse().ok());

        self.teardown_required = true;
        Ok((response.status, latency))
    }

    /// Send FLUSH with the stream position.
    ///
    /// # Errors
    ///
    /// Returns `RtspError` on transport failure.
    pub fn do_flush(&mut self, rtp_seq_num: u16, rtp_time: u32) -> Result<i32, RtspError> {
        let mut request = RtspRequest::new(Method::Flush);
        request.headers.insert(
            names::RTP_INFO,
            format!("seq={rtp_seq_num};rtptime={rtp_time}"),
        );

        let response = self.exchange(request)?;
        Ok(response.status)
    }

    /// Send TEARDOWN if a session was established; otherwise a no-op 200.
    ///
    /// # Errors
    ///
    /// Returns `RtspError` on transport failure.
    pub fn do_teardown(&mut self) -> Result<i32, RtspError> {
        if !self.teardown_required {
            return Ok(STATUS_OK);
        }

        let response = self.exchange(RtspRequest::new(Method::Teardown))?;
        self.teardown_required = false;
        Ok(response.status)
    }

    /// Read a named parameter (`text/parameters` body).
    ///
    /// # Errors
    ///
    /// Returns `RtspError` on transport failure.
    pub fn do_get_parameter(&mut self, name: &str) -> Result<(i32, Option<String>), RtspError> {
        let mut request = RtspRequest::new(Method::GetParameter);
        request.set_body(format!("{name}\r\n"), "text/parameters");

        let response = self.exchange(request)?;
        let value = (response.status == STATUS_OK)
            .then(|| response.parameter(name))
            .flatten();
        Ok((response.status, value))
    }

    /// Write a named parameter (`text/parameters` body).
    ///
    /// # Errors
    ///
    /// Returns `RtspError` on transport failure.
    pub fn do_set_parameter(&mut self, name: &str, value: &str) -> Result<i32, RtspError> {
        let mut request = RtspRequest::new(Method::SetParameter);
        request.set_body(format!("{name}: {value}\r\n"), "text/parameters");

        let response = self.exchange(request)?;
        Ok(response.status)
    }

    /// Write a binary parameter body (DMAP metadata, artwork) tagged with
    /// the RTP time it applies to.
    ///
    /// # Errors
    ///
    /// Returns `RtspError` on transport failure.
    pub fn do_set_parameter_data(
        &mut self,
        content_type: &str,
        body: &[u8],
        rtp_time: u32,
    ) -> Result<i32, RtspError> {
        let mut request = RtspRequest::new(Method::SetParameter);
        request.set_body(body.to_vec(), content_type);
        request
            .headers
            .insert(names::RTP_INFO, format!("rtptime={rtp_time}"));

        let response = self.exchange(request)?;
        Ok(response.status)
    }

    fn request_uri(&self) -> String {
        if self.local_session_id == 0 {
            "*".to_string()
        } else {
            match self.stream.local_addr() {
                Ok(addr) => format!("rtsp://{}/{}", addr.ip(), self.local_session_id),
                Err(_) => "*".to_string(),
            }
        }
    }

    /// Stamp the shared headers, transmit, and read one response.
    fn exchange(&mut self, mut request: RtspRequest) -> Result<RtspResponse, RtspError> {
        let uri = self.request_uri();

        request.headers.insert(names::USER_AGENT, &*self.user_agent);
        request
            .headers
            .insert(names::CSEQ, (self.sequence + 1).to_string());
        request
            .headers
            .insert(names::ACTIVE_REMOTE, self.remote_control_id.to_string());
        request
            .headers
            .insert(names::CLIENT_INSTANCE, format!("{:016X}", self.dacp_id));
        request
            .headers
            .insert(names::DACP_ID, format!("{:016X}", self.dacp_id));
        if !self.remote_session_id.is_empty() {
            request
                .headers
                .insert(names::SESSION, &*self.remote_session_id);
        }
        if self.digest.is_armed() {
            request.headers.insert(
                names::AUTHORIZATION,
                self.digest.authorization(request.method.as_str(), &uri),
            );
        }

        let wire = request.encode(&uri);
        trace!(
            method = request.method.as_str(),
            uri = %uri,
            "rtsp request:\n{}",
            String::from_utf8_lossy(&wire)
        );
        self.stream.write_all(&wire)?;

        let raw = self.receive_response()?;
        trace!("rtsp response:\n{}", String::from_utf8_lossy(&raw));

        // sequence advances only after a complete response arrives
        self.sequence += 1;

        let response = RtspResponse::parse(&raw)?;

        if let Some(cseq) = response.headers.cseq() {
            if cseq != self.sequence {
                warn!(
                    expected = self.sequence,
                    received = cseq,
                    "rtsp response sequence mismatch"
                );
            }
        }

        if let Some(challenge) = response.headers.get(names::WWW_AUTHENTICATE) {
            self.digest.absorb_challenge(challenge)?;
        }

        Ok(response)
    }

    /// Read one byte at a time until the header terminator, then
    /// `Content-Length` body bytes.
    fn receive_response(&mut self) -> Result<Vec<u8>, RtspError> {
        let mut buffer = Vec::with_capacity(512);
        let mut last_four = 0u32;
        let mut octet = [0u8; 1];

        loop {
            let n = self.stream.read(&mut octet)?;
            if n == 0 {
                return Err(RtspError::ConnectionClosed);
            }
            buffer.push(octet[0]);
            last_four = (last_four << 8) | u32::from(octet[0]);
            if last_four == 0x0D0A_0D0A {
                break;
            }
        }

        let head = String::from_utf8_lossy(&buffer);
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case(names::CONTENT_LENGTH)
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);

        if content_length > 0 {
            let mark = buffer.len();
            buffer.resize(mark + content_length, 0);
            self.stream.read_exact(&mut buffer[mark..])?;
        }

        Ok(buffer)
    }
}
