//! A scripted RAOP speaker for session tests
//!
//! Accepts RTSP connections, records every request, and answers the way an
//! AirPort-class receiver would: optional digest authentication, optional
//! `Apple-Response` challenge signing, SETUP transport negotiation, and
//! parameter echoes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// One request the speaker received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Default)]
pub struct SpeakerConfig {
    /// Require this password via digest auth
    pub password: Option<String>,
    /// Digest nonce handed out in the 401 challenge
    pub nonce: String,
    /// Sign `Apple-Challenge` headers with this RSA private key
    pub challenge_key: Option<rsa::RsaPrivateKey>,
    /// Sign a wrong value instead, to exercise the mismatch path
    pub corrupt_challenge: bool,
    /// `Audio-Jack-Status` value for SETUP responses
    pub jack_status: Option<String>,
}

pub struct MockSpeaker {
    pub port: u16,
    pub log: Arc<Mutex<Vec<RecordedRequest>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockSpeaker {
    pub fn start(config: SpeakerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        let log = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_log = Arc::clone(&log);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let mut clients: Vec<JoinHandle<()>> = Vec::new();
            while !thread_stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let log = Arc::clone(&thread_log);
                        let config = config.clone();
                        let stop = Arc::clone(&thread_stop);
                        clients.push(std::thread::spawn(move || {
                            serve_client(stream, &log, &config, &stop);
                        }));
                    }
                    Err(_) => std::thread::sleep(Duration::from_millis(5)),
                }
            }
            for client in clients {
                let _ = client.join();
            }
        });

        Self {
            port,
            log,
            stop,
            handle: Some(handle),
        }
    }

    pub fn requests_of(&self, method: &str) -> Vec<RecordedRequest> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MockSpeaker {
    fn drop(&mut self) {
        self.halt();
    }
}

fn serve_client(
    mut stream: TcpStream,
    log: &Arc<Mutex<Vec<RecordedRequest>>>,
    config: &SpeakerConfig,
    stop: &Arc<AtomicBool>,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();

    let mut buffer: Vec<u8> = Vec::new();
    while !stop.load(Ordering::SeqCst) {
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => return,
        }

        while let Some(head_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buffer[..head_end]).into_owned();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.trim()
                        .eq_ignore_ascii_case("Content-Length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);

            let total = head_end + 4 + content_length;
            if buffer.len() < total {
                break; // body not complete yet
            }

            let body = buffer[head_end + 4..total].to_vec();
            buffer.drain(..total);

            let request = parse_head(&head, body);
            let response = respond(&request, config);
            log.lock().unwrap().push(request);

            if stream.write_all(response.as_bytes()).is_err() {
                return;
            }
        }
    }
}

fn parse_head(head: &str, body: Vec<u8>) -> RecordedRequest {
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("").to_string();
    let uri = parts.next().unwrap_or("").to_string();

    let headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    RecordedRequest {
        method,
        uri,
        headers,
        body,
    }
}

fn hex_digest(input: &str, uppercase: bool) -> String {
    md5::compute(input.as_bytes())
        .iter()
        .map(|byte| {
            if uppercase {
                format!("{byte:02X}")
            } else {
                format!("{byte:02x}")
            }
        })
        .collect()
}

fn authorized(request: &RecordedRequest, password: &str, nonce: &str) -> bool {
    let Some(auth) = request.header("Authorization") else {
        return false;
    };
    let Some(response) = auth
        .split("response=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
    else {
        return false;
    };

    let uppercase = nonce.chars().any(|c| matches!(c, 'A'..='F'));
    let ha1 = hex_digest(&format!("iTunes:raop:{password}"), uppercase);
    let ha2 = hex_digest(&format!("{}:{}", request.method, request.uri), uppercase);
    let expected = hex_digest(&format!("{ha1}:{nonce}:{ha2}"), uppercase);

    response == expected
}

/// Apply the RSA private operation to a PKCS#1 v1.5 type-1 block holding
/// `payload`, like a speaker signing the Apple challenge.
fn sign_challenge(key: &rsa::RsaPrivateKey, payload: &[u8]) -> Vec<u8> {
    use rsa::traits::{PrivateKeyParts, PublicKeyParts};
    use rsa::BigUint;

    let k = key.size();
    let mut block = vec![0u8; k];
    block[1] = 0x01;
    for b in block.iter_mut().take(k - payload.len() - 1).skip(2) {
        *b = 0xFF;
    }
    block[k - payload.len() - 1] = 0x00;
    block[k - payload.len()..].copy_from_slice(payload);

    let m = BigUint::from_bytes_be(&block);
    let c = m.modpow(key.d(), key.n());
    let bytes = c.to_bytes_be();
    let mut signed = vec![0u8; k - bytes.len()];
    signed.extend_from_slice(&bytes);
    signed
}

fn respond(request: &RecordedRequest, config: &SpeakerConfig) -> String {
    let cseq = request.header("CSeq").unwrap_or("0").to_string();

    if let Some(password) = &config.password {
        if !authorized(request, password, &config.nonce) {
            return format!(
                "RTSP/1.0 401 Unauthorized\r\nCSeq: {cseq}\r\n\
                 WWW-Authenticate: Digest realm=\"raop\", nonce=\"{}\"\r\n\r\n",
                config.nonce
            );
        }
    }

    let mut extra = String::new();
    match request.method.as_str() {
        "OPTIONS" => {
            if let (Some(key), Some(challenge)) =
                (&config.challenge_key, request.header("Apple-Challenge"))
            {
                let mut padded = challenge.to_string();
                while padded.len() % 4 != 0 {
                    padded.push('=');
                }
                let mut nonce = BASE64.decode(padded).unwrap();
                if config.corrupt_challenge {
                    nonce[0] ^= 0xFF;
                }
                let signed = sign_challenge(key, &nonce);
                extra.push_str(&format!("Apple-Response: {}\r\n", BASE64.encode(signed)));
            }
            extra.push_str("Public: ANNOUNCE, SETUP, RECORD, FLUSH, TEARDOWN\r\n");
        }
        "SETUP" => {
            extra.push_str("Session: DEADBEEF\r\n");
            extra.push_str(
                "Transport: RTP/AVP/UDP;unicast;mode=record;\
                 server_port=53561;control_port=53562;timing_port=53563\r\n",
            );
            extra.push_str("Audio-Latency: 11025\r\n");
            if let Some(jack) = &config.jack_status {
                extra.push_str(&format!("Audio-Jack-Status: {jack}\r\n"));
            }
        }
        "RECORD" => {
            extra.push_str("Audio-Latency: 11025\r\n");
        }
        "GET_PARAMETER" => {
            let body = "volume: -20.000000\r\n";
            return format!(
                "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\
                 Content-Type: text/parameters\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
        }
        _ => {}
    }

    format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n{extra}\r\n")
}
