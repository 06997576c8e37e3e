//! RAOP streaming engine
//!
//! Owns the session key material, the dual (secured/clear) packet streams,
//! the paced sender thread, and the control/timing UDP endpoints. Producers
//! feed PCM through the engine's `OutputSink::write`; attached devices
//! receive RTP data packets paced against the wall clock, periodic sync
//! packets on their control port, and NTP-style reflections of their timing
//! requests.

mod target;

pub use target::StreamTarget;

use crate::audio::alac::{AlacAdapter, ALAC_HEADROOM};
use crate::audio::OutputSink;
use crate::error::{EngineError, RaopCastError};
use crate::protocol::crypto::{base64_unpadded, RaopRsaKey, StreamCipher};
use crate::protocol::rtp::{
    data_header_sequence, encode_resend_response, write_data_header, NtpTimestamp, PacketBuffer,
    PayloadType, ResendRequest, SyncPacket, TimingPacket, RTP_BASE_HEADER_SIZE,
    RTP_DATA_HEADER_SIZE, RTP_RESEND_REQUEST_SIZE, RTP_TIMING_PACKET_SIZE,
};
use crate::types::{OutputFormat, OutputInterval};
use rand::RngCore;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Samples per channel per RTP packet.
pub const RAOP_FRAMES_PER_PACKET: u32 = 352;
/// Canonical sample rate.
pub const RAOP_SAMPLES_PER_SECOND: u32 = 44_100;
/// Canonical bit depth.
pub const RAOP_BITS_PER_SAMPLE: u32 = 16;
/// Canonical channel count.
pub const RAOP_CHANNEL_COUNT: u32 = 2;

/// PCM bytes in a full packet: 352 frames x 2 ch x 2 bytes.
pub const RAOP_PACKET_MAX_DATA_SIZE: usize =
    (RAOP_FRAMES_PER_PACKET * (RAOP_BITS_PER_SAMPLE / 8) * RAOP_CHANNEL_COUNT) as usize;

/// Full packet slot size: RTP header + PCM + ALAC escape headroom.
const RAOP_PACKET_MAX_SIZE: usize =
    RTP_DATA_HEADER_SIZE + RAOP_PACKET_MAX_DATA_SIZE + ALAC_HEADROOM;

/// Unsent slots retained per stream (about 2 s of audio).
const PACKET_BUFFER_COUNT: u16 = 250;
/// Sent slots retained for resends (about 4 s of audio).
const PACKET_MEMORY_COUNT: u16 = 500;

/// First local port probed for the control socket.
const LOCAL_CONTROL_PORT: u16 = 6001;
/// First local port probed for the timing socket.
const LOCAL_TIMING_PORT: u16 = 6002;

/// Samples subtracted from the sync packet's playout timestamp
/// (about 1.75 s at 44.1 kHz).
const SYNC_LATENCY_SAMPLES: u32 = 77_175;

/// Microseconds between periodic sync packets.
const SYNC_INTERVAL_MICROS: u64 = 1_000_000;

/// Receives a notification for every data packet actually sent; carries the
/// pre-pad byte count so upstream progress reporting stays correct.
pub trait OutputObserver: Send + Sync {
    /// `length` is the producer-side size of the packet just emitted.
    fn on_bytes_output(&self, length: usize);
}

/// Session state guarded by the engine mutex.
struct EngineState {
    /// Producer-side RTP sequence (wraps)
    rtp_seq_incoming: u16,
    /// Sender-side RTP sequence (wraps)
    rtp_seq_outgoing: u16,
    /// Producer-side RTP time, one tick per frame (wraps)
    rtp_time_incoming: u32,
    /// Sender-side RTP time (wraps)
    rtp_time_outgoing: u32,
    /// Synchronization source id for the session
    ssrc: u32,
    /// Session cipher; `None` before the first `reinit`
    cipher: Option<StreamCipher>,
    /// Base64 of the RSA-wrapped AES key, padding stripped
    encoded_key: String,
    /// Base64 of the AES IV, padding stripped
    encoded_iv: String,
    /// AES-encrypted packet stream
    rtp_data_secured: PacketBuffer,
    /// Cleartext packet stream
    rtp_data_clear: PacketBuffer,
    /// ALAC encoder, rebuilt per session
    alac: Option<AlacAdapter>,
    /// Attached speaker endpoints
    targets: Vec<Arc<StreamTarget>>,
    /// Wall clock when the marker packet was sent
    first_data_time: Option<Instant>,
    /// Monotonic frames sent this session
    samples_written: i64,
    is_first_data_packet: bool,
    is_first_sync_packet: bool,
    last_stream_sync: Option<Instant>,
    last_clock_sync: Option<Instant>,
    /// Largest speaker-reported playback latency, in samples
    audio_latency: u32,
    /// Scratch for building the padded PCM packet
    pcm_scratch: Vec<u8>,
    /// Scratch for the ALAC payload before encryption
    alac_scratch: Vec<u8>,
}

/// The RAOP streaming engine. One instance serves every attached speaker.
pub struct RaopEngine {
    state: Mutex<EngineState>,
    rsa_key: RaopRsaKey,
    data_socket: UdpSocket,
    control_socket: UdpSocket,
    timing_socket: UdpSocket,
    control_port: u16,
    timing_port: u16,
    observer: Arc<dyn OutputObserver>,
    stop_sending: Arc<AtomicBool>,
    stop_reactor: Arc<AtomicBool>,
    sender_thread: Mutex<Option<JoinHandle<()>>>,
    reactor_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Bind a UDP socket on the first free port at or above `port`.
fn bind_next_available_port(port: u16) -> Result<UdpSocket, EngineError> {
    let mut candidate = port;
    loop {
        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, candidate)) {
            Ok(socket) => return Ok(socket),
            Err(_) if candidate < u16::MAX => candidate += 1,
            Err(_) => return Err(EngineError::NoLocalPort(port)),
        }
    }
}

impl RaopEngine {
    /// The engine's canonical PCM format: 44100 Hz, 16-bit, stereo.
    #[must_use]
    pub fn output_format() -> OutputFormat {
        OutputFormat::new(
            RAOP_SAMPLES_PER_SECOND,
            (RAOP_BITS_PER_SAMPLE / 8) as u16,
            RAOP_CHANNEL_COUNT as u16,
        )
    }

    /// Microseconds of audio represented by `samples` frames.
    #[must_use]
    pub fn samples_to_micros(samples: i64) -> i64 {
        (samples * 1_000_000) / i64::from(RAOP_SAMPLES_PER_SECOND)
    }

    /// Milliseconds of audio represented by `samples` frames.
    #[must_use]
    pub fn samples_to_millis(samples: i64) -> i64 {
        (samples * 1000) / i64::from(RAOP_SAMPLES_PER_SECOND)
    }

    /// Create the engine: loads the RAOP public key, binds the data,
    /// control (6001+), and timing (6002+) sockets, and starts the reactor
    /// thread for inbound control and timing traffic.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` when the key fails to load or no local UDP
    /// port can be bound.
    pub fn new(observer: Arc<dyn OutputObserver>) -> Result<Arc<Self>, RaopCastError> {
        let rsa_key = RaopRsaKey::load()?;

        let data_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(EngineError::from)?;
        let control_socket = bind_next_available_port(LOCAL_CONTROL_PORT)?;
        let timing_socket = bind_next_available_port(LOCAL_TIMING_PORT)?;

        control_socket
            .set_nonblocking(true)
            .map_err(EngineError::from)?;
        timing_socket
            .set_nonblocking(true)
            .map_err(EngineError::from)?;

        let control_port = control_socket.local_addr().map_err(EngineError::from)?.port();
        let timing_port = timing_socket.local_addr().map_err(EngineError::from)?.port();

        let engine = Arc::new(Self {
            state: Mutex::new(EngineState {
                rtp_seq_incoming: 0,
                rtp_seq_outgoing: 0,
                rtp_time_incoming: 0,
                rtp_time_outgoing: 0,
                ssrc: 0,
                cipher: None,
                encoded_key: String::new(),
                encoded_iv: String::new(),
                rtp_data_secured: PacketBuffer::new(
                    RAOP_PACKET_MAX_SIZE,
                    PACKET_BUFFER_COUNT,
                    PACKET_MEMORY_COUNT,
                ),
                rtp_data_clear: PacketBuffer::new(
                    RAOP_PACKET_MAX_SIZE,
                    PACKET_BUFFER_COUNT,
                    PACKET_MEMORY_COUNT,
                ),
                alac: None,
                targets: Vec::new(),
                first_data_time: None,
                samples_written: 0,
                is_first_data_packet: true,
                is_first_sync_packet: true,
                last_stream_sync: None,
                last_clock_sync: None,
                audio_latency: 11_025,
                pcm_scratch: vec![0u8; RAOP_PACKET_MAX_DATA_SIZE],
                alac_scratch: vec![0u8; RAOP_PACKET_MAX_DATA_SIZE + ALAC_HEADROOM],
            }),
            rsa_key,
            data_socket,
            control_socket,
            timing_socket,
            control_port,
            timing_port,
            observer,
            stop_sending: Arc::new(AtomicBool::new(true)),
            stop_reactor: Arc::new(AtomicBool::new(false)),
            sender_thread: Mutex::new(None),
            reactor_thread: Mutex::new(None),
        });

        let reactor = Arc::clone(&engine);
        let handle = std::thread::Builder::new()
            .name("raop-reactor".into())
            .spawn(move || reactor.reactor_loop())
            .map_err(EngineError::from)?;
        *engine.reactor_thread.lock().expect("engine lock poisoned") = Some(handle);

        Ok(engine)
    }

    /// Local control port advertised in SETUP.
    #[must_use]
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Local timing port advertised in SETUP.
    #[must_use]
    pub fn timing_port(&self) -> u16 {
        self.timing_port
    }

    /// The base64 (padding-stripped) RSA-wrapped session key and IV for
    /// ANNOUNCE. Empty strings before `reinit`.
    #[must_use]
    pub fn encoded_keys(&self) -> (String, String) {
        let state = self.state.lock().expect("engine lock poisoned");
        (state.encoded_key.clone(), state.encoded_iv.clone())
    }

    /// Current producer-side stream position (sequence, rtp time).
    #[must_use]
    pub fn incoming_position(&self) -> (u16, u32) {
        let state = self.state.lock().expect("engine lock poisoned");
        (state.rtp_seq_incoming, state.rtp_time_incoming)
    }

    /// Current sender-side stream position (sequence, rtp time).
    #[must_use]
    pub fn outgoing_position(&self) -> (u16, u32) {
        let state = self.state.lock().expect("engine lock poisoned");
        (state.rtp_seq_outgoing, state.rtp_time_outgoing)
    }

    /// Session cipher for stream-equivalence checks.
    #[cfg(test)]
    pub(crate) fn session_cipher(&self) -> Option<StreamCipher> {
        self.state.lock().expect("engine lock poisoned").cipher.clone()
    }

    /// Record a speaker-reported playback latency. The engine keeps the
    /// largest value seen this session for the `latency` calculation.
    pub fn note_audio_latency(&self, samples: u32) {
        let mut state = self.state.lock().expect("engine lock poisoned");
        if samples > state.audio_latency {
            state.audio_latency = samples;
        }
    }

    /// Initialize a new streaming session: fresh AES key and IV (wrapped
    /// and encoded for ANNOUNCE), random starting sequence/time/ssrc, reset
    /// packet buffers and counters, and a fresh ALAC encoder.
    ///
    /// `interval` is translated by the difference between the old and new
    /// RTP time so progress metadata survives the re-key.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` when key wrapping fails.
    pub fn reinit(&self, interval: &mut OutputInterval) -> Result<(), RaopCastError> {
        self.stop();

        let mut rng = rand::thread_rng();

        let mut key = [0u8; 16];
        rng.fill_bytes(&mut key);
        let wrapped = self.rsa_key.encrypt_oaep(&key)?;
        let encoded_key = base64_unpadded(&wrapped);

        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut iv);
        let encoded_iv = base64_unpadded(&iv);

        let seq = (rng.next_u32() & 0xFFFF) as u16;
        let rtp_time = rng.next_u32();
        let ssrc = rng.next_u32();

        let mut state = self.state.lock().expect("engine lock poisoned");

        // keep progress metadata aligned with the new stream clock
        if interval.0 != interval.1 {
            let delta = rtp_time.wrapping_sub(state.rtp_time_incoming);
            interval.0 = interval.0.wrapping_add(delta);
            interval.1 = interval.1.wrapping_add(delta);
        }

        state.cipher = Some(StreamCipher::new(key, iv));
        state.encoded_key = encoded_key;
        state.encoded_iv = encoded_iv;
        state.rtp_seq_incoming = seq;
        state.rtp_seq_outgoing = seq;
        state.rtp_time_incoming = rtp_time;
        state.rtp_time_outgoing = rtp_time;
        state.ssrc = ssrc;
        state.first_data_time = None;
        state.last_stream_sync = None;
        state.last_clock_sync = None;
        state.is_first_data_packet = true;
        state.is_first_sync_packet = true;
        state.rtp_data_secured.reset();
        state.rtp_data_clear.reset();
        state.targets.clear();
        state.samples_written = 0;
        state.alac = Some(AlacAdapter::new(
            RAOP_SAMPLES_PER_SECOND,
            RAOP_CHANNEL_COUNT,
            RAOP_FRAMES_PER_PACKET,
        ));

        debug!(seq, rtp_time, ssrc, "engine session initialized");
        Ok(())
    }

    /// Convert a track length and play offset (both in milliseconds) into
    /// the RTP-timestamp interval of the current track, relative to the
    /// producer-side stream time.
    #[must_use]
    pub fn output_interval(&self, length_ms: i64, offset_ms: i64) -> OutputInterval {
        let state = self.state.lock().expect("engine lock poisoned");
        let rtp_time = state.rtp_time_incoming;

        let length_samples =
            ((length_ms * i64::from(RAOP_SAMPLES_PER_SECOND)) / 1000) as u32;
        let offset_samples =
            ((offset_ms * i64::from(RAOP_SAMPLES_PER_SECOND)) / 1000) as u32;

        let begin = rtp_time.wrapping_sub(offset_samples);
        let end = rtp_time.wrapping_add(length_samples.wrapping_sub(offset_samples));
        (begin, end)
    }

    /// Attach a negotiated speaker endpoint. Forces a sync packet so the
    /// newcomer can align its clock.
    pub fn attach(&self, target: Arc<StreamTarget>) {
        let mut state = self.state.lock().expect("engine lock poisoned");
        if !state
            .targets
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &target))
        {
            state.targets.push(target);
            state.is_first_sync_packet = true;
        }
    }

    /// Detach a speaker endpoint. Stops the sender when the last one goes.
    pub fn detach(&self, target: &Arc<StreamTarget>) {
        let mut state = self.state.lock().expect("engine lock poisoned");
        state.targets.retain(|existing| !Arc::ptr_eq(existing, target));
        let empty = state.targets.is_empty();
        drop(state);

        if empty {
            self.stop();
        }
    }

    /// Whether any attached target is still open.
    #[must_use]
    pub fn any_target_open(&self) -> bool {
        let state = self.state.lock().expect("engine lock poisoned");
        state.targets.iter().any(|t| t.is_open())
    }

    /// Drop closed devices from the attachment list.
    pub fn flush_targets(&self) {
        let mut state = self.state.lock().expect("engine lock poisoned");
        state.targets.retain(|t| t.is_open());
    }

    /// Stop the stream and rewind: producer counters snap back to the
    /// sender's position, buffers empty, the sample clock restarts. Open
    /// devices keep their sessions (the caller flushes them over RTSP).
    pub fn reset_stream(&self) {
        self.stop();

        let mut state = self.state.lock().expect("engine lock poisoned");
        state.targets.retain(|t| t.is_open());
        state.first_data_time = None;
        state.last_stream_sync = None;
        state.last_clock_sync = None;
        state.is_first_data_packet = true;
        state.is_first_sync_packet = true;
        state.rtp_seq_incoming = state.rtp_seq_outgoing;
        state.rtp_time_incoming = state.rtp_time_outgoing;
        state.rtp_data_secured.reset();
        state.rtp_data_clear.reset();
        state.samples_written = 0;
    }

    /// Stop the sender thread (idempotent).
    pub fn stop(&self) {
        self.stop_sending.store(true, Ordering::SeqCst);
        let handle = self
            .sender_thread
            .lock()
            .expect("engine lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Start the sender thread (called on the first write of a session).
    fn start(self: &Arc<Self>) {
        self.stop_sending.store(false, Ordering::SeqCst);
        let engine = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("raop-sender".into())
            .spawn(move || engine.sender_loop());
        match handle {
            Ok(handle) => {
                *self.sender_thread.lock().expect("engine lock poisoned") = Some(handle);
            }
            Err(e) => warn!(error = %e, "failed to start sender thread"),
        }
    }

    /// Shut down both threads. Called by the manager on teardown.
    pub fn shutdown(&self) {
        self.stop();
        self.stop_reactor.store(true, Ordering::SeqCst);
        let handle = self
            .reactor_thread
            .lock()
            .expect("engine lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Produce one packet into both streams from up to 1408 bytes of PCM.
    ///
    /// Short buffers are padded with silence (logged); the header is
    /// stamped with the producer-side sequence/time which then advance by
    /// one packet / `frame_count` ticks. The first write of a session
    /// starts the sender thread.
    fn write_packet(self: &Arc<Self>, buffer: &[u8]) -> Result<(), RaopCastError> {
        if buffer.is_empty() || buffer.len() > RAOP_PACKET_MAX_DATA_SIZE {
            return Err(EngineError::PacketTooLarge(buffer.len(), RAOP_PACKET_MAX_DATA_SIZE).into());
        }

        let mut guard = self.state.lock().expect("engine lock poisoned");
        let state = &mut *guard;

        if state.alac.is_none() || state.cipher.is_none() {
            return Err(EngineError::NotInitialized.into());
        }

        let original_size = buffer.len();

        let pcm: &[u8] = if original_size < RAOP_PACKET_MAX_DATA_SIZE {
            warn!(
                bytes = original_size,
                padding = RAOP_PACKET_MAX_DATA_SIZE - original_size,
                millis = Self::samples_to_micros(
                    ((RAOP_PACKET_MAX_DATA_SIZE - original_size) / 4) as i64
                ) as f64
                    / 1000.0,
                "padding short audio segment with silence"
            );
            state.pcm_scratch[..original_size].copy_from_slice(buffer);
            state.pcm_scratch[original_size..].fill(0);
            &state.pcm_scratch
        } else {
            buffer
        };

        // header is identical for both streams
        let mut header = [0u8; RTP_DATA_HEADER_SIZE];
        write_data_header(
            &mut header,
            state.is_first_data_packet,
            state.rtp_seq_incoming,
            state.rtp_time_incoming,
            state.ssrc,
        );

        let alac = state.alac.as_mut().expect("checked above");
        let payload_size = alac.encode(pcm, &mut state.alac_scratch);
        debug_assert!(payload_size > 0 && payload_size <= RAOP_PACKET_MAX_SIZE - RTP_DATA_HEADER_SIZE);

        let frame_count = (pcm.len() / RaopEngine::output_format().frame_size()) as u16;
        let packet_size = RTP_DATA_HEADER_SIZE + payload_size;

        let cipher = state.cipher.as_ref().expect("checked above").clone();
        let payload = &state.alac_scratch[..payload_size];

        {
            let slot = state.rtp_data_clear.next_available()?;
            slot.packet_data[..RTP_DATA_HEADER_SIZE].copy_from_slice(&header);
            slot.packet_data[RTP_DATA_HEADER_SIZE..packet_size].copy_from_slice(payload);
            slot.packet_size = packet_size;
            slot.payload_size = payload_size;
            slot.original_size = original_size;
            slot.frame_count = frame_count;
        }

        {
            let slot = state.rtp_data_secured.next_available()?;
            slot.packet_data[..RTP_DATA_HEADER_SIZE].copy_from_slice(&header);
            cipher.encrypt_packet(
                payload,
                &mut slot.packet_data[RTP_DATA_HEADER_SIZE..packet_size],
            );
            slot.packet_size = packet_size;
            slot.payload_size = payload_size;
            slot.original_size = original_size;
            slot.frame_count = frame_count;
        }

        state.rtp_seq_incoming = state.rtp_seq_incoming.wrapping_add(1);
        state.rtp_time_incoming = state.rtp_time_incoming.wrapping_add(u32::from(frame_count));

        let start_sender = state.is_first_data_packet;
        state.is_first_data_packet = false;
        drop(guard);

        if start_sender {
            self.start();
        }
        Ok(())
    }

    /// Sender thread: sync packets first and once a second, data packets
    /// paced to the wall clock, 1 ms sleep when idle.
    fn sender_loop(self: Arc<Self>) {
        while !self.stop_sending.load(Ordering::SeqCst) {
            if let Err(e) = self.sender_iteration() {
                warn!(error = %e, "sender iteration failed");
            }
        }
    }

    fn sender_iteration(&self) -> Result<(), RaopCastError> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("engine lock poisoned");

        let sync_due = state.is_first_sync_packet
            || state
                .last_stream_sync
                .map_or(true, |t| {
                    now.duration_since(t).as_micros() as u64 >= SYNC_INTERVAL_MICROS
                });
        if sync_due {
            self.send_sync_packet(&mut state, now);
        }

        let data_due = !state.targets.is_empty()
            && state.rtp_seq_incoming != state.rtp_seq_outgoing
            && state.first_data_time.map_or(true, |t| {
                now.duration_since(t).as_micros() as i64
                    >= Self::samples_to_micros(state.samples_written)
            });

        if data_due {
            let original_size = self.send_data_packet(&mut state, now)?;
            drop(state);

            // observer runs outside the engine lock
            self.observer.on_bytes_output(original_size);
        } else {
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
        }

        Ok(())
    }

    fn send_sync_packet(&self, state: &mut EngineState, now: Instant) {
        let packet = SyncPacket {
            first: state.is_first_sync_packet,
            ntp_time: NtpTimestamp::now(),
            rtp_time: state.rtp_time_outgoing,
            rtp_time_less_latency: state.rtp_time_outgoing.wrapping_sub(SYNC_LATENCY_SAMPLES),
        };
        let wire = packet.encode();

        for target in &state.targets {
            if !target.is_open() {
                continue;
            }
            if let Err(e) = self.control_socket.send_to(&wire, target.control_addr) {
                warn!(addr = %target.control_addr, error = %e, "sending sync packet");
            }
        }

        state.is_first_sync_packet = false;
        state.last_stream_sync = Some(now);
    }

    /// Send the next pending slot to every open device; returns the
    /// producer-side size for observer notification.
    fn send_data_packet(&self, state: &mut EngineState, now: Instant) -> Result<usize, RaopCastError> {
        // both streams advance in lockstep
        let clear_slot = state.rtp_data_clear.next_buffered()?;
        let clear_packet = clear_slot.packet().to_vec();
        let original_size = clear_slot.original_size;
        let frame_count = clear_slot.frame_count;

        let secured_slot = state.rtp_data_secured.next_buffered()?;
        let secured_packet = secured_slot.packet();

        let first_packet = secured_packet[0] & 0x20 != 0;
        let sequence = data_header_sequence(secured_packet);

        for target in &state.targets {
            if !target.is_open() {
                continue;
            }
            let wire: &[u8] = if target.secured {
                secured_packet
            } else {
                &clear_packet
            };
            if let Err(e) = self.data_socket.send_to(wire, target.audio_addr) {
                warn!(
                    seq = sequence,
                    addr = %target.audio_addr,
                    error = %e,
                    "sending data packet"
                );
            }
        }

        if first_packet {
            state.first_data_time = Some(now);
        }

        state.rtp_seq_outgoing = state.rtp_seq_outgoing.wrapping_add(1);
        state.rtp_time_outgoing = state.rtp_time_outgoing.wrapping_add(u32::from(frame_count));
        state.samples_written += i64::from(frame_count);

        Ok(original_size)
    }

    /// Reactor thread: drains the control and timing sockets, sleeping
    /// briefly when neither is readable.
    fn reactor_loop(self: Arc<Self>) {
        let mut buffer = [0u8; 64];

        while !self.stop_reactor.load(Ordering::SeqCst) {
            let mut idle = true;

            match self.control_socket.recv_from(&mut buffer) {
                Ok((length, sender)) => {
                    idle = false;
                    if let Err(e) = self.handle_control_packet(&buffer[..length], sender) {
                        warn!(error = %e, "control packet handling failed");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => trace!(error = %e, "control socket receive"),
            }

            match self.timing_socket.recv_from(&mut buffer) {
                Ok((length, sender)) => {
                    idle = false;
                    if let Err(e) = self.handle_timing_packet(&buffer[..length], sender) {
                        warn!(error = %e, "timing packet handling failed");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => trace!(error = %e, "timing socket receive"),
            }

            if idle {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    fn handle_control_packet(
        &self,
        packet: &[u8],
        sender: SocketAddr,
    ) -> Result<(), RaopCastError> {
        if packet.len() < RTP_BASE_HEADER_SIZE {
            return Ok(());
        }
        match PayloadType::from_byte(packet[1]) {
            Some(PayloadType::ResendRequest) if packet.len() >= RTP_RESEND_REQUEST_SIZE => {
                let request = ResendRequest::decode(packet).map_err(EngineError::from)?;
                self.handle_resend_request(request, sender);
                Ok(())
            }
            other => {
                trace!(?other, from = %sender, "unhandled control packet");
                Ok(())
            }
        }
    }

    /// Replay `missed_pkt_count` packets starting at `missed_seq_num` from
    /// the requesting device's stream history, each wrapped in a resend
    /// envelope whose sequence field carries the frame count.
    fn handle_resend_request(&self, request: ResendRequest, sender: SocketAddr) {
        debug!(
            from = %sender,
            seq = request.missed_seq_num,
            count = request.missed_pkt_count,
            "resend requested"
        );

        let state = self.state.lock().expect("engine lock poisoned");

        let mut age = state
            .rtp_seq_outgoing
            .wrapping_sub(request.missed_seq_num);

        if age < 1 || age > PACKET_MEMORY_COUNT {
            debug!(
                memory = PACKET_MEMORY_COUNT,
                "requested packets too old to resend"
            );
            return;
        }

        // identify the requesting device by address
        let Some(target) = state.targets.iter().find(|t| {
            t.control_addr.ip() == sender.ip()
                && (t.control_addr.port() == sender.port()
                    || t.audio_addr.port() == sender.port()
                    || t.audio_addr.port().wrapping_add(1) == sender.port())
        }) else {
            debug!(from = %sender, "resend requestor not found among devices");
            return;
        };
        if !target.is_open() {
            debug!(from = %sender, "resend requestor no longer open");
            return;
        }

        let history = if target.secured {
            &state.rtp_data_secured
        } else {
            &state.rtp_data_clear
        };

        let mut missed_seq = request.missed_seq_num;
        let mut remaining = request.missed_pkt_count;

        while remaining > 0 {
            let slot = match history.prev_buffered(age) {
                Ok(slot) => slot,
                Err(e) => {
                    debug!(error = %e, "resend history lookup failed");
                    return;
                }
            };

            let stored_seq = data_header_sequence(slot.packet());
            if stored_seq != missed_seq {
                debug!(
                    wanted = missed_seq,
                    found = stored_seq,
                    "packet not at anticipated position in history"
                );
                return;
            }

            let wire = encode_resend_response(slot.frame_count, slot.packet());
            if let Err(e) = self.control_socket.send_to(&wire, sender) {
                warn!(addr = %sender, error = %e, "sending resend response");
                return;
            }

            age -= 1;
            remaining -= 1;
            missed_seq = missed_seq.wrapping_add(1);
        }
    }

    fn handle_timing_packet(
        &self,
        packet: &[u8],
        sender: SocketAddr,
    ) -> Result<(), RaopCastError> {
        if packet.len() < RTP_BASE_HEADER_SIZE {
            return Ok(());
        }
        if PayloadType::from_byte(packet[1]) != Some(PayloadType::TimingRequest)
            || packet.len() < RTP_TIMING_PACKET_SIZE
        {
            trace!(from = %sender, "unhandled timing packet");
            return Ok(());
        }

        let request = TimingPacket::decode(packet).map_err(EngineError::from)?;

        let now = NtpTimestamp::now();
        let response = TimingPacket::reflect(&request, now);
        self.timing_socket
            .send_to(&response.encode(), sender)
            .map_err(EngineError::from)?;

        // drift bookkeeping
        let mut state = self.state.lock().expect("engine lock poisoned");
        let current = Instant::now();
        if let Some(last) = state.last_clock_sync {
            let between_requests_micros = current.duration_since(last).as_micros() as i64;
            let offset_micros = now.to_unix_micros() - request.send_time.to_unix_micros();

            if between_requests_micros > 3_333_000
                || (offset_micros.abs() > 250_000 && offset_micros.abs() < 10_000_000)
            {
                warn!(
                    between_ms = between_requests_micros as f64 / 1000.0,
                    offset_ms = offset_micros as f64 / 1000.0,
                    "timing drift past threshold"
                );
            } else {
                trace!(
                    between_ms = between_requests_micros as f64 / 1000.0,
                    offset_ms = offset_micros as f64 / 1000.0,
                    "timing request"
                );
            }
        }
        state.last_clock_sync = Some(current);

        Ok(())
    }
}

impl OutputSink for Arc<RaopEngine> {
    fn latency(&self, format: &OutputFormat) -> Result<i64, RaopCastError> {
        if *format != RaopEngine::output_format() {
            return Err(crate::error::AudioError::FormatMismatch {
                expected: RaopEngine::output_format(),
                actual: *format,
            }
            .into());
        }

        let state = self.state.lock().expect("engine lock poisoned");
        let buffer_latency = RaopEngine::samples_to_millis(
            i64::from(PACKET_BUFFER_COUNT) * i64::from(RAOP_FRAMES_PER_PACKET),
        );
        let device_latency = RaopEngine::samples_to_millis(i64::from(state.audio_latency));
        Ok(buffer_latency + device_latency)
    }

    fn buffered(&self) -> usize {
        0
    }

    fn can_write(&self) -> usize {
        let state = self.state.lock().expect("engine lock poisoned");
        if !state.targets.is_empty() && state.rtp_data_secured.can_write() {
            RAOP_PACKET_MAX_DATA_SIZE
        } else {
            0
        }
    }

    fn write(&self, buffer: &[u8]) -> Result<(), RaopCastError> {
        self.write_packet(buffer)
    }

    fn flush(&self) -> Result<(), RaopCastError> {
        self.flush_targets();
        Ok(())
    }

    fn reset(&self) -> Result<(), RaopCastError> {
        self.reset_stream();
        Ok(())
    }
}

impl Drop for RaopEngine {
    fn drop(&mut self) {
        self.stop_sending.store(true, Ordering::SeqCst);
        self.stop_reactor.store(true, Ordering::SeqCst);
    }
}
