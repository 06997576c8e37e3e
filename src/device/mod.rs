//! Per-speaker session state machine
//!
//! A device moves Closed -> Tested -> Streaming -> Closed. `test` probes the
//! speaker (and runs the RSA challenge for secured streams), `open` performs
//! ANNOUNCE/SETUP/RECORD and attaches the negotiated endpoints to the
//! engine. Any failure ends the current session; reopening needs fresh
//! sockets.

pub mod manager;

use crate::engine::{RaopEngine, StreamTarget};
use crate::error::RaopCastError;
use crate::protocol::dmap;
use crate::protocol::rtsp::{AudioJackStatus, RtspClient, STATUS_OK};
use crate::types::device::{DeviceType, MD_IMAGE, MD_PROGRESS, MD_TEXT};
use crate::types::{OutputInterval, OutputMetadata};
use rand::Rng;
use std::net::TcpStream;
use std::sync::Arc;
use tracing::{debug, warn};

/// Artwork larger than this is never pushed to a speaker.
const MAX_ARTWORK_BYTES: usize = 256 * 1024;
/// Artwork wider or taller than this is never pushed to a speaker.
const MAX_ARTWORK_DIM: i32 = 1000;

/// One remote speaker and its RTSP session.
pub struct RaopDevice {
    engine: Arc<RaopEngine>,
    rtsp: Option<RtspClient>,
    secured: bool,
    metadata_flags: u8,
    audio_latency: u32,
    device_volume: f32,
    remote_control_id: u32,
    target: Option<Arc<StreamTarget>>,
    password: String,
    user_agent: String,
    dacp_id: u64,
}

impl RaopDevice {
    /// Create a device for a classified type. The remote-control id is
    /// random, nonzero, and stable for the life of the instance.
    #[must_use]
    pub fn new(
        engine: Arc<RaopEngine>,
        device_type: DeviceType,
        user_agent: impl Into<String>,
        dacp_id: u64,
    ) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            engine,
            rtsp: None,
            secured: device_type.secure_stream(),
            metadata_flags: device_type.metadata_flags(),
            audio_latency: 11_025,
            device_volume: 0.0,
            remote_control_id: rng.gen_range(1..=u32::MAX),
            target: None,
            password: String::new(),
            user_agent: user_agent.into(),
            dacp_id,
        }
    }

    /// The DACP correlator routing `Active-Remote` commands here.
    #[must_use]
    pub fn remote_control_id(&self) -> u32 {
        self.remote_control_id
    }

    /// Whether this device's stream is AES encrypted.
    #[must_use]
    pub fn secured(&self) -> bool {
        self.secured
    }

    /// Speaker-reported playback latency in samples.
    #[must_use]
    pub fn audio_latency(&self) -> u32 {
        self.audio_latency
    }

    /// Store the device password for digest authentication.
    pub fn set_password(&mut self, password: impl Into<String>) {
        let password = password.into();
        self.password = password.clone();
        if let Some(rtsp) = self.rtsp.as_mut() {
            rtsp.set_password(password);
        }
    }

    /// Bind a fresh RTSP connection, unless a live one is already attached.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` when the socket options cannot be applied.
    pub fn attach_connection(&mut self, stream: TcpStream) -> Result<(), RaopCastError> {
        if self.rtsp.as_ref().is_some_and(RtspClient::is_ready) {
            return Ok(());
        }
        let mut client = RtspClient::new(
            stream,
            self.user_agent.clone(),
            self.dacp_id,
            self.remote_control_id,
        )?;
        if !self.password.is_empty() {
            client.set_password(self.password.clone());
        }
        self.rtsp = Some(client);
        Ok(())
    }

    /// Probe the speaker with OPTIONS. On the first attempt of a secured
    /// session this includes the RSA challenge. Returns the RTSP status or
    /// a negative challenge sentinel; 401 drives the caller's password loop.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` on transport failure or when no connection
    /// is attached.
    pub fn test(&mut self, first_time: bool) -> Result<i32, RaopCastError> {
        let use_rsa = first_time && self.secured;
        let rsa_key = if use_rsa {
            Some(crate::protocol::crypto::RaopRsaKey::load()?)
        } else {
            None
        };

        let rtsp = self.rtsp.as_mut().ok_or(RaopCastError::Io(
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no rtsp connection"),
        ))?;
        Ok(rtsp.do_options(rsa_key.as_ref())?)
    }

    /// Negotiate the streaming session: ANNOUNCE (with the session keys for
    /// a secured stream), SETUP, RECORD. On success the device's RTP
    /// endpoints attach to the engine and the jack status is returned.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` on transport failure.
    pub fn open(&mut self) -> Result<(i32, AudioJackStatus), RaopCastError> {
        let (key, iv) = if self.secured {
            self.engine.encoded_keys()
        } else {
            (String::new(), String::new())
        };

        let control_port = self.engine.control_port();
        let timing_port = self.engine.timing_port();
        let (seq, time) = self.engine.outgoing_position();

        let rtsp = self.rtsp.as_mut().ok_or(RaopCastError::Io(
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no rtsp connection"),
        ))?;

        let status = rtsp.do_announce(&key, &iv)?;
        if status != STATUS_OK {
            return Ok((status, AudioJackStatus::Connected));
        }

        let (status, setup) = rtsp.do_setup(control_port, timing_port)?;
        if status != STATUS_OK {
            return Ok((status, AudioJackStatus::Connected));
        }
        if let Some(latency) = setup.audio_latency {
            self.audio_latency = latency;
        }
        let jack_status = setup.jack_status.unwrap_or(AudioJackStatus::Connected);

        let (status, record_latency) = rtsp.do_record(seq, time)?;
        if status != STATUS_OK {
            return Ok((status, jack_status));
        }
        if let Some(latency) = record_latency {
            self.audio_latency = latency;
        }

        let peer_ip = rtsp_peer_ip(rtsp)?;
        let target = Arc::new(StreamTarget::new(
            (peer_ip, setup.server_port).into(),
            (peer_ip, setup.control_port).into(),
            (peer_ip, setup.timing_port).into(),
            self.secured,
        ));

        self.engine.note_audio_latency(self.audio_latency);
        self.engine.attach(Arc::clone(&target));
        self.target = Some(target);

        debug!(
            peer = %peer_ip,
            server_port = setup.server_port,
            control_port = setup.control_port,
            timing_port = setup.timing_port,
            latency = self.audio_latency,
            "device streaming"
        );
        Ok((status, jack_status))
    }

    /// Whether the session is live. With `poll_connection` the TCP link is
    /// probed too.
    #[must_use]
    pub fn is_open(&self, poll_connection: bool) -> bool {
        let target_open = self.target.as_ref().is_some_and(|t| t.is_open());
        let rtsp_live = match self.rtsp.as_ref() {
            Some(rtsp) => !poll_connection || rtsp.is_ready(),
            None => false,
        };
        target_open && rtsp_live
    }

    /// Drop buffered audio on the speaker.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` on transport failure.
    pub fn flush(&mut self) -> Result<(), RaopCastError> {
        let (seq, time) = self.engine.outgoing_position();
        if let Some(rtsp) = self.rtsp.as_mut() {
            rtsp.do_flush(seq, time)?;
        }
        Ok(())
    }

    /// End the session: detach from the engine and TEARDOWN if a RECORD
    /// succeeded. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(target) = self.target.take() {
            target.close();
            self.engine.detach(&target);
        }

        if let Some(mut rtsp) = self.rtsp.take() {
            if rtsp.teardown_required() {
                if let Err(e) = rtsp.do_teardown() {
                    warn!(error = %e, "teardown failed");
                }
            }
        }
    }

    /// Pull the speaker's current volume (AV receivers publish theirs).
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` on transport failure.
    pub fn get_volume(&mut self) -> Result<f32, RaopCastError> {
        let rtsp = self.rtsp.as_mut().ok_or(RaopCastError::Io(
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no rtsp connection"),
        ))?;
        let (status, value) = rtsp.do_get_parameter("volume")?;
        if status == STATUS_OK {
            if let Some(volume) = value.and_then(|v| v.parse::<f32>().ok()) {
                self.device_volume = volume;
            }
        }
        Ok(self.device_volume)
    }

    /// Set an absolute volume in dB, clamped to [-100, 0].
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` on transport failure.
    pub fn put_volume(&mut self, volume: f32) -> Result<(), RaopCastError> {
        let clamped = volume.clamp(-100.0, 0.0);
        self.device_volume = clamped;
        self.send_volume(clamped)
    }

    /// Track the master volume. A device already in sync with the previous
    /// master level mirrors `absolute`; a diverged device moves by
    /// `relative` and keeps audible headroom while it converges. At or
    /// below -100 dB the wire value becomes the -144 mute floor.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` on transport failure.
    pub fn set_volume(&mut self, absolute: f32, relative: f32) -> Result<(), RaopCastError> {
        let previous_master = absolute - relative;
        let in_sync = relative == 0.0 || (self.device_volume - previous_master).abs() < 0.5;

        let target = if in_sync {
            absolute.clamp(-100.0, 0.0)
        } else {
            (self.device_volume + relative).clamp(-100.0, -9.0)
        };
        self.device_volume = target;

        let wire = if target <= -100.0 { -144.0 } else { target };
        self.send_volume(wire)
    }

    fn send_volume(&mut self, volume: f32) -> Result<(), RaopCastError> {
        if let Some(rtsp) = self.rtsp.as_mut() {
            rtsp.do_set_parameter("volume", &format!("{volume:.6}"))?;
        }
        Ok(())
    }

    /// Push track text and artwork, each tagged with the producer-side RTP
    /// time so they land on future audio.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` on transport failure.
    pub fn update_metadata(&mut self, meta: &OutputMetadata) -> Result<(), RaopCastError> {
        let (_, rtp_time) = self.engine.incoming_position();

        if self.metadata_flags & MD_TEXT != 0 {
            let listing = dmap::encode_track_listing(meta);
            if let Some(rtsp) = self.rtsp.as_mut() {
                rtsp.do_set_parameter_data("application/x-dmap-tagged", &listing, rtp_time)?;
            }
        }

        if self.metadata_flags & MD_IMAGE != 0 {
            let (width, height) = meta.artwork_dims();
            let oversized = meta.artwork_data.len() > MAX_ARTWORK_BYTES
                || width > MAX_ARTWORK_DIM
                || height > MAX_ARTWORK_DIM;

            if meta.artwork_type == "image/none" {
                if let Some(rtsp) = self.rtsp.as_mut() {
                    rtsp.do_set_parameter_data("image/none", &[], rtp_time)?;
                }
            } else if !meta.artwork_type.is_empty() && !oversized {
                if let Some(rtsp) = self.rtsp.as_mut() {
                    rtsp.do_set_parameter_data(&meta.artwork_type, &meta.artwork_data, rtp_time)?;
                }
            } else if oversized {
                debug!(
                    bytes = meta.artwork_data.len(),
                    width, height, "artwork too large for speaker"
                );
            }
        }

        Ok(())
    }

    /// Push playback progress as `start/now/end` RTP timestamps.
    ///
    /// # Errors
    ///
    /// Returns `RaopCastError` on transport failure.
    pub fn update_progress(&mut self, interval: &OutputInterval) -> Result<(), RaopCastError> {
        if self.metadata_flags & MD_PROGRESS == 0 {
            return Ok(());
        }

        let (_, now) = self.engine.incoming_position();
        let value = format!("{}/{}/{}", interval.0, now, interval.1);
        if let Some(rtsp) = self.rtsp.as_mut() {
            rtsp.do_set_parameter("progress", &value)?;
        }
        Ok(())
    }
}

impl Drop for RaopDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn rtsp_peer_ip(rtsp: &RtspClient) -> Result<std::net::IpAddr, RaopCastError> {
    Ok(rtsp.peer_addr()?.ip())
}
