//! RAOP RTP packet types
//!
//! All multi-byte fields are network byte order. Payload-type checks mask
//! off the top (marker) bit so packets from senders that fold the marker
//! into the type byte still classify.

use super::timing::NtpTimestamp;
use bytes::{BufMut, BytesMut};

/// RTP data packet header size.
pub const RTP_DATA_HEADER_SIZE: usize = 12;
/// Minimal RTP header (flags, type, sequence).
pub const RTP_BASE_HEADER_SIZE: usize = 4;
/// Sync packet wire size.
pub const RTP_SYNC_PACKET_SIZE: usize = 20;
/// Timing packet wire size.
pub const RTP_TIMING_PACKET_SIZE: usize = 32;
/// Resend request wire size.
pub const RTP_RESEND_REQUEST_SIZE: usize = 8;

/// RAOP RTP payload types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    /// Timing request (speaker -> engine)
    TimingRequest = 0x52,
    /// Timing response (engine -> speaker)
    TimingResponse = 0x53,
    /// Stream sync (engine -> speaker, control channel)
    StreamSync = 0x54,
    /// Resend request (speaker -> engine, control channel)
    ResendRequest = 0x55,
    /// Resend response (engine -> speaker, control channel)
    ResendResponse = 0x56,
    /// Audio data
    StreamData = 0x60,
}

impl PayloadType {
    /// Classify the payload-type byte of a packet.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x7F {
            0x52 => Some(Self::TimingRequest),
            0x53 => Some(Self::TimingResponse),
            0x54 => Some(Self::StreamSync),
            0x55 => Some(Self::ResendRequest),
            0x56 => Some(Self::ResendResponse),
            0x60 => Some(Self::StreamData),
            _ => None,
        }
    }
}

/// Decode errors shared by all packet types
#[derive(Debug, thiserror::Error)]
pub enum RtpDecodeError {
    /// Input shorter than the packet layout requires.
    #[error("buffer too small: need {needed}, have {have}")]
    BufferTooSmall {
        /// Required byte count
        needed: usize,
        /// Provided byte count
        have: usize,
    },

    /// Payload type byte did not match any known packet.
    #[error("unhandled payload type: 0x{0:02X}")]
    UnhandledPayloadType(u8),
}

/// Write the 12-byte data packet header. The first packet of a stream
/// carries the marker (flags `0xA0` instead of `0x80`).
pub fn write_data_header(
    buf: &mut [u8],
    first_packet: bool,
    sequence: u16,
    rtp_time: u32,
    ssrc: u32,
) {
    buf[0] = if first_packet { 0xA0 } else { 0x80 };
    buf[1] = PayloadType::StreamData as u8;
    buf[2..4].copy_from_slice(&sequence.to_be_bytes());
    buf[4..8].copy_from_slice(&rtp_time.to_be_bytes());
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
}

/// Read the sequence number out of an encoded data packet header.
#[must_use]
pub fn data_header_sequence(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[2], packet[3]])
}

/// Stream sync packet, sent on the control channel once a second and
/// before the first data packet of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPacket {
    /// First sync of the session (sets the extension flag bits)
    pub first: bool,
    /// Wall clock at send time
    pub ntp_time: NtpTimestamp,
    /// Stream time of the next data packet
    pub rtp_time: u32,
    /// Stream time less the nominal playout buffer
    pub rtp_time_less_latency: u32,
}

impl SyncPacket {
    /// Encode to the 20-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; RTP_SYNC_PACKET_SIZE] {
        let mut buf = [0u8; RTP_SYNC_PACKET_SIZE];
        buf[0] = if self.first { 0xD0 } else { 0x90 };
        buf[1] = PayloadType::StreamSync as u8;
        buf[2..4].copy_from_slice(&0x0007u16.to_be_bytes());
        buf[4..12].copy_from_slice(&self.ntp_time.encode());
        buf[12..16].copy_from_slice(&self.rtp_time.to_be_bytes());
        buf[16..20].copy_from_slice(&self.rtp_time_less_latency.to_be_bytes());
        buf
    }

    /// Decode from wire form.
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` on short input.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < RTP_SYNC_PACKET_SIZE {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: RTP_SYNC_PACKET_SIZE,
                have: buf.len(),
            });
        }
        Ok(Self {
            first: buf[0] & 0x40 != 0,
            ntp_time: NtpTimestamp::decode(&buf[4..12]),
            rtp_time: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            rtp_time_less_latency: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }
}

/// Timing request/response body. The engine reflects requests: the response
/// reference time is the request's send time, receive and send times are the
/// local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingPacket {
    /// Flag byte copied from the request
    pub flags: u8,
    /// Request (0x52) or response (0x53)
    pub payload_type: PayloadType,
    /// Sequence field (unused by RAOP timing)
    pub sequence: u16,
    /// Reference timestamp
    pub reference_time: NtpTimestamp,
    /// Receive timestamp
    pub received_time: NtpTimestamp,
    /// Send timestamp
    pub send_time: NtpTimestamp,
}

impl TimingPacket {
    /// Decode from the 32-byte wire form.
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` on short input or a non-timing payload type.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < RTP_TIMING_PACKET_SIZE {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: RTP_TIMING_PACKET_SIZE,
                have: buf.len(),
            });
        }
        let payload_type = match PayloadType::from_byte(buf[1]) {
            Some(pt @ (PayloadType::TimingRequest | PayloadType::TimingResponse)) => pt,
            _ => return Err(RtpDecodeError::UnhandledPayloadType(buf[1])),
        };
        Ok(Self {
            flags: buf[0],
            payload_type,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            reference_time: NtpTimestamp::decode(&buf[8..16]),
            received_time: NtpTimestamp::decode(&buf[16..24]),
            send_time: NtpTimestamp::decode(&buf[24..32]),
        })
    }

    /// Build the reflection of a timing request captured at `now`.
    #[must_use]
    pub fn reflect(request: &Self, now: NtpTimestamp) -> Self {
        Self {
            flags: request.flags,
            payload_type: PayloadType::TimingResponse,
            sequence: request.sequence,
            reference_time: request.send_time,
            received_time: now,
            send_time: now,
        }
    }

    /// Encode to the 32-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; RTP_TIMING_PACKET_SIZE] {
        let mut buf = [0u8; RTP_TIMING_PACKET_SIZE];
        buf[0] = self.flags;
        buf[1] = self.payload_type as u8;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        // bytes 4..8 are reserved padding
        buf[8..16].copy_from_slice(&self.reference_time.encode());
        buf[16..24].copy_from_slice(&self.received_time.encode());
        buf[24..32].copy_from_slice(&self.send_time.encode());
        buf
    }
}

/// Resend request received on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendRequest {
    /// First missed sequence number
    pub missed_seq_num: u16,
    /// Number of consecutive missed packets
    pub missed_pkt_count: u16,
}

impl ResendRequest {
    /// Decode from the 8-byte wire form.
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` on short input or wrong payload type.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < RTP_RESEND_REQUEST_SIZE {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: RTP_RESEND_REQUEST_SIZE,
                have: buf.len(),
            });
        }
        if PayloadType::from_byte(buf[1]) != Some(PayloadType::ResendRequest) {
            return Err(RtpDecodeError::UnhandledPayloadType(buf[1]));
        }
        Ok(Self {
            missed_seq_num: u16::from_be_bytes([buf[4], buf[5]]),
            missed_pkt_count: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }

    /// Encode to the 8-byte wire form (used by tests and simulated speakers).
    #[must_use]
    pub fn encode(&self) -> [u8; RTP_RESEND_REQUEST_SIZE] {
        let mut buf = [0u8; RTP_RESEND_REQUEST_SIZE];
        buf[0] = 0x80;
        buf[1] = 0x80 | PayloadType::ResendRequest as u8;
        buf[2..4].copy_from_slice(&1u16.to_be_bytes());
        buf[4..6].copy_from_slice(&self.missed_seq_num.to_be_bytes());
        buf[6..8].copy_from_slice(&self.missed_pkt_count.to_be_bytes());
        buf
    }
}

/// Wrap a stored data packet in the 4-byte resend response envelope.
/// The envelope's sequence field carries the packet's frame count, an
/// encoder-agnostic hint for the receiver's jitter buffer.
#[must_use]
pub fn encode_resend_response(frame_count: u16, packet: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(RTP_BASE_HEADER_SIZE + packet.len());
    buf.put_u8(0x90);
    buf.put_u8(PayloadType::ResendResponse as u8);
    buf.put_u16(frame_count);
    buf.put_slice(packet);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_header_first_packet_flags() {
        let mut buf = [0u8; RTP_DATA_HEADER_SIZE];
        write_data_header(&mut buf, true, 0x1234, 0xAABB_CCDD, 0x0102_0304);
        assert_eq!(buf[0], 0xA0);
        assert_eq!(buf[1], 0x60);
        assert_eq!(&buf[2..4], &[0x12, 0x34]);
        assert_eq!(&buf[4..8], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&buf[8..12], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(data_header_sequence(&buf), 0x1234);

        write_data_header(&mut buf, false, 0, 0, 0);
        assert_eq!(buf[0], 0x80);
    }

    #[test]
    fn sync_packet_layout() {
        let packet = SyncPacket {
            first: true,
            ntp_time: NtpTimestamp {
                seconds: 1,
                fraction: 2,
            },
            rtp_time: 100_000,
            rtp_time_less_latency: 100_000 - 77_175,
        };
        let wire = packet.encode();
        assert_eq!(wire.len(), RTP_SYNC_PACKET_SIZE);
        assert_eq!(wire[0], 0xD0);
        assert_eq!(wire[1], 0x54);
        assert_eq!(&wire[2..4], &[0x00, 0x07]);

        let decoded = SyncPacket::decode(&wire).unwrap();
        assert_eq!(decoded, packet);

        let later = SyncPacket { first: false, ..packet };
        assert_eq!(later.encode()[0], 0x90);
    }

    #[test]
    fn timing_reflection() {
        let request = TimingPacket {
            flags: 0x80,
            payload_type: PayloadType::TimingRequest,
            sequence: 3,
            reference_time: NtpTimestamp::default(),
            received_time: NtpTimestamp::default(),
            send_time: NtpTimestamp {
                seconds: 42,
                fraction: 7,
            },
        };
        let now = NtpTimestamp {
            seconds: 43,
            fraction: 0,
        };
        let response = TimingPacket::reflect(&request, now);
        assert_eq!(response.payload_type, PayloadType::TimingResponse);
        assert_eq!(response.reference_time, request.send_time);
        assert_eq!(response.received_time, now);
        assert_eq!(response.send_time, now);

        let wire = response.encode();
        let back = TimingPacket::decode(&wire).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn resend_request_round_trip() {
        let request = ResendRequest {
            missed_seq_num: 500,
            missed_pkt_count: 3,
        };
        let wire = request.encode();
        assert_eq!(wire.len(), RTP_RESEND_REQUEST_SIZE);
        let back = ResendRequest::decode(&wire).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn resend_envelope_wraps_packet() {
        let packet = [0x80u8, 0x60, 0, 5, 0, 0, 0, 0, 0, 0, 0, 0, 0xAB];
        let wrapped = encode_resend_response(352, &packet);
        assert_eq!(wrapped.len(), RTP_BASE_HEADER_SIZE + packet.len());
        assert_eq!(wrapped[1] & 0x7F, 0x56);
        assert_eq!(u16::from_be_bytes([wrapped[2], wrapped[3]]), 352);
        assert_eq!(&wrapped[4..], &packet);
    }

    #[test]
    fn payload_type_masks_marker_bit() {
        assert_eq!(PayloadType::from_byte(0xD5), Some(PayloadType::ResendRequest));
        assert_eq!(PayloadType::from_byte(0x52), Some(PayloadType::TimingRequest));
        assert_eq!(PayloadType::from_byte(0x7F), None);
    }
}
