//! RTP packet types, timestamps, and the resend history buffer

pub mod packet;
pub mod packet_buffer;
pub mod timing;

pub use packet::{
    data_header_sequence, encode_resend_response, write_data_header, PayloadType, ResendRequest,
    RtpDecodeError, SyncPacket, TimingPacket, RTP_BASE_HEADER_SIZE, RTP_DATA_HEADER_SIZE,
    RTP_RESEND_REQUEST_SIZE, RTP_SYNC_PACKET_SIZE, RTP_TIMING_PACKET_SIZE,
};
pub use packet_buffer::{PacketBuffer, Slot};
pub use timing::NtpTimestamp;
