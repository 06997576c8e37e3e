//! Wire protocols: RTSP, RTP, SDP, DMAP, and the session crypto

pub mod crypto;
pub mod dmap;
pub mod rtp;
pub mod rtsp;
pub mod sdp;
