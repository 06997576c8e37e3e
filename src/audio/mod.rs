//! Audio pipeline: staging buffer, format conversion, ALAC encoding

pub mod alac;
pub mod output_buffer;
pub mod reformatter;

pub use alac::AlacAdapter;
pub use output_buffer::OutputBuffer;
pub use reformatter::Reformatter;

use crate::error::RaopCastError;
use crate::types::OutputFormat;

/// Downstream consumer of PCM bytes. Implemented by the RAOP engine and by
/// the reformatter (which forwards to the engine). Methods take `&self`;
/// implementations guard their state internally so producers and the sender
/// thread can share a sink.
pub trait OutputSink: Send + Sync {
    /// End-to-end latency in milliseconds for audio written in `format`.
    ///
    /// # Errors
    ///
    /// Fails when `format` differs from the format the sink was built for.
    fn latency(&self, format: &OutputFormat) -> Result<i64, RaopCastError>;

    /// Bytes queued downstream but not yet played.
    fn buffered(&self) -> usize;

    /// Bytes the sink can accept right now. A return of zero means the
    /// caller should back off.
    fn can_write(&self) -> usize;

    /// Deliver PCM bytes. Callers must not exceed `can_write()`.
    ///
    /// # Errors
    ///
    /// Fails on contract violation or downstream failure.
    fn write(&self, buffer: &[u8]) -> Result<(), RaopCastError>;

    /// Push any internally staged data downstream.
    ///
    /// # Errors
    ///
    /// Fails on downstream failure.
    fn flush(&self) -> Result<(), RaopCastError>;

    /// Discard staged data and reset downstream state.
    ///
    /// # Errors
    ///
    /// Fails on downstream failure.
    fn reset(&self) -> Result<(), RaopCastError>;
}
