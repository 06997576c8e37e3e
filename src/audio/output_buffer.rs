//! Bounded PCM staging buffer between the producer and the engine

use super::OutputSink;
use crate::error::{AudioError, RaopCastError};
use crate::types::OutputFormat;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

const BUFFER_CAPACITY: usize = 32 * 1024;

/// Consecutive zero-capacity sink checks tolerated before a drain gives up.
const MAX_SINK_STALLS: u32 = 12;

struct RingState {
    buffer: Vec<u8>,
    available: usize,
    read_index: usize,
    write_index: usize,
}

/// 32 KB circular byte buffer in front of an [`OutputSink`].
///
/// Writes copy into the ring and then opportunistically drain downstream in
/// sink-sized chunks. A sink that reports no capacity for ~12 ms in a row
/// stops the drain so a stalled engine cannot deadlock the producer.
pub struct OutputBuffer {
    state: Mutex<RingState>,
    sink: Arc<dyn OutputSink>,
}

impl OutputBuffer {
    /// Create a buffer draining into `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            state: Mutex::new(RingState {
                buffer: vec![0u8; BUFFER_CAPACITY],
                available: BUFFER_CAPACITY,
                read_index: 0,
                write_index: 0,
            }),
            sink,
        }
    }

    /// End-to-end latency reported by the sink.
    ///
    /// # Errors
    ///
    /// Propagates sink failures.
    pub fn latency(&self, format: &OutputFormat) -> Result<i64, RaopCastError> {
        self.sink.latency(format)
    }

    /// Bytes staged here plus bytes buffered downstream.
    pub fn buffered(&self) -> usize {
        self.try_drain();
        let state = self.state.lock().expect("ring lock poisoned");
        (state.buffer.len() - state.available) + self.sink.buffered()
    }

    /// Free bytes in the ring.
    pub fn can_write(&self) -> usize {
        self.try_drain();
        let state = self.state.lock().expect("ring lock poisoned");
        state.available
    }

    /// Copy `buffer` into the ring, then drain what the sink will take.
    ///
    /// # Errors
    ///
    /// Returns `AudioError::WriteOverflow` when `buffer` exceeds free space.
    pub fn write(&self, buffer: &[u8]) -> Result<(), RaopCastError> {
        {
            let mut state = self.state.lock().expect("ring lock poisoned");

            if buffer.is_empty() || buffer.len() > state.available {
                return Err(AudioError::WriteOverflow {
                    requested: buffer.len(),
                    writable: state.available,
                }
                .into());
            }

            let write_index = state.write_index;
            let capacity = state.buffer.len();
            let tail_room = capacity - write_index;
            if buffer.len() <= tail_room {
                state.buffer[write_index..write_index + buffer.len()].copy_from_slice(buffer);
            } else {
                state.buffer[write_index..].copy_from_slice(&buffer[..tail_room]);
                state.buffer[..buffer.len() - tail_room].copy_from_slice(&buffer[tail_room..]);
            }

            state.available -= buffer.len();
            state.write_index = (write_index + buffer.len()) % capacity;
        }

        self.drain(false)
    }

    /// Drain everything to the sink regardless of chunking, then flush it.
    ///
    /// # Errors
    ///
    /// Propagates sink failures.
    pub fn flush(&self) -> Result<(), RaopCastError> {
        self.drain(true)
    }

    /// Discard staged data and reset the sink.
    ///
    /// # Errors
    ///
    /// Propagates sink failures.
    pub fn reset(&self) -> Result<(), RaopCastError> {
        {
            let mut state = self.state.lock().expect("ring lock poisoned");
            state.available = state.buffer.len();
            state.read_index = 0;
            state.write_index = 0;
        }
        self.sink.reset()
    }

    fn try_drain(&self) {
        // opportunistic resume; failures surface on the next write
        let _ = self.drain(false);
    }

    /// Move data ring → sink while the sink has capacity. With `flushing`,
    /// push remaining data in partial chunks and forward one flush.
    fn drain(&self, flushing: bool) -> Result<(), RaopCastError> {
        let mut stalls = 0u32;
        let mut scratch: Vec<u8> = Vec::new();

        loop {
            let can_read = {
                let state = self.state.lock().expect("ring lock poisoned");
                state.buffer.len() - state.available
            };
            let can_write = self.sink.can_write();

            let eligible = can_read > 0 && ((can_write > 0 && can_read >= can_write) || flushing);
            if !eligible {
                break;
            }

            if can_write == 0 {
                stalls += 1;
                if stalls > MAX_SINK_STALLS {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            stalls = 0;

            let do_write = can_read.min(can_write);

            {
                let state = self.state.lock().expect("ring lock poisoned");
                let capacity = state.buffer.len();
                scratch.clear();
                if state.read_index + do_write <= capacity {
                    scratch.extend_from_slice(
                        &state.buffer[state.read_index..state.read_index + do_write],
                    );
                } else {
                    let part1 = capacity - state.read_index;
                    scratch.extend_from_slice(&state.buffer[state.read_index..]);
                    scratch.extend_from_slice(&state.buffer[..do_write - part1]);
                }
            }

            self.sink.write(&scratch)?;

            let mut state = self.state.lock().expect("ring lock poisoned");
            state.available += do_write;
            state.read_index = (state.read_index + do_write) % state.buffer.len();
        }

        if flushing {
            self.sink.flush()?;
        }
        Ok(())
    }
}
