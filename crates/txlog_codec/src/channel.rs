//! Byte channel traits.
//!
//! Every multi-byte value is big-endian. Character arrays are written as
//! UTF-16 code units, two bytes each.

use crate::error::{CodecError, CodecResult};
use crate::position::LogPosition;

/// An append-only sink for log bytes.
///
/// Implementors only provide [`WritableChannel::put_bytes`]; the typed
/// puts are expressed on top of it.
pub trait WritableChannel {
    /// Appends raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file fails.
    fn put_bytes(&mut self, bytes: &[u8]) -> CodecResult<()>;

    /// Appends one byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file fails.
    fn put_u8(&mut self, value: u8) -> CodecResult<()> {
        self.put_bytes(&[value])
    }

    /// Appends a big-endian `i16`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file fails.
    fn put_i16(&mut self, value: i16) -> CodecResult<()> {
        self.put_bytes(&value.to_be_bytes())
    }

    /// Appends a big-endian `i32`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file fails.
    fn put_i32(&mut self, value: i32) -> CodecResult<()> {
        self.put_bytes(&value.to_be_bytes())
    }

    /// Appends a big-endian `i64`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file fails.
    fn put_i64(&mut self, value: i64) -> CodecResult<()> {
        self.put_bytes(&value.to_be_bytes())
    }

    /// Appends a big-endian `f32`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file fails.
    fn put_f32(&mut self, value: f32) -> CodecResult<()> {
        self.put_bytes(&value.to_be_bytes())
    }

    /// Appends a big-endian `f64`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file fails.
    fn put_f64(&mut self, value: f64) -> CodecResult<()> {
        self.put_bytes(&value.to_be_bytes())
    }

    /// Appends the UTF-16 code units of `chars`.
    ///
    /// No length is written; callers frame the array themselves.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file fails.
    fn put_chars(&mut self, chars: &str) -> CodecResult<()> {
        for unit in chars.encode_utf16() {
            self.put_bytes(&unit.to_be_bytes())?;
        }
        Ok(())
    }
}

/// A sequential source of log bytes.
///
/// Running out of bytes is reported as [`CodecError::ReadPastEnd`].
pub trait ReadableChannel {
    /// Fills `buf` completely.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ReadPastEnd`] if fewer than `buf.len()` bytes
    /// are available, or a storage error if the underlying file fails.
    fn get_bytes(&mut self, buf: &mut [u8]) -> CodecResult<()>;

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// See [`ReadableChannel::get_bytes`].
    fn get_u8(&mut self) -> CodecResult<u8> {
        let mut buf = [0u8; 1];
        self.get_bytes(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a big-endian `i16`.
    ///
    /// # Errors
    ///
    /// See [`ReadableChannel::get_bytes`].
    fn get_i16(&mut self) -> CodecResult<i16> {
        let mut buf = [0u8; 2];
        self.get_bytes(&mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }

    /// Reads a big-endian `i32`.
    ///
    /// # Errors
    ///
    /// See [`ReadableChannel::get_bytes`].
    fn get_i32(&mut self) -> CodecResult<i32> {
        let mut buf = [0u8; 4];
        self.get_bytes(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Reads a big-endian `i64`.
    ///
    /// # Errors
    ///
    /// See [`ReadableChannel::get_bytes`].
    fn get_i64(&mut self) -> CodecResult<i64> {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Reads a big-endian `f32`.
    ///
    /// # Errors
    ///
    /// See [`ReadableChannel::get_bytes`].
    fn get_f32(&mut self) -> CodecResult<f32> {
        let mut buf = [0u8; 4];
        self.get_bytes(&mut buf)?;
        Ok(f32::from_be_bytes(buf))
    }

    /// Reads a big-endian `f64`.
    ///
    /// # Errors
    ///
    /// See [`ReadableChannel::get_bytes`].
    fn get_f64(&mut self) -> CodecResult<f64> {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf)?;
        Ok(f64::from_be_bytes(buf))
    }

    /// Reads `len` raw bytes into a new vector.
    ///
    /// # Errors
    ///
    /// See [`ReadableChannel::get_bytes`].
    fn get_vec(&mut self, len: usize) -> CodecResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.get_bytes(&mut buf)?;
        Ok(buf)
    }

    /// Reads `count` UTF-16 code units.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidStructure`] if the units are not valid
    /// UTF-16, otherwise see [`ReadableChannel::get_bytes`].
    fn get_chars(&mut self, count: usize) -> CodecResult<String> {
        let mut units = Vec::with_capacity(count);
        for _ in 0..count {
            units.push(self.get_i16()? as u16);
        }
        String::from_utf16(&units).map_err(|_| CodecError::invalid_structure("invalid UTF-16"))
    }
}

/// A channel that knows where in the logical log stream it is.
pub trait PositionAware {
    /// Returns the position the next byte will be written to or read from.
    fn current_position(&self) -> LogPosition;
}
