// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `io` module implements composable byte- and bit-level input.
//!
//! A `Reader` consumes a `&[u8]`. A `Stream` consumes any source implementing
//! [`ReadBytes`]. The sole exception is [`MediaSourceStream`] which consumes
//! sources implementing [`MediaSource`].

use std::io;

mod bit;
mod buf_reader;
mod media_source_stream;
mod monitor_stream;
pub mod vlc;

pub use bit::{BitReaderRtl, FiniteBitStream, ReadBitsRtl};
pub use buf_reader::BufReader;
pub use media_source_stream::MediaSourceStream;
pub use monitor_stream::{Monitor, MonitorStream};

/// `MediaSource` is a composite trait of [`std::io::Read`] and
/// [`std::io::Seek`]. A byte source must implement this trait to be consumed
/// by [`MediaSourceStream`].
///
/// Despite requiring [`std::io::Seek`], seeking is an optional capability
/// that may be queried at runtime.
pub trait MediaSource: io::Read + io::Seek + Send + Sync {
    /// Returns if the source is seekable. This may be an expensive operation.
    fn is_seekable(&self) -> bool;

    /// Returns the length in bytes, if available. This may be an expensive
    /// operation.
    fn byte_len(&self) -> Option<u64>;
}

impl MediaSource for std::fs::File {
    fn is_seekable(&self) -> bool {
        // A regular file is seekable. FIFOs and character devices are not.
        match self.metadata() {
            Ok(metadata) => metadata.is_file(),
            _ => false,
        }
    }

    fn byte_len(&self) -> Option<u64> {
        match self.metadata() {
            Ok(metadata) => Some(metadata.len()),
            _ => None,
        }
    }
}

impl<T: AsRef<[u8]> + Send + Sync> MediaSource for io::Cursor<T> {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.get_ref().as_ref().len() as u64)
    }
}

/// `ReadBytes` provides methods to read bytes and interpret them as
/// little-endian unsigned integers of standard widths.
pub trait ReadBytes {
    /// Reads a single byte from the stream and returns it, or an error.
    fn read_byte(&mut self) -> io::Result<u8>;

    /// Reads four bytes from the stream and returns them in read-order, or an
    /// error.
    fn read_quad_bytes(&mut self) -> io::Result<[u8; 4]>;

    /// Reads up-to the number of bytes required to fill `buf`, or returns an
    /// error.
    fn read_buf(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Reads exactly the number of bytes required to fill `buf`, or returns
    /// an error.
    fn read_buf_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Reads a single unsigned byte from the stream and returns it, or an
    /// error.
    #[inline(always)]
    fn read_u8(&mut self) -> io::Result<u8> {
        self.read_byte()
    }

    /// Reads two bytes from the stream and interprets them as an unsigned
    /// 16-bit little-endian integer, or returns an error.
    #[inline(always)]
    fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_buf_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads four bytes from the stream and interprets them as an unsigned
    /// 32-bit little-endian integer, or returns an error.
    #[inline(always)]
    fn read_u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.read_quad_bytes()?))
    }

    /// Reads eight bytes from the stream and interprets them as an unsigned
    /// 64-bit little-endian integer, or returns an error.
    #[inline(always)]
    fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_buf_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Ignores the specified number of bytes from the stream, or returns an
    /// error.
    fn ignore_bytes(&mut self, count: u64) -> io::Result<()>;

    /// Gets the position of the stream.
    fn pos(&self) -> u64;
}

impl<R: ReadBytes> ReadBytes for &mut R {
    #[inline(always)]
    fn read_byte(&mut self) -> io::Result<u8> {
        (*self).read_byte()
    }

    #[inline(always)]
    fn read_quad_bytes(&mut self) -> io::Result<[u8; 4]> {
        (*self).read_quad_bytes()
    }

    #[inline(always)]
    fn read_buf(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (*self).read_buf(buf)
    }

    #[inline(always)]
    fn read_buf_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        (*self).read_buf_exact(buf)
    }

    #[inline(always)]
    fn ignore_bytes(&mut self, count: u64) -> io::Result<()> {
        (*self).ignore_bytes(count)
    }

    #[inline(always)]
    fn pos(&self) -> u64 {
        (**self).pos()
    }
}

/// `SeekBuffered` provides methods to seek within the buffered portion of a
/// stream without touching the underlying source.
pub trait SeekBuffered {
    /// Gets the number of bytes buffered but not yet read.
    ///
    /// This is the maximum number of bytes that can be seeked forwards within
    /// the buffer.
    fn unread_buffer_len(&self) -> usize;

    /// Gets the number of bytes buffered and read.
    ///
    /// This is the maximum number of bytes that can be seeked backwards
    /// within the buffer.
    fn read_buffer_len(&self) -> usize;

    /// Seeks within the buffered data to an absolute position in the stream.
    /// Returns the position seeked to.
    fn seek_buffered(&mut self, pos: u64) -> u64;

    /// Seeks within the buffered data relative to the current position.
    /// Returns the position seeked to.
    ///
    /// `delta` is clamped to the inclusive range defined by
    /// `-read_buffer_len()..=unread_buffer_len()`.
    fn seek_buffered_rel(&mut self, delta: isize) -> u64;
}
