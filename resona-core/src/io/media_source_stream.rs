// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp;
use std::io;
use std::io::{Read, Seek};

use super::{MediaSource, ReadBytes, SeekBuffered};

const END_OF_STREAM_ERROR_STR: &str = "end of stream";

/// A `MediaSourceStream` is a buffered reader over a [`MediaSource`].
///
/// The stream maintains a power-of-two ring buffer that serves two purposes.
/// First, it amortizes the cost of small reads against the source by fetching
/// exponentially growing blocks. Second, bytes that have already been read
/// remain in the ring until overwritten, allowing limited backwards seeking
/// without touching the source. The seek-back window is bounded by the ring
/// length minus the largest fetch block, which comfortably exceeds the
/// maximum Ogg page size.
pub struct MediaSourceStream {
    /// The source reader.
    inner: Box<dyn MediaSource>,
    /// The ring buffer.
    ring: Box<[u8]>,
    /// The ring buffer's wrap-around mask.
    ring_mask: usize,
    /// The read position.
    read_pos: usize,
    /// The write position.
    write_pos: usize,
    /// The current block length for the next fetch.
    read_block_len: usize,
    /// Absolute position of the inner source.
    abs_pos: u64,
    /// Bytes read from the inner source since instantiation or the last seek.
    rel_pos: u64,
}

impl MediaSourceStream {
    const MIN_BLOCK_LEN: usize = 1024;
    const MAX_BLOCK_LEN: usize = 32 * 1024;
    const RING_LEN: usize = 128 * 1024;

    pub fn new(source: Box<dyn MediaSource>) -> Self {
        MediaSourceStream {
            inner: source,
            ring: vec![0; Self::RING_LEN].into_boxed_slice(),
            ring_mask: Self::RING_LEN - 1,
            read_pos: 0,
            write_pos: 0,
            read_block_len: Self::MIN_BLOCK_LEN,
            abs_pos: 0,
            rel_pos: 0,
        }
    }

    /// Returns if the underlying source is seekable.
    pub fn is_seekable(&self) -> bool {
        self.inner.is_seekable()
    }

    /// Returns the byte length of the underlying source, if known.
    pub fn byte_len(&self) -> Option<u64> {
        self.inner.byte_len()
    }

    /// Seeks the stream to an absolute byte position. Invalidates the ring
    /// buffer.
    pub fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let pos = match pos {
            io::SeekFrom::Current(0) => return Ok(self.pos()),
            io::SeekFrom::Current(delta_pos) => {
                // The inner source is ahead of the stream position by the
                // number of unread buffered bytes.
                let delta = delta_pos - self.unread_buffer_len() as i64;
                self.inner.seek(io::SeekFrom::Current(delta))?
            }
            _ => self.inner.seek(pos)?,
        };

        self.reset(pos);

        Ok(pos)
    }

    #[inline(always)]
    fn is_buffer_exhausted(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// If the ring is exhausted, fetch a new block of data from the source.
    fn fetch(&mut self) -> io::Result<()> {
        if self.is_buffer_exhausted() {
            // The longest contiguous region starting at the write position.
            let end = cmp::min(self.write_pos + self.read_block_len, self.ring.len());

            let len = self.inner.read(&mut self.ring[self.write_pos..end])?;

            self.write_pos = (self.write_pos + len) & self.ring_mask;

            self.abs_pos += len as u64;
            self.rel_pos += len as u64;

            // Grow the fetch block exponentially to reduce overhead on
            // consecutive reads.
            self.read_block_len = cmp::min(self.read_block_len << 1, Self::MAX_BLOCK_LEN);
        }

        Ok(())
    }

    /// Like `fetch`, but returns an end-of-stream error if no bytes could be
    /// fetched.
    fn fetch_or_eof(&mut self) -> io::Result<()> {
        self.fetch()?;

        if self.is_buffer_exhausted() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, END_OF_STREAM_ERROR_STR));
        }

        Ok(())
    }

    #[inline(always)]
    fn consume(&mut self, len: usize) {
        self.read_pos = (self.read_pos + len) & self.ring_mask;
    }

    /// Gets the largest contiguous readable slice starting at the read
    /// position.
    #[inline(always)]
    fn contiguous_buf(&self) -> &[u8] {
        if self.write_pos >= self.read_pos {
            &self.ring[self.read_pos..self.write_pos]
        }
        else {
            &self.ring[self.read_pos..]
        }
    }

    /// Invalidates the ring buffer and sets the absolute position to `pos`.
    fn reset(&mut self, pos: u64) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.read_block_len = Self::MIN_BLOCK_LEN;
        self.abs_pos = pos;
        self.rel_pos = 0;
    }
}

impl ReadBytes for MediaSourceStream {
    #[inline(always)]
    fn read_byte(&mut self) -> io::Result<u8> {
        if self.is_buffer_exhausted() {
            self.fetch_or_eof()?;
        }

        let byte = self.ring[self.read_pos];
        self.consume(1);

        Ok(byte)
    }

    #[inline(always)]
    fn read_quad_bytes(&mut self) -> io::Result<[u8; 4]> {
        let mut bytes = [0u8; 4];

        let buf = self.contiguous_buf();

        if buf.len() >= 4 {
            bytes.copy_from_slice(&buf[..4]);
            self.consume(4);
        }
        else {
            for byte in bytes.iter_mut() {
                *byte = self.read_byte()?;
            }
        }

        Ok(bytes)
    }

    fn read_buf(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        let total = buf.len();

        while !buf.is_empty() {
            self.fetch()?;

            let src = self.contiguous_buf();

            if src.is_empty() {
                break;
            }

            let len = cmp::min(src.len(), buf.len());
            buf[..len].copy_from_slice(&src[..len]);
            self.consume(len);

            buf = &mut buf[len..];
        }

        Ok(total - buf.len())
    }

    fn read_buf_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let len = buf.len();

        if self.read_buf(buf)? != len {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, END_OF_STREAM_ERROR_STR));
        }

        Ok(())
    }

    fn ignore_bytes(&mut self, mut count: u64) -> io::Result<()> {
        while count > 0 {
            self.fetch_or_eof()?;
            let discard = cmp::min(self.unread_buffer_len() as u64, count);
            self.consume(discard as usize);
            count -= discard;
        }
        Ok(())
    }

    #[inline(always)]
    fn pos(&self) -> u64 {
        self.abs_pos - self.unread_buffer_len() as u64
    }
}

impl SeekBuffered for MediaSourceStream {
    fn unread_buffer_len(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        }
        else {
            self.write_pos + (self.ring.len() - self.read_pos)
        }
    }

    fn read_buffer_len(&self) -> usize {
        cmp::min(self.ring.len(), self.rel_pos as usize) - self.unread_buffer_len()
    }

    fn seek_buffered(&mut self, pos: u64) -> u64 {
        let old_pos = self.pos();

        let delta = if pos > old_pos {
            (pos - old_pos) as isize
        }
        else {
            -((old_pos - pos) as isize)
        };

        self.seek_buffered_rel(delta)
    }

    fn seek_buffered_rel(&mut self, delta: isize) -> u64 {
        if delta < 0 {
            let abs_delta = cmp::min((-delta) as usize, self.read_buffer_len());
            self.read_pos = (self.read_pos + self.ring.len() - abs_delta) & self.ring_mask;
        }
        else if delta > 0 {
            let abs_delta = cmp::min(delta as usize, self.unread_buffer_len());
            self.read_pos = (self.read_pos + abs_delta) & self.ring_mask;
        }

        self.pos()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::MediaSourceStream;
    use crate::io::{ReadBytes, SeekBuffered};

    /// Generate a byte vector of the specified length using an LCG.
    fn generate_bytes(len: usize) -> Vec<u8> {
        let mut lcg: u32 = 0xec57c4bf;

        let mut bytes = vec![0; len];

        for quad in bytes.chunks_mut(4) {
            lcg = lcg.wrapping_mul(1664525).wrapping_add(1013904223);
            for (dst, src) in quad.iter_mut().zip(&lcg.to_ne_bytes()) {
                *dst = *src;
            }
        }

        bytes
    }

    #[test]
    fn verify_stream_read() {
        let data = generate_bytes(3 * 96 * 1024);

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(data.clone())));

        for byte in &data[..96 * 1024] {
            assert_eq!(*byte, mss.read_byte().unwrap());
        }

        mss.ignore_bytes(11).unwrap();

        let mut rest = &data[11 + 96 * 1024..];

        for quad in rest[..4 * 24 * 1024].chunks_exact(4) {
            assert_eq!(quad, &mss.read_quad_bytes().unwrap());
        }

        rest = &rest[4 * 24 * 1024..];

        let mut buf = vec![0u8; rest.len()];
        mss.read_buf_exact(&mut buf).unwrap();
        assert_eq!(&buf, rest);

        assert!(mss.read_byte().is_err());
    }

    #[test]
    fn verify_stream_seek_buffered() {
        let data = generate_bytes(256 * 1024);

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(data.clone())));

        mss.ignore_bytes(5122).unwrap();

        assert_eq!(5122, mss.pos());
        assert_eq!(mss.read_buffer_len(), 5122);

        let byte = mss.read_byte().unwrap();

        assert_eq!(mss.seek_buffered_rel(-1000), 4123);
        assert_eq!(mss.pos(), 4123);

        assert_eq!(mss.seek_buffered(5122), 5122);
        assert_eq!(byte, mss.read_byte().unwrap());
    }

    #[test]
    fn verify_stream_seek() {
        let data = generate_bytes(256 * 1024);

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(data.clone())));

        mss.seek(std::io::SeekFrom::Start(200_000)).unwrap();
        assert_eq!(mss.pos(), 200_000);
        assert_eq!(mss.read_byte().unwrap(), data[200_000]);
    }
}
