// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The push-mode decoder driver.
//!
//! In push mode the caller owns the input: each call hands the decoder a
//! buffer beginning at the current stream position, and the decoder reports
//! how many bytes it consumed. When a call consumes nothing and produces
//! nothing, the caller must extend the buffer (preserving the existing
//! bytes) and retry.

use resona_core::errors::{Error, Result};
use resona_format_ogg::PushStream;

use super::{Frame, Info, VorbisDecoder};

/// Decodes an Ogg Vorbis stream from caller-supplied buffers.
pub struct PushReader {
    stream: PushStream,
    dec: VorbisDecoder,
}

impl PushReader {
    /// Opens a stream from the initial bytes of the input. `data` must start
    /// at the first byte of the stream.
    ///
    /// On success, returns the reader and the number of header bytes
    /// consumed; the caller's next buffer must begin immediately after them.
    /// Returns [`Error::NeedMoreData`] if `data` does not yet hold all three
    /// header packets; retry with a longer buffer.
    pub fn open(data: &[u8]) -> Result<(PushReader, usize)> {
        let mut stream = PushStream::new();
        let mut consumed = 0;

        let (len, id) = stream.next_packet(&data[consumed..], false)?;
        consumed += len;

        let (len, comment) = stream.next_packet(&data[consumed..], false)?;
        consumed += len;

        let (len, setup) = stream.next_packet(&data[consumed..], false)?;
        consumed += len;

        let dec = VorbisDecoder::try_new(&id.data, &comment.data, &setup.data)?;

        Ok((PushReader { stream, dec }, consumed))
    }

    /// Gets the stream parameters.
    pub fn info(&self) -> Info {
        self.dec.info()
    }

    /// The stream position of the next sample to be decoded, when known.
    /// Unknown after a flush until a page granule has been observed.
    pub fn sample_offset(&self) -> Option<u32> {
        self.dec.sample_position()
    }

    /// Decodes at most one packet from `data`, which must begin at the
    /// current stream position.
    ///
    /// Returns the number of bytes consumed, and the decoded frame if the
    /// packet produced audio. Every call makes progress in exactly one way:
    /// bytes are consumed, samples are produced, or `(0, None)` asks for
    /// more data.
    ///
    /// While resynchronizing after [`PushReader::flush`], calls consume
    /// scanned bytes and return no frames until a checksum-verified page is
    /// found.
    pub fn decode_frame(&mut self, data: &[u8]) -> Result<(usize, Option<Frame<'_>>)> {
        if self.stream.is_scanning() {
            let (consumed, found) = self.stream.scan_resync(data);

            if let Some(loc) = found {
                // Resume decoding at the page following the verified one,
                // with the stream position adopted from its granule.
                self.dec.resync(loc);
            }

            return Ok((consumed, None));
        }

        // Immediately after resynchronization the buffer may begin inside a
        // continued packet; its tail is discarded.
        let allow_leading_continued = self.dec.previous_length() == 0;

        let (consumed, packet) = match self.stream.next_packet(data, allow_leading_continued) {
            Ok(result) => result,
            Err(Error::NeedMoreData) => return Ok((0, None)),
            Err(err) => {
                // The stream cannot be decoded from here; the caller must
                // flush and resynchronize.
                self.flush();
                return Err(err);
            }
        };

        match self.dec.decode_packet(&packet) {
            // A non-audio packet is consumed without producing samples.
            Ok(None) => Ok((consumed, None)),
            Ok(Some(info)) => Ok((consumed, Some(Frame::new(&self.dec, info)))),
            Err(err) => {
                self.flush();
                Err(err)
            }
        }
    }

    /// Signals a discontinuity in the input: decode state is reset and the
    /// next calls scan for the next checksum-verified page.
    pub fn flush(&mut self) {
        self.stream.flush();
        self.dec.resync(None);
    }
}

#[cfg(test)]
mod tests {
    use super::PushReader;
    use crate::testutil::build_test_stream;
    use resona_core::errors::Error;

    /// Opens a push reader by feeding the header in growing slices, as a
    /// caller streaming from a network would.
    fn open_incremental(data: &[u8]) -> (PushReader, usize) {
        let mut avail = 0;

        loop {
            avail = (avail + 17).min(data.len());

            match PushReader::open(&data[..avail]) {
                Ok(opened) => return opened,
                Err(Error::NeedMoreData) => {
                    assert!(avail < data.len(), "header larger than the stream");
                }
                Err(err) => panic!("open failed: {}", err),
            }
        }
    }

    #[test]
    fn verify_push_decode_matches_stream_total() {
        let (data, total) = build_test_stream(20);

        let (mut reader, consumed) = open_incremental(&data);

        assert_eq!(reader.info().channels, 1);
        assert_eq!(reader.info().sample_rate, 44100);

        // Feed the remainder 17 bytes at a time, extending on need-more-data
        // with all prior bytes preserved.
        let mut pos = consumed;
        let mut avail = 0;
        let mut decoded = 0u32;

        loop {
            avail = (avail + 17).min(data.len() - pos);

            let (consumed, samples) = {
                let (consumed, frame) = reader.decode_frame(&data[pos..pos + avail]).unwrap();
                (consumed, frame.map_or(0, |frame| frame.samples()))
            };

            decoded += samples as u32;

            // Progress: bytes consumed, samples produced, or a request for
            // more data.
            if consumed == 0 && samples == 0 && pos + avail == data.len() {
                break;
            }

            pos += consumed;
            avail -= consumed;
        }

        assert_eq!(decoded, total);
        assert_eq!(reader.sample_offset(), Some(total));
    }

    #[test]
    fn verify_push_flush_and_resync() {
        let (data, total) = build_test_stream(20);

        let (mut reader, consumed) = open_incremental(&data);

        // Decode a few packets.
        let mut pos = consumed;

        for _ in 0..3 {
            let (len, _) = reader.decode_frame(&data[pos..]).unwrap();
            pos += len;
        }

        // Simulate an input discontinuity: jump forward by a packet and a
        // half and flush.
        reader.flush();
        pos += 40;
        assert!(reader.sample_offset().is_none());

        // Scan until a page verifies, then resume decoding.
        let mut found_page = false;
        let mut decoded = 0u32;

        loop {
            let (len, frame) = {
                let (len, frame) = reader.decode_frame(&data[pos..]).unwrap();
                (len, frame.map_or(0, |frame| frame.samples()))
            };

            decoded += frame as u32;

            if len == 0 && frame == 0 && pos == data.len() {
                break;
            }

            pos += len;

            if reader.sample_offset().is_some() {
                found_page = true;
            }
        }

        assert!(found_page);

        // The stream position after the final packet matches the final
        // granule.
        assert_eq!(reader.sample_offset(), Some(total));
        assert!(decoded > 0);
    }
}
