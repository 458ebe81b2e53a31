// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pull-mode decoder driver.

use std::io::SeekFrom;

use resona_core::errors::{Error, Result};
use resona_core::io::{MediaSource, MediaSourceStream, ReadBytes};
use resona_format_ogg::probe::{self, ProbedPage, SAMPLE_UNKNOWN};
use resona_format_ogg::OggStream;

use log::debug;

use super::{Frame, Info, VorbisDecoder};

/// A frame decoded during a seek, to be delivered (partially) by the next
/// read.
struct PendingFrame {
    info: super::FrameInfo,
    skip: usize,
    position: u32,
}

/// Decodes an Ogg Vorbis stream pulled from a byte source.
///
/// The source is read sequentially; if it is seekable, the stream length can
/// be measured and sample-accurate seeking is available.
pub struct VorbisReader {
    stream: OggStream,
    dec: VorbisDecoder,
    /// Byte offset of the first audio page.
    first_audio_page_offset: u64,
    /// The first audio page, probed lazily for seeking.
    p_first: Option<ProbedPage>,
    /// The final page, probed by the stream-length measurement.
    p_last: Option<ProbedPage>,
    /// The measured total sample count. `SAMPLE_UNKNOWN` when measurement
    /// failed; `None` when not yet measured.
    total_samples: Option<u32>,
    pending: Option<PendingFrame>,
}

impl VorbisReader {
    /// Opens a stream read from `source`. The three header packets are
    /// consumed and the static decode tables built; on success the reader is
    /// positioned at the first audio packet.
    pub fn open(source: Box<dyn MediaSource>) -> Result<VorbisReader> {
        let mut stream = OggStream::new(MediaSourceStream::new(source))?;

        let id = Self::require_packet(&mut stream)?;
        let comment = Self::require_packet(&mut stream)?;
        let setup = Self::require_packet(&mut stream)?;

        let dec = VorbisDecoder::try_new(&id, &comment, &setup)?;

        let first_audio_page_offset = stream.next_page_pos();

        Ok(VorbisReader {
            stream,
            dec,
            first_audio_page_offset,
            p_first: None,
            p_last: None,
            total_samples: None,
            pending: None,
        })
    }

    /// Opens a stream held in memory.
    pub fn open_memory(data: Vec<u8>) -> Result<VorbisReader> {
        Self::open(Box::new(std::io::Cursor::new(data)))
    }

    fn require_packet(stream: &mut OggStream) -> Result<Box<[u8]>> {
        match stream.next_packet()? {
            Some(packet) => Ok(packet.data),
            None => Err(Error::UnexpectedEof),
        }
    }

    /// Gets the stream parameters.
    pub fn info(&self) -> Info {
        self.dec.info()
    }

    /// The stream position of the next sample that will be returned, when
    /// known.
    pub fn sample_offset(&self) -> Option<u32> {
        match &self.pending {
            Some(pending) => Some(pending.position),
            None => self.dec.sample_position(),
        }
    }

    /// Decodes and returns the next frame, or `None` at the end of the
    /// stream.
    ///
    /// The first frame after opening, seeking, or a stream error may carry 0
    /// samples while the decoder re-establishes its overlap state.
    pub fn next_frame(&mut self) -> Result<Option<Frame<'_>>> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(Frame::new_trimmed(
                &self.dec,
                pending.info,
                pending.skip,
                pending.position,
            )));
        }

        loop {
            let packet = match self.stream.next_packet()? {
                Some(packet) => packet,
                None => return Ok(None),
            };

            // Non-audio packets between audio packets are skipped.
            if let Some(info) = self.dec.decode_packet(&packet)? {
                return Ok(Some(Frame::new(&self.dec, info)));
            }
        }
    }

    /// Measures the total number of samples in the stream by locating the
    /// final page and reading its granule position. The result is cached.
    pub fn stream_length_in_samples(&mut self) -> Result<u32> {
        if let Some(total) = self.total_samples {
            return if total == SAMPLE_UNKNOWN { Err(Error::CantFindLastPage) } else { Ok(total) };
        }

        if !self.stream.is_seekable() {
            return Err(Error::SeekWithoutLength);
        }

        let stream_len = match self.stream.byte_len() {
            Some(len) => len,
            None => return Err(Error::SeekWithoutLength),
        };

        let reader = self.stream.reader();
        let restore = reader.pos();

        // The final page is at most 64 kiB before the end of the stream.
        let previous_safe =
            if stream_len >= 65536 && stream_len - 65536 >= self.first_audio_page_offset {
                stream_len - 65536
            }
            else {
                self.first_audio_page_offset
            };

        let result = probe::find_last_page(reader, previous_safe);

        reader.seek(SeekFrom::Start(restore))?;

        match result {
            Ok(info) if info.last_decoded_sample != SAMPLE_UNKNOWN => {
                self.total_samples = Some(info.last_decoded_sample);
                self.p_last = Some(info);
                Ok(info.last_decoded_sample)
            }
            Ok(_) | Err(Error::CantFindLastPage) => {
                self.total_samples = Some(SAMPLE_UNKNOWN);
                Err(Error::CantFindLastPage)
            }
            Err(err) => Err(err),
        }
    }

    /// The stream length in seconds, derived from the sample count.
    pub fn stream_length_in_seconds(&mut self) -> Result<f32> {
        let samples = self.stream_length_in_samples()?;
        Ok(samples as f32 / self.dec.sample_rate() as f32)
    }

    /// Rewinds to the first audio page and primes the decoder as if the
    /// stream had just been opened.
    pub fn seek_start(&mut self) -> Result<()> {
        self.pending = None;
        self.stream.seek_bytes(self.first_audio_page_offset)?;
        self.dec.reset_to_start();

        // Decode one frame so lapping state is primed; it emits nothing.
        self.pump_frame()?;

        Ok(())
    }

    /// Positions the decoder so that the next decoded frame contains sample
    /// `sample_number`.
    pub fn seek_frame(&mut self, sample_number: u32) -> Result<()> {
        self.pending = None;

        if !self.stream.is_seekable() {
            return Err(Error::SeekWithoutLength);
        }

        self.seek_to_sample_coarse(sample_number)?;

        // Walk forward frame by frame until the next frame contains the
        // target.
        loop {
            let loc = match self.dec.sample_position() {
                Some(loc) => loc,
                None => return self.seek_failed(),
            };

            if loc >= sample_number {
                break;
            }

            let window = match self.peek_window()? {
                Some(window) => window,
                None => return self.seek_failed(),
            };

            let frame_samples = (window.right_start - window.left_start) as u32;

            if loc + frame_samples > sample_number {
                // The next frame contains the target sample.
                break;
            }

            // Decode and discard.
            if !self.pump_frame()? {
                return self.seek_failed();
            }
        }

        Ok(())
    }

    /// Seeks so that the next sample delivered is exactly `sample_number`.
    /// The containing frame is decoded and trimmed; the next
    /// [`VorbisReader::next_frame`] call returns its remainder.
    pub fn seek(&mut self, sample_number: u32) -> Result<()> {
        self.seek_frame(sample_number)?;

        if self.dec.sample_position() == Some(sample_number) {
            // The next frame starts exactly at the target.
            return Ok(());
        }

        // Decode frames until one covers the target, then trim its start.
        loop {
            let packet = match self.stream.next_packet()? {
                Some(packet) => packet,
                None => return self.seek_failed(),
            };

            let info = match self.dec.decode_packet(&packet)? {
                Some(info) => info,
                None => continue,
            };

            let frame_pos = match info.position {
                Some(pos) => pos,
                None => return self.seek_failed(),
            };

            if frame_pos > sample_number {
                return self.seek_failed();
            }

            if frame_pos.wrapping_add(info.samples as u32) > sample_number {
                let skip = (sample_number - frame_pos) as usize;

                self.pending =
                    Some(PendingFrame { info, skip, position: sample_number });

                return Ok(());
            }
        }
    }

    /// Decodes one frame and discards its output. Returns false at the end
    /// of the stream.
    fn pump_frame(&mut self) -> Result<bool> {
        loop {
            let packet = match self.stream.next_packet()? {
                Some(packet) => packet,
                None => return Ok(false),
            };

            if self.dec.decode_packet(&packet)?.is_some() {
                return Ok(true);
            }
        }
    }

    /// Peeks the window geometry of the next audio packet without consuming
    /// it. Non-audio packets are consumed and skipped.
    fn peek_window(&mut self) -> Result<Option<super::WindowBounds>> {
        loop {
            let window = {
                let packet = match self.stream.peek_packet()? {
                    Some(packet) => packet,
                    None => return Ok(None),
                };

                self.dec.packet_window(&packet.data)?
            };

            match window {
                Some(window) => return Ok(Some(window)),
                None => self.stream.consume_packet(),
            }
        }
    }

    /// Restores a defined state after a failed seek: sequential decoding may
    /// continue from the stream start.
    fn seek_failed<T>(&mut self) -> Result<T> {
        let _ = self.seek_start();
        Err(Error::SeekFailed)
    }

    /// Page-level bisection search for the page pair bracketing
    /// `sample_number`, followed by decode-forward until the stream position
    /// is re-established.
    fn seek_to_sample_coarse(&mut self, sample_number: u32) -> Result<()> {
        let stream_length = self.stream_length_in_samples()?;

        if sample_number > stream_length {
            return Err(Error::SeekInvalid);
        }

        // The granule position names the window center of a page's final
        // frame, which leads the emitted samples by up-to this much.
        let padding = ((self.dec.blocksize(true) - self.dec.blocksize(false)) >> 2) as u32;
        let last_sample_limit = sample_number.saturating_sub(padding);

        // Probe the first audio page if it hasn't been yet.
        if self.p_first.is_none() {
            let reader = self.stream.reader();
            let restore = reader.pos();

            reader.seek(SeekFrom::Start(self.first_audio_page_offset))?;
            let info = probe::read_page_info(reader)?;
            reader.seek(SeekFrom::Start(restore))?;

            self.p_first = info;
        }

        let mut left = match self.p_first {
            Some(info) => info,
            None => return self.seek_failed(),
        };

        // Walk forward while the bracketing start page has no granule.
        while left.last_decoded_sample == SAMPLE_UNKNOWN {
            let reader = self.stream.reader();
            reader.seek(SeekFrom::Start(left.page_end))?;

            match probe::read_page_info(reader)? {
                Some(info) => left = info,
                None => return self.seek_failed(),
            }
        }

        let mut right = match self.p_last {
            Some(info) => info,
            None => return self.seek_failed(),
        };

        // Targets within the first page are reached from the stream start.
        if last_sample_limit <= left.last_decoded_sample {
            self.seek_start()?;

            return match self.dec.sample_position() {
                Some(loc) if loc > sample_number => self.seek_failed(),
                _ => Ok(()),
            };
        }

        let mut mid = ProbedPage::default();
        let mut probe_count = 0u32;
        let mut offset = 0.0f64;
        let mut bytes_per_sample = 0.0f64;

        // Bisect by byte offset, interpolating the first probes from the
        // stream's average byte rate.
        while left.page_end != right.page_start {
            let delta = right.page_start.saturating_sub(left.page_end);

            let reader = self.stream.reader();

            if delta <= 65536 {
                // Little is left to search; scan linearly from the left
                // bound.
                reader.seek(SeekFrom::Start(left.page_end))?;
            }
            else {
                if probe_count < 2 {
                    // Initial probes interpolate on the average byte rate.
                    let data_bytes = (right.page_end - left.page_start) as f64;
                    bytes_per_sample = data_bytes / f64::from(right.last_decoded_sample);
                    offset = left.page_start as f64
                        + bytes_per_sample
                            * f64::from(last_sample_limit - left.last_decoded_sample);
                }
                else {
                    // Later probes step proportionally to the remaining
                    // error, never less than a page-sized nudge.
                    let mut error = (f64::from(last_sample_limit)
                        - f64::from(mid.last_decoded_sample))
                        * bytes_per_sample;

                    if error >= 0.0 && error < 8000.0 {
                        error = 8000.0;
                    }
                    if error < 0.0 && error > -8000.0 {
                        error = -8000.0;
                    }

                    offset += error * 2.0;
                }

                let lo = left.page_end as f64;
                let hi = (right.page_start - 65536) as f64;

                let probe_at = offset.max(lo).min(hi);

                reader.seek(SeekFrom::Start(probe_at as u64))?;
            }

            if probe::find_page(reader)?.is_none() {
                return self.seek_failed();
            }

            mid = match probe::read_page_info(reader)? {
                Some(info) => info,
                None => return self.seek_failed(),
            };

            debug!(
                "seek: probe page={{ start={}, granule={} }} target={}",
                mid.page_start, mid.last_decoded_sample, last_sample_limit,
            );

            if mid.page_start == right.page_start {
                // The probe landed on the right bound; either the search
                // degenerated or it converged by chance.
                if probe_count >= 2 || delta <= 65536 {
                    break;
                }
            }
            else if last_sample_limit < mid.last_decoded_sample {
                right = mid;
            }
            else {
                left = mid;
            }

            probe_count += 1;
        }

        // Decode from the start of the bracketing page. The position becomes
        // known once the packet bearing the page's granule is decoded.
        self.stream.seek_bytes(left.page_start)?;
        self.dec.reset();

        loop {
            if !self.pump_frame()? {
                return self.seek_failed();
            }

            if self.dec.sample_position().is_some() {
                break;
            }
        }

        match self.dec.sample_position() {
            Some(loc) if loc > sample_number => self.seek_failed(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::VorbisReader;
    use crate::testutil::build_test_stream;

    #[test]
    fn verify_open_and_info() {
        let (data, _) = build_test_stream(8);

        let mut reader = VorbisReader::open_memory(data).unwrap();

        let info = reader.info();
        assert_eq!(info.channels, 1);
        assert_eq!(info.sample_rate, 44100);
        assert_eq!(info.max_frame_size, 64);

        // The first frame never reports a negative position: either it is
        // empty, or the reported offset is already 0.
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.samples(), 0);
        assert_eq!(reader.sample_offset(), Some(0));
    }

    #[test]
    fn verify_decode_all_frames() {
        let (data, total) = build_test_stream(20);

        let mut reader = VorbisReader::open_memory(data).unwrap();

        let mut decoded = 0u32;

        while let Some(frame) = reader.next_frame().unwrap() {
            if frame.samples() > 0 {
                // Every frame is contiguous with the samples before it.
                assert_eq!(frame.sample_offset(), Some(decoded));
            }

            assert_eq!(frame.num_channels(), 1);

            for &sample in frame.chan(0) {
                assert_eq!(sample, 0.0);
            }

            decoded += frame.samples() as u32;
        }

        // The decoded sample count equals the final granule position.
        assert_eq!(decoded, total);
    }

    #[test]
    fn verify_stream_length() {
        let (data, total) = build_test_stream(20);

        let mut reader = VorbisReader::open_memory(data).unwrap();

        assert_eq!(reader.stream_length_in_samples().unwrap(), total);

        // Measuring the length does not disturb decoding.
        let mut decoded = 0u32;
        while let Some(frame) = reader.next_frame().unwrap() {
            decoded += frame.samples() as u32;
        }
        assert_eq!(decoded, total);
    }

    #[test]
    fn verify_seek_is_sample_exact() {
        let (data, total) = build_test_stream(40);

        let mut reader = VorbisReader::open_memory(data).unwrap();

        // An offset that is not frame aligned, so the containing frame must
        // be trimmed.
        let target = total / 3 + 7;
        reader.seek(target).unwrap();

        assert_eq!(reader.sample_offset(), Some(target));

        // The next frame starts exactly at the target and decoding continues
        // contiguously to the end of the stream.
        let mut expect = target;

        while let Some(frame) = reader.next_frame().unwrap() {
            if frame.samples() > 0 {
                assert_eq!(frame.sample_offset(), Some(expect));
            }
            expect += frame.samples() as u32;
        }

        assert_eq!(expect, total);
    }

    #[test]
    fn verify_seek_past_end_fails() {
        let (data, total) = build_test_stream(8);

        let mut reader = VorbisReader::open_memory(data).unwrap();

        assert!(reader.seek(total + 1000).is_err());
    }

    #[test]
    fn verify_seek_start() {
        let (data, total) = build_test_stream(12);

        let mut reader = VorbisReader::open_memory(data).unwrap();

        // Consume some frames, rewind, and verify the stream replays from 0.
        for _ in 0..5 {
            reader.next_frame().unwrap().unwrap();
        }

        reader.seek_start().unwrap();
        assert_eq!(reader.sample_offset(), Some(0));

        let mut decoded = 0u32;
        while let Some(frame) = reader.next_frame().unwrap() {
            decoded += frame.samples() as u32;
        }
        assert_eq!(decoded, total);
    }
}
