// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A pure Rust Ogg Vorbis decoder.
//!
//! [`VorbisReader`] decodes a stream pulled from a byte source and supports
//! sample-accurate seeking. [`PushReader`] decodes buffers supplied
//! incrementally by the caller, including resynchronisation after an input
//! discontinuity. Both produce frames of 32-bit float samples, one buffer
//! per channel.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]
// Disable to better express the specification.
#![allow(clippy::collapsible_else_if)]

use resona_core::errors::{decode_error, setup_error, Error, Result};
use resona_core::io::{BitReaderRtl, BufReader, FiniteBitStream, ReadBitsRtl, ReadBytes};
use resona_format_ogg::probe::{saturate_granule, SAMPLE_UNKNOWN};
use resona_format_ogg::OggPacket;

use log::debug;

mod codebook;
mod common;
mod dsp;
mod floor;
mod residue;
#[cfg(test)]
mod testutil;
mod window;

pub mod push;
pub mod reader;

pub use common::MAX_CHANNELS;
pub use push::PushReader;
pub use reader::VorbisReader;

use codebook::VorbisCodebook;
use common::ilog;
use dsp::Dsp;
use floor::Floor1;
use residue::Residue;

/// The packet type for an identification header.
const VORBIS_PACKET_TYPE_IDENTIFICATION: u8 = 1;
/// The packet type for a comment header.
const VORBIS_PACKET_TYPE_COMMENT: u8 = 3;
/// The packet type for a setup header.
const VORBIS_PACKET_TYPE_SETUP: u8 = 5;

/// The common header packet signature.
const VORBIS_HEADER_PACKET_SIGNATURE: &[u8] = b"vorbis";

/// The Vorbis version supported by this decoder.
const VORBIS_VERSION: u32 = 0;

/// The identification header is always exactly 30 bytes.
const VORBIS_IDENT_HEADER_SIZE: usize = 30;

/// The minimum block size (64) expressed as a power-of-2 exponent.
const VORBIS_BLOCKSIZE_MIN: u8 = 6;
/// The maximum block size (8192) expressed as a power-of-2 exponent.
const VORBIS_BLOCKSIZE_MAX: u8 = 13;

/// Stream parameters reported to the caller.
#[derive(Copy, Clone, Debug)]
pub struct Info {
    pub channels: u8,
    pub sample_rate: u32,
    /// The maximum number of samples a single frame can cover; the long
    /// block size.
    pub max_frame_size: usize,
}

#[derive(Debug)]
struct IdentHeader {
    n_channels: u8,
    sample_rate: u32,
    bs0_exp: u8,
    bs1_exp: u8,
}

fn read_ident_header(data: &[u8]) -> Result<IdentHeader> {
    if data.len() != VORBIS_IDENT_HEADER_SIZE {
        return Err(Error::InvalidFirstPage("wrong identification packet length"));
    }

    let mut reader = BufReader::new(data);

    if reader.read_u8()? != VORBIS_PACKET_TYPE_IDENTIFICATION {
        return Err(Error::InvalidFirstPage("wrong packet type"));
    }

    let mut sig = [0u8; 6];
    reader.read_buf_exact(&mut sig)?;

    if sig != VORBIS_HEADER_PACKET_SIGNATURE {
        return Err(Error::InvalidFirstPage("wrong header signature"));
    }

    if reader.read_u32()? != VORBIS_VERSION {
        return Err(Error::InvalidFirstPage("unsupported version"));
    }

    let n_channels = reader.read_u8()?;

    if n_channels == 0 {
        return Err(Error::InvalidFirstPage("no channels"));
    }

    if usize::from(n_channels) > MAX_CHANNELS {
        return Err(Error::TooManyChannels);
    }

    let sample_rate = reader.read_u32()?;

    if sample_rate == 0 {
        return Err(Error::InvalidFirstPage("no sample rate"));
    }

    // The bitrate range is informational only.
    let _bitrate_max = reader.read_u32()?;
    let _bitrate_nom = reader.read_u32()?;
    let _bitrate_min = reader.read_u32()?;

    // Both block sizes are packed into one byte.
    let block_sizes = reader.read_u8()?;

    let bs0_exp = block_sizes & 0x0f;
    let bs1_exp = block_sizes >> 4;

    if bs0_exp < VORBIS_BLOCKSIZE_MIN || bs0_exp > VORBIS_BLOCKSIZE_MAX {
        return setup_error("vorbis: blocksize_0 out of bounds");
    }

    if bs1_exp < VORBIS_BLOCKSIZE_MIN || bs1_exp > VORBIS_BLOCKSIZE_MAX {
        return setup_error("vorbis: blocksize_1 out of bounds");
    }

    if bs0_exp > bs1_exp {
        return setup_error("vorbis: blocksize_0 exceeds blocksize_1");
    }

    // The framing bit must be set.
    if reader.read_u8()? & 0x1 != 0x1 {
        return Err(Error::InvalidFirstPage("framing bit unset"));
    }

    Ok(IdentHeader { n_channels, sample_rate, bs0_exp, bs1_exp })
}

/// Verifies the comment header's framing. Its body is skipped; harvesting
/// the contained tags is a caller concern.
fn verify_comment_header(data: &[u8]) -> Result<()> {
    let mut reader = BufReader::new(data);

    if reader.read_u8()? != VORBIS_PACKET_TYPE_COMMENT {
        return setup_error("vorbis: wrong comment header packet type");
    }

    let mut sig = [0u8; 6];
    reader.read_buf_exact(&mut sig)?;

    if sig != VORBIS_HEADER_PACKET_SIGNATURE {
        return setup_error("vorbis: wrong comment header signature");
    }

    Ok(())
}

struct Setup {
    codebooks: Vec<VorbisCodebook>,
    floors: Vec<Floor1>,
    residues: Vec<Residue>,
    mappings: Vec<Mapping>,
    modes: Vec<Mode>,
}

fn read_setup(data: &[u8], ident: &IdentHeader) -> Result<Setup> {
    let mut reader = BufReader::new(data);

    if reader.read_u8()? != VORBIS_PACKET_TYPE_SETUP {
        return setup_error("vorbis: wrong setup header packet type");
    }

    let mut sig = [0u8; 6];
    reader.read_buf_exact(&mut sig)?;

    if sig != VORBIS_HEADER_PACKET_SIGNATURE {
        return setup_error("vorbis: wrong setup header signature");
    }

    // The remainder of the setup header is read bitwise.
    let mut bs = BitReaderRtl::new(reader.read_buf_bytes_available_ref());

    let codebooks = read_codebooks(&mut bs)?;

    read_time_domain_transforms(&mut bs)?;

    let floors = read_floors(&mut bs, codebooks.len() as u8)?;

    let residues = read_residues(&mut bs, &codebooks)?;

    let mappings =
        read_mappings(&mut bs, ident.n_channels, floors.len() as u8, residues.len() as u8)?;

    let modes = read_modes(&mut bs, mappings.len() as u8)?;

    // The framing bit must be set.
    if !bs.read_bool()? {
        return setup_error("vorbis: setup header framing bit unset");
    }

    if bs.bits_left() > 0 {
        debug!("leftover bits in setup header");
    }

    Ok(Setup { codebooks, floors, residues, mappings, modes })
}

fn read_codebooks(bs: &mut BitReaderRtl<'_>) -> Result<Vec<VorbisCodebook>> {
    let count = bs.read_bits_leq32(8)? + 1;
    (0..count).map(|_| VorbisCodebook::read(bs)).collect()
}

fn read_time_domain_transforms(bs: &mut BitReaderRtl<'_>) -> Result<()> {
    let count = bs.read_bits_leq32(6)? + 1;

    for _ in 0..count {
        // Placeholders in Vorbis I; must be 0.
        if bs.read_bits_leq32(16)? != 0 {
            return setup_error("vorbis: invalid time domain transform");
        }
    }

    Ok(())
}

fn read_floors(bs: &mut BitReaderRtl<'_>, max_codebook: u8) -> Result<Vec<Floor1>> {
    let count = bs.read_bits_leq32(6)? + 1;
    (0..count).map(|_| floor::read_floor(bs, max_codebook)).collect()
}

fn read_residues(
    bs: &mut BitReaderRtl<'_>,
    codebooks: &[VorbisCodebook],
) -> Result<Vec<Residue>> {
    let count = bs.read_bits_leq32(6)? + 1;

    (0..count)
        .map(|_| {
            let residue_type = bs.read_bits_leq32(16)? as u16;

            if residue_type > 2 {
                return setup_error("vorbis: invalid residue type");
            }

            Residue::try_read(bs, residue_type, codebooks)
        })
        .collect()
}

#[derive(Debug)]
struct ChannelCouple {
    magnitude_ch: u8,
    angle_ch: u8,
}

#[derive(Debug)]
struct SubMap {
    floor: u8,
    residue: u8,
}

#[derive(Debug)]
struct Mapping {
    couplings: Vec<ChannelCouple>,
    multiplex: Vec<u8>,
    submaps: Vec<SubMap>,
}

fn read_mappings(
    bs: &mut BitReaderRtl<'_>,
    audio_channels: u8,
    max_floor: u8,
    max_residue: u8,
) -> Result<Vec<Mapping>> {
    let count = bs.read_bits_leq32(6)? + 1;

    (0..count)
        .map(|_| {
            // Only mapping type 0 exists in Vorbis I.
            if bs.read_bits_leq32(16)? != 0 {
                return setup_error("vorbis: invalid mapping type");
            }

            read_mapping_type0(bs, audio_channels, max_floor, max_residue)
        })
        .collect()
}

fn read_mapping_type0(
    bs: &mut BitReaderRtl<'_>,
    audio_channels: u8,
    max_floor: u8,
    max_residue: u8,
) -> Result<Mapping> {
    let num_submaps = if bs.read_bool()? { bs.read_bits_leq32(4)? as u8 + 1 } else { 1 };

    let mut couplings = Vec::new();

    if bs.read_bool()? {
        let coupling_steps = bs.read_bits_leq32(8)? as u16 + 1;

        couplings.reserve_exact(usize::from(coupling_steps));

        let max_ch = audio_channels - 1;
        let coupling_bits = ilog(u32::from(max_ch));

        for _ in 0..coupling_steps {
            let magnitude_ch = bs.read_bits_leq32(coupling_bits)? as u8;
            let angle_ch = bs.read_bits_leq32(coupling_bits)? as u8;

            // A channel may not couple with itself, and both channel numbers
            // must exist in the stream.
            if magnitude_ch == angle_ch || magnitude_ch > max_ch || angle_ch > max_ch {
                return setup_error("vorbis: invalid channel coupling");
            }

            couplings.push(ChannelCouple { magnitude_ch, angle_ch });
        }
    }

    if bs.read_bits_leq32(2)? != 0 {
        return setup_error("vorbis: reserved mapping bits non-zero");
    }

    let mut multiplex = Vec::with_capacity(usize::from(audio_channels));

    if num_submaps > 1 {
        for _ in 0..audio_channels {
            let mux = bs.read_bits_leq32(4)? as u8;

            if mux >= num_submaps {
                return setup_error("vorbis: invalid channel multiplex");
            }

            multiplex.push(mux);
        }
    }
    else {
        // The single-submap assignment is absent from the bitstream; every
        // channel uses submap 0.
        multiplex.resize(usize::from(audio_channels), 0);
    }

    let mut submaps = Vec::with_capacity(usize::from(num_submaps));

    for _ in 0..num_submaps {
        // Unused time configuration placeholder.
        let _ = bs.read_bits_leq32(8)?;

        let floor = bs.read_bits_leq32(8)? as u8;

        if floor >= max_floor {
            return setup_error("vorbis: invalid floor for mapping");
        }

        let residue = bs.read_bits_leq32(8)? as u8;

        if residue >= max_residue {
            return setup_error("vorbis: invalid residue for mapping");
        }

        submaps.push(SubMap { floor, residue });
    }

    Ok(Mapping { couplings, multiplex, submaps })
}

#[derive(Debug)]
struct Mode {
    block_flag: bool,
    mapping: u8,
}

fn read_modes(bs: &mut BitReaderRtl<'_>, max_mapping: u8) -> Result<Vec<Mode>> {
    let count = bs.read_bits_leq32(6)? + 1;

    (0..count)
        .map(|_| {
            let block_flag = bs.read_bool()?;
            let window_type = bs.read_bits_leq32(16)?;
            let transform_type = bs.read_bits_leq32(16)?;
            let mapping = bs.read_bits_leq32(8)? as u8;

            // Only window type 0 and transform type 0 exist in Vorbis I.
            if window_type != 0 {
                return setup_error("vorbis: invalid window type for mode");
            }

            if transform_type != 0 {
                return setup_error("vorbis: invalid transform type for mode");
            }

            if mapping >= max_mapping {
                return setup_error("vorbis: invalid mode mapping");
            }

            Ok(Mode { block_flag, mapping })
        })
        .collect()
}

/// The window geometry of one audio packet.
#[derive(Copy, Clone)]
pub(crate) struct WindowBounds {
    pub n: usize,
    pub left_start: usize,
    #[allow(dead_code)]
    pub left_end: usize,
    pub right_start: usize,
    pub right_end: usize,
    pub mode: usize,
}

/// The result of decoding one audio packet.
#[derive(Copy, Clone)]
pub(crate) struct FrameInfo {
    /// Offset of the first emitted sample within the channel buffers.
    pub left: usize,
    /// The number of emitted samples.
    pub samples: usize,
    /// Stream position of the first emitted sample, when known.
    pub position: Option<u32>,
}

/// The Vorbis packet decoder: static tables built from the three header
/// packets, per-channel DSP state, and stream-position accounting.
pub(crate) struct VorbisDecoder {
    ident: IdentHeader,
    codebooks: Vec<VorbisCodebook>,
    floors: Vec<Floor1>,
    residues: Vec<Residue>,
    mappings: Vec<Mapping>,
    modes: Vec<Mode>,
    dsp: Dsp,
    /// Sample position of the next frame to decode. Wrapping arithmetic, so
    /// the position may transiently sit "before" zero.
    current_loc: u32,
    current_loc_valid: bool,
    /// True until the first packet has been decoded.
    first_decode: bool,
    /// Samples still to be trimmed from upcoming output.
    discard_samples_deferred: u32,
}

impl VorbisDecoder {
    pub fn try_new(id_packet: &[u8], comment_packet: &[u8], setup_packet: &[u8]) -> Result<Self> {
        let ident = read_ident_header(id_packet)?;

        verify_comment_header(comment_packet)?;

        let setup = read_setup(setup_packet, &ident)?;

        let bs0 = 1usize << ident.bs0_exp;
        let bs1 = 1usize << ident.bs1_exp;

        // Floor posts are decoded into per-channel storage sized for the
        // longest post list.
        let floor_values = setup.floors.iter().map(Floor1::values).max().unwrap_or(0);

        let dsp = Dsp::new(bs0, bs1, usize::from(ident.n_channels), floor_values);

        Ok(VorbisDecoder {
            ident,
            codebooks: setup.codebooks,
            floors: setup.floors,
            residues: setup.residues,
            mappings: setup.mappings,
            modes: setup.modes,
            dsp,
            current_loc: 0,
            current_loc_valid: false,
            first_decode: true,
            discard_samples_deferred: 0,
        })
    }

    pub fn info(&self) -> Info {
        Info {
            channels: self.ident.n_channels,
            sample_rate: self.ident.sample_rate,
            max_frame_size: self.blocksize(true),
        }
    }

    pub fn channels(&self) -> usize {
        usize::from(self.ident.n_channels)
    }

    pub fn sample_rate(&self) -> u32 {
        self.ident.sample_rate
    }

    pub fn blocksize(&self, long: bool) -> usize {
        if long {
            1 << self.ident.bs1_exp
        }
        else {
            1 << self.ident.bs0_exp
        }
    }

    /// Gets a channel's whole working buffer. Frame accessors slice the
    /// emitted region out of it.
    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.dsp.channels[ch].buf
    }

    /// The stream position of the next sample to be decoded, when known.
    pub fn sample_position(&self) -> Option<u32> {
        if self.current_loc_valid {
            Some(self.current_loc)
        }
        else {
            None
        }
    }

    pub fn previous_length(&self) -> usize {
        self.dsp.previous_length
    }

    /// Resets decode state after a byte-level reposition (seek). The next
    /// frame has no predecessor and its position is unknown until a granule
    /// is observed.
    pub fn reset(&mut self) {
        self.dsp.reset();
        self.current_loc_valid = false;
        self.first_decode = false;
        self.discard_samples_deferred = 0;
    }

    /// Resets decode state to the beginning of the stream.
    pub fn reset_to_start(&mut self) {
        self.dsp.reset();
        self.current_loc = 0;
        self.current_loc_valid = false;
        self.first_decode = true;
        self.discard_samples_deferred = 0;
    }

    /// Adopts the stream position recovered by the push-mode resync scanner.
    pub fn resync(&mut self, loc: Option<u32>) {
        self.dsp.reset();
        self.discard_samples_deferred = 0;
        self.first_decode = false;

        match loc {
            Some(loc) => {
                self.current_loc = loc;
                self.current_loc_valid = true;
            }
            None => self.current_loc_valid = false,
        }
    }

    /// Parses the mode number and window flags of an audio packet and derives
    /// the window geometry. Returns `None` for non-audio packets.
    pub(crate) fn packet_window(&self, data: &[u8]) -> Result<Option<WindowBounds>> {
        let mut bs = BitReaderRtl::new(data);

        // The first bit must be 0 for an audio packet.
        match bs.read_bool() {
            Ok(false) => (),
            Ok(true) => return Ok(None),
            Err(_) => return Ok(None),
        }

        self.read_window_bounds(&mut bs).map(Some)
    }

    fn read_window_bounds(&self, bs: &mut BitReaderRtl<'_>) -> Result<WindowBounds> {
        let truncated = |_| Error::InvalidStream("vorbis: truncated packet header");

        let num_modes = self.modes.len() as u32;

        let mode_idx = bs.read_bits_leq32(ilog(num_modes - 1)).map_err(truncated)? as usize;

        if mode_idx >= self.modes.len() {
            return decode_error("vorbis: invalid packet mode number");
        }

        let mode = &self.modes[mode_idx];

        let bs0 = self.blocksize(false);

        let (n, prev, next) = if mode.block_flag {
            // A long block's halves lap with whichever block size precedes
            // and follows it.
            let prev = bs.read_bool().map_err(truncated)?;
            let next = bs.read_bool().map_err(truncated)?;

            (self.blocksize(true), prev, next)
        }
        else {
            (bs0, false, false)
        };

        let window_center = n >> 1;

        let (left_start, left_end) = if mode.block_flag && !prev {
            ((n - bs0) >> 2, (n + bs0) >> 2)
        }
        else {
            (0, window_center)
        };

        let (right_start, right_end) = if mode.block_flag && !next {
            ((n * 3 - bs0) >> 2, (n * 3 + bs0) >> 2)
        }
        else {
            (window_center, n)
        };

        Ok(WindowBounds { n, left_start, left_end, right_start, right_end, mode: mode_idx })
    }

    /// Decodes one packet through the full pipeline and completes the frame.
    /// Returns `None` for non-audio packets.
    pub fn decode_packet(&mut self, packet: &OggPacket) -> Result<Option<FrameInfo>> {
        let data = &packet.data;

        let mut bs = BitReaderRtl::new(data);

        match bs.read_bool() {
            Ok(false) => (),
            // A header-type packet between audio packets carries no audio.
            Ok(true) => return Ok(None),
            // An empty packet.
            Err(_) => return Ok(None),
        }

        let bounds = self.read_window_bounds(&mut bs)?;

        let mode = &self.modes[bounds.mode];
        let mapping = &self.mappings[usize::from(mode.mapping)];

        let n = bounds.n;
        let n2 = n >> 1;

        // Floor decode. One floor per channel, selected through the
        // channel's submap.
        for (i, channel) in self.dsp.channels.iter_mut().enumerate() {
            let submap = &mapping.submaps[usize::from(mapping.multiplex[i])];
            let floor = &self.floors[usize::from(submap.floor)];

            let used = floor.read_channel(&mut bs, &self.codebooks, &mut channel.final_y)?;

            channel.do_not_decode = !used;
            channel.really_zero = !used;
        }

        // Non-zero vector propagation: a coupled pair decodes residue if
        // either channel has an active floor.
        for couple in &mapping.couplings {
            let m = usize::from(couple.magnitude_ch);
            let a = usize::from(couple.angle_ch);

            if self.dsp.channels[m].do_not_decode != self.dsp.channels[a].do_not_decode {
                self.dsp.channels[m].do_not_decode = false;
                self.dsp.channels[a].do_not_decode = false;
            }
        }

        // Residue decode, one submap at a time over the channels assigned to
        // it.
        for (submap_idx, submap) in mapping.submaps.iter().enumerate() {
            let residue = &self.residues[usize::from(submap.residue)];

            let mut bufs: Vec<Option<&mut [f32]>> = Vec::with_capacity(self.dsp.channels.len());

            for (ch_idx, channel) in self.dsp.channels.iter_mut().enumerate() {
                if usize::from(mapping.multiplex[ch_idx]) != submap_idx {
                    continue;
                }

                if channel.do_not_decode {
                    bufs.push(None);
                }
                else {
                    bufs.push(Some(&mut channel.buf[..n2]));
                }
            }

            residue.read_residue(
                &mut bs,
                &self.codebooks,
                n2,
                &mut bufs,
                &mut self.dsp.residue_scratch,
            )?;
        }

        // Inverse coupling, in reverse step order.
        for couple in mapping.couplings.iter().rev() {
            debug_assert!(couple.magnitude_ch != couple.angle_ch);

            let (magnitude_ch, angle_ch) = if couple.magnitude_ch < couple.angle_ch {
                let (head, tail) =
                    self.dsp.channels.split_at_mut(usize::from(couple.angle_ch));
                (&mut head[usize::from(couple.magnitude_ch)], &mut tail[0])
            }
            else {
                let (head, tail) =
                    self.dsp.channels.split_at_mut(usize::from(couple.magnitude_ch));
                (&mut tail[0], &mut head[usize::from(couple.angle_ch)])
            };

            for (m, a) in
                magnitude_ch.buf[..n2].iter_mut().zip(&mut angle_ch.buf[..n2])
            {
                let (new_m, new_a) = if *m > 0.0 {
                    if *a > 0.0 {
                        (*m, *m - *a)
                    }
                    else {
                        (*m + *a, *m)
                    }
                }
                else {
                    if *a > 0.0 {
                        (*m, *m + *a)
                    }
                    else {
                        (*m - *a, *m)
                    }
                };

                *m = new_m;
                *a = new_a;
            }
        }

        // Floor synthesis, deferred until after coupling: render the curve
        // and multiply it into the residue spectrum.
        for (i, channel) in self.dsp.channels.iter_mut().enumerate() {
            if channel.really_zero {
                channel.buf[..n2].fill(0.0);
                continue;
            }

            let submap = &mapping.submaps[usize::from(mapping.multiplex[i])];
            let floor = &self.floors[usize::from(submap.floor)];

            floor.synthesis(&channel.final_y, n2, &mut channel.buf[..n2]);
        }

        // Inverse MDCT, in-place per channel.
        {
            let Dsp { channels, imdct, .. } = &mut self.dsp;
            let imdct = &mut imdct[usize::from(mode.block_flag)];

            for channel in channels.iter_mut() {
                imdct.imdct(&mut channel.buf[..n]);
            }
        }

        Ok(Some(self.finish_packet(packet, bounds)))
    }

    /// Sample-position accounting and overlap-add for a decoded packet.
    fn finish_packet(&mut self, packet: &OggPacket, bounds: WindowBounds) -> FrameInfo {
        let n = bounds.n;
        let n2 = n >> 1;

        let mut left_start = bounds.left_start;
        let right_start = bounds.right_start;
        let right_end = bounds.right_end;

        if self.first_decode {
            // The first frame's left half has no predecessor, so position the
            // counter such that the first emitted sample lands at 0. Anything
            // past the right window start of this frame is trimmed from
            // subsequent output.
            self.current_loc = (n2 as u32).wrapping_neg();
            self.discard_samples_deferred = (n - right_end) as u32;
            self.current_loc_valid = true;
            self.first_decode = false;
        }
        else if self.discard_samples_deferred > 0 {
            let span = (right_start - left_start) as u32;

            if self.discard_samples_deferred >= span {
                self.discard_samples_deferred -= span;
                left_start = right_start;
            }
            else {
                left_start += self.discard_samples_deferred as usize;
                self.discard_samples_deferred = 0;
            }
        }

        let mut len = right_end;

        // Synchronize against the granule position if this packet is the one
        // the page attributes it to.
        if let Some(absgp) = packet.granule {
            let known_loc = saturate_granule(absgp);

            if known_loc != SAMPLE_UNKNOWN {
                if self.current_loc_valid && packet.is_last_page {
                    // The granule of the final page caps the stream: infer
                    // the length of the (probably short) final frame.
                    let current_end = known_loc.wrapping_sub((n - right_end) as u32);

                    if current_end
                        < self.current_loc.wrapping_add((right_end - left_start) as u32)
                    {
                        if current_end < self.current_loc {
                            // Negative truncation.
                            len = 0;
                        }
                        else {
                            len = (current_end - self.current_loc) as usize;
                        }

                        len += left_start;

                        if len > right_end {
                            len = right_end;
                        }

                        let position = Some(self.current_loc);

                        self.current_loc = self.current_loc.wrapping_add(len as u32);

                        let samples = self.dsp.finish_frame(len, left_start, right_start);

                        return FrameInfo { left: left_start, samples, position };
                    }
                }

                // The granule refers to the window center of the packet.
                self.current_loc = known_loc.wrapping_sub((n2 - left_start) as u32);
                self.current_loc_valid = true;
            }
        }

        let position = if self.current_loc_valid { Some(self.current_loc) } else { None };

        if self.current_loc_valid {
            self.current_loc = self.current_loc.wrapping_add((right_start - left_start) as u32);
        }

        let samples = self.dsp.finish_frame(len, left_start, right_start);

        FrameInfo { left: left_start, samples, position }
    }
}

/// A decoded frame of audio: one slice of samples per channel, all the same
/// length, in stream order.
pub struct Frame<'a> {
    dec: &'a VorbisDecoder,
    left: usize,
    len: usize,
    position: Option<u32>,
}

impl<'a> Frame<'a> {
    pub(crate) fn new(dec: &'a VorbisDecoder, info: FrameInfo) -> Frame<'a> {
        Frame { dec, left: info.left, len: info.samples, position: info.position }
    }

    pub(crate) fn new_trimmed(
        dec: &'a VorbisDecoder,
        info: FrameInfo,
        skip: usize,
        position: u32,
    ) -> Frame<'a> {
        Frame { dec, left: info.left + skip, len: info.samples - skip, position: Some(position) }
    }

    /// The number of channels.
    pub fn num_channels(&self) -> usize {
        self.dec.channels()
    }

    /// The number of samples in each channel of this frame. May be 0 for the
    /// first frame after opening, a seek, or a flush.
    pub fn samples(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The stream position of this frame's first sample, when known.
    pub fn sample_offset(&self) -> Option<u32> {
        self.position
    }

    /// Gets the samples of channel `ch`.
    pub fn chan(&self, ch: usize) -> &[f32] {
        &self.dec.channel(ch)[self.left..self.left + self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::{read_ident_header, verify_comment_header};
    use resona_core::errors::Error;

    fn ident_packet(channels: u8, sample_rate: u32, block_sizes: u8, framing: u8) -> Vec<u8> {
        let mut packet = vec![0x01];
        packet.extend_from_slice(b"vorbis");
        packet.extend_from_slice(&0u32.to_le_bytes());
        packet.push(channels);
        packet.extend_from_slice(&sample_rate.to_le_bytes());
        packet.extend_from_slice(&[0u8; 12]);
        packet.push(block_sizes);
        packet.push(framing);
        packet
    }

    #[test]
    fn verify_read_ident_header() {
        // blocksize_0 = 2^8, blocksize_1 = 2^11.
        let header = read_ident_header(&ident_packet(2, 44100, 0xb8, 0x01)).unwrap();

        assert_eq!(header.n_channels, 2);
        assert_eq!(header.sample_rate, 44100);
        assert_eq!(header.bs0_exp, 8);
        assert_eq!(header.bs1_exp, 11);
    }

    #[test]
    fn verify_ident_rejects_zero_channels() {
        match read_ident_header(&ident_packet(0, 44100, 0xb8, 0x01)) {
            Err(Error::InvalidFirstPage(_)) => (),
            _ => panic!("expected invalid-first-page"),
        }
    }

    #[test]
    fn verify_ident_rejects_blocksizes() {
        // blocksize_0 > blocksize_1.
        assert!(read_ident_header(&ident_packet(1, 44100, 0x8b, 0x01)).is_err());
        // blocksize exponent out of range.
        assert!(read_ident_header(&ident_packet(1, 44100, 0xe5, 0x01)).is_err());
    }

    #[test]
    fn verify_ident_rejects_unset_framing() {
        assert!(read_ident_header(&ident_packet(1, 44100, 0xb8, 0x00)).is_err());
    }

    #[test]
    fn verify_ident_rejects_wrong_length() {
        assert!(read_ident_header(&[0x01]).is_err());
    }

    #[test]
    fn verify_comment_header_check() {
        let mut packet = vec![0x03];
        packet.extend_from_slice(b"vorbis");
        assert!(verify_comment_header(&packet).is_ok());

        packet[0] = 0x01;
        assert!(verify_comment_header(&packet).is_err());
    }
}
