// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::min;

use resona_core::errors::{setup_error, Result};
use resona_core::io::{BitReaderRtl, ReadBitsRtl};

use super::codebook::VorbisCodebook;

/// Working storage reused across residue decodes to avoid per-packet
/// allocation.
#[derive(Default)]
pub struct ResidueScratch {
    /// Decoded classwords, one row of `class_sets` per channel.
    class_words: Vec<u32>,
}

impl ResidueScratch {
    #[inline(always)]
    fn reserve(&mut self, len: usize) {
        if self.class_words.len() < len {
            self.class_words.resize(len, 0);
        }
    }
}

/// A residue configuration: the partitioned VQ coding of the high-resolution
/// spectral detail over `[begin, end)`.
pub struct Residue {
    residue_type: u16,
    begin: u32,
    end: u32,
    part_size: u32,
    classbook: u8,
    /// Codebook number per classification and pass, -1 when the pass is
    /// skipped.
    books: Box<[[i16; 8]]>,
    /// Memoised base-`classifications` decomposition of every classword the
    /// classbook can decode, `classwords` digits per row. Elides the divides
    /// from the partition loop.
    classdata: Box<[u8]>,
    /// Partitions coded per classword; the classbook's dimension count.
    classwords: usize,
}

impl Residue {
    pub fn try_read(
        bs: &mut BitReaderRtl<'_>,
        residue_type: u16,
        codebooks: &[VorbisCodebook],
    ) -> Result<Self> {
        let begin = bs.read_bits_leq32(24)?;
        let end = bs.read_bits_leq32(24)?;
        let part_size = bs.read_bits_leq32(24)? + 1;
        let classifications = bs.read_bits_leq32(6)? as u8 + 1;
        let classbook = bs.read_bits_leq32(8)? as u8;

        if end < begin {
            return setup_error("vorbis: invalid residue range");
        }

        if usize::from(classbook) >= codebooks.len() {
            return setup_error("vorbis: invalid residue classbook");
        }

        // The bitmap of coded passes for each classification.
        let mut cascade = [0u8; 64];

        for flags in cascade[..usize::from(classifications)].iter_mut() {
            let low_bits = bs.read_bits_leq32(3)? as u8;

            let high_bits =
                if bs.read_bool()? { bs.read_bits_leq32(5)? as u8 } else { 0 };

            *flags = (high_bits << 3) | low_bits;
        }

        let mut books = vec![[-1i16; 8]; usize::from(classifications)];

        for (class_books, &flags) in books.iter_mut().zip(&cascade) {
            for (pass, book) in class_books.iter_mut().enumerate() {
                if flags & (1 << pass) != 0 {
                    let number = bs.read_bits_leq32(8)? as i16;

                    if number as usize >= codebooks.len() {
                        return setup_error("vorbis: invalid residue codebook");
                    }

                    *book = number;
                }
            }
        }

        let class_codebook = &codebooks[usize::from(classbook)];
        let classwords = usize::from(class_codebook.dimensions());

        if classwords == 0 {
            return setup_error("vorbis: residue classbook has no dimensions");
        }

        // Precompute the classification digits of every possible classword.
        let entries = class_codebook.entries() as usize;
        let mut classdata = vec![0u8; entries * classwords];

        for (q, row) in classdata.chunks_exact_mut(classwords).enumerate() {
            let mut temp = q;

            for digit in row.iter_mut().rev() {
                *digit = (temp % usize::from(classifications)) as u8;
                temp /= usize::from(classifications);
            }
        }

        Ok(Residue {
            residue_type,
            begin,
            end,
            part_size,
            classbook,
            books: books.into_boxed_slice(),
            classdata: classdata.into_boxed_slice(),
            classwords,
        })
    }

    /// Decodes this residue into the spectra of the channels listed in
    /// `bufs`, in channel order. `None` entries mark channels whose floor is
    /// unused; they are not decoded, but still occupy an interleave slot for
    /// format 2.
    pub fn read_residue(
        &self,
        bs: &mut BitReaderRtl<'_>,
        codebooks: &[VorbisCodebook],
        n2: usize,
        bufs: &mut [Option<&mut [f32]>],
        scratch: &mut ResidueScratch,
    ) -> Result<()> {
        // Zero the spectra of all decodable channels.
        for buf in bufs.iter_mut().flatten() {
            buf[..n2].fill(0.0);
        }

        // A packet may legally end anywhere within the residue data; decoded
        // partitions up-to that point stand.
        match self.read_residue_inner(bs, codebooks, n2, bufs, scratch) {
            Err(ref err) if err.is_end_of_packet() => Ok(()),
            result => result,
        }
    }

    fn read_residue_inner(
        &self,
        bs: &mut BitReaderRtl<'_>,
        codebooks: &[VorbisCodebook],
        n2: usize,
        bufs: &mut [Option<&mut [f32]>],
        scratch: &mut ResidueScratch,
    ) -> Result<()> {
        let ch = bufs.len();

        if ch == 0 || !bufs.iter().any(Option::is_some) {
            // Nothing to decode; for format 2 this also skips the bitstream
            // reads entirely.
            return Ok(());
        }

        let class_book = &codebooks[usize::from(self.classbook)];

        // The length of the coded vector: one channel's spectrum for formats
        // 0 and 1, all assigned channels interleaved for format 2.
        let actual_size = if self.residue_type == 2 { n2 * ch } else { n2 };

        let limit_begin = min(self.begin as usize, actual_size);
        let limit_end = min(self.end as usize, actual_size);

        let part_size = self.part_size as usize;
        let part_read = (limit_end - limit_begin) / part_size;

        let classwords = self.classwords;
        let class_sets = (part_read + classwords - 1) / classwords;

        if self.residue_type == 2 && ch != 1 {
            // Format 2: one classification stream, all channels interleaved.
            scratch.reserve(class_sets);

            for pass in 0..8 {
                let mut pcount = 0;
                let mut class_set = 0;

                while pcount < part_read {
                    let z = limit_begin + pcount * part_size;
                    let mut c_inter = z % ch;
                    let mut p_inter = z / ch;

                    if pass == 0 {
                        scratch.class_words[class_set] = class_book.read_scalar(bs)?;
                    }

                    let q = scratch.class_words[class_set] as usize;
                    let row = &self.classdata[q * classwords..(q + 1) * classwords];

                    let mut i = 0;

                    while i < classwords && pcount < part_read {
                        let class = usize::from(row[i]);
                        let book = self.books[class][pass];

                        if book >= 0 {
                            decode_deinterleave_repeat(
                                bs,
                                &codebooks[book as usize],
                                bufs,
                                ch,
                                &mut c_inter,
                                &mut p_inter,
                                n2,
                                part_size,
                            )?;
                        }
                        else {
                            // Skip the partition; re-derive the interleave
                            // cursor for the next one.
                            let z = limit_begin + (pcount + 1) * part_size;
                            c_inter = z % ch;
                            p_inter = z / ch;
                        }

                        i += 1;
                        pcount += 1;
                    }

                    class_set += 1;
                }
            }

            return Ok(());
        }

        // Formats 0 and 1 (and format 2 with a single channel): each channel
        // carries its own classification stream.
        scratch.reserve(ch * class_sets);

        for pass in 0..8 {
            let mut pcount = 0;
            let mut class_set = 0;

            while pcount < part_read {
                if pass == 0 {
                    for (j, buf) in bufs.iter().enumerate() {
                        if buf.is_some() {
                            scratch.class_words[j * class_sets + class_set] =
                                class_book.read_scalar(bs)?;
                        }
                    }
                }

                let mut i = 0;

                while i < classwords && pcount < part_read {
                    for (j, buf) in bufs.iter_mut().enumerate() {
                        let target = match buf {
                            Some(target) => target,
                            None => continue,
                        };

                        let q = scratch.class_words[j * class_sets + class_set] as usize;
                        let class = usize::from(self.classdata[q * classwords + i]);
                        let book = self.books[class][pass];

                        if book >= 0 {
                            let offset = limit_begin + pcount * part_size;

                            decode_partition(
                                bs,
                                &codebooks[book as usize],
                                target,
                                offset,
                                part_size,
                                self.residue_type,
                            )?;
                        }
                    }

                    i += 1;
                    pcount += 1;
                }

                class_set += 1;
            }
        }

        Ok(())
    }
}

/// Decodes one partition of a format 0 or 1 residue into `target`.
fn decode_partition(
    bs: &mut BitReaderRtl<'_>,
    codebook: &VorbisCodebook,
    target: &mut [f32],
    offset: usize,
    part_size: usize,
    residue_type: u16,
) -> Result<()> {
    let dims = usize::from(codebook.dimensions());

    if residue_type == 0 {
        // Interleaved: vector element i lands every `step` bins.
        let step = part_size / dims;

        for k in 0..step {
            let vq = codebook.read_vq(bs)?;

            for (i, &v) in vq.iter().enumerate() {
                target[offset + k + i * step] += v;
            }
        }
    }
    else {
        // Sequential.
        let mut k = 0;

        while k < part_size {
            let vq = codebook.read_vq(bs)?;

            let len = min(dims, part_size - k);

            for (o, &v) in target[offset + k..offset + k + len].iter_mut().zip(vq) {
                *o += v;
            }

            k += dims;
        }
    }

    Ok(())
}

/// The format 2 hot primitive: decodes VQ vectors and scatters their scalars
/// across the channel spectra in interleaved order, wrapping from the last
/// channel back to the first.
#[allow(clippy::too_many_arguments)]
fn decode_deinterleave_repeat(
    bs: &mut BitReaderRtl<'_>,
    codebook: &VorbisCodebook,
    bufs: &mut [Option<&mut [f32]>],
    ch: usize,
    c_inter: &mut usize,
    p_inter: &mut usize,
    len: usize,
    total_decode: usize,
) -> Result<()> {
    let dims = usize::from(codebook.dimensions());

    let mut remaining = total_decode;

    while remaining > 0 {
        let vq = codebook.read_vq(bs)?;

        // Cap the scatter at the end of the virtual interleaved vector.
        let pos = *p_inter * ch + *c_inter;
        let effective = min(dims, (len * ch).saturating_sub(pos));

        if effective == 0 {
            break;
        }

        for &v in &vq[..effective] {
            if let Some(buf) = &mut bufs[*c_inter] {
                buf[*p_inter] += v;
            }

            *c_inter += 1;
            if *c_inter == ch {
                *c_inter = 0;
                *p_inter += 1;
            }
        }

        remaining = remaining.saturating_sub(effective);
    }

    Ok(())
}
