// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;

use resona_core::errors::{decode_error, setup_error, Error, Result};
use resona_core::io::vlc::{Codebook, CodebookBuilder};
use resona_core::io::{BitReaderRtl, ReadBitsRtl};

/// As defined in section 9.2.2 of the Vorbis I specification.
///
/// `float32_unpack` translates the packed binary representation of a Vorbis
/// codebook float value into a floating point number.
#[inline(always)]
fn float32_unpack(x: u32) -> f32 {
    let mantissa = x & 0x1fffff;
    let sign = x & 0x8000_0000;
    let exponent = (x & 0x7fe0_0000) >> 21;
    let value = (mantissa as f32) * 2.0f32.powi(exponent as i32 - 788);
    if sign == 0 {
        value
    }
    else {
        -value
    }
}

/// As defined in section 9.2.3 of the Vorbis I specification.
///
/// Returns the greatest integer for which the return value to the power of
/// `dimensions` is less than or equal to `entries`.
fn lookup1_values(entries: u32, dimensions: u16) -> u32 {
    if entries == 0 || dimensions == 0 {
        return 0;
    }

    let mut value = (entries as f32).powf(1.0f32 / f32::from(dimensions)).floor() as u32;

    // Floating-point rounding may land one off in either direction.
    while value.checked_pow(u32::from(dimensions)).map_or(true, |pow| pow > entries) {
        value -= 1;
    }
    while (value + 1).checked_pow(u32::from(dimensions)).map_or(false, |pow| pow <= entries) {
        value += 1;
    }

    value
}

fn map_vlc_error(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::InvalidData {
        Error::InvalidStream("vorbis: invalid codeword")
    }
    else {
        // End-of-bitstream. Decode stages that may legally terminate early
        // recognize this condition and unwind without error.
        Error::IoError(err)
    }
}

pub struct VorbisCodebook {
    codebook: Codebook,
    dimensions: u16,
    entries: u32,
    /// Pre-expanded VQ vectors, `dimensions` scalars per decodable entry.
    /// `None` for scalar-only codebooks.
    multiplicands: Option<Box<[f32]>>,
}

impl VorbisCodebook {
    pub fn read(bs: &mut BitReaderRtl<'_>) -> Result<Self> {
        // Verify the codebook synchronization pattern.
        let sync = bs.read_bits_leq32(24)?;

        if sync != 0x564342 {
            return setup_error("vorbis: invalid codebook sync");
        }

        let dimensions = bs.read_bits_leq32(16)? as u16;
        let entries = bs.read_bits_leq32(24)?;

        if dimensions == 0 && entries != 0 {
            return setup_error("vorbis: dimensionless codebook with entries");
        }

        let is_length_ordered = bs.read_bool()?;

        let mut code_lens = Vec::<u8>::with_capacity(entries as usize);
        let mut is_sparse = false;

        if !is_length_ordered {
            is_sparse = bs.read_bool()?;

            if is_sparse {
                // Sparsely packed codeword entry list.
                for _ in 0..entries {
                    let code_len = if bs.read_bool()? {
                        bs.read_bits_leq32(5)? as u8 + 1
                    }
                    else {
                        // Unused entries have a length of 0.
                        0
                    };

                    code_lens.push(code_len);
                }
            }
            else {
                // Densely packed codeword entry list.
                for _ in 0..entries {
                    code_lens.push(bs.read_bits_leq32(5)? as u8 + 1);
                }
            }
        }
        else {
            // Length-ordered codeword entry list: runs of entries per length.
            let mut cur_entry = 0;
            let mut cur_len = bs.read_bits_leq32(5)? + 1;

            while cur_entry < entries {
                if cur_len > 32 {
                    return setup_error("vorbis: codeword length exceeds 32");
                }

                let num_bits = super::common::ilog(entries - cur_entry);
                let num = bs.read_bits_leq32(num_bits)?;

                if cur_entry + num > entries {
                    return setup_error("vorbis: invalid codebook run length");
                }

                code_lens.extend(std::iter::repeat(cur_len as u8).take(num as usize));

                cur_len += 1;
                cur_entry += num;
            }
        }

        // A sparse codebook with a quarter or more of its entries in use is
        // promoted to a dense one.
        if is_sparse {
            let used = code_lens.iter().filter(|&&len| len > 0).count() as u32;

            if used >= entries >> 2 {
                is_sparse = false;
            }
        }

        // Read the vector-quantization lookup table.
        let lookup_type = bs.read_bits_leq32(4)?;

        let lookup = match lookup_type {
            0 => None,
            1 | 2 => {
                let min_value = float32_unpack(bs.read_bits_leq32(32)?);
                let delta_value = float32_unpack(bs.read_bits_leq32(32)?);
                let value_bits = bs.read_bits_leq32(4)? + 1;
                let sequence_p = bs.read_bool()?;

                let lookup_values = match lookup_type {
                    1 => lookup1_values(entries, dimensions),
                    _ => entries * u32::from(dimensions),
                };

                if lookup_values == 0 {
                    return setup_error("vorbis: no vq lookup values");
                }

                let mut multiplicands = Vec::<u16>::with_capacity(lookup_values as usize);

                for _ in 0..lookup_values {
                    multiplicands.push(bs.read_bits_leq32(value_bits)? as u16);
                }

                Some((min_value, delta_value, sequence_p, lookup_values, multiplicands))
            }
            _ => return setup_error("vorbis: invalid vq lookup type"),
        };

        // Build the prefix-code decoder.
        let builder =
            if is_sparse { CodebookBuilder::new_sparse() } else { CodebookBuilder::new() };

        let codebook = builder.make(&code_lens)?;

        // Pre-expand the VQ table into one full vector per decodable entry.
        // Lookup type 1 is converted to the type 2 layout here, removing the
        // per-element division from the decode path.
        let multiplicands = match lookup {
            None => None,
            Some((min_value, delta_value, sequence_p, lookup_values, mults)) => {
                let dims = usize::from(dimensions);
                let mut vq = vec![0.0f32; codebook.len() * dims];

                for (dec_idx, vector) in vq.chunks_exact_mut(dims).enumerate() {
                    let entry = codebook.value(dec_idx as u32);

                    let mut last = 0.0;

                    if lookup_type == 1 {
                        let mut div: u32 = 1;

                        for (k, value) in vector.iter_mut().enumerate() {
                            let offset = ((entry / div) % lookup_values) as usize;

                            *value =
                                f32::from(mults[offset]) * delta_value + min_value + last;

                            if sequence_p {
                                last = *value;
                            }

                            if k + 1 < dims {
                                div = match div.checked_mul(lookup_values) {
                                    Some(div) => div,
                                    None => {
                                        return setup_error(
                                            "vorbis: vq lookup index overflow",
                                        )
                                    }
                                };
                            }
                        }
                    }
                    else {
                        let offset = entry as usize * dims;

                        for (value, &mult) in vector.iter_mut().zip(&mults[offset..offset + dims])
                        {
                            *value = f32::from(mult) * delta_value + min_value + last;

                            if sequence_p {
                                last = *value;
                            }
                        }
                    }
                }

                Some(vq.into_boxed_slice())
            }
        };

        Ok(VorbisCodebook { codebook, dimensions, entries, multiplicands })
    }

    /// Decodes one codeword and returns its entry number.
    #[inline(always)]
    pub fn read_scalar(&self, bs: &mut BitReaderRtl<'_>) -> Result<u32> {
        match bs.read_codebook(&self.codebook) {
            Ok((_, value)) => Ok(value),
            Err(err) => Err(map_vlc_error(err)),
        }
    }

    /// Decodes one codeword and returns the VQ vector it indexes.
    #[inline(always)]
    pub fn read_vq(&self, bs: &mut BitReaderRtl<'_>) -> Result<&[f32]> {
        let (index, _) = match bs.read_codebook(&self.codebook) {
            Ok(decoded) => decoded,
            Err(err) => return Err(map_vlc_error(err)),
        };

        match &self.multiplicands {
            Some(vq) => {
                let dims = usize::from(self.dimensions);
                let start = dims * index as usize;

                Ok(&vq[start..start + dims])
            }
            None => decode_error("vorbis: not a vq codebook"),
        }
    }

    #[inline(always)]
    pub fn dimensions(&self) -> u16 {
        self.dimensions
    }

    #[inline(always)]
    pub fn entries(&self) -> u32 {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::{float32_unpack, lookup1_values};

    fn naive_lookup1_values(entries: u32, dimensions: u16) -> u32 {
        let mut x = 1u32;
        loop {
            let xpow = x.pow(u32::from(dimensions));
            if xpow > entries {
                break;
            }
            x += 1;
        }
        x - 1
    }

    #[test]
    fn verify_lookup1_values() {
        assert_eq!(lookup1_values(1, 1), naive_lookup1_values(1, 1));
        assert_eq!(lookup1_values(361, 2), naive_lookup1_values(361, 2));
        assert_eq!(lookup1_values(256, 4), naive_lookup1_values(256, 4));
        assert_eq!(lookup1_values(1000, 3), naive_lookup1_values(1000, 3));
    }

    #[test]
    fn verify_float32_unpack() {
        assert_eq!(float32_unpack(0), 0.0);

        // A mantissa of 1 with exponent 788 encodes exactly 1.0.
        let one = (788 << 21) | 1;
        assert_eq!(float32_unpack(one), 1.0);
        assert_eq!(float32_unpack(one | 0x8000_0000), -1.0);
    }
}
