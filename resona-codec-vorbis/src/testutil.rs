// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test support: synthesises a minimal but fully valid Ogg Vorbis stream.

use resona_core::checksum::Crc32;
use resona_core::io::Monitor;

/// Writes unsigned integers LSb first, the Vorbis bitpacking convention.
pub struct BitWriter {
    bytes: Vec<u8>,
    acc: u64,
    n_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        BitWriter { bytes: Vec::new(), acc: 0, n_bits: 0 }
    }

    pub fn put(&mut self, value: u32, bits: u32) {
        self.acc |= u64::from(value) << self.n_bits;
        self.n_bits += bits;

        while self.n_bits >= 8 {
            self.bytes.push(self.acc as u8);
            self.acc >>= 8;
            self.n_bits -= 8;
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.n_bits > 0 {
            self.bytes.push(self.acc as u8);
        }
        self.bytes
    }
}

/// Builds one page with a valid checksum.
pub fn build_page(
    flags: u8,
    absgp: u64,
    serial: u32,
    sequence: u32,
    packets: &[&[u8]],
) -> Vec<u8> {
    let mut lacing = Vec::new();
    let mut body = Vec::new();

    for packet in packets {
        // All test packets are shorter than 255 bytes.
        assert!(packet.len() < 255);
        lacing.push(packet.len() as u8);
        body.extend_from_slice(packet);
    }

    let mut page = Vec::new();
    page.extend_from_slice(b"OggS");
    page.push(0);
    page.push(flags);
    page.extend_from_slice(&absgp.to_le_bytes());
    page.extend_from_slice(&serial.to_le_bytes());
    page.extend_from_slice(&sequence.to_le_bytes());
    page.extend_from_slice(&[0u8; 4]);
    page.push(lacing.len() as u8);
    page.extend_from_slice(&lacing);
    page.extend_from_slice(&body);

    let mut crc = Crc32::new(0);
    crc.process_buf_bytes(&page);
    page[22..26].copy_from_slice(&crc.crc().to_le_bytes());

    page
}

/// The identification header: mono, 44.1 kHz, both block sizes 64.
fn ident_packet() -> Vec<u8> {
    let mut packet = vec![0x01];
    packet.extend_from_slice(b"vorbis");
    packet.extend_from_slice(&0u32.to_le_bytes());
    packet.push(1);
    packet.extend_from_slice(&44100u32.to_le_bytes());
    packet.extend_from_slice(&[0u8; 12]);
    packet.push(0x66);
    packet.push(0x01);
    packet
}

fn comment_packet() -> Vec<u8> {
    let mut packet = vec![0x03];
    packet.extend_from_slice(b"vorbis");
    // Vendor string and tag count; the decoder skips the body.
    packet.extend_from_slice(&0u32.to_le_bytes());
    packet.extend_from_slice(&0u32.to_le_bytes());
    packet.push(0x01);
    packet
}

/// A setup header with one scalar codebook, one trivial floor, one fully
/// silent residue, one mapping, and one short-block mode.
fn setup_packet() -> Vec<u8> {
    let mut bw = BitWriter::new();

    // One codebook: 1 dimension, 2 entries of codeword length 1, no lookup.
    bw.put(0, 8);
    bw.put(0x564342, 24);
    bw.put(1, 16);
    bw.put(2, 24);
    bw.put(0, 1);
    bw.put(0, 1);
    bw.put(0, 5);
    bw.put(0, 5);
    bw.put(0, 4);

    // One time-domain transform placeholder.
    bw.put(0, 6);
    bw.put(0, 16);

    // One floor of type 1 with no partitions: just the two range posts.
    bw.put(0, 6);
    bw.put(1, 16);
    bw.put(0, 5);
    bw.put(0, 2);
    bw.put(6, 4);

    // One residue of type 1 over [0, 32), partition size 32, one
    // classification with no coded passes.
    bw.put(0, 6);
    bw.put(1, 16);
    bw.put(0, 24);
    bw.put(32, 24);
    bw.put(31, 24);
    bw.put(0, 6);
    bw.put(0, 8);
    bw.put(0, 3);
    bw.put(0, 1);

    // One mapping: one submap, no coupling, floor 0 and residue 0.
    bw.put(0, 6);
    bw.put(0, 16);
    bw.put(0, 1);
    bw.put(0, 1);
    bw.put(0, 2);
    bw.put(0, 8);
    bw.put(0, 8);
    bw.put(0, 8);

    // One mode: short blocks, mapping 0.
    bw.put(0, 6);
    bw.put(0, 1);
    bw.put(0, 16);
    bw.put(0, 16);
    bw.put(0, 8);

    // Framing bit.
    bw.put(1, 1);

    let mut packet = vec![0x05];
    packet.extend_from_slice(b"vorbis");
    packet.extend(bw.finish());
    packet
}

pub const TEST_SERIAL: u32 = 0x0b0c_0d0e;

/// Builds a complete stream of `num_audio_packets` silent 64-sample frames,
/// 4 audio packets per page. Returns the stream bytes and the total number
/// of decodable samples (the final granule position).
pub fn build_test_stream(num_audio_packets: usize) -> (Vec<u8>, u32) {
    assert!(num_audio_packets >= 1);

    let id = ident_packet();
    let comment = comment_packet();
    let setup = setup_packet();

    let mut data = build_page(0x02, 0, TEST_SERIAL, 0, &[&id]);
    data.extend(build_page(0x00, 0, TEST_SERIAL, 1, &[&comment, &setup]));

    // Each frame spans 64 samples with a 32 sample lap; the granule counts
    // the samples finished by a page's last packet.
    let audio = [0x00u8];

    let mut packet_idx = 0;
    let mut sequence = 2;

    while packet_idx < num_audio_packets {
        let in_page = (num_audio_packets - packet_idx).min(4);

        let packets: Vec<&[u8]> = (0..in_page).map(|_| &audio[..]).collect();

        packet_idx += in_page;

        let granule = u64::from(granule_after(packet_idx));
        let is_last = packet_idx == num_audio_packets;

        data.extend(build_page(
            if is_last { 0x04 } else { 0x00 },
            granule,
            TEST_SERIAL,
            sequence,
            &packets,
        ));

        sequence += 1;
    }

    (data, granule_after(num_audio_packets))
}

/// The stream position after `packets` audio packets: the first frame emits
/// nothing, every later frame emits 32 samples.
fn granule_after(packets: usize) -> u32 {
    (packets as u32) * 32 - 32
}
