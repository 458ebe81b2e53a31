// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use resona_core::checksum::Crc32;
use resona_core::errors::{decode_error, Error, Result};
use resona_core::io::{BufReader, Monitor, MonitorStream, ReadBytes, SeekBuffered};

use log::{debug, warn};

use super::{OGG_PAGE_HEADER_SIZE, OGG_PAGE_MARKER};

#[derive(Copy, Clone, Default)]
pub struct PageHeader {
    pub version: u8,
    pub absgp: u64,
    pub serial: u32,
    pub sequence: u32,
    pub crc: u32,
    pub n_segments: u8,
    pub is_continuation: bool,
    pub is_first_page: bool,
    pub is_last_page: bool,
}

/// Reads a `PageHeader` from the provided reader.
fn read_page_header<B: ReadBytes>(reader: &mut B) -> Result<PageHeader> {
    let marker = reader.read_quad_bytes()?;

    if marker != OGG_PAGE_MARKER {
        return Err(Error::MissingCapturePattern);
    }

    let version = reader.read_byte()?;

    // There is only one Ogg version, and that is version 0.
    if version != 0 {
        return Err(Error::InvalidStreamStructureVersion);
    }

    let flags = reader.read_byte()?;

    // Only the three least-significant bits are assigned.
    if flags & 0xf8 != 0 {
        return decode_error("ogg: invalid flag bits set");
    }

    let absgp = reader.read_u64()?;
    let serial = reader.read_u32()?;
    let sequence = reader.read_u32()?;
    let crc = reader.read_u32()?;
    let n_segments = reader.read_byte()?;

    Ok(PageHeader {
        version,
        absgp,
        serial,
        sequence,
        crc,
        n_segments,
        is_continuation: (flags & 0x01) != 0,
        is_first_page: (flags & 0x02) != 0,
        is_last_page: (flags & 0x04) != 0,
    })
}

/// Synchronizes the provided reader to the next page capture pattern. Does
/// not perform any further verification.
fn sync_page<B: ReadBytes>(reader: &mut B) -> Result<()> {
    let mut window = u32::from_be_bytes(reader.read_quad_bytes()?);

    while window.to_be_bytes() != OGG_PAGE_MARKER {
        window <<= 8;
        window |= u32::from(reader.read_u8()?);
    }

    Ok(())
}

/// An iterator over the complete packets within a [`Page`].
pub struct PagePackets<'a> {
    lens: std::slice::Iter<'a, u16>,
    data: &'a [u8],
}

impl<'a> PagePackets<'a> {
    /// If the page ends with an incomplete packet, gets the data belonging to
    /// it.
    pub fn partial_packet(self) -> Option<&'a [u8]> {
        let discard = usize::from(self.lens.sum::<u16>());

        if self.data.len() > discard {
            Some(&self.data[discard..])
        }
        else {
            None
        }
    }
}

impl<'a> Iterator for PagePackets<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        match self.lens.next() {
            Some(len) => {
                let (packet, rem) = self.data.split_at(usize::from(*len));
                self.data = rem;
                Some(packet)
            }
            _ => None,
        }
    }
}

/// A validated Ogg page.
pub struct Page<'a> {
    pub header: PageHeader,
    packet_lens: &'a [u16],
    page_buf: &'a [u8],
}

impl Page<'_> {
    /// Returns an iterator over all complete packets within the page.
    pub fn packets(&self) -> PagePackets<'_> {
        PagePackets { lens: self.packet_lens.iter(), data: self.page_buf }
    }

    /// Gets the number of packets completed on this page.
    pub fn num_packets(&self) -> usize {
        self.packet_lens.len()
    }
}

/// A reader of Ogg pages.
pub struct PageReader {
    header: PageHeader,
    packet_lens: Vec<u16>,
    page_buf: Vec<u8>,
    page_buf_len: usize,
}

impl PageReader {
    pub fn new() -> Self {
        PageReader {
            header: Default::default(),
            packet_lens: Vec::new(),
            page_buf: Vec::new(),
            page_buf_len: 0,
        }
    }

    /// Attempts to read the next page. If the page is corrupt or invalid, the
    /// reader is rewound to just past the sync point and an error is
    /// returned.
    pub fn try_next_page<B>(&mut self, reader: &mut B) -> Result<()>
    where
        B: ReadBytes + SeekBuffered,
    {
        let mut header_buf = [0u8; OGG_PAGE_HEADER_SIZE];
        header_buf[..4].copy_from_slice(&OGG_PAGE_MARKER);

        // Synchronize to a page capture pattern.
        sync_page(reader)?;

        // Record the position immediately after the capture pattern. If the
        // page proves corrupt, seek back here to regain synchronization.
        let sync_pos = reader.pos();

        reader.read_buf_exact(&mut header_buf[4..])?;

        let header = read_page_header(&mut BufReader::new(&header_buf))?;

        // The page checksum is computed with the checksum bytes zeroed.
        header_buf[22..26].copy_from_slice(&[0u8; 4]);

        let mut crc32 = Crc32::new(0);

        crc32.process_buf_bytes(&header_buf);

        // The remainder of the page is checksummed as it is read.
        let mut crc32_reader = MonitorStream::new(reader, crc32);

        // Read the segment table, accumulating packet lengths. A segment
        // shorter than 255 bytes ends a packet.
        let mut page_body_len = 0;
        let mut packet_len = 0;

        self.packet_lens.clear();

        for _ in 0..header.n_segments {
            let seg_len = crc32_reader.read_byte()?;

            page_body_len += usize::from(seg_len);
            packet_len += u16::from(seg_len);

            if seg_len < 255 {
                self.packet_lens.push(packet_len);
                packet_len = 0;
            }
        }

        self.read_page_body(&mut crc32_reader, page_body_len)?;

        let calculated_crc = crc32_reader.monitor().crc();

        if header.crc != calculated_crc {
            warn!("crc mismatch: expected {:#x}, got {:#x}", header.crc, calculated_crc);

            self.packet_lens.clear();
            self.page_buf_len = 0;

            crc32_reader.into_inner().seek_buffered(sync_pos);

            return decode_error("ogg: crc mismatch");
        }

        self.header = header;

        Ok(())
    }

    /// Gets the current page header.
    pub fn header(&self) -> PageHeader {
        self.header
    }

    /// Gets a reference to the current page.
    pub fn page(&self) -> Page<'_> {
        Page {
            header: self.header,
            packet_lens: &self.packet_lens,
            page_buf: &self.page_buf[..self.page_buf_len],
        }
    }

    fn read_page_body<B: ReadBytes>(&mut self, reader: &mut B, len: usize) -> Result<()> {
        // Precondition of the segment table.
        assert!(len <= 255 * 255);

        if len > self.page_buf.len() {
            // Grow the page buffer in 8 kiB blocks.
            let new_buf_len = (len + (8 * 1024 - 1)) & !(8 * 1024 - 1);
            debug!("grow page buffer to {} bytes", new_buf_len);

            self.page_buf.resize(new_buf_len, Default::default());
        }

        self.page_buf_len = len;

        reader.read_buf_exact(&mut self.page_buf[..len])?;

        Ok(())
    }
}

impl Default for PageReader {
    fn default() -> Self {
        PageReader::new()
    }
}

/// Builds a page with a self-consistent checksum from a lacing table and
/// body. Test support.
#[cfg(test)]
pub(crate) fn build_page(
    flags: u8,
    absgp: u64,
    serial: u32,
    sequence: u32,
    lacing: &[u8],
    body: &[u8],
) -> Vec<u8> {
    assert_eq!(lacing.iter().map(|&l| usize::from(l)).sum::<usize>(), body.len());

    let mut page = Vec::new();
    page.extend_from_slice(b"OggS");
    page.push(0);
    page.push(flags);
    page.extend_from_slice(&absgp.to_le_bytes());
    page.extend_from_slice(&serial.to_le_bytes());
    page.extend_from_slice(&sequence.to_le_bytes());
    page.extend_from_slice(&[0u8; 4]);
    page.push(lacing.len() as u8);
    page.extend_from_slice(lacing);
    page.extend_from_slice(body);

    let mut crc = Crc32::new(0);
    crc.process_buf_bytes(&page);
    page[22..26].copy_from_slice(&crc.crc().to_le_bytes());

    page
}

#[cfg(test)]
mod tests {
    use super::{build_page, PageReader};
    use resona_core::io::MediaSourceStream;
    use std::io::Cursor;

    #[test]
    fn verify_read_page() {
        // Two packets: 3 bytes, then 256 bytes (lace 255 + 1).
        let mut body = vec![0xaa, 0xbb, 0xcc];
        body.extend(std::iter::repeat(0x55).take(256));

        let page = build_page(0x02, 1234, 0xdead_beef, 0, &[3, 255, 1], &body);

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(page)));

        let mut pages = PageReader::new();
        pages.try_next_page(&mut mss).unwrap();

        let header = pages.header();
        assert_eq!(header.absgp, 1234);
        assert_eq!(header.serial, 0xdead_beef);
        assert!(header.is_first_page);

        let page = pages.page();
        assert_eq!(page.num_packets(), 2);

        let mut packets = page.packets();
        assert_eq!(packets.next().unwrap(), &[0xaa, 0xbb, 0xcc]);
        assert_eq!(packets.next().unwrap().len(), 256);
        assert!(packets.next().is_none());
    }

    #[test]
    fn verify_partial_packet() {
        // One complete packet and the start of another.
        let body = vec![0x11; 255 + 10];

        let page = build_page(0, u64::MAX, 1, 7, &[10, 255], &body[..265]);

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(page)));

        let mut pages = PageReader::new();
        pages.try_next_page(&mut mss).unwrap();

        let page = pages.page();
        assert_eq!(page.num_packets(), 1);

        let mut packets = page.packets();
        packets.next().unwrap();
        assert_eq!(packets.partial_packet().unwrap().len(), 255);
    }

    #[test]
    fn verify_corrupt_page_resyncs() {
        let first = build_page(0, 100, 1, 0, &[4], &[1, 2, 3, 4]);
        let second = build_page(0, 200, 1, 1, &[2], &[5, 6]);

        let mut data = first.clone();
        // Corrupt one body byte of the first page.
        let body_at = data.len() - 2;
        data[body_at] ^= 0xff;
        data.extend_from_slice(&second);

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(data)));

        let mut pages = PageReader::new();

        // The corrupt page fails with a crc mismatch.
        assert!(pages.try_next_page(&mut mss).is_err());

        // The reader resynchronizes onto the second page.
        pages.try_next_page(&mut mss).unwrap();
        assert_eq!(pages.header().absgp, 200);
        assert_eq!(pages.page().packets().next().unwrap(), &[5, 6]);
    }
}
