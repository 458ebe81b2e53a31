// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use resona_core::checksum::Crc32;
use resona_core::errors::{Error, Result};
use resona_core::io::Monitor;

use super::{OggPacket, OGG_PAGE_HEADER_SIZE, OGG_PAGE_MARKER};

/// The number of overlapping page candidates tracked while resynchronizing.
/// While streaming through one candidate to verify its checksum, further
/// capture patterns may appear inside it; each gets its own scanner. The
/// minimum sensible value is 2.
pub const PAGE_SCAN_COUNT: usize = 4;

/// A streaming checksum over one page candidate.
#[derive(Copy, Clone, Default)]
struct PageScan {
    /// The checksum the candidate page declares.
    goal_crc: u32,
    /// Bytes of the candidate not yet checksummed.
    bytes_left: usize,
    /// The running checksum.
    crc: u32,
    /// Bytes of the current input buffer already consumed by this scan.
    bytes_done: usize,
    /// The granule position declared by the candidate, `u32::MAX` if the
    /// candidate's final packet continues onto the next page.
    sample_loc: u32,
}

/// A `PushStream` reads the packets of a single logical stream from buffers
/// supplied by the caller (push mode).
///
/// A call either consumes whole packets or consumes nothing and asks for more
/// data; the caller retries with the same bytes plus more appended. Page
/// headers are consumed together with the packet that completes within them,
/// so the caller's buffer always begins at a segment or page boundary known
/// to the stream.
pub struct PushStream {
    /// Lacing values of the current page.
    segments: [u8; 255],
    segment_count: usize,
    /// The next segment to consume, or -1 if a new page header is required.
    next_seg: isize,
    /// Flags of the current page.
    page_flags: u8,
    /// The segment index ending the last packet completed on the current
    /// page, or -2 if the page's granule position is unknown.
    end_seg_with_known_loc: isize,
    /// The granule position of the current page.
    known_loc: u64,
    serial: u32,
    /// True until the first page has been parsed.
    start_of_stream: bool,
    /// True while scanning for a page after a flush.
    scanning: bool,
    scans: [PageScan; PAGE_SCAN_COUNT],
    n_scans: usize,
}

impl PushStream {
    pub fn new() -> Self {
        PushStream {
            segments: [0; 255],
            segment_count: 0,
            next_seg: -1,
            page_flags: 0,
            end_seg_with_known_loc: -2,
            known_loc: 0,
            serial: 0,
            start_of_stream: true,
            scanning: false,
            scans: [Default::default(); PAGE_SCAN_COUNT],
            n_scans: 0,
        }
    }

    /// Returns true if the stream is scanning for a page after a flush.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Discards all packet state and enters scan mode. Call after a caller
    /// signalled discontinuity in the input.
    pub fn flush(&mut self) {
        self.next_seg = -1;
        self.scanning = true;
        self.n_scans = 0;
    }

    /// Extracts the next packet from `buf`, which must begin at the stream
    /// position established by previous calls.
    ///
    /// On success, returns the number of bytes consumed together with the
    /// packet. Returns [`Error::NeedMoreData`], consuming nothing, if the
    /// packet is not wholly contained in `buf`.
    ///
    /// `allow_leading_continued` permits the buffer to start inside a
    /// continued packet, whose remainder is silently discarded. This is the
    /// case immediately after resynchronization.
    pub fn next_packet(
        &mut self,
        buf: &[u8],
        allow_leading_continued: bool,
    ) -> Result<(usize, OggPacket)> {
        debug_assert!(!self.scanning);

        let mut pos = 0usize;
        let mut data = Vec::new();

        // Local page state. Committed back only when a packet completes, so
        // that a need-more-data return leaves the stream untouched.
        let mut segments = self.segments;
        let mut segment_count = self.segment_count;
        let mut next_seg = self.next_seg;
        let mut page_flags = self.page_flags;
        let mut end_known = self.end_seg_with_known_loc;
        let mut known_loc = self.known_loc;
        let mut serial = self.serial;
        let mut have_serial = !self.start_of_stream;

        // True while discarding the tail of a continued packet whose start
        // was lost.
        let mut dropping = false;

        loop {
            if next_seg < 0 {
                // A new page header is required.
                if buf.len() < pos + OGG_PAGE_HEADER_SIZE {
                    return Err(Error::NeedMoreData);
                }

                let h = &buf[pos..];

                if h[..4] != OGG_PAGE_MARKER {
                    return Err(Error::MissingCapturePattern);
                }

                if h[4] != 0 {
                    return Err(Error::InvalidStreamStructureVersion);
                }

                let flags = h[5];
                let n_segments = usize::from(h[26]);

                if buf.len() < pos + OGG_PAGE_HEADER_SIZE + n_segments {
                    return Err(Error::NeedMoreData);
                }

                if self.start_of_stream && pos == 0 {
                    // The very first page must begin a stream.
                    if flags & 0x02 == 0 {
                        return Err(Error::InvalidFirstPage("not flagged as stream start"));
                    }
                    if flags & 0x05 != 0 {
                        return Err(Error::InvalidFirstPage("invalid flags"));
                    }
                }

                let page_serial =
                    u32::from_le_bytes([h[14], h[15], h[16], h[17]]);

                if !have_serial {
                    serial = page_serial;
                    have_serial = true;
                }
                else if page_serial != serial {
                    return Err(Error::IncorrectStreamSerialNumber);
                }

                let is_continued = flags & 0x01 != 0;
                let mid_packet = !data.is_empty() || dropping;

                if mid_packet && !is_continued {
                    return Err(Error::ContinuedPacketFlagInvalid);
                }

                if !mid_packet && is_continued {
                    if !allow_leading_continued {
                        return Err(Error::ContinuedPacketFlagInvalid);
                    }
                    // Discard the continued packet's remainder.
                    dropping = true;
                }

                let granule = u64::from_le_bytes([
                    h[6], h[7], h[8], h[9], h[10], h[11], h[12], h[13],
                ]);

                segments[..n_segments].copy_from_slice(&h[27..27 + n_segments]);
                segment_count = n_segments;
                next_seg = 0;
                page_flags = flags;
                known_loc = granule;

                // The granule position belongs to the last packet that ends
                // within the page.
                end_known = -2;
                if granule != u64::MAX {
                    for i in (0..n_segments).rev() {
                        if segments[i] < 255 {
                            end_known = i as isize;
                            break;
                        }
                    }
                }

                pos += OGG_PAGE_HEADER_SIZE + n_segments;
            }

            // Consume segments until the packet completes or the page is
            // exhausted.
            while (next_seg as usize) < segment_count {
                let s = next_seg as usize;
                let seg_len = usize::from(segments[s]);

                if buf.len() < pos + seg_len {
                    return Err(Error::NeedMoreData);
                }

                if !dropping {
                    data.extend_from_slice(&buf[pos..pos + seg_len]);
                }

                pos += seg_len;
                next_seg += 1;

                if seg_len < 255 {
                    if dropping {
                        // The lost packet's tail has been discarded; the next
                        // segment starts a fresh packet.
                        dropping = false;
                        continue;
                    }

                    // The packet is complete. Commit the page state.
                    self.segments = segments;
                    self.segment_count = segment_count;
                    self.next_seg =
                        if next_seg as usize == segment_count { -1 } else { next_seg };
                    self.page_flags = page_flags;
                    self.end_seg_with_known_loc = end_known;
                    self.known_loc = known_loc;
                    self.serial = serial;
                    self.start_of_stream = false;

                    let granule =
                        if s as isize == end_known { Some(known_loc) } else { None };

                    let packet = OggPacket {
                        data: data.into_boxed_slice(),
                        granule,
                        is_last_page: page_flags & 0x04 != 0,
                    };

                    return Ok((pos, packet));
                }
            }

            // The page is exhausted mid-packet.
            next_seg = -1;
        }
    }

    /// Scans `buf` for a checksum-verified page, tracking up-to
    /// [`PAGE_SCAN_COUNT`] overlapping candidates across calls.
    ///
    /// Returns the number of bytes consumed and, once a page verifies, the
    /// granule position declared by that page (`None` if its final packet is
    /// continued). Packet extraction resumes at the page following the
    /// verified one. While no page has verified, at most `buf.len() - 3`
    /// bytes are consumed so that a capture pattern straddling the buffer end
    /// is not lost.
    pub fn scan_resync(&mut self, buf: &[u8]) -> (usize, Option<Option<u32>>) {
        debug_assert!(self.scanning);

        for scan in self.scans[..self.n_scans].iter_mut() {
            scan.bytes_done = 0;
        }

        let mut data_len = buf.len();

        // Search for new candidates first: an incomplete candidate header at
        // the end of the buffer stops consumption early so the whole header
        // is seen on the next call.
        if self.n_scans < PAGE_SCAN_COUNT {
            if data_len < 4 {
                return (0, None);
            }

            data_len -= 3;

            let mut i = 0;
            while i < data_len {
                if buf[i] == 0x4f && buf[i..i + 4] == OGG_PAGE_MARKER {
                    // Stop early unless the whole header and lacing table are
                    // present.
                    if i + 26 >= data_len || i + 27 + usize::from(buf[i + 26]) >= data_len {
                        data_len = i;
                        break;
                    }

                    let n_segments = usize::from(buf[i + 26]);

                    let mut page_len = OGG_PAGE_HEADER_SIZE + n_segments;
                    for &lace in &buf[i + 27..i + 27 + n_segments] {
                        page_len += usize::from(lace);
                    }

                    // Checksum the header with the checksum field zeroed.
                    let mut crc = Crc32::new(0);
                    crc.process_buf_bytes(&buf[i..i + 22]);
                    crc.process_buf_bytes(&[0u8; 4]);

                    let goal_crc = u32::from_le_bytes([
                        buf[i + 22],
                        buf[i + 23],
                        buf[i + 24],
                        buf[i + 25],
                    ]);

                    // If the page's final packet continues onto the next
                    // page, the granule position cannot be adopted.
                    let sample_loc =
                        if n_segments > 0 && buf[i + 27 + n_segments - 1] == 255 {
                            u32::MAX
                        }
                        else {
                            u32::from_le_bytes([
                                buf[i + 6],
                                buf[i + 7],
                                buf[i + 8],
                                buf[i + 9],
                            ])
                        };

                    self.scans[self.n_scans] = PageScan {
                        goal_crc,
                        bytes_left: page_len - 26,
                        crc: crc.crc(),
                        bytes_done: i + 26,
                        sample_loc,
                    };
                    self.n_scans += 1;

                    if self.n_scans == PAGE_SCAN_COUNT {
                        break;
                    }
                }

                i += 1;
            }
        }

        // Advance every candidate through the available bytes.
        let mut i = 0;
        while i < self.n_scans {
            let n = self.scans[i].bytes_done;
            let m = self.scans[i].bytes_left.min(data_len.saturating_sub(n));

            let mut crc = Crc32::new(self.scans[i].crc);
            crc.process_buf_bytes(&buf[n..n + m]);

            self.scans[i].crc = crc.crc();
            self.scans[i].bytes_left -= m;

            if self.scans[i].bytes_left == 0 {
                if self.scans[i].crc == self.scans[i].goal_crc {
                    // A whole page verified. Consume up-to its end and adopt
                    // its granule position.
                    let consumed = n + m;

                    let loc = if self.scans[i].sample_loc == u32::MAX {
                        None
                    }
                    else {
                        Some(self.scans[i].sample_loc)
                    };

                    self.n_scans = 0;
                    self.scanning = false;
                    self.next_seg = -1;

                    return (consumed, Some(loc));
                }

                // Checksum mismatch: discard this candidate.
                self.n_scans -= 1;
                self.scans[i] = self.scans[self.n_scans];
            }
            else {
                i += 1;
            }
        }

        (data_len, None)
    }
}

impl Default for PushStream {
    fn default() -> Self {
        PushStream::new()
    }
}

#[cfg(test)]
mod tests {
    use super::PushStream;
    use crate::page::build_page;
    use resona_core::errors::Error;

    #[test]
    fn verify_push_packet_extraction() {
        let mut data = build_page(0x02, u64::MAX, 5, 0, &[3], &[1, 2, 3]);
        data.extend(build_page(0x00, 80, 5, 1, &[2, 2], &[4, 5, 6, 7]));

        let mut stream = PushStream::new();

        // Too few bytes: need more data, nothing consumed.
        match stream.next_packet(&data[..10], false) {
            Err(Error::NeedMoreData) => (),
            _ => panic!("expected need-more-data"),
        }

        let (consumed, packet) = stream.next_packet(&data, false).unwrap();
        assert_eq!(&packet.data[..], &[1, 2, 3]);
        assert_eq!(packet.granule, None);

        let (consumed2, packet) = stream.next_packet(&data[consumed..], false).unwrap();
        assert_eq!(&packet.data[..], &[4, 5]);
        assert_eq!(packet.granule, None);

        let (_, packet) = stream.next_packet(&data[consumed + consumed2..], false).unwrap();
        assert_eq!(&packet.data[..], &[6, 7]);
        assert_eq!(packet.granule, Some(80));
    }

    #[test]
    fn verify_push_spanning_packet() {
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();

        let mut data = build_page(0x02, u64::MAX, 5, 0, &[255], &payload[..255]);
        data.extend(build_page(0x01, 300, 5, 1, &[45], &payload[255..]));

        let mut stream = PushStream::new();

        // The first page alone is not enough.
        let first_len = 27 + 1 + 255;
        match stream.next_packet(&data[..first_len], false) {
            Err(Error::NeedMoreData) => (),
            _ => panic!("expected need-more-data"),
        }

        let (consumed, packet) = stream.next_packet(&data, false).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(&packet.data[..], &payload[..]);
        assert_eq!(packet.granule, Some(300));
    }

    #[test]
    fn verify_scan_resync_finds_page() {
        let page = build_page(0x00, 1000, 5, 3, &[4], &[9, 9, 9, 9]);

        // Garbage, then a valid page, then trailing stream bytes.
        let mut data = vec![0x4f, 0x67, 0x00, 0xff, 0x13];
        data.extend_from_slice(&page);
        data.extend_from_slice(&[0u8; 8]);

        let mut stream = PushStream::new();
        stream.flush();

        assert!(stream.is_scanning());

        let (consumed, found) = stream.scan_resync(&data);
        assert_eq!(found, Some(Some(1000)));
        assert_eq!(consumed, 5 + page.len());
        assert!(!stream.is_scanning());
    }

    #[test]
    fn verify_scan_resync_chunked() {
        let page = build_page(0x00, 4321, 5, 3, &[100], &[7; 100]);

        let mut data = vec![0u8; 11];
        data.extend_from_slice(&page);
        data.extend_from_slice(&[0u8; 8]);

        let mut stream = PushStream::new();
        stream.flush();

        // Feed the input in growing windows, dropping consumed bytes like a
        // caller would.
        let mut pos = 0;
        let mut avail = 0;
        let mut found = None;

        while found.is_none() {
            avail = (avail + 17).min(data.len() - pos);

            let (consumed, result) = stream.scan_resync(&data[pos..pos + avail]);

            pos += consumed;
            avail -= consumed;
            found = result;

            if found.is_none() && consumed == 0 && pos + avail == data.len() {
                panic!("scanner stalled");
            }
        }

        assert_eq!(found, Some(Some(4321)));
    }

    #[test]
    fn verify_scan_rejects_corrupt_candidate() {
        let mut page = build_page(0x00, 1000, 5, 3, &[4], &[9, 9, 9, 9]);
        // Corrupt the body.
        let at = page.len() - 1;
        page[at] ^= 0x01;

        let good = build_page(0x00, 2000, 5, 4, &[1], &[1]);

        let mut data = page;
        data.extend_from_slice(&good);
        data.extend_from_slice(&[0u8; 8]);

        let mut stream = PushStream::new();
        stream.flush();

        let mut pos = 0;
        let mut found = None;

        while found.is_none() && pos < data.len() {
            let (consumed, result) = stream.scan_resync(&data[pos..]);
            pos += consumed;
            found = result;

            if found.is_none() && consumed == 0 {
                panic!("scanner stalled");
            }
        }

        assert_eq!(found, Some(Some(2000)));
    }
}
