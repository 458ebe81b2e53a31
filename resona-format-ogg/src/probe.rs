// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-offset page probing in support of seeking and length measurement.

use std::io::SeekFrom;

use resona_core::checksum::Crc32;
use resona_core::errors::{Error, Result};
use resona_core::io::{MediaSourceStream, Monitor, ReadBytes, SeekBuffered};

use super::{OGG_PAGE_HEADER_SIZE, OGG_PAGE_MARKER};

/// A granule position that could not be read or is unknown.
pub const SAMPLE_UNKNOWN: u32 = u32::MAX;

/// Location and granule information for a page found by probing.
#[derive(Copy, Clone, Default)]
pub struct ProbedPage {
    /// Byte offset of the page's capture pattern.
    pub page_start: u64,
    /// Byte offset one past the page's last byte.
    pub page_end: u64,
    /// The page's granule position saturated to 32 bits, or
    /// [`SAMPLE_UNKNOWN`].
    pub last_decoded_sample: u32,
}

/// Saturates a 64-bit granule position to the 32-bit sample positions used
/// throughout the decoder. A granule of all-ones is unknown.
pub fn saturate_granule(absgp: u64) -> u32 {
    if absgp == u64::MAX {
        SAMPLE_UNKNOWN
    }
    else if absgp >> 32 != 0 {
        u32::MAX - 1
    }
    else {
        absgp as u32
    }
}

/// Scans forward from the reader's current position for a checksum-verified
/// page.
///
/// On success, the reader is left positioned at the start of the page, and
/// the page's end offset and end-of-stream flag are returned. Returns `None`
/// when the source ends before a page verifies.
pub fn find_page(reader: &mut MediaSourceStream) -> Result<Option<(u64, bool)>> {
    loop {
        let byte = match reader.read_byte() {
            Ok(byte) => byte,
            Err(_) => return Ok(None),
        };

        if byte != b'O' {
            continue;
        }

        // Position just after the candidate's first byte, for rewinding.
        let retry_loc = reader.pos();

        // Match the remainder of the capture pattern.
        let mut matched = true;

        for &expect in &OGG_PAGE_MARKER[1..] {
            match reader.read_byte() {
                Ok(byte) if byte == expect => (),
                Ok(_) => {
                    matched = false;
                    break;
                }
                Err(_) => return Ok(None),
            }
        }

        if !matched {
            reader.seek_buffered(retry_loc);
            continue;
        }

        // Read the remainder of the header.
        let mut header = [0u8; OGG_PAGE_HEADER_SIZE];
        header[..4].copy_from_slice(&OGG_PAGE_MARKER);

        if reader.read_buf_exact(&mut header[4..]).is_err() {
            return Ok(None);
        }

        if header[4] != 0 {
            reader.seek_buffered(retry_loc);
            continue;
        }

        let goal =
            u32::from_le_bytes([header[22], header[23], header[24], header[25]]);

        header[22..26].copy_from_slice(&[0u8; 4]);

        let mut crc = Crc32::new(0);
        crc.process_buf_bytes(&header);

        // Checksum the lacing table, accumulating the body length.
        let n_segments = usize::from(header[26]);
        let mut lacing = [0u8; 255];

        if reader.read_buf_exact(&mut lacing[..n_segments]).is_err() {
            return Ok(None);
        }

        crc.process_buf_bytes(&lacing[..n_segments]);

        let body_len: usize = lacing[..n_segments].iter().map(|&l| usize::from(l)).sum();

        // Checksum the body.
        let mut remaining = body_len;
        let mut chunk = [0u8; 1024];

        let mut eof = false;

        while remaining > 0 {
            let len = remaining.min(chunk.len());

            if reader.read_buf_exact(&mut chunk[..len]).is_err() {
                eof = true;
                break;
            }

            crc.process_buf_bytes(&chunk[..len]);
            remaining -= len;
        }

        if eof {
            return Ok(None);
        }

        if crc.crc() == goal {
            let end = reader.pos();
            let is_last = header[5] & 0x04 != 0;

            // Rewind to the start of the verified page.
            reader.seek(SeekFrom::Start(retry_loc - 1))?;

            return Ok(Some((end, is_last)));
        }

        // Not a real page. Resume scanning after the candidate's first byte.
        // The candidate spans at most a maximal page, which fits within the
        // stream's seek-back window.
        reader.seek_buffered(retry_loc);
    }
}

/// Reads the extent and granule position of the page at the reader's current
/// position, restoring the position afterwards. Returns `None` if no page
/// starts here.
pub fn read_page_info(reader: &mut MediaSourceStream) -> Result<Option<ProbedPage>> {
    let page_start = reader.pos();

    let mut header = [0u8; OGG_PAGE_HEADER_SIZE];

    if reader.read_buf_exact(&mut header).is_err() {
        return Ok(None);
    }

    if header[..4] != OGG_PAGE_MARKER {
        reader.seek_buffered(page_start);
        return Ok(None);
    }

    let n_segments = usize::from(header[26]);
    let mut lacing = [0u8; 255];

    if reader.read_buf_exact(&mut lacing[..n_segments]).is_err() {
        return Ok(None);
    }

    let body_len: u64 = lacing[..n_segments].iter().map(|&l| u64::from(l)).sum();

    let page_end = page_start + (OGG_PAGE_HEADER_SIZE + n_segments) as u64 + body_len;

    let absgp = u64::from_le_bytes([
        header[6], header[7], header[8], header[9], header[10], header[11], header[12],
        header[13],
    ]);

    reader.seek_buffered(page_start);

    Ok(Some(ProbedPage {
        page_start,
        page_end,
        last_decoded_sample: saturate_granule(absgp),
    }))
}

/// Finds the last page of the stream by scanning forward from `start`,
/// following pages until one carries the end-of-stream flag or the source
/// ends.
///
/// Returns the probed last page, or an error if no page at all was found.
pub fn find_last_page(reader: &mut MediaSourceStream, start: u64) -> Result<ProbedPage> {
    reader.seek(SeekFrom::Start(start))?;

    let (mut end, mut is_last) = match find_page(reader)? {
        Some(found) => found,
        None => return Err(Error::CantFindLastPage),
    };

    let mut last_page_loc = reader.pos();

    // Keep following pages until the end-of-stream flag is seen or no
    // further page verifies.
    while !is_last {
        reader.seek(SeekFrom::Start(end))?;

        match find_page(reader)? {
            Some((next_end, next_is_last)) => {
                end = next_end;
                is_last = next_is_last;
                last_page_loc = reader.pos();
            }
            None => break,
        }
    }

    // Read the granule position out of the last page found.
    reader.seek(SeekFrom::Start(last_page_loc))?;

    let info = match read_page_info(reader)? {
        Some(info) => info,
        None => return Err(Error::CantFindLastPage),
    };

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::{find_page, read_page_info, saturate_granule, SAMPLE_UNKNOWN};
    use crate::page::build_page;
    use resona_core::io::MediaSourceStream;
    use std::io::Cursor;

    #[test]
    fn verify_saturate_granule() {
        assert_eq!(saturate_granule(u64::MAX), SAMPLE_UNKNOWN);
        assert_eq!(saturate_granule(0x1_0000_0000), u32::MAX - 1);
        assert_eq!(saturate_granule(44100), 44100);
    }

    #[test]
    fn verify_find_page_skips_garbage() {
        let page = build_page(0x04, 5000, 3, 9, &[2], &[1, 2]);

        // Garbage including a false capture prefix.
        let mut data = vec![b'O', b'g', b'g', 0x00, 0x11, 0x22];
        let garbage_len = data.len() as u64;
        data.extend_from_slice(&page);

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(data)));

        let (end, is_last) = find_page(&mut mss).unwrap().unwrap();
        assert!(is_last);
        assert_eq!(end, garbage_len + page.len() as u64);

        // The reader is left at the page start.
        let info = read_page_info(&mut mss).unwrap().unwrap();
        assert_eq!(info.page_start, garbage_len);
        assert_eq!(info.page_end, end);
        assert_eq!(info.last_decoded_sample, 5000);
    }

    #[test]
    fn verify_find_page_rejects_corrupt() {
        let mut page = build_page(0x00, 5000, 3, 9, &[2], &[1, 2]);
        let at = page.len() - 1;
        page[at] ^= 0xff;

        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(page)));

        assert!(find_page(&mut mss).unwrap().is_none());
    }
}
