// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;

use resona_core::errors::{decode_error, Error, Result};
use resona_core::io::{MediaSourceStream, ReadBytes};

use log::warn;

use super::page::PageReader;
use super::OggPacket;

/// An `OggStream` reads the packets of a single logical stream from a byte
/// source (pull mode).
///
/// Pages are validated against their checksum as they are read. A corrupt
/// page causes the reader to resynchronize to the next valid page, losing at
/// most the packets of the corrupt page. Packets spanning pages are
/// reassembled. The stream's granule positions are attached to the packets
/// that end them.
pub struct OggStream {
    reader: MediaSourceStream,
    pages: PageReader,
    /// The serial number of the logical stream.
    serial: u32,
    /// Packets assembled but not yet consumed.
    queue: VecDeque<OggPacket>,
    /// Partial packet data awaiting a continuation page.
    part_buf: Vec<u8>,
    part_len: usize,
    /// The sequence number of the previously read page.
    prev_sequence: Option<u32>,
    /// Set once a page with the end-of-stream flag has been read.
    saw_last_page: bool,
    /// The byte position immediately after the most recently read page.
    next_page_pos: u64,
}

impl OggStream {
    const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

    /// Opens the logical stream starting at the reader's current position.
    /// The first page must be flagged as the start of a stream.
    pub fn new(mut reader: MediaSourceStream) -> Result<OggStream> {
        let mut pages = PageReader::new();

        pages.try_next_page(&mut reader)?;

        let header = pages.header();

        if !header.is_first_page {
            return Err(Error::InvalidFirstPage("not flagged as stream start"));
        }
        if header.is_continuation {
            return Err(Error::InvalidFirstPage("flagged as a continuation"));
        }
        if header.is_last_page {
            return Err(Error::InvalidFirstPage("flagged as stream end"));
        }

        let next_page_pos = reader.pos();

        let mut stream = OggStream {
            reader,
            pages,
            serial: header.serial,
            queue: VecDeque::new(),
            part_buf: Vec::new(),
            part_len: 0,
            prev_sequence: None,
            saw_last_page: false,
            next_page_pos,
        };

        stream.ingest_current_page()?;

        Ok(stream)
    }

    /// Gets the next packet, or `None` at the end of the stream. A trailing
    /// packet cut short by the end of the stream is discarded.
    pub fn next_packet(&mut self) -> Result<Option<OggPacket>> {
        if !self.fill_queue()? {
            return Ok(None);
        }

        Ok(self.queue.pop_front())
    }

    /// Examines, but does not consume, the next packet.
    pub fn peek_packet(&mut self) -> Result<Option<&OggPacket>> {
        if !self.fill_queue()? {
            return Ok(None);
        }

        Ok(self.queue.front())
    }

    /// Consumes the packet returned by the previous [`OggStream::peek_packet`].
    pub fn consume_packet(&mut self) {
        self.queue.pop_front();
    }

    /// The byte position immediately after the most recently read page. This
    /// is where the next page will be read from.
    pub fn next_page_pos(&self) -> u64 {
        self.next_page_pos
    }

    pub fn is_seekable(&self) -> bool {
        self.reader.is_seekable()
    }

    pub fn byte_len(&self) -> Option<u64> {
        self.reader.byte_len()
    }

    /// Gets mutable access to the underlying byte stream for page probing.
    /// The caller must restore the stream position before resuming packet
    /// reads.
    pub fn reader(&mut self) -> &mut MediaSourceStream {
        &mut self.reader
    }

    /// Repositions the stream to an absolute byte offset and discards all
    /// framing state. Packet reading resumes at the next page boundary at or
    /// after the offset.
    pub fn seek_bytes(&mut self, pos: u64) -> Result<()> {
        self.reader.seek(std::io::SeekFrom::Start(pos))?;
        self.reset_framing();
        Ok(())
    }

    /// Discards all buffered packets and partial packet state.
    pub fn reset_framing(&mut self) {
        self.queue.clear();
        self.part_len = 0;
        self.prev_sequence = None;
        self.saw_last_page = false;
    }

    /// Ensures at least one packet is queued. Returns false at end of stream.
    fn fill_queue(&mut self) -> Result<bool> {
        while self.queue.is_empty() {
            if self.saw_last_page {
                return Ok(false);
            }

            // Read pages until one is valid, resynchronizing over corrupt
            // ones.
            loop {
                match self.pages.try_next_page(&mut self.reader) {
                    Ok(()) => break,
                    Err(Error::UnexpectedEof) => return Ok(false),
                    Err(Error::IoError(err)) => return Err(Error::IoError(err)),
                    Err(err) => {
                        warn!("{}, resynchronizing", err);
                    }
                }
            }

            let header = self.pages.header();

            if header.serial != self.serial {
                return Err(Error::IncorrectStreamSerialNumber);
            }

            // A second stream-start page indicates a chained physical stream,
            // which is not supported.
            if header.is_first_page {
                return decode_error("ogg: chained streams are not supported");
            }

            self.next_page_pos = self.reader.pos();

            self.ingest_current_page()?;
        }

        Ok(true)
    }

    /// Appends the packets of the current page to the queue.
    fn ingest_current_page(&mut self) -> Result<()> {
        let page = self.pages.page();

        // Detect page sequence discontinuities and drop any partial packet
        // data spanning them.
        if let Some(prev) = self.prev_sequence {
            if page.header.sequence < prev {
                warn!("detected page sequence non-monotonicity");
                self.part_len = 0;
            }
            else if page.header.sequence - prev > 1 {
                warn!("detected a discontinuity of {} page(s)", page.header.sequence - prev);
                self.part_len = 0;
            }
        }

        self.prev_sequence = Some(page.header.sequence);

        let mut iter = page.packets();

        // Partial packet data requires a continuation page, and vice-versa.
        if !page.header.is_continuation && self.part_len > 0 {
            warn!("expected a continuation page");
            self.part_len = 0;
        }

        if page.header.is_continuation && self.part_len == 0 {
            // Without the partial data the first packet cannot be completed.
            if page.num_packets() > 0 {
                warn!("unexpected continuation page, dropping incomplete first packet");
                iter.next();
            }
            else {
                warn!("unexpected continuation page, dropping page");
                return Ok(());
            }
        }

        if page.header.is_last_page {
            self.saw_last_page = true;
        }

        let num_prev = self.queue.len();
        let mut packets = Vec::new();

        for buf in &mut iter {
            packets.push(assemble_packet(&mut self.part_buf, &mut self.part_len, buf));
        }

        let partial = iter.partial_packet().map(<[u8]>::to_vec);

        let num_completed = packets.len();

        for (i, data) in packets.into_iter().enumerate() {
            // The page's granule position belongs to the last packet that
            // ends within the page.
            let granule = if i + 1 == num_completed && page.header.absgp != u64::MAX {
                Some(page.header.absgp)
            }
            else {
                None
            };

            self.queue.push_back(OggPacket {
                data,
                granule,
                is_last_page: page.header.is_last_page,
            });
        }

        debug_assert!(self.queue.len() == num_prev + num_completed);

        if let Some(partial) = partial {
            self.save_partial_packet(&partial)?;
        }

        Ok(())
    }

    fn save_partial_packet(&mut self, buf: &[u8]) -> Result<()> {
        let new_part_len = self.part_len + buf.len();

        if new_part_len > Self::MAX_PACKET_LEN {
            return decode_error("ogg: packet buffer would exceed maximum size");
        }

        if new_part_len > self.part_buf.len() {
            // Grow in 8 kiB blocks.
            let new_buf_len = (new_part_len + (8 * 1024 - 1)) & !(8 * 1024 - 1);
            self.part_buf.resize(new_buf_len, Default::default());
        }

        self.part_buf[self.part_len..new_part_len].copy_from_slice(buf);
        self.part_len = new_part_len;

        Ok(())
    }
}

/// Joins buffered partial packet data, if any, with the completing segment
/// data read from the current page.
fn assemble_packet(part_buf: &mut [u8], part_len: &mut usize, packet_buf: &[u8]) -> Box<[u8]> {
    if *part_len == 0 {
        Box::from(packet_buf)
    }
    else {
        let mut buf = vec![0u8; *part_len + packet_buf.len()];

        let (head, tail) = buf.split_at_mut(*part_len);

        head.copy_from_slice(&part_buf[..*part_len]);
        *part_len = 0;

        tail.copy_from_slice(packet_buf);

        buf.into_boxed_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::OggStream;
    use crate::page::build_page;
    use resona_core::io::MediaSourceStream;
    use std::io::Cursor;

    fn open(data: Vec<u8>) -> OggStream {
        OggStream::new(MediaSourceStream::new(Box::new(Cursor::new(data)))).unwrap()
    }

    #[test]
    fn verify_packet_stream() {
        let mut data = build_page(0x02, u64::MAX, 7, 0, &[3], &[1, 2, 3]);
        data.extend(build_page(0x00, 100, 7, 1, &[2, 4], &[4, 5, 6, 7, 8, 9]));
        data.extend(build_page(0x04, 200, 7, 2, &[1], &[10]));

        let mut stream = open(data);

        let p = stream.next_packet().unwrap().unwrap();
        assert_eq!(&p.data[..], &[1, 2, 3]);
        assert_eq!(p.granule, None);

        let p = stream.next_packet().unwrap().unwrap();
        assert_eq!(&p.data[..], &[4, 5]);
        assert_eq!(p.granule, None);

        let p = stream.next_packet().unwrap().unwrap();
        assert_eq!(&p.data[..], &[6, 7, 8, 9]);
        assert_eq!(p.granule, Some(100));
        assert!(!p.is_last_page);

        let p = stream.next_packet().unwrap().unwrap();
        assert_eq!(&p.data[..], &[10]);
        assert_eq!(p.granule, Some(200));
        assert!(p.is_last_page);

        assert!(stream.next_packet().unwrap().is_none());
    }

    #[test]
    fn verify_continued_packet_assembly() {
        // A 300 byte packet spanning two pages: 255 bytes on the first page,
        // 45 on the second.
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();

        let mut data = build_page(0x02, u64::MAX, 9, 0, &[255], &payload[..255]);
        data.extend(build_page(0x01, 300, 9, 1, &[45], &payload[255..]));

        let mut stream = open(data);

        let p = stream.next_packet().unwrap().unwrap();
        assert_eq!(p.data.len(), 300);
        assert_eq!(&p.data[..], &payload[..]);
        assert_eq!(p.granule, Some(300));
    }

    #[test]
    fn verify_wrong_serial_fails() {
        let mut data = build_page(0x02, u64::MAX, 7, 0, &[1], &[1]);
        data.extend(build_page(0x00, 100, 8, 1, &[1], &[2]));

        let mut stream = open(data);

        stream.next_packet().unwrap().unwrap();
        assert!(stream.next_packet().is_err());
    }

    #[test]
    fn verify_first_page_flag_required() {
        let data = build_page(0x00, u64::MAX, 7, 0, &[1], &[1]);

        let result = OggStream::new(MediaSourceStream::new(Box::new(Cursor::new(data))));
        assert!(result.is_err());
    }
}
