//! Log records and their binary layout.
//!
//! Every record starts with a fixed 24-byte header followed by a
//! type-specific body. All integers are little-endian.
//!
//! ```text
//! +------+-------+--------+-----------+-------+----------+------------+
//! | type | flags | logtid | backchain | inode | body_len |    body    |
//! | u16  | u16   | u32    | u64       | u32   | u32      | body_len B |
//! +------+-------+--------+-----------+-------+----------+------------+
//! ```
//!
//! The backchain is the LSN of the previous record of the same transaction,
//! or 0 for its first record. An LSN is the byte offset just past the end of
//! a record in the log stream.
use crate::layers::lock::{Extent, InodeNo, Line, MapList, MapOp};
use crate::prelude::*;
use bitflags::bitflags;

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert_eq;

/// A log sequence number.
pub type Lsn = u64;

/// The transaction id stamped into log records.
pub type LogTid = u32;

/// Size of the record header in bytes.
pub const RECORD_HEADER_LEN: usize = 24;
const_assert_eq!(RECORD_HEADER_LEN, 2 + 2 + 4 + 8 + 4 + 4);

const EXTENT_LEN: usize = 12;
const_assert_eq!(EXTENT_LEN, 8 + 4);

/// The most extents one update-map record can carry (its count is a u16).
pub const MAX_MAP_EXTENTS: usize = u16::MAX as usize;

/// The most lines one redo record can carry (its count is a u16).
pub const MAX_REDO_LINES: usize = u16::MAX as usize;

/// Record type tags.
pub mod tag {
    pub const COMMIT: u16 = 0x8000;
    pub const SYNCPT: u16 = 0x4000;
    pub const REDO_PAGE: u16 = 0x0800;
    pub const REDO_INODE: u16 = 0x0400;
    pub const NOREDO_PAGE: u16 = 0x0080;
    pub const UPDATE_MAP: u16 = 0x0008;
}

bitflags! {
    /// What kind of page a page record refers to.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PageFlags: u16 {
        const INODE = 0x0001;
        const XTREE = 0x0002;
        const DTREE = 0x0004;
        const ROOT = 0x0010;
        const LEAF = 0x0020;
        const DATA = 0x0080;
        const NEW = 0x0100;
        const EXTEND = 0x0200;
        const RELOCATE = 0x0400;
        const TRUNCATE = 0x1000;
    }
}

bitflags! {
    /// The allocation-map operation of an update-map record.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MapFlags: u16 {
        const FREE_PXD = 0x0001;
        const FREE_XADLIST = 0x0008;
        const ALLOC_PXD = 0x0010;
        const ALLOC_XADLIST = 0x0080;
    }
}

impl MapFlags {
    pub fn of(op: MapOp, list: MapList) -> Self {
        match (op, list) {
            (MapOp::Free, MapList::Pxd) => MapFlags::FREE_PXD,
            (MapOp::Free, MapList::Xad) => MapFlags::FREE_XADLIST,
            (MapOp::Alloc, MapList::Pxd) => MapFlags::ALLOC_PXD,
            (MapOp::Alloc, MapList::Xad) => MapFlags::ALLOC_XADLIST,
        }
    }

    /// Splits the flags back into an operation and a list kind.
    pub fn op_and_list(&self) -> Option<(MapOp, MapList)> {
        [
            (MapOp::Free, MapList::Pxd),
            (MapOp::Free, MapList::Xad),
            (MapOp::Alloc, MapList::Pxd),
            (MapOp::Alloc, MapList::Xad),
        ]
        .into_iter()
        .find(|(op, list)| Self::of(*op, *list) == *self)
    }
}

/// The redo payload of a page or inode record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// The bytes of every line, concatenated.
    Inline(Vec<u8>),
    /// The lines are recovered from the page itself, which reaches its home
    /// location through normal writeback.
    PageRelative,
}

/// The modified lines of a page together with their redo payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedoLines {
    pub line_shift: u8,
    pub lines: Vec<Line>,
    pub payload: Payload,
}

impl RedoLines {
    /// Returns the number of bytes covered by the lines.
    pub fn nbytes(&self) -> usize {
        self.lines
            .iter()
            .map(|line| (line.len as usize) << self.line_shift)
            .sum()
    }
}

/// The type-specific part of a log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordBody {
    Commit,
    SyncPoint {
        lsn: Lsn,
    },
    RedoPage {
        flags: PageFlags,
        extent: Extent,
        redo: RedoLines,
    },
    RedoInode {
        flags: PageFlags,
        before: Option<Extent>,
        after: Extent,
        redo: RedoLines,
    },
    NoRedoPage {
        flags: PageFlags,
        extent: Extent,
    },
    UpdateMap {
        flags: MapFlags,
        extents: Vec<Extent>,
    },
}

impl RecordBody {
    /// Returns the type tag of the body.
    pub fn tag(&self) -> u16 {
        match self {
            RecordBody::Commit => tag::COMMIT,
            RecordBody::SyncPoint { .. } => tag::SYNCPT,
            RecordBody::RedoPage { .. } => tag::REDO_PAGE,
            RecordBody::RedoInode { .. } => tag::REDO_INODE,
            RecordBody::NoRedoPage { .. } => tag::NOREDO_PAGE,
            RecordBody::UpdateMap { .. } => tag::UPDATE_MAP,
        }
    }

    fn flag_bits(&self) -> u16 {
        match self {
            RecordBody::Commit | RecordBody::SyncPoint { .. } => 0,
            RecordBody::RedoPage { flags, .. }
            | RecordBody::RedoInode { flags, .. }
            | RecordBody::NoRedoPage { flags, .. } => flags.bits(),
            RecordBody::UpdateMap { flags, .. } => flags.bits(),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            RecordBody::Commit => 0,
            RecordBody::SyncPoint { .. } => 8,
            RecordBody::RedoPage { redo, .. } => EXTENT_LEN + redo_len(redo),
            RecordBody::RedoInode { redo, .. } => 2 * EXTENT_LEN + redo_len(redo),
            RecordBody::NoRedoPage { .. } => EXTENT_LEN,
            RecordBody::UpdateMap { extents, .. } => 4 + extents.len() * EXTENT_LEN,
        }
    }
}

fn redo_len(redo: &RedoLines) -> usize {
    let payload = match &redo.payload {
        Payload::Inline(bytes) => 4 + bytes.len(),
        Payload::PageRelative => 0,
    };
    4 + redo.lines.len() * 4 + payload
}

/// A log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub logtid: LogTid,
    pub backchain: Lsn,
    pub inode: InodeNo,
    pub body: RecordBody,
}

impl LogRecord {
    pub fn new(logtid: LogTid, inode: InodeNo, body: RecordBody) -> Self {
        Self {
            logtid,
            backchain: 0,
            inode,
            body,
        }
    }

    /// Returns the size of the encoded record.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + self.body.encoded_len()
    }

    /// Appends the encoded record to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut enc = Encoder { buf };
        enc.put_u16(self.body.tag());
        enc.put_u16(self.body.flag_bits());
        enc.put_u32(self.logtid);
        enc.put_u64(self.backchain);
        enc.put_u32(self.inode);
        enc.put_u32(self.body.encoded_len() as u32);

        match &self.body {
            RecordBody::Commit => {}
            RecordBody::SyncPoint { lsn } => enc.put_u64(*lsn),
            RecordBody::RedoPage { extent, redo, .. } => {
                enc.put_extent(extent);
                enc.put_redo(redo);
            }
            RecordBody::RedoInode {
                before,
                after,
                redo,
                ..
            } => {
                enc.put_extent(&before.unwrap_or_default());
                enc.put_extent(after);
                enc.put_redo(redo);
            }
            RecordBody::NoRedoPage { extent, .. } => enc.put_extent(extent),
            RecordBody::UpdateMap { extents, .. } => {
                assert!(
                    extents.len() <= MAX_MAP_EXTENTS,
                    "update-map record with {} extents",
                    extents.len()
                );
                enc.put_u16(extents.len() as u16);
                enc.put_u16(0);
                for extent in extents {
                    enc.put_extent(extent);
                }
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes one record from the front of `buf`, returning it together
    /// with the number of bytes consumed.
    ///
    /// A short or malformed buffer yields `Corrupted`.
    pub fn decode(buf: &[u8]) -> Result<(LogRecord, usize)> {
        let mut dec = Decoder { buf, pos: 0 };
        let tag = dec.get_u16()?;
        let flags = dec.get_u16()?;
        let logtid = dec.get_u32()?;
        let backchain = dec.get_u64()?;
        let inode = dec.get_u32()?;
        let body_len = dec.get_u32()? as usize;

        let body_start = dec.pos;
        let body_end = body_start
            .checked_add(body_len)
            .filter(|end| *end <= buf.len())
            .ok_or(Error::with_msg(Corrupted, "truncated log record"))?;
        let mut dec = Decoder {
            buf: &buf[..body_end],
            pos: body_start,
        };

        let body = match tag {
            tag::COMMIT => RecordBody::Commit,
            tag::SYNCPT => RecordBody::SyncPoint {
                lsn: dec.get_u64()?,
            },
            tag::REDO_PAGE => RecordBody::RedoPage {
                flags: PageFlags::from_bits_retain(flags),
                extent: dec.get_extent()?,
                redo: dec.get_redo()?,
            },
            tag::REDO_INODE => {
                let before = dec.get_extent()?;
                RecordBody::RedoInode {
                    flags: PageFlags::from_bits_retain(flags),
                    before: (!before.is_empty()).then_some(before),
                    after: dec.get_extent()?,
                    redo: dec.get_redo()?,
                }
            }
            tag::NOREDO_PAGE => RecordBody::NoRedoPage {
                flags: PageFlags::from_bits_retain(flags),
                extent: dec.get_extent()?,
            },
            tag::UPDATE_MAP => {
                let count = dec.get_u16()? as usize;
                let _reserved = dec.get_u16()?;
                let mut extents = Vec::with_capacity(count);
                for _ in 0..count {
                    extents.push(dec.get_extent()?);
                }
                RecordBody::UpdateMap {
                    flags: MapFlags::from_bits_retain(flags),
                    extents,
                }
            }
            _ => return_errno_with_msg!(Corrupted, "unknown log record type"),
        };
        if dec.pos != body_end {
            return_errno_with_msg!(Corrupted, "log record body length mismatch");
        }

        let record = LogRecord {
            logtid,
            backchain,
            inode,
            body,
        };
        Ok((record, body_end))
    }
}

const MODE_INLINE: u8 = 0;
const MODE_PAGE_RELATIVE: u8 = 1;

struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    fn reserve(&mut self, len: usize) -> &mut [u8] {
        let at = self.buf.len();
        self.buf.resize(at + len, 0);
        &mut self.buf[at..]
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        LittleEndian::write_u16(self.reserve(2), v);
    }

    fn put_u32(&mut self, v: u32) {
        LittleEndian::write_u32(self.reserve(4), v);
    }

    fn put_u64(&mut self, v: u64) {
        LittleEndian::write_u64(self.reserve(8), v);
    }

    fn put_extent(&mut self, extent: &Extent) {
        self.put_u64(extent.addr);
        self.put_u32(extent.len);
    }

    fn put_redo(&mut self, redo: &RedoLines) {
        self.put_u8(redo.line_shift);
        let mode = match redo.payload {
            Payload::Inline(_) => MODE_INLINE,
            Payload::PageRelative => MODE_PAGE_RELATIVE,
        };
        self.put_u8(mode);
        assert!(
            redo.lines.len() <= MAX_REDO_LINES,
            "redo record with {} lines",
            redo.lines.len()
        );
        self.put_u16(redo.lines.len() as u16);
        for line in &redo.lines {
            self.put_u16(line.offset);
            self.put_u16(line.len);
        }
        if let Payload::Inline(bytes) = &redo.payload {
            self.put_u32(bytes.len() as u32);
            self.buf.extend_from_slice(bytes);
        }
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(Error::with_msg(Corrupted, "truncated log record"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn get_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn get_extent(&mut self) -> Result<Extent> {
        let addr = self.get_u64()?;
        let len = self.get_u32()?;
        Ok(Extent::new(addr, len))
    }

    fn get_redo(&mut self) -> Result<RedoLines> {
        let line_shift = self.get_u8()?;
        let mode = self.get_u8()?;
        let nlines = self.get_u16()? as usize;
        let mut lines = Vec::with_capacity(nlines);
        for _ in 0..nlines {
            let offset = self.get_u16()?;
            let len = self.get_u16()?;
            lines.push(Line::new(offset, len));
        }

        let payload = match mode {
            MODE_INLINE => {
                let nbytes = self.get_u32()? as usize;
                Payload::Inline(self.take(nbytes)?.to_vec())
            }
            MODE_PAGE_RELATIVE => Payload::PageRelative,
            _ => return_errno_with_msg!(Corrupted, "unknown redo payload mode"),
        };
        let redo = RedoLines {
            line_shift,
            lines,
            payload,
        };
        if let Payload::Inline(bytes) = &redo.payload {
            if bytes.len() != redo.nbytes() {
                return_errno_with_msg!(Corrupted, "inline payload does not match its lines");
            }
        }
        Ok(redo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_stable() {
        let mut record = LogRecord::new(
            0x0102_0304,
            7,
            RecordBody::NoRedoPage {
                flags: PageFlags::XTREE | PageFlags::LEAF,
                extent: Extent::new(0x10, 4),
            },
        );
        record.backchain = 0x99;
        let bytes = record.encode();
        assert_eq!(bytes.len(), RECORD_HEADER_LEN + EXTENT_LEN);
        assert_eq!(
            &bytes[..RECORD_HEADER_LEN],
            &[
                0x80, 0x00, // type
                0x22, 0x00, // flags
                0x04, 0x03, 0x02, 0x01, // logtid
                0x99, 0, 0, 0, 0, 0, 0, 0, // backchain
                7, 0, 0, 0, // inode
                12, 0, 0, 0, // body length
            ]
        );
        assert_eq!(&bytes[RECORD_HEADER_LEN..], &[0x10, 0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0]);
    }

    #[test]
    fn redo_inode_round_trip() {
        let record = LogRecord::new(
            3,
            42,
            RecordBody::RedoInode {
                flags: PageFlags::INODE,
                before: None,
                after: Extent::new(500, 1),
                redo: RedoLines {
                    line_shift: 0,
                    lines: vec![Line::new(8, 4), Line::new(64, 2)],
                    payload: Payload::Inline(vec![1, 2, 3, 4, 5, 6]),
                },
            },
        );
        let mut bytes = record.encode();
        assert_eq!(bytes.len(), record.encoded_len());
        // Trailing bytes belong to the next record.
        bytes.extend_from_slice(&[0xff; 5]);

        let (decoded, len) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(len, record.encoded_len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn torn_record_is_corrupted() {
        let record = LogRecord::new(
            1,
            1,
            RecordBody::UpdateMap {
                flags: MapFlags::ALLOC_XADLIST,
                extents: vec![Extent::new(1, 1), Extent::new(9, 3)],
            },
        );
        let bytes = record.encode();
        for cut in 0..bytes.len() {
            let err = LogRecord::decode(&bytes[..cut]).unwrap_err();
            assert_eq!(err.errno(), Corrupted);
        }
    }

    #[test]
    fn inline_payload_must_match_lines() {
        let record = LogRecord::new(
            1,
            1,
            RecordBody::RedoPage {
                flags: PageFlags::DATA,
                extent: Extent::new(1, 1),
                redo: RedoLines {
                    line_shift: 4,
                    lines: vec![Line::new(0, 1)],
                    payload: Payload::Inline(vec![0; 3]),
                },
            },
        );
        let err = LogRecord::decode(&record.encode()).unwrap_err();
        assert_eq!(err.errno(), Corrupted);
    }

    #[test]
    fn map_flags_pairing() {
        for op in [MapOp::Alloc, MapOp::Free] {
            for list in [MapList::Pxd, MapList::Xad] {
                assert_eq!(MapFlags::of(op, list).op_and_list(), Some((op, list)));
            }
        }
        assert_eq!((MapFlags::FREE_PXD | MapFlags::ALLOC_PXD).op_and_list(), None);
    }

    #[test]
    fn unknown_flag_bits_survive_decode() {
        let flags = PageFlags::DATA | PageFlags::from_bits_retain(0x8000);
        let record = LogRecord::new(
            2,
            5,
            RecordBody::NoRedoPage {
                flags,
                extent: Extent::new(3, 1),
            },
        );
        let (decoded, _) = LogRecord::decode(&record.encode()).unwrap();
        let RecordBody::NoRedoPage { flags: decoded, .. } = decoded.body else {
            panic!("decoded a different record type");
        };
        assert_eq!(decoded.bits(), 0x8080);
        assert!(decoded.contains(PageFlags::DATA));
        assert!(!decoded.contains(PageFlags::INODE));
        assert_eq!(decoded & PageFlags::all(), PageFlags::DATA);
    }

    #[test]
    fn full_update_map_round_trip() {
        let extents: Vec<_> = (0..MAX_MAP_EXTENTS as u64)
            .map(|addr| Extent::new(addr, 1))
            .collect();
        let record = LogRecord::new(
            1,
            1,
            RecordBody::UpdateMap {
                flags: MapFlags::FREE_XADLIST,
                extents,
            },
        );
        let (decoded, len) = LogRecord::decode(&record.encode()).unwrap();
        assert_eq!(len, record.encoded_len());
        assert_eq!(decoded, record);
    }

    #[test]
    #[should_panic(expected = "update-map record with 65536 extents")]
    fn oversized_update_map_is_rejected() {
        let record = LogRecord::new(
            1,
            1,
            RecordBody::UpdateMap {
                flags: MapFlags::FREE_XADLIST,
                extents: vec![Extent::new(1, 1); MAX_MAP_EXTENTS + 1],
            },
        );
        record.encode();
    }
}
