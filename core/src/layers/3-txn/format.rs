//! Turning change descriptors into log records.
//!
//! Each descriptor type formats itself through `FormatLog`. Records of one
//! transaction are chained through their backchain and written in lock
//! order. Map-update records are held back and written after every page
//! record of the transaction, followed by the commit record.
use crate::layers::lock::{
    ChangeDesc, DirFlags, DirLock, Extent, InodeLock, InodeNo, Line, LineLock, MapList, MapLock,
    MapOp, MapUpdate, MetaObject, ObjectKind, XtFlags, XtLock, DATA_LINES, XT_ENTRY_SHIFT,
};
use crate::layers::log::{
    LogDevice, LogRecord, LogTid, Lsn, MapFlags, PageFlags, Payload, RecordBody, RedoLines,
    MAX_MAP_EXTENTS,
};
use crate::prelude::*;

use core::ops::RangeInclusive;

/// Something that can describe itself in log records.
pub(super) trait FormatLog {
    fn format(&self, object: &dyn MetaObject, writer: &mut LogWriter<'_>) -> Result<()>;
}

/// Writes the records of one transaction.
pub(super) struct LogWriter<'a> {
    log: &'a dyn LogDevice,
    logtid: LogTid,
    backchain: Lsn,
    inline_max: usize,
    deferred: Vec<LogRecord>,
    map_updates: Vec<MapUpdate>,
    nrecords: usize,
}

/// What a finished writer leaves behind.
pub(super) struct Formatted {
    /// The LSN of the commit record.
    pub commit_lsn: Lsn,
    /// Map updates to apply once the commit is durable, in log order.
    pub map_updates: Vec<MapUpdate>,
    pub nrecords: usize,
}

impl<'a> LogWriter<'a> {
    pub fn new(log: &'a dyn LogDevice, logtid: LogTid, inline_max: usize) -> Self {
        Self {
            log,
            logtid,
            backchain: 0,
            inline_max,
            deferred: Vec::new(),
            map_updates: Vec::new(),
            nrecords: 0,
        }
    }

    /// Writes a record now.
    pub fn write(&mut self, inode: InodeNo, body: RecordBody) -> Result<Lsn> {
        let mut record = LogRecord::new(self.logtid, inode, body);
        self.append(&mut record)
    }

    fn append(&mut self, record: &mut LogRecord) -> Result<Lsn> {
        record.backchain = self.backchain;
        let lsn = self.log.reserve_and_write(record)?;
        self.backchain = lsn;
        self.nrecords += 1;
        Ok(lsn)
    }

    /// Queues a map update, logged after every page record.
    pub fn defer_map(&mut self, inode: InodeNo, op: MapOp, list: MapList, extents: Vec<Extent>) {
        if extents.is_empty() {
            return;
        }
        // One record per `MAX_MAP_EXTENTS` extents; their count is a u16.
        for chunk in extents.chunks(MAX_MAP_EXTENTS) {
            self.deferred.push(LogRecord::new(
                self.logtid,
                inode,
                RecordBody::UpdateMap {
                    flags: MapFlags::of(op, list),
                    extents: chunk.to_vec(),
                },
            ));
        }
        self.map_updates.push(MapUpdate {
            inode,
            op,
            list,
            extents,
        });
    }

    /// Collects the modified lines of `object` with their payload: inline
    /// if small enough, page-relative otherwise.
    pub fn redo_lines(&self, object: &dyn MetaObject, line_shift: u8, lines: &[Line]) -> RedoLines {
        let nbytes: usize = lines
            .iter()
            .map(|line| (line.len as usize) << line_shift)
            .sum();
        let payload = if nbytes <= self.inline_max {
            let mut bytes = vec![0u8; nbytes];
            let mut at = 0;
            for line in lines {
                let len = (line.len as usize) << line_shift;
                object.read_bytes(
                    (line.offset as usize) << line_shift,
                    &mut bytes[at..at + len],
                );
                at += len;
            }
            Payload::Inline(bytes)
        } else {
            Payload::PageRelative
        };
        RedoLines {
            line_shift,
            lines: lines.to_vec(),
            payload,
        }
    }

    /// Writes the held-back map records and the commit record.
    pub fn finish(mut self) -> Result<Formatted> {
        let deferred = core::mem::take(&mut self.deferred);
        for mut record in deferred {
            self.append(&mut record)?;
        }
        let mut commit = LogRecord::new(self.logtid, 0, RecordBody::Commit);
        let commit_lsn = self.append(&mut commit)?;
        Ok(Formatted {
            commit_lsn,
            map_updates: self.map_updates,
            nrecords: self.nrecords,
        })
    }
}

/// Covers an inclusive range of xtree entries with lines. A line length is
/// a u16, so a range of all 65536 entries takes two lines.
fn entry_lines(range: RangeInclusive<u16>) -> Vec<Line> {
    let end = *range.end() as u32;
    let mut at = *range.start() as u32;
    let mut lines = Vec::new();
    while at <= end {
        let len = (end - at + 1).min(u16::MAX as u32);
        lines.push(Line::new(at as u16, len as u16));
        at += len;
    }
    lines
}

fn root_or_leaf(object: &dyn MetaObject, root: bool) -> PageFlags {
    if root || object.kind() == ObjectKind::Inode {
        PageFlags::ROOT
    } else {
        PageFlags::LEAF
    }
}

impl FormatLog for InodeLock {
    fn format(&self, object: &dyn MetaObject, writer: &mut LogWriter<'_>) -> Result<()> {
        let redo = writer.redo_lines(object, self.lines.line_shift(), self.lines.lines());
        writer.write(
            object.inode(),
            RecordBody::RedoInode {
                flags: PageFlags::INODE,
                before: self.before,
                after: self.after.unwrap_or_else(|| object.extent()),
                redo,
            },
        )?;
        Ok(())
    }
}

impl FormatLog for DirLock {
    fn format(&self, object: &dyn MetaObject, writer: &mut LogWriter<'_>) -> Result<()> {
        let extent = object.extent();
        let mut flags = PageFlags::DTREE | root_or_leaf(object, self.flags.contains(DirFlags::ROOT));

        if self.flags.contains(DirFlags::FREE) {
            // A freed page must not be redone over whatever reuses its block.
            writer.write(object.inode(), RecordBody::NoRedoPage { flags, extent })?;
            if !flags.contains(PageFlags::ROOT) {
                writer.defer_map(object.inode(), MapOp::Free, MapList::Pxd, vec![extent]);
            }
            return Ok(());
        }

        if self.flags.contains(DirFlags::NEW) {
            flags |= PageFlags::NEW;
        }
        if self.flags.contains(DirFlags::EXTEND) {
            flags |= PageFlags::EXTEND;
        }
        let redo = writer.redo_lines(object, self.lines.line_shift(), self.lines.lines());
        writer.write(
            object.inode(),
            RecordBody::RedoPage {
                flags,
                extent,
                redo,
            },
        )?;
        Ok(())
    }
}

impl FormatLog for XtLock {
    fn format(&self, object: &dyn MetaObject, writer: &mut LogWriter<'_>) -> Result<()> {
        let inode = object.inode();
        let extent = object.extent();
        let base = PageFlags::XTREE | root_or_leaf(object, self.flags.contains(XtFlags::ROOT));

        if self.flags.contains(XtFlags::FREE) {
            writer.write(
                inode,
                RecordBody::NoRedoPage {
                    flags: base,
                    extent,
                },
            )?;
            writer.defer_map(inode, MapOp::Free, MapList::Xad, self.freed.clone());
            if !base.contains(PageFlags::ROOT) {
                writer.defer_map(inode, MapOp::Free, MapList::Pxd, vec![extent]);
            }
            return Ok(());
        }

        if self.flags.contains(XtFlags::RELOCATE) {
            if let Some(from) = self.relocated_from {
                writer.write(
                    inode,
                    RecordBody::NoRedoPage {
                        flags: base | PageFlags::RELOCATE,
                        extent: from,
                    },
                )?;
                writer.defer_map(inode, MapOp::Free, MapList::Pxd, vec![from]);
                writer.defer_map(inode, MapOp::Alloc, MapList::Pxd, vec![extent]);
            }
        }

        if let Some(range) = self.modified_range() {
            let mut flags = base;
            if self.flags.contains(XtFlags::NEW) {
                flags |= PageFlags::NEW;
            }
            if self.flags.contains(XtFlags::GROW) {
                flags |= PageFlags::EXTEND;
            }
            if self.flags.contains(XtFlags::RELOCATE) {
                flags |= PageFlags::RELOCATE;
            }
            let redo = writer.redo_lines(object, XT_ENTRY_SHIFT, &entry_lines(range));
            writer.write(
                inode,
                RecordBody::RedoPage {
                    flags,
                    extent,
                    redo,
                },
            )?;
        }

        if let Some(from) = self.truncated_from() {
            // An empty line at the first deleted entry.
            let redo = RedoLines {
                line_shift: XT_ENTRY_SHIFT,
                lines: vec![Line::new(from, 0)],
                payload: Payload::Inline(Vec::new()),
            };
            writer.write(
                inode,
                RecordBody::RedoPage {
                    flags: base | PageFlags::TRUNCATE,
                    extent,
                    redo,
                },
            )?;
            writer.defer_map(inode, MapOp::Free, MapList::Xad, self.freed.clone());
        }

        writer.defer_map(inode, MapOp::Alloc, MapList::Xad, self.allocated.clone());
        Ok(())
    }
}

impl FormatLog for LineLock<DATA_LINES> {
    fn format(&self, object: &dyn MetaObject, writer: &mut LogWriter<'_>) -> Result<()> {
        let Some(bounds) = self.bounds() else {
            return Ok(());
        };
        let redo = writer.redo_lines(object, self.line_shift(), &[bounds]);
        writer.write(
            object.inode(),
            RecordBody::RedoPage {
                flags: PageFlags::DATA,
                extent: object.extent(),
                redo,
            },
        )?;
        Ok(())
    }
}

impl FormatLog for MapLock {
    fn format(&self, object: &dyn MetaObject, writer: &mut LogWriter<'_>) -> Result<()> {
        writer.defer_map(object.inode(), self.op, self.list, self.extents.clone());
        Ok(())
    }
}

impl FormatLog for ChangeDesc {
    fn format(&self, object: &dyn MetaObject, writer: &mut LogWriter<'_>) -> Result<()> {
        match self {
            ChangeDesc::Inode(lock) => lock.format(object, writer),
            ChangeDesc::Directory(lock) => lock.format(object, writer),
            ChangeDesc::ExtentTree(lock) => lock.format(object, writer),
            ChangeDesc::Data(lock) => lock.format(object, writer),
            ChangeDesc::Map(lock) => lock.format(object, writer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::log::{scan_log, MemLog, MemLogConfig};
    use crate::layers::lock::LockType;
    use crate::layers::txn::test_util::MemPage;

    fn format_all(page: &MemPage, descs: &[ChangeDesc], inline_max: usize) -> Vec<LogRecord> {
        let log = MemLog::new(MemLogConfig::default());
        let mut writer = LogWriter::new(&log, 1, inline_max);
        for desc in descs {
            desc.format(page, &mut writer).unwrap();
        }
        let formatted = writer.finish().unwrap();
        log.force_sync(formatted.commit_lsn).unwrap();
        let scan = scan_log(&log.durable_image());
        assert!(scan.is_committed(1));
        scan.records_of(1).cloned().collect()
    }

    #[test]
    fn data_lock_logs_bounding_range() {
        let page = MemPage::new(1, 10, 4096);
        page.write(100, &[7; 8]);
        page.write(300, &[9; 4]);
        let mut desc = ChangeDesc::new(LockType::Data);
        let data = desc.as_data_mut().unwrap();
        data.add_bytes(100, 8);
        data.add_bytes(300, 4);

        let records = format_all(&page, &[desc], 256);
        assert_eq!(records.len(), 2);
        let RecordBody::RedoPage { flags, redo, .. } = &records[0].body else {
            panic!("unexpected record {:?}", records[0]);
        };
        assert_eq!(*flags, PageFlags::DATA);
        assert_eq!(redo.lines, vec![Line::new(100, 204)]);
        let Payload::Inline(bytes) = &redo.payload else {
            panic!("payload should be inline");
        };
        assert_eq!(&bytes[..8], &[7; 8]);
        assert_eq!(&bytes[200..], &[9; 4]);
        assert!(matches!(records[1].body, RecordBody::Commit));
    }

    #[test]
    fn large_payload_is_page_relative() {
        let page = MemPage::new(1, 10, 4096);
        let mut desc = ChangeDesc::new(LockType::Data);
        desc.as_data_mut().unwrap().add_bytes(0, 1024);

        let records = format_all(&page, &[desc], 256);
        let RecordBody::RedoPage { redo, .. } = &records[0].body else {
            panic!("unexpected record {:?}", records[0]);
        };
        assert_eq!(redo.payload, Payload::PageRelative);
    }

    #[test]
    fn xtree_cases_follow_flags() {
        let page = MemPage::new(1, 10, 4096);

        let mut grow = XtLock::new();
        grow.allocate(3, Extent::new(1000, 8));
        grow.touch(4);
        grow.flags.insert(XtFlags::GROW);

        let mut truncate = XtLock::new();
        truncate.truncate(6, [Extent::new(2000, 4)]);

        let mut relocate = XtLock::new();
        relocate.touch(0);
        relocate.relocate(Extent::new(5, 1));

        let records = format_all(
            &page,
            &[
                ChangeDesc::ExtentTree(grow),
                ChangeDesc::ExtentTree(truncate),
                ChangeDesc::ExtentTree(relocate),
            ],
            4096,
        );
        let tags: Vec<u16> = records.iter().map(|r| r.body.tag()).collect();
        use crate::layers::log::tag::*;
        assert_eq!(
            tags,
            vec![
                REDO_PAGE,   // grow
                REDO_PAGE,   // truncate
                NOREDO_PAGE, // relocate: old location
                REDO_PAGE,   // relocate: entries at the new location
                UPDATE_MAP,  // alloc of the grown entry
                UPDATE_MAP,  // free of the truncated entries
                UPDATE_MAP,  // free of the old location
                UPDATE_MAP,  // alloc of the new location
                COMMIT,
            ]
        );

        let RecordBody::RedoPage { flags, redo, .. } = &records[0].body else {
            unreachable!();
        };
        assert!(flags.contains(PageFlags::XTREE | PageFlags::EXTEND));
        assert_eq!(redo.line_shift, XT_ENTRY_SHIFT);
        assert_eq!(redo.lines, vec![Line::new(3, 2)]);

        let RecordBody::RedoPage { flags, redo, .. } = &records[1].body else {
            unreachable!();
        };
        assert!(flags.contains(PageFlags::TRUNCATE));
        assert_eq!(redo.lines, vec![Line::new(6, 0)]);

        let RecordBody::UpdateMap { flags, extents } = &records[5].body else {
            unreachable!();
        };
        assert_eq!(*flags, MapFlags::FREE_XADLIST);
        assert_eq!(extents, &vec![Extent::new(2000, 4)]);
    }

    #[test]
    fn whole_xtree_range_is_covered() {
        assert_eq!(entry_lines(4..=4), vec![Line::new(4, 1)]);
        assert_eq!(
            entry_lines(0..=u16::MAX),
            vec![Line::new(0, u16::MAX), Line::new(u16::MAX, 1)]
        );
        assert_eq!(entry_lines(1..=u16::MAX), vec![Line::new(1, u16::MAX)]);

        let page = MemPage::new(1, 10, 4096);
        let mut xt = XtLock::new();
        xt.touch(0);
        xt.touch(u16::MAX);
        let records = format_all(&page, &[ChangeDesc::ExtentTree(xt)], 256);
        let RecordBody::RedoPage { redo, .. } = &records[0].body else {
            panic!("unexpected record {:?}", records[0]);
        };
        let entries: u32 = redo.lines.iter().map(|line| line.len as u32).sum();
        assert_eq!(entries, 1 << 16);
        assert_eq!(redo.payload, Payload::PageRelative);
    }

    #[test]
    fn huge_map_update_is_split() {
        let page = MemPage::new(1, 10, 4096);
        let mut xt = XtLock::new();
        xt.free_page((0..70_000).map(|addr| Extent::new(addr, 1)));

        let records = format_all(&page, &[ChangeDesc::ExtentTree(xt)], 256);
        let counts: Vec<usize> = records
            .iter()
            .filter_map(|record| match &record.body {
                RecordBody::UpdateMap { flags, extents } if *flags == MapFlags::FREE_XADLIST => {
                    Some(extents.len())
                }
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![MAX_MAP_EXTENTS, 70_000 - MAX_MAP_EXTENTS]);
    }

    #[test]
    fn freed_dir_page_is_not_redone() {
        let page = MemPage::new(1, 10, 4096);
        let mut dir = DirLock::new();
        dir.touch_slots(2, 1);
        dir.flags.insert(DirFlags::FREE);

        let records = format_all(&page, &[ChangeDesc::Directory(dir)], 256);
        let tags: Vec<u16> = records.iter().map(|r| r.body.tag()).collect();
        use crate::layers::log::tag::*;
        assert_eq!(tags, vec![NOREDO_PAGE, UPDATE_MAP, COMMIT]);
    }

    #[test]
    fn inode_lock_logs_its_location() {
        let inode = MemPage::new_inode(2, 20, 512);
        let mut lock = InodeLock::new();
        lock.touch(16, 8);
        lock.relocate(Extent::new(40, 1), Extent::new(41, 1));

        let records = format_all(&inode, &[ChangeDesc::Inode(lock)], 256);
        let RecordBody::RedoInode { before, after, redo, .. } = &records[0].body else {
            panic!("unexpected record {:?}", records[0]);
        };
        assert_eq!(*before, Some(Extent::new(40, 1)));
        assert_eq!(*after, Extent::new(41, 1));
        assert_eq!(redo.lines, vec![Line::new(16, 8)]);
        assert_eq!(records[0].inode, 20);
    }
}
