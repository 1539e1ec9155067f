//! Metadata objects and an allocation map for tests.
use super::commit::AllocMap;
use super::config::TxConfig;
use super::manager::TxnManager;
use crate::layers::lock::{Extent, InodeNo, MapUpdate, MetaObject, ObjectKey, ObjectKind};
use crate::layers::log::{LogTid, MemLog, MemLogConfig};
use crate::os::Mutex;
use crate::prelude::*;

use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

/// A page (or inode) kept in memory.
pub(crate) struct MemPage {
    key: ObjectKey,
    inode: InodeNo,
    kind: ObjectKind,
    data: Mutex<Vec<u8>>,
    pins: AtomicIsize,
    discards: AtomicUsize,
    waits: AtomicUsize,
    valid: AtomicBool,
}

impl MemPage {
    pub fn new(key: ObjectKey, inode: InodeNo, size: usize) -> Arc<Self> {
        Self::with_kind(key, inode, size, ObjectKind::Page)
    }

    pub fn new_inode(key: ObjectKey, inode: InodeNo, size: usize) -> Arc<Self> {
        Self::with_kind(key, inode, size, ObjectKind::Inode)
    }

    fn with_kind(key: ObjectKey, inode: InodeNo, size: usize, kind: ObjectKind) -> Arc<Self> {
        Arc::new(Self {
            key,
            inode,
            kind,
            data: Mutex::new(vec![0; size]),
            pins: AtomicIsize::new(0),
            discards: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            valid: AtomicBool::new(true),
        })
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) {
        self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn pins(&self) -> isize {
        self.pins.load(Ordering::SeqCst)
    }

    pub fn discards(&self) -> usize {
        self.discards.load(Ordering::SeqCst)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }
}

impl MetaObject for MemPage {
    fn key(&self) -> ObjectKey {
        self.key
    }

    fn kind(&self) -> ObjectKind {
        self.kind
    }

    fn inode(&self) -> InodeNo {
        self.inode
    }

    fn extent(&self) -> Extent {
        Extent::new(1000 + self.key, 1)
    }

    fn pin_for_write(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::SeqCst);
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock();
        buf.fill(0);
        if offset < data.len() {
            let len = buf.len().min(data.len() - offset);
            buf[..len].copy_from_slice(&data[offset..offset + len]);
        }
    }

    fn discard_changes(&self) {
        self.discards.fetch_add(1, Ordering::SeqCst);
    }

    fn release_for_wait(&self) {
        self.waits.fetch_add(1, Ordering::SeqCst);
    }

    fn revalidate(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

/// An allocation map that records the updates it receives.
#[derive(Default)]
pub(crate) struct RecordingMap {
    updates: Mutex<Vec<(LogTid, MapUpdate)>>,
}

impl RecordingMap {
    pub fn updates(&self) -> Vec<(LogTid, MapUpdate)> {
        self.updates.lock().clone()
    }
}

impl AllocMap for RecordingMap {
    fn update_map(&self, logtid: LogTid, update: &MapUpdate) {
        self.updates.lock().push((logtid, update.clone()));
    }
}

/// Small tables without the flush agent.
pub(crate) fn small_config() -> TxConfig {
    TxConfig {
        ntxblock: TxConfig::NTXBLOCK_MIN,
        ntxlock: TxConfig::NTXLOCK_MIN,
        inline_payload_max: 256,
        lazy_commit: false,
        flush_agent: false,
    }
}

pub(crate) fn new_manager(config: TxConfig) -> (TxnManager, Arc<MemLog>) {
    let log = Arc::new(MemLog::new(MemLogConfig::default()));
    let manager = TxnManager::new(config, log.clone()).unwrap();
    (manager, log)
}

pub(crate) fn new_manager_with_map(
    config: TxConfig,
) -> (TxnManager, Arc<MemLog>, Arc<RecordingMap>) {
    let log = Arc::new(MemLog::new(MemLogConfig::default()));
    let map = Arc::new(RecordingMap::default());
    let manager = TxnManager::with_alloc_map(config, log.clone(), map.clone()).unwrap();
    (manager, log, map)
}
