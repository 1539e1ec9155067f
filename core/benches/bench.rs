//! Benchmarks of the transaction manager.
//!
//! Each task runs transactions that lock and update a number of pages of its
//! own, then commits them synchronously or lazily.
//! The number of transactions, locks per transaction, concurrency and the
//! group-commit window are configurable.
//! Results are displayed as throughput in transactions/sec.
use jtxn::*;

use self::benches::{Bench, BenchBuilder, CommitMode};
use self::util::DisplayThroughput;

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) type Result<T> = core::result::Result<T, Error>;

fn main() {
    let total_txns = 20_000;
    // Specify all benchmarks
    let benches = vec![
        BenchBuilder::new("TxnManager::commit_sync")
            .commit_mode(CommitMode::Sync)
            .total_txns(total_txns)
            .locks_per_txn(4)
            .concurrency(1)
            .build()
            .unwrap(),
        BenchBuilder::new("TxnManager::commit_sync")
            .commit_mode(CommitMode::Sync)
            .total_txns(total_txns)
            .locks_per_txn(4)
            .concurrency(8)
            .build()
            .unwrap(),
        BenchBuilder::new("TxnManager::commit_sync_grouped")
            .commit_mode(CommitMode::Sync)
            .total_txns(total_txns)
            .locks_per_txn(4)
            .concurrency(8)
            .group_commit_window(Duration::from_micros(200))
            .build()
            .unwrap(),
        BenchBuilder::new("TxnManager::commit_lazy")
            .commit_mode(CommitMode::Lazy)
            .total_txns(total_txns)
            .locks_per_txn(4)
            .concurrency(8)
            .build()
            .unwrap(),
    ];

    // Run all benchmarks and output the results
    run_benches(benches);
}

fn run_benches(benches: Vec<Box<dyn Bench>>) {
    println!("");

    let mut benched_count = 0;
    let mut failed_count = 0;
    for mut b in benches {
        print!("bench {} ... ", &b);
        b.prepare();

        let start = Instant::now();
        let res = b.run();
        if let Err(e) = res {
            failed_count += 1;
            println!("failed due to error {:?}", e);
            continue;
        }
        let elapsed = start.elapsed();

        let throughput = DisplayThroughput::new(b.total_txns(), elapsed);
        println!("{}", throughput);

        b.display_ext();
        benched_count += 1;
    }

    let bench_res = if failed_count == 0 { "ok" } else { "failed" };
    println!(
        "\nbench result: {}. {} benched; {} failed.",
        bench_res, benched_count, failed_count
    );
}

mod benches {
    use super::pages::BenchPage;
    use super::*;

    use std::fmt::{self};
    use std::thread;

    pub trait Bench: fmt::Display {
        /// Returns the name of the benchmark.
        fn name(&self) -> &str;

        /// Returns the total number of transactions committed.
        fn total_txns(&self) -> usize;

        /// Do some preparatory work before running.
        fn prepare(&mut self) {}

        /// Run the benchmark.
        fn run(&self) -> Result<()>;

        /// Display extra information.
        fn display_ext(&self) {}
    }

    pub struct BenchBuilder {
        name: String,
        commit_mode: Option<CommitMode>,
        total_txns: usize,
        locks_per_txn: usize,
        concurrency: u32,
        group_commit_window: Duration,
    }

    impl BenchBuilder {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                commit_mode: None,
                total_txns: 1000,
                locks_per_txn: 1,
                concurrency: 1,
                group_commit_window: Duration::ZERO,
            }
        }

        pub fn commit_mode(mut self, commit_mode: CommitMode) -> Self {
            self.commit_mode = Some(commit_mode);
            self
        }

        pub fn total_txns(mut self, total_txns: usize) -> Self {
            self.total_txns = total_txns;
            self
        }

        pub fn locks_per_txn(mut self, locks_per_txn: usize) -> Self {
            self.locks_per_txn = locks_per_txn;
            self
        }

        pub fn concurrency(mut self, concurrency: u32) -> Self {
            self.concurrency = concurrency;
            self
        }

        pub fn group_commit_window(mut self, window: Duration) -> Self {
            self.group_commit_window = window;
            self
        }

        pub fn build(self) -> Result<Box<dyn Bench>> {
            let Self {
                name,
                commit_mode,
                total_txns,
                locks_per_txn,
                concurrency,
                group_commit_window,
            } = self;

            let commit_mode = match commit_mode {
                Some(commit_mode) => commit_mode,
                None => return_errno_with_msg!(Errno::InvalidArgs, "commit_mode is not given"),
            };
            if total_txns == 0 {
                return_errno_with_msg!(Errno::InvalidArgs, "total_txns must be greater than 0");
            }
            if locks_per_txn == 0 {
                return_errno_with_msg!(Errno::InvalidArgs, "locks_per_txn must be greater than 0");
            }
            if concurrency == 0 {
                return_errno_with_msg!(Errno::InvalidArgs, "concurrency must be greater than 0");
            }

            Ok(Box::new(CommitBench {
                name,
                manager: None,
                log: None,
                commit_mode,
                total_txns,
                locks_per_txn,
                concurrency,
                group_commit_window,
            }))
        }
    }

    pub struct CommitBench {
        name: String,
        manager: Option<Arc<TxnManager>>,
        log: Option<Arc<MemLog>>,
        commit_mode: CommitMode,
        total_txns: usize,
        locks_per_txn: usize,
        concurrency: u32,
        group_commit_window: Duration,
    }

    impl Bench for CommitBench {
        fn name(&self) -> &str {
            &self.name
        }

        fn total_txns(&self) -> usize {
            self.total_txns
        }

        fn prepare(&mut self) {
            let log = Arc::new(MemLog::new(MemLogConfig {
                sync_barrier_bytes: Some(64 << 20),
                group_commit_window: self.group_commit_window,
            }));
            let manager = TxnManager::new(TxConfig::default(), log.clone()).unwrap();
            let _ = self.manager.insert(Arc::new(manager));
            let _ = self.log.insert(log);
        }

        fn run(&self) -> Result<()> {
            let manager = self.manager.as_ref().unwrap();
            let lazy = self.commit_mode == CommitMode::Lazy;
            let local_txns = self.total_txns / (self.concurrency as usize);
            let locks_per_txn = self.locks_per_txn;

            let res = thread::scope(|s| {
                let handles: Vec<_> = (0..self.concurrency)
                    .map(|i| {
                        let manager = manager.clone();
                        s.spawn(move || -> Result<()> {
                            let pages: Vec<_> = (0..locks_per_txn)
                                .map(|j| {
                                    let key = (i as ObjectKey) << 32 | j as ObjectKey;
                                    BenchPage::new(i as InodeNo, key)
                                })
                                .collect();
                            for n in 0..local_txns {
                                let tx = manager.transaction(false)?;
                                for page in pages.iter() {
                                    let lid = tx.lock(page.clone(), LockType::Data)?;
                                    tx.update(lid, |desc| {
                                        if let Some(lines) = desc.as_data_mut() {
                                            lines.add_bytes((n % 64) * 64, 64);
                                        }
                                    })?;
                                }
                                if lazy {
                                    tx.commit_lazy()?;
                                } else {
                                    tx.commit()?;
                                }
                            }
                            Ok(())
                        })
                    })
                    .collect();

                let mut any_error = None;
                for handle in handles {
                    let res = handle.join().expect("couldn't join on the bench task");
                    if let Err(e) = res {
                        println!("benchmark task error: {:?}", &e);
                        any_error = Some(e);
                    }
                }
                any_error
            });
            manager.wait_lazy_idle();

            match res {
                None => Ok(()),
                Some(e) => Err(e),
            }
        }

        fn display_ext(&self) {
            let stats = self.manager.as_ref().unwrap().stats();
            let log_stats = self.log.as_ref().unwrap().stats();
            println!(
                "\tcommits: {}, records: {}, flushes: {}, sync points: {}",
                stats.commits, stats.records_written, log_stats.flushes, log_stats.sync_points
            );
        }
    }

    impl fmt::Display for CommitBench {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{} (txns = {}, locks = {}, tasks = {})",
                self.name(),
                self.total_txns,
                self.locks_per_txn,
                self.concurrency
            )
        }
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum CommitMode {
        Sync,
        Lazy,
    }
}

mod pages {
    use super::*;

    /// A page whose content is a fixed pattern.
    pub struct BenchPage {
        inode: InodeNo,
        key: ObjectKey,
        pins: AtomicIsize,
    }

    impl BenchPage {
        pub fn new(inode: InodeNo, key: ObjectKey) -> Arc<Self> {
            Arc::new(Self {
                inode,
                key,
                pins: AtomicIsize::new(0),
            })
        }
    }

    impl MetaObject for BenchPage {
        fn key(&self) -> ObjectKey {
            self.key
        }

        fn inode(&self) -> InodeNo {
            self.inode
        }

        fn extent(&self) -> Extent {
            Extent::new(self.key, 1)
        }

        fn pin_for_write(&self) {
            self.pins.fetch_add(1, Ordering::Relaxed);
        }

        fn unpin(&self) {
            self.pins.fetch_sub(1, Ordering::Relaxed);
        }

        fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
            buf.fill(offset as u8);
        }
    }
}

mod util {
    use super::*;
    use std::fmt::{self};

    /// Display throughput in the unit of txns/s, K txns/s or M txns/s.
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub struct DisplayThroughput(f64);

    impl DisplayThroughput {
        pub fn new(total_txns: usize, elapsed: Duration) -> Self {
            let total_txns = total_txns as f64;
            let elapsed_secs = elapsed.as_secs_f64();
            Self(total_txns / elapsed_secs)
        }
    }

    impl fmt::Display for DisplayThroughput {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            const UNIT_TABLE: [(&str, f64); 3] =
                [("M txns/s", 1e6), ("K txns/s", 1e3), ("txns/s", 0.0)];
            let (unit_str, unit_val) = UNIT_TABLE
                .iter()
                .find(|(_, unit_val)| self.0 >= *unit_val)
                .copied()
                .unwrap_or(("txns/s", 0.0));
            let unit_val = if unit_val == 0.0 { 1.0 } else { unit_val };
            write!(f, "{:.2} {}", self.0 / unit_val, unit_str)
        }
    }
}
