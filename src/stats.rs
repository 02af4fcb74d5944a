use std::{alloc::Layout, cell::Cell};

#[cfg(feature = "global")]
use lazy_static::lazy_static;
#[cfg(feature = "global")]
use parking_lot::Mutex;

/// Control block bookkeeping, for diagnosing leaks and double frees.
///
/// Counters are cumulative. Every transition is recorded on the thread that
/// performs it, so with `Atomic` handles moving between threads a single
/// thread's numbers need not balance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats
{
    /// Control blocks obtained from an allocator.
    pub blocks_allocated: usize,

    /// Control blocks handed back to their allocator.
    pub blocks_released: usize,

    /// Owned objects whose destructor (or deleter) has run.
    pub objects_destroyed: usize,

    /// Bytes of control block memory obtained.
    pub bytes_allocated: usize,

    /// Bytes of control block memory handed back.
    pub bytes_released: usize,
}

#[allow(dead_code)]
impl Stats
{
    /// Blocks allocated but not yet released.
    pub fn live_blocks(&self) -> usize { self.blocks_allocated.saturating_sub(self.blocks_released) }

    /// Memory held by blocks allocated but not yet released.
    pub fn live_bytes(&self) -> usize { self.bytes_allocated.saturating_sub(self.bytes_released) }

    /// Activity recorded after `earlier` was taken.
    ///
    /// Counters that went down (snapshots swapped, or taken from different
    /// ledgers) come out as 0.
    pub fn since(&self, earlier: &Stats) -> Stats
    {
        Stats {
            blocks_allocated: self.blocks_allocated.saturating_sub(earlier.blocks_allocated),
            blocks_released: self.blocks_released.saturating_sub(earlier.blocks_released),
            objects_destroyed: self.objects_destroyed.saturating_sub(earlier.objects_destroyed),
            bytes_allocated: self.bytes_allocated.saturating_sub(earlier.bytes_allocated),
            bytes_released: self.bytes_released.saturating_sub(earlier.bytes_released),
        }
    }

    fn merge(&mut self, other: &Stats)
    {
        self.blocks_allocated += other.blocks_allocated;
        self.blocks_released += other.blocks_released;
        self.objects_destroyed += other.objects_destroyed;
        self.bytes_allocated += other.bytes_allocated;
        self.bytes_released += other.bytes_released;
    }
}

struct LocalLedger
{
    stats: Cell<Stats>,
    flushed: Cell<Stats>,
}

impl LocalLedger
{
    fn update(&self, f: impl FnOnce(&mut Stats))
    {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    #[cfg(feature = "global")]
    fn flush(&self)
    {
        let stats = self.stats.get();
        GLOBAL_LEDGER.lock().merge(&stats.since(&self.flushed.get()));
        self.flushed.set(stats);
    }
}

impl Drop for LocalLedger
{
    fn drop(&mut self)
    {
        #[cfg(feature = "global")]
        self.flush();
    }
}

thread_local! {
    static LOCAL_LEDGER: LocalLedger = LocalLedger {
        stats: Cell::new(Stats::default()),
        flushed: Cell::new(Stats::default()),
    };
}

#[cfg(feature = "global")]
lazy_static! {
    static ref GLOBAL_LEDGER: Mutex<Stats> = Mutex::new(Stats::default());
}

// Blocks may be dropped from other thread-local destructors after the
// ledger is gone; those transitions go unrecorded.
fn record(f: impl FnOnce(&mut Stats)) { let _ = LOCAL_LEDGER.try_with(|l| l.update(f)); }

pub(crate) fn block_allocated(layout: Layout)
{
    record(|s| {
        s.blocks_allocated += 1;
        s.bytes_allocated += layout.size();
    })
}

pub(crate) fn block_released(layout: Layout)
{
    record(|s| {
        s.blocks_released += 1;
        s.bytes_released += layout.size();
    })
}

pub(crate) fn object_destroyed() { record(|s| s.objects_destroyed += 1) }

/// Counters of the current thread.
pub fn thread_local_stats() -> Stats { LOCAL_LEDGER.with(|l| l.stats.get()) }

/// Counters of all threads that have exited or called
/// [`flush_thread_stats`].
#[cfg(feature = "global")]
pub fn global_stats() -> Stats { *GLOBAL_LEDGER.lock() }

/// Adds what the current thread recorded since its last flush to
/// [`global_stats`].
#[cfg(feature = "global")]
pub fn flush_thread_stats() { LOCAL_LEDGER.with(LocalLedger::flush) }
