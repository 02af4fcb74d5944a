//! Count policies for control blocks.
//!
//! A block carries two counts. The strong count is the number of `Strong`
//! handles. The weak count is the number of `Weak` handles _plus one_ while
//! the strong count is nonzero: the strong handles collectively hold a single
//! weak reference, given up by whichever of them drops last. With that extra
//! reference, "object destroyed" and "memory released" are each decided by
//! exactly one decrement reaching zero, which is what makes the `Atomic`
//! policy race-free.

use std::{
    cell::Cell,
    hint, process,
    sync::atomic::{self, AtomicBool, AtomicUsize, Ordering::*},
};

const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Reference count storage of a control block.
///
/// Implemented by [`Local`] and [`Atomic`] only. Decrements report the
/// _previous_ value so callers can recognize the transition to zero.
pub trait Counter: sealed::Sealed + Sized + 'static
{
    /// Counts of a freshly created block: one strong handle, no weak handles.
    fn new() -> Self;

    fn strong(&self) -> usize;

    /// Raw weak count, including the collective reference of the strong
    /// handles.
    fn weak(&self) -> usize;

    fn increment_strong(&self);

    /// Increments the strong count unless it is zero, as one indivisible step.
    fn increment_strong_if_nonzero(&self) -> bool;

    fn decrement_strong(&self) -> usize;

    fn increment_weak(&self);

    fn decrement_weak(&self) -> usize;

    /// Whether the caller's strong reference is the only reference of any
    /// kind, decided as one step with respect to `lock` and `increment_weak`.
    fn is_unique(&self) -> bool;

    /// Marks that the object's destructor is running: the strong count is
    /// already zero but the collective weak reference is still held.
    fn set_destroying(&self, destroying: bool);

    fn destroying(&self) -> bool;

    /// Orders the destruction of a block after every other handle's last use
    /// of it.
    fn synchronize(&self);
}

/// Single-threaded counts. Handles using them are neither `Send` nor `Sync`.
#[derive(Debug)]
pub struct Local
{
    strong: Cell<usize>,
    weak: Cell<usize>,
    destroying: Cell<bool>,
}

impl Counter for Local
{
    fn new() -> Self
    {
        Local {
            strong: Cell::new(1),
            weak: Cell::new(1),
            destroying: Cell::new(false),
        }
    }

    fn strong(&self) -> usize { self.strong.get() }

    fn weak(&self) -> usize { self.weak.get() }

    fn increment_strong(&self) { self.strong.set(checked_increment(self.strong.get())) }

    fn increment_strong_if_nonzero(&self) -> bool
    {
        let n = self.strong.get();
        if n == 0 {
            false
        } else {
            self.strong.set(checked_increment(n));
            true
        }
    }

    fn decrement_strong(&self) -> usize
    {
        let n = self.strong.get();
        self.strong.set(n - 1);
        n
    }

    fn increment_weak(&self) { self.weak.set(checked_increment(self.weak.get())) }

    fn decrement_weak(&self) -> usize
    {
        let n = self.weak.get();
        self.weak.set(n - 1);
        n
    }

    fn is_unique(&self) -> bool { self.strong.get() == 1 && self.weak.get() == 1 }

    fn set_destroying(&self, destroying: bool) { self.destroying.set(destroying) }

    fn destroying(&self) -> bool { self.destroying.get() }

    fn synchronize(&self) {}
}

/// Thread-safe counts.
///
/// `Strong` and `Weak` handles over these are `Send` and `Sync` when the
/// referenced type is.
///
/// While [`Counter::is_unique`] runs, the weak count is parked at
/// `usize::MAX` so no weak reference can be taken or used to upgrade.
#[derive(Debug)]
pub struct Atomic
{
    strong: AtomicUsize,
    weak: AtomicUsize,
    destroying: AtomicBool,
}

const WEAK_LOCKED: usize = usize::MAX;

impl Counter for Atomic
{
    fn new() -> Self
    {
        Atomic {
            strong: AtomicUsize::new(1),
            weak: AtomicUsize::new(1),
            destroying: AtomicBool::new(false),
        }
    }

    fn strong(&self) -> usize { self.strong.load(Acquire) }

    fn weak(&self) -> usize
    {
        match self.weak.load(Acquire) {
            WEAK_LOCKED => 1,
            n => n,
        }
    }

    fn increment_strong(&self)
    {
        if self.strong.fetch_add(1, Relaxed) > MAX_REFCOUNT {
            process::abort();
        }
    }

    fn increment_strong_if_nonzero(&self) -> bool
    {
        let mut n = self.strong.load(Relaxed);
        loop {
            if n == 0 {
                return false;
            }
            if n > MAX_REFCOUNT {
                process::abort();
            }
            match self.strong.compare_exchange_weak(n, n + 1, Acquire, Relaxed) {
                Ok(_) => return true,
                Err(observed) => n = observed,
            }
        }
    }

    fn decrement_strong(&self) -> usize { self.strong.fetch_sub(1, Release) }

    fn increment_weak(&self)
    {
        let mut n = self.weak.load(Relaxed);
        loop {
            if n == WEAK_LOCKED {
                hint::spin_loop();
                n = self.weak.load(Relaxed);
                continue;
            }
            if n > MAX_REFCOUNT {
                process::abort();
            }
            match self.weak.compare_exchange_weak(n, n + 1, Acquire, Relaxed) {
                Ok(_) => return,
                Err(observed) => n = observed,
            }
        }
    }

    fn decrement_weak(&self) -> usize { self.weak.fetch_sub(1, Release) }

    fn is_unique(&self) -> bool
    {
        // Only the collective reference left means no `Weak` exists that
        // could upgrade while the strong count is read.
        if self.weak.compare_exchange(1, WEAK_LOCKED, Acquire, Relaxed).is_err() {
            return false;
        }
        let unique = self.strong.load(Acquire) == 1;
        self.weak.store(1, Release);
        unique
    }

    fn set_destroying(&self, destroying: bool) { self.destroying.store(destroying, Release) }

    fn destroying(&self) -> bool { self.destroying.load(Acquire) }

    fn synchronize(&self) { atomic::fence(Acquire) }
}

mod sealed
{
    pub trait Sealed {}

    impl Sealed for super::Local {}
    impl Sealed for super::Atomic {}
}

fn checked_increment(n: usize) -> usize
{
    if n >= MAX_REFCOUNT {
        process::abort();
    }
    n + 1
}

/// Thread bound that a value stored in a block must meet for count policy
/// `C`.
///
/// Under [`Local`] anything goes. Under [`Atomic`] the last handle may be
/// dropped on any thread, so whatever that drop runs or frees must be `Send`
/// and `Sync`.
///
/// # Safety
///
/// Implementing this for `Atomic` asserts the type may be used and dropped
/// from any thread.
pub unsafe trait Shareable<C: Counter> {}

unsafe impl<X: ?Sized> Shareable<Local> for X {}

unsafe impl<X: ?Sized + Send + Sync> Shareable<Atomic> for X {}
