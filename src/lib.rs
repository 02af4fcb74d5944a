//! Shared ownership through strong and weak handles.
//!
//! Any number of [`Strong`] handles can own one heap object; the last one to
//! go destroys it. [`Weak`] handles observe the object without keeping it
//! alive and can be upgraded with [`Weak::lock`] while it still exists.
//!
//! Handles agree on the object's fate through a _control block_ holding the
//! two counts. A block comes in one of two shapes:
//!
//! - _regular_, for an object allocated on its own (a `Box`, or a raw pointer
//!   with a custom deleter), built by [`Strong::from_box`] and
//!   [`Strong::from_raw_in`];
//! - _inline_, with the object stored in the block itself so that one
//!   allocation does for both, built by [`Strong::new`] and
//!   [`Strong::try_new_with_in`].
//!
//! The block remembers how to destroy its object and free itself, so a
//! handle can be re-targeted with [`Strong::map`] (for instance to a trait
//! object) and still clean up correctly.
//!
//! A block goes through three states, see [`State`]. The object is alive
//! while there are strong handles; the block's memory stays around while
//! there are weak ones.
//!
//! Handles come with two count policies, [`Local`] (the default, for use on
//! one thread) and [`Atomic`] (`Send`/`Sync` handles, like `Arc`).
//!
//! Cycles of strong handles are never collected; break them with [`Weak`].

mod allocator;
mod blocks;
mod counter;
mod error;
mod observer;
mod pointers;
mod stats;


pub use allocator::{BlockAlloc, Heap};
pub use blocks::{BlockKind, State};
pub use counter::{Atomic, Counter, Local, Shareable};
pub use error::{AllocError, InitError};
pub use observer::{SelfObserver, SelfSlot};
pub use pointers::{Strong, Weak};
#[cfg(feature = "global")]
pub use stats::{flush_thread_stats, global_stats};
pub use stats::{thread_local_stats, Stats};

/// `Strong` handle with atomic counts.
pub type ArcStrong<T> = Strong<T, Atomic>;

/// `Weak` handle with atomic counts.
pub type ArcWeak<T> = Weak<T, Atomic>;
