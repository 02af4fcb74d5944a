//! Control blocks.
//!
//! A control block is the unit of truth for one owned object: it holds the
//! two counts and knows how to destroy the object and how to free itself.
//! Both capabilities are stored in the header as function pointers
//! monomorphised for the concrete block at creation, so a `BlockRef` can
//! drive any block without knowing the object type, deleter or allocator it
//! was made with.

use std::{
    alloc::Layout,
    fmt,
    mem::{self, ManuallyDrop, MaybeUninit},
    ptr::{self, NonNull},
};

use log::{debug, trace};

use crate::{
    allocator::BlockAlloc,
    counter::Counter,
    error::{AllocError, InitError},
    stats,
};

/// How the owned object is stored relative to its control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind
{
    /// The object was allocated on its own and is destroyed by a deleter.
    Regular,

    /// The object lives inside the control block allocation.
    Inline,
}

/// Lifecycle of a control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State
{
    /// At least one strong handle exists. The object is alive.
    Alive,

    /// Only weak handles remain. The object has been destroyed, the block is
    /// kept so they can still see that.
    Zombie,

    /// No handles remain and the block has been freed.
    Dead,
}

#[repr(C)]
pub(crate) struct Header<C: Counter>
{
    counts: C,
    kind: BlockKind,
    run_destructor: unsafe fn(NonNull<Header<C>>),
    release_storage: unsafe fn(NonNull<Header<C>>),
}

/// Which kind of reference a handle gives up in [`BlockRef::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Held
{
    Strong,
    Weak,
}

/// Untyped pointer to a live control block.
///
/// Only ever hands out shared references to the header; the rest of the
/// block belongs to the block's own destroy and release functions.
#[repr(transparent)]
pub(crate) struct BlockRef<C: Counter>(NonNull<Header<C>>);

impl<C: Counter> Clone for BlockRef<C>
{
    fn clone(&self) -> Self { BlockRef(self.0) }
}
impl<C: Counter> Copy for BlockRef<C> {}

impl<C: Counter> PartialEq for BlockRef<C>
{
    fn eq(&self, other: &Self) -> bool { self.0 == other.0 }
}
impl<C: Counter> Eq for BlockRef<C> {}

impl<C: Counter> fmt::Debug for BlockRef<C>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_tuple("BlockRef").field(&self.0).finish()
    }
}

impl<C: Counter> BlockRef<C>
{
    fn counts(&self) -> &C { unsafe { &self.0.as_ref().counts } }

    pub(crate) fn kind(&self) -> BlockKind { unsafe { self.0.as_ref().kind } }

    pub(crate) fn strong_count(&self) -> usize { self.counts().strong() }

    /// Number of weak handles, not counting the reference the strong handles
    /// hold together. That reference is kept until the object's destructor
    /// has returned.
    pub(crate) fn weak_count(&self) -> usize
    {
        let counts = self.counts();
        let weak = counts.weak();
        if counts.strong() > 0 || counts.destroying() {
            weak.saturating_sub(1)
        } else {
            weak
        }
    }

    /// Whether the caller's strong reference is the only handle of any kind.
    pub(crate) fn is_unique(&self) -> bool { self.counts().is_unique() }

    /// State as seen from a handle still referencing the block, which can
    /// never observe `Dead`.
    pub(crate) fn state(&self) -> State
    {
        if self.strong_count() > 0 {
            State::Alive
        } else {
            State::Zombie
        }
    }

    pub(crate) fn acquire_strong(&self) { self.counts().increment_strong() }

    pub(crate) fn try_acquire_strong(&self) -> bool { self.counts().increment_strong_if_nonzero() }

    pub(crate) fn acquire_weak(&self) { self.counts().increment_weak() }

    /// Gives up one reference and performs whatever transition that causes.
    ///
    /// The last strong reference runs the destructor and then gives up the
    /// collective weak reference; the last weak reference frees the block.
    /// Every handle drop goes through here.
    ///
    /// # Safety
    ///
    /// The caller must own a reference of kind `held` and must not use this
    /// `BlockRef` again.
    pub(crate) unsafe fn release(self, held: Held) -> State
    {
        let header = self.0;

        if held == Held::Strong {
            if self.counts().decrement_strong() != 1 {
                return State::Alive;
            }
            self.counts().synchronize();

            trace!("destroying object of {:?} block {:p}", self.kind(), header);
            let run_destructor = header.as_ref().run_destructor;
            self.counts().set_destroying(true);
            run_destructor(header);
            self.counts().set_destroying(false);
            stats::object_destroyed();
        }

        if self.counts().decrement_weak() != 1 {
            return State::Zombie;
        }
        self.counts().synchronize();

        trace!("releasing {:?} block {:p}", self.kind(), header);
        let release_storage = header.as_ref().release_storage;
        release_storage(header);
        State::Dead
    }
}

/// Block for an object allocated independently of it.
#[repr(C)]
pub(crate) struct RegularBlock<U: ?Sized, D, A, C: Counter>
{
    header: Header<C>,
    object: NonNull<U>,
    deleter: ManuallyDrop<D>,
    alloc: A,
}

impl<U, D, A, C> RegularBlock<U, D, A, C>
where
    U: ?Sized + 'static,
    D: FnOnce(NonNull<U>) + 'static,
    A: BlockAlloc + 'static,
    C: Counter,
{
    /// Allocates a block taking over `object`.
    ///
    /// On failure nothing is taken over: `deleter` is dropped without being
    /// called.
    ///
    /// # Safety
    ///
    /// `deleter` must be sound to call once on `object` after every
    /// reference derived from the block is gone.
    pub(crate) unsafe fn create(object: NonNull<U>, deleter: D, alloc: A) -> Result<BlockRef<C>, AllocError>
    {
        let layout = Layout::new::<Self>();
        let raw = alloc.allocate(layout).map_err(|e| {
            debug!("{e}");
            e
        })?;
        stats::block_allocated(layout);

        let block = raw.cast::<Self>();
        block.as_ptr().write(RegularBlock {
            header: Header {
                counts: C::new(),
                kind: BlockKind::Regular,
                run_destructor: Self::run_destructor,
                release_storage: Self::release_storage,
            },
            object,
            deleter: ManuallyDrop::new(deleter),
            alloc,
        });
        trace!("allocated Regular block {:p} ({} bytes)", block, layout.size());

        Ok(BlockRef(block.cast()))
    }

    unsafe fn run_destructor(header: NonNull<Header<C>>)
    {
        let this = header.cast::<Self>().as_ptr();
        let deleter = ManuallyDrop::take(&mut *ptr::addr_of_mut!((*this).deleter));
        deleter(*ptr::addr_of!((*this).object));
    }

    unsafe fn release_storage(header: NonNull<Header<C>>)
    {
        let layout = Layout::new::<Self>();
        let this = header.cast::<Self>();
        let alloc = ptr::read(ptr::addr_of!((*this.as_ptr()).alloc));
        alloc.deallocate(this.cast(), layout);
        stats::block_released(layout);
    }
}

/// Block with the object embedded, one allocation for both.
#[repr(C)]
pub(crate) struct InlineBlock<T, A, C: Counter>
{
    header: Header<C>,
    alloc: A,
    value: MaybeUninit<T>,
}

/// Memory of a block whose object never got constructed.
struct AbandonedBlock<'a, A: BlockAlloc>
{
    raw: NonNull<u8>,
    layout: Layout,
    alloc: &'a A,
}

impl<'a, A: BlockAlloc> Drop for AbandonedBlock<'a, A>
{
    fn drop(&mut self)
    {
        debug!("returning block {:p} of abandoned construction", self.raw);
        unsafe { self.alloc.deallocate(self.raw, self.layout) };
        stats::block_released(self.layout);
    }
}

impl<T, A, C> InlineBlock<T, A, C>
where
    T: 'static,
    A: BlockAlloc + 'static,
    C: Counter,
{
    /// Allocates a block, then builds the object with `init` and moves it in.
    ///
    /// If `init` fails or panics the memory goes back to `alloc` and no
    /// destructor runs.
    pub(crate) fn create<E>(
        alloc: A, init: impl FnOnce() -> Result<T, E>,
    ) -> Result<(BlockRef<C>, NonNull<T>), InitError<E>>
    {
        let layout = Layout::new::<Self>();
        let raw = alloc.allocate(layout).map_err(|e| {
            debug!("{e}");
            e
        })?;
        stats::block_allocated(layout);

        let abandoned = AbandonedBlock {
            raw,
            layout,
            alloc: &alloc,
        };
        let value = match init() {
            Ok(value) => value,
            Err(e) => {
                mem::drop(abandoned);
                return Err(InitError::Construction(e));
            }
        };
        mem::forget(abandoned);

        let block = raw.cast::<Self>();
        unsafe {
            block.as_ptr().write(InlineBlock {
                header: Header {
                    counts: C::new(),
                    kind: BlockKind::Inline,
                    run_destructor: Self::run_destructor,
                    release_storage: Self::release_storage,
                },
                alloc,
                value: MaybeUninit::new(value),
            });
        }
        trace!("allocated Inline block {:p} ({} bytes)", block, layout.size());

        Ok((BlockRef(block.cast()), Self::value_ptr(block)))
    }

    fn value_ptr(block: NonNull<Self>) -> NonNull<T>
    {
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*block.as_ptr()).value).cast::<T>()) }
    }

    unsafe fn run_destructor(header: NonNull<Header<C>>)
    {
        ptr::drop_in_place(Self::value_ptr(header.cast()).as_ptr());
    }

    unsafe fn release_storage(header: NonNull<Header<C>>)
    {
        let layout = Layout::new::<Self>();
        let this = header.cast::<Self>();
        let alloc = ptr::read(ptr::addr_of!((*this.as_ptr()).alloc));
        alloc.deallocate(this.cast(), layout);
        stats::block_released(layout);
    }
}
