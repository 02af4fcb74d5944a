use std::{
    alloc::handle_alloc_error,
    convert::Infallible,
    fmt,
    marker::PhantomData,
    ops::Deref,
    ptr::NonNull,
};

use crate::{
    allocator::{BlockAlloc, Heap},
    blocks::{BlockKind, BlockRef, Held, InlineBlock, RegularBlock, State},
    counter::{Counter, Local, Shareable},
    error::{AllocError, InitError},
    observer::SelfObserver,
};

/// What a non-empty handle holds.
///
/// The object pointer is kept apart from the block: after `map` it points at
/// something other than the object the block destroys.
struct Parts<T: ?Sized, C: Counter>
{
    object: NonNull<T>,
    block: BlockRef<C>,
    mapped: bool,
}

impl<T: ?Sized, C: Counter> Clone for Parts<T, C>
{
    fn clone(&self) -> Self { *self }
}
impl<T: ?Sized, C: Counter> Copy for Parts<T, C> {}

fn drop_box<T: ?Sized>(object: NonNull<T>) { drop(unsafe { Box::from_raw(object.as_ptr()) }) }

fn same_address<T: ?Sized, U: ?Sized>(a: NonNull<T>, b: NonNull<U>) -> bool
{
    a.cast::<u8>() == b.cast::<u8>()
}

/// Owning handle.
///
/// Keeps the object alive for as long as it exists; the last `Strong` to go
/// destroys it. A `Strong` may also be empty, as produced by `default`,
/// [`Strong::take`] and [`Strong::reset`]. Dereferencing an empty handle
/// panics.
///
/// Methods are associated functions (`Strong::strong_count(&s)`) so they do
/// not shadow methods of `T`.
///
/// ```
/// use sharedref::Strong;
///
/// let a: Strong<String> = Strong::new(String::from("shared"));
/// let b = a.clone();
/// assert_eq!(Strong::strong_count(&a), 2);
///
/// let w = Strong::downgrade(&b);
/// drop((a, b));
/// assert!(w.expired());
/// assert!(w.lock().is_none());
/// ```
pub struct Strong<T: ?Sized + 'static, C: Counter = Local>
{
    parts: Option<Parts<T, C>>,
    _owns: PhantomData<T>,
}

// Of the count policies only `Atomic` is `Sync`.
unsafe impl<T: ?Sized + Send + Sync + 'static, C: Counter + Sync> Send for Strong<T, C> {}
unsafe impl<T: ?Sized + Send + Sync + 'static, C: Counter + Sync> Sync for Strong<T, C> {}

impl<T: 'static, C: Counter> Strong<T, C>
{
    /// Moves `value` into a new inline block on the heap.
    ///
    /// Calls [`handle_alloc_error`] if the block cannot be allocated.
    pub fn new(value: T) -> Self
    {
        match Self::inline_in(Heap, || Ok::<T, Infallible>(value)) {
            Ok(this) => this,
            Err(InitError::Allocation(e)) => handle_alloc_error(e.layout()),
            Err(InitError::Construction(never)) => match never {},
        }
    }

    /// Moves `value` into a new inline block from `alloc`.
    pub fn new_in<A>(value: T, alloc: A) -> Result<Self, AllocError>
    where
        A: BlockAlloc + Shareable<C> + 'static,
    {
        match Self::inline_in(alloc, || Ok::<T, Infallible>(value)) {
            Ok(this) => Ok(this),
            Err(InitError::Allocation(e)) => Err(e),
            Err(InitError::Construction(never)) => match never {},
        }
    }

    /// Allocates an inline block on the heap and constructs the object with
    /// `init`.
    pub fn try_new_with<E>(init: impl FnOnce() -> Result<T, E>) -> Result<Self, InitError<E>>
    {
        Self::inline_in(Heap, init)
    }

    /// Allocates an inline block from `alloc` and constructs the object with
    /// `init`.
    ///
    /// The block is allocated first. Should `init` fail, or panic, the block
    /// goes back to `alloc` before the error is returned (or the panic
    /// continues), and no destructor runs.
    pub fn try_new_with_in<A, E>(alloc: A, init: impl FnOnce() -> Result<T, E>) -> Result<Self, InitError<E>>
    where
        A: BlockAlloc + Shareable<C> + 'static,
    {
        Self::inline_in(alloc, init)
    }

    fn inline_in<A, E>(alloc: A, init: impl FnOnce() -> Result<T, E>) -> Result<Self, InitError<E>>
    where
        A: BlockAlloc + 'static,
    {
        let (block, object) = InlineBlock::<T, A, C>::create(alloc, init)?;
        Ok(Self::from_parts(object, block))
    }
}

impl<T: ?Sized + 'static, C: Counter> Strong<T, C>
{
    fn from_parts(object: NonNull<T>, block: BlockRef<C>) -> Self
    {
        Strong {
            parts: Some(Parts {
                object,
                block,
                mapped: false,
            }),
            _owns: PhantomData,
        }
    }

    /// Takes ownership of a boxed object, with the counts in a separate
    /// block.
    ///
    /// Calls [`handle_alloc_error`] if the block cannot be allocated.
    pub fn from_box(boxed: Box<T>) -> Self
    {
        match Self::try_from_box(boxed) {
            Ok(this) => this,
            Err((_boxed, e)) => handle_alloc_error(e.layout()),
        }
    }

    /// Like [`Strong::from_box`], but hands the box back if the block cannot
    /// be allocated.
    pub fn try_from_box(boxed: Box<T>) -> Result<Self, (Box<T>, AllocError)>
    {
        let object = NonNull::from(Box::leak(boxed));
        match unsafe { Self::regular_in(object, drop_box::<T>, Heap) } {
            Ok(this) => Ok(this),
            Err(e) => Err((unsafe { Box::from_raw(object.as_ptr()) }, e)),
        }
    }

    /// Takes ownership of a boxed object that is disposed of by `deleter`
    /// rather than by dropping the box.
    pub fn from_box_with<D>(boxed: Box<T>, deleter: D) -> Result<Self, (Box<T>, AllocError)>
    where
        D: FnOnce(Box<T>) + Shareable<C> + 'static,
    {
        let object = NonNull::from(Box::leak(boxed));
        let delete = move |object: NonNull<T>| deleter(unsafe { Box::from_raw(object.as_ptr()) });
        match unsafe { Self::regular_in(object, delete, Heap) } {
            Ok(this) => Ok(this),
            Err(e) => Err((unsafe { Box::from_raw(object.as_ptr()) }, e)),
        }
    }

    /// Takes ownership of `object` with a heap-allocated block.
    ///
    /// # Safety
    ///
    /// See [`Strong::from_raw_in`].
    pub unsafe fn from_raw_with<D>(object: NonNull<T>, deleter: D) -> Result<Self, AllocError>
    where
        D: FnOnce(NonNull<T>) + Shareable<C> + 'static,
    {
        Self::regular_in(object, deleter, Heap)
    }

    /// Takes ownership of `object`, placing its block with `alloc`.
    ///
    /// `deleter` runs exactly once, when the last `Strong` is dropped. If
    /// the block cannot be allocated the deleter is dropped uncalled and
    /// `object` still belongs to the caller.
    ///
    /// # Safety
    ///
    /// `object` must be valid for reads and writes until `deleter` runs, must
    /// not be accessed except through the returned handles, and must not be
    /// owned by any other block.
    pub unsafe fn from_raw_in<D, A>(object: NonNull<T>, deleter: D, alloc: A) -> Result<Self, AllocError>
    where
        D: FnOnce(NonNull<T>) + Shareable<C> + 'static,
        A: BlockAlloc + Shareable<C> + 'static,
    {
        Self::regular_in(object, deleter, alloc)
    }

    unsafe fn regular_in<D, A>(object: NonNull<T>, deleter: D, alloc: A) -> Result<Self, AllocError>
    where
        D: FnOnce(NonNull<T>) + 'static,
        A: BlockAlloc + 'static,
    {
        let block = RegularBlock::<T, D, A, C>::create(object, deleter, alloc)?;
        Ok(Self::from_parts(object, block))
    }

    pub fn is_empty(this: &Self) -> bool { this.parts.is_none() }

    /// The object, unless the handle is empty.
    pub fn get(this: &Self) -> Option<&T> { this.parts.map(|p| unsafe { &*p.object.as_ptr() }) }

    /// Mutable access, granted only to the sole handle of any kind on a
    /// block, and only if the handle was not re-targeted by [`Strong::map`].
    pub fn get_mut(this: &mut Self) -> Option<&mut T>
    {
        let parts = this.parts?;
        if parts.mapped || !parts.block.is_unique() {
            return None;
        }
        Some(unsafe { &mut *parts.object.as_ptr() })
    }

    /// Mutable access without checks.
    ///
    /// # Safety
    ///
    /// No other reference to the object may be in use for the lifetime of the
    /// returned one, and the handle must not come from [`Strong::map`].
    ///
    /// # Panics
    ///
    /// If the handle is empty.
    pub unsafe fn get_mut_unchecked(this: &mut Self) -> &mut T
    {
        match this.parts {
            Some(parts) => &mut *parts.object.as_ptr(),
            None => panic!("get_mut_unchecked on an empty Strong"),
        }
    }

    /// Number of strong handles on the block, 0 for an empty handle.
    pub fn strong_count(this: &Self) -> usize { this.parts.map_or(0, |p| p.block.strong_count()) }

    /// Number of weak handles on the block, 0 for an empty handle.
    pub fn weak_count(this: &Self) -> usize { this.parts.map_or(0, |p| p.block.weak_count()) }

    pub fn block_kind(this: &Self) -> Option<BlockKind> { this.parts.map(|p| p.block.kind()) }

    /// Produce a weak handle to the same object. Empty for an empty handle.
    pub fn downgrade(this: &Self) -> Weak<T, C>
    {
        match this.parts {
            Some(parts) => {
                parts.block.acquire_weak();
                Weak { parts: Some(parts) }
            }
            None => Weak::new(),
        }
    }

    /// Moves the ownership out, leaving `this` empty.
    pub fn take(this: &mut Self) -> Self
    {
        Strong {
            parts: this.parts.take(),
            _owns: PhantomData,
        }
    }

    /// Gives up this handle's ownership, as if it were dropped, leaving it
    /// empty.
    pub fn reset(this: &mut Self) { drop(Self::take(this)) }

    /// Gives up this handle's ownership and takes over `boxed` instead, as
    /// [`Strong::from_box`] would.
    pub fn reset_to(this: &mut Self, boxed: Box<T>)
    {
        Self::reset(this);
        *this = Self::from_box(boxed);
    }

    /// Re-targets the handle at something reachable from the object, sharing
    /// the block.
    ///
    /// This is how a handle is upcast: the block still destroys the object
    /// it was created for, whatever the handle now points at.
    ///
    /// ```
    /// use std::fmt::Display;
    /// use sharedref::Strong;
    ///
    /// let n: Strong<u32> = Strong::new(42);
    /// let d: Strong<dyn Display> = Strong::map(n.clone(), |n| n as &(dyn Display + 'static));
    /// assert_eq!(d.to_string(), "42");
    /// assert!(Strong::same_block(&n, &d));
    /// ```
    pub fn map<U, F>(this: Self, f: F) -> Strong<U, C>
    where
        U: ?Sized + 'static,
        F: FnOnce(&T) -> &U,
        T: Shareable<C>,
    {
        let mut this = this;
        let object = match Self::get(&this) {
            Some(object) => NonNull::from(f(object)),
            None => return Strong::default(),
        };
        match this.parts.take() {
            Some(parts) => Strong {
                parts: Some(Parts {
                    object,
                    block: parts.block,
                    mapped: true,
                }),
                _owns: PhantomData,
            },
            None => Strong::default(),
        }
    }

    /// Whether both handles point at the same place.
    pub fn ptr_eq<U: ?Sized + 'static>(this: &Self, other: &Strong<U, C>) -> bool
    {
        match (this.parts, other.parts) {
            (Some(a), Some(b)) => same_address(a.object, b.object),
            (None, None) => true,
            _ => false,
        }
    }

    /// Whether both handles share ownership of one object.
    pub fn same_block<U: ?Sized + 'static>(this: &Self, other: &Strong<U, C>) -> bool
    {
        match (this.parts, other.parts) {
            (Some(a), Some(b)) => a.block == b.block,
            _ => false,
        }
    }

    /// Fills the object's [`SelfSlot`](crate::SelfSlot) from this handle, so
    /// that [`SelfObserver::self_handle`] finds it.
    ///
    /// The `*_observed` constructors do this themselves; it is for handles
    /// made any other way, such as through `From<Box<T>>`. A slot that is
    /// already filled is left alone, as is an empty handle.
    pub fn enroll(this: &Self)
    where
        T: SelfObserver<C>,
    {
        if let Some(object) = Self::get(this) {
            if object.self_slot().get().is_none() {
                object.self_slot().fill(Self::downgrade(this));
            }
        }
    }
}

impl<T: SelfObserver<C>, C: Counter> Strong<T, C>
{
    /// [`Strong::new`] for a type that can hand out handles to itself.
    ///
    /// The object's [`SelfSlot`](crate::SelfSlot) is filled before the handle
    /// is returned.
    pub fn new_observed(value: T) -> Self
    {
        let this = Self::new(value);
        Self::enroll(&this);
        this
    }

    pub fn new_observed_in<A>(value: T, alloc: A) -> Result<Self, AllocError>
    where
        A: BlockAlloc + Shareable<C> + 'static,
    {
        let this = Self::new_in(value, alloc)?;
        Self::enroll(&this);
        Ok(this)
    }

    pub fn try_new_observed_with<E>(init: impl FnOnce() -> Result<T, E>) -> Result<Self, InitError<E>>
    {
        let this = Self::try_new_with(init)?;
        Self::enroll(&this);
        Ok(this)
    }

    /// [`Strong::try_new_with_in`] for a type that can hand out handles to
    /// itself.
    pub fn try_new_observed_in<A, E>(alloc: A, init: impl FnOnce() -> Result<T, E>) -> Result<Self, InitError<E>>
    where
        A: BlockAlloc + Shareable<C> + 'static,
    {
        let this = Self::try_new_with_in(alloc, init)?;
        Self::enroll(&this);
        Ok(this)
    }

    /// [`Strong::from_box`] for a type that can hand out handles to itself.
    pub fn from_box_observed(boxed: Box<T>) -> Self
    {
        let this = Self::from_box(boxed);
        Self::enroll(&this);
        this
    }

    pub fn from_box_observed_with<D>(boxed: Box<T>, deleter: D) -> Result<Self, (Box<T>, AllocError)>
    where
        D: FnOnce(Box<T>) + Shareable<C> + 'static,
    {
        let this = Self::from_box_with(boxed, deleter)?;
        Self::enroll(&this);
        Ok(this)
    }

    /// [`Strong::from_raw_in`] for a type that can hand out handles to
    /// itself.
    ///
    /// # Safety
    ///
    /// As for [`Strong::from_raw_in`].
    pub unsafe fn from_raw_observed_in<D, A>(object: NonNull<T>, deleter: D, alloc: A) -> Result<Self, AllocError>
    where
        D: FnOnce(NonNull<T>) + Shareable<C> + 'static,
        A: BlockAlloc + Shareable<C> + 'static,
    {
        let this = Self::from_raw_in(object, deleter, alloc)?;
        Self::enroll(&this);
        Ok(this)
    }

    /// [`Strong::reset_to`] for a type that can hand out handles to itself.
    pub fn reset_to_observed(this: &mut Self, boxed: Box<T>)
    {
        Self::reset_to(this, boxed);
        Self::enroll(this);
    }
}

impl<T: ?Sized + 'static, C: Counter> Default for Strong<T, C>
{
    fn default() -> Self
    {
        Strong {
            parts: None,
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized + 'static, C: Counter> Clone for Strong<T, C>
{
    fn clone(&self) -> Self
    {
        if let Some(parts) = self.parts {
            parts.block.acquire_strong();
        }
        Strong {
            parts: self.parts,
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized + 'static, C: Counter> Deref for Strong<T, C>
{
    type Target = T;

    fn deref(&self) -> &Self::Target
    {
        match Self::get(self) {
            Some(object) => object,
            None => panic!("dereferenced an empty Strong"),
        }
    }
}

impl<T: ?Sized + 'static, C: Counter> Drop for Strong<T, C>
{
    fn drop(&mut self)
    {
        if let Some(parts) = self.parts.take() {
            unsafe {
                parts.block.release(Held::Strong);
            }
        }
    }
}

impl<T: ?Sized + 'static> From<Box<T>> for Strong<T>
{
    fn from(boxed: Box<T>) -> Self { Self::from_box(boxed) }
}

impl<T: ?Sized + 'static, C: Counter> fmt::Debug for Strong<T, C>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.parts {
            Some(parts) => f
                .debug_struct("Strong")
                .field("object", &parts.object.cast::<u8>())
                .field("block", &parts.block)
                .field("strong", &parts.block.strong_count())
                .field("weak", &parts.block.weak_count())
                .finish(),
            None => f.write_str("Strong(empty)"),
        }
    }
}

/// Observing handle.
///
/// Does not keep the object alive, only the block, so it can always tell
/// whether the object still exists. [`Weak::lock`] is the only way back to a
/// `Strong`.
pub struct Weak<T: ?Sized + 'static, C: Counter = Local>
{
    parts: Option<Parts<T, C>>,
}

unsafe impl<T: ?Sized + Send + Sync + 'static, C: Counter + Sync> Send for Weak<T, C> {}
unsafe impl<T: ?Sized + Send + Sync + 'static, C: Counter + Sync> Sync for Weak<T, C> {}

impl<T: ?Sized + 'static, C: Counter> Weak<T, C>
{
    /// An empty handle, attached to no block. It is always expired.
    pub fn new() -> Self { Weak { parts: None } }

    pub fn is_empty(&self) -> bool { self.parts.is_none() }

    /// Whether the object is gone (or there never was one).
    pub fn expired(&self) -> bool { self.parts.map_or(true, |p| p.block.strong_count() == 0) }

    /// Attempt to obtain an owning handle.
    ///
    /// Returns `None` once the last `Strong` has been dropped. The liveness
    /// check and the increment are one step, so a concurrent final drop
    /// cannot be undone by this.
    pub fn lock(&self) -> Option<Strong<T, C>>
    {
        let parts = self.parts?;
        if parts.block.try_acquire_strong() {
            Some(Strong {
                parts: Some(parts),
                _owns: PhantomData,
            })
        } else {
            None
        }
    }

    /// Lifecycle state of the block, `None` for an empty handle.
    pub fn state(&self) -> Option<State> { self.parts.map(|p| p.block.state()) }

    pub fn strong_count(&self) -> usize { self.parts.map_or(0, |p| p.block.strong_count()) }

    pub fn weak_count(&self) -> usize { self.parts.map_or(0, |p| p.block.weak_count()) }

    /// [`Strong::map`] for weak handles.
    ///
    /// Only possible while the object is alive, since `f` must look at it:
    /// an expired handle yields `None` and cannot be re-targeted, not even
    /// upcast.
    pub fn map<U, F>(&self, f: F) -> Option<Weak<U, C>>
    where
        U: ?Sized + 'static,
        F: FnOnce(&T) -> &U,
        T: Shareable<C>,
    {
        let strong = Strong::map(self.lock()?, f);
        Some(Strong::downgrade(&strong))
    }

    /// Moves the handle out, leaving `self` empty.
    pub fn take(&mut self) -> Self { Weak { parts: self.parts.take() } }

    pub fn ptr_eq<U: ?Sized + 'static>(&self, other: &Weak<U, C>) -> bool
    {
        match (self.parts, other.parts) {
            (Some(a), Some(b)) => same_address(a.object, b.object),
            (None, None) => true,
            _ => false,
        }
    }

    pub fn same_block<U: ?Sized + 'static>(&self, other: &Weak<U, C>) -> bool
    {
        match (self.parts, other.parts) {
            (Some(a), Some(b)) => a.block == b.block,
            _ => false,
        }
    }
}

impl<T: ?Sized + 'static, C: Counter> Default for Weak<T, C>
{
    fn default() -> Self { Self::new() }
}

impl<T: ?Sized + 'static, C: Counter> Clone for Weak<T, C>
{
    fn clone(&self) -> Self
    {
        if let Some(parts) = self.parts {
            parts.block.acquire_weak();
        }
        Weak { parts: self.parts }
    }
}

impl<T: ?Sized + 'static, C: Counter> From<&Strong<T, C>> for Weak<T, C>
{
    fn from(strong: &Strong<T, C>) -> Self { Strong::downgrade(strong) }
}

impl<T: ?Sized + 'static, C: Counter> Drop for Weak<T, C>
{
    fn drop(&mut self)
    {
        if let Some(parts) = self.parts.take() {
            unsafe {
                parts.block.release(Held::Weak);
            }
        }
    }
}

impl<T: ?Sized + 'static, C: Counter> fmt::Debug for Weak<T, C>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.parts {
            Some(parts) => f
                .debug_struct("Weak")
                .field("object", &parts.object.cast::<u8>())
                .field("block", &parts.block)
                .field("state", &parts.block.state())
                .finish(),
            None => f.write_str("Weak(empty)"),
        }
    }
}
