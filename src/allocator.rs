use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use crate::error::AllocError;

/// The memory source a control block is placed in.
///
/// Only what is needed to place and free one block is asked for. A block
/// keeps its allocator by value and hands it back the exact layout it was
/// allocated with, whatever the static type of the handle that happens to
/// release it.
///
/// # Safety
///
/// `allocate` must return memory valid for reads and writes of
/// `layout.size()` bytes at `layout.align()`, which stays valid until passed
/// to `deallocate` on the same allocator (or a clone of it).
pub unsafe trait BlockAlloc
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process heap, through `std::alloc`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Heap;

unsafe impl BlockAlloc for Heap
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>
    {
        debug_assert!(layout.size() > 0, "control blocks are never zero-sized");
        NonNull::new(unsafe { alloc::alloc(layout) }).ok_or(AllocError::new(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout)
    {
        alloc::dealloc(ptr.as_ptr(), layout)
    }
}

unsafe impl<A: BlockAlloc + ?Sized> BlockAlloc for &A
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>
    {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout)
    {
        (**self).deallocate(ptr, layout)
    }
}

unsafe impl<A: BlockAlloc + ?Sized> BlockAlloc for std::sync::Arc<A>
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>
    {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout)
    {
        (**self).deallocate(ptr, layout)
    }
}
