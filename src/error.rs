use std::alloc::Layout;

use thiserror::Error;

/// The allocator could not provide memory for a control block.
///
/// Nothing was taken over when this is returned: an object handed to a
/// constructing call still belongs to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to allocate control block of {} bytes (align {})", .layout.size(), .layout.align())]
pub struct AllocError
{
    layout: Layout,
}

impl AllocError
{
    pub fn new(layout: Layout) -> Self { AllocError { layout } }

    /// Layout of the block that could not be allocated.
    pub fn layout(&self) -> Layout { self.layout }
}

/// Failure of an inline construction.
///
/// In both cases the block memory has already been returned to its
/// allocator and no destructor has run.
#[derive(Debug, Error)]
pub enum InitError<E>
{
    #[error(transparent)]
    Allocation(#[from] AllocError),

    #[error("object construction failed: {0}")]
    Construction(E),
}

impl<E> InitError<E>
{
    /// The constructor's own error, if that is what failed.
    pub fn into_construction(self) -> Option<E>
    {
        match self {
            InitError::Construction(e) => Some(e),
            InitError::Allocation(_) => None,
        }
    }
}
