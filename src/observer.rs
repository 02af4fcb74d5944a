use std::{fmt, sync::OnceLock};

use crate::{
    counter::{Counter, Local},
    pointers::{Strong, Weak},
};

/// Weak handle an object keeps to itself, for [`SelfObserver`].
///
/// Starts out empty. It is filled by the `*_observed` constructors of
/// [`Strong`] before they return, or by [`Strong::enroll`], and never changes
/// afterwards.
pub struct SelfSlot<T: 'static, C: Counter = Local>(OnceLock<Weak<T, C>>);

impl<T: 'static, C: Counter> SelfSlot<T, C>
{
    pub const fn new() -> Self { SelfSlot(OnceLock::new()) }

    /// The handle, once the object is owned by a block.
    pub fn get(&self) -> Option<&Weak<T, C>> { self.0.get() }

    // An object is enrolled once, right after its block is created.
    pub(crate) fn fill(&self, weak: Weak<T, C>) { let _ = self.0.set(weak); }
}

impl<T: 'static, C: Counter> Default for SelfSlot<T, C>
{
    fn default() -> Self { Self::new() }
}

impl<T: 'static, C: Counter> fmt::Debug for SelfSlot<T, C>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_tuple("SelfSlot").field(&self.0.get()).finish()
    }
}

/// Types that can obtain a [`Strong`] to themselves.
///
/// The type embeds a [`SelfSlot`]. Every constructor of [`Strong`] has an
/// `_observed` counterpart (such as [`Strong::new_observed`] or
/// [`Strong::from_raw_observed_in`]) that fills it; a handle made any other
/// way can be passed to [`Strong::enroll`].
///
/// ```
/// use sharedref::{SelfObserver, SelfSlot, Strong};
///
/// struct Node
/// {
///     name: &'static str,
///     me: SelfSlot<Node>,
/// }
///
/// impl SelfObserver for Node
/// {
///     fn self_slot(&self) -> &SelfSlot<Node> { &self.me }
/// }
///
/// let node: Strong<Node> = Strong::new_observed(Node { name: "root", me: SelfSlot::new() });
/// let again = node.self_handle().unwrap();
/// assert_eq!(again.name, "root");
/// assert_eq!(Strong::strong_count(&node), 2);
/// ```
pub trait SelfObserver<C: Counter = Local>: Sized + 'static
{
    fn self_slot(&self) -> &SelfSlot<Self, C>;

    /// A new owning handle to `self`.
    ///
    /// `None` if the object was never enrolled with a block, or is being
    /// destroyed.
    fn self_handle(&self) -> Option<Strong<Self, C>> { self.self_slot().get()?.lock() }

    /// A new weak handle to `self`, empty if the object was never enrolled.
    fn self_weak(&self) -> Weak<Self, C> { self.self_slot().get().cloned().unwrap_or_default() }
}
