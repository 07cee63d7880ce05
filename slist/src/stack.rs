//! [Intrusive] lock-free singly-linked last-in, first-out (LIFO) stacks.
//!
//! See the documentation for the [`AtomicStack`] type for details.
//!
//! [Intrusive]: crate::Linked
use crate::{
    loom::atomic::{AtomicPtr, Ordering::*},
    Linked,
};
use core::{
    fmt,
    marker::PhantomPinned,
    ptr::{self, NonNull},
};

/// An [intrusive] lock-free singly-linked LIFO stack of caller-owned nodes.
///
/// This is the kernel's "SLIST": a single atomic head pointer to a chain of
/// nodes that are linked through an embedded [`Links`] field. It provides
/// three operations:
///
/// - [`AtomicStack::push`], which links a node in front of the current head,
///   returning the previous head,
///
/// - [`AtomicStack::pop`], which unlinks the current head,
///
/// - [`AtomicStack::flush`], which atomically takes every node currently on
///   the stack as a [`Chain`].
///
/// `push` and `pop` are *O*(1) operations that perform a compare-and-swap loop
/// which may be retried if another processor concurrently modified the head.
/// `flush` is a single atomic swap and never loops.
///
/// In order to be part of an `AtomicStack`, a type `T` must implement the
/// [`Linked`] trait.
///
/// # Ownership
///
/// An `AtomicStack` never owns its nodes. It does not allocate, and dropping
/// an `AtomicStack` does not free or drop whatever nodes are still linked into
/// it. The chain reachable from the head is exactly the set of nodes that have
/// been pushed and not yet popped or flushed.
///
/// # ABA
///
/// This stack is **not** ABA-safe. Consider a `pop` on processor 1 that reads
/// head `A` and its successor `B`, and is then delayed. Processor 2 pops `A`,
/// pops `B`, and pushes `A` again. Processor 1's compare-and-swap now succeeds
/// (the head is `A` once more) and installs `B`, which is no longer on the
/// stack, as the new head. Worse, if processor 2 had *freed* `A`, processor 1
/// would have read `A`'s links after they were freed.
///
/// For this reason [`push`](Self::push) and [`pop`](Self::pop) are `unsafe`:
/// the caller must be able to prove that this interleaving cannot happen. In
/// practice that means either:
///
/// - only one context ever pops (for example, many producers `push` and a
///   single consumer `flush`es or `pop`s), or
/// - popped nodes are never freed or re-pushed while any other processor may
///   still be in the middle of a `pop` on the same stack.
///
/// Callers who need ABA safety in the general case need a versioned head,
/// which this type does not provide.
///
/// [intrusive]: crate::Linked
pub struct AtomicStack<T> {
    head: AtomicPtr<T>,
}

/// A chain of nodes removed from an [`AtomicStack`] by
/// [`flush`](AtomicStack::flush).
///
/// A `Chain` is an [`Iterator`] over the flushed nodes, in the order they
/// would have been [`pop`](AtomicStack::pop)ped: the most recently pushed node
/// comes first. Each node's links are read *before* the node is yielded, so
/// the caller is free to reuse or free a node as soon as it has been returned
/// by [`Iterator::next`].
///
/// Dropping a `Chain` before it has been exhausted simply forgets the
/// remaining nodes; they were never owned by the stack.
#[must_use = "a `Chain` does nothing unless iterated over"]
pub struct Chain<T> {
    head: Option<NonNull<T>>,
}

/// Links to other nodes in an [`AtomicStack`].
///
/// In order to be part of an [`AtomicStack`], a type must contain an instance
/// of this type, and must implement the [`Linked`] trait.
pub struct Links<T> {
    /// The next node in the stack.
    ///
    /// This is an atomic rather than an `UnsafeCell`: a concurrent `pop` may
    /// read the links of a node that another processor is popping and
    /// re-pushing at the same time. The compare-and-swap will reject such a
    /// read, but the read itself must not be a data race.
    next: AtomicPtr<T>,

    /// Linked list links must always be `!Unpin`, in order to ensure that they
    /// never recieve LLVM `noalias` annotations; see also
    /// <https://github.com/rust-lang/rust/issues/63818>.
    _unpin: PhantomPinned,
}

// === impl AtomicStack ===

impl<T> AtomicStack<T>
where
    T: Linked,
{
    /// Returns a new `AtomicStack` with no elements.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns a new `AtomicStack` with no elements.
    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `node` onto the top of this `AtomicStack`, returning the node
    /// that was previously on top (or `None` if the stack was empty).
    ///
    /// This is an *O*(1) operation, although it performs a compare-and-swap
    /// loop that may repeat if another processor is concurrently modifying
    /// the same `AtomicStack`.
    ///
    /// # Safety
    ///
    /// - `node` must point to a valid `T`, and must remain valid until it has
    ///   been removed from the stack again, either by [`pop`](Self::pop) or by
    ///   being yielded from a [`Chain`] returned by [`flush`](Self::flush).
    /// - `node` must not currently be linked into this or any other
    ///   `AtomicStack`.
    /// - See the [type-level documentation](Self#aba) on ABA: the caller must
    ///   ensure that pushing `node` cannot race with a `pop` that is still
    ///   holding a stale pointer to it.
    #[inline]
    pub unsafe fn push(&self, node: NonNull<T>) -> Option<NonNull<T>> {
        let links = T::links(node);
        let mut head = self.head.load(Relaxed);
        loop {
            test_trace!(?node, ?head, "AtomicStack::push");
            links.as_ref().next.store(head, Relaxed);

            match self
                .head
                .compare_exchange_weak(head, node.as_ptr(), AcqRel, Acquire)
            {
                Ok(old) => {
                    test_trace!(?node, ?old, "AtomicStack::push -> pushed");
                    return NonNull::new(old);
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Pushes `node` onto the top of this `AtomicStack`, returning `true` if
    /// the stack was previously empty.
    ///
    /// This is useful for producers that need to notify a consumer only when
    /// the stack transitions from empty to non-empty.
    ///
    /// # Safety
    ///
    /// The same requirements as [`push`](Self::push) apply.
    #[inline]
    pub unsafe fn push_was_empty(&self, node: NonNull<T>) -> bool {
        self.push(node).is_none()
    }

    /// Removes the node on top of this `AtomicStack`, returning it, or `None`
    /// if the stack is empty.
    ///
    /// This is an *O*(1) operation, although it performs a compare-and-swap
    /// loop that may repeat if another processor is concurrently modifying
    /// the same `AtomicStack`.
    ///
    /// # Safety
    ///
    /// This reads the links of the current head node before unlinking it. The
    /// caller must guarantee that no node which could be the head of this
    /// stack is freed while this `pop` is in progress, and that the ABA
    /// interleaving described in the [type-level
    /// documentation](Self#aba) cannot occur.
    pub unsafe fn pop(&self) -> Option<NonNull<T>> {
        let mut head = self.head.load(Acquire);
        loop {
            let node = NonNull::new(head)?;
            let next = T::links(node).as_ref().next.load(Relaxed);
            test_trace!(?node, ?next, "AtomicStack::pop");

            match self
                .head
                .compare_exchange_weak(head, next, AcqRel, Acquire)
            {
                Ok(_) => {
                    test_trace!(?node, "AtomicStack::pop -> popped");
                    return Some(node);
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Takes all nodes *currently* in this `AtomicStack`, returning them as a
    /// [`Chain`].
    ///
    /// This is an *O*(1) operation which does not allocate memory. It will
    /// never loop and does not spin. If the stack is empty, the returned
    /// `Chain` is empty.
    pub fn flush(&self) -> Chain<T> {
        let head = self.head.swap(ptr::null_mut(), AcqRel);
        test_trace!(?head, "AtomicStack::flush");
        Chain {
            head: NonNull::new(head),
        }
    }

    /// Returns `true` if this `AtomicStack` is empty.
    ///
    /// The result is only a snapshot: other processors may push or pop
    /// concurrently.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Relaxed).is_null()
    }
}

impl<T> fmt::Debug for AtomicStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { head } = self;
        f.debug_struct("AtomicStack").field("head", head).finish()
    }
}

impl<T> Default for AtomicStack<T>
where
    T: Linked,
{
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
///
/// An `AtomicStack` only stores pointers to nodes; moving or sharing it
/// between processors moves or shares access to those nodes, so `T` must be
/// `Send`.
unsafe impl<T: Send> Send for AtomicStack<T> {}
unsafe impl<T: Send> Sync for AtomicStack<T> {}

// === impl Chain ===

impl<T> Chain<T>
where
    T: Linked,
{
    /// Returns an empty `Chain`.
    #[must_use]
    pub const fn empty() -> Self {
        Self { head: None }
    }

    /// Returns `true` if there are no more nodes in this `Chain`.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl<T> Iterator for Chain<T>
where
    T: Linked,
{
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.head?;
        unsafe {
            // Safety: `push` requires nodes to stay valid until they are
            // yielded from a `Chain`, and this node has not been yielded yet.
            self.head = NonNull::new(T::links(node).as_ref().next.load(Relaxed));
        }
        Some(node)
    }
}

impl<T> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { head } = self;
        f.debug_struct("Chain").field("head", head).finish()
    }
}

unsafe impl<T: Send> Send for Chain<T> {}

// === impl Links ===

impl<T> Links<T> {
    /// Returns new [`AtomicStack`] links.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            _unpin: PhantomPinned,
        }
    }

    /// Returns new [`AtomicStack`] links.
    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            _unpin: PhantomPinned,
        }
    }
}

/// # Safety
///
/// Types containing [`Links`] may be `Send`: the pointer within the `Links`
/// may alias another node, but it is only ever _accessed_ by an
/// [`AtomicStack`] or a [`Chain`], and only through atomic operations.
unsafe impl<T: Send> Send for Links<T> {}

/// # Safety
///
/// See the `Send` impl.
unsafe impl<T: Sync> Sync for Links<T> {}

impl<T> fmt::Debug for Links<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stack::Links { ... }")
    }
}

impl<T> Default for Links<T> {
    fn default() -> Self {
        Self::new()
    }
}



#[cfg(test)]
mod test_util {
    use super::*;
    use crate::loom::alloc;

    pub(super) struct Entry {
        links: Links<Entry>,
        pub(super) val: i32,
        _track: alloc::Track<()>,
    }

    unsafe impl Linked for Entry {
        unsafe fn links(target: NonNull<Self>) -> NonNull<Links<Self>> {
            let links = ptr::addr_of_mut!((*target.as_ptr()).links);
            // Safety: it's fine to use `new_unchecked` here; if the pointer that we
            // offset to the `links` field is not null (which it shouldn't be, as we
            // received it as a `NonNull`), the offset pointer should therefore also
            // not be null.
            NonNull::new_unchecked(links)
        }
    }

    impl Entry {
        /// Allocates a new node and leaks it; the stack never owns nodes, so
        /// tests must hand every node back to [`Entry::reclaim`].
        pub(super) fn new(val: i32) -> NonNull<Entry> {
            let entry = Box::new(Entry {
                links: Links::new(),
                val,
                _track: alloc::Track::new(()),
            });
            NonNull::from(Box::leak(entry))
        }

        pub(super) fn push_all(stack: &AtomicStack<Self>, thread: i32, n: i32) {
            for i in 0..n {
                let entry = Self::new((thread * 10) + i);
                unsafe {
                    stack.push(entry);
                }
            }
        }

        pub(super) fn reclaim(node: NonNull<Entry>) -> i32 {
            let entry = unsafe { Box::from_raw(node.as_ptr()) };
            entry.val
        }

        pub(super) fn reclaim_all(chain: Chain<Entry>) -> impl Iterator<Item = i32> {
            chain.map(Self::reclaim)
        }

        // Raw pointers aren't `Send`, so threads hand nodes back as addresses.
        pub(super) fn addr(node: NonNull<Entry>) -> usize {
            node.as_ptr() as usize
        }

        pub(super) fn reclaim_addr(addr: usize) -> i32 {
            let node = NonNull::new(addr as *mut Entry).expect("address was a valid node");
            Self::reclaim(node)
        }
    }
}
