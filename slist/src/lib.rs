#![cfg_attr(docsrs, doc = include_str!("../README.md"))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, deny(missing_docs))]
#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![warn(missing_debug_implementations)]

#[cfg(test)]
extern crate std;

#[macro_use]
pub(crate) mod util;

pub(crate) mod loom;
pub mod stack;

#[doc(inline)]
pub use stack::{AtomicStack, Chain, Links};

use core::ptr::NonNull;

/// Trait implemented by types which can be linked into an [`AtomicStack`].
///
/// In order to be pushed onto an [`AtomicStack`], a type must contain a
/// [`Links`] field that stores the pointer to the next node in the chain, and
/// must tell the stack where that field lives.
///
/// Unlike an owning collection, an [`AtomicStack`] never takes ownership of
/// its nodes: it only ever sees [`NonNull`] pointers to storage owned by the
/// caller. There is therefore no `Handle` type to convert into and out of.
///
/// # Safety
///
/// This is unsafe to implement because it's the implementation's
/// responsibility to ensure that [`links`](Self::links) returns a pointer to a
/// [`Links`] value that lives inside the node pointed to by `ptr`, and that the
/// same node always returns the same `Links`.
pub unsafe trait Linked: Sized {
    /// Return the links of the node pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// This function is safe to call when the pointer points to a valid
    /// instance of `Self` (e.g. it does not dangle).
    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>>;
}
