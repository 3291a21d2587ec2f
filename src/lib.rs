//! # Object memory for the Smalt virtual machine
//!
//! This crate implements the object model and managed heap that the Smalt
//! bytecode interpreter executes against. It owns the tagged representation
//! of values, the header-encoded object metadata, a generational moving
//! collector with weak-reference and ephemeron support, and the snapshot
//! (de)serializer that materializes a heap from a byte image.
//!
//! The layout invariants here are load-bearing for every other part of the
//! VM: the low-bit pointer tag, the header bitfields, the forwarding
//! protocol during a scavenge, and the address-alignment trick that
//! distinguishes generations without reading a header. Each of them is
//! asserted at heap construction rather than assumed.
//!
//! An embedder typically does the following:
//!
//! 1. build a [`Heap`] with [`HeapOptions`], or restore one from a snapshot
//!    with [`snapshot::deserialize`]
//! 2. allocate through [`Heap::allocate`], which may move objects; any
//!    reference held across an allocation must be registered as a root or
//!    held in a handle scope
//! 3. call [`Heap::safepoint`] on method returns and backward branches to
//!    drain pending ephemeron finalizers
//! 4. optionally persist the live graph with [`snapshot::serialize`]
//!
//! The heap is single-threaded and cooperative: collections run
//! synchronously on the mutator's thread and are uninterruptible once
//! begun.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod object;
pub mod util;

mod heap;
pub use crate::heap::{CollectionMode, Heap, HeapError, RootHandle};

pub mod snapshot;

pub use crate::object::{HeapObject, Value};
pub use crate::util::options::HeapOptions;
