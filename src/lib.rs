//! # Atoll
//!
//! Atoll is a per-region tracing garbage collector for actor-style runtimes.
//! The heap is partitioned into disjoint regions, each rooted at a single
//! *iso* object; a region exclusively owns its mutable objects and collects
//! them as a unit with a mark-and-sweep pass that never crosses a region
//! boundary. References between regions go through shared objects instead:
//! reference-counted immutables and cowns, which every region tracks in a
//! remembered set.
//!
//! What's in the box:
//! - [`RegionTrace`](region_trace::RegionTrace): create regions, allocate
//!   into them, swap the root, merge two regions, collect.
//! - [`Trace`](api::Trace)/[`Collectable`](api::Collectable) and
//!   [`Gc<T>`](api::Gc): the typed object surface.
//! - [`shared`]: reference-counted immutables and cowns, the only things a
//!   region may point at across its boundary.
//! - [`ExternalRef`](ext_ref::ExternalRef): revocable handles into a
//!   region for holders outside it.
//!
//! Objects are threaded onto two intrusive rings per region, split by
//! whether they need attention when swept (finalisers, or fields that may
//! root subregions). Collection discovers unreachable subregions hanging off
//! dead objects and releases them recursively.
//!
//! A region is a single-threaded ownership domain: exactly one scheduler
//! thread may operate on it at a time, and a collection runs to completion
//! once entered. Only shared-object reference counts and external handles
//! are touched by more than one thread.

pub mod api;
pub mod descriptor;
pub mod ext_ref;
pub mod heap;
pub mod object;
pub mod region;
pub mod region_trace;
pub mod remembered_set;
pub mod shared;
pub mod util;


pub use api::{Collectable, Finalize, Gc, ObjectStack, Trace};
pub use ext_ref::ExternalRef;
pub use heap::Alloc;
pub use region_trace::{IterKind, RegionTrace};
