// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reverse-mapping reconstruction for offline filesystem repair.
//!
//! A reverse-mapping btree maps physical block ranges back to their
//! owners, one btree per allocation group.  When the repair tool
//! decides those btrees cannot be trusted, it rebuilds them from
//! scratch: the scan phases report every block owner they discover
//! to this crate, which accumulates the observations per AG, merges
//! adjacent ones into canonical records, reloads each AG's btree
//! under the allocator's control, and finally cross-checks the
//! result against what was observed.
//!
//! The chicken-and-egg problems live here too.  A reverse-mapping
//! btree cannot be populated until its blocks are allocated, yet
//! allocating blocks creates mappings; and every insertion may pull
//! blocks off the AG free list, which must stay within its size
//! band while the tree grows.  The rebuild driver threads that
//! needle by inserting one record per transaction and fixing the
//! free list between insertions, never letting it shrink.
//!
//! The crate is a library with no I/O of its own; the allocator,
//! transaction manager, and btree cursors are reached through the
//! traits in [`fsops`].  Everything is synchronous and
//! single-threaded: the tool holds exclusive access to an offline
//! device for its entire run.

pub mod collect;
pub mod defer;
pub mod fsops;
pub mod mount;
pub mod rebuild;
pub mod result;
pub mod rmap;
pub mod slab;
pub mod verify;

pub use collect::RmapIndex;
pub use mount::{Fork, ForkMapping, Mount};
pub use rebuild::rebuild;
pub use result::{Error, Result};
pub use rmap::{RmapFlags, RmapOwner, RmapRecord};
pub use verify::{VerifyReport, verify};

#[cfg(test)]
mod fakes;
