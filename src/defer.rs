// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deferred filesystem updates.
//!
//! Allocator operations ripple: freeing a block changes the
//! free-space btrees, which changes the reverse-mapping btree, which
//! may change the free list again.  Rather than recursing, callers
//! stage the follow-on work as deferred items and finish them in AG
//! order once the triggering operation is done.  A journaling
//! filesystem would write an intent record for each batch before
//! finishing it; this tool runs against an offline device and does
//! not journal, so the intent hooks are deliberately empty.
//!
//! Each class of deferred work implements [`DeferOp`].  The finish
//! step for a class may thread state across consecutive items — the
//! reverse-mapping class keeps the AG free space header attached
//! while a run of updates stays within one AG.

use crate::fsops::Transaction;
use crate::mount::{Fork, Mount};
use crate::result::Result;
use crate::rmap::{OwnerInfo, RmapFlags};
use core::cmp::Ordering;
use core::mem;

/// Classes of deferred work.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeferType {
    Free,
    Rmap,
}

/// A deferred free of a physical extent.
#[derive(Clone, Copy, Debug)]
pub struct ExtentFree {
    /// Filesystem block number of the extent start.
    pub start_block: u64,
    pub block_count: u32,
    pub owner: OwnerInfo,
}

/// Direction of a reverse-mapping update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RmapUpdateKind {
    Map,
    Unmap,
}

/// A deferred reverse-mapping update.
#[derive(Clone, Copy, Debug)]
pub struct RmapUpdate {
    pub kind: RmapUpdateKind,
    /// Raw owner encoding.
    pub owner: u64,
    pub fork: Fork,
    /// Filesystem block number of the extent start.
    pub start_block: u64,
    pub block_count: u32,
    pub offset: u64,
    pub unwritten: bool,
}

/// One class of deferred operation.
pub trait DeferOp {
    type Item;
    /// State threaded through consecutive finishes of one batch.
    type State: Default;

    fn defer_type() -> DeferType;

    /// Orders staged items for processing.
    fn diff_items(mp: &Mount, a: &Self::Item, b: &Self::Item) -> Ordering;

    /// Creates the log intent for a batch.  No-op: the tool does not
    /// journal.
    fn create_intent(_count: usize) {}

    /// Logs one item against the intent.  No-op.
    fn log_item(_item: &Self::Item) {}

    /// Creates the done record for a batch.  No-op.
    fn create_done(_count: usize) {}

    /// Aborts the intent after a failed finish.  No-op.
    fn abort_intent() {}

    /// Applies one item.
    fn finish_item(
        tp: &mut dyn Transaction,
        mp: &Mount,
        item: Self::Item,
        state: &mut Self::State,
    ) -> Result<()>;

    /// Releases batch state once every item is finished or one has
    /// failed.
    fn finish_cleanup(_state: Self::State, _res: &Result<()>) {}

    /// Discards an unprocessed item.
    fn cancel_item(_item: Self::Item) {}
}

/// Extent freeing.
pub struct ExtentFreeOp;

impl DeferOp for ExtentFreeOp {
    type Item = ExtentFree;
    type State = ();

    fn defer_type() -> DeferType {
        DeferType::Free
    }

    fn diff_items(mp: &Mount, a: &ExtentFree, b: &ExtentFree) -> Ordering {
        mp.fsb_to_agno(a.start_block).cmp(&mp.fsb_to_agno(b.start_block))
    }

    fn finish_item(
        tp: &mut dyn Transaction,
        _mp: &Mount,
        item: ExtentFree,
        _state: &mut (),
    ) -> Result<()> {
        tp.free_extent(item.start_block, item.block_count, &item.owner)
    }
}

/// Reverse-mapping updates.
pub struct RmapUpdateOp;

/// The AGF latch threaded across a run of reverse-mapping updates;
/// re-acquired only when the run crosses into another AG.
#[derive(Default)]
pub struct RmapUpdateState {
    agno: Option<u32>,
}

impl DeferOp for RmapUpdateOp {
    type Item = RmapUpdate;
    type State = RmapUpdateState;

    fn defer_type() -> DeferType {
        DeferType::Rmap
    }

    fn diff_items(mp: &Mount, a: &RmapUpdate, b: &RmapUpdate) -> Ordering {
        mp.fsb_to_agno(a.start_block).cmp(&mp.fsb_to_agno(b.start_block))
    }

    fn finish_item(
        tp: &mut dyn Transaction,
        mp: &Mount,
        item: RmapUpdate,
        state: &mut RmapUpdateState,
    ) -> Result<()> {
        let agno = mp.fsb_to_agno(item.start_block);
        if state.agno != Some(agno) {
            tp.read_agf(agno)?;
            state.agno = Some(agno);
        }
        let mut flags = RmapFlags::empty();
        if item.fork == Fork::Attr {
            flags |= RmapFlags::ATTR_FORK;
        }
        let oinfo =
            OwnerInfo { owner: item.owner, offset: item.offset, flags };
        let agbno = mp.fsb_to_agbno(item.start_block);
        match item.kind {
            RmapUpdateKind::Map => {
                tp.rmap_alloc(agno, agbno, item.block_count, &oinfo)
            }
            RmapUpdateKind::Unmap => {
                tp.rmap_free(agno, agbno, item.block_count, &oinfo)
            }
        }
    }
}

/// A staged deferred item, carried by value.
pub enum PendingItem {
    Free(ExtentFree),
    Rmap(RmapUpdate),
}

/// The set of deferred items staged by one operation.
#[derive(Default)]
pub struct DeferQueue {
    items: Vec<PendingItem>,
}

impl DeferQueue {
    pub fn new() -> DeferQueue {
        DeferQueue { items: Vec::new() }
    }

    pub fn defer_free(&mut self, item: ExtentFree) {
        self.items.push(PendingItem::Free(item));
    }

    pub fn defer_rmap(&mut self, item: RmapUpdate) {
        self.items.push(PendingItem::Rmap(item));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Finishes every staged item against `tp`: frees first, then
    /// reverse-mapping updates, each class in AG order.  On failure
    /// the remaining items of the batch are cancelled and the error
    /// is returned.
    pub fn finish(
        &mut self,
        tp: &mut dyn Transaction,
        mp: &Mount,
    ) -> Result<()> {
        let mut frees = Vec::new();
        let mut rmaps = Vec::new();
        for item in mem::take(&mut self.items) {
            match item {
                PendingItem::Free(f) => frees.push(f),
                PendingItem::Rmap(r) => rmaps.push(r),
            }
        }
        finish_class::<ExtentFreeOp>(tp, mp, frees)?;
        finish_class::<RmapUpdateOp>(tp, mp, rmaps)
    }

    /// Discards everything staged.
    pub fn cancel(&mut self) {
        for item in mem::take(&mut self.items) {
            match item {
                PendingItem::Free(f) => ExtentFreeOp::cancel_item(f),
                PendingItem::Rmap(r) => RmapUpdateOp::cancel_item(r),
            }
        }
    }
}

/// Finishes one class of deferred items in its processing order,
/// threading the class's batch state through every finish.
fn finish_class<O: DeferOp>(
    tp: &mut dyn Transaction,
    mp: &Mount,
    mut items: Vec<O::Item>,
) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    items.sort_by(|a, b| O::diff_items(mp, a, b));
    O::create_intent(items.len());
    for item in &items {
        O::log_item(item);
    }
    O::create_done(items.len());

    let mut state = O::State::default();
    let mut res = Ok(());
    let mut items = items.into_iter();
    for item in items.by_ref() {
        res = O::finish_item(tp, mp, item, &mut state);
        if res.is_err() {
            break;
        }
    }
    if res.is_err() {
        O::abort_intent();
        for item in items {
            O::cancel_item(item);
        }
    }
    O::finish_cleanup(state, &res);
    res
}
