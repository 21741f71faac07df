// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reloading the on-disk reverse-mapping btrees.
//!
//! By the time this driver runs, the btree construction phase has
//! written fresh AG headers and bulk-loaded every fork and metadata
//! observation into a new reverse-mapping btree; the collected
//! slabs were consumed in the process.  What the bulk load cannot
//! see is the metadata that phase created while it ran: the blocks
//! now sitting on the AG free list, and the blocks the new AG
//! btrees themselves occupy (which that phase records as raw
//! observations).  This driver sweeps those stragglers into the
//! tree — and because every insert may grow the tree and every
//! growth consumes free-list blocks, each record goes in under its
//! own transaction with a free-list fixup after the commit.
//!
//! Only metadata owners reach this loop; fork mappings were loaded
//! wholesale and never reappear here.

use crate::collect::RmapIndex;
use crate::fsops::{FreelistFlags, FsRepair, Transaction, agfl_blocks};
use crate::mount::Mount;
use crate::result::Result;
use crate::rmap::{RmapOwner, RmapRecord};
use log::{debug, trace};

/// Rebuilds the reverse-mapping btree of every AG, in ascending AG
/// order.
pub fn rebuild(
    idx: &mut RmapIndex,
    mp: &Mount,
    fs: &mut dyn FsRepair,
) -> Result<()> {
    for agno in 0..mp.ag_count {
        rebuild_ag(idx, mp, fs, agno)?;
    }
    Ok(())
}

/// Rebuilds one AG's reverse-mapping btree from the free-list and
/// AG-btree observations.
pub fn rebuild_ag(
    idx: &mut RmapIndex,
    mp: &Mount,
    fs: &mut dyn FsRepair,
    agno: u32,
) -> Result<()> {
    if !idx.enabled() {
        return Ok(());
    }
    debug!("reloading AG {} reverse-mapping btree", agno);

    // The bulk load consumed the merged observations; start over
    // with the free-list blocks.  Slots up to the leftover count
    // were placed by earlier phases and are already mapped.
    idx.drain_cooked(agno);
    let buf = fs.read_agfl(agno)?;
    let skip = idx.agfl_leftover(agno);
    for agbno in agfl_blocks(&buf, skip, mp.agfl_size)? {
        idx.add_ag_metadata(mp, agno, agbno, 1, RmapOwner::Ag)?;
    }
    idx.fold_raw(agno)?;

    let cooked = idx.cooked(agno);
    let mut cur = cooked.cursor_by(RmapRecord::compare);
    while let Some(rec) = cur.pop() {
        assert!(!rec.owner.is_inode());
        trace!("storing AG {} rmap: {}", agno, rec);

        let tp = fs.begin()?;
        insert_one(tp, agno, rec)?;
        // Growing the btree may have eaten into the free list;
        // refill it before the next insert.  Never shrink: freeing
        // a surplus block would require removing its mapping from
        // the btree we are still loading.
        fs.fix_freelist(agno, FreelistFlags::NOSHRINK)?;
    }
    Ok(())
}

/// Inserts one record under its own transaction, cancelling on
/// failure.
fn insert_one(
    mut tp: Box<dyn Transaction + '_>,
    agno: u32,
    rec: &RmapRecord,
) -> Result<()> {
    match stage_one(tp.as_mut(), agno, rec) {
        Ok(()) => tp.commit(),
        Err(e) => {
            tp.cancel();
            Err(e)
        }
    }
}

fn stage_one(
    tp: &mut dyn Transaction,
    agno: u32,
    rec: &RmapRecord,
) -> Result<()> {
    tp.read_agf(agno)?;
    tp.rmap_alloc(agno, rec.start_block, rec.block_count, &rec.owner_info())
}
