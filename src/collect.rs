// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collecting reverse-mapping observations.
//!
//! The scan phases call in here every time they learn who owns a
//! block range.  Each AG keeps two slabs: `cooked` holds records
//! that arrive in physical order (file-fork extents, which the scan
//! visits inode by inode in ascending block order within each
//! owner), and `raw` holds metadata records that arrive in whatever
//! order the scan finds them.  File-fork observations number in the
//! millions and are overwhelmingly contiguous, so they pass through
//! a one-record coalescer (`last`) that extends a pending record in
//! place instead of storing every observation and sorting later.
//! The raw slab is merged into `cooked` by [`RmapIndex::fold_raw`]
//! once a phase stops adding to it.

use crate::mount::{ChunkIndex, Fork, ForkMapping, Mount};
use crate::result::{Error, Result};
use crate::rmap::{RmapFlags, RmapOwner, RmapRecord};
use crate::slab::Slab;
use bit_field::BitField;
use core::mem;
use log::trace;

/// Reverse-mapping state for one AG.
struct AgRmap {
    /// Merged observations, kept in record order between phases.
    cooked: Slab<RmapRecord>,
    /// Unmerged metadata observations, unordered.
    raw: Slab<RmapRecord>,
    /// Pending file-fork record; owner Unknown when empty.
    last: RmapRecord,
    /// Free-list slots already accounted for by earlier phases.
    agfl_leftover: u32,
}

impl AgRmap {
    fn new() -> AgRmap {
        AgRmap {
            cooked: Slab::new(),
            raw: Slab::new(),
            last: RmapRecord::unknown(),
            agfl_leftover: 0,
        }
    }
}

/// All reverse-mapping observations for the filesystem.
///
/// Created once the filesystem is known to carry reverse-mapping
/// btrees; on filesystems without them every entry point is a
/// no-op.
pub struct RmapIndex {
    enabled: bool,
    suspect: bool,
    ag: Vec<AgRmap>,
}

impl RmapIndex {
    pub fn new(mp: &Mount) -> RmapIndex {
        let enabled = mp.has_rmapbt();
        let ag = if enabled {
            (0..mp.ag_count).map(|_| AgRmap::new()).collect()
        } else {
            Vec::new()
        };
        RmapIndex { enabled, suspect: false, ag }
    }

    /// Returns true IFF the filesystem carries reverse-mapping
    /// btrees and observations are being collected.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Marks the on-disk reverse-mapping btrees as untrustworthy.
    pub fn set_suspect(&mut self) {
        self.suspect = true;
    }

    pub fn suspect(&self) -> bool {
        self.suspect
    }

    fn ag_mut(&mut self, agno: u32) -> &mut AgRmap {
        &mut self.ag[agno as usize]
    }

    /// Records one extent of an inode's data or attr fork.
    ///
    /// Consecutive calls for one AG are coalesced through the
    /// pending record; [`RmapIndex::finish_fork_recs`] flushes the
    /// remainder when the AG's file scan completes.
    pub fn add_file_mapping(
        &mut self,
        mp: &Mount,
        ino: u64,
        fork: Fork,
        map: &ForkMapping,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let agno = mp.fsb_to_agno(map.start_block);
        let agbno = mp.fsb_to_agbno(map.start_block);
        if agno >= mp.ag_count {
            return Err(Error::BadAg);
        }
        if u64::from(agbno) + u64::from(map.block_count)
            > u64::from(mp.ag_blocks)
        {
            return Err(Error::BadExtent);
        }
        map.offset
            .checked_add(u64::from(map.block_count))
            .ok_or(Error::OffsetOverflow)?;

        let mut flags = RmapFlags::empty();
        if fork == Fork::Attr {
            flags |= RmapFlags::ATTR_FORK;
        }
        if map.unwritten {
            flags |= RmapFlags::UNWRITTEN;
        }
        let rmap = RmapRecord {
            start_block: agbno,
            block_count: map.block_count,
            owner: RmapOwner::Inode(ino),
            offset: map.offset,
            flags,
        };
        trace!("observed fork mapping in AG {}: {}", agno, rmap);

        let ag = self.ag_mut(agno);
        if ag.last.owner == RmapOwner::Unknown {
            ag.last = rmap;
        } else if ag.last.mergeable(&rmap) {
            ag.last.merge(&rmap);
        } else {
            let flushed = mem::replace(&mut ag.last, rmap);
            ag.cooked.append(flushed)?;
        }
        Ok(())
    }

    /// Flushes the pending file-fork record for one AG.
    pub fn finish_fork_recs(&mut self, agno: u32) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let ag = self.ag_mut(agno);
        if ag.last.owner != RmapOwner::Unknown {
            let flushed = mem::replace(&mut ag.last, RmapRecord::unknown());
            ag.cooked.append(flushed)?;
        }
        Ok(())
    }

    /// Records one block of an inode fork's block-mapping btree.
    pub fn add_bmbt_block(
        &mut self,
        mp: &Mount,
        ino: u64,
        fork: Fork,
        fsb: u64,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let agno = mp.fsb_to_agno(fsb);
        let agbno = mp.fsb_to_agbno(fsb);
        if agno >= mp.ag_count {
            return Err(Error::BadAg);
        }
        if agbno >= mp.ag_blocks {
            return Err(Error::BadExtent);
        }
        let mut flags = RmapFlags::BMBT_BLOCK;
        if fork == Fork::Attr {
            flags |= RmapFlags::ATTR_FORK;
        }
        let rmap = RmapRecord {
            start_block: agbno,
            block_count: 1,
            owner: RmapOwner::Inode(ino),
            offset: 0,
            flags,
        };
        trace!("observed btree block in AG {}: {}", agno, rmap);
        self.ag_mut(agno).raw.append(rmap)
    }

    /// Records a per-AG metadata extent.  `owner` must be one of
    /// the metadata owners.
    pub fn add_ag_metadata(
        &mut self,
        mp: &Mount,
        agno: u32,
        agbno: u32,
        len: u32,
        owner: RmapOwner,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if owner.is_inode() || owner == RmapOwner::Unknown {
            return Err(Error::BadOwner);
        }
        if agno >= mp.ag_count {
            return Err(Error::BadAg);
        }
        if u64::from(agbno) + u64::from(len) > u64::from(mp.ag_blocks) {
            return Err(Error::BadExtent);
        }
        let rmap = RmapRecord {
            start_block: agbno,
            block_count: len,
            owner,
            offset: 0,
            flags: RmapFlags::empty(),
        };
        trace!("observed metadata in AG {}: {}", agno, rmap);
        self.ag_mut(agno).raw.append(rmap)
    }

    /// Records the mappings every AG carries regardless of its
    /// contents: the fixed header span, the inode chunks, and the
    /// internal log if it lives here.
    pub fn add_fixed_ag_metadata<C: ChunkIndex>(
        &mut self,
        mp: &Mount,
        agno: u32,
        chunks: &C,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.add_ag_metadata(mp, agno, 0, mp.header_blocks, RmapOwner::Fs)?;

        for chunk in chunks.chunks(agno) {
            let (start_idx, nr_inodes) = match chunk.sparse_mask {
                Some(mask) if mp.has_sparse_inodes() => (
                    first_allocated_slot(mask, mp.inodes_per_chunk),
                    mp.inodes_per_chunk - mask.count_ones(),
                ),
                _ => (0, mp.inodes_per_chunk),
            };
            let mut blocks = nr_inodes / mp.inodes_per_block;
            if blocks == 0 {
                blocks = 1;
            }
            let agino = chunk.start_ino + start_idx;
            // Chunks that do not begin on a block boundary were
            // accounted for by the record of the chunk they share a
            // block with.
            if mp.agino_to_offset(agino) == 0 {
                self.add_ag_metadata(
                    mp,
                    agno,
                    mp.agino_to_agbno(agino),
                    blocks,
                    RmapOwner::Inodes,
                )?;
            }
        }

        if mp.log_start != 0 && mp.fsb_to_agno(mp.log_start) == agno {
            self.add_ag_metadata(
                mp,
                agno,
                mp.fsb_to_agbno(mp.log_start),
                mp.log_blocks,
                RmapOwner::Log,
            )?;
        }
        Ok(())
    }

    /// Records how many slots at the head of the AG free list were
    /// populated by earlier phases and already have mappings.
    pub fn note_agfl_leftover(&mut self, mp: &Mount, agno: u32, count: u32) {
        if !self.enabled {
            return;
        }
        assert!(count <= mp.agfl_size);
        self.ag_mut(agno).agfl_leftover = count;
    }

    pub fn agfl_leftover(&self, agno: u32) -> u32 {
        if !self.enabled {
            return 0;
        }
        self.ag[agno as usize].agfl_leftover
    }

    /// Merges the raw slab into the cooked slab for one AG.
    ///
    /// The raw slab is sorted, runs of mergeable records are
    /// collapsed as they stream out, and the result lands in
    /// `cooked`.  When `cooked` already held records it now consists
    /// of an ordered prefix and an unordered suffix, so it is sorted
    /// again to restore the global order.
    pub fn fold_raw(&mut self, agno: u32) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let ag = &mut self.ag[agno as usize];
        let old_cooked = ag.cooked.count();

        if !ag.raw.is_empty() {
            ag.raw.sort_by(RmapRecord::compare);
            let mut cur = ag.raw.cursor_by(RmapRecord::compare);
            if let Some(first) = cur.pop() {
                let mut prev = *first;
                for rec in cur {
                    if prev.mergeable(rec) {
                        prev.merge(rec);
                    } else {
                        ag.cooked.append(prev)?;
                        prev = *rec;
                    }
                }
                ag.cooked.append(prev)?;
            }
            ag.raw.drain();
        }

        if old_cooked > 0 {
            ag.cooked.sort_by(RmapRecord::compare);
        }
        Ok(())
    }

    /// Returns the number of merged observations held for one AG.
    pub fn cooked_count(&self, agno: u32) -> usize {
        if !self.enabled {
            return 0;
        }
        self.ag[agno as usize].cooked.count()
    }

    /// Returns the merged observations for one AG.
    pub(crate) fn cooked(&self, agno: u32) -> &Slab<RmapRecord> {
        &self.ag[agno as usize].cooked
    }

    /// Restores record order in one AG's merged observations.  The
    /// file scan appends in scan order, which only the fold pass is
    /// guaranteed to have re-sorted.
    pub(crate) fn sort_cooked(&mut self, agno: u32) {
        self.ag_mut(agno).cooked.sort_by(RmapRecord::compare);
    }

    /// Empties one AG's merged observations.
    pub(crate) fn drain_cooked(&mut self, agno: u32) {
        self.ag_mut(agno).cooked.drain();
    }
}

/// Index of the first allocated slot (the first clear bit, since a
/// set bit marks a sparse slot) in the low `nslots` bits of `mask`,
/// or `nslots` when the whole chunk is sparse.
fn first_allocated_slot(mask: u64, nslots: u32) -> u32 {
    (0..nslots).find(|&i| !mask.get_bit(i as usize)).unwrap_or(nslots)
}
