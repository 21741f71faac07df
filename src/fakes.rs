// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the allocator, transaction manager, and
//! on-disk btrees, for tests.

use crate::defer::{DeferQueue, RmapUpdate, RmapUpdateKind};
use crate::fsops::{
    FreelistFlags, FsRepair, NULL_AGBLOCK, RmapCursor, Transaction,
};
use crate::mount::{ChunkIndex, Features, Fork, InodeChunk, Mount};
use crate::result::{Error, Result};
use crate::rmap::{OwnerInfo, RmapOwner, RmapRecord};
use std::collections::BTreeMap;

/// Geometry used throughout the tests: four 4096-block AGs, 16
/// inodes per block, 64 per chunk.
pub(crate) fn test_mount() -> Mount {
    Mount {
        ag_count: 4,
        ag_blocks: 4096,
        inodes_per_block: 16,
        inodes_per_chunk: 64,
        log_start: 0,
        log_blocks: 0,
        agfl_size: 16,
        header_blocks: 4,
        features: Features::RMAPBT,
    }
}

/// Btree key: (start block, raw owner, packed offset).
type RmapKey = (u32, u64, u64);

fn key(rec: &RmapRecord) -> RmapKey {
    (rec.start_block, rec.owner.raw(), rec.offset_pack())
}

/// An in-memory filesystem: one ordered map per AG stands in for
/// the reverse-mapping btree, plus the AG free lists and enough
/// bookkeeping to assert on allocator traffic.
pub(crate) struct FakeFs {
    pub(crate) mp: Mount,
    trees: Vec<BTreeMap<RmapKey, RmapRecord>>,
    pub(crate) agfl: Vec<Vec<u32>>,
    pub(crate) freelist_fixes: Vec<(u32, FreelistFlags)>,
    pub(crate) agf_reads: Vec<u32>,
    pub(crate) freed: Vec<(u64, u32)>,
    /// Fail every btree insertion after the first N.
    pub(crate) fail_after_inserts: Option<usize>,
    pub(crate) inserts: usize,
    pub(crate) cancelled: usize,
    /// When set, free-list fixups top the AGFL back up to this many
    /// slots from the block allocator.
    pub(crate) refill_min: Option<u32>,
    next_bno: u32,
}

impl FakeFs {
    pub(crate) fn new(mp: Mount) -> FakeFs {
        let nags = mp.ag_count as usize;
        FakeFs {
            mp,
            trees: vec![BTreeMap::new(); nags],
            agfl: vec![Vec::new(); nags],
            freelist_fixes: Vec::new(),
            agf_reads: Vec::new(),
            freed: Vec::new(),
            fail_after_inserts: None,
            inserts: 0,
            cancelled: 0,
            refill_min: None,
            next_bno: 2048,
        }
    }

    /// Places a record directly into an AG's btree.
    pub(crate) fn seed_record(&mut self, agno: u32, rec: RmapRecord) {
        self.trees[agno as usize].insert(key(&rec), rec);
    }

    pub(crate) fn tree_len(&self, agno: u32) -> usize {
        self.trees[agno as usize].len()
    }

    /// Returns an AG's btree contents in key order.
    pub(crate) fn tree_records(&self, agno: u32) -> Vec<RmapRecord> {
        self.trees[agno as usize].values().copied().collect()
    }
}

impl FsRepair for FakeFs {
    fn begin(&mut self) -> Result<Box<dyn Transaction + '_>> {
        Ok(Box::new(FakeTrans::new(self)))
    }

    fn read_agfl(&mut self, agno: u32) -> Result<Vec<u8>> {
        let list = self
            .agfl
            .get(agno as usize)
            .ok_or(Error::AgflRead)?;
        let mut slots = vec![NULL_AGBLOCK; self.mp.agfl_size as usize];
        slots[..list.len()].copy_from_slice(list);
        Ok(slots.iter().flat_map(|s| s.to_be_bytes()).collect())
    }

    fn fix_freelist(
        &mut self,
        agno: u32,
        flags: FreelistFlags,
    ) -> Result<()> {
        self.freelist_fixes.push((agno, flags));
        let Some(min) = self.refill_min else {
            return Ok(());
        };
        let mut added = Vec::new();
        while (self.agfl[agno as usize].len() as u32) < min {
            let bno = self.next_bno;
            self.next_bno += 1;
            self.agfl[agno as usize].push(bno);
            added.push(bno);
        }
        if added.is_empty() || flags.contains(FreelistFlags::NORMAP) {
            return Ok(());
        }
        // The blocks that just joined the free list need mappings of
        // their own; stage them as deferred updates and finish them
        // under a fresh transaction, the way the allocator would.
        let mp = self.mp.clone();
        let mut queue = DeferQueue::new();
        for bno in added {
            queue.defer_rmap(RmapUpdate {
                kind: RmapUpdateKind::Map,
                owner: RmapOwner::Ag.raw(),
                fork: Fork::Data,
                start_block: mp.fsb(agno, bno),
                block_count: 1,
                offset: 0,
                unwritten: false,
            });
        }
        let mut tp = FakeTrans::new(self);
        queue.finish(&mut tp, &mp)?;
        tp.apply();
        Ok(())
    }

    fn rmap_cursor(&mut self, agno: u32) -> Result<Box<dyn RmapCursor + '_>> {
        let tree =
            self.trees.get(agno as usize).ok_or(Error::RmapLookup)?;
        Ok(Box::new(FakeCursor { tree, cur: None }))
    }
}

/// A transaction over [`FakeFs`]: changes are staged and only land
/// in the trees at commit.
pub(crate) struct FakeTrans<'a> {
    fs: &'a mut FakeFs,
    staged_inserts: Vec<(u32, RmapRecord)>,
    staged_removes: Vec<(u32, RmapKey)>,
    staged_frees: Vec<(u64, u32)>,
}

impl<'a> FakeTrans<'a> {
    pub(crate) fn new(fs: &'a mut FakeFs) -> FakeTrans<'a> {
        FakeTrans {
            fs,
            staged_inserts: Vec::new(),
            staged_removes: Vec::new(),
            staged_frees: Vec::new(),
        }
    }

    fn apply_inner(&mut self) {
        for (agno, rec) in self.staged_inserts.drain(..) {
            self.fs.trees[agno as usize].insert(key(&rec), rec);
        }
        for (agno, k) in self.staged_removes.drain(..) {
            self.fs.trees[agno as usize].remove(&k);
        }
        for f in self.staged_frees.drain(..) {
            self.fs.freed.push(f);
        }
    }

    /// Commits without the boxed-receiver ceremony.
    pub(crate) fn apply(mut self) {
        self.apply_inner();
    }

    /// Cancels without the boxed-receiver ceremony.
    pub(crate) fn cancel_in_place(self) {
        self.fs.cancelled += 1;
    }
}

impl Transaction for FakeTrans<'_> {
    fn read_agf(&mut self, agno: u32) -> Result<()> {
        if agno >= self.fs.mp.ag_count {
            return Err(Error::AgfRead);
        }
        self.fs.agf_reads.push(agno);
        Ok(())
    }

    fn rmap_alloc(
        &mut self,
        agno: u32,
        agbno: u32,
        len: u32,
        oinfo: &OwnerInfo,
    ) -> Result<()> {
        self.fs.inserts += 1;
        if let Some(n) = self.fs.fail_after_inserts {
            if self.fs.inserts > n {
                return Err(Error::RmapInsert);
            }
        }
        let rec = RmapRecord {
            start_block: agbno,
            block_count: len,
            owner: RmapOwner::from_raw(oinfo.owner),
            offset: oinfo.offset,
            flags: oinfo.flags,
        };
        self.staged_inserts.push((agno, rec));
        Ok(())
    }

    fn rmap_free(
        &mut self,
        agno: u32,
        agbno: u32,
        len: u32,
        oinfo: &OwnerInfo,
    ) -> Result<()> {
        let rec = RmapRecord {
            start_block: agbno,
            block_count: len,
            owner: RmapOwner::from_raw(oinfo.owner),
            offset: oinfo.offset,
            flags: oinfo.flags,
        };
        self.staged_removes.push((agno, key(&rec)));
        Ok(())
    }

    fn free_extent(
        &mut self,
        fsbno: u64,
        len: u32,
        _oinfo: &OwnerInfo,
    ) -> Result<()> {
        self.staged_frees.push((fsbno, len));
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.apply_inner();
        Ok(())
    }

    fn cancel(self: Box<Self>) {
        self.fs.cancelled += 1;
    }
}

/// Ranged lookup over one fake btree.
pub(crate) struct FakeCursor<'a> {
    tree: &'a BTreeMap<RmapKey, RmapRecord>,
    cur: Option<RmapRecord>,
}

impl RmapCursor for FakeCursor<'_> {
    fn lookup_le(&mut self, rec: &RmapRecord) -> Result<bool> {
        self.cur =
            self.tree.range(..=key(rec)).next_back().map(|(_, r)| *r);
        Ok(self.cur.is_some())
    }

    fn get_rec(&mut self) -> Result<RmapRecord> {
        self.cur.ok_or(Error::RmapLookup)
    }
}

/// A canned inode-chunk index.
pub(crate) struct FakeChunks {
    by_ag: Vec<(u32, Vec<InodeChunk>)>,
}

impl FakeChunks {
    pub(crate) fn new(by_ag: Vec<(u32, Vec<InodeChunk>)>) -> FakeChunks {
        FakeChunks { by_ag }
    }
}

impl ChunkIndex for FakeChunks {
    fn chunks(&self, agno: u32) -> impl Iterator<Item = InodeChunk> {
        self.by_ag
            .iter()
            .filter(move |(ag, _)| *ag == agno)
            .flat_map(|(_, chunks)| chunks.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmap::RmapFlags;

    #[test]
    fn normap_refill_skips_mappings() {
        let mut fs = FakeFs::new(test_mount());
        fs.refill_min = Some(2);
        fs.fix_freelist(
            0,
            FreelistFlags::NOSHRINK | FreelistFlags::NORMAP,
        )
        .unwrap();
        assert_eq!(fs.agfl[0].len(), 2);
        assert_eq!(fs.tree_len(0), 0);
    }

    #[test]
    fn agfl_encoding_round_trips() {
        let mut fs = FakeFs::new(test_mount());
        fs.agfl[2] = vec![5, 6, 7];
        let buf = fs.read_agfl(2).unwrap();
        assert_eq!(buf.len(), fs.mp.agfl_size as usize * 4);
        assert_eq!(
            crate::fsops::agfl_blocks(&buf, 0, fs.mp.agfl_size).unwrap(),
            vec![5, 6, 7]
        );
    }

    #[test]
    fn cancel_discards_staged_changes() {
        let mut fs = FakeFs::new(test_mount());
        let mut tp: Box<dyn Transaction + '_> =
            Box::new(FakeTrans::new(&mut fs));
        tp.rmap_alloc(
            0,
            10,
            1,
            &OwnerInfo {
                owner: RmapOwner::Ag.raw(),
                offset: 0,
                flags: RmapFlags::empty(),
            },
        )
        .unwrap();
        tp.cancel();
        assert_eq!(fs.tree_len(0), 0);
        assert_eq!(fs.cancelled, 1);
    }
}
