// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces onto the rest of the repair tool.
//!
//! The engine never touches the block device itself.  Reading AG
//! headers, allocating btree blocks, and keeping the AG free list in
//! bounds are the allocator's and transaction manager's business;
//! the traits here are the seam between that machinery and the
//! reverse-mapping phases.  All I/O behind these traits is
//! synchronous and single-threaded, and at most one transaction is
//! open at a time.

use crate::result::{Error, Result};
use crate::rmap::{OwnerInfo, RmapRecord};
use bitflags::bitflags;
use zerocopy::FromBytes;
use zerocopy::byteorder::{BigEndian, U32};

bitflags! {
    /// Modifiers for free-list fixup.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FreelistFlags: u32 {
        /// Never return surplus free-list blocks to the free-space
        /// btrees.  Freeing a block removes its reverse mapping, and
        /// a partially loaded reverse-mapping btree cannot satisfy
        /// removals.
        const NOSHRINK = 1 << 0;
        /// Suppress reverse-mapping updates entirely; used while the
        /// free list is regenerated before the reverse-mapping btree
        /// root is wired into the AGF.
        const NORMAP = 1 << 1;
    }
}

/// Sentinel terminating the AG free list.
pub const NULL_AGBLOCK: u32 = u32::MAX;

/// One open transaction.  A transaction that is neither committed
/// nor cancelled holds its buffers until dropped.
pub trait Transaction {
    /// Reads and attaches the AG free space header for `agno`.
    fn read_agf(&mut self, agno: u32) -> Result<()>;

    /// Inserts a reverse mapping for `[agbno, agbno + len)` owned by
    /// `oinfo` into the AG's reverse-mapping btree.
    fn rmap_alloc(
        &mut self,
        agno: u32,
        agbno: u32,
        len: u32,
        oinfo: &OwnerInfo,
    ) -> Result<()>;

    /// Removes a reverse mapping for `[agbno, agbno + len)`.
    fn rmap_free(
        &mut self,
        agno: u32,
        agbno: u32,
        len: u32,
        oinfo: &OwnerInfo,
    ) -> Result<()>;

    /// Returns an extent to the free-space btrees.
    fn free_extent(
        &mut self,
        fsbno: u64,
        len: u32,
        oinfo: &OwnerInfo,
    ) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn cancel(self: Box<Self>);
}

/// Ranged lookup over one AG's on-disk reverse-mapping btree.
pub trait RmapCursor {
    /// Positions the cursor at the greatest record whose key does
    /// not exceed `rec`'s.  Returns false when no such record
    /// exists.
    fn lookup_le(&mut self, rec: &RmapRecord) -> Result<bool>;

    /// Returns the record under the cursor.
    fn get_rec(&mut self) -> Result<RmapRecord>;
}

/// The allocator-side services the rebuild and verify phases
/// consume.
pub trait FsRepair {
    /// Opens a transaction.
    fn begin(&mut self) -> Result<Box<dyn Transaction + '_>>;

    /// Reads the raw AG free list for `agno`.  The buffer is an
    /// array of big-endian 32-bit AG block numbers, [`NULL_AGBLOCK`]
    /// terminated or bounded by the free-list capacity.
    fn read_agfl(&mut self, agno: u32) -> Result<Vec<u8>>;

    /// Brings the AG free list back into its required size band.
    fn fix_freelist(&mut self, agno: u32, flags: FreelistFlags)
    -> Result<()>;

    /// Opens a lookup cursor over the AG's reverse-mapping btree.
    fn rmap_cursor(&mut self, agno: u32) -> Result<Box<dyn RmapCursor + '_>>;
}

/// Decodes an AG free list buffer, skipping the first `skip` slots
/// and stopping at the terminator or at `size` slots, whichever
/// comes first.
pub fn agfl_blocks(buf: &[u8], skip: u32, size: u32) -> Result<Vec<u32>> {
    let slots = <[U32<BigEndian>]>::ref_from_bytes(buf)
        .map_err(|_| Error::AgflRead)?;
    let mut blocks = Vec::new();
    for slot in slots
        .iter()
        .take(size as usize)
        .skip(skip as usize)
    {
        let bno = slot.get();
        if bno == NULL_AGBLOCK {
            break;
        }
        blocks.push(bno);
    }
    Ok(blocks)
}
