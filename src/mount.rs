// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filesystem geometry.
//!
//! The repair tool parses the superblock long before the
//! reverse-mapping phases run; this module is the read-only view of
//! that geometry which the engine consumes.  Filesystem block
//! numbers pack the AG number above a per-AG block number using a
//! log2 shift, so AG extraction is a mask and a shift rather than a
//! division.

use bitflags::bitflags;

bitflags! {
    /// Feature bits relevant to reverse-mapping reconstruction.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Features: u32 {
        /// The filesystem carries a reverse-mapping btree per AG.
        const RMAPBT = 1 << 0;
        /// Inode chunks may be sparsely allocated.
        const SPARSE_INODES = 1 << 1;
    }
}

/// An inode fork.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fork {
    Data,
    Attr,
}

/// A single extent in an inode fork, as observed by the file scan.
#[derive(Clone, Copy, Debug)]
pub struct ForkMapping {
    /// Physical start, as a filesystem block number.
    pub start_block: u64,
    /// Length in blocks.
    pub block_count: u32,
    /// Logical offset of the extent within the fork.
    pub offset: u64,
    /// The extent is allocated but unwritten.
    pub unwritten: bool,
}

/// One inode chunk, as recorded by the inode scan.
#[derive(Clone, Copy, Debug)]
pub struct InodeChunk {
    /// AG-relative inode number of the chunk's first slot.
    pub start_ino: u32,
    /// Sparse-allocation mask; a set bit marks an unallocated slot.
    /// `None` on fully-allocated chunks.
    pub sparse_mask: Option<u64>,
}

/// Index of the inode chunks discovered by earlier repair phases.
pub trait ChunkIndex {
    /// Returns the chunks of one AG in ascending inode order.
    fn chunks(&self, agno: u32) -> impl Iterator<Item = InodeChunk>;
}

/// Read-only filesystem geometry, derived from the superblock.
#[derive(Clone, Debug)]
pub struct Mount {
    /// Number of allocation groups.
    pub ag_count: u32,
    /// Size of each AG in blocks.
    pub ag_blocks: u32,
    pub inodes_per_block: u32,
    pub inodes_per_chunk: u32,
    /// First block of the internal log, as a filesystem block
    /// number; zero when the log is external.
    pub log_start: u64,
    /// Length of the internal log in blocks.
    pub log_blocks: u32,
    /// Capacity of the AG free list, in slots.
    pub agfl_size: u32,
    /// Span of the fixed AG headers (superblock, AGF, AGI, AGFL) in
    /// blocks.
    pub header_blocks: u32,
    pub features: Features,
}

impl Mount {
    pub fn has_rmapbt(&self) -> bool {
        self.features.contains(Features::RMAPBT)
    }

    pub fn has_sparse_inodes(&self) -> bool {
        self.features.contains(Features::SPARSE_INODES)
    }

    /// Width of the AG-relative block field in a filesystem block
    /// number.
    fn ag_block_log(&self) -> u32 {
        self.ag_blocks.next_power_of_two().trailing_zeros()
    }

    /// Returns the AG number of a filesystem block.
    pub fn fsb_to_agno(&self, fsb: u64) -> u32 {
        (fsb >> self.ag_block_log()) as u32
    }

    /// Returns the AG-relative block number of a filesystem block.
    pub fn fsb_to_agbno(&self, fsb: u64) -> u32 {
        (fsb & ((1 << self.ag_block_log()) - 1)) as u32
    }

    /// Composes a filesystem block number.
    pub fn fsb(&self, agno: u32, agbno: u32) -> u64 {
        (u64::from(agno) << self.ag_block_log()) | u64::from(agbno)
    }

    /// Returns the AG-relative block holding an AG-relative inode.
    pub fn agino_to_agbno(&self, agino: u32) -> u32 {
        agino / self.inodes_per_block
    }

    /// Returns the slot of an AG-relative inode within its block.
    pub fn agino_to_offset(&self, agino: u32) -> u32 {
        agino % self.inodes_per_block
    }
}
