// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reverse-mapping records and their algebra.
//!
//! A reverse mapping answers "who owns this physical block range?"
//! Each record covers a contiguous run of blocks within one
//! allocation group and names an owner: either an inode (with the
//! logical offset of the run within that inode's fork) or one of a
//! small set of metadata owners that stand for filesystem structures
//! which are not files at all.
//!
//! Everything downstream of collection depends on three operations
//! defined here: the total order used to sort observations, the
//! merge predicate that decides when two adjacent observations are
//! really one, and the key derivations handed to the btree layer.

use bitflags::bitflags;
use bitstruct::bitstruct;
use core::cmp::Ordering;
use core::fmt;
use static_assertions::const_assert;

bitflags! {
    /// Per-record flags.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct RmapFlags: u32 {
        /// The mapping is in the owner's attribute fork.
        const ATTR_FORK = 1 << 0;
        /// The block holds part of the owner's block-mapping btree,
        /// not file data.
        const BMBT_BLOCK = 1 << 1;
        /// The extent is allocated but unwritten.
        const UNWRITTEN = 1 << 2;
    }
}

impl RmapFlags {
    /// Flags that participate in btree key comparison.  UNWRITTEN is
    /// a record-only attribute and never part of a key.
    pub const KEY: RmapFlags =
        RmapFlags::ATTR_FORK.union(RmapFlags::BMBT_BLOCK);
}

/// Maximum length of a single record, in blocks.
pub const LEN_MAX: u32 = (1 << 21) - 1;

// Raw owner encodings.  These follow the on-disk owner space, where
// metadata owners are small negative numbers; -6 belongs to the inode
// btree owner, which this engine never emits.
const OWN_NULL: u64 = -1i64 as u64;
const OWN_UNKNOWN: u64 = -2i64 as u64;
const OWN_FS: u64 = -3i64 as u64;
const OWN_LOG: u64 = -4i64 as u64;
const OWN_AG: u64 = -5i64 as u64;
const OWN_INODES: u64 = -7i64 as u64;
const OWN_REFC: u64 = -8i64 as u64;
const OWN_COW: u64 = -9i64 as u64;

/// The owner of a mapped block range.
///
/// Inode owners carry the inode number; the remaining variants are
/// the closed set of metadata owners.  In the raw 64-bit encoding
/// every metadata owner sorts above every possible inode number.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RmapOwner {
    Inode(u64),
    /// Fixed filesystem metadata: superblock and AG headers.
    Fs,
    /// The internal journal.
    Log,
    /// Per-AG structures: free space btrees and the AG free list.
    Ag,
    /// Inode chunks.
    Inodes,
    /// The reference-count btree.
    Refc,
    /// Copy-on-write staging extents.
    Cow,
    /// No owner; never appears in a stored record.
    Null,
    /// Owner not yet known; marks an empty scratch record.
    Unknown,
}

impl RmapOwner {
    /// Returns the raw 64-bit encoding.
    pub fn raw(self) -> u64 {
        match self {
            Self::Inode(ino) => ino,
            Self::Fs => OWN_FS,
            Self::Log => OWN_LOG,
            Self::Ag => OWN_AG,
            Self::Inodes => OWN_INODES,
            Self::Refc => OWN_REFC,
            Self::Cow => OWN_COW,
            Self::Null => OWN_NULL,
            Self::Unknown => OWN_UNKNOWN,
        }
    }

    /// Reconstructs an owner from its raw encoding.
    pub fn from_raw(raw: u64) -> RmapOwner {
        match raw {
            OWN_FS => Self::Fs,
            OWN_LOG => Self::Log,
            OWN_AG => Self::Ag,
            OWN_INODES => Self::Inodes,
            OWN_REFC => Self::Refc,
            OWN_COW => Self::Cow,
            OWN_NULL => Self::Null,
            OWN_UNKNOWN => Self::Unknown,
            ino => Self::Inode(ino),
        }
    }

    /// Returns true IFF this owner is an inode.
    pub fn is_inode(self) -> bool {
        matches!(self, Self::Inode(_))
    }
}

impl fmt::Display for RmapOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inode(ino) => write!(f, "inode {}", ino),
            Self::Fs => write!(f, "fs"),
            Self::Log => write!(f, "log"),
            Self::Ag => write!(f, "ag"),
            Self::Inodes => write!(f, "inodes"),
            Self::Refc => write!(f, "refcount"),
            Self::Cow => write!(f, "cow"),
            Self::Null => write!(f, "null"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

bitstruct! {
    /// The packed 64-bit key word: the logical offset in the low
    /// bits, the key-participating flags in the two high bits.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PackedKey(pub u64) {
        /// Logical offset within the owner.
        pub offset: u64 = 0..62;
        /// The block belongs to the owner's block-mapping btree.
        pub bmbt: bool = 62;
        /// The mapping is in the attribute fork.
        pub attr: bool = 63;
    }
}

/// Mask of offset bits representable in the packed key word.
const OFFSET_MASK: u64 = (1 << 62) - 1;

const_assert!(LEN_MAX as u64 <= OFFSET_MASK);

/// The owner triple handed to the btree insertion interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OwnerInfo {
    pub owner: u64,
    pub offset: u64,
    pub flags: RmapFlags,
}

/// A single reverse-mapping observation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RmapRecord {
    /// Physical start, AG-relative.
    pub start_block: u32,
    /// Length in blocks.
    pub block_count: u32,
    pub owner: RmapOwner,
    /// Logical offset within the owner; meaningless for metadata
    /// owners and for btree-block records.
    pub offset: u64,
    pub flags: RmapFlags,
}

impl RmapRecord {
    /// Returns the empty scratch record.
    pub fn unknown() -> RmapRecord {
        RmapRecord {
            start_block: 0,
            block_count: 0,
            owner: RmapOwner::Unknown,
            offset: 0,
            flags: RmapFlags::empty(),
        }
    }

    /// Packs the offset and the key flags into a single word for
    /// comparison.
    pub fn offset_pack(&self) -> u64 {
        PackedKey(0)
            .with_offset(self.offset & OFFSET_MASK)
            .with_bmbt(self.flags.contains(RmapFlags::BMBT_BLOCK))
            .with_attr(self.flags.contains(RmapFlags::ATTR_FORK))
            .0
    }

    /// Total order on records: (start block, owner, packed offset).
    pub fn compare(a: &RmapRecord, b: &RmapRecord) -> Ordering {
        a.start_block
            .cmp(&b.start_block)
            .then(a.owner.raw().cmp(&b.owner.raw()))
            .then(a.offset_pack().cmp(&b.offset_pack()))
    }

    /// Returns true IFF `next` continues this record: same owner,
    /// physically adjacent, combined length within bounds, and (for
    /// inode owners) identical flags with logically adjacent
    /// offsets.  Metadata owners carry no meaningful offset or
    /// flags, so those comparisons are suppressed for them, as the
    /// filesystem itself does.
    pub fn mergeable(&self, next: &RmapRecord) -> bool {
        if self.owner != next.owner {
            return false;
        }
        if u64::from(self.start_block) + u64::from(self.block_count)
            != u64::from(next.start_block)
        {
            return false;
        }
        if u64::from(self.block_count) + u64::from(next.block_count)
            > u64::from(LEN_MAX)
        {
            return false;
        }
        if !next.owner.is_inode() {
            return true;
        }
        if self.flags != next.flags {
            return false;
        }
        if self.flags.contains(RmapFlags::BMBT_BLOCK) {
            return true;
        }
        self.offset + u64::from(self.block_count) == next.offset
    }

    /// Absorbs `next` into this record.  Callers must have checked
    /// `mergeable` first.
    pub fn merge(&mut self, next: &RmapRecord) {
        self.block_count += next.block_count;
    }

    /// Derives the high key: the key of the last block this record
    /// covers.
    pub fn high_key(&self) -> RmapRecord {
        let span = self.block_count - 1;
        let mut key = *self;
        key.start_block += span;
        key.flags &= RmapFlags::KEY;
        if self.owner.is_inode() && !self.flags.contains(RmapFlags::BMBT_BLOCK)
        {
            key.offset += u64::from(span);
        }
        key
    }

    /// Signed key difference for btree navigation: (start block,
    /// owner, offset), with every record flag masked off both keys
    /// before packing.  Out-of-range differences saturate.
    pub fn diff_keys(k1: &RmapRecord, k2: &RmapRecord) -> i64 {
        let d = i64::from(k1.start_block) - i64::from(k2.start_block);
        if d != 0 {
            return d;
        }
        let d = saturating_diff(k1.owner.raw(), k2.owner.raw());
        if d != 0 {
            return d;
        }
        saturating_diff(k1.offset & OFFSET_MASK, k2.offset & OFFSET_MASK)
    }

    /// Returns the owner triple for the btree insertion interface.
    /// Metadata owners carry neither offset nor flags.
    pub fn owner_info(&self) -> OwnerInfo {
        if self.owner.is_inode() {
            OwnerInfo {
                owner: self.owner.raw(),
                offset: self.offset,
                flags: self.flags & RmapFlags::KEY,
            }
        } else {
            OwnerInfo {
                owner: self.owner.raw(),
                offset: 0,
                flags: RmapFlags::empty(),
            }
        }
    }
}

impl fmt::Display for RmapRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block {} len {} owner {}",
            self.start_block, self.block_count, self.owner
        )?;
        if self.owner.is_inode() && !self.flags.contains(RmapFlags::BMBT_BLOCK)
        {
            write!(f, " offset {}", self.offset)?;
        }
        if self.flags.contains(RmapFlags::ATTR_FORK) {
            write!(f, " attr")?;
        }
        if self.flags.contains(RmapFlags::BMBT_BLOCK) {
            write!(f, " bmbt")?;
        }
        if self.flags.contains(RmapFlags::UNWRITTEN) {
            write!(f, " unwritten")?;
        }
        Ok(())
    }
}

/// `a - b` with the sign of the unsigned comparison, saturating at
/// the i64 range.
fn saturating_diff(a: u64, b: u64) -> i64 {
    if a >= b {
        i64::try_from(a - b).unwrap_or(i64::MAX)
    } else {
        i64::try_from(b - a).map_or(i64::MIN, |d| -d)
    }
}
