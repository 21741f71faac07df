// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::fmt;

/// Various errors
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Error {
    OutOfMemory,
    AgflRead,
    AgfRead,
    TransAlloc,
    TransCommit,
    RmapInsert,
    RmapFree,
    RmapLookup,
    ExtentFree,
    FreelistFix,
    BadAg,
    BadExtent,
    BadOwner,
    OffsetOverflow,
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutOfMemory => {
                "Insufficient memory while collecting reverse mappings"
            }
            Self::AgflRead => "Failed to read the AG free list",
            Self::AgfRead => "Failed to read the AG free space header",
            Self::TransAlloc => "Failed to allocate a transaction",
            Self::TransCommit => "Failed to commit a transaction",
            Self::RmapInsert => {
                "Failed to insert a record into the reverse-mapping btree"
            }
            Self::RmapFree => {
                "Failed to remove a record from the reverse-mapping btree"
            }
            Self::RmapLookup => {
                "Failed to look up a record in the reverse-mapping btree"
            }
            Self::ExtentFree => "Failed to free an extent",
            Self::FreelistFix => "Failed to fix the AG free list",
            Self::BadAg => "Allocation group number out of range",
            Self::BadExtent => "Extent does not fit in its allocation group",
            Self::BadOwner => "Owner is not valid for this record",
            Self::OffsetOverflow => "Logical offset plus length overflows",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> core::result::Result<(), fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
