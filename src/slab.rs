// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Append-only record storage.
//!
//! The repair phases collect tens of millions of small, fixed-size
//! observations before any of them can be processed.  A `Slab` holds
//! such records in a sequence of fixed-capacity chunks, so that an
//! append never moves records that are already stored and never asks
//! the allocator for one enormous contiguous region.  A slab offers
//! no removal and no random access: records go in one at a time, the
//! slab is sorted once, and a `SlabCursor` then yields the records in
//! ascending order.
//!
//! Sorting is chunk-local; the cursor performs the k-way merge across
//! chunks.  The cursor borrows the slab, so the slab cannot be
//! mutated while a traversal is in progress.

use crate::result::{Error, Result};
use core::cmp::Ordering;

/// Number of records in one backing chunk.
const CHUNK_RECS: usize = 4096;

/// Record ordering used for both sorting and cursor traversal.
type Cmp<T> = fn(&T, &T) -> Ordering;

pub struct Slab<T> {
    chunks: Vec<Vec<T>>,
}

impl<T> Slab<T> {
    pub fn new() -> Slab<T> {
        Slab { chunks: Vec::new() }
    }

    /// Appends a record.  The only failure mode is memory
    /// exhaustion.
    pub fn append(&mut self, rec: T) -> Result<()> {
        match self.chunks.last_mut() {
            Some(chunk) if chunk.len() < CHUNK_RECS => chunk.push(rec),
            _ => {
                let mut chunk = Vec::new();
                chunk
                    .try_reserve_exact(CHUNK_RECS)
                    .map_err(|_| Error::OutOfMemory)?;
                self.chunks.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
                chunk.push(rec);
                self.chunks.push(chunk);
            }
        }
        Ok(())
    }

    /// Returns the number of records currently stored.
    pub fn count(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Vec::is_empty)
    }

    /// Orders the slab.  Each chunk is sorted in place; a subsequent
    /// cursor created with the same ordering merges the chunks into a
    /// single ascending stream.
    pub fn sort_by(&mut self, cmp: Cmp<T>) {
        for chunk in &mut self.chunks {
            chunk.sort_unstable_by(cmp);
        }
    }

    /// Returns a cursor over the slab's present contents.  `cmp` must
    /// be the ordering the slab was last sorted with.
    pub fn cursor_by(&self, cmp: Cmp<T>) -> SlabCursor<'_, T> {
        SlabCursor { slab: self, heads: vec![0; self.chunks.len()], cmp }
    }

    /// Empties the slab, retaining the capacity of one chunk for
    /// reuse.
    pub fn drain(&mut self) {
        self.chunks.truncate(1);
        if let Some(chunk) = self.chunks.first_mut() {
            chunk.clear();
        }
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Slab::new()
    }
}

/// Ordered traversal over a sorted slab.
pub struct SlabCursor<'a, T> {
    slab: &'a Slab<T>,
    heads: Vec<usize>,
    cmp: Cmp<T>,
}

impl<'a, T> SlabCursor<'a, T> {
    /// Returns the next record in ascending order, or `None` when
    /// the slab is exhausted.
    pub fn pop(&mut self) -> Option<&'a T> {
        let mut best: Option<(usize, &'a T)> = None;
        for (i, chunk) in self.slab.chunks.iter().enumerate() {
            let Some(rec) = chunk.get(self.heads[i]) else {
                continue;
            };
            match best {
                Some((_, top)) if (self.cmp)(rec, top) != Ordering::Less => {}
                _ => best = Some((i, rec)),
            }
        }
        let (i, rec) = best?;
        self.heads[i] += 1;
        Some(rec)
    }
}

impl<'a, T> Iterator for SlabCursor<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        self.pop()
    }
}
