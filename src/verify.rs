// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-checking the on-disk reverse-mapping btrees.
//!
//! After a rebuild (or on a filesystem that claims to be healthy),
//! every collected observation must be covered by a btree record
//! with the same owner and flags.  The check walks the merged
//! observations in record order against a ranged btree lookup and
//! reports what it finds; it never modifies the filesystem and a
//! discrepancy is never an error here — the report is what drives
//! the operator (or a later run) to a rebuild.

use crate::collect::RmapIndex;
use crate::fsops::FsRepair;
use crate::mount::Mount;
use crate::result::Result;
use crate::rmap::{RmapFlags, RmapRecord};
use log::warn;

/// What one AG's check found.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VerifyReport {
    /// Observations with no covering btree record at all.
    pub missing: u64,
    /// Observations whose covering record disagrees.
    pub incorrect: u64,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing == 0 && self.incorrect == 0
    }

    fn absorb(&mut self, other: VerifyReport) {
        self.missing += other.missing;
        self.incorrect += other.incorrect;
    }
}

/// Checks every AG in ascending order, accumulating one report.
pub fn verify(
    idx: &mut RmapIndex,
    mp: &Mount,
    fs: &mut dyn FsRepair,
    dry_run: bool,
) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    for agno in 0..mp.ag_count {
        report.absorb(verify_ag(idx, mp, fs, agno, dry_run)?);
    }
    Ok(report)
}

/// Checks one AG's on-disk btree against the collected
/// observations.
///
/// Discrepancies are reported and counted, never returned as
/// errors; only infrastructure failures (I/O, lookup machinery)
/// abort the walk.
pub fn verify_ag(
    idx: &mut RmapIndex,
    mp: &Mount,
    fs: &mut dyn FsRepair,
    agno: u32,
    dry_run: bool,
) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    if !idx.enabled() || !mp.has_rmapbt() {
        return Ok(report);
    }
    // A btree already known to be bad is not worth comparing
    // against; it is getting rebuilt no matter what we find.
    if idx.suspect() {
        if dry_run && agno == 0 {
            warn!("would rebuild corrupt reverse-mapping btrees");
        }
        return Ok(report);
    }

    idx.sort_cooked(agno);
    let cooked = idx.cooked(agno);
    let mut obs_cur = cooked.cursor_by(RmapRecord::compare);
    let mut bt_cur = fs.rmap_cursor(agno)?;
    while let Some(obs) = obs_cur.pop() {
        if !bt_cur.lookup_le(obs)? {
            warn!("missing reverse-mapping record in AG {}: {}", agno, obs);
            report.missing += 1;
            continue;
        }
        let rec = bt_cur.get_rec()?;
        if !is_good(obs, &rec) {
            warn!(
                "incorrect reverse-mapping in AG {}: saw {}, should be {}",
                agno, rec, obs
            );
            report.incorrect += 1;
        }
    }
    Ok(report)
}

/// Returns true IFF the btree record covers the observation: same
/// owner and flags, physical span containment, and (for file data)
/// logical span containment.
fn is_good(obs: &RmapRecord, rec: &RmapRecord) -> bool {
    if rec.flags != obs.flags || rec.owner != obs.owner {
        return false;
    }
    if rec.start_block > obs.start_block {
        return false;
    }
    if u64::from(rec.start_block) + u64::from(rec.block_count)
        < u64::from(obs.start_block) + u64::from(obs.block_count)
    {
        return false;
    }
    if !obs.owner.is_inode() || obs.flags.contains(RmapFlags::BMBT_BLOCK) {
        return true;
    }
    rec.offset <= obs.offset
        && rec.offset + u64::from(rec.block_count)
            >= obs.offset + u64::from(obs.block_count)
}
