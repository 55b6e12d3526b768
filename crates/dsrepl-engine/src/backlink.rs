//! Deferred backlink maintenance.
//!
//! Forward-link mutations never touch the target object directly; they
//! enqueue a job keyed by (source, target, forward attribute). The queue is
//! collapsed last-wins per key and drained exactly once at commit, inside the
//! same transaction, so backlinks are always consistent with the forward
//! links that produced them.

use std::collections::BTreeMap;

use tracing::debug;

use dsrepl_core::ObjectGuid;

use crate::error::EngineError;
use crate::schema::Schema;
use crate::txn::ReplTxn;

/// One pending backlink fixup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BacklinkJob {
    /// Object owning the forward link.
    pub source: ObjectGuid,
    /// Object whose backlink set changes.
    pub target: ObjectGuid,
    /// The forward-link attribute id; resolved to its reciprocal at drain.
    pub link_id: dsrepl_core::AttributeId,
    /// True adds the backlink, false removes it.
    pub active: bool,
}

impl BacklinkJob {
    pub(crate) fn new(
        source: ObjectGuid,
        target: ObjectGuid,
        link_id: dsrepl_core::AttributeId,
        active: bool,
    ) -> Self {
        BacklinkJob {
            source,
            target,
            link_id,
            active,
        }
    }
}

/// Collapses the queue last-wins per (source, target, link) key. A value
/// toggled several times in one transaction yields a single fixup matching
/// its final state.
pub(crate) fn collapse(jobs: &[BacklinkJob]) -> Vec<BacklinkJob> {
    let mut last: BTreeMap<(ObjectGuid, ObjectGuid, u32), BacklinkJob> = BTreeMap::new();
    for job in jobs {
        last.insert((job.source, job.target, job.link_id.as_u32()), *job);
    }
    last.into_values().collect()
}

/// Drains the transaction's backlink queue into its write set.
///
/// Jobs whose target GUID is the legacy all-zero sentinel are skipped: the
/// target was never resolved and there is nothing to annotate. A missing
/// target on an add is fatal to the transaction; on a remove it is tolerated,
/// the target may have been purged.
pub(crate) fn drain(txn: &mut ReplTxn<'_>, schema: &dyn Schema) -> Result<(), EngineError> {
    let jobs = collapse(&std::mem::take(&mut txn.backlinks));

    for job in jobs {
        if job.target.is_nil() {
            continue;
        }
        let back_attr = schema.link_pair(job.link_id)?;
        let mut target = match txn.get(job.target)? {
            Some(obj) => obj,
            None if job.active => {
                return Err(EngineError::BacklinkTargetNotFound(job.target));
            }
            None => {
                debug!(target = %job.target, "backlink removal target already gone");
                continue;
            }
        };

        let set = target.backlinks.entry(back_attr).or_default();
        let changed = if job.active {
            set.insert(job.source)
        } else {
            set.remove(&job.source)
        };
        if set.is_empty() {
            target.backlinks.remove(&back_attr);
        }
        if changed {
            txn.put(target);
        }
    }

    Ok(())
}
