//! Cluster topology snapshots.
//!
//! A [`Snapshot`] is an immutable view of the slot → pool mapping at one
//! version. Requests capture an `Arc<Snapshot>` once and route against it
//! for their whole lifetime; the monitor publishes replacement snapshots
//! but never mutates a published one, so "is my view stale" reduces to a
//! version compare.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use shoal_pool::{NodeAddr, Pool, PoolOptions};
use shoal_protocol::Frame;

use crate::slot::SLOT_COUNT;

/// Sentinel pool index for slots no node claimed.
const UNASSIGNED: u16 = u16::MAX;

/// One entry of a parsed `CLUSTER SLOTS` reply: a contiguous slot range
/// and the primary serving it. Replica addresses are dropped — reads are
/// not routed to replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub primary: NodeAddr,
}

/// Immutable slot → pool mapping at one version.
pub struct Snapshot {
    version: u64,
    /// Index into `pools` per slot, `UNASSIGNED` when no node claims it.
    /// Boxed to keep the 32 KB array off the stack.
    slots: Box<[u16; SLOT_COUNT as usize]>,
    pools: Vec<Arc<Pool>>,
}

impl Snapshot {
    /// The monotonically increasing version of this view.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The pool serving a slot, or `None` when the slot is unassigned in
    /// this view. Callers treat `None` as a stale-map signal.
    pub fn pool_for_slot(&self, slot: u16) -> Option<&Arc<Pool>> {
        self.pools.get(self.pool_index(slot)?)
    }

    /// Index of the pool serving a slot, stable within this snapshot.
    pub(crate) fn pool_index(&self, slot: u16) -> Option<usize> {
        match *self.slots.get(slot as usize)? {
            UNASSIGNED => None,
            idx => Some(idx as usize),
        }
    }

    /// All pools of this view, in discovery order.
    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .field(
                "pools",
                &self.pools.iter().map(|p| p.addr().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Errors parsing a `CLUSTER SLOTS` reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum TopologyError {
    #[error("CLUSTER SLOTS reply was not an array")]
    NotAnArray,
    #[error("CLUSTER SLOTS reply contained no usable slot ranges")]
    Empty,
}

/// Parses a `CLUSTER SLOTS` reply into slot ranges.
///
/// Entry shape: `[slot_lo, slot_hi, [host, port, ...], replicas...]`.
/// Malformed entries are skipped rather than failing the whole reply —
/// a node mid-reconfiguration can emit partial entries, and a partial map
/// still routes most traffic.
pub(crate) fn parse_cluster_slots(frame: &Frame) -> Result<Vec<SlotRange>, TopologyError> {
    let Frame::Array(entries) = frame else {
        return Err(TopologyError::NotAnArray);
    };

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(range) = parse_entry(entry) {
            ranges.push(range);
        }
    }

    if ranges.is_empty() {
        return Err(TopologyError::Empty);
    }
    Ok(ranges)
}

fn parse_entry(entry: &Frame) -> Option<SlotRange> {
    let Frame::Array(items) = entry else {
        return None;
    };
    let (Some(Frame::Integer(start)), Some(Frame::Integer(end))) = (items.first(), items.get(1))
    else {
        return None;
    };
    let (start, end) = (u16::try_from(*start).ok()?, u16::try_from(*end).ok()?);
    if start > end || end >= SLOT_COUNT {
        return None;
    }

    // third element is the primary; replicas follow and are ignored
    let Frame::Array(node) = items.get(2)? else {
        return None;
    };
    let host = match node.first()? {
        Frame::Bulk(host) if !host.is_empty() => {
            std::str::from_utf8(host).ok()?.to_owned()
        }
        _ => return None,
    };
    let Frame::Integer(port) = node.get(1)? else {
        return None;
    };
    let port = u16::try_from(*port).ok()?;

    Some(SlotRange {
        start,
        end,
        primary: NodeAddr::new(host, port),
    })
}

/// Builds the next snapshot from parsed ranges, reusing pools for
/// addresses that are still present.
///
/// Returns the snapshot, the new address → pool map, and the pools whose
/// address disappeared. Evicted pools must be recycled only after the
/// snapshot is published, so in-flight requests on the old view drain
/// first.
pub(crate) fn reconcile(
    version: u64,
    ranges: &[SlotRange],
    live: &HashMap<NodeAddr, Arc<Pool>>,
    options: &PoolOptions,
) -> (Arc<Snapshot>, HashMap<NodeAddr, Arc<Pool>>, Vec<Arc<Pool>>) {
    let mut slots = Box::new([UNASSIGNED; SLOT_COUNT as usize]);
    let mut pools: Vec<Arc<Pool>> = Vec::new();
    let mut index: HashMap<NodeAddr, u16> = HashMap::new();

    for range in ranges {
        let idx = match index.get(&range.primary) {
            Some(&idx) => idx,
            None => {
                let pool = live
                    .get(&range.primary)
                    .cloned()
                    .unwrap_or_else(|| Pool::new(range.primary.clone(), options.clone()));
                let idx = pools.len() as u16;
                pools.push(pool);
                index.insert(range.primary.clone(), idx);
                idx
            }
        };
        for slot in range.start..=range.end {
            slots[slot as usize] = idx;
        }
    }

    let next_live: HashMap<NodeAddr, Arc<Pool>> = pools
        .iter()
        .map(|pool| (pool.addr().clone(), Arc::clone(pool)))
        .collect();

    let evicted: Vec<Arc<Pool>> = live
        .iter()
        .filter(|(addr, _)| !next_live.contains_key(*addr))
        .map(|(_, pool)| Arc::clone(pool))
        .collect();

    let snapshot = Arc::new(Snapshot {
        version,
        slots,
        pools,
    });

    (snapshot, next_live, evicted)
}
