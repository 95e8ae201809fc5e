//! Last-write-wins merge of read markers
//!
//! Markers are keyed by `(conversation, kind)`. An incoming marker
//! replaces the current one only when its `created_at` is strictly
//! greater, so ties keep whichever was seen first. Output keeps
//! first-seen key order.
//!
//! Two devices that publish from the same stale remote snapshot still
//! race: the later publish wins. Read positions only ever move forward,
//! so the next view on either device heals it.

use std::collections::HashMap;

use relaycache_core::{MarkerKey, ReadMarker, Timestamp};

/// Merge `remote` into `local`
pub fn merge(local: &[ReadMarker], remote: &[ReadMarker]) -> Vec<ReadMarker> {
    merge_all([local, remote])
}

/// Fold any number of marker sets, in order
pub fn merge_all<'a, I>(sets: I) -> Vec<ReadMarker>
where
    I: IntoIterator<Item = &'a [ReadMarker]>,
{
    let mut merged: Vec<ReadMarker> = Vec::new();
    let mut index: HashMap<MarkerKey, usize> = HashMap::new();

    for marker in sets.into_iter().flatten() {
        match index.get(&marker.key()) {
            Some(&slot) => {
                if marker.supersedes(&merged[slot]) {
                    merged[slot] = marker.clone();
                }
            }
            None => {
                index.insert(marker.key(), merged.len());
                merged.push(marker.clone());
            }
        }
    }

    merged
}

/// Split markers into those at or after `cutoff` and those before it
pub fn prune(markers: Vec<ReadMarker>, cutoff: Timestamp) -> (Vec<ReadMarker>, Vec<ReadMarker>) {
    markers.into_iter().partition(|m| m.created_at >= cutoff)
}

/// Number of keys whose winning timestamp differs between two sets
pub fn count_changes(before: &[ReadMarker], after: &[ReadMarker]) -> usize {
    let previous: HashMap<MarkerKey, Timestamp> =
        before.iter().map(|m| (m.key(), m.created_at)).collect();

    after
        .iter()
        .filter(|m| previous.get(&m.key()) != Some(&m.created_at))
        .count()
}
