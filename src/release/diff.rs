use std::collections::HashSet;

use super::{Release, ReleaseKey};

/// Outcome of comparing a fresh fetch against the cached release set.
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    /// Releases in the fetch whose identity is absent from the cache, in fetch order.
    pub new: Vec<Release>,
    /// The complete fetch, which becomes the next cache.
    pub all: Vec<Release>,
}

/// Computes which fetched releases are new relative to `cached`.
///
/// Membership is by [`ReleaseKey`] through a hash index, so this is O(n + m).
/// The order of `new` follows `fetched`; duplicates inside `fetched` are
/// reported once.
pub fn diff(cached: &[Release], fetched: Vec<Release>) -> ComparisonResult {
    let new = {
        let known: HashSet<&ReleaseKey> = cached.iter().map(Release::key).collect();
        let mut seen: HashSet<&ReleaseKey> = HashSet::with_capacity(fetched.len());

        fetched
            .iter()
            .filter(|r| !known.contains(r.key()) && seen.insert(r.key()))
            .cloned()
            .collect()
    };

    ComparisonResult { new, all: fetched }
}
