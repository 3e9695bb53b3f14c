//! The timer-driven poll loop.
//!
//! Each cycle fetches every source, diffs the result against the store of
//! last-known releases, replaces the store and dispatches what is new. The
//! store is owned by the [`Poller`] and never shared.

use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;

use crate::dispatch::{Destination, DispatchReport, Dispatcher};
use crate::feed::ReleaseSource;
use crate::release::{diff, Release, ReleaseKey};
use crate::storage::Database;

/// The last complete set of releases, in source order.
#[derive(Debug, Default)]
pub struct ReleaseStore {
    releases: Vec<Release>,
}

impl ReleaseStore {
    pub fn releases(&self) -> &[Release] {
        &self.releases
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    pub fn len(&self) -> usize {
        self.releases.len()
    }

    fn from_source<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Release> + 'a {
        self.releases
            .iter()
            .filter(move |r| r.source.as_ref() == source)
    }

    fn replace(&mut self, releases: Vec<Release>) {
        self.releases = releases;
    }
}

/// What a single cycle did.
#[derive(Debug)]
pub enum CycleOutcome {
    /// First successful fetch: the store was populated, nothing was sent.
    Warmed { releases: usize },
    Steady {
        new: Vec<ReleaseKey>,
        report: DispatchReport,
    },
    /// Every source failed; the store is unchanged.
    FetchFailed,
}

pub struct Poller {
    sources: Vec<Box<dyn ReleaseSource>>,
    dispatcher: Dispatcher,
    db: Database,
    interval: Duration,
    store: ReleaseStore,
    /// Sources that have completed at least one successful fetch.
    known_sources: HashSet<String>,
}

impl Poller {
    pub fn new(
        sources: Vec<Box<dyn ReleaseSource>>,
        dispatcher: Dispatcher,
        db: Database,
        interval: Duration,
    ) -> Self {
        Self {
            sources,
            dispatcher,
            db,
            interval,
            store: ReleaseStore::default(),
            known_sources: HashSet::new(),
        }
    }

    pub fn store(&self) -> &ReleaseStore {
        &self.store
    }

    /// Runs cycles until `shutdown` turns true or its sender is dropped.
    ///
    /// Shutdown is honored before each cycle and during the sleep between
    /// cycles; a cycle in progress is allowed to finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            sources = self.sources.len(),
            interval_secs = self.interval.as_secs(),
            "Release poller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.poll_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Release poller stopped");
    }

    /// Runs one fetch, diff, replace, dispatch cycle.
    pub async fn poll_once(&mut self) -> CycleOutcome {
        let results = join_all(self.sources.iter().map(|s| s.fetch())).await;

        let warming = self.known_sources.is_empty();
        let mut fetched = Vec::new();
        let mut baseline_sources = HashSet::new();
        let mut succeeded = 0;

        for (source, result) in self.sources.iter().zip(results) {
            let name = source.name();
            match result {
                Ok(releases) => {
                    succeeded += 1;
                    tracing::debug!(source = %name, releases = releases.len(), "Fetched source");
                    if !self.known_sources.contains(name) {
                        baseline_sources.insert(name.to_string());
                    }
                    fetched.extend(releases);
                }
                Err(e) => {
                    tracing::warn!(source = %name, error = %e, "Source fetch failed, keeping previous releases");
                    fetched.extend(self.store.from_source(name).cloned());
                }
            }
        }

        if succeeded == 0 {
            tracing::error!(sources = self.sources.len(), "All sources failed, retrying next cycle");
            return CycleOutcome::FetchFailed;
        }

        if warming {
            tracing::info!(releases = fetched.len(), "Populating release cache");
            let releases = fetched.len();
            self.store.replace(fetched);
            self.known_sources.extend(baseline_sources);
            return CycleOutcome::Warmed { releases };
        }

        let comparison = diff(self.store.releases(), fetched);
        let new: Vec<Release> = comparison
            .new
            .into_iter()
            .filter(|r| {
                // First successful fetch of a source is its baseline
                let baseline = baseline_sources.contains(r.source.as_ref());
                if baseline {
                    tracing::debug!(release = %r.key(), source = %r.source, "Baseline release, not announcing");
                }
                !baseline
            })
            .collect();

        for name in &baseline_sources {
            tracing::info!(source = %name, "Source reachable for the first time, taking baseline");
        }
        self.store.replace(comparison.all);
        self.known_sources.extend(baseline_sources);

        if new.is_empty() {
            tracing::info!("No new releases found");
            return CycleOutcome::Steady {
                new: Vec::new(),
                report: DispatchReport::default(),
            };
        }

        tracing::info!(count = new.len(), "New releases detected");

        let mut destinations: Vec<Destination> = match self.db.list_subscriptions().await {
            Ok(subscriptions) => subscriptions.into_iter().map(Destination::from).collect(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load subscriptions, announcements dropped");
                Vec::new()
            }
        };

        let report = self.dispatcher.dispatch_all(&new, &mut destinations).await;
        tracing::info!(
            delivered = report.delivered(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Dispatch finished"
        );

        CycleOutcome::Steady {
            new: new.iter().map(|r| r.key().clone()).collect(),
            report,
        }
    }
}
