//! Fan-out of new releases to subscribed destinations.
//!
//! Every (release, destination) pair gets at most one delivery attempt per
//! cycle. Failures never stop the batch; permanent ones repair the stored
//! subscription so the same dead destination is not retried forever.

use std::sync::Arc;
use std::time::Duration;

use crate::announce::Announcement;
use crate::release::{Release, ReleaseKey};
use crate::storage::{Database, GuildSubscription};
use crate::transport::{ChannelId, DeliveryError, GuildId, Transport};

/// A guild and its subscription as read at the start of a cycle.
///
/// `subscription` is `None` when the guild has no stored row.
#[derive(Debug, Clone)]
pub struct Destination {
    pub guild: GuildId,
    pub subscription: Option<GuildSubscription>,
}

impl From<GuildSubscription> for Destination {
    fn from(subscription: GuildSubscription) -> Self {
        Self {
            guild: subscription.guild,
            subscription: Some(subscription),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoSubscription,
    CategoryDisabled,
    NoChannel,
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered,
    Skipped(SkipReason),
    /// Delivery failed permanently for the channel; the category is now off.
    CategoryDisabled(DeliveryError),
    /// The guild is gone; its subscription row was deleted.
    DestinationRemoved(DeliveryError),
    /// Transient failure, or a permanent one whose repair could not be stored.
    Failed(DeliveryError),
}

#[derive(Debug)]
pub struct DeliveryRecord {
    pub release: ReleaseKey,
    pub guild: GuildId,
    pub outcome: DeliveryOutcome,
}

/// Per-pair results of a dispatch run.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub records: Vec<DeliveryRecord>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Delivered))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Skipped(_)))
    }

    /// Attempts that did not deliver, whatever happened afterwards.
    pub fn failed(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                DeliveryOutcome::Failed(_)
                    | DeliveryOutcome::CategoryDisabled(_)
                    | DeliveryOutcome::DestinationRemoved(_)
            )
        })
    }

    fn count(&self, pred: impl Fn(&DeliveryOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.outcome)).count()
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    db: Database,
    client: reqwest::Client,
    send_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        db: Database,
        client: reqwest::Client,
        send_delay: Duration,
    ) -> Self {
        Self {
            transport,
            db,
            client,
            send_delay,
        }
    }

    /// Announces each release, in order, to every eligible destination.
    ///
    /// `destinations` is updated in place when a failure disables a category
    /// or removes a guild, so later releases in the same run see the repair.
    pub async fn dispatch_all(
        &self,
        releases: &[Release],
        destinations: &mut [Destination],
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut paced = false;
        for release in releases {
            self.dispatch_release(release, destinations, &mut report, &mut paced)
                .await;
        }
        report
    }

    /// Announces one release to every eligible destination.
    pub async fn dispatch(
        &self,
        release: &Release,
        destinations: &mut [Destination],
    ) -> DispatchReport {
        self.dispatch_all(std::slice::from_ref(release), destinations)
            .await
    }

    async fn dispatch_release(
        &self,
        release: &Release,
        destinations: &mut [Destination],
        report: &mut DispatchReport,
        paced: &mut bool,
    ) {
        tracing::info!(
            release = %release.key(),
            category = %release.category,
            version = %release.version,
            "Announcing release"
        );

        for destination in destinations.iter_mut() {
            let target = match eligibility(release, destination) {
                Ok(target) => target,
                Err(reason) => {
                    tracing::debug!(
                        release = %release.key(),
                        guild = %destination.guild,
                        reason = ?reason,
                        "Skipping destination"
                    );
                    report.records.push(DeliveryRecord {
                        release: release.key().clone(),
                        guild: destination.guild,
                        outcome: DeliveryOutcome::Skipped(reason),
                    });
                    continue;
                }
            };

            if *paced {
                tokio::time::sleep(self.send_delay).await;
            }
            *paced = true;

            let icon = release.icon(&self.client).await;
            let announcement = Announcement::render(release, target.role, icon);
            let outcome = match self
                .transport
                .send(destination.guild, target.channel, &announcement)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        release = %release.key(),
                        guild = %destination.guild,
                        channel = %target.channel,
                        "Release announced"
                    );
                    DeliveryOutcome::Delivered
                }
                Err(e) => self.handle_failure(release, destination, target.channel, e).await,
            };

            report.records.push(DeliveryRecord {
                release: release.key().clone(),
                guild: destination.guild,
                outcome,
            });
        }
    }

    async fn handle_failure(
        &self,
        release: &Release,
        destination: &mut Destination,
        channel: ChannelId,
        error: DeliveryError,
    ) -> DeliveryOutcome {
        let guild = destination.guild;

        if !error.is_permanent() {
            tracing::warn!(
                release = %release.key(),
                guild = %guild,
                channel = %channel,
                error = %error,
                "Delivery failed"
            );
            return DeliveryOutcome::Failed(error);
        }

        if matches!(error, DeliveryError::GuildNotFound) {
            tracing::warn!(
                release = %release.key(),
                guild = %guild,
                error = %error,
                "Guild unreachable, removing its subscription"
            );
            return match self.db.remove_guild(guild).await {
                Ok(_) => {
                    destination.subscription = None;
                    DeliveryOutcome::DestinationRemoved(error)
                }
                Err(db_err) => {
                    tracing::error!(guild = %guild, error = %db_err, "Failed to remove subscription");
                    DeliveryOutcome::Failed(error)
                }
            };
        }

        // Forbidden or ChannelNotFound: the guild stays, this category stops
        tracing::warn!(
            release = %release.key(),
            guild = %guild,
            channel = %channel,
            category = %release.category,
            error = %error,
            "Channel unusable, disabling category"
        );
        match self.db.disable_category(guild, release.category).await {
            Ok(_) => {
                if let Some(sub) = destination.subscription.as_mut() {
                    sub.category_mut(release.category).enabled = false;
                }
                DeliveryOutcome::CategoryDisabled(error)
            }
            Err(db_err) => {
                tracing::error!(
                    guild = %guild,
                    category = %release.category,
                    error = %db_err,
                    "Failed to disable category"
                );
                DeliveryOutcome::Failed(error)
            }
        }
    }
}

struct Target {
    channel: ChannelId,
    role: Option<crate::transport::RoleId>,
}

fn eligibility(release: &Release, destination: &Destination) -> Result<Target, SkipReason> {
    let subscription = destination
        .subscription
        .as_ref()
        .ok_or(SkipReason::NoSubscription)?;
    let entry = subscription.category(release.category);
    if !entry.enabled {
        return Err(SkipReason::CategoryDisabled);
    }
    let channel = entry.channel.ok_or(SkipReason::NoChannel)?;
    Ok(Target {
        channel,
        role: entry.role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::tests::release;
    use crate::release::Category;
    use crate::transport::mock::{Failure, MockTransport};
    use crate::transport::RoleId;
    use pretty_assertions::assert_eq;

    const D1: GuildId = GuildId::new(1);
    const D2: GuildId = GuildId::new(2);

    async fn setup(transport: MockTransport) -> (Arc<MockTransport>, Database, Dispatcher) {
        let db = Database::open(":memory:").await.unwrap();
        for (guild, channel) in [(D1, 11), (D2, 22)] {
            db.register_guild(guild).await.unwrap();
            db.set_channel(guild, None, ChannelId::new(channel)).await.unwrap();
        }
        let transport = Arc::new(transport);
        let dispatcher = Dispatcher::new(
            transport.clone(),
            db.clone(),
            reqwest::Client::new(),
            Duration::ZERO,
        );
        (transport, db, dispatcher)
    }

    async fn destinations(db: &Database) -> Vec<Destination> {
        db.list_subscriptions()
            .await
            .unwrap()
            .into_iter()
            .map(Destination::from)
            .collect()
    }

    #[tokio::test]
    async fn test_delivers_to_every_subscribed_destination() {
        let (transport, db, dispatcher) = setup(MockTransport::new()).await;
        db.set_role(D2, Category::Ios, RoleId::new(99)).await.unwrap();
        let mut dests = destinations(&db).await;

        let report = dispatcher.dispatch(&release("iOS 17.4 (21E219)"), &mut dests).await;

        assert_eq!(report.delivered(), 2);
        let sent = transport.attempts();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].channel, ChannelId::new(11));
        assert_eq!(sent[0].announcement.mention, None);
        assert_eq!(sent[1].announcement.mention.as_deref(), Some("<@&99>"));
    }

    #[tokio::test]
    async fn test_failure_isolation_disables_only_failing_destination() {
        let (transport, db, dispatcher) =
            setup(MockTransport::new().fail(D1, Failure::Forbidden)).await;
        let mut dests = destinations(&db).await;

        let report = dispatcher.dispatch(&release("iOS 17.4 (21E219)"), &mut dests).await;

        // D2 attempted despite D1 failing first
        let attempted: Vec<GuildId> = transport.attempts().iter().map(|s| s.guild).collect();
        assert_eq!(attempted, vec![D1, D2]);
        assert_eq!(report.delivered(), 1);
        assert!(matches!(
            report.records[0].outcome,
            DeliveryOutcome::CategoryDisabled(DeliveryError::Forbidden)
        ));

        let d1 = db.get_subscription(D1).await.unwrap().unwrap();
        let d2 = db.get_subscription(D2).await.unwrap().unwrap();
        assert!(!d1.category(Category::Ios).enabled);
        assert!(d1.category(Category::MacOs).enabled);
        assert!(d2.category(Category::Ios).enabled);
    }

    #[tokio::test]
    async fn test_missing_channel_disables_category() {
        let (_transport, db, dispatcher) =
            setup(MockTransport::new().fail(D2, Failure::ChannelNotFound)).await;
        let mut dests = destinations(&db).await;

        dispatcher.dispatch(&release("tvOS 17.4 (21L227)"), &mut dests).await;

        let d2 = db.get_subscription(D2).await.unwrap().unwrap();
        assert!(!d2.category(Category::TvOs).enabled);
    }

    #[tokio::test]
    async fn test_unreachable_guild_is_removed() {
        let (transport, db, dispatcher) =
            setup(MockTransport::new().fail(D1, Failure::GuildNotFound)).await;
        let mut dests = destinations(&db).await;

        let releases = [release("iOS 17.4 (21E219)"), release("macOS 14.4 (23E214)")];
        let report = dispatcher.dispatch_all(&releases, &mut dests).await;

        assert_eq!(db.get_subscription(D1).await.unwrap(), None);
        assert!(db.get_subscription(D2).await.unwrap().is_some());
        assert!(matches!(
            report.records[0].outcome,
            DeliveryOutcome::DestinationRemoved(_)
        ));
        // The second release skips the removed guild instead of retrying it
        assert!(matches!(
            report.records[2].outcome,
            DeliveryOutcome::Skipped(SkipReason::NoSubscription)
        ));
        assert_eq!(transport.attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_disabled_category_seen_by_later_release_in_same_run() {
        let (transport, db, dispatcher) =
            setup(MockTransport::new().fail(D1, Failure::Forbidden)).await;
        let mut dests = destinations(&db).await;

        let releases = [release("iOS 17.4 (21E219)"), release("iOS 17.4.1 (21E236)")];
        dispatcher.dispatch_all(&releases, &mut dests).await;

        let d1_attempts = transport.attempts().iter().filter(|s| s.guild == D1).count();
        assert_eq!(d1_attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_changes_nothing() {
        let (_transport, db, dispatcher) =
            setup(MockTransport::new().fail(D1, Failure::ServerError)).await;
        let mut dests = destinations(&db).await;

        let report = dispatcher.dispatch(&release("iOS 17.4 (21E219)"), &mut dests).await;

        assert_eq!(report.failed(), 1);
        assert!(matches!(report.records[0].outcome, DeliveryOutcome::Failed(_)));
        let d1 = db.get_subscription(D1).await.unwrap().unwrap();
        assert!(d1.category(Category::Ios).enabled);
    }

    #[tokio::test]
    async fn test_rate_limited_destination_keeps_subscription() {
        let (_transport, db, dispatcher) =
            setup(MockTransport::new().fail(D2, Failure::RateLimited)).await;
        let mut dests = destinations(&db).await;

        let report = dispatcher.dispatch(&release("iOS 17.4 (21E219)"), &mut dests).await;

        assert_eq!(report.delivered(), 1);
        assert!(matches!(
            report.records[1].outcome,
            DeliveryOutcome::Failed(DeliveryError::RateLimited { .. })
        ));
        let d2 = db.get_subscription(D2).await.unwrap().unwrap();
        assert!(d2.category(Category::Ios).enabled);
        assert!(dests[1].subscription.is_some());
    }

    #[tokio::test]
    async fn test_skip_reasons() {
        let (transport, db, dispatcher) = setup(MockTransport::new()).await;
        db.toggle_category(D1, Category::MacOs).await.unwrap();
        db.register_guild(GuildId::new(3)).await.unwrap(); // no channel
        let mut dests = destinations(&db).await;
        dests.push(Destination {
            guild: GuildId::new(4),
            subscription: None,
        });

        let report = dispatcher.dispatch(&release("macOS 14.4 (23E214)"), &mut dests).await;

        let reasons: Vec<_> = report
            .records
            .iter()
            .map(|r| match &r.outcome {
                DeliveryOutcome::Skipped(reason) => Some(*reason),
                _ => None,
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                Some(SkipReason::CategoryDisabled),
                None,
                Some(SkipReason::NoChannel),
                Some(SkipReason::NoSubscription),
            ]
        );
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_send_delay_between_deliveries() {
        let db = Database::open(":memory:").await.unwrap();
        for guild in [D1, D2] {
            db.register_guild(guild).await.unwrap();
            db.set_channel(guild, None, ChannelId::new(5)).await.unwrap();
        }
        let dispatcher = Dispatcher::new(
            Arc::new(MockTransport::new()),
            db.clone(),
            reqwest::Client::new(),
            Duration::from_millis(500),
        );
        let mut dests = destinations(&db).await;

        // Paused only after the database is up, so pool timeouts never auto-advance
        tokio::time::pause();
        let start = tokio::time::Instant::now();
        dispatcher.dispatch(&release("iOS 17.4 (21E219)"), &mut dests).await;

        // One pause between two sends, none before the first; the paused
        // timer may round the sleep up by a tick
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(1000),
            "elapsed {:?}",
            elapsed
        );
    }
}
