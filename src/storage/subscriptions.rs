use super::schema::Database;
use super::types::{DatabaseError, GuildSubscription};
use crate::release::Category;
use crate::transport::{ChannelId, GuildId, RoleId};

/// Attempts at a compare-and-swap before reporting a conflict.
const MAX_UPDATE_ATTEMPTS: usize = 5;

type SubscriptionRow = (i64, String, i64);

impl Database {
    // ========================================================================
    // Subscription Queries
    // ========================================================================

    /// Creates the default row for a guild. Existing rows are left untouched.
    ///
    /// Returns `true` if a row was created.
    pub async fn register_guild(&self, guild: GuildId) -> Result<bool, DatabaseError> {
        let data = GuildSubscription::new(guild).to_json()?;
        let result = sqlx::query(
            "INSERT INTO subscriptions (guild, data) VALUES (?, ?) ON CONFLICT(guild) DO NOTHING",
        )
        .bind(guild.as_i64())
        .bind(&data)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Looks up a guild's subscription. `None` means the guild has no row.
    pub async fn get_subscription(
        &self,
        guild: GuildId,
    ) -> Result<Option<GuildSubscription>, DatabaseError> {
        Ok(self
            .fetch_row(guild)
            .await?
            .map(|(subscription, _)| subscription))
    }

    /// Every readable stored subscription, ordered by guild id.
    ///
    /// Rows whose data cannot be decoded are logged and left out, so one
    /// corrupt guild does not hide the others.
    pub async fn list_subscriptions(&self) -> Result<Vec<GuildSubscription>, DatabaseError> {
        let rows: Vec<SubscriptionRow> =
            sqlx::query_as("SELECT guild, data, revision FROM subscriptions ORDER BY guild")
                .fetch_all(&self.pool)
                .await?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for (guild, data, _) in rows {
            match GuildSubscription::from_json(GuildId::from_i64(guild), &data) {
                Ok((subscription, _)) => subscriptions.push(subscription),
                Err(e) => {
                    tracing::warn!(guild = guild, error = %e, "Skipping unreadable subscription");
                }
            }
        }
        Ok(subscriptions)
    }

    // ========================================================================
    // Subscription Mutations
    // ========================================================================

    /// Sets the announcement channel for one category, or for all when `category` is `None`.
    pub async fn set_channel(
        &self,
        guild: GuildId,
        category: Option<Category>,
        channel: ChannelId,
    ) -> Result<(), DatabaseError> {
        self.update_subscription(guild, |sub| {
            let targets: &[Category] = match &category {
                Some(c) => std::slice::from_ref(c),
                None => &Category::ALL,
            };
            for c in targets {
                sub.category_mut(*c).channel = Some(channel);
            }
        })
        .await?
        .ok_or(DatabaseError::NotRegistered(guild))
    }

    pub async fn set_role(
        &self,
        guild: GuildId,
        category: Category,
        role: RoleId,
    ) -> Result<(), DatabaseError> {
        self.update_subscription(guild, |sub| {
            sub.category_mut(category).role = Some(role);
        })
        .await?
        .ok_or(DatabaseError::NotRegistered(guild))
    }

    /// Flips a category's enabled flag and returns the new state.
    pub async fn toggle_category(
        &self,
        guild: GuildId,
        category: Category,
    ) -> Result<bool, DatabaseError> {
        self.update_subscription(guild, |sub| {
            let entry = sub.category_mut(category);
            entry.enabled = !entry.enabled;
            entry.enabled
        })
        .await?
        .ok_or(DatabaseError::NotRegistered(guild))
    }

    /// Turns a category off. Returns `false` if the guild has no row.
    pub async fn disable_category(
        &self,
        guild: GuildId,
        category: Category,
    ) -> Result<bool, DatabaseError> {
        Ok(self
            .update_subscription(guild, |sub| {
                sub.category_mut(category).enabled = false;
            })
            .await?
            .is_some())
    }

    /// Deletes a guild's row. Returns `true` if a row was deleted.
    pub async fn remove_guild(&self, guild: GuildId) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE guild = ?")
            .bind(guild.as_i64())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Rewrites stored rows whose category set no longer matches [`Category::ALL`].
    ///
    /// Returns the number of rows rewritten. Unreadable rows are skipped.
    pub async fn migrate_subscriptions(&self) -> Result<usize, DatabaseError> {
        let rows: Vec<SubscriptionRow> =
            sqlx::query_as("SELECT guild, data, revision FROM subscriptions")
                .fetch_all(&self.pool)
                .await?;

        let mut rewritten = 0;
        for (guild, data, revision) in rows {
            let guild = GuildId::from_i64(guild);
            let (subscription, changed) = match GuildSubscription::from_json(guild, &data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!(guild = %guild, error = %e, "Leaving unreadable subscription as is");
                    continue;
                }
            };
            if !changed {
                continue;
            }
            if self.compare_and_swap(&subscription, revision).await? {
                rewritten += 1;
            } else {
                // A concurrent writer already stored a current-shape row
                tracing::debug!(guild = %guild, "Subscription changed during migration");
            }
        }

        if rewritten > 0 {
            tracing::info!(rows = rewritten, "Migrated stored subscriptions");
        }
        Ok(rewritten)
    }

    // ========================================================================
    // Read-modify-write
    // ========================================================================

    async fn fetch_row(
        &self,
        guild: GuildId,
    ) -> Result<Option<(GuildSubscription, i64)>, DatabaseError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT data, revision FROM subscriptions WHERE guild = ?")
                .bind(guild.as_i64())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((data, revision)) => {
                let (subscription, _) = GuildSubscription::from_json(guild, &data)?;
                Ok(Some((subscription, revision)))
            }
            None => Ok(None),
        }
    }

    /// Writes `subscription` only if the row is still at `revision`.
    async fn compare_and_swap(
        &self,
        subscription: &GuildSubscription,
        revision: i64,
    ) -> Result<bool, DatabaseError> {
        let data = subscription.to_json()?;
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET data = ?, revision = revision + 1, updated_at = datetime('now')
            WHERE guild = ? AND revision = ?
        "#,
        )
        .bind(&data)
        .bind(subscription.guild.as_i64())
        .bind(revision)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Applies `mutate` to the stored row with optimistic concurrency.
    ///
    /// The row is re-read and `mutate` re-applied whenever another writer got
    /// in between. Returns `None` if the guild has no row.
    async fn update_subscription<T, F>(
        &self,
        guild: GuildId,
        mut mutate: F,
    ) -> Result<Option<T>, DatabaseError>
    where
        F: FnMut(&mut GuildSubscription) -> T,
    {
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let Some((mut subscription, revision)) = self.fetch_row(guild).await? else {
                return Ok(None);
            };

            let output = mutate(&mut subscription);
            if self.compare_and_swap(&subscription, revision).await? {
                return Ok(Some(output));
            }

            tracing::debug!(
                guild = %guild,
                attempt = attempt + 1,
                "Subscription revision moved, retrying update"
            );
        }

        Err(DatabaseError::Conflict(guild))
    }
}
