use {
    crate::{
        salt::{SaltSource, fallback_salt},
        selection::{Candidate, select_winner},
    },
    anyhow::{Context, Result},
    chrono::{DateTime, Utc},
    commit_reveal::{Commitment, Secret},
    database::{entries::EntryTier, is_duplicate_record_error as is_duplicate},
    model::{
        ItemId, UserId,
        round::{JoinOutcome, Reveal, RoundId, RoundResult, RoundStats, RoundStatus, Tier},
    },
    sqlx::PgPool,
    std::{sync::Arc, time::Duration},
    thiserror::Error,
};

#[derive(prometheus_metric_storage::MetricStorage, Clone, Debug)]
#[metric(subsystem = "rounds")]
struct Metrics {
    /// Number of rounds created.
    rounds_created: prometheus::IntCounter,
    /// Number of entries admitted across all rounds.
    entries_admitted: prometheus::IntCounter,
    /// Number of rounds closed (one reveal each).
    rounds_closed: prometheus::IntCounter,
    /// Closes that had to fall back to the deterministic salt.
    salt_fallbacks: prometheus::IntCounter,
    /// Revealed secrets that failed verification against their commitment.
    /// Any increment here is an audit alarm.
    commitment_mismatches: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("already participating in this round")]
    AlreadyJoined,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("round not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ResultError {
    #[error("round not found")]
    NotFound,
    #[error("did not participate in this round")]
    DidNotParticipate,
    #[error("round is not yet revealed")]
    NotYetRevealed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("round not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct RoundManager {
    pool: PgPool,
    salt_source: Arc<dyn SaltSource>,
    /// How long a freshly created round accepts joins.
    round_window: Duration,
    /// Upper bound on the salt source call; the fallback salt kicks in past
    /// it so closing never blocks on the beacon.
    salt_timeout: Duration,
}

impl RoundManager {
    pub fn new(
        pool: PgPool,
        salt_source: Arc<dyn SaltSource>,
        round_window: Duration,
        salt_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            salt_source,
            round_window,
            salt_timeout,
        }
    }

    /// Admits a user to the item's open round, creating the round if the
    /// item has none. A second join of the same round by the same user is a
    /// conflict, never a merge.
    pub async fn join_or_create(
        &self,
        item_id: &ItemId,
        user_id: &UserId,
        tier: Tier,
    ) -> Result<JoinOutcome, JoinError> {
        let mut ex = self.pool.acquire().await?;
        let now = Utc::now();

        let round = match database::rounds::open_for_item(&mut ex, item_id.as_str(), now).await? {
            Some(round) => round,
            None => match self.create_round(&mut ex, item_id, now).await {
                Ok(round) => round,
                Err(err) if is_duplicate(&err) => {
                    // Lost the creation race, or an overdue round still
                    // holds the item's open slot until a closer gets to it.
                    match database::rounds::open_for_item(&mut ex, item_id.as_str(), now).await? {
                        Some(round) => round,
                        None => {
                            let overdue =
                                database::rounds::open_for_item_any(&mut ex, item_id.as_str())
                                    .await?
                                    .ok_or(sqlx::Error::RowNotFound)?;
                            drop(ex);
                            // Close the overdue round here instead of
                            // failing joins until the close loop fires.
                            if let Err(err) = self.close(RoundId(overdue.id)).await {
                                tracing::warn!(
                                    round = overdue.id,
                                    ?err,
                                    "closing overdue round on join failed"
                                );
                            }
                            ex = self.pool.acquire().await?;
                            match self.create_round(&mut ex, item_id, now).await {
                                Ok(round) => round,
                                Err(err) if is_duplicate(&err) => {
                                    database::rounds::open_for_item(
                                        &mut ex,
                                        item_id.as_str(),
                                        now,
                                    )
                                    .await?
                                    .ok_or(sqlx::Error::RowNotFound)?
                                }
                                Err(err) => return Err(err.into()),
                            }
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            },
        };

        let entry = database::entries::Entry {
            round_id: round.id,
            user_id: user_id.as_str().to_string(),
            tier: tier_to_db(tier),
            weight: tier.weight(),
            created_at: now,
        };
        database::entries::insert(&mut ex, &entry)
            .await
            .map_err(|err| {
                if is_duplicate(&err) {
                    JoinError::AlreadyJoined
                } else {
                    JoinError::Database(err)
                }
            })?;
        Metrics::get().entries_admitted.inc();

        Ok(JoinOutcome {
            round_id: RoundId(round.id),
            closes_at: round.closes_at,
            commitment: round.commitment,
        })
    }

    async fn create_round(
        &self,
        ex: &mut sqlx::PgConnection,
        item_id: &ItemId,
        now: DateTime<Utc>,
    ) -> Result<database::rounds::Round, sqlx::Error> {
        let secret = Secret::generate();
        let commitment = commit_reveal::commit(&secret);
        let closes_at = now
            + chrono::Duration::from_std(self.round_window)
                .expect("round window fits a chrono duration");
        let id = database::rounds::insert(
            ex,
            item_id.as_str(),
            now,
            closes_at,
            commitment.as_str(),
            secret.as_str(),
        )
        .await?;
        Metrics::get().rounds_created.inc();
        tracing::info!(round = id, item = %item_id, "created round");
        database::rounds::fetch(ex, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Closes a round: obtains the public salt, derives the combined
    /// randomness, runs the weighted selection and persists the reveal.
    ///
    /// Idempotent. Returns whether this call performed the reveal; a
    /// concurrent closer or an earlier lazy close makes it `false`.
    pub async fn close(&self, round_id: RoundId) -> Result<bool, CloseError> {
        let mut ex = self
            .pool
            .acquire()
            .await
            .context("acquiring connection")?;
        let round = database::rounds::fetch(&mut ex, round_id.0)
            .await
            .context("fetching round")?
            .ok_or(CloseError::NotFound)?;
        if matches!(round.status, database::rounds::RoundStatus::Revealed) {
            return Ok(false);
        }

        let salt = match tokio::time::timeout(self.salt_timeout, self.salt_source.latest_salt())
            .await
        {
            Ok(Ok(salt)) => salt,
            Ok(Err(err)) => {
                tracing::warn!(?err, round = round.id, "salt source failed, using fallback");
                Metrics::get().salt_fallbacks.inc();
                fallback_salt()
            }
            Err(_) => {
                tracing::warn!(round = round.id, "salt source timed out, using fallback");
                Metrics::get().salt_fallbacks.inc();
                fallback_salt()
            }
        };

        let secret = Secret::from_hex(round.secret.clone());
        let combined = commit_reveal::reveal(&secret, &salt);
        let draw = combined.to_unit_float();

        let candidates = database::entries::for_round(&mut ex, round.id)
            .await
            .context("fetching entries")?
            .into_iter()
            .map(|entry| Candidate {
                user_id: entry.user_id,
                weight: entry.weight,
            })
            .collect::<Vec<_>>();
        let winners = select_winner(&candidates, draw)
            .map(|winner| vec![winner.user_id.clone()])
            .unwrap_or_default();

        let mut transaction = self.pool.begin().await.context("begin")?;
        let revealed = database::rounds::reveal(
            &mut transaction,
            round.id,
            &salt,
            combined.as_str(),
            &winners,
        )
        .await
        .context("persisting reveal")?;
        transaction.commit().await.context("commit")?;

        if revealed {
            Metrics::get().rounds_closed.inc();
            tracing::info!(
                round = round.id,
                draw,
                winners = ?winners,
                entries = candidates.len(),
                "closed round"
            );
        }
        Ok(revealed)
    }

    /// Closes every open round whose close time has passed. The close loop
    /// calls this each tick; restarts lose no rounds because due-ness is
    /// derived from the persisted close time, not from an in-process timer.
    pub async fn close_due(&self, limit: i64) -> Result<usize> {
        let mut ex = self.pool.acquire().await?;
        let due = database::rounds::due_open(&mut ex, Utc::now(), limit).await?;
        drop(ex);
        let mut closed = 0;
        for round in due {
            match self.close(RoundId(round.id)).await {
                Ok(true) => closed += 1,
                // Someone else got there first; fine.
                Ok(false) => (),
                Err(err) => tracing::error!(round = round.id, ?err, "failed to close round"),
            }
        }
        Ok(closed)
    }

    /// A participant's view of a round outcome. Lazily closes a due round
    /// so correctness never depends on the background loop having fired.
    /// The full reveal is returned so the caller can verify the commitment
    /// and recompute the selection independently.
    pub async fn result(
        &self,
        round_id: RoundId,
        user_id: &UserId,
    ) -> Result<RoundResult, ResultError> {
        let mut ex = self.pool.acquire().await.context("acquire")?;
        let round = database::rounds::fetch(&mut ex, round_id.0)
            .await
            .context("fetching round")?
            .ok_or(ResultError::NotFound)?;
        if !database::entries::exists(&mut ex, round.id, user_id.as_str())
            .await
            .context("checking participation")?
        {
            return Err(ResultError::DidNotParticipate);
        }

        let round = if matches!(round.status, database::rounds::RoundStatus::Open) {
            if round.closes_at > Utc::now() {
                return Err(ResultError::NotYetRevealed);
            }
            drop(ex);
            match self.close(round_id).await {
                Ok(_) => (),
                Err(CloseError::NotFound) => return Err(ResultError::NotFound),
                Err(CloseError::Other(err)) => return Err(ResultError::Other(err)),
            }
            let mut ex = self.pool.acquire().await.context("acquire")?;
            database::rounds::fetch(&mut ex, round_id.0)
                .await
                .context("refetching round")?
                .ok_or(ResultError::NotFound)?
        } else {
            round
        };

        let reveal = Reveal {
            secret: round.secret.clone(),
            salt: round.public_salt.clone().unwrap_or_default(),
            combined: round.combined.clone().unwrap_or_default(),
        };
        // Audit the published commitment against the revealed secret. A
        // mismatch means the stored round data was tampered with; alarm,
        // but the round already closed so participants still get an answer.
        let commitment = Commitment::from_hex(round.commitment.clone());
        if !commit_reveal::verify(&commitment, &Secret::from_hex(reveal.secret.clone())) {
            Metrics::get().commitment_mismatches.inc();
            tracing::error!(round = round.id, "revealed secret does not match commitment");
        }

        let caught = round
            .winners
            .as_ref()
            .is_some_and(|winners| winners.0.iter().any(|winner| winner == user_id.as_str()));
        Ok(RoundResult { caught, reveal })
    }

    /// Read-only aggregate for dashboards; no state change.
    pub async fn stats(&self, round_id: RoundId) -> Result<RoundStats, StatsError> {
        let mut ex = self.pool.acquire().await?;
        let round = database::rounds::fetch(&mut ex, round_id.0)
            .await?
            .ok_or(StatsError::NotFound)?;
        let aggregates = database::entries::tier_aggregates(&mut ex, round.id).await?;

        let mut stats = RoundStats {
            status: match round.status {
                database::rounds::RoundStatus::Open => RoundStatus::Open,
                database::rounds::RoundStatus::Revealed => RoundStatus::Revealed,
            },
            winners: round
                .winners
                .map(|winners| winners.0.into_iter().map(UserId).collect())
                .unwrap_or_default(),
            ..Default::default()
        };
        for (tier, count, weight) in aggregates {
            stats.entries += count.max(0) as u64;
            stats.total_weight += weight;
            stats.entries_by_tier.push((tier_from_db(tier), count.max(0) as u64));
        }
        Ok(stats)
    }
}

fn tier_to_db(tier: Tier) -> EntryTier {
    match tier {
        Tier::Standard => EntryTier::Standard,
        Tier::Premium => EntryTier::Premium,
        Tier::Elite => EntryTier::Elite,
    }
}

fn tier_from_db(tier: EntryTier) -> Tier {
    match tier {
        EntryTier::Standard => Tier::Standard,
        EntryTier::Premium => Tier::Premium,
        EntryTier::Elite => Tier::Elite,
    }
}
