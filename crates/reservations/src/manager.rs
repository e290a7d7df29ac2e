use {
    anyhow::{Context, Result},
    bigdecimal::BigDecimal,
    chrono::Utc,
    database::is_duplicate_record_error,
    model::{
        ItemId, UserId,
        reservation::{Reservation, ReservationId, ReservationStatus},
        round::RoundId,
    },
    rand::RngCore,
    sqlx::PgPool,
    std::time::Duration,
    thiserror::Error,
};

#[derive(prometheus_metric_storage::MetricStorage, Clone, Debug)]
#[metric(subsystem = "reservations")]
struct Metrics {
    /// Number of reservations created (idempotent replays not counted).
    reservations_created: prometheus::IntCounter,
    /// Number of reservations swept to expired.
    reservations_expired: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("round not found")]
    RoundNotFound,
    #[error("caller is not a winner of this round")]
    NotWinner,
    #[error("purchase right was already consumed or expired")]
    AlreadyConsumed,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// What a winner check yields besides the yes/no: the item the round
/// allocated, which the reserve flow needs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WinnerInfo {
    pub item_id: ItemId,
}

pub struct ReservationManager {
    pool: PgPool,
    /// How long a freshly created reservation remains payable.
    ttl: Duration,
}

impl ReservationManager {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Whether `user_id` won `round_id`. Only revealed rounds have winners;
    /// an open round answers no for everyone.
    pub async fn is_winner(
        &self,
        round_id: RoundId,
        user_id: &UserId,
    ) -> Result<Option<WinnerInfo>, sqlx::Error> {
        let mut ex = self.pool.acquire().await?;
        let Some(round) = database::rounds::fetch(&mut ex, round_id.0).await? else {
            return Ok(None);
        };
        Ok(winner_info(&round, user_id))
    }

    /// Issues the winner's purchase right, or returns the existing pending
    /// one unchanged. Safe to call repeatedly with the same or different
    /// idempotency key: the live-reservation uniqueness per (round, user)
    /// is the idempotency anchor, the key is only logged for correlation.
    pub async fn create(
        &self,
        round_id: RoundId,
        user_id: &UserId,
        price: &BigDecimal,
        idempotency_key: Option<&str>,
    ) -> Result<Reservation, ReserveError> {
        let mut ex = self.pool.acquire().await?;
        let round = database::rounds::fetch(&mut ex, round_id.0)
            .await?
            .ok_or(ReserveError::RoundNotFound)?;
        let info = winner_info(&round, user_id).ok_or(ReserveError::NotWinner)?;
        if let Some(existing) =
            database::reservations::latest_for(&mut ex, round_id.0, user_id.as_str()).await?
        {
            // A pending right is handed back unchanged; a consumed or swept
            // one is gone for good, the win is not reusable.
            return match existing.status {
                database::reservations::ReservationStatus::Pending => {
                    tracing::debug!(
                        reservation = existing.id,
                        idempotency_key,
                        "returning existing pending reservation"
                    );
                    Ok(from_db(existing))
                }
                _ => Err(ReserveError::AlreadyConsumed),
            };
        }

        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.ttl).expect("reservation ttl fits a chrono duration");
        let inserted = database::reservations::insert(
            &mut ex,
            round_id.0,
            info.item_id.as_str(),
            user_id.as_str(),
            price,
            &opaque_token(),
            expires_at,
            now,
        )
        .await;
        match inserted {
            Ok(reservation) => {
                Metrics::get().reservations_created.inc();
                tracing::info!(
                    reservation = reservation.id,
                    round = round_id.0,
                    user = %user_id,
                    idempotency_key,
                    "created reservation"
                );
                Ok(from_db(reservation))
            }
            // Lost a creation race; the concurrent request's reservation is
            // the one to hand back.
            Err(err) if is_duplicate_record_error(&err) => {
                let existing =
                    database::reservations::pending_for(&mut ex, round_id.0, user_id.as_str())
                        .await?
                        .ok_or(sqlx::Error::RowNotFound)?;
                Ok(from_db(existing))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Sweeps overdue pending reservations to expired. Re-entrant; runs on
    /// the recurring sweep loop and on demand via the admin surface.
    pub async fn expire_stale(&self) -> Result<u64> {
        let mut ex = self.pool.acquire().await?;
        let count = database::reservations::expire_stale(&mut ex, Utc::now())
            .await
            .context("sweeping reservations")?;
        if count > 0 {
            Metrics::get().reservations_expired.inc_by(count);
            tracing::info!(count, "expired stale reservations");
        }
        Ok(count)
    }

    /// Cancels a caller-owned pending reservation; false when there is
    /// nothing cancellable (not found, foreign, already consumed/expired).
    pub async fn cancel(
        &self,
        id: ReservationId,
        user_id: &UserId,
    ) -> Result<bool, CancelError> {
        let mut ex = self.pool.acquire().await?;
        let cancelled =
            database::reservations::cancel(&mut ex, id.0, user_id.as_str()).await?;
        if cancelled {
            tracing::info!(reservation = id.0, user = %user_id, "cancelled reservation");
        }
        Ok(cancelled)
    }

    /// A user's reservations, newest first.
    pub async fn list_for_user(
        &self,
        user_id: &UserId,
        limit: i64,
    ) -> Result<Vec<Reservation>, sqlx::Error> {
        let mut ex = self.pool.acquire().await?;
        let rows = database::reservations::list_for_user(&mut ex, user_id.as_str(), limit).await?;
        Ok(rows.into_iter().map(from_db).collect())
    }
}

fn winner_info(round: &database::rounds::Round, user_id: &UserId) -> Option<WinnerInfo> {
    if !matches!(round.status, database::rounds::RoundStatus::Revealed) {
        return None;
    }
    let won = round
        .winners
        .as_ref()
        .is_some_and(|winners| winners.0.iter().any(|winner| winner == user_id.as_str()));
    won.then(|| WinnerInfo {
        item_id: ItemId(round.item_id.clone()),
    })
}

fn opaque_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn from_db(row: database::reservations::Reservation) -> Reservation {
    Reservation {
        id: ReservationId(row.id),
        round_id: RoundId(row.round_id),
        item_id: ItemId(row.item_id),
        user_id: UserId(row.user_id),
        price: row.price,
        status: match row.status {
            database::reservations::ReservationStatus::Pending => ReservationStatus::Pending,
            database::reservations::ReservationStatus::Cancelled => ReservationStatus::Cancelled,
            database::reservations::ReservationStatus::Expired => ReservationStatus::Expired,
        },
        token: row.token,
        expires_at: row.expires_at,
        created_at: row.created_at,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::str::FromStr};

    async fn pool() -> PgPool {
        let pool = PgPool::connect("postgresql://").await.unwrap();
        database::clear_DANGER(&pool).await.unwrap();
        pool
    }

    async fn revealed_round(pool: &PgPool, winner: &str) -> RoundId {
        let mut ex = pool.acquire().await.unwrap();
        let now = Utc::now();
        let id = database::rounds::insert(&mut ex, "drop-1", now, now, "c", "s")
            .await
            .unwrap();
        let mut transaction = pool.begin().await.unwrap();
        database::rounds::reveal(
            &mut transaction,
            id,
            "salt",
            "combined",
            &[winner.to_string()],
        )
        .await
        .unwrap();
        transaction.commit().await.unwrap();
        RoundId(id)
    }

    fn price() -> BigDecimal {
        BigDecimal::from_str("0.5").unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_create_requires_winning() {
        let pool = pool().await;
        let manager = ReservationManager::new(pool.clone(), Duration::from_secs(90));
        let round = revealed_round(&pool, "alice").await;

        assert!(manager
            .is_winner(round, &UserId::from("alice"))
            .await
            .unwrap()
            .is_some());
        assert!(manager
            .is_winner(round, &UserId::from("bob"))
            .await
            .unwrap()
            .is_none());

        let denied = manager
            .create(round, &UserId::from("bob"), &price(), None)
            .await;
        assert!(matches!(denied, Err(ReserveError::NotWinner)));

        // A round that does not exist is not an authorization failure.
        let missing = manager
            .create(RoundId(999_999), &UserId::from("alice"), &price(), None)
            .await;
        assert!(matches!(missing, Err(ReserveError::RoundNotFound)));
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_create_is_idempotent_per_winner() {
        let pool = pool().await;
        let manager = ReservationManager::new(pool.clone(), Duration::from_secs(90));
        let round = revealed_round(&pool, "alice").await;
        let alice = UserId::from("alice");

        let first = manager.create(round, &alice, &price(), Some("key-1")).await.unwrap();
        let second = manager.create(round, &alice, &price(), Some("key-2")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.token, second.token);
        assert_eq!(first.status, ReservationStatus::Pending);
        assert_eq!(first.item_id, ItemId::from("drop-1"));
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_expired_reservation_is_not_resurrected() {
        let pool = pool().await;
        let manager = ReservationManager::new(pool.clone(), Duration::from_secs(0));
        let round = revealed_round(&pool, "alice").await;
        let alice = UserId::from("alice");

        manager.create(round, &alice, &price(), None).await.unwrap();
        assert_eq!(manager.expire_stale().await.unwrap(), 1);
        assert_eq!(manager.expire_stale().await.unwrap(), 0);

        // The purchase right is gone for good, not re-issued.
        let again = manager.create(round, &alice, &price(), None).await;
        assert!(matches!(again, Err(ReserveError::AlreadyConsumed)));

        let listed = manager.list_for_user(&alice, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ReservationStatus::Expired);
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_cancel_owner_scoped() {
        let pool = pool().await;
        let manager = ReservationManager::new(pool.clone(), Duration::from_secs(90));
        let round = revealed_round(&pool, "alice").await;
        let alice = UserId::from("alice");

        let reservation = manager.create(round, &alice, &price(), None).await.unwrap();
        assert!(!manager.cancel(reservation.id, &UserId::from("mallory")).await.unwrap());
        assert!(manager.cancel(reservation.id, &alice).await.unwrap());
        assert!(!manager.cancel(reservation.id, &alice).await.unwrap());
    }
}
