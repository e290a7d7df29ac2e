use {
    crate::rounds::RoundId,
    bigdecimal::BigDecimal,
    sqlx::{
        PgConnection,
        types::chrono::{DateTime, Utc},
    },
};

pub type ReservationId = i64;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "ReservationStatus", rename_all = "lowercase")]
pub enum ReservationStatus {
    #[default]
    Pending,
    Cancelled,
    Expired,
}

/// One row in the `reservations` table. The partial unique index on
/// `(round_id, user_id) WHERE status = 'pending'` makes creation idempotent
/// for a winner and stops a second live purchase right from ever existing.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Reservation {
    pub id: ReservationId,
    pub round_id: RoundId,
    pub item_id: String,
    pub user_id: String,
    pub price: BigDecimal,
    pub status: ReservationStatus,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Stores a new pending reservation and returns it with its assigned id.
pub async fn insert(
    ex: &mut PgConnection,
    round_id: RoundId,
    item_id: &str,
    user_id: &str,
    price: &BigDecimal,
    token: &str,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
) -> Result<Reservation, sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO reservations (round_id, item_id, user_id, price, status, token, expires_at, created_at)
VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
RETURNING *
    "#;
    sqlx::query_as(QUERY)
        .bind(round_id)
        .bind(item_id)
        .bind(user_id)
        .bind(price)
        .bind(token)
        .bind(expires_at)
        .bind(created_at)
        .fetch_one(ex)
        .await
}

pub async fn fetch(
    ex: &mut PgConnection,
    id: ReservationId,
) -> Result<Option<Reservation>, sqlx::Error> {
    const QUERY: &str = "SELECT * FROM reservations WHERE id = $1";
    sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}

/// The live purchase right of a winner in a round, if any.
pub async fn pending_for(
    ex: &mut PgConnection,
    round_id: RoundId,
    user_id: &str,
) -> Result<Option<Reservation>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT * FROM reservations
WHERE round_id = $1 AND user_id = $2 AND status = 'pending'
    "#;
    sqlx::query_as(QUERY)
        .bind(round_id)
        .bind(user_id)
        .fetch_optional(ex)
        .await
}

/// Consumes a caller-owned pending, unexpired reservation, returning the
/// consumed row. `None` means it was missing, foreign, already consumed or
/// past its expiry; the caller maps that to the right conflict error.
pub async fn consume(
    ex: &mut PgConnection,
    id: ReservationId,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Reservation>, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE reservations
SET status = 'cancelled'
WHERE id = $1 AND user_id = $2 AND status = 'pending' AND expires_at > $3
RETURNING *
    "#;
    sqlx::query_as(QUERY)
        .bind(id)
        .bind(user_id)
        .bind(now)
        .fetch_optional(ex)
        .await
}

/// The most recent reservation of a winner in a round regardless of status.
/// Used to tell "never reserved" apart from "already consumed or expired".
pub async fn latest_for(
    ex: &mut PgConnection,
    round_id: RoundId,
    user_id: &str,
) -> Result<Option<Reservation>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT * FROM reservations
WHERE round_id = $1 AND user_id = $2
ORDER BY created_at DESC, id DESC
LIMIT 1
    "#;
    sqlx::query_as(QUERY)
        .bind(round_id)
        .bind(user_id)
        .fetch_optional(ex)
        .await
}

/// Explicit user cancellation of a caller-owned pending reservation.
/// Unlike [`consume`] this does not care about the expiry; an overdue but
/// not yet swept reservation can still be cancelled.
pub async fn cancel(
    ex: &mut PgConnection,
    id: ReservationId,
    user_id: &str,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE reservations
SET status = 'cancelled'
WHERE id = $1 AND user_id = $2 AND status = 'pending'
    "#;
    let result = sqlx::query(QUERY).bind(id).bind(user_id).execute(ex).await?;
    Ok(result.rows_affected() > 0)
}

/// Moves every overdue pending reservation to expired and reports how many
/// were swept. Re-entrant: a second sweep sees no pending overdue rows.
pub async fn expire_stale(ex: &mut PgConnection, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE reservations
SET status = 'expired'
WHERE status = 'pending' AND expires_at <= $1
    "#;
    let result = sqlx::query(QUERY).bind(now).execute(ex).await?;
    Ok(result.rows_affected())
}

/// All reservations of a user, newest first.
pub async fn list_for_user(
    ex: &mut PgConnection,
    user_id: &str,
    limit: i64,
) -> Result<Vec<Reservation>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT * FROM reservations
WHERE user_id = $1
ORDER BY created_at DESC, id DESC
LIMIT $2
    "#;
    sqlx::query_as(QUERY)
        .bind(user_id)
        .bind(limit)
        .fetch_all(ex)
        .await
}
