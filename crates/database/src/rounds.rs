use {
    crate::PgTransaction,
    sqlx::{
        PgConnection,
        types::{
            Json,
            chrono::{DateTime, Utc},
        },
    },
};

pub type RoundId = i64;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "RoundStatus", rename_all = "lowercase")]
pub enum RoundStatus {
    #[default]
    Open,
    Revealed,
}

/// One row in the `rounds` table. The reveal columns stay NULL while the
/// round is open and are written exactly once by [`reveal`].
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Round {
    pub id: RoundId,
    pub item_id: String,
    pub status: RoundStatus,
    pub starts_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
    pub commitment: String,
    pub secret: String,
    pub public_salt: Option<String>,
    pub combined: Option<String>,
    pub winners: Option<Json<Vec<String>>>,
}

/// Creates a new open round and returns its id. Fails with a unique
/// violation if an open round for the item already exists, which a racing
/// creator resolves by re-reading [`open_for_item`].
pub async fn insert(
    ex: &mut PgConnection,
    item_id: &str,
    starts_at: DateTime<Utc>,
    closes_at: DateTime<Utc>,
    commitment: &str,
    secret: &str,
) -> Result<RoundId, sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO rounds (item_id, status, starts_at, closes_at, commitment, secret)
VALUES ($1, 'open', $2, $3, $4, $5)
RETURNING id
    "#;
    let (id,) = sqlx::query_as(QUERY)
        .bind(item_id)
        .bind(starts_at)
        .bind(closes_at)
        .bind(commitment)
        .bind(secret)
        .fetch_one(ex)
        .await?;
    Ok(id)
}

pub async fn fetch(ex: &mut PgConnection, id: RoundId) -> Result<Option<Round>, sqlx::Error> {
    const QUERY: &str = "SELECT * FROM rounds WHERE id = $1";
    sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}

/// The open round for an item whose close time has not yet passed, if any.
pub async fn open_for_item(
    ex: &mut PgConnection,
    item_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Round>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT * FROM rounds
WHERE item_id = $1 AND status = 'open' AND closes_at > $2
    "#;
    sqlx::query_as(QUERY)
        .bind(item_id)
        .bind(now)
        .fetch_optional(ex)
        .await
}

/// The open round for an item regardless of its close time. An overdue
/// round keeps the item's open slot until it is revealed.
pub async fn open_for_item_any(
    ex: &mut PgConnection,
    item_id: &str,
) -> Result<Option<Round>, sqlx::Error> {
    const QUERY: &str = "SELECT * FROM rounds WHERE item_id = $1 AND status = 'open'";
    sqlx::query_as(QUERY).bind(item_id).fetch_optional(ex).await
}

/// Open rounds whose close time has passed; the close loop works these off.
pub async fn due_open(
    ex: &mut PgConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Round>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT * FROM rounds
WHERE status = 'open' AND closes_at <= $1
ORDER BY closes_at
LIMIT $2
    "#;
    sqlx::query_as(QUERY).bind(now).bind(limit).fetch_all(ex).await
}

/// Flips an open round to revealed, persisting salt, combined randomness and
/// the winner list in one statement. Returns false if the round was already
/// revealed (or does not exist), making racing closers converge on a single
/// reveal.
pub async fn reveal(
    ex: &mut PgTransaction<'_>,
    id: RoundId,
    public_salt: &str,
    combined: &str,
    winners: &[String],
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE rounds
SET status = 'revealed', public_salt = $2, combined = $3, winners = $4
WHERE id = $1 AND status = 'open'
    "#;
    let result = sqlx::query(QUERY)
        .bind(id)
        .bind(public_salt)
        .bind(combined)
        .bind(Json(winners))
        .execute(ex.as_mut())
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use {super::*, sqlx::Connection};

    #[tokio::test]
    #[ignore]
    async fn postgres_round_roundtrip() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let now = Utc::now();
        let id = insert(&mut db, "drop-1", now, now + chrono::Duration::seconds(60), "c0ffee", "5ecret")
            .await
            .unwrap();
        let round = fetch(&mut db, id).await.unwrap().unwrap();
        assert_eq!(round.item_id, "drop-1");
        assert_eq!(round.status, RoundStatus::Open);
        assert_eq!(round.commitment, "c0ffee");
        assert!(round.public_salt.is_none());
        assert!(round.winners.is_none());

        let open = open_for_item(&mut db, "drop-1", now).await.unwrap();
        assert_eq!(open.unwrap().id, id);
        // An expired open round no longer admits joiners but still holds
        // the item's open slot.
        let later = now + chrono::Duration::seconds(61);
        let open = open_for_item(&mut db, "drop-1", later).await.unwrap();
        assert!(open.is_none());
        let open = open_for_item_any(&mut db, "drop-1").await.unwrap();
        assert_eq!(open.unwrap().id, id);
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_one_open_round_per_item() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let now = Utc::now();
        let closes = now + chrono::Duration::seconds(60);
        insert(&mut db, "drop-1", now, closes, "a", "s1").await.unwrap();
        let err = insert(&mut db, "drop-1", now, closes, "b", "s2")
            .await
            .unwrap_err();
        assert!(matches!(
            crate::InsertionError::from(err),
            crate::InsertionError::DuplicatedRecord
        ));
        // A different item is unaffected.
        insert(&mut db, "drop-2", now, closes, "c", "s3").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_reveal_is_single_shot() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let now = Utc::now();
        let id = insert(&mut db, "drop-1", now, now, "c", "s").await.unwrap();
        assert!(due_open(&mut db, now, 10).await.unwrap().iter().any(|r| r.id == id));

        let winners = vec!["alice".to_string()];
        assert!(reveal(&mut db, id, "salt", "combined", &winners).await.unwrap());
        // Second reveal is a no-op and must not overwrite the first.
        assert!(!reveal(&mut db, id, "other", "other", &[]).await.unwrap());

        let round = fetch(&mut db, id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Revealed);
        assert_eq!(round.public_salt.as_deref(), Some("salt"));
        assert_eq!(round.combined.as_deref(), Some("combined"));
        assert_eq!(round.winners.unwrap().0, winners);
        assert!(due_open(&mut db, now, 10).await.unwrap().is_empty());
    }
}
