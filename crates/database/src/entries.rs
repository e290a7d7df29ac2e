use {
    crate::rounds::RoundId,
    sqlx::{
        PgConnection,
        types::chrono::{DateTime, Utc},
    },
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, sqlx::Type)]
#[sqlx(type_name = "EntryTier", rename_all = "lowercase")]
pub enum EntryTier {
    #[default]
    Standard,
    Premium,
    Elite,
}

/// One row in the `entries` table. Entries are append-only; the primary key
/// on `(round_id, user_id)` rejects duplicate joins.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Entry {
    pub round_id: RoundId,
    pub user_id: String,
    pub tier: EntryTier,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

pub async fn insert(ex: &mut PgConnection, entry: &Entry) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO entries (round_id, user_id, tier, weight, created_at)
VALUES ($1, $2, $3, $4, $5)
    "#;
    sqlx::query(QUERY)
        .bind(entry.round_id)
        .bind(&entry.user_id)
        .bind(entry.tier)
        .bind(entry.weight)
        .bind(entry.created_at)
        .execute(ex)
        .await?;
    Ok(())
}

/// All entries of a round in the fixed order the winner walk iterates them.
/// The order must be stable across re-runs for the selection to be
/// reproducible from the published reveal.
pub async fn for_round(ex: &mut PgConnection, round_id: RoundId) -> Result<Vec<Entry>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT * FROM entries
WHERE round_id = $1
ORDER BY user_id
    "#;
    sqlx::query_as(QUERY).bind(round_id).fetch_all(ex).await
}

pub async fn exists(
    ex: &mut PgConnection,
    round_id: RoundId,
    user_id: &str,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = "SELECT COUNT(*) FROM entries WHERE round_id = $1 AND user_id = $2";
    let (count,): (i64,) = sqlx::query_as(QUERY)
        .bind(round_id)
        .bind(user_id)
        .fetch_one(ex)
        .await?;
    Ok(count > 0)
}

/// Entry count and accumulated weight per tier, for round stats.
pub async fn tier_aggregates(
    ex: &mut PgConnection,
    round_id: RoundId,
) -> Result<Vec<(EntryTier, i64, f64)>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT tier, COUNT(*), SUM(weight)
FROM entries
WHERE round_id = $1
GROUP BY tier
    "#;
    sqlx::query_as(QUERY).bind(round_id).fetch_all(ex).await
}
