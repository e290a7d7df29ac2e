pub mod balances;
pub mod entries;
pub mod orders;
pub mod reservations;
pub mod rounds;
pub mod tasks;

use sqlx::{Executor, PgConnection, PgPool};

// Design:
//
// Functions that execute multiple statements take `&mut PgTransaction` so
// the whole group succeeds or fails together. Functions that execute a
// single statement take `&mut PgConnection`; `PgTransaction` derefs to
// `PgConnection` so callers can still compose them into bigger transactions.
// The parameter is called `ex` for `Executor`. Callers commit.
//
// Every state-machine transition in this schema is a conditional update
// (`UPDATE ... WHERE status = <expected>`); racing writers observe
// `rows_affected() == 0` instead of clobbering each other. Uniqueness
// constraints (duplicate entry, one open round per item, one pending
// reservation per winner, one order per reservation) surface as error code
// 23505 and are mapped to [`InsertionError::DuplicatedRecord`].

pub type PgTransaction<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

/// The names of the tables this crate operates on.
pub const TABLES: &[&str] = &[
    "tasks",
    "orders",
    "reservations",
    "entries",
    "rounds",
    "balances",
];

#[derive(Debug)]
pub enum InsertionError {
    DuplicatedRecord,
    DbError(sqlx::Error),
}

impl From<sqlx::Error> for InsertionError {
    fn from(err: sqlx::Error) -> Self {
        if is_duplicate_record_error(&err) {
            Self::DuplicatedRecord
        } else {
            Self::DbError(err)
        }
    }
}

/// True when the error is a postgres unique constraint violation.
pub fn is_duplicate_record_error(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

/// Delete all data in the database. Only used by tests.
#[allow(non_snake_case)]
pub async fn clear_DANGER_(ex: &mut PgTransaction<'_>) -> sqlx::Result<()> {
    for table in TABLES {
        ex.execute(format!("TRUNCATE {table} CASCADE;").as_str())
            .await?;
    }
    Ok(())
}

/// Like above but more ergonomic for tests that use a pool.
#[allow(non_snake_case)]
pub async fn clear_DANGER(pool: &PgPool) -> sqlx::Result<()> {
    let mut transaction = pool.begin().await?;
    clear_DANGER_(&mut transaction).await?;
    transaction.commit().await
}

/// Applies `schema.sql` to an empty database. Only used by tests and local
/// development; deployments run migrations out-of-band.
pub async fn initialize_schema(ex: &mut PgConnection) -> sqlx::Result<()> {
    ex.execute(include_str!("../schema.sql")).await?;
    Ok(())
}
