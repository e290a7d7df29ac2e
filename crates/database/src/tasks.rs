use {
    crate::orders::OrderId,
    sqlx::{
        PgConnection,
        types::chrono::{DateTime, Utc},
    },
};

pub type TaskId = i64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "TaskKind", rename_all = "lowercase")]
pub enum TaskKind {
    Execute,
    Deliver,
}

/// One row in the `tasks` table, the persisted work queue for order
/// fulfillment. A dequeued task stays in the table with its `available_at`
/// pushed past the visibility timeout; finishing it deletes the row, a
/// worker crash lets it reappear.
#[derive(Clone, Debug, Eq, PartialEq, sqlx::FromRow)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub order_id: OrderId,
    pub available_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
}

pub async fn insert(
    ex: &mut PgConnection,
    kind: TaskKind,
    order_id: OrderId,
    available_at: DateTime<Utc>,
    max_attempts: i32,
) -> Result<TaskId, sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO tasks (kind, order_id, available_at, attempts, max_attempts, created_at)
VALUES ($1, $2, $3, 0, $4, $3)
RETURNING id
    "#;
    let (id,) = sqlx::query_as(QUERY)
        .bind(kind)
        .bind(order_id)
        .bind(available_at)
        .bind(max_attempts)
        .fetch_one(ex)
        .await?;
    Ok(id)
}

/// Claims the oldest visible task for `visibility`, bumping its attempt
/// counter. `SKIP LOCKED` lets concurrent workers claim disjoint tasks
/// without blocking each other.
pub async fn dequeue(
    ex: &mut PgConnection,
    now: DateTime<Utc>,
    visibility: chrono::Duration,
) -> Result<Option<Task>, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE tasks
SET available_at = $2, attempts = attempts + 1
WHERE id = (
    SELECT id FROM tasks
    WHERE available_at <= $1
    ORDER BY available_at, id
    FOR UPDATE SKIP LOCKED
    LIMIT 1
)
RETURNING *
    "#;
    sqlx::query_as(QUERY)
        .bind(now)
        .bind(now + visibility)
        .fetch_optional(ex)
        .await
}

/// Removes a finished (or permanently failed) task.
pub async fn delete(ex: &mut PgConnection, id: TaskId) -> Result<bool, sqlx::Error> {
    const QUERY: &str = "DELETE FROM tasks WHERE id = $1";
    let result = sqlx::query(QUERY).bind(id).execute(ex).await?;
    Ok(result.rows_affected() > 0)
}

/// Makes a failed task visible again at `available_at` (backoff schedule is
/// the worker's business).
pub async fn reschedule(
    ex: &mut PgConnection,
    id: TaskId,
    available_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    const QUERY: &str = "UPDATE tasks SET available_at = $2 WHERE id = $1";
    sqlx::query(QUERY).bind(id).bind(available_at).execute(ex).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{orders, reservations, rounds},
        sqlx::Connection,
        std::str::FromStr,
    };

    async fn new_order(ex: &mut PgConnection) -> OrderId {
        let now = Utc::now();
        let price = bigdecimal::BigDecimal::from_str("0.5").unwrap();
        let round = rounds::insert(ex, "drop-1", now, now, "c", "s").await.unwrap();
        let reservation =
            reservations::insert(ex, round, "drop-1", "alice", &price, "tok", now, now)
                .await
                .unwrap();
        orders::insert(ex, reservation.id, "alice", "drop-1", &price, now)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_dequeue_respects_visibility() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let order = new_order(&mut db).await;
        let now = Utc::now();
        let visibility = chrono::Duration::seconds(30);
        insert(&mut db, TaskKind::Execute, order, now, 5).await.unwrap();

        let task = dequeue(&mut db, now, visibility).await.unwrap().unwrap();
        assert_eq!(task.kind, TaskKind::Execute);
        assert_eq!(task.order_id, order);
        assert_eq!(task.attempts, 1);

        // Claimed task is invisible until the timeout passes, then it comes
        // back with another attempt counted.
        assert!(dequeue(&mut db, now, visibility).await.unwrap().is_none());
        let later = now + visibility;
        let again = dequeue(&mut db, later, visibility).await.unwrap().unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.attempts, 2);

        assert!(delete(&mut db, task.id).await.unwrap());
        assert!(!delete(&mut db, task.id).await.unwrap());
        assert!(dequeue(&mut db, later + visibility, visibility).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_dequeue_oldest_first_and_reschedule() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let order = new_order(&mut db).await;
        let now = Utc::now();
        let visibility = chrono::Duration::seconds(30);
        let old = insert(
            &mut db,
            TaskKind::Execute,
            order,
            now - chrono::Duration::seconds(10),
            5,
        )
        .await
        .unwrap();
        insert(&mut db, TaskKind::Deliver, order, now, 5).await.unwrap();

        let task = dequeue(&mut db, now, visibility).await.unwrap().unwrap();
        assert_eq!(task.id, old);

        // Backing the task off beyond the other one flips the claim order.
        reschedule(&mut db, old, now + chrono::Duration::seconds(60)).await.unwrap();
        let task = dequeue(&mut db, now, visibility).await.unwrap().unwrap();
        assert_eq!(task.kind, TaskKind::Deliver);
    }
}
