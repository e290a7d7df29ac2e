use {
    crate::reservations::ReservationId,
    bigdecimal::BigDecimal,
    sqlx::{
        PgConnection,
        types::chrono::{DateTime, Utc},
    },
};

pub type OrderId = i64;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "OrderStatus", rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Created,
    Queued,
    OnchainPending,
    OnchainOk,
    OnchainFail,
    Delivered,
}

/// One row in the `orders` table. Status only ever moves forward; every
/// transition goes through [`advance`] or [`record_execution`] so concurrent
/// drivers cannot skip or rewind states.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Order {
    pub id: OrderId,
    pub reservation_id: ReservationId,
    pub user_id: String,
    pub item_id: String,
    pub price: BigDecimal,
    pub status: OrderStatus,
    pub tx_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creates an order in `created` for a consumed reservation. The unique
/// constraint on `reservation_id` guarantees at most one order per
/// reservation even under concurrent payment submissions.
pub async fn insert(
    ex: &mut PgConnection,
    reservation_id: ReservationId,
    user_id: &str,
    item_id: &str,
    price: &BigDecimal,
    now: DateTime<Utc>,
) -> Result<OrderId, sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO orders (reservation_id, user_id, item_id, price, status, created_at, updated_at)
VALUES ($1, $2, $3, $4, 'created', $5, $5)
RETURNING id
    "#;
    let (id,) = sqlx::query_as(QUERY)
        .bind(reservation_id)
        .bind(user_id)
        .bind(item_id)
        .bind(price)
        .bind(now)
        .fetch_one(ex)
        .await?;
    Ok(id)
}

pub async fn fetch(ex: &mut PgConnection, id: OrderId) -> Result<Option<Order>, sqlx::Error> {
    const QUERY: &str = "SELECT * FROM orders WHERE id = $1";
    sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}

/// The order created from a reservation, if payment already went through.
/// Lets a replayed pay request answer with the original order.
pub async fn by_reservation(
    ex: &mut PgConnection,
    reservation_id: ReservationId,
) -> Result<Option<Order>, sqlx::Error> {
    const QUERY: &str = "SELECT * FROM orders WHERE reservation_id = $1";
    sqlx::query_as(QUERY)
        .bind(reservation_id)
        .fetch_optional(ex)
        .await
}

pub async fn fetch_for_user(
    ex: &mut PgConnection,
    id: OrderId,
    user_id: &str,
) -> Result<Option<Order>, sqlx::Error> {
    const QUERY: &str = "SELECT * FROM orders WHERE id = $1 AND user_id = $2";
    sqlx::query_as(QUERY)
        .bind(id)
        .bind(user_id)
        .fetch_optional(ex)
        .await
}

/// Conditionally moves an order from `from` to `to`. Returns false if the
/// order is not currently in `from`, which callers treat as a conflict, not
/// as corruption.
pub async fn advance(
    ex: &mut PgConnection,
    id: OrderId,
    from: OrderStatus,
    to: OrderStatus,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE orders
SET status = $3, updated_at = $4
WHERE id = $1 AND status = $2
    "#;
    let result = sqlx::query(QUERY)
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(now)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Records a successful execution: stores the transaction reference and
/// moves `onchain_pending → onchain_ok` in one statement.
pub async fn record_execution(
    ex: &mut PgConnection,
    id: OrderId,
    tx_ref: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE orders
SET status = 'onchain_ok', tx_ref = $2, updated_at = $3
WHERE id = $1 AND status = 'onchain_pending'
    "#;
    let result = sqlx::query(QUERY)
        .bind(id)
        .bind(tx_ref)
        .bind(now)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{reservations, rounds},
        sqlx::Connection,
        std::str::FromStr,
    };

    async fn new_reservation(ex: &mut PgConnection) -> reservations::Reservation {
        let now = Utc::now();
        let round = rounds::insert(ex, "drop-1", now, now, "c", "s").await.unwrap();
        reservations::insert(
            ex,
            round,
            "drop-1",
            "alice",
            &BigDecimal::from_str("0.5").unwrap(),
            "tok",
            now + chrono::Duration::seconds(90),
            now,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_one_order_per_reservation() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let reservation = new_reservation(&mut db).await;
        let now = Utc::now();
        let id = insert(&mut db, reservation.id, "alice", "drop-1", &reservation.price, now)
            .await
            .unwrap();
        let err = insert(&mut db, reservation.id, "alice", "drop-1", &reservation.price, now)
            .await
            .unwrap_err();
        assert!(matches!(
            crate::InsertionError::from(err),
            crate::InsertionError::DuplicatedRecord
        ));

        let order = fetch(&mut db, id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Created);
        assert!(order.tx_ref.is_none());
        assert!(fetch_for_user(&mut db, id, "alice").await.unwrap().is_some());
        assert!(fetch_for_user(&mut db, id, "bob").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_advance_is_conditional() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let reservation = new_reservation(&mut db).await;
        let now = Utc::now();
        let id = insert(&mut db, reservation.id, "alice", "drop-1", &reservation.price, now)
            .await
            .unwrap();

        assert!(advance(&mut db, id, OrderStatus::Created, OrderStatus::Queued, now)
            .await
            .unwrap());
        // Re-running the same transition no-ops, as does skipping ahead.
        assert!(!advance(&mut db, id, OrderStatus::Created, OrderStatus::Queued, now)
            .await
            .unwrap());
        assert!(!advance(&mut db, id, OrderStatus::OnchainOk, OrderStatus::Delivered, now)
            .await
            .unwrap());

        assert!(advance(&mut db, id, OrderStatus::Queued, OrderStatus::OnchainPending, now)
            .await
            .unwrap());
        assert!(record_execution(&mut db, id, "0xtx", now).await.unwrap());
        assert!(!record_execution(&mut db, id, "0xother", now).await.unwrap());

        let order = fetch(&mut db, id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::OnchainOk);
        assert_eq!(order.tx_ref.as_deref(), Some("0xtx"));
    }
}
