use {
    crate::collaborators::{Delivering, OnchainExecuting, PaymentVerifying},
    anyhow::{Context, Result},
    chrono::Utc,
    database::{orders::OrderStatus as DbOrderStatus, tasks::TaskKind},
    model::{
        ItemId, UserId,
        order::{Order, OrderId, OrderStatus},
        reservation::ReservationId,
    },
    sqlx::PgPool,
    std::{sync::Arc, time::Duration},
    thiserror::Error,
};

#[derive(prometheus_metric_storage::MetricStorage, Clone, Debug)]
#[metric(subsystem = "orders")]
struct Metrics {
    /// Number of orders created from paid reservations.
    orders_created: prometheus::IntCounter,
    /// Number of successful on-chain executions.
    executions_ok: prometheus::IntCounter,
    /// Number of terminally failed on-chain executions.
    executions_failed: prometheus::IntCounter,
    /// Number of orders delivered.
    orders_delivered: prometheus::IntCounter,
    /// Number of compensating refunds issued for failed executions.
    refunds_issued: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

#[derive(Debug, Error)]
pub enum PayError {
    /// The reservation is missing, foreign, already consumed or expired.
    #[error("reservation is not payable")]
    NotPayable,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("payment proof rejected")]
    InvalidProof,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("order not found")]
    NotFound,
    #[error("order is not in created state")]
    NotReady,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("order not found")]
    NotFound,
    #[error("order is not queued for execution")]
    NotReady,
    /// The executor reported failure; the order is terminally
    /// `onchain_fail` and the price was refunded to the buyer's balance.
    #[error("on-chain execution failed")]
    ExecutionFailed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DeliverError {
    #[error("order not found")]
    NotFound,
    #[error("order is not ready for delivery")]
    NotReady,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct OrderEngine {
    pool: PgPool,
    payments: Arc<dyn PaymentVerifying>,
    executor: Arc<dyn OnchainExecuting>,
    delivery: Arc<dyn Delivering>,
    /// Bound on each external collaborator call so no order transition
    /// blocks a worker indefinitely.
    collaborator_timeout: Duration,
    /// Attempt budget given to every fulfillment task.
    task_max_attempts: i32,
}

impl OrderEngine {
    pub fn new(
        pool: PgPool,
        payments: Arc<dyn PaymentVerifying>,
        executor: Arc<dyn OnchainExecuting>,
        delivery: Arc<dyn Delivering>,
        collaborator_timeout: Duration,
        task_max_attempts: i32,
    ) -> Self {
        Self {
            pool,
            payments,
            executor,
            delivery,
            collaborator_timeout,
            task_max_attempts,
        }
    }

    /// Pays a reservation from the user's balance. Reservation consumption,
    /// balance debit and order creation commit atomically or not at all; a
    /// crash mid-way leaves no debited balance without an order and no
    /// consumed reservation without an order.
    ///
    /// Replaying the request after success returns the already created
    /// order.
    pub async fn pay_with_balance(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
    ) -> Result<OrderId, PayError> {
        let now = Utc::now();
        let mut transaction = self.pool.begin().await?;
        let reservation = match database::reservations::consume(
            &mut transaction,
            reservation_id.0,
            user_id.as_str(),
            now,
        )
        .await?
        {
            Some(reservation) => reservation,
            None => {
                drop(transaction);
                return self.replay_or_not_payable(reservation_id, user_id).await;
            }
        };
        if !database::balances::try_debit(&mut transaction, user_id.as_str(), &reservation.price)
            .await?
        {
            // Dropping the transaction rolls the consumption back.
            return Err(PayError::InsufficientBalance);
        }
        let order_id = database::orders::insert(
            &mut transaction,
            reservation.id,
            user_id.as_str(),
            &reservation.item_id,
            &reservation.price,
            now,
        )
        .await?;
        transaction.commit().await?;

        Metrics::get().orders_created.inc();
        tracing::info!(order = order_id, reservation = reservation.id, "order paid from balance");
        Ok(OrderId(order_id))
    }

    /// Like [`Self::pay_with_balance`] but gated on an externally supplied
    /// payment proof instead of a balance debit.
    pub async fn confirm_external_payment(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
        proof: &str,
    ) -> Result<OrderId, PayError> {
        let now = Utc::now();
        let mut ex = self.pool.acquire().await?;
        let Some(reservation) = database::reservations::fetch(&mut ex, reservation_id.0).await?
        else {
            return Err(PayError::NotPayable);
        };
        drop(ex);

        let verified = tokio::time::timeout(
            self.collaborator_timeout,
            self.payments.verify(proof, &reservation.price, user_id),
        )
        .await
        .context("payment verifier timed out")?
        .context("payment verifier failed")?;
        if !verified {
            return Err(PayError::InvalidProof);
        }

        let mut transaction = self.pool.begin().await?;
        let reservation = match database::reservations::consume(
            &mut transaction,
            reservation_id.0,
            user_id.as_str(),
            now,
        )
        .await?
        {
            Some(reservation) => reservation,
            None => {
                drop(transaction);
                return self.replay_or_not_payable(reservation_id, user_id).await;
            }
        };
        let order_id = database::orders::insert(
            &mut transaction,
            reservation.id,
            user_id.as_str(),
            &reservation.item_id,
            &reservation.price,
            now,
        )
        .await?;
        transaction.commit().await?;

        Metrics::get().orders_created.inc();
        tracing::info!(order = order_id, reservation = reservation.id, "order paid externally");
        Ok(OrderId(order_id))
    }

    /// Moves a fresh order onto the fulfillment queue. The status flip and
    /// the task insert share a transaction (outbox); there is no window
    /// where a queued order has no task.
    pub async fn enqueue(&self, order_id: OrderId) -> Result<(), EnqueueError> {
        let now = Utc::now();
        let mut transaction = self.pool.begin().await?;
        if database::orders::fetch(&mut transaction, order_id.0).await?.is_none() {
            return Err(EnqueueError::NotFound);
        }
        if !database::orders::advance(
            &mut transaction,
            order_id.0,
            DbOrderStatus::Created,
            DbOrderStatus::Queued,
            now,
        )
        .await?
        {
            return Err(EnqueueError::NotReady);
        }
        database::tasks::insert(
            &mut transaction,
            TaskKind::Execute,
            order_id.0,
            now,
            self.task_max_attempts,
        )
        .await?;
        transaction.commit().await?;
        tracing::debug!(order = order_id.0, "order queued for execution");
        Ok(())
    }

    /// Runs the on-chain execution for a queued order. Exactly one caller
    /// wins the `queued → onchain_pending` flip; everyone else gets
    /// `NotReady`, which makes re-invocation (manual or via a redelivered
    /// task) safe.
    ///
    /// Failure is terminal for the order: the status becomes
    /// `onchain_fail` and the price is refunded to the buyer's balance in
    /// the same transaction.
    pub async fn execute(&self, order_id: OrderId) -> Result<(), ExecuteError> {
        let now = Utc::now();
        let mut ex = self.pool.acquire().await.context("acquire")?;
        let order = database::orders::fetch(&mut ex, order_id.0)
            .await
            .context("fetching order")?
            .ok_or(ExecuteError::NotFound)?;
        if !database::orders::advance(
            &mut ex,
            order_id.0,
            DbOrderStatus::Queued,
            DbOrderStatus::OnchainPending,
            now,
        )
        .await
        .context("claiming order")?
        {
            return Err(ExecuteError::NotReady);
        }
        drop(ex);

        let execution = match tokio::time::timeout(
            self.collaborator_timeout,
            self.executor
                .execute(&ItemId(order.item_id.clone()), &UserId(order.user_id.clone())),
        )
        .await
        {
            Ok(Ok(execution)) => execution,
            Ok(Err(err)) => {
                tracing::error!(order = order.id, ?err, "on-chain execution failed");
                self.fail_execution(&order).await?;
                return Err(ExecuteError::ExecutionFailed);
            }
            Err(_) => {
                tracing::error!(order = order.id, "on-chain execution timed out");
                self.fail_execution(&order).await?;
                return Err(ExecuteError::ExecutionFailed);
            }
        };

        let mut ex = self.pool.acquire().await.context("acquire")?;
        database::orders::record_execution(&mut ex, order.id, &execution.tx_ref, Utc::now())
            .await
            .context("recording execution")?;
        Metrics::get().executions_ok.inc();
        tracing::info!(order = order.id, tx_ref = %execution.tx_ref, "on-chain execution ok");
        Ok(())
    }

    /// Performs delivery for an executed order. Only `onchain_ok` orders
    /// are deliverable; anything else is "not ready".
    ///
    /// Delivery is at-least-once: the sink is called before the status
    /// flips, so two racing deliver tasks can both reach it before one of
    /// them wins the `onchain_ok → delivered` transition. [`Delivering`]
    /// implementations must tolerate the duplicate.
    pub async fn deliver(&self, order_id: OrderId) -> Result<(), DeliverError> {
        let mut ex = self.pool.acquire().await.context("acquire")?;
        let order = database::orders::fetch(&mut ex, order_id.0)
            .await
            .context("fetching order")?
            .ok_or(DeliverError::NotFound)?;
        if !matches!(order.status, DbOrderStatus::OnchainOk) {
            return Err(DeliverError::NotReady);
        }
        drop(ex);

        let order_model = from_db(order);
        tokio::time::timeout(
            self.collaborator_timeout,
            self.delivery.deliver(&order_model),
        )
        .await
        .context("delivery timed out")?
        .context("delivery failed")?;

        let mut ex = self.pool.acquire().await.context("acquire")?;
        if database::orders::advance(
            &mut ex,
            order_id.0,
            DbOrderStatus::OnchainOk,
            DbOrderStatus::Delivered,
            Utc::now(),
        )
        .await
        .context("finishing delivery")?
        {
            Metrics::get().orders_delivered.inc();
            tracing::info!(order = order_id.0, "order delivered");
        }
        Ok(())
    }

    /// Owner-scoped order lookup.
    pub async fn get(
        &self,
        order_id: OrderId,
        user_id: &UserId,
    ) -> Result<Option<Order>, sqlx::Error> {
        let mut ex = self.pool.acquire().await?;
        let order = database::orders::fetch_for_user(&mut ex, order_id.0, user_id.as_str()).await?;
        Ok(order.map(from_db))
    }

    /// Terminal failure bookkeeping: `onchain_fail` plus the compensating
    /// refund, committed together.
    async fn fail_execution(&self, order: &database::orders::Order) -> Result<()> {
        let mut transaction = self.pool.begin().await?;
        let failed = database::orders::advance(
            &mut transaction,
            order.id,
            DbOrderStatus::OnchainPending,
            DbOrderStatus::OnchainFail,
            Utc::now(),
        )
        .await?;
        if failed {
            database::balances::credit(&mut transaction, &order.user_id, &order.price).await?;
            Metrics::get().executions_failed.inc();
            Metrics::get().refunds_issued.inc();
        }
        transaction.commit().await?;
        if failed {
            tracing::warn!(
                order = order.id,
                user = %order.user_id,
                "execution failed terminally, price refunded to balance"
            );
        }
        Ok(())
    }

    /// Duplicate pay submissions answer with the order the first submission
    /// produced, everything else is a conflict.
    async fn replay_or_not_payable(
        &self,
        reservation_id: ReservationId,
        user_id: &UserId,
    ) -> Result<OrderId, PayError> {
        let mut ex = self.pool.acquire().await?;
        match database::orders::by_reservation(&mut ex, reservation_id.0).await? {
            Some(order) if order.user_id == user_id.as_str() => Ok(OrderId(order.id)),
            _ => Err(PayError::NotPayable),
        }
    }
}

pub(crate) fn from_db(row: database::orders::Order) -> Order {
    Order {
        id: OrderId(row.id),
        reservation_id: ReservationId(row.reservation_id),
        user_id: UserId(row.user_id),
        item_id: ItemId(row.item_id),
        price: row.price,
        status: match row.status {
            DbOrderStatus::Created => OrderStatus::Created,
            DbOrderStatus::Queued => OrderStatus::Queued,
            DbOrderStatus::OnchainPending => OrderStatus::OnchainPending,
            DbOrderStatus::OnchainOk => OrderStatus::OnchainOk,
            DbOrderStatus::OnchainFail => OrderStatus::OnchainFail,
            DbOrderStatus::Delivered => OrderStatus::Delivered,
        },
        tx_ref: row.tx_ref,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}
