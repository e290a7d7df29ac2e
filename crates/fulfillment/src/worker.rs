use {
    anyhow::Result,
    chrono::{DateTime, Utc},
    database::tasks::{Task, TaskKind},
    model::order::OrderId,
    orders::{DeliverError, ExecuteError, OrderEngine},
    sqlx::PgPool,
    std::{sync::Arc, time::Duration},
};

#[derive(prometheus_metric_storage::MetricStorage, Clone, Debug)]
#[metric(subsystem = "fulfillment")]
struct Metrics {
    /// Number of tasks finished successfully.
    tasks_done: prometheus::IntCounter,
    /// Number of task attempts rescheduled for a retry.
    tasks_retried: prometheus::IntCounter,
    /// Number of tasks dropped (attempt budget exhausted or obsolete).
    tasks_dropped: prometheus::IntCounter,
    /// Execute tasks redelivered over an order stuck in `onchain_pending`.
    /// Those orders need an operator to settle the execution outcome.
    stuck_executions: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

/// What a processed task should happen to.
#[derive(Debug, Eq, PartialEq)]
enum Disposition {
    Done,
    Retry,
    Drop,
}

#[derive(Clone)]
pub struct Worker {
    pub pool: PgPool,
    pub engine: Arc<OrderEngine>,
    /// Dequeue poll interval; each tick processes at most one task.
    pub poll_interval: Duration,
    /// How long a claimed task stays invisible to other workers. Must
    /// comfortably exceed the engine's collaborator timeout or a slow
    /// execution gets claimed twice.
    pub visibility: Duration,
    /// First retry delay; doubles per failed attempt.
    pub backoff_base: Duration,
}

impl Worker {
    pub async fn run_forever(self) -> ! {
        loop {
            match self.process_one(Utc::now()).await {
                // Something was processed; immediately look for more work.
                Ok(true) => continue,
                Ok(false) => (),
                Err(err) => tracing::error!(?err, "worker tick failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Claims and dispatches at most one visible task. Returns whether a
    /// task was processed.
    async fn process_one(&self, now: DateTime<Utc>) -> Result<bool> {
        let mut ex = self.pool.acquire().await?;
        let visibility = chrono::Duration::from_std(self.visibility)
            .expect("visibility timeout fits a chrono duration");
        let Some(task) = database::tasks::dequeue(&mut ex, now, visibility).await? else {
            return Ok(false);
        };
        drop(ex);

        let disposition = match task.kind {
            TaskKind::Execute => self.run_execute(&task).await?,
            TaskKind::Deliver => self.run_deliver(&task).await?,
        };

        let mut ex = self.pool.acquire().await?;
        match disposition {
            Disposition::Done => {
                database::tasks::delete(&mut ex, task.id).await?;
                Metrics::get().tasks_done.inc();
            }
            Disposition::Retry if task.attempts >= task.max_attempts => {
                database::tasks::delete(&mut ex, task.id).await?;
                Metrics::get().tasks_dropped.inc();
                tracing::error!(
                    task = task.id,
                    order = task.order_id,
                    kind = ?task.kind,
                    attempts = task.attempts,
                    "task exhausted its attempts and was dropped"
                );
            }
            Disposition::Retry => {
                let delay = self.backoff(task.attempts);
                database::tasks::reschedule(&mut ex, task.id, now + delay).await?;
                Metrics::get().tasks_retried.inc();
                tracing::warn!(
                    task = task.id,
                    order = task.order_id,
                    kind = ?task.kind,
                    attempts = task.attempts,
                    ?delay,
                    "task failed, retrying after backoff"
                );
            }
            Disposition::Drop => {
                database::tasks::delete(&mut ex, task.id).await?;
                Metrics::get().tasks_dropped.inc();
            }
        }
        Ok(true)
    }

    /// Drives the execute stage. A successful execution immediately chains
    /// the deliver stage onto the queue.
    async fn run_execute(&self, task: &Task) -> Result<Disposition> {
        match self.engine.execute(OrderId(task.order_id)).await {
            Ok(()) => {
                self.enqueue_delivery(task).await?;
                Ok(Disposition::Done)
            }
            // Terminal for the order; the task has nothing left to do.
            Err(ExecuteError::ExecutionFailed) => Ok(Disposition::Done),
            Err(ExecuteError::NotReady) => {
                // Redelivered task for an order that already moved on.
                let mut ex = self.pool.acquire().await?;
                match database::orders::fetch(&mut ex, task.order_id).await? {
                    // Execution landed but the worker died before chaining
                    // the delivery; chain it now.
                    Some(order)
                        if matches!(order.status, database::orders::OrderStatus::OnchainOk) =>
                    {
                        self.enqueue_delivery(task).await?;
                        Ok(Disposition::Drop)
                    }
                    // A crash mid-execution left the order claimed with an
                    // unknown onchain outcome. The task cannot settle it;
                    // keep retrying until the budget drops it loudly so an
                    // operator resolves the order.
                    Some(order)
                        if matches!(
                            order.status,
                            database::orders::OrderStatus::OnchainPending
                        ) =>
                    {
                        Metrics::get().stuck_executions.inc();
                        tracing::error!(
                            order = task.order_id,
                            "execute task over an order with an unresolved execution"
                        );
                        Ok(Disposition::Retry)
                    }
                    _ => Ok(Disposition::Drop),
                }
            }
            Err(ExecuteError::NotFound) => {
                tracing::warn!(order = task.order_id, "execute task for unknown order");
                Ok(Disposition::Drop)
            }
            // Infrastructure trouble (database, pool); worth retrying.
            Err(ExecuteError::Other(err)) => {
                tracing::warn!(order = task.order_id, ?err, "execute attempt failed");
                Ok(Disposition::Retry)
            }
        }
    }

    async fn run_deliver(&self, task: &Task) -> Result<Disposition> {
        match self.engine.deliver(OrderId(task.order_id)).await {
            Ok(()) => Ok(Disposition::Done),
            Err(DeliverError::NotReady) => {
                tracing::warn!(order = task.order_id, "deliver task for undeliverable order");
                Ok(Disposition::Drop)
            }
            Err(DeliverError::NotFound) => Ok(Disposition::Drop),
            Err(DeliverError::Other(err)) => {
                tracing::warn!(order = task.order_id, ?err, "deliver attempt failed");
                Ok(Disposition::Retry)
            }
        }
    }

    async fn enqueue_delivery(&self, task: &Task) -> Result<()> {
        let mut ex = self.pool.acquire().await?;
        database::tasks::insert(
            &mut ex,
            TaskKind::Deliver,
            task.order_id,
            Utc::now(),
            task.max_attempts,
        )
        .await?;
        Ok(())
    }

    fn backoff(&self, attempts: i32) -> chrono::Duration {
        let factor = 2u32.saturating_pow(attempts.max(1) as u32 - 1).min(64);
        chrono::Duration::from_std(self.backoff_base * factor)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600))
    }
}

/// Spawns `count` workers polling the shared queue. `SKIP LOCKED` claiming
/// keeps them from stepping on each other.
pub struct WorkerPool {
    pub worker: Worker,
    pub count: usize,
}

impl WorkerPool {
    pub fn spawn(self) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.count.max(1))
            .map(|i| {
                let worker = self.worker.clone();
                tokio::spawn(async move {
                    tracing::info!(worker = i, "fulfillment worker started");
                    worker.run_forever().await
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        bigdecimal::BigDecimal,
        model::{
            ItemId, UserId,
            order::OrderStatus,
            reservation::ReservationId,
        },
        orders::{Delivering, Execution, OnchainExecuting, PaymentVerifying},
        std::{
            str::FromStr,
            sync::atomic::{AtomicU32, Ordering},
        },
    };

    struct NoPayments;

    #[async_trait::async_trait]
    impl PaymentVerifying for NoPayments {
        async fn verify(&self, _: &str, _: &BigDecimal, _: &UserId) -> Result<bool> {
            Ok(false)
        }
    }

    struct OkExecutor;

    #[async_trait::async_trait]
    impl OnchainExecuting for OkExecutor {
        async fn execute(&self, _: &ItemId, _: &UserId) -> Result<Execution> {
            Ok(Execution {
                tx_ref: "0xtx".to_string(),
            })
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyDelivery {
        failures: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Delivering for FlakyDelivery {
        async fn deliver(&self, _: &model::order::Order) -> Result<()> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            })
            .is_ok()
            {
                anyhow::bail!("delivery hiccup");
            }
            Ok(())
        }
    }

    async fn pool() -> PgPool {
        let pool = PgPool::connect("postgresql://").await.unwrap();
        database::clear_DANGER(&pool).await.unwrap();
        pool
    }

    async fn paid_order(pool: &PgPool, engine: &OrderEngine) -> model::order::OrderId {
        let mut ex = pool.acquire().await.unwrap();
        let now = Utc::now();
        let price = BigDecimal::from_str("0.5").unwrap();
        let round = database::rounds::insert(&mut ex, "drop-1", now, now, "c", "s")
            .await
            .unwrap();
        let reservation = database::reservations::insert(
            &mut ex,
            round,
            "drop-1",
            "alice",
            &price,
            "tok",
            now + chrono::Duration::seconds(90),
            now,
        )
        .await
        .unwrap();
        database::balances::credit(&mut ex, "alice", &price).await.unwrap();
        engine
            .pay_with_balance(ReservationId(reservation.id), &UserId::from("alice"))
            .await
            .unwrap()
    }

    fn worker(pool: PgPool, delivery_failures: u32) -> Worker {
        let engine = Arc::new(OrderEngine::new(
            pool.clone(),
            Arc::new(NoPayments),
            Arc::new(OkExecutor),
            Arc::new(FlakyDelivery {
                failures: AtomicU32::new(delivery_failures),
            }),
            Duration::from_secs(5),
            3,
        ));
        Worker {
            pool,
            engine,
            poll_interval: Duration::from_millis(100),
            visibility: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_execute_chains_delivery() {
        let pool = pool().await;
        let worker = worker(pool.clone(), 0);
        let order = paid_order(&pool, &worker.engine).await;
        worker.engine.enqueue(order).await.unwrap();

        let now = Utc::now();
        // One task per tick: execute, then the chained deliver.
        assert!(worker.process_one(now).await.unwrap());
        let mid = worker
            .engine
            .get(order, &UserId::from("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mid.status, OrderStatus::OnchainOk);

        assert!(worker.process_one(now).await.unwrap());
        assert!(!worker.process_one(now).await.unwrap());

        let done = worker
            .engine
            .get(order, &UserId::from("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, OrderStatus::Delivered);
        assert_eq!(done.tx_ref.as_deref(), Some("0xtx"));
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_failed_delivery_retries_with_backoff() {
        let pool = pool().await;
        let worker = worker(pool.clone(), 1);
        let order = paid_order(&pool, &worker.engine).await;
        worker.engine.enqueue(order).await.unwrap();

        let now = Utc::now();
        assert!(worker.process_one(now).await.unwrap());
        // First delivery attempt fails and is backed off, not dropped.
        assert!(worker.process_one(now).await.unwrap());
        assert!(!worker.process_one(now).await.unwrap());
        let stuck = worker
            .engine
            .get(order, &UserId::from("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stuck.status, OrderStatus::OnchainOk);

        // After the backoff the retry succeeds.
        let later = now + chrono::Duration::seconds(2);
        assert!(worker.process_one(later).await.unwrap());
        let done = worker
            .engine
            .get(order, &UserId::from("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, OrderStatus::Delivered);
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_stuck_pending_order_keeps_task_until_budget() {
        let pool = pool().await;
        let worker = worker(pool.clone(), 0);
        let order = paid_order(&pool, &worker.engine).await;
        worker.engine.enqueue(order).await.unwrap();

        // A previous worker claimed the order and crashed before the
        // executor answered.
        let mut ex = pool.acquire().await.unwrap();
        assert!(database::orders::advance(
            &mut ex,
            order.0,
            database::orders::OrderStatus::Queued,
            database::orders::OrderStatus::OnchainPending,
            Utc::now(),
        )
        .await
        .unwrap());
        drop(ex);

        // The redelivered task cannot settle the execution; it is retried
        // until the budget drops it, never silently swallowed.
        let mut now = Utc::now();
        for _ in 0..3 {
            assert!(worker.process_one(now).await.unwrap());
            now += chrono::Duration::seconds(3600);
        }
        assert!(!worker.process_one(now).await.unwrap());

        let parked = worker
            .engine
            .get(order, &UserId::from("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.status, OrderStatus::OnchainPending);
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_task_budget_is_finite() {
        let pool = pool().await;
        // Delivery never succeeds within the budget of 3 attempts.
        let worker = worker(pool.clone(), u32::MAX);
        let order = paid_order(&pool, &worker.engine).await;
        worker.engine.enqueue(order).await.unwrap();

        let mut now = Utc::now();
        assert!(worker.process_one(now).await.unwrap());
        for _ in 0..3 {
            now += chrono::Duration::seconds(3600);
            assert!(worker.process_one(now).await.unwrap());
        }
        // Budget exhausted; the queue is empty, the order parked in
        // `onchain_ok` for manual redelivery.
        now += chrono::Duration::seconds(3600);
        assert!(!worker.process_one(now).await.unwrap());
        let parked = worker
            .engine
            .get(order, &UserId::from("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.status, OrderStatus::OnchainOk);
    }
}
