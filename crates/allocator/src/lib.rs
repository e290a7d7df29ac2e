pub mod arguments;
pub mod collaborators;

use {
    collaborators::{HttpDelivery, HttpExecutor, HttpPayments},
    fulfillment::{Worker, WorkerPool},
    observe::metrics::LivenessChecking,
    orders::OrderEngine,
    reservations::{ReservationManager, SweepLoop},
    rounds::{BlockClock, CloseLoop, RoundManager},
    sqlx::PgPool,
    std::sync::Arc,
};

struct Liveness;

#[async_trait::async_trait]
impl LivenessChecking for Liveness {
    async fn is_alive(&self) -> bool {
        true
    }
}

pub async fn main(args: arguments::Arguments) {
    let pool = PgPool::connect_lazy(args.db_url.as_str()).expect("failed to create database pool");
    if args.apply_schema {
        let mut ex = pool
            .acquire()
            .await
            .expect("failed to connect to the database");
        database::initialize_schema(&mut ex)
            .await
            .expect("failed to apply the schema");
    }

    let client = reqwest::Client::new();
    let engine = Arc::new(OrderEngine::new(
        pool.clone(),
        Arc::new(
            HttpPayments::new(client.clone(), &args.payment_verifier_url)
                .expect("invalid payment verifier url"),
        ),
        Arc::new(
            HttpExecutor::new(client.clone(), &args.executor_url).expect("invalid executor url"),
        ),
        Arc::new(HttpDelivery::new(client, &args.delivery_url).expect("invalid delivery url")),
        args.collaborator_timeout,
        args.task_max_attempts,
    ));
    let rounds = Arc::new(RoundManager::new(
        pool.clone(),
        Arc::new(BlockClock {
            bucket_seconds: args.salt_bucket_seconds,
        }),
        args.round_window,
        args.salt_timeout,
    ));
    let reservations = Arc::new(ReservationManager::new(pool.clone(), args.reservation_ttl));

    observe::metrics::serve_metrics(Arc::new(Liveness), args.metrics_address);
    tokio::spawn(
        CloseLoop {
            manager: rounds,
            poll_interval: args.close_poll_interval,
        }
        .run_forever(),
    );
    tokio::spawn(
        SweepLoop {
            manager: reservations,
            poll_interval: args.sweep_interval,
        }
        .run_forever(),
    );
    WorkerPool {
        worker: Worker {
            pool,
            engine,
            poll_interval: args.worker_poll_interval,
            visibility: args.task_visibility,
            backoff_base: args.task_backoff_base,
        },
        count: args.worker_count,
    }
    .spawn();

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("ctrl-c received, shutting down");
}
