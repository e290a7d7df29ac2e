use {
    crate::manager::ReservationManager,
    std::{sync::Arc, time::Duration},
};

/// Recurring sweep moving overdue pending reservations to expired. The
/// sweep itself is a single bulk conditional update, so overlapping runs
/// (or an admin-triggered sweep racing this loop) cannot double-expire.
pub struct SweepLoop {
    pub manager: Arc<ReservationManager>,
    pub poll_interval: Duration,
}

impl SweepLoop {
    pub async fn run_forever(self) -> ! {
        loop {
            if let Err(err) = self.manager.expire_stale().await {
                tracing::error!(?err, "reservation sweep failed");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
