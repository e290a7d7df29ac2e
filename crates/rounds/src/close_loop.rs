use {
    crate::manager::RoundManager,
    std::{sync::Arc, time::Duration},
};

/// How many due rounds a single tick works off at most.
const CLOSE_BATCH: i64 = 50;

/// Background trigger for round closing. The loop never owns correctness:
/// a lost tick (restart, stall) is covered by the lazy close in
/// `RoundManager::result`, and both funnel into the same conditional
/// update, so double-firing is harmless.
pub struct CloseLoop {
    pub manager: Arc<RoundManager>,
    pub poll_interval: Duration,
}

impl CloseLoop {
    pub async fn run_forever(self) -> ! {
        loop {
            match self.manager.close_due(CLOSE_BATCH).await {
                Ok(0) => (),
                Ok(closed) => tracing::debug!(closed, "close loop tick"),
                Err(err) => tracing::error!(?err, "close loop tick failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
