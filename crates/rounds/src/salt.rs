use {anyhow::Result, chrono::Utc};

/// Public randomness consumed at round close. The salt must come from a
/// source the operator does not control alone (a recent block hash, a
/// randomness beacon) so that neither party can steer the combined value
/// after the commitment was published.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SaltSource: Send + Sync {
    async fn latest_salt(&self) -> Result<String>;
}

/// Deterministic stand-in used when the salt source is unavailable or times
/// out. Closing must never block indefinitely on an external dependency;
/// the fallback is public information (wall-clock seconds), which keeps the
/// operator bound by its commitment even though the salt entropy degrades.
pub fn fallback_salt() -> String {
    format!("fallback:{}", Utc::now().timestamp())
}

/// Salt source deriving its value from coarse wall-clock buckets. Used by
/// deployments without a beacon integration; the bucket width means racing
/// closers observe the same salt.
pub struct BlockClock {
    pub bucket_seconds: i64,
}

#[async_trait::async_trait]
impl SaltSource for BlockClock {
    async fn latest_salt(&self) -> Result<String> {
        let bucket = Utc::now().timestamp() / self.bucket_seconds.max(1);
        Ok(format!("clock:{bucket}"))
    }
}
