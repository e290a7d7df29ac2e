//! External collaborators of the order engine. All of them are opaque to
//! this system: slow, fallible, and owned by other services.

use {
    anyhow::Result,
    bigdecimal::BigDecimal,
    model::{ItemId, UserId, order::Order},
};

/// Validates externally supplied proof of payment (an on-chain transfer, a
/// PSP receipt) for a given amount and payer.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PaymentVerifying: Send + Sync {
    async fn verify(&self, proof: &str, amount: &BigDecimal, payer: &UserId) -> Result<bool>;
}

/// Outcome of a successful on-chain execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Execution {
    pub tx_ref: String,
}

/// Performs the on-chain side of fulfillment (mint or transfer of the
/// item). Non-deterministic and occasionally slow; an `Err` is terminal for
/// the order.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait OnchainExecuting: Send + Sync {
    async fn execute(&self, item_id: &ItemId, recipient: &UserId) -> Result<Execution>;
}

/// Completes fulfillment towards the user once the on-chain part landed
/// (wallet notification, unlock of the purchased content).
///
/// May be invoked more than once for the same order, by retries and by
/// racing workers. Implementations must be idempotent per order.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Delivering: Send + Sync {
    async fn deliver(&self, order: &Order) -> Result<()>;
}
