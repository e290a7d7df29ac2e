//! The order engine: converts a paid reservation into an order and drives
//! it through the execute/deliver state machine.

pub mod collaborators;
pub mod engine;

pub use {
    collaborators::{Delivering, Execution, OnchainExecuting, PaymentVerifying},
    engine::{DeliverError, EnqueueError, ExecuteError, OrderEngine, PayError},
};
