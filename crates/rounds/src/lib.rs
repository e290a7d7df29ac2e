//! Round lifecycle: admission, commit-reveal closing and weighted winner
//! selection.
//!
//! A round is created on the first join attempt for an item, stays open for
//! a fixed window and is closed either by the background [`close_loop`] or
//! lazily by the first result query after its close time. Both triggers
//! funnel into the same conditional database update, so whichever fires
//! first performs the single reveal and the other becomes a no-op.

pub mod close_loop;
pub mod manager;
pub mod salt;
pub mod selection;

pub use {
    close_loop::CloseLoop,
    manager::{CloseError, JoinError, ResultError, RoundManager, StatsError},
    salt::{BlockClock, SaltSource},
};
