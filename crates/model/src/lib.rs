//! Domain types shared by every component of the allocation pipeline.
//!
//! These contain only what the round, reservation and order machinery needs
//! to talk to each other; anything persistence-specific lives in the
//! `database` crate and anything transport-specific in the (out of scope)
//! API layer.

pub mod order;
pub mod reservation;
pub mod round;

use {
    derive_more::{Display, From, Into},
    serde::{Deserialize, Serialize},
};

/// Identifies the scarce item a round allocates, e.g. a drop slug or a
/// collection/token identifier. Opaque to this system.
#[derive(
    Clone, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash, From, Into, Serialize, Deserialize,
)]
pub struct ItemId(pub String);

/// Identifies a user across rounds, reservations, orders and balances.
/// Assigned by the (out of scope) auth layer.
#[derive(
    Clone, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash, From, Into, Serialize, Deserialize,
)]
pub struct UserId(pub String);

impl ItemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
