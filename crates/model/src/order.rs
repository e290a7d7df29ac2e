use {
    crate::{ItemId, UserId, reservation::ReservationId},
    bigdecimal::BigDecimal,
    chrono::{DateTime, Utc},
    derive_more::{Display, From, Into},
    serde::{Deserialize, Serialize},
    strum::EnumString,
};

#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    From,
    Into,
    Serialize,
    Deserialize,
)]
pub struct OrderId(pub i64);

/// Order fulfillment state machine. Transitions are strictly forward:
///
/// `created → queued → onchain_pending → {onchain_ok | onchain_fail}`,
/// `onchain_ok → delivered`.
///
/// `Delivered` and `OnchainFail` are terminal.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive, serialize_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Created,
    Queued,
    OnchainPending,
    OnchainOk,
    OnchainFail,
    Delivered,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::OnchainFail)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub reservation_id: ReservationId,
    pub user_id: UserId,
    pub item_id: ItemId,
    pub price: BigDecimal,
    pub status: OrderStatus,
    /// Reference returned by the on-chain executor, populated once the
    /// execution succeeded.
    pub tx_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(OrderStatus::Delivered.is_terminal());
        assert!(OrderStatus::OnchainFail.is_terminal());
        assert!(!OrderStatus::OnchainOk.is_terminal());
        assert!(!OrderStatus::Created.is_terminal());
    }

    #[test]
    fn status_wire_format() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::OnchainPending).unwrap(),
            "\"onchain_pending\""
        );
    }
}
