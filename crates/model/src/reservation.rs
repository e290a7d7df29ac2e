use {
    crate::{ItemId, UserId, round::RoundId},
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
pub struct ReservationId(pub i64);

/// `Pending` reservations are live purchase rights. Consuming one (payment
/// or explicit cancellation) makes it `Cancelled`; the sweeper turns overdue
/// ones `Expired`. Neither terminal state is reusable.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum ReservationStatus {
    #[default]
    Pending,
    Cancelled,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub round_id: RoundId,
    pub item_id: ItemId,
    pub user_id: UserId,
    pub price: BigDecimal,
    pub status: ReservationStatus,
    /// Opaque token the winner presents to the payment flow.
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
