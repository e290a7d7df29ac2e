use {
    crate::UserId,
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
pub struct RoundId(pub i64);

/// A round is `Open` from creation until its close time, then flips exactly
/// once to `Revealed` and never changes again.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum RoundStatus {
    #[default]
    Open,
    Revealed,
}

/// Membership tier of a participant. Higher tiers get a larger selection
/// weight, multiplicative over the base weight of 1.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Tier {
    #[default]
    Standard,
    Premium,
    Elite,
}

impl Tier {
    pub fn weight(&self) -> f64 {
        match self {
            Self::Standard => 1.0,
            Self::Premium => 1.25,
            Self::Elite => 1.5,
        }
    }
}

/// The full reveal of a closed round. Published so that anyone can recompute
/// the commitment and the winner selection.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Reveal {
    /// Hex-encoded operator secret, committed to at round creation.
    pub secret: String,
    /// Salt obtained from the public randomness source at close.
    pub salt: String,
    /// HMAC of the salt under the secret; drives winner selection.
    pub combined: String,
}

/// What a participant gets back when asking for a closed round's outcome.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub caught: bool,
    pub reveal: Reveal,
}

/// Returned from a join so the client can display the countdown and hold on
/// to the commitment for later verification.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JoinOutcome {
    pub round_id: RoundId,
    pub closes_at: DateTime<Utc>,
    pub commitment: String,
}

/// Read-only aggregate over a round, for dashboards.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundStats {
    pub status: RoundStatus,
    pub entries: u64,
    pub entries_by_tier: Vec<(Tier, u64)>,
    pub total_weight: f64,
    pub winners: Vec<UserId>,
}
