//! Payment intent model
//!
//! A payment intent is the local record of one gateway-tracked attempt to
//! collect money for a listing or an ad slot. Amounts are always integer
//! minor units.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{PaymentError, PaymentResult};

/// Lifecycle status of a payment intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresConfirmation,
    RequiresPaymentMethod,
    RequiresAction,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl IntentStatus {
    pub const NON_TERMINAL: [IntentStatus; 4] = [
        IntentStatus::RequiresConfirmation,
        IntentStatus::RequiresPaymentMethod,
        IntentStatus::RequiresAction,
        IntentStatus::Processing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::RequiresConfirmation => "requires_confirmation",
            IntentStatus::RequiresPaymentMethod => "requires_payment_method",
            IntentStatus::RequiresAction => "requires_action",
            IntentStatus::Processing => "processing",
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Failed => "failed",
            IntentStatus::Canceled => "canceled",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Succeeded | IntentStatus::Failed | IntentStatus::Canceled
        )
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requires_confirmation" => Ok(IntentStatus::RequiresConfirmation),
            "requires_payment_method" => Ok(IntentStatus::RequiresPaymentMethod),
            "requires_action" => Ok(IntentStatus::RequiresAction),
            "processing" => Ok(IntentStatus::Processing),
            "succeeded" => Ok(IntentStatus::Succeeded),
            "failed" => Ok(IntentStatus::Failed),
            "canceled" => Ok(IntentStatus::Canceled),
            other => Err(PaymentError::Internal(format!(
                "unknown intent status: {other}"
            ))),
        }
    }
}

/// The domain object a payment pays for
///
/// A payment activates at most one thing, so the listing and ad-slot links
/// are variants rather than two nullable columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Listing(i64),
    AdSlot(i64),
    #[default]
    None,
}

impl Target {
    /// Split into the `(target_kind, target_id)` column pair
    pub fn to_columns(self) -> (Option<&'static str>, Option<i64>) {
        match self {
            Target::Listing(id) => (Some("listing"), Some(id)),
            Target::AdSlot(id) => (Some("ad_slot"), Some(id)),
            Target::None => (None, None),
        }
    }

    pub fn from_columns(kind: Option<&str>, id: Option<i64>) -> PaymentResult<Self> {
        match (kind, id) {
            (Some("listing"), Some(id)) => Ok(Target::Listing(id)),
            (Some("ad_slot"), Some(id)) => Ok(Target::AdSlot(id)),
            (None, None) => Ok(Target::None),
            (kind, id) => Err(PaymentError::Internal(format!(
                "inconsistent target columns: kind={kind:?} id={id:?}"
            ))),
        }
    }

    pub fn is_some(&self) -> bool {
        !matches!(self, Target::None)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Listing(id) => write!(f, "listing#{id}"),
            Target::AdSlot(id) => write!(f, "ad_slot#{id}"),
            Target::None => f.write_str("none"),
        }
    }
}

/// Validated ISO-style three letter currency code, upper case
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> PaymentResult<Self> {
        let code = code.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PaymentError::InvalidInput(format!(
                "currency must be a 3-letter code, got {code:?}"
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who asked for the payment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<String>,
    pub email: Option<String>,
}

/// A persisted payment intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub amount_cents: i64,
    pub currency: Currency,
    pub status: IntentStatus,
    pub description: String,
    pub target: Target,
    pub actor: Actor,
    pub metadata: BTreeMap<String, String>,
    pub last_error: Option<String>,
    pub confirmation_attempts: i32,
    pub side_effect_fired: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub side_effect_fired_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl PaymentIntent {
    /// Succeeded, has a target, and the activation has not been recorded
    pub fn side_effect_pending(&self) -> bool {
        self.status == IntentStatus::Succeeded && self.target.is_some() && !self.side_effect_fired
    }

    /// The part of the row the state machine decides on
    pub fn snapshot(&self) -> IntentSnapshot {
        IntentSnapshot {
            status: self.status,
            confirmation_attempts: self.confirmation_attempts,
            has_target: self.target.is_some(),
            side_effect_fired: self.side_effect_fired,
        }
    }
}

/// Decision-relevant view of a payment intent, also the CAS predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentSnapshot {
    pub status: IntentStatus,
    pub confirmation_attempts: i32,
    pub has_target: bool,
    pub side_effect_fired: bool,
}

/// Insert payload for a freshly created gateway intent
#[derive(Debug, Clone)]
pub struct NewPaymentIntent {
    pub intent_id: String,
    pub amount_cents: i64,
    pub currency: Currency,
    pub status: IntentStatus,
    pub description: String,
    pub target: Target,
    pub actor: Actor,
    pub metadata: BTreeMap<String, String>,
}
