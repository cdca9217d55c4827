use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Classification outcome for one address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Verdict {
    Valid,
    Invalid,
    Risky,
    CatchAll,
    Unknown,
}

/// Where a classification request originated. Both paths debit the same
/// workspace ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerificationSource {
    Bulk,
    Single,
}

/// One address in a bulk job payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddressTask {
    #[garde(email)]
    pub email: String,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<Uuid>,
}

impl AddressTask {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            lead_id: None,
        }
    }
}

/// Append-only record of how one address was classified within a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddressResult {
    pub email: String,
    pub lead_id: Option<Uuid>,
    pub verdict: Verdict,
    pub credits_used: i32,
}
