//! Subscription plans, billing cycles and credit packs
//!
//! Every plan/cycle pair maps to a fixed credit bonus and list price. The
//! mapping is a single exhaustive `match`, so adding a plan or cycle fails to
//! compile until its terms are defined.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BillingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Premium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Annual,
}

/// What a plan/cycle pair grants. Prices live on the Stripe price objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanTerms {
    /// Credits granted once when the subscription starts
    pub bonus_credits: i64,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Premium => "premium",
        }
    }

    pub fn terms(self, cycle: BillingCycle) -> PlanTerms {
        match (self, cycle) {
            (Plan::Premium, BillingCycle::Monthly) => PlanTerms { bonus_credits: 150 },
            (Plan::Premium, BillingCycle::Annual) => PlanTerms { bonus_credits: 1800 },
        }
    }
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Annual => "annual",
        }
    }
}

/// One-time credit bundles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditPack {
    Small,
    Medium,
    Large,
}

impl CreditPack {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditPack::Small => "small",
            CreditPack::Medium => "medium",
            CreditPack::Large => "large",
        }
    }

    pub fn credits(self) -> i64 {
        match self {
            CreditPack::Small => 50,
            CreditPack::Medium => 150,
            CreditPack::Large => 400,
        }
    }
}

impl FromStr for Plan {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "premium" => Ok(Plan::Premium),
            other => Err(BillingError::InvalidInput(format!("Unknown plan '{}'", other))),
        }
    }
}

impl FromStr for BillingCycle {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(BillingCycle::Monthly),
            "annual" | "yearly" | "year" => Ok(BillingCycle::Annual),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown billing cycle '{}'",
                other
            ))),
        }
    }
}

impl FromStr for CreditPack {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(CreditPack::Small),
            "medium" => Ok(CreditPack::Medium),
            "large" => Ok(CreditPack::Large),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown credit pack '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for CreditPack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
