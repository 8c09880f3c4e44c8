//! Recurring product definitions.
//!
//! A charge plan bills a customer `price_cents * quantity` every
//! `plan_interval`; a payout plan sweeps a customer's processor balance down
//! to `balance_to_keep_cents` every `payout_interval`. Plans are owned by a
//! company and identified by a company-scoped external id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, Result};
use crate::interval::Interval;

/// A recurring charge product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargePlan {
    /// Internal identifier.
    pub id: Uuid,
    /// Owning company.
    pub company_id: String,
    /// Company-scoped external identifier, unique per company.
    pub external_id: String,
    /// Display name.
    pub name: String,
    /// Price per unit quantity, in cents.
    pub price_cents: i64,
    /// Length of one billing cycle.
    pub plan_interval: Interval,
    /// Optional free period granted to first-time subscribers.
    pub trial_interval: Option<Interval>,
    /// Whether new subscriptions are accepted.
    pub active: bool,
    /// When the plan was disabled, if it was.
    pub disabled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ChargePlan {
    /// Create a new charge plan, validating its configuration.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a negative price and `BadInterval` for a zero
    /// plan or trial interval.
    pub fn new(
        company_id: impl Into<String>,
        external_id: impl Into<String>,
        name: impl Into<String>,
        price_cents: i64,
        plan_interval: Interval,
        trial_interval: Option<Interval>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if price_cents < 0 {
            return Err(BillingError::validation("price_cents must not be negative"));
        }
        if plan_interval.is_zero() {
            return Err(BillingError::bad_interval("plan interval must not be zero"));
        }
        if let Some(trial) = &trial_interval {
            if trial.is_zero() {
                return Err(BillingError::bad_interval(
                    "trial interval must not be zero; omit it instead",
                ));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            company_id: company_id.into(),
            external_id: external_id.into(),
            name: name.into(),
            price_cents,
            plan_interval,
            trial_interval,
            active: true,
            disabled_at: None,
            created_at: now,
        })
    }

    /// Stop accepting new subscriptions. Existing subscriptions keep running
    /// until their own cancellation.
    pub fn disable(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.disabled_at = Some(now);
    }
}

/// A recurring payout product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutPlan {
    /// Internal identifier.
    pub id: Uuid,
    /// Owning company.
    pub company_id: String,
    /// Company-scoped external identifier, unique per company.
    pub external_id: String,
    /// Display name.
    pub name: String,
    /// Balance left with the processor after each payout, in cents.
    pub balance_to_keep_cents: i64,
    /// Length of one payout cycle.
    pub payout_interval: Interval,
    /// Whether new subscriptions are accepted.
    pub active: bool,
    /// When the plan was disabled, if it was.
    pub disabled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PayoutPlan {
    /// Create a new payout plan, validating its configuration.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a negative keep amount and `BadInterval` for
    /// a zero payout interval.
    pub fn new(
        company_id: impl Into<String>,
        external_id: impl Into<String>,
        name: impl Into<String>,
        balance_to_keep_cents: i64,
        payout_interval: Interval,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if balance_to_keep_cents < 0 {
            return Err(BillingError::validation(
                "balance_to_keep_cents must not be negative",
            ));
        }
        if payout_interval.is_zero() {
            return Err(BillingError::bad_interval(
                "payout interval must not be zero",
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            company_id: company_id.into(),
            external_id: external_id.into(),
            name: name.into(),
            balance_to_keep_cents,
            payout_interval,
            active: true,
            disabled_at: None,
            created_at: now,
        })
    }

    /// Stop accepting new subscriptions. Existing subscriptions keep running
    /// until their own cancellation.
    pub fn disable(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.disabled_at = Some(now);
    }
}
