//! Subscription entities binding one customer to one plan.
//!
//! At most one renewing subscription may exist per (customer, plan) pair;
//! the store enforces this. Re-subscribing a pair reactivates the existing
//! row rather than creating a duplicate, so a pair has exactly one
//! subscription for its whole history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A customer's enrollment in a charge plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeSubscription {
    /// Internal identifier.
    pub id: Uuid,
    /// Owning plan.
    pub plan_id: Uuid,
    /// Customer reference, opaque to the engine.
    pub customer_id: String,
    /// Coupon applied to this enrollment's invoices, if any.
    pub coupon_id: Option<Uuid>,
    /// Cleared when settlement retries are exhausted.
    pub is_active: bool,
    /// Cleared by proration; a new subscribe call re-enrolls.
    pub is_enrolled: bool,
    /// Whether rollover generates the next cycle's invoice.
    pub should_renew: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChargeSubscription {
    /// Create a fresh enrollment.
    #[must_use]
    pub fn new(plan_id: Uuid, customer_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id,
            customer_id: customer_id.into(),
            coupon_id: None,
            is_active: true,
            is_enrolled: true,
            should_renew: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether rollover should generate this subscription's next invoice.
    #[must_use]
    pub fn is_renewing(&self) -> bool {
        self.is_active && self.is_enrolled && self.should_renew
    }

    /// Re-enroll a previously cancelled or deactivated subscription.
    pub fn reactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = true;
        self.is_enrolled = true;
        self.should_renew = true;
        self.updated_at = now;
    }

    /// Stop renewing after settlement retries are exhausted.
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.updated_at = now;
    }

    /// Leave the plan; set by proration when the period is cut short.
    pub fn unenroll(&mut self, now: DateTime<Utc>) {
        self.is_enrolled = false;
        self.should_renew = false;
        self.updated_at = now;
    }
}

/// A customer's enrollment in a payout plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutSubscription {
    /// Internal identifier.
    pub id: Uuid,
    /// Owning plan.
    pub plan_id: Uuid,
    /// Customer reference, opaque to the engine.
    pub customer_id: String,
    /// Cleared when settlement retries are exhausted.
    pub is_active: bool,
    /// Cleared when the customer leaves the plan.
    pub is_enrolled: bool,
    /// Whether rollover generates the next cycle's invoice.
    pub should_renew: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PayoutSubscription {
    /// Create a fresh enrollment.
    #[must_use]
    pub fn new(plan_id: Uuid, customer_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id,
            customer_id: customer_id.into(),
            is_active: true,
            is_enrolled: true,
            should_renew: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether rollover should generate this subscription's next invoice.
    #[must_use]
    pub fn is_renewing(&self) -> bool {
        self.is_active && self.is_enrolled && self.should_renew
    }

    /// Re-enroll a previously cancelled or deactivated subscription.
    pub fn reactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = true;
        self.is_enrolled = true;
        self.should_renew = true;
        self.updated_at = now;
    }

    /// Stop renewing after settlement retries are exhausted.
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.updated_at = now;
    }

    /// Leave the plan.
    pub fn unenroll(&mut self, now: DateTime<Utc>) {
        self.is_enrolled = false;
        self.should_renew = false;
        self.updated_at = now;
    }
}
