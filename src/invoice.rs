//! Invoice entities, one per billing cycle.
//!
//! A charge invoice tracks the money owed for one cycle of a charge plan; a
//! payout invoice records one scheduled balance sweep. Invoices are created
//! at subscribe time or by rollover, mutated in place by proration and
//! settlement under an optimistic version lock, and never deleted outside of
//! cascading plan deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One billing cycle's financial record for a charge subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeInvoice {
    /// Internal identifier.
    pub id: Uuid,
    /// Owning subscription.
    pub subscription_id: Uuid,
    /// Customer reference, denormalized for processor calls.
    pub customer_id: String,
    /// Period start.
    pub start_dt: DateTime<Utc>,
    /// Period end; moved to the proration instant when cut short.
    pub end_dt: DateTime<Utc>,
    /// Period end as originally invoiced.
    pub original_end_dt: DateTime<Utc>,
    /// When settlement becomes due.
    pub due_dt: DateTime<Utc>,
    /// Plan price times quantity, before discounts.
    pub amount_base_cents: i64,
    /// Amount owed after the coupon, if any.
    pub amount_after_coupon_cents: i64,
    /// Amount collected so far.
    pub amount_paid_cents: i64,
    /// Amount still owed; zero exactly when the invoice is completed.
    pub remaining_balance_cents: i64,
    /// Units of the plan price billed.
    pub quantity: u32,
    /// Position in the subscription's invoice chain, starting at 1.
    pub cycle: u32,
    /// Whether the period was cut short and the amounts rescaled.
    pub prorated: bool,
    /// Whether a trial period extended this cycle.
    pub includes_trial: bool,
    /// Whether settlement was deferred to the period end.
    pub charge_at_period_end: bool,
    /// Whether the balance has been fully collected.
    pub completed: bool,
    /// Whether rollover should generate the next cycle from this invoice.
    pub queue_rollover: bool,
    /// Failed settlement attempts so far.
    pub attempts_made: u32,
    /// The settling transaction, linked once the charge clears.
    pub transaction_id: Option<Uuid>,
    /// Optimistic lock; bumped by every compare-and-save.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl ChargeInvoice {
    /// Whether the invoice is still open: its period has not been closed by
    /// settlement or proration.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.completed && !self.prorated
    }

    /// Record a successful charge of the remaining balance.
    pub fn record_payment(&mut self, transaction_id: Uuid) {
        self.amount_paid_cents += self.remaining_balance_cents;
        self.remaining_balance_cents = 0;
        self.completed = true;
        // Prorated cycles are continued by an explicit re-subscribe, never by
        // rollover.
        self.queue_rollover = !self.prorated;
        self.transaction_id = Some(transaction_id);
    }

    /// Record a failed settlement attempt.
    pub fn record_failure(&mut self) {
        self.attempts_made += 1;
    }
}

/// One payout cycle's record for a payout subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutInvoice {
    /// Internal identifier.
    pub id: Uuid,
    /// Owning subscription.
    pub subscription_id: Uuid,
    /// Customer reference, denormalized for processor calls.
    pub customer_id: String,
    /// Period start.
    pub start_dt: DateTime<Utc>,
    /// Period end.
    pub end_dt: DateTime<Utc>,
    /// Period end as originally invoiced.
    pub original_end_dt: DateTime<Utc>,
    /// When the sweep becomes due.
    pub payout_date: DateTime<Utc>,
    /// Balance left with the processor after the sweep.
    pub balance_to_keep_cents: i64,
    /// Amount actually paid out at settlement.
    pub amount_paid_out: i64,
    /// Processor balance observed at settlement time.
    pub balance_at_exec: Option<i64>,
    /// Whether the sweep has run.
    pub completed: bool,
    /// Whether rollover should generate the next cycle from this invoice.
    pub queue_rollover: bool,
    /// Failed settlement attempts so far.
    pub attempts_made: u32,
    /// The settling transaction, linked once the payout clears.
    pub transaction_id: Option<Uuid>,
    /// Optimistic lock; bumped by every compare-and-save.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl PayoutInvoice {
    /// Whether the sweep is still pending.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.completed
    }

    /// Record a completed sweep.
    ///
    /// `transaction_id` is absent when the observed balance was at or below
    /// the keep amount, in which case no money moved.
    pub fn record_payout(
        &mut self,
        balance_at_exec: i64,
        amount_paid_out: i64,
        transaction_id: Option<Uuid>,
    ) {
        self.balance_at_exec = Some(balance_at_exec);
        self.amount_paid_out = amount_paid_out;
        self.completed = true;
        self.queue_rollover = true;
        self.transaction_id = transaction_id;
    }

    /// Record a failed settlement attempt.
    pub fn record_failure(&mut self) {
        self.attempts_made += 1;
    }
}
