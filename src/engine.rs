//! The billing engine facade.
//!
//! [`BillingEngine`] wires the coupon engine and both plan lifecycles over a
//! shared store and processor, and exposes the batch entry points an external
//! scheduler drives. Every batch operation is safe to invoke repeatedly: a
//! second run over the same state is a no-op.

use chrono::{DateTime, Utc};

use crate::charge::ChargeLifecycle;
use crate::config::Config;
use crate::coupon::CouponEngine;
use crate::error::Result;
use crate::payout::PayoutLifecycle;
use crate::processor::PaymentProcessor;
use crate::storage::BillingStore;
use crate::transaction::Transaction;

/// Facade over the full billing lifecycle.
///
/// A scheduler tick typically runs, in order: [`expire_coupons`], then
/// [`settle_all_charge_plan_debt`] and [`generate_all_invoices`], then
/// [`make_all_payouts`] and [`reinvoice_payouts`], and finally
/// [`find_stalled_transactions`] for alerting.
///
/// [`expire_coupons`]: Self::expire_coupons
/// [`settle_all_charge_plan_debt`]: Self::settle_all_charge_plan_debt
/// [`generate_all_invoices`]: Self::generate_all_invoices
/// [`make_all_payouts`]: Self::make_all_payouts
/// [`reinvoice_payouts`]: Self::reinvoice_payouts
/// [`find_stalled_transactions`]: Self::find_stalled_transactions
pub struct BillingEngine<S, P> {
    coupons: CouponEngine<S>,
    charges: ChargeLifecycle<S, P>,
    payouts: PayoutLifecycle<S, P>,
    store: S,
    config: Config,
}

impl<S, P> BillingEngine<S, P>
where
    S: BillingStore + Clone,
    P: PaymentProcessor + Clone,
{
    /// Assemble the engine over a store and processor.
    pub fn new(store: S, processor: P, config: Config) -> Self {
        Self {
            coupons: CouponEngine::new(store.clone()),
            charges: ChargeLifecycle::new(
                store.clone(),
                processor.clone(),
                config.billing.clone(),
            ),
            payouts: PayoutLifecycle::new(store.clone(), processor, config.billing.clone()),
            store,
            config,
        }
    }

    /// Coupon creation and lookup.
    pub fn coupons(&self) -> &CouponEngine<S> {
        &self.coupons
    }

    /// Charge plan management, enrollment, and proration.
    pub fn charges(&self) -> &ChargeLifecycle<S, P> {
        &self.charges
    }

    /// Payout plan management and enrollment.
    pub fn payouts(&self) -> &PayoutLifecycle<S, P> {
        &self.payouts
    }

    /// Deactivate every coupon whose expiry has passed. Returns the number
    /// of coupons deactivated.
    pub async fn expire_coupons(&self, now: DateTime<Utc>) -> Result<usize> {
        self.coupons.expire_coupons(now).await
    }

    /// Collect every charge invoice due at or before `now`. Returns the
    /// number of invoices examined.
    pub async fn settle_all_charge_plan_debt(&self, now: DateTime<Utc>) -> Result<usize> {
        self.charges.settle_all(now).await
    }

    /// Generate next-cycle charge invoices for settled ones flagged for
    /// rollover. Returns the number of invoices examined.
    pub async fn generate_all_invoices(&self, now: DateTime<Utc>) -> Result<usize> {
        self.charges.reinvoice_all(now).await
    }

    /// Run every payout sweep due at or before `now`. Returns the number of
    /// invoices examined.
    pub async fn make_all_payouts(&self, now: DateTime<Utc>) -> Result<usize> {
        self.payouts.settle_all(now).await
    }

    /// Schedule next-cycle sweeps for settled payout invoices flagged for
    /// rollover. Returns the number of invoices examined.
    pub async fn reinvoice_payouts(&self, now: DateTime<Utc>) -> Result<usize> {
        self.payouts.reinvoice_all(now).await
    }

    /// Report transactions still PENDING past the configured age.
    ///
    /// A transaction is created PENDING immediately before its processor
    /// call and finalized immediately after, so an old PENDING row means a
    /// crash mid-call: the money may or may not have moved, and the row
    /// needs reconciliation against the processor's records. This only
    /// reports; it never mutates.
    pub async fn find_stalled_transactions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let stalled_after = self.config.billing.stalled_after;
        let pending = self.store.list_pending_transactions_before(now).await?;
        let stalled: Vec<Transaction> = pending
            .into_iter()
            .filter(|txn| {
                stalled_after
                    .add_to(txn.created_at)
                    .is_some_and(|deadline| deadline <= now)
            })
            .collect();
        for txn in &stalled {
            tracing::warn!(
                transaction = %txn.id,
                customer = %txn.customer_id,
                amount = txn.amount_cents,
                created_at = %txn.created_at,
                "transaction stalled in PENDING; reconcile against processor records"
            );
        }
        Ok(stalled)
    }
}
