//! Storage trait for billing state.
//!
//! Implement [`BillingStore`] to persist billing state to your database. The
//! [`memory`] module provides an in-memory implementation for tests and
//! local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::coupon::Coupon;
use crate::error::Result;
use crate::invoice::{ChargeInvoice, PayoutInvoice};
use crate::plan::{ChargePlan, PayoutPlan};
use crate::subscription::{ChargeSubscription, PayoutSubscription};
use crate::transaction::Transaction;

/// Persistence seam for every billing entity.
///
/// Batch queries return rows in a stable order (due timestamp, then id) so
/// repeated scheduler runs walk entities deterministically.
#[async_trait]
pub trait BillingStore: Send + Sync {
    // Coupons

    /// Get a coupon by its company-scoped external id.
    async fn get_coupon(&self, company_id: &str, external_id: &str) -> Result<Option<Coupon>>;

    /// Get a coupon by internal id.
    async fn get_coupon_by_id(&self, id: Uuid) -> Result<Option<Coupon>>;

    /// Persist a new coupon. Fails with `AlreadyExists` when the company
    /// already has a coupon under this external id.
    async fn create_coupon(&self, coupon: &Coupon) -> Result<()>;

    /// Save an existing coupon.
    async fn save_coupon(&self, coupon: &Coupon) -> Result<()>;

    /// All still-active coupons whose expiry has passed, ordered by expiry
    /// then id.
    async fn list_expired_active_coupons(&self, now: DateTime<Utc>) -> Result<Vec<Coupon>>;

    // Charge plans

    /// Get a charge plan by its company-scoped external id.
    async fn get_charge_plan(
        &self,
        company_id: &str,
        external_id: &str,
    ) -> Result<Option<ChargePlan>>;

    /// Get a charge plan by internal id.
    async fn get_charge_plan_by_id(&self, id: Uuid) -> Result<Option<ChargePlan>>;

    /// Persist a new charge plan. Fails with `AlreadyExists` when the
    /// company already has a plan under this external id.
    async fn create_charge_plan(&self, plan: &ChargePlan) -> Result<()>;

    /// Save an existing charge plan.
    async fn save_charge_plan(&self, plan: &ChargePlan) -> Result<()>;

    /// Delete a charge plan together with its subscriptions and their
    /// invoices. Transactions are kept as an audit trail.
    async fn delete_charge_plan(&self, id: Uuid) -> Result<()>;

    // Payout plans

    /// Get a payout plan by its company-scoped external id.
    async fn get_payout_plan(
        &self,
        company_id: &str,
        external_id: &str,
    ) -> Result<Option<PayoutPlan>>;

    /// Get a payout plan by internal id.
    async fn get_payout_plan_by_id(&self, id: Uuid) -> Result<Option<PayoutPlan>>;

    /// Persist a new payout plan. Fails with `AlreadyExists` when the
    /// company already has a plan under this external id.
    async fn create_payout_plan(&self, plan: &PayoutPlan) -> Result<()>;

    /// Save an existing payout plan.
    async fn save_payout_plan(&self, plan: &PayoutPlan) -> Result<()>;

    /// Delete a payout plan together with its subscriptions and their
    /// invoices. Transactions are kept as an audit trail.
    async fn delete_payout_plan(&self, id: Uuid) -> Result<()>;

    // Charge subscriptions

    /// Get the subscription linking a plan and a customer, preferring a row
    /// that is still set to renew.
    async fn get_charge_subscription(
        &self,
        plan_id: Uuid,
        customer_id: &str,
    ) -> Result<Option<ChargeSubscription>>;

    /// Get a charge subscription by internal id.
    async fn get_charge_subscription_by_id(&self, id: Uuid)
        -> Result<Option<ChargeSubscription>>;

    /// Persist a new charge subscription. At most one renewing subscription
    /// may exist per (plan, customer) pair; a second renewing row fails with
    /// `AlreadyExists`.
    async fn create_charge_subscription(&self, subscription: &ChargeSubscription) -> Result<()>;

    /// Save an existing charge subscription.
    async fn save_charge_subscription(&self, subscription: &ChargeSubscription) -> Result<()>;

    // Payout subscriptions

    /// Get the subscription linking a plan and a customer, preferring a row
    /// that is still set to renew.
    async fn get_payout_subscription(
        &self,
        plan_id: Uuid,
        customer_id: &str,
    ) -> Result<Option<PayoutSubscription>>;

    /// Get a payout subscription by internal id.
    async fn get_payout_subscription_by_id(&self, id: Uuid)
        -> Result<Option<PayoutSubscription>>;

    /// Persist a new payout subscription. At most one renewing subscription
    /// may exist per (plan, customer) pair; a second renewing row fails with
    /// `AlreadyExists`.
    async fn create_payout_subscription(&self, subscription: &PayoutSubscription) -> Result<()>;

    /// Save an existing payout subscription.
    async fn save_payout_subscription(&self, subscription: &PayoutSubscription) -> Result<()>;

    // Charge invoices

    /// Get a charge invoice by id.
    async fn get_charge_invoice(&self, id: Uuid) -> Result<Option<ChargeInvoice>>;

    /// Persist a new charge invoice.
    async fn create_charge_invoice(&self, invoice: &ChargeInvoice) -> Result<()>;

    /// Save a charge invoice unconditionally. Prefer
    /// [`compare_and_save_charge_invoice`](Self::compare_and_save_charge_invoice)
    /// for settlement-path mutations.
    async fn save_charge_invoice(&self, invoice: &ChargeInvoice) -> Result<()>;

    /// Save a charge invoice only if the stored row still carries
    /// `expected_version`. On success the stored row carries
    /// `expected_version + 1`.
    ///
    /// Returns `Ok(true)` if the save happened and `Ok(false)` on a version
    /// mismatch, in which case the caller re-reads and retries.
    ///
    /// # Important: Production Implementations MUST Override This
    ///
    /// The default implementation has a time-of-check to time-of-use race
    /// and is only suitable for single-threaded development scenarios.
    /// Production implementations MUST override it with an atomic
    /// compare-and-swap, e.g. PostgreSQL:
    ///
    /// ```sql
    /// UPDATE charge_invoices
    /// SET ..., version = version + 1
    /// WHERE id = $1 AND version = $2
    /// RETURNING id
    /// ```
    ///
    /// If the query returns a row, the save succeeded.
    async fn compare_and_save_charge_invoice(
        &self,
        invoice: &ChargeInvoice,
        expected_version: u64,
    ) -> Result<bool> {
        // WARNING: not atomic. A concurrent writer can slip in between the
        // read and the save.
        #[cfg(debug_assertions)]
        {
            static WARNED: std::sync::atomic::AtomicBool =
                std::sync::atomic::AtomicBool::new(false);
            if !WARNED.swap(true, std::sync::atomic::Ordering::Relaxed) {
                tracing::warn!(
                    target: "rebill::storage",
                    "Using default non-atomic compare_and_save_charge_invoice implementation. \
                     This is NOT safe for production use with concurrent settlement runs. \
                     Override this method with an atomic compare-and-swap operation."
                );
            }
        }

        if let Some(current) = self.get_charge_invoice(invoice.id).await? {
            if current.version != expected_version {
                return Ok(false);
            }
        }
        let mut bumped = invoice.clone();
        bumped.version = expected_version + 1;
        self.save_charge_invoice(&bumped).await?;
        Ok(true)
    }

    /// The latest open invoice for a subscription, if any.
    async fn get_open_charge_invoice(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<ChargeInvoice>>;

    /// All uncompleted charge invoices due at or before `now`, ordered by
    /// due timestamp then id.
    async fn list_due_charge_invoices(&self, now: DateTime<Utc>) -> Result<Vec<ChargeInvoice>>;

    /// All completed charge invoices still flagged for rollover, ordered by
    /// period end then id.
    async fn list_rollover_charge_invoices(&self) -> Result<Vec<ChargeInvoice>>;

    /// Every invoice of a subscription, ordered by period start then id.
    async fn list_charge_invoices_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<ChargeInvoice>>;

    // Payout invoices

    /// Get a payout invoice by id.
    async fn get_payout_invoice(&self, id: Uuid) -> Result<Option<PayoutInvoice>>;

    /// Persist a new payout invoice.
    async fn create_payout_invoice(&self, invoice: &PayoutInvoice) -> Result<()>;

    /// Save a payout invoice unconditionally. Prefer
    /// [`compare_and_save_payout_invoice`](Self::compare_and_save_payout_invoice)
    /// for settlement-path mutations.
    async fn save_payout_invoice(&self, invoice: &PayoutInvoice) -> Result<()>;

    /// Save a payout invoice only if the stored row still carries
    /// `expected_version`. On success the stored row carries
    /// `expected_version + 1`.
    ///
    /// The same atomicity caveat as
    /// [`compare_and_save_charge_invoice`](Self::compare_and_save_charge_invoice)
    /// applies: override this in production implementations.
    async fn compare_and_save_payout_invoice(
        &self,
        invoice: &PayoutInvoice,
        expected_version: u64,
    ) -> Result<bool> {
        #[cfg(debug_assertions)]
        {
            static WARNED: std::sync::atomic::AtomicBool =
                std::sync::atomic::AtomicBool::new(false);
            if !WARNED.swap(true, std::sync::atomic::Ordering::Relaxed) {
                tracing::warn!(
                    target: "rebill::storage",
                    "Using default non-atomic compare_and_save_payout_invoice implementation. \
                     This is NOT safe for production use with concurrent settlement runs. \
                     Override this method with an atomic compare-and-swap operation."
                );
            }
        }

        if let Some(current) = self.get_payout_invoice(invoice.id).await? {
            if current.version != expected_version {
                return Ok(false);
            }
        }
        let mut bumped = invoice.clone();
        bumped.version = expected_version + 1;
        self.save_payout_invoice(&bumped).await?;
        Ok(true)
    }

    /// The latest open invoice for a subscription, if any.
    async fn get_open_payout_invoice(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<PayoutInvoice>>;

    /// All uncompleted payout invoices due at or before `now`, ordered by
    /// payout date then id.
    async fn list_due_payout_invoices(&self, now: DateTime<Utc>) -> Result<Vec<PayoutInvoice>>;

    /// All completed payout invoices still flagged for rollover, ordered by
    /// payout date then id.
    async fn list_rollover_payout_invoices(&self) -> Result<Vec<PayoutInvoice>>;

    /// Every invoice of a subscription, ordered by period start then id.
    async fn list_payout_invoices_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<PayoutInvoice>>;

    // Transactions

    /// Get a transaction by id.
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>>;

    /// Persist a new transaction.
    async fn create_transaction(&self, transaction: &Transaction) -> Result<()>;

    /// Save an existing transaction.
    async fn save_transaction(&self, transaction: &Transaction) -> Result<()>;

    /// All transactions still pending that were created at or before
    /// `cutoff`, ordered by creation time then id.
    async fn list_pending_transactions_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>>;
}

/// In-memory billing store.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    use crate::error::BillingError;
    use crate::transaction::TransactionStatus;

    /// In-memory [`BillingStore`] for tests and local development.
    ///
    /// Wraps its data in an `Arc` for cheap cloning; clones share state.
    #[derive(Default, Clone)]
    pub struct InMemoryStore {
        inner: Arc<InMemoryStoreInner>,
    }

    #[derive(Default)]
    struct InMemoryStoreInner {
        coupons: RwLock<HashMap<Uuid, Coupon>>,
        charge_plans: RwLock<HashMap<Uuid, ChargePlan>>,
        payout_plans: RwLock<HashMap<Uuid, PayoutPlan>>,
        charge_subscriptions: RwLock<HashMap<Uuid, ChargeSubscription>>,
        payout_subscriptions: RwLock<HashMap<Uuid, PayoutSubscription>>,
        charge_invoices: RwLock<HashMap<Uuid, ChargeInvoice>>,
        payout_invoices: RwLock<HashMap<Uuid, PayoutInvoice>>,
        transactions: RwLock<HashMap<Uuid, Transaction>>,
    }

    impl InMemoryStore {
        /// Create a new empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All transactions ordered by creation time (for tests).
        #[must_use]
        pub fn all_transactions(&self) -> Vec<Transaction> {
            let mut rows: Vec<Transaction> = self
                .inner
                .transactions
                .read()
                .unwrap()
                .values()
                .cloned()
                .collect();
            rows.sort_by_key(|t| (t.created_at, t.id));
            rows
        }
    }

    #[async_trait]
    impl BillingStore for InMemoryStore {
        async fn get_coupon(
            &self,
            company_id: &str,
            external_id: &str,
        ) -> Result<Option<Coupon>> {
            Ok(self
                .inner
                .coupons
                .read()
                .unwrap()
                .values()
                .find(|c| c.company_id == company_id && c.external_id == external_id)
                .cloned())
        }

        async fn get_coupon_by_id(&self, id: Uuid) -> Result<Option<Coupon>> {
            Ok(self.inner.coupons.read().unwrap().get(&id).cloned())
        }

        async fn create_coupon(&self, coupon: &Coupon) -> Result<()> {
            let mut coupons = self.inner.coupons.write().unwrap();
            if coupons
                .values()
                .any(|c| c.company_id == coupon.company_id && c.external_id == coupon.external_id)
            {
                return Err(BillingError::already_exists(
                    "coupon",
                    coupon.external_id.clone(),
                ));
            }
            coupons.insert(coupon.id, coupon.clone());
            Ok(())
        }

        async fn save_coupon(&self, coupon: &Coupon) -> Result<()> {
            self.inner
                .coupons
                .write()
                .unwrap()
                .insert(coupon.id, coupon.clone());
            Ok(())
        }

        async fn list_expired_active_coupons(&self, now: DateTime<Utc>) -> Result<Vec<Coupon>> {
            let coupons = self.inner.coupons.read().unwrap();
            let mut expired: Vec<Coupon> = coupons
                .values()
                .filter(|c| c.active && c.is_expired(now))
                .cloned()
                .collect();
            expired.sort_by_key(|c| (c.expire_at, c.id));
            Ok(expired)
        }

        async fn get_charge_plan(
            &self,
            company_id: &str,
            external_id: &str,
        ) -> Result<Option<ChargePlan>> {
            Ok(self
                .inner
                .charge_plans
                .read()
                .unwrap()
                .values()
                .find(|p| p.company_id == company_id && p.external_id == external_id)
                .cloned())
        }

        async fn get_charge_plan_by_id(&self, id: Uuid) -> Result<Option<ChargePlan>> {
            Ok(self.inner.charge_plans.read().unwrap().get(&id).cloned())
        }

        async fn create_charge_plan(&self, plan: &ChargePlan) -> Result<()> {
            let mut plans = self.inner.charge_plans.write().unwrap();
            if plans
                .values()
                .any(|p| p.company_id == plan.company_id && p.external_id == plan.external_id)
            {
                return Err(BillingError::already_exists(
                    "charge plan",
                    plan.external_id.clone(),
                ));
            }
            plans.insert(plan.id, plan.clone());
            Ok(())
        }

        async fn save_charge_plan(&self, plan: &ChargePlan) -> Result<()> {
            self.inner
                .charge_plans
                .write()
                .unwrap()
                .insert(plan.id, plan.clone());
            Ok(())
        }

        async fn delete_charge_plan(&self, id: Uuid) -> Result<()> {
            // Lock order: plans, subscriptions, invoices.
            let mut plans = self.inner.charge_plans.write().unwrap();
            let mut subscriptions = self.inner.charge_subscriptions.write().unwrap();
            let mut invoices = self.inner.charge_invoices.write().unwrap();

            plans.remove(&id);
            let owned: HashSet<Uuid> = subscriptions
                .values()
                .filter(|s| s.plan_id == id)
                .map(|s| s.id)
                .collect();
            subscriptions.retain(|_, s| s.plan_id != id);
            invoices.retain(|_, i| !owned.contains(&i.subscription_id));
            Ok(())
        }

        async fn get_payout_plan(
            &self,
            company_id: &str,
            external_id: &str,
        ) -> Result<Option<PayoutPlan>> {
            Ok(self
                .inner
                .payout_plans
                .read()
                .unwrap()
                .values()
                .find(|p| p.company_id == company_id && p.external_id == external_id)
                .cloned())
        }

        async fn get_payout_plan_by_id(&self, id: Uuid) -> Result<Option<PayoutPlan>> {
            Ok(self.inner.payout_plans.read().unwrap().get(&id).cloned())
        }

        async fn create_payout_plan(&self, plan: &PayoutPlan) -> Result<()> {
            let mut plans = self.inner.payout_plans.write().unwrap();
            if plans
                .values()
                .any(|p| p.company_id == plan.company_id && p.external_id == plan.external_id)
            {
                return Err(BillingError::already_exists(
                    "payout plan",
                    plan.external_id.clone(),
                ));
            }
            plans.insert(plan.id, plan.clone());
            Ok(())
        }

        async fn save_payout_plan(&self, plan: &PayoutPlan) -> Result<()> {
            self.inner
                .payout_plans
                .write()
                .unwrap()
                .insert(plan.id, plan.clone());
            Ok(())
        }

        async fn delete_payout_plan(&self, id: Uuid) -> Result<()> {
            let mut plans = self.inner.payout_plans.write().unwrap();
            let mut subscriptions = self.inner.payout_subscriptions.write().unwrap();
            let mut invoices = self.inner.payout_invoices.write().unwrap();

            plans.remove(&id);
            let owned: HashSet<Uuid> = subscriptions
                .values()
                .filter(|s| s.plan_id == id)
                .map(|s| s.id)
                .collect();
            subscriptions.retain(|_, s| s.plan_id != id);
            invoices.retain(|_, i| !owned.contains(&i.subscription_id));
            Ok(())
        }

        async fn get_charge_subscription(
            &self,
            plan_id: Uuid,
            customer_id: &str,
        ) -> Result<Option<ChargeSubscription>> {
            let subscriptions = self.inner.charge_subscriptions.read().unwrap();
            Ok(subscriptions
                .values()
                .filter(|s| s.plan_id == plan_id && s.customer_id == customer_id)
                .max_by_key(|s| (s.should_renew, s.created_at, s.id))
                .cloned())
        }

        async fn get_charge_subscription_by_id(
            &self,
            id: Uuid,
        ) -> Result<Option<ChargeSubscription>> {
            Ok(self
                .inner
                .charge_subscriptions
                .read()
                .unwrap()
                .get(&id)
                .cloned())
        }

        async fn create_charge_subscription(
            &self,
            subscription: &ChargeSubscription,
        ) -> Result<()> {
            let mut subscriptions = self.inner.charge_subscriptions.write().unwrap();
            if subscription.should_renew
                && subscriptions.values().any(|s| {
                    s.plan_id == subscription.plan_id
                        && s.customer_id == subscription.customer_id
                        && s.should_renew
                })
            {
                return Err(BillingError::already_exists(
                    "charge subscription",
                    format!("{}:{}", subscription.plan_id, subscription.customer_id),
                ));
            }
            subscriptions.insert(subscription.id, subscription.clone());
            Ok(())
        }

        async fn save_charge_subscription(
            &self,
            subscription: &ChargeSubscription,
        ) -> Result<()> {
            self.inner
                .charge_subscriptions
                .write()
                .unwrap()
                .insert(subscription.id, subscription.clone());
            Ok(())
        }

        async fn get_payout_subscription(
            &self,
            plan_id: Uuid,
            customer_id: &str,
        ) -> Result<Option<PayoutSubscription>> {
            let subscriptions = self.inner.payout_subscriptions.read().unwrap();
            Ok(subscriptions
                .values()
                .filter(|s| s.plan_id == plan_id && s.customer_id == customer_id)
                .max_by_key(|s| (s.should_renew, s.created_at, s.id))
                .cloned())
        }

        async fn get_payout_subscription_by_id(
            &self,
            id: Uuid,
        ) -> Result<Option<PayoutSubscription>> {
            Ok(self
                .inner
                .payout_subscriptions
                .read()
                .unwrap()
                .get(&id)
                .cloned())
        }

        async fn create_payout_subscription(
            &self,
            subscription: &PayoutSubscription,
        ) -> Result<()> {
            let mut subscriptions = self.inner.payout_subscriptions.write().unwrap();
            if subscription.should_renew
                && subscriptions.values().any(|s| {
                    s.plan_id == subscription.plan_id
                        && s.customer_id == subscription.customer_id
                        && s.should_renew
                })
            {
                return Err(BillingError::already_exists(
                    "payout subscription",
                    format!("{}:{}", subscription.plan_id, subscription.customer_id),
                ));
            }
            subscriptions.insert(subscription.id, subscription.clone());
            Ok(())
        }

        async fn save_payout_subscription(
            &self,
            subscription: &PayoutSubscription,
        ) -> Result<()> {
            self.inner
                .payout_subscriptions
                .write()
                .unwrap()
                .insert(subscription.id, subscription.clone());
            Ok(())
        }

        async fn get_charge_invoice(&self, id: Uuid) -> Result<Option<ChargeInvoice>> {
            Ok(self.inner.charge_invoices.read().unwrap().get(&id).cloned())
        }

        async fn create_charge_invoice(&self, invoice: &ChargeInvoice) -> Result<()> {
            self.inner
                .charge_invoices
                .write()
                .unwrap()
                .insert(invoice.id, invoice.clone());
            Ok(())
        }

        async fn save_charge_invoice(&self, invoice: &ChargeInvoice) -> Result<()> {
            self.inner
                .charge_invoices
                .write()
                .unwrap()
                .insert(invoice.id, invoice.clone());
            Ok(())
        }

        async fn compare_and_save_charge_invoice(
            &self,
            invoice: &ChargeInvoice,
            expected_version: u64,
        ) -> Result<bool> {
            let mut invoices = self.inner.charge_invoices.write().unwrap();
            if let Some(current) = invoices.get(&invoice.id) {
                if current.version != expected_version {
                    return Ok(false);
                }
            }
            let mut bumped = invoice.clone();
            bumped.version = expected_version + 1;
            invoices.insert(bumped.id, bumped);
            Ok(true)
        }

        async fn get_open_charge_invoice(
            &self,
            subscription_id: Uuid,
        ) -> Result<Option<ChargeInvoice>> {
            let invoices = self.inner.charge_invoices.read().unwrap();
            Ok(invoices
                .values()
                .filter(|i| i.subscription_id == subscription_id && i.is_open())
                .max_by_key(|i| (i.start_dt, i.id))
                .cloned())
        }

        async fn list_due_charge_invoices(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<ChargeInvoice>> {
            let invoices = self.inner.charge_invoices.read().unwrap();
            let mut due: Vec<ChargeInvoice> = invoices
                .values()
                .filter(|i| !i.completed && i.due_dt <= now)
                .cloned()
                .collect();
            due.sort_by_key(|i| (i.due_dt, i.id));
            Ok(due)
        }

        async fn list_rollover_charge_invoices(&self) -> Result<Vec<ChargeInvoice>> {
            let invoices = self.inner.charge_invoices.read().unwrap();
            let mut rollover: Vec<ChargeInvoice> = invoices
                .values()
                .filter(|i| i.completed && i.queue_rollover)
                .cloned()
                .collect();
            rollover.sort_by_key(|i| (i.end_dt, i.id));
            Ok(rollover)
        }

        async fn list_charge_invoices_for_subscription(
            &self,
            subscription_id: Uuid,
        ) -> Result<Vec<ChargeInvoice>> {
            let invoices = self.inner.charge_invoices.read().unwrap();
            let mut rows: Vec<ChargeInvoice> = invoices
                .values()
                .filter(|i| i.subscription_id == subscription_id)
                .cloned()
                .collect();
            rows.sort_by_key(|i| (i.start_dt, i.id));
            Ok(rows)
        }

        async fn get_payout_invoice(&self, id: Uuid) -> Result<Option<PayoutInvoice>> {
            Ok(self.inner.payout_invoices.read().unwrap().get(&id).cloned())
        }

        async fn create_payout_invoice(&self, invoice: &PayoutInvoice) -> Result<()> {
            self.inner
                .payout_invoices
                .write()
                .unwrap()
                .insert(invoice.id, invoice.clone());
            Ok(())
        }

        async fn save_payout_invoice(&self, invoice: &PayoutInvoice) -> Result<()> {
            self.inner
                .payout_invoices
                .write()
                .unwrap()
                .insert(invoice.id, invoice.clone());
            Ok(())
        }

        async fn compare_and_save_payout_invoice(
            &self,
            invoice: &PayoutInvoice,
            expected_version: u64,
        ) -> Result<bool> {
            let mut invoices = self.inner.payout_invoices.write().unwrap();
            if let Some(current) = invoices.get(&invoice.id) {
                if current.version != expected_version {
                    return Ok(false);
                }
            }
            let mut bumped = invoice.clone();
            bumped.version = expected_version + 1;
            invoices.insert(bumped.id, bumped);
            Ok(true)
        }

        async fn get_open_payout_invoice(
            &self,
            subscription_id: Uuid,
        ) -> Result<Option<PayoutInvoice>> {
            let invoices = self.inner.payout_invoices.read().unwrap();
            Ok(invoices
                .values()
                .filter(|i| i.subscription_id == subscription_id && i.is_open())
                .max_by_key(|i| (i.start_dt, i.id))
                .cloned())
        }

        async fn list_due_payout_invoices(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<PayoutInvoice>> {
            let invoices = self.inner.payout_invoices.read().unwrap();
            let mut due: Vec<PayoutInvoice> = invoices
                .values()
                .filter(|i| !i.completed && i.payout_date <= now)
                .cloned()
                .collect();
            due.sort_by_key(|i| (i.payout_date, i.id));
            Ok(due)
        }

        async fn list_rollover_payout_invoices(&self) -> Result<Vec<PayoutInvoice>> {
            let invoices = self.inner.payout_invoices.read().unwrap();
            let mut rollover: Vec<PayoutInvoice> = invoices
                .values()
                .filter(|i| i.completed && i.queue_rollover)
                .cloned()
                .collect();
            rollover.sort_by_key(|i| (i.payout_date, i.id));
            Ok(rollover)
        }

        async fn list_payout_invoices_for_subscription(
            &self,
            subscription_id: Uuid,
        ) -> Result<Vec<PayoutInvoice>> {
            let invoices = self.inner.payout_invoices.read().unwrap();
            let mut rows: Vec<PayoutInvoice> = invoices
                .values()
                .filter(|i| i.subscription_id == subscription_id)
                .cloned()
                .collect();
            rows.sort_by_key(|i| (i.start_dt, i.id));
            Ok(rows)
        }

        async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
            Ok(self.inner.transactions.read().unwrap().get(&id).cloned())
        }

        async fn create_transaction(&self, transaction: &Transaction) -> Result<()> {
            self.inner
                .transactions
                .write()
                .unwrap()
                .insert(transaction.id, transaction.clone());
            Ok(())
        }

        async fn save_transaction(&self, transaction: &Transaction) -> Result<()> {
            self.inner
                .transactions
                .write()
                .unwrap()
                .insert(transaction.id, transaction.clone());
            Ok(())
        }

        async fn list_pending_transactions_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<Transaction>> {
            let transactions = self.inner.transactions.read().unwrap();
            let mut pending: Vec<Transaction> = transactions
                .values()
                .filter(|t| t.status == TransactionStatus::Pending && t.created_at <= cutoff)
                .cloned()
                .collect();
            pending.sort_by_key(|t| (t.created_at, t.id));
            Ok(pending)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryStore;
    use super::*;
    use crate::coupon::CouponTerms;
    use crate::error::BillingError;
    use crate::interval::Interval;
    use crate::transaction::TransactionKind;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
    }

    fn charge_invoice(subscription_id: Uuid, due_dt: DateTime<Utc>) -> ChargeInvoice {
        let start = ts(2025, 1, 1);
        ChargeInvoice {
            id: Uuid::new_v4(),
            subscription_id,
            customer_id: "cust_1".to_string(),
            start_dt: start,
            end_dt: due_dt,
            original_end_dt: due_dt,
            due_dt,
            amount_base_cents: 1000,
            amount_after_coupon_cents: 1000,
            amount_paid_cents: 0,
            remaining_balance_cents: 1000,
            quantity: 1,
            cycle: 1,
            prorated: false,
            includes_trial: false,
            charge_at_period_end: false,
            completed: false,
            queue_rollover: false,
            attempts_made: 0,
            transaction_id: None,
            version: 0,
            created_at: start,
        }
    }

    #[tokio::test]
    async fn test_coupon_uniqueness_is_company_scoped() {
        let store = InMemoryStore::new();
        let now = ts(2025, 1, 1);
        let acme = Coupon::new("acme", "SPRING10", "Spring", CouponTerms::new(), now).unwrap();
        let globex = Coupon::new("globex", "SPRING10", "Spring", CouponTerms::new(), now).unwrap();

        store.create_coupon(&acme).await.unwrap();
        store.create_coupon(&globex).await.unwrap();

        let duplicate =
            Coupon::new("acme", "SPRING10", "Spring again", CouponTerms::new(), now).unwrap();
        let err = store.create_coupon(&duplicate).await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_renewing_subscription_uniqueness_is_partial() {
        let store = InMemoryStore::new();
        let now = ts(2025, 1, 1);
        let plan_id = Uuid::new_v4();

        let renewing = ChargeSubscription::new(plan_id, "cust_1", now);
        store.create_charge_subscription(&renewing).await.unwrap();

        let second = ChargeSubscription::new(plan_id, "cust_1", now);
        let err = store.create_charge_subscription(&second).await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadyExists { .. }));

        // A cancelled historic row does not conflict.
        let mut cancelled = ChargeSubscription::new(plan_id, "cust_1", now);
        cancelled.should_renew = false;
        store.create_charge_subscription(&cancelled).await.unwrap();

        // Lookup prefers the row still set to renew.
        let found = store
            .get_charge_subscription(plan_id, "cust_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, renewing.id);
    }

    #[tokio::test]
    async fn test_compare_and_save_bumps_version() {
        let store = InMemoryStore::new();
        let invoice = charge_invoice(Uuid::new_v4(), ts(2025, 2, 1));
        store.create_charge_invoice(&invoice).await.unwrap();

        assert!(store
            .compare_and_save_charge_invoice(&invoice, 0)
            .await
            .unwrap());
        let stored = store.get_charge_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);

        // A writer holding the old version loses the race.
        assert!(!store
            .compare_and_save_charge_invoice(&invoice, 0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_charge_plan_cascades_but_keeps_transactions() {
        let store = InMemoryStore::new();
        let now = ts(2025, 1, 1);

        let plan =
            ChargePlan::new("acme", "starter", "Starter", 1000, Interval::MONTH, None, now)
                .unwrap();
        store.create_charge_plan(&plan).await.unwrap();

        let subscription = ChargeSubscription::new(plan.id, "cust_1", now);
        store
            .create_charge_subscription(&subscription)
            .await
            .unwrap();

        let invoice = charge_invoice(subscription.id, ts(2025, 2, 1));
        store.create_charge_invoice(&invoice).await.unwrap();

        let txn = Transaction::pending(TransactionKind::Charge, "cust_1", 1000, invoice.id, now);
        store.create_transaction(&txn).await.unwrap();

        store.delete_charge_plan(plan.id).await.unwrap();

        assert!(store
            .get_charge_plan_by_id(plan.id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_charge_subscription_by_id(subscription.id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_charge_invoice(invoice.id)
            .await
            .unwrap()
            .is_none());
        assert!(store.get_transaction(txn.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_due_invoices_are_ordered_and_filtered() {
        let store = InMemoryStore::new();
        let subscription_id = Uuid::new_v4();

        let late = charge_invoice(subscription_id, ts(2025, 1, 5));
        let early = charge_invoice(subscription_id, ts(2025, 1, 3));
        let mut settled = charge_invoice(subscription_id, ts(2025, 1, 1));
        settled.completed = true;
        settled.queue_rollover = true;
        let future = charge_invoice(subscription_id, ts(2025, 1, 9));

        for invoice in [&late, &early, &settled, &future] {
            store.create_charge_invoice(invoice).await.unwrap();
        }

        let due = store.list_due_charge_invoices(ts(2025, 1, 6)).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);

        let rollover = store.list_rollover_charge_invoices().await.unwrap();
        assert_eq!(rollover.len(), 1);
        assert_eq!(rollover[0].id, settled.id);
    }

    #[tokio::test]
    async fn test_open_invoice_skips_settled_and_prorated_rows() {
        let store = InMemoryStore::new();
        let subscription_id = Uuid::new_v4();

        let mut settled = charge_invoice(subscription_id, ts(2025, 2, 1));
        settled.completed = true;

        let mut open = charge_invoice(subscription_id, ts(2025, 3, 1));
        open.start_dt = ts(2025, 2, 1);

        let mut prorated = charge_invoice(subscription_id, ts(2025, 4, 1));
        prorated.start_dt = ts(2025, 3, 1);
        prorated.prorated = true;

        for invoice in [&settled, &open, &prorated] {
            store.create_charge_invoice(invoice).await.unwrap();
        }

        let found = store
            .get_open_charge_invoice(subscription_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, open.id);
    }

    #[tokio::test]
    async fn test_pending_transactions_cutoff() {
        let store = InMemoryStore::new();
        let invoice_id = Uuid::new_v4();

        let old = Transaction::pending(
            TransactionKind::Charge,
            "cust_1",
            500,
            invoice_id,
            ts(2025, 1, 1),
        );
        let mut sent = Transaction::pending(
            TransactionKind::Charge,
            "cust_1",
            500,
            invoice_id,
            ts(2025, 1, 1),
        );
        sent.mark_sent("mock_ch_1", ts(2025, 1, 1));
        let recent = Transaction::pending(
            TransactionKind::Payout,
            "cust_2",
            900,
            invoice_id,
            ts(2025, 1, 8),
        );

        for txn in [&old, &sent, &recent] {
            store.create_transaction(txn).await.unwrap();
        }

        let stalled = store
            .list_pending_transactions_before(ts(2025, 1, 5))
            .await
            .unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, old.id);
    }
}
