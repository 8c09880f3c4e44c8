//! Charge plan lifecycle: subscribe, prorate, settle, roll over.
//!
//! Each billing cycle is one [`ChargeInvoice`]. Cycles recur by rollover:
//! settling an invoice flags it, and the reinvoice scan subscribes the
//! customer again with `start_dt` pinned to the previous period end, so a
//! subscription's history is a chain of invoices joined end to start.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::coupon::CouponEngine;
use crate::error::{BillingError, Result};
use crate::interval::Interval;
use crate::invoice::ChargeInvoice;
use crate::plan::ChargePlan;
use crate::processor::PaymentProcessor;
use crate::storage::BillingStore;
use crate::subscription::ChargeSubscription;
use crate::transaction::{Transaction, TransactionKind};

/// Optional knobs for [`ChargeLifecycle::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Units of the plan price to bill; defaults to 1.
    pub quantity: Option<u32>,
    /// Defer settlement to the period end instead of billing up front.
    pub charge_at_period_end: bool,
    /// Period start; defaults to the current time.
    pub start_dt: Option<DateTime<Utc>>,
    /// External id of a coupon to attach to the enrollment.
    pub coupon: Option<String>,
}

impl SubscribeOptions {
    /// Create default options: quantity 1, billed up front, starting now.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the billed quantity.
    #[must_use]
    pub fn quantity(mut self, quantity: u32) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Bill at the end of the period instead of up front.
    #[must_use]
    pub fn charge_at_period_end(mut self, enabled: bool) -> Self {
        self.charge_at_period_end = enabled;
        self
    }

    /// Pin the period start.
    #[must_use]
    pub fn start_dt(mut self, start: DateTime<Utc>) -> Self {
        self.start_dt = Some(start);
        self
    }

    /// Attach a coupon by external id.
    #[must_use]
    pub fn coupon(mut self, external_id: impl Into<String>) -> Self {
        self.coupon = Some(external_id.into());
        self
    }
}

/// Drives charge plans through their billing lifecycle.
pub struct ChargeLifecycle<S, P> {
    store: S,
    processor: P,
    coupons: CouponEngine<S>,
    config: BillingConfig,
}

impl<S, P> ChargeLifecycle<S, P>
where
    S: BillingStore + Clone,
    P: PaymentProcessor,
{
    /// Create a lifecycle over the given store and processor.
    pub fn new(store: S, processor: P, config: BillingConfig) -> Self {
        Self {
            coupons: CouponEngine::new(store.clone()),
            store,
            processor,
            config,
        }
    }

    // Plans

    /// Validate and persist a new charge plan.
    pub async fn create_plan(
        &self,
        company_id: impl Into<String>,
        external_id: impl Into<String>,
        name: impl Into<String>,
        price_cents: i64,
        plan_interval: Interval,
        trial_interval: Option<Interval>,
        now: DateTime<Utc>,
    ) -> Result<ChargePlan> {
        let plan = ChargePlan::new(
            company_id,
            external_id,
            name,
            price_cents,
            plan_interval,
            trial_interval,
            now,
        )?;
        self.store.create_charge_plan(&plan).await?;
        tracing::debug!(plan = %plan.external_id, company = %plan.company_id, "charge plan created");
        Ok(plan)
    }

    /// Fetch a plan by its company-scoped external id.
    pub async fn get_plan(&self, company_id: &str, external_id: &str) -> Result<ChargePlan> {
        self.store
            .get_charge_plan(company_id, external_id)
            .await?
            .ok_or_else(|| BillingError::not_found("charge plan", external_id))
    }

    /// Stop a plan accepting new customers. Live subscriptions keep billing
    /// until their own cancellation.
    pub async fn disable_plan(&self, plan_id: Uuid, now: DateTime<Utc>) -> Result<ChargePlan> {
        let mut plan = self
            .store
            .get_charge_plan_by_id(plan_id)
            .await?
            .ok_or_else(|| BillingError::not_found("charge plan", plan_id.to_string()))?;
        plan.disable(now);
        self.store.save_charge_plan(&plan).await?;
        tracing::info!(plan = %plan.external_id, "charge plan disabled");
        Ok(plan)
    }

    /// Delete a plan, its subscriptions, and their invoices. The transaction
    /// audit trail is kept.
    pub async fn delete_plan(&self, plan_id: Uuid) -> Result<()> {
        self.store.delete_charge_plan(plan_id).await
    }

    // Subscribe

    /// Enroll a customer in a plan and invoice the first (or next) cycle.
    ///
    /// Re-subscribing an already-enrolled pair is idempotent: the existing
    /// subscription is reactivated and its still-open invoice, if any, is
    /// prorated and closed before the new cycle's invoice is created, so at
    /// most one invoice per subscription is open at a time.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown plan or coupon, `Validation` when a
    /// disabled plan is offered to a new customer or the quantity is zero,
    /// `LimitReached` when the coupon budget is spent, and `BadInterval`
    /// when the plan's intervals cannot be applied to the start date.
    pub async fn subscribe(
        &self,
        plan_id: Uuid,
        customer_id: &str,
        options: SubscribeOptions,
        now: DateTime<Utc>,
    ) -> Result<(ChargeSubscription, ChargeInvoice)> {
        let plan = self
            .store
            .get_charge_plan_by_id(plan_id)
            .await?
            .ok_or_else(|| BillingError::not_found("charge plan", plan_id.to_string()))?;

        let quantity = options.quantity.unwrap_or(1);
        if quantity == 0 {
            return Err(BillingError::validation("quantity must be at least 1"));
        }

        let existing = self
            .store
            .get_charge_subscription(plan_id, customer_id)
            .await?;
        let continues_existing = existing.as_ref().is_some_and(|s| s.is_renewing());
        if !plan.active && !continues_existing {
            return Err(BillingError::validation(format!(
                "charge plan '{}' is disabled",
                plan.external_id
            )));
        }

        // A customer may trial a plan only on their first ever enrollment.
        let trial_eligible = existing.is_none();

        let start_dt = options.start_dt.unwrap_or(now);
        let mut end_dt = plan
            .plan_interval
            .add_to(start_dt)
            .ok_or_else(|| BillingError::bad_interval("plan interval overflows the calendar"))?;
        let mut due_dt = start_dt;
        let mut includes_trial = false;
        if trial_eligible {
            if let Some(trial) = plan.trial_interval {
                end_dt = trial.add_to(end_dt).ok_or_else(|| {
                    BillingError::bad_interval("trial interval overflows the calendar")
                })?;
                due_dt = trial.add_to(due_dt).ok_or_else(|| {
                    BillingError::bad_interval("trial interval overflows the calendar")
                })?;
                includes_trial = true;
            }
        }
        if options.charge_at_period_end {
            due_dt = end_dt;
        }

        // Resolve the discount before any write; a spent coupon aborts the
        // call with nothing persisted.
        let attached = match existing.as_ref().and_then(|s| s.coupon_id) {
            Some(id) => self.store.get_coupon_by_id(id).await?,
            None => None,
        };
        let coupon = match &options.coupon {
            Some(external_id) => match attached {
                Some(current) if current.external_id == *external_id => Some(current),
                _ => Some(
                    self.coupons
                        .consume(&plan.company_id, external_id, now)
                        .await?,
                ),
            },
            None => attached,
        };

        // Cut the running period short so at most one invoice stays open.
        if let Some(subscription) = &existing {
            if let Some(open) = self.store.get_open_charge_invoice(subscription.id).await? {
                self.prorate_invoice(open, plan.trial_interval, now).await?;
            }
        }

        let subscription = match existing {
            Some(mut subscription) => {
                subscription.reactivate(now);
                if let Some(coupon) = &coupon {
                    subscription.coupon_id = Some(coupon.id);
                }
                self.store.save_charge_subscription(&subscription).await?;
                subscription
            }
            None => {
                let mut subscription = ChargeSubscription::new(plan_id, customer_id, now);
                if let Some(coupon) = &coupon {
                    subscription.coupon_id = Some(coupon.id);
                }
                self.store.create_charge_subscription(&subscription).await?;
                subscription
            }
        };

        let cycle = self
            .store
            .list_charge_invoices_for_subscription(subscription.id)
            .await?
            .iter()
            .map(|i| i.cycle)
            .max()
            .map_or(1, |latest| latest + 1);

        let amount_base_cents = plan.price_cents * i64::from(quantity);
        let amount_after_coupon_cents = coupon
            .as_ref()
            .map_or(amount_base_cents, |c| c.redeem(amount_base_cents, cycle, now));

        let invoice = ChargeInvoice {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            customer_id: customer_id.to_string(),
            start_dt,
            end_dt,
            original_end_dt: end_dt,
            due_dt,
            amount_base_cents,
            amount_after_coupon_cents,
            amount_paid_cents: 0,
            remaining_balance_cents: amount_after_coupon_cents,
            quantity,
            cycle,
            prorated: false,
            includes_trial,
            charge_at_period_end: options.charge_at_period_end,
            completed: false,
            queue_rollover: false,
            attempts_made: 0,
            transaction_id: None,
            version: 0,
            created_at: now,
        };
        self.store.create_charge_invoice(&invoice).await?;

        tracing::info!(
            subscription = %subscription.id,
            invoice = %invoice.id,
            plan = %plan.external_id,
            customer = %customer_id,
            cycle,
            amount = invoice.remaining_balance_cents,
            due = %invoice.due_dt,
            "charge subscription invoiced"
        );
        Ok((subscription, invoice))
    }

    // Proration

    /// Cut the subscription's current billing period short at `now`.
    ///
    /// The open invoice's amounts are rescaled to the fraction of the period
    /// actually used and the subscription stops renewing; a new `subscribe`
    /// call resumes it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the subscription or an open invoice is
    /// missing, `Validation` when the period has no length to prorate, and
    /// `ConcurrentModification` when the invoice changed underneath.
    pub async fn prorate_last(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ChargeInvoice> {
        let mut subscription = self
            .store
            .get_charge_subscription_by_id(subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::not_found("charge subscription", subscription_id.to_string())
            })?;
        let open = self
            .store
            .get_open_charge_invoice(subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::not_found("open charge invoice", subscription_id.to_string())
            })?;
        let trial_interval = self
            .store
            .get_charge_plan_by_id(subscription.plan_id)
            .await?
            .and_then(|plan| plan.trial_interval);

        let prorated = self.prorate_invoice(open, trial_interval, now).await?;

        subscription.unenroll(now);
        self.store.save_charge_subscription(&subscription).await?;
        tracing::info!(
            subscription = %subscription.id,
            invoice = %prorated.id,
            remaining = prorated.remaining_balance_cents,
            "billing period cut short"
        );
        Ok(prorated)
    }

    /// Rescale an open invoice to the used fraction of its period and close
    /// the period at `now`.
    async fn prorate_invoice(
        &self,
        mut invoice: ChargeInvoice,
        trial_interval: Option<Interval>,
        now: DateTime<Utc>,
    ) -> Result<ChargeInvoice> {
        let mut true_start = invoice.start_dt;
        if invoice.includes_trial {
            if let Some(trial) = trial_interval {
                let trial_end = trial.add_to(invoice.start_dt).ok_or_else(|| {
                    BillingError::bad_interval("trial interval overflows the calendar")
                })?;
                // Paid time starts after an elapsed trial.
                if now >= trial_end {
                    true_start = trial_end;
                }
            }
        }

        let time_total = (invoice.end_dt - true_start).num_seconds();
        if time_total <= 0 {
            return Err(BillingError::validation(
                "billing period has no length to prorate",
            ));
        }
        let time_used = (now - true_start).num_seconds().clamp(0, time_total);

        invoice.amount_base_cents = prorated_amount(invoice.amount_base_cents, time_used, time_total);
        invoice.amount_after_coupon_cents =
            prorated_amount(invoice.amount_after_coupon_cents, time_used, time_total);
        invoice.remaining_balance_cents =
            (invoice.amount_after_coupon_cents - invoice.amount_paid_cents).max(0);
        invoice.end_dt = now;
        invoice.prorated = true;
        if invoice.remaining_balance_cents == 0 {
            invoice.completed = true;
        }

        let expected = invoice.version;
        if !self
            .store
            .compare_and_save_charge_invoice(&invoice, expected)
            .await?
        {
            return Err(BillingError::concurrent_modification(
                "charge invoice",
                invoice.id.to_string(),
            ));
        }
        invoice.version = expected + 1;
        Ok(invoice)
    }

    // Settlement

    /// Collect every invoice due at or before `now`.
    ///
    /// Returns the number of invoices examined, not the number settled. A
    /// processor failure marks the invoice for backoff retry and the scan
    /// continues; only store failures abort the run.
    pub async fn settle_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.list_due_charge_invoices(now).await?;
        let examined = due.len();
        let (mut settled, mut failed, mut deactivated) = (0usize, 0usize, 0usize);
        for invoice in due {
            match self.settle_invoice(invoice, now).await? {
                SettleOutcome::Settled => settled += 1,
                SettleOutcome::Failed => failed += 1,
                SettleOutcome::Deactivated => deactivated += 1,
                SettleOutcome::Skipped => {}
            }
        }
        tracing::info!(
            examined,
            settled,
            failed,
            deactivated,
            "charge settlement scan complete"
        );
        Ok(examined)
    }

    async fn settle_invoice(
        &self,
        mut invoice: ChargeInvoice,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        let Some(mut subscription) = self
            .store
            .get_charge_subscription_by_id(invoice.subscription_id)
            .await?
        else {
            tracing::error!(invoice = %invoice.id, "due invoice has no subscription; skipping");
            return Ok(SettleOutcome::Skipped);
        };
        if !subscription.is_active {
            tracing::debug!(invoice = %invoice.id, "subscription inactive; skipping settlement");
            return Ok(SettleOutcome::Skipped);
        }

        let delays = &self.config.retry_delays;
        if invoice.attempts_made as usize > delays.len() {
            subscription.deactivate(now);
            self.store.save_charge_subscription(&subscription).await?;
            tracing::warn!(
                invoice = %invoice.id,
                subscription = %subscription.id,
                attempts = invoice.attempts_made,
                "settlement retries exhausted; subscription deactivated"
            );
            return Ok(SettleOutcome::Deactivated);
        }
        let effective_due = effective_due(invoice.due_dt, &delays[..invoice.attempts_made as usize])?;
        if effective_due > now {
            tracing::debug!(invoice = %invoice.id, due = %effective_due, "backoff not elapsed; skipping");
            return Ok(SettleOutcome::Skipped);
        }

        // A fully discounted cycle has nothing to collect.
        if invoice.remaining_balance_cents == 0 {
            let expected = invoice.version;
            invoice.completed = true;
            invoice.queue_rollover = !invoice.prorated;
            if !self
                .store
                .compare_and_save_charge_invoice(&invoice, expected)
                .await?
            {
                tracing::warn!(invoice = %invoice.id, "invoice changed while completing zero balance");
            }
            return Ok(SettleOutcome::Settled);
        }

        // The PENDING row is durable before the processor call so a crash
        // mid-call leaves evidence for the stalled-transaction sweep.
        let charged = invoice.remaining_balance_cents;
        let mut txn = Transaction::pending(
            TransactionKind::Charge,
            invoice.customer_id.clone(),
            charged,
            invoice.id,
            now,
        );
        self.store.create_transaction(&txn).await?;

        match self
            .processor
            .create_charge(&invoice.customer_id, charged)
            .await
        {
            Ok(processor_txn_id) => {
                txn.mark_sent(processor_txn_id, now);
                self.store.save_transaction(&txn).await?;
                self.record_payment_with_retry(invoice, charged, txn.id).await?;
                Ok(SettleOutcome::Settled)
            }
            Err(error) => {
                txn.mark_error(error.to_string(), now);
                self.store.save_transaction(&txn).await?;
                let expected = invoice.version;
                invoice.record_failure();
                if !self
                    .store
                    .compare_and_save_charge_invoice(&invoice, expected)
                    .await?
                {
                    tracing::warn!(invoice = %invoice.id, "invoice changed during failed charge; attempt not counted");
                }
                tracing::warn!(
                    invoice = %invoice.id,
                    transaction = %txn.id,
                    attempts = invoice.attempts_made,
                    error = %error,
                    "charge failed; will retry after backoff"
                );
                Ok(SettleOutcome::Failed)
            }
        }
    }

    /// Persist a collected payment, re-reading the invoice on version
    /// conflicts. The money has already moved, so this must not give up on
    /// the first lost race.
    async fn record_payment_with_retry(
        &self,
        mut invoice: ChargeInvoice,
        charged: i64,
        transaction_id: Uuid,
    ) -> Result<()> {
        let invoice_id = invoice.id;
        let mut expected = invoice.version;
        invoice.record_payment(transaction_id);

        for _ in 0..3 {
            if self
                .store
                .compare_and_save_charge_invoice(&invoice, expected)
                .await?
            {
                tracing::info!(
                    invoice = %invoice_id,
                    transaction = %transaction_id,
                    amount = charged,
                    "charge settled"
                );
                return Ok(());
            }
            let Some(fresh) = self.store.get_charge_invoice(invoice_id).await? else {
                break;
            };
            expected = fresh.version;
            invoice = fresh;
            invoice.amount_paid_cents += charged;
            invoice.remaining_balance_cents =
                (invoice.remaining_balance_cents - charged).max(0);
            invoice.completed = invoice.remaining_balance_cents == 0;
            if invoice.completed {
                invoice.queue_rollover = !invoice.prorated;
            }
            invoice.transaction_id = Some(transaction_id);
        }
        tracing::error!(
            invoice = %invoice_id,
            transaction = %transaction_id,
            amount = charged,
            "payment could not be recorded on the invoice; transaction row holds the audit record"
        );
        Ok(())
    }

    // Rollover

    /// Generate the next cycle for every settled invoice flagged for
    /// rollover. Returns the number of invoices examined.
    ///
    /// The flag is cleared only after the next invoice exists, so a crash
    /// between the two steps is healed on the next run by the chain check
    /// rather than by dropping a cycle.
    pub async fn reinvoice_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let rollover = self.store.list_rollover_charge_invoices().await?;
        let examined = rollover.len();
        let mut generated = 0usize;
        for invoice in rollover {
            if self.rollover_invoice(invoice, now).await? {
                generated += 1;
            }
        }
        tracing::info!(examined, generated, "charge reinvoice scan complete");
        Ok(examined)
    }

    /// Returns whether a next-cycle invoice was created.
    async fn rollover_invoice(&self, invoice: ChargeInvoice, now: DateTime<Utc>) -> Result<bool> {
        let Some(subscription) = self
            .store
            .get_charge_subscription_by_id(invoice.subscription_id)
            .await?
        else {
            tracing::error!(invoice = %invoice.id, "rollover invoice has no subscription; skipping");
            return Ok(false);
        };
        if !subscription.is_renewing() {
            // The chain is broken; a later subscribe starts a fresh one. The
            // flag must not survive, or reactivation would double-generate.
            tracing::debug!(
                invoice = %invoice.id,
                subscription = %subscription.id,
                "subscription no longer renewing; dropping rollover flag"
            );
            self.clear_rollover_flag(invoice).await?;
            return Ok(false);
        }

        let already_chained = self
            .store
            .list_charge_invoices_for_subscription(subscription.id)
            .await?
            .iter()
            .any(|next| next.id != invoice.id && next.start_dt == invoice.end_dt);
        if already_chained {
            // A previous run created the next cycle but crashed before
            // clearing the flag.
            self.clear_rollover_flag(invoice).await?;
            return Ok(false);
        }

        let options = SubscribeOptions {
            quantity: Some(invoice.quantity),
            charge_at_period_end: invoice.charge_at_period_end,
            start_dt: Some(invoice.end_dt),
            coupon: None,
        };
        match self
            .subscribe(subscription.plan_id, &subscription.customer_id, options, now)
            .await
        {
            Ok((_, next)) => {
                tracing::info!(
                    previous = %invoice.id,
                    next = %next.id,
                    cycle = next.cycle,
                    "subscription rolled into next cycle"
                );
                self.clear_rollover_flag(invoice).await?;
                Ok(true)
            }
            Err(error) if error.is_client_error() => {
                tracing::warn!(
                    invoice = %invoice.id,
                    error = %error,
                    "rollover skipped; flag kept for the next run"
                );
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    async fn clear_rollover_flag(&self, mut invoice: ChargeInvoice) -> Result<()> {
        let expected = invoice.version;
        invoice.queue_rollover = false;
        if !self
            .store
            .compare_and_save_charge_invoice(&invoice, expected)
            .await?
        {
            tracing::warn!(
                invoice = %invoice.id,
                "rollover flag left set after version conflict; next run reconciles"
            );
        }
        Ok(())
    }
}

/// What a settlement scan did with one due invoice.
enum SettleOutcome {
    Settled,
    Failed,
    Skipped,
    Deactivated,
}

/// Integer proration: `amount * used / total`, truncated toward zero.
fn prorated_amount(amount: i64, used: i64, total: i64) -> i64 {
    ((i128::from(amount) * i128::from(used)) / i128::from(total)) as i64
}

/// Due time after prefixing the elapsed retry delays.
fn effective_due(due_dt: DateTime<Utc>, elapsed_delays: &[Interval]) -> Result<DateTime<Utc>> {
    let mut due = due_dt;
    for delay in elapsed_delays {
        due = delay
            .add_to(due)
            .ok_or_else(|| BillingError::bad_interval("retry delay overflows the calendar"))?;
    }
    Ok(due)
}
