//! Payout plan lifecycle: subscribe, sweep, roll over.
//!
//! A payout plan periodically sweeps a customer's processor balance down to
//! a configured keep amount. Each [`PayoutInvoice`] schedules one sweep;
//! settled invoices roll into the next cycle the same way charge invoices
//! do.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, Result};
use crate::interval::Interval;
use crate::invoice::PayoutInvoice;
use crate::plan::PayoutPlan;
use crate::processor::PaymentProcessor;
use crate::storage::BillingStore;
use crate::subscription::PayoutSubscription;
use crate::transaction::{Transaction, TransactionKind};

/// Drives payout plans through their billing lifecycle.
pub struct PayoutLifecycle<S, P> {
    store: S,
    processor: P,
    config: BillingConfig,
}

impl<S, P> PayoutLifecycle<S, P>
where
    S: BillingStore,
    P: PaymentProcessor,
{
    /// Create a lifecycle over the given store and processor.
    pub fn new(store: S, processor: P, config: BillingConfig) -> Self {
        Self {
            store,
            processor,
            config,
        }
    }

    // Plans

    /// Validate and persist a new payout plan.
    pub async fn create_plan(
        &self,
        company_id: impl Into<String>,
        external_id: impl Into<String>,
        name: impl Into<String>,
        balance_to_keep_cents: i64,
        payout_interval: Interval,
        now: DateTime<Utc>,
    ) -> Result<PayoutPlan> {
        let plan = PayoutPlan::new(
            company_id,
            external_id,
            name,
            balance_to_keep_cents,
            payout_interval,
            now,
        )?;
        self.store.create_payout_plan(&plan).await?;
        tracing::debug!(plan = %plan.external_id, company = %plan.company_id, "payout plan created");
        Ok(plan)
    }

    /// Fetch a plan by its company-scoped external id.
    pub async fn get_plan(&self, company_id: &str, external_id: &str) -> Result<PayoutPlan> {
        self.store
            .get_payout_plan(company_id, external_id)
            .await?
            .ok_or_else(|| BillingError::not_found("payout plan", external_id))
    }

    /// Stop a plan accepting new customers. Live subscriptions keep sweeping
    /// until their own cancellation.
    pub async fn disable_plan(&self, plan_id: Uuid, now: DateTime<Utc>) -> Result<PayoutPlan> {
        let mut plan = self
            .store
            .get_payout_plan_by_id(plan_id)
            .await?
            .ok_or_else(|| BillingError::not_found("payout plan", plan_id.to_string()))?;
        plan.disable(now);
        self.store.save_payout_plan(&plan).await?;
        tracing::info!(plan = %plan.external_id, "payout plan disabled");
        Ok(plan)
    }

    /// Delete a plan, its subscriptions, and their invoices. The transaction
    /// audit trail is kept.
    pub async fn delete_plan(&self, plan_id: Uuid) -> Result<()> {
        self.store.delete_payout_plan(plan_id).await
    }

    // Subscribe

    /// Enroll a customer in a payout plan and schedule the first (or next)
    /// sweep.
    ///
    /// Re-subscribing an already-enrolled pair reactivates the existing
    /// subscription; a still-open sweep is closed unexecuted and replaced by
    /// the new schedule. Balances are cumulative at the processor, so the
    /// next sweep covers whatever the closed one would have moved.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown plan, `Validation` when a disabled
    /// plan is offered to a new customer, and `BadInterval` when the payout
    /// interval cannot be applied to the start date.
    pub async fn subscribe(
        &self,
        plan_id: Uuid,
        customer_id: &str,
        start_dt: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(PayoutSubscription, PayoutInvoice)> {
        let plan = self
            .store
            .get_payout_plan_by_id(plan_id)
            .await?
            .ok_or_else(|| BillingError::not_found("payout plan", plan_id.to_string()))?;

        let existing = self
            .store
            .get_payout_subscription(plan_id, customer_id)
            .await?;
        let continues_existing = existing.as_ref().is_some_and(|s| s.is_renewing());
        if !plan.active && !continues_existing {
            return Err(BillingError::validation(format!(
                "payout plan '{}' is disabled",
                plan.external_id
            )));
        }

        if let Some(subscription) = &existing {
            if let Some(open) = self.store.get_open_payout_invoice(subscription.id).await? {
                self.close_unexecuted(open, now).await?;
            }
        }

        let subscription = match existing {
            Some(mut subscription) => {
                subscription.reactivate(now);
                self.store.save_payout_subscription(&subscription).await?;
                subscription
            }
            None => {
                let subscription = PayoutSubscription::new(plan_id, customer_id, now);
                self.store.create_payout_subscription(&subscription).await?;
                subscription
            }
        };

        let start_dt = start_dt.unwrap_or(now);
        let end_dt = plan
            .payout_interval
            .add_to(start_dt)
            .ok_or_else(|| BillingError::bad_interval("payout interval overflows the calendar"))?;

        let invoice = PayoutInvoice {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            customer_id: customer_id.to_string(),
            start_dt,
            end_dt,
            original_end_dt: end_dt,
            payout_date: end_dt,
            balance_to_keep_cents: plan.balance_to_keep_cents,
            amount_paid_out: 0,
            balance_at_exec: None,
            completed: false,
            queue_rollover: false,
            attempts_made: 0,
            transaction_id: None,
            version: 0,
            created_at: now,
        };
        self.store.create_payout_invoice(&invoice).await?;

        tracing::info!(
            subscription = %subscription.id,
            invoice = %invoice.id,
            plan = %plan.external_id,
            customer = %customer_id,
            payout_date = %invoice.payout_date,
            "payout subscription scheduled"
        );
        Ok((subscription, invoice))
    }

    /// Close a superseded sweep without executing it.
    async fn close_unexecuted(&self, mut invoice: PayoutInvoice, now: DateTime<Utc>) -> Result<()> {
        let expected = invoice.version;
        invoice.end_dt = now;
        invoice.completed = true;
        if !self
            .store
            .compare_and_save_payout_invoice(&invoice, expected)
            .await?
        {
            return Err(BillingError::concurrent_modification(
                "payout invoice",
                invoice.id.to_string(),
            ));
        }
        Ok(())
    }

    // Settlement

    /// Run every sweep due at or before `now`.
    ///
    /// Returns the number of invoices examined, not the number swept. A
    /// processor failure marks the invoice for backoff retry and the scan
    /// continues; only store failures abort the run.
    pub async fn settle_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.list_due_payout_invoices(now).await?;
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
            "payout settlement scan complete"
        );
        Ok(examined)
    }

    async fn settle_invoice(
        &self,
        mut invoice: PayoutInvoice,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        let Some(mut subscription) = self
            .store
            .get_payout_subscription_by_id(invoice.subscription_id)
            .await?
        else {
            tracing::error!(invoice = %invoice.id, "due sweep has no subscription; skipping");
            return Ok(SettleOutcome::Skipped);
        };
        if !subscription.is_active {
            tracing::debug!(invoice = %invoice.id, "subscription inactive; skipping sweep");
            return Ok(SettleOutcome::Skipped);
        }

        let delays = &self.config.retry_delays;
        if invoice.attempts_made as usize > delays.len() {
            subscription.deactivate(now);
            self.store.save_payout_subscription(&subscription).await?;
            tracing::warn!(
                invoice = %invoice.id,
                subscription = %subscription.id,
                attempts = invoice.attempts_made,
                "sweep retries exhausted; subscription deactivated"
            );
            return Ok(SettleOutcome::Deactivated);
        }
        let effective_due = effective_due(
            invoice.payout_date,
            &delays[..invoice.attempts_made as usize],
        )?;
        if effective_due > now {
            tracing::debug!(invoice = %invoice.id, due = %effective_due, "backoff not elapsed; skipping");
            return Ok(SettleOutcome::Skipped);
        }

        let balance = match self.processor.check_balance(&invoice.customer_id).await {
            Ok(balance) => balance,
            Err(error) => {
                let expected = invoice.version;
                invoice.record_failure();
                if !self
                    .store
                    .compare_and_save_payout_invoice(&invoice, expected)
                    .await?
                {
                    tracing::warn!(invoice = %invoice.id, "invoice changed during failed balance check; attempt not counted");
                }
                tracing::warn!(
                    invoice = %invoice.id,
                    attempts = invoice.attempts_made,
                    error = %error,
                    "balance check failed; will retry after backoff"
                );
                return Ok(SettleOutcome::Failed);
            }
        };

        let payout_amount = balance - invoice.balance_to_keep_cents;
        if payout_amount <= 0 {
            // Nothing above the keep amount; the sweep completes without
            // moving money.
            let expected = invoice.version;
            invoice.record_payout(balance, 0, None);
            if !self
                .store
                .compare_and_save_payout_invoice(&invoice, expected)
                .await?
            {
                tracing::warn!(invoice = %invoice.id, "invoice changed while completing empty sweep");
            }
            tracing::info!(
                invoice = %invoice.id,
                balance,
                keep = invoice.balance_to_keep_cents,
                "balance at or below keep amount; nothing to sweep"
            );
            return Ok(SettleOutcome::Settled);
        }

        // The PENDING row is durable before the processor call so a crash
        // mid-call leaves evidence for the stalled-transaction sweep.
        let mut txn = Transaction::pending(
            TransactionKind::Payout,
            invoice.customer_id.clone(),
            payout_amount,
            invoice.id,
            now,
        );
        self.store.create_transaction(&txn).await?;

        match self
            .processor
            .make_payout(&invoice.customer_id, payout_amount)
            .await
        {
            Ok(processor_txn_id) => {
                txn.mark_sent(processor_txn_id, now);
                self.store.save_transaction(&txn).await?;
                self.record_payout_with_retry(invoice, balance, payout_amount, txn.id)
                    .await?;
                Ok(SettleOutcome::Settled)
            }
            Err(error) => {
                txn.mark_error(error.to_string(), now);
                self.store.save_transaction(&txn).await?;
                let expected = invoice.version;
                invoice.record_failure();
                if !self
                    .store
                    .compare_and_save_payout_invoice(&invoice, expected)
                    .await?
                {
                    tracing::warn!(invoice = %invoice.id, "invoice changed during failed payout; attempt not counted");
                }
                tracing::warn!(
                    invoice = %invoice.id,
                    transaction = %txn.id,
                    attempts = invoice.attempts_made,
                    error = %error,
                    "payout failed; will retry after backoff"
                );
                Ok(SettleOutcome::Failed)
            }
        }
    }

    /// Persist an executed sweep, re-reading the invoice on version
    /// conflicts. The money has already moved, so this must not give up on
    /// the first lost race.
    async fn record_payout_with_retry(
        &self,
        mut invoice: PayoutInvoice,
        balance: i64,
        payout_amount: i64,
        transaction_id: Uuid,
    ) -> Result<()> {
        let invoice_id = invoice.id;
        let mut expected = invoice.version;
        invoice.record_payout(balance, payout_amount, Some(transaction_id));

        for _ in 0..3 {
            if self
                .store
                .compare_and_save_payout_invoice(&invoice, expected)
                .await?
            {
                tracing::info!(
                    invoice = %invoice_id,
                    transaction = %transaction_id,
                    amount = payout_amount,
                    "payout settled"
                );
                return Ok(());
            }
            let Some(fresh) = self.store.get_payout_invoice(invoice_id).await? else {
                break;
            };
            expected = fresh.version;
            invoice = fresh;
            invoice.record_payout(balance, payout_amount, Some(transaction_id));
        }
        tracing::error!(
            invoice = %invoice_id,
            transaction = %transaction_id,
            amount = payout_amount,
            "payout could not be recorded on the invoice; transaction row holds the audit record"
        );
        Ok(())
    }

    // Rollover

    /// Schedule the next sweep for every settled invoice flagged for
    /// rollover. Returns the number of invoices examined.
    pub async fn reinvoice_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let rollover = self.store.list_rollover_payout_invoices().await?;
        let examined = rollover.len();
        let mut generated = 0usize;
        for invoice in rollover {
            if self.rollover_invoice(invoice, now).await? {
                generated += 1;
            }
        }
        tracing::info!(examined, generated, "payout reinvoice scan complete");
        Ok(examined)
    }

    /// Returns whether a next-cycle invoice was created.
    async fn rollover_invoice(&self, invoice: PayoutInvoice, now: DateTime<Utc>) -> Result<bool> {
        let Some(subscription) = self
            .store
            .get_payout_subscription_by_id(invoice.subscription_id)
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
            .list_payout_invoices_for_subscription(subscription.id)
            .await?
            .iter()
            .any(|next| next.id != invoice.id && next.start_dt == invoice.end_dt);
        if already_chained {
            // A previous run created the next cycle but crashed before
            // clearing the flag.
            self.clear_rollover_flag(invoice).await?;
            return Ok(false);
        }

        match self
            .subscribe(
                subscription.plan_id,
                &subscription.customer_id,
                Some(invoice.end_dt),
                now,
            )
            .await
        {
            Ok((_, next)) => {
                tracing::info!(
                    previous = %invoice.id,
                    next = %next.id,
                    payout_date = %next.payout_date,
                    "payout rolled into next cycle"
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

    async fn clear_rollover_flag(&self, mut invoice: PayoutInvoice) -> Result<()> {
        let expected = invoice.version;
        invoice.queue_rollover = false;
        if !self
            .store
            .compare_and_save_payout_invoice(&invoice, expected)
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

/// What a settlement scan did with one due sweep.
enum SettleOutcome {
    Settled,
    Failed,
    Skipped,
    Deactivated,
}

/// Due time after prefixing the elapsed retry delays.
fn effective_due(payout_date: DateTime<Utc>, elapsed_delays: &[Interval]) -> Result<DateTime<Utc>> {
    let mut due = payout_date;
    for delay in elapsed_delays {
        due = delay
            .add_to(due)
            .ok_or_else(|| BillingError::bad_interval("retry delay overflows the calendar"))?;
    }
    Ok(due)
}
