//! The payment-processor seam.
//!
//! The engine treats the processor as an opaque remote service: it can read a
//! customer's balance, collect a charge, and send a payout, each returning a
//! processor-assigned transaction id or failing. Implement [`PaymentProcessor`]
//! for your rail; [`MockProcessor`] is provided for tests and local
//! development.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{BillingError, Result};

/// Capability contract the engine requires of a payment rail.
///
/// Any failure is treated as settlement failure for the invoice being
/// processed; the engine never inspects failures beyond logging them.
pub trait PaymentProcessor: Send + Sync {
    /// Current balance held for the customer, in cents.
    async fn check_balance(&self, customer_id: &str) -> Result<i64>;

    /// Collect `amount_cents` from the customer. Returns the processor's
    /// transaction id.
    async fn create_charge(&self, customer_id: &str, amount_cents: i64) -> Result<String>;

    /// Send `amount_cents` to the customer. Returns the processor's
    /// transaction id.
    async fn make_payout(&self, customer_id: &str, amount_cents: i64) -> Result<String>;
}

/// A recorded processor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorCall {
    pub customer_id: String,
    pub amount_cents: i64,
}

/// In-memory processor for tests and local development.
///
/// Balances are scripted with [`set_balance`](Self::set_balance); failures are
/// injected with [`fail_next`](Self::fail_next) (single shot, per operation)
/// or [`set_failing`](Self::set_failing) (until cleared). Every accepted call
/// is recorded for inspection.
#[derive(Default, Clone)]
pub struct MockProcessor {
    inner: Arc<RwLock<MockProcessorState>>,
}

#[derive(Default)]
struct MockProcessorState {
    balances: HashMap<String, i64>,
    charges: Vec<ProcessorCall>,
    payouts: Vec<ProcessorCall>,
    failing: bool,
    fail_next: Option<(String, String)>,
    next_txn: u64,
}

impl MockProcessor {
    /// Create a new mock processor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the balance reported for a customer.
    pub fn set_balance(&self, customer_id: impl Into<String>, cents: i64) {
        self.inner
            .write()
            .unwrap()
            .balances
            .insert(customer_id.into(), cents);
    }

    /// Current scripted balance for a customer.
    #[must_use]
    pub fn balance(&self, customer_id: &str) -> Option<i64> {
        self.inner.read().unwrap().balances.get(customer_id).copied()
    }

    /// Fail the next call to `operation` with the given reason, then recover.
    pub fn fail_next(&self, operation: impl Into<String>, reason: impl Into<String>) {
        self.inner.write().unwrap().fail_next = Some((operation.into(), reason.into()));
    }

    /// Fail every call until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.inner.write().unwrap().failing = failing;
    }

    /// All accepted charge calls, in order.
    #[must_use]
    pub fn charges(&self) -> Vec<ProcessorCall> {
        self.inner.read().unwrap().charges.clone()
    }

    /// All accepted payout calls, in order.
    #[must_use]
    pub fn payouts(&self) -> Vec<ProcessorCall> {
        self.inner.read().unwrap().payouts.clone()
    }

    fn take_failure(state: &mut MockProcessorState, operation: &str) -> Result<()> {
        if state
            .fail_next
            .as_ref()
            .is_some_and(|(op, _)| op == operation)
        {
            let (_, reason) = state.fail_next.take().unwrap();
            return Err(BillingError::processor(operation, reason));
        }
        if state.failing {
            return Err(BillingError::processor(operation, "processor unavailable"));
        }
        Ok(())
    }

    fn next_txn_id(state: &mut MockProcessorState, prefix: &str) -> String {
        state.next_txn += 1;
        format!("{}_{}", prefix, state.next_txn)
    }
}

impl PaymentProcessor for MockProcessor {
    async fn check_balance(&self, customer_id: &str) -> Result<i64> {
        let mut state = self.inner.write().unwrap();
        Self::take_failure(&mut state, "check_balance")?;
        state.balances.get(customer_id).copied().ok_or_else(|| {
            BillingError::processor(
                "check_balance",
                format!("no balance held for customer '{}'", customer_id),
            )
        })
    }

    async fn create_charge(&self, customer_id: &str, amount_cents: i64) -> Result<String> {
        let mut state = self.inner.write().unwrap();
        Self::take_failure(&mut state, "create_charge")?;
        state.charges.push(ProcessorCall {
            customer_id: customer_id.to_string(),
            amount_cents,
        });
        Ok(Self::next_txn_id(&mut state, "mock_ch"))
    }

    async fn make_payout(&self, customer_id: &str, amount_cents: i64) -> Result<String> {
        let mut state = self.inner.write().unwrap();
        Self::take_failure(&mut state, "make_payout")?;
        if let Some(balance) = state.balances.get_mut(customer_id) {
            *balance -= amount_cents;
        }
        state.payouts.push(ProcessorCall {
            customer_id: customer_id.to_string(),
            amount_cents,
        });
        Ok(Self::next_txn_id(&mut state, "mock_po"))
    }
}
