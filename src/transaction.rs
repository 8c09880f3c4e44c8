//! Transaction records, the durable financial audit trail.
//!
//! A transaction is written as `Pending` before the processor call it
//! describes, and moved to `Sent` or `Error` afterwards. Rows surviving in
//! `Pending` mark a process crash mid-call and are surfaced by the stalled
//! sweep. Once final, a transaction is immutable apart from the invoice link.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a processor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Recorded durably, processor outcome unknown.
    Pending,
    /// The processor accepted the money movement.
    Sent,
    /// The processor call failed.
    Error,
}

impl TransactionStatus {
    /// String representation for stores and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which direction the money moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Money collected from the customer.
    Charge,
    /// Money paid out to the customer.
    Payout,
}

impl TransactionKind {
    /// String representation for stores and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Charge => "charge",
            Self::Payout => "payout",
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One attempted money movement against the processor.
///
/// Transactions are independent of invoice deletion rules: they survive as an
/// audit trail even if their invoice is cascade-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Internal identifier.
    pub id: Uuid,
    pub kind: TransactionKind,
    /// Customer reference passed to the processor.
    pub customer_id: String,
    /// Amount moved, in cents.
    pub amount_cents: i64,
    /// Processor-assigned identifier, set when the call succeeds.
    pub processor_txn_id: Option<String>,
    pub status: TransactionStatus,
    /// The invoice this call settles. The only field mutable after the
    /// transaction is final.
    pub invoice_id: Option<Uuid>,
    /// Failure detail, set when the call fails.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Record an imminent processor call.
    #[must_use]
    pub fn pending(
        kind: TransactionKind,
        customer_id: impl Into<String>,
        amount_cents: i64,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            customer_id: customer_id.into(),
            amount_cents,
            processor_txn_id: None,
            status: TransactionStatus::Pending,
            invoice_id: Some(invoice_id),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark the processor call as accepted.
    pub fn mark_sent(&mut self, processor_txn_id: impl Into<String>, now: DateTime<Utc>) {
        self.processor_txn_id = Some(processor_txn_id.into());
        self.status = TransactionStatus::Sent;
        self.updated_at = now;
    }

    /// Mark the processor call as failed.
    pub fn mark_error(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = TransactionStatus::Error;
        self.error = Some(error.into());
        self.updated_at = now;
    }

    /// Whether the transaction reached a terminal state.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self.status, TransactionStatus::Sent | TransactionStatus::Error)
    }
}
