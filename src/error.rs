//! Error types for billing operations.
//!
//! Every fallible operation in the crate returns [`Result`], with a single
//! error enum covering domain failures (validation, missing entities, coupon
//! budgets) and infrastructure failures (store, processor).

use thiserror::Error;

/// Errors produced by billing operations.
///
/// Domain errors (`NotFound`, `AlreadyExists`, `BadInterval`, `Validation`,
/// `LimitReached`) are safe to map to 4xx responses by a surrounding API
/// layer. `Storage` and `Processor` are infrastructure failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A create hit a uniqueness constraint.
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// An interval is malformed (unparseable, zero where a period is
    /// required, or out of calendar range).
    #[error("bad interval: {reason}")]
    BadInterval { reason: String },

    /// A domain rule was violated at create time.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// A coupon redemption was attempted at its `max_redeem` budget.
    #[error("coupon '{coupon_id}' has reached its redemption limit")]
    LimitReached { coupon_id: String },

    /// An optimistic-version save lost against a concurrent writer.
    #[error("concurrent modification of {entity} '{id}', retry the operation")]
    ConcurrentModification { entity: &'static str, id: String },

    /// The backing store failed. Fatal to a batch run.
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// The payment processor call failed.
    #[error("processor error during '{operation}': {reason}")]
    Processor { operation: String, reason: String },
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, BillingError>;

impl BillingError {
    /// A missing entity, e.g. `not_found("charge plan", plan_id)`.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    /// A uniqueness violation on create.
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists { entity, id: id.into() }
    }

    /// A malformed interval.
    pub fn bad_interval(reason: impl Into<String>) -> Self {
        Self::BadInterval { reason: reason.into() }
    }

    /// A domain-rule violation.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation { reason: reason.into() }
    }

    /// A coupon at its redemption budget.
    pub fn limit_reached(coupon_id: impl Into<String>) -> Self {
        Self::LimitReached { coupon_id: coupon_id.into() }
    }

    /// A lost optimistic-locking race.
    pub fn concurrent_modification(entity: &'static str, id: impl Into<String>) -> Self {
        Self::ConcurrentModification { entity, id: id.into() }
    }

    /// A store failure.
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage { reason: reason.into() }
    }

    /// A processor failure during the named operation.
    pub fn processor(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Processor {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a caller fault: bad input or a reference to state
    /// that does not exist.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::AlreadyExists { .. }
                | Self::BadInterval { .. }
                | Self::Validation { .. }
                | Self::LimitReached { .. }
        )
    }

    /// Check if retrying the same operation can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::Storage { .. } | Self::Processor { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BillingError::not_found("charge plan", "starter");
        assert_eq!(err.to_string(), "charge plan not found: starter");

        let err = BillingError::limit_reached("SPRING10");
        assert_eq!(
            err.to_string(),
            "coupon 'SPRING10' has reached its redemption limit"
        );

        let err = BillingError::processor("create_charge", "card declined");
        assert_eq!(
            err.to_string(),
            "processor error during 'create_charge': card declined"
        );
    }

    #[test]
    fn test_error_classification() {
        let err = BillingError::validation("percent_off must be between 0 and 100");
        assert!(err.is_client_error());
        assert!(!err.is_retryable());

        let err = BillingError::concurrent_modification("charge invoice", "inv_1");
        assert!(!err.is_client_error());
        assert!(err.is_retryable());

        let err = BillingError::storage("connection reset");
        assert!(!err.is_client_error());
        assert!(err.is_retryable());
    }
}
