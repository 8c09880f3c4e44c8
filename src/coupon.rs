//! Discount coupons and redemption accounting.
//!
//! Discount math lives on [`Coupon`] and is pure. Persistence and budget
//! enforcement live in [`CouponEngine`]: a coupon is consumed once per
//! subscription that attaches it, while per-cycle applicability is decided
//! by [`Coupon::redeem`] each time an invoice is built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, Result};
use crate::storage::BillingStore;

/// Discount shape for a new coupon.
#[derive(Debug, Clone, Copy)]
pub struct CouponTerms {
    /// Flat discount in cents, applied before the percentage.
    pub price_off_cents: i64,
    /// Whole-number percentage discount, 0 to 100, applied after the flat
    /// discount.
    pub percent_off: i64,
    /// How many subscriptions may redeem the coupon; -1 for unlimited.
    pub max_redeem: i64,
    /// How many billing cycles the discount applies for; -1 for every cycle.
    pub repeating: i64,
    /// When the coupon stops applying, if ever.
    pub expire_at: Option<DateTime<Utc>>,
}

impl Default for CouponTerms {
    fn default() -> Self {
        Self {
            price_off_cents: 0,
            percent_off: 0,
            max_redeem: -1,
            repeating: -1,
            expire_at: None,
        }
    }
}

impl CouponTerms {
    /// No discount, no limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flat discount in cents.
    #[must_use]
    pub fn price_off(mut self, cents: i64) -> Self {
        self.price_off_cents = cents;
        self
    }

    /// Set the percentage discount (0 to 100).
    #[must_use]
    pub fn percent_off(mut self, percent: i64) -> Self {
        self.percent_off = percent;
        self
    }

    /// Cap the number of subscriptions that may redeem the coupon.
    #[must_use]
    pub fn max_redeem(mut self, budget: i64) -> Self {
        self.max_redeem = budget;
        self
    }

    /// Limit the discount to the first `cycles` billing cycles.
    #[must_use]
    pub fn repeating(mut self, cycles: i64) -> Self {
        self.repeating = cycles;
        self
    }

    /// Set an expiry timestamp.
    #[must_use]
    pub fn expires(mut self, at: DateTime<Utc>) -> Self {
        self.expire_at = Some(at);
        self
    }
}

/// A company-scoped discount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    /// Internal identifier.
    pub id: Uuid,
    /// Owning company.
    pub company_id: String,
    /// Company-scoped external identifier, unique per company.
    pub external_id: String,
    /// Display name.
    pub name: String,
    /// Flat discount in cents.
    pub price_off_cents: i64,
    /// Whole-number percentage discount, 0 to 100.
    pub percent_off: i64,
    /// Redemption budget; -1 for unlimited.
    pub max_redeem: i64,
    /// Billing cycles the discount applies for; -1 for every cycle.
    pub repeating: i64,
    /// Successful redemptions so far.
    pub times_redeemed: i64,
    /// When the coupon stops applying, if ever.
    pub expire_at: Option<DateTime<Utc>>,
    /// Whether the coupon can still be redeemed.
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Coupon {
    /// Create a new coupon, validating its terms.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when the percentage is outside 0..=100, the flat
    /// discount is negative, `max_redeem` or `repeating` is neither -1 nor
    /// positive, or the expiry is not in the future.
    pub fn new(
        company_id: impl Into<String>,
        external_id: impl Into<String>,
        name: impl Into<String>,
        terms: CouponTerms,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if !(0..=100).contains(&terms.percent_off) {
            return Err(BillingError::validation(
                "percent_off must be between 0 and 100",
            ));
        }
        if terms.price_off_cents < 0 {
            return Err(BillingError::validation(
                "price_off_cents must not be negative",
            ));
        }
        if terms.max_redeem != -1 && terms.max_redeem < 1 {
            return Err(BillingError::validation(
                "max_redeem must be positive or -1 for unlimited",
            ));
        }
        if terms.repeating != -1 && terms.repeating < 1 {
            return Err(BillingError::validation(
                "repeating must be positive or -1 for every cycle",
            ));
        }
        if let Some(at) = terms.expire_at {
            if at <= now {
                return Err(BillingError::validation("expire_at must be in the future"));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            company_id: company_id.into(),
            external_id: external_id.into(),
            name: name.into(),
            price_off_cents: terms.price_off_cents,
            percent_off: terms.percent_off,
            max_redeem: terms.max_redeem,
            repeating: terms.repeating,
            times_redeemed: 0,
            expire_at: terms.expire_at,
            active: true,
            created_at: now,
        })
    }

    /// Whether the expiry timestamp has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expire_at, Some(at) if at <= now)
    }

    /// Whether the redemption budget still has room.
    #[must_use]
    pub fn has_budget(&self) -> bool {
        self.max_redeem == -1 || self.times_redeemed < self.max_redeem
    }

    /// Amount payable after applying this coupon to `base_cents` on billing
    /// cycle `cycle` (1-based).
    ///
    /// The flat discount applies first, clamped at zero, then the percentage
    /// with the discount rounded down. A coupon that is inactive, expired,
    /// over budget, or past its repeating window leaves the base unchanged.
    #[must_use]
    pub fn redeem(&self, base_cents: i64, cycle: u32, now: DateTime<Utc>) -> i64 {
        if !self.active || self.is_expired(now) || !self.has_budget() {
            return base_cents;
        }
        if self.repeating != -1 && i64::from(cycle) > self.repeating {
            return base_cents;
        }
        let after_flat = (base_cents - self.price_off_cents).max(0);
        after_flat - after_flat * self.percent_off / 100
    }
}

/// Creates coupons and accounts for their redemptions.
#[derive(Debug, Clone)]
pub struct CouponEngine<S> {
    store: S,
}

impl<S: BillingStore> CouponEngine<S> {
    /// Create a coupon engine backed by the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Validate and persist a new coupon.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for bad terms and `AlreadyExists` when the
    /// company already has a coupon with this external id.
    pub async fn create(
        &self,
        company_id: impl Into<String>,
        external_id: impl Into<String>,
        name: impl Into<String>,
        terms: CouponTerms,
        now: DateTime<Utc>,
    ) -> Result<Coupon> {
        let coupon = Coupon::new(company_id, external_id, name, terms, now)?;
        self.store.create_coupon(&coupon).await?;
        tracing::debug!(
            coupon = %coupon.external_id,
            company = %coupon.company_id,
            "coupon created"
        );
        Ok(coupon)
    }

    /// Fetch a coupon by its company-scoped external id.
    pub async fn get(&self, company_id: &str, external_id: &str) -> Result<Coupon> {
        self.store
            .get_coupon(company_id, external_id)
            .await?
            .ok_or_else(|| BillingError::not_found("coupon", external_id))
    }

    /// Record one redemption and return the coupon state it was honored
    /// under.
    ///
    /// The stored row's `times_redeemed` is incremented, deactivating the
    /// coupon when that spends the budget. Expired or inactive coupons pass
    /// through unchanged with no accounting, so callers fall through to
    /// undiscounted billing.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown coupon and `LimitReached` when the
    /// redemption budget is already spent.
    pub async fn consume(
        &self,
        company_id: &str,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Coupon> {
        let coupon = self.get(company_id, external_id).await?;
        if coupon.is_expired(now) {
            return Ok(coupon);
        }
        if !coupon.has_budget() {
            return Err(BillingError::limit_reached(coupon.external_id.clone()));
        }
        if !coupon.active {
            return Ok(coupon);
        }

        let mut updated = coupon.clone();
        updated.times_redeemed += 1;
        if !updated.has_budget() {
            updated.active = false;
        }
        self.store.save_coupon(&updated).await?;
        tracing::debug!(
            coupon = %updated.external_id,
            times_redeemed = updated.times_redeemed,
            active = updated.active,
            "coupon redeemed"
        );
        Ok(coupon)
    }

    /// Deactivate every active coupon whose expiry has passed.
    ///
    /// Returns the number of coupons deactivated. Safe to re-run; a second
    /// pass finds nothing left to do.
    pub async fn expire_coupons(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.store.list_expired_active_coupons(now).await?;
        let count = expired.len();
        for mut coupon in expired {
            coupon.active = false;
            self.store.save_coupon(&coupon).await?;
            tracing::debug!(
                coupon = %coupon.external_id,
                company = %coupon.company_id,
                "coupon expired"
            );
        }
        if count > 0 {
            tracing::info!(expired = count, "deactivated expired coupons");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
    }

    fn promo(terms: CouponTerms) -> Coupon {
        Coupon::new("acme", "SPRING10", "Spring promo", terms, ts(2025, 1, 1)).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_terms() {
        let now = ts(2025, 1, 1);
        let cases = [
            CouponTerms::new().percent_off(101),
            CouponTerms::new().percent_off(-1),
            CouponTerms::new().price_off(-50),
            CouponTerms::new().max_redeem(0),
            CouponTerms::new().repeating(0),
            CouponTerms::new().expires(ts(2024, 12, 31)),
        ];
        for terms in cases {
            let err = Coupon::new("acme", "BAD", "Bad", terms, now).unwrap_err();
            assert!(matches!(err, BillingError::Validation { .. }), "{terms:?}");
        }
    }

    #[test]
    fn test_redeem_applies_flat_then_percent() {
        let coupon = promo(CouponTerms::new().price_off(100).percent_off(10));
        // (1000 - 100) minus 10% of 900
        assert_eq!(coupon.redeem(1000, 1, ts(2025, 2, 1)), 810);
    }

    #[test]
    fn test_redeem_clamps_flat_discount_at_zero() {
        let coupon = promo(CouponTerms::new().price_off(2000).percent_off(50));
        assert_eq!(coupon.redeem(1000, 1, ts(2025, 2, 1)), 0);
    }

    #[test]
    fn test_redeem_respects_repeating_window() {
        let coupon = promo(CouponTerms::new().percent_off(10).repeating(2));
        let now = ts(2025, 2, 1);
        assert_eq!(coupon.redeem(1000, 1, now), 900);
        assert_eq!(coupon.redeem(1000, 2, now), 900);
        assert_eq!(coupon.redeem(1000, 3, now), 1000);
    }

    #[test]
    fn test_redeem_passes_through_when_unusable() {
        let now = ts(2025, 2, 1);

        let mut inactive = promo(CouponTerms::new().percent_off(10));
        inactive.active = false;
        assert_eq!(inactive.redeem(1000, 1, now), 1000);

        let expired = promo(CouponTerms::new().percent_off(10).expires(ts(2025, 1, 15)));
        assert_eq!(expired.redeem(1000, 1, now), 1000);

        let mut spent = promo(CouponTerms::new().percent_off(10).max_redeem(5));
        spent.times_redeemed = 5;
        assert_eq!(spent.redeem(1000, 1, now), 1000);
    }

    #[tokio::test]
    async fn test_consume_spends_budget_and_deactivates_on_last_slot() {
        let engine = CouponEngine::new(InMemoryStore::new());
        let now = ts(2025, 1, 1);
        engine
            .create(
                "acme",
                "TWICE",
                "Two redemptions",
                CouponTerms::new().percent_off(10).max_redeem(2),
                now,
            )
            .await
            .unwrap();

        // First redemption is honored against the untouched state.
        let first = engine.consume("acme", "TWICE", now).await.unwrap();
        assert_eq!(first.times_redeemed, 0);
        assert_eq!(first.redeem(1000, 1, now), 900);

        // The last slot still gets its discount; the stored row deactivates.
        let second = engine.consume("acme", "TWICE", now).await.unwrap();
        assert_eq!(second.times_redeemed, 1);
        assert_eq!(second.redeem(1000, 1, now), 900);

        let stored = engine.get("acme", "TWICE").await.unwrap();
        assert_eq!(stored.times_redeemed, 2);
        assert!(!stored.active);

        let err = engine.consume("acme", "TWICE", now).await.unwrap_err();
        assert!(matches!(err, BillingError::LimitReached { .. }));
    }

    #[tokio::test]
    async fn test_consume_is_noop_for_expired_coupon() {
        let engine = CouponEngine::new(InMemoryStore::new());
        engine
            .create(
                "acme",
                "LAPSED",
                "Lapsed",
                CouponTerms::new().percent_off(10).expires(ts(2025, 1, 10)),
                ts(2025, 1, 1),
            )
            .await
            .unwrap();

        let later = ts(2025, 1, 11);
        let coupon = engine.consume("acme", "LAPSED", later).await.unwrap();
        assert_eq!(coupon.times_redeemed, 0);
        assert_eq!(coupon.redeem(1000, 1, later), 1000);

        let stored = engine.get("acme", "LAPSED").await.unwrap();
        assert_eq!(stored.times_redeemed, 0);
    }

    #[tokio::test]
    async fn test_expire_coupons_is_idempotent() {
        let engine = CouponEngine::new(InMemoryStore::new());
        let created = ts(2025, 1, 1);
        engine
            .create(
                "acme",
                "SHORT",
                "Short lived",
                CouponTerms::new().percent_off(5).expires(ts(2025, 1, 10)),
                created,
            )
            .await
            .unwrap();
        engine
            .create(
                "acme",
                "EVERGREEN",
                "No expiry",
                CouponTerms::new().percent_off(5),
                created,
            )
            .await
            .unwrap();

        let now = ts(2025, 2, 1);
        assert_eq!(engine.expire_coupons(now).await.unwrap(), 1);
        assert_eq!(engine.expire_coupons(now).await.unwrap(), 0);

        assert!(!engine.get("acme", "SHORT").await.unwrap().active);
        assert!(engine.get("acme", "EVERGREEN").await.unwrap().active);
    }
}
