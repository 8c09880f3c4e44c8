use chrono::{DateTime, TimeZone, Utc};
use rebill::{
    BillingEngine, BillingError, BillingStore, Config, CouponTerms, InMemoryStore, Interval,
    MockProcessor, SubscribeOptions, TransactionStatus,
};

fn ts(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
}

fn engine() -> (
    BillingEngine<InMemoryStore, MockProcessor>,
    InMemoryStore,
    MockProcessor,
) {
    let store = InMemoryStore::new();
    let processor = MockProcessor::new();
    let engine = BillingEngine::new(store.clone(), processor.clone(), Config::default());
    (engine, store, processor)
}

#[tokio::test]
async fn test_trial_and_coupon_from_subscribe_to_next_cycle() {
    let (engine, store, processor) = engine();

    // 1000 cents monthly with a one-week trial, discounted 10%.
    let plan = engine
        .charges()
        .create_plan(
            "acme",
            "starter",
            "Starter",
            1000,
            Interval::MONTH,
            Some(Interval::WEEK),
            ts(2025, 1, 1),
        )
        .await
        .unwrap();
    engine
        .coupons()
        .create(
            "acme",
            "SAVE10",
            "Save 10%",
            CouponTerms::new().percent_off(10),
            ts(2025, 1, 1),
        )
        .await
        .unwrap();

    let (subscription, invoice) = engine
        .charges()
        .subscribe(
            plan.id,
            "cust_1",
            SubscribeOptions::new().coupon("SAVE10"),
            ts(2025, 1, 1),
        )
        .await
        .unwrap();

    assert_eq!(invoice.amount_base_cents, 1000);
    assert_eq!(invoice.remaining_balance_cents, 900);
    assert_eq!(invoice.due_dt, ts(2025, 1, 8));
    assert_eq!(invoice.end_dt, ts(2025, 2, 8));
    assert!(invoice.includes_trial);

    // Nothing is due during the trial.
    assert_eq!(
        engine
            .settle_all_charge_plan_debt(ts(2025, 1, 5))
            .await
            .unwrap(),
        0
    );

    // Day 8: the invoice is collected in full.
    engine
        .settle_all_charge_plan_debt(ts(2025, 1, 9))
        .await
        .unwrap();
    let settled = store.get_charge_invoice(invoice.id).await.unwrap().unwrap();
    assert!(settled.completed);
    assert_eq!(settled.remaining_balance_cents, 0);
    assert_eq!(settled.amount_paid_cents, 900);

    let transactions = store.all_transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::Sent);
    assert_eq!(transactions[0].amount_cents, 900);
    assert_eq!(settled.transaction_id, Some(transactions[0].id));
    assert_eq!(processor.charges().len(), 1);

    // Settling again is a no-op.
    engine
        .settle_all_charge_plan_debt(ts(2025, 1, 9))
        .await
        .unwrap();
    assert_eq!(store.all_transactions().len(), 1);
    let unchanged = store.get_charge_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(unchanged.amount_paid_cents, 900);

    // Day 39: rollover produces exactly one new invoice, without the trial,
    // still discounted.
    engine.generate_all_invoices(ts(2025, 2, 9)).await.unwrap();
    let invoices = store
        .list_charge_invoices_for_subscription(subscription.id)
        .await
        .unwrap();
    assert_eq!(invoices.len(), 2);
    let next = &invoices[1];
    assert_eq!(next.start_dt, settled.end_dt);
    assert_eq!(next.end_dt, ts(2025, 3, 8));
    assert!(!next.includes_trial);
    assert_eq!(next.cycle, 2);
    assert_eq!(next.remaining_balance_cents, 900);

    // And only one, even if the scan runs again.
    engine.generate_all_invoices(ts(2025, 2, 9)).await.unwrap();
    assert_eq!(
        store
            .list_charge_invoices_for_subscription(subscription.id)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_prorate_then_resubscribe_chains_periods() {
    let (engine, _, _) = engine();
    let plan = engine
        .charges()
        .create_plan(
            "acme",
            "starter",
            "Starter",
            1000,
            Interval::MONTH,
            None,
            ts(2025, 1, 1),
        )
        .await
        .unwrap();

    let (subscription, _) = engine
        .charges()
        .subscribe(plan.id, "cust_1", SubscribeOptions::new(), ts(2025, 1, 1))
        .await
        .unwrap();

    let cut = engine
        .charges()
        .prorate_last(subscription.id, ts(2025, 1, 16))
        .await
        .unwrap();
    assert!(cut.prorated);
    assert_eq!(cut.end_dt, ts(2025, 1, 16));

    let (resumed, next) = engine
        .charges()
        .subscribe(plan.id, "cust_1", SubscribeOptions::new(), ts(2025, 1, 16))
        .await
        .unwrap();
    assert_eq!(resumed.id, subscription.id);
    assert_eq!(next.start_dt, cut.end_dt);
    assert_eq!(next.cycle, 2);
    assert!(resumed.is_renewing());
}

#[tokio::test]
async fn test_coupon_budget_spends_on_the_last_redeemer() {
    let (engine, _, _) = engine();
    let plan = engine
        .charges()
        .create_plan(
            "acme",
            "starter",
            "Starter",
            1000,
            Interval::MONTH,
            None,
            ts(2025, 1, 1),
        )
        .await
        .unwrap();
    engine
        .coupons()
        .create(
            "acme",
            "FIRST1",
            "First subscriber only",
            CouponTerms::new().percent_off(50).max_redeem(1),
            ts(2025, 1, 1),
        )
        .await
        .unwrap();

    // The redemption that consumes the final budget slot still gets its
    // discount.
    let (_, discounted) = engine
        .charges()
        .subscribe(
            plan.id,
            "cust_1",
            SubscribeOptions::new().coupon("FIRST1"),
            ts(2025, 1, 1),
        )
        .await
        .unwrap();
    assert_eq!(discounted.remaining_balance_cents, 500);

    let err = engine
        .charges()
        .subscribe(
            plan.id,
            "cust_2",
            SubscribeOptions::new().coupon("FIRST1"),
            ts(2025, 1, 2),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::LimitReached { .. }));
}

#[tokio::test]
async fn test_repeated_failures_walk_the_retry_table_then_deactivate() {
    let (engine, store, processor) = engine();
    let plan = engine
        .charges()
        .create_plan(
            "acme",
            "starter",
            "Starter",
            1000,
            Interval::MONTH,
            None,
            ts(2025, 1, 1),
        )
        .await
        .unwrap();
    let (subscription, invoice) = engine
        .charges()
        .subscribe(plan.id, "cust_1", SubscribeOptions::new(), ts(2025, 1, 1))
        .await
        .unwrap();
    processor.set_failing(true);

    // Due date, then one day, three days, and seven days later.
    for (tick, expected_attempts) in [
        (ts(2025, 1, 1), 1),
        (ts(2025, 1, 2), 2),
        (ts(2025, 1, 5), 3),
        (ts(2025, 1, 12), 4),
    ] {
        engine.settle_all_charge_plan_debt(tick).await.unwrap();
        let stored = store.get_charge_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts_made, expected_attempts);
    }
    assert_eq!(store.all_transactions().len(), 4);
    assert!(store
        .all_transactions()
        .iter()
        .all(|txn| txn.status == TransactionStatus::Error));

    // The table is exhausted; the next tick gives up on the subscription.
    engine
        .settle_all_charge_plan_debt(ts(2025, 1, 13))
        .await
        .unwrap();
    let abandoned = store
        .get_charge_subscription_by_id(subscription.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!abandoned.is_active);
    assert_eq!(store.all_transactions().len(), 4);

    let stored = store.get_charge_invoice(invoice.id).await.unwrap().unwrap();
    assert!(!stored.completed);
    assert_eq!(stored.remaining_balance_cents, 1000);
}

#[tokio::test]
async fn test_charge_at_period_end_defers_settlement() {
    let (engine, store, _) = engine();
    let plan = engine
        .charges()
        .create_plan(
            "acme",
            "metered",
            "Metered",
            250,
            Interval::MONTH,
            None,
            ts(2025, 1, 1),
        )
        .await
        .unwrap();

    let (_, invoice) = engine
        .charges()
        .subscribe(
            plan.id,
            "cust_1",
            SubscribeOptions::new().quantity(4).charge_at_period_end(true),
            ts(2025, 1, 1),
        )
        .await
        .unwrap();
    assert_eq!(invoice.amount_base_cents, 1000);
    assert_eq!(invoice.due_dt, invoice.end_dt);

    assert_eq!(
        engine
            .settle_all_charge_plan_debt(ts(2025, 1, 20))
            .await
            .unwrap(),
        0
    );

    engine
        .settle_all_charge_plan_debt(ts(2025, 2, 1))
        .await
        .unwrap();
    let settled = store.get_charge_invoice(invoice.id).await.unwrap().unwrap();
    assert!(settled.completed);
    assert_eq!(settled.amount_paid_cents, 1000);
}
