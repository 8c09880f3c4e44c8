use chrono::{DateTime, TimeZone, Utc};
use rebill::{BillingEngine, BillingStore, Config, InMemoryStore, Interval, MockProcessor};

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
async fn test_weekly_sweep_keeps_the_float_and_rolls_over() {
    let (engine, store, processor) = engine();
    let plan = engine
        .payouts()
        .create_plan(
            "acme",
            "weekly-sweep",
            "Weekly sweep",
            500,
            Interval::WEEK,
            ts(2025, 1, 1),
        )
        .await
        .unwrap();
    processor.set_balance("merchant_1", 5000);

    let (subscription, first) = engine
        .payouts()
        .subscribe(plan.id, "merchant_1", None, ts(2025, 1, 1))
        .await
        .unwrap();
    assert_eq!(first.payout_date, ts(2025, 1, 8));

    // Not due until the period ends.
    assert_eq!(engine.make_all_payouts(ts(2025, 1, 5)).await.unwrap(), 0);

    engine.make_all_payouts(ts(2025, 1, 8)).await.unwrap();
    let swept = store.get_payout_invoice(first.id).await.unwrap().unwrap();
    assert!(swept.completed);
    assert_eq!(swept.amount_paid_out, 4500);
    assert_eq!(swept.balance_at_exec, Some(5000));
    assert_eq!(processor.balance("merchant_1"), Some(500));

    // Sweeping again moves nothing.
    engine.make_all_payouts(ts(2025, 1, 8)).await.unwrap();
    assert_eq!(processor.payouts().len(), 1);

    engine.reinvoice_payouts(ts(2025, 1, 8)).await.unwrap();
    let invoices = store
        .list_payout_invoices_for_subscription(subscription.id)
        .await
        .unwrap();
    assert_eq!(invoices.len(), 2);
    let next = &invoices[1];
    assert_eq!(next.start_dt, swept.end_dt);
    assert_eq!(next.payout_date, ts(2025, 1, 15));

    // A week of sales later, the next sweep takes the new surplus.
    processor.set_balance("merchant_1", 2500);
    engine.make_all_payouts(ts(2025, 1, 15)).await.unwrap();
    let swept = store.get_payout_invoice(next.id).await.unwrap().unwrap();
    assert_eq!(swept.amount_paid_out, 2000);
    assert_eq!(processor.balance("merchant_1"), Some(500));
}

#[tokio::test]
async fn test_sweep_below_keep_amount_completes_and_still_rolls() {
    let (engine, store, processor) = engine();
    let plan = engine
        .payouts()
        .create_plan(
            "acme",
            "weekly-sweep",
            "Weekly sweep",
            500,
            Interval::WEEK,
            ts(2025, 1, 1),
        )
        .await
        .unwrap();
    processor.set_balance("merchant_1", 300);

    let (subscription, invoice) = engine
        .payouts()
        .subscribe(plan.id, "merchant_1", None, ts(2025, 1, 1))
        .await
        .unwrap();
    engine.make_all_payouts(ts(2025, 1, 8)).await.unwrap();

    let stored = store.get_payout_invoice(invoice.id).await.unwrap().unwrap();
    assert!(stored.completed);
    assert_eq!(stored.amount_paid_out, 0);
    assert_eq!(stored.balance_at_exec, Some(300));
    assert_eq!(stored.transaction_id, None);
    assert!(processor.payouts().is_empty());
    assert!(store.all_transactions().is_empty());

    // The schedule continues even though nothing moved.
    engine.reinvoice_payouts(ts(2025, 1, 8)).await.unwrap();
    let invoices = store
        .list_payout_invoices_for_subscription(subscription.id)
        .await
        .unwrap();
    assert_eq!(invoices.len(), 2);
    assert_eq!(invoices[1].payout_date, ts(2025, 1, 15));
}

#[tokio::test]
async fn test_unreachable_processor_walks_the_retry_table_then_deactivates() {
    let (engine, store, processor) = engine();
    let plan = engine
        .payouts()
        .create_plan(
            "acme",
            "weekly-sweep",
            "Weekly sweep",
            500,
            Interval::WEEK,
            ts(2025, 1, 1),
        )
        .await
        .unwrap();
    processor.set_failing(true);

    let (subscription, invoice) = engine
        .payouts()
        .subscribe(plan.id, "merchant_1", None, ts(2025, 1, 1))
        .await
        .unwrap();

    // Payout date, then one day, three days, and seven days later.
    for (tick, expected_attempts) in [
        (ts(2025, 1, 8), 1),
        (ts(2025, 1, 9), 2),
        (ts(2025, 1, 12), 3),
        (ts(2025, 1, 19), 4),
    ] {
        engine.make_all_payouts(tick).await.unwrap();
        let stored = store.get_payout_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts_made, expected_attempts);
    }

    // Balance checks never reached the money; no transactions exist.
    assert!(store.all_transactions().is_empty());

    engine.make_all_payouts(ts(2025, 1, 20)).await.unwrap();
    let abandoned = store
        .get_payout_subscription_by_id(subscription.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!abandoned.is_active);
    let stored = store.get_payout_invoice(invoice.id).await.unwrap().unwrap();
    assert!(!stored.completed);
}
