//! Journey: portfolio accounting and the profile projection through the
//! service surface.

use engram_core::{PortfolioEvent, RetrievalRequest, TradeAction};
use engram_e2e_tests::harness::{direct_input, TestHarness};

fn buy(ticker: &str, shares: f64, price: f64) -> PortfolioEvent {
    PortfolioEvent {
        ticker: ticker.into(),
        asset_name: None,
        shares,
        price: Some(price),
        action: TradeAction::Buy,
    }
}

#[tokio::test]
async fn holding_round_trip_and_uniqueness() {
    let harness = TestHarness::new();

    harness.service.portfolio_apply("u1", &buy("NVDA", 10.0, 100.0)).unwrap();
    harness.service.portfolio_apply("u1", &buy("NVDA", 5.0, 130.0)).unwrap();
    harness.service.portfolio_apply("u1", &buy("AAPL", 2.0, 210.0)).unwrap();

    // Round-trip law: the summary lists the holding, one row per ticker
    let summary = harness.service.portfolio_summary("u1").unwrap();
    assert_eq!(summary.positions, 2);
    let nvda = summary
        .holdings
        .iter()
        .find(|holding| holding.ticker == "NVDA")
        .expect("NVDA holding present");
    assert_eq!(nvda.shares, 15.0);
    assert!((nvda.avg_price - 110.0).abs() < 1e-9);

    // Explicit delete closes the position
    assert!(harness.service.portfolio_remove("u1", "NVDA").unwrap());
    let summary = harness.service.portfolio_summary("u1").unwrap();
    assert_eq!(summary.positions, 1);

    // The ledger keeps the whole story
    let transactions = harness.service.portfolio_transactions("u1", None).unwrap();
    assert_eq!(transactions.len(), 4);
}

#[tokio::test]
async fn direct_store_with_portfolio_event_books_the_ledger() {
    let harness = TestHarness::new();

    let mut input = direct_input("u1", "bought 10 shares of NVDA at 120");
    input.portfolio = Some(buy("NVDA", 10.0, 120.0));
    let response = harness.service.direct_store(input).await.unwrap();
    assert_eq!(
        response.storage.get("portfolio"),
        Some(&serde_json::Value::Bool(true))
    );

    let summary = harness.service.portfolio_summary("u1").unwrap();
    assert_eq!(summary.positions, 1);
    assert_eq!(summary.holdings[0].shares, 10.0);
}

#[tokio::test]
async fn finance_queries_attach_portfolio_context() {
    let harness = TestHarness::new();
    harness.service.portfolio_apply("u1", &buy("NVDA", 10.0, 100.0)).unwrap();
    harness
        .service
        .direct_store(direct_input("u1", "thinking about rebalancing the portfolio"))
        .await
        .unwrap();

    let results = harness
        .service
        .retrieve(RetrievalRequest {
            user_id: "u1".into(),
            query: Some("how is my portfolio doing".into()),
            limit: 5,
            ..Default::default()
        })
        .await
        .unwrap();

    let finance = results.finance.expect("finance context attached");
    assert_eq!(finance.holdings.len(), 1);
    assert!((finance.total_cost_basis - 1000.0).abs() < 1e-9);
}

#[tokio::test]
async fn profile_put_view_and_completeness() {
    let harness = TestHarness::new();

    harness
        .service
        .profile_set_field("u1", "basics", "occupation", "staff engineer")
        .unwrap();
    harness
        .service
        .profile_set_field("u1", "goals", "short_term", "ship the migration")
        .unwrap();

    let view = harness.service.profile_view("u1", None).unwrap();
    assert_eq!(view.categories.len(), 2);
    assert_eq!(view.categories["basics"][0].value, "staff engineer");
    assert_eq!(view.categories["basics"][0].explicitness, 1.0);

    let category_view = harness.service.profile_view("u1", Some("basics")).unwrap();
    assert_eq!(category_view.categories.len(), 1);

    let completeness = harness.service.profile_completeness("u1").unwrap();
    assert_eq!(completeness.populated_fields, 2);
    assert!(completeness.percent > 0.0);

    // Unknown category is rejected at the boundary
    assert!(harness
        .service
        .profile_set_field("u1", "astrology", "sign", "leo")
        .is_err());
}

#[tokio::test]
async fn profile_observations_ride_memory_metadata() {
    let harness = TestHarness::new();

    let mut input = direct_input("u1", "I have been a nurse in Oakland for six years");
    input.metadata.insert(
        "profile".into(),
        serde_json::json!({
            "category": "basics",
            "field": "occupation",
            "value": "nurse",
            "explicit": true
        }),
    );
    let response = harness.service.direct_store(input).await.unwrap();

    let view = harness.service.profile_view("u1", Some("basics")).unwrap();
    let occupation = &view.categories["basics"][0];
    assert_eq!(occupation.value, "nurse");
    // The audit trail links the contributing memory
    assert!(occupation.sources.contains(&response.memory_id));
}
