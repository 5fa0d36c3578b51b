//! End-to-end scenarios through the orchestrator with scripted models.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use expense_ops::agents::{
    CraRulesStage, ExtractionStage, NullSearch, Orchestrator, Pathway, ProcessOptions,
};
use expense_ops::domain::{Category, ExpenseOpsError};
use expense_ops::engine::RulesEngine;
use expense_ops::ingestion::FileProcessor;
use expense_ops::observability::{audit, AuditKind, AuditWriter};

use helpers::{dec, orchestrator, png_artifact, ScriptedText, ScriptedVision, StaticSearch};

const RESTAURANT_RECEIPT: &str = r#"{
    "vendor_name": "The Keg",
    "transaction_date": "2024-03-15",
    "currency": "CAD",
    "subtotal": 34.73,
    "tax_amount": 1.50,
    "tip_amount": 0,
    "total_amount": 36.23,
    "line_items": [
        {"line_number": 1, "description": "Restaurant meal", "quantity": 1,
         "unit_price": 34.73, "total_price": 34.73}
    ]
}"#;

const RESTAURANT_CATEGORIES: &str = r#"{"processed_items":[
    {"line_number":1,"category":"Meals & Entertainment","deductibility_percent":50,"reasoning":"business meal, 50% limit"},
    {"line_number":2,"category":"Tax-GST/HST","deductibility_percent":100,"reasoning":"input tax credit"}
]}"#;

#[tokio::test]
async fn simple_restaurant_receipt_totals() {
    // One meal line plus a synthesized GST line: 17.37 + 1.50 deductible
    let orchestrator = orchestrator(
        ScriptedVision::new(vec![RESTAURANT_RECEIPT]),
        ScriptedText::new(vec![RESTAURANT_CATEGORIES]),
        Arc::new(StaticSearch::with_cra_passages()),
    );

    let result = orchestrator
        .process(png_artifact(), ProcessOptions::default())
        .await
        .unwrap();

    assert_eq!(result.items.len(), 2);
    assert_eq!(result.items[0].category, Category::MealsEntertainment);
    assert_eq!(result.items[0].deductible_amount, dec("17.37"));
    assert_eq!(result.items[1].category, Category::TaxGstHst);
    assert_eq!(result.items[1].original_amount, dec("1.50"));
    assert_eq!(result.items[1].deductible_amount, dec("1.50"));

    assert_eq!(result.total_deductible, dec("18.87"));
    assert_eq!(result.deductibility_rate, dec("52.1"));
    assert_eq!(result.overall_confidence, 1.0);
    assert!(result.flags_for_review.is_empty());

    // Tax-relevant categories carry citations when retrieval found passages
    assert!(!result.items[0].citations.is_empty());
    assert!(!result.items[1].citations.is_empty());
}

const HOTEL_RECEIPT: &str = r#"{
    "vendor_name": "Courtyard by Marriott Edmonton",
    "transaction_date": "2024-05-21",
    "currency": "CAD",
    "subtotal": 441.90,
    "tax_amount": 0,
    "tip_amount": 0,
    "total_amount": 474.34,
    "line_items": [
        {"line_number": 1, "description": "Room charge", "unit_price": 175.00, "total_price": 175.00},
        {"line_number": 2, "description": "Restaurant room charge", "unit_price": 40.70, "total_price": 40.70},
        {"line_number": 3, "description": "Marketing fee", "unit_price": 5.25, "total_price": 5.25},
        {"line_number": 4, "description": "GST", "unit_price": 9.01, "total_price": 9.01},
        {"line_number": 5, "description": "Tourism levy", "unit_price": 7.21, "total_price": 7.21},
        {"line_number": 6, "description": "Room charge", "unit_price": 175.00, "total_price": 175.00},
        {"line_number": 7, "description": "Restaurant room charge", "unit_price": 40.70, "total_price": 40.70},
        {"line_number": 8, "description": "Marketing fee", "unit_price": 5.25, "total_price": 5.25},
        {"line_number": 9, "description": "GST", "unit_price": 9.01, "total_price": 9.01},
        {"line_number": 10, "description": "Tourism levy", "unit_price": 7.21, "total_price": 7.21}
    ]
}"#;

#[tokio::test]
async fn hotel_receipt_through_rule_pathway() {
    // The vendor-qualified rules decide every line, including the marketing
    // fee, which the generic keyword rule would have called a professional
    // service
    let orchestrator = orchestrator(
        ScriptedVision::new(vec![HOTEL_RECEIPT]),
        ScriptedText::new(vec!["unused"]),
        Arc::new(NullSearch),
    );

    let result = orchestrator
        .process(
            png_artifact(),
            ProcessOptions {
                pathway: Pathway::Rules,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let by_line =
        |n: u32| result.items.iter().find(|i| i.line_number == n).unwrap();

    assert_eq!(by_line(1).category, Category::TravelLodging);
    assert_eq!(by_line(2).category, Category::TravelMeals);
    assert_eq!(by_line(2).deductibility_percent, 50);
    assert_eq!(by_line(3).category, Category::TravelLodging);
    assert_eq!(by_line(4).category, Category::TaxGstHst);
    assert_eq!(by_line(5).category, Category::TravelTaxes);

    // Mirror lines from the second night categorize identically
    assert_eq!(by_line(6).category, by_line(1).category);
    assert_eq!(by_line(8).category, by_line(3).category);

    // lodging (175.00 + 5.25) * 2 + meals 40.70 + gst 18.02 + levy 14.42
    assert_eq!(result.total_deductible, dec("433.64"));
    assert_eq!(result.total_original, dec("474.34"));
    assert_eq!(result.deductibility_rate, dec("91.4"));
}

const AMBIGUOUS_RECEIPT: &str = r#"{
    "vendor_name": "Harrods",
    "transaction_date": "2024-02-02",
    "currency": "GBP",
    "subtotal": 830.00,
    "tax_amount": 0,
    "tip_amount": 0,
    "total_amount": 830.00,
    "line_items": [
        {"line_number": 1, "description": "Cookshop", "unit_price": 30.00, "total_price": 30.00},
        {"line_number": 2, "description": "Business suit", "unit_price": 800.00, "total_price": 800.00}
    ]
}"#;

const AMBIGUOUS_CATEGORIES: &str = r#"{"processed_items":[
    {"line_number":1,"category":"Uncategorized-Review-Required","deductibility_percent":0,"reasoning":"retail purchase with unclear business purpose"},
    {"line_number":2,"category":"Uncategorized-Review-Required","deductibility_percent":0,"reasoning":"clothing is a personal expense absent specific conditions"}
]}"#;

#[tokio::test]
async fn ambiguous_retail_flags_everything_for_review() {
    let orchestrator = orchestrator(
        ScriptedVision::new(vec![AMBIGUOUS_RECEIPT]),
        ScriptedText::new(vec![AMBIGUOUS_CATEGORIES]),
        Arc::new(StaticSearch::with_cra_passages()),
    );

    let result = orchestrator
        .process(png_artifact(), ProcessOptions::default())
        .await
        .unwrap();

    assert_eq!(result.total_deductible, dec("0.00"));
    assert!(result
        .items
        .iter()
        .all(|i| i.category == Category::UncategorizedReviewRequired));
    assert!(result.items.iter().all(|i| !i.reasoning.is_empty()));
    assert!(!result.flags_for_review.is_empty());
}

#[tokio::test]
async fn canceled_before_start_returns_canceled() {
    let orchestrator = orchestrator(
        ScriptedVision::new(vec![RESTAURANT_RECEIPT]),
        ScriptedText::new(vec![RESTAURANT_CATEGORIES]),
        Arc::new(NullSearch),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = orchestrator
        .process(
            png_artifact(),
            ProcessOptions {
                cancel,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ExpenseOpsError::Canceled));
    assert_eq!(err.exit_code(), 130);
}

#[tokio::test]
async fn llm_failure_falls_back_to_rules_when_enabled() {
    let audit = expense_ops::observability::AuditLogger::disabled();
    let orchestrator = Orchestrator::new(
        FileProcessor::new(audit.clone()),
        ExtractionStage::new(
            Arc::new(ScriptedVision::new(vec![RESTAURANT_RECEIPT])),
            None,
            Duration::from_secs(30),
        ),
        CraRulesStage::new(
            Arc::new(ScriptedText::new(vec!["not json", "still not json"])),
            Arc::new(NullSearch),
            None,
            Duration::from_secs(30),
        ),
        Arc::new(RulesEngine::with_defaults()),
        audit,
        "BC".to_string(),
    )
    .with_fallback_to_rules(true);

    let result = orchestrator
        .process(png_artifact(), ProcessOptions::default())
        .await
        .unwrap();

    // Rule engine categorized the meal line; the fallback is flagged
    assert_eq!(result.items[0].category, Category::MealsEntertainment);
    assert!(result
        .flags_for_review
        .iter()
        .any(|f| f.contains("rule engine used")));
}

#[tokio::test]
async fn llm_failure_without_fallback_aborts() {
    let orchestrator = orchestrator(
        ScriptedVision::new(vec![RESTAURANT_RECEIPT]),
        ScriptedText::new(vec!["not json", "still not json"]),
        Arc::new(NullSearch),
    );
    let err = orchestrator
        .process(png_artifact(), ProcessOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExpenseOpsError::CategorizationFailed(_)));
}

#[tokio::test]
async fn audit_trail_is_ordered_within_correlation() {
    let dir = tempfile::tempdir().unwrap();
    let (audit_log, _handle) = AuditWriter::spawn(dir.path().to_path_buf(), Vec::new());

    let orchestrator = Orchestrator::new(
        FileProcessor::new(audit_log.clone()),
        ExtractionStage::new(
            Arc::new(ScriptedVision::new(vec![RESTAURANT_RECEIPT])),
            None,
            Duration::from_secs(30),
        ),
        CraRulesStage::new(
            Arc::new(ScriptedText::new(vec![RESTAURANT_CATEGORIES])),
            Arc::new(NullSearch),
            None,
            Duration::from_secs(30),
        ),
        Arc::new(RulesEngine::with_defaults()),
        audit_log.clone(),
        "BC".to_string(),
    );

    orchestrator
        .process(png_artifact(), ProcessOptions::default())
        .await
        .unwrap();
    audit_log.flush().await;

    let events = audit::iter_events(dir.path()).unwrap();
    let kinds: Vec<AuditKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AuditKind::ReceiptStart,
            AuditKind::StageComplete,
            AuditKind::StageComplete,
            AuditKind::ReceiptDone,
        ]
    );
    // All four belong to the same correlation ID
    let first = &events[0].correlation_id;
    assert!(events.iter().all(|e| &e.correlation_id == first));
}
