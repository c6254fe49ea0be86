use std::sync::Arc;

use medes_core::Reliability;
use medes_llm::ScriptedChatModel;
use medes_pipeline::Pipeline;
use serde_json::{json, Value};

fn test_row() -> Value {
    json!({
        "name": "Test Hospital",
        "capability": "[\"Emergency Room\", \"X-Ray\"]",
        "specialties": "[\"Cardiology\"]",
    })
}

#[tokio::test]
async fn full_pipeline_with_successful_llm_calls() {
    let llm = ScriptedChatModel::new([
        // Stage 2: schema mapper.
        "```json\n{\"organization_info\": {\"organization_type\": \"hospital\"}, \"location_info\": {\"address_line1\": null, \"country\": \"Ghana\"}}\n```",
        // Stage 3: capability enricher.
        "{\"contact_info\": {\"phone_numbers\": []}, \"medical_details\": {\"specialties\": [\"Cardiology\"]}, \"client_capability\": \"Emergency care, X-Ray imaging and cardiology.\"}",
        // Stage 4: reliability auditor.
        "Here is my audit: {\"reliability\": \"High\", \"reliability_reasons\": [\"Capabilities and specialties are mutually consistent\"], \"stats\": {\"score\": 88}}",
    ]);

    let pipeline = Pipeline::new(Arc::new(llm));
    let batch = pipeline.run(&[test_row()]).await;
    assert_eq!(batch.len(), 1);
    let record = &batch[0];

    assert_eq!(record.reliability, Some(Reliability::High));
    let stats: Value = serde_json::from_str(&record.stats).expect("stats must be valid JSON");
    assert_eq!(stats["score"], json!(88));
    let reasons: Value = serde_json::from_str(&record.reliability_reasons).unwrap();
    assert_ne!(reasons, json!(["Assessment failed."]));
    assert_eq!(
        record.client_capability.as_deref(),
        Some("Emergency care, X-Ray imaging and cardiology.")
    );
    assert!(record.created_at.as_deref().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn full_pipeline_under_total_llm_unavailability() {
    // An exhausted scripted model fails every call with a transport error.
    let pipeline = Pipeline::new(Arc::new(ScriptedChatModel::default()));
    let batch = pipeline.run(&[test_row()]).await;
    assert_eq!(batch.len(), 1);
    let record = &batch[0];

    // No source_url on the row, so the heuristic lands on Low.
    assert_eq!(record.reliability, Some(Reliability::Low));
    let stats: Value = serde_json::from_str(&record.stats).unwrap();
    assert_eq!(stats["score"], json!(50));
    let reasons: Value = serde_json::from_str(&record.reliability_reasons).unwrap();
    assert_ne!(reasons, json!(["Assessment failed."]));
    assert!(reasons.as_array().unwrap()[0]
        .as_str()
        .unwrap()
        .starts_with("Auto-assigned"));

    // Every composite field stays a syntactically valid JSON string.
    for composite in [
        &record.organization_info,
        &record.location_info,
        &record.contact_info,
        &record.medical_details,
        &record.stats,
        &record.reliability_reasons,
    ] {
        serde_json::from_str::<Value>(composite).expect("composite must be valid JSON");
    }
}
