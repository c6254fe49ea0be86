//! Four-stage facility enrichment pipeline: normalize, map schema, enrich
//! capabilities, audit reliability.
//!
//! Stages 2-4 each issue one LLM call and contain its failure behind a
//! documented fallback, so a bad completion never aborts the batch. The
//! orchestrator isolates each row: anything escaping Stage 1 drops that row
//! and processing continues.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, SecondsFormat, Utc};
use medes_core::{CanonicalRecord, Reliability, TranslatedRecord, LIST_FIELDS};
use medes_llm::{extract_json, ChatModel, LlmError, DEFAULT_MAX_TOKENS};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "medes-pipeline";

const PROGRESS_EVERY: usize = 5;
const SYSTEM_JSON_ONLY: &str = "Output ONLY valid JSON.";

/// Per-row failure escaping the stage chain. Rows failing this way are
/// dropped from the output batch; the batch itself never fails.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("raw row is not a JSON object")]
    NotAnObject,
    #[error("row does not fit the canonical shape: {0}")]
    Shape(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Stage 1: splitter/normalizer. Pure and deterministic, no LLM call.
// ---------------------------------------------------------------------------

/// Sanitizes one raw row into a canonical record: absent-value scrubbing,
/// identifier aliasing, list-field enforcement. Idempotent.
pub fn normalize_row(raw: &Value) -> Result<CanonicalRecord, RowError> {
    let source = raw.as_object().ok_or(RowError::NotAnObject)?;

    let mut row = Map::with_capacity(source.len() + 2);
    for (key, value) in source {
        row.insert(key.clone(), scrub_absent(value));
    }

    if let Some(pk) = row.get("pk_unique_id").cloned() {
        if !row.contains_key("id") {
            row.insert("id".to_string(), pk);
        }
    }
    if !row.contains_key("unique_id") {
        let id = row.get("id").cloned().unwrap_or(Value::Null);
        row.insert("unique_id".to_string(), id);
    }

    for field in LIST_FIELDS {
        let aliased = field.raw_alias.and_then(|alias| row.remove(alias));
        let current = row.remove(field.name).or(aliased);
        row.insert(field.name.to_string(), coerce_list(current));
    }

    Ok(serde_json::from_value(Value::Object(row))?)
}

/// Upstream CSV exports spell absent numerics as the string "NaN"; JSON
/// itself cannot carry a float NaN.
fn scrub_absent(value: &Value) -> Value {
    match value {
        Value::String(s) if s == "NaN" || s == "nan" => Value::Null,
        other => other.clone(),
    }
}

fn coerce_list(value: Option<Value>) -> Value {
    match value {
        None | Some(Value::Null) => Value::Array(Vec::new()),
        Some(Value::Array(items)) => Value::Array(items),
        Some(Value::String(s)) => {
            if s.starts_with('[') {
                // The single-quote substitution is lossy for items containing
                // apostrophes; those parses fail and fall back to a singleton.
                match serde_json::from_str::<Value>(&s.replace('\'', "\"")) {
                    Ok(Value::Array(items)) => Value::Array(items),
                    _ => Value::Array(vec![Value::String(s)]),
                }
            } else {
                Value::Array(vec![Value::String(s)])
            }
        }
        Some(scalar) => Value::Array(vec![scalar]),
    }
}

// ---------------------------------------------------------------------------
// Stage 2: schema mapper.
// ---------------------------------------------------------------------------

/// Builds the full publish-schema skeleton, then asks the model for the two
/// nested structures. Gateway and parse failures are contained here: the
/// record falls back to minimal stubs and the stage never propagates.
pub async fn map_schema(
    llm: &dyn ChatModel,
    canonical: &CanonicalRecord,
    max_tokens: u32,
) -> TranslatedRecord {
    let mut translated = TranslatedRecord::skeleton(canonical);

    match request_structures(llm, canonical, max_tokens).await {
        Ok(data) => {
            translated.organization_info = composite_or_empty(&data, "organization_info");
            translated.location_info = composite_or_empty(&data, "location_info");
        }
        Err(err) => {
            warn!(stage = "schema_mapper", error = %err, "LLM mapping failed; using stub structures");
            translated.organization_info = json!({"organization_type": "facility"}).to_string();
            translated.location_info =
                json!({"address_line1": canonical.address_line1}).to_string();
        }
    }

    translated
}

async fn request_structures(
    llm: &dyn ChatModel,
    canonical: &CanonicalRecord,
    max_tokens: u32,
) -> Result<Value, LlmError> {
    let input = canonical_json(canonical);
    let prompt = format!(
        "Extract 'organization_info' and 'location_info' from this data.\n\
         Return a JSON object with exactly these 2 keys.\n\
         Input: {input}"
    );
    let raw = llm.generate(&prompt, SYSTEM_JSON_ONLY, max_tokens).await?;
    extract_json(&raw)
}

fn composite_or_empty(data: &Value, key: &str) -> String {
    data.get(key)
        .map(Value::to_string)
        .unwrap_or_else(|| "{}".to_string())
}

fn canonical_json(canonical: &CanonicalRecord) -> String {
    serde_json::to_string(canonical).unwrap_or_else(|_| "{}".to_string())
}

// ---------------------------------------------------------------------------
// Stage 3: capability enricher.
// ---------------------------------------------------------------------------

/// Merges contact info, medical details and the capability summary into the
/// translated record. Only keys present in the response are written; on any
/// failure the record is left exactly as received.
pub async fn enrich_capabilities(
    llm: &dyn ChatModel,
    canonical: &CanonicalRecord,
    translated: &mut TranslatedRecord,
    max_tokens: u32,
) {
    match request_capabilities(llm, canonical, max_tokens).await {
        Ok(data) => {
            if let Some(v) = data.get("contact_info") {
                translated.contact_info = v.to_string();
            }
            if let Some(v) = data.get("medical_details") {
                translated.medical_details = v.to_string();
            }
            if let Some(summary) = data.get("client_capability").and_then(Value::as_str) {
                translated.client_capability = Some(summary.to_string());
            }
        }
        Err(err) => {
            warn!(stage = "capability_enricher", error = %err, "LLM enrichment failed; keeping prior values");
        }
    }
}

async fn request_capabilities(
    llm: &dyn ChatModel,
    canonical: &CanonicalRecord,
    max_tokens: u32,
) -> Result<Value, LlmError> {
    let input = canonical_json(canonical);
    let prompt = format!(
        "Analyze the facility record and create:\n\
         1. contact_info (object: phone_numbers, websites, email)\n\
         2. medical_details (object: specialties, procedures)\n\
         3. client_capability (string summary of what the facility can do for a patient)\n\
         \n\
         Record: {input}"
    );
    let raw = llm.generate(&prompt, SYSTEM_JSON_ONLY, max_tokens).await?;
    extract_json(&raw)
}

// ---------------------------------------------------------------------------
// Stage 4: reliability auditor. The pipeline's correctness backstop.
// ---------------------------------------------------------------------------

/// Asks the model for a trust grade, reasons and stats, then applies the
/// unconditional guarantees: a non-null reliability grade, non-empty stats,
/// and a fresh `created_at` stamp, even under total LLM unavailability.
pub async fn audit_reliability(
    llm: &dyn ChatModel,
    translated: &mut TranslatedRecord,
    max_tokens: u32,
) {
    match request_audit(llm, translated, max_tokens).await {
        Ok(data) => {
            // An unrecognized grade string is ignored so the heuristic below
            // still applies.
            if let Some(grade) = data
                .get("reliability")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Reliability>().ok())
            {
                translated.reliability = Some(grade);
            }
            if let Some(v) = data.get("reliability_reasons") {
                translated.reliability_reasons = v.to_string();
            }
            if let Some(v) = data.get("stats") {
                translated.stats = v.to_string();
            }
        }
        Err(err) => {
            warn!(stage = "reliability_auditor", error = %err, "LLM audit failed; applying heuristic");
        }
    }

    if translated.reliability.is_none() {
        let has_name = translated.name.as_deref().is_some_and(|s| !s.is_empty());
        let has_source = translated.source_url.as_deref().is_some_and(|s| !s.is_empty());
        if has_name && has_source {
            translated.reliability = Some(Reliability::Moderate);
            translated.reliability_reasons =
                json!(["Auto-assigned Moderate: Basic info present but LLM audit skipped."])
                    .to_string();
        } else {
            translated.reliability = Some(Reliability::Low);
            translated.reliability_reasons =
                json!(["Auto-assigned Low: Missing core identifiers."]).to_string();
        }
    }

    if translated.stats.is_empty() || translated.stats == "{}" {
        translated.stats = json!({"score": 50, "note": "Heuristic Default"}).to_string();
    }

    translated.created_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true));
}

async fn request_audit(
    llm: &dyn ChatModel,
    translated: &TranslatedRecord,
    max_tokens: u32,
) -> Result<Value, LlmError> {
    let input = serde_json::to_string(translated).unwrap_or_else(|_| "{}".to_string());
    let prompt = format!(
        "Determine 'reliability' (High/Moderate/Low) and 'reliability_reasons' (list).\n\
         Create a 'stats' object with a score (0-100).\n\
         Input: {input}"
    );
    let raw = llm.generate(&prompt, SYSTEM_JSON_ONLY, max_tokens).await?;
    extract_json(&raw)
}

// ---------------------------------------------------------------------------
// Orchestrator.
// ---------------------------------------------------------------------------

/// Drives rows through stages 1-4 in fixed order, one canonical record and
/// one translated record per row, no shared mutable state across rows.
pub struct Pipeline {
    llm: Arc<dyn ChatModel>,
    max_tokens: u32,
}

impl Pipeline {
    pub fn new(llm: Arc<dyn ChatModel>) -> Self {
        Self {
            llm,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub async fn process_row(&self, raw: &Value) -> Result<TranslatedRecord, RowError> {
        process_one(self.llm.as_ref(), self.max_tokens, raw).await
    }

    /// Sequential reference path: rows in input order, failed rows skipped
    /// with a warning, progress reported every few rows.
    pub async fn run(&self, rows: &[Value]) -> Vec<TranslatedRecord> {
        info!(rows = rows.len(), "processing rows through the four-stage pipeline");
        let mut batch = Vec::with_capacity(rows.len());
        for (index, raw) in rows.iter().enumerate() {
            match process_one(self.llm.as_ref(), self.max_tokens, raw).await {
                Ok(record) => batch.push(record),
                Err(err) => {
                    warn!(row = index, name = display_name(raw), error = %err, "skipping row");
                }
            }
            if (index + 1) % PROGRESS_EVERY == 0 {
                info!(completed = index + 1, total = rows.len(), "pipeline progress");
            }
        }
        batch
    }

    /// Row-parallel path: at most `max_in_flight` rows in flight, per-row
    /// isolation preserved, output re-ordered to input order.
    pub async fn run_concurrent(
        &self,
        rows: Vec<Value>,
        max_in_flight: usize,
    ) -> Vec<TranslatedRecord> {
        let total = rows.len();
        info!(rows = total, max_in_flight, "processing rows concurrently");
        let limit = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let mut tasks = JoinSet::new();

        for (index, raw) in rows.into_iter().enumerate() {
            let llm = Arc::clone(&self.llm);
            let limit = Arc::clone(&limit);
            let max_tokens = self.max_tokens;
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let outcome = process_one(llm.as_ref(), max_tokens, &raw).await;
                if let Err(err) = &outcome {
                    warn!(row = index, name = display_name(&raw), error = %err, "skipping row");
                }
                (index, outcome)
            });
        }

        let mut finished: Vec<(usize, TranslatedRecord)> = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(record))) => finished.push((index, record)),
                Ok((_, Err(_))) => {}
                Err(err) => warn!(error = %err, "row task failed to join"),
            }
        }
        finished.sort_unstable_by_key(|(index, _)| *index);
        finished.into_iter().map(|(_, record)| record).collect()
    }
}

async fn process_one(
    llm: &dyn ChatModel,
    max_tokens: u32,
    raw: &Value,
) -> Result<TranslatedRecord, RowError> {
    let canonical = normalize_row(raw)?;
    let mut translated = map_schema(llm, &canonical, max_tokens).await;
    enrich_capabilities(llm, &canonical, &mut translated, max_tokens).await;
    audit_reliability(llm, &mut translated, max_tokens).await;
    Ok(translated)
}

fn display_name(raw: &Value) -> &str {
    raw.get("name").and_then(Value::as_str).unwrap_or("Unknown")
}

// ---------------------------------------------------------------------------
// Upstream preprocessing: scalar cleaning + merge-by-identifier dedup.
// ---------------------------------------------------------------------------

/// Collapses rows sharing a `pk_unique_id` into one canonical row: list
/// columns union with value-equality dedup, source URLs pipe-joined, other
/// scalars first-non-null. Rows without the identifier pass through after
/// the same scalar cleaning. First-appearance order is preserved.
pub fn merge_duplicate_rows(rows: Vec<Value>) -> Vec<Value> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Map<String, Value>>> = HashMap::new();
    let mut passthrough: Vec<Value> = Vec::new();

    for row in rows {
        let Value::Object(obj) = row else {
            passthrough.push(row);
            continue;
        };
        let cleaned: Map<String, Value> = obj
            .into_iter()
            .map(|(key, value)| (key, clean_scalar(value)))
            .collect();
        match cleaned.get("pk_unique_id").filter(|v| !v.is_null()) {
            Some(id) => {
                let key = scalar_key(id);
                if !groups.contains_key(&key) {
                    order.push(key.clone());
                }
                groups.entry(key).or_default().push(cleaned);
            }
            None => passthrough.push(Value::Object(cleaned)),
        }
    }

    let mut merged = Vec::with_capacity(order.len() + passthrough.len());
    for key in order {
        if let Some(group) = groups.remove(&key) {
            merged.push(Value::Object(merge_group(group)));
        }
    }
    merged.extend(passthrough);
    merged
}

fn clean_scalar(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed == "null" {
                Value::Null
            } else if trimmed.len() == s.len() {
                Value::String(s)
            } else {
                Value::String(trimmed.to_string())
            }
        }
        other => other,
    }
}

fn scalar_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn merge_group(group: Vec<Map<String, Value>>) -> Map<String, Value> {
    let mut columns: Vec<String> = Vec::new();
    for row in &group {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }

    let mut out = Map::with_capacity(columns.len());
    for column in columns {
        let value = if is_list_column(&column) {
            Value::Array(union_list_values(&group, &column))
        } else if column == "source_url" {
            merge_source_urls(&group)
        } else {
            first_non_null(&group, &column)
        };
        out.insert(column, value);
    }
    out
}

fn is_list_column(name: &str) -> bool {
    LIST_FIELDS
        .iter()
        .any(|f| f.name == name || f.raw_alias == Some(name))
}

fn union_list_values(group: &[Map<String, Value>], column: &str) -> Vec<Value> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for row in group {
        let Some(value) = row.get(column) else { continue };
        let items = match value {
            Value::Array(items) => items.clone(),
            Value::String(s) if s.starts_with('[') => match serde_json::from_str::<Value>(s) {
                Ok(Value::Array(items)) => items,
                _ => continue,
            },
            _ => continue,
        };
        for item in items {
            let key = match &item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if seen.insert(key) {
                out.push(item);
            }
        }
    }
    out
}

fn merge_source_urls(group: &[Map<String, Value>]) -> Value {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut urls: Vec<&str> = Vec::new();
    for row in group {
        let Some(url) = row.get("source_url").and_then(Value::as_str) else {
            continue;
        };
        let url = url.trim();
        if !url.is_empty() && seen.insert(url) {
            urls.push(url);
        }
    }
    Value::String(urls.join(" | "))
}

fn first_non_null(group: &[Map<String, Value>], column: &str) -> Value {
    for row in group {
        match row.get(column) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) if s.trim().is_empty() => continue,
            Some(value) => return value.clone(),
        }
    }
    Value::Null
}

// ---------------------------------------------------------------------------
// Output sink: per-run parquet + JSON snapshot with a hashed manifest.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BatchManifest {
    pub schema_version: u32,
    pub files: Vec<BatchManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_rows: usize,
    pub enriched_rows: usize,
    pub skipped_rows: usize,
    pub output_dir: String,
}

/// Writes the batch under `<out_dir>/<run_id>/` as `records.parquet`,
/// `records.json` and `manifest.json`; returns the run directory.
pub async fn write_batch(
    out_dir: &Path,
    run_id: Uuid,
    records: &[TranslatedRecord],
) -> Result<PathBuf> {
    let run_dir = out_dir.join(run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let parquet_path = run_dir.join("records.parquet");
    write_records_parquet(&parquet_path, records)?;

    let json_path = run_dir.join("records.json");
    let json_bytes = serde_json::to_vec_pretty(records).context("serializing records snapshot")?;
    fs::write(&json_path, json_bytes)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;

    let manifest = BatchManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("records", &run_dir, &parquet_path)?,
            manifest_entry("records_json", &run_dir, &json_path)?,
        ],
    };
    let manifest_path = run_dir.join("manifest.json");
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing batch manifest")?;
    fs::write(&manifest_path, manifest_bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(run_dir)
}

fn write_records_parquet(path: &Path, records: &[TranslatedRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, true),
        ArrowField::new("name", DataType::Utf8, true),
        ArrowField::new("source_url", DataType::Utf8, true),
        ArrowField::new("description", DataType::Utf8, true),
        ArrowField::new("mission_statement", DataType::Utf8, true),
        ArrowField::new("organization_description", DataType::Utf8, true),
        ArrowField::new("organization_info", DataType::Utf8, false),
        ArrowField::new("location_info", DataType::Utf8, false),
        ArrowField::new("contact_info", DataType::Utf8, false),
        ArrowField::new("medical_details", DataType::Utf8, false),
        ArrowField::new("client_capability", DataType::Utf8, true),
        ArrowField::new("reliability", DataType::Utf8, true),
        ArrowField::new("reliability_reasons", DataType::Utf8, false),
        ArrowField::new("stats", DataType::Utf8, false),
        ArrowField::new("social_media_links", DataType::Utf8, true),
        ArrowField::new("embedding", DataType::Utf8, true),
        ArrowField::new("created_at", DataType::Utf8, true),
    ]));

    let columns: Vec<ArrayRef> = vec![
        opt_column(records, |r| id_string(&r.id)),
        opt_column(records, |r| r.name.clone()),
        opt_column(records, |r| r.source_url.clone()),
        opt_column(records, |r| r.description.clone()),
        opt_column(records, |r| r.mission_statement.clone()),
        opt_column(records, |r| r.organization_description.clone()),
        str_column(records, |r| r.organization_info.as_str()),
        str_column(records, |r| r.location_info.as_str()),
        str_column(records, |r| r.contact_info.as_str()),
        str_column(records, |r| r.medical_details.as_str()),
        opt_column(records, |r| r.client_capability.clone()),
        opt_column(records, |r| r.reliability.map(|g| g.to_string())),
        str_column(records, |r| r.reliability_reasons.as_str()),
        str_column(records, |r| r.stats.as_str()),
        opt_column(records, |r| r.social_media_links.clone()),
        opt_column(records, |r| r.embedding.clone()),
        opt_column(records, |r| r.created_at.clone()),
    ];

    let batch = RecordBatch::try_new(schema, columns).context("building records batch")?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn opt_column(
    records: &[TranslatedRecord],
    get: fn(&TranslatedRecord) -> Option<String>,
) -> ArrayRef {
    Arc::new(StringArray::from(
        records.iter().map(get).collect::<Vec<Option<String>>>(),
    ))
}

fn str_column(records: &[TranslatedRecord], get: fn(&TranslatedRecord) -> &str) -> ArrayRef {
    Arc::new(StringArray::from(
        records.iter().map(|r| Some(get(r))).collect::<Vec<_>>(),
    ))
}

fn id_string(id: &Option<Value>) -> Option<String> {
    match id {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<BatchManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(BatchManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

// ---------------------------------------------------------------------------
// Run configuration + batch driver.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default = "default_preprocess")]
    pub preprocess: bool,
}

fn default_concurrency() -> usize {
    1
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_preprocess() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_tokens: default_max_tokens(),
            model_name: None,
            preprocess: default_preprocess(),
        }
    }
}

impl RunConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }
}

/// Preprocesses, enriches and persists one batch, returning the run summary.
pub async fn run_batch(
    llm: Arc<dyn ChatModel>,
    rows: Vec<Value>,
    config: &RunConfig,
    out_dir: &Path,
) -> Result<EnrichmentRunSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let rows = if config.preprocess {
        merge_duplicate_rows(rows)
    } else {
        rows
    };
    let input_rows = rows.len();

    let pipeline = Pipeline::new(llm).with_max_tokens(config.max_tokens);
    let batch = if config.concurrency > 1 {
        pipeline.run_concurrent(rows, config.concurrency).await
    } else {
        pipeline.run(&rows).await
    };
    let enriched_rows = batch.len();

    let run_dir = write_batch(out_dir, run_id, &batch).await?;
    let finished_at = Utc::now();

    Ok(EnrichmentRunSummary {
        run_id,
        started_at,
        finished_at,
        input_rows,
        enriched_rows,
        skipped_rows: input_rows - enriched_rows,
        output_dir: run_dir.display().to_string(),
    })
}
