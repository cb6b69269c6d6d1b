//! Built-in stage handlers.
//!
//! Structural, context-only implementations of the five pipeline stages:
//! they operate on the bookmark records carried in the task context and
//! never touch the network. Production deployments swap in network- and
//! AI-backed handlers through the same `StageHandler` contract; the
//! orchestrator cannot tell the difference.
//!
//! Context shape: `{"bookmarks": [{"id": "...", "url": "..."}, ...]}`.

use std::collections::BTreeMap;

use bookmarch_core::stage::handler::{StageHandler, StageInput, StageOutput};
use bookmarch_core::stage::registry::StageRegistry;
use bookmarch_types::config::EngineConfig;
use bookmarch_types::error::StageError;
use bookmarch_types::stage::{StageCapability, StageName};
use serde_json::json;

/// Register the built-in handlers with policies from configuration.
pub fn register_builtin_stages(registry: &StageRegistry, config: &EngineConfig) {
    for stage in StageName::ALL {
        let mut capability = StageCapability::new(stage, config.policy_for(stage));
        capability.description = match stage {
            StageName::Import => "ingest bookmark records from the task context".to_string(),
            StageName::Validate => "check bookmark URLs for structural validity".to_string(),
            StageName::Enrich => "derive per-bookmark metadata (site, path depth)".to_string(),
            StageName::Categorize => "group bookmarks by site".to_string(),
            StageName::Embed => "produce placeholder embedding vectors".to_string(),
        };
        match stage {
            StageName::Import => registry.register(capability, ImportStage),
            StageName::Validate => registry.register(capability, ValidateStage),
            StageName::Enrich => registry.register(capability, EnrichStage),
            StageName::Categorize => registry.register(capability, CategorizeStage),
            StageName::Embed => registry.register(capability, EmbedStage),
        }
    }
}

/// Bookmark records from the task context.
fn bookmarks(context: &serde_json::Value) -> Vec<(String, String)> {
    context
        .get("bookmarks")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item.get("id")?.as_str()?.to_string();
                    let url = item.get("url")?.as_str()?.to_string();
                    Some((id, url))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Hostname portion of a URL, without scheme or path.
fn site_of(url: &str) -> Option<&str> {
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?;
    if host.is_empty() { None } else { Some(host) }
}

// ---------------------------------------------------------------------------
// import
// ---------------------------------------------------------------------------

/// Ingests the bookmark records and records their ids.
pub struct ImportStage;

impl StageHandler for ImportStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let records = bookmarks(&input.context);
        if records.is_empty() {
            return Err(StageError::InvalidInput(
                "context.bookmarks is missing or empty".to_string(),
            ));
        }
        let ids: Vec<&str> = records.iter().map(|(id, _)| id.as_str()).collect();
        Ok(StageOutput::json(
            "bookmark_list",
            json!({"bookmark_ids": ids, "total_bookmarks": ids.len()}),
        )
        .with_context_patch(json!({"imported_count": ids.len()})))
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

/// Structural URL validation (scheme and host present).
pub struct ValidateStage;

impl StageHandler for ValidateStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let records = bookmarks(&input.context);
        let results: Vec<serde_json::Value> = records
            .iter()
            .map(|(id, url)| {
                let is_valid = site_of(url).is_some();
                json!({
                    "bookmark_id": id,
                    "url": url,
                    "is_valid": is_valid,
                    "error": if is_valid { serde_json::Value::Null } else { json!("malformed URL") },
                })
            })
            .collect();
        let valid = results.iter().filter(|r| r["is_valid"] == true).count();
        let invalid = results.len() - valid;

        Ok(StageOutput::json(
            "validation_report",
            json!({
                "results": results,
                "summary": {"total": records.len(), "valid": valid, "invalid": invalid},
            }),
        )
        .with_context_patch(json!({"valid_count": valid, "invalid_count": invalid})))
    }
}

// ---------------------------------------------------------------------------
// enrich
// ---------------------------------------------------------------------------

/// Derives lightweight metadata per bookmark.
pub struct EnrichStage;

impl StageHandler for EnrichStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let records = bookmarks(&input.context);
        let enriched: Vec<serde_json::Value> = records
            .iter()
            .filter_map(|(id, url)| {
                let site = site_of(url)?;
                let path_depth = url.split('/').count().saturating_sub(3);
                Some(json!({"bookmark_id": id, "site": site, "path_depth": path_depth}))
            })
            .collect();

        Ok(StageOutput::json(
            "enrichment_report",
            json!({"enriched_count": enriched.len(), "entries": enriched}),
        )
        .with_context_patch(json!({"enriched_count": enriched.len()})))
    }
}

// ---------------------------------------------------------------------------
// categorize
// ---------------------------------------------------------------------------

/// Groups bookmarks by site.
pub struct CategorizeStage;

impl StageHandler for CategorizeStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let records = bookmarks(&input.context);
        let mut categories: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, url) in &records {
            let site = site_of(url).unwrap_or("uncategorized").to_string();
            categories.entry(site).or_default().push(id.clone());
        }

        Ok(StageOutput::json(
            "categorization_report",
            json!({"category_count": categories.len(), "categories": categories}),
        )
        .with_context_patch(json!({"category_count": categories.len()})))
    }
}

// ---------------------------------------------------------------------------
// embed
// ---------------------------------------------------------------------------

/// Placeholder embedding vectors derived from the URL bytes.
///
/// A real deployment registers a handler backed by an embedding service
/// here; this one keeps the pipeline runnable end to end without one.
pub struct EmbedStage;

impl StageHandler for EmbedStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let records = bookmarks(&input.context);
        let embedded: Vec<serde_json::Value> = records
            .iter()
            .map(|(id, url)| {
                let mut acc: u32 = 2166136261;
                let vector: Vec<f32> = (0..8u32)
                    .map(|i| {
                        for byte in url.bytes() {
                            acc = acc.wrapping_mul(16777619) ^ (byte as u32 ^ i);
                        }
                        (acc % 1000) as f32 / 1000.0
                    })
                    .collect();
                json!({"bookmark_id": id, "vector": vector})
            })
            .collect();

        Ok(StageOutput::json(
            "embedding_report",
            json!({"embedded_count": embedded.len(), "dimensions": 8, "entries": embedded}),
        )
        .with_context_patch(json!({"embedded_count": embedded.len()})))
    }
}
