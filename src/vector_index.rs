use anyhow::Result;
use log::{error, info};
use serde_json::json;
use std::time::Duration;

use crate::knowledge::KnowledgeEntry;

/// A scored match reconstructed from index metadata. The index carries the
/// authoritative full content; titles and keywords ride along so entries can
/// be rebuilt even when working memory lags behind.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub score: f64,
    pub title: String,
    pub content: String,
    pub keywords: Vec<String>,
}

pub struct VectorIndex {
    http: reqwest::Client,
    api_key: String,
    host: String,
}

impl VectorIndex {
    pub fn new(api_key: String, host: String) -> Self {
        VectorIndex {
            http: reqwest::Client::new(),
            api_key,
            host,
        }
    }

    pub async fn upsert_entry(&self, entry: &KnowledgeEntry, values: &[f32]) -> Result<()> {
        let url = format!("{}/vectors/upsert", self.host);
        let res = self
            .http
            .post(&url)
            .header("Api-Key", &self.api_key)
            .timeout(Duration::from_secs(10))
            .json(&json!({
                "vectors": [{
                    "id": entry.id,
                    "values": values,
                    "metadata": {
                        "title": entry.title,
                        "content": entry.content,
                        "keywords": entry.keywords,
                    }
                }]
            }))
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            error!("vector upsert failed for {}: {} {}", entry.id, status, body);
            anyhow::bail!("vector upsert error: {}", status);
        }
        info!("upserted knowledge entry {} into the index", entry.id);
        Ok(())
    }

    pub async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        let url = format!("{}/query", self.host);
        let res = self
            .http
            .post(&url)
            .header("Api-Key", &self.api_key)
            .timeout(Duration::from_secs(10))
            .json(&json!({
                "vector": vector,
                "topK": top_k,
                "includeMetadata": true,
                "includeValues": false
            }))
            .send()
            .await?;

        let status = res.status();
        let body: serde_json::Value = res.json().await?;
        if !status.is_success() {
            error!("vector query failed: {} {}", status, body);
            anyhow::bail!("vector query error: {}", status);
        }

        let empty = vec![];
        let matches = body["matches"].as_array().unwrap_or(&empty);
        let mut results = Vec::new();
        for m in matches {
            let Some(id) = m["id"].as_str() else { continue };
            let score = m["score"].as_f64().unwrap_or(0.0);
            let metadata = &m["metadata"];
            let keywords = metadata["keywords"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            results.push(VectorMatch {
                id: id.to_string(),
                score,
                title: metadata["title"].as_str().unwrap_or("").to_string(),
                content: metadata["content"].as_str().unwrap_or("").to_string(),
                keywords,
            });
        }
        info!("vector query returned {} match(es)", results.len());
        Ok(results)
    }

    /// Best-effort removal of stale vectors (ids with no working-memory
    /// counterpart).
    pub async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}/vectors/delete", self.host);
        let res = self
            .http
            .post(&url)
            .header("Api-Key", &self.api_key)
            .timeout(Duration::from_secs(10))
            .json(&json!({ "ids": ids }))
            .send()
            .await?;
        if !res.status().is_success() {
            anyhow::bail!("vector delete error: {}", res.status());
        }
        Ok(())
    }
}
