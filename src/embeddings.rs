use anyhow::Result;
use log::{debug, warn};
use serde_json::json;
use std::time::Duration;

use crate::cache::{normalize_query, FifoCache};

const INFERENCE_URL: &str = "https://api.pinecone.io/embed";
const EMBED_MODEL: &str = "multilingual-e5-large";
const QUERY_CACHE_CAP: usize = 200;

/// Encodes text through Pinecone's hosted inference endpoint. Query
/// embeddings go through a bounded FIFO cache keyed by the normalized query,
/// so repeated lookups are byte-identical and free.
pub struct EmbeddingClient {
    http: reqwest::Client,
    api_key: String,
    query_cache: FifoCache<Vec<f32>>,
}

impl EmbeddingClient {
    pub fn new(api_key: String) -> Self {
        EmbeddingClient {
            http: reqwest::Client::new(),
            api_key,
            query_cache: FifoCache::new(QUERY_CACHE_CAP, None),
        }
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let key = normalize_query(text);
        if let Some(hit) = self.query_cache.get(&key) {
            debug!("embedding cache hit ({} dims)", hit.len());
            return Ok(hit);
        }
        let embedding = self.embed(text, "query").await?;
        self.query_cache.insert(key, embedding.clone());
        Ok(embedding)
    }

    /// Used when upserting knowledge entries; passages are not cached.
    pub async fn embed_passage(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text, "passage").await
    }

    pub fn cached_queries(&self) -> usize {
        self.query_cache.len()
    }

    async fn embed(&self, text: &str, input_type: &str) -> Result<Vec<f32>> {
        let res = self
            .http
            .post(INFERENCE_URL)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", "2024-10")
            .timeout(Duration::from_secs(10))
            .json(&json!({
                "model": EMBED_MODEL,
                "parameters": { "input_type": input_type, "truncate": "END" },
                "inputs": [{ "text": text }]
            }))
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("embedding request failed: {} {}", status, body);
        }

        let body: serde_json::Value = res.json().await?;
        let Some(values) = body["data"][0]["values"].as_array() else {
            warn!("no embedding values in inference response");
            anyhow::bail!("embedding response missing values");
        };
        let embedding: Vec<f32> = values
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect();
        if embedding.is_empty() {
            anyhow::bail!("embedding response was empty");
        }
        debug!("embedded {} chars into {} dims", text.len(), embedding.len());
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_cache_starts_empty() {
        let client = EmbeddingClient::new("k".to_string());
        assert_eq!(client.cached_queries(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_is_identical_and_skips_http() {
        // Unroutable key and URL are never touched on a cache hit.
        let client = EmbeddingClient::new("unused".to_string());
        let vector = vec![0.25_f32, -0.5, 0.125];
        client
            .query_cache
            .insert(normalize_query("  How DO i reset  "), vector.clone());

        let hit = client.embed_query("how do I reset").await.unwrap();
        assert_eq!(hit, vector);
    }
}
