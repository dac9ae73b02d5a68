use anyhow::Result;
use log::{info, warn};
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::knowledge::{AutoResponseRule, KnowledgeEntry};
use crate::leaderboard::LeaderboardSnapshot;

pub const STATUS_UNSOLVED: &str = "Unsolved";
pub const STATUS_AI_RESPONSE: &str = "AI Response";
pub const STATUS_HUMAN_SUPPORT: &str = "Human Support";
pub const STATUS_SOLVED: &str = "Solved";

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// One full pull of the dashboard data document, parsed into the pieces the
/// engine consumes plus the raw document for full-replacement writes.
#[derive(Debug, Default)]
pub struct DashboardDocument {
    pub entries: Vec<KnowledgeEntry>,
    pub rules: Vec<AutoResponseRule>,
    pub settings_doc: Value,
    pub leaderboard: LeaderboardSnapshot,
    pub raw: Value,
}

/// HTTP client for the operator dashboard. The dashboard owns knowledge
/// entries, auto-response rules, and settings; the bot owns thread status and
/// the leaderboard. Every call is a single attempt: the dashboard being down
/// must never stall thread handling.
pub struct DashboardClient {
    http: reqwest::Client,
    data_url: Option<String>,
}

impl DashboardClient {
    pub fn new(data_url: Option<String>) -> Self {
        if data_url.is_none() {
            info!("no dashboard URL configured; sync disabled");
        }
        DashboardClient {
            http: reqwest::Client::new(),
            data_url,
        }
    }

    pub fn disabled(&self) -> bool {
        self.data_url.is_none()
    }

    /// GET the full data document.
    pub async fn fetch(&self) -> Result<DashboardDocument> {
        let url = self.data_url()?;
        let raw: Value = self
            .http
            .get(url)
            .timeout(SYNC_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let entries = parse_list(&raw["ragEntries"]);
        let rules = parse_list(&raw["autoResponses"]);
        let leaderboard =
            serde_json::from_value(raw["leaderboard"].clone()).unwrap_or_default();
        info!(
            "dashboard sync: {} entr(ies), {} rule(s)",
            entries.len(),
            rules.len()
        );
        Ok(DashboardDocument {
            entries,
            rules,
            settings_doc: raw["botSettings"].clone(),
            leaderboard,
            raw,
        })
    }

    /// Push the month's scores. The dashboard merges them by action rather
    /// than a full-document write so concurrent operator edits survive.
    pub async fn push_leaderboard(&self, snapshot: &LeaderboardSnapshot) -> Result<()> {
        let url = self.data_url()?;
        self.http
            .post(url)
            .timeout(SYNC_TIMEOUT)
            .json(&json!({
                "action": "update_leaderboard",
                "leaderboard": snapshot,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Queue a solved thread as a pending knowledge entry for operator
    /// review. Reads the current document, appends, and writes it back whole.
    pub async fn submit_pending_entry(
        &self,
        title: &str,
        content: &str,
        keywords: &[String],
    ) -> Result<()> {
        let url = self.data_url()?;
        let mut doc = self.fetch().await?.raw;
        if !doc.is_object() {
            anyhow::bail!("dashboard document is not an object");
        }
        let pending = doc["pendingRagEntries"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let mut pending = pending;
        pending.push(json!({
            "id": Uuid::new_v4().to_string(),
            "title": title,
            "content": content,
            "keywords": keywords,
        }));
        doc["pendingRagEntries"] = Value::Array(pending);

        self.http
            .post(url)
            .timeout(SYNC_TIMEOUT)
            .json(&doc)
            .send()
            .await?
            .error_for_status()?;
        info!("submitted pending knowledge entry '{}'", title);
        Ok(())
    }

    /// Register a freshly opened thread on the forum-posts board.
    pub async fn post_created(&self, thread_id: u64, title: &str, author: &str) {
        self.forum_post_action(json!({
            "action": "create",
            "postId": thread_id.to_string(),
            "title": title,
            "author": author,
            "status": STATUS_UNSOLVED,
        }))
        .await;
    }

    pub async fn post_status(&self, thread_id: u64, status: &str) {
        self.forum_post_action(json!({
            "action": "update",
            "postId": thread_id.to_string(),
            "status": status,
        }))
        .await;
    }

    pub async fn post_deleted(&self, thread_id: u64) {
        self.forum_post_action(json!({
            "action": "delete",
            "postId": thread_id.to_string(),
        }))
        .await;
    }

    /// Ask the dashboard to drop solved posts older than the retention window.
    pub async fn purge_solved(&self, retention_days: u64) {
        self.forum_post_action(json!({
            "action": "purge",
            "retentionDays": retention_days,
        }))
        .await;
    }

    /// Fire-and-forget status write. Failures are logged and swallowed.
    async fn forum_post_action(&self, body: Value) {
        let Some(data_url) = &self.data_url else {
            return;
        };
        let url = forum_posts_url(data_url);
        let result = self
            .http
            .post(&url)
            .timeout(STATUS_TIMEOUT)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = result {
            warn!("forum-post status write failed: {}", e);
        }
    }

    fn data_url(&self) -> Result<&str> {
        self.data_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("dashboard sync is disabled"))
    }
}

/// The forum-posts board lives next to the data document on the same host.
fn forum_posts_url(data_url: &str) -> String {
    if data_url.contains("/api/data") {
        data_url.replace("/api/data", "/api/forum-posts")
    } else {
        format!("{}/forum-posts", data_url.trim_end_matches('/'))
    }
}

/// Tolerant list parse: malformed elements are skipped, not fatal.
fn parse_list<T: serde::de::DeserializeOwned>(value: &Value) -> Vec<T> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("skipping malformed dashboard record: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> DashboardClient {
        DashboardClient::new(Some(format!("{}/api/data", server.uri())))
    }

    fn sample_doc() -> Value {
        json!({
            "ragEntries": [
                {"id": "k1", "title": "Honey reset", "content": "Do X", "keywords": ["honey"]},
                {"title": "missing id, skipped"}
            ],
            "autoResponses": [
                {"id": "r1", "name": "greeting", "triggers": ["hello"], "response": "Hi!"}
            ],
            "botSettings": {"aiMaxTokens": 512},
            "leaderboard": {
                "month": "2026-08",
                "scores": {"42": {"displayName": "Zed", "solvedCount": 3}}
            },
            "pendingRagEntries": [],
            "slashCommands": []
        })
    }

    #[test]
    fn test_forum_posts_url_rewrite() {
        assert_eq!(
            forum_posts_url("https://dash.example/api/data"),
            "https://dash.example/api/forum-posts"
        );
        assert_eq!(
            forum_posts_url("https://dash.example/custom/"),
            "https://dash.example/custom/forum-posts"
        );
    }

    #[test]
    fn test_disabled_without_url() {
        assert!(DashboardClient::new(None).disabled());
    }

    #[tokio::test]
    async fn test_fetch_parses_document_and_skips_bad_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_doc()))
            .mount(&server)
            .await;

        let doc = client(&server).fetch().await.unwrap();
        assert_eq!(doc.entries.len(), 1);
        assert_eq!(doc.entries[0].id, "k1");
        assert_eq!(doc.rules.len(), 1);
        assert_eq!(doc.settings_doc["aiMaxTokens"], 512);
        assert_eq!(doc.leaderboard.scores.get(&42).unwrap().solved_count, 3);
    }

    #[tokio::test]
    async fn test_fetch_error_status_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/data"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        assert!(client(&server).fetch().await.is_err());
    }

    #[tokio::test]
    async fn test_push_leaderboard_sends_action() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/data"))
            .and(body_partial_json(json!({"action": "update_leaderboard"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let snapshot = LeaderboardSnapshot {
            month: "2026-08".to_string(),
            scores: Default::default(),
        };
        client(&server).push_leaderboard(&snapshot).await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_pending_entry_appends_and_writes_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_doc()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/data"))
            .and(body_partial_json(json!({
                "pendingRagEntries": [{"title": "New fix"}]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .submit_pending_entry("New fix", "Steps", &["fix".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_write_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/forum-posts"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        // Must not panic or error.
        client(&server).post_status(1, STATUS_SOLVED).await;
    }

    #[tokio::test]
    async fn test_post_created_targets_forum_posts_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/forum-posts"))
            .and(body_partial_json(json!({
                "action": "create",
                "status": STATUS_UNSOLVED,
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        client(&server).post_created(99, "title", "author").await;
    }

    #[tokio::test]
    async fn test_disabled_client_noops_status_writes() {
        // No server at all; must return without error.
        DashboardClient::new(None).post_status(1, STATUS_UNSOLVED).await;
    }
}
