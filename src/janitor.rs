use log::{info, warn};
use serenity::builder::{CreateEmbed, CreateMessage};
use serenity::http::Http;
use serenity::model::id::ChannelId;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::dashboard::DashboardClient;
use crate::engine::Engine;
use crate::generator::SettingsHandle;
use crate::knowledge::KnowledgeStore;
use crate::leaderboard::Leaderboard;
use crate::settings::BotSettings;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SUMMARY_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Ten-minute sweep over the engine's in-memory state.
pub fn spawn_cleanup(engine: Arc<Engine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            engine.cleanup();
        }
    })
}

/// Five-minute dashboard sync: pull the knowledge replicas and settings,
/// push the leaderboard. The dashboard being unreachable skips the cycle.
pub fn spawn_data_sync(
    dashboard: Arc<DashboardClient>,
    store: Arc<KnowledgeStore>,
    settings: SettingsHandle,
    leaderboard: Arc<Leaderboard>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if dashboard.disabled() {
            return;
        }
        let mut interval = tokio::time::interval(SYNC_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            sync_once(&dashboard, &store, &settings, &leaderboard).await;
        }
    })
}

/// One full sync cycle. Also used for the startup bootstrap.
pub async fn sync_once(
    dashboard: &DashboardClient,
    store: &KnowledgeStore,
    settings: &SettingsHandle,
    leaderboard: &Leaderboard,
) {
    match dashboard.fetch().await {
        Ok(doc) => {
            store.replace_entries(doc.entries);
            store.replace_rules(doc.rules);
            *settings.write().await = BotSettings::merged_over_defaults(&doc.settings_doc);
        }
        Err(e) => {
            warn!("dashboard sync failed: {}", e);
            return;
        }
    }
    if let Err(e) = dashboard.push_leaderboard(&leaderboard.snapshot()).await {
        warn!("leaderboard push failed: {}", e);
    }
}

/// Daily: post the issue tally to the notification channel and ask the
/// dashboard to purge solved posts past retention.
pub fn spawn_daily_summary(
    engine: Arc<Engine>,
    dashboard: Arc<DashboardClient>,
    settings: SettingsHandle,
    http: Arc<Http>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SUMMARY_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;

            let retention = { settings.read().await.solved_post_retention_days };
            dashboard.purge_solved(retention).await;

            let tally = engine.flush_daily_tally();
            if tally.is_empty() {
                info!("no support threads in the last day; skipping summary");
                continue;
            }
            let Some(channel) = engine.notification_channel().await else {
                continue;
            };

            let total: u64 = tally.iter().map(|(_, t)| t.count).sum();
            let mut embed = CreateEmbed::new()
                .title("📊 Daily support summary")
                .description(format!("{} thread(s) in the last 24 hours", total))
                .colour(0x5865F2);
            for (category, t) in &tally {
                let examples = if t.examples.is_empty() {
                    "—".to_string()
                } else {
                    t.examples.join("\n")
                };
                embed = embed.field(format!("{} ({})", category, t.count), examples, false);
            }
            if let Err(e) = ChannelId::new(channel)
                .send_message(&http, CreateMessage::new().embed(embed))
                .await
            {
                warn!("daily summary post failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialPool;
    use crate::generator::ResponseGenerator;
    use crate::llm::ChatClient;
    use crate::retrieval::{RetrievalMode, Retriever};
    use crate::tags::TagController;

    fn test_engine() -> Arc<Engine> {
        let settings = Arc::new(tokio::sync::RwLock::new(BotSettings::default()));
        let store = Arc::new(KnowledgeStore::new());
        let retriever = Retriever::new(RetrievalMode::Keyword, store, None, None);
        let pool = Arc::new(CredentialPool::new(vec!["key".to_string()]));
        let generator = ResponseGenerator::new(pool, ChatClient::new(), settings.clone());
        let tags = TagController::new(settings.clone());
        Arc::new(Engine::new(
            1,
            2,
            settings,
            retriever,
            generator,
            tags,
            Arc::new(DashboardClient::new(None)),
            Arc::new(Leaderboard::new()),
        ))
    }

    #[tokio::test]
    async fn test_cleanup_timer_aborts_cleanly() {
        let handle = spawn_cleanup(test_engine());
        handle.abort();
        let err = handle.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_data_sync_exits_when_dashboard_disabled() {
        let settings = Arc::new(tokio::sync::RwLock::new(BotSettings::default()));
        let handle = spawn_data_sync(
            Arc::new(DashboardClient::new(None)),
            Arc::new(KnowledgeStore::new()),
            settings,
            Arc::new(Leaderboard::new()),
        );
        handle.await.unwrap();
    }
}
