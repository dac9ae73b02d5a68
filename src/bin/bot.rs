use anyhow::Result;
use log::{error, info, warn};
use serenity::async_trait;
use serenity::client::{Client, Context, EventHandler};
use serenity::model::application::Interaction;
use serenity::model::channel::{GuildChannel, Message, PartialGuildChannel};
use serenity::model::gateway::{GatewayIntents, Ready};
use std::sync::Arc;

use triage::config::Config;
use triage::credentials::CredentialPool;
use triage::dashboard::DashboardClient;
use triage::embeddings::EmbeddingClient;
use triage::engine::Engine;
use triage::generator::ResponseGenerator;
use triage::janitor;
use triage::knowledge::KnowledgeStore;
use triage::leaderboard::Leaderboard;
use triage::llm::ChatClient;
use triage::retrieval::{RetrievalMode, Retriever};
use triage::settings::BotSettings;
use triage::tags::TagController;
use triage::vector_index::VectorIndex;

struct Handler {
    engine: Arc<Engine>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        self.engine.set_bot_user(ready.user.id);
        info!("🤖 {} connected and watching the support forum", ready.user.name);
    }

    async fn thread_create(&self, ctx: Context, thread: GuildChannel) {
        self.engine.handle_thread_create(&ctx, &thread).await;
    }

    async fn thread_delete(
        &self,
        _ctx: Context,
        thread: PartialGuildChannel,
        _full_thread_data: Option<GuildChannel>,
    ) {
        self.engine.handle_thread_delete(thread.id.get()).await;
    }

    async fn message(&self, ctx: Context, msg: Message) {
        self.engine.handle_message(&ctx, &msg).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Component(component) = interaction {
            self.engine.handle_component(&ctx, &component).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.clone()),
    )
    .init();

    let settings = Arc::new(tokio::sync::RwLock::new(BotSettings::default()));
    let store = Arc::new(KnowledgeStore::new());
    let dashboard = Arc::new(DashboardClient::new(config.data_api_url.clone()));
    let leaderboard = Arc::new(Leaderboard::new());

    // Startup bootstrap: adopt the dashboard's replicas and leaderboard
    // before anything else runs. The periodic sync takes over afterwards.
    if !dashboard.disabled() {
        match dashboard.fetch().await {
            Ok(doc) => {
                store.replace_entries(doc.entries);
                store.replace_rules(doc.rules);
                *settings.write().await = BotSettings::merged_over_defaults(&doc.settings_doc);
                leaderboard.restore(doc.leaderboard);
                info!("📚 knowledge base loaded: {} entr(ies)", store.entry_count());
            }
            Err(e) => warn!("startup dashboard sync failed: {}", e),
        }
    }

    let (mode, embeddings, index) = if config.force_keyword_search {
        info!("🔎 keyword search forced by configuration");
        (RetrievalMode::Keyword, None, None)
    } else if let Some(pinecone) = &config.pinecone {
        let embeddings = Arc::new(EmbeddingClient::new(pinecone.api_key.clone()));
        let index = Arc::new(VectorIndex::new(
            pinecone.api_key.clone(),
            pinecone.index_host(),
        ));
        (RetrievalMode::Vector, Some(embeddings), Some(index))
    } else if config.enable_embeddings {
        warn!("ENABLE_EMBEDDINGS set but Pinecone is not configured");
        (RetrievalMode::Keyword, None, None)
    } else {
        (RetrievalMode::Keyword, None, None)
    };

    if let (Some(embeddings), Some(index)) = (&embeddings, &index) {
        if config.skip_embedding_bootstrap {
            info!("skipping embedding bootstrap");
        } else {
            let entries = store.all_entries();
            info!("⚙️ bootstrapping {} knowledge embedding(s)", entries.len());
            for entry in entries {
                let text = format!("{}\n{}", entry.title, entry.content);
                match embeddings.embed_passage(&text).await {
                    Ok(vector) => {
                        if let Err(e) = index.upsert_entry(&entry, &vector).await {
                            warn!("bootstrap upsert failed for {}: {}", entry.id, e);
                        }
                    }
                    Err(e) => warn!("bootstrap embedding failed for {}: {}", entry.id, e),
                }
            }
        }
    }

    let retriever = Retriever::new(mode, store.clone(), embeddings, index);
    let pool = Arc::new(CredentialPool::new(config.groq_api_keys.clone()));
    info!("🔑 credential pool loaded with {} key(s)", pool.len());
    let generator = ResponseGenerator::new(pool, ChatClient::new(), settings.clone());
    let tags = TagController::new(settings.clone());

    let engine = Arc::new(Engine::new(
        config.guild_id,
        config.forum_channel_id,
        settings.clone(),
        retriever,
        generator,
        tags,
        dashboard.clone(),
        leaderboard.clone(),
    ));

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Handler {
            engine: engine.clone(),
        })
        .await?;

    let timers = vec![
        janitor::spawn_cleanup(engine.clone()),
        janitor::spawn_data_sync(
            dashboard.clone(),
            store.clone(),
            settings.clone(),
            leaderboard.clone(),
        ),
        janitor::spawn_daily_summary(
            engine.clone(),
            dashboard.clone(),
            settings.clone(),
            client.http.clone(),
        ),
    ];

    // Ctrl-C tears down in order: stop the timers, give in-flight thread
    // handling a moment to land, then close the gateway session.
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("could not listen for shutdown signal: {}", e);
            return;
        }
        info!("🛑 shutdown requested; stopping background timers");
        for timer in &timers {
            timer.abort();
        }
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        shard_manager.shutdown_all().await;
    });

    info!("🚀 starting gateway session");
    if let Err(e) = client.start().await {
        let text = e.to_string();
        if text.contains("401") || text.to_lowercase().contains("unauthorized") {
            error!("Discord rejected the bot token; check DISCORD_BOT_TOKEN");
        } else if text.to_lowercase().contains("intent") {
            error!("gateway intents rejected; enable Message Content in the developer portal");
        } else {
            error!("client error: {}", text);
        }
        return Err(e.into());
    }
    Ok(())
}
