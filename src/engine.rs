use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{error, info, warn};
use serenity::builder::{
    CreateEmbed, CreateInteractionResponse, CreateMessage, EditMessage, GetMessages,
};
use serenity::client::Context;
use serenity::model::application::ComponentInteraction;
use serenity::model::channel::{GuildChannel, Message};
use serenity::model::guild::PartialMember;
use serenity::model::id::{ChannelId, MessageId, RoleId, UserId};
use serenity::model::Permissions;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::classifier::{CategoryTally, IssueClassifier};
use crate::dashboard::{
    DashboardClient, STATUS_AI_RESPONSE, STATUS_HUMAN_SUPPORT, STATUS_SOLVED,
};
use crate::feedback::{
    analyze_message, disabled_feedback_buttons, feedback_buttons, SatisfactionVerdict,
    FEEDBACK_NOT_SOLVED_ID, FEEDBACK_SOLVED_ID,
};
use crate::generator::{ResponseGenerator, SettingsHandle};
use crate::knowledge::word_set;
use crate::leaderboard::Leaderboard;
use crate::retrieval::Retriever;
use crate::tags::TagController;

/// Hard cap on automated replies per thread before escalation.
pub const MAX_AUTOMATED_REPLIES: usize = 3;
const OPENING_FETCH_ATTEMPTS: u32 = 3;
const OPENING_FETCH_BACKOFF: Duration = Duration::from_secs(2);
const DUPLICATE_SCAN_LIMIT: u8 = 10;
const PROBE_MESSAGE_WINDOW: usize = 5;
const RETRIEVAL_TOP_K: usize = 3;
const RETRIEVAL_MIN_SCORE: f64 = 0.6;
const RECORD_EXPIRY: Duration = Duration::from_secs(48 * 60 * 60);
const IMAGE_RETENTION: Duration = Duration::from_secs(2 * 60 * 60);
const DISCORD_MESSAGE_LIMIT: usize = 1990;

const LOG_REQUEST_PROMPT: &str = "Could you attach your log files and a short description of \
what you already tried? That will help the team pick this up faster.";
const ESCALATION_NOTICE: &str = "The support team has been notified and will take a look at \
this thread. Thanks for your patience!";
const UPSTREAM_TROUBLE_NOTICE: &str = "I'm having trouble connecting to my answer service \
right now. The support team has been notified and will help you directly.";
const CLOSE_COMMAND: &str = "!close";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Lock acquired, opening post not yet answered.
    New,
    /// Opening post processed but no answer could be delivered.
    Unsolved,
    AutoAnswered,
    AiAnswered,
    /// A bot reply already existed when we first saw the thread.
    AwaitingFeedback,
    Retrying,
    Escalated,
    Solved,
    Closed,
}

impl ThreadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadState::Escalated | ThreadState::Solved | ThreadState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Auto,
    Ai,
}

#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub thread_id: u64,
    pub owner_id: u64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub state: ThreadState,
    pub responses: Vec<ResponseKind>,
    pub retry_count: u32,
    pub images: Vec<ImageAttachment>,
    pub last_activity: Instant,
    pub no_review: bool,
    /// Most recent automated answer, kept for the pending KB submission.
    pub last_answer: Option<String>,
}

impl ThreadRecord {
    fn new(thread_id: u64, owner_id: u64, title: String) -> Self {
        ThreadRecord {
            thread_id,
            owner_id,
            title,
            created_at: Utc::now(),
            state: ThreadState::New,
            responses: Vec::new(),
            retry_count: 0,
            images: Vec::new(),
            last_activity: Instant::now(),
            no_review: false,
            last_answer: None,
        }
    }
}

/// A thread id lives in at most one tracking phase at a time; the map entry
/// itself is the per-thread lock for the creation event.
#[derive(Debug, Clone, Copy)]
enum Phase {
    BeingProcessed,
    ProcessedRecently(Instant),
    Escalated(Instant),
}

/// What a probe verdict translates into, given the thread's current shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerdictAction {
    Solve,
    Escalate,
    /// Another automated answer with the conversation as context.
    Regenerate,
    Ignore,
}

fn route_verdict(
    state: ThreadState,
    last_response: Option<ResponseKind>,
    verdict: &SatisfactionVerdict,
) -> VerdictAction {
    if verdict.satisfied && verdict.confidence > 60 {
        return VerdictAction::Solve;
    }
    if verdict.wants_human && last_response == Some(ResponseKind::Ai) {
        return VerdictAction::Escalate;
    }
    // Strong dissatisfaction (two or more negative hits).
    if !verdict.satisfied && verdict.score <= -2 {
        return if state == ThreadState::AutoAnswered {
            VerdictAction::Regenerate
        } else {
            VerdictAction::Escalate
        };
    }
    if verdict.is_followup {
        return VerdictAction::Regenerate;
    }
    VerdictAction::Ignore
}

/// The no-review close only applies once a thread has come to rest: either
/// marked solved or handed to humans.
fn close_allowed(state: ThreadState) -> bool {
    matches!(state, ThreadState::Solved | ThreadState::Escalated)
}

/// True when the monitored id names the thread's forum or that forum's
/// parent category.
fn monitored_match(monitored: u64, forum: Option<u64>, category: Option<u64>) -> bool {
    forum == Some(monitored) || category == Some(monitored)
}

fn is_staff(member: Option<&PartialMember>, notification_role: Option<u64>) -> bool {
    member
        .map(|m| staff_check(&m.roles, m.permissions, notification_role))
        .unwrap_or(false)
}

fn staff_check(
    roles: &[RoleId],
    permissions: Option<Permissions>,
    notification_role: Option<u64>,
) -> bool {
    if let Some(role) = notification_role {
        if roles.iter().any(|r| r.get() == role) {
            return true;
        }
    }
    permissions.map(|p| p.manage_threads()).unwrap_or(false)
}

fn clip(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

/// The thread state machine. Owns every per-thread record and drives all
/// transitions from gateway events, button presses, and probe verdicts.
pub struct Engine {
    guild_id: u64,
    forum_channel_id: u64,
    settings: SettingsHandle,
    retriever: Retriever,
    generator: ResponseGenerator,
    classifier: IssueClassifier,
    tags: TagController,
    dashboard: Arc<DashboardClient>,
    leaderboard: Arc<Leaderboard>,
    records: DashMap<u64, ThreadRecord>,
    phases: DashMap<u64, Phase>,
    probes: DashMap<u64, JoinHandle<()>>,
    bot_user: AtomicU64,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guild_id: u64,
        forum_channel_id: u64,
        settings: SettingsHandle,
        retriever: Retriever,
        generator: ResponseGenerator,
        tags: TagController,
        dashboard: Arc<DashboardClient>,
        leaderboard: Arc<Leaderboard>,
    ) -> Self {
        Engine {
            guild_id,
            forum_channel_id,
            settings,
            retriever,
            generator,
            classifier: IssueClassifier::new(),
            tags,
            dashboard,
            leaderboard,
            records: DashMap::new(),
            phases: DashMap::new(),
            probes: DashMap::new(),
            bot_user: AtomicU64::new(0),
        }
    }

    pub fn set_bot_user(&self, id: UserId) {
        self.bot_user.store(id.get(), Ordering::SeqCst);
    }

    fn is_own(&self, id: UserId) -> bool {
        id.get() == self.bot_user.load(Ordering::SeqCst)
    }

    pub fn thread_state(&self, thread_id: u64) -> Option<ThreadState> {
        self.records.get(&thread_id).map(|r| r.state)
    }

    pub fn tracked_threads(&self) -> usize {
        self.records.len()
    }

    pub fn flush_daily_tally(&self) -> Vec<(String, CategoryTally)> {
        self.classifier.flush_tally()
    }

    pub async fn notification_channel(&self) -> Option<u64> {
        self.settings.read().await.notification_channel_id
    }

    async fn monitored_channel(&self) -> u64 {
        self.settings
            .read()
            .await
            .monitored_channel_id
            .unwrap_or(self.forum_channel_id)
    }

    // ---- thread creation ------------------------------------------------

    /// The configured id may be the forum itself or a category holding it;
    /// threads only ever carry the forum as their direct parent.
    async fn in_monitored_channel(
        &self,
        ctx: &Context,
        thread: &GuildChannel,
        monitored: u64,
    ) -> bool {
        let Some(parent) = thread.parent_id else {
            return false;
        };
        if parent.get() == monitored {
            return true;
        }
        match ctx.http.get_channel(parent).await {
            Ok(channel) => {
                let category = channel.guild().and_then(|c| c.parent_id).map(|c| c.get());
                monitored_match(monitored, Some(parent.get()), category)
            }
            Err(e) => {
                warn!("could not resolve parent of thread {}: {}", thread.id, e);
                false
            }
        }
    }

    pub async fn handle_thread_create(self: &Arc<Self>, ctx: &Context, thread: &GuildChannel) {
        let thread_id = thread.id.get();
        let monitored = self.monitored_channel().await;
        if !self.in_monitored_channel(ctx, thread, monitored).await {
            return;
        }
        {
            let settings = self.settings.read().await;
            if settings.ignored_post_ids.contains(&thread_id) {
                info!("thread {} is on the ignore list", thread_id);
                return;
            }
        }

        // Per-thread lock: a concurrent duplicate event loses the race here.
        match self.phases.entry(thread_id) {
            Entry::Occupied(_) => {
                info!("thread {} already tracked; skipping duplicate event", thread_id);
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(Phase::BeingProcessed);
            }
        }

        match self.process_new_thread(ctx, thread).await {
            Ok(()) => {
                let still_locked = self
                    .phases
                    .get(&thread_id)
                    .map(|p| matches!(*p, Phase::BeingProcessed))
                    .unwrap_or(false);
                if still_locked {
                    self.phases
                        .insert(thread_id, Phase::ProcessedRecently(Instant::now()));
                }
            }
            Err(e) => {
                // Release the lock entirely so a future event can retry.
                error!("thread {} initial processing failed: {}", thread_id, e);
                self.phases.remove(&thread_id);
            }
        }
    }

    async fn process_new_thread(
        self: &Arc<Self>,
        ctx: &Context,
        thread: &GuildChannel,
    ) -> anyhow::Result<()> {
        let thread_id = thread.id.get();
        let opening = self.fetch_opening_message(ctx, thread.id).await?;

        if self.already_answered(ctx, thread.id).await {
            info!("thread {} already has a bot reply; adopting it", thread_id);
            let mut record =
                ThreadRecord::new(thread_id, opening.author.id.get(), thread.name.clone());
            record.state = ThreadState::AwaitingFeedback;
            record.responses.push(ResponseKind::Ai);
            self.records.insert(thread_id, record);
            return Ok(());
        }

        let mut record =
            ThreadRecord::new(thread_id, opening.author.id.get(), thread.name.clone());

        let category = self
            .classifier
            .classify_and_record(&thread.name, &opening.content);
        info!("🧵 new support thread {} ({})", thread_id, category);

        self.dashboard
            .post_created(thread_id, &thread.name, opening.author.display_name())
            .await;
        self.tags.apply_issue_tag(&ctx.http, thread.id, category).await;

        let is_image = |t: &Option<String>| {
            t.as_deref().map(|t| t.starts_with("image/")).unwrap_or(false)
        };
        if let Some(other) = opening
            .attachments
            .iter()
            .find(|a| !is_image(&a.content_type))
        {
            // Logs, videos and the like go straight to a human.
            info!(
                "thread {} opened with attachment {}; escalating",
                thread_id, other.filename
            );
            self.records.insert(thread_id, record);
            self.escalate_thread(ctx, thread_id, false, ESCALATION_NOTICE).await;
            return Ok(());
        }
        let mut image_urls = Vec::new();
        for attachment in &opening.attachments {
            image_urls.push(attachment.url.clone());
            record.images.push(ImageAttachment {
                url: attachment.url.clone(),
                filename: attachment.filename.clone(),
            });
        }

        let query = format!("{}\n{}", thread.name, opening.content);

        if let Some(response) = self.retriever.find_auto_response(&query) {
            self.records.insert(thread_id, record);
            self.deliver_answer(ctx, thread.id, ResponseKind::Auto, ThreadState::AutoAnswered, response)
                .await?;
            return Ok(());
        }

        let entries = self
            .retriever
            .find_relevant_entries(&query, RETRIEVAL_TOP_K, RETRIEVAL_MIN_SCORE)
            .await;
        self.records.insert(thread_id, record);

        match self.generator.generate(&query, &entries, &image_urls).await {
            Ok(answer) => {
                self.deliver_answer(ctx, thread.id, ResponseKind::Ai, ThreadState::AiAnswered, answer)
                    .await?;
            }
            Err(e) => {
                warn!("generation failed for thread {}: {}", thread_id, e);
                if let Some(top) = entries.first() {
                    // Raw knowledge beats silence.
                    let fallback = format!(
                        "**{}**\n{}",
                        top.entry.title, top.entry.content
                    );
                    self.deliver_answer(
                        ctx,
                        thread.id,
                        ResponseKind::Ai,
                        ThreadState::AiAnswered,
                        fallback,
                    )
                    .await?;
                } else {
                    self.escalate_thread(ctx, thread_id, false, UPSTREAM_TROUBLE_NOTICE)
                        .await;
                }
            }
        }
        Ok(())
    }

    /// The forum starter message shares its id with the thread. Gateway
    /// ordering can race it, so fetch with short backoff.
    async fn fetch_opening_message(
        &self,
        ctx: &Context,
        thread: ChannelId,
    ) -> anyhow::Result<Message> {
        let message_id = MessageId::new(thread.get());
        let mut last_err = None;
        for attempt in 1..=OPENING_FETCH_ATTEMPTS {
            match thread.message(&ctx.http, message_id).await {
                Ok(message) => return Ok(message),
                Err(e) => {
                    warn!(
                        "opening message fetch {}/{} for {} failed: {}",
                        attempt, OPENING_FETCH_ATTEMPTS, thread, e
                    );
                    last_err = Some(e);
                    if attempt < OPENING_FETCH_ATTEMPTS {
                        tokio::time::sleep(OPENING_FETCH_BACKOFF).await;
                    }
                }
            }
        }
        Err(anyhow::anyhow!(
            "opening message unavailable after {} attempts: {}",
            OPENING_FETCH_ATTEMPTS,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    async fn already_answered(&self, ctx: &Context, thread: ChannelId) -> bool {
        match thread
            .messages(&ctx.http, GetMessages::new().limit(DUPLICATE_SCAN_LIMIT))
            .await
        {
            Ok(messages) => messages.iter().any(|m| self.is_own(m.author.id)),
            Err(e) => {
                warn!("duplicate scan failed for {}: {}", thread, e);
                false
            }
        }
    }

    /// Posts an answer and records it. A failed send leaves the record in
    /// `Unsolved` so the thread shows up as never answered.
    async fn deliver_answer(
        &self,
        ctx: &Context,
        thread: ChannelId,
        kind: ResponseKind,
        state: ThreadState,
        text: String,
    ) -> anyhow::Result<()> {
        let thread_id = thread.get();
        if let Err(e) = self.post_answer(ctx, thread, &text).await {
            if let Some(mut record) = self.records.get_mut(&thread_id) {
                record.state = ThreadState::Unsolved;
            }
            return Err(e);
        }
        self.commit_response(thread_id, kind, state, text);
        self.dashboard.post_status(thread_id, STATUS_AI_RESPONSE).await;
        Ok(())
    }

    async fn post_answer(
        &self,
        ctx: &Context,
        thread: ChannelId,
        text: &str,
    ) -> anyhow::Result<()> {
        thread
            .send_message(
                &ctx.http,
                CreateMessage::new()
                    .content(clip(text, DISCORD_MESSAGE_LIMIT))
                    .components(vec![feedback_buttons()]),
            )
            .await?;
        Ok(())
    }

    fn commit_response(
        &self,
        thread_id: u64,
        kind: ResponseKind,
        state: ThreadState,
        answer: String,
    ) {
        if let Some(mut record) = self.records.get_mut(&thread_id) {
            record.responses.push(kind);
            record.state = state;
            record.last_answer = Some(answer);
            record.last_activity = Instant::now();
        }
    }

    // ---- messages & probes ----------------------------------------------

    pub async fn handle_message(self: &Arc<Self>, ctx: &Context, msg: &Message) {
        if msg.author.bot {
            return;
        }
        let thread_id = msg.channel_id.get();
        let Some(state) = self.thread_state(thread_id) else {
            return;
        };
        if let Some(mut record) = self.records.get_mut(&thread_id) {
            record.last_activity = Instant::now();
        }

        let notification_role = { self.settings.read().await.notification_role_id };
        let staff = is_staff(msg.member.as_deref(), notification_role);

        if staff && msg.content.trim() == CLOSE_COMMAND {
            if close_allowed(state) {
                info!("staff closed thread {} without review", thread_id);
                self.close_no_review(ctx, thread_id).await;
            } else {
                info!(
                    "close command ignored for thread {} in state {:?}",
                    thread_id, state
                );
            }
            return;
        }

        // Escalated and closed threads belong to humans now.
        if state.is_terminal() {
            return;
        }
        if staff {
            return;
        }
        let has_bot_reply = self
            .records
            .get(&thread_id)
            .map(|r| !r.responses.is_empty())
            .unwrap_or(false);
        if !has_bot_reply {
            return;
        }
        let (enabled, delay) = {
            let settings = self.settings.read().await;
            (settings.satisfaction_analysis_enabled, settings.probe_delay_secs())
        };
        if enabled {
            self.schedule_probe(ctx, thread_id, delay);
        }
    }

    /// At most one outstanding probe per thread. A message arriving while a
    /// probe is pending leaves it in place; it reads recent history anyway.
    fn schedule_probe(self: &Arc<Self>, ctx: &Context, thread_id: u64, delay_secs: u64) {
        if let Entry::Vacant(slot) = self.probes.entry(thread_id) {
            let engine = Arc::clone(self);
            let ctx = ctx.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                engine.run_probe(&ctx, thread_id).await;
            });
            slot.insert(handle);
        }
    }

    async fn run_probe(self: &Arc<Self>, ctx: &Context, thread_id: u64) {
        self.probes.remove(&thread_id);
        let Some(state) = self.thread_state(thread_id) else {
            return;
        };
        if state.is_terminal() {
            return;
        }

        let messages = match ChannelId::new(thread_id)
            .messages(&ctx.http, GetMessages::new().limit(20))
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!("probe could not read thread {}: {}", thread_id, e);
                return;
            }
        };
        // Newest first from the API; probe reads the last few user messages
        // oldest to newest.
        let combined: String = messages
            .iter()
            .filter(|m| !m.author.bot)
            .take(PROBE_MESSAGE_WINDOW)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" ");
        if combined.trim().is_empty() {
            return;
        }

        let verdict = analyze_message(&combined);
        info!(
            "probe verdict for {}: score {} confidence {}",
            thread_id, verdict.score, verdict.confidence
        );
        self.apply_verdict(ctx, thread_id, &verdict).await;
    }

    async fn apply_verdict(
        self: &Arc<Self>,
        ctx: &Context,
        thread_id: u64,
        verdict: &SatisfactionVerdict,
    ) {
        let (state, last_response) = {
            let Some(record) = self.records.get(&thread_id) else {
                return;
            };
            (record.state, record.responses.last().copied())
        };
        if state.is_terminal() {
            return;
        }

        match route_verdict(state, last_response, verdict) {
            VerdictAction::Solve => {
                // The author resolving their own thread is not a helper
                // credit, so no leaderboard entry here.
                self.solve_thread(ctx, thread_id, None, None, None).await;
            }
            VerdictAction::Escalate => {
                self.escalate_thread(ctx, thread_id, true, ESCALATION_NOTICE).await;
            }
            VerdictAction::Regenerate => {
                self.regenerate(ctx, thread_id, ThreadState::AiAnswered).await;
            }
            VerdictAction::Ignore => {}
        }
    }

    // ---- buttons ----------------------------------------------------------

    pub async fn handle_component(self: &Arc<Self>, ctx: &Context, interaction: &ComponentInteraction) {
        let custom_id = interaction.data.custom_id.as_str();
        if custom_id != FEEDBACK_SOLVED_ID && custom_id != FEEDBACK_NOT_SOLVED_ID {
            return;
        }

        // Acknowledge inside the interaction window; a second ack on a
        // retried delivery fails harmlessly.
        if let Err(e) = interaction
            .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
            .await
        {
            info!("interaction already acknowledged: {}", e);
        }

        if let Err(e) = interaction
            .channel_id
            .edit_message(
                &ctx.http,
                interaction.message.id,
                EditMessage::new().components(vec![disabled_feedback_buttons()]),
            )
            .await
        {
            warn!("could not disable feedback buttons: {}", e);
        }

        let thread_id = interaction.channel_id.get();
        let Some(state) = self.thread_state(thread_id) else {
            info!("feedback on untracked thread {}; ignoring", thread_id);
            return;
        };
        if state.is_terminal() {
            return;
        }

        if custom_id == FEEDBACK_SOLVED_ID {
            let user = &interaction.user;
            self.solve_thread(
                ctx,
                thread_id,
                Some(user.id.get()),
                Some(user.display_name().to_string()),
                user.avatar_url(),
            )
            .await;
        } else {
            self.handle_not_solved(ctx, thread_id, state).await;
        }
    }

    async fn handle_not_solved(self: &Arc<Self>, ctx: &Context, thread_id: u64, state: ThreadState) {
        let response_count = self
            .records
            .get(&thread_id)
            .map(|r| r.responses.len())
            .unwrap_or(0);

        let second_strike = state == ThreadState::Retrying;
        if second_strike || response_count >= MAX_AUTOMATED_REPLIES {
            self.escalate_thread(ctx, thread_id, true, ESCALATION_NOTICE).await;
            return;
        }

        if let Some(mut record) = self.records.get_mut(&thread_id) {
            record.retry_count += 1;
        }
        let next_state = match state {
            ThreadState::AutoAnswered => ThreadState::AiAnswered,
            _ => ThreadState::Retrying,
        };
        self.regenerate(ctx, thread_id, next_state).await;
    }

    /// Produce another automated answer using the whole conversation as
    /// context. Falls back to escalation when the upstream is gone.
    async fn regenerate(self: &Arc<Self>, ctx: &Context, thread_id: u64, next_state: ThreadState) {
        let response_count = self
            .records
            .get(&thread_id)
            .map(|r| r.responses.len())
            .unwrap_or(0);
        if response_count >= MAX_AUTOMATED_REPLIES {
            self.escalate_thread(ctx, thread_id, true, ESCALATION_NOTICE).await;
            return;
        }

        let (title, image_urls) = {
            let Some(record) = self.records.get(&thread_id) else {
                return;
            };
            (
                record.title.clone(),
                record.images.iter().map(|i| i.url.clone()).collect::<Vec<_>>(),
            )
        };

        let conversation = self.conversation_context(ctx, thread_id).await;
        let query = format!("{}\n\nConversation so far:\n{}", title, conversation);
        let entries = self
            .retriever
            .find_relevant_entries(&query, RETRIEVAL_TOP_K, RETRIEVAL_MIN_SCORE)
            .await;

        match self.generator.generate(&query, &entries, &image_urls).await {
            Ok(answer) => {
                if let Err(e) = self.post_answer(ctx, ChannelId::new(thread_id), &answer).await {
                    error!("could not post follow-up in {}: {}", thread_id, e);
                    return;
                }
                self.commit_response(thread_id, ResponseKind::Ai, next_state, answer);
                self.dashboard.post_status(thread_id, STATUS_AI_RESPONSE).await;
            }
            Err(e) => {
                warn!("follow-up generation failed for {}: {}", thread_id, e);
                self.escalate_thread(ctx, thread_id, false, UPSTREAM_TROUBLE_NOTICE).await;
            }
        }
    }

    async fn conversation_context(&self, ctx: &Context, thread_id: u64) -> String {
        let messages = match ChannelId::new(thread_id)
            .messages(&ctx.http, GetMessages::new().limit(10))
            .await
        {
            Ok(messages) => messages,
            Err(_) => return String::new(),
        };
        messages
            .iter()
            .rev()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| format!("{}: {}", m.author.display_name(), clip(&m.content, 400)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ---- terminal transitions ---------------------------------------------

    async fn solve_thread(
        self: &Arc<Self>,
        ctx: &Context,
        thread_id: u64,
        credited_user: Option<u64>,
        credited_name: Option<String>,
        credited_avatar: Option<String>,
    ) {
        self.abort_probe(thread_id);

        let (title, answer, no_review) = {
            let Some(mut record) = self.records.get_mut(&thread_id) else {
                return;
            };
            record.state = ThreadState::Solved;
            record.images.clear();
            record.last_activity = Instant::now();
            (record.title.clone(), record.last_answer.clone(), record.no_review)
        };
        self.phases
            .insert(thread_id, Phase::ProcessedRecently(Instant::now()));

        self.tags.mark_solved(&ctx.http, ChannelId::new(thread_id)).await;
        self.dashboard.post_status(thread_id, STATUS_SOLVED).await;

        if let Some(user_id) = credited_user {
            let name = credited_name.unwrap_or_else(|| "unknown".to_string());
            let count = self
                .leaderboard
                .record_solved(user_id, &name, credited_avatar);
            info!("🏆 {} solved thread {} ({} this month)", name, thread_id, count);
        }

        let auto_rag = { self.settings.read().await.auto_rag_enabled };
        if auto_rag && !no_review {
            if let Some(answer) = answer {
                let keywords: Vec<String> = word_set(&title).into_iter().take(6).collect();
                if let Err(e) = self
                    .dashboard
                    .submit_pending_entry(&title, &answer, &keywords)
                    .await
                {
                    warn!("pending knowledge submission failed: {}", e);
                }
            }
        }
        info!("✅ thread {} solved", thread_id);
    }

    async fn escalate_thread(
        self: &Arc<Self>,
        ctx: &Context,
        thread_id: u64,
        request_logs: bool,
        notice: &str,
    ) {
        self.abort_probe(thread_id);
        let thread = ChannelId::new(thread_id);

        // Redesign decision: the log request goes out before the embed so
        // the last thing the user sees is the handoff confirmation.
        if request_logs {
            if let Err(e) = thread.say(&ctx.http, LOG_REQUEST_PROMPT).await {
                warn!("could not post log request in {}: {}", thread_id, e);
            }
        }
        let embed = CreateEmbed::new()
            .title("🔔 Support team notified")
            .description(notice)
            .colour(0xED4245);
        if let Err(e) = thread
            .send_message(&ctx.http, CreateMessage::new().embed(embed))
            .await
        {
            warn!("could not post escalation embed in {}: {}", thread_id, e);
        }

        if let Some(mut record) = self.records.get_mut(&thread_id) {
            record.state = ThreadState::Escalated;
            record.images.clear();
            record.last_activity = Instant::now();
        }
        self.phases.insert(thread_id, Phase::Escalated(Instant::now()));

        self.tags.mark_escalated(&ctx.http, thread).await;
        self.dashboard.post_status(thread_id, STATUS_HUMAN_SUPPORT).await;
        self.notify_staff(ctx, thread_id).await;
        info!("🚨 thread {} escalated to human support", thread_id);
    }

    async fn notify_staff(&self, ctx: &Context, thread_id: u64) {
        let (channel, role) = {
            let settings = self.settings.read().await;
            (settings.notification_channel_id, settings.notification_role_id)
        };
        let Some(channel) = channel else {
            return;
        };
        let mention = role.map(|r| format!("<@&{}> ", r)).unwrap_or_default();
        let content = format!(
            "{}a support thread needs a human: https://discord.com/channels/{}/{}",
            mention, self.guild_id, thread_id
        );
        if let Err(e) = ChannelId::new(channel).say(&ctx.http, content).await {
            warn!("staff notification failed: {}", e);
        }
    }

    pub async fn close_no_review(self: &Arc<Self>, ctx: &Context, thread_id: u64) {
        self.abort_probe(thread_id);
        if let Some(mut record) = self.records.get_mut(&thread_id) {
            record.no_review = true;
            record.state = ThreadState::Closed;
            record.images.clear();
        }
        self.phases
            .insert(thread_id, Phase::ProcessedRecently(Instant::now()));
        self.tags.close_and_lock(&ctx.http, ChannelId::new(thread_id)).await;
        self.dashboard.post_status(thread_id, STATUS_SOLVED).await;
    }

    pub async fn handle_thread_delete(&self, thread_id: u64) {
        self.abort_probe(thread_id);
        self.records.remove(&thread_id);
        self.phases.remove(&thread_id);
        self.dashboard.post_deleted(thread_id).await;
        info!("thread {} deleted upstream; record dropped", thread_id);
    }

    /// Abort is idempotent; aborting a finished task is a no-op.
    fn abort_probe(&self, thread_id: u64) {
        if let Some((_, handle)) = self.probes.remove(&thread_id) {
            handle.abort();
        }
    }

    // ---- janitor hooks ----------------------------------------------------

    /// Periodic sweep: expire idle records, release stale image sets, drop
    /// aged tracking phases, purge the response cache.
    pub fn cleanup(&self) {
        let mut expired = Vec::new();
        for mut entry in self.records.iter_mut() {
            let idle = entry.last_activity.elapsed();
            if idle > RECORD_EXPIRY {
                expired.push(*entry.key());
            } else if idle > IMAGE_RETENTION && !entry.images.is_empty() {
                entry.images.clear();
            }
        }
        for thread_id in &expired {
            self.abort_probe(*thread_id);
            self.records.remove(thread_id);
        }
        self.phases.retain(|_, phase| match phase {
            Phase::BeingProcessed => true,
            Phase::ProcessedRecently(ts) | Phase::Escalated(ts) => {
                ts.elapsed() <= RECORD_EXPIRY
            }
        });
        self.generator.purge_cache();
        if !expired.is_empty() {
            info!("🧹 expired {} idle thread record(s)", expired.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(
        satisfied: bool,
        wants_human: bool,
        is_followup: bool,
        confidence: u8,
        score: i32,
    ) -> SatisfactionVerdict {
        SatisfactionVerdict {
            satisfied,
            wants_human,
            is_followup,
            confidence,
            score,
        }
    }

    #[test]
    fn test_satisfied_high_confidence_solves() {
        let v = verdict(true, false, false, 80, 2);
        assert_eq!(
            route_verdict(ThreadState::AiAnswered, Some(ResponseKind::Ai), &v),
            VerdictAction::Solve
        );
        assert_eq!(
            route_verdict(ThreadState::AutoAnswered, Some(ResponseKind::Auto), &v),
            VerdictAction::Solve
        );
    }

    #[test]
    fn test_satisfied_low_confidence_is_ignored() {
        let v = verdict(true, false, false, 60, 0);
        assert_eq!(
            route_verdict(ThreadState::AiAnswered, Some(ResponseKind::Ai), &v),
            VerdictAction::Ignore
        );
    }

    #[test]
    fn test_wants_human_after_ai_answer_escalates() {
        let v = verdict(false, true, false, 40, 0);
        assert_eq!(
            route_verdict(ThreadState::AiAnswered, Some(ResponseKind::Ai), &v),
            VerdictAction::Escalate
        );
    }

    #[test]
    fn test_wants_human_after_auto_answer_does_not_escalate() {
        let v = verdict(false, true, false, 40, 0);
        assert_eq!(
            route_verdict(ThreadState::AutoAnswered, Some(ResponseKind::Auto), &v),
            VerdictAction::Ignore
        );
    }

    #[test]
    fn test_strong_dissatisfaction_retries_auto_but_escalates_ai() {
        let v = verdict(false, true, false, 20, -4);
        assert_eq!(
            route_verdict(ThreadState::AutoAnswered, Some(ResponseKind::Auto), &v),
            VerdictAction::Regenerate
        );
        assert_eq!(
            route_verdict(ThreadState::Retrying, Some(ResponseKind::Ai), &v),
            VerdictAction::Escalate
        );
    }

    #[test]
    fn test_followup_regenerates() {
        let v = verdict(false, false, true, 40, 0);
        assert_eq!(
            route_verdict(ThreadState::AiAnswered, Some(ResponseKind::Ai), &v),
            VerdictAction::Regenerate
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(ThreadState::Solved.is_terminal());
        assert!(ThreadState::Escalated.is_terminal());
        assert!(ThreadState::Closed.is_terminal());
        assert!(!ThreadState::Retrying.is_terminal());
        assert!(!ThreadState::New.is_terminal());
        assert!(!ThreadState::AwaitingFeedback.is_terminal());
        assert!(!ThreadState::Unsolved.is_terminal());
    }

    #[test]
    fn test_staff_detection_by_role() {
        let roles = vec![RoleId::new(7)];
        assert!(staff_check(&roles, None, Some(7)));
        assert!(!staff_check(&roles, None, Some(8)));
        assert!(!is_staff(None, Some(7)));
    }

    #[test]
    fn test_staff_detection_by_manage_threads() {
        assert!(staff_check(&[], Some(Permissions::MANAGE_THREADS), None));
        assert!(!staff_check(&[], Some(Permissions::SEND_MESSAGES), None));
        assert!(!staff_check(&[], None, None));
    }

    #[test]
    fn test_monitored_match_accepts_forum_or_its_category() {
        // Direct forum parent.
        assert!(monitored_match(10, Some(10), None));
        // Monitored id set to the category above the forum.
        assert!(monitored_match(99, Some(10), Some(99)));
        assert!(!monitored_match(5, Some(10), Some(99)));
        assert!(!monitored_match(5, None, None));
    }

    #[test]
    fn test_close_command_only_from_resting_states() {
        assert!(close_allowed(ThreadState::Solved));
        assert!(close_allowed(ThreadState::Escalated));
        assert!(!close_allowed(ThreadState::New));
        assert!(!close_allowed(ThreadState::AiAnswered));
        assert!(!close_allowed(ThreadState::Retrying));
        assert!(!close_allowed(ThreadState::Closed));
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        assert_eq!(clip("héllo", 3), "hél");
        assert_eq!(clip("short", 10), "short");
    }
}
