use log::{info, warn};
use serenity::builder::EditThread;
use serenity::http::Http;
use serenity::model::channel::GuildChannel;
use serenity::model::id::{ChannelId, ForumTagId};

use crate::generator::SettingsHandle;

/// Applies forum tags and archive/lock state to threads. Every operation is
/// best-effort: missing tag configuration and permission failures are logged
/// and the thread is left as-is.
pub struct TagController {
    settings: SettingsHandle,
}

impl TagController {
    pub fn new(settings: SettingsHandle) -> Self {
        TagController { settings }
    }

    /// Tag a fresh thread with its issue category plus the unsolved marker.
    pub async fn apply_issue_tag(&self, http: &Http, thread: ChannelId, category: &str) {
        let (category_tag, unsolved_tag) = {
            let settings = self.settings.read().await;
            (settings.tag_for_category(category), settings.unsolved_tag_id)
        };
        if category_tag.is_none() && unsolved_tag.is_none() {
            warn!("no issue tags configured; skipping tagging for {}", thread);
            return;
        }
        let Some(current) = self.fetch_thread(http, thread).await else {
            return;
        };
        let mut tags = swap_tags(tag_values(&current), None, category_tag);
        tags = swap_tags(tags, None, unsolved_tag);
        self.edit(http, thread, EditThread::new().applied_tags(to_tag_ids(tags)))
            .await;
    }

    /// Swap unsolved for resolved, then archive and lock. Safe to call on an
    /// already-closed thread.
    pub async fn mark_solved(&self, http: &Http, thread: ChannelId) {
        let (unsolved, resolved) = {
            let settings = self.settings.read().await;
            (settings.unsolved_tag_id, settings.resolved_tag_id)
        };
        let Some(current) = self.fetch_thread(http, thread).await else {
            return;
        };
        let tags = swap_tags(tag_values(&current), unsolved, resolved);
        self.edit(
            http,
            thread,
            EditThread::new()
                .applied_tags(to_tag_ids(tags))
                .archived(true)
                .locked(true),
        )
        .await;
        info!("thread {} marked solved and closed", thread);
    }

    /// Escalated threads keep the unsolved marker and gain the user-issue
    /// tag so staff can filter for them.
    pub async fn mark_escalated(&self, http: &Http, thread: ChannelId) {
        let user_issue = { self.settings.read().await.user_issue_tag_id };
        let Some(tag) = user_issue else {
            warn!("user-issue tag not configured; skipping for {}", thread);
            return;
        };
        let Some(current) = self.fetch_thread(http, thread).await else {
            return;
        };
        let tags = swap_tags(tag_values(&current), None, Some(tag));
        self.edit(http, thread, EditThread::new().applied_tags(to_tag_ids(tags)))
            .await;
    }

    /// Archive and lock without touching tags. Used for no-review closures.
    pub async fn close_and_lock(&self, http: &Http, thread: ChannelId) {
        self.edit(http, thread, EditThread::new().archived(true).locked(true))
            .await;
    }

    async fn fetch_thread(&self, http: &Http, thread: ChannelId) -> Option<GuildChannel> {
        match http.get_channel(thread).await {
            Ok(channel) => match channel.guild() {
                Some(guild_channel) => Some(guild_channel),
                None => {
                    warn!("channel {} is not a guild thread; cannot tag", thread);
                    None
                }
            },
            Err(e) => {
                warn!("could not fetch thread {} for tagging: {}", thread, e);
                None
            }
        }
    }

    async fn edit(&self, http: &Http, thread: ChannelId, builder: EditThread<'_>) {
        if let Err(e) = thread.edit_thread(http, builder).await {
            warn!("thread edit failed for {} (permissions?): {}", thread, e);
        }
    }
}

fn tag_values(channel: &GuildChannel) -> Vec<u64> {
    channel.applied_tags.iter().map(|t| t.get()).collect()
}

fn to_tag_ids(values: Vec<u64>) -> Vec<ForumTagId> {
    values.into_iter().map(ForumTagId::new).collect()
}

/// Remove one tag id and add another, keeping everything else and never
/// duplicating. `None` on either side is a no-op for that side.
fn swap_tags(mut tags: Vec<u64>, remove: Option<u64>, add: Option<u64>) -> Vec<u64> {
    if let Some(id) = remove {
        tags.retain(|t| *t != id);
    }
    if let Some(id) = add {
        if !tags.contains(&id) {
            tags.push(id);
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_replaces_unsolved_with_resolved() {
        let tags = swap_tags(vec![10, 20], Some(10), Some(30));
        assert_eq!(tags, vec![20, 30]);
    }

    #[test]
    fn test_swap_never_duplicates() {
        let tags = swap_tags(vec![10, 30], None, Some(30));
        assert_eq!(tags, vec![10, 30]);
    }

    #[test]
    fn test_swap_tolerates_missing_remove_target() {
        let tags = swap_tags(vec![20], Some(10), Some(30));
        assert_eq!(tags, vec![20, 30]);
    }

    #[test]
    fn test_swap_with_neither_side_is_identity() {
        let tags = swap_tags(vec![1, 2, 3], None, None);
        assert_eq!(tags, vec![1, 2, 3]);
    }
}
