use chrono::{Datelike, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HelperScore {
    pub display_name: String,
    pub solved_count: u64,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Monthly solved-thread credit per helper. Scores roll over to zero when
/// the calendar month changes; the dashboard keeps the published copy.
pub struct Leaderboard {
    inner: Mutex<Inner>,
}

struct Inner {
    month: String,
    scores: HashMap<u64, HelperScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LeaderboardSnapshot {
    pub month: String,
    pub scores: HashMap<u64, HelperScore>,
}

fn current_month() -> String {
    let now = Utc::now();
    format!("{:04}-{:02}", now.year(), now.month())
}

impl Leaderboard {
    pub fn new() -> Self {
        Leaderboard {
            inner: Mutex::new(Inner {
                month: current_month(),
                scores: HashMap::new(),
            }),
        }
    }

    /// Credit a helper for a solved thread and return their new count. The
    /// display name and avatar are refreshed on every credit.
    pub fn record_solved(
        &self,
        user_id: u64,
        display_name: &str,
        avatar_url: Option<String>,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        self.roll_if_needed(&mut inner);
        let score = inner.scores.entry(user_id).or_default();
        score.display_name = display_name.to_string();
        score.avatar_url = avatar_url;
        score.solved_count += 1;
        score.solved_count
    }

    pub fn snapshot(&self) -> LeaderboardSnapshot {
        let mut inner = self.inner.lock().unwrap();
        self.roll_if_needed(&mut inner);
        LeaderboardSnapshot {
            month: inner.month.clone(),
            scores: inner.scores.clone(),
        }
    }

    /// Adopt the dashboard's copy at startup, unless it is from a past month.
    pub fn restore(&self, snapshot: LeaderboardSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        if snapshot.month == current_month() {
            info!(
                "restored leaderboard for {} ({} helper(s))",
                snapshot.month,
                snapshot.scores.len()
            );
            inner.month = snapshot.month;
            inner.scores = snapshot.scores;
        } else {
            info!("dashboard leaderboard is for {}; starting fresh", snapshot.month);
        }
    }

    fn roll_if_needed(&self, inner: &mut Inner) {
        let month = current_month();
        if inner.month != month {
            info!("new month {}; resetting leaderboard", month);
            inner.month = month;
            inner.scores.clear();
        }
    }
}

impl Default for Leaderboard {
    fn default() -> Self {
        Self::new()
    }
}
