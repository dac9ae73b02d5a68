//! # Feature: Credential Pool
//!
//! Holds the LLM API keys and selects one per call under health and rate
//! constraints. Sliding 60-second windows per key, proactive rotation, and
//! persistent-error bookkeeping keep any single key under the provider's
//! documented per-minute quota.
//!
//! - **Version**: 1.0.0
//! - **Since**: 0.1.0
//! - **Toggleable**: false

use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Hard ceiling matching the provider's documented per-minute quota.
pub const MAX_CALLS_PER_WINDOW: usize = 30;
pub const RATE_WINDOW: Duration = Duration::from_secs(60);
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);
const RECENT_QUEUE_CAP: usize = 100;
/// Recent-call count at which the pool rotates even below quota.
const ROTATION_WINDOW_CEILING: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialErrorKind {
    /// Key rejected by the provider. Unselectable until an operator reset.
    Auth,
    /// Key malformed or revoked. Unselectable until an operator reset.
    Invalid,
    /// Provider asked us to back off. Recoverable after cooldown.
    RateLimit,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("all credentials saturated, retry after {retry_after:?}")]
    Saturated { retry_after: Duration },
    #[error("no usable LLM credential remains")]
    AllKeysExhausted,
}

/// A key selected for one immediate LLM call.
#[derive(Debug, Clone)]
pub struct LeasedKey {
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct CredentialStats {
    pub key_tail: String,
    pub uses: u64,
    pub successes: u64,
    pub persistent_errors: u64,
    pub recent_calls: usize,
    pub disabled: bool,
    pub rate_limited: bool,
}

struct Credential {
    key: String,
    uses: u64,
    successes: u64,
    persistent_errors: u64,
    disabled: bool,
    rate_limited_until: Option<Instant>,
    recent_calls: VecDeque<Instant>,
    last_used: Option<Instant>,
    calls_since_rotation: u32,
}

impl Credential {
    fn new(key: String) -> Self {
        Credential {
            key,
            uses: 0,
            successes: 0,
            persistent_errors: 0,
            disabled: false,
            rate_limited_until: None,
            recent_calls: VecDeque::new(),
            last_used: None,
            calls_since_rotation: 0,
        }
    }

    /// Prune the recent-call queue to the rate window. Runs on every
    /// inspection so counts are always current.
    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.recent_calls.front() {
            if now.duration_since(front) >= RATE_WINDOW {
                self.recent_calls.pop_front();
            } else {
                break;
            }
        }
    }

    fn recent_count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.recent_calls.len()
    }

    /// Lazily clears an elapsed cooldown.
    fn is_cooling(&mut self, now: Instant) -> bool {
        match self.rate_limited_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.rate_limited_until = None;
                false
            }
            None => false,
        }
    }

    fn health_score(&mut self, now: Instant) -> i64 {
        if self.is_cooling(now) {
            return -5000;
        }
        let recent = self.recent_count(now);
        match recent {
            n if n >= MAX_CALLS_PER_WINDOW => return -2000,
            25..=29 => return -500,
            20..=24 => return -100,
            15..=19 => return 10,
            _ => {}
        }
        // Fresh, error-free keys get a fixed bias so new keys are preferred.
        if self.uses == 0 && self.persistent_errors == 0 {
            return 200;
        }
        let uses = self.uses.max(1) as f64;
        let success_rate = self.successes as f64 / uses;
        let error_rate = self.persistent_errors as f64 / uses;
        let mut score = (100.0 * success_rate - 100.0 * error_rate) as i64;
        // Up to +150 for a quiet window, +30 for idle time.
        score += ((15 - recent as i64) * 10).clamp(0, 150);
        if let Some(last) = self.last_used {
            let idle = now.duration_since(last).as_secs().min(300);
            score += (idle / 10) as i64;
        }
        score
    }

    /// How long until this credential could be selected again, if ever.
    fn retry_after(&mut self, now: Instant) -> Option<Duration> {
        if self.disabled {
            return None;
        }
        if let Some(until) = self.rate_limited_until {
            if now < until {
                return Some(until - now);
            }
        }
        self.prune(now);
        if self.recent_calls.len() >= MAX_CALLS_PER_WINDOW {
            let oldest = *self.recent_calls.front()?;
            return Some((oldest + RATE_WINDOW).saturating_duration_since(now));
        }
        Some(Duration::ZERO)
    }
}

pub struct CredentialPool {
    credentials: Mutex<Vec<Credential>>,
    per_key_quota: u32,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>) -> Self {
        let per_key_quota = quota_for_pool_size(keys.len());
        debug!(
            "credential pool: {} key(s), per-key rotation quota {}",
            keys.len(),
            per_key_quota
        );
        CredentialPool {
            credentials: Mutex::new(keys.into_iter().map(Credential::new).collect()),
            per_key_quota,
        }
    }

    /// Select a credential for an immediate LLM call. Fewest recent calls
    /// wins, ties broken by health score. Keys inside a rate-limit cooldown
    /// are skipped; keys at their rotation quota yield to fresher ones.
    pub fn acquire(&self) -> Result<LeasedKey, PoolError> {
        let now = Instant::now();
        let mut creds = self.credentials.lock().unwrap();

        if creds.iter().all(|c| c.disabled) {
            return Err(PoolError::AllKeysExhausted);
        }

        let selectable: Vec<usize> = (0..creds.len())
            .filter(|&i| {
                let c = &mut creds[i];
                !c.disabled && !c.is_cooling(now) && c.recent_count(now) < MAX_CALLS_PER_WINDOW
            })
            .collect();

        if selectable.is_empty() {
            let retry_after = creds
                .iter_mut()
                .filter_map(|c| c.retry_after(now))
                .min()
                .unwrap_or(RATE_WINDOW);
            return Err(PoolError::Saturated { retry_after });
        }

        // Prefer keys below quota and below the rotation window ceiling; if
        // every selectable key is spent, rotate all counters and start over.
        let mut preferred: Vec<usize> = selectable
            .iter()
            .copied()
            .filter(|&i| {
                creds[i].calls_since_rotation < self.per_key_quota
                    && creds[i].recent_calls.len() < ROTATION_WINDOW_CEILING
            })
            .collect();
        if preferred.is_empty() {
            for &i in &selectable {
                creds[i].calls_since_rotation = 0;
            }
            preferred = selectable;
        }

        let chosen = preferred
            .into_iter()
            .min_by_key(|&i| {
                let recent = creds[i].recent_count(now);
                let health = creds[i].health_score(now);
                (recent, -health)
            })
            .expect("preferred candidate set is non-empty");

        let cred = &mut creds[chosen];
        cred.recent_calls.push_back(now);
        if cred.recent_calls.len() > RECENT_QUEUE_CAP {
            cred.recent_calls.pop_front();
        }
        cred.uses += 1;
        cred.calls_since_rotation += 1;
        cred.last_used = Some(now);

        Ok(LeasedKey {
            key: cred.key.clone(),
        })
    }

    /// A success pays down one persistent error, never below zero.
    pub fn report_success(&self, key: &str) {
        let mut creds = self.credentials.lock().unwrap();
        if let Some(cred) = creds.iter_mut().find(|c| c.key == key) {
            cred.successes += 1;
            cred.persistent_errors = cred.persistent_errors.saturating_sub(1);
        }
    }

    pub fn report_error(&self, key: &str, kind: CredentialErrorKind) {
        let mut creds = self.credentials.lock().unwrap();
        let Some(cred) = creds.iter_mut().find(|c| c.key == key) else {
            return;
        };
        match kind {
            CredentialErrorKind::Auth | CredentialErrorKind::Invalid => {
                cred.persistent_errors += 1;
                cred.disabled = true;
                warn!(
                    "credential …{} disabled after {:?} error",
                    key_tail(key),
                    kind
                );
            }
            CredentialErrorKind::RateLimit => {
                cred.rate_limited_until = Some(Instant::now() + RATE_LIMIT_COOLDOWN);
            }
        }
    }

    /// Operator action: make a disabled key selectable again.
    pub fn reset_key(&self, key: &str) {
        let mut creds = self.credentials.lock().unwrap();
        if let Some(cred) = creds.iter_mut().find(|c| c.key == key) {
            cred.disabled = false;
            cred.rate_limited_until = None;
        }
    }

    pub fn stats(&self) -> Vec<CredentialStats> {
        let now = Instant::now();
        let mut creds = self.credentials.lock().unwrap();
        creds
            .iter_mut()
            .map(|c| {
                let recent = c.recent_count(now);
                CredentialStats {
                    key_tail: key_tail(&c.key),
                    uses: c.uses,
                    successes: c.successes,
                    persistent_errors: c.persistent_errors,
                    recent_calls: recent,
                    disabled: c.disabled,
                    rate_limited: c.is_cooling(now),
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.credentials.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn set_cooldown_until(&self, key: &str, until: Instant) {
        let mut creds = self.credentials.lock().unwrap();
        if let Some(cred) = creds.iter_mut().find(|c| c.key == key) {
            cred.rate_limited_until = Some(until);
        }
    }
}

/// More keys spread the load, so each individual key gets a smaller quota
/// before proactive rotation.
fn quota_for_pool_size(n: usize) -> u32 {
    match n {
        n if n >= 10 => 3,
        n if n >= 6 => 5,
        n if n >= 3 => 8,
        _ => 10,
    }
}

fn key_tail(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let start = chars.len().saturating_sub(4);
    chars[start..].iter().collect()
}
