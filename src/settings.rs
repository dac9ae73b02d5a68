use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Operator-tunable settings. The authoritative copy lives in the dashboard
/// record; this struct is the merged view the engine reads. The engine never
/// writes these back unless an operator changed them through the command
/// surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BotSettings {
    /// Overrides SUPPORT_FORUM_CHANNEL_ID when set.
    pub monitored_channel_id: Option<u64>,
    /// Thread ids the engine must never touch.
    pub ignored_post_ids: HashSet<u64>,
    pub ai_temperature: f32,
    pub ai_max_tokens: u32,
    /// Seconds between a user message and the satisfaction probe.
    pub satisfaction_check_delay_secs: u64,
    /// Forum tag id per issue category name.
    pub issue_tag_ids: HashMap<String, u64>,
    pub unsolved_tag_id: Option<u64>,
    pub resolved_tag_id: Option<u64>,
    pub user_issue_tag_id: Option<u64>,
    pub bug_tag_id: Option<u64>,
    pub crash_tag_id: Option<u64>,
    pub rdp_tag_id: Option<u64>,
    pub notification_channel_id: Option<u64>,
    pub notification_role_id: Option<u64>,
    pub post_inactivity_threshold_hours: u64,
    pub high_priority_check_interval_hours: u64,
    pub solved_post_retention_days: u64,
    pub auto_rag_enabled: bool,
    pub satisfaction_analysis_enabled: bool,
    pub system_prompt_override: Option<String>,
}

impl Default for BotSettings {
    fn default() -> Self {
        BotSettings {
            monitored_channel_id: None,
            ignored_post_ids: HashSet::new(),
            ai_temperature: 0.7,
            ai_max_tokens: 800,
            satisfaction_check_delay_secs: 15,
            issue_tag_ids: HashMap::new(),
            unsolved_tag_id: None,
            resolved_tag_id: None,
            user_issue_tag_id: None,
            bug_tag_id: None,
            crash_tag_id: None,
            rdp_tag_id: None,
            notification_channel_id: None,
            notification_role_id: None,
            post_inactivity_threshold_hours: 24,
            high_priority_check_interval_hours: 6,
            solved_post_retention_days: 30,
            auto_rag_enabled: true,
            satisfaction_analysis_enabled: true,
            system_prompt_override: None,
        }
    }
}

impl BotSettings {
    /// Merge a dashboard `botSettings` document over the defaults. Fields the
    /// dashboard omits keep their default; malformed documents keep all
    /// defaults rather than poisoning the running configuration.
    pub fn merged_over_defaults(doc: &Value) -> BotSettings {
        let defaults = BotSettings::default();
        let Value::Object(incoming) = doc else {
            if !doc.is_null() {
                warn!("botSettings document is not an object; keeping defaults");
            }
            return defaults;
        };

        let mut base = match serde_json::to_value(&defaults) {
            Ok(Value::Object(map)) => map,
            _ => return defaults,
        };
        for (key, value) in incoming {
            if base.contains_key(key) && !value.is_null() {
                base.insert(key.clone(), value.clone());
            }
        }

        match serde_json::from_value(Value::Object(base)) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("botSettings document failed to deserialize ({}); keeping defaults", e);
                defaults
            }
        }
    }

    /// Probe delay clamped to the permitted 5..=300 second range.
    pub fn probe_delay_secs(&self) -> u64 {
        self.satisfaction_check_delay_secs.clamp(5, 300)
    }

    pub fn tag_for_category(&self, category: &str) -> Option<u64> {
        self.issue_tag_ids.get(category).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let s = BotSettings::default();
        assert_eq!(s.satisfaction_check_delay_secs, 15);
        assert_eq!(s.ai_max_tokens, 800);
        assert!(s.auto_rag_enabled);
        assert!(s.system_prompt_override.is_none());
    }

    #[test]
    fn test_merge_overrides_known_fields() {
        let doc = json!({
            "aiTemperature": 0.3,
            "satisfactionCheckDelaySecs": 45,
            "resolvedTagId": 42,
            "issueTagIds": {"bug": 7},
            "systemPromptOverride": "be terse"
        });
        let s = BotSettings::merged_over_defaults(&doc);
        assert!((s.ai_temperature - 0.3).abs() < f32::EPSILON);
        assert_eq!(s.satisfaction_check_delay_secs, 45);
        assert_eq!(s.resolved_tag_id, Some(42));
        assert_eq!(s.tag_for_category("bug"), Some(7));
        assert_eq!(s.system_prompt_override.as_deref(), Some("be terse"));
        // Untouched fields keep defaults.
        assert_eq!(s.ai_max_tokens, 800);
    }

    #[test]
    fn test_merge_ignores_unknown_and_null() {
        let doc = json!({
            "someFutureKnob": true,
            "aiMaxTokens": null
        });
        let s = BotSettings::merged_over_defaults(&doc);
        assert_eq!(s.ai_max_tokens, 800);
    }

    #[test]
    fn test_merge_non_object_keeps_defaults() {
        let s = BotSettings::merged_over_defaults(&json!("nonsense"));
        assert_eq!(s.ai_temperature, BotSettings::default().ai_temperature);
    }

    #[test]
    fn test_probe_delay_clamped() {
        let mut s = BotSettings::default();
        s.satisfaction_check_delay_secs = 1;
        assert_eq!(s.probe_delay_secs(), 5);
        s.satisfaction_check_delay_secs = 10_000;
        assert_eq!(s.probe_delay_secs(), 300);
        s.satisfaction_check_delay_secs = 15;
        assert_eq!(s.probe_delay_secs(), 15);
    }
}
