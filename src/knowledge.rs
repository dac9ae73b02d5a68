use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Working-memory copy of content is kept short; the authoritative full text
/// lives in the vector index metadata.
pub const MEMORY_CONTENT_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoResponseRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    pub response: String,
}

impl AutoResponseRule {
    /// A rule matches when every trigger appears as a word in the query, or
    /// when at least 80% of triggers match and at least two do. Rules with no
    /// triggers never match.
    pub fn matches(&self, query: &str) -> bool {
        if self.triggers.is_empty() {
            return false;
        }
        let words = word_set(query);
        let normalized = words.join(" ");
        let hit_count = self
            .triggers
            .iter()
            .filter(|trigger| {
                let t = trigger.to_lowercase();
                if t.contains(' ') {
                    normalized.contains(&t)
                } else {
                    words.iter().any(|w| *w == t)
                }
            })
            .count();

        if hit_count == self.triggers.len() {
            return true;
        }
        hit_count >= 2 && (hit_count as f64) / (self.triggers.len() as f64) >= 0.8
    }
}

/// Lowercased alphanumeric words, in order.
pub fn word_set(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

/// Read-only replica of the dashboard's knowledge base. The dashboard owns
/// the data; the sync loop replaces both collections wholesale.
pub struct KnowledgeStore {
    entries: DashMap<String, KnowledgeEntry>,
    rules: RwLock<Vec<AutoResponseRule>>,
}

impl KnowledgeStore {
    pub fn new() -> Self {
        KnowledgeStore {
            entries: DashMap::new(),
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn replace_entries(&self, incoming: Vec<KnowledgeEntry>) {
        self.entries.clear();
        for mut entry in incoming {
            if entry.content.chars().count() > MEMORY_CONTENT_LIMIT {
                entry.content = entry.content.chars().take(MEMORY_CONTENT_LIMIT).collect();
            }
            self.entries.insert(entry.id.clone(), entry);
        }
    }

    pub fn replace_rules(&self, incoming: Vec<AutoResponseRule>) {
        *self.rules.write().unwrap() = incoming;
    }

    pub fn get(&self, id: &str) -> Option<KnowledgeEntry> {
        self.entries.get(id).map(|e| e.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn all_entries(&self) -> Vec<KnowledgeEntry> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// First matching rule wins; rules are evaluated in list order.
    pub fn find_auto_response(&self, query: &str) -> Option<String> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .find(|rule| rule.matches(query))
            .map(|rule| rule.response.clone())
    }
}

impl Default for KnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(triggers: &[&str], response: &str) -> AutoResponseRule {
        AutoResponseRule {
            id: "r1".to_string(),
            name: "test".to_string(),
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
            response: response.to_string(),
        }
    }

    #[test]
    fn test_all_triggers_match() {
        let r = rule(&["password", "reset"], "R");
        assert!(r.matches("How do I password reset my account?"));
        assert!(!r.matches("How do I reset my account?"));
    }

    #[test]
    fn test_word_boundaries_respected() {
        let r = rule(&["reset"], "R");
        // "resetting" contains "reset" as a substring but not as a word.
        assert!(!r.matches("my character keeps resetting"));
        assert!(r.matches("please RESET it"));
    }

    #[test]
    fn test_eighty_percent_with_minimum_two() {
        // 4 of 5 triggers = 80%, and >= 2 matched.
        let r = rule(&["honey", "conversion", "character", "reset", "save"], "R");
        assert!(r.matches("honey conversion reset my character"));
        // 1 of 1 is handled by the all-match branch; 1 of 2 (50%) is not enough.
        let r2 = rule(&["honey", "conversion"], "R");
        assert!(!r2.matches("honey is great"));
    }

    #[test]
    fn test_zero_trigger_rule_never_matches() {
        let r = rule(&[], "R");
        assert!(!r.matches("anything at all"));
    }

    #[test]
    fn test_first_match_wins() {
        let store = KnowledgeStore::new();
        store.replace_rules(vec![
            rule(&["crash"], "first"),
            AutoResponseRule {
                id: "r2".to_string(),
                name: "second".to_string(),
                triggers: vec!["crash".to_string()],
                response: "second".to_string(),
            },
        ]);
        assert_eq!(store.find_auto_response("it crash on boot"), Some("first".to_string()));
        assert_eq!(store.find_auto_response("all good"), None);
    }

    #[test]
    fn test_store_truncates_content() {
        let store = KnowledgeStore::new();
        store.replace_entries(vec![KnowledgeEntry {
            id: "k1".to_string(),
            title: "t".to_string(),
            content: "x".repeat(2000),
            keywords: vec![],
        }]);
        let entry = store.get("k1").unwrap();
        assert_eq!(entry.content.chars().count(), MEMORY_CONTENT_LIMIT);
        assert!(store.contains("k1"));
        assert!(!store.contains("k2"));
    }

    #[test]
    fn test_replace_entries_is_wholesale() {
        let store = KnowledgeStore::new();
        store.replace_entries(vec![KnowledgeEntry {
            id: "old".to_string(),
            title: "t".to_string(),
            content: String::new(),
            keywords: vec![],
        }]);
        store.replace_entries(vec![KnowledgeEntry {
            id: "new".to_string(),
            title: "t".to_string(),
            content: String::new(),
            keywords: vec![],
        }]);
        assert!(!store.contains("old"));
        assert!(store.contains("new"));
        assert_eq!(store.entry_count(), 1);
    }
}
