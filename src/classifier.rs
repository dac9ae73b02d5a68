use dashmap::DashMap;
use log::debug;
use regex::Regex;

/// Tag categories a thread can be filed under. Order matters: the first
/// pattern that matches wins, and "other" is the fallthrough.
pub const CATEGORIES: &[&str] = &[
    "bug",
    "performance",
    "installation",
    "display",
    "connection",
    "account",
    "feature-request",
    "question",
    "automation",
    "other",
];

const MAX_EXAMPLES_PER_CATEGORY: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct CategoryTally {
    pub count: u64,
    pub examples: Vec<String>,
}

/// Keyword-based issue classifier. Patterns are compiled once at startup;
/// classification itself is a cheap linear scan.
pub struct IssueClassifier {
    patterns: Vec<(&'static str, Regex)>,
    tally: DashMap<String, CategoryTally>,
}

impl IssueClassifier {
    pub fn new() -> Self {
        let table: &[(&str, &str)] = &[
            ("bug", r"(?i)\b(bug|broken|glitch|crash(es|ed|ing)?|error|exception|freez(e|es|ing)|stuck)\b"),
            ("performance", r"(?i)\b(slow|lag(gy|ging)?|fps|memory|cpu|performance|stutter(s|ing)?)\b"),
            ("installation", r"(?i)\b(install(ation|ing|ed)?|setup|download(ing|ed)?|update(s|d)?|version|upgrade)\b"),
            ("display", r"(?i)\b(display|screen|render(ing|ed)?|graphics|resolution|ui|overlay|black screen|flicker(s|ing)?)\b"),
            ("connection", r"(?i)\b(connect(ion|ing|ed)?|disconnect(s|ed|ing)?|network|timeout|offline|server|latency)\b"),
            ("account", r"(?i)\b(account|login|log in|sign ?in|password|auth(entication)?|license|subscription|banned)\b"),
            ("feature-request", r"(?i)\b(feature|request|suggest(ion)?|would be (nice|great)|could you add|please add)\b"),
            ("question", r"(?i)\b(how (do|can|to)|what (is|are|does)|where (is|do|can)|why (is|does)|possible to)\b"),
            ("automation", r"(?i)\b(macro(s)?|script(s|ing)?|automat(e|ion|ic)|bot|schedul(e|er|ing)|trigger(s)?)\b"),
        ];
        let patterns = table
            .iter()
            .map(|(name, pattern)| (*name, Regex::new(pattern).unwrap()))
            .collect();
        IssueClassifier {
            patterns,
            tally: DashMap::new(),
        }
    }

    /// Classify the opening post. Title and body are weighed together;
    /// anything that matches nothing is "other".
    pub fn classify(&self, title: &str, body: &str) -> &'static str {
        let text = format!("{} {}", title, body);
        for (category, pattern) in &self.patterns {
            if pattern.is_match(&text) {
                debug!("classified '{}' as {}", title, category);
                return category;
            }
        }
        "other"
    }

    /// Classify and record for the daily summary in one step.
    pub fn classify_and_record(&self, title: &str, body: &str) -> &'static str {
        let category = self.classify(title, body);
        self.record(category, title);
        category
    }

    pub fn record(&self, category: &str, title: &str) {
        let mut entry = self.tally.entry(category.to_string()).or_default();
        entry.count += 1;
        if entry.examples.len() < MAX_EXAMPLES_PER_CATEGORY {
            entry.examples.push(title.to_string());
        }
    }

    /// Drain the tally for the daily summary. Categories come back in the
    /// canonical order, empty ones omitted.
    pub fn flush_tally(&self) -> Vec<(String, CategoryTally)> {
        let mut out = Vec::new();
        for category in CATEGORIES {
            if let Some((name, tally)) = self.tally.remove(*category) {
                out.push((name, tally));
            }
        }
        out
    }

    pub fn tallied_total(&self) -> u64 {
        self.tally.iter().map(|e| e.count).sum()
    }
}

impl Default for IssueClassifier {
    fn default() -> Self {
        Self::new()
    }
}
