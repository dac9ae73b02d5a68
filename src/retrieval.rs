use anyhow::Result;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;

use crate::embeddings::EmbeddingClient;
use crate::knowledge::{word_set, KnowledgeEntry, KnowledgeStore};
use crate::vector_index::VectorIndex;

/// Fixed at startup for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Vector,
    Keyword,
    /// Cost-mitigation switch: every lookup returns nothing.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: KnowledgeEntry,
    pub score: f64,
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "do", "does", "for", "from",
    "has", "have", "how", "i", "in", "is", "it", "its", "me", "my", "of", "on", "or", "so",
    "that", "the", "their", "them", "then", "there", "this", "to", "was", "we", "what", "when",
    "where", "which", "who", "why", "will", "with", "you", "your",
];

pub struct Retriever {
    mode: RetrievalMode,
    store: Arc<KnowledgeStore>,
    embeddings: Option<Arc<EmbeddingClient>>,
    index: Option<Arc<VectorIndex>>,
}

impl Retriever {
    pub fn new(
        mode: RetrievalMode,
        store: Arc<KnowledgeStore>,
        embeddings: Option<Arc<EmbeddingClient>>,
        index: Option<Arc<VectorIndex>>,
    ) -> Self {
        if mode == RetrievalMode::Vector && (embeddings.is_none() || index.is_none()) {
            warn!("vector mode requested without an index; falling back to keyword search");
            return Retriever {
                mode: RetrievalMode::Keyword,
                store,
                embeddings: None,
                index: None,
            };
        }
        Retriever {
            mode,
            store,
            embeddings,
            index,
        }
    }

    pub fn mode(&self) -> RetrievalMode {
        self.mode
    }

    /// First matching auto-response rule, before any LLM involvement.
    pub fn find_auto_response(&self, query: &str) -> Option<String> {
        self.store.find_auto_response(query)
    }

    /// Up to `k` knowledge entries by descending similarity. Vector-index
    /// failures degrade to keyword search rather than propagating.
    pub async fn find_relevant_entries(
        &self,
        query: &str,
        k: usize,
        min_score: f64,
    ) -> Vec<ScoredEntry> {
        match self.mode {
            RetrievalMode::Disabled => Vec::new(),
            RetrievalMode::Keyword => self.keyword_search(query, k),
            RetrievalMode::Vector => match self.vector_search(query, k, min_score).await {
                Ok(results) => results,
                Err(e) => {
                    warn!("vector retrieval failed ({}); using keyword search", e);
                    self.keyword_search(query, k)
                }
            },
        }
    }

    async fn vector_search(&self, query: &str, k: usize, min_score: f64) -> Result<Vec<ScoredEntry>> {
        let embeddings = self
            .embeddings
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("embedding client not configured"))?;
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("vector index not configured"))?;

        let vector = embeddings.embed_query(query).await?;
        let matches = index.query(&vector, k).await?;

        let mut scored = Vec::new();
        let mut stale = Vec::new();
        for m in matches {
            match self.store.get(&m.id) {
                Some(memory) => {
                    // Prefer working-memory metadata, prefer index content.
                    let content = if m.content.is_empty() {
                        memory.content.clone()
                    } else {
                        m.content
                    };
                    scored.push(ScoredEntry {
                        entry: KnowledgeEntry {
                            id: memory.id,
                            title: memory.title,
                            content,
                            keywords: memory.keywords,
                        },
                        score: m.score,
                    });
                }
                None => stale.push(m.id),
            }
        }

        if !stale.is_empty() {
            warn!("purging {} stale vector id(s)", stale.len());
            if let Err(e) = index.delete(&stale).await {
                warn!("stale vector purge failed: {}", e);
            }
        }

        let results = apply_threshold(scored, k, min_score);
        info!("vector retrieval produced {} entr(ies)", results.len());
        Ok(results)
    }

    fn keyword_search(&self, query: &str, k: usize) -> Vec<ScoredEntry> {
        let terms = prepare_terms(query);
        if terms.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<ScoredEntry> = self
            .store
            .all_entries()
            .into_iter()
            .filter_map(|entry| {
                let score = keyword_score(&entry, &terms);
                (score > 0).then_some(ScoredEntry {
                    entry,
                    score: score as f64,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

/// Sort descending, drop entries below the threshold, but never return
/// nothing when at least one candidate exists.
fn apply_threshold(mut scored: Vec<ScoredEntry>, k: usize, min_score: f64) -> Vec<ScoredEntry> {
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    if scored.is_empty() {
        return scored;
    }
    let passing: Vec<ScoredEntry> = scored
        .iter()
        .filter(|s| s.score >= min_score)
        .cloned()
        .take(k)
        .collect();
    if passing.is_empty() {
        return vec![scored.remove(0)];
    }
    passing
}

/// Stemmed, stopword-filtered query terms.
fn prepare_terms(text: &str) -> Vec<String> {
    word_set(text)
        .into_iter()
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .map(|w| stem(&w))
        .collect()
}

/// Light suffix stripping; enough to line up "resetting" with "reset".
fn stem(word: &str) -> String {
    for suffix in ["ting", "ing", "ed", "es", "s"] {
        if let Some(stripped) = word.strip_suffix(suffix) {
            if stripped.len() >= 3 {
                return stripped.to_string();
            }
        }
    }
    word.to_string()
}

/// +5 per query term found in the title, +3 in keywords, +1 in content.
fn keyword_score(entry: &KnowledgeEntry, terms: &[String]) -> u32 {
    let title: HashSet<String> = prepare_terms(&entry.title).into_iter().collect();
    let keywords: HashSet<String> = entry
        .keywords
        .iter()
        .flat_map(|kw| prepare_terms(kw))
        .collect();
    let content: HashSet<String> = prepare_terms(&entry.content).into_iter().collect();

    let mut score = 0;
    for term in terms {
        if title.contains(term) {
            score += 5;
        }
        if keywords.contains(term) {
            score += 3;
        }
        if content.contains(term) {
            score += 1;
        }
    }
    score
}
