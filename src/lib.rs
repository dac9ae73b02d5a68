//! Support-forum triage bot: answers new forum threads from a knowledge
//! base, collects feedback, retries, and escalates to humans when needed.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod credentials;
pub mod dashboard;
pub mod embeddings;
pub mod engine;
pub mod feedback;
pub mod generator;
pub mod janitor;
pub mod knowledge;
pub mod leaderboard;
pub mod llm;
pub mod retrieval;
pub mod settings;
pub mod tags;
pub mod vector_index;
