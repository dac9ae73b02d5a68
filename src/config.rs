use anyhow::Result;
use std::env;

/// Placeholder values that mean "dashboard sync disabled".
const PLACEHOLDER_MARKERS: &[&str] = &["your-dashboard", "example.com", "changeme"];

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub guild_id: u64,
    pub forum_channel_id: u64,
    pub groq_api_keys: Vec<String>,
    pub data_api_url: Option<String>,
    pub pinecone: Option<PineconeConfig>,
    pub enable_embeddings: bool,
    pub force_keyword_search: bool,
    pub skip_embedding_bootstrap: bool,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct PineconeConfig {
    pub api_key: String,
    pub index_name: String,
    pub environment: String,
}

impl PineconeConfig {
    /// Data-plane host for the configured index.
    pub fn index_host(&self) -> String {
        format!(
            "https://{}.svc.{}.pinecone.io",
            self.index_name, self.environment
        )
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let discord_token = env::var("DISCORD_BOT_TOKEN")
            .map_err(|_| anyhow::anyhow!("DISCORD_BOT_TOKEN environment variable not set"))?;

        let guild_id = env::var("DISCORD_GUILD_ID")
            .map_err(|_| anyhow::anyhow!("DISCORD_GUILD_ID environment variable not set"))?
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("DISCORD_GUILD_ID is not a valid snowflake"))?;

        let forum_channel_id = env::var("SUPPORT_FORUM_CHANNEL_ID")
            .map_err(|_| anyhow::anyhow!("SUPPORT_FORUM_CHANNEL_ID environment variable not set"))?
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("SUPPORT_FORUM_CHANNEL_ID is not a valid snowflake"))?;
        if forum_channel_id == 0 {
            anyhow::bail!("SUPPORT_FORUM_CHANNEL_ID must be a non-zero channel id");
        }

        let groq_api_keys = load_groq_keys();
        if groq_api_keys.is_empty() {
            anyhow::bail!(
                "no LLM credentials configured: set GROQ_API_KEY (and optionally GROQ_API_KEY_2..20)"
            );
        }

        let data_api_url = env::var("DATA_API_URL").ok().filter(|url| {
            let lowered = url.to_lowercase();
            !lowered.is_empty() && !PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m))
        });

        let pinecone = match (
            env::var("PINECONE_API_KEY").ok(),
            env::var("PINECONE_INDEX_NAME").ok(),
            env::var("PINECONE_ENVIRONMENT").ok(),
        ) {
            (Some(api_key), Some(index_name), Some(environment))
                if !api_key.is_empty() && !index_name.is_empty() =>
            {
                Some(PineconeConfig {
                    api_key,
                    index_name,
                    environment,
                })
            }
            _ => None,
        };

        Ok(Config {
            discord_token,
            guild_id,
            forum_channel_id,
            groq_api_keys,
            data_api_url,
            pinecone,
            enable_embeddings: env_flag("ENABLE_EMBEDDINGS"),
            force_keyword_search: env_flag("FORCE_KEYWORD_SEARCH"),
            skip_embedding_bootstrap: env_flag("SKIP_EMBEDDING_BOOTSTRAP"),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// GROQ_API_KEY plus GROQ_API_KEY_2 through GROQ_API_KEY_20, in order.
fn load_groq_keys() -> Vec<String> {
    let mut keys = Vec::new();
    if let Ok(key) = env::var("GROQ_API_KEY") {
        if !key.trim().is_empty() {
            keys.push(key);
        }
    }
    for n in 2..=20 {
        if let Ok(key) = env::var(format!("GROQ_API_KEY_{}", n)) {
            if !key.trim().is_empty() {
                keys.push(key);
            }
        }
    }
    keys
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| {
            let v = v.trim().to_lowercase();
            v == "1" || v == "true" || v == "yes" || v == "on"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinecone_index_host() {
        let cfg = PineconeConfig {
            api_key: "k".to_string(),
            index_name: "support-kb".to_string(),
            environment: "us-east-1-aws".to_string(),
        };
        assert_eq!(
            cfg.index_host(),
            "https://support-kb.svc.us-east-1-aws.pinecone.io"
        );
    }

    #[test]
    fn test_env_flag_parsing() {
        env::set_var("TRIAGE_TEST_FLAG_ON", "true");
        env::set_var("TRIAGE_TEST_FLAG_OFF", "0");
        assert!(env_flag("TRIAGE_TEST_FLAG_ON"));
        assert!(!env_flag("TRIAGE_TEST_FLAG_OFF"));
        assert!(!env_flag("TRIAGE_TEST_FLAG_UNSET"));
        env::remove_var("TRIAGE_TEST_FLAG_ON");
        env::remove_var("TRIAGE_TEST_FLAG_OFF");
    }

    #[test]
    fn test_config_missing_required() {
        env::remove_var("DISCORD_BOT_TOKEN");
        let result = Config::from_env();
        assert!(result.is_err());
    }
}
