use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{
    domain::{ChannelId, TopicId, UserId},
    errors::Error,
    Result,
};

/// A monitored channel spec as configured: `<channel_id>` or
/// `<channel_id>:<topic_id>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    pub channel_id: ChannelId,
    pub topic_id: Option<TopicId>,
}

/// Typed configuration, loaded from the environment (with `.env` support).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub admin_user_ids: Vec<UserId>,
    pub monitored_channels: Vec<ChannelSpec>,
    pub excluded_topics: Vec<TopicId>,

    // LLM provider (OpenAI-compatible)
    pub llm_provider: String,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,

    // Pipeline tuning
    pub startup_catchup_limit: usize,
    pub recovery_interval: Duration,
    pub quota_recheck_interval: Duration,
    pub alert_cooldown: Duration,
    /// A message stuck in `processing` longer than this is considered
    /// orphaned by a crash and re-queued.
    pub processing_stale_after: Duration,
    pub max_connection_retries: u32,
    pub archive_depth: usize,

    // Persistence
    pub snapshot_path: PathBuf,
    pub snapshot_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let monitored_channels = parse_channel_specs(&env_str("MONITORED_CHANNELS").unwrap_or_default())?;
        if monitored_channels.is_empty() {
            return Err(Error::Config(
                "MONITORED_CHANNELS environment variable is required".to_string(),
            ));
        }

        let admin_user_ids = parse_csv_i64(env_str("ADMIN_USER_IDS"))
            .into_iter()
            .map(UserId)
            .collect();
        let excluded_topics = parse_csv_i64(env_str("EXCLUDED_TOPICS"))
            .into_iter()
            .map(|v| TopicId(v as i32))
            .collect();

        let llm_provider = env_str("LLM_PROVIDER").unwrap_or_else(|| "openai".to_string());
        let llm_base_url =
            env_str("LLM_BASE_URL").unwrap_or_else(|| "https://api.openai.com".to_string());
        let llm_api_key = env_str("LLM_API_KEY")
            .or_else(|| env_str("OPENAI_API_KEY"))
            .and_then(non_empty);
        let llm_model = env_str("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());

        let startup_catchup_limit = env_usize("STARTUP_CATCHUP_LIMIT").unwrap_or(100);
        let recovery_interval = Duration::from_secs(env_u64("RECOVERY_INTERVAL_SECS").unwrap_or(300));
        let quota_recheck_interval =
            Duration::from_secs(env_u64("QUOTA_RECHECK_SECS").unwrap_or(900));
        let alert_cooldown = Duration::from_secs(env_u64("ALERT_COOLDOWN_SECS").unwrap_or(900));
        let processing_stale_after =
            Duration::from_secs(env_u64("PROCESSING_STALE_SECS").unwrap_or(300));
        let max_connection_retries = env_u32("MAX_CONNECTION_RETRIES").unwrap_or(3);
        let archive_depth = env_usize("ARCHIVE_DEPTH").unwrap_or(500);

        let snapshot_path = PathBuf::from(
            env_str("SNAPSHOT_PATH").unwrap_or_else(|| "/tmp/adwatch-store.json".to_string()),
        );
        let snapshot_interval =
            Duration::from_secs(env_u64("SNAPSHOT_INTERVAL_SECS").unwrap_or(60));

        Ok(Self {
            telegram_bot_token,
            admin_user_ids,
            monitored_channels,
            excluded_topics,
            llm_provider,
            llm_base_url,
            llm_api_key,
            llm_model,
            startup_catchup_limit,
            recovery_interval,
            quota_recheck_interval,
            alert_cooldown,
            processing_stale_after,
            max_connection_retries,
            archive_depth,
            snapshot_path,
            snapshot_interval,
        })
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut out: Vec<ChannelId> = self
            .monitored_channels
            .iter()
            .map(|s| s.channel_id)
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// Parse `MONITORED_CHANNELS`: comma-separated `id` or `id:topic` entries.
pub fn parse_channel_specs(raw: &str) -> Result<Vec<ChannelSpec>> {
    let mut out = Vec::new();
    for entry in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let (id_part, topic_part) = match entry.split_once(':') {
            Some((a, b)) => (a.trim(), Some(b.trim())),
            None => (entry, None),
        };
        let channel_id = id_part
            .parse::<i64>()
            .map(ChannelId)
            .map_err(|_| Error::Config(format!("invalid channel id: {id_part}")))?;
        let topic_id = match topic_part {
            Some(t) => Some(
                t.parse::<i32>()
                    .map(TopicId)
                    .map_err(|_| Error::Config(format!("invalid topic id: {t}")))?,
            ),
            None => None,
        };
        out.push(ChannelSpec {
            channel_id,
            topic_id,
        });
    }
    Ok(out)
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_specs_parse_plain_and_topic_scoped() {
        let specs = parse_channel_specs(" -1001234:42, -1005678 ,").unwrap();
        assert_eq!(
            specs,
            vec![
                ChannelSpec {
                    channel_id: ChannelId(-1001234),
                    topic_id: Some(TopicId(42)),
                },
                ChannelSpec {
                    channel_id: ChannelId(-1005678),
                    topic_id: None,
                },
            ]
        );
    }

    #[test]
    fn channel_specs_reject_garbage() {
        assert!(parse_channel_specs("abc").is_err());
        assert!(parse_channel_specs("-100:xyz").is_err());
    }

    #[test]
    fn empty_spec_list_is_ok_here() {
        // Emptiness is enforced in Config::load, not in the parser.
        assert!(parse_channel_specs("").unwrap().is_empty());
    }
}
