#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    encoding::EncodingWaiter, orchestrator::ChannelTarget, pipeline::PipelineSettings,
    retry::RetryPolicy, source::DEFAULT_YTDLP_BIN, status::DEFAULT_STATUS_CAPACITY,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_STAGING_ROOT: &str = "./youtube_downloads";
pub const DEFAULT_CONFIG_PATH: &str = "tubemirror.toml";
pub const STATE_DB_FILE: &str = "sync-state.db";

/// Locations and secrets resolved from CLI overrides, the process
/// environment and the `.env` file, in that order.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub staging_root: PathBuf,
    pub state_db: PathBuf,
    pub config_path: PathBuf,
    pub ytdlp_bin: PathBuf,
    pub mediacms_url: Option<String>,
    pub mediacms_token: Option<String>,
    pub youtube_api_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub staging_root: Option<PathBuf>,
    pub state_db: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub mediacms_url: Option<String>,
    pub mediacms_token: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_paths(&file_vars, env_var_string, overrides))
}

fn build_runtime_paths(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimePaths {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let staging_root = overrides
        .staging_root
        .or_else(|| lookup("STAGING_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_ROOT));
    let state_db = overrides
        .state_db
        .or_else(|| lookup("STATE_DB").map(PathBuf::from))
        .unwrap_or_else(|| staging_root.join(STATE_DB_FILE));
    let config_path = overrides
        .config_path
        .or_else(|| lookup("TUBEMIRROR_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let ytdlp_bin = lookup("YTDLP_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    RuntimePaths {
        staging_root,
        state_db,
        config_path,
        ytdlp_bin,
        mediacms_url: non_blank(overrides.mediacms_url).or_else(|| lookup("MEDIACMS_URL")),
        mediacms_token: non_blank(overrides.mediacms_token).or_else(|| lookup("MEDIACMS_TOKEN")),
        youtube_api_key: lookup("YOUTUBE_API_KEY"),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Contents of `tubemirror.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorConfig {
    pub mediacms_url: Option<String>,
    pub mediacms_token: Option<String>,
    pub youtube_api_key: Option<String>,
    pub pipeline: PipelineConfig,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub download_workers: usize,
    pub upload_workers: usize,
    pub upload_queue_capacity: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub wait_for_encoding: bool,
    pub poll_interval_secs: u64,
    pub max_polls: u32,
    pub keep_files: bool,
    /// Pause after each upload, in seconds.
    pub upload_delay_secs: u64,
    /// Runs of `new` mode that may re-queue a failed item before it is left
    /// in the retry ledger for good.
    pub max_item_retries: u32,
    pub status_capacity: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_workers: 2,
            upload_workers: 1,
            upload_queue_capacity: 2,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            wait_for_encoding: true,
            poll_interval_secs: 30,
            max_polls: 240,
            keep_files: false,
            upload_delay_secs: 0,
            max_item_retries: 5,
            status_capacity: DEFAULT_STATUS_CAPACITY,
            shutdown_grace_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("download_workers", self.download_workers as u64),
            ("upload_workers", self.upload_workers as u64),
            ("upload_queue_capacity", self.upload_queue_capacity as u64),
            ("max_attempts", u64::from(self.max_attempts)),
            ("max_polls", u64::from(self.max_polls)),
            ("max_item_retries", u64::from(self.max_item_retries)),
            ("status_capacity", self.status_capacity as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                bail!("pipeline.{name} must be at least 1");
            }
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            bail!("pipeline.backoff_max_ms must not be smaller than backoff_base_ms");
        }
        Ok(())
    }

    pub fn to_settings(&self) -> PipelineSettings {
        PipelineSettings {
            download_workers: self.download_workers,
            upload_workers: self.upload_workers,
            upload_queue_capacity: self.upload_queue_capacity,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms),
            },
            wait_for_encoding: self.wait_for_encoding,
            encoding: EncodingWaiter::new(
                Duration::from_secs(self.poll_interval_secs),
                self.max_polls,
            ),
            keep_files: self.keep_files,
            upload_delay: Duration::from_secs(self.upload_delay_secs),
            max_item_retries: self.max_item_retries,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub mediacms_token: Option<String>,
}

pub fn load_mirror_config(path: &Path) -> Result<MirrorConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Reading channel config {}", path.display()))?;
    parse_mirror_config(&raw).with_context(|| format!("Parsing {}", path.display()))
}

pub fn parse_mirror_config(raw: &str) -> Result<MirrorConfig> {
    let config: MirrorConfig = toml::from_str(raw)?;
    config.pipeline.validate()?;
    Ok(config)
}

impl MirrorConfig {
    /// Channels to process, optionally narrowed to one name. A channel without
    /// its own token falls back to `global_token`.
    pub fn channel_targets(
        &self,
        global_token: Option<&str>,
        only: Option<&str>,
    ) -> Result<Vec<ChannelTarget>> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for channel in &self.channels {
            let name = channel.name.trim();
            if name.is_empty() {
                bail!("channel entries need a name");
            }
            if !seen.insert(name.to_string()) {
                bail!("channel {name} is configured twice");
            }
            if channel.url.trim().is_empty() {
                bail!("channel {name} has no url");
            }
            if only.is_some_and(|wanted| wanted != name) {
                continue;
            }
            let token = non_blank(channel.mediacms_token.clone())
                .or_else(|| global_token.map(str::to_string))
                .ok_or_else(|| anyhow!("channel {name} has no MediaCMS token"))?;
            targets.push(ChannelTarget {
                name: name.to_string(),
                url: channel.url.trim().to_string(),
                token,
            });
        }
        if let Some(wanted) = only
            && targets.is_empty()
        {
            bail!("no channel named {wanted} in the config");
        }
        if targets.is_empty() {
            bail!("no channels configured");
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn runtime_from(contents: &str) -> RuntimePaths {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_paths(&vars, |_| None, RuntimeOverrides::default())
    }

    #[test]
    fn runtime_paths_default_under_staging_root() {
        let runtime = runtime_from("");
        assert_eq!(runtime.staging_root, PathBuf::from(DEFAULT_STAGING_ROOT));
        assert_eq!(
            runtime.state_db,
            PathBuf::from(DEFAULT_STAGING_ROOT).join(STATE_DB_FILE)
        );
        assert_eq!(runtime.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(runtime.ytdlp_bin, PathBuf::from(DEFAULT_YTDLP_BIN));
        assert!(runtime.mediacms_token.is_none());
    }

    #[test]
    fn runtime_paths_read_env_file() {
        let runtime = runtime_from(
            "STAGING_ROOT=\"/srv/stage\"\nMEDIACMS_URL=\"https://media.example\"\nMEDIACMS_TOKEN='abc'\nYOUTUBE_API_KEY=key\n",
        );
        assert_eq!(runtime.staging_root, PathBuf::from("/srv/stage"));
        assert_eq!(runtime.state_db, PathBuf::from("/srv/stage/sync-state.db"));
        assert_eq!(runtime.mediacms_url.as_deref(), Some("https://media.example"));
        assert_eq!(runtime.mediacms_token.as_deref(), Some("abc"));
        assert_eq!(runtime.youtube_api_key.as_deref(), Some("key"));
    }

    #[test]
    fn runtime_paths_override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("STAGING_ROOT".to_string(), "/file-stage".to_string());
        vars.insert("STATE_DB".to_string(), "/file.db".to_string());
        vars.insert("MEDIACMS_TOKEN".to_string(), "file-token".to_string());

        let overrides = RuntimeOverrides {
            staging_root: Some(PathBuf::from("/override-stage")),
            mediacms_token: Some("cli-token".into()),
            ..RuntimeOverrides::default()
        };
        let runtime = build_runtime_paths(
            &vars,
            |key| (key == "STATE_DB").then(|| "/env.db".to_string()),
            overrides,
        );

        assert_eq!(runtime.staging_root, PathBuf::from("/override-stage"));
        assert_eq!(runtime.state_db, PathBuf::from("/env.db"));
        assert_eq!(runtime.mediacms_token.as_deref(), Some("cli-token"));
    }

    #[test]
    fn blank_overrides_fall_through() {
        let mut vars = HashMap::new();
        vars.insert("MEDIACMS_URL".to_string(), "https://file.example".to_string());
        let runtime = build_runtime_paths(
            &vars,
            |_| None,
            RuntimeOverrides {
                mediacms_url: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(runtime.mediacms_url.as_deref(), Some("https://file.example"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export STAGING_ROOT="/media"
            MEDIACMS_URL='https://m.example'
            MEDIACMS_TOKEN =  "t0k"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("STAGING_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("MEDIACMS_URL").unwrap(), "https://m.example");
        assert_eq!(vars.get("MEDIACMS_TOKEN").unwrap(), "t0k");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn mirror_config_parses_channels_and_pipeline() {
        let config = parse_mirror_config(
            r#"
            mediacms_url = "https://media.example"
            mediacms_token = "global"

            [pipeline]
            download_workers = 3
            upload_workers = 2
            wait_for_encoding = false

            [[channels]]
            name = "science"
            url = "https://www.youtube.com/channel/UCscience"

            [[channels]]
            name = "music"
            url = "https://www.youtube.com/channel/UCmusic"
            mediacms_token = "music-token"
            "#,
        )
        .unwrap();

        let settings = config.pipeline.to_settings();
        assert_eq!(settings.download_workers, 3);
        assert_eq!(settings.upload_workers, 2);
        assert_eq!(settings.upload_queue_capacity, 2);
        assert!(!settings.wait_for_encoding);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.encoding.max_polls, 240);
        assert_eq!(settings.upload_delay, Duration::ZERO);
        assert_eq!(settings.max_item_retries, 5);

        let targets = config
            .channel_targets(config.mediacms_token.as_deref(), None)
            .unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].token, "global");
        assert_eq!(targets[1].token, "music-token");
    }

    #[test]
    fn mirror_config_rejects_zero_workers_and_unknown_keys() {
        let err = parse_mirror_config("[pipeline]\nupload_workers = 0\n").unwrap_err();
        assert!(err.to_string().contains("upload_workers"));
        assert!(parse_mirror_config("surprise = true\n").is_err());
    }

    #[test]
    fn channel_targets_filter_and_require_tokens() {
        let config = parse_mirror_config(
            r#"
            [[channels]]
            name = "a"
            url = "https://www.youtube.com/channel/UCa"

            [[channels]]
            name = "b"
            url = "https://www.youtube.com/channel/UCb"
            mediacms_token = "tb"
            "#,
        )
        .unwrap();

        let only_b = config.channel_targets(None, Some("b")).unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].name, "b");

        let err = config.channel_targets(None, None).unwrap_err();
        assert!(err.to_string().contains("channel a has no MediaCMS token"));

        let err = config.channel_targets(Some("g"), Some("zzz")).unwrap_err();
        assert!(err.to_string().contains("no channel named zzz"));
    }

    #[test]
    fn load_mirror_config_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_mirror_config(&dir.path().join("absent.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("absent.toml"));
    }
}
