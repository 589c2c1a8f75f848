#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_JOB_TTL_SECS: u64 = 3600;

/// How `POST /download/` answers once the job has been created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitMode {
    /// Respond right after the job is created; the fetch keeps running.
    #[default]
    Detach,
    /// Hold the response until the fetch finished or failed.
    Wait,
}

impl SubmitMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "detach" | "detached" | "async" | "background" => Some(Self::Detach),
            "wait" | "sync" | "blocking" => Some(Self::Wait),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub media_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_bin: PathBuf,
    /// `None` leaves the fetch unbounded.
    pub fetch_timeout: Option<Duration>,
    /// `None` disables eviction of abandoned jobs.
    pub job_ttl: Option<Duration>,
    pub submit_mode: SubmitMode,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let media_root = overrides
        .media_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("MEDIA_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set"))?;
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("MEDIAFETCH_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("MEDIAFETCH_HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let ytdlp_bin = lookup_value("MEDIAFETCH_YTDLP_BIN", file_vars, &env_lookup)
        .unwrap_or_else(|| DEFAULT_YTDLP_BIN.to_string());
    let fetch_timeout = lookup_secs("MEDIAFETCH_FETCH_TIMEOUT_SECS", file_vars, &env_lookup)
        .unwrap_or(0);
    let job_ttl = lookup_secs("MEDIAFETCH_JOB_TTL_SECS", file_vars, &env_lookup)
        .unwrap_or(DEFAULT_JOB_TTL_SECS);
    let submit_mode = lookup_value("MEDIAFETCH_SUBMIT_MODE", file_vars, &env_lookup)
        .as_deref()
        .and_then(SubmitMode::parse)
        .unwrap_or_default();

    Ok(RuntimeSettings {
        media_root: PathBuf::from(media_root),
        host,
        port,
        ytdlp_bin: PathBuf::from(ytdlp_bin),
        fetch_timeout: non_zero_secs(fetch_timeout),
        job_ttl: non_zero_secs(job_ttl),
        submit_mode,
    })
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn lookup_secs(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<u64> {
    lookup_value(key, file_vars, env_lookup).and_then(|value| value.parse::<u64>().ok())
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a dotenv-style file. A missing file is treated as empty.
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None).unwrap()
    }

    #[test]
    fn defaults_fill_everything_but_media_root() {
        let settings = settings_from("MEDIA_ROOT=\"/staging\"\n");
        assert_eq!(settings.media_root, PathBuf::from("/staging"));
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.ytdlp_bin, PathBuf::from(DEFAULT_YTDLP_BIN));
        assert_eq!(settings.fetch_timeout, None);
        assert_eq!(
            settings.job_ttl,
            Some(Duration::from_secs(DEFAULT_JOB_TTL_SECS))
        );
        assert_eq!(settings.submit_mode, SubmitMode::Detach);
    }

    #[test]
    fn missing_media_root_is_an_error() {
        let err = build_runtime_settings(&HashMap::new(), |_| None).unwrap_err();
        assert!(err.to_string().contains("MEDIA_ROOT"));
    }

    #[test]
    fn reads_every_key_from_file() {
        let settings = settings_from(
            "MEDIA_ROOT=/m\nMEDIAFETCH_PORT=9090\nMEDIAFETCH_HOST=0.0.0.0\n\
             MEDIAFETCH_YTDLP_BIN=/opt/yt-dlp\nMEDIAFETCH_FETCH_TIMEOUT_SECS=30\n\
             MEDIAFETCH_JOB_TTL_SECS=0\nMEDIAFETCH_SUBMIT_MODE=wait\n",
        );
        assert_eq!(settings.port, 9090);
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.ytdlp_bin, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(settings.fetch_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.job_ttl, None);
        assert_eq!(settings.submit_mode, SubmitMode::Wait);
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("MEDIA_ROOT=\"/file\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |key| {
            (key == "MEDIA_ROOT").then(|| "/env".to_string())
        })
        .unwrap();
        assert_eq!(settings.media_root, PathBuf::from("/env"));
    }

    #[test]
    fn overrides_win_over_env_and_file() {
        let mut vars = HashMap::new();
        vars.insert("MEDIA_ROOT".to_string(), "/file-media".to_string());
        vars.insert("MEDIAFETCH_HOST".to_string(), "file-host".to_string());
        vars.insert("MEDIAFETCH_PORT".to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            media_root: Some(PathBuf::from("/override-media")),
            port: Some(9000),
            host: Some("override-host".into()),
            env_path: None,
        };
        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| (key == "MEDIAFETCH_PORT").then(|| "8000".to_string()),
            overrides,
        )
        .unwrap();

        assert_eq!(settings.media_root, PathBuf::from("/override-media"));
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.host, "override-host");
    }

    #[test]
    fn blank_host_override_falls_back() {
        let settings = build_runtime_settings_with_overrides(
            &HashMap::from([("MEDIA_ROOT".to_string(), "/m".to_string())]),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.host, DEFAULT_HOST);
    }

    #[test]
    fn invalid_numbers_and_modes_use_defaults() {
        let settings = settings_from(
            "MEDIA_ROOT=/m\nMEDIAFETCH_PORT=nope\nMEDIAFETCH_JOB_TTL_SECS=soon\n\
             MEDIAFETCH_SUBMIT_MODE=sometimes\n",
        );
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(
            settings.job_ttl,
            Some(Duration::from_secs(DEFAULT_JOB_TTL_SECS))
        );
        assert_eq!(settings.submit_mode, SubmitMode::Detach);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export MEDIA_ROOT="/media"
            MEDIAFETCH_HOST =  '0.0.0.0'
            MEDIAFETCH_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("MEDIA_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("MEDIAFETCH_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("MEDIAFETCH_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn submit_mode_parses_aliases() {
        assert_eq!(SubmitMode::parse(" WAIT "), Some(SubmitMode::Wait));
        assert_eq!(SubmitMode::parse("async"), Some(SubmitMode::Detach));
        assert_eq!(SubmitMode::parse("later"), None);
    }
}
