#![forbid(unsafe_code)]

//! Runtime configuration for the backend.
//!
//! Values resolve in order: explicit overrides (CLI) → process environment →
//! `.env` file next to the binary. Engine credentials are optional on
//! purpose: a missing credential disables that engine instead of failing at
//! startup (the dispatcher reports it per-request).

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Optional static frontend root. When unset the server is API-only.
    pub www_root: Option<PathBuf>,
    /// Engine A (BibiGPT) credential.
    pub bibigpt_token: Option<String>,
    /// Engine B (SiliconFlow) credential.
    pub siliconflow_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub www_root: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn load_settings(overrides: Overrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings(&file_vars, env_var_string, overrides)
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: Overrides,
) -> Result<Settings> {
    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup_value("TUBETUTOR_HOST", file_vars, &env_lookup))
        .and_then(non_blank)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBETUTOR_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let www_root = overrides
        .www_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup))
        .and_then(non_blank)
        .map(PathBuf::from);
    let bibigpt_token =
        lookup_value("BIBIGPT_API_TOKEN", file_vars, &env_lookup).and_then(non_blank);
    let siliconflow_key =
        lookup_value("SILICONFLOW_API_KEY", file_vars, &env_lookup).and_then(non_blank);

    Ok(Settings {
        host,
        port,
        www_root,
        bibigpt_token,
        siliconflow_key,
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses `KEY=value` lines, tolerating `export` prefixes, quoting, comments
/// and malformed lines. A missing file is not an error.
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
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_env(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> Settings {
        let cfg = make_env(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_settings(&vars, |_| None, Overrides::default()).unwrap()
    }

    #[test]
    fn defaults_apply_when_file_is_empty() {
        let settings = settings_from("");
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert!(settings.www_root.is_none());
        assert!(settings.bibigpt_token.is_none());
        assert!(settings.siliconflow_key.is_none());
    }

    #[test]
    fn reads_host_port_and_credentials() {
        let settings = settings_from(
            "TUBETUTOR_HOST=\"0.0.0.0\"\nTUBETUTOR_PORT=\"4242\"\nBIBIGPT_API_TOKEN=\"tok\"\nSILICONFLOW_API_KEY=\"sk-x\"\n",
        );
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.port, 4242);
        assert_eq!(settings.bibigpt_token.as_deref(), Some("tok"));
        assert_eq!(settings.siliconflow_key.as_deref(), Some("sk-x"));
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_env("TUBETUTOR_PORT=\"7000\"\n").path()).unwrap();
        let settings = build_settings(
            &vars,
            |key| {
                if key == "TUBETUTOR_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            Overrides::default(),
        )
        .unwrap();
        assert_eq!(settings.port, 8000);
    }

    #[test]
    fn overrides_win_over_env_and_file() {
        let vars = read_env_file(make_env("TUBETUTOR_PORT=\"7000\"\nWWW_ROOT=\"/file\"\n").path())
            .unwrap();
        let settings = build_settings(
            &vars,
            |key| {
                if key == "TUBETUTOR_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            Overrides {
                port: Some(9000),
                www_root: Some(PathBuf::from("/override")),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.www_root, Some(PathBuf::from("/override")));
    }

    #[test]
    fn blank_values_count_as_missing() {
        let settings = settings_from("BIBIGPT_API_TOKEN=\"   \"\nTUBETUTOR_HOST=\"\"\n");
        assert!(settings.bibigpt_token.is_none());
        assert_eq!(settings.host, DEFAULT_HOST);
    }

    #[test]
    fn invalid_port_falls_back_to_default() {
        let settings = settings_from("TUBETUTOR_PORT=\"nope\"\n");
        assert_eq!(settings.port, DEFAULT_PORT);
    }

    #[test]
    fn read_env_file_handles_export_quotes_and_comments() {
        let cfg = make_env(
            r#"
            export BIBIGPT_API_TOKEN="abc"
            SILICONFLOW_API_KEY='sk-1'
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("BIBIGPT_API_TOKEN").unwrap(), "abc");
        assert_eq!(vars.get("SILICONFLOW_API_KEY").unwrap(), "sk-1");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }
}
