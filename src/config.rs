#![forbid(unsafe_code)]

//! Runtime settings for the backend.
//!
//! Values are resolved with the precedence CLI override > process env >
//! `.env` file > built-in default, so a deployment can keep its secrets in a
//! file while still overriding single keys from the service manager.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_WWW_ROOT: &str = "www";
pub const DEFAULT_CATALOG_API_URL: &str = "https://www.googleapis.com/youtube/v3";
pub const DEFAULT_CATALOG_MAX_RESULTS: u32 = 50;
pub const DEFAULT_CONVERSION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;

/// Controls how much detail internal errors expose to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" | "local" => Some(Self::Development),
            "prod" | "production" => Some(Self::Production),
            _ => None,
        }
    }

    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Redis,
    Memory,
    None,
}

impl CacheBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Some(Self::Redis),
            "memory" | "in-memory" => Some(Self::Memory),
            "none" | "noop" | "off" => Some(Self::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub channel_id: Option<String>,
    pub max_results: u32,
    pub timeout: Duration,
}

impl CatalogSettings {
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.channel_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ConverterSettings {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub api_host: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub www_root: PathBuf,
    pub data_root: Option<PathBuf>,
    pub environment: Environment,
    pub catalog: CatalogSettings,
    pub converter: ConverterSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub www_root: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: RuntimeOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    build_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<Settings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("MIXDECK_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("MIXDECK_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let www_root = overrides
        .www_root
        .or_else(|| lookup("WWW_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let data_root = overrides
        .data_root
        .or_else(|| lookup("DATA_ROOT").map(PathBuf::from));

    let environment = match lookup("APP_ENV") {
        Some(raw) => match Environment::parse(&raw) {
            Some(environment) => environment,
            None => bail!("APP_ENV must be `development` or `production`, got `{raw}`"),
        },
        None => Environment::Production,
    };

    let http_timeout = parse_secs(lookup("HTTP_TIMEOUT_SECS"), DEFAULT_HTTP_TIMEOUT_SECS);
    let catalog = CatalogSettings {
        api_url: lookup("CATALOG_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_CATALOG_API_URL.to_string()),
        api_key: lookup("CATALOG_API_KEY"),
        channel_id: lookup("CHANNEL_ID"),
        max_results: lookup("CATALOG_MAX_RESULTS")
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| (1..=50).contains(value))
            .unwrap_or(DEFAULT_CATALOG_MAX_RESULTS),
        timeout: http_timeout,
    };

    let converter = ConverterSettings {
        api_url: lookup("CONVERTER_API_URL").map(|url| url.trim_end_matches('/').to_string()),
        api_key: lookup("CONVERTER_API_KEY"),
        api_host: lookup("CONVERTER_API_HOST"),
        timeout: parse_secs(
            lookup("CONVERSION_TIMEOUT_SECS"),
            DEFAULT_CONVERSION_TIMEOUT_SECS,
        ),
    };

    let redis_url = lookup("REDIS_URL");
    let backend = match lookup("CACHE_BACKEND") {
        Some(raw) => CacheBackend::parse(&raw)
            .with_context(|| format!("unknown CACHE_BACKEND `{raw}`"))?,
        None if redis_url.is_some() => CacheBackend::Redis,
        None => CacheBackend::None,
    };
    if backend == CacheBackend::Redis && redis_url.is_none() {
        bail!("CACHE_BACKEND=redis requires REDIS_URL");
    }

    Ok(Settings {
        host,
        port,
        www_root,
        data_root,
        environment,
        catalog,
        converter,
        cache: CacheSettings { backend, redis_url },
    })
}

fn parse_secs(raw: Option<String>, default: u64) -> Duration {
    let secs = raw
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
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
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Parses a dotenv-style file. Missing files yield an empty map.
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

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> Settings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_settings(&vars, |_| None).unwrap()
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let settings = settings_from("");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.www_root, PathBuf::from(DEFAULT_WWW_ROOT));
        assert!(settings.data_root.is_none());
        assert_eq!(settings.environment, Environment::Production);
        assert_eq!(settings.catalog.api_url, DEFAULT_CATALOG_API_URL);
        assert!(!settings.catalog.is_configured());
        assert_eq!(
            settings.converter.timeout,
            Duration::from_secs(DEFAULT_CONVERSION_TIMEOUT_SECS)
        );
        assert_eq!(settings.cache.backend, CacheBackend::None);
    }

    #[test]
    fn redis_url_selects_redis_backend() {
        let settings = settings_from("REDIS_URL=\"redis://127.0.0.1:6379\"\n");
        assert_eq!(settings.cache.backend, CacheBackend::Redis);
        assert_eq!(
            settings.cache.redis_url.as_deref(),
            Some("redis://127.0.0.1:6379")
        );
    }

    #[test]
    fn explicit_cache_backend_wins_over_redis_url() {
        let settings =
            settings_from("REDIS_URL=\"redis://127.0.0.1:6379\"\nCACHE_BACKEND=memory\n");
        assert_eq!(settings.cache.backend, CacheBackend::Memory);
    }

    #[test]
    fn redis_backend_without_url_is_rejected() {
        let vars = read_env_file(make_config("CACHE_BACKEND=redis\n").path()).unwrap();
        let err = build_settings(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("REDIS_URL"));
    }

    #[test]
    fn unknown_cache_backend_is_rejected() {
        let vars = read_env_file(make_config("CACHE_BACKEND=memcached\n").path()).unwrap();
        assert!(build_settings(&vars, |_| None).is_err());
    }

    #[test]
    fn catalog_and_converter_settings_are_read() {
        let settings = settings_from(
            "CHANNEL_ID=UC123\nCATALOG_API_KEY=key\nCATALOG_API_URL=http://catalog.test/v3/\n\
             CONVERTER_API_URL=http://convert.test/\nCONVERSION_TIMEOUT_SECS=5\n\
             CATALOG_MAX_RESULTS=20\nAPP_ENV=development\n",
        );
        assert!(settings.catalog.is_configured());
        assert_eq!(settings.catalog.api_url, "http://catalog.test/v3");
        assert_eq!(settings.catalog.max_results, 20);
        assert_eq!(
            settings.converter.api_url.as_deref(),
            Some("http://convert.test")
        );
        assert_eq!(settings.converter.timeout, Duration::from_secs(5));
        assert!(settings.environment.is_development());
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let settings = settings_from(
            "MIXDECK_PORT=nope\nCONVERSION_TIMEOUT_SECS=0\nCATALOG_MAX_RESULTS=500\n",
        );
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(
            settings.converter.timeout,
            Duration::from_secs(DEFAULT_CONVERSION_TIMEOUT_SECS)
        );
        assert_eq!(settings.catalog.max_results, DEFAULT_CATALOG_MAX_RESULTS);
    }

    #[test]
    fn unknown_environment_is_rejected() {
        let vars = read_env_file(make_config("APP_ENV=staging\n").path()).unwrap();
        let err = build_settings(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("APP_ENV"));
    }

    #[test]
    fn env_takes_precedence_over_file() {
        let vars = read_env_file(make_config("CHANNEL_ID=\"from-file\"\n").path()).unwrap();
        let settings = build_settings(&vars, |key| {
            (key == "CHANNEL_ID").then(|| "from-env".to_string())
        })
        .unwrap();
        assert_eq!(settings.catalog.channel_id.as_deref(), Some("from-env"));
    }

    #[test]
    fn overrides_take_precedence_over_env_and_file() {
        let mut vars = HashMap::new();
        vars.insert("WWW_ROOT".to_string(), "/file-www".to_string());
        vars.insert("MIXDECK_HOST".to_string(), "file-host".to_string());
        vars.insert("MIXDECK_PORT".to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            www_root: Some(PathBuf::from("/override-www")),
            data_root: None,
            port: Some(9000),
            host: Some("   ".into()),
            env_path: None,
        };
        let settings = build_settings_with_overrides(
            &vars,
            |key| (key == "DATA_ROOT").then(|| "/env-data".to_string()),
            overrides,
        )
        .unwrap();

        assert_eq!(settings.www_root, PathBuf::from("/override-www"));
        assert_eq!(settings.data_root, Some(PathBuf::from("/env-data")));
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.host, "file-host");
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export CHANNEL_ID="UCabc"
            WWW_ROOT='/www'
            MIXDECK_HOST =  "0.0.0.0"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("CHANNEL_ID").unwrap(), "UCabc");
        assert_eq!(vars.get("WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("MIXDECK_HOST").unwrap(), "0.0.0.0");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }
}
