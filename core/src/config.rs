use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_SIGN_IN_URL: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:signInWithPassword";
pub const DEFAULT_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1/token";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_base_url: Url,
    pub identity: IdentitySettings,
    pub credential_cache: Option<PathBuf>,
    pub stream: StreamSettings,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub api_key: String,
    pub sign_in_url: String,
    pub token_url: String,
    pub email: Option<String>,
    pub password: Option<String>,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            sign_in_url: DEFAULT_SIGN_IN_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            email: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub require_terminal_frame: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            require_terminal_frame: true,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Finchat not configured: missing `{0}` in finchat.yaml.")]
    Missing(&'static str),
    #[error("Finchat configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Missing(field) => {
                format!("Finchat not configured: set `{field}` in finchat.yaml or the environment.")
            }
            Self::Invalid(detail) => format!("Finchat not configured: {detail}. Update finchat.yaml."),
        }
    }
}

impl ClientSettings {
    /// Reads `finchat.yaml` if present and applies `FINCHAT_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let raw = match locate_config_file() {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|err| {
                    ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
                })?;
                parse_config(&contents)?
            }
            None => RawConfig::default(),
        };
        resolve_settings(raw, |key| std::env::var(key).ok())
    }
}

fn parse_config(contents: &str) -> Result<RawConfig, ConfigError> {
    serde_yaml::from_str(contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid finchat.yaml: {err}")))
}

fn resolve_settings(
    raw: RawConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings, ConfigError> {
    let api = raw.api.unwrap_or_default();
    let identity = raw.identity.unwrap_or_default();
    let stream = raw.stream.unwrap_or_default();

    let base = env("FINCHAT_API_URL")
        .or(api.base_url)
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let api_base_url = parse_url("api.base_url", &with_trailing_slash(&base))?;

    let api_key = env("FINCHAT_API_KEY")
        .or(identity.api_key)
        .map(|key| key.trim().to_string())
        .unwrap_or_default();
    if api_key.is_empty() {
        return Err(ConfigError::Missing("identity.api_key"));
    }

    let sign_in_url = match identity.sign_in_url {
        Some(value) => parse_url("identity.sign_in_url", &value)?.to_string(),
        None => DEFAULT_SIGN_IN_URL.to_string(),
    };
    let token_url = match identity.token_url {
        Some(value) => parse_url("identity.token_url", &value)?.to_string(),
        None => DEFAULT_TOKEN_URL.to_string(),
    };

    let request_timeout_secs = api
        .request_timeout_secs
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if request_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "api.request_timeout_secs must be greater than 0".to_string(),
        ));
    }

    Ok(ClientSettings {
        api_base_url,
        identity: IdentitySettings {
            api_key,
            sign_in_url,
            token_url,
            email: env("FINCHAT_EMAIL").or(identity.email),
            password: env("FINCHAT_PASSWORD").or(identity.password),
        },
        credential_cache: raw.credential_cache.map(PathBuf::from),
        stream: StreamSettings {
            require_terminal_frame: stream.require_terminal_frame.unwrap_or(true),
        },
        request_timeout: Duration::from_secs(request_timeout_secs),
    })
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim())
        .map_err(|err| ConfigError::Invalid(format!("{field} `{value}`: {err}")))
}

/// Base URLs must end in `/` so relative endpoint paths join beneath them.
fn with_trailing_slash(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn locate_config_file() -> Option<PathBuf> {
    finchat_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn finchat_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("finchat");
        paths.push(config_dir.join("finchat.yaml"));
        paths.push(config_dir.join("finchat.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".finchat").join("finchat.yaml"));
        paths.push(home_dir.join(".finchat").join("finchat.yml"));
    } else {
        paths.push(PathBuf::from("finchat.yaml"));
        paths.push(PathBuf::from("finchat.yml"));
    }
    paths
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    api: Option<ApiSection>,
    identity: Option<IdentitySection>,
    stream: Option<StreamSection>,
    credential_cache: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSection {
    base_url: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IdentitySection {
    api_key: Option<String>,
    sign_in_url: Option<String>,
    token_url: Option<String>,
    email: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamSection {
    require_terminal_frame: Option<bool>,
}
