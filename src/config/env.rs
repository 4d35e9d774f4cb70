use std::env;
use std::str::FromStr;

/// Values read from the process environment
///
/// Every field is optional; defaults are applied during merge so that YAML
/// values can take priority over them.
#[derive(Debug, Default)]
pub(super) struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls_enabled: Option<bool>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    pub elevenlabs_api_key: Option<String>,
    pub elevenlabs_agent_id: Option<String>,
    pub elevenlabs_api_url: Option<String>,
    pub elevenlabs_ws_url: Option<String>,

    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_api_url: Option<String>,

    pub report_primary_url: Option<String>,
    pub report_backup_url: Option<String>,
    pub report_timeout_seconds: Option<u64>,
    pub error_log_path: Option<String>,

    pub convai_connect_timeout_seconds: Option<u64>,
    pub closing_grace_seconds: Option<u64>,
    pub pre_active_audio_policy: Option<String>,
    pub pre_active_audio_buffer_frames: Option<usize>,
    pub external_ref_key: Option<String>,
    pub shutdown_drain_seconds: Option<u64>,
}

impl EnvConfig {
    /// Read all recognised variables from the environment
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            host: var("HOST"),
            port: parse("PORT")?,
            tls_enabled: parse_bool("TLS_ENABLED")?,
            tls_cert_path: var("TLS_CERT_PATH"),
            tls_key_path: var("TLS_KEY_PATH"),

            elevenlabs_api_key: var("ELEVENLABS_API_KEY"),
            elevenlabs_agent_id: var("ELEVENLABS_AGENT_ID"),
            elevenlabs_api_url: var("ELEVENLABS_API_URL"),
            elevenlabs_ws_url: var("ELEVENLABS_WS_URL"),

            twilio_account_sid: var("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: var("TWILIO_AUTH_TOKEN"),
            twilio_api_url: var("TWILIO_API_URL"),

            report_primary_url: var("REPORT_PRIMARY_URL"),
            report_backup_url: var("REPORT_BACKUP_URL"),
            report_timeout_seconds: parse("REPORT_TIMEOUT_SECONDS")?,
            error_log_path: var("ERROR_LOG_PATH"),

            convai_connect_timeout_seconds: parse("CONVAI_CONNECT_TIMEOUT_SECONDS")?,
            closing_grace_seconds: parse("SESSION_CLOSING_GRACE_SECONDS")?,
            pre_active_audio_policy: var("PRE_ACTIVE_AUDIO_POLICY"),
            pre_active_audio_buffer_frames: parse("PRE_ACTIVE_AUDIO_BUFFER_FRAMES")?,
            external_ref_key: var("EXTERNAL_REF_KEY"),
            shutdown_drain_seconds: parse("SHUTDOWN_DRAIN_SECONDS")?,
        })
    }
}

/// Read a variable, treating empty values as unset
fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name}: '{raw}' ({e})").into()),
        None => Ok(None),
    }
}

fn parse_bool(name: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    match var(name) {
        Some(raw) => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(format!("Invalid boolean for {name}: '{raw}'").into()),
        },
        None => Ok(None),
    }
}
