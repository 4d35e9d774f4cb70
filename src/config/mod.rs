//! Configuration module for the phone bridge
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use phone_bridge::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::YamlConfig;

/// Default ElevenLabs REST base URL
pub const DEFAULT_ELEVENLABS_API_URL: &str = "https://api.elevenlabs.io";
/// Default ElevenLabs WebSocket base URL
pub const DEFAULT_ELEVENLABS_WS_URL: &str = "wss://api.elevenlabs.io";
/// Default Twilio REST base URL
pub const DEFAULT_TWILIO_API_URL: &str = "https://api.twilio.com";
/// Default custom parameter / dynamic variable carrying the correlation id
pub const DEFAULT_EXTERNAL_REF_KEY: &str = "external_ref_id";

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// What a session does with caller audio that arrives before the AI leg is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreActiveAudioPolicy {
    /// Discard the frame
    #[default]
    Drop,
    /// Keep up to `max_frames` frames (oldest evicted first) and flush them on open
    Buffer { max_frames: usize },
}

impl PreActiveAudioPolicy {
    /// Default buffer depth when buffering is selected without a size
    pub const DEFAULT_BUFFER_FRAMES: usize = 50;

    /// Build a policy from its name and an optional buffer size.
    pub fn from_parts(name: &str, max_frames: Option<usize>) -> Result<Self, String> {
        match name.trim().to_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "buffer" => Ok(Self::Buffer {
                max_frames: max_frames.unwrap_or(Self::DEFAULT_BUFFER_FRAMES),
            }),
            other => Err(format!(
                "Invalid pre-active audio policy '{other}', expected 'drop' or 'buffer'"
            )),
        }
    }
}

impl FromStr for PreActiveAudioPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_parts(s, None)
    }
}

impl fmt::Display for PreActiveAudioPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => write!(f, "drop"),
            Self::Buffer { max_frames } => write!(f, "buffer({max_frames})"),
        }
    }
}

/// Server configuration
///
/// Contains all configuration needed to run the bridge, including:
/// - Server settings (host, port, TLS)
/// - ElevenLabs agent credentials and endpoints
/// - Twilio REST credentials for call completion
/// - Call-end report endpoints
/// - Per-session timing and audio policies
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // ElevenLabs settings
    /// API key used to request signed conversation URLs. Public agents work without one.
    pub elevenlabs_api_key: Option<String>,
    pub elevenlabs_agent_id: String,
    pub elevenlabs_api_url: String,
    pub elevenlabs_ws_url: String,

    // Twilio settings
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_api_url: String,

    // Call-end reporting
    pub report_primary_url: Option<String>,
    pub report_backup_url: Option<String>,
    pub report_timeout_seconds: u64,
    pub error_log_path: PathBuf,

    // Session behavior
    pub convai_connect_timeout_seconds: u64,
    pub closing_grace_seconds: u64,
    pub pre_active_audio: PreActiveAudioPolicy,
    pub external_ref_key: String,
    pub shutdown_drain_seconds: u64,
}

/// Implement Drop to zeroize all secret fields when ServerConfig is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.elevenlabs_api_key {
            key.zeroize();
        }
        if let Some(ref mut token) = self.twilio_auth_token {
            token.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables only
    ///
    /// Unset values fall back to their defaults. The result is validated.
    ///
    /// # Errors
    /// Returns an error if an environment variable has an invalid format or
    /// validation fails.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// After loading and merging, performs validation on the final configuration.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        // Note: .env file is loaded in main.rs at application startup
        let yaml_config = yaml::YamlConfig::from_file(path)?;

        let config = merge::merge_config(Some(yaml_config))?;

        validation::validate(&config)?;

        Ok(config)
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Check if call-end reporting is configured
    pub fn has_reporting(&self) -> bool {
        self.report_primary_url.is_some()
    }

    /// Check if Twilio call completion is configured
    pub fn has_twilio_credentials(&self) -> bool {
        self.twilio_account_sid.is_some() && self.twilio_auth_token.is_some()
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_seconds)
    }

    pub fn convai_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.convai_connect_timeout_seconds)
    }

    pub fn closing_grace(&self) -> Duration {
        Duration::from_secs(self.closing_grace_seconds)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_seconds)
    }
}
