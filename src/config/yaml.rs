use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// This structure represents the full configuration that can be loaded from a YAML file.
/// All fields are optional to allow partial configuration. Values here override
/// environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8000
///   tls:
///     enabled: true
///     cert_path: "/etc/bridge/cert.pem"
///     key_path: "/etc/bridge/key.pem"
///
/// elevenlabs:
///   api_key: "your-elevenlabs-key"
///   agent_id: "agent_123"
///
/// twilio:
///   account_sid: "AC..."
///   auth_token: "your-auth-token"
///
/// reporting:
///   primary_url: "https://hooks.example.com/call-end"
///   backup_url: "https://backup.example.com/call-end"
///   timeout_seconds: 10
///   error_log_path: "/var/log/bridge/error_log.txt"
///
/// session:
///   connect_timeout_seconds: 10
///   closing_grace_seconds: 5
///   external_ref_key: "external_ref_id"
///   shutdown_drain_seconds: 30
///   pre_active_audio:
///     policy: "buffer"
///     buffer_frames: 50
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub elevenlabs: Option<ElevenLabsYaml>,
    pub twilio: Option<TwilioYaml>,
    pub reporting: Option<ReportingYaml>,
    pub session: Option<SessionYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// ElevenLabs agent configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ElevenLabsYaml {
    pub api_key: Option<String>,
    pub agent_id: Option<String>,
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
}

/// Twilio REST configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TwilioYaml {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub api_url: Option<String>,
}

/// Call-end report configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReportingYaml {
    pub primary_url: Option<String>,
    pub backup_url: Option<String>,
    /// Per-attempt delivery timeout
    pub timeout_seconds: Option<u64>,
    pub error_log_path: Option<String>,
}

/// Per-session behavior from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    /// Upper bound on signed-URL acquisition plus handshake
    pub connect_timeout_seconds: Option<u64>,
    /// How long CLOSING waits for the other leg before forcing CLOSED
    pub closing_grace_seconds: Option<u64>,
    pub pre_active_audio: Option<PreActiveAudioYaml>,
    pub external_ref_key: Option<String>,
    pub shutdown_drain_seconds: Option<u64>,
}

/// Pre-ACTIVE audio handling from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PreActiveAudioYaml {
    /// "drop" or "buffer"
    pub policy: Option<String>,
    pub buffer_frames: Option<usize>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Required fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 9000
  tls:
    enabled: true
    cert_path: "/certs/cert.pem"
    key_path: "/certs/key.pem"
elevenlabs:
  api_key: "el-key"
  agent_id: "agent_1"
  api_url: "http://localhost:1234"
  ws_url: "ws://localhost:1234"
twilio:
  account_sid: "AC1"
  auth_token: "tok"
reporting:
  primary_url: "https://a.example.com"
  backup_url: "https://b.example.com"
  timeout_seconds: 4
  error_log_path: "/tmp/errors.txt"
session:
  connect_timeout_seconds: 7
  closing_grace_seconds: 3
  external_ref_key: "lead_id"
  shutdown_drain_seconds: 15
  pre_active_audio:
    policy: "buffer"
    buffer_frames: 25
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(server.port, Some(9000));
        assert_eq!(server.tls.unwrap().enabled, Some(true));

        let elevenlabs = config.elevenlabs.unwrap();
        assert_eq!(elevenlabs.agent_id.as_deref(), Some("agent_1"));
        assert_eq!(elevenlabs.ws_url.as_deref(), Some("ws://localhost:1234"));

        assert_eq!(config.twilio.unwrap().account_sid.as_deref(), Some("AC1"));

        let reporting = config.reporting.unwrap();
        assert_eq!(reporting.timeout_seconds, Some(4));
        assert_eq!(reporting.error_log_path.as_deref(), Some("/tmp/errors.txt"));

        let session = config.session.unwrap();
        assert_eq!(session.connect_timeout_seconds, Some(7));
        assert_eq!(session.external_ref_key.as_deref(), Some("lead_id"));
        let audio = session.pre_active_audio.unwrap();
        assert_eq!(audio.policy.as_deref(), Some("buffer"));
        assert_eq!(audio.buffer_frames, Some(25));
    }

    #[test]
    fn test_yaml_config_partial() {
        let yaml = r#"
elevenlabs:
  agent_id: "agent_only"
"#;
        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.server.is_none());
        assert!(config.reporting.is_none());
        assert_eq!(
            config.elevenlabs.unwrap().agent_id.as_deref(),
            Some("agent_only")
        );
    }

    #[test]
    fn test_yaml_config_empty() {
        let config: YamlConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.server.is_none());
        assert!(config.session.is_none());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "server:\n  port: 3001\n").unwrap();

        let config = YamlConfig::from_file(&path).unwrap();
        assert_eq!(config.server.unwrap().port, Some(3001));
    }

    #[test]
    fn test_from_file_not_found() {
        let result = YamlConfig::from_file(&PathBuf::from("/nonexistent/config.yaml"));
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "server: [not, a, map").unwrap();

        let result = YamlConfig::from_file(&path);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML config")
        );
    }
}
