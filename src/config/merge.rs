use std::path::PathBuf;

use super::env::EnvConfig;
use super::yaml::YamlConfig;
use super::{
    DEFAULT_ELEVENLABS_API_URL, DEFAULT_ELEVENLABS_WS_URL, DEFAULT_EXTERNAL_REF_KEY,
    DEFAULT_TWILIO_API_URL, PreActiveAudioPolicy, ServerConfig, TlsConfig,
};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_REPORT_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_ERROR_LOG_PATH: &str = "error_log.txt";
const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_CLOSING_GRACE_SECONDS: u64 = 5;
const DEFAULT_SHUTDOWN_DRAIN_SECONDS: u64 = 30;

/// Merge environment values with optional YAML overrides
///
/// YAML wins over the environment, which wins over defaults.
pub(super) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let env = EnvConfig::load()?;
    let yaml = yaml.unwrap_or_default();

    let server = yaml.server.unwrap_or_default();
    let tls_yaml = server.tls.unwrap_or_default();
    let elevenlabs = yaml.elevenlabs.unwrap_or_default();
    let twilio = yaml.twilio.unwrap_or_default();
    let reporting = yaml.reporting.unwrap_or_default();
    let session = yaml.session.unwrap_or_default();
    let audio = session.pre_active_audio.unwrap_or_default();

    let tls_enabled = tls_yaml.enabled.or(env.tls_enabled).unwrap_or(false);
    let tls = if tls_enabled {
        let cert_path = tls_yaml
            .cert_path
            .or(env.tls_cert_path)
            .ok_or("TLS is enabled but TLS_CERT_PATH is not set")?;
        let key_path = tls_yaml
            .key_path
            .or(env.tls_key_path)
            .ok_or("TLS is enabled but TLS_KEY_PATH is not set")?;
        Some(TlsConfig {
            cert_path: PathBuf::from(cert_path),
            key_path: PathBuf::from(key_path),
        })
    } else {
        None
    };

    let policy_name = audio
        .policy
        .or(env.pre_active_audio_policy)
        .unwrap_or_else(|| "drop".to_string());
    let buffer_frames = audio.buffer_frames.or(env.pre_active_audio_buffer_frames);
    let pre_active_audio = PreActiveAudioPolicy::from_parts(&policy_name, buffer_frames)?;

    Ok(ServerConfig {
        host: server
            .host
            .or(env.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: server.port.or(env.port).unwrap_or(DEFAULT_PORT),
        tls,

        elevenlabs_api_key: elevenlabs.api_key.or(env.elevenlabs_api_key),
        elevenlabs_agent_id: elevenlabs
            .agent_id
            .or(env.elevenlabs_agent_id)
            .unwrap_or_default(),
        elevenlabs_api_url: elevenlabs
            .api_url
            .or(env.elevenlabs_api_url)
            .unwrap_or_else(|| DEFAULT_ELEVENLABS_API_URL.to_string()),
        elevenlabs_ws_url: elevenlabs
            .ws_url
            .or(env.elevenlabs_ws_url)
            .unwrap_or_else(|| DEFAULT_ELEVENLABS_WS_URL.to_string()),

        twilio_account_sid: twilio.account_sid.or(env.twilio_account_sid),
        twilio_auth_token: twilio.auth_token.or(env.twilio_auth_token),
        twilio_api_url: twilio
            .api_url
            .or(env.twilio_api_url)
            .unwrap_or_else(|| DEFAULT_TWILIO_API_URL.to_string()),

        report_primary_url: reporting.primary_url.or(env.report_primary_url),
        report_backup_url: reporting.backup_url.or(env.report_backup_url),
        report_timeout_seconds: reporting
            .timeout_seconds
            .or(env.report_timeout_seconds)
            .unwrap_or(DEFAULT_REPORT_TIMEOUT_SECONDS),
        error_log_path: PathBuf::from(
            reporting
                .error_log_path
                .or(env.error_log_path)
                .unwrap_or_else(|| DEFAULT_ERROR_LOG_PATH.to_string()),
        ),

        convai_connect_timeout_seconds: session
            .connect_timeout_seconds
            .or(env.convai_connect_timeout_seconds)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS),
        closing_grace_seconds: session
            .closing_grace_seconds
            .or(env.closing_grace_seconds)
            .unwrap_or(DEFAULT_CLOSING_GRACE_SECONDS),
        pre_active_audio,
        external_ref_key: session
            .external_ref_key
            .or(env.external_ref_key)
            .unwrap_or_else(|| DEFAULT_EXTERNAL_REF_KEY.to_string()),
        shutdown_drain_seconds: session
            .shutdown_drain_seconds
            .or(env.shutdown_drain_seconds)
            .unwrap_or(DEFAULT_SHUTDOWN_DRAIN_SECONDS),
    })
}
