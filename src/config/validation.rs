use url::Url;

use super::{PreActiveAudioPolicy, ServerConfig};

/// Run every validation rule against a merged configuration
pub(super) fn validate(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_agent_id(&config.elevenlabs_agent_id)?;
    validate_base_url("ELEVENLABS_API_URL", &config.elevenlabs_api_url, &["http", "https"])?;
    validate_base_url("ELEVENLABS_WS_URL", &config.elevenlabs_ws_url, &["ws", "wss"])?;
    validate_base_url("TWILIO_API_URL", &config.twilio_api_url, &["http", "https"])?;
    validate_report_urls(&config.report_primary_url, &config.report_backup_url)?;
    validate_pre_active_audio(&config.pre_active_audio)?;
    Ok(())
}

/// The agent id is required; every session connects to this agent.
pub(super) fn validate_agent_id(agent_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    if agent_id.trim().is_empty() {
        return Err("ELEVENLABS_AGENT_ID is required (set it in the environment or elevenlabs.agent_id in YAML)".into());
    }
    Ok(())
}

fn validate_base_url(
    name: &str,
    value: &str,
    schemes: &[&str],
) -> Result<(), Box<dyn std::error::Error>> {
    let url = Url::parse(value).map_err(|e| format!("{name} is not a valid URL: {e}"))?;
    if !schemes.contains(&url.scheme()) {
        return Err(format!(
            "{name} must use one of the schemes {:?}, got '{}'",
            schemes,
            url.scheme()
        )
        .into());
    }
    Ok(())
}

/// Report URLs must be http(s); a backup endpoint without a primary is rejected.
pub(super) fn validate_report_urls(
    primary: &Option<String>,
    backup: &Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if backup.is_some() && primary.is_none() {
        return Err("REPORT_BACKUP_URL is set but REPORT_PRIMARY_URL is not; a backup endpoint requires a primary".into());
    }
    if let Some(primary) = primary {
        validate_base_url("REPORT_PRIMARY_URL", primary, &["http", "https"])?;
    }
    if let Some(backup) = backup {
        validate_base_url("REPORT_BACKUP_URL", backup, &["http", "https"])?;
    }
    Ok(())
}

pub(super) fn validate_pre_active_audio(
    policy: &PreActiveAudioPolicy,
) -> Result<(), Box<dyn std::error::Error>> {
    if let PreActiveAudioPolicy::Buffer { max_frames: 0 } = policy {
        return Err("PRE_ACTIVE_AUDIO_BUFFER_FRAMES must be greater than 0 when buffering".into());
    }
    Ok(())
}
