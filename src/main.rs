use anyhow::Result;
use colored::*;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use muscleup_access_lib::{MonitorConfig, MonitorEvent, MonitorManager};

fn config_from_env() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    if let Ok(url) = std::env::var("MUSCLEUP_AGENT_WS_URL") {
        config.agent_ws_url = url;
    }
    if let Ok(url) = std::env::var("MUSCLEUP_VERIFY_URL") {
        config.verify_url = url;
    }
    if let Ok(url) = std::env::var("MUSCLEUP_RECENT_ATTEMPTS_URL") {
        config.recent_attempts_url = url;
    }
    if let Ok(operator) = std::env::var("MUSCLEUP_OPERATOR_ID") {
        config.operator_id = Some(operator);
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if std::env::var("MUSCLEUP_PROTOCOL_DEBUG").is_ok() {
        muscleup_access_lib::log::set_protocol_debug(true);
    }

    let config = config_from_env();
    let handle = MonitorManager::start(config)?;
    let mut events = handle.subscribe();

    info!("Monitoring started; press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(MonitorEvent::AccessDecision { attempt, is_self }) => {
                    let who = attempt
                        .user
                        .as_ref()
                        .map(|u| u.full_name())
                        .unwrap_or_else(|| "Unknown user".to_string());
                    info!(
                        "{}: {} {} ({:.0}%){}",
                        "DECISION".bold(),
                        if attempt.success { "granted to" } else { "denied for" },
                        who,
                        attempt.confidence_score,
                        if is_self { " [you]" } else { "" }
                    );
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    info!("Event stream lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    handle.stop().await;
    Ok(())
}
