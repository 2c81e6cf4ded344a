use anyhow::Context;
use impairment_pipeline::ReloadHandle;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Turns every SIGHUP into a reload request
pub fn forward_hangups(reload: ReloadHandle) -> anyhow::Result<JoinHandle<()>> {
    let mut hangups =
        signal(SignalKind::hangup()).context("failed to install the SIGHUP handler")?;

    Ok(tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            info!(state = %reload.state(), "SIGHUP received, reloading configuration");
            if !reload.request() {
                warn!("reload controller stopped, ignoring further SIGHUPs");
                break;
            }
        }
    }))
}

pub async fn interrupted() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")
}
