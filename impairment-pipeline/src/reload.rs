use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::config::{self, ConfigError, ConfigSnapshot, ConfigSource, ConfigStore};
use crate::tunnel::{Tunnel, TunnelError};

/// Where the controller is in the reload protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadState {
    Stable,
    Loading,
    Validating,
    Swapping,
    Failed,
}

impl Display for ReloadState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReloadState::Stable => "stable",
            ReloadState::Loading => "loading",
            ReloadState::Validating => "validating",
            ReloadState::Swapping => "swapping",
            ReloadState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("configuration rejected: {0}")]
    Config(Arc<ConfigError>),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("the reload controller is not running")]
    Stopped,
}

struct ReloadRequest {
    respond_to: Option<oneshot::Sender<Result<u64, ReloadError>>>,
}

/// Serializes configuration reloads
///
/// Each reload re-reads the source, validates it as a whole, publishes it to the store and
/// rebuilds the tunnel's chains. Requests arriving while a reload runs are coalesced into a
/// single follow-up reload.
pub struct ReloadController {
    source: Arc<dyn ConfigSource>,
    store: Arc<ConfigStore>,
    tunnel: Arc<Tunnel>,
    requests: mpsc::Receiver<ReloadRequest>,
    state: watch::Sender<ReloadState>,
}

/// Posts reload requests to a running [`ReloadController`]
#[derive(Clone)]
pub struct ReloadHandle {
    requests: mpsc::Sender<ReloadRequest>,
    state: watch::Receiver<ReloadState>,
}

impl ReloadController {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        store: Arc<ConfigStore>,
        tunnel: Arc<Tunnel>,
    ) -> (Self, ReloadHandle) {
        let (request_tx, request_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ReloadState::Stable);

        let controller = Self {
            source,
            store,
            tunnel,
            requests: request_rx,
            state: state_tx,
        };
        let handle = ReloadHandle {
            requests: request_tx,
            state: state_rx,
        };
        (controller, handle)
    }

    /// Handles requests until every [`ReloadHandle`] has been dropped
    pub async fn run(mut self) {
        while let Some(first) = self.requests.recv().await {
            let mut batch = vec![first];
            while let Ok(next) = self.requests.try_recv() {
                batch.push(next);
            }

            let result = self.reload().await;
            for request in batch {
                if let Some(respond_to) = request.respond_to {
                    respond_to.send(result.clone()).ok();
                }
            }
        }
    }

    async fn reload(&self) -> Result<u64, ReloadError> {
        self.enter(ReloadState::Loading);
        info!(source = %self.source.describe(), "reloading configuration");
        let text = match self.source.read() {
            Ok(text) => text,
            Err(e) => return self.fail(ReloadError::Config(Arc::new(e))),
        };

        self.enter(ReloadState::Validating);
        let snapshot = match config::parse(&text, self.source.format()) {
            Ok(snapshot) => snapshot,
            Err(e) => return self.fail(ReloadError::Config(Arc::new(e))),
        };
        self.warn_about_interface_changes(&snapshot);

        self.enter(ReloadState::Swapping);
        let published = self.store.swap(snapshot);
        match self.tunnel.rebuild(&published).await {
            Ok(version) => {
                self.enter(ReloadState::Stable);
                info!(version, "configuration reloaded");
                Ok(version)
            }
            Err(e) => self.fail(e.into()),
        }
    }

    fn enter(&self, state: ReloadState) {
        self.state.send_replace(state);
    }

    fn fail(&self, e: ReloadError) -> Result<u64, ReloadError> {
        error!(version = self.store.version(), "reload failed, keeping the running configuration: {e}");
        self.enter(ReloadState::Failed);
        self.enter(ReloadState::Stable);
        Err(e)
    }

    /// Interfaces are bound once at startup, so changing them needs a restart
    fn warn_about_interface_changes(&self, next: &ConfigSnapshot) {
        let current = self.store.load();
        for (side, before, after) in [
            ("Left", &current.left, &next.left),
            ("Right", &current.right, &next.right),
        ] {
            if before.device_name != after.device_name
                || before.hardware_addr != after.hardware_addr
            {
                warn!(side, "interface settings changed; restart to apply them");
            }
        }
    }
}

impl ReloadHandle {
    /// Asks for a reload without waiting for it
    ///
    /// Returns false only if the controller is gone. A request made while another one is still
    /// queued is folded into it.
    pub fn request(&self) -> bool {
        match self.requests.try_send(ReloadRequest { respond_to: None }) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Reloads and waits for the outcome, returning the version now in effect
    pub async fn reload(&self) -> Result<u64, ReloadError> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(ReloadRequest {
                respond_to: Some(respond_to),
            })
            .await
            .map_err(|_| ReloadError::Stopped)?;
        response.await.map_err(|_| ReloadError::Stopped)?
    }

    pub fn state(&self) -> ReloadState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReloadState> {
        self.state.clone()
    }
}
