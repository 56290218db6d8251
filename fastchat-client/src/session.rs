use std::path::{Path, PathBuf};

use fastchat_core::{Attachment, Envelope};
use fastchat_relay::RelayConfig;
use tracing::{info, warn};

use crate::{
    ClientError,
    host::{HostController, Reconciliation},
    peer::{ClientConfig, ClientHandlers, PeerClient},
    settings::{Settings, SettingsError, save_to_path_async},
};

/// A client connection plus its embedded relay, driven by persisted
/// settings. This is the surface a front-end talks to.
#[derive(Debug)]
pub struct ChatSession {
    settings: Settings,
    settings_path: PathBuf,
    host: HostController<PeerClient>,
}

impl ChatSession {
    /// Spawns the client's reconnect loop on the current tokio runtime.
    /// Call [`Self::initialize`] afterwards to bring up host mode.
    pub fn start(
        settings: Settings,
        settings_path: PathBuf,
        relay_config: RelayConfig,
        handlers: ClientHandlers,
    ) -> Self {
        let client = PeerClient::connect(
            ClientConfig {
                endpoint: settings.server_url.clone(),
                user_name: settings.user_name.clone(),
                ..ClientConfig::default()
            },
            handlers,
        );
        Self {
            settings,
            settings_path,
            host: HostController::new(relay_config, client),
        }
    }

    /// First reconciliation after the client loop is running. Persists the
    /// settings when reconciliation changed them.
    pub async fn initialize(&mut self) -> Result<Reconciliation, SettingsError> {
        let before = self.settings.clone();
        let outcome = self.host.reconcile(&mut self.settings).await;
        if self.settings != before {
            save_to_path_async(&self.settings_path, &self.settings).await?;
        }
        Ok(outcome)
    }

    /// Replaces the settings after checking the shared secret, then
    /// reconciles host mode and persists the result. A changed endpoint
    /// triggers one forced reconnect unless host mode already redirected.
    pub async fn apply_settings(
        &mut self,
        new: Settings,
        secret: Option<&str>,
    ) -> Result<Reconciliation, SettingsError> {
        if !self.settings.authorize(secret) {
            warn!("settings change rejected: shared secret mismatch");
            return Err(SettingsError::Unauthorized);
        }
        let new = new.normalized();
        new.validate()?;

        let client = self.host.client();
        let endpoint_changed = new.server_url != client.endpoint();
        client.set_user_name(new.user_name.clone());
        if endpoint_changed {
            client.set_endpoint(new.server_url.clone());
        }
        self.settings = new;

        let outcome = self.host.reconcile(&mut self.settings).await;
        let redirected = matches!(outcome, Reconciliation::Started { redirected: true });
        if endpoint_changed && !redirected {
            info!(endpoint = %self.settings.server_url, "server changed, reconnecting");
            if let Err(err) = self.host.client().force_reconnect() {
                warn!("forced reconnect not delivered: {err}");
            }
        }

        save_to_path_async(&self.settings_path, &self.settings).await?;
        Ok(outcome)
    }

    pub async fn set_host_mode(
        &mut self,
        enabled: bool,
        secret: Option<&str>,
    ) -> Result<Reconciliation, SettingsError> {
        let mut next = self.settings.clone();
        next.host_mode = enabled;
        self.apply_settings(next, secret).await
    }

    pub fn send(
        &self,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Envelope, ClientError> {
        self.host.client().send(text, attachments)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn client(&self) -> &PeerClient {
        self.host.client()
    }

    pub fn host(&self) -> &HostController<PeerClient> {
        &self.host
    }

    /// Stops the client loop and the embedded relay, if any.
    pub async fn shutdown(self) {
        self.host.client().shutdown().await;
        self.host.shutdown().await;
    }
}
