use std::net::{IpAddr, SocketAddr};

use fastchat_relay::{Relay, RelayConfig};
use tracing::{error, info, warn};
use url::{Host, Url};

use crate::{ClientError, peer::PeerClient, settings::Settings};

/// The parts of a client the host controller steers.
pub trait ClientLink {
    fn endpoint(&self) -> String;
    fn set_endpoint(&self, endpoint: String);
    fn force_reconnect(&self) -> Result<(), ClientError>;
}

impl ClientLink for PeerClient {
    fn endpoint(&self) -> String {
        PeerClient::endpoint(self)
    }

    fn set_endpoint(&self, endpoint: String) {
        PeerClient::set_endpoint(self, endpoint);
    }

    fn force_reconnect(&self) -> Result<(), ClientError> {
        PeerClient::force_reconnect(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Unchanged,
    Started { redirected: bool },
    Stopped,
    StartFailed(String),
}

/// Keeps an embedded relay in step with `Settings::host_mode` and points
/// the co-located client at it.
#[derive(Debug)]
pub struct HostController<C> {
    relay: Relay,
    client: C,
}

impl<C: ClientLink> HostController<C> {
    pub fn new(relay_config: RelayConfig, client: C) -> Self {
        Self {
            relay: Relay::new(relay_config),
            client,
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Diffs the desired host mode against the relay's actual state and
    /// applies the difference. Safe to call on every settings change.
    ///
    /// A failed start clears `settings.host_mode`; the caller persists it.
    pub async fn reconcile(&self, settings: &mut Settings) -> Reconciliation {
        let running = self.relay.is_running().await;

        match (settings.host_mode, running) {
            (true, false) => match self.relay.start().await {
                Ok(address) => {
                    info!(%address, "host mode enabled");
                    let redirected = self.redirect_if_needed(settings, address);
                    Reconciliation::Started { redirected }
                }
                Err(err) => {
                    error!("host mode disabled, relay failed to start: {err}");
                    settings.host_mode = false;
                    Reconciliation::StartFailed(err.to_string())
                }
            },
            (false, true) => {
                self.relay.stop().await;
                info!("host mode disabled");
                Reconciliation::Stopped
            }
            (true, true) | (false, false) => Reconciliation::Unchanged,
        }
    }

    pub async fn set_host_mode(&self, enabled: bool, settings: &mut Settings) -> Reconciliation {
        settings.host_mode = enabled;
        self.reconcile(settings).await
    }

    /// Rewrites a non-local endpoint to the embedded relay and forces one
    /// reconnect. Returns whether a redirect happened.
    pub fn redirect_if_needed(&self, settings: &mut Settings, relay_addr: SocketAddr) -> bool {
        let port = relay_addr.port();
        if is_local_endpoint(&settings.server_url, port) {
            return false;
        }

        let local = local_endpoint(port);
        info!(from = %settings.server_url, to = %local, "redirecting client to local relay");
        settings.server_url = local.clone();
        self.client.set_endpoint(local);
        if let Err(err) = self.client.force_reconnect() {
            // The reconnect loop dials the new endpoint on its next attempt.
            warn!("forced reconnect not delivered: {err}");
        }
        true
    }

    pub async fn shutdown(&self) {
        self.relay.stop().await;
    }
}

pub fn local_endpoint(port: u16) -> String {
    format!("ws://127.0.0.1:{port}")
}

/// Whether `endpoint` names a loopback host on `port`.
pub fn is_local_endpoint(endpoint: &str, port: u16) -> bool {
    let Ok(url) = Url::parse(endpoint.trim()) else {
        return false;
    };
    let loopback = match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    };
    loopback && url.port_or_known_default() == Some(port)
}
