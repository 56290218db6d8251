use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use fastchat_client::{
    ClientError, ClientLink, HostController, Reconciliation, Settings, local_endpoint,
};
use fastchat_relay::RelayConfig;
use tokio::net::TcpListener;

const REMOTE: &str = "ws://192.168.1.50:8765";

struct MockLink {
    endpoint: Mutex<String>,
    reconnects: AtomicUsize,
    loop_running: bool,
}

impl MockLink {
    fn new(endpoint: &str) -> Self {
        Self {
            endpoint: Mutex::new(endpoint.to_owned()),
            reconnects: AtomicUsize::new(0),
            loop_running: true,
        }
    }

    fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

impl ClientLink for MockLink {
    fn endpoint(&self) -> String {
        self.endpoint.lock().unwrap().clone()
    }

    fn set_endpoint(&self, endpoint: String) {
        *self.endpoint.lock().unwrap() = endpoint;
    }

    fn force_reconnect(&self) -> Result<(), ClientError> {
        if !self.loop_running {
            return Err(ClientError::NotRunning);
        }
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn relay_config(bind_address: &str) -> RelayConfig {
    RelayConfig {
        bind_address: bind_address.to_owned(),
        history_path: None,
        ..RelayConfig::default()
    }
}

fn host_settings(server_url: &str) -> Settings {
    Settings {
        server_url: server_url.to_owned(),
        host_mode: true,
        ..Settings::default()
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind free port");
    listener.local_addr().expect("free port addr").port()
}

#[tokio::test]
async fn enabling_host_mode_redirects_a_remote_endpoint_exactly_once() {
    let controller = HostController::new(relay_config("127.0.0.1:0"), MockLink::new(REMOTE));
    let mut settings = host_settings(REMOTE);

    let outcome = controller.reconcile(&mut settings).await;
    assert_eq!(outcome, Reconciliation::Started { redirected: true });

    let address = controller.relay().local_addr().await.expect("relay running");
    let expected = local_endpoint(address.port());
    assert_eq!(settings.server_url, expected);
    assert_eq!(controller.client().endpoint(), expected);
    assert_eq!(controller.client().reconnects(), 1);

    // Already converged: nothing else happens.
    assert_eq!(
        controller.reconcile(&mut settings).await,
        Reconciliation::Unchanged
    );
    assert_eq!(controller.client().reconnects(), 1);

    controller.shutdown().await;
}

#[tokio::test]
async fn local_endpoint_is_left_alone() {
    let port = free_port().await;
    let local = format!("ws://localhost:{port}");
    let controller = HostController::new(
        relay_config(&format!("127.0.0.1:{port}")),
        MockLink::new(&local),
    );
    let mut settings = host_settings(&local);

    let outcome = controller.reconcile(&mut settings).await;
    assert_eq!(outcome, Reconciliation::Started { redirected: false });
    assert_eq!(settings.server_url, local);
    assert_eq!(controller.client().reconnects(), 0);

    controller.shutdown().await;
}

#[tokio::test]
async fn start_failure_disables_host_mode_without_redirecting() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.expect("occupy port");
    let address = occupied.local_addr().expect("occupied addr");

    let controller = HostController::new(relay_config(&address.to_string()), MockLink::new(REMOTE));
    let mut settings = host_settings(REMOTE);

    let outcome = controller.reconcile(&mut settings).await;
    assert!(matches!(outcome, Reconciliation::StartFailed(_)));
    assert!(!settings.host_mode);
    assert_eq!(settings.server_url, REMOTE);
    assert_eq!(controller.client().reconnects(), 0);
    assert!(!controller.relay().is_running().await);
}

#[tokio::test]
async fn disabling_host_mode_stops_the_relay() {
    let controller = HostController::new(relay_config("127.0.0.1:0"), MockLink::new(REMOTE));
    let mut settings = host_settings(REMOTE);

    controller.reconcile(&mut settings).await;
    let address = controller.relay().local_addr().await.expect("relay running");

    let outcome = controller.set_host_mode(false, &mut settings).await;
    assert_eq!(outcome, Reconciliation::Stopped);
    assert!(!controller.relay().is_running().await);
    assert!(TcpListener::bind(address).await.is_ok());

    assert_eq!(
        controller.set_host_mode(false, &mut settings).await,
        Reconciliation::Unchanged
    );
}

#[tokio::test]
async fn redirect_tolerates_a_client_loop_that_is_not_running() {
    let mut link = MockLink::new(REMOTE);
    link.loop_running = false;
    let controller = HostController::new(relay_config("127.0.0.1:0"), link);
    let mut settings = host_settings(REMOTE);

    let outcome = controller.reconcile(&mut settings).await;
    assert_eq!(outcome, Reconciliation::Started { redirected: true });
    assert_eq!(controller.client().endpoint(), settings.server_url);

    controller.shutdown().await;
}
