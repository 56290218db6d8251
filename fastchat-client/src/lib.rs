use std::{io, path::PathBuf};

use thiserror::Error;

pub mod backoff;
pub mod host;
pub mod peer;
pub mod session;
pub mod settings;
pub mod terminal;
pub mod transcript;

pub use backoff::Backoff;
pub use host::{ClientLink, HostController, Reconciliation, is_local_endpoint, local_endpoint};
pub use peer::{ClientConfig, ClientHandlers, ClientRuntime, ConnectionState, PeerClient};
pub use session::ChatSession;
pub use settings::{Settings, SettingsError};
pub use transcript::Transcript;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client loop is not running")]
    NotRunning,
    #[error("message has neither text nor attachments")]
    EmptyMessage,
    #[error("failed to read attachment {}: {source}", .path.display())]
    Attachment { path: PathBuf, source: io::Error },
}
