//! Contract with the connection-handling host.

use async_trait::async_trait;

/// Boxed error returned by host callbacks
pub type HostError = Box<dyn std::error::Error + Send + Sync>;

/// Metadata about the inbound connection being authenticated.
pub trait ConnMetadata: Send + Sync {
    /// Stable unique id of the inbound connection, used as the session key
    fn unique_id(&self) -> String;

    /// User name the inbound client authenticated as
    fn user(&self) -> String;

    /// Remote address as `ip:port`
    fn remote_addr(&self) -> String;
}

/// One-way, best-effort message channel to the connecting user
/// (a keyboard-interactive challenge with no expected answer).
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn prompt(&self, message: &str) -> Result<(), HostError>;
}
