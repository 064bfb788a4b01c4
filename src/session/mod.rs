//! Session broker: the hand-off between a blocked inbound authentication and
//! the asynchronous approval actor.
//!
//! ## Flow
//!
//! - The coordinator marks the session as awaiting approval and prompts the user
//! - The approval actor deposits a sealed upstream config and its key
//! - The coordinator picks both up, opens the secrets and resolves the upstream
//! - A terminal status is always left behind for the approval actor to report
//!
//! ## Usage
//!
//! ```ignore
//! let store = session::create_session_store(Duration::from_secs(60));
//! let coordinator = ApprovalCoordinator::new(store.clone(), CoordinatorConfig::default());
//!
//! // inside the keyboard-interactive callback
//! let upstream = coordinator.authenticate(&conn, &prompter, &cancel).await?;
//! ```

pub mod coordinator;
pub mod host;
pub mod status;
pub mod store;
pub mod upstream;

pub use coordinator::{ApprovalCoordinator, CoordinatorConfig};
pub use host::{ConnMetadata, HostError, Prompter};
pub use status::SessionStatus;
pub use store::{create_session_store, spawn_sweeper, SessionStore, SharedSessionStore};
pub use upstream::{split_host_port, PipeConfig, Upstream, UpstreamAuth, UpstreamConfig};
