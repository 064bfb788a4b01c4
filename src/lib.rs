pub mod admission;
pub mod approval;
pub mod config;
pub mod crypto;
pub mod error;
pub mod pipe;
pub mod session;
pub mod web;

pub use config::AppConfig;
pub use error::{BrokerError, BrokerResult};
