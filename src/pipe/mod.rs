pub mod hooks;
pub mod known_hosts;

pub use hooks::PipeHooks;
pub use known_hosts::verify_host_key;
