// ABOUTME: Shared types and configuration for pipewise.
// ABOUTME: Contains config parsing, worker arguments, control addresses, and small utilities.

pub mod address;
pub mod args;
pub mod blocking;
pub mod config;
pub mod slug;

pub use address::{AddressError, ControlAddress};
pub use args::{forwarded_args, RuntimeKind, SocketKind, WorkerArgs, SUPERVISOR_ONLY_KEYS};
pub use blocking::run_blocking;
pub use config::{expand_tilde, Config, GatewayConfig};
pub use slug::slugify;
