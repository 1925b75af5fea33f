//! Supervisor for long-running game server processes.
//!
//! [`SupervisorRegistry`] maps instance names to [`ManagedProcess`]es, each of
//! which launches (or re-attaches to) one server, follows its `latest.log`,
//! derives status, players and activity from it, and fans console lines out
//! to subscribers.

pub mod activity;
pub mod bans;
pub mod error;
pub mod fanout;
pub mod launch;
pub mod log_parser;
pub mod os;
pub mod players;
pub mod port_alloc;
pub mod process;
pub mod registry;
pub mod settings;
pub mod store;

pub use error::SupervisorError;
pub use process::ManagedProcess;
pub use registry::{NewInstance, SupervisorRegistry};
pub use settings::Settings;
pub use store::{InstanceStore, JsonInstanceStore};
