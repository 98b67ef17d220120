#![doc = include_str!("../README.md")]
#![allow(
	// I dislike this rule... We import things elsewhere, usually outside of
  // modules themselves.
	clippy::module_name_repetitions,
)]

pub mod channel;
pub mod errors;
pub mod protocol;
pub mod registry;
pub mod serial;
pub mod server;
pub mod uart;

pub use crate::{
	registry::{ChannelId, Registry, Role},
	server::{BoundServer, Server, Tuning},
};

/// The host the server binds when none is given on the command line.
pub const DEFAULT_HOST: &str = "localhost";
/// The port the server binds when none is given on the command line.
pub const DEFAULT_PORT: u16 = 5001;
