//! quorumlab server library.
//!
//! Wraps a [`quorumlab_cluster::Cluster`] in a [`ControlPlane`] that refuses
//! quorum-breaking requests and rate-limits disruptive ones, and a
//! [`Supervisor`] that runs it behind an operator console.

pub mod config;
pub mod console;
pub mod control;
pub mod error;
pub mod supervisor;

pub use config::{Args, LimitConfig, ServerConfig};
pub use console::{Command, CommandResult};
pub use control::{ControlPlane, Resource};
pub use error::{Error, Result};
pub use supervisor::Supervisor;
