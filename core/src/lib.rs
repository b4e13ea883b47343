//! treeircd core
//!
//! The engine of a multi-server IRC daemon: line codec, user and
//! channel registries, the pluggable mode system, command dispatch,
//! the spanning tree of linked servers with timestamp-based conflict
//! resolution, x-lines and server notices.

pub mod buffer;
pub mod burst;
pub mod casemap;
pub mod channel;
pub mod client;
pub mod collision;
pub mod commands;
pub mod config;
pub mod connection;
pub mod context;
pub mod database;
pub mod error;
pub mod handshake;
pub mod link;
pub mod lookup;
pub mod message;
pub mod modes;
pub mod motd;
pub mod numeric;
pub mod s2s;
pub mod server;
pub mod server_tree;
pub mod snomask;
pub mod statistics;
pub mod timer;
pub mod user;
pub mod utils;
pub mod xline;

pub use casemap::CaseMapping;
pub use channel::{Channel, ListModeStore, MemberPrefix};
pub use client::{Client, ConnectionKind};
pub use config::Config;
pub use context::{Context, ServerAction};
pub use database::Database;
pub use error::{Error, Result};
pub use message::{Message, Prefix};
pub use numeric::NumericReply;
pub use server::Server;
pub use server_tree::{ServerTree, TreeServer};
pub use user::{RegistrationState, UidGenerator, User};
pub use xline::{XLine, XLineKind, XLineManager};

/// Re-exports for convenience
pub use async_trait::async_trait;
pub use tracing::{debug, error, info, warn};
