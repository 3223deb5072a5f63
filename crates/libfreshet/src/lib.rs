pub mod archive;
pub mod clearing_house;
pub mod client;
pub mod connection;
mod error;
pub mod node;
pub mod peer;
pub mod server;
mod spawn_utils;

#[cfg(test)]
mod tests;

pub use archive::{Archive, ArchiveOptions, PutPieceOutcome};
pub use clearing_house::{ClearingHouse, Notice, PeerHandles};
pub use client::{Client, ConnectOptions};
pub use connection::Connection;
pub use error::{ArchiveError, Error, Result};
pub use node::{Node, NodeHandle, NodeOptions, NodeRole};
pub use peer::{Peer, PeerOptions, PeerState};
pub use server::{PortSpec, Server, ServerOptions};
