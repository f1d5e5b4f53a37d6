//! Service-discovery client and registration heartbeat for mesh network nodes.
//!
//! A node publishes a [`ServiceEntry`] for each service it offers to a
//! discovery registry, keeps it fresh with a background [`Heartbeat`], and
//! removes it again on shutdown. Applications drive this through an
//! [`Updater`], which also lets them push live [`Stats`].

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod entry;
pub mod error;
pub mod heartbeat;
pub mod session;
pub mod updater;

// Re-export key types
pub use client::DiscoveryClient;
pub use config::{Config, HeartbeatConfig};
pub use entry::{NodeAddress, ServiceEntry, Stats};
pub use error::{Error, RegistryError, Result};
pub use heartbeat::{Heartbeat, LoopState};
pub use session::{AuthSession, SessionProvider};
pub use updater::{StatsUpdater, Updater, UpdaterFactory, CONN_COUNT_KEY};

pub use iroh::{PublicKey, SecretKey};
