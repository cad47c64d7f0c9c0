//! Stream Sourcing - cross-account filtered stream sourcing
//!
//! Accounts own streams; publishers append by subject; a downstream stream
//! can source a filtered copy of an upstream stream in another account
//! through that account's read-only external API.
//!
//! The [`Broker`] is the entry point: it owns every component and hands
//! out account-bound [`Connection`]s.

pub mod account;
pub mod binding;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod publish;
pub mod registry;
pub mod sourcing;
pub mod storage;
pub mod subject;
pub mod utils;

pub use broker::{Broker, BrokerBuilder, Connection};
pub use error::{Error, ErrorKind, Result};
