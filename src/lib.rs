#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod ack;
pub mod bus;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod lag;
pub mod store;

pub use bus::{Event, EventBus, ReloadReason};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionState, RawReceiver, Status, TypedHandler};
pub use envelope::{Inbound, Outbound, SendOptions};
pub use store::{KvStore, MemoryStore};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
