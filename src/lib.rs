//! A non-blocking Redis client: a RESP codec, a request/response
//! multiplexer with reconnect and AUTH/SELECT replay, and a back-pressured
//! pubsub actor.
//!
//! The surface is actor-handle-shaped throughout — [`Client`]/[`Connection`]
//! and [`PubsubConnection`] are cheap to clone and talk to a single task
//! that owns the socket; nothing in this crate takes a lock.

mod actor;
mod client;
mod command;
mod config;
mod error;
mod pubsub;
mod resp;
mod transport;

pub use actor::{AsyncMessage, AsyncOutcome, Connection, ReplyOrServerError, Tag};
pub use client::Client;
pub use command::Pipeline;
pub use config::{ConnectionOptions, PubsubOptions, QueueBehaviour, ReconnectPolicy};
pub use error::{Error, Result};
pub use pubsub::{PubsubConnection, PubsubEvent};
pub use resp::{Arg, Command, Reply};
pub use transport::{Endpoint, TlsOptions};
