//! Request API (C4): the thin, caller-facing surface over the connection
//! actor. Builds commands, picks a delivery mode, and short-circuits empty
//! pipelines without ever contacting the actor.

use crate::actor::{AsyncMessage, Connection, ReplyOrServerError, Tag};
use crate::command::Pipeline;
use crate::config::ConnectionOptions;
use crate::error::Result;
use crate::resp::{Command, Reply};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default per-call timeout used by the timeout-free convenience methods.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Client {
    connection: Connection,
    default_timeout: Duration,
}

impl Client {
    pub async fn connect(options: ConnectionOptions) -> Result<Self> {
        Self::connect_with_timeout(options, DEFAULT_CALL_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        options: ConnectionOptions,
        default_timeout: Duration,
    ) -> Result<Self> {
        let connection = Connection::connect(options).await?;
        Ok(Client {
            connection,
            default_timeout,
        })
    }

    /// A cheap-to-clone handle to the underlying actor, for callers that
    /// want to manage their own timeouts per call.
    pub fn handle(&self) -> Connection {
        self.connection.clone()
    }

    pub async fn call(&self, command: Command) -> Result<Reply> {
        self.connection.call(command, self.default_timeout).await
    }

    pub async fn call_with_timeout(&self, command: Command, timeout: Duration) -> Result<Reply> {
        self.connection.call(command, timeout).await
    }

    /// Empty pipelines never reach the actor — they're answered here.
    pub async fn call_pipeline(&self, pipeline: Pipeline) -> Result<Vec<ReplyOrServerError>> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }
        self.connection
            .call_pipeline(pipeline.into_commands(), self.default_timeout)
            .await
    }

    pub async fn call_pipeline_with_timeout(
        &self,
        pipeline: Pipeline,
        timeout: Duration,
    ) -> Result<Vec<ReplyOrServerError>> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }
        self.connection
            .call_pipeline(pipeline.into_commands(), timeout)
            .await
    }

    pub async fn cast(&self, command: Command) -> Result<()> {
        self.connection.cast(command).await
    }

    pub async fn async_call(
        &self,
        command: Command,
        subscriber: mpsc::UnboundedSender<AsyncMessage>,
    ) -> Result<Tag> {
        self.connection.async_call(command, subscriber).await
    }

    pub async fn async_pipeline(
        &self,
        pipeline: Pipeline,
        subscriber: mpsc::UnboundedSender<AsyncMessage>,
    ) -> Result<Tag> {
        self.connection
            .async_pipeline(pipeline.into_commands(), subscriber)
            .await
    }
}
