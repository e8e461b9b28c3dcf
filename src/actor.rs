//! The connection actor (C3): owns the socket, drives the RESP decoder,
//! tracks in-flight callers in FIFO order, and runs the reconnect/AUTH/
//! SELECT state machine.
//!
//! Every mutable piece of state — the socket, the decoder continuation,
//! the FIFO — is owned by a single task spawned from [`Connection::connect`].
//! Callers interact only through message passing over an `mpsc` inbox, so no
//! lock is needed anywhere in this module.

use crate::config::ConnectionOptions;
use crate::error::{Error, Result};
use crate::resp::{self, Command, Decoder, Reply};
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Opaque tag returned by [`Connection::async_call`]/[`Connection::async_pipeline`].
pub type Tag = u64;

/// One command's reply, or the server error bytes if it replied with `-ERR ...`.
pub type ReplyOrServerError = std::result::Result<Reply, Bytes>;

/// What an `async`/`async_pipeline` subscriber receives.
#[derive(Debug)]
pub enum AsyncOutcome {
    Single(ReplyOrServerError),
    Pipeline(Vec<ReplyOrServerError>),
}

/// The message delivered to an `async`/`async_pipeline` subscriber: `(tag, reply_or_list)`.
#[derive(Debug)]
pub struct AsyncMessage {
    pub tag: Tag,
    pub outcome: Result<AsyncOutcome>,
}

enum Delivery {
    Oneshot(oneshot::Sender<Result<Vec<ReplyOrServerError>>>),
    Cast,
    Async {
        tag: Tag,
        subscriber: mpsc::UnboundedSender<AsyncMessage>,
        is_pipeline: bool,
    },
}

struct Submission {
    commands: Vec<Command>,
    delivery: Delivery,
}

/// A waiting caller paired with how many replies it still needs before it
/// can be resumed. `expected` is 1 for a single command, K for a pipeline.
struct InFlight {
    delivery: Delivery,
    expected: usize,
    accumulator: Vec<ReplyOrServerError>,
}

/// Handle to a running connection actor. Cloning is cheap (it's just an
/// `mpsc::Sender`); every clone talks to the same actor task.
#[derive(Clone)]
pub struct Connection {
    inbox: mpsc::Sender<Submission>,
    next_tag: std::sync::Arc<AtomicU64>,
}

impl Connection {
    /// Spawn a connection actor and return a handle to it.
    ///
    /// If reconnect is disabled, the very first connect attempt is made
    /// synchronously and its failure is surfaced here as
    /// [`Error::ConnectionError`]. If reconnect is enabled, this returns
    /// immediately with a handle and the actor performs its first connect
    /// attempt in the background, falling back to the reconnect loop on
    /// failure rather than failing this call.
    pub async fn connect(options: ConnectionOptions) -> Result<Connection> {
        let (tx, rx) = mpsc::channel(256);
        let reconnect_enabled = options.reconnect.is_enabled();

        let initial_transport = if reconnect_enabled {
            None
        } else {
            match connect_and_handshake(&options).await {
                Ok(t) => Some(t),
                Err(e) => return Err(Error::ConnectionError(e.to_string())),
            }
        };

        let actor = ConnectionActor {
            options,
            inbox: rx,
            fifo: VecDeque::new(),
            decoder: Decoder::new(),
        };
        tokio::spawn(actor.run(initial_transport));

        Ok(Connection {
            inbox: tx,
            next_tag: std::sync::Arc::new(AtomicU64::new(1)),
        })
    }

    fn fresh_tag(&self) -> Tag {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// Suspend the caller; returns a single `Reply` on success, a server
    /// error, `no_connection` while the circuit is open, or a caller-side
    /// timeout.
    pub async fn call(&self, command: Command, timeout: Duration) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Submission {
                commands: vec![command],
                delivery: Delivery::Oneshot(tx),
            })
            .await
            .map_err(|_| Error::Closed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(mut results))) => match results.remove(0) {
                Ok(reply) => Ok(reply),
                Err(server_err) => Err(Error::Server(server_err)),
            },
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_canceled)) => Err(Error::Closed),
            Err(_elapsed) => Err(Error::Timeout),
        }
    }

    /// Submit `commands` atomically; the reply list has the same length and
    /// order as `commands`. An empty pipeline is the caller's (C4) concern
    /// to short-circuit — this method always contacts the actor.
    pub async fn call_pipeline(
        &self,
        commands: Vec<Command>,
        timeout: Duration,
    ) -> Result<Vec<ReplyOrServerError>> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Submission {
                commands,
                delivery: Delivery::Oneshot(tx),
            })
            .await
            .map_err(|_| Error::Closed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => Err(Error::Closed),
            Err(_elapsed) => Err(Error::Timeout),
        }
    }

    /// Fire-and-forget: the reply is dropped. Still ordered with respect to
    /// subsequent `call`s from the same caller, and still subject to the
    /// circuit breaker (silently, since nobody observes the drop).
    pub async fn cast(&self, command: Command) -> Result<()> {
        self.inbox
            .send(Submission {
                commands: vec![command],
                delivery: Delivery::Cast,
            })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Submit `command` and deliver `(tag, reply)` to `subscriber` when the
    /// reply arrives.
    pub async fn async_call(
        &self,
        command: Command,
        subscriber: mpsc::UnboundedSender<AsyncMessage>,
    ) -> Result<Tag> {
        let tag = self.fresh_tag();
        self.inbox
            .send(Submission {
                commands: vec![command],
                delivery: Delivery::Async {
                    tag,
                    subscriber,
                    is_pipeline: false,
                },
            })
            .await
            .map_err(|_| Error::Closed)?;
        Ok(tag)
    }

    /// Same as [`Connection::async_call`] but for a pipeline: the delivered
    /// message wraps the full reply list.
    pub async fn async_pipeline(
        &self,
        commands: Vec<Command>,
        subscriber: mpsc::UnboundedSender<AsyncMessage>,
    ) -> Result<Tag> {
        let tag = self.fresh_tag();
        self.inbox
            .send(Submission {
                commands,
                delivery: Delivery::Async {
                    tag,
                    subscriber,
                    is_pipeline: true,
                },
            })
            .await
            .map_err(|_| Error::Closed)?;
        Ok(tag)
    }
}

enum ActorState {
    Connecting,
    Disconnected,
    Ready(Transport),
    Terminated,
}

struct ConnectionActor {
    options: ConnectionOptions,
    inbox: mpsc::Receiver<Submission>,
    fifo: VecDeque<InFlight>,
    decoder: Decoder,
}

impl ConnectionActor {
    async fn run(mut self, initial_transport: Option<Transport>) {
        let mut state = match initial_transport {
            Some(t) => ActorState::Ready(t),
            None => ActorState::Connecting,
        };

        loop {
            state = match state {
                ActorState::Connecting => self.do_connect().await,
                ActorState::Disconnected => self.wait_disconnected().await,
                ActorState::Ready(transport) => self.run_ready(transport).await,
                ActorState::Terminated => break,
            };
        }

        tracing::debug!("connection actor terminated");
    }

    async fn do_connect(&mut self) -> ActorState {
        match connect_and_handshake(&self.options).await {
            Ok(transport) => {
                tracing::info!("connected and authenticated");
                self.decoder = Decoder::new();
                ActorState::Ready(transport)
            }
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                if self.options.reconnect.is_enabled() {
                    ActorState::Disconnected
                } else {
                    ActorState::Terminated
                }
            }
        }
    }

    /// While disconnected, every submission is rejected immediately with
    /// `no_connection` (the circuit-breaker contract) — the rejection never
    /// waits for `connect_timeout`, only for the reconnect sleep to elapse.
    async fn wait_disconnected(&mut self) -> ActorState {
        let sleep_for = match self.options.reconnect {
            crate::config::ReconnectPolicy::Fixed(d) => d,
            crate::config::ReconnectPolicy::NoReconnect => {
                unreachable!("Disconnected state only entered when reconnect is enabled")
            }
        };
        let sleep = tokio::time::sleep(sleep_for);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return ActorState::Connecting,
                maybe_sub = self.inbox.recv() => {
                    match maybe_sub {
                        Some(sub) => self.deliver(sub.delivery, Err(Error::NoConnection)),
                        None => return ActorState::Terminated,
                    }
                }
            }
        }
    }

    async fn run_ready(&mut self, mut transport: Transport) -> ActorState {
        let mut read_buf = BytesMut::with_capacity(8 * 1024);

        loop {
            tokio::select! {
                biased;
                maybe_sub = self.inbox.recv() => {
                    match maybe_sub {
                        Some(sub) => {
                            if let Err(e) = self.write_submission(&mut transport, sub).await {
                                tracing::warn!(error = %e, "write failed; connection lost");
                                return self.on_connection_lost(&mut transport).await;
                            }
                        }
                        None => {
                            let _ = transport.shutdown().await;
                            return ActorState::Terminated;
                        }
                    }
                }
                read_result = transport.read_buf(&mut read_buf) => {
                    match read_result {
                        Ok(0) => {
                            tracing::warn!("peer closed the connection");
                            return self.on_connection_lost(&mut transport).await;
                        }
                        Ok(_) => {
                            let bytes = read_buf.split();
                            match self.decoder.feed(&bytes) {
                                Ok(replies) => {
                                    for reply in replies {
                                        self.dispatch_reply(reply);
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "decode error; treating as connection loss");
                                    return self.on_connection_lost(&mut transport).await;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "read failed; connection lost");
                            return self.on_connection_lost(&mut transport).await;
                        }
                    }
                }
            }
        }
    }

    async fn on_connection_lost(&mut self, transport: &mut Transport) -> ActorState {
        let _ = transport.shutdown().await;
        self.decoder = Decoder::new();
        while let Some(entry) = self.fifo.pop_front() {
            self.deliver(entry.delivery, Err(Error::Closed));
        }
        if self.options.reconnect.is_enabled() {
            ActorState::Disconnected
        } else {
            ActorState::Terminated
        }
    }

    async fn write_submission(&mut self, transport: &mut Transport, sub: Submission) -> Result<()> {
        // An empty submission owes nothing to wait for — deliver it without
        // ever entering the FIFO, since it would otherwise sit at the front
        // with `expected == 0` and never be popped by `dispatch_reply`.
        if sub.commands.is_empty() {
            self.deliver(sub.delivery, Ok(Vec::new()));
            return Ok(());
        }

        let mut encoded = Vec::with_capacity(sub.commands.len());
        for cmd in &sub.commands {
            match resp::encode(cmd) {
                Ok(bytes) => encoded.push(bytes),
                Err(e) => {
                    // Encoding failures never touch the wire or the FIFO —
                    // they're answered synchronously to just this submitter.
                    self.deliver(sub.delivery, Err(e));
                    return Ok(());
                }
            }
        }

        let mut out = BytesMut::new();
        for chunk in &encoded {
            out.extend_from_slice(chunk);
        }
        transport.write_all(&out).await?;

        let expected = sub.commands.len();
        self.fifo.push_back(InFlight {
            delivery: sub.delivery,
            expected,
            accumulator: Vec::with_capacity(expected),
        });
        Ok(())
    }

    fn dispatch_reply(&mut self, reply: Reply) {
        let Some(front) = self.fifo.front_mut() else {
            tracing::warn!("reply arrived with no in-flight caller; dropping");
            return;
        };

        let item = match reply {
            Reply::Error(bytes) => Err(bytes),
            other => Ok(other),
        };
        front.accumulator.push(item);

        if front.accumulator.len() == front.expected {
            let entry = self.fifo.pop_front().expect("front just matched");
            self.deliver(entry.delivery, Ok(entry.accumulator));
        }
    }

    fn deliver(&self, delivery: Delivery, result: Result<Vec<ReplyOrServerError>>) {
        match delivery {
            Delivery::Oneshot(tx) => {
                let _ = tx.send(result);
            }
            Delivery::Cast => {}
            Delivery::Async {
                tag,
                subscriber,
                is_pipeline,
            } => {
                let outcome = result.map(|mut items| {
                    if is_pipeline {
                        AsyncOutcome::Pipeline(items)
                    } else {
                        AsyncOutcome::Single(items.pop().unwrap_or(Err(Bytes::new())))
                    }
                });
                let _ = subscriber.send(AsyncMessage { tag, outcome });
            }
        }
    }
}

/// Open the transport, then replay AUTH (iff password non-empty) and SELECT
/// (iff a database is configured), in that order, before the connection is
/// considered `Ready`.
///
/// Shared with the pubsub actor (C5), which is a normal RESP connection
/// until the first SUBSCRIBE.
pub(crate) async fn connect_and_handshake(options: &ConnectionOptions) -> Result<Transport> {
    let mut transport = Transport::connect(
        &options.endpoint,
        options.tls.as_ref(),
        options.connect_timeout,
    )
    .await?;
    let mut decoder = Decoder::new();

    if !options.password.is_empty() {
        let auth = Command::new().arg("AUTH").arg(options.password.clone());
        expect_ok(&mut transport, &mut decoder, auth).await?;
    }

    if let Some(db) = options.database {
        let select = Command::new().arg("SELECT").arg(db as i64);
        expect_ok(&mut transport, &mut decoder, select).await?;
    }

    Ok(transport)
}

async fn expect_ok(transport: &mut Transport, decoder: &mut Decoder, cmd: Command) -> Result<()> {
    let bytes = resp::encode(&cmd)?;
    transport.write_all(&bytes).await?;
    match read_one_reply(transport, decoder).await? {
        Reply::SimpleString(ref s) if s.as_ref() == b"OK" => Ok(()),
        Reply::Error(bytes) => Err(Error::Server(bytes)),
        other => Err(Error::Decode(format!("unexpected handshake reply: {other:?}"))),
    }
}

async fn read_one_reply(transport: &mut Transport, decoder: &mut Decoder) -> Result<Reply> {
    let mut buf = BytesMut::with_capacity(512);
    loop {
        let n = transport.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        let bytes = buf.split();
        let mut replies = decoder.feed(&bytes)?;
        if !replies.is_empty() {
            return Ok(replies.remove(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionOptions, ReconnectPolicy};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Spawn a fake single-client Redis server on loopback: accepts one
    /// connection, replies `+OK\r\n` to everything it reads (enough to pass
    /// the AUTH/SELECT handshake), then runs `serve` for the rest of the
    /// scripted behavior.
    async fn fake_server(
        serve: impl FnOnce(tokio::net::TcpStream) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + 'static,
    ) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            serve(sock).await;
        });
        addr
    }

    #[tokio::test]
    async fn get_set_round_trip() {
        let addr = fake_server(|mut sock| {
            Box::pin(async move {
                let mut buf = vec![0u8; 4096];
                // SET foo bar
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0);
                sock.write_all(b"+OK\r\n").await.unwrap();
                // GET foo
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0);
                sock.write_all(b"$3\r\nbar\r\n").await.unwrap();
            })
        })
        .await;

        let options = ConnectionOptions::tcp("127.0.0.1", addr.port())
            .with_reconnect(ReconnectPolicy::NoReconnect);
        let conn = Connection::connect(options).await.unwrap();

        let reply = conn
            .call(
                Command::new().arg("SET").arg("foo").arg("bar"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply, Reply::SimpleString(Bytes::from_static(b"OK")));

        let reply = conn
            .call(Command::new().arg("GET").arg("foo"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Bulk(Some(Bytes::from_static(b"bar"))));
    }

    #[tokio::test]
    async fn pipeline_collects_k_replies_in_order() {
        let addr = fake_server(|mut sock| {
            Box::pin(async move {
                let mut buf = vec![0u8; 4096];
                let _ = sock.read(&mut buf).await.unwrap();
                sock.write_all(b"+OK\r\n:1\r\n$-1\r\n").await.unwrap();
            })
        })
        .await;

        let options = ConnectionOptions::tcp("127.0.0.1", addr.port())
            .with_reconnect(ReconnectPolicy::NoReconnect);
        let conn = Connection::connect(options).await.unwrap();

        let replies = conn
            .call_pipeline(
                vec![
                    Command::new().arg("MULTI"),
                    Command::new().arg("INCR").arg("x"),
                    Command::new().arg("GET").arg("missing"),
                ],
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], Ok(Reply::SimpleString(Bytes::from_static(b"OK"))));
        assert_eq!(replies[1], Ok(Reply::Integer(Bytes::from_static(b"1"))));
        assert_eq!(replies[2], Ok(Reply::Bulk(None)));
    }

    #[tokio::test]
    async fn socket_close_fails_in_flight_with_closed() {
        let addr = fake_server(|mut sock| {
            Box::pin(async move {
                let mut buf = vec![0u8; 4096];
                let _ = sock.read(&mut buf).await.unwrap();
                // Drop the connection without replying.
                drop(sock);
            })
        })
        .await;

        let options = ConnectionOptions::tcp("127.0.0.1", addr.port())
            .with_reconnect(ReconnectPolicy::NoReconnect);
        let conn = Connection::connect(options).await.unwrap();

        let err = conn
            .call(Command::new().arg("GET").arg("foo"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn circuit_breaker_rejects_immediately_while_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Nobody is listening: the connect attempt is refused quickly,
        // driving the actor into Disconnected.
        drop(listener);

        let options = ConnectionOptions::tcp("127.0.0.1", addr.port())
            .with_reconnect(ReconnectPolicy::fixed_millis(50))
            .with_connect_timeout(Duration::from_millis(100));
        let conn = Connection::connect(options).await.unwrap();

        let start = std::time::Instant::now();
        let err = conn
            .call(Command::new().arg("PING"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoConnection));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    /// Like `fake_server`, but accepts two connections in sequence — the
    /// initial one and the one the actor opens after reconnecting.
    async fn fake_server_then_reconnect(
        serve_first: impl FnOnce(tokio::net::TcpStream) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + 'static,
        serve_second: impl FnOnce(tokio::net::TcpStream) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + 'static,
    ) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock1, _) = listener.accept().await.unwrap();
            serve_first(sock1).await;
            let (sock2, _) = listener.accept().await.unwrap();
            serve_second(sock2).await;
        });
        addr
    }

    /// Reads and replies `+OK\r\n` to an AUTH then a SELECT, asserting both
    /// actually arrived on the wire (property 6: reconnect replays auth).
    async fn expect_auth_then_select(sock: &mut tokio::net::TcpStream) {
        let mut buf = vec![0u8; 4096];
        let n = sock.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert!(buf[..n].windows(4).any(|w| w.eq_ignore_ascii_case(b"AUTH")));
        sock.write_all(b"+OK\r\n").await.unwrap();

        let n = sock.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert!(buf[..n].windows(6).any(|w| w.eq_ignore_ascii_case(b"SELECT")));
        sock.write_all(b"+OK\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_replays_auth_select_and_recovers() {
        let addr = fake_server_then_reconnect(
            |mut sock| {
                Box::pin(async move {
                    expect_auth_then_select(&mut sock).await;
                    // Lost mid-flight, before any GET is served: the actor
                    // must fall back to the reconnect loop.
                    drop(sock);
                })
            },
            |mut sock| {
                Box::pin(async move {
                    expect_auth_then_select(&mut sock).await;
                    let mut buf = vec![0u8; 4096];
                    let n = sock.read(&mut buf).await.unwrap();
                    assert!(n > 0);
                    sock.write_all(b"$3\r\nbar\r\n").await.unwrap();
                    // Keep the socket open long enough for the caller to
                    // read the reply before the test tears everything down.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                })
            },
        )
        .await;

        let options = ConnectionOptions::tcp("127.0.0.1", addr.port())
            .with_password("secret")
            .with_database(0)
            .with_reconnect(ReconnectPolicy::fixed_millis(50))
            .with_connect_timeout(Duration::from_millis(500));
        let conn = Connection::connect(options).await.unwrap();

        // The actor connects, gets dropped, sleeps `reconnect_sleep`, then
        // reconnects in the background; retry past the circuit breaker
        // opening in between (scenario S4: a fresh GET succeeds once the
        // sleep has elapsed).
        let reply = loop {
            match conn
                .call(Command::new().arg("GET").arg("foo"), Duration::from_secs(1))
                .await
            {
                Ok(reply) => break reply,
                Err(Error::NoConnection) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    continue;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        };
        assert_eq!(reply, Reply::Bulk(Some(Bytes::from_static(b"bar"))));
    }
}
