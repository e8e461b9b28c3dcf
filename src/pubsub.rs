//! Pubsub actor (C5): reuses the RESP codec and connection lifecycle, but
//! replaces C3's FIFO/caller-matching dispatch with a back-pressured
//! "active-once" delivery discipline to a single controlling subscriber.

use crate::config::ConnectionOptions;
use crate::error::{Error, Result};
use crate::resp::{Command, Decoder, Reply};
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc;

/// One classified pubsub event, as delivered to the controlling subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubsubEvent {
    Subscribed { channel: Bytes, count: i64 },
    Unsubscribed { channel: Bytes, count: i64 },
    PSubscribed { pattern: Bytes, count: i64 },
    PUnsubscribed { pattern: Bytes, count: i64 },
    Message { channel: Bytes, payload: Bytes },
    PMessage { pattern: Bytes, channel: Bytes, payload: Bytes },
    /// The connection (re)established and the current subscription set was
    /// replayed.
    Connected,
    /// The connection was lost; a reconnect attempt will follow per the
    /// configured reconnect policy.
    Disconnected,
    /// `msg_queue` overflowed and was discarded under `QueueBehaviour::Drop`.
    QueueOverflow,
}

enum PubsubCommand {
    Subscribe(Vec<Bytes>),
    PSubscribe(Vec<Bytes>),
    Unsubscribe(Vec<Bytes>),
    PUnsubscribe(Vec<Bytes>),
    Control(mpsc::UnboundedSender<PubsubEvent>),
    Ack,
}

/// Handle to a running pubsub actor.
#[derive(Clone)]
pub struct PubsubConnection {
    inbox: mpsc::Sender<PubsubCommand>,
}

impl PubsubConnection {
    pub async fn connect(
        options: ConnectionOptions,
        pubsub_options: crate::config::PubsubOptions,
        controller: mpsc::UnboundedSender<PubsubEvent>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(256);
        let reconnect_enabled = options.reconnect.is_enabled();

        let initial_transport = if reconnect_enabled {
            None
        } else {
            match crate::actor::connect_and_handshake(&options).await {
                Ok(t) => Some(t),
                Err(e) => return Err(Error::ConnectionError(e.to_string())),
            }
        };

        let actor = PubsubActor {
            options,
            pubsub_options,
            inbox: rx,
            decoder: Decoder::new(),
            subscriptions: HashSet::new(),
            psubscriptions: HashSet::new(),
            controller,
            msg_state: MsgState::NeedAck,
            msg_queue: VecDeque::new(),
            terminate: false,
        };
        tokio::spawn(actor.run(initial_transport));

        Ok(PubsubConnection { inbox: tx })
    }

    pub async fn subscribe(&self, channels: Vec<Bytes>) -> Result<()> {
        self.inbox
            .send(PubsubCommand::Subscribe(channels))
            .await
            .map_err(|_| Error::Closed)
    }

    pub async fn psubscribe(&self, patterns: Vec<Bytes>) -> Result<()> {
        self.inbox
            .send(PubsubCommand::PSubscribe(patterns))
            .await
            .map_err(|_| Error::Closed)
    }

    pub async fn unsubscribe(&self, channels: Vec<Bytes>) -> Result<()> {
        self.inbox
            .send(PubsubCommand::Unsubscribe(channels))
            .await
            .map_err(|_| Error::Closed)
    }

    pub async fn punsubscribe(&self, patterns: Vec<Bytes>) -> Result<()> {
        self.inbox
            .send(PubsubCommand::PUnsubscribe(patterns))
            .await
            .map_err(|_| Error::Closed)
    }

    /// Atomically reassign the controlling subscriber and re-arm the
    /// active-once state: exactly as after the initial connect, the new
    /// subscriber must call [`ack`] once to signal it's ready before
    /// anything is delivered to it.
    pub async fn control(&self, new_subscriber: mpsc::UnboundedSender<PubsubEvent>) -> Result<()> {
        self.inbox
            .send(PubsubCommand::Control(new_subscriber))
            .await
            .map_err(|_| Error::Closed)
    }

    /// Acknowledge the most recently delivered message, allowing the next
    /// queued (or future) event to be sent.
    pub async fn ack(&self) -> Result<()> {
        self.inbox
            .send(PubsubCommand::Ack)
            .await
            .map_err(|_| Error::Closed)
    }
}

#[derive(PartialEq, Eq)]
enum MsgState {
    NeedAck,
    Ready,
}

enum ActorState {
    Connecting,
    Disconnected,
    Ready(Transport),
    Terminated,
}

struct PubsubActor {
    options: ConnectionOptions,
    pubsub_options: crate::config::PubsubOptions,
    inbox: mpsc::Receiver<PubsubCommand>,
    decoder: Decoder,
    subscriptions: HashSet<Bytes>,
    psubscriptions: HashSet<Bytes>,
    controller: mpsc::UnboundedSender<PubsubEvent>,
    msg_state: MsgState,
    msg_queue: VecDeque<PubsubEvent>,
    /// Set by `emit` under `QueueBehaviour::Exit` overflow; checked after
    /// every state transition so the actor stops cleanly from whichever
    /// state it was in when the overflow happened.
    terminate: bool,
}

impl PubsubActor {
    async fn run(mut self, initial_transport: Option<Transport>) {
        let mut state = match initial_transport {
            Some(t) => ActorState::Ready(t),
            None => ActorState::Connecting,
        };

        loop {
            if self.terminate {
                break;
            }
            state = match state {
                ActorState::Connecting => self.do_connect().await,
                ActorState::Disconnected => self.wait_disconnected().await,
                ActorState::Ready(transport) => self.run_ready(transport).await,
                ActorState::Terminated => break,
            };
        }

        tracing::debug!("pubsub actor terminated");
    }

    async fn do_connect(&mut self) -> ActorState {
        match crate::actor::connect_and_handshake(&self.options).await {
            Ok(mut transport) => {
                self.decoder = Decoder::new();
                if let Err(e) = self.resubscribe_all(&mut transport).await {
                    tracing::warn!(error = %e, "resubscribe failed after connect");
                    if self.options.reconnect.is_enabled() {
                        return ActorState::Disconnected;
                    }
                    return ActorState::Terminated;
                }
                self.emit(PubsubEvent::Connected);
                ActorState::Ready(transport)
            }
            Err(e) => {
                tracing::warn!(error = %e, "pubsub connect failed");
                if self.options.reconnect.is_enabled() {
                    ActorState::Disconnected
                } else {
                    ActorState::Terminated
                }
            }
        }
    }

    async fn resubscribe_all(&self, transport: &mut Transport) -> Result<()> {
        if !self.subscriptions.is_empty() {
            let mut cmd = Command::new().arg("SUBSCRIBE");
            cmd = cmd.args(self.subscriptions.iter().cloned());
            transport.write_all(&crate::resp::encode(&cmd)?).await?;
        }
        if !self.psubscriptions.is_empty() {
            let mut cmd = Command::new().arg("PSUBSCRIBE");
            cmd = cmd.args(self.psubscriptions.iter().cloned());
            transport.write_all(&crate::resp::encode(&cmd)?).await?;
        }
        Ok(())
    }

    async fn wait_disconnected(&mut self) -> ActorState {
        let sleep_for = match self.options.reconnect {
            crate::config::ReconnectPolicy::Fixed(d) => d,
            crate::config::ReconnectPolicy::NoReconnect => {
                unreachable!("Disconnected only entered when reconnect is enabled")
            }
        };
        let sleep = tokio::time::sleep(sleep_for);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return ActorState::Connecting,
                maybe_cmd = self.inbox.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command_offline(cmd),
                        None => return ActorState::Terminated,
                    }
                }
            }
        }
    }

    /// While disconnected, subscription-set changes are still recorded (so
    /// the next successful connect replays the up-to-date set); control and
    /// ack still apply to the active-once state machine.
    fn handle_command_offline(&mut self, cmd: PubsubCommand) {
        match cmd {
            PubsubCommand::Subscribe(chans) => self.subscriptions.extend(chans),
            PubsubCommand::PSubscribe(pats) => self.psubscriptions.extend(pats),
            PubsubCommand::Unsubscribe(chans) => {
                for c in chans {
                    self.subscriptions.remove(&c);
                }
            }
            PubsubCommand::PUnsubscribe(pats) => {
                for p in pats {
                    self.psubscriptions.remove(&p);
                }
            }
            PubsubCommand::Control(new_subscriber) => self.recontrol(new_subscriber),
            PubsubCommand::Ack => self.handle_ack(),
        }
    }

    async fn run_ready(&mut self, mut transport: Transport) -> ActorState {
        let mut read_buf = BytesMut::with_capacity(8 * 1024);

        loop {
            tokio::select! {
                biased;
                maybe_cmd = self.inbox.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if let Err(e) = self.handle_command_online(&mut transport, cmd).await {
                                tracing::warn!(error = %e, "pubsub write failed; connection lost");
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
                            tracing::warn!("pubsub peer closed the connection");
                            return self.on_connection_lost(&mut transport).await;
                        }
                        Ok(_) => {
                            let bytes = read_buf.split();
                            match self.decoder.feed(&bytes) {
                                Ok(replies) => {
                                    for reply in replies {
                                        if let Some(event) = classify(&reply) {
                                            self.emit(event);
                                        }
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "pubsub decode error; connection lost");
                                    return self.on_connection_lost(&mut transport).await;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "pubsub read failed; connection lost");
                            return self.on_connection_lost(&mut transport).await;
                        }
                    }
                }
            }

            if self.terminate {
                let _ = transport.shutdown().await;
                return ActorState::Terminated;
            }
        }
    }

    async fn handle_command_online(&mut self, transport: &mut Transport, cmd: PubsubCommand) -> Result<()> {
        match cmd {
            PubsubCommand::Subscribe(chans) => {
                if chans.is_empty() {
                    return Ok(());
                }
                self.subscriptions.extend(chans.iter().cloned());
                let cmd = Command::new().arg("SUBSCRIBE").args(chans);
                transport.write_all(&crate::resp::encode(&cmd)?).await?;
            }
            PubsubCommand::PSubscribe(pats) => {
                if pats.is_empty() {
                    return Ok(());
                }
                self.psubscriptions.extend(pats.iter().cloned());
                let cmd = Command::new().arg("PSUBSCRIBE").args(pats);
                transport.write_all(&crate::resp::encode(&cmd)?).await?;
            }
            PubsubCommand::Unsubscribe(chans) => {
                for c in &chans {
                    self.subscriptions.remove(c);
                }
                if chans.is_empty() {
                    return Ok(());
                }
                let cmd = Command::new().arg("UNSUBSCRIBE").args(chans);
                transport.write_all(&crate::resp::encode(&cmd)?).await?;
            }
            PubsubCommand::PUnsubscribe(pats) => {
                for p in &pats {
                    self.psubscriptions.remove(p);
                }
                if pats.is_empty() {
                    return Ok(());
                }
                let cmd = Command::new().arg("PUNSUBSCRIBE").args(pats);
                transport.write_all(&crate::resp::encode(&cmd)?).await?;
            }
            PubsubCommand::Control(new_subscriber) => self.recontrol(new_subscriber),
            PubsubCommand::Ack => self.handle_ack(),
        }
        Ok(())
    }

    async fn on_connection_lost(&mut self, transport: &mut Transport) -> ActorState {
        let _ = transport.shutdown().await;
        self.decoder = Decoder::new();
        self.emit(PubsubEvent::Disconnected);
        if self.options.reconnect.is_enabled() {
            ActorState::Disconnected
        } else {
            ActorState::Terminated
        }
    }

    fn recontrol(&mut self, new_subscriber: mpsc::UnboundedSender<PubsubEvent>) {
        self.controller = new_subscriber;
        // Re-arm: the new subscriber must call `ack` to signal readiness,
        // exactly like right after connect.
        self.msg_state = MsgState::NeedAck;
    }

    fn handle_ack(&mut self) {
        match self.msg_queue.pop_front() {
            Some(next) => {
                let _ = self.controller.send(next);
            }
            None => {
                self.msg_state = MsgState::Ready;
            }
        }
    }

    /// Active-once delivery: send immediately if the controller is ready
    /// for a message, otherwise queue it (subject to the bound/overflow
    /// policy) until the next `ack`.
    fn emit(&mut self, event: PubsubEvent) {
        if self.msg_state == MsgState::Ready {
            self.msg_state = MsgState::NeedAck;
            let _ = self.controller.send(event);
            return;
        }

        match self.pubsub_options.max_queue_size {
            Some(max) if self.msg_queue.len() >= max => match self.pubsub_options.queue_behaviour {
                crate::config::QueueBehaviour::Drop => {
                    self.msg_queue.clear();
                    self.msg_queue.push_back(PubsubEvent::QueueOverflow);
                }
                crate::config::QueueBehaviour::Exit => {
                    tracing::error!("pubsub msg_queue overflow with queue_behaviour=exit; terminating");
                    self.msg_queue.clear();
                    self.terminate = true;
                }
            },
            _ => self.msg_queue.push_back(event),
        }
    }
}

fn classify(reply: &Reply) -> Option<PubsubEvent> {
    let Reply::Array(Some(items)) = reply else {
        return None;
    };
    let kind = match items.first() {
        Some(Reply::Bulk(Some(b))) => b.clone(),
        _ => return None,
    };

    match kind.as_ref() {
        b"subscribe" => {
            let channel = bulk_at(items, 1)?;
            let count = int_at(items, 2)?;
            Some(PubsubEvent::Subscribed { channel, count })
        }
        b"unsubscribe" => {
            let channel = bulk_at(items, 1)?;
            let count = int_at(items, 2)?;
            Some(PubsubEvent::Unsubscribed { channel, count })
        }
        b"psubscribe" => {
            let pattern = bulk_at(items, 1)?;
            let count = int_at(items, 2)?;
            Some(PubsubEvent::PSubscribed { pattern, count })
        }
        b"punsubscribe" => {
            let pattern = bulk_at(items, 1)?;
            let count = int_at(items, 2)?;
            Some(PubsubEvent::PUnsubscribed { pattern, count })
        }
        b"message" => {
            let channel = bulk_at(items, 1)?;
            let payload = bulk_at(items, 2)?;
            Some(PubsubEvent::Message { channel, payload })
        }
        b"pmessage" => {
            let pattern = bulk_at(items, 1)?;
            let channel = bulk_at(items, 2)?;
            let payload = bulk_at(items, 3)?;
            Some(PubsubEvent::PMessage {
                pattern,
                channel,
                payload,
            })
        }
        _ => None,
    }
}

fn bulk_at(items: &[Reply], idx: usize) -> Option<Bytes> {
    match items.get(idx) {
        Some(Reply::Bulk(Some(b))) => Some(b.clone()),
        _ => None,
    }
}

fn int_at(items: &[Reply], idx: usize) -> Option<i64> {
    match items.get(idx) {
        Some(Reply::Integer(b)) => std::str::from_utf8(b).ok()?.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PubsubOptions, QueueBehaviour, ReconnectPolicy};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

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

    #[test]
    fn classify_message_and_pmessage() {
        let msg = Reply::Array(Some(vec![
            Reply::Bulk(Some(Bytes::from_static(b"message"))),
            Reply::Bulk(Some(Bytes::from_static(b"chan"))),
            Reply::Bulk(Some(Bytes::from_static(b"hello"))),
        ]));
        assert_eq!(
            classify(&msg),
            Some(PubsubEvent::Message {
                channel: Bytes::from_static(b"chan"),
                payload: Bytes::from_static(b"hello"),
            })
        );

        let pmsg = Reply::Array(Some(vec![
            Reply::Bulk(Some(Bytes::from_static(b"pmessage"))),
            Reply::Bulk(Some(Bytes::from_static(b"ch*"))),
            Reply::Bulk(Some(Bytes::from_static(b"chan"))),
            Reply::Bulk(Some(Bytes::from_static(b"hello"))),
        ]));
        assert_eq!(
            classify(&pmsg),
            Some(PubsubEvent::PMessage {
                pattern: Bytes::from_static(b"ch*"),
                channel: Bytes::from_static(b"chan"),
                payload: Bytes::from_static(b"hello"),
            })
        );
    }

    #[tokio::test]
    async fn active_once_back_pressure_holds_second_message_until_ack() {
        let addr = fake_server(|mut sock| {
            Box::pin(async move {
                let mut buf = vec![0u8; 4096];
                let _ = sock.read(&mut buf).await.unwrap(); // SUBSCRIBE
                sock.write_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nchan\r\n:1\r\n")
                    .await
                    .unwrap();
                sock.write_all(b"*3\r\n$7\r\nmessage\r\n$4\r\nchan\r\n$2\r\nm1\r\n")
                    .await
                    .unwrap();
                sock.write_all(b"*3\r\n$7\r\nmessage\r\n$4\r\nchan\r\n$2\r\nm2\r\n")
                    .await
                    .unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            })
        })
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = ConnectionOptions::tcp("127.0.0.1", addr.port())
            .with_reconnect(ReconnectPolicy::NoReconnect);
        let conn = PubsubConnection::connect(options, PubsubOptions::default(), tx)
            .await
            .unwrap();

        // The controller starts in `need_ack`: this first `ack` has nothing
        // queued yet to flush, it only signals readiness for what comes next.
        conn.ack().await.unwrap();
        conn.subscribe(vec![Bytes::from_static(b"chan")])
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, PubsubEvent::Subscribed { .. }));

        // Only after acking the Subscribed event does the first message arrive.
        conn.ack().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second,
            PubsubEvent::Message {
                channel: Bytes::from_static(b"chan"),
                payload: Bytes::from_static(b"m1"),
            }
        );

        // m2 must not have been delivered yet: no ack for m1 was sent.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );

        conn.ack().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(
            third,
            PubsubEvent::Message {
                channel: Bytes::from_static(b"chan"),
                payload: Bytes::from_static(b"m2"),
            }
        );
    }

    #[test]
    fn control_rearms_need_ack_even_from_ready() {
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let mut actor = PubsubActor {
            options: ConnectionOptions::tcp("127.0.0.1", 0),
            pubsub_options: PubsubOptions::default(),
            inbox: mpsc::channel(1).1,
            decoder: Decoder::new(),
            subscriptions: HashSet::new(),
            psubscriptions: HashSet::new(),
            controller: tx1,
            msg_state: MsgState::Ready,
            msg_queue: VecDeque::new(),
            terminate: false,
        };

        actor.recontrol(tx2);
        assert!(matches!(actor.msg_state, MsgState::NeedAck));

        // The new controller hasn't acked yet, so a fresh event is queued
        // rather than delivered straight away.
        actor.emit(PubsubEvent::Connected);
        assert_eq!(actor.msg_queue.len(), 1);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn queue_overflow_drop_replaces_queue_with_overflow_notice() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut actor = PubsubActor {
            options: ConnectionOptions::tcp("127.0.0.1", 0),
            pubsub_options: PubsubOptions {
                max_queue_size: Some(1),
                queue_behaviour: QueueBehaviour::Drop,
            },
            inbox: mpsc::channel(1).1,
            decoder: Decoder::new(),
            subscriptions: HashSet::new(),
            psubscriptions: HashSet::new(),
            controller: tx,
            msg_state: MsgState::NeedAck,
            msg_queue: VecDeque::new(),
            terminate: false,
        };

        actor.emit(PubsubEvent::Message {
            channel: Bytes::from_static(b"a"),
            payload: Bytes::from_static(b"1"),
        });
        actor.emit(PubsubEvent::Message {
            channel: Bytes::from_static(b"a"),
            payload: Bytes::from_static(b"2"),
        });

        assert_eq!(actor.msg_queue.len(), 1);
        assert_eq!(actor.msg_queue.front(), Some(&PubsubEvent::QueueOverflow));
    }

    #[test]
    fn queue_overflow_exit_requests_termination() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut actor = PubsubActor {
            options: ConnectionOptions::tcp("127.0.0.1", 0),
            pubsub_options: PubsubOptions {
                max_queue_size: Some(1),
                queue_behaviour: QueueBehaviour::Exit,
            },
            inbox: mpsc::channel(1).1,
            decoder: Decoder::new(),
            subscriptions: HashSet::new(),
            psubscriptions: HashSet::new(),
            controller: tx,
            msg_state: MsgState::NeedAck,
            msg_queue: VecDeque::new(),
            terminate: false,
        };

        actor.emit(PubsubEvent::Message {
            channel: Bytes::from_static(b"a"),
            payload: Bytes::from_static(b"1"),
        });
        assert!(!actor.terminate);
        actor.emit(PubsubEvent::Message {
            channel: Bytes::from_static(b"a"),
            payload: Bytes::from_static(b"2"),
        });
        assert!(actor.terminate);
    }
}
