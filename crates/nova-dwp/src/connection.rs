use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{
        encode_command, DwpReader, DwpWriter, Packet, HANDSHAKE, HEADER_LEN, MAX_PACKET_BYTES,
    },
    commands::{command_set, event, vm},
    error::{status, DwpError, Result},
    events::{decode_event_set, EventSet},
    poison::lock,
    transport::{read_packet, Transport},
    types::{Feature, VersionInfo, VmVersion},
};

/// Version assumed for decoding until the peer's version is known.
const BASELINE_VERSION: VersionInfo = VersionInfo::new(2, 0);

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub handshake_timeout: Duration,
    /// Upper bound on a single outbound write; `None` waits indefinitely.
    pub write_timeout: Option<Duration>,
    pub max_packet_bytes: usize,
    /// Version announced to the peer; the negotiated version never exceeds it.
    pub local_version: VersionInfo,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Some(Duration::from_secs(10)),
            max_packet_bytes: MAX_PACKET_BYTES,
            local_version: VersionInfo::LOCAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    Crashed,
}

impl ConnectionState {
    fn accepts_traffic(self) -> bool {
        matches!(self, ConnectionState::Handshaking | ConnectionState::Connected)
    }
}

#[derive(Debug)]
struct StateCell {
    state: ConnectionState,
    crash: Option<(String, u64)>,
}

enum Pending {
    Waiter(oneshot::Sender<Result<Vec<u8>>>),
    Replies {
        tx: mpsc::Sender<Result<Vec<u8>>>,
        remaining: usize,
    },
}

impl Pending {
    fn fail(self, err: DwpError) {
        match self {
            Pending::Waiter(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Replies { tx, .. } => {
                let _ = tx.try_send(Err(err));
            }
        }
    }
}

struct Outbound {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// `Some` while buffering; holds encoded packets in send order.
    buffered: Option<Vec<Vec<u8>>>,
}

enum Exit {
    Disconnected,
    Crashed { dump: String, hash: u64 },
}

struct Inner {
    outbound: tokio::sync::Mutex<Outbound>,
    pending: Mutex<HashMap<u32, Pending>>,
    next_id: AtomicU32,
    state: Mutex<StateCell>,
    peer: OnceLock<VmVersion>,
    negotiated: OnceLock<VersionInfo>,
    events: mpsc::UnboundedSender<EventSet>,
    shutdown: CancellationToken,
    closed: CancellationToken,
    config: ConnectionConfig,
}

/// The protocol engine: one per debuggee connection.
///
/// Cloning is cheap; all clones share the same connection. A background task
/// owns the read half and routes replies to their waiters and composite
/// events to the channel passed to [`Connection::connect`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("version", &self.version())
            .finish()
    }
}

impl Connection {
    /// Perform the handshake over `transport` and negotiate the protocol
    /// version.
    ///
    /// Events (including the final synthetic disconnect) are pushed into
    /// `events`.
    pub async fn connect<T: Transport>(
        transport: T,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<EventSet>,
    ) -> Result<Self> {
        let (mut reader, mut writer) = transport.into_split();

        let mut magic = [0u8; HANDSHAKE.len()];
        tokio::time::timeout(config.handshake_timeout, reader.read_exact(&mut magic))
            .await
            .map_err(|_| DwpError::Timeout)??;
        if magic != *HANDSHAKE {
            return Err(DwpError::HandshakeFailed {
                received: String::from_utf8_lossy(&magic).into_owned(),
            });
        }
        tokio::time::timeout(config.handshake_timeout, async {
            writer.write_all(HANDSHAKE).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| DwpError::Timeout)??;

        let inner = Arc::new(Inner {
            outbound: tokio::sync::Mutex::new(Outbound {
                writer: Box::new(writer),
                buffered: None,
            }),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            state: Mutex::new(StateCell {
                state: ConnectionState::Handshaking,
                crash: None,
            }),
            peer: OnceLock::new(),
            negotiated: OnceLock::new(),
            events,
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));

        let conn = Self { inner };
        if let Err(err) = conn.negotiate().await {
            conn.shutdown();
            return Err(err);
        }
        Ok(conn)
    }

    async fn negotiate(&self) -> Result<()> {
        let payload = self
            .request(command_set::VM, vm::VERSION, Vec::new())
            .await?;
        let mut r = DwpReader::new(&payload);
        let description = r.read_string()?;
        let major = r.read_i32()?;
        let minor = r.read_i32()?;
        let peer = VmVersion {
            description,
            version: VersionInfo::new(major.max(0) as u32, minor.max(0) as u32),
        };
        let negotiated = peer.version.min(self.inner.config.local_version);
        tracing::info!(
            target: "nova.dwp",
            peer = %peer.version,
            description = %peer.description,
            negotiated = %negotiated,
            "negotiated protocol version"
        );
        let _ = self.inner.peer.set(peer);
        let _ = self.inner.negotiated.set(negotiated);

        if Feature::SetProtocolVersion.is_available(negotiated) {
            let local = self.inner.config.local_version;
            let mut w = DwpWriter::new();
            w.write_i32(local.major as i32);
            w.write_i32(local.minor as i32);
            match self
                .request(command_set::VM, vm::SET_PROTOCOL_VERSION, w.into_vec())
                .await
            {
                Ok(_) => {}
                Err(DwpError::NotImplemented) => {
                    tracing::warn!(
                        target: "nova.dwp",
                        "peer rejected SET_PROTOCOL_VERSION; continuing"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let mut state = lock(&self.inner.state, "Connection.negotiate");
        if state.state == ConnectionState::Handshaking {
            state.state = ConnectionState::Connected;
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state, "Connection.state").state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The negotiated protocol version: `min(peer, local)`.
    pub fn version(&self) -> VersionInfo {
        self.inner.version()
    }

    /// The peer's self-reported version, available once connected.
    pub fn peer_version(&self) -> Option<&VmVersion> {
        self.inner.peer.get()
    }

    /// Fail with [`DwpError::NotSupported`] if the negotiated version
    /// predates `feature`.
    pub fn require(&self, feature: Feature) -> Result<()> {
        let negotiated = self.version();
        if feature.is_available(negotiated) {
            Ok(())
        } else {
            Err(DwpError::NotSupported {
                feature: feature.name(),
                required: feature.required_version(),
                negotiated,
            })
        }
    }

    /// Send a command without tracking its reply. Returns the request id.
    pub async fn send(&self, command_set: u8, command: u8, payload: Vec<u8>) -> Result<u32> {
        self.dispatch(command_set, command, &payload, None, false)
            .await
    }

    /// Send a command and wait for its reply payload.
    ///
    /// Resolves when the reply arrives or the connection ends; there is no
    /// reply timeout. A non-zero reply status becomes an error.
    pub async fn request(&self, command_set: u8, command: u8, payload: Vec<u8>) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(command_set, command, &payload, Some(Pending::Waiter(tx)), true)
            .await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.inner.closed_error()),
        }
    }

    /// Send a command that the peer answers `replies` times under the same id.
    ///
    /// Valid while buffering; the replies are collected through the returned
    /// handle.
    pub async fn request_async(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
        replies: usize,
    ) -> Result<PendingReplies> {
        if replies == 0 {
            return Err(DwpError::InvalidState("request expects at least one reply"));
        }
        let (tx, rx) = mpsc::channel(replies);
        let id = self
            .dispatch(
                command_set,
                command,
                &payload,
                Some(Pending::Replies {
                    tx,
                    remaining: replies,
                }),
                false,
            )
            .await?;
        Ok(PendingReplies {
            id,
            rx,
            remaining: replies,
            inner: self.inner.clone(),
        })
    }

    async fn dispatch(
        &self,
        command_set: u8,
        command: u8,
        payload: &[u8],
        pending: Option<Pending>,
        blocking: bool,
    ) -> Result<u32> {
        // Every length prefix inside an accepted payload fits in an `i32`.
        let limit = self.inner.config.max_packet_bytes.min(i32::MAX as usize);
        if payload.len() > limit.saturating_sub(HEADER_LEN) {
            return Err(DwpError::InvalidState(
                "command payload exceeds the packet size limit",
            ));
        }
        let mut outbound = self.inner.outbound.lock().await;
        if blocking && outbound.buffered.is_some() {
            return Err(DwpError::InvalidState(
                "blocking request issued while buffering",
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let tracked = pending.is_some();
        if let Some(pending) = pending {
            lock(&self.inner.pending, "Connection.dispatch").insert(id, pending);
        }
        // The receive task marks the state before draining `pending`, so a
        // request registered after the drain is caught here.
        if let Err(err) = self.inner.ensure_open() {
            self.inner.forget(id);
            return Err(err);
        }

        let packet = encode_command(id, command_set, command, payload);
        tracing::debug!(
            target: "nova.dwp",
            id,
            command_set,
            command,
            len = payload.len(),
            tracked,
            buffered = outbound.buffered.is_some(),
            "sending command"
        );
        match outbound.buffered.as_mut() {
            Some(buffer) => buffer.push(packet),
            None => {
                if let Err(err) = self.inner.write(&mut outbound, &packet).await {
                    self.inner.forget(id);
                    return Err(err);
                }
            }
        }
        Ok(id)
    }

    /// Divert outbound packets into a buffer until [`Connection::stop_buffering`].
    pub async fn start_buffering(&self) {
        let mut outbound = self.inner.outbound.lock().await;
        outbound.buffered.get_or_insert_with(Vec::new);
    }

    /// Flush the buffered packets as one write, in send order.
    pub async fn stop_buffering(&self) -> Result<()> {
        let mut outbound = self.inner.outbound.lock().await;
        let Some(packets) = outbound.buffered.take() else {
            return Ok(());
        };
        if packets.is_empty() {
            return Ok(());
        }
        let bytes = packets.concat();
        tracing::debug!(
            target: "nova.dwp",
            packets = packets.len(),
            bytes = bytes.len(),
            "flushing buffered commands"
        );
        self.inner.write(&mut outbound, &bytes).await
    }

    pub async fn is_buffering(&self) -> bool {
        self.inner.outbound.lock().await.buffered.is_some()
    }

    /// Ask the debuggee to detach, then tear the connection down.
    pub async fn dispose(&self) {
        if self.inner.ensure_open().is_ok() {
            if let Err(err) = self.send(command_set::VM, vm::DISPOSE, Vec::new()).await {
                tracing::debug!(target: "nova.dwp", error = %err, "VM.DISPOSE failed");
            }
        }
        self.shutdown();
        self.closed().await;
    }

    /// Force teardown: unblocks the receive task, which then fails every
    /// pending request and emits the disconnect event.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Resolves once the receive task has finished tearing down.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }
}

/// Replies to a command answered more than once under the same id.
pub struct PendingReplies {
    id: u32,
    rx: mpsc::Receiver<Result<Vec<u8>>>,
    remaining: usize,
    inner: Arc<Inner>,
}

impl PendingReplies {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// The next reply payload, or `None` once every expected reply arrived.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>>> {
        if self.remaining == 0 {
            return None;
        }
        match self.rx.recv().await {
            Some(Err(err)) if err.is_connection_lost() => {
                self.remaining = 0;
                Some(Err(err))
            }
            Some(result) => {
                self.remaining -= 1;
                Some(result)
            }
            None => {
                self.remaining = 0;
                Some(Err(self.inner.closed_error()))
            }
        }
    }
}

impl Inner {
    fn version(&self) -> VersionInfo {
        self.negotiated.get().copied().unwrap_or(BASELINE_VERSION)
    }

    fn ensure_open(&self) -> Result<()> {
        let state = lock(&self.state, "Inner.ensure_open");
        if state.state.accepts_traffic() {
            Ok(())
        } else {
            Err(closed_error_for(&state))
        }
    }

    fn closed_error(&self) -> DwpError {
        closed_error_for(&lock(&self.state, "Inner.closed_error"))
    }

    fn forget(&self, id: u32) {
        lock(&self.pending, "Inner.forget").remove(&id);
    }

    /// Write one or more whole packets.
    ///
    /// A write that does not complete, by failing, timing out or being
    /// dropped, may leave part of a packet on the stream, so it tears the
    /// connection down.
    async fn write(&self, outbound: &mut Outbound, bytes: &[u8]) -> Result<()> {
        let torn = self.shutdown.clone().drop_guard();
        let write = async {
            outbound.writer.write_all(bytes).await?;
            outbound.writer.flush().await?;
            Ok::<_, DwpError>(())
        };
        let write = async {
            match self.config.write_timeout {
                Some(limit) => tokio::time::timeout(limit, write)
                    .await
                    .map_err(|_| DwpError::Timeout)?,
                None => write.await,
            }
        };
        let res = tokio::select! {
            _ = self.shutdown.cancelled() => Err(self.closed_error()),
            res = write => res,
        };
        match res {
            Ok(()) => {
                torn.disarm();
                Ok(())
            }
            Err(err) => {
                if !err.is_connection_lost() {
                    tracing::warn!(
                        target: "nova.dwp",
                        error = %err,
                        "outbound write failed; closing connection"
                    );
                }
                drop(torn);
                Err(err)
            }
        }
    }

    fn status_error(&self, error_code: u16, payload: &[u8]) -> DwpError {
        let message = if error_code == status::INVALID_ARGUMENT
            && Feature::ErrorMessages.is_available(self.version())
            && !payload.is_empty()
        {
            DwpReader::new(payload).read_string().ok()
        } else {
            None
        };
        DwpError::from_status(error_code, message)
    }

    fn complete(&self, id: u32, error_code: u16, payload: Vec<u8>) {
        let result = if error_code == status::NONE {
            Ok(payload)
        } else {
            Err(self.status_error(error_code, &payload))
        };

        let mut pending = lock(&self.pending, "Inner.complete");
        match pending.remove(&id) {
            Some(Pending::Waiter(tx)) => {
                drop(pending);
                let _ = tx.send(result);
            }
            Some(Pending::Replies { tx, remaining }) => {
                if remaining > 1 {
                    pending.insert(
                        id,
                        Pending::Replies {
                            tx: tx.clone(),
                            remaining: remaining - 1,
                        },
                    );
                }
                drop(pending);
                if tx.try_send(result).is_err() {
                    tracing::debug!(target: "nova.dwp", id, "reply receiver dropped");
                }
            }
            None => {
                tracing::warn!(target: "nova.dwp", id, error_code, "reply for unknown request id");
            }
        }
    }

    async fn terminate(&self, exit: Exit) {
        let err = {
            let mut state = lock(&self.state, "Inner.terminate");
            match exit {
                Exit::Disconnected => state.state = ConnectionState::Disconnected,
                Exit::Crashed { dump, hash } => {
                    state.state = ConnectionState::Crashed;
                    state.crash = Some((dump, hash));
                }
            }
            closed_error_for(&state)
        };

        let pending = std::mem::take(&mut *lock(&self.pending, "Inner.terminate"));
        for (_, waiter) in pending {
            waiter.fail(err.duplicate());
        }

        self.shutdown.cancel();
        {
            let mut outbound = self.outbound.lock().await;
            outbound.buffered = None;
            if let Err(err) = outbound.writer.shutdown().await {
                tracing::debug!(target: "nova.dwp", error = %err, "transport shutdown failed");
            }
        }

        tracing::info!(target: "nova.dwp", reason = %err, "connection closed");
        let _ = self.events.send(EventSet::disconnect());
        self.closed.cancel();
    }
}

fn closed_error_for(state: &StateCell) -> DwpError {
    match (&state.state, &state.crash) {
        (ConnectionState::Crashed, Some((dump, hash))) => DwpError::Crashed {
            dump: dump.clone(),
            hash: *hash,
        },
        _ => DwpError::Disconnected,
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, inner: Arc<Inner>) {
    let exit = loop {
        let packet = tokio::select! {
            _ = inner.shutdown.cancelled() => break Exit::Disconnected,
            res = read_packet(&mut reader, inner.config.max_packet_bytes) => res,
        };

        match packet {
            Ok(None) => {
                tracing::debug!(target: "nova.dwp", "peer closed the connection");
                break Exit::Disconnected;
            }
            Err(DwpError::Io(err)) => {
                tracing::debug!(target: "nova.dwp", error = %err, "read failed");
                break Exit::Disconnected;
            }
            Err(err) => {
                tracing::error!(
                    target: "nova.dwp",
                    error = %err,
                    "protocol desync; closing connection"
                );
                break Exit::Disconnected;
            }
            Ok(Some(Packet::Reply {
                id,
                error_code,
                payload,
            })) => {
                tracing::debug!(
                    target: "nova.dwp",
                    id,
                    error_code,
                    len = payload.len(),
                    "received reply"
                );
                inner.complete(id, error_code, payload);
            }
            Ok(Some(Packet::Command {
                command_set: command_set::EVENT,
                command: event::COMPOSITE,
                payload,
                ..
            })) => match decode_event_set(&payload, inner.version()) {
                Ok(set) => {
                    tracing::debug!(
                        target: "nova.dwp",
                        count = set.events.len(),
                        "received composite event"
                    );
                    let crash = set.crash().map(|(hash, dump)| (dump.to_string(), hash));
                    let _ = inner.events.send(set);
                    if let Some((dump, hash)) = crash {
                        tracing::error!(target: "nova.dwp", hash, "debuggee crashed");
                        break Exit::Crashed { dump, hash };
                    }
                }
                Err(err) => {
                    tracing::error!(
                        target: "nova.dwp",
                        error = %err,
                        "undecodable event packet; closing connection"
                    );
                    break Exit::Disconnected;
                }
            },
            Ok(Some(Packet::Command {
                id,
                command_set,
                command,
                ..
            })) => {
                tracing::warn!(
                    target: "nova.dwp",
                    id,
                    command_set,
                    command,
                    "ignoring unexpected command packet"
                );
            }
        }
    };

    inner.terminate(exit).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_reply, DwpWriter};
    use crate::events::{EventDetail, EventKind};
    use crate::mock::MockPeer;
    use crate::transport::Split;
    use crate::types::SuspendPolicy;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};

    async fn connected(
        version: VersionInfo,
    ) -> (Connection, MockPeer, mpsc::UnboundedReceiver<EventSet>) {
        connected_with(version, ConnectionConfig::default()).await
    }

    async fn connected_with(
        version: VersionInfo,
        config: ConnectionConfig,
    ) -> (Connection, MockPeer, mpsc::UnboundedReceiver<EventSet>) {
        let (stream, mut peer) = MockPeer::pair(version);
        let (tx, rx) = mpsc::unbounded_channel();
        let (conn, handshake) = tokio::join!(
            Connection::connect(stream, config, tx),
            peer.handshake()
        );
        handshake.unwrap();
        (conn.unwrap(), peer, rx)
    }

    fn crash_payload(hash: u64, dump: &str) -> Vec<u8> {
        let mut w = DwpWriter::new();
        w.write_u8(SuspendPolicy::None.as_u8());
        w.write_i32(1);
        w.write_u8(EventKind::Crash.as_u8().unwrap());
        w.write_i32(0);
        w.write_id(0);
        w.write_u64(hash);
        w.write_string(dump);
        w.into_vec()
    }

    #[tokio::test]
    async fn handshake_negotiates_minimum_version() {
        let (conn, _peer, _rx) = connected(VersionInfo::new(2, 45)).await;
        assert!(conn.is_connected());
        assert_eq!(conn.version(), VersionInfo::new(2, 45));
        assert_eq!(
            conn.peer_version().unwrap().version,
            VersionInfo::new(2, 45)
        );

        let (conn, _peer, _rx) = connected(VersionInfo::new(2, 99)).await;
        assert_eq!(conn.version(), VersionInfo::LOCAL);
    }

    #[tokio::test]
    async fn handshake_rejects_bad_magic() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"HTTP/1.1 200 ").await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = Connection::connect(client, ConnectionConfig::default(), tx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DwpError::HandshakeFailed { received } if received == "HTTP/1.1 200 "
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_during_handshake() {
        let (client, _server) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = Connection::connect(client, ConnectionConfig::default(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, DwpError::Timeout));
    }

    #[tokio::test]
    async fn set_protocol_version_rejection_is_not_fatal() {
        let (stream, mut peer) = MockPeer::pair(VersionInfo::LOCAL);
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer_side = async {
            peer.send_magic().await.unwrap();
            let version = peer.read_command().await.unwrap().unwrap();
            assert_eq!((version.command_set, version.command), (command_set::VM, vm::VERSION));
            peer.reply(version.id, &MockPeer::version_payload(VersionInfo::LOCAL))
                .await
                .unwrap();
            let announce = peer.read_command().await.unwrap().unwrap();
            assert_eq!(announce.command, vm::SET_PROTOCOL_VERSION);
            let mut r = DwpReader::new(&announce.payload);
            assert_eq!((r.read_i32().unwrap(), r.read_i32().unwrap()), (2, 58));
            peer.reply_error(announce.id, status::NOT_IMPLEMENTED, &[])
                .await
                .unwrap();
        };
        let (conn, ()) = tokio::join!(
            Connection::connect(stream, ConnectionConfig::default(), tx),
            peer_side
        );
        assert!(conn.unwrap().is_connected());
    }

    #[tokio::test]
    async fn old_peers_are_not_sent_set_protocol_version() {
        let (conn, mut peer, _rx) = connected(VersionInfo::new(2, 5)).await;
        assert_eq!(conn.version(), VersionInfo::new(2, 5));
        // The next command the peer sees is ours, not the announcement.
        conn.send(command_set::VM, vm::RESUME, Vec::new()).await.unwrap();
        let cmd = peer.read_command().await.unwrap().unwrap();
        assert_eq!(cmd.command, vm::RESUME);
        assert_eq!(cmd.id, 2);
    }

    #[tokio::test]
    async fn concurrent_requests_receive_their_own_replies() {
        let (conn, mut peer, _rx) = connected(VersionInfo::LOCAL).await;

        let mut tasks = Vec::new();
        for i in 0..8u32 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                let payload = i.to_be_bytes().to_vec();
                let reply = conn
                    .request(command_set::OBJECT_REF, 1, payload)
                    .await
                    .unwrap();
                (i, reply)
            }));
        }

        let mut commands = Vec::new();
        for _ in 0..8 {
            commands.push(peer.read_command().await.unwrap().unwrap());
        }
        let ids: std::collections::HashSet<u32> = commands.iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 8);

        // Answer in reverse order, echoing the request payload.
        for cmd in commands.iter().rev() {
            peer.reply(cmd.id, &cmd.payload).await.unwrap();
        }

        for task in tasks {
            let (i, reply) = task.await.unwrap();
            assert_eq!(reply, i.to_be_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_writing() {
        let config = ConnectionConfig {
            max_packet_bytes: 64,
            ..ConnectionConfig::default()
        };
        let (conn, mut peer, _rx) = connected_with(VersionInfo::LOCAL, config).await;

        let err = conn
            .send(command_set::VM, vm::RESUME, vec![0; 64 - HEADER_LEN + 1])
            .await
            .unwrap_err();
        assert!(matches!(err, DwpError::InvalidState(_)), "{err:?}");
        assert!(conn.is_connected());

        let id = conn
            .send(command_set::VM, vm::RESUME, vec![7; 64 - HEADER_LEN])
            .await
            .unwrap();
        let cmd = peer.read_command().await.unwrap().unwrap();
        assert_eq!(cmd.id, id);
        assert_eq!(cmd.payload.len(), 64 - HEADER_LEN);
    }

    #[tokio::test]
    async fn request_ids_increase_monotonically() {
        let (conn, mut peer, _rx) = connected(VersionInfo::LOCAL).await;
        let mut last = 0;
        for _ in 0..4 {
            let id = conn.send(command_set::VM, vm::SUSPEND, Vec::new()).await.unwrap();
            assert!(id > last);
            last = id;
            assert_eq!(peer.read_command().await.unwrap().unwrap().id, id);
        }
    }

    #[tokio::test]
    async fn status_codes_become_typed_errors() {
        let (conn, mut peer, _rx) = connected(VersionInfo::LOCAL).await;
        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(command_set::OBJECT_REF, 1, Vec::new()).await }
        });
        let cmd = peer.read_command().await.unwrap().unwrap();
        peer.reply_error(cmd.id, status::INVALID_OBJECT, &[]).await.unwrap();
        assert!(matches!(
            request.await.unwrap(),
            Err(DwpError::ObjectCollected)
        ));

        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(command_set::ARRAY_REF, 2, Vec::new()).await }
        });
        let cmd = peer.read_command().await.unwrap().unwrap();
        let mut w = DwpWriter::new();
        w.write_string("index out of range");
        peer.reply_error(cmd.id, status::INVALID_ARGUMENT, &w.into_vec())
            .await
            .unwrap();
        match request.await.unwrap() {
            Err(DwpError::CommandFailed {
                error_code,
                message,
            }) => {
                assert_eq!(error_code, status::INVALID_ARGUMENT);
                assert_eq!(message.as_deref(), Some("index out of range"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_fails_waiters_and_emits_one_event() {
        let (conn, mut peer, mut rx) = connected(VersionInfo::LOCAL).await;

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let conn = conn.clone();
            waiters.push(tokio::spawn(async move {
                conn.request(command_set::VM, vm::ALL_THREADS, Vec::new()).await
            }));
        }
        for _ in 0..3 {
            peer.read_command().await.unwrap().unwrap();
        }
        peer.close();

        for waiter in waiters {
            assert!(matches!(waiter.await.unwrap(), Err(DwpError::Disconnected)));
        }
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let event = rx.recv().await.unwrap();
        assert!(event.is_disconnect());
        assert!(rx.try_recv().is_err());

        assert!(matches!(
            conn.request(command_set::VM, vm::ALL_THREADS, Vec::new()).await,
            Err(DwpError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn crash_fails_waiters_with_payload() {
        let (conn, mut peer, mut rx) = connected(VersionInfo::LOCAL).await;

        let waiter = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(command_set::VM, vm::ALL_THREADS, Vec::new()).await }
        });
        peer.read_command().await.unwrap().unwrap();
        peer.send_event_payload(&crash_payload(0xfeed, "native stack"))
            .await
            .unwrap();

        match waiter.await.unwrap() {
            Err(DwpError::Crashed { dump, hash }) => {
                assert_eq!(dump, "native stack");
                assert_eq!(hash, 0xfeed);
            }
            other => panic!("unexpected {other:?}"),
        }
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Crashed);
        assert!(!conn.is_connected());

        let crash = rx.recv().await.unwrap();
        assert_eq!(
            crash.events[0].detail,
            EventDetail::Crash {
                hash: 0xfeed,
                dump: "native stack".into()
            }
        );
        assert!(rx.recv().await.unwrap().is_disconnect());
    }

    #[tokio::test]
    async fn unknown_event_kind_tears_down_connection() {
        let (conn, mut peer, mut rx) = connected(VersionInfo::LOCAL).await;
        let mut w = DwpWriter::new();
        w.write_u8(0);
        w.write_i32(1);
        w.write_u8(200);
        w.write_i32(0);
        w.write_id(0);
        peer.send_event_payload(&w.into_vec()).await.unwrap();

        assert!(rx.recv().await.unwrap().is_disconnect());
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_emits_disconnect_event() {
        let (conn, _peer, mut rx) = connected(VersionInfo::LOCAL).await;
        conn.shutdown();
        assert!(rx.recv().await.unwrap().is_disconnect());
        conn.closed().await;
        assert!(matches!(
            conn.send(command_set::VM, vm::RESUME, Vec::new()).await,
            Err(DwpError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn dispose_sends_dispose_then_closes() {
        let (conn, mut peer, _rx) = connected(VersionInfo::LOCAL).await;
        conn.dispose().await;
        let cmd = peer.read_command().await.unwrap().unwrap();
        assert_eq!((cmd.command_set, cmd.command), (command_set::VM, vm::DISPOSE));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn multi_reply_requests_collect_every_reply() {
        let (conn, mut peer, _rx) = connected(VersionInfo::LOCAL).await;
        let mut replies = conn
            .request_async(command_set::VM, vm::INVOKE_METHODS, Vec::new(), 3)
            .await
            .unwrap();
        let cmd = peer.read_command().await.unwrap().unwrap();
        assert_eq!(cmd.id, replies.id());
        for i in 0..3u8 {
            peer.reply(cmd.id, &[i]).await.unwrap();
        }
        for i in 0..3u8 {
            assert_eq!(replies.next().await.unwrap().unwrap(), vec![i]);
        }
        assert!(replies.next().await.is_none());
    }

    /// Records each `poll_write` call as a separate chunk.
    #[derive(Clone, Default)]
    struct RecordingWriter {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Forwards writes to `inner` until `budget` bytes have gone through,
    /// then never completes another write.
    struct StallingWriter<W> {
        inner: W,
        budget: Arc<AtomicUsize>,
    }

    impl<W: AsyncWrite + Unpin> AsyncWrite for StallingWriter<W> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let budget = self.budget.load(Ordering::SeqCst);
            if budget == 0 {
                return Poll::Pending;
            }
            let n = buf.len().min(budget);
            let res = Pin::new(&mut self.inner).poll_write(cx, &buf[..n]);
            if let Poll::Ready(Ok(written)) = res {
                self.budget.fetch_sub(written, Ordering::SeqCst);
            }
            res
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    async fn connected_with_stalling_writer(
        write_timeout: Option<Duration>,
    ) -> (
        Connection,
        MockPeer,
        mpsc::UnboundedReceiver<EventSet>,
        Arc<AtomicUsize>,
    ) {
        let (stream, mut peer) = MockPeer::pair(VersionInfo::LOCAL);
        let (reader, writer) = tokio::io::split(stream);
        let budget = Arc::new(AtomicUsize::new(usize::MAX));
        let writer = StallingWriter {
            inner: writer,
            budget: budget.clone(),
        };
        let config = ConnectionConfig {
            write_timeout,
            ..ConnectionConfig::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (conn, handshake) = tokio::join!(
            Connection::connect(Split { reader, writer }, config, tx),
            peer.handshake()
        );
        handshake.unwrap();
        (conn.unwrap(), peer, rx, budget)
    }

    async fn expect_disconnect(conn: &Connection, rx: &mut mpsc::UnboundedReceiver<EventSet>) {
        tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .expect("connection did not close");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let set = rx.recv().await.unwrap();
        assert!(set.is_disconnect());
        assert!(matches!(
            conn.request(command_set::VM, vm::ALL_THREADS, Vec::new()).await,
            Err(DwpError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn timed_out_write_closes_the_connection() {
        let (conn, _peer, mut rx, budget) =
            connected_with_stalling_writer(Some(Duration::from_millis(50))).await;
        budget.store(5, Ordering::SeqCst);

        let err = conn
            .send(command_set::VM, vm::RESUME, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DwpError::Timeout), "{err:?}");
        assert_eq!(budget.load(Ordering::SeqCst), 0);
        expect_disconnect(&conn, &mut rx).await;
    }

    #[tokio::test]
    async fn abandoned_write_closes_the_connection() {
        let (conn, _peer, mut rx, budget) = connected_with_stalling_writer(None).await;
        budget.store(5, Ordering::SeqCst);

        let sender = conn.clone();
        let task = tokio::spawn(async move {
            sender
                .send(command_set::VM, vm::RESUME, Vec::new())
                .await
        });
        while budget.load(Ordering::SeqCst) != 0 {
            tokio::task::yield_now().await;
        }
        assert!(conn.is_connected());
        task.abort();
        let _ = task.await;
        expect_disconnect(&conn, &mut rx).await;
    }

    #[tokio::test]
    async fn buffered_packets_are_written_once_in_order() {
        let (reader, mut feed) = tokio::io::duplex(4096);
        let writer = RecordingWriter::default();
        let writes = writer.writes.clone();

        feed.write_all(HANDSHAKE).await.unwrap();
        // Answer each handshake command only once it has been written.
        let seen = writes.clone();
        tokio::spawn(async move {
            let replies = [
                encode_reply(1, 0, &MockPeer::version_payload(VersionInfo::LOCAL)),
                encode_reply(2, 0, &[]),
            ];
            for (i, reply) in replies.iter().enumerate() {
                loop {
                    let written = seen.lock().unwrap().len();
                    if written >= i + 2 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                feed.write_all(reply).await.unwrap();
            }
            std::future::pending::<()>().await;
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(Split { reader, writer }, ConnectionConfig::default(), tx)
            .await
            .unwrap();
        let before = writes.lock().unwrap().len();

        conn.start_buffering().await;
        let a = conn.send(command_set::VM, vm::SUSPEND, vec![1]).await.unwrap();
        let b = conn.send(command_set::VM, vm::RESUME, vec![2, 3]).await.unwrap();
        assert!(matches!(
            conn.request(command_set::VM, vm::ALL_THREADS, Vec::new()).await,
            Err(DwpError::InvalidState(_))
        ));
        assert_eq!(writes.lock().unwrap().len(), before);

        conn.stop_buffering().await.unwrap();
        let recorded = writes.lock().unwrap();
        assert_eq!(recorded.len(), before + 1);
        let mut expected = encode_command(a, command_set::VM, vm::SUSPEND, &[1]);
        expected.extend(encode_command(b, command_set::VM, vm::RESUME, &[2, 3]));
        assert_eq!(recorded[before], expected);
    }
}
