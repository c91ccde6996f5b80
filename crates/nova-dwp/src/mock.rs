//! Scripted debuggee peers for tests.
//!
//! [`MockPeer`] gives a test direct control over the server side of one
//! connection; [`MockVm`] answers commands on its own so higher layers can be
//! exercised end to end.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    accessors::encode_type_info,
    codec::{
        encode_command, encode_reply, DwpReader, DwpWriter, Packet, HANDSHAKE, MAX_PACKET_BYTES,
    },
    commands::{
        appdomain, command_set, event, event_request, method, object_ref, string_ref, thread,
        type_, vm,
    },
    error::status,
    invoke::invoke_flags,
    poison::lock,
    transport::read_packet,
    types::{
        AssemblyId, DomainId, Feature, FrameInfo, MethodId, ObjectId, TypeId, TypeInfo, Value,
        VersionInfo,
    },
};

const DUPLEX_CAPACITY: usize = 64 * 1024;

pub const ROOT_DOMAIN: DomainId = 1;
pub const CORLIB: AssemblyId = 1;
pub const APP_ASSEMBLY: AssemblyId = 2;

pub const STRING_TYPE: TypeId = 100;
pub const THREAD_TYPE: TypeId = 101;
pub const WIDGET_TYPE: TypeId = 102;
/// Named `System.String` but defined outside the corlib.
pub const IMPOSTOR_STRING_TYPE: TypeId = 103;

pub const MAIN_THREAD: ObjectId = 0x200;
pub const STRING_OBJECT: ObjectId = 0x201;
pub const WIDGET_OBJECT: ObjectId = 0x202;
pub const IMPOSTOR_STRING_OBJECT: ObjectId = 0x203;
pub const EXCEPTION_OBJECT: ObjectId = 0x2ff;

/// Invoking this method never completes unless aborted.
pub const HANGING_METHOD: MethodId = 0xdead;
/// Invoking this method reports a thrown exception.
pub const THROWING_METHOD: MethodId = 0xbad;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCommand {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

fn invalid_data(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

async fn read_command(reader: &mut ReadHalf<DuplexStream>) -> io::Result<Option<MockCommand>> {
    match read_packet(reader, MAX_PACKET_BYTES).await {
        Ok(None) => Ok(None),
        Ok(Some(Packet::Command {
            id,
            command_set,
            command,
            payload,
        })) => Ok(Some(MockCommand {
            id,
            command_set,
            command,
            payload,
        })),
        Ok(Some(Packet::Reply { id, .. })) => Err(invalid_data(format!(
            "client sent a reply packet (id {id})"
        ))),
        Err(err) => Err(invalid_data(err)),
    }
}

/// Server side of one in-memory connection, driven step by step by a test.
pub struct MockPeer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    version: VersionInfo,
}

impl MockPeer {
    /// Returns the client end of the pipe and the peer.
    pub fn pair(version: VersionInfo) -> (DuplexStream, MockPeer) {
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (reader, writer) = tokio::io::split(server);
        (
            client,
            MockPeer {
                reader,
                writer,
                version,
            },
        )
    }

    /// Reply payload for `VM.VERSION`.
    pub fn version_payload(version: VersionInfo) -> Vec<u8> {
        let mut w = DwpWriter::new();
        w.write_string("mock runtime");
        w.write_i32(version.major as i32);
        w.write_i32(version.minor as i32);
        w.into_vec()
    }

    /// Send the magic and check the client's echo.
    pub async fn send_magic(&mut self) -> io::Result<()> {
        self.writer.write_all(HANDSHAKE).await?;
        let mut echo = [0u8; HANDSHAKE.len()];
        self.reader.read_exact(&mut echo).await?;
        if echo != *HANDSHAKE {
            return Err(invalid_data(format!(
                "bad handshake echo {:?}",
                String::from_utf8_lossy(&echo)
            )));
        }
        Ok(())
    }

    /// Magic exchange plus the version query and, when the version allows
    /// it, the version announcement.
    pub async fn handshake(&mut self) -> io::Result<()> {
        self.send_magic().await?;

        let query = self.expect_command().await?;
        if (query.command_set, query.command) != (command_set::VM, vm::VERSION) {
            return Err(invalid_data("expected VM.VERSION first"));
        }
        self.reply(query.id, &Self::version_payload(self.version))
            .await?;

        if Feature::SetProtocolVersion.is_available(self.version.min(VersionInfo::LOCAL)) {
            let announce = self.expect_command().await?;
            if announce.command != vm::SET_PROTOCOL_VERSION {
                return Err(invalid_data("expected VM.SET_PROTOCOL_VERSION"));
            }
            self.reply(announce.id, &[]).await?;
        }
        Ok(())
    }

    pub async fn read_command(&mut self) -> io::Result<Option<MockCommand>> {
        read_command(&mut self.reader).await
    }

    async fn expect_command(&mut self) -> io::Result<MockCommand> {
        self.read_command()
            .await?
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
    }

    pub async fn reply(&mut self, id: u32, payload: &[u8]) -> io::Result<()> {
        self.send_raw(&encode_reply(id, status::NONE, payload))
            .await
    }

    pub async fn reply_error(
        &mut self,
        id: u32,
        error_code: u16,
        payload: &[u8],
    ) -> io::Result<()> {
        self.send_raw(&encode_reply(id, error_code, payload)).await
    }

    /// Send an `EVENT.COMPOSITE` packet with the given payload.
    pub async fn send_event_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        self.send_raw(&encode_command(0, command_set::EVENT, event::COMPOSITE, payload))
            .await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Drop both halves; the client sees an orderly close.
    pub fn close(self) {}

    fn into_parts(self) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        (self.reader, self.writer)
    }
}

#[derive(Debug, Clone)]
pub struct MockVmConfig {
    pub version: VersionInfo,
    pub types: HashMap<TypeId, TypeInfo>,
    /// Object id → (type, domain).
    pub objects: HashMap<ObjectId, (TypeId, DomainId)>,
    /// Frames returned for every thread.
    pub frames: Vec<FrameInfo>,
}

pub fn mock_type_info(full_name: &str, assembly: AssemblyId) -> TypeInfo {
    let (namespace, name) = full_name.rsplit_once('.').unwrap_or(("", full_name));
    TypeInfo {
        namespace: namespace.to_string(),
        name: name.to_string(),
        full_name: full_name.to_string(),
        assembly,
        module: assembly,
        base_type: 0,
        element_type: 0,
        token: 0x0200_0000,
        rank: 0,
        attributes: 0,
        is_byref: false,
        is_pointer: false,
        is_primitive: false,
        is_valuetype: false,
        is_enum: false,
        nested: Vec::new(),
    }
}

impl Default for MockVmConfig {
    fn default() -> Self {
        let types = HashMap::from([
            (STRING_TYPE, mock_type_info("System.String", CORLIB)),
            (THREAD_TYPE, mock_type_info("System.Threading.Thread", CORLIB)),
            (WIDGET_TYPE, mock_type_info("App.Widget", APP_ASSEMBLY)),
            (IMPOSTOR_STRING_TYPE, mock_type_info("System.String", APP_ASSEMBLY)),
        ]);
        let objects = HashMap::from([
            (MAIN_THREAD, (THREAD_TYPE, ROOT_DOMAIN)),
            (STRING_OBJECT, (STRING_TYPE, ROOT_DOMAIN)),
            (WIDGET_OBJECT, (WIDGET_TYPE, ROOT_DOMAIN)),
            (IMPOSTOR_STRING_OBJECT, (IMPOSTOR_STRING_TYPE, ROOT_DOMAIN)),
            (EXCEPTION_OBJECT, (WIDGET_TYPE, ROOT_DOMAIN)),
        ]);
        Self {
            version: VersionInfo::LOCAL,
            types,
            objects,
            frames: vec![
                FrameInfo {
                    frame_id: 1,
                    method_id: 30,
                    il_offset: 4,
                    flags: 0,
                },
                FrameInfo {
                    frame_id: 2,
                    method_id: 31,
                    il_offset: 12,
                    flags: 0,
                },
            ],
        }
    }
}

struct VmState {
    config: MockVmConfig,
    commands: Mutex<Vec<MockCommand>>,
    next_subscription: AtomicI32,
}

enum Outgoing {
    Reply {
        id: u32,
        error_code: u16,
        payload: Vec<u8>,
    },
    Close,
}

impl Outgoing {
    fn ok(id: u32, payload: Vec<u8>) -> Self {
        Outgoing::Reply {
            id,
            error_code: status::NONE,
            payload,
        }
    }

    fn error(id: u32, error_code: u16) -> Self {
        Outgoing::Reply {
            id,
            error_code,
            payload: Vec::new(),
        }
    }
}

/// An auto-responding debuggee over an in-memory pipe.
pub struct MockVm {
    state: Arc<VmState>,
    inject: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
}

impl MockVm {
    /// Returns the client end of the pipe; the handshake is served as soon
    /// as the client connects.
    pub fn spawn(config: MockVmConfig) -> (DuplexStream, MockVm) {
        let (client, peer) = MockPeer::pair(config.version);
        let state = Arc::new(VmState {
            config,
            commands: Mutex::new(Vec::new()),
            next_subscription: AtomicI32::new(0),
        });
        let (inject, inject_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(run(peer, state.clone(), inject_rx, shutdown.clone()));
        (
            client,
            MockVm {
                state,
                inject,
                shutdown,
            },
        )
    }

    /// Every command received after the handshake, in arrival order.
    pub fn commands(&self) -> Vec<MockCommand> {
        lock(&self.state.commands, "MockVm.commands").clone()
    }

    pub fn count(&self, command_set: u8, command: u8) -> usize {
        lock(&self.state.commands, "MockVm.count")
            .iter()
            .filter(|c| c.command_set == command_set && c.command == command)
            .count()
    }

    /// Push an `EVENT.COMPOSITE` packet to the client.
    pub fn send_event_payload(&self, payload: Vec<u8>) {
        let _ = self.inject.send(payload);
    }

    /// Close the connection from the debuggee side.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockVm {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    mut peer: MockPeer,
    state: Arc<VmState>,
    mut inject: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    let handshake = tokio::select! {
        _ = shutdown.cancelled() => return,
        res = peer.handshake() => res,
    };
    if handshake.is_err() {
        return;
    }

    // Commands are read on their own task so the select below only waits on
    // cancel-safe channel receives.
    let (mut reader, mut writer) = peer.into_parts();
    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let reader_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let cmd = tokio::select! {
                _ = reader_shutdown.cancelled() => break,
                cmd = read_command(&mut reader) => cmd,
            };
            match cmd {
                Ok(Some(cmd)) => {
                    if commands_tx.send(cmd).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    let mut hanging: Option<u32> = None;
    loop {
        let outgoing = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(payload) = inject.recv() => {
                let packet = encode_command(0, command_set::EVENT, event::COMPOSITE, &payload);
                if writer.write_all(&packet).await.is_err() {
                    break;
                }
                continue;
            }
            cmd = commands.recv() => match cmd {
                Some(cmd) => {
                    lock(&state.commands, "MockVm.run").push(cmd.clone());
                    state.respond(&cmd, &mut hanging)
                }
                None => break,
            },
        };

        for out in outgoing {
            match out {
                Outgoing::Reply {
                    id,
                    error_code,
                    payload,
                } => {
                    if writer
                        .write_all(&encode_reply(id, error_code, &payload))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Outgoing::Close => return,
            }
        }
    }
    shutdown.cancel();
}

impl VmState {
    fn version(&self) -> VersionInfo {
        self.config.version.min(VersionInfo::LOCAL)
    }

    fn respond(&self, cmd: &MockCommand, hanging: &mut Option<u32>) -> Vec<Outgoing> {
        match self.try_respond(cmd, hanging) {
            Ok(out) => out,
            Err(_) => vec![Outgoing::error(cmd.id, status::INVALID_ARGUMENT)],
        }
    }

    fn try_respond(
        &self,
        cmd: &MockCommand,
        hanging: &mut Option<u32>,
    ) -> crate::Result<Vec<Outgoing>> {
        let id = cmd.id;
        let mut r = DwpReader::new(&cmd.payload);
        let mut w = DwpWriter::new();

        match (cmd.command_set, cmd.command) {
            (command_set::VM, vm::ALL_THREADS) => w.write_ids(&[MAIN_THREAD]),
            (command_set::VM, vm::SUSPEND | vm::RESUME) => {}
            (command_set::VM, vm::EXIT) => {
                return Ok(vec![Outgoing::ok(id, Vec::new()), Outgoing::Close]);
            }
            (command_set::VM, vm::DISPOSE) => return Ok(vec![Outgoing::Close]),
            (command_set::VM, vm::INVOKE_METHOD) => {
                let _thread = r.read_id()?;
                let flags = r.read_i32()?;
                let method = r.read_id()?;
                let this = r.read_value()?;
                let args = r.read_values()?;
                if method == HANGING_METHOD {
                    *hanging = Some(id);
                    return Ok(Vec::new());
                }
                return Ok(vec![Outgoing::ok(
                    id,
                    invoke_reply(method, flags, &this, &args),
                )]);
            }
            (command_set::VM, vm::INVOKE_METHODS) => {
                if !Feature::InvokeMethods.is_available(self.version()) {
                    return Ok(vec![Outgoing::error(id, status::NOT_IMPLEMENTED)]);
                }
                let _thread = r.read_id()?;
                let flags = r.read_i32()?;
                let count = r.read_count()?;
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    let method = r.read_id()?;
                    let this = r.read_value()?;
                    let args = r.read_values()?;
                    out.push(Outgoing::ok(id, invoke_reply(method, flags, &this, &args)));
                }
                return Ok(out);
            }
            (command_set::VM, vm::ABORT_INVOKE) => {
                let _thread = r.read_id()?;
                let request = r.read_i32()? as u32;
                if *hanging == Some(request) {
                    *hanging = None;
                    return Ok(vec![
                        Outgoing::error(request, status::INVOKE_ABORTED),
                        Outgoing::ok(id, Vec::new()),
                    ]);
                }
                return Ok(vec![Outgoing::error(id, status::NO_INVOCATION)]);
            }
            (
                command_set::OBJECT_REF,
                object_ref::GET_TYPE | object_ref::GET_DOMAIN | object_ref::GET_INFO,
            ) => {
                let object = r.read_id()?;
                let Some((type_id, domain)) = self.config.objects.get(&object).copied() else {
                    return Ok(vec![Outgoing::error(id, status::INVALID_OBJECT)]);
                };
                match cmd.command {
                    object_ref::GET_TYPE => w.write_id(type_id),
                    object_ref::GET_DOMAIN => w.write_id(domain),
                    _ => {
                        w.write_id(type_id);
                        w.write_id(domain);
                    }
                }
            }
            (command_set::STRING_REF, string_ref::GET_VALUE) => w.write_string("mock string"),
            (command_set::TYPE, type_::GET_INFO) => {
                let type_id = r.read_id()?;
                let Some(info) = self.config.types.get(&type_id) else {
                    return Ok(vec![Outgoing::error(id, status::UNLOADED)]);
                };
                encode_type_info(&mut w, info);
            }
            (command_set::APPDOMAIN, appdomain::GET_ROOT_DOMAIN) => w.write_id(ROOT_DOMAIN),
            (command_set::APPDOMAIN, appdomain::GET_CORLIB) => w.write_id(CORLIB),
            (command_set::APPDOMAIN, appdomain::GET_FRIENDLY_NAME) => w.write_string("root"),
            (command_set::THREAD, thread::GET_FRAME_INFO) => {
                w.write_i32(self.config.frames.len() as i32);
                for frame in &self.config.frames {
                    w.write_id(frame.frame_id);
                    w.write_id(frame.method_id);
                    w.write_i32(frame.il_offset);
                    w.write_u8(frame.flags);
                }
            }
            (command_set::THREAD, thread::GET_NAME) => w.write_string("Main Thread"),
            (command_set::METHOD, method::GET_NAME) => {
                let method = r.read_id()?;
                w.write_string(&format!("Method{method}"));
            }
            (command_set::METHOD, method::GET_DECLARING_TYPE) => w.write_id(WIDGET_TYPE),
            (command_set::EVENT_REQUEST, event_request::SET) => {
                let subscription = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
                w.write_i32(subscription);
            }
            (
                command_set::EVENT_REQUEST,
                event_request::CLEAR | event_request::CLEAR_ALL_BREAKPOINTS,
            ) => {}
            _ => return Ok(vec![Outgoing::error(id, status::NOT_IMPLEMENTED)]),
        }
        Ok(vec![Outgoing::ok(id, w.into_vec())])
    }
}

/// Methods return their own id as an `I4`; [`THROWING_METHOD`] throws.
fn invoke_reply(method: MethodId, flags: i32, this: &Value, args: &[Value]) -> Vec<u8> {
    let mut w = DwpWriter::new();
    if method == THROWING_METHOD {
        w.write_u8(0);
        w.write_value(&Value::object(EXCEPTION_OBJECT));
    } else {
        w.write_u8(1);
        w.write_value(&Value::I4(method as i32));
    }
    if flags & invoke_flags::RETURN_OUT_THIS != 0 {
        w.write_value(this);
    }
    if flags & invoke_flags::RETURN_OUT_ARGS != 0 {
        w.write_values(args);
    }
    w.into_vec()
}
