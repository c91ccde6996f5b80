use crate::codec::DwpReader;
use crate::error::{DwpError, Result};
use crate::types::{Feature, MethodId, ObjectId, SuspendPolicy, ThreadId, VersionInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    VmStart,
    VmDeath,
    ThreadStart,
    ThreadDeath,
    AppDomainCreate,
    AppDomainUnload,
    MethodEntry,
    MethodExit,
    AssemblyLoad,
    AssemblyUnload,
    Breakpoint,
    Step,
    TypeLoad,
    Exception,
    KeepAlive,
    UserBreak,
    UserLog,
    Crash,
    /// Synthesized locally when the connection stops; never sent by the peer.
    VmDisconnect,
}

impl EventKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => EventKind::VmStart,
            1 => EventKind::VmDeath,
            2 => EventKind::ThreadStart,
            3 => EventKind::ThreadDeath,
            4 => EventKind::AppDomainCreate,
            5 => EventKind::AppDomainUnload,
            6 => EventKind::MethodEntry,
            7 => EventKind::MethodExit,
            8 => EventKind::AssemblyLoad,
            9 => EventKind::AssemblyUnload,
            10 => EventKind::Breakpoint,
            11 => EventKind::Step,
            12 => EventKind::TypeLoad,
            13 => EventKind::Exception,
            14 => EventKind::KeepAlive,
            15 => EventKind::UserBreak,
            16 => EventKind::UserLog,
            17 => EventKind::Crash,
            _ => return None,
        })
    }

    /// Wire code, or `None` for [`EventKind::VmDisconnect`].
    pub fn as_u8(self) -> Option<u8> {
        Some(match self {
            EventKind::VmStart => 0,
            EventKind::VmDeath => 1,
            EventKind::ThreadStart => 2,
            EventKind::ThreadDeath => 3,
            EventKind::AppDomainCreate => 4,
            EventKind::AppDomainUnload => 5,
            EventKind::MethodEntry => 6,
            EventKind::MethodExit => 7,
            EventKind::AssemblyLoad => 8,
            EventKind::AssemblyUnload => 9,
            EventKind::Breakpoint => 10,
            EventKind::Step => 11,
            EventKind::TypeLoad => 12,
            EventKind::Exception => 13,
            EventKind::KeepAlive => 14,
            EventKind::UserBreak => 15,
            EventKind::UserLog => 16,
            EventKind::Crash => 17,
            EventKind::VmDisconnect => return None,
        })
    }
}

/// Kind-specific payload of an [`EventRecord`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventDetail {
    None,
    VmDeath {
        exit_code: Option<i32>,
    },
    /// Domain, assembly, type or method id, depending on the kind.
    Target {
        id: u32,
    },
    Location {
        method_id: MethodId,
        il_offset: i64,
    },
    Exception {
        exception_id: ObjectId,
    },
    UserLog {
        level: i32,
        category: String,
        message: String,
    },
    Crash {
        hash: u64,
        dump: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub subscription_id: i32,
    pub suspend_policy: SuspendPolicy,
    pub thread_id: ThreadId,
    pub detail: EventDetail,
}

impl EventRecord {
    /// Target id for kinds that carry one (including the method of a location).
    pub fn target_id(&self) -> Option<u32> {
        match &self.detail {
            EventDetail::Target { id } => Some(*id),
            EventDetail::Location { method_id, .. } => Some(*method_id),
            EventDetail::Exception { exception_id } => Some(*exception_id),
            _ => None,
        }
    }
}

/// One composite event packet: every record shares the suspend policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<EventRecord>,
}

impl EventSet {
    pub(crate) fn disconnect() -> Self {
        Self {
            suspend_policy: SuspendPolicy::None,
            events: vec![EventRecord {
                kind: EventKind::VmDisconnect,
                subscription_id: 0,
                suspend_policy: SuspendPolicy::None,
                thread_id: 0,
                detail: EventDetail::None,
            }],
        }
    }

    pub fn is_disconnect(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.kind == EventKind::VmDisconnect)
    }

    /// The first crash record in the set, if any.
    pub fn crash(&self) -> Option<(u64, &str)> {
        self.events.iter().find_map(|e| match &e.detail {
            EventDetail::Crash { hash, dump } => Some((*hash, dump.as_str())),
            _ => None,
        })
    }
}

/// Decode the payload of an `EVENT.COMPOSITE` packet.
///
/// An unknown kind byte fails the whole packet; the stream is considered
/// desynchronized.
pub fn decode_event_set(payload: &[u8], version: VersionInfo) -> Result<EventSet> {
    let mut r = DwpReader::new(payload);
    let policy = r.read_u8()?;
    let suspend_policy = SuspendPolicy::from_u8(policy)
        .ok_or_else(|| DwpError::Protocol(format!("invalid suspend policy {policy}")))?;
    let count = r.read_count()?;

    let mut events = Vec::with_capacity(count.min(r.remaining() / 9));
    for _ in 0..count {
        let raw_kind = r.read_u8()?;
        let kind = EventKind::from_u8(raw_kind).ok_or(DwpError::UnknownEventKind(raw_kind))?;
        let subscription_id = r.read_i32()?;
        let thread_id = r.read_id()?;
        let detail = match kind {
            EventKind::VmDeath => EventDetail::VmDeath {
                exit_code: if Feature::VmDeathExitCode.is_available(version) {
                    Some(r.read_i32()?)
                } else {
                    None
                },
            },
            EventKind::AppDomainCreate
            | EventKind::AppDomainUnload
            | EventKind::AssemblyLoad
            | EventKind::AssemblyUnload
            | EventKind::TypeLoad
            | EventKind::MethodEntry
            | EventKind::MethodExit => EventDetail::Target { id: r.read_id()? },
            EventKind::Breakpoint | EventKind::Step => EventDetail::Location {
                method_id: r.read_id()?,
                il_offset: r.read_i64()?,
            },
            EventKind::Exception => EventDetail::Exception {
                exception_id: r.read_id()?,
            },
            EventKind::UserLog => EventDetail::UserLog {
                level: r.read_i32()?,
                category: r.read_string()?,
                message: r.read_string()?,
            },
            EventKind::Crash => EventDetail::Crash {
                hash: r.read_u64()?,
                dump: r.read_string()?,
            },
            EventKind::VmStart
            | EventKind::ThreadStart
            | EventKind::ThreadDeath
            | EventKind::KeepAlive
            | EventKind::UserBreak
            | EventKind::VmDisconnect => EventDetail::None,
        };
        events.push(EventRecord {
            kind,
            subscription_id,
            suspend_policy,
            thread_id,
            detail,
        });
    }
    r.finish()?;

    Ok(EventSet {
        suspend_policy,
        events,
    })
}
