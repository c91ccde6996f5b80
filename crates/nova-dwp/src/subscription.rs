use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    codec::{DwpReader, DwpWriter},
    commands::{command_set, event_request},
    connection::Connection,
    error::{DwpError, Result},
    events::{EventKind, EventRecord},
    poison::lock,
    types::{
        AssemblyId, Feature, MethodId, StepDepth, StepSize, SuspendPolicy, ThreadId, TypeId,
        VersionInfo,
    },
};

/// Step filter flags (`EventFilter::Step::filter`).
pub mod step_filter {
    pub const NONE: i32 = 0;
    pub const STATIC_CTOR: i32 = 1;
    pub const DEBUGGER_HIDDEN: i32 = 2;
    pub const DEBUGGER_STEP_THROUGH: i32 = 4;
    pub const DEBUGGER_NON_USER_CODE: i32 = 8;
}

/// Narrows the events an event request reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventFilter {
    /// Report only the n-th occurrence.
    Count(i32),
    ThreadOnly(ThreadId),
    LocationOnly {
        method_id: MethodId,
        il_offset: i64,
    },
    ExceptionOnly {
        /// `None` matches every exception type.
        type_id: Option<TypeId>,
        caught: bool,
        uncaught: bool,
        subclasses: bool,
    },
    Step {
        thread: ThreadId,
        size: StepSize,
        depth: StepDepth,
        filter: i32,
    },
    AssemblyOnly(Vec<AssemblyId>),
    SourceFileOnly(Vec<String>),
    TypeNameOnly(Vec<String>),
}

impl EventFilter {
    pub fn kind(&self) -> u8 {
        match self {
            EventFilter::Count(_) => 1,
            EventFilter::ThreadOnly(_) => 3,
            EventFilter::LocationOnly { .. } => 7,
            EventFilter::ExceptionOnly { .. } => 8,
            EventFilter::Step { .. } => 10,
            EventFilter::AssemblyOnly(_) => 11,
            EventFilter::SourceFileOnly(_) => 12,
            EventFilter::TypeNameOnly(_) => 13,
        }
    }

    /// Encode for `version`, failing if the filter needs a field the peer
    /// cannot receive.
    pub fn encode(&self, w: &mut DwpWriter, version: VersionInfo) -> Result<()> {
        w.write_u8(self.kind());
        match self {
            EventFilter::Count(count) => w.write_i32(*count),
            EventFilter::ThreadOnly(thread) => w.write_id(*thread),
            EventFilter::LocationOnly {
                method_id,
                il_offset,
            } => {
                w.write_id(*method_id);
                w.write_i64(*il_offset);
            }
            EventFilter::ExceptionOnly {
                type_id,
                caught,
                uncaught,
                subclasses,
            } => {
                w.write_id(type_id.unwrap_or(0));
                w.write_bool(*caught);
                w.write_bool(*uncaught);
                if Feature::ExceptionSubclassFilter.is_available(version) {
                    w.write_bool(*subclasses);
                } else if !subclasses {
                    return Err(not_supported(Feature::ExceptionSubclassFilter, version));
                }
            }
            EventFilter::Step {
                thread,
                size,
                depth,
                filter,
            } => {
                w.write_id(*thread);
                w.write_i32(size.as_i32());
                w.write_i32(depth.as_i32());
                if Feature::StepFilter.is_available(version) {
                    w.write_i32(*filter);
                } else if *filter != step_filter::NONE {
                    return Err(not_supported(Feature::StepFilter, version));
                }
            }
            EventFilter::AssemblyOnly(assemblies) => w.write_ids(assemblies),
            EventFilter::SourceFileOnly(names) | EventFilter::TypeNameOnly(names) => {
                w.write_i32(names.len() as i32);
                for name in names {
                    w.write_string(name);
                }
            }
        }
        Ok(())
    }
}

fn not_supported(feature: Feature, negotiated: VersionInfo) -> DwpError {
    DwpError::NotSupported {
        feature: feature.name(),
        required: feature.required_version(),
        negotiated,
    }
}

/// An active event request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub id: i32,
    pub kind: EventKind,
    pub suspend_policy: SuspendPolicy,
    pub filters: Vec<EventFilter>,
}

/// Subscription id → subscription, so event records can be traced back to
/// the request that produced them.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<i32, Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscription: Subscription) -> Arc<Subscription> {
        let subscription = Arc::new(subscription);
        lock(&self.entries, "SubscriptionRegistry.insert")
            .insert(subscription.id, subscription.clone());
        subscription
    }

    pub fn get(&self, id: i32) -> Option<Arc<Subscription>> {
        lock(&self.entries, "SubscriptionRegistry.get").get(&id).cloned()
    }

    pub fn remove(&self, id: i32) -> Option<Arc<Subscription>> {
        lock(&self.entries, "SubscriptionRegistry.remove").remove(&id)
    }

    pub fn for_event(&self, record: &EventRecord) -> Option<Arc<Subscription>> {
        self.get(record.subscription_id)
            .filter(|sub| sub.kind == record.kind)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries, "SubscriptionRegistry.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries, "SubscriptionRegistry.clear").clear();
    }
}

impl Connection {
    /// `EVENT_REQUEST.SET`; returns the peer-assigned subscription id.
    pub async fn set_event_request(
        &self,
        kind: EventKind,
        suspend_policy: SuspendPolicy,
        filters: &[EventFilter],
    ) -> Result<i32> {
        let Some(raw_kind) = kind.as_u8() else {
            return Err(DwpError::InvalidState(
                "disconnect events are delivered without a request",
            ));
        };
        if kind == EventKind::Crash {
            self.require(Feature::CrashEvents)?;
        }
        let count = u8::try_from(filters.len())
            .map_err(|_| DwpError::InvalidState("an event request takes at most 255 filters"))?;
        let version = self.version();

        let mut w = DwpWriter::new();
        w.write_u8(raw_kind);
        w.write_u8(suspend_policy.as_u8());
        w.write_u8(count);
        for filter in filters {
            filter.encode(&mut w, version)?;
        }
        let payload = self
            .request(command_set::EVENT_REQUEST, event_request::SET, w.into_vec())
            .await?;
        DwpReader::new(&payload).read_i32()
    }

    pub async fn clear_event_request(&self, kind: EventKind, id: i32) -> Result<()> {
        let raw_kind = kind
            .as_u8()
            .ok_or(DwpError::InvalidState("no request exists for disconnect events"))?;
        let mut w = DwpWriter::new();
        w.write_u8(raw_kind);
        w.write_i32(id);
        self.request(command_set::EVENT_REQUEST, event_request::CLEAR, w.into_vec())
            .await?;
        Ok(())
    }

    pub async fn clear_all_breakpoints(&self) -> Result<()> {
        self.request(
            command_set::EVENT_REQUEST,
            event_request::CLEAR_ALL_BREAKPOINTS,
            Vec::new(),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::mock::{MockVm, MockVmConfig};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn oversized_filter_list_is_rejected_before_sending() {
        let (stream, mock) = MockVm::spawn(MockVmConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(stream, ConnectionConfig::default(), tx)
            .await
            .unwrap();

        let filters = vec![EventFilter::Count(1); 256];
        let err = conn
            .set_event_request(EventKind::ThreadStart, SuspendPolicy::None, &filters)
            .await
            .unwrap_err();
        assert!(matches!(err, DwpError::InvalidState(_)), "{err:?}");
        assert_eq!(mock.count(command_set::EVENT_REQUEST, event_request::SET), 0);
        assert!(conn.is_connected());

        conn.set_event_request(EventKind::ThreadStart, SuspendPolicy::None, &filters[..255])
            .await
            .unwrap();
        let sent = mock.commands();
        let set = sent
            .iter()
            .find(|c| {
                c.command_set == command_set::EVENT_REQUEST && c.command == event_request::SET
            })
            .unwrap();
        assert_eq!(set.payload[2], 255);
    }

    #[test]
    fn exception_filter_subclass_flag_is_gated() {
        let filter = EventFilter::ExceptionOnly {
            type_id: None,
            caught: true,
            uncaught: false,
            subclasses: true,
        };
        let mut w = DwpWriter::new();
        filter.encode(&mut w, VersionInfo::new(2, 25)).unwrap();
        assert_eq!(w.into_vec(), vec![8, 0, 0, 0, 0, 1, 0, 1]);

        // Older peers always include subclasses; asking for that is fine.
        let mut w = DwpWriter::new();
        filter.encode(&mut w, VersionInfo::new(2, 24)).unwrap();
        assert_eq!(w.len(), 7);

        let exact = EventFilter::ExceptionOnly {
            type_id: Some(5),
            caught: true,
            uncaught: true,
            subclasses: false,
        };
        assert!(matches!(
            exact.encode(&mut DwpWriter::new(), VersionInfo::new(2, 24)),
            Err(DwpError::NotSupported { .. })
        ));
    }

    #[test]
    fn step_filter_flags_need_a_newer_peer() {
        let step = EventFilter::Step {
            thread: 1,
            size: StepSize::Line,
            depth: StepDepth::Over,
            filter: step_filter::DEBUGGER_HIDDEN,
        };
        let mut w = DwpWriter::new();
        step.encode(&mut w, VersionInfo::new(2, 16)).unwrap();
        assert_eq!(
            w.into_vec(),
            vec![10, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2]
        );
        assert!(matches!(
            step.encode(&mut DwpWriter::new(), VersionInfo::new(2, 15)),
            Err(DwpError::NotSupported { feature, .. }) if feature == Feature::StepFilter.name()
        ));
    }

    #[test]
    fn registry_matches_records_by_id_and_kind() {
        let registry = SubscriptionRegistry::new();
        registry.insert(Subscription {
            id: 3,
            kind: EventKind::Breakpoint,
            suspend_policy: SuspendPolicy::All,
            filters: Vec::new(),
        });
        let mut record = EventRecord {
            kind: EventKind::Breakpoint,
            subscription_id: 3,
            suspend_policy: SuspendPolicy::All,
            thread_id: 1,
            detail: crate::events::EventDetail::None,
        };
        assert_eq!(registry.for_event(&record).unwrap().id, 3);
        record.kind = EventKind::Step;
        assert!(registry.for_event(&record).is_none());
        assert!(registry.remove(3).is_some());
        assert!(registry.is_empty());
    }
}
