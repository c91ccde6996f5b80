use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    net::ToSocketAddrs,
    sync::{mpsc, RwLock},
};

use crate::{
    cache::IdentityCache,
    connection::{Connection, ConnectionConfig},
    error::{DwpError, Result},
    events::{EventKind, EventRecord, EventSet},
    invoke::{InvokeBatch, InvokeOptions, PendingInvoke},
    mirror::{
        AssemblyMirror, DomainMirror, Mirror, MethodMirror, ModuleMirror, ObjectKind, ObjectMirror,
        TypeMirror,
    },
    poison::lock,
    subscription::{EventFilter, Subscription, SubscriptionRegistry},
    transport::{connect_tcp, TcpConfig, Transport},
    types::{
        AssemblyId, DomainId, Feature, FrameInfo, MethodId, ModuleId, ObjectId, SuspendPolicy,
        ThreadId, TypeId, Value, VersionInfo,
    },
};

const STRING_TYPE_NAME: &str = "System.String";
const THREAD_TYPE_NAME: &str = "System.Threading.Thread";

/// FIFO of event sets with a terminal state: once the synthetic disconnect
/// set has been handed out, every later dequeue fails immediately.
#[derive(Debug)]
struct EventQueue {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<EventSet>>,
    finished: AtomicBool,
}

impl EventQueue {
    fn new(rx: mpsc::UnboundedReceiver<EventSet>) -> Self {
        Self {
            rx: tokio::sync::Mutex::new(rx),
            finished: AtomicBool::new(false),
        }
    }

    async fn next(&self) -> Result<EventSet> {
        if self.finished.load(Ordering::Acquire) {
            return Err(DwpError::Disconnected);
        }
        let mut rx = self.rx.lock().await;
        // Another consumer may have taken the disconnect set while we waited.
        if self.finished.load(Ordering::Acquire) {
            return Err(DwpError::Disconnected);
        }
        match rx.recv().await {
            Some(set) => {
                if set.is_disconnect() {
                    self.finished.store(true, Ordering::Release);
                }
                Ok(set)
            }
            None => {
                self.finished.store(true, Ordering::Release);
                Err(DwpError::Disconnected)
            }
        }
    }

    fn try_next(&self) -> Result<Option<EventSet>> {
        if self.finished.load(Ordering::Acquire) {
            return Err(DwpError::Disconnected);
        }
        let Ok(mut rx) = self.rx.try_lock() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(set) => {
                if set.is_disconnect() {
                    self.finished.store(true, Ordering::Release);
                }
                Ok(Some(set))
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.finished.store(true, Ordering::Release);
                Err(DwpError::Disconnected)
            }
        }
    }
}

/// Per-thread call stacks, valid until the next resume, suspend or invoke.
///
/// The generation counter keeps a fetch that raced with an invalidation from
/// repopulating the cache with stale frames.
#[derive(Debug, Default)]
struct FrameCache {
    inner: Mutex<FrameCacheInner>,
}

#[derive(Debug, Default)]
struct FrameCacheInner {
    generation: u64,
    frames: HashMap<ThreadId, Arc<Vec<FrameInfo>>>,
}

impl FrameCache {
    fn get(&self, thread: ThreadId) -> (Option<Arc<Vec<FrameInfo>>>, u64) {
        let inner = lock(&self.inner, "FrameCache.get");
        (inner.frames.get(&thread).cloned(), inner.generation)
    }

    fn store(
        &self,
        thread: ThreadId,
        generation: u64,
        frames: Vec<FrameInfo>,
    ) -> Arc<Vec<FrameInfo>> {
        let frames = Arc::new(frames);
        let mut inner = lock(&self.inner, "FrameCache.store");
        if inner.generation == generation {
            inner.frames.insert(thread, frames.clone());
        }
        frames
    }

    fn invalidate(&self, thread: ThreadId) {
        let mut inner = lock(&self.inner, "FrameCache.invalidate");
        inner.generation += 1;
        inner.frames.remove(&thread);
    }

    fn invalidate_all(&self) {
        let mut inner = lock(&self.inner, "FrameCache.invalidate_all");
        inner.generation += 1;
        inner.frames.clear();
    }
}

/// A debugging session over one [`Connection`].
///
/// Owns the event queue, the subscription registry and one identity cache
/// per entity kind, so every remote id resolves to a single local handle.
#[derive(Debug)]
pub struct Session {
    conn: Connection,
    events: EventQueue,
    subscriptions: SubscriptionRegistry,
    /// Held shared by every `subscribe` until its id is registered.
    subscribing: RwLock<()>,
    objects: IdentityCache<ObjectMirror>,
    types: IdentityCache<TypeMirror>,
    methods: IdentityCache<MethodMirror>,
    modules: IdentityCache<ModuleMirror>,
    domains: IdentityCache<DomainMirror>,
    assemblies: IdentityCache<AssemblyMirror>,
    frames: FrameCache,
    root_domain: Arc<DomainMirror>,
}

impl Session {
    /// Handshake over `transport` and resolve the root domain.
    pub async fn connect<T: Transport>(transport: T, config: ConnectionConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(transport, config, tx).await?;

        let root_id = match conn.root_domain().await {
            Ok(id) => id,
            Err(err) => {
                conn.shutdown();
                return Err(err);
            }
        };
        let domains = IdentityCache::new("domain");
        let root_domain = domains.get_or_insert_with(root_id, || DomainMirror::new(root_id));
        tracing::debug!(target: "nova.dwp", root_domain = root_id, "session ready");

        Ok(Self {
            conn,
            events: EventQueue::new(rx),
            subscriptions: SubscriptionRegistry::new(),
            subscribing: RwLock::new(()),
            objects: IdentityCache::new("object"),
            types: IdentityCache::new("type"),
            methods: IdentityCache::new("method"),
            modules: IdentityCache::new("module"),
            domains,
            assemblies: IdentityCache::new("assembly"),
            frames: FrameCache::default(),
            root_domain,
        })
    }

    pub async fn connect_tcp(
        addr: impl ToSocketAddrs,
        tcp: &TcpConfig,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let stream = connect_tcp(addr, tcp).await?;
        Self::connect(stream, config).await
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn version(&self) -> VersionInfo {
        self.conn.version()
    }

    pub fn root_domain(&self) -> Arc<DomainMirror> {
        self.root_domain.clone()
    }

    /// Wait for the next event set.
    ///
    /// The final set is the synthetic disconnect; after it has been returned
    /// this fails with [`DwpError::Disconnected`].
    pub async fn next_event(&self) -> Result<EventSet> {
        self.events.next().await
    }

    /// Non-blocking variant of [`Session::next_event`].
    pub fn try_next_event(&self) -> Result<Option<EventSet>> {
        self.events.try_next()
    }

    /// Register an event request with the debuggee.
    ///
    /// The peer may emit events for the request before its reply arrives;
    /// [`Session::subscription_for`] waits for in-flight subscribes before
    /// reporting such a record as unknown.
    pub async fn subscribe(
        &self,
        kind: EventKind,
        suspend_policy: SuspendPolicy,
        filters: Vec<EventFilter>,
    ) -> Result<Arc<Subscription>> {
        let _in_flight = self.subscribing.read().await;
        let id = self
            .conn
            .set_event_request(kind, suspend_policy, &filters)
            .await?;
        Ok(self.subscriptions.insert(Subscription {
            id,
            kind,
            suspend_policy,
            filters,
        }))
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.conn
            .clear_event_request(subscription.kind, subscription.id)
            .await?;
        self.subscriptions.remove(subscription.id);
        Ok(())
    }

    /// The subscription that produced `record`, if it is still registered.
    pub async fn subscription_for(&self, record: &EventRecord) -> Option<Arc<Subscription>> {
        if let Some(subscription) = self.subscriptions.for_event(record) {
            return Some(subscription);
        }
        // The record may belong to a subscribe still waiting on its reply.
        let _settled = self.subscribing.write().await;
        self.subscriptions.for_event(record)
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Resolve an object handle, classifying it as a thread, a string or a
    /// plain object on first sight.
    pub async fn object(&self, id: ObjectId) -> Result<Arc<ObjectMirror>> {
        if let Some(existing) = self.objects.get(id) {
            return Ok(existing);
        }
        let mirror = self.classify(id).await?;
        Ok(self.objects.insert_if_absent(id, mirror))
    }

    async fn classify(&self, id: ObjectId) -> Result<ObjectMirror> {
        let (type_id, domain_id) = if self.conn.require(Feature::ObjectInfo).is_ok() {
            let info = self.conn.object_info(id).await?;
            (info.type_id, info.domain_id)
        } else {
            (
                self.conn.object_type(id).await?,
                self.conn.object_domain(id).await?,
            )
        };

        let ty = self.type_mirror(type_id);
        let info = ty.info(&self.conn).await?;
        let corlib = self.domain(domain_id).corlib(&self.conn).await?;
        let kind = if info.assembly != corlib {
            ObjectKind::Plain
        } else {
            match info.full_name.as_str() {
                STRING_TYPE_NAME => ObjectKind::String,
                THREAD_TYPE_NAME => ObjectKind::Thread,
                _ => ObjectKind::Plain,
            }
        };
        Ok(ObjectMirror {
            id,
            kind,
            type_id,
            domain_id,
        })
    }

    pub fn type_mirror(&self, id: TypeId) -> Arc<TypeMirror> {
        self.types.get_or_insert_with(id, || TypeMirror::new(id))
    }

    pub fn method(&self, id: MethodId) -> Arc<MethodMirror> {
        self.methods.get_or_insert_with(id, || MethodMirror::new(id))
    }

    pub fn module(&self, id: ModuleId) -> Arc<ModuleMirror> {
        self.modules.get_or_insert_with(id, || ModuleMirror::new(id))
    }

    pub fn domain(&self, id: DomainId) -> Arc<DomainMirror> {
        self.domains.get_or_insert_with(id, || DomainMirror::new(id))
    }

    pub fn assembly(&self, id: AssemblyId) -> Arc<AssemblyMirror> {
        self.assemblies.get_or_insert_with(id, || AssemblyMirror::new(id))
    }

    /// Handle for the entity an event record is about.
    pub async fn event_target(&self, record: &EventRecord) -> Result<Option<Mirror>> {
        let target = match record.kind {
            EventKind::AppDomainCreate | EventKind::AppDomainUnload => record
                .target_id()
                .map(|id| Mirror::Domain(self.domain(id))),
            EventKind::AssemblyLoad | EventKind::AssemblyUnload => record
                .target_id()
                .map(|id| Mirror::Assembly(self.assembly(id))),
            EventKind::TypeLoad => record
                .target_id()
                .map(|id| Mirror::Type(self.type_mirror(id))),
            EventKind::MethodEntry
            | EventKind::MethodExit
            | EventKind::Breakpoint
            | EventKind::Step => record
                .target_id()
                .map(|id| Mirror::Method(self.method(id))),
            EventKind::Exception => match record.target_id() {
                Some(id) => Some(Mirror::Object(self.object(id).await?)),
                None => None,
            },
            EventKind::ThreadStart | EventKind::ThreadDeath if record.thread_id != 0 => {
                Some(Mirror::Object(self.object(record.thread_id).await?))
            }
            _ => None,
        };
        Ok(target)
    }

    /// Full call stack of a suspended thread, cached until the next resume,
    /// suspend or invoke.
    pub async fn thread_frames(&self, thread: ThreadId) -> Result<Arc<Vec<FrameInfo>>> {
        let (cached, generation) = self.frames.get(thread);
        if let Some(frames) = cached {
            return Ok(frames);
        }
        let frames = self.conn.thread_frames(thread, 0, -1).await?;
        Ok(self.frames.store(thread, generation, frames))
    }

    pub fn invalidate_frames(&self, thread: ThreadId) {
        self.frames.invalidate(thread);
    }

    pub async fn resume(&self) -> Result<()> {
        self.frames.invalidate_all();
        self.conn.vm_resume().await
    }

    pub async fn suspend(&self) -> Result<()> {
        self.frames.invalidate_all();
        self.conn.vm_suspend().await
    }

    /// Start an invoke on `thread`; its cached frames are dropped first since
    /// the invoke runs code on that thread.
    pub async fn invoke_method(
        &self,
        thread: ThreadId,
        method: MethodId,
        this: &Value,
        args: &[Value],
        options: InvokeOptions,
    ) -> Result<PendingInvoke> {
        self.frames.invalidate(thread);
        self.conn
            .invoke_method(thread, method, this, args, options)
            .await
    }

    pub async fn invoke_methods(
        &self,
        thread: ThreadId,
        methods: &[MethodId],
        this: &Value,
        args: &[Vec<Value>],
        options: InvokeOptions,
    ) -> Result<InvokeBatch> {
        self.frames.invalidate(thread);
        self.conn
            .invoke_methods(thread, methods, this, args, options)
            .await
    }

    /// Detach from the debuggee; the event queue still yields the final
    /// disconnect set.
    pub async fn dispose(&self) {
        self.conn.dispose().await;
        self.subscriptions.clear();
        self.frames.invalidate_all();
    }
}
