//! Nexus: ordered, named mutation dispatch
//!
//! Every externally visible mutation funnels through one call path
//! addressable by (node iden, event name), so it can be appended to a
//! durable change log and replayed by passive mirrors. A [`Nexus`] root
//! owns the iden→node and (iden, event)→handler tables; child nodes
//! register on attach and deregister on detach, so a replayed log entry
//! can address a specific, possibly dynamically created, child.
//!
//! Handler tables are composed explicitly per concrete type: a type's
//! [`Pusher::mount`] fills its [`HandlerTable`], calling its parent
//! type's `mount` first to inherit (and possibly override) entries.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum NexusError {
    #[error("no such iden: {0}")]
    NoSuchIden(String),

    #[error("no handler for event: {0}")]
    NoSuchName(String),

    #[error("iden already attached: {0}")]
    DupIden(String),

    #[error("storage error: {0}")]
    Loam(#[from] loam_core::LoamError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("handler error: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, NexusError>;

/// Handler arguments and return values travel as JSON values, the same
/// encoding the change log stores.
pub type Args = Value;

type NodeHandler<T> =
    Arc<dyn Fn(Arc<T>, Args) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

type BoundHandler = Arc<dyn Fn(Args) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Hook invoked before every logged push with (iden, event, args);
/// consumers append the call to a durable change log here.
pub type PushHook =
    Arc<dyn Fn(String, String, Args) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The handler table of one concrete node type.
///
/// Built once per attach by [`Pusher::mount`]; a subtype calls its parent
/// type's `mount` first, so later `on` calls override inherited entries.
pub struct HandlerTable<T: ?Sized> {
    handlers: HashMap<&'static str, (NodeHandler<T>, bool)>,
}

impl<T> Default for HandlerTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandlerTable<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under `event`.
    pub fn on<F>(&mut self, event: &'static str, handler: F)
    where
        F: Fn(Arc<T>, Args) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        self.handlers.insert(event, (Arc::new(handler), false));
    }

    /// Register a handler whose invocations are offered to the push hook
    /// (the change-log wiring) before running.
    pub fn on_logged<F>(&mut self, event: &'static str, handler: F)
    where
        F: Fn(Arc<T>, Args) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        self.handlers.insert(event, (Arc::new(handler), true));
    }

    /// Registered event names.
    pub fn events(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

/// A node addressable through a [`Nexus`].
pub trait Pusher: Send + Sync + 'static {
    /// The node's stable iden.
    fn iden(&self) -> &str;

    /// Fill the handler table for this concrete type. Subtypes call
    /// their parent type's `mount` first, then add or override entries.
    fn mount(table: &mut HandlerTable<Self>)
    where
        Self: Sized;
}

struct NodeEntry {
    handlers: HashMap<String, (BoundHandler, bool)>,
}

/// Dispatch root: owns the iden→node handler tables and routes pushes.
pub struct Nexus {
    iden: String,
    nodes: RwLock<HashMap<String, NodeEntry>>,
    hook: RwLock<Option<PushHook>>,
}

impl Nexus {
    /// Create a root addressed by `iden`. The root node object itself is
    /// attached like any other node, under the same iden.
    pub fn new(iden: &str) -> Arc<Nexus> {
        Arc::new(Nexus {
            iden: iden.to_string(),
            nodes: RwLock::new(HashMap::new()),
            hook: RwLock::new(None),
        })
    }

    pub fn iden(&self) -> &str {
        &self.iden
    }

    /// Install the change-log hook invoked before every logged push.
    pub fn set_push_hook(&self, hook: PushHook) {
        *self.hook.write() = Some(hook);
    }

    /// Attach a node: build its type's handler table and bind every entry
    /// to this instance under its iden. Fails `DupIden` when the iden is
    /// already attached.
    pub fn attach<T: Pusher>(&self, node: Arc<T>) -> Result<()> {
        let mut table = HandlerTable::new();
        T::mount(&mut table);

        let iden = node.iden().to_string();
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&iden) {
            return Err(NexusError::DupIden(iden));
        }

        let mut handlers: HashMap<String, (BoundHandler, bool)> = HashMap::new();
        for (event, (handler, logged)) in table.handlers {
            let node = node.clone();
            let bound: BoundHandler = Arc::new(move |args| (*handler)(node.clone(), args));
            handlers.insert(event.to_string(), (bound, logged));
        }
        debug!(iden = %iden, events = handlers.len(), "nexus node attached");
        nodes.insert(iden, NodeEntry { handlers });
        Ok(())
    }

    /// Detach a node on teardown; its handlers stop resolving.
    pub fn detach(&self, iden: &str) {
        self.nodes.write().remove(iden);
        debug!(iden = %iden, "nexus node detached");
    }

    pub fn has_iden(&self, iden: &str) -> bool {
        self.nodes.read().contains_key(iden)
    }

    /// Push to the root node itself.
    pub async fn push(&self, event: &str, args: Args) -> Result<Value> {
        let iden = self.iden.clone();
        self.push_to(&iden, event, args).await
    }

    /// Resolve (iden, event) to the registered handler and invoke it.
    /// Logged handlers are offered to the push hook first.
    pub async fn push_to(&self, iden: &str, event: &str, args: Args) -> Result<Value> {
        let (handler, logged) = {
            let nodes = self.nodes.read();
            let node = nodes
                .get(iden)
                .ok_or_else(|| NexusError::NoSuchIden(iden.to_string()))?;
            let (handler, logged) = node
                .handlers
                .get(event)
                .ok_or_else(|| NexusError::NoSuchName(event.to_string()))?;
            (handler.clone(), *logged)
        };

        if logged {
            let hook = self.hook.read().clone();
            if let Some(hook) = hook {
                (*hook)(iden.to_string(), event.to_string(), args.clone()).await?;
            }
        }

        (*handler)(args).await
    }
}
