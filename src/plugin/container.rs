use arc_swap::ArcSwap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tracing::{debug, error};

use super::{HookResult, Plugin};
use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::{panic_message, PluginError};
use crate::exchange::Exchange;
use crate::message::Message;
use crate::router::Handler;
use crate::session::Session;
use crate::status::Status;

type PluginList = Vec<Arc<dyn Plugin>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Left,
    Middle,
    Right,
}

/// Segments shared by a root container and everything derived from it.
#[derive(Default)]
struct Edges {
    left: PluginList,
    right: PluginList,
    nodes: Vec<Weak<Node>>,
}

struct Node {
    edges: Arc<Mutex<Edges>>,
    middle: Mutex<PluginList>,
    snapshot: ArcSwap<PluginList>,
}

impl Node {
    // Lock order is always edges, then middle.
    fn rebuild(&self, edges: &Edges) {
        let middle = self.middle.lock();
        let mut flat = Vec::with_capacity(edges.left.len() + middle.len() + edges.right.len());
        flat.extend(edges.left.iter().cloned());
        flat.extend(middle.iter().cloned());
        flat.extend(edges.right.iter().cloned());
        self.snapshot.store(Arc::new(flat));
    }

    fn middle_has(&self, name: &str) -> bool {
        self.middle.lock().iter().any(|p| p.name() == name)
    }
}

/// Ordered plugin registry with left, middle and right segments.
///
/// Cloning shares the same container. [`PluginContainer::derive`] creates a
/// child with its own middle segment that still follows the root's left and
/// right segments.
#[derive(Clone)]
pub struct PluginContainer {
    node: Arc<Node>,
}

impl Default for PluginContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginContainer {
    pub fn new() -> Self {
        let edges = Arc::new(Mutex::new(Edges::default()));
        let node = Arc::new(Node {
            edges: edges.clone(),
            middle: Mutex::new(Vec::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        });
        edges.lock().nodes.push(Arc::downgrade(&node));
        Self { node }
    }

    pub fn add_left(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        self.add(Segment::Left, plugin)
    }

    pub fn add_middle(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        self.add(Segment::Middle, plugin)
    }

    pub fn add_right(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        self.add(Segment::Right, plugin)
    }

    fn add(&self, segment: Segment, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        if name.is_empty() {
            return Err(PluginError::EmptyName);
        }

        let mut edges = self.node.edges.lock();
        let in_edges = edges
            .left
            .iter()
            .chain(edges.right.iter())
            .any(|p| p.name() == name);
        let taken = match segment {
            Segment::Middle => in_edges || self.node.middle_has(&name),
            Segment::Left | Segment::Right => {
                in_edges
                    || edges
                        .nodes
                        .iter()
                        .filter_map(Weak::upgrade)
                        .any(|n| n.middle_has(&name))
            }
        };
        if taken {
            return Err(PluginError::Duplicate(name));
        }

        debug!(plugin = %name, segment = ?segment, "plugin registered");
        match segment {
            Segment::Left => edges.left.push(plugin),
            Segment::Right => edges.right.push(plugin),
            Segment::Middle => {
                self.node.middle.lock().push(plugin);
                self.node.rebuild(&edges);
                return Ok(());
            }
        }
        refresh_all(&mut edges);
        Ok(())
    }

    /// Removes `name` from this container's middle segment, or failing that
    /// from the shared left/right segments. Derived children keep their own
    /// copy of the middle segment.
    pub fn remove(&self, name: &str) -> bool {
        let mut edges = self.node.edges.lock();
        let removed_middle = {
            let mut middle = self.node.middle.lock();
            let before = middle.len();
            middle.retain(|p| p.name() != name);
            before != middle.len()
        };
        if removed_middle {
            self.node.rebuild(&edges);
            return true;
        }

        let before = edges.left.len() + edges.right.len();
        edges.left.retain(|p| p.name() != name);
        edges.right.retain(|p| p.name() != name);
        if before == edges.left.len() + edges.right.len() {
            return false;
        }
        refresh_all(&mut edges);
        true
    }

    /// Creates a child whose middle segment starts as a copy of this one's.
    pub fn derive(&self) -> PluginContainer {
        let mut edges = self.node.edges.lock();
        let seed = self.node.middle.lock().clone();
        let node = Arc::new(Node {
            edges: self.node.edges.clone(),
            middle: Mutex::new(seed),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        });
        node.rebuild(&edges);
        edges.nodes.push(Arc::downgrade(&node));
        PluginContainer { node }
    }

    /// Flattened left, middle, right list.
    pub fn snapshot(&self) -> Arc<PluginList> {
        self.node.snapshot.load_full()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.snapshot().iter().find(|p| p.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

fn refresh_all(edges: &mut Edges) {
    edges.nodes.retain(|w| w.strong_count() > 0);
    let nodes: Vec<Arc<Node>> = edges.nodes.iter().filter_map(Weak::upgrade).collect();
    for node in nodes {
        node.rebuild(edges);
    }
}

fn aborted(plugin: &str, hook: &'static str, status: Status) -> Status {
    debug!(plugin, hook, %status, "plugin hook aborted the chain");
    status
}

async fn guarded<F>(plugin: &str, hook: &'static str, fut: F) -> HookResult
where
    F: Future<Output = HookResult>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(status)) => Err(aborted(plugin, hook, status)),
        Err(payload) => {
            let reason = panic_message(&*payload);
            error!(plugin, hook, panic = %reason, "plugin hook panicked");
            Err(Status::internal(format!(
                "plugin {plugin} panicked in {hook}: {reason}"
            )))
        }
    }
}

macro_rules! sync_chain {
    ($hook:ident($($arg:ident: $ty:ty),*)) => {
        pub fn $hook(&self, $($arg: $ty),*) -> HookResult {
            for plugin in self.snapshot().iter() {
                if let Err(status) = plugin.$hook($($arg),*) {
                    return Err(aborted(plugin.name(), stringify!($hook), status));
                }
            }
            Ok(())
        }
    };
}

macro_rules! async_chain {
    ($hook:ident($($arg:ident: $ty:ty),*)) => {
        pub async fn $hook(&self, $($arg: $ty),*) -> HookResult {
            for plugin in self.snapshot().iter() {
                if let Err(status) = plugin.$hook($($arg),*).await {
                    return Err(aborted(plugin.name(), stringify!($hook), status));
                }
            }
            Ok(())
        }
    };
}

macro_rules! guarded_chain {
    ($hook:ident($($arg:ident: $ty:ty),*)) => {
        pub async fn $hook(&self, $($arg: $ty),*) -> HookResult {
            for plugin in self.snapshot().iter() {
                guarded(plugin.name(), stringify!($hook), plugin.$hook($($arg),*)).await?;
            }
            Ok(())
        }
    };
}

/// Hook invocation. Each runs the flattened snapshot in order and stops at the
/// first error. Dial and accept hooks also turn a panic into an error status.
impl PluginContainer {
    sync_chain!(before_new_endpoint(config: &mut EndpointConfig));
    sync_chain!(after_new_endpoint(endpoint: &Endpoint));
    sync_chain!(after_reg_router(handler: &Handler));
    sync_chain!(after_listen(addr: &str));

    guarded_chain!(before_dial(addr: &str, is_redial: bool));
    guarded_chain!(after_dial(session: &Arc<Session>, is_redial: bool));
    guarded_chain!(after_dial_fail(addr: &str, status: &Status, is_redial: bool));
    guarded_chain!(after_accept(session: &Arc<Session>));

    async_chain!(before_write_call(session: &Arc<Session>, msg: &mut Message));
    async_chain!(after_write_call(session: &Arc<Session>, msg: &Message));
    async_chain!(before_write_reply(ex: &mut Exchange));
    async_chain!(after_write_reply(ex: &mut Exchange));
    async_chain!(before_write_push(session: &Arc<Session>, msg: &mut Message));
    async_chain!(after_write_push(session: &Arc<Session>, msg: &Message));
    async_chain!(before_read_header(session: &Arc<Session>));
    async_chain!(after_read_call_header(ex: &mut Exchange));
    async_chain!(before_read_call_body(ex: &mut Exchange));
    async_chain!(after_read_call_body(ex: &mut Exchange));
    async_chain!(after_read_push_header(ex: &mut Exchange));
    async_chain!(before_read_push_body(ex: &mut Exchange));
    async_chain!(after_read_push_body(ex: &mut Exchange));
    async_chain!(after_read_reply_header(ex: &mut Exchange));
    async_chain!(before_read_reply_body(ex: &mut Exchange));
    async_chain!(after_read_reply_body(ex: &mut Exchange));
    async_chain!(after_disconnect(session: &Arc<Session>));
}

impl std::fmt::Debug for PluginContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                log: log.clone(),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn after_listen(&self, _addr: &str) -> HookResult {
            self.log.lock().push(self.name.to_string());
            if self.fail {
                return Err(Status::unauthorized("denied"));
            }
            Ok(())
        }
    }

    struct Panicky;

    #[async_trait]
    impl Plugin for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn before_dial(&self, _addr: &str, _is_redial: bool) -> HookResult {
            panic!("boom");
        }
    }

    fn new_log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_segments_flatten_in_order() {
        let log = new_log();
        let root = PluginContainer::new();
        root.add_right(Recorder::new("c", &log)).unwrap();
        root.add_middle(Recorder::new("b", &log)).unwrap();
        root.add_left(Recorder::new("a", &log)).unwrap();
        assert_eq!(root.names(), vec!["a", "b", "c"]);
        root.after_listen("x").unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_and_empty_names_rejected() {
        let log = new_log();
        let root = PluginContainer::new();
        root.add_left(Recorder::new("a", &log)).unwrap();
        assert!(matches!(
            root.add_middle(Recorder::new("a", &log)),
            Err(PluginError::Duplicate(_))
        ));
        assert!(matches!(
            root.add_right(Recorder::new("", &log)),
            Err(PluginError::EmptyName)
        ));
    }

    #[test]
    fn test_child_follows_root_edges_but_keeps_its_middle() {
        let log = new_log();
        let root = PluginContainer::new();
        root.add_left(Recorder::new("a", &log)).unwrap();
        root.add_middle(Recorder::new("b", &log)).unwrap();
        let child = root.derive();
        child.add_middle(Recorder::new("g", &log)).unwrap();
        root.add_right(Recorder::new("c", &log)).unwrap();

        assert_eq!(child.names(), vec!["a", "b", "g", "c"]);
        assert_eq!(root.names(), vec!["a", "b", "c"]);

        assert!(root.remove("b"));
        assert_eq!(root.names(), vec!["a", "c"]);
        assert_eq!(child.names(), vec!["a", "b", "g", "c"]);

        assert!(root.remove("a"));
        assert_eq!(child.names(), vec!["b", "g", "c"]);
        assert!(!root.remove("missing"));
    }

    #[test]
    fn test_first_error_short_circuits() {
        let log = new_log();
        let root = PluginContainer::new();
        root.add_left(Recorder::new("a", &log)).unwrap();
        root.add_left(Arc::new(Recorder {
            name: "deny",
            log: log.clone(),
            fail: true,
        }))
        .unwrap();
        root.add_right(Recorder::new("never", &log)).unwrap();
        let err = root.after_listen("x").unwrap_err();
        assert_eq!(err.code(), crate::status::CODE_UNAUTHORIZED);
        assert_eq!(*log.lock(), vec!["a", "deny"]);
    }

    #[tokio::test]
    async fn test_dial_hook_panic_becomes_status() {
        let root = PluginContainer::new();
        root.add_left(Arc::new(Panicky)).unwrap();
        let err = root.before_dial("127.0.0.1:1", false).await.unwrap_err();
        assert_eq!(err.code(), crate::status::CODE_INTERNAL_SERVER_ERROR);
        assert!(err.cause().unwrap_or_default().contains("boom"));
    }
}
