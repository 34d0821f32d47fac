//! Watch feed of DNSNameResolver objects.
//!
//! The cluster transport is not part of this crate. Whatever drives the feed
//! pushes events through a [`FeedSender`]; the [`ChannelInformer`] replays them
//! into an [`EventHandler`] on the watch task and tracks the initial sync.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsNameResolverSpec {
    /// Declared DNS name or wildcard pattern, as written by the user.
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsNameResolver {
    pub metadata: ObjectMeta,
    pub spec: DnsNameResolverSpec,
}

impl DnsNameResolver {
    pub fn new(namespace: &str, name: &str, dns_name: &str) -> Self {
        Self {
            metadata: ObjectMeta { name: name.to_string(), namespace: namespace.to_string() },
            spec: DnsNameResolverSpec { name: dns_name.to_string() },
        }
    }

    /// Stable identity in the source: `namespace/name`, or just `name` when cluster scoped.
    pub fn key(&self) -> String {
        if self.metadata.namespace.is_empty() {
            self.metadata.name.clone()
        } else {
            format!("{}/{}", self.metadata.namespace, self.metadata.name)
        }
    }
}

/// Payload carried by a notification. Only `Resolver` (or a tombstone that
/// still knows its last state) is a usable binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchObject {
    Resolver(DnsNameResolver),
    /// Delete observed after a relist; the final state may be unknown.
    Tombstone { key: String, last_known: Option<DnsNameResolver> },
    Unknown { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(WatchObject),
    Updated { old: WatchObject, new: WatchObject },
    Deleted(WatchObject),
    /// The initial list has been fully delivered.
    Synced,
}

pub trait EventHandler: Send + Sync {
    fn on_add(&self, obj: WatchObject);
    fn on_update(&self, old: WatchObject, new: WatchObject);
    fn on_delete(&self, obj: WatchObject);
}

#[async_trait]
pub trait Informer: Send + Sync {
    /// Delivers notifications to `handler` until `stop` flips to true.
    async fn run(&self, handler: Arc<dyn EventHandler>, stop: watch::Receiver<bool>);

    fn has_synced(&self) -> bool;
}

/// Producer side of a [`ChannelInformer`].
#[derive(Clone)]
pub struct FeedSender {
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl FeedSender {
    pub fn send(&self, event: WatchEvent) -> bool {
        self.tx.unbounded_send(event).is_ok()
    }

    pub fn add(&self, obj: DnsNameResolver) -> bool {
        self.send(WatchEvent::Added(WatchObject::Resolver(obj)))
    }

    pub fn update(&self, old: DnsNameResolver, new: DnsNameResolver) -> bool {
        self.send(WatchEvent::Updated { old: WatchObject::Resolver(old), new: WatchObject::Resolver(new) })
    }

    pub fn delete(&self, obj: DnsNameResolver) -> bool {
        self.send(WatchEvent::Deleted(WatchObject::Resolver(obj)))
    }

    pub fn mark_synced(&self) -> bool {
        self.send(WatchEvent::Synced)
    }
}

pub struct ChannelInformer {
    events: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    synced: AtomicBool,
}

impl ChannelInformer {
    pub fn new() -> (Arc<Self>, FeedSender) {
        let (tx, rx) = mpsc::unbounded();
        let informer = Arc::new(Self { events: Mutex::new(Some(rx)), synced: AtomicBool::new(false) });
        (informer, FeedSender { tx })
    }

    fn dispatch(&self, handler: &dyn EventHandler, event: WatchEvent) {
        match event {
            WatchEvent::Added(obj) => handler.on_add(obj),
            WatchEvent::Updated { old, new } => handler.on_update(old, new),
            WatchEvent::Deleted(obj) => handler.on_delete(obj),
            WatchEvent::Synced => {
                if !self.synced.swap(true, Ordering::SeqCst) {
                    tracing::info!("[dnsnameresolver] Initial DNSNameResolver list delivered");
                }
            }
        }
    }
}

#[async_trait]
impl Informer for ChannelInformer {
    async fn run(&self, handler: Arc<dyn EventHandler>, mut stop: watch::Receiver<bool>) {
        let Some(mut events) = self.events.lock().take() else {
            tracing::error!("[dnsnameresolver] Watch feed already consumed by another run");
            return;
        };

        loop {
            if *stop.borrow_and_update() { break; }

            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() { break; }
                }

                event = events.next() => match event {
                    Some(event) => self.dispatch(handler.as_ref(), event),
                    None => {
                        tracing::info!("[dnsnameresolver] Watch feed closed, idling until shutdown");
                        while !*stop.borrow_and_update() {
                            if stop.changed().await.is_err() { break; }
                        }
                        break;
                    }
                }
            }
        }

        tracing::info!("[dnsnameresolver] Watch loop terminated");
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}
