//! Applies watch notifications to the [`NameIndex`].

use super::index::{NameIndex, NameKind, UpsertOutcome};
use super::informer::{DnsNameResolver, EventHandler, WatchObject};
use crate::plugin::prometheus::{RESOLVER_BINDINGS, RESOLVER_NOTIFICATIONS_TOTAL};
use std::sync::Arc;

/// Lower-cased, without the trailing root dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

/// Binding carried by a well-formed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    name: String,
    owner: String,
}

impl Binding {
    fn from_object(obj: &WatchObject) -> Option<Self> {
        let resolver = match obj {
            WatchObject::Resolver(resolver) => resolver,
            WatchObject::Tombstone { last_known: Some(resolver), .. } => resolver,
            WatchObject::Tombstone { last_known: None, .. } | WatchObject::Unknown { .. } => return None,
        };
        Self::from_resolver(resolver)
    }

    fn from_resolver(resolver: &DnsNameResolver) -> Option<Self> {
        let name = normalize_name(&resolver.spec.name);
        if name.is_empty() || resolver.metadata.name.is_empty() {
            return None;
        }
        Some(Self { name, owner: resolver.key() })
    }
}

pub struct BindingSynchronizer {
    index: Arc<NameIndex>,
}

impl BindingSynchronizer {
    pub fn new(index: Arc<NameIndex>) -> Self {
        Self { index }
    }

    fn malformed(&self, event: &str, obj: &WatchObject) {
        tracing::warn!("[dnsnameresolver] Dropping {} notification with unexpected payload: {:?}", event, obj);
        RESOLVER_NOTIFICATIONS_TOTAL.with_label_values(&[event, "malformed"]).inc();
    }

    fn record(&self, event: &str, outcome: &str) {
        RESOLVER_NOTIFICATIONS_TOTAL.with_label_values(&[event, outcome]).inc();
        for kind in [NameKind::Regular, NameKind::Wildcard] {
            RESOLVER_BINDINGS.with_label_values(&[kind.as_str()]).set(self.index.len(kind) as f64);
        }
    }
}

fn outcome_label(outcome: UpsertOutcome) -> &'static str {
    match outcome { UpsertOutcome::Applied => "applied", UpsertOutcome::Skipped => "skipped" }
}

impl EventHandler for BindingSynchronizer {
    fn on_add(&self, obj: WatchObject) {
        let Some(binding) = Binding::from_object(&obj) else {
            return self.malformed("add", &obj);
        };
        let outcome = self.index.upsert(&binding.name, &binding.owner);
        if outcome == UpsertOutcome::Skipped {
            tracing::debug!("[dnsnameresolver] '{}' already bound to another object, ignoring {}", binding.name, binding.owner);
        }
        self.record("add", outcome_label(outcome));
    }

    fn on_update(&self, old: WatchObject, new: WatchObject) {
        let (Some(old_binding), Some(new_binding)) = (Binding::from_object(&old), Binding::from_object(&new)) else {
            return self.malformed("update", &new);
        };
        if old_binding.name == new_binding.name {
            return self.record("update", "unchanged");
        }

        // 旧名称的移除必须用旧对象的身份校验，防止误删其他对象已接管的名称
        let outcome = if old_binding.owner == new_binding.owner {
            self.index.reassign(&old_binding.name, &new_binding.name, &new_binding.owner)
        } else {
            self.index.remove(&old_binding.name, &old_binding.owner);
            self.index.upsert(&new_binding.name, &new_binding.owner)
        };
        tracing::debug!(
            "[dnsnameresolver] {} renamed '{}' -> '{}' ({:?})",
            new_binding.owner, old_binding.name, new_binding.name, outcome
        );
        self.record("update", outcome_label(outcome));
    }

    fn on_delete(&self, obj: WatchObject) {
        let Some(binding) = Binding::from_object(&obj) else {
            return self.malformed("delete", &obj);
        };
        let removed = self.index.remove(&binding.name, &binding.owner);
        self.record("delete", if removed { "applied" } else { "skipped" });
    }
}
