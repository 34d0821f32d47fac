//! `dnsnameresolver` plugin.
//!
//! Keeps an index of the DNS names declared by DNSNameResolver objects (fed by
//! a watch) and logs the outcome of every query that passes through the chain:
//! queried domain, resolved addresses and response code.
//!
//! ```text
//! .:53 {
//!     dnsnameresolver
//!     forward . 8.8.8.8
//! }
//! ```

pub mod index;
pub mod informer;
pub mod lifecycle;
pub mod sync;
pub mod ttl;

use crate::config::PluginConfig;
use crate::error::ResolverError;
use crate::plugin::prometheus::RESOLVER_QUERIES_TOTAL;
use crate::plugin::{Plugin, SharedState};
use crate::types::{rcode_to_str, DnsMessage, Record, RCODE_SERVFAIL};
use anyhow::Result;
use index::{NameIndex, NameKind};
use lifecycle::{SyncOutcome, WatchController};
use std::net::IpAddr;
use std::sync::Arc;
use sync::BindingSynchronizer;

/// What gets logged for one query once the chain has answered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    pub domain: String,
    pub ips: Vec<IpAddr>,
    pub rcode: u8,
}

impl QueryRecord {
    /// `None` when the query carried no question (or only the root name).
    pub fn from_message(msg: &DnsMessage) -> Option<Self> {
        let question = msg.questions.first()?;
        let domain = question.name.strip_suffix('.').unwrap_or(&question.name);
        if domain.is_empty() {
            return None;
        }

        let ips = msg
            .answers
            .iter()
            .filter_map(|record| match record {
                Record::A { addr } => Some(IpAddr::V4(*addr)),
                Record::AAAA { addr } => Some(IpAddr::V6(*addr)),
                Record::Other { .. } => None,
            })
            .collect();

        // 链路没有写出任何响应时按 SERVFAIL 记录
        let rcode = if msg.raw_response.is_some() { msg.header.rcode } else { RCODE_SERVFAIL };

        Some(Self { domain: domain.to_string(), ips, rcode })
    }

    pub fn joined_ips(&self) -> String {
        self.ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>().join(",")
    }
}

pub struct DnsNameResolverPlugin {
    index: Arc<NameIndex>,
    controller: WatchController,
}

impl DnsNameResolverPlugin {
    pub fn index(&self) -> &Arc<NameIndex> {
        &self.index
    }

    fn log_query(&self, record: &QueryRecord) {
        let rcode = rcode_to_str(record.rcode);
        tracing::info!(
            domain = %record.domain,
            ips = %record.joined_ips(),
            rcode = %rcode,
            "[dnsnameresolver] DNS Query"
        );
        RESOLVER_QUERIES_TOTAL.with_label_values(&[rcode]).inc();

        let name = record.domain.to_lowercase();
        if let Some(owner) = self.index.owner_of(&name) {
            tracing::debug!("[dnsnameresolver] '{}' is declared by {}", name, owner);
        }
    }
}

#[async_trait::async_trait]
impl Plugin for DnsNameResolverPlugin {
    fn name(&self) -> &str { "dnsnameresolver" }

    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> {
        if !config.args.is_empty() {
            return Err(ResolverError::Config("wrong argument count or unexpected line ending".into()).into());
        }
        if let Some(property) = config.block.first() {
            return Err(ResolverError::Config(format!("unknown property {:?}", property.name)).into());
        }

        let informer = shared.take_binding_feed().ok_or_else(|| {
            ResolverError::Bootstrap("no DNSNameResolver feed available (declared in more than one server block?)".into())
        })?;

        let index = Arc::new(NameIndex::new());
        let handler = Arc::new(BindingSynchronizer::new(index.clone()));
        let controller = WatchController::new(informer, handler);

        tracing::info!("[dnsnameresolver] Plugin initialized");
        Ok(Self { index, controller })
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<DnsMessage> { Ok(msg.clone()) }

    async fn post_process(&self, msg: &mut DnsMessage) -> Result<()> {
        if let Some(record) = QueryRecord::from_message(msg) {
            self.log_query(&record);
        }
        Ok(())
    }

    fn priority(&self) -> u8 { 180 }

    async fn on_startup(&self) -> Result<()> {
        let outcome = self.controller.start().await?;
        tracing::info!(
            "[dnsnameresolver] Watch running ({}), {} regular / {} wildcard bindings",
            match outcome { SyncOutcome::Synced => "synced", SyncOutcome::TimedOut => "sync pending" },
            self.index.len(NameKind::Regular),
            self.index.len(NameKind::Wildcard)
        );
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        self.controller.stop()?;
        self.controller.join().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::dnsnameresolver::informer::{ChannelInformer, DnsNameResolver, FeedSender};
    use crate::wire::tests::{build_query, build_response, encode_name};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::fmt::Debug;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    #[derive(Default)]
    struct FieldMap(HashMap<String, String>);

    impl Visit for FieldMap {
        fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
            self.0.insert(field.name().to_string(), format!("{:?}", value));
        }
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<HashMap<String, String>>>>);

    impl<S: tracing::Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut fields = FieldMap::default();
            event.record(&mut fields);
            self.0.lock().push(fields.0);
        }
    }

    fn empty_config() -> PluginConfig {
        PluginConfig { name: "dnsnameresolver".into(), args: vec![], block: vec![] }
    }

    fn plugin() -> (DnsNameResolverPlugin, FeedSender) {
        let (informer, feed) = ChannelInformer::new();
        let shared = Arc::new(SharedState::new(Some(informer)));
        (DnsNameResolverPlugin::from_config(&empty_config(), shared).unwrap(), feed)
    }

    fn answered(name: &str, rcode: u8, rdatas: &[(u16, Vec<u8>)]) -> DnsMessage {
        let mut msg = DnsMessage::default();
        msg.raw_query = build_query(0x2a, name, 1);
        msg.questions = crate::wire::parse_question(&msg.raw_query).into_iter().collect();
        msg.raw_response = Some(build_response(&msg.raw_query, rcode, rdatas));
        crate::wire::apply_response(&mut msg);
        msg
    }

    fn query_events(capture: &Capture) -> Vec<HashMap<String, String>> {
        capture.0.lock().iter().filter(|f| f.contains_key("domain")).cloned().collect()
    }

    #[test]
    fn rejects_arguments_and_properties() {
        let (informer, _feed) = ChannelInformer::new();
        let shared = Arc::new(SharedState::new(Some(informer)));

        let mut with_args = empty_config();
        with_args.args = vec!["extra".into()];
        let err = DnsNameResolverPlugin::from_config(&with_args, shared.clone()).err().unwrap();
        assert!(matches!(err.downcast_ref::<ResolverError>(), Some(ResolverError::Config(_))));

        let mut with_block = empty_config();
        with_block.block = vec![PluginConfig { name: "ttl".into(), args: vec!["30".into()], block: vec![] }];
        let err = DnsNameResolverPlugin::from_config(&with_block, shared).err().unwrap();
        assert_eq!(
            err.downcast_ref::<ResolverError>(),
            Some(&ResolverError::Config("unknown property \"ttl\"".into()))
        );
    }

    #[test]
    fn feed_is_single_use() {
        let (informer, _feed) = ChannelInformer::new();
        let shared = Arc::new(SharedState::new(Some(informer)));
        assert!(DnsNameResolverPlugin::from_config(&empty_config(), shared.clone()).is_ok());
        let err = DnsNameResolverPlugin::from_config(&empty_config(), shared).err().unwrap();
        assert!(matches!(err.downcast_ref::<ResolverError>(), Some(ResolverError::Bootstrap(_))));
    }

    #[test]
    fn record_collects_addresses() {
        let v6: std::net::Ipv6Addr = "2001:db8::7".parse().unwrap();
        let msg = answered(
            "App.Example.com",
            0,
            &[(5, encode_name("edge.example.net")), (1, vec![10, 0, 0, 5]), (28, v6.octets().to_vec())],
        );
        let record = QueryRecord::from_message(&msg).unwrap();
        assert_eq!(record.domain, "App.Example.com");
        assert_eq!(record.joined_ips(), "10.0.0.5,2001:db8::7");
        assert_eq!(record.rcode, 0);
    }

    #[test]
    fn record_without_response_is_servfail() {
        let mut msg = DnsMessage::default();
        msg.raw_query = build_query(1, "nowhere.example.com", 1);
        msg.questions = crate::wire::parse_question(&msg.raw_query).into_iter().collect();
        let record = QueryRecord::from_message(&msg).unwrap();
        assert_eq!(record.rcode, RCODE_SERVFAIL);
        assert!(record.ips.is_empty());
        assert_eq!(record.joined_ips(), "");
    }

    #[test]
    fn damaged_servfail_response_is_logged_as_servfail() {
        let mut msg = DnsMessage::default();
        msg.raw_query = build_query(1, "broken.example.com", 1);
        msg.questions = crate::wire::parse_question(&msg.raw_query).into_iter().collect();
        let mut resp = build_response(&msg.raw_query, RCODE_SERVFAIL, &[(1, vec![10, 0, 0, 9])]);
        resp.truncate(resp.len() - 2);
        msg.raw_response = Some(resp);
        crate::wire::apply_response(&mut msg);

        let record = QueryRecord::from_message(&msg).unwrap();
        assert_eq!(record.rcode, RCODE_SERVFAIL);
        assert!(record.ips.is_empty());
    }

    #[test]
    fn no_record_without_question() {
        assert!(QueryRecord::from_message(&DnsMessage::default()).is_none());

        let mut root = DnsMessage::default();
        root.raw_query = build_query(1, ".", 2);
        root.questions = crate::wire::parse_question(&root.raw_query).into_iter().collect();
        assert!(QueryRecord::from_message(&root).is_none());
    }

    #[test]
    fn logs_exactly_one_record_per_query() {
        let (plugin, _feed) = plugin();
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        let mut msg = answered("app.example.com.", 0, &[(1, vec![10, 0, 0, 5])]);
        let before = msg.raw_response.clone();
        tracing::subscriber::with_default(subscriber, || {
            futures::executor::block_on(plugin.post_process(&mut msg)).unwrap();
        });

        let events = query_events(&capture);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["domain"], "app.example.com");
        assert_eq!(events[0]["ips"], "10.0.0.5");
        assert_eq!(events[0]["rcode"], "NOERROR");
        assert_eq!(msg.raw_response, before);
    }

    #[test]
    fn query_without_question_is_not_logged() {
        let (plugin, _feed) = plugin();
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        let mut msg = DnsMessage::default();
        tracing::subscriber::with_default(subscriber, || {
            futures::executor::block_on(plugin.post_process(&mut msg)).unwrap();
        });
        assert!(query_events(&capture).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_and_shutdown_hooks() {
        let (plugin, feed) = plugin();
        feed.add(DnsNameResolver::new("default", "web", "WWW.Example.com"));
        feed.add(DnsNameResolver::new("default", "wild", "*.example.com"));
        feed.mark_synced();

        plugin.on_startup().await.unwrap();
        assert_eq!(plugin.index().owner_of("www.example.com").as_deref(), Some("default/web"));
        assert_eq!(plugin.index().owner_of("*.example.com").as_deref(), Some("default/wild"));

        plugin.on_shutdown().await.unwrap();
        let err = plugin.on_shutdown().await.err().unwrap();
        assert_eq!(err.downcast_ref::<ResolverError>(), Some(&ResolverError::ShutdownInProgress));
    }
}
