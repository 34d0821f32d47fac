use crate::plugin::{Plugin, SharedState};
use crate::config::PluginConfig;
use crate::types::{rcode_to_str, DnsMessage};
use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use prometheus::{
    IntCounterVec, HistogramVec, GaugeVec,
    register_int_counter_vec, register_histogram_vec, register_gauge_vec,
};
use lazy_static::lazy_static;

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coredns_dns_requests_total",
        "Counter of DNS requests made per zone, protocol and family.",
        &["family", "proto", "server", "type", "zone"]
    ).unwrap();

    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coredns_dns_responses_total",
        "Counter of response status codes.",
        &["plugin", "rcode", "server", "zone"]
    ).unwrap();

    pub static ref DNS_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "coredns_dns_request_duration_seconds",
        "Histogram of the time (in seconds) each request took per zone.",
        &["server", "zone"],
        vec![0.00025, 0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096, 8.192]
    ).unwrap();

    pub static ref PROXY_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "coredns_proxy_request_duration_seconds",
        "Histogram of the time each request took.",
        &["proxy_name", "rcode", "to"],
        vec![0.00025, 0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096, 8.192]
    ).unwrap();

    pub static ref BUILD_INFO: GaugeVec = register_gauge_vec!(
        "coredns_build_info",
        "A metric with a constant '1' value labeled by version, revision, and rust_version from which CoreDNS was built.",
        &["rust_version", "revision", "version"]
    ).unwrap();

    pub static ref RESOLVER_BINDINGS: GaugeVec = register_gauge_vec!(
        "coredns_dnsnameresolver_bindings",
        "Number of DNS names currently bound to a DNSNameResolver object, per index.",
        &["kind"]
    ).unwrap();

    pub static ref RESOLVER_NOTIFICATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coredns_dnsnameresolver_notifications_total",
        "Counter of DNSNameResolver watch notifications by event and outcome.",
        &["event", "outcome"]
    ).unwrap();

    pub static ref RESOLVER_QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coredns_dnsnameresolver_queries_total",
        "Counter of queries observed by the dnsnameresolver plugin per response code.",
        &["rcode"]
    ).unwrap();
}

pub struct PrometheusPlugin {
    _handle: tokio::task::JoinHandle<()>,
}

#[async_trait::async_trait]
impl Plugin for PrometheusPlugin {
    fn name(&self) -> &str { "prometheus" }

    fn from_config(config: &PluginConfig, _shared: Arc<SharedState>) -> Result<Self> {
        let mut port = config.args.first().cloned().unwrap_or_else(|| ":9153".to_string());
        if !port.contains(':') { port = format!(":{}", port); }
        let addr = format!("0.0.0.0{}", port);

        let pkg_version = env!("CARGO_PKG_VERSION");
        BUILD_INFO.with_label_values(&["rustc", "rust-rewrite", pkg_version]).set(1.0);

        let handle = tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::info!("[prometheus] Successfully bound metrics listener on {}", addr);
                    while let Ok((stream, _)) = listener.accept().await {
                        tokio::spawn(serve_metrics(stream));
                    }
                }
                Err(_) => {
                    tracing::info!("[prometheus] Port {} is already active (shared with another zone).", addr);
                }
            }
        });

        Ok(Self { _handle: handle })
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<DnsMessage> {
        let server_label = format!("dns://:{}", msg.server_port.unwrap_or(53));
        let qtype = msg.questions.first().map(|q| format!("{:?}", q.qtype)).unwrap_or_else(|| "UNKNOWN".to_string());

        let family = match msg.client_addr {
            Some(std::net::SocketAddr::V6(_)) => "2",
            _ => "1",
        };

        DNS_REQUESTS_TOTAL.with_label_values(&[family, &msg.protocol, &server_label, &qtype, "."]).inc();
        msg.start_time = Some(std::time::Instant::now());
        Ok(msg.clone())
    }

    async fn post_process(&self, msg: &mut DnsMessage) -> Result<()> {
        let server_label = format!("dns://:{}", msg.server_port.unwrap_or(53));

        if let Some(start) = msg.start_time {
            DNS_REQUEST_DURATION.with_label_values(&[&server_label, "."]).observe(start.elapsed().as_secs_f64());
        }

        if msg.raw_response.is_some() {
            let plugin_name = if msg.answered_by.is_empty() { "unknown" } else { &msg.answered_by };
            DNS_RESPONSES_TOTAL.with_label_values(&[plugin_name, rcode_to_str(msg.header.rcode), &server_label, "."]).inc();
        }
        Ok(())
    }

    fn priority(&self) -> u8 { 150 }
}

impl Drop for PrometheusPlugin {
    fn drop(&mut self) { self._handle.abort(); }
}

async fn serve_metrics(mut stream: tokio::net::TcpStream) {
    // 缓冲区放大到 8KB，一次读完浏览器的请求头
    let mut buf = [0u8; 8192];
    let read = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf)).await;
    let Ok(Ok(n)) = read else { return };
    if n == 0 || !buf.starts_with(b"GET ") { return; }

    let body = match render_metrics() {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("[prometheus] Failed to encode metrics: {}", e);
            return;
        }
    };
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);

    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), stream.write_all(&response)).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

pub fn render_metrics() -> Result<Vec<u8>> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}
