use crate::plugin::{Plugin, SharedState};
use crate::config::PluginConfig;
use crate::plugin::prometheus::PROXY_REQUEST_DURATION;
use crate::types::{parse_rcode, rcode_to_str, DnsMessage, RCODE_SERVFAIL};
use crate::wire;
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::{TcpStream, UdpSocket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use rand::seq::SliceRandom;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Policy { Sequential, Random, RoundRobin }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub ip: String,
    pub port: u16,
}

impl Upstream {
    fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

pub struct ForwardPlugin {
    /// Lowercased FROM zone without the trailing dot; empty for the root zone.
    pub from: String,
    pub upstreams: Vec<Upstream>,
    pub failover_rcodes: Vec<u8>,
    pub policy: Policy,
    pub except_domains: Vec<String>,
    pub force_tcp: bool,
    pub timeout: Duration,
    rr_counter: AtomicUsize,
}

fn parse_upstream(arg: &str) -> Result<Upstream> {
    let clean = arg.strip_prefix("dns://").unwrap_or(arg);
    if clean.starts_with("tls://") {
        anyhow::bail!("forward: TLS upstreams are not supported: {}", arg);
    }
    match clean.rsplit_once(':') {
        Some((ip, port)) if !ip.contains(':') || ip.starts_with('[') => {
            let port = port.parse().map_err(|_| anyhow::anyhow!("forward: invalid port in {}", arg))?;
            Ok(Upstream { ip: ip.trim_matches(|c| c == '[' || c == ']').to_string(), port })
        }
        _ => Ok(Upstream { ip: clean.to_string(), port: 53 }),
    }
}

#[async_trait::async_trait]
impl Plugin for ForwardPlugin {
    fn name(&self) -> &str { "forward" }

    fn from_config(config: &PluginConfig, _shared: Arc<SharedState>) -> Result<Self> {
        let mut args = config.args.iter();
        let from = args.next().cloned().ok_or_else(|| anyhow::anyhow!("forward: missing FROM zone"))?;
        let upstreams = args.map(|a| parse_upstream(a)).collect::<Result<Vec<_>>>()?;
        if upstreams.is_empty() {
            anyhow::bail!("forward: at least one upstream is required");
        }

        let mut failover_rcodes = Vec::new();
        let mut policy = Policy::Random;
        let mut except_domains = Vec::new();
        let mut force_tcp = false;
        let mut request_timeout = Duration::from_secs(2);

        for sub in &config.block {
            match sub.name.as_str() {
                "failover" => { for arg in &sub.args { failover_rcodes.push(parse_rcode(arg)); } }
                "except" => { except_domains = sub.args.iter().map(|d| d.trim_end_matches('.').to_lowercase()).collect(); }
                "force_tcp" => { force_tcp = true; }
                "timeout" => {
                    if let Some(a) = sub.args.first() { request_timeout = parse_duration(a)?; }
                }
                "policy" => {
                    if let Some(p) = sub.args.first() {
                        policy = match p.as_str() {
                            "sequential" => Policy::Sequential,
                            "round_robin" => Policy::RoundRobin,
                            "random" => Policy::Random,
                            other => anyhow::bail!("forward: unknown policy {:?}", other),
                        };
                    }
                }
                other => anyhow::bail!("forward: unknown property {:?}", other),
            }
        }

        tracing::info!("[forward] {} -> {:?} (Policy: {:?}, force_tcp: {})", from, upstreams, policy, force_tcp);

        let from = from.trim_end_matches('.').to_lowercase();
        Ok(Self {
            from, upstreams, failover_rcodes, policy, except_domains, force_tcp,
            timeout: request_timeout,
            rr_counter: AtomicUsize::new(0),
        })
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<DnsMessage> {
        if msg.halt_chain || msg.raw_query.is_empty() { return Ok(msg.clone()); }

        let qname = msg.questions.first().map(|q| q.name.clone()).unwrap_or_else(|| ".".to_string());
        let lowered = qname.trim_end_matches('.').to_lowercase();
        if !in_zone(&lowered, &self.from) {
            tracing::debug!("Domain '{}' is outside forward zone '{}', skipping forward.", qname, self.from);
            return Ok(msg.clone());
        }
        if self.except_domains.iter().any(|ex| in_zone(&lowered, ex)) {
            tracing::debug!("Domain '{}' matches except rule, skipping forward.", qname);
            return Ok(msg.clone());
        }

        for idx in self.upstream_order() {
            let upstream = &self.upstreams[idx];
            let upstream_addr = upstream.addr();
            tracing::debug!("TxID: {:#06x} -> Trying {} for '{}' (Policy: {:?})", msg.header.id, upstream_addr, qname, self.policy);

            let start_req = std::time::Instant::now();
            let result = self.exchange(upstream, &msg.raw_query).await;
            let duration = start_req.elapsed().as_secs_f64();

            match result {
                Ok(response_bytes) => {
                    let rcode = wire::response_rcode(&response_bytes).unwrap_or(RCODE_SERVFAIL);
                    let rcode_str = rcode_to_str(rcode);
                    PROXY_REQUEST_DURATION.with_label_values(&["forward", rcode_str, &upstream_addr]).observe(duration);

                    if self.failover_rcodes.contains(&rcode) {
                        tracing::warn!("Upstream {} returned failover RCODE {} for '{}' in {:.4}s, triggering retry...", upstream_addr, rcode_str, qname, duration);
                        continue;
                    }

                    tracing::debug!("Resolved '{}' via {} in {:.4}s, RCODE: {}", qname, upstream_addr, duration, rcode_str);
                    msg.raw_response = Some(response_bytes);
                    msg.answered_by = "forward".to_string();
                    msg.halt_chain = true;
                    return Ok(msg.clone());
                }
                Err(e) => {
                    PROXY_REQUEST_DURATION.with_label_values(&["forward", "SERVFAIL", &upstream_addr]).observe(duration);
                    tracing::warn!("Upstream {} failed for '{}' in {:.4}s: {}", upstream_addr, qname, duration, e);
                }
            }
        }

        // 所有上游都失败，返回 SERVFAIL
        msg.raw_response = Some(build_error_response(&msg.raw_query, RCODE_SERVFAIL));
        msg.answered_by = "forward".to_string();
        msg.halt_chain = true;
        Ok(msg.clone())
    }

    fn priority(&self) -> u8 { 100 }
}

impl ForwardPlugin {
    fn upstream_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.upstreams.len()).collect();
        match self.policy {
            Policy::Sequential => {}
            Policy::Random => { order.shuffle(&mut rand::thread_rng()); }
            Policy::RoundRobin => {
                if !order.is_empty() {
                    let start = self.rr_counter.fetch_add(1, Ordering::Relaxed) % order.len();
                    order.rotate_left(start);
                }
            }
        }
        order
    }

    async fn exchange(&self, up: &Upstream, query: &[u8]) -> Result<Vec<u8>> {
        if self.force_tcp {
            return self.send_tcp(up, query).await;
        }
        let resp = self.send_udp(up, query).await?;
        // TC 位被置位时改用 TCP 重新查询
        if wire::is_truncated(&resp) {
            return self.send_tcp(up, query).await;
        }
        Ok(resp)
    }

    async fn send_udp(&self, up: &Upstream, query: &[u8]) -> Result<Vec<u8>> {
        let bind = if up.ip.contains(':') { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect((up.ip.as_str(), up.port)).await?;
        socket.send(query).await?;
        let mut buf = vec![0u8; 4096];
        let len = timeout(self.timeout, socket.recv(&mut buf)).await??;
        buf.truncate(len);
        if buf.len() < 12 { anyhow::bail!("short response ({} bytes)", buf.len()); }
        Ok(buf)
    }

    async fn send_tcp(&self, up: &Upstream, query: &[u8]) -> Result<Vec<u8>> {
        let mut stream = timeout(self.timeout, TcpStream::connect((up.ip.as_str(), up.port))).await??;
        let len = query.len() as u16;
        let mut req = len.to_be_bytes().to_vec();
        req.extend_from_slice(query);
        stream.write_all(&req).await?;

        let mut len_buf = [0u8; 2];
        timeout(self.timeout, stream.read_exact(&mut len_buf)).await??;
        let mut resp = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        timeout(self.timeout, stream.read_exact(&mut resp)).await??;
        if resp.len() < 12 { anyhow::bail!("short response ({} bytes)", resp.len()); }
        Ok(resp)
    }
}

/// `name` equals `zone` or is a subdomain of it; the empty zone is the root.
fn in_zone(name: &str, zone: &str) -> bool {
    zone.is_empty() || name == zone || name.ends_with(&format!(".{}", zone))
}

fn build_error_response(query: &[u8], rcode: u8) -> Vec<u8> {
    let mut resp = query.to_vec();
    if resp.len() >= 4 { resp[2] |= 0x80; resp[3] = (resp[3] & 0xF0) | (rcode & 0x0F); }
    resp
}

pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix("ms") { Ok(Duration::from_millis(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('s') { Ok(Duration::from_secs(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('m') { Ok(Duration::from_secs(stripped.parse::<u64>()? * 60)) }
    else { anyhow::bail!("invalid duration {:?}", s) }
}
