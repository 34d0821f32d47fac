use crate::config::{Config, ZoneConfig};
use crate::types::DnsMessage;
use crate::plugin::SharedState;
use crate::wire;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::{UdpSocket, TcpListener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use std::collections::HashMap;

const MAX_UDP_RESPONSE: usize = 1232;

pub struct DnsServer {
    config: Arc<Config>,
    shared: Arc<SharedState>,
}

impl DnsServer {
    pub fn new(config: Config, shared: Arc<SharedState>) -> Result<Self> {
        Ok(Self { config: Arc::new(config), shared })
    }

    /// Runs every plugin's startup hook; the first failure aborts startup.
    pub async fn startup(&self) -> Result<()> {
        for zone in &self.config.zones {
            for plugin in &zone.plugins {
                plugin.on_startup().await
                    .map_err(|e| e.context(format!("startup of plugin '{}' in zone '{}'", plugin.name(), zone.name)))?;
            }
        }
        Ok(())
    }

    /// Runs every plugin's shutdown hook. Failures are logged, not returned.
    pub async fn shutdown(&self) {
        for zone in &self.config.zones {
            for plugin in &zone.plugins {
                if let Err(e) = plugin.on_shutdown().await {
                    tracing::warn!("Shutdown of plugin '{}' in zone '{}' failed: {:#}", plugin.name(), zone.name, e);
                }
            }
        }
    }

    pub async fn run(&self, default_address: String) -> Result<()> {
        // 提取默认绑定的 IP（比如 0.0.0.0），但舍弃默认的 53 端口
        let base_ip = default_address.split(':').next().unwrap_or("0.0.0.0");

        // 按监听端口分组 (bind_addr -> Vec<Zone Index>)
        let mut bind_map: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, zone) in self.config.zones.iter().enumerate() {
            // 解析 Corefile 中定义的端口，比如 ".:1053" 提取出 "1053"
            let port = match zone.name.rfind(':') {
                Some(idx) => &zone.name[idx + 1..],
                None => "53",
            };
            bind_map.entry(format!("{}:{}", base_ip, port)).or_default().push(i);
        }

        let mut tasks = Vec::new();

        for (bind_addr, zone_indices) in bind_map {
            let udp_socket = match UdpSocket::bind(&bind_addr).await {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    tracing::error!("Failed to bind UDP {}: {}", bind_addr, e);
                    continue;
                }
            };
            let tcp_listener = match TcpListener::bind(&bind_addr).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to bind TCP {}: {}", bind_addr, e);
                    continue;
                }
            };

            let port = bind_addr.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()).unwrap_or(53);
            tracing::info!("Server bound to TCP & UDP on {} for {} zone(s)", bind_addr, zone_indices.len());

            // 默认分配给绑定在该端口上的第一个 Zone 块配置
            let target_zone = zone_indices[0];

            // UDP 协议处理流水线
            let config_udp = self.config.clone();
            let socket_udp = udp_socket.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let Ok((size, src)) = socket_udp.recv_from(&mut buf).await else { continue };
                    let query = buf[..size].to_vec();
                    let config = config_udp.clone();
                    let socket = socket_udp.clone();

                    tokio::spawn(async move {
                        let msg = new_message(query, src, "udp", port);
                        let final_msg = run_chain(&config.zones[target_zone], msg).await;
                        if let Some(mut resp) = final_msg.raw_response {
                            if resp.len() > MAX_UDP_RESPONSE {
                                resp.truncate(MAX_UDP_RESPONSE);
                                resp[2] |= 0x02; // 打上 TC(Truncated) 截断标志
                            }
                            let _ = socket.send_to(&resp, src).await;
                        }
                    });
                }
            }));

            // TCP 协议处理流水线
            let config_tcp = self.config.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let Ok((mut stream, src)) = tcp_listener.accept().await else { continue };
                    let config = config_tcp.clone();

                    tokio::spawn(async move {
                        let mut len_buf = [0u8; 2];
                        if stream.read_exact(&mut len_buf).await.is_err() { return; }
                        let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                        if stream.read_exact(&mut query).await.is_err() { return; }

                        let msg = new_message(query, src, "tcp", port);
                        let final_msg = run_chain(&config.zones[target_zone], msg).await;
                        if let Some(resp) = final_msg.raw_response {
                            let resp_len = resp.len() as u16;
                            let _ = stream.write_all(&resp_len.to_be_bytes()).await;
                            let _ = stream.write_all(&resp).await;
                        }
                    });
                }
            }));
        }

        if tasks.is_empty() {
            anyhow::bail!("no listener could be bound");
        }

        // 等待退出信号，随后取消所有端口的监听任务
        let mut shutdown_rx = self.shared.shutdown_rx.clone();
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() { break; }
        }
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

fn new_message(raw_query: Vec<u8>, src: std::net::SocketAddr, protocol: &str, port: u16) -> DnsMessage {
    let mut msg = DnsMessage::default();
    msg.header.id = wire::message_id(&raw_query).unwrap_or_default();
    msg.questions = wire::parse_question(&raw_query).into_iter().collect();
    msg.raw_query = raw_query;
    msg.client_addr = Some(src);
    msg.protocol = protocol.to_string();
    msg.server_port = Some(port);
    msg
}

/// Forward pass in priority order until a plugin halts the chain, then the
/// reverse pass over every plugin with the final answer decoded.
pub async fn run_chain(zone: &ZoneConfig, msg: DnsMessage) -> DnsMessage {
    let mut final_msg = msg;
    for plugin in &zone.plugins {
        if final_msg.halt_chain { break; }
        match plugin.process(&mut final_msg).await {
            Ok(new_msg) => final_msg = new_msg,
            Err(e) => tracing::warn!("Plugin '{}' failed on TxID {:#06x}: {:#}", plugin.name(), final_msg.header.id, e),
        }
    }

    wire::apply_response(&mut final_msg);

    for plugin in zone.plugins.iter().rev() {
        if let Err(e) = plugin.post_process(&mut final_msg).await {
            tracing::warn!("Plugin '{}' post-processing failed: {:#}", plugin.name(), e);
        }
    }
    final_msg
}
