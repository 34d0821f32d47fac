//! Basic types for CoreDNS

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

pub const RCODE_SERVFAIL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QType { A, AAAA, MX, TXT, CNAME, NS, SOA, PTR, SRV, ANY, Other(u16) }

impl QType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => QType::A, 28 => QType::AAAA, 15 => QType::MX, 16 => QType::TXT,
            5 => QType::CNAME, 2 => QType::NS, 6 => QType::SOA, 12 => QType::PTR,
            33 => QType::SRV, 255 => QType::ANY, other => QType::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QClass { IN, CH, HS, Other(u16) }

impl QClass {
    pub fn from_u16(value: u16) -> Self {
        match value { 1 => QClass::IN, 3 => QClass::CH, 4 => QClass::HS, other => QClass::Other(other) }
    }
}

/// Answer records as seen by observers of the final response.
/// Only address records are decoded; everything else keeps its type code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    A { addr: Ipv4Addr },
    AAAA { addr: Ipv6Addr },
    Other { rtype: u16 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DnsHeader {
    pub id: u16,
    pub rcode: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion { pub name: String, pub qtype: QType, pub qclass: QClass }

#[derive(Debug, Clone, Default)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<Record>,

    pub raw_query: Vec<u8>,
    pub raw_response: Option<Vec<u8>>,
    pub halt_chain: bool,

    pub client_addr: Option<SocketAddr>,
    pub protocol: String,

    // --- 【监控上下文】 ---
    pub server_port: Option<u16>,
    pub start_time: Option<std::time::Instant>,
    pub answered_by: String, // 记录是哪个插件(如 "forward")响应的
}

pub fn rcode_to_str(rcode: u8) -> &'static str {
    match rcode {
        0 => "NOERROR", 1 => "FORMERR", 2 => "SERVFAIL", 3 => "NXDOMAIN", 4 => "NOTIMP", 5 => "REFUSED",
        6 => "YXDOMAIN", 7 => "YXRRSET", 8 => "NXRRSET", 9 => "NOTAUTH", 10 => "NOTZONE",
        _ => "UNKNOWN",
    }
}

pub fn parse_rcode(s: &str) -> u8 {
    match s.to_uppercase().as_str() {
        "NOERROR" => 0, "FORMERR" => 1, "SERVFAIL" => 2,
        "NXDOMAIN" => 3, "NOTIMP" => 4, "REFUSED" => 5, _ => 2,
    }
}
