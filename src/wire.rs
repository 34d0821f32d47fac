//! Read-only helpers over raw DNS messages.
//!
//! The listener keeps queries and responses as raw bytes; these helpers pull out
//! the few fields that plugins observe (first question, response code, address
//! answers). Nothing here ever writes a message.

use crate::types::{DnsMessage, DnsQuestion, QClass, QType, Record};
use std::net::{Ipv4Addr, Ipv6Addr};

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;

/// Decoded view of a response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseView {
    pub rcode: u8,
    pub answers: Vec<Record>,
}

pub fn message_id(raw: &[u8]) -> Option<u16> {
    if raw.len() < HEADER_LEN { return None; }
    Some(u16::from_be_bytes([raw[0], raw[1]]))
}

/// First question of a query. The name keeps its trailing root dot, like the
/// presentation format of a fully qualified name (`example.com.`, root is `.`).
pub fn parse_question(raw: &[u8]) -> Option<DnsQuestion> {
    if raw.len() < HEADER_LEN || read_u16(raw, 4)? == 0 { return None; }
    let (name, offset) = read_name(raw, HEADER_LEN)?;
    let qtype = read_u16(raw, offset)?;
    let qclass = read_u16(raw, offset + 2)?;
    Some(DnsQuestion { name, qtype: QType::from_u16(qtype), qclass: QClass::from_u16(qclass) })
}

/// Response code from the header alone, readable even when the sections
/// after it are not.
pub fn response_rcode(raw: &[u8]) -> Option<u8> {
    if raw.len() < HEADER_LEN { return None; }
    Some(raw[3] & 0x0F)
}

pub fn is_truncated(raw: &[u8]) -> bool {
    raw.len() >= HEADER_LEN && raw[2] & 0x02 != 0
}

/// Response code and answer section of a response.
pub fn parse_response(raw: &[u8]) -> Option<ResponseView> {
    let rcode = response_rcode(raw)?;
    let qdcount = read_u16(raw, 4)?;
    let ancount = read_u16(raw, 6)?;

    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        offset = skip_name(raw, offset)? + 4;
    }

    let mut answers = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        offset = skip_name(raw, offset)?;
        let rtype = read_u16(raw, offset)?;
        let rdlen = read_u16(raw, offset + 8)? as usize;
        let rdata_start = offset + 10;
        let rdata = raw.get(rdata_start..rdata_start + rdlen)?;
        let record = match (rtype, rdlen) {
            (TYPE_A, 4) => Record::A { addr: Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]) },
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                Record::AAAA { addr: Ipv6Addr::from(octets) }
            }
            _ => Record::Other { rtype },
        };
        answers.push(record);
        offset = rdata_start + rdlen;
    }

    Some(ResponseView { rcode, answers })
}

/// Copies the response code and answers of `msg.raw_response` into the
/// decoded fields so `post_process` hooks see the final answer.
pub fn apply_response(msg: &mut DnsMessage) {
    let view = msg.raw_response.as_deref().and_then(parse_response);
    match view {
        Some(view) => {
            msg.header.rcode = view.rcode;
            msg.answers = view.answers;
        }
        None => {
            // 答案段损坏时仍以报文头中的 RCODE 为准
            if let Some(raw) = msg.raw_response.as_deref() {
                if let Some(rcode) = response_rcode(raw) {
                    msg.header.rcode = rcode;
                }
                tracing::debug!("Unreadable response for TxID {:#06x}, answers left empty", msg.header.id);
            }
            msg.answers.clear();
        }
    }
}

fn read_u16(raw: &[u8], offset: usize) -> Option<u16> {
    let bytes = raw.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Uncompressed name read, as found in the question of a query.
fn read_name(raw: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    loop {
        let len = *raw.get(offset)? as usize;
        offset += 1;
        if len == 0 { break; }
        // 查询报文中的问题段不会出现压缩指针
        if len & 0xC0 != 0 { return None; }
        let label = raw.get(offset..offset + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += len;
    }
    let name = if labels.is_empty() { ".".to_string() } else { format!("{}.", labels.join(".")) };
    Some((name, offset))
}

fn skip_name(raw: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *raw.get(offset)? as usize;
        if len & 0xC0 == 0xC0 {
            raw.get(offset + 1)?;
            return Some(offset + 2);
        }
        offset += 1;
        if len == 0 { return Some(offset); }
        offset += len;
    }
}
