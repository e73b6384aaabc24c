//! 内置的 DNS 客户端: 通过一个非阻塞 UDP socket 发送 A 记录查询,
//! 按事务 ID 把响应交回等待中的会话.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace};
use mio::net::UdpSocket;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use crate::error::{DnsError, Result};
use crate::registry::Registry;

const HEADER_LEN: usize = 12;
const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const RCODE_MASK: u16 = 0x000F;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;
const MAX_DATAGRAM: usize = 1500;

/// 16 位事务 ID 计数器, 溢出后回绕
#[derive(Debug, Clone)]
pub struct TransactionIds {
    next: u16,
}

impl TransactionIds {
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    pub fn starting_at(next: u16) -> Self {
        Self { next }
    }

    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

impl Default for TransactionIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub id: u16,
    pub address: Option<Ipv4Addr>,
}

pub fn encode_dns_query(id: u16, hostname: &str) -> std::result::Result<Bytes, DnsError> {
    let name = hostname.trim().trim_end_matches('.');
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DnsError::InvalidHostname(hostname.to_string()));
    }

    let mut out = BytesMut::with_capacity(HEADER_LEN + name.len() + 6);
    out.put_u16(id);
    out.put_u16(FLAG_RD);
    out.put_u16(1); // QDCOUNT
    out.put_u16(0); // ANCOUNT
    out.put_u16(0); // NSCOUNT
    out.put_u16(0); // ARCOUNT

    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(DnsError::InvalidHostname(hostname.to_string()));
        }
        out.put_u8(label.len() as u8);
        out.put_slice(label.as_bytes());
    }
    out.put_u8(0);
    out.put_u16(TYPE_A);
    out.put_u16(CLASS_IN);
    Ok(out.freeze())
}

/// 只有报文头都不完整时才返回错误; 报文体有问题一律当作解析失败 (`address` 为 None)
pub fn decode_dns_response(packet: &[u8]) -> std::result::Result<DnsResponse, DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::Truncated);
    }
    let mut header = &packet[..HEADER_LEN];
    let id = header.get_u16();
    let flags = header.get_u16();
    let qdcount = header.get_u16();
    let ancount = header.get_u16();

    if flags & FLAG_QR == 0 {
        return Err(DnsError::NotAResponse);
    }
    if flags & RCODE_MASK != 0 {
        return Ok(DnsResponse { id, address: None });
    }

    let address = first_a_record(packet, qdcount, ancount);
    Ok(DnsResponse { id, address })
}

fn first_a_record(packet: &[u8], qdcount: u16, ancount: u16) -> Option<Ipv4Addr> {
    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        offset = skip_name(packet, offset)? + 4;
    }

    for _ in 0..ancount {
        offset = skip_name(packet, offset)?;
        let mut rr = packet.get(offset..offset + 10)?;
        let rr_type = rr.get_u16();
        let rr_class = rr.get_u16();
        let _ttl = rr.get_u32();
        let rdlength = rr.get_u16() as usize;
        offset += 10;

        let rdata = packet.get(offset..offset + rdlength)?;
        if rr_type == TYPE_A && rr_class == CLASS_IN && rdlength == 4 {
            return Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
        }
        offset += rdlength;
    }
    None
}

fn skip_name(packet: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *packet.get(offset)?;
        match len & 0xC0 {
            0x00 if len == 0 => return Some(offset + 1),
            0x00 => {
                offset += 1 + len as usize;
                if offset > packet.len() {
                    return None;
                }
            }
            // 压缩指针占两个字节, 名字到此结束
            0xC0 => {
                packet.get(offset + 1)?;
                return Some(offset + 2);
            }
            _ => return None,
        }
    }
}

/// 持有连到上游 DNS 服务器的 UDP socket
pub struct Resolver {
    socket: UdpSocket,
    server: SocketAddr,
    ids: TransactionIds,
}

impl Resolver {
    pub fn bind(server: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(server)?;
        Ok(Self {
            socket,
            server,
            ids: TransactionIds::new(),
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn socket_mut(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }

    /// 发出查询并登记 `id -> session`, 不等待结果
    pub fn resolve(
        &mut self,
        hostname: &str,
        session: mio::Token,
        registry: &mut Registry,
    ) -> Result<u16> {
        // 跳过仍在等待响应的 ID, 最多把整个 ID 空间走一遍
        let mut id = self.ids.next_id();
        let mut attempts = 0u32;
        while registry.query_owner(id).is_some() {
            attempts += 1;
            if attempts > u32::from(u16::MAX) {
                return Err(DnsError::TooManyQueries.into());
            }
            id = self.ids.next_id();
        }

        let query = encode_dns_query(id, hostname)?;
        match self.socket.send(&query) {
            Ok(_) => {}
            // UDP 发送缓冲区满, 当作丢包处理, 由超时兜底
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("DNS 查询 {:#06x} 发送被阻塞, 等待超时", id);
            }
            // 之前某个查询留下的 ICMP 不可达, 与本次查询无关
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!("DNS 查询 {:#06x} 发送时服务器不可达, 等待超时", id);
            }
            Err(e) => return Err(DnsError::Send(e.kind()).into()),
        }
        registry.add_query(id, session);
        debug!("DNS 查询 {:#06x}: {} -> {}", id, hostname, self.server);
        Ok(id)
    }

    /// 读取所有已到达的响应, 直到 WouldBlock
    pub fn recv(&mut self) -> io::Result<Vec<DnsResponse>> {
        let mut responses = Vec::new();
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => match decode_dns_response(&buf[..n]) {
                    Ok(response) => responses.push(response),
                    Err(e) => trace!("丢弃无法解析的 DNS 报文: {}", e),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(responses),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // 上一个查询的 ICMP 不可达会在这里报出来, 忽略即可
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!("DNS 服务器 {} 不可达", self.server);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;

    fn response_header(id: u16, flags: u16, qdcount: u16, ancount: u16) -> Vec<u8> {
        let mut response = Vec::new();
        response.extend_from_slice(&id.to_be_bytes());
        response.extend_from_slice(&flags.to_be_bytes());
        response.extend_from_slice(&qdcount.to_be_bytes());
        response.extend_from_slice(&ancount.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes()); // nscount
        response.extend_from_slice(&0u16.to_be_bytes()); // arcount
        response
    }

    fn question(response: &mut Vec<u8>) {
        response.extend_from_slice(&[
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0,
        ]);
        response.extend_from_slice(&1u16.to_be_bytes()); // qtype A
        response.extend_from_slice(&1u16.to_be_bytes()); // qclass IN
    }

    fn answer(response: &mut Vec<u8>, rr_type: u16, rdata: &[u8]) {
        response.extend_from_slice(&[0xC0, 0x0C]); // name pointer
        response.extend_from_slice(&rr_type.to_be_bytes());
        response.extend_from_slice(&1u16.to_be_bytes()); // class IN
        response.extend_from_slice(&60u32.to_be_bytes()); // ttl
        response.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        response.extend_from_slice(rdata);
    }

    #[test]
    fn query_encodes_labels_and_flags() {
        let query = encode_dns_query(0x1234, "example.com").expect("build query");
        assert_eq!(&query[0..2], &0x1234u16.to_be_bytes());
        assert_eq!(&query[2..4], &0x0100u16.to_be_bytes());
        assert_eq!(&query[4..6], &1u16.to_be_bytes());
        assert_eq!(query[12], 7);
        assert_eq!(&query[13..20], b"example");
        assert_eq!(query[20], 3);
        assert_eq!(&query[21..24], b"com");
        assert_eq!(query[24], 0);
        assert_eq!(&query[25..29], &[0, 1, 0, 1]);
    }

    #[test]
    fn query_rejects_bad_hostnames() {
        assert!(encode_dns_query(1, "").is_err());
        assert!(encode_dns_query(1, "a..b").is_err());
        let long_label = "a".repeat(64);
        assert!(encode_dns_query(1, &long_label).is_err());
        assert!(encode_dns_query(1, "example.com.").is_ok());
    }

    #[test]
    fn response_extracts_first_a_record() {
        let mut response = response_header(0x1234, 0x8180, 1, 2);
        question(&mut response);
        answer(&mut response, 5, &[3, b'w', b'w', b'w', 0xC0, 0x0C]); // CNAME
        answer(&mut response, 1, &[1, 2, 3, 4]);

        let decoded = decode_dns_response(&response).expect("parse response");
        assert_eq!(decoded.id, 0x1234);
        assert_eq!(decoded.address, Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn nxdomain_has_no_address() {
        let mut response = response_header(0x4321, 0x8183, 1, 0);
        question(&mut response);

        let decoded = decode_dns_response(&response).expect("parse response");
        assert_eq!(decoded.id, 0x4321);
        assert_eq!(decoded.address, None);
    }

    #[test]
    fn truncated_answer_has_no_address() {
        let mut response = response_header(7, 0x8180, 1, 1);
        question(&mut response);
        answer(&mut response, 1, &[1, 2, 3, 4]);
        response.truncate(response.len() - 2);

        let decoded = decode_dns_response(&response).expect("parse response");
        assert_eq!(decoded.address, None);
    }

    #[test]
    fn short_or_query_packets_are_errors() {
        assert_eq!(decode_dns_response(&[0u8; 5]), Err(DnsError::Truncated));
        let query = encode_dns_query(9, "example.com").expect("build query");
        assert_eq!(decode_dns_response(&query), Err(DnsError::NotAResponse));
    }

    #[test]
    fn transaction_ids_wrap() {
        let mut ids = TransactionIds::starting_at(u16::MAX);
        assert_eq!(ids.next_id(), u16::MAX);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn concurrent_queries_get_distinct_ids() {
        let mut registry = Registry::new();
        let mut resolver = Resolver::bind("127.0.0.1:9".parse().unwrap()).expect("bind resolver");
        resolver.ids = TransactionIds::starting_at(10);
        // 10 已被占用, 必须跳过
        registry.add_query(10, mio::Token(99));

        let a = resolver
            .resolve("a.example", mio::Token(2), &mut registry)
            .expect("query a");
        let b = resolver
            .resolve("b.example", mio::Token(3), &mut registry)
            .expect("query b");
        assert_ne!(a, b);
        assert_ne!(a, 10);
        assert_eq!(registry.query_owner(a), Some(mio::Token(2)));
        assert_eq!(registry.query_owner(b), Some(mio::Token(3)));
    }

    #[test]
    fn exhausted_id_space_is_an_error() {
        let mut registry = Registry::new();
        let mut resolver = Resolver::bind("127.0.0.1:9".parse().unwrap()).expect("bind resolver");
        for id in 0..=u16::MAX {
            registry.add_query(id, mio::Token(99));
        }

        let err = resolver
            .resolve("full.example", mio::Token(2), &mut registry)
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Resolution(DnsError::TooManyQueries)
        ));
        assert_eq!(registry.pending_queries(), usize::from(u16::MAX) + 1);
    }

    #[test]
    fn refused_server_still_registers_query() {
        // 找一个没人监听的端口
        let closed = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
        let server = closed.local_addr().expect("local addr");
        drop(closed);

        let mut registry = Registry::new();
        let mut resolver = Resolver::bind(server).expect("bind resolver");
        resolver
            .resolve("first.example", mio::Token(2), &mut registry)
            .expect("first query");
        // 等 ICMP 端口不可达落到 socket 上
        std::thread::sleep(std::time::Duration::from_millis(100));

        let id = resolver
            .resolve("second.example", mio::Token(3), &mut registry)
            .expect("second query");
        assert_eq!(registry.query_owner(id), Some(mio::Token(3)));
    }
}
