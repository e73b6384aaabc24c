//! SOCKS5 握手/请求/应答的编解码, 不做任何 I/O.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use crate::error::ProtocolError;

pub const SOCKS_VERSION: u8 = 0x05;
pub const NO_AUTHENTICATION: u8 = 0x00;
pub const NO_ACCEPTABLE_METHOD: u8 = 0xFF;
pub const CONNECT_COMMAND: u8 = 0x01;
pub const RESERVED: u8 = 0x00;
pub const IPV4_ADDRESS: u8 = 0x01;
pub const DOMAIN_NAME: u8 = 0x03;

// 协议状态码
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

pub const REPLY_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub addr: TargetAddr,
    pub port: u16,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.addr {
            TargetAddr::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            TargetAddr::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// 完整的握手报文需要多少字节; 数据还不够判断时返回 None
pub fn greeting_len(buf: &[u8]) -> Option<usize> {
    match buf.first() {
        None => return None,
        // 版本不对不必再等, 直接交给 decode_greeting 拒绝
        Some(&version) if version != SOCKS_VERSION => return Some(buf.len()),
        Some(_) if buf.len() < 2 => return None,
        Some(_) => {}
    }
    let need = 2 + buf[1] as usize;
    (buf.len() >= need).then_some(need)
}

/// 完整的请求报文需要多少字节. 地址类型不认识时只要 4 字节头,
/// 交给 `decode_request` 报错.
pub fn request_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let need = match buf[3] {
        IPV4_ADDRESS => 4 + 4 + 2,
        DOMAIN_NAME => {
            if buf.len() < 5 {
                return None;
            }
            4 + 1 + buf[4] as usize + 2
        }
        _ => 4,
    };
    (buf.len() >= need).then_some(need)
}

pub fn decode_greeting(mut buf: &[u8]) -> Result<Greeting, ProtocolError> {
    if buf.len() < 2 {
        return Err(ProtocolError::BadLength {
            expected: 2,
            actual: buf.len(),
        });
    }
    let version = buf.get_u8();
    if version != SOCKS_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let nmethods = buf.get_u8() as usize;
    if buf.remaining() != nmethods {
        return Err(ProtocolError::MethodCountMismatch {
            declared: nmethods,
            actual: buf.remaining(),
        });
    }

    let methods = buf.to_vec();
    if !methods.contains(&NO_AUTHENTICATION) {
        return Err(ProtocolError::NoAcceptableMethod);
    }
    Ok(Greeting { methods })
}

pub fn encode_greeting_reply(accepted: bool) -> Bytes {
    if accepted {
        Bytes::from_static(&[SOCKS_VERSION, NO_AUTHENTICATION])
    } else {
        Bytes::from_static(&[SOCKS_VERSION, NO_ACCEPTABLE_METHOD])
    }
}

pub fn decode_request(frame: &[u8]) -> Result<Request, ProtocolError> {
    let total = frame.len();
    if total < 4 {
        return Err(ProtocolError::BadLength {
            expected: 4,
            actual: total,
        });
    }

    let mut buf = frame;
    let version = buf.get_u8();
    let command = buf.get_u8();
    let reserved = buf.get_u8();
    let address_type = buf.get_u8();

    if version != SOCKS_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    if command != CONNECT_COMMAND {
        return Err(ProtocolError::UnsupportedCommand(command));
    }
    if reserved != RESERVED {
        return Err(ProtocolError::InvalidReserved(reserved));
    }

    let expected = match address_type {
        IPV4_ADDRESS => 10,
        DOMAIN_NAME if buf.has_remaining() => 7 + buf[0] as usize,
        DOMAIN_NAME => 5,
        other => return Err(ProtocolError::UnsupportedAddressType(other)),
    };
    if total != expected {
        return Err(ProtocolError::BadLength {
            expected,
            actual: total,
        });
    }

    let addr = if address_type == IPV4_ADDRESS {
        TargetAddr::Ipv4(Ipv4Addr::from(buf.get_u32()))
    } else {
        let len = buf.get_u8() as usize;
        let name = std::str::from_utf8(&buf[..len]).map_err(|_| ProtocolError::InvalidDomain)?;
        if name.is_empty() {
            return Err(ProtocolError::InvalidDomain);
        }
        let name = name.to_string();
        buf.advance(len);
        TargetAddr::Domain(name)
    };
    let port = buf.get_u16();

    Ok(Request {
        command,
        addr,
        port,
    })
}

pub fn encode_reply(status: u8, bound_addr: Ipv4Addr, bound_port: u16) -> Bytes {
    let mut out = BytesMut::with_capacity(REPLY_LEN);
    out.put_u8(SOCKS_VERSION);
    out.put_u8(status);
    out.put_u8(RESERVED);
    out.put_u8(IPV4_ADDRESS);
    out.put_slice(&bound_addr.octets());
    out.put_u16(bound_port);
    out.freeze()
}

/// 失败应答, 绑定地址填 0.0.0.0:0
pub fn encode_failure(status: u8) -> Bytes {
    encode_reply(status, Ipv4Addr::UNSPECIFIED, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_with_no_auth_is_accepted() {
        let greeting = decode_greeting(&[0x05, 0x02, 0x02, 0x00]).expect("decode greeting");
        assert_eq!(greeting.methods, vec![0x02, 0x00]);
        assert_eq!(&encode_greeting_reply(true)[..], &[0x05, 0x00]);
    }

    #[test]
    fn greeting_without_no_auth_is_rejected() {
        assert_eq!(
            decode_greeting(&[0x05, 0x01, 0x02]),
            Err(ProtocolError::NoAcceptableMethod)
        );
        assert_eq!(&encode_greeting_reply(false)[..], &[0x05, 0xFF]);
    }

    #[test]
    fn greeting_checks_version_and_count() {
        assert_eq!(
            decode_greeting(&[0x04, 0x01, 0x00]),
            Err(ProtocolError::UnsupportedVersion(4))
        );
        assert_eq!(
            decode_greeting(&[0x05, 0x02, 0x00]),
            Err(ProtocolError::MethodCountMismatch {
                declared: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn greeting_len_waits_for_methods() {
        assert_eq!(greeting_len(&[0x05]), None);
        assert_eq!(greeting_len(&[0x05, 0x02, 0x00]), None);
        assert_eq!(greeting_len(&[0x05, 0x02, 0x00, 0x01, 0x05]), Some(4));
        assert_eq!(greeting_len(&[0x04, 0x01]), Some(2));
    }

    #[test]
    fn decodes_ipv4_connect() {
        let frame = [0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        assert_eq!(request_len(&frame), Some(10));
        let request = decode_request(&frame).expect("decode request");
        assert_eq!(request.addr, TargetAddr::Ipv4(Ipv4Addr::LOCALHOST));
        assert_eq!(request.port, 80);
        assert_eq!(request.to_string(), "127.0.0.1:80");
    }

    #[test]
    fn decodes_domain_connect() {
        let mut frame = vec![0x05, 0x01, 0x00, 0x03, 11];
        frame.extend_from_slice(b"example.com");
        frame.extend_from_slice(&443u16.to_be_bytes());
        assert_eq!(request_len(&frame[..6]), None);
        assert_eq!(request_len(&frame), Some(frame.len()));

        let request = decode_request(&frame).expect("decode request");
        assert_eq!(request.addr, TargetAddr::Domain("example.com".to_string()));
        assert_eq!(request.port, 443);
    }

    #[test]
    fn rejects_unsupported_requests() {
        let bind = [0x05, 0x02, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        let err = decode_request(&bind).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedCommand(0x02));
        assert_eq!(err.reply_code(), REPLY_COMMAND_NOT_SUPPORTED);

        let ipv6 = [0x05, 0x01, 0x00, 0x04];
        assert_eq!(request_len(&ipv6), Some(4));
        let err = decode_request(&ipv6).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedAddressType(0x04));
        assert_eq!(err.reply_code(), REPLY_ADDRESS_TYPE_NOT_SUPPORTED);

        let reserved = [0x05, 0x01, 0x01, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];
        assert_eq!(
            decode_request(&reserved),
            Err(ProtocolError::InvalidReserved(0x01))
        );
    }

    #[test]
    fn rejects_request_with_wrong_length() {
        let short = [0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00];
        assert!(matches!(
            decode_request(&short),
            Err(ProtocolError::BadLength { expected: 10, .. })
        ));
    }

    #[test]
    fn reply_layout() {
        let reply = encode_reply(REPLY_SUCCEEDED, Ipv4Addr::new(10, 0, 0, 2), 0x1F90);
        assert_eq!(
            &reply[..],
            &[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 2, 0x1F, 0x90]
        );
        assert_eq!(
            &encode_failure(REPLY_GENERAL_FAILURE)[..],
            &[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }
}
