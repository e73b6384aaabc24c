use std::io;

use thiserror::Error;

use crate::codec::{
    REPLY_ADDRESS_TYPE_NOT_SUPPORTED, REPLY_COMMAND_NOT_SUPPORTED, REPLY_GENERAL_FAILURE,
};

/// 握手或请求字节不合法
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("不支持的SOCKS版本: {0}")]
    UnsupportedVersion(u8),

    #[error("认证方法数量不匹配: 声明 {declared}, 实际 {actual}")]
    MethodCountMismatch { declared: usize, actual: usize },

    #[error("客户端不支持无认证方法")]
    NoAcceptableMethod,

    #[error("不支持的命令: {0}")]
    UnsupportedCommand(u8),

    #[error("保留字段必须为0: {0}")]
    InvalidReserved(u8),

    #[error("不支持的地址类型: {0}")]
    UnsupportedAddressType(u8),

    #[error("报文长度不正确: 需要 {expected}, 实际 {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("域名无效")]
    InvalidDomain,
}

impl ProtocolError {
    /// 出错时回给客户端的 REP 字段
    pub fn reply_code(&self) -> u8 {
        match self {
            ProtocolError::UnsupportedCommand(_) => REPLY_COMMAND_NOT_SUPPORTED,
            ProtocolError::UnsupportedAddressType(_) => REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            _ => REPLY_GENERAL_FAILURE,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("DNS 报文过短")]
    Truncated,

    #[error("收到的 DNS 报文不是响应")]
    NotAResponse,

    #[error("无效的主机名: {0}")]
    InvalidHostname(String),

    #[error("没有 A 记录")]
    NoAnswer,

    #[error("DNS 查询超时")]
    Timeout,

    #[error("待处理的 DNS 查询过多")]
    TooManyQueries,

    #[error("DNS 查询发送失败: {0}")]
    Send(io::ErrorKind),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("SOCKS5 协议错误: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("域名解析失败: {0}")]
    Resolution(#[from] DnsError),

    #[error("连接目标失败: {0}")]
    Connect(#[source] io::Error),

    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
