//! 每个客户端连接一个 `Session`: 握手状态机, 等待 DNS 与上游连接时的缓存,
//! 以及转发阶段的双向搬运.

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use crate::codec::{self, REPLY_GENERAL_FAILURE, REPLY_SUCCEEDED, TargetAddr};
use crate::config::Config;
use crate::dns::Resolver;
use crate::error::{DnsError, ProxyError, Result};
use crate::registry::Registry;
use crate::relay::{self, Flush, Outbox, ReadOutcome};

/// 上游未连通前最多缓存的客户端数据
pub const MAX_PENDING: usize = 64 * 1024;
/// 失败应答最多等待这么久写完
const LINGER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    AwaitGreeting,
    AwaitRequest,
    AwaitResolution,
    AwaitUpstreamConnect,
    Relaying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

/// 一次分发期间会话能用到的共享状态
pub struct Context<'a> {
    pub poll: &'a mio::Registry,
    pub registry: &'a mut Registry,
    pub resolver: &'a mut Resolver,
    pub config: &'a Config,
}

struct Upstream {
    token: Token,
    stream: TcpStream,
}

pub struct Session {
    id: Token,
    peer: SocketAddr,
    client: TcpStream,
    upstream: Option<Upstream>,
    stage: Stage,
    inbound: BytesMut,
    pending_outbound: Outbox,
    to_client: Outbox,
    to_upstream: Outbox,
    target: String,
    target_port: u16,
    query: Option<u16>,
    deadline: Option<Instant>,
    closing: bool,
    destroyed: bool,
}

impl Session {
    /// 客户端 socket 需已用 `id` 注册了可读事件
    pub fn new(id: Token, client: TcpStream, peer: SocketAddr, config: &Config) -> Self {
        Self {
            id,
            peer,
            client,
            upstream: None,
            stage: Stage::AwaitGreeting,
            inbound: BytesMut::new(),
            pending_outbound: Outbox::new(),
            to_client: Outbox::new(),
            to_upstream: Outbox::new(),
            target: String::new(),
            target_port: 0,
            query: None,
            deadline: Some(Instant::now() + config.handshake_timeout),
            closing: false,
            destroyed: false,
        }
    }

    pub fn id(&self) -> Token {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn deadline(&self) -> Option<Instant> {
        if self.destroyed { None } else { self.deadline }
    }

    pub fn upstream_token(&self) -> Option<Token> {
        self.upstream.as_ref().map(|up| up.token)
    }

    pub fn pending_len(&self) -> usize {
        self.pending_outbound.len()
    }

    /// 处理一个 socket 的就绪事件, 每种就绪最多回调一次
    pub fn on_event(
        &mut self,
        ctx: &mut Context<'_>,
        side: Side,
        readable: bool,
        writable: bool,
    ) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if side == Side::Upstream && self.stage == Stage::AwaitUpstreamConnect {
            return self.on_connect(ctx);
        }
        if readable {
            self.on_readable(ctx, side)?;
        }
        if writable && !self.destroyed {
            self.on_writable(ctx, side)?;
        }
        Ok(())
    }

    pub fn on_readable(&mut self, ctx: &mut Context<'_>, side: Side) -> Result<()> {
        match side {
            Side::Client => self.read_client(ctx),
            Side::Upstream if self.stage == Stage::AwaitUpstreamConnect => self.on_connect(ctx),
            Side::Upstream if self.stage == Stage::Relaying => self.pump(ctx, Side::Upstream),
            Side::Upstream => Ok(()),
        }
    }

    pub fn on_writable(&mut self, ctx: &mut Context<'_>, side: Side) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        match side {
            Side::Client => {
                if self.flush(ctx, Side::Client)? == Flush::Drained {
                    if self.closing {
                        self.destroy(ctx);
                    } else if self.stage == Stage::Relaying {
                        self.pump(ctx, Side::Upstream)?;
                    }
                }
                Ok(())
            }
            Side::Upstream if self.stage == Stage::AwaitUpstreamConnect => self.on_connect(ctx),
            Side::Upstream if self.stage == Stage::Relaying => {
                if self.flush(ctx, Side::Upstream)? == Flush::Drained {
                    self.pump(ctx, Side::Client)?;
                }
                Ok(())
            }
            Side::Upstream => Ok(()),
        }
    }

    fn read_client(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        loop {
            if self.destroyed || self.closing {
                return Ok(());
            }
            match self.stage {
                Stage::Relaying => return self.pump(ctx, Side::Client),
                // 缓存已满, 上游连通后再继续读
                Stage::AwaitResolution | Stage::AwaitUpstreamConnect
                    if self.pending_outbound.len() >= MAX_PENDING =>
                {
                    return Ok(());
                }
                _ => {}
            }

            let chunk = match relay::read_chunk(&mut self.client)? {
                ReadOutcome::Data(chunk) => chunk,
                ReadOutcome::WouldBlock => return Ok(()),
                ReadOutcome::Eof => {
                    debug!("客户端 {} 关闭连接 ({:?})", self.peer, self.stage);
                    self.destroy(ctx);
                    return Ok(());
                }
            };

            match self.stage {
                Stage::AwaitGreeting | Stage::AwaitRequest => {
                    self.inbound.extend_from_slice(&chunk);
                    self.advance_handshake(ctx)?;
                }
                _ => {
                    trace!("{} 上游未就绪, 缓存 {} 字节", self.peer, chunk.len());
                    self.pending_outbound.push(chunk);
                }
            }
        }
    }

    fn advance_handshake(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        loop {
            match self.stage {
                Stage::AwaitGreeting => {
                    let Some(len) = codec::greeting_len(&self.inbound) else {
                        return Ok(());
                    };
                    let frame = self.inbound.split_to(len);
                    if let Err(e) = codec::decode_greeting(&frame) {
                        warn!("{} 握手失败: {}", self.peer, e);
                        self.close_with(ctx, codec::encode_greeting_reply(false))?;
                        return Ok(());
                    }
                    self.send_to_client(ctx, codec::encode_greeting_reply(true))?;
                    self.stage = Stage::AwaitRequest;
                    debug!("{} 握手成功", self.peer);
                }
                Stage::AwaitRequest => {
                    let Some(len) = codec::request_len(&self.inbound) else {
                        return Ok(());
                    };
                    let frame = self.inbound.split_to(len);
                    let request = match codec::decode_request(&frame) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!("{} 请求无效: {}", self.peer, e);
                            self.close_with(ctx, codec::encode_failure(e.reply_code()))?;
                            return Ok(());
                        }
                    };

                    // 请求之后跟着的数据属于转发内容
                    let rest = self.inbound.split().freeze();
                    self.pending_outbound.push(rest);
                    self.target = request.to_string();
                    self.target_port = request.port;
                    info!("{} 请求连接 {}", self.peer, self.target);

                    return match request.addr {
                        TargetAddr::Ipv4(ip) => self.connect(ctx, ip),
                        TargetAddr::Domain(name) => match name.parse::<Ipv4Addr>() {
                            Ok(ip) => self.connect(ctx, ip),
                            Err(_) => self.resolve(ctx, &name),
                        },
                    };
                }
                _ => return Ok(()),
            }
        }
    }

    fn resolve(&mut self, ctx: &mut Context<'_>, name: &str) -> Result<()> {
        match ctx.resolver.resolve(name, self.id, ctx.registry) {
            Ok(id) => {
                self.query = Some(id);
                self.stage = Stage::AwaitResolution;
                self.deadline = Some(Instant::now() + ctx.config.dns_timeout);
                Ok(())
            }
            Err(ProxyError::Resolution(e)) => {
                warn!("{} 无法解析 {}: {}", self.peer, self.target, e);
                self.close_with(ctx, codec::encode_failure(REPLY_GENERAL_FAILURE))
            }
            Err(e) => Err(e),
        }
    }

    /// DNS 结果到达, 每个查询只回调一次
    pub fn on_resolved(&mut self, ctx: &mut Context<'_>, address: Option<Ipv4Addr>) -> Result<()> {
        self.query = None;
        if self.destroyed || self.stage != Stage::AwaitResolution {
            return Ok(());
        }
        match address {
            Some(ip) => {
                debug!("{} 解析为 {}", self.target, ip);
                self.connect(ctx, ip)
            }
            None => {
                warn!("{} 无法解析 {}: {}", self.peer, self.target, DnsError::NoAnswer);
                self.close_with(ctx, codec::encode_failure(REPLY_GENERAL_FAILURE))
            }
        }
    }

    fn connect(&mut self, ctx: &mut Context<'_>, ip: Ipv4Addr) -> Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(ip), self.target_port);
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{} 连接 {} 失败: {}", self.peer, addr, ProxyError::Connect(e));
                return self.close_with(ctx, codec::encode_failure(REPLY_GENERAL_FAILURE));
            }
        };

        let token = ctx.registry.add_upstream(self.id);
        if let Err(e) = ctx
            .poll
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
        {
            ctx.registry.remove(token);
            return Err(e.into());
        }
        self.upstream = Some(Upstream { token, stream });
        self.stage = Stage::AwaitUpstreamConnect;
        self.deadline = Some(Instant::now() + ctx.config.connect_timeout);
        Ok(())
    }

    fn on_connect(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        let Some(up) = self.upstream.as_mut() else {
            return Ok(());
        };

        let failure = match up.stream.take_error() {
            Ok(Some(e)) | Err(e) => Some(e),
            Ok(None) => match up.stream.peer_addr() {
                Ok(_) => None,
                // 还没连上, 等下一个事件
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                Err(e) => Some(e),
            },
        };
        if let Some(e) = failure {
            warn!("{} 连接 {} 失败: {}", self.peer, self.target, ProxyError::Connect(e));
            return self.close_with(ctx, codec::encode_failure(REPLY_GENERAL_FAILURE));
        }

        let (bound_addr, bound_port) = match up.stream.local_addr()? {
            SocketAddr::V4(local) => (*local.ip(), local.port()),
            SocketAddr::V6(local) => (Ipv4Addr::UNSPECIFIED, local.port()),
        };
        ctx.poll.reregister(&mut up.stream, up.token, Interest::READABLE)?;
        self.to_upstream.set_write_interest(false);

        info!("{} 已连接 {}", self.peer, self.target);
        self.stage = Stage::Relaying;
        self.deadline = ctx.config.idle_timeout.map(|idle| Instant::now() + idle);

        self.send_to_client(ctx, codec::encode_reply(REPLY_SUCCEEDED, bound_addr, bound_port))?;
        for chunk in self.pending_outbound.drain() {
            self.to_upstream.push(chunk);
        }
        self.flush(ctx, Side::Upstream)?;

        // 两个方向可能都已有数据在等
        self.pump(ctx, Side::Client)?;
        self.pump(ctx, Side::Upstream)
    }

    /// 从 `from` 读并转给另一端; 另一端还有没写完的数据时暂停读取
    fn pump(&mut self, ctx: &mut Context<'_>, from: Side) -> Result<()> {
        let to = from.peer();
        loop {
            if self.destroyed || self.stage != Stage::Relaying || !self.outbox(to).is_empty() {
                return Ok(());
            }
            let outcome = match from {
                Side::Client => relay::read_chunk(&mut self.client)?,
                Side::Upstream => match self.upstream.as_mut() {
                    Some(up) => relay::read_chunk(&mut up.stream)?,
                    None => return Ok(()),
                },
            };
            match outcome {
                ReadOutcome::Data(chunk) => {
                    trace!("{} {:?} -> {:?} {} 字节", self.peer, from, to, chunk.len());
                    self.touch(ctx);
                    self.outbox(to).push(chunk);
                    self.flush(ctx, to)?;
                }
                ReadOutcome::WouldBlock => return Ok(()),
                ReadOutcome::Eof => {
                    debug!("{} {:?} 端关闭, 结束转发 {}", self.peer, from, self.target);
                    self.destroy(ctx);
                    return Ok(());
                }
            }
        }
    }

    fn outbox(&mut self, side: Side) -> &mut Outbox {
        match side {
            Side::Client => &mut self.to_client,
            Side::Upstream => &mut self.to_upstream,
        }
    }

    /// 转发阶段有数据流动时顺延空闲超时
    fn touch(&mut self, ctx: &Context<'_>) {
        if self.stage != Stage::Relaying || self.closing {
            return;
        }
        if let Some(idle) = ctx.config.idle_timeout {
            self.deadline = Some(Instant::now() + idle);
        }
    }

    fn send_to_client(&mut self, ctx: &mut Context<'_>, frame: Bytes) -> Result<Flush> {
        self.to_client.push(frame);
        self.flush(ctx, Side::Client)
    }

    /// 写出某一端的队列, 写不完时登记可写事件, 写完后撤掉
    fn flush(&mut self, ctx: &mut Context<'_>, side: Side) -> Result<Flush> {
        let (stream, token, outbox) = match side {
            Side::Client => (&mut self.client, self.id, &mut self.to_client),
            Side::Upstream => match self.upstream.as_mut() {
                Some(up) => (&mut up.stream, up.token, &mut self.to_upstream),
                None => return Ok(Flush::Drained),
            },
        };

        let state = outbox.flush(stream)?;
        let want_write = state == Flush::Blocked;
        if want_write != outbox.write_interest() {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            ctx.poll.reregister(stream, token, interest)?;
            outbox.set_write_interest(want_write);
        }
        if state == Flush::Drained {
            self.touch(ctx);
        }
        Ok(state)
    }

    /// 回一个失败应答, 写完后销毁. 期间不再读客户端, 上游直接关掉.
    fn close_with(&mut self, ctx: &mut Context<'_>, reply: Bytes) -> Result<()> {
        self.release_upstream(ctx);
        self.cancel_query(ctx);
        self.pending_outbound.clear();
        self.closing = true;
        self.deadline = Some(Instant::now() + LINGER);

        if self.send_to_client(ctx, reply)? == Flush::Drained {
            self.destroy(ctx);
        }
        Ok(())
    }

    /// 超时处理
    pub fn on_deadline(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        if self.closing {
            self.destroy(ctx);
            return Ok(());
        }
        match self.stage {
            Stage::AwaitGreeting | Stage::AwaitRequest => {
                debug!("{} 握手超时", self.peer);
                self.destroy(ctx);
                Ok(())
            }
            Stage::AwaitResolution => {
                warn!("{} 解析 {} 失败: {}", self.peer, self.target, DnsError::Timeout);
                self.close_with(ctx, codec::encode_failure(REPLY_GENERAL_FAILURE))
            }
            Stage::AwaitUpstreamConnect => {
                warn!("{} 连接 {} 超时", self.peer, self.target);
                self.close_with(ctx, codec::encode_failure(REPLY_GENERAL_FAILURE))
            }
            Stage::Relaying => {
                debug!("{} 空闲超时, 断开 {}", self.peer, self.target);
                self.destroy(ctx);
                Ok(())
            }
        }
    }

    fn release_upstream(&mut self, ctx: &mut Context<'_>) {
        if let Some(mut up) = self.upstream.take() {
            let _ = ctx.poll.deregister(&mut up.stream);
            ctx.registry.remove(up.token);
            let _ = up.stream.shutdown(Shutdown::Both);
        }
        self.to_upstream.clear();
    }

    fn cancel_query(&mut self, ctx: &mut Context<'_>) {
        if let Some(id) = self.query.take() {
            ctx.registry.cancel_query(id, self.id);
        }
    }

    /// 释放会话占用的全部资源, 可重复调用
    pub fn destroy(&mut self, ctx: &mut Context<'_>) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.cancel_query(ctx);
        self.release_upstream(ctx);
        let _ = ctx.poll.deregister(&mut self.client);
        ctx.registry.remove(self.id);
        let _ = self.client.shutdown(Shutdown::Both);

        self.inbound.clear();
        self.pending_outbound.clear();
        self.to_client.clear();
        self.deadline = None;
        debug!("会话 {} ({}) 已销毁", self.id.0, self.peer);
    }
}

impl Side {
    fn peer(self) -> Side {
        match self {
            Side::Client => Side::Upstream,
            Side::Upstream => Side::Client,
        }
    }
}
