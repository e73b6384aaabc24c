use log::{debug, error, info, trace, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::dns::Resolver;
use crate::error::Result;
use crate::registry::{Endpoint, LISTENER, RESOLVER, Registry};
use crate::session::{Context, Session, Side};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

/// 单线程事件循环: 监听 socket, DNS socket 和所有会话的 socket 都在一个 `Poll` 里
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    resolver: Resolver,
    registry: Registry,
    sessions: HashMap<Token, Session>,
    config: Config,
}

impl Reactor {
    pub fn bind(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut listener = TcpListener::bind(config.listen)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let mut resolver = Resolver::bind(config.dns_server)?;
        poll.registry()
            .register(resolver.socket_mut(), RESOLVER, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            resolver,
            registry: Registry::new(),
            sessions: HashMap::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(&mut self) -> io::Result<()> {
        info!(
            "SOCKS5 代理服务器启动在 {}, DNS 服务器 {}",
            self.local_addr()?,
            self.resolver.server()
        );
        loop {
            let timeout = self.next_timeout();
            self.run_once(timeout)?;
        }
    }

    /// 最近的会话超时还有多久; 没有超时就一直等
    fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.sessions
            .values()
            .filter_map(Session::deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// 等一轮事件并全部分发, 然后处理到期的超时
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        let ready: Vec<Ready> = self
            .events
            .iter()
            .map(|event| Ready {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed(),
            })
            .collect();

        for event in ready {
            match self.registry.lookup(event.token) {
                Some(Endpoint::Listener) => self.accept(),
                Some(Endpoint::Resolver) => self.on_dns_readable(),
                Some(Endpoint::Client(session)) => {
                    self.dispatch(session, Side::Client, event.readable, event.writable)
                }
                Some(Endpoint::Upstream(session)) => {
                    self.dispatch(session, Side::Upstream, event.readable, event.writable)
                }
                // 同一轮里已经销毁的会话
                None => trace!("忽略未登记的 token {}", event.token.0),
            }
        }

        self.expire();
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            let (mut stream, addr) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("接受连接时出错: {}", e);
                    return;
                }
            };

            let token = self.registry.add_client();
            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                error!("注册连接 {} 失败: {}", addr, e);
                self.registry.remove(token);
                continue;
            }
            info!("新连接来自: {}", addr);
            self.sessions
                .insert(token, Session::new(token, stream, addr, &self.config));
        }
    }

    fn on_dns_readable(&mut self) {
        let responses = match self.resolver.recv() {
            Ok(responses) => responses,
            Err(e) => {
                error!("读取 DNS 响应出错: {}", e);
                return;
            }
        };

        for response in responses {
            let Some(session) = self.registry.take_query(response.id) else {
                debug!("丢弃未匹配的 DNS 响应 {:#06x}", response.id);
                continue;
            };
            self.with_session(session, |session, ctx| {
                session.on_resolved(ctx, response.address)
            });
        }
    }

    fn dispatch(&mut self, session: Token, side: Side, readable: bool, writable: bool) {
        self.with_session(session, |session, ctx| {
            session.on_event(ctx, side, readable, writable)
        });
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .sessions
            .values()
            .filter(|session| session.deadline().is_some_and(|deadline| deadline <= now))
            .map(Session::id)
            .collect();

        for session in expired {
            self.with_session(session, |session, ctx| session.on_deadline(ctx));
        }
    }

    /// 调用会话的回调; 出错时销毁该会话, 不影响其它连接
    fn with_session<F>(&mut self, id: Token, f: F)
    where
        F: FnOnce(&mut Session, &mut Context<'_>) -> Result<()>,
    {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let mut ctx = Context {
            poll: self.poll.registry(),
            registry: &mut self.registry,
            resolver: &mut self.resolver,
            config: &self.config,
        };

        if let Err(e) = f(session, &mut ctx) {
            warn!("会话 {} 出错: {}", id.0, e);
            session.destroy(&mut ctx);
        }
        if session.is_destroyed() {
            self.sessions.remove(&id);
        }
    }
}
