use mio::Token;
use std::collections::HashMap;

pub const LISTENER: Token = Token(0);
pub const RESOLVER: Token = Token(1);

const FIRST_SESSION_TOKEN: usize = 2;

/// 注册时就确定的 socket 归属; 会话以客户端 socket 的 token 作为标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Listener,
    Resolver,
    Client(Token),
    Upstream(Token),
}

/// token -> socket 归属, 以及 DNS 事务 ID -> 会话
#[derive(Debug)]
pub struct Registry {
    endpoints: HashMap<Token, Endpoint>,
    queries: HashMap<u16, Token>,
    next_token: usize,
}

impl Registry {
    pub fn new() -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(LISTENER, Endpoint::Listener);
        endpoints.insert(RESOLVER, Endpoint::Resolver);
        Self {
            endpoints,
            queries: HashMap::new(),
            next_token: FIRST_SESSION_TOKEN,
        }
    }

    fn allocate(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// 新的客户端连接, 返回的 token 同时也是会话标识
    pub fn add_client(&mut self) -> Token {
        let token = self.allocate();
        self.endpoints.insert(token, Endpoint::Client(token));
        token
    }

    pub fn add_upstream(&mut self, session: Token) -> Token {
        let token = self.allocate();
        self.endpoints.insert(token, Endpoint::Upstream(session));
        token
    }

    pub fn lookup(&self, token: Token) -> Option<Endpoint> {
        self.endpoints.get(&token).copied()
    }

    pub fn remove(&mut self, token: Token) -> Option<Endpoint> {
        self.endpoints.remove(&token)
    }

    pub fn add_query(&mut self, id: u16, session: Token) {
        self.queries.insert(id, session);
    }

    pub fn query_owner(&self, id: u16) -> Option<Token> {
        self.queries.get(&id).copied()
    }

    /// 响应到达时取出等待者
    pub fn take_query(&mut self, id: u16) -> Option<Token> {
        self.queries.remove(&id)
    }

    /// 会话销毁时撤销查询; ID 已被别的会话复用时不动
    pub fn cancel_query(&mut self, id: u16, session: Token) {
        if self.queries.get(&id) == Some(&session) {
            self.queries.remove(&id);
        }
    }

    /// 属于某个会话的 socket 和查询数量
    pub fn entries_for(&self, session: Token) -> usize {
        let sockets = self
            .endpoints
            .values()
            .filter(|e| matches!(e, Endpoint::Client(s) | Endpoint::Upstream(s) if *s == session))
            .count();
        let queries = self.queries.values().filter(|s| **s == session).count();
        sockets + queries
    }

    pub fn pending_queries(&self) -> usize {
        self.queries.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
