use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io::{self, Read, Write};

pub const BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug)]
pub enum ReadOutcome {
    Data(Bytes),
    WouldBlock,
    Eof,
}

/// 非阻塞读一次; WouldBlock 表示暂时没有数据, 读到 0 表示对端关闭
pub fn read_chunk<R: Read>(source: &mut R) -> io::Result<ReadOutcome> {
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        match source.read(&mut buf) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => return Ok(ReadOutcome::Data(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    Drained,
    Blocked,
}

/// 某个 socket 待写出的数据块, 按到达顺序排队
#[derive(Debug, Default)]
pub struct Outbox {
    chunks: VecDeque<Bytes>,
    len: usize,
    write_interest: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 排队中的字节数
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.len = 0;
        self.chunks.drain(..)
    }

    pub fn write_interest(&self) -> bool {
        self.write_interest
    }

    pub fn set_write_interest(&mut self, on: bool) {
        self.write_interest = on;
    }

    /// 尽量写出, 写不完的留在队列里. 不会重试阻塞的写.
    pub fn flush<W: Write>(&mut self, sink: &mut W) -> io::Result<Flush> {
        while let Some(front) = self.chunks.front_mut() {
            match sink.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.len -= n;
                    if n == front.len() {
                        self.chunks.pop_front();
                    } else {
                        front.advance(n);
                        return Ok(Flush::Blocked);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Flush::Drained)
    }
}
