// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求体流模块
//!
//! 请求体以数据块（chunk）的形式被逐块读取，任何读取方都不会一次性把整个请求体读入内存。
//! 本模块提供：
//! - [`BodyStream`]：请求体流的统一抽象，解析器只依赖这一接口。
//! - [`IncomingBody`]：基于 socket 读半部的实现，支持 `Content-Length` 与 chunked 两种分帧方式。
//! - [`MemoryBody`]：内存中的实现，可观测是否被销毁，供测试与嵌入式调用使用。
//! - [`Body`]：解析器产出的请求体值。

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};

/// chunked 分帧中单行（块大小行、trailer 行）允许的最大长度
const MAX_CHUNK_LINE: usize = 4096;

/// 请求体流的统一抽象。
///
/// 读取到流末尾时 `next_chunk` 返回 `Ok(None)`；
/// 客户端提前关闭连接时返回 `ErrorKind::UnexpectedEof`。
#[async_trait]
pub trait BodyStream: Send + Sync {
    /// 读取下一个数据块
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>>;

    /// 放弃剩余数据并释放底层资源，之后的读取都返回 `Ok(None)`
    fn destroy(&mut self);

    fn is_destroyed(&self) -> bool;
}

/// 解析器产出的请求体
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(serde_json::Value),
    Text(String),
    Raw(Bytes),
    Form(Vec<(String, String)>),
}

impl Body {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Body::Raw(b) => Some(b),
            _ => None,
        }
    }

    /// 表单中第一个同名字段的值
    pub fn form_value(&self, key: &str) -> Option<&str> {
        match self {
            Body::Form(pairs) => pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Framing {
    /// 按 `Content-Length` 分帧，记录剩余字节数
    Length(u64),
    /// chunked 分帧
    Chunked(ChunkState),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

/// 基于 socket 读半部的请求体流。
///
/// `buffered` 保存读取请求头时多读出的字节，读取时优先消费。
pub struct IncomingBody<R> {
    reader: Option<R>,
    buffered: BytesMut,
    framing: Framing,
    read_size: usize,
}

impl<R> IncomingBody<R>
where
    R: AsyncRead + Unpin + Send + Sync,
{
    /// 按 `Content-Length` 分帧的请求体
    pub fn with_length(reader: R, leftover: Bytes, length: u64, read_size: usize) -> Self {
        let framing = if length == 0 {
            Framing::Done
        } else {
            Framing::Length(length)
        };
        Self {
            reader: Some(reader),
            buffered: BytesMut::from(&leftover[..]),
            framing,
            read_size,
        }
    }

    /// 按 chunked 分帧的请求体
    pub fn chunked(reader: R, leftover: Bytes, read_size: usize) -> Self {
        Self {
            reader: Some(reader),
            buffered: BytesMut::from(&leftover[..]),
            framing: Framing::Chunked(ChunkState::Size),
            read_size,
        }
    }

    /// 从 socket 再读一些字节到缓冲区；对端关闭连接时返回 `UnexpectedEof`
    async fn fill(&mut self) -> io::Result<()> {
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "body destroyed")),
        };
        self.buffered.reserve(self.read_size);
        let n = reader.read_buf(&mut self.buffered).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before body was complete",
            ));
        }
        Ok(())
    }

    /// 读取一行（不含 CRLF），超过上限视为非法数据
    async fn read_line(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(pos) = self.buffered.windows(2).position(|w| w == b"\r\n") {
                let line = self.buffered.split_to(pos).freeze();
                let _ = self.buffered.split_to(2);
                return Ok(line);
            }
            if self.buffered.len() > MAX_CHUNK_LINE {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "chunk line too long"));
            }
            self.fill().await?;
        }
    }

    fn take_buffered(&mut self, max: u64) -> Bytes {
        let n = (self.buffered.len() as u64).min(max) as usize;
        self.buffered.split_to(n).freeze()
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size is not ascii"))?;
    // 忽略 chunk extension
    let size = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

#[async_trait]
impl<R> BodyStream for IncomingBody<R>
where
    R: AsyncRead + Unpin + Send + Sync,
{
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.framing {
                Framing::Done => return Ok(None),
                Framing::Length(remaining) => {
                    if self.buffered.is_empty() {
                        self.fill().await?;
                    }
                    let chunk = self.take_buffered(remaining);
                    let left = remaining - chunk.len() as u64;
                    self.framing = if left == 0 {
                        Framing::Done
                    } else {
                        Framing::Length(left)
                    };
                    return Ok(Some(chunk));
                }
                Framing::Chunked(ChunkState::Size) => {
                    let line = self.read_line().await?;
                    let size = parse_chunk_size(&line)?;
                    self.framing = if size == 0 {
                        Framing::Chunked(ChunkState::Trailers)
                    } else {
                        Framing::Chunked(ChunkState::Data(size))
                    };
                }
                Framing::Chunked(ChunkState::Data(remaining)) => {
                    if self.buffered.is_empty() {
                        self.fill().await?;
                    }
                    let chunk = self.take_buffered(remaining);
                    let left = remaining - chunk.len() as u64;
                    self.framing = if left == 0 {
                        Framing::Chunked(ChunkState::DataEnd)
                    } else {
                        Framing::Chunked(ChunkState::Data(left))
                    };
                    return Ok(Some(chunk));
                }
                Framing::Chunked(ChunkState::DataEnd) => {
                    let line = self.read_line().await?;
                    if !line.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing CRLF after chunk data",
                        ));
                    }
                    self.framing = Framing::Chunked(ChunkState::Size);
                }
                Framing::Chunked(ChunkState::Trailers) => {
                    let line = self.read_line().await?;
                    if line.is_empty() {
                        self.framing = Framing::Done;
                    }
                }
            }
        }
    }

    fn destroy(&mut self) {
        if self.reader.take().is_some() {
            debug!("请求体流已销毁，剩余数据被丢弃");
        }
        self.buffered.clear();
        self.framing = Framing::Done;
    }

    fn is_destroyed(&self) -> bool {
        self.reader.is_none()
    }
}

/// 内存中的请求体流。
///
/// `destroyed_flag` 与 `reads` 在克隆出去之后仍然可以观测，
/// 即使流本身已经被解析器消费并丢弃。
pub struct MemoryBody {
    chunks: VecDeque<Bytes>,
    truncated: bool,
    destroyed: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl MemoryBody {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            truncated: false,
            destroyed: Arc::new(AtomicBool::new(false)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 模拟客户端在数据块全部发送后直接断开连接
    pub fn truncated<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut body = Self::new(chunks);
        body.truncated = true;
        body
    }

    pub fn destroyed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.destroyed)
    }

    /// 已经被读出的数据块数量
    pub fn reads(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }
}

#[async_trait]
impl BodyStream for MemoryBody {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match self.chunks.pop_front() {
            Some(chunk) => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                Ok(Some(chunk))
            }
            None if self.truncated => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before body was complete",
            )),
            None => Ok(None),
        }
    }

    fn destroy(&mut self) {
        self.chunks.clear();
        self.destroyed.store(true, Ordering::SeqCst);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
