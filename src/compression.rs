// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 响应压缩
//!
//! [`Compression`] 是一个后置钩子：处理函数给出响应体之后、发送之前运行，
//! 根据 `Accept-Encoding` 协商编码，把响应体替换为压缩结果。
//!
//! 压缩失败不会影响请求：记录警告后原样发送未压缩的响应体。

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use log::{debug, warn};

use crate::{
    cache::{cache_key, CompressionCache},
    config::CompressionConfig,
    param::{HttpEncoding, HttpRequestMethod},
    pipeline::{Handler, Next},
    request::RequestContext,
    response::ResponseContext,
    util::format_file_size,
};

/// 编码器每次写入的块大小
const CHUNK_SIZE: usize = 16 * 1024;
/// 超过该大小的响应体交给阻塞线程池压缩
const BLOCKING_THRESHOLD: usize = 64 * 1024;

/// 按 `Accept-Encoding` 与服务端偏好选择编码。
///
/// 显式列出的编码覆盖 `*`；`q=0` 表示拒绝；q 值相同时按 `preference` 的顺序选择。
/// 请求没有 `Accept-Encoding` 时不压缩。
pub fn negotiate(accept_encoding: Option<&str>, preference: &[HttpEncoding]) -> Option<HttpEncoding> {
    let header = accept_encoding?.trim();
    if header.is_empty() {
        return None;
    }

    let mut explicit: Vec<(HttpEncoding, f32)> = Vec::new();
    let mut wildcard: Option<f32> = None;
    for item in header.split(',') {
        let mut parts = item.split(';');
        let token = parts.next().unwrap_or("").trim();
        let mut q = 1.0f32;
        for param in parts {
            if let Some((name, value)) = param.split_once('=') {
                if name.trim().eq_ignore_ascii_case("q") {
                    q = value.trim().parse::<f32>().unwrap_or(0.0);
                }
            }
        }
        if token == "*" {
            wildcard = Some(q);
        } else if let Some(encoding) = HttpEncoding::from_token(token) {
            explicit.push((encoding, q));
        }
    }

    let mut best: Option<(HttpEncoding, f32)> = None;
    for encoding in preference {
        let q = explicit
            .iter()
            .find(|(e, _)| e == encoding)
            .map(|(_, q)| *q)
            .or(wildcard)
            .unwrap_or(0.0);
        if q <= 0.0 {
            continue;
        }
        match best {
            Some((_, best_q)) if best_q >= q => {}
            _ => best = Some((*encoding, q)),
        }
    }
    best.map(|(e, _)| e)
}

/// 内容类型是否值得压缩
pub fn is_compressible(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence.as_str(),
            "application/json"
                | "application/javascript"
                | "application/x-javascript"
                | "application/ecmascript"
                | "application/xml"
                | "image/svg+xml"
        )
}

/// 判断响应是否需要压缩
pub fn should_compress(req: &RequestContext, res: &ResponseContext, threshold: usize) -> bool {
    let payload = match res.payload() {
        Some(p) => p,
        None => return false,
    };
    if res.header("Content-Encoding").is_some() {
        return false;
    }
    if let Some(cc) = res.header("Cache-Control") {
        if cc
            .split(',')
            .any(|d| d.trim().eq_ignore_ascii_case("no-transform"))
        {
            return false;
        }
    }
    match res.header("Content-Type") {
        Some(ct) if is_compressible(ct) => {}
        _ => return false,
    }
    if matches!(res.status_code(), 204 | 304) {
        return false;
    }
    if req.method() == HttpRequestMethod::Head {
        return false;
    }
    payload.len() >= threshold
}

fn encode(payload: &[u8], encoding: HttpEncoding, level: u32) -> io::Result<Bytes> {
    let output = match encoding {
        HttpEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
            for chunk in payload.chunks(CHUNK_SIZE) {
                encoder.write_all(chunk)?;
            }
            encoder.finish()?
        }
        HttpEncoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::new(level.min(9)));
            for chunk in payload.chunks(CHUNK_SIZE) {
                encoder.write_all(chunk)?;
            }
            encoder.finish()?
        }
        HttpEncoding::Br => {
            let mut encoder = brotli::CompressorWriter::new(Vec::new(), 4096, level.min(11), 22);
            for chunk in payload.chunks(CHUNK_SIZE) {
                encoder.write_all(chunk)?;
            }
            encoder.flush()?;
            encoder.into_inner()
        }
    };
    Ok(Bytes::from(output))
}

/// 压缩一段响应体，较大的响应体在阻塞线程池中压缩
pub async fn compress(payload: Bytes, encoding: HttpEncoding, level: u32) -> io::Result<Bytes> {
    if payload.len() <= BLOCKING_THRESHOLD {
        return encode(&payload, encoding, level);
    }
    tokio::task::spawn_blocking(move || encode(&payload, encoding, level))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// 压缩统计
#[derive(Debug, Default)]
pub struct CompressionStats {
    compressions: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub compressions: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub failures: u64,
}

/// 响应压缩后置钩子
pub struct Compression {
    threshold: usize,
    level: u32,
    preference: Vec<HttpEncoding>,
    cache: Option<CompressionCache>,
    stats: CompressionStats,
}

impl Compression {
    pub fn new(config: &CompressionConfig) -> Self {
        let cache = if config.cache_enabled() {
            Some(CompressionCache::new(
                config.cache_ttl(),
                config.cache_max_bytes(),
            ))
        } else {
            None
        };
        Self {
            threshold: config.threshold(),
            level: config.level(),
            preference: config.preference(),
            cache,
            stats: CompressionStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            compressions: self.stats.compressions.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.cache.as_ref().map_or(0, |c| c.evictions()),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    async fn encode_payload(&self, payload: Bytes, encoding: HttpEncoding) -> io::Result<Bytes> {
        let level = self.level;
        let run = || {
            self.stats.compressions.fetch_add(1, Ordering::Relaxed);
            compress(payload.clone(), encoding, level)
        };
        match &self.cache {
            Some(cache) => {
                let key = cache_key(encoding, &payload);
                let lookup = cache.get_or_compress(key, run).await?;
                let counter = if lookup.hit {
                    &self.stats.hits
                } else {
                    &self.stats.misses
                };
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(lookup.bytes)
            }
            None => run().await,
        }
    }

    /// 对响应应用压缩，返回是否实际压缩
    pub async fn apply(&self, req: &RequestContext, res: &mut ResponseContext) -> bool {
        let id = req.id();
        if !should_compress(req, res, self.threshold) {
            return false;
        }
        // 可压缩的响应都依赖 Accept-Encoding，即使这次没有压缩
        if res.vary("Accept-Encoding").is_err() {
            return false;
        }
        let encoding = match negotiate(req.header("Accept-Encoding"), &self.preference) {
            Some(e) => e,
            None => return false,
        };
        let payload = match res.payload() {
            Some(p) => p.clone(),
            None => return false,
        };
        let original = payload.len();

        match self.encode_payload(payload, encoding).await {
            Ok(encoded) => {
                debug!(
                    "[ID{}]使用{}压缩编码，{} -> {}",
                    id,
                    encoding,
                    format_file_size(original as u64),
                    format_file_size(encoded.len() as u64)
                );
                let applied = res.replace_payload(encoded).and_then(|_| {
                    res.set_header("Content-Encoding", encoding.as_str())?;
                    res.remove_header("Content-Length")?;
                    Ok(())
                });
                applied.is_ok()
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!("[ID{}]{}压缩失败，发送未压缩内容：{}", id, encoding, e);
                false
            }
        }
    }
}

#[async_trait]
impl Handler for Compression {
    async fn call(&self, req: &mut RequestContext, res: &mut ResponseContext) -> Next {
        self.apply(req, res).await;
        Next::Continue
    }
}
