// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求体解析器
//!
//! 四种解析器（JSON、raw、text、urlencoded）共享同一个读取流程，
//! 以普通中间件的身份挂在管道上：
//!
//! 1. 请求体已经被解析、请求不携带请求体、或者 `Content-Type` 不匹配时直接跳过；
//! 2. 检查字符集与 `Content-Encoding`，gzip/deflate 在 `inflate` 开启时逐块解压；
//! 3. 逐块读取，每读一块就检查一次解码后的总长度，超过上限立即丢弃缓冲并销毁请求体流；
//! 4. 按解析器类型把字节转换为 [`Body`] 并写入请求上下文（只写一次）。
//!
//! 任何情况下整个请求体都不会先被完整读入内存再检查大小。

use std::io::{self, Write};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use flate2::write::{GzDecoder, ZlibDecoder};
use log::{debug, warn};
use mime::Mime;
use regex::Regex;

use crate::{
    body::{Body, BodyStream},
    exception::Exception,
    pipeline::{Handler, Next},
    request::RequestContext,
    response::ResponseContext,
};

/// 默认请求体上限：100 KiB
pub const DEFAULT_LIMIT: u64 = 100 * 1024;
/// urlencoded 默认最多允许的参数个数
pub const DEFAULT_PARAMETER_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Json,
    Raw,
    Text,
    Urlencoded,
}

impl ParserKind {
    fn default_type(&self) -> &'static str {
        match self {
            ParserKind::Json => "application/json",
            ParserKind::Raw => "application/octet-stream",
            ParserKind::Text => "text/plain",
            ParserKind::Urlencoded => "application/x-www-form-urlencoded",
        }
    }
}

/// 决定解析器是否处理某个请求的 `Content-Type` 匹配器
#[derive(Debug, Clone)]
pub enum TypeMatcher {
    /// `type/subtype`，两部分都可以是 `*`；`*/*+json` 或简写 `+json` 匹配后缀
    Exact(String),
    List(Vec<String>),
    /// 对 `type/subtype`（不含参数）做正则匹配
    Pattern(Regex),
}

impl TypeMatcher {
    pub fn matches(&self, essence: &str) -> bool {
        match self {
            TypeMatcher::Exact(pattern) => type_matches(pattern, essence),
            TypeMatcher::List(patterns) => patterns.iter().any(|p| type_matches(p, essence)),
            TypeMatcher::Pattern(re) => re.is_match(essence),
        }
    }
}

fn type_matches(pattern: &str, essence: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    let pattern = match pattern.strip_prefix('+') {
        Some(suffix) => format!("*/*+{}", suffix),
        None => pattern,
    };
    let (pat_type, pat_sub) = match pattern.split_once('/') {
        Some(parts) => parts,
        None => return false,
    };
    let (act_type, act_sub) = match essence.split_once('/') {
        Some(parts) => parts,
        None => return false,
    };
    if pat_type != "*" && pat_type != act_type {
        return false;
    }
    if pat_sub == "*" {
        return true;
    }
    if let Some(suffix) = pat_sub.strip_prefix("*+") {
        return act_sub
            .rsplit_once('+')
            .map_or(false, |(_, s)| s == suffix);
    }
    pat_sub == act_sub
}

#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// 解码后请求体的最大字节数
    pub limit: u64,
    pub type_matcher: TypeMatcher,
    /// 请求未声明字符集时使用的默认字符集（text 解析器）
    pub charset: String,
    /// 是否解压 gzip/deflate 编码的请求体
    pub inflate: bool,
    /// JSON 严格模式：只接受对象或数组
    pub strict: bool,
    pub parameter_limit: usize,
}

impl ParserOptions {
    pub fn for_kind(kind: ParserKind) -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            type_matcher: TypeMatcher::Exact(kind.default_type().to_string()),
            charset: "utf-8".to_string(),
            inflate: true,
            strict: true,
            parameter_limit: DEFAULT_PARAMETER_LIMIT,
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn type_matcher(mut self, matcher: TypeMatcher) -> Self {
        self.type_matcher = matcher;
        self
    }

    pub fn charset(mut self, charset: &str) -> Self {
        self.charset = charset.to_ascii_lowercase();
        self
    }

    pub fn inflate(mut self, inflate: bool) -> Self {
        self.inflate = inflate;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn parameter_limit(mut self, parameter_limit: usize) -> Self {
        self.parameter_limit = parameter_limit;
        self
    }
}

/// 请求体解析中间件
#[derive(Debug, Clone)]
pub struct BodyParser {
    kind: ParserKind,
    options: ParserOptions,
}

impl BodyParser {
    pub fn new(kind: ParserKind, options: ParserOptions) -> Self {
        Self { kind, options }
    }

    pub fn json() -> Self {
        Self::new(ParserKind::Json, ParserOptions::for_kind(ParserKind::Json))
    }

    pub fn raw() -> Self {
        Self::new(ParserKind::Raw, ParserOptions::for_kind(ParserKind::Raw))
    }

    pub fn text() -> Self {
        Self::new(ParserKind::Text, ParserOptions::for_kind(ParserKind::Text))
    }

    pub fn urlencoded() -> Self {
        Self::new(
            ParserKind::Urlencoded,
            ParserOptions::for_kind(ParserKind::Urlencoded),
        )
    }

    pub fn kind(&self) -> ParserKind {
        self.kind
    }

    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    /// 解析请求体。跳过时返回 `Ok(())` 且不修改请求。
    pub async fn parse(&self, req: &mut RequestContext) -> Result<(), Exception> {
        let id = req.id();
        if req.body().is_some() {
            debug!("[ID{}]请求体已解析，跳过{:?}解析器", id, self.kind);
            return Ok(());
        }
        if !req.has_body() {
            return Ok(());
        }
        let content_type = match req.header("Content-Type").and_then(|v| v.parse::<Mime>().ok()) {
            Some(m) => m,
            None => return Ok(()),
        };
        if !self
            .options
            .type_matcher
            .matches(&content_type.essence_str().to_ascii_lowercase())
        {
            return Ok(());
        }

        let declared_charset = content_type
            .get_param(mime::CHARSET)
            .map(|c| c.as_str().to_ascii_lowercase());
        let charset = match self.check_charset(declared_charset) {
            Ok(c) => c,
            Err(e) => {
                req.destroy_stream();
                return Err(e);
            }
        };

        let mut inflater = match self.inflater(req.header("Content-Encoding")) {
            Ok(i) => i,
            Err(e) => {
                req.destroy_stream();
                return Err(e);
            }
        };

        let declared_length = req.head().content_length();
        if let (Inflater::Identity, Some(length)) = (&inflater, declared_length) {
            if length > self.options.limit {
                warn!(
                    "[ID{}]请求体声明长度{}超过上限{}",
                    id, length, self.options.limit
                );
                req.destroy_stream();
                return Err(Exception::PayloadTooLarge {
                    limit: self.options.limit,
                });
            }
        }

        let bytes = match req.take_stream() {
            Some(stream) => {
                let expected = match &inflater {
                    Inflater::Identity if !req.head().is_chunked() => declared_length,
                    _ => None,
                };
                match read_limited(stream, &mut inflater, self.options.limit, expected).await {
                    Ok(bytes) => bytes,
                    Err(Exception::RequestAborted) => {
                        warn!("[ID{}]客户端在请求体传输完成前断开", id);
                        req.mark_aborted();
                        return Err(Exception::RequestAborted);
                    }
                    Err(e) => return Err(e),
                }
            }
            None => Bytes::new(),
        };
        debug!(
            "[ID{}]{:?}解析器读取请求体{}字节",
            id,
            self.kind,
            bytes.len()
        );

        let body = match self.kind {
            ParserKind::Raw => Body::Raw(bytes),
            ParserKind::Text => Body::Text(decode_charset(&bytes, &charset)?),
            ParserKind::Json => Body::Json(parse_json(
                &decode_charset(&bytes, &charset)?,
                self.options.strict,
            )?),
            ParserKind::Urlencoded => {
                Body::Form(parse_urlencoded(&bytes, self.options.parameter_limit)?)
            }
        };
        req.set_body(body);
        Ok(())
    }

    fn check_charset(&self, declared: Option<String>) -> Result<String, Exception> {
        match self.kind {
            ParserKind::Raw => Ok(declared.unwrap_or_else(|| self.options.charset.clone())),
            ParserKind::Json => {
                let charset = declared.unwrap_or_else(|| "utf-8".to_string());
                if charset.starts_with("utf-") {
                    Ok(charset)
                } else {
                    Err(unsupported_charset(&charset))
                }
            }
            ParserKind::Urlencoded => {
                let charset = declared.unwrap_or_else(|| "utf-8".to_string());
                if charset == "utf-8" {
                    Ok(charset)
                } else {
                    Err(unsupported_charset(&charset))
                }
            }
            ParserKind::Text => {
                let charset = declared.unwrap_or_else(|| self.options.charset.clone());
                if is_supported_charset(&charset) {
                    Ok(charset)
                } else {
                    Err(unsupported_charset(&charset))
                }
            }
        }
    }

    fn inflater(&self, encoding: Option<&str>) -> Result<Inflater, Exception> {
        let encoding = encoding
            .map(|e| e.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "identity".to_string());
        match encoding.as_str() {
            "identity" | "" => Ok(Inflater::Identity),
            "gzip" | "x-gzip" | "deflate" if !self.options.inflate => Err(
                Exception::UnsupportedMediaType(format!("content encoding {} unsupported", encoding)),
            ),
            "gzip" | "x-gzip" => Ok(Inflater::Gzip(GzDecoder::new(BoundedSink::new(
                self.options.limit,
            )))),
            "deflate" => Ok(Inflater::Deflate(ZlibDecoder::new(BoundedSink::new(
                self.options.limit,
            )))),
            other => Err(Exception::UnsupportedMediaType(format!(
                "unsupported content encoding \"{}\"",
                other
            ))),
        }
    }
}

#[async_trait]
impl Handler for BodyParser {
    async fn call(&self, req: &mut RequestContext, _res: &mut ResponseContext) -> Next {
        Next::proceed(self.parse(req).await)
    }
}

/// 解压输出的接收端。
///
/// 累计写入超过 `limit` 时拒绝写入，解压器因此停在上限附近，
/// 内存占用不超过上限加上解压器的一次输出。
struct BoundedSink {
    data: Vec<u8>,
    written: u64,
    limit: u64,
    exceeded: bool,
}

impl BoundedSink {
    fn new(limit: u64) -> Self {
        Self {
            data: Vec::new(),
            written: 0,
            limit,
            exceeded: false,
        }
    }

    fn drain_into(&mut self, out: &mut BytesMut) {
        out.extend_from_slice(&self.data);
        self.data.clear();
    }
}

impl Write for BoundedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.limit {
            self.exceeded = true;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "decoded body exceeds limit",
            ));
        }
        self.written += buf.len() as u64;
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Inflater {
    Identity,
    Gzip(GzDecoder<BoundedSink>),
    Deflate(ZlibDecoder<BoundedSink>),
}

impl Inflater {
    fn feed(&mut self, chunk: &[u8], out: &mut BytesMut) -> io::Result<()> {
        match self {
            Inflater::Identity => out.extend_from_slice(chunk),
            Inflater::Gzip(d) => {
                d.write_all(chunk)?;
                d.get_mut().drain_into(out);
            }
            Inflater::Deflate(d) => {
                d.write_all(chunk)?;
                d.get_mut().drain_into(out);
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut BytesMut) -> io::Result<()> {
        match self {
            Inflater::Identity => {}
            Inflater::Gzip(d) => {
                d.try_finish()?;
                d.get_mut().drain_into(out);
            }
            Inflater::Deflate(d) => {
                d.try_finish()?;
                d.get_mut().drain_into(out);
            }
        }
        Ok(())
    }

    /// 解压输出是否触及上限
    fn exceeded(&self) -> bool {
        match self {
            Inflater::Identity => false,
            Inflater::Gzip(d) => d.get_ref().exceeded,
            Inflater::Deflate(d) => d.get_ref().exceeded,
        }
    }
}

/// 逐块读取请求体，任何一块使解码后长度超过 `limit` 都立即终止
async fn read_limited(
    mut stream: Box<dyn BodyStream>,
    inflater: &mut Inflater,
    limit: u64,
    expected: Option<u64>,
) -> Result<Bytes, Exception> {
    let mut buffer = BytesMut::new();
    let mut received: u64 = 0;
    loop {
        let chunk = match stream.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                stream.destroy();
                return Err(match e.kind() {
                    io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe => Exception::RequestAborted,
                    _ => Exception::malformed(e.to_string()),
                });
            }
        };
        received += chunk.len() as u64;
        if let Err(e) = inflater.feed(&chunk, &mut buffer) {
            buffer.clear();
            stream.destroy();
            if inflater.exceeded() {
                return Err(Exception::PayloadTooLarge { limit });
            }
            return Err(Exception::malformed(format!("invalid compressed body: {}", e)));
        }
        if buffer.len() as u64 > limit {
            buffer.clear();
            stream.destroy();
            return Err(Exception::PayloadTooLarge { limit });
        }
    }

    if let Err(e) = inflater.finish(&mut buffer) {
        if inflater.exceeded() {
            return Err(Exception::PayloadTooLarge { limit });
        }
        return Err(Exception::malformed(format!("invalid compressed body: {}", e)));
    }
    if buffer.len() as u64 > limit {
        return Err(Exception::PayloadTooLarge { limit });
    }
    if let Some(expected) = expected {
        if expected != received {
            return Err(Exception::malformed(
                "request size did not match content length",
            ));
        }
    }
    Ok(buffer.freeze())
}

fn unsupported_charset(charset: &str) -> Exception {
    Exception::UnsupportedMediaType(format!("unsupported charset \"{}\"", charset.to_uppercase()))
}

fn is_supported_charset(charset: &str) -> bool {
    matches!(
        charset,
        "utf-8"
            | "utf8"
            | "utf-16le"
            | "utf-16be"
            | "utf-16"
            | "us-ascii"
            | "ascii"
            | "iso-8859-1"
            | "latin1"
            | "latin-1"
    )
}

/// 按字符集把字节解码为字符串，并去掉开头的 BOM
fn decode_charset(bytes: &[u8], charset: &str) -> Result<String, Exception> {
    let text = match charset {
        "utf-8" | "utf8" => String::from_utf8(bytes.to_vec())
            .map_err(|_| Exception::malformed("invalid utf-8 in request body"))?,
        "utf-16le" => decode_utf16(bytes, u16::from_le_bytes)?,
        "utf-16be" => decode_utf16(bytes, u16::from_be_bytes)?,
        "utf-16" => match bytes {
            [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes)?,
            [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes)?,
            _ => decode_utf16(bytes, u16::from_be_bytes)?,
        },
        "us-ascii" | "ascii" => {
            if !bytes.is_ascii() {
                return Err(Exception::malformed("non-ascii byte in us-ascii body"));
            }
            bytes.iter().map(|&b| b as char).collect()
        }
        "iso-8859-1" | "latin1" | "latin-1" => bytes.iter().map(|&b| b as char).collect(),
        other => return Err(unsupported_charset(other)),
    };
    Ok(match text.strip_prefix('\u{FEFF}') {
        Some(stripped) => stripped.to_string(),
        None => text,
    })
}

fn decode_utf16(bytes: &[u8], convert: fn([u8; 2]) -> u16) -> Result<String, Exception> {
    if bytes.len() % 2 != 0 {
        return Err(Exception::malformed("truncated utf-16 body"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| convert([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| Exception::malformed("invalid utf-16 in request body"))
}

fn parse_json(text: &str, strict: bool) -> Result<serde_json::Value, Exception> {
    if text.is_empty() {
        return Ok(serde_json::Value::Object(Default::default()));
    }

    if strict {
        let first = text
            .char_indices()
            .find(|(_, c)| !matches!(c, ' ' | '\t' | '\n' | '\r'));
        match first {
            Some((_, '{')) | Some((_, '[')) => {}
            Some((offset, c)) => {
                return Err(Exception::MalformedBody {
                    message: format!("Unexpected token {} in JSON at position {}", c, offset),
                    offset: Some(offset),
                    token: Some(c.to_string()),
                })
            }
            None => {
                return Err(Exception::MalformedBody {
                    message: "Unexpected end of JSON input".to_string(),
                    offset: Some(text.len()),
                    token: None,
                })
            }
        }
        return serde_json::from_str(text).map_err(|e| json_error(text, e));
    }

    let mut values = serde_json::Deserializer::from_str(text).into_iter::<serde_json::Value>();
    match values.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(json_error(text, e)),
        None => Ok(serde_json::Value::Object(Default::default())),
    }
}

/// 把 serde_json 的行列位置换算为字节偏移，并取出该位置的字符
fn json_error(text: &str, err: serde_json::Error) -> Exception {
    let mut offset = 0;
    if err.line() > 0 {
        for (i, line) in text.split('\n').enumerate() {
            if i + 1 == err.line() {
                break;
            }
            offset += line.len() + 1;
        }
        offset += err.column().saturating_sub(1);
    }
    let offset = offset.min(text.len());
    let token = text
        .get(offset..)
        .and_then(|rest| rest.chars().next())
        .map(|c| c.to_string());
    Exception::MalformedBody {
        message: err.to_string(),
        offset: Some(offset),
        token,
    }
}

fn parse_urlencoded(bytes: &[u8], parameter_limit: usize) -> Result<Vec<(String, String)>, Exception> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let count = bytes.iter().filter(|&&b| b == b'&').count() + 1;
    if count > parameter_limit {
        return Err(Exception::with_status(413, "too many parameters"));
    }
    Ok(form_urlencoded::parse(bytes).into_owned().collect())
}
