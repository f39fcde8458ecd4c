// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求处理模块
//!
//! 该模块负责两件事：
//! 1. 将 TCP 流中读取的请求头字节解析为强类型的 [`RequestHead`]。
//! 2. 提供每个请求独享的 [`RequestContext`]：它拥有请求体流、路由参数、解析后的请求体，
//!    并对 `ip`、`hostname` 等派生属性做惰性计算与缓存。
//!
//! 派生属性在第一次访问时计算并固定下来，之后即使请求头被修改，返回值也保持不变。

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

use chrono::DateTime;
use log::{error, warn};

use crate::{
    body::{Body, BodyStream},
    exception::Exception,
    param::*,
    response::ResponseContext,
};

/// 请求行与请求头。
///
/// 不包含请求体，请求体以流的形式由 [`RequestContext`] 持有。
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// HTTP 请求方法（GET, POST 等）
    method: HttpRequestMethod,
    /// 原始请求目标（包含查询字符串）
    target: String,
    /// HTTP 协议版本
    version: HttpVersion,
    /// 按出现顺序保存的请求头
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// 从原始字节缓冲区尝试构建 `RequestHead` 实例。
    ///
    /// # 逻辑步骤
    /// 1. 验证编码：确保请求头是合法的 UTF-8 字符串。
    /// 2. 解析请求行：提取方法、路径和协议版本。
    /// 3. 迭代解析标头，遇到空行结束。
    ///
    /// # 参数
    /// * `buffer` - 从网络 Socket 读取的请求头字节（可以包含结尾的空行）。
    /// * `id` - 全局请求 ID，用于在多线程环境下追踪日志。
    pub fn try_from(buffer: &[u8], id: u128) -> Result<Self, Exception> {
        // 1. 将字节流转换为字符串，失败则判定为非法的 HTTP 请求
        let request_string = match std::str::from_utf8(buffer) {
            Ok(string) => string,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let mut request_lines = request_string.split(CRLF);

        // 2. 解析请求行 (e.g., "GET /index.html HTTP/1.1")
        let first_line = request_lines.next().unwrap_or("");
        let first_line_parts: Vec<&str> = first_line.split(' ').collect();
        if first_line_parts.len() != 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, first_line);
            return Err(Exception::UnSupportedRequestMethod);
        }

        let method = match HttpRequestMethod::parse(first_line_parts[0]) {
            Some(m) => m,
            None => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, first_line_parts[0]);
                return Err(Exception::UnSupportedRequestMethod);
            }
        };

        let target = first_line_parts[1].to_string();
        if target.is_empty() {
            error!("[ID{}]请求目标为空", id);
            return Err(Exception::InvalidPath);
        }

        let version_str = first_line_parts[2].to_uppercase();
        let version = match version_str.as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            _ => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, &version_str);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        // 3. 迭代各行解析 Headers
        let mut headers = Vec::new();
        for line in request_lines {
            if line.is_empty() {
                break;
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_string(), value.trim().to_string()));
                }
                None => warn!("[ID{}]忽略格式错误的请求头：{}", id, line),
            }
        }

        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// 直接构造请求头，主要供测试和嵌入式调用使用
    pub fn new(method: HttpRequestMethod, target: &str) -> Self {
        Self {
            method,
            target: target.to_string(),
            version: HttpVersion::V1_1,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

// --- Getter 访问器实现 ---

impl RequestHead {
    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// 原始请求目标（含查询参数）
    pub fn target(&self) -> &str {
        &self.target
    }

    /// 不含查询字符串的路径部分
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    pub fn query_string(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// 大小写不敏感地查找第一个同名请求头
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// 请求声明的 `Content-Length`，无法解析时返回 `None`
    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"))
    }
}

/// 传输层信息：对端地址与是否经过 TLS
#[derive(Debug, Clone, Copy, Default)]
pub struct Transport {
    pub peer: Option<SocketAddr>,
    pub secure: bool,
}

/// 每个请求独享的上下文。
pub struct RequestContext {
    id: u128,
    head: RequestHead,
    transport: Transport,
    trust_proxy: bool,
    subdomain_offset: usize,
    params: HashMap<String, String>,
    body: Option<Body>,
    stream: Option<Box<dyn BodyStream>>,
    aborted: bool,
    // 惰性计算并缓存的派生属性
    ip: OnceLock<String>,
    ips: OnceLock<Vec<String>>,
    protocol: OnceLock<&'static str>,
    hostname: OnceLock<Option<String>>,
    subdomains: OnceLock<Vec<String>>,
    query: OnceLock<Vec<(String, String)>>,
    fresh: OnceLock<bool>,
}

impl RequestContext {
    pub fn new(id: u128, head: RequestHead, transport: Transport) -> Self {
        Self {
            id,
            head,
            transport,
            trust_proxy: true,
            subdomain_offset: 2,
            params: HashMap::new(),
            body: None,
            stream: None,
            aborted: false,
            ip: OnceLock::new(),
            ips: OnceLock::new(),
            protocol: OnceLock::new(),
            hostname: OnceLock::new(),
            subdomains: OnceLock::new(),
            query: OnceLock::new(),
            fresh: OnceLock::new(),
        }
    }

    pub fn with_stream(mut self, stream: Box<dyn BodyStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_proxy_settings(mut self, trust_proxy: bool, subdomain_offset: usize) -> Self {
        self.trust_proxy = trust_proxy;
        self.subdomain_offset = subdomain_offset;
        self
    }

    pub fn id(&self) -> u128 {
        self.id
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn method(&self) -> HttpRequestMethod {
        self.head.method()
    }

    pub fn path(&self) -> &str {
        self.head.path()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    /// 替换（或新增）一个请求头。已经缓存的派生属性不受影响。
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.head
            .headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.head.headers.push((name.to_string(), value.to_string()));
    }

    /// 请求是否携带请求体：存在 `Transfer-Encoding`，或 `Content-Length` 可以被解析
    pub fn has_body(&self) -> bool {
        self.head.header("Transfer-Encoding").is_some() || self.head.content_length().is_some()
    }

    // --- 路由参数 ---

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|v| v.as_str())
    }

    pub fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    // --- 请求体 ---

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// 设置解析后的请求体。请求体只能被设置一次，重复设置返回 `false` 且不覆盖。
    pub fn set_body(&mut self, body: Body) -> bool {
        if self.body.is_some() {
            return false;
        }
        self.body = Some(body);
        true
    }

    /// 取走请求体流，之后再取返回 `None`
    pub fn take_stream(&mut self) -> Option<Box<dyn BodyStream>> {
        self.stream.take()
    }

    /// 销毁尚未被消费的请求体流
    pub fn destroy_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.destroy();
        }
    }

    /// 客户端是否已经断开
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    // --- 惰性派生属性 ---

    /// 客户端地址：信任代理时取 `X-Forwarded-For` 的第一跳，否则取对端地址
    pub fn ip(&self) -> &str {
        self.ip.get_or_init(|| match self.ips().first() {
            Some(first) => first.clone(),
            None => self
                .transport
                .peer
                .map(|addr| addr.ip().to_string())
                .unwrap_or_default(),
        })
    }

    /// `X-Forwarded-For` 中的地址列表，保持请求头中的顺序
    pub fn ips(&self) -> &[String] {
        self.ips.get_or_init(|| {
            if !self.trust_proxy {
                return Vec::new();
            }
            self.head
                .header("X-Forwarded-For")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// `http` 或 `https`
    pub fn protocol(&self) -> &'static str {
        self.protocol.get_or_init(|| {
            if self.transport.secure {
                return "https";
            }
            if self.trust_proxy {
                if let Some(proto) = self.head.header("X-Forwarded-Proto") {
                    let first = proto.split(',').next().unwrap_or("").trim();
                    if first.eq_ignore_ascii_case("https") {
                        return "https";
                    }
                }
            }
            "http"
        })
    }

    pub fn secure(&self) -> bool {
        self.protocol() == "https"
    }

    /// 去掉端口号之后的主机名
    pub fn hostname(&self) -> Option<&str> {
        self.hostname
            .get_or_init(|| {
                let forwarded = if self.trust_proxy {
                    self.head
                        .header("X-Forwarded-Host")
                        .map(|v| v.split(',').next().unwrap_or("").trim())
                        .filter(|v| !v.is_empty())
                } else {
                    None
                };
                let host = forwarded.or_else(|| self.head.header("Host"))?;
                Some(strip_port(host).to_string())
            })
            .as_deref()
    }

    /// 子域名列表：去掉最后 `subdomain_offset` 个标签后倒序排列
    pub fn subdomains(&self) -> &[String] {
        self.subdomains.get_or_init(|| {
            let hostname = match self.hostname() {
                Some(h) => h,
                None => return Vec::new(),
            };
            let bare = hostname.trim_start_matches('[').trim_end_matches(']');
            if bare.parse::<IpAddr>().is_ok() {
                return Vec::new();
            }
            hostname
                .split('.')
                .rev()
                .skip(self.subdomain_offset)
                .map(|s| s.to_string())
                .collect()
        })
    }

    /// 解析后的查询参数
    pub fn query(&self) -> &[(String, String)] {
        self.query.get_or_init(|| match self.head.query_string() {
            Some(q) => form_urlencoded::parse(q.as_bytes()).into_owned().collect(),
            None => Vec::new(),
        })
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 条件请求是否命中。
    ///
    /// 依赖响应上已经由 ETag 钩子设置的 `ETag` / `Last-Modified`，
    /// 因此应当在钩子运行之后第一次访问。
    pub fn fresh(&self, res: &ResponseContext) -> bool {
        *self.fresh.get_or_init(|| compute_fresh(&self.head, res))
    }

    pub fn stale(&self, res: &ResponseContext) -> bool {
        !self.fresh(res)
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.find(':') {
        Some(pos) => &host[..pos],
        None => host,
    }
}

fn compute_fresh(head: &RequestHead, res: &ResponseContext) -> bool {
    match head.method() {
        HttpRequestMethod::Get | HttpRequestMethod::Head => {}
        _ => return false,
    }
    let status = res.status_code();
    if !((200..300).contains(&status) || status == 304) {
        return false;
    }

    let none_match = head.header("If-None-Match");
    let modified_since = head.header("If-Modified-Since");
    if none_match.is_none() && modified_since.is_none() {
        return false;
    }

    // Cache-Control: no-cache 要求必须重新验证
    if let Some(cc) = head.header("Cache-Control") {
        if cc
            .split(',')
            .any(|d| d.trim().eq_ignore_ascii_case("no-cache"))
        {
            return false;
        }
    }

    if let Some(none_match) = none_match.map(str::trim) {
        if none_match != "*" {
            let etag = match res.header("ETag") {
                Some(e) => e,
                None => return false,
            };
            let matched = none_match.split(',').map(str::trim).any(|tag| {
                tag == etag || tag.strip_prefix("W/") == Some(etag) || etag.strip_prefix("W/") == Some(tag)
            });
            if !matched {
                return false;
            }
        }
    }

    if let Some(since) = modified_since {
        let last_modified = match res.header("Last-Modified") {
            Some(l) => l,
            None => return false,
        };
        match (
            DateTime::parse_from_rfc2822(last_modified),
            DateTime::parse_from_rfc2822(since),
        ) {
            (Ok(lm), Ok(ims)) if lm <= ims => {}
            _ => return false,
        }
    }

    true
}
