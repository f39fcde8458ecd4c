// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 响应模块
//!
//! [`ResponseContext`] 保存状态码、响应头与响应体，并负责最终序列化为报文。
//!
//! 响应有两个阶段性的标记：
//! - `finished`：处理函数已经给出了响应体（`send` 系列方法）。此时后置钩子（压缩、ETag）
//!   仍然可以修改响应头与响应体。
//! - `headers_sent`：报文已经交给传输层。之后任何修改都会返回
//!   [`Exception::ResponseAlreadySent`]，保证一个响应最多只被发送一次。

use bytes::Bytes;
use chrono::prelude::*;
use log::debug;
use serde::Serialize;

use crate::{
    exception::{join_methods, Exception},
    param::*,
    util::HtmlBuilder,
};

#[derive(Debug, Clone)]
pub struct ResponseContext {
    id: u128,
    version: HttpVersion,
    status_code: u16,
    headers: Vec<(String, String)>,
    content: Option<Bytes>,
    finished: bool,
    headers_sent: bool,
    head_only: bool,
}

impl ResponseContext {
    pub fn new(id: u128) -> Self {
        Self {
            id,
            version: HttpVersion::V1_1,
            status_code: 200,
            headers: Vec::new(),
            content: None,
            finished: false,
            headers_sent: false,
            head_only: false,
        }
    }

    /// HEAD 请求：序列化时保留 `Content-Length` 但不写出响应体
    pub fn set_head_only(&mut self, head_only: bool) {
        self.head_only = head_only;
    }

    pub fn set_version(&mut self, version: HttpVersion) {
        self.version = version;
    }

    fn ensure_not_sent(&self) -> Result<(), Exception> {
        if self.headers_sent {
            return Err(Exception::ResponseAlreadySent);
        }
        Ok(())
    }

    pub fn status(&mut self, code: u16) -> Result<&mut Self, Exception> {
        self.ensure_not_sent()?;
        self.status_code = code;
        Ok(self)
    }

    /// 替换（或新增）一个响应头，名称大小写不敏感
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<&mut Self, Exception> {
        self.ensure_not_sent()?;
        check_header(name, value)?;
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        Ok(self)
    }

    /// 追加一个响应头（允许重名，例如 `Set-Cookie`）
    pub fn append_header(&mut self, name: &str, value: &str) -> Result<&mut Self, Exception> {
        self.ensure_not_sent()?;
        check_header(name, value)?;
        self.headers.push((name.to_string(), value.to_string()));
        Ok(self)
    }

    pub fn remove_header(&mut self, name: &str) -> Result<&mut Self, Exception> {
        self.ensure_not_sent()?;
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        Ok(self)
    }

    /// 向逗号分隔的 `Vary` 头中加入一个字段，已存在时不重复添加
    pub fn vary(&mut self, field: &str) -> Result<&mut Self, Exception> {
        let current = self.header("Vary").map(str::to_string);
        match current {
            Some(v) if v.trim() == "*" => Ok(self),
            Some(v)
                if v
                    .split(',')
                    .any(|f| f.trim().eq_ignore_ascii_case(field)) =>
            {
                Ok(self)
            }
            Some(v) if !v.trim().is_empty() => self.set_header("Vary", &format!("{}, {}", v, field)),
            _ => self.set_header("Vary", field),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// 设置响应体并标记响应完成。未设置 `Content-Type` 时使用 `application/octet-stream`。
    pub fn send(&mut self, body: impl Into<Bytes>) -> Result<(), Exception> {
        self.ensure_not_sent()?;
        if self.finished {
            return Err(Exception::ResponseAlreadySent);
        }
        if self.header("Content-Type").is_none() {
            self.set_header("Content-Type", "application/octet-stream")?;
        }
        self.content = Some(body.into());
        self.finished = true;
        Ok(())
    }

    pub fn text(&mut self, body: impl Into<String>) -> Result<(), Exception> {
        self.set_header("Content-Type", "text/plain;charset=utf-8")?;
        self.send(body.into())
    }

    pub fn html(&mut self, body: impl Into<String>) -> Result<(), Exception> {
        self.set_header("Content-Type", "text/html;charset=utf-8")?;
        self.send(body.into())
    }

    pub fn json<T: Serialize>(&mut self, value: &T) -> Result<(), Exception> {
        let bytes = serde_json::to_vec(value).map_err(Exception::handler)?;
        self.set_header("Content-Type", "application/json;charset=utf-8")?;
        self.send(bytes)
    }

    /// 设置状态码并以原因短语作为响应体
    pub fn send_status(&mut self, code: u16) -> Result<(), Exception> {
        self.status(code)?;
        self.text(reason_phrase(code))
    }

    /// 不带响应体结束响应
    pub fn end(&mut self) -> Result<(), Exception> {
        self.ensure_not_sent()?;
        if self.finished {
            return Err(Exception::ResponseAlreadySent);
        }
        self.content = Some(Bytes::new());
        self.finished = true;
        Ok(())
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    /// 替换响应体，供后置钩子（压缩等）使用
    pub fn replace_payload(&mut self, payload: Bytes) -> Result<(), Exception> {
        self.ensure_not_sent()?;
        self.content = Some(payload);
        Ok(())
    }

    /// 用异常生成默认错误响应，覆盖此前设置的所有响应头与响应体
    pub fn reset_for_error(&mut self, err: &Exception) -> Result<(), Exception> {
        self.ensure_not_sent()?;
        let code = err.status_code();
        self.headers.clear();
        self.content = None;
        self.finished = false;
        self.status_code = code;

        // 5xx 不向客户端暴露内部错误信息
        let message = if err.is_client_error() {
            Some(err.to_string())
        } else {
            None
        };
        let html = HtmlBuilder::from_status_code(code, message.as_deref()).build();

        if let Exception::MethodNotAllowed { allowed } = err {
            self.set_header("Allow", &join_methods(allowed))?;
        }
        self.set_header("Content-Security-Policy", "default-src 'none'")?;
        self.set_header("X-Content-Type-Options", "nosniff")?;
        self.html(html)
    }

    /// 序列化为 HTTP 报文并标记响应头已发送。
    ///
    /// 同一个响应只能被 flush 一次。
    pub fn flush(&mut self) -> Result<Vec<u8>, Exception> {
        self.ensure_not_sent()?;
        self.headers_sent = true;

        let no_body = self.status_code == 204 || self.status_code == 304;
        let content = if no_body {
            Bytes::new()
        } else {
            self.content.clone().unwrap_or_default()
        };

        let mut header = String::with_capacity(256);
        header.push_str(&format!(
            "{} {} {}{}",
            self.version,
            self.status_code,
            reason_phrase(self.status_code),
            CRLF
        ));
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Length")
                || name.eq_ignore_ascii_case("Date")
                || name.eq_ignore_ascii_case("Server")
                || name.eq_ignore_ascii_case("Connection")
            {
                continue;
            }
            if no_body
                && (name.eq_ignore_ascii_case("Content-Type")
                    || name.eq_ignore_ascii_case("Transfer-Encoding"))
            {
                continue;
            }
            header.push_str(&format!("{}: {}{}", name, value, CRLF));
        }
        if !no_body {
            header.push_str(&format!("Content-Length: {}{}", content.len(), CRLF));
        }
        header.push_str(&format!("Date: {}{}", format_date(&Utc::now()), CRLF));
        header.push_str(&format!("Server: {}{}", SERVER_NAME, CRLF));
        header.push_str(&format!("Connection: close{}", CRLF));
        header.push_str(CRLF);

        let mut bytes = header.into_bytes();
        if !self.head_only {
            bytes.extend_from_slice(&content);
        }
        debug!(
            "[ID{}]响应序列化完成，状态码{}，响应体{}字节",
            self.id,
            self.status_code,
            content.len()
        );
        Ok(bytes)
    }
}

impl ResponseContext {
    pub fn id(&self) -> u128 {
        self.id
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn information(&self) -> &'static str {
        reason_phrase(self.status_code)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn is_head_only(&self) -> bool {
        self.head_only
    }
}

/// 头名不能为空，头名与值都不能包含换行符
fn check_header(name: &str, value: &str) -> Result<(), Exception> {
    let bad = |c: char| c == '\r' || c == '\n' || c == '\0';
    if name.is_empty() || name.contains(bad) || name.contains(':') || value.contains(bad) {
        return Err(Exception::InvalidHeader(name.to_string()));
    }
    Ok(())
}

/// `Date` 头使用的 IMF-fixdate 格式
fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
