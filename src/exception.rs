// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了服务器在请求处理生命周期中可能产生的各类异常情况。
//!
//! ## 设计意图
//! - **错误分类**：涵盖协议解析错误、路由错误、请求体解析错误以及处理函数抛出的业务错误。
//! - **语义映射**：每个变体通过 [`Exception::status_code`] 对应一个 HTTP 状态码，
//!   默认错误响应器据此生成响应。
//! - **启动期错误**：`DuplicateRoute` 与 `InvalidRoutePattern` 只会在注册路由时出现，
//!   调用方应当在开始监听之前直接失败。

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::param::HttpRequestMethod;

/// 服务器处理请求过程中发生的异常类型。
#[derive(Debug, Clone, Error)]
pub enum Exception {
    /// 客户端发送的请求头无法解析为合法的 UTF-8 字符串。
    #[error("Request bytes can't be parsed in UTF-8")]
    RequestIsNotUtf8,
    /// 请求行格式错误或使用了服务器不认识的 HTTP 方法。
    #[error("Unsupported request method")]
    UnSupportedRequestMethod,
    /// 客户端使用了服务器不支持的 HTTP 协议版本。
    #[error("Unsupported HTTP version")]
    UnsupportedHttpVersion,
    /// 请求路径无法解码（非法的百分号编码或非 UTF-8）。
    #[error("Invalid path (400)")]
    InvalidPath,
    /// 请求头部分超过上限。
    #[error("Request header fields too large (431)")]
    HeaderTooLarge,
    /// 路由表中不存在与路径匹配的节点。
    #[error("Cannot {method} {path} (404)")]
    RouteNotFound {
        method: HttpRequestMethod,
        path: String,
    },
    /// 路径存在，但没有为该方法注册处理函数。
    #[error("Method not allowed, allowed: {} (405)", join_methods(.allowed))]
    MethodNotAllowed { allowed: Vec<HttpRequestMethod> },
    /// 请求体超过解析器配置的大小上限。
    #[error("Request entity too large: limit is {limit} bytes (413)")]
    PayloadTooLarge { limit: u64 },
    /// 不支持的内容类型、字符集或内容编码。
    #[error("Unsupported media type: {0} (415)")]
    UnsupportedMediaType(String),
    /// 请求体语法错误。
    #[error("{}", describe_malformed(.message, .offset, .token))]
    MalformedBody {
        message: String,
        offset: Option<usize>,
        token: Option<String>,
    },
    /// 客户端在请求体传输完成之前关闭了连接。
    #[error("Request aborted by client")]
    RequestAborted,
    /// 同一方法与规范化路径被重复注册。
    #[error("Duplicate route: {method} {pattern}")]
    DuplicateRoute {
        method: HttpRequestMethod,
        pattern: String,
    },
    /// 路由模式本身不合法（例如通配符不在最后一段）。
    #[error("Invalid route pattern: {0}")]
    InvalidRoutePattern(String),
    /// 响应头名或值中包含换行符等非法字符。
    #[error("Invalid response header: {0}")]
    InvalidHeader(String),
    /// 响应头已经发送后仍尝试修改状态码、响应头或响应体。
    #[error("Cannot modify response after headers have been sent")]
    ResponseAlreadySent,
    /// 处理函数通过 `Next::Error` 传递的业务错误。
    #[error("{source}")]
    Handler {
        status: u16,
        source: Arc<dyn StdError + Send + Sync>,
    },
}

impl Exception {
    /// 将任意错误包装为状态码 500 的业务错误
    pub fn handler<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Exception::Handler {
            status: 500,
            source: Arc::new(err),
        }
    }

    /// 以指定状态码和消息构造业务错误
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Exception::Handler {
            status,
            source: Arc::new(Message(message.into())),
        }
    }

    /// 构造请求体语法错误
    pub fn malformed(message: impl Into<String>) -> Self {
        Exception::MalformedBody {
            message: message.into(),
            offset: None,
            token: None,
        }
    }

    /// 异常对应的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Exception::RequestIsNotUtf8
            | Exception::UnSupportedRequestMethod
            | Exception::InvalidPath
            | Exception::MalformedBody { .. }
            | Exception::RequestAborted => 400,
            Exception::UnsupportedHttpVersion => 505,
            Exception::HeaderTooLarge => 431,
            Exception::RouteNotFound { .. } => 404,
            Exception::MethodNotAllowed { .. } => 405,
            Exception::PayloadTooLarge { .. } => 413,
            Exception::UnsupportedMediaType(_) => 415,
            Exception::DuplicateRoute { .. }
            | Exception::InvalidRoutePattern(_)
            | Exception::InvalidHeader(_)
            | Exception::ResponseAlreadySent => 500,
            Exception::Handler { status, .. } => {
                if (400..600).contains(status) {
                    *status
                } else {
                    500
                }
            }
        }
    }

    /// 是否属于客户端错误，决定默认响应中是否暴露错误消息
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

/// 仅携带消息的错误，用于 [`Exception::with_status`]
#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

/// 生成 `Allow` 头所用的方法列表
pub fn join_methods(methods: &[HttpRequestMethod]) -> String {
    methods
        .iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_malformed(message: &str, offset: &Option<usize>, token: &Option<String>) -> String {
    match (offset, token) {
        (Some(o), Some(t)) => format!("{} at byte {} near {:?}", message, o, t),
        (Some(o), None) => format!("{} at byte {}", message, o),
        _ => message.to_string(),
    }
}
