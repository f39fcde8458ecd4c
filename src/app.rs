// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 应用
//!
//! [`Application`] 是组合根：保存中间件条目与路由表，驱动一个请求依次经过
//! 管道中的各个条目、路由处理函数与后置钩子，最后把响应写入传输层。
//!
//! 发送时机：任何一步执行后只要响应已经给出响应体，就立即运行后置钩子并发送。
//! 之后继续执行的条目再修改响应会得到 [`Exception::ResponseAlreadySent`]。

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    config::Config,
    exception::{join_methods, Exception},
    param::HttpRequestMethod,
    pipeline::{ErrorHandler, Handler, IntoHandlers, Layer, MiddlewareEntry, Next, Pipeline, Step},
    request::{RequestContext, RequestHead, Transport},
    response::ResponseContext,
    router::Router,
};

pub struct Application {
    layers: Vec<Layer>,
    router: Router<Arc<dyn Handler>>,
    router_mounted: bool,
    trust_proxy: bool,
    subdomain_offset: usize,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            router: Router::new(),
            router_mounted: false,
            trust_proxy: true,
            subdomain_offset: 2,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut app = Self::new();
        app.trust_proxy = config.trust_proxy();
        app.subdomain_offset = config.subdomain_offset();
        app
    }

    // --- 注册 ---

    pub fn use_middleware(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.layers.push(Layer::Entry(MiddlewareEntry::normal(handler)));
        self
    }

    /// 只对 `prefix` 及其子路径生效的中间件
    pub fn use_at(&mut self, prefix: &str, handler: Arc<dyn Handler>) -> &mut Self {
        self.layers
            .push(Layer::Entry(MiddlewareEntry::normal(handler).at(prefix)));
        self
    }

    pub fn use_error(&mut self, handler: Arc<dyn ErrorHandler>) -> &mut Self {
        self.layers.push(Layer::Entry(MiddlewareEntry::error(handler)));
        self
    }

    pub fn use_error_at(&mut self, prefix: &str, handler: Arc<dyn ErrorHandler>) -> &mut Self {
        self.layers
            .push(Layer::Entry(MiddlewareEntry::error(handler).at(prefix)));
        self
    }

    /// 后置钩子：响应体给出之后、发送之前按注册顺序运行
    pub fn use_after(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.layers.push(Layer::Entry(MiddlewareEntry::after(handler)));
        self
    }

    /// 注册一条路由。第一次注册时路由器在条目列表中占位。
    pub fn route(
        &mut self,
        method: HttpRequestMethod,
        pattern: &str,
        handlers: Vec<Arc<dyn Handler>>,
    ) -> Result<&mut Self, Exception> {
        self.router.register(method, pattern, handlers)?;
        if !self.router_mounted {
            self.layers.push(Layer::Router);
            self.router_mounted = true;
        }
        Ok(self)
    }

    /// 按方法注册路由，`handlers` 可以是单个处理函数，也可以是按顺序执行的处理函数链
    pub fn get(&mut self, pattern: &str, handlers: impl IntoHandlers) -> Result<&mut Self, Exception> {
        self.route(HttpRequestMethod::Get, pattern, handlers.into_handlers())
    }

    pub fn post(&mut self, pattern: &str, handlers: impl IntoHandlers) -> Result<&mut Self, Exception> {
        self.route(HttpRequestMethod::Post, pattern, handlers.into_handlers())
    }

    pub fn put(&mut self, pattern: &str, handlers: impl IntoHandlers) -> Result<&mut Self, Exception> {
        self.route(HttpRequestMethod::Put, pattern, handlers.into_handlers())
    }

    pub fn delete(&mut self, pattern: &str, handlers: impl IntoHandlers) -> Result<&mut Self, Exception> {
        self.route(HttpRequestMethod::Delete, pattern, handlers.into_handlers())
    }

    pub fn patch(&mut self, pattern: &str, handlers: impl IntoHandlers) -> Result<&mut Self, Exception> {
        self.route(HttpRequestMethod::Patch, pattern, handlers.into_handlers())
    }

    pub fn head(&mut self, pattern: &str, handlers: impl IntoHandlers) -> Result<&mut Self, Exception> {
        self.route(HttpRequestMethod::Head, pattern, handlers.into_handlers())
    }

    pub fn options(&mut self, pattern: &str, handlers: impl IntoHandlers) -> Result<&mut Self, Exception> {
        self.route(HttpRequestMethod::Options, pattern, handlers.into_handlers())
    }

    // --- 请求处理 ---

    /// 按应用的代理设置创建请求上下文
    pub fn request_context(&self, id: u128, head: RequestHead, transport: Transport) -> RequestContext {
        RequestContext::new(id, head, transport)
            .with_proxy_settings(self.trust_proxy, self.subdomain_offset)
    }

    /// 处理一个请求并把响应写入 `out`。
    ///
    /// 客户端已经断开时不写入任何内容。
    pub async fn handle<W>(
        &self,
        req: &mut RequestContext,
        res: &mut ResponseContext,
        out: &mut W,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let id = req.id();
        res.set_version(req.head().version());
        if req.method() == HttpRequestMethod::Head {
            res.set_head_only(true);
        }

        let mut pipeline = Pipeline::new(self.layers.clone());
        loop {
            if req.is_aborted() {
                warn!("[ID{}]客户端已断开，停止处理请求", id);
                return Ok(());
            }

            let path = req.path().to_string();
            let next = match pipeline.next_step(&path) {
                Step::Run(handler) => handler.call(req, res).await,
                Step::Recover(handler, err) => {
                    debug!("[ID{}]错误处理函数接管：{}", id, err);
                    handler.call(&err, req, res).await
                }
                Step::Route => self.dispatch_route(&mut pipeline, req, res),
                Step::Unhandled(err) => {
                    if res.headers_sent() {
                        error!("[ID{}]响应已发送后出现未处理的错误：{}", id, err);
                        return Ok(());
                    }
                    log_unhandled(id, &err);
                    if let Err(e) = res.reset_for_error(&err) {
                        error!("[ID{}]无法生成错误响应：{}", id, e);
                        return Ok(());
                    }
                    return self.send(&pipeline, req, res, out).await;
                }
                Step::Exhausted => {
                    if res.headers_sent() {
                        return Ok(());
                    }
                    let err = Exception::RouteNotFound {
                        method: req.method(),
                        path: req.path().to_string(),
                    };
                    warn!("[ID{}]没有条目处理该请求：{}", id, err);
                    if res.reset_for_error(&err).is_err() {
                        return Ok(());
                    }
                    return self.send(&pipeline, req, res, out).await;
                }
                Step::Finished => {
                    if res.headers_sent() {
                        return Ok(());
                    }
                    if !res.is_finished() {
                        warn!("[ID{}]请求已结束但没有给出响应体，发送空响应", id);
                        if res.end().is_err() {
                            return Ok(());
                        }
                    }
                    return self.send(&pipeline, req, res, out).await;
                }
            };
            pipeline.complete(next);

            if res.is_finished() && !res.headers_sent() {
                self.send(&pipeline, req, res, out).await?;
            }
        }
    }

    /// 处理请求并返回写出的字节，主要供测试与嵌入式调用使用
    pub async fn dispatch(&self, mut req: RequestContext) -> io::Result<(ResponseContext, Vec<u8>)> {
        let mut res = ResponseContext::new(req.id());
        let mut out = Vec::new();
        self.handle(&mut req, &mut res, &mut out).await?;
        Ok((res, out))
    }

    fn dispatch_route(
        &self,
        pipeline: &mut Pipeline,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Next {
        match self.router.resolve(req.method(), req.path()) {
            Ok(resolved) => {
                debug!("[ID{}]命中路由：{} {}", req.id(), req.method(), resolved.pattern);
                req.set_params(resolved.params);
                pipeline.splice(resolved.handlers);
                Next::Continue
            }
            // 没有注册 OPTIONS 路由时自动回应允许的方法
            Err(Exception::MethodNotAllowed { allowed })
                if req.method() == HttpRequestMethod::Options =>
            {
                let allow = join_methods(&allowed);
                Next::finish(
                    res.status(204)
                        .and_then(|r| r.set_header("Allow", &allow))
                        .and_then(|r| r.end()),
                )
            }
            Err(e) => Next::Error(e),
        }
    }

    /// 运行后置钩子并发送响应
    async fn send<W>(
        &self,
        pipeline: &Pipeline,
        req: &mut RequestContext,
        res: &mut ResponseContext,
        out: &mut W,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let id = req.id();
        for hook in pipeline.after_hooks(req.path()) {
            if let Next::Error(err) = hook.call(req, res).await {
                error!("[ID{}]后置钩子出错：{}", id, err);
                if let Err(e) = res.reset_for_error(&err) {
                    error!("[ID{}]无法生成错误响应：{}", id, e);
                }
                break;
            }
        }

        let bytes = match res.flush() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("[ID{}]响应发送失败：{}", id, e);
                return Ok(());
            }
        };
        info!(
            "[ID{}] {}, {}, {}, {}, {}",
            id,
            req.head().version(),
            req.method(),
            req.head().target(),
            res.status_code(),
            res.information(),
        );
        out.write_all(&bytes).await?;
        out.flush().await
    }
}

fn log_unhandled(id: u128, err: &Exception) {
    if err.is_client_error() {
        warn!("[ID{}]{}，返回{}", id, err, err.status_code());
    } else {
        error!("[ID{}]未处理的错误：{}，返回{}", id, err, err.status_code());
    }
}

struct ConditionalGet;

#[async_trait]
impl Handler for ConditionalGet {
    async fn call(&self, req: &mut RequestContext, res: &mut ResponseContext) -> Next {
        if req.fresh(res) {
            debug!("[ID{}]条件请求命中，返回304", req.id());
            return Next::proceed(res.status(304));
        }
        Next::Continue
    }
}

/// 后置钩子：请求的条件头与响应的 `ETag` / `Last-Modified` 匹配时改为 304。
///
/// 依赖此前的后置钩子（或处理函数）设置的校验值，应当在它们之后注册。
pub fn conditional_get() -> Arc<dyn Handler> {
    Arc::new(ConditionalGet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{Body, MemoryBody};
    use crate::parser::BodyParser;
    use crate::pipeline::{error_handler_fn, handler_fn};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use HttpRequestMethod::*;

    fn request(app: &Application, method: HttpRequestMethod, target: &str) -> RequestContext {
        app.request_context(1, RequestHead::new(method, target), Transport::default())
    }

    fn text(body: &'static str) -> Arc<dyn Handler> {
        handler_fn(move |_req, res| Next::finish(res.text(body)))
    }

    async fn wire(app: &Application, req: RequestContext) -> (ResponseContext, String) {
        let (res, bytes) = app.dispatch(req).await.unwrap();
        (res, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_route_with_params() {
        let mut app = Application::new();
        app.get(
            "/users/:id",
            handler_fn(|req, res| {
                let id = req.param("id").unwrap_or("").to_string();
                Next::finish(res.text(format!("user {}", id)))
            }),
        )
        .unwrap();
        let (res, out) = wire(&app, request(&app, Get, "/users/123")).await;
        assert_eq!(res.status_code(), 200);
        assert!(out.ends_with("user 123"));
    }

    #[tokio::test]
    async fn test_405_with_allow() {
        let mut app = Application::new();
        app.post("/users/:id", text("created")).unwrap();
        let (res, out) = wire(&app, request(&app, Get, "/users/1")).await;
        assert_eq!(res.status_code(), 405);
        assert!(out.contains("Allow: POST\r\n"));
    }

    #[tokio::test]
    async fn test_404_when_nothing_matches() {
        let mut app = Application::new();
        app.get("/", text("home")).unwrap();
        let (res, _) = wire(&app, request(&app, Get, "/missing")).await;
        assert_eq!(res.status_code(), 404);
    }

    #[tokio::test]
    async fn test_404_without_routes() {
        let app = Application::new();
        let (res, _) = wire(&app, request(&app, Get, "/")).await;
        assert_eq!(res.status_code(), 404);
    }

    #[tokio::test]
    async fn test_unhandled_handler_error_is_500() {
        let mut app = Application::new();
        app.get(
            "/boom",
            handler_fn(|_req, _res| {
                Next::Error(Exception::handler(io::Error::new(io::ErrorKind::Other, "db down")))
            }),
        )
        .unwrap();
        let (res, out) = wire(&app, request(&app, Get, "/boom")).await;
        assert_eq!(res.status_code(), 500);
        assert!(!out.contains("db down"));
    }

    #[tokio::test]
    async fn test_error_handler_claims_error() {
        let mut app = Application::new();
        let skipped = Arc::new(AtomicBool::new(false));
        let skipped_flag = Arc::clone(&skipped);
        app.get(
            "/fail",
            handler_fn(|_req, _res| Next::Error(Exception::with_status(422, "bad input"))),
        )
        .unwrap();
        app.use_middleware(handler_fn(move |_req, _res| {
            skipped_flag.store(true, Ordering::SeqCst);
            Next::Continue
        }));
        app.use_error(error_handler_fn(|err, _req, res| {
            let status = err.status_code();
            Next::finish(
                res.status(status)
                    .and_then(|r| r.json(&serde_json::json!({"error": err.to_string()}))),
            )
        }));
        let (res, out) = wire(&app, request(&app, Get, "/fail")).await;
        assert_eq!(res.status_code(), 422);
        assert!(out.contains(r#"{"error":"bad input"}"#));
        assert!(!skipped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_route_handler_can_continue_into_later_middleware() {
        let mut app = Application::new();
        app.get(
            "/chain",
            handler_fn(|_req, res| Next::proceed(res.set_header("X-Route", "yes"))),
        )
        .unwrap();
        app.use_middleware(text("tail"));
        let (res, out) = wire(&app, request(&app, Get, "/chain")).await;
        assert_eq!(res.status_code(), 200);
        assert!(out.contains("X-Route: yes\r\n"));
        assert!(out.ends_with("tail"));
    }

    #[tokio::test]
    async fn test_writes_after_flush_fail() {
        let mut app = Application::new();
        let observed = Arc::new(AtomicBool::new(false));
        let observed_flag = Arc::clone(&observed);
        app.get(
            "/",
            handler_fn(|_req, res| Next::proceed(res.text("first"))),
        )
        .unwrap();
        app.use_middleware(handler_fn(move |_req, res| {
            if matches!(res.set_header("X-Late", "1"), Err(Exception::ResponseAlreadySent)) {
                observed_flag.store(true, Ordering::SeqCst);
            }
            Next::End
        }));
        let (_, out) = wire(&app, request(&app, Get, "/")).await;
        assert!(observed.load(Ordering::SeqCst));
        assert!(!out.contains("X-Late"));
        assert_eq!(out.matches("HTTP/1.1").count(), 1);
    }

    #[tokio::test]
    async fn test_after_hooks_run_in_order_before_flush() {
        let mut app = Application::new();
        let order = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);
        app.use_after(handler_fn(move |_req, res| {
            let seen = first.fetch_add(1, Ordering::SeqCst);
            Next::proceed(res.set_header("X-First", &seen.to_string()))
        }));
        app.use_after(handler_fn(move |_req, res| {
            let seen = second.fetch_add(1, Ordering::SeqCst);
            Next::proceed(res.set_header("X-Second", &seen.to_string()))
        }));
        app.get("/", text("ok")).unwrap();
        let (_, out) = wire(&app, request(&app, Get, "/")).await;
        assert!(out.contains("X-First: 0\r\n"));
        assert!(out.contains("X-Second: 1\r\n"));
    }

    #[tokio::test]
    async fn test_after_hook_error_yields_error_response() {
        let mut app = Application::new();
        app.use_after(handler_fn(|_req, _res| {
            Next::Error(Exception::with_status(500, "hook failed"))
        }));
        app.get("/", text("ok")).unwrap();
        let (res, out) = wire(&app, request(&app, Get, "/")).await;
        assert_eq!(res.status_code(), 500);
        assert!(!out.ends_with("ok"));
    }

    #[tokio::test]
    async fn test_prefix_scoped_middleware() {
        let mut app = Application::new();
        app.use_at("/admin", handler_fn(|_req, res| Next::finish(res.status(401).and_then(|r| r.text("denied")))));
        app.get("/admin/panel", text("panel")).unwrap();
        app.get("/administrator", text("other")).unwrap();

        let (res, _) = wire(&app, request(&app, Get, "/admin/panel")).await;
        assert_eq!(res.status_code(), 401);
        let (res, out) = wire(&app, request(&app, Get, "/administrator")).await;
        assert_eq!(res.status_code(), 200);
        assert!(out.ends_with("other"));
    }

    #[tokio::test]
    async fn test_automatic_options() {
        let mut app = Application::new();
        app.get("/items", text("list")).unwrap();
        app.post("/items", text("created")).unwrap();
        let (res, out) = wire(&app, request(&app, Options, "/items")).await;
        assert_eq!(res.status_code(), 204);
        assert!(out.contains("Allow: GET, HEAD, POST\r\n"));
        assert!(!out.contains("Content-Length"));
    }

    #[tokio::test]
    async fn test_options_allow_merges_static_and_param_routes() {
        let mut app = Application::new();
        app.get("/users/:id", text("show")).unwrap();
        app.post("/users/new", text("create")).unwrap();

        let (res, out) = wire(&app, request(&app, Options, "/users/new")).await;
        assert_eq!(res.status_code(), 204);
        assert!(out.contains("Allow: POST, GET, HEAD\r\n"));

        let (res, out) = wire(&app, request(&app, Put, "/users/new")).await;
        assert_eq!(res.status_code(), 405);
        assert!(out.contains("Allow: POST, GET, HEAD\r\n"));
    }

    #[tokio::test]
    async fn test_verb_helper_accepts_handler_chain() {
        let mut app = Application::new();
        app.get(
            "/chain",
            vec![
                handler_fn(|_req, res| Next::proceed(res.set_header("X-Step", "1"))),
                text("done"),
            ],
        )
        .unwrap();
        let (res, out) = wire(&app, request(&app, Get, "/chain")).await;
        assert_eq!(res.status_code(), 200);
        assert!(out.contains("X-Step: 1\r\n"));
        assert!(out.ends_with("done"));
    }

    #[tokio::test]
    async fn test_head_uses_get_route_without_body() {
        let mut app = Application::new();
        app.get("/page", text("hello")).unwrap();
        let (res, out) = wire(&app, request(&app, Head, "/page")).await;
        assert_eq!(res.status_code(), 200);
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_conditional_get_returns_304() {
        let mut app = Application::new();
        app.use_after(handler_fn(|_req, res| Next::proceed(res.set_header("ETag", "\"v1\""))));
        app.use_after(conditional_get());
        app.get("/doc", text("document")).unwrap();

        let req = app.request_context(
            2,
            RequestHead::new(Get, "/doc").with_header("If-None-Match", "\"v1\""),
            Transport::default(),
        );
        let (res, out) = wire(&app, req).await;
        assert_eq!(res.status_code(), 304);
        assert!(!out.contains("document"));

        let (res, _) = wire(&app, request(&app, Get, "/doc")).await;
        assert_eq!(res.status_code(), 200);
    }

    #[tokio::test]
    async fn test_parser_error_maps_to_status() {
        let mut app = Application::new();
        app.use_middleware(Arc::new(BodyParser::json()));
        app.post(
            "/echo",
            handler_fn(|req, res| match req.body().and_then(Body::as_json) {
                Some(v) => {
                    let v = v.clone();
                    Next::finish(res.json(&v))
                }
                None => Next::finish(res.send_status(400)),
            }),
        )
        .unwrap();

        let req = app
            .request_context(
                3,
                RequestHead::new(Post, "/echo")
                    .with_header("Content-Type", "application/json")
                    .with_header("Content-Length", "6"),
                Transport::default(),
            )
            .with_stream(Box::new(MemoryBody::new(vec![r#"{"a":}"#])));
        let (res, _) = wire(&app, req).await;
        assert_eq!(res.status_code(), 400);

        let req = app
            .request_context(
                4,
                RequestHead::new(Post, "/echo")
                    .with_header("Content-Type", "application/json")
                    .with_header("Content-Length", "7"),
                Transport::default(),
            )
            .with_stream(Box::new(MemoryBody::new(vec![r#"{"a":1}"#])));
        let (res, out) = wire(&app, req).await;
        assert_eq!(res.status_code(), 200);
        assert!(out.ends_with(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn test_aborted_request_writes_nothing() {
        let mut app = Application::new();
        app.use_middleware(Arc::new(BodyParser::text()));
        app.post("/upload", text("stored")).unwrap();
        let req = app
            .request_context(
                5,
                RequestHead::new(Post, "/upload")
                    .with_header("Content-Type", "text/plain")
                    .with_header("Content-Length", "100"),
                Transport::default(),
            )
            .with_stream(Box::new(MemoryBody::truncated(vec!["partial"])));
        let (res, out) = wire(&app, req).await;
        assert!(out.is_empty());
        assert!(!res.headers_sent());
    }

    #[tokio::test]
    async fn test_registration_errors() {
        let mut app = Application::new();
        app.get("/a/:id", text("a")).unwrap();
        assert!(matches!(
            app.get("/a/:key/", text("b")),
            Err(Exception::DuplicateRoute { .. })
        ));
        assert!(matches!(
            app.get("/x/*/y", text("c")),
            Err(Exception::InvalidRoutePattern(_))
        ));
    }
}
