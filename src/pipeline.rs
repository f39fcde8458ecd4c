// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 中间件管道
//!
//! 每个请求拥有一条独立的 [`Pipeline`]，它是一个显式的游标状态机：
//!
//! ```text
//! Pending -> Running(i) -> Running(i + 1)   (Next::Continue)
//!                       -> Error(i + 1, e)  (Next::Error)
//!                       -> Done             (Next::End 或条目耗尽)
//! ```
//!
//! - `Running` 状态下只执行普通条目，错误处理条目被跳过；
//! - `Error` 状态下只执行错误处理条目，普通条目被跳过；
//!   错误处理条目返回 `Continue` 时清除错误并恢复执行普通条目；
//! - 路由器在条目列表中占一个位置，命中后把路由的处理函数链插入到它后面。
//!
//! 管道本身不做任何 I/O，由 [`crate::app::Application`] 驱动并决定何时发送响应。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{exception::Exception, request::RequestContext, response::ResponseContext};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 条目执行结果
#[derive(Debug)]
pub enum Next {
    /// 继续执行下一个条目
    Continue,
    /// 跳转到后续最近的错误处理条目
    Error(Exception),
    /// 请求已经处理完毕，停止执行
    End,
}

impl Next {
    /// `Ok` 视为处理完毕，`Err` 进入错误处理
    pub fn finish(result: Result<(), Exception>) -> Self {
        match result {
            Ok(()) => Next::End,
            Err(e) => Next::Error(e),
        }
    }

    /// `Ok` 视为继续，`Err` 进入错误处理
    pub fn proceed<T>(result: Result<T, Exception>) -> Self {
        match result {
            Ok(_) => Next::Continue,
            Err(e) => Next::Error(e),
        }
    }
}

/// 普通处理函数（路由处理函数、中间件、后置钩子）
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: &mut RequestContext, res: &mut ResponseContext) -> Next;
}

/// 错误处理函数
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn call(
        &self,
        err: &Exception,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Next;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut RequestContext, &mut ResponseContext) -> Next + Send + Sync,
{
    async fn call(&self, req: &mut RequestContext, res: &mut ResponseContext) -> Next {
        (self.0)(req, res)
    }
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F> Handler for AsyncFnHandler<F>
where
    F: for<'a> Fn(&'a mut RequestContext, &'a mut ResponseContext) -> BoxFuture<'a, Next>
        + Send
        + Sync,
{
    async fn call(&self, req: &mut RequestContext, res: &mut ResponseContext) -> Next {
        (self.0)(req, res).await
    }
}

struct FnErrorHandler<F>(F);

#[async_trait]
impl<F> ErrorHandler for FnErrorHandler<F>
where
    F: Fn(&Exception, &mut RequestContext, &mut ResponseContext) -> Next + Send + Sync,
{
    async fn call(
        &self,
        err: &Exception,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Next {
        (self.0)(err, req, res)
    }
}

/// 把同步闭包包装为 [`Handler`]
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&mut RequestContext, &mut ResponseContext) -> Next + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// 把返回 future 的闭包包装为 [`Handler`]：
/// `async_handler_fn(|req, res| Box::pin(async move { ... }))`
pub fn async_handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(&'a mut RequestContext, &'a mut ResponseContext) -> BoxFuture<'a, Next>
        + Send
        + Sync
        + 'static,
{
    Arc::new(AsyncFnHandler(f))
}

/// 把同步闭包包装为 [`ErrorHandler`]
pub fn error_handler_fn<F>(f: F) -> Arc<dyn ErrorHandler>
where
    F: Fn(&Exception, &mut RequestContext, &mut ResponseContext) -> Next
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnErrorHandler(f))
}

/// 路由注册时接受单个处理函数或处理函数链
pub trait IntoHandlers {
    fn into_handlers(self) -> Vec<Arc<dyn Handler>>;
}

impl IntoHandlers for Arc<dyn Handler> {
    fn into_handlers(self) -> Vec<Arc<dyn Handler>> {
        vec![self]
    }
}

impl IntoHandlers for Vec<Arc<dyn Handler>> {
    fn into_handlers(self) -> Vec<Arc<dyn Handler>> {
        self
    }
}

/// 条目函数的标签：普通函数与错误处理函数显式区分
#[derive(Clone)]
pub enum MiddlewareFn {
    Normal(Arc<dyn Handler>),
    ErrorHandler(Arc<dyn ErrorHandler>),
}

#[derive(Clone)]
pub struct MiddlewareEntry {
    pub path_prefix: Option<String>,
    pub func: MiddlewareFn,
    pub runs_after_response: bool,
}

impl MiddlewareEntry {
    pub fn normal(handler: Arc<dyn Handler>) -> Self {
        Self {
            path_prefix: None,
            func: MiddlewareFn::Normal(handler),
            runs_after_response: false,
        }
    }

    pub fn error(handler: Arc<dyn ErrorHandler>) -> Self {
        Self {
            path_prefix: None,
            func: MiddlewareFn::ErrorHandler(handler),
            runs_after_response: false,
        }
    }

    pub fn after(handler: Arc<dyn Handler>) -> Self {
        Self {
            path_prefix: None,
            func: MiddlewareFn::Normal(handler),
            runs_after_response: true,
        }
    }

    pub fn at(mut self, prefix: &str) -> Self {
        self.path_prefix = Some(prefix.to_string());
        self
    }

    fn applies_to(&self, path: &str) -> bool {
        match &self.path_prefix {
            Some(prefix) => prefix_matches(prefix, path),
            None => true,
        }
    }
}

/// 条目列表中的一层：中间件条目或路由器占位
#[derive(Clone)]
pub enum Layer {
    Entry(MiddlewareEntry),
    Router,
}

#[derive(Debug)]
pub enum State {
    Pending,
    /// 下一个待检查的位置，普通模式
    Running(usize),
    /// 下一个待检查的位置，错误模式
    Error(usize, Exception),
    Done,
}

/// `next_step` 给出的下一步动作
pub enum Step {
    Run(Arc<dyn Handler>),
    Recover(Arc<dyn ErrorHandler>, Exception),
    Route,
    /// 没有错误处理条目认领的错误
    Unhandled(Exception),
    /// 条目耗尽，没有任何条目结束请求
    Exhausted,
    Finished,
}

pub struct Pipeline {
    layers: Vec<Layer>,
    state: State,
    current: usize,
}

impl Pipeline {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self {
            layers,
            state: State::Pending,
            current: 0,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// 根据当前状态找到下一个应当执行的条目
    pub fn next_step(&mut self, path: &str) -> Step {
        let state = std::mem::replace(&mut self.state, State::Done);
        match state {
            State::Pending => {
                self.state = State::Running(0);
                self.next_step(path)
            }
            State::Running(from) => {
                for index in from..self.layers.len() {
                    let step = match &self.layers[index] {
                        Layer::Router => Step::Route,
                        Layer::Entry(entry) if entry.runs_after_response => continue,
                        Layer::Entry(entry) if !entry.applies_to(path) => continue,
                        Layer::Entry(entry) => match &entry.func {
                            MiddlewareFn::Normal(h) => Step::Run(Arc::clone(h)),
                            MiddlewareFn::ErrorHandler(_) => continue,
                        },
                    };
                    self.current = index;
                    self.state = State::Running(index);
                    return step;
                }
                Step::Exhausted
            }
            State::Error(from, err) => {
                for index in from..self.layers.len() {
                    if let Layer::Entry(entry) = &self.layers[index] {
                        if entry.runs_after_response || !entry.applies_to(path) {
                            continue;
                        }
                        if let MiddlewareFn::ErrorHandler(h) = &entry.func {
                            let handler = Arc::clone(h);
                            self.current = index;
                            self.state = State::Error(index, err.clone());
                            return Step::Recover(handler, err);
                        }
                    }
                }
                Step::Unhandled(err)
            }
            State::Done => Step::Finished,
        }
    }

    /// 记录当前条目的执行结果并推进游标
    pub fn complete(&mut self, next: Next) {
        if matches!(self.state, State::Done) {
            return;
        }
        let following = self.current + 1;
        self.state = match next {
            Next::Continue => State::Running(following),
            Next::Error(err) => State::Error(following, err),
            Next::End => State::Done,
        };
    }

    /// 把路由的处理函数链插入到当前位置之后
    pub fn splice(&mut self, handlers: Vec<Arc<dyn Handler>>) {
        let at = self.current + 1;
        self.layers.splice(
            at..at,
            handlers
                .into_iter()
                .map(|h| Layer::Entry(MiddlewareEntry::normal(h))),
        );
    }

    /// 适用于该路径的后置钩子，按注册顺序
    pub fn after_hooks(&self, path: &str) -> Vec<Arc<dyn Handler>> {
        self.layers
            .iter()
            .filter_map(|layer| match layer {
                Layer::Entry(entry) if entry.runs_after_response && entry.applies_to(path) => {
                    match &entry.func {
                        MiddlewareFn::Normal(h) => Some(Arc::clone(h)),
                        MiddlewareFn::ErrorHandler(_) => None,
                    }
                }
                _ => None,
            })
            .collect()
    }
}

/// 中间件路径前缀是否匹配：按路径段对齐，而不是简单的字符串前缀
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::HttpRequestMethod;
    use crate::request::{RequestHead, Transport};
    use std::sync::Mutex;

    fn contexts(path: &str) -> (RequestContext, ResponseContext) {
        (
            RequestContext::new(
                0,
                RequestHead::new(HttpRequestMethod::Get, path),
                Transport::default(),
            ),
            ResponseContext::new(0),
        )
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str, next: fn() -> Next) -> Arc<dyn Handler> {
        let log = Arc::clone(log);
        handler_fn(move |_req, _res| {
            log.lock().unwrap().push(name);
            next()
        })
    }

    /// 不带路由器的最小驱动循环
    async fn drive(pipeline: &mut Pipeline, req: &mut RequestContext, res: &mut ResponseContext) -> Option<Exception> {
        loop {
            let next = match pipeline.next_step(req.path()) {
                Step::Run(h) => h.call(req, res).await,
                Step::Recover(h, err) => h.call(&err, req, res).await,
                Step::Route => Next::Continue,
                Step::Unhandled(err) => return Some(err),
                Step::Exhausted | Step::Finished => return None,
            };
            pipeline.complete(next);
        }
    }

    #[test]
    fn test_prefix_matches_segment_aligned() {
        assert!(prefix_matches("/api", "/api"));
        assert!(prefix_matches("/api", "/api/users"));
        assert!(prefix_matches("/api/", "/api/users"));
        assert!(!prefix_matches("/api", "/apiary"));
        assert!(prefix_matches("/", "/anything"));
    }

    #[tokio::test]
    async fn test_error_skips_normal_entries() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(None));
        let seen_in_handler = Arc::clone(&seen);
        let mut pipeline = Pipeline::new(vec![
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "first", || {
                Next::Error(Exception::with_status(418, "teapot"))
            }))),
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "skipped", || Next::Continue))),
            Layer::Entry(MiddlewareEntry::error(error_handler_fn(move |err, _req, res| {
                *seen_in_handler.lock().unwrap() = Some(err.status_code());
                Next::finish(res.text("handled"))
            }))),
        ]);
        let (mut req, mut res) = contexts("/");
        let unhandled = drive(&mut pipeline, &mut req, &mut res).await;

        assert!(unhandled.is_none());
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        assert_eq!(*seen.lock().unwrap(), Some(418));
        assert!(matches!(pipeline.state(), State::Done));
        assert_eq!(res.payload().unwrap().as_ref(), b"handled");
    }

    #[tokio::test]
    async fn test_error_handlers_skipped_without_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_in_err = Arc::clone(&log);
        let mut pipeline = Pipeline::new(vec![
            Layer::Entry(MiddlewareEntry::error(error_handler_fn(move |_e, _req, _res| {
                log_in_err.lock().unwrap().push("error");
                Next::Continue
            }))),
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "a", || Next::Continue))),
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "b", || Next::End))),
        ]);
        let (mut req, mut res) = contexts("/");
        drive(&mut pipeline, &mut req, &mut res).await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_error_handler_continue_resumes_normal_entries() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_in_err = Arc::clone(&log);
        let mut pipeline = Pipeline::new(vec![
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "fail", || {
                Next::Error(Exception::malformed("bad"))
            }))),
            Layer::Entry(MiddlewareEntry::error(error_handler_fn(move |_e, _req, _res| {
                log_in_err.lock().unwrap().push("recover");
                Next::Continue
            }))),
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "after", || Next::End))),
        ]);
        let (mut req, mut res) = contexts("/");
        assert!(drive(&mut pipeline, &mut req, &mut res).await.is_none());
        assert_eq!(*log.lock().unwrap(), vec!["fail", "recover", "after"]);
    }

    #[tokio::test]
    async fn test_unhandled_error_surfaces() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new(vec![
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "boom", || {
                Next::Error(Exception::handler(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "boom",
                )))
            }))),
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "never", || Next::End))),
        ]);
        let (mut req, mut res) = contexts("/");
        let err = drive(&mut pipeline, &mut req, &mut res).await.unwrap();
        assert_eq!(err.status_code(), 500);
        assert_eq!(*log.lock().unwrap(), vec!["boom"]);
    }

    #[tokio::test]
    async fn test_overlapping_prefixes_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new(vec![
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "api/v1", || Next::Continue)).at("/api/v1")),
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "api", || Next::Continue)).at("/api")),
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "admin", || Next::Continue)).at("/admin")),
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "global", || Next::End))),
        ]);
        let (mut req, mut res) = contexts("/api/v1/users?x=1");
        drive(&mut pipeline, &mut req, &mut res).await;
        assert_eq!(*log.lock().unwrap(), vec!["api/v1", "api", "global"]);
    }

    #[tokio::test]
    async fn test_splice_after_router_slot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new(vec![
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "before", || Next::Continue))),
            Layer::Router,
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "tail", || Next::End))),
        ]);
        let (mut req, mut res) = contexts("/");
        loop {
            let next = match pipeline.next_step(req.path()) {
                Step::Run(h) => h.call(&mut req, &mut res).await,
                Step::Route => {
                    pipeline.splice(vec![
                        recorder(&log, "route-1", || Next::Continue),
                        recorder(&log, "route-2", || Next::Continue),
                    ]);
                    Next::Continue
                }
                _ => break,
            };
            pipeline.complete(next);
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before", "route-1", "route-2", "tail"]
        );
    }

    #[tokio::test]
    async fn test_after_hooks_not_run_inline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new(vec![
            Layer::Entry(MiddlewareEntry::after(recorder(&log, "after", || Next::Continue))),
            Layer::Entry(MiddlewareEntry::after(recorder(&log, "scoped", || Next::Continue)).at("/other")),
            Layer::Entry(MiddlewareEntry::normal(recorder(&log, "main", || Next::End))),
        ]);
        let (mut req, mut res) = contexts("/page");
        drive(&mut pipeline, &mut req, &mut res).await;
        assert_eq!(*log.lock().unwrap(), vec!["main"]);
        assert_eq!(pipeline.after_hooks("/page").len(), 1);
    }

    #[tokio::test]
    async fn test_async_handler_fn() {
        let handler = async_handler_fn(|req, res| {
            Box::pin(async move {
                let path = req.path().to_string();
                tokio::task::yield_now().await;
                Next::finish(res.text(path))
            })
        });
        let (mut req, mut res) = contexts("/async");
        assert!(matches!(handler.call(&mut req, &mut res).await, Next::End));
        assert_eq!(res.payload().unwrap().as_ref(), b"/async");
    }
}
