// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路由引擎
//!
//! 路由表是一棵以路径段为键的前缀树（trie）。每个节点包含：
//! - 静态子节点（精确匹配一个路径段）；
//! - 至多一个参数子节点（`:name`，匹配任意一个非空路径段）；
//! - 至多一个通配子节点（`*` 或 `*name`，匹配剩余的全部路径，可以为空）；
//! - 按注册顺序保存的、该节点上各方法对应的路由。
//!
//! ## 匹配规则
//! 1. 每一层优先尝试静态子节点，其次参数子节点，最后通配子节点；
//!    深层匹配失败时回溯到上一层尝试下一种子节点。
//! 2. 末尾斜杠不影响匹配（`/foo` 与 `/foo/` 等价），大小写敏感。
//! 3. 路径段在匹配前逐段进行百分号解码，因此 `%2F` 不会拆分路径段。
//! 4. 路径能匹配到带有路由的节点、但该节点上没有当前方法时，返回 405 而不是 404。

use std::collections::HashMap;

use log::debug;
use percent_encoding::percent_decode_str;

use crate::{exception::Exception, param::HttpRequestMethod};

/// 一条注册后不可变的路由
#[derive(Debug, Clone)]
pub struct Route<H> {
    method: HttpRequestMethod,
    pattern: String,
    param_names: Vec<String>,
    handlers: Vec<H>,
}

impl<H> Route<H> {
    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn handlers(&self) -> &[H] {
        &self.handlers
    }
}

/// `resolve` 成功时的结果
#[derive(Debug, Clone)]
pub struct Resolved<H> {
    pub handlers: Vec<H>,
    pub params: HashMap<String, String>,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Static(String),
    Param(String),
    Wildcard(String),
}

#[derive(Debug)]
struct Node<H> {
    statics: HashMap<String, Node<H>>,
    param: Option<Box<Node<H>>>,
    wildcard: Option<Box<Node<H>>>,
    routes: Vec<Route<H>>,
}

impl<H> Default for Node<H> {
    fn default() -> Self {
        Self {
            statics: HashMap::new(),
            param: None,
            wildcard: None,
            routes: Vec::new(),
        }
    }
}

impl<H> Node<H> {
    /// 查找方法对应的路由，HEAD 没有单独注册时回退到 GET
    fn route_for(&self, method: HttpRequestMethod) -> Option<&Route<H>> {
        self.routes
            .iter()
            .find(|r| r.method == method)
            .or_else(|| match method {
                HttpRequestMethod::Head => {
                    self.routes.iter().find(|r| r.method == HttpRequestMethod::Get)
                }
                _ => None,
            })
    }

    /// 该节点上允许的方法，按注册顺序；存在 GET 时附带 HEAD
    fn allowed(&self) -> Vec<HttpRequestMethod> {
        let mut methods = Vec::new();
        for route in &self.routes {
            if !methods.contains(&route.method) {
                methods.push(route.method);
            }
            if route.method == HttpRequestMethod::Get
                && !methods.contains(&HttpRequestMethod::Head)
            {
                methods.push(HttpRequestMethod::Head);
            }
        }
        methods
    }
}

/// 一次查找的中间状态。
///
/// 只借用路径片段，返回的路由借用路由表。
struct Search<'s> {
    method: HttpRequestMethod,
    segments: &'s [String],
    captures: Vec<String>,
    /// 路径匹配但方法不匹配的所有节点上允许的方法，去重
    allowed: Vec<HttpRequestMethod>,
    path_matched: bool,
}

impl<'s> Search<'s> {
    fn visit<'n, H>(&mut self, node: &'n Node<H>, index: usize) -> Option<&'n Route<H>> {
        if index == self.segments.len() {
            if let Some(route) = self.terminal(node) {
                return Some(route);
            }
            // 通配符可以匹配空的剩余路径
            if let Some(wildcard) = node.wildcard.as_deref() {
                self.captures.push(String::new());
                if let Some(route) = self.terminal(wildcard) {
                    return Some(route);
                }
                self.captures.pop();
            }
            return None;
        }

        let segment = &self.segments[index];

        if let Some(child) = node.statics.get(segment) {
            if let Some(route) = self.visit(child, index + 1) {
                return Some(route);
            }
        }

        if let Some(child) = node.param.as_deref() {
            self.captures.push(segment.clone());
            if let Some(route) = self.visit(child, index + 1) {
                return Some(route);
            }
            self.captures.pop();
        }

        if let Some(wildcard) = node.wildcard.as_deref() {
            self.captures.push(self.segments[index..].join("/"));
            if let Some(route) = self.terminal(wildcard) {
                return Some(route);
            }
            self.captures.pop();
        }

        None
    }

    fn terminal<'n, H>(&mut self, node: &'n Node<H>) -> Option<&'n Route<H>> {
        if node.routes.is_empty() {
            return None;
        }
        match node.route_for(self.method) {
            Some(route) => Some(route),
            None => {
                self.path_matched = true;
                for method in node.allowed() {
                    if !self.allowed.contains(&method) {
                        self.allowed.push(method);
                    }
                }
                None
            }
        }
    }
}

/// 路由表：纯数据结构与匹配算法
#[derive(Debug)]
pub struct RouteTable<H> {
    root: Node<H>,
    len: usize,
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }
}

impl<H: Clone> RouteTable<H> {
    fn insert(&mut self, segments: Vec<Segment>, route: Route<H>) -> Result<(), Exception> {
        let mut node = &mut self.root;
        for segment in segments {
            node = match segment {
                Segment::Static(s) => node.statics.entry(s).or_default(),
                Segment::Param(_) => node.param.get_or_insert_with(Box::default),
                Segment::Wildcard(_) => node.wildcard.get_or_insert_with(Box::default),
            };
        }
        if node.routes.iter().any(|r| r.method == route.method) {
            return Err(Exception::DuplicateRoute {
                method: route.method,
                pattern: route.pattern,
            });
        }
        node.routes.push(route);
        self.len += 1;
        Ok(())
    }

    /// 方法不匹配时继续回溯，汇总所有路径匹配节点上允许的方法
    fn find(
        &self,
        method: HttpRequestMethod,
        segments: &[String],
    ) -> Result<(&Route<H>, Vec<String>), Option<Vec<HttpRequestMethod>>> {
        let mut search = Search {
            method,
            segments,
            captures: Vec::new(),
            allowed: Vec::new(),
            path_matched: false,
        };
        match search.visit(&self.root, 0) {
            Some(route) => Ok((route, search.captures)),
            None if search.path_matched => Err(Some(search.allowed)),
            None => Err(None),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// 路由引擎：负责模式规范化、注册与查找
#[derive(Debug)]
pub struct Router<H> {
    table: RouteTable<H>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self {
            table: RouteTable::default(),
        }
    }
}

impl<H: Clone> Router<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一条路由。相同方法与规范化模式重复注册时返回 `DuplicateRoute`。
    pub fn register(
        &mut self,
        method: HttpRequestMethod,
        pattern: &str,
        handlers: Vec<H>,
    ) -> Result<(), Exception> {
        let segments = parse_pattern(pattern)?;
        let param_names = segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param(name) | Segment::Wildcard(name) => Some(name.clone()),
                Segment::Static(_) => None,
            })
            .collect::<Vec<_>>();

        let mut seen = Vec::new();
        for name in &param_names {
            if seen.contains(name) {
                return Err(Exception::InvalidRoutePattern(format!(
                    "{}: parameter {} appears twice",
                    pattern, name
                )));
            }
            seen.push(name.clone());
        }

        let route = Route {
            method,
            pattern: pattern.to_string(),
            param_names,
            handlers,
        };
        self.table.insert(segments, route)?;
        debug!("注册路由：{} {}", method, pattern);
        Ok(())
    }

    /// 查找路由。`path` 可以带查询字符串，查询部分会被忽略。
    pub fn resolve(&self, method: HttpRequestMethod, path: &str) -> Result<Resolved<H>, Exception> {
        let path_only = path.split('?').next().unwrap_or("");
        let segments = split_path(path_only)?;

        match self.table.find(method, &segments) {
            Ok((route, captures)) => {
                let params = route
                    .param_names
                    .iter()
                    .cloned()
                    .zip(captures)
                    .collect::<HashMap<_, _>>();
                Ok(Resolved {
                    handlers: route.handlers.clone(),
                    params,
                    pattern: route.pattern.clone(),
                })
            }
            Err(Some(allowed)) => Err(Exception::MethodNotAllowed { allowed }),
            Err(None) => Err(Exception::RouteNotFound {
                method,
                path: path_only.to_string(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, Exception> {
    if !pattern.starts_with('/') {
        return Err(Exception::InvalidRoutePattern(format!(
            "{}: must start with '/'",
            pattern
        )));
    }
    let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (i, part) in raw.iter().enumerate() {
        let segment = if let Some(name) = part.strip_prefix(':') {
            if name.is_empty() {
                return Err(Exception::InvalidRoutePattern(format!(
                    "{}: parameter without a name",
                    pattern
                )));
            }
            Segment::Param(name.to_string())
        } else if let Some(name) = part.strip_prefix('*') {
            if i != raw.len() - 1 {
                return Err(Exception::InvalidRoutePattern(format!(
                    "{}: wildcard must be the last segment",
                    pattern
                )));
            }
            let name = if name.is_empty() { "*" } else { name };
            Segment::Wildcard(name.to_string())
        } else {
            let decoded = percent_decode_str(part).decode_utf8().map_err(|_| {
                Exception::InvalidRoutePattern(format!("{}: invalid percent-encoding", pattern))
            })?;
            Segment::Static(decoded.into_owned())
        };
        segments.push(segment);
    }
    Ok(segments)
}

/// 拆分请求路径并逐段解码
fn split_path(path: &str) -> Result<Vec<String>, Exception> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            percent_decode_str(s)
                .decode_utf8()
                .map(|d| d.into_owned())
                .map_err(|_| Exception::InvalidPath)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use HttpRequestMethod::*;

    fn router(routes: &[(HttpRequestMethod, &str, &'static str)]) -> Router<&'static str> {
        let mut router = Router::new();
        for (method, pattern, name) in routes {
            router.register(*method, pattern, vec![*name]).unwrap();
        }
        router
    }

    fn hit(router: &Router<&'static str>, method: HttpRequestMethod, path: &str) -> &'static str {
        router.resolve(method, path).unwrap().handlers[0]
    }

    #[test]
    fn test_param_binding() {
        let router = router(&[(Get, "/a/:id", "a")]);
        let resolved = router.resolve(Get, "/a/123").unwrap();
        assert_eq!(resolved.params.get("id").map(String::as_str), Some("123"));
        assert_eq!(resolved.pattern, "/a/:id");
    }

    #[test]
    fn test_duplicate_route() {
        let mut router = router(&[(Get, "/a/:id", "a")]);
        let err = router.register(Get, "/a/:other/", vec!["b"]).unwrap_err();
        assert!(matches!(err, Exception::DuplicateRoute { method: Get, .. }));
        // 不同方法可以共享同一模式
        router.register(Post, "/a/:id", vec!["c"]).unwrap();
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn test_static_beats_param_beats_wildcard() {
        let router = router(&[
            (Get, "/files/*", "wild"),
            (Get, "/files/:name", "param"),
            (Get, "/files/readme", "static"),
        ]);
        assert_eq!(hit(&router, Get, "/files/readme"), "static");
        assert_eq!(hit(&router, Get, "/files/other"), "param");
        assert_eq!(hit(&router, Get, "/files/a/b/c"), "wild");
    }

    #[test]
    fn test_backtracking_from_static_to_param() {
        let router = router(&[(Get, "/a/b/c", "static"), (Get, "/a/:x/d", "param")]);
        let resolved = router.resolve(Get, "/a/b/d").unwrap();
        assert_eq!(resolved.handlers[0], "param");
        assert_eq!(resolved.params.get("x").map(String::as_str), Some("b"));
    }

    #[test]
    fn test_wildcard_binds_tail() {
        let router = router(&[(Get, "/static/*path", "wild")]);
        let resolved = router.resolve(Get, "/static/css/site.css").unwrap();
        assert_eq!(
            resolved.params.get("path").map(String::as_str),
            Some("css/site.css")
        );
        let resolved = router.resolve(Get, "/static/").unwrap();
        assert_eq!(resolved.params.get("path").map(String::as_str), Some(""));
    }

    #[test]
    fn test_trailing_slash_insignificant() {
        let router = router(&[(Get, "/foo", "foo"), (Get, "/bar/", "bar")]);
        assert_eq!(hit(&router, Get, "/foo/"), "foo");
        assert_eq!(hit(&router, Get, "/bar"), "bar");
    }

    #[test]
    fn test_case_sensitive() {
        let router = router(&[(Get, "/Foo", "foo")]);
        assert!(matches!(
            router.resolve(Get, "/foo"),
            Err(Exception::RouteNotFound { .. })
        ));
    }

    #[test]
    fn test_percent_decoding_before_matching() {
        let router = router(&[(Get, "/hello world", "space"), (Get, "/p/:v", "param")]);
        assert_eq!(hit(&router, Get, "/hello%20world"), "space");
        let resolved = router.resolve(Get, "/p/a%2Fb").unwrap();
        assert_eq!(resolved.params.get("v").map(String::as_str), Some("a/b"));
    }

    #[test]
    fn test_invalid_percent_encoding() {
        let router = router(&[(Get, "/p/:v", "param")]);
        assert!(matches!(
            router.resolve(Get, "/p/%FF"),
            Err(Exception::InvalidPath)
        ));
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let router = router(&[(Post, "/users/:id", "create")]);
        match router.resolve(Get, "/users/42") {
            Err(Exception::MethodNotAllowed { allowed }) => assert_eq!(allowed, vec![Post]),
            other => panic!("expected 405, got {:?}", other.map(|r| r.pattern)),
        }
    }

    #[test]
    fn test_allow_merges_overlapping_branches() {
        let router = router(&[
            (Get, "/users/:id", "show"),
            (Post, "/users/new", "create"),
            (Delete, "/users/*rest", "purge"),
        ]);
        match router.resolve(Put, "/users/new") {
            Err(Exception::MethodNotAllowed { allowed }) => {
                assert_eq!(allowed, vec![Post, Get, Head, Delete])
            }
            other => panic!("expected 405, got {:?}", other.map(|r| r.pattern)),
        }
        // 静态分支方法不匹配时回溯到参数分支
        assert_eq!(hit(&router, Get, "/users/new"), "show");
    }

    #[test]
    fn test_not_found_distinct_from_405() {
        let router = router(&[(Post, "/users/:id", "create")]);
        assert!(matches!(
            router.resolve(Get, "/users/42/posts"),
            Err(Exception::RouteNotFound { .. })
        ));
    }

    #[test]
    fn test_head_falls_back_to_get() {
        let router = router(&[(Get, "/page", "page")]);
        assert_eq!(hit(&router, Head, "/page"), "page");
        match router.resolve(Post, "/page") {
            Err(Exception::MethodNotAllowed { allowed }) => assert_eq!(allowed, vec![Get, Head]),
            _ => panic!("expected 405"),
        }
    }

    #[test]
    fn test_query_string_ignored() {
        let router = router(&[(Get, "/search", "search")]);
        assert_eq!(hit(&router, Get, "/search?q=1"), "search");
    }

    #[test]
    fn test_root_route() {
        let router = router(&[(Get, "/", "root")]);
        assert_eq!(hit(&router, Get, "/"), "root");
        assert_eq!(hit(&router, Get, ""), "root");
    }

    #[test]
    fn test_invalid_patterns() {
        let mut router: Router<&str> = Router::new();
        assert!(matches!(
            router.register(Get, "/a/*/b", vec!["x"]),
            Err(Exception::InvalidRoutePattern(_))
        ));
        assert!(matches!(
            router.register(Get, "no-slash", vec!["x"]),
            Err(Exception::InvalidRoutePattern(_))
        ));
        assert!(matches!(
            router.register(Get, "/a/:", vec!["x"]),
            Err(Exception::InvalidRoutePattern(_))
        ));
        assert!(matches!(
            router.register(Get, "/a/:id/:id", vec!["x"]),
            Err(Exception::InvalidRoutePattern(_))
        ));
        assert!(router.is_empty());
    }

    proptest! {
        #[test]
        fn prop_static_routes_resolve_to_themselves(
            paths in proptest::collection::hash_set("[a-z]{1,6}(/[a-z0-9]{1,6}){0,3}", 1..20)
        ) {
            let mut router: Router<String> = Router::new();
            for p in &paths {
                router.register(Get, &format!("/{}", p), vec![p.clone()]).unwrap();
            }
            for p in &paths {
                let resolved = router.resolve(Get, &format!("/{}/", p)).unwrap();
                prop_assert_eq!(&resolved.handlers[0], p);
                prop_assert!(resolved.params.is_empty());
            }
        }

        #[test]
        fn prop_param_captures_segment(segment in "[A-Za-z0-9_.~-]{1,16}") {
            let mut router: Router<&str> = Router::new();
            router.register(Get, "/items/:id/detail", vec!["h"]).unwrap();
            let resolved = router.resolve(Get, &format!("/items/{}/detail", segment)).unwrap();
            prop_assert_eq!(resolved.params.get("id"), Some(&segment));
        }
    }
}
