pub mod app;
pub mod body;
pub mod cache;
pub mod compression;
pub mod config;
pub mod exception;
pub mod param;
pub mod parser;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod util;

pub use app::{conditional_get, Application};
pub use body::{Body, BodyStream, IncomingBody, MemoryBody};
pub use cache::CompressionCache;
pub use compression::{negotiate, should_compress, Compression};
pub use config::Config;
pub use exception::Exception;
pub use param::{HttpEncoding, HttpRequestMethod, HttpVersion};
pub use parser::{BodyParser, ParserKind, ParserOptions, TypeMatcher};
pub use pipeline::{
    async_handler_fn, error_handler_fn, handler_fn, ErrorHandler, Handler, IntoHandlers,
    MiddlewareEntry, MiddlewareFn, Next,
};
pub use request::{RequestContext, RequestHead, Transport};
pub use response::ResponseContext;
pub use router::Router;
pub use util::HtmlBuilder;
