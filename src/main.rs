// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # webframe 示例服务器
//!
//! 载入配置、初始化日志、注册示例路由并启动监听循环。
//! 按下 Ctrl-C 后停止接受新连接。

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use tokio::{net::TcpListener, runtime::Builder};

use webframe::{
    app::conditional_get,
    body::Body,
    compression::Compression,
    config::Config,
    exception::Exception,
    parser::{BodyParser, ParserKind, ParserOptions},
    pipeline::{error_handler_fn, handler_fn, Next},
    server, Application,
};

/// 优先使用 YAML 配置文件，文件缺失时退回到控制台输出
fn init_logging() {
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(
                "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {m}{n}",
            )))
            .build();
        let config = log4rs::config::Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info));
        match config {
            Ok(config) => {
                if log4rs::init_config(config).is_ok() {
                    info!("无法读取日志配置文件（{}），使用控制台日志", e);
                }
            }
            Err(e) => eprintln!("无法初始化日志：{}", e),
        }
    }
}

fn build_app(config: &Config) -> Result<Application, Exception> {
    let mut app = Application::from_config(config);
    let limit = config.body_limit();

    app.use_middleware(Arc::new(BodyParser::new(
        ParserKind::Json,
        ParserOptions::for_kind(ParserKind::Json).limit(limit),
    )));
    app.use_middleware(Arc::new(BodyParser::new(
        ParserKind::Urlencoded,
        ParserOptions::for_kind(ParserKind::Urlencoded).limit(limit),
    )));
    app.use_middleware(Arc::new(BodyParser::new(
        ParserKind::Text,
        ParserOptions::for_kind(ParserKind::Text).limit(limit),
    )));

    app.get(
        "/",
        handler_fn(|_req, res| Next::finish(res.html("<h1>webframe</h1><p>It works.</p>"))),
    )?;
    app.get(
        "/hello/:name",
        handler_fn(|req, res| {
            let name = req.param("name").unwrap_or("world").to_string();
            Next::finish(res.text(format!("Hello, {}!", name)))
        }),
    )?;
    app.get(
        "/whoami",
        handler_fn(|req, res| {
            let info = serde_json::json!({
                "ip": req.ip(),
                "protocol": req.protocol(),
                "hostname": req.hostname(),
                "subdomains": req.subdomains(),
            });
            Next::finish(res.json(&info))
        }),
    )?;
    app.post(
        "/api/echo",
        handler_fn(|req, res| match req.body() {
            Some(Body::Json(value)) => {
                let value = value.clone();
                Next::finish(res.json(&value))
            }
            Some(Body::Form(pairs)) => {
                let map: serde_json::Map<String, serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect();
                Next::finish(res.json(&map))
            }
            Some(Body::Text(text)) => {
                let text = text.clone();
                Next::finish(res.text(text))
            }
            _ => Next::Error(Exception::with_status(400, "empty body")),
        }),
    )?;
    app.get(
        "/files/*path",
        handler_fn(|req, res| {
            let path = req.param("path").unwrap_or("").to_string();
            Next::finish(res.text(format!("requested file: {}", path)))
        }),
    )?;

    app.use_after(conditional_get());
    if config.compression().enabled() {
        app.use_after(Arc::new(Compression::new(config.compression())));
    }

    // /api 下的错误以 JSON 返回，其余交给默认错误页面
    app.use_error_at(
        "/api",
        error_handler_fn(|err, _req, res| {
            let body = serde_json::json!({ "error": err.to_string() });
            Next::finish(res.status(err.status_code()).and_then(|r| r.json(&body)))
        }),
    );

    Ok(app)
}

async fn run(config: Config) {
    let app = match build_app(&config) {
        Ok(app) => Arc::new(app),
        Err(e) => {
            error!("路由注册失败：{}", e);
            return;
        }
    };

    let port = config.port();
    let address = match config.local() {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    let socket = SocketAddrV4::new(address, port);
    let listener = match TcpListener::bind(socket).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("无法绑定端口：{}，错误：{}", port, e);
            return;
        }
    };
    info!("服务端在{}上监听Socket连接", socket);

    server::serve(app, listener, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("无法监听停机信号：{}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;
    info!("服务器已停止");
}

fn main() {
    init_logging();

    let config = Config::from_toml("config/development.toml");
    info!("配置文件已载入");

    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法创建异步运行时：{}", e);
            return;
        }
    };
    runtime.block_on(run(config));
}
