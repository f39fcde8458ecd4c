// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 连接处理
//!
//! 接受 TCP 连接，为每个连接创建一个 tokio 任务：读取并解析请求头，
//! 把读半部包装为请求体流，交给 [`Application`] 处理，最后关闭连接。
//! 每个连接只处理一个请求。

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::{
    app::Application,
    body::IncomingBody,
    exception::Exception,
    param::MAX_HEAD_SIZE,
    request::{RequestHead, Transport},
    response::ResponseContext,
};

/// 每次从 socket 读取的字节数
const READ_SIZE: usize = 8 * 1024;

/// 接受连接直到 `shutdown` 完成
pub async fn serve<F>(app: Arc<Application>, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()>,
{
    let active = Arc::new(AtomicUsize::new(0));
    let mut id: u128 = 0;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("接受连接失败：{}", e);
                        continue;
                    }
                };
                debug!("[ID{}]TCP连接已建立：{}", id, addr);

                let app = Arc::clone(&app);
                let active = Arc::clone(&active);
                let conn_id = id;
                tokio::spawn(async move {
                    active.fetch_add(1, Ordering::SeqCst);
                    let transport = Transport {
                        peer: Some(addr),
                        secure: false,
                    };
                    handle_connection(&app, stream, conn_id, transport).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                });
                id += 1;
            }
            _ = &mut shutdown => {
                info!(
                    "收到停机信号，停止接受新连接，当前活跃连接数：{}",
                    active.load(Ordering::SeqCst)
                );
                break;
            }
        }
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// 处理一个连接上的一个请求
pub async fn handle_connection<S>(app: &Application, stream: S, id: u128, transport: Transport)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let start_time = Instant::now();
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut buffer = BytesMut::with_capacity(READ_SIZE);
    let head_end = loop {
        if let Some(end) = find_head_end(&buffer) {
            break end;
        }
        if buffer.len() > MAX_HEAD_SIZE {
            warn!("[ID{}]请求头超过{}字节，返回431", id, MAX_HEAD_SIZE);
            reject(&mut writer, id, &Exception::HeaderTooLarge).await;
            return;
        }
        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                if !buffer.is_empty() {
                    warn!("[ID{}]客户端在请求头传输完成前断开", id);
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("[ID{}]读取TCPStream时遇到错误: {}", id, e);
                return;
            }
        }
    };
    if head_end + 4 > MAX_HEAD_SIZE {
        warn!("[ID{}]请求头超过{}字节，返回431", id, MAX_HEAD_SIZE);
        reject(&mut writer, id, &Exception::HeaderTooLarge).await;
        return;
    }

    let head_bytes = buffer.split_to(head_end + 4);
    let leftover: Bytes = buffer.freeze();

    let head = match RequestHead::try_from(&head_bytes, id) {
        Ok(head) => head,
        Err(e) => {
            reject(&mut writer, id, &e).await;
            return;
        }
    };
    debug!("[ID{}]成功解析HTTP请求头", id);

    if head.content_length().is_some() || head.is_chunked() {
        let expects_continue = head
            .header("Expect")
            .map_or(false, |v| v.eq_ignore_ascii_case("100-continue"));
        if expects_continue {
            if let Err(e) = writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await {
                error!("[ID{}]发送100 Continue失败：{}", id, e);
                return;
            }
        }
    }

    let body = if head.is_chunked() {
        IncomingBody::chunked(reader, leftover, READ_SIZE)
    } else {
        let length = head.content_length().unwrap_or(0);
        IncomingBody::with_length(reader, leftover, length, READ_SIZE)
    };

    let mut req = app
        .request_context(id, head, transport)
        .with_stream(Box::new(body));
    let mut res = ResponseContext::new(id);

    if let Err(e) = app.handle(&mut req, &mut res, &mut writer).await {
        error!("[ID{}]写入响应失败：{}", id, e);
        return;
    }
    if let Err(e) = writer.shutdown().await {
        debug!("[ID{}]关闭连接时出错：{}", id, e);
    }
    debug!(
        "[ID{}]连接处理完成，用时{}ms",
        id,
        start_time.elapsed().as_millis()
    );
}

/// 请求头无法解析时直接回应错误并关闭连接
async fn reject<W>(writer: &mut W, id: u128, err: &Exception)
where
    W: AsyncWrite + Unpin,
{
    let mut res = ResponseContext::new(id);
    let bytes = match res.reset_for_error(err).and_then(|_| res.flush()) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("[ID{}]无法生成错误响应：{}", id, e);
            return;
        }
    };
    info!("[ID{}]请求被拒绝：{}，返回{}", id, err, err.status_code());
    if let Err(e) = writer.write_all(&bytes).await {
        error!("[ID{}]写入错误响应失败：{}", id, e);
        return;
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(14));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
    }
}
