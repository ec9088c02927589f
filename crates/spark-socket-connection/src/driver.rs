//! 读/写两个方向的排空循环，以及基于端点的建连任务。
//!
//! 每个方向各有一个 Tokio 任务：它只在队列中存在操作时才触碰底层流，
//! 读写就绪由 `AsyncRead`/`AsyncWrite` 的唤醒机制驱动，没有忙轮询。
//! 结果统一经串行队列投递，驱动任务本身从不执行用户回调。

use crate::{
    connection::{BoxedReader, BoxedWriter, Endpoint, Shared, SocketConnection},
    error::ConnectionError,
    state::{Direction, Next, Operation},
};
use bytes::Bytes;
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream as TokioTcpStream,
};

/// 同时启动两个方向的驱动任务。
pub(crate) fn spawn_drivers(
    shared: &Arc<Shared>,
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
) {
    shared.queue.spawn(drive_reads(Arc::clone(shared), reader));
    shared.queue.spawn(drive_writes(Arc::clone(shared), writer));
}

/// 建立 TCP 连接后再启动两个方向的驱动；失败时两个方向都以建连错误进入终态。
pub(crate) async fn connect_and_drive(shared: Arc<Shared>, endpoint: Endpoint) {
    let connected = TokioTcpStream::connect((endpoint.host(), endpoint.port()))
        .await
        .and_then(|stream| {
            shared.config.socket().apply(&stream)?;
            Ok(stream)
        });
    match connected {
        Ok(stream) => {
            tracing::debug!(connection = shared.id, %endpoint, "connection established");
            let (reader, writer) = stream.into_split();
            spawn_drivers(&shared, Some(Box::new(reader)), Some(Box::new(writer)));
        }
        Err(err) => {
            tracing::warn!(connection = shared.id, %endpoint, error = %err, "connect failed");
            let error = ConnectionError::connect(endpoint.to_string(), err);
            shared.read.lock().settle(&shared.queue, Err(error.clone()));
            shared.write.lock().settle(&shared.queue, Err(error));
            spawn_drivers(&shared, None, None);
        }
    }
}

async fn drive_reads(shared: Arc<Shared>, mut reader: Option<BoxedReader>) {
    let mut buffer = vec![0u8; shared.config.read_buffer_size()];
    loop {
        let next = shared.read.lock().next(&shared.queue);
        let op = match next {
            Next::Run(op) => op,
            Next::Wait => {
                shared.read_wake.notified().await;
                continue;
            }
            Next::Release => break,
        };

        let Some(stream) = reader.as_mut() else {
            let mut side = shared.read.lock();
            side.finish_in_flight();
            op.complete(
                &shared.queue,
                Err(ConnectionError::Closed {
                    direction: Direction::Read,
                }),
            );
            continue;
        };

        // 关闭请求与读取竞争：`biased` 保证已就绪的数据优先交付，
        // 只有当前无数据可读时关闭才生效。
        let outcome = loop {
            let closing = shared.read.lock().is_closing();
            tokio::select! {
                biased;
                result = stream.read(&mut buffer) => match result {
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    other => break Some(other),
                },
                () = close_signal(&shared, closing) => {
                    if shared.read.lock().is_closing() {
                        break None;
                    }
                }
            }
        };

        let mut side = shared.read.lock();
        side.finish_in_flight();
        let Some(outcome) = outcome else {
            tracing::debug!(
                connection = shared.id,
                direction = %Direction::Read,
                pending = side.pending_len(),
                "close interrupted an unsatisfied read"
            );
            let closed = ConnectionError::Closed {
                direction: Direction::Read,
            };
            op.complete(&shared.queue, Err(closed.clone()));
            side.settle(&shared.queue, Err(closed));
            continue;
        };
        match outcome {
            Ok(0) => {
                tracing::debug!(
                    connection = shared.id,
                    direction = %Direction::Read,
                    "reached end of stream"
                );
                op.complete(&shared.queue, Ok(None));
                side.settle(&shared.queue, Ok(None));
            }
            Ok(read) => {
                tracing::trace!(
                    connection = shared.id,
                    direction = %Direction::Read,
                    bytes = read,
                    "read completed"
                );
                op.complete(
                    &shared.queue,
                    Ok(Some(Bytes::copy_from_slice(&buffer[..read]))),
                );
            }
            Err(err) => {
                tracing::warn!(
                    connection = shared.id,
                    direction = %Direction::Read,
                    error = %err,
                    "stream failed"
                );
                let error = ConnectionError::transport(Direction::Read, err);
                op.complete(&shared.queue, Err(error.clone()));
                side.settle(&shared.queue, Err(error));
            }
        }
    }

    drop(reader);
    shared.read.lock().mark_closed();
    tracing::debug!(connection = shared.id, direction = %Direction::Read, "handle released");
    announce_closed(&shared, Direction::Read);
}

async fn drive_writes(shared: Arc<Shared>, mut writer: Option<BoxedWriter>) {
    loop {
        let next = shared.write.lock().next(&shared.queue);
        let mut op = match next {
            Next::Run(op) => op,
            Next::Wait => {
                shared.write_wake.notified().await;
                continue;
            }
            Next::Release => break,
        };

        let Some(stream) = writer.as_mut() else {
            let mut side = shared.write.lock();
            side.finish_in_flight();
            op.complete(
                &shared.queue,
                Err(ConnectionError::Closed {
                    direction: Direction::Write,
                }),
            );
            continue;
        };

        // 每次 `write` 对应一次写就绪：只推进游标，部分写入从游标处续写。
        let outcome = loop {
            if op.is_flushed() {
                break stream.flush().await;
            }
            match stream.write(op.remaining()).await {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(written) => {
                    op.advance(written);
                    tracing::trace!(
                        connection = shared.id,
                        direction = %Direction::Write,
                        written,
                        cursor = op.cursor(),
                        len = op.len(),
                        "write progressed"
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Err(err),
            }
        };

        let mut side = shared.write.lock();
        side.finish_in_flight();
        match outcome {
            Ok(()) => op.complete(&shared.queue, Ok(())),
            Err(err) => {
                tracing::warn!(
                    connection = shared.id,
                    direction = %Direction::Write,
                    error = %err,
                    "stream failed"
                );
                let error = ConnectionError::transport(Direction::Write, err);
                op.complete(&shared.queue, Err(error.clone()));
                side.settle(&shared.queue, Err(error));
            }
        }
    }

    if let Some(mut stream) = writer.take() {
        if let Err(err) = stream.shutdown().await {
            tracing::debug!(
                connection = shared.id,
                direction = %Direction::Write,
                error = %err,
                "shutdown failed"
            );
        }
    }
    shared.write.lock().mark_closed();
    tracing::debug!(connection = shared.id, direction = %Direction::Write, "handle released");
    announce_closed(&shared, Direction::Write);
}

/// 读方向的关闭信号：已请求关闭时立即就绪，否则等待下一次唤醒。
async fn close_signal(shared: &Shared, closing: bool) {
    if !closing {
        shared.read_wake.notified().await;
    }
}

/// 在串行队列上通知观察者；连接句柄已全部释放时静默跳过。
fn announce_closed(shared: &Arc<Shared>, direction: Direction) {
    let owner = shared.owner.clone();
    shared.queue.dispatch(move || {
        let Some(connection) = SocketConnection::upgrade(&owner) else {
            return;
        };
        let Some(observer) = connection.observer() else {
            return;
        };
        match direction {
            Direction::Read => observer.read_closed(&connection),
            Direction::Write => observer.write_closed(&connection),
        }
    });
}
