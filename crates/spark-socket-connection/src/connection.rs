use crate::{
    config::{ConnectionConfig, TcpSocketConfig},
    driver::{connect_and_drive, spawn_drivers},
    error::ConnectionError,
    observer::{ObserverSlot, SocketConnectionObserver},
    queue::SerialQueue,
    state::{Direction, DirectionState, ReadOperation, Side, WriteOperation},
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream as TokioTcpStream,
    sync::{Notify, oneshot},
};

/// 读方向句柄：任意可读字节流。
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin + 'static>;

/// 写方向句柄：任意可写字节流。
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin + 'static>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 主机名 + 端口形式的远端地址，解析与建连推迟到 `open`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 尚未交给驱动任务的底层传输。
enum Transport {
    Streams {
        reader: BoxedReader,
        writer: BoxedWriter,
    },
    Endpoint(Endpoint),
}

/// 驱动任务与连接句柄共享的状态。
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) queue: SerialQueue,
    pub(crate) config: ConnectionConfig,
    pub(crate) read: Mutex<Side<ReadOperation>>,
    pub(crate) write: Mutex<Side<WriteOperation>>,
    pub(crate) read_wake: Notify,
    pub(crate) write_wake: Notify,
    pub(crate) observer: ObserverSlot,
    pub(crate) owner: Weak<Inner>,
}

pub(crate) struct Inner {
    shared: Arc<Shared>,
    transport: Mutex<Option<Transport>>,
}

impl Drop for Inner {
    /// 最后一个句柄释放时隐式半关闭两个方向：已排队的操作照常排空。
    /// 从未 `open` 的连接不会再有驱动任务，排队中的操作以关闭错误结束。
    fn drop(&mut self) {
        let shared = &self.shared;
        let unopened = self.transport.get_mut().is_some();
        {
            let mut read = shared.read.lock();
            if unopened {
                read.settle(
                    &shared.queue,
                    Err(ConnectionError::Closed {
                        direction: Direction::Read,
                    }),
                );
            }
            read.request_close();
        }
        {
            let mut write = shared.write.lock();
            if unopened {
                write.settle(
                    &shared.queue,
                    Err(ConnectionError::Closed {
                        direction: Direction::Write,
                    }),
                );
            }
            write.request_close();
        }
        shared.read_wake.notify_one();
        shared.write_wake.notify_one();
        tracing::debug!(connection = shared.id, "last connection handle dropped");
    }
}

/// 有序排队、可独立半关闭的双向字节流连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在原始双工流（如 TCP 套接字的读/写两半）之上提供“提交即返回、结果按序回调”的
///   读写接口，调用方无需自行管理就绪事件与部分写入；
/// - 读、写两个方向可以分别关闭，一个方向的关闭或失败不影响另一方向上的操作。
///
/// ## 逻辑 (How)
/// - 每个方向维护一个 FIFO 操作队列，由独立的 Tokio 驱动任务排空：读取时一次系统调用交付
///   当前可用的全部字节（不超过配置上限）；写入时按写就绪逐步推进游标直到整块交付内核；
/// - 完成回调与观察者通知全部投递到 [`SerialQueue`]，因此同一连接的回调不会并发、
///   不会在提交调用内联执行，且交付顺序与提交顺序一致；
/// - 传输错误写入该方向的终态：队首与所有排队操作依次收到同一错误，之后的操作也立即失败。
///
/// ## 契约 (What)
/// - `open`：启动驱动任务；重复调用返回 [`ConnectionError::AlreadyOpened`]；
/// - `read_data`：`Ok(Some(bytes))` 为数据、`Ok(None)` 为对端正常结束、`Err` 为失败；
/// - `write_data`：`Ok(())` 仅表示字节已交给内核，不代表对端已收到；
/// - `close_read`/`close_write`：排空已排队操作后释放句柄并通知观察者，至多一次；
///   重复关闭是无操作；
/// - 句柄可克隆；最后一个句柄释放时两个方向被隐式关闭。
///
/// ## 注意事项 (Trade-offs)
/// - 本层不提供超时；读方向请求关闭后，当前无数据可读的读取及其后排队的读取以关闭错误结束，
///   已就绪的数据仍会先行交付；
/// - 关闭中提交的新操作以关闭错误失败，但排在同方向仍在排空的旧操作之后交付。
#[derive(Clone)]
pub struct SocketConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketConnection")
            .field("id", &self.id())
            .field("queue", &self.inner.shared.queue.label())
            .field("read", &self.read_state())
            .field("write", &self.write_state())
            .field("opened", &self.is_opened())
            .finish()
    }
}

impl SocketConnection {
    pub fn builder() -> SocketConnectionBuilder {
        SocketConnectionBuilder::new()
    }

    /// 基于一对尚未被驱动的读/写流构造未打开的连接。
    pub fn from_streams<R, W>(
        reader: R,
        writer: W,
        queue: Option<SerialQueue>,
    ) -> Result<Self, ConnectionError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        SocketConnectionBuilder::new()
            .with_optional_queue(queue)
            .build_from_streams(reader, writer)
    }

    /// 接管一个已建立的 `TcpStream`，写入套接字选项后拆分为独立的读/写两半。
    pub fn from_tcp_stream(
        stream: TokioTcpStream,
        queue: Option<SerialQueue>,
    ) -> Result<Self, ConnectionError> {
        SocketConnectionBuilder::new()
            .with_optional_queue(queue)
            .build_from_tcp_stream(stream)
    }

    /// 构造绑定到 `host:port` 的未打开连接，建连在 `open` 时进行。
    pub fn connect_to(
        host: impl Into<String>,
        port: u16,
        queue: Option<SerialQueue>,
    ) -> Result<Self, ConnectionError> {
        SocketConnectionBuilder::new()
            .with_optional_queue(queue)
            .build_for_endpoint(Endpoint::new(host, port))
    }

    fn new(
        transport: Transport,
        queue: Option<SerialQueue>,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let queue = match queue {
            Some(queue) => queue,
            None => SerialQueue::new(format!("spark.socket.{id}"))?,
        };
        let inner = Arc::new_cyclic(|owner| Inner {
            shared: Arc::new(Shared {
                id,
                queue,
                config,
                read: Mutex::new(Side::new(Direction::Read)),
                write: Mutex::new(Side::new(Direction::Write)),
                read_wake: Notify::new(),
                write_wake: Notify::new(),
                observer: ObserverSlot::default(),
                owner: owner.clone(),
            }),
            transport: Mutex::new(Some(transport)),
        });
        Ok(Self { inner })
    }

    pub(crate) fn upgrade(owner: &Weak<Inner>) -> Option<Self> {
        owner.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn SocketConnectionObserver>> {
        self.inner.shared.observer.get()
    }

    /// 启动两个方向的驱动任务；端点形式的连接先在后台建连。
    pub fn open(&self) -> Result<(), ConnectionError> {
        let Some(transport) = self.inner.transport.lock().take() else {
            tracing::debug!(connection = self.id(), "open called twice");
            return Err(ConnectionError::AlreadyOpened);
        };
        let shared = &self.inner.shared;
        match transport {
            Transport::Streams { reader, writer } => {
                tracing::debug!(connection = shared.id, "opening connection over streams");
                spawn_drivers(shared, Some(reader), Some(writer));
            }
            Transport::Endpoint(endpoint) => {
                tracing::debug!(
                    connection = shared.id,
                    %endpoint,
                    "opening connection to endpoint"
                );
                shared
                    .queue
                    .spawn(connect_and_drive(Arc::clone(shared), endpoint));
            }
        }
        Ok(())
    }

    /// 请求关闭读方向。
    pub fn close_read(&self) {
        let shared = &self.inner.shared;
        let mut side = shared.read.lock();
        if side.request_close() {
            tracing::debug!(
                connection = shared.id,
                direction = %Direction::Read,
                pending = side.pending_len(),
                "close requested"
            );
            drop(side);
            shared.read_wake.notify_one();
        } else {
            tracing::debug!(
                connection = shared.id,
                direction = %Direction::Read,
                "already closing"
            );
        }
    }

    /// 请求关闭写方向；排队中的写入全部交付后执行写端关闭（TCP FIN）。
    pub fn close_write(&self) {
        let shared = &self.inner.shared;
        let mut side = shared.write.lock();
        if side.request_close() {
            tracing::debug!(
                connection = shared.id,
                direction = %Direction::Write,
                pending = side.pending_len(),
                "close requested"
            );
            drop(side);
            shared.write_wake.notify_one();
        } else {
            tracing::debug!(
                connection = shared.id,
                direction = %Direction::Write,
                "already closing"
            );
        }
    }

    /// 提交一次读取，结果经串行队列交付。
    pub fn read_data<F>(&self, completion: F)
    where
        F: FnOnce(Result<Option<Bytes>, ConnectionError>) + Send + 'static,
    {
        let shared = &self.inner.shared;
        let op = ReadOperation::new(Box::new(completion));
        if shared.read.lock().submit(op, &shared.queue) {
            shared.read_wake.notify_one();
        }
    }

    /// 提交一次写入，结果经串行队列交付。
    pub fn write_data<F>(&self, data: impl Into<Bytes>, completion: F)
    where
        F: FnOnce(Result<(), ConnectionError>) + Send + 'static,
    {
        let shared = &self.inner.shared;
        let op = WriteOperation::new(data.into(), Box::new(completion));
        if shared.write.lock().submit(op, &shared.queue) {
            shared.write_wake.notify_one();
        }
    }

    /// [`read_data`](Self::read_data) 的 `async` 形式。
    pub async fn read(&self) -> Result<Option<Bytes>, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.read_data(move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(ConnectionError::Closed {
            direction: Direction::Read,
        }))
    }

    /// [`write_data`](Self::write_data) 的 `async` 形式。
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.write_data(data, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(ConnectionError::Closed {
            direction: Direction::Write,
        }))
    }

    /// 设置观察者；连接只保存弱引用。
    pub fn set_observer<O>(&self, observer: &Arc<O>)
    where
        O: SocketConnectionObserver + 'static,
    {
        let weak = Arc::downgrade(observer);
        let weak: Weak<dyn SocketConnectionObserver> = weak;
        self.inner.shared.observer.set(weak);
    }

    pub fn clear_observer(&self) {
        self.inner.shared.observer.clear();
    }

    pub fn id(&self) -> u64 {
        self.inner.shared.id
    }

    pub fn read_state(&self) -> DirectionState {
        self.inner.shared.read.lock().state()
    }

    pub fn write_state(&self) -> DirectionState {
        self.inner.shared.write.lock().state()
    }

    pub fn is_opened(&self) -> bool {
        self.inner.transport.lock().is_none()
    }

    /// 连接使用的串行队列。
    pub fn queue(&self) -> &SerialQueue {
        &self.inner.shared.queue
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.shared.config
    }
}

/// [`SocketConnection`] 的建造器。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `with_queue`：共享外部串行队列；缺省时为每条连接创建私有队列（需处于 Tokio 运行时中）；
/// - `with_config`/`with_read_buffer_size`/`with_socket_config`：覆盖连接配置；
/// - `build_*`：消费 Builder，返回尚未打开的连接。
#[derive(Clone, Debug, Default)]
pub struct SocketConnectionBuilder {
    queue: Option<SerialQueue>,
    config: ConnectionConfig,
}

impl SocketConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: SerialQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    fn with_optional_queue(mut self, queue: Option<SerialQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.config = self.config.with_read_buffer_size(size);
        self
    }

    pub fn with_socket_config(mut self, socket: TcpSocketConfig) -> Self {
        self.config = self.config.with_socket_config(socket);
        self
    }

    pub fn build_from_streams<R, W>(self, reader: R, writer: W) -> Result<SocketConnection, ConnectionError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Transport::Streams {
            reader: Box::new(reader),
            writer: Box::new(writer),
        };
        SocketConnection::new(transport, self.queue, self.config)
    }

    pub fn build_from_tcp_stream(
        self,
        stream: TokioTcpStream,
    ) -> Result<SocketConnection, ConnectionError> {
        self.config
            .socket()
            .apply(&stream)
            .map_err(ConnectionError::configure)?;
        let (reader, writer) = stream.into_split();
        self.build_from_streams(reader, writer)
    }

    pub fn build_for_endpoint(self, endpoint: Endpoint) -> Result<SocketConnection, ConnectionError> {
        SocketConnection::new(Transport::Endpoint(endpoint), self.queue, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn repeated_open_and_close_are_logged_not_applied() {
        let connection =
            SocketConnection::from_streams(tokio::io::empty(), tokio::io::sink(), None)
                .expect("runtime is present");
        connection.open().expect("first open succeeds");
        assert!(matches!(connection.open(), Err(ConnectionError::AlreadyOpened)));
        assert!(logs_contain("open called twice"));

        connection.close_write();
        connection.close_write();
        assert!(logs_contain("already closing"));
        assert_eq!(connection.write_state(), DirectionState::Closing);
    }

    #[tokio::test]
    async fn builder_carries_configuration_and_queue() {
        let queue = SerialQueue::new("builder").expect("runtime is present");
        let connection = SocketConnection::builder()
            .with_queue(queue)
            .with_read_buffer_size(0)
            .build_for_endpoint(Endpoint::new("localhost", 7))
            .expect("queue is supplied");
        assert_eq!(connection.queue().label(), "builder");
        assert_eq!(connection.config().read_buffer_size(), 1);
        assert!(!connection.is_opened());

        let debug = format!("{connection:?}");
        assert!(debug.contains("builder"));
        assert!(debug.contains("Idle"));
    }

    #[test]
    fn endpoint_renders_as_host_and_port() {
        let endpoint = Endpoint::new("example.com", 443);
        assert_eq!(endpoint.to_string(), "example.com:443");
        assert_eq!(endpoint.host(), "example.com");
        assert_eq!(endpoint.port(), 443);
    }
}
