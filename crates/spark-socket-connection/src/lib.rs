#![doc = r#"
# spark-socket-connection

## 设计动机（Why）
- **定位**：在原始双工字节流（TCP 套接字的读/写两半，或任意 `AsyncRead`/`AsyncWrite`
  组合）之上提供有序排队的读写操作与独立的半关闭语义。
- **架构角色**：位于传输实现与上层协议之间；分帧、解析、加密、连接池与重连策略都属于
  更上层，不在本 crate 中实现。
- **设计理念**：调用永不阻塞、回调永不内联；同一连接的所有回调在同一个串行队列上按提交
  顺序交付，从而消除重入与并发交付带来的竞态。

## 核心契约（What）
- [`SocketConnection::read_data`]：交付当前可用的字节（至少 1 字节、至多配置上限），
  `Ok(None)` 表示对端正常结束；
- [`SocketConnection::write_data`]：部分写入会从游标处续写，整块交付内核后才完成；
- [`SocketConnection::close_read`]/[`SocketConnection::close_write`]：先排空已排队操作，
  再释放该方向句柄并通知 [`SocketConnectionObserver`]；
- 传输错误使该方向的当前操作、排队操作与后续操作全部以同一错误失败，另一方向不受影响。

## 实现策略（How）
- **串行队列**：[`SerialQueue`] 以单个 Tokio 任务按 FIFO 执行回调；
- **排空循环**：每个方向一个驱动任务，仅在存在排队操作时读写底层流，就绪等待交给 Tokio；
- **状态机**：每个方向经历 `Idle → Draining → Closing → Closed`，外加正交的终态结果。

## 风险与考量（Trade-offs）
- 不提供超时；读方向关闭只等待已就绪的数据，尚无数据可满足的读取以关闭错误结束；
- 回调在串行队列所在的运行时线程上同步执行，必须保持轻量、不可阻塞。
"#]

mod config;
mod connection;
mod driver;
mod error;
mod observer;
mod queue;
mod state;

pub use config::{ConnectionConfig, DEFAULT_READ_BUFFER_SIZE, TcpSocketConfig};
pub use connection::{BoxedReader, BoxedWriter, Endpoint, SocketConnection, SocketConnectionBuilder};
pub use error::{ConnectionError, ErrorCategory};
pub use observer::SocketConnectionObserver;
pub use queue::SerialQueue;
pub use state::{Direction, DirectionState, ReadCompletion, WriteCompletion};
