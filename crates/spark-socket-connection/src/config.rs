use socket2::SockRef;
use std::{io, time::Duration};
use tokio::net::TcpStream as TokioTcpStream;

/// 单次读取使用的默认缓冲上限（16 KiB）。
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// TCP 套接字级配置项，仅作用于连接自行创建或接管的 `TcpStream`。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 `SO_LINGER`、`TCP_NODELAY` 这类内核选项显式配置化，调用方无需直接操作 `socket2`；
/// - 由任意 `AsyncRead`/`AsyncWrite` 构造的连接不是套接字，本配置对其不生效。
///
/// ## 契约（What）
/// - `with_linger`：`Some(dur)` 表示关闭时最多等待 `dur` 发送残留数据，超时后以 RST 释放；
/// - `with_nodelay`：是否关闭 Nagle 算法；
/// - **后置条件**：`apply` 返回 `Ok(())` 时选项已落地，失败时连接不会被创建。
///
/// ## 注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上按秒取整，设置过小可能导致写半关闭前的数据被丢弃。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
}

impl TcpSocketConfig {
    /// 创建默认配置：沿用内核 linger 策略，保留 Nagle 算法。
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: false,
        }
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// 设置 `TCP_NODELAY`。
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub(crate) fn apply(&self, stream: &TokioTcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        if self.linger.is_some() {
            sock.set_linger(self.linger)?;
        }
        sock.set_tcp_nodelay(self.nodelay)
    }
}

/// 连接级配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读取不携带调用方指定的长度，必须由实现给出有界的单次读取上限，避免无界内存占用；
/// - 将套接字选项与连接选项聚合在同一个值对象中，便于 Builder 一次性传递。
///
/// ## 契约（What）
/// - `read_buffer_size`：一次读取最多交付的字节数，默认 [`DEFAULT_READ_BUFFER_SIZE`]，
///   传入 0 时按 1 处理；
/// - `socket`：见 [`TcpSocketConfig`]。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    read_buffer_size: usize,
    socket: TcpSocketConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionConfig {
    pub const fn new() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            socket: TcpSocketConfig::new(),
        }
    }

    /// 设置单次读取上限。
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// 覆盖套接字配置。
    pub fn with_socket_config(mut self, socket: TcpSocketConfig) -> Self {
        self.socket = socket;
        self
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    pub fn socket(&self) -> &TcpSocketConfig {
        &self.socket
    }
}
