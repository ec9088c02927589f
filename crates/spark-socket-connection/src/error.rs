//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为连接对外暴露的全部失败语义提供集中定义：误用、方向已关闭、底层传输失败；
//! - 同一次传输失败需要投递给该方向上所有排队中的操作，因此错误必须可廉价克隆。
//!
//! ## 设计要求（What）
//! - 所有变体派生 [`thiserror::Error`]，可直接参与 `?` 传播；
//! - 每个变体映射到稳定的点分错误码（`spark.socket.*`），与传输层 `OperationKind` 约定一致；
//! - 通过 [`ErrorCategory`] 给出是否值得由上层重试的提示，本层自身从不重试。

use crate::state::Direction;
use std::{io, sync::Arc};
use thiserror::Error;

pub(crate) const CLOSED_CODE: &str = "spark.socket.direction_closed";
pub(crate) const TRANSPORT_CODE: &str = "spark.socket.transport_failed";
pub(crate) const CONNECT_CODE: &str = "spark.socket.connect_failed";
pub(crate) const CONFIGURE_CODE: &str = "spark.socket.configure_failed";
pub(crate) const ALREADY_OPENED_CODE: &str = "spark.socket.already_opened";
pub(crate) const NO_RUNTIME_CODE: &str = "spark.socket.no_runtime";

/// 连接层统一错误类型。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“调用方误用”“方向已关闭”“传输失败”三类来源，
///   让上层据此决定是修复代码、停止发送还是重建连接。
/// - **契约 (What)**：
///   - 实现 `Clone + Send + Sync + 'static`，I/O 错误以 `Arc` 共享；
///   - 读取遇到对端正常关闭不是错误，而是 `Ok(None)`，不会出现在本枚举中。
/// - **设计权衡 (Trade-offs)**：共享 `Arc<io::Error>` 使所有失败操作看到同一个错误实例，
///   代价是无法再取得错误的所有权（`io::Error` 本身不可克隆）。
#[derive(Clone, Debug, Error)]
pub enum ConnectionError {
    /// 方向已进入关闭流程（或已关闭），新的操作被拒绝。
    #[error("{direction} direction of the connection is closed")]
    Closed { direction: Direction },

    /// 底层流在该方向上报告了错误，该方向后续所有操作都会收到同一错误。
    #[error("{direction} stream failed: {source}")]
    Transport {
        direction: Direction,
        #[source]
        source: Arc<io::Error>,
    },

    /// 基于主机名/端口构造的连接在 `open` 阶段建连失败，两个方向都会收到该错误。
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// 接管 `TcpStream` 时写入套接字选项失败。
    #[error("failed to apply socket options: {source}")]
    Configure {
        #[source]
        source: Arc<io::Error>,
    },

    /// 重复调用 `open`。
    #[error("connection has already been opened")]
    AlreadyOpened,

    /// 未显式提供串行队列，且当前线程不在 Tokio 运行时中，无法创建私有队列。
    #[error("no tokio runtime is available to host the serial queue")]
    NoRuntime,
}

/// 错误的粗粒度分类，供上层决定处置方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 调用方误用，属于编程错误。
    Misuse,
    /// 方向已关闭，重试同一连接没有意义。
    Closed,
    /// 传输失败，但在新连接上重试可能成功（对端复位、拒绝连接等）。
    Retryable,
    /// 传输失败且重试大概率无效（权限、协议不支持等）。
    NonRetryable,
}

impl ConnectionError {
    pub(crate) fn transport(direction: Direction, error: io::Error) -> Self {
        Self::Transport {
            direction,
            source: Arc::new(error),
        }
    }

    pub(crate) fn configure(error: io::Error) -> Self {
        Self::Configure {
            source: Arc::new(error),
        }
    }

    pub(crate) fn connect(endpoint: String, error: io::Error) -> Self {
        Self::Connect {
            endpoint,
            source: Arc::new(error),
        }
    }

    /// 稳定错误码，适合作为指标标签或日志检索键。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Closed { .. } => CLOSED_CODE,
            Self::Transport { .. } => TRANSPORT_CODE,
            Self::Connect { .. } => CONNECT_CODE,
            Self::Configure { .. } => CONFIGURE_CODE,
            Self::AlreadyOpened => ALREADY_OPENED_CODE,
            Self::NoRuntime => NO_RUNTIME_CODE,
        }
    }

    /// 底层 I/O 错误的种类（仅传输类错误有值）。
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Transport { source, .. }
            | Self::Connect { source, .. }
            | Self::Configure { source } => Some(source.kind()),
            _ => None,
        }
    }

    /// 是否为“方向已关闭”错误。
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// 根据错误来源与 I/O 错误种类给出分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AlreadyOpened | Self::NoRuntime => ErrorCategory::Misuse,
            Self::Closed { .. } => ErrorCategory::Closed,
            Self::Transport { source, .. }
            | Self::Connect { source, .. }
            | Self::Configure { source } => categorize_io_error(source),
        }
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::WriteZero => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}
