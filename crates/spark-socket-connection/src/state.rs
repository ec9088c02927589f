//! 单个方向的操作队列与状态机。
//!
//! 每个方向维护 `Idle → Draining → Closing → Closed` 的生命周期，外加一个与之正交的
//! “终态结果”：读方向的正常结束（`Ok(None)`）或任一方向的传输失败。终态一旦写入，
//! 该方向上排队中与之后提交的操作都以它完成。

use crate::{error::ConnectionError, queue::SerialQueue};
use bytes::Bytes;
use std::{collections::VecDeque, fmt};

/// 连接的数据方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 入站。
    Read,
    /// 出站。
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// 方向的可观测状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectionState {
    /// 没有排队或执行中的操作。
    Idle,
    /// 存在排队或执行中的操作。
    Draining,
    /// 已请求关闭，正在排空剩余操作。
    Closing,
    /// 句柄已释放，方向不可再用。
    Closed,
}

/// 读取完成回调：`Ok(Some(bytes))` 为数据，`Ok(None)` 为对端正常结束。
pub type ReadCompletion = Box<dyn FnOnce(Result<Option<Bytes>, ConnectionError>) + Send + 'static>;

/// 写入完成回调。
pub type WriteCompletion = Box<dyn FnOnce(Result<(), ConnectionError>) + Send + 'static>;

/// 可排队操作的公共行为：结果类型及如何把结果投递到串行队列。
pub(crate) trait Operation: Send + 'static {
    type Output: Clone + Send + 'static;

    fn rejected(error: ConnectionError) -> Self::Output;

    fn complete(self, queue: &SerialQueue, output: Self::Output);
}

pub(crate) struct ReadOperation {
    completion: ReadCompletion,
}

impl ReadOperation {
    pub(crate) fn new(completion: ReadCompletion) -> Self {
        Self { completion }
    }
}

impl Operation for ReadOperation {
    type Output = Result<Option<Bytes>, ConnectionError>;

    fn rejected(error: ConnectionError) -> Self::Output {
        Err(error)
    }

    fn complete(self, queue: &SerialQueue, output: Self::Output) {
        let completion = self.completion;
        queue.dispatch(move || completion(output));
    }
}

/// 一次写请求：待发送缓冲、已交给内核的字节游标与完成回调。
pub(crate) struct WriteOperation {
    data: Bytes,
    cursor: usize,
    completion: WriteCompletion,
}

impl WriteOperation {
    pub(crate) fn new(data: Bytes, completion: WriteCompletion) -> Self {
        Self {
            data,
            cursor: 0,
            completion,
        }
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    pub(crate) fn advance(&mut self, written: usize) {
        self.cursor = (self.cursor + written).min(self.data.len());
    }

    pub(crate) fn is_flushed(&self) -> bool {
        self.cursor == self.data.len()
    }

    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }
}

impl Operation for WriteOperation {
    type Output = Result<(), ConnectionError>;

    fn rejected(error: ConnectionError) -> Self::Output {
        Err(error)
    }

    fn complete(self, queue: &SerialQueue, output: Self::Output) {
        let completion = self.completion;
        queue.dispatch(move || completion(output));
    }
}

/// 驱动任务下一步应做的事。
pub(crate) enum Next<Op> {
    /// 取出队首操作执行。
    Run(Op),
    /// 无事可做，等待唤醒。
    Wait,
    /// 已请求关闭且队列排空，释放句柄。
    Release,
}

/// 队列中的一项：待执行的操作，或关闭期间提交、轮到时以关闭错误完成的操作。
enum Queued<Op> {
    Live(Op),
    Rejected(Op),
}

/// 单个方向的排队状态。
///
/// 所有方法都在 `parking_lot::Mutex` 的短临界区内调用，且只做非阻塞的入队投递。
pub(crate) struct Side<Op: Operation> {
    direction: Direction,
    pending: VecDeque<Queued<Op>>,
    in_flight: bool,
    close_requested: bool,
    closed: bool,
    terminal: Option<Op::Output>,
}

impl<Op: Operation> Side<Op> {
    pub(crate) fn new(direction: Direction) -> Self {
        Self {
            direction,
            pending: VecDeque::new(),
            in_flight: false,
            close_requested: false,
            closed: false,
            terminal: None,
        }
    }

    pub(crate) fn state(&self) -> DirectionState {
        if self.closed {
            DirectionState::Closed
        } else if self.close_requested {
            DirectionState::Closing
        } else if self.in_flight || !self.pending.is_empty() {
            DirectionState::Draining
        } else {
            DirectionState::Idle
        }
    }

    /// 提交一个操作；返回 `true` 表示操作已入队，驱动任务需要被唤醒。
    ///
    /// 关闭中/已关闭的方向以关闭错误拒绝：若仍有更早的操作在排空，拒绝排在它们之后交付。
    /// 已有终态时直接以终态完成。所有结果都经由串行队列投递，绝不内联调用回调。
    pub(crate) fn submit(&mut self, op: Op, queue: &SerialQueue) -> bool {
        if self.close_requested || self.closed {
            if !self.closed && (self.in_flight || !self.pending.is_empty()) {
                self.pending.push_back(Queued::Rejected(op));
                return true;
            }
            op.complete(queue, Op::rejected(self.closed_error()));
            return false;
        }
        if let Some(terminal) = &self.terminal {
            op.complete(queue, terminal.clone());
            return false;
        }
        self.pending.push_back(Queued::Live(op));
        true
    }

    pub(crate) fn next(&mut self, queue: &SerialQueue) -> Next<Op> {
        if self.terminal.is_some() {
            self.drain_terminal(queue);
        } else {
            while let Some(entry) = self.pending.pop_front() {
                match entry {
                    Queued::Live(op) => {
                        self.in_flight = true;
                        return Next::Run(op);
                    }
                    Queued::Rejected(op) => {
                        op.complete(queue, Op::rejected(self.closed_error()));
                    }
                }
            }
        }
        if self.close_requested {
            Next::Release
        } else {
            Next::Wait
        }
    }

    pub(crate) fn finish_in_flight(&mut self) {
        self.in_flight = false;
    }

    /// 写入终态并以它完成所有排队中的操作（按提交顺序）。
    pub(crate) fn settle(&mut self, queue: &SerialQueue, terminal: Op::Output) {
        if self.terminal.is_none() {
            self.terminal = Some(terminal);
        }
        self.drain_terminal(queue);
    }

    fn drain_terminal(&mut self, queue: &SerialQueue) {
        let Some(terminal) = &self.terminal else {
            return;
        };
        let closed = ConnectionError::Closed {
            direction: self.direction,
        };
        while let Some(entry) = self.pending.pop_front() {
            match entry {
                Queued::Live(op) => op.complete(queue, terminal.clone()),
                Queued::Rejected(op) => op.complete(queue, Op::rejected(closed.clone())),
            }
        }
    }

    fn closed_error(&self) -> ConnectionError {
        ConnectionError::Closed {
            direction: self.direction,
        }
    }

    /// 关闭请求是否已发出（含已关闭）。
    pub(crate) fn is_closing(&self) -> bool {
        self.close_requested || self.closed
    }

    /// 请求关闭；重复请求返回 `false`。
    pub(crate) fn request_close(&mut self) -> bool {
        if self.close_requested || self.closed {
            return false;
        }
        self.close_requested = true;
        true
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
        self.in_flight = false;
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
