use crate::error::ConnectionError;
use std::{
    borrow::Cow,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct SerialQueueInner {
    label: Cow<'static, str>,
    jobs: mpsc::UnboundedSender<Job>,
    runtime: Handle,
}

/// 串行执行队列：连接的全部完成回调与观察者通知都在这里执行。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为连接提供“先进先出 + 互斥”的单一逻辑执行上下文，使回调按提交顺序依次交付，
///   且永远不会与同一队列上的其他回调并发；
/// - 回调从不在 `read_data`/`write_data` 调用栈内联执行，调用方可以在回调里继续排队
///   新操作而不必担心重入。
///
/// ## 逻辑 (How)
/// - 内部持有一个无界 `mpsc` 发送端，后台 Tokio 任务按序取出并同步执行任务；
/// - 任务 panic 时以 `catch_unwind` 捕获并记录，不影响后续任务；
/// - 句柄可克隆，多个连接可以共享同一队列；最后一个克隆被释放后，后台任务在执行完
///   已入队任务后退出。
///
/// ## 契约 (What)
/// - `dispatch`：入队一个任务，队列已停止时返回 `false`；
/// - `flush`：等待在其之前入队的所有任务执行完毕；
/// - **前置条件**：任务不得阻塞线程，否则会拖慢同一队列上的所有连接。
///
/// ## 注意事项 (Trade-offs)
/// - 无界队列意味着生产速度远超执行速度时内存会增长；回调应保持轻量。
#[derive(Clone, Debug)]
pub struct SerialQueue {
    inner: Arc<SerialQueueInner>,
}

impl SerialQueue {
    /// 在当前 Tokio 运行时上创建队列。
    pub fn new(label: impl Into<Cow<'static, str>>) -> Result<Self, ConnectionError> {
        let handle = Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;
        Ok(Self::with_handle(label, &handle))
    }

    /// 在指定运行时上创建队列，适用于不在运行时线程内构造连接的场景。
    pub fn with_handle(label: impl Into<Cow<'static, str>>, runtime: &Handle) -> Self {
        let label = label.into();
        let (jobs, receiver) = mpsc::unbounded_channel();
        runtime.spawn(run_jobs(label.clone(), receiver));
        Self {
            inner: Arc::new(SerialQueueInner {
                label,
                jobs,
                runtime: runtime.clone(),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// 入队一个任务。
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.inner.jobs.send(Box::new(job)) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(queue = %self.inner.label, "serial queue stopped, job dropped");
                false
            }
        }
    }

    /// 等待此前入队的任务全部执行完毕。
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.dispatch(move || {
            let _ = done.send(());
        }) {
            let _ = wait.await;
        }
    }

    /// 在队列所属运行时上派生 I/O 驱动任务。
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.runtime.spawn(future)
    }
}

async fn run_jobs(label: Cow<'static, str>, mut receiver: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = receiver.recv().await {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(queue = %label, "serial queue job panicked");
        }
    }
    tracing::trace!(queue = %label, "serial queue drained and stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn runs_jobs_in_dispatch_order() {
        let queue = SerialQueue::new("fifo").expect("runtime is present");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for index in 0..32 {
            let seen = Arc::clone(&seen);
            assert!(queue.dispatch(move || seen.lock().push(index)));
        }
        queue.flush().await;
        assert_eq!(*seen.lock(), (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn dispatch_never_runs_inline() {
        let queue = SerialQueue::new("deferred").expect("runtime is present");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        queue.dispatch(move || flag.store(true, Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst), "任务不应在 dispatch 内联执行");
        queue.flush().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_queue() {
        let queue = SerialQueue::new("panics").expect("runtime is present");
        let ran = Arc::new(AtomicBool::new(false));
        queue.dispatch(|| panic!("job failure"));
        let flag = Arc::clone(&ran);
        queue.dispatch(move || flag.store(true, Ordering::SeqCst));
        queue.flush().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn new_without_runtime_is_reported() {
        assert!(matches!(
            SerialQueue::new("orphan"),
            Err(ConnectionError::NoRuntime)
        ));
    }

    #[test]
    fn with_handle_works_outside_runtime_threads() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .expect("build runtime");
        let queue = SerialQueue::with_handle("external", runtime.handle());
        assert_eq!(queue.label(), "external");
        let (tx, rx) = std::sync::mpsc::channel();
        queue.dispatch(move || tx.send(7).expect("receiver alive"));
        assert_eq!(rx.recv().expect("job ran"), 7);
    }
}
