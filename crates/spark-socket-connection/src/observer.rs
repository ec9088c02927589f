use crate::connection::SocketConnection;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// 连接半关闭事件的观察者。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让上层在读/写方向的句柄真正释放后得到通知，例如据此回收会话或结束转发；
/// - 两个方法都有默认空实现，观察者只需关心自己感兴趣的方向。
///
/// ## 契约 (What)
/// - 每个方法对同一连接至多调用一次，且总在连接的串行队列上执行；
/// - 连接只持有观察者的弱引用：观察者被释放后通知静默停止，不会出错。
pub trait SocketConnectionObserver: Send + Sync {
    /// 读方向的句柄已释放。
    fn read_closed(&self, connection: &SocketConnection) {
        let _ = connection;
    }

    /// 写方向的句柄已释放（写端已完成关闭）。
    fn write_closed(&self, connection: &SocketConnection) {
        let _ = connection;
    }
}

#[derive(Default)]
pub(crate) struct ObserverSlot {
    observer: Mutex<Option<Weak<dyn SocketConnectionObserver>>>,
}

impl ObserverSlot {
    pub(crate) fn set(&self, observer: Weak<dyn SocketConnectionObserver>) {
        *self.observer.lock() = Some(observer);
    }

    pub(crate) fn clear(&self) {
        self.observer.lock().take();
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn SocketConnectionObserver>> {
        self.observer.lock().as_ref().and_then(Weak::upgrade)
    }
}
