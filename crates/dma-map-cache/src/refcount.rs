//! 记录与映射共用的原子引用计数。
//!
//! 归零即死亡：计数一旦到 0 就不会再被 [`RefCount::try_get`] 复活，
//! 这样注册表中的“死记录”可以被安全替换而不必与释放者加锁协调。

#[cfg(loom)]
use loom::sync::atomic::{AtomicUsize, Ordering};

#[cfg(not(loom))]
use core::sync::atomic::{AtomicUsize, Ordering};

/// 释放时计数已不足，说明调用方的 acquire/release 没有配对。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Underflow {
    pub(crate) current: usize,
    pub(crate) requested: usize,
}

#[derive(Debug)]
pub(crate) struct RefCount(AtomicUsize);

impl RefCount {
    pub(crate) fn new(initial: usize) -> Self {
        Self(AtomicUsize::new(initial))
    }

    /// 无条件加一。
    ///
    /// 调用方必须已持有一个引用，或持有能阻止计数归零的锁。
    pub(crate) fn get(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// 仅在计数仍大于 0 时加一。
    pub(crate) fn try_get(&self) -> bool {
        self.0
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |current| {
                (current > 0).then(|| current + 1)
            })
            .is_ok()
    }

    /// 归还 `units` 个引用，返回剩余计数。
    pub(crate) fn put(&self, units: usize) -> Result<usize, Underflow> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(units)
            })
            .map(|previous| previous - units)
            .map_err(|current| Underflow {
                current,
                requested: units,
            })
    }

    /// 一次性取走全部剩余引用并归零，返回取走的数量。
    pub(crate) fn take(&self) -> usize {
        self.0.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn load(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}
