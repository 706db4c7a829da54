//! 集成测试共享的映射器与缓冲所有者替身。
//!
//! # 结构安排（How）
//! - `RecordingMapper`：记录每次解析 / 拆除调用，可注入若干次“资源枯竭”或永久故障，
//!   也可在解析中途阻塞，用于构造并发窗口；
//! - `FakeAllocator`：模拟缓冲所有者，持有 `Arc<dyn FreeListener>`，在缓冲销毁时回调缓存。

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dma_map_cache::{
    AddressRange, BufferId, DmaBuffer, DmaDirection, DmaMapper, FreeListener, MapError,
};
use parking_lot::Mutex;

/// 设备上下文标识。
pub type Device = u32;

/// 一次解析结果：IOVA 与长度。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Iova {
    pub addr: u64,
    pub len: u64,
}

#[derive(Default)]
pub struct RecordingMapper {
    next_iova: AtomicU64,
    map_calls: AtomicUsize,
    unmap_calls: AtomicUsize,
    transient_failures: AtomicUsize,
    fault: Mutex<Option<String>>,
    resolve_delay: Mutex<Option<Duration>>,
    live: Mutex<HashMap<(Device, Iova), DmaDirection>>,
}

impl RecordingMapper {
    pub fn new() -> Self {
        Self {
            next_iova: AtomicU64::new(0x1000_0000),
            ..Self::default()
        }
    }

    /// 接下来 `count` 次解析报告资源枯竭。
    pub fn fail_transiently(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// 之后的解析全部报告永久故障，传入 `None` 取消。
    pub fn set_fault(&self, detail: Option<&str>) {
        *self.fault.lock() = detail.map(str::to_owned);
    }

    /// 每次解析前休眠，放大并发窗口。
    pub fn set_resolve_delay(&self, delay: Option<Duration>) {
        *self.resolve_delay.lock() = delay;
    }

    pub fn map_calls(&self) -> usize {
        self.map_calls.load(Ordering::SeqCst)
    }

    pub fn unmap_calls(&self) -> usize {
        self.unmap_calls.load(Ordering::SeqCst)
    }

    /// 自旋等待解析调用次数达到 `count`；配合解析延迟，可在解析进行中插入其他操作。
    pub fn wait_for_map_calls(&self, count: usize) {
        while self.map_calls() < count {
            std::thread::yield_now();
        }
    }

    /// 仍未拆除的硬件映射数。
    pub fn live_mappings(&self) -> usize {
        self.live.lock().len()
    }
}

impl DmaMapper for RecordingMapper {
    type Consumer = Device;
    type Segments = Iova;

    fn map(
        &self,
        consumer: &Device,
        range: AddressRange,
        direction: DmaDirection,
    ) -> Result<Iova, MapError> {
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = *self.resolve_delay.lock() {
            std::thread::sleep(delay);
        }
        let remaining_failures = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining_failures.is_ok() {
            return Err(MapError::Exhausted);
        }
        if let Some(detail) = self.fault.lock().clone() {
            return Err(MapError::fault(detail));
        }

        let iova = Iova {
            addr: self.next_iova.fetch_add(range.len.max(1), Ordering::SeqCst),
            len: range.len,
        };
        let previous = self.live.lock().insert((*consumer, iova), direction);
        assert!(previous.is_none(), "IOVA 不应被重复分配");
        Ok(iova)
    }

    fn unmap(&self, consumer: &Device, segments: &Iova, direction: DmaDirection) {
        self.unmap_calls.fetch_add(1, Ordering::SeqCst);
        let mapped = self.live.lock().remove(&(*consumer, *segments));
        assert_eq!(mapped, Some(direction), "拆除的映射必须由同一消费者以同一方向建立");
    }
}

/// 构造 4 KiB 的测试缓冲。
pub fn buffer(raw: u64) -> DmaBuffer {
    DmaBuffer::new(BufferId::new(raw), AddressRange::new(raw << 12, 4096))
}

/// 模拟缓冲所有者：释放缓冲时回调缓存。
pub struct FakeAllocator {
    listener: Arc<dyn FreeListener>,
}

impl FakeAllocator {
    pub fn new(listener: Arc<dyn FreeListener>) -> Self {
        Self { listener }
    }

    pub fn free(&self, buffer: &DmaBuffer) {
        self.listener.buffer_freed(buffer.id());
    }
}
