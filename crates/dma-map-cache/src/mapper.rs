//! 缓存与外部协作方之间的两个注入点：地址解析原语与缓冲销毁回调。

use core::fmt;

use crate::{
    error::MapError,
    types::{AddressRange, BufferId, DmaDirection},
};

/// `DmaMapper` 描述缓存所依赖的地址解析 / 拆除原语。
///
/// # 设计初衷（Why）
/// - 真正的 IOMMU 页表操作与平台强相关且可能非常慢；缓存只负责“何时调用、调用几次”，
///   具体怎么映射由实现者决定；
/// - 通过关联类型让消费者标识与映射结果保持实现者自己的强类型，缓存对二者完全不透明。
///
/// # 使用方式（How）
/// - 实现者将自身注入 [`MapCache::new`](crate::MapCache::new)；
/// - `map` 只会在缓存未命中时调用，`unmap` 在映射引用计数归零时恰好调用一次。
///
/// # 契约定义（What）
/// - `Consumer`：按 `Eq` 比较，同一设备上下文必须得到相等的值；
/// - `Segments`：解析结果，会在命中路径上被克隆返回，建议使用廉价克隆的表示（如 `Arc<[Segment]>`）；
/// - **前置条件**：两个方法都可能被多个线程并发调用，缓存调用它们时不持有任何内部锁；
/// - **后置条件**：`unmap` 收到的 `segments` 与方向正是此前 `map` 为同一消费者返回的结果与请求方向。
pub trait DmaMapper: Send + Sync + 'static {
    /// 硬件侧消费者（例如设备上下文）。
    type Consumer: Clone + Eq + fmt::Debug + Send + Sync + 'static;
    /// 解析得到的地址段。
    type Segments: Clone + Send + Sync + 'static;

    /// 为 `consumer` 解析 `range`。
    fn map(
        &self,
        consumer: &Self::Consumer,
        range: AddressRange,
        direction: DmaDirection,
    ) -> Result<Self::Segments, MapError>;

    /// 撤销此前的一次 `map`。
    fn unmap(&self, consumer: &Self::Consumer, segments: &Self::Segments, direction: DmaDirection);
}

/// `FreeListener` 是缓冲所有者在缓冲销毁时回调缓存的入口。
///
/// # 设计初衷（Why）
/// - 缓冲的生命周期由外部分配子系统掌控，缓存无法感知缓冲何时被释放；
///   以 `Arc<dyn FreeListener>` 形式注入所有者，可在其释放路径上统一通知，而不必让所有者了解缓存的泛型参数。
///
/// # 契约定义（What）
/// - 所有者对每个缓冲恰好调用一次 `buffer_freed`，且不得与同一缓冲上的 acquire 并发；
/// - 实现不得 panic：该方法通常位于所有者的 `Drop` 路径。
pub trait FreeListener: Send + Sync + 'static {
    /// 通知缓冲 `id` 已被销毁。
    fn buffer_freed(&self, id: BufferId);
}
