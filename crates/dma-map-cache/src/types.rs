//! # types 模块说明
//!
//! ## 角色定位（Why）
//! - 汇总缓存对外暴露的值类型：缓冲标识、访问方向、地址区间与映射策略；
//! - 这些类型均为 `Copy`，可以在锁外自由传递，避免在热路径上引入额外分配。
//!
//! ## 契约（What）
//! - [`BufferId`] 由外部缓冲所有者分配，缓存只要求其全序且在缓冲存活期间唯一；
//! - [`MapPolicy`] 是缓存唯一关心的映射属性，其余映射参数全部交给 [`DmaMapper`](crate::DmaMapper)。

use core::fmt;

/// 缓冲的不透明身份标识。
///
/// # 教案式说明
/// - **意图 (Why)**：缓存只需要“同一缓冲得到同一键”，不关心标识背后是指针还是句柄；
/// - **契约 (What)**：同一时刻存活的缓冲之间标识唯一；缓冲释放后标识可被复用，
///   复用时缓存保证走全新的创建路径；
/// - **权衡 (Trade-offs)**：固定为 `u64`，足以容纳指针宽度的值，同时保持 `Hash + Ord` 便于作为索引键。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u64);

impl BufferId {
    /// 由原始整数构造标识。
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 返回原始整数值。
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for BufferId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{:#x}", self.0)
    }
}

/// 设备访问缓冲的方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// 设备只读（CPU → 设备）。
    ToDevice,
    /// 设备只写（设备 → CPU）。
    FromDevice,
    /// 双向访问。
    Bidirectional,
}

/// 交给解析原语的地址区间。
///
/// - **契约 (What)**：`start` 为缓冲起始地址，`len` 为字节长度；缓存本身从不解引用该区间。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddressRange {
    /// 起始地址。
    pub start: u64,
    /// 字节长度。
    pub len: u64,
}

impl AddressRange {
    /// 以起始地址与字节长度构造区间。
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// 区间末端（不含），溢出时饱和到 `u64::MAX`。
    pub const fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// 调用方描述的一块缓冲：身份 + 地址区间。
///
/// # 教案式说明
/// - **意图 (Why)**：缓存命中时只需要身份；未命中时解析原语还需要地址区间，二者打包传递可以避免调用方
///   在两条路径上准备不同参数；
/// - **契约 (What)**：同一 `id` 在其存活期内应始终对应同一区间，缓存不会校验这一点。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DmaBuffer {
    id: BufferId,
    range: AddressRange,
}

impl DmaBuffer {
    /// 由所有者分配的标识与缓冲的地址区间构造描述。
    pub const fn new(id: BufferId, range: AddressRange) -> Self {
        Self { id, range }
    }

    /// 缓冲标识，是缓存索引的键。
    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// 缓冲地址区间，仅在未命中时交给解析原语。
    pub const fn range(&self) -> AddressRange {
        self.range
    }
}

/// 映射拆除策略。
///
/// # 教案式说明
/// - **意图 (Why)**：同一缓冲常在很短时间内被同一设备反复映射；`Deferred` 策略为新建的记录与映射
///   预留一个额外引用，使“最后一次 release”不会立即触发拆除，从而省掉一轮解析/拆除；
/// - **契约 (What)**：
///   - `Deferred`：新记录/新映射的引用计数初值为 2，额外的一份由
///     [`MapCache::release_all_for_consumer`](crate::MapCache::release_all_for_consumer) 或
///     [`MapCache::notify_buffer_freed`](crate::MapCache::notify_buffer_freed) 归还；
///   - `Eager`：初值为 1，最后一次 release 立刻拆除；
/// - **权衡 (Trade-offs)**：`Deferred` 让硬件映射多存活一个周期，换取复用时零解析成本。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MapPolicy {
    #[default]
    Deferred,
    Eager,
}

impl MapPolicy {
    /// 新建记录或映射时的引用计数初值。
    pub const fn initial_refcount(self) -> usize {
        match self {
            MapPolicy::Deferred => 2,
            MapPolicy::Eager => 1,
        }
    }
}
