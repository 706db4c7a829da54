//! `dma-map-cache` 以 (缓冲, 消费者) 为粒度缓存 DMA/IOMMU 地址映射。
//!
//! # 模块定位（Why）
//! - 地址解析（建立 IOMMU 页表映射）代价高昂且与硬件相关；同一缓冲被同一设备反复使用时，
//!   只应解析一次，并在没有任何使用者之后恰好拆除一次；
//! - 缓冲本身的分配与销毁由外部所有者负责，本 crate 只维护映射的生命周期。
//!
//! # 设计概要（How）
//! - `registry` 模块以 `DashMap` 维护 `BufferId → BufferRecord` 的全局索引；
//! - `record` 模块实现每个缓冲的映射集合与原子引用计数，命中路径只需共享锁 + 原子自增；
//! - `cache` 模块组合出对外的四个操作：acquire、release、按消费者批量释放、缓冲销毁通知；
//! - 解析 / 拆除原语通过 [`DmaMapper`] 注入，缓存调用它们时从不持有任何锁。
//!
//! # 命名约定（Consistency）
//! - “记录”（record）指单个缓冲的追踪对象，“映射”（mapping）指其中某个消费者的解析结果；
//! - `Deferred` / `Eager` 对应“延迟拆除 / 立即拆除”两种计数初值策略。

mod cache;
mod config;
mod error;
mod mapper;
mod record;
mod refcount;
mod registry;
mod types;

pub use cache::{CacheStats, MapCache};
pub use config::CacheConfig;
pub use error::{CacheError, ConfigError, MapError};
pub use mapper::{DmaMapper, FreeListener};
pub use types::{AddressRange, BufferId, DmaBuffer, DmaDirection, MapPolicy};
