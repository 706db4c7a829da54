//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义缓存对调用方可见的错误语义；
//! - 锁、引用计数等内部不变量从不以错误形式外泄，调用方只会看到“资源枯竭 / 解析失败 / 批量释放冲突 / 配置非法”四类结果。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，兼容 `std::error::Error`；
//! - `CacheError` 实现 `Clone`：同一次解析失败需要同时交给创建者与所有等待者。
//!
//! ## 扩展建议（How）
//! - 新增变体时区分“可重试”与“不可重试”，并同步 [`CacheError::is_retryable`]。

use thiserror::Error;

use crate::types::BufferId;

/// 解析原语（[`DmaMapper::map`](crate::DmaMapper::map)）返回的失败。
///
/// # 教案式说明
/// - **意图 (Why)**：让外部实现区分“暂时没有资源”与“永远不会成功”，缓存据此决定是否重试；
/// - **契约 (What)**：`Exhausted` 会按 [`CacheConfig::resolve_attempts`](crate::CacheConfig) 重试；
///   `Fault` 立即终止本次 acquire。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum MapError {
    /// IOVA 空间、页表内存等资源暂时耗尽。
    #[error("mapping resources temporarily exhausted")]
    Exhausted,

    /// 不可恢复的映射故障。
    #[error("mapping fault: {detail}")]
    Fault { detail: String },
}

impl MapError {
    /// 便捷构造 `Fault`。
    pub fn fault(detail: impl Into<String>) -> Self {
        MapError::Fault {
            detail: detail.into(),
        }
    }
}

/// 配置校验失败。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// `resolve_attempts` 为 0，意味着一次解析都不会发起。
    #[error("resolve_attempts must be at least 1")]
    ZeroAttempts,

    /// TOML 文本无法解析为 [`CacheConfig`](crate::CacheConfig)。
    #[error("invalid cache configuration: {detail}")]
    Parse { detail: String },
}

/// 缓存核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：acquire 失败必须是“原子的”：返回错误时缓存内不残留半成品记录或映射；
///   批量释放冲突则是非致命信号，提示调用方仍有硬件映射存活；
/// - **契约 (What)**：
///   - `Exhausted`/`MapFailed` 仅由 acquire 返回，且返回时该次调用占用的全部引用已归还；
///   - `Conflict` 仅由 [`MapCache::release_all_for_consumer`](crate::MapCache::release_all_for_consumer) 返回；
///   - 所有变体均 `Send + Sync + 'static`，可安全跨线程传播。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum CacheError {
    /// 解析原语在允许的尝试次数内始终报告资源枯竭。
    #[error("mapping {buffer} exhausted resources after {attempts} attempt(s)")]
    Exhausted { buffer: BufferId, attempts: u32 },

    /// 解析原语报告不可恢复的故障。
    #[error("mapping {buffer} failed: {detail}")]
    MapFailed { buffer: BufferId, detail: String },

    /// 批量释放后仍有 `outstanding` 个映射被其他未配对的 acquire 持有。
    #[error("{outstanding} mapping(s) are still held by unmatched acquires")]
    Conflict { outstanding: usize },

    /// 构造缓存时配置非法。
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl CacheError {
    /// 调用方稍后重试是否有望成功。
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Exhausted { .. })
    }

    /// 将解析原语的失败提升为缓存错误，并附上缓冲与尝试次数上下文。
    pub(crate) fn from_map_error(error: MapError, buffer: BufferId, attempts: u32) -> Self {
        match error {
            MapError::Exhausted => CacheError::Exhausted { buffer, attempts },
            MapError::Fault { detail } => CacheError::MapFailed { buffer, detail },
        }
    }
}
