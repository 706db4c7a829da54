//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 解析原语可能因 IOVA 空间或页表内存暂时不足而失败；是否重试、重试几次、间隔多久属于部署策略，
//!   不应写死在缓存内部；
//! - 配置以 TOML 片段形式嵌入宿主配置文件，通过 `serde` 反序列化。
//!
//! ## 契约（What）
//! - 未出现的字段取默认值；未知字段直接拒绝，避免拼写错误被静默忽略；
//! - [`CacheConfig::validate`] 是唯一的合法性检查入口，[`MapCache::with_config`](crate::MapCache::with_config) 会调用它。

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_RESOLVE_ATTEMPTS: u32 = 3;

/// 缓存运行时配置。
///
/// # 教案式说明
/// - **意图 (Why)**：以有界重试替代“无限重试直到成功”，让资源枯竭最终以错误形式返回给调用方；
/// - **契约 (What)**：
///   - `resolve_attempts`：单次 acquire 最多调用解析原语的次数，必须 ≥ 1，默认 3；
///   - `retry_backoff_micros`：两次尝试之间的休眠时长（微秒），默认 0 表示立即重试；
/// - **权衡 (Trade-offs)**：重试期间同一 (缓冲, 消费者) 的并发 acquire 会等待创建者的结果，
///   过长的退避会放大它们的等待时间。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub resolve_attempts: u32,
    pub retry_backoff_micros: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resolve_attempts: DEFAULT_RESOLVE_ATTEMPTS,
            retry_backoff_micros: 0,
        }
    }
}

impl CacheConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: CacheConfig = toml::from_str(text).map_err(|err| ConfigError::Parse {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段取值。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolve_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }

    /// 设置最大解析尝试次数。
    pub fn with_resolve_attempts(mut self, attempts: u32) -> Self {
        self.resolve_attempts = attempts;
        self
    }

    /// 设置重试退避。
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_micros = u64::try_from(backoff.as_micros()).unwrap_or(u64::MAX);
        self
    }

    /// 重试退避时长。
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_micros(self.retry_backoff_micros)
    }
}
