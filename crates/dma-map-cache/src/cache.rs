//! # cache 模块说明
//!
//! ## 角色定位（Why）
//! - 组合 `registry` 与 `record`，对外提供 acquire / release / 按消费者批量释放 / 缓冲销毁通知四个操作；
//! - 所有调用解析、拆除原语的时机都集中在本模块，便于核对“锁外调用”这一约束。
//!
//! ## 引用账目（What）
//! - 记录计数恒等于其映射计数之和；每条把映射计数加一的路径同时给记录加一，反之亦然；
//! - 映射被摘除时，摘除者负责把该映射剩余的全部引用归还给记录，其余参与者不再归还。

use std::{
    cmp::Ordering as CmpOrdering,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
};

use crate::{
    config::CacheConfig,
    error::{CacheError, MapError},
    mapper::{DmaMapper, FreeListener},
    record::{BufferRecord, Drained, Lookup, MappingEntry, Released},
    registry::BufferRegistry,
    types::{BufferId, DmaBuffer, DmaDirection, MapPolicy},
};

/// `MapCache` 以 (缓冲, 消费者) 为粒度缓存昂贵的 DMA 地址解析结果。
///
/// # 模块角色（Why）
/// - 同一缓冲被同一设备反复映射时，只有第一次需要调用解析原语，之后的 acquire 只是一条原子自增；
/// - 映射在最后一个使用者释放时恰好拆除一次；缓冲被销毁时由所有者通知缓存清理残余映射。
///
/// # 核心机制（How）
/// - `BufferRegistry`（`DashMap`）索引每个缓冲的 `BufferRecord`，记录内部用读写锁保护映射集合；
/// - 所有结构性修改都在锁内完成，解析 / 拆除原语一律在释放全部锁之后调用；
/// - 新映射先以“解析中”状态挂入集合，并发的同一消费者 acquire 在锁外等待创建者的结果，保证解析只发生一次；
/// - `CacheMetrics` 以原子计数记录命中、解析、拆除等指标，支撑 [`MapCache::stats`]。
///
/// # 契约说明（What）
/// - **线程安全**：`MapCache` 可廉价克隆，所有克隆共享同一份状态，满足 `Send + Sync + 'static`；
/// - **配对要求**：每次成功的 `acquire` 必须恰好对应一次 `release`（或由批量释放 / 缓冲销毁代为归还）；
///   未配对的 release 是静默的空操作；
/// - **失败原子性**：`acquire` 返回错误时，缓存内不残留该次调用创建的任何记录或映射。
///
/// # 设计权衡（Trade-offs）
/// - 解析中的映射会让同一 (缓冲, 消费者) 的其他 acquire 阻塞等待；不同缓冲、不同消费者之间完全并行；
/// - 资源枯竭按 [`CacheConfig`] 有界重试，而不是无限重试直到成功。
pub struct MapCache<M: DmaMapper> {
    inner: Arc<CacheInner<M>>,
}

impl<M: DmaMapper> Clone for MapCache<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: DmaMapper> MapCache<M> {
    /// 以默认配置创建缓存。
    pub fn new(mapper: M) -> Self {
        Self::from_parts(mapper, CacheConfig::default())
    }

    /// 以指定配置创建缓存，配置非法时返回 [`CacheError::InvalidConfig`]。
    pub fn with_config(mapper: M, config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self::from_parts(mapper, config))
    }

    fn from_parts(mapper: M, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                mapper,
                config,
                registry: BufferRegistry::new(),
                metrics: CacheMetrics::default(),
            }),
        }
    }

    /// 为 `consumer` 获取 `buffer` 的映射，返回解析得到的地址段。
    ///
    /// # 参数与契约
    /// - `direction`：仅在首次创建映射时交给解析原语；命中已有映射时沿用其原方向；
    /// - `policy`：新建记录 / 映射时的计数初值策略，见 [`MapPolicy`]；
    /// - **后置条件**：成功时该 (缓冲, 消费者) 的映射计数增加 1，调用方欠缓存一次 `release`；
    ///   失败时不留下任何状态。
    ///
    /// # 实现策略
    /// 1. 在索引中查找或创建缓冲记录并占用一个引用；
    /// 2. 在记录内查找或挂入映射；命中即返回（必要时等待解析完成）；
    /// 3. 未命中时在锁外调用解析原语，发布结果；失败则摘除映射并归还全部引用。
    pub fn acquire(
        &self,
        consumer: &M::Consumer,
        buffer: &DmaBuffer,
        direction: DmaDirection,
        policy: MapPolicy,
    ) -> Result<M::Segments, CacheError> {
        let inner = &*self.inner;
        let (record, record_created) = inner.registry.acquire(buffer.id(), policy);
        let lookup = record.lookup_or_insert(consumer, direction, policy);

        // 记录计数恒等于其映射计数之和：新建的 Deferred 映射多占一份，命中只占一份。
        let granted = if record_created {
            policy.initial_refcount()
        } else {
            1
        };
        let owed = match &lookup {
            Lookup::Created(_) => policy.initial_refcount(),
            Lookup::Hit(_) => 1,
        };
        match owed.cmp(&granted) {
            CmpOrdering::Greater => record.get(),
            CmpOrdering::Less => {
                inner.registry.release(&record, granted - owed);
            }
            CmpOrdering::Equal => {}
        }

        match lookup {
            Lookup::Hit(entry) => inner.await_hit(&record, &entry, consumer),
            Lookup::Created(entry) => inner.resolve(&record, &entry, buffer),
        }
    }

    /// 归还一次 `acquire`。
    ///
    /// - **契约 (What)**：按消费者匹配映射，`direction` 仅用于诊断；找不到记录或映射时为空操作；
    /// - **执行 (How)**：独占锁内自减，归零则摘除；释放锁后再调用拆除原语，最后归还记录的一个引用。
    pub fn release(&self, consumer: &M::Consumer, buffer: BufferId, direction: DmaDirection) {
        let inner = &*self.inner;
        let Some(record) = inner.registry.find(buffer) else {
            tracing::trace!(%buffer, ?consumer, "release without buffer record ignored");
            return;
        };

        let entry = match record.release_one(consumer) {
            Released::Missing => {
                tracing::trace!(%buffer, ?consumer, "release without mapping ignored");
                return;
            }
            Released::Live(entry) => entry,
            Released::Doomed(entry) => {
                inner.metrics.unlinked(1);
                inner.teardown(buffer, &entry);
                entry
            }
        };
        if entry.direction() != direction {
            tracing::debug!(
                %buffer,
                ?consumer,
                mapped = ?entry.direction(),
                requested = ?direction,
                "release direction differs from mapping direction"
            );
        }
        inner.registry.release(&record, 1);
    }

    /// 为 `consumer` 在所有缓冲上各归还一个映射引用。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：设备关闭时一次性回收它在 `Deferred` 策略下残留的映射；
    /// - **执行 (How)**：快照全部记录，逐个在独占锁内自减该消费者的映射，归零者摘除并暂存；
    ///   遍历结束后在锁外统一拆除，再按自减次数归还各记录的引用；
    /// - **契约 (What)**：若仍有映射因其他未配对 acquire 而存活，返回 [`CacheError::Conflict`]，
    ///   调用方不能假定该消费者的硬件映射已全部撤销。
    pub fn release_all_for_consumer(&self, consumer: &M::Consumer) -> Result<(), CacheError> {
        let inner = &*self.inner;
        let mut doomed = Vec::new();
        let mut touched = Vec::new();
        let mut outstanding = 0;

        for record in inner.registry.snapshot() {
            let sweep = record.release_consumer(consumer);
            if sweep.released == 0 {
                continue;
            }
            outstanding += sweep.outstanding;
            doomed.extend(sweep.doomed.into_iter().map(|entry| (record.id(), entry)));
            touched.push((record, sweep.released));
        }

        inner.metrics.unlinked(doomed.len());
        for (buffer, entry) in &doomed {
            inner.teardown(*buffer, entry);
        }
        for (record, units) in &touched {
            inner.registry.release(record, *units);
        }

        tracing::debug!(
            ?consumer,
            torn_down = doomed.len(),
            outstanding,
            "released all mappings for consumer"
        );
        if outstanding > 0 {
            inner
                .metrics
                .conflicts
                .fetch_add(outstanding as u64, Ordering::Relaxed);
            return Err(CacheError::Conflict { outstanding });
        }
        Ok(())
    }

    /// 缓冲所有者通知缓冲已被销毁。
    ///
    /// 与 [`FreeListener::buffer_freed`] 等价，供直接持有 `MapCache` 的所有者调用。
    pub fn notify_buffer_freed(&self, buffer: BufferId) {
        self.inner.buffer_freed(buffer);
    }

    /// 返回供缓冲所有者持有的销毁回调。
    pub fn free_listener(&self) -> Arc<dyn FreeListener> {
        self.inner.clone()
    }

    /// 当前统计快照。
    pub fn stats(&self) -> CacheStats {
        self.inner.snapshot()
    }

    /// 缓冲记录的当前计数；记录不存在或已死亡时为 `None`。
    pub fn buffer_refcount(&self, buffer: BufferId) -> Option<usize> {
        self.inner
            .registry
            .find(buffer)
            .map(|record| record.refcount())
            .filter(|count| *count > 0)
    }

    /// (缓冲, 消费者) 映射的当前计数；不存在时为 `None`。
    pub fn mapping_refcount(&self, buffer: BufferId, consumer: &M::Consumer) -> Option<usize> {
        self.inner
            .registry
            .find(buffer)
            .and_then(|record| record.mapping_refcount(consumer))
    }

    /// 注入的映射器，便于宿主查询其自身状态。
    pub fn mapper(&self) -> &M {
        &self.inner.mapper
    }

    /// 构造时生效的配置。
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }
}

struct CacheInner<M: DmaMapper> {
    mapper: M,
    config: CacheConfig,
    registry: BufferRegistry<M>,
    metrics: CacheMetrics,
}

impl<M: DmaMapper> CacheInner<M> {
    /// 命中路径：等待（可能仍在进行的）解析结束。
    fn await_hit(
        &self,
        record: &Arc<BufferRecord<M>>,
        entry: &Arc<MappingEntry<M>>,
        consumer: &M::Consumer,
    ) -> Result<M::Segments, CacheError> {
        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        // 解析失败时无需归还：本次占用的引用已计入失败条目，由摘除它的一方连同其余引用一并归还。
        let segments = entry.wait_resolved()?;
        tracing::trace!(buffer = %record.id(), ?consumer, "mapping cache hit");
        Ok(segments)
    }

    /// 创建路径：在锁外调用解析原语并发布结果。
    fn resolve(
        &self,
        record: &Arc<BufferRecord<M>>,
        entry: &Arc<MappingEntry<M>>,
        buffer: &DmaBuffer,
    ) -> Result<M::Segments, CacheError> {
        self.metrics.live_mappings.fetch_add(1, Ordering::Relaxed);
        match self.map_with_retry(entry, buffer) {
            Ok(segments) => {
                entry.publish(Ok(segments.clone()));
                tracing::debug!(
                    buffer = %buffer.id(),
                    consumer = ?entry.consumer(),
                    direction = ?entry.direction(),
                    "mapping resolved"
                );
                Ok(segments)
            }
            Err(error) => {
                self.metrics.resolve_failures.fetch_add(1, Ordering::Relaxed);
                // 先摘除再发布，之后的 acquire 不会再命中这条失败的映射。
                // 摘除时取走的是条目此刻剩余的引用：创建者、等待者与解析期间的释放都已反映在其中。
                let owed = record.unlink(entry);
                entry.publish(Err(error.clone()));
                if let Some(units) = owed {
                    self.metrics.unlinked(1);
                    self.registry.release(record, units);
                }
                tracing::warn!(
                    buffer = %buffer.id(),
                    consumer = ?entry.consumer(),
                    %error,
                    "mapping resolution failed"
                );
                Err(error)
            }
        }
    }

    fn map_with_retry(
        &self,
        entry: &MappingEntry<M>,
        buffer: &DmaBuffer,
    ) -> Result<M::Segments, CacheError> {
        let attempts = self.config.resolve_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.metrics.resolve_calls.fetch_add(1, Ordering::Relaxed);
            match self
                .mapper
                .map(entry.consumer(), buffer.range(), entry.direction())
            {
                Ok(segments) => return Ok(segments),
                Err(MapError::Exhausted) if attempt < attempts => {
                    tracing::trace!(buffer = %buffer.id(), attempt, "mapping exhausted, retrying");
                    let backoff = self.config.retry_backoff();
                    if !backoff.is_zero() {
                        thread::sleep(backoff);
                    }
                }
                Err(error) => return Err(CacheError::from_map_error(error, buffer.id(), attempt)),
            }
        }
    }

    /// 拆除一条已摘除的映射；调用时不得持有任何锁。
    fn teardown(&self, buffer: BufferId, entry: &MappingEntry<M>) {
        // 摘除时若创建者仍在解析，需等它发布结果；解析失败的条目没有可拆除的地址段。
        let Ok(segments) = entry.wait_resolved() else {
            return;
        };
        self.mapper
            .unmap(entry.consumer(), &segments, entry.direction());
        self.metrics.teardown_calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%buffer, consumer = ?entry.consumer(), "mapping torn down");
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            live_buffers: self.registry.len(),
            live_mappings: self.metrics.live_mappings.load(Ordering::Relaxed),
            resolve_calls: self.metrics.resolve_calls.load(Ordering::Relaxed),
            resolve_failures: self.metrics.resolve_failures.load(Ordering::Relaxed),
            teardown_calls: self.metrics.teardown_calls.load(Ordering::Relaxed),
            hits: self.metrics.hits.load(Ordering::Relaxed),
            conflicts: self.metrics.conflicts.load(Ordering::Relaxed),
            orphaned: self.metrics.orphaned.load(Ordering::Relaxed),
        }
    }
}

impl<M: DmaMapper> FreeListener for CacheInner<M> {
    /// 缓冲销毁：摘除记录，逐条释放映射的一个引用。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：缓冲已不存在，硬件映射仍需撤销；同时必须保证之后同一标识的 acquire 走全新创建路径；
    /// - **执行 (How)**：
    ///   1. 先从索引摘除记录，新的 acquire 从此看不到它；
    ///   2. 独占锁内排空映射集合：归零者待拆除，未归零者作为孤儿直接丢弃（其未配对的 release 之后是空操作）；
    ///   3. 锁外拆除，再归还排空映射所代表的全部记录引用；
    /// - **风险 (Trade-offs)**：孤儿映射不会被拆除，出现时以 `warn` 级日志提示调用方存在未配对的 acquire。
    fn buffer_freed(&self, id: BufferId) {
        let Some(record) = self.registry.find(id) else {
            return;
        };
        self.registry.retire(&record);

        let drained = record.drain();
        self.metrics.unlinked(drained.len());
        let mut units = 0;
        for drained in &drained {
            match drained {
                Drained::Doomed(entry) => {
                    units += 1;
                    self.teardown(id, entry);
                }
                Drained::Orphaned { entry, remaining } => {
                    units += 1 + *remaining;
                    self.metrics.orphaned.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        buffer = %id,
                        consumer = ?entry.consumer(),
                        outstanding = remaining,
                        "buffer freed while mapping still acquired"
                    );
                }
            }
        }
        self.registry.release(&record, units);
        tracing::debug!(buffer = %id, mappings = drained.len(), "buffer freed");
    }
}

/// 缓存统计快照。
///
/// # 教案式说明
/// - **意图 (Why)**：为宿主的诊断接口提供只读视图，不参与任何同步决策；
/// - **契约 (What)**：前两个字段是当前规模，其余字段为自创建以来的累计值；
///   各字段独立读取，并发修改期间彼此之间不保证一致。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// 索引中的缓冲记录数。
    pub live_buffers: usize,
    /// 挂在记录上的映射数，含尚未解析完成的。
    pub live_mappings: usize,
    /// 调用解析原语的次数（含重试）。
    pub resolve_calls: u64,
    /// 以错误结束的创建路径次数。
    pub resolve_failures: u64,
    /// 调用拆除原语的次数。
    pub teardown_calls: u64,
    /// 命中已有映射的 acquire 次数。
    pub hits: u64,
    /// 批量释放后仍存活的映射累计数。
    pub conflicts: u64,
    /// 缓冲销毁时被摘除但未拆除的映射累计数。
    pub orphaned: u64,
}

#[derive(Default)]
struct CacheMetrics {
    live_mappings: AtomicUsize,
    resolve_calls: AtomicU64,
    resolve_failures: AtomicU64,
    teardown_calls: AtomicU64,
    hits: AtomicU64,
    conflicts: AtomicU64,
    orphaned: AtomicU64,
}

impl CacheMetrics {
    fn unlinked(&self, count: usize) {
        if count == 0 {
            return;
        }
        let _ = self
            .live_mappings
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(prev.saturating_sub(count))
            });
    }
}
