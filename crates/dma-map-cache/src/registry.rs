//! # BufferRegistry：缓冲记录索引
//!
//! ## 核心意图（Why）
//! - 以 `DashMap` 维护 `BufferId → BufferRecord` 的全局索引，是找到记录的唯一途径；
//! - 查找只取分片读锁，创建 / 移除取分片写锁，不同缓冲之间互不阻塞。
//!
//! ## 行为契约（What）
//! - `acquire`：查找或创建，查找命中时以“非零才自增”复用记录，死记录（计数为 0）会被新记录替换；
//! - `release`：归还引用，归零时移除，且仅当槽位中仍是同一个记录（指针相等）才移除，迟到的释放者不会误删后继记录；
//! - `retire`：缓冲销毁时无条件摘除记录，保证之后的 acquire 必定走创建路径。
//!
//! ## 风险提示（Trade-offs）
//! - 调用方不得在持有记录锁期间进入本索引（锁顺序：索引锁永不嵌套在记录锁之内）；
//! - `snapshot` 只保证访问调用时刻存在的每个记录一次，不反映遍历期间的增删。

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    mapper::DmaMapper,
    record::BufferRecord,
    types::{BufferId, MapPolicy},
};

pub(crate) struct BufferRegistry<M: DmaMapper> {
    records: DashMap<BufferId, Arc<BufferRecord<M>>>,
}

impl<M: DmaMapper> Default for BufferRegistry<M> {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl<M: DmaMapper> BufferRegistry<M> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 共享模式查找；返回的记录可能已死亡（计数为 0），调用方需自行判断。
    pub(crate) fn find(&self, id: BufferId) -> Option<Arc<BufferRecord<M>>> {
        self.records.get(&id).map(|record| Arc::clone(record.value()))
    }

    /// 查找或创建 `id` 的记录并占用一个引用。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：绝大多数调用命中已有记录，只需分片读锁 + 一次原子自增；
    /// - **执行 (How)**：读锁查找失败后转入 `entry` 写锁，在写锁内复查，
    ///   并发创建者已插入的存活记录直接复用，空槽或死记录则以 `policy` 初值新建；
    /// - **契约 (What)**：返回 `(record, created)`；`created == true` 时记录计数为 `policy` 的初值。
    pub(crate) fn acquire(&self, id: BufferId, policy: MapPolicy) -> (Arc<BufferRecord<M>>, bool) {
        if let Some(record) = self.find(id) {
            if record.try_get() {
                return (record, false);
            }
        }

        match self.records.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().try_get() {
                    return (Arc::clone(occupied.get()), false);
                }
                let fresh = Arc::new(BufferRecord::new(id, policy));
                occupied.insert(Arc::clone(&fresh));
                (fresh, true)
            }
            Entry::Vacant(vacant) => {
                let fresh = Arc::new(BufferRecord::new(id, policy));
                vacant.insert(Arc::clone(&fresh));
                (fresh, true)
            }
        }
    }

    /// 归还 `units` 个引用，归零时从索引移除。返回记录是否已死亡。
    pub(crate) fn release(&self, record: &Arc<BufferRecord<M>>, units: usize) -> bool {
        if units == 0 {
            return false;
        }
        match record.put(units) {
            Ok(0) => {
                self.remove(record);
                tracing::debug!(buffer = %record.id(), "buffer record reclaimed");
                true
            }
            Ok(_) => false,
            Err(underflow) => {
                tracing::warn!(
                    buffer = %record.id(),
                    current = underflow.current,
                    requested = underflow.requested,
                    "buffer record released more often than acquired"
                );
                false
            }
        }
    }

    /// 无条件摘除记录（若槽位中仍是它）。
    pub(crate) fn retire(&self, record: &Arc<BufferRecord<M>>) {
        self.remove(record);
    }

    fn remove(&self, record: &Arc<BufferRecord<M>>) {
        self.records
            .remove_if(&record.id(), |_, current| Arc::ptr_eq(current, record));
    }

    /// 复制当前全部记录的引用，供批量清理逐个加锁处理。
    pub(crate) fn snapshot(&self) -> Vec<Arc<BufferRecord<M>>> {
        self.records
            .iter()
            .map(|record| Arc::clone(record.value()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
