//! # record 模块说明
//!
//! ## 核心意图（Why）
//! - `BufferRecord` 追踪单个缓冲上所有消费者的映射，`MappingEntry` 表示其中一条 (缓冲, 消费者) 映射；
//! - 二者各自持有原子引用计数，命中路径只需一次原子自增，不触碰集合结构。
//!
//! ## 行为契约（What）
//! - 映射集合由记录内的读写锁保护：只读查找 + 命中自增用共享锁，插入 / 摘除用独占锁；
//! - 新映射以“解析中”状态（结果尚未发布）先挂入集合，再由创建者在锁外调用解析原语，之后发布成功或失败的结果；
//!   同一消费者的并发 acquire 在锁外等待这一结果，从而保证解析只发生一次；
//! - 任何锁都不会在调用外部原语期间被持有；条目的等待互斥量与记录锁从不嵌套；
//! - 记录计数恒等于其链上条目计数之和；条目被摘除时，它剩余的引用由摘除者一次性归还给记录。
//!
//! ## 风险提示（Trade-offs）
//! - 集合是线性扫描的 `Vec`：单个缓冲上的消费者通常只有个位数，扫描比哈希更省内存也更快。

use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::{
    error::CacheError,
    mapper::DmaMapper,
    refcount::{RefCount, Underflow},
    types::{BufferId, DmaDirection, MapPolicy},
};

/// 单个 (缓冲, 消费者) 的映射。
///
/// 解析结果只写一次：发布后命中路径直接读取 `outcome`，不再触碰互斥量；
/// `waiting` + `resolved` 只服务于解析尚未结束时到达的等待者。
pub(crate) struct MappingEntry<M: DmaMapper> {
    consumer: M::Consumer,
    direction: DmaDirection,
    refcount: RefCount,
    outcome: OnceLock<Result<M::Segments, CacheError>>,
    waiting: Mutex<()>,
    resolved: Condvar,
}

impl<M: DmaMapper> MappingEntry<M> {
    fn resolving(consumer: M::Consumer, direction: DmaDirection, policy: MapPolicy) -> Self {
        Self {
            consumer,
            direction,
            refcount: RefCount::new(policy.initial_refcount()),
            outcome: OnceLock::new(),
            waiting: Mutex::new(()),
            resolved: Condvar::new(),
        }
    }

    pub(crate) fn consumer(&self) -> &M::Consumer {
        &self.consumer
    }

    pub(crate) fn direction(&self) -> DmaDirection {
        self.direction
    }

    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load()
    }

    /// 创建者发布解析结果并唤醒所有等待者。只有第一次发布生效。
    pub(crate) fn publish(&self, outcome: Result<M::Segments, CacheError>) {
        let first = self.outcome.set(outcome).is_ok();
        debug_assert!(first, "mapping outcome published twice");
        // 先取一次锁：已检查过 `outcome` 的等待者此时必然已进入 wait，不会错过通知。
        drop(self.waiting.lock());
        self.resolved.notify_all();
    }

    /// 阻塞直到解析结束，返回地址段的克隆或创建者遇到的错误。
    pub(crate) fn wait_resolved(&self) -> Result<M::Segments, CacheError> {
        if let Some(outcome) = self.outcome.get() {
            return outcome.clone();
        }
        let mut waiting = self.waiting.lock();
        loop {
            if let Some(outcome) = self.outcome.get() {
                return outcome.clone();
            }
            self.resolved.wait(&mut waiting);
        }
    }
}

/// 在集合中查找某条映射的结果。
pub(crate) enum Lookup<M: DmaMapper> {
    /// 已有映射，引用计数已自增。
    Hit(Arc<MappingEntry<M>>),
    /// 新挂入、尚未发布结果的映射，调用方负责解析并发布结果。
    Created(Arc<MappingEntry<M>>),
}

/// 独占锁内对一条映射执行一次释放后的去向。
pub(crate) enum Drained<M: DmaMapper> {
    /// 计数归零，已从集合摘除，需在锁外拆除。
    Doomed(Arc<MappingEntry<M>>),
    /// 计数未归零但仍被摘除（缓冲已销毁），`remaining` 为残留引用数。
    Orphaned {
        entry: Arc<MappingEntry<M>>,
        remaining: usize,
    },
}

/// 单个缓冲的追踪记录。
pub(crate) struct BufferRecord<M: DmaMapper> {
    id: BufferId,
    refcount: RefCount,
    mappings: RwLock<Vec<Arc<MappingEntry<M>>>>,
}

impl<M: DmaMapper> BufferRecord<M> {
    pub(crate) fn new(id: BufferId, policy: MapPolicy) -> Self {
        Self {
            id,
            refcount: RefCount::new(policy.initial_refcount()),
            mappings: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn id(&self) -> BufferId {
        self.id
    }

    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load()
    }

    pub(crate) fn get(&self) {
        self.refcount.get();
    }

    pub(crate) fn try_get(&self) -> bool {
        self.refcount.try_get()
    }

    pub(crate) fn put(&self, units: usize) -> Result<usize, Underflow> {
        self.refcount.put(units)
    }

    /// 查找或挂入 `consumer` 的映射。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：命中路径只取共享锁；未命中时用可升级读锁二次确认，避免两个创建者同时挂入条目；
    /// - **执行 (How)**：
    ///   1. 共享锁查找，命中即自增条目计数；
    ///   2. 可升级读锁再次查找（其他创建者可能刚刚挂入）；
    ///   3. 升级为独占锁，挂入尚未发布结果的条目；
    /// - **契约 (What)**：返回 `Created` 时解析尚未开始，调用方必须在锁外解析并调用 [`MappingEntry::publish`]。
    pub(crate) fn lookup_or_insert(
        &self,
        consumer: &M::Consumer,
        direction: DmaDirection,
        policy: MapPolicy,
    ) -> Lookup<M> {
        {
            let mappings = self.mappings.read();
            if let Some(entry) = find(&mappings, consumer) {
                entry.refcount.get();
                return Lookup::Hit(Arc::clone(entry));
            }
        }

        let mappings = self.mappings.upgradable_read();
        if let Some(entry) = find(&mappings, consumer) {
            entry.refcount.get();
            return Lookup::Hit(Arc::clone(entry));
        }
        let mut mappings = RwLockUpgradableReadGuard::upgrade(mappings);
        let entry = Arc::new(MappingEntry::resolving(consumer.clone(), direction, policy));
        mappings.push(Arc::clone(&entry));
        Lookup::Created(entry)
    }

    /// 释放 `consumer` 映射的一个引用；归零时在独占锁内摘除该条目，拆除留给调用方在锁外完成。
    pub(crate) fn release_one(&self, consumer: &M::Consumer) -> Released<M> {
        let mut mappings = self.mappings.write();
        let Some(index) = mappings.iter().position(|entry| entry.consumer == *consumer) else {
            return Released::Missing;
        };
        match mappings[index].refcount.put(1) {
            Ok(0) => Released::Doomed(mappings.swap_remove(index)),
            Ok(_) => Released::Live(Arc::clone(&mappings[index])),
            Err(underflow) => {
                // 链表中的条目计数恒大于 0，走到这里说明计数被越界归还。
                tracing::warn!(
                    buffer = %self.id,
                    current = underflow.current,
                    "linked mapping with exhausted refcount, unlinking"
                );
                Released::Doomed(mappings.swap_remove(index))
            }
        }
    }

    /// 对 `consumer` 的映射各释放一个引用。
    ///
    /// 返回被摘除（待拆除）的条目、被释放的引用数与仍存活的条目数。
    pub(crate) fn release_consumer(&self, consumer: &M::Consumer) -> ConsumerSweep<M> {
        let mut sweep = ConsumerSweep::default();
        let mut mappings = self.mappings.write();
        mappings.retain(|entry| {
            if entry.consumer != *consumer {
                return true;
            }
            sweep.released += 1;
            match entry.refcount.put(1) {
                Ok(0) | Err(_) => {
                    sweep.doomed.push(Arc::clone(entry));
                    false
                }
                Ok(_) => {
                    sweep.outstanding += 1;
                    true
                }
            }
        });
        sweep
    }

    /// 缓冲销毁：摘除全部映射，各释放一个引用。
    pub(crate) fn drain(&self) -> Vec<Drained<M>> {
        let mut mappings = self.mappings.write();
        mappings
            .drain(..)
            .map(|entry| match entry.refcount.put(1) {
                Ok(0) | Err(_) => Drained::Doomed(entry),
                Ok(remaining) => Drained::Orphaned { entry, remaining },
            })
            .collect()
    }

    /// 将解析失败的条目摘除，并在同一把独占锁内取走它剩余的全部引用。
    ///
    /// 返回取走的引用数，调用方须向记录归还同样多的引用；条目已被其他路径摘除时返回 `None`，
    /// 此时这些引用已由摘除它的一方归还。
    pub(crate) fn unlink(&self, target: &Arc<MappingEntry<M>>) -> Option<usize> {
        let mut mappings = self.mappings.write();
        let index = mappings
            .iter()
            .position(|entry| Arc::ptr_eq(entry, target))?;
        let entry = mappings.swap_remove(index);
        Some(entry.refcount.take())
    }

    /// 查询 `consumer` 映射的当前计数。
    pub(crate) fn mapping_refcount(&self, consumer: &M::Consumer) -> Option<usize> {
        let mappings = self.mappings.read();
        find(&mappings, consumer).map(|entry| entry.refcount())
    }

    pub(crate) fn mapping_count(&self) -> usize {
        self.mappings.read().len()
    }
}

/// [`BufferRecord::release_one`] 的结果。
pub(crate) enum Released<M: DmaMapper> {
    Missing,
    Live(Arc<MappingEntry<M>>),
    Doomed(Arc<MappingEntry<M>>),
}

/// [`BufferRecord::release_consumer`] 的结果。
pub(crate) struct ConsumerSweep<M: DmaMapper> {
    pub(crate) doomed: Vec<Arc<MappingEntry<M>>>,
    pub(crate) released: usize,
    pub(crate) outstanding: usize,
}

impl<M: DmaMapper> Default for ConsumerSweep<M> {
    fn default() -> Self {
        Self {
            doomed: Vec::new(),
            released: 0,
            outstanding: 0,
        }
    }
}

fn find<'a, M: DmaMapper>(
    mappings: &'a [Arc<MappingEntry<M>>],
    consumer: &M::Consumer,
) -> Option<&'a Arc<MappingEntry<M>>> {
    mappings.iter().find(|entry| entry.consumer == *consumer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::MapError, types::AddressRange};

    struct NullMapper;

    impl DmaMapper for NullMapper {
        type Consumer = u32;
        type Segments = u64;

        fn map(&self, _: &u32, range: AddressRange, _: DmaDirection) -> Result<u64, MapError> {
            Ok(range.start)
        }

        fn unmap(&self, _: &u32, _: &u64, _: DmaDirection) {}
    }

    fn record(policy: MapPolicy) -> BufferRecord<NullMapper> {
        BufferRecord::new(BufferId::new(1), policy)
    }

    #[test]
    fn second_lookup_hits_the_same_entry() {
        let record = record(MapPolicy::Eager);
        let first = match record.lookup_or_insert(&7, DmaDirection::ToDevice, MapPolicy::Eager) {
            Lookup::Created(entry) => entry,
            Lookup::Hit(_) => panic!("首次查找必须创建条目"),
        };
        first.publish(Ok(0x1000));
        let second = match record.lookup_or_insert(&7, DmaDirection::ToDevice, MapPolicy::Eager) {
            Lookup::Hit(entry) => entry,
            Lookup::Created(_) => panic!("第二次查找必须命中"),
        };
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.refcount(), 2);
        assert_eq!(second.wait_resolved(), Ok(0x1000));
        assert_eq!(record.mapping_count(), 1);
    }

    #[test]
    fn deferred_entry_survives_one_extra_release() {
        let record = record(MapPolicy::Deferred);
        let Lookup::Created(entry) =
            record.lookup_or_insert(&3, DmaDirection::Bidirectional, MapPolicy::Deferred)
        else {
            panic!("首次查找必须创建条目");
        };
        entry.publish(Ok(0x2000));
        assert!(matches!(record.release_one(&3), Released::Live(_)));
        assert!(matches!(record.release_one(&3), Released::Doomed(_)));
        assert!(matches!(record.release_one(&3), Released::Missing));
        assert_eq!(record.mapping_count(), 0);
    }

    #[test]
    fn drain_separates_doomed_and_orphaned() {
        let record = record(MapPolicy::Eager);
        for consumer in [1, 2] {
            let Lookup::Created(entry) =
                record.lookup_or_insert(&consumer, DmaDirection::FromDevice, MapPolicy::Eager)
            else {
                panic!("首次查找必须创建条目");
            };
            entry.publish(Ok(u64::from(consumer)));
        }
        // 消费者 2 多持有一个引用。
        assert!(matches!(
            record.lookup_or_insert(&2, DmaDirection::FromDevice, MapPolicy::Eager),
            Lookup::Hit(_)
        ));

        let drained = record.drain();
        assert_eq!(drained.len(), 2);
        let doomed = drained
            .iter()
            .filter(|d| matches!(d, Drained::Doomed(_)))
            .count();
        let orphaned: Vec<usize> = drained
            .iter()
            .filter_map(|d| match d {
                Drained::Orphaned { remaining, .. } => Some(*remaining),
                Drained::Doomed(_) => None,
            })
            .collect();
        assert_eq!(doomed, 1);
        assert_eq!(orphaned, vec![1]);
        assert_eq!(record.mapping_count(), 0);
    }

    #[test]
    fn failed_resolution_is_visible_to_waiters() {
        let record = record(MapPolicy::Eager);
        let Lookup::Created(entry) =
            record.lookup_or_insert(&9, DmaDirection::ToDevice, MapPolicy::Eager)
        else {
            panic!("首次查找必须创建条目");
        };
        let waiter = {
            let entry = Arc::clone(&entry);
            std::thread::spawn(move || entry.wait_resolved())
        };
        let error = CacheError::Exhausted {
            buffer: record.id(),
            attempts: 1,
        };
        entry.publish(Err(error.clone()));
        assert_eq!(waiter.join().expect("等待线程不应 panic"), Err(error));
        assert_eq!(record.unlink(&entry), Some(1));
        assert_eq!(record.unlink(&entry), None, "重复摘除应返回 None");
    }

    #[test]
    fn unlink_takes_only_the_units_still_held() {
        let record = record(MapPolicy::Deferred);
        let Lookup::Created(entry) =
            record.lookup_or_insert(&4, DmaDirection::ToDevice, MapPolicy::Deferred)
        else {
            panic!("首次查找必须创建条目");
        };
        // 解析期间：一个等待者命中，一次未配对的 release 扣减。
        assert!(matches!(
            record.lookup_or_insert(&4, DmaDirection::ToDevice, MapPolicy::Deferred),
            Lookup::Hit(_)
        ));
        assert!(matches!(record.release_one(&4), Released::Live(_)));
        assert_eq!(entry.refcount(), 2);

        assert_eq!(record.unlink(&entry), Some(2));
        assert_eq!(entry.refcount(), 0);
        assert_eq!(record.mapping_count(), 0);
        assert!(matches!(record.release_one(&4), Released::Missing));
    }

    #[test]
    fn published_outcome_is_read_without_waiting() {
        let record = record(MapPolicy::Eager);
        let Lookup::Created(entry) =
            record.lookup_or_insert(&6, DmaDirection::FromDevice, MapPolicy::Eager)
        else {
            panic!("首次查找必须创建条目");
        };
        entry.publish(Ok(0x6000));
        // 持有等待互斥量时读取仍立即返回：已发布的结果不经过锁。
        let _waiting = entry.waiting.lock();
        assert_eq!(entry.wait_resolved(), Ok(0x6000));
    }
}
