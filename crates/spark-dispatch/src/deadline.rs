use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::debug;

/// 截止令牌，统一表达“调用在何时被放弃”。
///
/// # 设计背景（Why）
/// - 调用可能因为超时、上游放弃等原因需要终止；核心只关心“到期”这一事件本身，
///   真实时钟驱动由外部协作者负责（见 `timer::expire_after`），从而保证流水线在测试中完全确定。
/// - 与只提供原子位的取消原语不同，调用分发需要在到期瞬间唤醒挂起的调用，
///   因此这里额外提供监听注册接口。
///
/// # 逻辑解析（How）
/// - 内部以 [`AtomicBool`] 记录是否到期，监听者列表由互斥锁保护；
/// - `expire` 在锁内完成状态翻转并取走全部监听者，随后在锁外按订阅顺序同步调用，
///   监听者因此可以安全地回调令牌本身（例如注销其他监听者或再次订阅）。
///
/// # 契约说明（What）
/// - 状态只有 `pending → expired` 一次跃迁，重复 `expire` 为空操作并返回 `false`；
/// - 已到期后注册的监听者立即在当前线程触发，不会错过通知；
/// - [`Deadline::infinite`] 永不到期，对其注册的监听者直接被丢弃。
///
/// # 设计取舍与风险（Trade-offs）
/// - 监听者在调用 `expire` 的线程上执行，耗时逻辑应自行转交执行器；
/// - 克隆共享同一状态，调用方可以在多个调用之间显式共享一个令牌。
#[derive(Clone)]
pub struct Deadline {
    inner: Arc<DeadlineInner>,
}

struct DeadlineInner {
    infinite: bool,
    expired: AtomicBool,
    listeners: Mutex<ListenerSlots>,
}

#[derive(Default)]
struct ListenerSlots {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
}

type Listener = Box<dyn FnOnce() + Send + 'static>;

/// 监听者句柄，用于在调用结束后注销尚未触发的监听。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl Deadline {
    /// 创建处于 `pending` 状态、可被到期的令牌。
    pub fn new() -> Self {
        Self::with_kind(false)
    }

    /// 创建永不到期的令牌。
    pub fn infinite() -> Self {
        Self::with_kind(true)
    }

    fn with_kind(infinite: bool) -> Self {
        Self {
            inner: Arc::new(DeadlineInner {
                infinite,
                expired: AtomicBool::new(false),
                listeners: Mutex::new(ListenerSlots::default()),
            }),
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.inner.infinite
    }

    pub fn is_expired(&self) -> bool {
        self.inner.expired.load(Ordering::Acquire)
    }

    /// 将令牌标记为到期，并按订阅顺序通知所有监听者。
    ///
    /// 返回 `true` 表示本次调用触发了状态跃迁；无限令牌或重复调用返回 `false`。
    pub fn expire(&self) -> bool {
        if self.inner.infinite {
            return false;
        }
        let listeners = {
            let mut slots = self.inner.listeners.lock();
            if self.inner.expired.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut slots.entries)
        };
        debug!(listeners = listeners.len(), "deadline expired");
        for (_, listener) in listeners {
            listener();
        }
        true
    }

    /// 订阅到期事件。
    ///
    /// # 契约（What）
    /// - 令牌仍处于 `pending`：登记监听并返回其句柄；
    /// - 令牌已到期：立即在当前线程调用监听者，返回 `None`；
    /// - 无限令牌：监听者永远不会触发，直接丢弃并返回 `None`。
    pub fn on_expire<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.infinite {
            return None;
        }
        let mut slots = self.inner.listeners.lock();
        if self.is_expired() {
            drop(slots);
            listener();
            return None;
        }
        let id = ListenerId(slots.next_id);
        slots.next_id += 1;
        slots.entries.push((id, Box::new(listener)));
        Some(id)
    }

    /// 注销尚未触发的监听者；返回是否确实移除了条目。
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut slots = self.inner.listeners.lock();
        let before = slots.entries.len();
        slots.entries.retain(|(entry, _)| *entry != id);
        slots.entries.len() != before
    }

    /// 当前登记的监听者数量。
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().entries.len()
    }

    /// 两个句柄是否指向同一令牌。
    pub fn ptr_eq(&self, other: &Deadline) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Deadline {
    /// 调用方未显式给出截止令牌时按“无限”处理。
    fn default() -> Self {
        Deadline::infinite()
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deadline")
            .field("infinite", &self.inner.infinite)
            .field("expired", &self.is_expired())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
