//! 真实时钟协作者：按时长触发截止令牌。
//!
//! 内核只对 [`Deadline::expire`] 事件作出反应，从不读取时钟；需要“N 毫秒后超时”的调用方
//! 通过这里把 Tokio 定时器接到令牌上。测试中配合 `tokio::time::pause` 可以获得确定的时间线。

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::deadline::Deadline;

/// 在 `after` 之后到期 `deadline`。
///
/// 无限令牌永不到期，此时不创建任务并返回 `None`。返回的句柄可用于在调用提前结束时
/// `abort` 定时任务；丢弃句柄不会取消定时。
///
/// # Panics
/// 与 `tokio::spawn` 相同：必须在 Tokio 运行时上下文中调用。
pub fn expire_after(deadline: &Deadline, after: Duration) -> Option<JoinHandle<()>> {
    if deadline.is_infinite() {
        return None;
    }
    let deadline = deadline.clone();
    Some(tokio::spawn(async move {
        tokio::time::sleep(after).await;
        deadline.expire();
    }))
}
