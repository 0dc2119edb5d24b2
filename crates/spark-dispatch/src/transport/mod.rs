//! 线路协作者实现。
//!
//! - [`memory`]：同步进程内回环，发送即投递，测试与嵌入场景的默认选择；
//! - [`queued`]：（`runtime-tokio`）报文进入无界队列，由 Tokio 任务依次投递，
//!   调用在发送与响应之间真正处于挂起状态。

pub mod memory;
#[cfg(feature = "runtime-tokio")]
pub mod queued;

pub use memory::MemoryTransport;
#[cfg(feature = "runtime-tokio")]
pub use queued::QueuedTransport;
