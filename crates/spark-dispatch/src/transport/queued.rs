use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    channel::{Delivery, Packet, Transport},
    error::{CallError, Result},
};

/// 基于 Tokio 任务的排队传输。
///
/// # 教案式说明
/// - **意图 (Why)**：同步回环会让“发送”与“响应”发生在同一调用栈上；排队传输把投递转移到
///   独立任务，调用在两者之间真正挂起，贴近真实网络下多调用交错在途的形态；
/// - **结构 (How)**：无界 `mpsc` 队列 + 绑定时启动的泵任务，泵按入队顺序逐个投递；
/// - **契约 (What)**：`send` 从不阻塞；Channel 关闭后泵任务被中止，后续 `send` 返回 `CHANNEL_CLOSED`；
/// - **风险 (Trade-offs)**：队列无界，生产速度长期高于投递速度时内存会持续增长。
#[derive(Debug)]
pub struct QueuedTransport {
    sender: Mutex<Option<UnboundedSender<Packet>>>,
    receiver: Mutex<Option<UnboundedReceiver<Packet>>>,
    runtime: Handle,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedTransport {
    /// 在指定运行时上创建传输。
    pub fn new(runtime: Handle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            runtime,
            pump: Mutex::new(None),
        }
    }

    /// 在当前所处的 Tokio 运行时上创建传输；不在运行时内时返回 `INTERNAL_ERROR`。
    pub fn try_current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|err| CallError::internal(format!("no tokio runtime available: {err}")))
    }
}

impl Transport for QueuedTransport {
    fn bind(&self, delivery: Delivery) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            return;
        };
        let pump = self.runtime.spawn(async move {
            while let Some(packet) = receiver.recv().await {
                if !delivery.deliver(packet) {
                    break;
                }
            }
            debug!("queued transport pump stopped");
        });
        *self.pump.lock() = Some(pump);
    }

    fn send(&self, packet: Packet) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or_else(CallError::channel_closed)?;
        sender.send(packet).map_err(|_| CallError::channel_closed())
    }

    fn close(&self) {
        self.sender.lock().take();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}
