use std::sync::OnceLock;

use crate::{
    channel::{Delivery, Packet, Transport},
    error::{CallError, Result},
};

/// 同步进程内传输：`send` 在当前线程上立即完成投递。
///
/// # 契约（What）
/// - 请求的服务端分发、响应的客户端唤醒都可能在 `send` 返回之前完成；
/// - 未绑定或 Channel 已释放时，`send` 返回 `CHANNEL_CLOSED`。
#[derive(Debug, Default)]
pub struct MemoryTransport {
    delivery: OnceLock<Delivery>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for MemoryTransport {
    fn bind(&self, delivery: Delivery) {
        let _ = self.delivery.set(delivery);
    }

    fn send(&self, packet: Packet) -> Result<()> {
        let delivery = self.delivery.get().ok_or_else(CallError::channel_closed)?;
        if delivery.deliver(packet) {
            Ok(())
        } else {
            Err(CallError::channel_closed())
        }
    }
}
