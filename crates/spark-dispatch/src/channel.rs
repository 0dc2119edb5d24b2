//! # channel 模块说明
//!
//! ## 角色定位（Why）
//! - Channel 是一个 Client 与一个 Server 之间的抽象双工链路：负责为请求分配调用标识、
//!   登记等待中的调用，并把响应路由回发起它的那一次调用；
//! - 线路本身（字节格式、I/O、线程模型）由 [`Transport`] 协作者提供，内核对其完全无感。
//!
//! ## 状态机（What）
//! - `Open → Closed` 单向跃迁，`close` 幂等；
//! - 关闭时全部等待中的调用以 `CHANNEL_CLOSED` 失败，且每个回调至多触发一次；
//! - 关闭后新的发送立即失败，任何方向都不再投递。
//!
//! ## 并发（How）
//! - 等待表使用 [`DashMap`]，不同调用的登记与解析互不阻塞；
//! - 回调总是在移出等待表之后、脱离分片锁的情况下调用，回调内部可以安全地再次发送。

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    client::Client,
    envelope::{Headers, WrappedResponse},
    error::{CallError, Result},
    server::Server,
    transport::memory::MemoryTransport,
};

/// 同一 Channel 内唯一的调用标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 报文方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client → Server。
    Request,
    /// Server → Client。
    Response,
}

/// 报文负载。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum Payload {
    Request {
        message: String,
        args: Vec<Value>,
        #[serde(default)]
        headers: Headers,
    },
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<CallError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default)]
        headers: Headers,
    },
}

/// Transport 实际承载的单元：调用标识加负载。
///
/// 可序列化，具体编码（JSON、二进制等）由传输实现自行选择。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: CallId,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Packet {
    pub fn request(id: CallId, message: impl Into<String>, args: Vec<Value>, headers: Headers) -> Self {
        Self {
            id,
            payload: Payload::Request {
                message: message.into(),
                args,
                headers,
            },
        }
    }

    pub fn response(
        id: CallId,
        error: Option<CallError>,
        result: Option<Value>,
        headers: Headers,
    ) -> Self {
        Self {
            id,
            payload: Payload::Response {
                error,
                result,
                headers,
            },
        }
    }

    pub fn direction(&self) -> Direction {
        match self.payload {
            Payload::Request { .. } => Direction::Request,
            Payload::Response { .. } => Direction::Response,
        }
    }
}

/// 线路协作者合约。
///
/// # 契约维度速览
/// - **绑定**：Channel 打开时调用一次 `bind`，传入的 [`Delivery`] 用于把对端报文交回 Channel；
/// - **发送**：`send` 可以同步投递（回调可能在 `send` 返回前触发），也可以排队异步投递；
///   返回 `Err` 表示报文未被接受，Channel 会据此立即失败对应调用；
/// - **关闭**：Channel 关闭时调用 `close`，实现应释放后台任务等资源，默认空操作。
pub trait Transport: Send + Sync + 'static {
    fn bind(&self, delivery: Delivery);

    fn send(&self, packet: Packet) -> Result<()>;

    fn close(&self) {}
}

/// 入站投递句柄，弱引用 Channel，避免 Transport 与 Channel 互相持有。
#[derive(Clone)]
pub struct Delivery {
    channel: Weak<ChannelInner>,
}

impl Delivery {
    /// 投递一个入站报文；Channel 已释放或已关闭时返回 `false`，报文被丢弃。
    pub fn deliver(&self, packet: Packet) -> bool {
        match self.channel.upgrade() {
            Some(inner) => Channel { inner }.deliver(packet),
            None => false,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("attached", &(self.channel.strong_count() > 0))
            .finish()
    }
}

/// Channel 状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Open,
    Closed,
}

/// 服务端入站分发入口，由 [`Server`] 实现。
pub(crate) trait Dispatch: Send + Sync + 'static {
    /// 单向消息的 `route` 由实现方直接丢弃，不产生任何响应报文。
    fn dispatch(&self, route: ReplyRoute, message: String, args: Vec<Value>, headers: Headers);
}

pub(crate) type PendingReply = Box<dyn FnOnce(Result<WrappedResponse>) + Send + Sync + 'static>;

/// Client 与 Server 之间的双工链路。
///
/// # 教案式说明
/// - **意图 (Why)**：隔离“调用关联”与“字节搬运”两类职责，使同一套分发内核可以运行在
///   进程内回环、异步队列乃至真实网络之上；
/// - **结构 (How)**：`closed` 原子位 + 单调递增的调用标识 + 分片等待表；入站请求交给绑定的
///   Server，入站响应按标识取出等待者并唤醒；
/// - **契约 (What)**：克隆体共享同一状态；`close` 之后 `state()` 恒为 [`ChannelState::Closed`]；
/// - **风险 (Trade-offs)**：等待者只按标识关联，不校验响应来源，Transport 需保证标识不被伪造。
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    closed: AtomicBool,
    next_id: AtomicU64,
    pending: DashMap<CallId, PendingReply>,
    inbound: Arc<dyn Dispatch>,
    transport: Arc<dyn Transport>,
}

impl Channel {
    /// 以给定 Transport 为 Server 打开一条 Channel。
    pub fn open<T>(server: &Server, transport: T) -> Self
    where
        T: Transport,
    {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let inner = Arc::new(ChannelInner {
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            inbound: Arc::new(server.clone()),
            transport: Arc::clone(&transport),
        });
        transport.bind(Delivery {
            channel: Arc::downgrade(&inner),
        });
        debug!(protocol = server.protocol().name(), "channel opened");
        Self { inner }
    }

    /// 打开 Channel 并把它挂载到 Client 上。
    pub fn between<T>(client: &Client, server: &Server, transport: T) -> Self
    where
        T: Transport,
    {
        let channel = Self::open(server, transport);
        client.attach(&channel);
        channel
    }

    /// 进程内同步回环链路。
    ///
    /// ```rust
    /// use spark_dispatch::{Channel, ChannelState, Client, Protocol, Server};
    ///
    /// let protocol = Protocol::new("Empty");
    /// let server = Server::new(protocol.clone());
    /// let client = Client::new(protocol);
    /// let channel = Channel::in_memory(&client, &server);
    /// assert_eq!(channel.state(), ChannelState::Open);
    /// assert!(channel.close());
    /// assert!(!channel.close());
    /// ```
    pub fn in_memory(client: &Client, server: &Server) -> Self {
        Self::between(client, server, MemoryTransport::new())
    }

    pub fn state(&self) -> ChannelState {
        if self.inner.closed.load(Ordering::Acquire) {
            ChannelState::Closed
        } else {
            ChannelState::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// 等待响应的调用数量。
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// 关闭 Channel；返回 `true` 表示本次调用完成了状态跃迁。
    ///
    /// 关闭时刻的全部等待者以 `CHANNEL_CLOSED` 失败，随后通知 Transport 释放资源。
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let ids: Vec<CallId> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0usize;
        for id in ids {
            if let Some((_, reply)) = self.inner.pending.remove(&id) {
                failed += 1;
                reply(Err(CallError::channel_closed()));
            }
        }
        self.inner.transport.close();
        info!(failed_calls = failed, "channel closed");
        true
    }

    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn allocate_id(&self) -> CallId {
        CallId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// 登记等待者并发送请求。
    ///
    /// 返回 `Err` 时 `reply` 未被调用，调用方自行处理失败；返回 `Ok` 时 `reply` 保证至多调用一次
    /// （可能已在本函数返回前被调用）。
    pub(crate) fn send_request(&self, packet: Packet, reply: PendingReply) -> Result<()> {
        let id = packet.id;
        self.inner.pending.insert(id, reply);
        // 与 close 的排空竞争：谁先移出条目谁负责唤醒。
        if self.inner.closed.load(Ordering::Acquire) {
            return match self.inner.pending.remove(&id) {
                Some(_) => Err(CallError::channel_closed()),
                None => Ok(()),
            };
        }
        if let Err(error) = self.inner.transport.send(packet) {
            return match self.inner.pending.remove(&id) {
                Some(_) => Err(error),
                None => Ok(()),
            };
        }
        Ok(())
    }

    /// 发送不等待响应的请求。
    pub(crate) fn send_one_way(&self, packet: Packet) -> Result<()> {
        if !self.is_open() {
            return Err(CallError::channel_closed());
        }
        self.inner.transport.send(packet)
    }

    /// 放弃等待：迟到的响应将被丢弃。
    pub(crate) fn forget(&self, id: CallId) -> bool {
        self.inner.pending.remove(&id).is_some()
    }

    fn deliver(&self, packet: Packet) -> bool {
        if !self.is_open() {
            debug!(call_id = %packet.id, direction = ?packet.direction(), "packet dropped on closed channel");
            return false;
        }
        let Packet { id, payload } = packet;
        match payload {
            Payload::Request {
                message,
                args,
                headers,
            } => {
                let route = ReplyRoute {
                    channel: self.clone(),
                    id,
                };
                self.inner.inbound.dispatch(route, message, args, headers);
            }
            Payload::Response {
                error,
                result,
                mut headers,
            } => match self.inner.pending.remove(&id) {
                Some((_, reply)) => {
                    let mut response = WrappedResponse::default();
                    response.set_error(error);
                    response.set_result(result);
                    response.headers_mut().merge(std::mem::take(&mut headers));
                    reply(Ok(response));
                }
                None => warn!(call_id = %id, "late response ignored"),
            },
        }
        true
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

/// 服务端回复路径：把一次入站调用的结果送回对端。
pub(crate) struct ReplyRoute {
    channel: Channel,
    id: CallId,
}

impl ReplyRoute {
    pub(crate) fn id(&self) -> CallId {
        self.id
    }

    /// 发送响应；Channel 已关闭时静默丢弃。
    pub(crate) fn send(self, error: Option<CallError>, result: Option<Value>, headers: Headers) {
        if !self.channel.is_open() {
            debug!(call_id = %self.id, "response dropped on closed channel");
            return;
        }
        let packet = Packet::response(self.id, error, result, headers);
        if let Err(error) = self.channel.inner.transport.send(packet) {
            warn!(call_id = %self.id, code = %error.code(), "transport refused response");
        }
    }
}
