#![deny(unsafe_code)]
#![doc = r#"
# spark-dispatch

## 设计动机（Why）
- **定位**：协议无关的 RPC 调用分发内核。负责一次远程调用从发起到结论的完整生命周期：
  参数默认值补齐、洋葱模型中间件、请求/响应关联、截止取消与双层错误上报；
- **边界**：Schema 描述（[`Protocol`]）与线路（[`Transport`]）都是外部协作者，
  内核不做类型校验，也不规定任何字节格式。

## 核心契约（What）
- **洋葱顺序**：栈 `[m1..mk]` 包裹终端步骤时，观察顺序严格为 `m1..mk, 终端, mk..m1`；
- **可重入续延**：[`Next`] 可以顺序地多次推进，每次重新运行其全部下游，重试中间件据此实现；
- **恰好一次**：每次调用的回调恰好触发一次，响应、截止到期与 Channel 关闭之间先到者生效；
- **双层错误**：[`CallError`] 同时携带框架码 [`ErrorCode`] 与可选的业务码。

## 实现策略（How）
- 续延以显式函数值表达，不依赖协程或特定运行时；
- 中间件栈与 Handler 注册表使用 `arc-swap` 保存不可变快照，装配期写、分发期无锁读；
- 等待中的调用保存在 `dashmap` 分片表中，不同调用互不阻塞；
- `runtime-tokio` 特性提供真实时钟截止触发器（[`timer::expire_after`]）与异步排队传输。

## 风险与考量（Trade-offs）
- 同步传输下，回调可能在发起调用的栈帧内触发，调用方不应在回调中持有发起时的锁；
- 重入次数默认不设上限，可通过 [`PipelineConfig::proceed_limit`] 配置安全阈值。
"#]

pub mod channel;
pub mod client;
pub mod config;
pub mod deadline;
pub mod envelope;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod server;
#[cfg(feature = "runtime-tokio")]
pub mod timer;
pub mod transport;

pub use channel::{CallId, Channel, ChannelState, Delivery, Direction, Packet, Payload, Transport};
pub use client::{CallOutcome, Client, Invoker};
pub use config::PipelineConfig;
pub use deadline::{Deadline, ListenerId};
pub use envelope::{Envelope, Headers, WrappedRequest, WrappedResponse};
pub use error::{CallError, ErrorCode, Result};
pub use message::{Message, Parameter, Protocol};
pub use pipeline::{FnMiddleware, Middleware, MiddlewareStack, Next, Resume, UpstreamHandler, from_fn};
pub use server::{Handler, InboundCall, Registrar, Responder, Server};
pub use transport::MemoryTransport;
#[cfg(feature = "runtime-tokio")]
pub use transport::QueuedTransport;
