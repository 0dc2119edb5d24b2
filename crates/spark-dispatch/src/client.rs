//! # client 模块说明
//!
//! ## 角色定位（Why）
//! - Client 独占一套中间件栈，通过 [`Invoker`] 发起调用：补齐参数默认值、穿过下行栈、
//!   经 Channel 发送、等待响应，再沿上行栈回溯到调用方回调；
//! - 截止令牌与 Channel 关闭是仅有的两种取消手段，二者都与响应到达竞争，
//!   遵循“先到者生效，后到者丢弃”。
//!
//! ## 执行逻辑（How）
//! - 每次调用持有一个 `CallState`，保存一次性回调、在途发送计数与调用级截止监听；
//! - 终端步骤每次被推进（含重试）都会生成一个 `Attempt`：它是一次发送的结算点，
//!   响应、截止到期、Channel 关闭三者中第一个到达者结算它，其余被忽略；
//! - 截止到期时若有在途发送，由 `Attempt` 以 `DEADLINE_EXPIRED` 结算并走上行回溯；
//!   若调用仍停留在下行中间件中，调用级监听直接以 `DEADLINE_EXPIRED` 结束调用；
//!   若本轮发送已经得出结论、正在上行回溯，到期不再改写结论，由上行处理决定后续。
//!   中间件重新推进下游（重试）时，调用回到下行阶段。
//!
//! ## 契约（What）
//! - 调用方回调恰好触发一次；
//! - 单向消息在发送成功后立即以 `Ok(None)` 结束，不等待响应、不经过上行回溯；
//! - Channel 未挂载或已关闭时以 `CHANNEL_CLOSED` 失败。

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use futures::{FutureExt, channel::oneshot, future::BoxFuture};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    channel::{CallId, Channel, Packet},
    config::PipelineConfig,
    deadline::{Deadline, ListenerId},
    envelope::{Envelope, Headers, WrappedRequest, WrappedResponse},
    error::{CallError, Result},
    message::Protocol,
    pipeline::{self, Middleware, MiddlewareStack, Resume, Terminal},
};

/// 调用方回调收到的结论：成功时为响应值（单向消息恒为 `None`），失败时为 [`CallError`]。
pub type CallOutcome = Result<Option<Value>>;

type Callback = Box<dyn FnOnce(CallOutcome) + Send + 'static>;

/// 客户端：中间件栈 + 挂载的 Channel。
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    protocol: Arc<Protocol>,
    stack: MiddlewareStack,
    channel: ArcSwapOption<Channel>,
    config: PipelineConfig,
}

impl Client {
    pub fn new(protocol: Protocol) -> Self {
        Self::with_config(protocol, PipelineConfig::default())
    }

    pub fn with_config(protocol: Protocol, config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                protocol: Arc::new(protocol),
                stack: MiddlewareStack::new(),
                channel: ArcSwapOption::empty(),
                config,
            }),
        }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.inner.protocol
    }

    pub fn config(&self) -> PipelineConfig {
        self.inner.config
    }

    /// 追加中间件到客户端栈尾；对之后发起的每一次调用生效。
    pub fn use_middleware<M>(&self, middleware: M) -> &Self
    where
        M: Middleware,
    {
        self.inner.stack.push(Arc::new(middleware));
        self
    }

    pub fn middleware(&self) -> &MiddlewareStack {
        &self.inner.stack
    }

    /// 挂载 Channel；替换先前挂载的 Channel，已在途的调用不受影响。
    pub fn attach(&self, channel: &Channel) {
        self.inner.channel.store(Some(Arc::new(channel.clone())));
    }

    pub fn channel(&self) -> Option<Channel> {
        self.inner
            .channel
            .load_full()
            .map(|channel| Channel::clone(&channel))
    }

    /// 创建调用器；默认使用无限截止令牌、不附加调用级中间件。
    pub fn emit_message(&self) -> Invoker {
        Invoker {
            client: self.clone(),
            deadline: Deadline::infinite(),
            per_call: Vec::new(),
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("protocol", &self.inner.protocol.name())
            .field("middleware", &self.inner.stack)
            .field("channel", &self.channel())
            .finish()
    }
}

/// 调用器：绑定截止令牌与调用级中间件，按消息名发起调用。
///
/// # 契约说明（What）
/// - `with_deadline`：本调用器发起的调用受该令牌约束；
/// - `with_middleware`：作为最内层（最靠近发送）的中间件，仅作用于本调用器发起的调用；
/// - 同一调用器可以发起多次调用，它们共享截止令牌与调用级中间件实例。
///
/// ```rust
/// use serde_json::json;
/// use spark_dispatch::{Channel, Client, Message, Parameter, Protocol, Server};
///
/// let protocol = Protocol::new("Greeter")
///     .with_message(Message::new("greet").param(Parameter::required("name", "string")));
/// let server = Server::new(protocol.clone());
/// server
///     .on_message()
///     .bind("greet", |call, responder| {
///         let name = call.arg(0).and_then(|v| v.as_str()).unwrap_or_default().to_owned();
///         responder.reply(json!(format!("hello {name}")));
///     })
///     .unwrap();
/// let client = Client::new(protocol);
/// let _channel = Channel::in_memory(&client, &server);
///
/// let (tx, rx) = std::sync::mpsc::channel();
/// client.emit_message().call("greet", vec![json!("ann")], move |outcome| {
///     tx.send(outcome).unwrap();
/// });
/// assert_eq!(rx.recv().unwrap().unwrap(), Some(json!("hello ann")));
/// ```
#[derive(Clone)]
pub struct Invoker {
    client: Client,
    deadline: Deadline,
    per_call: Vec<Arc<dyn Middleware>>,
}

impl Invoker {
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_middleware<M>(mut self, middleware: M) -> Self
    where
        M: Middleware,
    {
        self.per_call.push(Arc::new(middleware));
        self
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// 发起调用，结论通过 `callback` 恰好送达一次。
    ///
    /// 消息名未声明或参数不符合声明时，`callback` 在当前线程上立即以 `INVALID_REQUEST` 触发，
    /// 不经过任何中间件。
    pub fn call<F>(&self, message: &str, args: Vec<Value>, callback: F)
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        let inner = &self.client.inner;
        let Some(declared) = inner.protocol.message(message).cloned() else {
            callback(Err(CallError::invalid_request(format!(
                "protocol `{}` declares no message `{message}`",
                inner.protocol.name()
            ))));
            return;
        };
        let args = match declared.resolve_arguments(args) {
            Ok(args) => args,
            Err(error) => {
                callback(Err(error));
                return;
            }
        };
        if self.deadline.is_expired() {
            callback(Err(CallError::deadline_expired()));
            return;
        }
        debug!(method = message, one_way = declared.is_one_way(), "emitting call");

        let state = Arc::new(CallState {
            message: message.to_owned(),
            callback: Mutex::new(Some(Box::new(callback))),
            in_flight: AtomicUsize::new(0),
            unwinding: AtomicBool::new(false),
            deadline: self.deadline.clone(),
            listener: Mutex::new(None),
        });
        let weak: Weak<CallState> = Arc::downgrade(&state);
        let listener = self.deadline.on_expire(move || {
            if let Some(state) = weak.upgrade() {
                if state.is_descending() {
                    state.finish(Err(CallError::deadline_expired()));
                }
            }
        });
        *state.listener.lock() = listener;
        if state.is_finished() {
            if let Some(id) = state.listener.lock().take() {
                self.deadline.remove_listener(id);
            }
            return;
        }

        let mut stack = Vec::clone(&inner.stack.snapshot());
        stack.extend(self.per_call.iter().cloned());

        let envelope = Envelope::new(WrappedRequest::new(declared, args, Headers::new()));
        let terminal = Arc::new(SendTerminal {
            client: self.client.clone(),
            state: Arc::clone(&state),
        });
        let completed = envelope.clone();
        pipeline::run(
            Arc::new(stack),
            envelope,
            terminal,
            inner.config,
            move || {
                let outcome = completed.response(|wres| match wres.take_error() {
                    Some(error) => Err(error),
                    None => Ok(wres.take_result()),
                });
                state.finish(outcome);
            },
        );
    }

    /// 异步外观：以 Future 形式返回调用结论，不依赖特定运行时。
    pub fn call_async(&self, message: &str, args: Vec<Value>) -> BoxFuture<'static, CallOutcome> {
        let (sender, receiver) = oneshot::channel();
        self.call(message, args, move |outcome| {
            let _ = sender.send(outcome);
        });
        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(CallError::internal("call was dropped before it resolved")))
        }
        .boxed()
    }
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoker")
            .field("deadline", &self.deadline)
            .field("per_call_middleware", &self.per_call.len())
            .finish()
    }
}

struct CallState {
    message: String,
    callback: Mutex<Option<Callback>>,
    in_flight: AtomicUsize,
    /// 最近一轮发送已得出结论，上行回溯尚未结束。
    unwinding: AtomicBool,
    deadline: Deadline,
    listener: Mutex<Option<ListenerId>>,
}

impl CallState {
    fn is_finished(&self) -> bool {
        self.callback.lock().is_none()
    }

    /// 调用仍处于下行阶段：没有在途发送，也没有等待回溯的结论。
    fn is_descending(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0 && !self.unwinding.load(Ordering::Acquire)
    }

    /// 本轮结论已写入载体，即将开始上行回溯。
    fn begin_unwind(&self) {
        self.unwinding.store(true, Ordering::Release);
    }

    /// 结束调用；只有第一次生效。
    fn finish(&self, outcome: CallOutcome) {
        let Some(callback) = self.callback.lock().take() else {
            return;
        };
        if let Some(id) = self.listener.lock().take() {
            self.deadline.remove_listener(id);
        }
        match &outcome {
            Ok(_) => debug!(method = %self.message, "call resolved"),
            Err(error) => debug!(
                method = %self.message,
                code = %error.code(),
                application_code = ?error.application_code(),
                "call failed"
            ),
        }
        callback(outcome);
    }
}

/// 终端步骤：经 Channel 发送请求。
struct SendTerminal {
    client: Client,
    state: Arc<CallState>,
}

impl Terminal for SendTerminal {
    fn on_descend(&self) {
        self.state.unwinding.store(false, Ordering::Release);
    }

    fn dispatch(&self, envelope: &Envelope, resume: Resume) {
        if self.state.deadline.is_expired() {
            self.state.begin_unwind();
            envelope.response(|wres| wres.settle(Err(CallError::deadline_expired())));
            resume.resume();
            return;
        }
        let channel = match self.client.inner.channel.load_full() {
            Some(channel) if channel.is_open() => Channel::clone(&channel),
            _ => {
                self.state.begin_unwind();
                envelope.response(|wres| wres.settle(Err(CallError::channel_closed())));
                resume.resume();
                return;
            }
        };

        let message = Arc::clone(envelope.message());
        let (args, headers) =
            envelope.request(|wreq| (wreq.args().to_vec(), wreq.headers().clone()));
        let id = channel.allocate_id();
        let packet = Packet::request(id, message.name(), args, headers);

        if message.is_one_way() {
            match channel.send_one_way(packet) {
                Ok(()) => self.state.finish(Ok(None)),
                Err(error) => {
                    self.state.begin_unwind();
                    envelope.response(|wres| wres.settle(Err(error)));
                    resume.resume();
                }
            }
            return;
        }

        let attempt = Attempt {
            inner: Arc::new(AttemptInner {
                id,
                envelope: envelope.clone(),
                resume: Mutex::new(Some(resume)),
                state: Arc::clone(&self.state),
                channel: channel.clone(),
                listener: Mutex::new(None),
            }),
        };
        self.state.in_flight.fetch_add(1, Ordering::AcqRel);

        let on_expire = attempt.clone();
        let listener = self.state.deadline.on_expire(move || {
            on_expire.inner.channel.forget(on_expire.inner.id);
            on_expire.settle(Err(CallError::deadline_expired()));
        });
        *attempt.inner.listener.lock() = listener;
        if attempt.is_settled() {
            // 登记前已被结算：结算时槽位为空，由这里负责注销。
            if let Some(id) = attempt.inner.listener.lock().take() {
                self.state.deadline.remove_listener(id);
            }
            return;
        }

        let on_reply = attempt.clone();
        let reply = Box::new(move |outcome: Result<WrappedResponse>| on_reply.settle(outcome));
        if let Err(error) = channel.send_request(packet, reply) {
            attempt.settle(Err(error));
        }
    }
}

/// 一次发送的结算点：响应、截止到期、Channel 关闭三者先到者生效。
#[derive(Clone)]
struct Attempt {
    inner: Arc<AttemptInner>,
}

struct AttemptInner {
    id: CallId,
    envelope: Envelope,
    resume: Mutex<Option<Resume>>,
    state: Arc<CallState>,
    channel: Channel,
    listener: Mutex<Option<ListenerId>>,
}

impl Attempt {
    fn is_settled(&self) -> bool {
        self.inner.resume.lock().is_none()
    }

    fn settle(&self, outcome: Result<WrappedResponse>) {
        let Some(resume) = self.inner.resume.lock().take() else {
            if outcome.is_ok() {
                warn!(call_id = %self.inner.id, "response arrived after the call was settled");
            }
            return;
        };
        let state = &self.inner.state;
        state.begin_unwind();
        state.in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Some(id) = self.inner.listener.lock().take() {
            state.deadline.remove_listener(id);
        }
        self.inner.envelope.response(|wres| match outcome {
            Ok(mut response) => {
                wres.set_error(response.take_error());
                wres.set_result(response.take_result());
                wres.headers_mut()
                    .merge(std::mem::take(response.headers_mut()));
            }
            Err(error) => wres.settle(Err(error)),
        });
        resume.resume();
    }
}
