//! # server 模块说明
//!
//! ## 角色定位（Why）
//! - Server 独占一套中间件栈与 Handler 注册表，把经 Channel 到达的请求送入洋葱流水线，
//!   在终端步骤调用绑定的 Handler，并把结果回送给对端；
//! - 注册表与中间件栈在装配期写入、分发期只读共享，任意数量的调用可以同时在途。
//!
//! ## 契约（What）
//! - `use_middleware` 与 `on_message().bind(..)` 的先后顺序不影响流水线结构：中间件总是包裹全部 Handler；
//! - 同名消息重复绑定时后者生效；
//! - 未绑定 Handler 的消息在终端步骤以 `NOT_IMPLEMENTED` 失败，并照常经过上行回溯；
//! - 单向消息不回送任何响应。

use std::{collections::HashMap, fmt, sync::Arc};

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    channel::{Dispatch, ReplyRoute},
    config::PipelineConfig,
    envelope::{Envelope, Headers, WrappedRequest},
    error::{CallError, Result},
    message::{Message, Protocol},
    pipeline::{self, Middleware, MiddlewareStack, Resume, Terminal},
};

/// 消息处理器。
///
/// 处理器必须通过 [`Responder`] 给出结论；`Responder` 可以被移动到其他线程或任务中稍后完成。
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, call: InboundCall, responder: Responder);
}

impl<F> Handler for F
where
    F: Fn(InboundCall, Responder) + Send + Sync + 'static,
{
    fn handle(&self, call: InboundCall, responder: Responder) {
        self(call, responder)
    }
}

/// 交给 Handler 的入站调用：已补齐默认值的参数与请求头快照。
#[derive(Clone, Debug)]
pub struct InboundCall {
    message: Arc<Message>,
    args: Vec<Value>,
    headers: Headers,
}

impl InboundCall {
    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// 按位置读取参数。
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn into_args(self) -> Vec<Value> {
        self.args
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Handler 的完成回调 `(err?, result)`。
///
/// # 契约说明（What）
/// - `reply`/`fail`/`complete` 消费自身，保证结论至多给出一次；
/// - 单向消息的结果值被丢弃，错误仍会进入上行回溯供服务端中间件观察；
/// - 双向消息的 `Responder` 未给出结论即被释放时，调用以 `INTERNAL_ERROR` 结束，
///   调用方不会因为 Handler 的遗漏而无限等待。
pub struct Responder {
    envelope: Envelope,
    resume: Option<Resume>,
    one_way: bool,
}

impl Responder {
    /// 以成功结果完成。
    pub fn reply(self, result: Value) {
        self.complete(Ok(result));
    }

    /// 以错误完成；业务错误请使用 [`CallError::application`] 携带业务码。
    pub fn fail(self, error: CallError) {
        self.complete(Err(error));
    }

    pub fn complete(mut self, outcome: Result<Value>) {
        let outcome = if self.one_way {
            outcome.map(|_| None)
        } else {
            outcome.map(Some)
        };
        self.envelope.response(|wres| wres.settle(outcome));
        if let Some(resume) = self.resume.take() {
            resume.resume();
        }
    }

    /// 写入响应头，随响应回送给调用方。
    pub fn set_header(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.envelope.set_response_header(key, value);
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        let Some(resume) = self.resume.take() else {
            return;
        };
        if !self.one_way {
            warn!(
                method = self.envelope.message().name(),
                "responder dropped without a reply"
            );
            self.envelope.response(|wres| {
                wres.settle(Err(CallError::internal(
                    "handler dropped its responder without replying",
                )))
            });
        }
        resume.resume();
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("message", &self.envelope.message().name())
            .field("one_way", &self.one_way)
            .field("completed", &self.resume.is_none())
            .finish()
    }
}

/// 服务端：中间件栈 + Handler 注册表。
///
/// ```rust
/// use serde_json::json;
/// use spark_dispatch::{Message, Parameter, Protocol, Server};
///
/// let protocol = Protocol::new("Math").with_message(
///     Message::new("add")
///         .param(Parameter::required("a", "int"))
///         .param(Parameter::required("b", "int")),
/// );
/// let server = Server::new(protocol);
/// server
///     .on_message()
///     .bind("add", |call, responder| {
///         let sum = call.args().iter().filter_map(|v| v.as_i64()).sum::<i64>();
///         responder.reply(json!(sum));
///     })
///     .unwrap();
/// assert!(server.on_message().is_bound("add"));
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    protocol: Arc<Protocol>,
    stack: MiddlewareStack,
    handlers: ArcSwap<HashMap<String, Arc<dyn Handler>>>,
    config: PipelineConfig,
}

impl Server {
    pub fn new(protocol: Protocol) -> Self {
        Self::with_config(protocol, PipelineConfig::default())
    }

    pub fn with_config(protocol: Protocol, config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                protocol: Arc::new(protocol),
                stack: MiddlewareStack::new(),
                handlers: ArcSwap::from_pointee(HashMap::new()),
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

    /// 追加中间件到服务端栈尾；对之后开始的每一次分发生效。
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

    /// 返回 Handler 注册器。
    pub fn on_message(&self) -> Registrar<'_> {
        Registrar { server: self }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bound: Vec<String> = self.inner.handlers.load().keys().cloned().collect();
        bound.sort();
        f.debug_struct("Server")
            .field("protocol", &self.inner.protocol.name())
            .field("middleware", &self.inner.stack)
            .field("handlers", &bound)
            .finish()
    }
}

/// Handler 注册器：按协议声明的消息名绑定处理器。
#[derive(Debug)]
pub struct Registrar<'a> {
    server: &'a Server,
}

impl<'a> Registrar<'a> {
    /// 以闭包绑定 Handler；消息名未在协议中声明时返回 `INVALID_REQUEST`。
    pub fn bind<F>(&self, message: &str, handler: F) -> Result<&Self>
    where
        F: Fn(InboundCall, Responder) + Send + Sync + 'static,
    {
        self.bind_handler(message, Arc::new(handler))
    }

    pub fn bind_handler(&self, message: &str, handler: Arc<dyn Handler>) -> Result<&Self> {
        if self.server.inner.protocol.message(message).is_none() {
            return Err(CallError::invalid_request(format!(
                "protocol `{}` declares no message `{message}`",
                self.server.inner.protocol.name()
            )));
        }
        let name = message.to_owned();
        self.server.inner.handlers.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(name.clone(), Arc::clone(&handler));
            next
        });
        debug!(method = message, "handler bound");
        Ok(self)
    }

    pub fn is_bound(&self, message: &str) -> bool {
        self.server.inner.handlers.load().contains_key(message)
    }
}

/// 终端步骤：查找并调用 Handler。
struct HandlerTerminal {
    server: Server,
}

impl Terminal for HandlerTerminal {
    fn dispatch(&self, envelope: &Envelope, resume: Resume) {
        let message = Arc::clone(envelope.message());
        let handler = self.server.inner.handlers.load().get(message.name()).cloned();
        let Some(handler) = handler else {
            warn!(method = message.name(), code = "NOT_IMPLEMENTED", "no handler bound");
            envelope.response(|wres| wres.settle(Err(CallError::not_implemented(message.name()))));
            resume.resume();
            return;
        };
        let (args, headers) = envelope.request(|wreq| (wreq.args().to_vec(), wreq.headers().clone()));
        let one_way = message.is_one_way();
        let call = InboundCall {
            message,
            args,
            headers,
        };
        let responder = Responder {
            envelope: envelope.clone(),
            resume: Some(resume),
            one_way,
        };
        handler.handle(call, responder);
    }
}

impl Dispatch for Server {
    fn dispatch(&self, route: ReplyRoute, message: String, args: Vec<Value>, headers: Headers) {
        let call_id = route.id();
        let Some(declared) = self.inner.protocol.message(&message).cloned() else {
            warn!(method = %message, %call_id, code = "NOT_IMPLEMENTED", "unknown message");
            route.send(Some(CallError::not_implemented(&message)), None, Headers::new());
            return;
        };
        let one_way = declared.is_one_way();
        let args = match declared.resolve_arguments(args) {
            Ok(args) => args,
            Err(error) => {
                debug!(method = %message, %call_id, code = %error.code(), "request rejected");
                if !one_way {
                    route.send(Some(error), None, Headers::new());
                }
                return;
            }
        };
        debug!(method = %message, %call_id, "dispatching inbound call");

        let envelope = Envelope::new(WrappedRequest::new(declared, args, headers));
        let terminal = Arc::new(HandlerTerminal {
            server: self.clone(),
        });
        let completed = envelope.clone();
        pipeline::run(
            self.inner.stack.snapshot(),
            envelope,
            terminal,
            self.inner.config,
            move || {
                if one_way {
                    return;
                }
                let (error, result, headers) = completed.response(|wres| {
                    (
                        wres.take_error(),
                        wres.take_result(),
                        std::mem::take(wres.headers_mut()),
                    )
                });
                route.send(error, result, headers);
            },
        );
    }
}
