//! # pipeline 模块说明
//!
//! ## 角色定位（Why）
//! - 以续延传递（CPS）方式实现洋葱模型：下行按注册顺序穿过中间件，抵达终端步骤
//!   （客户端发送或服务端 Handler），上行再按相反顺序回溯；
//! - 续延是显式的函数值（[`Next`]、[`Resume`]），不依赖任何运行时或协程，
//!   中间件可以在任意线程、任意时间点推进流水线。
//!
//! ## 执行模型（How）
//! - 第 `i` 个中间件收到的 [`Next`] 负责驱动 `i + 1..` 的全部下游；
//! - `Next::dispatch(err, upstream)`：`err` 为空则推进下游，否则写入错误槽并直接回溯；
//!   `upstream` 在下游全部完成后被调用，获得的 [`Resume`] 通往外层中间件的上行处理；
//! - `Next` 可以被多次调用（顺序、非并发），每次都重新运行其下游直至终端步骤，
//!   这正是重试中间件的实现基础。
//! - 推进与回溯经由线程内的蹦床（trampoline）执行：当前线程已有步骤在运行时，
//!   新的步骤排入队列，待当前步骤返回后再由最外层调用者依次取出执行。
//!   同步传输上的上千次重试因此不会逐层累积调用栈。
//!
//! ## 契约（What）
//! - 对于中间件栈 `[m1..mk]` 包裹的终端步骤，观察到的顺序严格为
//!   `m1-in .. mk-in, terminal, mk-out .. m1-out`；
//! - 每个 [`Resume`] 至多生效一次，重复调用被忽略并记录告警。

use std::{
    borrow::Cow,
    cell::RefCell,
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::warn;

use crate::{
    config::PipelineConfig,
    envelope::Envelope,
    error::CallError,
};

/// 上行处理函数：接收下游完成时错误槽的快照，以及通往外层的续延。
pub type UpstreamHandler = Box<dyn FnOnce(Option<CallError>, Resume) + Send + 'static>;

/// 中间件合约：观察并修改载体，在下行与上行两个方向上各获得一次介入机会。
///
/// # 契约维度速览
/// - **语义**：`handle` 必须最终调用 `next` 的某个推进方法，否则调用将停滞直至截止令牌到期；
/// - **并发**：同一实例被所有并发调用共享，需要 `Send + Sync`，内部状态自行同步；
/// - **重入**：允许对同一 `next` 多次推进，但必须等上一次的上行处理被调用后再发起下一次；
/// - **错误**：`next.fail(err)` 跳过剩余下游，错误原样进入上行回溯并最终抵达调用方。
///
/// # 风险提示（Trade-offs）
/// - 上行处理中清空错误而不重新推进下游，会让一个没有结果的调用“静默成功”，
///   这属于中间件实现者的责任。
pub trait Middleware: Send + Sync + 'static {
    /// 稳定标识，用于日志与排障。
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(core::any::type_name::<Self>())
    }

    /// 处理一次下行经过。
    fn handle(&self, envelope: &Envelope, next: Next);
}

/// 以闭包实现的中间件，由 [`from_fn`] 构造。
pub struct FnMiddleware<F> {
    name: Cow<'static, str>,
    f: F,
}

/// 将闭包包装为中间件。
///
/// ```rust
/// use spark_dispatch::pipeline::{Middleware, from_fn};
///
/// let tagging = from_fn(|envelope, next| {
///     envelope.set_request_header("x-tag", "demo");
///     next.proceed();
/// });
/// assert!(tagging.name().starts_with("fn"));
/// ```
pub fn from_fn<F>(f: F) -> FnMiddleware<F>
where
    F: Fn(&Envelope, Next) + Send + Sync + 'static,
{
    FnMiddleware {
        name: Cow::Borrowed("fn"),
        f,
    }
}

impl<F> FnMiddleware<F> {
    /// 为闭包中间件指定名称。
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&Envelope, Next) + Send + Sync + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn handle(&self, envelope: &Envelope, next: Next) {
        (self.f)(envelope, next)
    }
}

impl<M> Middleware for Arc<M>
where
    M: Middleware + ?Sized,
{
    fn name(&self) -> Cow<'static, str> {
        (**self).name()
    }

    fn handle(&self, envelope: &Envelope, next: Next) {
        (**self).handle(envelope, next)
    }
}

/// 中间件栈：插入顺序即执行顺序，只追加不删除。
///
/// # 教案式说明
/// - **意图 (Why)**：Client/Server 各自独占一个栈，安装期写入、分发期被大量并发调用只读共享；
/// - **结构 (How)**：以 [`ArcSwap`] 保存不可变快照，追加时复制并原子替换，
///   分发路径只需一次无锁加载；
/// - **契约 (What)**：每次调用在开始时取快照，之后的追加只影响后续调用；
/// - **风险 (Trade-offs)**：追加是 `O(n)` 复制，适合“装配期少量写、运行期大量读”的场景。
pub struct MiddlewareStack {
    entries: ArcSwap<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// 追加中间件到栈尾（最内层）。
    pub fn push(&self, middleware: Arc<dyn Middleware>) {
        self.entries.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&middleware));
            next
        });
    }

    /// 当前栈的不可变快照。
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn Middleware>>> {
        self.entries.load_full()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

impl Default for MiddlewareStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.load().iter().map(|entry| entry.name()))
            .finish()
    }
}

/// 流水线的终端步骤：客户端为“发送并等待响应”，服务端为“调用 Handler”。
///
/// 实现者完成后必须调用 `resume` 开启上行回溯（单向消息的客户端发送成功除外）。
pub(crate) trait Terminal: Send + Sync + 'static {
    fn dispatch(&self, envelope: &Envelope, resume: Resume);

    /// 某个中间件开始向下游推进（含重试）时的通知，先于对应步骤执行。
    fn on_descend(&self) {}
}

type Step = Box<dyn FnOnce() + 'static>;

thread_local! {
    /// 当前线程的待执行步骤；`None` 表示没有蹦床在运行。
    static TRAMPOLINE: RefCell<Option<VecDeque<Step>>> = const { RefCell::new(None) };
}

/// 在当前线程的蹦床上执行 `step`。
///
/// 已有蹦床在运行时只入队并立即返回；否则由本次调用充当蹦床，执行 `step`
/// 并排空其间产生的全部步骤后才返回，外部调用者因此仍然观察到同步完成。
fn schedule<F>(step: F)
where
    F: FnOnce() + 'static,
{
    let step = TRAMPOLINE.with(|cell| {
        let mut queue = cell.borrow_mut();
        match queue.as_mut() {
            Some(pending) => {
                pending.push_back(Box::new(step));
                None
            }
            None => {
                *queue = Some(VecDeque::new());
                Some(step)
            }
        }
    });
    let Some(step) = step else {
        return;
    };

    let _driving = Driving;
    step();
    while let Some(next) =
        TRAMPOLINE.with(|cell| cell.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    {
        next();
    }
}

/// 蹦床退出（含 panic 展开）时清空队列。
struct Driving;

impl Drop for Driving {
    fn drop(&mut self) {
        let abandoned = TRAMPOLINE.with(|cell| cell.borrow_mut().take());
        drop(abandoned);
    }
}

struct Run {
    stack: Arc<Vec<Arc<dyn Middleware>>>,
    envelope: Envelope,
    terminal: Arc<dyn Terminal>,
    config: PipelineConfig,
}

/// 启动一次流水线运行；`on_complete` 在最外层上行回溯结束后调用（至多一次）。
pub(crate) fn run<F>(
    stack: Arc<Vec<Arc<dyn Middleware>>>,
    envelope: Envelope,
    terminal: Arc<dyn Terminal>,
    config: PipelineConfig,
    on_complete: F,
) where
    F: FnOnce() + Send + 'static,
{
    let run = Arc::new(Run {
        stack,
        envelope,
        terminal,
        config,
    });
    drive(run, 0, Resume::new(on_complete));
}

fn drive(run: Arc<Run>, index: usize, done: Resume) {
    schedule(move || step(run, index, done));
}

fn step(run: Arc<Run>, index: usize, done: Resume) {
    match run.stack.get(index).cloned() {
        Some(middleware) => {
            let next = Next {
                run: Arc::clone(&run),
                index,
                done,
                proceeds: Arc::new(AtomicUsize::new(0)),
            };
            middleware.handle(&run.envelope, next);
        }
        None => run.terminal.dispatch(&run.envelope, done),
    }
}

/// 推进续延：交给第 `index` 个中间件，用来驱动其全部下游。
///
/// 克隆体共享同一个推进计数与外层续延，可被保存到上行处理中以便重试。
#[derive(Clone)]
pub struct Next {
    run: Arc<Run>,
    index: usize,
    done: Resume,
    proceeds: Arc<AtomicUsize>,
}

impl Next {
    /// 推进下游，不安装上行处理。
    pub fn proceed(&self) {
        self.dispatch(None, None);
    }

    /// 推进下游，并在下游全部完成后调用 `upstream`。
    pub fn proceed_then<F>(&self, upstream: F)
    where
        F: FnOnce(Option<CallError>, Resume) + Send + 'static,
    {
        self.dispatch(None, Some(Box::new(upstream)));
    }

    /// 以错误短路：跳过剩余下游，直接开始上行回溯。
    pub fn fail(&self, error: CallError) {
        self.dispatch(Some(error), None);
    }

    /// 通用推进入口，对应 `proceed(err?, upstreamHandler?)`。
    ///
    /// # 执行逻辑（How）
    /// 1. 计数本次推进；若超过配置上限，写入 `INTERNAL_ERROR` 并绕过本层上行处理，
    ///    直接交给外层续延，失控的重试循环因此无法继续；
    /// 2. 组装“下游完成后”的续延：有上行处理则先调用它，并把外层续延作为其 `Resume`；
    /// 3. 有错误则写入错误槽并立即回溯，否则驱动下一个中间件或终端步骤。
    pub fn dispatch(&self, error: Option<CallError>, upstream: Option<UpstreamHandler>) {
        let attempt = self.proceeds.fetch_add(1, Ordering::AcqRel) + 1;
        if let (None, Some(limit)) = (&error, self.run.config.proceed_limit) {
            if attempt > limit {
                let name = self
                    .run
                    .stack
                    .get(self.index)
                    .map(|middleware| middleware.name())
                    .unwrap_or(Cow::Borrowed("unknown"));
                warn!(middleware = %name, limit, "middleware exceeded proceed limit");
                self.run.envelope.set_error(Some(CallError::internal(format!(
                    "middleware `{name}` exceeded the proceed limit of {limit}"
                ))));
                self.done.clone().resume();
                return;
            }
        }

        let after = match upstream {
            Some(upstream) => {
                let envelope = self.run.envelope.clone();
                let done = self.done.clone();
                Resume::new(move || upstream(envelope.error(), done))
            }
            None => self.done.clone(),
        };

        match error {
            Some(error) => {
                self.run.envelope.set_error(Some(error));
                after.resume();
            }
            None => {
                self.run.terminal.on_descend();
                drive(Arc::clone(&self.run), self.index + 1, after);
            }
        }
    }

    /// 本次运行共享的载体。
    pub fn envelope(&self) -> &Envelope {
        &self.run.envelope
    }

    /// 已发起的推进次数（含本次之前的全部重试）。
    pub fn attempts(&self) -> usize {
        self.proceeds.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("attempts", &self.attempts())
            .finish()
    }
}

/// 上行续延：调用后继续向外层回溯。
///
/// 至多生效一次；克隆体共享同一槽位，任一克隆生效后其余调用均被忽略。
#[derive(Clone)]
pub struct Resume {
    slot: Arc<Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>>,
}

impl Resume {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// 继续上行回溯；外层观察到的错误即当前错误槽的内容。
    ///
    /// 槽位在调用时立即被取走，续延本身经蹦床执行。
    pub fn resume(self) {
        let continuation = self.slot.lock().take();
        match continuation {
            Some(continuation) => schedule(continuation),
            None => warn!("resume invoked more than once; ignoring the repeated call"),
        }
    }

    /// 是否已经生效。
    pub fn is_spent(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resume")
            .field("spent", &self.is_spent())
            .finish()
    }
}
