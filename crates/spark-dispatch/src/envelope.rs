use std::{collections::BTreeMap, fmt, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::CallError, message::Message};

/// 随调用跨线传播的字符串键头部表。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Bytes>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入头部，返回被覆盖的旧值。
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Option<Bytes> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.0.get(key)
    }

    /// 以 UTF-8 文本读取头部；非法编码视为缺失。
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|value| core::str::from_utf8(value).ok())
    }

    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// 合并另一张头部表，同名键以 `other` 为准。
    pub fn merge(&mut self, other: Headers) {
        self.0.extend(other.0);
    }
}

/// 请求侧载体（wreq）：消息引用、位置参数与请求头。
#[derive(Clone, Debug)]
pub struct WrappedRequest {
    message: Arc<Message>,
    args: Vec<Value>,
    headers: Headers,
}

impl WrappedRequest {
    pub fn new(message: Arc<Message>, args: Vec<Value>, headers: Headers) -> Self {
        Self {
            message,
            args,
            headers,
        }
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut Vec<Value> {
        &mut self.args
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

/// 响应侧载体（wres）：错误槽、结果与响应头。
///
/// 下行分发完成后，`error` 与 `result` 恰有其一被赋值；单向消息两者皆空。
#[derive(Clone, Debug, Default)]
pub struct WrappedResponse {
    error: Option<CallError>,
    result: Option<Value>,
    headers: Headers,
}

impl WrappedResponse {
    pub fn error(&self) -> Option<&CallError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: Option<CallError>) {
        self.error = error;
    }

    pub fn take_error(&mut self) -> Option<CallError> {
        self.error.take()
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, result: Option<Value>) {
        self.result = result;
    }

    pub fn take_result(&mut self) -> Option<Value> {
        self.result.take()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// 以一次成功或失败的分发结果覆盖错误槽与结果槽。
    pub(crate) fn settle(&mut self, outcome: Result<Option<Value>, CallError>) {
        match outcome {
            Ok(result) => {
                self.error = None;
                self.result = result;
            }
            Err(error) => {
                self.error = Some(error);
                self.result = None;
            }
        }
    }
}

/// 一次调用独占的 wreq/wres 载体对。
///
/// # 教案式说明
/// - **意图 (Why)**：中间件的下行与上行处理可能分散在不同线程、不同时间点执行，
///   载体必须能被多个续延共享，同时对外表现为“同一份可变状态”；
/// - **结构 (How)**：内部以 `Arc` 共享两把互斥锁，消息引用单独存放以免读取时加锁；
/// - **契约 (What)**：`request`/`response` 闭包执行期间持有对应锁，闭包内不得再次访问同一
///   `Envelope`，否则会死锁；便捷方法（如 [`Envelope::set_error`]）各自只短暂持锁；
/// - **风险 (Trade-offs)**：克隆成本为一次引用计数递增，但克隆体与原件共享状态。
#[derive(Clone)]
pub struct Envelope {
    inner: Arc<EnvelopeInner>,
}

struct EnvelopeInner {
    message: Arc<Message>,
    request: Mutex<WrappedRequest>,
    response: Mutex<WrappedResponse>,
}

impl Envelope {
    pub fn new(request: WrappedRequest) -> Self {
        Self {
            inner: Arc::new(EnvelopeInner {
                message: Arc::clone(&request.message),
                request: Mutex::new(request),
                response: Mutex::new(WrappedResponse::default()),
            }),
        }
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.inner.message
    }

    /// 在持锁状态下读写请求侧载体。
    pub fn request<R>(&self, f: impl FnOnce(&mut WrappedRequest) -> R) -> R {
        f(&mut self.inner.request.lock())
    }

    /// 在持锁状态下读写响应侧载体。
    pub fn response<R>(&self, f: impl FnOnce(&mut WrappedResponse) -> R) -> R {
        f(&mut self.inner.response.lock())
    }

    /// 当前错误槽的快照。
    pub fn error(&self) -> Option<CallError> {
        self.inner.response.lock().error.clone()
    }

    pub fn set_error(&self, error: Option<CallError>) {
        self.inner.response.lock().error = error;
    }

    /// 清空错误槽并返回原值，重试中间件据此“吞掉”一次失败。
    pub fn clear_error(&self) -> Option<CallError> {
        self.inner.response.lock().error.take()
    }

    pub fn result(&self) -> Option<Value> {
        self.inner.response.lock().result.clone()
    }

    pub fn request_header(&self, key: &str) -> Option<Bytes> {
        self.inner.request.lock().headers.get(key).cloned()
    }

    pub fn set_request_header(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.inner.request.lock().headers.insert(key, value);
    }

    pub fn response_header(&self, key: &str) -> Option<Bytes> {
        self.inner.response.lock().headers.get(key).cloned()
    }

    pub fn set_response_header(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.inner.response.lock().headers.insert(key, value);
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.inner.message.name())
            .field("request", &*self.inner.request.lock())
            .field("response", &*self.inner.response.lock())
            .finish()
    }
}
