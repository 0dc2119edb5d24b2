//! # message 模块说明
//!
//! ## 角色定位（Why）
//! - 协议声明（消息名、参数、默认值、单向标记）由外部 Schema 协作者提供；
//!   分发内核只读取其中三类信息：参数默认值、单向标记以及用于分发的消息名。
//!
//! ## 设计要求（What）
//! - [`Message`] 创建后不可变，以 `Arc` 形式在调用间共享；
//! - 类型名仅作为不透明字符串保存，内核从不做类型校验；
//! - [`Protocol`] 支持以 JSON 文档加载，便于与既有 Schema 工具链对接。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{CallError, Result};

/// 消息参数声明。
///
/// `default` 为 `Some(Value::Null)` 表示“默认值为 null”，与“无默认值”（`None`）严格区分。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    #[serde(rename = "type")]
    type_name: Value,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    default: Option<Value>,
}

/// 字段一旦出现（即便为 `null`）即视为声明了默认值。
fn present_value<'de, D>(deserializer: D) -> core::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Parameter {
    /// 声明必填参数。
    pub fn required(name: impl Into<String>, type_name: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            default: None,
        }
    }

    /// 声明带默认值的可选参数。
    pub fn optional(name: impl Into<String>, type_name: impl Into<Value>, default: Value) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            default: Some(default),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 不透明的类型声明，原样保留 Schema 协作者给出的结构。
    pub fn type_name(&self) -> &Value {
        &self.type_name
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }
}

/// 单个远程操作的不可变描述。
///
/// # 教案式说明
/// - **意图 (Why)**：Client 与 Server 共享同一份声明，保证默认值补齐与单向语义两端一致；
/// - **契约 (What)**：`request` 保持声明顺序；`one_way` 为真时不产生任何响应；
/// - **风险 (Trade-offs)**：`response` 与 `errors` 仅作展示用途，内核不据此校验结果或错误。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip)]
    name: String,
    #[serde(default)]
    request: Vec<Parameter>,
    #[serde(default = "null_type")]
    response: Value,
    #[serde(default)]
    errors: Vec<Value>,
    #[serde(default, rename = "one-way")]
    one_way: bool,
}

fn null_type() -> Value {
    Value::from("null")
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request: Vec::new(),
            response: null_type(),
            errors: Vec::new(),
            one_way: false,
        }
    }

    /// 追加一个参数声明。
    pub fn param(mut self, parameter: Parameter) -> Self {
        self.request.push(parameter);
        self
    }

    pub fn response(mut self, type_name: impl Into<Value>) -> Self {
        self.response = type_name.into();
        self
    }

    /// 追加一个声明的错误种类。
    pub fn error(mut self, kind: impl Into<Value>) -> Self {
        self.errors.push(kind.into());
        self
    }

    pub fn one_way(mut self, one_way: bool) -> Self {
        self.one_way = one_way;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.request
    }

    pub fn response_type(&self) -> &Value {
        &self.response
    }

    pub fn declared_errors(&self) -> &[Value] {
        &self.errors
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    /// 将位置参数补齐为完整参数列表。
    ///
    /// # 契约说明（What）
    /// - **输入**：调用方给出的位置参数，可以省略尾部的可选参数；
    /// - **后置条件**：返回值长度等于参数声明数，省略项替换为声明的默认值；
    /// - **错误**：实参多于声明，或省略了没有默认值的参数时返回 `INVALID_REQUEST`。
    ///
    /// ```rust
    /// use serde_json::{Value, json};
    /// use spark_dispatch::{Message, Parameter};
    ///
    /// let message = Message::new("greet")
    ///     .param(Parameter::required("name", "string"))
    ///     .param(Parameter::optional("option", json!(["null", "string"]), Value::Null));
    /// let args = message.resolve_arguments(vec![json!("ann")]).unwrap();
    /// assert_eq!(args, vec![json!("ann"), Value::Null]);
    /// ```
    pub fn resolve_arguments(&self, mut args: Vec<Value>) -> Result<Vec<Value>> {
        if args.len() > self.request.len() {
            return Err(CallError::invalid_request(format!(
                "message `{}` takes {} argument(s) but {} were supplied",
                self.name,
                self.request.len(),
                args.len()
            )));
        }
        for parameter in &self.request[args.len()..] {
            match &parameter.default {
                Some(default) => args.push(default.clone()),
                None => {
                    return Err(CallError::invalid_request(format!(
                        "message `{}` is missing required argument `{}`",
                        self.name, parameter.name
                    )));
                }
            }
        }
        Ok(args)
    }
}

/// 协议：一组按名称索引的消息声明。
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(from = "ProtocolDocument")]
pub struct Protocol {
    name: String,
    messages: BTreeMap<String, Arc<Message>>,
}

/// Schema 协作者输出的 JSON 形态，消息名作为 `messages` 的键出现。
#[derive(Deserialize)]
struct ProtocolDocument {
    protocol: String,
    #[serde(default)]
    messages: BTreeMap<String, Message>,
}

impl From<ProtocolDocument> for Protocol {
    fn from(document: ProtocolDocument) -> Self {
        let messages = document
            .messages
            .into_iter()
            .map(|(name, mut message)| {
                message.name.clone_from(&name);
                (name, Arc::new(message))
            })
            .collect();
        Self {
            name: document.protocol,
            messages,
        }
    }
}

impl Protocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: BTreeMap::new(),
        }
    }

    /// 加入一条消息声明；同名声明后者覆盖前者。
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages
            .insert(message.name.clone(), Arc::new(message));
        self
    }

    /// 从 JSON 协议文档加载。
    pub fn from_json(document: &str) -> core::result::Result<Self, serde_json::Error> {
        serde_json::from_str(document)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self, name: &str) -> Option<&Arc<Message>> {
        self.messages.get(name)
    }

    pub fn messages(&self) -> impl Iterator<Item = &Arc<Message>> {
        self.messages.values()
    }
}
