//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 调用最终回调只接收一种错误形态：[`CallError`]。它同时承载框架层错误码与应用层业务码，
//!   让调用方无需解析字符串即可区分“分发机制失败”与“业务逻辑拒绝”。
//!
//! ## 设计要求（What）
//! - 框架层 `code` 始终存在，取值来自固定枚举 [`ErrorCode`]；
//! - 应用层 `application_code` 仅在错误源自 Handler 或中间件业务逻辑时出现；
//! - 错误可克隆、可序列化，以便跨越 Channel 原样抵达对端。

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 框架层错误码。
///
/// # 教案式说明
/// - **意图 (Why)**：把分发机制自身能产生的失败收敛到有限集合，调用方可据此做确定性处置；
/// - **契约 (What)**：线上表示为 `SCREAMING_SNAKE_CASE` 字符串（如 `DEADLINE_EXPIRED`），
///   与 [`ErrorCode::as_str`] 保持一致；`ApplicationError` 是所有应用层错误共享的框架码；
/// - **风险 (Trade-offs)**：枚举标记为 `#[non_exhaustive]`，下游匹配需保留通配分支。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    /// 截止令牌在调用解析前到期。
    DeadlineExpired,
    /// 在已关闭（或调用期间关闭）的 Channel 上收发。
    ChannelClosed,
    /// 服务端没有为该消息绑定 Handler。
    NotImplemented,
    /// 调用参数或消息名不符合协议声明。
    InvalidRequest,
    /// 分发机制内部故障，例如 Handler 丢弃应答器、重入次数超限。
    InternalError,
    /// 错误源自业务逻辑，具体业务码见 [`CallError::application_code`]。
    ApplicationError,
}

impl ErrorCode {
    /// 返回稳定的字符串表示。
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::DeadlineExpired => "DEADLINE_EXPIRED",
            ErrorCode::ChannelClosed => "CHANNEL_CLOSED",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ApplicationError => "APPLICATION_ERROR",
        }
    }

    /// 是否由分发机制本身产生。
    pub const fn is_framework(self) -> bool {
        !matches!(self, ErrorCode::ApplicationError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调用错误：框架码与应用码并存的双层错误。
///
/// # 设计背景（Why）
/// - 框架错误（截止、通道关闭、未实现）由核心机制生成，从不被核心自动重试；
/// - 应用错误由 Handler 或中间件抛出，核心只负责原样传递并在 `application_code` 上保留业务码。
///
/// # 契约说明（What）
/// - `code`：始终存在的框架码；
/// - `application_code`：业务码，仅应用错误携带；
/// - `message`：面向排障人员的描述，不参与任何判定逻辑。
///
/// # 风险提示（Trade-offs）
/// - 允许以 [`CallError::framework`] 构造 `ApplicationError` 码而不带业务码，此时
///   [`CallError::is_application`] 仍返回 `true`。
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct CallError {
    code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    application_code: Option<String>,
    message: String,
}

impl CallError {
    /// 构造框架层错误。
    pub fn framework(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            application_code: None,
            message: message.into(),
        }
    }

    /// 构造携带业务码的应用层错误。
    ///
    /// ```rust
    /// use spark_dispatch::{CallError, ErrorCode};
    ///
    /// let err = CallError::application("INSUFFICIENT_FUNDS", "balance too low");
    /// assert_eq!(err.code(), ErrorCode::ApplicationError);
    /// assert_eq!(err.application_code(), Some("INSUFFICIENT_FUNDS"));
    /// ```
    pub fn application(application_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ApplicationError,
            application_code: Some(application_code.into()),
            message: message.into(),
        }
    }

    pub fn deadline_expired() -> Self {
        Self::framework(ErrorCode::DeadlineExpired, "deadline expired before the call resolved")
    }

    pub fn channel_closed() -> Self {
        Self::framework(ErrorCode::ChannelClosed, "channel is closed")
    }

    pub fn not_implemented(message_name: &str) -> Self {
        Self::framework(
            ErrorCode::NotImplemented,
            format!("no handler bound for message `{message_name}`"),
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::framework(ErrorCode::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::framework(ErrorCode::InternalError, message)
    }

    /// 框架层错误码。
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// 业务码（仅应用错误）。
    pub fn application_code(&self) -> Option<&str> {
        self.application_code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 是否为分发机制产生的错误。
    pub fn is_framework(&self) -> bool {
        self.code.is_framework()
    }

    /// 是否为业务逻辑产生的错误。
    pub fn is_application(&self) -> bool {
        !self.is_framework()
    }
}

/// 统一返回值别名，默认错误类型为 [`CallError`]。
pub type Result<T, E = CallError> = core::result::Result<T, E>;
