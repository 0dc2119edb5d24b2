use serde::{Deserialize, Serialize};

/// 流水线运行参数。
///
/// # 教案式说明
/// - **意图（Why）**：中间件可以多次调用 `proceed` 实现重试，核心本身不限制次数；
///   对于不信任第三方中间件的部署，可以配置一个安全上限，防止失控的重入循环。
/// - **契约（What）**：
///   - `proceed_limit = None`（默认）：不设上限；
///   - `proceed_limit = Some(n)`：同一中间件在一次流水线运行中的第 `n + 1` 次 `proceed`
///     不再向下游推进，而是以 `INTERNAL_ERROR` 直接进入上行回溯。
/// - **风险提示（Trade-offs）**：上限按“每个中间件、每次运行”计数，外层中间件的每次重试
///   都会为内层重新计数。
///
/// ```rust
/// use spark_dispatch::PipelineConfig;
///
/// let config: PipelineConfig = serde_json::from_str(r#"{"proceed_limit": 3}"#).unwrap();
/// assert_eq!(config.proceed_limit, Some(3));
/// assert_eq!(PipelineConfig::default().proceed_limit, None);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub proceed_limit: Option<usize>,
}

impl PipelineConfig {
    /// 不限制重入次数的配置。
    pub const fn unbounded() -> Self {
        Self {
            proceed_limit: None,
        }
    }

    pub const fn with_proceed_limit(limit: usize) -> Self {
        Self {
            proceed_limit: Some(limit),
        }
    }
}
