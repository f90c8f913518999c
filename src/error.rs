use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token 服务错误类型
///
/// "未找到" 不是错误：查询类操作用 `Option` / `bool` 表达；
/// 淘汰事务冲突在存储层内部吸收，只记日志。
#[derive(Debug, Clone, Error)]
pub enum TokenError {
    /// 调用前置条件不满足（空 uid / clientId 等），属于调用方编程错误
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 存储后端错误（网络、协议、连接池）
    #[error("Backend error during {op}: {detail}")]
    Backend { op: String, detail: String },

    /// 存储后端单次调用超时
    #[error("Backend timeout during {op} ({millis}ms)")]
    Timeout { op: String, millis: u64 },

    /// 管理接口认证失败
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TokenError {
    pub fn backend(op: impl Into<String>, detail: impl ToString) -> Self {
        TokenError::Backend {
            op: op.into(),
            detail: detail.to_string(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        TokenError::InvalidArgument(msg.into())
    }

    /// 给后端错误附加调用上下文（操作名、uid、token 等）
    pub fn context(self, ctx: impl AsRef<str>) -> Self {
        match self {
            TokenError::Backend { op, detail } => TokenError::Backend {
                op: format!("{} > {}", ctx.as_ref(), op),
                detail,
            },
            TokenError::Timeout { op, millis } => TokenError::Timeout {
                op: format!("{} > {}", ctx.as_ref(), op),
                millis,
            },
            other => other,
        }
    }

    /// 是否属于 "服务不可用" 一类（应返回 503，而不是 "token 无效"）
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TokenError::Backend { .. } | TokenError::Timeout { .. })
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, TokenError>;

/// 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 参数错误
    InvalidArgument = 4001,
    /// 未授权
    Unauthorized = 4010,
    /// 存储错误
    Backend = 5000,
    /// 超时
    Timeout = 5001,
    /// 配置错误
    Configuration = 5002,
}

impl From<&TokenError> for ErrorCode {
    fn from(error: &TokenError) -> Self {
        match error {
            TokenError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            TokenError::Unauthorized(_) => ErrorCode::Unauthorized,
            TokenError::Backend { .. } => ErrorCode::Backend,
            TokenError::Timeout { .. } => ErrorCode::Timeout,
            TokenError::Configuration(_) => ErrorCode::Configuration,
        }
    }
}

/// 错误响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: u64,
}

impl ErrorResponse {
    pub fn new(error: &TokenError) -> Self {
        Self {
            code: ErrorCode::from(error),
            message: error.to_string(),
            timestamp: chrono::Utc::now().timestamp() as u64,
        }
    }
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        let status_code = match &self {
            TokenError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            TokenError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            TokenError::Backend { .. } | TokenError::Timeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            TokenError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if self.is_unavailable() {
            tracing::error!("存储后端不可用: {}", self);
        }

        (status_code, Json(ErrorResponse::new(&self))).into_response()
    }
}
