//! axum 提取器：从请求体中取出 token 并恢复会话

use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::reqres::{data_or_empty, ApiResponse, RawApiRequest, RawLoginRequest};
use crate::auth::{Token, TokenStore};
use crate::error::TokenError;

/// 提取失败
#[derive(Debug)]
pub enum ApiRejection {
    /// token 缺失 / 不存在 / 已过期，统一返回 HTTP 200 + `{"code":401,"data":{}}`
    TokenExpired,
    /// 请求体不是合法 JSON 或 `data` 类型不符
    BadRequest(String),
    /// 存储后端不可用
    Unavailable(TokenError),
}

impl IntoResponse for ApiRejection {
    fn into_response(self) -> Response {
        match self {
            ApiRejection::TokenExpired => ApiResponse::token_expired().into_response(),
            ApiRejection::BadRequest(msg) => TokenError::invalid(msg).into_response(),
            ApiRejection::Unavailable(error) => error.into_response(),
        }
    }
}

fn parse_data<T: DeserializeOwned>(data: Option<serde_json::Value>) -> Result<T, ApiRejection> {
    serde_json::from_value(data_or_empty(data))
        .map_err(|e| ApiRejection::BadRequest(format!("invalid data: {}", e)))
}

/// 带 token 的 JSON 请求
///
/// 提取成功时 `token` 已确认有效且用户已解析。
pub struct TokenJson<T> {
    pub token: Token,
    pub data: T,
}

impl<S, T> FromRequest<S> for TokenJson<T>
where
    TokenStore: FromRef<S>,
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = ApiRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiRejection::BadRequest(e.body_text()))?;
        let raw: RawApiRequest = serde_json::from_slice(&body)
            .map_err(|e| ApiRejection::BadRequest(format!("invalid json: {}", e)))?;
        let data = parse_data(raw.data)?;

        if raw.token.is_empty() {
            debug!("请求未携带 token");
            return Err(ApiRejection::TokenExpired);
        }

        let store = TokenStore::from_ref(state);
        let mut token = Token::resume_from(&store, raw.token);
        match token.user_id().await {
            Ok(Some(_)) => Ok(TokenJson { token, data }),
            Ok(None) => Err(ApiRejection::TokenExpired),
            Err(e) => Err(ApiRejection::Unavailable(e)),
        }
    }
}

/// 登录请求（不需要 token）
pub struct LoginJson<T>(pub T);

impl<S, T> FromRequest<S> for LoginJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = ApiRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiRejection::BadRequest(e.body_text()))?;
        let raw: RawLoginRequest = serde_json::from_slice(&body)
            .map_err(|e| ApiRejection::BadRequest(format!("invalid json: {}", e)))?;
        Ok(LoginJson(parse_data(raw.data)?))
    }
}
