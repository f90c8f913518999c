//! JSON 请求 / 响应格式
//!
//! - 请求：`{"token": "...", "data": {...}}`
//! - 响应：`{"code": 200, "data": {...}}`；token 无效时 `{"code": 401, "data": {}}`
//! - 登录请求：`{"data": {...}}`
//! - 登录响应：`{"uid": "...", "token": "...", "data": {...}}`，失败时 uid / token 为空串

use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CODE_OK: u16 = 200;
pub const CODE_TOKEN_EXPIRED: u16 = 401;

/// 空数据 `{}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// 带 token 的请求体（`data` 延迟到知道目标类型后再解析）
#[derive(Debug, Deserialize)]
pub(crate) struct RawApiRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// 登录请求体
#[derive(Debug, Deserialize)]
pub(crate) struct RawLoginRequest {
    #[serde(default)]
    pub data: Option<Value>,
}

/// 缺省的 `data` 按 `{}` 处理
pub(crate) fn data_or_empty(data: Option<Value>) -> Value {
    match data {
        Some(Value::Null) | None => Value::Object(Default::default()),
        Some(data) => data,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: CODE_OK,
            data,
        }
    }
}

impl ApiResponse<Empty> {
    /// token 不存在、已过期或未提供
    pub fn token_expired() -> Self {
        Self {
            code: CODE_TOKEN_EXPIRED,
            data: Empty {},
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse<T> {
    pub uid: String,
    pub token: String,
    pub data: T,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_shapes() {
        let body = serde_json::to_value(ApiResponse::token_expired()).unwrap();
        assert_eq!(body, json!({"code": 401, "data": {}}));

        let body = serde_json::to_value(ApiResponse::ok(json!({"n": 1}))).unwrap();
        assert_eq!(body, json!({"code": 200, "data": {"n": 1}}));
    }

    #[test]
    fn test_missing_fields_default() {
        let raw: RawApiRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(raw.token, "");
        assert_eq!(data_or_empty(raw.data), json!({}));

        let raw: RawLoginRequest = serde_json::from_str(r#"{"data": null}"#).unwrap();
        assert_eq!(data_or_empty(raw.data), json!({}));
    }
}
