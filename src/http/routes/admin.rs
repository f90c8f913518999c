//! 管理 API 路由模块
//!
//! 业务系统调用，使用 X-Service-Key 进行安全认证
//!
//! - `GET    /api/admin/users/{uid}/tokens`              用户所有在线设备
//! - `POST   /api/admin/users/{uid}/tokens`              为用户签发 token
//! - `DELETE /api/admin/users/{uid}/tokens`              退出所有设备
//! - `DELETE /api/admin/users/{uid}/clients/{client_id}` 踢下线单个设备

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{delete, get},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::SessionValue;
use crate::error::{Result, TokenError};
use crate::http::{HttpServerState, LoginJson, LoginOutcome, LoginResponse};

/// 创建管理 API 路由
pub fn create_route() -> Router<HttpServerState> {
    Router::new()
        .route(
            "/api/admin/users/{uid}/tokens",
            get(list_user_tokens)
                .post(issue_token)
                .delete(revoke_user_tokens),
        )
        .route(
            "/api/admin/users/{uid}/clients/{client_id}",
            delete(revoke_client),
        )
}

/// 从请求头中提取并验证 Service Key
fn verify_service_key(headers: &HeaderMap, state: &HttpServerState) -> Result<()> {
    let Some(expected) = state.admin_key.as_deref() else {
        warn!("管理接口未配置 admin_key，拒绝请求");
        return Err(TokenError::Unauthorized("admin api disabled".to_string()));
    };

    let key = headers
        .get("X-Service-Key")
        .ok_or_else(|| {
            warn!("缺少 X-Service-Key 请求头");
            TokenError::Unauthorized("缺少 X-Service-Key 请求头".to_string())
        })?
        .to_str()
        .map_err(|_| {
            warn!("X-Service-Key 格式无效");
            TokenError::Unauthorized("X-Service-Key 格式无效".to_string())
        })?;

    // 使用恒定时间比较防止时序攻击
    if !constant_time_compare(key.as_bytes(), expected.as_bytes()) {
        warn!("❌ 无效的 service key");
        return Err(TokenError::Unauthorized("无效的 service key".to_string()));
    }
    Ok(())
}

/// 恒定时间比较（长度不同直接返回 false，长度本身不是机密）
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceItem {
    pub client_id: String,
    pub token: String,
}

/// GET /api/admin/users/{uid}/tokens
async fn list_user_tokens(
    State(state): State<HttpServerState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    verify_service_key(&headers, &state)?;

    let devices: Vec<DeviceItem> = state
        .token_store
        .find_devices(&uid)
        .await?
        .into_iter()
        .map(|(client_id, token)| DeviceItem { client_id, token })
        .collect();

    Ok(Json(json!({
        "uid": uid,
        "total": devices.len(),
        "devices": devices,
    })))
}

#[derive(Debug, Deserialize)]
pub struct IssueTokenData {
    pub client_id: String,
    #[serde(default)]
    pub session: String,
    /// true：该设备已有有效 token 时沿用；false：签发新 token 顶掉旧会话
    #[serde(default)]
    pub reuse: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IssueTokenResult {
    pub client_id: String,
    /// 有效期（秒）
    pub expires_in: u64,
}

/// POST /api/admin/users/{uid}/tokens
///
/// 请求：`{"data": {"client_id": "ios-1", "session": "", "reuse": false}}`
/// 响应：`{"uid": "...", "token": "...", "data": {"client_id": "ios-1", "expires_in": 7776000}}`
async fn issue_token(
    State(state): State<HttpServerState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
    LoginJson(data): LoginJson<IssueTokenData>,
) -> Result<Json<LoginResponse<IssueTokenResult>>> {
    verify_service_key(&headers, &state)?;

    let value = SessionValue::new(uid, data.client_id.clone()).with_session(data.session);
    let outcome = if data.reuse {
        LoginOutcome::succeed_and_set_or_use_old(&state.token_store, value).await?
    } else {
        LoginOutcome::succeed_and_overwrite(&state.token_store, value).await?
    };

    Ok(outcome.into_response(IssueTokenResult {
        client_id: data.client_id,
        expires_in: state.token_store.max_ttl().as_secs(),
    }))
}

/// DELETE /api/admin/users/{uid}/tokens
async fn revoke_user_tokens(
    State(state): State<HttpServerState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    verify_service_key(&headers, &state)?;

    let deleted = state.token_store.delete_all_for_user(&uid).await?;
    info!("✅ 管理接口：已撤销用户 {} 的 {} 个设备 token", uid, deleted);

    Ok(Json(json!({ "uid": uid, "deleted": deleted })))
}

/// DELETE /api/admin/users/{uid}/clients/{client_id}
async fn revoke_client(
    State(state): State<HttpServerState>,
    Path((uid, client_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    verify_service_key(&headers, &state)?;

    let deleted = state
        .token_store
        .delete_client_for_user(&uid, &client_id)
        .await?;

    Ok(Json(json!({
        "uid": uid,
        "client_id": client_id,
        "deleted": deleted,
    })))
}
