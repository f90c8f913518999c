//! 客户端接口：凭 token 调用
//!
//! - `POST /api/token/verify`    校验 token，返回所属用户与设备
//! - `POST /api/token/heartbeat` 心跳，刷新最近活跃时间与 TTL
//! - `POST /api/token/logout`    退出登录

use axum::{
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::auth::SessionValue;
use crate::error::Result;
use crate::http::{ApiResponse, Empty, HttpServerState, TokenJson};

pub fn create_route() -> Router<HttpServerState> {
    Router::new()
        .route("/api/token/verify", post(verify))
        .route("/api/token/heartbeat", post(heartbeat))
        .route("/api/token/logout", post(logout))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyData {
    pub uid: String,
    pub client_id: String,
    pub session: String,
    /// 最近活跃时间（秒）
    pub latest_time: i64,
}

impl From<&SessionValue> for VerifyData {
    fn from(value: &SessionValue) -> Self {
        Self {
            uid: value.uid.clone(),
            client_id: value.client_id.clone(),
            session: value.session.clone(),
            latest_time: value.latest_time.timestamp(),
        }
    }
}

async fn verify(TokenJson { mut token, .. }: TokenJson<Empty>) -> Result<Response> {
    Ok(match token.value().await? {
        Some(value) => ApiResponse::ok(VerifyData::from(value)).into_response(),
        None => ApiResponse::token_expired().into_response(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatData {
    /// 自定义 TTL（秒），缺省或超过上限时按上限
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResult {
    /// 剩余有效期（秒）
    pub expires_in: u64,
}

async fn heartbeat(TokenJson { mut token, data }: TokenJson<HeartbeatData>) -> Result<Response> {
    if !token.heartbeat(Utc::now()).await? {
        return Ok(ApiResponse::token_expired().into_response());
    }
    if let Some(secs) = data.ttl_secs {
        token.refresh_ttl(Some(Duration::from_secs(secs))).await?;
    }
    let expires_in = token
        .remaining_ttl()
        .await?
        .map(|ttl| ttl.as_secs())
        .unwrap_or(0);
    Ok(ApiResponse::ok(HeartbeatResult { expires_in }).into_response())
}

async fn logout(TokenJson { mut token, .. }: TokenJson<Empty>) -> Result<ApiResponse<Empty>> {
    token.logout().await?;
    Ok(ApiResponse::ok(Empty {}))
}
