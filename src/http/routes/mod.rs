//! HTTP 路由模块
//!
//! 路由结构：
//! - `/api/token/*` - 客户端接口（请求体携带 token）
//! - `/api/admin/*` - 管理接口（业务系统调用，使用 X-Service-Key 认证）
//! - `/metrics`     - Prometheus 抓取端点

pub mod admin;
pub mod metrics;
pub mod token;

use crate::http::HttpServerState;
use axum::{routing::get, Router};

/// 创建所有路由
pub fn create_routes() -> Router<HttpServerState> {
    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .merge(token::create_route()) // /api/token/* - 客户端接口
        .merge(admin::create_route()) // /api/admin/* - 管理 API
}
