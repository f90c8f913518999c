//! HTTP 服务器 - 使用 Axum 提供 token JSON 接口

use axum::{extract::FromRef, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::auth::TokenStore;
use crate::http::routes;

/// HTTP 服务共享状态
#[derive(Clone)]
pub struct HttpServerState {
    pub token_store: TokenStore,
    /// 管理接口密钥，`None` 时管理接口全部拒绝
    pub admin_key: Option<Arc<str>>,
}

impl HttpServerState {
    pub fn new(token_store: TokenStore, admin_key: Option<String>) -> Self {
        Self {
            token_store,
            admin_key: admin_key.map(Arc::from),
        }
    }
}

impl FromRef<HttpServerState> for TokenStore {
    fn from_ref(state: &HttpServerState) -> Self {
        state.token_store.clone()
    }
}

/// 构建完整路由
pub fn router(state: HttpServerState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// token HTTP 服务器
pub struct HttpServer {
    state: HttpServerState,
    host: String,
    port: u16,
}

impl HttpServer {
    pub fn new(state: HttpServerState, host: impl Into<String>, port: u16) -> Self {
        Self {
            state,
            host: host.into(),
            port,
        }
    }

    /// 启动 HTTP 服务器，收到 Ctrl-C 后优雅退出
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = router(self.state.clone());

        // 绑定地址
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!("🌐 token HTTP 服务启动在 {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("👋 token HTTP 服务已停止");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听 Ctrl-C 失败: {}", e);
        std::future::pending::<()>().await;
    }
}
