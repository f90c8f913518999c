//! HTTP 模块 - token 的 JSON 适配层
//!
//! 功能包括：
//! - 请求 / 响应格式（`{token, data}` / `{code, data}`）
//! - 从请求中恢复 token 的提取器
//! - 登录结果的序列化
//! - 内置的校验 / 心跳 / 退出 / 管理接口

pub mod extract;
pub mod login;
pub mod reqres;
pub mod routes;
pub mod server;

pub use extract::{ApiRejection, LoginJson, TokenJson};
pub use login::LoginOutcome;
pub use reqres::{ApiResponse, Empty, LoginResponse, CODE_OK, CODE_TOKEN_EXPIRED};
pub use server::{router, HttpServer, HttpServerState};
