//! Prometheus 指标：token 签发、复用、删除与设备淘汰
//!
//! 通过 `init()` 安装全局 Recorder，通过 HTTP GET `/metrics` 暴露抓取端点。
//! 未安装 Recorder 时所有 `record_*` 都是空操作。

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
const COUNTER_ISSUED: &str = "api_token_issued_total";
const COUNTER_REUSED: &str = "api_token_reused_total";
const COUNTER_DELETED: &str = "api_token_deleted_total";
const COUNTER_EVICTED: &str = "api_token_evicted_total";
const COUNTER_EVICTION_CONFLICTS: &str = "api_token_eviction_conflicts_total";
const COUNTER_EVICTION_ABANDONED: &str = "api_token_eviction_abandoned_total";

/// 初始化 Prometheus 指标（安装全局 Recorder）。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    HANDLE
        .set(handle)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

/// 渲染当前指标为 Prometheus 文本格式，供 GET /metrics 使用。
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// 签发了一个新 token（`mode`: overwrite / reuse）
pub fn record_issued(mode: &'static str) {
    metrics::counter!(COUNTER_ISSUED, "mode" => mode).increment(1);
}

/// 并发登录时复用了已存在的 token
pub fn record_reused() {
    metrics::counter!(COUNTER_REUSED).increment(1);
}

pub fn record_deleted(count: u64) {
    metrics::counter!(COUNTER_DELETED).increment(count);
}

pub fn record_evicted(count: u64) {
    metrics::counter!(COUNTER_EVICTED).increment(count);
}

pub fn record_eviction_conflict() {
    metrics::counter!(COUNTER_EVICTION_CONFLICTS).increment(1);
}

pub fn record_eviction_abandoned() {
    metrics::counter!(COUNTER_EVICTION_ABANDONED).increment(1);
}
