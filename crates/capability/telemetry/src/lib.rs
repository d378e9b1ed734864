//! 追踪初始化、会话 ID 与网关计数器。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 网关指标快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub auth_accepted: u64,
    pub auth_rejected: u64,
    pub frames_sent: u64,
    pub responses_matched: u64,
    pub responses_unmatched: u64,
    pub checksum_mismatches: u64,
    pub requests_timed_out: u64,
    pub requests_failed: u64,
    pub polls_skipped: u64,
    pub payloads_forwarded: u64,
    pub rpc_success: u64,
    pub rpc_failure: u64,
}

/// 网关指标。
pub struct TelemetryMetrics {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    auth_accepted: AtomicU64,
    auth_rejected: AtomicU64,
    frames_sent: AtomicU64,
    responses_matched: AtomicU64,
    responses_unmatched: AtomicU64,
    checksum_mismatches: AtomicU64,
    requests_timed_out: AtomicU64,
    requests_failed: AtomicU64,
    polls_skipped: AtomicU64,
    payloads_forwarded: AtomicU64,
    rpc_success: AtomicU64,
    rpc_failure: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            auth_accepted: AtomicU64::new(0),
            auth_rejected: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            responses_matched: AtomicU64::new(0),
            responses_unmatched: AtomicU64::new(0),
            checksum_mismatches: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            polls_skipped: AtomicU64::new(0),
            payloads_forwarded: AtomicU64::new(0),
            rpc_success: AtomicU64::new(0),
            rpc_failure: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            auth_accepted: self.auth_accepted.load(Ordering::Relaxed),
            auth_rejected: self.auth_rejected.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            responses_unmatched: self.responses_unmatched.load(Ordering::Relaxed),
            checksum_mismatches: self.checksum_mismatches.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            polls_skipped: self.polls_skipped.load(Ordering::Relaxed),
            payloads_forwarded: self.payloads_forwarded.load(Ordering::Relaxed),
            rpc_success: self.rpc_success.load(Ordering::Relaxed),
            rpc_failure: self.rpc_failure.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 为新连接生成会话 ID。
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn record_session_opened() {
    metrics().sessions_opened.fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_closed() {
    metrics().sessions_closed.fetch_add(1, Ordering::Relaxed);
}

/// 记录认证结果。
pub fn record_auth(accepted: bool) {
    let metrics = metrics();
    if accepted {
        metrics.auth_accepted.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.auth_rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// 记录写到线路上的请求帧。
pub fn record_frame_sent() {
    metrics().frames_sent.fetch_add(1, Ordering::Relaxed);
}

pub fn record_response_matched() {
    metrics().responses_matched.fetch_add(1, Ordering::Relaxed);
}

/// 记录无法对应在途请求的应答（丢弃）。
pub fn record_response_unmatched() {
    metrics().responses_unmatched.fetch_add(1, Ordering::Relaxed);
}

pub fn record_checksum_mismatch() {
    metrics().checksum_mismatches.fetch_add(1, Ordering::Relaxed);
}

pub fn record_request_timed_out() {
    metrics().requests_timed_out.fetch_add(1, Ordering::Relaxed);
}

pub fn record_request_failed() {
    metrics().requests_failed.fetch_add(1, Ordering::Relaxed);
}

/// 记录因无在线连接而跳过的轮询。
pub fn record_poll_skipped() {
    metrics().polls_skipped.fetch_add(1, Ordering::Relaxed);
}

/// 记录交给遥测存储的负载。
pub fn record_payload_forwarded() {
    metrics().payloads_forwarded.fetch_add(1, Ordering::Relaxed);
}

/// 记录 RPC 结果。
pub fn record_rpc(success: bool) {
    let metrics = metrics();
    if success {
        metrics.rpc_success.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.rpc_failure.fetch_add(1, Ordering::Relaxed);
    }
}
