//! 单连接事务管理
//!
//! 设备半双工且缓冲很小，每个连接同一时刻只允许一个在途请求：
//! 请求按提交顺序排队，收到对应应答或超时后才发送下一个。
//! 超时是唯一的推进手段，超时的请求不会被重发。
//!
//! 本模块不做 IO：[`TransactionManager`] 返回需要写到线路上的帧，
//! 时间由调用方传入，便于确定性测试。

use crate::request::{WireRequest, WireResponse};
use bytes::Bytes;
use ems_telemetry::{
    record_checksum_mismatch, record_request_failed, record_request_timed_out,
    record_response_matched, record_response_unmatched,
};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 请求失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// 连接未建立或已断开
    NotConnected,
    /// 对应的应答校验和不一致
    ChecksumMismatch,
    /// 编码或解码失败
    Codec(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => f.write_str("not connected"),
            Self::ChecksumMismatch => f.write_str("checksum mismatch"),
            Self::Codec(message) => write!(f, "codec error: {message}"),
        }
    }
}

/// 请求的最终结果，事务管理器是唯一的写入方
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Resolved(WireResponse),
    Failed(FailureReason),
    TimedOut,
}

impl TransactionOutcome {
    pub fn describe(&self) -> String {
        match self {
            Self::Resolved(_) => "resolved".to_string(),
            Self::Failed(reason) => reason.to_string(),
            Self::TimedOut => "request timed out".to_string(),
        }
    }
}

pub type OutcomeSender = oneshot::Sender<TransactionOutcome>;

/// 调用方持有的结果句柄
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<TransactionOutcome>,
}

impl PendingResponse {
    pub fn channel() -> (OutcomeSender, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// 立即失败的结果
    pub fn failed(reason: FailureReason) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(TransactionOutcome::Failed(reason));
        pending
    }

    /// 等待结果；事务管理器被丢弃时视为连接断开
    pub async fn outcome(self) -> TransactionOutcome {
        self.rx
            .await
            .unwrap_or(TransactionOutcome::Failed(FailureReason::NotConnected))
    }

    /// 不等待地读取结果
    pub fn try_outcome(&mut self) -> Option<TransactionOutcome> {
        self.rx.try_recv().ok()
    }
}

struct PendingRequest {
    tid: u8,
    request: WireRequest,
    frame: Bytes,
    reply: OutcomeSender,
    enqueued_at: Instant,
}

struct InFlight {
    pending: PendingRequest,
    deadline: Instant,
}

/// 单连接的请求队列
pub struct TransactionManager {
    next_tid: u8,
    in_flight: Option<InFlight>,
    queue: VecDeque<PendingRequest>,
    timeout: Duration,
    connected: bool,
}

impl TransactionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_tid: 0,
            in_flight: None,
            queue: VecDeque::new(),
            timeout,
            connected: true,
        }
    }

    /// 提交请求。队列为空时返回需要立即发送的帧，否则排在在途请求之后。
    pub fn execute(
        &mut self,
        request: WireRequest,
        reply: OutcomeSender,
        now: Instant,
    ) -> Option<Bytes> {
        if !self.connected {
            record_request_failed();
            let _ = reply.send(TransactionOutcome::Failed(FailureReason::NotConnected));
            return None;
        }

        let tid = self.allocate_tid();
        let frame = match request.encode(tid) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    target: "ems.transaction",
                    tid,
                    request = %request.describe(),
                    error = %err,
                    "request_encode_failed"
                );
                record_request_failed();
                let _ = reply.send(TransactionOutcome::Failed(FailureReason::Codec(
                    err.to_string(),
                )));
                return None;
            }
        };

        let pending = PendingRequest {
            tid,
            request,
            frame,
            reply,
            enqueued_at: now,
        };
        if self.in_flight.is_some() {
            debug!(
                target: "ems.transaction",
                tid,
                queued = self.queue.len() + 1,
                "request_queued"
            );
            self.queue.push_back(pending);
            return None;
        }
        Some(self.start(pending, now))
    }

    /// 处理一帧应答，返回下一个需要发送的帧
    pub fn on_frame(&mut self, frame: &[u8], now: Instant) -> Option<Bytes> {
        let correlated = self
            .in_flight
            .as_ref()
            .is_some_and(|current| current.pending.request.correlates(current.pending.tid, frame));
        if !correlated {
            record_response_unmatched();
            debug!(
                target: "ems.transaction",
                in_flight = ?self.in_flight_tid(),
                len = frame.len(),
                "response_unmatched"
            );
            return None;
        }
        let current = self.in_flight.take()?;
        let pending = current.pending;

        let outcome = match pending.request.decode_response(frame) {
            Ok(response) if response.checksum_ok() => {
                record_response_matched();
                TransactionOutcome::Resolved(response)
            }
            Ok(_) => {
                record_checksum_mismatch();
                warn!(target: "ems.transaction", tid = pending.tid, "response_checksum_mismatch");
                TransactionOutcome::Failed(FailureReason::ChecksumMismatch)
            }
            Err(err) => {
                record_request_failed();
                warn!(
                    target: "ems.transaction",
                    tid = pending.tid,
                    error = %err,
                    "response_decode_failed"
                );
                TransactionOutcome::Failed(FailureReason::Codec(err.to_string()))
            }
        };
        debug!(
            target: "ems.transaction",
            tid = pending.tid,
            elapsed_ms = now.saturating_duration_since(pending.enqueued_at).as_millis() as u64,
            "request_completed"
        );
        let _ = pending.reply.send(outcome);
        self.advance(now)
    }

    /// 在途请求到期时使其超时并推进队列
    pub fn on_timeout(&mut self, now: Instant) -> Option<Bytes> {
        let expired = self
            .in_flight
            .as_ref()
            .is_some_and(|current| current.deadline <= now);
        if !expired {
            return None;
        }
        let current = self.in_flight.take()?;
        record_request_timed_out();
        warn!(
            target: "ems.transaction",
            tid = current.pending.tid,
            request = %current.pending.request.describe(),
            "request_timed_out"
        );
        let _ = current.pending.reply.send(TransactionOutcome::TimedOut);
        self.advance(now)
    }

    /// 在途请求的截止时间
    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|current| current.deadline)
    }

    pub fn in_flight_tid(&self) -> Option<u8> {
        self.in_flight.as_ref().map(|current| current.pending.tid)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// 连接断开：所有未完成请求以 NotConnected 失败，之后的提交立即失败
    pub fn close(&mut self) {
        self.connected = false;
        let pending = self
            .in_flight
            .take()
            .map(|current| current.pending)
            .into_iter()
            .chain(self.queue.drain(..));
        for request in pending {
            record_request_failed();
            let _ = request
                .reply
                .send(TransactionOutcome::Failed(FailureReason::NotConnected));
        }
    }

    fn allocate_tid(&mut self) -> u8 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn start(&mut self, pending: PendingRequest, now: Instant) -> Bytes {
        let frame = pending.frame.clone();
        debug!(target: "ems.transaction", tid = pending.tid, "request_sent");
        self.in_flight = Some(InFlight {
            pending,
            deadline: now + self.timeout,
        });
        frame
    }

    fn advance(&mut self, now: Instant) -> Option<Bytes> {
        let next = self.queue.pop_front()?;
        Some(self.start(next, now))
    }
}
