//! 单连接会话
//!
//! 状态：未认证 → 已认证 → 关闭。未认证时收到的第一段数据按令牌处理，
//! 令牌未知即关闭连接；认证后的帧交给事务管理器对应在途请求。
//! 会话任务独占连接与事务队列，其他任务只能通过 [`SessionHandle`] 投递命令。

use crate::config::FrameMethod;
use crate::factory::FactoryHandle;
use crate::framer::{Inbound, SessionCodec};
use crate::request::WireRequest;
use crate::transaction::{
    FailureReason, OutcomeSender, PendingResponse, TransactionManager, TransactionOutcome,
};
use ems_telemetry::{
    new_session_id, record_auth, record_frame_sent, record_session_closed, record_session_opened,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::codec::Framed;
use tracing::{Instrument, debug, info, info_span, warn};

pub(crate) enum SessionCommand {
    Execute {
        request: WireRequest,
        reply: OutcomeSender,
    },
    Close,
}

/// 会话句柄，可跨任务克隆
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execute { request, .. } => f.debug_tuple("Execute").field(request).finish(),
            Self::Close => f.write_str("Close"),
        }
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// 在该连接上提交请求。会话已结束时立即以 NotConnected 失败。
    pub fn execute(&self, request: WireRequest) -> PendingResponse {
        let (reply, pending) = PendingResponse::channel();
        if let Err(mpsc::error::SendError(SessionCommand::Execute { reply, .. })) =
            self.tx.send(SessionCommand::Execute { request, reply })
        {
            let _ = reply.send(TransactionOutcome::Failed(FailureReason::NotConnected));
        }
        pending
    }

    pub fn close(&self) {
        let _ = self.tx.send(SessionCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 运行一个连接直到断开
pub(crate) async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    method: FrameMethod,
    timeout: Duration,
    factory: FactoryHandle,
) {
    let session_id = new_session_id();
    let span = info_span!("session", session_id = %session_id, peer = %peer);
    let session = Session {
        id: session_id,
        peer,
        method,
        factory,
        manager: TransactionManager::new(timeout),
        token: None,
    };
    session.run(stream).instrument(span).await;
}

struct Session {
    id: String,
    peer: SocketAddr,
    method: FrameMethod,
    factory: FactoryHandle,
    manager: TransactionManager,
    token: Option<String>,
}

impl Session {
    async fn run(mut self, stream: TcpStream) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            id: self.id.clone(),
            peer: self.peer,
            tx,
        };
        if !self.factory.connected(handle) {
            debug!(target: "ems.session", "factory_closed_before_connect");
            return;
        }
        record_session_opened();
        info!(target: "ems.session", method = %self.method, "session_opened");

        let mut framed = Framed::new(stream, SessionCodec::new(self.method));
        let reason = loop {
            let deadline = self.manager.deadline();
            let outgoing = tokio::select! {
                inbound = framed.next() => match inbound {
                    None => break "peer_closed",
                    Some(Err(err)) => {
                        warn!(target: "ems.session", error = %err, "session_read_failed");
                        break "read_error";
                    }
                    Some(Ok(Inbound::Token(payload))) => {
                        if !self.authenticate(&payload).await {
                            break "authentication_failed";
                        }
                        framed.codec_mut().authenticate();
                        None
                    }
                    Some(Ok(Inbound::Frame(frame))) => {
                        self.manager.on_frame(&frame, Instant::now())
                    }
                },
                command = rx.recv() => match command {
                    Some(SessionCommand::Execute { request, reply }) => {
                        self.manager.execute(request, reply, Instant::now())
                    }
                    Some(SessionCommand::Close) | None => break "closed_by_gateway",
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.manager.on_timeout(Instant::now())
                }
            };

            if let Some(frame) = outgoing {
                if let Err(err) = framed.send(frame).await {
                    warn!(target: "ems.session", error = %err, "session_write_failed");
                    break "write_error";
                }
                record_frame_sent();
            }
        };

        self.manager.close();
        rx.close();
        while let Ok(command) = rx.try_recv() {
            if let SessionCommand::Execute { reply, .. } = command {
                let _ = reply.send(TransactionOutcome::Failed(FailureReason::NotConnected));
            }
        }
        self.factory.disconnected(&self.id);
        record_session_closed();
        info!(
            target: "ems.session",
            reason,
            token = ?self.token,
            "session_closed"
        );
    }

    /// 令牌必须是 UTF-8 且与已注册令牌完全一致
    async fn authenticate(&mut self, payload: &[u8]) -> bool {
        let Ok(token) = std::str::from_utf8(payload) else {
            record_auth(false);
            warn!(target: "ems.session", len = payload.len(), "authentication_rejected_non_utf8");
            return false;
        };
        let accepted = self.factory.authenticate(&self.id, token).await;
        record_auth(accepted);
        if accepted {
            info!(target: "ems.session", token, "session_authenticated");
            self.token = Some(token.to_string());
        } else {
            warn!(target: "ems.session", token, "authentication_rejected");
        }
        accepted
    }
}
