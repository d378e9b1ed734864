//! 连接工厂
//!
//! 每个监听端口一个工厂任务，独占该端口的设备注册表、客户端表与轮询任务。
//! 会话、轮询任务与服务都通过 [`FactoryHandle`] 投递事件，事件按到达顺序串行处理，
//! 所以轮询与 RPC 看到的连接状态总是一致的。

use crate::config::{FrameMethod, ListenConfig, PointConfig};
use crate::converter::{ConvertContext, ConverterRegistry, guarded};
use crate::error::ProtocolError;
use crate::gateway::Gateway;
use crate::registry::DeviceRegistry;
use crate::request::WireRequest;
use crate::scheduler::{PollScheduler, job_id};
use crate::session::SessionHandle;
use crate::transaction::{PendingResponse, TransactionOutcome};
use domain::{ConvertedData, PollKind, RpcReply, RpcRequest};
use ems_telemetry::{record_payload_forwarded, record_poll_skipped, record_rpc};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum FactoryEvent {
    AddDevices {
        config: ListenConfig,
        reply: Reply<Result<Vec<String>, ProtocolError>>,
    },
    UpdateDevices {
        config: ListenConfig,
        reply: Reply<Result<Vec<String>, ProtocolError>>,
    },
    RemoveDevices {
        config: ListenConfig,
        reply: Reply<Vec<String>>,
    },
    Connected {
        handle: SessionHandle,
    },
    Authenticate {
        session_id: String,
        token: String,
        verdict: Reply<bool>,
    },
    Disconnected {
        session_id: String,
    },
    PollDue {
        device: String,
        kind: PollKind,
    },
    PollCompleted {
        device: String,
        kind: PollKind,
        data: ConvertedData,
    },
    Rpc {
        request: RpcRequest,
        reply: Reply<RpcReply>,
    },
    Shutdown {
        done: Reply<()>,
    },
}

/// 工厂句柄，可跨任务克隆
#[derive(Debug, Clone)]
pub struct FactoryHandle {
    tx: mpsc::UnboundedSender<FactoryEvent>,
}

impl FactoryHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> FactoryEvent,
    ) -> Result<T, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| ProtocolError::ChannelClosed)?;
        rx.await.map_err(|_| ProtocolError::ChannelClosed)
    }

    pub async fn add_devices(&self, config: ListenConfig) -> Result<Vec<String>, ProtocolError> {
        self.call(|reply| FactoryEvent::AddDevices { config, reply })
            .await?
    }

    pub async fn update_devices(&self, config: ListenConfig) -> Result<Vec<String>, ProtocolError> {
        self.call(|reply| FactoryEvent::UpdateDevices { config, reply })
            .await?
    }

    pub async fn remove_devices(&self, config: ListenConfig) -> Result<Vec<String>, ProtocolError> {
        self.call(|reply| FactoryEvent::RemoveDevices { config, reply })
            .await
    }

    /// 下发 RPC 并等待应答；失败也以错误应答返回
    pub async fn rpc(&self, request: RpcRequest) -> Result<RpcReply, ProtocolError> {
        self.call(|reply| FactoryEvent::Rpc { request, reply }).await
    }

    /// 取消轮询任务并关闭全部会话
    pub async fn shutdown(&self) {
        if self.call(|done| FactoryEvent::Shutdown { done }).await.is_err() {
            debug!(target: "ems.service", "factory_already_stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn connected(&self, handle: SessionHandle) -> bool {
        self.tx.send(FactoryEvent::Connected { handle }).is_ok()
    }

    pub(crate) async fn authenticate(&self, session_id: &str, token: &str) -> bool {
        self.call(|verdict| FactoryEvent::Authenticate {
            session_id: session_id.to_string(),
            token: token.to_string(),
            verdict,
        })
        .await
        .unwrap_or(false)
    }

    pub(crate) fn disconnected(&self, session_id: &str) {
        let _ = self.tx.send(FactoryEvent::Disconnected {
            session_id: session_id.to_string(),
        });
    }
}

struct Client {
    handle: SessionHandle,
    token: Option<String>,
}

pub(crate) struct ConnectionFactory {
    method: FrameMethod,
    gateway: Arc<dyn Gateway>,
    registry: DeviceRegistry,
    scheduler: PollScheduler,
    /// 按连接先后排列
    clients: Vec<Client>,
    polls_in_progress: HashSet<String>,
    events: mpsc::WeakUnboundedSender<FactoryEvent>,
}

impl ConnectionFactory {
    /// 在当前运行时上启动工厂任务
    pub(crate) fn spawn(
        method: FrameMethod,
        gateway: Arc<dyn Gateway>,
        converters: Arc<ConverterRegistry>,
    ) -> FactoryHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Self {
            method,
            registry: DeviceRegistry::new(gateway.clone(), converters),
            gateway,
            scheduler: PollScheduler::new(),
            clients: Vec::new(),
            polls_in_progress: HashSet::new(),
            events: tx.downgrade(),
        };
        tokio::spawn(factory.run(rx));
        FactoryHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<FactoryEvent>) {
        while let Some(event) = rx.recv().await {
            if self.handle(event).await.is_break() {
                return;
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        self.scheduler.cancel_all();
        for client in self.clients.drain(..) {
            client.handle.close();
        }
        debug!(target: "ems.service", method = %self.method, "factory_stopped");
    }

    async fn handle(&mut self, event: FactoryEvent) -> ControlFlow<()> {
        match event {
            FactoryEvent::AddDevices { config, reply } => {
                let result = self.registry.add_devices(&config).await;
                if result.is_ok() {
                    self.reschedule_token(&config.access_token);
                }
                let _ = reply.send(result);
            }
            FactoryEvent::UpdateDevices { config, reply } => {
                let connector = config.connector_name();
                let stale: Vec<String> = self
                    .registry
                    .devices_for_token(&config.access_token)
                    .map(|record| record.name().to_string())
                    .collect();
                let result = self.registry.update_devices(&config).await;
                if result.is_ok() {
                    for name in &stale {
                        self.scheduler.cancel_device(name);
                    }
                    self.reschedule_token(&config.access_token);
                    debug!(target: "ems.service", connector = %connector, "devices_updated");
                }
                let _ = reply.send(result);
            }
            FactoryEvent::RemoveDevices { config, reply } => {
                let removed = self.registry.remove_devices(&config).await;
                for name in &removed {
                    self.scheduler.cancel_device(name);
                }
                let _ = reply.send(removed);
            }
            FactoryEvent::Connected { handle } => {
                debug!(target: "ems.session", session_id = handle.id(), peer = %handle.peer(), "client_registered");
                self.clients.push(Client {
                    handle,
                    token: None,
                });
            }
            FactoryEvent::Authenticate {
                session_id,
                token,
                verdict,
            } => {
                let accepted = self.authenticate(&session_id, token);
                let _ = verdict.send(accepted);
            }
            FactoryEvent::Disconnected { session_id } => self.disconnected(&session_id),
            FactoryEvent::PollDue { device, kind } => self.poll(device, kind),
            FactoryEvent::PollCompleted { device, kind, data } => {
                self.poll_completed(&device, kind, data).await;
            }
            FactoryEvent::Rpc { request, reply } => self.rpc(request, reply).await,
            FactoryEvent::Shutdown { done } => {
                self.stop();
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn authenticate(&mut self, session_id: &str, token: String) -> bool {
        if !self.registry.is_known_token(&token) {
            return false;
        }
        let Some(client) = self
            .clients
            .iter_mut()
            .find(|client| client.handle.id() == session_id)
        else {
            return false;
        };
        client.token = Some(token.clone());
        self.reschedule_token(&token);
        true
    }

    fn disconnected(&mut self, session_id: &str) {
        let Some(index) = self
            .clients
            .iter()
            .position(|client| client.handle.id() == session_id)
        else {
            return;
        };
        let client = self.clients.remove(index);
        debug!(target: "ems.session", session_id, "client_unregistered");
        if let Some(token) = client.token {
            self.cancel_token(&token);
            if self.active_session(&token).is_some() {
                self.reschedule_token(&token);
            }
        }
    }

    /// 令牌最近认证的存活连接
    fn active_session(&self, token: &str) -> Option<SessionHandle> {
        self.clients
            .iter()
            .rev()
            .find(|client| client.token.as_deref() == Some(token) && !client.handle.is_closed())
            .map(|client| client.handle.clone())
    }

    fn cancel_token(&mut self, token: &str) {
        let names: Vec<String> = self
            .registry
            .devices_for_token(token)
            .map(|record| record.name().to_string())
            .collect();
        for name in names {
            self.scheduler.cancel_device(&name);
        }
    }

    /// 有已认证连接时重建令牌下全部设备的轮询任务
    fn reschedule_token(&mut self, token: &str) {
        self.cancel_token(token);
        if self.active_session(token).is_none() {
            return;
        }
        let mut jobs = Vec::new();
        for record in self.registry.devices_for_token(token) {
            for kind in [PollKind::Attributes, PollKind::Timeseries] {
                if let Some(period) = record.config.poll_period(kind) {
                    jobs.push((record.name().to_string(), kind, period));
                }
            }
        }
        for (device, kind, period) in jobs {
            let events = self.events.clone();
            let name = device.clone();
            self.scheduler.schedule(&device, kind, period, move || {
                events.upgrade().is_some_and(|tx| {
                    tx.send(FactoryEvent::PollDue {
                        device: name.clone(),
                        kind,
                    })
                    .is_ok()
                })
            });
        }
    }

    fn poll(&mut self, device: String, kind: PollKind) {
        let job = job_id(&device, kind);
        if self.polls_in_progress.contains(&job) {
            debug!(target: "ems.poll", job = %job, "poll_still_running");
            return;
        }
        let Some(record) = self.registry.get(&device) else {
            self.scheduler.cancel(&device, kind);
            return;
        };
        let Some(session) = self.active_session(&record.token) else {
            record_poll_skipped();
            warn!(target: "ems.poll", device = %device, kind = kind.as_str(), "poll_skipped");
            return;
        };

        let mut reads: Vec<(PointConfig, PendingResponse)> = Vec::new();
        for point in record.config.points(kind) {
            match WireRequest::read(self.method, &record.config, point) {
                Ok(request) => reads.push((point.clone(), session.execute(request))),
                Err(err) => {
                    warn!(target: "ems.poll", device = %device, tag = %point.tag, error = %err, "poll_request_invalid");
                }
            }
        }
        if reads.is_empty() {
            return;
        }

        self.polls_in_progress.insert(job);
        let config = record.config.clone();
        let uplink = record.uplink.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut data = ConvertedData::new(config.device_name.clone(), config.device_type.clone());
            for (point, pending) in reads {
                match pending.outcome().await {
                    TransactionOutcome::Resolved(response) => {
                        let context = ConvertContext {
                            device: &config,
                            kind,
                            point: &point,
                        };
                        match guarded(|| uplink.convert(&context, &response)) {
                            Ok(converted) => {
                                data.telemetry.extend(converted.telemetry);
                                data.attributes.extend(converted.attributes);
                            }
                            Err(err) => {
                                warn!(target: "ems.poll", device = %config.device_name, tag = %point.tag, error = %err, "poll_convert_failed");
                            }
                        }
                    }
                    outcome => {
                        warn!(
                            target: "ems.poll",
                            device = %config.device_name,
                            tag = %point.tag,
                            reason = %outcome.describe(),
                            "poll_request_failed"
                        );
                    }
                }
            }
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(FactoryEvent::PollCompleted {
                    device: config.device_name,
                    kind,
                    data,
                });
            }
        });
    }

    async fn poll_completed(&mut self, device: &str, kind: PollKind, data: ConvertedData) {
        self.polls_in_progress.remove(&job_id(device, kind));
        let Some(record) = self.registry.get_mut(device) else {
            return;
        };
        let forward = record.filter_changes(data, Instant::now());
        if forward.is_empty() {
            debug!(target: "ems.poll", device, kind = kind.as_str(), "poll_unchanged");
            return;
        }
        let connector = record.connector.clone();
        debug!(
            target: "ems.poll",
            device,
            telemetry = forward.telemetry.len(),
            attributes = forward.attributes.len(),
            "poll_forwarded"
        );
        self.gateway.send_to_storage(&connector, forward).await;
        record_payload_forwarded();
    }

    fn prepare_rpc(&self, request: &RpcRequest) -> Result<(SessionHandle, WireRequest), ProtocolError> {
        let record = self
            .registry
            .get(&request.device)
            .ok_or_else(|| ProtocolError::DeviceNotFound(request.device.clone()))?;
        let session = self
            .active_session(&record.token)
            .ok_or_else(|| ProtocolError::NoActiveConnection(request.device.clone()))?;
        let command = record
            .config
            .rpc_command(&request.data.method)
            .ok_or_else(|| ProtocolError::UnknownMethod(request.data.method.clone()))?;
        let payload = guarded(|| record.downlink.convert(command, &request.data.params))?;
        let wire = WireRequest::write(self.method, &record.config, command, &payload)?;
        Ok((session, wire))
    }

    async fn rpc(&mut self, request: RpcRequest, reply: Reply<RpcReply>) {
        let (session, wire) = match self.prepare_rpc(&request) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(
                    target: "ems.rpc",
                    device = %request.device,
                    method = %request.data.method,
                    error = %err,
                    "rpc_rejected"
                );
                let result = RpcReply::error(&request, err.to_string());
                record_rpc(false);
                self.gateway.send_rpc_reply(result.clone()).await;
                let _ = reply.send(result);
                return;
            }
        };

        info!(
            target: "ems.rpc",
            device = %request.device,
            method = %request.data.method,
            request = %wire.describe(),
            "rpc_submitted"
        );
        let pending = session.execute(wire.clone());
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            let result = match pending.outcome().await {
                TransactionOutcome::Resolved(response) => {
                    RpcReply::success(&request, wire.acknowledged_by(&response))
                }
                outcome => RpcReply::error(&request, outcome.describe()),
            };
            record_rpc(!result.is_error());
            info!(
                target: "ems.rpc",
                device = %request.device,
                method = %request.data.method,
                result = %result.result,
                "rpc_completed"
            );
            gateway.send_rpc_reply(result.clone()).await;
            let _ = reply.send(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryGateway;
    use serde_json::json;

    fn config() -> ListenConfig {
        serde_json::from_value(json!({
            "port": 0,
            "accessToken": "token-a",
            "devices": [{ "deviceName": "meter-1", "rpc": [{ "tag": "setValve", "command": "writeValve" }] }]
        }))
        .unwrap()
    }

    fn factory(gateway: Arc<InMemoryGateway>) -> FactoryHandle {
        ConnectionFactory::spawn(FrameMethod::Meter, gateway, Arc::new(ConverterRegistry::new()))
    }

    #[tokio::test]
    async fn test_rpc_without_session_is_replied() {
        let gateway = Arc::new(InMemoryGateway::new());
        let handle = factory(gateway.clone());
        assert_eq!(handle.add_devices(config()).await.unwrap(), vec!["meter-1"]);

        let reply = handle
            .rpc(RpcRequest::new("meter-1", 1, "setValve", json!(true)))
            .await
            .unwrap();
        assert_eq!(
            reply.result,
            json!({"error": "no active connection for device meter-1"})
        );
        assert_eq!(gateway.replies(), vec![reply]);
    }

    #[tokio::test]
    async fn test_unknown_session_events_are_ignored() {
        let gateway = Arc::new(InMemoryGateway::new());
        let handle = factory(gateway);
        handle.add_devices(config()).await.unwrap();

        handle.disconnected("missing");
        assert!(!handle.authenticate("missing", "token-a").await);
        assert_eq!(handle.remove_devices(config()).await.unwrap(), vec!["meter-1"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_event_loop() {
        let handle = factory(Arc::new(InMemoryGateway::new()));
        handle.shutdown().await;
        assert!(matches!(
            handle.add_devices(config()).await,
            Err(ProtocolError::ChannelClosed)
        ));
        // 重复关闭不报错
        handle.shutdown().await;
    }
}
