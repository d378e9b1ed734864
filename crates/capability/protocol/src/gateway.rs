//! 外部协作方接口：设备清单、遥测存储与 RPC 应答

use async_trait::async_trait;
use domain::{ConvertedData, RpcReply};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::Notify;

/// 网关清单中的设备
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDevice {
    pub name: String,
    pub connector: String,
    pub device_type: String,
}

/// 外部网关进程
#[async_trait]
pub trait Gateway: Send + Sync {
    /// 注册设备，`connector` 为所属连接器名称
    async fn add_device(&self, name: &str, connector: &str, device_type: &str);

    async fn del_device(&self, name: &str);

    /// 已注册的设备名称
    async fn get_devices(&self) -> Vec<String>;

    async fn device_connector_name(&self, name: &str) -> Option<String>;

    /// 转发上行数据（不等待结果）
    async fn send_to_storage(&self, connector_name: &str, data: ConvertedData);

    async fn send_rpc_reply(&self, reply: RpcReply);
}

/// 进程内网关实现
///
/// 使用 RwLock + HashMap 保存清单，上行数据与 RPC 应答按到达顺序保存。
#[derive(Default)]
pub struct InMemoryGateway {
    devices: RwLock<HashMap<String, GatewayDevice>>,
    stored: RwLock<Vec<(String, ConvertedData)>>,
    replies: RwLock<Vec<RpcReply>>,
    notify: Notify,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, name: &str) -> Option<GatewayDevice> {
        self.devices
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
    }

    /// 已转发的上行数据
    pub fn stored(&self) -> Vec<(String, ConvertedData)> {
        self.stored
            .read()
            .map(|items| items.clone())
            .unwrap_or_default()
    }

    pub fn replies(&self) -> Vec<RpcReply> {
        self.replies
            .read()
            .map(|items| items.clone())
            .unwrap_or_default()
    }

    /// 等待上行数据累计到 `count` 条，超时返回当前内容
    pub async fn wait_for_storage(
        &self,
        count: usize,
        within: Duration,
    ) -> Vec<(String, ConvertedData)> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let notified = self.notify.notified();
            let stored = self.stored();
            if stored.len() >= count {
                return stored;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.stored();
            }
        }
    }
}

#[async_trait]
impl Gateway for InMemoryGateway {
    async fn add_device(&self, name: &str, connector: &str, device_type: &str) {
        if let Ok(mut map) = self.devices.write() {
            map.entry(name.to_string()).or_insert_with(|| GatewayDevice {
                name: name.to_string(),
                connector: connector.to_string(),
                device_type: device_type.to_string(),
            });
        }
    }

    async fn del_device(&self, name: &str) {
        if let Ok(mut map) = self.devices.write() {
            map.remove(name);
        }
    }

    async fn get_devices(&self) -> Vec<String> {
        self.devices
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn device_connector_name(&self, name: &str) -> Option<String> {
        self.device(name).map(|device| device.connector)
    }

    async fn send_to_storage(&self, connector_name: &str, data: ConvertedData) {
        if let Ok(mut items) = self.stored.write() {
            items.push((connector_name.to_string(), data));
        }
        self.notify.notify_waiters();
    }

    async fn send_rpc_reply(&self, reply: RpcReply) {
        if let Ok(mut items) = self.replies.write() {
            items.push(reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{KeyValue, PollKind};

    #[tokio::test]
    async fn test_first_registration_wins() {
        let gateway = InMemoryGateway::new();
        gateway.add_device("meter-1", "connector-a", "default").await;
        gateway.add_device("meter-1", "connector-b", "water").await;

        assert_eq!(
            gateway.device_connector_name("meter-1").await.as_deref(),
            Some("connector-a")
        );
        assert_eq!(gateway.get_devices().await, vec!["meter-1".to_string()]);

        gateway.del_device("meter-1").await;
        assert!(gateway.get_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_storage() {
        let gateway = std::sync::Arc::new(InMemoryGateway::new());
        let writer = gateway.clone();
        tokio::spawn(async move {
            let mut data = ConvertedData::new("meter-1", "default");
            data.push(PollKind::Timeseries, KeyValue::new("totalUsed", 1));
            writer.send_to_storage("connector-a", data).await;
        });

        let stored = gateway.wait_for_storage(1, Duration::from_secs(2)).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, "connector-a");
    }
}
