//! TCP 连接器：一份监听配置对应一个连接器，打开即加入共享端口。

use domain::{RpcReply, RpcRequest};
use ems_protocol::{ListenConfig, ListenHandle, ProtocolError};
use rand_core::{OsRng, RngCore};
use tracing::info;

const NAME_PREFIX: &str = "Tcp Server ";

pub struct TcpConnector {
    name: String,
    config: ListenConfig,
    service: ListenHandle,
}

impl TcpConnector {
    /// 未命名的配置使用 `Tcp Server` 加 5 位随机小写字母
    pub fn new(mut config: ListenConfig, service: ListenHandle) -> Self {
        let name = config.name.clone().unwrap_or_else(random_name);
        config.name = Some(name.clone());
        Self {
            name,
            config,
            service,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub async fn open(&self) -> Result<(), ProtocolError> {
        self.service.add_listen(self.config.clone()).await?;
        info!(connector = %self.name, port = self.config.port, "connector_opened");
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.service
            .rem_listen(self.config.port, self.config.clone())
            .await?;
        info!(connector = %self.name, port = self.config.port, "connector_closed");
        Ok(())
    }

    /// 服务端下发的 RPC
    pub async fn server_side_rpc_handler(
        &self,
        content: RpcRequest,
    ) -> Result<RpcReply, ProtocolError> {
        self.service.rpc_handler(self.config.port, content).await
    }
}

fn random_name() -> String {
    let mut rng = OsRng;
    let suffix: String = (0..5).map(|_| random_letter(&mut rng)).collect();
    format!("{NAME_PREFIX}{suffix}")
}

/// 拒绝采样：只接受小于 234（26 的整数倍）的字节，各字母等概率
fn random_letter(rng: &mut impl RngCore) -> char {
    loop {
        let byte = (rng.next_u32() & 0xFF) as u8;
        if byte < 234 {
            return char::from(b'a' + byte % 26);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ems_protocol::{ConverterRegistry, InMemoryGateway, ServiceOptions, TcpListenService};
    use serde_json::json;
    use std::sync::Arc;

    fn config(name: Option<&str>) -> ListenConfig {
        let mut value = json!({
            "port": 0,
            "accessToken": "token-a",
            "devices": [{ "deviceName": "meter-1", "rpc": [{ "tag": "setValve", "command": "writeValve" }] }]
        });
        if let Some(name) = name {
            value["name"] = json!(name);
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_random_name() {
        let name = random_name();
        let suffix = name.strip_prefix(NAME_PREFIX).unwrap();
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
    }

    /// 固定字节序列的随机源
    struct Sequence(Vec<u32>);

    impl RngCore for Sequence {
        fn next_u32(&mut self) -> u32 {
            self.0.remove(0)
        }

        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32())
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                *byte = self.next_u32() as u8;
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn test_random_letter_rejects_biased_bytes() {
        let mut rng = Sequence(vec![250, 234, 0x1_00 + 27, 25]);
        assert_eq!(random_letter(&mut rng), 'b');
        assert_eq!(random_letter(&mut rng), 'z');
    }

    #[tokio::test]
    async fn test_open_rpc_close() {
        let gateway = Arc::new(InMemoryGateway::new());
        let service = TcpListenService::new(
            gateway.clone(),
            Arc::new(ConverterRegistry::new()),
            ServiceOptions::default(),
        )
        .spawn();

        let connector = TcpConnector::new(config(None), service.clone());
        assert!(connector.name().starts_with(NAME_PREFIX));
        connector.open().await.unwrap();
        assert_eq!(
            gateway.device("meter-1").unwrap().connector,
            connector.name()
        );

        let reply = connector
            .server_side_rpc_handler(RpcRequest::new("meter-1", 1, "setValve", json!(true)))
            .await
            .unwrap();
        assert!(reply.is_error());

        connector.close().await.unwrap();
        assert!(!service.is_listening(connector.port()).await);
        assert!(gateway.device("meter-1").is_none());
    }

    #[tokio::test]
    async fn test_named_connector_keeps_name() {
        let service = TcpListenService::new(
            Arc::new(InMemoryGateway::new()),
            Arc::new(ConverterRegistry::new()),
            ServiceOptions::default(),
        )
        .spawn();
        let connector = TcpConnector::new(config(Some("Water")), service);
        assert_eq!(connector.name(), "Water");
    }
}
