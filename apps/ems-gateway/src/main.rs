//! 现场设备网关：按连接器配置监听端口，轮询设备并转发数据。

mod connector;

use connector::TcpConnector;
use ems_config::AppConfig;
use ems_protocol::{
    ConverterRegistry, InMemoryGateway, ListenConfig, ServiceOptions, TcpListenService,
};
use ems_telemetry::{init_tracing, metrics};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在）
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing();

    let listen_configs = ListenConfig::load_all(&config.connectors_path)?;
    let gateway = Arc::new(InMemoryGateway::new());
    let options = ServiceOptions {
        request_timeout: config.request_timeout(),
        ..ServiceOptions::default()
    };
    let service = TcpListenService::new(gateway, Arc::new(ConverterRegistry::new()), options);
    // 网络事件循环默认独占一个线程
    let handle = if config.event_loop_dedicated {
        service.start()?
    } else {
        service.spawn()
    };

    let mut connectors = Vec::new();
    for listen in listen_configs {
        let connector = TcpConnector::new(listen, handle.clone());
        match connector.open().await {
            Ok(()) => connectors.push(connector),
            Err(err) => {
                error!(connector = %connector.name(), port = connector.port(), error = %err, "connector_open_failed");
            }
        }
    }
    info!(connectors = connectors.len(), "gateway_started");

    tokio::signal::ctrl_c().await?;

    for connector in &connectors {
        if let Err(err) = connector.close().await {
            error!(connector = %connector.name(), error = %err, "connector_close_failed");
        }
    }
    handle.shutdown().await?;
    info!(metrics = ?metrics().snapshot(), "gateway_stopped");
    Ok(())
}
