//! 共享监听端口
//!
//! 端口表只在服务任务内修改，其他线程通过 [`ListenHandle`] 投递命令。
//! 同一端口可以被多个连接器共享：每次 `add_listen` 引用计数加一，
//! 每次 `rem_listen` 减一，减到零时停止监听并关闭工厂。

use crate::config::{FrameMethod, ListenConfig};
use crate::converter::ConverterRegistry;
use crate::error::ProtocolError;
use crate::factory::{ConnectionFactory, FactoryHandle};
use crate::gateway::Gateway;
use crate::session::run_session;
use domain::{RpcReply, RpcRequest};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 服务参数
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// 单个请求的应答超时
    pub request_timeout: Duration,
    pub bind_host: IpAddr,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum ServiceCommand {
    AddListen {
        config: ListenConfig,
        reply: Reply<Result<(), ProtocolError>>,
    },
    RemListen {
        port: u16,
        config: ListenConfig,
        reply: Reply<Result<(), ProtocolError>>,
    },
    ClearListen {
        reply: Reply<()>,
    },
    Factory {
        port: u16,
        reply: Reply<Option<FactoryHandle>>,
    },
    LocalAddr {
        port: u16,
        reply: Reply<Option<SocketAddr>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// 服务句柄，可跨线程克隆
#[derive(Debug, Clone)]
pub struct ListenHandle {
    tx: mpsc::UnboundedSender<ServiceCommand>,
}

impl std::fmt::Debug for ServiceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AddListen { .. } => "AddListen",
            Self::RemListen { .. } => "RemListen",
            Self::ClearListen { .. } => "ClearListen",
            Self::Factory { .. } => "Factory",
            Self::LocalAddr { .. } => "LocalAddr",
            Self::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl ListenHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ServiceCommand,
    ) -> Result<T, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| ProtocolError::ChannelClosed)?;
        rx.await.map_err(|_| ProtocolError::ChannelClosed)
    }

    /// 在 `config.port` 上监听，端口已在监听时合并设备并增加引用计数
    pub async fn add_listen(&self, config: ListenConfig) -> Result<(), ProtocolError> {
        self.call(|reply| ServiceCommand::AddListen { config, reply })
            .await?
    }

    /// 移除连接器的设备并减少引用计数，减到零时停止监听
    pub async fn rem_listen(&self, port: u16, config: ListenConfig) -> Result<(), ProtocolError> {
        self.call(|reply| ServiceCommand::RemListen { port, config, reply })
            .await?
    }

    /// 无条件停止全部监听
    pub async fn clear_listen(&self) -> Result<(), ProtocolError> {
        self.call(|reply| ServiceCommand::ClearListen { reply }).await
    }

    /// 把 RPC 交给端口的工厂处理
    pub async fn rpc_handler(&self, port: u16, request: RpcRequest) -> Result<RpcReply, ProtocolError> {
        let factory = self
            .call(|reply| ServiceCommand::Factory { port, reply })
            .await?
            .ok_or(ProtocolError::ListenNotFound(port))?;
        factory.rpc(request).await
    }

    pub async fn is_listening(&self, port: u16) -> bool {
        matches!(self.local_addr(port).await, Ok(Some(_)))
    }

    /// 端口实际绑定的地址（配置端口为 0 时由系统分配）
    pub async fn local_addr(&self, port: u16) -> Result<Option<SocketAddr>, ProtocolError> {
        self.call(|reply| ServiceCommand::LocalAddr { port, reply })
            .await
    }

    /// 停止全部监听并退出服务任务
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        self.call(|reply| ServiceCommand::Shutdown { reply }).await
    }
}

struct PortBinding {
    method: FrameMethod,
    local_addr: SocketAddr,
    factory: FactoryHandle,
    accept: JoinHandle<()>,
    ref_count: usize,
}

impl PortBinding {
    async fn stop(self) {
        self.accept.abort();
        self.factory.shutdown().await;
    }
}

/// 端口注册表
pub struct TcpListenService {
    gateway: Arc<dyn Gateway>,
    converters: Arc<ConverterRegistry>,
    options: ServiceOptions,
    bindings: HashMap<u16, PortBinding>,
}

impl TcpListenService {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        converters: Arc<ConverterRegistry>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            gateway,
            converters,
            options,
            bindings: HashMap::new(),
        }
    }

    /// 在当前运行时上启动服务任务
    pub fn spawn(self) -> ListenHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx));
        ListenHandle { tx }
    }

    /// 在独立线程的单线程运行时上启动服务任务
    pub fn start(self) -> Result<ListenHandle, ProtocolError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("ems-listen".to_string())
            .spawn(move || runtime.block_on(self.run(rx)))?;
        Ok(ListenHandle { tx })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ServiceCommand>) {
        info!(target: "ems.service", "listen_service_started");
        while let Some(command) = rx.recv().await {
            match command {
                ServiceCommand::AddListen { config, reply } => {
                    let result = self.add_listen(config).await;
                    let _ = reply.send(result);
                }
                ServiceCommand::RemListen {
                    port,
                    config,
                    reply,
                } => {
                    let result = self.rem_listen(port, config).await;
                    let _ = reply.send(result);
                }
                ServiceCommand::ClearListen { reply } => {
                    self.clear_listen().await;
                    let _ = reply.send(());
                }
                ServiceCommand::Factory { port, reply } => {
                    let factory = self.bindings.get(&port).map(|binding| binding.factory.clone());
                    let _ = reply.send(factory);
                }
                ServiceCommand::LocalAddr { port, reply } => {
                    let addr = self.bindings.get(&port).map(|binding| binding.local_addr);
                    let _ = reply.send(addr);
                }
                ServiceCommand::Shutdown { reply } => {
                    self.clear_listen().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        self.clear_listen().await;
        info!(target: "ems.service", "listen_service_stopped");
    }

    async fn add_listen(&mut self, config: ListenConfig) -> Result<(), ProtocolError> {
        let method = config.frame_method()?;
        let port = config.port;
        let connector = config.connector_name();

        if let Some(binding) = self.bindings.get_mut(&port) {
            if binding.method != method {
                return Err(ProtocolError::Config(format!(
                    "port {} already serves method {}, requested {}",
                    port, binding.method, method
                )));
            }
            binding.factory.update_devices(config).await?;
            binding.ref_count += 1;
            info!(
                target: "ems.service",
                port,
                connector = %connector,
                ref_count = binding.ref_count,
                "listen_shared"
            );
            return Ok(());
        }

        let listener = TcpListener::bind((self.options.bind_host, port)).await?;
        let local_addr = listener.local_addr()?;
        let factory = ConnectionFactory::spawn(method, self.gateway.clone(), self.converters.clone());
        if let Err(err) = factory.add_devices(config).await {
            factory.shutdown().await;
            return Err(err);
        }
        let accept = tokio::spawn(accept_loop(
            listener,
            method,
            self.options.request_timeout,
            factory.clone(),
        ));
        self.bindings.insert(
            port,
            PortBinding {
                method,
                local_addr,
                factory,
                accept,
                ref_count: 1,
            },
        );
        info!(
            target: "ems.service",
            port,
            addr = %local_addr,
            method = %method,
            connector = %connector,
            "listen_started"
        );
        Ok(())
    }

    async fn rem_listen(&mut self, port: u16, config: ListenConfig) -> Result<(), ProtocolError> {
        let binding = self
            .bindings
            .get_mut(&port)
            .ok_or(ProtocolError::ListenNotFound(port))?;
        binding.ref_count = binding.ref_count.saturating_sub(1);
        if let Err(err) = binding.factory.remove_devices(config).await {
            warn!(target: "ems.service", port, error = %err, "remove_devices_failed");
        }
        info!(target: "ems.service", port, ref_count = binding.ref_count, "listen_released");

        if binding.ref_count == 0 {
            if let Some(binding) = self.bindings.remove(&port) {
                binding.stop().await;
                info!(target: "ems.service", port, "listen_stopped");
            }
        }
        Ok(())
    }

    async fn clear_listen(&mut self) {
        for (port, binding) in self.bindings.drain() {
            binding.stop().await;
            info!(target: "ems.service", port, "listen_stopped");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    method: FrameMethod,
    timeout: Duration,
    factory: FactoryHandle,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(target: "ems.service", peer = %peer, "connection_accepted");
                tokio::spawn(run_session(stream, peer, method, timeout, factory.clone()));
            }
            Err(err) => {
                error!(target: "ems.service", error = %err, "accept_failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
