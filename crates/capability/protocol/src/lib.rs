//! # 网关传输与协议核心
//!
//! 接受现场设备的 TCP 连接，按令牌认证后在连接上收发二进制请求/应答：
//! - **端口注册表**：多个连接器共享监听端口，按引用计数启停
//! - **连接工厂**：每个端口一个，持有设备注册表、客户端表与轮询任务
//! - **会话**：未认证 → 已认证 → 关闭，认证后的帧交给事务管理器
//! - **事务管理**：每个连接同一时刻只有一个在途请求，超时推进队列
//!
//! ## 架构设计
//!
//! ```text
//! TcpConnector ──► ListenHandle ──► TcpListenService (端口表)
//!                                        │
//!                                        ▼
//!                               ConnectionFactory (每端口)
//!                               ├── DeviceRegistry ──► Gateway (清单/存储/RPC 应答)
//!                               ├── PollScheduler
//!                               └── SessionHandle ──► Session ──► TransactionManager
//!                                                        │
//!                                                        ▼
//!                                                   ems-codec (meter / rtu)
//! ```
//!
//! ## 配置格式
//!
//! ```json
//! {
//!   "name": "Water Meters",
//!   "port": 9000,
//!   "protocol": "usr",
//!   "method": "meter",
//!   "accessToken": "token-a",
//!   "devices": [{
//!     "deviceName": "meter-1",
//!     "meterAddress": "11223344556677",
//!     "timeseriesPollPeriod": 5000,
//!     "sendDataOnlyOnChange": true,
//!     "timeseries": [{ "tag": "data", "command": "readData" }],
//!     "rpc": [{ "tag": "setValve", "command": "writeValve" }]
//!   }]
//! }
//! ```

mod config;
mod converter;
mod error;
mod factory;
mod framer;
mod gateway;
mod registry;
mod request;
mod scheduler;
mod service;
mod session;
mod transaction;

pub use config::{
    DeviceConfig, FrameMethod, ListenConfig, PointConfig, RpcCommandConfig, USR_PROTOCOL,
    effective_period,
};
pub use converter::{
    BYTES_CONVERTER, BytesDownlinkConverter, BytesUplinkConverter, ConvertContext, ConverterError,
    ConverterRegistry, DownlinkConverter, UplinkConverter, ValueType,
};
pub use error::ProtocolError;
pub use factory::FactoryHandle;
pub use framer::{Inbound, SessionCodec};
pub use gateway::{Gateway, GatewayDevice, InMemoryGateway};
pub use registry::{DeviceRecord, DeviceRegistry};
pub use request::{WireRequest, WireResponse};
pub use scheduler::{PollScheduler, job_id};
pub use service::{ListenHandle, ServiceOptions, TcpListenService};
pub use session::SessionHandle;
pub use transaction::{
    FailureReason, OutcomeSender, PendingResponse, TransactionManager, TransactionOutcome,
};
