//! 监听与设备配置
//!
//! ```json
//! {
//!   "name": "Tcp Server meter",
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

use crate::error::ProtocolError;
use domain::PollKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// 唯一支持的会话协议（令牌认证 + 二进制帧）
pub const USR_PROTOCOL: &str = "usr";

/// 会话上使用的帧格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameMethod {
    /// CJ/T188 表计帧
    Meter,
    /// Modbus RTU
    Rtu,
}

impl FrameMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meter => "meter",
            Self::Rtu => "rtu",
        }
    }
}

impl fmt::Display for FrameMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameMethod {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "meter" => Ok(Self::Meter),
            "rtu" => Ok(Self::Rtu),
            other => Err(ProtocolError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// 一个逻辑连接器的监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub access_token: String,
    /// 上行转换器名称，缺省为字节转换器
    #[serde(default)]
    pub converter: Option<String>,
    #[serde(default)]
    pub downlink_converter: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_protocol() -> String {
    USR_PROTOCOL.to_string()
}

fn default_method() -> String {
    FrameMethod::Meter.as_str().to_string()
}

impl ListenConfig {
    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Config(e.to_string()))
    }

    /// 读取 JSON 数组形式的配置文件
    pub fn load_all(path: &Path) -> Result<Vec<Self>, ProtocolError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))
    }

    /// 校验协议并解析帧格式
    pub fn frame_method(&self) -> Result<FrameMethod, ProtocolError> {
        if self.protocol != USR_PROTOCOL {
            return Err(ProtocolError::UnsupportedProtocol(self.protocol.clone()));
        }
        self.method.parse()
    }

    /// 连接器名称，未命名时使用端口号
    pub fn connector_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Tcp Server {}", self.port))
    }
}

/// 设备配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub device_name: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// Modbus 从站地址
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// 14 位十六进制表地址
    #[serde(default)]
    pub meter_address: Option<String>,
    /// CJ/T188 表类型
    #[serde(default = "default_meter_type")]
    pub meter_type: u8,
    /// 属性轮询周期（毫秒）
    #[serde(default)]
    pub attributes_poll_period: Option<u64>,
    /// 时序轮询周期（毫秒）
    #[serde(default)]
    pub timeseries_poll_period: Option<u64>,
    #[serde(default)]
    pub send_data_only_on_change: bool,
    #[serde(default)]
    pub attributes: Vec<PointConfig>,
    #[serde(default)]
    pub timeseries: Vec<PointConfig>,
    #[serde(default)]
    pub rpc: Vec<RpcCommandConfig>,
}

fn default_device_type() -> String {
    "default".to_string()
}

fn default_unit_id() -> u8 {
    1
}

fn default_meter_type() -> u8 {
    0x10
}

impl DeviceConfig {
    pub fn poll_period_ms(&self, kind: PollKind) -> Option<u64> {
        match kind {
            PollKind::Attributes => self.attributes_poll_period,
            PollKind::Timeseries => self.timeseries_poll_period,
        }
    }

    pub fn points(&self, kind: PollKind) -> &[PointConfig] {
        match kind {
            PollKind::Attributes => &self.attributes,
            PollKind::Timeseries => &self.timeseries,
        }
    }

    /// 配置了周期且有点位时才需要轮询
    pub fn poll_period(&self, kind: PollKind) -> Option<Duration> {
        if self.points(kind).is_empty() {
            return None;
        }
        self.poll_period_ms(kind).map(effective_period)
    }

    pub fn rpc_command(&self, method: &str) -> Option<&RpcCommandConfig> {
        self.rpc.iter().find(|command| command.tag == method)
    }
}

/// 轮询周期下限为 1 秒
pub fn effective_period(period_ms: u64) -> Duration {
    Duration::from_millis(period_ms).max(Duration::from_secs(1))
}

/// 轮询点位
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointConfig {
    pub tag: String,
    #[serde(rename = "type", default = "default_value_type")]
    pub value_type: String,
    #[serde(default = "default_read_function")]
    pub function_code: u8,
    #[serde(default)]
    pub address: u16,
    #[serde(default = "default_objects_count")]
    pub objects_count: u16,
    /// 表计读命令（readData / readAddress / readUser1 / readUser2）
    #[serde(default)]
    pub command: Option<String>,
}

/// RPC 写命令
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCommandConfig {
    /// RPC 方法名
    pub tag: String,
    #[serde(rename = "type", default = "default_value_type")]
    pub value_type: String,
    #[serde(default = "default_write_function")]
    pub function_code: u8,
    #[serde(default)]
    pub address: u16,
    #[serde(default = "default_objects_count")]
    pub objects_count: u16,
    /// 表计写命令（writeAddress / writePurchase / writeValve / ...）
    #[serde(default)]
    pub command: Option<String>,
}

fn default_value_type() -> String {
    "16uint".to_string()
}

fn default_read_function() -> u8 {
    3
}

fn default_write_function() -> u8 {
    6
}

fn default_objects_count() -> u16 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_config() {
        let json = r#"{
            "port": 9000,
            "accessToken": "token-a",
            "devices": [{
                "deviceName": "meter-1",
                "meterAddress": "11223344556677",
                "timeseriesPollPeriod": 500,
                "timeseries": [{"tag": "data", "command": "readData"}],
                "rpc": [{"tag": "setValve", "command": "writeValve"}]
            }]
        }"#;
        let config = ListenConfig::from_json(json).unwrap();
        assert_eq!(config.protocol, "usr");
        assert_eq!(config.frame_method().unwrap(), FrameMethod::Meter);
        assert_eq!(config.connector_name(), "Tcp Server 9000");

        let device = &config.devices[0];
        assert_eq!(device.device_type, "default");
        assert_eq!(device.unit_id, 1);
        assert_eq!(device.meter_type, 0x10);
        assert!(!device.send_data_only_on_change);
        assert_eq!(device.timeseries[0].value_type, "16uint");
        assert_eq!(
            device.poll_period(PollKind::Timeseries),
            Some(Duration::from_secs(1))
        );
        assert_eq!(device.poll_period(PollKind::Attributes), None);
        assert_eq!(device.rpc_command("setValve").unwrap().function_code, 6);
    }

    #[test]
    fn test_rejects_unknown_protocol_and_method() {
        let mut config =
            ListenConfig::from_json(r#"{"port": 1, "accessToken": "t", "protocol": "mqtt"}"#)
                .unwrap();
        assert!(matches!(
            config.frame_method(),
            Err(ProtocolError::UnsupportedProtocol(name)) if name == "mqtt"
        ));

        config.protocol = USR_PROTOCOL.to_string();
        config.method = "tcp".to_string();
        assert!(matches!(
            config.frame_method(),
            Err(ProtocolError::UnsupportedMethod(name)) if name == "tcp"
        ));
    }

    #[test]
    fn test_effective_period_clamps_to_one_second() {
        assert_eq!(effective_period(0), Duration::from_secs(1));
        assert_eq!(effective_period(999), Duration::from_secs(1));
        assert_eq!(effective_period(1500), Duration::from_millis(1500));
        assert_eq!(effective_period(60_000), Duration::from_secs(60));
    }
}
