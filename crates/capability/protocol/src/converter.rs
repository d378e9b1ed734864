//! 上下行转换器
//!
//! 上行：把一次轮询的应答转换为遥测/属性键值；下行：把 RPC 参数转换为写命令负载。
//! 转换器按名称预先注册到 [`ConverterRegistry`]，监听配置按名称选择，缺省使用字节转换器。

use crate::config::{DeviceConfig, PointConfig, RpcCommandConfig};
use crate::error::ProtocolError;
use crate::request::WireResponse;
use domain::{ConvertedData, KeyValue, PollKind};
use ems_codec::meter::{FieldName, NsCommandKind, format_address, parse_address};
use ems_codec::modbus_rtu::RtuResponse;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

/// 缺省转换器名称
pub const BYTES_CONVERTER: &str = "bytes";

/// 转换错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConverterError {
    #[error("unsupported value type: {0}")]
    UnsupportedType(String),

    #[error("not enough data for {tag}: need {needed} bytes, got {actual}")]
    NotEnoughData {
        tag: String,
        needed: usize,
        actual: usize,
    },

    #[error("device returned exception code {0}")]
    Exception(u8),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("converter panicked: {0}")]
    Panicked(String),
}

/// 上行转换上下文
pub struct ConvertContext<'a> {
    pub device: &'a DeviceConfig,
    pub kind: PollKind,
    pub point: &'a PointConfig,
}

pub trait UplinkConverter: Send + Sync {
    fn convert(
        &self,
        context: &ConvertContext<'_>,
        response: &WireResponse,
    ) -> Result<ConvertedData, ConverterError>;
}

pub trait DownlinkConverter: Send + Sync {
    fn convert(&self, command: &RpcCommandConfig, params: &Value) -> Result<Vec<u8>, ConverterError>;
}

/// 调用转换器；转换器内部 panic 转为 [`ConverterError::Panicked`]
pub(crate) fn guarded<T>(
    call: impl FnOnce() -> Result<T, ConverterError>,
) -> Result<T, ConverterError> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Err(ConverterError::Panicked(message))
    })
}

/// 寄存器数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bits,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    String,
}

impl FromStr for ValueType {
    type Err = ConverterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "bits" => Ok(Self::Bits),
            "8uint" => Ok(Self::Uint8),
            "16int" => Ok(Self::Int16),
            "16uint" => Ok(Self::Uint16),
            "32int" => Ok(Self::Int32),
            "32uint" => Ok(Self::Uint32),
            "32float" => Ok(Self::Float32),
            "64float" => Ok(Self::Float64),
            "string" => Ok(Self::String),
            other => Err(ConverterError::UnsupportedType(other.to_string())),
        }
    }
}

impl ValueType {
    fn width(&self) -> usize {
        match self {
            Self::Bits | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 => 8,
            Self::String => 0,
        }
    }
}

/// 缺省上行转换器：寄存器按类型大端解析，表计字段按小端无符号输出
#[derive(Debug, Default)]
pub struct BytesUplinkConverter;

impl UplinkConverter for BytesUplinkConverter {
    fn convert(
        &self,
        context: &ConvertContext<'_>,
        response: &WireResponse,
    ) -> Result<ConvertedData, ConverterError> {
        let mut data = ConvertedData::new(
            context.device.device_name.clone(),
            context.device.device_type.clone(),
        );
        match response {
            WireResponse::Meter(response) => {
                for field in response.fields() {
                    let value = match field.name {
                        FieldName::Address => json!(format_address(&field.data)),
                        _ => json!(field.as_u64_le()),
                    };
                    data.push(context.kind, KeyValue::new(field.name.as_str(), value));
                }
            }
            WireResponse::Rtu(response) => {
                let value = decode_registers(context.point, response)?;
                data.push(context.kind, KeyValue::new(context.point.tag.clone(), value));
            }
        }
        Ok(data)
    }
}

fn decode_registers(point: &PointConfig, response: &RtuResponse) -> Result<Value, ConverterError> {
    if let Some(code) = response.exception_code() {
        return Err(ConverterError::Exception(code));
    }
    let value_type: ValueType = point.value_type.parse()?;
    let bytes = response.values();
    let need = |needed: usize| take(bytes, needed, &point.tag);

    let value = match value_type {
        ValueType::Bits => {
            let count = usize::from(point.objects_count.max(1));
            let packed = need(count.div_ceil(8))?;
            let bits: Vec<bool> = (0..count)
                .map(|index| packed[index / 8] & (1 << (index % 8)) != 0)
                .collect();
            if count == 1 {
                json!(bits[0])
            } else {
                json!(bits)
            }
        }
        ValueType::Uint8 => json!(need(1)?[0]),
        ValueType::Int16 => json!(i16::from_be_bytes(array(need(2)?))),
        ValueType::Uint16 => json!(u16::from_be_bytes(array(need(2)?))),
        ValueType::Int32 => json!(i32::from_be_bytes(array(need(4)?))),
        ValueType::Uint32 => json!(u32::from_be_bytes(array(need(4)?))),
        ValueType::Float32 => json!(f32::from_be_bytes(array(need(4)?))),
        ValueType::Float64 => json!(f64::from_be_bytes(array(need(8)?))),
        ValueType::String => {
            let text = String::from_utf8_lossy(bytes);
            json!(text.trim_end_matches('\0'))
        }
    };
    Ok(value)
}

fn take<'a>(bytes: &'a [u8], needed: usize, tag: &str) -> Result<&'a [u8], ConverterError> {
    bytes.get(..needed).ok_or_else(|| ConverterError::NotEnoughData {
        tag: tag.to_string(),
        needed,
        actual: bytes.len(),
    })
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// 缺省下行转换器
///
/// 表计命令输出序号之后的明文字段（写购买为 `times u16 LE | purchases u32 LE`），
/// Modbus 写命令按功能码和类型输出寄存器或线圈数据。
#[derive(Debug, Default)]
pub struct BytesDownlinkConverter;

impl DownlinkConverter for BytesDownlinkConverter {
    fn convert(&self, command: &RpcCommandConfig, params: &Value) -> Result<Vec<u8>, ConverterError> {
        match command.command.as_deref() {
            Some(name) => {
                let kind = NsCommandKind::from_str(name)
                    .map_err(|err| ConverterError::InvalidParams(err.to_string()))?;
                meter_payload(kind, params)
            }
            None => register_payload(command, params),
        }
    }
}

fn meter_payload(kind: NsCommandKind, params: &Value) -> Result<Vec<u8>, ConverterError> {
    let payload = match kind {
        NsCommandKind::ReadData
        | NsCommandKind::ReadAddress
        | NsCommandKind::ReadUser1
        | NsCommandKind::ReadUser2 => Vec::new(),
        NsCommandKind::WriteAddress => {
            let text = params
                .get("address")
                .or(Some(params))
                .and_then(Value::as_str)
                .ok_or_else(|| ConverterError::InvalidParams("address is required".to_string()))?;
            parse_address(text)
                .map_err(|err| ConverterError::InvalidParams(err.to_string()))?
                .to_vec()
        }
        NsCommandKind::WritePurchase => {
            let times: u16 = int_param(params, "times")?;
            let purchases: u32 = int_param(params, "purchases")?;
            let mut payload = times.to_le_bytes().to_vec();
            payload.extend_from_slice(&purchases.to_le_bytes());
            payload
        }
        NsCommandKind::WriteValve => {
            let open = params
                .get("open")
                .or(Some(params))
                .and_then(Value::as_bool)
                .ok_or_else(|| ConverterError::InvalidParams("open is required".to_string()))?;
            vec![if open { 0x55 } else { 0x99 }]
        }
        NsCommandKind::WriteReset => {
            let reset = params.get("reset").and_then(Value::as_str).unwrap_or("vendor");
            match reset {
                "vendor" => vec![0xC3],
                "unit" => vec![0x5A],
                other => {
                    return Err(ConverterError::InvalidParams(format!(
                        "reset must be vendor or unit, got {other}"
                    )));
                }
            }
        }
        NsCommandKind::WriteUser1 => {
            let unit_code: u16 = int_param(params, "unitCode")?;
            let user_no: u16 = int_param(params, "userNo")?;
            let meter_no: u8 = int_param(params, "meterNo")?;
            let mut payload = unit_code.to_le_bytes().to_vec();
            payload.extend_from_slice(&user_no.to_le_bytes());
            payload.push(meter_no);
            payload
        }
        NsCommandKind::WriteUser2 => vec![
            int_param(params, "alarmValue")?,
            int_param(params, "overdraft")?,
            int_param(params, "exceed")?,
        ],
    };
    Ok(payload)
}

fn int_param<T: TryFrom<u64>>(params: &Value, key: &str) -> Result<T, ConverterError> {
    let value = params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ConverterError::InvalidParams(format!("{key} is required")))?;
    T::try_from(value).map_err(|_| ConverterError::InvalidParams(format!("{key} out of range")))
}

fn register_payload(command: &RpcCommandConfig, params: &Value) -> Result<Vec<u8>, ConverterError> {
    let value = params.get("value").unwrap_or(params);
    match command.function_code {
        5 => Ok(vec![u8::from(as_bool(value)?)]),
        15 => {
            let bits: Vec<bool> = match value {
                Value::Array(items) => items.iter().map(as_bool).collect::<Result<_, _>>()?,
                other => vec![as_bool(other)?],
            };
            let mut packed = vec![0u8; bits.len().div_ceil(8)];
            for (index, bit) in bits.iter().enumerate() {
                if *bit {
                    packed[index / 8] |= 1 << (index % 8);
                }
            }
            Ok(packed)
        }
        _ => {
            let value_type: ValueType = command.value_type.parse()?;
            encode_value(value_type, value)
        }
    }
}

fn as_bool(value: &Value) -> Result<bool, ConverterError> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(number) => Ok(number.as_f64().is_some_and(|n| n != 0.0)),
        other => Err(ConverterError::InvalidParams(format!("expected bool, got {other}"))),
    }
}

fn encode_value(value_type: ValueType, value: &Value) -> Result<Vec<u8>, ConverterError> {
    let invalid = || ConverterError::InvalidParams(format!("cannot encode {value} as {value_type:?}"));
    let bytes = match value_type {
        ValueType::Bits => vec![u8::from(as_bool(value)?)],
        ValueType::Uint8 => vec![value.as_u64().and_then(|n| u8::try_from(n).ok()).ok_or_else(invalid)?],
        ValueType::Int16 => value
            .as_i64()
            .and_then(|n| i16::try_from(n).ok())
            .ok_or_else(invalid)?
            .to_be_bytes()
            .to_vec(),
        ValueType::Uint16 => value
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(invalid)?
            .to_be_bytes()
            .to_vec(),
        ValueType::Int32 => value
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(invalid)?
            .to_be_bytes()
            .to_vec(),
        ValueType::Uint32 => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(invalid)?
            .to_be_bytes()
            .to_vec(),
        ValueType::Float32 => (value.as_f64().ok_or_else(invalid)? as f32).to_be_bytes().to_vec(),
        ValueType::Float64 => value.as_f64().ok_or_else(invalid)?.to_be_bytes().to_vec(),
        ValueType::String => {
            let mut bytes = value.as_str().ok_or_else(invalid)?.as_bytes().to_vec();
            // 寄存器按 2 字节对齐
            if bytes.len() % 2 == 1 {
                bytes.push(0);
            }
            bytes
        }
    };
    debug_assert!(value_type == ValueType::String || bytes.len() >= value_type.width());
    Ok(bytes)
}

/// 按名称注册的转换器
pub struct ConverterRegistry {
    uplinks: HashMap<String, Arc<dyn UplinkConverter>>,
    downlinks: HashMap<String, Arc<dyn DownlinkConverter>>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConverterRegistry {
    /// 只含缺省字节转换器
    pub fn new() -> Self {
        let mut registry = Self {
            uplinks: HashMap::new(),
            downlinks: HashMap::new(),
        };
        registry.register_uplink(BYTES_CONVERTER, Arc::new(BytesUplinkConverter));
        registry.register_downlink(BYTES_CONVERTER, Arc::new(BytesDownlinkConverter));
        registry
    }

    pub fn register_uplink(&mut self, name: impl Into<String>, converter: Arc<dyn UplinkConverter>) {
        self.uplinks.insert(name.into(), converter);
    }

    pub fn register_downlink(
        &mut self,
        name: impl Into<String>,
        converter: Arc<dyn DownlinkConverter>,
    ) {
        self.downlinks.insert(name.into(), converter);
    }

    pub fn uplink(&self, name: Option<&str>) -> Result<Arc<dyn UplinkConverter>, ProtocolError> {
        let name = name.unwrap_or(BYTES_CONVERTER);
        self.uplinks
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::ConverterNotFound(name.to_string()))
    }

    pub fn downlink(&self, name: Option<&str>) -> Result<Arc<dyn DownlinkConverter>, ProtocolError> {
        let name = name.unwrap_or(BYTES_CONVERTER);
        self.downlinks
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::ConverterNotFound(name.to_string()))
    }
}
