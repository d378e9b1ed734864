//! 线路请求与应答
//!
//! 把设备配置中的点位或 RPC 命令变成具体帧格式的请求，并负责应答的对应与解码。

use crate::config::{DeviceConfig, FrameMethod, PointConfig, RpcCommandConfig};
use crate::error::ProtocolError;
use bytes::Bytes;
use ems_codec::CodecError;
use ems_codec::meter::{self, NsCommandKind, NsRequest, NsResponse, peek_seq};
use ems_codec::modbus_rtu::{FunctionCode, RtuRequest, RtuResponse};

/// 待发送的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRequest {
    Meter(NsRequest),
    Rtu(RtuRequest),
}

impl WireRequest {
    /// 轮询点位对应的读请求
    pub fn read(
        method: FrameMethod,
        device: &DeviceConfig,
        point: &PointConfig,
    ) -> Result<Self, ProtocolError> {
        match method {
            FrameMethod::Meter => {
                let kind = meter_command(point.command.as_deref(), &point.tag)?;
                if kind.is_write() {
                    return Err(ProtocolError::Config(format!(
                        "point {} uses write command {}",
                        point.tag, kind
                    )));
                }
                let request =
                    NsRequest::from_payload(device.meter_type, meter_address(device)?, kind, &[])?;
                Ok(Self::Meter(request))
            }
            FrameMethod::Rtu => {
                let function = FunctionCode::try_from(point.function_code)?;
                if function.is_write() {
                    return Err(ProtocolError::Config(format!(
                        "point {} uses write function {}",
                        point.tag, point.function_code
                    )));
                }
                Ok(Self::Rtu(RtuRequest::read(
                    device.unit_id,
                    function,
                    point.address,
                    point.objects_count,
                )))
            }
        }
    }

    /// RPC 命令对应的写请求，`payload` 来自下行转换器
    pub fn write(
        method: FrameMethod,
        device: &DeviceConfig,
        command: &RpcCommandConfig,
        payload: &[u8],
    ) -> Result<Self, ProtocolError> {
        match method {
            FrameMethod::Meter => {
                let kind = meter_command(command.command.as_deref(), &command.tag)?;
                let request = NsRequest::from_payload(
                    device.meter_type,
                    meter_address(device)?,
                    kind,
                    payload,
                )?;
                Ok(Self::Meter(request))
            }
            FrameMethod::Rtu => {
                let function = FunctionCode::try_from(command.function_code)?;
                if !function.is_write() {
                    return Err(ProtocolError::Config(format!(
                        "rpc {} uses read function {}",
                        command.tag, command.function_code
                    )));
                }
                Ok(Self::Rtu(RtuRequest::write(
                    device.unit_id,
                    function,
                    command.address,
                    command.objects_count,
                    payload,
                )))
            }
        }
    }

    /// 编码；RTU 没有事务号，`tid` 被忽略
    pub fn encode(&self, tid: u8) -> Result<Bytes, CodecError> {
        match self {
            Self::Meter(request) => request.encode(tid).map(|buf| buf.freeze()),
            Self::Rtu(request) => request.encode().map(|buf| buf.freeze()),
        }
    }

    /// 收到的帧是否是本请求的应答
    pub fn correlates(&self, tid: u8, frame: &[u8]) -> bool {
        match self {
            Self::Meter(_) => peek_seq(frame) == Some(tid),
            Self::Rtu(request) => {
                frame.len() >= 2
                    && frame[0] == request.unit_id
                    && frame[1] & 0x7F == request.function.code()
            }
        }
    }

    pub fn decode_response(&self, frame: &[u8]) -> Result<WireResponse, CodecError> {
        match self {
            Self::Meter(request) => NsResponse::decode(request.kind(), frame).map(WireResponse::Meter),
            Self::Rtu(_) => RtuResponse::decode(frame).map(WireResponse::Rtu),
        }
    }

    /// 应答是否为写确认
    pub fn acknowledged_by(&self, response: &WireResponse) -> bool {
        match (self, response) {
            (Self::Meter(request), WireResponse::Meter(response)) => {
                response.acknowledges(request.kind())
            }
            (Self::Rtu(request), WireResponse::Rtu(response)) => {
                response.matches(request) && !response.is_exception()
            }
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Meter(request) => request.kind().to_string(),
            Self::Rtu(request) => format!(
                "unit {} fc {} @{}",
                request.unit_id,
                request.function.code(),
                request.address
            ),
        }
    }
}

fn meter_command(command: Option<&str>, tag: &str) -> Result<NsCommandKind, ProtocolError> {
    let command = command
        .ok_or_else(|| ProtocolError::Config(format!("{tag} has no meter command")))?;
    Ok(command.parse::<NsCommandKind>()?)
}

fn meter_address(device: &DeviceConfig) -> Result<Option<[u8; meter::ADDRESS_LEN]>, ProtocolError> {
    device
        .meter_address
        .as_deref()
        .map(meter::parse_address)
        .transpose()
        .map_err(ProtocolError::from)
}

/// 解码后的应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireResponse {
    Meter(NsResponse),
    Rtu(RtuResponse),
}

impl WireResponse {
    pub fn checksum_ok(&self) -> bool {
        match self {
            Self::Meter(response) => response.checksum_ok(),
            Self::Rtu(response) => response.crc_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ems_codec::crc16_modbus;
    use ems_codec::meter::{FieldName, MeterFrame};

    fn device() -> DeviceConfig {
        serde_json::from_str(
            r#"{"deviceName": "meter-1", "meterAddress": "11223344556677", "unitId": 2}"#,
        )
        .unwrap()
    }

    fn point(json: &str) -> PointConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_meter_read_request_uses_seq_as_tid() {
        let request = WireRequest::read(
            FrameMethod::Meter,
            &device(),
            &point(r#"{"tag": "data", "command": "readData"}"#),
        )
        .unwrap();
        let frame = request.encode(0x21).unwrap();
        assert_eq!(peek_seq(&frame), Some(0x21));
        assert_eq!(&frame[2..9], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);

        let response = MeterFrame::new(0x10, vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77], 0x81)
            .with_field(FieldName::DataId, [0x1F, 0x90])
            .with_field(FieldName::Seq, [0x21])
            .with_field(FieldName::Empty, vec![0u8; 15])
            .encode()
            .unwrap();
        assert!(request.correlates(0x21, &response));
        assert!(!request.correlates(0x22, &response));
        assert!(request.decode_response(&response).unwrap().checksum_ok());
    }

    #[test]
    fn test_meter_point_needs_read_command() {
        let err = WireRequest::read(
            FrameMethod::Meter,
            &device(),
            &point(r#"{"tag": "valve", "command": "writeValve"}"#),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));

        let err =
            WireRequest::read(FrameMethod::Meter, &device(), &point(r#"{"tag": "x"}"#)).unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));
    }

    #[test]
    fn test_rtu_correlation_ignores_exception_bit() {
        let request = WireRequest::read(
            FrameMethod::Rtu,
            &device(),
            &point(r#"{"tag": "t", "functionCode": 3, "address": 10, "objectsCount": 2}"#),
        )
        .unwrap();
        let mut exception = vec![0x02, 0x83, 0x02];
        let crc = crc16_modbus(&exception);
        exception.extend_from_slice(&crc.to_le_bytes());
        assert!(request.correlates(0, &exception));
        assert!(!request.correlates(0, &[0x03, 0x03, 0x00]));

        let response = request.decode_response(&exception).unwrap();
        assert!(!request.acknowledged_by(&response));
    }

    #[test]
    fn test_rtu_write_requires_write_function() {
        let command: RpcCommandConfig =
            serde_json::from_str(r#"{"tag": "set", "functionCode": 3}"#).unwrap();
        assert!(WireRequest::write(FrameMethod::Rtu, &device(), &command, &[0, 1]).is_err());
    }
}
