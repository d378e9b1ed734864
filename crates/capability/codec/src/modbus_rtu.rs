//! Modbus RTU 应用数据单元
//!
//! `从站 | 功能码 | 数据 | CRC16`，CRC 低字节在前。RTU 不携带事务号，
//! 应答依靠从站地址与功能码与请求对应。

use crate::FrameScan;
use crate::checksum::crc16_modbus;
use crate::error::CodecError;
use bytes::{BufMut, BytesMut};

const EXCEPTION_FLAG: u8 = 0x80;
const MIN_FRAME_LEN: usize = 4;

/// 支持的功能码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl FunctionCode {
    pub fn code(&self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::WriteSingleCoil
                | Self::WriteSingleRegister
                | Self::WriteMultipleCoils
                | Self::WriteMultipleRegisters
        )
    }

    /// 读线圈和离散输入返回位，其余返回寄存器
    pub fn is_bit_access(&self) -> bool {
        matches!(
            self,
            Self::ReadCoils | Self::ReadDiscreteInputs | Self::WriteSingleCoil | Self::WriteMultipleCoils
        )
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(Self::ReadCoils),
            0x02 => Ok(Self::ReadDiscreteInputs),
            0x03 => Ok(Self::ReadHoldingRegisters),
            0x04 => Ok(Self::ReadInputRegisters),
            0x05 => Ok(Self::WriteSingleCoil),
            0x06 => Ok(Self::WriteSingleRegister),
            0x0F => Ok(Self::WriteMultipleCoils),
            0x10 => Ok(Self::WriteMultipleRegisters),
            other => Err(CodecError::UnsupportedFunction(other)),
        }
    }
}

/// RTU 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuRequest {
    pub unit_id: u8,
    pub function: FunctionCode,
    pub address: u16,
    pub quantity: u16,
    /// 写命令的数据（寄存器为大端字节，线圈为打包后的位）
    pub data: Vec<u8>,
}

impl RtuRequest {
    pub fn read(unit_id: u8, function: FunctionCode, address: u16, quantity: u16) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    pub fn write(
        unit_id: u8,
        function: FunctionCode,
        address: u16,
        quantity: u16,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data: data.into(),
        }
    }

    pub fn encode(&self) -> Result<BytesMut, CodecError> {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(self.unit_id);
        buf.put_u8(self.function.code());
        buf.put_u16(self.address);

        match self.function {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters => buf.put_u16(self.quantity),
            FunctionCode::WriteSingleCoil => {
                let on = self.data.iter().any(|byte| *byte != 0);
                buf.put_u16(if on { 0xFF00 } else { 0x0000 });
            }
            FunctionCode::WriteSingleRegister => {
                let value = self.data.get(..2).ok_or(CodecError::Truncated {
                    needed: 2,
                    actual: self.data.len(),
                })?;
                buf.put_slice(value);
            }
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                let count = u8::try_from(self.data.len())
                    .map_err(|_| CodecError::DataAreaTooLong(self.data.len()))?;
                buf.put_u16(self.quantity);
                buf.put_u8(count);
                buf.put_slice(&self.data);
            }
        }

        let crc = crc16_modbus(&buf);
        buf.put_u16_le(crc);
        Ok(buf)
    }
}

/// RTU 应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuResponse {
    pub unit_id: u8,
    /// 线路上的功能码，异常应答带 0x80
    pub function_code: u8,
    /// 功能码之后、CRC 之前的字节
    pub payload: Vec<u8>,
    pub crc_ok: bool,
}

impl RtuResponse {
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(CodecError::Truncated {
                needed: MIN_FRAME_LEN,
                actual: frame.len(),
            });
        }
        let data_len = frame.len() - 2;
        let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
        Ok(Self {
            unit_id: frame[0],
            function_code: frame[1],
            payload: frame[2..data_len].to_vec(),
            crc_ok: received == crc16_modbus(&frame[..data_len]),
        })
    }

    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// 去掉异常标志后的功能码
    pub fn base_function(&self) -> u8 {
        self.function_code & !EXCEPTION_FLAG
    }

    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// 应答是否对应该请求
    pub fn matches(&self, request: &RtuRequest) -> bool {
        self.unit_id == request.unit_id && self.base_function() == request.function.code()
    }

    /// 读命令返回的数据字节（跳过字节计数）
    pub fn values(&self) -> &[u8] {
        if self.is_exception() {
            return &[];
        }
        match self.function_code {
            0x01..=0x04 => self.payload.get(1..).unwrap_or(&[]),
            _ => &self.payload,
        }
    }
}

/// 在字节流中定位下一个 RTU 应答
pub fn scan_rtu_frame(buf: &[u8]) -> FrameScan {
    if buf.len() < 2 {
        return FrameScan::Incomplete;
    }
    let function_code = buf[1];
    let total = if function_code & EXCEPTION_FLAG != 0 {
        5
    } else {
        match function_code {
            0x01..=0x04 => {
                let Some(count) = buf.get(2) else {
                    return FrameScan::Incomplete;
                };
                5 + usize::from(*count)
            }
            0x05 | 0x06 | 0x0F | 0x10 => 8,
            // 无法确定长度，丢掉首字节重新同步
            _ => return FrameScan::Discard(1),
        }
    };
    if buf.len() < total {
        FrameScan::Incomplete
    } else {
        FrameScan::Frame(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16_modbus(body).to_le_bytes());
        frame
    }

    #[test]
    fn test_encode_read_holding_registers() {
        let request = RtuRequest::read(1, FunctionCode::ReadHoldingRegisters, 0, 1);
        assert_eq!(
            request.encode().unwrap().as_ref(),
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );
    }

    #[test]
    fn test_encode_write_single_coil() {
        let request = RtuRequest::write(2, FunctionCode::WriteSingleCoil, 0x10, 1, [1]);
        let bytes = request.encode().unwrap();
        assert_eq!(&bytes[..6], &[0x02, 0x05, 0x00, 0x10, 0xFF, 0x00]);
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn test_encode_write_multiple_registers() {
        let request = RtuRequest::write(
            1,
            FunctionCode::WriteMultipleRegisters,
            0x20,
            2,
            [0x00, 0x0A, 0x01, 0x02],
        );
        let bytes = request.encode().unwrap();
        assert_eq!(
            &bytes[..11],
            &[0x01, 0x10, 0x00, 0x20, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_decode_read_response() {
        let frame = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B]);
        let response = RtuResponse::decode(&frame).unwrap();
        assert!(response.crc_ok);
        assert!(!response.is_exception());
        assert_eq!(response.values(), &[0x00, 0x0A, 0x00, 0x0B]);
        assert!(response.matches(&RtuRequest::read(
            1,
            FunctionCode::ReadHoldingRegisters,
            0,
            2
        )));
    }

    #[test]
    fn test_decode_exception_and_bad_crc() {
        let mut frame = with_crc(&[0x01, 0x83, 0x02]);
        let response = RtuResponse::decode(&frame).unwrap();
        assert!(response.is_exception());
        assert_eq!(response.exception_code(), Some(0x02));
        assert_eq!(response.base_function(), 0x03);

        frame[3] ^= 0xFF;
        assert!(!RtuResponse::decode(&frame).unwrap().crc_ok);
    }

    #[test]
    fn test_scan_lengths() {
        let read = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x01]);
        assert_eq!(scan_rtu_frame(&read[..3]), FrameScan::Incomplete);
        assert_eq!(scan_rtu_frame(&read), FrameScan::Frame(7));

        let write = with_crc(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]);
        assert_eq!(scan_rtu_frame(&write), FrameScan::Frame(8));

        let exception = with_crc(&[0x01, 0x86, 0x02]);
        assert_eq!(scan_rtu_frame(&exception), FrameScan::Frame(5));

        assert_eq!(scan_rtu_frame(&[0x01, 0x2B]), FrameScan::Discard(1));
    }

    #[test]
    fn test_unsupported_function() {
        assert_eq!(
            FunctionCode::try_from(0x2B),
            Err(CodecError::UnsupportedFunction(0x2B))
        );
    }
}
