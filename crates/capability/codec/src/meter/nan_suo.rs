//! 南硕远程通讯命令族
//!
//! 每个数据域以 2 字节数据标识和 1 字节序号开头，序号由网关分配并由表原样返回。

use super::crypto::{effective_purchase_times, ns_decrypt, ns_encrypt};
use super::frame::{ADDRESS_LEN, DecodedFrame, FieldLayout, FieldName, MeterFrame};
use crate::error::CodecError;
use bytes::BytesMut;
use std::fmt;
use std::str::FromStr;

/// 写命令未指定地址时使用的广播地址
pub const BROADCAST_ADDRESS: [u8; ADDRESS_LEN] = [0xFE; ADDRESS_LEN];
/// 读地址命令使用的通配地址
pub const WILDCARD_ADDRESS: [u8; ADDRESS_LEN] = [0xAA; ADDRESS_LEN];

const ACK_FLAG: u8 = 0x80;

/// 命令种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NsCommandKind {
    ReadData,
    ReadAddress,
    ReadUser1,
    ReadUser2,
    WriteAddress,
    WritePurchase,
    WriteValve,
    WriteReset,
    WriteUser1,
    WriteUser2,
}

impl NsCommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadData => "readData",
            Self::ReadAddress => "readAddress",
            Self::ReadUser1 => "readUser1",
            Self::ReadUser2 => "readUser2",
            Self::WriteAddress => "writeAddress",
            Self::WritePurchase => "writePurchase",
            Self::WriteValve => "writeValve",
            Self::WriteReset => "writeReset",
            Self::WriteUser1 => "writeUser1",
            Self::WriteUser2 => "writeUser2",
        }
    }

    pub fn control_code(&self) -> u8 {
        match self {
            Self::ReadData => 0x01,
            Self::ReadAddress | Self::ReadUser1 | Self::ReadUser2 => 0x03,
            Self::WriteAddress => 0x15,
            Self::WritePurchase
            | Self::WriteValve
            | Self::WriteReset
            | Self::WriteUser1
            | Self::WriteUser2 => 0x04,
        }
    }

    /// 数据标识（线路顺序）
    pub fn data_id(&self) -> [u8; 2] {
        match self {
            Self::ReadData => [0x1F, 0x90],
            Self::ReadAddress => [0x0A, 0x81],
            Self::ReadUser1 => [0xAA, 0x81],
            Self::ReadUser2 => [0xB0, 0x81],
            Self::WriteAddress => [0x18, 0xA0],
            Self::WritePurchase => [0x13, 0xA0],
            Self::WriteValve => [0x17, 0xA0],
            Self::WriteReset => [0x21, 0xA0],
            Self::WriteUser1 => [0x27, 0xA0],
            Self::WriteUser2 => [0x34, 0xA0],
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Self::ReadData | Self::ReadAddress | Self::ReadUser1 | Self::ReadUser2
        )
    }

    /// 应答数据域布局（含数据标识与序号）
    pub fn response_layout(&self) -> &'static FieldLayout {
        use FieldName::*;
        match self {
            Self::ReadData => &[
                (DataId, 2),
                (Seq, 1),
                (TotalUsed, 4),
                (Remaining, 4),
                (TotalPurchases, 4),
                (Times, 1),
                (Status0, 1),
                (Status1, 1),
            ],
            Self::ReadAddress => &[(DataId, 2), (Seq, 1), (Address, 7)],
            Self::ReadUser1 | Self::WriteUser1 => &[
                (DataId, 2),
                (Seq, 1),
                (UnitCode, 2),
                (UserNo, 2),
                (MeterNo, 1),
                (Empty, 2),
            ],
            Self::ReadUser2 | Self::WriteUser2 => &[
                (DataId, 2),
                (Seq, 1),
                (AlarmValue, 1),
                (Overdraft, 1),
                (Exceed, 1),
                (Empty, 4),
            ],
            Self::WritePurchase => &[(DataId, 2), (Seq, 1), (Times, 1), (Purchases, 4)],
            Self::WriteValve => &[(DataId, 2), (Seq, 1), (Status0, 1), (Status1, 1)],
            Self::WriteAddress | Self::WriteReset => &[(DataId, 2), (Seq, 1)],
        }
    }
}

impl fmt::Display for NsCommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NsCommandKind {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "readData" => Ok(Self::ReadData),
            "readAddress" => Ok(Self::ReadAddress),
            "readUser1" => Ok(Self::ReadUser1),
            "readUser2" => Ok(Self::ReadUser2),
            "writeAddress" => Ok(Self::WriteAddress),
            "writePurchase" => Ok(Self::WritePurchase),
            "writeValve" => Ok(Self::WriteValve),
            "writeReset" => Ok(Self::WriteReset),
            "writeUser1" => Ok(Self::WriteUser1),
            "writeUser2" => Ok(Self::WriteUser2),
            other => Err(CodecError::UnknownCommand(other.to_string())),
        }
    }
}

/// 阀门动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveState {
    Open,
    Close,
}

impl ValveState {
    pub fn code(&self) -> u8 {
        match self {
            Self::Open => 0x55,
            Self::Close => 0x99,
        }
    }
}

impl TryFrom<u8> for ValveState {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x55 => Ok(Self::Open),
            0x99 => Ok(Self::Close),
            other => Err(CodecError::InvalidValue(format!(
                "valve status 0x{other:02X}"
            ))),
        }
    }
}

/// 初始化表状态的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// 可清厂商代码
    Vendor,
    /// 可清单位代码
    Unit,
}

impl ResetKind {
    pub fn code(&self) -> u8 {
        match self {
            Self::Vendor => 0xC3,
            Self::Unit => 0x5A,
        }
    }
}

impl TryFrom<u8> for ResetKind {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0xC3 => Ok(Self::Vendor),
            0x5A => Ok(Self::Unit),
            other => Err(CodecError::InvalidValue(format!("reset kind 0x{other:02X}"))),
        }
    }
}

/// 带参数的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsCommand {
    ReadData,
    ReadAddress,
    ReadUser1,
    ReadUser2,
    WriteAddress([u8; ADDRESS_LEN]),
    /// `times` 为对外可见的购买次数（从 1 开始）
    WritePurchase {
        times: u16,
        purchases: u32,
    },
    WriteValve(ValveState),
    WriteReset(ResetKind),
    WriteUser1 {
        unit_code: u16,
        user_no: u16,
        meter_no: u8,
    },
    WriteUser2 {
        alarm_value: u8,
        overdraft: u8,
        exceed: u8,
    },
}

impl NsCommand {
    pub fn kind(&self) -> NsCommandKind {
        match self {
            Self::ReadData => NsCommandKind::ReadData,
            Self::ReadAddress => NsCommandKind::ReadAddress,
            Self::ReadUser1 => NsCommandKind::ReadUser1,
            Self::ReadUser2 => NsCommandKind::ReadUser2,
            Self::WriteAddress(_) => NsCommandKind::WriteAddress,
            Self::WritePurchase { .. } => NsCommandKind::WritePurchase,
            Self::WriteValve(_) => NsCommandKind::WriteValve,
            Self::WriteReset(_) => NsCommandKind::WriteReset,
            Self::WriteUser1 { .. } => NsCommandKind::WriteUser1,
            Self::WriteUser2 { .. } => NsCommandKind::WriteUser2,
        }
    }
}

/// 南硕请求：表类型、目标地址与命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsRequest {
    pub device_type: u8,
    pub address: Option<[u8; ADDRESS_LEN]>,
    pub command: NsCommand,
}

impl NsRequest {
    pub fn new(device_type: u8, address: Option<[u8; ADDRESS_LEN]>, command: NsCommand) -> Self {
        Self {
            device_type,
            address,
            command,
        }
    }

    /// 由下行转换器产生的字节负载构造请求。
    ///
    /// 负载为序号之后的明文字段；`writePurchase` 例外，其负载为
    /// `times(u16 LE) | purchases(u32 LE)`，次数调整与加密在组帧时完成。
    pub fn from_payload(
        device_type: u8,
        address: Option<[u8; ADDRESS_LEN]>,
        kind: NsCommandKind,
        payload: &[u8],
    ) -> Result<Self, CodecError> {
        let command = match kind {
            NsCommandKind::ReadData => NsCommand::ReadData,
            NsCommandKind::ReadAddress => NsCommand::ReadAddress,
            NsCommandKind::ReadUser1 => NsCommand::ReadUser1,
            NsCommandKind::ReadUser2 => NsCommand::ReadUser2,
            NsCommandKind::WriteAddress => {
                let bytes = take(payload, ADDRESS_LEN)?;
                let mut new_address = [0u8; ADDRESS_LEN];
                new_address.copy_from_slice(bytes);
                NsCommand::WriteAddress(new_address)
            }
            NsCommandKind::WritePurchase => {
                let bytes = take(payload, 6)?;
                NsCommand::WritePurchase {
                    times: u16::from_le_bytes([bytes[0], bytes[1]]),
                    purchases: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
                }
            }
            NsCommandKind::WriteValve => NsCommand::WriteValve(take(payload, 1)?[0].try_into()?),
            NsCommandKind::WriteReset => NsCommand::WriteReset(take(payload, 1)?[0].try_into()?),
            NsCommandKind::WriteUser1 => {
                let bytes = take(payload, 5)?;
                NsCommand::WriteUser1 {
                    unit_code: u16::from_le_bytes([bytes[0], bytes[1]]),
                    user_no: u16::from_le_bytes([bytes[2], bytes[3]]),
                    meter_no: bytes[4],
                }
            }
            NsCommandKind::WriteUser2 => {
                let bytes = take(payload, 3)?;
                NsCommand::WriteUser2 {
                    alarm_value: bytes[0],
                    overdraft: bytes[1],
                    exceed: bytes[2],
                }
            }
        };
        Ok(Self::new(device_type, address, command))
    }

    pub fn kind(&self) -> NsCommandKind {
        self.command.kind()
    }

    /// 帧头中的地址：读地址用通配地址，未指定地址的写命令广播
    pub fn frame_address(&self) -> [u8; ADDRESS_LEN] {
        match (&self.command, self.address) {
            (NsCommand::ReadAddress, _) => WILDCARD_ADDRESS,
            (_, Some(address)) => address,
            (command, None) if command.kind().is_write() => BROADCAST_ADDRESS,
            (_, None) => WILDCARD_ADDRESS,
        }
    }

    pub fn to_frame(&self, seq: u8) -> MeterFrame {
        let kind = self.kind();
        let address = self.frame_address();
        let frame = MeterFrame::new(self.device_type, address.to_vec(), kind.control_code())
            .with_field(FieldName::DataId, kind.data_id())
            .with_field(FieldName::Seq, [seq]);

        match &self.command {
            NsCommand::ReadData
            | NsCommand::ReadAddress
            | NsCommand::ReadUser1
            | NsCommand::ReadUser2 => frame,
            NsCommand::WriteAddress(new_address) => {
                frame.with_field(FieldName::Address, new_address.to_vec())
            }
            NsCommand::WritePurchase { times, purchases } => {
                let (times, purchases) = ns_encrypt(
                    &address,
                    effective_purchase_times(*times),
                    purchases.to_le_bytes(),
                );
                frame
                    .with_field(FieldName::Times, [times])
                    .with_field(FieldName::Purchases, purchases)
            }
            NsCommand::WriteValve(state) => frame.with_field(FieldName::ValveStatus, [state.code()]),
            NsCommand::WriteReset(kind) => frame.with_field(FieldName::Reset, [kind.code()]),
            NsCommand::WriteUser1 {
                unit_code,
                user_no,
                meter_no,
            } => frame
                .with_field(FieldName::UnitCode, unit_code.to_le_bytes())
                .with_field(FieldName::UserNo, user_no.to_le_bytes())
                .with_field(FieldName::MeterNo, [*meter_no])
                .with_field(FieldName::Empty, [0x00; 2]),
            NsCommand::WriteUser2 {
                alarm_value,
                overdraft,
                exceed,
            } => frame
                .with_field(FieldName::AlarmValue, [*alarm_value])
                .with_field(FieldName::Overdraft, [*overdraft])
                .with_field(FieldName::Exceed, [*exceed])
                .with_field(FieldName::Empty, [0x00; 4]),
        }
    }

    pub fn encode(&self, seq: u8) -> Result<BytesMut, CodecError> {
        self.to_frame(seq).encode()
    }
}

fn take(payload: &[u8], needed: usize) -> Result<&[u8], CodecError> {
    payload.get(..needed).ok_or(CodecError::Truncated {
        needed,
        actual: payload.len(),
    })
}

/// 南硕应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsResponse {
    pub kind: NsCommandKind,
    pub decoded: DecodedFrame,
}

impl NsResponse {
    /// 按命令种类的布局解码；写购买应答的次数与购买量在此解密。
    pub fn decode(kind: NsCommandKind, raw: &[u8]) -> Result<Self, CodecError> {
        let mut decoded = MeterFrame::decode(raw, kind.response_layout())?;
        if kind == NsCommandKind::WritePurchase {
            decrypt_purchase(&mut decoded.frame);
        }
        Ok(Self { kind, decoded })
    }

    pub fn frame(&self) -> &MeterFrame {
        &self.decoded.frame
    }

    pub fn checksum_ok(&self) -> bool {
        self.decoded.checksum_ok()
    }

    pub fn seq(&self) -> Option<u8> {
        self.frame()
            .field(FieldName::Seq)
            .and_then(|field| field.data.first().copied())
    }

    pub fn data_id(&self) -> Option<[u8; 2]> {
        self.frame()
            .field(FieldName::DataId)
            .and_then(|field| field.data.as_slice().try_into().ok())
    }

    /// 控制码为 `请求 | 0x80` 且回显数据标识
    pub fn acknowledges(&self, kind: NsCommandKind) -> bool {
        self.frame().control_code == kind.control_code() | ACK_FLAG
            && self.data_id() == Some(kind.data_id())
    }

    /// 序号之后的业务字段（不含保留字段）
    pub fn fields(&self) -> impl Iterator<Item = &super::frame::DataField> {
        self.frame().fields.iter().filter(|field| {
            !matches!(
                field.name,
                FieldName::DataId | FieldName::Seq | FieldName::Empty
            )
        })
    }
}

fn decrypt_purchase(frame: &mut MeterFrame) {
    let times = frame
        .field(FieldName::Times)
        .and_then(|field| field.data.first().copied());
    let purchases = frame
        .field(FieldName::Purchases)
        .and_then(|field| <[u8; 4]>::try_from(field.data.as_slice()).ok());
    let (Some(times), Some(purchases)) = (times, purchases) else {
        return;
    };
    let (times, purchases) = ns_decrypt(&frame.address, times, purchases);
    if let Some(field) = frame.field_mut(FieldName::Times) {
        field.data = vec![times];
    }
    if let Some(field) = frame.field_mut(FieldName::Purchases) {
        field.data = purchases.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::frame::{HEADER_LEN, peek_seq};

    const ADDRESS: [u8; 7] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];

    fn reply(kind: NsCommandKind, address: [u8; 7], seq: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = MeterFrame::new(0x10, address.to_vec(), kind.control_code() | ACK_FLAG)
            .with_field(FieldName::DataId, kind.data_id())
            .with_field(FieldName::Seq, [seq]);
        if !body.is_empty() {
            frame = frame.with_field(FieldName::Empty, body.to_vec());
        }
        frame.encode().unwrap().to_vec()
    }

    #[test]
    fn test_command_kind_parse() {
        assert_eq!(
            "writePurchase".parse::<NsCommandKind>().unwrap(),
            NsCommandKind::WritePurchase
        );
        assert!(matches!(
            "readAll".parse::<NsCommandKind>(),
            Err(CodecError::UnknownCommand(_))
        ));
        assert_eq!(NsCommandKind::ReadUser2.to_string(), "readUser2");
    }

    #[test]
    fn test_read_data_request_bytes() {
        let request = NsRequest::new(0x10, Some(ADDRESS), NsCommand::ReadData);
        let bytes = request.encode(7).unwrap();
        assert_eq!(bytes[9], 0x01);
        assert_eq!(bytes[10], 3);
        assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 3], &[0x1F, 0x90, 0x07]);
        assert_eq!(peek_seq(&bytes), Some(7));
    }

    #[test]
    fn test_read_address_uses_wildcard() {
        let request = NsRequest::new(0x10, Some(ADDRESS), NsCommand::ReadAddress);
        assert_eq!(request.frame_address(), WILDCARD_ADDRESS);
    }

    #[test]
    fn test_write_without_address_broadcasts() {
        let request = NsRequest::new(0x10, None, NsCommand::WriteValve(ValveState::Open));
        let bytes = request.encode(1).unwrap();
        assert_eq!(&bytes[2..9], &BROADCAST_ADDRESS);
        assert_eq!(bytes[9], 0x04);
        assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 4], &[0x17, 0xA0, 0x01, 0x55]);
    }

    #[test]
    fn test_write_purchase_is_adjusted_and_encrypted() {
        let request = NsRequest::from_payload(
            0x10,
            Some(WILDCARD_ADDRESS),
            NsCommandKind::WritePurchase,
            &[0x04, 0x00, 0xE8, 0x03, 0x00, 0x00],
        )
        .unwrap();
        assert_eq!(
            request.command,
            NsCommand::WritePurchase {
                times: 4,
                purchases: 1000
            }
        );

        // 次数 4 调整为 3 后按参考向量加密
        let frame = request.to_frame(9);
        assert_eq!(frame.field(FieldName::Times).unwrap().data, vec![0xA5]);
        assert_eq!(
            frame.field(FieldName::Purchases).unwrap().data,
            vec![0xA5, 0xA6, 0xA6, 0x4E]
        );
    }

    #[test]
    fn test_write_purchase_response_is_decrypted() {
        let (times, purchases) = ns_encrypt(&ADDRESS, 5, 2000u32.to_le_bytes());
        let mut body = vec![times];
        body.extend_from_slice(&purchases);
        let raw = reply(NsCommandKind::WritePurchase, ADDRESS, 3, &body);

        let response = NsResponse::decode(NsCommandKind::WritePurchase, &raw).unwrap();
        assert!(response.checksum_ok());
        assert!(response.acknowledges(NsCommandKind::WritePurchase));
        assert_eq!(response.seq(), Some(3));
        assert_eq!(response.frame().field(FieldName::Times).unwrap().data, vec![5]);
        assert_eq!(
            response.frame().field(FieldName::Purchases).unwrap().as_u64_le(),
            2000
        );
    }

    #[test]
    fn test_read_data_response_fields() {
        let mut body = Vec::new();
        body.extend_from_slice(&120u32.to_le_bytes());
        body.extend_from_slice(&80u32.to_le_bytes());
        body.extend_from_slice(&200u32.to_le_bytes());
        body.extend_from_slice(&[2, 0x00, 0x40]);
        let raw = reply(NsCommandKind::ReadData, ADDRESS, 1, &body);

        let response = NsResponse::decode(NsCommandKind::ReadData, &raw).unwrap();
        let values: Vec<(&str, u64)> = response
            .fields()
            .map(|field| (field.name.as_str(), field.as_u64_le()))
            .collect();
        assert_eq!(
            values,
            vec![
                ("totalUsed", 120),
                ("remaining", 80),
                ("totalPurchases", 200),
                ("times", 2),
                ("status0", 0),
                ("status1", 0x40),
            ]
        );
    }

    #[test]
    fn test_acknowledges_requires_matching_data_id() {
        let raw = reply(NsCommandKind::WriteValve, ADDRESS, 1, &[0x00, 0x00]);
        let response = NsResponse::decode(NsCommandKind::WriteValve, &raw).unwrap();
        assert!(response.acknowledges(NsCommandKind::WriteValve));
        assert!(!response.acknowledges(NsCommandKind::WriteReset));
    }

    #[test]
    fn test_from_payload_rejects_short_and_invalid() {
        assert!(matches!(
            NsRequest::from_payload(0x10, None, NsCommandKind::WriteAddress, &[0x01]),
            Err(CodecError::Truncated { .. })
        ));
        assert!(matches!(
            NsRequest::from_payload(0x10, None, NsCommandKind::WriteValve, &[0x01]),
            Err(CodecError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_write_user1_layout() {
        let request = NsRequest::from_payload(
            0x10,
            Some(ADDRESS),
            NsCommandKind::WriteUser1,
            &[0x34, 0x12, 0x02, 0x00, 0x09],
        )
        .unwrap();
        let frame = request.to_frame(2);
        assert_eq!(
            frame.data_area(),
            vec![0x27, 0xA0, 0x02, 0x34, 0x12, 0x02, 0x00, 0x09, 0x00, 0x00]
        );
    }
}
