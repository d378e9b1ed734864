//! CJ/T188 表计帧
//!
//! ```text
//! 68 | 表类型(1) | 地址(7) | 控制码(1) | 长度(1) | 数据域(长度) | 校验和(1) | 16
//! ```
//!
//! 校验和为帧头到数据域末尾所有字节的无符号累加和（逐字节截断到 8 位）。

use crate::FrameScan;
use crate::checksum::uchar_checksum;
use crate::error::CodecError;
use bytes::{BufMut, BytesMut};

/// 帧头
pub const FRAME_HEAD: u8 = 0x68;
/// 帧尾
pub const FRAME_END: u8 = 0x16;
/// 前导符
pub const FRAME_PREAMBLE: u8 = 0xFE;
/// 表地址长度
pub const ADDRESS_LEN: usize = 7;
/// 帧头到长度字段（含）的字节数
pub const HEADER_LEN: usize = 11;

/// 数据域字段名称
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldName {
    /// 数据标识
    DataId,
    /// 序号
    Seq,
    /// 总用量
    TotalUsed,
    /// 剩余量
    Remaining,
    /// 总购买量
    TotalPurchases,
    /// 购买次数
    Times,
    /// 状态 S0
    Status0,
    /// 状态 S1
    Status1,
    /// 单位代码
    UnitCode,
    /// 用户号
    UserNo,
    /// 表号
    MeterNo,
    /// 报警值
    AlarmValue,
    /// 透支值
    Overdraft,
    /// 超容量
    Exceed,
    /// 地址
    Address,
    /// 购买量
    Purchases,
    /// 阀门状态
    ValveStatus,
    /// 初始化类型
    Reset,
    /// 保留
    Empty,
}

impl FieldName {
    /// 上报时使用的键名
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataId => "dataId",
            Self::Seq => "seq",
            Self::TotalUsed => "totalUsed",
            Self::Remaining => "remaining",
            Self::TotalPurchases => "totalPurchases",
            Self::Times => "times",
            Self::Status0 => "status0",
            Self::Status1 => "status1",
            Self::UnitCode => "unitCode",
            Self::UserNo => "userNo",
            Self::MeterNo => "meterNo",
            Self::AlarmValue => "alarmValue",
            Self::Overdraft => "overdraft",
            Self::Exceed => "exceed",
            Self::Address => "address",
            Self::Purchases => "purchases",
            Self::ValveStatus => "valveStatus",
            Self::Reset => "reset",
            Self::Empty => "empty",
        }
    }
}

/// 字段布局：按声明顺序排列的 (名称, 固定宽度)
pub type FieldLayout = [(FieldName, usize)];

/// 数据域中的定宽字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataField {
    pub name: FieldName,
    pub data: Vec<u8>,
}

impl DataField {
    pub fn new(name: FieldName, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name,
            data: data.into(),
        }
    }

    pub fn width(&self) -> usize {
        self.data.len()
    }

    /// 按小端无符号整数解释（最多 8 字节）
    pub fn as_u64_le(&self) -> u64 {
        self.data
            .iter()
            .take(8)
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
    }
}

/// 一个完整的表计帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterFrame {
    pub device_type: u8,
    pub address: Vec<u8>,
    pub control_code: u8,
    pub fields: Vec<DataField>,
}

impl MeterFrame {
    pub fn new(device_type: u8, address: impl Into<Vec<u8>>, control_code: u8) -> Self {
        Self {
            device_type,
            address: address.into(),
            control_code,
            fields: Vec::new(),
        }
    }

    /// 追加一个数据域字段
    pub fn with_field(mut self, name: FieldName, data: impl Into<Vec<u8>>) -> Self {
        self.fields.push(DataField::new(name, data));
        self
    }

    /// 查询第一个同名字段
    pub fn field(&self, name: FieldName) -> Option<&DataField> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn field_mut(&mut self, name: FieldName) -> Option<&mut DataField> {
        self.fields.iter_mut().find(|field| field.name == name)
    }

    /// 按声明顺序拼接的数据域
    pub fn data_area(&self) -> Vec<u8> {
        self.fields
            .iter()
            .flat_map(|field| field.data.iter().copied())
            .collect()
    }

    /// 编码为线路字节
    pub fn encode(&self) -> Result<BytesMut, CodecError> {
        if self.address.len() != ADDRESS_LEN {
            return Err(CodecError::AddressLength(self.address.len()));
        }
        let data_area = self.data_area();
        let length = u8::try_from(data_area.len())
            .map_err(|_| CodecError::DataAreaTooLong(data_area.len()))?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + data_area.len() + 2);
        buf.put_u8(FRAME_HEAD);
        buf.put_u8(self.device_type);
        buf.put_slice(&self.address);
        buf.put_u8(self.control_code);
        buf.put_u8(length);
        buf.put_slice(&data_area);
        let checksum = uchar_checksum(&buf);
        buf.put_u8(checksum);
        buf.put_u8(FRAME_END);
        Ok(buf)
    }

    /// 按字段布局解码一个完整帧（从帧头 0x68 到帧尾 0x16）。
    ///
    /// 校验和不一致不会中断解码，结构字段照常填充，由调用方检查
    /// [`DecodedFrame::checksum_ok`]。数据域比布局长时，多出的字节作为末尾的
    /// [`FieldName::Empty`] 字段保留。
    pub fn decode(bytes: &[u8], layout: &FieldLayout) -> Result<DecodedFrame, CodecError> {
        if bytes.len() < HEADER_LEN + 2 {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN + 2,
                actual: bytes.len(),
            });
        }
        if bytes[0] != FRAME_HEAD {
            return Err(CodecError::InvalidFrame(format!(
                "frame head 0x{:02X}",
                bytes[0]
            )));
        }

        let device_type = bytes[1];
        let address = bytes[2..2 + ADDRESS_LEN].to_vec();
        let control_code = bytes[9];
        let length = bytes[10];
        let total = HEADER_LEN + usize::from(length) + 2;
        if bytes.len() < total {
            return Err(CodecError::Truncated {
                needed: total,
                actual: bytes.len(),
            });
        }
        if bytes[total - 1] != FRAME_END {
            return Err(CodecError::InvalidFrame(format!(
                "frame end 0x{:02X}",
                bytes[total - 1]
            )));
        }

        let data_end = HEADER_LEN + usize::from(length);
        let data = &bytes[HEADER_LEN..data_end];
        let mut fields = Vec::with_capacity(layout.len() + 1);
        let mut offset = 0;
        for (name, width) in layout {
            let end = offset + width;
            if end > data.len() {
                return Err(CodecError::Truncated {
                    needed: end,
                    actual: data.len(),
                });
            }
            fields.push(DataField::new(*name, &data[offset..end]));
            offset = end;
        }
        if offset < data.len() {
            fields.push(DataField::new(FieldName::Empty, &data[offset..]));
        }

        Ok(DecodedFrame {
            frame: MeterFrame {
                device_type,
                address,
                control_code,
                fields,
            },
            length,
            checksum: bytes[data_end],
            computed_checksum: uchar_checksum(&bytes[..data_end]),
        })
    }
}

/// 解码结果，携带线路上的长度与校验和
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub frame: MeterFrame,
    pub length: u8,
    pub checksum: u8,
    pub computed_checksum: u8,
}

impl DecodedFrame {
    pub fn checksum_ok(&self) -> bool {
        self.checksum == self.computed_checksum
    }
}

/// 在字节流中定位下一个表计帧，跳过前导符与噪声。
pub fn scan_frame(buf: &[u8]) -> FrameScan {
    let Some(start) = buf.iter().position(|byte| *byte == FRAME_HEAD) else {
        return if buf.is_empty() {
            FrameScan::Incomplete
        } else {
            FrameScan::Discard(buf.len())
        };
    };
    if start > 0 {
        return FrameScan::Discard(start);
    }
    if buf.len() < HEADER_LEN {
        return FrameScan::Incomplete;
    }
    let total = HEADER_LEN + usize::from(buf[10]) + 2;
    if buf.len() < total {
        return FrameScan::Incomplete;
    }
    if buf[total - 1] != FRAME_END {
        // 0x68 也可能出现在地址或数据中，丢掉这个字节后重新同步
        return FrameScan::Discard(1);
    }
    FrameScan::Frame(total)
}

/// 读取数据域第 3 个字节（数据标识之后的序号），不做完整解码。
pub fn peek_seq(bytes: &[u8]) -> Option<u8> {
    if bytes.len() < HEADER_LEN || usize::from(bytes[10]) < 3 {
        return None;
    }
    bytes.get(HEADER_LEN + 2).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &FieldLayout = &[(FieldName::DataId, 2), (FieldName::Seq, 1)];

    fn sample() -> MeterFrame {
        MeterFrame::new(0x10, vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77], 0x01)
            .with_field(FieldName::DataId, [0x1F, 0x90])
            .with_field(FieldName::Seq, [0x05])
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample().encode().unwrap();
        assert_eq!(bytes[0], FRAME_HEAD);
        assert_eq!(bytes[1], 0x10);
        assert_eq!(&bytes[2..9], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        assert_eq!(bytes[9], 0x01);
        assert_eq!(bytes[10], 3);
        assert_eq!(&bytes[11..14], &[0x1F, 0x90, 0x05]);
        assert_eq!(bytes[14], uchar_checksum(&bytes[..14]));
        assert_eq!(bytes[15], FRAME_END);
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_encode_rejects_short_address() {
        let frame = MeterFrame::new(0x10, vec![0x01, 0x02], 0x01);
        assert_eq!(frame.encode(), Err(CodecError::AddressLength(2)));
    }

    #[test]
    fn test_decode_reencodes_identically() {
        let bytes = sample().encode().unwrap();
        let decoded = MeterFrame::decode(&bytes, LAYOUT).unwrap();
        assert!(decoded.checksum_ok());
        assert_eq!(decoded.length, 3);
        assert_eq!(decoded.frame, sample());
        assert_eq!(decoded.frame.encode().unwrap(), bytes);
    }

    #[test]
    fn test_decode_reports_checksum_mismatch_but_keeps_fields() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes[14] = bytes[14].wrapping_add(1);
        let decoded = MeterFrame::decode(&bytes, LAYOUT).unwrap();
        assert!(!decoded.checksum_ok());
        assert_eq!(decoded.frame.field(FieldName::Seq).unwrap().data, vec![0x05]);
    }

    #[test]
    fn test_decode_keeps_surplus_as_trailing_field() {
        let frame = sample().with_field(FieldName::Status0, [0xAB, 0xCD]);
        let bytes = frame.encode().unwrap();
        let decoded = MeterFrame::decode(&bytes, LAYOUT).unwrap();
        let last = decoded.frame.fields.last().unwrap();
        assert_eq!(last.name, FieldName::Empty);
        assert_eq!(last.data, vec![0xAB, 0xCD]);
        assert_eq!(decoded.frame.encode().unwrap(), bytes);
    }

    #[test]
    fn test_decode_layout_longer_than_data() {
        let bytes = sample().encode().unwrap();
        let layout: &FieldLayout = &[(FieldName::DataId, 2), (FieldName::TotalUsed, 4)];
        assert!(matches!(
            MeterFrame::decode(&bytes, layout),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_scan_skips_preamble_and_waits() {
        let bytes = sample().encode().unwrap();
        let mut stream = vec![FRAME_PREAMBLE, FRAME_PREAMBLE];
        stream.extend_from_slice(&bytes[..8]);
        assert_eq!(scan_frame(&stream), FrameScan::Discard(2));
        assert_eq!(scan_frame(&stream[2..]), FrameScan::Incomplete);
        stream.extend_from_slice(&bytes[8..]);
        assert_eq!(scan_frame(&stream[2..]), FrameScan::Frame(bytes.len()));
    }

    #[test]
    fn test_scan_resyncs_on_bad_end() {
        let mut bytes = sample().encode().unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] = 0x00;
        assert_eq!(scan_frame(&bytes), FrameScan::Discard(1));
    }

    #[test]
    fn test_peek_seq() {
        let bytes = sample().encode().unwrap();
        assert_eq!(peek_seq(&bytes), Some(0x05));
    }

    #[test]
    fn test_field_as_u64_le() {
        let field = DataField::new(FieldName::TotalUsed, [0xE8, 0x03, 0x00, 0x00]);
        assert_eq!(field.as_u64_le(), 1000);
    }
}
