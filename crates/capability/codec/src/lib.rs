//! # 二进制帧编解码模块
//!
//! 网关与现场设备之间的两种线路格式：
//! - **CJ/T188 表计帧**：`68 | 表类型 | 地址(7) | 控制码 | 长度 | 数据域 | 校验和 | 16`
//! - **Modbus RTU**：`从站 | 功能码 | 数据 | CRC16(LE)`
//!
//! 另外提供南硕（NanSuo）远程通讯命令族的请求构造、应答布局以及购买数据的加解密。
//!
//! 本模块不做任何 IO，流上的分帧通过 [`FrameScan`] 告知调用方需要丢弃、等待还是切出一帧。

mod checksum;
mod error;
pub mod meter;
pub mod modbus_rtu;

pub use checksum::{crc16_modbus, uchar_checksum};
pub use error::CodecError;

/// 流式分帧结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScan {
    /// 数据不足，等待更多字节
    Incomplete,
    /// 丢弃缓冲区前 n 个字节后重新扫描
    Discard(usize),
    /// 缓冲区前 n 个字节是一个完整帧
    Frame(usize),
}
