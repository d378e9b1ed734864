//! 编解码错误类型定义

/// 编解码错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// 表地址长度不是 7 个字节
    #[error("meter address must be 7 bytes, got {0}")]
    AddressLength(usize),

    /// 数据长度不足
    #[error("truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// 帧结构错误（帧头、帧尾等）
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// 数据域超过单字节长度上限
    #[error("data area too long: {0} bytes")]
    DataAreaTooLong(usize),

    /// 不支持的 Modbus 功能码
    #[error("unsupported function code: {0}")]
    UnsupportedFunction(u8),

    /// 未知的表计命令
    #[error("unknown meter command: {0}")]
    UnknownCommand(String),

    /// 参数取值不合法
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
