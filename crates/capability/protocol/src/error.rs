//! 协议错误类型定义

use crate::converter::ConverterError;
use ems_codec::CodecError;

/// 协议核心错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// 监听时指定了不支持的协议
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// 不支持的帧格式
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// 端口上没有监听
    #[error("no listener on port {0}")]
    ListenNotFound(u16),

    /// 配置中引用了未注册的转换器
    #[error("converter not found: {0}")]
    ConverterNotFound(String),

    /// 配置解析或取值错误
    #[error("config error: {0}")]
    Config(String),

    /// 设备不存在
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// 设备所属令牌没有已认证的连接
    #[error("no active connection for device {0}")]
    NoActiveConnection(String),

    /// 设备没有配置该 RPC 方法
    #[error("unknown rpc method: {0}")]
    UnknownMethod(String),

    /// 转换器错误
    #[error("converter error: {0}")]
    Converter(#[from] ConverterError),

    /// 编解码错误
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 事件循环已退出
    #[error("channel closed")]
    ChannelClosed,
}
