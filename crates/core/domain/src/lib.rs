//! 网关核心与外部协作方之间传递的值类型。

pub mod data;
pub mod rpc;

pub use data::{ConvertedData, KeyValue, PollKind};
pub use rpc::{RpcData, RpcReply, RpcRequest};
