use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// 服务端下发的 RPC 内容。
///
/// 线路格式：`{"device": "...", "data": {"id": 1, "method": "...", "params": ...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub device: String,
    pub data: RpcData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcData {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(device: impl Into<String>, id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            device: device.into(),
            data: RpcData {
                id,
                method: method.into(),
                params,
            },
        }
    }
}

/// RPC 应答：`result` 为 `{method: bool}` 或 `{"error": "..."}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub device: String,
    pub id: u64,
    pub method: String,
    pub result: Value,
}

impl RpcReply {
    pub fn success(request: &RpcRequest, acknowledged: bool) -> Self {
        let mut result = serde_json::Map::new();
        result.insert(request.data.method.clone(), Value::Bool(acknowledged));
        Self::with_result(request, Value::Object(result))
    }

    pub fn error(request: &RpcRequest, message: impl Into<String>) -> Self {
        Self::with_result(request, json!({ "error": message.into() }))
    }

    fn with_result(request: &RpcRequest, result: Value) -> Self {
        Self {
            device: request.device.clone(),
            id: request.data.id,
            method: request.data.method.clone(),
            result,
        }
    }

    pub fn is_error(&self) -> bool {
        self.result.get("error").is_some()
    }
}
