use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 单个键值对（一个遥测项或属性项）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 轮询种类：属性与时序各自独立调度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollKind {
    Attributes,
    Timeseries,
}

impl PollKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attributes => "attributes",
            Self::Timeseries => "timeseries",
        }
    }
}

/// 上行转换结果，交给遥测存储。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertedData {
    pub device_name: String,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub telemetry: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<KeyValue>,
}

impl ConvertedData {
    pub fn new(device_name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            device_type: device_type.into(),
            telemetry: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// 按轮询种类放入遥测或属性。
    pub fn push(&mut self, kind: PollKind, entry: KeyValue) {
        match kind {
            PollKind::Attributes => self.attributes.push(entry),
            PollKind::Timeseries => self.telemetry.push(entry),
        }
    }

    pub fn entries(&self, kind: PollKind) -> &[KeyValue] {
        match kind {
            PollKind::Attributes => &self.attributes,
            PollKind::Timeseries => &self.telemetry,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.telemetry.is_empty() && self.attributes.is_empty()
    }
}
