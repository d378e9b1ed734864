//! 设备注册表
//!
//! 按令牌管理设备记录，负责向网关清单登记/注销设备，并保存上次上报的值用于变化检测。

use crate::config::{DeviceConfig, ListenConfig};
use crate::converter::{ConverterRegistry, DownlinkConverter, UplinkConverter};
use crate::error::ProtocolError;
use crate::gateway::Gateway;
use domain::{ConvertedData, KeyValue, PollKind};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// 一台设备的运行时记录
pub struct DeviceRecord {
    pub config: DeviceConfig,
    pub token: String,
    pub connector: String,
    pub uplink: Arc<dyn UplinkConverter>,
    pub downlink: Arc<dyn DownlinkConverter>,
    last_polled: HashMap<PollKind, Instant>,
    last_telemetry: HashMap<String, Value>,
    last_attributes: HashMap<String, Value>,
}

impl DeviceRecord {
    fn new(
        config: DeviceConfig,
        token: String,
        connector: String,
        uplink: Arc<dyn UplinkConverter>,
        downlink: Arc<dyn DownlinkConverter>,
    ) -> Self {
        Self {
            config,
            token,
            connector,
            uplink,
            downlink,
            last_polled: HashMap::new(),
            last_telemetry: HashMap::new(),
            last_attributes: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.device_name
    }

    /// 上次完成该种类轮询的时间
    pub fn last_polled(&self, kind: PollKind) -> Option<Instant> {
        self.last_polled.get(&kind).copied()
    }

    /// 按上次上报的值过滤本次结果，返回需要转发的部分
    ///
    /// 开启 `sendDataOnlyOnChange` 时只保留变化的项并逐项更新快照，
    /// 否则全部转发并整体替换快照。
    pub fn filter_changes(&mut self, data: ConvertedData, now: Instant) -> ConvertedData {
        let only_on_change = self.config.send_data_only_on_change;
        let mut forward = ConvertedData::new(data.device_name, data.device_type);
        for (kind, entries) in [
            (PollKind::Timeseries, data.telemetry),
            (PollKind::Attributes, data.attributes),
        ] {
            if entries.is_empty() {
                continue;
            }
            self.last_polled.insert(kind, now);
            let snapshot = match kind {
                PollKind::Timeseries => &mut self.last_telemetry,
                PollKind::Attributes => &mut self.last_attributes,
            };
            if only_on_change {
                for entry in entries {
                    if snapshot.get(&entry.key) != Some(&entry.value) {
                        snapshot.insert(entry.key.clone(), entry.value.clone());
                        forward.push(kind, entry);
                    }
                }
            } else {
                *snapshot = entries
                    .iter()
                    .map(|entry| (entry.key.clone(), entry.value.clone()))
                    .collect();
                for entry in entries {
                    forward.push(kind, entry);
                }
            }
        }
        forward
    }

    /// 当前快照
    pub fn last_values(&self, kind: PollKind) -> Vec<KeyValue> {
        let snapshot = match kind {
            PollKind::Timeseries => &self.last_telemetry,
            PollKind::Attributes => &self.last_attributes,
        };
        let mut values: Vec<KeyValue> = snapshot
            .iter()
            .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
            .collect();
        values.sort_by(|a, b| a.key.cmp(&b.key));
        values
    }
}

/// 一个监听端口下全部连接器的设备
pub struct DeviceRegistry {
    gateway: Arc<dyn Gateway>,
    converters: Arc<ConverterRegistry>,
    devices: HashMap<String, DeviceRecord>,
    /// 令牌 → 连接器名称
    tokens: HashMap<String, String>,
}

impl DeviceRegistry {
    pub fn new(gateway: Arc<dyn Gateway>, converters: Arc<ConverterRegistry>) -> Self {
        Self {
            gateway,
            converters,
            devices: HashMap::new(),
            tokens: HashMap::new(),
        }
    }

    pub fn is_known_token(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }

    pub fn get(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(name)
    }

    pub fn devices_for_token<'a>(&'a self, token: &'a str) -> impl Iterator<Item = &'a DeviceRecord> {
        self.devices.values().filter(move |record| record.token == token)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// 安装令牌的设备，返回新建记录的设备名称
    ///
    /// 网关清单中已有同名设备时跳过该设备。
    pub async fn add_devices(&mut self, config: &ListenConfig) -> Result<Vec<String>, ProtocolError> {
        let uplink = self.converters.uplink(config.converter.as_deref())?;
        let downlink = self.converters.downlink(config.downlink_converter.as_deref())?;
        let connector = config.connector_name();
        let known = self.gateway.get_devices().await;

        let mut added = Vec::new();
        for device in &config.devices {
            if known.contains(&device.device_name) || self.devices.contains_key(&device.device_name) {
                debug!(
                    target: "ems.service",
                    device = %device.device_name,
                    connector = %connector,
                    "device_already_registered"
                );
                continue;
            }
            self.gateway
                .add_device(&device.device_name, &connector, &device.device_type)
                .await;
            self.devices.insert(
                device.device_name.clone(),
                DeviceRecord::new(
                    device.clone(),
                    config.access_token.clone(),
                    connector.clone(),
                    uplink.clone(),
                    downlink.clone(),
                ),
            );
            added.push(device.device_name.clone());
        }
        self.tokens.insert(config.access_token.clone(), connector.clone());
        info!(
            target: "ems.service",
            connector = %connector,
            added = added.len(),
            "devices_added"
        );
        Ok(added)
    }

    /// 整体替换连接器的设备
    pub async fn update_devices(
        &mut self,
        config: &ListenConfig,
    ) -> Result<Vec<String>, ProtocolError> {
        self.converters.uplink(config.converter.as_deref())?;
        self.converters.downlink(config.downlink_converter.as_deref())?;

        let connector = config.connector_name();
        let stale: Vec<String> = self
            .devices
            .values()
            .filter(|record| record.connector == connector || record.token == config.access_token)
            .map(|record| record.name().to_string())
            .collect();
        for name in &stale {
            self.gateway.del_device(name).await;
            self.devices.remove(name);
        }
        debug!(target: "ems.service", connector = %connector, removed = stale.len(), "devices_purged");
        self.add_devices(config).await
    }

    /// 注销令牌的全部设备，返回被移除的设备名称
    pub async fn remove_devices(&mut self, config: &ListenConfig) -> Vec<String> {
        let removed: Vec<String> = self
            .devices_for_token(&config.access_token)
            .map(|record| record.name().to_string())
            .collect();
        for name in &removed {
            self.gateway.del_device(name).await;
            self.devices.remove(name);
        }
        self.tokens.remove(&config.access_token);
        info!(
            target: "ems.service",
            connector = %config.connector_name(),
            removed = removed.len(),
            "devices_removed"
        );
        removed
    }
}
