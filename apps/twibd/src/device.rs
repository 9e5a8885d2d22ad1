//! 设备抽象与注册表
//!
//! 设备由各自的传输后端强持有，注册表只发布弱引用。同一台物理设备
//! 可能同时经由 USB 和 TCP 接入：注册表按优先级仲裁（USB > TCP），
//! 响应始终路由到当前持有该 device_id 的条目。

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info};

use crate::messages::Request;

/// TCP 设备优先级
pub const PRIORITY_TCP: i32 = 1;
/// USB 设备优先级（双传输接入时走 USB）
pub const PRIORITY_USB: i32 = 2;

/// 传输后端发布给调度器的设备接口
pub trait Device: Send + Sync {
    /// 由序列号推导的设备 ID（识别握手完成后才有意义）
    fn device_id(&self) -> u32;

    /// "usb" 或 "tcp"
    fn bridge_type(&self) -> &'static str;

    fn priority(&self) -> i32;

    fn device_nickname(&self) -> String;

    /// 识别响应 payload 原文（不透明透传给前端）
    fn identification(&self) -> Vec<u8>;

    fn deletion_flag(&self) -> bool;

    /// 把请求帧化并写入传输
    fn send_request(&self, request: Request);
}

/// 设备注册表
///
/// 所有操作在同一把互斥锁下串行；持锁期间不做任何阻塞 IO
pub struct DeviceRegistry {
    devices: Mutex<HashMap<u32, Weak<dyn Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// 发布设备
    ///
    /// 已有条目仍然存活且优先级不低于新设备时保留现状（同优先级的
    /// 重复接入被拒绝，避免两个 USB 口之间来回抖动）
    ///
    /// # 返回
    /// 新设备是否被存入
    pub fn insert(&self, device: &Arc<dyn Device>) -> bool {
        let mut devices = self.devices.lock().unwrap();
        match devices.entry(device.device_id()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(device));
                true
            },
            Entry::Occupied(mut entry) => {
                if let Some(existing) = entry.get().upgrade()
                    && !existing.deletion_flag()
                    && existing.priority() >= device.priority()
                {
                    info!(
                        "keeping existing {} device {:08x} over new {} device",
                        existing.bridge_type(),
                        device.device_id(),
                        device.bridge_type()
                    );
                    return false;
                }
                entry.insert(Arc::downgrade(device));
                true
            },
        }
    }

    /// 撤销设备
    ///
    /// 只有条目仍指向这台设备时才移除：它可能已被更高优先级的
    /// 接入替换过
    pub fn remove(&self, device: &Arc<dyn Device>) {
        let mut devices = self.devices.lock().unwrap();
        if let Entry::Occupied(entry) = devices.entry(device.device_id()) {
            let still_ours = match entry.get().upgrade() {
                Some(existing) => Arc::ptr_eq(&existing, device),
                None => true, // 弱引用已失效，顺手清掉
            };
            if still_ours {
                info!("removing device {:08x}", device.device_id());
                entry.remove();
            } else {
                debug!(
                    "device {:08x} already replaced in registry, not removing",
                    device.device_id()
                );
            }
        }
    }

    /// 查找设备；不存在、弱引用失效或已标记删除时返回 None
    pub fn lookup(&self, device_id: u32) -> Option<Arc<dyn Device>> {
        let devices = self.devices.lock().unwrap();
        devices
            .get(&device_id)
            .and_then(Weak::upgrade)
            .filter(|d| !d.deletion_flag())
    }

    /// 拍一份当前存活设备的快照
    ///
    /// 调用方在锁外使用快照（例如序列化设备列表）
    pub fn snapshot(&self) -> Vec<Arc<dyn Device>> {
        let devices = self.devices.lock().unwrap();
        devices
            .values()
            .filter_map(Weak::upgrade)
            .filter(|d| !d.deletion_flag())
            .collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
