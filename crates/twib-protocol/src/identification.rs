//! 设备识别信息
//!
//! 设备对 IDENTIFY 请求的响应 payload 是一个 MessagePack 编码的 map，
//! 值里混有二进制字段。守护进程只在识别时解码一次 `serial_number` 和
//! `device_nickname`，其余内容作为不透明字节透传给前端。

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// 识别 map 中守护进程关心的字段
///
/// 未知字段被忽略；缺失字段取默认值（设备固件版本差异是常态）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Identification {
    #[serde(default)]
    pub device_nickname: String,

    /// 序列号是二进制值（bin 格式），不保证是合法 UTF-8
    #[serde(default, with = "serde_bytes")]
    pub serial_number: Vec<u8>,
}

impl Identification {
    /// 从识别响应 payload 解码
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(payload)?)
    }
}

/// 由序列号推导设备 ID
///
/// 32 位 FNV-1a：跨主机、跨重启稳定，同一台物理设备无论经由哪种
/// 传输接入都得到同一个 ID
pub fn device_id_for_serial(serial: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for &byte in serial {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// LIST_DEVICES 响应中的单个设备条目
///
/// 整个响应 payload 是 `Vec<DeviceListEntry>` 的 MessagePack map 编码
/// （`rmp_serde::to_vec_named`），identification 字段透传识别 payload 原文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceListEntry {
    pub device_id: u32,
    pub bridge_type: String,
    pub device_nickname: String,
    #[serde(with = "serde_bytes")]
    pub identification: Vec<u8>,
}

/// 编码 LIST_DEVICES 响应 payload
pub fn encode_device_list(entries: &[DeviceListEntry]) -> Vec<u8> {
    // Vec<u8> 的 MessagePack 写入不会失败
    rmp_serde::to_vec_named(entries).expect("device list serialization cannot fail")
}
