//! Twib 桥接协议层
//!
//! 定义守护进程、前端和设备之间共用的线格式：
//! 定长小端消息头 + 变长 payload + 对象 ID 块。
//! 同时负责设备识别信息（MessagePack 编码）的解码。

pub mod header;
pub mod identification;
pub mod result_code;

pub use header::{
    MAX_OBJECT_COUNT, MAX_PAYLOAD_SIZE, MESSAGE_HEADER_SIZE, MessageHeader, command, meta_command,
};
pub use identification::{DeviceListEntry, Identification, device_id_for_serial, encode_device_list};
pub use result_code::*;

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("message header too short: expected {expected} bytes, got {actual}")]
    HeaderTooShort { expected: usize, actual: usize },

    #[error("payload size {size} exceeds limit {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("object count {count} exceeds limit {limit}")]
    TooManyObjects { count: u64, limit: u64 },

    #[error("identification decode error: {0}")]
    Identification(#[from] rmp_serde::decode::Error),
}
