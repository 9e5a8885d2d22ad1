//! 消息头定义
//!
//! 请求和响应共用同一个 32 字节小端消息头，随后是 `payload_size` 字节的
//! payload 和 `object_count` 个 u32 对象 ID。

use bytes::{Buf, BufMut, BytesMut};

use crate::ProtocolError;

/// 消息头大小（字节）
pub const MESSAGE_HEADER_SIZE: usize = 32;

/// payload 大小上限（256 MiB）
///
/// 超过上限的帧视为协议违规，连接被标记删除
pub const MAX_PAYLOAD_SIZE: u64 = 256 * 1024 * 1024;

/// 单帧携带的对象 ID 数量上限
pub const MAX_OBJECT_COUNT: u64 = 64;

/// 特殊命令 ID
pub mod command {
    /// 关闭远程对象（发往 object 0 时为“重置该设备上的全部对象”）
    pub const CLOSE_OBJECT: u32 = 0xFFFF_FFFF;

    /// 设备识别握手（发往设备根对象）
    pub const IDENTIFY: u32 = 1;
}

/// 守护进程内置 meta 对象（device 0 / object 0）的命令 ID
pub mod meta_command {
    pub const LIST_DEVICES: u32 = 10;
    pub const CONNECT_TCP: u32 = 11;
}

/// 线格式消息头
///
/// 第三个字段在请求中是 `command_id`，在响应中是 `result_code`。
/// 第一个字段在前端一侧是 `device_id`；在守护进程和设备之间的一跳，
/// 同一偏移承载 `client_id`（识别握手使用 0xFFFFFFFF）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub device_id: u32,
    pub object_id: u32,
    /// command_id（请求）/ result_code（响应）
    pub command_or_result: u32,
    pub tag: u32,
    pub payload_size: u64,
    pub object_count: u64,
}

impl MessageHeader {
    /// 编码消息头到输出缓冲区（32 字节，小端）
    pub fn encode_to(&self, dst: &mut BytesMut) {
        dst.reserve(MESSAGE_HEADER_SIZE);
        dst.put_u32_le(self.device_id);
        dst.put_u32_le(self.object_id);
        dst.put_u32_le(self.command_or_result);
        dst.put_u32_le(self.tag);
        dst.put_u64_le(self.payload_size);
        dst.put_u64_le(self.object_count);
    }

    /// 从字节切片解码消息头
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: MESSAGE_HEADER_SIZE,
                actual: src.len(),
            });
        }

        let mut buf = src;
        Ok(Self {
            device_id: buf.get_u32_le(),
            object_id: buf.get_u32_le(),
            command_or_result: buf.get_u32_le(),
            tag: buf.get_u32_le(),
            payload_size: buf.get_u64_le(),
            object_count: buf.get_u64_le(),
        })
    }

    /// 校验帧大小限制
    ///
    /// 违规不是可恢复错误：调用方应当把所属连接标记删除
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.payload_size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload_size,
                limit: MAX_PAYLOAD_SIZE,
            });
        }
        if self.object_count > MAX_OBJECT_COUNT {
            return Err(ProtocolError::TooManyObjects {
                count: self.object_count,
                limit: MAX_OBJECT_COUNT,
            });
        }
        Ok(())
    }

    /// 帧总大小（消息头 + payload + 对象 ID 块）
    ///
    /// 仅对通过 `validate()` 的消息头有意义
    pub fn frame_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.payload_size as usize + self.object_count as usize * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = MessageHeader {
            device_id: 0xDEAD_BEEF,
            object_id: 7,
            command_or_result: 10,
            tag: 0x1234_5678,
            payload_size: 42,
            object_count: 3,
        };

        let mut buf = BytesMut::new();
        header.encode_to(&mut buf);
        assert_eq!(buf.len(), MESSAGE_HEADER_SIZE);

        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_wire_layout() {
        // 线格式是外部契约：逐字段验证偏移和字节序
        let header = MessageHeader {
            device_id: 0x0403_0201,
            object_id: 0x0807_0605,
            command_or_result: 0x0C0B_0A09,
            tag: 0x100F_0E0D,
            payload_size: 0x1817_1615_1413_1211,
            object_count: 0x201F_1E1D_1C1B_1A19,
        };

        let mut buf = BytesMut::new();
        header.encode_to(&mut buf);

        let expected: Vec<u8> = (1u8..=0x20).collect();
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_header_too_short() {
        let err = MessageHeader::decode(&[0u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            crate::ProtocolError::HeaderTooShort { actual: 16, .. }
        ));
    }

    #[test]
    fn test_validate_payload_limit() {
        let header = MessageHeader {
            device_id: 0,
            object_id: 0,
            command_or_result: 0,
            tag: 0,
            payload_size: 1 << 40,
            object_count: 0,
        };
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_validate_object_count_limit() {
        let header = MessageHeader {
            device_id: 0,
            object_id: 0,
            command_or_result: 0,
            tag: 0,
            payload_size: 0,
            object_count: MAX_OBJECT_COUNT + 1,
        };
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_frame_size() {
        let header = MessageHeader {
            device_id: 0,
            object_id: 0,
            command_or_result: 0,
            tag: 0,
            payload_size: 10,
            object_count: 2,
        };
        assert_eq!(header.frame_size(), 32 + 10 + 8);
    }
}
