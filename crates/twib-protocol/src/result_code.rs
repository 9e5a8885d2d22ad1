//! 结果码定义
//!
//! 采用 Horizon 风格的结果编码：`module | (description << 9)`。
//! 编码原样保留在线格式上，守护进程自身只会生成下面列出的几个结果码。

/// 协议错误所属的模块号
pub const MODULE: u32 = 0xEF;

const fn make_result(description: u32) -> u32 {
    MODULE | (description << 9)
}

/// 成功
pub const RESULT_OK: u32 = 0;

/// 目标设备不存在或已断开
pub const UNRECOGNIZED_DEVICE: u32 = make_result(1);

/// 目标对象不存在
pub const UNRECOGNIZED_OBJECT: u32 = make_result(2);

/// 命令 ID 不被目标对象支持
pub const UNRECOGNIZED_FUNCTION: u32 = make_result(3);

/// 请求 payload 的长度或结构不合法
pub const BAD_REQUEST: u32 = make_result(4);

/// 流已结束
pub const RESULT_EOF: u32 = make_result(5);

/// 结果码的可读名称（用于日志）
pub fn result_name(code: u32) -> &'static str {
    match code {
        RESULT_OK => "OK",
        UNRECOGNIZED_DEVICE => "UNRECOGNIZED_DEVICE",
        UNRECOGNIZED_OBJECT => "UNRECOGNIZED_OBJECT",
        UNRECOGNIZED_FUNCTION => "UNRECOGNIZED_FUNCTION",
        BAD_REQUEST => "BAD_REQUEST",
        RESULT_EOF => "EOF",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_encoding() {
        // module 在低 9 位，description 从第 9 位开始
        assert_eq!(UNRECOGNIZED_DEVICE, 0xEF | (1 << 9));
        assert_eq!(BAD_REQUEST & 0x1FF, MODULE);
        assert_eq!(BAD_REQUEST >> 9, 4);
    }

    #[test]
    fn test_result_codes_distinct() {
        let codes = [
            RESULT_OK,
            UNRECOGNIZED_DEVICE,
            UNRECOGNIZED_OBJECT,
            UNRECOGNIZED_FUNCTION,
            BAD_REQUEST,
            RESULT_EOF,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_result_name() {
        assert_eq!(result_name(RESULT_OK), "OK");
        assert_eq!(result_name(UNRECOGNIZED_DEVICE), "UNRECOGNIZED_DEVICE");
        assert_eq!(result_name(0x1234_5678), "unknown");
    }
}
