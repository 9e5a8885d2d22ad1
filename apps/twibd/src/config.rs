//! 守护进程配置

use std::path::PathBuf;
use std::time::Duration;

/// 设备侧 TCP 桥接端口（协议固定值）
pub const DEFAULT_BRIDGE_PORT: u16 = 15152;

/// UDP 设备公告监听端口
pub const DEFAULT_ANNOUNCE_PORT: u16 = 15153;

/// 前端 TCP 监听端口（仅 localhost）
pub const DEFAULT_FRONTEND_TCP_PORT: u16 = 15151;

/// 设备公告的组播组
pub const ANNOUNCE_MULTICAST_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(224, 0, 53, 55);

/// 公告数据报的字面 payload（无结尾 NUL）
pub const ANNOUNCE_PAYLOAD: &[u8] = b"twili-announce";

/// 守护进程配置
#[derive(Debug, Clone)]
pub struct TwibdConfig {
    /// 启用 UNIX socket 前端
    pub unix_frontend_enabled: bool,

    /// UNIX socket 路径
    pub unix_frontend_path: PathBuf,

    /// 启用 TCP 前端（仅 localhost）
    pub tcp_frontend_enabled: bool,

    /// 前端 TCP 端口
    pub tcp_frontend_port: u16,

    /// 启用 USB 后端
    pub usb_backend_enabled: bool,

    /// 启用 TCP 后端（UDP 公告发现 + 显式连接）
    pub tcp_backend_enabled: bool,

    /// UDP 公告监听端口
    pub announce_port: u16,

    /// 设备侧 TCP 桥接端口
    pub bridge_port: u16,

    /// USB 批量传输超时
    pub usb_transfer_timeout: Duration,
}

impl Default for TwibdConfig {
    fn default() -> Self {
        Self {
            unix_frontend_enabled: true,
            unix_frontend_path: default_unix_socket_path(),
            tcp_frontend_enabled: true,
            tcp_frontend_port: DEFAULT_FRONTEND_TCP_PORT,
            usb_backend_enabled: true,
            tcp_backend_enabled: true,
            announce_port: DEFAULT_ANNOUNCE_PORT,
            bridge_port: DEFAULT_BRIDGE_PORT,
            usb_transfer_timeout: Duration::from_millis(1000),
        }
    }
}

/// 默认的 UNIX socket 路径（XDG 合规）
///
/// 优先 $XDG_RUNTIME_DIR，其次系统临时目录
pub fn default_unix_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        return runtime_dir.join("twibd.sock");
    }
    std::env::temp_dir().join("twibd.sock")
}

/// 默认的单例锁文件路径
pub fn default_lock_file_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        return runtime_dir.join("twibd.lock");
    }
    std::env::temp_dir().join("twibd.lock")
}
