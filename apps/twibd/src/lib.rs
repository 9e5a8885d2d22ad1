//! Twib 主机守护进程
//!
//! 把本地前端客户端多路复用到一组远程桥接设备上：前端请求经由
//! 调度器路由到 USB 或 TCP 传输，设备响应沿原路送回发起请求的
//! 客户端。设备由序列号推导的 device_id 标识，同一台设备经多种
//! 传输接入时按优先级仲裁（USB > TCP）。
//!
//! # 架构层次
//!
//! - `daemon`: 调度器（单消费者作业队列）与 meta 对象
//! - `backend`: USB / TCP 传输后端
//! - `frontend`: 本地客户端会话（UNIX / TCP socket）
//! - `device` / `client` / `object`: 注册表与生命周期记账

pub mod backend;
pub mod client;
pub mod config;
pub mod daemon;
pub mod device;
pub mod frontend;
pub mod messages;
pub mod object;
pub mod singleton;

pub use config::TwibdConfig;
pub use daemon::Twibd;
