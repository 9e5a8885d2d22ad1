//! 传输后端
//!
//! 每个后端负责发现设备、维护传输会话，并把识别完成的设备发布到
//! 注册表。后端强持有自己的会话；注册表和调度器只看到 `dyn Device`。

pub mod tcp;
pub mod usb;
