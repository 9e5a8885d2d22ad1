//! 调度队列上的作业类型
//!
//! 前端会话产出请求，传输后端产出响应，两者汇入同一条
//! 多生产者/单消费者队列，由调度线程统一处理。

use std::sync::Arc;

use twib_protocol::result_code;

use crate::client::Client;
use crate::object::BridgeObject;

/// 守护进程自身发起的请求在 client_id 槽位上使用的标记值
/// （识别握手、注册时的对象重置等）
pub const IDENTIFICATION_CLIENT_ID: u32 = 0xFFFF_FFFF;

/// 调度队列作业
pub enum Job {
    Request(Request),
    Response(Response),
}

/// 前端（或守护进程自身）发往设备的请求
pub struct Request {
    /// 发起请求的客户端；守护进程自身发起的请求为 None
    pub client: Option<Arc<dyn Client>>,
    pub device_id: u32,
    pub object_id: u32,
    pub command_id: u32,
    pub tag: u32,
    pub payload: Vec<u8>,
    /// 随请求转移给设备的对象 ID
    pub object_ids: Vec<u32>,
}

impl Request {
    pub fn new(
        client: Option<Arc<dyn Client>>,
        device_id: u32,
        object_id: u32,
        command_id: u32,
        tag: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            client,
            device_id,
            object_id,
            command_id,
            tag,
            payload,
            object_ids: Vec::new(),
        }
    }

    /// 发起方的 client_id（写入设备一跳的消息头）
    pub fn client_id(&self) -> u32 {
        self.client
            .as_ref()
            .map(|c| c.client_id())
            .unwrap_or(IDENTIFICATION_CLIENT_ID)
    }

    /// 构造成功响应
    pub fn respond_ok(&self, payload: Vec<u8>) -> Response {
        self.respond(result_code::RESULT_OK, payload)
    }

    /// 构造错误响应
    pub fn respond_error(&self, result: u32) -> Response {
        self.respond(result, Vec::new())
    }

    fn respond(&self, result_code: u32, payload: Vec<u8>) -> Response {
        Response {
            client_id: self.client_id(),
            device_id: self.device_id,
            object_id: self.object_id,
            result_code,
            tag: self.tag,
            payload,
            objects: Vec::new(),
        }
    }
}

/// 设备（或 meta 对象）发回客户端的响应
pub struct Response {
    pub client_id: u32,
    pub device_id: u32,
    pub object_id: u32,
    pub result_code: u32,
    pub tag: u32,
    pub payload: Vec<u8>,
    /// 设备随响应新铸的远程对象引用
    pub objects: Vec<Arc<BridgeObject>>,
}
