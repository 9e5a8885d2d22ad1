//! 客户端抽象
//!
//! 客户端是响应的去处：前端会话（`frontend::SocketClient`）把响应写回
//! socket，本地系统客户端把响应直接丢弃。调度器按 client_id 强持有
//! 所有客户端。

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::messages::Response;
use crate::object::BridgeObject;

/// 响应接收方
pub trait Client: Send + Sync {
    fn client_id(&self) -> u32;

    /// 投递一个响应（不得阻塞调度线程）
    fn post_response(&self, response: Response);

    fn deletion_flag(&self) -> bool;

    /// 把响应携带的对象挂到客户端的 owned_objects 集合上
    fn adopt_objects(&self, objects: &[Arc<BridgeObject>]);

    /// 客户端主动关闭对象时摘除对应条目（转发关闭请求之前调用）
    fn disown_object(&self, device_id: u32, object_id: u32);
}

/// 本地系统客户端
///
/// 守护进程以它的名义发送注册时的对象重置请求；发回来的响应没有
/// 消费者，直接丢弃
pub struct LocalClient {
    client_id: u32,
    deletion_flag: AtomicBool,
    /// 理论上始终为空（重置响应不携带对象），保留以维持不变量
    owned_objects: Mutex<Vec<Arc<BridgeObject>>>,
}

impl LocalClient {
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            deletion_flag: AtomicBool::new(false),
            owned_objects: Mutex::new(Vec::new()),
        }
    }
}

impl Client for LocalClient {
    fn client_id(&self) -> u32 {
        self.client_id
    }

    fn post_response(&self, response: Response) {
        debug!(
            "dropping response for local client: tag={:08x} result={:08x}",
            response.tag, response.result_code
        );
    }

    fn deletion_flag(&self) -> bool {
        self.deletion_flag.load(Ordering::SeqCst)
    }

    fn adopt_objects(&self, objects: &[Arc<BridgeObject>]) {
        self.owned_objects.lock().unwrap().extend(objects.iter().cloned());
    }

    fn disown_object(&self, device_id: u32, object_id: u32) {
        let mut owned = self.owned_objects.lock().unwrap();
        owned.retain(|o| {
            if o.device_id == device_id && o.object_id == object_id {
                o.invalidate();
                false
            } else {
                true
            }
        });
    }
}
