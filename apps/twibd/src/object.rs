//! 远程对象引用
//!
//! 设备在响应中声明的对象以 `BridgeObject` 的形式存活在守护进程里，
//! 由拥有它的客户端的 owned_objects 集合持有。最后一个引用被丢弃时
//! 自动向设备发出关闭请求，释放设备侧资源。

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use tracing::trace;

use twib_protocol::command;

use crate::messages::{Job, Request};

/// 远程对象句柄
///
/// `object_id = 0` 是每个设备的根对象，永远不会被关闭
pub struct BridgeObject {
    pub device_id: u32,
    pub object_id: u32,
    valid: AtomicBool,
    job_tx: Sender<Job>,
}

impl BridgeObject {
    pub fn new(job_tx: Sender<Job>, device_id: u32, object_id: u32) -> Self {
        Self {
            device_id,
            object_id,
            valid: AtomicBool::new(true),
            job_tx,
        }
    }

    /// 标记句柄已失效，Drop 时不再发送关闭请求
    ///
    /// 客户端自己发出关闭请求时，调度器在转发之前调用此方法，
    /// 避免析构时二次关闭
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

impl Drop for BridgeObject {
    fn drop(&mut self) {
        if !self.is_valid() || self.object_id == 0 {
            return;
        }
        trace!(
            "closing remote object {:x} on device {:08x}",
            self.object_id, self.device_id
        );
        // 守护进程停机时队列可能已经关闭，发送失败可以忽略
        let _ = self.job_tx.send(Job::Request(Request::new(
            None,
            self.device_id,
            self.object_id,
            command::CLOSE_OBJECT,
            0,
            Vec::new(),
        )));
    }
}
