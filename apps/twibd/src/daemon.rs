//! 调度器
//!
//! 守护进程的核心：单消费者作业队列把前端来的请求和设备来的响应
//! 串成一条处理流。请求按 device_id 路由到注册表里的设备；响应按
//! client_id 路由回客户端。device 0 / object 0 是进程内的 meta 对象，
//! 提供设备枚举和显式 TCP 连接。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, info, warn};

use twib_protocol::{
    DeviceListEntry, command, encode_device_list, meta_command, result_code,
};

use crate::client::{Client, LocalClient};
use crate::device::{Device, DeviceRegistry};
use crate::messages::{IDENTIFICATION_CLIENT_ID, Job, Request, Response};

/// TCP 后端的显式连接入口（meta 对象的 CONNECT_TCP 走这里）
///
/// 返回文本结果："Ok" 或错误描述
pub type TcpConnector = Box<dyn Fn(&str, &str) -> String + Send + Sync>;

/// 守护进程调度器
pub struct Twibd {
    job_tx: Sender<Job>,
    job_rx: Receiver<Job>,
    clients: Mutex<HashMap<u32, Arc<dyn Client>>>,
    registry: DeviceRegistry,
    local_client: Arc<LocalClient>,
    tcp_connector: Mutex<Option<TcpConnector>>,
}

impl Twibd {
    pub fn new() -> Arc<Self> {
        let (job_tx, job_rx) = unbounded();

        // 本地系统客户端占一个普通的随机 ID
        let local_id = loop {
            let id: u32 = rand::random();
            if id != 0 && id != IDENTIFICATION_CLIENT_ID {
                break id;
            }
        };
        let local_client = Arc::new(LocalClient::new(local_id));

        let mut clients: HashMap<u32, Arc<dyn Client>> = HashMap::new();
        clients.insert(local_id, local_client.clone());

        Arc::new(Self {
            job_tx,
            job_rx,
            clients: Mutex::new(clients),
            registry: DeviceRegistry::new(),
            local_client,
            tcp_connector: Mutex::new(None),
        })
    }

    /// 作业队列的生产者端（后端和前端会话各自持有一份）
    pub fn job_sender(&self) -> Sender<Job> {
        self.job_tx.clone()
    }

    pub fn post_request(&self, request: Request) {
        let _ = self.job_tx.send(Job::Request(request));
    }

    pub fn post_response(&self, response: Response) {
        let _ = self.job_tx.send(Job::Response(response));
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// 注册一个新客户端
    ///
    /// client_id 在持锁状态下拒绝采样：非零、不是识别标记值、
    /// 且不与现存客户端冲突
    pub fn register_client<C, F>(&self, build: F) -> Arc<C>
    where
        C: Client + 'static,
        F: FnOnce(u32) -> C,
    {
        let mut clients = self.clients.lock().unwrap();
        let client_id = loop {
            let id: u32 = rand::random();
            if id != 0 && id != IDENTIFICATION_CLIENT_ID && !clients.contains_key(&id) {
                break id;
            }
        };
        let client = Arc::new(build(client_id));
        clients.insert(client_id, client.clone());
        info!("adding client with newly assigned id {:08x}", client_id);
        client
    }

    /// 移除客户端
    ///
    /// 调用方必须已经先清空它的 owned_objects（关闭请求要在移除前
    /// 入队）
    pub fn remove_client(&self, client_id: u32) {
        self.clients.lock().unwrap().remove(&client_id);
        info!("removing client {:08x}", client_id);
    }

    fn get_client(&self, client_id: u32) -> Option<Arc<dyn Client>> {
        let clients = self.clients.lock().unwrap();
        clients
            .get(&client_id)
            .cloned()
            .filter(|c| !c.deletion_flag())
    }

    /// 发布设备并重置它在上一次连接中残留的对象
    pub fn add_device(&self, device: Arc<dyn Device>) {
        let device_id = device.device_id();
        if !self.registry.insert(&device) {
            return;
        }
        info!(
            "adding {} device with id {:08x}",
            device.bridge_type(),
            device_id
        );

        debug!("resetting objects on new device");
        self.post_request(Request::new(
            Some(self.local_client.clone() as Arc<dyn Client>),
            device_id,
            0,
            command::CLOSE_OBJECT,
            0,
            Vec::new(),
        ));
    }

    pub fn remove_device(&self, device: &Arc<dyn Device>) {
        self.registry.remove(device);
    }

    pub fn set_tcp_connector(&self, connector: TcpConnector) {
        *self.tcp_connector.lock().unwrap() = Some(connector);
    }

    /// 调度循环：阻塞消费作业队列
    pub fn run(&self) {
        while self.process_one() {}
    }

    /// 处理一个作业
    ///
    /// # 返回
    /// 队列关闭（所有生产者消失）时返回 false
    pub fn process_one(&self) -> bool {
        match self.job_rx.recv() {
            Ok(job) => {
                self.process_job(job);
                true
            },
            Err(_) => false,
        }
    }

    /// 非阻塞地处理队列里现存的全部作业，包括处理过程中级联入队的
    ///
    /// # 返回
    /// 处理的作业数
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        while let Ok(job) = self.job_rx.try_recv() {
            self.process_job(job);
            handled += 1;
        }
        handled
    }

    fn process_job(&self, job: Job) {
        match job {
            Job::Request(rq) => self.dispatch_request(rq),
            Job::Response(rs) => self.dispatch_response(rs),
        }
    }

    fn dispatch_request(&self, rq: Request) {
        debug!(
            "dispatching request: client={:08x} device={:08x} object={:x} command={:08x} tag={:08x}",
            rq.client_id(),
            rq.device_id,
            rq.object_id,
            rq.command_id,
            rq.tag
        );

        if rq.device_id == 0 {
            let response = self.handle_meta_request(&rq);
            self.post_response(response);
            return;
        }

        let Some(device) = self.registry.lookup(rq.device_id) else {
            debug!("unrecognized device {:08x}", rq.device_id);
            self.post_response(rq.respond_error(result_code::UNRECOGNIZED_DEVICE));
            return;
        };

        if rq.command_id == command::CLOSE_OBJECT
            && let Some(client) = &rq.client
        {
            // 转发之前先解除客户端的持有，析构时就不会二次关闭
            debug!("detected close request for object {:x}", rq.object_id);
            client.disown_object(rq.device_id, rq.object_id);
        }

        device.send_request(rq);
    }

    fn dispatch_response(&self, rs: Response) {
        debug!(
            "dispatching response: client={:08x} device={:08x} result={} tag={:08x}",
            rs.client_id,
            rs.device_id,
            result_code::result_name(rs.result_code),
            rs.tag
        );

        let Some(client) = self.get_client(rs.client_id) else {
            // 客户端已经走了：丢弃响应，随之丢弃的对象引用会自动
            // 向设备发出关闭请求
            debug!("dropping response for bad client {:08x}", rs.client_id);
            return;
        };

        client.adopt_objects(&rs.objects);
        client.post_response(rs);
    }

    /// 进程内 meta 对象（device 0 / object 0）
    fn handle_meta_request(&self, rq: &Request) -> Response {
        if rq.object_id != 0 {
            return rq.respond_error(result_code::UNRECOGNIZED_OBJECT);
        }

        match rq.command_id {
            meta_command::LIST_DEVICES => {
                debug!("meta object: LIST_DEVICES");
                // 快照在锁下，序列化在锁外
                let devices = self.registry.snapshot();
                let entries: Vec<DeviceListEntry> = devices
                    .iter()
                    .map(|d| DeviceListEntry {
                        device_id: d.device_id(),
                        bridge_type: d.bridge_type().to_string(),
                        device_nickname: d.device_nickname(),
                        identification: d.identification(),
                    })
                    .collect();
                rq.respond_ok(encode_device_list(&entries))
            },
            meta_command::CONNECT_TCP => {
                debug!("meta object: CONNECT_TCP");
                let Some((hostname, port)) = parse_connect_tcp(&rq.payload) else {
                    return rq.respond_error(result_code::BAD_REQUEST);
                };
                info!("requested to connect to {}:{}", hostname, port);

                let connector = self.tcp_connector.lock().unwrap();
                let message = match connector.as_ref() {
                    Some(connect) => connect(&hostname, &port),
                    None => "TCP backend disabled".to_string(),
                };
                rq.respond_ok(message.into_bytes())
            },
            _ => {
                warn!("unrecognized meta command {:08x}", rq.command_id);
                rq.respond_error(result_code::UNRECOGNIZED_FUNCTION)
            },
        }
    }
}

/// 解析 CONNECT_TCP 的 payload：
/// `{hostname_len: u64, port_len: u64, hostname, port}`（小端）
fn parse_connect_tcp(payload: &[u8]) -> Option<(String, String)> {
    if payload.len() < 16 {
        return None;
    }
    let hostname_len = u64::from_le_bytes(payload[0..8].try_into().unwrap()) as usize;
    let port_len = u64::from_le_bytes(payload[8..16].try_into().unwrap()) as usize;

    let total = 16usize
        .checked_add(hostname_len)?
        .checked_add(port_len)?;
    if payload.len() != total {
        return None;
    }

    let hostname = std::str::from_utf8(&payload[16..16 + hostname_len]).ok()?;
    let port = std::str::from_utf8(&payload[16 + hostname_len..]).ok()?;
    Some((hostname.to_string(), port.to_string()))
}
