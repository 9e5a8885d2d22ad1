//! TCP 传输后端
//!
//! 两条发现路径：UDP 组播公告（设备开机时广播 `twili-announce`，
//! 源地址就是设备地址）和 meta 对象的显式 CONNECT_TCP。会话建立后
//! 包装成帧化连接，由单个事件线程 poll 驱动；识别握手完成后发布
//! 到设备注册表。

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, info, warn};

use twib_protocol::{Identification, MessageHeader, command, device_id_for_serial, result_code};
use twib_transport::MessageConnection;

use crate::config::{ANNOUNCE_MULTICAST_GROUP, ANNOUNCE_PAYLOAD, TwibdConfig};
use crate::daemon::{TcpConnector, Twibd};
use crate::device::{Device, PRIORITY_TCP};
use crate::messages::{IDENTIFICATION_CLIENT_ID, Job, Request, Response};
use crate::object::BridgeObject;

/// 事件线程 poll 超时（兼做关闭标志的检查周期）
const POLL_INTERVAL_MS: u16 = 500;

/// TCP 后端
///
/// Drop 时停掉事件线程；会话由后端强持有，注册表只看到弱引用
pub struct TcpBackend {
    shared: Arc<TcpShared>,
    event_thread: Option<thread::JoinHandle<()>>,
}

struct TcpShared {
    twibd: Arc<Twibd>,
    listen: UdpSocket,
    bridge_port: u16,
    connections: Mutex<Vec<Arc<TcpDevice>>>,
    shutdown: AtomicBool,
}

impl TcpBackend {
    /// 绑定公告端口、加入组播组并启动事件线程
    pub fn start(twibd: Arc<Twibd>, config: &TwibdConfig) -> io::Result<Self> {
        let listen = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.announce_port))?;
        listen.set_nonblocking(true)?;
        if let Err(e) = listen.join_multicast_v4(&ANNOUNCE_MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)
        {
            // 某些受限环境不允许组播；显式连接仍然可用
            warn!("failed to join multicast group: {}", e);
        }

        let shared = Arc::new(TcpShared {
            twibd,
            listen,
            bridge_port: config.bridge_port,
            connections: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let event_thread = thread::Builder::new()
            .name("twibd-tcp".to_string())
            .spawn(move || event_thread_func(thread_shared))?;

        Ok(Self {
            shared,
            event_thread: Some(event_thread),
        })
    }

    /// 公告监听的本地端口（测试用：端口 0 绑定后取实际值）
    pub fn announce_port(&self) -> u16 {
        self.shared.listen.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// meta 对象 CONNECT_TCP 使用的连接入口
    pub fn connector(&self) -> TcpConnector {
        let shared = self.shared.clone();
        Box::new(move |hostname, port| TcpShared::connect_explicit(&shared, hostname, port))
    }
}

impl Drop for TcpBackend {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify();
        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }
    }
}

impl TcpShared {
    /// 显式连接路径；返回文本结果
    fn connect_explicit(this: &Arc<Self>, hostname: &str, port: &str) -> String {
        let port: u16 = match port.parse() {
            Ok(p) => p,
            Err(_) => return format!("invalid port: {}", port),
        };

        let addr = match (hostname, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => return format!("no addresses for {}", hostname),
            },
            Err(e) => return e.to_string(),
        };

        match TcpStream::connect_timeout(&addr, Duration::from_secs(5)) {
            Ok(stream) => match Self::begin_session(this, stream) {
                Ok(()) => {
                    info!("connected to {}", addr);
                    "Ok".to_string()
                },
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        }
    }

    /// 公告触发的连接路径：往公告源地址的桥接端口发起 TCP 连接
    fn connect_announced(this: &Arc<Self>, source: IpAddr) {
        let addr = SocketAddr::new(source, this.bridge_port);
        match TcpStream::connect_timeout(&addr, Duration::from_secs(2)) {
            Ok(stream) => {
                if let Err(e) = Self::begin_session(this, stream) {
                    error!("could not begin session with {}: {}", addr, e);
                } else {
                    info!("connected to announced device at {}", addr);
                }
            },
            Err(e) => error!("could not connect to {}: {}", addr, e),
        }
    }

    fn begin_session(this: &Arc<Self>, stream: TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;

        let device = Arc::new(TcpDevice::new(
            this.twibd.clone(),
            Arc::downgrade(this),
            stream,
        ));
        device.send_identify();

        this.connections.lock().unwrap().push(device);
        this.notify();
        Ok(())
    }

    /// 唤醒事件线程：往自己的监听端口发一个小数据报
    fn notify(&self) {
        let Ok(addr) = self.listen.local_addr() else {
            return;
        };
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
        if let Err(e) = self.listen.send_to(b"notify", target) {
            warn!("failed to notify tcp event thread: {}", e);
        }
    }

    /// 排空公告 socket，对每条公告发起连接
    fn drain_announcements(this: &Arc<Self>) {
        let mut buffer = [0u8; 256];
        loop {
            match this.listen.recv_from(&mut buffer) {
                Ok((len, source)) => {
                    if &buffer[..len] == ANNOUNCE_PAYLOAD {
                        info!("received twili device announcement from {}", source.ip());
                        Self::connect_announced(this, source.ip());
                    }
                    // 其他数据报（包括自己的 notify）只负责唤醒
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("announce socket error: {}", e);
                    break;
                },
            }
        }
    }
}

fn event_thread_func(shared: Arc<TcpShared>) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        let connections: Vec<Arc<TcpDevice>> = shared.connections.lock().unwrap().clone();

        let mut fds = Vec::with_capacity(connections.len() + 1);
        fds.push(PollFd::new(shared.listen.as_fd(), PollFlags::POLLIN));
        for connection in &connections {
            let mut flags = PollFlags::POLLIN;
            if connection.connection.has_output() {
                flags |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(connection.connection.stream().as_fd(), flags));
        }

        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(_) => {},
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!("failed to poll file descriptors: {}", e);
                break;
            },
        }

        let listen_ready = fds[0]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false);
        let session_events: Vec<PollFlags> = fds[1..]
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(fds);

        if listen_ready {
            TcpShared::drain_announcements(&shared);
        }

        // 泵 IO 并交付完整帧
        for (connection, revents) in connections.iter().zip(session_events) {
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                debug!("detected connection error");
                connection.connection.mark_for_deletion();
                continue;
            }
            if revents.contains(PollFlags::POLLOUT) {
                let _ = connection.connection.pump_output();
            }
            if revents.contains(PollFlags::POLLIN) {
                while let Ok(n) = connection.connection.pump_input() {
                    if n == 0 {
                        break;
                    }
                }
            }
            connection.process_frames();
        }

        // 发布已识别的设备；拆除标记删除的会话
        let mut held = shared.connections.lock().unwrap();
        held.retain(|connection| {
            if connection.connection.marked_for_deletion() || connection.deletion_flag() {
                TcpDevice::teardown(connection);
                false
            } else {
                if connection.ready_flag.load(Ordering::SeqCst)
                    && !connection.added_flag.load(Ordering::SeqCst)
                {
                    shared
                        .twibd
                        .add_device(connection.clone() as Arc<dyn Device>);
                    connection.added_flag.store(true, Ordering::SeqCst);
                }
                true
            }
        });
    }
    debug!("tcp backend event thread exiting");
}

struct PendingTag {
    client_id: u32,
    tag: u32,
}

/// 一条 TCP 桥接会话
pub struct TcpDevice {
    twibd: Arc<Twibd>,
    backend: Weak<TcpShared>,
    job_tx: Sender<Job>,
    connection: MessageConnection<TcpStream>,
    device_id: AtomicU32,
    device_nickname: Mutex<String>,
    identification: Mutex<Vec<u8>>,
    ready_flag: AtomicBool,
    added_flag: AtomicBool,
    deletion_flag: AtomicBool,
    pending_requests: Mutex<Vec<PendingTag>>,
}

impl TcpDevice {
    fn new(twibd: Arc<Twibd>, backend: Weak<TcpShared>, stream: TcpStream) -> Self {
        let job_tx = twibd.job_sender();
        Self {
            twibd,
            backend,
            job_tx,
            connection: MessageConnection::new(stream),
            device_id: AtomicU32::new(0),
            device_nickname: Mutex::new(String::new()),
            identification: Mutex::new(Vec::new()),
            ready_flag: AtomicBool::new(false),
            added_flag: AtomicBool::new(false),
            deletion_flag: AtomicBool::new(false),
            pending_requests: Mutex::new(Vec::new()),
        }
    }

    /// 识别握手：向根对象发 IDENTIFY，client_id 槽位使用标记值
    fn send_identify(&self) {
        self.send_request(Request::new(
            None,
            0,
            0,
            command::IDENTIFY,
            0xFFFF_FFFF,
            Vec::new(),
        ));
    }

    /// 交付入缓冲区里的完整帧
    fn process_frames(&self) {
        let result = self.connection.process(|header, payload, object_ids| {
            self.incoming_message(header, payload, object_ids);
        });
        if let Err(e) = result {
            debug!("tcp connection error: {}", e);
        }
    }

    fn incoming_message(&self, header: MessageHeader, payload: Bytes, object_ids: Vec<u32>) {
        // 设备一跳的首字段承载 client_id
        let client_id = header.device_id;

        self.pending_requests
            .lock()
            .unwrap()
            .retain(|p| !(p.client_id == client_id && p.tag == header.tag));

        if client_id == IDENTIFICATION_CLIENT_ID {
            self.identified(header.command_or_result, &payload);
            return;
        }

        let objects = object_ids
            .iter()
            .map(|&id| {
                Arc::new(BridgeObject::new(
                    self.job_tx.clone(),
                    self.device_id(),
                    id,
                ))
            })
            .collect();

        self.twibd.post_response(Response {
            client_id,
            device_id: self.device_id(),
            object_id: header.object_id,
            result_code: header.command_or_result,
            tag: header.tag,
            payload: payload.to_vec(),
            objects,
        });
    }

    /// 处理识别响应：解码序列号和昵称，推导 device_id，进入就绪态
    fn identified(&self, result: u32, payload: &[u8]) {
        debug!("got identification response back, payload size {:#x}", payload.len());
        if result != result_code::RESULT_OK {
            warn!("device identification error: {:08x}", result);
            self.deletion_flag.store(true, Ordering::SeqCst);
            return;
        }

        let ident = match Identification::decode(payload) {
            Ok(ident) => ident,
            Err(e) => {
                warn!("failed to decode identification payload: {}", e);
                self.deletion_flag.store(true, Ordering::SeqCst);
                return;
            },
        };

        let device_id = device_id_for_serial(&ident.serial_number);
        info!("nickname: {}", ident.device_nickname);
        info!(
            "serial number: {}",
            String::from_utf8_lossy(&ident.serial_number)
        );
        info!("assigned device id: {:08x}", device_id);

        *self.device_nickname.lock().unwrap() = ident.device_nickname;
        *self.identification.lock().unwrap() = payload.to_vec();
        self.device_id.store(device_id, Ordering::SeqCst);
        self.ready_flag.store(true, Ordering::SeqCst);
    }

    /// 会话拆除：撤销注册表条目，挂起的请求全部以
    /// UNRECOGNIZED_DEVICE 完结
    fn teardown(this: &Arc<Self>) {
        this.deletion_flag.store(true, Ordering::SeqCst);
        if this.added_flag.load(Ordering::SeqCst) {
            let device: Arc<dyn Device> = this.clone();
            this.twibd.remove_device(&device);
        }

        let pending = std::mem::take(&mut *this.pending_requests.lock().unwrap());
        for entry in pending {
            this.twibd.post_response(Response {
                client_id: entry.client_id,
                device_id: this.device_id(),
                object_id: 0,
                result_code: result_code::UNRECOGNIZED_DEVICE,
                tag: entry.tag,
                payload: Vec::new(),
                objects: Vec::new(),
            });
        }
        info!("removed tcp connection for device {:08x}", this.device_id());
    }
}

impl Device for TcpDevice {
    fn device_id(&self) -> u32 {
        self.device_id.load(Ordering::SeqCst)
    }

    fn bridge_type(&self) -> &'static str {
        "tcp"
    }

    fn priority(&self) -> i32 {
        PRIORITY_TCP
    }

    fn device_nickname(&self) -> String {
        self.device_nickname.lock().unwrap().clone()
    }

    fn identification(&self) -> Vec<u8> {
        self.identification.lock().unwrap().clone()
    }

    fn deletion_flag(&self) -> bool {
        self.deletion_flag.load(Ordering::SeqCst)
    }

    fn send_request(&self, request: Request) {
        let header = MessageHeader {
            // 设备一跳的首字段承载 client_id
            device_id: request.client_id(),
            object_id: request.object_id,
            command_or_result: request.command_id,
            tag: request.tag,
            payload_size: request.payload.len() as u64,
            object_count: request.object_ids.len() as u64,
        };

        self.pending_requests.lock().unwrap().push(PendingTag {
            client_id: request.client_id(),
            tag: request.tag,
        });

        if let Err(e) =
            self.connection
                .send_message(&header, &request.payload, &request.object_ids)
        {
            warn!("failed to send request over tcp: {}", e);
            // 连接已被标记删除，事件线程下一轮拆除并完结挂起请求
        }

        // 出缓冲区可能还有剩余，让事件线程关注可写
        if self.connection.has_output()
            && let Some(backend) = self.backend.upgrade()
        {
            backend.notify();
        }
    }
}
