//! Socket 前端
//!
//! 在 UNIX socket 和/或 localhost TCP socket 上接受本地客户端会话。
//! 每条会话一对线程：读线程把帧转成请求投进调度队列，写线程把
//! 调度器排给这个客户端的响应按序写回 socket。会话结束时先清空
//! owned_objects（由此入队对象关闭请求），再从客户端表移除。

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, info, warn};

use twib_protocol::MessageHeader;
use twib_transport::{ByteStream, MessageConnection};

use crate::client::Client;
use crate::daemon::Twibd;
use crate::messages::{Request, Response};
use crate::object::BridgeObject;

/// 一个监听中的前端 socket
pub struct SocketFrontend {
    local_addr: Option<SocketAddr>,
    unix_path: Option<PathBuf>,
    _accept_thread: thread::JoinHandle<()>,
}

impl SocketFrontend {
    /// 在 UNIX socket 上监听
    ///
    /// 残留的 socket 文件（上次异常退出）先删掉再绑定
    pub fn spawn_unix(twibd: Arc<Twibd>, path: &Path) -> io::Result<Self> {
        if path.exists() {
            info!("removing stale socket file {}", path.display());
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("listening on {}", path.display());

        let accept_thread = thread::Builder::new()
            .name("twibd-frontend-unix".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => spawn_session(twibd.clone(), stream),
                        Err(e) => {
                            // EMFILE 之类的瞬时错误不应放弃监听
                            warn!("unix accept error: {}", e);
                            std::thread::sleep(std::time::Duration::from_millis(100));
                        },
                    }
                }
            })?;

        Ok(Self {
            local_addr: None,
            unix_path: Some(path.to_path_buf()),
            _accept_thread: accept_thread,
        })
    }

    /// 在 localhost TCP 上监听
    pub fn spawn_tcp(twibd: Arc<Twibd>, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        let accept_thread = thread::Builder::new()
            .name("twibd-frontend-tcp".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let _ = stream.set_nodelay(true);
                            spawn_session(twibd.clone(), stream);
                        },
                        Err(e) => {
                            warn!("tcp accept error: {}", e);
                            std::thread::sleep(std::time::Duration::from_millis(100));
                        },
                    }
                }
            })?;

        Ok(Self {
            local_addr: Some(local_addr),
            unix_path: None,
            _accept_thread: accept_thread,
        })
    }

    /// TCP 监听的实际地址（测试用：端口 0 绑定后取实际值）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn unix_path(&self) -> Option<&Path> {
        self.unix_path.as_deref()
    }
}

/// 一条前端会话对应的客户端
pub struct SocketClient {
    client_id: u32,
    response_tx: Sender<Response>,
    deletion_flag: AtomicBool,
    owned_objects: Mutex<Vec<Arc<BridgeObject>>>,
}

impl SocketClient {
    fn new(client_id: u32, response_tx: Sender<Response>) -> Self {
        Self {
            client_id,
            response_tx,
            deletion_flag: AtomicBool::new(false),
            owned_objects: Mutex::new(Vec::new()),
        }
    }
}

impl Client for SocketClient {
    fn client_id(&self) -> u32 {
        self.client_id
    }

    fn post_response(&self, response: Response) {
        // 写线程已退出时响应没有去处，丢弃即可
        let _ = self.response_tx.send(response);
    }

    fn deletion_flag(&self) -> bool {
        self.deletion_flag.load(Ordering::SeqCst)
    }

    fn adopt_objects(&self, objects: &[Arc<BridgeObject>]) {
        if objects.is_empty() {
            return;
        }
        let mut owned = self.owned_objects.lock().unwrap();
        for object in objects {
            // owned_objects 不允许重复条目
            if !owned.iter().any(|o| Arc::ptr_eq(o, object)) {
                owned.push(object.clone());
            }
        }
    }

    fn disown_object(&self, device_id: u32, object_id: u32) {
        let mut owned = self.owned_objects.lock().unwrap();
        let mut found = false;
        owned.retain(|o| {
            if o.device_id == device_id && o.object_id == object_id {
                o.invalidate();
                found = true;
                false
            } else {
                true
            }
        });
        if !found {
            debug!(
                "close request for object {:x} not owned by client {:08x}",
                object_id, self.client_id
            );
        }
    }
}

/// 为一条已接受的连接起一对会话线程
fn spawn_session<S>(twibd: Arc<Twibd>, stream: S)
where
    S: ByteStream + 'static,
{
    let (response_tx, response_rx) = unbounded();
    let client = twibd.register_client(|client_id| SocketClient::new(client_id, response_tx));
    let connection = Arc::new(MessageConnection::new(stream));

    let writer_connection = connection.clone();
    let writer_client_id = client.client_id();
    let writer = thread::Builder::new()
        .name("twibd-session-out".to_string())
        .spawn(move || session_output_func(writer_connection, writer_client_id, response_rx));
    if let Err(e) = writer {
        warn!("failed to spawn session writer: {}", e);
        twibd.remove_client(client.client_id());
        return;
    }

    let reader = thread::Builder::new()
        .name("twibd-session-in".to_string())
        .spawn(move || session_input_func(twibd, client, connection));
    if let Err(e) = reader {
        warn!("failed to spawn session reader: {}", e);
    }
}

/// 读线程：字节流 → 帧 → 请求
fn session_input_func<S>(
    twibd: Arc<Twibd>,
    client: Arc<SocketClient>,
    connection: Arc<MessageConnection<S>>,
) where
    S: ByteStream,
{
    loop {
        if let Err(e) = connection.pump_input() {
            debug!("client {:08x} input closed: {}", client.client_id(), e);
            break;
        }

        let delivered = connection.process(|header, payload, object_ids| {
            let mut request = Request::new(
                Some(client.clone() as Arc<dyn Client>),
                header.device_id,
                header.object_id,
                header.command_or_result,
                header.tag,
                payload.to_vec(),
            );
            request.object_ids = object_ids;
            twibd.post_request(request);
        });
        if let Err(e) = delivered {
            // 大小违规只断自己这条连接
            warn!("dropping client {:08x}: {}", client.client_id(), e);
            break;
        }
    }

    // 会话拆除：标记删除 → 关闭流 → 清空持有对象（入队关闭请求）
    // → 从客户端表移除
    client.deletion_flag.store(true, Ordering::SeqCst);
    connection.stream().close();

    let owned = std::mem::take(&mut *client.owned_objects.lock().unwrap());
    drop(owned);

    twibd.remove_client(client.client_id());
}

/// 写线程：按调度器入队的顺序把响应帧写回 socket
fn session_output_func<S>(
    connection: Arc<MessageConnection<S>>,
    client_id: u32,
    response_rx: Receiver<Response>,
) where
    S: ByteStream,
{
    for response in response_rx.iter() {
        let object_ids: Vec<u32> = response.objects.iter().map(|o| o.object_id).collect();
        let header = MessageHeader {
            device_id: response.device_id,
            object_id: response.object_id,
            command_or_result: response.result_code,
            tag: response.tag,
            payload_size: response.payload.len() as u64,
            object_count: object_ids.len() as u64,
        };
        if let Err(e) = connection.send_message(&header, &response.payload, &object_ids) {
            debug!("client {:08x} output closed: {}", client_id, e);
            break;
        }
    }
    debug!("session writer for client {:08x} exiting", client_id);
}
