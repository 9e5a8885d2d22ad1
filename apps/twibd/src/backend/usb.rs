//! USB 传输后端
//!
//! 通过热插拔回调发现暴露桥接接口的设备。桥接接口有四个批量端点
//! （meta-out / data-out / meta-in / data-in）：发送是 meta 先行、
//! data 随后的两步序列，接收镜像这个顺序，最后跟一块对象 ID。
//! 只带 stdio 接口的设备仅转发它的调试输出流。
//!
//! libusb 禁止在热插拔回调里打开设备，到达的设备先入队，
//! 由事件线程出队处理。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use rusb::{Context, DeviceHandle, Direction, TransferType, UsbContext};
use tracing::{debug, error, info, trace, warn};

use twib_protocol::{
    Identification, MESSAGE_HEADER_SIZE, MessageHeader, command, device_id_for_serial, result_code,
};

use crate::daemon::Twibd;
use crate::device::{Device, PRIORITY_USB};
use crate::messages::{IDENTIFICATION_CLIENT_ID, Job, Request, Response};
use crate::object::BridgeObject;

/// 桥接/stdio 接口的厂商自定义类
const TWILI_INTERFACE_CLASS: u8 = 0xFF;
const BRIDGE_INTERFACE_SUBCLASS: u8 = 0x01;
const BRIDGE_INTERFACE_PROTOCOL: u8 = 0x00;
const STDIO_INTERFACE_SUBCLASS: u8 = 0x02;

/// 单次批量传输的大小上限，超过的传输拆块重提
const TRANSFER_CHUNK_SIZE: usize = 1024 * 1024;

/// meta-in 的轮询超时（兼做删除标志的检查周期）
const META_IN_TIMEOUT: Duration = Duration::from_millis(250);

/// stdio 流的读缓冲区大小
const STDOUT_BUFFER_SIZE: usize = 0x4000;

/// USB 后端
pub struct UsbBackend {
    shared: Arc<UsbShared>,
    // 注销随 Drop 自动发生
    _hotplug: Option<rusb::Registration<Context>>,
    event_thread: Option<thread::JoinHandle<()>>,
}

struct UsbShared {
    twibd: Arc<Twibd>,
    context: Context,
    devices: Mutex<Vec<Arc<UsbDevice>>>,
    stdout_streams: Mutex<Vec<Arc<StdoutStream>>>,
    arrivals: Mutex<VecDeque<rusb::Device<Context>>>,
    transfer_timeout: Duration,
    shutdown: AtomicBool,
}

/// 热插拔回调：到达的设备入队，离开的设备标记删除
struct HotplugMonitor {
    shared: Weak<UsbShared>,
}

impl rusb::Hotplug<Context> for HotplugMonitor {
    fn device_arrived(&mut self, device: rusb::Device<Context>) {
        trace!(
            "usb device arrived: bus {} addr {}",
            device.bus_number(),
            device.address()
        );
        if let Some(shared) = self.shared.upgrade() {
            shared.arrivals.lock().push_back(device);
        }
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let bus = device.bus_number();
        let address = device.address();
        for held in shared.devices.lock().iter() {
            if held.bus_number == bus && held.address == address {
                info!("usb device {:08x} left", held.device_id());
                held.deletion_flag.store(true, Ordering::SeqCst);
            }
        }
        for stream in shared.stdout_streams.lock().iter() {
            if stream.bus_number == bus && stream.address == address {
                stream.deletion_flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl UsbBackend {
    pub fn start(twibd: Arc<Twibd>, transfer_timeout: Duration) -> rusb::Result<Self> {
        let context = Context::new()?;
        let shared = Arc::new(UsbShared {
            twibd,
            context: context.clone(),
            devices: Mutex::new(Vec::new()),
            stdout_streams: Mutex::new(Vec::new()),
            arrivals: Mutex::new(VecDeque::new()),
            transfer_timeout,
            shutdown: AtomicBool::new(false),
        });

        // enumerate(true) 会对已插入的设备立即回调 device_arrived
        let hotplug = if rusb::has_hotplug() {
            let mut builder = rusb::HotplugBuilder::new();
            builder.enumerate(true);
            let callback: Box<dyn rusb::Hotplug<Context>> = Box::new(HotplugMonitor {
                shared: Arc::downgrade(&shared),
            });
            let registration = builder.register(&context, callback)?;
            Some(registration)
        } else {
            warn!("libusb hotplug not supported, falling back to one-shot probe");
            shared.probe();
            None
        };

        let thread_shared = shared.clone();
        let event_thread = thread::Builder::new()
            .name("twibd-usb".to_string())
            .spawn(move || event_thread_func(thread_shared))
            .map_err(|_| rusb::Error::Other)?;

        Ok(Self {
            shared,
            _hotplug: hotplug,
            event_thread: Some(event_thread),
        })
    }
}

impl Drop for UsbBackend {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for device in self.shared.devices.lock().iter() {
            device.deletion_flag.store(true, Ordering::SeqCst);
        }
        for stream in self.shared.stdout_streams.lock().iter() {
            stream.deletion_flag.store(true, Ordering::SeqCst);
        }
        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }
    }
}

fn event_thread_func(shared: Arc<UsbShared>) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        if let Err(e) = shared
            .context
            .handle_events(Some(Duration::from_millis(100)))
        {
            error!("usb event loop error: {}", e);
            break;
        }

        // 热插拔回调里不能打开设备，这里出队处理
        loop {
            let arrival = shared.arrivals.lock().pop_front();
            match arrival {
                Some(device) => UsbShared::add_device(&shared, device),
                None => break,
            }
        }

        // 发布就绪设备；拆除已标记删除的设备
        let mut devices = shared.devices.lock();
        devices.retain(|device| {
            if device.deletion_flag() {
                UsbDevice::teardown(device);
                false
            } else {
                if device.ready_flag.load(Ordering::SeqCst)
                    && !device.added_flag.load(Ordering::SeqCst)
                {
                    shared.twibd.add_device(device.clone() as Arc<dyn Device>);
                    device.added_flag.store(true, Ordering::SeqCst);
                }
                true
            }
        });
        drop(devices);

        let mut streams = shared.stdout_streams.lock();
        streams.retain(|stream| !stream.deletion_flag.load(Ordering::SeqCst));
    }
    debug!("usb backend event thread exiting");
}

/// 桥接接口匹配结果：meta-out / data-out / meta-in / data-in
struct BridgeEndpoints {
    interface_number: u8,
    endpoints: [u8; 4],
}

struct StdioEndpoint {
    interface_number: u8,
    endpoint: u8,
}

impl UsbShared {
    /// 一次性扫描（热插拔不可用时的回退路径）
    fn probe(&self) {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("failed to enumerate usb devices: {}", e);
                return;
            },
        };
        let mut arrivals = self.arrivals.lock();
        for device in devices.iter() {
            arrivals.push_back(device);
        }
    }

    /// 检查一台到达的设备，认领桥接/stdio 接口
    fn add_device(this: &Arc<Self>, device: rusb::Device<Context>) {
        let config = match device.active_config_descriptor() {
            Ok(config) => config,
            Err(_) => return,
        };

        let mut bridge: Option<BridgeEndpoints> = None;
        let mut stdio: Option<StdioEndpoint> = None;

        for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                if descriptor.class_code() != TWILI_INTERFACE_CLASS {
                    continue;
                }
                match (descriptor.sub_class_code(), descriptor.protocol_code()) {
                    (BRIDGE_INTERFACE_SUBCLASS, BRIDGE_INTERFACE_PROTOCOL) => {
                        if let Some(endpoints) = match_bridge_endpoints(&descriptor) {
                            bridge = Some(BridgeEndpoints {
                                interface_number: descriptor.interface_number(),
                                endpoints,
                            });
                        }
                    },
                    (STDIO_INTERFACE_SUBCLASS, _) => {
                        if let Some(endpoint) = match_stdio_endpoint(&descriptor) {
                            stdio = Some(StdioEndpoint {
                                interface_number: descriptor.interface_number(),
                                endpoint,
                            });
                        }
                    },
                    _ => {},
                }
            }
        }

        if bridge.is_none() && stdio.is_none() {
            return; // 不认识的设备
        }

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    "failed to open usb device at bus {} addr {}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                return;
            },
        };
        let handle = Arc::new(handle);

        if let Some(stdio) = stdio {
            if let Err(e) = prepare_interface(&handle, stdio.interface_number) {
                warn!("failed to claim stdio interface: {}", e);
            } else {
                let stream = Arc::new(StdoutStream {
                    handle: handle.clone(),
                    endpoint: stdio.endpoint,
                    bus_number: device.bus_number(),
                    address: device.address(),
                    deletion_flag: AtomicBool::new(false),
                });
                let thread_stream = stream.clone();
                let spawned = thread::Builder::new()
                    .name("twibd-usb-stdout".to_string())
                    .spawn(move || stdout_thread_func(thread_stream));
                if spawned.is_ok() {
                    info!("tracking usb stdio stream");
                    this.stdout_streams.lock().push(stream);
                }
            }
        }

        let Some(bridge) = bridge else {
            return; // 只有 stdio 的设备到此为止
        };

        if let Err(e) = prepare_interface(&handle, bridge.interface_number) {
            warn!("failed to claim bridge interface: {}", e);
            return;
        }

        let usb_device = Arc::new(UsbDevice::new(
            this.twibd.clone(),
            handle,
            &device,
            &bridge,
            this.transfer_timeout,
        ));

        let rx_device = usb_device.clone();
        let spawned = thread::Builder::new()
            .name("twibd-usb-rx".to_string())
            .spawn(move || rx_thread_func(rx_device));
        if spawned.is_err() {
            error!("failed to spawn usb rx thread");
            return;
        }

        usb_device.send_identify();
        this.devices.lock().push(usb_device);
    }
}

/// 在接口描述符里找四个批量端点并配对
///
/// 按描述符顺序：第一个 OUT 是 meta-out，第二个是 data-out；
/// IN 方向同理
fn match_bridge_endpoints(descriptor: &rusb::InterfaceDescriptor<'_>) -> Option<[u8; 4]> {
    let mut outs = Vec::new();
    let mut ins = Vec::new();
    for endpoint in descriptor.endpoint_descriptors() {
        if endpoint.transfer_type() != TransferType::Bulk {
            continue;
        }
        match endpoint.direction() {
            Direction::Out => outs.push(endpoint.address()),
            Direction::In => ins.push(endpoint.address()),
        }
    }
    if outs.len() >= 2 && ins.len() >= 2 {
        Some([outs[0], outs[1], ins[0], ins[1]])
    } else {
        None
    }
}

fn match_stdio_endpoint(descriptor: &rusb::InterfaceDescriptor<'_>) -> Option<u8> {
    descriptor
        .endpoint_descriptors()
        .find(|ep| ep.transfer_type() == TransferType::Bulk && ep.direction() == Direction::In)
        .map(|ep| ep.address())
}

/// detach 内核驱动并 claim 接口
fn prepare_interface(handle: &DeviceHandle<Context>, interface_number: u8) -> rusb::Result<()> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        if handle.kernel_driver_active(interface_number).unwrap_or(false) {
            handle.detach_kernel_driver(interface_number)?;
        }
    }
    handle.claim_interface(interface_number)
}

/// 接收侧状态机
///
/// meta-in 到齐决定 data-in 的大小，data-in 之后是对象 ID 块
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Available,
    MetaInPending,
    DataInPending,
    ObjIdsPending,
}

struct TransferState {
    rx: RxState,
    /// 出方向闸门：meta-out 提交到 data-out 完成期间为真
    busy: bool,
}

struct PendingTag {
    client_id: u32,
    tag: u32,
}

/// 一台经由 USB 桥接的设备
pub struct UsbDevice {
    twibd: Arc<Twibd>,
    job_tx: Sender<Job>,
    handle: Arc<DeviceHandle<Context>>,
    bus_number: u8,
    address: u8,
    interface_number: u8,
    endp_meta_out: u8,
    endp_data_out: u8,
    endp_meta_in: u8,
    endp_data_in: u8,
    transfer_timeout: Duration,
    state: Mutex<TransferState>,
    state_cv: Condvar,
    device_id: AtomicU32,
    device_nickname: Mutex<String>,
    identification: Mutex<Vec<u8>>,
    ready_flag: AtomicBool,
    added_flag: AtomicBool,
    deletion_flag: AtomicBool,
    pending_requests: Mutex<Vec<PendingTag>>,
}

impl UsbDevice {
    fn new(
        twibd: Arc<Twibd>,
        handle: Arc<DeviceHandle<Context>>,
        device: &rusb::Device<Context>,
        bridge: &BridgeEndpoints,
        transfer_timeout: Duration,
    ) -> Self {
        let job_tx = twibd.job_sender();
        Self {
            twibd,
            job_tx,
            handle,
            bus_number: device.bus_number(),
            address: device.address(),
            interface_number: bridge.interface_number,
            endp_meta_out: bridge.endpoints[0],
            endp_data_out: bridge.endpoints[1],
            endp_meta_in: bridge.endpoints[2],
            endp_data_in: bridge.endpoints[3],
            transfer_timeout,
            state: Mutex::new(TransferState {
                rx: RxState::Available,
                busy: false,
            }),
            state_cv: Condvar::new(),
            device_id: AtomicU32::new(0),
            device_nickname: Mutex::new(String::new()),
            identification: Mutex::new(Vec::new()),
            ready_flag: AtomicBool::new(false),
            added_flag: AtomicBool::new(false),
            deletion_flag: AtomicBool::new(false),
            pending_requests: Mutex::new(Vec::new()),
        }
    }

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

    fn set_rx_state(&self, rx: RxState) {
        self.state.lock().rx = rx;
    }

    /// 写一个完整请求：meta 先行，payload + 对象 ID 随后
    fn write_request(&self, request: &Request) -> rusb::Result<()> {
        let header = MessageHeader {
            // 设备一跳的首字段承载 client_id
            device_id: request.client_id(),
            object_id: request.object_id,
            command_or_result: request.command_id,
            tag: request.tag,
            payload_size: request.payload.len() as u64,
            object_count: request.object_ids.len() as u64,
        };

        let mut header_bytes = BytesMut::with_capacity(MESSAGE_HEADER_SIZE);
        header.encode_to(&mut header_bytes);
        self.write_all_bulk(self.endp_meta_out, &header_bytes)?;

        // data 阶段：payload 紧跟对象 ID 块；两者都为空时跳过
        let mut data = Vec::with_capacity(request.payload.len() + request.object_ids.len() * 4);
        data.extend_from_slice(&request.payload);
        for id in &request.object_ids {
            data.extend_from_slice(&id.to_le_bytes());
        }
        if !data.is_empty() {
            self.write_all_bulk(self.endp_data_out, &data)?;
        }
        Ok(())
    }

    /// 批量写直到全部送出，超过块上限自动拆分
    fn write_all_bulk(&self, endpoint: u8, data: &[u8]) -> rusb::Result<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + TRANSFER_CHUNK_SIZE).min(data.len());
            let written =
                self.handle
                    .write_bulk(endpoint, &data[offset..end], self.transfer_timeout)?;
            if written == 0 {
                return Err(rusb::Error::Io);
            }
            offset += written;
        }
        Ok(())
    }

    /// 批量读直到填满缓冲区
    fn read_exact_bulk(&self, endpoint: u8, buffer: &mut [u8]) -> rusb::Result<()> {
        let mut offset = 0usize;
        while offset < buffer.len() {
            let end = (offset + TRANSFER_CHUNK_SIZE).min(buffer.len());
            let read =
                self.handle
                    .read_bulk(endpoint, &mut buffer[offset..end], self.transfer_timeout)?;
            if read == 0 {
                return Err(rusb::Error::Io);
            }
            offset += read;
        }
        Ok(())
    }

    /// 一帧接收完成，铸对象、完结挂起条目并投递响应
    fn dispatch_response(&self, header: MessageHeader, payload: Vec<u8>, object_ids: Vec<u32>) {
        let client_id = header.device_id;

        self.pending_requests
            .lock()
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
            payload,
            objects,
        });
    }

    fn identified(&self, result: u32, payload: &[u8]) {
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

        *self.device_nickname.lock() = ident.device_nickname;
        *self.identification.lock() = payload.to_vec();
        self.device_id.store(device_id, Ordering::SeqCst);
        self.ready_flag.store(true, Ordering::SeqCst);
    }

    /// 事件线程在删除标志置位后调用：撤销注册表条目、完结挂起请求、
    /// 释放接口
    fn teardown(this: &Arc<Self>) {
        if this.added_flag.load(Ordering::SeqCst) {
            let device: Arc<dyn Device> = this.clone();
            this.twibd.remove_device(&device);
        }

        let pending = std::mem::take(&mut *this.pending_requests.lock());
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

        let _ = this.handle.release_interface(this.interface_number);
        // 等待中的发送方醒来后看到删除标志
        this.state_cv.notify_all();
        debug!("final rx state: {:?}", this.state.lock().rx);
        info!("detached usb device {:08x}", this.device_id());
    }
}

impl Device for UsbDevice {
    fn device_id(&self) -> u32 {
        self.device_id.load(Ordering::SeqCst)
    }

    fn bridge_type(&self) -> &'static str {
        "usb"
    }

    fn priority(&self) -> i32 {
        PRIORITY_USB
    }

    fn device_nickname(&self) -> String {
        self.device_nickname.lock().clone()
    }

    fn identification(&self) -> Vec<u8> {
        self.identification.lock().clone()
    }

    fn deletion_flag(&self) -> bool {
        self.deletion_flag.load(Ordering::SeqCst)
    }

    fn send_request(&self, request: Request) {
        // 出方向闸门：上一个请求的 meta+data 序列完成之前等待
        {
            let mut state = self.state.lock();
            while state.busy {
                if self.deletion_flag() {
                    return;
                }
                self.state_cv.wait(&mut state);
            }
            state.busy = true;
        }

        self.pending_requests.lock().push(PendingTag {
            client_id: request.client_id(),
            tag: request.tag,
        });

        let result = self.write_request(&request);

        self.state.lock().busy = false;
        self.state_cv.notify_one();

        if let Err(e) = result {
            // 超时之外的传输失败都视为设备失联
            warn!("usb transfer error: {}", e);
            self.deletion_flag.store(true, Ordering::SeqCst);
        }
    }
}

/// 接收线程：meta-in → data-in → 对象 ID 块 → 投递
fn rx_thread_func(device: Arc<UsbDevice>) {
    debug!("usb rx thread started");
    loop {
        if device.deletion_flag() {
            break;
        }

        device.set_rx_state(RxState::MetaInPending);
        let mut header_buf = [0u8; MESSAGE_HEADER_SIZE];
        let read = match device
            .handle
            .read_bulk(device.endp_meta_in, &mut header_buf, META_IN_TIMEOUT)
        {
            Ok(read) => read,
            Err(rusb::Error::Timeout) => {
                device.set_rx_state(RxState::Available);
                continue;
            },
            Err(e) => {
                debug!("usb meta-in transfer failed: {}", e);
                device.deletion_flag.store(true, Ordering::SeqCst);
                break;
            },
        };
        if read < MESSAGE_HEADER_SIZE {
            warn!("short meta-in transfer: {} bytes", read);
            device.deletion_flag.store(true, Ordering::SeqCst);
            break;
        }

        let header = match MessageHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("bad meta-in header: {}", e);
                device.deletion_flag.store(true, Ordering::SeqCst);
                break;
            },
        };
        if let Err(e) = header.validate() {
            warn!("oversized frame from usb device: {}", e);
            device.deletion_flag.store(true, Ordering::SeqCst);
            break;
        }

        device.set_rx_state(RxState::DataInPending);
        let mut payload = vec![0u8; header.payload_size as usize];
        if !payload.is_empty()
            && let Err(e) = device.read_exact_bulk(device.endp_data_in, &mut payload)
        {
            warn!("usb data-in transfer failed: {}", e);
            device.deletion_flag.store(true, Ordering::SeqCst);
            break;
        }

        device.set_rx_state(RxState::ObjIdsPending);
        let mut object_ids = Vec::with_capacity(header.object_count as usize);
        if header.object_count > 0 {
            let mut raw = vec![0u8; header.object_count as usize * 4];
            if let Err(e) = device.read_exact_bulk(device.endp_data_in, &mut raw) {
                warn!("usb object-id transfer failed: {}", e);
                device.deletion_flag.store(true, Ordering::SeqCst);
                break;
            }
            for chunk in raw.chunks_exact(4) {
                object_ids.push(u32::from_le_bytes(chunk.try_into().unwrap()));
            }
        }

        device.dispatch_response(header, payload, object_ids);
        device.set_rx_state(RxState::Available);
    }
    debug!("usb rx thread exiting");
}

/// stdio 流：行分割后转发到日志
struct StdoutStream {
    handle: Arc<DeviceHandle<Context>>,
    endpoint: u8,
    bus_number: u8,
    address: u8,
    deletion_flag: AtomicBool,
}

fn stdout_thread_func(stream: Arc<StdoutStream>) {
    let mut line_buffer: Vec<u8> = Vec::new();
    loop {
        if stream.deletion_flag.load(Ordering::SeqCst) {
            break;
        }

        let mut buf = [0u8; STDOUT_BUFFER_SIZE];
        match stream
            .handle
            .read_bulk(stream.endpoint, &mut buf, META_IN_TIMEOUT)
        {
            Ok(read) => {
                line_buffer.extend_from_slice(&buf[..read]);
                while let Some(newline) = line_buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = line_buffer.drain(..=newline).collect();
                    let text = String::from_utf8_lossy(&line[..line.len() - 1]);
                    info!(target: "twibd::device_stdout", "{}", text.trim_end_matches('\r'));
                }
            },
            Err(rusb::Error::Timeout) => continue,
            Err(e) => {
                debug!("usb stdout transfer failed: {}", e);
                stream.deletion_flag.store(true, Ordering::SeqCst);
                break;
            },
        }
    }
    debug!("usb stdout thread exiting");
}
