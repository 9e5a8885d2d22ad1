//! 调度器端到端测试
//!
//! 用 mock 设备和 mock 客户端驱动调度循环，逐个作业推进，
//! 验证路由、对象生命周期和跨传输优先级。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use twib_protocol::{DeviceListEntry, command, meta_command, result_code};
use twibd::client::Client;
use twibd::daemon::Twibd;
use twibd::device::{Device, PRIORITY_TCP, PRIORITY_USB};
use twibd::messages::{Request, Response};
use twibd::object::BridgeObject;

/// 记录收到的请求；可选地立即回一个带对象的响应
struct MockDevice {
    device_id: u32,
    bridge_type: &'static str,
    priority: i32,
    deletion_flag: AtomicBool,
    requests: Mutex<Vec<RecordedRequest>>,
    /// (result_code, payload, 新铸对象的 object_id 列表)
    auto_response: Mutex<Option<(u32, Vec<u8>, Vec<u32>)>>,
    twibd: Mutex<Option<Arc<Twibd>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordedRequest {
    client_id: u32,
    object_id: u32,
    command_id: u32,
    tag: u32,
}

impl MockDevice {
    fn new(device_id: u32, bridge_type: &'static str, priority: i32) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            bridge_type,
            priority,
            deletion_flag: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            auto_response: Mutex::new(None),
            twibd: Mutex::new(None),
        })
    }

    fn attach(&self, twibd: &Arc<Twibd>) {
        *self.twibd.lock().unwrap() = Some(twibd.clone());
    }

    fn set_auto_response(&self, result: u32, payload: Vec<u8>, object_ids: Vec<u32>) {
        *self.auto_response.lock().unwrap() = Some((result, payload, object_ids));
    }

    fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Device for MockDevice {
    fn device_id(&self) -> u32 {
        self.device_id
    }
    fn bridge_type(&self) -> &'static str {
        self.bridge_type
    }
    fn priority(&self) -> i32 {
        self.priority
    }
    fn device_nickname(&self) -> String {
        "mock".to_string()
    }
    fn identification(&self) -> Vec<u8> {
        Vec::new()
    }
    fn deletion_flag(&self) -> bool {
        self.deletion_flag.load(Ordering::SeqCst)
    }

    fn send_request(&self, request: Request) {
        self.requests.lock().unwrap().push(RecordedRequest {
            client_id: request.client_id(),
            object_id: request.object_id,
            command_id: request.command_id,
            tag: request.tag,
        });

        if let Some((result, payload, object_ids)) = self.auto_response.lock().unwrap().clone() {
            let twibd = self.twibd.lock().unwrap().clone().expect("device not attached");
            let objects = object_ids
                .iter()
                .map(|&id| Arc::new(BridgeObject::new(twibd.job_sender(), self.device_id, id)))
                .collect();
            twibd.post_response(Response {
                client_id: request.client_id(),
                device_id: self.device_id,
                object_id: request.object_id,
                result_code: result,
                tag: request.tag,
                payload,
                objects,
            });
        }
    }
}

/// 记录响应；owned_objects 语义与前端客户端一致
struct MockClient {
    client_id: u32,
    deletion_flag: AtomicBool,
    responses: Mutex<Vec<RecordedResponse>>,
    owned_objects: Mutex<Vec<Arc<BridgeObject>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordedResponse {
    result_code: u32,
    tag: u32,
    payload: Vec<u8>,
    object_ids: Vec<u32>,
}

impl MockClient {
    fn register(twibd: &Arc<Twibd>) -> Arc<Self> {
        twibd.register_client(|client_id| Self {
            client_id,
            deletion_flag: AtomicBool::new(false),
            responses: Mutex::new(Vec::new()),
            owned_objects: Mutex::new(Vec::new()),
        })
    }

    fn responses(&self) -> Vec<RecordedResponse> {
        self.responses.lock().unwrap().clone()
    }

    /// 模拟前端会话拆除：清空持有对象，再从客户端表移除
    fn close(&self, twibd: &Arc<Twibd>) {
        self.deletion_flag.store(true, Ordering::SeqCst);
        let owned = std::mem::take(&mut *self.owned_objects.lock().unwrap());
        drop(owned);
        twibd.remove_client(self.client_id);
    }
}

impl Client for MockClient {
    fn client_id(&self) -> u32 {
        self.client_id
    }

    fn post_response(&self, response: Response) {
        self.responses.lock().unwrap().push(RecordedResponse {
            result_code: response.result_code,
            tag: response.tag,
            payload: response.payload.clone(),
            object_ids: response.objects.iter().map(|o| o.object_id).collect(),
        });
    }

    fn deletion_flag(&self) -> bool {
        self.deletion_flag.load(Ordering::SeqCst)
    }

    fn adopt_objects(&self, objects: &[Arc<BridgeObject>]) {
        let mut owned = self.owned_objects.lock().unwrap();
        for object in objects {
            if !owned.iter().any(|o| Arc::ptr_eq(o, object)) {
                owned.push(object.clone());
            }
        }
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

fn meta_request(client: &Arc<MockClient>, command_id: u32, tag: u32, payload: Vec<u8>) -> Request {
    Request::new(
        Some(client.clone() as Arc<dyn Client>),
        0,
        0,
        command_id,
        tag,
        payload,
    )
}

#[test]
fn test_list_devices_empty() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    twibd.post_request(meta_request(&client, meta_command::LIST_DEVICES, 1, Vec::new()));
    twibd.process_one(); // 请求 → meta 对象
    twibd.process_one(); // 响应 → 客户端

    let responses = client.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].result_code, result_code::RESULT_OK);
    assert_eq!(responses[0].tag, 1);

    let entries: Vec<DeviceListEntry> = rmp_serde::from_slice(&responses[0].payload).unwrap();
    assert!(entries.is_empty());
}

#[test]
fn test_list_devices_reports_registered_device() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    let device = MockDevice::new(0x1234, "tcp", PRIORITY_TCP);
    device.attach(&twibd);
    twibd.add_device(device.clone() as Arc<dyn Device>);
    twibd.process_one(); // 注册触发的对象重置请求

    twibd.post_request(meta_request(&client, meta_command::LIST_DEVICES, 2, Vec::new()));
    twibd.process_one();
    twibd.process_one();

    let responses = client.responses();
    let entries: Vec<DeviceListEntry> = rmp_serde::from_slice(&responses[0].payload).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].device_id, 0x1234);
    assert_eq!(entries[0].bridge_type, "tcp");

    // 注册时的重置请求应当已经到达设备：object 0 的 CLOSE_OBJECT
    let recorded = device.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].object_id, 0);
    assert_eq!(recorded[0].command_id, command::CLOSE_OBJECT);
}

#[test]
fn test_meta_unknown_command() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    twibd.post_request(meta_request(&client, 0x7777, 3, Vec::new()));
    twibd.process_one();
    twibd.process_one();

    assert_eq!(
        client.responses()[0].result_code,
        result_code::UNRECOGNIZED_FUNCTION
    );
}

#[test]
fn test_meta_unknown_object() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    let mut request = meta_request(&client, meta_command::LIST_DEVICES, 4, Vec::new());
    request.object_id = 9;
    twibd.post_request(request);
    twibd.process_one();
    twibd.process_one();

    assert_eq!(
        client.responses()[0].result_code,
        result_code::UNRECOGNIZED_OBJECT
    );
}

#[test]
fn test_connect_tcp_bad_payload() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    twibd.post_request(meta_request(
        &client,
        meta_command::CONNECT_TCP,
        5,
        vec![1, 2, 3], // 连长度字段都不完整
    ));
    twibd.process_one();
    twibd.process_one();

    assert_eq!(client.responses()[0].result_code, result_code::BAD_REQUEST);
}

#[test]
fn test_connect_tcp_reaches_connector() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    let seen = Arc::new(Mutex::new(None));
    let connector_seen = seen.clone();
    twibd.set_tcp_connector(Box::new(move |hostname, port| {
        *connector_seen.lock().unwrap() = Some((hostname.to_string(), port.to_string()));
        "Ok".to_string()
    }));

    let mut payload = Vec::new();
    payload.extend_from_slice(&4u64.to_le_bytes());
    payload.extend_from_slice(&5u64.to_le_bytes());
    payload.extend_from_slice(b"host");
    payload.extend_from_slice(b"15152");

    twibd.post_request(meta_request(&client, meta_command::CONNECT_TCP, 6, payload));
    twibd.process_one();
    twibd.process_one();

    assert_eq!(
        seen.lock().unwrap().clone(),
        Some(("host".to_string(), "15152".to_string()))
    );
    let responses = client.responses();
    assert_eq!(responses[0].result_code, result_code::RESULT_OK);
    assert_eq!(responses[0].payload, b"Ok");
}

#[test]
fn test_unknown_device() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    twibd.post_request(Request::new(
        Some(client.clone() as Arc<dyn Client>),
        0x9999,
        0,
        1,
        0xAB,
        Vec::new(),
    ));
    twibd.process_one();
    twibd.process_one();

    let responses = client.responses();
    assert_eq!(responses[0].result_code, result_code::UNRECOGNIZED_DEVICE);
    assert_eq!(responses[0].tag, 0xAB);
}

#[test]
fn test_tag_routing_two_clients() {
    let twibd = Twibd::new();
    let client_a = MockClient::register(&twibd);
    let client_b = MockClient::register(&twibd);

    let device = MockDevice::new(0x10, "tcp", PRIORITY_TCP);
    device.attach(&twibd);
    device.set_auto_response(result_code::RESULT_OK, b"pong".to_vec(), Vec::new());
    twibd.add_device(device.clone() as Arc<dyn Device>);
    twibd.process_pending(); // 重置请求 + 它的自动响应

    for (client, tag) in [(&client_a, 0x100u32), (&client_b, 0x100), (&client_a, 0x200)] {
        twibd.post_request(Request::new(
            Some(client.clone() as Arc<dyn Client>),
            0x10,
            0,
            7,
            tag,
            Vec::new(),
        ));
    }
    twibd.process_pending();

    // 每个请求恰好一个响应，且送达发起它的客户端
    let tags_a: Vec<u32> = client_a.responses().iter().map(|r| r.tag).collect();
    let tags_b: Vec<u32> = client_b.responses().iter().map(|r| r.tag).collect();
    assert_eq!(tags_a, vec![0x100, 0x200]);
    assert_eq!(tags_b, vec![0x100]);
}

#[test]
fn test_ordered_delivery() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    let device = MockDevice::new(0x10, "tcp", PRIORITY_TCP);
    device.attach(&twibd);
    device.set_auto_response(result_code::RESULT_OK, Vec::new(), Vec::new());
    twibd.add_device(device.clone() as Arc<dyn Device>);
    twibd.process_pending();

    for tag in 1..=8u32 {
        twibd.post_request(Request::new(
            Some(client.clone() as Arc<dyn Client>),
            0x10,
            0,
            7,
            tag,
            Vec::new(),
        ));
    }
    twibd.process_pending();

    let tags: Vec<u32> = client.responses().iter().map(|r| r.tag).collect();
    assert_eq!(tags, (1..=8).collect::<Vec<u32>>());
}

#[test]
fn test_cross_transport_priority() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    let usb = MockDevice::new(0x42, "usb", PRIORITY_USB);
    usb.attach(&twibd);
    let tcp = MockDevice::new(0x42, "tcp", PRIORITY_TCP);
    tcp.attach(&twibd);

    twibd.add_device(usb.clone() as Arc<dyn Device>);
    twibd.add_device(tcp.clone() as Arc<dyn Device>);
    twibd.process_pending();

    // 注册表里仍是 USB 实例
    let found = twibd.registry().lookup(0x42).unwrap();
    assert_eq!(found.bridge_type(), "usb");

    // 新请求走 USB
    twibd.post_request(Request::new(
        Some(client.clone() as Arc<dyn Client>),
        0x42,
        0,
        7,
        0x77,
        Vec::new(),
    ));
    twibd.process_one();

    assert!(usb.recorded().iter().any(|r| r.tag == 0x77));
    assert!(!tcp.recorded().iter().any(|r| r.tag == 0x77));
}

#[test]
fn test_object_close_on_client_drop() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    let device = MockDevice::new(0x10, "tcp", PRIORITY_TCP);
    device.attach(&twibd);
    device.set_auto_response(result_code::RESULT_OK, Vec::new(), vec![7]);
    twibd.add_device(device.clone() as Arc<dyn Device>);
    twibd.process_pending();

    twibd.post_request(Request::new(
        Some(client.clone() as Arc<dyn Client>),
        0x10,
        0,
        7,
        0x55,
        Vec::new(),
    ));
    twibd.process_one(); // 请求 → 设备（自动回带对象 7 的响应）
    twibd.process_one(); // 响应 → 客户端（领养对象 7）

    assert_eq!(client.responses()[0].object_ids, vec![7]);

    // 关闭客户端：关闭请求先入队，然后才移除客户端
    client.close(&twibd);
    twibd.process_one();

    let recorded = device.recorded();
    let close = recorded.last().unwrap();
    assert_eq!(close.command_id, command::CLOSE_OBJECT);
    assert_eq!(close.object_id, 7);
}

#[test]
fn test_explicit_close_disowns_before_forwarding() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    let device = MockDevice::new(0x10, "tcp", PRIORITY_TCP);
    device.attach(&twibd);
    device.set_auto_response(result_code::RESULT_OK, Vec::new(), vec![7]);
    twibd.add_device(device.clone() as Arc<dyn Device>);
    twibd.process_pending();

    twibd.post_request(Request::new(
        Some(client.clone() as Arc<dyn Client>),
        0x10,
        0,
        7,
        0x55,
        Vec::new(),
    ));
    twibd.process_one();
    twibd.process_one();

    // 客户端自己发关闭请求（此后设备不再铸新对象）
    device.set_auto_response(result_code::RESULT_OK, Vec::new(), Vec::new());
    twibd.post_request(Request::new(
        Some(client.clone() as Arc<dyn Client>),
        0x10,
        7,
        command::CLOSE_OBJECT,
        0x56,
        Vec::new(),
    ));
    twibd.process_one();

    let close_count = device
        .recorded()
        .iter()
        .filter(|r| r.command_id == command::CLOSE_OBJECT && r.object_id == 7)
        .count();
    assert_eq!(close_count, 1);

    // 客户端拆除时不应当再为对象 7 发第二个关闭请求
    client.close(&twibd);
    twibd.process_pending();
    let close_count = device
        .recorded()
        .iter()
        .filter(|r| r.command_id == command::CLOSE_OBJECT && r.object_id == 7)
        .count();
    assert_eq!(close_count, 1);
}

#[test]
fn test_response_for_gone_client_closes_objects() {
    let twibd = Twibd::new();
    let client = MockClient::register(&twibd);

    let device = MockDevice::new(0x10, "tcp", PRIORITY_TCP);
    device.attach(&twibd);
    device.set_auto_response(result_code::RESULT_OK, Vec::new(), vec![9]);
    twibd.add_device(device.clone() as Arc<dyn Device>);
    twibd.process_pending();

    twibd.post_request(Request::new(
        Some(client.clone() as Arc<dyn Client>),
        0x10,
        0,
        7,
        0x55,
        Vec::new(),
    ));
    twibd.process_one(); // 请求 → 设备，自动响应入队

    // 响应还没送达，客户端先没了
    client.close(&twibd);
    twibd.process_one(); // 响应被丢弃，随之丢弃的对象引用发出关闭请求
    twibd.process_one(); // 处理对象 9 的关闭请求

    assert!(client.responses().is_empty());
    let recorded = device.recorded();
    let close = recorded.last().unwrap();
    assert_eq!(close.command_id, command::CLOSE_OBJECT);
    assert_eq!(close.object_id, 9);
}

#[test]
fn test_device_removal_leaves_no_registry_entry() {
    let twibd = Twibd::new();

    let device = MockDevice::new(0x42, "tcp", PRIORITY_TCP);
    device.attach(&twibd);
    twibd.add_device(device.clone() as Arc<dyn Device>);
    twibd.process_pending();

    let erased: Arc<dyn Device> = device.clone();
    twibd.remove_device(&erased);
    assert!(twibd.registry().lookup(0x42).is_none());

    // 后端放掉强引用后对象应当真正消亡
    let weak = Arc::downgrade(&device);
    drop(device);
    drop(erased);
    assert!(weak.upgrade().is_none());
}
