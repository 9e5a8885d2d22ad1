//! 帧化消息连接
//!
//! 把一个字节流端点包装成桥接协议的消息连接：入方向缓冲区攒字节、
//! 凑满整帧才交付；出方向缓冲区在小互斥锁下支持多生产者追加，
//! 由单个事件线程（或会话写线程）负责排空。
//!
//! 解析是严格的：消息头超出大小限制时连接被标记删除，由持有者在
//! 下一次事件循环中拆除。

use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

use twib_protocol::{MESSAGE_HEADER_SIZE, MessageHeader, ProtocolError};

/// 单次 pump_input 的读取块大小
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// 传输层错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
}

/// 可以按 `&self` 读写的字节流端点
///
/// `TcpStream` 和 `UnixStream` 都允许通过共享引用做 IO，这让同一条
/// 连接可以同时被读线程和写线程持有，而不需要克隆底层 fd
pub trait ByteStream: Send + Sync {
    fn read_some(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_some(&self, buf: &[u8]) -> io::Result<usize>;

    /// 双向关闭底层流，让对端和本端阻塞中的 IO 尽快返回
    fn close(&self) {}
}

impl ByteStream for std::net::TcpStream {
    fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }

    fn write_some(&self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn close(&self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(unix)]
impl ByteStream for std::os::unix::net::UnixStream {
    fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }

    fn write_some(&self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn close(&self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

/// 帧化消息连接
///
/// 入缓冲区只被单个线程排空，互斥锁上没有竞争；出缓冲区的锁保护
/// 多生产者的帧追加不会交错
pub struct MessageConnection<S> {
    stream: S,
    in_buffer: Mutex<BytesMut>,
    out_buffer: Mutex<BytesMut>,
    deletion_flag: AtomicBool,
}

impl<S: ByteStream> MessageConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            in_buffer: Mutex::new(BytesMut::with_capacity(8 * 1024)),
            out_buffer: Mutex::new(BytesMut::with_capacity(8 * 1024)),
            deletion_flag: AtomicBool::new(false),
        }
    }

    /// 借用底层流（用于 shutdown、as_fd 等）
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// 从流读入一块数据到入缓冲区
    ///
    /// # 返回
    /// - `Ok(n)` - 读入 n 字节；非阻塞流没有数据时 n 为 0
    /// - `Err(ConnectionClosed)` - 对端关闭
    ///
    /// 阻塞流上每次调用最多读一块，调用方在交付帧之后再回来；
    /// 非阻塞流由 poll 循环驱动，WouldBlock 不算错误
    pub fn pump_input(&self) -> Result<usize, TransportError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.stream.read_some(&mut chunk) {
                Ok(0) => {
                    self.mark_for_deletion();
                    return Err(TransportError::ConnectionClosed);
                },
                Ok(n) => {
                    self.in_buffer.lock().unwrap().extend_from_slice(&chunk[..n]);
                    return Ok(n);
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_for_deletion();
                    return Err(e.into());
                },
            }
        }
    }

    /// 把出缓冲区尽量写入流
    ///
    /// # 返回
    /// 实际写出的字节数；非阻塞流写满内核缓冲区时提前返回
    pub fn pump_output(&self) -> Result<usize, TransportError> {
        let mut out = self.out_buffer.lock().unwrap();
        let mut written = 0usize;
        while !out.is_empty() {
            match self.stream.write_some(&out) {
                Ok(0) => {
                    self.mark_for_deletion();
                    return Err(TransportError::ConnectionClosed);
                },
                Ok(n) => {
                    out.advance(n);
                    written += n;
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_for_deletion();
                    return Err(e.into());
                },
            }
        }
        Ok(written)
    }

    /// 追加一帧到出缓冲区并尝试顺带排空
    ///
    /// `header.payload_size` 和 `header.object_count` 必须与实参一致，
    /// 由调用方保证
    pub fn send_message(
        &self,
        header: &MessageHeader,
        payload: &[u8],
        object_ids: &[u32],
    ) -> Result<(), TransportError> {
        debug_assert_eq!(header.payload_size as usize, payload.len());
        debug_assert_eq!(header.object_count as usize, object_ids.len());

        {
            let mut out = self.out_buffer.lock().unwrap();
            out.reserve(header.frame_size());
            header.encode_to(&mut out);
            out.extend_from_slice(payload);
            for id in object_ids {
                out.extend_from_slice(&id.to_le_bytes());
            }
        }

        self.pump_output()?;
        Ok(())
    }

    /// 出缓冲区是否还有待写数据（事件循环据此决定是否关注可写）
    pub fn has_output(&self) -> bool {
        !self.out_buffer.lock().unwrap().is_empty()
    }

    /// 从入缓冲区解析出所有完整帧并交付
    ///
    /// 不完整的帧留在缓冲区等待下一轮；大小违规把连接标记删除并
    /// 返回错误
    pub fn process(
        &self,
        mut sink: impl FnMut(MessageHeader, Bytes, Vec<u32>),
    ) -> Result<usize, TransportError> {
        let mut delivered = 0usize;
        let mut input = self.in_buffer.lock().unwrap();

        loop {
            if input.len() < MESSAGE_HEADER_SIZE {
                break;
            }

            let header = MessageHeader::decode(&input)?;
            if let Err(e) = header.validate() {
                self.mark_for_deletion();
                return Err(e.into());
            }

            if input.len() < header.frame_size() {
                break; // 整帧还没到齐
            }

            input.advance(MESSAGE_HEADER_SIZE);
            let payload = input.split_to(header.payload_size as usize).freeze();
            let mut object_ids = Vec::with_capacity(header.object_count as usize);
            for _ in 0..header.object_count {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&input[..4]);
                input.advance(4);
                object_ids.push(u32::from_le_bytes(raw));
            }

            trace!(
                tag = format_args!("{:08x}", header.tag),
                payload_size = header.payload_size,
                object_count = header.object_count,
                "frame delivered"
            );
            sink(header, payload, object_ids);
            delivered += 1;
        }

        Ok(delivered)
    }

    pub fn mark_for_deletion(&self) {
        self.deletion_flag.store(true, Ordering::SeqCst);
    }

    pub fn marked_for_deletion(&self) -> bool {
        self.deletion_flag.load(Ordering::SeqCst)
    }
}
