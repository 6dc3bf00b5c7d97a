//! SocketCAN CAN 适配器实现
//!
//! 基于 Linux SocketCAN 子系统（`socketcan` crate 3.5）。
//!
//! ## 限制
//!
//! - **仅限 Linux 平台**：SocketCAN 是 Linux 内核特性
//! - **接口配置**：波特率等由系统工具（`ip link`）完成，不在应用层设置
//! - 只收发 CAN 2.0 标准帧；错误帧被过滤并记入日志

use crate::{BusFrame, CanAdapter, CanError};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, StandardId};
use std::time::Duration;
use tracing::{trace, warn};

/// SocketCAN 适配器
///
/// # 示例
///
/// ```no_run
/// use zfocus_can::{CanAdapter, SocketCanAdapter};
/// use zfocus_can::BusFrame;
///
/// let mut adapter = SocketCanAdapter::new("can0").unwrap();
/// adapter.send(BusFrame::new(0x123, &[1, 2, 3, 4])).unwrap();
/// let reply = adapter.receive().unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    socket: CanSocket,
    /// 接口名称（如 "can0"）
    interface: String,
    /// 当前读超时
    read_timeout: Duration,
}

impl SocketCanAdapter {
    /// 打开 CAN 接口
    ///
    /// # 错误
    /// - `CanError::Device`: 接口不存在或无法打开
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();
        let socket = CanSocket::open(&interface).map_err(|e| {
            CanError::Device(format!("Failed to open CAN interface '{interface}': {e}"))
        })?;

        // 默认读超时 10ms：与上层轮询间隔同量级，保证等待有界
        let read_timeout = Duration::from_millis(10);
        socket.set_read_timeout(read_timeout).map_err(CanError::Io)?;

        trace!("SocketCAN interface '{}' opened", interface);
        Ok(Self {
            socket,
            interface,
            read_timeout,
        })
    }

    /// 获取接口名称
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

fn to_can_frame(frame: &BusFrame) -> Result<CanFrame, CanError> {
    let id = StandardId::new(frame.id as u16)
        .ok_or_else(|| CanError::Device(format!("CAN ID 0x{:x} exceeds 11 bits", frame.id)))?;
    let can_frame = if frame.rtr {
        CanFrame::new_remote(id, 0)
    } else {
        CanFrame::new(id, frame.data_slice())
    };
    can_frame.ok_or_else(|| CanError::Device("cannot build CAN frame".into()))
}

fn from_can_frame(frame: &CanFrame) -> BusFrame {
    let mut out = if frame.is_remote_frame() {
        BusFrame::rtr(frame.raw_id())
    } else {
        BusFrame::new(frame.raw_id(), frame.data())
    };
    // SocketCAN 不经 SO_TIMESTAMPING 时没有硬件时间戳
    out.timestamp_us = 0;
    out
}

impl CanAdapter for SocketCanAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        let can_frame = to_can_frame(&frame)?;
        self.socket.write_frame(&can_frame).map_err(CanError::Io)?;
        Ok(())
    }

    fn receive(&mut self) -> Result<BusFrame, CanError> {
        loop {
            match self.socket.read_frame() {
                Ok(frame) => {
                    if frame.is_error_frame() {
                        warn!("error frame on '{}' (id 0x{:x})", self.interface, frame.raw_id());
                        continue;
                    }
                    return Ok(from_can_frame(&frame));
                },
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(CanError::Timeout);
                },
                Err(e) => return Err(CanError::Io(e)),
            }
        }
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if timeout == self.read_timeout {
            return;
        }
        // 零超时会被内核解释为"无超时"，用 1ms 下界代替
        let effective = timeout.max(Duration::from_millis(1));
        if let Err(e) = self.socket.set_read_timeout(effective) {
            warn!("cannot set read timeout on '{}': {}", self.interface, e);
            return;
        }
        self.read_timeout = timeout;
    }
}
