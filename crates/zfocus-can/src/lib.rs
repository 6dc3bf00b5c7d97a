//! # zfocus CAN Adapter Layer
//!
//! CAN 硬件抽象层，提供统一的总线接口抽象。
//!
//! 上层（链路层、电机参数协议）只依赖 [`CanAdapter`] trait；
//! 生产环境使用 SocketCAN 后端，测试使用 `mock` feature 的脚本化后端。

use std::time::Duration;
use thiserror::Error;

pub use zfocus_protocol::BusFrame;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanAdapter;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "mock")]
pub use mock::MockCanAdapter;

/// CAN 适配层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(String),
    #[error("Read timeout")]
    Timeout,
}

/// CAN 适配器抽象
///
/// 阻塞式接口：`receive` 受 `set_receive_timeout` 设定的读超时约束，
/// 超时返回 `CanError::Timeout`，绝不会无限阻塞（总线对端可能随时
/// 失联，上层的等待必须有界）。
pub trait CanAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError>;
    fn receive(&mut self) -> Result<BusFrame, CanError>;
    fn set_receive_timeout(&mut self, _timeout: Duration) {}

    fn receive_timeout(&mut self, timeout: Duration) -> Result<BusFrame, CanError> {
        self.set_receive_timeout(timeout);
        self.receive()
    }

    fn try_receive(&mut self) -> Result<Option<BusFrame>, CanError> {
        match self.receive_timeout(Duration::ZERO) {
            Ok(frame) => Ok(Some(frame)),
            Err(CanError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 丢弃接收队列中所有积压帧，返回丢弃数量
    ///
    /// 请求/应答交换只靠 ID+时序配对，每次交换前必须清掉陈旧帧，
    /// 否则旧应答会被配到新请求上。
    fn drain(&mut self) -> Result<usize, CanError> {
        let mut n = 0;
        while self.try_receive()?.is_some() {
            n += 1;
        }
        Ok(n)
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockCanAdapter;

    #[test]
    fn drain_discards_backlog() {
        let mut adapter = MockCanAdapter::new();
        adapter.push_rx(BusFrame::new(0x100, &[1]));
        adapter.push_rx(BusFrame::new(0x101, &[2]));
        assert_eq!(adapter.drain().unwrap(), 2);
        assert!(adapter.try_receive().unwrap().is_none());
    }
}
