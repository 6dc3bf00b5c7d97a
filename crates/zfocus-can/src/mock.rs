//! Mock CAN 适配器（测试用，无硬件依赖）
//!
//! 两种用法：
//!
//! - 预置应答帧队列（`push_rx`），按序弹出；
//! - 注册响应器闭包（`on_send`），对每个发出的帧即时生成应答，
//!   可用来搭建完整的设备模拟器。
//!
//! 适配器可克隆：克隆体共享同一内部状态，测试侧保留一份句柄
//! 即可在被测代码持有适配器的同时检查已发送帧。

use crate::{BusFrame, CanAdapter, CanError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Box<dyn FnMut(&BusFrame) -> Vec<BusFrame> + Send>;

#[derive(Default)]
struct Inner {
    rx: VecDeque<BusFrame>,
    tx: Vec<BusFrame>,
    responders: Vec<Responder>,
}

/// 脚本化 Mock 适配器
#[derive(Clone, Default)]
pub struct MockCanAdapter {
    inner: Arc<Mutex<Inner>>,
}

impl MockCanAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一帧待接收数据
    pub fn push_rx(&self, frame: BusFrame) {
        self.inner.lock().unwrap().rx.push_back(frame);
    }

    /// 注册响应器：对每个发送帧返回零或多帧应答
    pub fn on_send<F>(&self, responder: F)
    where
        F: FnMut(&BusFrame) -> Vec<BusFrame> + Send + 'static,
    {
        self.inner.lock().unwrap().responders.push(Box::new(responder));
    }

    /// 已发送帧的数量
    pub fn sent_count(&self) -> usize {
        self.inner.lock().unwrap().tx.len()
    }

    /// 已发送帧的副本
    pub fn sent(&self) -> Vec<BusFrame> {
        self.inner.lock().unwrap().tx.clone()
    }

    /// 最后一帧发往 `id` 的数据帧
    pub fn last_sent_to(&self, id: u32) -> Option<BusFrame> {
        self.inner
            .lock()
            .unwrap()
            .tx
            .iter()
            .rev()
            .find(|f| f.id == id)
            .copied()
    }
}

impl CanAdapter for MockCanAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), CanError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tx.push(frame);
        // 响应器生成的应答直接进接收队列
        let mut replies = Vec::new();
        for responder in inner.responders.iter_mut() {
            replies.extend(responder(&frame));
        }
        inner.rx.extend(replies);
        Ok(())
    }

    fn receive(&mut self) -> Result<BusFrame, CanError> {
        self.inner
            .lock()
            .unwrap()
            .rx
            .pop_front()
            .ok_or(CanError::Timeout)
    }

    fn set_receive_timeout(&mut self, _timeout: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_produces_replies() {
        let mock = MockCanAdapter::new();
        mock.on_send(|frame| {
            if frame.id == 0x10 {
                vec![BusFrame::new(0x11, &[0xaa])]
            } else {
                vec![]
            }
        });
        let mut adapter = mock.clone();
        adapter.send(BusFrame::new(0x10, &[1])).unwrap();
        let reply = adapter.receive().unwrap();
        assert_eq!(reply.id, 0x11);
        assert_eq!(mock.sent_count(), 1);
    }

    #[test]
    fn receive_on_empty_queue_times_out() {
        let mut adapter = MockCanAdapter::new();
        assert!(matches!(adapter.receive(), Err(CanError::Timeout)));
    }
}
