//! 限时应答等待
//!
//! 所有请求/应答交换共用的轮询循环：非阻塞收帧 -> 判定 -> 到期放弃。
//! 判定闭包返回 `None` 表示帧与本次交换无关（丢弃继续等），
//! `Some(Ok)` 表示拿到结果，`Some(Err)` 表示对端明确报错（立即上抛）。

use crate::error::DriverError;
use std::time::{Duration, Instant};
use zfocus_can::{BusFrame, CanAdapter};

pub(crate) fn await_reply<A, F, T>(
    bus: &mut A,
    timeout: Duration,
    interval: Duration,
    mut judge: F,
) -> Result<Option<T>, DriverError>
where
    A: CanAdapter,
    F: FnMut(&BusFrame) -> Option<Result<T, DriverError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        while let Some(frame) = bus.try_receive()? {
            if let Some(verdict) = judge(&frame) {
                return verdict.map(Some);
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        spin_sleep::sleep(interval);
    }
}
