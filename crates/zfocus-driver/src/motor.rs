//! 电机驱动器通道：控制字交换与参数读写
//!
//! 与链路层同一套交换纪律（drain -> send -> 限时配对应答）。
//! 控制通道的可恢复告警在这里就地处理：补发带 CLEAR_ERROR 位的
//! 同一条控制命令，再把告警上抛由调用方决定是否重试。

use crate::config::TimingConfig;
use crate::error::DriverError;
use crate::wait::await_reply;
use std::time::Duration;
use tracing::{trace, warn};
use zfocus_can::CanAdapter;
use zfocus_protocol::motor::{
    classify_reply, control_frame, param_id, parse_param_reply, po_id, read_param_frame,
    write_param_frame, ControlWord, DriveReply, ParamReply, StatusWord,
};
use zfocus_protocol::ProtocolError;

/// 单台驱动器的通信通道
#[derive(Debug, Clone)]
pub struct MotorChannel {
    /// 控制通道：主->从 / 从->主
    po: u32,
    pi: u32,
    /// 参数通道：主->从 / 从->主
    param_po: u32,
    param_pi: u32,
    poll_interval: Duration,
    answer_timeout: Duration,
}

impl MotorChannel {
    pub fn new(addr: u8, timing: &TimingConfig) -> Result<Self, ProtocolError> {
        let po = po_id(addr)?;
        let param_po = param_id(addr)?;
        Ok(Self {
            po,
            pi: po + 1,
            param_po,
            param_pi: param_po + 1,
            poll_interval: timing.poll_interval(),
            answer_timeout: timing.motor_timeout(),
        })
    }

    /// 控制字交换：发送控制帧，等待状态应答
    ///
    /// 告警应答（mailfunction + ready）补发一次 CLEAR_ERROR 后上抛
    /// `Warning`；硬故障直接上抛 `Malfunction`。
    pub fn exchange_control<A: CanAdapter>(
        &self,
        bus: &mut A,
        ctrl: ControlWord,
        raw_speed: i16,
    ) -> Result<StatusWord, DriverError> {
        match self.control_once(bus, ctrl, raw_speed)? {
            DriveReply::Ok(status) => Ok(status),
            DriveReply::Malfunction(code) => Err(DriverError::Malfunction(code)),
            DriveReply::Warning(code) => {
                warn!("drive warning {code}, resending with error-clear bit");
                let _ = self.control_once(bus, ctrl | ControlWord::CLEAR_ERROR, raw_speed)?;
                Err(DriverError::Warning(code))
            },
        }
    }

    fn control_once<A: CanAdapter>(
        &self,
        bus: &mut A,
        ctrl: ControlWord,
        raw_speed: i16,
    ) -> Result<DriveReply, DriverError> {
        bus.drain()?;
        trace!("control -> 0x{:x}: ctrl={:?} speed={}", self.po, ctrl, raw_speed);
        bus.send(control_frame(self.po, ctrl, raw_speed))?;
        let pi = self.pi;
        let reply = await_reply(bus, self.answer_timeout, self.poll_interval, |frame| {
            if frame.id != pi || frame.rtr {
                return None;
            }
            match classify_reply(frame) {
                Ok(reply) => Some(Ok(reply)),
                Err(e) => {
                    warn!("bad drive status frame: {}", e);
                    None
                },
            }
        })?;
        reply.ok_or(DriverError::NoAnswer { what: "drive control channel" })
    }

    /// 读驱动器参数
    pub fn read_param<A: CanAdapter>(
        &self,
        bus: &mut A,
        subindex: u8,
        index: u16,
    ) -> Result<u32, DriverError> {
        let request = read_param_frame(self.param_po, subindex, index);
        self.param_exchange(bus, request, index, subindex)
    }

    /// 写驱动器参数；应答回显写入值
    pub fn write_param<A: CanAdapter>(
        &self,
        bus: &mut A,
        subindex: u8,
        index: u16,
        value: u32,
    ) -> Result<(), DriverError> {
        let request = write_param_frame(self.param_po, subindex, index, value);
        self.param_exchange(bus, request, index, subindex)?;
        Ok(())
    }

    fn param_exchange<A: CanAdapter>(
        &self,
        bus: &mut A,
        request: zfocus_can::BusFrame,
        index: u16,
        subindex: u8,
    ) -> Result<u32, DriverError> {
        bus.drain()?;
        bus.send(request)?;
        let param_pi = self.param_pi;
        let reply = await_reply(bus, self.answer_timeout, self.poll_interval, |frame| {
            if frame.id != param_pi || frame.rtr {
                return None;
            }
            match parse_param_reply(&request, frame) {
                Ok(ParamReply::Value(value)) => Some(Ok(value)),
                Ok(ParamReply::Rejected) => {
                    Some(Err(DriverError::ParamRejected { index, subindex }))
                },
                Ok(ParamReply::EchoMismatch) => {
                    // 陈旧应答：丢弃，继续等本次交换的回显
                    warn!("parameter reply without request echo ({index}/{subindex}), dropped");
                    None
                },
                Err(e) => {
                    warn!("bad parameter frame: {}", e);
                    None
                },
            }
        })?;
        reply.ok_or(DriverError::NoAnswer { what: "drive parameter channel" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zfocus_can::{BusFrame, MockCanAdapter};
    use zfocus_protocol::motor::param;

    fn fast_channel(addr: u8) -> MotorChannel {
        let timing = TimingConfig {
            poll_interval_ms: 1,
            motor_timeout_ms: 20,
            ..TimingConfig::default()
        };
        MotorChannel::new(addr, &timing).unwrap()
    }

    #[test]
    fn control_exchange_ok() {
        let mock = MockCanAdapter::new();
        mock.on_send(|frame| {
            if frame.id == 99 {
                vec![BusFrame::new(100, &[0x03, 0, 0, 0, 0, 0])]
            } else {
                vec![]
            }
        });
        let mut bus = mock.clone();
        let channel = fast_channel(12);
        let status = channel
            .exchange_control(&mut bus, ControlWord::ENABLE, 1750)
            .unwrap();
        assert!(status.contains(StatusWord::READY));
        let sent = mock.last_sent_to(99).unwrap();
        assert_eq!(sent.data[1], 6);
        assert_eq!(i16::from_be_bytes([sent.data[2], sent.data[3]]), 1750);
    }

    #[test]
    fn warning_resends_with_clear_error() {
        let mock = MockCanAdapter::new();
        mock.on_send(|frame| {
            if frame.id != 99 {
                return vec![];
            }
            if frame.data[1] & 0x40 == 0 {
                // 首发：告警（mailfunction + ready）
                vec![BusFrame::new(100, &[0x22, 5, 0, 0, 0, 0])]
            } else {
                vec![BusFrame::new(100, &[0x03, 0, 0, 0, 0, 0])]
            }
        });
        let mut bus = mock.clone();
        let channel = fast_channel(12);
        assert!(matches!(
            channel.exchange_control(&mut bus, ControlWord::ENABLE, 500),
            Err(DriverError::Warning(5))
        ));
        // 第二帧必须带 CLEAR_ERROR 位且控制字不变
        let frames: Vec<_> = mock.sent().into_iter().filter(|f| f.id == 99).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].data[1], 6 | 0x40);
    }

    #[test]
    fn malfunction_is_fatal() {
        let mock = MockCanAdapter::new();
        mock.on_send(|frame| {
            if frame.id == 99 {
                vec![BusFrame::new(100, &[0x20, 9, 0, 0, 0, 0])]
            } else {
                vec![]
            }
        });
        let mut bus = mock.clone();
        assert!(matches!(
            fast_channel(12).exchange_control(&mut bus, ControlWord::STOP, 0),
            Err(DriverError::Malfunction(9))
        ));
        // 硬故障不补发
        assert_eq!(mock.sent_count(), 1);
    }

    #[test]
    fn control_no_answer() {
        let mut bus = MockCanAdapter::new();
        assert!(matches!(
            fast_channel(12).exchange_control(&mut bus, ControlWord::ENABLE, 100),
            Err(DriverError::NoAnswer { .. })
        ));
    }

    #[test]
    fn param_read_value() {
        let mock = MockCanAdapter::new();
        mock.on_send(|frame| {
            if frame.id == 611 && frame.data[0] == 0x31 {
                let mut reply = *frame;
                reply.id = 612;
                reply.data[4..8].copy_from_slice(&350_000u32.to_be_bytes());
                vec![reply]
            } else {
                vec![]
            }
        });
        let mut bus = mock.clone();
        let value = fast_channel(12)
            .read_param(&mut bus, param::SPEED_SUBINDEX, param::SPEED)
            .unwrap();
        assert_eq!(value, 350_000);
    }

    #[test]
    fn param_rejected_and_echo_mismatch() {
        let mock = MockCanAdapter::new();
        mock.on_send(|frame| {
            if frame.id != 611 {
                return vec![];
            }
            let mut reply = *frame;
            reply.id = 612;
            reply.data[0] |= 0x80;
            vec![reply]
        });
        let mut bus = mock.clone();
        assert!(matches!(
            fast_channel(12).read_param(&mut bus, 0, 9999),
            Err(DriverError::ParamRejected { index: 9999, .. })
        ));

        // 回显不一致的应答被丢弃，交换以超时告终
        let mock = MockCanAdapter::new();
        mock.on_send(|frame| {
            if frame.id != 611 {
                return vec![];
            }
            let mut reply = *frame;
            reply.id = 612;
            reply.data[3] = reply.data[3].wrapping_add(1);
            vec![reply]
        });
        let mut bus = mock.clone();
        assert!(matches!(
            fast_channel(12).read_param(&mut bus, 0, param::SPEED),
            Err(DriverError::NoAnswer { .. })
        ));
    }

    #[test]
    fn param_write_echoes_value() {
        let mock = MockCanAdapter::new();
        mock.on_send(|frame| {
            if frame.id == 611 && frame.data[0] == 0x32 {
                let mut reply = *frame;
                reply.id = 612;
                vec![reply]
            } else {
                vec![]
            }
        });
        let mut bus = mock.clone();
        fast_channel(12)
            .write_param(&mut bus, 0, param::DI04_ROLE, param::ROLE_ENABLE_STOP)
            .unwrap();
        let sent = mock.last_sent_to(611).unwrap();
        assert_eq!(sent.data[0], 0x32);
        assert_eq!(&sent.data[4..8], &[0, 0, 0, 1]);
    }
}
