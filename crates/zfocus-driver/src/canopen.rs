//! DS406 编码器的 CANopen 链路层
//!
//! 请求/应答交换的统一纪律：
//!
//! 1. 交换前 `drain` 清掉接收队列里的陈旧帧；
//! 2. 发送请求；
//! 3. 限时轮询应答，按 COB-ID 和对象回显配对，不相关帧丢弃并记日志；
//! 4. 到期未配对返回 `NoAnswer`，绝不无限等待。
//!
//! store/restore 类对象写 flash，应答明显更慢，单独用慢超时。

use crate::config::TimingConfig;
use crate::error::DriverError;
use crate::wait::await_reply;
use std::time::Duration;
use tracing::{debug, trace, warn};
use zfocus_can::{BusFrame, CanAdapter};
use zfocus_protocol::canopen::{
    self, ds406, parse_sdo_response, NmtCommand, NodeState, SdoResponse,
};

/// 一次 PDO 采样
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoSample {
    /// PDO 号（1 或 2）
    pub pdo: u8,
    pub value: u32,
}

/// 链路层时序参数
#[derive(Debug, Clone, Copy)]
struct LinkTiming {
    poll_interval: Duration,
    sdo_timeout: Duration,
    sdo_slow_timeout: Duration,
    guard_timeout: Duration,
    boot_timeout: Duration,
}

/// 面向单个编码器节点的 CANopen 客户端
#[derive(Debug, Clone)]
pub struct CanopenClient {
    node: u8,
    timing: LinkTiming,
}

impl CanopenClient {
    pub fn new(node: u8, timing: &TimingConfig) -> Self {
        Self {
            node,
            timing: LinkTiming {
                poll_interval: timing.poll_interval(),
                sdo_timeout: timing.sdo_timeout(),
                sdo_slow_timeout: timing.sdo_slow_timeout(),
                guard_timeout: timing.guard_timeout(),
                boot_timeout: timing.boot_timeout(),
            },
        }
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    fn sdo_timeout_for(&self, object: u16) -> Duration {
        if object == ds406::STORE_PARAMS || object == ds406::RESTORE_DEFAULTS {
            self.timing.sdo_slow_timeout
        } else {
            self.timing.sdo_timeout
        }
    }

    /// 发送 NMT 命令（广播帧，无应答）
    pub fn send_nmt<A: CanAdapter>(&self, bus: &mut A, command: NmtCommand) -> Result<(), DriverError> {
        trace!("NMT {:?} -> node {}", command, self.node);
        bus.send(canopen::nmt_frame(self.node, command))?;
        Ok(())
    }

    /// 复位节点并等待 boot-up 帧
    ///
    /// 失败只记日志：上电后已在线的节点复位失败不致命。
    pub fn reset_node<A: CanAdapter>(&self, bus: &mut A) -> bool {
        let attempt = (|| -> Result<bool, DriverError> {
            bus.drain()?;
            self.send_nmt(bus, NmtCommand::ResetNode)?;
            let node = self.node;
            let bootup = await_reply(bus, self.timing.boot_timeout, self.timing.poll_interval, |frame| {
                canopen::is_bootup(frame, node).then_some(Ok(()))
            })?;
            Ok(bootup.is_some())
        })();
        match attempt {
            Ok(true) => {
                debug!("node {} rebooted", self.node);
                true
            },
            Ok(false) => {
                warn!("no boot-up frame from node {} after reset", self.node);
                false
            },
            Err(e) => {
                warn!("node {} reset failed: {}", self.node, e);
                false
            },
        }
    }

    /// Node Guarding 查询；`Ok(None)` 表示节点不可达或状态码非法
    pub fn node_state<A: CanAdapter>(&self, bus: &mut A) -> Result<Option<NodeState>, DriverError> {
        bus.drain()?;
        bus.send(canopen::guard_request(self.node))?;
        let guard_id = canopen::GUARD_BASE | (self.node as u32 & canopen::NODE_MASK);
        let reply = await_reply(bus, self.timing.guard_timeout, self.timing.poll_interval, |frame| {
            if frame.id != guard_id || frame.rtr || frame.len < 1 {
                return None;
            }
            Some(Ok(NodeState::from_guard_byte(frame.data[0])))
        })?;
        Ok(reply.flatten())
    }

    /// expedited SDO 上载（读），返回数据与宽度
    pub fn sdo_upload<A: CanAdapter>(
        &self,
        bus: &mut A,
        object: u16,
        subindex: u8,
    ) -> Result<([u8; 4], usize), DriverError> {
        bus.drain()?;
        bus.send(canopen::sdo_upload_request(self.node, object, subindex))?;
        self.await_sdo(bus, object, subindex, |resp| match resp {
            SdoResponse::Upload { data, len, .. } => Some((data, len)),
            _ => None,
        })
    }

    /// expedited SDO 下载（写）
    pub fn sdo_download<A: CanAdapter>(
        &self,
        bus: &mut A,
        object: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), DriverError> {
        bus.drain()?;
        bus.send(canopen::sdo_download_request(self.node, object, subindex, data))?;
        self.await_sdo(bus, object, subindex, |resp| {
            matches!(resp, SdoResponse::DownloadAck { .. }).then_some(())
        })
    }

    /// 共用的 SDO 应答等待：ID 过滤、对象回显校验、abort 解码
    fn await_sdo<A: CanAdapter, T>(
        &self,
        bus: &mut A,
        object: u16,
        subindex: u8,
        mut accept: impl FnMut(SdoResponse) -> Option<T>,
    ) -> Result<T, DriverError> {
        let resp_id = canopen::sdo_response_id(self.node);
        let timeout = self.sdo_timeout_for(object);
        let reply = await_reply(bus, timeout, self.timing.poll_interval, |frame| {
            if frame.id != resp_id || frame.rtr {
                return None;
            }
            let parsed = match parse_sdo_response(frame) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("bad SDO frame from node {}: {}", self.node, e);
                    return None;
                },
            };
            if parsed.object() != object || parsed.subindex() != subindex {
                warn!(
                    "SDO reply for 0x{:04x}/{} while waiting for 0x{:04x}/{}",
                    parsed.object(),
                    parsed.subindex(),
                    object,
                    subindex
                );
                return None;
            }
            if let SdoResponse::Abort { code, .. } = parsed {
                return Some(Err(DriverError::SdoAbort { object, subindex, code }));
            }
            match accept(parsed) {
                Some(value) => Some(Ok(value)),
                None => {
                    warn!("unexpected SDO response kind for 0x{object:04x}/{subindex}");
                    None
                },
            }
        })?;
        reply.ok_or(DriverError::NoAnswer { what: "encoder SDO" })
    }

    pub fn get_u32<A: CanAdapter>(&self, bus: &mut A, object: u16, subindex: u8) -> Result<u32, DriverError> {
        let (data, len) = self.sdo_upload(bus, object, subindex)?;
        if len < 4 {
            warn!("object 0x{object:04x}/{subindex}: {len}-byte reply for u32, zero-extended");
        }
        Ok(u32::from_le_bytes(data))
    }

    pub fn get_u16<A: CanAdapter>(&self, bus: &mut A, object: u16, subindex: u8) -> Result<u16, DriverError> {
        let (data, len) = self.sdo_upload(bus, object, subindex)?;
        if len < 2 {
            warn!("object 0x{object:04x}/{subindex}: {len}-byte reply for u16, zero-extended");
        }
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    pub fn get_u8<A: CanAdapter>(&self, bus: &mut A, object: u16, subindex: u8) -> Result<u8, DriverError> {
        let (data, _) = self.sdo_upload(bus, object, subindex)?;
        Ok(data[0])
    }

    pub fn set_u32<A: CanAdapter>(&self, bus: &mut A, object: u16, subindex: u8, value: u32) -> Result<(), DriverError> {
        self.sdo_download(bus, object, subindex, &value.to_le_bytes())
    }

    pub fn set_u16<A: CanAdapter>(&self, bus: &mut A, object: u16, subindex: u8, value: u16) -> Result<(), DriverError> {
        self.sdo_download(bus, object, subindex, &value.to_le_bytes())
    }

    pub fn set_u8<A: CanAdapter>(&self, bus: &mut A, object: u16, subindex: u8, value: u8) -> Result<(), DriverError> {
        self.sdo_download(bus, object, subindex, &[value])
    }

    /// ASCII 对象（设备名、软硬件版本）的 expedited 读取
    pub fn get_string<A: CanAdapter>(&self, bus: &mut A, object: u16, subindex: u8) -> Result<String, DriverError> {
        let (data, len) = self.sdo_upload(bus, object, subindex)?;
        let text = data[..len]
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect();
        Ok(text)
    }

    /// 将当前参数区写入设备 flash（"save" 签名）
    pub fn store_params<A: CanAdapter>(&self, bus: &mut A) -> Result<(), DriverError> {
        bus.drain()?;
        bus.send(canopen::sdo_signature_request(self.node, ds406::STORE_PARAMS, 1, b"save"))?;
        self.await_sdo(bus, ds406::STORE_PARAMS, 1, |resp| {
            matches!(resp, SdoResponse::DownloadAck { .. }).then_some(())
        })
    }

    /// 发送 SYNC 广播
    pub fn send_sync<A: CanAdapter>(&self, bus: &mut A) -> Result<(), DriverError> {
        bus.send(canopen::sync_frame())?;
        Ok(())
    }

    /// 等待本节点的下一帧 PDO
    pub fn recv_next_pdo<A: CanAdapter>(
        &self,
        bus: &mut A,
        timeout: Duration,
    ) -> Result<Option<PdoSample>, DriverError> {
        let node = self.node;
        await_reply(bus, timeout, self.timing.poll_interval, |frame| {
            match canopen::classify_pdo(frame) {
                Some((pdo, n)) if n == node => Some(Ok(PdoSample {
                    pdo,
                    value: canopen::pdo_value(frame),
                })),
                _ => None,
            }
        })
    }

    /// 在时限内收集本节点的 PDO，最多 `max` 帧
    pub fn recv_pdos<A: CanAdapter>(
        &self,
        bus: &mut A,
        timeout: Duration,
        max: usize,
    ) -> Result<Vec<PdoSample>, DriverError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut samples = Vec::new();
        while samples.len() < max {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            if left.is_zero() {
                break;
            }
            match self.recv_next_pdo(bus, left)? {
                Some(sample) => samples.push(sample),
                None => break,
            }
        }
        Ok(samples)
    }

    /// 用 RTR 请求一帧 PDO
    pub fn request_pdo<A: CanAdapter>(
        &self,
        bus: &mut A,
        pdo: u8,
        timeout: Duration,
    ) -> Result<Option<u32>, DriverError> {
        let base = match pdo {
            1 => canopen::PDO1_BASE,
            _ => canopen::PDO2_BASE,
        };
        bus.drain()?;
        bus.send(BusFrame::rtr(base | (self.node as u32 & canopen::NODE_MASK)))?;
        Ok(self
            .recv_next_pdo(bus, timeout)?
            .filter(|sample| sample.pdo == pdo)
            .map(|sample| sample.value))
    }
}
