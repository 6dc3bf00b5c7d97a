//! 模拟设备：挂在 mock 总线上的 DS406 编码器 + 电机驱动器
//!
//! 行为模型（测试用，不追求物理保真）：
//!
//! - 编码器位置在每次 POSITION_VALUE 读取时前进
//!   `|raw_speed| / step_divisor`（至少 1）个计数，方向随速度符号；
//! - 停车时沿运动方向滑行制动修正多项式给出的计数（模拟惯性），
//!   转速读数立即归零；
//! - 限位开关可由位置阈值驱动（越过阈值即按下），也可强制指定；
//! - 未知 SDO 对象回 abort 0x0602_0000，未知参数置错误标志。

use crate::config::{FocusCalib, StoppingConfig};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use zfocus_can::{BusFrame, MockCanAdapter};
use zfocus_protocol::canopen::{ds406, GUARD_BASE, NMT_ID, NODE_MASK, PDO1_BASE, PDO2_BASE, SDO_REQ_BASE, SDO_RESP_BASE, SYNC_ID};
use zfocus_protocol::motor::{param, ESW_CCW_BIT, ESW_CW_BIT, PARAM_ERR_FLAG, READ_PARAM_CMD, WRITE_PARAM_CMD};

/// 模拟设备内部状态
pub struct SimState {
    pub node: u8,
    pub motor_addr: u8,
    /// DEVTYPE 应答（低 16 位 profile，高 16 位类型）
    pub devtype: u32,
    /// CANopen 节点状态码
    pub node_state: u8,
    /// 编码器位置（原始计数）
    pub position: i64,
    /// 当前下发的控制帧速度
    pub raw_speed: i16,
    pub enabled: bool,
    /// 每次位置读取前进 |raw_speed|/step_divisor 个计数
    pub step_divisor: i64,
    pub di04_role: u32,
    pub di05_role: u32,
    /// 指定时直接作为数字输入状态（覆盖位置阈值模型）
    pub force_inputs: Option<u32>,
    /// 位置 >= 阈值视为 CW 限位按下
    pub cw_press_above: Option<i64>,
    /// 位置 <= 阈值视为 CCW 限位按下
    pub ccw_press_below: Option<i64>,
    /// 每次位置读取的人为延时（给并发测试留时间窗）
    pub read_delay: Option<Duration>,
    /// 制动滑行模型（None 则急停无滑行）
    pub coast: Option<StoppingConfig>,
}

impl SimState {
    fn inputs(&self) -> u32 {
        if let Some(forced) = self.force_inputs {
            return forced;
        }
        let mut inputs = ESW_CW_BIT | ESW_CCW_BIT;
        if self.cw_press_above.is_some_and(|t| self.position >= t) {
            inputs &= !ESW_CW_BIT;
        }
        if self.ccw_press_below.is_some_and(|t| self.position <= t) {
            inputs &= !ESW_CCW_BIT;
        }
        inputs
    }

    fn advance(&mut self) {
        if !self.enabled || self.raw_speed == 0 {
            return;
        }
        let step = (self.raw_speed.unsigned_abs() as i64 / self.step_divisor).max(1);
        if self.raw_speed > 0 {
            self.position += step;
        } else {
            self.position -= step;
        }
    }

    fn brake(&mut self) {
        if self.enabled && self.raw_speed != 0 {
            if let Some(coast) = &self.coast {
                let travel = coast.correction(self.raw_speed);
                if self.raw_speed > 0 {
                    self.position += travel;
                } else {
                    self.position -= travel;
                }
            }
        }
        self.enabled = false;
        self.raw_speed = 0;
    }

    /// 电机转速读数（毫转/分）
    fn speed_millirpm(&self) -> i32 {
        if !self.enabled {
            return 0;
        }
        (self.raw_speed as i32 / 5) * 1000
    }
}

/// 挂在 mock 总线上的模拟设备
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
    adapter: MockCanAdapter,
}

impl SimDevice {
    pub fn new(node: u8, motor_addr: u8) -> Self {
        let state = Arc::new(Mutex::new(SimState {
            node,
            motor_addr,
            devtype: ((ds406::TYPE_MULTITURN as u32) << 16) | ds406::PROFILE as u32,
            node_state: 0x7f,
            position: 0,
            raw_speed: 0,
            enabled: false,
            step_divisor: 1000,
            di04_role: param::ROLE_ENABLE_STOP,
            di05_role: param::ROLE_ENABLE_STOP,
            force_inputs: None,
            cw_press_above: None,
            ccw_press_below: None,
            read_delay: None,
            coast: Some(StoppingConfig::default()),
        }));
        let adapter = MockCanAdapter::new();
        let shared = Arc::clone(&state);
        adapter.on_send(move |frame| respond(&mut shared.lock().unwrap(), frame));
        Self { state, adapter }
    }

    /// 供被测代码使用的总线端（可克隆，状态共享）
    pub fn adapter(&self) -> MockCanAdapter {
        self.adapter.clone()
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn set_position_mm(&self, calib: &FocusCalib, mm: f64) {
        self.state().position = calib.mm_to_raw(mm);
    }

    pub fn position(&self) -> i64 {
        self.state().position
    }

    /// 已发出的帧数（检查"无总线流量"类断言用）
    pub fn frames_sent(&self) -> usize {
        self.adapter.sent_count()
    }
}

fn sdo_reply(node: u8, specifier: u8, object: u16, subindex: u8, payload: [u8; 4]) -> BusFrame {
    BusFrame::new(
        SDO_RESP_BASE | (node as u32 & NODE_MASK),
        &[
            specifier,
            (object & 0xff) as u8,
            (object >> 8) as u8,
            subindex,
            payload[0],
            payload[1],
            payload[2],
            payload[3],
        ],
    )
}

fn pdo1_frame(st: &SimState) -> BusFrame {
    BusFrame::new(
        PDO1_BASE | (st.node as u32 & NODE_MASK),
        &(st.position as u32).to_le_bytes(),
    )
}

fn respond(st: &mut SimState, frame: &BusFrame) -> Vec<BusFrame> {
    let node = st.node as u32 & NODE_MASK;
    let po = ((st.motor_addr as u32) << 3) + 3;
    let param_po = po + 512;

    if frame.id == NMT_ID && frame.len >= 2 && frame.data[1] as u32 == node {
        match frame.data[0] {
            0x01 => {
                st.node_state = 0x05;
                // 进入 operational 的事件 PDO
                return vec![pdo1_frame(st)];
            },
            0x02 => st.node_state = 0x04,
            0x80 => st.node_state = 0x7f,
            0x81 | 0x82 => {
                st.node_state = 0x7f;
                return vec![BusFrame::new(GUARD_BASE | node, &[0])];
            },
            _ => {},
        }
        return vec![];
    }

    if frame.rtr && frame.id == (GUARD_BASE | node) {
        return vec![BusFrame::new(GUARD_BASE | node, &[st.node_state])];
    }

    if frame.id == SYNC_ID {
        let pdo2 = BusFrame::new(PDO2_BASE | node, &(st.position as u32).to_le_bytes());
        return vec![pdo1_frame(st), pdo2];
    }

    if frame.rtr && frame.id == (PDO1_BASE | node) {
        return vec![pdo1_frame(st)];
    }

    if frame.id == (SDO_REQ_BASE | node) && frame.len >= 4 {
        let specifier = frame.data[0];
        let object = u16::from_le_bytes([frame.data[1], frame.data[2]]);
        let subindex = frame.data[3];
        if specifier == 0x40 {
            let reply = match object {
                ds406::DEVTYPE => sdo_reply(st.node, 0x43, object, subindex, st.devtype.to_le_bytes()),
                ds406::POSITION_VALUE => {
                    if let Some(delay) = st.read_delay {
                        std::thread::sleep(delay);
                    }
                    st.advance();
                    sdo_reply(st.node, 0x43, object, subindex, (st.position as u32).to_le_bytes())
                },
                ds406::MAN_DEV_NAME => sdo_reply(st.node, 0x43, object, subindex, *b"ZSIM"),
                ds406::MAN_SW_VERS => sdo_reply(st.node, 0x43, object, subindex, *b"1.0\0"),
                _ => sdo_reply(st.node, 0x80, object, subindex, 0x0602_0000u32.to_le_bytes()),
            };
            return vec![reply];
        }
        if specifier & 0xf0 == 0x20 {
            return vec![sdo_reply(st.node, 0x60, object, subindex, [0; 4])];
        }
        return vec![];
    }

    if frame.id == po && frame.len >= 4 {
        let ctrl = frame.data[1];
        if ctrl & 0x06 == 0x06 {
            st.enabled = true;
            st.raw_speed = i16::from_be_bytes([frame.data[2], frame.data[3]]);
        } else {
            st.brake();
        }
        // ready + unblock
        return vec![BusFrame::new(po + 1, &[0x03, 0, 0, 0, 0, 0])];
    }

    if frame.id == param_po && frame.len >= 8 {
        let mut reply = *frame;
        reply.id = param_po + 1;
        let index = u16::from_be_bytes([frame.data[2], frame.data[3]]);
        match frame.data[0] {
            READ_PARAM_CMD => {
                let value: u32 = match index {
                    param::DIGITAL_INPUTS => st.inputs(),
                    param::SPEED => st.speed_millirpm() as u32,
                    param::CURRENT => 0,
                    param::DI04_ROLE => st.di04_role,
                    param::DI05_ROLE => st.di05_role,
                    _ => {
                        reply.data[0] |= PARAM_ERR_FLAG;
                        0
                    },
                };
                reply.data[4..8].copy_from_slice(&value.to_be_bytes());
            },
            WRITE_PARAM_CMD => {
                let value = u32::from_be_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
                match index {
                    param::DI04_ROLE => st.di04_role = value,
                    param::DI05_ROLE => st.di05_role = value,
                    _ => reply.data[0] |= PARAM_ERR_FLAG,
                }
            },
            _ => reply.data[0] |= PARAM_ERR_FLAG,
        }
        return vec![reply];
    }

    vec![]
}
