//! 电机驱动器私有 CAN 参数协议
//!
//! 驱动器按地址派生两对固定 ID：
//!
//! - 控制/状态通道（6 字节帧）：PO = (addr<<3)+3，应答 PI = PO+1
//! - 参数通道（8 字节帧）：PO+512，应答再 +1
//!
//! 数值（速度、参数值）均为大端字节序。

use crate::{BusFrame, ProtocolError};
use bitflags::bitflags;

/// 功能号：PO=3（主→从），PI=4（从→主）
const PO_FNO: u32 = 3;
/// 参数通道 ID 偏移
const PARAM_DATA_OFFSET: u32 = 512;

/// 控制通道 PO ID
pub fn po_id(addr: u8) -> Result<u32, ProtocolError> {
    if addr > 0x3f {
        return Err(ProtocolError::BadMotorAddress(addr));
    }
    Ok(((addr as u32) << 3) + PO_FNO)
}

/// 参数通道 PO ID
pub fn param_id(addr: u8) -> Result<u32, ProtocolError> {
    Ok(PARAM_DATA_OFFSET + po_id(addr)?)
}

bitflags! {
    /// 控制字（6 字节帧的 byte 1）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlWord: u8 {
        const BLOCK        = 1 << 0;
        const ENABLE_RAPID = 1 << 1;
        const ENABLE_STOP  = 1 << 2;
        const TEMPO        = 1 << 4;
        const PARAM_SET    = 1 << 5;
        const CLEAR_ERROR  = 1 << 6;
    }
}

impl ControlWord {
    /// 使能运行（rapid + stop ramp）
    pub const ENABLE: ControlWord = ControlWord::ENABLE_RAPID.union(ControlWord::ENABLE_STOP);
    /// 停车（stop ramp）
    pub const STOP: ControlWord = ControlWord::ENABLE_RAPID;
    /// 急停
    pub const RAPID_STOP: ControlWord = ControlWord::empty();
}

bitflags! {
    /// 状态字（应答帧的 byte 0）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusWord: u8 {
        const UNBLOCK     = 1 << 0;
        const READY       = 1 << 1;
        const PO_UNBLOCK  = 1 << 2;
        const TEMPO21     = 1 << 3;
        const PARAM21     = 1 << 4;
        const MALFUNCTION = 1 << 5;
    }
}

/// 控制通道应答的判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveReply {
    /// 正常，携带状态字
    Ok(StatusWord),
    /// 可恢复告警（mailfunction + ready），code 为 byte 1
    Warning(u8),
    /// 硬故障（mailfunction + !ready），code 为 byte 1
    Malfunction(u8),
}

/// 构建 6 字节控制帧：byte1 = 控制字，byte2..3 = 大端有符号速度
pub fn control_frame(po_id: u32, ctrl: ControlWord, raw_speed: i16) -> BusFrame {
    let spd = raw_speed.to_be_bytes();
    BusFrame::new(po_id, &[0, ctrl.bits(), spd[0], spd[1], 0, 0])
}

/// 判定控制通道应答
///
/// `{mailfunction, !ready}` 为硬故障，`{mailfunction, ready}` 为可恢复
/// 告警（调用方补发 CLEAR_ERROR 位清除）。
pub fn classify_reply(frame: &BusFrame) -> Result<DriveReply, ProtocolError> {
    if frame.len < 2 {
        return Err(ProtocolError::InvalidLength {
            expected: 2,
            actual: frame.len as usize,
        });
    }
    let sw = StatusWord::from_bits_truncate(frame.data[0]);
    let code = frame.data[1];
    if sw.contains(StatusWord::MALFUNCTION) {
        if sw.contains(StatusWord::READY) {
            Ok(DriveReply::Warning(code))
        } else {
            Ok(DriveReply::Malfunction(code))
        }
    } else {
        Ok(DriveReply::Ok(sw))
    }
}

/// 参数命令字
pub const READ_PARAM_CMD: u8 = 0x31;
pub const WRITE_PARAM_CMD: u8 = 0x32;
/// 应答 byte 0 的错误标志：无效 index/subindex
pub const PARAM_ERR_FLAG: u8 = 0x80;

/// 参数索引（驱动器厂商表，照抄）
pub mod param {
    /// 数字输入状态（最低位为 DI00）
    pub const DIGITAL_INPUTS: u16 = 8334;
    pub const DI_SUBINDEX: u8 = 0;
    /// 实际转速（毫转/分）
    pub const SPEED: u16 = 8318;
    pub const SPEED_SUBINDEX: u8 = 0;
    /// 电机电流
    pub const CURRENT: u16 = 8326;
    /// 数字输入角色配置
    pub const DI00_ROLE: u16 = 8844;
    pub const DI02_ROLE: u16 = 8336;
    pub const DI03_ROLE: u16 = 8337;
    pub const DI04_ROLE: u16 = 8338;
    pub const DI05_ROLE: u16 = 8339;
    /// 角色值
    pub const ROLE_NONE: u32 = 0;
    pub const ROLE_ENABLE_STOP: u32 = 1;
}

/// 构建 8 字节参数读请求
pub fn read_param_frame(param_po_id: u32, subindex: u8, index: u16) -> BusFrame {
    BusFrame::new(
        param_po_id,
        &[
            READ_PARAM_CMD,
            subindex,
            (index >> 8) as u8,
            (index & 0xff) as u8,
            0,
            0,
            0,
            0,
        ],
    )
}

/// 构建 8 字节参数写请求（值为大端）
pub fn write_param_frame(param_po_id: u32, subindex: u8, index: u16, value: u32) -> BusFrame {
    let v = value.to_be_bytes();
    BusFrame::new(
        param_po_id,
        &[
            WRITE_PARAM_CMD,
            subindex,
            (index >> 8) as u8,
            (index & 0xff) as u8,
            v[0],
            v[1],
            v[2],
            v[3],
        ],
    )
}

/// 参数应答的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamReply {
    /// 正常应答，值为大端解码的 bytes 4..8
    Value(u32),
    /// 设备报告无效 index/subindex
    Rejected,
    /// 应答未回显请求头（前 4 字节不一致），值不可信
    EchoMismatch,
}

/// 解析参数应答：`request` 为发出的请求帧，用于回显校验
pub fn parse_param_reply(request: &BusFrame, reply: &BusFrame) -> Result<ParamReply, ProtocolError> {
    if reply.len < 8 {
        return Err(ProtocolError::InvalidLength {
            expected: 8,
            actual: reply.len as usize,
        });
    }
    if reply.data[0] & PARAM_ERR_FLAG != 0 {
        return Ok(ParamReply::Rejected);
    }
    if reply.data[..4] != request.data[..4] {
        return Ok(ParamReply::EchoMismatch);
    }
    Ok(ParamReply::Value(u32::from_be_bytes([
        reply.data[4],
        reply.data[5],
        reply.data[6],
        reply.data[7],
    ])))
}

/// 限位开关状态
///
/// `BothActive` 永远是错误：两个行程极限不可能同时到达。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EswState {
    Inactive,
    CwActive,
    CcwActive,
    BothActive,
}

/// 限位开关输入位（低电平有效：位为 0 表示开关按下）
pub const ESW_CW_BIT: u32 = 1 << 4;
pub const ESW_CCW_BIT: u32 = 1 << 5;

/// 从数字输入状态字解码限位开关
pub fn decode_esw(inputs: u32) -> EswState {
    let cw = inputs & ESW_CW_BIT == 0;
    let ccw = inputs & ESW_CCW_BIT == 0;
    match (cw, ccw) {
        (false, false) => EswState::Inactive,
        (true, false) => EswState::CwActive,
        (false, true) => EswState::CcwActive,
        (true, true) => EswState::BothActive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_derivation() {
        assert_eq!(po_id(12).unwrap(), 99);
        assert_eq!(param_id(12).unwrap(), 611);
        assert_eq!(po_id(0).unwrap(), 3);
        assert!(po_id(64).is_err());
    }

    #[test]
    fn control_word_combinations() {
        assert_eq!(ControlWord::ENABLE.bits(), 6);
        assert_eq!(ControlWord::STOP.bits(), 2);
        assert_eq!(ControlWord::RAPID_STOP.bits(), 0);
    }

    #[test]
    fn control_frame_layout() {
        let frame = control_frame(99, ControlWord::ENABLE, -1750);
        assert_eq!(frame.id, 99);
        assert_eq!(frame.len, 6);
        assert_eq!(frame.data[0], 0);
        assert_eq!(frame.data[1], 6);
        assert_eq!(i16::from_be_bytes([frame.data[2], frame.data[3]]), -1750);
    }

    #[test]
    fn reply_classification() {
        // ready + unblock，正常
        let frame = BusFrame::new(100, &[0x03, 0, 0, 0, 0, 0]);
        assert!(matches!(classify_reply(&frame).unwrap(), DriveReply::Ok(_)));

        // mailfunction 无 ready：硬故障
        let frame = BusFrame::new(100, &[0x20, 7, 0, 0, 0, 0]);
        assert_eq!(classify_reply(&frame).unwrap(), DriveReply::Malfunction(7));

        // mailfunction + ready：告警
        let frame = BusFrame::new(100, &[0x22, 3, 0, 0, 0, 0]);
        assert_eq!(classify_reply(&frame).unwrap(), DriveReply::Warning(3));
    }

    #[test]
    fn param_read_frame_layout() {
        let frame = read_param_frame(611, 0, param::DIGITAL_INPUTS);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data[0], 0x31);
        assert_eq!(frame.data[1], 0);
        assert_eq!(
            u16::from_be_bytes([frame.data[2], frame.data[3]]),
            param::DIGITAL_INPUTS
        );
    }

    #[test]
    fn param_write_frame_big_endian_value() {
        let frame = write_param_frame(611, 0, param::DI04_ROLE, 1);
        assert_eq!(frame.data[0], 0x32);
        assert_eq!(&frame.data[4..8], &[0, 0, 0, 1]);
    }

    #[test]
    fn param_reply_roundtrip() {
        let request = read_param_frame(611, 0, param::SPEED);
        let mut reply = request;
        reply.id = 612;
        reply.data[4..8].copy_from_slice(&350_000u32.to_be_bytes());
        // 命令字节在应答中保持回显
        assert_eq!(
            parse_param_reply(&request, &reply).unwrap(),
            ParamReply::Value(350_000)
        );
    }

    #[test]
    fn param_reply_error_flag() {
        let request = read_param_frame(611, 0, 9999);
        let mut reply = request;
        reply.data[0] |= PARAM_ERR_FLAG;
        assert_eq!(parse_param_reply(&request, &reply).unwrap(), ParamReply::Rejected);
    }

    #[test]
    fn param_reply_echo_mismatch() {
        let request = read_param_frame(611, 0, param::SPEED);
        let mut reply = request;
        reply.data[3] = reply.data[3].wrapping_add(1);
        assert_eq!(
            parse_param_reply(&request, &reply).unwrap(),
            ParamReply::EchoMismatch
        );
    }

    #[test]
    fn esw_decode_is_active_low() {
        // 两个输入位都为高电平：开关未按下
        assert_eq!(decode_esw(ESW_CW_BIT | ESW_CCW_BIT), EswState::Inactive);
        assert_eq!(decode_esw(ESW_CCW_BIT), EswState::CwActive);
        assert_eq!(decode_esw(ESW_CW_BIT), EswState::CcwActive);
        assert_eq!(decode_esw(0), EswState::BothActive);
    }
}
