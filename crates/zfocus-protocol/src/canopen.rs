//! CANopen 子集：NMT / SDO（expedited）/ PDO 帧的构建与解析
//!
//! 只实现 DS406 编码器所需的最小子集，不是通用 CANopen 主站。
//! 所有对象索引均为协议契约的一部分，必须与真实硬件逐字一致。

use crate::{BusFrame, ProtocolError};
use num_enum::TryFromPrimitive;

/// 功能码基址（COB-ID = 基址 | 节点号）
pub const NMT_ID: u32 = 0x000;
pub const SYNC_ID: u32 = 0x080;
pub const PDO1_BASE: u32 = 0x180;
pub const PDO2_BASE: u32 = 0x280;
pub const SDO_RESP_BASE: u32 = 0x580;
pub const SDO_REQ_BASE: u32 = 0x600;
pub const GUARD_BASE: u32 = 0x700;

/// 节点号掩码（0-127）
pub const NODE_MASK: u32 = 0x7f;

/// NMT 命令码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    Start = 0x01,
    Stop = 0x02,
    PreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

/// Node Guarding 状态码
///
/// 0 不是合法状态码，链路层用 `Unknown` 表示超时/不可达。
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum NodeState {
    Stopped = 0x04,
    Operational = 0x05,
    PreOperational = 0x7f,
}

impl NodeState {
    /// 从 guard 应答字节解码（低 7 位，toggle 位忽略）
    pub fn from_guard_byte(byte: u8) -> Option<NodeState> {
        NodeState::try_from(byte & 0x7f).ok()
    }
}

/// 构建 2 字节 NMT 广播帧
pub fn nmt_frame(node: u8, command: NmtCommand) -> BusFrame {
    BusFrame::new(NMT_ID, &[command as u8, node & 0x7f])
}

/// 构建 Node Guarding RTR 请求
pub fn guard_request(node: u8) -> BusFrame {
    BusFrame::rtr(GUARD_BASE | (node as u32 & NODE_MASK))
}

/// 节点上电 boot-up 帧：1 字节，值 0
pub fn is_bootup(frame: &BusFrame, node: u8) -> bool {
    frame.id == (GUARD_BASE | (node as u32 & NODE_MASK)) && frame.len == 1 && frame.data[0] == 0
}

/// 构建 SYNC 广播帧
pub fn sync_frame() -> BusFrame {
    BusFrame::new(SYNC_ID, &[])
}

/// expedited SDO 命令字
///
/// 下载（写）按数据宽度选择命令字；上载（读）统一 0x40，
/// 宽度由应答的命令字给出。
pub fn sdo_download_specifier(len: usize) -> u8 {
    match len {
        1 => 0x2f,
        2 => 0x2b,
        3 => 0x27,
        4 => 0x23,
        // 宽度未指明的 4 字节下载（store/restore 的 "save" 签名用）
        _ => 0x22,
    }
}

pub const SDO_UPLOAD_REQ: u8 = 0x40;
pub const SDO_DOWNLOAD_ACK: u8 = 0x60;
pub const SDO_ABORT: u8 = 0x80;

/// 构建 SDO 下载（写）请求
pub fn sdo_download_request(node: u8, object: u16, subindex: u8, data: &[u8]) -> BusFrame {
    let mut buf = [0u8; 8];
    buf[0] = sdo_download_specifier(data.len());
    buf[1] = (object & 0xff) as u8;
    buf[2] = (object >> 8) as u8;
    buf[3] = subindex;
    let n = data.len().min(4);
    buf[4..4 + n].copy_from_slice(&data[..n]);
    BusFrame::new(SDO_REQ_BASE | (node as u32 & NODE_MASK), &buf)
}

/// 构建 store/restore 对象的签名下载请求
///
/// "save"/"load" 签名按宽度未指明（0x22）发送，与设备固件的预期一致。
pub fn sdo_signature_request(node: u8, object: u16, subindex: u8, signature: &[u8; 4]) -> BusFrame {
    let mut buf = [0u8; 8];
    buf[0] = sdo_download_specifier(0);
    buf[1] = (object & 0xff) as u8;
    buf[2] = (object >> 8) as u8;
    buf[3] = subindex;
    buf[4..8].copy_from_slice(signature);
    BusFrame::new(SDO_REQ_BASE | (node as u32 & NODE_MASK), &buf)
}

/// 构建 SDO 上载（读）请求
pub fn sdo_upload_request(node: u8, object: u16, subindex: u8) -> BusFrame {
    let mut buf = [0u8; 8];
    buf[0] = SDO_UPLOAD_REQ;
    buf[1] = (object & 0xff) as u8;
    buf[2] = (object >> 8) as u8;
    buf[3] = subindex;
    BusFrame::new(SDO_REQ_BASE | (node as u32 & NODE_MASK), &buf)
}

/// 解析后的 SDO 应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoResponse {
    /// 下载确认（0x60）
    DownloadAck { object: u16, subindex: u8 },
    /// expedited 上载数据；`len` 为 1-4（由命令字推导）
    Upload {
        object: u16,
        subindex: u8,
        data: [u8; 4],
        len: usize,
    },
    /// 中止（0x80），带 32-bit abort code
    Abort {
        object: u16,
        subindex: u8,
        code: u32,
    },
}

impl SdoResponse {
    pub fn object(&self) -> u16 {
        match self {
            SdoResponse::DownloadAck { object, .. }
            | SdoResponse::Upload { object, .. }
            | SdoResponse::Abort { object, .. } => *object,
        }
    }

    pub fn subindex(&self) -> u8 {
        match self {
            SdoResponse::DownloadAck { subindex, .. }
            | SdoResponse::Upload { subindex, .. }
            | SdoResponse::Abort { subindex, .. } => *subindex,
        }
    }
}

/// SDO 应答帧的 COB-ID
pub fn sdo_response_id(node: u8) -> u32 {
    SDO_RESP_BASE | (node as u32 & NODE_MASK)
}

/// 解析 SDO 应答帧
///
/// 调用方负责先按 `sdo_response_id` 过滤 ID；长度不足 4 字节视为坏帧。
pub fn parse_sdo_response(frame: &BusFrame) -> Result<SdoResponse, ProtocolError> {
    if frame.len < 4 {
        return Err(ProtocolError::InvalidLength {
            expected: 4,
            actual: frame.len as usize,
        });
    }
    let specifier = frame.data[0];
    let object = u16::from_le_bytes([frame.data[1], frame.data[2]]);
    let subindex = frame.data[3];
    if specifier == SDO_ABORT {
        let code = u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
        return Ok(SdoResponse::Abort {
            object,
            subindex,
            code,
        });
    }
    if specifier == SDO_DOWNLOAD_ACK {
        return Ok(SdoResponse::DownloadAck { object, subindex });
    }
    if specifier & 0xf0 == 0x40 {
        let len = match specifier & 0x7f {
            0x4f => 1,
            0x4b => 2,
            0x47 => 3,
            // 0x43 与宽度未指明的应答都按 4 字节取
            _ => 4,
        };
        let mut data = [0u8; 4];
        data.copy_from_slice(&frame.data[4..8]);
        return Ok(SdoResponse::Upload {
            object,
            subindex,
            data,
            len,
        });
    }
    Err(ProtocolError::InvalidValue {
        field: "sdo command specifier",
        value: specifier,
    })
}

/// PDO 帧分类：返回 PDO 号（1/2）与节点号
pub fn classify_pdo(frame: &BusFrame) -> Option<(u8, u8)> {
    if frame.rtr {
        return None;
    }
    let node = (frame.id & NODE_MASK) as u8;
    match frame.id & 0xf80 {
        PDO1_BASE => Some((1, node)),
        PDO2_BASE => Some((2, node)),
        _ => None,
    }
}

/// PDO 数据段按实际长度小端解码
pub fn pdo_value(frame: &BusFrame) -> u32 {
    let mut value = 0u32;
    for (i, byte) in frame.data_slice().iter().take(4).enumerate() {
        value |= (*byte as u32) << (8 * i);
    }
    value
}

/// SDO abort code 解码表（CiA 标准代码）
///
/// 未知代码退化为通用文案，绝不视为致命错误。
pub fn abort_text(code: u32) -> &'static str {
    match code {
        0x0503_0000 => "Toggle bit not alternated",
        0x0504_0000 => "SDO protocol timed out",
        0x0504_0001 => "Client/server command specifier not valid or unknown",
        0x0504_0002 => "Invalid block size (block mode only)",
        0x0504_0003 => "Invalid sequence number (block mode only)",
        0x0504_0004 => "CRC error (block mode only)",
        0x0504_0005 => "Out of memory",
        0x0601_0000 => "Unsupported access to an object",
        0x0601_0001 => "Attempt to read a write only object",
        0x0601_0002 => "Attempt to write a read only object",
        0x0602_0000 => "Object does not exist in the object dictionary",
        0x0604_0041 => "Object cannot be mapped to the PDO",
        0x0604_0042 => "The number and length of the objects to be mapped would exceed PDO length",
        0x0604_0043 => "General parameter incompatibility reason",
        0x0604_0047 => "General internal incompatibility in the device",
        0x0606_0000 => "Access failed due to a hardware error",
        0x0607_0010 => "Data type does not match, length of service parameter does not match",
        0x0607_0012 => "Data type does not match, length of service parameter too high",
        0x0607_0013 => "Data type does not match, length of service parameter too low",
        0x0609_0011 => "Sub-index does not exist",
        0x0609_0030 => "Value range of parameter exceeded (only for write access)",
        0x0609_0031 => "Value of parameter written too high",
        0x0609_0032 => "Value of parameter written too low",
        0x0609_0036 => "Maximum value is less than minimum value",
        0x0800_0000 => "General error",
        0x0800_0020 => "Data cannot be transferred or stored to the application",
        0x0800_0021 => {
            "Data cannot be transferred or stored to the application because of local control"
        },
        0x0800_0022 => {
            "Data cannot be transferred or stored to the application because of the present device state"
        },
        0x0800_0023 => {
            "Object dictionary dynamic generation fails or no object dictionary is present"
        },
        _ => "SDO error of unknown type",
    }
}

/// DS406 绝对式旋转编码器对象字典
///
/// 数值常量是与真实硬件互操作的契约，照表复制，不得改动。
pub mod ds406 {
    pub const DEVTYPE: u16 = 0x1000;
    pub const ERROR_REG: u16 = 0x1001;
    pub const MANUF_STATUS: u16 = 0x1002;
    pub const COBID_SYNC: u16 = 0x1005;
    pub const MAN_DEV_NAME: u16 = 0x1008;
    pub const MAN_HW_VERS: u16 = 0x1009;
    pub const MAN_SW_VERS: u16 = 0x100A;
    pub const STORE_PARAMS: u16 = 0x1010;
    pub const RESTORE_DEFAULTS: u16 = 0x1011;
    pub const COBID_EMERG: u16 = 0x1014;
    pub const PROD_HEARTBEAT_TIME: u16 = 0x1017;
    pub const IDENTITY: u16 = 0x1018;

    pub const BAUDRATE: u16 = 0x2100;
    pub const NODE_NUMBER: u16 = 0x2101;
    pub const TERMINATOR: u16 = 0x2102;
    pub const NMT_AUTOSTART: u16 = 0x2104;

    /// 配置参数（subindex 1: safety code sequence,
    /// 2: safety preset value, 3: inverted safety preset value）
    pub const CONF_PARAMETERS: u16 = 0x5000;
    pub const CONF_VALID: u16 = 0x50FE;
    pub const CONF_VALID_MAGIC: u8 = 0xA5;
    pub const CONF_CHECKSUM: u16 = 0x50FF;

    pub const OPER_PARAMS: u16 = 0x6000;
    pub const MEAS_UNITS_PER_REV: u16 = 0x6001;
    pub const TOTAL_MEAS_RANGE: u16 = 0x6002;
    pub const PRESET_VALUE: u16 = 0x6003;
    pub const POSITION_VALUE: u16 = 0x6004;
    pub const POSITION_RAW: u16 = 0x600C;
    pub const SPEED_VALUE: u16 = 0x6030;
    pub const CYCLE_TIMER: u16 = 0x6200;
    pub const OPER_STATUS: u16 = 0x6500;
    pub const TURN_RESOLUTION: u16 = 0x6501;
    pub const REVOLUTION_NUMBER: u16 = 0x6502;
    pub const ALARMS: u16 = 0x6503;
    pub const WARNINGS: u16 = 0x6505;
    pub const OFFSET_VALUE: u16 = 0x6509;
    pub const MODULE_ID: u16 = 0x650A;
    pub const SERIAL_NUMBER: u16 = 0x650B;

    /// DEVTYPE 应答：低 16 位为 profile（406），高 16 位为类型（2 = 多圈）
    pub const PROFILE: u16 = 406;
    pub const TYPE_MULTITURN: u16 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmt_frame_layout() {
        let frame = nmt_frame(3, NmtCommand::Start);
        assert_eq!(frame.id, 0x000);
        assert_eq!(frame.data_slice(), &[0x01, 0x03]);

        let frame = nmt_frame(0x85, NmtCommand::ResetNode);
        // 节点号截断到 7 bit
        assert_eq!(frame.data_slice(), &[0x81, 0x05]);
    }

    #[test]
    fn guard_request_is_rtr() {
        let frame = guard_request(3);
        assert_eq!(frame.id, 0x703);
        assert!(frame.rtr);
    }

    #[test]
    fn bootup_detection() {
        assert!(is_bootup(&BusFrame::new(0x703, &[0]), 3));
        assert!(!is_bootup(&BusFrame::new(0x703, &[0x7f]), 3));
        assert!(!is_bootup(&BusFrame::new(0x704, &[0]), 3));
        assert!(!is_bootup(&BusFrame::new(0x703, &[0, 0]), 3));
    }

    #[test]
    fn node_state_from_guard_byte_masks_toggle() {
        assert_eq!(NodeState::from_guard_byte(0x05), Some(NodeState::Operational));
        assert_eq!(NodeState::from_guard_byte(0x85), Some(NodeState::Operational));
        assert_eq!(NodeState::from_guard_byte(0x7f), Some(NodeState::PreOperational));
        assert_eq!(NodeState::from_guard_byte(0x00), None);
    }

    #[test]
    fn sdo_upload_request_layout() {
        let frame = sdo_upload_request(3, ds406::DEVTYPE, 0);
        assert_eq!(frame.id, 0x603);
        assert_eq!(frame.data_slice(), &[0x40, 0x00, 0x10, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn sdo_download_specifier_by_width() {
        assert_eq!(sdo_download_specifier(1), 0x2f);
        assert_eq!(sdo_download_specifier(2), 0x2b);
        assert_eq!(sdo_download_specifier(3), 0x27);
        assert_eq!(sdo_download_specifier(4), 0x23);
        assert_eq!(sdo_download_specifier(0), 0x22);
    }

    #[test]
    fn sdo_signature_request_is_unsized() {
        let frame = sdo_signature_request(3, ds406::STORE_PARAMS, 1, b"save");
        assert_eq!(frame.data_slice(), &[0x22, 0x10, 0x10, 0x01, b's', b'a', b'v', b'e']);
    }

    #[test]
    fn sdo_download_request_little_endian_payload() {
        let frame = sdo_download_request(3, 0x6003, 0, &0x1234_5678u32.to_le_bytes());
        assert_eq!(
            frame.data_slice(),
            &[0x23, 0x03, 0x60, 0x00, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn parse_upload_response_widths() {
        let frame = BusFrame::new(0x583, &[0x4b, 0x03, 0x60, 0x01, 0xaa, 0xbb, 0, 0]);
        match parse_sdo_response(&frame).unwrap() {
            SdoResponse::Upload {
                object,
                subindex,
                data,
                len,
            } => {
                assert_eq!(object, 0x6003);
                assert_eq!(subindex, 1);
                assert_eq!(len, 2);
                assert_eq!(u16::from_le_bytes([data[0], data[1]]), 0xbbaa);
            },
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn parse_abort_response() {
        let code = 0x0602_0000u32.to_le_bytes();
        let frame = BusFrame::new(
            0x583,
            &[0x80, 0x00, 0x10, 0x00, code[0], code[1], code[2], code[3]],
        );
        match parse_sdo_response(&frame).unwrap() {
            SdoResponse::Abort { code, .. } => {
                assert_eq!(code, 0x0602_0000);
                assert_eq!(abort_text(code), "Object does not exist in the object dictionary");
            },
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn abort_text_unknown_code_degrades() {
        assert_eq!(abort_text(0xdead_beef), "SDO error of unknown type");
    }

    #[test]
    fn short_sdo_response_rejected() {
        let frame = BusFrame::new(0x583, &[0x60, 0x00]);
        assert!(parse_sdo_response(&frame).is_err());
    }

    #[test]
    fn pdo_classification() {
        let frame = BusFrame::new(0x183, &[1, 2, 3, 4]);
        assert_eq!(classify_pdo(&frame), Some((1, 3)));
        assert_eq!(pdo_value(&frame), 0x0403_0201);

        let frame = BusFrame::new(0x285, &[0xff, 0x01]);
        assert_eq!(classify_pdo(&frame), Some((2, 5)));
        assert_eq!(pdo_value(&frame), 0x01ff);

        assert_eq!(classify_pdo(&BusFrame::new(0x583, &[0; 8])), None);
        assert_eq!(classify_pdo(&BusFrame::rtr(0x183)), None);
    }
}
