//! # zfocus Protocol
//!
//! 焦点调节器 CAN 总线协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `canopen`: CANopen 子集（NMT/SDO/PDO）与 DS406 编码器对象字典
//! - `motor`: 电机驱动器私有参数协议（控制通道 + 参数通道）
//!
//! ## 字节序
//!
//! SDO 数据段为 CANopen 标准的小端字节序；电机参数通道的数值为
//! 大端字节序（Motorola, MSB first）。两个模块各自提供转换。

pub mod canopen;
pub mod motor;

use thiserror::Error;

/// CAN 2.0 标准帧的统一抽象
///
/// 协议层与硬件层之间的中间类型：协议模块只构建/解析 `BusFrame`，
/// 底层 SocketCAN 的转换在 `zfocus-can` 中完成。
///
/// 本系统只使用 11-bit 标准帧；Node Guarding 与 PDO 请求需要
/// RTR 帧，因此帧上带有 `rtr` 标志。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BusFrame {
    /// CAN ID（11-bit 标准帧）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// Remote Transmission Request 帧
    pub rtr: bool,

    /// 接收时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl BusFrame {
    /// 创建数据帧
    pub fn new(id: u32, data: &[u8]) -> Self {
        let mut fixed = [0u8; 8];
        let len = data.len().min(8);
        fixed[..len].copy_from_slice(&data[..len]);
        Self {
            id,
            data: fixed,
            len: len as u8,
            rtr: false,
            timestamp_us: 0,
        }
    }

    /// 创建 RTR 帧（无数据）
    pub fn rtr(id: u32) -> Self {
        Self {
            id,
            data: [0u8; 8],
            len: 0,
            rtr: true,
            timestamp_us: 0,
        }
    }

    /// 获取有效数据切片
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// 协议解析错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: &'static str, value: u8 },

    #[error("Motor address out of range (0-63): {0}")]
    BadMotorAddress(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_truncates_to_eight_bytes() {
        let frame = BusFrame::new(0x123, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn rtr_frame_is_empty() {
        let frame = BusFrame::rtr(0x700 | 3);
        assert!(frame.rtr);
        assert_eq!(frame.len, 0);
        assert_eq!(frame.data_slice(), &[] as &[u8]);
    }
}
