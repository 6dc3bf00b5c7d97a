//! 驱动层统一错误类型

use thiserror::Error;
use zfocus_protocol::canopen::abort_text;

/// 驱动层错误
///
/// 总线交换类错误（`Can`/`NoAnswer`/`SdoAbort`...）通常可重试；
/// 安全类错误（`Damaged`/`Safety`/`OutOfRange`）必须由上层处理，
/// 重试只会复现。
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("CAN Error: {0}")]
    Can(#[from] zfocus_can::CanError),

    #[error("Protocol Error: {0}")]
    Protocol(#[from] zfocus_protocol::ProtocolError),

    /// 对端在限时窗口内没有应答
    #[error("No answer from {what} within timeout")]
    NoAnswer { what: &'static str },

    /// SDO 中止，文案由标准 abort code 表解码
    #[error("SDO abort on 0x{object:04x}/{subindex}: {} (0x{code:08x})", abort_text(*code))]
    SdoAbort { object: u16, subindex: u8, code: u32 },

    /// 驱动器硬故障（mailfunction 且未就绪）
    #[error("Drive malfunction, code {0}")]
    Malfunction(u8),

    /// 驱动器告警（已补发 CLEAR_ERROR，仍需上层决定是否重试）
    #[error("Drive warning, code {0}")]
    Warning(u8),

    /// 参数通道拒绝了 index/subindex
    #[error("Drive rejected parameter {index}/{subindex}")]
    ParamRejected { index: u16, subindex: u8 },

    /// 设备身份或状态与预期不符
    #[error("Device mismatch: {0}")]
    WrongDevice(String),

    /// 编码器或电机尚未初始化
    #[error("Subsystem not initialized: {0}")]
    NotReady(&'static str),

    /// 两个限位同时有效，或限位在允许区之外触发：机构受损
    #[error("Device damaged (end-switch state inconsistent with position)")]
    Damaged,

    /// 预检拒绝：继续运动会越过限位或行程边界
    #[error("Move rejected: {0}")]
    Safety(&'static str),

    /// 目标超出行程范围
    #[error("Target {value} out of range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    /// 运动域已被占用
    #[error("Motion already in progress")]
    Busy,

    /// 运动被急停标志中止
    #[error("Move aborted by stop request")]
    Stopped,

    /// 电机在加速窗口后仍无转速
    #[error("Motor stalled (no speed after acceleration window)")]
    Stall,

    /// 运动循环超出总时限
    #[error("Move timed out")]
    MoveTimeout,

    /// 粗定位越过了目标
    #[error("Overshoot: position {actual} beyond target {target}")]
    Overshoot { target: u32, actual: u32 },

    /// 精定位结束仍在容差带之外
    #[error("Missed target: position {actual}, target {target}")]
    MissedTarget { target: u32, actual: u32 },

    /// 配置文件错误
    #[error("Config Error: {0}")]
    Config(#[from] ConfigError),
}

/// 配置装载错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
