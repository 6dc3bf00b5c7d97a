//! 调焦器配置与标定参数
//!
//! 所有标定常量（行程标定、速度档位、制动修正多项式、时序）都集中在
//! [`FocuserConfig`]，默认值对应 Z1000 望远镜现场标定结果。可从 TOML
//! 文件整体或部分覆盖（`#[serde(default)]`，缺省字段取标定值）。

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 默认 CAN 接口
pub const DEFAULT_INTERFACE: &str = "can0";
/// 默认编码器节点号
pub const DEFAULT_NODE: u8 = 3;
/// 默认电机驱动器地址
pub const DEFAULT_MOTOR_ADDR: u8 = 12;

/// 调焦器总配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocuserConfig {
    /// 编码器 CANopen 节点号
    pub node: u8,
    /// 电机驱动器地址（0-63）
    pub motor_addr: u8,
    pub focus: FocusCalib,
    pub speed: SpeedConfig,
    pub stopping: StoppingConfig,
    pub timing: TimingConfig,
}

impl Default for FocuserConfig {
    fn default() -> Self {
        Self {
            node: DEFAULT_NODE,
            motor_addr: DEFAULT_MOTOR_ADDR,
            focus: FocusCalib::default(),
            speed: SpeedConfig::default(),
            stopping: StoppingConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl FocuserConfig {
    /// 从 TOML 文件装载，缺省字段取标定默认值
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: FocuserConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.motor_addr > 0x3f {
            return Err(ConfigError::Invalid(format!(
                "motor_addr {} exceeds 6-bit address space",
                self.motor_addr
            )));
        }
        if self.focus.min_mm >= self.focus.max_mm {
            return Err(ConfigError::Invalid(format!(
                "focus range inverted: min {} >= max {}",
                self.focus.min_mm, self.focus.max_mm
            )));
        }
        if self.speed.min_rpm <= 0 || self.speed.max_rpm < self.speed.min_rpm {
            return Err(ConfigError::Invalid(format!(
                "speed range invalid: min {} max {}",
                self.speed.min_rpm, self.speed.max_rpm
            )));
        }
        Ok(())
    }
}

/// 行程标定：原始编码器计数 <-> 毫米
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusCalib {
    /// 每毫米对应的编码器计数
    pub scale_per_mm: f64,
    /// 0mm 对应的原始计数
    pub raw_zero: f64,
    /// 行程下限（mm）
    pub min_mm: f64,
    /// 行程上限（mm）
    pub max_mm: f64,
    /// 到位容差（原始计数）
    pub tolerance_raw: i64,
    /// 粗定位的提前量：粗定位目标 = 目标 - fine_approach_raw
    pub fine_approach_raw: i64,
    /// CW 限位允许区宽度（mm，从 max_mm 向内）
    pub esw_zone_cw_mm: f64,
    /// CCW 限位允许区宽度（mm，从 min_mm 向内）
    pub esw_zone_ccw_mm: f64,
}

impl Default for FocusCalib {
    fn default() -> Self {
        Self {
            scale_per_mm: 4096.0,
            raw_zero: 15_963_187.0,
            min_mm: 2.75,
            max_mm: 76.0,
            tolerance_raw: 10,
            fine_approach_raw: 250,
            esw_zone_cw_mm: 1.0,
            esw_zone_ccw_mm: 1.0,
        }
    }
}

impl FocusCalib {
    pub fn raw_to_mm(&self, raw: u32) -> f64 {
        (raw as f64 - self.raw_zero) / self.scale_per_mm
    }

    pub fn mm_to_raw(&self, mm: f64) -> i64 {
        (mm * self.scale_per_mm + self.raw_zero) as i64
    }

    pub fn min_raw(&self) -> i64 {
        self.mm_to_raw(self.min_mm)
    }

    pub fn max_raw(&self) -> i64 {
        self.mm_to_raw(self.max_mm)
    }

    /// CW 限位允许触发的最小原始计数
    pub fn cw_zone_raw(&self) -> i64 {
        self.mm_to_raw(self.max_mm - self.esw_zone_cw_mm)
    }

    /// CCW 限位允许触发的最大原始计数
    pub fn ccw_zone_raw(&self) -> i64 {
        self.mm_to_raw(self.min_mm + self.esw_zone_ccw_mm)
    }

    pub fn in_range(&self, mm: f64) -> bool {
        mm >= self.min_mm && mm <= self.max_mm
    }
}

/// 速度档位与换算
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    /// 最低工作转速（rpm）
    pub min_rpm: i16,
    /// 最高工作转速（rpm）
    pub max_rpm: i16,
    /// 限位脱出时的转速（rpm）
    pub esw_rpm: i16,
    /// 控制帧速度值 = rpm * raw_per_rpm
    pub raw_per_rpm: i16,
    /// 电机接线反向时取反控制帧速度
    pub reverse: bool,
    /// 粗定位档位阈值（剩余距离，原始计数）：
    /// > tier1 用 max，> tier2 用 max/2，> tier3 用 max/3，否则 min
    pub tier1_raw: i64,
    pub tier2_raw: i64,
    pub tier3_raw: i64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            min_rpm: 350,
            max_rpm: 1200,
            esw_rpm: 350,
            raw_per_rpm: 5,
            reverse: false,
            tier1_raw: 1500,
            tier2_raw: 500,
            tier3_raw: 150,
        }
    }
}

impl SpeedConfig {
    pub fn rpm_to_raw(&self, rpm: i16) -> i16 {
        rpm.saturating_mul(self.raw_per_rpm)
    }

    /// 夹取转速绝对值到 [min_rpm, max_rpm]，保留符号；0 按 +min 处理
    pub fn clamp_rpm(&self, rpm: i16) -> i16 {
        let sign: i16 = if rpm < 0 { -1 } else { 1 };
        let magnitude = rpm.unsigned_abs() as i16;
        sign * magnitude.clamp(self.min_rpm, self.max_rpm)
    }

    /// 按剩余距离选择粗定位转速档
    pub fn tier_rpm(&self, distance_raw: i64) -> i16 {
        if distance_raw > self.tier1_raw {
            self.max_rpm
        } else if distance_raw > self.tier2_raw {
            self.max_rpm / 2
        } else if distance_raw > self.tier3_raw {
            self.max_rpm / 3
        } else {
            self.min_rpm
        }
    }
}

/// 制动修正多项式：给定控制帧速度值，估计从发出停车到静止
/// 期间编码器还会走过的计数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingConfig {
    pub c0: f64,
    pub c1: f64,
    pub c2: f64,
    /// 修正下限（原始计数）
    pub min_correction: i64,
}

impl Default for StoppingConfig {
    fn default() -> Self {
        Self {
            c0: -46.0,
            c1: 4.2857e-3,
            c2: 1.5714e-5,
            min_correction: 10,
        }
    }
}

impl StoppingConfig {
    pub fn correction(&self, raw_speed: i16) -> i64 {
        let s = raw_speed.unsigned_abs() as f64;
        let estimated = (self.c0 + (self.c1 + self.c2 * s) * s) as i64;
        estimated.max(self.min_correction)
    }
}

/// 时序与限额
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// 等待循环的轮询间隔
    pub poll_interval_ms: u64,
    /// SDO 常规应答超时
    pub sdo_timeout_ms: u64,
    /// store/restore 类慢对象的 SDO 应答超时
    pub sdo_slow_timeout_ms: u64,
    /// Node Guarding 应答超时
    pub guard_timeout_ms: u64,
    /// 复位后等待 boot-up 帧的超时
    pub boot_timeout_ms: u64,
    /// 电机通道应答超时
    pub motor_timeout_ms: u64,
    /// 运动循环的总时限
    pub move_timeout_s: u64,
    /// 起步加速窗口：窗口过后转速仍为零视为堵转
    pub accel_window_ms: u64,
    /// 位置停止收敛的检测间隔
    pub settle_interval_ms: u64,
    /// 位置停止收敛的总时限
    pub settle_timeout_s: u64,
    /// 剩余距离连续不减的上限次数
    pub stall_limit: u32,
    /// 剩余距离增大（越过目标）的上限次数
    pub overshoot_limit: u32,
    /// 限位脱出的最多尝试次数
    pub recover_attempts: u32,
    /// 每次脱出尝试的步长（mm）
    pub recover_step_mm: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            sdo_timeout_ms: 150,
            sdo_slow_timeout_ms: 500,
            guard_timeout_ms: 150,
            boot_timeout_ms: 500,
            motor_timeout_ms: 500,
            move_timeout_s: 300,
            accel_window_ms: 250,
            settle_interval_ms: 100,
            settle_timeout_s: 30,
            stall_limit: 50,
            overshoot_limit: 2,
            recover_attempts: 5,
            recover_step_mm: 0.2,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn sdo_timeout(&self) -> Duration {
        Duration::from_millis(self.sdo_timeout_ms)
    }
    pub fn sdo_slow_timeout(&self) -> Duration {
        Duration::from_millis(self.sdo_slow_timeout_ms)
    }
    pub fn guard_timeout(&self) -> Duration {
        Duration::from_millis(self.guard_timeout_ms)
    }
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }
    pub fn motor_timeout(&self) -> Duration {
        Duration::from_millis(self.motor_timeout_ms)
    }
    pub fn move_timeout(&self) -> Duration {
        Duration::from_secs(self.move_timeout_s)
    }
    pub fn accel_window(&self) -> Duration {
        Duration::from_millis(self.accel_window_ms)
    }
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_s)
    }
}
