//! # zfocus Driver
//!
//! Z1000 望远镜调焦器驱动：DS406 绝对式编码器（CANopen）与
//! 电机驱动器（厂商私有参数协议）之上的闭环运动控制。
//!
//! ## 架构
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  Focuser（并发外壳：总线域 / 运动域 / 急停）  │
//! ├────────────────────────────────────────────┤
//! │  Supervisor（状态机 + 两段式定位 + 安全逻辑）  │
//! ├──────────────────────┬─────────────────────┤
//! │  CanopenClient       │  MotorChannel       │
//! │  （编码器链路层）      │  （驱动器通道）       │
//! ├──────────────────────┴─────────────────────┤
//! │  CanAdapter（SocketCAN / mock）             │
//! └────────────────────────────────────────────┘
//! ```
//!
//! 位置与状态经 `ArcSwap` 快照对外发布，任意多读者无锁读取；
//! 所有总线等待均有界。

pub mod canopen;
pub mod config;
pub mod error;
pub mod focuser;
pub mod motor;
#[cfg(feature = "sim")]
pub mod sim;
pub mod supervisor;
mod wait;

pub use config::{FocuserConfig, DEFAULT_INTERFACE, DEFAULT_MOTOR_ADDR, DEFAULT_NODE};
pub use error::{ConfigError, DriverError};
pub use focuser::{Focuser, MoveOutcome};
pub use supervisor::{Snapshot, Supervisor, SysStatus};

pub use zfocus_protocol::motor::EswState;
