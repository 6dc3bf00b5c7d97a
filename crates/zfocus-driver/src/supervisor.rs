//! 运动监督器：编码器 + 驱动器之上的闭环控制与安全逻辑
//!
//! 所有总线访问都经由监督器，调用方负责互斥（见 `focuser` 模块）。
//! 状态机的不变量：
//!
//! - `Damaged` 一旦进入不再自行退出（矛盾读数消失也不解除），
//!   后续任何运动请求直接拒绝，不产生总线流量；只有操作员显式
//!   复位（`reset_damage`）或重新初始化能解除闩锁；
//! - 限位触发只在行程端点的允许区内是正常的（`EndSwitch`），
//!   在允许区之外触发说明机构或开关损坏（`Damaged`）；
//! - 每个运动循环受总时限约束，剩余距离连续不减/反增有上限计数，
//!   任何退出路径都先停车。

use crate::canopen::CanopenClient;
use crate::config::FocuserConfig;
use crate::error::DriverError;
use crate::motor::MotorChannel;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use zfocus_can::CanAdapter;
use zfocus_protocol::canopen::{ds406, NmtCommand, NodeState};
use zfocus_protocol::motor::{decode_esw, param, ControlWord, EswState};

/// 系统状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysStatus {
    /// 正常待机
    Ok,
    /// 限位开关在允许区内触发
    EndSwitch,
    /// 正在从限位开关脱出
    Recovering,
    /// 通信或驱动器故障
    Error,
    /// 朝行程边界外运动被保护性停车
    Forbidden,
    /// 机构受损：限位状态与位置不自洽
    Damaged,
}

/// 监督器状态的无锁快照，供并发读取
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub raw: u32,
    pub position_mm: f64,
    pub status: SysStatus,
    pub esw: EswState,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            raw: 0,
            position_mm: 0.0,
            status: SysStatus::Error,
            esw: EswState::Inactive,
        }
    }
}

/// 调焦器运动监督器
pub struct Supervisor<A: CanAdapter> {
    bus: A,
    link: CanopenClient,
    motor: MotorChannel,
    cfg: FocuserConfig,
    encoder_ready: bool,
    motor_ready: bool,
    /// 最近一次读到的原始位置
    position: u32,
    status: SysStatus,
    esw: EswState,
    /// 当前下发的目标速度（控制帧单位，未做反向修正）
    target_raw_speed: i16,
    /// 急停标志：运动循环每圈检查，置位即中止
    emergency: Arc<AtomicBool>,
    snapshot: Arc<ArcSwap<Snapshot>>,
}

impl<A: CanAdapter> Supervisor<A> {
    pub fn new(
        bus: A,
        cfg: FocuserConfig,
        emergency: Arc<AtomicBool>,
        snapshot: Arc<ArcSwap<Snapshot>>,
    ) -> Result<Self, DriverError> {
        let link = CanopenClient::new(cfg.node, &cfg.timing);
        let motor = MotorChannel::new(cfg.motor_addr, &cfg.timing)?;
        Ok(Self {
            bus,
            link,
            motor,
            cfg,
            encoder_ready: false,
            motor_ready: false,
            position: 0,
            status: SysStatus::Error,
            esw: EswState::Inactive,
            target_raw_speed: 0,
            emergency,
            snapshot,
        })
    }

    pub fn config(&self) -> &FocuserConfig {
        &self.cfg
    }

    pub fn status(&self) -> SysStatus {
        self.status
    }

    pub fn esw(&self) -> EswState {
        self.esw
    }

    pub fn position_raw(&self) -> u32 {
        self.position
    }

    pub fn position_mm(&self) -> f64 {
        self.cfg.focus.raw_to_mm(self.position)
    }

    fn publish(&self) {
        self.snapshot.store(Arc::new(Snapshot {
            raw: self.position,
            position_mm: self.position_mm(),
            status: self.status,
            esw: self.esw,
        }));
    }

    /// 初始化编码器：确认身份、复位（可选）、切入 operational
    ///
    /// 身份不符（profile 或类型错）时节点保持 pre-operational，
    /// 绝不对未知设备下发 start。
    pub fn init_encoder(&mut self, reset: bool) -> Result<(), DriverError> {
        match self.link.node_state(&mut self.bus)? {
            None => {
                return Err(DriverError::WrongDevice(format!(
                    "encoder node {} unreachable",
                    self.cfg.node
                )));
            },
            Some(NodeState::PreOperational) => {},
            Some(state) => {
                debug!("node {} in state {:?}, switching to pre-operational", self.cfg.node, state);
                self.link.send_nmt(&mut self.bus, NmtCommand::PreOperational)?;
            },
        }
        if reset {
            self.link.reset_node(&mut self.bus);
        }

        let devtype = self.link.get_u32(&mut self.bus, ds406::DEVTYPE, 0)?;
        let profile = (devtype & 0xffff) as u16;
        let kind = (devtype >> 16) as u16;
        if profile != ds406::PROFILE || kind != ds406::TYPE_MULTITURN {
            return Err(DriverError::WrongDevice(format!(
                "expected multiturn DS406 encoder, got profile {profile} type {kind}"
            )));
        }
        if let Ok(name) = self.link.get_string(&mut self.bus, ds406::MAN_DEV_NAME, 0) {
            info!("encoder '{}' on node {}", name, self.cfg.node);
        }
        if let Ok(version) = self.link.get_string(&mut self.bus, ds406::MAN_SW_VERS, 0) {
            debug!("encoder firmware {}", version);
        }

        self.link.send_nmt(&mut self.bus, NmtCommand::Start)?;
        let _ = self
            .link
            .recv_next_pdo(&mut self.bus, self.cfg.timing.sdo_timeout())?;
        match self.link.node_state(&mut self.bus)? {
            Some(NodeState::Operational) => {},
            other => {
                let _ = self.return_preoper(None);
                return Err(DriverError::WrongDevice(format!(
                    "node {} did not enter operational state ({other:?})",
                    self.cfg.node
                )));
            },
        }

        // SYNC 一次，确认 PDO 通路
        self.bus.drain()?;
        self.link.send_sync(&mut self.bus)?;
        let pdos = self
            .link
            .recv_pdos(&mut self.bus, self.cfg.timing.sdo_slow_timeout(), 4)?;
        debug!("{} PDO frame(s) after SYNC", pdos.len());

        self.encoder_ready = true;
        self.status = SysStatus::Ok;
        self.read_position()?;
        self.publish();
        info!("encoder ready, position {:.3} mm", self.position_mm());
        Ok(())
    }

    /// 初始化电机通道并在需要时从限位脱出
    pub fn init_motor(&mut self) -> Result<(), DriverError> {
        self.motor_ready = true;
        self.go_out_from_esw()
    }

    pub fn encoder_ready(&self) -> bool {
        self.encoder_ready
    }

    pub fn motor_ready(&self) -> bool {
        self.motor_ready
    }

    /// 读限位开关状态
    pub fn end_switches(&mut self) -> Result<EswState, DriverError> {
        let inputs = self
            .motor
            .read_param(&mut self.bus, param::DI_SUBINDEX, param::DIGITAL_INPUTS)?;
        Ok(decode_esw(inputs))
    }

    /// 确认两个限位输入配置为 enable-stop 角色，不是则改写
    pub fn check_esw_roles(&mut self) -> Result<(), DriverError> {
        let di4 = self.motor.read_param(&mut self.bus, 0, param::DI04_ROLE)?;
        let di5 = self.motor.read_param(&mut self.bus, 0, param::DI05_ROLE)?;
        if di4 == param::ROLE_ENABLE_STOP && di5 == param::ROLE_ENABLE_STOP {
            return Ok(());
        }
        warn!("end-switch inputs not in enable-stop role (DI4={di4}, DI5={di5}), reprogramming");
        self.wait_till_stop()?;
        if di4 != param::ROLE_ENABLE_STOP {
            self.motor
                .write_param(&mut self.bus, 0, param::DI04_ROLE, param::ROLE_ENABLE_STOP)?;
        }
        if di5 != param::ROLE_ENABLE_STOP {
            self.motor
                .write_param(&mut self.bus, 0, param::DI05_ROLE, param::ROLE_ENABLE_STOP)?;
        }
        Ok(())
    }

    /// 电机实际转速（rpm；参数通道以毫转/分上报）
    pub fn motor_speed(&mut self) -> Result<f64, DriverError> {
        let raw = self
            .motor
            .read_param(&mut self.bus, param::SPEED_SUBINDEX, param::SPEED)?;
        Ok(raw as i32 as f64 / 1000.0)
    }

    fn read_position(&mut self) -> Result<u32, DriverError> {
        let raw = self.link.get_u32(&mut self.bus, ds406::POSITION_VALUE, 0)?;
        self.position = raw;
        Ok(raw)
    }

    /// 运动预检：继续朝 `dir` 方向运动是否安全
    ///
    /// `Damaged` 最先判，保证受损后不再碰总线。
    fn check_move(&mut self, dir: i16) -> Result<(), DriverError> {
        if !self.motor_ready {
            return Err(DriverError::NotReady("motor"));
        }
        if self.status == SysStatus::Damaged {
            return Err(DriverError::Damaged);
        }
        let esw = match self.end_switches() {
            Ok(esw) => esw,
            Err(e) => {
                self.status = SysStatus::Error;
                self.publish();
                return Err(e);
            },
        };
        self.esw = esw;
        match esw {
            EswState::Inactive => {
                if !self.encoder_ready {
                    return Ok(());
                }
                let _ = self.read_position();
                let posmm = self.position_mm();
                if posmm <= self.cfg.focus.min_mm && dir < 0 {
                    return Err(DriverError::Safety("already at lower travel limit"));
                }
                if posmm >= self.cfg.focus.max_mm && dir > 0 {
                    return Err(DriverError::Safety("already at upper travel limit"));
                }
                Ok(())
            },
            EswState::BothActive => {
                self.status = SysStatus::Damaged;
                self.publish();
                Err(DriverError::Damaged)
            },
            EswState::CcwActive if dir < 0 => {
                self.status = SysStatus::EndSwitch;
                self.publish();
                Err(DriverError::Safety("move into active CCW end-switch"))
            },
            EswState::CwActive if dir > 0 => {
                self.status = SysStatus::EndSwitch;
                self.publish();
                Err(DriverError::Safety("move into active CW end-switch"))
            },
            // 背离触发中的限位运动是允许的（脱出路径）
            _ => Ok(()),
        }
    }

    /// 刷新位置与状态（周期轮询和命令应答共用）
    ///
    /// 限位状态与位置联合判定；处于行程边界外还在朝外运动时
    /// 保护性停车并进入 `Forbidden`。返回当前位置（mm）。
    pub fn refresh(&mut self) -> Result<f64, DriverError> {
        if !self.encoder_ready {
            return Err(DriverError::NotReady("encoder"));
        }
        // 受损闩锁：不重判、不碰总线
        if self.status == SysStatus::Damaged {
            return Err(DriverError::Damaged);
        }
        let pos_result = self.read_position();
        let posmm = self.position_mm();

        match self.end_switches() {
            Err(e) => {
                warn!("cannot read end switches: {}", e);
                self.status = SysStatus::Error;
            },
            Ok(esw) => {
                self.esw = esw;
                self.status = match esw {
                    EswState::Inactive => SysStatus::Ok,
                    EswState::BothActive => {
                        warn!("both end switches active");
                        SysStatus::Damaged
                    },
                    EswState::CcwActive => {
                        if self.position as i64 > self.cfg.focus.ccw_zone_raw() {
                            warn!(
                                "CCW end-switch active at {:.3} mm, outside its zone",
                                posmm
                            );
                            SysStatus::Damaged
                        } else {
                            SysStatus::EndSwitch
                        }
                    },
                    EswState::CwActive => {
                        if (self.position as i64) < self.cfg.focus.cw_zone_raw() {
                            warn!("CW end-switch active at {:.3} mm, outside its zone", posmm);
                            SysStatus::Damaged
                        } else {
                            SysStatus::EndSwitch
                        }
                    },
                };
            },
        }

        if self.target_raw_speed != 0 {
            let outward = (posmm <= self.cfg.focus.min_mm && self.target_raw_speed < 0)
                || (posmm >= self.cfg.focus.max_mm && self.target_raw_speed > 0);
            if outward {
                warn!("moving outward at travel limit ({:.3} mm), stopping", posmm);
                let _ = self.stop();
                self.status = SysStatus::Forbidden;
            }
        } else if posmm <= self.cfg.focus.min_mm || posmm >= self.cfg.focus.max_mm {
            // 静止但在边界上：确保驱动器确实停着
            let _ = self.stop();
        }

        self.publish();
        pos_result.map(|_| posmm)
    }

    /// 停车（停车斜坡）
    pub fn stop(&mut self) -> Result<(), DriverError> {
        if !self.motor_ready {
            return Ok(());
        }
        self.motor
            .exchange_control(&mut self.bus, ControlWord::STOP, 0)?;
        self.target_raw_speed = 0;
        Ok(())
    }

    /// 停车并等位置读数稳定（编码器连续两次读数一致）
    pub fn wait_till_stop(&mut self) -> Result<(), DriverError> {
        if self.motor_ready {
            let need_stop = self.target_raw_speed != 0
                || match self.motor_speed() {
                    Ok(speed) => speed.abs() > f64::EPSILON,
                    Err(_) => true,
                };
            if need_stop && self.stop().is_err() {
                if let Err(e) = self.stop() {
                    self.status = SysStatus::Error;
                    self.publish();
                    return Err(e);
                }
            }
        }
        let deadline = Instant::now() + self.cfg.timing.settle_timeout();
        loop {
            let before = self.position;
            spin_sleep::sleep(self.cfg.timing.settle_interval());
            if !self.encoder_ready {
                break;
            }
            let _ = self.read_position();
            if self.position == before {
                break;
            }
            if Instant::now() >= deadline {
                return Err(DriverError::MoveTimeout);
            }
        }
        Ok(())
    }

    /// 以恒定转速运动（转速夹取到工作区间，符号保留）
    ///
    /// 没有目标位置：越界保护由周期 `refresh` 负责。
    pub fn constant_speed(&mut self, rpm: i16) -> Result<(), DriverError> {
        if !self.motor_ready {
            return Err(DriverError::NotReady("motor"));
        }
        self.check_move(rpm)?;
        let clamped = self.cfg.speed.clamp_rpm(rpm);
        let raw = self.cfg.speed.rpm_to_raw(clamped);
        self.target_raw_speed = raw;
        let send = if self.cfg.speed.reverse { -raw } else { raw };
        if let Err(e) = self
            .motor
            .exchange_control(&mut self.bus, ControlWord::ENABLE, send)
        {
            warn!("cannot start motor: {}", e);
            self.target_raw_speed = 0;
            return Err(e);
        }
        info!("constant speed {clamped} rpm");
        Ok(())
    }

    /// 闭环趋近目标计数：到达修正带即停车
    ///
    /// 退出条件（任意一个）：剩余距离进入制动修正带、越过目标
    /// 超限、剩余距离连续不减超限、总时限、急停标志。
    /// 所有退出路径都先停车。
    pub fn move_raw(&mut self, target: i64, raw_speed: i16) -> Result<(), DriverError> {
        if !self.motor_ready {
            return Err(DriverError::NotReady("motor"));
        }
        if !self.encoder_ready {
            return Err(DriverError::NotReady("encoder"));
        }
        if raw_speed == 0 {
            return Err(DriverError::Safety("zero speed requested"));
        }
        let tolerance = self.cfg.focus.tolerance_raw;
        let mut olddiff = (target - self.position as i64).abs();
        if olddiff < tolerance {
            debug!("already at target ({} counts away)", olddiff);
            return Ok(());
        }
        if self.emergency.load(Ordering::Acquire) {
            return Err(DriverError::Stopped);
        }
        self.check_move(raw_speed)?;

        self.target_raw_speed = raw_speed;
        let send = if self.cfg.speed.reverse { -raw_speed } else { raw_speed };
        if let Err(e) = self
            .motor
            .exchange_control(&mut self.bus, ControlWord::ENABLE, send)
        {
            let _ = self.stop();
            return Err(e);
        }

        let correction = self.cfg.stopping.correction(raw_speed);
        let start = Instant::now();
        let deadline = start + self.cfg.timing.move_timeout();
        let accel_window = self.cfg.timing.accel_window();
        let mut errctr: u32 = 0;
        let mut passctr: u32 = 0;
        let mut timed_out = true;

        while Instant::now() < deadline {
            if self.emergency.load(Ordering::Acquire) {
                warn!("move aborted by stop request");
                let _ = self.stop();
                return Err(DriverError::Stopped);
            }
            let speed = match self.motor_speed() {
                Ok(speed) => speed,
                Err(e) => {
                    error!("lost drive speed readout: {}", e);
                    let _ = self.stop();
                    self.status = SysStatus::Error;
                    self.publish();
                    return Err(e);
                },
            };
            if let Err(e) = self.check_move(raw_speed) {
                let _ = self.stop();
                return Err(e);
            }
            if speed.abs() < 0.1 && start.elapsed() > accel_window {
                let _ = self.stop();
                self.status = SysStatus::Error;
                self.publish();
                return Err(DriverError::Stall);
            }
            if self.read_position().is_err() {
                continue;
            }
            let diff = (target - self.position as i64).abs();
            if diff < correction {
                timed_out = false;
                break;
            }
            if diff > olddiff {
                passctr += 1;
                if passctr > self.cfg.timing.overshoot_limit {
                    warn!("went past target, stopping");
                    timed_out = false;
                    break;
                }
            }
            if diff >= olddiff {
                errctr += 1;
                if errctr > self.cfg.timing.stall_limit {
                    warn!("distance to target not shrinking, stopping");
                    timed_out = false;
                    break;
                }
            } else {
                errctr = 0;
            }
            olddiff = diff;
        }

        if timed_out {
            let _ = self.stop();
            self.status = SysStatus::Error;
            self.publish();
            return Err(DriverError::MoveTimeout);
        }
        if self.stop().is_err() {
            self.stop()?;
        }
        self.wait_till_stop()?;
        let final_diff = (target - self.position as i64).abs();
        if final_diff > tolerance {
            debug!("stopped {} counts from target", final_diff);
        }
        self.status = SysStatus::Ok;
        self.publish();
        Ok(())
    }

    /// 两段式定位：粗趋近到目标前的提前量，再以最低速从同侧进入
    ///
    /// 精定位始终沿计数增大方向进行，保证消隙和制动特性一致；
    /// 粗定位越过提前点则整次定位判失败。
    pub fn move_to(&mut self, target_mm: f64) -> Result<(), DriverError> {
        if !self.motor_ready {
            return Err(DriverError::NotReady("motor"));
        }
        if !self.encoder_ready {
            return Err(DriverError::NotReady("encoder"));
        }
        if self.status == SysStatus::Damaged {
            return Err(DriverError::Damaged);
        }
        if !self.cfg.focus.in_range(target_mm) {
            return Err(DriverError::OutOfRange {
                value: target_mm,
                min: self.cfg.focus.min_mm,
                max: self.cfg.focus.max_mm,
            });
        }
        let current_mm = self.refresh()?;
        let target = self.cfg.focus.mm_to_raw(target_mm);
        let tolerance = self.cfg.focus.tolerance_raw;
        if (target - self.position as i64).abs() < tolerance {
            debug!("already at {:.3} mm", target_mm);
            return Ok(());
        }
        info!("moving {:.3} -> {:.3} mm", current_mm, target_mm);

        // 粗定位目标：目标前的提前点
        let approach = target - self.cfg.focus.fine_approach_raw;
        let distance = (approach - self.position as i64).abs();
        let sign: i16 = if approach > self.position as i64 { 1 } else { -1 };
        let rough_rpm = sign * self.cfg.speed.tier_rpm(distance);

        if target > self.position as i64 {
            // 从下方接近：已在提前量带内（档位掉到低速）就直接精定位
            if rough_rpm > self.cfg.speed.min_rpm * 3 / 2 {
                self.move_raw(approach, self.cfg.speed.rpm_to_raw(rough_rpm))?;
            }
        } else {
            self.move_raw(approach, self.cfg.speed.rpm_to_raw(rough_rpm))?;
        }

        self.read_position()?;
        if (target - self.position as i64).abs() < tolerance {
            self.status = SysStatus::Ok;
            self.publish();
            return Ok(());
        }
        if self.position as i64 > target {
            return Err(DriverError::Overshoot {
                target: target as u32,
                actual: self.position,
            });
        }

        // 精定位：最低速、沿计数增大方向
        self.move_raw(target, self.cfg.speed.rpm_to_raw(self.cfg.speed.min_rpm))?;
        self.read_position()?;
        let final_diff = (target - self.position as i64).abs();
        if final_diff > tolerance {
            return Err(DriverError::MissedTarget {
                target: target as u32,
                actual: self.position,
            });
        }
        info!("at {:.3} mm ({} counts off)", self.position_mm(), final_diff);
        Ok(())
    }

    /// 从触发的限位开关脱出
    ///
    /// 临时撤销该输入的 enable-stop 角色，背离开关小步运动，
    /// 直到开关释放或尝试次数用尽；结束后恢复角色配置。
    pub fn go_out_from_esw(&mut self) -> Result<(), DriverError> {
        if !self.encoder_ready || !self.motor_ready {
            return Ok(());
        }
        self.check_esw_roles().map_err(|e| {
            self.status = SysStatus::Error;
            self.publish();
            e
        })?;
        let _ = self.refresh();
        if self.status == SysStatus::Damaged {
            return Err(DriverError::Damaged);
        }
        let mut esw = self.esw;
        match esw {
            EswState::Inactive => {
                self.status = SysStatus::Ok;
                self.publish();
                return Ok(());
            },
            EswState::BothActive => {
                self.status = SysStatus::Damaged;
                self.publish();
                return Err(DriverError::Damaged);
            },
            EswState::CwActive if (self.position as i64) < self.cfg.focus.cw_zone_raw() => {
                self.status = SysStatus::Damaged;
                self.publish();
                return Err(DriverError::Damaged);
            },
            EswState::CcwActive if self.position as i64 > self.cfg.focus.ccw_zone_raw() => {
                self.status = SysStatus::Damaged;
                self.publish();
                return Err(DriverError::Damaged);
            },
            _ => {},
        }

        self.status = SysStatus::Recovering;
        self.publish();
        let (role_index, dir): (u16, i64) = match esw {
            EswState::CwActive => (param::DI04_ROLE, -1),
            _ => (param::DI05_ROLE, 1),
        };
        info!(
            "leaving {} end-switch at {:.3} mm",
            if dir < 0 { "CW" } else { "CCW" },
            self.position_mm()
        );
        if let Err(e) = self
            .motor
            .write_param(&mut self.bus, 0, role_index, param::ROLE_NONE)
        {
            self.status = SysStatus::Error;
            self.publish();
            return Err(e);
        }

        let speed = dir as i16 * self.cfg.speed.rpm_to_raw(self.cfg.speed.esw_rpm);
        let step = (self.cfg.timing.recover_step_mm * self.cfg.focus.scale_per_mm) as i64;
        for attempt in 1..=self.cfg.timing.recover_attempts {
            let _ = self.read_position();
            let target = (self.position as i64 + dir * step)
                .clamp(self.cfg.focus.min_raw(), self.cfg.focus.max_raw());
            debug!("recovery attempt {attempt}: step to {target}");
            if let Err(e) = self.move_raw(target, speed) {
                warn!("recovery step failed: {}", e);
            }
            match self.end_switches() {
                Ok(now) => {
                    esw = now;
                    self.esw = now;
                    if now == EswState::Inactive {
                        break;
                    }
                },
                Err(e) => warn!("cannot read end switches during recovery: {}", e),
            }
        }

        self.check_esw_roles().map_err(|e| {
            self.status = SysStatus::Error;
            self.publish();
            e
        })?;
        if esw != EswState::Inactive {
            self.status = SysStatus::Error;
            self.publish();
            return Err(DriverError::Safety("cannot leave end-switch"));
        }
        self.status = SysStatus::Ok;
        self.publish();
        info!("end-switch released, position {:.3} mm", self.position_mm());
        Ok(())
    }

    /// 操作员显式解除受损闩锁，按当前开关状态重新评估
    ///
    /// 唯一能让 `Damaged` 退出的路径（重新初始化除外）。调用方
    /// 必须确认机构与开关已检查正常。
    pub fn reset_damage(&mut self) -> Result<f64, DriverError> {
        if self.status == SysStatus::Damaged {
            warn!("damage latch cleared by operator");
            self.status = SysStatus::Error;
            self.publish();
        }
        self.refresh()
    }

    /// 编码器退回 pre-operational；可选写入断电保持的预置值
    pub fn return_preoper(&mut self, preset: Option<u32>) -> Result<(), DriverError> {
        if !self.encoder_ready {
            return Ok(());
        }
        self.link
            .send_nmt(&mut self.bus, NmtCommand::PreOperational)?;
        match self.link.node_state(&mut self.bus)? {
            Some(NodeState::PreOperational) => {},
            other => warn!("node did not return to pre-operational ({other:?})"),
        }
        self.encoder_ready = false;
        if let Some(value) = preset {
            let stored = self
                .link
                .set_u32(&mut self.bus, ds406::CONF_PARAMETERS, 2, value)
                .and_then(|()| {
                    self.link
                        .set_u8(&mut self.bus, ds406::CONF_VALID, 0, ds406::CONF_VALID_MAGIC)
                })
                .and_then(|()| {
                    self.link
                        .set_u32(&mut self.bus, ds406::CONF_PARAMETERS, 3, !value)
                });
            match stored {
                Ok(()) => info!("preset value {} stored", value),
                Err(e) => warn!("cannot store preset value: {}", e),
            }
        }
        Ok(())
    }

    /// 当前 (位置 mm, 转速 rpm)，不可用的子系统给降级值
    pub fn pos_speed(&mut self) -> (f64, f64) {
        let posmm = if self.encoder_ready {
            let _ = self.read_position();
            self.position_mm()
        } else {
            3.0
        };
        let mut rpm = if self.motor_ready {
            self.motor_speed().unwrap_or(0.0)
        } else {
            0.0
        };
        if self.cfg.speed.reverse {
            rpm = -rpm;
        }
        (posmm, rpm)
    }

    /// 标定辅助：起动到给定转速并记录加速、恒速、制动三段的
    /// 位置/转速轨迹（用于拟合制动修正多项式）
    pub fn monitor_speed(&mut self, rpm: i16) -> Result<(), DriverError> {
        if !self.motor_ready {
            return Err(DriverError::NotReady("motor"));
        }
        let clamped = self.cfg.speed.clamp_rpm(rpm);
        self.check_move(clamped)?;
        let raw = self.cfg.speed.rpm_to_raw(clamped);
        self.target_raw_speed = raw;
        let send = if self.cfg.speed.reverse { -raw } else { raw };
        self.motor
            .exchange_control(&mut self.bus, ControlWord::ENABLE, send)?;

        let tick = self.cfg.timing.settle_interval();
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(4) {
            let (posmm, speed) = self.pos_speed();
            info!(phase = "accel", t_ms = start.elapsed().as_millis() as u64, position = posmm, speed);
            if speed.abs() >= clamped.unsigned_abs() as f64 {
                break;
            }
            spin_sleep::sleep(tick);
        }
        let constant = Instant::now();
        while constant.elapsed() < Duration::from_secs(3) {
            let (posmm, speed) = self.pos_speed();
            info!(phase = "constant", t_ms = start.elapsed().as_millis() as u64, position = posmm, speed);
            spin_sleep::sleep(tick);
        }
        self.stop()?;
        let braking = Instant::now();
        while braking.elapsed() < Duration::from_secs(4) {
            let (posmm, speed) = self.pos_speed();
            info!(phase = "braking", t_ms = start.elapsed().as_millis() as u64, position = posmm, speed);
            if speed.abs() < f64::EPSILON {
                break;
            }
            spin_sleep::sleep(tick);
        }
        self.wait_till_stop()?;
        self.status = SysStatus::Ok;
        self.publish();
        Ok(())
    }
}
