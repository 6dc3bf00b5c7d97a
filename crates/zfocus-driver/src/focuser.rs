//! 并发外壳：总线互斥、运动互斥、急停与后台运动线程
//!
//! 两级互斥：
//!
//! - **总线域**（`supervisor` 互斥锁）：一次只有一个线程做 CAN 交换；
//! - **运动域**（`motion_busy` 原子标志）：一次只有一个运动在进行，
//!   只用 CAS 尝试获取，占用中立即返回 `Busy`，绝不排队等待。
//!
//! 急停不依赖运动域：置急停标志后等总线域。运动循环每圈检查
//! 标志，发现置位立即停车、报 `Stopped` 并释放总线域，急停随即
//! 拿到总线下发硬件停车命令。位置与状态经 `ArcSwap` 快照发布，
//! 读取方不碰任何锁。

use crate::config::FocuserConfig;
use crate::error::DriverError;
use crate::supervisor::{Snapshot, Supervisor, SysStatus};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use zfocus_can::CanAdapter;

/// 运动请求的受理结果
#[derive(Debug)]
pub enum MoveOutcome {
    /// 已受理，后台线程执行中
    Started,
    /// 另一个运动正在进行
    Busy,
    /// 预检拒绝
    Rejected(DriverError),
}

/// 线程安全的调焦器句柄
pub struct Focuser<A: CanAdapter + Send + 'static> {
    supervisor: Mutex<Supervisor<A>>,
    /// 运动域占用标志（CAS 获取，持有者负责释放）
    motion_busy: AtomicBool,
    emergency: Arc<AtomicBool>,
    snapshot: Arc<ArcSwap<Snapshot>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cfg: FocuserConfig,
}

impl<A: CanAdapter + Send + 'static> Focuser<A> {
    pub fn new(bus: A, cfg: FocuserConfig) -> Result<Arc<Self>, DriverError> {
        let emergency = Arc::new(AtomicBool::new(false));
        let snapshot = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
        let supervisor = Supervisor::new(bus, cfg.clone(), Arc::clone(&emergency), Arc::clone(&snapshot))?;
        Ok(Arc::new(Self {
            supervisor: Mutex::new(supervisor),
            motion_busy: AtomicBool::new(false),
            emergency,
            snapshot,
            worker: Mutex::new(None),
            cfg,
        }))
    }

    pub fn config(&self) -> &FocuserConfig {
        &self.cfg
    }

    /// 初始化编码器与电机，必要时从限位脱出
    pub fn startup(&self, reset: bool) -> Result<(), DriverError> {
        let mut sup = self.supervisor.lock();
        sup.init_encoder(reset)?;
        sup.init_motor()?;
        sup.refresh()?;
        Ok(())
    }

    /// 最近发布的状态快照（无锁）
    pub fn snapshot(&self) -> Snapshot {
        **self.snapshot.load()
    }

    pub fn position_mm(&self) -> f64 {
        self.snapshot().position_mm
    }

    pub fn is_moving(&self) -> bool {
        self.motion_busy.load(Ordering::Acquire)
    }

    /// (系统状态, 是否在运动)
    pub fn status(&self) -> (SysStatus, bool) {
        (self.snapshot().status, self.is_moving())
    }

    fn acquire_motion(&self) -> bool {
        self.motion_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_motion(&self) {
        self.motion_busy.store(false, Ordering::Release);
    }

    fn track_worker(&self, handle: JoinHandle<()>) {
        let mut slot = self.worker.lock();
        if let Some(previous) = slot.take() {
            let _ = previous.join();
        }
        *slot = Some(handle);
    }

    /// 等后台运动线程退出（测试与关机用）
    pub fn wait_idle(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// 定位到绝对位置（mm），后台执行
    pub fn goto_mm(self: &Arc<Self>, target_mm: f64) -> MoveOutcome {
        if !self.cfg.focus.in_range(target_mm) {
            return MoveOutcome::Rejected(DriverError::OutOfRange {
                value: target_mm,
                min: self.cfg.focus.min_mm,
                max: self.cfg.focus.max_mm,
            });
        }
        if !self.acquire_motion() {
            return MoveOutcome::Busy;
        }
        let this = Arc::clone(self);
        let handle = thread::spawn(move || {
            let result = {
                let mut sup = this.supervisor.lock();
                sup.move_to(target_mm)
            };
            if let Err(e) = result {
                warn!("move to {:.3} mm failed: {}", target_mm, e);
                // 受损或人为急停后不自动脱出
                if !matches!(e, DriverError::Damaged | DriverError::Stopped) {
                    let mut sup = this.supervisor.lock();
                    if let Err(e2) = sup.go_out_from_esw() {
                        warn!("recovery after failed move: {}", e2);
                    }
                }
            }
            this.release_motion();
        });
        self.track_worker(handle);
        MoveOutcome::Started
    }

    /// 恒速运动；运动域占用中返回 `Busy`
    ///
    /// 命令下发即返回，驱动器保持转速；越界保护由周期轮询负责。
    pub fn constant_speed(&self, rpm: i16) -> Result<(), DriverError> {
        if !self.acquire_motion() {
            return Err(DriverError::Busy);
        }
        let result = {
            let mut sup = self.supervisor.lock();
            sup.constant_speed(rpm)
        };
        self.release_motion();
        result
    }

    /// 急停：置标志让进行中的运动循环让出总线，再下发停车
    pub fn emergency_stop(&self) -> Result<(), DriverError> {
        info!("emergency stop requested");
        self.emergency.store(true, Ordering::Release);
        let result = {
            let mut sup = self.supervisor.lock();
            sup.stop()
        };
        self.emergency.store(false, Ordering::Release);
        result
    }

    /// 后台执行限位脱出；运动域占用中返回 false
    pub fn recover(self: &Arc<Self>) -> bool {
        if !self.acquire_motion() {
            return false;
        }
        let this = Arc::clone(self);
        let handle = thread::spawn(move || {
            let result = {
                let mut sup = this.supervisor.lock();
                sup.go_out_from_esw()
            };
            if let Err(e) = result {
                warn!("end-switch recovery failed: {}", e);
            }
            this.release_motion();
        });
        self.track_worker(handle);
        true
    }

    /// 周期轮询：刷新位置/状态，限位触发时自动发起脱出
    ///
    /// 总线域占用中（运动循环在跑）直接跳过本轮。
    pub fn poll(self: &Arc<Self>) -> Option<Snapshot> {
        let status = {
            let mut sup = self.supervisor.try_lock()?;
            let _ = sup.refresh();
            sup.status()
        };
        if status == SysStatus::EndSwitch && self.recover() {
            debug!("end-switch active, recovery started");
        }
        Some(self.snapshot())
    }

    /// 显式解除受损闩锁并按当前开关状态重新评估
    ///
    /// `Damaged` 绝不自行清除；操作员检查机构后调用本方法恢复。
    /// 开关读数仍然矛盾时闩锁立即重新落下。
    pub fn reset_damage(&self) -> Result<(), DriverError> {
        let mut sup = self.supervisor.lock();
        sup.reset_damage().map(|_| ())
    }

    /// 关机：停车、编码器退回 pre-operational（可选写预置值）
    pub fn shutdown(&self, preset: Option<u32>) {
        self.wait_idle();
        let mut sup = self.supervisor.lock();
        if let Err(e) = sup.stop() {
            warn!("stop on shutdown failed: {}", e);
        }
        if let Err(e) = sup.return_preoper(preset) {
            warn!("cannot return encoder to pre-operational: {}", e);
        }
    }

    /// 在总线域内直接操作监督器（标定与诊断命令用）
    pub fn with_supervisor<R>(&self, f: impl FnOnce(&mut Supervisor<A>) -> R) -> R {
        let mut sup = self.supervisor.lock();
        f(&mut sup)
    }
}
