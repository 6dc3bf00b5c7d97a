//! 模拟设备上的整机行为测试

use std::sync::Arc;
use std::time::{Duration, Instant};
use zfocus_can::MockCanAdapter;
use zfocus_driver::config::{FocuserConfig, TimingConfig};
use zfocus_driver::sim::SimDevice;
use zfocus_driver::{DriverError, Focuser, MoveOutcome, SysStatus};

fn test_config() -> FocuserConfig {
    let mut cfg = FocuserConfig::default();
    cfg.timing = TimingConfig {
        poll_interval_ms: 1,
        sdo_timeout_ms: 50,
        sdo_slow_timeout_ms: 50,
        guard_timeout_ms: 50,
        boot_timeout_ms: 50,
        motor_timeout_ms: 50,
        move_timeout_s: 20,
        settle_interval_ms: 2,
        settle_timeout_s: 5,
        ..TimingConfig::default()
    };
    cfg
}

fn started_at(mm: f64) -> (SimDevice, Arc<Focuser<MockCanAdapter>>) {
    let cfg = test_config();
    let sim = SimDevice::new(cfg.node, cfg.motor_addr);
    sim.set_position_mm(&cfg.focus, mm);
    let focuser = Focuser::new(sim.adapter(), cfg).unwrap();
    focuser.startup(false).unwrap();
    (sim, focuser)
}

fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// 发往控制通道的使能帧（运动命令）
fn enable_frames(sim: &SimDevice, po: u32) -> Vec<i16> {
    sim.adapter()
        .sent()
        .into_iter()
        .filter(|f| f.id == po && f.data[1] & 0x06 == 0x06)
        .map(|f| i16::from_be_bytes([f.data[2], f.data[3]]))
        .collect()
}

#[test]
fn startup_reads_identity_and_position() {
    let (_sim, focuser) = started_at(42.0);
    let snap = focuser.snapshot();
    assert_eq!(snap.status, SysStatus::Ok);
    assert!((snap.position_mm - 42.0).abs() < 0.001, "pos {}", snap.position_mm);
    assert!(!focuser.is_moving());
}

#[test]
fn wrong_profile_never_started() {
    let cfg = test_config();
    let sim = SimDevice::new(cfg.node, cfg.motor_addr);
    sim.state().devtype = (1 << 16) | 405;
    let focuser = Focuser::new(sim.adapter(), cfg).unwrap();
    assert!(matches!(focuser.startup(false), Err(DriverError::WrongDevice(_))));
    // 身份不符的节点绝不能收到 NMT start
    let started = sim
        .adapter()
        .sent()
        .iter()
        .any(|f| f.id == 0 && f.data[0] == 0x01);
    assert!(!started);
}

#[test]
fn goto_two_phase_converges_from_above() {
    let (sim, focuser) = started_at(42.0);
    assert!(matches!(focuser.goto_mm(40.0), MoveOutcome::Started));
    focuser.wait_idle();

    let snap = focuser.snapshot();
    assert_eq!(snap.status, SysStatus::Ok);
    assert!((snap.position_mm - 40.0).abs() < 0.003, "pos {}", snap.position_mm);

    // 粗定位向下（负速度、高档位），精定位始终沿计数增大方向低速进行
    let speeds = enable_frames(&sim, 99);
    assert!(speeds.iter().any(|s| *s < -1750), "no rough leg in {speeds:?}");
    assert_eq!(*speeds.last().unwrap(), 1750);
}

#[test]
fn goto_two_phase_converges_from_below() {
    let (sim, focuser) = started_at(40.0);
    assert!(matches!(focuser.goto_mm(42.0), MoveOutcome::Started));
    focuser.wait_idle();
    let snap = focuser.snapshot();
    assert_eq!(snap.status, SysStatus::Ok);
    assert!((snap.position_mm - 42.0).abs() < 0.003, "pos {}", snap.position_mm);
    let speeds = enable_frames(&sim, 99);
    assert!(speeds.iter().all(|s| *s > 0));
}

#[test]
fn goto_at_target_produces_no_motion() {
    let (sim, focuser) = started_at(42.0);
    let before = enable_frames(&sim, 99).len();
    assert!(matches!(focuser.goto_mm(42.0), MoveOutcome::Started));
    focuser.wait_idle();
    assert_eq!(enable_frames(&sim, 99).len(), before);
    assert!((focuser.position_mm() - 42.0).abs() < 0.001);
}

#[test]
fn goto_out_of_range_rejected_without_traffic() {
    let (sim, focuser) = started_at(42.0);
    let before = sim.frames_sent();
    assert!(matches!(
        focuser.goto_mm(80.0),
        MoveOutcome::Rejected(DriverError::OutOfRange { .. })
    ));
    assert!(matches!(
        focuser.goto_mm(1.0),
        MoveOutcome::Rejected(DriverError::OutOfRange { .. })
    ));
    assert_eq!(sim.frames_sent(), before);
}

#[test]
fn concurrent_goto_is_busy() {
    let (sim, focuser) = started_at(42.0);
    sim.state().read_delay = Some(Duration::from_millis(1));
    assert!(matches!(focuser.goto_mm(43.0), MoveOutcome::Started));
    wait_until("motion to start", || focuser.is_moving());
    assert!(matches!(focuser.goto_mm(41.0), MoveOutcome::Busy));
    assert!(matches!(focuser.constant_speed(400), Err(DriverError::Busy)));
    focuser.wait_idle();
    assert!((focuser.position_mm() - 43.0).abs() < 0.003);
}

#[test]
fn emergency_stop_aborts_move() {
    let (sim, focuser) = started_at(42.0);
    sim.state().read_delay = Some(Duration::from_millis(1));
    assert!(matches!(focuser.goto_mm(43.0), MoveOutcome::Started));
    wait_until("motion to start", || focuser.is_moving());
    std::thread::sleep(Duration::from_millis(50));

    focuser.emergency_stop().unwrap();
    focuser.wait_idle();
    assert!(!focuser.is_moving());
    assert!(!sim.state().enabled);
    // 急停不是故障：状态保持正常
    assert_eq!(focuser.snapshot().status, SysStatus::Ok);
    let pos = focuser.with_supervisor(|sup| sup.refresh().unwrap());
    assert!((41.9..=43.01).contains(&pos), "stopped at {pos}");
}

#[test]
fn constant_speed_clamped_to_working_range() {
    let (sim, focuser) = started_at(42.0);
    focuser.constant_speed(100).unwrap();
    assert_eq!(sim.state().raw_speed, 1750);
    focuser.constant_speed(5000).unwrap();
    assert_eq!(sim.state().raw_speed, 6000);
    focuser.constant_speed(-100).unwrap();
    assert_eq!(sim.state().raw_speed, -1750);
    focuser.emergency_stop().unwrap();
    assert!(!sim.state().enabled);
}

#[test]
fn outward_motion_at_limit_refused() {
    let (sim, focuser) = started_at(76.0);
    let enables_before = enable_frames(&sim, 99).len();
    assert!(matches!(
        focuser.constant_speed(400),
        Err(DriverError::Safety(_))
    ));
    assert_eq!(enable_frames(&sim, 99).len(), enables_before);
    // 向内运动仍然允许
    focuser.constant_speed(-400).unwrap();
    assert_eq!(sim.state().raw_speed, -2000);
    focuser.emergency_stop().unwrap();
}

#[test]
fn poll_stops_runaway_and_flags_forbidden() {
    let cfg = test_config();
    let sim = SimDevice::new(cfg.node, cfg.motor_addr);
    sim.state().position = cfg.focus.max_raw() - 3;
    let focuser = Focuser::new(sim.adapter(), cfg).unwrap();
    focuser.startup(false).unwrap();

    focuser.constant_speed(400).unwrap();
    // 轮询发现越过上限：保护性停车并进入 forbidden
    let mut status = SysStatus::Ok;
    for _ in 0..20 {
        if let Some(snap) = focuser.poll() {
            status = snap.status;
            if status == SysStatus::Forbidden {
                break;
            }
        }
    }
    assert_eq!(status, SysStatus::Forbidden);
    assert!(!sim.state().enabled);
    // 停车后下一轮轮询回到正常
    let snap = focuser.poll().unwrap();
    assert_eq!(snap.status, SysStatus::Ok);
}

#[test]
fn both_end_switches_mean_damaged_and_silence() {
    let (sim, focuser) = started_at(42.0);
    sim.state().force_inputs = Some(0);
    focuser.poll().unwrap();
    assert_eq!(focuser.snapshot().status, SysStatus::Damaged);

    let before = sim.frames_sent();
    assert!(matches!(focuser.goto_mm(40.0), MoveOutcome::Started));
    focuser.wait_idle();
    assert_eq!(sim.frames_sent(), before, "damaged focuser touched the bus");
    assert!(matches!(focuser.constant_speed(400), Err(DriverError::Damaged)));
    assert_eq!(sim.frames_sent(), before);
}

#[test]
fn damage_latches_until_explicit_reset() {
    let (sim, focuser) = started_at(42.0);
    sim.state().force_inputs = Some(0);
    focuser.poll().unwrap();
    assert_eq!(focuser.snapshot().status, SysStatus::Damaged);

    // 矛盾读数消失也不解除闩锁：后续轮询和运动命令照样拒绝
    sim.state().force_inputs = None;
    focuser.poll().unwrap();
    assert_eq!(focuser.snapshot().status, SysStatus::Damaged);

    let before = sim.frames_sent();
    assert!(matches!(focuser.goto_mm(40.0), MoveOutcome::Started));
    focuser.wait_idle();
    assert_eq!(sim.frames_sent(), before, "damaged focuser touched the bus");
    assert!((focuser.position_mm() - 42.0).abs() < 0.001);

    // 操作员显式复位后恢复工作
    focuser.reset_damage().unwrap();
    assert_eq!(focuser.snapshot().status, SysStatus::Ok);
    assert!(matches!(focuser.goto_mm(40.0), MoveOutcome::Started));
    focuser.wait_idle();
    assert!((focuser.position_mm() - 40.0).abs() < 0.003);
}

#[test]
fn reset_damage_relatches_while_fault_persists() {
    let (sim, focuser) = started_at(42.0);
    sim.state().force_inputs = Some(0);
    focuser.poll().unwrap();
    assert_eq!(focuser.snapshot().status, SysStatus::Damaged);

    // 开关仍然矛盾：复位后闩锁立即重新落下
    focuser.reset_damage().unwrap();
    assert_eq!(focuser.snapshot().status, SysStatus::Damaged);
    assert!(matches!(focuser.constant_speed(400), Err(DriverError::Damaged)));
}

#[test]
fn esw_inside_zone_recovered_on_startup() {
    let cfg = test_config();
    let sim = SimDevice::new(cfg.node, cfg.motor_addr);
    let release_at = cfg.focus.mm_to_raw(3.05);
    sim.set_position_mm(&cfg.focus, 3.0);
    sim.state().ccw_press_below = Some(release_at);

    let focuser = Focuser::new(sim.adapter(), cfg).unwrap();
    focuser.startup(false).unwrap();

    let snap = focuser.snapshot();
    assert_eq!(snap.status, SysStatus::Ok);
    assert!(sim.position() > release_at, "still on switch at {}", sim.position());
    // 脱出期间撤销的 enable-stop 角色已恢复
    assert_eq!(sim.state().di05_role, 1);
    // 脱出用低速、背离开关方向
    let speeds = enable_frames(&sim, 99);
    assert!(speeds.iter().all(|s| *s == 1750), "speeds {speeds:?}");
}

#[test]
fn esw_outside_zone_is_damage() {
    let cfg = test_config();
    let sim = SimDevice::new(cfg.node, cfg.motor_addr);
    sim.set_position_mm(&cfg.focus, 40.0);
    // 行程中段 CCW 限位触发：机构或开关损坏
    sim.state().force_inputs = Some(zfocus_protocol::motor::ESW_CW_BIT);

    let focuser = Focuser::new(sim.adapter(), cfg).unwrap();
    assert!(matches!(focuser.startup(false), Err(DriverError::Damaged)));
    assert_eq!(focuser.snapshot().status, SysStatus::Damaged);
    assert!(enable_frames(&sim, 99).is_empty());
}

#[test]
fn poll_triggers_recovery_when_switch_trips() {
    let cfg = test_config();
    let sim = SimDevice::new(cfg.node, cfg.motor_addr);
    let release_at = cfg.focus.mm_to_raw(3.05);
    sim.set_position_mm(&cfg.focus, 3.2);
    let focuser = Focuser::new(sim.adapter(), cfg).unwrap();
    focuser.startup(false).unwrap();

    // 运行中开关触发（允许区内）
    let calib = focuser.config().focus.clone();
    sim.state().ccw_press_below = Some(release_at);
    sim.set_position_mm(&calib, 3.0);
    focuser.poll().unwrap();
    wait_until("recovery to finish", || !focuser.is_moving());
    focuser.wait_idle();
    assert!(sim.position() > release_at);
    assert_eq!(focuser.snapshot().status, SysStatus::Ok);
}

#[test]
fn shutdown_returns_encoder_to_preoperational() {
    let (sim, focuser) = started_at(42.0);
    focuser.shutdown(Some(4096));
    assert_eq!(sim.state().node_state, 0x7f);
}
