//! # zfocus
//!
//! Z1000 望远镜调焦器的命令行入口，三种运行方式：
//!
//! - **服务模式**（`--server`）：打开 CAN 总线，常驻运行 TCP 命令
//!   服务与周期轮询，直到 SIGINT/SIGTERM；
//! - **独立模式**（`--standalone`）：不经服务端直接操作总线，执行
//!   一条命令后退出（调试与标定用）；
//! - **远程模式**（默认）：作为客户端把命令发给运行中的服务。

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zfocus_can::SocketCanAdapter;
use zfocus_driver::{Focuser, FocuserConfig, MoveOutcome, DEFAULT_INTERFACE};
use zfocus_server::client::send_command;
use zfocus_server::{poll_loop, FocusServer, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "zfocus", version, about = "Z1000 telescope focuser control")]
struct Cli {
    /// CAN 接口（服务/独立模式）
    #[arg(short, long, default_value = DEFAULT_INTERFACE)]
    interface: String,

    /// 配置文件（TOML，缺省字段取标定默认值）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 编码器节点号（覆盖配置）
    #[arg(long)]
    node: Option<u8>,

    /// 电机驱动器地址（覆盖配置）
    #[arg(long)]
    motor_addr: Option<u8>,

    /// 启动时复位编码器节点
    #[arg(long)]
    reset: bool,

    /// 服务模式：常驻运行 TCP 命令服务
    #[arg(short, long)]
    server: bool,

    /// 独立模式：直接操作总线执行一条命令
    #[arg(long)]
    standalone: bool,

    /// 服务端口
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// 远程模式的服务主机
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// 定位到绝对位置（mm）
    #[arg(short, long = "goto", value_name = "MM", conflicts_with = "targspeed")]
    goto_pos: Option<f64>,

    /// 恒速运动（rpm，带符号）
    #[arg(short, long)]
    targspeed: Option<f64>,

    /// 停止运动
    #[arg(long)]
    stop: bool,

    /// 查询系统状态
    #[arg(long)]
    status: bool,

    /// 查询行程与速度限制
    #[arg(long)]
    limits: bool,

    /// 查询限位开关状态（独立模式）
    #[arg(long)]
    esw_state: bool,

    /// 解除受损闩锁并重新评估（确认机构正常后使用）
    #[arg(long)]
    reset_damage: bool,

    /// 速度监测（rpm，标定用，独立模式）
    #[arg(long, value_name = "RPM")]
    monitor: Option<i16>,

    /// 焦点值落盘文件（服务模式）
    #[arg(long)]
    focus_file: Option<PathBuf>,

    /// 日志文件（默认 stderr）
    #[arg(short, long)]
    logfile: Option<PathBuf>,

    /// 详细日志（-v debug，-vv trace）
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(cli: &Cli) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("zfocus={default_level},{default_level}")));

    if let Some(path) = &cli.logfile {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(None)
    }
}

fn load_config(cli: &Cli) -> Result<FocuserConfig> {
    let mut cfg = match &cli.config {
        Some(path) => FocuserConfig::from_toml_file(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => FocuserConfig::default(),
    };
    if let Some(node) = cli.node {
        cfg.node = node;
    }
    if let Some(addr) = cli.motor_addr {
        cfg.motor_addr = addr;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn open_focuser(cli: &Cli, cfg: FocuserConfig) -> Result<Arc<Focuser<SocketCanAdapter>>> {
    let adapter = SocketCanAdapter::new(cli.interface.as_str())?;
    let focuser = Focuser::new(adapter, cfg)?;
    focuser
        .startup(cli.reset)
        .context("focuser initialization failed")?;
    Ok(focuser)
}

fn run_server(cli: &Cli, cfg: FocuserConfig) -> Result<()> {
    let focuser = open_focuser(cli, cfg)?;
    let server = FocusServer::bind(Arc::clone(&focuser), ("0.0.0.0", cli.port))?;
    info!("command server on port {}", cli.port);

    let running = Arc::new(AtomicBool::new(true));
    let stop_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        stop_flag.store(false, Ordering::Release);
    })
    .context("cannot install signal handler")?;

    let accept_handle = server.spawn(Arc::clone(&running));
    poll_loop(
        Arc::clone(&focuser),
        Arc::clone(&running),
        Duration::from_millis(100),
        cli.focus_file.clone(),
    );

    let _ = accept_handle.join();
    info!("shutting down");
    focuser.shutdown(None);
    Ok(())
}

fn run_standalone(cli: &Cli, cfg: FocuserConfig) -> Result<()> {
    let focuser = open_focuser(cli, cfg)?;
    // 动力命令退出时不回收节点：targspeed 让电机保持运转
    let mut leave_running = false;

    if cli.reset_damage {
        focuser.reset_damage()?;
    }
    if cli.stop {
        focuser.emergency_stop()?;
    } else if let Some(rpm) = cli.monitor {
        focuser.with_supervisor(|sup| sup.monitor_speed(rpm))?;
    } else if let Some(target) = cli.goto_pos {
        match focuser.goto_mm(target) {
            MoveOutcome::Started => {},
            MoveOutcome::Busy => bail!("another motion in progress"),
            MoveOutcome::Rejected(e) => return Err(e.into()),
        }
        while focuser.is_moving() {
            std::thread::sleep(Duration::from_millis(200));
            info!("position {:.3} mm", focuser.position_mm());
        }
        focuser.wait_idle();
    } else if let Some(rpm) = cli.targspeed {
        focuser.constant_speed(rpm as i16)?;
        leave_running = true;
    }

    if cli.esw_state {
        let esw = focuser.with_supervisor(|sup| sup.end_switches())?;
        println!("esw: {esw:?}");
    }
    if cli.status {
        let (status, moving) = focuser.status();
        println!("{}", zfocus_server::command::status_text(status, moving));
    }
    println!("{:.3}", focuser.position_mm());

    if !leave_running {
        focuser.shutdown(None);
    }
    Ok(())
}

fn run_remote(cli: &Cli) -> Result<()> {
    let command = if cli.stop {
        "stop".to_string()
    } else if cli.reset_damage {
        "reset".to_string()
    } else if cli.status {
        "status".to_string()
    } else if cli.limits {
        "limits".to_string()
    } else if let Some(target) = cli.goto_pos {
        format!("goto={target}")
    } else if let Some(rpm) = cli.targspeed {
        format!("targspeed={rpm}")
    } else {
        "focus".to_string()
    };
    let reply = send_command(&cli.host, cli.port, &command, Duration::from_secs(5))
        .with_context(|| format!("cannot reach {}:{}", cli.host, cli.port))?;
    println!("{reply}");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;

    if cli.server && cli.standalone {
        bail!("--server and --standalone are mutually exclusive");
    }
    if cli.server {
        let cfg = load_config(&cli)?;
        run_server(&cli, cfg)
    } else if cli.standalone {
        let cfg = load_config(&cli)?;
        run_standalone(&cli, cfg)
    } else {
        run_remote(&cli)
    }
}
