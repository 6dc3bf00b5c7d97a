//! TCP 命令服务端与周期轮询
//!
//! 线程模型：监听线程 accept，每连接一个处理线程；连接空闲 5 秒
//! 关闭。HTTP 请求一问一答后立即关闭。运动命令只是受理（受理结果
//! 立即应答），执行在调焦器自己的运动线程里。

use crate::command::{http_response, parse_request, Request, ANS_ERR, ANS_MOVING, ANS_OK};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zfocus_can::CanAdapter;
use zfocus_driver::{DriverError, Focuser, MoveOutcome};

/// 连接空闲超时
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);
/// accept 轮询间隔（监听套接字为非阻塞，便于优雅退出）
const ACCEPT_INTERVAL: Duration = Duration::from_millis(50);

/// 调焦器命令服务
pub struct FocusServer<A: CanAdapter + Send + 'static> {
    focuser: Arc<Focuser<A>>,
    listener: TcpListener,
}

impl<A: CanAdapter + Send + 'static> FocusServer<A> {
    pub fn bind(focuser: Arc<Focuser<A>>, addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("listening on {}", listener.local_addr()?);
        Ok(Self { focuser, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 启动 accept 循环；`running` 清零后退出
    pub fn spawn(self, running: Arc<AtomicBool>) -> JoinHandle<()> {
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("connection from {}", peer);
                        let focuser = Arc::clone(&self.focuser);
                        thread::spawn(move || handle_client(stream, focuser));
                    },
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_INTERVAL);
                    },
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        thread::sleep(ACCEPT_INTERVAL);
                    },
                }
            }
            info!("command server stopped");
        })
    }
}

fn handle_client<A: CanAdapter + Send + 'static>(mut stream: TcpStream, focuser: Arc<Focuser<A>>) {
    if stream.set_read_timeout(Some(Duration::from_millis(100))).is_err() {
        return;
    }
    let mut buf = [0u8; 512];
    let mut deadline = Instant::now() + IDLE_TIMEOUT;
    loop {
        if Instant::now() >= deadline {
            debug!("connection idle, closing");
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                let parsed = parse_request(&text);
                let mut body = dispatch(&focuser, parsed.request);
                let reply = if parsed.web {
                    http_response(&body)
                } else {
                    if !body.ends_with('\n') {
                        body.push('\n');
                    }
                    body
                };
                if stream.write_all(reply.as_bytes()).is_err() {
                    break;
                }
                if parsed.web {
                    break;
                }
                deadline = Instant::now() + IDLE_TIMEOUT;
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {},
            Err(_) => break,
        }
    }
}

fn dispatch<A: CanAdapter + Send + 'static>(
    focuser: &Arc<Focuser<A>>,
    request: Option<Request>,
) -> String {
    let Some(request) = request else {
        return ANS_ERR.into();
    };
    match request {
        Request::Focus => format!("{:.3}", focuser.position_mm()),
        Request::Limits => {
            let cfg = focuser.config();
            format!(
                "focmin={}\nfocmax={}\nminspeed={}\nmaxspeed={}\n",
                cfg.focus.min_mm, cfg.focus.max_mm, cfg.speed.min_rpm, cfg.speed.max_rpm
            )
        },
        Request::Status => {
            let (status, moving) = focuser.status();
            crate::command::status_text(status, moving).into()
        },
        Request::Reset => match focuser.reset_damage() {
            Ok(()) => ANS_OK.into(),
            Err(e) => {
                warn!("damage reset failed: {}", e);
                ANS_ERR.into()
            },
        },
        Request::Stop => match focuser.emergency_stop() {
            Ok(()) => ANS_OK.into(),
            Err(e) => {
                warn!("stop failed: {}", e);
                ANS_ERR.into()
            },
        },
        Request::TargSpeed(rpm) => {
            let cfg = focuser.config();
            if !rpm.is_finite()
                || rpm.abs() < cfg.speed.min_rpm as f64
                || rpm.abs() > cfg.speed.max_rpm as f64
            {
                return ANS_ERR.into();
            }
            match focuser.constant_speed(rpm as i16) {
                Ok(()) => ANS_OK.into(),
                Err(DriverError::Busy) => ANS_MOVING.into(),
                Err(e) => {
                    warn!("constant speed {} rpm refused: {}", rpm, e);
                    ANS_ERR.into()
                },
            }
        },
        Request::Goto(target) => match focuser.goto_mm(target) {
            MoveOutcome::Started => ANS_OK.into(),
            MoveOutcome::Busy => ANS_MOVING.into(),
            MoveOutcome::Rejected(e) => {
                warn!("goto {} mm refused: {}", target, e);
                ANS_ERR.into()
            },
        },
    }
}

/// 周期轮询循环：刷新状态、限位自恢复、焦点值落盘
///
/// `focus_file` 给出时，位置变化超过 1μm 就原子地重写该文件
/// （其他程序以只读方式取当前焦点值）。
pub fn poll_loop<A: CanAdapter + Send + 'static>(
    focuser: Arc<Focuser<A>>,
    running: Arc<AtomicBool>,
    interval: Duration,
    focus_file: Option<PathBuf>,
) {
    let mut last_written = f64::NAN;
    while running.load(Ordering::Acquire) {
        thread::sleep(interval);
        let Some(snapshot) = focuser.poll() else {
            continue;
        };
        if let Some(path) = &focus_file {
            if (snapshot.position_mm - last_written).abs() > 0.001 || last_written.is_nan() {
                match write_focus_file(path, snapshot.position_mm) {
                    Ok(()) => last_written = snapshot.position_mm,
                    Err(e) => warn!("cannot update {}: {}", path.display(), e),
                }
            }
        }
    }
}

/// 临时文件 + rename，读者永远看到完整内容
fn write_focus_file(path: &PathBuf, position_mm: f64) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, format!("FOCUS   = {position_mm:.3}\n"))?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn focus_file_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("focus.dat");
        write_focus_file(&path, 41.9995).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "FOCUS   = 42.000\n");
        write_focus_file(&path, 40.0).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "FOCUS   = 40.000\n");
    }
}
