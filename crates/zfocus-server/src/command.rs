//! 命令协议：请求解析与应答词汇
//!
//! 行协议，命令关键字按前缀匹配；带 `=` 的命令取等号后的十进制值。
//! 同一端口同时接受裸 TCP 与简易 HTTP（GET/POST）：HTTP 请求取
//! URL 路径（去掉前导 `/`）作为命令，应答包上最小 HTTP 头（带 CORS）。

use zfocus_driver::SysStatus;

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 4444;

/// 应答词汇
pub const ANS_OK: &str = "OK";
pub const ANS_ERR: &str = "error";
pub const ANS_MOVING: &str = "moving";

/// 解析后的请求
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Request {
    /// 查询当前焦点位置（空命令等价）
    Focus,
    /// 急停
    Stop,
    /// 恒速运动（rpm，带符号）
    TargSpeed(f64),
    /// 定位到绝对位置（mm）
    Goto(f64),
    /// 查询系统状态
    Status,
    /// 查询行程与速度限制
    Limits,
    /// 解除受损闩锁（操作员确认机构正常后）
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Parsed {
    /// `None` 表示命令无法识别（应答 `error`）
    pub request: Option<Request>,
    /// 经 HTTP 到达，应答需要包 HTTP 头
    pub web: bool,
}

pub fn parse_request(raw: &str) -> Parsed {
    let trimmed = raw.trim();
    let (command, web) = if trimmed.starts_with("GET ") || trimmed.starts_with("POST ") {
        let path = trimmed
            .split_whitespace()
            .nth(1)
            .and_then(|p| p.strip_prefix('/'))
            .unwrap_or("");
        (path, true)
    } else {
        (trimmed, false)
    };
    Parsed {
        request: parse_command(command),
        web,
    }
}

fn parse_command(command: &str) -> Option<Request> {
    if command.is_empty() || command.starts_with("focus") {
        return Some(Request::Focus);
    }
    if command.starts_with("limits") {
        return Some(Request::Limits);
    }
    if command.starts_with("status") {
        return Some(Request::Status);
    }
    if command.starts_with("stop") {
        return Some(Request::Stop);
    }
    if command.starts_with("reset") {
        return Some(Request::Reset);
    }
    if let Some(value) = command.strip_prefix("targspeed=") {
        return value.trim().parse().ok().map(Request::TargSpeed);
    }
    if let Some(value) = command.strip_prefix("goto=") {
        return value.trim().parse().ok().map(Request::Goto);
    }
    None
}

/// 状态字符串；运动中的正常状态上报 `moving`
pub fn status_text(status: SysStatus, moving: bool) -> &'static str {
    match status {
        SysStatus::Ok if moving => ANS_MOVING,
        SysStatus::Ok => "ok",
        SysStatus::EndSwitch => "esw-active",
        SysStatus::Recovering => "recovering",
        SysStatus::Error => "error",
        SysStatus::Forbidden => "forbidden",
        SysStatus::Damaged => "damaged",
    }
}

/// 最小 HTTP 应答（跨域放开，网页端直接取数）
pub fn http_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST\r\n\
         Access-Control-Allow-Credentials: true\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_commands() {
        assert_eq!(parse_request("focus").request, Some(Request::Focus));
        assert_eq!(parse_request("").request, Some(Request::Focus));
        assert_eq!(parse_request("  status \r\n").request, Some(Request::Status));
        assert_eq!(parse_request("stop").request, Some(Request::Stop));
        assert_eq!(parse_request("reset").request, Some(Request::Reset));
        assert_eq!(parse_request("limits").request, Some(Request::Limits));
        assert_eq!(parse_request("goto=40.5").request, Some(Request::Goto(40.5)));
        assert_eq!(
            parse_request("targspeed=-400").request,
            Some(Request::TargSpeed(-400.0))
        );
    }

    #[test]
    fn invalid_commands_rejected() {
        assert_eq!(parse_request("fly").request, None);
        assert_eq!(parse_request("goto=").request, None);
        assert_eq!(parse_request("goto=abc").request, None);
        assert_eq!(parse_request("targspeed=1e999999").request, Some(Request::TargSpeed(f64::INFINITY)));
    }

    #[test]
    fn http_request_takes_path_as_command() {
        let parsed = parse_request("GET /goto=40.5 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(parsed.web);
        assert_eq!(parsed.request, Some(Request::Goto(40.5)));

        let parsed = parse_request("POST /status HTTP/1.1\r\n\r\n");
        assert!(parsed.web);
        assert_eq!(parsed.request, Some(Request::Status));

        // 根路径：位置查询
        let parsed = parse_request("GET / HTTP/1.1\r\n\r\n");
        assert_eq!(parsed.request, Some(Request::Focus));
    }

    #[test]
    fn status_vocabulary() {
        assert_eq!(status_text(SysStatus::Ok, false), "ok");
        assert_eq!(status_text(SysStatus::Ok, true), "moving");
        assert_eq!(status_text(SysStatus::Damaged, true), "damaged");
        assert_eq!(status_text(SysStatus::EndSwitch, false), "esw-active");
        assert_eq!(status_text(SysStatus::Recovering, true), "recovering");
        assert_eq!(status_text(SysStatus::Forbidden, false), "forbidden");
    }

    #[test]
    fn http_wrapping() {
        let reply = http_response("42.000");
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Access-Control-Allow-Origin: *"));
        assert!(reply.contains("Content-Length: 6"));
        assert!(reply.ends_with("\r\n\r\n42.000"));
    }
}
