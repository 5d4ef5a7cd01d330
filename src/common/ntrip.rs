//! NTRIP 协议客户端模块
//! 构建 NTRIP v1 流请求并校验 Caster 握手响应

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};

use super::error::ConnectionError;

/// 历史上两种被接受的 200 OK 标记 (NTRIP v1 的 ICY 和 HTTP 风格)
pub const ACCEPT_MARKERS: [&[u8]; 2] = [b"ICY 200 OK", b"200 OK"];

/// 握手响应状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    /// 接受，开始推送数据流
    Ok,
    /// 未授权
    Unauthorized,
    /// 挂载点未找到
    MountPointNotFound,
    /// 其他无法识别的响应
    Other(String),
}

impl ResponseStatus {
    /// 根据握手响应头字节判定状态
    pub fn from_header(header: &[u8]) -> Self {
        // 只看 200 OK 标记，状态行其余部分不参与判定
        if ACCEPT_MARKERS.iter().any(|m| contains(header, m)) {
            return ResponseStatus::Ok;
        }
        let line = status_line(header);
        let lower = line.to_ascii_lowercase();
        if lower.contains("401") || lower.contains("unauthorized") {
            ResponseStatus::Unauthorized
        } else if lower.contains("404") {
            ResponseStatus::MountPointNotFound
        } else {
            ResponseStatus::Other(line)
        }
    }

    /// 是否被接受
    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseStatus::Ok)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStatus::Ok => write!(f, "200 OK"),
            ResponseStatus::Unauthorized => write!(f, "401 Unauthorized"),
            ResponseStatus::MountPointNotFound => write!(f, "Mount Point Not Found"),
            ResponseStatus::Other(line) if line.is_empty() => write!(f, "empty response"),
            ResponseStatus::Other(line) => write!(f, "{}", line),
        }
    }
}

/// NTRIP 流请求
#[derive(Debug, Clone)]
pub struct StreamRequest<'a> {
    /// 挂载点 (不含前导 '/')
    pub mount: &'a str,
    /// 用户名
    pub username: &'a str,
    /// 密码
    pub password: &'a str,
    /// User-Agent 头
    pub user_agent: &'a str,
}

impl StreamRequest<'_> {
    /// 构建请求字节
    pub fn encode(&self) -> Bytes {
        let credentials = BASE64.encode(format!("{}:{}", self.username, self.password));
        let mount = self.mount.trim_start_matches('/');

        let mut request = BytesMut::with_capacity(128 + mount.len() + credentials.len());
        request.put_slice(format!("GET /{} HTTP/1.0\r\n", mount).as_bytes());
        request.put_slice(format!("User-Agent: {}\r\n", self.user_agent).as_bytes());
        request.put_slice(format!("Authorization: Basic {}\r\n", credentials).as_bytes());
        request.put_slice(b"\r\n");
        request.freeze()
    }
}

/// 校验握手响应头，非 200 一律视为拒绝
pub fn check_response(header: &[u8]) -> Result<(), ConnectionError> {
    let status = ResponseStatus::from_header(header);
    if status.is_ok() {
        Ok(())
    } else {
        Err(ConnectionError::Rejected {
            status_line: status.to_string(),
        })
    }
}

/// 默认 User-Agent
pub fn default_user_agent() -> String {
    format!("NTRIP-Monitor/{}", env!("CARGO_PKG_VERSION"))
}

fn status_line(header: &[u8]) -> String {
    let end = header
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(header.len());
    String::from_utf8_lossy(&header[..end]).trim().to_string()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::FailureKind;

    #[test]
    fn request_has_fixed_layout() {
        let req = StreamRequest {
            mount: "/RTCM3",
            username: "user",
            password: "pass",
            user_agent: "NTRIP-Monitor/0.1.0",
        };
        assert_eq!(
            &req.encode()[..],
            b"GET /RTCM3 HTTP/1.0\r\nUser-Agent: NTRIP-Monitor/0.1.0\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n"
        );
    }

    #[test]
    fn icy_and_http_ok_accepted() {
        assert!(check_response(b"ICY 200 OK\r\n\r\n").is_ok());
        assert!(check_response(b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\n").is_ok());
    }

    #[test]
    fn unauthorized_rejected_as_authentication_failure() {
        let err = check_response(b"401 Unauthorized").unwrap_err();
        assert_eq!(err.kind(), FailureKind::AuthenticationFailed);
        match err {
            ConnectionError::Rejected { status_line } => assert_eq!(status_line, "401 Unauthorized"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn acceptance_is_marker_based() {
        // 含 200 OK 标记的源表回复同样被接受
        assert!(check_response(b"SOURCETABLE 200 OK\r\nServer: x\r\n\r\n").is_ok());

        let status = ResponseStatus::from_header(b"HTTP/1.1 404 Not Found\r\n");
        assert_eq!(status, ResponseStatus::MountPointNotFound);
        assert!(check_response(b"").is_err());
    }
}
