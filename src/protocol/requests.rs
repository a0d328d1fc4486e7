//! Typed view of the standard channel requests (RFC 4254 section 6)

use crate::error::{Error, Result};
use crate::protocol::payload::{PayloadReader, PayloadWriter};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Terminal mode list terminator
const TTY_OP_END: u8 = 0;

/// Opcodes from 160 upward are undefined and end mode parsing
const TTY_OP_MAX: u8 = 159;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    Pty {
        term: String,
        cols: u32,
        rows: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(u8, u32)>,
    },
    Shell,
    /// Command bytes as sent; not necessarily UTF-8
    Exec {
        command: Bytes,
    },
    Subsystem {
        name: String,
    },
    Env {
        name: String,
        value: String,
    },
    X11 {
        single_connection: bool,
        protocol: String,
        cookie: String,
        screen: u32,
    },
    WindowChange {
        cols: u32,
        rows: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal {
        name: String,
    },
    AuthAgent,
    ExitStatus {
        code: u32,
    },
    ExitSignal {
        name: String,
        core_dumped: bool,
        message: String,
        lang: String,
    },
}

impl ChannelRequest {
    /// Decode a request; unknown kinds yield `None`
    pub fn decode(kind: &str, payload: &[u8]) -> Result<Option<Self>> {
        let mut r = PayloadReader::new(payload);
        let request = match kind {
            "pty-req" => ChannelRequest::Pty {
                term: r.read_string()?,
                cols: r.read_u32()?,
                rows: r.read_u32()?,
                pix_width: r.read_u32()?,
                pix_height: r.read_u32()?,
                modes: decode_modes(r.read_bytes()?)?,
            },
            "shell" => ChannelRequest::Shell,
            "exec" => ChannelRequest::Exec {
                command: Bytes::copy_from_slice(r.read_bytes()?),
            },
            "subsystem" => ChannelRequest::Subsystem {
                name: r.read_string()?,
            },
            "env" => ChannelRequest::Env {
                name: r.read_string()?,
                value: r.read_string()?,
            },
            "x11-req" => ChannelRequest::X11 {
                single_connection: r.read_bool()?,
                protocol: r.read_string()?,
                cookie: r.read_string()?,
                screen: r.read_u32()?,
            },
            "window-change" => ChannelRequest::WindowChange {
                cols: r.read_u32()?,
                rows: r.read_u32()?,
                pix_width: r.read_u32()?,
                pix_height: r.read_u32()?,
            },
            "signal" => ChannelRequest::Signal {
                name: r.read_string()?,
            },
            "auth-agent-req@openssh.com" => ChannelRequest::AuthAgent,
            "exit-status" => ChannelRequest::ExitStatus { code: r.read_u32()? },
            "exit-signal" => ChannelRequest::ExitSignal {
                name: r.read_string()?,
                core_dumped: r.read_bool()?,
                message: r.read_string()?,
                lang: r.read_string()?,
            },
            _ => return Ok(None),
        };
        Ok(Some(request))
    }

    /// Wire name of the request
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelRequest::Pty { .. } => "pty-req",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::Subsystem { .. } => "subsystem",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::X11 { .. } => "x11-req",
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::Signal { .. } => "signal",
            ChannelRequest::AuthAgent => "auth-agent-req@openssh.com",
            ChannelRequest::ExitStatus { .. } => "exit-status",
            ChannelRequest::ExitSignal { .. } => "exit-signal",
        }
    }

    /// Whether OpenSSH clients ask for a reply to this request
    pub fn wants_reply(&self) -> bool {
        !matches!(
            self,
            ChannelRequest::Env { .. }
                | ChannelRequest::WindowChange { .. }
                | ChannelRequest::Signal { .. }
                | ChannelRequest::ExitStatus { .. }
                | ChannelRequest::ExitSignal { .. }
        )
    }

    /// Build an `exec` request from a command line
    pub fn exec(command: &str) -> Self {
        ChannelRequest::Exec {
            command: Bytes::copy_from_slice(command.as_bytes()),
        }
    }

    pub fn encode(&self) -> Bytes {
        let w = PayloadWriter::new();
        let w = match self {
            ChannelRequest::Pty {
                term,
                cols,
                rows,
                pix_width,
                pix_height,
                modes,
            } => w
                .put_string(term)
                .put_u32(*cols)
                .put_u32(*rows)
                .put_u32(*pix_width)
                .put_u32(*pix_height)
                .put_bytes(&encode_modes(modes)),
            ChannelRequest::Shell | ChannelRequest::AuthAgent => w,
            ChannelRequest::Exec { command } => w.put_bytes(command),
            ChannelRequest::Subsystem { name } => w.put_string(name),
            ChannelRequest::Env { name, value } => w.put_string(name).put_string(value),
            ChannelRequest::X11 {
                single_connection,
                protocol,
                cookie,
                screen,
            } => w
                .put_bool(*single_connection)
                .put_string(protocol)
                .put_string(cookie)
                .put_u32(*screen),
            ChannelRequest::WindowChange {
                cols,
                rows,
                pix_width,
                pix_height,
            } => w
                .put_u32(*cols)
                .put_u32(*rows)
                .put_u32(*pix_width)
                .put_u32(*pix_height),
            ChannelRequest::Signal { name } => w.put_string(name),
            ChannelRequest::ExitStatus { code } => w.put_u32(*code),
            ChannelRequest::ExitSignal {
                name,
                core_dumped,
                message,
                lang,
            } => w
                .put_string(name)
                .put_bool(*core_dumped)
                .put_string(message)
                .put_string(lang),
        };
        w.finish()
    }
}

fn decode_modes(mut buf: &[u8]) -> Result<Vec<(u8, u32)>> {
    let mut modes = Vec::new();
    while buf.has_remaining() {
        let opcode = buf.get_u8();
        if opcode == TTY_OP_END || opcode > TTY_OP_MAX {
            break;
        }
        if buf.remaining() < 4 {
            return Err(Error::InvalidMessage(format!(
                "terminal mode {} truncated",
                opcode
            )));
        }
        modes.push((opcode, buf.get_u32()));
    }
    Ok(modes)
}

fn encode_modes(modes: &[(u8, u32)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(modes.len() * 5 + 1);
    for (opcode, value) in modes {
        buf.put_u8(*opcode);
        buf.put_u32(*value);
    }
    buf.put_u8(TTY_OP_END);
    buf.freeze()
}

/// Payload of `tcpip-forward` and `cancel-tcpip-forward`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub address: String,
    pub port: u32,
}

impl ForwardRequest {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            address: r.read_string()?,
            port: r.read_u32()?,
        })
    }

    pub fn encode(&self) -> Bytes {
        PayloadWriter::new()
            .put_string(&self.address)
            .put_u32(self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pty_request_with_modes() {
        let req = ChannelRequest::Pty {
            term: "xterm-256color".to_string(),
            cols: 120,
            rows: 40,
            pix_width: 0,
            pix_height: 0,
            modes: vec![(53, 1), (128, 38400)],
        };
        let payload = req.encode();
        let decoded = ChannelRequest::decode("pty-req", &payload).unwrap().unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_decode_exec() {
        let payload = PayloadWriter::new().put_string("scp -t /tmp").finish();
        let decoded = ChannelRequest::decode("exec", &payload).unwrap();
        assert_eq!(decoded, Some(ChannelRequest::exec("scp -t /tmp")));
    }

    #[test]
    fn test_exec_keeps_non_utf8_bytes() {
        let raw = &b"cat /tmp/caf\xe9.txt"[..];
        let payload = PayloadWriter::new().put_bytes(raw).finish();
        let decoded = ChannelRequest::decode("exec", &payload).unwrap().unwrap();
        assert_eq!(
            decoded,
            ChannelRequest::Exec {
                command: Bytes::from_static(raw)
            }
        );
        assert_eq!(decoded.encode(), payload);
    }

    #[test]
    fn test_decode_unknown_kind() {
        assert_eq!(
            ChannelRequest::decode("keepalive@openssh.com", &[]).unwrap(),
            None
        );
    }

    #[test]
    fn test_decode_truncated_window_change() {
        let payload = PayloadWriter::new().put_u32(80).finish();
        assert!(ChannelRequest::decode("window-change", &payload).is_err());
    }

    #[test]
    fn test_wants_reply() {
        assert!(ChannelRequest::Shell.wants_reply());
        assert!(
            !ChannelRequest::Env {
                name: "A".into(),
                value: "b".into()
            }
            .wants_reply()
        );
        assert!(!ChannelRequest::ExitStatus { code: 0 }.wants_reply());
    }

    #[test]
    fn test_forward_request() {
        let req = ForwardRequest {
            address: "0.0.0.0".to_string(),
            port: 8080,
        };
        assert_eq!(ForwardRequest::decode(&req.encode()).unwrap(), req);
    }
}
