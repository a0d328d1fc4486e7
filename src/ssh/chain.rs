//! Byte streams that reach a target through something other than a
//! plain TCP dial
//!
//! - [`RemoteCommandStream`]: a command run on a proxy account's host,
//!   its stdin/stdout being the connection
//! - [`LocalCommandStream`]: a local process spawned from the target's
//!   proxy command

use crate::error::{Error, Result};
use regex::Regex;
use russh::ChannelMsg;
use russh::client;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf,
};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

/// Command run on a proxy account's host when the target names no command
pub const DEFAULT_REMOTE_COMMAND: &str = "nc {{host}} {{port}}";

/// How long `close` waits for a command to exit
const CLOSE_GRACE: Duration = Duration::from_secs(5);

const PIPE_CAPACITY: usize = 64 * 1024;

/// Placeholders accepted in proxy command templates, with the legacy
/// `{{.host}}` spelling
const PLACEHOLDER: &str = r"\{\{\s*\.?(host|port)\s*\}\}";

/// Substitute the destination into a proxy command template
///
/// No quoting is applied: the template comes from the operator and the
/// host name from the account service.
pub fn render_proxy_command(template: &str, host: &str, port: u16) -> Result<String> {
    let re = Regex::new(PLACEHOLDER)?;
    let port = port.to_string();
    Ok(re
        .replace_all(template, |caps: &regex::Captures<'_>| match &caps[1] {
            "host" => host.to_string(),
            _ => port.clone(),
        })
        .into_owned())
}

/// Outcome of a proxy command, resolved once the command has exited
///
/// Dropping it before then kills a local command.
pub struct CommandExit {
    command: String,
    status: oneshot::Receiver<Result<()>>,
}

impl CommandExit {
    fn new(command: &str) -> (oneshot::Sender<Result<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        let exit = Self {
            command: command.to_string(),
            status: rx,
        };
        (tx, exit)
    }

    /// Wait up to `grace` for the command to exit
    ///
    /// A non-zero exit status is reported as an error.
    pub async fn wait(self, grace: Duration) -> Result<()> {
        let Self { command, status } = self;
        match tokio::time::timeout(grace, status).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ProxyCommand(format!("{}: exit status lost", command))),
            Err(_) => Err(Error::ProxyCommand(format!("{}: still running after {:?}", command, grace))),
        }
    }
}

/// Translate a remote exit status
fn exit_result(command: &str, exit_status: u32) -> Result<()> {
    match exit_status {
        0 => Ok(()),
        code => Err(Error::ProxyCommand(format!("{} exited with {}", command, code))),
    }
}

/// Connection carried by a command on a proxy host
pub struct RemoteCommandStream {
    stream: DuplexStream,
    exit: Option<CommandExit>,
}

impl RemoteCommandStream {
    /// Run `command` in a new session channel of `session`
    ///
    /// The proxy connection lives until the command's channel closes.
    pub async fn exec<H>(session: client::Handle<H>, command: &str) -> Result<Self>
    where
        H: client::Handler + Send + 'static,
    {
        let mut channel = session.channel_open_session().await?;
        channel.exec(true, command).await?;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => break,
                Some(ChannelMsg::Failure) => {
                    return Err(Error::ProxyCommand(format!("remote refused: {}", command)));
                }
                Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) | None => {
                    return Err(Error::ProxyCommand(format!("channel closed: {}", command)));
                }
                Some(_) => {}
            }
        }
        info!(command, "remote proxy command started");

        let (stream, local) = tokio::io::duplex(PIPE_CAPACITY);
        let (status, exit) = CommandExit::new(command);
        tokio::spawn(run_remote(session, channel, local, command.to_string(), status));
        Ok(Self {
            stream,
            exit: Some(exit),
        })
    }

    /// Detach the command's exit so it can be awaited after the stream is gone
    pub fn take_exit(&mut self) -> Option<CommandExit> {
        self.exit.take()
    }

    /// Send EOF, then wait for the remote command to exit
    pub async fn close(mut self) -> Result<()> {
        self.shutdown().await?;
        let mut rest = Vec::new();
        self.read_to_end(&mut rest).await?;
        if !rest.is_empty() {
            debug!(unread = rest.len(), "proxy command output discarded on close");
        }
        match self.exit.take() {
            Some(exit) => exit.wait(CLOSE_GRACE).await,
            None => Ok(()),
        }
    }
}

/// Shuttle bytes between the remote command's channel and the local end of
/// the stream, then report how the command ended
async fn run_remote<H: client::Handler>(
    session: client::Handle<H>,
    mut channel: russh::Channel<client::Msg>,
    local: DuplexStream,
    command: String,
    mut status: oneshot::Sender<Result<()>>,
) {
    let (mut from_local, mut to_local) = tokio::io::split(local);
    let mut writer = channel.make_writer();
    let mut upload = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut from_local, &mut writer).await;
        let _ = writer.flush().await;
        copied
    });
    let mut upload_done = false;
    let mut outcome = None;
    let mut forwarding = true;

    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if forwarding && to_local.write_all(&data).await.is_err() {
                        trace!(command = %command, "stream dropped, output discarded");
                        forwarding = false;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    debug!(command = %command, "proxy command: {}", String::from_utf8_lossy(&data).trim_end());
                }
                Some(ChannelMsg::Eof) => {
                    let _ = to_local.shutdown().await;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    outcome = Some(exit_result(&command, exit_status));
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    outcome = Some(Err(Error::ProxyCommand(format!("{} killed by {:?}", command, signal_name))));
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            copied = &mut upload, if !upload_done => {
                upload_done = true;
                if let Ok(Err(e)) = copied {
                    debug!(command = %command, error = %e, "proxy command input ended with error");
                }
                let _ = channel.eof().await;
            }
            _ = status.closed() => {
                debug!(command = %command, "proxy command abandoned");
                break;
            }
        }
    }
    upload.abort();
    let _ = channel.close().await;
    drop(session);

    let outcome = outcome
        .unwrap_or_else(|| Err(Error::ProxyCommand(format!("{} ended without exit status", command))));
    let _ = status.send(outcome);
}

impl AsyncRead for RemoteCommandStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for RemoteCommandStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Connection carried by a local process's stdin and stdout
///
/// The process is killed once nothing waits for its exit: when the stream
/// is dropped with its [`CommandExit`] attached, or when a taken
/// [`CommandExit`] is dropped.
pub struct LocalCommandStream {
    stdin: ChildStdin,
    stdout: ChildStdout,
    exit: Option<CommandExit>,
}

impl LocalCommandStream {
    /// Spawn `command`, split shell-style; no shell is involved
    pub fn spawn(command: &str) -> Result<Self> {
        let argv = shlex::split(command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| Error::ProxyCommand(format!("cannot parse: {}", command)))?;

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProxyCommand(format!("{}: {}", argv[0], e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ProxyCommand("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProxyCommand("stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            let program = argv[0].clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(program = %program, "proxy command: {}", line);
                }
            });
        }
        info!(command, pid = ?child.id(), "local proxy command started");

        let (status, exit) = CommandExit::new(command);
        tokio::spawn(watch_child(child, command.to_string(), status));
        Ok(Self {
            stdin,
            stdout,
            exit: Some(exit),
        })
    }

    /// Detach the process's exit so it can be awaited after the stream is gone
    pub fn take_exit(&mut self) -> Option<CommandExit> {
        self.exit.take()
    }

    /// Close stdin, then wait for the process to exit
    ///
    /// A non-zero exit status is reported as an error.
    pub async fn close(mut self) -> Result<()> {
        self.stdin.shutdown().await?;
        match self.exit.take() {
            Some(exit) => exit.wait(CLOSE_GRACE).await,
            None => Ok(()),
        }
    }
}

async fn watch_child(mut child: Child, command: String, mut status: oneshot::Sender<Result<()>>) {
    let result = tokio::select! {
        exited = child.wait() => match exited {
            Ok(code) if code.success() => Ok(()),
            Ok(code) => Err(Error::ProxyCommand(format!("{} exited with {}", command, code))),
            Err(e) => Err(Error::Io(e)),
        },
        _ = status.closed() => {
            debug!(command = %command, "proxy command abandoned, killing it");
            let _ = child.kill().await;
            return;
        }
    };
    let _ = status.send(result);
}

impl AsyncRead for LocalCommandStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for LocalCommandStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}
