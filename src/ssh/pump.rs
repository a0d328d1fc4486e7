//! Bridges one russh channel to a transport [`ChannelDriver`]
//!
//! Outgoing data runs in its own tasks through the channel's writers so a
//! slow peer never stalls the message loop. The loop itself moves
//! incoming messages to the relay and executes the relay's requests.

use crate::protocol::ChannelRequest;
use bytes::Bytes;
use crate::transport::{ChannelDriver, Control, PendingReply, Request};
use russh::{Channel, ChannelId, ChannelMsg, Pty, Sig, server};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// SSH_EXTENDED_DATA_STDERR
const STDERR: u32 = 1;

/// Longest wait for outgoing data to flush before a channel is closed
const FLUSH_GRACE: Duration = Duration::from_secs(5);

/// Which connection a pumped channel belongs to
#[derive(Clone)]
pub enum Side {
    /// The user's connection; replies and exit status go through the
    /// server handle
    Inbound(server::Handle),
    /// The target connection
    Outbound,
}

/// Run `channel` against `driver` until either end closes
pub async fn pump<S>(mut channel: Channel<S>, driver: ChannelDriver, side: Side)
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    let ChannelDriver {
        kind,
        data_in,
        mut data_out,
        stderr_in,
        mut stderr_out,
        mut control,
        requests,
    } = driver;
    let id = channel.id();
    let mut data_in = Some(data_in);
    let mut stderr_in = Some(stderr_in);

    let mut writer = channel.make_writer();
    let mut stderr_writer = channel.make_writer_ext(Some(STDERR));
    let mut out_task = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut data_out, &mut writer).await;
        let _ = writer.flush().await;
        copied
    });
    let err_task = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut stderr_out, &mut stderr_writer).await;
        let _ = stderr_writer.flush().await;
    });
    let mut out_done = false;

    let replies = match &side {
        Side::Inbound(handle) => Some(spawn_replier(handle.clone(), id)),
        Side::Outbound => None,
    };
    // Requests sent to the peer, answered in order
    let mut pending: VecDeque<Request> = VecDeque::new();

    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Some(w) = data_in.as_mut()
                        && w.write_all(&data).await.is_err()
                    {
                        data_in = None;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext != STDERR {
                        trace!(channel = %kind, ext, "extended data type ignored");
                    } else if let Some(w) = stderr_in.as_mut()
                        && w.write_all(&data).await.is_err()
                    {
                        stderr_in = None;
                    }
                }
                Some(ChannelMsg::Eof) => {
                    trace!(channel = %kind, "peer eof");
                    data_in = None;
                    stderr_in = None;
                }
                Some(ChannelMsg::Close) | None => {
                    trace!(channel = %kind, "peer closed");
                    break;
                }
                Some(ChannelMsg::Success) => {
                    if let Some(req) = pending.pop_front() {
                        req.accept();
                    }
                }
                Some(ChannelMsg::Failure) => {
                    if let Some(req) = pending.pop_front() {
                        req.reject();
                    }
                }
                Some(msg) => match incoming_request(msg) {
                    Some((request, want_reply)) => {
                        // russh answers agent forwarding itself
                        let replied_by_russh = matches!(request, ChannelRequest::AuthAgent);
                        let submitted = requests
                            .submit(request.kind(), want_reply, request.encode())
                            .await;
                        if let (Some(pending_reply), Some(replies)) = (submitted, replies.as_ref())
                            && want_reply
                            && !replied_by_russh
                        {
                            let _ = replies.send(pending_reply);
                        }
                    }
                    None => trace!(channel = %kind, "channel message ignored"),
                },
            },
            copied = &mut out_task, if !out_done => {
                out_done = true;
                if let Ok(Err(e)) = copied {
                    debug!(channel = %kind, error = %e, "outgoing data ended with error");
                }
                let _ = channel.eof().await;
            }
            ctl = control.recv() => match ctl {
                Some(Control::Request(req)) => {
                    send_request(&channel, &side, req, &mut pending).await;
                }
                Some(Control::Close) | None => {
                    if !out_done
                        && let Ok(Ok(Err(e))) = tokio::time::timeout(FLUSH_GRACE, &mut out_task).await
                    {
                        debug!(channel = %kind, error = %e, "outgoing data ended with error");
                    }
                    let _ = tokio::time::timeout(FLUSH_GRACE, err_task).await;
                    let _ = channel.close().await;
                    debug!(channel = %kind, "channel closed");
                    return;
                }
            },
        }
    }

    // Peer gone: anything still queued for it is dropped
    out_task.abort();
    err_task.abort();
    drop(requests);
    for req in pending {
        req.reject();
    }
}

/// Replies to the inbound client's requests, strictly in arrival order
fn spawn_replier(handle: server::Handle, id: ChannelId) -> mpsc::UnboundedSender<PendingReply> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PendingReply>();
    tokio::spawn(async move {
        while let Some(pending) = rx.recv().await {
            let reply = pending.wait().await;
            let sent = if reply.ok {
                handle.channel_success(id).await
            } else {
                handle.channel_failure(id).await
            };
            if sent.is_err() {
                break;
            }
        }
    });
    tx
}

/// Execute a relay request on the russh channel
async fn send_request<S>(channel: &Channel<S>, side: &Side, req: Request, pending: &mut VecDeque<Request>)
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    let request = match ChannelRequest::decode(&req.kind, &req.payload) {
        Ok(Some(request)) => request,
        Ok(None) => {
            warn!(request = %req.kind, "request kind cannot be relayed");
            req.reject();
            return;
        }
        Err(e) => {
            warn!(request = %req.kind, error = %e, "undecodable request");
            req.reject();
            return;
        }
    };
    let want_reply = req.want_reply;

    let sent = match (side, request) {
        (Side::Inbound(handle), ChannelRequest::ExitStatus { code }) => {
            let _ = handle.exit_status_request(channel.id(), code).await;
            return;
        }
        (
            Side::Inbound(handle),
            ChannelRequest::ExitSignal {
                name,
                core_dumped,
                message,
                lang,
            },
        ) => {
            let _ = handle
                .exit_signal_request(channel.id(), sig_from_name(&name), core_dumped, message, lang)
                .await;
            return;
        }
        (Side::Inbound(_), _) | (Side::Outbound, ChannelRequest::ExitStatus { .. } | ChannelRequest::ExitSignal { .. }) => {
            debug!(request = %req.kind, "request not sent in this direction");
            req.reject();
            return;
        }
        (Side::Outbound, ChannelRequest::Pty {
            term,
            cols,
            rows,
            pix_width,
            pix_height,
            modes,
        }) => {
            let modes: Vec<(Pty, u32)> = modes
                .into_iter()
                .filter_map(|(op, value)| Pty::from_u8(op).map(|pty| (pty, value)))
                .collect();
            channel
                .request_pty(want_reply, &term, cols, rows, pix_width, pix_height, &modes)
                .await
        }
        (Side::Outbound, ChannelRequest::Shell) => channel.request_shell(want_reply).await,
        (Side::Outbound, ChannelRequest::Exec { command }) => channel.exec(want_reply, command.to_vec()).await,
        (Side::Outbound, ChannelRequest::Subsystem { name }) => channel.request_subsystem(want_reply, &name).await,
        (Side::Outbound, ChannelRequest::Env { name, value }) => channel.set_env(want_reply, &name, &value).await,
        (Side::Outbound, ChannelRequest::X11 {
            single_connection,
            protocol,
            cookie,
            screen,
        }) => {
            channel
                .request_x11(want_reply, single_connection, &protocol, &cookie, screen)
                .await
        }
        (Side::Outbound, ChannelRequest::WindowChange {
            cols,
            rows,
            pix_width,
            pix_height,
        }) => channel.window_change(cols, rows, pix_width, pix_height).await,
        (Side::Outbound, ChannelRequest::Signal { name }) => channel.signal(sig_from_name(&name)).await,
        (Side::Outbound, ChannelRequest::AuthAgent) => channel.agent_forward(want_reply).await,
    };

    match sent {
        Ok(()) if want_reply => pending.push_back(req),
        Ok(()) => {}
        Err(e) => {
            debug!(request = %req.kind, error = %e, "failed to send request");
            req.reject();
        }
    }
}

/// A channel request received from the peer, with its want-reply flag
fn incoming_request(msg: ChannelMsg) -> Option<(ChannelRequest, bool)> {
    let request = match msg {
        ChannelMsg::RequestPty {
            want_reply,
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            terminal_modes,
        } => (
            ChannelRequest::Pty {
                term,
                cols: col_width,
                rows: row_height,
                pix_width,
                pix_height,
                modes: terminal_modes
                    .into_iter()
                    .map(|(pty, value)| (pty as u8, value))
                    .collect(),
            },
            want_reply,
        ),
        ChannelMsg::RequestShell { want_reply } => (ChannelRequest::Shell, want_reply),
        ChannelMsg::Exec { want_reply, command } => (
            ChannelRequest::Exec {
                command: Bytes::from(command),
            },
            want_reply,
        ),
        ChannelMsg::RequestSubsystem { want_reply, name } => (ChannelRequest::Subsystem { name }, want_reply),
        ChannelMsg::SetEnv {
            want_reply,
            variable_name,
            variable_value,
        } => (
            ChannelRequest::Env {
                name: variable_name,
                value: variable_value,
            },
            want_reply,
        ),
        ChannelMsg::RequestX11 {
            want_reply,
            single_connection,
            x11_authentication_protocol,
            x11_authentication_cookie,
            x11_screen_number,
        } => (
            ChannelRequest::X11 {
                single_connection,
                protocol: x11_authentication_protocol,
                cookie: x11_authentication_cookie,
                screen: x11_screen_number,
            },
            want_reply,
        ),
        ChannelMsg::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => (
            ChannelRequest::WindowChange {
                cols: col_width,
                rows: row_height,
                pix_width,
                pix_height,
            },
            false,
        ),
        ChannelMsg::Signal { signal } => (
            ChannelRequest::Signal {
                name: sig_name(&signal),
            },
            false,
        ),
        ChannelMsg::AgentForward { want_reply } => (ChannelRequest::AuthAgent, want_reply),
        ChannelMsg::ExitStatus { exit_status } => (ChannelRequest::ExitStatus { code: exit_status }, false),
        ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
            lang_tag,
        } => (
            ChannelRequest::ExitSignal {
                name: sig_name(&signal_name),
                core_dumped,
                message: error_message,
                lang: lang_tag,
            },
            false,
        ),
        _ => return None,
    };
    Some(request)
}

/// Signal name as carried on the wire, without the `SIG` prefix
fn sig_name(sig: &Sig) -> String {
    match sig {
        Sig::ABRT => "ABRT",
        Sig::ALRM => "ALRM",
        Sig::FPE => "FPE",
        Sig::HUP => "HUP",
        Sig::ILL => "ILL",
        Sig::INT => "INT",
        Sig::KILL => "KILL",
        Sig::PIPE => "PIPE",
        Sig::QUIT => "QUIT",
        Sig::SEGV => "SEGV",
        Sig::TERM => "TERM",
        Sig::USR1 => "USR1",
        Sig::Custom(name) => return name.clone(),
    }
    .to_string()
}

fn sig_from_name(name: &str) -> Sig {
    match name {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        other => Sig::Custom(other.to_string()),
    }
}
