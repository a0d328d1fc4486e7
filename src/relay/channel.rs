//! One proxied channel: classification, request forwarding, audited splice
//!
//! A channel is mirrored onto the peer connection as soon as it is opened,
//! and both request streams are forwarded from the start. Data only starts
//! to flow once the channel has been classified: immediately for port
//! forwards and agent channels, on the first `shell` / `exec` request for
//! `session` channels. The classification decides which audit taps sit on
//! the splice.

use super::connection::SessionInfo;
use super::splice::{DebugSink, Tap, relay};
use super::Capture;
use crate::backend::{Permissions, RecordLog};
use crate::error::{Error, Result};
use crate::logging::{LogEvent, LogEventKind};
use crate::protocol::{ChannelRequest, ScpStream, TcpInfo, TransferRecorder};
use crate::recording::{FlatLog, Logger, TAG_INPUT, TAG_OUTPUT};
use crate::transport::{
    BoxReader, BoxWriter, Channel, ChannelHandle, ConnHandle, NewChannel, RejectReason, Reply,
    Request,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a channel turned out to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelClass {
    Shell,
    Exec,
    ScpTo,
    ScpFrom,
    /// `direct-tcpip`
    Local,
    /// `forwarded-tcpip`
    Remote,
    SshAgent,
}

impl ChannelClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelClass::Shell => "shell",
            ChannelClass::Exec => "exec",
            ChannelClass::ScpTo => "scpto",
            ChannelClass::ScpFrom => "scpfrom",
            ChannelClass::Local => "local",
            ChannelClass::Remote => "remote",
            ChannelClass::SshAgent => "sshagent",
        }
    }

    /// Whether `perms` allows a channel of this class
    pub fn permitted(self, perms: &Permissions) -> bool {
        match self {
            ChannelClass::Shell => perms.has("shell"),
            ChannelClass::Exec => perms.has("exec") || perms.has("shell"),
            ChannelClass::ScpTo => perms.has("scpto"),
            ChannelClass::ScpFrom => perms.has("scpfrom"),
            ChannelClass::Local | ChannelClass::Remote | ChannelClass::SshAgent => perms.has("tcp"),
        }
    }
}

impl std::fmt::Display for ChannelClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the proxy opened a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The inbound connection (the user's client)
    Client,
    /// The outbound connection (the target server)
    Server,
}

/// Result of classification, fired once
#[derive(Debug)]
enum Gate {
    Ready(ChannelClass),
    Denied(String),
    /// A request stream ended before anything classified the channel
    Abandoned,
}

/// Split an `scp` command line into its mode and target path
///
/// Returns `None` for anything that is not `scp -t` / `scp -f`.
pub fn parse_scp(command: &str) -> Option<(ChannelClass, String)> {
    let tokens = shlex::split(command)
        .unwrap_or_else(|| command.split_whitespace().map(str::to_string).collect());
    let (program, rest) = tokens.split_first()?;
    if program != "scp" && !program.ends_with("/scp") {
        return None;
    }
    let (target, flags) = rest.split_last()?;

    let mut class = None;
    for flag in flags {
        if flag == "--" || !flag.starts_with('-') {
            continue;
        }
        if flag.contains('t') {
            class = Some(ChannelClass::ScpTo);
        } else if flag.contains('f') {
            class = Some(ChannelClass::ScpFrom);
        }
    }
    class.map(|c| (c, target.clone()))
}

fn reject_reason(err: &Error) -> RejectReason {
    match err {
        Error::ChannelTypeNotSupported(_) => RejectReason::UnknownChannelType,
        Error::NoPermission => RejectReason::AdministrativelyProhibited,
        Error::Backend(_) | Error::Http(_) => RejectReason::ResourceShortage,
        _ => RejectReason::ConnectFailed,
    }
}

struct ChannelState {
    class: Option<ChannelClass>,
    remote_dir: String,
    exec_cmds: Vec<String>,
    gate: Option<oneshot::Sender<Gate>>,
}

/// Relay state of one channel pair
pub struct ChannelSession {
    info: Arc<SessionInfo>,
    kind: String,
    state: Mutex<ChannelState>,
}

/// Byte streams of both channel halves
struct Ends {
    client_reader: BoxReader,
    client_writer: BoxWriter,
    client_stderr_reader: BoxReader,
    client_stderr_writer: BoxWriter,
    server_reader: BoxReader,
    server_writer: BoxWriter,
    server_stderr_reader: BoxReader,
    server_stderr_writer: BoxWriter,
}

#[derive(Default)]
struct Taps {
    /// Client to server
    upstream: Vec<Box<dyn Tap>>,
    /// Server to client
    downstream: Vec<Box<dyn Tap>>,
    transfers: Option<JoinHandle<()>>,
}

impl ChannelSession {
    /// Serve a channel offered by `origin` until both halves are closed
    ///
    /// `peer` is the connection on the other side, where the channel is
    /// mirrored with the same type and extra data.
    pub async fn serve(info: Arc<SessionInfo>, new_channel: NewChannel, origin: Origin, peer: ConnHandle) {
        let kind = new_channel.kind().to_string();
        let extra = new_channel.extra().clone();
        let record_id = info.record.id;
        debug!(record_id, channel = %kind, extra_len = extra.len(), ?origin, "new channel");

        let preclass = match open_class(&info, &kind, &extra).await {
            Ok(class) => class,
            Err(e) => {
                warn!(record_id, channel = %kind, error = %e, "channel rejected");
                info.events.emit(
                    &LogEvent::new(LogEventKind::ChannelRejected)
                        .with_record_id(record_id)
                        .with_channel(&kind)
                        .with_reason(e.to_string()),
                );
                new_channel.reject(reject_reason(&e), e.to_string());
                return;
            }
        };

        let mirrored = match peer.open_channel(&kind, extra).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(record_id, channel = %kind, error = %e, "failed to open channel on peer");
                info.events.emit(
                    &LogEvent::new(LogEventKind::ChannelRejected)
                        .with_record_id(record_id)
                        .with_channel(&kind)
                        .with_reason(e.to_string()),
                );
                new_channel.reject(RejectReason::ConnectFailed, e.to_string());
                return;
            }
        };
        let accepted = new_channel.accept();
        info.events.emit(
            &LogEvent::new(LogEventKind::ChannelOpen)
                .with_record_id(record_id)
                .with_channel(&kind),
        );

        let (client, server) = match origin {
            Origin::Client => (accepted, mirrored),
            Origin::Server => (mirrored, accepted),
        };

        let (gate_tx, gate_rx) = oneshot::channel();
        let session = ChannelSession {
            info,
            kind,
            state: Mutex::new(ChannelState {
                class: None,
                remote_dir: String::new(),
                exec_cmds: Vec::new(),
                gate: Some(gate_tx),
            }),
        };
        if let Some(class) = preclass {
            session.lock().class = Some(class);
            session.open_gate(Gate::Ready(class));
        }

        let Channel {
            reader: client_reader,
            writer: client_writer,
            stderr_reader: client_stderr_reader,
            stderr_writer: client_stderr_writer,
            handle: client_handle,
            requests: client_requests,
            ..
        } = client;
        let Channel {
            reader: server_reader,
            writer: server_writer,
            stderr_reader: server_stderr_reader,
            stderr_writer: server_stderr_writer,
            handle: server_handle,
            requests: server_requests,
            ..
        } = server;
        let ends = Ends {
            client_reader,
            client_writer,
            client_stderr_reader,
            client_stderr_writer,
            server_reader,
            server_writer,
            server_stderr_reader,
            server_stderr_writer,
        };

        // Each fires when the splices reading from that side are done
        let (client_drained_tx, client_drained_rx) = oneshot::channel::<()>();
        let (server_drained_tx, server_drained_rx) = oneshot::channel::<()>();

        tokio::join!(
            session.splice(
                gate_rx,
                ends,
                (client_handle.clone(), server_handle.clone()),
                client_drained_tx,
                server_drained_tx,
            ),
            session.forward_requests(client_requests, server_handle, client_drained_rx, "client"),
            session.forward_requests(server_requests, client_handle, server_drained_rx, "server"),
        );
        debug!(record_id, channel = %session.kind, "channel finished");
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fire the gate if nobody has yet
    fn open_gate(&self, gate: Gate) {
        if let Some(tx) = self.lock().gate.take() {
            let _ = tx.send(gate);
        }
    }

    /// Forward requests from one half to the other, relaying replies back
    ///
    /// Requests are handled one at a time, so replies keep request order.
    /// When the stream ends the peer half is closed, after the data read
    /// from the same side has been delivered.
    async fn forward_requests(
        &self,
        mut requests: mpsc::Receiver<Request>,
        peer: ChannelHandle,
        drained: oneshot::Receiver<()>,
        from: &str,
    ) {
        let record_id = self.info.record.id;
        while let Some(req) = requests.recv().await {
            debug!(
                record_id,
                from,
                request = %req.kind,
                want_reply = req.want_reply,
                len = req.payload.len(),
                "channel request"
            );
            if let Err(e) = self.interpret(&req) {
                warn!(record_id, from, request = %req.kind, error = %e, "channel request refused");
                req.reject();
                continue;
            }

            let reply = match peer
                .send_request(&req.kind, req.want_reply, req.payload.clone())
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(record_id, from, request = %req.kind, error = %e, "failed to forward channel request");
                    Reply::failure()
                }
            };
            debug!(record_id, from, request = %req.kind, ok = reply.ok, "channel request answered");
            req.reply(reply.ok, reply.payload);
        }

        self.open_gate(Gate::Abandoned);
        let _ = drained.await;
        peer.close().await;
        debug!(record_id, from, "channel requests end");
    }

    /// Look at a request for classification side effects
    fn interpret(&self, req: &Request) -> Result<()> {
        let Some(request) = ChannelRequest::decode(&req.kind, &req.payload)? else {
            debug!(request = %req.kind, payload = ?req.payload, "unrecognized channel request");
            return Ok(());
        };
        match request {
            ChannelRequest::Shell => {
                self.classify(ChannelClass::Shell)?;
                info!(record_id = self.info.record.id, "session in shell mode");
                Ok(())
            }
            ChannelRequest::Exec { command } => self.on_exec(&String::from_utf8_lossy(&command)),
            ChannelRequest::Subsystem { name } => {
                self.lock().exec_cmds.push(format!("subsystem {}", name));
                self.classify(ChannelClass::Exec)
            }
            ChannelRequest::Env { name, value } => {
                debug!(name = %name, value = %value, "env");
                Ok(())
            }
            ChannelRequest::X11 {
                protocol, screen, ..
            } => {
                debug!(protocol = %protocol, screen, "x11 forwarding requested");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// `command` is only used for classification and the record; the
    /// request itself is forwarded as received
    fn on_exec(&self, command: &str) -> Result<()> {
        debug!(record_id = self.info.record.id, command, "exec");
        match parse_scp(command) {
            Some((class, remote_dir)) => {
                self.lock().remote_dir = remote_dir.clone();
                self.classify(class)?;
                info!(
                    record_id = self.info.record.id,
                    mode = %class,
                    remote_dir = %remote_dir,
                    "session in scp mode"
                );
                Ok(())
            }
            None => {
                self.lock().exec_cmds.push(command.to_string());
                self.classify(ChannelClass::Exec)
            }
        }
    }

    /// Record the class and release the data relay, or deny the channel
    fn classify(&self, class: ChannelClass) -> Result<()> {
        let mut state = self.lock();
        if let Some(current) = state.class {
            warn!(
                record_id = self.info.record.id,
                current = %current,
                requested = %class,
                "channel already classified"
            );
            return Ok(());
        }
        if !class.permitted(&self.info.perms) {
            if let Some(gate) = state.gate.take() {
                let _ = gate.send(Gate::Denied(format!("no permission for {}", class)));
            }
            return Err(Error::NoPermission);
        }
        state.class = Some(class);
        if let Some(gate) = state.gate.take() {
            let _ = gate.send(Gate::Ready(class));
        }
        Ok(())
    }

    /// Wait for classification, then relay data through the matching taps
    async fn splice(
        &self,
        gate: oneshot::Receiver<Gate>,
        ends: Ends,
        handles: (ChannelHandle, ChannelHandle),
        client_drained: oneshot::Sender<()>,
        server_drained: oneshot::Sender<()>,
    ) {
        let record_id = self.info.record.id;
        let (client, server) = handles;
        let class = match gate.await {
            Ok(Gate::Ready(class)) => class,
            Ok(Gate::Denied(reason)) => {
                warn!(record_id, channel = %self.kind, reason = %reason, "channel denied");
                self.info.events.emit(
                    &LogEvent::new(LogEventKind::ChannelRejected)
                        .with_record_id(record_id)
                        .with_channel(&self.kind)
                        .with_reason(reason),
                );
                client.close().await;
                server.close().await;
                return;
            }
            Ok(Gate::Abandoned) | Err(_) => {
                debug!(record_id, channel = %self.kind, "channel closed before classification");
                return;
            }
        };

        let taps = match self.build_taps(class).await {
            Ok(taps) => taps,
            Err(e) => {
                error!(record_id, class = %class, error = %e, "failed to set up channel audit");
                self.info
                    .events
                    .emit(&LogEvent::error(e.to_string()).with_record_id(record_id).with_class(class.as_str()));
                client.close().await;
                server.close().await;
                return;
            }
        };
        drop((client, server));

        let Ends {
            client_reader,
            client_writer,
            client_stderr_reader,
            client_stderr_writer,
            server_reader,
            server_writer,
            server_stderr_reader,
            server_stderr_writer,
        } = ends;
        let Taps {
            upstream,
            downstream,
            transfers,
        } = taps;

        let up = format!("{}/{}/up", record_id, class);
        let up_err = format!("{}/{}/up-stderr", record_id, class);
        let down = format!("{}/{}/down", record_id, class);
        let down_err = format!("{}/{}/down-stderr", record_id, class);

        let client_side = async {
            tokio::join!(
                relay(client_reader, server_writer, upstream, &up),
                relay(client_stderr_reader, server_stderr_writer, Vec::new(), &up_err),
            );
            drop(client_drained);
        };
        let server_side = async {
            tokio::join!(
                relay(server_reader, client_writer, downstream, &down),
                relay(server_stderr_reader, client_stderr_writer, Vec::new(), &down_err),
            );
            drop(server_drained);
        };
        tokio::join!(client_side, server_side);

        if let Some(task) = transfers
            && let Err(e) = task.await
        {
            warn!(record_id, error = %e, "file transfer log task failed");
        }
    }

    async fn build_taps(&self, class: ChannelClass) -> Result<Taps> {
        let info = &self.info;
        let mut taps = Taps::default();
        let mut event = LogEvent::new(LogEventKind::ChannelClassified)
            .with_record_id(info.record.id)
            .with_channel(&self.kind)
            .with_class(class.as_str());

        match class {
            ChannelClass::Shell | ChannelClass::Exec => {
                let cmds = self.lock().exec_cmds.join("\r");
                let log = RecordLog::new(info.record.id, class.as_str()).with_log1(cmds);
                let id = info.store.add_record_log(log).await?;
                match info.audit.capture {
                    Capture::Rec => {
                        let logger = Logger::create(&info.log_dir, info.record.date(), id)?;
                        info!(record_id = info.record.id, recordlog = id, path = %logger.path().display(), "recording channel");
                        taps.upstream
                            .push(Box::new(logger.sub_logger(TAG_INPUT, info.audit.quantum)));
                        taps.downstream
                            .push(Box::new(logger.sub_logger(TAG_OUTPUT, info.audit.quantum)));
                    }
                    Capture::Flat => {
                        let flat = FlatLog::create(&info.log_dir, info.record.date(), id)?;
                        info!(record_id = info.record.id, recordlog = id, path = %flat.path().display(), "recording channel output");
                        taps.downstream.push(Box::new(flat));
                    }
                }
                event = event.with_context(serde_json::json!({ "recordlog": id }));
            }
            ChannelClass::ScpTo | ChannelClass::ScpFrom => {
                let remote_dir = self.lock().remote_dir.clone();
                if info.audit.file_transfers {
                    let (recorder, task) = spawn_transfer_log(Arc::clone(info), class, remote_dir.clone());
                    let tap: Box<dyn Tap> = Box::new(ScpStream::new(recorder));
                    if class == ChannelClass::ScpTo {
                        taps.upstream.push(tap);
                    } else {
                        taps.downstream.push(tap);
                    }
                    taps.transfers = Some(task);
                }
                event = event.with_context(serde_json::json!({ "remote_dir": remote_dir }));
            }
            ChannelClass::Local | ChannelClass::Remote | ChannelClass::SshAgent => {
                if info.audit.debug_taps {
                    taps.upstream
                        .push(Box::new(DebugSink::new(format!("{}-out", class))));
                    taps.downstream
                        .push(Box::new(DebugSink::new(format!("{}-in", class))));
                }
            }
        }

        info.events.emit(&event);
        Ok(taps)
    }
}

/// Classify a channel from its type; `None` for `session` channels
async fn open_class(info: &SessionInfo, kind: &str, extra: &[u8]) -> Result<Option<ChannelClass>> {
    let class = match kind {
        "session" => return Ok(None),
        "direct-tcpip" => ChannelClass::Local,
        "forwarded-tcpip" => ChannelClass::Remote,
        "auth-agent@openssh.com" => ChannelClass::SshAgent,
        other => return Err(Error::ChannelTypeNotSupported(other.to_string())),
    };
    if !class.permitted(&info.perms) {
        return Err(Error::NoPermission);
    }

    let mut log = RecordLog::new(info.record.id, class.as_str());
    if class != ChannelClass::SshAgent {
        let tcp = TcpInfo::parse(extra)?;
        info!(
            record_id = info.record.id,
            direction = %class,
            address = %tcp.address,
            port = tcp.port,
            "mapping port"
        );
        info.events.emit(
            &LogEvent::new(LogEventKind::PortForward)
                .with_record_id(info.record.id)
                .with_class(class.as_str())
                .with_filename(&tcp.address)
                .with_size(tcp.port as u64),
        );
        log = log.with_log1(tcp.address).with_num1(tcp.port as i64);
    }
    info.store.add_record_log(log).await?;
    Ok(Some(class))
}

/// Hands SCP file events from the synchronous tap to an async logger task
struct TransferLog {
    tx: mpsc::UnboundedSender<(String, u64)>,
}

impl TransferRecorder for TransferLog {
    fn on_file_transmit(&mut self, filename: &str, size: u64) -> Result<()> {
        self.tx
            .send((filename.to_string(), size))
            .map_err(|_| Error::Closed)
    }

    fn on_file_data(&mut self, _chunk: &[u8]) -> Result<()> {
        Ok(())
    }
}

fn spawn_transfer_log(info: Arc<SessionInfo>, class: ChannelClass, remote_dir: String) -> (TransferLog, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, u64)>();
    let task = tokio::spawn(async move {
        while let Some((filename, size)) = rx.recv().await {
            info!(
                record_id = info.record.id,
                mode = %class,
                filename = %filename,
                size,
                remote_dir = %remote_dir,
                "file transmit"
            );
            info.events.emit(
                &LogEvent::file_transmit(info.record.id, class.as_str(), &filename, size)
                    .with_context(serde_json::json!({ "remote_dir": remote_dir })),
            );
            let log = RecordLog::new(info.record.id, class.as_str())
                .with_log1(filename)
                .with_log2(remote_dir.clone())
                .with_num1(size as i64);
            if let Err(e) = info.store.add_record_log(log).await {
                warn!(record_id = info.record.id, error = %e, "failed to store file transmit record");
            }
        }
    });
    (TransferLog { tx }, task)
}
