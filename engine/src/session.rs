// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The request/response/status state machine that sits on top of the
//! broker and the HTTP file server: owns the printer identity, tracks
//! outstanding request correlations, routes incoming MQTT messages to
//! waiters, emits an upload progress stream, and sequences the connect
//! handshake.
//!
//! Concurrency model: a single actor task (spawned by [`Session::connect`])
//! owns all session-mutable state — the outstanding-waiters map, the last
//! observed status snapshot, and the in-progress upload/print watch, if
//! any. Callers never touch that state directly; a cloneable
//! [`SessionHandle`] talks to the actor purely by message passing, mirroring
//! the actor/dispatcher shape this engine's teacher uses for its own
//! cross-task communication.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use codec::{
    Cmd, CommandData, CommandEnvelope, EnvelopeData, PublishPacket, SetReportPeriodData,
    StartPrintingData, UploadFileData,
};
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, Instant};

use crate::commands::{BrokerToSessionCmd, SessionToBrokerCmd};
use crate::error::{Error, ErrorKind};
use crate::http::RouteHandle;
use crate::types::{CurrentStatus, FileTransferStatus, PrinterDescriptor, StatusPush, StatusSnapshot};

const REQUEST_TOPIC_PREFIX: &str = "/sdcp/request/";
const RESPONSE_TOPIC_PREFIX: &str = "/sdcp/response/";
const STATUS_TOPIC_PREFIX: &str = "/sdcp/status/";
const ATTRIBUTES_TOPIC_PREFIX: &str = "/sdcp/attributes/";

/// Interval at which the actor sweeps waiters past their deadline. Short
/// enough that a command timeout is observed promptly, long enough that it
/// is not a meaningful source of CPU churn on an idle session.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Tunables for the handshake, command correlation, and print-start window.
/// Mirrors `config::Session`, kept as a separate type so `session` does not
/// need to depend on TOML parsing.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Bound on every externally-awaited operation: CONNECT, SUBSCRIBE,
    /// command correlation. Upload steady-state waits use twice this value.
    pub command_timeout: Duration,

    /// Number of status snapshots `print()` observes before giving up on
    /// seeing the `BUSY` + printing transition.
    pub print_start_window: usize,

    /// Whether a non-zero `Ack` in a response is session-fatal by default.
    pub abort_on_bad_ack: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(5000),
            print_start_window: 5,
            abort_on_bad_ack: true,
        }
    }
}

impl From<&crate::config::Session> for SessionConfig {
    fn from(cfg: &crate::config::Session) -> Self {
        Self {
            command_timeout: Duration::from_millis(cfg.command_timeout_ms),
            print_start_window: cfg.print_start_window,
            abort_on_bad_ack: cfg.abort_on_bad_ack,
        }
    }
}

/// One emitted step of an in-progress upload. A successful transfer ends
/// with `offset == total`; a failed one ends with the sentinel `offset ==
/// -1`. Either terminal emission is the last one this stream produces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadProgress {
    pub offset: i64,
    pub total: u64,
    pub filename: String,
}

/// Messages accepted by the orchestrator actor, issued through a
/// [`SessionHandle`]. Named the way `engine::commands` names the
/// broker/session pair, but kept private to this module since nothing
/// outside `session` needs to construct one directly.
enum OrchestratorCmd {
    Submit {
        cmd: Cmd,
        data: CommandData,
        reply: oneshot::Sender<Result<EnvelopeData, Error>>,
    },
    Upload {
        file_path: PathBuf,
        start_printing: bool,
        reply: oneshot::Sender<Result<mpsc::Receiver<UploadProgress>, Error>>,
    },
    Print {
        filename: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

/// Cloneable handle used to drive a connected printer session. All state
/// lives in the orchestrator task; a handle only ever talks to it over
/// `cmd_tx`.
#[derive(Clone)]
pub struct SessionHandle {
    descriptor: PrinterDescriptor,
    cmd_tx: mpsc::Sender<OrchestratorCmd>,
}

impl SessionHandle {
    #[must_use]
    pub fn descriptor(&self) -> &PrinterDescriptor {
        &self.descriptor
    }

    /// Issues `cmd` with `data` and awaits its correlated response.
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator task is gone, the response carries
    /// a non-zero `Ack` and `abort_on_bad_ack` is set, or no correlated
    /// response arrives within the session timeout.
    pub async fn submit(&self, cmd: Cmd, data: CommandData) -> Result<EnvelopeData, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(OrchestratorCmd::Submit { cmd, data, reply })
            .await?;
        rx.await.map_err(Error::from)?
    }

    /// Registers `file_path` on the HTTP file server, issues `UPLOAD_FILE`,
    /// and returns a progress stream once the printer acknowledges the
    /// command. If `start_printing` is true and the transfer completes
    /// successfully, `print()` is issued automatically for the uploaded
    /// file's basename.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, the orchestrator task is
    /// gone, or `UPLOAD_FILE` is rejected or times out.
    pub async fn upload(
        &self,
        file_path: &Path,
        start_printing: bool,
    ) -> Result<mpsc::Receiver<UploadProgress>, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(OrchestratorCmd::Upload {
            file_path: file_path.to_path_buf(),
            start_printing,
            reply,
        })
        .await?;
        rx.await.map_err(Error::from)?
    }

    /// Issues `START_PRINTING` and waits for the first subsequent status
    /// snapshot showing `BUSY` with a positive `PrintInfo.Status`.
    ///
    /// # Errors
    ///
    /// Returns error if the command is rejected, the orchestrator task is
    /// gone, or no such transition is observed within the print-start
    /// window.
    pub async fn print(&self, filename: &str) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(OrchestratorCmd::Print {
            filename: filename.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(Error::from)?
    }

    /// Returns the last status snapshot observed, either from discovery or
    /// from a subsequent status push.
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator task is gone.
    pub async fn status(&self) -> Result<StatusSnapshot, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(OrchestratorCmd::Status { reply }).await?;
        Ok(rx.await.map_err(Error::from)?)
    }

    /// Issues `DISCONNECT` and closes the broker-side connection. Does not
    /// wait for a printer-side response beyond the publish itself — the
    /// printer may close first.
    ///
    /// # Errors
    ///
    /// Returns error if the orchestrator task is gone or the envelope could
    /// not be published.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(OrchestratorCmd::Disconnect { reply }).await?;
        rx.await.map_err(Error::from)?
    }

    async fn send_cmd(&self, cmd: OrchestratorCmd) -> Result<(), Error> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::new(ErrorKind::ChannelError, "session orchestrator task is gone"))
    }
}

/// Runs the connect handshake against `descriptor` (redirect, CONNECT,
/// SUBSCRIBE, then the `NOP_0`/`NOP_1`/`SET_REPORT_PERIOD` priming
/// sequence) and spawns the orchestrator actor. Returns a handle once the
/// session reaches `READY`.
///
/// # Errors
///
/// Returns error if the redirect cannot be sent, the observed CONNECT
/// client id does not match the descriptor's mainboard id, the observed
/// SUBSCRIBE topic does not match the expected request topic, the
/// connection closes before either observation, or any step of the priming
/// sequence fails or times out.
pub struct Session;

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        descriptor: PrinterDescriptor,
        broker_port: u16,
        mut from_broker: mpsc::Receiver<BrokerToSessionCmd>,
        to_broker: mpsc::Sender<SessionToBrokerCmd>,
        http: RouteHandle,
        http_port: u16,
        config: SessionConfig,
    ) -> Result<SessionHandle, Error> {
        crate::discovery::request_connect(descriptor.address, broker_port).await?;

        let observed_id = await_connected(&mut from_broker, config.command_timeout).await?;
        if observed_id != descriptor.mainboard_id {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                &format!(
                    "printer connected with client id {observed_id}, expected {}",
                    descriptor.mainboard_id
                ),
            ));
        }

        let expected_topic = format!("{REQUEST_TOPIC_PREFIX}{}", descriptor.mainboard_id);
        let observed_topic = await_subscribed(&mut from_broker, config.command_timeout).await?;
        if observed_topic != expected_topic {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                &format!(
                    "printer subscribed to {observed_topic}, expected {expected_topic}"
                ),
            ));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let orchestrator = Orchestrator {
            descriptor: descriptor.clone(),
            to_broker,
            from_broker,
            cmd_rx,
            http,
            http_port,
            config: config.clone(),
            waiters: HashMap::new(),
            last_status: descriptor.status.clone(),
            upload_watch: None,
            print_watch: None,
        };
        tokio::spawn(orchestrator.run());

        let handle = SessionHandle {
            descriptor,
            cmd_tx,
        };

        handle.submit(Cmd::Nop0, CommandData::default()).await?;
        handle.submit(Cmd::Nop1, CommandData::default()).await?;
        handle
            .submit(
                Cmd::SetReportPeriod,
                CommandData::from(SetReportPeriodData { time_period: 5000 }),
            )
            .await?;

        Ok(handle)
    }
}

async fn await_connected(
    rx: &mut mpsc::Receiver<BrokerToSessionCmd>,
    bound: Duration,
) -> Result<String, Error> {
    let wait = async {
        loop {
            match rx.recv().await {
                Some(BrokerToSessionCmd::Connected(id)) => return Some(id),
                Some(BrokerToSessionCmd::Disconnected) => return None,
                Some(_) => continue,
                None => return None,
            }
        }
    };
    match timeout(bound, wait).await {
        Ok(Some(id)) => Ok(id),
        Ok(None) => Err(Error::new(
            ErrorKind::ProtocolError,
            "connection closed before CONNECT",
        )),
        Err(_) => Err(Error::new(
            ErrorKind::Timeout,
            "no CONNECT observed within session timeout",
        )),
    }
}

async fn await_subscribed(
    rx: &mut mpsc::Receiver<BrokerToSessionCmd>,
    bound: Duration,
) -> Result<String, Error> {
    let wait = async {
        loop {
            match rx.recv().await {
                Some(BrokerToSessionCmd::Subscribed(topic)) => return Some(topic),
                Some(BrokerToSessionCmd::Disconnected) => return None,
                Some(_) => continue,
                None => return None,
            }
        }
    };
    match timeout(bound, wait).await {
        Ok(Some(topic)) => Ok(topic),
        Ok(None) => Err(Error::new(
            ErrorKind::ProtocolError,
            "connection closed before SUBSCRIBE",
        )),
        Err(_) => Err(Error::new(
            ErrorKind::Timeout,
            "no SUBSCRIBE observed within session timeout",
        )),
    }
}

/// What a pending `RequestID` resolves into once its response arrives.
enum WaiterKind {
    /// A plain `submit()` relay: hand the caller the inner `Data` payload
    /// (or a rejection error) directly.
    Command(oneshot::Sender<Result<EnvelopeData, Error>>),

    /// `UPLOAD_FILE`'s ack: on success, open the progress channel and hand
    /// its receiver to the caller; the route is torn down on the eventual
    /// terminal status, not here.
    UploadAck {
        reply: oneshot::Sender<Result<mpsc::Receiver<UploadProgress>, Error>>,
        url_path: String,
        filename: String,
        start_printing: bool,
    },

    /// `START_PRINTING`'s ack: on success, start watching subsequent status
    /// snapshots for the BUSY+printing transition instead of resolving the
    /// caller immediately.
    StartPrintingAck {
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

struct Waiter {
    kind: WaiterKind,
    deadline: Instant,
}

struct UploadWatch {
    tx: mpsc::Sender<UploadProgress>,
    url_path: String,
    filename: String,
    start_printing: bool,
}

struct PrintWatch {
    reply: oneshot::Sender<Result<(), Error>>,
    remaining: usize,
}

/// The actor: the only task that ever mutates `waiters`, `last_status`,
/// `upload_watch`, or `print_watch`, per the single-writer discipline this
/// engine's concurrency model requires.
struct Orchestrator {
    descriptor: PrinterDescriptor,
    to_broker: mpsc::Sender<SessionToBrokerCmd>,
    from_broker: mpsc::Receiver<BrokerToSessionCmd>,
    cmd_rx: mpsc::Receiver<OrchestratorCmd>,
    http: RouteHandle,
    http_port: u16,
    config: SessionConfig,
    waiters: HashMap<String, Waiter>,
    last_status: StatusSnapshot,
    upload_watch: Option<UploadWatch>,
    print_watch: Option<PrintWatch>,
}

impl Orchestrator {
    async fn run(mut self) {
        let mut sweep = interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_cmd(cmd).await,
                        None => break,
                    }
                }
                msg = self.from_broker.recv() => {
                    match msg {
                        Some(msg) => self.handle_broker_msg(msg).await,
                        None => break,
                    }
                }
                _ = sweep.tick() => self.sweep_expired(),
            }
        }
        log::info!(
            "session orchestrator for {} shutting down",
            self.descriptor.mainboard_id
        );
    }

    async fn handle_cmd(&mut self, cmd: OrchestratorCmd) {
        match cmd {
            OrchestratorCmd::Submit { cmd, data, reply } => {
                self.begin_submit(cmd, data, reply).await;
            }
            OrchestratorCmd::Upload {
                file_path,
                start_printing,
                reply,
            } => self.begin_upload(file_path, start_printing, reply).await,
            OrchestratorCmd::Print { filename, reply } => {
                self.begin_start_printing(filename, reply).await;
            }
            OrchestratorCmd::Status { reply } => {
                let _ = reply.send(self.last_status.clone());
            }
            OrchestratorCmd::Disconnect { reply } => self.begin_disconnect(reply).await,
        }
    }

    async fn handle_broker_msg(&mut self, msg: BrokerToSessionCmd) {
        match msg {
            BrokerToSessionCmd::Connected(_) | BrokerToSessionCmd::Subscribed(_) => {
                // Single-shot handshake observations already consumed by
                // `Session::connect`; nothing further to do with them here.
            }
            BrokerToSessionCmd::Publish(packet) => self.dispatch_publish(packet).await,
            BrokerToSessionCmd::Disconnected => {
                self.fail_all_waiters(Error::new(
                    ErrorKind::ProtocolError,
                    "transport disconnected",
                ));
            }
        }
    }

    async fn dispatch_publish(&mut self, packet: PublishPacket) {
        let topic = packet.topic().to_string();
        if topic == format!("{RESPONSE_TOPIC_PREFIX}{}", self.descriptor.mainboard_id) {
            match CommandEnvelope::from_json(&String::from_utf8_lossy(packet.payload())) {
                Ok(envelope) => {
                    let request_id = envelope.data.request_id.clone();
                    self.on_response(&request_id, envelope.data);
                }
                Err(err) => log::warn!("malformed response envelope on {topic}: {err}"),
            }
        } else if topic == format!("{STATUS_TOPIC_PREFIX}{}", self.descriptor.mainboard_id) {
            match serde_json::from_slice::<StatusPush>(packet.payload()) {
                Ok(push) => self.on_status(StatusSnapshot::from(push.data.status)).await,
                Err(err) => log::warn!("malformed status push on {topic}: {err}"),
            }
        } else if topic == format!("{ATTRIBUTES_TOPIC_PREFIX}{}", self.descriptor.mainboard_id) {
            log::debug!("ignoring attributes push on {topic}");
        } else {
            log::warn!("unexpected inbound topic {topic}");
        }
    }

    fn on_response(&mut self, request_id: &str, data: EnvelopeData) {
        let Some(waiter) = self.waiters.remove(request_id) else {
            log::warn!("response RequestID {request_id} matched no outstanding waiter");
            return;
        };
        let ack_ok = data.data.ack_value().unwrap_or(0) == 0;
        let rejected = self.config.abort_on_bad_ack && !ack_ok;
        match waiter.kind {
            WaiterKind::Command(reply) => {
                let result = if rejected {
                    Err(Error::new(
                        ErrorKind::CommandRejected,
                        &format!("response carried Ack={:?}", data.data.ack_value()),
                    ))
                } else {
                    Ok(data)
                };
                let _ = reply.send(result);
            }
            WaiterKind::UploadAck {
                reply,
                url_path,
                filename,
                start_printing,
            } => {
                if rejected {
                    self.http.unregister(&url_path);
                    let _ = reply.send(Err(Error::new(
                        ErrorKind::CommandRejected,
                        &format!("UPLOAD_FILE rejected, Ack={:?}", data.data.ack_value()),
                    )));
                    return;
                }
                let (tx, rx) = mpsc::channel(16);
                self.upload_watch = Some(UploadWatch {
                    tx,
                    url_path,
                    filename,
                    start_printing,
                });
                let _ = reply.send(Ok(rx));
            }
            WaiterKind::StartPrintingAck { reply } => {
                if rejected {
                    let _ = reply.send(Err(Error::new(
                        ErrorKind::CommandRejected,
                        &format!("START_PRINTING rejected, Ack={:?}", data.data.ack_value()),
                    )));
                    return;
                }
                self.print_watch = Some(PrintWatch {
                    reply,
                    remaining: self.config.print_start_window,
                });
            }
        }
    }

    async fn on_status(&mut self, snapshot: StatusSnapshot) {
        self.last_status = snapshot.clone();

        if let Some(watch) = self.upload_watch.take() {
            self.drive_upload_watch(watch, &snapshot).await;
        }
        if let Some(watch) = self.print_watch.take() {
            self.drive_print_watch(watch, &snapshot);
        }
    }

    async fn drive_upload_watch(&mut self, watch: UploadWatch, snapshot: &StatusSnapshot) {
        let fti = &snapshot.file_transfer_info;
        let (progress, terminal, success) = match snapshot.current_status {
            CurrentStatus::Busy => (
                UploadProgress {
                    offset: i64::try_from(fti.download_offset).unwrap_or(i64::MAX),
                    total: fti.file_total_size,
                    filename: watch.filename.clone(),
                },
                false,
                false,
            ),
            CurrentStatus::Ready if fti.status == FileTransferStatus::Done => (
                UploadProgress {
                    offset: i64::try_from(fti.file_total_size).unwrap_or(i64::MAX),
                    total: fti.file_total_size,
                    filename: watch.filename.clone(),
                },
                true,
                true,
            ),
            CurrentStatus::Ready => (
                UploadProgress {
                    offset: -1,
                    total: fti.file_total_size,
                    filename: watch.filename.clone(),
                },
                true,
                false,
            ),
        };

        if watch.tx.send(progress).await.is_err() {
            log::debug!(
                "upload progress receiver dropped for {}",
                watch.filename
            );
        }

        if terminal {
            self.http.unregister(&watch.url_path);
            if success && watch.start_printing {
                self.auto_print_after_upload(watch.filename.clone()).await;
            }
        } else {
            self.upload_watch = Some(watch);
        }
    }

    fn drive_print_watch(&mut self, mut watch: PrintWatch, snapshot: &StatusSnapshot) {
        let started =
            snapshot.current_status == CurrentStatus::Busy && snapshot.print_info.status.value() > 0;
        if started {
            let _ = watch.reply.send(Ok(()));
            return;
        }
        watch.remaining = watch.remaining.saturating_sub(1);
        if watch.remaining == 0 {
            let _ = watch.reply.send(Err(Error::new(
                ErrorKind::Timeout,
                "print did not start within the observation window",
            )));
        } else {
            self.print_watch = Some(watch);
        }
    }

    /// Fires `print()` for an upload that finished successfully with
    /// `start_printing` set. Nobody is awaiting this result directly — the
    /// caller of `upload()` already got its progress stream — so the
    /// outcome is only logged.
    async fn auto_print_after_upload(&mut self, filename: String) {
        let (reply, rx) = oneshot::channel();
        self.begin_start_printing(filename.clone(), reply).await;
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(())) => log::info!("auto-print of {filename} started"),
                Ok(Err(err)) => log::warn!("auto-print of {filename} failed: {err}"),
                Err(_) => {}
            }
        });
    }

    async fn begin_submit(
        &mut self,
        cmd: Cmd,
        data: CommandData,
        reply: oneshot::Sender<Result<EnvelopeData, Error>>,
    ) {
        let request_id = gen_hex_id();
        let envelope = self.build_envelope(cmd, data, &request_id);
        match self.publish_request(&envelope).await {
            Ok(()) => {
                self.waiters.insert(
                    request_id,
                    Waiter {
                        kind: WaiterKind::Command(reply),
                        deadline: Instant::now() + self.config.command_timeout,
                    },
                );
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    async fn begin_start_printing(
        &mut self,
        filename: String,
        reply: oneshot::Sender<Result<(), Error>>,
    ) {
        let request_id = gen_hex_id();
        let data = CommandData::from(StartPrintingData {
            filename,
            start_layer: 0,
        });
        let envelope = self.build_envelope(Cmd::StartPrinting, data, &request_id);
        match self.publish_request(&envelope).await {
            Ok(()) => {
                self.waiters.insert(
                    request_id,
                    Waiter {
                        kind: WaiterKind::StartPrintingAck { reply },
                        deadline: Instant::now() + self.config.command_timeout,
                    },
                );
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    async fn begin_upload(
        &mut self,
        file_path: PathBuf,
        start_printing: bool,
        reply: oneshot::Sender<Result<mpsc::Receiver<UploadProgress>, Error>>,
    ) {
        let Some(basename) = file_path.file_name().and_then(|s| s.to_str()) else {
            let _ = reply.send(Err(Error::new(
                ErrorKind::NotFound,
                "file path has no file name",
            )));
            return;
        };
        let basename = basename.to_string();
        let extension = Path::new(&basename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if extension != "ctb" && extension != "goo" {
            log::warn!("uploading file with unrecognized extension: {extension}");
        }

        let url_path = format!(
            "/{}.{}",
            gen_hex_id(),
            if extension.is_empty() { "bin" } else { &extension }
        );
        let route = match self.http.register(&url_path, &file_path).await {
            Ok(route) => route,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };

        let request_id = gen_hex_id();
        let url = format!("http://${{ipaddr}}:{}{url_path}", self.http_port);
        let data = CommandData::from(UploadFileData {
            check: 0,
            clean_cache: 1,
            compress: 0,
            file_size: route.size(),
            filename: basename.clone(),
            md5: route.md5().to_string(),
            url,
        });
        let envelope = self.build_envelope(Cmd::UploadFile, data, &request_id);
        match self.publish_request(&envelope).await {
            Ok(()) => {
                self.waiters.insert(
                    request_id,
                    Waiter {
                        kind: WaiterKind::UploadAck {
                            reply,
                            url_path,
                            filename: basename,
                            start_printing,
                        },
                        deadline: Instant::now() + self.config.command_timeout,
                    },
                );
            }
            Err(err) => {
                self.http.unregister(&url_path);
                let _ = reply.send(Err(err));
            }
        }
    }

    async fn begin_disconnect(&mut self, reply: oneshot::Sender<Result<(), Error>>) {
        let request_id = gen_hex_id();
        let envelope = self.build_envelope(Cmd::Disconnect, CommandData::default(), &request_id);
        let publish_result = self.publish_request(&envelope).await;
        let _ = self.to_broker.send(SessionToBrokerCmd::Disconnect).await;
        let _ = reply.send(publish_result);
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .waiters
            .iter()
            .filter(|(_, waiter)| waiter.deadline <= now)
            .map(|(request_id, _)| request_id.clone())
            .collect();
        for request_id in expired {
            let Some(waiter) = self.waiters.remove(&request_id) else {
                continue;
            };
            let err = Error::new(
                ErrorKind::Timeout,
                "no correlated response within session timeout",
            );
            match waiter.kind {
                WaiterKind::Command(reply) => {
                    let _ = reply.send(Err(err));
                }
                WaiterKind::UploadAck {
                    reply, url_path, ..
                } => {
                    self.http.unregister(&url_path);
                    let _ = reply.send(Err(err));
                }
                WaiterKind::StartPrintingAck { reply } => {
                    let _ = reply.send(Err(err));
                }
            }
        }
    }

    fn fail_all_waiters(&mut self, err: Error) {
        for (_, waiter) in self.waiters.drain() {
            match waiter.kind {
                WaiterKind::Command(reply) => {
                    let _ = reply.send(Err(err.clone()));
                }
                WaiterKind::UploadAck {
                    reply, url_path, ..
                } => {
                    self.http.unregister(&url_path);
                    let _ = reply.send(Err(err.clone()));
                }
                WaiterKind::StartPrintingAck { reply } => {
                    let _ = reply.send(Err(err.clone()));
                }
            }
        }
        if let Some(watch) = self.upload_watch.take() {
            self.http.unregister(&watch.url_path);
            let _ = watch.tx.try_send(UploadProgress {
                offset: -1,
                total: 0,
                filename: watch.filename,
            });
        }
        if let Some(watch) = self.print_watch.take() {
            let _ = watch.reply.send(Err(err));
        }
    }

    fn build_envelope(&self, cmd: Cmd, data: CommandData, request_id: &str) -> CommandEnvelope {
        CommandEnvelope {
            id: self.descriptor.id.clone(),
            data: EnvelopeData {
                cmd,
                data,
                from: 0,
                mainboard_id: self.descriptor.mainboard_id.clone(),
                request_id: request_id.to_string(),
                time_stamp: current_millis(),
            },
        }
    }

    async fn publish_request(&self, envelope: &CommandEnvelope) -> Result<(), Error> {
        let payload = envelope.to_json()?;
        let topic = format!("{REQUEST_TOPIC_PREFIX}{}", self.descriptor.mainboard_id);
        let packet = PublishPacket::new(&topic, 0, payload.as_bytes())?;
        self.to_broker
            .send(SessionToBrokerCmd::Publish(packet))
            .await?;
        Ok(())
    }
}

/// 128-bit random hex string. Used both as a `RequestID` (I1: unique
/// within the outstanding map with overwhelming probability) and, reused
/// unchanged, as the random HTTP path segment for an upload route.
fn gen_hex_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut s = String::with_capacity(32);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileTransferInfo, PrintInfo, PrintStatus};

    fn descriptor() -> PrinterDescriptor {
        PrinterDescriptor {
            id: "abc".to_string(),
            address: std::net::SocketAddr::from(([127, 0, 0, 1], 3000)),
            mainboard_id: "MB1".to_string(),
            name: "Saturn".to_string(),
            machine_name: "Saturn 3".to_string(),
            status: StatusSnapshot::default(),
        }
    }

    #[test]
    fn test_gen_hex_id_is_32_lowercase_hex_chars() {
        let id = gen_hex_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_upload_url_preserves_literal_ipaddr_token() {
        let url = format!("http://${{ipaddr}}:{}/x.ctb", 8080);
        assert_eq!(url, "http://${ipaddr}:8080/x.ctb");
    }

    #[test]
    fn test_build_envelope_shape() {
        let (to_broker, _rx) = mpsc::channel(1);
        let (_tx, from_broker) = mpsc::channel(1);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let orchestrator = Orchestrator {
            descriptor: descriptor(),
            to_broker,
            from_broker,
            cmd_rx,
            http: crate::http::RouteHandle::for_test(),
            http_port: 8080,
            config: SessionConfig::default(),
            waiters: HashMap::new(),
            last_status: StatusSnapshot::default(),
            upload_watch: None,
            print_watch: None,
        };
        let envelope = orchestrator.build_envelope(Cmd::Nop0, CommandData::default(), "r1");
        assert_eq!(envelope.id, "abc");
        assert_eq!(envelope.data.mainboard_id, "MB1");
        assert_eq!(envelope.data.request_id, "r1");
        assert_eq!(envelope.data.cmd, Cmd::Nop0);
    }

    #[tokio::test]
    async fn test_upload_progress_busy_then_done() {
        let (to_broker, _rx) = mpsc::channel(1);
        let (_tx, from_broker) = mpsc::channel(1);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let mut orchestrator = Orchestrator {
            descriptor: descriptor(),
            to_broker,
            from_broker,
            cmd_rx,
            http: crate::http::RouteHandle::for_test(),
            http_port: 8080,
            config: SessionConfig::default(),
            waiters: HashMap::new(),
            last_status: StatusSnapshot::default(),
            upload_watch: None,
            print_watch: None,
        };
        let (tx, mut rx) = mpsc::channel(4);
        orchestrator.upload_watch = Some(UploadWatch {
            tx,
            url_path: "/x.ctb".to_string(),
            filename: "a.ctb".to_string(),
            start_printing: false,
        });

        let busy = StatusSnapshot {
            current_status: CurrentStatus::Busy,
            print_info: PrintInfo::default(),
            file_transfer_info: FileTransferInfo {
                status: FileTransferStatus::None,
                download_offset: 250,
                file_total_size: 1000,
                filename: "a.ctb".to_string(),
            },
        };
        orchestrator.on_status(busy).await;
        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.offset, 250);
        assert_eq!(progress.total, 1000);
        assert!(orchestrator.upload_watch.is_some());

        let done = StatusSnapshot {
            current_status: CurrentStatus::Ready,
            print_info: PrintInfo::default(),
            file_transfer_info: FileTransferInfo {
                status: FileTransferStatus::Done,
                download_offset: 1000,
                file_total_size: 1000,
                filename: "a.ctb".to_string(),
            },
        };
        orchestrator.on_status(done).await;
        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.offset, 1000);
        assert_eq!(progress.total, 1000);
        assert!(orchestrator.upload_watch.is_none());
    }

    #[tokio::test]
    async fn test_upload_progress_error_sentinel() {
        let (to_broker, _rx) = mpsc::channel(1);
        let (_tx, from_broker) = mpsc::channel(1);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let mut orchestrator = Orchestrator {
            descriptor: descriptor(),
            to_broker,
            from_broker,
            cmd_rx,
            http: crate::http::RouteHandle::for_test(),
            http_port: 8080,
            config: SessionConfig::default(),
            waiters: HashMap::new(),
            last_status: StatusSnapshot::default(),
            upload_watch: None,
            print_watch: None,
        };
        let (tx, mut rx) = mpsc::channel(4);
        orchestrator.upload_watch = Some(UploadWatch {
            tx,
            url_path: "/x.ctb".to_string(),
            filename: "a.ctb".to_string(),
            start_printing: false,
        });

        let errored = StatusSnapshot {
            current_status: CurrentStatus::Ready,
            print_info: PrintInfo::default(),
            file_transfer_info: FileTransferInfo {
                status: FileTransferStatus::Error,
                download_offset: 0,
                file_total_size: 1000,
                filename: "a.ctb".to_string(),
            },
        };
        orchestrator.on_status(errored).await;
        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.offset, -1);
        assert_eq!(progress.total, 1000);
        assert!(orchestrator.upload_watch.is_none());
    }

    #[test]
    fn test_print_watch_fails_after_window_exhausted() {
        let (reply, mut rx) = oneshot::channel();
        let (to_broker, _rx2) = mpsc::channel(1);
        let (_tx, from_broker) = mpsc::channel(1);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let mut orchestrator = Orchestrator {
            descriptor: descriptor(),
            to_broker,
            from_broker,
            cmd_rx,
            http: crate::http::RouteHandle::for_test(),
            http_port: 8080,
            config: SessionConfig {
                print_start_window: 2,
                ..SessionConfig::default()
            },
            waiters: HashMap::new(),
            last_status: StatusSnapshot::default(),
            upload_watch: None,
            print_watch: None,
        };
        let watch = PrintWatch {
            reply,
            remaining: 2,
        };
        let idle = StatusSnapshot {
            current_status: CurrentStatus::Ready,
            print_info: PrintInfo {
                status: PrintStatus::Idle,
                ..PrintInfo::default()
            },
            file_transfer_info: FileTransferInfo::default(),
        };
        orchestrator.drive_print_watch(watch, &idle);
        assert!(orchestrator.print_watch.is_some());
        let watch = orchestrator.print_watch.take().unwrap();
        orchestrator.drive_print_watch(watch, &idle);
        assert!(orchestrator.print_watch.is_none());
        assert!(rx.try_recv().unwrap().is_err());
    }
}
