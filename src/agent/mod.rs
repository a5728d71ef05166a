//! Boot-time password agent.
//!
//! Watches the ask-password directory, and answers every new `ask.*` request
//! with the boot or root key read fresh from disk. The protocol is
//! described at <https://systemd.io/PASSWORD_AGENTS/>.

use crate::config::AgentConfig;
use crate::keyfile::{self, KeyFileError};
use crate::sealed::KeyKind;
use inotify::{EventMask, Inotify, WatchMask};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::time::{clock_gettime, ClockId};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

mod ask;

pub use ask::{AskError, AskRequest, ASK_SECTION};

/// Status byte preceding the password in a successful reply
pub const ACK: u8 = b'+';
/// Status byte of a refusal
pub const NACK: u8 = b'-';

const EVENT_BUFFER_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to watch {path}: {source}")]
    Watch { path: PathBuf, source: io::Error },
    #[error("failed to read request {path}: {source}")]
    ReadRequest { path: PathBuf, source: io::Error },
    #[error("malformed request: {0}")]
    Ask(#[from] AskError),
    #[error(transparent)]
    KeyFile(#[from] KeyFileError),
    #[error("failed to answer on {path}: {source}")]
    Reply { path: PathBuf, source: io::Error },
    #[error("request {0} expired before it was answered")]
    Expired(String),
    #[error("waiting for notifications failed: {0}")]
    Poll(#[from] Errno),
    #[error("failed to read notifications: {0}")]
    Events(io::Error),
}

pub type Result<T, E = AgentError> = core::result::Result<T, E>;

/// What became of a single notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The file name lacks the request prefix
    Ignored,
    /// Already processed during this run
    Duplicate,
    Answered(KeyKind),
}

fn monotonic_usec() -> Result<u64> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    let secs = u64::try_from(now.tv_sec()).unwrap_or_default();
    let nanos = u64::try_from(now.tv_nsec()).unwrap_or_default();
    Ok(secs.saturating_mul(1_000_000).saturating_add(nanos / 1_000))
}

fn reply(socket: &Path, status: u8, secret: &[u8]) -> Result<()> {
    let reply_error = |source| AgentError::Reply {
        path: socket.to_path_buf(),
        source,
    };
    let mut datagram = Zeroizing::new(Vec::with_capacity(secret.len() + 1));
    datagram.push(status);
    datagram.extend_from_slice(secret);
    let sender = UnixDatagram::unbound().map_err(reply_error)?;
    sender.send_to(&datagram, socket).map_err(reply_error)?;
    Ok(())
}

/// Everything the agent owns for its lifetime. Only the agent thread
/// touches it.
#[derive(Debug)]
pub struct DaemonState {
    config: AgentConfig,
    boot_key: PathBuf,
    root_key: PathBuf,
    seen: HashSet<String>,
}

impl DaemonState {
    pub fn new(
        config: AgentConfig,
        boot_key: impl Into<PathBuf>,
        root_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            boot_key: boot_key.into(),
            root_key: root_key.into(),
            seen: HashSet::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    fn key_path(&self, kind: KeyKind) -> &Path {
        match kind {
            KeyKind::Boot => &self.boot_key,
            KeyKind::Root => &self.root_key,
        }
    }

    fn is_request(&self, name: &str) -> bool {
        name.starts_with(&self.config.request_prefix)
    }

    /// Processes one notification about `name` in the ask directory.
    ///
    /// A request is marked seen before it is parsed, so a later notification
    /// for the same id never produces a second reply even if this attempt
    /// fails.
    pub fn handle(&mut self, name: &str) -> Result<Handled> {
        if !self.is_request(name) {
            return Ok(Handled::Ignored);
        }
        if !self.seen.insert(name.to_owned()) {
            return Ok(Handled::Duplicate);
        }

        let path = self.config.ask_dir.join(name);
        let contents = fs::read_to_string(&path).map_err(|source| AgentError::ReadRequest {
            path: path.clone(),
            source,
        })?;
        let request = AskRequest::parse(name, &contents, &self.config.boot_marker)?;
        if request.not_after.is_some() && request.is_expired(monotonic_usec()?) {
            return Err(AgentError::Expired(request.id));
        }

        let kind = match request.is_boot {
            true => KeyKind::Boot,
            false => KeyKind::Root,
        };
        log::info!(
            "request {} from pid {:?} wants the {} key",
            request.id,
            request.pid,
            kind
        );

        let secret = match keyfile::read_secret(self.key_path(kind)) {
            Ok(secret) => secret,
            Err(err) => {
                if self.config.send_negative_ack {
                    if let Err(nack_err) = reply(&request.socket, NACK, &[]) {
                        log::warn!("could not refuse {}: {}", request.id, nack_err);
                    }
                }
                return Err(err.into());
            }
        };
        reply(&request.socket, ACK, &secret)?;
        log::info!(
            "answered {} on {} ({} bytes)",
            request.id,
            request.socket.display(),
            secret.len()
        );
        Ok(Handled::Answered(kind))
    }

    /// Handles a notification, logging instead of propagating failures.
    fn dispatch(&mut self, name: &str) {
        match self.handle(name) {
            Ok(Handled::Duplicate) => log::debug!("request {} already handled", name),
            Ok(_) => {}
            Err(err) => log::warn!("skipping request {}: {}", name, err),
        }
    }

    /// Marks a request as owned by someone else without answering it.
    fn acknowledge(&mut self, name: &str) {
        let path = self.config.ask_dir.join(name);
        if let Err(err) = File::open(&path) {
            log::warn!("could not open pending request {}: {}", path.display(), err);
        }
        self.seen.insert(name.to_owned());
        log::debug!("acknowledged pending request {}", name);
    }

    /// Request files currently present, sorted by name.
    fn pending_requests(&self) -> io::Result<Vec<String>> {
        let mut pending = Vec::new();
        for entry in fs::read_dir(&self.config.ask_dir)? {
            let name = entry?.file_name();
            match name.to_str() {
                Some(name) if self.is_request(name) => pending.push(name.to_owned()),
                _ => {}
            }
        }
        pending.sort();
        Ok(pending)
    }

    fn rescan(&mut self, answer: bool) {
        let pending = match self.pending_requests() {
            Ok(pending) => pending,
            Err(err) => {
                log::warn!(
                    "failed to list {}: {}",
                    self.config.ask_dir.display(),
                    err
                );
                return;
            }
        };
        for name in pending {
            if answer {
                self.dispatch(&name);
            } else if !self.has_seen(&name) {
                self.acknowledge(&name);
            }
        }
    }
}

pub trait AgentStage {}

pub struct Init;

pub struct Watching {
    inotify: Inotify,
}

impl AgentStage for Init {}
impl AgentStage for Watching {}

pub struct PasswordAgent<S: AgentStage> {
    state: DaemonState,
    stage: S,
}

pub type InitialAgent = PasswordAgent<Init>;
pub type WatchingAgent = PasswordAgent<Watching>;

impl<S: AgentStage> PasswordAgent<S> {
    pub fn state(&self) -> &DaemonState {
        &self.state
    }
}

enum Notification {
    Changed(String),
    Overflow,
}

impl InitialAgent {
    pub fn new(
        config: AgentConfig,
        boot_key: impl Into<PathBuf>,
        root_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state: DaemonState::new(config, boot_key, root_key),
            stage: Init,
        }
    }

    /// Establishes the directory watch, then takes stock of requests that
    /// were already pending. Only a failing watch is an error.
    pub fn watch(mut self) -> Result<WatchingAgent> {
        let dir = self.state.config.ask_dir.clone();
        let watch_error = |source| AgentError::Watch {
            path: dir.clone(),
            source,
        };
        let inotify = Inotify::init().map_err(watch_error)?;
        inotify
            .watches()
            .add(&dir, WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO)
            .map_err(watch_error)?;
        log::info!("watching {} for password requests", dir.display());

        let answer = self.state.config.answer_existing;
        self.state.rescan(answer);

        Ok(WatchingAgent {
            state: self.state,
            stage: Watching { inotify },
        })
    }
}

impl WatchingAgent {
    /// Waits up to the configured timeout, then handles every notification
    /// that arrived, in delivery order. Returns how many were drained.
    pub fn poll_once(&mut self) -> Result<usize> {
        let timeout = i32::try_from(self.state.config.poll_timeout_ms).unwrap_or(i32::MAX);
        let mut fds = [PollFd::new(
            self.stage.inotify.as_raw_fd(),
            PollFlags::POLLIN,
        )];
        match poll(&mut fds, timeout) {
            Ok(0) | Err(Errno::EINTR) => return Ok(0),
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }

        let notifications = self.drain()?;
        let drained = notifications.len();
        for notification in notifications {
            match notification {
                Notification::Changed(name) => self.state.dispatch(&name),
                Notification::Overflow => {
                    log::warn!("notification queue overflowed, rescanning");
                    self.state.rescan(true);
                }
            }
        }
        Ok(drained)
    }

    fn drain(&mut self) -> Result<Vec<Notification>> {
        let mut buffer = [0u8; EVENT_BUFFER_LEN];
        let mut notifications = Vec::new();
        loop {
            let events = match self.stage.inotify.read_events(&mut buffer) {
                Ok(events) => events,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(AgentError::Events(err)),
            };
            let before = notifications.len();
            for event in events {
                if event.mask.contains(EventMask::Q_OVERFLOW) {
                    notifications.push(Notification::Overflow);
                } else if let Some(name) = event.name.and_then(|name| name.to_str()) {
                    notifications.push(Notification::Changed(name.to_owned()));
                }
            }
            if notifications.len() == before {
                break;
            }
        }
        Ok(notifications)
    }

    /// Serves requests until the process is terminated.
    pub fn run(mut self) -> ! {
        loop {
            if let Err(err) = self.poll_once() {
                log::warn!("{}", err);
            }
        }
    }
}
