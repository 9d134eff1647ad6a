//! Fastboot protocol engine.
//!
//! The engine owns the command registry, the published variables and the
//! download buffer. A session reads one command packet at a time from a
//! [`Transport`], dispatches it to the first registered prefix that matches
//! and guarantees that every command ends in exactly one `OKAY` or `FAIL`
//! frame. Transport failures end the session; protocol errors never do.

pub mod frame;

use alloc::borrow::ToOwned;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, info, warn};

use self::frame::{MAX_COMMAND_LEN, ResponseKind, encode, encode_data, parse_hex_length, trim_packet};

/// Protocol version published as the `version` variable.
pub const PROTOCOL_VERSION: &str = "0.5";

/// Largest read issued while receiving a download payload.
pub const DOWNLOAD_CHUNK_LEN: usize = 4096;

/// Errors raised by the byte transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportError {
    /// The peer went away (zero-length read, cable unplugged).
    Disconnected,
    /// Raw OS error reported by the device.
    Io(i32),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Disconnected => f.write_str("transport disconnected"),
            TransportError::Io(code) => write!(f, "transport i/o error {code}"),
        }
    }
}

impl core::error::Error for TransportError {}

/// Duplex byte channel carrying the protocol.
pub trait Transport {
    /// Reads up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes the complete frame.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data)
    }
}

/// Source of freshly opened transports for consecutive sessions.
pub trait TransportProvider {
    type Transport: Transport;

    /// Opens the next transport, or `None` when serving should stop.
    fn open(&mut self) -> Option<Self::Transport>;
}

/// Power admission check consulted before every matched command.
pub trait AdmissionGate {
    /// Returns `true` when commands must be refused.
    fn is_power_low(&self) -> bool;
}

/// Gate that admits every command.
#[derive(Copy, Clone, Debug, Default)]
pub struct AlwaysAdmit;

impl AdmissionGate for AlwaysAdmit {
    fn is_power_low(&self) -> bool {
        false
    }
}

impl<G: AdmissionGate + ?Sized> AdmissionGate for &G {
    fn is_power_low(&self) -> bool {
        (**self).is_power_low()
    }
}

impl<G: AdmissionGate + ?Sized> AdmissionGate for Arc<G> {
    fn is_power_low(&self) -> bool {
        (**self).is_power_low()
    }
}

/// Hook notified around every command, used for progress markers.
pub trait CommandObserver {
    fn command_started(&mut self, _command: &str) {}

    fn command_finished(&mut self, _command: &str, _state: SessionState) {}
}

/// Observer that ignores every notification.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopObserver;

impl CommandObserver for NoopObserver {}

/// Protocol session state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// No transport attached.
    Offline,
    /// A command is running and has not answered yet.
    Command,
    /// The last command answered.
    Complete,
    /// The transport failed; the session must be torn down.
    Error,
}

/// Writes frames for the running command and tracks the session state.
pub struct Responder<'a> {
    transport: &'a mut dyn Transport,
    state: SessionState,
    error: Option<TransportError>,
}

impl<'a> Responder<'a> {
    fn new(transport: &'a mut dyn Transport, state: SessionState) -> Self {
        Self {
            transport,
            state,
            error: None,
        }
    }

    /// Current session state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Answers the running command with `OKAY<info>`.
    pub fn okay(&mut self, info: &str) {
        self.ack(ResponseKind::Okay, info);
    }

    /// Answers the running command with `FAIL<reason>`.
    pub fn fail(&mut self, reason: &str) {
        self.ack(ResponseKind::Fail, reason);
    }

    /// Writes a response frame. Ignored unless a command is running; only
    /// `OKAY` and `FAIL` finish the command.
    pub fn ack(&mut self, kind: ResponseKind, payload: &str) {
        if self.state != SessionState::Command {
            return;
        }
        debug!("fastboot ack {kind:?}: {payload}");
        if kind.is_terminal() {
            self.state = SessionState::Complete;
        }
        let frame = encode(kind, payload.as_bytes());
        self.write_frame(&frame);
    }

    /// Writes an `INFO` progress frame for the running command.
    pub fn info(&mut self, text: &str) {
        if self.state != SessionState::Command {
            return;
        }
        let frame = encode(ResponseKind::Info, text.as_bytes());
        self.write_frame(&frame);
    }

    fn write_frame(&mut self, frame: &[u8]) {
        if self.state == SessionState::Error {
            return;
        }
        if let Err(err) = self.transport.write(frame) {
            self.set_error(err);
        }
    }

    fn set_error(&mut self, err: TransportError) {
        warn!("fastboot transport failure: {err}");
        self.state = SessionState::Error;
        self.error.get_or_insert(err);
    }

    /// Fills `buf` from the transport in bounded chunks.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut offset = 0;
        while offset < buf.len() {
            let end = buf.len().min(offset + DOWNLOAD_CHUNK_LEN);
            match self.transport.read(&mut buf[offset..end]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(read) => offset += read,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Name/value table answered by `getvar:`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Variables {
    entries: Vec<(String, String)>,
}

impl Variables {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Publishes `name`, replacing the value in place if it already exists.
    pub fn publish(&mut self, name: &str, value: &str) {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(key, _)| key == name) {
            value.clone_into(existing);
        } else {
            self.entries.push((name.to_string(), value.to_string()));
        }
    }

    /// Returns the value published for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Number of distinct variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing has been published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(name, value)` pairs in publication order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

/// Errors raised while validating a download request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DownloadError {
    /// The length argument was empty or not hexadecimal.
    InvalidLength,
    /// The length exceeds the buffer capacity.
    TooLarge { requested: usize, capacity: usize },
}

impl DownloadError {
    /// Reason sent back in the `FAIL` frame.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            DownloadError::InvalidLength => "invalid download length",
            DownloadError::TooLarge { .. } => "data too large",
        }
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::InvalidLength => f.write_str("invalid download length"),
            DownloadError::TooLarge {
                requested,
                capacity,
            } => write!(f, "download of {requested} bytes exceeds {capacity} byte buffer"),
        }
    }
}

impl core::error::Error for DownloadError {}

/// Bounded staging area for `download:` payloads.
///
/// Bytes past [`DownloadBuffer::staged_length`] are left over from earlier
/// downloads and carry no meaning.
#[derive(Clone, Debug)]
pub struct DownloadBuffer {
    data: Vec<u8>,
    capacity: usize,
    staged_length: usize,
}

impl DownloadBuffer {
    /// Creates a buffer that accepts payloads up to `capacity` bytes.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            staged_length: 0,
        }
    }

    /// Maximum payload size.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Length of the last completed download.
    #[must_use]
    pub const fn staged_length(&self) -> usize {
        self.staged_length
    }

    /// Payload of the last completed download.
    #[must_use]
    pub fn staged(&self) -> &[u8] {
        &self.data[..self.staged_length]
    }

    /// Checks `length` against the capacity.
    pub fn validate(&self, length: usize) -> Result<(), DownloadError> {
        if length > self.capacity {
            Err(DownloadError::TooLarge {
                requested: length,
                capacity: self.capacity,
            })
        } else {
            Ok(())
        }
    }

    fn begin(&mut self, length: usize) -> &mut [u8] {
        self.staged_length = 0;
        if self.data.len() < length {
            self.data.resize(length, 0);
        }
        &mut self.data[..length]
    }

    fn commit(&mut self, length: usize) {
        self.staged_length = length;
    }
}

/// Everything a command handler may touch while it runs.
pub struct CommandContext<'a, C> {
    pub responder: Responder<'a>,
    pub download: &'a mut DownloadBuffer,
    pub variables: &'a mut Variables,
    pub pipeline: &'a mut C,
}

impl<C> CommandContext<'_, C> {
    /// Answers `OKAY<info>`.
    pub fn okay(&mut self, info: &str) {
        self.responder.okay(info);
    }

    /// Answers `FAIL<reason>`.
    pub fn fail(&mut self, reason: &str) {
        self.responder.fail(reason);
    }

    /// Sends an `INFO` progress frame.
    pub fn info(&mut self, text: &str) {
        self.responder.info(text);
    }

    /// Payload of the last completed download.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.download.staged()
    }
}

/// Command handler invoked with the text following the matched prefix.
pub type Handler<C> = fn(&str, &mut CommandContext<'_, C>);

struct Registration<C> {
    prefix: &'static str,
    handler: Handler<C>,
}

/// Ordered prefix table. The most recent registration is matched first.
pub struct Registry<C> {
    entries: Vec<Registration<C>>,
}

impl<C> Registry<C> {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts `prefix` at the head of the table.
    pub fn register(&mut self, prefix: &'static str, handler: Handler<C>) {
        self.entries.insert(0, Registration { prefix, handler });
    }

    /// Returns the first matching handler and the remaining argument text.
    pub fn lookup<'l>(&self, line: &'l str) -> Option<(Handler<C>, &'l str)> {
        self.entries.iter().find_map(|entry| {
            line.strip_prefix(entry.prefix)
                .map(|rest| (entry.handler, rest))
        })
    }

    /// Registered prefixes in match order.
    pub fn prefixes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|entry| entry.prefix)
    }
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fastboot engine parameterised over the pipeline context `C` handed to
/// handlers and the power admission gate `G`.
pub struct Engine<C, G = AlwaysAdmit> {
    registry: Registry<C>,
    variables: Variables,
    download: DownloadBuffer,
    gate: G,
    state: SessionState,
}

impl<C, G: AdmissionGate> Engine<C, G> {
    /// Creates an engine with the built-in `getvar:` and `download:` commands
    /// and the `version` variable.
    pub fn new(download_capacity: usize, gate: G) -> Self {
        let mut engine = Self {
            registry: Registry::new(),
            variables: Variables::new(),
            download: DownloadBuffer::new(download_capacity),
            gate,
            state: SessionState::Offline,
        };
        engine.register("getvar:", handle_getvar::<C>);
        engine.register("download:", handle_download::<C>);
        engine.publish("version", PROTOCOL_VERSION);
        engine
    }

    /// Registers `handler` for lines starting with `prefix`.
    pub fn register(&mut self, prefix: &'static str, handler: Handler<C>) {
        self.registry.register(prefix, handler);
    }

    /// Publishes a variable for `getvar:`.
    pub fn publish(&mut self, name: &str, value: &str) {
        self.variables.publish(name, value);
    }

    /// Looks up a published variable.
    #[must_use]
    pub fn get_var(&self, name: &str) -> Option<&str> {
        self.variables.get(name)
    }

    /// Published variables.
    #[must_use]
    pub const fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Registered command prefixes in match order.
    #[must_use]
    pub const fn registry(&self) -> &Registry<C> {
        &self.registry
    }

    /// Download staging buffer.
    #[must_use]
    pub const fn download(&self) -> &DownloadBuffer {
        &self.download
    }

    /// Current session state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Dispatches one command packet.
    ///
    /// Returns the transport error if the session can no longer continue.
    pub fn handle_packet(
        &mut self,
        packet: &[u8],
        transport: &mut dyn Transport,
        pipeline: &mut C,
        observer: &mut dyn CommandObserver,
    ) -> Result<(), TransportError> {
        let line = core::str::from_utf8(trim_packet(packet)).ok();
        let command = line.unwrap_or("");
        info!("fastboot: {command}");
        observer.command_started(command);

        let matched = line.and_then(|line| self.registry.lookup(line));
        let mut ctx = CommandContext {
            responder: Responder::new(transport, SessionState::Command),
            download: &mut self.download,
            variables: &mut self.variables,
            pipeline,
        };

        match matched {
            Some((handler, argument)) => {
                if self.gate.is_power_low() {
                    ctx.fail("battery too low");
                } else {
                    handler(argument, &mut ctx);
                    if ctx.responder.state() == SessionState::Command {
                        ctx.fail("unknown reason");
                    }
                }
            }
            None => ctx.fail("unknown command"),
        }

        self.state = ctx.responder.state();
        let error = ctx.responder.error;
        observer.command_finished(command, self.state);
        error.map_or(Ok(()), Err)
    }

    /// Runs commands until the transport fails, then returns to
    /// [`SessionState::Offline`].
    pub fn run_session(
        &mut self,
        transport: &mut dyn Transport,
        pipeline: &mut C,
        observer: &mut dyn CommandObserver,
    ) -> TransportError {
        info!("fastboot: processing commands");
        self.state = SessionState::Complete;
        let mut packet = [0u8; MAX_COMMAND_LEN];
        let error = loop {
            let read = match transport.read(&mut packet) {
                Ok(0) => break TransportError::Disconnected,
                Ok(read) => read,
                Err(err) => break err,
            };
            if let Err(err) = self.handle_packet(&packet[..read], transport, pipeline, observer) {
                break err;
            }
        };
        self.state = SessionState::Offline;
        info!("fastboot: session closed ({error})");
        error
    }

    /// Serves consecutive sessions until the provider stops handing out
    /// transports.
    pub fn serve<P: TransportProvider>(
        &mut self,
        provider: &mut P,
        pipeline: &mut C,
        observer: &mut dyn CommandObserver,
    ) {
        while let Some(mut transport) = provider.open() {
            let _ = self.run_session(&mut transport, pipeline, observer);
        }
    }
}

fn handle_getvar<C>(name: &str, ctx: &mut CommandContext<'_, C>) {
    let value = ctx.variables.get(name).unwrap_or("").to_string();
    ctx.okay(&value);
}

fn handle_download<C>(argument: &str, ctx: &mut CommandContext<'_, C>) {
    let length = match parse_hex_length(argument) {
        Some(length) => length,
        None => {
            ctx.fail(DownloadError::InvalidLength.reason());
            return;
        }
    };
    let Ok(size) = usize::try_from(length) else {
        ctx.fail("data too large");
        return;
    };
    if let Err(err) = ctx.download.validate(size) {
        warn!("fastboot: {err}");
        ctx.fail(err.reason());
        return;
    }

    ctx.responder.write_frame(&encode_data(length));
    if ctx.responder.state() == SessionState::Error {
        return;
    }

    let buffer = ctx.download.begin(size);
    if let Err(err) = ctx.responder.read_exact(buffer) {
        ctx.responder.set_error(err);
        return;
    }
    ctx.download.commit(size);
    debug!("fastboot: staged {size} bytes");
    ctx.okay("");
}
