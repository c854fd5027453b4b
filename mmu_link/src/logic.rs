//! The MMU link state machine
//!
//! [`ProtocolLogic`] owns the transport and decides, once per [`ProtocolLogic::step`], what to
//! transmit next and how to interpret the response that arrived. The caller's control loop only
//! ever sees [`StepStatus`] values and a few accessors.
//!
//! The link goes through three top level states. While [`ProtocolState::InitSequence`] the
//! firmware version is negotiated one component at a time and the setup registers are written.
//! Once [`ProtocolState::Running`], the logic either sits [`Scope::Idle`] (heartbeat queries
//! followed by a register poll pass) or tracks a [`Scope::Command`] until the MMU reports it
//! finished. Malformed input parks the link in [`Scope::DelayedRestart`] for one heartbeat, silence
//! restarts the handshake right away. Both kinds of failure share one [`DropoutFilter`] so isolated
//! noise stays invisible to the caller.

use crate::config::{Config, ConfigError, ErrorEscalation};
use crate::dropout::DropoutFilter;
use crate::frame::{encode_request, ResponseDecoder};
use crate::link::{Clock, Instant, Transport};
use crate::message::{FilamentState, ParamCode, RequestCode, RequestMsg, ResponseMsg};
use crate::registers::{PollCursor, RegisterPoll, RegisterWidth};
use core::fmt;
use log::{debug, info, trace, warn};

/// Number of version components exchanged during the handshake
const VERSION_STAGES: usize = 4;

/// Result of a single [`ProtocolLogic::step`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Nothing to report, keep stepping
    Processing,
    /// A command, a register access or an idle heartbeat cycle completed
    Finished,
    /// The MMU refused the command; it has been sent again
    CommandRejected,
    /// The MMU reports an error for the command in flight, see [`ProtocolLogic::error_code`]
    CommandError,
    /// Repeated malformed input from the MMU
    ProtocolError,
    /// Repeated silence from the MMU
    CommunicationTimeout,
    /// The MMU runs an unsupported firmware version
    VersionMismatch,
    /// A button was pressed on the MMU, see [`ProtocolLogic::device_button`]
    ButtonPushed,
    /// The command in flight was lost across a link restart
    Interrupted,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolState {
    Stopped,
    InitSequence,
    Running,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Scope {
    Stopped,
    StartSeq,
    Idle,
    Command,
    DelayedRestart,
}

/// Long running operations the MMU can execute
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    ToolChange(u8),
    Load(u8),
    Unload,
    Eject(u8),
    Cut(u8),
    Home(u8),
    Reset(u8),
    Mode(u8),
}

impl Command {
    pub fn request(self) -> RequestMsg {
        let (code, value) = match self {
            Command::ToolChange(slot) => (RequestCode::Tool, slot),
            Command::Load(slot) => (RequestCode::Load, slot),
            Command::Unload => (RequestCode::Unload, 0),
            Command::Eject(slot) => (RequestCode::Eject, slot),
            Command::Cut(slot) => (RequestCode::Cut, slot),
            Command::Home(mode) => (RequestCode::Home, mode),
            Command::Reset(mode) => (RequestCode::Reset, mode),
            Command::Mode(mode) => (RequestCode::Mode, mode),
        };
        RequestMsg::new(code, u16::from(value))
    }
}

/// Reasons a caller request is refused
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The link has not been started
    Stopped,
    /// A request of the same kind is already waiting to be sent
    Busy,
    /// Register access is only possible while no command is in flight or queued
    CommandInFlight,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "link is stopped"),
            Self::Busy => write!(f, "a request of this kind is already pending"),
            Self::CommandInFlight => write!(f, "a command is in flight"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RequestError {}

/// Firmware version reported by the MMU during the handshake
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
    pub build: u16,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}+{}",
            self.major, self.minor, self.revision, self.build
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Stopped,
    InitSequence(Handshake),
    Running(Running),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Handshake {
    /// Waiting for one component of the firmware version
    Version(usize),
    /// Waiting for the acknowledgement of a setup register write
    SetupWrite(usize),
    /// Unsupported firmware, nothing is sent until the next start
    Mismatch,
    /// Malformed input before the link came up, waiting one heartbeat
    DelayedRestart { since: Instant },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Running {
    Idle(IdleStage),
    Command(CommandStage),
    DelayedRestart { since: Instant },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum IdleStage {
    /// Waiting for the next heartbeat
    Ready,
    /// Filament sensor report right after the link came up
    Filament,
    Query,
    Poll(PollCursor),
    Button,
    Read,
    Write,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CommandStage {
    /// Waiting for the command to be accepted
    Sent,
    /// Waiting for the next heartbeat
    Wait,
    Query,
    Filament(AfterFilament),
    Poll(PollCursor),
    Button,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AfterFilament {
    Poll,
    Wait,
}

enum Outcome {
    Report(StepStatus),
    ProtocolError,
    Timeout,
}

impl From<StepStatus> for Outcome {
    fn from(status: StepStatus) -> Self {
        Outcome::Report(status)
    }
}

/// Drives the MMU link
///
/// `step` must be called regularly, at intervals well below the link-layer timeout. Every call
/// transmits at most one frame and consumes at most one response, and never blocks.
pub struct ProtocolLogic<T, C> {
    transport: T,
    clock: C,
    config: Config,
    decoder: ResponseDecoder,
    dropout: DropoutFilter,
    poll: RegisterPoll,
    state: State,
    last_activity: Instant,
    in_flight: Option<RequestMsg>,
    /// Command being executed, kept across link restarts
    command: Option<RequestMsg>,
    pending_command: Option<RequestMsg>,
    /// Button press or register access waiting for the link
    pending_request: Option<RequestMsg>,
    command_errors: u8,
    filament: FilamentState,
    reported_filament: Option<FilamentState>,
    version: [u16; VERSION_STAGES],
    negotiated: bool,
    progress_code: u32,
    error_code: u32,
    device_button: Option<u32>,
    read_value: Option<u16>,
}

impl<T, C> ProtocolLogic<T, C>
where
    T: Transport,
    C: Clock,
{
    pub fn new(transport: T, clock: C, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let poll = RegisterPoll::new(&config.poll_narrow, &config.poll_wide)?;
        let last_activity = clock.now();
        Ok(Self {
            transport,
            clock,
            config,
            decoder: ResponseDecoder::new(),
            dropout: DropoutFilter::new(),
            poll,
            state: State::Stopped,
            last_activity,
            in_flight: None,
            command: None,
            pending_command: None,
            pending_request: None,
            command_errors: 0,
            filament: FilamentState::default(),
            reported_filament: None,
            version: [0; VERSION_STAGES],
            negotiated: false,
            progress_code: 0,
            error_code: 0,
            device_button: None,
            read_value: None,
        })
    }

    /// Starts (or restarts) the link with a fresh handshake
    pub fn start(&mut self) {
        debug!("starting MMU link");
        self.command = None;
        self.pending_command = None;
        self.pending_request = None;
        self.dropout.record_success();
        self.start_handshake();
    }

    /// Stops all communication
    pub fn stop(&mut self) {
        debug!("stopping MMU link");
        self.state = State::Stopped;
        self.in_flight = None;
        self.command = None;
        self.pending_command = None;
        self.pending_request = None;
        self.negotiated = false;
    }

    pub fn issue_tool_change(&mut self, slot: u8) -> Result<(), RequestError> {
        self.issue_command(Command::ToolChange(slot))
    }

    /// Plans a command
    ///
    /// The command is sent right away when the link is free. Otherwise it waits until the
    /// exchange in progress, the command in flight and any register access issued before it have
    /// finished.
    pub fn issue_command(&mut self, command: Command) -> Result<(), RequestError> {
        self.ensure_started()?;
        if self.pending_command.is_some() {
            return Err(RequestError::Busy);
        }
        self.pending_command = Some(command.request());
        self.activate_pending();
        Ok(())
    }

    /// Plans a button press, also possible while a command is in flight
    pub fn issue_button(&mut self, button: u8) -> Result<(), RequestError> {
        self.plan_request(RequestMsg::new(RequestCode::Button, u16::from(button)))
    }

    pub fn read_register(&mut self, address: u8) -> Result<(), RequestError> {
        self.ensure_no_command()?;
        self.plan_request(RequestMsg::new(RequestCode::Read, u16::from(address)))
    }

    pub fn write_register(&mut self, address: u8, value: u16) -> Result<(), RequestError> {
        self.ensure_no_command()?;
        self.plan_request(RequestMsg::write(address, value))
    }

    /// Updates the printer's filament sensor state
    ///
    /// A change is reported to the MMU while a command waits for its next heartbeat, and with
    /// every command status report.
    pub fn set_filament_state(&mut self, state: FilamentState) {
        self.filament = state;
    }

    /// Advances the link by one step
    pub fn step(&mut self) -> StepStatus {
        let now = self.clock.now();
        let outcome = match (self.state, self.in_flight) {
            (State::Stopped, _) => return StepStatus::Processing,
            (_, Some(request)) => self.await_response(request, now),
            (_, None) => self.wait_step(now),
        };
        self.settle(outcome, now)
    }

    pub fn state(&self) -> ProtocolState {
        match self.state {
            State::Stopped => ProtocolState::Stopped,
            State::InitSequence(_) => ProtocolState::InitSequence,
            State::Running(_) => ProtocolState::Running,
        }
    }

    pub fn scope(&self) -> Scope {
        match self.state {
            State::Stopped => Scope::Stopped,
            State::InitSequence(Handshake::DelayedRestart { .. }) => Scope::DelayedRestart,
            State::InitSequence(_) => Scope::StartSeq,
            State::Running(Running::Idle(_)) => Scope::Idle,
            State::Running(Running::Command(_)) => Scope::Command,
            State::Running(Running::DelayedRestart { .. }) => Scope::DelayedRestart,
        }
    }

    /// Last progress code reported for the command in flight
    pub fn progress_code(&self) -> u32 {
        self.progress_code
    }

    /// Last error code reported by the MMU
    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    /// Last button pressed on the MMU
    pub fn device_button(&self) -> Option<u32> {
        self.device_button
    }

    /// Firmware version of the MMU once the handshake completed
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.negotiated.then(|| FirmwareVersion {
            major: self.version[0],
            minor: self.version[1],
            revision: self.version[2],
            build: self.version[3],
        })
    }

    /// Value gathered by the register poll
    pub fn register_value(&self, width: RegisterWidth, address: u8) -> Option<u32> {
        self.poll.value(width, address)
    }

    /// Result of the last acknowledged [`ProtocolLogic::read_register`]
    pub fn read_value(&self) -> Option<u16> {
        self.read_value
    }

    /// Command the MMU is executing, as far as the link knows
    pub fn command_in_flight(&self) -> Option<RequestMsg> {
        self.command
    }

    pub fn filament_state(&self) -> FilamentState {
        self.filament
    }

    /// Time of the last transmitted or correctly received frame
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn ensure_started(&self) -> Result<(), RequestError> {
        match self.state {
            State::Stopped => Err(RequestError::Stopped),
            _ => Ok(()),
        }
    }

    fn ensure_no_command(&self) -> Result<(), RequestError> {
        self.ensure_started()?;
        if self.command.is_some() || self.pending_command.is_some() {
            return Err(RequestError::CommandInFlight);
        }
        Ok(())
    }

    fn plan_request(&mut self, request: RequestMsg) -> Result<(), RequestError> {
        self.ensure_started()?;
        if self.pending_request.is_some() {
            return Err(RequestError::Busy);
        }
        self.pending_request = Some(request);
        self.activate_pending();
        Ok(())
    }

    fn send(&mut self, request: RequestMsg) {
        let frame = encode_request(&request);
        trace!("tx {}", frame.as_str());
        self.transport.transmit(frame.as_bytes());
        self.in_flight = Some(request);
        self.last_activity = self.clock.now();
    }

    fn send_query(&mut self) {
        self.send(RequestMsg::new(RequestCode::Query, 0));
    }

    fn send_filament(&mut self) {
        self.reported_filament = Some(self.filament);
        self.send(RequestMsg::new(
            RequestCode::FilamentSensor,
            u16::from(self.filament as u8),
        ));
    }

    fn set_running(&mut self, running: Running) {
        self.state = State::Running(running);
    }

    fn start_handshake(&mut self) {
        self.transport.discard_input();
        self.decoder.reset();
        self.negotiated = false;
        self.state = State::InitSequence(Handshake::Version(0));
        self.send(RequestMsg::new(RequestCode::Version, 0));
    }

    /// Sends queued work if the link is free, returning whether anything was sent
    fn activate_pending(&mut self) -> bool {
        match self.state {
            State::Running(Running::Idle(IdleStage::Ready)) => {
                // Register access queued before a command must not end up inside it
                if let Some(request) = self.pending_request.take() {
                    let stage = match request.code {
                        RequestCode::Read => IdleStage::Read,
                        RequestCode::Write => IdleStage::Write,
                        _ => IdleStage::Button,
                    };
                    self.set_running(Running::Idle(stage));
                    self.send(request);
                    return true;
                }
                if let Some(command) = self.pending_command.take() {
                    debug!("sending command {command}");
                    self.command = Some(command);
                    self.command_errors = 0;
                    self.progress_code = 0;
                    self.error_code = 0;
                    self.set_running(Running::Command(CommandStage::Sent));
                    self.send(command);
                    return true;
                }
                false
            }
            State::Running(Running::Command(CommandStage::Wait)) => match self.pending_request {
                Some(request) if request.code == RequestCode::Button => {
                    self.pending_request = None;
                    self.set_running(Running::Command(CommandStage::Button));
                    self.send(request);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn await_response(&mut self, request: RequestMsg, now: Instant) -> Outcome {
        loop {
            let Some(b) = self.transport.receive() else {
                if now.expired(self.last_activity, self.config.link_layer_timeout_ms) {
                    return Outcome::Timeout;
                }
                return StepStatus::Processing.into();
            };
            match self.decoder.decode_byte(b) {
                Ok(None) => {}
                Ok(Some(rsp)) => {
                    trace!("rx {rsp}");
                    self.last_activity = now;
                    self.dropout.record_success();
                    self.in_flight = None;
                    return self.handle_response(request, rsp);
                }
                Err(e) => {
                    warn!("malformed response to {request}: {e}");
                    return Outcome::ProtocolError;
                }
            }
        }
    }

    fn wait_step(&mut self, now: Instant) -> Outcome {
        let running = match self.state {
            State::Running(running) => running,
            State::InitSequence(Handshake::DelayedRestart { since }) => {
                self.restart_after_delay(since, now);
                return StepStatus::Processing.into();
            }
            _ => return StepStatus::Processing.into(),
        };
        match running {
            Running::DelayedRestart { since } => self.restart_after_delay(since, now),
            Running::Idle(IdleStage::Ready) => {
                if self.activate_pending() {
                    return StepStatus::Processing.into();
                }
                if self.data_layer_expired(now) {
                    return StepStatus::Processing.into();
                }
                if now.expired(self.last_activity, self.config.heart_beat_period_ms) {
                    self.set_running(Running::Idle(IdleStage::Query));
                    self.send_query();
                }
            }
            Running::Command(CommandStage::Wait) => {
                if self.activate_pending() {
                    return StepStatus::Processing.into();
                }
                if self.data_layer_expired(now) {
                    return StepStatus::Processing.into();
                }
                if self.reported_filament != Some(self.filament) {
                    debug!("filament sensor changed to {:?}", self.filament);
                    self.set_running(Running::Command(CommandStage::Filament(
                        AfterFilament::Wait,
                    )));
                    self.send_filament();
                } else if now.expired(self.last_activity, self.config.heart_beat_period_ms) {
                    self.set_running(Running::Command(CommandStage::Query));
                    self.send_query();
                }
            }
            _ => {}
        }
        StepStatus::Processing.into()
    }

    fn restart_after_delay(&mut self, since: Instant, now: Instant) {
        if now.expired(since, self.config.heart_beat_period_ms) {
            debug!("restarting MMU link");
            self.start_handshake();
        }
    }

    /// Restarts the link after prolonged silence, independent of the dropout filter
    fn data_layer_expired(&mut self, now: Instant) -> bool {
        if !now.expired(self.last_activity, self.config.data_layer_timeout_ms) {
            return false;
        }
        warn!("no MMU activity for {} ms", now.elapsed_since(self.last_activity));
        self.start_handshake();
        true
    }

    fn settle(&mut self, outcome: Outcome, now: Instant) -> StepStatus {
        match outcome {
            Outcome::Report(status) => status,
            Outcome::ProtocolError => {
                self.in_flight = None;
                self.decoder.reset();
                self.state = match self.state {
                    State::InitSequence(_) => {
                        State::InitSequence(Handshake::DelayedRestart { since: now })
                    }
                    _ => State::Running(Running::DelayedRestart { since: now }),
                };
                self.escalate(StepStatus::ProtocolError)
            }
            Outcome::Timeout => {
                warn!(
                    "MMU did not respond within {} ms",
                    self.config.link_layer_timeout_ms
                );
                self.start_handshake();
                self.escalate(StepStatus::CommunicationTimeout)
            }
        }
    }

    fn escalate(&mut self, cause: StepStatus) -> StepStatus {
        if self.dropout.record_failure(cause) {
            let cause = self.dropout.initial_cause();
            warn!("MMU link failing: {cause:?}");
            cause
        } else {
            debug!(
                "link failure {:?} ({} in a row)",
                cause,
                self.dropout.occurrences()
            );
            StepStatus::Processing
        }
    }

    fn handle_response(&mut self, request: RequestMsg, rsp: ResponseMsg) -> Outcome {
        match self.state {
            State::InitSequence(handshake) => self.handshake_response(handshake, request, rsp),
            State::Running(Running::Idle(stage)) => self.idle_response(stage, request, rsp),
            State::Running(Running::Command(stage)) => self.command_response(stage, request, rsp),
            _ => StepStatus::Processing.into(),
        }
    }

    fn handshake_response(
        &mut self,
        handshake: Handshake,
        request: RequestMsg,
        rsp: ResponseMsg,
    ) -> Outcome {
        match handshake {
            Handshake::Version(stage)
                if request.matches(&rsp) && rsp.param == ParamCode::Accepted =>
            {
                if !self.config.supported_version.accepts(stage, rsp.param_value) {
                    warn!(
                        "unsupported MMU firmware: version component {stage} is {}",
                        rsp.param_value
                    );
                    self.state = State::InitSequence(Handshake::Mismatch);
                    return StepStatus::VersionMismatch.into();
                }
                self.version[stage] = rsp.param_value as u16;
                if stage + 1 < VERSION_STAGES {
                    self.state = State::InitSequence(Handshake::Version(stage + 1));
                    self.send(RequestMsg::new(RequestCode::Version, (stage + 1) as u16));
                } else {
                    self.setup_write(0);
                }
            }
            Handshake::SetupWrite(idx) if request.matches(&rsp) => {
                if rsp.param != ParamCode::Accepted {
                    warn!("MMU refused setup write {request}");
                }
                self.setup_write(idx + 1);
            }
            Handshake::Mismatch | Handshake::DelayedRestart { .. } => {}
            _ => {
                debug!("unexpected handshake response {rsp}, repeating {request}");
                self.send(request);
            }
        }
        StepStatus::Processing.into()
    }

    fn setup_write(&mut self, idx: usize) {
        match self.config.setup_writes.get(idx).copied() {
            Some(write) => {
                self.state = State::InitSequence(Handshake::SetupWrite(idx));
                self.send(RequestMsg::write(write.address, write.value));
            }
            None => {
                self.negotiated = true;
                if let Some(version) = self.firmware_version() {
                    info!("MMU link established, firmware {version}");
                }
                self.set_running(Running::Idle(IdleStage::Filament));
                self.send_filament();
            }
        }
    }

    fn idle_response(
        &mut self,
        stage: IdleStage,
        request: RequestMsg,
        rsp: ResponseMsg,
    ) -> Outcome {
        if stage == IdleStage::Query {
            return self.idle_query_response(rsp);
        }
        if !request.matches(&rsp) {
            warn!("response {rsp} does not match {request}");
            return Outcome::ProtocolError;
        }
        match stage {
            IdleStage::Filament => {
                self.set_running(Running::Idle(IdleStage::Query));
                self.send_query();
                StepStatus::Processing.into()
            }
            IdleStage::Poll(cursor) => {
                if rsp.param == ParamCode::Accepted {
                    self.poll.record(cursor, rsp.param_value);
                }
                self.poll_step(false, cursor.next())
            }
            IdleStage::Button if rsp.param == ParamCode::Accepted => {
                self.poll_step(false, PollCursor::START)
            }
            IdleStage::Read | IdleStage::Write if rsp.param == ParamCode::Accepted => {
                if stage == IdleStage::Read {
                    self.read_value = Some(rsp.param_value as u16);
                }
                self.set_running(Running::Idle(IdleStage::Ready));
                StepStatus::Finished.into()
            }
            IdleStage::Button | IdleStage::Read | IdleStage::Write => {
                warn!("MMU refused {request}");
                self.set_running(Running::Idle(IdleStage::Ready));
                StepStatus::CommandRejected.into()
            }
            IdleStage::Ready | IdleStage::Query => StepStatus::Processing.into(),
        }
    }

    /// Interprets the answer to a heartbeat query while no command is known to be running
    fn idle_query_response(&mut self, rsp: ResponseMsg) -> Outcome {
        if !rsp.code.is_command() {
            warn!("unexpected query response {rsp}");
            return Outcome::ProtocolError;
        }
        if let Some(command) = self.command {
            // The link was restarted while this command was running
            if command.matches(&rsp) {
                if rsp.param == ParamCode::Finished {
                    debug!("command {command} finished while the link was down");
                    self.command = None;
                    return self.poll_step(false, PollCursor::START);
                }
                debug!("resuming command {command}");
                self.set_running(Running::Command(CommandStage::Query));
                return self.command_status(rsp);
            }
            warn!("command {command} interrupted, MMU reports {rsp}");
            self.command = None;
            self.set_running(Running::Idle(IdleStage::Ready));
            return StepStatus::Interrupted.into();
        }
        match rsp.param {
            ParamCode::Finished => self.poll_step(false, PollCursor::START),
            ParamCode::Processing if rsp.code == RequestCode::Reset => {
                self.poll_step(false, PollCursor::START)
            }
            ParamCode::Error if rsp.code == RequestCode::Reset => {
                self.error_code = rsp.param_value;
                warn!("MMU reports error {:#x}", self.error_code);
                self.poll_step(false, PollCursor::START);
                StepStatus::CommandError.into()
            }
            ParamCode::Processing | ParamCode::Error => {
                // A command is running that this side does not know about
                let command = rsp.request();
                debug!("adopting command {command}");
                self.command = Some(command);
                self.command_errors = 0;
                self.set_running(Running::Command(CommandStage::Query));
                self.command_status(rsp)
            }
            ParamCode::Button => {
                self.device_button = Some(rsp.param_value);
                self.poll_step(false, PollCursor::START);
                StepStatus::ButtonPushed.into()
            }
            ParamCode::Accepted | ParamCode::Rejected => {
                warn!("unexpected query response {rsp}");
                Outcome::ProtocolError
            }
        }
    }

    fn command_response(
        &mut self,
        stage: CommandStage,
        request: RequestMsg,
        rsp: ResponseMsg,
    ) -> Outcome {
        if stage == CommandStage::Query {
            return self.command_status(rsp);
        }
        if !request.matches(&rsp) {
            warn!("response {rsp} does not match {request}");
            return Outcome::ProtocolError;
        }
        match stage {
            CommandStage::Sent => match rsp.param {
                ParamCode::Accepted => {
                    self.set_running(Running::Command(CommandStage::Wait));
                    StepStatus::Processing.into()
                }
                ParamCode::Rejected => {
                    warn!("MMU rejected {request}, sending again");
                    self.send(request);
                    StepStatus::CommandRejected.into()
                }
                _ => {
                    warn!("unexpected response {rsp} to {request}");
                    Outcome::ProtocolError
                }
            },
            CommandStage::Filament(AfterFilament::Poll) => self.poll_step(true, PollCursor::START),
            CommandStage::Filament(AfterFilament::Wait) => {
                self.set_running(Running::Command(CommandStage::Wait));
                StepStatus::Processing.into()
            }
            CommandStage::Poll(cursor) => {
                if rsp.param == ParamCode::Accepted {
                    self.poll.record(cursor, rsp.param_value);
                }
                self.poll_step(true, cursor.next())
            }
            CommandStage::Button => {
                if rsp.param == ParamCode::Accepted {
                    self.report_filament_then_poll();
                    StepStatus::Processing.into()
                } else {
                    warn!("MMU refused {request}");
                    self.set_running(Running::Command(CommandStage::Wait));
                    StepStatus::CommandRejected.into()
                }
            }
            CommandStage::Wait | CommandStage::Query => StepStatus::Processing.into(),
        }
    }

    /// Interprets a status report for the command in flight
    fn command_status(&mut self, rsp: ResponseMsg) -> Outcome {
        let Some(command) = self.command else {
            return Outcome::ProtocolError;
        };
        if !command.matches(&rsp) {
            warn!("status {rsp} does not belong to {command}");
            return Outcome::ProtocolError;
        }
        match rsp.param {
            ParamCode::Processing => {
                self.progress_code = rsp.param_value;
                self.command_errors = 0;
                self.report_filament_then_poll();
                StepStatus::Processing.into()
            }
            ParamCode::Error => {
                self.error_code = rsp.param_value;
                self.command_errors = self.command_errors.saturating_add(1);
                warn!("command {command} failed with error {:#x}", self.error_code);
                if let ErrorEscalation::AbandonAfter(limit) = self.config.command_errors {
                    if self.command_errors >= limit {
                        warn!("abandoning command {command} after {limit} errors");
                        self.command = None;
                        self.set_running(Running::Idle(IdleStage::Ready));
                        return StepStatus::CommandError.into();
                    }
                }
                self.report_filament_then_poll();
                StepStatus::CommandError.into()
            }
            ParamCode::Button => {
                self.device_button = Some(rsp.param_value);
                self.report_filament_then_poll();
                StepStatus::ButtonPushed.into()
            }
            ParamCode::Finished => {
                debug!("command {command} finished");
                self.command = None;
                self.set_running(Running::Idle(IdleStage::Ready));
                StepStatus::Finished.into()
            }
            ParamCode::Accepted | ParamCode::Rejected => {
                warn!("unexpected status {rsp} for {command}");
                Outcome::ProtocolError
            }
        }
    }

    fn report_filament_then_poll(&mut self) {
        self.set_running(Running::Command(CommandStage::Filament(AfterFilament::Poll)));
        self.send_filament();
    }

    /// Reads the register at `cursor`, or wraps up the poll pass
    fn poll_step(&mut self, in_command: bool, cursor: PollCursor) -> Outcome {
        if let Some(entry) = self.poll.entry(cursor) {
            let stage = if in_command {
                Running::Command(CommandStage::Poll(cursor))
            } else {
                Running::Idle(IdleStage::Poll(cursor))
            };
            self.set_running(stage);
            self.send(RequestMsg::new(RequestCode::Read, u16::from(entry.address)));
            return StepStatus::Processing.into();
        }
        debug!("register poll complete");
        if in_command {
            self.set_running(Running::Command(CommandStage::Wait));
            self.activate_pending();
            return StepStatus::Processing.into();
        }
        self.set_running(Running::Idle(IdleStage::Ready));
        if self.activate_pending() {
            StepStatus::Processing.into()
        } else {
            StepStatus::Finished.into()
        }
    }
}

impl<T, C> fmt::Debug for ProtocolLogic<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolLogic")
            .field("state", &self.state)
            .field("in_flight", &self.in_flight)
            .field("command", &self.command)
            .field("pending_command", &self.pending_command)
            .field("pending_request", &self.pending_request)
            .finish_non_exhaustive()
    }
}
