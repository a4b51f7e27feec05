//! Session state machine
//!
//! `Init → SinkLoading → SinkReady → NoiseStarted → DeviceDiscovered →
//! StreamingStarted → PlaybackStarted → Running → ShuttingDown → Terminated`
//!
//! Every path out of the session (natural end of the transcoder's output, an
//! interrupt, or a hard failure during setup) goes through one teardown that
//! stops the noise generator, stops the transcoder and unloads the sink. Each
//! step is attempted regardless of the others.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::command::CommandRunner;
use crate::keepalive::KeepAliveNoise;
use crate::process::{ProcessHandle, ProcessLauncher};
use crate::pump::{LineQueue, OutputPump};
use crate::sink::{SinkHandle, SinkManager};
use crate::speaker::{RemoteDevice, SpeakerController, Speakers};
use crate::transcoder::StreamTranscoder;

/// How long teardown waits for the pump to see end-of-stream after the
/// transcoder was stopped
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle phase, in the only order phases may be entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Init,
    SinkLoading,
    SinkReady,
    NoiseStarted,
    DeviceDiscovered,
    StreamingStarted,
    PlaybackStarted,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Init => "init",
            SessionPhase::SinkLoading => "sink_loading",
            SessionPhase::SinkReady => "sink_ready",
            SessionPhase::NoiseStarted => "noise_started",
            SessionPhase::DeviceDiscovered => "device_discovered",
            SessionPhase::StreamingStarted => "streaming_started",
            SessionPhase::PlaybackStarted => "playback_started",
            SessionPhase::Running => "running",
            SessionPhase::ShuttingDown => "shutting_down",
            SessionPhase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Setup failures that abort the session before streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The virtual sink is absent after the load attempt
    NoSink,
    /// No speaker answered discovery (or none matched the preferred address)
    NoDevice,
    /// The transcoder failed to spawn or has no readable output
    NoTranscoderOutput,
}

impl AbortReason {
    pub fn exit_code(self) -> u8 {
        match self {
            AbortReason::NoDevice => 3,
            AbortReason::NoTranscoderOutput => 4,
            AbortReason::NoSink => 5,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Transcoder output reached end-of-stream
    Completed,
    /// External interrupt
    Interrupted,
    Aborted(AbortReason),
}

impl SessionOutcome {
    /// Process exit code; teardown problems never change it
    pub fn exit_code(self) -> u8 {
        match self {
            SessionOutcome::Completed | SessionOutcome::Interrupted => 0,
            SessionOutcome::Aborted(reason) => reason.exit_code(),
        }
    }
}

/// Summary handed back once the session has terminated
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    /// Every phase entered, in order, starting with `Init`
    pub phases: Vec<SessionPhase>,
    pub device: Option<RemoteDevice>,
    /// Transcoder output lines emitted while running
    pub lines_drained: usize,
}

/// Aggregate state of one session; only the orchestrator touches it
struct Session {
    phase: SessionPhase,
    phases: Vec<SessionPhase>,
    sink: Option<SinkHandle>,
    noise: Option<ProcessHandle>,
    transcoder: Option<ProcessHandle>,
    device: Option<RemoteDevice>,
    pump: Option<OutputPump>,
    queue: Option<LineQueue>,
    lines_drained: usize,
}

impl Session {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Init,
            phases: vec![SessionPhase::Init],
            sink: None,
            noise: None,
            transcoder: None,
            device: None,
            pump: None,
            queue: None,
            lines_drained: 0,
        }
    }

    fn advance(&mut self, next: SessionPhase) {
        debug_assert!(next > self.phase, "phase {} cannot follow {}", next, self.phase);
        info!(from = %self.phase, to = %next, "Session phase");
        self.phase = next;
        self.phases.push(next);
    }

    fn into_report(self, outcome: SessionOutcome) -> SessionReport {
        SessionReport {
            outcome,
            phases: self.phases,
            device: self.device,
            lines_drained: self.lines_drained,
        }
    }
}

/// Early exit from setup: `Err` carries the outcome to report
type Setup = std::result::Result<(), SessionOutcome>;

fn check_interrupt(cancel: &CancellationToken) -> Setup {
    if cancel.is_cancelled() {
        info!("Interrupted during setup");
        return Err(SessionOutcome::Interrupted);
    }
    Ok(())
}

/// Await a slow setup step unless the session is interrupted first
async fn unless_interrupted<F>(
    cancel: &CancellationToken,
    step: F,
) -> std::result::Result<F::Output, SessionOutcome>
where
    F: Future,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            info!("Interrupted during setup");
            Err(SessionOutcome::Interrupted)
        }
        output = step => Ok(output),
    }
}

/// Runs one streaming session from sink load to teardown
pub struct Orchestrator<R, L, S> {
    sink: SinkManager<R>,
    noise: KeepAliveNoise<L>,
    transcoder: StreamTranscoder<L>,
    speaker: SpeakerController<S>,
    preferred_device: String,
    volume: u8,
}

impl<R, L, S> Orchestrator<R, L, S>
where
    R: CommandRunner,
    L: ProcessLauncher,
    S: Speakers,
{
    pub fn new(
        sink: SinkManager<R>,
        noise: KeepAliveNoise<L>,
        transcoder: StreamTranscoder<L>,
        speaker: SpeakerController<S>,
        preferred_device: impl Into<String>,
        volume: u8,
    ) -> Self {
        Self {
            sink,
            noise,
            transcoder,
            speaker,
            preferred_device: preferred_device.into(),
            volume,
        }
    }

    /// Run the session to completion
    ///
    /// `cancel` is the external interrupt. It is observed between setup
    /// steps, during speaker discovery and playback start, and throughout
    /// `Running`. Cancelling it more than once has no further effect.
    pub async fn run(&self, cancel: CancellationToken) -> SessionReport {
        let mut session = Session::new();

        let outcome = match self.start(&mut session, &cancel).await {
            Ok(()) => self.drain(&mut session, &cancel).await,
            Err(outcome) => outcome,
        };

        if let SessionOutcome::Aborted(reason) = outcome {
            error!(?reason, exit_code = reason.exit_code(), "Session aborted");
        }

        self.shutdown(&mut session).await;
        session.into_report(outcome)
    }

    async fn start(&self, session: &mut Session, cancel: &CancellationToken) -> Setup {
        check_interrupt(cancel)?;

        session.advance(SessionPhase::SinkLoading);
        // Not raced: the loaded module id has to reach the session to be released
        session.sink = Some(self.sink.load(self.volume).await);
        if !self.sink.sink_exists().await {
            error!(sink = %self.sink.sink_name(), "No usable audio sink after load attempt");
            return Err(SessionOutcome::Aborted(AbortReason::NoSink));
        }
        session.advance(SessionPhase::SinkReady);
        check_interrupt(cancel)?;

        match self.noise.start() {
            Ok(handle) => session.noise = Some(handle),
            Err(e) => warn!("Continuing without keep-alive noise: {}", e),
        }
        session.advance(SessionPhase::NoiseStarted);
        check_interrupt(cancel)?;

        let found = unless_interrupted(cancel, self.speaker.discover(&self.preferred_device)).await?;
        let Some(device) = found else {
            error!("No speakers found");
            return Err(SessionOutcome::Aborted(AbortReason::NoDevice));
        };
        session.device = Some(device);
        session.advance(SessionPhase::DeviceDiscovered);
        check_interrupt(cancel)?;

        let mut transcoder = match self.transcoder.start() {
            Ok(handle) => handle,
            Err(e) => {
                error!("{}", e);
                return Err(SessionOutcome::Aborted(AbortReason::NoTranscoderOutput));
            }
        };
        let output = transcoder.take_output();
        session.transcoder = Some(transcoder);
        let Some(output) = output else {
            error!("Transcoder has no readable output");
            return Err(SessionOutcome::Aborted(AbortReason::NoTranscoderOutput));
        };
        let (pump, queue) = OutputPump::spawn(output);
        session.pump = Some(pump);
        session.queue = Some(queue);
        session.advance(SessionPhase::StreamingStarted);
        check_interrupt(cancel)?;

        if let Some(device) = session.device.as_ref() {
            let url = self.transcoder.stream_url();
            let played = unless_interrupted(cancel, self.speaker.play(device, &url, self.volume)).await?;
            if let Err(e) = played {
                warn!(name = %device.name, "Speaker did not start playback: {:#}", e);
            }
        }
        session.advance(SessionPhase::PlaybackStarted);
        check_interrupt(cancel)?;

        session.advance(SessionPhase::Running);
        Ok(())
    }

    /// Emit transcoder output until it ends or the session is interrupted
    async fn drain(&self, session: &mut Session, cancel: &CancellationToken) -> SessionOutcome {
        let Some(mut queue) = session.queue.take() else {
            return SessionOutcome::Completed;
        };

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Interrupt received");
                    return SessionOutcome::Interrupted;
                }
                line = queue.next_line() => match line {
                    Some(line) => {
                        session.lines_drained += 1;
                        info!(target: "sinkcast::vlc", "{}", line);
                    }
                    None => {
                        info!("Transcoder output closed, waiting for background reader");
                        if let Some(pump) = session.pump.take() {
                            pump.join().await;
                        }
                        return SessionOutcome::Completed;
                    }
                }
            }
        }
    }

    /// Release everything the session holds; runs at most once
    async fn shutdown(&self, session: &mut Session) {
        if session.phase >= SessionPhase::ShuttingDown {
            return;
        }
        session.advance(SessionPhase::ShuttingDown);

        if let Some(mut noise) = session.noise.take() {
            self.noise.stop(&mut noise);
        }

        if let Some(mut transcoder) = session.transcoder.take() {
            self.transcoder.stop(&mut transcoder);
        }

        // The stopped transcoder closes its output, which ends the pump
        session.queue = None;
        if let Some(pump) = session.pump.take() {
            pump.join_timeout(PUMP_JOIN_TIMEOUT).await;
        }

        if let Some(sink) = session.sink.take() {
            self.sink.unload(sink).await;
        }

        session.advance(SessionPhase::Terminated);
        info!("Session terminated");
    }
}
