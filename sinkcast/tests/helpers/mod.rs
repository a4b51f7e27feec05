//! Test doubles for the external collaborators
//!
//! - [`FakePactl`]: in-memory audio server answering `pactl` commands
//! - [`FakeLauncher`]: process launcher with scripted output streams
//! - [`FakeSpeakers`]: speaker directory recording control calls in order

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sinkcast::command::{CommandError, CommandLine, CommandRunner};
use sinkcast::process::{OutputLines, ProcessHandle, ProcessLauncher, ProcessSpec};
use sinkcast::speaker::{RemoteDevice, Speakers};
use sinkcast::Error;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

// ============================================================================
// pactl
// ============================================================================

#[derive(Debug)]
pub struct PactlState {
    pub sinks: Vec<String>,
    pub default_sink: String,
    pub muted: HashMap<String, bool>,
    pub volumes: HashMap<String, String>,
    /// Module id handed out by the next load-module
    pub next_module_id: u32,
    /// When false, load-module reports success but no sink appears
    pub load_creates_sink: bool,
    /// Overrides load-module's stdout
    pub load_output: Option<String>,
    /// pactl subcommands that fail (e.g. "set-sink-volume")
    pub failing: HashSet<String>,
    pub log: Vec<CommandLine>,
    loaded: HashMap<u32, String>,
}

/// Shared fake audio server; clones see the same state
#[derive(Debug, Clone)]
pub struct FakePactl {
    pub state: Arc<Mutex<PactlState>>,
}

impl FakePactl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PactlState {
                sinks: vec!["alsa_output.analog-stereo".to_string()],
                default_sink: "alsa_output.analog-stereo".to_string(),
                muted: HashMap::new(),
                volumes: HashMap::new(),
                next_module_id: 42,
                load_creates_sink: true,
                load_output: None,
                failing: HashSet::new(),
                log: Vec::new(),
                loaded: HashMap::new(),
            })),
        }
    }

    pub fn with_existing_sink(self, name: &str) -> Self {
        self.state.lock().unwrap().sinks.push(name.to_string());
        self
    }

    pub fn failing(self, subcommand: &str) -> Self {
        self.state.lock().unwrap().failing.insert(subcommand.to_string());
        self
    }

    /// Every command issued, rendered as a string
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.iter().map(|c| c.to_string()).collect()
    }

    /// Commands other than the read-only queries
    pub fn mutations(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|c| c != "pactl list sinks short" && c != "pactl get-default-sink")
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn is_muted(&self, sink: &str) -> bool {
        *self.state.lock().unwrap().muted.get(sink).unwrap_or(&false)
    }

    pub fn default_sink(&self) -> String {
        self.state.lock().unwrap().default_sink.clone()
    }

    pub fn has_sink(&self, sink: &str) -> bool {
        self.state.lock().unwrap().sinks.iter().any(|s| s == sink)
    }
}

fn resolve<'a>(state: &'a PactlState, name: &'a str) -> &'a str {
    if name == "@DEFAULT_SINK@" {
        &state.default_sink
    } else {
        name
    }
}

#[async_trait]
impl CommandRunner for FakePactl {
    async fn run(&self, command: &CommandLine) -> Result<String, CommandError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(command.clone());

        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        let subcommand = args.first().copied().unwrap_or_default();

        if state.failing.contains(subcommand) {
            return Err(CommandError::Failed {
                command: command.to_string(),
                status: "exit status: 1".to_string(),
                output: "Failure: simulated".to_string(),
            });
        }

        match args.as_slice() {
            ["list", "sinks", "short"] => Ok(state
                .sinks
                .iter()
                .enumerate()
                .map(|(i, name)| format!("{}\t{}\tmodule-fake.c\ts16le 2ch 44100Hz\tIDLE", i, name))
                .collect::<Vec<_>>()
                .join("\n")),
            ["get-default-sink"] => Ok(state.default_sink.clone()),
            ["load-module", "module-combine-sink", rest @ ..] => {
                let name = rest
                    .iter()
                    .find_map(|a| a.strip_prefix("sink_name="))
                    .unwrap_or("combined")
                    .to_string();
                let id = state.next_module_id;
                state.next_module_id += 1;
                if state.load_creates_sink {
                    state.sinks.push(name.clone());
                    state.loaded.insert(id, name);
                }
                Ok(state.load_output.clone().unwrap_or_else(|| id.to_string()))
            }
            ["unload-module", id] => {
                let id: u32 = id.parse().unwrap_or(0);
                if let Some(name) = state.loaded.remove(&id) {
                    state.sinks.retain(|s| s != &name);
                    if state.default_sink == name {
                        state.default_sink = state.sinks.first().cloned().unwrap_or_default();
                    }
                }
                Ok(String::new())
            }
            ["set-sink-mute", sink, value] => {
                let sink = resolve(&state, sink).to_string();
                state.muted.insert(sink, *value == "true");
                Ok(String::new())
            }
            ["set-sink-volume", sink, volume] => {
                let sink = sink.to_string();
                state.volumes.insert(sink, volume.to_string());
                Ok(String::new())
            }
            ["set-default-sink", sink] => {
                state.default_sink = sink.to_string();
                Ok(String::new())
            }
            _ => Err(CommandError::Failed {
                command: command.to_string(),
                status: "exit status: 1".to_string(),
                output: "unknown command".to_string(),
            }),
        }
    }
}

// ============================================================================
// Process launcher
// ============================================================================

/// What a launched fake process produces
#[derive(Debug, Clone)]
pub enum FakeOutput {
    /// Lines followed by end-of-stream, as if the process exited by itself
    Finite(Vec<String>),
    /// Lines, then the stream stays open until the process is terminated
    UntilTerminated(Vec<String>),
    /// A handle without any readable output
    NoOutput,
    /// Spawning fails
    SpawnError,
}

#[derive(Debug, Default)]
pub struct LauncherState {
    pub scripts: HashMap<String, FakeOutput>,
    pub launched: Vec<ProcessSpec>,
    pub terminations: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeLauncher {
    pub state: Arc<Mutex<LauncherState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the process launched under `name` ("vlc" or "ffplay")
    pub fn script(self, name: &str, output: FakeOutput) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(name.to_string(), output);
        self
    }

    pub fn launched(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .launched
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn terminations(&self, name: &str) -> usize {
        *self.state.lock().unwrap().terminations.get(name).unwrap_or(&0)
    }
}

fn lines_output(lines: Vec<String>) -> (OutputLines, tokio::sync::mpsc::UnboundedSender<String>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    for line in lines {
        let _ = tx.send(line);
    }
    let stream: OutputLines = Box::pin(UnboundedReceiverStream::new(rx).map(Ok::<String, std::io::Error>));
    (stream, tx)
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &ProcessSpec) -> sinkcast::Result<ProcessHandle> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.launched.push(spec.clone());
            state
                .scripts
                .get(&spec.name)
                .cloned()
                .unwrap_or(FakeOutput::UntilTerminated(Vec::new()))
        };

        let state = self.state.clone();
        let name = spec.name.clone();
        let record_termination = move || {
            *state.lock().unwrap().terminations.entry(name).or_insert(0) += 1;
        };

        match script {
            FakeOutput::Finite(lines) => {
                let (output, tx) = lines_output(lines);
                drop(tx);
                Ok(ProcessHandle::detached(spec.name.clone(), Some(output), record_termination))
            }
            FakeOutput::UntilTerminated(lines) => {
                let (output, tx) = lines_output(lines);
                // Terminating drops the sender, which ends the stream
                Ok(ProcessHandle::detached(spec.name.clone(), Some(output), move || {
                    drop(tx);
                    record_termination();
                }))
            }
            FakeOutput::NoOutput => Ok(ProcessHandle::detached(spec.name.clone(), None, record_termination)),
            FakeOutput::SpawnError => Err(Error::Spawn {
                name: spec.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            }),
        }
    }
}

// ============================================================================
// Speakers
// ============================================================================

#[derive(Debug, Default)]
pub struct SpeakerState {
    pub devices: Vec<RemoteDevice>,
    pub discovery_error: bool,
    /// Discovery takes this long before answering
    pub discovery_delay: Option<Duration>,
    /// Control call that fails, by name (e.g. "enqueue_uri")
    pub failing_call: Option<String>,
    pub calls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSpeakers {
    pub state: Arc<Mutex<SpeakerState>>,
}

pub fn device(identity: &str, address: &str) -> RemoteDevice {
    RemoteDevice {
        identity: identity.to_string(),
        address: address.to_string(),
        name: format!("Room {}", identity),
    }
}

impl FakeSpeakers {
    pub fn with_devices(devices: Vec<RemoteDevice>) -> Self {
        let speakers = Self::default();
        speakers.state.lock().unwrap().devices = devices;
        speakers
    }

    pub fn failing_call(self, call: &str) -> Self {
        self.state.lock().unwrap().failing_call = Some(call.to_string());
        self
    }

    pub fn slow_discovery(self, delay: Duration) -> Self {
        self.state.lock().unwrap().discovery_delay = Some(delay);
        self
    }

    pub fn discovery_error(self) -> Self {
        self.state.lock().unwrap().discovery_error = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: &str, detail: String) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(detail);
        if state.failing_call.as_deref() == Some(call) {
            anyhow::bail!("{} failed: simulated", call);
        }
        Ok(())
    }
}

#[async_trait]
impl Speakers for FakeSpeakers {
    async fn discover(&self) -> anyhow::Result<Vec<RemoteDevice>> {
        let delay = self.state.lock().unwrap().discovery_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        if state.discovery_error {
            anyhow::bail!("network unreachable");
        }
        Ok(state.devices.clone())
    }

    async fn clear_queue(&self, device: &RemoteDevice) -> anyhow::Result<()> {
        self.record("clear_queue", format!("clear_queue {}", device.identity))
    }

    async fn enqueue_uri(&self, device: &RemoteDevice, uri: &str) -> anyhow::Result<()> {
        self.record("enqueue_uri", format!("enqueue_uri {} {}", device.identity, uri))
    }

    async fn play_from_queue(&self, device: &RemoteDevice, index: u32) -> anyhow::Result<()> {
        self.record("play_from_queue", format!("play_from_queue {} {}", device.identity, index))
    }

    async fn set_volume(&self, device: &RemoteDevice, volume_percent: u8) -> anyhow::Result<()> {
        self.record("set_volume", format!("set_volume {} {}", device.identity, volume_percent))
    }

    async fn play(&self, device: &RemoteDevice) -> anyhow::Result<()> {
        self.record("play", format!("play {}", device.identity))
    }
}
