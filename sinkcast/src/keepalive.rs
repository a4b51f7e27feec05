//! Near-silent pink noise that keeps the speaker from going idle

use tracing::{info, warn};

use crate::error::Result;
use crate::process::{OutputCapture, ProcessHandle, ProcessLauncher, ProcessSpec};

const SAMPLE_RATE: u32 = 44_100;

pub struct KeepAliveNoise<L> {
    launcher: L,
    binary: String,
    amplitude: f64,
}

impl<L: ProcessLauncher> KeepAliveNoise<L> {
    pub fn new(launcher: L, binary: impl Into<String>, amplitude: f64) -> Self {
        Self {
            launcher,
            binary: binary.into(),
            amplitude,
        }
    }

    pub fn spec(&self) -> ProcessSpec {
        ProcessSpec {
            name: "ffplay".to_string(),
            program: self.binary.clone(),
            args: vec![
                "-loglevel".to_string(),
                "24".to_string(),
                "-nodisp".to_string(),
                "-autoexit".to_string(),
                "-f".to_string(),
                "lavfi".to_string(),
                "-i".to_string(),
                format!("anoisesrc=c=pink:r={}:a={}", SAMPLE_RATE, self.amplitude),
            ],
            capture: OutputCapture::Discard,
        }
    }

    pub fn start(&self) -> Result<ProcessHandle> {
        let handle = self.launcher.launch(&self.spec())?;
        info!(pid = ?handle.pid(), amplitude = self.amplitude, "Keep-alive noise started");
        Ok(handle)
    }

    pub fn stop(&self, handle: &mut ProcessHandle) {
        info!("Stopping keep-alive noise");
        if let Err(e) = handle.terminate() {
            warn!("{}", e);
        }
    }
}
