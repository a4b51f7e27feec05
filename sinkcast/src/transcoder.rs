//! FLAC transcoder serving the sink monitor over HTTP
//!
//! VLC reads `pulse://<sink>.monitor` and serves the re-encoded stream at
//! `http://<host>:<port>/<stream>`.

use std::net::IpAddr;

use tracing::{info, warn};

use crate::error::Result;
use crate::process::{OutputCapture, ProcessHandle, ProcessLauncher, ProcessSpec};

/// Transcoder endpoint and source settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderSettings {
    pub binary: String,
    pub sink_name: String,
    pub host: IpAddr,
    pub port: u16,
    pub stream_name: String,
}

/// Starts and stops the VLC transcoder
pub struct StreamTranscoder<L> {
    launcher: L,
    settings: TranscoderSettings,
}

impl<L: ProcessLauncher> StreamTranscoder<L> {
    pub fn new(launcher: L, settings: TranscoderSettings) -> Self {
        Self { launcher, settings }
    }

    /// URL the speaker is pointed at
    pub fn stream_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.settings.host, self.settings.port, self.settings.stream_name
        )
    }

    /// The VLC invocation, without a shell
    pub fn spec(&self) -> ProcessSpec {
        let s = &self.settings;
        ProcessSpec {
            name: "vlc".to_string(),
            program: s.binary.clone(),
            args: vec![
                format!("pulse://{}.monitor", s.sink_name),
                "--sout".to_string(),
                format!(
                    "#transcode{{vcodec=none,acodec=flac,ab=1441,channels=2,samplerate=44100,scodec=none}}\
                     :standard{{access=http,dst=/{}}}",
                    s.stream_name
                ),
                format!("--http-host={}", s.host),
                format!("--http-port={}", s.port),
            ],
            capture: OutputCapture::Merged,
        }
    }

    pub fn start(&self) -> Result<ProcessHandle> {
        let handle = self.launcher.launch(&self.spec())?;
        info!(url = %self.stream_url(), pid = ?handle.pid(), "Transcoder started");
        Ok(handle)
    }

    /// Request termination; failures are logged
    pub fn stop(&self, handle: &mut ProcessHandle) {
        info!("Stopping transcoder");
        if let Err(e) = handle.terminate() {
            warn!("{}", e);
        }
    }
}
