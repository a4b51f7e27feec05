//! Remote speaker discovery and playback control
//!
//! [`Speakers`] is the boundary to the network protocol; [`SpeakerController`]
//! holds the selection rule and the order of the playback calls.

pub mod upnp;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

pub use upnp::UpnpSpeakers;

/// A discovered speaker. Not owned by the session: nothing to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    /// Stable device identity (e.g. `RINCON_000E58...`)
    pub identity: String,
    /// IP address the device answered from
    pub address: String,
    /// Room or friendly name, for logs
    pub name: String,
}

/// Discovery and control operations of the speaker protocol
#[async_trait]
pub trait Speakers: Send + Sync {
    /// All devices that answered, in the order they answered
    async fn discover(&self) -> Result<Vec<RemoteDevice>>;

    async fn clear_queue(&self, device: &RemoteDevice) -> Result<()>;

    async fn enqueue_uri(&self, device: &RemoteDevice, uri: &str) -> Result<()>;

    /// Start playing the queue from a zero-based position
    async fn play_from_queue(&self, device: &RemoteDevice, index: u32) -> Result<()>;

    async fn set_volume(&self, device: &RemoteDevice, volume_percent: u8) -> Result<()>;

    async fn play(&self, device: &RemoteDevice) -> Result<()>;
}

/// Pick a device: the first one if `preferred` is empty, otherwise the first
/// whose address equals `preferred`
pub fn select_device(devices: Vec<RemoteDevice>, preferred: &str) -> Option<RemoteDevice> {
    if preferred.is_empty() {
        return devices.into_iter().next();
    }
    devices.into_iter().find(|d| d.address == preferred)
}

pub struct SpeakerController<S> {
    speakers: S,
}

impl<S: Speakers> SpeakerController<S> {
    pub fn new(speakers: S) -> Self {
        Self { speakers }
    }

    /// Find the device to play on; discovery errors count as "no devices"
    pub async fn discover(&self, preferred_address: &str) -> Option<RemoteDevice> {
        let devices = match self.speakers.discover().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Speaker discovery failed: {:#}", e);
                Vec::new()
            }
        };

        let found = devices.len();
        let device = select_device(devices, preferred_address);
        match &device {
            Some(d) if preferred_address.is_empty() => {
                info!(name = %d.name, address = %d.address, "No preferred speaker, using the first one found");
            }
            Some(d) => {
                info!(name = %d.name, address = %d.address, "Preferred speaker found");
            }
            None => {
                info!(found, preferred = %preferred_address, "No matching speaker");
            }
        }
        device
    }

    /// Point the device at the stream and start it
    ///
    /// Volume is set after playback starts, never before.
    pub async fn play(&self, device: &RemoteDevice, stream_url: &str, volume_percent: u8) -> Result<()> {
        self.speakers.clear_queue(device).await?;
        self.speakers.enqueue_uri(device, stream_url).await?;
        self.speakers.play_from_queue(device, 0).await?;
        self.speakers.set_volume(device, volume_percent).await?;
        self.speakers.play(device).await?;
        info!(name = %device.name, url = %stream_url, volume = volume_percent, "Speaker playing stream");
        Ok(())
    }
}
