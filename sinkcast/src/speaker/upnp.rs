//! Sonos speakers over UPnP: SSDP discovery and SOAP control
//!
//! Every zone player answers SSDP, including subwoofers, surround satellites
//! and bridges that cannot play on their own. Those are marked `Invisible` in
//! the household's zone group topology and are left out of discovery.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use roxmltree::Document;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::{RemoteDevice, Speakers};

const SSDP_ADDR_V4: &str = "239.255.255.250:1900";
const ST_ZONE_PLAYER: &str = "urn:schemas-upnp-org:device:ZonePlayer:1";
const SERVICE_AV_TRANSPORT: &str = "urn:schemas-upnp-org:service:AVTransport:1";
const SERVICE_RENDERING_CONTROL: &str = "urn:schemas-upnp-org:service:RenderingControl:1";
const CONTROL_PORT: u16 = 1400;
const AV_TRANSPORT_PATH: &str = "/MediaRenderer/AVTransport/Control";
const RENDERING_CONTROL_PATH: &str = "/MediaRenderer/RenderingControl/Control";
const SERVICE_ZONE_GROUP_TOPOLOGY: &str = "urn:schemas-upnp-org:service:ZoneGroupTopology:1";
const ZONE_GROUP_TOPOLOGY_PATH: &str = "/ZoneGroupTopology/Control";

/// One SSDP search response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpResponse {
    pub usn: String,
    pub st: String,
    pub location: String,
}

pub struct UpnpSpeakers {
    client: reqwest::Client,
    discovery_timeout: Duration,
}

impl UpnpSpeakers {
    pub fn new(discovery_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            discovery_timeout,
        })
    }

    async fn search(&self) -> Result<Vec<SsdpResponse>> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        // Not settable on every platform
        let _ = socket.set_multicast_ttl_v4(2);

        let req = format!(
            "M-SEARCH * HTTP/1.1\r\n\
HOST: {SSDP_ADDR_V4}\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: 1\r\n\
ST: {ST_ZONE_PLAYER}\r\n\
\r\n"
        );
        socket.send_to(req.as_bytes(), SSDP_ADDR_V4).await?;

        let deadline = Instant::now() + self.discovery_timeout;
        let mut buf = [0u8; 8192];
        let mut responses = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    let Some(resp) = parse_ssdp_response(&buf[..len]) else {
                        continue;
                    };
                    if !resp.st.eq_ignore_ascii_case(ST_ZONE_PLAYER) {
                        continue;
                    }
                    if seen.insert(resp.usn.clone()) {
                        tracing::debug!(%from, usn = %resp.usn, location = %resp.location, "ssdp response");
                        responses.push(resp);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        Ok(responses)
    }

    /// Room name from the device description, if it can be fetched
    async fn room_name(&self, location: &str) -> Option<String> {
        let body = match self.client.get(location).send().await {
            Ok(resp) => resp.text().await.ok()?,
            Err(e) => {
                tracing::debug!(%location, "device description fetch failed: {e}");
                return None;
            }
        };
        parse_room_name(&body)
    }

    async fn soap(
        &self,
        device: &RemoteDevice,
        path: &str,
        service: &str,
        action: &str,
        inner_xml: &str,
    ) -> Result<String> {
        let url = format!("http://{}:{}{}", device.address, CONTROL_PORT, path);
        soap_call(&self.client, &url, service, action, inner_xml).await
    }

    /// Identities of invisible household members, from the first device
    /// that answers the topology query
    async fn invisible_members(&self, devices: &[RemoteDevice]) -> Option<HashSet<String>> {
        for device in devices {
            let body = match self
                .soap(
                    device,
                    ZONE_GROUP_TOPOLOGY_PATH,
                    SERVICE_ZONE_GROUP_TOPOLOGY,
                    "GetZoneGroupState",
                    "",
                )
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(address = %device.address, "zone group topology query failed: {e:#}");
                    continue;
                }
            };
            if let Some(invisible) = parse_invisible_members(&body) {
                return Some(invisible);
            }
        }
        None
    }
}

#[async_trait]
impl Speakers for UpnpSpeakers {
    async fn discover(&self) -> Result<Vec<RemoteDevice>> {
        let mut devices = Vec::new();
        for resp in self.search().await? {
            let Some(mut device) = device_from_response(&resp) else {
                tracing::debug!(usn = %resp.usn, "ignoring response without a usable location");
                continue;
            };
            if let Some(name) = self.room_name(&resp.location).await {
                device.name = name;
            }
            devices.push(device);
        }

        if devices.is_empty() {
            return Ok(devices);
        }
        match self.invisible_members(&devices).await {
            Some(invisible) => {
                let before = devices.len();
                devices.retain(|d| !invisible.contains(&d.identity));
                tracing::debug!(hidden = before - devices.len(), "filtered invisible zone members");
            }
            None => tracing::warn!("zone group topology unavailable, keeping every responding device"),
        }
        Ok(devices)
    }

    async fn clear_queue(&self, device: &RemoteDevice) -> Result<()> {
        self.soap(
            device,
            AV_TRANSPORT_PATH,
            SERVICE_AV_TRANSPORT,
            "RemoveAllTracksFromQueue",
            "<InstanceID>0</InstanceID>",
        )
        .await?;
        Ok(())
    }

    async fn enqueue_uri(&self, device: &RemoteDevice, uri: &str) -> Result<()> {
        let body = format!(
            "<InstanceID>0</InstanceID>\
<EnqueuedURI>{}</EnqueuedURI>\
<EnqueuedURIMetaData></EnqueuedURIMetaData>\
<DesiredFirstTrackNumberEnqueued>0</DesiredFirstTrackNumberEnqueued>\
<EnqueueAsNext>1</EnqueueAsNext>",
            escape_xml(uri)
        );
        self.soap(device, AV_TRANSPORT_PATH, SERVICE_AV_TRANSPORT, "AddURIToQueue", &body)
            .await?;
        Ok(())
    }

    async fn play_from_queue(&self, device: &RemoteDevice, index: u32) -> Result<()> {
        // Switch the transport to the device's own queue first
        let body = format!(
            "<InstanceID>0</InstanceID>\
<CurrentURI>x-rincon-queue:{}#0</CurrentURI>\
<CurrentURIMetaData></CurrentURIMetaData>",
            escape_xml(&device.identity)
        );
        self.soap(device, AV_TRANSPORT_PATH, SERVICE_AV_TRANSPORT, "SetAVTransportURI", &body)
            .await?;

        let body = format!(
            "<InstanceID>0</InstanceID><Unit>TRACK_NR</Unit><Target>{}</Target>",
            index + 1
        );
        self.soap(device, AV_TRANSPORT_PATH, SERVICE_AV_TRANSPORT, "Seek", &body)
            .await?;

        self.play(device).await
    }

    async fn set_volume(&self, device: &RemoteDevice, volume_percent: u8) -> Result<()> {
        let body = format!(
            "<InstanceID>0</InstanceID><Channel>Master</Channel><DesiredVolume>{}</DesiredVolume>",
            volume_percent.min(100)
        );
        self.soap(device, RENDERING_CONTROL_PATH, SERVICE_RENDERING_CONTROL, "SetVolume", &body)
            .await?;
        Ok(())
    }

    async fn play(&self, device: &RemoteDevice) -> Result<()> {
        self.soap(
            device,
            AV_TRANSPORT_PATH,
            SERVICE_AV_TRANSPORT,
            "Play",
            "<InstanceID>0</InstanceID><Speed>1</Speed>",
        )
        .await?;
        Ok(())
    }
}

/// Parse the headers of an SSDP search response
pub fn parse_ssdp_response(bytes: &[u8]) -> Option<SsdpResponse> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.split("\r\n");
    let status = lines.next()?.trim();
    if !status.starts_with("HTTP/1.1 200") {
        return None;
    }

    let mut usn: Option<String> = None;
    let mut st: Option<String> = None;
    let mut location: Option<String> = None;

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let Some((k, v)) = line.split_once(':') else {
            continue;
        };
        let value = v.trim().to_string();
        match k.trim().to_ascii_lowercase().as_str() {
            "usn" => usn = Some(value),
            "st" => st = Some(value),
            "location" => location = Some(value),
            _ => {}
        }
    }

    Some(SsdpResponse {
        usn: usn?,
        st: st?,
        location: location?,
    })
}

/// Build a device from a search response
///
/// The identity is the UUID part of the USN (`uuid:RINCON_xxx::urn:...`) and
/// the address is the host of the description URL.
pub fn device_from_response(resp: &SsdpResponse) -> Option<RemoteDevice> {
    let url = Url::parse(&resp.location).ok()?;
    let address = url.host_str()?.to_string();

    let identity = resp
        .usn
        .strip_prefix("uuid:")
        .unwrap_or(&resp.usn)
        .split("::")
        .next()
        .unwrap_or_default()
        .to_string();
    if identity.is_empty() {
        return None;
    }

    Some(RemoteDevice {
        identity,
        name: address.clone(),
        address,
    })
}

/// `roomName` (falling back to `friendlyName`) from a device description
pub fn parse_room_name(xml: &str) -> Option<String> {
    let doc = Document::parse(xml).ok()?;
    let find = |tag: &str| {
        doc.descendants()
            .find(|n| n.is_element() && n.tag_name().name() == tag)
            .and_then(|n| n.text())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    find("roomName").or_else(|| find("friendlyName"))
}

/// UUIDs of zone group members (and satellites) marked `Invisible="1"` in a
/// `GetZoneGroupState` response
///
/// The topology arrives as escaped XML inside the `ZoneGroupState` element.
pub fn parse_invisible_members(soap_body: &str) -> Option<HashSet<String>> {
    let outer = Document::parse(soap_body).ok()?;
    let state = outer
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "ZoneGroupState")?
        .text()?;
    let topology = Document::parse(state).ok()?;

    let invisible = topology
        .descendants()
        .filter(|n| {
            n.is_element()
                && matches!(n.tag_name().name(), "ZoneGroupMember" | "Satellite")
                && n.attribute("Invisible") == Some("1")
        })
        .filter_map(|n| n.attribute("UUID"))
        .map(str::to_string)
        .collect();
    Some(invisible)
}

async fn soap_call(
    client: &reqwest::Client,
    control_url: &str,
    service: &str,
    action: &str,
    inner_xml: &str,
) -> Result<String> {
    let envelope = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
<s:Body>\
<u:{action} xmlns:u=\"{service}\">{inner_xml}</u:{action}>\
</s:Body>\
</s:Envelope>"
    );

    let resp = client
        .post(control_url)
        .header("SOAPACTION", format!("\"{}#{}\"", service, action))
        .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
        .body(envelope)
        .send()
        .await
        .with_context(|| format!("soap {action} to {control_url}"))?;

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        bail!(
            "soap {}#{} failed status={} body={}",
            service,
            action,
            status,
            truncate(&text, 600)
        );
    }
    Ok(text)
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
