//! Live capture.
//!
//! Frames come either straight from an in-process pcap handle or from a
//! capture child (this same executable started with [`TRACE_ENV`] set) that
//! relays them over its stdout.

use std::io::{self, Write};
use std::path::Path;
use std::process::Stdio;
use std::thread;

use pcap::{Active, Capture};
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CaptureError, TraceError};
use crate::handshake::{self, DecodeOptions, Handshake, Probe, RelayedFrame, TRACE_ENV};
use crate::models::{DecodedFrame, Device};
use crate::parser;

/// Frames buffered between a capture source and its consumer.
const FRAME_BUFFER: usize = 4096;
/// Read timeout so capture loops notice a dropped consumer.
const READ_TIMEOUT_MS: i32 = 500;

pub type FrameStream = mpsc::Receiver<DecodedFrame>;

pub enum Opened {
    Capturing(FrameStream),
    PermissionDenied,
}

fn create_capture(device_name: &str, mtu: u32) -> Result<Capture<Active>, CaptureError> {
    let snaplen = i32::try_from(mtu).unwrap_or(i32::MAX);

    Capture::from_device(device_name)
        .and_then(|inactive| {
            inactive
                .promisc(true)
                .snaplen(snaplen)
                .timeout(READ_TIMEOUT_MS)
                .immediate_mode(true)
                .open()
        })
        .map_err(classify)
}

/// libpcap does not expose a dedicated permission error, so it is recognised
/// by message.
fn classify(err: pcap::Error) -> CaptureError {
    let message = err.to_string();
    let denied = message.ends_with("(socket: Operation not permitted)")
        || message.ends_with("root privileges may be required)")
        || message.contains("You don't have permission to capture")
        || message.contains("Permission denied");

    if denied {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::Pcap(err)
    }
}

/// Open `device` in this process. The capture loop runs on its own thread and
/// stops when the returned stream is dropped or the device goes away.
pub fn open_direct(device: &Device) -> Result<Opened, CaptureError> {
    let cap = match create_capture(&device.capture_name, device.mtu) {
        Ok(cap) => cap,
        Err(CaptureError::PermissionDenied(message)) => {
            debug!(device = %device.capture_name, %message, "direct capture denied");
            return Ok(Opened::PermissionDenied);
        }
        Err(e) => return Err(e),
    };

    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    let name = device.capture_name.clone();
    thread::Builder::new()
        .name(format!("capture-{name}"))
        .spawn(move || process_packets(cap, &name, tx))?;

    Ok(Opened::Capturing(rx))
}

fn process_packets(mut cap: Capture<Active>, device_name: &str, sender: mpsc::Sender<DecodedFrame>) {
    let link_type = cap.get_datalink().0;
    info!(device = device_name, link_type, "capture loop started");

    while !sender.is_closed() {
        match cap.next_packet() {
            Ok(packet) => {
                let Some(frame) = parser::decode_frame(link_type, packet.data, packet.header.len) else {
                    continue;
                };
                if sender.blocking_send(frame).is_err() {
                    break;
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                warn!(device = device_name, error = %e, "capture ended");
                break;
            }
        }
    }

    info!(device = device_name, "capture loop stopped");
}

/// Start a capture child for `device` and wait for its handshake.
pub async fn open_relay(executable: &Path, device: &Device) -> Result<Opened, TraceError> {
    let mut child = Command::new(executable)
        .env(TRACE_ENV, "true")
        .arg(&device.capture_name)
        .arg(device.mtu.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "capture child stdout not piped"))?;

    match handshake::read_handshake(&mut stdout).await {
        Ok(Probe::Acquired) => {
            debug!(device = %device.capture_name, pid = ?child.id(), "capture child acquired handle");
            let (tx, rx) = mpsc::channel(FRAME_BUFFER);
            tokio::spawn(async move {
                handshake::relay_frames(BufReader::new(stdout), tx).await;
                let _ = child.kill().await;
            });
            Ok(Opened::Capturing(rx))
        }
        Ok(Probe::PermissionDenied) => {
            debug!(device = %device.capture_name, "capture child reported permission denied");
            let _ = child.kill().await;
            Ok(Opened::PermissionDenied)
        }
        Err(e) => {
            let _ = child.kill().await;
            Err(e.into())
        }
    }
}

/// Body of a capture child: handshake on stdout, then one relayed frame per
/// line until the device or the parent goes away.
pub fn serve_capture_child(device_name: &str, mtu: u32) -> Result<(), CaptureError> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut cap = match create_capture(device_name, mtu) {
        Ok(cap) => cap,
        Err(e) => {
            let code = match e {
                CaptureError::PermissionDenied(_) => Handshake::PermissionDenied,
                _ => Handshake::UnexpectedError,
            };
            code.write_to(&mut out)?;
            return Err(e);
        }
    };

    Handshake::AcquiredHandle.write_to(&mut out)?;
    let link_type = cap.get_datalink().0;

    loop {
        match cap.next_packet() {
            Ok(packet) => {
                let frame = RelayedFrame {
                    data: packet.data.to_vec(),
                    length: packet.header.len,
                    link_type,
                    decode_options: DecodeOptions::default(),
                };
                if let Err(e) = frame.write_line(&mut out) {
                    // The parent stopped reading.
                    debug!(error = %e, "relay output closed");
                    return Ok(());
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => {
                warn!(device = device_name, error = %e, "capture ended");
                break;
            }
        }
    }

    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_permission_messages() {
        let linux = pcap::Error::PcapError("eth0: You don't have permission to capture on that device (socket: Operation not permitted)".into());
        let macos = pcap::Error::PcapError("(cannot open BPF device) /dev/bpf0: Permission denied".into());
        let other = pcap::Error::PcapError("eth9: No such device exists".into());

        assert!(matches!(classify(linux), CaptureError::PermissionDenied(_)));
        assert!(matches!(classify(macos), CaptureError::PermissionDenied(_)));
        assert!(matches!(classify(other), CaptureError::Pcap(_)));
    }

    #[tokio::test]
    async fn relay_reports_spawn_failure() {
        let device = Device {
            capture_name: "eth0".into(),
            os_name: "eth0".into(),
            mtu: 1500,
        };

        let result = open_relay(Path::new("/nonexistent/connmap"), &device).await;
        assert!(matches!(result, Err(TraceError::Io(_))));
    }
}
