//! Parent/child capture protocol.
//!
//! A capture child writes a two-byte status code to stdout. Only after
//! [`Handshake::AcquiredHandle`] does it follow up with one JSON object per
//! line, each carrying a raw captured frame.

use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::HandshakeError;
use crate::models::DecodedFrame;
use crate::parser;

/// Set to `"true"` in a child's environment to run only the capture role.
pub const TRACE_ENV: &str = "CONNMAP_TRACE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    AcquiredHandle,
    PermissionDenied,
    UnexpectedError,
}

impl Handshake {
    pub fn code(&self) -> &'static [u8; 2] {
        match self {
            Handshake::AcquiredHandle => b"AQ",
            Handshake::PermissionDenied => b"PD",
            Handshake::UnexpectedError => b"UE",
        }
    }

    pub fn parse(code: [u8; 2]) -> Option<Self> {
        match &code {
            b"AQ" => Some(Handshake::AcquiredHandle),
            b"PD" => Some(Handshake::PermissionDenied),
            b"UE" => Some(Handshake::UnexpectedError),
            _ => None,
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.code())?;
        out.flush()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeOptions {
    pub lazy: bool,
    pub no_copy: bool,
}

/// One captured frame as relayed from child to parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedFrame {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub length: u32,
    pub link_type: i32,
    #[serde(default)]
    pub decode_options: DecodeOptions,
}

impl RelayedFrame {
    pub fn decode(&self) -> Option<DecodedFrame> {
        parser::decode_frame(self.link_type, &self.data, self.length)
    }

    pub fn write_line<W: Write>(&self, out: &mut W) -> io::Result<()> {
        serde_json::to_writer(&mut *out, self)?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Outcome of reading a child's status code.
#[derive(Debug)]
pub enum Probe {
    Acquired,
    PermissionDenied,
}

/// Read exactly two bytes and interpret them. `UE` and unknown codes are
/// errors; only `AQ` and `PD` are outcomes the caller can act on.
pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Probe, HandshakeError> {
    let mut code = [0u8; 2];
    reader
        .read_exact(&mut code)
        .await
        .map_err(HandshakeError::Truncated)?;

    match Handshake::parse(code) {
        Some(Handshake::AcquiredHandle) => Ok(Probe::Acquired),
        Some(Handshake::PermissionDenied) => Ok(Probe::PermissionDenied),
        Some(Handshake::UnexpectedError) => Err(HandshakeError::UnexpectedError),
        None => Err(HandshakeError::Garbled(code)),
    }
}

/// Forward decoded frames from a relayed stream until it ends, a line cannot
/// be read, or the receiver goes away. Undecodable frames are skipped.
pub async fn relay_frames<R: AsyncBufRead + Unpin>(reader: R, frames: mpsc::Sender<DecodedFrame>) {
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = frames.closed() => {
                debug!("frame receiver dropped, ending relay");
                return;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("relay stream ended");
                return;
            }
            Err(e) => {
                warn!(error = %e, "relay stream read failed");
                return;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let frame = match serde_json::from_str::<RelayedFrame>(&line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "skipping malformed relayed frame");
                continue;
            }
        };

        if let Some(decoded) = frame.decode() {
            if frames.send(decoded).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{samples, LINKTYPE_ETHERNET};

    fn relayed(data: Vec<u8>, length: u32) -> RelayedFrame {
        RelayedFrame {
            data,
            length,
            link_type: LINKTYPE_ETHERNET,
            decode_options: DecodeOptions::default(),
        }
    }

    #[test]
    fn codes_are_two_bytes() {
        for handshake in [
            Handshake::AcquiredHandle,
            Handshake::PermissionDenied,
            Handshake::UnexpectedError,
        ] {
            assert_eq!(Handshake::parse(*handshake.code()), Some(handshake));
        }
        assert_eq!(Handshake::parse(*b"XX"), None);
    }

    #[test]
    fn frame_data_is_base64() {
        let frame = relayed(vec![0xde, 0xad, 0xbe, 0xef], 4);
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["data"], "3q2+7w==");
        assert_eq!(value["linkType"], 1);
        assert_eq!(value["decodeOptions"]["noCopy"], false);
    }

    #[tokio::test]
    async fn reads_acquired_then_frames() {
        let mut stream = Vec::new();
        Handshake::AcquiredHandle.write_to(&mut stream).unwrap();
        relayed(samples::ethernet_ipv4_tcp(), 120).write_line(&mut stream).unwrap();
        relayed(vec![0u8; 4], 4).write_line(&mut stream).unwrap();
        relayed(samples::ethernet_ipv4_tcp(), 60).write_line(&mut stream).unwrap();

        let mut reader = stream.as_slice();
        assert!(matches!(read_handshake(&mut reader).await, Ok(Probe::Acquired)));

        let (tx, mut rx) = mpsc::channel(8);
        relay_frames(reader, tx).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.length, 120);
        assert_eq!(first.dst_ip.to_string(), "8.8.8.8");
        assert_eq!(rx.recv().await.unwrap().length, 60);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn permission_denied_is_an_outcome() {
        let mut reader: &[u8] = b"PD";
        assert!(matches!(
            read_handshake(&mut reader).await,
            Ok(Probe::PermissionDenied)
        ));
    }

    #[tokio::test]
    async fn unexpected_and_garbled_codes_are_errors() {
        let mut reader: &[u8] = b"UE";
        assert!(matches!(
            read_handshake(&mut reader).await,
            Err(HandshakeError::UnexpectedError)
        ));

        let mut reader: &[u8] = b"{\"data\"";
        assert!(matches!(
            read_handshake(&mut reader).await,
            Err(HandshakeError::Garbled(code)) if &code == b"{\""
        ));

        let mut reader: &[u8] = b"A";
        assert!(matches!(
            read_handshake(&mut reader).await,
            Err(HandshakeError::Truncated(_))
        ));
    }

    #[tokio::test]
    async fn skips_malformed_lines() {
        let mut stream = b"not json\n\n".to_vec();
        relayed(samples::ethernet_ipv4_tcp(), 120).write_line(&mut stream).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        relay_frames(stream.as_slice(), tx).await;

        assert_eq!(rx.recv().await.unwrap().length, 120);
        assert!(rx.recv().await.is_none());
    }
}
