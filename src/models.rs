use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// A capture device paired with the OS interface it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub capture_name: String,
    pub os_name: String,
    pub mtu: u32,
}

/// Network-layer envelope of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    #[serde(rename = "IPv4")]
    Ipv4,
    #[serde(rename = "IPv6")]
    Ipv6,
}

impl LayerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerType::Ipv4 => "IPv4",
            LayerType::Ipv6 => "IPv6",
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub layer_type: LayerType,
    pub next_layer_type: String,
    /// Wire length of the frame, not the captured length.
    pub length: u32,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
}

/// Location of an address. Every field is its zero value when unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub country_name: String,
    pub city_name: String,
    pub longitude: f64,
    pub latitude: f64,
}

/// One observed flow, enriched with the location of both endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracedConnection {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub length: u64,
    pub layer_type: LayerType,
    pub next_layer_type: String,
    #[serde(rename = "srcIP")]
    pub src_ip: String,
    pub src_geo: GeoLocation,
    #[serde(rename = "dstIP")]
    pub dst_ip: String,
    pub dst_geo: GeoLocation,
}

impl TracedConnection {
    pub fn new(
        frame: DecodedFrame,
        timestamp: i64,
        src_geo: GeoLocation,
        dst_geo: GeoLocation,
    ) -> Self {
        TracedConnection {
            timestamp,
            length: u64::from(frame.length),
            layer_type: frame.layer_type,
            next_layer_type: frame.next_layer_type,
            src_ip: frame.src_ip.to_string(),
            src_geo,
            dst_ip: frame.dst_ip.to_string(),
            dst_geo,
        }
    }

    /// Directional flow identity: the same pair of hosts talking in the other
    /// direction is a different flow.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.layer_type, self.next_layer_type, self.src_ip, self.dst_ip
        )
    }
}
