use pnet::datalink;
use tracing::debug;

use crate::error::CaptureError;
use crate::models::Device;

/// Used when the OS does not report an MTU for an interface.
pub const DEFAULT_MTU: u32 = 1500;

/// A device as the capture library sees it.
#[derive(Debug, Clone)]
pub struct CaptureDevice {
    pub name: String,
    pub addresses: Vec<String>,
}

/// A network interface as the OS sees it.
#[derive(Debug, Clone)]
pub struct OsInterface {
    pub name: String,
    pub addresses: Vec<String>,
    pub mtu: u32,
}

/// Enumerate capture devices that can be matched to an OS interface.
pub fn list_devices() -> Result<Vec<Device>, CaptureError> {
    let captures = pcap::Device::list()?
        .into_iter()
        .map(|device| CaptureDevice {
            addresses: device.addresses.iter().map(|a| a.addr.to_string()).collect(),
            name: device.name,
        })
        .collect();

    let interfaces = datalink::interfaces()
        .into_iter()
        .map(|iface| OsInterface {
            addresses: iface.ips.iter().map(|net| net.ip().to_string()).collect(),
            mtu: interface_mtu(&iface.name).unwrap_or(DEFAULT_MTU),
            name: iface.name,
        })
        .collect();

    Ok(pair_devices(captures, interfaces))
}

/// Pair each capture device with the first OS interface bound to exactly the
/// same address list. Devices without a match are dropped.
pub fn pair_devices(captures: Vec<CaptureDevice>, interfaces: Vec<OsInterface>) -> Vec<Device> {
    captures
        .into_iter()
        .filter_map(|capture| {
            let Some(iface) = interfaces.iter().find(|i| i.addresses == capture.addresses) else {
                debug!(device = %capture.name, "no OS interface matches capture device");
                return None;
            };

            Some(Device {
                capture_name: capture.name,
                os_name: iface.name.clone(),
                mtu: iface.mtu,
            })
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn interface_mtu(name: &str) -> Option<u32> {
    std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(not(target_os = "linux"))]
fn interface_mtu(_name: &str) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(name: &str, addresses: &[&str]) -> CaptureDevice {
        CaptureDevice {
            name: name.into(),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn interface(name: &str, addresses: &[&str], mtu: u32) -> OsInterface {
        OsInterface {
            name: name.into(),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            mtu,
        }
    }

    #[test]
    fn pairs_by_address() {
        let devices = pair_devices(
            vec![capture("eth0", &["10.0.0.5"])],
            vec![
                interface("lo", &["127.0.0.1"], 65536),
                interface("eth0", &["10.0.0.5"], 1500),
            ],
        );

        assert_eq!(
            devices,
            vec![Device {
                capture_name: "eth0".into(),
                os_name: "eth0".into(),
                mtu: 1500,
            }]
        );
    }

    #[test]
    fn capture_name_can_differ_from_os_name() {
        let devices = pair_devices(
            vec![capture(r"\Device\NPF_{1234}", &["192.168.1.20", "fe80::1"])],
            vec![interface("Ethernet", &["192.168.1.20", "fe80::1"], 1400)],
        );

        assert_eq!(devices[0].capture_name, r"\Device\NPF_{1234}");
        assert_eq!(devices[0].os_name, "Ethernet");
        assert_eq!(devices[0].mtu, 1400);
    }

    #[test]
    fn drops_unmatched_devices() {
        let devices = pair_devices(
            vec![capture("any", &[]), capture("wlan0", &["10.1.1.1"])],
            vec![interface("eth0", &["10.0.0.5"], 1500)],
        );

        assert!(devices.is_empty());
    }
}
