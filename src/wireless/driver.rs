//! Radio driver boundary
//!
//! [`RadioDriver`] is the thin, non-blocking interface to the wireless
//! hardware: start association, report status, drop the link, read the signal
//! level. All waiting and retry policy lives in the manager.

use std::fs;
use std::path::PathBuf;

/// Association status reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Radio idle, no association requested
    Idle,
    /// Association in progress
    Associating,
    /// Associated and holding an address
    Associated,
    /// The requested network was not seen in the scan
    NetworkNotFound,
    /// The access point rejected the credentials
    AuthRejected,
    /// Association failed for an unspecified reason
    ConnectFailed,
    /// An established association was lost
    ConnectionLost,
    /// Disassociated on request
    Disconnected,
}

/// Non-blocking wireless hardware interface
pub trait RadioDriver: Send {
    /// Start associating with `ssid`; returns immediately
    fn begin(&mut self, ssid: &str, passphrase: &str);

    /// Current association status
    fn status(&self) -> LinkStatus;

    /// Drop the association
    fn disconnect(&mut self);

    /// Received signal strength in dBm, when known
    fn rssi(&self) -> Option<i32>;
}

/// [`RadioDriver`] for nodes running on a host OS
///
/// The operating system owns the interface, so association is assumed once
/// requested. The signal level is read from `/proc/net/wireless` when the
/// interface is wireless.
#[derive(Debug, Clone)]
pub struct HostNetworkLink {
    interface: Option<String>,
    proc_path: PathBuf,
    status: LinkStatus,
}

impl HostNetworkLink {
    pub fn new() -> Self {
        Self {
            interface: None,
            proc_path: PathBuf::from("/proc/net/wireless"),
            status: LinkStatus::Idle,
        }
    }

    /// Restrict signal readings to one interface (e.g. `wlan0`)
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_proc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_path = path.into();
        self
    }
}

impl Default for HostNetworkLink {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioDriver for HostNetworkLink {
    fn begin(&mut self, _ssid: &str, _passphrase: &str) {
        self.status = LinkStatus::Associated;
    }

    fn status(&self) -> LinkStatus {
        self.status
    }

    fn disconnect(&mut self) {
        self.status = LinkStatus::Disconnected;
    }

    fn rssi(&self) -> Option<i32> {
        let content = fs::read_to_string(&self.proc_path).ok()?;
        parse_proc_wireless(&content, self.interface.as_deref())
    }
}

/// Extract the signal level (dBm) from `/proc/net/wireless` content
///
/// ```text
/// Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
///  face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
///  wlan0: 0000   54.  -56.  -256        0      0      0      0     12        0
/// ```
pub fn parse_proc_wireless(content: &str, interface: Option<&str>) -> Option<i32> {
    content.lines().skip(2).find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if let Some(wanted) = interface {
            if name.trim() != wanted {
                return None;
            }
        }
        let level = rest.split_whitespace().nth(2)?;
        level.trim_end_matches('.').parse::<f32>().ok().map(|v| v as i32)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_WIRELESS: &str = "Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
 face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
 wlan0: 0000   54.  -56.  -256        0      0      0      0     12        0
 wlan1: 0000   30.  -71.  -256        0      0      0      0      0        0
";

    #[test]
    fn test_parse_proc_wireless_first_interface() {
        assert_eq!(parse_proc_wireless(PROC_WIRELESS, None), Some(-56));
    }

    #[test]
    fn test_parse_proc_wireless_named_interface() {
        assert_eq!(parse_proc_wireless(PROC_WIRELESS, Some("wlan1")), Some(-71));
        assert_eq!(parse_proc_wireless(PROC_WIRELESS, Some("eth0")), None);
    }

    #[test]
    fn test_parse_proc_wireless_no_interfaces() {
        let header_only = PROC_WIRELESS.lines().take(2).collect::<Vec<_>>().join("\n");
        assert_eq!(parse_proc_wireless(&header_only, None), None);
    }

    #[test]
    fn test_host_link_lifecycle() {
        let mut link = HostNetworkLink::new().with_proc_path("/nonexistent/proc/net/wireless");
        assert_eq!(link.status(), LinkStatus::Idle);

        link.begin("any", "secret");
        assert_eq!(link.status(), LinkStatus::Associated);
        assert_eq!(link.rssi(), None);

        link.disconnect();
        assert_eq!(link.status(), LinkStatus::Disconnected);
    }
}
