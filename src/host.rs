//! Host observations: network link state and free memory.
use gasmeter_lib::traits::NetworkLink;
use std::fs;

const WIRELESS_STATS: &str = "/proc/net/wireless";
const MEMINFO: &str = "/proc/meminfo";

/// [`NetworkLink`] backed by sysfs/procfs, refreshed on request.
///
/// Without an interface the link is assumed to be up with unknown quality.
#[derive(Debug, Clone)]
pub struct HostLink {
    interface: Option<String>,
    ready: bool,
    quality: i32,
}

impl HostLink {
    pub fn new(interface: Option<String>) -> Self {
        let mut link = Self {
            interface,
            ready: true,
            quality: 0,
        };
        link.refresh();
        link
    }

    pub fn refresh(&mut self) {
        let Some(interface) = &self.interface else {
            return;
        };
        self.ready = fs::read_to_string(format!("/sys/class/net/{interface}/operstate"))
            .map(|state| state.trim() == "up")
            .unwrap_or(false);
        self.quality = fs::read_to_string(WIRELESS_STATS)
            .ok()
            .and_then(|stats| signal_level(&stats, interface))
            .unwrap_or(0);
    }
}

impl NetworkLink for HostLink {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn quality(&self) -> i32 {
        self.quality
    }
}

/// Extracts the signal level in dBm of `interface` from `/proc/net/wireless`.
fn signal_level(stats: &str, interface: &str) -> Option<i32> {
    stats.lines().skip(2).find_map(|line| {
        let (name, values) = line.split_once(':')?;
        if name.trim() != interface {
            return None;
        }
        let level = values.split_whitespace().nth(2)?;
        level.trim_end_matches('.').parse::<f64>().ok().map(|l| l as i32)
    })
}

/// Available memory in bytes, if the platform reports it.
pub fn available_memory() -> Option<usize> {
    fs::read_to_string(MEMINFO)
        .ok()
        .and_then(|meminfo| mem_available(&meminfo))
}

fn mem_available(meminfo: &str) -> Option<usize> {
    meminfo.lines().find_map(|line| {
        let kib = line.strip_prefix("MemAvailable:")?.trim().strip_suffix("kB")?;
        kib.trim().parse::<usize>().ok().map(|kib| kib * 1024)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIRELESS: &str = "\
Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
 face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
 wlan0: 0000   54.  -56.  -256        0      0      0      0     15        0
";

    #[test]
    fn parse_signal_level() {
        assert_eq!(signal_level(WIRELESS, "wlan0"), Some(-56));
        assert_eq!(signal_level(WIRELESS, "wlan1"), None);
        assert_eq!(signal_level("", "wlan0"), None);
    }

    #[test]
    fn parse_mem_available() {
        let meminfo = "MemTotal:        8049732 kB\nMemFree:          512000 kB\nMemAvailable:    2048 kB\n";
        assert_eq!(mem_available(meminfo), Some(2048 * 1024));
        assert_eq!(mem_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn link_without_interface() {
        let link = HostLink::new(None);
        assert!(link.is_ready());
        assert_eq!(link.quality(), 0);
    }
}
