//! Serial endpoint discovery and ranking.
//!
//! The controller enumerates as a USB CDC device, so candidates are filtered
//! to paths matching the usual USB/ACM conventions (`ttyUSB`, `ttyACM`,
//! `COM<n>` on Windows, anything containing `USB`/`ACM` elsewhere). Ranking
//! puts an explicitly configured path first, then the common default paths,
//! then every remaining discovered candidate, deduplicated in first-seen
//! order.
//!
//! Do not run enumeration in a hot loop; it walks the platform device tree.
//! The link actor calls it once per connect attempt.

use tracing::{debug, warn};

/// Returns true if a path looks like a USB/ACM/COM serial endpoint.
pub fn is_usb_like(path: &str) -> bool {
    if path.contains("ACM") || path.contains("USB") {
        return true;
    }
    // Windows COM ports: "COM" followed by digits only
    if let Some(digits) = path
        .strip_prefix("COM")
        .or_else(|| path.strip_prefix("com"))
    {
        return !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());
    }
    false
}

/// Enumerate available serial endpoints, filtered to USB/ACM/COM devices.
pub fn list_candidates() -> Vec<String> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!(error = %e, "serial port enumeration failed");
            return Vec::new();
        }
    };

    let candidates: Vec<String> = ports
        .into_iter()
        .map(|p| p.port_name)
        .filter(|name| is_usb_like(name))
        .collect();

    debug!(count = candidates.len(), "discovered serial candidates");
    candidates
}

/// Build the ranked connect-attempt order from the discovered candidates.
///
/// Order: configured path (only if discovered), common default paths (only
/// if discovered), then all remaining candidates. Duplicates are dropped,
/// preserving first-seen order.
pub fn ranked_attempt_order(
    configured: Option<&str>,
    common: &[String],
    candidates: &[String],
) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();

    let mut push = |path: &str| {
        if candidates.iter().any(|c| c == path) && !order.iter().any(|p| p == path) {
            order.push(path.to_string());
        }
    };

    if let Some(path) = configured {
        push(path);
    }
    for path in common {
        push(path);
    }
    for path in candidates {
        push(path);
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn filters_usb_like_paths() {
        assert!(is_usb_like("/dev/ttyACM0"));
        assert!(is_usb_like("/dev/ttyUSB1"));
        assert!(is_usb_like("COM3"));
        assert!(is_usb_like("COM12"));
        assert!(!is_usb_like("COM"));
        assert!(!is_usb_like("COMx"));
        assert!(!is_usb_like("/dev/ttyS0"));
        assert!(!is_usb_like("/dev/pts/3"));
    }

    #[test]
    fn configured_path_ranks_first_when_discovered() {
        let candidates = v(&["/dev/ttyUSB0", "/dev/ttyACM0", "/dev/ttyACM3"]);
        let common = v(&["/dev/ttyACM0", "/dev/ttyUSB0"]);
        let order = ranked_attempt_order(Some("/dev/ttyACM3"), &common, &candidates);
        assert_eq!(
            order,
            v(&["/dev/ttyACM3", "/dev/ttyACM0", "/dev/ttyUSB0"])
        );
    }

    #[test]
    fn configured_path_skipped_when_absent() {
        let candidates = v(&["/dev/ttyACM0"]);
        let common = v(&["/dev/ttyACM0", "/dev/ttyACM1"]);
        let order = ranked_attempt_order(Some("/dev/ttyACM9"), &common, &candidates);
        assert_eq!(order, v(&["/dev/ttyACM0"]));
    }

    #[test]
    fn remaining_candidates_follow_common_paths() {
        let candidates = v(&["/dev/ttyACM5", "/dev/ttyUSB1", "/dev/ttyACM0"]);
        let common = v(&["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyUSB0", "/dev/ttyUSB1"]);
        let order = ranked_attempt_order(None, &common, &candidates);
        assert_eq!(
            order,
            v(&["/dev/ttyACM0", "/dev/ttyUSB1", "/dev/ttyACM5"])
        );
    }

    #[test]
    fn deduplicates_preserving_first_seen() {
        let candidates = v(&["/dev/ttyACM0", "/dev/ttyACM0"]);
        let common = v(&["/dev/ttyACM0"]);
        let order = ranked_attempt_order(Some("/dev/ttyACM0"), &common, &candidates);
        assert_eq!(order, v(&["/dev/ttyACM0"]));
    }

    #[test]
    fn empty_candidates_yield_empty_order() {
        let order = ranked_attempt_order(Some("/dev/ttyACM0"), &v(&["/dev/ttyACM0"]), &[]);
        assert!(order.is_empty());
    }
}
