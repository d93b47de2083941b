// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! IP range parsing and expansion.
//!
//! Accepts CIDR (`10.0.0.0/24`), dashed ranges (`10.0.0.1-10.0.0.50`),
//! and single addresses. Expansion is bounded to 65 536 hosts.

use std::net::Ipv4Addr;

use super::ScanError;

/// Largest accepted expansion
pub const MAX_HOSTS: u64 = 65_536;

/// Expand an operator-supplied range string into concrete addresses.
///
/// CIDR expansion covers the whole block including network and broadcast
/// addresses; the sweep simply finds out who answers.
pub fn expand_range(input: &str) -> Result<Vec<Ipv4Addr>, ScanError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ScanError::InvalidRange("empty range".to_string()));
    }

    let (first, last) = if let Some((base, prefix)) = input.split_once('/') {
        let base: Ipv4Addr = base
            .trim()
            .parse()
            .map_err(|_| ScanError::InvalidRange(format!("bad address in {input:?}")))?;
        let prefix: u32 = prefix
            .trim()
            .parse()
            .map_err(|_| ScanError::InvalidRange(format!("bad prefix in {input:?}")))?;
        if prefix > 32 {
            return Err(ScanError::InvalidRange(format!(
                "prefix /{prefix} out of range"
            )));
        }
        let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let network = u32::from(base) & mask;
        (network, network | !mask)
    } else if let Some((start, end)) = input.split_once('-') {
        let start: Ipv4Addr = start
            .trim()
            .parse()
            .map_err(|_| ScanError::InvalidRange(format!("bad start address in {input:?}")))?;
        let end: Ipv4Addr = end
            .trim()
            .parse()
            .map_err(|_| ScanError::InvalidRange(format!("bad end address in {input:?}")))?;
        if u32::from(start) > u32::from(end) {
            return Err(ScanError::InvalidRange(
                "range start is after its end".to_string(),
            ));
        }
        (u32::from(start), u32::from(end))
    } else {
        let single: Ipv4Addr = input
            .parse()
            .map_err(|_| ScanError::InvalidRange(format!("bad address {input:?}")))?;
        (u32::from(single), u32::from(single))
    };

    let count = u64::from(last - first) + 1;
    if count > MAX_HOSTS {
        return Err(ScanError::TooLarge { hosts: count });
    }
    Ok((first..=last).map(Ipv4Addr::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_slash_30() {
        let ips = expand_range("10.0.0.0/30").unwrap();
        assert_eq!(ips.len(), 4);
        assert_eq!(ips[0], Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(ips[3], Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_cidr_normalises_host_bits() {
        let ips = expand_range("192.168.1.77/24").unwrap();
        assert_eq!(ips.len(), 256);
        assert_eq!(ips[0], Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(ips[255], Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_dashed_range() {
        let ips = expand_range("10.0.0.250 - 10.0.1.5").unwrap();
        assert_eq!(ips.len(), 12);
        assert_eq!(ips[0], Ipv4Addr::new(10, 0, 0, 250));
        assert_eq!(ips[11], Ipv4Addr::new(10, 0, 1, 5));
    }

    #[test]
    fn test_single_address() {
        let ips = expand_range("172.16.0.1").unwrap();
        assert_eq!(ips, vec![Ipv4Addr::new(172, 16, 0, 1)]);
    }

    #[test]
    fn test_slash_32() {
        let ips = expand_range("10.0.0.7/32").unwrap();
        assert_eq!(ips, vec![Ipv4Addr::new(10, 0, 0, 7)]);
    }

    #[test]
    fn test_oversized_ranges_rejected() {
        // /15 is 131072 hosts.
        assert!(matches!(
            expand_range("10.0.0.0/15"),
            Err(ScanError::TooLarge { .. })
        ));
        // /16 is exactly the limit.
        assert!(expand_range("10.0.0.0/16").is_ok());
    }

    #[test]
    fn test_invalid_inputs() {
        for bad in ["", "10.0.0", "10.0.0.0/33", "10.0.0.5-10.0.0.1", "garbage"] {
            assert!(
                matches!(expand_range(bad), Err(ScanError::InvalidRange(_)) | Err(ScanError::TooLarge { .. })),
                "{bad:?} should be rejected"
            );
        }
    }
}
