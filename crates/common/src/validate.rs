//! Explicit validation functions for Wiregate requests.
//!
//! Each check returns field-level errors that callers compose into a
//! single `Error::Validation`; uniqueness checks that need registry
//! state live with the registries themselves.

use crate::error::FieldError;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Hosts a published service may never point back at: proxying to the
/// controller itself would loop traffic through the proxy.
const SELF_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "0.0.0.0"];

/// Validate a CIDR subnet string such as `192.168.1.0/24`.
pub fn check_subnet(field: &str, subnet: &str) -> Option<FieldError> {
    match subnet.parse::<IpNetwork>() {
        Ok(_) => None,
        Err(_) => Some(FieldError::new(
            field,
            format!("invalid CIDR subnet: {}", subnet),
        )),
    }
}

/// Validate a list of IPs or CIDR ranges (allow/deny lists accept both).
pub fn check_ip_list(field: &str, ips: &[String]) -> Option<FieldError> {
    for entry in ips {
        let ok = entry.parse::<IpNetwork>().is_ok() || entry.parse::<IpAddr>().is_ok();
        if !ok {
            return Some(FieldError::new(
                field,
                format!("invalid IP or CIDR: {}", entry),
            ));
        }
    }
    None
}

/// Reject backend hosts that resolve to the controller itself.
pub fn check_backend_host(host: Option<&str>) -> Option<FieldError> {
    match host {
        Some(h) if SELF_HOSTS.contains(&h) => Some(FieldError::new(
            "backend_host",
            format!("backend host may not target the controller itself: {}", h),
        )),
        _ => None,
    }
}

/// Validate a domain name: dotted labels of alphanumerics and hyphens.
pub fn check_domain(domain: &str) -> Option<FieldError> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain.contains('.')
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if valid {
        None
    } else {
        Some(FieldError::new(
            "domain",
            format!("invalid domain name: {}", domain),
        ))
    }
}

/// Validate a public listener port against the configured exposable range.
pub fn check_port_range(port: u16, range: Option<(u16, u16)>) -> Option<FieldError> {
    match range {
        Some((lo, hi)) if port < lo || port > hi => Some(FieldError::new(
            "port",
            format!("port {} outside exposable range {}-{}", port, lo, hi),
        )),
        _ => None,
    }
}

/// Parse a ttl string such as `45s`, `30m`, `12h` or `7d` into seconds.
pub fn parse_ttl(ttl: &str) -> Result<i64, FieldError> {
    let err = || FieldError::new("ttl", format!("invalid ttl: {}", ttl));
    if ttl.len() < 2 {
        return Err(err());
    }
    let (num, unit) = ttl.split_at(ttl.len() - 1);
    let value: i64 = num.parse().map_err(|_| err())?;
    if value <= 0 {
        return Err(err());
    }
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => return Err(err()),
    };
    Ok(secs)
}
