use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Address family of a candidate address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{value} is not a valid {family}")]
    InvalidAddress { family: Family, value: String },
}

/// Trims `raw` and parses it as an IPv4 address.
///
/// Returns `Ok(None)` when the value is absent or blank.
pub fn parse_ipv4(raw: Option<&str>) -> Result<Option<Ipv4Addr>, ValidationError> {
    parse(raw, Family::V4)
}

/// Trims `raw` and parses it as an IPv6 address.
///
/// Returns `Ok(None)` when the value is absent or blank.
pub fn parse_ipv6(raw: Option<&str>) -> Result<Option<Ipv6Addr>, ValidationError> {
    parse(raw, Family::V6)
}

fn parse<T: std::str::FromStr>(
    raw: Option<&str>,
    family: Family,
) -> Result<Option<T>, ValidationError> {
    let value = match raw.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };

    value
        .parse::<T>()
        .map(Some)
        .map_err(|_| ValidationError::InvalidAddress {
            family,
            value: value.to_string(),
        })
}
