//! Admission gate: sampling and flow filtering
//!
//! Both decisions run before the aggregation engine and may skip the
//! packet. Skipping is not an error.

use crate::counters::{CounterKey, Counters};
use flow_common::{ipv4_mapped, Direction, FlowKey};
use std::{net::IpAddr, str::FromStr};
use thiserror::Error;

/// Admits one packet out of `rate` on average
#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    rate: u32,
}

impl Sampler {
    /// A rate of 0 or 1 admits every packet
    pub fn new(rate: u32) -> Self {
        Self { rate }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn admit(&self) -> bool {
        self.rate <= 1 || self.admit_with(rand::random::<u32>())
    }

    /// Decision for a given random draw
    pub fn admit_with(&self, draw: u32) -> bool {
        self.rate <= 1 || draw % self.rate == 0
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),
    #[error("invalid port or port range {0:?}")]
    InvalidPort(String),
    #[error("invalid IP address {0:?}")]
    InvalidIp(String),
    #[error("unknown filter action {0:?}, expected accept or reject")]
    InvalidAction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Accept,
    Reject,
}

impl FromStr for FilterAction {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" => Ok(FilterAction::Accept),
            "reject" => Ok(FilterAction::Reject),
            _ => Err(FilterError::InvalidAction(s.to_string())),
        }
    }
}

/// Address as stored in a [`FlowKey`] (IPv4 mapped into IPv6)
pub fn key_address(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => ipv4_mapped(v4.octets()),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Network prefix in key address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: [u8; 16],
    prefix_len: u8,
}

impl Cidr {
    pub fn contains(&self, addr: &[u8; 16]) -> bool {
        let full_bytes = usize::from(self.prefix_len / 8);
        if self.addr[..full_bytes] != addr[..full_bytes] {
            return false;
        }
        let rem = self.prefix_len % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        self.addr[full_bytes] & mask == addr[full_bytes] & mask
    }
}

impl FromStr for Cidr {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FilterError::InvalidCidr(s.to_string());
        let (addr, len) = s.split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let len: u8 = len.trim().parse().map_err(|_| invalid())?;

        let prefix_len = match addr {
            IpAddr::V4(_) if len <= 32 => len + 96,
            IpAddr::V6(_) if len <= 128 => len,
            _ => return Err(invalid()),
        };

        Ok(Cidr {
            addr: key_address(addr),
            prefix_len,
        })
    }
}

/// Which port of the flow a [`PortFilter`] looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortScope {
    Source,
    Destination,
    Either,
}

/// Single port or inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortFilter {
    pub scope: PortScope,
    pub low: u16,
    pub high: u16,
}

impl PortFilter {
    /// Parse `"80"` or `"8000-8080"`
    pub fn parse(scope: PortScope, spec: &str) -> Result<Self, FilterError> {
        let invalid = || FilterError::InvalidPort(spec.to_string());
        let (low, high) = match spec.split_once('-') {
            Some((low, high)) => (
                low.trim().parse().map_err(|_| invalid())?,
                high.trim().parse().map_err(|_| invalid())?,
            ),
            None => {
                let port = spec.trim().parse().map_err(|_| invalid())?;
                (port, port)
            }
        };
        if low > high {
            return Err(invalid());
        }
        Ok(Self { scope, low, high })
    }

    fn in_range(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }

    fn matches(&self, key: &FlowKey) -> bool {
        match self.scope {
            PortScope::Source => self.in_range(key.src_port),
            PortScope::Destination => self.in_range(key.dst_port),
            PortScope::Either => self.in_range(key.src_port) || self.in_range(key.dst_port),
        }
    }
}

/// One filtering rule; unset optional fields match anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub action: FilterAction,
    pub cidr: Cidr,
    pub direction: Option<Direction>,
    pub protocol: Option<u8>,
    pub port: Option<PortFilter>,
    pub peer_ip: Option<[u8; 16]>,
}

impl FilterRule {
    pub fn new(action: FilterAction, cidr: Cidr) -> Self {
        Self {
            action,
            cidr,
            direction: None,
            protocol: None,
            port: None,
            peer_ip: None,
        }
    }

    fn peer_matches(&self, peer: &[u8; 16]) -> bool {
        self.peer_ip.map_or(true, |ip| &ip == peer)
    }

    pub fn matches(&self, key: &FlowKey) -> bool {
        let by_address = (self.cidr.contains(&key.src_ip) && self.peer_matches(&key.dst_ip))
            || (self.cidr.contains(&key.dst_ip) && self.peer_matches(&key.src_ip));

        by_address
            && self.direction.map_or(true, |d| d.as_u8() == key.direction)
            && self.protocol.map_or(true, |p| p == key.transport_protocol)
            && self.port.map_or(true, |p| p.matches(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Accept,
    Reject,
    NoMatch,
}

/// Ordered rule list; the first matching rule decides
#[derive(Debug, Clone)]
pub struct FlowFilter {
    rules: Vec<FilterRule>,
    has_accept: bool,
}

impl FlowFilter {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        let has_accept = rules.iter().any(|r| r.action == FilterAction::Accept);
        Self { rules, has_accept }
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn evaluate(&self, key: &FlowKey) -> FilterVerdict {
        match self.rules.iter().find(|rule| rule.matches(key)) {
            Some(rule) if rule.action == FilterAction::Accept => FilterVerdict::Accept,
            Some(_) => FilterVerdict::Reject,
            None => FilterVerdict::NoMatch,
        }
    }

    /// Decide whether the packet must be skipped, counting the verdict
    ///
    /// Packets matching no rule are skipped when an accept rule exists:
    /// accept rules describe the only traffic that should be aggregated.
    pub fn should_skip(&self, key: &FlowKey, counters: &Counters) -> bool {
        match self.evaluate(key) {
            FilterVerdict::Accept => {
                counters.increment(CounterKey::FilterAccept);
                false
            }
            FilterVerdict::Reject => {
                counters.increment(CounterKey::FilterReject);
                true
            }
            FilterVerdict::NoMatch => {
                counters.increment(CounterKey::FilterNoMatch);
                self.has_accept
            }
        }
    }
}
