// Flow descriptors delivered by the interception hook.
//
// A flow is read-only for the engine. The subject key is whatever stable
// identity the hook could derive for the originating process: a code-signing
// identifier when the binary is signed, otherwise its executable path.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Stable identity of the process that originated a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectKey(String);

impl SubjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        SubjectKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the key is an executable path rather than a signing identifier
    pub fn is_path(&self) -> bool {
        self.0.starts_with('/')
    }
}

impl From<&str> for SubjectKey {
    fn from(s: &str) -> Self {
        SubjectKey(s.to_string())
    }
}

impl From<String> for SubjectKey {
    fn from(s: String) -> Self {
        SubjectKey(s)
    }
}

impl std::fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Outbound,
    Inbound,
}

/// Remote side of a flow.
///
/// The hook may know the address, the hostname it was resolved from, or both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub address: Option<IpAddr>,
    #[serde(default)]
    pub hostname: Option<String>,
    pub port: u16,
}

impl Endpoint {
    pub fn from_ip(address: IpAddr, port: u16) -> Self {
        Self {
            address: Some(address),
            hostname: None,
            port,
        }
    }

    pub fn from_host(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            address: None,
            hostname: Some(hostname.into()),
            port,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Canonical textual form of the remote address used for fingerprints
    /// and literal matching: the IP when known, else the lowercased hostname.
    pub fn address_key(&self) -> Option<String> {
        match (&self.address, &self.hostname) {
            (Some(ip), _) => Some(ip.to_string()),
            (None, Some(host)) if !host.trim().is_empty() => Some(host.trim().to_lowercase()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.address, &self.hostname) {
            (Some(IpAddr::V6(ip)), _) => write!(f, "[{}]:{}", ip, self.port),
            (Some(ip), _) => write!(f, "{}:{}", ip, self.port),
            (None, Some(host)) => write!(f, "{}:{}", host, self.port),
            (None, None) => write!(f, "?:{}", self.port),
        }
    }
}

/// One observed connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub subject: SubjectKey,
    /// Executable path of the originating process, when the hook knows it
    #[serde(default)]
    pub process_path: Option<String>,
    pub remote: Endpoint,
    pub protocol: Protocol,
    #[serde(default)]
    pub direction: Direction,
    /// Process is signed by the platform vendor
    #[serde(default)]
    pub platform_binary: bool,
}

impl Flow {
    pub fn new(subject: impl Into<SubjectKey>, remote: Endpoint, protocol: Protocol) -> Self {
        Self {
            subject: subject.into(),
            process_path: None,
            remote,
            protocol,
            direction: Direction::Outbound,
            platform_binary: false,
        }
    }

    pub fn with_process_path(mut self, path: impl Into<String>) -> Self {
        self.process_path = Some(path.into());
        self
    }

    pub fn platform(mut self) -> Self {
        self.platform_binary = true;
        self
    }

    /// Deduplication key for pending connections.
    ///
    /// Returns `None` for a malformed flow with no usable remote address.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        let address = self.remote.address_key()?;
        if self.subject.as_str().is_empty() {
            return None;
        }
        Some(Fingerprint {
            subject: self.subject.clone(),
            address,
            port: self.remote.port,
            protocol: self.protocol,
        })
    }
}

/// (subject, remote address, remote port, protocol)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub subject: SubjectKey,
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_prefers_ip_over_hostname() {
        let remote = Endpoint::from_ip("93.184.216.34".parse().unwrap(), 443)
            .with_hostname("Example.com");
        let flow = Flow::new("com.example.app", remote, Protocol::Tcp);

        let fp = flow.fingerprint().unwrap();
        assert_eq!(fp.address, "93.184.216.34");
        assert_eq!(fp.port, 443);
    }

    #[test]
    fn hostname_only_flow_is_lowercased() {
        let flow = Flow::new(
            "com.example.app",
            Endpoint::from_host("API.Example.COM", 443),
            Protocol::Tcp,
        );
        assert_eq!(flow.fingerprint().unwrap().address, "api.example.com");
    }

    #[test]
    fn flow_without_remote_has_no_fingerprint() {
        let remote = Endpoint {
            address: None,
            hostname: None,
            port: 80,
        };
        let flow = Flow::new("com.example.app", remote, Protocol::Udp);
        assert!(flow.fingerprint().is_none());
    }

    #[test]
    fn flow_deserializes_with_defaults() {
        let flow: Flow = serde_json::from_value(serde_json::json!({
            "subject": "/usr/bin/curl",
            "remote": {"address": "10.0.0.1", "port": 8080},
            "protocol": "tcp"
        }))
        .unwrap();

        assert!(flow.subject.is_path());
        assert_eq!(flow.direction, Direction::Outbound);
        assert!(!flow.platform_binary);
    }
}
