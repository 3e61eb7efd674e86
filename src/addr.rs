//! Multi-component locators and peer identity.
//!
//! An [`Addr`] names an HTTP-reachable endpoint of the direct transport
//! family, written in slash-separated components:
//!
//! ```text
//! /ip4/127.0.0.1/tcp/12345/http/p2p-webrtc-direct
//! /ip4/127.0.0.1/tcp/12345/http/p2p-webrtc-direct/p2p/<owner>
//! /ip4/127.0.0.1/tcp/12345/http/p2p-webrtc-direct/p2p/<owner>/p2p-webrtc-star
//! /ip4/127.0.0.1/tcp/12345/http/p2p-webrtc-direct/p2p/<owner>/p2p-webrtc-star/p2p/<destination>
//! ```
//!
//! The `p2p-webrtc-direct` component is the direct marker; `p2p-webrtc-star`
//! is the star marker indicating signalling-overlay use. Up to two peer ids
//! may be embedded: the owner of the listener, and (after the star marker)
//! the destination peer reached through the overlay.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Opaque peer identity. Compared by bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Host component of an [`Addr`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostProto {
    Ip4,
    Ip6,
    Dns4,
}

impl HostProto {
    fn component(self) -> &'static str {
        match self {
            HostProto::Ip4 => "ip4",
            HostProto::Ip6 => "ip6",
            HostProto::Dns4 => "dns4",
        }
    }
}

/// A parsed locator of the direct transport family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Addr {
    pub proto: HostProto,
    pub host: String,
    pub port: u16,
    /// Peer id of the listener owner, when embedded.
    pub owner: Option<PeerId>,
    /// Star marker: the address refers to the signalling overlay.
    pub star: bool,
    /// Destination peer behind the overlay (only meaningful with `star`).
    pub destination: Option<PeerId>,
}

impl Addr {
    /// Direct address with no embedded peer ids, as produced for inbound
    /// HTTP connections (`remoteAddress:remotePort`).
    pub fn direct(proto: HostProto, host: impl Into<String>, port: u16) -> Self {
        Self {
            proto,
            host: host.into(),
            port,
            owner: None,
            star: false,
            destination: None,
        }
    }

    /// Direct address for an observed remote socket.
    pub fn from_socket(remote: std::net::SocketAddr) -> Self {
        let proto = if remote.is_ipv4() {
            HostProto::Ip4
        } else {
            HostProto::Ip6
        };
        Self::direct(proto, remote.ip().to_string(), remote.port())
    }

    /// Base URL of the listener's HTTP endpoint.
    pub fn http_url(&self) -> String {
        match self.proto {
            HostProto::Ip6 => format!("http://[{}]:{}/", self.host, self.port),
            _ => format!("http://{}:{}/", self.host, self.port),
        }
    }

    /// `host:port` pair for socket binding.
    pub fn socket_addr(&self) -> String {
        match self.proto {
            HostProto::Ip6 => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// The same locator with the destination peer replaced.
    pub fn with_destination(&self, dst: PeerId) -> Self {
        let mut addr = self.clone();
        addr.star = true;
        addr.destination = Some(dst);
        addr
    }
}

impl FromStr for Addr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match parts.next() {
            Some("") => {}
            _ => bail!("address must start with '/'"),
        }

        let proto = match parts.next() {
            Some("ip4") => HostProto::Ip4,
            Some("ip6") => HostProto::Ip6,
            Some("dns4") => HostProto::Dns4,
            other => bail!("unsupported host component {:?}", other),
        };
        let host = parts.next().context("missing host")?.to_string();
        if host.is_empty() {
            bail!("empty host");
        }

        match parts.next() {
            Some("tcp") => {}
            other => bail!("expected tcp component, found {:?}", other),
        }
        let port: u16 = parts
            .next()
            .context("missing port")?
            .parse()
            .context("invalid port")?;

        match parts.next() {
            Some("http") => {}
            other => bail!("expected http component, found {:?}", other),
        }
        match parts.next() {
            Some("p2p-webrtc-direct") => {}
            other => bail!("expected p2p-webrtc-direct component, found {:?}", other),
        }

        let mut addr = Addr {
            proto,
            host,
            port,
            owner: None,
            star: false,
            destination: None,
        };

        // Optional trailing components: /p2p/<owner>, /p2p-webrtc-star, /p2p/<dst>.
        while let Some(component) = parts.next() {
            match component {
                "" => continue,
                "p2p" => {
                    let pid = parts.next().context("p2p component without peer id")?;
                    if pid.is_empty() {
                        bail!("empty peer id");
                    }
                    let slot = if addr.star {
                        &mut addr.destination
                    } else {
                        &mut addr.owner
                    };
                    if slot.is_some() {
                        bail!("duplicate peer id component");
                    }
                    *slot = Some(PeerId::new(pid));
                }
                "p2p-webrtc-star" => {
                    if addr.star {
                        bail!("duplicate star marker");
                    }
                    addr.star = true;
                }
                other => bail!("unexpected component {:?}", other),
            }
        }

        Ok(addr)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/tcp/{}/http/p2p-webrtc-direct",
            self.proto.component(),
            self.host,
            self.port
        )?;
        if let Some(owner) = &self.owner {
            write!(f, "/p2p/{owner}")?;
        }
        if self.star {
            write!(f, "/p2p-webrtc-star")?;
        }
        if let Some(dst) = &self.destination {
            write!(f, "/p2p/{dst}")?;
        }
        Ok(())
    }
}
