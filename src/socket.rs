//! Socket addressing and the transport-opening façade.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::errno::{Errno, Result};
use crate::net::{tcp, udp};
use crate::runtime::Runtime;
use crate::xfer::IntfId;

/// A TCP/IP socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockAddr {
	V4 {
		addr: Ipv4Addr,
		port: u16,
	},
	V6 {
		addr: Ipv6Addr,
		port: u16,
		/// Network-device scope for link-local addresses (0 = any).
		scope: u32,
	},
}

impl SockAddr {
	pub fn v4(addr: Ipv4Addr, port: u16) -> Self {
		SockAddr::V4 { addr, port }
	}

	pub fn port(&self) -> u16 {
		match self {
			SockAddr::V4 { port, .. } | SockAddr::V6 { port, .. } => *port,
		}
	}

	pub fn ip(&self) -> IpAddr {
		match self {
			SockAddr::V4 { addr, .. } => IpAddr::V4(*addr),
			SockAddr::V6 { addr, .. } => IpAddr::V6(*addr),
		}
	}

	pub fn with_port(mut self, new_port: u16) -> Self {
		match &mut self {
			SockAddr::V4 { port, .. } | SockAddr::V6 { port, .. } => *port = new_port,
		}
		self
	}

	pub fn is_multicast(&self) -> bool {
		match self {
			SockAddr::V4 { addr, .. } => addr.is_multicast(),
			SockAddr::V6 { addr, .. } => addr.is_multicast(),
		}
	}
}

impl fmt::Display for SockAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SockAddr::V4 { addr, port } => write!(f, "{addr}:{port}"),
			SockAddr::V6 { addr, port, .. } => write!(f, "[{addr}]:{port}"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
	Stream,
	Dgram,
}

/// Resolve a host name (or literal) to a socket address.
///
/// IPv6 literals may be bracketed and may carry a `%zone` suffix naming
/// the network device to use; without a zone the routing decision is
/// left to the backend (scope 0).
pub fn resolve(rt: &Runtime, host: &str, port: u16) -> Result<SockAddr> {
	let bare = host
		.strip_prefix('[')
		.and_then(|host| host.strip_suffix(']'))
		.unwrap_or(host);

	let (addr_part, zone) = match bare.find('%') {
		Some(pos) => (&bare[..pos], Some(&bare[pos + 1..])),
		None => (bare, None),
	};

	if let Ok(addr) = addr_part.parse::<Ipv4Addr>() {
		return Ok(SockAddr::V4 { addr, port });
	}
	if let Ok(addr) = addr_part.parse::<Ipv6Addr>() {
		let scope = match zone {
			Some(zone) => zone
				.parse()
				.ok()
				.or_else(|| rt.netdev_scope(zone))
				.ok_or(Errno::ENODEV)?,
			None => 0,
		};
		return Ok(SockAddr::V6 { addr, port, scope });
	}

	match rt.lookup_host(bare) {
		Some(IpAddr::V4(addr)) => Ok(SockAddr::V4 { addr, port }),
		Some(IpAddr::V6(addr)) => Ok(SockAddr::V6 { addr, port, scope: 0 }),
		None => {
			warn!("could not resolve \"{host}\"");
			Err(Errno::ENOENT)
		}
	}
}

/// Resolve `host` and plug a transport socket onto `intf`.
pub fn open_named_socket(
	rt: &mut Runtime,
	intf: IntfId,
	kind: SocketKind,
	host: &str,
	port: u16,
) -> Result<()> {
	let peer = resolve(rt, host, port)?;
	open_socket(rt, intf, kind, peer, None)
}

/// Plug a transport socket for an already-resolved peer onto `intf`.
pub fn open_socket(
	rt: &mut Runtime,
	intf: IntfId,
	kind: SocketKind,
	peer: SockAddr,
	local: Option<SockAddr>,
) -> Result<()> {
	match kind {
		SocketKind::Stream => tcp::open(rt, intf, peer),
		SocketKind::Dgram => udp::open(rt, intf, peer, local),
	}
}
