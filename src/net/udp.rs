//! Datagram sockets.
//!
//! A UDP socket is a thin bridge between the transfer interface and the
//! link-layer backend: deliveries from the application go out as single
//! datagrams, received datagrams are handed upstream with the source
//! address in the metadata. Port assembly and checksums for the 8-byte
//! UDP header itself belong to the IP layer behind [`NetBackend`].
//!
//! [`NetBackend`]: crate::net::NetBackend

use std::cell::RefCell;
use std::rc::Rc;

use crate::errno::Result;
use crate::iobuf::IoBuffer;
use crate::net::{self, IpProto};
use crate::runtime::Runtime;
use crate::socket::SockAddr;
use crate::xfer::{self, IntfId, Metadata, Object, Port};

const UDP_MIN_AUTO_PORT: u16 = 1024;

const XFER: Port = 0;

pub(crate) struct UdpSocket {
	xfer: IntfId,
	local: SockAddr,
	peer: SockAddr,
}

pub(crate) struct UdpTable {
	socks: Vec<Rc<RefCell<UdpSocket>>>,
	cursor: u16,
}

impl UdpTable {
	pub fn new() -> Self {
		UdpTable {
			socks: Vec::new(),
			cursor: UDP_MIN_AUTO_PORT,
		}
	}
}

fn auto_port(rt: &mut Runtime) -> u16 {
	let port = rt.udp.cursor;
	rt.udp.cursor = rt.udp.cursor.checked_add(1).unwrap_or(UDP_MIN_AUTO_PORT);
	port
}

fn unspecified_local(peer: &SockAddr, port: u16) -> SockAddr {
	match peer {
		SockAddr::V4 { .. } => SockAddr::V4 {
			addr: std::net::Ipv4Addr::UNSPECIFIED,
			port,
		},
		SockAddr::V6 { scope, .. } => SockAddr::V6 {
			addr: std::net::Ipv6Addr::UNSPECIFIED,
			port,
			scope: *scope,
		},
	}
}

/// Open a datagram socket towards `peer` and plug it onto `parent`.
///
/// A multicast receiver passes the group address as `local`, which both
/// binds the group port and subscribes the socket to datagrams sent to
/// the group.
pub fn open(rt: &mut Runtime, parent: IntfId, peer: SockAddr, local: Option<SockAddr>) -> Result<()> {
	let local = match local {
		Some(local) => local,
		None => {
			let port = auto_port(rt);
			unspecified_local(&peer, port)
		}
	};
	let sock = Rc::new(RefCell::new(UdpSocket {
		xfer: IntfId::NULL,
		local,
		peer,
	}));
	let intf = xfer::create(rt, &sock, XFER);
	sock.borrow_mut().xfer = intf;
	rt.udp.socks.push(sock);
	debug!("UDP open {local} -> {peer}");
	xfer::plug_plug(rt, intf, parent);
	Ok(())
}

/// Dispatch one received datagram.
pub fn rx(rt: &mut Runtime, iob: IoBuffer, src: SockAddr, dst: SockAddr) -> Result<()> {
	let sock = rt
		.udp
		.socks
		.iter()
		.find(|sock| {
			let sock = sock.borrow();
			sock.local.port() == dst.port()
				&& (sock.local.ip().is_unspecified() || sock.local.ip() == dst.ip())
		})
		.cloned();
	let Some(sock) = sock else {
		trace!("UDP {dst} has no listener");
		return Ok(());
	};
	let xfer = sock.borrow().xfer;
	let meta = Metadata {
		offset: None,
		src: Some(src),
	};
	xfer::deliver(rt, xfer, iob, &meta)
}

impl Object for UdpSocket {
	fn close(&mut self, rt: &mut Runtime, _port: Port, _rc: crate::errno::Status) {
		let me = self as *mut UdpSocket;
		rt.udp.socks.retain(|sock| !std::ptr::eq(sock.as_ptr(), me));
		xfer::shutdown(rt, self.xfer, Ok(()));
	}

	fn deliver(
		&mut self,
		rt: &mut Runtime,
		_port: Port,
		iob: IoBuffer,
		_meta: &Metadata,
	) -> Result<()> {
		net::tx(rt, IpProto::Udp, iob, self.local, self.peer)
	}

	fn window(&self, _port: Port) -> usize {
		usize::MAX
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::errno::Status;
	use crate::net::capture::CaptureNet;
	use std::net::Ipv4Addr;

	#[derive(Default)]
	struct App {
		datagrams: Vec<(Vec<u8>, Option<SockAddr>)>,
	}

	impl Object for App {
		fn deliver(
			&mut self,
			_rt: &mut Runtime,
			_port: Port,
			iob: IoBuffer,
			meta: &Metadata,
		) -> Result<()> {
			self.datagrams.push((iob.into_vec(), meta.src));
			Ok(())
		}

		fn close(&mut self, _rt: &mut Runtime, _port: Port, _rc: Status) {}
	}

	#[test]
	fn transmit_and_receive() {
		let mut rt = Runtime::new();
		let (net, frames) = CaptureNet::new();
		rt.set_net_backend(net);
		let app = Rc::new(RefCell::new(App::default()));
		let intf = xfer::create(&mut rt, &app, 0);
		let peer = SockAddr::v4(Ipv4Addr::new(10, 0, 0, 9), 10000);
		open(&mut rt, intf, peer, None).unwrap();

		xfer::deliver_raw(&mut rt, intf, b"ping").unwrap();
		let frame = frames.borrow().last().cloned().unwrap();
		assert_eq!(frame.payload, b"ping");
		assert_eq!(frame.remote, peer);

		// A reply to our local port reaches the application
		let local = frame.local;
		rx(&mut rt, IoBuffer::from_slice(b"pong"), peer, local).unwrap();
		assert_eq!(app.borrow().datagrams.len(), 1);
		assert_eq!(app.borrow().datagrams[0].0, b"pong");
		assert_eq!(app.borrow().datagrams[0].1, Some(peer));
	}

	#[test]
	fn multicast_binding_matches_group() {
		let mut rt = Runtime::new();
		let (net, _frames) = CaptureNet::new();
		rt.set_net_backend(net);
		let app = Rc::new(RefCell::new(App::default()));
		let intf = xfer::create(&mut rt, &app, 0);
		let group = SockAddr::v4(Ipv4Addr::new(239, 255, 1, 1), 10000);
		open(&mut rt, intf, group, Some(group)).unwrap();

		let server = SockAddr::v4(Ipv4Addr::new(10, 0, 0, 9), 10000);
		rx(&mut rt, IoBuffer::from_slice(b"data"), server, group).unwrap();
		assert_eq!(app.borrow().datagrams.len(), 1);

		// Datagrams for some other group are ignored
		let other = SockAddr::v4(Ipv4Addr::new(239, 255, 1, 2), 10000);
		rx(&mut rt, IoBuffer::from_slice(b"data"), server, other).unwrap();
		assert_eq!(app.borrow().datagrams.len(), 1);
	}
}
