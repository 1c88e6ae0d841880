//! Scalable Local Area Multicast file transfer.
//!
//! A receiver joins a multicast group and reassembles a file from
//! datagrams carrying `(transaction, total size, block size, index)`
//! headers in a variable-length integer encoding. Missing blocks are
//! requested through NACK runs sent to the server's unicast socket; one
//! NACK after every data datagram keeps the sender pacing itself
//! against the slowest receiver instead of blasting the group.
//!
//! Integers put the byte count in the top three bits of the first byte
//! and continue big-endian; a lone NUL terminates a run list.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::errno::{Errno, Result, Status};
use crate::iobuf::IoBuffer;
use crate::runtime::{RetryTimer, Runtime, TimerId, UriOpener, MICROS_PER_SEC};
use crate::socket::{self, SockAddr, SocketKind};
use crate::uri::Uri;
use crate::util::Bitmap;
use crate::xfer::{self, IntfId, Metadata, Object, Port};

const SLAM_DEFAULT_PORT: u16 = 10000;
const SLAM_DEFAULT_MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 255, 1, 1);
const SLAM_DEFAULT_MULTICAST_PORT: u16 = 10000;

/// Maximum bytes of cached header (three 7-byte integers).
const SLAM_MAX_HEADER_LEN: usize = 3 * 7;

/// Maximum number of blocks requested per NACK.
///
/// A policy decision equivalent to choosing a TCP window size.
const SLAM_MAX_BLOCKS_PER_NACK: u64 = 4;

/// Slave client timeout.
const SLAM_SLAVE_TIMEOUT: u64 = MICROS_PER_SEC;

/// Retry budget for the NACK timers.
const SLAM_MAX_RETRIES: u32 = 3;

/// Append a variable-length integer.
fn put_value(out: &mut Vec<u8>, value: u64) {
	let bits = 64 - value.leading_zeros() as usize;
	let len = (bits + 10) / 8;
	debug_assert!(len <= 7);
	let mut bytes = SmallVec::<[u8; 8]>::new();
	let mut rest = value;
	for _ in 0..len {
		bytes.push((rest & 0xff) as u8);
		rest >>= 8;
	}
	bytes.reverse();
	bytes[0] |= (len as u8) << 5;
	out.extend_from_slice(&bytes);
}

/// Read and strip a variable-length integer.
fn pull_value(iob: &mut IoBuffer) -> Result<u64> {
	if iob.is_empty() {
		debug!("SLAM empty value");
		return Err(Errno::EINVAL);
	}
	let first = iob.as_slice()[0];
	let len = (first >> 5) as usize;
	if len == 0 || len > 7 {
		debug!("SLAM invalid value length {len} bytes");
		return Err(Errno::EINVAL);
	}
	if len > iob.len() {
		debug!("SLAM value extends beyond packet");
		return Err(Errno::EINVAL);
	}
	let bytes = iob.pull(len)?;
	let mut value = u64::from(bytes[0] & 0x1f);
	for &byte in &bytes[1..] {
		value = (value << 8) | u64::from(byte);
	}
	Ok(value)
}

const XFER: Port = 0;
const SOCKET: Port = 1;
const MC_SOCKET: Port = 2;

pub(crate) struct SlamRequest {
	xfer: IntfId,
	socket: IntfId,
	mc_socket: IntfId,
	master_timer: RetryTimer,
	slave_timer: RetryTimer,
	/// Cached header, compared byte-for-byte against every datagram.
	header: Vec<u8>,
	total_bytes: u64,
	block_size: u64,
	num_blocks: u64,
	bitmap: Bitmap,
	/// Whether we ever sent anything to the server.
	nack_sent: bool,
}

pub const OPENER: UriOpener = UriOpener {
	scheme: "x-slam",
	open: open,
};

/// Parse a multicast override from the URI path (`/addr[:port]`).
fn parse_multicast(path: &str) -> Result<SockAddr> {
	let spec = path.strip_prefix('/').unwrap_or(path);
	let (addr, port) = match spec.split_once(':') {
		Some((addr, port)) => {
			let port = port.parse().map_err(|_| {
				debug!("SLAM invalid multicast port \"{port}\"");
				Errno::EINVAL
			})?;
			(addr, port)
		}
		None => (spec, SLAM_DEFAULT_MULTICAST_PORT),
	};
	let addr: Ipv4Addr = addr.parse().map_err(|_| {
		debug!("SLAM invalid multicast address \"{addr}\"");
		Errno::EINVAL
	})?;
	Ok(SockAddr::v4(addr, port))
}

/// Open a SLAM transfer and plug it onto `parent`.
pub fn open(rt: &mut Runtime, parent: IntfId, uri: &Uri) -> Result<()> {
	let Some(host) = uri.host.clone() else {
		return Err(Errno::EINVAL);
	};

	let slam = Rc::new(RefCell::new(SlamRequest {
		xfer: IntfId::NULL,
		socket: IntfId::NULL,
		mc_socket: IntfId::NULL,
		master_timer: RetryTimer::new(TimerId::NULL, SLAM_MAX_RETRIES),
		slave_timer: RetryTimer::new(TimerId::NULL, SLAM_MAX_RETRIES),
		// Fake an invalid cached header so the first datagram reprovisions
		header: vec![0],
		total_bytes: 0,
		block_size: 0,
		num_blocks: 1,
		bitmap: Bitmap::new(1),
		nack_sent: false,
	}));
	{
		let master = rt.timer_create(&slam);
		let slave = rt.timer_create(&slam);
		let mut req = slam.borrow_mut();
		req.master_timer = RetryTimer::new(master, SLAM_MAX_RETRIES);
		req.slave_timer = RetryTimer::new(slave, SLAM_MAX_RETRIES);
		req.xfer = xfer::create(rt, &slam, XFER);
		req.socket = xfer::create(rt, &slam, SOCKET);
		req.mc_socket = xfer::create(rt, &slam, MC_SOCKET);
	}

	// Unicast socket towards the server
	let (sock, mc_sock) = {
		let req = slam.borrow();
		(req.socket, req.mc_socket)
	};
	let port = uri.port_or(SLAM_DEFAULT_PORT);
	if let Err(rc) = socket::open_named_socket(rt, sock, SocketKind::Dgram, &host, port) {
		debug!("SLAM could not open unicast socket: {rc}");
		slam.borrow_mut().finished(rt, Err(rc));
		return Err(rc);
	}

	// Multicast subscription
	let multicast = match uri.path.as_deref() {
		Some(path) => match parse_multicast(path) {
			Ok(multicast) => multicast,
			Err(rc) => {
				slam.borrow_mut().finished(rt, Err(rc));
				return Err(rc);
			}
		},
		None => SockAddr::v4(SLAM_DEFAULT_MULTICAST, SLAM_DEFAULT_MULTICAST_PORT),
	};
	if let Err(rc) = socket::open_socket(rt, mc_sock, SocketKind::Dgram, multicast, Some(multicast)) {
		debug!("SLAM could not open multicast socket: {rc}");
		slam.borrow_mut().finished(rt, Err(rc));
		return Err(rc);
	}

	{
		let mut req = slam.borrow_mut();
		req.slave_timer.start_fixed(rt, SLAM_SLAVE_TIMEOUT);
	}
	xfer::plug_plug(rt, slam.borrow().xfer, parent);
	Ok(())
}

impl SlamRequest {
	/// Complete the transfer and close everything down.
	fn finished(&mut self, rt: &mut Runtime, rc: Status) {
		debug!("SLAM finished: {rc:?}");

		// Tell the server to stop, if it ever heard from us
		if self.nack_sent {
			let _ = xfer::deliver_raw(rt, self.socket, &[0]);
		}

		self.master_timer.stop(rt);
		self.slave_timer.stop(rt);
		rt.timer_free(self.master_timer.id());
		rt.timer_free(self.slave_timer.id());

		xfer::shutdown(rt, self.socket, rc);
		xfer::shutdown(rt, self.mc_socket, rc);
		xfer::shutdown(rt, self.xfer, rc);
	}

	/// Transmit a NACK for the first run of missing blocks.
	fn tx_nack(&mut self, rt: &mut Runtime) {
		self.nack_sent = true;

		let first_block = self.bitmap.first_gap() as u64;
		let mut num_blocks = 1;
		while num_blocks < SLAM_MAX_BLOCKS_PER_NACK
			&& first_block + num_blocks < self.num_blocks
			&& !self.bitmap.test((first_block + num_blocks) as usize)
		{
			num_blocks += 1;
		}
		trace!("SLAM NACK for blocks {first_block}-{}", first_block + num_blocks - 1);

		let mut nack = Vec::with_capacity(15);
		put_value(&mut nack, first_block);
		put_value(&mut nack, num_blocks);
		nack.push(0);
		if let Err(rc) = xfer::deliver_raw(rt, self.socket, &nack) {
			debug!("SLAM could not transmit NACK: {rc}");
		}
	}

	/// Strip the per-datagram header, reprovisioning on change.
	fn pull_header(&mut self, rt: &mut Runtime, iob: &mut IoBuffer) -> Result<()> {
		if self.header.len() <= iob.len() && iob.as_slice()[..self.header.len()] == self.header[..] {
			iob.pull(self.header.len())?;
			return Ok(());
		}

		debug!("SLAM detected changed header; resetting");
		let snapshot: SmallVec<[u8; SLAM_MAX_HEADER_LEN]> = iob
			.as_slice()
			.iter()
			.take(SLAM_MAX_HEADER_LEN)
			.copied()
			.collect();
		let before = iob.len();
		let _xid = pull_value(iob)?;
		self.total_bytes = pull_value(iob)?;
		self.block_size = pull_value(iob)?;
		let header_len = before - iob.len();
		debug_assert!(header_len <= SLAM_MAX_HEADER_LEN);

		// Cache the raw header bytes for the byte-for-byte comparison
		self.header = snapshot[..header_len].to_vec();

		if self.block_size == 0 {
			debug!("SLAM zero block size");
			return Err(Errno::EINVAL);
		}
		self.num_blocks = self.total_bytes.div_ceil(self.block_size);
		debug!(
			"SLAM total {} bytes, block size {}, {} blocks",
			self.total_bytes, self.block_size, self.num_blocks
		);

		self.bitmap.resize(self.num_blocks as usize);

		// Notify the recipient of the file size
		xfer::seek(rt, self.xfer, self.total_bytes)?;
		Ok(())
	}

	/// Data datagram from the multicast group.
	fn mc_deliver(&mut self, rt: &mut Runtime, mut iob: IoBuffer) -> Result<()> {
		// Whoever is master, data is flowing: be a slave again
		self.master_timer.stop(rt);
		self.slave_timer.stop(rt);
		self.slave_timer.start_fixed(rt, SLAM_SLAVE_TIMEOUT);

		self.pull_header(rt, &mut iob)?;
		let packet = pull_value(&mut iob)?;

		if packet >= self.num_blocks {
			debug!("SLAM out-of-range packet {packet} (of {})", self.num_blocks);
			return Err(Errno::EINVAL);
		}
		let len = iob.len() as u64;
		if len > self.block_size {
			debug!("SLAM oversize packet of {len} bytes");
			return Err(Errno::EINVAL);
		}
		if packet != self.num_blocks - 1 && len < self.block_size {
			debug!("SLAM short packet of {len} bytes");
			return Err(Errno::EINVAL);
		}

		if !self.bitmap.test(packet as usize) {
			let meta = Metadata::at_offset(packet * self.block_size);
			xfer::deliver(rt, self.xfer, iob, &meta)?;
			self.bitmap.set(packet as usize);
		}

		if self.bitmap.full() {
			self.finished(rt, Ok(()));
		} else {
			// Request the next missing run; this paces the server
			self.tx_nack(rt);
		}
		Ok(())
	}

	/// Non-data datagram on the unicast socket solicits a NACK.
	fn socket_deliver(&mut self, rt: &mut Runtime, mut iob: IoBuffer) -> Result<()> {
		self.master_timer.stop(rt);
		self.master_timer.start(rt);

		self.pull_header(rt, &mut iob)?;
		if !iob.is_empty() {
			debug!("SLAM received trailing garbage");
			return Err(Errno::EINVAL);
		}

		self.tx_nack(rt);
		Ok(())
	}
}

impl Object for SlamRequest {
	fn close(&mut self, rt: &mut Runtime, _port: Port, rc: Status) {
		self.finished(rt, rc);
	}

	fn deliver(
		&mut self,
		rt: &mut Runtime,
		port: Port,
		iob: IoBuffer,
		_meta: &Metadata,
	) -> Result<()> {
		let rc = match port {
			MC_SOCKET => self.mc_deliver(rt, iob),
			SOCKET => self.socket_deliver(rt, iob),
			// Recipient has nothing to say to us
			_ => Ok(()),
		};
		if let Err(rc) = rc {
			// Malformed datagrams are dropped, not fatal
			trace!("SLAM discarded datagram: {rc}");
		}
		Ok(())
	}

	fn window(&self, _port: Port) -> usize {
		usize::MAX
	}

	fn timer_expired(&mut self, rt: &mut Runtime, timer: TimerId) {
		if self.master_timer.is(timer) {
			if self.master_timer.expired() {
				// Give up mastering; the slave timeout still guards the
				// transfer as a whole
				debug!("SLAM giving up acting as master client");
			} else {
				self.master_timer.start(rt);
				self.tx_nack(rt);
			}
		} else if self.slave_timer.is(timer) {
			if self.slave_timer.expired() {
				self.finished(rt, Err(Errno::ETIMEDOUT));
			} else {
				debug!("SLAM trying to become master client");
				self.slave_timer.start(rt);
				self.tx_nack(rt);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::net::capture::{CaptureNet, Frame, FrameLog};
	use crate::net::udp;

	const SERVER: SockAddr = SockAddr::V4 {
		addr: Ipv4Addr::new(10, 0, 0, 9),
		port: 10000,
	};
	const GROUP: SockAddr = SockAddr::V4 {
		addr: SLAM_DEFAULT_MULTICAST,
		port: SLAM_DEFAULT_MULTICAST_PORT,
	};

	#[derive(Default)]
	struct Sink {
		blocks: Vec<(u64, Vec<u8>)>,
		size: Option<u64>,
		closed: Option<Status>,
	}

	impl Sink {
		fn assembled(&self) -> Vec<u8> {
			let mut out = Vec::new();
			for (offset, data) in &self.blocks {
				let offset = *offset as usize;
				if out.len() < offset + data.len() {
					out.resize(offset + data.len(), 0);
				}
				out[offset..offset + data.len()].copy_from_slice(data);
			}
			out
		}
	}

	impl Object for Sink {
		fn close(&mut self, _rt: &mut Runtime, _port: Port, rc: Status) {
			self.closed = Some(rc);
		}

		fn deliver(
			&mut self,
			_rt: &mut Runtime,
			_port: Port,
			iob: IoBuffer,
			meta: &Metadata,
		) -> Result<()> {
			if iob.is_empty() {
				self.size = meta.offset;
			} else {
				self.blocks.push((meta.offset.unwrap_or(0), iob.into_vec()));
			}
			Ok(())
		}

		fn window(&self, _port: Port) -> usize {
			usize::MAX
		}
	}

	struct Harness {
		rt: Runtime,
		frames: FrameLog,
		sink: Rc<RefCell<Sink>>,
	}

	fn harness() -> Harness {
		let mut rt = Runtime::new();
		let (net, frames) = CaptureNet::new();
		rt.set_net_backend(net);
		rt.add_host("slam.example", Ipv4Addr::new(10, 0, 0, 9).into());
		let sink = Rc::new(RefCell::new(Sink::default()));
		let intf = xfer::create(&mut rt, &sink, 0);
		let uri = Uri::parse("x-slam://slam.example");
		open(&mut rt, intf, &uri).unwrap();
		Harness { rt, frames, sink }
	}

	fn header(xid: u64, total: u64, block_size: u64) -> Vec<u8> {
		let mut out = Vec::new();
		put_value(&mut out, xid);
		put_value(&mut out, total);
		put_value(&mut out, block_size);
		out
	}

	fn data_packet(xid: u64, total: u64, block_size: u64, index: u64, data: &[u8]) -> Vec<u8> {
		let mut out = header(xid, total, block_size);
		put_value(&mut out, index);
		out.extend_from_slice(data);
		out
	}

	fn inject_mc(h: &mut Harness, payload: &[u8]) {
		udp::rx(&mut h.rt, IoBuffer::from_slice(payload), SERVER, GROUP).unwrap();
	}

	fn unicast_frames(h: &Harness) -> Vec<Frame> {
		h.frames
			.borrow()
			.iter()
			.filter(|frame| frame.remote == SERVER)
			.cloned()
			.collect()
	}

	#[test]
	fn varint_codec_round_trips() {
		for value in [0u64, 1, 31, 32, 255, 256, 0x1234_5678, 0x1_0000_0000, 0x1f_ffff_ffff_ffff] {
			let mut encoded = Vec::new();
			put_value(&mut encoded, value);
			let mut iob = IoBuffer::from_slice(&encoded);
			assert_eq!(pull_value(&mut iob).unwrap(), value, "{value:#x}");
			assert!(iob.is_empty());
		}
		// Minimal width: small values take one byte
		let mut encoded = Vec::new();
		put_value(&mut encoded, 3);
		assert_eq!(encoded, vec![0x23]);
		// A lone NUL is not a value
		let mut iob = IoBuffer::from_slice(&[0x00]);
		assert_eq!(pull_value(&mut iob).unwrap_err(), Errno::EINVAL);
	}

	#[test]
	fn tiny_transfer_reassembles_and_disconnects() {
		let mut h = harness();

		inject_mc(&mut h, &data_packet(1, 3, 2, 0, b"Hi"));
		// First data datagram seeds the header and reports the size
		assert_eq!(h.sink.borrow().size, Some(3));
		// One NACK went to the server, asking for the missing block
		let nacks = unicast_frames(&h);
		assert_eq!(nacks.len(), 1);
		assert_eq!(nacks[0].payload, vec![0x21, 0x21, 0x00]);

		// Final (short) block completes the transfer
		inject_mc(&mut h, &data_packet(1, 3, 2, 1, b"!"));
		assert_eq!(h.sink.borrow().assembled(), b"Hi!");
		assert_eq!(h.sink.borrow().closed, Some(Ok(())));

		// Disconnect: a single NUL byte
		let frames = unicast_frames(&h);
		assert_eq!(frames.last().unwrap().payload, vec![0x00]);
	}

	#[test]
	fn duplicate_blocks_are_dropped() {
		let mut h = harness();
		inject_mc(&mut h, &data_packet(1, 4, 2, 0, b"ab"));
		inject_mc(&mut h, &data_packet(1, 4, 2, 0, b"ab"));
		assert_eq!(h.sink.borrow().blocks.len(), 1);
	}

	#[test]
	fn header_change_resets_transfer() {
		let mut h = harness();
		inject_mc(&mut h, &data_packet(1, 4, 2, 0, b"ab"));
		// New transaction: everything reprovisions
		inject_mc(&mut h, &data_packet(2, 6, 2, 0, b"xy"));
		assert_eq!(h.sink.borrow().size, Some(6));
		// The transfer completes only once all three new blocks arrive
		inject_mc(&mut h, &data_packet(2, 6, 2, 1, b"zw"));
		inject_mc(&mut h, &data_packet(2, 6, 2, 2, b"vu"));
		assert_eq!(h.sink.borrow().closed, Some(Ok(())));
		assert_eq!(&h.sink.borrow().assembled()[..], b"xyzwvu");
	}

	#[test]
	fn short_intermediate_block_is_rejected() {
		let mut h = harness();
		inject_mc(&mut h, &data_packet(1, 6, 2, 0, b"a"));
		assert!(h.sink.borrow().blocks.is_empty());
	}

	#[test]
	fn slave_timeout_promotes_then_aborts() {
		let mut h = harness();
		// First expiry: promote to master and solicit with a NACK
		h.rt.idle_advance();
		h.rt.poll();
		let nacks = unicast_frames(&h);
		assert_eq!(nacks.len(), 1);
		// Initial NACK asks for block 0 of the faked one-block bitmap
		assert_eq!(nacks[0].payload, vec![0x20, 0x21, 0x00]);

		// Keep expiring: the retry budget runs out and the transfer dies
		for _ in 0..8 {
			if h.sink.borrow().closed.is_some() {
				break;
			}
			h.rt.idle_advance();
			h.rt.poll();
		}
		assert_eq!(h.sink.borrow().closed, Some(Err(Errno::ETIMEDOUT)));
	}

	#[test]
	fn solicitation_draws_nack() {
		let mut h = harness();
		inject_mc(&mut h, &data_packet(1, 6, 2, 0, b"ab"));
		let before = unicast_frames(&h).len();

		// Server pokes our unicast socket with a bare header
		let local = unicast_frames(&h)[0].local;
		udp::rx(&mut h.rt, IoBuffer::from_slice(&header(1, 6, 2)), SERVER, local).unwrap();
		let nacks = unicast_frames(&h);
		assert_eq!(nacks.len(), before + 1);
		// Missing run starts at block 1 and spans the two absent blocks
		assert_eq!(nacks.last().unwrap().payload, vec![0x21, 0x22, 0x00]);
	}
}
