//! TCP for client connections.
//!
//! The state machine follows RFC 793 with the usual client-side
//! simplifications: no passive open, one in-flight segment's worth of
//! unacknowledged sequence space, every segment piggybacking an ACK.
//! State is encoded as the set of {sent, received, acknowledged}
//! control flags rather than a flat enum, which makes the handshake and
//! teardown transitions fall out of flag arithmetic.
//!
//! Re-entrancy rule: segment processing releases the TCB borrow before
//! notifying the application, and the application-facing handlers never
//! transmit synchronously (transmission is kicked through the
//! scheduler), so a delivery can never find its own connection locked.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;

use crate::errno::{Errno, Result, Status};
use crate::iobuf::IoBuffer;
use crate::net::{self, IpProto};
use crate::runtime::{RetryTimer, Runtime, TimerId, MICROS_PER_SEC};
use crate::socket::SockAddr;
use crate::xfer::{self, IntfId, Metadata, Object, Port};

/// Advertised maximum segment size.
pub const TCP_MSS: usize = 1460;
/// Ceiling on the advertised receive window.
const TCP_MAX_WINDOW_SIZE: usize = 65536 - 4;
/// Maximum segment lifetime.
const TCP_MSL: u64 = 120 * MICROS_PER_SEC;
/// Retransmission budget before the connection is torn down.
const TCP_MAX_RETRIES: u32 = 10;
/// First local port considered for auto-allocation.
const TCP_MIN_AUTO_PORT: u16 = 1024;

const TCP_HDR_LEN: usize = 20;
const TCP_MSS_OPTION_LEN: usize = 4;

bitflags! {
	/// TCP header flags.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct TcpFlags: u8 {
		const FIN = 0x01;
		const SYN = 0x02;
		const RST = 0x04;
		const PSH = 0x08;
		const ACK = 0x10;
		const URG = 0x20;
	}
}

bitflags! {
	/// Connection state as sent/received/acknowledged control flags.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	struct TcpState: u16 {
		const SENT_SYN = 0x0001;
		const SENT_FIN = 0x0002;
		const SENT_ACK = 0x0004;
		const SENT_RST = 0x0008;
		const ACKED_SYN = 0x0010;
		const ACKED_FIN = 0x0020;
		const RCVD_SYN = 0x0100;
		const RCVD_FIN = 0x0200;
	}
}

impl TcpState {
	fn can_send_data(self) -> bool {
		self.contains(TcpState::SENT_SYN | TcpState::ACKED_SYN | TcpState::RCVD_SYN)
			&& !self.contains(TcpState::SENT_FIN)
	}

	fn closed_gracefully(self) -> bool {
		self.contains(TcpState::ACKED_FIN | TcpState::RCVD_FIN)
	}

	/// Header flags to transmit in this state.
	fn sending(self) -> TcpFlags {
		let mut flags = TcpFlags::empty();
		if self.contains(TcpState::SENT_SYN) && !self.contains(TcpState::ACKED_SYN) {
			flags |= TcpFlags::SYN;
		}
		if self.contains(TcpState::SENT_FIN) && !self.contains(TcpState::ACKED_FIN) {
			flags |= TcpFlags::FIN;
		}
		if self.contains(TcpState::SENT_ACK) {
			flags |= TcpFlags::ACK;
		}
		if self.contains(TcpState::SENT_RST) {
			flags |= TcpFlags::RST | TcpFlags::ACK;
		}
		flags
	}

	fn name(self) -> &'static str {
		let state = self & !(TcpState::SENT_ACK | TcpState::SENT_RST);
		if state.is_empty() {
			"CLOSED"
		} else if state == TcpState::SENT_SYN {
			"SYN_SENT"
		} else if state == TcpState::SENT_SYN | TcpState::RCVD_SYN {
			"SYN_RCVD"
		} else if state.contains(TcpState::RCVD_FIN) && state.contains(TcpState::SENT_FIN) {
			if state.contains(TcpState::ACKED_FIN) {
				"TIME_WAIT"
			} else {
				"CLOSING/LAST_ACK"
			}
		} else if state.contains(TcpState::SENT_FIN) {
			if state.contains(TcpState::ACKED_FIN) {
				"FIN_WAIT_2"
			} else {
				"FIN_WAIT_1"
			}
		} else if state.contains(TcpState::RCVD_FIN) {
			"CLOSE_WAIT"
		} else if state.contains(TcpState::ACKED_SYN) {
			"ESTABLISHED"
		} else {
			"INVALID"
		}
	}
}

/// Parsed TCP segment header.
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
	pub src: u16,
	pub dst: u16,
	pub seq: u32,
	pub ack: u32,
	pub flags: TcpFlags,
	pub window: u16,
}

/// Build a complete segment, including the checksum and, on SYN, the
/// MSS option.
pub fn build_segment(
	local: SockAddr,
	remote: SockAddr,
	seq: u32,
	ack: u32,
	flags: TcpFlags,
	window: u16,
	payload: &[u8],
) -> IoBuffer {
	let syn = flags.contains(TcpFlags::SYN);
	let opt_len = if syn { TCP_MSS_OPTION_LEN } else { 0 };
	let hlen = TCP_HDR_LEN + opt_len;
	let mut iob = IoBuffer::with_headroom(hlen, payload.len());
	iob.put_slice(payload).expect("tailroom");
	if syn {
		let opt = iob.push(TCP_MSS_OPTION_LEN).expect("headroom");
		opt[0] = 2; // kind: maximum segment size
		opt[1] = 4;
		BigEndian::write_u16(&mut opt[2..4], TCP_MSS as u16);
	}
	{
		let hdr = iob.push(TCP_HDR_LEN).expect("headroom");
		BigEndian::write_u16(&mut hdr[0..2], local.port());
		BigEndian::write_u16(&mut hdr[2..4], remote.port());
		BigEndian::write_u32(&mut hdr[4..8], seq);
		BigEndian::write_u32(&mut hdr[8..12], ack);
		hdr[12] = ((hlen / 4) << 4) as u8;
		hdr[13] = flags.bits();
		BigEndian::write_u16(&mut hdr[14..16], window);
		BigEndian::write_u16(&mut hdr[16..18], 0);
		BigEndian::write_u16(&mut hdr[18..20], 0);
	}
	let csum = net::tcpip_checksum(IpProto::Tcp, &local, &remote, iob.as_slice());
	BigEndian::write_u16(&mut iob.as_mut_slice()[16..18], csum);
	iob
}

/// Parse and strip a segment header; unknown options are skipped.
pub fn parse_segment(iob: &mut IoBuffer) -> Result<TcpHeader> {
	if iob.len() < TCP_HDR_LEN {
		debug!("TCP segment too short at {} bytes", iob.len());
		return Err(Errno::EINVAL);
	}
	let hdr = iob.as_slice();
	let hlen = ((hdr[12] >> 4) as usize) * 4;
	if hlen < TCP_HDR_LEN || hlen > iob.len() {
		debug!("TCP bad header length {hlen}");
		return Err(Errno::EINVAL);
	}
	let parsed = TcpHeader {
		src: BigEndian::read_u16(&hdr[0..2]),
		dst: BigEndian::read_u16(&hdr[2..4]),
		seq: BigEndian::read_u32(&hdr[4..8]),
		ack: BigEndian::read_u32(&hdr[8..12]),
		flags: TcpFlags::from_bits_truncate(hdr[13]),
		window: BigEndian::read_u16(&hdr[14..16]),
	};
	iob.pull(hlen)?;
	Ok(parsed)
}

const XFER: Port = 0;

/// A TCP control block.
pub(crate) struct TcpConnection {
	xfer: IntfId,
	local: SockAddr,
	peer: SockAddr,
	state: TcpState,
	prev_state: TcpState,
	/// Next unacknowledged sequence number (SND.UNA).
	snd_seq: u32,
	/// Sequence space sent but not yet acknowledged (SND.NXT - SND.UNA).
	snd_sent: u32,
	/// Peer receive window (SND.WND).
	snd_win: u32,
	/// Next expected receive sequence number (RCV.NXT).
	rcv_ack: u32,
	/// Bytes queued by the application, kept until acknowledged.
	tx_queue: VecDeque<u8>,
	timer: RetryTimer,
	/// Whether a RST has ever been transmitted on this connection.
	sent_rst: bool,
}

/// Table of live connections, keyed by local port.
pub(crate) struct TcpTable {
	conns: HashMap<u16, Rc<RefCell<TcpConnection>>>,
	cursor: u16,
}

impl TcpTable {
	pub fn new() -> Self {
		TcpTable {
			conns: HashMap::new(),
			cursor: TCP_MIN_AUTO_PORT,
		}
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.conns.len()
	}
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

fn bind(rt: &mut Runtime, local_port: u16) -> Result<u16> {
	if local_port != 0 {
		if rt.tcp.conns.contains_key(&local_port) {
			debug!("TCP could not bind: port {local_port} in use");
			return Err(Errno::EADDRINUSE);
		}
		return Ok(local_port);
	}
	for _ in 0..u32::from(u16::MAX) {
		let port = rt.tcp.cursor;
		rt.tcp.cursor = rt.tcp.cursor.checked_add(1).unwrap_or(TCP_MIN_AUTO_PORT);
		if !rt.tcp.conns.contains_key(&port) {
			return Ok(port);
		}
	}
	debug!("TCP could not bind: no free ports");
	Err(Errno::EADDRINUSE)
}

/// Open a connection to `peer` and plug its stream interface onto
/// `parent`.
pub fn open(rt: &mut Runtime, parent: IntfId, peer: SockAddr) -> Result<()> {
	open_bound(rt, parent, peer, 0)
}

/// Open a connection from an explicit local port (0 auto-allocates).
pub fn open_bound(rt: &mut Runtime, parent: IntfId, peer: SockAddr, local_port: u16) -> Result<()> {
	let port = bind(rt, local_port)?;
	let isn = rt.next_u32();
	let conn = Rc::new(RefCell::new(TcpConnection {
		xfer: IntfId::NULL,
		local: unspecified_local(&peer, port),
		peer,
		state: TcpState::empty(),
		prev_state: TcpState::empty(),
		snd_seq: isn,
		snd_sent: 0,
		snd_win: 0,
		rcv_ack: 0,
		tx_queue: VecDeque::new(),
		timer: RetryTimer::new(TimerId::NULL, TCP_MAX_RETRIES),
		sent_rst: false,
	}));
	let timer = rt.timer_create(&conn);
	let intf = xfer::create(rt, &conn, XFER);
	{
		let mut tcb = conn.borrow_mut();
		tcb.timer = RetryTimer::new(timer, TCP_MAX_RETRIES);
		tcb.xfer = intf;
	}
	rt.tcp.conns.insert(port, conn.clone());
	debug!("TCP {port} open to {peer}");

	xfer::plug_plug(rt, intf, parent);

	// Active open: straight to SYN_SENT
	let mut tcb = conn.borrow_mut();
	tcb.transition(TcpState::SENT_SYN);
	tcb.senddata(rt, false);
	Ok(())
}

impl TcpConnection {
	fn transition(&mut self, state: TcpState) {
		self.state = state;
		if self.state != self.prev_state {
			debug!(
				"TCP {} transitioned from {} to {}",
				self.local.port(),
				self.prev_state.name(),
				self.state.name()
			);
		}
		self.prev_state = self.state;
	}

	fn free(&mut self, rt: &mut Runtime) {
		self.timer.stop(rt);
		rt.timer_free(self.timer.id());
		rt.tcp.conns.remove(&self.local.port());
		debug!("TCP {} freed", self.local.port());
	}

	/// Tear the connection down, optionally transmitting a RST first.
	fn abort(&mut self, rt: &mut Runtime, send_rst: bool, rc: Status) {
		if send_rst {
			self.transition(TcpState::SENT_RST);
			self.senddata(rt, true);
			self.sent_rst = true;
		}
		self.transition(TcpState::empty());
		self.free(rt);
		xfer::shutdown(rt, self.xfer, rc);
	}

	/// Transmit pending data and control flags.
	///
	/// Starts the retransmission timer whenever the segment consumes
	/// sequence space; an unreachable-network error on a connection
	/// that has never sent a RST aborts immediately rather than waiting
	/// for the retry ladder.
	fn senddata(&mut self, rt: &mut Runtime, force_send: bool) {
		let mut payload_len = 0;
		if self.state.can_send_data() {
			payload_len = self.tx_queue.len().min(TCP_MSS).min(self.snd_win as usize);
		}

		let flags = self.state.sending();
		debug_assert!(!flags.contains(TcpFlags::SYN | TcpFlags::FIN));
		let mut seq_len = payload_len as u32;
		if flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
			seq_len += 1;
		}
		self.snd_sent = seq_len;

		if seq_len == 0 && !force_send {
			return;
		}
		if seq_len != 0 {
			self.timer.start(rt);
		}

		// Advertised window: three quarters of the free-memory budget,
		// dword-aligned, bounded above
		let window = ((rt.free_memory() * 3) / 4).min(TCP_MAX_WINDOW_SIZE) & !0x03;

		let payload: Vec<u8> = self.tx_queue.iter().take(payload_len).copied().collect();
		let iob = build_segment(
			self.local,
			self.peer,
			self.snd_seq,
			self.rcv_ack,
			flags,
			window as u16,
			&payload,
		);
		trace!(
			"TCP {} TX {:08x}..{:08x} {:08x} {} {:?}",
			self.local.port(),
			self.snd_seq,
			self.snd_seq.wrapping_add(seq_len),
			self.rcv_ack,
			payload_len,
			flags
		);

		let rc = net::tx(rt, IpProto::Tcp, iob, self.local, self.peer);
		if rc == Err(Errno::ENETUNREACH) && !self.sent_rst {
			debug!(
				"TCP {} aborting after TX failed: network unreachable",
				self.local.port()
			);
			self.abort(rt, false, Err(Errno::ENETUNREACH));
		}
	}

	/// Process a received ACK. Returns whether the application should
	/// be told that the window moved.
	fn process_ack(&mut self, rt: &mut Runtime, ack: u32, win: u32) -> Result<bool> {
		let ack_len = ack.wrapping_sub(self.snd_seq);
		if ack_len > self.snd_sent {
			debug!(
				"TCP {} received ACK for {:08x}, sent only to {:08x}",
				self.local.port(),
				ack,
				self.snd_seq.wrapping_add(self.snd_sent)
			);
			return Err(Errno::EINVAL);
		}

		// An ACK covering all outstanding sequence space also covers
		// the flag, since SYN or FIN is always the last sequence point.
		let mut len = ack_len;
		let mut acked_flags = TcpState::empty();
		if ack_len == self.snd_sent {
			let sending = self.state.sending();
			if sending.contains(TcpFlags::SYN) {
				acked_flags |= TcpState::ACKED_SYN;
			}
			if sending.contains(TcpFlags::FIN) {
				acked_flags |= TcpState::ACKED_FIN;
			}
			if !acked_flags.is_empty() {
				len -= 1;
			}
		}

		let old_win = self.snd_win;
		self.snd_seq = ack;
		self.snd_sent = 0;
		self.snd_win = win;
		self.timer.stop(rt);

		self.tx_queue.drain(..(len as usize).min(self.tx_queue.len()));

		if !acked_flags.is_empty() {
			let state = self.state | acked_flags;
			self.transition(state);
		}

		let established = acked_flags.contains(TcpState::ACKED_SYN)
			&& self.state.contains(TcpState::RCVD_SYN);
		Ok(established || len > 0 || win != old_win)
	}

	/// Process a received SYN. Returns whether the connection became
	/// established.
	fn process_syn(&mut self, seq: u32) -> bool {
		if !self.state.contains(TcpState::RCVD_SYN) {
			self.rcv_ack = seq;
		}
		if self.rcv_ack.wrapping_sub(seq) > 0 {
			return false; // duplicate
		}
		let state = self.state | TcpState::SENT_ACK | TcpState::RCVD_SYN;
		self.transition(state);
		self.rcv_ack = self.rcv_ack.wrapping_add(1);
		self.state.contains(TcpState::ACKED_SYN)
	}

	/// Process received payload. Returns the fresh part for delivery.
	fn process_data(&mut self, seq: u32, mut iob: IoBuffer) -> Option<IoBuffer> {
		let already = self.rcv_ack.wrapping_sub(seq) as usize;
		if already >= iob.len() {
			return None; // duplicate or out of order
		}
		let fresh = iob.len() - already;
		iob.pull(already).ok()?;
		self.rcv_ack = self.rcv_ack.wrapping_add(fresh as u32);
		Some(iob)
	}

	/// Process a received FIN. Returns whether the stream just closed.
	fn process_fin(&mut self, seq: u32) -> bool {
		if self.rcv_ack.wrapping_sub(seq) > 0 {
			return false; // duplicate
		}
		// Acknowledge the FIN and queue our own
		let state = self.state | TcpState::RCVD_FIN | TcpState::SENT_FIN;
		self.transition(state);
		self.rcv_ack = self.rcv_ack.wrapping_add(1);
		true
	}

	/// Process a received RST. Returns whether the connection aborted.
	fn process_rst(&mut self, rt: &mut Runtime, seq: u32) -> bool {
		if self.state.contains(TcpState::RCVD_SYN) {
			// Accept only in-window resets
			if self.rcv_ack.wrapping_sub(seq) > 0 {
				return false;
			}
		} else if !self.state.contains(TcpState::ACKED_SYN) {
			return false;
		}
		// Abort without replying with a RST of our own
		self.abort(rt, false, Err(Errno::ECONNRESET));
		true
	}

	/// Application-initiated close.
	fn stream_close(&mut self, rt: &mut Runtime) {
		if !self.state.contains(TcpState::RCVD_SYN) {
			// Nothing on the wire worth finishing: delete the TCB
			self.transition(TcpState::empty());
			self.free(rt);
			xfer::shutdown(rt, self.xfer, Ok(()));
			return;
		}

		// A SYN that was never acknowledged would make a FIN violate
		// sequencing; pretend the SYN was ACKed first.
		if !self.state.contains(TcpState::ACKED_SYN) {
			let fake_ack = self.snd_seq.wrapping_add(1);
			let _ = self.process_ack(rt, fake_ack, 0);
		}

		let state = self.state | TcpState::SENT_FIN;
		self.transition(state);
		self.senddata(rt, false);
	}
}

/// One-shot RST in reply to a segment with no matching connection,
/// constructed entirely from the incoming header.
fn send_reset(rt: &mut Runtime, hdr: &TcpHeader, src: SockAddr, dst: SockAddr, data_len: u32) {
	let mut seq_len = data_len;
	if hdr.flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
		seq_len += 1;
	}
	let iob = build_segment(
		dst,
		src,
		hdr.ack,
		hdr.seq.wrapping_add(seq_len),
		TcpFlags::RST | TcpFlags::ACK,
		(TCP_MAX_WINDOW_SIZE & 0xffff) as u16,
		&[],
	);
	debug!("TCP RST {} -> {}", hdr.dst, hdr.src);
	let _ = net::tx(rt, IpProto::Tcp, iob, dst, src);
}

/// Process one received segment.
pub fn rx(rt: &mut Runtime, mut iob: IoBuffer, src: SockAddr, dst: SockAddr) -> Result<()> {
	if !net::tcpip_checksum_ok(IpProto::Tcp, &src, &dst, iob.as_slice()) {
		debug!("TCP checksum incorrect");
		return Err(Errno::EINVAL);
	}
	let hdr = parse_segment(&mut iob)?;
	let data_len = iob.len() as u32;

	let conn = rt.tcp.conns.get(&hdr.dst).cloned();
	let Some(conn) = conn else {
		send_reset(rt, &hdr, src, dst, data_len);
		return Err(Errno::ENOTCONN);
	};

	trace!(
		"TCP {} RX {:08x} {:08x} {} {:?}",
		hdr.dst,
		hdr.ack,
		hdr.seq,
		iob.len(),
		hdr.flags
	);

	let start_seq = hdr.seq;
	let mut seq = hdr.seq;
	let xfer = conn.borrow().xfer;

	if hdr.flags.contains(TcpFlags::ACK) {
		let moved = conn.borrow_mut().process_ack(rt, hdr.ack, u32::from(hdr.window));
		match moved {
			Ok(true) => xfer::window_changed(rt, xfer),
			Ok(false) => {}
			Err(_) => {
				send_reset(rt, &hdr, src, dst, data_len);
				return Err(Errno::EINVAL);
			}
		}
	}

	if hdr.flags.contains(TcpFlags::SYN) {
		let established = conn.borrow_mut().process_syn(seq);
		if established {
			xfer::window_changed(rt, xfer);
		}
		seq = seq.wrapping_add(1);
	}

	if hdr.flags.contains(TcpFlags::RST) {
		if conn.borrow_mut().process_rst(rt, seq) {
			return Ok(());
		}
	}

	if data_len != 0 {
		let fresh = conn.borrow_mut().process_data(seq, iob);
		if let Some(fresh) = fresh {
			if let Err(rc) = xfer::deliver(rt, xfer, fresh, &Metadata::default()) {
				debug!("TCP data discarded upstream: {rc}");
			}
		}
		seq = seq.wrapping_add(data_len);
	}

	if hdr.flags.contains(TcpFlags::FIN) {
		let closed = conn.borrow_mut().process_fin(seq);
		if closed {
			xfer::shutdown(rt, xfer, Ok(()));
		}
		seq = seq.wrapping_add(1);
	}

	// The handlers above may have freed the connection
	if rt.tcp.conns.contains_key(&hdr.dst) {
		let mut tcb = conn.borrow_mut();
		// Reply immediately whenever the peer expects an ACK
		tcb.senddata(rt, start_seq != seq);
		if tcb.state.closed_gracefully() {
			tcb.timer.start_fixed(rt, 2 * TCP_MSL);
		}
	}
	Ok(())
}

impl Object for TcpConnection {
	fn close(&mut self, rt: &mut Runtime, _port: Port, _rc: Status) {
		self.stream_close(rt);
	}

	fn deliver(
		&mut self,
		rt: &mut Runtime,
		_port: Port,
		iob: IoBuffer,
		_meta: &Metadata,
	) -> Result<()> {
		self.tx_queue.extend(iob.as_slice());
		// The sender still holds our cell: transmit from the scheduler
		let conn = rt.tcp.conns.get(&self.local.port()).cloned();
		if let Some(conn) = conn {
			rt.schedule(&conn);
		}
		Ok(())
	}

	fn window(&self, _port: Port) -> usize {
		if self.state.can_send_data() {
			(self.snd_win as usize).saturating_sub(self.tx_queue.len())
		} else {
			0
		}
	}

	fn step(&mut self, rt: &mut Runtime) {
		self.senddata(rt, false);
	}

	fn timer_expired(&mut self, rt: &mut Runtime, _timer: TimerId) {
		let graceful = self.state.closed_gracefully();
		let fail = self.timer.expired();
		debug!(
			"TCP {} timer {} in {}",
			self.local.port(),
			if fail { "expired" } else { "fired" },
			self.state.name()
		);
		if fail || graceful {
			self.abort(rt, true, Err(Errno::ETIMEDOUT));
		} else {
			// Retransmit
			self.senddata(rt, false);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::net::capture::{CaptureNet, Frame, FrameLog};
	use std::net::Ipv4Addr;

	const PEER: SockAddr = SockAddr::V4 {
		addr: Ipv4Addr::new(10, 0, 0, 2),
		port: 80,
	};

	#[derive(Default)]
	struct App {
		received: Vec<u8>,
		closed: Option<Status>,
		window_kicks: u32,
	}

	impl Object for App {
		fn close(&mut self, _rt: &mut Runtime, _port: Port, rc: Status) {
			self.closed = Some(rc);
		}

		fn deliver(
			&mut self,
			_rt: &mut Runtime,
			_port: Port,
			iob: IoBuffer,
			_meta: &Metadata,
		) -> Result<()> {
			self.received.extend_from_slice(iob.as_slice());
			Ok(())
		}

		fn window(&self, _port: Port) -> usize {
			usize::MAX
		}

		fn window_changed(&mut self, _rt: &mut Runtime, _port: Port) {
			self.window_kicks += 1;
		}
	}

	struct Harness {
		rt: Runtime,
		frames: FrameLog,
		app: Rc<RefCell<App>>,
		intf: IntfId,
	}

	fn harness() -> Harness {
		let mut rt = Runtime::new();
		let (net, frames) = CaptureNet::new();
		rt.set_net_backend(net);
		let app = Rc::new(RefCell::new(App::default()));
		let intf = xfer::create(&mut rt, &app, 0);
		open(&mut rt, intf, PEER).unwrap();
		Harness { rt, frames, app, intf }
	}

	fn last_frame(frames: &FrameLog) -> Frame {
		frames.borrow().last().cloned().expect("a transmitted frame")
	}

	fn parse(frame: &Frame) -> (TcpHeader, Vec<u8>) {
		let mut iob = IoBuffer::from_slice(&frame.payload);
		let hdr = parse_segment(&mut iob).unwrap();
		(hdr, iob.into_vec())
	}

	fn inject(h: &mut Harness, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) {
		let local = last_frame(&h.frames).local;
		let iob = build_segment(PEER, local, seq, ack, flags, 4096, payload);
		let _ = rx(&mut h.rt, iob, PEER, local);
	}

	/// Complete the three-way handshake, returning the client ISN.
	fn establish(h: &mut Harness) -> u32 {
		let (syn, _) = parse(&last_frame(&h.frames));
		assert!(syn.flags.contains(TcpFlags::SYN));
		assert!(!syn.flags.contains(TcpFlags::ACK));
		inject(
			h,
			0x1000,
			syn.seq.wrapping_add(1),
			TcpFlags::SYN | TcpFlags::ACK,
			&[],
		);
		let (ack, _) = parse(&last_frame(&h.frames));
		assert!(ack.flags.contains(TcpFlags::ACK));
		assert_eq!(ack.ack, 0x1001);
		syn.seq
	}

	#[test]
	fn handshake_carries_mss_option() {
		let h = harness();
		let frame = last_frame(&h.frames);
		// Option bytes follow the fixed header
		assert_eq!(frame.payload[12] >> 4, 6); // 24-byte header
		assert_eq!(frame.payload[20], 2);
		assert_eq!(frame.payload[21], 4);
		assert_eq!(BigEndian::read_u16(&frame.payload[22..24]), TCP_MSS as u16);
	}

	#[test]
	fn data_transfer_and_delivery_order() {
		let mut h = harness();
		let isn = establish(&mut h);
		assert!(h.app.borrow().window_kicks >= 1);

		inject(&mut h, 0x1001, isn.wrapping_add(1), TcpFlags::ACK, b"hello ");
		inject(&mut h, 0x1007, isn.wrapping_add(1), TcpFlags::ACK, b"world");
		assert_eq!(h.app.borrow().received, b"hello world");

		// Each data segment got an immediate ACK
		let (ack, _) = parse(&last_frame(&h.frames));
		assert_eq!(ack.ack, 0x100c);
	}

	#[test]
	fn duplicate_data_is_not_redelivered() {
		let mut h = harness();
		let isn = establish(&mut h);
		inject(&mut h, 0x1001, isn.wrapping_add(1), TcpFlags::ACK, b"abc");
		inject(&mut h, 0x1001, isn.wrapping_add(1), TcpFlags::ACK, b"abcdef");
		assert_eq!(h.app.borrow().received, b"abcdef");
	}

	#[test]
	fn app_data_is_segmented_and_retransmitted() {
		let mut h = harness();
		establish(&mut h);
		xfer::deliver_raw(&mut h.rt, h.intf, b"GET / HTTP/1.1\r\n\r\n").unwrap();
		h.rt.poll();
		let (hdr, payload) = parse(&last_frame(&h.frames));
		assert_eq!(payload, b"GET / HTTP/1.1\r\n\r\n");
		assert!(hdr.flags.contains(TcpFlags::ACK));

		// No ACK: the retransmission timer must resend the same bytes
		let before = h.frames.borrow().len();
		h.rt.idle_advance();
		h.rt.poll();
		assert!(h.frames.borrow().len() > before);
		let (_, again) = parse(&last_frame(&h.frames));
		assert_eq!(again, b"GET / HTTP/1.1\r\n\r\n");
	}

	#[test]
	fn fin_closes_stream_and_enters_time_wait() {
		let mut h = harness();
		let isn = establish(&mut h);
		inject(
			&mut h,
			0x1001,
			isn.wrapping_add(1),
			TcpFlags::ACK | TcpFlags::FIN,
			&[],
		);
		assert_eq!(h.app.borrow().closed, Some(Ok(())));

		// Our FIN went out; ACK it to reach TIME_WAIT
		let (fin, _) = parse(&last_frame(&h.frames));
		assert!(fin.flags.contains(TcpFlags::FIN));
		assert_eq!(fin.ack, 0x1002);
		inject(&mut h, 0x1002, fin.seq.wrapping_add(1), TcpFlags::ACK, &[]);

		// TCB lingers for 2 MSL, then is freed
		assert_eq!(h.rt.tcp.len(), 1);
		h.rt.idle_advance();
		h.rt.poll();
		assert_eq!(h.rt.tcp.len(), 0);
	}

	#[test]
	fn in_window_rst_aborts_without_reply() {
		let mut h = harness();
		establish(&mut h);
		let before = h.frames.borrow().len();
		inject(&mut h, 0x1001, 0, TcpFlags::RST, &[]);
		assert_eq!(h.app.borrow().closed, Some(Err(Errno::ECONNRESET)));
		assert_eq!(h.frames.borrow().len(), before);
		assert_eq!(h.rt.tcp.len(), 0);
	}

	#[test]
	fn out_of_window_rst_is_ignored() {
		let mut h = harness();
		establish(&mut h);
		inject(&mut h, 0x0500, 0, TcpFlags::RST, &[]);
		assert!(h.app.borrow().closed.is_none());
		assert_eq!(h.rt.tcp.len(), 1);
	}

	#[test]
	fn stray_segment_draws_single_rst() {
		let mut rt = Runtime::new();
		let (net, frames) = CaptureNet::new();
		rt.set_net_backend(net);
		let local = SockAddr::v4(Ipv4Addr::UNSPECIFIED, 2000);
		let iob = build_segment(PEER, local, 0x99, 0x77, TcpFlags::SYN, 100, &[]);
		assert_eq!(rx(&mut rt, iob, PEER, local).unwrap_err(), Errno::ENOTCONN);
		let frame = frames.borrow().last().cloned().unwrap();
		let mut iob = IoBuffer::from_slice(&frame.payload);
		let hdr = parse_segment(&mut iob).unwrap();
		assert!(hdr.flags.contains(TcpFlags::RST));
		assert_eq!(hdr.seq, 0x77);
		assert_eq!(hdr.ack, 0x9a); // their SEQ plus the SYN
	}

	#[test]
	fn unreachable_network_aborts_immediately() {
		let mut rt = Runtime::new();
		rt.set_net_backend(Box::new(crate::net::capture::UnreachableNet(
			Errno::ENETUNREACH,
		)));
		let app = Rc::new(RefCell::new(App::default()));
		let intf = xfer::create(&mut rt, &app, 0);
		open(&mut rt, intf, PEER).unwrap();
		assert_eq!(app.borrow().closed, Some(Err(Errno::ENETUNREACH)));
		assert_eq!(rt.tcp.len(), 0);
	}

	#[test]
	fn explicit_port_collision() {
		let mut h = harness();
		let port = last_frame(&h.frames).local.port();
		let app = Rc::new(RefCell::new(App::default()));
		let intf = xfer::create(&mut h.rt, &app, 0);
		assert_eq!(
			open_bound(&mut h.rt, intf, PEER, port).unwrap_err(),
			Errno::EADDRINUSE
		);
		// Auto-allocation skips the taken port
		open_bound(&mut h.rt, intf, PEER, 0).unwrap();
		assert_eq!(h.rt.tcp.len(), 2);
	}

	#[test]
	fn retry_ladder_gives_up() {
		let mut h = harness();
		// Never answer the SYN; every expiry retransmits until the
		// budget runs out and the connection dies with a timeout.
		for _ in 0..(TCP_MAX_RETRIES + 2) {
			if h.rt.tcp.len() == 0 {
				break;
			}
			h.rt.idle_advance();
			h.rt.poll();
		}
		assert_eq!(h.rt.tcp.len(), 0);
		assert_eq!(h.app.borrow().closed, Some(Err(Errno::ETIMEDOUT)));
	}

	#[test]
	fn graceful_close_from_application() {
		let mut h = harness();
		let isn = establish(&mut h);
		// Application shuts its side down: a FIN goes out
		xfer::shutdown(&mut h.rt, h.intf, Ok(()));
		let (fin, _) = parse(&last_frame(&h.frames));
		assert!(fin.flags.contains(TcpFlags::FIN));
		assert_eq!(fin.seq, isn.wrapping_add(1));
	}
}
