//! Network Block Device client sessions.
//!
//! Speaks the newstyle negotiation (either `NBD_OPT_EXPORT_NAME` or, on
//! request, `NBD_OPT_GO`) followed by the transmission phase with a
//! single outstanding command. The 64-bit command cookie round-trips
//! verbatim and is the identity check against spurious replies.

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use num_enum::IntoPrimitive;

use crate::errno::{Errno, Result, Status};
use crate::iobuf::IoBuffer;
use crate::runtime::{Runtime, UriOpener};
use crate::socket::{self, SocketKind};
use crate::uri::Uri;
use crate::xfer::{self, BlockCapacity, DataBuffer, IntfId, Metadata, Object, Port};

pub const NBD_BLOCK_SIZE: usize = 512;

const DEFAULT_NBD_PORT: u16 = 10809;

/// "NBDMAGIC"
const NBD_INIT_PASSWD: u64 = 0x4e42_444d_4147_4943;
/// "IHAVEOPT"
const NBD_OPT_REQ_MAGIC: u64 = 0x4948_4156_454f_5054;
const NBD_OPT_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

bitflags! {
	/// Server handshake flags.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	struct HandshakeFlags: u16 {
		const FIXED_NEWSTYLE = 0x0001;
		const NO_ZEROES = 0x0002;
	}
}

bitflags! {
	/// Client reply to the handshake flags.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct ClientFlags: u32 {
		const FIXED_NEWSTYLE = 0x0001;
		const NO_ZEROES = 0x0002;
	}
}

bitflags! {
	/// Per-export transmission flags.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct TransFlags: u16 {
		const HAS_FLAGS = 0x0001;
		const READ_ONLY = 0x0002;
	}
}

const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_OPT_GO: u32 = 7;

const NBD_REP_ACK: u32 = 1;
const NBD_REP_INFO: u32 = 3;
const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
const NBD_REP_ERR_UNSUP: u32 = NBD_REP_FLAG_ERROR | 1;
const NBD_REP_ERR_UNKNOWN: u32 = NBD_REP_FLAG_ERROR | 6;

const NBD_INFO_EXPORT: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u16)]
enum NbdCmd {
	Read = 0,
	Write = 1,
}

/// Fixed receive sizes for each negotiation structure.
const NEG_INIT_LEN: usize = 18;
const NEG_EXP_NAME_LEN: usize = 10;
const NEG_OPT_REPLY_LEN: usize = 20;
const TRANS_REPLY_LEN: usize = 16;
const REP_INFO_EXPORT_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
	NegInit,
	NegExpName,
	NegOptInfo,
	NegRepInfo,
	TransRepCmd,
	TransData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
	Idle,
	NegOpt,
	CmdBrc,
	CmdHeader,
	CmdData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdKind {
	Read,
	Write,
	ReadCapacity,
}

/// One outstanding block command.
struct NbdCommand {
	/// Interface plugged onto the caller's data interface.
	block: IntfId,
	kind: CmdKind,
	lba: u64,
	count: u32,
	buffer: DataBuffer,
	data_len: usize,
	data_offset: usize,
	/// Round-trips verbatim through the server.
	cookie: u64,
}

const BLOCK: Port = 0;
const SOCKET: Port = 1;
const CMD: Port = 2;

pub(crate) struct NbdSession {
	block: IntfId,
	socket: IntfId,
	uri: Uri,
	export_name: String,
	use_opt_go: bool,
	handshake_flags: HandshakeFlags,
	trans_flags: TransFlags,
	export_size: u64,
	rx_state: RxState,
	/// Partial negotiation/reply structure being accumulated.
	rx_buf: Vec<u8>,
	/// Length of the pending NBD_REP_INFO record.
	reply_info_length: usize,
	/// Padding to skip in the handshake stream.
	discard_len: usize,
	tx_state: TxState,
	command: Option<NbdCommand>,
	next_cookie: u64,
}

pub const OPENER: UriOpener = UriOpener {
	scheme: "nbd",
	open: open,
};

/// Open an NBD session and plug its block interface onto `parent`.
pub fn open(rt: &mut Runtime, parent: IntfId, uri: &Uri) -> Result<()> {
	let Some(host) = uri.host.clone() else {
		return Err(Errno::EINVAL);
	};
	let Some(path) = uri.path.clone() else {
		return Err(Errno::EINVAL);
	};
	let export_name = match path.find('/') {
		Some(pos) => path[pos + 1..].to_string(),
		None => String::new(),
	};
	let use_opt_go = uri
		.equery
		.as_deref()
		.is_some_and(|query| query.contains("use-opt-go"));

	let nbd = Rc::new(RefCell::new(NbdSession {
		block: IntfId::NULL,
		socket: IntfId::NULL,
		uri: uri.clone(),
		export_name,
		use_opt_go,
		handshake_flags: HandshakeFlags::default(),
		trans_flags: TransFlags::default(),
		export_size: 0,
		rx_state: RxState::NegInit,
		rx_buf: Vec::new(),
		reply_info_length: 0,
		discard_len: 0,
		tx_state: TxState::Idle,
		command: None,
		next_cookie: 0x6e62_6400_0000_0001,
	}));
	let block = xfer::create(rt, &nbd, BLOCK);
	let sock = xfer::create(rt, &nbd, SOCKET);
	{
		let mut session = nbd.borrow_mut();
		session.block = block;
		session.socket = sock;
	}
	debug!("NBD open {} ({})", host, nbd.borrow().export_name);

	let port = uri.port_or(DEFAULT_NBD_PORT);
	if let Err(rc) = socket::open_named_socket(rt, sock, SocketKind::Stream, &host, port) {
		nbd.borrow_mut().shutdown(rt, Err(rc));
		return Err(rc);
	}

	xfer::plug_plug(rt, block, parent);
	Ok(())
}

impl NbdSession {
	/// Tear the session down.
	///
	/// A TCP graceful close is still an error from this layer's point
	/// of view: the export went away mid-session.
	fn shutdown(&mut self, rt: &mut Runtime, rc: Status) {
		let rc = if rc.is_ok() {
			Err(Errno::ECONNRESET)
		} else {
			rc
		};
		debug!("NBD closed: {rc:?}");
		self.cmd_close(rt, rc);
		xfer::shutdown(rt, self.block, rc);
		xfer::shutdown(rt, self.socket, rc);
	}

	/// Complete and detach the outstanding command, if any.
	fn cmd_close(&mut self, rt: &mut Runtime, rc: Status) {
		if let Some(cmd) = self.command.take() {
			if rc.is_err() {
				debug!("NBD cmd closed: {rc:?}");
			}
			xfer::shutdown(rt, cmd.block, rc);
		}
	}

	fn start_tx(&mut self, rt: &mut Runtime, state: TxState) {
		debug_assert_eq!(self.tx_state, TxState::Idle);
		self.tx_state = state;
		xfer::schedule_owner(rt, self.socket);
	}

	fn neg_done(&mut self, rt: &mut Runtime) {
		debug!(
			"NBD negotiation done; export size {} MiB, flags {:?}",
			self.export_size / 1_048_576,
			self.trans_flags
		);
		self.rx_state = RxState::TransRepCmd;
		xfer::window_changed(rt, self.block);
	}

	// ----- TX engine ------------------------------------------------

	fn tx_run(&mut self, rt: &mut Runtime) {
		loop {
			match self.tx_state {
				TxState::Idle => return,
				TxState::CmdBrc => {
					self.tx_cmd_brc(rt);
					continue;
				}
				TxState::NegOpt | TxState::CmdHeader | TxState::CmdData => {}
			}

			if xfer::window(rt, self.socket) == 0 {
				// Wait for the window to reopen
				return;
			}

			let rc = match self.tx_state {
				TxState::NegOpt => self.tx_neg_opt(rt),
				TxState::CmdHeader => self.tx_cmd_header(rt),
				TxState::CmdData => self.tx_cmd_data(rt),
				TxState::Idle | TxState::CmdBrc => unreachable!(),
			};
			if let Err(rc) = rc {
				debug!("NBD could not transmit: {rc}");
				self.shutdown(rt, Err(rc));
				return;
			}
		}
	}

	/// Transmit `NBD_OPT_EXPORT_NAME` or `NBD_OPT_GO`.
	fn tx_neg_opt(&mut self, rt: &mut Runtime) -> Result<()> {
		let mut client_flags = ClientFlags::FIXED_NEWSTYLE;
		if self.handshake_flags.contains(HandshakeFlags::NO_ZEROES) {
			client_flags |= ClientFlags::NO_ZEROES;
		}

		let name = self.export_name.as_bytes();
		let mut opt = Vec::with_capacity(32 + name.len());
		opt.extend_from_slice(&client_flags.bits().to_be_bytes());
		opt.extend_from_slice(&NBD_OPT_REQ_MAGIC.to_be_bytes());
		if self.use_opt_go {
			// NBD_OPT_GO with an empty information request list
			opt.extend_from_slice(&NBD_OPT_GO.to_be_bytes());
			opt.extend_from_slice(&((4 + name.len() + 2) as u32).to_be_bytes());
			opt.extend_from_slice(&(name.len() as u32).to_be_bytes());
			opt.extend_from_slice(name);
			opt.extend_from_slice(&0u16.to_be_bytes());
		} else {
			opt.extend_from_slice(&NBD_OPT_EXPORT_NAME.to_be_bytes());
			opt.extend_from_slice(&(name.len() as u32).to_be_bytes());
			opt.extend_from_slice(name);
		}

		xfer::deliver_raw(rt, self.socket, &opt)?;
		self.rx_state = if self.use_opt_go {
			RxState::NegOptInfo
		} else {
			RxState::NegExpName
		};
		self.tx_state = TxState::Idle;
		Ok(())
	}

	/// A capacity probe is answered locally from the negotiated size.
	fn tx_cmd_brc(&mut self, rt: &mut Runtime) {
		let Some(cmd) = &self.command else {
			self.tx_state = TxState::Idle;
			return;
		};
		debug_assert_eq!(cmd.kind, CmdKind::ReadCapacity);
		let capacity = BlockCapacity {
			blocks: self.export_size / NBD_BLOCK_SIZE as u64,
			blksize: NBD_BLOCK_SIZE as u32,
			// Keep a single command to a sensible amount of data
			max_count: (16 * 1024 / NBD_BLOCK_SIZE) as u32,
		};
		xfer::block_capacity(rt, cmd.block, capacity);
		self.cmd_close(rt, Ok(()));
		self.tx_state = TxState::Idle;
	}

	fn tx_cmd_header(&mut self, rt: &mut Runtime) -> Result<()> {
		let Some(cmd) = &self.command else {
			return Err(Errno::EINVAL);
		};
		let kind = cmd.kind;
		let cmd_type = match kind {
			CmdKind::Read => NbdCmd::Read,
			CmdKind::Write => NbdCmd::Write,
			CmdKind::ReadCapacity => return Err(Errno::EINVAL),
		};
		let mut request = [0u8; 28];
		BigEndian::write_u32(&mut request[0..4], NBD_REQUEST_MAGIC);
		BigEndian::write_u16(&mut request[4..6], 0); // command flags
		BigEndian::write_u16(&mut request[6..8], cmd_type.into());
		BigEndian::write_u64(&mut request[8..16], cmd.cookie);
		BigEndian::write_u64(&mut request[16..24], cmd.lba * NBD_BLOCK_SIZE as u64);
		BigEndian::write_u32(&mut request[24..28], cmd.count * NBD_BLOCK_SIZE as u32);
		xfer::deliver_raw(rt, self.socket, &request)?;

		self.tx_state = match kind {
			CmdKind::Read => TxState::Idle,
			_ => TxState::CmdData,
		};
		Ok(())
	}

	fn tx_cmd_data(&mut self, rt: &mut Runtime) -> Result<()> {
		let (chunk, done) = {
			let Some(cmd) = &mut self.command else {
				return Err(Errno::EINVAL);
			};
			let buffer = cmd.buffer.borrow();
			// Stream write payloads 512 bytes at a time
			let len = (cmd.data_len - cmd.data_offset).min(NBD_BLOCK_SIZE);
			let chunk = buffer[cmd.data_offset..cmd.data_offset + len].to_vec();
			cmd.data_offset += len;
			(chunk, cmd.data_offset == cmd.data_len)
		};
		xfer::deliver_raw(rt, self.socket, &chunk)?;
		if done {
			self.tx_state = TxState::Idle;
		}
		Ok(())
	}

	// ----- RX engine ------------------------------------------------

	fn rx_neg_init(&mut self, rt: &mut Runtime) -> Result<()> {
		let buf = std::mem::take(&mut self.rx_buf);
		if BigEndian::read_u64(&buf[0..8]) != NBD_INIT_PASSWD
			|| BigEndian::read_u64(&buf[8..16]) != NBD_OPT_REQ_MAGIC
		{
			debug!("NBD initial handshake failed: bad magic");
			return Err(Errno::EPROTO);
		}
		self.handshake_flags = HandshakeFlags::from_bits_truncate(BigEndian::read_u16(&buf[16..18]));
		if !self.handshake_flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
			debug!("NBD initial handshake failed: not fixed-newstyle");
			return Err(Errno::EPROTO);
		}
		self.start_tx(rt, TxState::NegOpt);
		Ok(())
	}

	fn rx_neg_exp_name(&mut self, rt: &mut Runtime) -> Result<()> {
		let buf = std::mem::take(&mut self.rx_buf);
		self.export_size = BigEndian::read_u64(&buf[0..8]);
		self.trans_flags = TransFlags::from_bits_truncate(BigEndian::read_u16(&buf[8..10]));
		if !self.handshake_flags.contains(HandshakeFlags::NO_ZEROES) {
			self.discard_len = 124;
		}
		self.neg_done(rt);
		Ok(())
	}

	fn rx_neg_opt_info(&mut self, rt: &mut Runtime) -> Result<()> {
		let buf = std::mem::take(&mut self.rx_buf);
		if BigEndian::read_u64(&buf[0..8]) != NBD_OPT_REPLY_MAGIC
			|| BigEndian::read_u32(&buf[8..12]) != NBD_OPT_GO
		{
			debug!("NBD option reply invalid");
			return Err(Errno::EPROTO);
		}
		let rep_type = BigEndian::read_u32(&buf[12..16]);
		let rep_len = BigEndian::read_u32(&buf[16..20]) as usize;

		if rep_type & NBD_REP_FLAG_ERROR != 0 {
			return match rep_type {
				NBD_REP_ERR_UNSUP => {
					debug!("NBD option not supported by server");
					Err(Errno::ENOTSUP)
				}
				NBD_REP_ERR_UNKNOWN => {
					debug!("NBD requested export is not available");
					Err(Errno::ENOENT)
				}
				_ => {
					debug!("NBD option failed, reply type {rep_type:#x}");
					Err(Errno::EPROTO)
				}
			};
		}

		match rep_type {
			NBD_REP_ACK => {
				if self.export_size == 0 || rep_len != 0 {
					debug!("NBD premature option acknowledgement");
					return Err(Errno::EPROTO);
				}
				self.neg_done(rt);
			}
			NBD_REP_INFO if rep_len <= REP_INFO_EXPORT_LEN => {
				self.reply_info_length = rep_len;
				self.rx_state = RxState::NegRepInfo;
			}
			_ => {
				trace!("NBD option reply ignored, type {rep_type:#x}");
				self.discard_len = rep_len;
			}
		}
		Ok(())
	}

	fn rx_neg_rep_info(&mut self) -> Result<()> {
		let buf = std::mem::take(&mut self.rx_buf);
		// Only a full-sized NBD_INFO_EXPORT record is interesting
		if buf.len() == REP_INFO_EXPORT_LEN && BigEndian::read_u16(&buf[0..2]) == NBD_INFO_EXPORT {
			self.export_size = BigEndian::read_u64(&buf[2..10]);
			self.trans_flags = TransFlags::from_bits_truncate(BigEndian::read_u16(&buf[10..12]));
		}
		self.rx_state = RxState::NegOptInfo;
		Ok(())
	}

	fn rx_trans_rep_cmd(&mut self, rt: &mut Runtime) -> Result<()> {
		let buf = std::mem::take(&mut self.rx_buf);
		let Some(cmd) = &self.command else {
			debug!("NBD reply with no command outstanding");
			return Err(Errno::EPROTO);
		};
		let kind = cmd.kind;
		if BigEndian::read_u32(&buf[0..4]) != NBD_REPLY_MAGIC
			|| BigEndian::read_u64(&buf[8..16]) != cmd.cookie
		{
			debug!("NBD command reply invalid");
			return Err(Errno::EPROTO);
		}
		let errno = BigEndian::read_u32(&buf[4..8]);
		if errno != 0 {
			debug!("NBD command failed with server error {errno}");
			return Err(Errno::EIO);
		}

		if kind == CmdKind::Read {
			self.rx_state = RxState::TransData;
		} else {
			trace!("NBD command complete");
			self.cmd_close(rt, Ok(()));
		}
		Ok(())
	}

	fn rx_trans_data(&mut self, rt: &mut Runtime, iob: &mut IoBuffer) -> Result<()> {
		let done = {
			let Some(cmd) = &mut self.command else {
				debug!("NBD data with no command outstanding");
				return Err(Errno::EPROTO);
			};
			let len = iob.len();
			if cmd.data_offset + len > cmd.data_len {
				debug!("NBD data overrun");
				return Err(Errno::ERANGE);
			}
			let mut buffer = cmd.buffer.borrow_mut();
			buffer[cmd.data_offset..cmd.data_offset + len].copy_from_slice(iob.as_slice());
			cmd.data_offset += len;
			iob.pull(len)?;
			cmd.data_offset == cmd.data_len
		};
		if done {
			trace!("NBD read complete");
			self.rx_state = RxState::TransRepCmd;
			self.cmd_close(rt, Ok(()));
		}
		Ok(())
	}

	fn socket_deliver(&mut self, rt: &mut Runtime, mut iob: IoBuffer) -> Result<()> {
		while !iob.is_empty() {
			// Skip handshake padding
			if self.discard_len != 0 {
				let skip = self.discard_len.min(iob.len());
				iob.pull(skip)?;
				self.discard_len -= skip;
				continue;
			}

			if self.rx_state == RxState::TransData {
				self.rx_trans_data(rt, &mut iob)?;
				continue;
			}

			let req_len = match self.rx_state {
				RxState::NegInit => NEG_INIT_LEN,
				RxState::NegExpName => NEG_EXP_NAME_LEN,
				RxState::NegOptInfo => NEG_OPT_REPLY_LEN,
				RxState::NegRepInfo => self.reply_info_length,
				RxState::TransRepCmd => TRANS_REPLY_LEN,
				RxState::TransData => unreachable!(),
			};

			let part = (req_len - self.rx_buf.len()).min(iob.len());
			self.rx_buf.extend_from_slice(&iob.as_slice()[..part]);
			iob.pull(part)?;
			if self.rx_buf.len() != req_len {
				return Ok(());
			}

			match self.rx_state {
				RxState::NegInit => self.rx_neg_init(rt)?,
				RxState::NegExpName => self.rx_neg_exp_name(rt)?,
				RxState::NegOptInfo => self.rx_neg_opt_info(rt)?,
				RxState::NegRepInfo => self.rx_neg_rep_info()?,
				RxState::TransRepCmd => self.rx_trans_rep_cmd(rt)?,
				RxState::TransData => unreachable!(),
			}
		}
		Ok(())
	}

	/// Queue a new command; only one may be outstanding.
	fn command(
		&mut self,
		rt: &mut Runtime,
		data: IntfId,
		kind: CmdKind,
		lba: u64,
		count: u32,
		buffer: DataBuffer,
	) -> Result<()> {
		debug_assert!(self.command.is_none());
		debug_assert_eq!(self.rx_state, RxState::TransRepCmd);

		let data_len = match kind {
			CmdKind::ReadCapacity => 0,
			_ => count as usize * NBD_BLOCK_SIZE,
		};
		if kind == CmdKind::Read {
			buffer.borrow_mut().resize(data_len, 0);
		}
		let cookie = self.next_cookie;
		self.next_cookie = self.next_cookie.wrapping_add(1);

		let block = xfer::create_sibling(rt, self.block, CMD);
		xfer::plug_plug(rt, block, data);
		self.command = Some(NbdCommand {
			block,
			kind,
			lba,
			count,
			buffer,
			data_len,
			data_offset: 0,
			cookie,
		});
		Ok(())
	}
}

impl Object for NbdSession {
	fn close(&mut self, rt: &mut Runtime, port: Port, rc: Status) {
		match port {
			CMD => {
				// Caller abandoned the command
				self.command = None;
				let _ = rc;
			}
			_ => self.shutdown(rt, rc),
		}
	}

	fn deliver(
		&mut self,
		rt: &mut Runtime,
		port: Port,
		iob: IoBuffer,
		_meta: &Metadata,
	) -> Result<()> {
		debug_assert_eq!(port, SOCKET);
		trace!("NBD RX {} bytes", iob.len());
		let rc = self.socket_deliver(rt, iob);
		if let Err(rc) = rc {
			debug!("NBD could not process received data: {rc}");
			self.shutdown(rt, Err(rc));
			return Err(rc);
		}
		Ok(())
	}

	fn window(&self, port: Port) -> usize {
		match port {
			SOCKET => usize::MAX,
			// One command at a time, and only after negotiation
			_ => usize::from(
				matches!(self.rx_state, RxState::TransRepCmd | RxState::TransData)
					&& self.command.is_none(),
			),
		}
	}

	fn window_changed(&mut self, rt: &mut Runtime, port: Port) {
		if port == SOCKET && self.tx_state != TxState::Idle {
			self.tx_run(rt);
		}
	}

	fn step(&mut self, rt: &mut Runtime) {
		self.tx_run(rt);
	}

	fn block_read(
		&mut self,
		rt: &mut Runtime,
		_port: Port,
		data: IntfId,
		lba: u64,
		count: u32,
		buffer: DataBuffer,
	) -> Result<()> {
		trace!("NBD read LBA {lba:#x} count {count:#x}");
		self.command(rt, data, CmdKind::Read, lba, count, buffer)?;
		self.start_tx(rt, TxState::CmdHeader);
		Ok(())
	}

	fn block_write(
		&mut self,
		rt: &mut Runtime,
		_port: Port,
		data: IntfId,
		lba: u64,
		count: u32,
		buffer: DataBuffer,
	) -> Result<()> {
		trace!("NBD write LBA {lba:#x} count {count:#x}");
		if self.trans_flags.contains(TransFlags::READ_ONLY) {
			debug!("NBD read-only export");
			return Err(Errno::EROFS);
		}
		self.command(rt, data, CmdKind::Write, lba, count, buffer)?;
		self.start_tx(rt, TxState::CmdHeader);
		Ok(())
	}

	fn block_read_capacity(&mut self, rt: &mut Runtime, _port: Port, data: IntfId) -> Result<()> {
		self.command(
			rt,
			data,
			CmdKind::ReadCapacity,
			0,
			0,
			Rc::new(RefCell::new(Vec::new())),
		)?;
		self.start_tx(rt, TxState::CmdBrc);
		Ok(())
	}
}
