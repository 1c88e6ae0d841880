//! The block-device bridge.
//!
//! Adapts any pipeline endpoint that answers block commands into the
//! shape the firmware expects: a media descriptor plus synchronous
//! read/write/reset entry points. Each call lazily (re)opens the
//! backing URI, dispatches a single command, and pumps the event loop
//! until the command interface closes or the watchdog fires.
//!
//! CD-ROM images are auto-detected: if the native block size divides
//! 2048 and the ISO primary volume descriptor is present at sector 16,
//! the device is presented with 2048-byte logical blocks and requests
//! are rescaled onto the native size.

use std::cell::RefCell;
use std::rc::Rc;

use crate::efi::{efirc, BlockIoMedia, Handle, Status, BLOCK_IO_REVISION3};
use crate::errno::{Errno, Result, Status as CmdStatus};
use crate::runtime::{Runtime, TimerId, MICROS_PER_SEC};
use crate::uri::Uri;
use crate::xfer::{self, BlockCapacity, DataBuffer, IntfId, Object, Port};

/// Watchdog for a single block command.
pub const EFI_BLOCK_TIMEOUT: u64 = 15 * MICROS_PER_SEC;

const ISO9660_BLKSIZE: u32 = 2048;
const ISO9660_PRIMARY_LBA: u64 = 16;
/// Primary volume descriptor: type, "CD001", version.
const ISO9660_MAGIC: [u8; 7] = [0x01, b'C', b'D', b'0', b'0', b'1', 0x01];

const INTF: Port = 0;
const COMMAND: Port = 1;

pub(crate) struct EfiBlock {
	/// Control interface towards the backing transfer.
	intf: IntfId,
	/// Per-command data interface, restarted between commands.
	command: IntfId,
	pub uri: Uri,
	pub drive: u32,
	pub media: BlockIoMedia,
	/// Published protocol revision.
	pub revision: u64,
	pub path: Vec<u8>,
	pub handle: Option<Handle>,
	capacity: BlockCapacity,
	/// log2 of the CD-ROM upscaling factor (0 for plain devices).
	blksize_shift: u32,
	timer: TimerId,
	/// Device state: `Err(EINPROGRESS)` while (re)opening.
	block_rc: CmdStatus,
	command_rc: CmdStatus,
}

impl EfiBlock {
	fn restart_inner(&mut self, rt: &mut Runtime, rc: CmdStatus) {
		// Break potential notification loops before tearing down
		xfer::nullify(rt, self.command);
		xfer::restart(rt, self.intf, rc);
		self.cmd_finish(rt, rc);
		self.block_rc = rc;
	}

	/// Complete the outstanding command, stopping the watchdog.
	fn cmd_finish(&mut self, rt: &mut Runtime, rc: CmdStatus) {
		rt.timer_disarm(self.timer);
		xfer::restart(rt, self.command, rc);
		self.command_rc = rc;
	}
}

impl Object for EfiBlock {
	fn close(&mut self, rt: &mut Runtime, port: Port, rc: CmdStatus) {
		match port {
			COMMAND => self.cmd_finish(rt, rc),
			_ => {
				// The backing device went away; any close is an error
				// from where we stand
				let rc = if rc.is_ok() { Err(Errno::ENOTCONN) } else { rc };
				debug!("EFIBLK {:#04x} went away: {rc:?}", self.drive);
				self.restart_inner(rt, rc);
			}
		}
	}

	fn window(&self, _port: Port) -> usize {
		// Never accept stream data: this keeps dual block/stream
		// endpoints from delivering bytes at us
		0
	}

	fn block_capacity(&mut self, _rt: &mut Runtime, _port: Port, capacity: BlockCapacity) {
		self.capacity = capacity;
	}

	fn redirect(&mut self, _rt: &mut Runtime, _port: Port, location: &Uri) -> Result<()> {
		// Follow the transfer to its new home on the next (re)open;
		// the consumer above us never notices.
		debug!("EFIBLK {:#04x} following redirect to {location}", self.drive);
		self.uri = location.clone();
		self.block_rc = Err(Errno::ECONNRESET);
		Ok(())
	}

	fn timer_expired(&mut self, rt: &mut Runtime, _timer: TimerId) {
		// Only record the timeout here: cancelling the command walks
		// back into this object, so the command pump does it once this
		// borrow is released.
		rt.timer_disarm(self.timer);
		self.command_rc = Err(Errno::ETIMEDOUT);
	}
}

/// Create a bridge for `uri`, not yet opened.
pub(crate) fn new(rt: &mut Runtime, uri: &Uri, drive: u32, path: Vec<u8>) -> Rc<RefCell<EfiBlock>> {
	let block = Rc::new(RefCell::new(EfiBlock {
		intf: IntfId::NULL,
		command: IntfId::NULL,
		uri: uri.clone(),
		drive,
		media: BlockIoMedia {
			media_id: drive,
			media_present: true,
			logical_blocks_per_physical_block: 1,
			..Default::default()
		},
		revision: BLOCK_IO_REVISION3,
		path,
		handle: None,
		capacity: BlockCapacity::default(),
		blksize_shift: 0,
		timer: TimerId::NULL,
		block_rc: Err(Errno::EINPROGRESS),
		command_rc: Ok(()),
	}));
	let intf = xfer::create(rt, &block, INTF);
	let command = xfer::create(rt, &block, COMMAND);
	let timer = rt.timer_create(&block);
	{
		let mut dev = block.borrow_mut();
		dev.intf = intf;
		dev.command = command;
		dev.timer = timer;
	}
	block
}

/// Tear down the bridge's interfaces.
pub(crate) fn unhook(rt: &mut Runtime, block: &Rc<RefCell<EfiBlock>>, rc: CmdStatus) {
	let intf = {
		let mut dev = block.borrow_mut();
		dev.restart_inner(rt, rc);
		dev.intf
	};
	xfer::shutdown(rt, intf, rc);
	let timer = block.borrow().timer;
	rt.timer_free(timer);
}

/// (Re)open the backing URI, pumping until the device is usable.
pub(crate) fn reopen(rt: &mut Runtime, block: &Rc<RefCell<EfiBlock>>) -> Result<()> {
	let (intf, uri) = {
		let mut dev = block.borrow_mut();
		dev.restart_inner(rt, Err(Errno::ECONNRESET));
		dev.block_rc = Err(Errno::EINPROGRESS);
		(dev.intf, dev.uri.clone())
	};

	if let Err(rc) = rt.open_uri(intf, &uri) {
		debug!("EFIBLK could not (re)open URI: {rc}");
		block.borrow_mut().block_rc = Err(rc);
		return Err(rc);
	}

	loop {
		if xfer::window(rt, intf) != 0 {
			block.borrow_mut().block_rc = Ok(());
			return Ok(());
		}
		match block.borrow().block_rc {
			Err(Errno::EINPROGRESS) => {}
			rc => {
				debug!("EFIBLK never became available: {rc:?}");
				return rc.and(Err(Errno::ENOTCONN));
			}
		}
		rt.poll();
		if xfer::window(rt, intf) == 0
			&& block.borrow().block_rc == Err(Errno::EINPROGRESS)
			&& !rt.idle_advance()
		{
			block.borrow_mut().block_rc = Err(Errno::ENOTCONN);
			return Err(Errno::ENOTCONN);
		}
	}
}

/// Dispatch one block command and wait for its completion.
fn command(
	rt: &mut Runtime,
	block: &Rc<RefCell<EfiBlock>>,
	op: impl FnOnce(&mut Runtime, IntfId, IntfId) -> Result<()>,
) -> CmdStatus {
	// Reopen the device if it previously failed
	if block.borrow().block_rc.is_err() {
		reopen(rt, block)?;
	}

	let (intf, timer, old_cmd) = {
		let mut dev = block.borrow_mut();
		dev.command_rc = Err(Errno::EINPROGRESS);
		(dev.intf, dev.timer, dev.command)
	};
	// Each command runs over a fresh interface; whatever happened to the
	// previous one (including a teardown nullification) cannot leak in
	xfer::shutdown(rt, old_cmd, Ok(()));
	let cmd = xfer::create(rt, block, COMMAND);
	block.borrow_mut().command = cmd;
	rt.timer_arm(timer, EFI_BLOCK_TIMEOUT);

	if let Err(rc) = op(rt, intf, cmd) {
		debug!("EFIBLK could not initiate command: {rc}");
		rt.timer_disarm(timer);
		block.borrow_mut().command_rc = Err(rc);
		return Err(rc);
	}

	// Pump until the command interface closes or the watchdog fires
	while block.borrow().command_rc == Err(Errno::EINPROGRESS) {
		rt.poll();
		if block.borrow().command_rc == Err(Errno::EINPROGRESS) && !rt.idle_advance() {
			rt.timer_disarm(timer);
			block.borrow_mut().command_rc = Err(Errno::ETIMEDOUT);
			break;
		}
	}

	// Cancel anything still attached to the command interface; after a
	// normal completion this is a no-op, after a timeout it propagates
	// the abort into the stalled protocol stage.
	let rc = block.borrow().command_rc;
	xfer::restart(rt, cmd, rc);
	rc
}

/// Issue a read or write against the backing device, rescaling for any
/// CD-ROM shift.
fn command_rw(
	rt: &mut Runtime,
	block: &Rc<RefCell<EfiBlock>>,
	write: bool,
	lba: u64,
	buffer: DataBuffer,
	len: usize,
) -> CmdStatus {
	let (native_lba, count) = {
		let dev = block.borrow();
		if dev.capacity.blksize == 0 {
			debug!("EFIBLK {:#04x} has zero block size", dev.drive);
			return Err(Errno::EINVAL);
		}
		let count = len / dev.capacity.blksize as usize;
		if count * dev.capacity.blksize as usize != len {
			debug!("EFIBLK {:#04x} invalid length {len:#x}", dev.drive);
			return Err(Errno::EINVAL);
		}
		(lba << dev.blksize_shift, count as u32)
	};

	command(rt, block, |rt, intf, cmd| {
		if write {
			xfer::block_write(rt, intf, cmd, native_lba, count, buffer)
		} else {
			xfer::block_read(rt, intf, cmd, native_lba, count, buffer)
		}
	})
}

/// Probe capacity and detect ISO-9660 media.
pub(crate) fn probe(rt: &mut Runtime, block: &Rc<RefCell<EfiBlock>>) -> Result<()> {
	command(rt, block, |rt, intf, cmd| {
		xfer::block_read_capacity(rt, intf, cmd)
	})?;
	block.borrow_mut().blksize_shift = 0;

	// A device whose blocks divide the ISO sector size may be a CD image
	let (blksize, blocks) = {
		let dev = block.borrow();
		(dev.capacity.blksize, dev.capacity.blocks)
	};
	if blksize == 0 {
		return Err(Errno::EINVAL);
	}
	let mut shift = 0;
	let mut scaled = blksize;
	while scaled < ISO9660_BLKSIZE {
		scaled <<= 1;
		shift += 1;
	}
	if scaled == ISO9660_BLKSIZE {
		let scratch: DataBuffer = Rc::new(RefCell::new(vec![0; ISO9660_BLKSIZE as usize]));
		let rc = command_rw(
			rt,
			block,
			false,
			ISO9660_PRIMARY_LBA << shift,
			scratch.clone(),
			ISO9660_BLKSIZE as usize,
		);
		match rc {
			Ok(()) => {
				let scratch = scratch.borrow();
				if scratch.len() >= ISO9660_MAGIC.len()
					&& scratch[..ISO9660_MAGIC.len()] == ISO9660_MAGIC
				{
					debug!(
						"EFIBLK {:#04x} contains an ISO9660 filesystem; treating as CD-ROM",
						block.borrow().drive
					);
					block.borrow_mut().blksize_shift = shift;
				}
			}
			Err(rc) => {
				debug!("EFIBLK could not read ISO9660 primary volume descriptor: {rc}");
				return Err(rc);
			}
		}
	}

	// Fill in the media descriptor
	let mut dev = block.borrow_mut();
	let shift = dev.blksize_shift;
	dev.media.block_size = dev.capacity.blksize << shift;
	dev.media.last_block = (dev.capacity.blocks >> shift).saturating_sub(1);
	Ok(())
}

// ----- firmware-facing entry points ---------------------------------

/// `Reset`: reopen the backing device.
pub fn reset(rt: &mut Runtime, block: &Rc<RefCell<EfiBlock>>, _extended: bool) -> Status {
	debug!("EFIBLK {:#04x} reset", block.borrow().drive);
	match reopen(rt, block) {
		Ok(()) => Status::SUCCESS,
		Err(rc) => efirc(Err(rc)),
	}
}

/// `ReadBlocks`.
pub fn read_blocks(
	rt: &mut Runtime,
	block: &Rc<RefCell<EfiBlock>>,
	_media_id: u32,
	lba: u64,
	data: &mut [u8],
) -> Status {
	trace!(
		"EFIBLK {:#04x} read LBA {lba:#x} +{:#x}",
		block.borrow().drive,
		data.len()
	);
	let buffer: DataBuffer = Rc::new(RefCell::new(vec![0; data.len()]));
	let rc = command_rw(rt, block, false, lba, buffer.clone(), data.len());
	if rc.is_ok() {
		data.copy_from_slice(&buffer.borrow());
	}
	efirc(rc)
}

/// `WriteBlocks`.
pub fn write_blocks(
	rt: &mut Runtime,
	block: &Rc<RefCell<EfiBlock>>,
	_media_id: u32,
	lba: u64,
	data: &[u8],
) -> Status {
	trace!(
		"EFIBLK {:#04x} write LBA {lba:#x} +{:#x}",
		block.borrow().drive,
		data.len()
	);
	let buffer: DataBuffer = Rc::new(RefCell::new(data.to_vec()));
	efirc(command_rw(rt, block, true, lba, buffer, data.len()))
}

/// `FlushBlocks`: nothing is cached.
pub fn flush_blocks(_rt: &mut Runtime, block: &Rc<RefCell<EfiBlock>>) -> Status {
	trace!("EFIBLK {:#04x} flush", block.borrow().drive);
	Status::SUCCESS
}

// ----- by-drive entry points, as bound into an installed protocol ---

fn lookup(rt: &Runtime, drive: u32) -> Option<Rc<RefCell<EfiBlock>>> {
	rt.efi
		.devices
		.iter()
		.find(|device| device.borrow().drive == drive)
		.cloned()
}

/// Media descriptor of a hooked drive.
pub fn media(rt: &Runtime, drive: u32) -> Option<BlockIoMedia> {
	lookup(rt, drive).map(|block| block.borrow().media)
}

pub fn io_reset(rt: &mut Runtime, drive: u32, extended: bool) -> Status {
	match lookup(rt, drive) {
		Some(block) => reset(rt, &block, extended),
		None => Status::NOT_FOUND,
	}
}

pub fn io_read_blocks(rt: &mut Runtime, drive: u32, media_id: u32, lba: u64, data: &mut [u8]) -> Status {
	match lookup(rt, drive) {
		Some(block) => read_blocks(rt, &block, media_id, lba, data),
		None => Status::NOT_FOUND,
	}
}

pub fn io_write_blocks(rt: &mut Runtime, drive: u32, media_id: u32, lba: u64, data: &[u8]) -> Status {
	match lookup(rt, drive) {
		Some(block) => write_blocks(rt, &block, media_id, lba, data),
		None => Status::NOT_FOUND,
	}
}

pub fn io_flush_blocks(rt: &mut Runtime, drive: u32) -> Status {
	match lookup(rt, drive) {
		Some(block) => flush_blocks(rt, &block),
		None => Status::NOT_FOUND,
	}
}
