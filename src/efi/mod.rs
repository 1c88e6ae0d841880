//! UEFI-facing surfaces: the block-device bridge and SAN boot.
//!
//! The firmware itself is reached through the [`Firmware`] trait, so
//! the bridge logic runs (and is tested) against a fake as readily as
//! against real boot services. The ABI-shaped types carried here are
//! limited to what the bridge actually publishes.

pub mod block;
pub mod path;
pub mod san;

use std::cell::RefCell;
use std::rc::Rc;

use crate::errno::{Errno, Result};
use crate::runtime::Runtime;

/// An opaque firmware handle.
pub type Handle = u64;

/// EFI status codes, high-bit-set on error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u64);

const ERROR_BIT: u64 = 1 << 63;

impl Status {
	pub const SUCCESS: Status = Status(0);
	pub const LOAD_ERROR: Status = Status(ERROR_BIT | 1);
	pub const INVALID_PARAMETER: Status = Status(ERROR_BIT | 2);
	pub const UNSUPPORTED: Status = Status(ERROR_BIT | 3);
	pub const NOT_READY: Status = Status(ERROR_BIT | 6);
	pub const DEVICE_ERROR: Status = Status(ERROR_BIT | 7);
	pub const WRITE_PROTECTED: Status = Status(ERROR_BIT | 8);
	pub const OUT_OF_RESOURCES: Status = Status(ERROR_BIT | 9);
	pub const NOT_FOUND: Status = Status(ERROR_BIT | 14);
	pub const ACCESS_DENIED: Status = Status(ERROR_BIT | 15);
	pub const TIMEOUT: Status = Status(ERROR_BIT | 18);
	pub const ABORTED: Status = Status(ERROR_BIT | 21);

	pub fn is_error(self) -> bool {
		self.0 & ERROR_BIT != 0
	}
}

/// Map an internal completion status onto an EFI status code.
pub fn efirc(rc: crate::errno::Status) -> Status {
	match rc {
		Ok(()) => Status::SUCCESS,
		Err(Errno::ETIMEDOUT) => Status::TIMEOUT,
		Err(Errno::EACCES | Errno::EPERM) => Status::ACCESS_DENIED,
		Err(Errno::ENOENT) => Status::NOT_FOUND,
		Err(Errno::ENOTSUP) => Status::UNSUPPORTED,
		Err(Errno::EROFS) => Status::WRITE_PROTECTED,
		Err(Errno::ENOMEM | Errno::ENOBUFS) => Status::OUT_OF_RESOURCES,
		Err(Errno::EINVAL) => Status::INVALID_PARAMETER,
		Err(Errno::ECANCELED) => Status::ABORTED,
		Err(Errno::ENOTCONN) => Status::NOT_READY,
		Err(_) => Status::DEVICE_ERROR,
	}
}

/// A GUID in its natural field decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid {
	pub d1: u32,
	pub d2: u16,
	pub d3: u16,
	pub d4: [u8; 8],
}

impl Guid {
	pub const fn new(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Self {
		Guid { d1, d2, d3, d4 }
	}

	/// Wire representation: mixed-endian per the UEFI specification.
	pub fn to_bytes(self) -> [u8; 16] {
		let mut out = [0u8; 16];
		out[0..4].copy_from_slice(&self.d1.to_le_bytes());
		out[4..6].copy_from_slice(&self.d2.to_le_bytes());
		out[6..8].copy_from_slice(&self.d3.to_le_bytes());
		out[8..16].copy_from_slice(&self.d4);
		out
	}
}

/// `EFI_BLOCK_IO_PROTOCOL` revision 3.
pub const BLOCK_IO_REVISION3: u64 = 0x0002_001f;

/// The media description published alongside the block I/O methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockIoMedia {
	pub media_id: u32,
	pub removable_media: bool,
	pub media_present: bool,
	pub logical_partition: bool,
	pub read_only: bool,
	pub write_caching: bool,
	pub block_size: u32,
	pub io_align: u32,
	pub last_block: u64,
	pub lowest_aligned_lba: u64,
	pub logical_blocks_per_physical_block: u32,
	pub optimal_transfer_length_granularity: u32,
}

/// The slice of boot services the bridge and SAN boot consume.
pub trait Firmware {
	/// Publish block I/O plus a device path on a fresh handle.
	fn install_block_io(&mut self, device_path: &[u8]) -> Result<Handle>;

	fn uninstall_block_io(&mut self, handle: Handle) -> Result<()>;

	/// Offer the handle to all drivers (failures are not fatal; the
	/// drivers may already be connected).
	fn connect_controller(&mut self, handle: Handle);

	/// All handles carrying a simple-file-system protocol.
	fn filesystem_handles(&mut self) -> Vec<Handle>;

	fn device_path(&self, handle: Handle) -> Option<Vec<u8>>;

	fn load_image(&mut self, device_path: &[u8]) -> Result<Handle>;

	fn start_image(&mut self, image: Handle) -> Result<()>;

	fn unload_image(&mut self, image: Handle);
}

/// EFI-side shared state owned by the runtime.
pub(crate) struct EfiState {
	pub firmware: Option<Box<dyn Firmware>>,
	pub devices: Vec<Rc<RefCell<block::EfiBlock>>>,
	/// Device path of the most recently opened network interface; new
	/// block devices hang their vendor node off it.
	pub snp_path: Option<Vec<u8>>,
}

impl EfiState {
	pub fn new() -> Self {
		EfiState {
			firmware: None,
			devices: Vec::new(),
			snp_path: None,
		}
	}
}

/// Install the firmware backend.
pub fn set_firmware(rt: &mut Runtime, firmware: Box<dyn Firmware>) {
	rt.efi.firmware = Some(firmware);
}

/// Record the device path of the last-opened network interface.
pub fn set_snp_device_path(rt: &mut Runtime, path: Vec<u8>) {
	rt.efi.snp_path = Some(path);
}
