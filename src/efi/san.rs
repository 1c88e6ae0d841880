//! SAN drive registry and boot.
//!
//! Hooking a URI as a drive publishes a block device to the firmware;
//! booting walks the filesystems the firmware subsequently binds to
//! that device and chainloads the removable-media boot image from the
//! first one that will start.

use std::cell::RefCell;
use std::rc::Rc;

use crate::efi::{block, path};
use crate::errno::{Errno, Result};
use crate::runtime::Runtime;
use crate::uri::Uri;

/// Default SAN drive number.
pub const SAN_DEFAULT_DRIVE: u32 = 0x80;

/// Removable-media boot image for the current CPU architecture.
pub const fn boot_filename() -> &'static str {
	if cfg!(target_arch = "x86_64") {
		"\\EFI\\BOOT\\BOOTX64.EFI"
	} else if cfg!(target_arch = "x86") {
		"\\EFI\\BOOT\\BOOTIA32.EFI"
	} else if cfg!(target_arch = "aarch64") {
		"\\EFI\\BOOT\\BOOTAA64.EFI"
	} else if cfg!(target_arch = "riscv64") {
		"\\EFI\\BOOT\\BOOTRISCV64.EFI"
	} else {
		"\\EFI\\BOOT\\BOOTX64.EFI"
	}
}

fn find(rt: &Runtime, drive: u32) -> Option<Rc<RefCell<block::EfiBlock>>> {
	rt.efi
		.devices
		.iter()
		.find(|device| device.borrow().drive == drive)
		.cloned()
}

/// Hook `uri` as SAN drive `drive`.
///
/// Opens the device, probes its capacity, and installs the block I/O
/// protocol with a synthesised device path. Returns the drive number.
pub fn san_hook(rt: &mut Runtime, uri: &Uri, drive: u32) -> Result<u32> {
	if find(rt, drive).is_some() {
		return Err(Errno::EADDRINUSE);
	}

	// The block device hangs off the most recently used network handle
	let Some(snp_path) = rt.efi.snp_path.clone() else {
		debug!("SAN {drive:#04x} could not identify a network device");
		return Err(Errno::ENODEV);
	};
	let device_path = path::uri_path(&snp_path, uri);

	let device = block::new(rt, uri, drive, device_path);
	rt.efi.devices.push(device.clone());

	let rc = (|| {
		block::reopen(rt, &device)?;
		block::probe(rt, &device)?;
		let handle = match rt.efi.firmware.as_mut() {
			Some(firmware) => {
				let dev = device.borrow();
				Some(firmware.install_block_io(&dev.path)?)
			}
			None => None,
		};
		device.borrow_mut().handle = handle;
		if let (Some(firmware), Some(handle)) = (rt.efi.firmware.as_mut(), handle) {
			firmware.connect_controller(handle);
		}
		Ok(drive)
	})();

	if let Err(rc) = rc {
		debug!("SAN {drive:#04x} could not hook: {rc}");
		block::unhook(rt, &device, Err(rc));
		rt.efi.devices.retain(|dev| !Rc::ptr_eq(dev, &device));
		return Err(rc);
	}
	debug!("SAN {drive:#04x} hooked to {uri}");
	rc
}

/// Unhook SAN drive `drive`. Idempotent.
pub fn san_unhook(rt: &mut Runtime, drive: u32) {
	let Some(device) = find(rt, drive) else {
		debug!("SAN cannot find drive {drive:#04x}");
		return;
	};

	let handle = device.borrow_mut().handle.take();
	if let (Some(firmware), Some(handle)) = (rt.efi.firmware.as_mut(), handle) {
		let _ = firmware.uninstall_block_io(handle);
	}

	block::unhook(rt, &device, Ok(()));
	rt.efi.devices.retain(|dev| !Rc::ptr_eq(dev, &device));
	debug!("SAN {drive:#04x} unhooked");
}

/// Check that `drive` is hooked.
pub fn san_describe(rt: &Runtime, drive: u32) -> Result<()> {
	match find(rt, drive) {
		Some(_) => Ok(()),
		None => Err(Errno::ENODEV),
	}
}

/// Boot from SAN drive `drive`.
///
/// Connects drivers to the device, then tries the boot image on every
/// filesystem whose device path descends from ours; the first image
/// that loads and starts wins.
pub fn san_boot(rt: &mut Runtime, drive: u32) -> Result<()> {
	let Some(device) = find(rt, drive) else {
		debug!("SAN cannot find drive {drive:#04x}");
		return Err(Errno::ENODEV);
	};
	let our_prefix = path::prefix(&device.borrow().path).to_vec();

	let Some(firmware) = rt.efi.firmware.as_mut() else {
		return Err(Errno::ENODEV);
	};

	if let Some(handle) = device.borrow().handle {
		firmware.connect_controller(handle);
	}

	let filesystems = firmware.filesystem_handles();
	let mut rc = Err(Errno::ENOENT);
	for handle in filesystems {
		let Some(fs_path) = firmware.device_path(handle) else {
			debug!("SAN {drive:#04x} found filesystem with no device path");
			continue;
		};
		// Only children of our block device are interesting
		if fs_path.len() < our_prefix.len() || fs_path[..our_prefix.len()] != our_prefix[..] {
			continue;
		}

		let boot_path = path::boot_file_path(&fs_path, boot_filename());
		debug!("SAN {drive:#04x} trying to load boot image");
		let image = match firmware.load_image(&boot_path) {
			Ok(image) => image,
			Err(load_rc) => {
				debug!("SAN {drive:#04x} could not load image: {load_rc}");
				rc = Err(load_rc);
				continue;
			}
		};
		rc = firmware.start_image(image);
		firmware.unload_image(image);
		debug!("SAN {drive:#04x} boot image returned: {rc:?}");
		break;
	}
	rc
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::efi::block::tests::ramdisk_runtime;
	use crate::efi::{self, Firmware, Handle};

	/// Scripted firmware double.
	#[derive(Default)]
	struct MockFirmware {
		state: Rc<RefCell<MockState>>,
	}

	#[derive(Default)]
	struct MockState {
		installed: Vec<(Handle, Vec<u8>)>,
		next_handle: Handle,
		connected: Vec<Handle>,
		/// Filesystems appearing once their parent device is connected.
		filesystems: Vec<(Handle, Vec<u8>)>,
		loadable: Vec<Vec<u8>>,
		loaded: Vec<Vec<u8>>,
		started: Vec<Handle>,
	}

	impl Firmware for MockFirmware {
		fn install_block_io(&mut self, device_path: &[u8]) -> Result<Handle> {
			let mut state = self.state.borrow_mut();
			state.next_handle += 1;
			let handle = state.next_handle;
			state.installed.push((handle, device_path.to_vec()));
			Ok(handle)
		}

		fn uninstall_block_io(&mut self, handle: Handle) -> Result<()> {
			let mut state = self.state.borrow_mut();
			state.installed.retain(|(installed, _)| *installed != handle);
			Ok(())
		}

		fn connect_controller(&mut self, handle: Handle) {
			self.state.borrow_mut().connected.push(handle);
		}

		fn filesystem_handles(&mut self) -> Vec<Handle> {
			self.state
				.borrow()
				.filesystems
				.iter()
				.map(|(handle, _)| *handle)
				.collect()
		}

		fn device_path(&self, handle: Handle) -> Option<Vec<u8>> {
			self.state
				.borrow()
				.filesystems
				.iter()
				.find(|(fs, _)| *fs == handle)
				.map(|(_, path)| path.clone())
		}

		fn load_image(&mut self, device_path: &[u8]) -> Result<Handle> {
			let mut state = self.state.borrow_mut();
			if !state.loadable.contains(&device_path.to_vec()) {
				return Err(Errno::ENOENT);
			}
			state.loaded.push(device_path.to_vec());
			state.next_handle += 1;
			let image_handle = state.next_handle;
			Ok(image_handle)
		}

		fn start_image(&mut self, image: Handle) -> Result<()> {
			self.state.borrow_mut().started.push(image);
			Ok(())
		}

		fn unload_image(&mut self, _image: Handle) {}
	}

	fn san_runtime(content: &[u8]) -> (Runtime, Rc<RefCell<MockState>>) {
		let mut rt = ramdisk_runtime(content);
		let firmware = MockFirmware::default();
		let state = firmware.state.clone();
		efi::set_firmware(&mut rt, Box::new(firmware));
		// A plausible parent network device path
		let mut snp = vec![0x03, 0x0b, 0x0a, 0x00, 1, 2, 3, 4, 5, 6];
		snp.extend_from_slice(&path::end_node());
		efi::set_snp_device_path(&mut rt, snp);
		(rt, state)
	}

	#[test]
	fn hook_installs_protocol_and_unhook_is_idempotent() {
		let (mut rt, state) = san_runtime(&vec![0u8; 32 * 512]);
		let uri = Uri::parse("ramdisk://local/");
		let drive = san_hook(&mut rt, &uri, 0x80).unwrap();
		assert_eq!(drive, 0x80);
		assert_eq!(state.borrow().installed.len(), 1);
		assert!(san_describe(&rt, 0x80).is_ok());

		// Second hook on the same number collides
		assert_eq!(san_hook(&mut rt, &uri, 0x80).unwrap_err(), Errno::EADDRINUSE);

		san_unhook(&mut rt, 0x80);
		assert!(state.borrow().installed.is_empty());
		assert!(san_describe(&rt, 0x80).is_err());
		assert!(rt.efi.devices.is_empty());

		// Unhooking again is harmless
		san_unhook(&mut rt, 0x80);
	}

	#[test]
	fn hook_without_network_parent_fails() {
		let mut rt = ramdisk_runtime(&vec![0u8; 32 * 512]);
		let uri = Uri::parse("ramdisk://local/");
		assert_eq!(san_hook(&mut rt, &uri, 0x80).unwrap_err(), Errno::ENODEV);
	}

	#[test]
	fn boot_chainloads_from_child_filesystem() {
		let (mut rt, state) = san_runtime(&vec![0u8; 32 * 512]);
		let uri = Uri::parse("ramdisk://local/");
		san_hook(&mut rt, &uri, 0x80).unwrap();

		// The firmware binds a filesystem as a child of our device path
		let device_path = state.borrow().installed[0].1.clone();
		let mut fs_path = path::prefix(&device_path).to_vec();
		fs_path.extend_from_slice(&[0x04, 0x01, 0x08, 0x00, 0xde, 0xad, 0xbe, 0xef]);
		fs_path.extend_from_slice(&path::end_node());
		let boot_path = path::boot_file_path(&fs_path, boot_filename());
		{
			let mut state = state.borrow_mut();
			state.filesystems.push((77, fs_path.clone()));
			state.loadable.push(boot_path.clone());
		}

		san_boot(&mut rt, 0x80).unwrap();
		assert_eq!(state.borrow().loaded, vec![boot_path]);
		assert_eq!(state.borrow().started.len(), 1);
	}

	#[test]
	fn boot_ignores_foreign_filesystems() {
		let (mut rt, state) = san_runtime(&vec![0u8; 32 * 512]);
		let uri = Uri::parse("ramdisk://local/");
		san_hook(&mut rt, &uri, 0x80).unwrap();

		// A filesystem that does not descend from our device
		let mut fs_path = vec![0x01, 0x01, 0x06, 0x00, 0xff, 0xff];
		fs_path.extend_from_slice(&path::end_node());
		state.borrow_mut().filesystems.push((99, fs_path));

		assert_eq!(san_boot(&mut rt, 0x80).unwrap_err(), Errno::ENOENT);
		assert!(state.borrow().loaded.is_empty());
	}

	#[test]
	fn boot_unhooked_drive_fails() {
		let (mut rt, _state) = san_runtime(&vec![0u8; 32 * 512]);
		assert_eq!(san_boot(&mut rt, 0x99).unwrap_err(), Errno::ENODEV);
	}
}
