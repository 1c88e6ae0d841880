//! Device-path construction.
//!
//! Paths are handled as packed byte sequences of `(type, subtype,
//! 16-bit length)` nodes terminated by an end node, exactly as the
//! firmware stores them. A network-backed block device is described by
//! appending a vendor node carrying the UTF-16 URI to the parent
//! network interface's path.

use crate::efi::Guid;
use crate::uri::Uri;

pub const HARDWARE_DEVICE_PATH: u8 = 0x01;
pub const HW_VENDOR_DP: u8 = 0x04;
pub const MEDIA_DEVICE_PATH: u8 = 0x04;
pub const MEDIA_FILEPATH_DP: u8 = 0x04;
pub const END_DEVICE_PATH_TYPE: u8 = 0x7f;
pub const END_ENTIRE_DEVICE_PATH_SUBTYPE: u8 = 0xff;

/// Vendor GUID identifying URI-backed block devices.
pub const BLOCK_DEVICE_PATH_GUID: Guid = Guid::new(
	0x8998_b594,
	0xf531,
	0x4e87,
	[0x8b, 0xdf, 0x8f, 0x88, 0x54, 0x3e, 0x99, 0xd4],
);

fn node(node_type: u8, subtype: u8, data: &[u8]) -> Vec<u8> {
	let len = 4 + data.len();
	let mut out = Vec::with_capacity(len);
	out.push(node_type);
	out.push(subtype);
	out.extend_from_slice(&(len as u16).to_le_bytes());
	out.extend_from_slice(data);
	out
}

pub fn end_node() -> Vec<u8> {
	vec![
		END_DEVICE_PATH_TYPE,
		END_ENTIRE_DEVICE_PATH_SUBTYPE,
		4,
		0,
	]
}

/// The portion of `path` up to (but excluding) its end node.
pub fn prefix(path: &[u8]) -> &[u8] {
	let mut offset = 0;
	while offset + 4 <= path.len() {
		if path[offset] == END_DEVICE_PATH_TYPE {
			return &path[..offset];
		}
		let len = usize::from(u16::from_le_bytes([path[offset + 2], path[offset + 3]]));
		if len < 4 {
			break;
		}
		offset += len;
	}
	path
}

fn utf16_bytes(text: &str) -> Vec<u8> {
	let mut out = Vec::with_capacity((text.len() + 1) * 2);
	for unit in text.encode_utf16() {
		out.extend_from_slice(&unit.to_le_bytes());
	}
	out.extend_from_slice(&0u16.to_le_bytes());
	out
}

/// Describe a URI-backed device as a child of `parent`.
pub fn uri_path(parent: &[u8], uri: &Uri) -> Vec<u8> {
	let mut data = Vec::new();
	data.extend_from_slice(&BLOCK_DEVICE_PATH_GUID.to_bytes());
	data.extend_from_slice(&utf16_bytes(&uri.to_string()));

	let mut path = prefix(parent).to_vec();
	path.extend_from_slice(&node(HARDWARE_DEVICE_PATH, HW_VENDOR_DP, &data));
	path.extend_from_slice(&end_node());
	path
}

/// Append a file-path node naming `filename` to a filesystem's path.
pub fn boot_file_path(filesystem: &[u8], filename: &str) -> Vec<u8> {
	let mut path = prefix(filesystem).to_vec();
	path.extend_from_slice(&node(
		MEDIA_DEVICE_PATH,
		MEDIA_FILEPATH_DP,
		&utf16_bytes(filename),
	));
	path.extend_from_slice(&end_node());
	path
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_parent() -> Vec<u8> {
		let mut parent = node(0x03, 0x0b, &[0u8; 6]); // MAC node
		parent.extend_from_slice(&end_node());
		parent
	}

	#[test]
	fn uri_path_embeds_guid_and_utf16_uri() {
		let parent = sample_parent();
		let uri = Uri::parse("http://boot.example.org/demo/boot.php");
		let path = uri_path(&parent, &uri);

		// Parent prefix retained verbatim
		assert_eq!(&path[..prefix(&parent).len()], prefix(&parent));
		// Vendor node follows
		let vendor = &path[prefix(&parent).len()..];
		assert_eq!(vendor[0], HARDWARE_DEVICE_PATH);
		assert_eq!(vendor[1], HW_VENDOR_DP);
		assert_eq!(&vendor[4..8], &0x8998_b594u32.to_le_bytes());
		// First URI character, UTF-16LE
		assert_eq!(&vendor[20..22], &(b'h' as u16).to_le_bytes());
		// Terminated properly
		assert_eq!(path[path.len() - 4], END_DEVICE_PATH_TYPE);
	}

	#[test]
	fn prefix_stops_at_end_node() {
		let parent = sample_parent();
		assert_eq!(prefix(&parent).len(), parent.len() - 4);
		// A path that is all end node has an empty prefix
		assert!(prefix(&end_node()).is_empty());
	}

	#[test]
	fn boot_file_path_appends_filepath_node() {
		let filesystem = sample_parent();
		let path = boot_file_path(&filesystem, "\\EFI\\BOOT\\BOOTX64.EFI");
		let node = &path[prefix(&filesystem).len()..];
		assert_eq!(node[0], MEDIA_DEVICE_PATH);
		assert_eq!(node[1], MEDIA_FILEPATH_DP);
		assert_eq!(&node[4..6], &(b'\\' as u16).to_le_bytes());
	}
}
