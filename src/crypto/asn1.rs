//! Minimal DER support: a borrowing cursor for parsing and a
//! prepend-oriented builder for construction.
//!
//! The builder works backwards (innermost element first, then `wrap`
//! outwards), which matches how nested request structures are most
//! naturally assembled without a second sizing pass.

use time::{Date, Month, PrimitiveDateTime, Time};

use crate::errno::{Errno, Result};

pub const BIT_STRING: u8 = 0x03;
pub const OCTET_STRING: u8 = 0x04;
pub const NULL: u8 = 0x05;
pub const OID: u8 = 0x06;
pub const ENUMERATED: u8 = 0x0a;
pub const GENERALIZED_TIME: u8 = 0x18;
pub const SEQUENCE: u8 = 0x30;

pub const fn explicit_tag(number: u8) -> u8 {
	0xa0 | number
}

pub const fn implicit_tag(number: u8) -> u8 {
	0x80 | number
}

/// Parse a TLV header: `(tag, header length, content length)`.
fn header(data: &[u8]) -> Result<(u8, usize, usize)> {
	let &[tag, first, ..] = data else {
		return Err(Errno::EINVAL);
	};
	if usize::from(first) < 0x80 {
		return Ok((tag, 2, usize::from(first)));
	}
	let len_bytes = usize::from(first & 0x7f);
	if len_bytes == 0 || len_bytes > 4 || data.len() < 2 + len_bytes {
		return Err(Errno::EINVAL);
	}
	let mut len = 0usize;
	for &byte in &data[2..2 + len_bytes] {
		len = (len << 8) | usize::from(byte);
	}
	Ok((tag, 2 + len_bytes, len))
}

/// A borrowing view into a DER byte sequence.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
	data: &'a [u8],
}

impl<'a> Cursor<'a> {
	pub fn new(data: &'a [u8]) -> Self {
		Cursor { data }
	}

	pub fn bytes(&self) -> &'a [u8] {
		self.data
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	/// Tag of the element at the cursor.
	pub fn tag(&self) -> Result<u8> {
		header(self.data).map(|(tag, _, _)| tag)
	}

	fn element(&self, expected: Option<u8>) -> Result<(usize, usize)> {
		let (tag, hlen, len) = header(self.data)?;
		if let Some(expected) = expected {
			if tag != expected {
				return Err(Errno::EINVAL);
			}
		}
		if self.data.len() < hlen + len {
			return Err(Errno::EINVAL);
		}
		Ok((hlen, len))
	}

	/// Descend into the element at the cursor.
	pub fn enter(&mut self, tag: u8) -> Result<()> {
		let (hlen, len) = self.element(Some(tag))?;
		self.data = &self.data[hlen..hlen + len];
		Ok(())
	}

	/// Step over the element at the cursor.
	pub fn skip(&mut self, tag: u8) -> Result<()> {
		let (hlen, len) = self.element(Some(tag))?;
		self.data = &self.data[hlen + len..];
		Ok(())
	}

	pub fn skip_any(&mut self) -> Result<()> {
		let (hlen, len) = self.element(None)?;
		self.data = &self.data[hlen + len..];
		Ok(())
	}

	pub fn skip_if_exists(&mut self, tag: u8) {
		if self.tag() == Ok(tag) {
			let _ = self.skip(tag);
		}
	}

	/// Restrict the cursor to exactly the element at its head,
	/// including the header.
	pub fn shrink_any(&mut self) -> Result<()> {
		let (hlen, len) = self.element(None)?;
		self.data = &self.data[..hlen + len];
		Ok(())
	}

	/// Parse a GeneralizedTime (`YYYYMMDDHHMMSSZ`) element into a Unix
	/// timestamp.
	pub fn generalized_time(&self) -> Result<i64> {
		let mut cursor = *self;
		cursor.enter(GENERALIZED_TIME)?;
		let text = std::str::from_utf8(cursor.bytes()).map_err(|_| Errno::EINVAL)?;
		if text.len() != 15 || !text.ends_with('Z') {
			return Err(Errno::EINVAL);
		}
		let digits = |range: std::ops::Range<usize>| -> Result<u32> {
			text[range].parse().map_err(|_| Errno::EINVAL)
		};
		let year = digits(0..4)? as i32;
		let month = Month::try_from(digits(4..6)? as u8).map_err(|_| Errno::EINVAL)?;
		let day = digits(6..8)? as u8;
		let date = Date::from_calendar_date(year, month, day).map_err(|_| Errno::EINVAL)?;
		let time = Time::from_hms(digits(8..10)? as u8, digits(10..12)? as u8, digits(12..14)? as u8)
			.map_err(|_| Errno::EINVAL)?;
		Ok(PrimitiveDateTime::new(date, time)
			.assume_utc()
			.unix_timestamp())
	}
}

fn encode_len(len: usize) -> Vec<u8> {
	if len < 0x80 {
		return vec![len as u8];
	}
	let bytes = len.to_be_bytes();
	let skip = bytes.iter().take_while(|&&byte| byte == 0).count();
	let mut out = vec![0x80 | (bytes.len() - skip) as u8];
	out.extend_from_slice(&bytes[skip..]);
	out
}

/// Encode a complete TLV.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
	let mut out = vec![tag];
	out.extend_from_slice(&encode_len(content.len()));
	out.extend_from_slice(content);
	out
}

/// A backward DER builder.
#[derive(Debug, Default)]
pub struct Builder {
	data: Vec<u8>,
}

impl Builder {
	pub fn new() -> Self {
		Builder::default()
	}

	pub fn bytes(&self) -> &[u8] {
		&self.data
	}

	pub fn into_bytes(self) -> Vec<u8> {
		self.data
	}

	/// Prepend raw, already-encoded bytes.
	pub fn prepend_raw(&mut self, bytes: &[u8]) {
		let mut out = bytes.to_vec();
		out.extend_from_slice(&self.data);
		self.data = out;
	}

	/// Prepend one TLV element.
	pub fn prepend(&mut self, tag: u8, content: &[u8]) {
		self.prepend_raw(&tlv(tag, content));
	}

	/// Wrap everything built so far in an enclosing element.
	pub fn wrap(&mut self, tag: u8) {
		self.data = tlv(tag, &self.data);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn build_and_walk() {
		let mut builder = Builder::new();
		builder.prepend(OCTET_STRING, b"abc");
		builder.prepend(OID, &[0x2b, 0x0e, 0x03, 0x02, 0x1a]);
		builder.wrap(SEQUENCE);

		let mut cursor = Cursor::new(builder.bytes());
		cursor.enter(SEQUENCE).unwrap();
		assert_eq!(cursor.tag().unwrap(), OID);
		cursor.skip(OID).unwrap();
		let mut inner = cursor;
		inner.enter(OCTET_STRING).unwrap();
		assert_eq!(inner.bytes(), b"abc");
		cursor.skip_any().unwrap();
		assert!(cursor.is_empty());
	}

	#[test]
	fn long_form_lengths() {
		let content = vec![0x55u8; 300];
		let encoded = tlv(OCTET_STRING, &content);
		assert_eq!(&encoded[..4], &[OCTET_STRING, 0x82, 0x01, 0x2c]);
		let mut cursor = Cursor::new(&encoded);
		cursor.enter(OCTET_STRING).unwrap();
		assert_eq!(cursor.bytes(), &content[..]);
	}

	#[test]
	fn shrink_isolates_first_element() {
		let mut data = tlv(SEQUENCE, b"xy");
		data.extend_from_slice(&tlv(OCTET_STRING, b"z"));
		let mut cursor = Cursor::new(&data);
		cursor.shrink_any().unwrap();
		assert_eq!(cursor.bytes(), &tlv(SEQUENCE, b"xy")[..]);
	}

	#[test]
	fn generalized_time_parses() {
		let encoded = tlv(GENERALIZED_TIME, b"20260801120000Z");
		let cursor = Cursor::new(&encoded);
		let stamp = cursor.generalized_time().unwrap();
		assert_eq!(stamp, 1_785_585_600);
		let bad = tlv(GENERALIZED_TIME, b"2026-08-01T12Z!");
		assert!(Cursor::new(&bad).generalized_time().is_err());
	}
}
