//! Object-to-object message passing.
//!
//! Every stage of a transfer pipeline owns one or more *interfaces*.
//! Plugging two interfaces together creates a bidirectional channel over
//! which byte-stream deliveries, flow-control notifications and block
//! commands travel. Interfaces are generational handles into an arena
//! owned by the [`Runtime`]; a handle whose slot has been freed resolves
//! to nothing, so a stage that has been shut down can never be re-entered
//! through a stale edge.
//!
//! The operation set is a single trait with defaulted methods rather than
//! a per-operation descriptor table: a stage implements exactly the
//! operations it supports and inherits safe defaults (discard, zero
//! window, `ENOTSUP`) for the rest.

use std::cell::RefCell;
use std::rc::Rc;

use crate::errno::{Errno, Result, Status};
use crate::iobuf::IoBuffer;
use crate::runtime::slab::Handle;
use crate::runtime::{Runtime, TimerId};
use crate::socket::SockAddr;
use crate::uri::Uri;

/// Distinguishes the interfaces of an object owning more than one.
pub type Port = u8;

/// An interface handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntfId(pub(crate) Handle);

impl IntfId {
	/// A handle that never resolves; operations on it hit the defaults.
	pub const NULL: IntfId = IntfId(Handle::NULL);
}

impl Default for IntfId {
	fn default() -> Self {
		IntfId::NULL
	}
}

/// Out-of-band information accompanying a delivery.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
	/// Explicit position of this payload within the transfer. An empty
	/// delivery carrying an offset acts as a seek.
	pub offset: Option<u64>,
	/// Source address (datagram sockets only).
	pub src: Option<SockAddr>,
}

impl Metadata {
	pub fn at_offset(offset: u64) -> Self {
		Metadata {
			offset: Some(offset),
			src: None,
		}
	}
}

/// Capacity of a block device, reported in reply to a capacity probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCapacity {
	/// Total number of blocks.
	pub blocks: u64,
	/// Block size in bytes.
	pub blksize: u32,
	/// Maximum number of blocks per single command.
	pub max_count: u32,
}

/// Shared data buffer for block read/write commands.
pub type DataBuffer = Rc<RefCell<Vec<u8>>>;

/// Operations a pipeline stage may receive through its interfaces.
///
/// `port` identifies which of the object's interfaces the operation
/// arrived on. Within one scheduler frame an operation handler must not
/// call back into the object that invoked it; anything that needs a
/// response in the other direction schedules a step instead.
#[allow(unused_variables)]
pub trait Object {
	/// Peer interface has been closed.
	fn close(&mut self, rt: &mut Runtime, port: Port, rc: Status) {}

	/// Incoming data. Takes ownership of the buffer.
	fn deliver(&mut self, rt: &mut Runtime, port: Port, iob: IoBuffer, meta: &Metadata) -> Result<()> {
		Ok(())
	}

	/// Flow-control window available for deliveries towards this object.
	fn window(&self, port: Port) -> usize {
		0
	}

	/// The peer's window may have reopened.
	fn window_changed(&mut self, rt: &mut Runtime, port: Port) {}

	/// The transfer should be reopened at a new location.
	fn redirect(&mut self, rt: &mut Runtime, port: Port, location: &Uri) -> Result<()> {
		Err(Errno::ENOTSUP)
	}

	fn block_read(
		&mut self,
		rt: &mut Runtime,
		port: Port,
		data: IntfId,
		lba: u64,
		count: u32,
		buffer: DataBuffer,
	) -> Result<()> {
		Err(Errno::ENOTSUP)
	}

	fn block_write(
		&mut self,
		rt: &mut Runtime,
		port: Port,
		data: IntfId,
		lba: u64,
		count: u32,
		buffer: DataBuffer,
	) -> Result<()> {
		Err(Errno::ENOTSUP)
	}

	fn block_read_capacity(&mut self, rt: &mut Runtime, port: Port, data: IntfId) -> Result<()> {
		Err(Errno::ENOTSUP)
	}

	/// Capacity report travelling towards the consumer.
	fn block_capacity(&mut self, rt: &mut Runtime, port: Port, capacity: BlockCapacity) {}

	/// One cooperative scheduling step.
	fn step(&mut self, rt: &mut Runtime) {}

	/// A timer owned by this object has fired.
	fn timer_expired(&mut self, rt: &mut Runtime, timer: TimerId) {}
}

pub type ObjectRef = Rc<RefCell<dyn Object>>;

pub(crate) struct IntfEntry {
	pub owner: Option<(ObjectRef, Port)>,
	pub peer: Option<IntfId>,
}

/// Create an interface owned by `object`.
pub fn create<T: Object + 'static>(rt: &mut Runtime, object: &Rc<RefCell<T>>, port: Port) -> IntfId {
	let owner: ObjectRef = object.clone();
	IntfId(rt.intfs.insert(IntfEntry {
		owner: Some((owner, port)),
		peer: None,
	}))
}

/// Atomically connect two interfaces.
///
/// Any existing plug edge on either side is broken first (without
/// notification), preserving the one-edge-per-side invariant.
pub fn plug_plug(rt: &mut Runtime, a: IntfId, b: IntfId) {
	unplug(rt, a);
	unplug(rt, b);
	if rt.intfs.get(a.0).is_some() && rt.intfs.get(b.0).is_some() {
		rt.intfs.get_mut(a.0).unwrap().peer = Some(b);
		rt.intfs.get_mut(b.0).unwrap().peer = Some(a);
	}
}

/// Break the plug edge of `intf`, if any, without notifying either side.
pub fn unplug(rt: &mut Runtime, intf: IntfId) {
	let peer = rt.intfs.get_mut(intf.0).and_then(|entry| entry.peer.take());
	if let Some(peer) = peer {
		if let Some(entry) = rt.intfs.get_mut(peer.0) {
			entry.peer = None;
		}
	}
}

/// Stop `intf` receiving any further operations while leaving it plugged.
pub fn nullify(rt: &mut Runtime, intf: IntfId) {
	if let Some(entry) = rt.intfs.get_mut(intf.0) {
		entry.owner = None;
	}
}

fn notify_close(rt: &mut Runtime, peer: IntfId, rc: Status) {
	let owner = match rt.intfs.get_mut(peer.0) {
		Some(entry) => {
			entry.peer = None;
			entry.owner.clone()
		}
		None => None,
	};
	if let Some((object, port)) = owner {
		object.borrow_mut().close(rt, port, rc);
	}
}

/// Shut down and release `intf`, notifying the peer.
///
/// The local side is freed before the peer learns anything, so a shutdown
/// triggered from within the peer's close handler finds nothing left to
/// re-enter. Idempotent.
pub fn shutdown(rt: &mut Runtime, intf: IntfId, rc: Status) {
	let entry = rt.intfs.remove(intf.0);
	if let Some(entry) = entry {
		if let Some(peer) = entry.peer {
			notify_close(rt, peer, rc);
		}
	}
}

/// Shut down the connection on `intf` but keep the interface for reuse.
pub fn restart(rt: &mut Runtime, intf: IntfId, rc: Status) {
	let peer = rt.intfs.get_mut(intf.0).and_then(|entry| entry.peer.take());
	if let Some(peer) = peer {
		notify_close(rt, peer, rc);
	}
}

/// Owner of `intf` itself (not its peer).
pub(crate) fn owner(rt: &Runtime, intf: IntfId) -> Option<ObjectRef> {
	rt.intfs
		.get(intf.0)?
		.owner
		.clone()
		.map(|(object, _port)| object)
}

/// Create another interface for the owner of `intf`.
///
/// Lets an object grow a per-command interface from inside one of its
/// own operation handlers, where no `Rc` to itself is in reach.
pub fn create_sibling(rt: &mut Runtime, intf: IntfId, port: Port) -> IntfId {
	match owner(rt, intf) {
		Some(object) => IntfId(rt.intfs.insert(IntfEntry {
			owner: Some((object, port)),
			peer: None,
		})),
		None => IntfId::NULL,
	}
}

/// Schedule a step for the owner of `intf`.
pub fn schedule_owner(rt: &mut Runtime, intf: IntfId) {
	if let Some(object) = owner(rt, intf) {
		rt.schedule_object(object);
	}
}

fn peer_object(rt: &Runtime, intf: IntfId) -> Option<(ObjectRef, Port)> {
	let entry = rt.intfs.get(intf.0)?;
	let peer = entry.peer?;
	rt.intfs.get(peer.0)?.owner.clone()
}

/// Deliver a buffer to the peer of `intf`.
///
/// An unplugged or nullified destination silently discards the data.
pub fn deliver(rt: &mut Runtime, intf: IntfId, iob: IoBuffer, meta: &Metadata) -> Result<()> {
	match peer_object(rt, intf) {
		Some((object, port)) => object.borrow_mut().deliver(rt, port, iob, meta),
		None => Ok(()),
	}
}

/// Deliver raw bytes to the peer of `intf`.
pub fn deliver_raw(rt: &mut Runtime, intf: IntfId, data: &[u8]) -> Result<()> {
	deliver(rt, intf, IoBuffer::from_slice(data), &Metadata::default())
}

/// Notify the peer of `intf` of a new transfer position.
pub fn seek(rt: &mut Runtime, intf: IntfId, offset: u64) -> Result<()> {
	deliver(rt, intf, IoBuffer::default(), &Metadata::at_offset(offset))
}

/// Flow-control window of the peer of `intf`.
pub fn window(rt: &Runtime, intf: IntfId) -> usize {
	match peer_object(rt, intf) {
		Some((object, port)) => object.borrow().window(port),
		None => 0,
	}
}

/// Notify the peer of `intf` that our window may have reopened.
pub fn window_changed(rt: &mut Runtime, intf: IntfId) {
	if let Some((object, port)) = peer_object(rt, intf) {
		object.borrow_mut().window_changed(rt, port);
	}
}

/// Ask the peer of `intf` to reopen the transfer at `location`.
pub fn redirect(rt: &mut Runtime, intf: IntfId, location: &Uri) -> Result<()> {
	match peer_object(rt, intf) {
		Some((object, port)) => object.borrow_mut().redirect(rt, port, location),
		None => Ok(()),
	}
}

pub fn block_read(
	rt: &mut Runtime,
	control: IntfId,
	data: IntfId,
	lba: u64,
	count: u32,
	buffer: DataBuffer,
) -> Result<()> {
	match peer_object(rt, control) {
		Some((object, port)) => object.borrow_mut().block_read(rt, port, data, lba, count, buffer),
		None => Err(Errno::ENOTCONN),
	}
}

pub fn block_write(
	rt: &mut Runtime,
	control: IntfId,
	data: IntfId,
	lba: u64,
	count: u32,
	buffer: DataBuffer,
) -> Result<()> {
	match peer_object(rt, control) {
		Some((object, port)) => object.borrow_mut().block_write(rt, port, data, lba, count, buffer),
		None => Err(Errno::ENOTCONN),
	}
}

pub fn block_read_capacity(rt: &mut Runtime, control: IntfId, data: IntfId) -> Result<()> {
	match peer_object(rt, control) {
		Some((object, port)) => object.borrow_mut().block_read_capacity(rt, port, data),
		None => Err(Errno::ENOTCONN),
	}
}

/// Report block-device capacity to the peer of `data`.
pub fn block_capacity(rt: &mut Runtime, data: IntfId, capacity: BlockCapacity) {
	if let Some((object, port)) = peer_object(rt, data) {
		object.borrow_mut().block_capacity(rt, port, capacity);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Default)]
	struct Recorder {
		delivered: Vec<Vec<u8>>,
		closed: Option<Status>,
		window: usize,
	}

	impl Object for Recorder {
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
			self.delivered.push(iob.into_vec());
			Ok(())
		}

		fn window(&self, _port: Port) -> usize {
			self.window
		}
	}

	#[test]
	fn plugged_delivery_and_window() {
		let mut rt = Runtime::new();
		let a = Rc::new(RefCell::new(Recorder::default()));
		let b = Rc::new(RefCell::new(Recorder {
			window: 7,
			..Default::default()
		}));
		let ia = create(&mut rt, &a, 0);
		let ib = create(&mut rt, &b, 0);
		plug_plug(&mut rt, ia, ib);

		deliver_raw(&mut rt, ia, b"hello").unwrap();
		assert_eq!(b.borrow().delivered, vec![b"hello".to_vec()]);
		assert_eq!(window(&rt, ia), 7);
		assert_eq!(window(&rt, ib), 0);
	}

	#[test]
	fn shutdown_notifies_peer_once() {
		let mut rt = Runtime::new();
		let a = Rc::new(RefCell::new(Recorder::default()));
		let b = Rc::new(RefCell::new(Recorder::default()));
		let ia = create(&mut rt, &a, 0);
		let ib = create(&mut rt, &b, 0);
		plug_plug(&mut rt, ia, ib);

		shutdown(&mut rt, ia, Err(Errno::ECONNRESET));
		assert_eq!(b.borrow().closed, Some(Err(Errno::ECONNRESET)));
		assert!(a.borrow().closed.is_none());

		// Stale handle: all operations fall back to defaults.
		shutdown(&mut rt, ia, Ok(()));
		assert!(deliver_raw(&mut rt, ia, b"x").is_ok());
		assert_eq!(window(&rt, ia), 0);
	}

	#[test]
	fn unplugged_discard() {
		let mut rt = Runtime::new();
		let a = Rc::new(RefCell::new(Recorder::default()));
		let ia = create(&mut rt, &a, 0);
		assert!(deliver_raw(&mut rt, ia, b"x").is_ok());
		assert_eq!(
			block_read_capacity(&mut rt, ia, IntfId::NULL).unwrap_err(),
			Errno::ENOTCONN
		);
	}
}
