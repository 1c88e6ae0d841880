//! A backend that records transmitted segments.
//!
//! Useful both as a tracing aid and as the far end of a simulated link:
//! the owner inspects the captured frames and injects replies through
//! [`tcp::rx`](crate::net::tcp::rx) / [`udp::rx`](crate::net::udp::rx).

use std::cell::RefCell;
use std::rc::Rc;

use crate::errno::Result;
use crate::iobuf::IoBuffer;
use crate::net::{IpProto, NetBackend};
use crate::socket::SockAddr;

#[derive(Debug, Clone)]
pub struct Frame {
	pub proto: IpProto,
	pub payload: Vec<u8>,
	pub local: SockAddr,
	pub remote: SockAddr,
}

/// Shared handle onto the captured frames.
pub type FrameLog = Rc<RefCell<Vec<Frame>>>;

pub struct CaptureNet {
	frames: FrameLog,
}

impl CaptureNet {
	/// Create a capture backend and the log it appends to.
	pub fn new() -> (Box<dyn NetBackend>, FrameLog) {
		let frames: FrameLog = Rc::new(RefCell::new(Vec::new()));
		(
			Box::new(CaptureNet {
				frames: frames.clone(),
			}),
			frames,
		)
	}
}

impl NetBackend for CaptureNet {
	fn transmit(
		&mut self,
		proto: IpProto,
		iob: IoBuffer,
		local: SockAddr,
		remote: SockAddr,
	) -> Result<()> {
		trace!("capture {proto:?} {local} -> {remote} ({} bytes)", iob.len());
		self.frames.borrow_mut().push(Frame {
			proto,
			payload: iob.into_vec(),
			local,
			remote,
		});
		Ok(())
	}
}

/// A backend that refuses every transmission with a fixed error.
///
/// Models an unroutable network for fault-injection tests.
pub struct UnreachableNet(pub crate::errno::Errno);

impl NetBackend for UnreachableNet {
	fn transmit(
		&mut self,
		_proto: IpProto,
		_iob: IoBuffer,
		_local: SockAddr,
		remote: SockAddr,
	) -> Result<()> {
		debug!("no route to {remote}");
		Err(self.0)
	}
}
