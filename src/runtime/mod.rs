//! The single-threaded cooperative runtime.
//!
//! All process-wide state of the pipeline lives in one [`Runtime`]
//! aggregate that is passed explicitly to every operation: the interface
//! arena, timers, the step queue, the TCP/UDP tables, the URI opener
//! registry, the current working URI, the settings store and the EFI
//! block-device registry. There are no globals and no threads; one call
//! to [`Runtime::poll`] runs each due timer and each scheduled step to
//! completion.

pub(crate) mod slab;
mod timer;

use std::cell::RefCell;
use std::mem;
use std::net::IpAddr;
use std::rc::{Rc, Weak};

use hashbrown::HashMap;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

pub use self::timer::{RetryTimer, TimerId, MICROS_PER_SEC};
use self::timer::TimerEntry;
use crate::errno::{Errno, Result};
use crate::net::NetBackend;
use crate::uri::{Parameters, Uri};
use crate::xfer::{IntfEntry, IntfId, Object};

/// A registered URI opener.
#[derive(Clone, Copy)]
pub struct UriOpener {
	pub scheme: &'static str,
	pub open: fn(&mut Runtime, IntfId, &Uri) -> Result<()>,
}

pub struct Runtime {
	now: u64,
	pub(crate) intfs: slab::Slab<IntfEntry>,
	timers: slab::Slab<TimerEntry>,
	steps: Vec<Weak<RefCell<dyn Object>>>,
	pub(crate) tcp: crate::net::tcp::TcpTable,
	pub(crate) udp: crate::net::udp::UdpTable,
	pub(crate) net: Option<Box<dyn NetBackend>>,
	pub(crate) efi: crate::efi::EfiState,
	openers: Vec<UriOpener>,
	cwuri: Option<Uri>,
	hosts: HashMap<String, IpAddr>,
	netdevs: Vec<String>,
	settings: HashMap<String, Vec<u8>>,
	params: Vec<Rc<RefCell<Parameters>>>,
	rng: ChaCha8Rng,
	/// Free-memory budget governing the advertised TCP window.
	pub(crate) mem_budget: usize,
}

impl Default for Runtime {
	fn default() -> Self {
		Self::new()
	}
}

impl Runtime {
	pub fn new() -> Self {
		let mut rt = Runtime {
			now: 0,
			intfs: slab::Slab::default(),
			timers: slab::Slab::default(),
			steps: Vec::new(),
			tcp: crate::net::tcp::TcpTable::new(),
			udp: crate::net::udp::UdpTable::new(),
			net: None,
			efi: crate::efi::EfiState::new(),
			openers: Vec::new(),
			cwuri: None,
			hosts: HashMap::new(),
			netdevs: Vec::new(),
			settings: HashMap::new(),
			params: Vec::new(),
			rng: ChaCha8Rng::seed_from_u64(0x6272_6f77_6e69_6521),
			mem_budget: 512 * 1024,
		};
		rt.register_opener(crate::net::http::OPENER);
		rt.register_opener(crate::net::nbd::OPENER);
		rt.register_opener(crate::net::slam::OPENER);
		rt
	}

	/// Reseed the runtime's entropy source.
	pub fn seed_entropy(&mut self, seed: u64) {
		self.rng = ChaCha8Rng::seed_from_u64(seed);
	}

	pub(crate) fn next_u32(&mut self) -> u32 {
		self.rng.next_u32()
	}

	pub(crate) fn next_u64(&mut self) -> u64 {
		self.rng.next_u64()
	}

	/// Install the link-layer backend used for all transmissions.
	pub fn set_net_backend(&mut self, net: Box<dyn NetBackend>) {
		self.net = Some(net);
	}

	/// Monotonic time in microseconds.
	pub fn now(&self) -> u64 {
		self.now
	}

	/// Advance the monotonic clock.
	pub fn advance(&mut self, micros: u64) {
		self.now += micros;
	}

	// ----- timers ---------------------------------------------------

	/// Allocate a timer owned by `object`.
	pub fn timer_create<T: Object + 'static>(&mut self, object: &Rc<RefCell<T>>) -> TimerId {
		let owner: Rc<RefCell<dyn Object>> = object.clone();
		TimerId(self.timers.insert(TimerEntry {
			expires: None,
			owner: Rc::downgrade(&owner),
		}))
	}

	pub fn timer_arm(&mut self, timer: TimerId, delay: u64) {
		let now = self.now;
		if let Some(entry) = self.timers.get_mut(timer.0) {
			entry.expires = Some(now + delay);
		}
	}

	pub fn timer_disarm(&mut self, timer: TimerId) {
		if let Some(entry) = self.timers.get_mut(timer.0) {
			entry.expires = None;
		}
	}

	pub fn timer_running(&self, timer: TimerId) -> bool {
		self.timers
			.get(timer.0)
			.is_some_and(|entry| entry.expires.is_some())
	}

	pub fn timer_free(&mut self, timer: TimerId) {
		self.timers.remove(timer.0);
	}

	fn next_due_timer(&self) -> Option<(TimerId, u64)> {
		self.timers
			.iter()
			.filter_map(|(handle, entry)| entry.expires.map(|at| (TimerId(handle), at)))
			.min_by_key(|&(_, at)| at)
	}

	// ----- scheduling -----------------------------------------------

	/// Mark an object runnable; its `step()` runs on the next poll.
	pub fn schedule<T: Object + 'static>(&mut self, object: &Rc<RefCell<T>>) {
		let object: Rc<RefCell<dyn Object>> = object.clone();
		self.steps.push(Rc::downgrade(&object));
	}

	/// `schedule` for an already type-erased object reference.
	pub fn schedule_object(&mut self, object: crate::xfer::ObjectRef) {
		self.steps.push(Rc::downgrade(&object));
	}

	/// Run one scheduler pass: fire due timers, then drain the step
	/// queue until it quiesces (a step may schedule further steps).
	pub fn poll(&mut self) {
		loop {
			let due = match self.next_due_timer() {
				Some((timer, at)) if at <= self.now => timer,
				_ => break,
			};
			let owner = match self.timers.get_mut(due.0) {
				Some(entry) => {
					entry.expires = None;
					entry.owner.clone()
				}
				None => continue,
			};
			if let Some(object) = owner.upgrade() {
				object.borrow_mut().timer_expired(self, due);
			}
		}

		loop {
			let steps = mem::take(&mut self.steps);
			if steps.is_empty() {
				break;
			}
			for step in steps {
				if let Some(object) = step.upgrade() {
					object.borrow_mut().step(self);
				}
			}
		}
	}

	/// Jump the clock forward to the next armed timer when idle.
	///
	/// Returns `false` when nothing is pending at all, i.e. no amount of
	/// waiting will produce further progress.
	pub fn idle_advance(&mut self) -> bool {
		if !self.steps.is_empty() {
			return true;
		}
		match self.next_due_timer() {
			Some((_, at)) => {
				if at > self.now {
					self.now = at;
				}
				true
			}
			None => false,
		}
	}

	/// Pump the scheduler while `cond` holds.
	pub fn run_while(&mut self, mut cond: impl FnMut(&Runtime) -> bool) {
		while cond(self) {
			self.poll();
			if cond(self) && !self.idle_advance() {
				break;
			}
		}
	}

	// ----- URI dispatch ---------------------------------------------

	pub fn register_opener(&mut self, opener: UriOpener) {
		self.openers.push(opener);
	}

	/// Open `uri`, resolved against the current working URI, and plug the
	/// resulting transfer onto `intf`.
	pub fn open_uri(&mut self, intf: IntfId, uri: &Uri) -> Result<()> {
		let resolved = match (&self.cwuri, uri.scheme.as_deref()) {
			(Some(cwuri), None) => cwuri.resolve(uri),
			_ => uri.clone(),
		};
		let scheme = resolved.scheme.as_deref().ok_or(Errno::ENOTSUP)?;
		let opener = self
			.openers
			.iter()
			.find(|opener| opener.scheme.eq_ignore_ascii_case(scheme))
			.copied()
			.ok_or(Errno::ENOTSUP)?;
		debug!("open {resolved}");
		(opener.open)(self, intf, &resolved)
	}

	pub fn open_uri_string(&mut self, intf: IntfId, uri: &str) -> Result<()> {
		let uri = self.parse_uri(uri);
		self.open_uri(intf, &uri)
	}

	/// Parse a URI, attaching any `##params` reference.
	pub fn parse_uri(&mut self, string: &str) -> Uri {
		Uri::parse_with_params(string, &self.params)
	}

	/// Change the current working URI by relative resolution.
	pub fn churi(&mut self, uri: &Uri) {
		let new = match &self.cwuri {
			Some(cwuri) => cwuri.resolve(uri),
			None => uri.clone(),
		};
		self.cwuri = Some(new);
	}

	pub fn cwuri(&self) -> Option<&Uri> {
		self.cwuri.as_ref()
	}

	// ----- request parameters ---------------------------------------

	/// Create a named request-parameter list.
	pub fn create_parameters(&mut self, name: &str) -> Rc<RefCell<Parameters>> {
		let params = Rc::new(RefCell::new(Parameters::new(name)));
		// Most recently created list shadows older ones of the same name.
		self.params.insert(0, params.clone());
		params
	}

	// ----- name resolution ------------------------------------------

	/// Register a static host-name mapping.
	pub fn add_host(&mut self, name: &str, addr: IpAddr) {
		self.hosts.insert(name.to_string(), addr);
	}

	pub(crate) fn lookup_host(&self, name: &str) -> Option<IpAddr> {
		self.hosts.get(name).copied()
	}

	/// Register a network device name; its IPv6 scope identifier is its
	/// position in registration order, starting from 1.
	pub fn register_netdev(&mut self, name: &str) {
		self.netdevs.push(name.to_string());
	}

	pub(crate) fn netdev_scope(&self, name: &str) -> Option<u32> {
		self.netdevs
			.iter()
			.position(|dev| dev == name)
			.map(|index| index as u32 + 1)
	}

	// ----- settings -------------------------------------------------

	pub fn set_setting(&mut self, name: &str, value: &[u8]) {
		self.settings.insert(name.to_string(), value.to_vec());
	}

	/// Fetch a copy of a stored setting.
	pub fn setting(&self, name: &str) -> Option<Vec<u8>> {
		self.settings.get(name).cloned()
	}

	pub(crate) fn free_memory(&self) -> usize {
		self.mem_budget
	}
}
