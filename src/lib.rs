//! A URI-dispatched data-transfer pipeline for network boot.
//!
//! A transfer is a chain of stateful filters connected by a uniform
//! message interface: a consumer opens a URI, the opener registry
//! stacks the matching protocol object on top of a transport socket,
//! and bytes or block commands flow through the chain. Everything runs
//! on one cooperative scheduler owned by a [`Runtime`] aggregate; there
//! are no threads and no globals.
//!
//! The crate ends at two seams: [`net::NetBackend`] below (IP and the
//! link layer) and [`efi::Firmware`] above (boot services), so the
//! whole stack is exercisable on any host.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod crypto;
pub mod efi;
mod errno;
pub mod iobuf;
pub mod net;
pub mod runtime;
pub mod socket;
pub mod uri;
pub mod util;
pub mod xfer;

pub use crate::errno::{Errno, Result, Status};
pub use crate::runtime::Runtime;
