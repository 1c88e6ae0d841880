use thiserror::Error;

/// Status codes used throughout the transfer pipeline.
///
/// The pipeline deals in errno-style codes rather than rich error types:
/// a code is cheap to store in per-connection state, travels unchanged
/// through `shutdown()` propagation, and maps directly onto the status
/// codes expected by firmware callers.
#[allow(clippy::upper_case_acronyms)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
	#[error("Operation not permitted")]
	EPERM,
	#[error("No such file or directory")]
	ENOENT,
	#[error("I/O error")]
	EIO,
	#[error("Resource temporarily unavailable")]
	EAGAIN,
	#[error("Out of memory")]
	ENOMEM,
	#[error("Permission denied")]
	EACCES,
	#[error("Device or resource busy")]
	EBUSY,
	#[error("No such device")]
	ENODEV,
	#[error("Invalid argument")]
	EINVAL,
	#[error("Read-only file system")]
	EROFS,
	#[error("Broken pipe")]
	EPIPE,
	#[error("Numerical result out of range")]
	ERANGE,
	#[error("Protocol error")]
	EPROTO,
	#[error("Inappropriate transfer-layer operation")]
	ENOTTY,
	#[error("Operation not supported")]
	ENOTSUP,
	#[error("Address already in use")]
	EADDRINUSE,
	#[error("Network is unreachable")]
	ENETUNREACH,
	#[error("Connection aborted")]
	ECONNABORTED,
	#[error("Connection reset by peer")]
	ECONNRESET,
	#[error("No buffer space available")]
	ENOBUFS,
	#[error("Transport endpoint is already connected")]
	EISCONN,
	#[error("Transport endpoint is not connected")]
	ENOTCONN,
	#[error("Connection timed out")]
	ETIMEDOUT,
	#[error("Connection refused")]
	ECONNREFUSED,
	#[error("Operation in progress")]
	EINPROGRESS,
	#[error("Operation canceled")]
	ECANCELED,
}

pub type Result<T> = core::result::Result<T, Errno>;

/// Completion status carried by `close()` notifications.
///
/// `Ok(())` is a graceful close; anything else names the first error
/// observed on the path (the first non-`Ok` status wins, per the
/// propagation rules).
pub type Status = Result<()>;
