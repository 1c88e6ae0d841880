//! Certificate-status plumbing built on a minimal DER layer.
//!
//! Actual cryptographic primitives and X.509 chain logic live behind
//! the [`ocsp::OcspVerifier`] seam.

pub mod asn1;
pub mod ocsp;
