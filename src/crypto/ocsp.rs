//! Online Certificate Status Protocol client checks.
//!
//! Builds the DER request for one certificate, derives the GET URI for
//! the responder, and validates the response: status, type, certID
//! identity, certStatus, validity window and signature. The public-key
//! and X.509 heavy lifting stays behind [`OcspVerifier`]; this module
//! owns only the protocol.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::crypto::asn1::{self, Cursor};
use crate::errno::{Errno, Result};
use crate::uri::encode_fragment;

/// Certificate material the protocol needs; everything else stays with
/// the verifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Certificate {
	pub subject_name: String,
	/// Raw DER of this certificate's issuer Name.
	pub raw_issuer: Vec<u8>,
	/// Raw serial number TLV.
	pub raw_serial: Vec<u8>,
	/// Contents of the subjectPublicKey BIT STRING.
	pub raw_public_key: Vec<u8>,
	/// Responder URI from the authority information access extension.
	pub ocsp_uri: Option<String>,
	/// Whether the certificate carries the OCSP-signing extended key
	/// usage.
	pub ocsp_signing: bool,
}

/// Black-box seam to the cryptographic and X.509 machinery.
pub trait OcspVerifier {
	fn parse_certificate(&self, der: &[u8]) -> Result<Certificate>;

	/// Verify `signature` over `tbs` against the signer's public key,
	/// under the given raw AlgorithmIdentifier.
	fn verify_signature(
		&self,
		signer: &Certificate,
		algorithm: &[u8],
		tbs: &[u8],
		signature: &[u8],
	) -> Result<()>;

	/// Validate `cert` as directly issued by `issuer` at `time`.
	fn validate(&self, cert: &Certificate, issuer: &Certificate, time: i64) -> Result<()>;
}

/// Tolerated clock skew when checking the validity window.
const OCSP_ERROR_MARGIN: i64 = 12 * 60 * 60;

/// SHA-1 AlgorithmIdentifier contents: OID 1.3.14.3.2.26 plus NULL
/// parameters.
const SHA1_ALGORITHM: [u8; 9] = [0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00];

/// OID 1.3.6.1.5.5.7.48.1.1 (id-pkix-ocsp-basic).
const OID_BASIC_RESPONSE: [u8; 9] = [0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];

const STATUS_SUCCESSFUL: u8 = 0;

/// Parsed response state.
#[derive(Debug, Default)]
struct OcspResponse {
	/// Raw tbsResponseData, as signed.
	tbs: Vec<u8>,
	/// Raw signature AlgorithmIdentifier TLV.
	algorithm: Vec<u8>,
	/// Signature value (integral BIT STRING contents).
	signature: Vec<u8>,
	this_update: i64,
	next_update: Option<i64>,
	/// Embedded responder certificate, if any.
	signer_der: Option<Vec<u8>>,
}

/// One in-flight OCSP check.
#[derive(Debug)]
pub struct OcspCheck {
	cert: Certificate,
	issuer: Certificate,
	request: Vec<u8>,
	/// The request's CertID TLV, for the byte-exact identity check.
	cert_id: Vec<u8>,
	uri: String,
	response: Option<OcspResponse>,
}

impl OcspCheck {
	/// Prepare a check of `cert` against its `issuer`.
	pub fn new(cert: Certificate, issuer: Certificate) -> Result<OcspCheck> {
		let Some(base_uri) = cert.ocsp_uri.clone() else {
			debug!("OCSP \"{}\" has no responder URI", cert.subject_name);
			return Err(Errno::ENOTTY);
		};

		let name_digest = Sha1::digest(&cert.raw_issuer);
		let key_digest = Sha1::digest(&issuer.raw_public_key);

		let mut builder = asn1::Builder::new();
		builder.prepend_raw(&cert.raw_serial);
		builder.prepend(asn1::OCTET_STRING, key_digest.as_slice());
		builder.prepend(asn1::OCTET_STRING, name_digest.as_slice());
		builder.prepend(asn1::SEQUENCE, &SHA1_ALGORITHM);
		builder.wrap(asn1::SEQUENCE); // CertID
		builder.wrap(asn1::SEQUENCE); // Request
		builder.wrap(asn1::SEQUENCE); // requestList
		builder.wrap(asn1::SEQUENCE); // TBSRequest
		builder.wrap(asn1::SEQUENCE); // OCSPRequest
		let request = builder.into_bytes();

		// Locate the CertID for comparison against the response
		let mut cert_id = Cursor::new(&request);
		cert_id.enter(asn1::SEQUENCE)?;
		cert_id.enter(asn1::SEQUENCE)?;
		cert_id.enter(asn1::SEQUENCE)?;
		cert_id.enter(asn1::SEQUENCE)?;
		cert_id.shrink_any()?;
		let cert_id = cert_id.bytes().to_vec();

		let uri = format!(
			"{}/{}",
			base_uri.trim_end_matches('/'),
			encode_fragment(&BASE64.encode(&request))
		);
		trace!("OCSP \"{}\" URI is {uri}", cert.subject_name);

		Ok(OcspCheck {
			cert,
			issuer,
			request,
			cert_id,
			uri,
			response: None,
		})
	}

	/// GET URI for the responder.
	pub fn uri(&self) -> &str {
		&self.uri
	}

	pub fn request(&self) -> &[u8] {
		&self.request
	}

	fn parse_response_status(&self, raw: &Cursor<'_>) -> Result<()> {
		let mut cursor = *raw;
		cursor.enter(asn1::ENUMERATED)?;
		let &[status] = cursor.bytes() else {
			debug!("OCSP \"{}\" invalid status", self.cert.subject_name);
			return Err(Errno::EINVAL);
		};
		if status != STATUS_SUCCESSFUL {
			debug!(
				"OCSP \"{}\" response status {status}",
				self.cert.subject_name
			);
			return Err(Errno::EPROTO);
		}
		Ok(())
	}

	fn parse_response_type(&self, raw: &Cursor<'_>) -> Result<()> {
		let mut cursor = *raw;
		cursor.enter(asn1::OID)?;
		if cursor.bytes() != OID_BASIC_RESPONSE {
			debug!(
				"OCSP \"{}\" response type not supported",
				self.cert.subject_name
			);
			return Err(Errno::ENOTSUP);
		}
		Ok(())
	}

	fn parse_cert_id(&self, raw: &Cursor<'_>) -> Result<()> {
		let mut cursor = *raw;
		cursor.shrink_any()?;
		if cursor.bytes() != self.cert_id {
			debug!("OCSP \"{}\" certID mismatch", self.cert.subject_name);
			return Err(Errno::EACCES);
		}
		Ok(())
	}

	fn parse_responses(&self, raw: &Cursor<'_>, response: &mut OcspResponse) -> Result<()> {
		let mut cursor = *raw;
		cursor.enter(asn1::SEQUENCE)?;
		// First (and only interesting) SingleResponse
		cursor.enter(asn1::SEQUENCE)?;

		self.parse_cert_id(&cursor)?;
		cursor.skip_any()?;

		// Anything other than an implicitly-tagged "good" is a failure
		if cursor.tag()? != asn1::implicit_tag(0) {
			debug!("OCSP \"{}\" non-good certStatus", self.cert.subject_name);
			return Err(Errno::EACCES);
		}
		cursor.skip_any()?;

		response.this_update = cursor.generalized_time()?;
		cursor.skip_any()?;

		if cursor.tag() == Ok(asn1::explicit_tag(0)) {
			let mut next = cursor;
			next.enter(asn1::explicit_tag(0))?;
			response.next_update = Some(next.generalized_time()?);
		} else {
			// Without nextUpdate the response could be replayed forever;
			// treat it as expiring immediately
			response.next_update = None;
		}
		Ok(())
	}

	fn parse_tbs_response_data(&self, raw: &Cursor<'_>, response: &mut OcspResponse) -> Result<()> {
		let mut cursor = *raw;
		cursor.shrink_any()?;
		response.tbs = cursor.bytes().to_vec();

		cursor.enter(asn1::SEQUENCE)?;
		cursor.skip_if_exists(asn1::explicit_tag(0)); // version
		cursor.skip_any()?; // responderID
		cursor.skip_any()?; // producedAt
		self.parse_responses(&cursor, response)
	}

	fn parse_certs(&self, raw: &Cursor<'_>, response: &mut OcspResponse) -> Result<()> {
		let mut cursor = *raw;
		cursor.enter(asn1::explicit_tag(0))?;
		cursor.enter(asn1::SEQUENCE)?;
		if !cursor.is_empty() {
			cursor.shrink_any()?;
			response.signer_der = Some(cursor.bytes().to_vec());
		}
		Ok(())
	}

	fn parse_basic_response(&self, raw: &Cursor<'_>, response: &mut OcspResponse) -> Result<()> {
		let mut cursor = *raw;
		cursor.enter(asn1::SEQUENCE)?;

		self.parse_tbs_response_data(&cursor, response)?;
		cursor.skip_any()?;

		// signatureAlgorithm, kept raw for the verifier
		let mut algorithm = cursor;
		algorithm.shrink_any()?;
		response.algorithm = algorithm.bytes().to_vec();
		cursor.skip_any()?;

		// signature BIT STRING must be integral (zero unused bits)
		let mut signature = cursor;
		signature.enter(asn1::BIT_STRING)?;
		let bits = signature.bytes();
		let (&unused, value) = bits.split_first().ok_or(Errno::EINVAL)?;
		if unused != 0 {
			return Err(Errno::EINVAL);
		}
		response.signature = value.to_vec();
		cursor.skip_any()?;

		if cursor.tag() == Ok(asn1::explicit_tag(0)) {
			self.parse_certs(&cursor, response)?;
		}
		Ok(())
	}

	/// Ingest the responder's answer.
	pub fn response(&mut self, data: &[u8]) -> Result<()> {
		let mut cursor = Cursor::new(data);
		cursor.enter(asn1::SEQUENCE)?;

		self.parse_response_status(&cursor)?;
		cursor.skip_any()?;

		// responseBytes
		cursor.enter(asn1::explicit_tag(0))?;
		cursor.enter(asn1::SEQUENCE)?;
		self.parse_response_type(&cursor)?;
		cursor.skip_any()?;
		cursor.enter(asn1::OCTET_STRING)?;

		let mut response = OcspResponse::default();
		self.parse_basic_response(&cursor, &mut response)?;
		self.response = Some(response);
		Ok(())
	}

	/// Validate the ingested response at `time`.
	pub fn validate(&self, time: i64, verifier: &dyn OcspVerifier) -> Result<()> {
		let response = self.response.as_ref().ok_or(Errno::EINVAL)?;

		// Responder certificate: the issuer itself, or a delegate the
		// issuer signed that carries the OCSP-signing key usage.
		let signer = match &response.signer_der {
			Some(der) => verifier.parse_certificate(der)?,
			None => self.issuer.clone(),
		};
		if signer != self.issuer {
			verifier.validate(&signer, &self.issuer, time)?;
			if !signer.ocsp_signing {
				debug!(
					"OCSP \"{}\" signer \"{}\" is not an OCSP-signing certificate",
					self.cert.subject_name, signer.subject_name
				);
				return Err(Errno::EACCES);
			}
		}

		verifier.verify_signature(&signer, &response.algorithm, &response.tbs, &response.signature)?;

		// Validity window, allowing for clock error
		if response.this_update > time + OCSP_ERROR_MARGIN {
			debug!(
				"OCSP \"{}\" response is not yet valid",
				self.cert.subject_name
			);
			return Err(Errno::EACCES);
		}
		let next_update = response.next_update.unwrap_or(time);
		if next_update < time - OCSP_ERROR_MARGIN {
			debug!("OCSP \"{}\" response is stale", self.cert.subject_name);
			return Err(Errno::EACCES);
		}

		// Finally validate the certificate itself against its issuer
		verifier.validate(&self.cert, &self.issuer, time)?;
		debug!(
			"OCSP \"{}\" successfully validated using \"{}\"",
			self.cert.subject_name, signer.subject_name
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::asn1::tlv;

	struct FakeVerifier {
		chain_ok: bool,
	}

	impl OcspVerifier for FakeVerifier {
		fn parse_certificate(&self, der: &[u8]) -> Result<Certificate> {
			let mut cursor = Cursor::new(der);
			cursor.enter(asn1::SEQUENCE)?;
			Ok(Certificate {
				subject_name: "responder".into(),
				ocsp_signing: cursor.bytes().first() == Some(&1),
				..Default::default()
			})
		}

		fn verify_signature(
			&self,
			_signer: &Certificate,
			_algorithm: &[u8],
			_tbs: &[u8],
			signature: &[u8],
		) -> Result<()> {
			if signature == b"good-sig" {
				Ok(())
			} else {
				Err(Errno::EACCES)
			}
		}

		fn validate(&self, _cert: &Certificate, _issuer: &Certificate, _time: i64) -> Result<()> {
			if self.chain_ok {
				Ok(())
			} else {
				Err(Errno::EACCES)
			}
		}
	}

	fn cert_pair() -> (Certificate, Certificate) {
		let cert = Certificate {
			subject_name: "boot.example.org".into(),
			raw_issuer: tlv(asn1::SEQUENCE, b"Test CA"),
			raw_serial: tlv(0x02, &[0x42]),
			raw_public_key: vec![0x01, 0x02, 0x03],
			ocsp_uri: Some("http://ocsp.example.com/".into()),
			ocsp_signing: false,
		};
		let issuer = Certificate {
			subject_name: "Test CA".into(),
			raw_issuer: tlv(asn1::SEQUENCE, b"Root"),
			raw_serial: tlv(0x02, &[0x01]),
			raw_public_key: vec![0xaa, 0xbb],
			ocsp_uri: None,
			ocsp_signing: false,
		};
		(cert, issuer)
	}

	fn check() -> OcspCheck {
		let (cert, issuer) = cert_pair();
		OcspCheck::new(cert, issuer).unwrap()
	}

	/// The moment the canned responses declare as thisUpdate.
	const THIS_UPDATE: &[u8] = b"20260801000000Z";
	const NEXT_UPDATE: &[u8] = b"20270801000000Z";
	const NOW: i64 = 1_785_542_400 + 60; // shortly after thisUpdate

	fn single_response(cert_id: &[u8], status_tag: u8) -> Vec<u8> {
		let mut single = Vec::new();
		single.extend_from_slice(cert_id);
		single.extend_from_slice(&tlv(status_tag, &[]));
		single.extend_from_slice(&tlv(asn1::GENERALIZED_TIME, THIS_UPDATE));
		single.extend_from_slice(&tlv(
			asn1::explicit_tag(0),
			&tlv(asn1::GENERALIZED_TIME, NEXT_UPDATE),
		));
		tlv(asn1::SEQUENCE, &single)
	}

	fn basic_response(cert_id: &[u8], status_tag: u8, signature: &[u8], signer: Option<&[u8]>) -> Vec<u8> {
		let responses = tlv(asn1::SEQUENCE, &single_response(cert_id, status_tag));
		let mut tbs = Vec::new();
		tbs.extend_from_slice(&tlv(0x06, &[0x2a])); // responderID stand-in
		tbs.extend_from_slice(&tlv(asn1::GENERALIZED_TIME, THIS_UPDATE)); // producedAt
		tbs.extend_from_slice(&responses);
		let tbs = tlv(asn1::SEQUENCE, &tbs);

		let mut basic = Vec::new();
		basic.extend_from_slice(&tbs);
		basic.extend_from_slice(&tlv(asn1::SEQUENCE, &SHA1_ALGORITHM)); // signatureAlgorithm
		let mut bit_string = vec![0u8];
		bit_string.extend_from_slice(signature);
		basic.extend_from_slice(&tlv(asn1::BIT_STRING, &bit_string));
		if let Some(signer) = signer {
			let certs = tlv(asn1::SEQUENCE, signer);
			basic.extend_from_slice(&tlv(asn1::explicit_tag(0), &certs));
		}
		tlv(asn1::SEQUENCE, &basic)
	}

	fn full_response(basic: &[u8]) -> Vec<u8> {
		let mut bytes = Vec::new();
		bytes.extend_from_slice(&tlv(asn1::OID, &OID_BASIC_RESPONSE));
		bytes.extend_from_slice(&tlv(asn1::OCTET_STRING, basic));
		let response_bytes = tlv(asn1::explicit_tag(0), &tlv(asn1::SEQUENCE, &bytes));

		let mut out = Vec::new();
		out.extend_from_slice(&tlv(asn1::ENUMERATED, &[STATUS_SUCCESSFUL]));
		out.extend_from_slice(&response_bytes);
		tlv(asn1::SEQUENCE, &out)
	}

	#[test]
	fn request_and_uri() {
		let check = check();
		// CertID: hashAlgorithm, issuerNameHash, issuerKeyHash, serial
		let mut cursor = Cursor::new(check.request());
		for _ in 0..4 {
			cursor.enter(asn1::SEQUENCE).unwrap();
		}
		cursor.enter(asn1::SEQUENCE).unwrap();
		cursor.skip(asn1::SEQUENCE).unwrap();
		let mut name_hash = cursor;
		name_hash.enter(asn1::OCTET_STRING).unwrap();
		assert_eq!(name_hash.bytes().len(), 20);
		assert_eq!(
			name_hash.bytes(),
			Sha1::digest(tlv(asn1::SEQUENCE, b"Test CA")).as_slice()
		);

		assert!(check.uri().starts_with("http://ocsp.example.com/"));
		// The base64 request is percent-encoded into a single path element
		assert!(!check.uri()[25..].contains('+'));
	}

	#[test]
	fn missing_responder_uri() {
		let (mut cert, issuer) = cert_pair();
		cert.ocsp_uri = None;
		assert_eq!(OcspCheck::new(cert, issuer).unwrap_err(), Errno::ENOTTY);
	}

	#[test]
	fn good_response_validates() {
		let mut check = check();
		let basic = basic_response(&check.cert_id.clone(), asn1::implicit_tag(0), b"good-sig", None);
		check.response(&full_response(&basic)).unwrap();
		check
			.validate(NOW, &FakeVerifier { chain_ok: true })
			.unwrap();
	}

	#[test]
	fn non_good_status_is_rejected() {
		let mut check = check();
		// certStatus "revoked" carries implicit tag 1
		let basic = basic_response(&check.cert_id.clone(), asn1::implicit_tag(1), b"good-sig", None);
		assert_eq!(check.response(&full_response(&basic)).unwrap_err(), Errno::EACCES);
	}

	#[test]
	fn cert_id_mismatch_is_rejected() {
		let mut check = check();
		let other = tlv(asn1::SEQUENCE, b"some other certificate id");
		let basic = basic_response(&other, asn1::implicit_tag(0), b"good-sig", None);
		assert_eq!(check.response(&full_response(&basic)).unwrap_err(), Errno::EACCES);
	}

	#[test]
	fn unsuccessful_status_is_a_protocol_error() {
		let mut check = check();
		let mut out = Vec::new();
		out.extend_from_slice(&tlv(asn1::ENUMERATED, &[3])); // tryLater
		assert_eq!(
			check.response(&tlv(asn1::SEQUENCE, &out)).unwrap_err(),
			Errno::EPROTO
		);
	}

	#[test]
	fn bad_signature_is_rejected() {
		let mut check = check();
		let basic = basic_response(&check.cert_id.clone(), asn1::implicit_tag(0), b"evil-sig", None);
		check.response(&full_response(&basic)).unwrap();
		assert_eq!(
			check
				.validate(NOW, &FakeVerifier { chain_ok: true })
				.unwrap_err(),
			Errno::EACCES
		);
	}

	#[test]
	fn stale_response_is_rejected() {
		let mut check = check();
		let basic = basic_response(&check.cert_id.clone(), asn1::implicit_tag(0), b"good-sig", None);
		check.response(&full_response(&basic)).unwrap();
		// Far beyond nextUpdate plus the error margin
		let late = NOW + 2 * 365 * 24 * 60 * 60;
		assert_eq!(
			check
				.validate(late, &FakeVerifier { chain_ok: true })
				.unwrap_err(),
			Errno::EACCES
		);
	}

	#[test]
	fn delegated_signer_needs_ocsp_signing_usage() {
		let mut check = check();
		// Embedded responder certificate without the key usage
		let plain = tlv(asn1::SEQUENCE, &[0]);
		let basic = basic_response(&check.cert_id.clone(), asn1::implicit_tag(0), b"good-sig", Some(&plain));
		check.response(&full_response(&basic)).unwrap();
		assert_eq!(
			check
				.validate(NOW, &FakeVerifier { chain_ok: true })
				.unwrap_err(),
			Errno::EACCES
		);

		// With the usage bit the delegate is acceptable
		let mut check = self::check();
		let signing = tlv(asn1::SEQUENCE, &[1]);
		let basic = basic_response(&check.cert_id.clone(), asn1::implicit_tag(0), b"good-sig", Some(&signing));
		check.response(&full_response(&basic)).unwrap();
		check
			.validate(NOW, &FakeVerifier { chain_ok: true })
			.unwrap();

		// A delegate the issuer never signed is rejected outright
		let mut check = self::check();
		let basic = basic_response(&check.cert_id.clone(), asn1::implicit_tag(0), b"good-sig", Some(&signing));
		check.response(&full_response(&basic)).unwrap();
		assert_eq!(
			check
				.validate(NOW, &FakeVerifier { chain_ok: false })
				.unwrap_err(),
			Errno::EACCES
		);
	}
}
