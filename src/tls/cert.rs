//! Certificate utilities: self-signed generation, fingerprints and
//! RFC 2253 name rendering.

use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rand::rand_bytes;
use openssl::rsa::Rsa;
use openssl::x509::{X509Name, X509NameRef, X509PurposeId, X509Ref, X509};

use crate::error::{Error, Result};

/// Digest algorithms accepted for certificate fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fingerprint {
    /// 20-byte output.
    Sha1,
    /// 32-byte output.
    Sha256,
}

impl Fingerprint {
    fn digest(&self) -> MessageDigest {
        match self {
            Fingerprint::Sha1 => MessageDigest::sha1(),
            Fingerprint::Sha256 => MessageDigest::sha256(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Fingerprint::Sha1 => 20,
            Fingerprint::Sha256 => 32,
        }
    }
}

/// Writes the certificate digest into `out`, returning the digest length.
///
/// An output buffer shorter than the digest fails with `Overflow` and is
/// left untouched.
pub(crate) fn fingerprint_into(cert: &X509Ref, alg: Fingerprint, out: &mut [u8]) -> Result<usize> {
    let digest = cert.digest(alg.digest())?;
    if out.len() < digest.len() {
        return Err(Error::Overflow);
    }
    out[..digest.len()].copy_from_slice(&digest);
    Ok(digest.len())
}

const YEAR_SECS: i64 = 31_536_000;

pub(crate) fn generate_rsa(cn: &str, bits: u32) -> Result<(X509, PKey<Private>)> {
    let rsa = Rsa::generate(bits)?;
    let key = PKey::from_rsa(rsa)?;
    let cert = self_signed(cn, &key)?;
    Ok((cert, key))
}

pub(crate) fn generate_ec(cn: &str, curve: &str) -> Result<(X509, PKey<Private>)> {
    let group = EcGroup::from_curve_name(curve_nid(curve)?)?;
    let ec = EcKey::generate(&group)?;
    let key = PKey::from_ec_key(ec)?;
    let cert = self_signed(cn, &key)?;
    Ok((cert, key))
}

/// X.509 v3, subject = issuer = a single CN, random 32-bit serial,
/// valid from one year ago to ten years out, SHA-256 signature.
fn self_signed(cn: &str, key: &PKey<Private>) -> Result<X509> {
    let mut name = X509Name::builder()?;
    name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;

    let mut serial = [0u8; 4];
    rand_bytes(&mut serial)?;
    let serial = BigNum::from_u32(u32::from_be_bytes(serial))?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;

    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::BadArgument)?
        .as_secs() as i64;
    let not_before = Asn1Time::from_unix((now - YEAR_SECS) as libc::time_t)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::from_unix((now + 10 * YEAR_SECS) as libc::time_t)?;
    builder.set_not_after(&not_after)?;

    builder.set_pubkey(key)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

pub(crate) fn curve_nid(name: &str) -> Result<Nid> {
    match name {
        "prime256v1" | "secp256r1" | "P-256" => Ok(Nid::X9_62_PRIME256V1),
        "secp384r1" | "P-384" => Ok(Nid::SECP384R1),
        "secp521r1" | "P-521" => Ok(Nid::SECP521R1),
        "secp256k1" => Ok(Nid::SECP256K1),
        _ => Err(Error::NotSupported),
    }
}

/// Maps a verification-purpose short name onto the library id.
pub(crate) fn purpose_id(name: &str) -> Result<X509PurposeId> {
    match name {
        "any" => Ok(X509PurposeId::ANY),
        "sslclient" => Ok(X509PurposeId::SSL_CLIENT),
        "sslserver" => Ok(X509PurposeId::SSL_SERVER),
        "nssslserver" => Ok(X509PurposeId::NS_SSL_SERVER),
        "smimesign" => Ok(X509PurposeId::SMIME_SIGN),
        "smimeencrypt" => Ok(X509PurposeId::SMIME_ENCRYPT),
        "crlsign" => Ok(X509PurposeId::CRL_SIGN),
        "ocsphelper" => Ok(X509PurposeId::OCSP_HELPER),
        "timestampsign" => Ok(X509PurposeId::TIMESTAMP_SIGN),
        _ => Err(Error::NotSupported),
    }
}

/// Renders a name in RFC 2253 form: attributes in reverse order, joined by
/// commas, with the special characters escaped.
pub(crate) fn format_rfc2253(name: &X509NameRef) -> String {
    let mut parts: Vec<String> = name
        .entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("UNKNOWN");
            let value = match entry.data().as_utf8() {
                Ok(s) => s.to_string(),
                Err(_) => String::from_utf8_lossy(entry.data().as_slice()).into_owned(),
            };
            format!("{}={}", key, escape_rfc2253(&value))
        })
        .collect();
    parts.reverse();
    parts.join(",")
}

fn escape_rfc2253(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (i, c) in value.char_indices() {
        let escape = match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' => true,
            '#' | ' ' if i == 0 => true,
            ' ' if i + 1 == value.len() => true,
            _ => false,
        };
        if escape {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_rsa_round_trip() {
        let (cert, _key) = generate_rsa("x", 2048).unwrap();

        let subject = format_rfc2253(cert.subject_name());
        assert!(subject.contains("CN=x"), "subject was {:?}", subject);
        assert_eq!(subject, format_rfc2253(cert.issuer_name()));

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(fingerprint_into(&cert, Fingerprint::Sha256, &mut a).unwrap(), 32);
        assert_eq!(fingerprint_into(&cert, Fingerprint::Sha256, &mut b).unwrap(), 32);
        assert_eq!(a, b);

        let mut sha1 = [0u8; 20];
        assert_eq!(fingerprint_into(&cert, Fingerprint::Sha1, &mut sha1).unwrap(), 20);
    }

    #[test]
    fn self_signed_ec() {
        let (cert, _key) = generate_ec("dtls.local", "prime256v1").unwrap();
        assert!(format_rfc2253(cert.subject_name()).contains("CN=dtls.local"));

        assert!(matches!(
            generate_ec("x", "not-a-curve"),
            Err(Error::NotSupported)
        ));
    }

    #[test]
    fn short_buffer_is_overflow_and_untouched() {
        let (cert, _key) = generate_ec("x", "prime256v1").unwrap();
        let mut out = [0xaau8; 16];
        assert!(matches!(
            fingerprint_into(&cert, Fingerprint::Sha256, &mut out),
            Err(Error::Overflow)
        ));
        assert_eq!(out, [0xaau8; 16]);
    }

    #[test]
    fn rfc2253_escaping() {
        assert_eq!(escape_rfc2253("plain"), "plain");
        assert_eq!(escape_rfc2253("a,b"), "a\\,b");
        assert_eq!(escape_rfc2253(" lead"), "\\ lead");
        assert_eq!(escape_rfc2253("trail "), "trail\\ ");
        assert_eq!(escape_rfc2253("#hash"), "\\#hash");
        assert_eq!(escape_rfc2253("q+r;s"), "q\\+r\\;s");
    }

    #[test]
    fn purpose_names() {
        assert!(purpose_id("sslserver").is_ok());
        assert!(purpose_id("sslclient").is_ok());
        assert!(matches!(purpose_id("bogus"), Err(Error::NotSupported)));
    }
}
