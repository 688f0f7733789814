//! TLS/DTLS context and connection management with session reuse.
//!
//! A [`TlsContext`] is a credential container: certificate and key, trust
//! material, verification policy, cipher and protocol bounds, SRTP profile
//! list, and a session cache keyed by peer address. Connections are created
//! from the context over any `Read + Write` transport; a connected UDP
//! wrapper for datagram TLS is in [`crate::net`].
//!
//! Every failing library call surfaces as [`Error::Tls`], which carries the
//! drained error queue; nothing is left behind to poison later calls.

mod cache;
mod cert;

pub use cert::Fingerprint;

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use openssl::ec::EcKey;
use openssl::ex_data::Index;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::srtp::SrtpProfileId;
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslFiletype, SslMethod, SslOptions, SslRef,
    SslSessionCacheMode, SslSessionRef, SslStream, SslVerifyMode, SslVersion,
};
use openssl::x509::store::X509Lookup;
use openssl::x509::verify::X509CheckFlags;
use openssl::x509::{CrlStatus, X509Crl, X509PurposeId, X509Ref, X509VerifyResult, X509};

use crate::error::{Error, Result};
use cache::SessionCache;

/// Handshake transport family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMethod {
    /// Stream TLS.
    Tls,
    /// Datagram TLS.
    Dtls,
}

/// Protocol version bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
    Dtls10,
    Dtls12,
}

impl TlsVersion {
    fn raw(self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
            TlsVersion::Dtls10 => SslVersion::DTLS1,
            TlsVersion::Dtls12 => SslVersion::DTLS1_2,
        }
    }
}

/// Private key encodings accepted by [`TlsContext::set_certificate_der`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Ec,
}

/// SRTP protection profiles negotiable over DTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpSuite {
    AesCm128HmacSha1_80,
    AesCm128HmacSha1_32,
    AeadAes128Gcm,
    AeadAes256Gcm,
}

impl SrtpSuite {
    /// Suite name as used in SDP.
    pub fn name(&self) -> &'static str {
        match self {
            SrtpSuite::AesCm128HmacSha1_80 => "AES_CM_128_HMAC_SHA1_80",
            SrtpSuite::AesCm128HmacSha1_32 => "AES_CM_128_HMAC_SHA1_32",
            SrtpSuite::AeadAes128Gcm => "AES_128_GCM",
            SrtpSuite::AeadAes256Gcm => "AES_256_GCM",
        }
    }

    fn profile_name(&self) -> &'static str {
        match self {
            SrtpSuite::AesCm128HmacSha1_80 => "SRTP_AES128_CM_SHA1_80",
            SrtpSuite::AesCm128HmacSha1_32 => "SRTP_AES128_CM_SHA1_32",
            SrtpSuite::AeadAes128Gcm => "SRTP_AEAD_AES_128_GCM",
            SrtpSuite::AeadAes256Gcm => "SRTP_AEAD_AES_256_GCM",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            SrtpSuite::AesCm128HmacSha1_80
            | SrtpSuite::AesCm128HmacSha1_32
            | SrtpSuite::AeadAes128Gcm => 16,
            SrtpSuite::AeadAes256Gcm => 32,
        }
    }

    pub fn salt_len(&self) -> usize {
        match self {
            SrtpSuite::AesCm128HmacSha1_80 | SrtpSuite::AesCm128HmacSha1_32 => 14,
            SrtpSuite::AeadAes128Gcm | SrtpSuite::AeadAes256Gcm => 12,
        }
    }

    fn from_profile(id: SrtpProfileId) -> Result<SrtpSuite> {
        if id == SrtpProfileId::SRTP_AES128_CM_SHA1_80 {
            Ok(SrtpSuite::AesCm128HmacSha1_80)
        } else if id == SrtpProfileId::SRTP_AES128_CM_SHA1_32 {
            Ok(SrtpSuite::AesCm128HmacSha1_32)
        } else if id == SrtpProfileId::SRTP_AEAD_AES_128_GCM {
            Ok(SrtpSuite::AeadAes128Gcm)
        } else if id == SrtpProfileId::SRTP_AEAD_AES_256_GCM {
            Ok(SrtpSuite::AeadAes256Gcm)
        } else {
            Err(Error::NotSupported)
        }
    }
}

/// Keying material exported after a DTLS-SRTP handshake.
///
/// Each side's material is `key || salt` of the negotiated suite's sizes.
pub struct SrtpKeyInfo {
    pub suite: SrtpSuite,
    pub client: Vec<u8>,
    pub server: Vec<u8>,
}

const SRTP_EXPORT_LABEL: &str = "EXTRACTOR-dtls_srtp";

/// Conservative datagram payload size for handshake flights.
const DTLS_MTU: u32 = 1200;

fn peer_index() -> Index<Ssl, SocketAddr> {
    static INDEX: OnceLock<Index<Ssl, SocketAddr>> = OnceLock::new();
    *INDEX.get_or_init(|| Ssl::new_ex_index().expect("ssl ex-data index"))
}

/// Resumption stays on 1.2 and below; 1.3 tickets are single-use and are
/// not worth a per-peer slot.
fn session_resumable(ssl: &SslRef, _session: &SslSessionRef) -> bool {
    ssl.version_str() != "TLSv1.3"
}

struct CrlSet {
    crls: Mutex<Vec<X509Crl>>,
}

impl CrlSet {
    fn new() -> CrlSet {
        CrlSet {
            crls: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<X509Crl>> {
        self.crls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, crl: X509Crl) {
        self.lock().push(crl);
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn is_revoked(&self, cert: &X509Ref) -> bool {
        let cert = cert.to_owned();
        self.lock()
            .iter()
            .any(|crl| matches!(crl.get_by_cert(&cert), CrlStatus::Revoked(_)))
    }
}

/// A TLS or DTLS credential container with a per-peer session cache.
///
/// Setters stage configuration; the library context is materialized lazily
/// when the first connection is made and rebuilt after further changes.
/// Connections created earlier keep the context they were built from.
pub struct TlsContext {
    method: TlsMethod,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    cert: Option<X509>,
    key: Option<PKey<Private>>,
    password: Option<String>,
    ca_certs: Vec<X509>,
    ca_path: Option<PathBuf>,
    crls: Arc<CrlSet>,
    purpose: Option<X509PurposeId>,
    verify_server: bool,
    verify_client: bool,
    cipher_list: Option<String>,
    srtp_profiles: Vec<SrtpSuite>,
    reuse_enabled: bool,
    cache: Arc<SessionCache>,
    built: Option<SslContext>,
}

impl TlsContext {
    /// Creates an empty context for the given method.
    ///
    /// Server verification defaults to on; session reuse defaults to off.
    pub fn new(method: TlsMethod) -> TlsContext {
        TlsContext {
            method,
            min_version: None,
            max_version: None,
            cert: None,
            key: None,
            password: None,
            ca_certs: Vec::new(),
            ca_path: None,
            crls: Arc::new(CrlSet::new()),
            purpose: None,
            verify_server: true,
            verify_client: false,
            cipher_list: None,
            srtp_profiles: Vec::new(),
            reuse_enabled: false,
            cache: Arc::new(SessionCache::new()),
            built: None,
        }
    }

    /// Creates a context and loads certificate plus private key from a PEM
    /// file, decrypting the key with `password` when one is supplied.
    pub fn with_keyfile<P: AsRef<Path>>(
        method: TlsMethod,
        keyfile: P,
        password: Option<&str>,
    ) -> Result<TlsContext> {
        let pem = fs::read(keyfile.as_ref()).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::Io(e)
            }
        })?;

        let cert = X509::from_pem(&pem).map_err(|_| Error::BadFormat)?;
        let key = match password {
            Some(pw) => PKey::private_key_from_pem_passphrase(&pem, pw.as_bytes()),
            None => PKey::private_key_from_pem(&pem),
        }
        .map_err(|_| Error::BadFormat)?;

        let mut ctx = TlsContext::new(method);
        ctx.cert = Some(cert);
        ctx.key = Some(key);
        ctx.password = password.map(String::from);
        Ok(ctx)
    }

    pub fn method(&self) -> TlsMethod {
        self.method
    }

    pub fn set_min_version(&mut self, version: Option<TlsVersion>) {
        self.min_version = version;
        self.built = None;
    }

    pub fn set_max_version(&mut self, version: Option<TlsVersion>) {
        self.max_version = version;
        self.built = None;
    }

    /// Ordered cipher list in the library's string format.
    pub fn set_cipher_list(&mut self, ciphers: &str) -> Result<()> {
        if ciphers.is_empty() {
            return Err(Error::BadArgument);
        }
        self.cipher_list = Some(ciphers.to_string());
        self.built = None;
        Ok(())
    }

    /// Adds trusted CA certificates from a PEM file.
    pub fn add_ca_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let pem = fs::read(path.as_ref()).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::Io(e)
            }
        })?;
        let certs = X509::stack_from_pem(&pem).map_err(|_| Error::BadFormat)?;
        if certs.is_empty() {
            return Err(Error::BadFormat);
        }
        self.ca_certs.extend(certs);
        self.built = None;
        Ok(())
    }

    /// Adds a hashed CA directory to the trust store.
    pub fn add_ca_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let meta = fs::metadata(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::Io(e)
            }
        })?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(path.to_path_buf()));
        }
        self.ca_path = Some(path.to_path_buf());
        self.built = None;
        Ok(())
    }

    /// Adds one trusted CA certificate from PEM text.
    pub fn add_ca_pem(&mut self, pem: &[u8]) -> Result<()> {
        let cert = X509::from_pem(pem).map_err(|_| Error::BadFormat)?;
        self.ca_certs.push(cert);
        self.built = None;
        Ok(())
    }

    /// Adds a certificate revocation list from PEM text. Peer certificates
    /// found on any added CRL fail verification.
    pub fn add_crl_pem(&mut self, pem: &[u8]) -> Result<()> {
        let crl = X509Crl::from_pem(pem).map_err(|_| Error::BadFormat)?;
        self.crls.add(crl);
        self.built = None;
        Ok(())
    }

    /// Installs certificate and private key from PEM text; both may live in
    /// the same buffer. An encrypted key is decrypted with the password the
    /// context was created with. Replaces any prior credential.
    pub fn set_certificate_pem(&mut self, pem: &[u8]) -> Result<()> {
        let cert = X509::from_pem(pem).map_err(|_| Error::BadFormat)?;
        let key = match &self.password {
            Some(pw) => PKey::private_key_from_pem_passphrase(pem, pw.as_bytes()),
            None => PKey::private_key_from_pem(pem),
        }
        .map_err(|_| Error::BadFormat)?;
        self.set_certificate(cert, key);
        Ok(())
    }

    /// Installs certificate and private key from DER, with the key encoding
    /// named by `key_type`.
    pub fn set_certificate_der(
        &mut self,
        key_type: KeyType,
        cert: &[u8],
        key: &[u8],
    ) -> Result<()> {
        let cert = X509::from_der(cert).map_err(|_| Error::BadFormat)?;
        let key = match key_type {
            KeyType::Rsa => Rsa::private_key_from_der(key)
                .map_err(|_| Error::BadFormat)
                .and_then(|rsa| PKey::from_rsa(rsa).map_err(Error::from)),
            KeyType::Ec => EcKey::private_key_from_der(key)
                .map_err(|_| Error::BadFormat)
                .and_then(|ec| PKey::from_ec_key(ec).map_err(Error::from)),
        }?;
        self.set_certificate(cert, key);
        Ok(())
    }

    /// Installs a pre-parsed credential. Replaces any prior one.
    pub fn set_certificate(&mut self, cert: X509, key: PKey<Private>) {
        self.cert = Some(cert);
        self.key = Some(key);
        self.built = None;
    }

    /// Generates and installs a self-signed RSA credential for `cn`.
    pub fn generate_self_signed_rsa(&mut self, cn: &str, bits: u32) -> Result<()> {
        let (cert, key) = cert::generate_rsa(cn, bits)?;
        self.set_certificate(cert, key);
        Ok(())
    }

    /// Generates and installs a self-signed EC credential for `cn` on the
    /// named curve.
    pub fn generate_self_signed_ec(&mut self, cn: &str, curve: &str) -> Result<()> {
        let (cert, key) = cert::generate_ec(cn, curve)?;
        self.set_certificate(cert, key);
        Ok(())
    }

    /// Sets the certificate verification purpose by short name
    /// (e.g. `"sslserver"`).
    pub fn set_verify_purpose(&mut self, name: &str) -> Result<()> {
        self.purpose = Some(cert::purpose_id(name)?);
        self.built = None;
        Ok(())
    }

    /// Disables the default verification of server certificates.
    pub fn set_verify_server(&mut self, verify: bool) {
        self.verify_server = verify;
        self.built = None;
    }

    /// Requests a client certificate and accepts any peer; chains are
    /// checked out-of-band (fingerprint flows such as DTLS-SRTP).
    pub fn set_verify_client_trust_all(&mut self, enabled: bool) {
        self.verify_client = enabled;
        self.built = None;
    }

    /// Installs the list of SRTP profiles offered during DTLS handshakes.
    pub fn set_srtp_profiles(&mut self, suites: &[SrtpSuite]) -> Result<()> {
        if suites.is_empty() {
            return Err(Error::BadArgument);
        }
        self.srtp_profiles = suites.to_vec();
        self.built = None;
        Ok(())
    }

    /// Enables or disables the per-peer session cache. Disabling clears it.
    pub fn set_session_reuse(&mut self, enabled: bool) {
        if self.reuse_enabled != enabled {
            self.reuse_enabled = enabled;
            if !enabled {
                self.cache.clear();
            }
            self.built = None;
        }
    }

    pub fn session_reuse(&self) -> bool {
        self.reuse_enabled
    }

    /// Number of cached sessions.
    pub fn session_count(&self) -> usize {
        self.cache.len()
    }

    /// Drops the cached session for one peer.
    pub fn forget_peer(&self, peer: &SocketAddr) -> bool {
        self.cache.remove_peer(peer)
    }

    /// Fingerprint of the local certificate.
    pub fn fingerprint(&self, alg: Fingerprint, out: &mut [u8]) -> Result<usize> {
        let cert = self.cert.as_ref().ok_or(Error::NotFound)?;
        cert::fingerprint_into(cert, alg, out)
    }

    /// PEM encoding of the local certificate, e.g. for handing the trust
    /// anchor of a self-signed credential to the remote side.
    pub fn certificate_pem(&self) -> Result<Vec<u8>> {
        let cert = self.cert.as_ref().ok_or(Error::NotFound)?;
        Ok(cert.to_pem()?)
    }

    /// Subject of the local certificate in RFC 2253 form.
    pub fn subject(&self) -> Result<String> {
        let cert = self.cert.as_ref().ok_or(Error::NotFound)?;
        Ok(cert::format_rfc2253(cert.subject_name()))
    }

    /// Issuer of the local certificate in RFC 2253 form.
    pub fn issuer(&self) -> Result<String> {
        let cert = self.cert.as_ref().ok_or(Error::NotFound)?;
        Ok(cert::format_rfc2253(cert.issuer_name()))
    }

    /// Client-side connection over `stream`. When session reuse is enabled
    /// and a cached session exists for `peer`, it is installed before the
    /// handshake starts.
    pub fn connect<S: Read + Write>(
        &mut self,
        stream: S,
        peer: Option<SocketAddr>,
    ) -> Result<Handshake<S>> {
        let mut conn = self.connection(stream, peer)?;
        if conn.reuse && conn.peer.is_some() {
            match conn.reuse_session() {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        conn.handshake()
    }

    /// Server-side connection over `stream`.
    pub fn accept<S: Read + Write>(&mut self, stream: S) -> Result<Handshake<S>> {
        self.incoming(stream, None)?.handshake()
    }

    /// Builds a client connection without starting the handshake, leaving
    /// room for per-connection settings.
    pub fn connection<S: Read + Write>(
        &mut self,
        stream: S,
        peer: Option<SocketAddr>,
    ) -> Result<TlsConnection<S>> {
        let mut ssl = Ssl::new(self.context()?)?;
        if let Some(peer) = peer {
            ssl.set_ex_data(peer_index(), peer);
        }
        if self.method == TlsMethod::Dtls {
            ssl.set_mtu(DTLS_MTU)?;
        }
        ssl.set_connect_state();
        Ok(TlsConnection {
            ssl,
            stream,
            peer,
            cache: Arc::clone(&self.cache),
            reuse: self.reuse_enabled,
        })
    }

    /// Builds a server connection without starting the handshake.
    pub fn incoming<S: Read + Write>(
        &mut self,
        stream: S,
        peer: Option<SocketAddr>,
    ) -> Result<TlsConnection<S>> {
        let mut ssl = Ssl::new(self.context()?)?;
        if let Some(peer) = peer {
            ssl.set_ex_data(peer_index(), peer);
        }
        if self.method == TlsMethod::Dtls {
            ssl.set_mtu(DTLS_MTU)?;
        }
        ssl.set_accept_state();
        Ok(TlsConnection {
            ssl,
            stream,
            peer,
            cache: Arc::clone(&self.cache),
            reuse: self.reuse_enabled,
        })
    }

    fn context(&mut self) -> Result<&SslContext> {
        if self.built.is_none() {
            self.built = Some(self.build()?);
        }
        match self.built.as_ref() {
            Some(ctx) => Ok(ctx),
            None => Err(Error::NotSupported),
        }
    }

    fn build(&self) -> Result<SslContext> {
        let method = match self.method {
            TlsMethod::Tls => SslMethod::tls(),
            TlsMethod::Dtls => SslMethod::dtls(),
        };
        let mut builder = SslContext::builder(method)?;

        if self.method == TlsMethod::Dtls {
            // the transport is an opaque Read/Write, so the library cannot
            // query a datagram MTU; connections set one explicitly
            builder.set_options(SslOptions::NO_QUERY_MTU);
        }

        builder.set_min_proto_version(self.min_version.map(TlsVersion::raw))?;
        builder.set_max_proto_version(self.max_version.map(TlsVersion::raw))?;

        if let Some(ciphers) = &self.cipher_list {
            builder.set_cipher_list(ciphers)?;
        }

        if let Some(cert) = &self.cert {
            builder.set_certificate(cert)?;
        }
        if let Some(key) = &self.key {
            builder.set_private_key(key)?;
            builder.check_private_key()?;
        }

        for ca in &self.ca_certs {
            builder.cert_store_mut().add_cert(ca.clone())?;
        }
        if let Some(dir) = &self.ca_path {
            let dir = dir.to_str().ok_or(Error::BadArgument)?.to_string();
            let lookup = builder.cert_store_mut().add_lookup(X509Lookup::hash_dir())?;
            lookup.add_dir(&dir, SslFiletype::PEM)?;
        }
        if let Some(purpose) = self.purpose {
            builder.cert_store_mut().set_purpose(purpose)?;
        }

        if self.verify_client {
            builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);
        } else if self.verify_server {
            if self.crls.is_empty() {
                builder.set_verify(SslVerifyMode::PEER);
            } else {
                let crls = Arc::clone(&self.crls);
                builder.set_verify_callback(SslVerifyMode::PEER, move |preverified, ctx| {
                    if !preverified {
                        return false;
                    }
                    match ctx.current_cert() {
                        Some(cert) => !crls.is_revoked(cert),
                        None => true,
                    }
                });
            }
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }

        if !self.srtp_profiles.is_empty() {
            let list = self
                .srtp_profiles
                .iter()
                .map(SrtpSuite::profile_name)
                .collect::<Vec<_>>()
                .join(":");
            builder.set_tlsext_use_srtp(&list)?;
        }

        if self.reuse_enabled {
            builder.set_session_cache_mode(
                SslSessionCacheMode::CLIENT | SslSessionCacheMode::SERVER,
            );
            builder.set_session_id_context(b"muxio")?;

            let cache = Arc::clone(&self.cache);
            builder.set_new_session_callback(move |ssl, session| {
                if !session_resumable(ssl, &session) {
                    return;
                }
                if let Some(peer) = ssl.ex_data(peer_index()).copied() {
                    cache.insert(peer, session);
                }
            });

            let cache = Arc::clone(&self.cache);
            builder.set_remove_session_callback(move |_ctx, session| {
                cache.remove_session(session);
            });
        }

        Ok(builder.build())
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("method", &self.method)
            .field("has_certificate", &self.cert.is_some())
            .field("session_reuse", &self.reuse_enabled)
            .finish()
    }
}

/// A connection that has not started its handshake yet.
pub struct TlsConnection<S> {
    ssl: Ssl,
    stream: S,
    peer: Option<SocketAddr>,
    cache: Arc<SessionCache>,
    reuse: bool,
}

impl<S: Read + Write> TlsConnection<S> {
    /// Enables per-connection server verification against `host`: adds SNI
    /// and strict hostname matching with partial wildcards rejected.
    pub fn set_verify_host(&mut self, host: &str) -> Result<()> {
        self.ssl.set_hostname(host)?;
        let param = self.ssl.param_mut();
        param.set_hostflags(X509CheckFlags::NO_PARTIAL_WILDCARDS);
        param.set_host(host)?;
        self.ssl.set_verify(SslVerifyMode::PEER);
        Ok(())
    }

    /// Turns off certificate verification for this connection only.
    pub fn disable_verify(&mut self) {
        self.ssl.set_verify(SslVerifyMode::NONE);
    }

    /// Installs the cached session for this connection's peer so the
    /// handshake attempts resumption.
    pub fn reuse_session(&mut self) -> Result<()> {
        if !self.reuse {
            return Err(Error::NotSupported);
        }
        let peer = self.peer.ok_or(Error::BadArgument)?;
        let ssl = &mut self.ssl;
        match self
            .cache
            .with_session(&peer, |session| unsafe { ssl.set_session(session) })
        {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::NotFound),
        }
    }

    /// Runs the handshake as far as the transport allows.
    pub fn handshake(self) -> Result<Handshake<S>> {
        let TlsConnection {
            ssl,
            stream,
            peer,
            cache,
            reuse,
        } = self;
        let stream = SslStream::new(ssl, stream)?;
        drive_handshake(stream, peer, cache, reuse)
    }
}

/// Result of driving a handshake over a possibly nonblocking transport.
pub enum Handshake<S> {
    Complete(TlsStream<S>),
    /// The transport would block; resume with
    /// [`MidHandshakeTlsStream::handshake`] once it is ready again.
    WouldBlock(MidHandshakeTlsStream<S>),
}

impl<S> Handshake<S> {
    /// Unwraps the completed stream, failing with `Transient` if the
    /// handshake still wants I/O.
    pub fn complete(self) -> Result<TlsStream<S>> {
        match self {
            Handshake::Complete(stream) => Ok(stream),
            Handshake::WouldBlock(_) => Err(Error::Transient),
        }
    }
}

pub struct MidHandshakeTlsStream<S> {
    inner: SslStream<S>,
    peer: Option<SocketAddr>,
    cache: Arc<SessionCache>,
    reuse: bool,
}

impl<S: Read + Write> MidHandshakeTlsStream<S> {
    pub fn get_ref(&self) -> &S {
        self.inner.get_ref()
    }

    /// Continues the handshake.
    pub fn handshake(self) -> Result<Handshake<S>> {
        let MidHandshakeTlsStream {
            inner,
            peer,
            cache,
            reuse,
        } = self;
        drive_handshake(inner, peer, cache, reuse)
    }
}

fn drive_handshake<S: Read + Write>(
    mut stream: SslStream<S>,
    peer: Option<SocketAddr>,
    cache: Arc<SessionCache>,
    reuse: bool,
) -> Result<Handshake<S>> {
    match stream.do_handshake() {
        Ok(()) => Ok(Handshake::Complete(TlsStream {
            inner: stream,
            peer,
            cache,
            reuse,
        })),
        Err(e) => {
            let code = e.code();
            if code == ErrorCode::WANT_READ || code == ErrorCode::WANT_WRITE {
                return Ok(Handshake::WouldBlock(MidHandshakeTlsStream {
                    inner: stream,
                    peer,
                    cache,
                    reuse,
                }));
            }
            let verify = stream.ssl().verify_result();
            if verify != X509VerifyResult::OK {
                return Err(Error::AuthFailure(verify.error_string().to_string()));
            }
            match e.into_io_error() {
                Ok(io_err) => Err(Error::Io(io_err)),
                Err(_) => Err(Error::Protocol),
            }
        }
    }
}

/// An established TLS or DTLS session over `S`.
pub struct TlsStream<S> {
    inner: SslStream<S>,
    peer: Option<SocketAddr>,
    cache: Arc<SessionCache>,
    reuse: bool,
}

impl<S: Read + Write> TlsStream<S> {
    pub fn get_ref(&self) -> &S {
        self.inner.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.inner.get_mut()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// True when the handshake resumed a cached session.
    pub fn session_reused(&self) -> bool {
        self.inner.ssl().session_reused()
    }

    /// Negotiated cipher name.
    pub fn cipher_name(&self) -> Option<&str> {
        self.inner.ssl().current_cipher().map(|c| c.name())
    }

    /// OK when peer verification passed, `AuthFailure` with the library's
    /// reason otherwise.
    pub fn peer_verify(&self) -> Result<()> {
        let verify = self.inner.ssl().verify_result();
        if verify == X509VerifyResult::OK {
            Ok(())
        } else {
            Err(Error::AuthFailure(verify.error_string().to_string()))
        }
    }

    /// Common name of the peer certificate.
    pub fn peer_common_name(&self) -> Option<String> {
        let cert = self.inner.ssl().peer_certificate()?;
        cert.subject_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|s| s.to_string())
    }

    /// Fingerprint of the peer certificate.
    pub fn peer_fingerprint(&self, alg: Fingerprint, out: &mut [u8]) -> Result<usize> {
        let cert = self
            .inner
            .ssl()
            .peer_certificate()
            .ok_or(Error::NotFound)?;
        cert::fingerprint_into(&cert, alg, out)
    }

    /// Issuer of the peer certificate in RFC 2253 form.
    pub fn peer_issuer(&self) -> Result<String> {
        let cert = self
            .inner
            .ssl()
            .peer_certificate()
            .ok_or(Error::NotFound)?;
        Ok(cert::format_rfc2253(cert.issuer_name()))
    }

    /// Subject of the peer certificate in RFC 2253 form.
    pub fn peer_subject(&self) -> Result<String> {
        let cert = self
            .inner
            .ssl()
            .peer_certificate()
            .ok_or(Error::NotFound)?;
        Ok(cert::format_rfc2253(cert.subject_name()))
    }

    /// Exports DTLS-SRTP keying material for the negotiated profile.
    pub fn srtp_keyinfo(&self) -> Result<SrtpKeyInfo> {
        let ssl = self.inner.ssl();
        let profile = ssl.selected_srtp_profile().ok_or(Error::NotSupported)?;
        let suite = SrtpSuite::from_profile(profile.id())?;

        let key_len = suite.key_len();
        let salt_len = suite.salt_len();
        let mut material = vec![0u8; 2 * (key_len + salt_len)];
        ssl.export_keying_material(&mut material, SRTP_EXPORT_LABEL, None)?;

        // exported as client-key, server-key, client-salt, server-salt
        let (keys, salts) = material.split_at(2 * key_len);
        let (client_key, server_key) = keys.split_at(key_len);
        let (client_salt, server_salt) = salts.split_at(salt_len);

        Ok(SrtpKeyInfo {
            suite,
            client: [client_key, client_salt].concat(),
            server: [server_key, server_salt].concat(),
        })
    }

    /// Captures the current session into the per-peer cache.
    ///
    /// Fails with `BadArgument` when there is no session, the session is
    /// not resumable, or the connection has no peer address.
    pub fn update_session(&self) -> Result<()> {
        if !self.reuse {
            return Err(Error::NotSupported);
        }
        let peer = self.peer.ok_or(Error::BadArgument)?;
        let ssl = self.inner.ssl();
        let session = ssl.session().ok_or(Error::BadArgument)?;
        if !session_resumable(ssl, session) {
            return Err(Error::BadArgument);
        }
        self.cache.insert(peer, session.to_owned());
        Ok(())
    }

    /// Sends the close notify alert.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.inner.shutdown() {
            Ok(_) => Ok(()),
            Err(e) => {
                let code = e.code();
                if code == ErrorCode::WANT_READ || code == ErrorCode::WANT_WRITE {
                    Err(Error::Transient)
                } else {
                    match e.into_io_error() {
                        Ok(io_err) => Err(Error::Io(io_err)),
                        Err(_) => Err(Error::Protocol),
                    }
                }
            }
        }
    }
}

impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S> fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsStream")
            .field("peer", &self.peer)
            .finish()
    }
}
