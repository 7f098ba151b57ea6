//! # TLS Transport Layer
//!
//! Mutual-TLS authentication for RingMaster connections.
//!
//! Both sides of a connection present a certificate. Which local identity is
//! presented is decided by a [`CertificateSelector`]; whether the remote chain
//! is trusted is decided by a [`CertificateValidator`]. Both are invoked from
//! inside the rustls handshake, so an untrusted peer never reaches the
//! connection registry.
//!
//! ## Responsibilities
//! - Load identities from PEM files, PEM bytes, or mint self-signed ones
//! - Select the local identity and validate the remote chain
//! - Race the handshake against a timeout and a cancellation token
//! - Classify failures as timed out, cancelled, or untrusted
//!
//! ## Identity
//! Peers are identified by the SHA-256 thumbprint of their leaf certificate,
//! written as upper-case hex without separators.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::client::{ResolvesClientCert, ServerCertVerified, ServerCertVerifier};
use rustls::server::{ClientCertVerified, ClientCertVerifier, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{
    AlertDescription, Certificate, CertificateError, ClientConfig, DistinguishedName, PrivateKey,
    ServerConfig, ServerName, SignatureScheme,
};
use rustls_pemfile::{certs, pkcs8_private_keys};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::TlsConfig;
use crate::error::{constants, ProtocolError, Result};

/// Byte stream a connection runs over once it has been secured.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// SHA-256 thumbprint of a DER certificate, upper-case hex.
pub fn thumbprint(certificate: &Certificate) -> String {
    Sha256::digest(&certificate.0)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}

/// Canonical form of a thumbprint typed by a human: separators dropped, upper case.
pub fn normalize_thumbprint(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, ':' | ' ' | '-'))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// A certificate chain and the private key of its leaf.
#[derive(Clone)]
pub struct TlsIdentity {
    chain: Vec<Certificate>,
    certified: Arc<CertifiedKey>,
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("thumbprint", &self.thumbprint())
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl TlsIdentity {
    pub fn new(chain: Vec<Certificate>, key: PrivateKey) -> Result<Self> {
        if chain.is_empty() {
            return Err(ProtocolError::TlsError("Certificate chain is empty".into()));
        }
        let signing_key = rustls::sign::any_supported_type(&key)
            .map_err(|e| ProtocolError::TlsError(format!("Unsupported private key: {e}")))?;
        let certified = Arc::new(CertifiedKey::new(chain.clone(), signing_key));
        Ok(Self { chain, certified })
    }

    /// Parse a PEM certificate chain and a PEM PKCS#8 key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain = certs(&mut &cert_pem[..])
            .map_err(|_| ProtocolError::TlsError("Malformed PEM certificate".into()))?;
        let mut keys = pkcs8_private_keys(&mut &key_pem[..])
            .map_err(|_| ProtocolError::TlsError("Malformed PEM private key".into()))?;
        if keys.is_empty() {
            return Err(ProtocolError::TlsError("No PKCS#8 private key in PEM".into()));
        }
        let key = PrivateKey(keys.swap_remove(0));
        Self::new(chain.into_iter().map(Certificate).collect(), key)
    }

    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                ProtocolError::TlsError(format!("Cannot read {}: {e}", path.display()))
            })
        };
        Self::from_pem(&read(cert_path.as_ref())?, &read(key_path.as_ref())?)
    }

    /// Mint a self-signed identity for development and tests.
    pub fn self_signed(subject_alt_names: &[&str]) -> Result<Self> {
        let names = subject_alt_names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        let generated = rcgen::generate_simple_self_signed(names)
            .map_err(|e| ProtocolError::TlsError(format!("Certificate generation error: {e}")))?;
        Self::new(
            vec![Certificate(generated.cert.der().to_vec())],
            PrivateKey(generated.signing_key.serialize_der()),
        )
    }

    /// Mint a self-signed identity and write it as PEM files.
    pub fn generate_self_signed_files<P: AsRef<Path>>(
        cert_path: P,
        key_path: P,
        subject_alt_names: &[&str],
    ) -> Result<Self> {
        let names = subject_alt_names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        let generated = rcgen::generate_simple_self_signed(names)
            .map_err(|e| ProtocolError::TlsError(format!("Certificate generation error: {e}")))?;

        std::fs::write(&cert_path, generated.cert.pem())?;
        std::fs::write(&key_path, generated.signing_key.serialize_pem())?;

        Self::from_pem_files(cert_path, key_path)
    }

    /// Leaf certificate.
    pub fn certificate(&self) -> &Certificate {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    pub fn thumbprint(&self) -> String {
        thumbprint(self.certificate())
    }
}

/// Picks the local identity presented during a handshake.
pub trait CertificateSelector: Send + Sync {
    /// `server_name` is the SNI sent by the client, `None` on the client side.
    fn select<'a>(
        &self,
        server_name: Option<&str>,
        identities: &'a [TlsIdentity],
    ) -> Option<&'a TlsIdentity>;
}

/// Always presents the first identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstIdentitySelector;

impl CertificateSelector for FirstIdentitySelector {
    fn select<'a>(&self, _: Option<&str>, identities: &'a [TlsIdentity]) -> Option<&'a TlsIdentity> {
        identities.first()
    }
}

/// Decides whether a remote certificate chain is trusted.
pub trait CertificateValidator: Send + Sync {
    fn validate(&self, leaf: &Certificate, intermediates: &[Certificate]) -> Result<()>;
}

/// Trusts leaf certificates whose thumbprint is on an allow list and not on a
/// block list.
#[derive(Debug, Clone, Default)]
pub struct ThumbprintValidator {
    accepted: Vec<String>,
    blacklisted: Vec<String>,
}

impl ThumbprintValidator {
    pub fn new<I, S>(accepted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            accepted: accepted
                .into_iter()
                .map(|t| normalize_thumbprint(t.as_ref()))
                .collect(),
            blacklisted: Vec::new(),
        }
    }

    pub fn with_blacklist<I, S>(mut self, blacklisted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blacklisted = blacklisted
            .into_iter()
            .map(|t| normalize_thumbprint(t.as_ref()))
            .collect();
        self
    }

    pub fn accept(&mut self, thumbprint: &str) {
        self.accepted.push(normalize_thumbprint(thumbprint));
    }
}

impl CertificateValidator for ThumbprintValidator {
    fn validate(&self, leaf: &Certificate, _intermediates: &[Certificate]) -> Result<()> {
        let presented = thumbprint(leaf);
        if self.blacklisted.contains(&presented) {
            return Err(ProtocolError::TrustValidationFailed(format!(
                "certificate {presented} is blacklisted"
            )));
        }
        if !self.accepted.contains(&presented) {
            return Err(ProtocolError::TrustValidationFailed(format!(
                "certificate {presented} is not trusted"
            )));
        }
        Ok(())
    }
}

struct IdentityResolver {
    identities: Arc<[TlsIdentity]>,
    selector: Arc<dyn CertificateSelector>,
}

impl IdentityResolver {
    fn pick(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let picked = self.selector.select(server_name, &self.identities);
        if picked.is_none() {
            warn!(?server_name, "No certificate selected for handshake");
        }
        picked.map(|identity| Arc::clone(&identity.certified))
    }
}

impl ResolvesServerCert for IdentityResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        self.pick(client_hello.server_name())
    }
}

impl ResolvesClientCert for IdentityResolver {
    fn resolve(&self, _: &[&[u8]], _: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        self.pick(None)
    }

    fn has_certs(&self) -> bool {
        !self.identities.is_empty()
    }
}

fn rejected(side: &str, error: &ProtocolError) -> rustls::Error {
    warn!(side, error = %error, "Remote certificate rejected");
    rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
}

struct ValidatingServerVerifier {
    validator: Arc<dyn CertificateValidator>,
}

impl ServerCertVerifier for ValidatingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.validator
            .validate(end_entity, intermediates)
            .map(|_| ServerCertVerified::assertion())
            .map_err(|e| rejected("client", &e))
    }
}

struct ValidatingClientVerifier {
    validator: Arc<dyn CertificateValidator>,
    mandatory: bool,
}

impl ClientCertVerifier for ValidatingClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn client_auth_root_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        _now: SystemTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.validator
            .validate(end_entity, intermediates)
            .map(|_| ClientCertVerified::assertion())
            .map_err(|e| rejected("server", &e))
    }
}

/// Builder for a [`TlsContext`].
#[derive(Clone)]
pub struct TlsSettings {
    identities: Vec<TlsIdentity>,
    selector: Arc<dyn CertificateSelector>,
    validator: Option<Arc<dyn CertificateValidator>>,
    require_client_certificate: bool,
    server_name: Option<String>,
}

impl TlsSettings {
    /// Settings presenting `identities`; without an explicit validator only
    /// peers holding one of these identities are trusted.
    pub fn new(identities: Vec<TlsIdentity>) -> Self {
        Self {
            identities,
            selector: Arc::new(FirstIdentitySelector),
            validator: None,
            require_client_certificate: true,
            server_name: None,
        }
    }

    /// Identity from the configured PEM files, trusting itself plus the
    /// accepted thumbprints.
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        let (Some(cert_path), Some(key_path)) = (&config.cert_path, &config.key_path) else {
            return Err(ProtocolError::ConfigError(
                "cert_path and key_path must be set when TLS is enabled".into(),
            ));
        };
        let identity = TlsIdentity::from_pem_files(cert_path, key_path)?;

        let validator = ThumbprintValidator::new(
            std::iter::once(identity.thumbprint()).chain(config.accepted_thumbprints.iter().cloned()),
        )
        .with_blacklist(&config.blacklisted_thumbprints);

        let mut settings = Self::new(vec![identity])
            .with_validator(Arc::new(validator))
            .require_client_certificate(config.require_client_certificate);
        settings.server_name = config.server_name.clone();
        Ok(settings)
    }

    pub fn with_selector(mut self, selector: Arc<dyn CertificateSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn require_client_certificate(mut self, required: bool) -> Self {
        self.require_client_certificate = required;
        self
    }

    pub fn with_server_name<S: Into<String>>(mut self, name: S) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<TlsContext> {
        let validator = self.validator.unwrap_or_else(|| {
            Arc::new(ThumbprintValidator::new(
                self.identities.iter().map(TlsIdentity::thumbprint),
            ))
        });
        let resolver = Arc::new(IdentityResolver {
            identities: self.identities.into(),
            selector: self.selector,
        });

        let acceptor = if resolver.identities.is_empty() {
            None
        } else {
            let config = ServerConfig::builder()
                .with_safe_defaults()
                .with_client_cert_verifier(Arc::new(ValidatingClientVerifier {
                    validator: Arc::clone(&validator),
                    mandatory: self.require_client_certificate,
                }))
                .with_cert_resolver(Arc::clone(&resolver) as Arc<dyn ResolvesServerCert>);
            Some(TlsAcceptor::from(Arc::new(config)))
        };

        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(ValidatingServerVerifier { validator }));
        let config = if resolver.identities.is_empty() {
            builder.with_no_client_auth()
        } else {
            builder.with_client_cert_resolver(resolver as Arc<dyn ResolvesClientCert>)
        };

        Ok(TlsContext {
            acceptor,
            connector: TlsConnector::from(Arc::new(config)),
            server_name: self.server_name,
        })
    }
}

/// Built rustls acceptor and connector.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
    server_name: Option<String>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("can_accept", &self.acceptor.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsContext {
    /// Name sent to the server: the configured one, else the endpoint's IP.
    pub fn server_name_for(&self, addr: SocketAddr) -> Result<ServerName> {
        match &self.server_name {
            Some(name) => ServerName::try_from(name.as_str())
                .map_err(|_| ProtocolError::TlsError(format!("Invalid server name: {name}"))),
            None => Ok(ServerName::IpAddress(addr.ip())),
        }
    }

    /// Run the server side of the handshake.
    ///
    /// Returns the secured stream and the remote identity, if the client
    /// presented a certificate.
    #[instrument(skip(self, stream, cancel))]
    pub async fn authenticate_as_server<S>(
        &self,
        stream: S,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(tokio_rustls::server::TlsStream<S>, Option<String>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = self.acceptor.as_ref().ok_or_else(|| {
            ProtocolError::TlsError(constants::ERR_NO_SERVER_CERTIFICATE.to_string())
        })?;

        let stream = race(acceptor.accept(stream), timeout, cancel).await?;
        let identity = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(thumbprint);
        debug!(remote_identity = ?identity, "Authenticated as server");
        Ok((stream, identity))
    }

    /// Run the client side of the handshake against `addr`.
    #[instrument(skip(self, stream, cancel))]
    pub async fn authenticate_as_client<S>(
        &self,
        stream: S,
        addr: SocketAddr,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(tokio_rustls::client::TlsStream<S>, Option<String>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let domain = self.server_name_for(addr)?;
        let stream = race(self.connector.connect(domain, stream), timeout, cancel).await?;
        let identity = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(thumbprint);
        debug!(remote_identity = ?identity, "Authenticated as client");
        Ok((stream, identity))
    }
}

async fn race<F, T>(handshake: F, timeout: Duration, cancel: &CancellationToken) -> Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProtocolError::AuthenticationCancelled),
        outcome = tokio::time::timeout(timeout, handshake) => match outcome {
            Err(_) => Err(ProtocolError::AuthenticationTimedOut),
            Ok(result) => result.map_err(classify_handshake_error),
        },
    }
}

fn classify_handshake_error(error: io::Error) -> ProtocolError {
    let Some(tls) = error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    else {
        return ProtocolError::Io(error);
    };

    match tls {
        rustls::Error::InvalidCertificate(reason) => {
            ProtocolError::TrustValidationFailed(format!("{reason:?}"))
        }
        rustls::Error::NoCertificatesPresented => {
            ProtocolError::TrustValidationFailed("peer presented no certificate".into())
        }
        rustls::Error::AlertReceived(
            alert @ (AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateUnknown
            | AlertDescription::CertificateRequired
            | AlertDescription::UnknownCA
            | AlertDescription::AccessDenied),
        ) => ProtocolError::TrustValidationFailed(format!("peer rejected our certificate: {alert:?}")),
        other => ProtocolError::TlsError(other.to_string()),
    }
}

/// How accepted and established sockets are secured.
#[derive(Debug, Clone, Default)]
pub enum SecurityPolicy {
    /// Plain TCP; the remote identity is always `None`.
    #[default]
    Plain,
    Tls(Arc<TlsContext>),
}

impl SecurityPolicy {
    pub fn tls(settings: TlsSettings) -> Result<Self> {
        Ok(Self::Tls(Arc::new(settings.build()?)))
    }

    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        if config.enabled {
            Self::tls(TlsSettings::from_config(config)?)
        } else {
            Ok(Self::Plain)
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    pub(crate) async fn secure_server(
        &self,
        stream: TcpStream,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(BoxedStream, Option<String>)> {
        match self {
            Self::Plain => Ok((Box::new(stream), None)),
            Self::Tls(context) => {
                let (stream, identity) =
                    context.authenticate_as_server(stream, timeout, cancel).await?;
                Ok((Box::new(stream), identity))
            }
        }
    }

    pub(crate) async fn secure_client(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(BoxedStream, Option<String>)> {
        match self {
            Self::Plain => Ok((Box::new(stream), None)),
            Self::Tls(context) => {
                let (stream, identity) = context
                    .authenticate_as_client(stream, addr, timeout, cancel)
                    .await?;
                Ok((Box::new(stream), identity))
            }
        }
    }
}
