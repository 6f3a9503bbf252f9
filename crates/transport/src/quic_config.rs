//! QUIC TLS/crypto configuration.
//!
//! Both peers derive the same Ed25519 key from the pre-shared secret and
//! present the same deterministic self-signed certificate for it. Each side
//! pins the SHA-256 fingerprint of that certificate, so a wrong secret fails
//! the handshake in both directions.

use std::num::NonZeroU32;
use std::sync::Arc;

use ring::{digest, pbkdf2};
use ring::signature::{Ed25519KeyPair, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::tuning::Tuning;

/// TLS server name and certificate subject used by both peers.
pub const SERVER_NAME: &str = "quictun";

const ALPN: &[u8] = b"quictun";
const KDF_SALT: &[u8] = b"quictun-preshared-key";
const KDF_ITERATIONS: u32 = 4096;

/// PKCS#8 v1 wrapper for a raw Ed25519 seed.
const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

/// SubjectPublicKeyInfo header for a raw Ed25519 public key.
const SPKI_ED25519_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Certificate and key derived from the pre-shared secret.
pub struct Identity {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
    spki: Vec<u8>,
    fingerprint: [u8; 32],
}

impl Identity {
    /// Derive the identity for `secret`. The same secret always yields the
    /// same public key.
    pub fn derive(secret: &str) -> Result<Self> {
        let iterations = NonZeroU32::new(KDF_ITERATIONS)
            .ok_or_else(|| TransportError::Crypto("zero KDF iterations".into()))?;
        let mut seed = [0_u8; 32];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            KDF_SALT,
            secret.as_bytes(),
            &mut seed,
        );

        let public = Ed25519KeyPair::from_seed_unchecked(&seed)
            .map_err(|e| TransportError::Crypto(format!("key derivation failed: {e}")))?;
        let mut spki = SPKI_ED25519_PREFIX.to_vec();
        spki.extend_from_slice(public.public_key().as_ref());

        let mut pkcs8 = PKCS8_ED25519_PREFIX.to_vec();
        pkcs8.extend_from_slice(&seed);
        let key = PrivatePkcs8KeyDer::from(pkcs8);

        let key_pair = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&key, &rcgen::PKCS_ED25519)
            .map_err(|e| TransportError::Crypto(format!("key import failed: {e}")))?;
        let cert = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
            .map_err(|e| TransportError::Crypto(format!("cert params failed: {e}")))?
            .self_signed(&key_pair)
            .map_err(|e| TransportError::Crypto(format!("self-signing failed: {e}")))?;

        debug!(public_key = ?public.public_key().as_ref().get(..8), "derived session identity");

        let cert = cert.der().clone();
        Ok(Self {
            fingerprint: fingerprint(&cert),
            cert,
            key,
            spki,
        })
    }

    /// DER-encoded SubjectPublicKeyInfo of the derived key.
    pub fn spki(&self) -> &[u8] {
        &self.spki
    }

    /// SHA-256 of the derived certificate.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    fn verifier(&self, provider: &CryptoProvider) -> Arc<PeerKeyVerifier> {
        Arc::new(PeerKeyVerifier {
            expected: self.fingerprint,
            algorithms: provider.signature_verification_algorithms,
        })
    }

    fn chain(&self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        (
            vec![self.cert.clone()],
            PrivateKeyDer::Pkcs8(self.key.clone_key()),
        )
    }
}

fn fingerprint(cert: &CertificateDer<'_>) -> [u8; 32] {
    let digest = digest::digest(&digest::SHA256, cert.as_ref());
    let mut out = [0_u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

// ---------------------------------------------------------------------------
// Config builders
// ---------------------------------------------------------------------------

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the quinn client config: present our certificate, accept only a
/// server carrying the same derived key.
pub fn build_client_config(identity: &Identity, tuning: &Tuning) -> Result<quinn::ClientConfig> {
    let provider = provider();
    let verifier = identity.verifier(&provider);
    let (chain, key) = identity.chain();

    let mut client_crypto = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Crypto(format!("client TLS config failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(chain, key)
        .map_err(|e| TransportError::Crypto(format!("client certificate rejected: {e}")))?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic_client_config = quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
        .map_err(|e| TransportError::Crypto(format!("QUIC client config failed: {e}")))?;

    let mut config = quinn::ClientConfig::new(Arc::new(quic_client_config));
    config.transport_config(Arc::new(tuning.transport_config()?));
    Ok(config)
}

/// Build the quinn server config: require a client certificate carrying
/// the derived key.
pub fn build_server_config(identity: &Identity, tuning: &Tuning) -> Result<quinn::ServerConfig> {
    let provider = provider();
    let verifier = identity.verifier(&provider);
    let (chain, key) = identity.chain();

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Crypto(format!("server TLS config failed: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| TransportError::Crypto(format!("server certificate rejected: {e}")))?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic_server_config = quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
        .map_err(|e| TransportError::Crypto(format!("QUIC server config failed: {e}")))?;

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
    config.transport_config(Arc::new(tuning.transport_config()?));
    Ok(config)
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Accepts a peer certificate only if it is byte-for-byte the certificate
/// derived from the secret, checked by SHA-256 fingerprint.
///
/// Handshake signatures are still checked against the certificate's key, so
/// possession of the derived private key is proven.
#[derive(Debug)]
struct PeerKeyVerifier {
    expected: [u8; 32],
    algorithms: WebPkiSupportedAlgorithms,
}

impl PeerKeyVerifier {
    fn check(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        let actual = fingerprint(end_entity);
        if actual == self.expected {
            Ok(())
        } else {
            Err(rustls::Error::General(format!(
                "peer certificate does not match the pre-shared secret: got {:02x?}",
                actual.get(..8).unwrap_or(&actual)
            )))
        }
    }
}

impl ServerCertVerifier for PeerKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for PeerKeyVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
