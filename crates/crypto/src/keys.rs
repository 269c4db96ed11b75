use crate::error::{CryptoError, Result};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

/// An in-memory RSA keypair for one model, decoded from PEM.
#[derive(Clone)]
pub struct RsaKeyPair {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

/// Parses a keypair from PEM strings.
///
/// Private keys are accepted in PKCS#8 or PKCS#1 form. Keys provisioned by
/// older generator builds are PKCS#1 ("RSA PRIVATE KEY"), so both headers
/// must keep working. Public keys are PKIX ("PUBLIC KEY").
pub fn load_keypair(private_pem: &str, public_pem: &str) -> Result<RsaKeyPair> {
    let private_pem = private_pem.trim();
    let public_pem = public_pem.trim();

    let private = if private_pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(private_pem)
            .map_err(|e| CryptoError::Rsa(format!("failed to parse PKCS#1 private key: {e}")))?
    } else {
        RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| CryptoError::Rsa(format!("failed to parse PKCS#8 private key: {e}")))?
    };

    let public = RsaPublicKey::from_public_key_pem(public_pem)
        .map_err(|e| CryptoError::Rsa(format!("failed to parse public key: {e}")))?;

    Ok(RsaKeyPair { private, public })
}

/// Generates a fresh keypair, returning `(public_pem, private_pem)`.
/// The private key is emitted as PKCS#1 to match existing key material.
pub fn generate_keypair_pem(bits: usize) -> Result<(String, String)> {
    let mut rng = rand::rngs::OsRng;
    let private =
        RsaPrivateKey::new(&mut rng, bits).map_err(|e| CryptoError::Rsa(e.to_string()))?;
    let public = RsaPublicKey::from(&private);

    let private_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;
    let public_pem = public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;

    Ok((public_pem, private_pem.to_string()))
}
