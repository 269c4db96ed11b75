use crate::error::{CryptoError, Result};
use crate::keys::RsaKeyPair;
use num_bigint::{BigUint, RandBigInt};
use num_traits::One;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha384};

// SHA-384 PSS with a salt of the digest length, randomized. Changing either
// parameter invalidates every token already issued.
const HASH_LEN: usize = 48;
const SALT_LEN: usize = 48;

/// Server side of the blind-RSA protocol: signs blinded messages it cannot
/// read, and verifies unblinded tokens it has never seen before.
pub struct BlindSigner {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl BlindSigner {
    pub fn new(pair: RsaKeyPair) -> Self {
        Self {
            private_key: pair.private,
            public_key: pair.public,
        }
    }

    pub fn generate(bits: usize) -> Result<Self> {
        let mut rng = OsRng;
        let private_key =
            RsaPrivateKey::new(&mut rng, bits).map_err(|e| CryptoError::Rsa(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn public_key_pem(&self) -> Result<String> {
        use rsa::pkcs8::EncodePublicKey;
        self.public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| CryptoError::Rsa(e.to_string()))
    }

    /// Applies the private-key operation to an already blinded, already
    /// PSS-encoded message. The output is still blinded.
    pub fn sign_blinded(&self, blinded_message: &[u8]) -> Result<Vec<u8>> {
        let n = BigUint::from_bytes_be(&self.private_key.n().to_bytes_be());
        let blinded = BigUint::from_bytes_be(blinded_message);

        if blinded >= n {
            return Err(CryptoError::MessageTooLarge);
        }

        let d = BigUint::from_bytes_be(&self.private_key.d().to_bytes_be());
        let signature = blinded.modpow(&d, &n);

        Ok(to_fixed_len(&signature, self.private_key.size()))
    }

    /// Verifies an unblinded token/signature pair. Returns `false` on any
    /// cryptographic mismatch rather than erroring.
    pub fn verify_unblinded(&self, token: &[u8], signature: &[u8]) -> bool {
        verify_pss(&self.public_key, token, signature)
    }
}

/// A blinded message and the factor needed to later unblind its signature.
/// The blinding factor never leaves the client.
#[derive(Debug, Clone)]
pub struct BlindedToken {
    pub blinded_message: Vec<u8>,
    pub blinding_factor: Vec<u8>,
}

/// Client side of the protocol. Lives here so tests and tooling can run the
/// whole issuance/redemption flow in-process.
pub struct BlindClient {
    public_key: RsaPublicKey,
}

impl BlindClient {
    pub fn new(public_key: RsaPublicKey) -> Self {
        Self { public_key }
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        use rsa::pkcs8::DecodePublicKey;
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        Ok(Self { public_key })
    }

    /// PSS-encodes `token`, then multiplies by a random `r^e`. The signer
    /// sees only the product.
    pub fn blind(&self, token: &[u8]) -> Result<BlindedToken> {
        let mut rng = OsRng;
        let n = BigUint::from_bytes_be(&self.public_key.n().to_bytes_be());
        let e = BigUint::from_bytes_be(&self.public_key.e().to_bytes_be());
        let mod_bits = n.bits() as usize;

        let em = emsa_pss_encode(token, mod_bits - 1)?;
        let message = BigUint::from_bytes_be(&em);
        if num_integer::Integer::gcd(&message, &n) != BigUint::one() {
            return Err(CryptoError::MessageTooLarge);
        }

        let mut attempts = 0;
        let r = loop {
            if attempts > 100 {
                return Err(CryptoError::InvalidBlindingFactor);
            }

            let candidate = rng.gen_biguint_range(&BigUint::from(2u32), &n);

            if num_integer::Integer::gcd(&candidate, &n) == BigUint::one() {
                break candidate;
            }

            attempts += 1;
        };

        let r_e = r.modpow(&e, &n);
        let blinded = (message * r_e) % &n;

        Ok(BlindedToken {
            blinded_message: to_fixed_len(&blinded, self.public_key.size()),
            blinding_factor: r.to_bytes_be(),
        })
    }

    /// Strips the blinding factor off a signed blinded message, yielding a
    /// standard PSS signature over the original token.
    pub fn unblind(&self, blind_signature: &[u8], blinding_factor: &[u8]) -> Result<Vec<u8>> {
        let n = BigUint::from_bytes_be(&self.public_key.n().to_bytes_be());
        let sig = BigUint::from_bytes_be(blind_signature);
        let r = BigUint::from_bytes_be(blinding_factor);

        let r_inv = r.modinv(&n).ok_or(CryptoError::InvalidBlindingFactor)?;
        let unblinded = (sig * r_inv) % &n;

        Ok(to_fixed_len(&unblinded, self.public_key.size()))
    }

    pub fn verify(&self, token: &[u8], signature: &[u8]) -> bool {
        verify_pss(&self.public_key, token, signature)
    }
}

fn verify_pss(public_key: &RsaPublicKey, token: &[u8], signature: &[u8]) -> bool {
    let hashed = Sha384::digest(token);
    public_key
        .verify(Pss::new_with_salt::<Sha384>(SALT_LEN), &hashed, signature)
        .is_ok()
}

/// Big-endian encoding left-padded to `len` bytes, as RSA wire formats
/// expect. `BigUint::to_bytes_be` drops leading zeros.
fn to_fixed_len(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

/// EMSA-PSS-ENCODE (RFC 8017 §9.1.1) with SHA-384 and a random 48-byte salt.
fn emsa_pss_encode(msg: &[u8], em_bits: usize) -> Result<Vec<u8>> {
    let em_len = (em_bits + 7) / 8;
    if em_len < HASH_LEN + SALT_LEN + 2 {
        return Err(CryptoError::MessageTooLarge);
    }

    let m_hash = Sha384::digest(msg);
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut m_prime = Vec::with_capacity(8 + HASH_LEN + SALT_LEN);
    m_prime.extend_from_slice(&[0u8; 8]);
    m_prime.extend_from_slice(&m_hash);
    m_prime.extend_from_slice(&salt);
    let h = Sha384::digest(&m_prime);

    let db_len = em_len - HASH_LEN - 1;
    let mut db = vec![0u8; db_len];
    db[db_len - SALT_LEN - 1] = 0x01;
    db[db_len - SALT_LEN..].copy_from_slice(&salt);

    let db_mask = mgf1(&h, db_len);
    for (byte, mask) in db.iter_mut().zip(db_mask.iter()) {
        *byte ^= mask;
    }
    db[0] &= 0xff >> (8 * em_len - em_bits);

    let mut em = db;
    em.extend_from_slice(&h);
    em.push(0xbc);
    Ok(em)
}

fn mgf1(seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + HASH_LEN);
    let mut counter: u32 = 0;
    while out.len() < len {
        let mut hasher = Sha384::new();
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}
