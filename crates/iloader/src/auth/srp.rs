//! SRP-6a client for Grand Slam Authentication.
//!
//! Group: RFC 5054 2048-bit prime with generator 2, hash SHA-256. The
//! password never leaves the client: it is stretched with PBKDF2 into the
//! SRP password key, and the identity is left out of `x` as GSA expects.
//!
//! ```text
//! k  = H(N | PAD(g))
//! u  = H(PAD(A) | PAD(B))
//! x  = H(s | H(":" | P))
//! S  = (B - k * g^x) ^ (a + u * x) mod N
//! K  = H(S)
//! M1 = H(H(N) xor H(PAD(g)) | H(I) | s | PAD(A) | PAD(B) | K)
//! M2 = H(PAD(A) | M1 | K)
//! ```

use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Bytes of randomness in the client's private exponent.
const PRIVATE_KEY_LEN: usize = 256;
const GENERATOR: u32 = 2;

/// RFC 5054 2048-bit group prime.
pub const N_BYTES: [u8; 256] = [
    0xac, 0x6b, 0xdb, 0x41, 0x32, 0x4a, 0x9a, 0x9b, 0xf1, 0x66, 0xde, 0x5e,
    0x13, 0x89, 0x58, 0x2f, 0xaf, 0x72, 0xb6, 0x65, 0x19, 0x87, 0xee, 0x07,
    0xfc, 0x31, 0x92, 0x94, 0x3d, 0xb5, 0x60, 0x50, 0xa3, 0x73, 0x29, 0xcb,
    0xb4, 0xa0, 0x99, 0xed, 0x81, 0x93, 0xe0, 0x75, 0x77, 0x67, 0xa1, 0x3d,
    0xd5, 0x23, 0x12, 0xab, 0x4b, 0x03, 0x31, 0x0d, 0xcd, 0x7f, 0x48, 0xa9,
    0xda, 0x04, 0xfd, 0x50, 0xe8, 0x08, 0x39, 0x69, 0xed, 0xb7, 0x67, 0xb0,
    0xcf, 0x60, 0x95, 0x17, 0x9a, 0x16, 0x3a, 0xb3, 0x66, 0x1a, 0x05, 0xfb,
    0xd5, 0xfa, 0xaa, 0xe8, 0x29, 0x18, 0xa9, 0x96, 0x2f, 0x0b, 0x93, 0xb8,
    0x55, 0xf9, 0x79, 0x93, 0xec, 0x97, 0x5e, 0xea, 0xa8, 0x0d, 0x74, 0x0a,
    0xdb, 0xf4, 0xff, 0x74, 0x73, 0x59, 0xd0, 0x41, 0xd5, 0xc3, 0x3e, 0xa7,
    0x1d, 0x28, 0x1e, 0x44, 0x6b, 0x14, 0x77, 0x3b, 0xca, 0x97, 0xb4, 0x3a,
    0x23, 0xfb, 0x80, 0x16, 0x76, 0xbd, 0x20, 0x7a, 0x43, 0x6c, 0x64, 0x81,
    0xf1, 0xd2, 0xb9, 0x07, 0x87, 0x17, 0x46, 0x1a, 0x5b, 0x9d, 0x32, 0xe6,
    0x88, 0xf8, 0x77, 0x48, 0x54, 0x45, 0x23, 0xb5, 0x24, 0xb0, 0xd5, 0x7d,
    0x5e, 0xa7, 0x7a, 0x27, 0x75, 0xd2, 0xec, 0xfa, 0x03, 0x2c, 0xfb, 0xdb,
    0xf5, 0x2f, 0xb3, 0x78, 0x61, 0x60, 0x27, 0x90, 0x04, 0xe5, 0x7a, 0xe6,
    0xaf, 0x87, 0x4e, 0x73, 0x03, 0xce, 0x53, 0x29, 0x9c, 0xcc, 0x04, 0x1c,
    0x7b, 0xc3, 0x08, 0xd8, 0x2a, 0x56, 0x98, 0xf3, 0xa8, 0xd0, 0xc3, 0x82,
    0x71, 0xae, 0x35, 0xf8, 0xe9, 0xdb, 0xfb, 0xb6, 0x94, 0xb5, 0xc8, 0x03,
    0xd8, 0x9f, 0x7a, 0xe4, 0x35, 0xde, 0x23, 0x6d, 0x52, 0x5f, 0x54, 0x75,
    0x9b, 0x65, 0xe3, 0x72, 0xfc, 0xd6, 0x8e, 0xf2, 0x0f, 0xa7, 0x11, 0x1f,
    0x9e, 0x4a, 0xff, 0x73,];

fn modulus() -> BigUint {
    BigUint::from_bytes_be(&N_BYTES)
}

fn generator() -> BigUint {
    BigUint::from(GENERATOR)
}

/// Left-pad to the byte length of N.
fn pad(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; N_BYTES.len().saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

fn hash(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn challenge_error(message: &str) -> Error {
    Error::Server {
        code: 0,
        message: format!("invalid SRP challenge: {message}"),
    }
}

/// How the server wants the password stretched (`sp` in the challenge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordProtocol {
    /// PBKDF2 over the raw SHA-256 digest
    S2k,
    /// PBKDF2 over the lowercase hex of the SHA-256 digest
    S2kFo,
}

impl PasswordProtocol {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "s2k" => Some(Self::S2k),
            "s2k_fo" => Some(Self::S2kFo),
            _ => None,
        }
    }
}

/// Stretch `password` into the SRP password key.
pub fn derive_password_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
    protocol: PasswordProtocol,
) -> Zeroizing<Vec<u8>> {
    let digest = Zeroizing::new(Sha256::digest(password.as_bytes()).to_vec());
    let input = match protocol {
        PasswordProtocol::S2k => digest,
        PasswordProtocol::S2kFo => Zeroizing::new(hex::encode(digest.as_slice()).into_bytes()),
    };
    let mut key = Zeroizing::new(vec![0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(&input, salt, iterations, &mut key);
    key
}

/// Client side of one SRP exchange.
pub struct SrpClient {
    private_key: Zeroizing<Vec<u8>>,
    public_key: Vec<u8>,
}

impl std::fmt::Debug for SrpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrpClient").finish_non_exhaustive()
    }
}

impl SrpClient {
    /// Fresh ephemeral key pair.
    pub fn new() -> Self {
        let mut private_key = Zeroizing::new(vec![0u8; PRIVATE_KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut private_key);
        Self::from_private_key(private_key)
    }

    pub fn from_private_key(private_key: Zeroizing<Vec<u8>>) -> Self {
        let a = BigUint::from_bytes_be(&private_key);
        let public_key = generator().modpow(&a, &modulus()).to_bytes_be();
        Self {
            private_key,
            public_key,
        }
    }

    /// `A`, sent as `A2k`.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Answer the server challenge `(salt, B)`.
    ///
    /// Fails when `B` is zero modulo N or the scrambler `u` is zero.
    pub fn process_challenge(
        &self,
        username: &str,
        password_key: &[u8],
        salt: &[u8],
        server_public: &[u8],
    ) -> Result<SrpVerifier> {
        let n = modulus();
        let g = generator();
        let b_pub = BigUint::from_bytes_be(server_public) % &n;
        if b_pub == BigUint::default() {
            return Err(challenge_error("B is zero"));
        }

        let a_pub = BigUint::from_bytes_be(&self.public_key);
        let a_padded = pad(&a_pub);
        let b_padded = pad(&b_pub);

        let k = BigUint::from_bytes_be(&hash(&[&N_BYTES, &pad(&g)]));
        let u = BigUint::from_bytes_be(&hash(&[&a_padded, &b_padded]));
        if u == BigUint::default() {
            return Err(challenge_error("u is zero"));
        }
        let inner = hash(&[b":", password_key]);
        let x = BigUint::from_bytes_be(&hash(&[salt, &inner]));

        let a = BigUint::from_bytes_be(&self.private_key);
        let kv = (k * g.modpow(&x, &n)) % &n;
        let base = (b_pub + &n - kv) % &n;
        let premaster = base.modpow(&(a + u * x), &n);
        let key = Zeroizing::new(hash(&[&premaster.to_bytes_be()]));

        let hn = hash(&[&N_BYTES]);
        let hg = hash(&[&pad(&g)]);
        let xor: Vec<u8> = hn.iter().zip(&hg).map(|(a, b)| a ^ b).collect();
        let m1 = hash(&[
            &xor,
            &hash(&[username.as_bytes()]),
            salt,
            &a_padded,
            &b_padded,
            &key,
        ]);
        let m2 = hash(&[&a_padded, &m1, &key]);

        Ok(SrpVerifier { m1, m2, key })
    }
}

impl Default for SrpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Proofs and shared key of a processed challenge.
pub struct SrpVerifier {
    m1: Vec<u8>,
    m2: Vec<u8>,
    key: Zeroizing<Vec<u8>>,
}

impl SrpVerifier {
    /// Client proof `M1`.
    pub fn proof(&self) -> &[u8] {
        &self.m1
    }

    /// Check the server proof `M2`.
    pub fn verify_server(&self, m2: &[u8]) -> Result<()> {
        if m2 == self.m2.as_slice() {
            Ok(())
        } else {
            Err(Error::Server {
                code: 0,
                message: "server proof did not verify".into(),
            })
        }
    }

    /// Shared session key `K`.
    pub fn session_key(&self) -> &[u8] {
        &self.key
    }

    pub fn into_session_key(self) -> Zeroizing<Vec<u8>> {
        self.key
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Server half of the exchange, for tests.
    pub(crate) struct TestServer {
        pub salt: Vec<u8>,
        pub iterations: u32,
        pub public_key: Vec<u8>,
        verifier: BigUint,
        private: BigUint,
    }

    impl TestServer {
        pub(crate) fn new(password: &str, protocol: PasswordProtocol) -> Self {
            let n = modulus();
            let g = generator();
            let salt = b"pepper-salt-0001".to_vec();
            let iterations = 1000;
            let key = derive_password_key(password, &salt, iterations, protocol);
            let x = BigUint::from_bytes_be(&hash(&[&salt, &hash(&[b":", &key])]));
            let verifier = g.modpow(&x, &n);

            let private = BigUint::from_bytes_be(&[0x5a; 32]);
            let k = BigUint::from_bytes_be(&hash(&[&N_BYTES, &pad(&g)]));
            let public = (k * &verifier + g.modpow(&private, &n)) % &n;
            Self {
                salt,
                iterations,
                public_key: public.to_bytes_be(),
                verifier,
                private,
            }
        }

        /// Shared key derived from the client's public key.
        pub(crate) fn session_key(&self, client_public: &[u8]) -> Vec<u8> {
            let n = modulus();
            let a_pub = BigUint::from_bytes_be(client_public);
            let b_pub = BigUint::from_bytes_be(&self.public_key);
            let u = BigUint::from_bytes_be(&hash(&[&pad(&a_pub), &pad(&b_pub)]));
            let premaster = (a_pub * self.verifier.modpow(&u, &n)).modpow(&self.private, &n);
            hash(&[&premaster.to_bytes_be()])
        }

        /// `M2` for a client proof, computed from the server's own key.
        pub(crate) fn proof(&self, client_public: &[u8], m1: &[u8]) -> Vec<u8> {
            let a_pub = BigUint::from_bytes_be(client_public);
            hash(&[&pad(&a_pub), m1, &self.session_key(client_public)])
        }
    }

    #[test]
    fn test_modulus_is_2048_bits() {
        assert_eq!(modulus().bits(), 2048);
        assert_eq!(pad(&generator()).len(), 256);
    }

    #[test]
    fn test_client_and_server_agree() {
        for protocol in [PasswordProtocol::S2k, PasswordProtocol::S2kFo] {
            let server = TestServer::new("hunter2", protocol);
            let client = SrpClient::new();
            let key = derive_password_key("hunter2", &server.salt, server.iterations, protocol);
            let verifier = client
                .process_challenge("user@example.com", &key, &server.salt, &server.public_key)
                .unwrap();

            assert_eq!(verifier.session_key(), server.session_key(client.public_key()).as_slice());
            let m2 = server.proof(client.public_key(), verifier.proof());
            assert!(verifier.verify_server(&m2).is_ok());
        }
    }

    #[test]
    fn test_wrong_password_disagrees() {
        let server = TestServer::new("hunter2", PasswordProtocol::S2k);
        let client = SrpClient::new();
        let key = derive_password_key("hunter3", &server.salt, server.iterations, PasswordProtocol::S2k);
        let verifier = client
            .process_challenge("user@example.com", &key, &server.salt, &server.public_key)
            .unwrap();
        assert_ne!(verifier.session_key(), server.session_key(client.public_key()).as_slice());
        let m2 = server.proof(client.public_key(), verifier.proof());
        assert!(verifier.verify_server(&m2).is_err());
    }

    #[test]
    fn test_zero_server_key_is_rejected() {
        let client = SrpClient::new();
        assert!(client.process_challenge("u", b"k", b"s", &N_BYTES).is_err());
        assert!(client.process_challenge("u", b"k", b"s", &[0]).is_err());
    }

    #[test]
    fn test_password_protocols_differ() {
        let s2k = derive_password_key("pw", b"salt", 10, PasswordProtocol::S2k);
        let s2k_fo = derive_password_key("pw", b"salt", 10, PasswordProtocol::S2kFo);
        assert_eq!(s2k.len(), 32);
        assert_ne!(s2k.as_slice(), s2k_fo.as_slice());
        assert_eq!(PasswordProtocol::from_name("s2k_fo"), Some(PasswordProtocol::S2kFo));
        assert_eq!(PasswordProtocol::from_name("plain"), None);
    }
}
