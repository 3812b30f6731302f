//! SRP-6a over the RFC 5054 2048-bit group with SHA-256.
//!
//! All values cross the wire as lowercase hex. Public values (`A`, `B`) are
//! left-padded to the group width so every response has the same length.

use std::sync::OnceLock;

use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of freshly generated salts, in bytes.
pub const SALT_LEN: usize = 16;
/// Length of ephemeral private values, in bytes.
const EPHEMERAL_LEN: usize = 32;

const N_HEX: &str = concat!(
    "AC6BDB41324A9A9BF166DE5E1389582FAF72B6651987EE07FC3192943DB56050",
    "A37329CBB4A099ED8193E0757767A13DD52312AB4B03310DCD7F48A9DA04FD50",
    "E8083969EDB767B0CF6095179A163AB3661A05FBD5FAAAE82918A9962F0B93B8",
    "55F97993EC975EEAA80D740ADBF4FF747359D041D5C33EA71D281E446B14773B",
    "CA97B43A23FB801676BD207A436C6481F1D2B9078717461A5B9D32E688F87748",
    "544523B524B0D57D5EA77A2775D2ECFA032CFBDBF52FB3786160279004E57AE6",
    "AF874E7303CE53299CCC041C7BC308D82A5698F3A8D0C38271AE35F8E9DBFBB6",
    "94B5C803D89F7AE435DE236D525F54759B65E372FCD68EF20FA7111F9E4AFF73",
);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SrpError {
    #[error("malformed {field}: {detail}")]
    Malformed { field: &'static str, detail: String },
    #[error("illegal public value")]
    IllegalParameter,
    #[error("proof mismatch")]
    BadProof,
}

struct Group {
    n: BigUint,
    g: BigUint,
    k: BigUint,
    width: usize,
}

fn group() -> &'static Group {
    static GROUP: OnceLock<Group> = OnceLock::new();
    GROUP.get_or_init(|| {
        let n = BigUint::parse_bytes(N_HEX.as_bytes(), 16).unwrap_or_default();
        let g = BigUint::from(2u32);
        let width = n.to_bytes_be().len();
        let k = BigUint::from_bytes_be(&hash(&[&n.to_bytes_be(), &pad_to(&g, width)]));
        Group { n, g, k, width }
    })
}

fn pad_to(value: &BigUint, width: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= width {
        return bytes;
    }
    let mut out = vec![0u8; width - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

fn pad(value: &BigUint) -> Vec<u8> {
    pad_to(value, group().width)
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn is_zero(value: &BigUint) -> bool {
    value.bits() == 0
}

/// Byte-wise comparison without early exit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Usernames are case-insensitive; every derivation uses this form.
pub fn canonical_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Hex of a public value padded to the group width.
pub fn encode_public(value: &BigUint) -> String {
    hex::encode(pad(value))
}

pub fn decode_hex(field: &'static str, raw: &str) -> Result<Vec<u8>, SrpError> {
    hex::decode(raw.trim()).map_err(|e| SrpError::Malformed {
        field,
        detail: e.to_string(),
    })
}

pub fn decode_int(field: &'static str, raw: &str) -> Result<BigUint, SrpError> {
    let bytes = decode_hex(field, raw)?;
    if bytes.is_empty() {
        return Err(SrpError::Malformed {
            field,
            detail: "empty".into(),
        });
    }
    Ok(BigUint::from_bytes_be(&bytes))
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// x = H(s | H(I ":" P))
fn private_key(name: &str, password: &str, salt: &[u8]) -> BigUint {
    let identity = hash(&[canonical_name(name).as_bytes(), b":", password.as_bytes()]);
    BigUint::from_bytes_be(&hash(&[salt, &identity]))
}

/// v = g^x mod N
pub fn compute_verifier(name: &str, password: &str, salt: &[u8]) -> BigUint {
    let grp = group();
    grp.g.modpow(&private_key(name, password, salt), &grp.n)
}

/// A fresh salt and the matching verifier, both hex.
pub fn generate_verifier(name: &str, password: &str) -> (String, String) {
    let salt = random_bytes(SALT_LEN);
    let verifier = compute_verifier(name, password, &salt);
    (hex::encode(&salt), hex::encode(verifier.to_bytes_be()))
}

/// Server half of an ephemeral key exchange.
#[derive(Clone)]
pub struct ServerEphemeral {
    secret: BigUint,
    public: BigUint,
}

impl ServerEphemeral {
    /// B = (k·v + g^b) mod N
    pub fn generate(verifier: &BigUint) -> Self {
        let grp = group();
        loop {
            let secret = BigUint::from_bytes_be(&random_bytes(EPHEMERAL_LEN));
            let public = (&grp.k * verifier + grp.g.modpow(&secret, &grp.n)) % &grp.n;
            if !is_zero(&public) {
                return Self { secret, public };
            }
        }
    }

    pub fn public_hex(&self) -> String {
        encode_public(&self.public)
    }
}

fn scrambler(a_pub: &BigUint, b_pub: &BigUint) -> BigUint {
    BigUint::from_bytes_be(&hash(&[&pad(a_pub), &pad(b_pub)]))
}

/// M1 = H(H(N) xor H(g) | H(I) | s | A | B | K)
fn client_proof(name: &str, salt: &[u8], a_pub: &BigUint, b_pub: &BigUint, key: &[u8]) -> [u8; 32] {
    let grp = group();
    let hn = hash(&[&grp.n.to_bytes_be()]);
    let hg = hash(&[&grp.g.to_bytes_be()]);
    let mut mixed = [0u8; 32];
    for (i, byte) in mixed.iter_mut().enumerate() {
        *byte = hn[i] ^ hg[i];
    }
    let hi = hash(&[canonical_name(name).as_bytes()]);
    hash(&[&mixed, &hi, salt, &pad(a_pub), &pad(b_pub), key])
}

/// M2 = H(A | M1 | K)
fn server_proof(a_pub: &BigUint, m1: &[u8], key: &[u8]) -> [u8; 32] {
    hash(&[&pad(a_pub), m1, key])
}

/// Check the client's proof and produce the server's.
///
/// Returns `M2` on success.
pub fn verify_client(
    name: &str,
    salt: &[u8],
    verifier: &BigUint,
    ephemeral: &ServerEphemeral,
    a_pub: &BigUint,
    m1: &[u8],
) -> Result<[u8; 32], SrpError> {
    let grp = group();
    if is_zero(&(a_pub % &grp.n)) {
        return Err(SrpError::IllegalParameter);
    }
    let u = scrambler(a_pub, &ephemeral.public);
    if is_zero(&u) {
        return Err(SrpError::IllegalParameter);
    }

    // S = (A · v^u)^b mod N
    let base = (a_pub * verifier.modpow(&u, &grp.n)) % &grp.n;
    let shared = base.modpow(&ephemeral.secret, &grp.n);
    let key = hash(&[&pad(&shared)]);

    let expected = client_proof(name, salt, a_pub, &ephemeral.public, &key);
    if !constant_time_eq(&expected, m1) {
        return Err(SrpError::BadProof);
    }
    Ok(server_proof(a_pub, &expected, &key))
}

/// Client side of the handshake. Used by tests and account tooling.
pub struct ClientSession {
    secret: BigUint,
    public: BigUint,
}

/// What the client sends at step 2, plus the proof it expects back.
pub struct ClientProof {
    pub a_hex: String,
    pub m1_hex: String,
    pub expected_m2: [u8; 32],
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSession {
    /// A = g^a mod N
    pub fn new() -> Self {
        let grp = group();
        let secret = BigUint::from_bytes_be(&random_bytes(EPHEMERAL_LEN));
        let public = grp.g.modpow(&secret, &grp.n);
        Self { secret, public }
    }

    pub fn public_hex(&self) -> String {
        encode_public(&self.public)
    }

    /// Derive M1 from the server's step-1 reply.
    pub fn respond(
        &self,
        name: &str,
        password: &str,
        salt_hex: &str,
        b_hex: &str,
    ) -> Result<ClientProof, SrpError> {
        let grp = group();
        let salt = decode_hex("s", salt_hex)?;
        let b_pub = decode_int("B", b_hex)?;
        if is_zero(&(&b_pub % &grp.n)) {
            return Err(SrpError::IllegalParameter);
        }
        let u = scrambler(&self.public, &b_pub);
        let x = private_key(name, password, &salt);

        // S = (B - k·g^x)^(a + u·x) mod N
        let kgx = (&grp.k * grp.g.modpow(&x, &grp.n)) % &grp.n;
        let base = ((&b_pub % &grp.n) + &grp.n - kgx) % &grp.n;
        let exponent = &self.secret + &u * &x;
        let shared = base.modpow(&exponent, &grp.n);
        let key = hash(&[&pad(&shared)]);

        let m1 = client_proof(name, &salt, &self.public, &b_pub, &key);
        Ok(ClientProof {
            a_hex: self.public_hex(),
            m1_hex: hex::encode(m1),
            expected_m2: server_proof(&self.public, &m1, &key),
        })
    }
}

/// Deterministic stand-in values for accounts that cannot log in, derived from
/// a process secret so repeated step-1 calls for the same name look stable.
pub fn substitute_credentials(secret: &[u8], name: &str) -> (Vec<u8>, BigUint) {
    let canonical = canonical_name(name);
    let salt = hash(&[secret, b"salt", canonical.as_bytes()])[..SALT_LEN].to_vec();
    let x = BigUint::from_bytes_be(&hash(&[secret, b"verifier", canonical.as_bytes()]));
    let grp = group();
    (salt, grp.g.modpow(&x, &grp.n))
}
