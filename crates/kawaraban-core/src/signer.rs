//! Deterministic-from-passphrase signing
//!
//! Authorship of a record is proven by a modular-exponentiation signature
//! whose keypair is derived entirely from a passphrase: the same phrase
//! always yields the same key on every node, so there is no key file to
//! carry around. Two 256-bit probable primes are drawn from a SHA-256
//! stream seeded by the passphrase, the public exponent is fixed, and the
//! private exponent follows by the extended Euclidean algorithm.
//!
//! Signatures authenticate *authorship*, never the transport endpoint.

use num_bigint::{BigInt, BigUint};
use num_traits::{One, Zero};
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

use crate::error::{BbsError, BbsResult};

/// Bit length of each generated prime (modulus is twice this)
const PRIME_BITS: usize = 256;

/// Fixed public exponent
const PUBLIC_EXPONENT: u32 = 65537;

/// Miller-Rabin rounds per primality check
const MILLER_RABIN_ROUNDS: usize = 16;

/// Shortest hex pubkey accepted by verification; a truncated display key
/// is far below this and can never verify
pub const PUBKEY_MIN_HEX: usize = 64;

/// Length of the truncated key used only for rendering
pub const DISPLAY_KEY_HEX: usize = 12;

const SMALL_PRIMES: [u32; 54] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97, 101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191,
    193, 197, 199, 211, 223, 227, 229, 233, 239, 241, 251,
];

/// Signing/verification capability.
///
/// Callers depend only on this seam; the concrete scheme lives in
/// [`RsaSigner`].
pub trait Signer: Send + Sync {
    /// Hex form of the verification key (the full modulus)
    fn public_key(&self) -> String;

    /// Sign a digest, returning the hex signature
    fn sign(&self, digest: &[u8]) -> BbsResult<String>;

    /// Check a signature against an arbitrary embedded pubkey
    fn verify(&self, digest: &[u8], sig: &str, pubkey: &str) -> bool;
}

/// Modular-exponentiation signer derived deterministically from a passphrase
pub struct RsaSigner {
    n: BigUint,
    e: BigUint,
    d: BigUint,
}

impl RsaSigner {
    /// Derive the keypair from a passphrase.
    ///
    /// Deterministic: the same passphrase yields the same keypair.
    pub fn from_passphrase(passphrase: &str) -> BbsResult<Self> {
        let mut stream = HashStream::new(passphrase.as_bytes());
        let e = BigUint::from(PUBLIC_EXPONENT);

        let p = next_probable_prime(stream.candidate());
        let mut q = next_probable_prime(stream.candidate());
        loop {
            if p != q {
                let phi = (&p - 1u32) * (&q - 1u32);
                if gcd(&e, &phi).is_one() {
                    let n = &p * &q;
                    let d = modinv(&e, &phi)
                        .ok_or_else(|| BbsError::Crypto("no modular inverse".to_string()))?;
                    return Ok(Self { n, e, d });
                }
            }
            q = next_probable_prime(&q + 2u32);
        }
    }

    /// Truncated key for rendering only; rejected by verification
    pub fn display_key(&self) -> String {
        let full = self.public_key();
        full[..DISPLAY_KEY_HEX.min(full.len())].to_string()
    }
}

impl Signer for RsaSigner {
    fn public_key(&self) -> String {
        hex::encode(self.n.to_bytes_be())
    }

    fn sign(&self, digest: &[u8]) -> BbsResult<String> {
        let m = BigUint::from_bytes_be(digest);
        if m >= self.n {
            return Err(BbsError::Crypto("digest exceeds modulus".to_string()));
        }
        let s = m.modpow(&self.d, &self.n);
        Ok(hex::encode(s.to_bytes_be()))
    }

    fn verify(&self, digest: &[u8], sig: &str, pubkey: &str) -> bool {
        verify_detached(digest, sig, pubkey)
    }
}

/// Check a hex signature against a hex pubkey without holding a keypair.
///
/// Keys shorter than [`PUBKEY_MIN_HEX`] (including truncated display keys)
/// never verify.
pub fn verify_detached(digest: &[u8], sig: &str, pubkey: &str) -> bool {
    if pubkey.len() < PUBKEY_MIN_HEX {
        return false;
    }
    let Ok(n_bytes) = hex::decode(pubkey) else {
        return false;
    };
    let Ok(s_bytes) = hex::decode(sig) else {
        return false;
    };
    let n = BigUint::from_bytes_be(&n_bytes);
    let s = BigUint::from_bytes_be(&s_bytes);
    if s >= n || n.is_zero() {
        return false;
    }
    let m = BigUint::from_bytes_be(digest);
    s.modpow(&BigUint::from(PUBLIC_EXPONENT), &n) == m
}

/// Digest helper used for signature targets and record ids
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Deterministic SHA-256 chain seeded by the passphrase
struct HashStream {
    state: [u8; 32],
}

impl HashStream {
    fn new(seed: &[u8]) -> Self {
        Self {
            state: Sha256::digest(seed).into(),
        }
    }

    fn next_block(&mut self) -> [u8; 32] {
        self.state = Sha256::digest(self.state).into();
        self.state
    }

    /// Draw a PRIME_BITS-wide odd candidate with the top bit set
    fn candidate(&mut self) -> BigUint {
        let mut bytes = Vec::with_capacity(PRIME_BITS / 8);
        while bytes.len() < PRIME_BITS / 8 {
            bytes.extend_from_slice(&self.next_block());
        }
        bytes.truncate(PRIME_BITS / 8);
        bytes[0] |= 0x80;
        let last = bytes.len() - 1;
        bytes[last] |= 1;
        BigUint::from_bytes_be(&bytes)
    }
}

/// Smallest probable prime not below `n`
fn next_probable_prime(mut n: BigUint) -> BigUint {
    if (&n % 2u32).is_zero() {
        n += 1u32;
    }
    loop {
        if is_probable_prime(&n) {
            return n;
        }
        n += 2u32;
    }
}

fn is_probable_prime(n: &BigUint) -> bool {
    for &p in SMALL_PRIMES.iter() {
        let p = BigUint::from(p);
        if n == &p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }

    // Decompose n-1 = d * 2^s
    let n_minus_one = n - 1u32;
    let mut d = n_minus_one.clone();
    let mut s = 0u32;
    while (&d % 2u32).is_zero() {
        d >>= 1;
        s += 1;
    }

    // Bases drawn from an rng seeded by the candidate itself, so the
    // whole derivation stays deterministic.
    let seed = n.iter_u64_digits().next().unwrap_or(1);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let two = BigUint::from(2u32);
    let span = n - 3u32;

    'witness: for _ in 0..MILLER_RABIN_ROUNDS {
        let a = random_below(&mut rng, &span) + &two;
        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 0..s.saturating_sub(1) {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn random_below(rng: &mut rand::rngs::StdRng, bound: &BigUint) -> BigUint {
    let len = bound.to_bytes_be().len();
    loop {
        let mut buf = vec![0u8; len];
        rng.fill_bytes(&mut buf);
        let v = BigUint::from_bytes_be(&buf);
        if &v < bound {
            return v;
        }
    }
}

fn gcd(a: &BigUint, b: &BigUint) -> BigUint {
    let (mut a, mut b) = (a.clone(), b.clone());
    while !b.is_zero() {
        let r = &a % &b;
        a = std::mem::replace(&mut b, r);
    }
    a
}

fn modinv(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let (mut old_r, mut r) = (BigInt::from(a.clone()), BigInt::from(m.clone()));
    let (mut old_s, mut s) = (BigInt::one(), BigInt::zero());
    while !r.is_zero() {
        let q = &old_r / &r;
        let next_r = &old_r - &q * &r;
        old_r = std::mem::replace(&mut r, next_r);
        let next_s = &old_s - &q * &s;
        old_s = std::mem::replace(&mut s, next_s);
    }
    if !old_r.is_one() {
        return None;
    }
    let m_int = BigInt::from(m.clone());
    (((old_s % &m_int) + &m_int) % &m_int).to_biguint()
}
