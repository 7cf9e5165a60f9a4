/// PKCE (Proof Key for Code Exchange) implementation
/// RFC 7636: https://tools.ietf.org/html/rfc7636
use crate::error::{OAuthError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Unreserved URI characters allowed in a code verifier (RFC 7636 section 4.1)
pub const UNRESERVED_CHARSET: &[u8; 66] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Shortest code verifier RFC 7636 permits
pub const MIN_VERIFIER_LENGTH: usize = 43;

/// Longest code verifier RFC 7636 permits
pub const MAX_VERIFIER_LENGTH: usize = 128;

// Largest multiple of 66 that fits in a byte. Bytes at or above it are
// discarded so every character is equally likely.
const ACCEPT_BELOW: u8 = 198;

/// Inclusive range the verifier length is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifierLength {
    min: usize,
    max: usize,
}

impl VerifierLength {
    /// Create a range, rejecting bounds outside [43, 128] or `min > max`
    pub fn new(min: usize, max: usize) -> Result<Self> {
        check_length(min)?;
        check_length(max)?;
        if min > max {
            return Err(OAuthError::Config(format!(
                "verifier length range is empty: {}..={}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// A range holding a single length
    pub fn fixed(length: usize) -> Result<Self> {
        Self::new(length, length)
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn contains(&self, length: usize) -> bool {
        (self.min..=self.max).contains(&length)
    }
}

impl Default for VerifierLength {
    /// 43..=96: the portal's historical upper bound with the RFC minimum
    fn default() -> Self {
        Self { min: 43, max: 96 }
    }
}

/// Verifier and challenge in the shape handed to the web layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkcePair {
    pub code_verifier: String,
    pub code_challenge: String,
}

/// PKCE challenge pair containing code verifier and code challenge
#[derive(Debug, Clone)]
pub struct Pkce {
    code_verifier: String,
    code_challenge: String,
}

impl Pkce {
    /// Generate a new PKCE challenge pair
    ///
    /// The verifier length is drawn uniformly from the default range and
    /// every character comes from the operating system's CSPRNG.
    ///
    /// # Examples
    ///
    /// ```
    /// use raitha_digilocker::pkce::Pkce;
    ///
    /// let pkce = Pkce::generate().unwrap();
    /// assert!(pkce.code_verifier().len() >= 43);
    /// assert_eq!(Pkce::code_challenge_method(), "S256");
    /// ```
    pub fn generate() -> Result<Self> {
        Self::with_length_range(VerifierLength::default())
    }

    /// Generate a pair whose verifier length is drawn from `range`
    pub fn with_length_range(range: VerifierLength) -> Result<Self> {
        Self::generate_with(&mut OsRng, range)
    }

    /// Generate a pair from an explicit entropy source
    pub fn generate_with<R: RngCore + CryptoRng>(
        rng: &mut R,
        range: VerifierLength,
    ) -> Result<Self> {
        let span = (range.max - range.min + 1) as u32;
        let length = range.min + uniform_below(rng, span)? as usize;
        let code_verifier = generate_code_verifier_with(rng, length)?;
        let code_challenge = generate_code_challenge(&code_verifier);

        debug!(verifier_length = length, "generated PKCE pair");

        Ok(Self {
            code_verifier,
            code_challenge,
        })
    }

    /// Rebuild a pair from a verifier held in a session
    pub fn from_verifier(code_verifier: impl Into<String>) -> Result<Self> {
        let code_verifier = code_verifier.into();
        validate_verifier(&code_verifier)?;
        let code_challenge = generate_code_challenge(&code_verifier);
        Ok(Self {
            code_verifier,
            code_challenge,
        })
    }

    /// Get the code verifier
    pub fn code_verifier(&self) -> &str {
        &self.code_verifier
    }

    /// Get the code challenge
    pub fn code_challenge(&self) -> &str {
        &self.code_challenge
    }

    /// Get the code challenge method (always S256)
    pub fn code_challenge_method() -> &'static str {
        "S256"
    }

    pub fn into_pair(self) -> PkcePair {
        PkcePair {
            code_verifier: self.code_verifier,
            code_challenge: self.code_challenge,
        }
    }
}

/// Generate a verifier of exactly `length` unreserved characters
pub fn generate_code_verifier(length: usize) -> Result<String> {
    generate_code_verifier_with(&mut OsRng, length)
}

/// Same as [`generate_code_verifier`] with an explicit entropy source
pub fn generate_code_verifier_with<R: RngCore + CryptoRng>(
    rng: &mut R,
    length: usize,
) -> Result<String> {
    check_length(length)?;
    sample_verifier(rng, length)
}

/// SHA-256 digest of the input's bytes
pub fn sha256(input: &str) -> [u8; 32] {
    Sha256::digest(input.as_bytes()).into()
}

/// Base64 URL-safe encoding without padding
pub fn base64_url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Derive the S256 code challenge for a verifier
pub fn generate_code_challenge(code_verifier: &str) -> String {
    base64_url_encode(&sha256(code_verifier))
}

/// Generate a fresh pair with the default length range
pub fn generate_pkce_pair() -> Result<PkcePair> {
    Pkce::generate().map(Pkce::into_pair)
}

/// Whether a verifier satisfies RFC 7636 length and charset rules
pub fn is_valid_verifier(code_verifier: &str) -> bool {
    validate_verifier(code_verifier).is_ok()
}

fn validate_verifier(code_verifier: &str) -> Result<()> {
    check_length(code_verifier.len())?;
    if let Some(c) = code_verifier
        .bytes()
        .find(|b| !UNRESERVED_CHARSET.contains(b))
    {
        return Err(OAuthError::InvalidVerifier(format!(
            "character {:?} is not an unreserved URI character",
            c as char
        )));
    }
    Ok(())
}

fn check_length(length: usize) -> Result<()> {
    if (MIN_VERIFIER_LENGTH..=MAX_VERIFIER_LENGTH).contains(&length) {
        Ok(())
    } else {
        Err(OAuthError::InvalidLength(length))
    }
}

fn fill_random<R: RngCore + CryptoRng>(rng: &mut R, buf: &mut [u8]) -> Result<()> {
    rng.try_fill_bytes(buf)
        .map_err(|e| OAuthError::CryptoUnavailable(e.to_string()))
}

fn sample_verifier<R: RngCore + CryptoRng>(rng: &mut R, length: usize) -> Result<String> {
    let mut verifier = String::with_capacity(length);
    let mut buf = [0u8; 64];

    while verifier.len() < length {
        fill_random(rng, &mut buf)?;
        for &b in buf.iter().filter(|&&b| b < ACCEPT_BELOW) {
            let idx = (b % UNRESERVED_CHARSET.len() as u8) as usize;
            verifier.push(UNRESERVED_CHARSET[idx] as char);
            if verifier.len() == length {
                break;
            }
        }
    }

    Ok(verifier)
}

/// Uniform value in `0..bound` by rejection sampling
fn uniform_below<R: RngCore + CryptoRng>(rng: &mut R, bound: u32) -> Result<u32> {
    debug_assert!(bound > 0);
    let space = 1u64 << 32;
    let zone = space - space % bound as u64;
    loop {
        let mut buf = [0u8; 4];
        fill_random(rng, &mut buf)?;
        let v = u32::from_le_bytes(buf);
        if (v as u64) < zone {
            return Ok(v % bound);
        }
    }
}
