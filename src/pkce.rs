/// PKCE (Proof Key for Code Exchange) implementation
/// RFC 7636: https://tools.ietf.org/html/rfc7636
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Length of the generated code verifier
pub const CODE_VERIFIER_LENGTH: usize = 64;

/// Length of the generated anti-forgery state token
pub const STATE_LENGTH: usize = 16;

/// Characters random strings are drawn from
pub const ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random string of `length` characters from [`ALPHABET`]
///
/// Characters are sampled uniformly (rejection sampling, no modulo bias)
/// from the operating system's CSPRNG.
pub fn random_string(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Derive the S256 code challenge for a verifier
///
/// `BASE64URL(SHA256(verifier))` with padding stripped.
pub fn code_challenge(code_verifier: &str) -> String {
    let hash = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Secrets for a single login attempt
///
/// Created when the authorization redirect is built and consumed exactly
/// once when the provider calls back.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    code_verifier: String,
    code_challenge: String,
    state: String,
}

impl PendingAuthorization {
    /// Generate a fresh verifier, challenge and state
    ///
    /// # Examples
    ///
    /// ```
    /// use setlist::pkce::PendingAuthorization;
    ///
    /// let pending = PendingAuthorization::generate();
    /// assert_eq!(pending.code_verifier().len(), 64);
    /// assert_eq!(PendingAuthorization::code_challenge_method(), "S256");
    /// ```
    pub fn generate() -> Self {
        let code_verifier = random_string(CODE_VERIFIER_LENGTH);
        let code_challenge = code_challenge(&code_verifier);
        let state = random_string(STATE_LENGTH);

        Self {
            code_verifier,
            code_challenge,
            state,
        }
    }

    /// Get the code verifier
    pub fn code_verifier(&self) -> &str {
        &self.code_verifier
    }

    /// Get the code challenge
    pub fn code_challenge(&self) -> &str {
        &self.code_challenge
    }

    /// Get the state token
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Get the code challenge method (always S256)
    pub fn code_challenge_method() -> &'static str {
        "S256"
    }
}
