//! kubeadm join tokens
//!
//! Tokens have the kubeadm wire format `[a-z0-9]{6}.[a-z0-9]{16}`: a public
//! token id and a secret, separated by a dot. A token supplied by the
//! operator is never reformatted; it reaches the node script verbatim.

use tracing::warn;

use crate::{Error, Result};

const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 6;
const SECRET_LEN: usize = 16;

/// Largest multiple of the alphabet size that fits in a byte; bytes at or
/// above it are discarded so every character is equally likely
const UNBIASED_LIMIT: u8 = (256 / ALPHABET.len() * ALPHABET.len()) as u8;

/// A kubeadm bootstrap token
#[derive(Clone, PartialEq, Eq)]
pub struct KubeadmToken(String);

impl KubeadmToken {
    /// Generate a fresh token from the system CSPRNG
    pub fn generate() -> Result<Self> {
        let id = random_chars(ID_LEN)?;
        let secret = random_chars(SECRET_LEN)?;
        Ok(Self(format!("{id}.{secret}")))
    }

    /// Wrap an operator-supplied token exactly as given
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Wrap an operator-supplied token, warning when it is not kubeadm-shaped
    ///
    /// The token is still passed on verbatim; kubeadm rejects it on the node.
    pub fn supplied(token: impl Into<String>) -> Self {
        let token = Self::new(token);
        if !token.is_well_formed() {
            warn!(
                token_id = token.id().unwrap_or("<none>"),
                "Join token does not match [a-z0-9]{{6}}.[a-z0-9]{{16}}, kubeadm join will reject it"
            );
        }
        token
    }

    /// The token text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the token, returning its text
    pub fn into_string(self) -> String {
        self.0
    }

    /// Whether the token matches the kubeadm format
    pub fn is_well_formed(&self) -> bool {
        let Some((id, secret)) = self.0.split_once('.') else {
            return false;
        };
        let valid = |s: &str, len: usize| {
            s.len() == len && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        };
        valid(id, ID_LEN) && valid(secret, SECRET_LEN)
    }

    /// The public token id (the part before the dot)
    pub fn id(&self) -> Option<&str> {
        self.0.split_once('.').map(|(id, _)| id)
    }
}

impl std::fmt::Debug for KubeadmToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The id is public; the secret is not
        f.debug_struct("KubeadmToken")
            .field("id", &self.id().unwrap_or("<malformed>"))
            .finish_non_exhaustive()
    }
}

fn random_chars(len: usize) -> Result<String> {
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 32];
    while out.len() < len {
        aws_lc_rs::rand::fill(&mut buf)
            .map_err(|_| Error::config("system random number generator failed"))?;
        for b in buf {
            if out.len() == len {
                break;
            }
            if b < UNBIASED_LIMIT {
                out.push(ALPHABET[(b as usize) % ALPHABET.len()] as char);
            }
        }
    }
    Ok(out)
}
