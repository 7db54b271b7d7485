//! Control-channel credentials
//!
//! Every instance gets its own random password. Tor only accepts the
//! password's salted hash in its configuration, and it computes that hash
//! itself through `tor --hash-password`.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use crate::error::{PoolError, Result};

const PUNCTUATION: &[u8] = b"!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";
const DIGITS: &[u8] = b"0123456789";
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate a password of `length` characters from letters, digits and punctuation
pub fn generate_password(length: usize) -> String {
    let alphabet: Vec<u8> = [PUNCTUATION, DIGITS, LETTERS].concat();
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Pick a password length uniformly from `range`
pub fn random_password_length(range: RangeInclusive<usize>) -> usize {
    rand::thread_rng().gen_range(range)
}

/// Run `tor --hash-password` and extract the hashed token from its stdout
pub async fn compute_hash(tor_binary: &Path, password: &str, pattern: &Regex) -> Result<String> {
    let output = Command::new(tor_binary)
        .arg("--hash-password")
        .arg(password)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            PoolError::HashGeneration(format!("cannot run {}: {e}", tor_binary.display()))
        })?;

    if !output.status.success() {
        return Err(PoolError::HashGeneration(format!(
            "{} exited with {}",
            tor_binary.display(),
            output.status
        )));
    }

    extract_hash(&String::from_utf8_lossy(&output.stdout), pattern)
}

/// Find the hashed password in `output`
///
/// Tor may print log lines before the hash, so the first match anywhere wins.
pub fn extract_hash(output: &str, pattern: &Regex) -> Result<String> {
    pattern
        .find(output)
        .map(|m| m.as_str().to_string())
        .filter(|hash| !hash.is_empty())
        .ok_or_else(|| {
            PoolError::HashGeneration(format!(
                "no token matching `{}` in hash output",
                pattern.as_str()
            ))
        })
}

/// Turns a plaintext control password into the form Tor stores
#[async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash(&self, password: &str) -> Result<String>;
}

/// [`PasswordHasher`] backed by the Tor binary
#[derive(Debug, Clone)]
pub struct TorPasswordHasher {
    tor_binary: PathBuf,
    pattern: Regex,
}

impl TorPasswordHasher {
    pub fn new(tor_binary: impl Into<PathBuf>, pattern: Regex) -> Self {
        Self {
            tor_binary: tor_binary.into(),
            pattern,
        }
    }
}

#[async_trait]
impl PasswordHasher for TorPasswordHasher {
    async fn hash(&self, password: &str) -> Result<String> {
        compute_hash(&self.tor_binary, password, &self.pattern).await
    }
}

/// Password and hash for one instance
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    password: String,
    hashed_password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &"<redacted>")
            .field("hashed_password", &self.hashed_password)
            .finish()
    }
}

impl Credentials {
    /// Generate a password with a random length from `lengths` and hash it
    pub async fn generate(
        lengths: RangeInclusive<usize>,
        hasher: &dyn PasswordHasher,
    ) -> Result<Self> {
        let password = generate_password(random_password_length(lengths));
        let hashed_password = hasher.hash(&password).await?;
        debug!(length = password.len(), "Generated control password");
        Ok(Self {
            password,
            hashed_password,
        })
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn hashed_password(&self) -> &str {
        &self.hashed_password
    }

    pub fn is_cleared(&self) -> bool {
        self.password.is_empty() && self.hashed_password.is_empty()
    }

    /// Overwrite and forget both secrets
    pub fn clear(&mut self) {
        wipe(&mut self.password);
        wipe(&mut self.hashed_password);
    }
}

fn wipe(secret: &mut String) {
    // Zero the bytes before truncating.
    let zeroed = "\0".repeat(secret.len());
    secret.replace_range(.., &zeroed);
    secret.clear();
}
