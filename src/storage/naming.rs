//! Generated resource names
//!
//! Cloud resource names are global, so generated names carry a random
//! suffix and generation is retried a bounded number of times.

use rand::Rng;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Naming rules of one kind of cloud resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamePolicy {
    /// Human readable resource kind, used in errors
    pub kind: &'static str,
    pub min_len: usize,
    pub max_len: usize,
    /// Length of the random suffix
    pub suffix_len: usize,
    /// Generation attempts before giving up
    pub attempts: usize,
    /// Whether `-` is allowed between the first and last character
    pub allow_dash: bool,
}

/// Azure storage accounts: `^[0-9a-z]{3,24}$`
pub const AZURE_ACCOUNT: NamePolicy = NamePolicy {
    kind: "storage account",
    min_len: 3,
    max_len: 24,
    suffix_len: 5,
    attempts: 10,
    allow_dash: false,
};

/// S3 compatible buckets: `^[0-9a-z][0-9a-z-]{1,61}[0-9a-z]$`
pub const BUCKET: NamePolicy = NamePolicy {
    kind: "bucket",
    min_len: 3,
    max_len: 63,
    suffix_len: 16,
    attempts: 5000,
    allow_dash: true,
};

impl NamePolicy {
    fn allowed(&self, c: char) -> bool {
        c.is_ascii_lowercase() || c.is_ascii_digit() || (self.allow_dash && c == '-')
    }

    /// Build a fresh name from `prefix`.
    ///
    /// The prefix is lower-cased, stripped of disallowed characters and
    /// truncated to leave room for the random suffix.
    pub fn generate(&self, prefix: &str) -> String {
        let mut name: String = prefix
            .to_lowercase()
            .chars()
            .filter(|c| self.allowed(*c))
            .collect::<String>()
            .trim_start_matches('-')
            .to_string();
        name.truncate(self.max_len - self.suffix_len);
        name.push_str(&random_suffix(self.suffix_len));
        name
    }

    /// Whether `name` satisfies the backend's naming rules
    pub fn is_valid(&self, name: &str) -> bool {
        let len = name.len();
        if len < self.min_len || len > self.max_len {
            return false;
        }
        let edge_ok = |c: Option<char>| c.map_or(false, |c| c.is_ascii_lowercase() || c.is_ascii_digit());
        edge_ok(name.chars().next())
            && edge_ok(name.chars().last())
            && name.chars().all(|c| self.allowed(c))
    }
}

/// Random lower-case alphanumeric string
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

/// Prefix for storage account names, `imageregistry` when the
/// infrastructure name has no usable characters
pub fn account_prefix(infrastructure_name: &str) -> String {
    let prefix: String = infrastructure_name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    if prefix.is_empty() {
        "imageregistry".to_string()
    } else {
        prefix
    }
}

/// Prefix for bucket names: `<infra>-image-registry-<region>-`
pub fn bucket_prefix(infrastructure_name: &str, region: &str) -> String {
    format!("{}-image-registry-{}-", infrastructure_name, region)
}

/// Blob container name derived from the infrastructure name.
///
/// Containers allow lower-case letters, digits and single dashes, 3 to 63
/// characters, starting and ending with a letter or digit.
pub fn container_name(infrastructure_name: &str) -> String {
    let raw = format!("{}-image-registry", infrastructure_name).to_lowercase();
    let mut name = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            name.push(c);
        } else if c == '-' && !name.is_empty() && !name.ends_with('-') {
            name.push('-');
        }
    }
    name.truncate(63);
    let name = name.trim_end_matches('-');
    if name.len() < 3 {
        "image-registry".to_string()
    } else {
        name.to_string()
    }
}
