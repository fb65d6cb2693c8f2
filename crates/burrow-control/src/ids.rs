//! Tenant id generation and validation
//!
//! Generated ids are readable `adjective-noun-NN` triples. Requested ids must
//! be DNS-label-like: lowercase ASCII letters, digits and inner hyphens.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::ControlError;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "dusty", "eager", "fancy", "gentle", "happy", "jolly", "kind",
    "lazy", "lucky", "mighty", "nimble", "polite", "proud", "quick", "quiet", "rapid", "shiny",
    "silly", "smooth", "sunny", "swift", "tidy", "wild", "witty", "young",
];

const NOUNS: &[&str] = &[
    "badger", "beaver", "bison", "crab", "eagle", "ferret", "fox", "gecko", "hare", "heron",
    "lemur", "lynx", "marmot", "mole", "moose", "otter", "owl", "panda", "rabbit", "raven",
    "seal", "shrew", "stoat", "tiger", "vole", "walrus", "weasel", "wombat",
];

/// Generate a random, human readable tenant id
pub fn generate_tenant_id() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("burrow");
    let number: u8 = rng.gen_range(10..100);
    format!("{}-{}-{}", adjective, noun, number)
}

/// Check a requested tenant id.
///
/// Accepts 4 to 65 lowercase alphanumerics, or 6 to 65 characters with inner
/// hyphens as long as the first and last are alphanumeric.
pub fn validate_tenant_id(id: &str) -> Result<(), ControlError> {
    let bytes = id.as_bytes();
    let is_alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if let Some(bad) = bytes.iter().find(|b| !is_alnum(b) && **b != b'-') {
        return Err(ControlError::InvalidTenantId(format!(
            "contains invalid character '{}'",
            char::from(*bad)
        )));
    }

    let len = bytes.len();
    let valid = if bytes.iter().all(is_alnum) {
        (4..=65).contains(&len)
    } else {
        (6..=65).contains(&len) && is_alnum(&bytes[0]) && is_alnum(&bytes[len - 1])
    };

    if valid {
        Ok(())
    } else {
        Err(ControlError::InvalidTenantId(format!(
            "'{}' must be 4 to 65 characters, or 6 to 65 with hyphens, starting and ending alphanumeric",
            id
        )))
    }
}
