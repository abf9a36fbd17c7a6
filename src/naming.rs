//! Deterministic resource names
//!
//! Every name produced here is a pure function of its inputs so that repeated
//! reconciliations of the same machine declare the same objects. Hashes use
//! SHA-256 via `aws_lc_rs`; `DefaultHasher` is not stable across toolchains.

use aws_lc_rs::digest;

/// Maximum length of a Kubernetes object name that is also a valid label value
pub const MAX_NAME_LENGTH: usize = 63;

/// Hex characters kept from the digest in [`plan_secret_name`]
const PLAN_HASH_LEN: usize = 10;

/// Hex characters appended when [`safe_concat_name`] has to truncate
const TRUNCATED_HASH_LEN: usize = 5;

fn sha256_hex(input: &str, len: usize) -> String {
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    let mut hex: String = hash.as_ref().iter().map(|b| format!("{:02x}", b)).collect();
    hex.truncate(len);
    hex
}

/// Join `parts` with `-`, keeping the result within [`MAX_NAME_LENGTH`].
///
/// Short results are returned verbatim. Longer ones are cut to leave room for
/// `-<hash5>` where the hash covers the full untruncated name, so two long
/// names that share a prefix still end up distinct.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LENGTH {
        return full;
    }

    let keep = MAX_NAME_LENGTH - TRUNCATED_HASH_LEN - 1;
    let mut cut = keep;
    while !full.is_char_boundary(cut) {
        cut -= 1;
    }
    let prefix = full[..cut].trim_end_matches(['-', '.']);
    format!("{}-{}", prefix, sha256_hex(&full, TRUNCATED_HASH_LEN))
}

/// A label value standing for `value`.
///
/// Object names may be longer than the 63 characters a label value allows.
/// Such values are shortened the same way [`safe_concat_name`] shortens names.
pub fn safe_label_value(value: &str) -> String {
    safe_concat_name(&[value])
}

/// Name shared by every object of a machine's plan channel bundle.
///
/// `plan-<hash>` rather than the machine name so that the principal a node
/// authenticates as does not reveal which machine it is.
pub fn plan_secret_name(machine_name: &str) -> String {
    format!("plan-{}", sha256_hex(machine_name, PLAN_HASH_LEN))
}

/// Name of the service account (and computed secret) of a machine's bootstrap channel
pub fn bootstrap_principal_name(machine_name: &str) -> String {
    safe_concat_name(&[machine_name, "machine", "bootstrap"])
}
