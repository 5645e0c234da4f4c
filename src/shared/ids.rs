use getrandom::getrandom;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const RUN_SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;
const MAX_ENVIRONMENT_NAME_LEN: usize = 48;

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

macro_rules! define_id_type {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, String> {
                validate_identifier_value($kind, raw)?;
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(|err| {
                    D::Error::custom(format!("invalid {} `{}`: {}", $kind, raw, err))
                })
            }
        }
    };
}

define_id_type!(RunId, "run id");
define_id_type!(SessionId, "session id");

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    out.iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

/// Generates a compact, sortable run id of the form `run-<ts36>-<rand4>`.
pub fn generate_run_id(now: i64) -> Result<RunId, String> {
    let timestamp =
        u64::try_from(now).map_err(|_| "run id requires a non-negative timestamp".to_string())?;
    let mut bytes = [0_u8; 4];
    getrandom(&mut bytes).map_err(|err| format!("failed to generate run id randomness: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % RUN_SUFFIX_SPACE;
    let raw = format!(
        "run-{}-{}",
        base36_encode_u64(timestamp),
        base36_encode_fixed_u32(sample, 4)
    );
    RunId::parse(&raw)
}

/// Deterministic environment name for one validation attempt of one run.
///
/// Names longer than the container-name budget keep the prefix and a digest of
/// the full name so concurrent runs never collide.
pub fn environment_name(prefix: &str, run_id: &RunId, attempt: u32) -> String {
    let full = format!("{prefix}-{}-a{attempt}", run_id.as_str());
    if full.len() <= MAX_ENVIRONMENT_NAME_LEN {
        return full;
    }
    let mut hasher = Sha256::new();
    hasher.update(full.as_bytes());
    let digest = hasher.finalize();
    let hash = digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("{prefix}-{hash}-a{attempt}")
}

pub fn session_id_for(environment_name: &str) -> SessionId {
    // environment names are built from validated ids, so this cannot fail in practice
    SessionId::parse(environment_name).unwrap_or_else(|_| SessionId("session".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_run_ids_are_valid_and_prefixed() {
        let id = generate_run_id(1_700_000_000).expect("run id");
        assert!(id.as_str().starts_with("run-"));
        assert_eq!(id.as_str().rsplit('-').next().map(str::len), Some(4));
    }

    #[test]
    fn negative_timestamps_are_rejected() {
        assert!(generate_run_id(-1).is_err());
    }

    #[test]
    fn long_environment_names_are_hashed_but_stable() {
        let run_id = RunId::parse(&"x".repeat(80)).expect("id");
        let first = environment_name("depshift", &run_id, 2);
        let second = environment_name("depshift", &run_id, 2);
        assert_eq!(first, second);
        assert!(first.len() <= MAX_ENVIRONMENT_NAME_LEN);
        assert!(first.ends_with("-a2"));
        assert_ne!(first, environment_name("depshift", &run_id, 3));
    }

    #[test]
    fn ids_reject_path_characters() {
        assert!(RunId::parse("../etc").is_err());
        assert!(RunId::parse("").is_err());
        assert!(RunId::parse("run-abc_1").is_ok());
    }
}
