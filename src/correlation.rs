//! Correlation tokens
//!
//! Each broker round-trip subscribes to a topic named after a fresh UUID v4
//! so the reply can be told apart from traffic meant for other nodes.

use alloc::string::String;
use core::fmt;
use uuid::Builder;

/// Source of random bytes
pub trait EntropySource {
    fn fill_bytes(&mut self, dest: &mut [u8]);
}

#[cfg(target_arch = "riscv32")]
impl EntropySource for esp_hal::rng::Rng {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.read(dest);
    }
}

/// UUID v4 text used as the reply topic of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn generate<E: EntropySource>(entropy: &mut E) -> Self {
        let mut bytes = [0u8; 16];
        entropy.fill_bytes(&mut bytes);
        let uuid = Builder::from_random_bytes(bytes).into_uuid();

        let mut buffer = uuid::Uuid::encode_buffer();
        Self(String::from(uuid.hyphenated().encode_lower(&mut buffer)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingEntropy;

    #[test]
    fn token_is_a_version_4_uuid() {
        let token = CorrelationToken::generate(&mut CountingEntropy::new(0));
        let text = token.as_str();

        assert_eq!(text.len(), 36);
        assert_eq!(text.as_bytes()[14], b'4');
        assert!(matches!(text.as_bytes()[19], b'8' | b'9' | b'a' | b'b'));
        assert_eq!(text.matches('-').count(), 4);
    }

    #[test]
    fn tokens_differ_per_attempt() {
        let mut entropy = CountingEntropy::new(7);
        let first = CorrelationToken::generate(&mut entropy);
        let second = CorrelationToken::generate(&mut entropy);
        assert_ne!(first, second);
    }
}
