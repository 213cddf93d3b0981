use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::config::CredentialSection;
use crate::task::Credentials;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*-_=+?";

/// Produces disposable mailbox addresses and policy-compliant passwords.
/// Addresses combine a random local-part, a timestamp and a shared counter,
/// so parallel generations never collide; passwords come from an OS-seeded
/// ChaCha20 stream.
#[derive(Debug, Clone)]
pub struct CredentialGenerator {
    config: CredentialSection,
    serial: Arc<AtomicU64>,
}

impl CredentialGenerator {
    pub fn new(config: CredentialSection) -> Self {
        Self {
            config,
            serial: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn generate(&self, domain_hint: Option<&str>) -> Credentials {
        let email = self.generate_email(domain_hint);
        let password = self.generate_password();
        Credentials::new(email, password)
    }

    pub fn generate_email(&self, domain_hint: Option<&str>) -> String {
        let domain = match domain_hint {
            Some(hint) if self.config.mailbox_domains.iter().any(|d| d == hint) => {
                hint.to_string()
            }
            Some(hint) => {
                debug!(hint, "email domain hint is not a poll-able provider, ignoring");
                self.default_domain()
            }
            None => self.default_domain(),
        };

        let mut rng = ChaCha20Rng::from_entropy();
        let local: String = (0..8)
            .map(|_| LOWER[rng.gen_range(0..LOWER.len())] as char)
            .collect();
        let stamp = Utc::now().timestamp();
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        format!("{local}{stamp}{serial:03}@{domain}")
    }

    pub fn generate_password(&self) -> String {
        let require_symbols = self.config.password_require_symbols;
        // The length floor also has to cover the mandatory character classes.
        let classes = if require_symbols { 4 } else { 3 };
        let length = self.config.password_min_length.max(classes);

        let mut rng = ChaCha20Rng::from_entropy();
        let mut chars: Vec<char> = vec![
            LOWER[rng.gen_range(0..LOWER.len())] as char,
            UPPER[rng.gen_range(0..UPPER.len())] as char,
            DIGITS[rng.gen_range(0..DIGITS.len())] as char,
        ];
        if require_symbols {
            chars.push(SYMBOLS[rng.gen_range(0..SYMBOLS.len())] as char);
        }

        let mut alphabet = Vec::new();
        alphabet.extend_from_slice(LOWER);
        alphabet.extend_from_slice(UPPER);
        alphabet.extend_from_slice(DIGITS);
        if require_symbols {
            alphabet.extend_from_slice(SYMBOLS);
        }
        while chars.len() < length {
            chars.push(alphabet[rng.gen_range(0..alphabet.len())] as char);
        }

        chars.shuffle(&mut rng);
        chars.into_iter().collect()
    }

    fn default_domain(&self) -> String {
        self.config
            .mailbox_domains
            .first()
            .cloned()
            .unwrap_or_else(|| "mailinator.com".to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn generator(min_length: usize, require_symbols: bool) -> CredentialGenerator {
        CredentialGenerator::new(CredentialSection {
            password_min_length: min_length,
            password_require_symbols: require_symbols,
            ..CredentialSection::default()
        })
    }

    #[test]
    fn passwords_satisfy_the_policy() {
        let generator = generator(12, true);
        for _ in 0..16 {
            let password = generator.generate_password();
            assert_eq!(password.chars().count(), 12);
            assert!(password.chars().any(|c| c.is_ascii_lowercase()));
            assert!(password.chars().any(|c| c.is_ascii_uppercase()));
            assert!(password.chars().any(|c| c.is_ascii_digit()));
            assert!(password.chars().any(|c| SYMBOLS.contains(&(c as u8))));
        }
    }

    #[test]
    fn symbol_free_policy_yields_symbol_free_passwords() {
        let generator = generator(14, false);
        let password = generator.generate_password();
        assert_eq!(password.chars().count(), 14);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn passwords_are_not_repeated() {
        let generator = generator(16, true);
        let mut seen = HashSet::new();
        for _ in 0..32 {
            assert!(seen.insert(generator.generate_password()));
        }
    }

    #[test]
    fn emails_are_unique_per_generation() {
        let generator = generator(12, true);
        let mut seen = HashSet::new();
        for _ in 0..128 {
            let email = generator.generate_email(None);
            assert!(email.ends_with("@mailinator.com"));
            assert!(seen.insert(email));
        }
    }

    #[test]
    fn domain_hint_is_honored_only_for_poll_able_providers() {
        let generator = generator(12, true);
        let hinted = generator.generate_email(Some("guerrillamail.com"));
        assert!(hinted.ends_with("@guerrillamail.com"));

        let unknown = generator.generate_email(Some("corp.example.com"));
        assert!(unknown.ends_with("@mailinator.com"));
    }
}
