//! Passphrase holder
//!
//! Passphrases arrive through `IDVAULT_PASSPHRASE` and live only as long as
//! key derivation needs them; the buffer is wiped when dropped.

use std::fmt;

use zeroize::Zeroizing;

/// Passphrase wiped on drop and never printed
pub struct SecureString(Zeroizing<String>);

impl SecureString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Zeroizing::new(s.into()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecureString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureString(<{} bytes>)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passphrase_readable_until_dropped() {
        let passphrase = SecureString::new("correct horse");
        assert_eq!(passphrase.as_str(), "correct horse");
        assert_eq!(passphrase.len(), 13);
        assert!(SecureString::from(String::new()).is_empty());
    }

    #[test]
    fn test_debug_hides_contents() {
        let passphrase = SecureString::from("secret".to_string());
        let shown = format!("{:?}", passphrase);
        assert_eq!(shown, "SecureString(<6 bytes>)");
        assert!(!shown.contains("secret"));
    }
}
