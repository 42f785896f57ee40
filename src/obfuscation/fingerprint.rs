//! Browser fingerprint profiles
//!
//! Censors fingerprint ClientHellos (JA3) by looking at:
//! - Cipher suite order
//! - TLS extension order
//! - Supported groups (curves)
//! - Signature algorithms
//! - ALPN protocols
//!
//! Each profile carries the values a real browser of that family sends in a
//! TLS 1.2 ClientHello, in the order it sends them. The hello composer in
//! `protocol` walks `extension_order()` and emits each extension verbatim.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// TLS extension identifiers used by the profiles
pub mod ext {
    pub const SERVER_NAME: u16 = 0x0000;
    pub const STATUS_REQUEST: u16 = 0x0005;
    pub const SUPPORTED_GROUPS: u16 = 0x000a;
    pub const EC_POINT_FORMATS: u16 = 0x000b;
    pub const SIGNATURE_ALGORITHMS: u16 = 0x000d;
    pub const ALPN: u16 = 0x0010;
    pub const SIGNED_CERT_TIMESTAMP: u16 = 0x0012;
    pub const EXTENDED_MASTER_SECRET: u16 = 0x0017;
    pub const SESSION_TICKET: u16 = 0x0023;
    pub const RENEGOTIATION_INFO: u16 = 0xff01;
}

/// Browser fingerprint profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserProfile {
    /// Chrome on desktop
    #[default]
    Chrome,
    /// Firefox on desktop
    Firefox,
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Unknown browser signature: {0}")]
    UnknownProfile(String),
}

const CHROME_CIPHER_SUITES: &[u16] = &[
    0xc02b, // TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
    0xc02f, // TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
    0xc02c, // TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
    0xc030, // TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
    0xcca9, // TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
    0xcca8, // TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
    0xc013, // TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA
    0xc014, // TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA
    0x009c, // TLS_RSA_WITH_AES_128_GCM_SHA256
    0x009d, // TLS_RSA_WITH_AES_256_GCM_SHA384
    0x002f, // TLS_RSA_WITH_AES_128_CBC_SHA
    0x0035, // TLS_RSA_WITH_AES_256_CBC_SHA
    0x000a, // TLS_RSA_WITH_3DES_EDE_CBC_SHA
];

const FIREFOX_CIPHER_SUITES: &[u16] = &[
    0xc02b, // TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
    0xc02f, // TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
    0xcca9, // TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
    0xcca8, // TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
    0xc02c, // TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
    0xc030, // TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
    0xc00a, // TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA
    0xc009, // TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA
    0xc013, // TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA
    0xc014, // TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA
    0x0033, // TLS_DHE_RSA_WITH_AES_128_CBC_SHA
    0x0039, // TLS_DHE_RSA_WITH_AES_256_CBC_SHA
    0x002f, // TLS_RSA_WITH_AES_128_CBC_SHA
    0x0035, // TLS_RSA_WITH_AES_256_CBC_SHA
    0x000a, // TLS_RSA_WITH_3DES_EDE_CBC_SHA
];

const CHROME_EXTENSIONS: &[u16] = &[
    ext::RENEGOTIATION_INFO,
    ext::SERVER_NAME,
    ext::EXTENDED_MASTER_SECRET,
    ext::SESSION_TICKET,
    ext::SIGNATURE_ALGORITHMS,
    ext::STATUS_REQUEST,
    ext::SIGNED_CERT_TIMESTAMP,
    ext::ALPN,
    ext::EC_POINT_FORMATS,
    ext::SUPPORTED_GROUPS,
];

const FIREFOX_EXTENSIONS: &[u16] = &[
    ext::SERVER_NAME,
    ext::EXTENDED_MASTER_SECRET,
    ext::RENEGOTIATION_INFO,
    ext::SUPPORTED_GROUPS,
    ext::EC_POINT_FORMATS,
    ext::SESSION_TICKET,
    ext::ALPN,
    ext::STATUS_REQUEST,
    ext::SIGNATURE_ALGORITHMS,
];

impl BrowserProfile {
    /// Cipher suites in the order the browser offers them
    pub fn cipher_suites(&self) -> &'static [u16] {
        match self {
            Self::Chrome => CHROME_CIPHER_SUITES,
            Self::Firefox => FIREFOX_CIPHER_SUITES,
        }
    }

    /// Extension ids in the order the browser sends them
    pub fn extension_order(&self) -> &'static [u16] {
        match self {
            Self::Chrome => CHROME_EXTENSIONS,
            Self::Firefox => FIREFOX_EXTENSIONS,
        }
    }

    /// Named groups (x25519, secp256r1, secp384r1 and friends)
    pub fn supported_groups(&self) -> &'static [u16] {
        match self {
            Self::Chrome => &[0x001d, 0x0017, 0x0018],
            Self::Firefox => &[0x001d, 0x0017, 0x0018, 0x0019],
        }
    }

    /// Signature algorithms
    pub fn signature_algorithms(&self) -> &'static [u16] {
        match self {
            Self::Chrome => &[
                0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601, 0x0201,
            ],
            Self::Firefox => &[
                0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601, 0x0203,
                0x0201,
            ],
        }
    }

    /// ALPN protocols
    pub fn alpn_protocols(&self) -> &'static [&'static [u8]] {
        &[b"h2", b"http/1.1"]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Firefox => "firefox",
        }
    }
}

impl FromStr for BrowserProfile {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chrome" => Ok(Self::Chrome),
            "firefox" => Ok(Self::Firefox),
            other => Err(FingerprintError::UnknownProfile(other.to_string())),
        }
    }
}

impl fmt::Display for BrowserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_parse() {
        assert_eq!("chrome".parse::<BrowserProfile>().unwrap(), BrowserProfile::Chrome);
        assert_eq!("Firefox".parse::<BrowserProfile>().unwrap(), BrowserProfile::Firefox);
        assert!("netscape".parse::<BrowserProfile>().is_err());
    }

    #[test]
    fn test_profiles_differ() {
        assert_ne!(
            BrowserProfile::Chrome.cipher_suites(),
            BrowserProfile::Firefox.cipher_suites()
        );
        assert_ne!(
            BrowserProfile::Chrome.extension_order(),
            BrowserProfile::Firefox.extension_order()
        );
    }

    #[test]
    fn test_every_profile_carries_ticket_and_sni() {
        for profile in [BrowserProfile::Chrome, BrowserProfile::Firefox] {
            let order = profile.extension_order();
            assert!(order.contains(&ext::SESSION_TICKET));
            assert!(order.contains(&ext::SERVER_NAME));
        }
    }
}
