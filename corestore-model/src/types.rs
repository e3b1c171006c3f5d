//! Strong types for byte arrays
//!
//! Semantic newtypes for the fixed-size byte arrays corestore routes around,
//! replacing raw `[u8; N]`.

use std::fmt;
use zeroize::Zeroize;

/// Macro to define fixed-size byte arrays with strong types.
///
/// Args:
/// - $name: The name of the struct (e.g., DiscoveryKey)
/// - $len: The size of the array (e.g., 32)
/// - $doc: Documentation string
/// - $derives: List of traits to derive
macro_rules! define_bytes {
    ($name:ident, $len:expr, $doc:expr, [$($derives:ident),*]) => {
        #[doc = $doc]
        #[derive(Clone, Copy, serde::Serialize, serde::Deserialize, $($derives),*)]
        #[repr(transparent)]
        pub struct $name(#[serde(with = "serde_bytes")] pub [u8; $len]);

        impl $name {
            /// Returns the inner bytes as a slice.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Parse from a hex string.
            pub fn from_hex(hex_str: &str) -> Result<Self, String> {
                let bytes = hex::decode(hex_str)
                    .map_err(|e| format!("invalid hex: {}", e))?;
                if bytes.len() != $len {
                    return Err(format!(
                        "expected {} hex characters, got {}",
                        $len * 2,
                        hex_str.len()
                    ));
                }
                Ok(Self(bytes.try_into().map_err(|_| "internal error: length mismatch".to_string())?))
            }
        }

        // Standard Conversions
        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; $len] {
            fn from(wrapper: $name) -> [u8; $len] {
                wrapper.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = [u8; $len];
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        // Zero-allocation Hex formatting
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(self, f)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                fmt::Display::fmt(self, f)?;
                write!(f, ")")
            }
        }

        // TryFrom for slice parsing
        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;
            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                Ok(Self(<[u8; $len]>::try_from(slice)?))
            }
        }

        // TryFrom<Vec<u8>> for owned vector parsing
        impl TryFrom<Vec<u8>> for $name {
            type Error = Vec<u8>;
            fn try_from(vec: Vec<u8>) -> Result<Self, Self::Error> {
                if vec.len() != $len {
                    return Err(vec);
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&vec);
                Ok(Self(arr))
            }
        }
    };
}

// --- Type Definitions ---

define_bytes!(
    CoreKey,
    32,
    "32-byte core key, derived deterministically from the core's manifest",
    [PartialEq, Eq, Hash, Default, PartialOrd, Ord]
);

define_bytes!(
    DiscoveryKey,
    32,
    "32-byte opaque network identifier for a core; does not reveal the key",
    [PartialEq, Eq, Hash, Default, PartialOrd, Ord]
);

define_bytes!(
    PubKey,
    32,
    "32-byte Ed25519 public key",
    [PartialEq, Eq, Hash, Default, PartialOrd, Ord]
);

define_bytes!(
    Namespace,
    32,
    "32-byte domain separator for name-to-keypair derivation",
    [PartialEq, Eq, Hash, Default, PartialOrd, Ord]
);

impl Namespace {
    /// The default (root) namespace.
    pub const DEFAULT: Namespace = Namespace([0u8; 32]);
}

/// 32-byte Ed25519 secret seed. Wiped on drop, redacted in Debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

/// A signing key pair. The secret half is absent for read-only material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: PubKey,
    pub secret_key: Option<SecretKey>,
}

impl KeyPair {
    /// A verification-only key pair.
    pub fn public(public_key: PubKey) -> Self {
        Self { public_key, secret_key: None }
    }

    pub fn is_writable(&self) -> bool {
        self.secret_key.is_some()
    }
}

// --- Tests ---

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_key_display() {
        let dk = DiscoveryKey([0xab; 32]);
        let expected = "abababababababababababababababababababababababababababababababab";
        assert_eq!(format!("{}", dk), expected);
        assert_eq!(format!("{:?}", dk), format!("DiscoveryKey({})", expected));
    }

    #[test]
    fn test_from_hex_roundtrip() {
        let key = CoreKey([0x42; 32]);
        let parsed = CoreKey::from_hex(&key.to_string()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn test_from_hex_wrong_length() {
        assert!(DiscoveryKey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_traits() {
        let bytes = [1u8; 32];
        let ns: Namespace = bytes.into();
        assert_eq!(*ns, bytes); // Test Deref
        assert_eq!(ns.as_bytes(), &bytes);
        let back: [u8; 32] = ns.into();
        assert_eq!(bytes, back);
    }

    #[test]
    fn test_default_namespace_is_zero() {
        assert_eq!(Namespace::DEFAULT, Namespace([0u8; 32]));
        assert_eq!(Namespace::default(), Namespace::DEFAULT);
    }

    #[test]
    fn test_secret_key_redacted_debug() {
        let sk = SecretKey::from_bytes([7u8; 32]);
        assert_eq!(format!("{:?}", sk), "SecretKey(..)");
    }

    #[test]
    fn test_key_pair_writable() {
        let read_only = KeyPair::public(PubKey([1; 32]));
        assert!(!read_only.is_writable());

        let writable = KeyPair {
            public_key: PubKey([1; 32]),
            secret_key: Some(SecretKey::from_bytes([2; 32])),
        };
        assert!(writable.is_writable());
    }
}
