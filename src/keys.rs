//! Serializable key material. Keys are provisioned out of band (config files,
//! an authenticator service) and travel base64-encoded in TOML/JSON.

use crate::crypto;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::ops::{Deref, DerefMut};

macro_rules! key_newtype {
    ($name:ident, $size:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone)]
        pub struct $name([u8; $size]);

        impl $name {
            pub const SIZE: usize = $size;

            #[inline]
            pub fn new(key: [u8; $size]) -> $name {
                $name(key)
            }
        }

        impl Deref for $name {
            type Target = [u8; $size];

            #[inline]
            fn deref(&self) -> &[u8; $size] {
                &self.0
            }
        }

        impl DerefMut for $name {
            #[inline]
            fn deref_mut(&mut self) -> &mut [u8; $size] {
                &mut self.0
            }
        }

        impl Serialize for $name {
            #[inline]
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&base64::encode(&self.0[..]))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            #[inline]
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<$name, D::Error> {
                let s = String::deserialize(deserializer)?;
                let decoded = base64::decode(&s).map_err(de::Error::custom)?;

                if decoded.len() != $size {
                    return Err(de::Error::custom(format!(
                        "key must be {} octets, got {}",
                        $size,
                        decoded.len()
                    )));
                }

                let mut out = [0u8; $size];
                out.copy_from_slice(&decoded);
                Ok($name(out))
            }
        }
    };
}

key_newtype!(BoxPublicKey, crypto::KEY_SIZE, "Public encryption key.");
key_newtype!(BoxSecretKey, crypto::SECRET_KEY_SIZE, "Secret encryption key.");
key_newtype!(SignPublicKey, crypto::SIGN_KEY_SIZE, "Public signature verification key.");
key_newtype!(SignSecretKey, crypto::SIGN_SECRET_KEY_SIZE, "Secret signing key.");

/// The key material a router can be provisioned with. All fields are optional;
/// which ones are required depends on the policy (a server that accepts sealed
/// OPENs needs the open keypair, a signing peer needs the sign keypair).
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct KeyRing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_public: Option<BoxPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_secret: Option<BoxSecretKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_public: Option<SignPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_secret: Option<SignSecretKey>,
}

impl KeyRing {
    /// A keyring holding a freshly generated open keypair.
    pub fn generate_open() -> KeyRing {
        let pair = crypto::BoxKeyPair::generate();

        KeyRing {
            open_public: Some(BoxPublicKey::new(pair.public)),
            open_secret: Some(BoxSecretKey::new(pair.secret)),
            sign_public: None,
            sign_secret: None,
        }
    }

    /// Adds a freshly generated signing keypair.
    pub fn with_signing(mut self) -> KeyRing {
        let pair = crypto::SignKeyPair::generate();
        self.sign_public = Some(SignPublicKey::new(pair.public));
        self.sign_secret = Some(SignSecretKey::new(pair.secret));
        self
    }

    /// The open keypair, if both halves are present.
    #[inline]
    pub fn open_pair(&self) -> Option<crypto::BoxKeyPair> {
        match (&self.open_public, &self.open_secret) {
            (Some(public), Some(secret)) => Some(crypto::BoxKeyPair {
                public: **public,
                secret: **secret,
            }),
            _ => None,
        }
    }

    /// The signing keypair, if both halves are present.
    #[inline]
    pub fn sign_pair(&self) -> Option<crypto::SignKeyPair> {
        match (&self.sign_public, &self.sign_secret) {
            (Some(public), Some(secret)) => Some(crypto::SignKeyPair {
                public: **public,
                secret: **secret,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyring_toml_roundtrip() {
        let ring = KeyRing::generate_open().with_signing();

        let toml = serdeconv::to_toml_string(&ring).unwrap();
        let parsed: KeyRing = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(*parsed.open_public.unwrap(), *ring.open_public.as_ref().unwrap().clone());
        assert_eq!(
            &parsed.sign_secret.unwrap()[..],
            &ring.sign_secret.as_ref().unwrap()[..]
        );
    }

    #[test]
    fn test_keyring_pairs() {
        let ring = KeyRing::generate_open();

        assert!(ring.open_pair().is_some());
        assert!(ring.sign_pair().is_none());

        let ring = ring.with_signing();
        assert!(ring.sign_pair().is_some());
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let result: Result<BoxPublicKey, _> =
            serdeconv::from_json_str(&format!("\"{}\"", base64::encode(&[1u8; 7])));
        assert!(result.is_err());
    }
}
