//! Identifiers: container, object, owner IDs and addresses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of every 32-byte identifier
pub const ID_SIZE: usize = 32;

/// Length of an encoded [`Address`]
pub const ADDRESS_SIZE: usize = 2 * ID_SIZE;

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name([u8; ID_SIZE]);

        impl $name {
            /// Wrap raw bytes
            pub const fn new(bytes: [u8; ID_SIZE]) -> Self {
                Self(bytes)
            }

            /// SHA-256 of the given data
            pub fn digest(data: &[u8]) -> Self {
                let mut out = [0u8; ID_SIZE];
                out.copy_from_slice(&Sha256::digest(data));
                Self(out)
            }

            /// Random identifier
            pub fn random() -> Self {
                Self::digest(uuid::Uuid::new_v4().as_bytes())
            }

            /// Parse from a byte slice of exactly [`ID_SIZE`] bytes
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                let arr: [u8; ID_SIZE] = bytes.try_into().map_err(|_| {
                    Error::InvalidAddress(format!(
                        "{} must be {} bytes, got {}",
                        stringify!($name),
                        ID_SIZE,
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }

            /// Raw bytes
            pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)
                    .map_err(|e| Error::InvalidAddress(format!("{}: {}", s, e)))?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

digest_id!(
    /// Container identifier
    ContainerId
);

digest_id!(
    /// Object identifier (SHA-256 of the sealed header)
    ObjectId
);

digest_id!(
    /// Object owner identifier
    OwnerId
);

digest_id!(
    /// SHA-256 payload checksum
    Checksum
);

/// Split chain identifier of the V1 split scheme
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SplitId(uuid::Uuid);

impl SplitId {
    /// Fresh random split ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Raw 16 bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse from 16 raw bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        uuid::Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|e| Error::InvalidAddress(format!("split ID: {}", e)))
    }
}

impl Default for SplitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SplitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SplitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SplitId({})", self.0)
    }
}

impl FromStr for SplitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidAddress(format!("split ID {}: {}", s, e)))
    }
}

// =============================================================================
// Address
// =============================================================================

/// Globally unique object address: container plus object ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub container: ContainerId,
    pub object: ObjectId,
}

impl Address {
    pub fn new(container: ContainerId, object: ObjectId) -> Self {
        Self { container, object }
    }

    /// `container || object`, the key form used by every store
    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out[..ID_SIZE].copy_from_slice(self.container.as_bytes());
        out[ID_SIZE..].copy_from_slice(self.object.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(Error::InvalidAddress(format!(
                "address must be {} bytes, got {}",
                ADDRESS_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            container: ContainerId::from_slice(&bytes[..ID_SIZE])?,
            object: ObjectId::from_slice(&bytes[ID_SIZE..])?,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.object)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (cnr, obj) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidAddress(format!("{}: expected <container>/<object>", s)))?;
        Ok(Self {
            container: cnr.parse()?,
            object: obj.parse()?,
        })
    }
}
