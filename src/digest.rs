//! Content digests and the layer identities built from them.
//!
//! A [`DiffId`] names the uncompressed tar stream one layer contributes. A
//! [`ChainId`] names a layer together with its whole ancestry: for a base
//! layer it equals the diff ID, otherwise it is
//! `sha256(parent_chain_id + " " + diff_id)`.

use std::{fmt, io::Read, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

const SHA256: &str = "sha256";

/// A validated `sha256:<hex>` content digest.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse a digest in `algorithm:hex` form.
    pub fn parse(value: &str) -> Result<Self> {
        let Some((algorithm, encoded)) = value.split_once(':') else {
            return Err(Error::InvalidDigest(value.to_string()));
        };
        if algorithm != SHA256 || !is_sha256_hex(encoded) {
            return Err(Error::InvalidDigest(value.to_string()));
        }
        Ok(Digest(value.to_string()))
    }

    /// Build a digest from a hex string without the algorithm prefix.
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        if !is_sha256_hex(encoded) {
            return Err(Error::InvalidDigest(encoded.to_string()));
        }
        Ok(Digest(format!("{SHA256}:{encoded}")))
    }

    /// Digest of an in-memory buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut digester = Digester::new();
        digester.update(data);
        digester.finish()
    }

    /// The algorithm part, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        SHA256
    }

    /// The hex-encoded part after the colon.
    pub fn encoded(&self) -> &str {
        &self.0[SHA256.len() + 1..]
    }

    /// The full `algorithm:hex` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub(crate) fn is_sha256_hex(encoded: &str) -> bool {
    encoded.len() == 64
        && encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

macro_rules! digest_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Digest);

        impl $name {
            /// Parse from `algorithm:hex` form.
            pub fn parse(value: &str) -> Result<Self> {
                Digest::parse(value).map($name)
            }

            /// The underlying digest.
            pub fn digest(&self) -> &Digest {
                &self.0
            }

            /// The hex-encoded part of the digest.
            pub fn encoded(&self) -> &str {
                self.0.encoded()
            }
        }

        impl From<Digest> for $name {
            fn from(value: Digest) -> Self {
                $name(value)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                $name::parse(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

digest_newtype!(
    /// Digest of the uncompressed tar stream contributed by a single layer.
    DiffId
);

digest_newtype!(
    /// Identity of a read-only layer covering its entire ancestry.
    ChainId
);

impl ChainId {
    /// Compute the chain ID of a layer from its parent's chain ID and its own diff ID.
    pub fn for_layer(parent: Option<&ChainId>, diff_id: &DiffId) -> ChainId {
        match parent {
            None => ChainId(diff_id.0.clone()),
            Some(parent) => ChainId(Digest::from_bytes(format!("{parent} {diff_id}").as_bytes())),
        }
    }
}

/// Incremental SHA-256 digest computation.
#[derive(Debug, Default, Clone)]
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> Digest {
        Digest(format!("{SHA256}:{}", hex::encode(self.hasher.finalize())))
    }
}

/// A reader that hashes everything passing through it.
#[derive(Debug)]
pub struct DigestReader<R> {
    inner: R,
    digester: Digester,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        DigestReader {
            inner,
            digester: Digester::new(),
        }
    }

    /// Digest of all bytes read so far.
    pub fn digest(&self) -> Digest {
        self.digester.clone().finish()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}
