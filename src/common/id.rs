//! Node identifier, storage key, or lookup target in the 160-bit XOR metric space.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// The size of identifiers in bytes.
pub const ID_SIZE: usize = 20;
/// The size of identifiers in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Node identifier, storage key, or lookup target.
///
/// Ordering is lexicographic on the big-endian bytes, which matches the
/// numeric order of the 160-bit unsigned integer it represents.
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// Generates a random Id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Derives an Id by hashing arbitrary seed bytes with SHA-1,
    /// the canonical way keys and node ids enter the keyspace.
    pub fn from_seed<T: AsRef<[u8]>>(seed: T) -> Id {
        Id(sha1_smol::Sha1::from(seed.as_ref()).digest().bytes())
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of
    /// length [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// XOR distance to another Id, itself an Id usable as a 160-bit
    /// unsigned integer through its `Ord` implementation.
    pub fn xor(&self, other: &Id) -> Id {
        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(bytes)
    }

    /// The routing table bucket an `other` id falls into relative to this id:
    /// `floor(log2(distance))`, so ids differing in the first bit land in
    /// bucket 159 and distance one lands in bucket 0.
    ///
    /// Returns None for the id itself, which belongs to no bucket.
    pub fn bucket_index(&self, other: &Id) -> Option<u8> {
        for i in 0..ID_SIZE {
            let xor = self.0[i] ^ other.0[i];

            if xor != 0 {
                let leading_zeros = i as u32 * 8 + xor.leading_zeros();

                return Some((ID_BITS as u32 - 1 - leading_zeros) as u8);
            }
        }

        None
    }

    /// A uniformly random id whose distance to this id falls within the
    /// given bucket, used to refresh distant buckets after joining.
    pub fn random_within_bucket(&self, index: u8) -> Id {
        let mut rng = rand::thread_rng();

        // The distance must have its top set bit at exactly `index`.
        let leading_zeros = ID_BITS - 1 - index as usize;
        let byte = leading_zeros / 8;
        let offset = leading_zeros % 8;

        let mut distance = [0_u8; ID_SIZE];
        distance[byte] = (0x80 >> offset) | (rng.gen::<u8>() & (0x7f >> offset));
        for b in distance.iter_mut().skip(byte + 1) {
            *b = rng.gen();
        }

        let mut bytes = self.0;
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte ^= distance[i];
        }

        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    /// Lowercase hex of length 40, the wire representation.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Id, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
