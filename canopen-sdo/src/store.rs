//! Object dictionary as seen by the SDO server.
//!
//! The server never keeps a copy of an object. It asks the store for byte
//! ranges while it streams. Domain objects are different: the store only
//! holds a bounded staging chunk, and the engine addresses it with
//! chunk-relative offsets between two domain indications.

use std::collections::BTreeMap;

use crate::abort::AbortReason;
use crate::frame::ObjectAddress;

/// Access rights of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub read: bool,
    pub write: bool,
}

impl Access {
    pub const READ_ONLY: Access = Access { read: true, write: false };
    pub const WRITE_ONLY: Access = Access { read: false, write: true };
    pub const READ_WRITE: Access = Access { read: true, write: true };
}

/// What the store reports about an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Current size in bytes. For domains the size of the whole value.
    pub size: usize,
    /// Largest size a write may declare.
    pub max_size: usize,
    pub access: Access,
    /// Numeric objects must be written with their exact size.
    pub numeric: bool,
    pub domain: bool,
}

impl Default for ObjectInfo {
    fn default() -> Self {
        Self {
            size: 0,
            max_size: 0,
            access: Access::READ_WRITE,
            numeric: false,
            domain: false,
        }
    }
}

/// Object dictionary storage and access control.
pub trait ObjectStore {
    /// Look up an object. Fails with `ObjectNotFound` or `SubIndexNotFound`.
    fn describe(&self, address: ObjectAddress) -> Result<ObjectInfo, AbortReason>;

    /// Copy `buf.len()` bytes starting at `offset` out of the object.
    fn read(&mut self, address: ObjectAddress, offset: usize, buf: &mut [u8]) -> Result<(), AbortReason>;

    /// Copy `data` into the object starting at `offset`.
    fn write(&mut self, address: ObjectAddress, offset: usize, data: &[u8]) -> Result<(), AbortReason>;

    /// Record the actual size after a completed write.
    fn set_size(&mut self, address: ObjectAddress, size: usize) -> Result<(), AbortReason>;

    /// Validate a complete value against the object's numeric limits.
    fn check_limits(&self, _address: ObjectAddress, _value: &[u8]) -> Result<(), AbortReason> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    info: ObjectInfo,
    limits: Option<(i64, i64)>,
}

/// Object store backed by memory, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<ObjectAddress, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte string object with room for `max_size` bytes.
    pub fn insert(&mut self, address: ObjectAddress, value: &[u8], max_size: usize, access: Access) {
        let mut data = value.to_vec();
        data.resize(max_size.max(value.len()), 0);
        let info = ObjectInfo {
            size: value.len(),
            max_size: max_size.max(value.len()),
            access,
            numeric: false,
            domain: false,
        };
        self.entries.insert(address, Entry { data, info, limits: None });
    }

    /// Numeric object, little endian, fixed size.
    pub fn insert_numeric(&mut self, address: ObjectAddress, value: &[u8], access: Access) {
        self.insert(address, value, value.len(), access);
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.info.numeric = true;
        }
    }

    /// Domain object announcing `size` bytes, the store only holds a chunk.
    pub fn insert_domain(&mut self, address: ObjectAddress, size: usize, max_size: usize, access: Access) {
        let info = ObjectInfo {
            size,
            max_size,
            access,
            numeric: false,
            domain: true,
        };
        self.entries.insert(address, Entry { data: Vec::new(), info, limits: None });
    }

    /// Inclusive limits for numeric writes, value interpreted as unsigned LE.
    pub fn set_limits(&mut self, address: ObjectAddress, min: i64, max: i64) {
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.limits = Some((min, max));
        }
    }

    /// Current value, or for domains the staged chunk.
    pub fn value(&self, address: ObjectAddress) -> Option<&[u8]> {
        self.entries.get(&address).map(|entry| {
            if entry.info.domain {
                &entry.data[..]
            } else {
                &entry.data[..entry.info.size]
            }
        })
    }

    /// Replace the staged chunk of a domain.
    pub fn stage_chunk(&mut self, address: ObjectAddress, chunk: &[u8]) -> Result<(), AbortReason> {
        let entry = self.entries.get_mut(&address).ok_or(AbortReason::ObjectNotFound)?;
        entry.data.clear();
        entry.data.extend_from_slice(chunk);
        Ok(())
    }

    /// Addresses of all objects in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = ObjectAddress> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, address: ObjectAddress) -> Result<&Entry, AbortReason> {
        match self.entries.get(&address) {
            Some(entry) => Ok(entry),
            None if self.entries.keys().any(|a| a.index == address.index) => {
                Err(AbortReason::SubIndexNotFound)
            }
            None => Err(AbortReason::ObjectNotFound),
        }
    }
}

impl ObjectStore for MemoryStore {
    fn describe(&self, address: ObjectAddress) -> Result<ObjectInfo, AbortReason> {
        self.entry(address).map(|entry| entry.info)
    }

    fn read(&mut self, address: ObjectAddress, offset: usize, buf: &mut [u8]) -> Result<(), AbortReason> {
        let entry = self.entry(address)?;
        let src = entry
            .data
            .get(offset..offset + buf.len())
            .ok_or(AbortReason::NoData)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, address: ObjectAddress, offset: usize, data: &[u8]) -> Result<(), AbortReason> {
        self.entry(address)?;
        let entry = self.entries.get_mut(&address).ok_or(AbortReason::ObjectNotFound)?;
        let end = offset + data.len();
        if entry.info.domain {
            if entry.data.len() < end {
                entry.data.resize(end, 0);
            }
        } else if end > entry.data.len() {
            return Err(AbortReason::OutOfMemory);
        }
        entry.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn set_size(&mut self, address: ObjectAddress, size: usize) -> Result<(), AbortReason> {
        let entry = self.entries.get_mut(&address).ok_or(AbortReason::ObjectNotFound)?;
        if !entry.info.domain && size > entry.data.len() {
            return Err(AbortReason::OutOfMemory);
        }
        entry.info.size = size;
        Ok(())
    }

    fn check_limits(&self, address: ObjectAddress, value: &[u8]) -> Result<(), AbortReason> {
        let entry = self.entry(address)?;
        let Some((min, max)) = entry.limits else {
            return Ok(());
        };
        if value.len() > 8 {
            return Err(AbortReason::DataTypeMismatch);
        }
        let mut raw = [0u8; 8];
        raw[..value.len()].copy_from_slice(value);
        let number = u64::from_le_bytes(raw) as i64;
        if number < min {
            Err(AbortReason::ValueTooLow)
        } else if number > max {
            Err(AbortReason::ValueTooHigh)
        } else {
            Ok(())
        }
    }
}
