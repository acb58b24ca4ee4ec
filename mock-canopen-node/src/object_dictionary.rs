//! Object Dictionary for the mock CANopen node
//!
//! Static objects live in a [`MemoryStore`]. Sensor-like objects have a
//! generator that produces a fresh value whenever a client starts reading
//! them. The program domain keeps its bytes here and hands them to the SDO
//! server one chunk at a time.

use std::collections::BTreeMap;

use canopen_sdo::server::DomainChunk;
use canopen_sdo::{AbortReason, Access, MemoryStore, ObjectAddress, ObjectInfo, ObjectStore};
use log::info;
use rand::Rng;

/// 0x1F50:01 - Program data (Domain)
pub const PROGRAM_DATA: ObjectAddress = ObjectAddress::new(0x1F50, 0x01);
const PROGRAM_MAX_SIZE: usize = 64 * 1024;

type Generator = Box<dyn FnMut() -> Vec<u8>>;

/// Object dictionary served by the mock node
pub struct ObjectDictionary {
    store: MemoryStore,
    dynamic: BTreeMap<ObjectAddress, Generator>,
    program: Vec<u8>,
}

impl ObjectDictionary {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            dynamic: BTreeMap::new(),
            program: Vec::new(),
        }
    }

    /// Add a numeric entry (exact size on writes)
    pub fn add_numeric(&mut self, address: ObjectAddress, value: &[u8], access: Access) {
        self.store.insert_numeric(address, value, access);
    }

    /// Add a string entry with room for `max_len` bytes
    pub fn add_string(&mut self, address: ObjectAddress, value: &str, max_len: usize, access: Access) {
        self.store.insert(address, value.as_bytes(), max_len, access);
    }

    /// Add a read-only numeric entry regenerated before every read
    pub fn add_dynamic<F>(&mut self, address: ObjectAddress, mut generator: F)
    where
        F: FnMut() -> Vec<u8> + 'static,
    {
        let initial = generator();
        self.store.insert_numeric(address, &initial, Access::READ_ONLY);
        self.dynamic.insert(address, Box::new(generator));
    }

    /// Replace the program domain
    pub fn set_program(&mut self, program: Vec<u8>) {
        self.program = program;
        self.store
            .insert_domain(PROGRAM_DATA, self.program.len(), PROGRAM_MAX_SIZE, Access::READ_WRITE);
    }

    pub fn program(&self) -> &[u8] {
        &self.program
    }

    /// Produce a new value if `address` is a dynamic object.
    pub fn refresh(&mut self, address: ObjectAddress) -> Result<(), AbortReason> {
        if let Some(generator) = self.dynamic.get_mut(&address) {
            let value = generator();
            self.store.write(address, 0, &value)?;
        }
        Ok(())
    }

    /// Stage the part of the program a domain read asks for.
    pub fn stage_program_chunk(&mut self, chunk: &DomainChunk) -> Result<(), AbortReason> {
        let bytes = self
            .program
            .get(chunk.offset..chunk.offset + chunk.len)
            .ok_or(AbortReason::NoData)?;
        self.store.stage_chunk(PROGRAM_DATA, bytes)
    }

    /// Take a chunk a domain write left in the staging area.
    pub fn store_program_chunk(&mut self, chunk: &DomainChunk) -> Result<(), AbortReason> {
        let staged = self.store.value(PROGRAM_DATA).ok_or(AbortReason::ObjectNotFound)?;
        let bytes = staged.get(..chunk.len).ok_or(AbortReason::NoData)?;
        self.program.truncate(chunk.offset);
        self.program.extend_from_slice(bytes);
        if chunk.last {
            info!("📥 Program download complete: {} bytes", self.program.len());
        }
        Ok(())
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Print a summary of all objects
    pub fn print_summary(&self) {
        for address in self.store.addresses() {
            let Ok(info) = self.store.describe(address) else {
                continue;
            };
            let kind = if self.dynamic.contains_key(&address) {
                "Dynamic"
            } else if info.domain {
                "Domain"
            } else {
                "Static"
            };
            let access = match (info.access.read, info.access.write) {
                (true, true) => "rw",
                (true, false) => "ro",
                (false, true) => "wo",
                (false, false) => "--",
            };
            info!("  {} - {} {} ({} bytes)", address, kind, access, info.size);
        }
    }

    /// Add standard test objects for demonstration
    pub fn add_test_objects_for_node(&mut self, node_id: u8) {
        // 0x1000:00 - Device Type (UInt32)
        self.add_numeric(ObjectAddress::new(0x1000, 0x00), &0x0000_0191u32.to_le_bytes(), Access::READ_ONLY);

        // 0x1001:00 - Error Register (UInt8)
        self.add_numeric(ObjectAddress::new(0x1001, 0x00), &[0x00], Access::READ_ONLY);

        // 0x1008:00 - Device Name (String), writable so clients can rename the node
        let device_name = format!("MockCANopenNode{}", node_id);
        self.add_string(ObjectAddress::new(0x1008, 0x00), &device_name, 64, Access::READ_WRITE);

        // 0x1018:01 - Vendor ID (UInt32)
        self.add_numeric(ObjectAddress::new(0x1018, 0x01), &0x0000_0001u32.to_le_bytes(), Access::READ_ONLY);

        // 0x2000:01 - Temperature Sensor (Real32)
        self.add_dynamic(ObjectAddress::new(0x2000, 0x01), || {
            let temp: f32 = rand::rng().random_range(20.0..30.0);
            temp.to_le_bytes().to_vec()
        });

        // 0x2000:02 - Pressure Sensor (Real32)
        self.add_dynamic(ObjectAddress::new(0x2000, 0x02), || {
            let pressure: f32 = rand::rng().random_range(95.0..105.0);
            pressure.to_le_bytes().to_vec()
        });

        // 0x2001:01 - Counter (UInt32), incrementing
        let mut counter = 0u32;
        self.add_dynamic(ObjectAddress::new(0x2001, 0x01), move || {
            let value = counter;
            counter = counter.wrapping_add(1);
            value.to_le_bytes().to_vec()
        });

        // 0x2003:01 - Status Word (UInt16)
        self.add_numeric(ObjectAddress::new(0x2003, 0x01), &0x0031u16.to_le_bytes(), Access::READ_ONLY);

        // 0x2003:02 - Control Word (UInt16), limited to the low byte
        let control_word = ObjectAddress::new(0x2003, 0x02);
        self.add_numeric(control_word, &0x000Fu16.to_le_bytes(), Access::READ_WRITE);
        self.store.set_limits(control_word, 0, 0xFF);

        // 0x2004:01 - RPM (Int32)
        self.add_dynamic(ObjectAddress::new(0x2004, 0x01), || {
            let rpm: i32 = rand::rng().random_range(1000..3000);
            rpm.to_le_bytes().to_vec()
        });

        // 0x1F50:01 - Program data, a firmware-like blob large enough for block mode
        let program = (0..2048u32).map(|i| (i.wrapping_mul(31) ^ (i >> 3)) as u8).collect();
        self.set_program(program);
    }
}

impl Default for ObjectDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for ObjectDictionary {
    fn describe(&self, address: ObjectAddress) -> Result<ObjectInfo, AbortReason> {
        self.store.describe(address)
    }

    fn read(&mut self, address: ObjectAddress, offset: usize, buf: &mut [u8]) -> Result<(), AbortReason> {
        self.store.read(address, offset, buf)
    }

    fn write(&mut self, address: ObjectAddress, offset: usize, data: &[u8]) -> Result<(), AbortReason> {
        self.store.write(address, offset, data)
    }

    fn set_size(&mut self, address: ObjectAddress, size: usize) -> Result<(), AbortReason> {
        self.store.set_size(address, size)
    }

    fn check_limits(&self, address: ObjectAddress, value: &[u8]) -> Result<(), AbortReason> {
        self.store.check_limits(address, value)
    }
}
