//! Per-device memory: capacity accounting and byte storage.

use std::collections::HashMap;

use memcopy_core::{DeviceId, DevicePtr, MemcopyError, MemoryMode, Result};

/// Address bits reserved per device. The device index lives above them.
const DEVICE_SHIFT: u32 = 40;

/// Rounds `n` up to the nearest multiple of `align` (a power of two).
/// `None` if the result does not fit in a `u64`.
fn round_up(n: u64, align: u64) -> Option<u64> {
    Some(n.checked_add(align - 1)? & !(align - 1))
}

struct Region {
    bytes: Vec<u8>,
    reserved: u64,
    mode: MemoryMode,
}

/// Memory of one simulated device.
///
/// Allocations are page-aligned and reserve whole pages (at least one, so a
/// zero-byte allocation still has a unique address). Addresses are never
/// reused, so a stale pointer always fails with `InvalidHandle`.
pub struct DeviceMemory {
    device: DeviceId,
    capacity: u64,
    page_size: u64,
    used: u64,
    next_addr: u64,
    regions: HashMap<DevicePtr, Region>,
}

impl DeviceMemory {
    pub fn new(device: DeviceId, capacity: u64, page_size: u64) -> Self {
        Self {
            device,
            capacity,
            page_size,
            used: 0,
            next_addr: Self::base(device),
            regions: HashMap::new(),
        }
    }

    fn base(device: DeviceId) -> u64 {
        (device.0 as u64 + 1) << DEVICE_SHIFT
    }

    /// Which device issued `ptr`, judging by its address.
    pub fn owner(ptr: DevicePtr) -> Option<DeviceId> {
        let hi = ptr.0 >> DEVICE_SHIFT;
        let idx = hi.checked_sub(1)?;
        u32::try_from(idx).ok().map(DeviceId)
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn available(&self) -> u64 {
        self.capacity - self.used
    }

    pub fn live_allocations(&self) -> usize {
        self.regions.len()
    }

    pub fn allocate(&mut self, size: u64, mode: MemoryMode) -> Result<DevicePtr> {
        let reserved = round_up(size.max(1), self.page_size)
            .filter(|&r| r <= self.available())
            .ok_or(MemcopyError::OutOfMemory {
                device: self.device,
                requested: size,
                available: self.available(),
            })?;
        let len = usize::try_from(size).map_err(|_| MemcopyError::OutOfMemory {
            device: self.device,
            requested: size,
            available: self.available(),
        })?;
        let ptr = DevicePtr(self.next_addr);
        self.next_addr += reserved;
        self.used += reserved;
        self.regions.insert(
            ptr,
            Region {
                bytes: vec![0; len],
                reserved,
                mode,
            },
        );
        Ok(ptr)
    }

    pub fn free(&mut self, ptr: DevicePtr) -> Result<u64> {
        let region = self
            .regions
            .remove(&ptr)
            .ok_or(MemcopyError::InvalidHandle(ptr))?;
        self.used -= region.reserved;
        Ok(region.bytes.len() as u64)
    }

    /// Logical length of a live allocation.
    pub fn len_of(&self, ptr: DevicePtr) -> Result<usize> {
        self.regions
            .get(&ptr)
            .map(|r| r.bytes.len())
            .ok_or(MemcopyError::InvalidHandle(ptr))
    }

    pub fn mode_of(&self, ptr: DevicePtr) -> Result<MemoryMode> {
        self.regions
            .get(&ptr)
            .map(|r| r.mode)
            .ok_or(MemcopyError::InvalidHandle(ptr))
    }

    pub fn write(&mut self, ptr: DevicePtr, offset: usize, data: &[u8]) -> Result<()> {
        let region = self
            .regions
            .get_mut(&ptr)
            .ok_or(MemcopyError::InvalidHandle(ptr))?;
        let dst = region
            .bytes
            .get_mut(offset..offset + data.len())
            .ok_or(MemcopyError::InvalidHandle(ptr))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, ptr: DevicePtr, offset: usize, dst: &mut [u8]) -> Result<()> {
        let region = self
            .regions
            .get(&ptr)
            .ok_or(MemcopyError::InvalidHandle(ptr))?;
        let src = region
            .bytes
            .get(offset..offset + dst.len())
            .ok_or(MemcopyError::InvalidHandle(ptr))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Copy `len` bytes at `offset` from `src` to the same offset in `dst`.
    pub fn copy(&mut self, dst: DevicePtr, src: DevicePtr, offset: usize, len: usize) -> Result<()> {
        let mut staging = vec![0; len];
        self.read(src, offset, &mut staging)?;
        self.write(dst, offset, &staging)
    }
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("device", &self.device)
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("live", &self.regions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(capacity: u64) -> DeviceMemory {
        DeviceMemory::new(DeviceId(2), capacity, 4096)
    }

    #[test]
    fn test_page_aligned_addresses() {
        let mut m = mem(1 << 20);
        let a = m.allocate(100, MemoryMode::Device).unwrap();
        let b = m.allocate(5000, MemoryMode::Device).unwrap();
        assert_eq!(a.0 % 4096, 0);
        assert_eq!(b.0 - a.0, 4096);
        assert_eq!(m.used(), 4096 + 8192);
        assert_eq!(DeviceMemory::owner(a), Some(DeviceId(2)));
    }

    #[test]
    fn test_zero_size_gets_unique_address() {
        let mut m = mem(1 << 20);
        let a = m.allocate(0, MemoryMode::Device).unwrap();
        let b = m.allocate(0, MemoryMode::Device).unwrap();
        assert_ne!(a, b);
        assert_eq!(m.len_of(a).unwrap(), 0);
        assert_eq!(m.free(a).unwrap(), 0);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mut m = mem(8192);
        m.allocate(8192, MemoryMode::Device).unwrap();
        let err = m.allocate(1, MemoryMode::Device).unwrap_err();
        assert!(matches!(
            err,
            MemcopyError::OutOfMemory {
                requested: 1,
                available: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_huge_request_is_out_of_memory() {
        let mut m = mem(1 << 20);
        for size in [u64::MAX, u64::MAX - 4095, (1 << 20) + 1] {
            let err = m.allocate(size, MemoryMode::Device).unwrap_err();
            assert!(matches!(
                err,
                MemcopyError::OutOfMemory {
                    requested,
                    available: 1048576,
                    ..
                } if requested == size
            ));
        }
        assert_eq!(m.used(), 0);
        assert_eq!(m.live_allocations(), 0);
    }

    #[test]
    fn test_round_up_overflow() {
        assert_eq!(round_up(1, 4096), Some(4096));
        assert_eq!(round_up(4096, 4096), Some(4096));
        assert_eq!(round_up(u64::MAX, 4096), None);
    }

    #[test]
    fn test_free_returns_capacity_and_rejects_stale() {
        let mut m = mem(8192);
        let a = m.allocate(8192, MemoryMode::Unified).unwrap();
        assert_eq!(m.mode_of(a).unwrap(), MemoryMode::Unified);
        m.free(a).unwrap();
        assert_eq!(m.available(), 8192);
        assert!(matches!(m.free(a), Err(MemcopyError::InvalidHandle(_))));
        m.allocate(8192, MemoryMode::Device).unwrap();
    }

    #[test]
    fn test_read_write_copy() {
        let mut m = mem(1 << 20);
        let a = m.allocate(8, MemoryMode::Device).unwrap();
        let b = m.allocate(8, MemoryMode::Device).unwrap();
        m.write(a, 2, &[1, 2, 3]).unwrap();
        m.copy(b, a, 0, 8).unwrap();
        let mut out = [0u8; 8];
        m.read(b, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3, 0, 0, 0]);
        assert!(m.write(a, 6, &[0; 3]).is_err());
    }

    #[test]
    fn test_owner_of_foreign_address() {
        assert_eq!(DeviceMemory::owner(DevicePtr(0x1000)), None);
    }
}
