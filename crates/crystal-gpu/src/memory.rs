//! GPU memory management.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::Allocation(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
        })
    }

    /// Allocate memory for the given requirements.
    pub fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::Allocation(e.to_string()))
    }

    /// Return an allocation to the allocator.
    pub fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .free(allocation)
            .map_err(|e| GpuError::Allocation(e.to_string()))
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Backing memory of a buffer or image.
#[derive(Debug, Default)]
pub enum MemoryBlock {
    /// Memory owned by the Vulkan allocator.
    Allocated(Allocation),
    /// Host-side copy kept by the headless device.
    Host(Vec<u8>),
    /// Already returned to the device.
    #[default]
    Released,
}

impl MemoryBlock {
    /// CPU-visible view of the memory, if mapped.
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        match self {
            Self::Allocated(allocation) => allocation.mapped_slice(),
            Self::Host(bytes) => Some(bytes),
            Self::Released => None,
        }
    }

    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Allocated(allocation) => allocation.mapped_slice_mut(),
            Self::Host(bytes) => Some(bytes),
            Self::Released => None,
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self, Self::Released)
    }

    /// Copy `data` into mapped memory at `offset`.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let slice = self
            .mapped_slice_mut()
            .ok_or_else(|| GpuError::InvalidState("Memory not host visible".to_string()))?;
        let range = checked_range(offset, data.len(), slice.len())?;
        slice[range].copy_from_slice(data);
        Ok(())
    }

    /// Read `len` bytes of mapped memory starting at `offset`.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let slice = self
            .mapped_slice()
            .ok_or_else(|| GpuError::InvalidState("Memory not host visible".to_string()))?;
        let range = checked_range(offset, len, slice.len())?;
        Ok(slice[range].to_vec())
    }
}

fn checked_range(offset: u64, len: usize, capacity: usize) -> Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset)
        .map_err(|_| GpuError::InvalidState("Offset overflow".to_string()))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
    if end > capacity {
        return Err(GpuError::InvalidState(format!(
            "Range {start}..{end} exceeds mapped size {capacity}"
        )));
    }
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_block_round_trips_bytes() {
        let mut block = MemoryBlock::Host(vec![0; 16]);
        block.write_bytes(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(block.read_bytes(4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(block.read_bytes(0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn out_of_range_write_is_rejected() {
        let mut block = MemoryBlock::Host(vec![0; 8]);
        assert!(block.write_bytes(6, &[0; 4]).is_err());
        assert!(block.write_bytes(u64::MAX, &[0; 1]).is_err());
    }

    #[test]
    fn released_block_is_not_mapped() {
        let mut block = MemoryBlock::Released;
        assert!(block.is_released());
        assert!(block.write_bytes(0, &[1]).is_err());
    }
}
