// Host-visible staging buffers
//
// The upload and readback buffers live in ordinary host-visible memory and
// stay mapped for their whole lifetime. Memory comes from gpu-allocator.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;

/// Buffer + persistently mapped allocation
pub struct HostBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Allocation,
}

impl HostBuffer {
    /// Create a buffer of `size` bytes in host-visible memory.
    ///
    /// `location` should be `CpuToGpu` for uploads and `GpuToCpu` for readback.
    pub fn new(
        device: &VulkanDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .with_context(|| format!("Failed to create buffer '{}'", name))?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let this = Self {
            buffer,
            size,
            allocation,
        };
        if let Err(e) = bound {
            this.destroy(device);
            return Err(e).with_context(|| format!("Failed to bind memory for '{}'", name));
        }

        log::debug!("Created {} byte buffer '{}' ({:?})", size, name, location);
        Ok(this)
    }

    /// Copy `bytes` to the start of the buffer
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as vk::DeviceSize > self.size {
            anyhow::bail!(
                "Write of {} bytes exceeds buffer size {}",
                bytes.len(),
                self.size
            );
        }

        let mapped = self
            .allocation
            .mapped_slice_mut()
            .context("Upload buffer is not host mapped")?;
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// View the first `len` bytes of the buffer
    pub fn read(&self, len: usize) -> Result<&[u8]> {
        if len as vk::DeviceSize > self.size {
            anyhow::bail!("Read of {} bytes exceeds buffer size {}", len, self.size);
        }

        let mapped = self
            .allocation
            .mapped_slice()
            .context("Readback buffer is not host mapped")?;
        Ok(&mapped[..len])
    }

    pub fn destroy(self, device: &VulkanDevice) {
        if let Err(e) = device.allocator().lock().free(self.allocation) {
            log::warn!("Failed to free buffer allocation: {}", e);
        }
        unsafe { device.device.destroy_buffer(self.buffer, None) };
    }
}
