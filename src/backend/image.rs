// Destination image for the blit
//
// Lives in protected device memory unless the device was brought up in
// unprotected mode. Allocated directly (not through gpu-allocator) so the
// memory type is picked by `find_memory_type` with the PROTECTED bit.

use anyhow::{Context, Result};
use ash::vk;

use super::memory::{find_memory_type, MemoryRequest};
use super::VulkanDevice;

/// Pixel format the blit runs in; input is always expanded to RGBA8
pub const BLIT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

const BLIT_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::TRANSFER_SRC.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

pub struct ProtectedImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub extent: vk::Extent2D,
}

impl ProtectedImage {
    pub fn new(device: &VulkanDevice, extent: vk::Extent2D, protected: bool) -> Result<Self> {
        let create_flags = image_create_flags(protected);
        check_format_support(device, extent, create_flags)?;

        let image_info = vk::ImageCreateInfo::builder()
            .flags(create_flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(BLIT_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(BLIT_USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            device
                .device
                .create_image(&image_info, None)
                .context("Failed to create destination image")?
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let request = MemoryRequest::device_local(protected);

        let memory = match Self::allocate(device, requirements, request) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let this = Self {
            image,
            memory,
            extent,
        };

        if let Err(e) = unsafe { device.device.bind_image_memory(image, memory, 0) } {
            this.destroy(device);
            return Err(e).context("Failed to bind destination image memory");
        }

        log::info!(
            "Created {}x{} {:?} image in {} memory ({} bytes)",
            extent.width,
            extent.height,
            BLIT_FORMAT,
            request,
            requirements.size
        );
        Ok(this)
    }

    fn allocate(
        device: &VulkanDevice,
        requirements: vk::MemoryRequirements,
        request: MemoryRequest,
    ) -> Result<vk::DeviceMemory> {
        let memory_type_index = find_memory_type(
            &device.memory_properties,
            requirements.memory_type_bits,
            request,
        )
        .with_context(|| {
            format!(
                "No {} memory type in allowed set {:#b}",
                request, requirements.memory_type_bits
            )
        })?;
        log::debug!("Using memory type {} for {} image", memory_type_index, request);

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            device
                .device
                .allocate_memory(&alloc_info, None)
                .context("Failed to allocate destination image memory")?
        };
        Ok(memory)
    }

    /// Whole image: color aspect, one mip, one layer
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    pub fn subresource_layers(&self) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_image(self.image, None);
            device.device.free_memory(self.memory, None);
        }
    }
}

fn image_create_flags(protected: bool) -> vk::ImageCreateFlags {
    if protected {
        vk::ImageCreateFlags::PROTECTED
    } else {
        vk::ImageCreateFlags::empty()
    }
}

/// Fail early if the driver cannot host an image of this size and kind
fn check_format_support(
    device: &VulkanDevice,
    extent: vk::Extent2D,
    create_flags: vk::ImageCreateFlags,
) -> Result<()> {
    let format_properties = unsafe {
        device.instance.get_physical_device_image_format_properties(
            device.physical_device,
            BLIT_FORMAT,
            vk::ImageType::TYPE_2D,
            vk::ImageTiling::OPTIMAL,
            BLIT_USAGE,
            create_flags,
        )
    }
    .with_context(|| {
        format!(
            "{:?} with OPTIMAL tiling, {:?} usage and {:?} flags is not supported",
            BLIT_FORMAT, BLIT_USAGE, create_flags
        )
    })?;

    fits_extent(extent, format_properties.max_extent)
}

pub fn fits_extent(extent: vk::Extent2D, max_extent: vk::Extent3D) -> Result<()> {
    if extent.width == 0 || extent.height == 0 {
        anyhow::bail!("Image has zero size ({}x{})", extent.width, extent.height);
    }
    if extent.width > max_extent.width || extent.height > max_extent.height {
        anyhow::bail!(
            "Image {}x{} exceeds the device limit of {}x{}",
            extent.width,
            extent.height,
            max_extent.width,
            max_extent.height
        );
    }
    Ok(())
}
