// Command recording and submission
//
// One command pool, one primary command buffer, one fence. The buffer is
// recorded once with the whole round trip:
//
//   upload buffer ──copy──> image (protected) ──copy──> readback buffer
//
// and submitted once. In protected mode the pool, the submit and the queue
// are all protected.

use anyhow::{Context, Result};
use ash::vk;

use super::buffer::HostBuffer;
use super::image::ProtectedImage;
use super::VulkanDevice;

/// Everything the blit touches on the GPU
pub struct BlitResources<'a> {
    pub upload: &'a HostBuffer,
    pub image: &'a ProtectedImage,
    pub readback: &'a HostBuffer,
}

pub struct CommandContext {
    pub pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    protected: bool,
}

impl CommandContext {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let protected = device.protected;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            .flags(command_pool_flags(protected));

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let fence_info = vk::FenceCreateInfo::builder();

        let setup = unsafe {
            device
                .device
                .allocate_command_buffers(&alloc_info)
                .context("Failed to allocate command buffer")
                .and_then(|buffers| {
                    let fence = device
                        .device
                        .create_fence(&fence_info, None)
                        .context("Failed to create fence")?;
                    Ok((buffers[0], fence))
                })
        };

        match setup {
            Ok((command_buffer, fence)) => Ok(Self {
                pool,
                command_buffer,
                fence,
                protected,
            }),
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                Err(e)
            }
        }
    }

    /// Record the round trip into the command buffer
    pub fn record_blit(&self, device: &ash::Device, resources: &BlitResources) -> Result<()> {
        let cmd = self.command_buffer;
        let image = resources.image;
        let range = image.subresource_range();
        let region = copy_region(image.extent, image.subresource_layers());

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            // ─────────────────────────────────────────────────────────────
            // Upload buffer readable by transfer, image UNDEFINED -> TRANSFER_DST
            // ─────────────────────────────────────────────────────────────
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[buffer_barrier(
                    resources.upload.buffer,
                    vk::AccessFlags::HOST_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                )],
                &[image_barrier(
                    image.image,
                    range,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )],
            );

            device.cmd_copy_buffer_to_image(
                cmd,
                resources.upload.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            // ─────────────────────────────────────────────────────────────
            // Readback buffer writable, image TRANSFER_DST -> TRANSFER_SRC
            // ─────────────────────────────────────────────────────────────
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[buffer_barrier(
                    resources.readback.buffer,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                )],
                &[image_barrier(
                    image.image,
                    range,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                )],
            );

            device.cmd_copy_image_to_buffer(
                cmd,
                image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                resources.readback.buffer,
                &[region],
            );

            // Make the copy visible to the mapped pointer
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[buffer_barrier(
                    resources.readback.buffer,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::HOST_READ,
                )],
                &[],
            );

            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }

        log::debug!(
            "Recorded blit: {}x{}, protected: {}",
            image.extent.width,
            image.extent.height,
            self.protected
        );
        Ok(())
    }

    /// Submit the recorded command buffer and block until it completes
    pub fn submit_and_wait(&self, device: &VulkanDevice) -> Result<()> {
        let command_buffers = [self.command_buffer];
        let mut protected_info = vk::ProtectedSubmitInfo::builder()
            .protected_submit(true)
            .build();

        let mut submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        if self.protected {
            // Protected command buffers may only go through a protected submit
            submit_info = submit_info.push_next(&mut protected_info);
        }

        unsafe {
            device
                .device
                .queue_submit(device.queue, &[submit_info.build()], self.fence)
                .context("Failed to submit blit")?;

            device
                .device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .context("Failed waiting for blit to complete")?;
        }

        log::info!("Blit submission completed");
        Ok(())
    }

    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.fence, None);
            // Also frees the command buffer
            device.destroy_command_pool(self.pool, None);
        }
    }
}

fn command_pool_flags(protected: bool) -> vk::CommandPoolCreateFlags {
    let flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
    if protected {
        flags | vk::CommandPoolCreateFlags::PROTECTED
    } else {
        flags
    }
}

/// Tightly packed copy covering the whole image
pub fn copy_region(
    extent: vk::Extent2D,
    subresource: vk::ImageSubresourceLayers,
) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: extent.width,
        buffer_image_height: extent.height,
        image_subresource: subresource,
        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
        image_extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

fn buffer_barrier(
    buffer: vk::Buffer,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::BufferMemoryBarrier {
    vk::BufferMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .build()
}

fn image_barrier(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn color_layers() -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    #[test]
    fn copy_region_covers_whole_image() {
        let region = copy_region(
            vk::Extent2D {
                width: 37,
                height: 5,
            },
            color_layers(),
        );

        assert_eq!(region.buffer_offset, 0);
        assert_eq!(region.buffer_row_length, 37);
        assert_eq!(region.buffer_image_height, 5);
        assert_eq!(region.image_extent.width, 37);
        assert_eq!(region.image_extent.height, 5);
        assert_eq!(region.image_extent.depth, 1);
        assert_eq!(region.image_offset.x, 0);
        assert_eq!(region.image_subresource.layer_count, 1);
    }

    #[test]
    fn pool_is_protected_only_in_protected_mode() {
        assert!(command_pool_flags(true).contains(vk::CommandPoolCreateFlags::PROTECTED));
        assert!(!command_pool_flags(false).contains(vk::CommandPoolCreateFlags::PROTECTED));
        assert!(command_pool_flags(false).contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER));
    }

    #[test]
    fn barriers_cover_whole_resource() {
        let buffer = vk::Buffer::from_raw(0x10);
        let barrier = buffer_barrier(
            buffer,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::HOST_READ,
        );
        assert_eq!(barrier.buffer, buffer);
        assert_eq!(barrier.offset, 0);
        assert_eq!(barrier.size, vk::WHOLE_SIZE);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);

        let image = vk::Image::from_raw(0x20);
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let barrier = image_barrier(
            image,
            range,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        assert_eq!(barrier.image, image);
        assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(barrier.subresource_range.level_count, 1);
    }
}
