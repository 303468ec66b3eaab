// =============================================================================
// BLIT - the whole round trip, start to finish
// =============================================================================
//
//   input file ─decode─> upload buffer ─copy─> protected image
//                                                    │
//   output file <─encode─ readback buffer <─copy─────┘
//
// Each GPU object is owned by one function, which destroys it on the way out
// whether or not the inner steps succeeded.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::path::Path;

use crate::backend::image::fits_extent;
use crate::backend::{
    BlitResources, CommandContext, DeviceOptions, HostBuffer, ProtectedImage, VulkanDevice,
};
use crate::config::Config;
use crate::pixels::{self, PixelDiff, RgbaPixels};

/// Summary of one run
#[derive(Debug, Clone)]
pub struct BlitReport {
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
    pub protected: bool,
    /// None when verification was turned off
    pub diff: Option<PixelDiff>,
}

pub fn run(config: &Config, input: &Path, output: &Path) -> Result<BlitReport> {
    // Fail on a bad output path before touching the GPU
    pixels::output_format(output)?;

    let source = RgbaPixels::load(input)?;

    let device = VulkanDevice::new(&DeviceOptions {
        app_name: config.blit.app_name.clone(),
        device_index: config.device.index,
        enable_validation: config.device.validation_layers,
        protected: config.blit.protected,
    })?;

    let result = blit_through_device(&device, &source)?;
    result.save(output)?;

    let diff = if config.blit.verify {
        let diff = pixels::compare(&source, &result)?;
        if diff.is_identical() {
            log::info!("Read-back matches input ({} pixels)", diff.total_pixels);
        } else {
            // Reading protected contents into unprotected memory is
            // implementation-defined, so this is an observation, not a failure
            log::warn!(
                "Read-back differs from input: {} of {} pixels (protectedNoFault: {})",
                diff.mismatched_pixels,
                diff.total_pixels,
                device.protected_no_fault
            );
        }
        Some(diff)
    } else {
        None
    };

    Ok(BlitReport {
        width: source.width,
        height: source.height,
        bytes: source.byte_len(),
        protected: device.protected,
        diff,
    })
}

/// Copy `source` into a (protected) GPU image and back out again
pub fn blit_through_device(device: &VulkanDevice, source: &RgbaPixels) -> Result<RgbaPixels> {
    let extent = vk::Extent2D {
        width: source.width,
        height: source.height,
    };
    let limit = device.properties.limits.max_image_dimension2_d;
    fits_extent(
        extent,
        vk::Extent3D {
            width: limit,
            height: limit,
            depth: 1,
        },
    )
    .context("Input image does not fit maxImageDimension2D")?;
    log::debug!(
        "Staging {} bytes, row stride {}",
        source.byte_len(),
        source.row_stride()
    );

    let mut upload = HostBuffer::new(
        device,
        source.byte_len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        "blit upload",
    )?;

    let result = upload
        .write(&source.data)
        .and_then(|_| with_image(device, &upload, extent));

    upload.destroy(device);
    result
}

fn with_image(device: &VulkanDevice, upload: &HostBuffer, extent: vk::Extent2D) -> Result<RgbaPixels> {
    let image = ProtectedImage::new(device, extent, device.protected)?;
    let result = with_readback(device, upload, &image);
    image.destroy(device);
    result
}

fn with_readback(
    device: &VulkanDevice,
    upload: &HostBuffer,
    image: &ProtectedImage,
) -> Result<RgbaPixels> {
    let readback = HostBuffer::new(
        device,
        upload.size,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuToCpu,
        "blit readback",
    )?;

    let resources = BlitResources {
        upload,
        image,
        readback: &readback,
    };

    let result = execute(device, &resources).and_then(|_| {
        let len = pixels::byte_len(image.extent.width, image.extent.height)?;
        let bytes = readback.read(len)?;
        RgbaPixels::from_raw(image.extent.width, image.extent.height, bytes.to_vec())
    });

    readback.destroy(device);
    result
}

fn execute(device: &VulkanDevice, resources: &BlitResources) -> Result<()> {
    let context = CommandContext::new(device)?;

    let result = context
        .record_blit(&device.device, resources)
        .and_then(|_| context.submit_and_wait(device));

    if result.is_err() {
        // Work may still be in flight on a failed wait
        if let Err(e) = device.wait_idle() {
            log::warn!("wait_idle after failed blit: {:#}", e);
        }
    }
    context.destroy(&device.device);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(width: u32, height: u32) -> RgbaPixels {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                let on = (x / 8 + y / 8) % 2 == 0;
                let v = if on { 0xFF } else { 0x20 };
                data.extend_from_slice(&[v, x as u8, y as u8, 0xFF]);
            }
        }
        RgbaPixels::from_raw(width, height, data).unwrap()
    }

    fn options(protected: bool) -> DeviceOptions {
        DeviceOptions {
            app_name: "blit-protected tests".to_string(),
            device_index: 0,
            enable_validation: false,
            protected,
        }
    }

    #[test]
    #[ignore = "needs a Vulkan device"]
    fn unprotected_round_trip_preserves_pixels() {
        let device = VulkanDevice::new(&options(false)).unwrap();
        let source = checkerboard(67, 33);

        let result = blit_through_device(&device, &source).unwrap();
        assert_eq!(result, source);
    }

    #[test]
    #[ignore = "needs a Vulkan device with protectedMemory"]
    fn protected_round_trip_completes() {
        let device = VulkanDevice::new(&options(true)).unwrap();
        let source = checkerboard(64, 64);

        // Contents are implementation-defined once they leave protected memory
        let result = blit_through_device(&device, &source).unwrap();
        assert_eq!((result.width, result.height), (64, 64));
        assert_eq!(result.byte_len(), source.byte_len());
    }

    #[test]
    fn bad_output_extension_fails_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();

        // Input does not exist either; the output check must come first
        let err = run(
            &config,
            &dir.path().join("missing.png"),
            &dir.path().join("out.nope"),
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("Unknown output image format"));
    }

    #[test]
    fn missing_input_fails_before_device_creation() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();

        let err = run(
            &config,
            &dir.path().join("missing.png"),
            &dir.path().join("out.png"),
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to open input image"));
    }
}
