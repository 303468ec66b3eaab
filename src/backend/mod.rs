// Backend module - the Vulkan objects one protected blit needs
//
// Design: Thin wrapper around ash, one file per object kind.
// Every object has an explicit destroy; VulkanDevice cleans up on Drop.

pub mod buffer;
pub mod command;
pub mod device;
pub mod image;
pub mod memory;

pub use buffer::HostBuffer;
pub use command::{BlitResources, CommandContext};
pub use device::{DeviceOptions, VulkanDevice};
pub use image::ProtectedImage;
