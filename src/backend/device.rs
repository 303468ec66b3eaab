// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation (validation layers optional)
// - Physical device selection by index, protected-memory capability check
// - Logical device + protected queue creation
// - Memory allocator setup for the host-visible staging buffers

use anyhow::{Context, Result};
use ash::{vk, Entry};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// How the device should be brought up
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub app_name: String,
    /// Index into vkEnumeratePhysicalDevices
    pub device_index: usize,
    pub enable_validation: bool,
    /// Require protectedMemory and create a protected-capable queue
    pub protected: bool,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device is destroyed
    allocator: ManuallyDrop<Mutex<gpu_allocator::vulkan::Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub queue: vk::Queue,
    pub queue_family: u32,

    /// Whether the queue and the device were created protected-capable
    pub protected: bool,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// VkPhysicalDeviceProtectedMemoryProperties::protectedNoFault
    pub protected_no_fault: bool,
}

impl VulkanDevice {
    /// Create the Vulkan device used for the blit
    pub fn new(options: &DeviceOptions) -> Result<Arc<Self>> {
        log::info!(
            "Creating Vulkan device: {} ({})",
            options.app_name,
            if options.protected { "protected" } else { "unprotected" }
        );

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance =
            Self::create_instance(&entry, &options.app_name, options.enable_validation)?;
        // Until Self owns them, everything created below is torn down on `?`
        let instance_guard = Teardown::new(|| unsafe { instance.destroy_instance(None) });

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if options.enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };
        let messenger_guard = Teardown::new(|| {
            if let Some((loader, messenger)) = &debug_utils {
                unsafe { loader.destroy_debug_utils_messenger(*messenger, None) };
            }
        });

        // Step 4: Pick physical device and check protected support
        let physical_device = Self::pick_physical_device(&instance, options.device_index)?;

        let protected_supported = Self::protected_memory_supported(&instance, physical_device);
        if options.protected && !protected_supported {
            anyhow::bail!(
                "Physical device {} does not support protectedMemory \
                 (rerun with --unprotected for a baseline blit)",
                options.device_index
            );
        }
        let protected_no_fault = Self::protected_no_fault(&instance, physical_device);

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Vendor id {:04x}, device name {}",
            properties.vendor_id,
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "protectedMemory: {}, protectedNoFault: {}",
            protected_supported,
            protected_no_fault
        );

        // Step 5: Find a queue family
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_family = select_queue_family(&queue_families, options.protected)
            .with_context(|| {
                format!(
                    "No queue family with {:?} on device {}",
                    required_queue_flags(options.protected),
                    options.device_index
                )
            })?;

        // Step 6: Create logical device
        let (device, queue) = Self::create_logical_device(
            &instance,
            physical_device,
            queue_family,
            options.protected,
        )?;
        let device_guard = Teardown::new(|| unsafe { device.destroy_device(None) });

        // Step 7: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        device_guard.disarm();
        messenger_guard.disarm();
        instance_guard.disarm();

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            queue,
            queue_family,
            protected: options.protected,
            debug_utils,
            properties,
            memory_properties,
            protected_no_fault,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;

        // Protected memory is core in 1.1
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions = vec![];
        let mut layer_names = vec![];
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            layer_names.push(c"VK_LAYER_KHRONOS_validation".as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance, index: usize) -> Result<vk::PhysicalDevice> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }
        log::info!("{} physical devices", devices.len());

        devices.get(index).copied().with_context(|| {
            format!(
                "Physical device index {} out of range ({} available)",
                index,
                devices.len()
            )
        })
    }

    fn protected_memory_supported(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> bool {
        let mut protected_features = vk::PhysicalDeviceProtectedMemoryFeatures::default();
        {
            let mut features = vk::PhysicalDeviceFeatures2::builder().push_next(&mut protected_features);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
        }
        protected_features.protected_memory == vk::TRUE
    }

    fn protected_no_fault(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
        let mut protected_properties = vk::PhysicalDeviceProtectedMemoryProperties::default();
        {
            let mut properties =
                vk::PhysicalDeviceProperties2::builder().push_next(&mut protected_properties);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties) };
        }
        protected_properties.protected_no_fault == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        protected: bool,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_flags = if protected {
            vk::DeviceQueueCreateFlags::PROTECTED
        } else {
            vk::DeviceQueueCreateFlags::empty()
        };

        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .flags(queue_flags)
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let mut protected_features = vk::PhysicalDeviceProtectedMemoryFeatures::builder()
            .protected_memory(protected)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .push_next(&mut protected_features)
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        // Queues created with flags must be fetched with vkGetDeviceQueue2
        let queue = if protected {
            let queue_info = vk::DeviceQueueInfo2::builder()
                .flags(queue_flags)
                .queue_family_index(queue_family)
                .queue_index(0);
            unsafe { device.get_device_queue2(&queue_info) }
        } else {
            unsafe { device.get_device_queue(queue_family, 0) }
        };

        Ok((device, queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<gpu_allocator::vulkan::Allocator> {
        let allocator =
            gpu_allocator::vulkan::Allocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    /// Staging-buffer allocator
    pub fn allocator(&self) -> &Mutex<gpu_allocator::vulkan::Allocator> {
        &self.allocator
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::warn!("wait_idle before device teardown failed: {:#}", e);
        }

        unsafe {
            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Runs its cleanup when dropped unless `disarm`ed first.
///
/// ash handles have no Drop of their own, so a bring-up that fails halfway
/// would otherwise leak whatever was already created.
struct Teardown<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> Teardown<F> {
    fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// Ownership moved elsewhere; skip the cleanup
    fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for Teardown<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

fn required_queue_flags(protected: bool) -> vk::QueueFlags {
    if protected {
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::PROTECTED
    } else {
        vk::QueueFlags::GRAPHICS
    }
}

/// First queue family that can run the blit
pub fn select_queue_family(families: &[vk::QueueFamilyProperties], protected: bool) -> Option<u32> {
    let required = required_queue_flags(protected);
    families
        .iter()
        .position(|family| family.queue_count > 0 && family.queue_flags.contains(required))
        .map(|i| i as u32)
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn protected_blit_needs_protected_graphics_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::TRANSFER | vk::QueueFlags::PROTECTED, 1),
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::PROTECTED,
                1,
            ),
        ];
        assert_eq!(select_queue_family(&families, true), Some(2));
        assert_eq!(select_queue_family(&families, false), Some(0));
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::PROTECTED, 0),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::PROTECTED, 4),
        ];
        assert_eq!(select_queue_family(&families, true), Some(1));
    }

    // Mirrors the bring-up shape: instance, then messenger, then device,
    // with a failure at a chosen step
    fn bring_up(fail_at: usize, log: &RefCell<Vec<&'static str>>) -> Result<()> {
        let step = |n: usize| -> Result<()> {
            if n == fail_at {
                anyhow::bail!("step {} failed", n);
            }
            Ok(())
        };

        step(0)?;
        let instance = Teardown::new(|| log.borrow_mut().push("instance"));
        step(1)?;
        let messenger = Teardown::new(|| log.borrow_mut().push("messenger"));
        step(2)?;
        let device = Teardown::new(|| log.borrow_mut().push("device"));
        step(3)?;

        device.disarm();
        messenger.disarm();
        instance.disarm();
        Ok(())
    }

    #[test]
    fn failed_bring_up_destroys_what_was_created_in_reverse() {
        let log = RefCell::new(Vec::new());
        assert!(bring_up(3, &log).is_err());
        assert_eq!(*log.borrow(), vec!["device", "messenger", "instance"]);

        let log = RefCell::new(Vec::new());
        assert!(bring_up(2, &log).is_err());
        assert_eq!(*log.borrow(), vec!["messenger", "instance"]);

        let log = RefCell::new(Vec::new());
        assert!(bring_up(1, &log).is_err());
        assert_eq!(*log.borrow(), vec!["instance"]);
    }

    #[test]
    fn successful_bring_up_leaves_objects_alone() {
        let log = RefCell::new(Vec::new());
        assert!(bring_up(usize::MAX, &log).is_ok());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn no_family_matches() {
        let families = [family(vk::QueueFlags::COMPUTE, 2)];
        assert_eq!(select_queue_family(&families, false), None);
        assert_eq!(select_queue_family(&[], true), None);
    }
}
