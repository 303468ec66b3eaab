// Memory type selection
//
// Linear scan over VkPhysicalDeviceMemoryProperties. Kept free of any device
// handle so it can be exercised with a fabricated property table.

use ash::vk;
use std::fmt;

/// What kind of memory an allocation needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequest {
    /// Must be mappable from the CPU
    pub host: bool,
    /// Must carry VK_MEMORY_PROPERTY_PROTECTED_BIT
    pub protected: bool,
}

impl MemoryRequest {
    pub fn device_local(protected: bool) -> Self {
        Self {
            host: false,
            protected,
        }
    }

    /// Flags a memory type must contain to be accepted at all
    pub fn required_flags(&self) -> vk::MemoryPropertyFlags {
        let mut flags = if self.host {
            vk::MemoryPropertyFlags::HOST_VISIBLE
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        if self.protected {
            flags |= vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::PROTECTED;
        }
        flags
    }

    /// Flags that make a type a better pick when present
    pub fn preferred_flags(&self) -> vk::MemoryPropertyFlags {
        self.required_flags() | vk::MemoryPropertyFlags::DEVICE_LOCAL
    }
}

impl fmt::Display for MemoryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.host, self.protected) {
            (true, true) => write!(f, "host-visible protected"),
            (true, false) => write!(f, "host-visible"),
            (false, true) => write!(f, "device-local protected"),
            (false, false) => write!(f, "device-local"),
        }
    }
}

/// Find the lowest memory type index allowed by `allowed_type_bits` that
/// satisfies `request`, preferring device-local types.
///
/// Protected types are only returned for protected requests.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    allowed_type_bits: u32,
    request: MemoryRequest,
) -> Option<u32> {
    let count = properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    let scan = |wanted: vk::MemoryPropertyFlags| {
        (0..count).find(|&i| {
            let flags = properties.memory_types[i as usize].property_flags;
            let allowed = allowed_type_bits & (1 << i) != 0;
            let protected_ok =
                request.protected || !flags.contains(vk::MemoryPropertyFlags::PROTECTED);

            allowed && protected_ok && flags.contains(wanted)
        })
    };

    scan(request.preferred_flags()).or_else(|| scan(request.required_flags()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_VISIBLE: MemoryRequest = MemoryRequest {
        host: true,
        protected: false,
    };

    const DEVICE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const PROTECTED: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::PROTECTED;

    fn table(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        props
    }

    // Roughly what a discrete GPU with protected memory reports
    fn discrete() -> vk::PhysicalDeviceMemoryProperties {
        table(&[
            DEVICE,
            HOST | COHERENT,
            DEVICE | HOST | COHERENT,
            DEVICE | PROTECTED,
        ])
    }

    #[test]
    fn protected_request_finds_protected_type() {
        let idx = find_memory_type(&discrete(), u32::MAX, MemoryRequest::device_local(true));
        assert_eq!(idx, Some(3));
    }

    #[test]
    fn plain_device_request_skips_protected_types() {
        let props = table(&[DEVICE | PROTECTED, DEVICE]);
        let idx = find_memory_type(&props, 0b11, MemoryRequest::device_local(false));
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn host_request_prefers_device_local() {
        let idx = find_memory_type(&discrete(), u32::MAX, HOST_VISIBLE);
        assert_eq!(idx, Some(2));
    }

    #[test]
    fn host_request_falls_back_to_plain_host_memory() {
        // Only type 1 is allowed by the resource
        let idx = find_memory_type(&discrete(), 0b0010, HOST_VISIBLE);
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn flags_must_all_be_present() {
        // A device-local type shares a bit with a protected request but lacks PROTECTED
        let props = table(&[DEVICE, HOST]);
        assert_eq!(
            find_memory_type(&props, u32::MAX, MemoryRequest::device_local(true)),
            None
        );
    }

    #[test]
    fn disallowed_types_are_ignored() {
        assert_eq!(
            find_memory_type(&discrete(), 0b0111, MemoryRequest::device_local(true)),
            None
        );
        assert_eq!(
            find_memory_type(&discrete(), 0, MemoryRequest::device_local(false)),
            None
        );
    }

    #[test]
    fn scan_stops_at_memory_type_count() {
        let mut props = table(&[HOST]);
        // Stale entry past the reported count must never be picked
        props.memory_types[1] = vk::MemoryType {
            property_flags: DEVICE | PROTECTED,
            heap_index: 0,
        };
        assert_eq!(
            find_memory_type(&props, u32::MAX, MemoryRequest::device_local(true)),
            None
        );
    }

    #[test]
    fn request_flags() {
        assert_eq!(
            MemoryRequest::device_local(true).required_flags(),
            DEVICE | PROTECTED
        );
        assert_eq!(HOST_VISIBLE.required_flags(), HOST);
        assert_eq!(HOST_VISIBLE.preferred_flags(), HOST | DEVICE);
        assert_eq!(
            MemoryRequest::device_local(true).to_string(),
            "device-local protected"
        );
    }
}
