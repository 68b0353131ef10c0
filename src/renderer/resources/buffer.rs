use std::sync::{Arc, Mutex};
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator},
    MemoryLocation,
};
use crate::renderer::error::{HriError, Result};

pub struct BufferCreateInfo<'a> {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

/// Exclusively owned buffer and its device memory, released on drop
pub struct BufferResource {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,

    allocation: Option<Allocation>,
    memory_allocator: Arc<Mutex<Allocator>>,
    device: Arc<ash::Device>,
}

impl BufferResource {
    pub fn new(
        create_info: &BufferCreateInfo,
        memory_allocator: Arc<Mutex<Allocator>>,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        if create_info.size == 0 {
            return Err(HriError::precondition(format!(
                "Buffer '{}' has zero size",
                create_info.name,
            )));
        }

        let buffer = {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(create_info.size)
                .usage(create_info.usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            unsafe { device.create_buffer(&buffer_info, None)? }
        };

        let reqs = unsafe { device.get_buffer_memory_requirements(buffer) };
        let allocation = memory_allocator
            .lock()
            .map_err(HriError::from)
            .and_then(|mut allocator| {
                Ok(allocator.allocate(&AllocationCreateDesc {
                    name: create_info.name,
                    requirements: reqs,
                    location: create_info.location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })?)
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let mut resource = Self {
            buffer,
            size: create_info.size,
            usage: create_info.usage,

            allocation: Some(allocation),
            memory_allocator,
            device,
        };

        if let Some(allocation) = resource.allocation.as_ref() {
            unsafe {
                resource.device.bind_buffer_memory(
                    resource.buffer,
                    allocation.memory(),
                    allocation.offset(),
                )?;
            }
        }

        Ok(resource)
    }

    /// Only valid for buffers created with `SHADER_DEVICE_ADDRESS` usage
    pub fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    /// Copy `data` into host-visible memory at `start_offset` bytes
    pub fn write<T>(
        &mut self,
        data: &[T],
        start_offset: usize,
    ) -> Result<presser::CopyRecord>
    where
        T: Copy,
    {
        let allocation = self
            .allocation
            .as_mut()
            .ok_or_else(|| HriError::precondition("Buffer has no backing allocation"))?;
        presser::copy_from_slice_to_offset(data, allocation, start_offset)
            .map_err(|e| HriError::MappedCopy(format!("{e:?}")))
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
    }
}

impl Drop for BufferResource {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            match self.memory_allocator.lock() {
                Ok(mut allocator) => {
                    if let Err(err) = allocator.free(allocation) {
                        log::error!("Failed to free buffer allocation: {err}");
                    }
                }
                Err(err) => log::error!("Memory allocator lock poisoned: {err}"),
            }
        }
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// Round `value` up to the next multiple of `alignment`
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_the_next_multiple() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(33, 0), 33);
        assert_eq!(align_up(33, 1), 33);
    }
}
