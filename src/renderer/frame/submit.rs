use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;
use ash::vk;
use crate::renderer::config::timeout_nanos;
use crate::renderer::core::queue::Queue;
use crate::renderer::error::{HriError, Result};

/// Command pool bound to one queue family, destroyed on drop
pub struct CommandPool {
    pub handle: vk::CommandPool,
    pub queue_family_index: u32,
    device: Arc<ash::Device>,
}

impl CommandPool {
    pub fn new(
        device: Arc<ash::Device>,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let command_pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);
        let handle = unsafe { device.create_command_pool(&command_pool_info, None)? };

        Ok(Self {
            handle,
            queue_family_index,
            device,
        })
    }

    pub fn allocate_primary(&self) -> Result<vk::CommandBuffer> {
        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle)
            .command_buffer_count(1)
            .level(vk::CommandBufferLevel::PRIMARY);
        let buffers = unsafe { self.device.allocate_command_buffers(&command_buffer_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(HriError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    pub fn free(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.free_command_buffers(self.handle, &[command_buffer]);
        }
    }

    /// Recycles every command buffer allocated from this pool
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(self.handle, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.handle, None);
        }
    }
}

/// Command buffer borrowed from a pool for a single submission, returned on every exit path
struct ScopedCommandBuffer<'a> {
    pool: &'a CommandPool,
    handle: vk::CommandBuffer,
    pending: bool,
}

impl<'a> ScopedCommandBuffer<'a> {
    fn new(pool: &'a CommandPool) -> Result<Self> {
        Ok(Self {
            pool,
            handle: pool.allocate_primary()?,
            pending: false,
        })
    }
}

impl Drop for ScopedCommandBuffer<'_> {
    fn drop(&mut self) {
        if self.pending {
            // A submission that never completed still references the buffer
            if let Err(err) = unsafe { self.pool.device.device_wait_idle() } {
                log::error!("Failed to drain device before releasing a command buffer: {err}");
            }
        }
        self.pool.free(self.handle);
    }
}

/// Whether a fence may still be signaled from an earlier submission
#[derive(Debug, Default)]
struct FenceTracker {
    used: Cell<bool>,
}

impl FenceTracker {
    fn submitted(&self) {
        self.used.set(true);
    }

    fn needs_reset(&self) -> bool {
        self.used.get()
    }

    fn reset(&self) {
        self.used.set(false);
    }
}

/// Synchronous one-off submissions outside the frame loop, e.g. uploads and acceleration structure builds
pub struct ImmediateSubmitter {
    fence: vk::Fence,
    fence_state: FenceTracker,
    pool: CommandPool,
    queue: Queue,
    timeout: Duration,
    device: Arc<ash::Device>,
}

impl ImmediateSubmitter {
    pub fn new(
        queue: Queue,
        timeout: Duration,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        let pool = CommandPool::new(
            device.clone(),
            queue.family.index,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let fence = unsafe {
            device.create_fence(&vk::FenceCreateInfo::default(), None)?
        };

        Ok(Self {
            fence,
            fence_state: FenceTracker::default(),
            pool,
            queue,
            timeout,
            device,
        })
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn submit<F>(&self, func: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer, &ash::Device) -> Result<()>,
    {
        // A timed out submission leaves the fence signaled once its buffer drained
        if self.fence_state.needs_reset() {
            unsafe {
                self.device.reset_fences(&[self.fence])?;
            }
            self.fence_state.reset();
        }

        let mut cmd = ScopedCommandBuffer::new(&self.pool)?;

        // This command buffer will be used exactly once before being freed
        let cmd_begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device.begin_command_buffer(cmd.handle, &cmd_begin_info)?;
        }

        func(cmd.handle, &self.device)?;

        unsafe {
            self.device.end_command_buffer(cmd.handle)?;
        }

        let command_buffers = [cmd.handle];
        let submit = vk::SubmitInfo::default()
            .command_buffers(&command_buffers);
        unsafe {
            self.device.queue_submit(self.queue.handle, &[submit], self.fence)?;
        }
        cmd.pending = true;
        self.fence_state.submitted();

        let wait = unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, timeout_nanos(self.timeout))
        };
        match wait {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                return Err(HriError::Timeout {
                    timeout: self.timeout,
                    what: "immediate submission",
                });
            }
            Err(err) => return Err(err.into()),
        }
        cmd.pending = false;

        unsafe {
            self.device.reset_fences(&[self.fence])?;
        }
        self.fence_state.reset();

        Ok(())
    }
}

impl Drop for ImmediateSubmitter {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_fence_needs_no_reset() {
        assert!(!FenceTracker::default().needs_reset());
    }

    #[test]
    fn fence_left_by_abandoned_wait_is_reset_before_reuse() {
        let tracker = FenceTracker::default();
        tracker.submitted();
        // The wait timed out, so the completion path never ran
        assert!(tracker.needs_reset());

        tracker.reset();
        assert!(!tracker.needs_reset());
    }
}
