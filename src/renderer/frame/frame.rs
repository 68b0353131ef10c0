use std::sync::Arc;
use ash::vk;
use crate::renderer::error::Result;
use crate::renderer::frame::submit::CommandPool;

/// Per-slot command recording and synchronization objects
pub struct FrameState {
    pub command_pool: CommandPool,
    pub command_buffer: vk::CommandBuffer,

    // Signals when the acquired swapchain image can be rendered to.
    pub image_available: vk::Semaphore,

    // Signals when rendering commands have finished, presentation waits on it.
    pub render_finished: vk::Semaphore,

    // Signals when all commands of this slot have finished execution.
    pub frame_complete: vk::Fence,

    device: Arc<ash::Device>,
}

impl FrameState {
    pub fn new(
        device: Arc<ash::Device>,
        queue_family_index: u32,
    ) -> Result<Self> {
        let command_pool = CommandPool::new(
            device.clone(),
            queue_family_index,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let command_buffer = command_pool.allocate_primary()?;

        let image_available = unsafe {
            device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        };
        let render_finished = match unsafe {
            device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        } {
            Ok(semaphore) => semaphore,
            Err(err) => {
                unsafe { device.destroy_semaphore(image_available, None) };
                return Err(err.into());
            }
        };
        // Created signaled so the very first wait on this slot returns immediately
        let frame_complete = match unsafe {
            device.create_fence(
                &vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED),
                None,
            )
        } {
            Ok(fence) => fence,
            Err(err) => {
                unsafe {
                    device.destroy_semaphore(image_available, None);
                    device.destroy_semaphore(render_finished, None);
                }
                return Err(err.into());
            }
        };

        Ok(Self {
            command_pool,
            command_buffer,
            image_available,
            render_finished,
            frame_complete,
            device,
        })
    }

    /// Replace both semaphores, used after a presentation left them in an unknown state
    pub fn renew_semaphores(&mut self) -> Result<()> {
        unsafe {
            let image_available = self
                .device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
            let render_finished = match self
                .device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            {
                Ok(semaphore) => semaphore,
                Err(err) => {
                    self.device.destroy_semaphore(image_available, None);
                    return Err(err.into());
                }
            };
            self.device.destroy_semaphore(self.image_available, None);
            self.device.destroy_semaphore(self.render_finished, None);
            self.image_available = image_available;
            self.render_finished = render_finished;
        }
        Ok(())
    }
}

impl Drop for FrameState {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.frame_complete, None);
            self.device.destroy_semaphore(self.render_finished, None);
            self.device.destroy_semaphore(self.image_available, None);
        }
    }
}

/// Frame handed out by `RenderCore::begin_frame`, consumed again by `end_frame`.
///
/// The command buffer is already recording when the frame is returned.
#[derive(Debug)]
pub struct ActiveFrame {
    pub slot: usize,
    pub swap_image_index: u32,
    pub command_buffer: vk::CommandBuffer,
    pub extent: vk::Extent2D,
}

impl ActiveFrame {
    #[allow(clippy::too_many_arguments)]
    pub fn image_memory_barrier(
        &self,
        device: &ash::Device,
        image: vk::Image,
        src_stage: vk::PipelineStageFlags2,
        dst_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        subresource_range: vk::ImageSubresourceRange,
    ) {
        let barrier = vk::ImageMemoryBarrier2::default()
            .image(image)
            .src_stage_mask(src_stage)
            .dst_stage_mask(dst_stage)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(subresource_range);
        let barriers = [barrier];
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe {
            device.cmd_pipeline_barrier2(self.command_buffer, &dependency_info);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn buffer_memory_barrier(
        &self,
        device: &ash::Device,
        buffer: vk::Buffer,
        src_stage: vk::PipelineStageFlags2,
        dst_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        let barrier = vk::BufferMemoryBarrier2::default()
            .buffer(buffer)
            .src_stage_mask(src_stage)
            .dst_stage_mask(dst_stage)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .offset(offset)
            .size(size);
        let barriers = [barrier];
        let dependency_info = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
        unsafe {
            device.cmd_pipeline_barrier2(self.command_buffer, &dependency_info);
        }
    }

    pub fn memory_barrier(
        &self,
        device: &ash::Device,
        src_stage: vk::PipelineStageFlags2,
        dst_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .dst_stage_mask(dst_stage)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        let barriers = [barrier];
        let dependency_info = vk::DependencyInfo::default().memory_barriers(&barriers);
        unsafe {
            device.cmd_pipeline_barrier2(self.command_buffer, &dependency_info);
        }
    }
}
