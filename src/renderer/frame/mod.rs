pub mod cycle;
pub mod frame;
pub mod submit;

use std::sync::Arc;
use std::time::Duration;
use ash::vk;
use crate::renderer::config::timeout_nanos;
use crate::renderer::core::context::RenderContext;
use crate::renderer::error::{HriError, Result};
use crate::renderer::frame::cycle::{FrameCycle, FrameStage};
use crate::renderer::frame::frame::{ActiveFrame, FrameState};
use crate::renderer::frame::submit::ImmediateSubmitter;

/// Invoked after the swapchain was recreated; window-size dependent resources must be rebuilt before returning
pub type SwapchainInvalidateFunc = Box<dyn FnMut(&RenderContext) -> Result<()>>;

/// Outcome of `RenderCore::begin_frame`
#[derive(Debug)]
pub enum FrameBegin {
    Ready(ActiveFrame),
    /// The swapchain could not be acquired after recreation, or the surface has no area
    Skipped,
}

/// Outcome of `RenderCore::end_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    Presented,
    /// Presentation reported a stale swapchain; it has been recreated already
    SwapchainRecreated,
    /// The frame was presented to a stale swapchain that cannot be rebuilt while the surface
    /// has no area; the next frame retries
    RecreationPending,
}

impl FrameEnd {
    fn after_rebuild(rebuilt: bool) -> Self {
        if rebuilt {
            FrameEnd::SwapchainRecreated
        } else {
            FrameEnd::RecreationPending
        }
    }
}

/// Owns the in-flight frame slots and drives acquire, submit and present
pub struct RenderCore {
    frames: Vec<FrameState>,
    cycle: FrameCycle,
    submitter: ImmediateSubmitter,
    on_swapchain_invalidate: Option<SwapchainInvalidateFunc>,
    recreate_swapchain: bool,
    frame_timeout: Duration,
    device: Arc<ash::Device>,
}

impl RenderCore {
    pub fn new(
        ctx: &RenderContext,
        frame_timeout: Duration,
    ) -> Result<Self> {
        ctx.swapchain()?;

        let depth = ctx.vsync_mode().frames_in_flight();
        let cycle = FrameCycle::new(depth)?;
        let frames = (0..depth)
            .map(|_| FrameState::new(ctx.device.clone(), ctx.queues.graphics.family.index))
            .collect::<Result<Vec<_>>>()?;

        let submitter = ImmediateSubmitter::new(
            ctx.queues.graphics.clone(),
            frame_timeout,
            ctx.device.clone(),
        )?;

        log::debug!("Render core created with {} frame slots", depth);

        Ok(Self {
            frames,
            cycle,
            submitter,
            on_swapchain_invalidate: None,
            recreate_swapchain: false,
            frame_timeout,
            device: ctx.device.clone(),
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn current_slot(&self) -> usize {
        self.cycle.current_slot()
    }

    /// Number of frames begun so far, usable as a frame-boundary marker
    pub fn frame_number(&self) -> u64 {
        self.cycle.frames_started()
    }

    pub fn stage(&self) -> FrameStage {
        self.cycle.stage()
    }

    /// Register the swapchain invalidation hook, returning the previously registered one
    pub fn set_on_swapchain_invalidate(
        &mut self,
        callback: SwapchainInvalidateFunc,
    ) -> Option<SwapchainInvalidateFunc> {
        self.on_swapchain_invalidate.replace(callback)
    }

    /// Force a swapchain rebuild at the start of the next frame, e.g. after a window resize
    pub fn request_swapchain_recreation(&mut self) {
        self.recreate_swapchain = true;
    }

    pub fn begin_frame(&mut self, ctx: &mut RenderContext) -> Result<FrameBegin> {
        if self.cycle.stage() != FrameStage::Idle {
            return Err(HriError::precondition(format!(
                "begin_frame called while the previous frame is {:?}",
                self.cycle.stage(),
            )));
        }

        let slot = self.cycle.current_slot();
        self.wait_for_slot(slot)?;
        self.cycle.mark_retired(slot)?;

        if self.recreate_swapchain && !self.rebuild_swapchain(ctx)? {
            return Ok(FrameBegin::Skipped);
        }

        let image_available = self.frames[slot].image_available;
        let mut retried = false;
        let swap_image_index = loop {
            let swapchain = ctx.swapchain()?;
            let acquired = unsafe {
                swapchain.loader.acquire_next_image(
                    swapchain.handle,
                    timeout_nanos(self.frame_timeout),
                    image_available,
                    vk::Fence::null(),
                )
            };
            match acquired {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        // The image is usable, rebuild after this frame has been presented
                        self.recreate_swapchain = true;
                    }
                    break index;
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) if !retried => {
                    retried = true;
                    if !self.rebuild_swapchain(ctx)? {
                        return Ok(FrameBegin::Skipped);
                    }
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    log::warn!("Swapchain still out of date after recreation, skipping frame");
                    self.recreate_swapchain = true;
                    return Ok(FrameBegin::Skipped);
                }
                Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                    return Err(HriError::Timeout {
                        timeout: self.frame_timeout,
                        what: "swapchain image",
                    });
                }
                Err(err) => return Err(err.into()),
            }
        };

        self.cycle.acquire()?;
        let frame = &self.frames[slot];
        let begun = unsafe {
            // Only reset the fence once work is guaranteed to be submitted for this slot
            self.device.reset_fences(&[frame.frame_complete])
                .and_then(|_| {
                    self.device.reset_command_pool(
                        frame.command_pool.handle,
                        vk::CommandPoolResetFlags::empty(),
                    )
                })
                .and_then(|_| {
                    let begin_info = vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                    self.device.begin_command_buffer(frame.command_buffer, &begin_info)
                })
        };
        if let Err(err) = begun {
            self.cycle.abandon();
            return Err(err.into());
        }
        self.cycle.start_recording()?;

        Ok(FrameBegin::Ready(ActiveFrame {
            slot,
            swap_image_index,
            command_buffer: frame.command_buffer,
            extent: ctx.swapchain()?.extent,
        }))
    }

    pub fn end_frame(&mut self, ctx: &mut RenderContext, active: ActiveFrame) -> Result<FrameEnd> {
        if active.slot != self.cycle.current_slot() || self.cycle.stage() != FrameStage::Recording {
            return Err(HriError::precondition(format!(
                "end_frame called for slot {} while slot {} is {:?}",
                active.slot,
                self.cycle.current_slot(),
                self.cycle.stage(),
            )));
        }

        let frame = &self.frames[active.slot];
        unsafe {
            self.device.end_command_buffer(frame.command_buffer)?;
        }

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [frame.render_finished];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.device.queue_submit(
                ctx.queues.graphics.handle,
                &[submit_info],
                frame.frame_complete,
            )?;
        }
        self.cycle.submit()?;

        let presented = {
            let swapchain = ctx.swapchain()?;
            let swapchains = [swapchain.handle];
            let image_indices = [active.swap_image_index];
            let present_info = vk::PresentInfoKHR::default()
                .wait_semaphores(&signal_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);
            unsafe {
                swapchain
                    .loader
                    .queue_present(ctx.present_queue().handle, &present_info)
            }
        };
        self.cycle.present()?;
        self.cycle.finish()?;

        let stale = match presented {
            Ok(suboptimal) => suboptimal || self.recreate_swapchain,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                // The render-finished semaphore may never be waited on, start the slot fresh
                self.wait_for_slot(active.slot)?;
                self.frames[active.slot].renew_semaphores()?;
                true
            }
            Err(err) => return Err(err.into()),
        };

        if !stale {
            return Ok(FrameEnd::Presented);
        }
        Ok(FrameEnd::after_rebuild(self.rebuild_swapchain(ctx)?))
    }

    /// Block until the given slot's last submission has finished executing
    pub fn await_frame_finished(&self, slot: usize) -> Result<()> {
        if slot >= self.frames.len() {
            return Err(HriError::precondition(format!("Frame slot {slot} does not exist")));
        }
        self.wait_for_slot(slot)
    }

    /// Block until the most recently submitted frame has finished executing
    pub fn await_previous_frame(&self) -> Result<()> {
        self.wait_for_slot(self.cycle.previous_slot())
    }

    /// Block until every slot has retired, e.g. before tearing down frame resources
    pub fn await_all_frames(&self) -> Result<()> {
        (0..self.frames.len()).try_for_each(|slot| self.wait_for_slot(slot))
    }

    pub fn immediate_submit<F>(&self, func: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer, &ash::Device) -> Result<()>,
    {
        self.submitter.submit(func)
    }

    fn wait_for_slot(&self, slot: usize) -> Result<()> {
        let fence = self.frames[slot].frame_complete;
        let waited = unsafe {
            self.device
                .wait_for_fences(&[fence], true, timeout_nanos(self.frame_timeout))
        };
        match waited {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(HriError::Timeout {
                timeout: self.frame_timeout,
                what: "frame fence",
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns `false` when the surface currently has no area and the frame has to be skipped
    fn rebuild_swapchain(&mut self, ctx: &mut RenderContext) -> Result<bool> {
        if !ctx.recreate_swapchain()? {
            log::debug!("Surface has no area, postponing swapchain recreation");
            self.recreate_swapchain = true;
            return Ok(false);
        }
        self.recreate_swapchain = false;

        if let Some(callback) = self.on_swapchain_invalidate.as_mut() {
            callback(ctx)?;
        }

        Ok(true)
    }
}

impl Drop for RenderCore {
    fn drop(&mut self) {
        if let Err(err) = self.await_all_frames() {
            log::error!("Failed to wait for in-flight frames: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postponed_rebuild_is_reported_as_pending() {
        assert_eq!(FrameEnd::after_rebuild(true), FrameEnd::SwapchainRecreated);
        assert_eq!(FrameEnd::after_rebuild(false), FrameEnd::RecreationPending);
        assert_ne!(FrameEnd::after_rebuild(false), FrameEnd::Presented);
    }
}
