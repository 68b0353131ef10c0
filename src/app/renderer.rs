use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use ash::vk;
use raw_window_handle::HasDisplayHandle;
use winit::window::Window;
use hri::renderer::config::RenderConfig;
use hri::renderer::core::context::{RenderContext, RenderContextCreateInfo};
use hri::renderer::core::instance::{required_surface_extensions, surface_create_func};
use hri::renderer::frame::{FrameBegin, FrameEnd, RenderCore};
use hri::renderer::render_pass::RenderPassResourceManager;
use hri::renderer::render_pass::swapchain::{swapchain_render_pass, SwapchainPassResourceManager};
use hri::Result;

/// Clears the swapchain image every frame
pub struct DemoRenderer {
    // Field order is drop order
    swap_pass: Rc<RefCell<SwapchainPassResourceManager>>,
    core: RenderCore,
    ctx: RenderContext,
}

impl DemoRenderer {
    pub fn new(window: Arc<Window>, config: &RenderConfig) -> Result<Self> {
        let size = window.inner_size();
        let instance_extensions = required_surface_extensions(window.display_handle()?.as_raw())?;

        let ctx = RenderContext::new(RenderContextCreateInfo {
            app_name: config.app_name.clone(),
            surface_create_func: Some(surface_create_func(window)),
            initial_extent: vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            vsync_mode: config.vsync_mode,
            instance_extensions,
            enable_ray_tracing: config.enable_ray_tracing,
            ..Default::default()
        })?;

        let render_pass = swapchain_render_pass(&ctx, &[])?;
        let swap_pass = Rc::new(RefCell::new(
            SwapchainPassResourceManager::new(&ctx, render_pass, Vec::new())?,
        ));

        let mut core = RenderCore::new(&ctx, config.frame_timeout)?;
        let invalidated_pass = Rc::clone(&swap_pass);
        core.set_on_swapchain_invalidate(Box::new(move |ctx| {
            invalidated_pass.borrow_mut().recreate_resources(ctx)
        }));

        Ok(Self {
            swap_pass,
            core,
            ctx,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.ctx.set_surface_extent(vk::Extent2D { width, height });
        self.core.request_swapchain_recreation();
    }

    pub fn draw(&mut self, clear_color: [f32; 4]) -> Result<()> {
        let frame = match self.core.begin_frame(&mut self.ctx)? {
            FrameBegin::Ready(frame) => frame,
            FrameBegin::Skipped => return Ok(()),
        };

        {
            let mut pass = self.swap_pass.borrow_mut();
            pass.set_clear_value(0, vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            })?;
            pass.begin_render_pass(&self.ctx.device, &frame)?;
            pass.end_render_pass(&self.ctx.device, &frame)?;
        }

        if self.core.end_frame(&mut self.ctx, frame)? == FrameEnd::SwapchainRecreated {
            log::debug!("Swapchain recreated after frame {}", self.core.frame_number());
        }
        Ok(())
    }
}
