pub mod gbuffer;
pub mod presentation;
pub mod raytracing;

use ash::vk;
use crate::renderer::error::{HriError, Result};
use crate::renderer::frame::frame::ActiveFrame;
use crate::renderer::shaders::{PipelineStateObject, ShaderDatabase};

/// A unit of per-frame command recording
pub trait RenderSubsystem {
    fn record(&mut self, frame: &ActiveFrame) -> Result<()>;
}

/// Handles of a pipeline owned by the `ShaderDatabase`.
///
/// These are copies; once the database replaces the named pipeline and `destroy_retired`
/// runs, they dangle until `refresh` picks up the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineBinding {
    pub bind_point: vk::PipelineBindPoint,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl From<&PipelineStateObject> for PipelineBinding {
    fn from(pso: &PipelineStateObject) -> Self {
        Self {
            bind_point: pso.bind_point,
            pipeline: pso.pipeline,
            layout: pso.layout_handle(),
        }
    }
}

impl PipelineBinding {
    /// Re-resolve `name` in the database, returning whether the handles changed
    pub fn refresh(&mut self, shader_db: &ShaderDatabase, name: &str) -> Result<bool> {
        let current = PipelineBinding::from(shader_db.get_pipeline(name)?);
        Ok(self.update(current))
    }

    fn update(&mut self, current: PipelineBinding) -> bool {
        let changed = *self != current;
        *self = current;
        changed
    }

    pub fn bind(&self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_pipeline(command_buffer, self.bind_point, self.pipeline);
        }
    }

    pub fn bind_descriptor_set(
        &self,
        device: &ash::Device,
        command_buffer: vk::CommandBuffer,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            device.cmd_bind_descriptor_sets(
                command_buffer,
                self.bind_point,
                self.layout,
                set_index,
                &[set],
                &[],
            );
        }
    }
}

/// Viewport and scissor covering the whole frame
pub(crate) fn set_full_viewport(device: &ash::Device, frame: &ActiveFrame) {
    let extent = frame.extent;
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: crate::renderer::shaders::pipeline::DEFAULT_VIEWPORT_MIN_DEPTH,
        max_depth: crate::renderer::shaders::pipeline::DEFAULT_VIEWPORT_MAX_DEPTH,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    unsafe {
        device.cmd_set_viewport(frame.command_buffer, 0, &[viewport]);
        device.cmd_set_scissor(frame.command_buffer, 0, &[scissor]);
    }
}

/// Named subsystems, recorded in registration order
#[derive(Default)]
pub struct RenderSubsystemManager {
    subsystems: Vec<(String, Box<dyn RenderSubsystem>)>,
}

impl RenderSubsystemManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subsystem`; a subsystem already registered under `name` is replaced in place
    /// and returned
    pub fn register(
        &mut self,
        name: impl Into<String>,
        subsystem: Box<dyn RenderSubsystem>,
    ) -> Option<Box<dyn RenderSubsystem>> {
        let name = name.into();
        match self.subsystems.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => {
                log::warn!("Replacing render subsystem '{name}'");
                Some(std::mem::replace(existing, subsystem))
            }
            None => {
                log::debug!("Registered render subsystem '{name}'");
                self.subsystems.push((name, subsystem));
                None
            }
        }
    }

    pub fn unregister(&mut self, name: &str) -> Result<Box<dyn RenderSubsystem>> {
        let index = self.position(name)?;
        Ok(self.subsystems.remove(index).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.subsystems.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.subsystems.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.subsystems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsystems.is_empty()
    }

    pub fn record(&mut self, name: &str, frame: &ActiveFrame) -> Result<()> {
        let index = self.position(name)?;
        self.subsystems[index].1.record(frame)
    }

    /// Stops at the first failing subsystem
    pub fn record_all(&mut self, frame: &ActiveFrame) -> Result<()> {
        for (name, subsystem) in &mut self.subsystems {
            subsystem.record(frame).inspect_err(|err| {
                log::error!("Render subsystem '{name}' failed to record: {err}");
            })?;
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.subsystems
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| HriError::not_found("render subsystem", name))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use ash::vk::Handle;
    use super::*;
    use crate::renderer::error::ErrorClass;

    struct Recorder {
        tag: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
        fail: bool,
    }

    impl RenderSubsystem for Recorder {
        fn record(&mut self, _frame: &ActiveFrame) -> Result<()> {
            self.log.borrow_mut().push(self.tag);
            if self.fail {
                Err(HriError::precondition("recording failed"))
            } else {
                Ok(())
            }
        }
    }

    fn recorder(tag: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> Box<dyn RenderSubsystem> {
        Box::new(Recorder { tag, log: log.clone(), fail: false })
    }

    fn frame() -> ActiveFrame {
        ActiveFrame {
            slot: 0,
            swap_image_index: 0,
            command_buffer: vk::CommandBuffer::from_raw(0x10),
            extent: vk::Extent2D { width: 64, height: 64 },
        }
    }

    fn binding(pipeline: u64) -> PipelineBinding {
        PipelineBinding {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            pipeline: vk::Pipeline::from_raw(pipeline),
            layout: vk::PipelineLayout::from_raw(7),
        }
    }

    #[test]
    fn replaced_pipeline_is_picked_up() {
        let mut cached = binding(1);
        assert!(cached.update(binding(2)));
        assert_eq!(cached.pipeline, vk::Pipeline::from_raw(2));

        assert!(!cached.update(binding(2)));
    }

    #[test]
    fn record_all_follows_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut manager = RenderSubsystemManager::new();
        manager.register("gbuffer", recorder("gbuffer", &log));
        manager.register("raytracing", recorder("raytracing", &log));
        manager.register("present", recorder("present", &log));

        manager.record_all(&frame()).unwrap();
        assert_eq!(*log.borrow(), vec!["gbuffer", "raytracing", "present"]);
    }

    #[test]
    fn register_replaces_in_place() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut manager = RenderSubsystemManager::new();
        manager.register("a", recorder("a", &log));
        manager.register("b", recorder("b", &log));
        assert!(manager.register("a", recorder("a2", &log)).is_some());

        assert_eq!(manager.len(), 2);
        manager.record_all(&frame()).unwrap();
        assert_eq!(*log.borrow(), vec!["a2", "b"]);
    }

    #[test]
    fn unknown_names_are_not_found() {
        let mut manager = RenderSubsystemManager::new();
        let err = manager.record("missing", &frame()).unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert!(manager.unregister("missing").is_err());
    }

    #[test]
    fn record_by_name_and_unregister() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut manager = RenderSubsystemManager::new();
        manager.register("a", recorder("a", &log));
        manager.register("b", recorder("b", &log));

        manager.record("b", &frame()).unwrap();
        manager.unregister("b").unwrap();
        assert!(!manager.contains("b"));
        assert_eq!(manager.names().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(*log.borrow(), vec!["b"]);
    }

    #[test]
    fn record_all_stops_at_first_failure() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut manager = RenderSubsystemManager::new();
        manager.register("a", recorder("a", &log));
        manager.register("bad", Box::new(Recorder { tag: "bad", log: log.clone(), fail: true }));
        manager.register("c", recorder("c", &log));

        assert!(manager.record_all(&frame()).is_err());
        assert_eq!(*log.borrow(), vec!["a", "bad"]);
    }
}
