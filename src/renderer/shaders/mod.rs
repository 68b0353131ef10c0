pub mod pipeline;
pub mod shader;

use std::collections::BTreeMap;
use std::sync::Arc;
use ash::vk;
use crate::renderer::error::{HriError, Result};
use crate::renderer::shaders::pipeline::{build_compute_pipeline, GraphicsPipelineBuilder, PipelineLayout};
use crate::renderer::shaders::shader::Shader;

/// Name-keyed store where inserting an existing name replaces the entry
#[derive(Debug)]
pub struct NamedCache<V> {
    kind: &'static str,
    entries: BTreeMap<String, V>,
}

impl<V> NamedCache<V> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Returns the entry that was replaced, if any
    pub fn insert(&mut self, name: impl Into<String>, value: V) -> Option<V> {
        self.entries.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Result<&V> {
        self.entries
            .get(name)
            .ok_or_else(|| HriError::not_found(self.kind, name))
    }

    pub fn remove(&mut self, name: &str) -> Result<V> {
        self.entries
            .remove(name)
            .ok_or_else(|| HriError::not_found(self.kind, name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Pipeline together with its bind point and layout
pub struct PipelineStateObject {
    pub bind_point: vk::PipelineBindPoint,
    pub pipeline: vk::Pipeline,
    pub layout: Arc<PipelineLayout>,
    device: Arc<ash::Device>,
}

impl PipelineStateObject {
    pub fn layout_handle(&self) -> vk::PipelineLayout {
        self.layout.handle
    }

    pub fn bind(&self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_pipeline(command_buffer, self.bind_point, self.pipeline);
        }
    }
}

impl Drop for PipelineStateObject {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

/// Named shaders and pipelines.
///
/// Replaced pipelines are retired rather than destroyed, since frames in flight may still use
/// them; `destroy_retired` releases them once the caller has waited for those frames.
pub struct ShaderDatabase {
    pipelines: NamedCache<PipelineStateObject>,
    retired: Vec<PipelineStateObject>,
    shaders: NamedCache<Shader>,
    pipeline_cache: vk::PipelineCache,
    device: Arc<ash::Device>,
}

impl ShaderDatabase {
    pub fn new(device: Arc<ash::Device>) -> Result<Self> {
        let pipeline_cache = unsafe {
            device.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)?
        };

        Ok(Self {
            pipelines: NamedCache::new("pipeline"),
            retired: Vec::new(),
            shaders: NamedCache::new("shader"),
            pipeline_cache,
            device,
        })
    }

    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    pub fn register_shader(&mut self, name: &str, shader: Shader) -> &Shader {
        if self.shaders.insert(name, shader).is_some() {
            log::debug!("Replaced shader '{name}'");
        }
        // Just inserted
        &self.shaders.entries[name]
    }

    pub fn get_shader(&self, name: &str) -> Result<&Shader> {
        self.shaders.get(name)
    }

    pub fn create_pipeline(
        &mut self,
        name: &str,
        shader_names: &[&str],
        builder: &GraphicsPipelineBuilder,
        layout: Arc<PipelineLayout>,
    ) -> Result<&PipelineStateObject> {
        let shaders = shader_names
            .iter()
            .map(|shader| self.shaders.get(shader))
            .collect::<Result<Vec<_>>>()?;
        let pipeline = builder.build(&self.device, self.pipeline_cache, &shaders, layout.handle)?;

        Ok(self.store(name, vk::PipelineBindPoint::GRAPHICS, pipeline, layout))
    }

    pub fn create_compute_pipeline(
        &mut self,
        name: &str,
        shader_name: &str,
        layout: Arc<PipelineLayout>,
    ) -> Result<&PipelineStateObject> {
        let shader = self.shaders.get(shader_name)?;
        let pipeline = build_compute_pipeline(&self.device, self.pipeline_cache, shader, layout.handle)?;

        Ok(self.store(name, vk::PipelineBindPoint::COMPUTE, pipeline, layout))
    }

    /// Take ownership of a pipeline built elsewhere, e.g. a ray tracing pipeline
    pub fn register_pipeline(
        &mut self,
        name: &str,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
        layout: Arc<PipelineLayout>,
    ) -> &PipelineStateObject {
        self.store(name, bind_point, pipeline, layout)
    }

    pub fn get_pipeline(&self, name: &str) -> Result<&PipelineStateObject> {
        self.pipelines.get(name)
    }

    pub fn pipeline_names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.names()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Destroy replaced pipelines; only call once no frame in flight can reference them
    pub fn destroy_retired(&mut self) {
        self.retired.clear();
    }

    fn store(
        &mut self,
        name: &str,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
        layout: Arc<PipelineLayout>,
    ) -> &PipelineStateObject {
        let pso = PipelineStateObject {
            bind_point,
            pipeline,
            layout,
            device: self.device.clone(),
        };
        if let Some(previous) = self.pipelines.insert(name, pso) {
            log::info!("Replaced pipeline '{name}'");
            self.retired.push(previous);
        }
        &self.pipelines.entries[name]
    }
}

impl Drop for ShaderDatabase {
    fn drop(&mut self) {
        self.retired.clear();
        self.pipelines.entries.clear();
        unsafe {
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_inserted_entry() {
        let mut cache = NamedCache::new("pipeline");
        assert!(cache.insert("p", 42).is_none());
        assert_eq!(*cache.get("p").unwrap(), 42);
        assert!(std::ptr::eq(cache.get("p").unwrap(), cache.get("p").unwrap()));
    }

    #[test]
    fn missing_name_is_not_found() {
        let cache: NamedCache<u32> = NamedCache::new("pipeline");
        let err = cache.get("missing").unwrap_err();
        assert_eq!(err.class(), crate::renderer::error::ErrorClass::NotFound);
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn insert_replaces_and_returns_previous() {
        let mut cache = NamedCache::new("shader");
        cache.insert("s", 1);
        assert_eq!(cache.insert("s", 2), Some(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(*cache.get("s").unwrap(), 2);

        assert_eq!(cache.remove("s").unwrap(), 2);
        assert!(cache.is_empty());
        assert!(cache.remove("s").is_err());
    }

    #[test]
    fn names_are_sorted() {
        let mut cache = NamedCache::new("pipeline");
        cache.insert("lighting", ());
        cache.insert("gbuffer", ());
        assert_eq!(cache.names().collect::<Vec<_>>(), vec!["gbuffer", "lighting"]);
    }
}
