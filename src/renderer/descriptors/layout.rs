use std::collections::BTreeMap;
use std::sync::Arc;
use ash::vk;
use crate::renderer::error::{HriError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stages: vk::ShaderStageFlags,
    pub flags: vk::DescriptorBindingFlags,
}

impl DescriptorBinding {
    fn as_vk(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.descriptor_type)
            .descriptor_count(self.descriptor_count)
            .stage_flags(self.stages)
    }
}

/// Accumulates bindings for a descriptor set layout; can be built any number of times
#[derive(Debug, Default, Clone)]
pub struct DescriptorSetLayoutBuilder {
    bindings: BTreeMap<u32, DescriptorBinding>,
    flags: vk::DescriptorSetLayoutCreateFlags,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a binding, replacing any binding previously declared for the same slot
    pub fn add_binding(
        &mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        stages: vk::ShaderStageFlags,
    ) -> &mut Self {
        let previous = self.bindings.insert(binding, DescriptorBinding {
            binding,
            descriptor_type,
            descriptor_count,
            stages,
            flags: vk::DescriptorBindingFlags::empty(),
        });
        if previous.is_some() {
            log::debug!("Replacing descriptor binding {binding}");
        }
        self
    }

    pub fn set_binding_flags(
        &mut self,
        binding: u32,
        flags: vk::DescriptorBindingFlags,
    ) -> Result<&mut Self> {
        let entry = self
            .bindings
            .get_mut(&binding)
            .ok_or_else(|| HriError::precondition(format!(
                "Cannot set flags on undeclared descriptor binding {binding}",
            )))?;
        entry.flags = flags;
        Ok(self)
    }

    /// Flags accumulate across calls
    pub fn set_descriptor_set_flags(&mut self, flags: vk::DescriptorSetLayoutCreateFlags) -> &mut Self {
        self.flags |= flags;
        self
    }

    pub fn bindings(&self) -> impl Iterator<Item = &DescriptorBinding> {
        self.bindings.values()
    }

    pub fn flags(&self) -> vk::DescriptorSetLayoutCreateFlags {
        self.flags
    }

    pub fn validate(&self) -> Result<()> {
        if self.bindings.is_empty() {
            return Err(HriError::precondition("Descriptor set layout has no bindings"));
        }

        for binding in self.bindings.values() {
            if binding.descriptor_count == 0 {
                return Err(HriError::precondition(format!(
                    "Descriptor binding {} has a descriptor count of zero",
                    binding.binding,
                )));
            }
        }

        let highest = self.bindings.keys().next_back().copied();
        let variable = self
            .bindings
            .values()
            .find(|b| b.flags.contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT));
        if let Some(variable) = variable {
            if Some(variable.binding) != highest {
                return Err(HriError::precondition(format!(
                    "Variable-count descriptor binding {} must be the highest binding",
                    variable.binding,
                )));
            }
        }

        let update_after_bind = self
            .bindings
            .values()
            .any(|b| b.flags.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND));
        if update_after_bind
            && !self.flags.contains(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
        {
            return Err(HriError::precondition(
                "Update-after-bind bindings require an UPDATE_AFTER_BIND_POOL layout",
            ));
        }

        Ok(())
    }

    pub fn build(&self, device: Arc<ash::Device>) -> Result<DescriptorSetLayout> {
        self.validate()?;

        let bindings: Vec<_> = self.bindings.values().map(DescriptorBinding::as_vk).collect();
        let binding_flags: Vec<_> = self.bindings.values().map(|b| b.flags).collect();

        let mut binding_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(self.flags)
            .bindings(&bindings)
            .push_next(&mut binding_flags_info);
        let handle = unsafe {
            device.create_descriptor_set_layout(&layout_info, None)?
        };

        Ok(DescriptorSetLayout {
            handle,
            bindings: self.bindings.values().copied().collect(),
            device,
        })
    }
}

/// Immutable descriptor set layout together with the bindings it was built from
pub struct DescriptorSetLayout {
    pub handle: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBinding>,
    device: Arc<ash::Device>,
}

impl DescriptorSetLayout {
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.handle, None);
        }
    }
}
