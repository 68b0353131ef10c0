use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;
use ash::vk;
use crate::renderer::error::{HriError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;
const ENTRY_POINT: &CStr = c"main";

/// Shader module for a single stage, entry point `main`
pub struct Shader {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    device: Arc<ash::Device>,
}

impl Shader {
    pub fn from_spirv(
        device: Arc<ash::Device>,
        code: &[u8],
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let words = spirv_words(code)?;

        let shader_module_info = vk::ShaderModuleCreateInfo::default()
            .code(&words);
        let module = unsafe {
            device.create_shader_module(&shader_module_info, None)?
        };

        Ok(Self { stage, module, device })
    }

    /// Load precompiled SPIR-V from disk
    pub fn load_file(
        device: Arc<ash::Device>,
        path: impl AsRef<Path>,
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let path = path.as_ref();
        let code = std::fs::read(path)?;
        log::debug!("Loaded shader {} ({} bytes)", path.display(), code.len());
        Self::from_spirv(device, &code, stage)
    }

    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage)
            .module(self.module)
            .name(ENTRY_POINT)
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// SPIR-V words of `code`, checking size and magic number
pub fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    if code.is_empty() || code.len() % 4 != 0 {
        return Err(HriError::precondition(format!(
            "SPIR-V code size {} is not a non-zero multiple of 4",
            code.len(),
        )));
    }

    let words = match bytemuck::try_cast_slice::<u8, u32>(code) {
        Ok(words) => words.to_vec(),
        // Unaligned input, copy word by word
        Err(_) => code
            .chunks_exact(4)
            .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    };

    if words[0] != SPIRV_MAGIC {
        return Err(HriError::precondition(format!(
            "Invalid SPIR-V magic number {:#010x}",
            words[0],
        )));
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        bytemuck::cast_slice(words).to_vec()
    }

    #[test]
    fn accepts_spirv_header() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0600, 0, 8, 0]);
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[3], 8);
    }

    #[test]
    fn accepts_unaligned_input() {
        let mut bytes = vec![0u8];
        bytes.extend(module_bytes(&[SPIRV_MAGIC, 7]));
        let words = spirv_words(&bytes[1..]).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 7]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&[1, 2, 3]).is_err());
        assert!(spirv_words(&module_bytes(&[0xdead_beef, 0])).is_err());
    }
}
