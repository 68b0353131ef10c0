use ash::khr::ray_tracing_pipeline;
use ash::vk;
use gpu_allocator::MemoryLocation;
use crate::renderer::core::context::RenderContext;
use crate::renderer::error::{HriError, Result};
use crate::renderer::raytracing::RayTracingProperties;
use crate::renderer::raytracing::pipeline::{ShaderGroupKind, ShaderGroupLayout};
use crate::renderer::resources::buffer::{align_up, BufferCreateInfo, BufferResource};

const REGION_ORDER: [ShaderGroupKind; 4] = [
    ShaderGroupKind::Raygen,
    ShaderGroupKind::Miss,
    ShaderGroupKind::Hit,
    ShaderGroupKind::Callable,
];

/// Byte range of one region within the table buffer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SbtRegion {
    pub offset: vk::DeviceSize,
    pub stride: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub count: u32,
}

/// Placement of every group handle in the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub handle_stride: vk::DeviceSize,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub callable: SbtRegion,
    pub total_size: vk::DeviceSize,
}

impl SbtLayout {
    pub fn new(properties: &RayTracingProperties, groups: &ShaderGroupLayout) -> Result<Self> {
        let handle_size = properties.shader_group_handle_size;
        let handle_alignment = u64::from(properties.shader_group_handle_alignment);
        let base_alignment = u64::from(properties.shader_group_base_alignment);
        if handle_size == 0 || handle_alignment == 0 || base_alignment == 0 {
            return Err(HriError::DeviceLimit(format!(
                "Invalid shader group properties: {properties:?}",
            )));
        }
        if groups.raygen.len() != 1 {
            return Err(HriError::precondition(format!(
                "Shader binding table needs exactly one raygen group, got {}",
                groups.raygen.len(),
            )));
        }

        let handle_stride = align_up(u64::from(handle_size), handle_alignment);
        if handle_stride > u64::from(properties.max_shader_group_stride) {
            return Err(HriError::DeviceLimit(format!(
                "Shader group stride {handle_stride} exceeds the device maximum of {}",
                properties.max_shader_group_stride,
            )));
        }

        let mut cursor = 0;
        let mut regions = [SbtRegion::default(); 4];
        for (region, kind) in regions.iter_mut().zip(REGION_ORDER) {
            let count = groups.groups(kind).len() as u32;
            if count == 0 {
                continue;
            }
            // Raygen stride has to equal its size
            let (stride, size) = match kind {
                ShaderGroupKind::Raygen => {
                    let size = align_up(handle_stride, base_alignment);
                    (size, size)
                }
                _ => (handle_stride, align_up(u64::from(count) * handle_stride, base_alignment)),
            };
            *region = SbtRegion {
                offset: cursor,
                stride,
                size,
                count,
            };
            cursor = align_up(cursor + size, base_alignment);
        }

        let [raygen, miss, hit, callable] = regions;
        Ok(Self {
            handle_size,
            handle_stride,
            raygen,
            miss,
            hit,
            callable,
            total_size: cursor,
        })
    }

    pub fn region(&self, kind: ShaderGroupKind) -> &SbtRegion {
        match kind {
            ShaderGroupKind::Raygen => &self.raygen,
            ShaderGroupKind::Miss => &self.miss,
            ShaderGroupKind::Hit => &self.hit,
            ShaderGroupKind::Callable => &self.callable,
        }
    }

    /// Scatter tightly packed handles (as returned by the driver) into table order
    pub fn write_handles(&self, groups: &ShaderGroupLayout, handles: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let mut table = vec![0u8; self.total_size as usize];

        for kind in REGION_ORDER {
            let region = self.region(kind);
            for (slot, group) in groups.groups(kind).iter().enumerate() {
                let src = *group as usize * handle_size;
                let handle = handles.get(src..src + handle_size).ok_or_else(|| {
                    HriError::precondition(format!(
                        "Group {group} is outside the {} bytes of shader group handles",
                        handles.len(),
                    ))
                })?;
                let dst = (region.offset + slot as u64 * region.stride) as usize;
                table[dst..dst + handle_size].copy_from_slice(handle);
            }
        }

        Ok(table)
    }
}

/// Handle table in device memory with the regions a trace-rays call consumes
pub struct ShaderBindingTable {
    layout: SbtLayout,
    base_address: vk::DeviceAddress,
    buffer: BufferResource,
}

impl ShaderBindingTable {
    pub fn new(
        ctx: &RenderContext,
        pipeline: vk::Pipeline,
        groups: &ShaderGroupLayout,
    ) -> Result<Self> {
        let ray_tracing = ctx.ray_tracing()?;
        let properties = &ray_tracing.properties;
        let layout = SbtLayout::new(properties, groups)?;

        let handles = group_handles(
            &ray_tracing.pipeline,
            pipeline,
            groups.group_count() as u32,
            properties.shader_group_handle_size,
        )?;
        let table = layout.write_handles(groups, &handles)?;

        // Over-allocate so the base address can be moved up to the base alignment
        let base_alignment = u64::from(properties.shader_group_base_alignment);
        let mut buffer = ctx.create_buffer(&BufferCreateInfo {
            size: layout.total_size + base_alignment,
            usage: vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::CpuToGpu,
            name: "Shader binding table",
        })?;
        let buffer_address = buffer.device_address();
        let base_address = align_up(buffer_address, base_alignment);
        buffer.write(&table, (base_address - buffer_address) as usize)?;

        log::debug!(
            "Shader binding table: {} bytes, stride {}",
            layout.total_size,
            layout.handle_stride,
        );

        Ok(Self {
            layout,
            base_address,
            buffer,
        })
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    /// Address, stride and size of a region; empty regions are all zero
    pub fn region(&self, kind: ShaderGroupKind) -> vk::StridedDeviceAddressRegionKHR {
        strided_region(self.base_address, self.layout.region(kind))
    }
}

fn strided_region(base_address: vk::DeviceAddress, region: &SbtRegion) -> vk::StridedDeviceAddressRegionKHR {
    if region.count == 0 {
        return vk::StridedDeviceAddressRegionKHR::default();
    }
    vk::StridedDeviceAddressRegionKHR {
        device_address: base_address + region.offset,
        stride: region.stride,
        size: region.size,
    }
}

fn group_handles(
    loader: &ray_tracing_pipeline::Device,
    pipeline: vk::Pipeline,
    group_count: u32,
    handle_size: u32,
) -> Result<Vec<u8>> {
    let data_size = group_count as usize * handle_size as usize;
    let handles = unsafe {
        loader.get_ray_tracing_shader_group_handles(pipeline, 0, group_count, data_size)?
    };
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base_alignment,
            max_shader_group_stride: 4096,
            max_ray_recursion_depth: 1,
            min_scratch_offset_alignment: 128,
        }
    }

    fn groups() -> ShaderGroupLayout {
        ShaderGroupLayout {
            raygen: vec![0],
            miss: vec![1, 2],
            hit: vec![3, 4, 5],
            callable: vec![],
        }
    }

    #[test]
    fn regions_are_base_aligned() {
        let layout = SbtLayout::new(&properties(32, 32, 64), &groups()).unwrap();

        assert_eq!(layout.handle_stride, 32);
        assert_eq!(layout.raygen, SbtRegion { offset: 0, stride: 64, size: 64, count: 1 });
        assert_eq!(layout.miss, SbtRegion { offset: 64, stride: 32, size: 64, count: 2 });
        assert_eq!(layout.hit, SbtRegion { offset: 128, stride: 32, size: 128, count: 3 });
        assert_eq!(layout.callable, SbtRegion::default());
        assert_eq!(layout.total_size, 256);

        for kind in REGION_ORDER {
            assert_eq!(layout.region(kind).offset % 64, 0);
        }
    }

    #[test]
    fn stride_rounds_handle_size_up() {
        let layout = SbtLayout::new(&properties(24, 16, 32), &groups()).unwrap();
        assert_eq!(layout.handle_stride, 32);
        assert_eq!(layout.hit.size, 96);
    }

    #[test]
    fn oversized_stride_is_a_device_limit_error() {
        let mut props = properties(32, 32, 64);
        props.max_shader_group_stride = 16;
        assert!(matches!(
            SbtLayout::new(&props, &groups()),
            Err(HriError::DeviceLimit(_)),
        ));
    }

    #[test]
    fn zero_alignment_is_rejected() {
        assert!(SbtLayout::new(&properties(32, 0, 64), &groups()).is_err());
    }

    #[test]
    fn exactly_one_raygen_group() {
        let mut groups = groups();
        groups.raygen.push(6);
        assert!(SbtLayout::new(&properties(32, 32, 64), &groups).is_err());
    }

    #[test]
    fn handles_land_in_their_slots() {
        let groups = groups();
        let layout = SbtLayout::new(&properties(4, 4, 16), &groups).unwrap();
        let handles: Vec<u8> = (0..6u8).flat_map(|g| [g; 4]).collect();

        let table = layout.write_handles(&groups, &handles).unwrap();

        assert_eq!(table.len() as u64, layout.total_size);
        assert_eq!(&table[0..4], &[0; 4]);
        let miss = layout.miss.offset as usize;
        assert_eq!(&table[miss..miss + 4], &[1; 4]);
        assert_eq!(&table[miss + 4..miss + 8], &[2; 4]);
        let hit = layout.hit.offset as usize;
        assert_eq!(&table[hit + 8..hit + 12], &[5; 4]);
    }

    #[test]
    fn missing_handles_are_an_error() {
        let groups = groups();
        let layout = SbtLayout::new(&properties(4, 4, 16), &groups).unwrap();
        assert!(layout.write_handles(&groups, &[0; 8]).is_err());
    }

    #[test]
    fn empty_region_has_no_address() {
        let layout = SbtLayout::new(&properties(32, 32, 64), &groups()).unwrap();
        let callable = strided_region(0x10000, &layout.callable);
        assert_eq!(callable.device_address, 0);
        assert_eq!(callable.size, 0);
        let hit = strided_region(0x10000, &layout.hit);
        assert_eq!(hit.device_address, 0x10000 + 128);
        assert_eq!(hit.stride, 32);
    }
}
