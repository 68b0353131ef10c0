use ash::khr::acceleration_structure;
use ash::vk;
use gpu_allocator::MemoryLocation;
use crate::renderer::core::context::RenderContext;
use crate::renderer::error::{HriError, Result};
use crate::renderer::resources::buffer::{align_up, BufferCreateInfo, BufferResource};

/// Device entry point that reports build sizes for a geometry description
pub trait BuildSizeQuery {
    fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static>;
}

impl BuildSizeQuery for acceleration_structure::Device {
    fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                build_info,
                max_primitive_counts,
                &mut size_info,
            );
        }
        size_info
    }
}

/// Triangle mesh already resident in device-addressable buffers
#[derive(Debug, Clone, Copy)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_format: vk::Format,
    pub vertex_count: u32,
    /// `None` for non-indexed meshes
    pub index_address: Option<vk::DeviceAddress>,
    pub index_type: vk::IndexType,
    pub index_count: u32,
}

impl TriangleGeometry {
    pub fn primitive_count(&self) -> u32 {
        match self.index_address {
            Some(_) => self.index_count / 3,
            None => self.vertex_count / 3,
        }
    }
}

/// Geometry and ranges of one acceleration structure
#[derive(Clone)]
pub struct ASInput {
    pub build_flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometry: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    pub build_ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
}

impl ASInput {
    pub fn triangles(
        mesh: &TriangleGeometry,
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
        geometry_flags: vk::GeometryFlagsKHR,
    ) -> Self {
        let (index_type, index_data) = match mesh.index_address {
            Some(address) => (mesh.index_type, address),
            None => (vk::IndexType::NONE_KHR, 0),
        };
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(mesh.vertex_format)
            .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: mesh.vertex_address })
            .vertex_stride(mesh.vertex_stride)
            .max_vertex(mesh.vertex_count.saturating_sub(1))
            .index_type(index_type)
            .index_data(vk::DeviceOrHostAddressConstKHR { device_address: index_data });
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(geometry_flags);
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: mesh.primitive_count(),
            ..Default::default()
        };

        Self {
            build_flags,
            geometry: vec![geometry],
            build_ranges: vec![range],
        }
    }

    /// Instance records (`vk::AccelerationStructureInstanceKHR`) at `instance_address`
    pub fn instances(
        instance_address: vk::DeviceAddress,
        instance_count: u32,
        array_of_pointers: bool,
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
        geometry_flags: vk::GeometryFlagsKHR,
    ) -> Self {
        let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(array_of_pointers)
            .data(vk::DeviceOrHostAddressConstKHR { device_address: instance_address });
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
            .flags(geometry_flags);
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: instance_count,
            ..Default::default()
        };

        Self {
            build_flags,
            geometry: vec![geometry],
            build_ranges: vec![range],
        }
    }

    pub fn primitive_counts(&self) -> Vec<u32> {
        self.build_ranges.iter().map(|r| r.primitive_count).collect()
    }
}

/// Everything needed to record one build, borrowing the input's geometry
pub struct ASBuildInfo<'a> {
    pub geometry_info: vk::AccelerationStructureBuildGeometryInfoKHR<'a>,
    pub build_ranges: &'a [vk::AccelerationStructureBuildRangeInfoKHR],
    pub build_sizes: vk::AccelerationStructureBuildSizesInfoKHR<'static>,
}

impl ASBuildInfo<'_> {
    pub fn is_update(&self) -> bool {
        self.geometry_info.mode == vk::BuildAccelerationStructureModeKHR::UPDATE
    }

    /// Scratch bytes this build consumes
    pub fn scratch_size(&self) -> vk::DeviceSize {
        if self.is_update() {
            self.build_sizes.update_scratch_size
        } else {
            self.build_sizes.build_scratch_size
        }
    }
}

/// Aggregate sizes over a set of builds.
///
/// Structure sizes add up; scratch sizes are the largest single requirement since sequential
/// builds may reuse one scratch buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ASSizeInfo {
    pub acceleration_structure_size: vk::DeviceSize,
    pub update_scratch_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
}

impl ASSizeInfo {
    fn accumulate(&mut self, sizes: &vk::AccelerationStructureBuildSizesInfoKHR) {
        self.acceleration_structure_size += sizes.acceleration_structure_size;
        self.update_scratch_size = self.update_scratch_size.max(sizes.update_scratch_size);
        self.build_scratch_size = self.build_scratch_size.max(sizes.build_scratch_size);
    }
}

/// Computes build descriptions and sizes; every call starts from a fresh aggregate
pub struct ASBuilder<'q, Q: BuildSizeQuery> {
    query: &'q Q,
}

impl<'q, Q: BuildSizeQuery> ASBuilder<'q, Q> {
    pub fn new(query: &'q Q) -> Self {
        Self { query }
    }

    pub fn generate_as_build_info<'a>(
        &self,
        input: &'a ASInput,
        as_type: vk::AccelerationStructureTypeKHR,
        build_mode: vk::BuildAccelerationStructureModeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<(ASBuildInfo<'a>, ASSizeInfo)> {
        let (infos, sizes) = self.generate_as_build_infos(
            std::slice::from_ref(input),
            as_type,
            build_mode,
            flags,
        )?;
        let info = infos
            .into_iter()
            .next()
            .ok_or_else(|| HriError::precondition("No build info generated"))?;
        Ok((info, sizes))
    }

    pub fn generate_as_build_infos<'a>(
        &self,
        inputs: &'a [ASInput],
        as_type: vk::AccelerationStructureTypeKHR,
        build_mode: vk::BuildAccelerationStructureModeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<(Vec<ASBuildInfo<'a>>, ASSizeInfo)> {
        let mut size_info = ASSizeInfo::default();
        let mut build_infos = Vec::with_capacity(inputs.len());

        for (index, input) in inputs.iter().enumerate() {
            validate_input(index, input, as_type)?;

            let build_flags = flags | input.build_flags;
            if build_mode == vk::BuildAccelerationStructureModeKHR::UPDATE
                && !build_flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
            {
                return Err(HriError::precondition(format!(
                    "Acceleration structure input {index} is updated without ALLOW_UPDATE",
                )));
            }

            let geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(as_type)
                .flags(build_flags)
                .mode(build_mode)
                .geometries(&input.geometry);
            let build_sizes = self.query.build_sizes(&geometry_info, &input.primitive_counts());
            size_info.accumulate(&build_sizes);

            build_infos.push(ASBuildInfo {
                geometry_info,
                build_ranges: &input.build_ranges,
                build_sizes,
            });
        }

        Ok((build_infos, size_info))
    }
}

fn validate_input(index: usize, input: &ASInput, as_type: vk::AccelerationStructureTypeKHR) -> Result<()> {
    if input.geometry.is_empty() {
        return Err(HriError::precondition(format!(
            "Acceleration structure input {index} has no geometry",
        )));
    }
    if input.geometry.len() != input.build_ranges.len() {
        return Err(HriError::precondition(format!(
            "Acceleration structure input {index} has {} geometries but {} build ranges",
            input.geometry.len(),
            input.build_ranges.len(),
        )));
    }

    let expects_instances = as_type == vk::AccelerationStructureTypeKHR::TOP_LEVEL;
    for geometry in &input.geometry {
        let is_instances = geometry.geometry_type == vk::GeometryTypeKHR::INSTANCES;
        if is_instances != expects_instances {
            return Err(HriError::precondition(format!(
                "Acceleration structure input {index} has {:?} geometry for a {:?} structure",
                geometry.geometry_type,
                as_type,
            )));
        }
    }
    if expects_instances && input.geometry.len() != 1 {
        return Err(HriError::precondition("Top level structures take exactly one instance geometry"));
    }

    Ok(())
}

/// Non-overlapping scratch regions for builds recorded in one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchLayout {
    pub offsets: Vec<vk::DeviceSize>,
    pub total_size: vk::DeviceSize,
}

/// Builds in one batch may run concurrently, so each gets its own aligned scratch region
pub fn scratch_layout(build_infos: &[ASBuildInfo], alignment: u32) -> ScratchLayout {
    let alignment = u64::from(alignment.max(1));
    let mut offsets = Vec::with_capacity(build_infos.len());
    let mut cursor = 0;
    for info in build_infos {
        cursor = align_up(cursor, alignment);
        offsets.push(cursor);
        cursor += info.scratch_size();
    }

    ScratchLayout {
        offsets,
        total_size: cursor,
    }
}

/// Device-local scratch memory with a base address honoring the device's scratch alignment
pub struct ScratchBuffer {
    pub buffer: BufferResource,
    pub address: vk::DeviceAddress,
}

impl ScratchBuffer {
    pub fn new(ctx: &RenderContext, size: vk::DeviceSize) -> Result<Self> {
        let alignment = u64::from(ctx.ray_tracing()?.properties.min_scratch_offset_alignment.max(1));
        let buffer = ctx.create_buffer(&BufferCreateInfo {
            size: size + alignment,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
            name: "Acceleration structure scratch",
        })?;
        let address = align_up(buffer.device_address(), alignment);

        Ok(Self { buffer, address })
    }
}

/// Acceleration structure and the buffer backing it
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub as_type: vk::AccelerationStructureTypeKHR,
    pub device_address: vk::DeviceAddress,
    // Destroyed before the buffer it lives in
    loader: acceleration_structure::Device,
    pub buffer: BufferResource,
}

impl AccelerationStructure {
    pub fn new(
        ctx: &RenderContext,
        as_type: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let loader = ctx.ray_tracing()?.acceleration_structure.clone();
        let buffer = ctx.create_buffer(&BufferCreateInfo {
            size,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::GpuOnly,
            name: "Acceleration structure",
        })?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(size)
            .ty(as_type);
        let handle = unsafe {
            loader.create_acceleration_structure(&create_info, None)?
        };
        let device_address = unsafe {
            loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(handle),
            )
        };

        log::trace!("Created {:?} acceleration structure ({} bytes)", as_type, size);

        Ok(Self {
            handle,
            as_type,
            device_address,
            loader,
            buffer,
        })
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_acceleration_structure(self.handle, None);
        }
    }
}

/// Record a single build into `dst`; updates refit `dst` in place
pub fn cmd_build_acceleration_structure(
    loader: &acceleration_structure::Device,
    command_buffer: vk::CommandBuffer,
    build_info: &ASBuildInfo,
    dst: vk::AccelerationStructureKHR,
    scratch_address: vk::DeviceAddress,
) {
    let mut geometry_info = build_info
        .geometry_info
        .dst_acceleration_structure(dst)
        .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch_address });
    if build_info.is_update() {
        geometry_info = geometry_info.src_acceleration_structure(dst);
    }

    unsafe {
        loader.cmd_build_acceleration_structures(
            command_buffer,
            &[geometry_info],
            &[build_info.build_ranges],
        );
    }
}

/// Record a batch of builds in one call, each using its own region of the scratch buffer
pub fn cmd_build_acceleration_structures(
    loader: &acceleration_structure::Device,
    command_buffer: vk::CommandBuffer,
    build_infos: &[ASBuildInfo],
    dst: &[vk::AccelerationStructureKHR],
    scratch_address: vk::DeviceAddress,
    scratch: &ScratchLayout,
) -> Result<()> {
    if build_infos.len() != dst.len() || build_infos.len() != scratch.offsets.len() {
        return Err(HriError::precondition(format!(
            "Batched build has {} infos, {} structures and {} scratch regions",
            build_infos.len(),
            dst.len(),
            scratch.offsets.len(),
        )));
    }
    if build_infos.is_empty() {
        return Ok(());
    }

    let geometry_infos: Vec<_> = build_infos
        .iter()
        .zip(dst)
        .zip(&scratch.offsets)
        .map(|((info, dst), offset)| {
            let geometry_info = info
                .geometry_info
                .dst_acceleration_structure(*dst)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: scratch_address + offset,
                });
            if info.is_update() {
                geometry_info.src_acceleration_structure(*dst)
            } else {
                geometry_info
            }
        })
        .collect();
    let ranges: Vec<_> = build_infos.iter().map(|info| info.build_ranges).collect();

    unsafe {
        loader.cmd_build_acceleration_structures(command_buffer, &geometry_infos, &ranges);
    }
    Ok(())
}

/// Row-major 3x4 affine part of `matrix`
pub fn to_transform_matrix(matrix: glam::Mat4) -> vk::TransformMatrixKHR {
    let mut values = [0.0; 12];
    for row in 0..3 {
        values[row * 4..row * 4 + 4].copy_from_slice(&matrix.row(row).to_array());
    }
    vk::TransformMatrixKHR { matrix: values }
}

/// Instance record referencing a bottom level structure by device address
pub fn instance_record(
    transform: glam::Mat4,
    custom_index: u32,
    mask: u8,
    sbt_record_offset: u32,
    flags: vk::GeometryInstanceFlagsKHR,
    blas_address: vk::DeviceAddress,
) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: to_transform_matrix(transform),
        instance_custom_index_and_mask: vk::Packed24_8::new(custom_index, mask),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            sbt_record_offset,
            flags.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use super::*;

    /// Sizes proportional to the primitive count, counting how often it was asked
    struct LinearSizes {
        calls: Cell<usize>,
    }

    impl LinearSizes {
        fn new() -> Self {
            Self { calls: Cell::new(0) }
        }
    }

    impl BuildSizeQuery for LinearSizes {
        fn build_sizes(
            &self,
            _build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
            max_primitive_counts: &[u32],
        ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
            self.calls.set(self.calls.get() + 1);
            let primitives: u64 = max_primitive_counts.iter().map(|c| u64::from(*c)).sum();
            vk::AccelerationStructureBuildSizesInfoKHR::default()
                .acceleration_structure_size(256 * primitives)
                .build_scratch_size(128 * primitives)
                .update_scratch_size(16 * primitives)
        }
    }

    fn mesh(triangles: u32) -> ASInput {
        ASInput::triangles(
            &TriangleGeometry {
                vertex_address: 0x1000,
                vertex_stride: 12,
                vertex_format: vk::Format::R32G32B32_SFLOAT,
                vertex_count: triangles * 3,
                index_address: Some(0x8000),
                index_type: vk::IndexType::UINT32,
                index_count: triangles * 3,
            },
            vk::BuildAccelerationStructureFlagsKHR::empty(),
            vk::GeometryFlagsKHR::OPAQUE,
        )
    }

    const BLAS: vk::AccelerationStructureTypeKHR = vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL;
    const BUILD: vk::BuildAccelerationStructureModeKHR = vk::BuildAccelerationStructureModeKHR::BUILD;

    #[test]
    fn aggregate_sums_structures_and_maxes_scratch() {
        let query = LinearSizes::new();
        let builder = ASBuilder::new(&query);
        let inputs = vec![mesh(10), mesh(4)];

        let (infos, sizes) = builder
            .generate_as_build_infos(&inputs, BLAS, BUILD, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .unwrap();

        assert_eq!(infos.len(), 2);
        assert_eq!(query.calls.get(), 2);
        assert_eq!(sizes.acceleration_structure_size, 256 * 14);
        assert_eq!(sizes.build_scratch_size, 128 * 10);
        assert_eq!(sizes.update_scratch_size, 16 * 10);
        assert_eq!(infos[1].build_ranges[0].primitive_count, 4);
    }

    #[test]
    fn repeated_queries_are_identical() {
        let query = LinearSizes::new();
        let builder = ASBuilder::new(&query);
        let input = mesh(7);
        let flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;

        let (_, first) = builder.generate_as_build_info(&input, BLAS, BUILD, flags).unwrap();
        let (_, second) = builder.generate_as_build_info(&input, BLAS, BUILD, flags).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.acceleration_structure_size, 256 * 7);
    }

    #[test]
    fn update_requires_allow_update() {
        let query = LinearSizes::new();
        let builder = ASBuilder::new(&query);
        let input = mesh(3);
        let update = vk::BuildAccelerationStructureModeKHR::UPDATE;

        assert!(builder
            .generate_as_build_info(&input, BLAS, update, vk::BuildAccelerationStructureFlagsKHR::empty())
            .is_err());

        let (info, _) = builder
            .generate_as_build_info(&input, BLAS, update, vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
            .unwrap();
        assert!(info.is_update());
        assert_eq!(info.scratch_size(), 16 * 3);
    }

    #[test]
    fn geometry_kind_must_match_level() {
        let query = LinearSizes::new();
        let builder = ASBuilder::new(&query);
        let flags = vk::BuildAccelerationStructureFlagsKHR::empty();

        let triangles = mesh(2);
        assert!(builder
            .generate_as_build_info(&triangles, vk::AccelerationStructureTypeKHR::TOP_LEVEL, BUILD, flags)
            .is_err());

        let instances = ASInput::instances(0x4000, 8, false, flags, vk::GeometryFlagsKHR::OPAQUE);
        assert!(builder.generate_as_build_info(&instances, BLAS, BUILD, flags).is_err());
        let (info, sizes) = builder
            .generate_as_build_info(&instances, vk::AccelerationStructureTypeKHR::TOP_LEVEL, BUILD, flags)
            .unwrap();
        assert_eq!(info.build_ranges[0].primitive_count, 8);
        assert_eq!(sizes.acceleration_structure_size, 256 * 8);
    }

    #[test]
    fn empty_input_is_rejected() {
        let query = LinearSizes::new();
        let builder = ASBuilder::new(&query);
        let mut input = mesh(1);
        input.geometry.clear();
        input.build_ranges.clear();
        assert!(builder
            .generate_as_build_info(&input, BLAS, BUILD, vk::BuildAccelerationStructureFlagsKHR::empty())
            .is_err());
    }

    #[test]
    fn batched_scratch_regions_do_not_overlap() {
        let query = LinearSizes::new();
        let builder = ASBuilder::new(&query);
        let inputs = vec![mesh(1), mesh(3), mesh(2)];
        let (infos, _) = builder
            .generate_as_build_infos(&inputs, BLAS, BUILD, vk::BuildAccelerationStructureFlagsKHR::empty())
            .unwrap();

        let layout = scratch_layout(&infos, 256);
        assert_eq!(layout.offsets, vec![0, 256, 768]);
        assert_eq!(layout.total_size, 768 + 256);
        for (offset, info) in layout.offsets.iter().zip(&infos).take(2) {
            assert!(offset + info.scratch_size() <= layout.total_size);
        }
    }

    #[test]
    fn non_indexed_mesh_counts_vertices() {
        let geometry = TriangleGeometry {
            vertex_address: 0,
            vertex_stride: 12,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_count: 9,
            index_address: None,
            index_type: vk::IndexType::UINT32,
            index_count: 0,
        };
        assert_eq!(geometry.primitive_count(), 3);
    }

    #[test]
    fn transform_is_row_major() {
        let matrix = glam::Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        let transform = to_transform_matrix(matrix);
        assert_eq!(
            transform.matrix,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0],
        );
    }

    #[test]
    fn instance_record_packs_fields() {
        let record = instance_record(
            glam::Mat4::IDENTITY,
            42,
            0xff,
            1,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            0xdead_0000,
        );
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 42);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xff);
        assert_eq!(record.instance_shader_binding_table_record_offset_and_flags.low_24(), 1);
        assert_eq!(unsafe { record.acceleration_structure_reference.device_handle }, 0xdead_0000);
    }
}
