use std::sync::Arc;
use ash::vk;
use gpu_descriptor::{
    CreatePoolError,
    DescriptorDevice,
    DescriptorPoolCreateFlags,
    DescriptorTotalCount,
    DeviceAllocationError,
};
use crate::renderer::config::{RenderConfig, DEFAULT_DESCRIPTORS_PER_TYPE};
use crate::renderer::error::{HriError, Result};

/// `gpu_descriptor` device implementation on top of ash
pub struct DescriptorAshDevice(pub Arc<ash::Device>);

impl From<Arc<ash::Device>> for DescriptorAshDevice {
    fn from(device: Arc<ash::Device>) -> Self {
        Self(device)
    }
}

impl DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>
for DescriptorAshDevice
{
    unsafe fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool, CreatePoolError> {
        let pool_sizes = pool_sizes(descriptor_count);

        let mut ash_flags = vk::DescriptorPoolCreateFlags::empty();
        if flags.contains(DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            ash_flags |= vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        }
        if flags.contains(DescriptorPoolCreateFlags::UPDATE_AFTER_BIND) {
            ash_flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let result = unsafe {
            self.0.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(max_sets)
                    .pool_sizes(&pool_sizes)
                    .flags(ash_flags),
                None,
            )
        };

        match result {
            Ok(pool) => Ok(pool),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(CreatePoolError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTATION) => Err(CreatePoolError::Fragmentation),
            Err(err) => {
                log::error!("Unexpected result creating descriptor pool: {err}");
                Err(CreatePoolError::OutOfHostMemory)
            }
        }
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe {
            self.0.destroy_descriptor_pool(pool, None)
        }
    }

    unsafe fn alloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        layouts: impl ExactSizeIterator<Item = &'a vk::DescriptorSetLayout>,
        sets: &mut impl Extend<vk::DescriptorSet>,
    ) -> Result<(), DeviceAllocationError> {
        let set_layouts: smallvec::SmallVec<[_; 16]> = layouts.copied().collect();

        let result = unsafe {
            self.0.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .set_layouts(&set_layouts)
                    .descriptor_pool(*pool),
            )
        };

        match result {
            Ok(allocated) => {
                sets.extend(allocated);
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(DeviceAllocationError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => Err(DeviceAllocationError::OutOfPoolMemory),
            Err(vk::Result::ERROR_FRAGMENTED_POOL) => Err(DeviceAllocationError::FragmentedPool),
            Err(err) => {
                log::error!("Unexpected result allocating descriptor sets: {err}");
                Err(DeviceAllocationError::OutOfHostMemory)
            }
        }
    }

    unsafe fn dealloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        sets: impl Iterator<Item = vk::DescriptorSet>,
    ) {
        let sets: smallvec::SmallVec<[_; 16]> = sets.collect();
        if let Err(err) = unsafe { self.0.free_descriptor_sets(*pool, &sets) } {
            log::error!("Failed to free {} descriptor sets: {err}", sets.len());
        }
    }
}

fn pool_sizes(count: &DescriptorTotalCount) -> smallvec::SmallVec<[vk::DescriptorPoolSize; 12]> {
    [
        (vk::DescriptorType::SAMPLER, count.sampler),
        (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, count.combined_image_sampler),
        (vk::DescriptorType::SAMPLED_IMAGE, count.sampled_image),
        (vk::DescriptorType::STORAGE_IMAGE, count.storage_image),
        (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, count.uniform_texel_buffer),
        (vk::DescriptorType::STORAGE_TEXEL_BUFFER, count.storage_texel_buffer),
        (vk::DescriptorType::UNIFORM_BUFFER, count.uniform_buffer),
        (vk::DescriptorType::STORAGE_BUFFER, count.storage_buffer),
        (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, count.uniform_buffer_dynamic),
        (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, count.storage_buffer_dynamic),
        (vk::DescriptorType::INPUT_ATTACHMENT, count.input_attachment),
        (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, count.acceleration_structure),
    ]
        .into_iter()
        .filter(|(_, descriptor_count)| *descriptor_count != 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
        .collect()
}

/// Same number of descriptors for every supported type
pub fn uniform_descriptor_count(per_type: u32) -> DescriptorTotalCount {
    DescriptorTotalCount {
        sampler: per_type,
        combined_image_sampler: per_type,
        sampled_image: per_type,
        storage_image: per_type,
        uniform_texel_buffer: per_type,
        storage_texel_buffer: per_type,
        uniform_buffer: per_type,
        storage_buffer: per_type,
        uniform_buffer_dynamic: per_type,
        storage_buffer_dynamic: per_type,
        input_attachment: per_type,
        acceleration_structure: per_type,
        inline_uniform_block_bytes: 0,
        inline_uniform_block_bindings: 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedDescriptorSet {
    pub set: vk::DescriptorSet,
    pub(crate) pool: usize,
}

impl AllocatedDescriptorSet {
    /// Index of the pool this set was allocated from
    pub fn pool_index(&self) -> usize {
        self.pool
    }
}

struct PoolEntry {
    handle: vk::DescriptorPool,
    allocated: u32,
}

/// Descriptor pools that grow on demand.
///
/// An allocation that fails because the newest pool is exhausted or fragmented is retried once
/// in a freshly created pool. Pools are only ever destroyed all together.
pub struct DescriptorSetAllocator<D = DescriptorAshDevice>
where
    D: DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>,
{
    pools: Vec<PoolEntry>,
    sets_per_pool: u32,
    descriptor_count: DescriptorTotalCount,
    max_pools: Option<usize>,
    device: D,
}

impl DescriptorSetAllocator<DescriptorAshDevice> {
    pub fn from_config(device: Arc<ash::Device>, config: &RenderConfig) -> Self {
        Self::new(
            DescriptorAshDevice(device),
            config.descriptor_sets_per_pool,
            DEFAULT_DESCRIPTORS_PER_TYPE,
            config.max_descriptor_pools,
        )
    }
}

impl<D> DescriptorSetAllocator<D>
where
    D: DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>,
{
    pub fn new(
        device: D,
        sets_per_pool: u32,
        descriptors_per_type: u32,
        max_pools: Option<usize>,
    ) -> Self {
        Self {
            pools: Vec::new(),
            sets_per_pool: sets_per_pool.max(1),
            descriptor_count: uniform_descriptor_count(descriptors_per_type),
            max_pools,
            device,
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn allocated_sets(&self) -> u32 {
        self.pools.iter().map(|p| p.allocated).sum()
    }

    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> Result<AllocatedDescriptorSet> {
        if let Some(pool) = self.pools.len().checked_sub(1) {
            match self.allocate_in(pool, layout) {
                Ok(set) => return Ok(set),
                Err(DeviceAllocationError::OutOfPoolMemory | DeviceAllocationError::FragmentedPool) => {}
                Err(err) => return Err(map_allocation_error(err)),
            }
        }

        let pool = self.grow()?;
        self.allocate_in(pool, layout).map_err(|err| match err {
            // A fresh pool that cannot hold a single set means the layout exceeds the pool sizes
            DeviceAllocationError::OutOfPoolMemory | DeviceAllocationError::FragmentedPool => {
                HriError::precondition("Descriptor set layout does not fit into an empty descriptor pool")
            }
            err => map_allocation_error(err),
        })
    }

    pub fn free_descriptor_set(&mut self, set: AllocatedDescriptorSet) -> Result<()> {
        let entry = self
            .pools
            .get_mut(set.pool)
            .ok_or_else(|| HriError::precondition("Descriptor set does not belong to this allocator"))?;
        unsafe {
            self.device
                .dealloc_descriptor_sets(&mut entry.handle, std::iter::once(set.set));
        }
        entry.allocated = entry.allocated.saturating_sub(1);
        Ok(())
    }

    /// Destroys every pool, invalidating all sets handed out so far
    pub fn reset(&mut self) {
        let pool_count = self.pools.len();
        for entry in self.pools.drain(..) {
            unsafe {
                self.device.destroy_descriptor_pool(entry.handle);
            }
        }
        if pool_count > 0 {
            log::debug!("Destroyed {pool_count} descriptor pools");
        }
    }

    fn allocate_in(
        &mut self,
        pool: usize,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<AllocatedDescriptorSet, DeviceAllocationError> {
        let entry = &mut self.pools[pool];
        let mut sets = smallvec::SmallVec::<[vk::DescriptorSet; 1]>::new();
        unsafe {
            self.device
                .alloc_descriptor_sets(&mut entry.handle, std::iter::once(&layout), &mut sets)?;
        }
        let set = sets.pop().ok_or(DeviceAllocationError::OutOfPoolMemory)?;
        entry.allocated += 1;
        Ok(AllocatedDescriptorSet { set, pool })
    }

    fn grow(&mut self) -> Result<usize> {
        if let Some(max_pools) = self.max_pools {
            if self.pools.len() >= max_pools {
                return Err(HriError::PoolExhausted(max_pools));
            }
        }

        let handle = unsafe {
            self.device.create_descriptor_pool(
                &self.descriptor_count,
                self.sets_per_pool,
                DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            )
        }
            .map_err(|err| match err {
                CreatePoolError::OutOfDeviceMemory => HriError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
                CreatePoolError::OutOfHostMemory => HriError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
                CreatePoolError::Fragmentation => HriError::Vulkan(vk::Result::ERROR_FRAGMENTATION),
            })?;

        self.pools.push(PoolEntry { handle, allocated: 0 });
        log::debug!(
            "Created descriptor pool #{} ({} sets)",
            self.pools.len(),
            self.sets_per_pool,
        );
        Ok(self.pools.len() - 1)
    }
}

fn map_allocation_error(err: DeviceAllocationError) -> HriError {
    match err {
        DeviceAllocationError::OutOfDeviceMemory => HriError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
        DeviceAllocationError::OutOfHostMemory => HriError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
        DeviceAllocationError::OutOfPoolMemory => HriError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
        DeviceAllocationError::FragmentedPool => HriError::Vulkan(vk::Result::ERROR_FRAGMENTED_POOL),
    }
}

impl<D> Drop for DescriptorSetAllocator<D>
where
    D: DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>,
{
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use ash::vk::Handle;
    use super::*;

    #[derive(Default)]
    struct MockState {
        next_handle: u64,
        live_pools: HashMap<u64, u32>,
        destroyed: usize,
    }

    #[derive(Clone)]
    struct MockDevice {
        state: Rc<RefCell<MockState>>,
    }

    impl MockDevice {
        fn new() -> Self {
            Self { state: Rc::new(RefCell::new(MockState::default())) }
        }
    }

    impl DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet> for MockDevice {
        unsafe fn create_descriptor_pool(
            &self,
            _descriptor_count: &DescriptorTotalCount,
            max_sets: u32,
            _flags: DescriptorPoolCreateFlags,
        ) -> Result<vk::DescriptorPool, CreatePoolError> {
            let mut state = self.state.borrow_mut();
            state.next_handle += 1;
            let handle = state.next_handle;
            state.live_pools.insert(handle, max_sets);
            Ok(vk::DescriptorPool::from_raw(handle))
        }

        unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
            let mut state = self.state.borrow_mut();
            state.live_pools.remove(&pool.as_raw());
            state.destroyed += 1;
        }

        unsafe fn alloc_descriptor_sets<'a>(
            &self,
            pool: &mut vk::DescriptorPool,
            layouts: impl ExactSizeIterator<Item = &'a vk::DescriptorSetLayout>,
            sets: &mut impl Extend<vk::DescriptorSet>,
        ) -> Result<(), DeviceAllocationError> {
            let mut state = self.state.borrow_mut();
            let remaining = state
                .live_pools
                .get_mut(&pool.as_raw())
                .ok_or(DeviceAllocationError::OutOfHostMemory)?;
            let requested = layouts.len() as u32;
            if *remaining < requested {
                return Err(DeviceAllocationError::OutOfPoolMemory);
            }
            *remaining -= requested;
            let base = pool.as_raw() << 16 | u64::from(*remaining);
            sets.extend((0..requested).map(|i| vk::DescriptorSet::from_raw(base + u64::from(i))));
            Ok(())
        }

        unsafe fn dealloc_descriptor_sets<'a>(
            &self,
            pool: &mut vk::DescriptorPool,
            sets: impl Iterator<Item = vk::DescriptorSet>,
        ) {
            let mut state = self.state.borrow_mut();
            if let Some(remaining) = state.live_pools.get_mut(&pool.as_raw()) {
                *remaining += sets.count() as u32;
            }
        }
    }

    fn layout() -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::from_raw(7)
    }

    #[test]
    fn grows_past_initial_pool() {
        let device = MockDevice::new();
        let mut allocator = DescriptorSetAllocator::new(device.clone(), 4, 16, None);

        let sets: Vec<_> = (0..10)
            .map(|_| allocator.allocate(layout()).unwrap())
            .collect();

        assert_eq!(allocator.pool_count(), 3);
        assert_eq!(allocator.allocated_sets(), 10);
        assert_eq!(sets[3].pool_index(), 0);
        assert_eq!(sets[4].pool_index(), 1);
        assert_eq!(sets[9].pool_index(), 2);
        assert_eq!(device.state.borrow().live_pools.len(), 3);
    }

    #[test]
    fn cap_is_reported_as_pool_exhaustion() {
        let device = MockDevice::new();
        let mut allocator = DescriptorSetAllocator::new(device, 2, 16, Some(2));

        for _ in 0..4 {
            allocator.allocate(layout()).unwrap();
        }
        let err = allocator.allocate(layout()).unwrap_err();
        assert!(matches!(err, HriError::PoolExhausted(2)));
        assert_eq!(allocator.pool_count(), 2);
    }

    #[test]
    fn freed_sets_make_room_in_their_pool() {
        let device = MockDevice::new();
        let mut allocator = DescriptorSetAllocator::new(device, 2, 16, Some(1));

        let first = allocator.allocate(layout()).unwrap();
        allocator.allocate(layout()).unwrap();
        allocator.free_descriptor_set(first).unwrap();
        assert_eq!(allocator.allocated_sets(), 1);

        let again = allocator.allocate(layout()).unwrap();
        assert_eq!(again.pool_index(), 0);
        assert_eq!(allocator.pool_count(), 1);
    }

    #[test]
    fn reset_and_drop_destroy_every_pool() {
        let device = MockDevice::new();
        {
            let mut allocator = DescriptorSetAllocator::new(device.clone(), 1, 16, None);
            allocator.allocate(layout()).unwrap();
            allocator.allocate(layout()).unwrap();
            allocator.reset();
            assert_eq!(allocator.pool_count(), 0);
            assert_eq!(device.state.borrow().destroyed, 2);

            allocator.allocate(layout()).unwrap();
        }
        let state = device.state.borrow();
        assert_eq!(state.destroyed, 3);
        assert!(state.live_pools.is_empty());
    }

    #[test]
    fn pool_sizes_skip_empty_types() {
        let mut count = DescriptorTotalCount::default();
        count.storage_buffer = 8;
        count.acceleration_structure = 2;
        let sizes = pool_sizes(&count);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[1].ty, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);

        assert_eq!(pool_sizes(&uniform_descriptor_count(128)).len(), 12);
    }
}
