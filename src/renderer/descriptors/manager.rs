use ash::vk;
use gpu_descriptor::DescriptorDevice;
use crate::renderer::descriptors::allocator::{AllocatedDescriptorSet, DescriptorSetAllocator};
use crate::renderer::descriptors::layout::DescriptorSetLayout;
use crate::renderer::error::{HriError, Result};

/// A ring of copies where one is written while the previous one is bound for reading.
///
/// With one more copy than there are frames in flight, the copy handed out for writing was
/// last bound by a frame whose slot fence has already been waited on. The roles rotate at
/// most once per frame number.
#[derive(Debug)]
pub struct FrameBuffered<T> {
    items: Vec<T>,
    write_index: usize,
    last_swap: Option<u64>,
}

impl<T> FrameBuffered<T> {
    pub fn new(items: Vec<T>) -> Result<Self> {
        if items.len() < 2 {
            return Err(HriError::precondition(format!(
                "Frame buffering needs at least 2 copies, got {}",
                items.len(),
            )));
        }

        Ok(Self {
            items,
            write_index: 1,
            last_swap: None,
        })
    }

    /// Copies needed so a write never lands on a copy read by `frames_in_flight` pending frames
    pub fn copies_for(frames_in_flight: usize) -> usize {
        frames_in_flight.max(1) + 1
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn bound_index(&self) -> usize {
        (self.write_index + self.len() - 1) % self.len()
    }

    pub fn bound(&self) -> &T {
        &self.items[self.bound_index()]
    }

    pub fn write(&self) -> &T {
        &self.items[self.write_index]
    }

    pub fn write_mut(&mut self) -> &mut T {
        &mut self.items[self.write_index]
    }

    /// Returns `false` if a swap already happened for `frame_number`
    pub fn swap(&mut self, frame_number: u64) -> bool {
        if self.last_swap == Some(frame_number) {
            return false;
        }
        self.last_swap = Some(frame_number);
        self.write_index = (self.write_index + 1) % self.len();
        true
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DescriptorWriteKind {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

/// A single descriptor update, kept around so it can be replayed into the other sets
#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub kind: DescriptorWriteKind,
}

impl DescriptorWrite {
    fn slot(&self) -> (u32, u32) {
        (self.binding, self.array_element)
    }
}

/// Frame-buffered descriptor set for one binding point.
///
/// Writes are queued against every set and applied to the write-side set on `flush`. Each
/// set catches up on the writes it missed when it next becomes the write side, so all copies
/// converge without the caller repeating them.
pub struct DescriptorSetManager {
    sets: FrameBuffered<AllocatedDescriptorSet>,
    layout: vk::DescriptorSetLayout,
    stale: Vec<Vec<DescriptorWrite>>,
}

impl DescriptorSetManager {
    /// Allocates one set more than `frames_in_flight`
    pub fn new<D>(
        allocator: &mut DescriptorSetAllocator<D>,
        layout: &DescriptorSetLayout,
        frames_in_flight: usize,
    ) -> Result<Self>
    where
        D: DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>,
    {
        let count = FrameBuffered::<AllocatedDescriptorSet>::copies_for(frames_in_flight);
        let mut sets = Vec::with_capacity(count);
        for _ in 0..count {
            match allocator.allocate(layout.handle) {
                Ok(set) => sets.push(set),
                Err(err) => {
                    for set in sets {
                        allocator.free_descriptor_set(set)?;
                    }
                    return Err(err);
                }
            }
        }

        Self::from_sets(sets, layout.handle)
    }

    pub fn from_sets(
        sets: Vec<AllocatedDescriptorSet>,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Self> {
        let stale = vec![Vec::new(); sets.len()];
        Ok(Self {
            sets: FrameBuffered::new(sets)?,
            layout,
            stale,
        })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    /// Set to bind while recording the current frame
    pub fn bound_set(&self) -> vk::DescriptorSet {
        self.sets.bound().set
    }

    /// Set that receives writes for the next frame
    pub fn write_set(&self) -> vk::DescriptorSet {
        self.sets.write().set
    }

    /// Writes the write-side set has not received yet
    pub fn pending_writes(&self) -> &[DescriptorWrite] {
        &self.stale[self.sets.write_index()]
    }

    pub fn write_buffer(
        &mut self,
        binding: u32,
        array_element: u32,
        descriptor_type: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    ) -> &mut Self {
        self.queue(DescriptorWrite {
            binding,
            array_element,
            descriptor_type,
            kind: DescriptorWriteKind::Buffer(info),
        })
    }

    pub fn write_image(
        &mut self,
        binding: u32,
        array_element: u32,
        descriptor_type: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
    ) -> &mut Self {
        self.queue(DescriptorWrite {
            binding,
            array_element,
            descriptor_type,
            kind: DescriptorWriteKind::Image(info),
        })
    }

    pub fn write_acceleration_structure(
        &mut self,
        binding: u32,
        array_element: u32,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> &mut Self {
        self.queue(DescriptorWrite {
            binding,
            array_element,
            descriptor_type: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            kind: DescriptorWriteKind::AccelerationStructure(acceleration_structure),
        })
    }

    /// Called once per frame boundary, after the frame's slot fence has been waited on.
    /// Repeated calls with the same frame number are ignored.
    pub fn swap(&mut self, frame_number: u64) -> bool {
        self.sets.swap(frame_number)
    }

    /// Take the writes the write-side set is missing
    pub fn take_pending(&mut self) -> (vk::DescriptorSet, Vec<DescriptorWrite>) {
        let writes = std::mem::take(&mut self.stale[self.sets.write_index()]);
        (self.write_set(), writes)
    }

    pub fn flush(&mut self, device: &ash::Device) -> Result<usize> {
        let (dst_set, writes) = self.take_pending();
        if writes.is_empty() {
            return Ok(0);
        }
        update_descriptor_set(device, dst_set, &writes)?;
        Ok(writes.len())
    }

    pub fn free<D>(self, allocator: &mut DescriptorSetAllocator<D>) -> Result<()>
    where
        D: DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>,
    {
        for set in self.sets.into_inner() {
            allocator.free_descriptor_set(set)?;
        }
        Ok(())
    }

    fn queue(&mut self, write: DescriptorWrite) -> &mut Self {
        for writes in &mut self.stale {
            upsert(writes, write);
        }
        self
    }
}

fn upsert(writes: &mut Vec<DescriptorWrite>, write: DescriptorWrite) {
    match writes.iter_mut().find(|w| w.slot() == write.slot()) {
        Some(existing) => *existing = write,
        None => writes.push(write),
    }
}

pub fn update_descriptor_set(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    writes: &[DescriptorWrite],
) -> Result<()> {
    let mut buffer_infos = Vec::new();
    let mut image_infos = Vec::new();
    let mut as_handles = Vec::new();
    for write in writes {
        match write.kind {
            DescriptorWriteKind::Buffer(info) => buffer_infos.push([info]),
            DescriptorWriteKind::Image(info) => image_infos.push([info]),
            DescriptorWriteKind::AccelerationStructure(handle) => as_handles.push([handle]),
        }
    }
    let mut as_infos: Vec<_> = as_handles
        .iter()
        .map(|handles| {
            vk::WriteDescriptorSetAccelerationStructureKHR::default()
                .acceleration_structures(handles)
        })
        .collect();

    let mut buffer_infos = buffer_infos.iter();
    let mut image_infos = image_infos.iter();
    let mut as_infos = as_infos.iter_mut();
    let mut vk_writes = Vec::with_capacity(writes.len());
    for write in writes {
        let base = vk::WriteDescriptorSet::default()
            .dst_set(dst_set)
            .dst_binding(write.binding)
            .dst_array_element(write.array_element)
            .descriptor_type(write.descriptor_type);
        let missing = || HriError::precondition("Descriptor write bookkeeping mismatch");
        let vk_write = match write.kind {
            DescriptorWriteKind::Buffer(_) => base.buffer_info(buffer_infos.next().ok_or_else(missing)?),
            DescriptorWriteKind::Image(_) => base.image_info(image_infos.next().ok_or_else(missing)?),
            DescriptorWriteKind::AccelerationStructure(_) => base
                .descriptor_count(1)
                .push_next(as_infos.next().ok_or_else(missing)?),
        };
        vk_writes.push(vk_write);
    }

    unsafe {
        device.update_descriptor_sets(&vk_writes, &[]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;
    use crate::renderer::frame::cycle::FrameCycle;
    use super::*;

    fn manager_with(count: u64) -> DescriptorSetManager {
        let sets = (0..count)
            .map(|i| AllocatedDescriptorSet { set: vk::DescriptorSet::from_raw(101 + i), pool: 0 })
            .collect();
        DescriptorSetManager::from_sets(sets, vk::DescriptorSetLayout::from_raw(1)).unwrap()
    }

    fn manager() -> DescriptorSetManager {
        manager_with(2)
    }

    fn buffer_of(write: &DescriptorWrite) -> Option<vk::Buffer> {
        match write.kind {
            DescriptorWriteKind::Buffer(info) => Some(info.buffer),
            _ => None,
        }
    }

    fn uniform(buffer: u64) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(vk::Buffer::from_raw(buffer))
            .range(vk::WHOLE_SIZE)
    }

    #[test]
    fn swaps_once_per_frame() {
        let mut buffered = FrameBuffered::new(vec!['a', 'b', 'c']).unwrap();
        assert_eq!(*buffered.bound(), 'a');
        assert_eq!(*buffered.write(), 'b');

        assert!(buffered.swap(1));
        assert!(!buffered.swap(1));
        assert_eq!(*buffered.bound(), 'b');
        assert_eq!(*buffered.write(), 'c');

        assert!(buffered.swap(2));
        assert_eq!(*buffered.bound(), 'c');
        assert_eq!(*buffered.write(), 'a');
    }

    #[test]
    fn needs_at_least_two_copies() {
        assert!(FrameBuffered::new(vec![1]).is_err());
        assert_eq!(FrameBuffered::<u8>::copies_for(2), 3);
        assert_eq!(FrameBuffered::<u8>::copies_for(3), 4);
    }

    #[test]
    fn bound_and_write_sets_differ() {
        let mut manager = manager();
        let bound = manager.bound_set();
        let write = manager.write_set();
        assert_ne!(bound, write);

        manager.swap(1);
        assert_eq!(manager.bound_set(), write);
        assert_eq!(manager.write_set(), bound);
    }

    #[test]
    fn later_write_to_same_slot_wins() {
        let mut manager = manager();
        manager
            .write_buffer(0, 0, vk::DescriptorType::UNIFORM_BUFFER, uniform(1))
            .write_buffer(0, 1, vk::DescriptorType::UNIFORM_BUFFER, uniform(2))
            .write_buffer(0, 0, vk::DescriptorType::UNIFORM_BUFFER, uniform(3));

        let pending = manager.pending_writes();
        assert_eq!(pending.len(), 2);
        assert_eq!(buffer_of(&pending[0]), Some(vk::Buffer::from_raw(3)));
    }

    #[test]
    fn flushed_writes_are_replayed_after_swap() {
        let mut manager = manager();
        manager.write_acceleration_structure(2, 0, vk::AccelerationStructureKHR::from_raw(9));

        let first_target = manager.write_set();
        let (target, writes) = manager.take_pending();
        assert_eq!(target, first_target);
        assert_eq!(writes.len(), 1);
        assert!(manager.pending_writes().is_empty());

        manager.swap(1);
        manager.write_buffer(0, 0, vk::DescriptorType::STORAGE_BUFFER, uniform(4));
        let (target, writes) = manager.take_pending();
        assert_ne!(target, first_target);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].descriptor_type, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);

        // Repeating the swap for the same frame must not re-queue anything
        manager.swap(1);
        assert!(manager.pending_writes().is_empty());
    }

    #[test]
    fn pending_write_overrides_replayed_one() {
        let mut manager = manager();
        manager.write_buffer(0, 0, vk::DescriptorType::UNIFORM_BUFFER, uniform(1));
        manager.take_pending();

        manager.write_buffer(0, 0, vk::DescriptorType::UNIFORM_BUFFER, uniform(2));
        manager.swap(1);

        let pending = manager.pending_writes();
        assert_eq!(pending.len(), 1);
        assert_eq!(buffer_of(&pending[0]), Some(vk::Buffer::from_raw(2)));
    }

    #[test]
    fn every_set_catches_up_once() {
        let mut manager = manager_with(3);
        manager.write_buffer(0, 0, vk::DescriptorType::UNIFORM_BUFFER, uniform(1));

        let mut targets = Vec::new();
        for frame in 1..=4 {
            let (target, writes) = manager.take_pending();
            if !writes.is_empty() {
                targets.push(target);
            }
            manager.swap(frame);
        }
        targets.sort_by_key(|set| set.as_raw());
        assert_eq!(targets, (101..104).map(vk::DescriptorSet::from_raw).collect::<Vec<_>>());
    }

    fn assert_writes_avoid_in_flight_sets(depth: usize) {
        let mut cycle = FrameCycle::new(depth).unwrap();
        let mut manager = manager_with(FrameBuffered::<u8>::copies_for(depth) as u64);
        let mut bound_by_slot = vec![None; depth];

        for frame in 1..=12u64 {
            let slot = cycle.current_slot();
            cycle.mark_retired(slot).unwrap();
            cycle.acquire().unwrap();
            manager.swap(frame);

            for other in 0..depth {
                if cycle.is_in_flight(other) {
                    assert_ne!(
                        Some(manager.write_set()),
                        bound_by_slot[other],
                        "frame {frame}: write set is bound by in-flight slot {other}",
                    );
                }
            }

            manager.write_buffer(0, 0, vk::DescriptorType::UNIFORM_BUFFER, uniform(frame));
            manager.take_pending();
            bound_by_slot[slot] = Some(manager.bound_set());
            assert_ne!(manager.bound_set(), manager.write_set());

            cycle.start_recording().unwrap();
            cycle.submit().unwrap();
            cycle.present().unwrap();
            cycle.finish().unwrap();
        }
    }

    #[test]
    fn double_buffered_frames_never_write_an_in_flight_set() {
        assert_writes_avoid_in_flight_sets(2);
    }

    #[test]
    fn triple_buffered_frames_never_write_an_in_flight_set() {
        assert_writes_avoid_in_flight_sets(3);
    }
}
