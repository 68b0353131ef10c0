use std::collections::HashSet;
use std::hash::Hash;
use ash::vk;

/// Queue capabilities a context has to resolve before device creation succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCapabilities {
    pub graphics: bool,
    pub compute: bool,
    pub transfer: bool,
    pub present: bool,
}

impl Default for QueueCapabilities {
    fn default() -> Self {
        Self {
            graphics: true,
            compute: true,
            transfer: true,
            present: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Queue {
    pub family: QueueFamily,
    pub handle: vk::Queue,
}

impl Queue {
    pub fn new(
        family: QueueFamily,
        handle: vk::Queue,
    ) -> Self {
        Self {
            family,
            handle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
    supports_present: bool,
}

impl QueueFamily {
    pub fn new(
        index: u32,
        properties: vk::QueueFamilyProperties,
        supports_present: bool,
    ) -> Self {
        Self {
            index,
            properties,
            supports_present,
        }
    }

    pub fn supports_present(&self) -> bool {
        self.supports_present
    }

    pub fn supports_graphics(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_compute(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    /// Graphics and compute families implicitly support transfer operations
    pub fn supports_transfer(&self) -> bool {
        self.properties.queue_flags.intersects(
            vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        )
    }
}

impl PartialEq for QueueFamily {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for QueueFamily {}

impl Hash for QueueFamily {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

/// Queue families picked for every capability, before any queue handle exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQueueFamilies {
    pub graphics: QueueFamily,
    pub compute: QueueFamily,
    pub transfer: QueueFamily,
    pub present: Option<QueueFamily>,
}

impl ResolvedQueueFamilies {
    /// Every family that needs a queue create info, without duplicates
    pub fn unique_families(&self) -> Vec<QueueFamily> {
        let mut seen = HashSet::new();
        [
            Some(&self.graphics),
            Some(&self.compute),
            Some(&self.transfer),
            self.present.as_ref(),
        ]
            .into_iter()
            .flatten()
            .filter(|family| seen.insert((*family).clone()))
            .cloned()
            .collect()
    }
}

/// Pick queue families for the requested capabilities.
///
/// Dedicated compute and transfer families are preferred, otherwise they share
/// the graphics family. Returns `None` when any requested capability cannot be
/// satisfied.
pub fn resolve_queue_families<F>(
    properties: &[vk::QueueFamilyProperties],
    supports_present: F,
    required: QueueCapabilities,
) -> Option<ResolvedQueueFamilies>
where
    F: Fn(u32) -> bool,
{
    let families = properties
        .iter()
        .enumerate()
        .map(|(i, props)| QueueFamily::new(i as u32, *props, supports_present(i as u32)))
        .collect::<Vec<_>>();

    let graphics = families
        .iter()
        .find(|f| f.supports_graphics() && (!required.present || f.supports_present()))
        .or_else(|| families.iter().find(|f| f.supports_graphics()))?
        .clone();

    let present = families
        .iter()
        .find(|f| *f == &graphics && f.supports_present())
        .or_else(|| families.iter().find(|f| f.supports_present()))
        .cloned();
    if required.present && present.is_none() {
        return None;
    }

    let compute = families
        .iter()
        .find(|f| f.supports_compute() && !f.supports_graphics())
        .or_else(|| families.iter().find(|f| f.supports_compute()));
    let compute = match compute {
        Some(family) => family.clone(),
        None if required.compute => return None,
        None => graphics.clone(),
    };

    let transfer = families
        .iter()
        .find(|f| {
            f.properties.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !f.supports_graphics()
                && !f.supports_compute()
        })
        .unwrap_or(&graphics)
        .clone();

    Some(ResolvedQueueFamilies {
        graphics,
        compute,
        transfer,
        present,
    })
}

/// Resolved queue handles for each capability, derived once at context creation
#[derive(Debug, Clone)]
pub struct RenderContextQueueState {
    pub graphics: Queue,
    pub compute: Queue,
    pub transfer: Queue,
    pub present: Option<Queue>,
}

impl RenderContextQueueState {
    pub fn new(
        device: &ash::Device,
        families: &ResolvedQueueFamilies,
    ) -> Self {
        let get_queue = |family: &QueueFamily| unsafe {
            Queue::new(family.clone(), device.get_device_queue(family.index, 0))
        };

        Self {
            graphics: get_queue(&families.graphics),
            compute: get_queue(&families.compute),
            transfer: get_queue(&families.transfer),
            present: families.present.as_ref().map(get_queue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_dedicated_compute_and_transfer_families() {
        let props = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let resolved = resolve_queue_families(&props, |i| i == 0, QueueCapabilities::default())
            .unwrap();

        assert_eq!(resolved.graphics.index, 0);
        assert_eq!(resolved.compute.index, 1);
        assert_eq!(resolved.transfer.index, 2);
        assert_eq!(resolved.present.as_ref().map(|f| f.index), Some(0));
        assert_eq!(resolved.unique_families().len(), 3);
    }

    #[test]
    fn falls_back_to_the_graphics_family() {
        let props = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        let resolved = resolve_queue_families(&props, |_| true, QueueCapabilities::default())
            .unwrap();

        assert_eq!(resolved.compute, resolved.graphics);
        assert_eq!(resolved.transfer, resolved.graphics);
        assert_eq!(resolved.unique_families().len(), 1);
    }

    #[test]
    fn graphics_family_that_can_present_wins() {
        let props = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let resolved = resolve_queue_families(&props, |i| i == 1, QueueCapabilities::default())
            .unwrap();

        assert_eq!(resolved.graphics.index, 1);
        assert_eq!(resolved.present.as_ref().map(|f| f.index), Some(1));
    }

    #[test]
    fn missing_required_capability_fails_resolution() {
        let props = [family(vk::QueueFlags::GRAPHICS)];
        assert!(resolve_queue_families(&props, |_| false, QueueCapabilities::default()).is_none());

        let no_compute = QueueCapabilities {
            compute: true,
            present: false,
            ..Default::default()
        };
        assert!(resolve_queue_families(&props, |_| false, no_compute).is_none());

        let headless = QueueCapabilities {
            compute: false,
            present: false,
            ..Default::default()
        };
        let resolved = resolve_queue_families(&props, |_| false, headless).unwrap();
        assert!(resolved.present.is_none());
        assert_eq!(resolved.compute, resolved.graphics);
    }
}
