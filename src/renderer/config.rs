use std::str::FromStr;
use std::time::Duration;
use ash::vk;
use crate::renderer::error::{HriError, Result};

pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_DESCRIPTOR_SETS_PER_POOL: u32 = 128;
pub const DEFAULT_DESCRIPTORS_PER_TYPE: u32 = 128;

/// Swapchain buffering behaviour requested by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VSyncMode {
    Disabled,
    DoubleBuffering,
    #[default]
    TripleBuffering,
}

impl VSyncMode {
    /// Number of swapchain images this mode aims for before surface limits are applied
    pub fn image_count_target(self) -> u32 {
        match self {
            VSyncMode::Disabled => 2,
            VSyncMode::DoubleBuffering => 2,
            VSyncMode::TripleBuffering => 3,
        }
    }

    /// Number of frame slots the render core cycles through
    pub fn frames_in_flight(self) -> usize {
        match self {
            VSyncMode::TripleBuffering => 3,
            _ => 2,
        }
    }

    /// Present modes in order of preference, FIFO is always available as the last resort
    pub fn preferred_present_modes(self) -> &'static [vk::PresentModeKHR] {
        match self {
            VSyncMode::Disabled => &[
                vk::PresentModeKHR::IMMEDIATE,
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::FIFO_RELAXED,
                vk::PresentModeKHR::FIFO,
            ],
            VSyncMode::DoubleBuffering | VSyncMode::TripleBuffering => &[
                vk::PresentModeKHR::FIFO,
            ],
        }
    }
}

impl FromStr for VSyncMode {
    type Err = HriError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(VSyncMode::Disabled),
            "double" | "double_buffering" | "2" => Ok(VSyncMode::DoubleBuffering),
            "triple" | "triple_buffering" | "3" => Ok(VSyncMode::TripleBuffering),
            other => Err(HriError::precondition(format!("Unknown vsync mode '{other}'"))),
        }
    }
}

/// Swapchain image count and present mode resolved against the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentSetup {
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
}

impl PresentSetup {
    pub fn resolve(
        mode: VSyncMode,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        available_modes: &[vk::PresentModeKHR],
    ) -> Self {
        let mut image_count = mode.image_count_target().max(capabilities.min_image_count);
        // A max image count of zero means there is no upper limit
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let present_mode = mode
            .preferred_present_modes()
            .iter()
            .copied()
            .find(|preferred| available_modes.contains(preferred))
            .unwrap_or(vk::PresentModeKHR::FIFO);

        Self {
            image_count,
            present_mode,
        }
    }
}

/// Contains configuration options for the renderer like vsync, timeouts and pool limits
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub app_name: String,
    pub vsync_mode: VSyncMode,
    pub frame_timeout: Duration,
    pub descriptor_sets_per_pool: u32,
    pub max_descriptor_pools: Option<usize>,
    pub enable_ray_tracing: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            app_name: "hri".to_string(),
            vsync_mode: VSyncMode::default(),
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            descriptor_sets_per_pool: DEFAULT_DESCRIPTOR_SETS_PER_POOL,
            max_descriptor_pools: None,
            enable_ray_tracing: false,
        }
    }
}

impl RenderConfig {
    /// Defaults overlaid with `HRI_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(vsync) = lookup("HRI_VSYNC") {
            self.vsync_mode = vsync.parse()?;
        }
        if let Some(timeout_ms) = lookup("HRI_FRAME_TIMEOUT_MS") {
            let timeout_ms = timeout_ms
                .trim()
                .parse::<u64>()
                .map_err(|e| HriError::precondition(format!("HRI_FRAME_TIMEOUT_MS: {e}")))?;
            self.frame_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(max_pools) = lookup("HRI_MAX_DESCRIPTOR_POOLS") {
            let max_pools = max_pools
                .trim()
                .parse::<usize>()
                .map_err(|e| HriError::precondition(format!("HRI_MAX_DESCRIPTOR_POOLS: {e}")))?;
            self.max_descriptor_pools = Some(max_pools);
        }
        if let Some(ray_tracing) = lookup("HRI_RAY_TRACING") {
            self.enable_ray_tracing = matches!(ray_tracing.trim(), "1" | "true" | "on");
        }

        if self.frame_timeout.is_zero() {
            return Err(HriError::precondition("Frame timeout must be non-zero"));
        }

        Ok(self)
    }
}

pub(crate) fn timeout_nanos(timeout: Duration) -> u64 {
    timeout.as_nanos().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn image_count_follows_vsync_mode() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        let caps = caps(1, 8);

        let disabled = PresentSetup::resolve(VSyncMode::Disabled, &caps, &modes);
        assert!((1..=2).contains(&disabled.image_count));
        assert_eq!(disabled.present_mode, vk::PresentModeKHR::MAILBOX);

        let double = PresentSetup::resolve(VSyncMode::DoubleBuffering, &caps, &modes);
        assert_eq!(double.image_count, 2);
        assert_eq!(double.present_mode, vk::PresentModeKHR::FIFO);

        let triple = PresentSetup::resolve(VSyncMode::TripleBuffering, &caps, &modes);
        assert_eq!(triple.image_count, 3);
        assert_eq!(triple.present_mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn image_count_is_clamped_to_surface_limits() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            PresentSetup::resolve(VSyncMode::TripleBuffering, &caps(2, 2), &modes).image_count,
            2,
        );
        assert_eq!(
            PresentSetup::resolve(VSyncMode::DoubleBuffering, &caps(3, 0), &modes).image_count,
            3,
        );
    }

    #[test]
    fn disabled_vsync_prefers_immediate() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        let setup = PresentSetup::resolve(VSyncMode::Disabled, &caps(1, 0), &modes);
        assert_eq!(setup.present_mode, vk::PresentModeKHR::IMMEDIATE);

        let fifo_only = PresentSetup::resolve(VSyncMode::Disabled, &caps(1, 0), &[vk::PresentModeKHR::FIFO]);
        assert_eq!(fifo_only.present_mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn frames_in_flight_match_buffering_depth() {
        assert_eq!(VSyncMode::DoubleBuffering.frames_in_flight(), 2);
        assert_eq!(VSyncMode::TripleBuffering.frames_in_flight(), 3);
        assert_eq!(VSyncMode::Disabled.frames_in_flight(), 2);
    }

    #[test]
    fn vsync_mode_parses_from_strings() {
        assert_eq!("Triple".parse::<VSyncMode>().unwrap(), VSyncMode::TripleBuffering);
        assert_eq!("double".parse::<VSyncMode>().unwrap(), VSyncMode::DoubleBuffering);
        assert_eq!(" off ".parse::<VSyncMode>().unwrap(), VSyncMode::Disabled);
        assert!("quadruple".parse::<VSyncMode>().is_err());
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let config = RenderConfig::default()
            .with_overrides(|key| match key {
                "HRI_VSYNC" => Some("double".into()),
                "HRI_FRAME_TIMEOUT_MS" => Some("250".into()),
                "HRI_MAX_DESCRIPTOR_POOLS" => Some("4".into()),
                "HRI_RAY_TRACING" => Some("1".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.vsync_mode, VSyncMode::DoubleBuffering);
        assert_eq!(config.frame_timeout, Duration::from_millis(250));
        assert_eq!(config.max_descriptor_pools, Some(4));
        assert!(config.enable_ray_tracing);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let result = RenderConfig::default().with_overrides(|key| {
            (key == "HRI_FRAME_TIMEOUT_MS").then(|| "0".to_string())
        });
        assert!(result.is_err());
    }
}
