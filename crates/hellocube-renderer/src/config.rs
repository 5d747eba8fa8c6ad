//! Render configuration.
//!
//! Defaults match the stock window (800x600, triple buffering, no vsync).
//! Every field can be overridden through `HELLOCUBE_*` environment variables;
//! values that fail to parse are logged and ignored.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

/// Which backend drives the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Vulkan,
    /// Simulated GPU, nothing reaches the screen.
    Null,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vulkan" | "vk" => Ok(Self::Vulkan),
            "null" | "sim" | "headless" => Ok(Self::Null),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

pub const MIN_BUFFER_COUNT: u32 = 2;
pub const MAX_BUFFER_COUNT: u32 = 3;

/// Render configuration settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    /// Initial client width
    pub width: u32,
    /// Initial client height
    pub height: u32,
    /// Swapchain images requested (2 or 3)
    pub buffer_count: u32,
    pub vsync: bool,
    /// Use a software rasteriser (WARP/lavapipe)
    pub prefer_software_adapter: bool,
    /// Only accept discrete GPUs
    pub require_discrete_gpu: bool,
    /// Enable API validation layers
    pub validation: bool,
    /// Bound on every fence wait; zero waits forever
    pub fence_timeout: Duration,
    pub clear_color: [f32; 4],
    /// Directory holding compiled SPIR-V
    pub shader_dir: PathBuf,
    pub backend: BackendKind,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            buffer_count: 3,
            vsync: false,
            prefer_software_adapter: false,
            require_discrete_gpu: false,
            validation: cfg!(debug_assertions),
            fence_timeout: Duration::from_secs(10),
            clear_color: [0.4, 0.6, 0.9, 1.0],
            shader_dir: PathBuf::from("shaders"),
            backend: BackendKind::Vulkan,
        }
    }
}

impl RenderConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each `HELLOCUBE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        override_parsed(&lookup, "HELLOCUBE_WIDTH", &mut config.width);
        override_parsed(&lookup, "HELLOCUBE_HEIGHT", &mut config.height);
        override_parsed(&lookup, "HELLOCUBE_BUFFER_COUNT", &mut config.buffer_count);
        override_flag(&lookup, "HELLOCUBE_VSYNC", &mut config.vsync);
        override_flag(&lookup, "HELLOCUBE_SOFTWARE_ADAPTER", &mut config.prefer_software_adapter);
        override_flag(&lookup, "HELLOCUBE_REQUIRE_DISCRETE", &mut config.require_discrete_gpu);
        override_flag(&lookup, "HELLOCUBE_VALIDATION", &mut config.validation);
        override_parsed(&lookup, "HELLOCUBE_BACKEND", &mut config.backend);

        let mut timeout_ms = config.fence_timeout.as_millis() as u64;
        override_parsed(&lookup, "HELLOCUBE_FENCE_TIMEOUT_MS", &mut timeout_ms);
        config.fence_timeout = Duration::from_millis(timeout_ms);

        if let Some(dir) = lookup("HELLOCUBE_SHADER_DIR") {
            config.shader_dir = PathBuf::from(dir);
        }

        if let Some(raw) = lookup("HELLOCUBE_CLEAR_COLOR") {
            match parse_color(&raw) {
                Some(color) => config.clear_color = color,
                None => warn!("Ignoring HELLOCUBE_CLEAR_COLOR={:?}: expected four comma-separated floats", raw),
            }
        }

        config.buffer_count = clamp_buffer_count(config.buffer_count);
        config
    }

    /// Fence wait bound, `None` when unbounded.
    pub fn wait_timeout(&self) -> Option<Duration> {
        if self.fence_timeout.is_zero() {
            None
        } else {
            Some(self.fence_timeout)
        }
    }
}

/// Clamp a requested swapchain image count to what the renderer supports.
pub fn clamp_buffer_count(count: u32) -> u32 {
    count.clamp(MIN_BUFFER_COUNT, MAX_BUFFER_COUNT)
}

fn override_parsed<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(e) => warn!("Ignoring {}={:?}: {}", key, raw, e),
        }
    }
}

fn override_flag<F>(lookup: &F, key: &str, slot: &mut bool)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *slot = true,
            "0" | "false" | "no" | "off" => *slot = false,
            _ => warn!("Ignoring {}={:?}: expected a boolean", key, raw),
        }
    }
}

fn parse_color(raw: &str) -> Option<[f32; 4]> {
    let parts: Vec<f32> = raw
        .split(',')
        .map(|p| p.trim().parse::<f32>().ok())
        .collect::<Option<_>>()?;
    <[f32; 4]>::try_from(parts.as_slice()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    // ============================================================
    // Defaults
    // ============================================================

    #[test]
    fn test_render_config_default() {
        let config = RenderConfig::default();
        assert_eq!(config.width, 800);
        assert_eq!(config.height, 600);
        assert_eq!(config.buffer_count, 3);
        assert!(!config.vsync);
        assert!(!config.prefer_software_adapter);
        assert!(!config.require_discrete_gpu);
        assert_eq!(config.fence_timeout, Duration::from_secs(10));
        assert_eq!(config.clear_color, [0.4, 0.6, 0.9, 1.0]);
        assert_eq!(config.backend, BackendKind::Vulkan);
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        assert_eq!(RenderConfig::from_lookup(|_| None), RenderConfig::default());
    }

    // ============================================================
    // Overrides
    // ============================================================

    #[test]
    fn test_overrides_applied() {
        let config = RenderConfig::from_lookup(lookup_from(&[
            ("HELLOCUBE_WIDTH", "1280"),
            ("HELLOCUBE_HEIGHT", " 720 "),
            ("HELLOCUBE_VSYNC", "yes"),
            ("HELLOCUBE_BACKEND", "null"),
            ("HELLOCUBE_CLEAR_COLOR", "0, 0, 0, 1"),
            ("HELLOCUBE_SHADER_DIR", "/tmp/spv"),
        ]));
        assert_eq!(config.width, 1280);
        assert_eq!(config.height, 720);
        assert!(config.vsync);
        assert_eq!(config.backend, BackendKind::Null);
        assert_eq!(config.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.shader_dir, PathBuf::from("/tmp/spv"));
    }

    #[test]
    fn test_invalid_values_ignored() {
        let config = RenderConfig::from_lookup(lookup_from(&[
            ("HELLOCUBE_WIDTH", "wide"),
            ("HELLOCUBE_VSYNC", "maybe"),
            ("HELLOCUBE_BACKEND", "dx12"),
            ("HELLOCUBE_CLEAR_COLOR", "1,2,3"),
        ]));
        assert_eq!(config, RenderConfig::default());
    }

    #[test]
    fn test_buffer_count_clamped() {
        let config = RenderConfig::from_lookup(lookup_from(&[("HELLOCUBE_BUFFER_COUNT", "8")]));
        assert_eq!(config.buffer_count, 3);
        let config = RenderConfig::from_lookup(lookup_from(&[("HELLOCUBE_BUFFER_COUNT", "1")]));
        assert_eq!(config.buffer_count, 2);
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let config = RenderConfig::from_lookup(lookup_from(&[("HELLOCUBE_FENCE_TIMEOUT_MS", "0")]));
        assert_eq!(config.wait_timeout(), None);
        assert_eq!(RenderConfig::default().wait_timeout(), Some(Duration::from_secs(10)));
    }
}
