//! Adapter discovery results and the selection policy.

use log::{debug, info};

use crate::error::{RenderError, Result};

/// Broad class of a physical adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Discrete,
    Integrated,
    Virtual,
    /// CPU rasteriser (WARP, lavapipe, SwiftShader).
    Software,
    Other,
}

/// One enumerated adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Position in the backend's enumeration order.
    pub index: usize,
    pub name: String,
    pub kind: AdapterKind,
    /// Dedicated video memory in bytes.
    pub dedicated_memory: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterRequest {
    /// Pick a software rasteriser instead of a hardware adapter.
    pub prefer_software: bool,
    /// Only consider discrete GPUs.
    pub require_discrete: bool,
}

/// Pick an adapter.
///
/// `probe` tests whether a device at the required feature level can be created
/// on the adapter. With `prefer_software` the first software adapter that
/// passes is returned; otherwise the hardware adapter with the most dedicated
/// memory wins, earlier adapters winning ties.
pub fn select_adapter<F>(
    adapters: &[AdapterInfo],
    request: AdapterRequest,
    mut probe: F,
) -> Result<AdapterInfo>
where
    F: FnMut(&AdapterInfo) -> bool,
{
    if request.prefer_software {
        return adapters
            .iter()
            .filter(|a| a.kind == AdapterKind::Software)
            .find(|a| probe(a))
            .cloned()
            .ok_or_else(|| RenderError::AdapterNotFound("no software adapter available".into()));
    }

    let mut best: Option<&AdapterInfo> = None;
    for adapter in adapters {
        if adapter.kind == AdapterKind::Software {
            continue;
        }
        if request.require_discrete && adapter.kind != AdapterKind::Discrete {
            debug!("Skipping non-discrete adapter {}", adapter.name);
            continue;
        }
        if !probe(adapter) {
            debug!("Adapter {} failed the feature probe", adapter.name);
            continue;
        }
        if best.map_or(true, |b| adapter.dedicated_memory > b.dedicated_memory) {
            best = Some(adapter);
        }
    }

    let chosen = best.cloned().ok_or_else(|| {
        RenderError::AdapterNotFound(format!(
            "none of {} adapter(s) meet the requirements",
            adapters.len()
        ))
    })?;
    info!(
        "Selected adapter: {} ({:?}, {} MB)",
        chosen.name,
        chosen.kind,
        chosen.dedicated_memory / (1024 * 1024)
    );
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn adapter(index: usize, kind: AdapterKind, memory_mb: u64) -> AdapterInfo {
        AdapterInfo {
            index,
            name: format!("adapter{}", index),
            kind,
            dedicated_memory: memory_mb * MB,
        }
    }

    fn pool() -> Vec<AdapterInfo> {
        vec![
            adapter(0, AdapterKind::Integrated, 512),
            adapter(1, AdapterKind::Discrete, 8192),
            adapter(2, AdapterKind::Software, 0),
            adapter(3, AdapterKind::Discrete, 4096),
        ]
    }

    #[test]
    fn test_most_memory_wins() {
        let chosen = select_adapter(&pool(), AdapterRequest::default(), |_| true).unwrap();
        assert_eq!(chosen.index, 1);
    }

    #[test]
    fn test_probe_failures_are_skipped() {
        let chosen = select_adapter(&pool(), AdapterRequest::default(), |a| a.index != 1).unwrap();
        assert_eq!(chosen.index, 3);
    }

    #[test]
    fn test_first_adapter_wins_ties() {
        let adapters = vec![
            adapter(0, AdapterKind::Discrete, 2048),
            adapter(1, AdapterKind::Discrete, 2048),
        ];
        let chosen = select_adapter(&adapters, AdapterRequest::default(), |_| true).unwrap();
        assert_eq!(chosen.index, 0);
    }

    #[test]
    fn test_software_preference() {
        let request = AdapterRequest { prefer_software: true, ..Default::default() };
        let chosen = select_adapter(&pool(), request, |_| true).unwrap();
        assert_eq!(chosen.kind, AdapterKind::Software);
    }

    #[test]
    fn test_software_adapter_never_chosen_by_default() {
        let adapters = vec![adapter(0, AdapterKind::Software, 0)];
        let err = select_adapter(&adapters, AdapterRequest::default(), |_| true).unwrap_err();
        assert!(matches!(err, RenderError::AdapterNotFound(_)));
    }

    #[test]
    fn test_require_discrete_filters_integrated() {
        let adapters = vec![
            adapter(0, AdapterKind::Integrated, 16384),
            adapter(1, AdapterKind::Discrete, 1024),
        ];
        let request = AdapterRequest { require_discrete: true, ..Default::default() };
        let chosen = select_adapter(&adapters, request, |_| true).unwrap();
        assert_eq!(chosen.index, 1);

        let chosen = select_adapter(&adapters, AdapterRequest::default(), |_| true).unwrap();
        assert_eq!(chosen.index, 0);
    }

    #[test]
    fn test_nothing_passes_probe() {
        let err = select_adapter(&pool(), AdapterRequest::default(), |_| false).unwrap_err();
        assert!(matches!(err, RenderError::AdapterNotFound(_)));
    }
}
