use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Placement of one named pool inside an instance's port block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    /// Offset from the instance's base port.
    pub offset: u16,
    /// Number of consecutive candidate ports.
    #[serde(default = "default_pool_size")]
    pub size: u16,
}

impl PoolSpec {
    pub const fn new(offset: u16, size: u16) -> Self {
        Self { offset, size }
    }
}

fn default_pool_size() -> u16 {
    3
}

fn default_base_port() -> u16 {
    6000
}

fn default_stride() -> u16 {
    100
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_probe_timeout() -> Duration {
    Duration::from_secs(1)
}

/// Default per-service offset table.
pub fn default_pool_table() -> BTreeMap<String, PoolSpec> {
    [
        ("primary", PoolSpec::new(0, 3)),
        ("websocket", PoolSpec::new(10, 3)),
        ("speech", PoolSpec::new(20, 3)),
        ("synthesis", PoolSpec::new(30, 3)),
        ("llm", PoolSpec::new(40, 3)),
        ("health", PoolSpec::new(90, 3)),
    ]
    .into_iter()
    .map(|(name, spec)| (name.to_string(), spec))
    .collect()
}

/// How instance numbers map onto port blocks.
///
/// Instance `N` owns the block starting at `base_port + stride * (N - 1)`;
/// each pool sits at a fixed offset inside that block. Callers only ever
/// need the instance number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortLayout {
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    #[serde(default = "default_stride")]
    pub stride: u16,

    /// Address used for bind probes (the wildcard address is always probed too).
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    #[serde(default = "default_bind_probe_timeout", with = "crate::config::duration_str")]
    pub bind_probe_timeout: Duration,

    #[serde(default = "default_pool_table")]
    pub pools: BTreeMap<String, PoolSpec>,
}

impl Default for PortLayout {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            stride: default_stride(),
            bind_host: default_bind_host(),
            bind_probe_timeout: default_bind_probe_timeout(),
            pools: default_pool_table(),
        }
    }
}

impl PortLayout {
    /// First port of instance `n`'s block.
    pub fn base_for(&self, instance_number: u32) -> u32 {
        self.base_port as u32 + self.stride as u32 * instance_number.saturating_sub(1)
    }

    /// Check that pools fit their block, do not overlap, and stay below 65536
    /// for every instance number up to `max_instances`.
    pub fn validate(&self, max_instances: u32) -> Result<()> {
        if self.base_port == 0 {
            return Err(Error::Validation("ports.base_port must be non-zero".to_string()));
        }
        if self.stride == 0 {
            return Err(Error::Validation("ports.stride must be non-zero".to_string()));
        }
        if self.pools.is_empty() {
            return Err(Error::Validation("ports.pools must declare at least one pool".to_string()));
        }

        let mut ranges: Vec<(&str, u16, u16)> = Vec::new();
        for (name, spec) in &self.pools {
            if spec.size == 0 {
                return Err(Error::Validation(format!("pool '{}' has size 0", name)));
            }
            let end = spec.offset as u32 + spec.size as u32;
            if end > self.stride as u32 {
                return Err(Error::Validation(format!(
                    "pool '{}' (offset {}, size {}) does not fit inside the per-instance stride of {}",
                    name, spec.offset, spec.size, self.stride
                )));
            }
            ranges.push((name, spec.offset, end as u16));
        }

        ranges.sort_by_key(|(_, start, _)| *start);
        for pair in ranges.windows(2) {
            let (a, _, a_end) = pair[0];
            let (b, b_start, _) = pair[1];
            if b_start < a_end {
                return Err(Error::Validation(format!(
                    "pools '{}' and '{}' overlap",
                    a, b
                )));
            }
        }

        let highest = self.base_for(max_instances) + self.stride as u32 - 1;
        if highest > u16::MAX as u32 {
            return Err(Error::Validation(format!(
                "instance {} would need port {}, above 65535",
                max_instances, highest
            )));
        }
        Ok(())
    }
}

/// Every named pool for one instance number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortPools {
    pub instance_number: u32,
    pub base_port: u16,
    pub pools: BTreeMap<String, Vec<u16>>,
}

impl PortPools {
    pub fn get(&self, name: &str) -> Option<&[u16]> {
        self.pools.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// Every candidate port across all pools.
    pub fn all_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.pools.values().flatten().copied().collect();
        ports.sort_unstable();
        ports
    }
}

/// Deterministically derive the pools for `instance_number`.
///
/// Instance numbers are 1-based; 0 is rejected. Pure function of the layout
/// and the number: concurrent instances never negotiate ports at runtime.
/// The layout must have passed [`PortLayout::validate`] for this number.
pub fn calculate_port_pools(layout: &PortLayout, instance_number: u32) -> Result<PortPools> {
    if instance_number == 0 {
        return Err(Error::Validation(
            "instance numbers start at 1; instance 0 has no port block".to_string(),
        ));
    }
    let base = layout.base_for(instance_number);
    let pools = layout
        .pools
        .iter()
        .map(|(name, spec)| {
            let start = base + spec.offset as u32;
            let ports = (0..spec.size as u32)
                .map(|i| (start + i).min(u16::MAX as u32) as u16)
                .collect();
            (name.clone(), ports)
        })
        .collect();

    Ok(PortPools {
        instance_number,
        base_port: base.min(u16::MAX as u32) as u16,
        pools,
    })
}
