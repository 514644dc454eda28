//! Instance numbering and deterministic port pool derivation.

mod manager;
mod pools;

pub use manager::{generate_instance_id, InstanceConfig, InstanceManager, InstanceRecord};
pub use pools::{calculate_port_pools, default_pool_table, PoolSpec, PortLayout, PortPools};
