//! Core and cluster topology.
//!
//! Every core derives its logical coordinates once at start-up from its
//! linear `global_id` and a handful of static constants:
//!
//! ```text
//!   quadrant 0                              quadrant 1
//! +-------------------------------------+ +-------------------------------------+
//! | cluster 0         | cluster 1       | | cluster 2         | cluster 3       |
//! | c0 c1 .. c7 [DM]  | c0 c1 .. c7 [DM]| | c0 c1 .. c7 [DM]  | c0 c1 .. c7 [DM]|
//! +-------------------------------------+ +-------------------------------------+
//! ```
//!
//! The highest-indexed core of each cluster is its data mover (DM); all
//! others are compute cores.
//!
//! # Example
//!
//! ```
//! use snitch_rt::topology::{CoreRole, TopologyConfig};
//!
//! const TOPO: TopologyConfig = TopologyConfig::new(9, 4, 2, 1);
//!
//! let core = TOPO.resolve(17);
//! assert_eq!(core.cluster_id, 1);
//! assert_eq!(core.core_in_cluster, 8);
//! assert_eq!(core.role, CoreRole::DataMover);
//! assert_eq!(core.hartid, 18);
//! ```

use std::fmt;

/// Largest supported cluster: one bit per core in the cluster interrupt registers.
pub const MAX_CORES_PER_CLUSTER: u32 = 32;

/// Static machine shape.
///
/// Construct it in a `const` context so that a malformed shape is rejected
/// at build time; the runtime never re-checks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyConfig {
    /// Cores per cluster, data mover included.
    pub cores_per_cluster: u32,
    /// Clusters sharing one quadrant interconnect.
    pub clusters_per_quadrant: u32,
    /// Number of quadrants.
    pub quadrant_count: u32,
    /// Hart id of global core 0. Harts below this belong to the host.
    pub hartid_base: u32,
}

impl TopologyConfig {
    /// Occamy: 6 quadrants of 4 clusters, 8 compute cores + 1 DM per cluster.
    pub const OCCAMY: Self = Self::new(9, 4, 6, 1);

    /// Create a topology, panicking (at compile time in const contexts) on
    /// a shape the runtime cannot represent.
    pub const fn new(
        cores_per_cluster: u32,
        clusters_per_quadrant: u32,
        quadrant_count: u32,
        hartid_base: u32,
    ) -> Self {
        assert!(cores_per_cluster >= 2, "a cluster needs a compute core and a DM core");
        assert!(cores_per_cluster <= MAX_CORES_PER_CLUSTER, "cluster interrupt mask is 32 bits");
        assert!(clusters_per_quadrant >= 1, "empty quadrant");
        assert!(quadrant_count >= 1, "no quadrants");
        Self {
            cores_per_cluster,
            clusters_per_quadrant,
            quadrant_count,
            hartid_base,
        }
    }

    /// Total number of clusters.
    #[inline]
    pub const fn cluster_count(&self) -> u32 {
        self.clusters_per_quadrant * self.quadrant_count
    }

    /// Total number of cores across all clusters.
    #[inline]
    pub const fn core_count(&self) -> u32 {
        self.cores_per_cluster * self.cluster_count()
    }

    /// Compute cores per cluster (everything but the DM core).
    #[inline]
    pub const fn compute_cores_per_cluster(&self) -> u32 {
        self.cores_per_cluster - 1
    }

    /// Cluster-local index of the DM core.
    #[inline]
    pub const fn dm_core_index(&self) -> u32 {
        self.cores_per_cluster - 1
    }

    /// Hart id of a global core.
    #[inline]
    pub const fn hartid(&self, global_id: u32) -> u32 {
        self.hartid_base + global_id
    }

    /// Hart id of core 0 of a cluster.
    #[inline]
    pub const fn cluster_base_hartid(&self, cluster_id: u32) -> u32 {
        self.hartid_base + cluster_id * self.cores_per_cluster
    }

    /// Global id of a cluster's DM core.
    #[inline]
    pub const fn dm_global_id(&self, cluster_id: u32) -> u32 {
        cluster_id * self.cores_per_cluster + self.dm_core_index()
    }

    /// Map a hart id back to its global core id. `None` for host harts.
    pub fn global_id_of_hart(&self, hartid: u32) -> Option<u32> {
        let id = hartid.checked_sub(self.hartid_base)?;
        (id < self.core_count()).then_some(id)
    }

    /// Derive a core's identity from its global id.
    pub fn resolve(&self, global_id: u32) -> CoreIdentity {
        debug_assert!(
            global_id < self.core_count(),
            "core {} outside a {}-core machine",
            global_id,
            self.core_count()
        );
        let cluster_id = global_id / self.cores_per_cluster;
        let core_in_cluster = global_id % self.cores_per_cluster;
        let role = if core_in_cluster == self.dm_core_index() {
            CoreRole::DataMover
        } else {
            CoreRole::Compute
        };

        CoreIdentity {
            global_id,
            cluster_id,
            quadrant_id: cluster_id / self.clusters_per_quadrant,
            core_in_cluster,
            role,
            hartid: self.hartid(global_id),
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self::OCCAMY
    }
}

/// What a core is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreRole {
    /// Runs kernels.
    Compute,
    /// Issues DMA transfers and represents its cluster in cross-cluster sync.
    DataMover,
}

/// A core's position in the machine. Computed once, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreIdentity {
    pub global_id: u32,
    pub cluster_id: u32,
    pub quadrant_id: u32,
    pub core_in_cluster: u32,
    pub role: CoreRole,
    pub hartid: u32,
}

impl CoreIdentity {
    #[inline]
    pub fn is_dm(&self) -> bool {
        self.role == CoreRole::DataMover
    }

    #[inline]
    pub fn is_compute(&self) -> bool {
        self.role == CoreRole::Compute
    }

    /// Bit for this core in cluster-local interrupt masks.
    #[inline]
    pub fn cluster_mask(&self) -> u32 {
        1 << self.core_in_cluster
    }
}

impl fmt::Display for CoreIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            CoreRole::Compute => "compute",
            CoreRole::DataMover => "dm",
        };
        write!(
            f,
            "core {} (q{} c{}.{} {} hart {})",
            self.global_id, self.quadrant_id, self.cluster_id, self.core_in_cluster, role, self.hartid
        )
    }
}

/// Resolve against the Occamy topology.
pub fn resolve(global_id: u32) -> CoreIdentity {
    TopologyConfig::OCCAMY.resolve(global_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: TopologyConfig = TopologyConfig::new(4, 2, 2, 1);

    #[test]
    fn test_counts() {
        assert_eq!(SMALL.cluster_count(), 4);
        assert_eq!(SMALL.core_count(), 16);
        assert_eq!(SMALL.compute_cores_per_cluster(), 3);
        assert_eq!(TopologyConfig::OCCAMY.core_count(), 216);
    }

    #[test]
    fn test_resolve_compute_core() {
        let core = SMALL.resolve(5);
        assert_eq!(core.cluster_id, 1);
        assert_eq!(core.quadrant_id, 0);
        assert_eq!(core.core_in_cluster, 1);
        assert_eq!(core.role, CoreRole::Compute);
        assert_eq!(core.hartid, 6);
    }

    #[test]
    fn test_one_dm_per_cluster_at_highest_index() {
        for cluster in 0..SMALL.cluster_count() {
            let dms: Vec<_> = (0..SMALL.cores_per_cluster)
                .map(|i| SMALL.resolve(cluster * SMALL.cores_per_cluster + i))
                .filter(|c| c.is_dm())
                .collect();
            assert_eq!(dms.len(), 1);
            assert_eq!(dms[0].core_in_cluster, SMALL.dm_core_index());
            assert_eq!(dms[0].global_id, SMALL.dm_global_id(cluster));
        }
    }

    #[test]
    fn test_quadrant_assignment() {
        assert_eq!(SMALL.resolve(7).quadrant_id, 0);
        assert_eq!(SMALL.resolve(8).quadrant_id, 1);
        assert_eq!(SMALL.resolve(15).quadrant_id, 1);
    }

    #[test]
    fn test_hart_mapping() {
        assert_eq!(SMALL.global_id_of_hart(0), None);
        assert_eq!(SMALL.global_id_of_hart(1), Some(0));
        assert_eq!(SMALL.global_id_of_hart(16), Some(15));
        assert_eq!(SMALL.global_id_of_hart(17), None);
        assert_eq!(SMALL.cluster_base_hartid(2), 9);
    }

    #[test]
    fn test_resolve_is_pure() {
        assert_eq!(resolve(100), resolve(100));
        assert_eq!(resolve(8).role, CoreRole::DataMover);
    }
}
