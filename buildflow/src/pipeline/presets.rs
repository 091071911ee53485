//! Built-in stage presets.

use super::definition::{ResourceCost, StageDefinition};

/// The default eight-stage Linux From Scratch build.
///
/// Each stage depends on the previous one. Stages that touch the host
/// system or the chroot require elevation.
#[must_use]
pub fn lfs_default() -> Vec<StageDefinition> {
    vec![
        StageDefinition::new("prepare_host", "bash scripts/prepare_host.sh")
            .with_order(1)
            .with_rollback("bash scripts/cleanup_host.sh")
            .elevated(),
        StageDefinition::new("create_partition", "bash scripts/create_partition.sh")
            .with_order(2)
            .with_dependency("prepare_host")
            .with_rollback("bash scripts/remove_partition.sh")
            .elevated(),
        StageDefinition::new("download_sources", "bash scripts/download_sources.sh")
            .with_order(3)
            .with_dependency("create_partition")
            .with_rollback("rm -rf /mnt/lfs/sources/*"),
        StageDefinition::new("build_toolchain", "bash scripts/build_toolchain.sh")
            .with_order(4)
            .with_dependency("download_sources")
            .with_rollback("rm -rf /mnt/lfs/tools/*")
            .with_resources(ResourceCost::memory(2048).with_cpu_cores(4)),
        StageDefinition::new("build_system", "bash scripts/build_system.sh")
            .with_order(5)
            .with_dependency("build_toolchain")
            .with_rollback("bash scripts/cleanup_system.sh")
            .with_resources(ResourceCost::memory(4096).with_cpu_cores(4))
            .elevated(),
        StageDefinition::new("configure_system", "bash scripts/configure_system.sh")
            .with_order(6)
            .with_dependency("build_system")
            .with_rollback("bash scripts/reset_config.sh")
            .elevated(),
        StageDefinition::new("build_kernel", "bash scripts/build_kernel.sh")
            .with_order(7)
            .with_dependency("configure_system")
            .with_rollback("rm -rf /mnt/lfs/boot/*")
            .with_resources(ResourceCost::memory(2048).with_cpu_cores(4))
            .elevated(),
        StageDefinition::new("finalize_system", "bash scripts/finalize_system.sh")
            .with_order(8)
            .with_dependency("build_kernel")
            .with_rollback("bash scripts/cleanup_final.sh")
            .elevated(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageGraph;

    #[test]
    fn test_lfs_default_loads() {
        let graph = StageGraph::load(lfs_default()).unwrap();
        assert_eq!(graph.len(), 8);
        assert_eq!(graph.topological_order()[0], "prepare_host");
        assert_eq!(graph.topological_order()[7], "finalize_system");
    }

    #[test]
    fn test_every_stage_has_rollback() {
        assert!(lfs_default().iter().all(StageDefinition::has_rollback));
    }
}
