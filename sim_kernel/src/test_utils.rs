//! Test utilities
//!
//! Fixtures shared by unit tests, the integration tests in `tests/` and the
//! substrate contract suite.

use crate::SimulatedKernel;
use core_types::{ContextId, CpuId, PdId, Priority};
use kernel_api::{KernelConfig, ThreadDescriptor};
use tracing_subscriber::EnvFilter;

/// Installs a log subscriber that writes through the test harness
///
/// Filtered by `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two CPUs, four priority levels, audit trail on
pub fn test_config() -> KernelConfig {
    KernelConfig {
        cpus: 2,
        scheduler_audit: true,
        ..KernelConfig::default()
    }
}

pub fn test_kernel() -> SimulatedKernel {
    init_tracing();
    match SimulatedKernel::new(test_config()) {
        Ok(kernel) => kernel,
        Err(err) => panic!("test configuration rejected: {err}"),
    }
}

/// Creates and starts a context on CPU 0
pub fn spawn_started(
    kernel: &mut SimulatedKernel,
    pd: PdId,
    name: &str,
    priority: Priority,
    quota: u64,
) -> ContextId {
    spawn_started_on(kernel, pd, name, CpuId(0), priority, quota)
}

pub fn spawn_started_on(
    kernel: &mut SimulatedKernel,
    pd: PdId,
    name: &str,
    cpu: CpuId,
    priority: Priority,
    quota: u64,
) -> ContextId {
    let descriptor = ThreadDescriptor::new(name, pd)
        .with_cpu(cpu)
        .with_priority(priority)
        .with_quota(quota);
    let ctx = match kernel.create_thread(descriptor) {
        Ok(ctx) => ctx,
        Err(err) => panic!("cannot create {name}: {err}"),
    };
    if let Err(err) = kernel.start_thread(ctx) {
        panic!("cannot start {name}: {err}");
    }
    ctx
}
