//! Per-CPU state: one scheduler and one clock for every CPU.
//!
//! CPUs share nothing. A context is bound to the CPU it was created on and
//! only that CPU's scheduler ever sees its share.

use crate::scheduler::{CpuScheduler, SchedulerConfig};
use crate::timer::SimTimer;
use core_types::CpuId;
use kernel_api::{KernelConfig, KernelError};

/// State owned by one CPU
#[derive(Debug)]
pub struct Cpu {
    id: CpuId,
    pub(crate) scheduler: CpuScheduler,
    pub(crate) timer: SimTimer,
}

impl Cpu {
    fn new(id: CpuId, config: SchedulerConfig) -> Self {
        Self {
            id,
            scheduler: CpuScheduler::new(config),
            timer: SimTimer::new(),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn scheduler(&self) -> &CpuScheduler {
        &self.scheduler
    }

    pub fn timer(&self) -> &SimTimer {
        &self.timer
    }
}

/// All CPUs of the machine
#[derive(Debug)]
pub struct CpuPool {
    cpus: Vec<Cpu>,
}

impl CpuPool {
    pub fn new(config: &KernelConfig) -> Self {
        let scheduler = SchedulerConfig::from(config);
        Self {
            cpus: (0..config.cpus)
                .map(|index| Cpu::new(CpuId(index), scheduler.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn get(&self, id: CpuId) -> Result<&Cpu, KernelError> {
        self.cpus.get(id.0).ok_or(KernelError::UnknownCpu(id))
    }

    pub fn get_mut(&mut self, id: CpuId) -> Result<&mut Cpu, KernelError> {
        self.cpus.get_mut(id.0).ok_or(KernelError::UnknownCpu(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.iter()
    }
}
