use serde::{Deserialize, Serialize};

/// Broad device category. Adaptive selection arbitrates between the GPU
/// and CPU sides; accelerators compete on the GPU side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Gpu,
    Cpu,
    Accelerator,
}

impl DeviceClass {
    pub fn label(self) -> &'static str {
        match self {
            DeviceClass::Gpu => "gpu",
            DeviceClass::Cpu => "cpu",
            DeviceClass::Accelerator => "accelerator",
        }
    }

    /// Side of the two-way schedule this class competes on.
    pub fn schedule_side(self) -> ScheduleSide {
        match self {
            DeviceClass::Gpu | DeviceClass::Accelerator => ScheduleSide::Gpu,
            DeviceClass::Cpu => ScheduleSide::Cpu,
        }
    }
}

/// The two competitors of adaptive selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleSide {
    Gpu,
    Cpu,
}

impl ScheduleSide {
    pub fn label(self) -> &'static str {
        match self {
            ScheduleSide::Gpu => "gpu",
            ScheduleSide::Cpu => "cpu",
        }
    }

    pub fn other(self) -> ScheduleSide {
        match self {
            ScheduleSide::Gpu => ScheduleSide::Cpu,
            ScheduleSide::Cpu => ScheduleSide::Gpu,
        }
    }
}

/// Launch limits the geometry solver must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub max_work_group_size: usize,
    /// Per-dimension work-item ceiling, one entry per supported dimension.
    pub max_work_item_sizes: [usize; 3],
    pub global_mem_bytes: u64,
}

/// One usable compute device as enumerated by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Backend-local ordinal, stable for the process lifetime.
    pub index: usize,
    pub name: String,
    pub class: DeviceClass,
    pub limits: DeviceLimits,
}

impl DeviceHandle {
    /// Stable identity string used in telemetry and shrink-ceiling keys.
    pub fn identity(&self) -> String {
        format!("{}#{}", self.name, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accelerators_compete_on_the_gpu_side() {
        assert_eq!(DeviceClass::Accelerator.schedule_side(), ScheduleSide::Gpu);
        assert_eq!(DeviceClass::Cpu.schedule_side(), ScheduleSide::Cpu);
        assert_eq!(ScheduleSide::Gpu.other(), ScheduleSide::Cpu);
    }
}
