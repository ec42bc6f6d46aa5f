pub mod backend;
pub mod device;
pub mod registry;

pub use backend::{BaselineExecutor, CheckConfig, LaunchReport, OffloadBackend, Outcome, PreparedKernel};
pub use device::{DeviceClass, DeviceHandle, DeviceLimits, ScheduleSide};
