//! Device access behind one narrow trait.
//!
//! Two drivers exist: [`native::NativeDriver`] binds the installed OpenCL
//! runtime through `libloading`, and [`sim::SimDriver`] interprets lowered
//! kernels on deterministic fake devices. The executor and the data broker
//! are written against the trait, so staging, launch, and readback take
//! the same path on both.

pub mod native;
pub mod sim;

use std::time::Duration;

use parloop::error::Result;
use parloop::exec::DeviceHandle;
use parloop::ir::types::Literal;

use crate::codegen::KernelBundle;

/// Driver-local handle to a compiled program or a device buffer.
pub type Handle = u64;

/// One launch argument, bound in kernel parameter order.
#[derive(Debug, Clone)]
pub enum LaunchArg {
    Buffer(Handle),
    Scalar(Literal),
}

pub trait ClDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Usable devices, in a stable order. Index positions are the
    /// `DeviceHandle::index` values the other calls expect.
    fn devices(&self) -> Result<Vec<DeviceHandle>>;

    /// Build one translation unit for one device. Compiled programs live
    /// until process exit; the executor caches handles per device.
    fn compile(&self, device: &DeviceHandle, bundle: &KernelBundle) -> Result<Handle>;

    fn alloc(&self, device: &DeviceHandle, bytes: u64) -> Result<Handle>;

    fn upload(&self, device: &DeviceHandle, buffer: Handle, bytes: &[u8]) -> Result<()>;

    fn download(&self, device: &DeviceHandle, buffer: Handle, into: &mut [u8]) -> Result<()>;

    fn free(&self, device: &DeviceHandle, buffer: Handle);

    /// Run one NDRange and block until it finishes. Returns the
    /// device-reported kernel execution time.
    fn launch(
        &self,
        device: &DeviceHandle,
        program: Handle,
        args: &[LaunchArg],
        global: &[usize],
        local: &[usize],
    ) -> Result<Duration>;
}
