//! OpenCL offload backend.
//!
//! Turns analyzed plans into OpenCL C, stages bound arrays onto a device,
//! and runs the generated kernels behind the [`parloop`] backend traits.
//! Two drivers sit under one backend type: the native driver binds the
//! installed OpenCL runtime, and the simulator interprets lowered kernels
//! on deterministic fake devices so the full offload path is testable on
//! machines without a GPU.

pub mod codegen;
pub mod driver;
pub mod runtime;

use std::sync::Arc;

use parloop::analysis::OffloadPlan;
use parloop::config::TuningConfig;
use parloop::error::{OffloadError, Result};
use parloop::exec::registry::{register_backend, BACKEND_REGISTRARS};
use parloop::exec::{DeviceHandle, OffloadBackend, PreparedKernel};
use parloop::ir::program::Program;

use crate::driver::sim::SimDriver;
use crate::driver::ClDriver;
use crate::runtime::broker::DataBroker;
use crate::runtime::exec::{compile_guard, ClKernel, DeviceLocks};
use crate::runtime::geometry::GeometryCache;

/// One driver with its residency, geometry, and lock state. Instances are
/// long lived; the registry constructs one per name and shares it.
pub struct ClBackend {
    name: &'static str,
    driver: Arc<dyn ClDriver>,
    devices: Vec<DeviceHandle>,
    broker: Arc<DataBroker>,
    geometry: Arc<GeometryCache>,
    locks: Arc<DeviceLocks>,
}

impl ClBackend {
    pub fn with_driver(
        name: &'static str,
        driver: Arc<dyn ClDriver>,
        config: &TuningConfig,
    ) -> Result<ClBackend> {
        let devices = driver.devices()?;
        if devices.is_empty() {
            return Err(OffloadError::device(format!(
                "driver '{}' enumerates no devices",
                driver.name()
            )));
        }
        Ok(ClBackend {
            name,
            locks: Arc::new(DeviceLocks::for_devices(&devices)),
            broker: Arc::new(DataBroker::new(Arc::clone(&driver), config.memory_portion)),
            geometry: Arc::new(GeometryCache::new()),
            devices,
            driver,
        })
    }

    /// Backend over the installed OpenCL runtime.
    pub fn native(config: &TuningConfig) -> Result<ClBackend> {
        let driver: Arc<dyn ClDriver> = driver::native::driver()?;
        ClBackend::with_driver("opencl", driver, config)
    }

    /// Backend over the deterministic simulator devices.
    pub fn sim(config: &TuningConfig) -> Result<ClBackend> {
        ClBackend::with_driver("sim", Arc::new(SimDriver::new()), config)
    }
}

impl OffloadBackend for ClBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn devices(&self) -> Vec<DeviceHandle> {
        self.devices.clone()
    }

    fn prepare(
        &self,
        program: &Program,
        plan: &OffloadPlan,
        checks: &parloop::exec::CheckConfig,
        config: &TuningConfig,
    ) -> Result<Arc<dyn PreparedKernel>> {
        let bundle = {
            let _gate = compile_guard();
            codegen::generate(program, plan, checks)?
        };
        Ok(Arc::new(ClKernel::new(
            bundle,
            Arc::clone(&self.driver),
            Arc::clone(&self.broker),
            Arc::clone(&self.geometry),
            Arc::clone(&self.locks),
            config,
        )))
    }
}

/// A simulator backend with private state, for tests that must not share
/// residency or shrink ceilings with other call-sites.
pub fn fresh_sim_backend(config: &TuningConfig) -> Result<Arc<dyn OffloadBackend>> {
    Ok(Arc::new(ClBackend::sim(config)?))
}

pub fn register_opencl_backend() {
    register_backend("opencl", || {
        let backend = ClBackend::native(TuningConfig::global())?;
        Ok(Arc::new(backend) as Arc<dyn OffloadBackend>)
    });
}

pub fn register_sim_backend() {
    register_backend("sim", || {
        let backend = ClBackend::sim(TuningConfig::global())?;
        Ok(Arc::new(backend) as Arc<dyn OffloadBackend>)
    });
}

#[parloop::linkme::distributed_slice(BACKEND_REGISTRARS)]
static REGISTER_OPENCL_BACKEND: fn() = register_opencl_backend;

#[parloop::linkme::distributed_slice(BACKEND_REGISTRARS)]
static REGISTER_SIM_BACKEND: fn() = register_sim_backend;

#[cfg(test)]
mod tests {
    use super::*;
    use parloop::analysis::build_plan;
    use parloop::exec::{CheckConfig, DeviceClass};
    use parloop::ir::program::{Expr, LoopLevel, Stmt};
    use parloop::ir::types::{Literal, ScalarType};
    use parloop::options::LoopOptions;
    use parloop::symbols::{ArrayData, ArrayRef, Bindings, SymbolTable};

    fn doubler() -> (Program, Bindings) {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .array("v", ScalarType::F64, 1);
        let program = Program::loop_nest(
            "double",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "v".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::mul(Expr::f64(2.0), Expr::load("v", vec![Expr::scalar("i")])),
            }],
        );
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings
            .set_array("v", ArrayRef::new(ArrayData::from_f64(vec![1.0; 4])))
            .unwrap();
        (program, bindings)
    }

    #[test]
    fn sim_backend_exposes_both_device_classes() {
        let backend = ClBackend::sim(&TuningConfig::default()).unwrap();
        let devices = backend.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].class, DeviceClass::Gpu);
        assert_eq!(devices[1].class, DeviceClass::Cpu);
        assert_eq!(backend.name(), "sim");
    }

    #[test]
    fn prepare_yields_an_executable_kernel() {
        let backend = ClBackend::sim(&TuningConfig::default()).unwrap();
        let (program, bindings) = doubler();
        let plan = build_plan(&program, &bindings, &LoopOptions::default()).unwrap();
        let kernel = backend
            .prepare(&program, &plan, &CheckConfig::None, &TuningConfig::default())
            .unwrap();
        assert!(kernel.entry().starts_with("pl_"));
        assert!(kernel.source().contains(kernel.entry()));
    }

    #[test]
    fn registrars_cover_both_platforms() {
        parloop::exec::registry::ensure_registered();
        assert!(parloop::exec::registry::has_backend("sim"));
        assert!(parloop::exec::registry::has_backend("opencl"));
    }
}
