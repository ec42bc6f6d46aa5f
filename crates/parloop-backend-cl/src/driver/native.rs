//! Installed OpenCL runtime bound through `libloading`.
//!
//! One context and one profiling command queue are created per enumerated
//! device at startup. Raw runtime handles are stored as `usize` so the
//! driver satisfies the `Send + Sync` bound of [`ClDriver`].

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use libloading::Library;

use parloop::error::{OffloadError, Result};
use parloop::exec::{DeviceClass, DeviceHandle, DeviceLimits};
use parloop::ir::types::Literal;

use crate::codegen::KernelBundle;

use super::{ClDriver, Handle, LaunchArg};

type ClInt = i32;
type ClUint = u32;
type ClUlong = u64;
type ClBitfield = u64;
type ClPlatformId = *mut c_void;
type ClDeviceId = *mut c_void;
type ClContext = *mut c_void;
type ClQueue = *mut c_void;
type ClProgram = *mut c_void;
type ClKernel = *mut c_void;
type ClMem = *mut c_void;
type ClEvent = *mut c_void;

const CL_SUCCESS: ClInt = 0;
const CL_DEVICE_NOT_FOUND: ClInt = -1;

const CL_DEVICE_TYPE_ALL: ClBitfield = 0xFFFF_FFFF;
const CL_DEVICE_TYPE_GPU: ClBitfield = 1 << 2;
const CL_DEVICE_TYPE_ACCELERATOR: ClBitfield = 1 << 3;

const CL_DEVICE_TYPE: ClUint = 0x1000;
const CL_DEVICE_MAX_WORK_ITEM_DIMENSIONS: ClUint = 0x1003;
const CL_DEVICE_MAX_WORK_GROUP_SIZE: ClUint = 0x1004;
const CL_DEVICE_MAX_WORK_ITEM_SIZES: ClUint = 0x1005;
const CL_DEVICE_GLOBAL_MEM_SIZE: ClUint = 0x101F;
const CL_DEVICE_NAME: ClUint = 0x102B;

const CL_QUEUE_PROFILING_ENABLE: ClBitfield = 1 << 1;
const CL_MEM_READ_WRITE: ClBitfield = 1 << 0;
const CL_PROGRAM_BUILD_LOG: ClUint = 0x1183;
const CL_PROFILING_COMMAND_START: ClUint = 0x1282;
const CL_PROFILING_COMMAND_END: ClUint = 0x1283;
const CL_TRUE: ClUint = 1;

type GetPlatformIdsFn =
    unsafe extern "C" fn(num_entries: ClUint, platforms: *mut ClPlatformId, num: *mut ClUint) -> ClInt;
type GetDeviceIdsFn = unsafe extern "C" fn(
    platform: ClPlatformId,
    device_type: ClBitfield,
    num_entries: ClUint,
    devices: *mut ClDeviceId,
    num: *mut ClUint,
) -> ClInt;
type GetDeviceInfoFn = unsafe extern "C" fn(
    device: ClDeviceId,
    param: ClUint,
    size: usize,
    value: *mut c_void,
    size_ret: *mut usize,
) -> ClInt;
type CreateContextFn = unsafe extern "C" fn(
    properties: *const isize,
    num_devices: ClUint,
    devices: *const ClDeviceId,
    notify: *mut c_void,
    user_data: *mut c_void,
    errcode: *mut ClInt,
) -> ClContext;
type ReleaseContextFn = unsafe extern "C" fn(context: ClContext) -> ClInt;
type CreateCommandQueueFn = unsafe extern "C" fn(
    context: ClContext,
    device: ClDeviceId,
    properties: ClBitfield,
    errcode: *mut ClInt,
) -> ClQueue;
type ReleaseCommandQueueFn = unsafe extern "C" fn(queue: ClQueue) -> ClInt;
type CreateProgramWithSourceFn = unsafe extern "C" fn(
    context: ClContext,
    count: ClUint,
    strings: *const *const i8,
    lengths: *const usize,
    errcode: *mut ClInt,
) -> ClProgram;
type BuildProgramFn = unsafe extern "C" fn(
    program: ClProgram,
    num_devices: ClUint,
    devices: *const ClDeviceId,
    options: *const i8,
    notify: *mut c_void,
    user_data: *mut c_void,
) -> ClInt;
type GetProgramBuildInfoFn = unsafe extern "C" fn(
    program: ClProgram,
    device: ClDeviceId,
    param: ClUint,
    size: usize,
    value: *mut c_void,
    size_ret: *mut usize,
) -> ClInt;
type CreateKernelFn =
    unsafe extern "C" fn(program: ClProgram, name: *const i8, errcode: *mut ClInt) -> ClKernel;
type CreateBufferFn = unsafe extern "C" fn(
    context: ClContext,
    flags: ClBitfield,
    size: usize,
    host_ptr: *mut c_void,
    errcode: *mut ClInt,
) -> ClMem;
type ReleaseMemObjectFn = unsafe extern "C" fn(mem: ClMem) -> ClInt;
type EnqueueWriteBufferFn = unsafe extern "C" fn(
    queue: ClQueue,
    buffer: ClMem,
    blocking: ClUint,
    offset: usize,
    size: usize,
    ptr: *const c_void,
    num_wait: ClUint,
    wait_list: *const ClEvent,
    event: *mut ClEvent,
) -> ClInt;
type EnqueueReadBufferFn = unsafe extern "C" fn(
    queue: ClQueue,
    buffer: ClMem,
    blocking: ClUint,
    offset: usize,
    size: usize,
    ptr: *mut c_void,
    num_wait: ClUint,
    wait_list: *const ClEvent,
    event: *mut ClEvent,
) -> ClInt;
type SetKernelArgFn = unsafe extern "C" fn(
    kernel: ClKernel,
    index: ClUint,
    size: usize,
    value: *const c_void,
) -> ClInt;
type EnqueueNdRangeKernelFn = unsafe extern "C" fn(
    queue: ClQueue,
    kernel: ClKernel,
    work_dim: ClUint,
    global_offset: *const usize,
    global: *const usize,
    local: *const usize,
    num_wait: ClUint,
    wait_list: *const ClEvent,
    event: *mut ClEvent,
) -> ClInt;
type WaitForEventsFn = unsafe extern "C" fn(num: ClUint, events: *const ClEvent) -> ClInt;
type GetEventProfilingInfoFn = unsafe extern "C" fn(
    event: ClEvent,
    param: ClUint,
    size: usize,
    value: *mut c_void,
    size_ret: *mut usize,
) -> ClInt;
type ReleaseEventFn = unsafe extern "C" fn(event: ClEvent) -> ClInt;

struct DriverFns {
    cl_get_platform_ids: GetPlatformIdsFn,
    cl_get_device_ids: GetDeviceIdsFn,
    cl_get_device_info: GetDeviceInfoFn,
    cl_create_context: CreateContextFn,
    cl_release_context: ReleaseContextFn,
    cl_create_command_queue: CreateCommandQueueFn,
    cl_release_command_queue: ReleaseCommandQueueFn,
    cl_create_program_with_source: CreateProgramWithSourceFn,
    cl_build_program: BuildProgramFn,
    cl_get_program_build_info: GetProgramBuildInfoFn,
    cl_create_kernel: CreateKernelFn,
    cl_create_buffer: CreateBufferFn,
    cl_release_mem_object: ReleaseMemObjectFn,
    cl_enqueue_write_buffer: EnqueueWriteBufferFn,
    cl_enqueue_read_buffer: EnqueueReadBufferFn,
    cl_set_kernel_arg: SetKernelArgFn,
    cl_enqueue_nd_range_kernel: EnqueueNdRangeKernelFn,
    cl_wait_for_events: WaitForEventsFn,
    cl_get_event_profiling_info: GetEventProfilingInfoFn,
    cl_release_event: ReleaseEventFn,
}

/// One enumerated device with its own context and profiling queue.
struct NativeDevice {
    id: usize,
    context: usize,
    queue: usize,
    handle: DeviceHandle,
}

#[derive(Default)]
struct Pool {
    next: Handle,
    buffers: HashMap<Handle, usize>,
    kernels: HashMap<Handle, usize>,
}

/// Launch argument after handle resolution.
enum Bound {
    Mem(usize),
    Value(Literal),
}

impl Pool {
    fn fresh(&mut self) -> Handle {
        self.next += 1;
        self.next
    }
}

pub struct NativeDriver {
    _lib: Library,
    fns: DriverFns,
    devices: Vec<NativeDevice>,
    /// Guards handle allocation and lookup only. Device calls run outside
    /// the lock; the executor already serializes work per device.
    pool: Mutex<Pool>,
}

impl Drop for NativeDriver {
    fn drop(&mut self) {
        for device in &self.devices {
            // SAFETY: Queue and context were created by this driver and are
            // released exactly once on drop.
            unsafe {
                let _ = (self.fns.cl_release_command_queue)(device.queue as ClQueue);
                let _ = (self.fns.cl_release_context)(device.context as ClContext);
            }
        }
    }
}

static NATIVE_DRIVER: OnceLock<std::result::Result<Arc<NativeDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver instance. The first call probes the runtime; the
/// outcome is cached either way.
pub fn driver() -> Result<Arc<NativeDriver>> {
    let init = NATIVE_DRIVER.get_or_init(|| match NativeDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(OffloadError::device(format!(
            "OpenCL runtime unavailable: {msg}"
        ))),
    }
}

impl NativeDriver {
    fn new() -> Result<Self> {
        let lib = load_opencl_library()?;
        let fns = DriverFns {
            cl_get_platform_ids: load_symbol(&lib, b"clGetPlatformIDs\0")?,
            cl_get_device_ids: load_symbol(&lib, b"clGetDeviceIDs\0")?,
            cl_get_device_info: load_symbol(&lib, b"clGetDeviceInfo\0")?,
            cl_create_context: load_symbol(&lib, b"clCreateContext\0")?,
            cl_release_context: load_symbol(&lib, b"clReleaseContext\0")?,
            cl_create_command_queue: load_symbol(&lib, b"clCreateCommandQueue\0")?,
            cl_release_command_queue: load_symbol(&lib, b"clReleaseCommandQueue\0")?,
            cl_create_program_with_source: load_symbol(&lib, b"clCreateProgramWithSource\0")?,
            cl_build_program: load_symbol(&lib, b"clBuildProgram\0")?,
            cl_get_program_build_info: load_symbol(&lib, b"clGetProgramBuildInfo\0")?,
            cl_create_kernel: load_symbol(&lib, b"clCreateKernel\0")?,
            cl_create_buffer: load_symbol(&lib, b"clCreateBuffer\0")?,
            cl_release_mem_object: load_symbol(&lib, b"clReleaseMemObject\0")?,
            cl_enqueue_write_buffer: load_symbol(&lib, b"clEnqueueWriteBuffer\0")?,
            cl_enqueue_read_buffer: load_symbol(&lib, b"clEnqueueReadBuffer\0")?,
            cl_set_kernel_arg: load_symbol(&lib, b"clSetKernelArg\0")?,
            cl_enqueue_nd_range_kernel: load_symbol(&lib, b"clEnqueueNDRangeKernel\0")?,
            cl_wait_for_events: load_symbol(&lib, b"clWaitForEvents\0")?,
            cl_get_event_profiling_info: load_symbol(&lib, b"clGetEventProfilingInfo\0")?,
            cl_release_event: load_symbol(&lib, b"clReleaseEvent\0")?,
        };

        let devices = enumerate_devices(&fns)?;
        if devices.is_empty() {
            return Err(OffloadError::device("no usable OpenCL devices"));
        }
        Ok(Self {
            _lib: lib,
            fns,
            devices,
            pool: Mutex::new(Pool::default()),
        })
    }

    fn device(&self, handle: &DeviceHandle) -> Result<&NativeDevice> {
        self.devices.get(handle.index).ok_or_else(|| {
            OffloadError::device(format!("unknown device index {}", handle.index))
        })
    }

    /// Build log of a failed compilation, best effort.
    fn build_log(&self, program: ClProgram, device: ClDeviceId) -> String {
        let mut size: usize = 0;
        // SAFETY: Size query writes only the out parameter; the second call
        // fills a buffer of exactly that size.
        unsafe {
            if (self.fns.cl_get_program_build_info)(
                program,
                device,
                CL_PROGRAM_BUILD_LOG,
                0,
                std::ptr::null_mut(),
                &mut size,
            ) != CL_SUCCESS
                || size == 0
            {
                return "build log unavailable".to_string();
            }
            let mut log = vec![0u8; size];
            if (self.fns.cl_get_program_build_info)(
                program,
                device,
                CL_PROGRAM_BUILD_LOG,
                size,
                log.as_mut_ptr() as *mut c_void,
                std::ptr::null_mut(),
            ) != CL_SUCCESS
            {
                return "build log unavailable".to_string();
            }
            while log.last() == Some(&0) {
                log.pop();
            }
            String::from_utf8_lossy(&log).trim().to_string()
        }
    }
}

impl ClDriver for NativeDriver {
    fn name(&self) -> &str {
        "opencl"
    }

    fn devices(&self) -> Result<Vec<DeviceHandle>> {
        Ok(self.devices.iter().map(|d| d.handle.clone()).collect())
    }

    fn compile(&self, device: &DeviceHandle, bundle: &KernelBundle) -> Result<Handle> {
        let native = self.device(device)?;
        let source = CString::new(bundle.source.as_str())
            .map_err(|_| OffloadError::compilation("kernel source contains a NUL byte"))?;
        let entry = CString::new(bundle.entry.as_str())
            .map_err(|_| OffloadError::compilation("kernel entry name contains a NUL byte"))?;

        let mut err: ClInt = 0;
        let src_ptr = source.as_ptr();
        let src_len = bundle.source.len();
        // SAFETY: Source pointer and length describe a live CString; the
        // context belongs to this driver.
        let program = unsafe {
            (self.fns.cl_create_program_with_source)(
                native.context as ClContext,
                1,
                &src_ptr,
                &src_len,
                &mut err,
            )
        };
        if err != CL_SUCCESS || program.is_null() {
            return Err(OffloadError::compilation(format!(
                "clCreateProgramWithSource failed with code {err}"
            )));
        }

        let dev = native.id as ClDeviceId;
        // SAFETY: Program and device were created by this driver; the
        // options pointer is null for default options.
        let build = unsafe {
            (self.fns.cl_build_program)(
                program,
                1,
                &dev,
                std::ptr::null(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if build != CL_SUCCESS {
            let log = self.build_log(program, dev);
            return Err(OffloadError::compilation(format!(
                "device build of '{}' failed: {log}",
                bundle.entry
            )));
        }

        // SAFETY: The program built successfully and the entry name is the
        // kernel the generator emitted into it.
        let kernel = unsafe { (self.fns.cl_create_kernel)(program, entry.as_ptr(), &mut err) };
        if err != CL_SUCCESS || kernel.is_null() {
            return Err(OffloadError::compilation(format!(
                "clCreateKernel('{}') failed with code {err}",
                bundle.entry
            )));
        }

        // Programs and kernels live until process exit; the executor caches
        // the handle per device and per check configuration.
        let mut pool = self.pool.lock().expect("driver pool lock poisoned");
        let handle = pool.fresh();
        pool.kernels.insert(handle, kernel as usize);
        Ok(handle)
    }

    fn alloc(&self, device: &DeviceHandle, bytes: u64) -> Result<Handle> {
        let native = self.device(device)?;
        let mut err: ClInt = 0;
        // Zero-sized buffers are rejected by the runtime.
        let size = (bytes as usize).max(1);
        // SAFETY: The context belongs to this driver and no host pointer is
        // passed with CL_MEM_READ_WRITE alone.
        let mem = unsafe {
            (self.fns.cl_create_buffer)(
                native.context as ClContext,
                CL_MEM_READ_WRITE,
                size,
                std::ptr::null_mut(),
                &mut err,
            )
        };
        if err != CL_SUCCESS || mem.is_null() {
            return Err(OffloadError::device(format!(
                "clCreateBuffer({bytes}) on '{}' failed with code {err}",
                device.name
            )));
        }
        let mut pool = self.pool.lock().expect("driver pool lock poisoned");
        let handle = pool.fresh();
        pool.buffers.insert(handle, mem as usize);
        Ok(handle)
    }

    fn upload(&self, device: &DeviceHandle, buffer: Handle, bytes: &[u8]) -> Result<()> {
        let native = self.device(device)?;
        let mem = {
            let pool = self.pool.lock().expect("driver pool lock poisoned");
            *pool
                .buffers
                .get(&buffer)
                .ok_or_else(|| OffloadError::device("upload into an unknown buffer handle"))?
        };
        if bytes.is_empty() {
            return Ok(());
        }
        // SAFETY: The buffer was allocated with at least `bytes.len()` bytes
        // and the host slice is valid for the blocking write.
        let code = unsafe {
            (self.fns.cl_enqueue_write_buffer)(
                native.queue as ClQueue,
                mem as ClMem,
                CL_TRUE,
                0,
                bytes.len(),
                bytes.as_ptr() as *const c_void,
                0,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        check_cl(code, "clEnqueueWriteBuffer")
    }

    fn download(&self, device: &DeviceHandle, buffer: Handle, into: &mut [u8]) -> Result<()> {
        let native = self.device(device)?;
        let mem = {
            let pool = self.pool.lock().expect("driver pool lock poisoned");
            *pool
                .buffers
                .get(&buffer)
                .ok_or_else(|| OffloadError::device("download from an unknown buffer handle"))?
        };
        if into.is_empty() {
            return Ok(());
        }
        // SAFETY: The buffer holds at least `into.len()` bytes and the host
        // slice is valid and writable for the blocking read.
        let code = unsafe {
            (self.fns.cl_enqueue_read_buffer)(
                native.queue as ClQueue,
                mem as ClMem,
                CL_TRUE,
                0,
                into.len(),
                into.as_mut_ptr() as *mut c_void,
                0,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        check_cl(code, "clEnqueueReadBuffer")
    }

    fn free(&self, _device: &DeviceHandle, buffer: Handle) {
        let mem = {
            let mut pool = self.pool.lock().expect("driver pool lock poisoned");
            pool.buffers.remove(&buffer)
        };
        if let Some(mem) = mem {
            // SAFETY: The memory object was created by this driver and is
            // released exactly once.
            let _ = unsafe { (self.fns.cl_release_mem_object)(mem as ClMem) };
        }
    }

    fn launch(
        &self,
        device: &DeviceHandle,
        program: Handle,
        args: &[LaunchArg],
        global: &[usize],
        local: &[usize],
    ) -> Result<Duration> {
        if global.iter().any(|&n| n == 0) {
            return Ok(Duration::ZERO);
        }
        let native = self.device(device)?;

        // Resolve every handle first so no device call runs under the lock.
        let (kernel, resolved) = {
            let pool = self.pool.lock().expect("driver pool lock poisoned");
            let kernel = *pool
                .kernels
                .get(&program)
                .ok_or_else(|| OffloadError::device("launch of an uncompiled program handle"))?;
            let mut resolved = Vec::with_capacity(args.len());
            for (index, arg) in args.iter().enumerate() {
                resolved.push(match arg {
                    LaunchArg::Buffer(handle) => {
                        Bound::Mem(*pool.buffers.get(handle).ok_or_else(|| {
                            OffloadError::device(format!(
                                "argument {index} bound to an unknown buffer"
                            ))
                        })?)
                    }
                    LaunchArg::Scalar(lit) => Bound::Value(*lit),
                });
            }
            (kernel, resolved)
        };
        let kernel = kernel as ClKernel;

        for (index, arg) in resolved.iter().enumerate() {
            let index = index as ClUint;
            let code = match arg {
                Bound::Mem(mem) => {
                    let mem = *mem as ClMem;
                    // SAFETY: The argument value is a live cl_mem read by
                    // size within this call.
                    unsafe {
                        (self.fns.cl_set_kernel_arg)(
                            kernel,
                            index,
                            std::mem::size_of::<ClMem>(),
                            &mem as *const ClMem as *const c_void,
                        )
                    }
                }
                // SAFETY: Each scalar is passed by pointer and size matching
                // the parameter type the generator declared.
                Bound::Value(lit) => unsafe {
                    match lit {
                        Literal::I32(v) => (self.fns.cl_set_kernel_arg)(
                            kernel,
                            index,
                            4,
                            v as *const i32 as *const c_void,
                        ),
                        Literal::I64(v) => (self.fns.cl_set_kernel_arg)(
                            kernel,
                            index,
                            8,
                            v as *const i64 as *const c_void,
                        ),
                        Literal::F64(v) => (self.fns.cl_set_kernel_arg)(
                            kernel,
                            index,
                            8,
                            v as *const f64 as *const c_void,
                        ),
                        Literal::Bool(v) => {
                            let byte = u8::from(*v);
                            (self.fns.cl_set_kernel_arg)(
                                kernel,
                                index,
                                1,
                                &byte as *const u8 as *const c_void,
                            )
                        }
                    }
                },
            };
            check_cl(code, "clSetKernelArg")?;
        }

        let local_ptr = if local.is_empty() {
            std::ptr::null()
        } else {
            local.as_ptr()
        };
        let mut event: ClEvent = std::ptr::null_mut();
        // SAFETY: Queue, kernel, and the size arrays outlive the call; the
        // event out pointer is valid.
        let code = unsafe {
            (self.fns.cl_enqueue_nd_range_kernel)(
                native.queue as ClQueue,
                kernel,
                global.len() as ClUint,
                std::ptr::null(),
                global.as_ptr(),
                local_ptr,
                0,
                std::ptr::null(),
                &mut event,
            )
        };
        check_cl(code, "clEnqueueNDRangeKernel")?;

        // SAFETY: The event was returned by the enqueue above and is
        // released exactly once after the wait.
        let elapsed = unsafe {
            let wait = (self.fns.cl_wait_for_events)(1, &event);
            let elapsed = if wait == CL_SUCCESS {
                let mut start: ClUlong = 0;
                let mut end: ClUlong = 0;
                let a = (self.fns.cl_get_event_profiling_info)(
                    event,
                    CL_PROFILING_COMMAND_START,
                    8,
                    &mut start as *mut ClUlong as *mut c_void,
                    std::ptr::null_mut(),
                );
                let b = (self.fns.cl_get_event_profiling_info)(
                    event,
                    CL_PROFILING_COMMAND_END,
                    8,
                    &mut end as *mut ClUlong as *mut c_void,
                    std::ptr::null_mut(),
                );
                if a == CL_SUCCESS && b == CL_SUCCESS && end >= start {
                    Ok(Duration::from_nanos(end - start))
                } else {
                    // Some runtimes withhold profiling data; report a zero
                    // kernel time rather than failing the run.
                    Ok(Duration::ZERO)
                }
            } else {
                Err(OffloadError::device(format!(
                    "clWaitForEvents failed with code {wait}"
                )))
            };
            let _ = (self.fns.cl_release_event)(event);
            elapsed
        };
        elapsed
    }
}

fn enumerate_devices(fns: &DriverFns) -> Result<Vec<NativeDevice>> {
    let mut count: ClUint = 0;
    // SAFETY: Counting call writes only the out parameter.
    check_cl(
        unsafe { (fns.cl_get_platform_ids)(0, std::ptr::null_mut(), &mut count) },
        "clGetPlatformIDs",
    )?;
    let mut platforms: Vec<ClPlatformId> = vec![std::ptr::null_mut(); count as usize];
    if count > 0 {
        // SAFETY: The vector holds exactly `count` entries.
        check_cl(
            unsafe { (fns.cl_get_platform_ids)(count, platforms.as_mut_ptr(), std::ptr::null_mut()) },
            "clGetPlatformIDs",
        )?;
    }

    let mut out = Vec::new();
    for platform in platforms {
        let mut n: ClUint = 0;
        // SAFETY: Counting call writes only the out parameter.
        let code = unsafe {
            (fns.cl_get_device_ids)(
                platform,
                CL_DEVICE_TYPE_ALL,
                0,
                std::ptr::null_mut(),
                &mut n,
            )
        };
        if code == CL_DEVICE_NOT_FOUND || n == 0 {
            continue;
        }
        check_cl(code, "clGetDeviceIDs")?;
        let mut ids: Vec<ClDeviceId> = vec![std::ptr::null_mut(); n as usize];
        // SAFETY: The vector holds exactly `n` entries.
        check_cl(
            unsafe {
                (fns.cl_get_device_ids)(
                    platform,
                    CL_DEVICE_TYPE_ALL,
                    n,
                    ids.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            },
            "clGetDeviceIDs",
        )?;
        for id in ids {
            let index = out.len();
            out.push(open_device(fns, id, index)?);
        }
    }
    Ok(out)
}

fn open_device(fns: &DriverFns, id: ClDeviceId, index: usize) -> Result<NativeDevice> {
    let name = device_name(fns, id)?;
    let class = device_class(fns, id)?;

    let mut group: usize = 0;
    // SAFETY: Each info query writes a value of the documented size to a
    // valid out pointer.
    unsafe {
        check_cl(
            (fns.cl_get_device_info)(
                id,
                CL_DEVICE_MAX_WORK_GROUP_SIZE,
                std::mem::size_of::<usize>(),
                &mut group as *mut usize as *mut c_void,
                std::ptr::null_mut(),
            ),
            "clGetDeviceInfo",
        )?;
    }

    let mut dims: ClUint = 0;
    // SAFETY: See above.
    unsafe {
        check_cl(
            (fns.cl_get_device_info)(
                id,
                CL_DEVICE_MAX_WORK_ITEM_DIMENSIONS,
                std::mem::size_of::<ClUint>(),
                &mut dims as *mut ClUint as *mut c_void,
                std::ptr::null_mut(),
            ),
            "clGetDeviceInfo",
        )?;
    }
    let mut sizes = vec![0usize; dims as usize];
    if dims > 0 {
        // SAFETY: The vector holds `dims` entries of size_t.
        unsafe {
            check_cl(
                (fns.cl_get_device_info)(
                    id,
                    CL_DEVICE_MAX_WORK_ITEM_SIZES,
                    sizes.len() * std::mem::size_of::<usize>(),
                    sizes.as_mut_ptr() as *mut c_void,
                    std::ptr::null_mut(),
                ),
                "clGetDeviceInfo",
            )?;
        }
    }
    let mut max_items = [1usize; 3];
    for (d, size) in sizes.iter().take(3).enumerate() {
        max_items[d] = *size;
    }

    let mut mem: ClUlong = 0;
    // SAFETY: See above.
    unsafe {
        check_cl(
            (fns.cl_get_device_info)(
                id,
                CL_DEVICE_GLOBAL_MEM_SIZE,
                std::mem::size_of::<ClUlong>(),
                &mut mem as *mut ClUlong as *mut c_void,
                std::ptr::null_mut(),
            ),
            "clGetDeviceInfo",
        )?;
    }

    let mut err: ClInt = 0;
    // SAFETY: The device id came from enumeration; the notify callback and
    // user data are null.
    let context = unsafe {
        (fns.cl_create_context)(
            std::ptr::null(),
            1,
            &id,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut err,
        )
    };
    if err != CL_SUCCESS || context.is_null() {
        return Err(OffloadError::device(format!(
            "clCreateContext for '{name}' failed with code {err}"
        )));
    }
    // SAFETY: Context and device are valid; profiling is required for the
    // kernel-time reads at launch.
    let queue = unsafe {
        (fns.cl_create_command_queue)(context, id, CL_QUEUE_PROFILING_ENABLE, &mut err)
    };
    if err != CL_SUCCESS || queue.is_null() {
        // SAFETY: The context was created above and is released on the
        // failure path.
        unsafe {
            let _ = (fns.cl_release_context)(context);
        }
        return Err(OffloadError::device(format!(
            "clCreateCommandQueue for '{name}' failed with code {err}"
        )));
    }

    Ok(NativeDevice {
        id: id as usize,
        context: context as usize,
        queue: queue as usize,
        handle: DeviceHandle {
            index,
            name,
            class,
            limits: DeviceLimits {
                max_work_group_size: group,
                max_work_item_sizes: max_items,
                global_mem_bytes: mem,
            },
        },
    })
}

fn device_name(fns: &DriverFns, id: ClDeviceId) -> Result<String> {
    let mut size: usize = 0;
    // SAFETY: Size query writes only the out parameter; the second call
    // fills a buffer of exactly that size.
    unsafe {
        check_cl(
            (fns.cl_get_device_info)(id, CL_DEVICE_NAME, 0, std::ptr::null_mut(), &mut size),
            "clGetDeviceInfo",
        )?;
        let mut raw = vec![0u8; size];
        check_cl(
            (fns.cl_get_device_info)(
                id,
                CL_DEVICE_NAME,
                size,
                raw.as_mut_ptr() as *mut c_void,
                std::ptr::null_mut(),
            ),
            "clGetDeviceInfo",
        )?;
        while raw.last() == Some(&0) {
            raw.pop();
        }
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

fn device_class(fns: &DriverFns, id: ClDeviceId) -> Result<DeviceClass> {
    let mut ty: ClBitfield = 0;
    // SAFETY: The device type is a bitfield of the documented size.
    unsafe {
        check_cl(
            (fns.cl_get_device_info)(
                id,
                CL_DEVICE_TYPE,
                std::mem::size_of::<ClBitfield>(),
                &mut ty as *mut ClBitfield as *mut c_void,
                std::ptr::null_mut(),
            ),
            "clGetDeviceInfo",
        )?;
    }
    Ok(if ty & CL_DEVICE_TYPE_GPU != 0 {
        DeviceClass::Gpu
    } else if ty & CL_DEVICE_TYPE_ACCELERATOR != 0 {
        DeviceClass::Accelerator
    } else {
        DeviceClass::Cpu
    })
}

fn load_opencl_library() -> Result<Library> {
    let candidates = [
        "libOpenCL.so.1",
        "libOpenCL.so",
        "OpenCL.dll",
        "/System/Library/Frameworks/OpenCL.framework/OpenCL",
    ];

    for candidate in candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this
        // stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(OffloadError::device(
        "failed to load the OpenCL runtime (tried libOpenCL.so.1, libOpenCL.so, OpenCL.dll, the Apple framework)",
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T> {
    // SAFETY: Caller provides the expected symbol type from the OpenCL API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        OffloadError::device(format!(
            "failed to resolve OpenCL symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

fn check_cl(code: ClInt, op: &str) -> Result<()> {
    if code == CL_SUCCESS {
        Ok(())
    } else {
        Err(OffloadError::device(format!(
            "{op} failed with code {code}"
        )))
    }
}
