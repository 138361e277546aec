//! CUDA driver context: allocation, copies, linking and launches.

#[cfg(feature = "cuda")]
use std::sync::{Arc, OnceLock};

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice, CudaSlice, LaunchAsync, LaunchConfig};
#[cfg(feature = "cuda")]
use cudarc::nvrtc::Ptx;
#[cfg(feature = "cuda")]
use log::{debug, info};

use crate::error::{Error, Result};
#[cfg(feature = "cuda")]
use crate::eval::KERNEL_NAME;

/// Launch geometry of every kernel. The grid-stride loop in the
/// emitted code covers any element count with this fixed shape.
#[cfg(feature = "cuda")]
const GRID_BLOCKS: u32 = 32;
#[cfg(feature = "cuda")]
const BLOCK_THREADS: u32 = 128;

#[cfg(feature = "cuda")]
static CUDA_CONTEXT: OnceLock<CudaContext> = OnceLock::new();

/// Process-wide handle to the CUDA device.
///
/// Created once by [`CudaContext::init`]; all launches target the
/// default stream of this device and run synchronously.
pub struct CudaContext {
    #[cfg(feature = "cuda")]
    device: Arc<CudaDevice>,
}

#[cfg(feature = "cuda")]
impl CudaContext {
    /// Initializes the context on the given device ordinal. Calling it
    /// again after a successful initialization is a no-op.
    pub fn init(device_id: usize) -> Result<()> {
        if CUDA_CONTEXT.get().is_some() {
            return Ok(());
        }
        let device = CudaDevice::new(device_id).map_err(|e| {
            Error::Driver(format!("initialization of device {device_id} failed: {e}"))
        })?;
        info!("cuda: using device {device_id}");
        let _ = CUDA_CONTEXT.set(CudaContext { device });
        Ok(())
    }

    /// Returns the process-wide context.
    pub fn get() -> Result<&'static CudaContext> {
        CUDA_CONTEXT.get().ok_or_else(|| {
            Error::Driver("CUDA context not initialized, call init() first".to_string())
        })
    }

    /// True once [`CudaContext::init`] has succeeded.
    pub fn is_initialized() -> bool {
        CUDA_CONTEXT.get().is_some()
    }

    /// Allocates `bytes` of zero-initialized device memory and returns
    /// its raw address.
    pub fn alloc(&self, bytes: usize) -> Result<u64> {
        if bytes == 0 {
            return Err(Error::internal("alloc: zero-size device allocation"));
        }
        let slice = self
            .device
            .alloc_zeros::<u8>(bytes)
            .map_err(|e| Error::Driver(format!("allocation of {bytes} bytes failed: {e}")))?;
        Ok(slice.leak() as u64)
    }

    /// Releases a device allocation obtained from [`CudaContext::alloc`].
    pub fn free(&self, ptr: u64, bytes: usize) -> Result<()> {
        debug!("cuda: releasing {bytes} bytes at {ptr:#x}");
        let slice = unsafe { self.device.upgrade_device_ptr::<u8>(ptr, bytes) };
        drop(slice);
        Ok(())
    }

    /// Synchronous host-to-device copy into an existing allocation.
    pub fn copy_to_device(&self, ptr: u64, data: &[u8]) -> Result<()> {
        let mut slice = unsafe { self.device.upgrade_device_ptr::<u8>(ptr, data.len()) };
        let result = self.device.htod_sync_copy_into(data, &mut slice);
        slice.leak();
        result.map_err(|e| Error::Driver(format!("host-to-device copy failed: {e}")))
    }

    /// Synchronous device-to-host copy; `ptr` may point anywhere inside
    /// an allocation.
    pub fn copy_to_host(&self, out: &mut [u8], ptr: u64) -> Result<()> {
        let slice = unsafe { self.device.upgrade_device_ptr::<u8>(ptr, out.len()) };
        let result = self.device.dtoh_sync_copy_into(&slice, out);
        slice.leak();
        result.map_err(|e| Error::Driver(format!("device-to-host copy failed: {e}")))
    }

    /// Links one PTX module through the driver, uploads the argument
    /// table and launches the kernel synchronously.
    pub fn launch_kernel(
        &self,
        ptx: &str,
        module: &str,
        args: &[u64],
        size: u32,
    ) -> Result<()> {
        // cudarc wants module and function names with static lifetime.
        let module_name: &'static str = Box::leak(module.to_string().into_boxed_str());
        self.device
            .load_ptx(Ptx::from_src(ptx), module_name, &[KERNEL_NAME])
            .map_err(|e| Error::Driver(format!("linking {module_name} failed: {e}")))?;
        let func = self.device.get_func(module_name, KERNEL_NAME).ok_or_else(|| {
            Error::Driver(format!("entry point {KERNEL_NAME} missing from {module_name}"))
        })?;

        let table: CudaSlice<u64> = self
            .device
            .htod_sync_copy(args)
            .map_err(|e| Error::Driver(format!("argument table upload failed: {e}")))?;

        let config = LaunchConfig {
            grid_dim: (GRID_BLOCKS, 1, 1),
            block_dim: (BLOCK_THREADS, 1, 1),
            shared_mem_bytes: 0,
        };
        unsafe { func.launch(config, (&table, size)) }
            .map_err(|e| Error::Driver(format!("launch of {module_name} failed: {e}")))?;

        self.device
            .synchronize()
            .map_err(|e| Error::Driver(format!("synchronization failed: {e}")))
        // The argument table drops here, after the launch completed.
    }
}

#[cfg(not(feature = "cuda"))]
impl CudaContext {
    /// Stub: the crate was built without the `cuda` feature.
    pub fn init(_device_id: usize) -> Result<()> {
        Err(Error::CudaNotEnabled)
    }

    /// Stub: the crate was built without the `cuda` feature.
    pub fn get() -> Result<&'static CudaContext> {
        Err(Error::CudaNotEnabled)
    }

    /// Stub: always false without the `cuda` feature.
    pub fn is_initialized() -> bool {
        false
    }

    /// Stub: the crate was built without the `cuda` feature.
    pub fn alloc(&self, _bytes: usize) -> Result<u64> {
        Err(Error::CudaNotEnabled)
    }

    /// Stub: the crate was built without the `cuda` feature.
    pub fn free(&self, _ptr: u64, _bytes: usize) -> Result<()> {
        Err(Error::CudaNotEnabled)
    }

    /// Stub: the crate was built without the `cuda` feature.
    pub fn copy_to_device(&self, _ptr: u64, _data: &[u8]) -> Result<()> {
        Err(Error::CudaNotEnabled)
    }

    /// Stub: the crate was built without the `cuda` feature.
    pub fn copy_to_host(&self, _out: &mut [u8], _ptr: u64) -> Result<()> {
        Err(Error::CudaNotEnabled)
    }

    /// Stub: the crate was built without the `cuda` feature.
    pub fn launch_kernel(
        &self,
        _ptx: &str,
        _module: &str,
        _args: &[u64],
        _size: u32,
    ) -> Result<()> {
        Err(Error::CudaNotEnabled)
    }
}

#[cfg(all(test, not(feature = "cuda")))]
mod tests {
    use super::*;

    #[test]
    fn test_stub_reports_missing_feature() {
        assert!(!CudaContext::is_initialized());
        assert!(matches!(CudaContext::get(), Err(Error::CudaNotEnabled)));
        assert!(matches!(CudaContext::init(0), Err(Error::CudaNotEnabled)));
    }
}
