//! Native pulse kernel boundary
//!
//! Three ABI-stable entry points in the `gpupulse` library: device count,
//! one timed GEMM per call, one timed 100 MiB peer copy per call. The
//! library blocks on device synchronise; GEMM wall-clock timing is the
//! caller's job.

use thiserror::Error;

/// Return codes from the native library.
pub const KERNEL_OK: i32 = 0;
pub const KERNEL_ERR_CUDA: i32 = 1;
pub const KERNEL_ERR_OOM: i32 = 2;
/// Peer access unsupported or severely degraded.
pub const KERNEL_ERR_P2P: i32 = 3;

/// The native library's three entry points, as a seam so the pipeline can
/// be driven by scripted kernels in tests.
pub trait PulseKernel: Send + Sync {
    /// Count of visible devices, or -1 on error.
    fn device_count(&self) -> i32;

    /// One warm-up plus one measured 2048x2048 FP32 tiled GEMM on the given
    /// device. Blocks until the device synchronises.
    fn run_gpu_pulse(&self, device_id: i32) -> i32;

    /// One warm-up plus one timed 100 MiB peer copy src to dst. Returns the
    /// raw code and the measured unidirectional bandwidth in GB/s
    /// (decimal, divisor 10^9); the bandwidth is meaningful only on
    /// [`KERNEL_OK`].
    fn run_p2p_check(&self, src: i32, dst: i32) -> (i32, f64);
}

/// The kernel library could not be loaded into this build.
#[derive(Debug, Error)]
#[error("built without cuda support: rebuild with --features cuda")]
pub struct CudaUnavailable;

/// Kernel backed by the real `gpupulse` native library.
#[derive(Debug, Clone, Copy)]
pub struct CudaKernel {
    _private: (),
}

impl CudaKernel {
    /// Bind the native entry points. Fails in builds without the `cuda`
    /// feature; the agent treats that as a fatal startup error rather than
    /// quarantining healthy nodes with a build-configuration message.
    #[cfg(feature = "cuda")]
    pub fn load() -> Result<Self, CudaUnavailable> {
        Ok(Self { _private: () })
    }

    #[cfg(not(feature = "cuda"))]
    pub fn load() -> Result<Self, CudaUnavailable> {
        Err(CudaUnavailable)
    }
}

#[cfg(feature = "cuda")]
mod ffi {
    use std::os::raw::{c_double, c_int};

    #[link(name = "gpupulse")]
    extern "C" {
        pub fn gpu_device_count() -> c_int;
        pub fn run_gpu_pulse(device_id: c_int) -> c_int;
        pub fn run_p2p_check(src_device: c_int, dst_device: c_int, bandwidth_gbs: *mut c_double)
            -> c_int;
    }
}

#[cfg(feature = "cuda")]
impl PulseKernel for CudaKernel {
    fn device_count(&self) -> i32 {
        unsafe { ffi::gpu_device_count() }
    }

    fn run_gpu_pulse(&self, device_id: i32) -> i32 {
        unsafe { ffi::run_gpu_pulse(device_id) }
    }

    fn run_p2p_check(&self, src: i32, dst: i32) -> (i32, f64) {
        let mut bandwidth_gbs = 0.0f64;
        let rc = unsafe { ffi::run_p2p_check(src, dst, &mut bandwidth_gbs) };
        (rc, bandwidth_gbs)
    }
}

// CudaKernel::load refuses in non-cuda builds, so these bodies are
// unreachable; they exist to keep the type object-safe in both builds.
#[cfg(not(feature = "cuda"))]
impl PulseKernel for CudaKernel {
    fn device_count(&self) -> i32 {
        -1
    }

    fn run_gpu_pulse(&self, _device_id: i32) -> i32 {
        KERNEL_ERR_CUDA
    }

    fn run_p2p_check(&self, _src: i32, _dst: i32) -> (i32, f64) {
        (KERNEL_ERR_P2P, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn load_refuses_without_cuda_feature() {
        let err = CudaKernel::load().unwrap_err();
        assert!(err.to_string().contains("cuda"));
    }
}
