//! Device backend.
//!
//! The tracer targets the NVIDIA driver API through the `cudarc` crate.
//! The backend is compiled behind the `cuda` cargo feature; without it
//! every device operation reports [`crate::Error::CudaNotEnabled`]
//! while the device-independent compiler pipeline stays available.

pub mod cuda;
