//! # enoki-rs: a tracing JIT compiler for GPU arrays
//!
//! A lazy, trace-based just-in-time compiler: elementwise operations on
//! array handles are recorded into an expression graph instead of being
//! executed, and a single fused PTX kernel per element count is emitted,
//! linked through the CUDA driver and launched when a result is needed.
//!
//! ## Key features
//!
//! - **Lazy evaluation**: operations append trace variables; nothing
//!   runs until [`Trace::evaluate`] or a host read forces it
//! - **Kernel fusion**: all pending work over the same element count
//!   compiles into one grid-stride kernel
//! - **Template-driven emission**: every operation is one PTX
//!   instruction template with `$t`/`$b`/`$r` placeholders
//! - **Reference-counted trace**: handle lifetime on the host controls
//!   device buffer lifetime, with internal references keeping shared
//!   sub-expressions alive
//! - **Read-after-write barriers**: scatters mark their target dirty
//!   and consumers wait for the next evaluation
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use enoki_rs::{init, CudaArray};
//!
//! init(0).expect("CUDA device not available");
//!
//! let a = CudaArray::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
//! let b = a.add(&a).unwrap();
//! assert_eq!(b.to_vec().unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod array;
pub mod backend;
mod dtype;
mod error;
mod eval;
pub mod trace;

use std::sync::{Mutex, MutexGuard, OnceLock};

pub use array::{CudaArray, Float, Scalar};
pub use dtype::VarType;
pub use error::{Error, Result};
pub use eval::{Kernel, KERNEL_NAME};
pub use trace::{EdgeCallback, Trace, Variable, RESERVED};

/// Process-wide default trace, created on first use.
static TRACE: OnceLock<Mutex<Trace>> = OnceLock::new();

/// Locks and returns the process-wide default trace.
///
/// The core compiler operates on an explicit [`Trace`] value; this
/// global is a convenience for front-end code such as [`CudaArray`].
/// Host threads are not supported: the lock only guards against
/// accidental re-entrance, not for concurrent tracing.
pub fn trace() -> MutexGuard<'static, Trace> {
    TRACE
        .get_or_init(|| Mutex::new(Trace::new()))
        .lock()
        .expect("trace mutex poisoned")
}

/// Initializes the CUDA device context and the default trace.
///
/// Tracing and compilation work without this call; only evaluation and
/// host reads need a device.
pub fn init(device_id: usize) -> Result<()> {
    backend::cuda::CudaContext::init(device_id)?;
    let _unused = trace();
    Ok(())
}

/// Evaluates pending side effects and releases every surviving trace
/// variable.
pub fn shutdown() {
    trace().teardown();
}

/// Device-side `printf` of up to three traced values, executed at the
/// next evaluation.
///
/// `args` are trace indices (see [`CudaArray::id`]); each lane of the
/// widest argument prints once.
pub fn printf(fmt: &str, args: &[u32]) -> Result<()> {
    let mut t = trace();
    let index = t.printf(fmt, args)?;
    t.dec_ref_ext(index)
}
