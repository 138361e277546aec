//! Evaluation: scheduling, code emission and kernel launch.
//!
//! `evaluate` drains the active set: variables are bucketed by element
//! count, each bucket is topologically ordered, compiled into a single
//! PTX kernel, linked through the driver and launched. Once a bucket
//! has executed, the dependency edges of its materialized results are
//! collapsed, releasing the expression DAG behind them.

mod codegen;
mod schedule;

pub use codegen::{Kernel, KERNEL_NAME};

use log::debug;

use crate::backend::cuda::CudaContext;
use crate::error::Result;
use crate::eval::codegen::KernelArg;
use crate::trace::{Trace, RESERVED};

impl Trace {
    /// Compiles every pending bucket to PTX without launching.
    ///
    /// This is the device-independent front half of [`Trace::evaluate`]:
    /// it partitions the active set, schedules and emits each bucket,
    /// clears the dirty queue and consumes side-effect pins. Output
    /// buffers are not allocated; the returned kernels carry the
    /// argument-table layout instead.
    pub fn compile(&mut self) -> Result<Vec<Kernel>> {
        let buckets = schedule::partition(self);
        self.clear_dirty();
        let mut kernels = Vec::with_capacity(buckets.len());
        for (size, seeds) in buckets {
            let order = schedule::schedule(self, size, &seeds)?;
            if order.is_empty() {
                continue;
            }
            kernels.push(codegen::emit(self, size, order)?);
        }
        Ok(kernels)
    }

    /// Evaluates every variable in the active set.
    ///
    /// Each compiled kernel is linked and launched synchronously on the
    /// current device; device buffers queued for release are freed once
    /// no launch is in flight. Any driver or consistency error aborts
    /// the evaluation; buffers already attached to variables stay owned
    /// by them and are released through normal reference counting.
    pub fn evaluate(&mut self) -> Result<()> {
        let kernels = self.compile()?;
        if kernels.is_empty() {
            return Ok(());
        }
        for kernel in kernels {
            self.launch(kernel)?;
        }
        self.flush_frees();
        Ok(())
    }

    /// Allocates output buffers, links and launches one kernel, then
    /// collapses the edges of its materialized results.
    fn launch(&mut self, kernel: Kernel) -> Result<()> {
        let ctx = CudaContext::get()?;

        let mut table = Vec::with_capacity(kernel.args.len());
        for arg in &kernel.args {
            match *arg {
                KernelArg::In(ptr) => table.push(ptr),
                KernelArg::Out(index) => {
                    let bytes = self.var(index)?.byte_size();
                    let ptr = ctx.alloc(bytes)?;
                    let var = self.var_mut(index)?;
                    var.data = ptr;
                    var.owns_data = true;
                    table.push(ptr);
                }
            }
        }

        self.kernel_counter += 1;
        let module = format!("enoki_mod_{}", self.kernel_counter);
        debug!(
            "jit: launching {module} over {} element(s) with {} argument(s)",
            kernel.size,
            table.len()
        );
        ctx.launch_kernel(&kernel.ptx, &module, &table, kernel.size as u32)?;

        self.collapse(&kernel.schedule)
    }

    /// Internally decrements and zeroes the dependency slots of every
    /// materialized computed variable in the schedule.
    fn collapse(&mut self, order: &[u32]) -> Result<()> {
        for &index in order {
            let deps = match self.get(index) {
                Some(var) if var.materialized() && !var.stmt.is_empty() => var.dep,
                _ => continue,
            };
            if deps == [0; 3] {
                continue;
            }
            if let Some(var) = self.get_mut(index) {
                var.dep = [0; 3];
            }
            for d in deps {
                if d >= RESERVED {
                    self.dec_ref_int(d)?;
                }
            }
        }
        Ok(())
    }
}
