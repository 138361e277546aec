//! The trace context: variable table, active set and reference counts.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use log::{debug, warn};

use crate::backend::cuda::CudaContext;
use crate::dtype::VarType;
use crate::error::{Error, Result};
use crate::trace::var::{EdgeCallback, Variable};

/// Number of reserved variable indices.
///
/// Index 0 means "no operand". Indices `1..RESERVED` name registers
/// with a fixed role in every emitted kernel (argument pointer, lane
/// index, stride, thread identifiers, address scratch) and never refer
/// to table entries with contents.
pub const RESERVED: u32 = 10;

/// The tracing context.
///
/// Owns the growable variable table, the *active* set (variables that
/// seed the next evaluation) and the *dirty* queue (scatter targets
/// awaiting a write barrier). All public operations of the compiler are
/// methods on this type; a process-wide default context is provided by
/// [`crate::trace()`] for convenience.
pub struct Trace {
    /// Variable table. Entries are removed once collected.
    vars: HashMap<u32, Variable>,
    /// Index handed to the next inserted variable.
    next_index: u32,
    /// Externally referenced or side-effectful variables, in issue order.
    active: BTreeSet<u32>,
    /// Variables whose contents were overwritten by a scatter.
    dirty: Vec<u32>,
    /// Device buffers released by collection, freed after the next
    /// launch completes so in-flight kernels never read freed memory.
    pending_free: Vec<(u64, usize)>,
    /// Monotonic counter used to name linked modules.
    pub(crate) kernel_counter: u64,
}

impl Trace {
    /// Creates a context with the reserved slots installed.
    ///
    /// The reserved slots carry the register class of their fixed role
    /// so that `$r` placeholders naming them resolve to the right
    /// register name (`%r2` for the lane index, and so on).
    pub fn new() -> Self {
        let mut vars = HashMap::new();
        for index in 0..RESERVED {
            let vtype = match index {
                0 => VarType::Pointer,
                1..=7 => VarType::U32,
                _ => VarType::U64,
            };
            vars.insert(index, Variable::new(vtype, 0));
        }
        Self {
            vars,
            next_index: RESERVED,
            active: BTreeSet::new(),
            dirty: Vec::new(),
            pending_free: Vec::new(),
            kernel_counter: 0,
        }
    }

    /// Looks up a variable, failing with an internal error if the index
    /// is dangling.
    pub fn var(&self, index: u32) -> Result<&Variable> {
        self.vars
            .get(&index)
            .ok_or_else(|| Error::internal(format!("variable {index} is dangling")))
    }

    pub(crate) fn var_mut(&mut self, index: u32) -> Result<&mut Variable> {
        self.vars
            .get_mut(&index)
            .ok_or_else(|| Error::internal(format!("variable {index} is dangling")))
    }

    pub(crate) fn get(&self, index: u32) -> Option<&Variable> {
        self.vars.get(&index)
    }

    pub(crate) fn get_mut(&mut self, index: u32) -> Option<&mut Variable> {
        self.vars.get_mut(&index)
    }

    /// Inserts a variable, returning its index and installing the
    /// initial external reference.
    pub(crate) fn insert(&mut self, var: Variable) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        self.vars.insert(index, var);
        self.inc_ref_ext(index);
        index
    }

    /// Index the next inserted variable will receive.
    pub(crate) fn peek_index(&self) -> u32 {
        self.next_index
    }

    /// Number of live user-visible variables.
    pub fn len(&self) -> usize {
        self.vars.len() - RESERVED as usize
    }

    /// True if no user-visible variable is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Variables currently seeding the next evaluation.
    pub(crate) fn active(&self) -> &BTreeSet<u32> {
        &self.active
    }

    /// Publishes an externally allocated device buffer as an input
    /// variable.
    ///
    /// The new variable has no instruction template; `data` must be a
    /// valid device address holding `size` elements of `vtype`. When
    /// `owns` is set, the buffer is released when the variable is
    /// destroyed. A non-zero `parent` is referenced internally for the
    /// lifetime of the new variable; this is how pointer variables keep
    /// the array they point into alive.
    pub fn register_input(
        &mut self,
        vtype: VarType,
        size: usize,
        data: u64,
        parent: u32,
        owns: bool,
    ) -> Result<u32> {
        if data == 0 {
            return Err(Error::internal("register_input: null device pointer"));
        }
        if parent != 0 {
            self.inc_ref_int(parent)?;
        }
        let mut var = Variable::new(vtype, size);
        var.data = data;
        var.owns_data = owns;
        var.dep[0] = parent;
        Ok(self.insert(var))
    }

    /// Attaches a diagnostic comment emitted next to the variable's
    /// instructions in the PTX listing.
    pub fn attach_comment(&mut self, index: u32, text: &str) -> Result<()> {
        self.var_mut(index)?.comment = Some(text.to_string());
        Ok(())
    }

    /// Overrides the element count of a variable.
    pub fn set_count(&mut self, index: u32, size: usize) -> Result<()> {
        let var = self.var_mut(index)?;
        if var.materialized() && var.byte_size() != size * var.vtype.size() {
            return Err(Error::internal(format!(
                "set_count: variable {index} is already materialized"
            )));
        }
        var.size = size;
        Ok(())
    }

    /// Installs an edge callback owned by the variable and released
    /// when it is retired.
    pub fn attach_callback(
        &mut self,
        index: u32,
        callback: Box<dyn EdgeCallback>,
    ) -> Result<()> {
        self.var_mut(index)?.callback = Some(callback);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reference manager
    // ------------------------------------------------------------------

    /// Increments the external reference count (a user handle was
    /// created or cloned). Reserved indices are ignored.
    pub fn inc_ref_ext(&mut self, index: u32) {
        if index < RESERVED {
            return;
        }
        if let Some(var) = self.vars.get_mut(&index) {
            var.ref_count_ext += 1;
            self.active.insert(index);
        }
    }

    /// Decrements the external reference count. When it reaches zero
    /// the variable leaves the active set, and is destroyed if no
    /// internal reference remains.
    pub fn dec_ref_ext(&mut self, index: u32) -> Result<()> {
        if index < RESERVED {
            return Ok(());
        }
        let (ext, int) = {
            let var = self.var_mut(index)?;
            if var.ref_count_ext == 0 {
                return Err(Error::internal(format!(
                    "dec_ref_ext: reference count of variable {index} underflowed"
                )));
            }
            var.ref_count_ext -= 1;
            (var.ref_count_ext, var.ref_count_int)
        };
        if ext == 0 {
            self.active.remove(&index);
            if int == 0 {
                self.destroy(index)?;
            }
        }
        Ok(())
    }

    /// Increments the internal reference count (the variable was named
    /// as an operand). Reserved indices are ignored.
    pub fn inc_ref_int(&mut self, index: u32) -> Result<()> {
        if index < RESERVED {
            return Ok(());
        }
        self.var_mut(index)?.ref_count_int += 1;
        Ok(())
    }

    /// Decrements the internal reference count, destroying the variable
    /// once both counts reach zero.
    pub fn dec_ref_int(&mut self, index: u32) -> Result<()> {
        if index < RESERVED {
            return Ok(());
        }
        let var = self.var_mut(index)?;
        if var.ref_count_int == 0 {
            return Err(Error::internal(format!(
                "dec_ref_int: reference count of variable {index} underflowed"
            )));
        }
        var.ref_count_int -= 1;
        if var.collected() {
            self.destroy(index)?;
        }
        Ok(())
    }

    /// Removes a collected variable, releasing its device buffer and
    /// cascading the release through its dependencies.
    fn destroy(&mut self, index: u32) -> Result<()> {
        let mut worklist = vec![index];
        while let Some(i) = worklist.pop() {
            let var = self.vars.remove(&i).ok_or_else(|| {
                Error::internal(format!("destroy: variable {i} is dangling"))
            })?;
            debug_assert!(var.collected());
            self.active.remove(&i);
            if var.owns_data && var.data != 0 {
                self.pending_free.push((var.data, var.byte_size()));
            }
            for &d in var.dep.iter() {
                if d < RESERVED {
                    continue;
                }
                let dep = self.var_mut(d)?;
                if dep.ref_count_int == 0 {
                    return Err(Error::internal(format!(
                        "destroy: reference count of variable {d} underflowed"
                    )));
                }
                dep.ref_count_int -= 1;
                if dep.collected() {
                    worklist.push(d);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Side effects and hazards
    // ------------------------------------------------------------------

    /// Pins a variable for the next evaluation even if every user
    /// handle is dropped.
    ///
    /// The pin is an extra external reference which the scheduler
    /// releases once the variable has been emitted.
    pub fn mark_side_effect(&mut self, index: u32) -> Result<()> {
        self.var(index)?;
        self.inc_ref_ext(index);
        self.var_mut(index)?.side_effect = true;
        Ok(())
    }

    /// Records that a side effect will overwrite the contents of
    /// `index`. Consumers appended afterwards hit a read-after-write
    /// barrier that forces evaluation first.
    pub fn mark_dirty(&mut self, index: u32) -> Result<()> {
        self.var_mut(index)?.dirty = true;
        self.dirty.push(index);
        Ok(())
    }

    /// Clears every pending dirty flag. Called once per evaluation.
    pub(crate) fn clear_dirty(&mut self) {
        let queue = std::mem::take(&mut self.dirty);
        for index in queue {
            if let Some(var) = self.vars.get_mut(&index) {
                var.dirty = false;
            }
        }
    }

    // ------------------------------------------------------------------
    // Device memory
    // ------------------------------------------------------------------

    /// Allocates `bytes` of device memory on behalf of the front end.
    pub fn managed_alloc(&mut self, bytes: usize) -> Result<u64> {
        CudaContext::get()?.alloc(bytes)
    }

    /// Releases memory obtained from [`Trace::managed_alloc`].
    pub fn managed_free(&mut self, ptr: u64) -> Result<()> {
        CudaContext::get()?.free(ptr, 0)
    }

    /// Releases every queued buffer. Only called when no launch is in
    /// flight.
    pub(crate) fn flush_frees(&mut self) {
        if self.pending_free.is_empty() {
            return;
        }
        let queue = std::mem::take(&mut self.pending_free);
        match CudaContext::get() {
            Ok(ctx) => {
                for (ptr, bytes) in queue {
                    if let Err(err) = ctx.free(ptr, bytes) {
                        warn!("failed to release device buffer {ptr:#x}: {err}");
                    }
                }
            }
            // Without a device context there is nothing to release; the
            // queued addresses were never real allocations.
            Err(_) => debug!("dropping {} queued buffer releases", queue.len()),
        }
    }

    /// Copies `dst.len()` bytes of one element from the device, forcing
    /// evaluation first if the variable is unevaluated or dirty.
    ///
    /// `offset` counts elements of `dst.len()` bytes each. After this
    /// call the variable is clean.
    pub fn fetch_element(&mut self, index: u32, offset: usize, dst: &mut [u8]) -> Result<()> {
        let needs_eval = {
            let var = self.var(index)?;
            !var.materialized() || var.dirty
        };
        if needs_eval {
            self.evaluate()?;
        }
        let var = self.var(index)?;
        if !var.materialized() {
            return Err(Error::internal(format!(
                "fetch_element: variable {index} was not materialized by evaluation"
            )));
        }
        let byte_offset = offset * dst.len();
        if byte_offset + dst.len() > var.byte_size() {
            return Err(Error::internal(format!(
                "fetch_element: element {offset} is out of bounds for variable {index}"
            )));
        }
        CudaContext::get()?.copy_to_host(dst, var.data + byte_offset as u64)
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Renders a table of every live variable, one per line.
    pub fn dump(&self) -> String {
        let mut out = String::from(
            "  index  type   size     refs (ext/int)  flags  comment\n",
        );
        let mut indices: Vec<&u32> = self.vars.keys().filter(|&&i| i >= RESERVED).collect();
        indices.sort_unstable();
        for &index in indices {
            let var = &self.vars[&index];
            let mut flags = String::new();
            if var.materialized() {
                flags.push('d');
            }
            if var.side_effect {
                flags.push('s');
            }
            if var.dirty {
                flags.push('!');
            }
            let _ = writeln!(
                out,
                "  {:<6} {:<6} {:<8} {:>3}/{:<3}          {:<6} {}",
                index,
                var.vtype.to_string(),
                var.size,
                var.ref_count_ext,
                var.ref_count_int,
                flags,
                var.comment.as_deref().unwrap_or("")
            );
        }
        out
    }

    /// Evaluates outstanding side effects and releases every surviving
    /// variable. Called by [`crate::shutdown`].
    pub fn teardown(&mut self) {
        let pending: Vec<u32> = self
            .active
            .iter()
            .copied()
            .filter(|&i| {
                self.vars
                    .get(&i)
                    .is_some_and(|v| v.side_effect && !v.materialized())
            })
            .collect();
        if !pending.is_empty() {
            if let Err(err) = self.evaluate() {
                warn!("shutdown: evaluation of pending side effects failed: {err}");
            }
        }
        if self.len() > 0 {
            warn!("shutdown: {} variable(s) still referenced", self.len());
        }
        let indices: Vec<u32> = self.vars.keys().copied().filter(|&i| i >= RESERVED).collect();
        for index in indices {
            if let Some(var) = self.vars.remove(&index) {
                if var.owns_data && var.data != 0 {
                    self.pending_free.push((var.data, var.byte_size()));
                }
            }
        }
        self.active.clear();
        self.dirty.clear();
        self.flush_frees();
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        self.flush_frees();
    }
}
