//! PTX kernel assembly.
//!
//! One kernel is emitted per bucket. The kernel receives a pointer to a
//! device table of buffer addresses and the element count, and walks
//! the lanes with a grid-stride loop.

use std::collections::HashMap;
use std::fmt::Write as _;

use log::{debug, trace as log_trace};

use crate::dtype::VarType;
use crate::error::{Error, Result};
use crate::eval::schedule::assign_registers;
use crate::trace::{Trace, RESERVED};

/// Name of the entry point of every emitted kernel.
pub const KERNEL_NAME: &str = "enoki_kernel";

/// Entry of the launch argument table.
#[derive(Debug, Clone, Copy)]
pub(crate) enum KernelArg {
    /// A device address known at emission time (an input buffer).
    In(u64),
    /// An output buffer for the named variable, allocated at launch.
    Out(u32),
}

/// A compiled kernel, ready to be linked and launched.
#[derive(Debug)]
pub struct Kernel {
    /// Element count of the bucket this kernel covers.
    pub size: usize,
    /// The PTX listing.
    pub ptx: String,
    pub(crate) args: Vec<KernelArg>,
    pub(crate) schedule: Vec<u32>,
}

/// Emits the kernel for one bucket.
///
/// Walks the schedule in order: variables with device contents load
/// their lane, computed variables expand their instruction template.
/// Side-effectful variables release their scheduling pin once emitted,
/// and externally referenced results of the bucket's full width receive
/// an output buffer slot in the argument table.
pub(crate) fn emit(trace: &mut Trace, bucket: usize, order: Vec<u32>) -> Result<Kernel> {
    let regs = assign_registers(&order);
    let mut args: Vec<KernelArg> = Vec::new();
    let mut body = String::new();

    for &index in &order {
        let (vtype, size, data, stmt_empty, comment) = {
            let var = trace
                .get(index)
                .ok_or_else(|| Error::internal(format!("emitted variable {index} was collected")))?;
            (
                var.vtype,
                var.size,
                var.data,
                var.stmt.is_empty(),
                var.comment.clone(),
            )
        };
        if let Some(text) = comment {
            let _ = writeln!(body, "    // {text}");
        }

        if data != 0 {
            emit_load(&mut body, vtype, size, regs[&index], args.len())?;
            args.push(KernelArg::In(data));
            continue;
        }
        if stmt_empty {
            return Err(Error::internal(format!(
                "variable {index} has neither an instruction nor device contents"
            )));
        }

        let expanded = expand_template(trace, index, &regs)?;
        for line in expanded.lines() {
            let _ = writeln!(body, "    {line}");
        }

        let side_effect = trace.get(index).is_some_and(|v| v.side_effect);
        if side_effect {
            // The scheduling pin installed by mark_side_effect is
            // consumed here; the variable may be collected on the spot.
            trace.dec_ref_ext(index)?;
            if let Some(var) = trace.get_mut(index) {
                var.side_effect = false;
            }
        }

        let ext = trace.get(index).map_or(0, |v| v.ref_count_ext);
        if ext > 0 && size == bucket {
            emit_store(&mut body, vtype, bucket, regs[&index], args.len())?;
            args.push(KernelArg::Out(index));
        }
    }

    let ptx = assemble(order.len(), &body);
    debug!(
        "jit: bucket of {bucket} element(s): {} variable(s), {} argument(s), {} bytes of ptx",
        order.len(),
        args.len(),
        ptx.len()
    );
    log_trace!("{ptx}");
    Ok(Kernel { size: bucket, ptx, args, schedule: order })
}

/// Wraps the emitted body in the kernel skeleton.
fn assemble(scheduled: usize, body: &str) -> String {
    let n = RESERVED as usize + scheduled;
    format!(
        r#".version 6.3
.target sm_75
.address_size 64

.extern .func (.param .b32 rv) vprintf (.param .b64 fmt, .param .b64 buf);

.visible .entry enoki_kernel(.param .u64 ptr, .param .u32 size) {{
    // 8-bit values stage through 16-bit registers; PTX has no 8-bit register file
    .reg.b16 %b<{n}>;
    .reg.b16 %w<{n}>;
    .reg.b16 %h<{n}>;
    .reg.b32 %r<{n}>;
    .reg.b64 %rd<{n}>;
    .reg.f32 %f<{n}>;
    .reg.f64 %d<{n}>;
    .reg.pred %p<{n}>;

    ld.param.u64 %rd0, [ptr];
    ld.param.u32 %r1, [size];
    mov.u32 %r4, %tid.x;
    mov.u32 %r5, %ctaid.x;
    mov.u32 %r6, %ntid.x;
    mov.u32 %r7, %nctaid.x;
    mad.lo.u32 %r2, %r5, %r6, %r4;
    mul.lo.u32 %r3, %r6, %r7;
    setp.ge.u32 %p0, %r2, %r1;
    @%p0 bra L_exit;

L_body:
{body}
    add.u32 %r2, %r2, %r3;
    setp.ge.u32 %p0, %r2, %r1;
    @!%p0 bra L_body;

L_exit:
    ret;

    // dead store, do not remove
    st.global.u32 [%rd8], %r2;
}}
"#
    )
}

/// Emits the lane load for a variable carrying device contents.
///
/// `Pointer` variables are special: the table entry *is* their value,
/// so it is loaded directly into the destination register. `Bool`
/// contents are stored as bytes and converted into a predicate.
fn emit_load(
    body: &mut String,
    vtype: VarType,
    size: usize,
    reg: u32,
    slot: usize,
) -> Result<()> {
    let offset = slot * 8;
    let _ = writeln!(body, "    // in {slot}");
    if vtype == VarType::Pointer {
        let _ = writeln!(body, "    ldu.global.u64 %rd{reg}, [%rd0+{offset}];");
        return Ok(());
    }
    let _ = writeln!(body, "    ldu.global.u64 %rd8, [%rd0+{offset}];");
    if size != 1 {
        let _ = writeln!(body, "    mul.wide.u32 %rd9, %r2, {};", vtype.size());
        let _ = writeln!(body, "    add.u64 %rd8, %rd8, %rd9;");
    }
    match vtype {
        VarType::Bool => {
            let _ = writeln!(body, "    ld.global.u8 %w{reg}, [%rd8];");
            let _ = writeln!(body, "    setp.ne.u16 %p{reg}, %w{reg}, 0;");
        }
        VarType::F16 => {
            let _ = writeln!(body, "    ld.global.b16 %h{reg}, [%rd8];");
        }
        VarType::Invalid => {
            return Err(Error::template("cannot load a variable of invalid type"))
        }
        _ => {
            let _ = writeln!(
                body,
                "    ld.global.{} {}{reg}, [%rd8];",
                vtype.ptx_type(),
                vtype.reg_prefix()
            );
        }
    }
    Ok(())
}

/// Emits the lane store materializing an externally referenced result.
fn emit_store(
    body: &mut String,
    vtype: VarType,
    bucket: usize,
    reg: u32,
    slot: usize,
) -> Result<()> {
    let offset = slot * 8;
    let _ = writeln!(body, "    // out {slot}");
    let _ = writeln!(body, "    ldu.global.u64 %rd8, [%rd0+{offset}];");
    if bucket != 1 {
        let _ = writeln!(body, "    mul.wide.u32 %rd9, %r2, {};", vtype.size());
        let _ = writeln!(body, "    add.u64 %rd8, %rd8, %rd9;");
    }
    match vtype {
        VarType::Bool => {
            let _ = writeln!(body, "    selp.u16 %w{reg}, 1, 0, %p{reg};");
            let _ = writeln!(body, "    st.global.u8 [%rd8], %w{reg};");
        }
        VarType::F16 => {
            let _ = writeln!(body, "    st.global.b16 [%rd8], %h{reg};");
        }
        VarType::Invalid | VarType::Pointer => {
            return Err(Error::template(format!(
                "cannot materialize a variable of type {vtype}"
            )))
        }
        _ => {
            let _ = writeln!(
                body,
                "    st.global.{} [%rd8], {}{reg};",
                vtype.ptx_type(),
                vtype.reg_prefix()
            );
        }
    }
    Ok(())
}

/// Expands the `$t`, `$b` and `$r` placeholders of one instruction
/// template against the register assignment.
///
/// Operand digit 1 names the variable itself, digits 2–4 its
/// dependency slots in declared order. A template that does not end in
/// a newline receives a terminating `;`.
pub(crate) fn expand_template(
    trace: &Trace,
    index: u32,
    regs: &HashMap<u32, u32>,
) -> Result<String> {
    let var = trace
        .get(index)
        .ok_or_else(|| Error::internal(format!("expanded variable {index} was collected")))?;
    let stmt = &var.stmt;
    let mut out = String::with_capacity(stmt.len() + 16);
    let mut chars = stmt.chars();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let kind = chars.next().ok_or_else(|| {
            Error::template(format!("variable {index}: truncated placeholder in {stmt:?}"))
        })?;
        let digit = chars
            .next()
            .and_then(|d| d.to_digit(10))
            .filter(|d| (1..=4).contains(d))
            .ok_or_else(|| {
                Error::template(format!(
                    "variable {index}: placeholder operand out of range in {stmt:?}"
                ))
            })?;
        let operand = if digit == 1 {
            index
        } else {
            let dep = var.dep[digit as usize - 2];
            if dep == 0 {
                return Err(Error::template(format!(
                    "variable {index}: operand {digit} has no dependency"
                )));
            }
            dep
        };
        let vtype = trace
            .get(operand)
            .ok_or_else(|| {
                Error::internal(format!("operand {operand} of variable {index} was collected"))
            })?
            .vtype;
        match kind {
            't' => out.push_str(vtype.ptx_type()),
            'b' => out.push_str(vtype.ptx_bin()),
            'r' => {
                let reg = regs.get(&operand).ok_or_else(|| {
                    Error::internal(format!(
                        "operand {operand} of variable {index} was never scheduled"
                    ))
                })?;
                out.push_str(vtype.reg_prefix());
                let _ = write!(out, "{reg}");
            }
            other => {
                return Err(Error::template(format!(
                    "variable {index}: unrecognized placeholder ${other} in {stmt:?}"
                )))
            }
        }
    }

    if !out.ends_with('\n') {
        out.push_str(";\n");
    }
    Ok(out)
}
