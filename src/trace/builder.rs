//! Construction of trace variables from PTX instruction templates.

use std::fmt::Write as _;

use log::trace as log_trace;

use crate::dtype::VarType;
use crate::error::{Error, Result};
use crate::trace::state::{Trace, RESERVED};
use crate::trace::var::Variable;

impl Trace {
    /// Appends a computed variable carrying a PTX instruction template
    /// and up to three operands.
    ///
    /// Placeholders in the template are resolved at emission time:
    /// `$t<d>`, `$b<d>` and `$r<d>` expand to the type token, binary
    /// type token and register name of operand `d`, where operand 1 is
    /// the new variable itself and 2–4 name `deps` in declared order.
    ///
    /// Appending a consumer of a dirty operand is a read-after-write
    /// hazard and forces a full evaluation before the variable is
    /// inserted.
    ///
    /// The element count of the result is the maximum of the operand
    /// counts (1 if there are none), and the caller receives an
    /// external reference to the new variable.
    pub fn append(
        &mut self,
        vtype: VarType,
        stmt: impl Into<String>,
        deps: &[u32],
    ) -> Result<u32> {
        let stmt = stmt.into();
        if deps.len() > 3 {
            return Err(Error::internal(format!(
                "append: {} operands given, at most 3 supported",
                deps.len()
            )));
        }
        if stmt.is_empty() {
            return Err(Error::internal(
                "append: a computed variable needs a non-empty instruction",
            ));
        }

        let mut barrier = false;
        for &d in deps {
            if d == 0 {
                return Err(Error::internal("append: operand index 0 is reserved"));
            }
            let var = self.var(d)?;
            barrier |= var.dirty;
        }
        if barrier {
            self.evaluate()?;
        }

        let mut size = 1;
        let mut subtree_size = 1;
        for &d in deps {
            if d < RESERVED {
                continue;
            }
            let var = self.var(d)?;
            debug_assert!(!var.dirty, "operand {d} still dirty after evaluation");
            size = size.max(var.size);
            subtree_size += var.subtree_size;
        }

        let mut var = Variable::new(vtype, size);
        var.stmt = stmt;
        var.subtree_size = subtree_size;
        for (slot, &d) in deps.iter().enumerate() {
            var.dep[slot] = d;
            self.inc_ref_int(d)?;
        }
        let index = self.insert(var);
        log_trace!("append: {index} <- {vtype} [{deps:?}]");
        Ok(index)
    }

    /// Appends a device-side `printf` of up to three traced values.
    ///
    /// The emitted block declares the format string as a global byte
    /// array, packs the arguments into a local buffer of 8-byte slots
    /// (widening `F32` to `F64` and sub-word integers to 32 bits) and
    /// calls `vprintf`. The resulting variable is marked side-effectful
    /// so it is scheduled even after the returned handle is dropped.
    ///
    /// Behavior with more format specifiers than arguments is the
    /// caller's responsibility.
    pub fn printf(&mut self, fmt: &str, args: &[u32]) -> Result<u32> {
        if args.len() > 3 {
            return Err(Error::internal(format!(
                "printf: {} arguments given, at most 3 supported",
                args.len()
            )));
        }
        let tag = self.peek_index();
        let mut stmt = String::from("{\n");

        let bytes: Vec<String> = fmt
            .bytes()
            .chain(std::iter::once(0u8))
            .map(|b| b.to_string())
            .collect();
        let _ = writeln!(
            stmt,
            "    .global .align 1 .b8 __pf_fmt_{tag}[{}] = {{ {} }};",
            bytes.len(),
            bytes.join(", ")
        );
        if !args.is_empty() {
            let _ = writeln!(
                stmt,
                "    .local .align 8 .b8 __pf_buf_{tag}[{}];",
                8 * args.len()
            );
        }
        stmt.push_str("    .reg.b64 %pf<2>;\n");
        stmt.push_str("    .reg.b32 %pv;\n");
        stmt.push_str("    .reg.f64 %pd;\n");
        if args.is_empty() {
            stmt.push_str("    mov.u64 %pf0, 0;\n");
        } else {
            let _ = writeln!(stmt, "    cvta.local.u64 %pf0, __pf_buf_{tag};");
        }

        // Argument stores address the buffer through its local-window
        // symbol; the cvta.local result is a generic address and only
        // serves as the pointer handed to vprintf.
        for (slot, &arg) in args.iter().enumerate() {
            let vtype = self.var(arg)?.vtype;
            let reg = slot + 2;
            let offset = slot * 8;
            match vtype {
                VarType::F32 => {
                    let _ = writeln!(stmt, "    cvt.f64.f32 %pd, $r{reg};");
                    let _ =
                        writeln!(stmt, "    st.local.f64 [__pf_buf_{tag}+{offset}], %pd;");
                }
                VarType::F16 => {
                    let _ = writeln!(stmt, "    cvt.f64.f16 %pd, $r{reg};");
                    let _ =
                        writeln!(stmt, "    st.local.f64 [__pf_buf_{tag}+{offset}], %pd;");
                }
                VarType::F64 => {
                    let _ =
                        writeln!(stmt, "    st.local.f64 [__pf_buf_{tag}+{offset}], $r{reg};");
                }
                VarType::Bool => {
                    let _ = writeln!(stmt, "    selp.u32 %pv, 1, 0, $r{reg};");
                    let _ =
                        writeln!(stmt, "    st.local.u32 [__pf_buf_{tag}+{offset}], %pv;");
                }
                VarType::I8 | VarType::I16 => {
                    let _ = writeln!(stmt, "    cvt.s32.$t{reg} %pv, $r{reg};");
                    let _ =
                        writeln!(stmt, "    st.local.s32 [__pf_buf_{tag}+{offset}], %pv;");
                }
                VarType::U8 | VarType::U16 => {
                    let _ = writeln!(stmt, "    cvt.u32.$t{reg} %pv, $r{reg};");
                    let _ =
                        writeln!(stmt, "    st.local.u32 [__pf_buf_{tag}+{offset}], %pv;");
                }
                VarType::I32 | VarType::U32 | VarType::I64 | VarType::U64
                | VarType::Pointer => {
                    let _ = writeln!(
                        stmt,
                        "    st.local.$t{reg} [__pf_buf_{tag}+{offset}], $r{reg};"
                    );
                }
                VarType::Invalid => {
                    return Err(Error::template(format!(
                        "printf: argument {arg} has an invalid type"
                    )))
                }
            }
        }

        let _ = writeln!(stmt, "    cvta.global.u64 %pf1, __pf_fmt_{tag};");
        stmt.push_str(
            r#"    {
        .param .b64 fmt_p;
        .param .b64 buf_p;
        .param .b32 rv_p;
        st.param.b64 [fmt_p], %pf1;
        st.param.b64 [buf_p], %pf0;
        call.uni (rv_p), vprintf, (fmt_p, buf_p);
        ld.param.b32 $r1, [rv_p];
    }
}
"#,
        );

        let index = self.append(VarType::U32, stmt, args)?;
        self.mark_side_effect(index)?;
        Ok(index)
    }

    /// Appends a gather of `source` at the lanes selected by `index`.
    ///
    /// The source is materialized first (forcing an evaluation if
    /// necessary); its device address is published as a `Pointer`
    /// variable whose parent reference keeps the source alive for as
    /// long as the gather can still execute.
    pub fn gather(&mut self, source: u32, index: u32) -> Result<u32> {
        let needs_eval = {
            let var = self.var(source)?;
            !var.materialized() || var.dirty
        };
        if needs_eval {
            self.evaluate()?;
        }
        let (vtype, data) = {
            let var = self.var(source)?;
            (var.vtype, var.data)
        };
        if data == 0 {
            return Err(Error::internal(format!(
                "gather: source {source} was not materialized by evaluation"
            )));
        }
        let index_t = self.var(index)?.vtype;
        let scale = mul_wide(index_t)?;

        let stmt = if vtype == VarType::Bool {
            format!(
                r#"{{
    .reg.b16 %gs;
    {scale} %rd8, $r3, 1;
    add.u64 %rd8, $r2, %rd8;
    ld.global.u8 %gs, [%rd8];
    setp.ne.u16 $r1, %gs, 0;
}}
"#
            )
        } else {
            format!(
                r#"{scale} %rd8, $r3, {size};
add.u64 %rd8, $r2, %rd8;
ld.global.$t1 $r1, [%rd8];
"#,
                size = vtype.size()
            )
        };

        let ptr = self.register_input(VarType::Pointer, 1, data, source, false)?;
        let result = self.append(vtype, stmt, &[ptr, index]);
        self.dec_ref_ext(ptr)?;
        result
    }

    /// Appends a scatter of `value` into `target` at the lanes selected
    /// by `index`.
    ///
    /// The resulting variable is side-effectful, and the target is
    /// marked dirty: any later read of the target waits for the next
    /// evaluation.
    pub fn scatter(&mut self, target: u32, value: u32, index: u32) -> Result<u32> {
        let needs_eval = !self.var(target)?.materialized();
        if needs_eval {
            self.evaluate()?;
        }
        let data = {
            let var = self.var(target)?;
            if var.data == 0 {
                return Err(Error::internal(format!(
                    "scatter: target {target} was not materialized by evaluation"
                )));
            }
            var.data
        };
        let value_t = self.var(value)?.vtype;
        let index_t = self.var(index)?.vtype;
        let scale = mul_wide(index_t)?;

        let stmt = if value_t == VarType::Bool {
            format!(
                r#"{{
    .reg.b16 %ss;
    {scale} %rd8, $r4, 1;
    add.u64 %rd8, $r2, %rd8;
    selp.u16 %ss, 1, 0, $r3;
    st.global.u8 [%rd8], %ss;
}}
"#
            )
        } else {
            format!(
                r#"{scale} %rd8, $r4, {size};
add.u64 %rd8, $r2, %rd8;
st.global.$t3 $r3, [%rd8];
"#,
                size = value_t.size()
            )
        };

        let ptr = self.register_input(VarType::Pointer, 1, data, target, false)?;
        let result = self.append(VarType::U32, stmt, &[ptr, value, index]);
        self.dec_ref_ext(ptr)?;
        let result = result?;
        self.mark_side_effect(result)?;
        self.mark_dirty(target)?;
        Ok(result)
    }
}

/// Returns the widening multiply turning an index operand into a byte
/// offset, or a template error for unsupported index types.
fn mul_wide(index_t: VarType) -> Result<&'static str> {
    match index_t {
        VarType::U32 => Ok("mul.wide.u32"),
        VarType::I32 => Ok("mul.wide.s32"),
        VarType::U64 | VarType::I64 => Ok("mul.lo.u64"),
        _ => Err(Error::template(format!(
            "gather/scatter indices must be 32- or 64-bit integers, got {index_t}"
        ))),
    }
}
