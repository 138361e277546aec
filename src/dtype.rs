//! Element type definitions and the PTX type registry.

use std::fmt;

/// Element type of a traced variable.
///
/// The set is closed: every type the code generator can place in a
/// register has an entry here. `Pointer` shares the encoding of `U64`
/// and is used for variables whose value is a device address.
/// `Invalid` marks reserved placeholder slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VarType {
    /// 8-bit signed integer
    I8,
    /// 8-bit unsigned integer
    U8,
    /// 16-bit signed integer
    I16,
    /// 16-bit unsigned integer
    U16,
    /// 32-bit signed integer
    I32,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit signed integer
    I64,
    /// 64-bit unsigned integer
    U64,
    /// 16-bit floating point
    F16,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
    /// Boolean (predicate register, stored as 1 byte)
    Bool,
    /// Device pointer (encoded as a 64-bit unsigned integer)
    Pointer,
    /// Placeholder for reserved slots
    Invalid,
}

impl VarType {
    /// Returns the storage width of this type in bytes.
    ///
    /// `Bool` values compute in predicate registers but are stored as
    /// one byte. `Invalid` reports zero.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            VarType::I8 | VarType::U8 | VarType::Bool => 1,
            VarType::I16 | VarType::U16 | VarType::F16 => 2,
            VarType::I32 | VarType::U32 | VarType::F32 => 4,
            VarType::I64 | VarType::U64 | VarType::F64 | VarType::Pointer => 8,
            VarType::Invalid => 0,
        }
    }

    /// Returns the PTX type token, as substituted for `$t` placeholders.
    #[inline]
    pub const fn ptx_type(self) -> &'static str {
        match self {
            VarType::I8 => "s8",
            VarType::U8 => "u8",
            VarType::I16 => "s16",
            VarType::U16 => "u16",
            VarType::I32 => "s32",
            VarType::U32 => "u32",
            VarType::I64 => "s64",
            VarType::U64 | VarType::Pointer => "u64",
            VarType::F16 => "f16",
            VarType::F32 => "f32",
            VarType::F64 => "f64",
            VarType::Bool => "pred",
            VarType::Invalid => "???",
        }
    }

    /// Returns the PTX binary type token, as substituted for `$b` placeholders.
    #[inline]
    pub const fn ptx_bin(self) -> &'static str {
        match self {
            VarType::I8 | VarType::U8 => "b8",
            VarType::I16 | VarType::U16 | VarType::F16 => "b16",
            VarType::I32 | VarType::U32 | VarType::F32 => "b32",
            VarType::I64 | VarType::U64 | VarType::F64 | VarType::Pointer => "b64",
            VarType::Bool => "pred",
            VarType::Invalid => "???",
        }
    }

    /// Returns the PTX register name prefix for this type.
    ///
    /// A variable assigned register index `i` computes in the register
    /// named `prefix` followed by `i` (e.g. `%f10` for an `F32` value).
    /// The `%b` file used by the 8-bit types is declared 16 bits wide
    /// in the emitted kernels; PTX has no 8-bit register file, and
    /// sub-word loads and stores go through 16-bit registers.
    #[inline]
    pub const fn reg_prefix(self) -> &'static str {
        match self {
            VarType::I8 | VarType::U8 => "%b",
            VarType::I16 | VarType::U16 => "%w",
            VarType::I32 | VarType::U32 => "%r",
            VarType::I64 | VarType::U64 | VarType::Pointer => "%rd",
            VarType::F16 => "%h",
            VarType::F32 => "%f",
            VarType::F64 => "%d",
            VarType::Bool => "%p",
            VarType::Invalid => "%_",
        }
    }

    /// Returns true if this is a floating-point type.
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, VarType::F16 | VarType::F32 | VarType::F64)
    }

    /// Returns true if this is a signed or unsigned integer type.
    #[inline]
    pub const fn is_int(self) -> bool {
        matches!(
            self,
            VarType::I8
                | VarType::I16
                | VarType::I32
                | VarType::I64
                | VarType::U8
                | VarType::U16
                | VarType::U32
                | VarType::U64
        )
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarType::I8 => "i8",
            VarType::U8 => "u8",
            VarType::I16 => "i16",
            VarType::U16 => "u16",
            VarType::I32 => "i32",
            VarType::U32 => "u32",
            VarType::I64 => "i64",
            VarType::U64 => "u64",
            VarType::F16 => "f16",
            VarType::F32 => "f32",
            VarType::F64 => "f64",
            VarType::Bool => "bool",
            VarType::Pointer => "ptr",
            VarType::Invalid => "invalid",
        };
        f.write_str(name)
    }
}
