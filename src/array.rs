//! Typed array handles over the trace.
//!
//! A [`CudaArray`] wraps one trace variable; cloning and dropping a
//! handle mirror the variable's external reference count, so handle
//! lifetime is exactly what keeps results alive across evaluations.
//! Every operation appends a single PTX instruction template to the
//! process-wide trace.

use std::marker::PhantomData;

use log::error;

use crate::backend::cuda::CudaContext;
use crate::dtype::VarType;
use crate::error::Result;
use crate::trace;

/// Scalar element types storable in a [`CudaArray`].
pub trait Scalar: Copy + Default + 'static {
    /// Element type tag of this scalar.
    const VAR_TYPE: VarType;
    /// Instruction template materializing `self` as a literal.
    fn literal_stmt(self) -> String;
    /// Appends the little-endian encoding of `self`.
    fn to_bytes(self, out: &mut Vec<u8>);
    /// Decodes a value from its little-endian encoding.
    fn from_bytes(bytes: &[u8]) -> Self;
}

/// Floating-point scalars, for operations with no integer counterpart.
pub trait Float: Scalar {}

impl Scalar for f32 {
    const VAR_TYPE: VarType = VarType::F32;
    fn literal_stmt(self) -> String {
        format!("mov.$t1 $r1, 0f{:08X}", self.to_bits())
    }
    fn to_bytes(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn from_bytes(bytes: &[u8]) -> Self {
        f32::from_le_bytes(bytes.try_into().expect("f32 needs 4 bytes"))
    }
}

impl Scalar for f64 {
    const VAR_TYPE: VarType = VarType::F64;
    fn literal_stmt(self) -> String {
        format!("mov.$t1 $r1, 0d{:016X}", self.to_bits())
    }
    fn to_bytes(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn from_bytes(bytes: &[u8]) -> Self {
        f64::from_le_bytes(bytes.try_into().expect("f64 needs 8 bytes"))
    }
}

impl Scalar for i32 {
    const VAR_TYPE: VarType = VarType::I32;
    fn literal_stmt(self) -> String {
        format!("mov.$t1 $r1, {self}")
    }
    fn to_bytes(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn from_bytes(bytes: &[u8]) -> Self {
        i32::from_le_bytes(bytes.try_into().expect("i32 needs 4 bytes"))
    }
}

impl Scalar for u32 {
    const VAR_TYPE: VarType = VarType::U32;
    fn literal_stmt(self) -> String {
        format!("mov.$t1 $r1, {self}")
    }
    fn to_bytes(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn from_bytes(bytes: &[u8]) -> Self {
        u32::from_le_bytes(bytes.try_into().expect("u32 needs 4 bytes"))
    }
}

impl Scalar for u64 {
    const VAR_TYPE: VarType = VarType::U64;
    fn literal_stmt(self) -> String {
        format!("mov.$t1 $r1, {self}")
    }
    fn to_bytes(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn from_bytes(bytes: &[u8]) -> Self {
        u64::from_le_bytes(bytes.try_into().expect("u64 needs 8 bytes"))
    }
}

impl Scalar for bool {
    const VAR_TYPE: VarType = VarType::Bool;
    fn literal_stmt(self) -> String {
        format!("setp.ne.u32 $r1, {}, 0", u32::from(self))
    }
    fn to_bytes(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }
    fn from_bytes(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl Float for f32 {}
impl Float for f64 {}

/// A lazily evaluated device array of `T`.
pub struct CudaArray<T: Scalar> {
    index: u32,
    marker: PhantomData<T>,
}

impl<T: Scalar> CudaArray<T> {
    /// Wraps an index whose external reference the handle takes over.
    pub(crate) fn steal(index: u32) -> Self {
        Self { index, marker: PhantomData }
    }

    /// The trace index of this array.
    pub fn id(&self) -> u32 {
        self.index
    }

    /// Uploads host values into a fresh device buffer and publishes it
    /// as an input variable.
    pub fn from_slice(values: &[T]) -> Result<Self> {
        let mut bytes = Vec::with_capacity(values.len() * T::VAR_TYPE.size());
        for &v in values {
            v.to_bytes(&mut bytes);
        }
        let mut t = trace();
        let ptr = t.managed_alloc(bytes.len())?;
        if let Err(err) = CudaContext::get()?.copy_to_device(ptr, &bytes) {
            let _ = t.managed_free(ptr);
            return Err(err);
        }
        let index = t.register_input(T::VAR_TYPE, values.len(), ptr, 0, true)?;
        Ok(Self::steal(index))
    }

    /// A broadcast scalar.
    pub fn literal(value: T) -> Result<Self> {
        trace()
            .append(T::VAR_TYPE, value.literal_stmt(), &[])
            .map(Self::steal)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        trace().var(self.index).map(|v| v.size).unwrap_or(0)
    }

    /// True for zero-element arrays.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attaches a diagnostic comment carried into the PTX listing.
    pub fn comment(self, text: &str) -> Result<Self> {
        trace().attach_comment(self.index, text)?;
        Ok(self)
    }

    /// Forces evaluation of the whole trace.
    pub fn eval(&self) -> Result<()> {
        trace().evaluate()
    }

    /// Reads one element back, evaluating first if needed.
    pub fn read(&self, index: usize) -> Result<T> {
        let mut bytes = vec![0u8; T::VAR_TYPE.size()];
        trace().fetch_element(self.index, index, &mut bytes)?;
        Ok(T::from_bytes(&bytes))
    }

    /// Copies the whole array back to the host, evaluating first if
    /// needed.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let size = T::VAR_TYPE.size();
        let mut bytes = vec![0u8; self.len() * size];
        trace().fetch_element(self.index, 0, &mut bytes)?;
        Ok(bytes.chunks_exact(size).map(T::from_bytes).collect())
    }

    /// Reads lanes of `self` at the positions in `index`.
    pub fn gather(&self, index: &CudaArray<u32>) -> Result<Self> {
        trace().gather(self.index, index.index).map(Self::steal)
    }

    /// Writes `value` into lanes of `self` at the positions in
    /// `index`, leaving `self` dirty until the next evaluation.
    pub fn scatter(&self, value: &Self, index: &CudaArray<u32>) -> Result<()> {
        let mut t = trace();
        let s = t.scatter(self.index, value.index, index.index)?;
        t.dec_ref_ext(s)
    }

    fn unary(&self, stmt: &str) -> Result<Self> {
        trace()
            .append(T::VAR_TYPE, stmt, &[self.index])
            .map(Self::steal)
    }

    fn binary(&self, stmt: &str, other: &Self) -> Result<Self> {
        trace()
            .append(T::VAR_TYPE, stmt, &[self.index, other.index])
            .map(Self::steal)
    }

    fn compare(&self, stmt: &str, other: &Self) -> Result<CudaArray<bool>> {
        trace()
            .append(VarType::Bool, stmt, &[self.index, other.index])
            .map(CudaArray::steal)
    }

    /// Elementwise sum.
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.binary("add.$t1 $r1, $r2, $r3", other)
    }

    /// Elementwise difference.
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.binary("sub.$t1 $r1, $r2, $r3", other)
    }

    /// Elementwise minimum.
    pub fn min(&self, other: &Self) -> Result<Self> {
        self.binary("min.$t1 $r1, $r2, $r3", other)
    }

    /// Elementwise maximum.
    pub fn max(&self, other: &Self) -> Result<Self> {
        self.binary("max.$t1 $r1, $r2, $r3", other)
    }

    /// Elementwise equality.
    pub fn eq(&self, other: &Self) -> Result<CudaArray<bool>> {
        self.compare("setp.eq.$t2 $r1, $r2, $r3", other)
    }

    /// Elementwise less-than.
    pub fn lt(&self, other: &Self) -> Result<CudaArray<bool>> {
        self.compare("setp.lt.$t2 $r1, $r2, $r3", other)
    }

    /// Elementwise greater-than.
    pub fn gt(&self, other: &Self) -> Result<CudaArray<bool>> {
        self.compare("setp.gt.$t2 $r1, $r2, $r3", other)
    }
}

impl<T: Float> CudaArray<T> {
    /// Elementwise product.
    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.binary("mul.$t1 $r1, $r2, $r3", other)
    }

    /// Elementwise quotient (round to nearest).
    pub fn div(&self, other: &Self) -> Result<Self> {
        self.binary("div.rn.$t1 $r1, $r2, $r3", other)
    }

    /// Elementwise negation.
    pub fn neg(&self) -> Result<Self> {
        self.unary("neg.$t1 $r1, $r2")
    }

    /// Elementwise square root.
    pub fn sqrt(&self) -> Result<Self> {
        self.unary("sqrt.rn.$t1 $r1, $r2")
    }

    /// Fused multiply-add `self * b + c`.
    pub fn fma(&self, b: &Self, c: &Self) -> Result<Self> {
        trace()
            .append(
                T::VAR_TYPE,
                "fma.rn.$t1 $r1, $r2, $r3, $r4",
                &[self.index, b.index, c.index],
            )
            .map(Self::steal)
    }
}

impl CudaArray<i32> {
    /// Elementwise product (low 32 bits).
    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.binary("mul.lo.$t1 $r1, $r2, $r3", other)
    }
}

impl CudaArray<u32> {
    /// Elementwise product (low 32 bits).
    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.binary("mul.lo.$t1 $r1, $r2, $r3", other)
    }

    /// The lane index sequence `0, 1, …, n - 1`.
    ///
    /// Reads the reserved lane register, so the variable costs a single
    /// `mov` in the kernel it lands in.
    pub fn arange(n: usize) -> Result<Self> {
        let mut t = trace();
        let index = t.append(VarType::U32, "mov.$t1 $r1, $r2", &[2])?;
        t.set_count(index, n)?;
        Ok(Self::steal(index))
    }
}

impl CudaArray<bool> {
    /// Logical conjunction.
    pub fn and(&self, other: &Self) -> Result<Self> {
        self.binary("and.$t1 $r1, $r2, $r3", other)
    }

    /// Logical disjunction.
    pub fn or(&self, other: &Self) -> Result<Self> {
        self.binary("or.$t1 $r1, $r2, $r3", other)
    }

    /// Logical negation.
    pub fn not(&self) -> Result<Self> {
        self.unary("not.$t1 $r1, $r2")
    }

    /// Lane-wise selection: `t` where `self` holds, `f` elsewhere.
    pub fn select<T: Scalar>(
        &self,
        t: &CudaArray<T>,
        f: &CudaArray<T>,
    ) -> Result<CudaArray<T>> {
        trace()
            .append(
                T::VAR_TYPE,
                "selp.$t1 $r1, $r2, $r3, $r4",
                &[t.index, f.index, self.index],
            )
            .map(CudaArray::steal)
    }
}

impl<T: Scalar> Clone for CudaArray<T> {
    fn clone(&self) -> Self {
        trace().inc_ref_ext(self.index);
        Self::steal(self.index)
    }
}

impl<T: Scalar> Drop for CudaArray<T> {
    fn drop(&mut self) {
        if let Err(err) = trace().dec_ref_ext(self.index) {
            error!("dropping array handle {}: {err}", self.index);
        }
    }
}
