//! Integration tests for the tracing compiler.
//!
//! These tests drive the device-independent pipeline (tracing,
//! scheduling, PTX emission) on explicit [`Trace`] contexts; nothing
//! here needs a GPU. End-to-end execution lives in `gpu_tests.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use enoki_rs::{EdgeCallback, Error, Trace, VarType};

/// A fake device address; fine for tests that never launch.
const FAKE: u64 = 0x1000;

fn input(trace: &mut Trace, size: usize) -> u32 {
    trace
        .register_input(VarType::F32, size, FAKE + size as u64, 0, false)
        .unwrap()
}

#[test]
fn test_collection_cascade() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    let b = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r2", &[a]).unwrap();
    let c = trace.append(VarType::F32, "mul.$t1 $r1, $r2, $r2", &[b]).unwrap();
    let d = trace.append(VarType::F32, "sub.$t1 $r1, $r2, $r2", &[c]).unwrap();

    // Intermediate handles go away; internal references keep the chain.
    trace.dec_ref_ext(a).unwrap();
    trace.dec_ref_ext(b).unwrap();
    trace.dec_ref_ext(c).unwrap();
    assert_eq!(trace.len(), 4);

    // Releasing the head releases all four records.
    trace.dec_ref_ext(d).unwrap();
    assert!(trace.is_empty());
}

#[test]
fn test_shared_subexpression_released_once() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    let b = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r2", &[a]).unwrap();
    let c = trace.append(VarType::F32, "mul.$t1 $r1, $r2, $r2", &[a]).unwrap();

    trace.dec_ref_ext(a).unwrap();
    assert_eq!(trace.var(a).unwrap().ref_count_int, 2);

    trace.dec_ref_ext(b).unwrap();
    assert_eq!(trace.var(a).unwrap().ref_count_int, 1);

    trace.dec_ref_ext(c).unwrap();
    assert!(trace.is_empty());
}

#[test]
fn test_refcount_underflow_is_fatal() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    let _b = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r2", &[a]).unwrap();
    trace.dec_ref_ext(a).unwrap();
    // `a` is still pinned internally; a second external decrement is a
    // reference counting bug and must fail loudly.
    assert!(trace.dec_ref_ext(a).is_err());
}

#[test]
fn test_raw_barrier_forces_evaluation() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    trace.mark_dirty(a).unwrap();

    // Consuming a dirty operand must evaluate first; without a device
    // the forced evaluation reports the missing driver rather than
    // silently reading stale data.
    let err = trace
        .append(VarType::F32, "add.$t1 $r1, $r2, $r2", &[a])
        .unwrap_err();
    assert!(matches!(err, Error::CudaNotEnabled | Error::Driver(_)));
}

#[test]
fn test_compile_clears_dirty_then_appends_succeed() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    trace.mark_dirty(a).unwrap();
    let _ = trace.compile().unwrap();
    assert!(!trace.var(a).unwrap().dirty);

    // No barrier anymore.
    let b = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r2", &[a]).unwrap();
    assert_eq!(trace.var(b).unwrap().size, 4);
}

#[test]
fn test_common_subexpression_emitted_once() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    let sq = trace.append(VarType::F32, "mul.$t1 $r1, $r2, $r2", &[a]).unwrap();
    let _b = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r3", &[a, sq]).unwrap();
    let _c = trace.append(VarType::F32, "sub.$t1 $r1, $r2, $r3", &[a, sq]).unwrap();

    let kernels = trace.compile().unwrap();
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].ptx.matches("mul.f32").count(), 1);
}

#[test]
fn test_register_names_are_sequential() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    let mut cur = a;
    for _ in 0..3 {
        cur = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r2", &[cur]).unwrap();
    }
    let kernels = trace.compile().unwrap();
    let ptx = &kernels[0].ptx;

    // Input plus three operations occupy registers 10 through 13.
    for reg in 10..=13 {
        assert!(ptx.contains(&format!("%f{reg}")), "missing %f{reg}");
    }
    assert!(!ptx.contains("%f14"));
}

#[test]
fn test_bucket_shape_error() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    let _b = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r2", &[a]).unwrap();
    // Shrinking the operand after the fact makes the bucket inconsistent.
    trace.set_count(a, 3).unwrap_err();
    // A fresh non-materialized variable can be resized into
    // inconsistency instead.
    let k = trace.append(VarType::F32, "mov.$t1 $r1, 0f00000000", &[]).unwrap();
    let _c = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r3", &[a, k]).unwrap();
    trace.set_count(k, 3).unwrap();

    let err = trace.compile().unwrap_err();
    assert!(matches!(err, Error::BucketShape { size: 3, bucket: 4, .. }));
}

#[test]
fn test_scalar_use_is_merged_into_wide_bucket() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    let k = trace.append(VarType::F32, "mov.$t1 $r1, 0f40000000", &[]).unwrap();
    let c = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r3", &[a, k]).unwrap();
    assert_eq!(trace.var(c).unwrap().size, 4);

    // The scalar handle goes away; its only use is inside the 4-wide
    // kernel, so no 1-element kernel remains.
    trace.dec_ref_ext(k).unwrap();
    let kernels = trace.compile().unwrap();
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].size, 4);
    assert!(kernels[0].ptx.contains("mov.f32"));
}

#[test]
fn test_printf_survives_handle_drop_and_collects() {
    let mut trace = Trace::new();
    let p = trace.printf("done\n", &[]).unwrap();
    trace.dec_ref_ext(p).unwrap();

    let kernels = trace.compile().unwrap();
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].size, 1);
    assert!(kernels[0].ptx.contains("vprintf"));
    // The pin was consumed during emission and nothing else references
    // the variable.
    assert!(trace.var(p).is_err());
    assert!(trace.is_empty());
}

#[test]
fn test_scatter_kernel_stores_through_pointer() {
    let mut trace = Trace::new();
    let target = input(&mut trace, 8);
    let value = input(&mut trace, 4);
    let index = trace
        .register_input(VarType::U32, 4, FAKE + 99, 0, false)
        .unwrap();
    let s = trace.scatter(target, value, index).unwrap();
    trace.dec_ref_ext(s).unwrap();
    assert!(trace.var(target).unwrap().dirty);

    let kernels = trace.compile().unwrap();
    // The scatter runs over the 4 selected lanes, not the target width.
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].size, 4);
    assert!(kernels[0].ptx.contains("st.global.f32 %f"));
    assert!(!trace.var(target).unwrap().dirty);
}

#[test]
fn test_gather_does_not_schedule_the_source() {
    let mut trace = Trace::new();
    let source = input(&mut trace, 8);
    let index = trace
        .register_input(VarType::U32, 4, FAKE + 99, 0, false)
        .unwrap();
    let g = trace.gather(source, index).unwrap();
    assert_eq!(trace.var(g).unwrap().size, 4);

    let kernels = trace.compile().unwrap();
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].size, 4);
    assert!(kernels[0].ptx.contains("ld.global.f32"));
    assert!(kernels[0].ptx.contains("mul.wide.u32 %rd8, %r"));
}

#[test]
fn test_evaluate_without_device_is_a_driver_error() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    let _b = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r2", &[a]).unwrap();
    let err = trace.evaluate().unwrap_err();
    assert!(matches!(err, Error::CudaNotEnabled | Error::Driver(_)));
}

#[test]
fn test_evaluate_with_nothing_pending_is_a_no_op() {
    let mut trace = Trace::new();
    trace.evaluate().unwrap();

    // Materialized inputs alone schedule nothing either.
    let _a = input(&mut trace, 4);
    trace.evaluate().unwrap();
}

#[test]
fn test_comment_appears_in_listing() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    let b = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r2", &[a]).unwrap();
    trace.attach_comment(b, "twice a").unwrap();

    let kernels = trace.compile().unwrap();
    assert!(kernels[0].ptx.contains("// twice a"));
}

#[test]
fn test_template_errors_are_fatal() {
    let mut trace = Trace::new();
    let bad = trace.append(VarType::F32, "mov.$q1 $r1, 0f0", &[]).unwrap();
    assert!(matches!(trace.compile(), Err(Error::Template(_))));
    // The trace stays usable for inspection.
    assert!(trace.var(bad).is_ok());
}

struct DropProbe {
    released: Arc<AtomicBool>,
}

impl EdgeCallback for DropProbe {
    fn on_forward(&mut self) {}
    fn on_backward(&mut self) {}
}

impl Drop for DropProbe {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_callback_released_with_variable() {
    let released = Arc::new(AtomicBool::new(false));
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    trace
        .attach_callback(a, Box::new(DropProbe { released: released.clone() }))
        .unwrap();

    assert!(!released.load(Ordering::SeqCst));
    trace.dec_ref_ext(a).unwrap();
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn test_subtree_sizes_accumulate() {
    let mut trace = Trace::new();
    let a = input(&mut trace, 4);
    let b = input(&mut trace, 4);
    let ab = trace.append(VarType::F32, "add.$t1 $r1, $r2, $r3", &[a, b]).unwrap();
    let sq = trace.append(VarType::F32, "mul.$t1 $r1, $r2, $r2", &[ab]).unwrap();
    let top = trace
        .append(VarType::F32, "fma.rn.$t1 $r1, $r2, $r3, $r4", &[sq, ab, a])
        .unwrap();

    assert_eq!(trace.var(ab).unwrap().subtree_size, 3);
    assert_eq!(trace.var(sq).unwrap().subtree_size, 4);
    assert_eq!(trace.var(top).unwrap().subtree_size, 1 + 4 + 3 + 1);
}
