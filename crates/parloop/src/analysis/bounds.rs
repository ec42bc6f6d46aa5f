use std::collections::{BTreeSet, HashMap, HashSet};

use smallvec::SmallVec;

use crate::analysis::accesses::CollectedAccesses;
use crate::error::{OffloadError, Result};
use crate::hashing::{fnv1a_bytes, fnv1a_init};
use crate::ir::program::{BinOp, Expr, LoopLevel, Stmt, UnOp};
use crate::ir::types::Literal;
use crate::symbols::Bindings;

/// One parallel level with its range pinned to the values bound for the
/// current call. Ranges follow counted-loop semantics: `start` inclusive,
/// `stop` exclusive, `step` nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl ResolvedRange {
    pub fn count(&self) -> i64 {
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let trips = if step > 0 {
            (stop - start + step - 1).div_euclid(step)
        } else {
            (start - stop + (-step) - 1).div_euclid(-step)
        };
        trips.max(0) as i64
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Value of the induction variable on the final trip.
    pub fn last(&self) -> Option<i64> {
        let count = self.count();
        if count == 0 {
            None
        } else {
            Some(self.start + (count - 1) * self.step)
        }
    }
}

/// Evaluate one level's range expressions against the bound scalars.
pub fn resolve_range(level: &LoopLevel, bindings: &Bindings) -> Result<ResolvedRange> {
    let start = const_value(&level.start, bindings)?;
    let stop = const_value(&level.stop, bindings)?;
    let step = const_value(&level.step, bindings)?;
    if step == 0 {
        return Err(OffloadError::unsupported(
            "range resolution",
            format!("loop over '{}' has step zero", level.var),
        ));
    }
    Ok(ResolvedRange { start, stop, step })
}

pub fn resolve_ranges(levels: &[LoopLevel], bindings: &Bindings) -> Result<Vec<ResolvedRange>> {
    levels.iter().map(|l| resolve_range(l, bindings)).collect()
}

/// Constant-fold a range expression. Only constants, bound integer scalars
/// and integer arithmetic over them qualify.
fn const_value(expr: &Expr, bindings: &Bindings) -> Result<i64> {
    let fail = |reason: String| OffloadError::unsupported("range resolution", reason);
    match expr {
        Expr::Const(lit) => lit
            .as_i64()
            .ok_or_else(|| fail(format!("range bound {lit} is not an integer"))),
        Expr::Scalar(name) => bindings.scalar(name)?.as_i64().ok_or_else(|| {
            fail(format!("range bound scalar '{name}' is not an integer"))
        }),
        Expr::Unary {
            op: UnOp::Neg,
            operand,
        } => {
            let v = const_value(operand, bindings)?;
            v.checked_neg()
                .ok_or_else(|| OffloadError::overflow("range bound negation overflows"))
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = const_value(lhs, bindings)?;
            let r = const_value(rhs, bindings)?;
            let folded = match op {
                BinOp::Add => l.checked_add(r),
                BinOp::Sub => l.checked_sub(r),
                BinOp::Mul => l.checked_mul(r),
                _ => {
                    return Err(fail(format!(
                        "range bound uses operator {}",
                        op.symbol()
                    )))
                }
            };
            folded.ok_or_else(|| OffloadError::overflow("range bound arithmetic overflows"))
        }
        Expr::Cast { to, operand } if to.is_integer() => const_value(operand, bindings),
        _ => Err(fail(
            "range bound is not a constant over call scalars".to_string(),
        )),
    }
}

/// Per-access outcome of static bound analysis. Function bodies are not
/// covered here; accesses inside called functions always carry runtime
/// checks in generated code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundReport {
    /// Walk ids whose index could not be proven inside the extents.
    pub checked: BTreeSet<u32>,
    /// Walk ids proven in range for the current call values.
    pub proven: BTreeSet<u32>,
}

impl BoundReport {
    pub fn all_proven(&self) -> bool {
        self.checked.is_empty()
    }

    pub fn needs_check(&self, id: u32) -> bool {
        self.checked.contains(&id)
    }

    /// Stable digest of the checked set, part of the kernel cache key.
    pub fn signature(&self) -> u64 {
        let mut h = fnv1a_init();
        for id in &self.checked {
            h = fnv1a_bytes(h, &id.to_le_bytes());
        }
        h
    }
}

/// Conservative integer interval. `Empty` marks code that cannot execute
/// for the current call values; `Unknown` admits any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Iv {
    Empty,
    Known { lo: i64, hi: i64 },
    Unknown,
}

impl Iv {
    fn point(v: i64) -> Iv {
        Iv::Known { lo: v, hi: v }
    }

    fn add(self, other: Iv) -> Iv {
        match (self, other) {
            (Iv::Empty, _) | (_, Iv::Empty) => Iv::Empty,
            (Iv::Known { lo: a, hi: b }, Iv::Known { lo: c, hi: d }) => {
                match (a.checked_add(c), b.checked_add(d)) {
                    (Some(lo), Some(hi)) => Iv::Known { lo, hi },
                    _ => Iv::Unknown,
                }
            }
            _ => Iv::Unknown,
        }
    }

    fn neg(self) -> Iv {
        match self {
            Iv::Empty => Iv::Empty,
            Iv::Known { lo, hi } => match (hi.checked_neg(), lo.checked_neg()) {
                (Some(lo), Some(hi)) => Iv::Known { lo, hi },
                _ => Iv::Unknown,
            },
            Iv::Unknown => Iv::Unknown,
        }
    }

    fn sub(self, other: Iv) -> Iv {
        self.add(other.neg())
    }

    fn mul(self, other: Iv) -> Iv {
        match (self, other) {
            (Iv::Empty, _) | (_, Iv::Empty) => Iv::Empty,
            (Iv::Known { lo: a, hi: b }, Iv::Known { lo: c, hi: d }) => {
                let products = [
                    a.checked_mul(c),
                    a.checked_mul(d),
                    b.checked_mul(c),
                    b.checked_mul(d),
                ];
                let mut lo = i64::MAX;
                let mut hi = i64::MIN;
                for p in products {
                    match p {
                        Some(v) => {
                            lo = lo.min(v);
                            hi = hi.max(v);
                        }
                        None => return Iv::Unknown,
                    }
                }
                Iv::Known { lo, hi }
            }
            _ => Iv::Unknown,
        }
    }

    /// Floored modulo with a strictly positive divisor lands in
    /// `[0, divisor-1]`; anything else is unconstrained.
    fn rem(self, divisor: Iv) -> Iv {
        match (self, divisor) {
            (Iv::Empty, _) | (_, Iv::Empty) => Iv::Empty,
            (_, Iv::Known { lo, hi }) if lo >= 1 => Iv::Known { lo: 0, hi: hi - 1 },
            _ => Iv::Unknown,
        }
    }

    fn union(self, other: Iv) -> Iv {
        match (self, other) {
            (Iv::Empty, x) | (x, Iv::Empty) => x,
            (Iv::Known { lo: a, hi: b }, Iv::Known { lo: c, hi: d }) => Iv::Known {
                lo: a.min(c),
                hi: b.max(d),
            },
            _ => Iv::Unknown,
        }
    }
}

struct Scope<'a> {
    vars: HashMap<String, Iv>,
    bindings: &'a Bindings,
    assigned: &'a HashSet<String>,
    declared: &'a HashSet<String>,
}

impl Scope<'_> {
    fn scalar_iv(&self, name: &str) -> Iv {
        if let Some(iv) = self.vars.get(name) {
            return *iv;
        }
        if self.assigned.contains(name) || self.declared.contains(name) {
            return Iv::Unknown;
        }
        match self.bindings.scalar(name) {
            Ok(lit) => lit.as_i64().map(Iv::point).unwrap_or(Iv::Unknown),
            Err(_) => Iv::Unknown,
        }
    }

    /// Sibling loops may reuse an induction name; the stored interval is
    /// the union over every loop using it.
    fn insert_var(&mut self, name: &str, iv: Iv) {
        let merged = match self.vars.get(name) {
            Some(existing) => existing.union(iv),
            None => iv,
        };
        self.vars.insert(name.to_string(), merged);
    }
}

fn interval(expr: &Expr, scope: &Scope<'_>) -> Iv {
    match expr {
        Expr::Const(Literal::I32(v)) => Iv::point(i64::from(*v)),
        Expr::Const(Literal::I64(v)) => Iv::point(*v),
        Expr::Const(_) => Iv::Unknown,
        Expr::Scalar(name) => scope.scalar_iv(name),
        Expr::Unary {
            op: UnOp::Neg,
            operand,
        } => interval(operand, scope).neg(),
        Expr::Unary { op: UnOp::Not, .. } => Iv::Unknown,
        Expr::Binary { op, lhs, rhs } => {
            let l = interval(lhs, scope);
            let r = interval(rhs, scope);
            match op {
                BinOp::Add => l.add(r),
                BinOp::Sub => l.sub(r),
                BinOp::Mul => l.mul(r),
                BinOp::Mod => l.rem(r),
                _ => Iv::Unknown,
            }
        }
        Expr::Cast { to, operand } if to.is_integer() => interval(operand, scope),
        Expr::Cast { .. } | Expr::Load { .. } | Expr::Math { .. } | Expr::Call { .. } => {
            Iv::Unknown
        }
    }
}

/// Derive the interval an inner sequential loop's variable ranges over.
fn seq_var_interval(start: Iv, stop: Iv, step: &Expr, scope: &Scope<'_>) -> Iv {
    let step_iv = interval(step, scope);
    let ascending = |start: Iv, stop: Iv| match (start, stop) {
        (Iv::Known { lo: a, .. }, Iv::Known { hi: d, .. }) => {
            if a >= d {
                Iv::Empty
            } else {
                Iv::Known { lo: a, hi: d - 1 }
            }
        }
        (Iv::Empty, _) | (_, Iv::Empty) => Iv::Empty,
        _ => Iv::Unknown,
    };
    let descending = |start: Iv, stop: Iv| match (start, stop) {
        (Iv::Known { hi: b, .. }, Iv::Known { lo: c, .. }) => {
            if b <= c {
                Iv::Empty
            } else {
                Iv::Known { lo: c + 1, hi: b }
            }
        }
        (Iv::Empty, _) | (_, Iv::Empty) => Iv::Empty,
        _ => Iv::Unknown,
    };
    match step_iv {
        Iv::Known { lo, .. } if lo >= 1 => ascending(start, stop),
        Iv::Known { hi, .. } if hi <= -1 => descending(start, stop),
        Iv::Known { lo, hi } if lo == 0 && hi == 0 => Iv::Unknown,
        Iv::Empty => Iv::Empty,
        _ => ascending(start, stop).union(descending(start, stop)),
    }
}

/// Populate sequential-loop variable intervals, outer loops before the
/// loops they enclose.
fn collect_seq_vars(body: &[Stmt], scope: &mut Scope<'_>) {
    for stmt in body {
        match stmt {
            Stmt::For {
                var,
                start,
                stop,
                step,
                body,
            } => {
                let iv = seq_var_interval(
                    interval(start, scope),
                    interval(stop, scope),
                    step,
                    scope,
                );
                scope.insert_var(var, iv);
                collect_seq_vars(body, scope);
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                collect_seq_vars(then_body, scope);
                collect_seq_vars(else_body, scope);
            }
            Stmt::While { body, .. } => collect_seq_vars(body, scope),
            _ => {}
        }
    }
}

/// Compare every collected access against the extents of its bound array.
///
/// Three outcomes per access: proven in range for the current values, not
/// provable and flagged for a runtime check, or provably outside on every
/// iteration, which fails the whole analysis. A flagged access that never
/// violates at runtime costs one device-side comparison; a missed violation
/// is never acceptable, so every approximation here widens.
pub fn analyze_bounds(
    body: &[Stmt],
    accesses: &CollectedAccesses,
    level_vars: &[String],
    ranges: &[ResolvedRange],
    bindings: &Bindings,
) -> Result<BoundReport> {
    debug_assert_eq!(level_vars.len(), ranges.len());
    let mut report = BoundReport::default();
    if ranges.iter().any(|r| r.is_empty()) {
        return Ok(report);
    }

    let mut scope = Scope {
        vars: HashMap::new(),
        bindings,
        assigned: &accesses.assigned_scalars,
        declared: &accesses.declared_scalars,
    };
    for (var, range) in level_vars.iter().zip(ranges) {
        let last = match range.last() {
            Some(last) => last,
            None => return Ok(report),
        };
        scope.insert_var(
            var,
            Iv::Known {
                lo: range.start.min(last),
                hi: range.start.max(last),
            },
        );
    }
    collect_seq_vars(body, &mut scope);

    let mut extents: HashMap<&str, SmallVec<[usize; 3]>> = HashMap::new();
    for access in &accesses.accesses {
        if !extents.contains_key(access.array.as_str()) {
            let data = bindings.array(&access.array)?.lock();
            if data.dims.len() != access.index.len() {
                return Err(OffloadError::unsupported(
                    "bound analysis",
                    format!(
                        "'{}' is declared rank {} but bound to rank {} data",
                        access.array,
                        access.index.len(),
                        data.dims.len()
                    ),
                ));
            }
            extents.insert(access.array.as_str(), data.dims.clone());
        }
    }

    for access in &accesses.accesses {
        let dims = &extents[access.array.as_str()];
        let mut proven = true;
        for (dim, idx) in access.index.iter().enumerate() {
            let extent = dims[dim] as i64;
            match interval(idx, &scope) {
                Iv::Empty => {}
                Iv::Known { lo, hi } => {
                    if hi < 0 || lo >= extent {
                        return Err(OffloadError::bound(
                            &access.array,
                            format!(
                                "index {dim} spans [{lo}, {hi}] on every iteration, extent is {extent}"
                            ),
                        ));
                    }
                    if lo < 0 || hi >= extent {
                        proven = false;
                    }
                }
                Iv::Unknown => proven = false,
            }
        }
        if proven {
            report.proven.insert(access.id);
        } else {
            report.checked.insert(access.id);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::accesses::collect;
    use crate::ir::types::ScalarType;
    use crate::symbols::{ArrayData, ArrayRef, SymbolTable};

    fn vec_bindings(len: usize, names: &[&str]) -> Bindings {
        let mut table = SymbolTable::new().scalar("n", ScalarType::I64);
        for name in names {
            table = table.array(*name, ScalarType::F64, 1);
        }
        let mut bindings = Bindings::for_table(&table);
        bindings.set_scalar("n", Literal::I64(len as i64)).unwrap();
        for name in names {
            bindings
                .set_array(
                    name,
                    ArrayRef::new(ArrayData::zeros(ScalarType::F64, [len].as_slice())),
                )
                .unwrap();
        }
        bindings
    }

    fn full_range(len: i64) -> Vec<ResolvedRange> {
        vec![ResolvedRange {
            start: 0,
            stop: len,
            step: 1,
        }]
    }

    fn level_i() -> Vec<String> {
        vec!["i".to_string()]
    }

    #[test]
    fn range_counts_match_counted_loop_semantics() {
        let cases = [
            (0, 10, 1, 10),
            (0, 10, 3, 4),
            (10, 0, -1, 10),
            (10, 0, -3, 4),
            (5, 5, 1, 0),
            (5, 0, 1, 0),
        ];
        for (start, stop, step, count) in cases {
            let r = ResolvedRange { start, stop, step };
            assert_eq!(r.count(), count, "range({start},{stop},{step})");
        }
        assert_eq!(
            ResolvedRange {
                start: 0,
                stop: 10,
                step: 3
            }
            .last(),
            Some(9)
        );
    }

    #[test]
    fn in_range_accesses_are_proven() {
        let body = vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::load("x", vec![Expr::scalar("i")]),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = vec_bindings(16, &["x", "y"]);
        let report =
            analyze_bounds(&body, &accesses, &level_i(), &full_range(16), &bindings).unwrap();
        assert!(report.all_proven());
        assert_eq!(report.proven.len(), 2);
    }

    #[test]
    fn shifted_access_needs_a_runtime_check() {
        // y[i+1] reaches one past the extent on the last iteration only if
        // the range runs to the full extent; the analysis cannot prove it.
        let body = vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::add(Expr::scalar("i"), Expr::i64(1))],
            value: Expr::f64(0.0),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = vec_bindings(16, &["y"]);
        let report = analyze_bounds(
            &body,
            &accesses,
            &level_i(),
            &full_range(15),
            &bindings,
        )
        .unwrap();
        assert!(report.all_proven());
        let report =
            analyze_bounds(&body, &accesses, &level_i(), &full_range(16), &bindings).unwrap();
        assert!(report.needs_check(0));
    }

    #[test]
    fn fully_outside_access_is_a_definite_violation() {
        let body = vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::add(Expr::scalar("i"), Expr::scalar("n"))],
            value: Expr::f64(0.0),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = vec_bindings(8, &["y"]);
        let err = analyze_bounds(&body, &accesses, &level_i(), &full_range(8), &bindings)
            .unwrap_err();
        assert!(matches!(err, OffloadError::BoundViolation { .. }));
    }

    #[test]
    fn indirect_read_is_flagged_not_rejected() {
        // y[i] = x[idx[i]]: the gather index is data-dependent.
        let mut table = SymbolTable::new().scalar("n", ScalarType::I64);
        table = table
            .array("x", ScalarType::F64, 1)
            .array("y", ScalarType::F64, 1)
            .array("idx", ScalarType::I64, 1);
        let mut bindings = Bindings::for_table(&table);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings
            .set_array("idx", ArrayRef::new(ArrayData::from_i64(vec![3, 2, 1, 0])))
            .unwrap();
        for name in ["x", "y"] {
            bindings
                .set_array(
                    name,
                    ArrayRef::new(ArrayData::zeros(ScalarType::F64, [4usize].as_slice())),
                )
                .unwrap();
        }
        let body = vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::load("x", vec![Expr::load("idx", vec![Expr::scalar("i")])]),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let report =
            analyze_bounds(&body, &accesses, &level_i(), &full_range(4), &bindings).unwrap();
        // idx[i] itself is proven, x[idx[i]] is not.
        assert!(report.needs_check(1));
        assert!(report.proven.contains(&0));
        assert!(report.proven.contains(&2));
    }

    #[test]
    fn modulo_wrap_is_proven() {
        let body = vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::binary(
                BinOp::Mod,
                Expr::add(Expr::scalar("i"), Expr::i64(5)),
                Expr::scalar("n"),
            )],
            value: Expr::f64(0.0),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = vec_bindings(8, &["y"]);
        let report =
            analyze_bounds(&body, &accesses, &level_i(), &full_range(8), &bindings).unwrap();
        assert!(report.all_proven());
    }

    #[test]
    fn triangular_inner_loop_is_tracked() {
        // for j in i..n: y[j] stays inside the extent.
        let body = vec![Stmt::For {
            var: "j".into(),
            start: Expr::scalar("i"),
            stop: Expr::scalar("n"),
            step: Expr::i64(1),
            body: vec![Stmt::Store {
                array: "y".into(),
                index: vec![Expr::scalar("j")],
                value: Expr::f64(0.0),
            }],
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = vec_bindings(8, &["y"]);
        let report =
            analyze_bounds(&body, &accesses, &level_i(), &full_range(8), &bindings).unwrap();
        assert!(report.all_proven());
    }

    #[test]
    fn empty_ranges_short_circuit() {
        let body = vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("n")],
            value: Expr::f64(0.0),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = vec_bindings(8, &["y"]);
        let report = analyze_bounds(
            &body,
            &accesses,
            &level_i(),
            &[ResolvedRange {
                start: 0,
                stop: 0,
                step: 1,
            }],
            &bindings,
        )
        .unwrap();
        assert!(report.all_proven());
        assert!(report.proven.is_empty());
    }

    #[test]
    fn signature_tracks_the_checked_set() {
        let mut a = BoundReport::default();
        let mut b = BoundReport::default();
        assert_eq!(a.signature(), b.signature());
        a.checked.insert(3);
        assert_ne!(a.signature(), b.signature());
        b.checked.insert(3);
        assert_eq!(a.signature(), b.signature());
    }
}
