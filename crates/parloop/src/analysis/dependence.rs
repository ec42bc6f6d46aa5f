use std::collections::{BTreeMap, HashMap, HashSet};

use crate::analysis::accesses::{AccessKind, ArrayAccess, CollectedAccesses};
use crate::analysis::affine::{affine_of, Affine, IndexEnv, IndexForm};
use crate::ir::program::Function;
use crate::options::LoopOptions;
use crate::symbols::{Bindings, StorageId};

/// Outcome of dependence analysis for one candidate nest.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Analysis has not run.
    Unknown,
    /// No two parallel iterations touch a common element.
    Independent,
    /// Cross-name overlaps exist but every one is same-iteration, which
    /// sequential-per-work-item execution preserves.
    EqualDependent,
    /// A dependence would be reordered by parallel execution.
    TrueDependent { variable: String, reason: String },
    /// The body contains something the analysis cannot classify.
    Unsupported { reason: String },
}

impl Verdict {
    pub fn allows_parallel(&self) -> bool {
        matches!(self, Verdict::Independent | Verdict::EqualDependent)
    }

    fn severity(&self) -> u8 {
        match self {
            Verdict::Unknown => 0,
            Verdict::Independent => 1,
            Verdict::EqualDependent => 2,
            Verdict::TrueDependent { .. } => 3,
            Verdict::Unsupported { .. } => 4,
        }
    }

    fn worst(self, other: Verdict) -> Verdict {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// How one (write, access) pair can interact across parallel iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairRelation {
    /// The element sets can never meet, not even in one iteration.
    Disjoint,
    /// Overlaps exist but only with identical parallel indices.
    SameIterationOnly,
    /// A cross-iteration collision exists or cannot be ruled out.
    Collides,
}

/// Analyze one candidate nest. `level_vars` are the parallel induction
/// variables, outermost first; storage identity comes from the bindings.
pub fn analyze_nest(
    accesses: &CollectedAccesses,
    level_vars: &[String],
    bindings: &Bindings,
    options: &LoopOptions,
) -> Verdict {
    if options.disable_all_dependence_checks
        || (level_vars.len() == 1 && options.disable_dependence_check)
    {
        return Verdict::Independent;
    }

    if let Some(scalar) = &accesses.loop_carried_scalar {
        return Verdict::TrueDependent {
            variable: scalar.clone(),
            reason: format!("scalar '{scalar}' is read before it is assigned, so its value is carried from the previous iteration"),
        };
    }

    if let Some((function, array)) = accesses.function_writes.first() {
        return Verdict::Unsupported {
            reason: format!("function '{function}' stores to array '{array}'"),
        };
    }

    // Group by storage identity so aliased names analyze as one array.
    let mut groups: HashMap<StorageId, Vec<&ArrayAccess>> = HashMap::new();
    let mut opaque_reads: HashMap<StorageId, &str> = HashMap::new();
    for access in &accesses.accesses {
        let id = match bindings.array(&access.array) {
            Ok(array) => array.id(),
            Err(_) => {
                return Verdict::Unsupported {
                    reason: format!("array '{}' has no bound storage", access.array),
                }
            }
        };
        groups.entry(id).or_default().push(access);
    }
    for (function, array) in &accesses.function_reads {
        let id = match bindings.array(array) {
            Ok(a) => a.id(),
            Err(_) => {
                return Verdict::Unsupported {
                    reason: format!("array '{array}' read by '{function}' has no bound storage"),
                }
            }
        };
        opaque_reads.entry(id).or_insert(array.as_str());
    }

    let parallel: HashSet<&str> = level_vars.iter().map(String::as_str).collect();
    let loop_vars: Vec<String> = level_vars
        .iter()
        .cloned()
        .chain(accesses.sequential_vars.iter().cloned())
        .collect();
    let assigned = |name: &str| {
        accesses.assigned_scalars.contains(name) || accesses.declared_scalars.contains(name)
    };
    let bound = |name: &str| bindings.scalar(name).is_ok();
    let env = IndexEnv {
        loop_vars: &loop_vars,
        assigned_scalars: &assigned,
        bound_scalars: &bound,
    };

    let mut verdict = Verdict::Independent;
    for group in groups.values() {
        let writes: Vec<&ArrayAccess> = group
            .iter()
            .copied()
            .filter(|a| a.kind == AccessKind::Write)
            .collect();
        if writes.is_empty() {
            continue;
        }

        // Every write index must be affine before anything can be proven.
        let mut forms: HashMap<u32, Vec<Affine>> = HashMap::new();
        for access in group.iter() {
            let mut dims = Vec::with_capacity(access.index.len());
            let mut opaque = false;
            for idx in &access.index {
                match affine_of(idx, &env) {
                    IndexForm::Affine(a) => dims.push(a),
                    IndexForm::Opaque => {
                        opaque = true;
                        break;
                    }
                }
            }
            if opaque {
                if access.kind == AccessKind::Write {
                    return Verdict::Unsupported {
                        reason: format!(
                            "write to '{}' through an index the analysis cannot express",
                            access.array
                        ),
                    };
                }
                // Opaque read of a written array: no disjointness argument.
                verdict = verdict.worst(Verdict::TrueDependent {
                    variable: access.array.clone(),
                    reason: format!(
                        "read of '{}' through an unanalyzable index while the array is written",
                        access.array
                    ),
                });
            } else {
                forms.insert(access.id, dims);
            }
        }

        // A function body reading this storage is opaque by construction.
        if let Some(storage) = group.first().and_then(|a| bindings.array(&a.array).ok()) {
            if let Some(array) = opaque_reads.get(&storage.id()) {
                verdict = verdict.worst(Verdict::TrueDependent {
                    variable: (*array).to_string(),
                    reason: format!(
                        "function read of '{array}' cannot be proven disjoint from its writes"
                    ),
                });
            }
        }

        for &write in &writes {
            let Some(write_form) = forms.get(&write.id) else {
                continue;
            };
            for &access in group.iter() {
                if access.id == write.id {
                    // Self pair: does the write collide with itself across
                    // iterations?
                    if let PairRelation::Collides =
                        pair_relation(write_form, write_form, &parallel)
                    {
                        verdict = verdict.worst(collision(write, access));
                    }
                    continue;
                }
                let Some(access_form) = forms.get(&access.id) else {
                    continue;
                };
                match pair_relation(write_form, access_form, &parallel) {
                    PairRelation::Disjoint => {}
                    PairRelation::SameIterationOnly => {
                        if access.kind == AccessKind::Read {
                            verdict = verdict.worst(Verdict::EqualDependent);
                        }
                    }
                    PairRelation::Collides => {
                        verdict = verdict.worst(collision(write, access));
                    }
                }
            }
        }
    }
    verdict
}

fn collision(write: &ArrayAccess, other: &ArrayAccess) -> Verdict {
    let reason = if write.array == other.array {
        match other.kind {
            AccessKind::Read => format!(
                "read of '{}' collides with its write in another iteration",
                other.array
            ),
            AccessKind::Write => format!(
                "two iterations write the same element of '{}'",
                write.array
            ),
        }
    } else {
        format!(
            "write to '{}' collides with access to '{}' through shared storage",
            write.array, other.array
        )
    };
    Verdict::TrueDependent {
        variable: write.array.clone(),
        reason,
    }
}

/// Decide how a write and another access can interact across parallel
/// iterations, dimension by dimension.
///
/// A dimension whose two forms agree on every coefficient can do one of
/// three things: rule the pair fully apart (constant offset no iteration
/// distance can bridge), pin one parallel variable to be equal on both
/// sides, or admit a bridging distance. The pair is safe when some
/// dimension proves full disjointness or the pinned variables cover every
/// parallel variable.
fn pair_relation(
    write: &[Affine],
    other: &[Affine],
    parallel: &HashSet<&str>,
) -> PairRelation {
    let mut forced: HashSet<&str> = HashSet::new();
    for (f, g) in write.iter().zip(other.iter()) {
        if f.syms != g.syms || f.vars != g.vars {
            // Differing shapes: this dimension proves nothing either way.
            continue;
        }
        if !f.vars.keys().all(|v| parallel.contains(v.as_str())) {
            // A sequential loop variable ranges freely on both sides.
            continue;
        }
        let delta = g.constant.wrapping_sub(f.constant);
        if f.vars.is_empty() {
            if delta != 0 {
                return PairRelation::Disjoint;
            }
            continue;
        }
        if let Some((var, coeff)) = single_var(&f.vars) {
            if delta == 0 {
                forced.insert(var);
            } else if coeff != 0 && delta % coeff != 0 {
                return PairRelation::Disjoint;
            }
        }
    }
    if parallel.iter().all(|v| forced.contains(v)) {
        PairRelation::SameIterationOnly
    } else {
        PairRelation::Collides
    }
}

fn single_var(vars: &BTreeMap<String, i64>) -> Option<(&str, i64)> {
    if vars.len() == 1 {
        vars.iter().next().map(|(k, v)| (k.as_str(), *v))
    } else {
        None
    }
}

/// Depth-first recursion check over the user-function call graph. Returns
/// the name of a function on a cycle, if any is reachable from `roots`.
pub fn detect_recursion<'a>(
    functions: &'a [Function],
    roots: impl Iterator<Item = &'a str>,
) -> Option<String> {
    let graph: HashMap<&str, Vec<String>> = functions
        .iter()
        .map(|f| (f.name.as_str(), called_names(f)))
        .collect();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: HashSet<&str> = HashSet::new();
    for root in roots {
        if let Some(hit) = dfs(root, &graph, &mut visited, &mut on_stack) {
            return Some(hit);
        }
    }
    None
}

fn dfs<'a>(
    node: &'a str,
    graph: &'a HashMap<&str, Vec<String>>,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
) -> Option<String> {
    if on_stack.contains(node) {
        return Some(node.to_string());
    }
    if !visited.insert(node) {
        return None;
    }
    on_stack.insert(node);
    if let Some(callees) = graph.get(node) {
        for callee in callees {
            if let Some(hit) = dfs(callee.as_str(), graph, visited, on_stack) {
                return Some(hit);
            }
        }
    }
    on_stack.remove(node);
    None
}

fn called_names(function: &Function) -> Vec<String> {
    use crate::ir::program::{Expr, Stmt};
    fn walk_expr(expr: &Expr, out: &mut Vec<String>) {
        match expr {
            Expr::Call { func, args } => {
                out.push(func.clone());
                for arg in args {
                    walk_expr(arg, out);
                }
            }
            Expr::Load { index, .. } => {
                for idx in index {
                    walk_expr(idx, out);
                }
            }
            Expr::Unary { operand, .. } | Expr::Cast { operand, .. } => walk_expr(operand, out),
            Expr::Binary { lhs, rhs, .. } => {
                walk_expr(lhs, out);
                walk_expr(rhs, out);
            }
            Expr::Math { args, .. } => {
                for arg in args {
                    walk_expr(arg, out);
                }
            }
            Expr::Const(_) | Expr::Scalar(_) => {}
        }
    }
    fn walk_body(body: &[Stmt], out: &mut Vec<String>) {
        for stmt in body {
            match stmt {
                Stmt::DeclScalar { init: Some(e), .. } => walk_expr(e, out),
                Stmt::DeclScalar { .. } | Stmt::Break => {}
                Stmt::AssignScalar { value, .. } => walk_expr(value, out),
                Stmt::Store { index, value, .. } => {
                    for idx in index {
                        walk_expr(idx, out);
                    }
                    walk_expr(value, out);
                }
                Stmt::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    walk_expr(cond, out);
                    walk_body(then_body, out);
                    walk_body(else_body, out);
                }
                Stmt::For {
                    start,
                    stop,
                    step,
                    body,
                    ..
                } => {
                    walk_expr(start, out);
                    walk_expr(stop, out);
                    walk_expr(step, out);
                    walk_body(body, out);
                }
                Stmt::While { cond, body } => {
                    walk_expr(cond, out);
                    walk_body(body, out);
                }
                Stmt::Return(value) => walk_expr(value, out),
            }
        }
    }
    let mut out = Vec::new();
    walk_body(&function.body, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::accesses::collect;
    use crate::ir::program::{Expr, Stmt};
    use crate::ir::types::ScalarType;
    use crate::symbols::{ArrayData, ArrayRef, SymbolTable};

    fn bind_arrays(table: &SymbolTable, names: &[(&str, usize)]) -> Bindings {
        let mut bindings = Bindings::for_table(table);
        for (name, len) in names {
            bindings
                .set_array(name, ArrayRef::new(ArrayData::from_f64(vec![0.0; *len])))
                .unwrap();
        }
        bindings
    }

    fn one_level() -> Vec<String> {
        vec!["i".to_string()]
    }

    #[test]
    fn elementwise_copy_is_independent() {
        let table = SymbolTable::new()
            .array("a", ScalarType::F64, 1)
            .array("b", ScalarType::F64, 1);
        let body = vec![Stmt::Store {
            array: "b".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::load("a", vec![Expr::scalar("i")]),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = bind_arrays(&table, &[("a", 16), ("b", 16)]);
        let verdict = analyze_nest(&accesses, &one_level(), &bindings, &LoopOptions::default());
        assert_eq!(verdict, Verdict::Independent);
    }

    #[test]
    fn shifted_read_is_true_dependent() {
        // a[i] = a[i-1] + 1
        let table = SymbolTable::new().array("a", ScalarType::F64, 1);
        let body = vec![Stmt::Store {
            array: "a".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::add(
                Expr::load("a", vec![Expr::sub(Expr::scalar("i"), Expr::i64(1))]),
                Expr::f64(1.0),
            ),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = bind_arrays(&table, &[("a", 16)]);
        let verdict = analyze_nest(&accesses, &one_level(), &bindings, &LoopOptions::default());
        match verdict {
            Verdict::TrueDependent { variable, .. } => assert_eq!(variable, "a"),
            other => panic!("expected TrueDependent, got {other:?}"),
        }
    }

    #[test]
    fn same_index_read_write_is_equal_dependent() {
        // a[i] = a[i] * 2
        let table = SymbolTable::new().array("a", ScalarType::F64, 1);
        let body = vec![Stmt::Store {
            array: "a".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::mul(Expr::load("a", vec![Expr::scalar("i")]), Expr::f64(2.0)),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = bind_arrays(&table, &[("a", 16)]);
        let verdict = analyze_nest(&accesses, &one_level(), &bindings, &LoopOptions::default());
        assert_eq!(verdict, Verdict::EqualDependent);
    }

    #[test]
    fn interleaved_strides_are_disjoint() {
        // a[2*i] = a[2*i + 1]
        let table = SymbolTable::new().array("a", ScalarType::F64, 1);
        let body = vec![Stmt::Store {
            array: "a".into(),
            index: vec![Expr::mul(Expr::i64(2), Expr::scalar("i"))],
            value: Expr::load(
                "a",
                vec![Expr::add(
                    Expr::mul(Expr::i64(2), Expr::scalar("i")),
                    Expr::i64(1),
                )],
            ),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = bind_arrays(&table, &[("a", 32)]);
        let verdict = analyze_nest(&accesses, &one_level(), &bindings, &LoopOptions::default());
        assert_eq!(verdict, Verdict::Independent);
    }

    #[test]
    fn aliased_names_collide_by_storage() {
        let table = SymbolTable::new()
            .array("src", ScalarType::F64, 1)
            .array("dst", ScalarType::F64, 1);
        let body = vec![Stmt::Store {
            array: "dst".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::load("src", vec![Expr::add(Expr::scalar("i"), Expr::i64(1))]),
        }];
        let accesses = collect(&body, &[]).unwrap();

        // Distinct storage: fine.
        let bindings = bind_arrays(&table, &[("src", 16), ("dst", 16)]);
        assert_eq!(
            analyze_nest(&accesses, &one_level(), &bindings, &LoopOptions::default()),
            Verdict::Independent
        );

        // Same storage under two names: shifted copy collides.
        let shared = ArrayRef::new(ArrayData::from_f64(vec![0.0; 16]));
        let mut aliased = Bindings::for_table(&table);
        aliased.set_array("src", shared.clone()).unwrap();
        aliased.set_array("dst", shared).unwrap();
        match analyze_nest(&accesses, &one_level(), &aliased, &LoopOptions::default()) {
            Verdict::TrueDependent { reason, .. } => {
                assert!(reason.contains("shared storage"), "{reason}");
            }
            other => panic!("expected TrueDependent, got {other:?}"),
        }
    }

    #[test]
    fn sequential_dim_write_collides_across_parallel_iterations() {
        // for j: a[j] = i  (every parallel iteration sweeps the whole row)
        let table = SymbolTable::new()
            .scalar("m", ScalarType::I64)
            .array("a", ScalarType::I64, 1);
        let body = vec![Stmt::For {
            var: "j".into(),
            start: Expr::i64(0),
            stop: Expr::scalar("m"),
            step: Expr::i64(1),
            body: vec![Stmt::Store {
                array: "a".into(),
                index: vec![Expr::scalar("j")],
                value: Expr::scalar("i"),
            }],
        }];
        let accesses = collect(&body, &[]).unwrap();
        let mut bindings = Bindings::for_table(&table);
        bindings
            .set_scalar("m", crate::ir::types::Literal::I64(8))
            .unwrap();
        bindings
            .set_array("a", ArrayRef::new(ArrayData::from_i64(vec![0; 8])))
            .unwrap();
        let verdict = analyze_nest(&accesses, &one_level(), &bindings, &LoopOptions::default());
        assert!(matches!(verdict, Verdict::TrueDependent { .. }));
    }

    #[test]
    fn two_level_row_column_write_is_safe() {
        // b[i][j] = a[i][j]: both parallel vars pinned by their dimension.
        let table = SymbolTable::new()
            .array("a", ScalarType::F64, 2)
            .array("b", ScalarType::F64, 2);
        let body = vec![Stmt::Store {
            array: "b".into(),
            index: vec![Expr::scalar("i"), Expr::scalar("j")],
            value: Expr::load("a", vec![Expr::scalar("i"), Expr::scalar("j")]),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let mut bindings = Bindings::for_table(&table);
        for name in ["a", "b"] {
            bindings
                .set_array(
                    name,
                    ArrayRef::new(ArrayData::new(
                        [4usize, 4usize].as_slice(),
                        crate::symbols::Buf::F64(vec![0.0; 16]),
                    ).unwrap()),
                )
                .unwrap();
        }
        let levels = vec!["i".to_string(), "j".to_string()];
        let verdict = analyze_nest(&accesses, &levels, &bindings, &LoopOptions::default());
        assert_eq!(verdict, Verdict::Independent);
    }

    #[test]
    fn disabling_checks_asserts_independence() {
        let table = SymbolTable::new().array("a", ScalarType::F64, 1);
        let body = vec![Stmt::Store {
            array: "a".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::load("a", vec![Expr::sub(Expr::scalar("i"), Expr::i64(1))]),
        }];
        let accesses = collect(&body, &[]).unwrap();
        let bindings = bind_arrays(&table, &[("a", 16)]);
        let options = LoopOptions {
            disable_dependence_check: true,
            ..LoopOptions::default()
        };
        assert_eq!(
            analyze_nest(&accesses, &one_level(), &bindings, &options),
            Verdict::Independent
        );
    }

    #[test]
    fn recursion_is_detected() {
        let f = Function {
            name: "odd".into(),
            params: vec![("k".into(), ScalarType::I64)],
            ret: ScalarType::I64,
            body: vec![Stmt::Return(Expr::Call {
                func: "even".into(),
                args: vec![Expr::sub(Expr::scalar("k"), Expr::i64(1))],
            })],
        };
        let g = Function {
            name: "even".into(),
            params: vec![("k".into(), ScalarType::I64)],
            ret: ScalarType::I64,
            body: vec![Stmt::Return(Expr::Call {
                func: "odd".into(),
                args: vec![Expr::sub(Expr::scalar("k"), Expr::i64(1))],
            })],
        };
        let functions = vec![f, g];
        assert!(detect_recursion(&functions, ["odd"].into_iter()).is_some());

        let plain = Function {
            name: "twice".into(),
            params: vec![("k".into(), ScalarType::I64)],
            ret: ScalarType::I64,
            body: vec![Stmt::Return(Expr::mul(Expr::scalar("k"), Expr::i64(2)))],
        };
        assert!(detect_recursion(&[plain], ["twice"].into_iter()).is_none());
    }
}
