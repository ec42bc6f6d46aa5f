use std::collections::HashSet;

use crate::error::Result;
use crate::ir::program::{Expr, Function, Stmt};
use crate::ir::types::MathFn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// One array access occurrence in the fused body, numbered in walk order.
///
/// The id is the contract between this walk, the bound analyzer, and the
/// code generator: all three traverse statements and expressions in the
/// same deterministic order, so an id assigned here names the same textual
/// access everywhere. Keep `visit_accesses` as the single definition of
/// that order.
#[derive(Debug, Clone)]
pub struct ArrayAccess {
    pub id: u32,
    pub array: String,
    pub kind: AccessKind,
    pub index: Vec<Expr>,
}

/// Everything the later passes need to know about one candidate body.
#[derive(Debug, Clone, Default)]
pub struct CollectedAccesses {
    pub accesses: Vec<ArrayAccess>,
    /// Inner sequential loop variables, outermost first.
    pub sequential_vars: Vec<String>,
    /// Symbol-table scalars assigned somewhere in the body.
    pub assigned_scalars: HashSet<String>,
    /// Scalars declared inside the body, private per iteration.
    pub declared_scalars: HashSet<String>,
    pub math_used: HashSet<MathFn>,
    /// Functions called from the body, directly or transitively.
    pub called: HashSet<String>,
    /// Array reads performed inside called functions.
    pub function_reads: Vec<(String, String)>,
    /// Array writes performed inside called functions.
    pub function_writes: Vec<(String, String)>,
    /// First symbol-table scalar read before any dominating assignment,
    /// which sequential execution would carry across iterations.
    pub loop_carried_scalar: Option<String>,
}

impl CollectedAccesses {
    pub fn writes(&self) -> impl Iterator<Item = &ArrayAccess> {
        self.accesses
            .iter()
            .filter(|a| a.kind == AccessKind::Write)
    }

    pub fn reads(&self) -> impl Iterator<Item = &ArrayAccess> {
        self.accesses.iter().filter(|a| a.kind == AccessKind::Read)
    }

    pub fn arrays_written(&self) -> HashSet<&str> {
        let mut out: HashSet<&str> = self.writes().map(|a| a.array.as_str()).collect();
        for (_, array) in &self.function_writes {
            out.insert(array.as_str());
        }
        out
    }

    pub fn arrays_touched(&self) -> HashSet<&str> {
        let mut out: HashSet<&str> = self.accesses.iter().map(|a| a.array.as_str()).collect();
        for (_, array) in self.function_reads.iter().chain(&self.function_writes) {
            out.insert(array.as_str());
        }
        out
    }
}

/// Visit every array access of a body in canonical order: statements in
/// sequence, index expressions left to right before the value, loads in
/// post-order within an expression.
pub fn visit_accesses(body: &[Stmt], visit: &mut impl FnMut(&str, AccessKind, &[Expr])) {
    for stmt in body {
        visit_stmt(stmt, visit);
    }
}

fn visit_stmt(stmt: &Stmt, visit: &mut impl FnMut(&str, AccessKind, &[Expr])) {
    match stmt {
        Stmt::DeclScalar { init, .. } => {
            if let Some(init) = init {
                visit_expr(init, visit);
            }
        }
        Stmt::AssignScalar { value, .. } => visit_expr(value, visit),
        Stmt::Store {
            array,
            index,
            value,
        } => {
            for idx in index {
                visit_expr(idx, visit);
            }
            visit_expr(value, visit);
            visit(array, AccessKind::Write, index);
        }
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            visit_expr(cond, visit);
            visit_accesses(then_body, visit);
            visit_accesses(else_body, visit);
        }
        Stmt::For {
            start,
            stop,
            step,
            body,
            ..
        } => {
            visit_expr(start, visit);
            visit_expr(stop, visit);
            visit_expr(step, visit);
            visit_accesses(body, visit);
        }
        Stmt::While { cond, body } => {
            visit_expr(cond, visit);
            visit_accesses(body, visit);
        }
        Stmt::Break => {}
        Stmt::Return(value) => visit_expr(value, visit),
    }
}

fn visit_expr(expr: &Expr, visit: &mut impl FnMut(&str, AccessKind, &[Expr])) {
    match expr {
        Expr::Const(_) | Expr::Scalar(_) => {}
        Expr::Load { array, index } => {
            for idx in index {
                visit_expr(idx, visit);
            }
            visit(array, AccessKind::Read, index);
        }
        Expr::Unary { operand, .. } => visit_expr(operand, visit),
        Expr::Binary { lhs, rhs, .. } => {
            visit_expr(lhs, visit);
            visit_expr(rhs, visit);
        }
        Expr::Math { args, .. } | Expr::Call { args, .. } => {
            for arg in args {
                visit_expr(arg, visit);
            }
        }
        Expr::Cast { operand, .. } => visit_expr(operand, visit),
    }
}

/// Collect accesses and scalar usage facts for one candidate body.
pub fn collect(body: &[Stmt], functions: &[Function]) -> Result<CollectedAccesses> {
    let mut out = CollectedAccesses::default();

    let mut next_id = 0u32;
    visit_accesses(body, &mut |array, kind, index| {
        out.accesses.push(ArrayAccess {
            id: next_id,
            array: array.to_string(),
            kind,
            index: index.to_vec(),
        });
        next_id += 1;
    });

    scan_structure(body, &mut out);
    let direct: Vec<String> = out.called.iter().cloned().collect();
    for name in direct {
        merge_function(&name, functions, &mut out, &mut HashSet::new());
    }

    let assigned = out.assigned_scalars.clone();
    let declared = out.declared_scalars.clone();
    let mut dominated: HashSet<String> = HashSet::new();
    find_carried_scalar(body, &assigned, &declared, &mut dominated, &mut out);

    Ok(out)
}

/// One pass for everything that is not an array access: sequential loop
/// variables, scalar assignment targets, declared locals, math and call use.
fn scan_structure(body: &[Stmt], out: &mut CollectedAccesses) {
    for stmt in body {
        match stmt {
            Stmt::DeclScalar { name, init, .. } => {
                out.declared_scalars.insert(name.clone());
                if let Some(init) = init {
                    scan_expr(init, out);
                }
            }
            Stmt::AssignScalar { name, value } => {
                if !out.declared_scalars.contains(name) {
                    out.assigned_scalars.insert(name.clone());
                }
                scan_expr(value, out);
            }
            Stmt::Store { index, value, .. } => {
                for idx in index {
                    scan_expr(idx, out);
                }
                scan_expr(value, out);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                scan_expr(cond, out);
                scan_structure(then_body, out);
                scan_structure(else_body, out);
            }
            Stmt::For {
                var,
                start,
                stop,
                step,
                body,
            } => {
                out.sequential_vars.push(var.clone());
                scan_expr(start, out);
                scan_expr(stop, out);
                scan_expr(step, out);
                scan_structure(body, out);
            }
            Stmt::While { cond, body } => {
                scan_expr(cond, out);
                scan_structure(body, out);
            }
            Stmt::Break => {}
            Stmt::Return(value) => scan_expr(value, out),
        }
    }
}

fn scan_expr(expr: &Expr, out: &mut CollectedAccesses) {
    match expr {
        Expr::Const(_) | Expr::Scalar(_) => {}
        Expr::Load { index, .. } => {
            for idx in index {
                scan_expr(idx, out);
            }
        }
        Expr::Unary { operand, .. } | Expr::Cast { operand, .. } => scan_expr(operand, out),
        Expr::Binary { lhs, rhs, .. } => {
            scan_expr(lhs, out);
            scan_expr(rhs, out);
        }
        Expr::Math { func, args } => {
            out.math_used.insert(*func);
            for arg in args {
                scan_expr(arg, out);
            }
        }
        Expr::Call { func, args } => {
            out.called.insert(func.clone());
            for arg in args {
                scan_expr(arg, out);
            }
        }
    }
}

/// Fold a called function's array touches and transitive calls into the
/// caller's summary.
fn merge_function(
    name: &str,
    functions: &[Function],
    out: &mut CollectedAccesses,
    visiting: &mut HashSet<String>,
) {
    if !visiting.insert(name.to_string()) {
        // Cycles are reported by the dependence analyzer, not here.
        return;
    }
    let Some(function) = functions.iter().find(|f| f.name == name) else {
        return;
    };
    let mut nested: Vec<String> = Vec::new();
    scan_function_body(&function.body, name, out, &mut nested);
    for callee in nested {
        out.called.insert(callee.clone());
        merge_function(&callee, functions, out, visiting);
    }
    visiting.remove(name);
}

fn scan_function_body(
    body: &[Stmt],
    function: &str,
    out: &mut CollectedAccesses,
    nested: &mut Vec<String>,
) {
    for stmt in body {
        match stmt {
            Stmt::DeclScalar { init, .. } => {
                if let Some(init) = init {
                    scan_function_expr(init, function, out, nested);
                }
            }
            Stmt::AssignScalar { value, .. } => scan_function_expr(value, function, out, nested),
            Stmt::Store {
                array,
                index,
                value,
            } => {
                out.function_writes
                    .push((function.to_string(), array.clone()));
                for idx in index {
                    scan_function_expr(idx, function, out, nested);
                }
                scan_function_expr(value, function, out, nested);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                scan_function_expr(cond, function, out, nested);
                scan_function_body(then_body, function, out, nested);
                scan_function_body(else_body, function, out, nested);
            }
            Stmt::For {
                start,
                stop,
                step,
                body,
                ..
            } => {
                scan_function_expr(start, function, out, nested);
                scan_function_expr(stop, function, out, nested);
                scan_function_expr(step, function, out, nested);
                scan_function_body(body, function, out, nested);
            }
            Stmt::While { cond, body } => {
                scan_function_expr(cond, function, out, nested);
                scan_function_body(body, function, out, nested);
            }
            Stmt::Break => {}
            Stmt::Return(value) => scan_function_expr(value, function, out, nested),
        }
    }
}

fn scan_function_expr(
    expr: &Expr,
    function: &str,
    out: &mut CollectedAccesses,
    nested: &mut Vec<String>,
) {
    match expr {
        Expr::Const(_) | Expr::Scalar(_) => {}
        Expr::Load { array, index } => {
            out.function_reads
                .push((function.to_string(), array.clone()));
            for idx in index {
                scan_function_expr(idx, function, out, nested);
            }
        }
        Expr::Unary { operand, .. } | Expr::Cast { operand, .. } => {
            scan_function_expr(operand, function, out, nested)
        }
        Expr::Binary { lhs, rhs, .. } => {
            scan_function_expr(lhs, function, out, nested);
            scan_function_expr(rhs, function, out, nested);
        }
        Expr::Math { func, args } => {
            out.math_used.insert(*func);
            for arg in args {
                scan_function_expr(arg, function, out, nested);
            }
        }
        Expr::Call { func, args } => {
            nested.push(func.clone());
            for arg in args {
                scan_function_expr(arg, function, out, nested);
            }
        }
    }
}

/// Flag the first read of an eventually-assigned scalar that no assignment
/// dominates. Sequential execution hands such a scalar from iteration to
/// iteration; a kernel launch would reset it to the bound value instead.
fn find_carried_scalar(
    body: &[Stmt],
    assigned: &HashSet<String>,
    declared: &HashSet<String>,
    dominated: &mut HashSet<String>,
    out: &mut CollectedAccesses,
) {
    for stmt in body {
        if out.loop_carried_scalar.is_some() {
            return;
        }
        match stmt {
            Stmt::DeclScalar { init, .. } => {
                if let Some(init) = init {
                    check_carried_expr(init, assigned, declared, dominated, out);
                }
            }
            Stmt::AssignScalar { name, value } => {
                check_carried_expr(value, assigned, declared, dominated, out);
                dominated.insert(name.clone());
            }
            Stmt::Store { index, value, .. } => {
                for idx in index {
                    check_carried_expr(idx, assigned, declared, dominated, out);
                }
                check_carried_expr(value, assigned, declared, dominated, out);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                check_carried_expr(cond, assigned, declared, dominated, out);
                let mut then_dom = dominated.clone();
                let mut else_dom = dominated.clone();
                find_carried_scalar(then_body, assigned, declared, &mut then_dom, out);
                find_carried_scalar(else_body, assigned, declared, &mut else_dom, out);
                // Only assignments on both branches dominate what follows.
                for name in then_dom.intersection(&else_dom) {
                    dominated.insert(name.clone());
                }
            }
            Stmt::For {
                start,
                stop,
                step,
                body,
                ..
            } => {
                for e in [start, stop, step] {
                    check_carried_expr(e, assigned, declared, dominated, out);
                }
                // Zero-trip loops keep nothing dominated afterwards.
                let mut body_dom = dominated.clone();
                find_carried_scalar(body, assigned, declared, &mut body_dom, out);
            }
            Stmt::While { cond, body } => {
                check_carried_expr(cond, assigned, declared, dominated, out);
                let mut body_dom = dominated.clone();
                find_carried_scalar(body, assigned, declared, &mut body_dom, out);
            }
            Stmt::Break => {}
            Stmt::Return(value) => {
                check_carried_expr(value, assigned, declared, dominated, out)
            }
        }
    }
}

fn check_carried_expr(
    expr: &Expr,
    assigned: &HashSet<String>,
    declared: &HashSet<String>,
    dominated: &HashSet<String>,
    out: &mut CollectedAccesses,
) {
    if out.loop_carried_scalar.is_some() {
        return;
    }
    match expr {
        Expr::Const(_) => {}
        Expr::Scalar(name) => {
            if assigned.contains(name) && !declared.contains(name) && !dominated.contains(name) {
                out.loop_carried_scalar = Some(name.clone());
            }
        }
        Expr::Load { index, .. } => {
            for idx in index {
                check_carried_expr(idx, assigned, declared, dominated, out);
            }
        }
        Expr::Unary { operand, .. } | Expr::Cast { operand, .. } => {
            check_carried_expr(operand, assigned, declared, dominated, out)
        }
        Expr::Binary { lhs, rhs, .. } => {
            check_carried_expr(lhs, assigned, declared, dominated, out);
            check_carried_expr(rhs, assigned, declared, dominated, out);
        }
        Expr::Math { args, .. } | Expr::Call { args, .. } => {
            for arg in args {
                check_carried_expr(arg, assigned, declared, dominated, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::program::BinOp;
    use crate::ir::types::ScalarType;

    #[test]
    fn ids_follow_walk_order() {
        // y[i] = x[i] + y[i] reads x, reads y, then writes y.
        let body = vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::add(
                Expr::load("x", vec![Expr::scalar("i")]),
                Expr::load("y", vec![Expr::scalar("i")]),
            ),
        }];
        let got = collect(&body, &[]).unwrap();
        let order: Vec<(&str, AccessKind)> = got
            .accesses
            .iter()
            .map(|a| (a.array.as_str(), a.kind))
            .collect();
        assert_eq!(
            order,
            vec![
                ("x", AccessKind::Read),
                ("y", AccessKind::Read),
                ("y", AccessKind::Write)
            ]
        );
        assert_eq!(got.accesses[2].id, 2);
    }

    #[test]
    fn sequential_vars_and_math_are_recorded() {
        let body = vec![Stmt::For {
            var: "j".into(),
            start: Expr::i64(0),
            stop: Expr::scalar("m"),
            step: Expr::i64(1),
            body: vec![Stmt::Store {
                array: "a".into(),
                index: vec![Expr::scalar("i"), Expr::scalar("j")],
                value: Expr::math(MathFn::Sqrt, vec![Expr::load("b", vec![Expr::scalar("j")])]),
            }],
        }];
        let got = collect(&body, &[]).unwrap();
        assert_eq!(got.sequential_vars, vec!["j".to_string()]);
        assert!(got.math_used.contains(&MathFn::Sqrt));
    }

    #[test]
    fn read_before_assign_is_loop_carried() {
        // acc = acc + a[i]
        let body = vec![Stmt::AssignScalar {
            name: "acc".into(),
            value: Expr::add(Expr::scalar("acc"), Expr::load("a", vec![Expr::scalar("i")])),
        }];
        let got = collect(&body, &[]).unwrap();
        assert_eq!(got.loop_carried_scalar.as_deref(), Some("acc"));
    }

    #[test]
    fn assign_then_read_is_private() {
        let body = vec![
            Stmt::AssignScalar {
                name: "t".into(),
                value: Expr::load("a", vec![Expr::scalar("i")]),
            },
            Stmt::Store {
                array: "b".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::binary(BinOp::Mul, Expr::scalar("t"), Expr::scalar("t")),
            },
        ];
        let got = collect(&body, &[]).unwrap();
        assert_eq!(got.loop_carried_scalar, None);
    }

    #[test]
    fn branch_assignment_does_not_dominate() {
        let body = vec![
            Stmt::If {
                cond: Expr::binary(BinOp::Lt, Expr::scalar("i"), Expr::i64(5)),
                then_body: vec![Stmt::AssignScalar {
                    name: "s".into(),
                    value: Expr::i64(1),
                }],
                else_body: vec![],
            },
            Stmt::Store {
                array: "b".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::scalar("s"),
            },
        ];
        let got = collect(&body, &[]).unwrap();
        assert_eq!(got.loop_carried_scalar.as_deref(), Some("s"));
    }

    #[test]
    fn function_touches_merge_transitively() {
        let inner = Function {
            name: "table_at".into(),
            params: vec![("k".into(), ScalarType::I64)],
            ret: ScalarType::F64,
            body: vec![Stmt::Return(Expr::load("table", vec![Expr::scalar("k")]))],
        };
        let outer = Function {
            name: "wrap".into(),
            params: vec![("k".into(), ScalarType::I64)],
            ret: ScalarType::F64,
            body: vec![Stmt::Return(Expr::Call {
                func: "table_at".into(),
                args: vec![Expr::scalar("k")],
            })],
        };
        let body = vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::Call {
                func: "wrap".into(),
                args: vec![Expr::scalar("i")],
            },
        }];
        let got = collect(&body, &[inner, outer]).unwrap();
        assert!(got.called.contains("wrap"));
        assert!(got.called.contains("table_at"));
        assert!(got
            .function_reads
            .iter()
            .any(|(f, a)| f == "table_at" && a == "table"));
    }
}
