use crate::analysis::accesses::{collect, CollectedAccesses};
use crate::analysis::affine::{affine_of, IndexEnv, IndexForm};
use crate::analysis::dependence::{analyze_nest, Verdict};
use crate::error::Result;
use crate::ir::program::{Expr, Function, LoopLevel, LoopNest, Stmt};
use crate::options::LoopOptions;
use crate::symbols::Bindings;

/// Parallel levels a nest can spread across device dimensions.
pub const MAX_LEVELS: usize = 3;

/// A nest after fusion: the committed parallel levels and the body that
/// remains under them.
#[derive(Debug, Clone)]
pub struct FusedNest {
    pub levels: Vec<LoopLevel>,
    pub body: Vec<Stmt>,
    /// Why deepening stopped, when it stopped before the level cap.
    pub stop_reason: Option<String>,
}

impl FusedNest {
    pub fn level_vars(&self) -> Vec<String> {
        self.levels.iter().map(|l| l.var.clone()).collect()
    }
}

/// Greedily absorb perfectly nested counted loops into parallel levels.
///
/// The outermost level must itself be parallel-safe; each deeper candidate
/// is committed only when the whole candidate nest still analyzes as
/// parallel-safe and the inner loop's shape qualifies: a counted `for` as
/// the only statement, rectangular bounds, no top-level `break`.
pub fn fuse(
    nest: &LoopNest,
    functions: &[Function],
    bindings: &Bindings,
    options: &LoopOptions,
) -> Result<(FusedNest, CollectedAccesses, Verdict)> {
    let mut levels = vec![nest.level.clone()];
    let mut body = nest.body.clone();

    let mut accesses = collect(&body, functions)?;
    let mut verdict = analyze_nest(&accesses, &level_vars(&levels), bindings, options);
    if !verdict.allows_parallel() {
        let fused = FusedNest {
            levels,
            body,
            stop_reason: None,
        };
        return Ok((fused, accesses, verdict));
    }

    let mut stop_reason = None;
    while levels.len() < MAX_LEVELS {
        let candidate = match body.as_slice() {
            [Stmt::For {
                var,
                start,
                stop,
                step,
                body: inner,
            }] => Some((
                LoopLevel::new(var.clone(), start.clone(), stop.clone(), step.clone()),
                inner.clone(),
            )),
            _ => None,
        };
        let Some((level, inner_body)) = candidate else {
            break;
        };

        if let Some(reason) = disqualify(&level, &inner_body, &levels, &accesses, bindings) {
            stop_reason = Some(reason);
            break;
        }

        let mut cand_levels = levels.clone();
        cand_levels.push(level);
        let cand_accesses = collect(&inner_body, functions)?;
        let cand_verdict = analyze_nest(
            &cand_accesses,
            &level_vars(&cand_levels),
            bindings,
            options,
        );
        if !cand_verdict.allows_parallel() {
            stop_reason = Some(match &cand_verdict {
                Verdict::TrueDependent { reason, .. } | Verdict::Unsupported { reason } => {
                    reason.clone()
                }
                _ => "inner loop is not parallel-safe".to_string(),
            });
            break;
        }

        levels = cand_levels;
        body = inner_body;
        accesses = cand_accesses;
        verdict = cand_verdict;
    }

    let fused = FusedNest {
        levels,
        body,
        stop_reason,
    };
    Ok((fused, accesses, verdict))
}

fn level_vars(levels: &[LoopLevel]) -> Vec<String> {
    levels.iter().map(|l| l.var.clone()).collect()
}

/// Shape preconditions for absorbing one inner loop.
fn disqualify(
    level: &LoopLevel,
    inner_body: &[Stmt],
    outer_levels: &[LoopLevel],
    accesses: &CollectedAccesses,
    bindings: &Bindings,
) -> Option<String> {
    if outer_levels.iter().any(|l| l.var == level.var) {
        return Some(format!(
            "induction variable '{}' already drives an outer level",
            level.var
        ));
    }
    if inner_body.iter().any(|s| matches!(s, Stmt::Break)) {
        return Some("inner loop body breaks out of the loop".to_string());
    }
    // Rectangular bounds only: ranges must resolve from call constants,
    // independent of outer induction variables or body-assigned scalars.
    let no_loop_vars: [String; 0] = [];
    let assigned = |name: &str| {
        accesses.assigned_scalars.contains(name) || accesses.declared_scalars.contains(name)
    };
    let bound = |name: &str| bindings.scalar(name).is_ok();
    let env = IndexEnv {
        loop_vars: &no_loop_vars,
        assigned_scalars: &assigned,
        bound_scalars: &bound,
    };
    for (what, expr) in [
        ("start", &level.start),
        ("stop", &level.stop),
        ("step", &level.step),
    ] {
        if !matches!(affine_of(expr, &env), IndexForm::Affine(_)) {
            return Some(format!(
                "inner loop {what} bound does not resolve to a call constant"
            ));
        }
    }
    if let Expr::Const(lit) = &level.step {
        if lit.as_i64() == Some(0) {
            return Some("inner loop step is zero".to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::program::BinOp;
    use crate::ir::types::ScalarType;
    use crate::symbols::{ArrayData, ArrayRef, Buf, SymbolTable};

    fn matrix_bindings(table: &SymbolTable, rows: usize, cols: usize) -> Bindings {
        let mut bindings = Bindings::for_table(table);
        bindings
            .set_scalar("n", crate::ir::types::Literal::I64(rows as i64))
            .unwrap();
        bindings
            .set_scalar("m", crate::ir::types::Literal::I64(cols as i64))
            .unwrap();
        for name in ["a", "b"] {
            if table.array_meta(name).is_some() {
                bindings
                    .set_array(
                        name,
                        ArrayRef::new(
                            ArrayData::new(
                                [rows, cols].as_slice(),
                                Buf::F64(vec![0.0; rows * cols]),
                            )
                            .unwrap(),
                        ),
                    )
                    .unwrap();
            }
        }
        bindings
    }

    fn two_level_table() -> SymbolTable {
        SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .scalar("m", ScalarType::I64)
            .array("a", ScalarType::F64, 2)
            .array("b", ScalarType::F64, 2)
    }

    fn inner_for(body: Vec<Stmt>) -> Stmt {
        Stmt::For {
            var: "j".into(),
            start: Expr::i64(0),
            stop: Expr::scalar("m"),
            step: Expr::i64(1),
            body,
        }
    }

    #[test]
    fn perfect_two_level_nest_fuses() {
        let table = two_level_table();
        let nest = LoopNest {
            level: LoopLevel::upto("i", Expr::scalar("n")),
            body: vec![inner_for(vec![Stmt::Store {
                array: "b".into(),
                index: vec![Expr::scalar("i"), Expr::scalar("j")],
                value: Expr::load("a", vec![Expr::scalar("i"), Expr::scalar("j")]),
            }])],
        };
        let bindings = matrix_bindings(&table, 4, 5);
        let (fused, _, verdict) =
            fuse(&nest, &[], &bindings, &LoopOptions::default()).unwrap();
        assert_eq!(fused.levels.len(), 2);
        assert_eq!(fused.level_vars(), vec!["i".to_string(), "j".to_string()]);
        assert!(verdict.allows_parallel());
        assert!(fused.stop_reason.is_none());
    }

    #[test]
    fn dependent_inner_loop_stays_sequential() {
        // b[i][j] = b[i][j-1]: row-parallel, column-sequential.
        let table = two_level_table();
        let nest = LoopNest {
            level: LoopLevel::upto("i", Expr::scalar("n")),
            body: vec![inner_for(vec![Stmt::Store {
                array: "b".into(),
                index: vec![Expr::scalar("i"), Expr::scalar("j")],
                value: Expr::load(
                    "b",
                    vec![Expr::scalar("i"), Expr::sub(Expr::scalar("j"), Expr::i64(1))],
                ),
            }])],
        };
        let bindings = matrix_bindings(&table, 4, 5);
        let (fused, _, verdict) =
            fuse(&nest, &[], &bindings, &LoopOptions::default()).unwrap();
        assert_eq!(fused.levels.len(), 1);
        assert!(verdict.allows_parallel());
        assert!(fused.stop_reason.is_some());
    }

    #[test]
    fn triangular_bounds_stop_fusion() {
        let table = two_level_table();
        let nest = LoopNest {
            level: LoopLevel::upto("i", Expr::scalar("n")),
            body: vec![Stmt::For {
                var: "j".into(),
                start: Expr::scalar("i"),
                stop: Expr::scalar("m"),
                step: Expr::i64(1),
                body: vec![Stmt::Store {
                    array: "b".into(),
                    index: vec![Expr::scalar("i"), Expr::scalar("j")],
                    value: Expr::f64(1.0),
                }],
            }],
        };
        let bindings = matrix_bindings(&table, 4, 5);
        let (fused, _, _) = fuse(&nest, &[], &bindings, &LoopOptions::default()).unwrap();
        assert_eq!(fused.levels.len(), 1);
        assert!(fused
            .stop_reason
            .as_deref()
            .is_some_and(|r| r.contains("call constant")));
    }

    #[test]
    fn break_in_inner_body_stops_fusion() {
        let table = two_level_table();
        let nest = LoopNest {
            level: LoopLevel::upto("i", Expr::scalar("n")),
            body: vec![inner_for(vec![
                Stmt::If {
                    cond: Expr::binary(BinOp::Gt, Expr::scalar("j"), Expr::i64(3)),
                    then_body: vec![],
                    else_body: vec![],
                },
                Stmt::Break,
            ])],
        };
        let bindings = matrix_bindings(&table, 4, 5);
        let (fused, _, _) = fuse(&nest, &[], &bindings, &LoopOptions::default()).unwrap();
        assert_eq!(fused.levels.len(), 1);
        assert!(fused
            .stop_reason
            .as_deref()
            .is_some_and(|r| r.contains("break")));
    }

    #[test]
    fn fusion_caps_at_three_levels() {
        let table = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .array("c", ScalarType::F64, 3);
        let innermost = Stmt::For {
            var: "k".into(),
            start: Expr::i64(0),
            stop: Expr::scalar("n"),
            step: Expr::i64(1),
            body: vec![Stmt::For {
                var: "l".into(),
                start: Expr::i64(0),
                stop: Expr::scalar("n"),
                step: Expr::i64(1),
                body: vec![Stmt::Store {
                    array: "c".into(),
                    index: vec![Expr::scalar("i"), Expr::scalar("j"), Expr::scalar("k")],
                    value: Expr::f64(0.0),
                }],
            }],
        };
        let nest = LoopNest {
            level: LoopLevel::upto("i", Expr::scalar("n")),
            body: vec![Stmt::For {
                var: "j".into(),
                start: Expr::i64(0),
                stop: Expr::scalar("n"),
                step: Expr::i64(1),
                body: vec![innermost],
            }],
        };
        let mut bindings = Bindings::for_table(&table);
        bindings
            .set_scalar("n", crate::ir::types::Literal::I64(3))
            .unwrap();
        bindings
            .set_array(
                "c",
                ArrayRef::new(
                    ArrayData::new([3usize, 3, 3].as_slice(), Buf::F64(vec![0.0; 27])).unwrap(),
                ),
            )
            .unwrap();
        let (fused, _, _) = fuse(&nest, &[], &bindings, &LoopOptions::default()).unwrap();
        assert_eq!(fused.levels.len(), 3);
        // The fourth loop stays in the body.
        assert!(matches!(fused.body.as_slice(), [Stmt::For { var, .. }] if var == "l"));
    }
}
