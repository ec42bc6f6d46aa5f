//! Static analysis pipeline: validation, fusion, dependence verdicts,
//! reduction classification. The output plan is the call-independent part
//! of a compilation; ranges and bounds are re-resolved on every call.

pub mod accesses;
pub mod affine;
pub mod bounds;
pub mod dependence;
pub mod fusion;
pub mod reduction;
pub mod typecheck;

use std::collections::BTreeMap;

use crate::analysis::accesses::CollectedAccesses;
use crate::analysis::dependence::{detect_recursion, Verdict};
use crate::analysis::fusion::fuse;
use crate::analysis::reduction::ReductionKind;
use crate::error::{OffloadError, Result};
use crate::hashing::structural_hash;
use crate::ir::program::{LoopLevel, Program, ProgramKind, Stmt};
use crate::options::LoopOptions;
use crate::symbols::Bindings;

/// Everything the analysis pipeline proves about one program against one
/// set of bindings. Cached per call-site and re-validated cheaply on later
/// calls.
#[derive(Debug, Clone)]
pub struct OffloadPlan {
    /// Parallel levels, outermost first. Empty for reductions.
    pub levels: Vec<LoopLevel>,
    /// Body under the innermost parallel level.
    pub body: Vec<Stmt>,
    pub verdict: Verdict,
    pub accesses: CollectedAccesses,
    pub reduction: Option<ReductionKind>,
    pub structural_hash: u64,
    /// Declared names sharing one backing store, groups of two or more,
    /// each group and the list itself sorted. The cached plan only stays
    /// valid while this set is unchanged.
    pub alias_groups: Vec<Vec<String>>,
}

impl OffloadPlan {
    pub fn level_vars(&self) -> Vec<String> {
        self.levels.iter().map(|l| l.var.clone()).collect()
    }

    pub fn is_reduce(&self) -> bool {
        self.reduction.is_some()
    }
}

/// Run the call-independent pipeline: validate, fuse, analyze dependences,
/// classify reductions. Does not touch bounds; those depend on the values
/// bound at each call.
pub fn build_plan(
    program: &Program,
    bindings: &Bindings,
    options: &LoopOptions,
) -> Result<OffloadPlan> {
    typecheck::validate_program(program)?;
    match &program.kind {
        ProgramKind::Loop(nest) => {
            let (fused, accesses, verdict) =
                fuse(nest, &program.functions, bindings, options)?;
            for func in &accesses.math_used {
                if options.math_fn_blacklist.contains(func.name()) {
                    return Err(OffloadError::unsupported(
                        "math builtin",
                        format!("'{}' is blacklisted for this call-site", func.name()),
                    ));
                }
            }
            if let Some(name) =
                detect_recursion(&program.functions, accesses.called.iter().map(String::as_str))
            {
                return Err(OffloadError::unsupported(
                    "call graph",
                    format!("function '{name}' is recursive"),
                ));
            }
            let groups = alias_groups(&accesses, bindings)?;
            Ok(OffloadPlan {
                levels: fused.levels,
                body: fused.body,
                verdict,
                accesses,
                reduction: None,
                structural_hash: structural_hash(program),
                alias_groups: groups,
            })
        }
        ProgramKind::Reduce(spec) => {
            // validate_program has already checked the function exists and
            // its signature fits the element type.
            let function = program
                .function(&spec.func)
                .ok_or_else(|| {
                    OffloadError::unsupported(
                        "reduction",
                        format!("combining function '{}' is not declared", spec.func),
                    )
                })?;
            let kind = reduction::classify(function, options.reduction_override)?;
            if kind == ReductionKind::Custom {
                check_custom_combiner(function, program)?;
            }
            let mut accesses = CollectedAccesses::default();
            accesses
                .accesses
                .push(crate::analysis::accesses::ArrayAccess {
                    id: 0,
                    array: spec.array.clone(),
                    kind: crate::analysis::accesses::AccessKind::Read,
                    index: Vec::new(),
                });
            let groups = alias_groups(&accesses, bindings)?;
            Ok(OffloadPlan {
                levels: Vec::new(),
                body: Vec::new(),
                verdict: Verdict::Independent,
                accesses,
                reduction: Some(kind),
                structural_hash: structural_hash(program),
                alias_groups: groups,
            })
        }
    }
}

/// Whitelisted combiners are pure by construction. An overridden combiner
/// may have a longer body, but it must stay scalar: array traffic or calls
/// inside it would not commute with the combining order.
fn check_custom_combiner(function: &crate::ir::program::Function, program: &Program) -> Result<()> {
    let accesses = accesses::collect(&function.body, &program.functions)?;
    if !accesses.accesses.is_empty()
        || !accesses.function_reads.is_empty()
        || !accesses.function_writes.is_empty()
    {
        return Err(OffloadError::unsupported(
            "reduction",
            format!("combining function '{}' touches arrays", function.name),
        ));
    }
    if !accesses.called.is_empty() {
        return Err(OffloadError::unsupported(
            "reduction",
            format!("combining function '{}' calls other functions", function.name),
        ));
    }
    Ok(())
}

/// Group the arrays the program touches by backing store, keeping the
/// groups with at least two names. The guard recomputes this on every call
/// and rebuilds the plan when the grouping moves.
pub fn alias_groups(
    accesses: &CollectedAccesses,
    bindings: &Bindings,
) -> Result<Vec<Vec<String>>> {
    let mut by_storage: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    let mut touched: Vec<&str> = accesses.arrays_touched().into_iter().collect();
    touched.sort_unstable();
    for name in touched {
        let id = bindings.array(name)?.id();
        by_storage.entry(id.0).or_default().push(name.to_string());
    }
    let mut groups: Vec<Vec<String>> = by_storage
        .into_values()
        .filter(|names| names.len() > 1)
        .collect();
    for group in &mut groups {
        group.sort_unstable();
    }
    groups.sort_unstable();
    Ok(groups)
}
