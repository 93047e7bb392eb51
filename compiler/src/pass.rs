// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the passes a scenario run goes through, their dependency edges and
// the artifacts they produce. The CLI asks `required_passes` for the minimal
// ordered subset behind each --emit target and runs only those.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    /// Declare stages, attach definitions, resolve wraps, attach schedules.
    Build,
    Lower,
    ExtractCalls,
    /// Compare the extracted call graph with the expected one.
    Verify,
    /// Evaluate the lowered tree and check output values.
    Realize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Pipeline,  // Pipeline + WrapRegistry
    Module,    // lower::Module
    CallGraph, // callgraph::CallGraph
    Verdict,   // Result<(), CallGraphMismatch>
    Buffer,    // eval::Buffer
}

// ── Pass descriptor ────────────────────────────────────────────────────────

pub struct PassDescriptor {
    pub name: &'static str,
    pub inputs: &'static [PassId],
    pub outputs: &'static [ArtifactId],
    /// Documentation only.
    pub invariants: &'static str,
}

pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Build => PassDescriptor {
            name: "build",
            inputs: &[],
            outputs: &[ArtifactId::Pipeline],
            invariants: "readers call their resolved wrapper, reads relation acyclic",
        },
        PassId::Lower => PassDescriptor {
            name: "lower",
            inputs: &[PassId::Build],
            outputs: &[ArtifactId::Module],
            invariants: "one producer region per realized stage",
        },
        PassId::ExtractCalls => PassDescriptor {
            name: "extract_calls",
            inputs: &[PassId::Lower],
            outputs: &[ArtifactId::CallGraph],
            invariants: "every producer region has a key",
        },
        PassId::Verify => PassDescriptor {
            name: "verify",
            inputs: &[PassId::ExtractCalls],
            outputs: &[ArtifactId::Verdict],
            invariants: "callee order ignored",
        },
        PassId::Realize => PassDescriptor {
            name: "realize",
            inputs: &[PassId::Verify],
            outputs: &[ArtifactId::Buffer],
            invariants: "every output point matches the reference",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

pub const ALL_PASSES: [PassId; 5] = [
    PassId::Build,
    PassId::Lower,
    PassId::ExtractCalls,
    PassId::Verify,
    PassId::Realize,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
