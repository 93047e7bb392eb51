// rewrite.rs — Rewrite readers to call their wrappers
//
// Once a wrapper is resolved, every reader named by the request has each call
// of the source renamed to the wrapper, in every definition it currently has.
// The registry keeps a ledger of what was applied so that definitions attached
// later (a new update of an already wrapped reader, or a stage declared after a
// global wrap) get the same renames before anything else sees them.
//
// Precedence for one reader and one source: the newest custom wrapper wins,
// then the global wrapper. The global wrapper never applies to the source
// itself or to wrappers of that source, and no stage is rewritten to call
// itself, so wrap chains stay acyclic.
//
// Preconditions: the resolution came from `wrap::resolve_wrap` on this graph.
// Postconditions: no rewritten reader calls the source (or a superseded
//                 wrapper of it) any more; re-applying is a no-op.
// Failure modes: none.
// Side effects: mutates reader definitions and the registry ledger.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::stage::{Definition, StageGraph};
use crate::wrap::{Resolution, Substitution, WrapRegistry};

/// Rename `source` to `wrapper` in every definition of `reader`.
/// Returns whether anything changed; a reader that does not mention the
/// source is left untouched.
pub fn apply_wrap(graph: &mut StageGraph, reader: &str, source: &str, wrapper: &str) -> bool {
    if reader == wrapper || reader == source {
        debug!(reader, source, wrapper, "skipping self-wrap");
        return false;
    }
    let Some(stage) = graph.get_mut(reader) else {
        return false;
    };
    let mut changed = false;
    for index in 0..stage.definition_count() {
        if let Some(def) = stage.definition_mut(index) {
            changed |= rename_in_definition(def, source, wrapper);
        }
    }
    if changed {
        debug!(reader, source, wrapper, "rewrote reader");
    }
    changed
}

fn rename_in_definition(def: &mut Definition, source: &str, wrapper: &str) -> bool {
    if !def.calls_name(source) {
        return false;
    }
    def.rename_calls(source, wrapper)
}

/// The wrapper `reader` should call in place of `source`, if any.
pub fn effective_wrapper<'r>(
    graph: &StageGraph,
    registry: &'r WrapRegistry,
    reader: &str,
    source: &str,
) -> Option<&'r str> {
    if reader == source {
        return None;
    }
    if let Some(custom) = registry.custom_wrapper(reader, source) {
        return Some(custom);
    }
    let global = registry.global_wrapper_of(source)?;
    let is_wrapper_of_source = graph
        .get(reader)
        .map(|s| s.is_wrapper_of(source))
        .unwrap_or(false);
    if reader == global || is_wrapper_of_source {
        None
    } else {
        Some(global)
    }
}

/// Apply a resolved wrap to its readers and record it in the ledger.
pub fn commit(graph: &mut StageGraph, registry: &mut WrapRegistry, res: &Resolution) {
    if res.key.is_global() {
        commit_global(graph, registry, res);
    } else {
        commit_custom(graph, registry, res);
    }
}

fn commit_custom(graph: &mut StageGraph, registry: &mut WrapRegistry, res: &Resolution) {
    let readers: Vec<String> = res.key.readers().map(str::to_string).collect();
    for reader in &readers {
        if reader == &res.source {
            debug!(reader = %reader, "skipping self-wrap");
            continue;
        }
        // Wrappers this reader was using for the same source are superseded.
        let mut superseded: Vec<String> = registry
            .custom_for(reader)
            .iter()
            .filter(|s| s.source == res.source && s.wrapper != res.wrapper)
            .map(|s| s.wrapper.clone())
            .collect();
        if let Some(global) = registry.global_wrapper_of(&res.source) {
            if global != res.wrapper {
                superseded.push(global.to_string());
            }
        }

        apply_wrap(graph, reader, &res.source, &res.wrapper);
        for old in &superseded {
            apply_wrap(graph, reader, old, &res.wrapper);
        }
        registry.record_custom(
            reader,
            Substitution {
                source: res.source.clone(),
                wrapper: res.wrapper.clone(),
            },
        );
    }
}

fn commit_global(graph: &mut StageGraph, registry: &mut WrapRegistry, res: &Resolution) {
    registry.record_global(Substitution {
        source: res.source.clone(),
        wrapper: res.wrapper.clone(),
    });
    for name in graph.readers_of(&res.source) {
        if effective_wrapper(graph, registry, &name, &res.source) == Some(res.wrapper.as_str()) {
            apply_wrap(graph, &name, &res.source, &res.wrapper);
        }
    }
}

/// Replay the ledger onto definition `index` of `stage` (0 = initialization,
/// `k + 1` = update `k`). Call this whenever a definition is attached.
pub fn replay(graph: &mut StageGraph, registry: &WrapRegistry, stage: &str, index: usize) -> bool {
    let Some(current) = graph.get(stage) else {
        return false;
    };
    let Some(def) = (if index == 0 {
        current.init.as_ref()
    } else {
        current.updates.get(index - 1)
    }) else {
        return false;
    };

    let renames: Vec<(String, String)> = def
        .calls()
        .into_iter()
        .filter_map(|callee| {
            final_wrapper(graph, registry, stage, &callee).map(|wrapper| (callee, wrapper))
        })
        .collect();

    let mut changed = false;
    if let Some(def) = graph.get_mut(stage).and_then(|s| s.definition_mut(index)) {
        for (source, wrapper) in &renames {
            trace!(stage, source = %source, wrapper = %wrapper, index, "replaying wrap");
            changed |= rename_in_definition(def, source, wrapper);
        }
    }
    changed
}

/// Follow wrappers of wrappers from `callee` to the last one `stage` should
/// call. Each wrapper is visited once, so the walk ends on any ledger.
fn final_wrapper(graph: &StageGraph, registry: &WrapRegistry, stage: &str, callee: &str) -> Option<String> {
    let mut seen = BTreeSet::from([callee.to_string()]);
    let mut current = callee.to_string();
    while let Some(next) = effective_wrapper(graph, registry, stage, &current) {
        if !seen.insert(next.to_string()) {
            break;
        }
        current = next.to_string();
    }
    (current != callee).then_some(current)
}
