// wrap.rs — Wrapper resolution and the wrap registry
//
// Decides, for a (source, reader set) pair, which indirection stage readers
// should call: an existing wrapper when the pair was seen before, otherwise a
// freshly synthesized one that copies the source verbatim. Resolution never
// touches the readers; the rewrite pass does that as a separate step.
//
// Preconditions: the source is a defined stage or a declared image parameter;
//                every reader is a stage of the same graph.
// Postconditions: at most one wrapper per (source, reader key) for the life of
//                 the registry; a repeated request returns the same name.
// Failure modes: unknown source, undefined source, unknown reader. Validation
//                happens before any mutation, so a failure leaves no trace.
// Side effects: on creation, inserts the wrapper stage and registers it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tracing::debug;

use crate::expr::Expr;
use crate::id::IdAllocator;
use crate::stage::{Definition, Stage, StageGraph, StageKind};

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WrapError {
    #[error("unknown wrap source '{0}'")]
    UnknownSource(String),
    #[error("wrap source '{0}' has no definition yet")]
    UndefinedSource(String),
    #[error("unknown reader '{reader}' in wrap of '{wrapped}'")]
    UnknownReader { wrapped: String, reader: String },
}

// ── Reader key ──────────────────────────────────────────────────────────────

/// Canonical identity of a reader set: the global marker, or the sorted set
/// of reader names (so `{a, b, c}` and `{c, b, a}` collide).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReaderKey {
    Global,
    Readers(BTreeSet<String>),
}

impl ReaderKey {
    /// An empty reader list means "global".
    pub fn from_readers<I, S>(readers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = readers.into_iter().map(Into::into).collect();
        if set.is_empty() {
            ReaderKey::Global
        } else {
            ReaderKey::Readers(set)
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, ReaderKey::Global)
    }

    /// Reader names, empty for the global key.
    pub fn readers(&self) -> impl Iterator<Item = &str> {
        let set = match self {
            ReaderKey::Global => None,
            ReaderKey::Readers(set) => Some(set),
        };
        set.into_iter().flatten().map(String::as_str)
    }
}

impl fmt::Display for ReaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderKey::Global => write!(f, "global"),
            ReaderKey::Readers(set) => {
                write!(f, "{{")?;
                for (i, name) in set.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", name)?;
                }
                write!(f, "}}")
            }
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// A source → wrapper rename that has been applied to some reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub source: String,
    pub wrapper: String,
}

/// Compilation-unit-scoped wrap state: the wrapper cache plus the ledger of
/// substitutions the rewrite pass replays onto definitions attached later.
#[derive(Debug, Default)]
pub struct WrapRegistry {
    wrappers: HashMap<(String, ReaderKey), String>,
    /// Reader → custom substitutions, oldest first.
    custom: HashMap<String, Vec<Substitution>>,
    global: Vec<Substitution>,
}

impl WrapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, source: &str, key: &ReaderKey) -> Option<&str> {
        self.wrappers
            .get(&(source.to_string(), key.clone()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    /// Every registered wrapper as `(source, key, wrapper)`, sorted by
    /// wrapper name.
    pub fn entries(&self) -> Vec<(&str, &ReaderKey, &str)> {
        let mut entries: Vec<_> = self
            .wrappers
            .iter()
            .map(|((source, key), wrapper)| (source.as_str(), key, wrapper.as_str()))
            .collect();
        entries.sort_by(|a, b| a.2.cmp(b.2));
        entries
    }

    fn register(&mut self, source: &str, key: ReaderKey, wrapper: &str) {
        self.wrappers
            .insert((source.to_string(), key), wrapper.to_string());
    }

    pub fn global_wrapper_of(&self, source: &str) -> Option<&str> {
        self.global
            .iter()
            .find(|s| s.source == source)
            .map(|s| s.wrapper.as_str())
    }

    pub fn custom_for(&self, reader: &str) -> &[Substitution] {
        self.custom.get(reader).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Latest custom wrapper of `source` recorded for `reader`.
    pub fn custom_wrapper(&self, reader: &str, source: &str) -> Option<&str> {
        self.custom_for(reader)
            .iter()
            .rev()
            .find(|s| s.source == source)
            .map(|s| s.wrapper.as_str())
    }

    /// Record a custom substitution; re-recording moves it to the newest slot.
    pub(crate) fn record_custom(&mut self, reader: &str, sub: Substitution) {
        let subs = self.custom.entry(reader.to_string()).or_default();
        subs.retain(|s| *s != sub);
        subs.push(sub);
    }

    pub(crate) fn record_global(&mut self, sub: Substitution) {
        if !self.global.contains(&sub) {
            self.global.push(sub);
        }
    }
}

// ── Resolution ──────────────────────────────────────────────────────────────

/// Outcome of a wrap request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Stage actually wrapped (an image name resolves to its accessor stage).
    pub source: String,
    pub key: ReaderKey,
    pub wrapper: String,
    /// False when an existing wrapper was reused.
    pub created: bool,
}

/// Map a requested source name to the stage that gets wrapped.
fn resolve_source<'g>(graph: &'g StageGraph, name: &str) -> Result<&'g Stage, WrapError> {
    if let Some(stage) = graph.get(name) {
        return Ok(stage);
    }
    if graph.image_dims(name).is_some() {
        let accessor = graph
            .iter()
            .find(|s| matches!(&s.kind, StageKind::ImageAccessor { image } if image == name));
        if let Some(stage) = accessor {
            return Ok(stage);
        }
    }
    Err(WrapError::UnknownSource(name.to_string()))
}

/// Return the wrapper `readers` should call instead of `source`, creating it
/// on first use. An empty `readers` slice requests the global wrapper.
pub fn resolve_wrap(
    graph: &mut StageGraph,
    registry: &mut WrapRegistry,
    ids: &mut IdAllocator,
    suffix: &str,
    source: &str,
    readers: &[String],
) -> Result<Resolution, WrapError> {
    let stage = resolve_source(graph, source)?;
    if !stage.is_defined() {
        return Err(WrapError::UndefinedSource(stage.name.clone()));
    }
    for reader in readers {
        if !graph.contains(reader) {
            return Err(WrapError::UnknownReader {
                wrapped: source.to_string(),
                reader: reader.clone(),
            });
        }
    }

    let source = stage.name.clone();
    let args = stage.args.clone();
    let key = ReaderKey::from_readers(readers.iter().cloned());

    if let Some(existing) = registry.lookup(&source, &key) {
        debug!(source = %source, key = %key, wrapper = existing, "reusing wrapper");
        return Ok(Resolution {
            source,
            key,
            wrapper: existing.to_string(),
            created: false,
        });
    }

    let mut name = format!("{}{}.{}", source, suffix, ids.alloc_wrapper().0);
    while graph.contains_name(&name) {
        name = format!("{}{}.{}", source, suffix, ids.alloc_wrapper().0);
    }

    let vars: Vec<Expr> = args.iter().map(Expr::var).collect();
    let mut wrapper = Stage::new(
        ids.alloc_stage(),
        name.clone(),
        StageKind::Wrapper {
            source: source.clone(),
        },
    );
    wrapper.args = args;
    wrapper.init = Some(Definition {
        lhs: vars.clone(),
        rhs: Expr::call(source.clone(), vars),
        rdom: None,
    });
    graph.insert(wrapper);
    registry.register(&source, key.clone(), &name);
    debug!(source = %source, key = %key, wrapper = %name, "created wrapper");

    Ok(Resolution {
        source,
        key,
        wrapper: name,
        created: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(names: &[&str]) -> (StageGraph, IdAllocator) {
        let mut ids = IdAllocator::new();
        let mut graph = StageGraph::new();
        graph.declare_image("img", 2);
        let mut accessor = Stage::new(
            ids.alloc_stage(),
            "img_im",
            StageKind::ImageAccessor {
                image: "img".into(),
            },
        );
        let vars = vec![Expr::var("_0"), Expr::var("_1")];
        accessor.args = vec!["_0".into(), "_1".into()];
        accessor.init = Some(Definition {
            lhs: vars.clone(),
            rhs: Expr::call("img", vars),
            rdom: None,
        });
        graph.insert(accessor);
        for name in names {
            let mut stage = Stage::new(ids.alloc_stage(), *name, StageKind::Declared);
            stage.args = vec!["x".into(), "y".into()];
            stage.init = Some(Definition {
                lhs: vec![Expr::var("x"), Expr::var("y")],
                rhs: Expr::call("img_im", vec![Expr::var("x"), Expr::var("y")]),
                rdom: None,
            });
            graph.insert(stage);
        }
        (graph, ids)
    }

    fn readers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn repeated_request_returns_same_wrapper() {
        let (mut graph, mut ids) = graph_with(&["f"]);
        let mut reg = WrapRegistry::new();
        let first = resolve_wrap(&mut graph, &mut reg, &mut ids, ".in", "img", &readers(&["f"])).unwrap();
        assert!(first.created);
        for _ in 0..5 {
            let again =
                resolve_wrap(&mut graph, &mut reg, &mut ids, ".in", "img", &readers(&["f"])).unwrap();
            assert_eq!(again.wrapper, first.wrapper);
            assert!(!again.created);
        }
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reader_order_is_irrelevant() {
        let (mut graph, mut ids) = graph_with(&["e", "f", "g", "h"]);
        let mut reg = WrapRegistry::new();
        let a = resolve_wrap(&mut graph, &mut reg, &mut ids, ".in", "img", &readers(&["e", "f", "g"])).unwrap();
        let b = resolve_wrap(&mut graph, &mut reg, &mut ids, ".in", "img", &readers(&["g", "f", "e"])).unwrap();
        assert_eq!(a.wrapper, b.wrapper);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn global_and_custom_keys_differ() {
        let (mut graph, mut ids) = graph_with(&["f"]);
        let mut reg = WrapRegistry::new();
        let global = resolve_wrap(&mut graph, &mut reg, &mut ids, ".in", "img", &[]).unwrap();
        let custom = resolve_wrap(&mut graph, &mut reg, &mut ids, ".in", "img", &readers(&["f"])).unwrap();
        assert_ne!(global.wrapper, custom.wrapper);
        assert!(global.key.is_global());
        assert_eq!(global.source, "img_im");
        assert_eq!(global.wrapper, "img_im.in.0");
        assert_eq!(custom.wrapper, "img_im.in.1");
    }

    #[test]
    fn wrapper_copies_source_with_its_args() {
        let (mut graph, mut ids) = graph_with(&["f"]);
        let mut reg = WrapRegistry::new();
        let res = resolve_wrap(&mut graph, &mut reg, &mut ids, ".in", "f", &[]).unwrap();
        let wrapper = graph.get(&res.wrapper).unwrap();
        assert!(wrapper.is_wrapper_of("f"));
        assert_eq!(wrapper.args, vec!["x".to_string(), "y".to_string()]);
        let init = wrapper.init.as_ref().unwrap();
        assert_eq!(
            init.rhs,
            Expr::call("f", vec![Expr::var("x"), Expr::var("y")])
        );
        assert!(!wrapper.has_updates());
    }

    #[test]
    fn failures_leave_no_trace() {
        let (mut graph, mut ids) = graph_with(&["f"]);
        let mut reg = WrapRegistry::new();
        let before = graph.len();

        let err = resolve_wrap(&mut graph, &mut reg, &mut ids, ".in", "nope", &[]).unwrap_err();
        assert_eq!(err, WrapError::UnknownSource("nope".into()));

        let err = resolve_wrap(&mut graph, &mut reg, &mut ids, ".in", "img", &readers(&["f", "ghost"]))
            .unwrap_err();
        assert!(matches!(err, WrapError::UnknownReader { ref reader, .. } if reader == "ghost"));

        assert_eq!(graph.len(), before);
        assert!(reg.is_empty());
        assert_eq!(ids.peek_wrapper().0, 0);
    }

    #[test]
    fn undefined_source_is_rejected() {
        let (mut graph, mut ids) = graph_with(&[]);
        graph.insert(Stage::new(ids.alloc_stage(), "pending", StageKind::Declared));
        let mut reg = WrapRegistry::new();
        let err = resolve_wrap(&mut graph, &mut reg, &mut ids, ".in", "pending", &[]).unwrap_err();
        assert_eq!(err, WrapError::UndefinedSource("pending".into()));
    }

    #[test]
    fn reader_key_display() {
        assert_eq!(ReaderKey::from_readers(Vec::<String>::new()).to_string(), "global");
        assert_eq!(ReaderKey::from_readers(["c", "a", "b"]).to_string(), "{a, b, c}");
    }
}
