// stagec — Stage compiler core
//
// Library root: the stage graph with wrapper resolution and rewriting, a
// small lowering pass with its evaluator, and call-graph extraction and
// comparison over the lowered tree.

pub mod bounds;
pub mod callgraph;
pub mod compare;
pub mod config;
pub mod diag;
pub mod dot;
pub mod eval;
pub mod expr;
pub mod id;
pub mod ir;
pub mod lower;
pub mod pass;
pub mod pipeline;
pub mod rewrite;
pub mod scenarios;
pub mod schedule;
pub mod stage;
pub mod wrap;
