// diag.rs — Unified diagnostics model
//
// Shared diagnostic type for the phases that report recoverable conditions
// instead of failing (call-graph extraction today, lowering notes tomorrow).
// Hard failures use the per-module error enums; a diagnostic is for things the
// caller may want to see but that do not stop the phase.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0310`, `W0311`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered codes. `E01xx` wrap, `E02xx` lowering, `E03xx`/`W03xx`
/// call-graph extraction, `E04xx` verification.
pub mod codes {
    use super::DiagCode;

    pub const E0101: DiagCode = DiagCode("E0101"); // unknown wrap source
    pub const E0102: DiagCode = DiagCode("E0102"); // unknown wrap reader
    pub const E0201: DiagCode = DiagCode("E0201"); // cycle in the reads relation
    pub const E0310: DiagCode = DiagCode("E0310"); // producer region for unknown stage
    pub const W0311: DiagCode = DiagCode("W0311"); // malformed producer region
    pub const E0401: DiagCode = DiagCode("E0401"); // call graph mismatch
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    /// Stage the diagnostic is about, when there is one.
    pub stage: Option<String>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, stage, or hint.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            stage: None,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the stage this diagnostic concerns.
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: ", level, code)?;
        } else {
            write!(f, "{}: ", level)?;
        }
        if let Some(stage) = &self.stage {
            write!(f, "{}: ", stage)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
