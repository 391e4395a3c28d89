/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Structured diagnostic facts produced by the checker.
//!
//! Rendering is left to the embedder; a diagnostic carries its kind, a
//! primary location and an ordered list of role-tagged notes.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::ir::{Operand, SourceLoc};
use crate::{ConcurrencyMode, FxHashMap, FxHashSet, Inst};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum DiagnosticKind {
    /// A region is used after being transferred to another domain.
    UsedAfterTransfer,
    /// A region owned by the caller, or by an actor, is transferred.
    TransferOfNonTransferable,
    /// A call into another domain returns a non-Sendable value.
    NonSendableResult,
    /// An escaping closure captures an `inout` parameter.
    InoutCapturedByEscapingClosure,
    UsedAfterConsume,
    ConsumedMoreThanOnce,
    /// The same consuming use is reached again around a loop.
    ConsumedInLoop,
    /// An `inout` parameter is consumed and not reinitialized at exit.
    ConsumedNotReinitialized,
    /// As above, in a closure body that may run more than once.
    ConsumedInClosure,
    /// Storage consumed inside an exclusive access and not reinitialized
    /// before the access ends.
    ConsumedDuringExclusiveAccess,
}

impl DiagnosticKind {
    /// Isolation findings depend on the language mode; ownership
    /// findings are always errors.
    pub fn is_isolation(self) -> bool {
        matches!(
            self,
            DiagnosticKind::UsedAfterTransfer
                | DiagnosticKind::TransferOfNonTransferable
                | DiagnosticKind::NonSendableResult
                | DiagnosticKind::InoutCapturedByEscapingClosure
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum NoteRole {
    ConsumingUse,
    NonConsumingUse,
    TransferSite,
    AccessScope,
}

impl NoteRole {
    fn message(self) -> &'static str {
        match self {
            NoteRole::ConsumingUse => "consumed here",
            NoteRole::NonConsumingUse => "use here could race",
            NoteRole::TransferSite => "transferred here",
            NoteRole::AccessScope => "exclusive access begins here",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Location {
    pub inst: Inst,
    pub loc: SourceLoc,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.loc)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Note {
    pub role: NoteRole,
    pub location: Location,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub primary: Location,
    /// Name of the offending binding, or of the callee.
    pub name: String,
    /// Kind-specific detail, e.g. the isolation of the region.
    pub detail: Option<String>,
    pub notes: Vec<Note>,
}

impl Diagnostic {
    /// The one-line message for this diagnostic.
    pub fn message(&self) -> String {
        let name = &self.name;
        let detail = self.detail.as_deref().unwrap_or("");
        match self.kind {
            DiagnosticKind::UsedAfterTransfer => {
                alloc::format!("transferring '{}' may cause a race", name)
            }
            DiagnosticKind::TransferOfNonTransferable => alloc::format!(
                "transferring '{}' may cause a race: it is {} and cannot be transferred",
                name,
                detail
            ),
            DiagnosticKind::NonSendableResult => alloc::format!(
                "non-Sendable result of '{}' cannot be returned from {} code",
                name,
                detail
            ),
            DiagnosticKind::InoutCapturedByEscapingClosure => {
                alloc::format!("escaping closure captures 'inout' parameter '{}'", name)
            }
            DiagnosticKind::UsedAfterConsume => alloc::format!("'{}' used after consume", name),
            DiagnosticKind::ConsumedMoreThanOnce => {
                alloc::format!("'{}' consumed more than once", name)
            }
            DiagnosticKind::ConsumedInLoop => {
                alloc::format!("'{}' consumed by a use in a loop", name)
            }
            DiagnosticKind::ConsumedNotReinitialized => alloc::format!(
                "'{}' consumed but not reinitialized before end of function",
                name
            ),
            DiagnosticKind::ConsumedInClosure => alloc::format!(
                "'{}' consumed in closure but not reinitialized before end of closure",
                name
            ),
            DiagnosticKind::ConsumedDuringExclusiveAccess => alloc::format!(
                "'{}' consumed but not reinitialized before end of access",
                name
            ),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.primary, self.message())?;
        for note in &self.notes {
            write!(f, "\n  note: {}: {}", note.location, note.role.message())?;
        }
        Ok(())
    }
}

/// The findings for one function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct CheckerOutput {
    pub function: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl CheckerOutput {
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }
}

/// Collects diagnostics for one function: decides severities, groups
/// racing uses under their transfer site and drops duplicates.
pub(crate) struct DiagnosticSink {
    mode: ConcurrencyMode,
    diagnostics: Vec<Diagnostic>,
    races: FxHashMap<Operand, usize>,
    seen: FxHashSet<(DiagnosticKind, Inst, Inst)>,
}

impl DiagnosticSink {
    pub fn new(mode: ConcurrencyMode) -> Self {
        DiagnosticSink {
            mode,
            diagnostics: Vec::new(),
            races: FxHashMap::default(),
            seen: FxHashSet::default(),
        }
    }

    /// Severity of a finding, or `None` if it is squelched. Findings
    /// caused by a preconcurrency type crossing as itself are squelched
    /// in compatibility mode and downgraded to warnings in strict mode.
    fn severity(&self, kind: DiagnosticKind, preconcurrency: bool) -> Option<Severity> {
        if !kind.is_isolation() {
            return Some(Severity::Error);
        }
        match (self.mode, preconcurrency) {
            (ConcurrencyMode::Compat, true) => None,
            (ConcurrencyMode::Compat, false) => Some(Severity::Warning),
            (ConcurrencyMode::Strict, true) => Some(Severity::Warning),
            (ConcurrencyMode::Strict, false) => Some(Severity::Error),
        }
    }

    pub fn report(
        &mut self,
        kind: DiagnosticKind,
        primary: Location,
        name: String,
        detail: Option<String>,
        notes: Vec<Note>,
        preconcurrency: bool,
    ) {
        let Some(severity) = self.severity(kind, preconcurrency) else {
            trace!("squelched {:?} at {:?}", kind, primary.inst);
            return;
        };
        let key = (
            kind,
            primary.inst,
            notes.first().map_or(Inst::invalid(), |n| n.location.inst),
        );
        if !self.seen.insert(key) {
            return;
        }
        trace!("diagnostic {:?} at {:?} on '{}'", kind, primary.inst, name);
        self.diagnostics.push(Diagnostic {
            kind,
            severity,
            primary,
            name,
            detail,
            notes,
        });
    }

    /// A use racing with the transfer at `site`. All uses racing with
    /// one transfer share a single diagnostic.
    pub fn report_race(
        &mut self,
        site: Operand,
        primary: Location,
        name: String,
        use_loc: Location,
        preconcurrency: bool,
    ) {
        let note = Note {
            role: NoteRole::NonConsumingUse,
            location: use_loc,
        };
        if let Some(&idx) = self.races.get(&site) {
            let notes = &mut self.diagnostics[idx].notes;
            if !notes.iter().any(|n| n.location.inst == use_loc.inst) {
                notes.push(note);
            }
            return;
        }
        let Some(severity) = self.severity(DiagnosticKind::UsedAfterTransfer, preconcurrency)
        else {
            trace!("squelched race on '{}' at {:?}", name, use_loc.inst);
            return;
        };
        trace!("race: '{}' transferred at {:?} used at {:?}", name, site.user, use_loc.inst);
        self.races.insert(site, self.diagnostics.len());
        self.diagnostics.push(Diagnostic {
            kind: DiagnosticKind::UsedAfterTransfer,
            severity,
            primary,
            name,
            detail: None,
            notes: alloc::vec![note],
        });
    }

    pub fn finish(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Value;
    use alloc::format;
    use alloc::vec;

    fn loc(i: usize) -> Location {
        Location {
            inst: Inst::new(i),
            loc: SourceLoc::new(i as u32, 1),
        }
    }

    #[test]
    fn test_races_group_by_transfer_site() {
        let mut sink = DiagnosticSink::new(ConcurrencyMode::Strict);
        let site = Operand {
            user: Inst::new(1),
            index: 0,
            value: Value::new(0),
        };
        sink.report_race(site, loc(1), "x".into(), loc(2), false);
        sink.report_race(site, loc(1), "x".into(), loc(3), false);
        sink.report_race(site, loc(1), "x".into(), loc(3), false);
        let diags = sink.finish();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, Severity::Error);
        assert_eq!(diags[0].notes.len(), 2);
        assert_eq!(
            format!("{}", diags[0]),
            "error: 1:1: transferring 'x' may cause a race\n  \
             note: 2:1: use here could race\n  \
             note: 3:1: use here could race"
        );
    }

    #[test]
    fn test_severity_by_mode() {
        let mut compat = DiagnosticSink::new(ConcurrencyMode::Compat);
        compat.report(DiagnosticKind::NonSendableResult, loc(1), "f".into(), None, vec![], false);
        compat.report(DiagnosticKind::NonSendableResult, loc(2), "g".into(), None, vec![], true);
        compat.report(DiagnosticKind::ConsumedMoreThanOnce, loc(3), "x".into(), None, vec![], false);
        let diags = compat.finish();
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].severity, Severity::Warning);
        assert_eq!(diags[1].severity, Severity::Error);

        let mut strict = DiagnosticSink::new(ConcurrencyMode::Strict);
        strict.report(DiagnosticKind::NonSendableResult, loc(2), "g".into(), None, vec![], true);
        assert_eq!(strict.finish()[0].severity, Severity::Warning);
    }
}
