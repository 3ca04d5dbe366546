//! Edit composer: merge the fixes of one pass into a single safe patch
//!
//! Fixes are considered in diagnostic report order. A fix is accepted only if
//! none of its edits starts before the high-water mark left by previously
//! accepted edits; everything else is deferred to the next pass. Accepted
//! edits are applied in one left-to-right rewrite.

use crate::diagnostic::{Diagnostic, Edit, Fix};
use crate::span::{DocumentVersion, SourceText, Span};
use std::collections::HashSet;
use thiserror::Error;

/// A rule produced a fix that cannot be applied as written
///
/// Fatal to that one fix for that one pass; the diagnostic is still reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixConflictError {
    #[error("edit {index} has reversed span {span}")]
    Reversed { index: usize, span: Span },

    #[error("edit {index} at {span} starts before the previous edit ends ({prev_end})")]
    SelfOverlap {
        index: usize,
        span: Span,
        prev_end: usize,
    },

    #[error("edit {index} at {span} is outside the {len}-byte source")]
    OutOfBounds { index: usize, span: Span, len: usize },

    #[error("edit {index} at {span} splits a UTF-8 character")]
    SplitsCharacter { index: usize, span: Span },

    #[error("fix was computed against {found}, source is {expected}")]
    StaleVersion {
        expected: DocumentVersion,
        found: DocumentVersion,
    },
}

/// Applying a patch failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("patch targets {expected}, source is {found}")]
    VersionMismatch {
        expected: DocumentVersion,
        found: DocumentVersion,
    },

    #[error("edit at {0} does not fit the source")]
    InvalidEdit(Span),
}

/// A diagnostic whose fix was dropped, with the reason
#[derive(Debug, Clone)]
pub struct MalformedFix {
    pub diagnostic: Diagnostic,
    pub error: FixConflictError,
}

/// Non-overlapping edits for one source version, sorted by start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    version: DocumentVersion,
    edits: Vec<Edit>,
}

impl Patch {
    /// Build a patch from caller-supplied edits, checking they are sorted,
    /// disjoint and inside `source`
    pub fn new(source: &SourceText, edits: Vec<Edit>) -> Result<Self, FixConflictError> {
        check_edits(&edits, &source.text)?;
        Ok(Self {
            version: source.version,
            edits,
        })
    }

    pub fn version(&self) -> DocumentVersion {
        self.version
    }

    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Length of the text produced from a source of `input_len` bytes
    pub fn output_len(&self, input_len: usize) -> usize {
        let removed: usize = self.edits.iter().map(|e| e.span.len()).sum();
        let added: usize = self.edits.iter().map(|e| e.replacement.len()).sum();
        input_len - removed + added
    }

    /// Rewrite `source` in one left-to-right sweep, producing the next version
    pub fn apply(&self, source: &SourceText) -> Result<SourceText, PatchError> {
        if source.version != self.version {
            return Err(PatchError::VersionMismatch {
                expected: self.version,
                found: source.version,
            });
        }

        let text = source.text.as_str();
        let mut out = String::with_capacity(self.output_len(text.len()));
        let mut cursor = 0;

        for edit in &self.edits {
            let kept = text
                .get(cursor..edit.span.start)
                .ok_or(PatchError::InvalidEdit(edit.span))?;
            out.push_str(kept);
            out.push_str(&edit.replacement);
            cursor = edit.span.end;
        }
        let tail = text
            .get(cursor..)
            .ok_or(PatchError::InvalidEdit(Span::empty(cursor)))?;
        out.push_str(tail);

        Ok(SourceText {
            text: out,
            version: self.version.next(),
        })
    }
}

/// Outcome of composing one pass's fixes
#[derive(Debug, Clone, Default)]
pub struct PatchResult {
    /// Edits to apply
    pub patch: Patch,
    /// Diagnostics whose fix made it into the patch
    pub accepted: Vec<Diagnostic>,
    /// Diagnostics whose fix overlapped an accepted edit (retry next pass)
    pub rejected: Vec<Diagnostic>,
    /// Diagnostics whose fix was malformed (reported without a fix)
    pub malformed: Vec<MalformedFix>,
}

impl PatchResult {
    pub fn is_empty(&self) -> bool {
        self.patch.is_empty()
    }
}

/// Choose the non-overlapping fixes of one pass
///
/// `diagnostics` are considered in `(span.start, span.end, rule_id)` order, so
/// on conflict the earlier-sorted diagnostic wins. Two insertions at the same
/// offset from different diagnostics conflict as well: their relative order
/// would otherwise be arbitrary.
pub fn compose(diagnostics: &[Diagnostic], source: &SourceText) -> PatchResult {
    let mut ordered: Vec<&Diagnostic> = diagnostics.iter().filter(|d| d.has_fix()).collect();
    ordered.sort_by(|a, b| {
        (a.span.start, a.span.end, &a.rule_id).cmp(&(b.span.start, b.span.end, &b.rule_id))
    });

    let mut result = PatchResult {
        patch: Patch {
            version: source.version,
            edits: Vec::new(),
        },
        ..PatchResult::default()
    };
    let mut high_water = 0;
    let mut insertions: HashSet<usize> = HashSet::new();

    for diag in ordered {
        let Some(fix) = &diag.fix else { continue };

        if let Err(error) = check_fix(diag, fix, source) {
            log::warn!(
                "rule {} produced a malformed fix at {}: {}",
                diag.rule_id,
                diag.span,
                error
            );
            result.malformed.push(MalformedFix {
                diagnostic: diag.clone().without_fix(),
                error,
            });
            continue;
        }

        let conflicts = fix.edits.iter().any(|edit| {
            edit.span.start < high_water
                || (edit.is_insertion() && insertions.contains(&edit.span.start))
        });
        if conflicts {
            log::trace!(
                "deferring fix of {} at {} (high-water mark {})",
                diag.rule_id,
                diag.span,
                high_water
            );
            result.rejected.push(diag.clone());
            continue;
        }

        for edit in &fix.edits {
            high_water = high_water.max(edit.span.end);
            if edit.is_insertion() {
                insertions.insert(edit.span.start);
            }
            result.patch.edits.push(edit.clone());
        }
        result.accepted.push(diag.clone());
    }

    log::debug!(
        "composed patch for {}: {} edits, {} deferred, {} malformed",
        source.version,
        result.patch.edits.len(),
        result.rejected.len(),
        result.malformed.len()
    );
    result
}

fn check_fix(diag: &Diagnostic, fix: &Fix, source: &SourceText) -> Result<(), FixConflictError> {
    if diag.version != source.version {
        return Err(FixConflictError::StaleVersion {
            expected: source.version,
            found: diag.version,
        });
    }
    check_edits(&fix.edits, &source.text)
}

fn check_edits(edits: &[Edit], text: &str) -> Result<(), FixConflictError> {
    let mut prev_end: Option<usize> = None;

    for (index, edit) in edits.iter().enumerate() {
        let span = edit.span;
        if !span.is_well_formed() {
            return Err(FixConflictError::Reversed { index, span });
        }
        if span.end > text.len() {
            return Err(FixConflictError::OutOfBounds {
                index,
                span,
                len: text.len(),
            });
        }
        if !text.is_char_boundary(span.start) || !text.is_char_boundary(span.end) {
            return Err(FixConflictError::SplitsCharacter { index, span });
        }
        if let Some(prev_end) = prev_end {
            if span.start < prev_end {
                return Err(FixConflictError::SelfOverlap {
                    index,
                    span,
                    prev_end,
                });
            }
        }
        prev_end = Some(span.end);
    }

    Ok(())
}
