//! Emission driver with the single conservative retry.
//!
//! A first pass lets branch encoders pick short encodings from instruction
//! distance estimates. If one of those guesses turns out wrong the
//! assembler reports a range violation; the builder is then reset, switched
//! to conservative label ranges and the unit is emitted exactly once more.
//! A range violation in the conservative pass is an internal error.

use log::{debug, warn};

use super::builder::CompilationResultBuilder;
use super::error::{EmitError, EmitResult, EncodingError};
use super::lir::LirOp;
use super::result::CompilationResult;

/// How a single emission pass ended, short of a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Complete,
    /// A branch displacement exceeded its encoding; emit again
    /// conservatively.
    RetryConservative(EncodingError),
}

/// Run `emit_lir` and `finish` once.
pub fn emit_pass<O: LirOp>(crb: &mut CompilationResultBuilder<'_, O>) -> EmitResult<PassOutcome> {
    match crb.emit_lir().and_then(|()| crb.finish()) {
        Ok(()) => Ok(PassOutcome::Complete),
        Err(EmitError::Encoding(e @ EncodingError::BranchTargetOutOfBounds { .. })) => {
            Ok(PassOutcome::RetryConservative(e))
        }
        Err(e) => Err(e),
    }
}

/// Emit the unit held by `crb`, retrying once in conservative mode. A
/// failed attempt yields no result.
pub fn emit_code<O: LirOp>(
    mut crb: CompilationResultBuilder<'_, O>,
) -> EmitResult<CompilationResult> {
    crb.build_label_offsets();
    match emit_pass(&mut crb)? {
        PassOutcome::Complete => {}
        PassOutcome::RetryConservative(violation) => {
            warn!(
                "{}: {violation}; re-emitting with conservative label ranges",
                crb.lir().name()
            );
            crb.set_conservative_label_ranges();
            crb.reset_for_emitting_code();
            if let PassOutcome::RetryConservative(again) = emit_pass(&mut crb)? {
                return Err(EmitError::internal(format!(
                    "branch target out of range in conservative mode: {again}"
                ))
                .add_context("compilation", crb.lir().name()));
            }
        }
    }
    debug!(
        "{}: emitted {} bytes{}",
        crb.lir().name(),
        crb.result().code_size(),
        if crb.uses_conservative_label_ranges() {
            " (conservative)"
        } else {
            ""
        }
    );
    crb.into_result()
}
