//! The filter pipeline that inspects every instruction received from
//! `guacd` before it reaches the client. A [`Filter`] may pass an
//! instruction through unchanged, drop it silently, or raise a
//! [`GuacError`] that terminates the session.

use crate::error::GuacError;
use crate::instruction::Instruction;

/// What a [`Filter`] decided to do with one instruction.
pub enum FilterOutcome {
    Pass(Instruction),
    Drop,
}

/// A single inspection step. Implemented as a boxed closure so a
/// [`FilterChain`] can hold a heterogeneous list of them.
pub trait Filter: Send + Sync {
    fn filter(&self, instruction: Instruction) -> Result<FilterOutcome, GuacError>;
}

impl<F> Filter for F
where
    F: Fn(Instruction) -> Result<FilterOutcome, GuacError> + Send + Sync,
{
    fn filter(&self, instruction: Instruction) -> Result<FilterOutcome, GuacError> {
        self(instruction)
    }
}

/// Applies a sequence of filters left to right; a `Drop` outcome
/// short-circuits the remaining filters, and any raised [`GuacError`]
/// propagates straight out (terminating the session).
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        FilterChain { filters: Vec::new() }
    }

    pub fn push(&mut self, filter: impl Filter + 'static) -> &mut Self {
        self.filters.push(Box::new(filter));
        self
    }

    /// Returns `Ok(Some(instruction))` if the instruction survived every
    /// filter, `Ok(None)` if some filter dropped it, or `Err` if a filter
    /// raised.
    pub fn apply(&self, instruction: Instruction) -> Result<Option<Instruction>, GuacError> {
        let mut current = instruction;
        for filter in &self.filters {
            match filter.filter(current)? {
                FilterOutcome::Pass(next) => current = next,
                FilterOutcome::Drop => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}

/// Translates an upstream `error` opcode into the corresponding typed
/// failure from the [`crate::error::GuacErrorKind`] taxonomy. Every
/// other instruction passes through untouched.
pub struct ErrorFilter;

impl Filter for ErrorFilter {
    fn filter(&self, instruction: Instruction) -> Result<FilterOutcome, GuacError> {
        if instruction.opcode() != Some("error") {
            return Ok(FilterOutcome::Pass(instruction));
        }

        let message = instruction.arg(1).unwrap_or("Unknown guacd error");
        let status_code: u32 = instruction
            .arg(2)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Err(GuacError::from_guacd_error(message, status_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuacErrorKind;

    fn instr(parts: &[&str]) -> Instruction {
        Instruction::new(parts.iter().copied())
    }

    #[test]
    fn error_filter_is_identity_on_non_error_opcodes() {
        let filter = ErrorFilter;
        for sample in [
            instr(&["ready", "connection_id"]),
            instr(&["sync", "123456"]),
            instr(&["mouse", "100", "200", "1"]),
        ] {
            let result = filter.filter(sample.clone()).unwrap();
            match result {
                FilterOutcome::Pass(out) => assert_eq!(out, sample),
                FilterOutcome::Drop => panic!("non-error instruction was dropped"),
            }
        }
    }

    #[test]
    fn error_filter_maps_known_status_code() {
        let filter = ErrorFilter;
        let err = filter
            .filter(instr(&["error", "Access denied", "769"]))
            .unwrap_err();
        assert_eq!(err.kind(), GuacErrorKind::Unauthorized);
        assert!(err.to_string().contains("guacd error: Access denied"));
        assert_eq!(err.guacd_status_code(), Some(769));
    }

    #[test]
    fn error_filter_falls_back_to_protocol_failure_for_unknown_code() {
        let filter = ErrorFilter;
        let err = filter
            .filter(instr(&["error", "Unknown error", "999"]))
            .unwrap_err();
        assert_eq!(err.kind(), GuacErrorKind::ProtocolFailure);
        assert_eq!(err.guacd_status_code(), Some(999));
    }

    #[test]
    fn error_filter_defaults_message_and_code() {
        let filter = ErrorFilter;
        let err = filter.filter(instr(&["error"])).unwrap_err();
        assert!(err.to_string().contains("guacd error: Unknown guacd error"));
        assert_eq!(err.guacd_status_code(), Some(0));
    }

    #[test]
    fn both_unauthorized_codes_map_to_same_kind() {
        let filter = ErrorFilter;
        let a = filter
            .filter(instr(&["error", "x", "769"])) // 0x0301
            .unwrap_err();
        let b = filter
            .filter(instr(&["error", "x", "771"])) // 0x0303
            .unwrap_err();
        assert_eq!(a.kind(), GuacErrorKind::Unauthorized);
        assert_eq!(b.kind(), GuacErrorKind::Unauthorized);
    }

    #[test]
    fn chain_short_circuits_on_drop() {
        let mut chain = FilterChain::new();
        chain.push(|_instr: Instruction| Ok(FilterOutcome::Drop));
        chain.push(|_instr: Instruction| -> Result<FilterOutcome, GuacError> {
            panic!("should never run after a Drop")
        });
        let result = chain.apply(instr(&["noop"])).unwrap();
        assert!(result.is_none());
    }
}
