//! Per-instruction byte verification.
//!
//! [`DecodeVerifier`] decodes the bytes one LIR instruction produced and
//! rejects invalid opcodes and instructions cut off at the end of the
//! range. The builder already excludes inline jump table data from the
//! range it hands over.

use iced_x86::{Decoder, DecoderError, DecoderOptions, Instruction};

use crate::core::builder::InstructionVerifier;

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeVerifier;

impl DecodeVerifier {
    pub fn new() -> Self {
        Self
    }
}

impl InstructionVerifier for DecodeVerifier {
    fn verify(&self, class_name: &str, code: &[u8], start: u32) -> Result<(), String> {
        let mut decoder = Decoder::with_ip(64, code, start as u64, DecoderOptions::NONE);
        let mut instruction = Instruction::default();
        while decoder.can_decode() {
            let ip = decoder.ip();
            decoder.decode_out(&mut instruction);
            match decoder.last_error() {
                DecoderError::None => {}
                DecoderError::NoMoreBytes => {
                    return Err(format!(
                        "{class_name}: truncated instruction at {ip:#x}"
                    ));
                }
                _ => {
                    return Err(format!(
                        "{class_name}: invalid instruction at {ip:#x}"
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_sequences() {
        let verifier = DecodeVerifier::new();
        // sub rsp, 8; call rel32; ret
        let code = [0x48, 0x83, 0xEC, 0x08, 0xE8, 0, 0, 0, 0, 0xC3];
        assert!(verifier.verify("Test", &code, 0x40).is_ok());
        assert!(verifier.verify("Empty", &[], 0).is_ok());
    }

    #[test]
    fn test_rejects_truncated_instruction() {
        let verifier = DecodeVerifier::new();
        // call rel32 missing its last byte
        let err = verifier.verify("DirectCall", &[0xE8, 0, 0, 0], 0x10).unwrap_err();
        assert!(err.contains("DirectCall"));
        assert!(err.contains("truncated"));
        assert!(err.contains("0x10"));
    }

    #[test]
    fn test_rejects_invalid_opcode() {
        let verifier = DecodeVerifier::new();
        // 0x06 (push es) does not exist in 64-bit mode
        let err = verifier.verify("Bad", &[0x90, 0x06], 0).unwrap_err();
        assert!(err.contains("invalid instruction at 0x1"));
    }
}
