//! Emission options resolved from the environment and command line.
//!
//! The dump level and the comment switches only control diagnostic output
//! (inline LIR comments, block statistics) and never change code bytes.
//! Code generation is affected by the two debugging aids alone: stack
//! zapping and traps at dead ends.

use std::str::FromStr;

/// Verbosity of the debug dump attached to a compilation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DumpLevel {
    #[default]
    None,
    Basic,
    Info,
    Verbose,
}

impl FromStr for DumpLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "0" | "none" => Ok(DumpLevel::None),
            "1" | "basic" => Ok(DumpLevel::Basic),
            "2" | "info" => Ok(DumpLevel::Info),
            "3" | "verbose" => Ok(DumpLevel::Verbose),
            other => Err(format!("unknown dump level `{other}`")),
        }
    }
}

pub const DEFAULT_LOOP_HEADER_ALIGNMENT: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitOptions {
    /// Interleave `block B<n>` and instruction text as code comments.
    pub print_lir_with_assembly: bool,
    pub dump_level: DumpLevel,
    /// Fill the reserved frame with a poison pattern in the prologue.
    pub zap_stack_on_method_entry: bool,
    /// Emit a breakpoint trap where control can never arrive.
    pub trap_dead_ends: bool,
    /// Alignment for loop headers not reached by fallthrough.
    pub isolated_loop_header_alignment: u32,
    /// Record per-block start/end offsets and successor probabilities.
    pub print_block_info: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            print_lir_with_assembly: false,
            dump_level: DumpLevel::None,
            zap_stack_on_method_entry: false,
            trap_dead_ends: false,
            isolated_loop_header_alignment: DEFAULT_LOOP_HEADER_ALIGNMENT,
            print_block_info: false,
        }
    }
}

impl EmitOptions {
    pub const ENV_PRINT_LIR: &'static str = "LIR_EMIT_PRINT_LIR";
    pub const ENV_DUMP_LEVEL: &'static str = "LIR_EMIT_DUMP_LEVEL";
    pub const ENV_ZAP_STACK: &'static str = "LIR_EMIT_ZAP_STACK";
    pub const ENV_TRAP_DEAD_ENDS: &'static str = "LIR_EMIT_TRAP_DEAD_ENDS";
    pub const ENV_LOOP_ALIGN: &'static str = "LIR_EMIT_LOOP_ALIGN";
    pub const ENV_BLOCK_INFO: &'static str = "LIR_EMIT_BLOCK_INFO";

    /// Options from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Options from an arbitrary variable source. Unparsable values keep the
    /// default and are logged.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |var: &str| {
            lookup(var)
                .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(false)
        };

        let mut options = Self {
            print_lir_with_assembly: flag(Self::ENV_PRINT_LIR),
            zap_stack_on_method_entry: flag(Self::ENV_ZAP_STACK),
            trap_dead_ends: flag(Self::ENV_TRAP_DEAD_ENDS),
            print_block_info: flag(Self::ENV_BLOCK_INFO),
            ..Self::default()
        };

        if let Some(level) = lookup(Self::ENV_DUMP_LEVEL) {
            match level.parse() {
                Ok(level) => options.dump_level = level,
                Err(e) => log::warn!("ignoring {}: {e}", Self::ENV_DUMP_LEVEL),
            }
        }

        if let Some(align) = lookup(Self::ENV_LOOP_ALIGN) {
            match align.parse::<u32>() {
                Ok(a) if a.is_power_of_two() => options.isolated_loop_header_alignment = a,
                _ => log::warn!("ignoring {}: `{align}` is not a power of two", Self::ENV_LOOP_ALIGN),
            }
        }

        options
    }

    pub fn with_print_lir_with_assembly(mut self, enabled: bool) -> Self {
        self.print_lir_with_assembly = enabled;
        self
    }

    pub fn with_dump_level(mut self, level: DumpLevel) -> Self {
        self.dump_level = level;
        self
    }

    pub fn with_zap_stack(mut self, enabled: bool) -> Self {
        self.zap_stack_on_method_entry = enabled;
        self
    }

    pub fn with_trap_dead_ends(mut self, enabled: bool) -> Self {
        self.trap_dead_ends = enabled;
        self
    }

    pub fn with_loop_header_alignment(mut self, alignment: u32) -> Self {
        self.isolated_loop_header_alignment = alignment;
        self
    }

    pub fn with_block_info(mut self, enabled: bool) -> Self {
        self.print_block_info = enabled;
        self
    }

    /// Whether instruction-level comments go into the result.
    pub fn emit_lir_comments(&self) -> bool {
        self.print_lir_with_assembly || self.dump_level >= DumpLevel::Basic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let options = EmitOptions::from_lookup(lookup(&[]));
        assert_eq!(options, EmitOptions::default());
        assert_eq!(options.isolated_loop_header_alignment, 16);
        assert!(!options.emit_lir_comments());
    }

    #[test]
    fn test_environment_values() {
        let options = EmitOptions::from_lookup(lookup(&[
            ("LIR_EMIT_PRINT_LIR", "1"),
            ("LIR_EMIT_DUMP_LEVEL", "info"),
            ("LIR_EMIT_ZAP_STACK", "false"),
            ("LIR_EMIT_TRAP_DEAD_ENDS", "1"),
            ("LIR_EMIT_LOOP_ALIGN", "32"),
            ("LIR_EMIT_BLOCK_INFO", "yes"),
        ]));
        assert!(options.print_lir_with_assembly);
        assert_eq!(options.dump_level, DumpLevel::Info);
        assert!(!options.zap_stack_on_method_entry);
        assert!(options.trap_dead_ends);
        assert_eq!(options.isolated_loop_header_alignment, 32);
        assert!(options.print_block_info);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let options = EmitOptions::from_lookup(lookup(&[
            ("LIR_EMIT_DUMP_LEVEL", "loud"),
            ("LIR_EMIT_LOOP_ALIGN", "12"),
        ]));
        assert_eq!(options.dump_level, DumpLevel::None);
        assert_eq!(options.isolated_loop_header_alignment, 16);
    }

    #[test]
    fn test_dump_level_enables_comments() {
        let options = EmitOptions::default().with_dump_level(DumpLevel::Basic);
        assert!(options.emit_lir_comments());
    }
}
