// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Architecture-specific fault decoding.
//!
//! A decoder supplies the GDB commands that read fault state and turns
//! the raw batch output into a structured [`FaultReport`]. The registry
//! maps chip names to decoders, defaulting to ARM Cortex-M.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;

/// Architecture-neutral structured result of a fault analysis.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FaultReport {
    pub arch: String,
    pub fault_registers: BTreeMap<String, u32>,
    pub core_regs: BTreeMap<String, u32>,
    pub stacked_pc: Option<u32>,
    pub backtrace: String,
    pub faults: Vec<String>,
    pub suggestions: Vec<String>,
    pub raw_gdb_output: String,
}

/// Decoder contract: GDB command script plus output interpretation.
pub trait FaultDecoder: Send {
    /// Human-readable name, e.g. "ARM Cortex-M".
    fn name(&self) -> &'static str;

    /// Commands to read fault state, run after halt and before `bt`.
    fn gdb_commands(&self) -> Vec<String>;

    /// Parse raw GDB output into a decoded report.
    fn parse_and_decode(&self, gdb_output: &str) -> FaultReport;
}

/// Select a decoder for a chip name. Unknown chips get the Cortex-M
/// decoder: every target currently bridged is an ARM core.
pub fn decoder_for_chip(chip: &str) -> anyhow::Result<Box<dyn FaultDecoder>> {
    let _ = chip;
    Ok(Box::new(CortexMDecoder::new()?))
}

// -- ARM Cortex-M -------------------------------------------------------------

/// System Control Block fault register addresses.
const CFSR_ADDR: u32 = 0xE000_ED28;
const HFSR_ADDR: u32 = 0xE000_ED2C;
const MMFAR_ADDR: u32 = 0xE000_ED34;
const BFAR_ADDR: u32 = 0xE000_ED38;
/// Security Extension (ARMv8-M) fault registers.
const SFSR_ADDR: u32 = 0xE000_EDE4;
const SFAR_ADDR: u32 = 0xE000_EDE8;

const FAULT_REGISTERS: &[(&str, u32)] = &[
    ("CFSR", CFSR_ADDR),
    ("HFSR", HFSR_ADDR),
    ("MMFAR", MMFAR_ADDR),
    ("BFAR", BFAR_ADDR),
    ("SFSR", SFSR_ADDR),
    ("SFAR", SFAR_ADDR),
];

/// CFSR bit positions (MMFSR bits 0-7, BFSR 8-15, UFSR 16-31).
const CFSR_BITS: &[(u32, &str)] = &[
    (0, "MemManage: instruction access violation (IACCVIOL)"),
    (1, "MemManage: data access violation (DACCVIOL)"),
    (3, "MemManage: unstacking fault (MUNSTKERR)"),
    (4, "MemManage: stacking fault (MSTKERR)"),
    (5, "MemManage: FP lazy state preservation fault (MLSPERR)"),
    (8, "BusFault: instruction bus error (IBUSERR)"),
    (9, "BusFault: precise data bus error (PRECISERR)"),
    (10, "BusFault: imprecise data bus error (IMPRECISERR)"),
    (11, "BusFault: unstacking fault (UNSTKERR)"),
    (12, "BusFault: stacking fault (STKERR)"),
    (13, "BusFault: FP lazy state preservation fault (LSPERR)"),
    (16, "UsageFault: undefined instruction (UNDEFINSTR)"),
    (17, "UsageFault: invalid EPSR state (INVSTATE)"),
    (18, "UsageFault: invalid PC load (INVPC)"),
    (19, "UsageFault: no coprocessor (NOCP)"),
    (20, "UsageFault: stack overflow (STKOF)"),
    (24, "UsageFault: unaligned access (UNALIGNED)"),
    (25, "UsageFault: divide by zero (DIVBYZERO)"),
];

const HFSR_BITS: &[(u32, &str)] = &[
    (1, "HardFault: vector table read fault (VECTTBL)"),
    (30, "HardFault: escalated from configurable fault (FORCED)"),
    (31, "HardFault: debug event (DEBUGEVT)"),
];

const SFSR_BITS: &[(u32, &str)] = &[
    (0, "SecureFault: invalid entry point (INVEP)"),
    (1, "SecureFault: invalid integrity signature (INVIS)"),
    (2, "SecureFault: invalid exception return (INVER)"),
    (3, "SecureFault: attribution unit violation (AUVIOL)"),
    (4, "SecureFault: invalid transition (INVTRAN)"),
    (5, "SecureFault: lazy state preservation fault (LSPERR)"),
    (7, "SecureFault: lazy state error (LSERR)"),
];

/// MMFAR/BFAR/SFAR hold a valid address only when the matching flag bit
/// is set in the status register.
const CFSR_MMARVALID: u32 = 1 << 7;
const CFSR_BFARVALID: u32 = 1 << 15;
const SFSR_SFARVALID: u32 = 1 << 6;

pub struct CortexMDecoder {
    memory_word: Regex,
    register_line: Regex,
    frame_line: Regex,
}

impl CortexMDecoder {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            // `x/1xw 0xE000ED28` replies `0xe000ed28: 0x00020000`
            memory_word: Regex::new(r"0x([0-9a-fA-F]+)\s*(?:<[^>]*>)?:\s*0x([0-9a-fA-F]+)")?,
            // `info registers` lines: `r0  0x20001234  536875572`
            register_line: Regex::new(r"(?m)^\s*([a-zA-Z][a-zA-Z0-9_]*)\s+0x([0-9a-fA-F]+)")?,
            // `x/8xw $psp`: `0x2000fc00: 0x00000000 0x00000001 ...`
            frame_line: Regex::new(r"0x[0-9a-fA-F]+:((?:\s+0x[0-9a-fA-F]+)+)")?,
        })
    }

    fn decode_bits(value: u32, bits: &[(u32, &str)], faults: &mut Vec<String>) {
        for &(bit, description) in bits {
            if value & (1 << bit) != 0 {
                faults.push(description.to_owned());
            }
        }
    }

    /// Pull `addr -> value` pairs out of the memory examine replies.
    fn parse_fault_registers(&self, output: &str) -> BTreeMap<String, u32> {
        let mut registers = BTreeMap::new();
        for captures in self.memory_word.captures_iter(output) {
            let Ok(addr) = u32::from_str_radix(&captures[1], 16) else {
                continue;
            };
            let Ok(value) = u32::from_str_radix(&captures[2], 16) else {
                continue;
            };
            if let Some((name, _)) = FAULT_REGISTERS.iter().find(|(_, a)| *a == addr) {
                registers.insert((*name).to_owned(), value);
            }
        }
        registers
    }

    fn parse_core_registers(&self, output: &str) -> BTreeMap<String, u32> {
        const CORE_REGS: &[&str] = &[
            "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12",
            "sp", "lr", "pc", "xpsr", "msp", "psp",
        ];
        let mut registers = BTreeMap::new();
        for captures in self.register_line.captures_iter(output) {
            let name = captures[1].to_lowercase();
            if !CORE_REGS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = u32::from_str_radix(&captures[2], 16) {
                registers.insert(name, value);
            }
        }
        registers
    }

    /// Stacked PC sits at +24 of the 8-word exception frame
    /// (r0 r1 r2 r3 r12 lr pc xpsr).
    ///
    /// The frame dump is the only multi-word memory examine in the batch;
    /// single-word replies are the fault-register reads.
    fn parse_stacked_pc(&self, output: &str) -> Option<u32> {
        let mut words: Vec<u32> = Vec::new();
        for captures in self.frame_line.captures_iter(output) {
            let row: Vec<u32> = captures[1]
                .split_whitespace()
                .filter_map(|token| {
                    u32::from_str_radix(token.trim_start_matches("0x"), 16).ok()
                })
                .collect();
            if row.len() < 2 {
                continue;
            }
            words.extend(row);
            if words.len() >= 8 {
                break;
            }
        }
        if words.len() >= 7 {
            words.get(6).copied()
        } else {
            None
        }
    }

    fn parse_backtrace(&self, output: &str) -> String {
        output
            .lines()
            .filter(|line| line.trim_start().starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn suggestions_for(faults: &[String], report: &FaultReport) -> Vec<String> {
        let mut suggestions = Vec::new();
        let joined = faults.join("\n");

        if joined.contains("DACCVIOL") || joined.contains("IACCVIOL") {
            let at = report
                .fault_registers
                .get("MMFAR")
                .map(|a| format!(" (MMFAR=0x{a:08X})"))
                .unwrap_or_default();
            suggestions.push(format!(
                "Memory access violation{at}: check pointer initialization and MPU region configuration"
            ));
        }
        if joined.contains("PRECISERR") || joined.contains("IBUSERR") {
            let at = report
                .fault_registers
                .get("BFAR")
                .map(|a| format!(" (BFAR=0x{a:08X})"))
                .unwrap_or_default();
            suggestions.push(format!(
                "Bus error{at}: the address may be unmapped or a peripheral clock may be disabled"
            ));
        }
        if joined.contains("IMPRECISERR") {
            suggestions.push(
                "Imprecise bus error: the faulting store retired earlier; try disabling write buffering to localize it"
                    .to_owned(),
            );
        }
        if joined.contains("UNDEFINSTR") {
            suggestions.push(
                "Undefined instruction: verify the binary matches the core and the vector table is intact"
                    .to_owned(),
            );
        }
        if joined.contains("INVSTATE") {
            suggestions.push(
                "Invalid EPSR state: a jump to an address without the Thumb bit set (check function pointers)"
                    .to_owned(),
            );
        }
        if joined.contains("STKOF") || joined.contains("MSTKERR") || joined.contains("STKERR") {
            suggestions.push("Stack fault: increase the task stack size or check for recursion".to_owned());
        }
        if joined.contains("DIVBYZERO") {
            suggestions.push("Division by zero: guard the divisor".to_owned());
        }
        if joined.contains("UNALIGNED") {
            suggestions.push(
                "Unaligned access: check packed structs and raw pointer casts".to_owned(),
            );
        }
        if joined.contains("SecureFault") {
            suggestions.push(
                "Secure fault: check TrustZone attribution (SAU/IDAU) and NSC veneers".to_owned(),
            );
        }
        if joined.contains("FORCED") && faults.len() == 1 {
            suggestions.push(
                "HardFault escalated but CFSR is clear: the configurable fault handlers may be disabled"
                    .to_owned(),
            );
        }
        if let Some(pc) = report.stacked_pc {
            suggestions.push(format!("Faulting instruction near 0x{pc:08X}: `addr2line -e app.elf 0x{pc:08X}`"));
        }
        suggestions
    }
}

impl FaultDecoder for CortexMDecoder {
    fn name(&self) -> &'static str {
        "ARM Cortex-M"
    }

    fn gdb_commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = FAULT_REGISTERS
            .iter()
            .map(|(_, addr)| format!("x/1xw 0x{addr:08X}"))
            .collect();
        commands.push("info registers".to_owned());
        commands.push("x/8xw $psp".to_owned());
        commands.push("bt".to_owned());
        commands
    }

    fn parse_and_decode(&self, gdb_output: &str) -> FaultReport {
        let mut report = FaultReport {
            arch: "cortex-m".to_owned(),
            fault_registers: self.parse_fault_registers(gdb_output),
            core_regs: self.parse_core_registers(gdb_output),
            stacked_pc: None,
            backtrace: self.parse_backtrace(gdb_output),
            faults: Vec::new(),
            suggestions: Vec::new(),
            raw_gdb_output: gdb_output.to_owned(),
        };
        report.stacked_pc = self.parse_stacked_pc(gdb_output);

        let mut faults = Vec::new();
        if let Some(&cfsr) = report.fault_registers.get("CFSR") {
            Self::decode_bits(cfsr, CFSR_BITS, &mut faults);
            if cfsr & CFSR_MMARVALID == 0 {
                report.fault_registers.remove("MMFAR");
            }
            if cfsr & CFSR_BFARVALID == 0 {
                report.fault_registers.remove("BFAR");
            }
        }
        if let Some(&hfsr) = report.fault_registers.get("HFSR") {
            Self::decode_bits(hfsr, HFSR_BITS, &mut faults);
        }
        if let Some(&sfsr) = report.fault_registers.get("SFSR") {
            Self::decode_bits(sfsr, SFSR_BITS, &mut faults);
            if sfsr & SFSR_SFARVALID == 0 {
                report.fault_registers.remove("SFAR");
            }
        }

        report.suggestions = Self::suggestions_for(&faults, &report);
        report.faults = faults;
        report
    }
}

#[cfg(test)]
#[path = "decoder_tests.rs"]
mod tests;
