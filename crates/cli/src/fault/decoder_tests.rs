// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn decoder() -> CortexMDecoder {
    CortexMDecoder::new().unwrap()
}

/// A plausible GDB batch transcript for a precise bus fault.
const BUSFAULT_OUTPUT: &str = "\
0xe000ed28:\t0x00008200
0xe000ed2c:\t0x40000000
0xe000ed34:\t0x00000000
0xe000ed38:\t0x4000c2e0
0xe000ede4:\t0x00000000
0xe000ede8:\t0x00000000
r0             0x0                 0
r1             0x2000fc00          536935424
r12            0xffffffff          -1
sp             0x2000fbd8          0x2000fbd8
lr             0xfffffffd          -3
pc             0x800bead           0x800bead
xpsr           0x21000003          553648131
psp            0x2000fc00          0x2000fc00
msp            0x20010000          0x20010000
0x2000fc00:\t0x00000000\t0x00000001\t0x00000002\t0x00000003
0x2000fc10:\t0x0000000c\t0x0800bca1\t0x0800bead\t0x21000000
#0  0x0800bead in uart_write ()
#1  0x0800bca0 in log_flush ()
";

#[test]
fn gdb_commands_cover_fault_registers_and_frame() {
    let commands = decoder().gdb_commands();
    assert!(commands.contains(&"x/1xw 0xE000ED28".to_owned()));
    assert!(commands.contains(&"x/1xw 0xE000EDE4".to_owned()));
    assert!(commands.contains(&"info registers".to_owned()));
    assert!(commands.contains(&"x/8xw $psp".to_owned()));
    assert_eq!(commands.last().map(String::as_str), Some("bt"));
}

#[test]
fn busfault_is_decoded_with_bfar() {
    let report = decoder().parse_and_decode(BUSFAULT_OUTPUT);

    assert_eq!(report.arch, "cortex-m");
    assert_eq!(report.fault_registers.get("CFSR"), Some(&0x8200));
    // BFARVALID set, so BFAR is kept.
    assert_eq!(report.fault_registers.get("BFAR"), Some(&0x4000_C2E0));
    // MMARVALID clear, so MMFAR is dropped.
    assert!(!report.fault_registers.contains_key("MMFAR"));

    assert!(report.faults.iter().any(|f| f.contains("PRECISERR")));
    assert!(report.faults.iter().any(|f| f.contains("FORCED")));
    assert!(report.suggestions.iter().any(|s| s.contains("BFAR=0x4000C2E0")));
}

#[test]
fn stacked_pc_is_word_six_of_the_frame() {
    let report = decoder().parse_and_decode(BUSFAULT_OUTPUT);
    assert_eq!(report.stacked_pc, Some(0x0800_BEAD));
    assert!(report
        .suggestions
        .iter()
        .any(|s| s.contains("addr2line") && s.contains("0x0800BEAD")));
}

#[test]
fn core_registers_are_collected() {
    let report = decoder().parse_and_decode(BUSFAULT_OUTPUT);
    assert_eq!(report.core_regs.get("pc"), Some(&0x0800_BEAD));
    assert_eq!(report.core_regs.get("psp"), Some(&0x2000_FC00));
    assert_eq!(report.core_regs.get("lr"), Some(&0xFFFF_FFFD));
}

#[test]
fn backtrace_keeps_only_frame_lines() {
    let report = decoder().parse_and_decode(BUSFAULT_OUTPUT);
    assert_eq!(
        report.backtrace,
        "#0  0x0800bead in uart_write ()\n#1  0x0800bca0 in log_flush ()"
    );
}

#[test]
fn usage_faults_decode_bit_by_bit() {
    let output = "0xe000ed28:\t0x02010000\n";
    let report = decoder().parse_and_decode(output);
    assert!(report.faults.iter().any(|f| f.contains("UNDEFINSTR")));
    assert!(report.faults.iter().any(|f| f.contains("DIVBYZERO")));
    assert!(report.suggestions.iter().any(|s| s.contains("divisor")));
}

#[test]
fn memmanage_with_valid_mmfar() {
    // DACCVIOL | MMARVALID, MMFAR = 0x00000010.
    let output = "0xe000ed28:\t0x00000082\n0xe000ed34:\t0x00000010\n";
    let report = decoder().parse_and_decode(output);
    assert!(report.faults.iter().any(|f| f.contains("DACCVIOL")));
    assert_eq!(report.fault_registers.get("MMFAR"), Some(&0x10));
    assert!(report.suggestions.iter().any(|s| s.contains("MMFAR=0x00000010")));
}

#[test]
fn secure_fault_bits_decode() {
    // SFSR: INVEP | AUVIOL | SFARVALID, SFAR kept.
    let output = "0xe000ede4:\t0x00000049\n0xe000ede8:\t0x10001000\n";
    let report = decoder().parse_and_decode(output);
    assert!(report.faults.iter().any(|f| f.contains("INVEP")));
    assert!(report.faults.iter().any(|f| f.contains("AUVIOL")));
    assert_eq!(report.fault_registers.get("SFAR"), Some(&0x1000_1000));
    assert!(report.suggestions.iter().any(|s| s.contains("TrustZone")));
}

#[test]
fn forced_hardfault_with_clear_cfsr_gets_a_hint() {
    let output = "0xe000ed28:\t0x00000000\n0xe000ed2c:\t0x40000000\n";
    let report = decoder().parse_and_decode(output);
    assert_eq!(report.faults.len(), 1);
    assert!(report.faults[0].contains("FORCED"));
    assert!(report.suggestions.iter().any(|s| s.contains("CFSR is clear")));
}

#[test]
fn garbage_output_yields_empty_report() {
    let report = decoder().parse_and_decode("No symbol table is loaded.\n");
    assert!(report.fault_registers.is_empty());
    assert!(report.faults.is_empty());
    assert!(report.stacked_pc.is_none());
    assert_eq!(report.backtrace, "");
}

#[test]
fn registry_defaults_to_cortex_m() {
    let decoder = decoder_for_chip("some-unknown-chip").unwrap();
    assert_eq!(decoder.name(), "ARM Cortex-M");
}
