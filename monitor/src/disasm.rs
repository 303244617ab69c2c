//! 16-bit disassembly for the `u` and `dh` commands.

use emu286::Bus;
use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};

/// Longest instruction the decoder is fed. Generous for the 80286's real
/// encodings; keeps the per-line fetch bounded.
pub const MAX_OP_LEN: usize = 10;

/// Disassembles `count` instructions starting at `addr`, reading through
/// the quiet accessor so instrumentation never observes the debugger.
/// Returns the formatted lines and the address following the last
/// instruction (the cursor for a repeated `u`).
pub fn unassemble(bus: &Bus, addr: u32, count: usize) -> (Vec<String>, u32) {
    let mut formatter = NasmFormatter::new();
    formatter.options_mut().set_space_after_operand_separator(true);

    let mut lines = Vec::with_capacity(count);
    let mut pos = addr;
    for _ in 0..count {
        let (line, len) = disassemble_one(bus, pos, &mut formatter);
        lines.push(line);
        pos = pos.wrapping_add(len as u32);
    }
    (lines, pos)
}

/// One line in `<address>: <opcode bytes>  <mnemonic> <operands>` form.
pub fn disassemble_at(bus: &Bus, addr: u32) -> String {
    let mut formatter = NasmFormatter::new();
    formatter.options_mut().set_space_after_operand_separator(true);
    disassemble_one(bus, addr, &mut formatter).0
}

fn disassemble_one(bus: &Bus, addr: u32, formatter: &mut NasmFormatter) -> (String, usize) {
    let bytes: Vec<u8> = (0..MAX_OP_LEN)
        .map(|i| bus.peek(addr.wrapping_add(i as u32)) as u8)
        .collect();

    let mut decoder = Decoder::with_ip(16, &bytes, addr as u64, DecoderOptions::NONE);
    let instr = decoder.decode();
    // Invalid encodings still consume at least one byte so the cursor
    // always advances.
    let len = instr.len().max(1);

    let mut text = String::new();
    formatter.format(&instr, &mut text);

    let hex: String = bytes[..len]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join("");
    (format!("{:06X}: {:<20}  {}", addr, hex, text), len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu286::{BlockKind, Bus, BusConfig};

    fn bus_with(bytes: &[u8]) -> Bus {
        let mut bus = Bus::new(BusConfig::default()).unwrap();
        bus.add_blocks(0, 1024, BlockKind::Ram, None).unwrap();
        for (i, b) in bytes.iter().enumerate() {
            bus.poke(i as u32, *b as u16);
        }
        bus
    }

    #[test]
    fn formats_a_mov_immediate() {
        // mov ax, 0x1234
        let bus = bus_with(&[0xB8, 0x34, 0x12]);
        let line = disassemble_at(&bus, 0);
        assert!(line.starts_with("000000: B83412"), "{}", line);
        assert!(line.contains("mov"), "{}", line);
        assert!(line.to_lowercase().contains("1234"), "{}", line);
    }

    #[test]
    fn cursor_advances_past_each_instruction() {
        // nop; hlt
        let bus = bus_with(&[0x90, 0xF4]);
        let (lines, next) = unassemble(&bus, 0, 2);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("nop"), "{}", lines[0]);
        assert!(lines[1].contains("hlt"), "{}", lines[1]);
        assert_eq!(next, 2);
    }
}
