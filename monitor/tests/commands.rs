//! Command processor scenarios: breakpoints, history capture, memory
//! editing, and disassembly through the debugger surface.

use emu286::{BlockKind, BusConfig};
use monitor::{Clock, Debugger, DebuggerConfig, Machine, SystemClock};

fn setup() -> (Machine, Debugger, monitor::SharedClock) {
    let mut machine = Machine::new(BusConfig {
        addr_width: 16,
        data_width: 8,
        block_size: 1024,
    })
    .unwrap();
    machine
        .bus
        .add_blocks(0, 0x8000, BlockKind::Ram, None)
        .unwrap();

    let clock = SystemClock::shared();
    let debugger = Debugger::new(clock.clone(), DebuggerConfig::default());
    (machine, debugger, clock)
}

#[test]
fn read_breakpoint_stops_the_clock() {
    let (mut m, mut dbg, clock) = setup();

    let out = dbg.exec(&mut m, "br 2050").unwrap();
    assert!(out.contains("breakpoint 0"), "{}", out);

    clock.borrow_mut().start();
    // An unrelated read in the same block does not fire.
    m.bus.read_data(0x2040, None);
    assert!(clock.borrow().running());

    m.bus.read_data(0x2050, None);
    assert!(!clock.borrow().running());
    let reason = clock.borrow_mut().take_stop_reason().unwrap();
    assert!(reason.contains("002050"), "{}", reason);
}

#[test]
fn write_breakpoint_fires_on_stores_only() {
    let (mut m, mut dbg, clock) = setup();
    dbg.exec(&mut m, "bw 1000").unwrap();

    clock.borrow_mut().start();
    m.bus.read_data(0x1000, None);
    assert!(clock.borrow().running());
    m.bus.write_data(0x1000, 0xCC, None);
    assert!(!clock.borrow().running());
}

#[test]
fn breakpoints_disable_enable_clear() {
    let (mut m, mut dbg, clock) = setup();
    dbg.exec(&mut m, "br 2050").unwrap();

    dbg.exec(&mut m, "bd 0").unwrap();
    let listing = dbg.exec(&mut m, "bl").unwrap();
    assert!(listing.contains("disabled"), "{}", listing);

    clock.borrow_mut().start();
    m.bus.read_data(0x2050, None);
    assert!(clock.borrow().running(), "disabled breakpoint fired");

    dbg.exec(&mut m, "be 0").unwrap();
    m.bus.read_data(0x2050, None);
    assert!(!clock.borrow().running());

    dbg.exec(&mut m, "bc 0").unwrap();
    let listing = dbg.exec(&mut m, "bl").unwrap();
    assert!(listing.contains("no breakpoints"), "{}", listing);
    // The trap is gone with the table entry.
    assert!(!m.bus.block_at(0x2050).borrow().is_read_trapped());
}

#[test]
fn clear_all_with_star() {
    let (mut m, mut dbg, _clock) = setup();
    dbg.exec(&mut m, "br 1000").unwrap();
    dbg.exec(&mut m, "bw 2000").unwrap();
    dbg.exec(&mut m, "bc *").unwrap();
    assert!(dbg.exec(&mut m, "bl").unwrap().contains("no breakpoints"));
}

#[test]
fn go_arms_a_one_shot_breakpoint() {
    let (mut m, mut dbg, clock) = setup();
    dbg.exec(&mut m, "g 3000").unwrap();
    assert!(clock.borrow().running());

    m.bus.read_data(0x3000, None);
    assert!(!clock.borrow().running());

    // The next command sweeps the consumed one-shot and its trap.
    dbg.exec(&mut m, "bl").unwrap();
    assert!(!m.bus.block_at(0x3000).borrow().is_read_trapped());
}

#[test]
fn history_records_instruction_fetches_in_order() {
    let (mut m, mut dbg, _clock) = setup();
    dbg.exec(&mut m, "sh on").unwrap();

    // Five instruction fetches at distinct PCs: the bus annotation marks
    // which reads are fetches.
    let pcs = [0x0100u32, 0x0102, 0x0105, 0x0106, 0x0109];
    for &pc in &pcs {
        m.bus.read_data(pc, Some(pc));
        // Operand bytes at other addresses never enter the history.
        m.bus.read_data(pc + 1, Some(pc));
    }

    let listing = dbg.exec(&mut m, "dh 5").unwrap();
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines.len(), 5);
    for (line, &pc) in lines.iter().zip(&pcs) {
        assert!(
            line.starts_with(&format!("{:06X}:", pc)),
            "{} vs {:06X}",
            line,
            pc
        );
    }

    dbg.exec(&mut m, "sh off").unwrap();
    let out = dbg.exec(&mut m, "dh 5").unwrap();
    assert!(out.contains("no history"), "{}", out);
}

#[test]
fn edit_then_dump_round_trips() {
    let (mut m, mut dbg, _clock) = setup();
    dbg.exec(&mut m, "e 1200 AB CD 12").unwrap();

    assert_eq!(m.bus.peek(0x1200), 0xAB);
    assert_eq!(m.bus.peek(0x1201), 0xCD);
    assert_eq!(m.bus.peek(0x1202), 0x12);

    let dump = dbg.exec(&mut m, "db 1200 3").unwrap();
    assert!(dump.contains("AB CD 12"), "{}", dump);
    assert!(dump.starts_with("001200:"), "{}", dump);
}

#[test]
fn dump_cursor_advances_between_commands() {
    let (mut m, mut dbg, _clock) = setup();
    dbg.exec(&mut m, "db 1000 10").unwrap();
    let second = dbg.exec(&mut m, "db").unwrap();
    assert!(second.starts_with("001010:"), "{}", second);
}

#[test]
fn word_dump_is_little_endian() {
    let (mut m, mut dbg, _clock) = setup();
    dbg.exec(&mut m, "e 1000 34 12").unwrap();
    let dump = dbg.exec(&mut m, "dw 1000 1").unwrap();
    assert!(dump.contains("1234"), "{}", dump);
}

#[test]
fn unassemble_formats_address_bytes_and_mnemonic() {
    let (mut m, mut dbg, _clock) = setup();
    // mov ax, 0x1234; hlt
    dbg.exec(&mut m, "e 100 B8 34 12 F4").unwrap();

    let out = dbg.exec(&mut m, "u 100 2").unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("000100: B83412"), "{}", lines[0]);
    assert!(lines[0].contains("mov"), "{}", lines[0]);
    assert!(lines[1].starts_with("000103: F4"), "{}", lines[1]);
    assert!(lines[1].contains("hlt"), "{}", lines[1]);

    // A bare `u` continues at the cursor.
    dbg.exec(&mut m, "e 104 90").unwrap();
    let next = dbg.exec(&mut m, "u").unwrap();
    assert!(next.starts_with("000104:"), "{}", next);
}

#[test]
fn print_evaluates_and_assigns_variables() {
    let (mut m, mut dbg, _clock) = setup();

    let out = dbg.exec(&mut m, "p {3+4}*2").unwrap();
    assert!(out.starts_with("E (14)"), "{}", out);

    dbg.exec(&mut m, "p base=1200+34").unwrap();
    let out = dbg.exec(&mut m, "p base+1").unwrap();
    assert!(out.starts_with("1235"), "{}", out);
}

#[test]
fn registers_print_and_assign() {
    let (mut m, mut dbg, _clock) = setup();

    dbg.exec(&mut m, "r ax=1234").unwrap();
    assert_eq!(m.cpu.regs.ax, 0x1234);

    let out = dbg.exec(&mut m, "r").unwrap();
    assert!(out.contains("AX=1234"), "{}", out);

    // Registers resolve inside expressions.
    let out = dbg.exec(&mut m, "p ax+1").unwrap();
    assert!(out.starts_with("1235"), "{}", out);

    let err = dbg.exec(&mut m, "r zz=1");
    assert!(err.is_err());
}

#[test]
fn seg_off_addresses_resolve_in_real_mode() {
    let (mut m, mut dbg, _clock) = setup();
    // &100:20 is linear 0x1020 on a 16-bit bus.
    dbg.exec(&mut m, "e &100:20 5A").unwrap();
    assert_eq!(m.bus.peek(0x1020), 0x5A);
}

#[test]
fn step_requests_reach_the_clock() {
    let (mut m, mut dbg, clock) = setup();
    dbg.exec(&mut m, "t 5").unwrap();
    // The concrete clock records pending steps for the engine to drain.
    let any = clock.borrow_mut().take_stop_reason();
    assert!(any.is_none());
    dbg.exec(&mut m, "h").unwrap();
    assert!(clock.borrow_mut().take_stop_reason().is_some());
}

#[test]
fn debugger_snapshot_rebuilds_tables_and_traps() {
    let (mut m, mut dbg, clock) = setup();
    dbg.exec(&mut m, "br 2050").unwrap();
    dbg.exec(&mut m, "p base=1200").unwrap();
    let state = dbg.save();

    dbg.exec(&mut m, "bc *").unwrap();
    assert!(!m.bus.block_at(0x2050).borrow().is_read_trapped());

    dbg.restore(&mut m, &state);
    assert!(m.bus.block_at(0x2050).borrow().is_read_trapped());
    assert!(dbg.exec(&mut m, "p base").unwrap().starts_with("1200"));

    clock.borrow_mut().start();
    m.bus.read_data(0x2050, None);
    assert!(!clock.borrow().running());
}

#[test]
fn unknown_commands_error_without_side_effects() {
    let (mut m, mut dbg, clock) = setup();
    assert!(dbg.exec(&mut m, "frobnicate").is_err());
    assert!(!clock.borrow().running());
    assert!(dbg.exec(&mut m, "?").unwrap().contains("br addr"));
}
