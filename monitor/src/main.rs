//! Interactive monitor over a bare 80286 machine.
//!
//! Brings up 640 KiB of RAM, a small boot ROM stub, and a debugger REPL
//! on stdin. The execution engine is external; `g`/`t` drive the shared
//! clock that an attached engine would poll.

use std::io::{self, BufRead, Write};

use emu286::{BlockKind, BusConfig};
use monitor::{Clock, Debugger, DebuggerConfig, Machine, SystemClock};

fn build_machine() -> Machine {
    let mut machine = Machine::new(BusConfig {
        addr_width: 24,
        data_width: 8,
        block_size: 1024,
    })
    .expect("bus configuration");

    machine
        .bus
        .add_blocks(0x00000, 640 * 1024, BlockKind::Ram, None)
        .expect("conventional memory");
    machine
        .bus
        .add_blocks(0xF0000, 64 * 1024, BlockKind::Rom, None)
        .expect("boot ROM");

    // A hlt at the reset vector so unassembling fresh metal shows
    // something honest.
    machine.bus.poke(0xFFFF0, 0xF4);

    machine
}

fn main() {
    env_logger::init();

    let mut machine = build_machine();
    let clock = SystemClock::shared();
    let mut debugger = Debugger::new(clock.clone(), DebuggerConfig::default());

    println!("emu286 monitor (? for commands, ctrl-d to exit)");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("- ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        match debugger.exec(&mut machine, &line) {
            Ok(out) if out.is_empty() => {}
            Ok(out) => println!("{}", out),
            Err(err) => println!("error: {}", err),
        }

        if let Some(reason) = clock.borrow_mut().take_stop_reason() {
            println!("halted: {}", reason);
        }
    }
}
