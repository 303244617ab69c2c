//! Breakpoints and instruction history, built entirely on the bus trap
//! facility.
//!
//! The bus traps whole blocks, so the debugger keeps its own
//! exact-address table and filters inside two shared callbacks (one for
//! reads, one for writes). Funnelling every watchpoint and the history
//! recorder through those two callbacks keeps the bus's one-callback-
//! per-block rule from ever biting.

use std::cell::RefCell;
use std::rc::Rc;

use emu286::{Bus, KindMask, TrapFn};

use crate::clock::{Clock, SharedClock};

/// One watchpoint. The slot index in the table is the handle users see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakSlot {
    pub addr: u32,
    /// False for read watchpoints, true for write watchpoints.
    pub write: bool,
    pub enabled: bool,
    /// Armed by `g <addr>`: consumed on first hit.
    pub one_shot: bool,
}

/// State shared between the debugger and its trap callbacks.
#[derive(Default)]
struct Shared {
    slots: Vec<Option<BreakSlot>>,
    history: Option<Vec<u32>>,
    history_limit: usize,
    history_next: usize,
    history_count: usize,
}

impl Shared {
    fn record_history(&mut self, addr: u32) {
        let limit = self.history_limit;
        if let Some(buf) = &mut self.history {
            if buf.len() < limit {
                buf.push(addr);
            } else {
                buf[self.history_next] = addr;
            }
            self.history_next = (self.history_next + 1) % limit;
            self.history_count += 1;
        }
    }

    fn hit(&mut self, addr: u32, write: bool) -> Option<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(s) = slot {
                if s.enabled && s.write == write && s.addr == addr {
                    if s.one_shot {
                        // Can't untrap from inside a bus access; mark the
                        // slot spent and let the command loop sweep it.
                        s.enabled = false;
                    }
                    return Some(i);
                }
            }
        }
        None
    }
}

pub struct Breakpoints {
    shared: Rc<RefCell<Shared>>,
    read_tap: TrapFn,
    write_tap: TrapFn,
    /// Block start addresses instrumented for history capture.
    history_blocks: Vec<u32>,
}

impl Breakpoints {
    pub fn new(clock: SharedClock, history_limit: usize) -> Self {
        let shared = Rc::new(RefCell::new(Shared {
            history_limit,
            ..Shared::default()
        }));

        let read_shared = Rc::clone(&shared);
        let read_clock = Rc::clone(&clock);
        let read_tap: TrapFn = Rc::new(move |addr, _value, pc| {
            let mut s = read_shared.borrow_mut();
            // History records AFTER the read, and only for the byte the
            // CPU is actually fetching as an instruction.
            if pc == Some(addr) {
                s.record_history(addr);
            }
            if let Some(i) = s.hit(addr, false) {
                drop(s);
                read_clock
                    .borrow_mut()
                    .stop(&format!("read breakpoint {} at {:06X}", i, addr));
            }
        });

        let write_shared = Rc::clone(&shared);
        let write_clock = clock;
        let write_tap: TrapFn = Rc::new(move |addr, value, _pc| {
            let mut s = write_shared.borrow_mut();
            if let Some(i) = s.hit(addr, true) {
                drop(s);
                write_clock.borrow_mut().stop(&format!(
                    "write breakpoint {} at {:06X} (value {:02X})",
                    i, addr, value
                ));
            }
        });

        Self {
            shared,
            read_tap,
            write_tap,
            history_blocks: Vec::new(),
        }
    }

    /// Installs a watchpoint, reusing the first table hole. Returns the
    /// slot handle, or `None` when the bus refuses the trap (unpopulated
    /// address).
    pub fn set_break(
        &mut self,
        bus: &mut Bus,
        addr: u32,
        write: bool,
        one_shot: bool,
    ) -> Option<usize> {
        let installed = if write {
            bus.trap_write(addr, &self.write_tap)
        } else {
            bus.trap_read(addr, &self.read_tap)
        };
        if !installed {
            log::warn!("breakpoint: cannot trap {:06X}", addr);
            return None;
        }

        let slot = BreakSlot {
            addr,
            write,
            enabled: true,
            one_shot,
        };
        let mut s = self.shared.borrow_mut();
        let hole = s.slots.iter().position(|slot| slot.is_none());
        let index = match hole {
            Some(i) => {
                s.slots[i] = Some(slot);
                i
            }
            None => {
                s.slots.push(Some(slot));
                s.slots.len() - 1
            }
        };
        log::debug!(
            "breakpoint: {} {} at {:06X}",
            if write { "bw" } else { "br" },
            index,
            addr
        );
        Some(index)
    }

    /// Removes a watchpoint and releases its bus trap.
    pub fn clear_break(&mut self, bus: &mut Bus, index: usize) -> bool {
        let slot = {
            let mut s = self.shared.borrow_mut();
            match s.slots.get_mut(index) {
                Some(entry) => entry.take(),
                None => None,
            }
        };
        match slot {
            Some(slot) => {
                if slot.write {
                    bus.untrap_write(slot.addr, &self.write_tap);
                } else {
                    bus.untrap_read(slot.addr, &self.read_tap);
                }
                true
            }
            None => false,
        }
    }

    pub fn enable_break(&mut self, index: usize, enable: bool) -> bool {
        let mut s = self.shared.borrow_mut();
        match s.slots.get_mut(index) {
            Some(Some(slot)) => {
                slot.enabled = enable;
                true
            }
            _ => false,
        }
    }

    pub fn slot(&self, index: usize) -> Option<BreakSlot> {
        self.shared.borrow().slots.get(index).copied().flatten()
    }

    pub fn slot_count(&self) -> usize {
        self.shared.borrow().slots.len()
    }

    /// Formats the table, one line per live slot; disabled entries keep
    /// their address but say so.
    pub fn list(&self, index: Option<usize>) -> Vec<String> {
        let s = self.shared.borrow();
        let mut lines = Vec::new();
        for (i, slot) in s.slots.iter().enumerate() {
            if index.is_some() && index != Some(i) {
                continue;
            }
            if let Some(slot) = slot {
                lines.push(format!(
                    "{:2}: {} {:06X}{}{}",
                    i,
                    if slot.write { "bw" } else { "br" },
                    slot.addr,
                    if slot.one_shot { " (one-shot)" } else { "" },
                    if slot.enabled { "" } else { " (disabled)" },
                ));
            }
        }
        if lines.is_empty() {
            lines.push("no breakpoints".to_string());
        }
        lines
    }

    /// Sweeps spent one-shot slots, releasing their traps. Runs from the
    /// command loop, where the bus is free to mutate.
    pub fn sweep_one_shots(&mut self, bus: &mut Bus) {
        let spent: Vec<usize> = self
            .shared
            .borrow()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(s) if s.one_shot && !s.enabled => Some(i),
                _ => None,
            })
            .collect();
        for i in spent {
            self.clear_break(bus, i);
        }
    }

    /// Turns instruction-history capture on or off. Enabling traps every
    /// executable (RAM or ROM) block; the per-block trap covers every
    /// byte inside it. Disabling untraps and discards the buffer.
    pub fn enable_history(&mut self, bus: &mut Bus, on: bool) -> bool {
        let active = self.shared.borrow().history.is_some();
        if on == active {
            return active;
        }

        if on {
            {
                let mut s = self.shared.borrow_mut();
                let limit = s.history_limit;
                s.history = Some(Vec::with_capacity(limit.min(4096)));
                s.history_next = 0;
                s.history_count = 0;
            }
            let mut starts = Vec::new();
            bus.enum_blocks(KindMask::RAM | KindMask::ROM, |block| {
                starts.push(block.borrow().addr());
            });
            for addr in starts {
                if bus.trap_read(addr, &self.read_tap) {
                    self.history_blocks.push(addr);
                }
            }
            log::info!(
                "history: capturing across {} block(s)",
                self.history_blocks.len()
            );
        } else {
            for addr in self.history_blocks.drain(..) {
                bus.untrap_read(addr, &self.read_tap);
            }
            let mut s = self.shared.borrow_mut();
            s.history = None;
            s.history_next = 0;
            s.history_count = 0;
            log::info!("history: off");
        }
        on
    }

    pub fn history_enabled(&self) -> bool {
        self.shared.borrow().history.is_some()
    }

    /// The most recent `count` recorded addresses, oldest first.
    pub fn history_tail(&self, count: usize) -> Vec<u32> {
        let s = self.shared.borrow();
        let buf = match &s.history {
            Some(buf) if !buf.is_empty() => buf,
            _ => return Vec::new(),
        };
        let avail = buf.len().min(count);
        let mut out = Vec::with_capacity(avail);
        // Walk backward from the write cursor, then flip into program
        // order.
        let mut pos = s.history_next % buf.len();
        for _ in 0..avail {
            pos = (pos + buf.len() - 1) % buf.len();
            out.push(buf[pos]);
        }
        out.reverse();
        out
    }

    pub fn history_count(&self) -> usize {
        self.shared.borrow().history_count
    }
}
