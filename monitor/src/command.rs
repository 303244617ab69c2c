//! The command processor.
//!
//! Lines are tokenized on whitespace; the first token selects the
//! command, the second usually parses both as a table index and as an
//! address, and the rest are expressions in the current default base.
//! The dump and unassemble cursors persist so a bare repeat continues
//! where the last one stopped.

use std::collections::HashMap;
use std::rc::Rc;

use snafu::Snafu;

use emu286::CpuState;

use crate::breakpoint::Breakpoints;
use crate::clock::{Clock, SharedClock};
use crate::disasm;
use crate::eval::{EvalError, Evaluator, GroupStyle, Symbols};
use crate::Machine;

#[derive(Debug, Snafu)]
pub enum CommandError {
    #[snafu(display("unknown command \"{}\" (try ?)", cmd))]
    Unknown { cmd: String },

    #[snafu(display("\"{}\" needs an argument", cmd))]
    MissingArgument { cmd: String },

    #[snafu(display("bad address \"{}\"", text))]
    BadAddress { text: String },

    #[snafu(display("bad breakpoint index \"{}\"", text))]
    BadIndex { text: String },

    #[snafu(display("no such register \"{}\"", name))]
    BadRegister { name: String },

    #[snafu(display("cannot set a breakpoint at {:06X}", addr))]
    BreakRejected { addr: u32 },

    #[snafu(context(false), display("{}", source))]
    Expression { source: EvalError },
}

#[derive(Debug, Clone, Copy)]
pub struct DebuggerConfig {
    pub default_base: u32,
    /// 0 means "match the memory bus address width".
    pub default_bits: u32,
    pub history_limit: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            default_base: 16,
            default_bits: 0,
            history_limit: 100_000,
        }
    }
}

/// A named debugger value: the last computed result plus the expression
/// it came from, so listings can show both.
#[derive(Debug, Clone)]
pub struct Variable {
    pub value: u64,
    pub fixup: Option<String>,
}

/// Snapshot of the debugger's own tables.
#[derive(Debug, Clone, Default)]
pub struct DebuggerState {
    pub variables: Vec<(String, Variable)>,
    pub breakpoints: Vec<crate::breakpoint::BreakSlot>,
}

/// Resolves names during expression evaluation: variables shadow
/// registers, registers match case-insensitively.
struct MachineSymbols<'a> {
    cpu: &'a CpuState,
    vars: &'a HashMap<String, Variable>,
}

impl Symbols for MachineSymbols<'_> {
    fn lookup(&self, name: &str) -> Option<u64> {
        if let Some(var) = self.vars.get(name) {
            return Some(var.value);
        }
        self.cpu
            .register(&name.to_ascii_uppercase())
            .map(u64::from)
    }
}

pub struct Debugger {
    cfg: DebuggerConfig,
    pub breakpoints: Breakpoints,
    clock: SharedClock,
    pub variables: HashMap<String, Variable>,
    group: GroupStyle,
    /// Where the next argument-less dump continues.
    dump_cursor: u32,
    /// Where the next argument-less unassemble continues; `None` means
    /// "start at the current PC".
    unasm_cursor: Option<u32>,
}

impl Debugger {
    pub fn new(clock: SharedClock, cfg: DebuggerConfig) -> Self {
        let breakpoints = Breakpoints::new(Rc::clone(&clock), cfg.history_limit);
        Self {
            breakpoints,
            clock,
            cfg,
            variables: HashMap::new(),
            group: GroupStyle::Brace,
            dump_cursor: 0,
            unasm_cursor: None,
        }
    }

    pub fn default_base(&self) -> u32 {
        self.cfg.default_base
    }

    /// Switches the expression grouping delimiters (angle brackets also
    /// select the DEC-style precedence table).
    pub fn set_group(&mut self, group: GroupStyle) {
        self.group = group;
    }

    pub fn set_variable(&mut self, name: &str, value: u64, fixup: Option<String>) {
        self.variables
            .insert(name.to_string(), Variable { value, fixup });
    }

    /// Evaluates one expression against the machine.
    pub fn eval(&self, m: &Machine, text: &str) -> Result<u64, EvalError> {
        let symbols = MachineSymbols {
            cpu: &m.cpu,
            vars: &self.variables,
        };
        Evaluator::new(&symbols)
            .with_base(self.cfg.default_base)
            .with_bits(self.bits(m))
            .with_group(self.group)
            .parse(text)
    }

    pub fn save(&self) -> DebuggerState {
        let mut state = DebuggerState::default();
        for (name, var) in &self.variables {
            state.variables.push((name.clone(), var.clone()));
        }
        for i in 0..self.breakpoints.slot_count() {
            if let Some(slot) = self.breakpoints.slot(i) {
                state.breakpoints.push(slot);
            }
        }
        state
    }

    /// Rebuilds the variable map and re-arms every saved breakpoint on
    /// the given machine.
    pub fn restore(&mut self, m: &mut Machine, state: &DebuggerState) {
        self.variables.clear();
        for (name, var) in &state.variables {
            self.variables.insert(name.clone(), var.clone());
        }
        for i in 0..self.breakpoints.slot_count() {
            self.breakpoints.clear_break(&mut m.bus, i);
        }
        for slot in &state.breakpoints {
            if let Some(i) =
                self.breakpoints
                    .set_break(&mut m.bus, slot.addr, slot.write, slot.one_shot)
            {
                self.breakpoints.enable_break(i, slot.enabled);
            }
        }
    }

    fn bits(&self, m: &Machine) -> u32 {
        if self.cfg.default_bits == 0 {
            m.bus.addr_width()
        } else {
            self.cfg.default_bits
        }
    }

    /// Executes one command line, returning the text to show. Parse
    /// problems come back as errors; they never disturb the machine.
    pub fn exec(&mut self, m: &mut Machine, line: &str) -> Result<String, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(String::new());
        }
        // Spent one-shot breakpoints from the previous run release their
        // traps before anything else happens.
        self.breakpoints.sweep_one_shots(&mut m.bus);

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let cmd = tokens[0].to_ascii_lowercase();
        let rest = line[tokens[0].len()..].trim();

        match cmd.as_str() {
            "bc" | "bd" | "be" => self.break_admin(m, &cmd, tokens.get(1).copied()),
            "bl" => Ok(self.breakpoints.list(None).join("\n")),
            "br" | "bw" => self.break_set(m, cmd == "bw", tokens.get(1).copied()),
            "db" => self.dump(m, &tokens[1..], 1),
            "dw" => self.dump(m, &tokens[1..], 2),
            "dd" => self.dump(m, &tokens[1..], 4),
            "dy" => self.dump_binary(m, &tokens[1..]),
            "dh" => self.dump_history(m, tokens.get(1).copied()),
            "e" => self.edit(m, &tokens[1..]),
            "g" => self.go(m, tokens.get(1).copied()),
            "h" => {
                self.clock.borrow_mut().stop("user halt");
                Ok("stopped".to_string())
            }
            "p" => self.print_expr(m, rest),
            "r" => self.registers(m, &tokens[1..], false),
            "ra" => self.registers(m, &tokens[1..], true),
            "sh" => self.history_toggle(m, tokens.get(1).copied()),
            "t" => self.step(m, tokens.get(1).copied()),
            "u" => self.unassemble_cmd(m, &tokens[1..]),
            "?" => Ok(help()),
            _ => Err(CommandError::Unknown { cmd }),
        }
    }

    /// Address syntax: optional kind prefix (`&` real, `#` protected,
    /// `%` linear, `%%` physical), optional `seg:off`; both halves are
    /// full expressions. Without a `seg:` part the value is taken as a
    /// linear address directly.
    pub fn parse_addr(&self, m: &Machine, text: &str) -> Result<u32, CommandError> {
        #[derive(PartialEq)]
        enum Kind {
            Default,
            Real,
            Prot,
            Linear,
        }

        let (kind, rest) = if let Some(r) = text.strip_prefix("%%") {
            (Kind::Linear, r)
        } else if let Some(r) = text.strip_prefix('%') {
            (Kind::Linear, r)
        } else if let Some(r) = text.strip_prefix('#') {
            (Kind::Prot, r)
        } else if let Some(r) = text.strip_prefix('&') {
            (Kind::Real, r)
        } else {
            (Kind::Default, text)
        };

        if let Some((seg, off)) = rest.split_once(':') {
            let sel = self.eval(m, seg)? as u16;
            let off = self.eval(m, off)? as u32;
            let prot = match kind {
                Kind::Real => false,
                Kind::Prot => true,
                _ => m.cpu.protected_mode(),
            };
            if prot {
                let (base, _limit) = m
                    .cpu
                    .probe_descriptor(&m.bus, sel)
                    .ok_or_else(|| CommandError::BadAddress { text: text.into() })?;
                Ok(base.wrapping_add(off) & m.bus.addr_limit())
            } else {
                Ok(((sel as u32) << 4).wrapping_add(off) & m.bus.addr_limit())
            }
        } else {
            if rest.is_empty() {
                return Err(CommandError::BadAddress { text: text.into() });
            }
            Ok(self.eval(m, rest)? as u32 & m.bus.addr_limit())
        }
    }

    fn index_arg(&self, text: Option<&str>) -> Result<Option<usize>, CommandError> {
        match text {
            None => Err(CommandError::MissingArgument { cmd: "b?".into() }),
            Some("*") => Ok(None),
            Some(t) => t
                .parse::<usize>()
                .map(Some)
                .map_err(|_| CommandError::BadIndex { text: t.into() }),
        }
    }

    fn break_admin(
        &mut self,
        m: &mut Machine,
        cmd: &str,
        arg: Option<&str>,
    ) -> Result<String, CommandError> {
        let index = self.index_arg(arg)?;
        let all: Vec<usize> = match index {
            Some(i) => vec![i],
            None => (0..self.breakpoints.slot_count()).collect(),
        };

        let mut touched = 0;
        for i in all {
            let ok = match cmd {
                "bc" => self.breakpoints.clear_break(&mut m.bus, i),
                "bd" => self.breakpoints.enable_break(i, false),
                "be" => self.breakpoints.enable_break(i, true),
                _ => unreachable!(),
            };
            if ok {
                touched += 1;
            } else if index.is_some() {
                return Err(CommandError::BadIndex {
                    text: i.to_string(),
                });
            }
        }
        Ok(format!(
            "{} breakpoint(s) {}",
            touched,
            match cmd {
                "bc" => "cleared",
                "bd" => "disabled",
                _ => "enabled",
            }
        ))
    }

    fn break_set(
        &mut self,
        m: &mut Machine,
        write: bool,
        arg: Option<&str>,
    ) -> Result<String, CommandError> {
        let text = arg.ok_or(CommandError::MissingArgument {
            cmd: if write { "bw".into() } else { "br".into() },
        })?;
        let addr = self.parse_addr(m, text)?;
        match self.breakpoints.set_break(&mut m.bus, addr, write, false) {
            Some(i) => Ok(format!(
                "breakpoint {} set on {} at {:06X}",
                i,
                if write { "write" } else { "read" },
                addr
            )),
            None => Err(CommandError::BreakRejected { addr }),
        }
    }

    fn dump(&mut self, m: &Machine, args: &[&str], width: u32) -> Result<String, CommandError> {
        let addr = match args.first() {
            Some(t) => self.parse_addr(m, t)?,
            None => self.dump_cursor,
        };
        let count = match args.get(1) {
            Some(t) => self.eval(m, t)? as u32,
            None => 0x80 / width,
        };

        let per_line = 16 / width;
        let mut lines = Vec::new();
        let mut pos = addr;
        let mut emitted = 0;
        while emitted < count {
            let mut hex = String::new();
            let mut ascii = String::new();
            let line_addr = pos;
            for _ in 0..per_line.min(count - emitted) {
                let mut value: u32 = 0;
                for byte in 0..width {
                    let b = m.bus.peek(pos + byte) as u32;
                    value |= b << (8 * byte);
                    ascii.push(printable(b as u8));
                }
                match width {
                    1 => hex.push_str(&format!("{:02X} ", value)),
                    2 => hex.push_str(&format!("{:04X} ", value)),
                    _ => hex.push_str(&format!("{:08X} ", value)),
                }
                pos = pos.wrapping_add(width);
                emitted += 1;
            }
            if width == 1 {
                lines.push(format!("{:06X}: {:<48} {}", line_addr, hex, ascii));
            } else {
                lines.push(format!("{:06X}: {}", line_addr, hex.trim_end()));
            }
        }
        self.dump_cursor = pos;
        Ok(lines.join("\n"))
    }

    fn dump_binary(&mut self, m: &Machine, args: &[&str]) -> Result<String, CommandError> {
        let addr = match args.first() {
            Some(t) => self.parse_addr(m, t)?,
            None => self.dump_cursor,
        };
        let count = match args.get(1) {
            Some(t) => self.eval(m, t)? as u32,
            None => 8,
        };
        let mut lines = Vec::new();
        for i in 0..count {
            let value = m.bus.peek(addr + i);
            lines.push(format!("{:06X}: {:08b}", addr + i, value));
        }
        self.dump_cursor = addr.wrapping_add(count);
        Ok(lines.join("\n"))
    }

    fn dump_history(&mut self, m: &Machine, arg: Option<&str>) -> Result<String, CommandError> {
        let count = match arg {
            Some(t) => self.eval(m, t)? as usize,
            None => 16,
        };
        let tail = self.breakpoints.history_tail(count);
        if tail.is_empty() {
            return Ok("no history (sh on to enable)".to_string());
        }
        let lines: Vec<String> = tail
            .iter()
            .map(|&addr| disasm::disassemble_at(&m.bus, addr))
            .collect();
        Ok(lines.join("\n"))
    }

    fn edit(&mut self, m: &mut Machine, args: &[&str]) -> Result<String, CommandError> {
        let text = args.first().ok_or(CommandError::MissingArgument {
            cmd: "e".into(),
        })?;
        let addr = self.parse_addr(m, text)?;
        let mut pos = addr;
        for value in &args[1..] {
            let v = self.eval(m, value)? as u16;
            m.bus.poke(pos, v);
            pos = pos.wrapping_add(1);
        }
        Ok(format!(
            "{} byte(s) written at {:06X}",
            args.len().saturating_sub(1),
            addr
        ))
    }

    fn go(&mut self, m: &mut Machine, arg: Option<&str>) -> Result<String, CommandError> {
        if let Some(text) = arg {
            let addr = self.parse_addr(m, text)?;
            if self
                .breakpoints
                .set_break(&mut m.bus, addr, false, true)
                .is_none()
            {
                return Err(CommandError::BreakRejected { addr });
            }
        }
        self.clock.borrow_mut().start();
        Ok("running".to_string())
    }

    fn print_expr(&mut self, m: &Machine, rest: &str) -> Result<String, CommandError> {
        if rest.is_empty() {
            return Err(CommandError::MissingArgument { cmd: "p".into() });
        }

        // `p name=expr` assigns a variable, remembering the expression.
        if let Some((name, expr)) = rest.split_once('=') {
            let name = name.trim();
            if is_identifier(name) && !expr.trim().is_empty() {
                let value = self.eval(m, expr.trim())?;
                self.set_variable(name, value, Some(expr.trim().to_string()));
                return Ok(format!(
                    "{} = {} ({})",
                    name,
                    format_value(value, self.cfg.default_base),
                    value
                ));
            }
        }

        let value = self.eval(m, rest)?;
        Ok(format!(
            "{} ({})",
            format_value(value, self.cfg.default_base),
            value
        ))
    }

    fn registers(
        &mut self,
        m: &mut Machine,
        args: &[&str],
        detail: bool,
    ) -> Result<String, CommandError> {
        if args.is_empty() {
            return Ok(m.cpu.dump(detail));
        }

        // `r reg=value` or `r reg value`.
        let (name, value_text) = if let Some((n, v)) = args[0].split_once('=') {
            (n, v.to_string())
        } else if args.len() >= 2 {
            (args[0], args[1].to_string())
        } else {
            let name = args[0].to_ascii_uppercase();
            let value = m
                .cpu
                .register(&name)
                .ok_or(CommandError::BadRegister { name: name.clone() })?;
            return Ok(format!("{}={:04X}", name, value));
        };

        let name = name.to_ascii_uppercase();
        let value = self.eval(m, &value_text)? as u16;
        if !m.cpu.set_register(&name, value) {
            return Err(CommandError::BadRegister { name });
        }
        Ok(format!("{}={:04X}", name, value))
    }

    fn history_toggle(
        &mut self,
        m: &mut Machine,
        arg: Option<&str>,
    ) -> Result<String, CommandError> {
        match arg {
            Some("on") => {
                self.breakpoints.enable_history(&mut m.bus, true);
                Ok("history on".to_string())
            }
            Some("off") => {
                self.breakpoints.enable_history(&mut m.bus, false);
                Ok("history off".to_string())
            }
            Some(other) => Err(CommandError::Unknown {
                cmd: format!("sh {}", other),
            }),
            None => Ok(format!(
                "history {} ({} recorded)",
                if self.breakpoints.history_enabled() {
                    "on"
                } else {
                    "off"
                },
                self.breakpoints.history_count()
            )),
        }
    }

    fn step(&mut self, m: &Machine, arg: Option<&str>) -> Result<String, CommandError> {
        let n = match arg {
            Some(t) => self.eval(m, t)? as u32,
            None => 1,
        };
        self.clock.borrow_mut().on_step(n);
        Ok(format!("stepping {}", n))
    }

    fn unassemble_cmd(&mut self, m: &Machine, args: &[&str]) -> Result<String, CommandError> {
        let addr = match args.first() {
            Some(t) => self.parse_addr(m, t)?,
            None => self.unasm_cursor.unwrap_or_else(|| m.cpu.reg_pc()),
        };
        let count = match args.get(1) {
            Some(t) => self.eval(m, t)? as usize,
            None => 8,
        };
        let (lines, next) = disasm::unassemble(&m.bus, addr, count);
        self.unasm_cursor = Some(next);
        Ok(lines.join("\n"))
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn printable(b: u8) -> char {
    if (0x20..0x7F).contains(&b) {
        b as char
    } else {
        '.'
    }
}

fn format_value(value: u64, base: u32) -> String {
    match base {
        2 => format!("{:b}", value),
        8 => format!("{:o}", value),
        10 => format!("{}", value),
        _ => format!("{:X}", value),
    }
}

fn help() -> String {
    [
        "bc n|*      clear breakpoint(s)",
        "bd n|*      disable breakpoint(s)",
        "be n|*      enable breakpoint(s)",
        "bl          list breakpoints",
        "br addr     break on read",
        "bw addr     break on write",
        "db [a] [n]  dump bytes",
        "dw [a] [n]  dump words",
        "dd [a] [n]  dump dwords",
        "dy [a] [n]  dump binary",
        "dh [n]      dump instruction history",
        "e a v...    edit memory",
        "g [addr]    run (optional one-shot breakpoint)",
        "h           halt",
        "p expr      print expression (p name=expr sets a variable)",
        "r [reg=v]   show or set registers (ra: detail)",
        "sh on|off   instruction history capture",
        "t [n]       step n instructions",
        "u [a] [n]   unassemble",
        "?           this list",
    ]
    .join("\n")
}
