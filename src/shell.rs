use std::io::{self, Write};

use num_format::{Locale, ToFormattedString};
use rustyline::{error::ReadlineError, DefaultEditor};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::debugger::{
    CheckOutcome, Debugger, ExprError, WatchpointError, WatchpointHit, WatchpointId,
};
use crate::machine::{Machine, RunSummary, StopReason};
use crate::processor::{ByteRegister, Gpr};
use crate::Address;

const PROMPT: &str = "(nemu) ";

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("cannot write output: {0}")]
    Io(#[from] io::Error),
    #[error("cannot read input: {0}")]
    Readline(#[from] ReadlineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    /// Watchpoint hits and the end-of-run report as JSON lines.
    Json,
}

type Handler<W> = fn(&mut Shell<W>, Option<&str>) -> io::Result<Flow>;

struct Command<W> {
    name: &'static str,
    description: &'static str,
    handler: Handler<W>,
}

fn commands<W: Write>() -> [Command<W>; 9] {
    [
        Command {
            name: "help",
            description: "Display informations about all supported commands",
            handler: Shell::cmd_help,
        },
        Command {
            name: "c",
            description: "Continue the execution of the program",
            handler: Shell::cmd_c,
        },
        Command {
            name: "q",
            description: "Exit NEMU",
            handler: Shell::cmd_q,
        },
        Command {
            name: "si",
            description: "args:[N] the default is 1; execute N instructions step by step",
            handler: Shell::cmd_si,
        },
        Command {
            name: "info",
            description: "args:r|w; print the registers or the watchpoints",
            handler: Shell::cmd_info,
        },
        Command {
            name: "x",
            description: "args:N EXPR; dump N bytes of memory starting at the value of EXPR",
            handler: Shell::cmd_x,
        },
        Command {
            name: "p",
            description: "args:EXPR; print the value of EXPR",
            handler: Shell::cmd_p,
        },
        Command {
            name: "w",
            description: "args:EXPR; stop execution whenever the value of EXPR changes",
            handler: Shell::cmd_w,
        },
        Command {
            name: "d",
            description: "args:N; delete watchpoint NO.N",
            handler: Shell::cmd_d,
        },
    ]
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum Report<'a> {
    Watchpoint(&'a WatchpointHit),
    Trap {
        eip: Address,
        code: u32,
        executed: u64,
    },
    Abort {
        message: String,
        executed: u64,
    },
    WatchpointFailed {
        id: WatchpointId,
        message: String,
    },
    Finished {
        message: String,
    },
}

pub struct Shell<W> {
    pub machine: Machine,
    pub debugger: Debugger,
    out: W,
    format: OutputFormat,
}

impl<W: Write> Shell<W> {
    pub fn new(machine: Machine, out: W, format: OutputFormat) -> Self {
        Self {
            machine,
            debugger: Debugger::new(),
            out,
            format,
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }

    pub fn run_interactive(&mut self) -> Result<(), ShellError> {
        let mut editor = DefaultEditor::new()?;
        loop {
            match editor.readline(PROMPT) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        editor.add_history_entry(line.as_str())?;
                    }
                    if self.execute_line(&line)? == Flow::Quit {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Runs one command line. Command failures are reported to the output, not returned.
    pub fn execute_line(&mut self, line: &str) -> io::Result<Flow> {
        let line = line.trim();
        let (name, args) = match line.split_once(' ') {
            Some((name, args)) => (name, Some(args.trim()).filter(|args| !args.is_empty())),
            None => (line, None),
        };
        if name.is_empty() {
            return Ok(Flow::Continue);
        }

        match commands::<W>().iter().find(|command| command.name == name) {
            Some(command) => {
                debug!(command = name, ?args, "running command");
                (command.handler)(self, args)
            }
            None => {
                writeln!(self.out, "Unknown command '{}'", name)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn cmd_help(&mut self, args: Option<&str>) -> io::Result<Flow> {
        let commands = commands::<W>();
        match args {
            None => {
                for command in &commands {
                    writeln!(self.out, "{} - {}", command.name, command.description)?;
                }
            }
            Some(name) => match commands.iter().find(|command| command.name == name) {
                Some(command) => writeln!(self.out, "{} - {}", command.name, command.description)?,
                None => writeln!(self.out, "Unknown command '{}'", name)?,
            },
        }
        Ok(Flow::Continue)
    }

    fn cmd_c(&mut self, _: Option<&str>) -> io::Result<Flow> {
        self.run(None)?;
        Ok(Flow::Continue)
    }

    fn cmd_q(&mut self, _: Option<&str>) -> io::Result<Flow> {
        Ok(Flow::Quit)
    }

    fn cmd_si(&mut self, args: Option<&str>) -> io::Result<Flow> {
        match args.map_or(Ok(1), str::parse::<u64>) {
            Ok(steps) => self.run(Some(steps))?,
            Err(_) => writeln!(self.out, "si: expected a step count, got '{}'", args.unwrap_or(""))?,
        }
        Ok(Flow::Continue)
    }

    fn cmd_info(&mut self, args: Option<&str>) -> io::Result<Flow> {
        match args {
            Some("r") => self.print_registers()?,
            Some("w") => self.print_watchpoints()?,
            Some(other) => writeln!(self.out, "info: unknown subcommand '{}', use r or w", other)?,
            None => writeln!(self.out, "info: needs an argument, r or w")?,
        }
        Ok(Flow::Continue)
    }

    fn cmd_x(&mut self, args: Option<&str>) -> io::Result<Flow> {
        let parsed = args
            .and_then(|args| args.split_once(' '))
            .and_then(|(count, expression)| Some((count.parse::<u32>().ok()?, expression.trim())));
        let (count, expression) = match parsed {
            Some(parsed) => parsed,
            None => {
                writeln!(self.out, "x: usage is x N EXPR")?;
                return Ok(Flow::Continue);
            }
        };
        let address = match self.debugger.evaluate(expression, &self.machine) {
            Ok(value) => value as Address,
            Err(error) => {
                self.report_expr_error(expression, &error)?;
                return Ok(Flow::Continue);
            }
        };

        write!(self.out, "Memory:")?;
        for offset in 0..count {
            let current = address.wrapping_add(offset);
            let byte = match self.machine.memory.read_byte(current) {
                Ok(byte) => byte,
                Err(error) => {
                    writeln!(self.out)?;
                    writeln!(self.out, "x: {}", error)?;
                    return Ok(Flow::Continue);
                }
            };
            if offset % 4 == 0 {
                write!(self.out, "\n0x{:08x}:  0x{:02x}", current, byte)?;
            } else {
                write!(self.out, "  0x{:02x}", byte)?;
            }
        }
        writeln!(self.out)?;
        Ok(Flow::Continue)
    }

    fn cmd_p(&mut self, args: Option<&str>) -> io::Result<Flow> {
        let expression = match args {
            Some(expression) => expression,
            None => {
                writeln!(self.out, "p: usage is p EXPR")?;
                return Ok(Flow::Continue);
            }
        };
        match self.debugger.evaluate(expression, &self.machine) {
            Ok(value) => writeln!(self.out, "{}\t0x{:08x}", value, value as u32)?,
            Err(error) => self.report_expr_error(expression, &error)?,
        }
        Ok(Flow::Continue)
    }

    fn cmd_w(&mut self, args: Option<&str>) -> io::Result<Flow> {
        let expression = match args {
            Some(expression) => expression,
            None => {
                writeln!(self.out, "w: usage is w EXPR")?;
                return Ok(Flow::Continue);
            }
        };
        self.watch(expression)?;
        Ok(Flow::Continue)
    }

    fn cmd_d(&mut self, args: Option<&str>) -> io::Result<Flow> {
        let id = match args.and_then(|args| args.parse::<WatchpointId>().ok()) {
            Some(id) => id,
            None => {
                writeln!(self.out, "d: usage is d N")?;
                return Ok(Flow::Continue);
            }
        };
        match self.debugger.delete_watchpoint(id) {
            Ok(()) => writeln!(self.out, "Deleted watchpoint NO.{}", id)?,
            Err(error) => writeln!(self.out, "d: {}", error)?,
        }
        Ok(Flow::Continue)
    }

    /// Registers a watchpoint and reports the result. Returns whether it was created.
    pub fn watch(&mut self, expression: &str) -> io::Result<bool> {
        match self.debugger.create_watchpoint(expression, &self.machine) {
            Ok(id) => {
                let baseline = self
                    .debugger
                    .watchpoint(id)
                    .map_or(0, |watchpoint| watchpoint.baseline);
                if self.format == OutputFormat::Text {
                    writeln!(self.out, "Watchpoint {}: {} = {}", id, expression, baseline)?;
                }
                Ok(true)
            }
            Err(error) => {
                writeln!(self.out, "w: {}", error)?;
                if let WatchpointError::Expression {
                    source: ExprError::Lex(error),
                    ..
                } = &error
                {
                    if let Some(position) = error.position() {
                        self.print_caret(expression, position)?;
                    }
                }
                Ok(false)
            }
        }
    }

    pub fn run(&mut self, steps: Option<u64>) -> io::Result<()> {
        let debugger = &mut self.debugger;
        let mut hits = Vec::new();
        let mut failure = None;
        let result = self.machine.execute(steps, |machine| {
            match debugger.check_watchpoints(machine) {
                CheckOutcome::Unchanged => return true,
                CheckOutcome::Changed(changed) => hits.extend(changed),
                CheckOutcome::Failed { id, error, hits: changed } => {
                    hits.extend(changed);
                    failure = Some((id, error));
                }
            }
            false
        });

        for hit in &hits {
            self.report(Report::Watchpoint(hit), |out| writeln!(out, "{}\n", hit))?;
        }
        if let Some((id, error)) = failure {
            self.report(
                Report::WatchpointFailed {
                    id,
                    message: error.to_string(),
                },
                |out| writeln!(out, "watchpoint {} could not be evaluated: {}", id, error),
            )?;
        }
        match result {
            Ok(summary) => self.report_stop(summary),
            Err(error) => self.report(
                Report::Finished {
                    message: error.to_string(),
                },
                |out| writeln!(out, "{}", error),
            ),
        }
    }

    fn report_stop(&mut self, summary: RunSummary) -> io::Result<()> {
        let executed = self.machine.executed();
        match summary.reason {
            StopReason::StepBudget | StopReason::Hook => Ok(()),
            StopReason::Trap { eip, code } => self.report(
                Report::Trap {
                    eip,
                    code,
                    executed,
                },
                |out| {
                    let verdict = if code == 0 { "GOOD" } else { "BAD" };
                    writeln!(out, "nemu: HIT {} TRAP at eip = 0x{:08x}", verdict, eip)?;
                    writeln!(
                        out,
                        "executed {} instructions",
                        executed.to_formatted_string(&Locale::en)
                    )
                },
            ),
            StopReason::Fault(error) => self.report(
                Report::Abort {
                    message: error.to_string(),
                    executed,
                },
                |out| writeln!(out, "nemu: ABORT: {}", error),
            ),
        }
    }

    fn report(
        &mut self,
        report: Report<'_>,
        text: impl FnOnce(&mut W) -> io::Result<()>,
    ) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => text(&mut self.out),
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, &report)?;
                writeln!(self.out)
            }
        }
    }

    fn print_registers(&mut self) -> io::Result<()> {
        let registers = &self.machine.processor.registers;
        for (index, &gpr) in Gpr::ALL.iter().enumerate() {
            writeln!(
                self.out,
                "{}  0x{:08x}    {}  0x{:04x}",
                gpr.long_name(),
                registers.reg_l(gpr),
                gpr.word_name(),
                registers.reg_w(gpr)
            )?;
            if index < 4 {
                let (low, high) = (
                    ByteRegister::new(index as u8),
                    ByteRegister::new(index as u8 + 4),
                );
                writeln!(
                    self.out,
                    "{}   0x{:02x}          {}  0x{:02x}",
                    low.name(),
                    registers.reg_b(low),
                    high.name(),
                    registers.reg_b(high)
                )?;
            }
        }
        writeln!(self.out, "eip  0x{:08x}", self.machine.processor.eip)
    }

    fn print_watchpoints(&mut self) -> io::Result<()> {
        let watchpoints = self.debugger.list_watchpoints();
        if watchpoints.is_empty() {
            return writeln!(self.out, "there is no watchpoint now");
        }
        writeln!(self.out, "{:<6} {:<15} {}", "NO.", "expr", "hitTimes")?;
        for watchpoint in &watchpoints {
            writeln!(self.out, "{}", watchpoint)?;
        }
        Ok(())
    }

    fn report_expr_error(&mut self, expression: &str, error: &ExprError) -> io::Result<()> {
        writeln!(self.out, "{}", error)?;
        if let ExprError::Lex(error) = error {
            if let Some(position) = error.position() {
                self.print_caret(expression, position)?;
            }
        }
        Ok(())
    }

    fn print_caret(&mut self, expression: &str, position: usize) -> io::Result<()> {
        writeln!(self.out, "{}", expression)?;
        writeln!(self.out, "{:>width$}", "^", width = position + 1)
    }
}
