use thiserror::Error;

use crate::debugger::Inspect;
use crate::memory::{Memory, MemoryError};
use crate::processor::{ExecError, Processor, RegisterName, Tick};
use crate::{Address, Word};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
    Ended { eip: Address, code: Word },
    Aborted { eip: Address },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested number of instructions has been executed.
    StepBudget,
    /// The post-step hook asked to stop.
    Hook,
    Trap { eip: Address, code: Word },
    Fault(ExecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: u64,
    pub reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("Program execution has ended. To restart the program, exit and run again.")]
    Finished,
}

pub struct Machine {
    pub memory: Memory,
    pub processor: Processor,
    state: RunState,
    executed: u64,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            memory: Memory::new(),
            processor: Processor::new(),
            state: RunState::Stopped,
            executed: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Instructions executed since the program was loaded, across every run.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Executes up to `steps` instructions (all of them for `None`), calling `post_step`
    /// after each one. Execution stops as soon as the hook returns `false`.
    pub fn execute(
        &mut self,
        steps: Option<u64>,
        mut post_step: impl FnMut(&Machine) -> bool,
    ) -> Result<RunSummary, MachineError> {
        if let RunState::Ended { .. } | RunState::Aborted { .. } = self.state {
            return Err(MachineError::Finished);
        }

        self.state = RunState::Running;
        let mut executed = 0;
        let reason = loop {
            if steps.map_or(false, |steps| executed >= steps) {
                break StopReason::StepBudget;
            }
            match self.processor.make_tick(&mut self.memory) {
                Ok(Tick::Continue) => {}
                Ok(Tick::Trap { eip, code }) => {
                    executed += 1;
                    self.state = RunState::Ended { eip, code };
                    break StopReason::Trap { eip, code };
                }
                Err(error) => {
                    self.state = RunState::Aborted {
                        eip: self.processor.eip,
                    };
                    break StopReason::Fault(error);
                }
            }
            executed += 1;
            if !post_step(self) {
                break StopReason::Hook;
            }
        };

        if self.state == RunState::Running {
            self.state = RunState::Stopped;
        }
        self.executed += executed;
        Ok(RunSummary { executed, reason })
    }
}

impl Inspect for Machine {
    fn register(&self, name: RegisterName) -> u32 {
        self.processor.read(name)
    }

    fn read_byte(&self, address: Address) -> Result<u8, MemoryError> {
        self.memory.read_byte(address)
    }
}
