pub mod expr;
pub mod lexer;
pub mod monitor;
pub mod watchpoint;

use crate::{memory::MemoryError, processor::RegisterName, Address};

pub use self::expr::{EvalError, ExprError};
pub use self::monitor::{CheckOutcome, WatchpointHit};
pub use self::watchpoint::{WatchpointError, WatchpointId, WatchpointInfo, WatchpointPool};

/// Read-only view of the machine that expressions are evaluated against.
pub trait Inspect {
    fn register(&self, name: RegisterName) -> u32;
    fn read_byte(&self, address: Address) -> Result<u8, MemoryError>;
}

/// Entry points used by the command shell: expression evaluation and the watchpoint set.
#[derive(Debug, Default)]
pub struct Debugger {
    watchpoints: WatchpointPool,
}

impl Debugger {
    pub fn new() -> Self {
        Self {
            watchpoints: WatchpointPool::new(),
        }
    }

    pub fn evaluate<S: Inspect + ?Sized>(&self, text: &str, state: &S) -> Result<i32, ExprError> {
        expr::evaluate(text, state)
    }

    pub fn create_watchpoint<S: Inspect + ?Sized>(
        &mut self,
        text: &str,
        state: &S,
    ) -> Result<WatchpointId, WatchpointError> {
        self.watchpoints.create(text, state)
    }

    pub fn delete_watchpoint(&mut self, id: WatchpointId) -> Result<(), WatchpointError> {
        if self.watchpoints.delete(id) {
            Ok(())
        } else {
            Err(WatchpointError::NotFound(id))
        }
    }

    pub fn list_watchpoints(&self) -> Vec<WatchpointInfo> {
        self.watchpoints.list()
    }

    /// Run between two executed instructions, never during one.
    pub fn check_watchpoints<S: Inspect + ?Sized>(&mut self, state: &S) -> CheckOutcome {
        monitor::check_all(&mut self.watchpoints, state)
    }

    pub fn watchpoint(&self, id: WatchpointId) -> Option<&watchpoint::Watchpoint> {
        self.watchpoints.get(id)
    }
}
