use std::{
    fmt,
    ops::{Index, IndexMut},
    str::FromStr,
};

use int_enum::IntEnum;
use thiserror::Error;

use crate::memory::{Memory, MemoryError};
use crate::{Address, Byte, HalfWord, Size, Word};

/// General-purpose registers in x86 encoding order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];

    const LONG_NAMES: [&'static str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
    const WORD_NAMES: [&'static str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];

    pub fn long_name(self) -> &'static str {
        Self::LONG_NAMES[self as usize]
    }

    pub fn word_name(self) -> &'static str {
        Self::WORD_NAMES[self as usize]
    }
}

/// 8-bit views: al, cl, dl, bl are the low bytes of eax..ebx, ah..bh the second bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRegister(u8);

impl ByteRegister {
    const NAMES: [&'static str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];

    pub fn new(encoding: u8) -> Self {
        Self(encoding & 0x7)
    }

    fn gpr(self) -> Gpr {
        Gpr::ALL[(self.0 & 0x3) as usize]
    }

    fn shift(self) -> u32 {
        if self.0 & 0x4 == 0 {
            0
        } else {
            8
        }
    }

    pub fn name(self) -> &'static str {
        Self::NAMES[self.0 as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterName {
    Long(Gpr),
    Word(Gpr),
    Byte(ByteRegister),
    Eip,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown register `{0}`")]
pub struct UnknownRegister(pub String);

impl FromStr for RegisterName {
    type Err = UnknownRegister;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if name == "eip" {
            return Ok(RegisterName::Eip);
        }
        let position = |names: &[&str]| names.iter().position(|&candidate| candidate == name);
        if let Some(index) = position(&Gpr::LONG_NAMES) {
            Ok(RegisterName::Long(Gpr::ALL[index]))
        } else if let Some(index) = position(&Gpr::WORD_NAMES) {
            Ok(RegisterName::Word(Gpr::ALL[index]))
        } else if let Some(index) = position(&ByteRegister::NAMES) {
            Ok(RegisterName::Byte(ByteRegister::new(index as u8)))
        } else {
            Err(UnknownRegister(name.to_owned()))
        }
    }
}

impl fmt::Display for RegisterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterName::Long(gpr) => f.write_str(gpr.long_name()),
            RegisterName::Word(gpr) => f.write_str(gpr.word_name()),
            RegisterName::Byte(byte) => f.write_str(byte.name()),
            RegisterName::Eip => f.write_str("eip"),
        }
    }
}

pub struct Registers([Word; 8]);

impl Index<Gpr> for Registers {
    type Output = Word;

    fn index(&self, index: Gpr) -> &Self::Output {
        &self.0[index as usize]
    }
}

impl IndexMut<Gpr> for Registers {
    fn index_mut(&mut self, index: Gpr) -> &mut Self::Output {
        &mut self.0[index as usize]
    }
}

impl Registers {
    pub fn reg_l(&self, gpr: Gpr) -> Word {
        self[gpr]
    }

    pub fn reg_w(&self, gpr: Gpr) -> HalfWord {
        self[gpr] as HalfWord
    }

    pub fn reg_b(&self, byte: ByteRegister) -> Byte {
        (self[byte.gpr()] >> byte.shift()) as Byte
    }

    pub fn set_reg_b(&mut self, byte: ByteRegister, value: Byte) {
        let shift = byte.shift();
        let register = &mut self[byte.gpr()];
        *register = (*register & !(0xFF << shift)) | ((value as Word) << shift);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    /// `nemu_trap` was executed; the program's result is in eax.
    Trap { eip: Address, code: Word },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("invalid opcode 0x{opcode:02x} at eip = 0x{eip:08x}")]
    InvalidOpcode { eip: Address, opcode: Byte },
    #[error("memory fault at eip = 0x{eip:08x}: {source}")]
    Memory {
        eip: Address,
        #[source]
        source: MemoryError,
    },
}

pub struct Processor {
    pub registers: Registers,
    pub eip: Address,
}

impl Processor {
    pub const ENTRY_POINT: Address = 0x100000;
    pub const STACK_START: Address = Memory::SIZE as Address;

    pub fn new() -> Self {
        let mut result = Self {
            registers: Registers([0; 8]),
            eip: Self::ENTRY_POINT,
        };
        result.registers[Gpr::Esp] = Self::STACK_START;
        result
    }

    pub fn read(&self, name: RegisterName) -> Word {
        match name {
            RegisterName::Long(gpr) => self.registers.reg_l(gpr),
            RegisterName::Word(gpr) => self.registers.reg_w(gpr) as Word,
            RegisterName::Byte(byte) => self.registers.reg_b(byte) as Word,
            RegisterName::Eip => self.eip,
        }
    }

    fn fetch(&mut self, memory: &Memory, len: usize) -> Result<Word, MemoryError> {
        let value = memory.read(self.eip, len)?;
        self.eip = self.eip.wrapping_add(len as Address);
        Ok(value)
    }

    fn stack_push(&mut self, memory: &mut Memory, value: Word) -> Result<(), MemoryError> {
        let esp = self.registers[Gpr::Esp].wrapping_sub(Word::SIZE as Word);
        memory.write(esp, Word::SIZE, value)?;
        self.registers[Gpr::Esp] = esp;
        Ok(())
    }

    fn stack_pop(&mut self, memory: &Memory) -> Result<Word, MemoryError> {
        let esp = self.registers[Gpr::Esp];
        let value = memory.read(esp, Word::SIZE)?;
        self.registers[Gpr::Esp] = esp.wrapping_add(Word::SIZE as Word);
        Ok(value)
    }

    /// Executes the instruction at eip. On error eip is left at the faulting instruction.
    pub fn make_tick(&mut self, memory: &mut Memory) -> Result<Tick, ExecError> {
        let eip = self.eip;
        let result = self.execute(memory);
        if result.is_err() {
            self.eip = eip;
        }
        result
    }

    fn execute(&mut self, memory: &mut Memory) -> Result<Tick, ExecError> {
        let eip = self.eip;
        let fault = |source| ExecError::Memory { eip, source };
        let opcode = self.fetch(memory, 1).map_err(fault)? as Byte;
        let register = || {
            Gpr::from_int(opcode & 0x7).map_err(|_| ExecError::InvalidOpcode { eip, opcode })
        };
        match opcode {
            0x90 => {}
            0x40..=0x47 => {
                let gpr = register()?;
                self.registers[gpr] = self.registers[gpr].wrapping_add(1);
            }
            0x48..=0x4F => {
                let gpr = register()?;
                self.registers[gpr] = self.registers[gpr].wrapping_sub(1);
            }
            0x50..=0x57 => {
                let value = self.registers[register()?];
                self.stack_push(memory, value).map_err(fault)?;
            }
            0x58..=0x5F => {
                let value = self.stack_pop(memory).map_err(fault)?;
                self.registers[register()?] = value;
            }
            0xB0..=0xB7 => {
                let immediate = self.fetch(memory, 1).map_err(fault)? as Byte;
                self.registers
                    .set_reg_b(ByteRegister::new(opcode), immediate);
            }
            0xB8..=0xBF => {
                let immediate = self.fetch(memory, Word::SIZE).map_err(fault)?;
                self.registers[register()?] = immediate;
            }
            0xE8 => {
                let displacement = self.fetch(memory, Word::SIZE).map_err(fault)?;
                let return_address = self.eip;
                self.stack_push(memory, return_address).map_err(fault)?;
                self.eip = return_address.wrapping_add(displacement);
            }
            0xC3 => {
                self.eip = self.stack_pop(memory).map_err(fault)?;
            }
            0xD6 => {
                return Ok(Tick::Trap {
                    eip,
                    code: self.registers[Gpr::Eax],
                })
            }
            _ => return Err(ExecError::InvalidOpcode { eip, opcode }),
        }
        Ok(Tick::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor_with_program(program: &[Byte]) -> (Processor, Memory) {
        let mut memory = Memory::new();
        memory.load(Processor::ENTRY_POINT, program).unwrap();
        (Processor::new(), memory)
    }

    #[test]
    fn register_names_round_trip_through_display() {
        for name in ["eax", "ecx", "sp", "di", "al", "bh", "eip"] {
            let parsed: RegisterName = name.parse().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
        assert_eq!(
            "rax".parse::<RegisterName>(),
            Err(UnknownRegister("rax".to_owned()))
        );
    }

    #[test]
    fn narrow_views_alias_the_full_register() {
        let mut processor = Processor::new();
        processor.registers[Gpr::Ebx] = 0x1234_5678;
        assert_eq!(processor.read("ebx".parse().unwrap()), 0x1234_5678);
        assert_eq!(processor.read("bx".parse().unwrap()), 0x5678);
        assert_eq!(processor.read("bl".parse().unwrap()), 0x78);
        assert_eq!(processor.read("bh".parse().unwrap()), 0x56);
    }

    #[test]
    fn move_constant_into_register() {
        // b8 imm32 => mov eax, imm32
        let (mut processor, mut memory) = processor_with_program(&[0xB8, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(processor.make_tick(&mut memory), Ok(Tick::Continue));
        assert_eq!(processor.registers[Gpr::Eax], 0x1234_5678);
        assert_eq!(processor.eip, Processor::ENTRY_POINT + 5);
    }

    #[test]
    fn move_byte_into_high_register() {
        // b4 imm8 => mov ah, imm8
        let (mut processor, mut memory) = processor_with_program(&[0xB4, 0xAB]);
        processor.registers[Gpr::Eax] = 0xFFFF_FFFF;
        processor.make_tick(&mut memory).unwrap();
        assert_eq!(processor.registers[Gpr::Eax], 0xFFFF_ABFF);
    }

    #[test]
    fn increment_and_decrement_wrap() {
        let (mut processor, mut memory) = processor_with_program(&[0x41, 0x4A]);
        processor.registers[Gpr::Ecx] = Word::MAX;
        processor.make_tick(&mut memory).unwrap();
        processor.make_tick(&mut memory).unwrap();
        assert_eq!(processor.registers[Gpr::Ecx], 0);
        assert_eq!(processor.registers[Gpr::Edx], Word::MAX);
    }

    #[test]
    fn push_then_pop_moves_value_between_registers() {
        let (mut processor, mut memory) = processor_with_program(&[0x53, 0x5E]);
        let esp = processor.registers[Gpr::Esp];
        processor.registers[Gpr::Ebx] = 0xC0FFEE;
        processor.make_tick(&mut memory).unwrap();
        assert_eq!(processor.registers[Gpr::Esp], esp - 4);
        processor.make_tick(&mut memory).unwrap();
        assert_eq!(processor.registers[Gpr::Esi], 0xC0FFEE);
        assert_eq!(processor.registers[Gpr::Esp], esp);
    }

    #[test]
    fn call_and_return() {
        // call +1; trap; ret
        let (mut processor, mut memory) =
            processor_with_program(&[0xE8, 0x01, 0x00, 0x00, 0x00, 0xD6, 0xC3]);
        processor.make_tick(&mut memory).unwrap();
        assert_eq!(processor.eip, Processor::ENTRY_POINT + 6);
        processor.make_tick(&mut memory).unwrap();
        assert_eq!(processor.eip, Processor::ENTRY_POINT + 5);
        assert_eq!(
            processor.make_tick(&mut memory),
            Ok(Tick::Trap {
                eip: Processor::ENTRY_POINT + 5,
                code: 0
            })
        );
    }

    #[test]
    fn invalid_opcode_leaves_eip_in_place() {
        let (mut processor, mut memory) = processor_with_program(&[0x0F]);
        assert_eq!(
            processor.make_tick(&mut memory),
            Err(ExecError::InvalidOpcode {
                eip: Processor::ENTRY_POINT,
                opcode: 0x0F
            })
        );
        assert_eq!(processor.eip, Processor::ENTRY_POINT);
    }
}
