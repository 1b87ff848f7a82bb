use crate::{*, error::*, settings::*};
use std::fmt;

// Only the instructions that the frame walker ever needs to look at: calls (the instruction before a
// Lua frame's return pc) and function headers. Anything else in that position means our idea of the
// VM's bytecode is out of date, and the walk fails with UnsupportedOpcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    CallM = 0x33,
    Call = 0x34,
    CallMT = 0x35,
    CallT = 0x36,
    // Generic for loop: calls the iterator.
    IterC = 0x37,
    IterN = 0x38,

    FuncF = 0x50,
    IFuncF = 0x51,
    JFuncF = 0x52,
    FuncV = 0x53,
    IFuncV = 0x54,
    JFuncV = 0x55,
    FuncC = 0x56,
    FuncCW = 0x57,
}

impl Opcode {
    pub const ALL: [Opcode; 14] = [Opcode::CallM, Opcode::Call, Opcode::CallMT, Opcode::CallT, Opcode::IterC, Opcode::IterN, Opcode::FuncF, Opcode::IFuncF, Opcode::JFuncF, Opcode::FuncV, Opcode::IFuncV, Opcode::JFuncV, Opcode::FuncC, Opcode::FuncCW];

    pub fn name(self) -> &'static str {
        match self {
            Self::CallM => "CALLM",
            Self::Call => "CALL",
            Self::CallMT => "CALLMT",
            Self::CallT => "CALLT",
            Self::IterC => "ITERC",
            Self::IterN => "ITERN",
            Self::FuncF => "FUNCF",
            Self::IFuncF => "IFUNCF",
            Self::JFuncF => "JFUNCF",
            Self::FuncV => "FUNCV",
            Self::IFuncV => "IFUNCV",
            Self::JFuncV => "JFUNCV",
            Self::FuncC => "FUNCC",
            Self::FuncCW => "FUNCCW",
        }
    }

    // Mode of operand A.
    pub fn mode_a(self) -> OperandMode {
        match self {
            Self::CallM | Self::Call | Self::CallMT | Self::CallT | Self::IterC | Self::IterN => OperandMode::Base,
            Self::FuncF | Self::IFuncF | Self::JFuncF | Self::FuncV | Self::IFuncV | Self::JFuncV | Self::FuncC | Self::FuncCW => OperandMode::RBase,
        }
    }

    pub fn is_tail_call(self) -> bool {
        match self {
            Self::CallT | Self::CallMT => true,
            _ => false,
        }
    }

    pub fn is_call(self) -> bool {
        match self {
            Self::CallM | Self::Call | Self::CallMT | Self::CallT | Self::IterC | Self::IterN => true,
            _ => false,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(op: u8) -> Result<Self> {
        match Self::ALL.iter().find(|o| **o as u8 == op) {
            Some(o) => Ok(*o),
            None => err!(UnsupportedOpcode, "unexpected opcode 0x{:02x} (expected a call or a function header)", op),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// Operand modes, in the VM's order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandMode {
    None,
    Dst,
    Base,
    Var,
    RBase,
    Uv,
    Lit,
    Lits,
    Pri,
    Num,
    Str,
    Tab,
    Func,
    Jump,
    Cdata,
}

impl OperandMode {
    // Operands holding slot numbers (and number constant indices), stored doubled in x2-encoded bytecode.
    pub fn is_x2(self) -> bool {
        match self {
            Self::Dst | Self::Var | Self::Base | Self::RBase | Self::Num => true,
            Self::None | Self::Uv | Self::Lit | Self::Lits | Self::Pri | Self::Str | Self::Tab | Self::Func | Self::Jump | Self::Cdata => false,
        }
    }
}

pub const NO_REG: u32 = 0xff;

// One instruction: opcode in the low byte, then A, then C and B (or 16-bit D).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ins(pub u32);

impl Ins {
    pub fn new(op: Opcode, a: u32, d: u32) -> Self {
        Ins((op as u32) | ((a & 0xff) << 8) | ((d & 0xffff) << 16))
    }

    pub fn op_raw(self) -> u8 { (self.0 & 0xff) as u8 }
    pub fn a_raw(self) -> u32 { (self.0 >> 8) & 0xff }
    pub fn d_raw(self) -> u32 { self.0 >> 16 }

    pub fn opcode(self) -> Result<Opcode> {
        Opcode::try_from(self.op_raw())
    }

    // Operand A as a slot number.
    pub fn a(self, encoding: RegisterEncoding) -> Result<u32> {
        let op = self.opcode()?;
        let a = self.a_raw();
        Ok(match encoding {
            RegisterEncoding::Doubled if op.mode_a().is_x2() && a != NO_REG => a >> 1,
            _ => a,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, bytecode::*, settings::*};

    #[test]
    fn opcodes() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::try_from(op as u8).unwrap(), op);
        }
        // Neighbors of the supported ranges.
        for op in [0u8, 0x32, 0x39, 0x3b, 0x4f, 0x58, 0xff] {
            assert!(Opcode::try_from(op).unwrap_err().is_unsupported_opcode());
        }
        assert!(Opcode::CallT.is_tail_call());
        assert!(Opcode::CallMT.is_tail_call());
        assert!(!Opcode::Call.is_tail_call());
        assert!(!Opcode::FuncF.is_call());
        assert!(Opcode::IterC.is_call());
        assert!(Opcode::IterN.is_call());
        assert!(!Opcode::IterC.is_tail_call());
        assert_eq!(Opcode::try_from(0x37).unwrap(), Opcode::IterC);
        assert_eq!(Opcode::try_from(0x38).unwrap().to_string(), "ITERN");
        assert_eq!(Opcode::CallMT.to_string(), "CALLMT");
    }

    #[test]
    fn operand_a() {
        // CALL A=5, x2-encoded as 10.
        let ins = Ins(0x34 | (10 << 8) | (2 << 16));
        assert_eq!(ins.opcode().unwrap(), Opcode::Call);
        assert_eq!(ins.a(RegisterEncoding::Doubled).unwrap(), 5);
        assert_eq!(ins.a(RegisterEncoding::Plain).unwrap(), 10);
        assert_eq!(ins.d_raw(), 2);

        // NO_REG isn't decoded.
        let ins = Ins::new(Opcode::FuncF, NO_REG, 0);
        assert_eq!(ins.a(RegisterEncoding::Doubled).unwrap(), NO_REG);

        let ins = Ins(0x12 | (4 << 8));
        assert!(ins.a(RegisterEncoding::Doubled).unwrap_err().is_unsupported_opcode());
    }

    #[test]
    fn x2_modes() {
        let x2: Vec<OperandMode> = [OperandMode::None, OperandMode::Dst, OperandMode::Base, OperandMode::Var, OperandMode::RBase, OperandMode::Uv, OperandMode::Lit, OperandMode::Lits, OperandMode::Pri, OperandMode::Num, OperandMode::Str, OperandMode::Tab, OperandMode::Func, OperandMode::Jump, OperandMode::Cdata].into_iter().filter(|m| m.is_x2()).collect();
        assert_eq!(x2, vec![OperandMode::Dst, OperandMode::Base, OperandMode::Var, OperandMode::RBase, OperandMode::Num]);
    }
}
