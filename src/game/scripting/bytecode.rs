//! Bytecode encoding.
//!
//! Opcodes are written with a base-64 continuation scheme: every byte below
//! `0x80` carries six data bits, and bit `0x40` means another byte follows.
//! Integer literals use the same digits with bit `0x80` set; `0xC0` marks a
//! continuation and the final byte has only `0x80` set. A byte at or above
//! `0x80` in opcode position therefore always starts an integer literal.
//!
//! Name and label operands are fixed three byte little-endian values so
//! forward references can be patched in place.

/// Backpatch chain terminator and "no label" marker.
pub const NO_LINK: u32 = 0x00ff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Nop = 0,
    Pos,
    Int,
    Param,
    Func,
    Str,
    ConstStr,
    Arg,
    Name,
    Eol,
    RetInfo,
    UserFunc,
    UserFuncPos,
    Ref,

    Lor,
    Land,
    Le,
    Lt,
    Ge,
    Gt,
    Eq,
    Ne,
    Xor,
    Or,
    And,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Lnot,
    Not,
    RShift,
    LShift,
    AddPost,
    SubPost,
    AddPre,
    SubPre,
    Op3,
}

const OPS: [Op; 40] = [
    Op::Nop,
    Op::Pos,
    Op::Int,
    Op::Param,
    Op::Func,
    Op::Str,
    Op::ConstStr,
    Op::Arg,
    Op::Name,
    Op::Eol,
    Op::RetInfo,
    Op::UserFunc,
    Op::UserFuncPos,
    Op::Ref,
    Op::Lor,
    Op::Land,
    Op::Le,
    Op::Lt,
    Op::Ge,
    Op::Gt,
    Op::Eq,
    Op::Ne,
    Op::Xor,
    Op::Or,
    Op::And,
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::Div,
    Op::Mod,
    Op::Neg,
    Op::Lnot,
    Op::Not,
    Op::RShift,
    Op::LShift,
    Op::AddPost,
    Op::SubPost,
    Op::AddPre,
    Op::SubPre,
    Op::Op3,
];

impl Op {
    pub fn from_code(code: u32) -> Option<Op> {
        OPS.get(code as usize).copied()
    }

    /// Operator spelling used in diagnostics
    pub fn name(self) -> &'static str {
        match self {
            Op::Lor => "C_LOR",
            Op::Land => "C_LAND",
            Op::Le => "C_LE",
            Op::Lt => "C_LT",
            Op::Ge => "C_GE",
            Op::Gt => "C_GT",
            Op::Eq => "C_EQ",
            Op::Ne => "C_NE",
            Op::Xor => "C_XOR",
            Op::Or => "C_OR",
            Op::And => "C_AND",
            Op::Add => "C_ADD",
            Op::Sub => "C_SUB",
            Op::Mul => "C_MUL",
            Op::Div => "C_DIV",
            Op::Mod => "C_MOD",
            Op::Neg => "C_NEG",
            Op::Lnot => "C_LNOT",
            Op::Not => "C_NOT",
            Op::RShift => "C_R_SHIFT",
            Op::LShift => "C_L_SHIFT",
            Op::AddPost => "C_ADD_POST",
            Op::SubPost => "C_SUB_POST",
            Op::AddPre => "C_ADD_PRE",
            Op::SubPre => "C_SUB_PRE",
            Op::Op3 => "C_OP3",
            _ => "C_???",
        }
    }
}

/// An instruction fetched from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    Op(Op),
    /// An integer literal starts here; the position was not advanced
    Int,
    Unknown(u32),
}

/// Append-only bytecode writer.
#[derive(Debug, Default, Clone)]
pub struct ScriptBuf {
    bytes: Vec<u8>,
}

impl ScriptBuf {
    pub fn new() -> Self {
        Self { bytes: Vec::with_capacity(256) }
    }

    pub fn pos(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn add_byte(&mut self, b: u8) {
        self.bytes.push(b);
    }

    pub fn add_op(&mut self, op: Op) {
        self.add_code(op as u32);
    }

    /// Writes an opcode-class value.
    pub fn add_code(&mut self, mut a: u32) {
        while a >= 0x40 {
            self.bytes.push(((a & 0x3f) | 0x40) as u8);
            a = (a - 0x40) >> 6;
        }
        self.bytes.push(a as u8);
    }

    /// Writes a non-negative integer literal.
    pub fn add_uint(&mut self, mut a: u64) {
        while a >= 0x40 {
            self.bytes.push(((a & 0x3f) | 0xc0) as u8);
            a = (a - 0x40) >> 6;
        }
        self.bytes.push((a | 0x80) as u8);
    }

    /// Writes a literal; negative values become `abs(v)` followed by NEG.
    pub fn add_int(&mut self, v: i64) {
        self.add_uint(v.unsigned_abs());
        if v < 0 {
            self.add_op(Op::Neg);
        }
    }

    pub fn add_u24(&mut self, v: u32) {
        self.bytes.push(v as u8);
        self.bytes.push((v >> 8) as u8);
        self.bytes.push((v >> 16) as u8);
    }

    pub fn set_u24(&mut self, at: usize, v: u32) {
        self.bytes[at] = v as u8;
        self.bytes[at + 1] = (v >> 8) as u8;
        self.bytes[at + 2] = (v >> 16) as u8;
    }

    pub fn set_byte(&mut self, at: usize, b: u8) {
        self.bytes[at] = b;
    }

    /// Writes a nul-terminated string body.
    pub fn add_cstr(&mut self, s: &[u8]) {
        self.bytes.extend_from_slice(s);
        self.bytes.push(0);
    }
}

pub fn get_u24(buf: &[u8], pos: usize) -> u32 {
    let b = |i: usize| u32::from(buf.get(pos + i).copied().unwrap_or(0));
    b(0) | (b(1) << 8) | (b(2) << 16)
}

/// Fetches the next opcode, advancing `pos` past it.
pub fn get_com(buf: &[u8], pos: &mut usize) -> Fetched {
    let Some(&first) = buf.get(*pos) else {
        return Fetched::Op(Op::Nop);
    };
    if first >= 0x80 {
        return Fetched::Int;
    }
    let mut i: u32 = 0;
    let mut j: u32 = 0;
    while let Some(&b) = buf.get(*pos) {
        if b >= 0x40 && b < 0x80 {
            i = i.wrapping_add(u32::from(b).checked_shl(j).unwrap_or(0));
            *pos += 1;
            j += 6;
        } else {
            break;
        }
    }
    let last = buf.get(*pos).copied().unwrap_or(0);
    *pos += 1;
    i = i.wrapping_add(u32::from(last).checked_shl(j).unwrap_or(0));
    match Op::from_code(i) {
        Some(op) => Fetched::Op(op),
        None => Fetched::Unknown(i),
    }
}

/// Reads an integer literal, advancing `pos` past it.
pub fn get_num(buf: &[u8], pos: &mut usize) -> i64 {
    let mut i: u64 = 0;
    let mut j: u32 = 0;
    while let Some(&b) = buf.get(*pos) {
        if b >= 0xc0 {
            i = i.wrapping_add(u64::from(b & 0x7f).checked_shl(j).unwrap_or(0));
            *pos += 1;
            j += 6;
        } else {
            break;
        }
    }
    let last = buf.get(*pos).copied().unwrap_or(0x80);
    *pos += 1;
    i = i.wrapping_add(u64::from(last & 0x7f).checked_shl(j).unwrap_or(0));
    i as i64
}

/// Reads a nul-terminated string starting at `pos`, advancing past the nul.
pub fn get_cstr(buf: &[u8], pos: &mut usize) -> String {
    let rest = buf.get(*pos..).unwrap_or(&[]);
    let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let s = String::from_utf8_lossy(&rest[..len]).into_owned();
    *pos += len + 1;
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_int(buf: &ScriptBuf) -> i64 {
        let bytes = buf.as_bytes();
        let mut pos = 0;
        assert_eq!(get_com(bytes, &mut pos), Fetched::Int);
        let v = get_num(bytes, &mut pos);
        if pos < bytes.len() {
            assert_eq!(get_com(bytes, &mut pos), Fetched::Op(Op::Neg));
            return v.wrapping_neg();
        }
        v
    }

    #[test]
    fn test_integer_round_trip() {
        for v in [
            0i64,
            1,
            0x3f,
            0x40,
            0x41,
            0xfff,
            0x1000,
            123_456_789,
            i64::from(i32::MAX),
            i64::MAX,
            -1,
            -0x40,
            -987_654_321,
            i64::MIN,
        ] {
            let mut buf = ScriptBuf::new();
            buf.add_int(v);
            assert_eq!(decode_int(&buf), v, "value {v}");
        }
    }

    #[test]
    fn test_negative_literal_uses_neg_opcode() {
        let mut buf = ScriptBuf::new();
        buf.add_int(-5);
        assert_eq!(buf.as_bytes(), &[0x85, Op::Neg as u8]);
    }

    #[test]
    fn test_small_literal_is_single_byte() {
        let mut buf = ScriptBuf::new();
        buf.add_int(0x3f);
        assert_eq!(buf.as_bytes(), &[0xbf]);
    }

    #[test]
    fn test_large_opcode_code_round_trip() {
        for code in [0u32, 0x3f, 0x40, 0x1000, 0x2000, 0x12345] {
            let mut buf = ScriptBuf::new();
            buf.add_code(code);
            buf.add_op(Op::Eol);
            let mut pos = 0;
            let fetched = get_com(buf.as_bytes(), &mut pos);
            match Op::from_code(code) {
                Some(op) => assert_eq!(fetched, Fetched::Op(op)),
                None => assert_eq!(fetched, Fetched::Unknown(code)),
            }
            assert_eq!(get_com(buf.as_bytes(), &mut pos), Fetched::Op(Op::Eol));
        }
    }

    #[test]
    fn test_u24_patch() {
        let mut buf = ScriptBuf::new();
        buf.add_op(Op::Name);
        buf.add_u24(NO_LINK);
        assert_eq!(get_u24(buf.as_bytes(), 1), NO_LINK);
        buf.set_u24(1, 0x012345);
        assert_eq!(get_u24(buf.as_bytes(), 1), 0x012345);
    }

    #[test]
    fn test_cstr() {
        let mut buf = ScriptBuf::new();
        buf.add_op(Op::Str);
        buf.add_cstr(b"hello");
        buf.add_op(Op::Nop);
        let mut pos = 1;
        assert_eq!(get_cstr(buf.as_bytes(), &mut pos), "hello");
        assert_eq!(get_com(buf.as_bytes(), &mut pos), Fetched::Op(Op::Nop));
    }
}
