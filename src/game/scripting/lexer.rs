//! Character-level scanning helpers.
//!
//! Positions are byte offsets into the source; reading past the end yields a
//! nul byte so scanners stop naturally at end of input.

/// Byte at `i`, or 0 past the end.
#[inline]
pub fn peek(src: &[u8], i: usize) -> u8 {
    src.get(i).copied().unwrap_or(0)
}

#[inline]
fn is_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

#[inline]
pub fn is_word_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// Skips whitespace and comments.
///
/// `Err` carries the end-of-input position when a block comment is left open.
pub fn skip_space_checked(src: &[u8], mut p: usize) -> Result<usize, usize> {
    loop {
        while is_space(peek(src, p)) {
            p += 1;
        }
        if peek(src, p) == b'/' && peek(src, p + 1) == b'/' {
            while p < src.len() && src[p] != b'\n' {
                p += 1;
            }
        } else if peek(src, p) == b'/' && peek(src, p + 1) == b'*' {
            p += 2;
            loop {
                if p >= src.len() {
                    return Err(src.len());
                }
                if src[p] == b'*' && peek(src, p + 1) == b'/' {
                    p += 2;
                    break;
                }
                p += 1;
            }
        } else {
            return Ok(p);
        }
    }
}

pub fn skip_space(src: &[u8], p: usize) -> usize {
    skip_space_checked(src, p).unwrap_or_else(|end| end)
}

/// Skips one identifier including its scope prefix and string postfix.
pub fn skip_word(src: &[u8], mut p: usize) -> usize {
    match peek(src, p) {
        b'@' | b'\'' => p += 1,
        b'#' => p += if peek(src, p + 1) == b'#' { 2 } else { 1 },
        b'.' | b'$' => p += if peek(src, p + 1) == b'@' { 2 } else { 1 },
        _ => {}
    }

    while is_word_char(peek(src, p)) {
        p += 1;
    }

    if peek(src, p) == b'$' {
        p += 1;
    }

    p
}

/// Whether a numeric literal starts at `p`.
///
/// Accepts an optional sign and decimal or `0x` hex digits, but not when the
/// digits run straight into a letter or underscore (`1st_Guard` is a name).
pub fn is_number(src: &[u8], mut p: usize) -> bool {
    if matches!(peek(src, p), b'-' | b'+') {
        p += 1;
    }
    let mut np;
    if peek(src, p) == b'0' && peek(src, p + 1) == b'x' {
        p += 2;
        np = p;
        while peek(src, np).is_ascii_hexdigit() {
            np += 1;
        }
    } else {
        np = p;
        while peek(src, np).is_ascii_digit() {
            np += 1;
        }
    }
    let next = peek(src, np);
    p != np && next != b'_' && !next.is_ascii_alphabetic()
}

/// Parses a numeric literal at `p` (after the caller stripped any sign).
///
/// Returns the value and the end position. Values beyond i64 saturate.
pub fn parse_number(src: &[u8], mut p: usize) -> (i64, usize) {
    let radix = if peek(src, p) == b'0' && peek(src, p + 1) == b'x' {
        p += 2;
        16
    } else {
        10
    };
    let mut value: i64 = 0;
    while let Some(d) = (peek(src, p) as char).to_digit(radix) {
        value = value.saturating_mul(i64::from(radix)).saturating_add(i64::from(d));
        p += 1;
    }
    (value, p)
}

/// Store a variable name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarScope {
    /// No prefix: permanent character variable or parameter
    Char,
    /// `@`
    CharTemp,
    /// `#`
    Account,
    /// `##`
    AccountGlobal,
    /// `$`
    Global,
    /// `$@`
    GlobalTemp,
    /// `.`
    Npc,
    /// `.@`
    Scope,
    /// `'`
    Instance,
}

impl VarScope {
    /// Needs an attached character to resolve.
    pub fn is_player(self) -> bool {
        matches!(
            self,
            VarScope::Char | VarScope::CharTemp | VarScope::Account | VarScope::AccountGlobal
        )
    }

    pub fn prefix(self) -> &'static str {
        match self {
            VarScope::Char => "",
            VarScope::CharTemp => "@",
            VarScope::Account => "#",
            VarScope::AccountGlobal => "##",
            VarScope::Global => "$",
            VarScope::GlobalTemp => "$@",
            VarScope::Npc => ".",
            VarScope::Scope => ".@",
            VarScope::Instance => "'",
        }
    }
}

/// A variable name split into its scope, base name and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarName<'a> {
    pub scope: VarScope,
    pub base: &'a str,
    pub is_string: bool,
}

impl<'a> VarName<'a> {
    pub fn parse(name: &'a str) -> VarName<'a> {
        let name = name.trim();
        let b = name.as_bytes();
        let (scope, skip) = match (peek(b, 0), peek(b, 1)) {
            (b'@', _) => (VarScope::CharTemp, 1),
            (b'#', b'#') => (VarScope::AccountGlobal, 2),
            (b'#', _) => (VarScope::Account, 1),
            (b'$', b'@') => (VarScope::GlobalTemp, 2),
            (b'$', _) => (VarScope::Global, 1),
            (b'.', b'@') => (VarScope::Scope, 2),
            (b'.', _) => (VarScope::Npc, 1),
            (b'\'', _) => (VarScope::Instance, 1),
            _ => (VarScope::Char, 0),
        };
        let rest = &name[skip.min(name.len())..];
        let (base, is_string) = match rest.strip_suffix('$') {
            Some(base) => (base, true),
            None => (rest, false),
        };
        VarName { scope, base, is_string }
    }
}

pub fn is_string_variable(name: &str) -> bool {
    name.ends_with('$')
}

/// Splits `name[index]` into its parts; a missing or malformed index is 0.
pub fn split_var_index(text: &str) -> (&str, u32) {
    let text = text.trim();
    let Some(open) = text.find('[') else {
        return (text, 0);
    };
    let name = &text[..open];
    let inner = text[open + 1..].split(']').next().unwrap_or("").trim();
    let index = inner.parse::<i64>().ok().and_then(|i| u32::try_from(i).ok()).unwrap_or(0);
    (name, index)
}
