//! Two-pass assembler for the `.sbbasm` dialect.
//!
//! Source lines split into three families: data declarations (before the
//! first label), function labels, and instructions. The layout pass pins
//! every emitting line to a RAM address: code for `start` grows up from
//! address 0, data and other functions grow down from the top of RAM.
//! The emission pass then resolves operands (numbers, `lN` line
//! references, `&name` pointer references, symbols) and writes the final
//! 4096-byte image, `start` last.

extern crate pest;
#[macro_use]
extern crate pest_derive;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use pest::Parser;
use thiserror::Error;

use common::{OpClass, Opcode, RAM_SIZE};

#[derive(Parser)]
#[grammar = "assembly.pest"]
struct AsmParser;

#[derive(Error, Debug)]
pub enum AsmError {
    #[error("[line {line}] syntax error: {msg}")]
    Syntax { line: usize, msg: String },
    #[error("[line {line}] {msg}")]
    Declaration { line: usize, msg: String },
    #[error("[line {line}] incorrect use of <{op}>")]
    OpcodeArity { line: usize, op: String },
    #[error("[line {line}] invalid reference <{name}>")]
    Reference { line: usize, name: String },
    #[error("[line {line}] {msg}")]
    Layout { line: usize, msg: String },
}

fn syntax(line: usize, msg: impl Into<String>) -> AsmError {
    AsmError::Syntax { line, msg: msg.into() }
}

/// A named region of the image: a variable, an array, or a function
/// body. Kept around for diagnostics after assembly.
#[derive(Debug, Clone)]
pub struct Token {
    pub name: String,
    pub addr: u16,
    pub bytes: Vec<u8>,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}> at {} contains [", self.name, self.addr)?;
        for (i, byte) in self.bytes.iter().take(5).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", byte)?;
        }
        if self.bytes.len() > 5 {
            write!(f, ", ...")?;
        }
        write!(f, "]")
    }
}

/// Result of a successful assembly.
pub struct Program {
    pub ram: Vec<u8>,
    pub tokens: Vec<Token>,
    /// RAM address of each source line's first emitted byte, if any.
    pub line_addr: Vec<Option<u16>>,
    /// Bytes of image content, auto-created variables included.
    pub size: usize,
    /// Whether any halt-family opcode appears; halt-less programs run
    /// against the host's tick cap.
    pub ends: bool,
}

// ---------------------------------------------------------------------
// lexing

#[derive(Debug, Clone)]
enum Tok {
    Word(String),
    Str(String),
    Marker(String),
    Pointer { name: String, extra: u16 },
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Word(w) => w.clone(),
            Tok::Str(s) => format!("\"{}\"", s),
            Tok::Marker(n) => format!("*{}", n),
            Tok::Pointer { name, extra } => {
                format!("{}{}", "&".repeat(*extra as usize + 1), name)
            }
        }
    }
}

fn unescape(line: usize, raw: &str) -> Result<String, AsmError> {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            // unknown escapes pass through verbatim
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => return Err(syntax(line, "unterminated escape")),
        }
    }
    Ok(out)
}

fn lex_line(line_no: usize, text: &str) -> Result<Vec<Tok>, AsmError> {
    let mut parsed = AsmParser::parse(Rule::line, text)
        .map_err(|_| syntax(line_no, "unrecognized token"))?;
    let mut toks = Vec::new();
    for pair in parsed.next().unwrap().into_inner() {
        match pair.as_rule() {
            Rule::string => toks.push(Tok::Str(unescape(line_no, pair.as_str())?)),
            Rule::marker => toks.push(Tok::Marker(pair.as_str()[1..].to_string())),
            Rule::pointer => {
                let s = pair.as_str();
                let amps = s.bytes().take_while(|b| *b == b'&').count();
                toks.push(Tok::Pointer {
                    name: s[amps..].to_string(),
                    extra: (amps - 1) as u16,
                });
            }
            Rule::word => toks.push(Tok::Word(pair.as_str().to_string())),
            Rule::EOI => {}
            r => unreachable!("{:?}", r),
        }
    }
    Ok(toks)
}

// ---------------------------------------------------------------------
// numbers

/// Numeric value of a token: decimal (optionally negative), `$` hex,
/// `%` binary, or a string literal packed little-endian into an integer.
fn number(tok: &Tok) -> Option<i128> {
    match tok {
        Tok::Str(s) => {
            let mut value: i128 = 0;
            for (i, c) in s.chars().enumerate() {
                if c as u32 > 0xFF || i >= 15 {
                    return None;
                }
                value |= (c as u32 as i128) << (i * 8);
            }
            Some(value)
        }
        Tok::Word(w) => {
            let bytes = w.as_bytes();
            match bytes.first()? {
                b'$' => i128::from_str_radix(&w[1..], 16).ok(),
                b'%' => i128::from_str_radix(&w[1..], 2).ok(),
                b'-' if w.len() > 1 && bytes[1..].iter().all(u8::is_ascii_digit) => {
                    w.parse().ok()
                }
                b'0'..=b'9' if bytes.iter().all(u8::is_ascii_digit) => w.parse().ok(),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Little-endian byte image of a value. Values below 255 emit a single
/// byte; everything else sheds low bytes until the remainder fits. The
/// `< 255` test is historical: 255 itself takes the long path but the
/// loop never fires, so it still comes out as the single byte `[255]`.
pub fn num2bytes(mut value: i128) -> Vec<u8> {
    if value < 255 {
        return vec![(value & 0xFF) as u8];
    }
    let mut bytes = Vec::new();
    while value > 255 {
        bytes.push((value & 0xFF) as u8);
        value >>= 8;
    }
    bytes.push(value as u8);
    bytes
}

/// `lN` / `LN` line references.
fn line_ref(word: &str) -> Option<usize> {
    let rest = word.strip_prefix('l').or_else(|| word.strip_prefix('L'))?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

fn starts_alpha(name: &str) -> bool {
    name.chars().next().map_or(false, |c| c.is_ascii_alphabetic())
}

// ---------------------------------------------------------------------
// statements

#[derive(Debug, Clone)]
enum Operand {
    Num(i128),
    LineRef(usize),
    Ptr { name: String, extra: u16 },
    Sym(String),
}

#[derive(Debug)]
enum DataDecl {
    /// `<name>`: one zero byte at the data cursor.
    Var { name: String },
    /// `<name> = v1 v2 ..`: initialised bytes at the data cursor.
    Init { name: String, bytes: Vec<u8> },
    /// `<addr> <name> [= ..]`: named token at an absolute address.
    Pinned { addr: u16, name: String, bytes: Vec<u8> },
    /// `<addr1> <addr2> <name> [= ..]`: named token filling an inclusive
    /// range, zero-padded.
    Range { first: u16, name: String, bytes: Vec<u8> },
    /// `<addr> <value>`: raw bytes at an absolute address, nameless.
    Bytes { addr: u16, bytes: Vec<u8> },
}

#[derive(Debug)]
enum Stmt {
    Blank,
    Label(String),
    Data(DataDecl),
    Code { op: Opcode, operand: Option<Operand> },
}

struct SourceLine {
    /// 1-based source line number.
    no: usize,
    stmt: Stmt,
    marker: Option<String>,
}

impl SourceLine {
    fn emit_size(&self) -> u16 {
        match &self.stmt {
            Stmt::Code { op, .. } => op.size(),
            _ => 0,
        }
    }
}

fn mask(addr: i128) -> u16 {
    (addr & (RAM_SIZE as i128 - 1)) as u16
}

/// Collect `= v1 v2 ..` initialiser bytes from `toks[at..]`.
fn data_values(line: usize, toks: &[Tok], at: usize) -> Result<Vec<u8>, AsmError> {
    match toks.get(at) {
        Some(Tok::Word(w)) if w == "=" => {}
        Some(other) => {
            return Err(syntax(line, format!("expected '=' before <{}>", other.describe())))
        }
        None => return Err(syntax(line, "expected '='")),
    }
    if toks.len() == at + 1 {
        return Err(syntax(line, "expected data after '='"));
    }
    let mut bytes = Vec::new();
    for tok in &toks[at + 1..] {
        let value = number(tok).ok_or_else(|| AsmError::Declaration {
            line,
            msg: format!("invalid initialization <{}>", tok.describe()),
        })?;
        bytes.extend(num2bytes(value));
    }
    Ok(bytes)
}

fn classify_data(line: usize, toks: &[Tok]) -> Result<Stmt, AsmError> {
    let decl_err = |name: &str| AsmError::Declaration {
        line,
        msg: format!("invalid declaration <{}>", name),
    };

    if let Some(addr) = number(&toks[0]) {
        let addr = mask(addr);
        let second = toks.get(1).ok_or_else(|| {
            syntax(line, format!("unexpected <{}>", toks[0].describe()))
        })?;

        if let Some(value) = number(second) {
            if toks.len() == 2 {
                return Ok(Stmt::Data(DataDecl::Bytes { addr, bytes: num2bytes(value) }));
            }
            // range declaration: <addr1> <addr2> <name> [= ..]
            let last = mask(value);
            let name = match toks.get(2) {
                Some(Tok::Word(w)) if starts_alpha(w) => w.clone(),
                Some(other) => return Err(decl_err(&other.describe())),
                None => return Err(decl_err(&toks[0].describe())),
            };
            if last < addr {
                return Err(AsmError::Declaration {
                    line,
                    msg: format!("invalid range {}..{}", addr, last),
                });
            }
            let span = (last - addr + 1) as usize;
            let mut bytes = if toks.len() > 3 {
                data_values(line, toks, 3)?
            } else {
                Vec::new()
            };
            if bytes.len() > span {
                return Err(AsmError::Declaration {
                    line,
                    msg: format!("initializer longer than range {}..{}", addr, last),
                });
            }
            bytes.resize(span, 0);
            return Ok(Stmt::Data(DataDecl::Range { first: addr, name, bytes }));
        }

        // named token at an absolute address
        let name = match second {
            Tok::Word(w) if starts_alpha(w) => w.clone(),
            other => return Err(decl_err(&other.describe())),
        };
        let bytes = if toks.len() == 2 {
            vec![0]
        } else {
            data_values(line, toks, 2)?
        };
        return Ok(Stmt::Data(DataDecl::Pinned { addr, name, bytes }));
    }

    let name = match &toks[0] {
        Tok::Word(w) if starts_alpha(w) => w.clone(),
        other => return Err(decl_err(&other.describe())),
    };
    if toks.len() == 1 {
        return Ok(Stmt::Data(DataDecl::Var { name }));
    }
    let bytes = data_values(line, toks, 1)?;
    Ok(Stmt::Data(DataDecl::Init { name, bytes }))
}

fn classify_code(line: usize, toks: &[Tok]) -> Result<Stmt, AsmError> {
    let mnemonic = match &toks[0] {
        Tok::Word(w) => w.clone(),
        other => return Err(syntax(line, format!("unknown operation <{}>", other.describe()))),
    };
    let op = Opcode::from_str(&mnemonic)
        .map_err(|_| syntax(line, format!("unknown operation <{}>", mnemonic)))?;

    let wants_operand = op.class() != OpClass::Nullary;
    if toks.len() != 1 + wants_operand as usize {
        return Err(AsmError::OpcodeArity { line, op: mnemonic });
    }
    if !wants_operand {
        return Ok(Stmt::Code { op, operand: None });
    }

    let arg = &toks[1];
    let operand = if let Some(value) = number(arg) {
        Operand::Num(value)
    } else {
        match arg {
            Tok::Pointer { name, extra } => Operand::Ptr { name: name.clone(), extra: *extra },
            Tok::Word(w) => match line_ref(w) {
                Some(n) => Operand::LineRef(n),
                None => Operand::Sym(w.clone()),
            },
            other => {
                return Err(syntax(line, format!("invalid operand <{}>", other.describe())))
            }
        }
    };

    if op.class() == OpClass::Immediate {
        match operand {
            Operand::Num(_) => {}
            _ => {
                return Err(syntax(
                    line,
                    format!("<{}> takes a numeric operand", mnemonic),
                ))
            }
        }
    }
    Ok(Stmt::Code { op, operand: Some(operand) })
}

fn classify(source: &str) -> Result<Vec<SourceLine>, AsmError> {
    let mut lines = Vec::new();
    let mut in_data = true;

    for (idx, text) in source.lines().enumerate() {
        let no = idx + 1;
        let mut toks = lex_line(no, text)?;

        // peel off at most one *name marker, wherever it sits
        let mut marker = None;
        let mut kept = Vec::with_capacity(toks.len());
        for tok in toks.drain(..) {
            if let Tok::Marker(name) = tok {
                if marker.replace(name).is_some() {
                    return Err(AsmError::Reference {
                        line: no,
                        name: "multiple markers".into(),
                    });
                }
            } else {
                kept.push(tok);
            }
        }
        toks = kept;

        let stmt = if toks.is_empty() {
            Stmt::Blank
        } else if let Tok::Word(first) = &toks[0] {
            if first.len() > 1 && first.ends_with(':') {
                let name = first.trim_matches(':').to_string();
                if !starts_alpha(&name) {
                    return Err(AsmError::Declaration {
                        line: no,
                        msg: format!("invalid declaration <{}>", first),
                    });
                }
                if toks.len() > 1 {
                    return Err(syntax(no, "label must end its line"));
                }
                in_data = false;
                Stmt::Label(name)
            } else if in_data {
                classify_data(no, &toks)?
            } else {
                classify_code(no, &toks)?
            }
        } else if in_data {
            classify_data(no, &toks)?
        } else {
            classify_code(no, &toks)?
        };

        lines.push(SourceLine { no, stmt, marker });
    }
    Ok(lines)
}

// ---------------------------------------------------------------------
// layout

struct Layout {
    line_addr: Vec<Option<u16>>,
    /// `*name` marker targets.
    refs: BTreeMap<String, u16>,
    /// Function base addresses.
    funcs: BTreeMap<String, u16>,
    /// Data cursor after layout: next free address, moving down.
    cursor: i32,
}

fn unable_to_fit(line: usize) -> AsmError {
    AsmError::Layout { line, msg: "program unable to fit in memory".into() }
}

/// Lay a collected non-`start` function out against the data cursor: it
/// ends where the cursor stood and its body runs forward from there.
fn close_func(
    label: usize,
    body: &[usize],
    cursor: &mut i32,
    line_addr: &mut [Option<u16>],
    funcs: &mut BTreeMap<String, u16>,
    lines: &[SourceLine],
) -> Result<(), AsmError> {
    let total: i32 = body.iter().map(|&i| lines[i].emit_size() as i32).sum();
    let base = *cursor - total + 1;
    if base < 1 {
        return Err(unable_to_fit(lines[label].no));
    }
    line_addr[label] = Some(base as u16);
    let mut addr = base;
    for &i in body {
        line_addr[i] = Some(addr as u16);
        addr += lines[i].emit_size() as i32;
    }
    *cursor = base - 1;
    if let Stmt::Label(name) = &lines[label].stmt {
        funcs.insert(name.clone(), base as u16);
    }
    Ok(())
}

fn layout(lines: &[SourceLine]) -> Result<Layout, AsmError> {
    let mut line_addr: Vec<Option<u16>> = vec![None; lines.len()];
    let mut funcs = BTreeMap::new();
    let mut cursor: i32 = RAM_SIZE as i32 - 1;

    enum Section {
        Data,
        Start { code_cursor: u16 },
        /// label line index plus pending body lines
        Func { label: usize, body: Vec<usize> },
    }
    let mut section = Section::Data;

    for (idx, line) in lines.iter().enumerate() {
        match &line.stmt {
            Stmt::Blank => {}
            Stmt::Label(name) => {
                if let Section::Func { label, body } = &section {
                    close_func(*label, body, &mut cursor, &mut line_addr, &mut funcs, lines)?;
                }
                if name == "start" {
                    if funcs.insert(name.clone(), 0).is_some() {
                        return Err(AsmError::Declaration {
                            line: line.no,
                            msg: "invalid declaration <start>".into(),
                        });
                    }
                    line_addr[idx] = Some(0);
                    section = Section::Start { code_cursor: 0 };
                } else {
                    section = Section::Func { label: idx, body: Vec::new() };
                }
            }
            Stmt::Data(decl) => {
                match decl {
                    DataDecl::Var { .. } => {
                        line_addr[idx] = Some(cursor as u16);
                        cursor -= 1;
                    }
                    DataDecl::Init { bytes, .. } => {
                        let base = cursor - bytes.len() as i32 + 1;
                        if base < 1 {
                            return Err(unable_to_fit(line.no));
                        }
                        line_addr[idx] = Some(base as u16);
                        cursor = base - 1;
                    }
                    DataDecl::Pinned { addr, .. }
                    | DataDecl::Range { first: addr, .. }
                    | DataDecl::Bytes { addr, .. } => {
                        line_addr[idx] = Some(*addr);
                    }
                }
                if cursor < 1 {
                    return Err(unable_to_fit(line.no));
                }
            }
            Stmt::Code { .. } => match &mut section {
                Section::Start { code_cursor } => {
                    line_addr[idx] = Some(*code_cursor);
                    *code_cursor += line.emit_size();
                }
                Section::Func { body, .. } => body.push(idx),
                Section::Data => unreachable!("classifier keeps code behind a label"),
            },
        }
    }
    if let Section::Func { label, body } = &section {
        close_func(*label, body, &mut cursor, &mut line_addr, &mut funcs, lines)?;
    }

    // markers resolve to the address of the line that carries them
    let mut refs = BTreeMap::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(name) = &line.marker {
            match line_addr[idx] {
                Some(addr) => {
                    refs.insert(name.clone(), addr);
                }
                None => {
                    return Err(AsmError::Reference { line: line.no, name: name.clone() })
                }
            }
        }
    }

    Ok(Layout { line_addr, refs, funcs, cursor })
}

// ---------------------------------------------------------------------
// emission

struct Emitter {
    ram: Vec<u8>,
    tokens: Vec<Token>,
    symbols: BTreeMap<String, u16>,
    refs: BTreeMap<String, u16>,
    line_addr: Vec<Option<u16>>,
    /// auto-created variables continue down from the layout cursor
    cursor: i32,
    /// lowest base among cursor-allocated tokens and functions
    floor: u16,
    size: usize,
    ends: bool,
}

impl Emitter {
    fn write(&mut self, addr: u16, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.ram[(addr as usize + i) & (RAM_SIZE - 1)] = *byte;
        }
        self.size += bytes.len();
    }

    fn token(&mut self, name: &str, addr: u16, bytes: Vec<u8>) {
        self.symbols.insert(name.to_string(), addr);
        self.tokens.push(Token { name: name.to_string(), addr, bytes });
    }

    fn auto_create(&mut self, line: usize, name: &str, current_fn: &str) -> Result<u16, AsmError> {
        if name == current_fn {
            return Err(AsmError::Declaration {
                line,
                msg: format!("invalid declaration <{}>", name),
            });
        }
        if self.cursor < 1 {
            return Err(unable_to_fit(line));
        }
        let addr = self.cursor as u16;
        self.cursor -= 1;
        self.floor = self.floor.min(addr);
        self.token(name, addr, vec![0]);
        self.size += 1;
        Ok(addr)
    }

    fn resolve(&mut self, line: usize, operand: &Operand, current_fn: &str) -> Result<u16, AsmError> {
        match operand {
            Operand::Num(value) => Ok(mask(*value)),
            Operand::LineRef(n) => (*n)
                .checked_sub(1)
                .and_then(|i| self.line_addr.get(i).copied().flatten())
                .ok_or_else(|| AsmError::Reference { line, name: format!("l{}", n) }),
            Operand::Ptr { name, extra } => match self.refs.get(name) {
                Some(addr) => Ok(mask(*addr as i128 + *extra as i128)),
                None => Err(AsmError::Reference { line, name: name.clone() }),
            },
            Operand::Sym(name) => match self.symbols.get(name) {
                Some(addr) => Ok(*addr),
                None => self.auto_create(line, name, current_fn),
            },
        }
    }
}

pub fn assemble(source: &str) -> Result<Program, AsmError> {
    let lines = classify(source)?;
    let layout = layout(&lines)?;

    let mut em = Emitter {
        ram: vec![0; RAM_SIZE],
        tokens: Vec::new(),
        symbols: BTreeMap::new(),
        refs: layout.refs,
        line_addr: layout.line_addr,
        cursor: layout.cursor,
        floor: (RAM_SIZE - 1) as u16,
        size: 0,
        ends: false,
    };

    // data tokens first; they are all declared before any code
    for (idx, line) in lines.iter().enumerate() {
        let addr = em.line_addr[idx];
        if let Stmt::Data(decl) = &line.stmt {
            let addr = addr.unwrap();
            match decl {
                DataDecl::Var { name } => {
                    em.floor = em.floor.min(addr);
                    em.write(addr, &[0]);
                    em.token(name, addr, vec![0]);
                }
                DataDecl::Init { name, bytes } => {
                    em.floor = em.floor.min(addr);
                    em.write(addr, bytes);
                    em.token(name, addr, bytes.clone());
                }
                DataDecl::Pinned { name, bytes, .. } | DataDecl::Range { name, bytes, .. } => {
                    em.write(addr, bytes);
                    em.token(name, addr, bytes.clone());
                }
                DataDecl::Bytes { bytes, .. } => {
                    em.write(addr, bytes);
                }
            }
        }
    }

    // functions become visible before their bodies are walked, so
    // forward references resolve
    for (name, base) in &layout.funcs {
        em.symbols.insert(name.clone(), *base);
    }

    struct FnBuild {
        name: String,
        base: u16,
        bytes: Vec<u8>,
    }
    let mut builds: Vec<FnBuild> = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        match &line.stmt {
            Stmt::Label(name) => {
                builds.push(FnBuild {
                    name: name.clone(),
                    base: em.line_addr[idx].unwrap(),
                    bytes: Vec::new(),
                });
            }
            Stmt::Code { op, operand } => {
                let current = builds.last().unwrap().name.clone();
                let mut encoded = vec![*op as u8];
                match (op.class(), operand) {
                    (OpClass::Addressed, Some(operand)) => {
                        let addr = em.resolve(line.no, operand, &current)?;
                        encoded[0] |= (addr >> 8) as u8;
                        encoded.push(addr as u8);
                    }
                    (OpClass::Immediate, Some(Operand::Num(value))) => {
                        encoded.push((*value & 0xFF) as u8);
                    }
                    (OpClass::Nullary, None) => {}
                    _ => unreachable!("classifier checked operand shapes"),
                }
                em.ends |= op.halts();
                builds.last_mut().unwrap().bytes.extend(encoded);
            }
            _ => {}
        }
    }

    // write bodies, start last so its code owns the low addresses
    let mut start_len = 0usize;
    builds.sort_by_key(|b| b.name == "start");
    for build in builds {
        if build.name == "start" {
            start_len = build.bytes.len();
        } else {
            em.floor = em.floor.min(build.base);
        }
        em.write(build.base, &build.bytes);
        em.token(&build.name, build.base, build.bytes);
    }

    if start_len > em.floor as usize {
        return Err(AsmError::Layout {
            line: 0,
            msg: "too many variable or declared function after start".into(),
        });
    }

    Ok(Program {
        ram: em.ram,
        tokens: em.tokens,
        line_addr: em.line_addr,
        size: em.size,
        ends: em.ends,
    })
}
