//! Bytecode units and their serialized container format.
//!
//! A [`Chunk`] is what the external compiler hands the engine: an
//! instruction list, a constant pool, and the two name-index lists the
//! closure-capture machinery consumes (the names a body references, and the
//! names it assigns anywhere). Compiled chunks travel between processes
//! as `.plbc` files: a four-byte magic, a version, then the serde payload.

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

const MAGIC: [u8; 4] = *b"PLBC";
pub const CURRENT_VERSION: u16 = 1;

/// One VM instruction. Jump displacements are relative to the instruction
/// *after* the jump, so the interpreter only ever adds them to an already
/// advanced instruction pointer. Short-circuit `and`/`or` are a compiler
/// concern: `Dup` then `JumpIfFalse`/`JumpIfTrue` over a `Pop` and the
/// right-hand side keeps the left operand as the result when it decides.
/// The eager `And`/`Or` ops remain for operands that are already on the
/// stack.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Push a scalar constant (number, boolean or nil).
    Constant(u16),
    Nil,
    Pop,
    /// Duplicate the value on top of the evaluation stack.
    Dup,
    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
    Equal,
    And,
    Or,
    /// Resolve a variable by name (constant index of a string).
    LoadVariable(u16),
    SetVariable(u16),
    GetAttribute(u16),
    SetAttribute(u16),
    /// `obj[key]`: sugar for calling the object's own `@get_key`.
    AccessKey,
    /// `obj[key] = value`: sugar for `@set_key`.
    SetKey,
    /// Intern the string constant at the index and push the string object.
    MakeString(u16),
    /// Pop `n` key/value pairs and build a table object.
    MakeTable(u16),
    /// Build a closure over the code constant at the index.
    MakeFunction(u16),
    /// Build a class from the code constant; pops the superclass (or nil)
    /// and runs the body with the class as attribute target.
    MakeClass(u16),
    /// Import the module named by the string constant at the index.
    Import(u16),
    Call(u8),
    Jump(i16),
    /// Pop the tested value; jump when it is falsy.
    JumpIfFalse(i16),
    /// Pop the tested value; jump when it is truthy.
    JumpIfTrue(i16),
    Return,
}

/// Compile-time constants. Strings and nested code units only reach the
/// runtime `Value` space through `MakeString`/`MakeFunction`, which turn
/// them into heap objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Number(f64),
    Bool(bool),
    Nil,
    String(Rc<str>),
    Code(Rc<Chunk>),
}

impl Constant {
    pub fn type_name(&self) -> &'static str {
        match self {
            Constant::Number(_) => "number",
            Constant::Bool(_) => "boolean",
            Constant::Nil => "nil",
            Constant::String(_) => "string",
            Constant::Code(_) => "code",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub ops: Vec<Op>,
    pub constants: Vec<Constant>,
    /// Parameter names, in order, when this chunk is a function body.
    #[serde(default)]
    pub params: Vec<Rc<str>>,
    /// Constant indices of every name this chunk reads as a variable.
    #[serde(default)]
    pub referenced_names: Vec<u16>,
    /// Constant indices of every name this chunk assigns anywhere, used for
    /// pre-declaration cells during closure capture.
    #[serde(default)]
    pub assigned_names: Vec<u16>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk::default()
    }

    /// Insert a constant, reusing an existing equal entry.
    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        if let Some(index) = self.constants.iter().position(|c| *c == constant) {
            return index as u16;
        }
        let index = self.constants.len();
        assert!(index <= u16::MAX as usize, "constant pool overflow");
        self.constants.push(constant);
        index as u16
    }

    pub fn constant(&self, index: u16) -> &Constant {
        match self.constants.get(index as usize) {
            Some(constant) => constant,
            None => panic!("constant index {index} out of range"),
        }
    }

    /// The string constant at `index`, for name operands.
    pub fn name_at(&self, index: u16) -> &Rc<str> {
        match self.constant(index) {
            Constant::String(s) => s,
            other => panic!("name operand {} is a {}", index, other.type_name()),
        }
    }

    pub fn assigns_name(&self, name: &str) -> bool {
        self.assigned_names
            .iter()
            .any(|&idx| &**self.name_at(idx) == name)
    }
}

/// Optional provenance metadata carried inside a `.plbc` unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitMeta {
    pub source: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl UnitMeta {
    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.tags.is_empty()
    }
}

/// A complete compiled program: the entry chunk plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramUnit {
    pub version: u16,
    pub meta: Option<UnitMeta>,
    pub entry: Rc<Chunk>,
}

impl ProgramUnit {
    pub fn new(entry: Chunk) -> ProgramUnit {
        ProgramUnit {
            version: CURRENT_VERSION,
            meta: None,
            entry: Rc::new(entry),
        }
    }
}

pub fn encode_unit(unit: &ProgramUnit) -> Result<Vec<u8>> {
    check_constants_encodable(&unit.entry)?;
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&unit.version.to_le_bytes());
    let payload = serde_json::to_vec(unit).context("serializing program unit")?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// The serialized payload cannot represent NaN or infinity, so a unit
/// containing one would encode fine and fail to decode. Reject it up front.
fn check_constants_encodable(chunk: &Chunk) -> Result<()> {
    for constant in &chunk.constants {
        match constant {
            Constant::Number(n) => {
                ensure!(n.is_finite(), "cannot encode non-finite number constant {n}");
            }
            Constant::Code(code) => check_constants_encodable(code)?,
            _ => {}
        }
    }
    Ok(())
}

pub fn decode_unit(bytes: &[u8]) -> Result<ProgramUnit> {
    ensure!(bytes.len() >= 6, "program unit too small");
    ensure!(bytes[..4] == MAGIC, "invalid PLBC magic");
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    ensure!(
        version <= CURRENT_VERSION,
        "unsupported PLBC version {} (reader supports <= {})",
        version,
        CURRENT_VERSION
    );
    let unit: ProgramUnit =
        serde_json::from_slice(&bytes[6..]).context("deserializing program unit")?;
    ensure!(unit.version == version, "header/payload version mismatch");
    Ok(unit)
}
