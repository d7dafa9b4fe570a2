//! In-memory stand-in for the compiled engine, used by unit tests.
//!
//! It keeps a flat byte array as "linear memory", a bump allocator that
//! tracks every live block, a shared error slot, and a very small filter
//! evaluator (paths, `[]`, `|`, and `. op number`). Freeing an unknown or
//! already freed address panics.

use std::collections::HashMap;

use serde_json::Value;

use crate::abi::{EngineAbi, MemoryAddress};
use crate::error::RuntimeError;

const MEMORY_SIZE: usize = 1 << 20;
const VERSION_AT: u32 = 16;
const ERROR_AT: u32 = 256;
const ERROR_CAPACITY: usize = 4096;
const HEAP_START: u32 = 8192;

pub(crate) struct FakeEngine {
    memory: Vec<u8>,
    next_free: u32,
    live: HashMap<u32, u32>,
    has_error: bool,
    fail_silently: bool,
    fail_next_write: bool,
    exec_calls: u64,
    free_result_calls: u64,
}

impl FakeEngine {
    pub fn new() -> Self {
        let mut engine = Self {
            memory: vec![0; MEMORY_SIZE],
            next_free: HEAP_START,
            live: HashMap::new(),
            has_error: false,
            fail_silently: false,
            fail_next_write: false,
            exec_calls: 0,
            free_result_calls: 0,
        };
        engine.set_version_bytes(b"jq-wasm 1.0.0\0");
        engine
    }

    pub fn set_version_bytes(&mut self, bytes: &[u8]) {
        let at = VERSION_AT as usize;
        self.memory[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Make the next exec return null without touching the error slot.
    pub fn fail_silently_next(&mut self) {
        self.fail_silently = true;
    }

    /// Make the next host write into memory fail.
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    pub fn exec_calls(&self) -> u64 {
        self.exec_calls
    }

    pub fn free_result_calls(&self) -> u64 {
        self.free_result_calls
    }

    fn read_str(&self, addr: MemoryAddress) -> String {
        String::from_utf8(self.read_c_string(addr).expect("readable string"))
            .expect("utf-8 input")
    }

    fn clear_error(&mut self) {
        self.has_error = false;
        self.memory[ERROR_AT as usize] = 0;
    }

    fn set_error(&mut self, message: &str) {
        let bytes = message.as_bytes();
        let len = bytes.len().min(ERROR_CAPACITY - 1);
        let at = ERROR_AT as usize;
        self.memory[at..at + len].copy_from_slice(&bytes[..len]);
        self.memory[at + len] = 0;
        self.has_error = true;
    }

    fn allocate_result(&mut self, text: &str) -> Result<i32, RuntimeError> {
        let addr = self.alloc(text.len() as u32 + 1)?;
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.write_bytes(addr, &bytes)?;
        Ok(addr.as_raw())
    }

    fn run(
        &mut self,
        input: MemoryAddress,
        filter: MemoryAddress,
        always_array: bool,
    ) -> Result<i32, RuntimeError> {
        self.exec_calls += 1;
        self.clear_error();
        if std::mem::take(&mut self.fail_silently) {
            return Ok(0);
        }

        let filter = self.read_str(filter);
        let input = self.read_str(input);
        let outputs = compile(&filter).and_then(|stages| {
            let value: Value = serde_json::from_str(&input)
                .map_err(|e| format!("Invalid JSON input: {e}"))?;
            evaluate(&stages, value)
        });

        match outputs {
            Ok(outputs) => {
                let text = match (always_array, outputs.len()) {
                    (false, 0) => "null".to_string(),
                    (false, 1) => outputs[0].to_string(),
                    _ => Value::Array(outputs).to_string(),
                };
                self.allocate_result(&text)
            }
            Err(message) => {
                self.set_error(&message);
                Ok(0)
            }
        }
    }
}

impl EngineAbi for FakeEngine {
    fn alloc(&mut self, len: u32) -> Result<MemoryAddress, RuntimeError> {
        let addr = self.next_free;
        let end = addr as usize + len as usize;
        if end > self.memory.len() {
            return Err(RuntimeError::OutOfMemory { requested: len });
        }
        self.next_free = ((end + 7) & !7) as u32;
        self.live.insert(addr, len);
        Ok(MemoryAddress::from_raw(addr as i32).expect("heap is above zero"))
    }

    fn dealloc(&mut self, addr: MemoryAddress) -> Result<(), RuntimeError> {
        assert!(
            self.live.remove(&addr.offset()).is_some(),
            "double free or foreign pointer {addr:?}"
        );
        Ok(())
    }

    fn write_bytes(&mut self, addr: MemoryAddress, bytes: &[u8]) -> Result<(), RuntimeError> {
        if std::mem::take(&mut self.fail_next_write) {
            return Err(RuntimeError::OutOfBounds {
                address: addr.offset(),
                reason: "write rejected".into(),
            });
        }
        let at = addr.offset() as usize;
        self.memory
            .get_mut(at..at + bytes.len())
            .ok_or(RuntimeError::OutOfBounds {
                address: addr.offset(),
                reason: "write past end of memory".into(),
            })?
            .copy_from_slice(bytes);
        Ok(())
    }

    fn read_c_string(&self, addr: MemoryAddress) -> Result<Vec<u8>, RuntimeError> {
        let tail = self
            .memory
            .get(addr.offset() as usize..)
            .ok_or(RuntimeError::OutOfBounds {
                address: addr.offset(),
                reason: "past end of memory".into(),
            })?;
        let len = tail.iter().position(|&b| b == 0).ok_or(RuntimeError::OutOfBounds {
            address: addr.offset(),
            reason: "unterminated string".into(),
        })?;
        Ok(tail[..len].to_vec())
    }

    fn exec(&mut self, input: MemoryAddress, filter: MemoryAddress) -> Result<i32, RuntimeError> {
        self.run(input, filter, false)
    }

    fn exec_all(
        &mut self,
        input: MemoryAddress,
        filter: MemoryAddress,
    ) -> Result<i32, RuntimeError> {
        self.run(input, filter, true)
    }

    fn get_error(&mut self) -> Result<i32, RuntimeError> {
        Ok(ERROR_AT as i32)
    }

    fn free_result(&mut self, addr: MemoryAddress) -> Result<(), RuntimeError> {
        self.free_result_calls += 1;
        self.dealloc(addr)
    }

    fn has_error(&mut self) -> Result<i32, RuntimeError> {
        Ok(i32::from(self.has_error))
    }

    fn validate_filter(&mut self, filter: MemoryAddress) -> Result<i32, RuntimeError> {
        self.clear_error();
        match compile(&self.read_str(filter)) {
            Ok(_) => Ok(1),
            Err(message) => {
                self.set_error(&message);
                Ok(0)
            }
        }
    }

    fn validate_json(&mut self, json: MemoryAddress) -> Result<i32, RuntimeError> {
        self.clear_error();
        match serde_json::from_str::<Value>(&self.read_str(json)) {
            Ok(_) => Ok(1),
            Err(e) => {
                self.set_error(&format!("Invalid JSON: {e}"));
                Ok(0)
            }
        }
    }

    fn version(&mut self) -> Result<i32, RuntimeError> {
        Ok(VERSION_AT as i32)
    }
}

enum Step {
    Field(String),
    Iterate,
}

enum Stage {
    Path(Vec<Step>),
    Arith { path: Vec<Step>, op: char, rhs: f64 },
}

fn compile(filter: &str) -> Result<Vec<Stage>, String> {
    filter.split('|').map(compile_stage).collect()
}

fn compile_stage(stage: &str) -> Result<Stage, String> {
    let tokens: Vec<&str> = stage.split_whitespace().collect();
    match tokens.as_slice() {
        [path] => Ok(Stage::Path(compile_path(path)?)),
        [path, op, rhs] if matches!(*op, "+" | "-" | "*") => {
            let rhs = rhs
                .parse::<f64>()
                .map_err(|_| format!("syntax error, unexpected '{rhs}'"))?;
            Ok(Stage::Arith {
                path: compile_path(path)?,
                op: op.chars().next().unwrap_or('+'),
                rhs,
            })
        }
        [] | [_, _] => Err("syntax error, unexpected end of file".into()),
        _ => Err(format!("syntax error, unexpected '{}'", stage.trim())),
    }
}

fn compile_path(text: &str) -> Result<Vec<Step>, String> {
    if !text.starts_with('.') {
        return Err(format!("syntax error, unexpected '{text}'"));
    }
    let mut steps = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("[]") {
            steps.push(Step::Iterate);
            rest = r;
        } else if let Some(r) = rest.strip_prefix('.') {
            let end = r
                .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                .unwrap_or(r.len());
            if end > 0 {
                steps.push(Step::Field(r[..end].to_string()));
            }
            rest = &r[end..];
        } else {
            return Err(format!("syntax error, unexpected '{rest}'"));
        }
    }
    Ok(steps)
}

fn evaluate(stages: &[Stage], input: Value) -> Result<Vec<Value>, String> {
    let mut values = vec![input];
    for stage in stages {
        let mut next = Vec::new();
        for value in values {
            match stage {
                Stage::Path(steps) => next.extend(walk(steps, value)?),
                Stage::Arith { path, op, rhs } => {
                    for v in walk(path, value)? {
                        next.push(arith(&v, *op, *rhs)?);
                    }
                }
            }
        }
        values = next;
    }
    Ok(values)
}

fn walk(steps: &[Step], value: Value) -> Result<Vec<Value>, String> {
    let mut values = vec![value];
    for step in steps {
        let mut next = Vec::new();
        for value in values {
            match (step, value) {
                (Step::Field(key), Value::Object(mut map)) => {
                    next.push(map.remove(key).unwrap_or(Value::Null))
                }
                (Step::Field(_), Value::Null) => next.push(Value::Null),
                (Step::Field(key), other) => {
                    return Err(format!("Cannot index {} with \"{key}\"", kind(&other)));
                }
                (Step::Iterate, Value::Array(items)) => next.extend(items),
                (Step::Iterate, Value::Object(map)) => next.extend(map.into_iter().map(|(_, v)| v)),
                (Step::Iterate, other) => {
                    return Err(format!("Cannot iterate over {}", kind(&other)));
                }
            }
        }
        values = next;
    }
    Ok(values)
}

fn arith(value: &Value, op: char, rhs: f64) -> Result<Value, String> {
    let lhs = value
        .as_f64()
        .ok_or_else(|| format!("{} and number cannot be combined", kind(value)))?;
    let result = match op {
        '+' => lhs + rhs,
        '-' => lhs - rhs,
        _ => lhs * rhs,
    };
    if result.fract() == 0.0 && result.abs() < 9.0e15 {
        Ok(Value::from(result as i64))
    } else {
        Ok(Value::from(result))
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
