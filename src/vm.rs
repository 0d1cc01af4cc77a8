// (C) 2020 Brandon Lewis
//
// A virtual machine for compiled scoring expressions.
//
// This system is optimized for short-running programs that produce a
// single value per evaluation, inside a hot ranking loop.
//
// *Execution Model*
//
// A program consists of a sequence of instructions and a constant pool
// (the stash). Evaluation runs the instructions in order against a
// caller-supplied parameter vector and leaves exactly one value on the
// operand stack, which is the result.
//
// Control flow is limited to forward skips: the compiler lowers
// conditionals and set membership to relative offsets, so programs
// always terminate in at most code.len() steps. There are no calls, no
// loops, and no suspension points.
//
// *Values*
//
// - double, string hash, tensor handle, error.
//
// Values are cheap to clone: scalars and hashes are inline, tensors
// are shared handles. The operand stack owns the temporaries of the
// current evaluation; the stash owns the constants of the compiled
// function. Both retain capacity across evaluations.
//
// *Errors*
//
// Runtime errors are values. Every operator is total: applied to
// operands outside its table it produces Error, and any operation on
// an Error operand produces Error, so a single failure propagates to
// the final result. A program that terminates with a stack depth other
// than one also produces Error.
//
// Violated preconditions (wrong parameter count, stack underflow, a
// skip landing outside the program) are bugs in the compiler or the
// embedding, not in user expressions, and they panic.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{BinOp, Expr, UnOp};
use crate::tensor::{Aggr, Tensor, TensorEngine};


// The in-memory opcode format.
//
// Immediates are typed and inline: pool and table indices are u32,
// skip offsets are i32 relative to the instruction after the skipping
// one (the driver advances pc before dispatch).
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Op {
    LoadConst(u32),
    LoadParam(u32),
    LoadLet(u32),
    Unary(UnOp),
    Binary(BinOp),
    Skip(i32),
    SkipIfFalse(i32),
    StoreLet,
    EvictLet,
    CheckMember(i32),
    NotMember,
    TensorSum,
    TensorSumDim(u32)
}


// All runtime values.
//
// Strings are collapsed to a numeric hash before they ever reach the
// VM; equality and set membership remain sound for non-colliding
// hashes. The derived PartialEq is structural (used by tests and the
// stash); the language's own equality lives in Value::equal, which
// never equates Error values.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Double(f64),
    Str(f64),
    Tensor(Arc<Tensor>),
    Error
}


// Scalar truth: strictly positive and finite.
fn truth(x: f64) -> bool {
    x > 0.0 && x.is_finite()
}

fn bool_value(b: bool) -> Value {
    Value::Double(if b { 1.0 } else { 0.0 })
}


// Tolerance of the ~ comparison: relative, with an absolute floor at
// magnitude one so values near zero still compare sanely.
const APPROX_TOLERANCE: f64 = 1e-6;

fn approx_eq(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() <= APPROX_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}


// FNV-1a 64, folded to the top 53 bits so the result is an exact,
// always finite f64. Collisions are not handled.
pub fn hash_str(s: &str) -> f64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        h ^= byte as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (h >> 11) as f64
}


// Factors out the boiler plate in operator method implementations.
//
// Two matchers: binary and unary. Each takes the method name and a
// list of <pattern> => <expr> arms covering the operands the operator
// is defined on. Anything not in the table comes back as Error:
// operators are total and never signal.
macro_rules! operator {
    // Template for a unary operator
    (un $name:ident { $( $p:pat => $e:expr ),+ } ) => {
        pub fn $name (&self) -> Value {
            use Value::*;
            match self {
                $($p => $e),+ ,
                _ => Error
            }
        }
    };

    // Template for a binary operator
    (bin $name:ident { $( $p:pat => $e:expr ),+ } ) => {
        pub fn $name (&self, other: &Value) -> Value {
            use Value::*;
            match (self, other) {
                $($p => $e),+ ,
                _ => Error
            }
        }
    };
}


impl Value {
    // The boolean projection used by conditionals and by and/or. Only
    // doubles have a truth value; everything else is false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Double(x) => truth(*x),
            _ => false
        }
    }

    // Equality as the language defines it: IEEE equality on doubles,
    // hash equality on strings, false across variants and on tensors.
    // Error is never equal to anything, itself included.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false
        }
    }

    // == and != apply across variants via equal, but still absorb
    // Error operands.
    pub fn eq(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Error, _) | (_, Value::Error) => Value::Error,
            _ => bool_value(self.equal(other))
        }
    }

    pub fn neq(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Error, _) | (_, Value::Error) => Value::Error,
            _ => bool_value(!self.equal(other))
        }
    }

    operator! { bin add { (Double(a), Double(b)) => Double(a + b) } }

    operator! { bin sub { (Double(a), Double(b)) => Double(a - b) } }

    operator! { bin mul { (Double(a), Double(b)) => Double(a * b) } }

    operator! { bin div { (Double(a), Double(b)) => Double(a / b) } }

    operator! { bin pow { (Double(a), Double(b)) => Double(a.powf(*b)) } }

    operator! { bin atan2 { (Double(a), Double(b)) => Double(a.atan2(*b)) } }

    // ldexp truncates the exponent the way the C library call does.
    operator! { bin ldexp { (Double(a), Double(b)) => Double(a * b.trunc().exp2()) } }

    operator! { bin fmod { (Double(a), Double(b)) => Double(a % b) } }

    operator! { bin min { (Double(a), Double(b)) => Double(a.min(*b)) } }

    operator! { bin max { (Double(a), Double(b)) => Double(a.max(*b)) } }

    // and/or are strict: both operands are already on the stack by the
    // time either runs. Short-circuiting exists at the instruction
    // level only, for conditionals and membership.
    operator! { bin and { (Double(a), Double(b)) => bool_value(truth(*a) && truth(*b)) } }

    operator! { bin or { (Double(a), Double(b)) => bool_value(truth(*a) || truth(*b)) } }

    operator! { bin lt { (Double(a), Double(b)) => bool_value(a < b) } }

    operator! { bin lte { (Double(a), Double(b)) => bool_value(a <= b) } }

    operator! { bin gt { (Double(a), Double(b)) => bool_value(a > b) } }

    operator! { bin gte { (Double(a), Double(b)) => bool_value(a >= b) } }

    operator! { bin approx { (Double(a), Double(b)) => bool_value(approx_eq(*a, *b)) } }

    operator! { un neg { Double(a) => Double(-a) } }

    operator! { un not { Double(a) => bool_value(!truth(*a)) } }

    operator! { un cos { Double(a) => Double(a.cos()) } }

    operator! { un sin { Double(a) => Double(a.sin()) } }

    operator! { un tan { Double(a) => Double(a.tan()) } }

    operator! { un cosh { Double(a) => Double(a.cosh()) } }

    operator! { un sinh { Double(a) => Double(a.sinh()) } }

    operator! { un tanh { Double(a) => Double(a.tanh()) } }

    operator! { un acos { Double(a) => Double(a.acos()) } }

    operator! { un asin { Double(a) => Double(a.asin()) } }

    operator! { un atan { Double(a) => Double(a.atan()) } }

    operator! { un exp { Double(a) => Double(a.exp()) } }

    operator! { un log { Double(a) => Double(a.ln()) } }

    operator! { un log10 { Double(a) => Double(a.log10()) } }

    operator! { un sqrt { Double(a) => Double(a.sqrt()) } }

    operator! { un ceil { Double(a) => Double(a.ceil()) } }

    operator! { un floor { Double(a) => Double(a.floor()) } }

    operator! { un fabs { Double(a) => Double(a.abs()) } }

    operator! { un is_nan { Double(a) => bool_value(a.is_nan()) } }

    operator! { un relu { Double(a) => Double(a.max(0.0)) } }
}


// The constant pool a compiled function owns. Values are appended
// during compilation and referenced by index from LoadConst
// immediates; identical constants share a slot.
#[derive(Clone, Debug)]
pub struct Stash {
    values: Vec<Value>,
    index: HashMap<String, u32>
}

impl Stash {
    pub fn new() -> Stash {
        Stash {
            values: Vec::new(),
            index: HashMap::new()
        }
    }

    // f64 has no Hash; identical values have identical debug text,
    // which is what the dedup is keyed on.
    pub fn put(&mut self, value: Value) -> u32 {
        let repr = format!("{:?}", value);
        if let Some(existing) = self.index.get(&repr) {
            return *existing;
        }
        let slot = self.values.len() as u32;
        self.index.insert(repr, slot);
        self.values.push(value);
        slot
    }

    pub fn get(&self, slot: u32) -> &Value {
        &self.values[slot as usize]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.index.clear();
    }
}


// Per-evaluation execution state. Construct once per worker and reuse:
// the stacks keep their capacity across evaluations. A Context must
// not be shared between threads, and the reference returned by eval is
// valid until the next eval on the same Context.
pub struct Context {
    pub params: Vec<Value>,
    stack: Vec<Value>,
    lets: Vec<Value>,
    pc: usize,
    if_cnt: usize,
    eq_cnt: usize
}

impl Context {
    pub fn new() -> Context {
        Context {
            params: Vec::new(),
            stack: Vec::new(),
            lets: Vec::new(),
            pc: 0,
            if_cnt: 0,
            eq_cnt: 0
        }
    }

    // Conditional branches executed by the last evaluation.
    pub fn if_cnt(&self) -> usize {
        self.if_cnt
    }

    // Membership comparisons executed by the last evaluation.
    pub fn eq_cnt(&self) -> usize {
        self.eq_cnt
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.lets.clear();
        self.pc = 0;
        self.if_cnt = 0;
        self.eq_cnt = 0;
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn jump(&mut self, offset: i32, len: usize) {
        let target = self.pc as i64 + offset as i64;
        assert!(
            target >= 0 && target <= len as i64,
            "skip to {} outside the program",
            target
        );
        self.pc = target as usize;
    }
}


// A compiled scoring function: the instruction sequence, the constants
// it references, the interned dimension names for reductions, and the
// engine that materializes and reduces tensors. Immutable once built,
// and shareable across threads.
pub struct Function {
    pub(crate) code: Vec<Op>,
    pub(crate) stash: Stash,
    pub(crate) dims: Vec<String>,
    pub(crate) num_params: usize,
    pub(crate) engine: Arc<dyn TensorEngine>
}

impl Function {
    pub fn compile(
        engine: Arc<dyn TensorEngine>,
        root: &Expr,
        num_params: usize
    ) -> Function {
        crate::compile::compile(engine, root, num_params)
    }

    pub fn code(&self) -> &[Op] {
        &self.code
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    // Run the program to completion and return the result. The
    // reference stays valid until the next eval on the same Context.
    pub fn eval<'a>(&self, ctx: &'a mut Context) -> &'a Value {
        assert_eq!(
            ctx.params.len(),
            self.num_params,
            "parameter count mismatch"
        );
        ctx.reset();
        while ctx.pc < self.code.len() {
            let op = self.code[ctx.pc];
            ctx.pc += 1;
            trace!("{:?} {:?} {:?}", ctx.pc - 1, op, ctx.stack);
            self.dispatch(op, ctx);
        }
        if ctx.stack.len() != 1 {
            ctx.stack.push(Value::Error);
        }
        ctx.stack.last().expect("result on the stack")
    }

    fn dispatch(&self, op: Op, ctx: &mut Context) {
        match op {
            Op::LoadConst(slot) => {
                ctx.stack.push(self.stash.get(slot).clone());
            }
            Op::LoadParam(index) => {
                ctx.stack.push(ctx.params[index as usize].clone());
            }
            Op::LoadLet(offset) => {
                ctx.stack.push(ctx.lets[offset as usize].clone());
            }
            Op::Unary(op) => {
                let a = ctx.pop();
                ctx.stack.push(unary(op, &a));
            }
            Op::Binary(op) => {
                let b = ctx.pop();
                let a = ctx.pop();
                ctx.stack.push(self.binary(op, &a, &b));
            }
            Op::Skip(offset) => {
                ctx.jump(offset, self.code.len());
            }
            Op::SkipIfFalse(offset) => {
                ctx.if_cnt += 1;
                let cond = ctx.pop();
                if !cond.truthy() {
                    ctx.jump(offset, self.code.len());
                }
            }
            Op::StoreLet => {
                let value = ctx.pop();
                ctx.lets.push(value);
            }
            Op::EvictLet => {
                ctx.lets.pop().expect("let stack underflow");
            }
            Op::CheckMember(offset) => {
                ctx.eq_cnt += 1;
                let candidate = ctx.pop();
                let lhs = ctx.stack.last().expect("operand stack underflow");
                if lhs.equal(&candidate) {
                    ctx.pop();
                    ctx.stack.push(Value::Double(1.0));
                    ctx.jump(offset, self.code.len());
                }
            }
            Op::NotMember => {
                ctx.pop();
                ctx.stack.push(Value::Double(0.0));
            }
            Op::TensorSum => {
                let value = ctx.pop();
                ctx.stack.push(self.reduce(&value, None));
            }
            Op::TensorSumDim(dim) => {
                let value = ctx.pop();
                ctx.stack.push(self.reduce(&value, Some(dim)));
            }
        }
    }

    fn binary(&self, op: BinOp, a: &Value, b: &Value) -> Value {
        match op {
            BinOp::Add => a.add(b),
            BinOp::Sub => a.sub(b),
            // * doubles as the element-wise tensor match.
            BinOp::Mul => match (a, b) {
                (Value::Tensor(x), Value::Tensor(y)) => self.engine.multiply(x, y),
                _ => a.mul(b)
            },
            BinOp::Div => a.div(b),
            BinOp::Pow => a.pow(b),
            BinOp::Pow2 => a.pow(b),
            BinOp::Atan2 => a.atan2(b),
            BinOp::Ldexp => a.ldexp(b),
            BinOp::Fmod => a.fmod(b),
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
            BinOp::Eq => a.eq(b),
            BinOp::Neq => a.neq(b),
            BinOp::Approx => a.approx(b),
            BinOp::Lt => a.lt(b),
            BinOp::Lte => a.lte(b),
            BinOp::Gt => a.gt(b),
            BinOp::Gte => a.gte(b),
            BinOp::And => a.and(b),
            BinOp::Or => a.or(b)
        }
    }

    fn reduce(&self, value: &Value, dim: Option<u32>) -> Value {
        match value {
            Value::Tensor(tensor) => match dim {
                None => self.engine.reduce(tensor, Aggr::Sum, &[]),
                Some(slot) => {
                    let name = self.dims[slot as usize].as_str();
                    self.engine.reduce(tensor, Aggr::Sum, &[name])
                }
            },
            _ => Value::Error
        }
    }
}


fn unary(op: UnOp, a: &Value) -> Value {
    match op {
        UnOp::Neg => a.neg(),
        UnOp::Not => a.not(),
        UnOp::Cos => a.cos(),
        UnOp::Sin => a.sin(),
        UnOp::Tan => a.tan(),
        UnOp::Cosh => a.cosh(),
        UnOp::Sinh => a.sinh(),
        UnOp::Tanh => a.tanh(),
        UnOp::Acos => a.acos(),
        UnOp::Asin => a.asin(),
        UnOp::Atan => a.atan(),
        UnOp::Exp => a.exp(),
        UnOp::Log => a.log(),
        UnOp::Log10 => a.log10(),
        UnOp::Sqrt => a.sqrt(),
        UnOp::Ceil => a.ceil(),
        UnOp::Floor => a.floor(),
        UnOp::Fabs => a.fabs(),
        UnOp::IsNan => a.is_nan(),
        UnOp::Relu => a.relu()
    }
}
