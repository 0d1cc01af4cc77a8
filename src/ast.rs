use std::rc::Rc;

use serde::{Deserialize, Serialize};


// Abstract over various memory management strategies.
pub type Node<T> = Rc<T>;
pub type Seq<T> = Vec<Node<T>>;


// Binary operators. Pow is the pow(a, b) form, Pow2 the infix a ^ b
// form; both compute the same thing.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Pow2,
    Atan2,
    Ldexp,
    Fmod,
    Min,
    Max,
    Eq,
    Neq,
    Approx,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or
}


#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
    Cos,
    Sin,
    Tan,
    Cosh,
    Sinh,
    Tanh,
    Acos,
    Asin,
    Atan,
    Exp,
    Log,
    Log10,
    Sqrt,
    Ceil,
    Floor,
    Fabs,
    IsNan,
    Relu
}


// One cell of a tensor literal: a sparse address (dimension -> label)
// and the cell value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorCell {
    pub address: Vec<(String, String)>,
    pub value: f64
}


// ADT for scoring expressions, as produced by an external parser.
//
// Symbol carries a signed id: a non-negative id names a caller-supplied
// parameter, a negative id names an enclosing let binding at depth
// -id - 1 (counted from the outermost binding).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Number(f64),
    Str(String),
    Array(Seq<Expr>),
    Error,
    Tensor(Vec<TensorCell>),
    Symbol(i32),
    Unary(UnOp, Node<Expr>),
    Binary(BinOp, Node<Expr>, Node<Expr>),
    If(Node<Expr>, Node<Expr>, Node<Expr>),
    Let(Node<Expr>, Node<Expr>),
    In(Node<Expr>, Node<Expr>),
    TensorSum(Node<Expr>, Option<String>),
    TensorMatch(Node<Expr>, Node<Expr>)
}


// Shortcuts for building trees by hand. With the parser living in a
// separate crate, these are the construction surface for embedders and
// for tests.

pub fn num(n: f64) -> Expr {
    Expr::Number(n)
}

pub fn stri(s: &str) -> Expr {
    Expr::Str(String::from(s))
}

pub fn sym(id: i32) -> Expr {
    Expr::Symbol(id)
}

pub fn array(items: Vec<Expr>) -> Expr {
    Expr::Array(items.into_iter().map(Rc::new).collect())
}

pub fn un(op: UnOp, a: Expr) -> Expr {
    Expr::Unary(op, Rc::new(a))
}

pub fn bin(op: BinOp, a: Expr, b: Expr) -> Expr {
    Expr::Binary(op, Rc::new(a), Rc::new(b))
}

pub fn iff(cond: Expr, then: Expr, els: Expr) -> Expr {
    Expr::If(Rc::new(cond), Rc::new(then), Rc::new(els))
}

pub fn let_(value: Expr, body: Expr) -> Expr {
    Expr::Let(Rc::new(value), Rc::new(body))
}

pub fn in_(lhs: Expr, rhs: Expr) -> Expr {
    Expr::In(Rc::new(lhs), Rc::new(rhs))
}

pub fn sum(a: Expr) -> Expr {
    Expr::TensorSum(Rc::new(a), None)
}

pub fn sum_dim(a: Expr, dim: &str) -> Expr {
    Expr::TensorSum(Rc::new(a), Some(String::from(dim)))
}

pub fn tmatch(a: Expr, b: Expr) -> Expr {
    Expr::TensorMatch(Rc::new(a), Rc::new(b))
}
