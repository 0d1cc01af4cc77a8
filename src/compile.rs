// Lowering from expression trees to VM programs.
//
// The compiler is an explicit post-order walk: ordinary nodes compile
// their children and then emit the matching instruction. If, Let, In
// and tensor literals interleave child emission with control flow or
// constant construction, so they drive the descent themselves.
//
// Skip offsets are relative to the instruction after the skipping one,
// because the driver advances pc before dispatch. Forward skips are
// emitted with a zero placeholder and backpatched once the landing
// point is known.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::ast::{BinOp, Expr, TensorCell};
use crate::tensor::{Address, TensorEngine, TensorSpec};
use crate::vm::{hash_str, Function, Op, Stash, Value};


// Compile a tree against an engine. Deterministic: structurally
// identical trees produce identical programs, stash contents included.
pub fn compile(
    engine: Arc<dyn TensorEngine>,
    root: &Expr,
    num_params: usize
) -> Function {
    let mut compiler = Compiler {
        engine,
        num_params,
        code: Vec::new(),
        stash: Stash::new(),
        dims: Vec::new()
    };
    compiler.expr(root);

    for (i, op) in compiler.code.iter().enumerate() {
        trace!("{:?} {:?}", i, op);
    }

    let Compiler {
        engine,
        num_params,
        code,
        stash,
        dims
    } = compiler;
    Function {
        code,
        stash,
        dims,
        num_params,
        engine
    }
}


struct Compiler {
    engine: Arc<dyn TensorEngine>,
    num_params: usize,
    code: Vec<Op>,
    stash: Stash,
    dims: Vec<String>
}

impl Compiler {
    fn emit(&mut self, op: Op) -> usize {
        self.code.push(op);
        self.code.len() - 1
    }

    fn constant(&mut self, value: Value) {
        let slot = self.stash.put(value);
        self.emit(Op::LoadConst(slot));
    }

    // Offset that lands just past the current end of the program, for
    // a skip sitting at `from`.
    fn offset_to_end(&self, from: usize) -> i32 {
        (self.code.len() - from - 1) as i32
    }

    fn patch(&mut self, at: usize, offset: i32) {
        self.code[at] = match self.code[at] {
            Op::Skip(_) => Op::Skip(offset),
            Op::SkipIfFalse(_) => Op::SkipIfFalse(offset),
            Op::CheckMember(_) => Op::CheckMember(offset),
            op => panic!("patching a non-skip instruction: {:?}", op)
        };
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Number(n) => self.constant(Value::Double(*n)),
            Expr::Str(s) => self.constant(Value::Str(hash_str(s))),
            // A bare array evaluates to its length.
            Expr::Array(items) => {
                self.constant(Value::Double(items.len() as f64))
            }
            Expr::Error => self.constant(Value::Error),
            Expr::Tensor(cells) => self.tensor_literal(cells),
            Expr::Symbol(id) => self.symbol(*id),
            Expr::Unary(op, a) => {
                self.expr(a);
                self.emit(Op::Unary(*op));
            }
            Expr::Binary(op, a, b) => {
                self.expr(a);
                self.expr(b);
                self.emit(Op::Binary(*op));
            }
            Expr::If(cond, then, els) => self.lazy_if(cond, then, els),
            Expr::Let(value, body) => {
                self.expr(value);
                self.emit(Op::StoreLet);
                self.expr(body);
                self.emit(Op::EvictLet);
            }
            Expr::In(lhs, rhs) => self.membership(lhs, rhs),
            Expr::TensorSum(a, dim) => {
                self.expr(a);
                match dim {
                    None => {
                        self.emit(Op::TensorSum);
                    }
                    Some(name) => {
                        let slot = self.dim(name);
                        self.emit(Op::TensorSumDim(slot));
                    }
                }
            }
            // Match is element-wise multiplication.
            Expr::TensorMatch(a, b) => {
                self.expr(a);
                self.expr(b);
                self.emit(Op::Binary(BinOp::Mul));
            }
        }
    }

    fn symbol(&mut self, id: i32) {
        if id >= 0 {
            assert!(
                (id as usize) < self.num_params,
                "parameter id {} out of range",
                id
            );
            self.emit(Op::LoadParam(id as u32));
        } else {
            self.emit(Op::LoadLet((-id - 1) as u32));
        }
    }

    // Exactly one branch body runs per evaluation: the condition skips
    // over the taken branch's trailing Skip into the fallback, and the
    // Skip jumps over the fallback to the join point.
    fn lazy_if(&mut self, cond: &Expr, then: &Expr, els: &Expr) {
        self.expr(cond);
        let check = self.emit(Op::SkipIfFalse(0));
        self.expr(then);
        let exit = self.emit(Op::Skip(0));
        self.patch(check, (exit - check) as i32);
        self.expr(els);
        let offset = self.offset_to_end(exit);
        self.patch(exit, offset);
    }

    // Membership compiles to a chain of checks, one per candidate. A
    // match consumes the lhs, yields 1 and skips the rest of the
    // chain, NotMember included; falling off the chain yields 0.
    fn membership(&mut self, lhs: &Expr, rhs: &Expr) {
        self.expr(lhs);
        let mut checks = Vec::new();
        match rhs {
            Expr::Array(items) => {
                for item in items {
                    self.expr(item);
                    checks.push(self.emit(Op::CheckMember(0)));
                }
            }
            single => {
                self.expr(single);
                checks.push(self.emit(Op::CheckMember(0)));
            }
        }
        let fallback = self.emit(Op::NotMember);
        for check in checks {
            self.patch(check, (fallback - check) as i32);
        }
    }

    // A tensor literal is materialized by the engine at compile time
    // and embedded as a constant. The dimension set is the union over
    // all cells, sorted, so two structurally identical literals
    // compile to the same stash entry.
    fn tensor_literal(&mut self, cells: &[TensorCell]) {
        let mut dims = BTreeSet::new();
        for cell in cells {
            for (dim, _) in &cell.address {
                dims.insert(dim.clone());
            }
        }
        let spec = TensorSpec {
            dims: dims.into_iter().collect(),
            cells: cells
                .iter()
                .map(|cell| {
                    let address: Address = cell.address.iter().cloned().collect();
                    (address, cell.value)
                })
                .collect()
        };
        let tensor = self.engine.create(&spec);
        self.constant(Value::Tensor(tensor));
    }

    // Intern a dimension name, so TensorSumDim can hand the engine the
    // verbatim string (unlike value strings, these are not hashed).
    fn dim(&mut self, name: &str) -> u32 {
        if let Some(slot) = self.dims.iter().position(|d| d == name) {
            return slot as u32;
        }
        self.dims.push(String::from(name));
        (self.dims.len() - 1) as u32
    }
}


// End-to-end tests: build a tree, compile it, run it.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use crate::ast::BinOp::*;
    use crate::ast::UnOp::*;
    use crate::tensor::DEFAULT_ENGINE;
    use crate::vm::Context;
    use crate::vm::Value::{Double, Error};

    fn compiled(expr: &Expr, num_params: usize) -> Function {
        Function::compile(DEFAULT_ENGINE.clone(), expr, num_params)
    }

    fn eval_with(f: &Function, params: Vec<Value>) -> Value {
        let mut ctx = Context::new();
        ctx.params = params;
        f.eval(&mut ctx).clone()
    }

    // Assert that a parameterless expression evaluates to the
    // expected result.
    fn assert_evaluates_to(expected: Value, expr: Expr) {
        assert_eq!(eval_with(&compiled(&expr, 0), vec! {}), expected);
    }

    fn cell(address: &[(&str, &str)], value: f64) -> TensorCell {
        TensorCell {
            address: address
                .iter()
                .map(|(d, l)| (String::from(*d), String::from(*l)))
                .collect(),
            value
        }
    }

    // { {x:a}:1, {x:b}:2, {x:c}:4 }
    fn tensor_1d() -> Expr {
        Expr::Tensor(vec! {
            cell(&[("x", "a")], 1.0),
            cell(&[("x", "b")], 2.0),
            cell(&[("x", "c")], 4.0)
        })
    }

    #[test]
    fn test_arithmetic_lowering() {
        // 2 + 3 * 4
        let expr = bin(Add, num(2.0), bin(Mul, num(3.0), num(4.0)));
        assert_evaluates_to(Double(14.0), expr.clone());

        // The lowering is a plain post-order listing.
        let f = compiled(&expr, 0);
        assert_eq!(
            f.code(),
            &[
                Op::LoadConst(0),
                Op::LoadConst(1),
                Op::LoadConst(2),
                Op::Binary(Mul),
                Op::Binary(Add)
            ]
        );
    }

    #[test]
    fn test_strings_become_hashes() {
        let f = compiled(&stri("red"), 0);
        assert_eq!(eval_with(&f, vec! {}), Value::Str(hash_str("red")));
    }

    #[test]
    fn test_bare_array_is_its_length() {
        assert_evaluates_to(
            Double(3.0),
            array(vec! {num(7.0), num(8.0), num(9.0)})
        );
    }

    #[test]
    fn test_error_literal() {
        assert_evaluates_to(Error, Expr::Error);
    }

    #[test]
    fn test_conditional() {
        // if (a > 0, 1 / a, -1)
        let expr = iff(
            bin(Gt, sym(0), num(0.0)),
            bin(Div, num(1.0), sym(0)),
            num(-1.0)
        );
        let f = compiled(&expr, 1);
        assert_eq!(eval_with(&f, vec! {Double(0.0)}), Double(-1.0));
        assert_eq!(eval_with(&f, vec! {Double(4.0)}), Double(0.25));

        let mut ctx = Context::new();
        ctx.params = vec! {Double(4.0)};
        f.eval(&mut ctx);
        assert_eq!(ctx.if_cnt(), 1);
    }

    #[test]
    fn test_conditional_is_lazy() {
        // An Error in the untaken branch never runs.
        let expr = iff(num(1.0), num(42.0), Expr::Error);
        assert_evaluates_to(Double(42.0), expr);

        let expr = iff(num(0.0), Expr::Error, num(42.0));
        assert_evaluates_to(Double(42.0), expr);
    }

    #[test]
    fn test_nested_conditionals() {
        // if (a, if (b, 1, 2), 3)
        let expr = iff(
            sym(0),
            iff(sym(1), num(1.0), num(2.0)),
            num(3.0)
        );
        let f = compiled(&expr, 2);
        assert_eq!(eval_with(&f, vec! {Double(1.0), Double(1.0)}), Double(1.0));
        assert_eq!(eval_with(&f, vec! {Double(1.0), Double(0.0)}), Double(2.0));
        assert_eq!(eval_with(&f, vec! {Double(0.0), Double(1.0)}), Double(3.0));
    }

    #[test]
    fn test_let_binding() {
        // let x = 5 in x * x + x
        let expr = let_(
            num(5.0),
            bin(Add, bin(Mul, sym(-1), sym(-1)), sym(-1))
        );
        assert_evaluates_to(Double(30.0), expr);
    }

    #[test]
    fn test_nested_let_bindings() {
        // let x = 2 in let y = 3 in x * y + y
        let expr = let_(
            num(2.0),
            let_(
                num(3.0),
                bin(Add, bin(Mul, sym(-1), sym(-2)), sym(-2))
            )
        );
        assert_evaluates_to(Double(9.0), expr);
    }

    #[test]
    fn test_let_hygiene() {
        // Sibling lets both bind depth zero; neither sees the other.
        let expr = bin(
            Add,
            let_(num(3.0), sym(-1)),
            let_(num(4.0), sym(-1))
        );
        assert_evaluates_to(Double(7.0), expr);
    }

    #[test]
    fn test_membership() {
        let colors = || array(vec! {stri("red"), stri("green"), stri("blue")});
        assert_evaluates_to(Double(1.0), in_(stri("red"), colors()));
        assert_evaluates_to(Double(1.0), in_(stri("blue"), colors()));
        assert_evaluates_to(Double(0.0), in_(stri("yellow"), colors()));
    }

    #[test]
    fn test_membership_short_circuits() {
        let colors = || array(vec! {stri("red"), stri("green"), stri("blue")});

        let f = compiled(&in_(stri("red"), colors()), 0);
        let mut ctx = Context::new();
        f.eval(&mut ctx);
        assert_eq!(ctx.eq_cnt(), 1);

        // A miss compares against every candidate.
        let f = compiled(&in_(stri("yellow"), colors()), 0);
        let mut ctx = Context::new();
        f.eval(&mut ctx);
        assert_eq!(ctx.eq_cnt(), 3);
    }

    #[test]
    fn test_membership_single_candidate() {
        assert_evaluates_to(Double(1.0), in_(num(3.0), num(3.0)));
        assert_evaluates_to(Double(0.0), in_(num(3.0), num(4.0)));
    }

    #[test]
    fn test_membership_empty_array() {
        assert_evaluates_to(Double(0.0), in_(num(3.0), array(vec! {})));
    }

    #[test]
    fn test_membership_mixed_variants() {
        // Cross-variant candidates simply never match.
        let expr = in_(num(2.0), array(vec! {stri("red"), num(2.0)}));
        assert_evaluates_to(Double(1.0), expr);
    }

    #[test]
    fn test_tensor_sum() {
        assert_evaluates_to(Double(7.0), sum(tensor_1d()));
    }

    #[test]
    fn test_tensor_sum_dimension() {
        // Summing away the only dimension collapses to a scalar.
        assert_evaluates_to(Double(7.0), sum_dim(tensor_1d(), "x"));

        // On a 2-d tensor, y survives with sums taken along x.
        let t = Expr::Tensor(vec! {
            cell(&[("x", "a"), ("y", "p")], 1.0),
            cell(&[("x", "b"), ("y", "p")], 2.0),
            cell(&[("x", "a"), ("y", "q")], 4.0)
        });
        let expected = DEFAULT_ENGINE.create(&TensorSpec {
            dims: vec! {String::from("y")},
            cells: vec! {
                (
                    [(String::from("y"), String::from("p"))]
                        .iter()
                        .cloned()
                        .collect(),
                    3.0
                ),
                (
                    [(String::from("y"), String::from("q"))]
                        .iter()
                        .cloned()
                        .collect(),
                    4.0
                )
            }
        });
        assert_evaluates_to(Value::Tensor(expected), sum_dim(t, "x"));
    }

    #[test]
    fn test_tensor_sum_unknown_dimension() {
        assert_evaluates_to(Error, sum_dim(tensor_1d(), "z"));
    }

    #[test]
    fn test_tensor_sum_of_scalar() {
        assert_evaluates_to(Error, sum(num(1.0)));
    }

    #[test]
    fn test_tensor_match() {
        // Match then sum: (1*1 + 2*2 + 4*4) = 21.
        let expr = sum(tmatch(tensor_1d(), tensor_1d()));
        assert_evaluates_to(Double(21.0), expr);
    }

    #[test]
    fn test_pow_forms_agree() {
        assert_evaluates_to(Double(8.0), bin(Pow, num(2.0), num(3.0)));
        assert_evaluates_to(Double(8.0), bin(Pow2, num(2.0), num(3.0)));
    }

    #[test]
    fn test_unary_lowering() {
        assert_evaluates_to(Double(-5.0), un(Neg, num(5.0)));
        assert_evaluates_to(Double(3.0), un(Sqrt, num(9.0)));
    }

    #[test]
    fn test_error_propagates_through_arithmetic() {
        let expr = bin(Add, num(1.0), bin(Mul, Expr::Error, num(2.0)));
        assert_evaluates_to(Error, expr);
    }

    #[test]
    fn test_constants_are_shared() {
        // The same literal lands in one stash slot.
        let expr = bin(Add, num(7.0), bin(Add, num(7.0), num(7.0)));
        let f = compiled(&expr, 0);
        assert_eq!(f.code()[0], Op::LoadConst(0));
        assert_eq!(f.code()[1], Op::LoadConst(0));
        assert_eq!(f.code()[2], Op::LoadConst(0));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let expr = iff(
            in_(stri("red"), array(vec! {stri("red"), stri("green")})),
            sum(tensor_1d()),
            let_(num(2.0), bin(Pow, sym(-1), num(10.0)))
        );
        let a = compiled(&expr, 0);
        let b = compiled(&expr, 0);
        assert_eq!(a.code(), b.code());
        assert_eq!(eval_with(&a, vec! {}), eval_with(&b, vec! {}));
    }

    #[test]
    fn test_ron_fixture_end_to_end() {
        // Trees arrive from the parser in-process, but fixtures can be
        // written as RON documents.
        let text = "If(
            Binary(Gt, Symbol(0), Number(0.0)),
            Binary(Div, Number(1.0), Symbol(0)),
            Number(-1.0)
        )";
        let expr: Expr = ron::from_str(text).unwrap();
        let f = compiled(&expr, 1);
        assert_eq!(eval_with(&f, vec! {Double(0.0)}), Double(-1.0));
        assert_eq!(eval_with(&f, vec! {Double(2.0)}), Double(0.5));
    }

    #[test]
    #[should_panic(expected = "parameter id 1 out of range")]
    fn test_unbound_parameter() {
        compiled(&bin(Add, sym(0), sym(1)), 1);
    }
}
