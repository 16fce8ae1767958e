//! Compile-time constant evaluation.
//!
//! Folds every `const` declaration before any function is lowered. `iota`
//! resets to 0 at each grouped block and increments by one per spec; a spec
//! with no expression repeats the previous expression under the new `iota`.

use rtg_ast::{BinOp, ConstGroup, Expr, UnOp};
use rustc_hash::FxHashMap;

/// A folded constant.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl ConstValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConstValue::Int(v) => Some(*v),
            ConstValue::Bool(b) => Some(*b as i64),
            ConstValue::Str(_) => None,
        }
    }
}

/// Evaluate one package's const groups into `env`, qualifying names with
/// the package path. Unfoldable expressions are reported through `errors`.
pub fn eval_package_consts(
    pkg: &str,
    groups: &[ConstGroup],
    env: &mut FxHashMap<String, ConstValue>,
    errors: &mut Vec<String>,
) {
    for group in groups {
        let mut prev: Option<Expr> = None;
        for (iota, spec) in group.specs.iter().enumerate() {
            let expr = match (&spec.expr, &prev) {
                (Some(e), _) => e.clone(),
                (None, Some(p)) => p.clone(),
                (None, None) => {
                    errors.push(format!(
                        "{}: const {} has no expression and nothing to repeat",
                        pkg, spec.name
                    ));
                    continue;
                }
            };
            match eval_const(pkg, &expr, iota as i64, env) {
                Some(v) => {
                    env.insert(format!("{}.{}", pkg, spec.name), v);
                }
                None => errors.push(format!("{}: const {} is not constant", pkg, spec.name)),
            }
            prev = Some(expr);
        }
    }
}

/// Fold a single expression, or `None` when it is not a compile-time
/// constant.
pub fn eval_const(
    pkg: &str,
    expr: &Expr,
    iota: i64,
    env: &FxHashMap<String, ConstValue>,
) -> Option<ConstValue> {
    match expr {
        Expr::IntLit(v) => Some(ConstValue::Int(*v)),
        Expr::StringLit(s) => Some(ConstValue::Str(s.clone())),
        Expr::BoolLit(b) => Some(ConstValue::Bool(*b)),
        Expr::Iota => Some(ConstValue::Int(iota)),
        Expr::Ident(name) => {
            let qualified = if name.contains('.') {
                name.clone()
            } else {
                format!("{}.{}", pkg, name)
            };
            env.get(&qualified).or_else(|| env.get(name)).cloned()
        }
        Expr::Unary { op, operand } => {
            let v = eval_const(pkg, operand, iota, env)?;
            match (op, v) {
                (UnOp::Neg, ConstValue::Int(v)) => Some(ConstValue::Int(v.wrapping_neg())),
                (UnOp::Comp, ConstValue::Int(v)) => Some(ConstValue::Int(!v)),
                (UnOp::Not, ConstValue::Bool(b)) => Some(ConstValue::Bool(!b)),
                _ => None,
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = eval_const(pkg, lhs, iota, env)?;
            let r = eval_const(pkg, rhs, iota, env)?;
            match (l, r) {
                (ConstValue::Int(a), ConstValue::Int(b)) => eval_int_binop(*op, a, b),
                (ConstValue::Str(a), ConstValue::Str(b)) => match op {
                    BinOp::Add => Some(ConstValue::Str(a + &b)),
                    BinOp::Eq => Some(ConstValue::Bool(a == b)),
                    BinOp::Ne => Some(ConstValue::Bool(a != b)),
                    _ => None,
                },
                _ => None,
            }
        }
        _ => None,
    }
}

fn eval_int_binop(op: BinOp, a: i64, b: i64) -> Option<ConstValue> {
    let v = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => {
            if b == 0 {
                return None;
            }
            a.wrapping_div(b)
        }
        BinOp::Rem => {
            if b == 0 {
                return None;
            }
            a.wrapping_rem(b)
        }
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32),
        BinOp::Shr => a.wrapping_shr(b as u32),
        BinOp::Eq => return Some(ConstValue::Bool(a == b)),
        BinOp::Ne => return Some(ConstValue::Bool(a != b)),
        BinOp::Lt => return Some(ConstValue::Bool(a < b)),
        BinOp::Le => return Some(ConstValue::Bool(a <= b)),
        BinOp::Gt => return Some(ConstValue::Bool(a > b)),
        BinOp::Ge => return Some(ConstValue::Bool(a >= b)),
        BinOp::LogAnd | BinOp::LogOr => return None,
    };
    Some(ConstValue::Int(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtg_ast::{ConstSpec, Expr};

    fn group(specs: Vec<(&str, Option<Expr>)>) -> ConstGroup {
        ConstGroup {
            specs: specs
                .into_iter()
                .map(|(name, expr)| ConstSpec {
                    name: name.to_string(),
                    expr,
                })
                .collect(),
        }
    }

    #[test]
    fn test_iota_chain_with_repeat() {
        // const ( A = iota; B; C )
        let mut env = FxHashMap::default();
        let mut errors = Vec::new();
        eval_package_consts(
            "main",
            &[group(vec![
                ("A", Some(Expr::Iota)),
                ("B", None),
                ("C", None),
            ])],
            &mut env,
            &mut errors,
        );
        assert!(errors.is_empty());
        assert_eq!(env["main.A"], ConstValue::Int(0));
        assert_eq!(env["main.B"], ConstValue::Int(1));
        assert_eq!(env["main.C"], ConstValue::Int(2));
    }

    #[test]
    fn test_iota_resets_per_group() {
        let mut env = FxHashMap::default();
        let mut errors = Vec::new();
        eval_package_consts(
            "main",
            &[
                group(vec![("A", Some(Expr::Iota)), ("B", None)]),
                group(vec![("X", Some(Expr::Iota))]),
            ],
            &mut env,
            &mut errors,
        );
        assert_eq!(env["main.X"], ConstValue::Int(0));
    }

    #[test]
    fn test_shifted_iota_flags() {
        // const ( FlagA = 1 << iota; FlagB; FlagC )
        let shifted = Expr::Binary {
            op: BinOp::Shl,
            lhs: Box::new(Expr::IntLit(1)),
            rhs: Box::new(Expr::Iota),
        };
        let mut env = FxHashMap::default();
        let mut errors = Vec::new();
        eval_package_consts(
            "main",
            &[group(vec![
                ("FlagA", Some(shifted)),
                ("FlagB", None),
                ("FlagC", None),
            ])],
            &mut env,
            &mut errors,
        );
        assert_eq!(env["main.FlagA"], ConstValue::Int(1));
        assert_eq!(env["main.FlagB"], ConstValue::Int(2));
        assert_eq!(env["main.FlagC"], ConstValue::Int(4));
    }

    #[test]
    fn test_const_references_earlier_const() {
        let mut env = FxHashMap::default();
        let mut errors = Vec::new();
        eval_package_consts(
            "main",
            &[
                group(vec![("N", Some(Expr::IntLit(4)))]),
                group(vec![(
                    "Double",
                    Some(Expr::Binary {
                        op: BinOp::Mul,
                        lhs: Box::new(Expr::Ident("N".to_string())),
                        rhs: Box::new(Expr::IntLit(2)),
                    }),
                )]),
            ],
            &mut env,
            &mut errors,
        );
        assert_eq!(env["main.Double"], ConstValue::Int(8));
    }

    #[test]
    fn test_string_concat_const() {
        let mut env = FxHashMap::default();
        let mut errors = Vec::new();
        eval_package_consts(
            "main",
            &[group(vec![(
                "Greeting",
                Some(Expr::Binary {
                    op: BinOp::Add,
                    lhs: Box::new(Expr::StringLit("hello ".to_string())),
                    rhs: Box::new(Expr::StringLit("world".to_string())),
                }),
            )])],
            &mut env,
            &mut errors,
        );
        assert_eq!(env["main.Greeting"], ConstValue::Str("hello world".to_string()));
    }

    #[test]
    fn test_non_constant_reported() {
        let mut env = FxHashMap::default();
        let mut errors = Vec::new();
        eval_package_consts(
            "main",
            &[group(vec![(
                "Bad",
                Some(Expr::Call {
                    callee: Box::new(Expr::Ident("f".to_string())),
                    args: Vec::new(),
                    spread: false,
                }),
            )])],
            &mut env,
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Bad"));
    }
}
