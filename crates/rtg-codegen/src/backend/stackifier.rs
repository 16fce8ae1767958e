//! Control-flow stackifier for the WebAssembly backend.
//!
//! WebAssembly forbids arbitrary labels and jumps, so structured control
//! flow is re-synthesized from the IR's label/jump form:
//!
//! 1. A label is a *loop header* when some jump to it originates at or
//!    after its definition; otherwise it is a *block target*.
//! 2. Each region pre-opens `block` wrappers around every block-target
//!    label it contains, sorted so the furthest-forward target becomes the
//!    outermost block; a block ends at its label's position.
//! 3. `loop`/`end` pairs wrap loop headers; a loop closes immediately
//!    after its last back edge, and its body is a nested region.
//! 4. `JMP` becomes `br k`, `JMP_IF` `br_if k`, `JMP_IF_NOT`
//!    `i32.eqz; br_if k`, with `k` the distance to the targeted entry on
//!    the control stack.
//! 5. The short-circuit idiom (`JMP_IF[_NOT] L1; …; JMP L2; LABEL L1;
//!    CONST_BOOL c; LABEL L2`) collapses into a typed `if/else` producing
//!    an `i32`.
//!
//! Blocks whose label sits one value above the surrounding depth (the
//! switch tag) are typed `block (result i32)` so the carried value
//! survives the branch.

use rtg_ir::{Inst, Op};
use rustc_hash::{FxHashMap, FxHashSet};

/// Structured control-flow tree over instruction indices.
#[derive(Debug)]
pub enum Node {
    /// A non-control instruction, by index into the function's code.
    Inst(usize),
    /// `block ... end` with 0 or 1 `i32` results.
    Block { arity: u8, body: Vec<Node> },
    /// `loop ... end`.
    Loop { body: Vec<Node> },
    /// The recognized short-circuit idiom: typed `if/else` yielding `i32`.
    If { then: Vec<Node>, els: Vec<Node> },
    /// `br k`.
    Br(u32),
    /// `br_if k`.
    BrIf(u32),
    /// `i32.eqz; br_if k`.
    BrIfNot(u32),
}

enum Ctl {
    Block(i64),
    Loop(i64),
    If,
}

struct Stackifier<'a> {
    code: &'a [Inst],
    label_pos: FxHashMap<i64, usize>,
    refs: FxHashMap<i64, usize>,
    loop_headers: FxHashMap<i64, usize>, // label -> close position
    label_depth: &'a FxHashMap<i64, i64>,
    /// Labels consumed by the short-circuit idiom; they get no blocks.
    idiom: FxHashSet<i64>,
}

/// Build the structured tree for one function body. `label_depth` maps
/// each label to its operand-stack entry depth.
pub fn stackify(code: &[Inst], label_depth: &FxHashMap<i64, i64>) -> Vec<Node> {
    let mut label_pos = FxHashMap::default();
    let mut refs: FxHashMap<i64, usize> = FxHashMap::default();
    for (i, inst) in code.iter().enumerate() {
        match inst.op {
            Op::Label => {
                label_pos.insert(inst.arg, i);
            }
            op if op.is_jump() => {
                *refs.entry(inst.arg).or_insert(0) += 1;
            }
            _ => {}
        }
    }

    // Classification pass: a back edge makes a loop header; the loop
    // closes right after its last back edge.
    let mut loop_headers = FxHashMap::default();
    for (label, &pos) in &label_pos {
        let mut close = None;
        for (i, inst) in code.iter().enumerate() {
            if inst.op.is_jump() && inst.arg == *label && i >= pos {
                close = Some(i + 1);
            }
        }
        if let Some(end) = close {
            loop_headers.insert(*label, end);
        }
    }

    let mut s = Stackifier {
        code,
        label_pos,
        refs,
        loop_headers,
        label_depth,
        idiom: FxHashSet::default(),
    };
    // Pre-scan for the short-circuit idiom so its labels never receive
    // block wrappers.
    for i in 0..code.len() {
        if matches!(code[i].op, Op::JmpIf | Op::JmpIfNot) {
            if let Some((l1, l2)) = s.match_if_idiom(i, code.len()) {
                s.idiom.insert(l1);
                s.idiom.insert(l2);
            }
        }
    }
    let mut ctl = Vec::new();
    s.region(0, code.len(), &mut ctl)
}

impl<'a> Stackifier<'a> {
    fn is_loop(&self, label: i64) -> bool {
        self.loop_headers.contains_key(&label)
    }

    /// Block-target labels directly inside `[start, end)`, skipping the
    /// interiors of nested loops, ascending by position.
    fn block_labels(&self, start: usize, end: usize) -> Vec<(usize, i64)> {
        let mut out = Vec::new();
        let mut i = start;
        while i < end {
            let inst = &self.code[i];
            if inst.op == Op::Label {
                if self.is_loop(inst.arg) && self.refs.contains_key(&inst.arg) {
                    i = self.loop_headers[&inst.arg];
                    continue;
                }
                if self.refs.contains_key(&inst.arg)
                    && !self.is_loop(inst.arg)
                    && !self.idiom.contains(&inst.arg)
                {
                    out.push((i, inst.arg));
                }
            }
            i += 1;
        }
        out
    }

    fn region(&self, start: usize, end: usize, ctl: &mut Vec<Ctl>) -> Vec<Node> {
        let labels = self.block_labels(start, end);
        self.nest(&labels, start, end, ctl)
    }

    /// Wrap `labels` (ascending) into nested blocks, outermost = furthest.
    fn nest(
        &self,
        labels: &[(usize, i64)],
        start: usize,
        end: usize,
        ctl: &mut Vec<Ctl>,
    ) -> Vec<Node> {
        match labels.split_last() {
            None => self.linear(start, end, ctl),
            Some((&(pos, label), inner)) => {
                let arity = if self.label_depth.get(&label).copied().unwrap_or(0) > 0 {
                    1
                } else {
                    0
                };
                ctl.push(Ctl::Block(label));
                let body = self.nest(inner, start, pos, ctl);
                ctl.pop();
                let mut out = vec![Node::Block { arity, body }];
                // `pos` is the LABEL itself; code after it runs at the
                // outer level.
                out.extend(self.linear(pos + 1, end, ctl));
                out
            }
        }
    }

    /// Distance from the top of the control stack to the entry for
    /// `label`.
    fn depth_of(&self, label: i64, ctl: &[Ctl]) -> u32 {
        for (i, entry) in ctl.iter().rev().enumerate() {
            match entry {
                Ctl::Block(l) | Ctl::Loop(l) if *l == label => return i as u32,
                _ => {}
            }
        }
        panic!("ICE: branch to label {} not on control stack", label);
    }

    fn linear(&self, start: usize, end: usize, ctl: &mut Vec<Ctl>) -> Vec<Node> {
        let mut out = Vec::new();
        let mut i = start;
        while i < end {
            let inst = &self.code[i];
            match inst.op {
                Op::Label => {
                    if self.is_loop(inst.arg) && self.refs.contains_key(&inst.arg) {
                        let close = self.loop_headers[&inst.arg];
                        ctl.push(Ctl::Loop(inst.arg));
                        let body = self.region(i + 1, close, ctl);
                        ctl.pop();
                        out.push(Node::Loop { body });
                        i = close;
                        continue;
                    }
                    // Unreferenced or already-handled label.
                    i += 1;
                }
                Op::JmpIf | Op::JmpIfNot => {
                    if let Some(node) = self.try_if_idiom(i, end, ctl) {
                        let (node, next) = node;
                        out.push(node);
                        i = next;
                        continue;
                    }
                    let depth = self.depth_of(inst.arg, ctl);
                    out.push(if inst.op == Op::JmpIf {
                        Node::BrIf(depth)
                    } else {
                        Node::BrIfNot(depth)
                    });
                    i += 1;
                }
                Op::Jmp => {
                    out.push(Node::Br(self.depth_of(inst.arg, ctl)));
                    i += 1;
                }
                _ => {
                    out.push(Node::Inst(i));
                    i += 1;
                }
            }
        }
        out
    }

    /// Shape check for the short-circuit idiom at jump index `i`:
    /// `JMP_IF[_NOT] L1; …; JMP L2; LABEL L1; CONST_BOOL c; LABEL L2`.
    fn match_if_idiom(&self, i: usize, end: usize) -> Option<(i64, i64)> {
        let jump = &self.code[i];
        let l1 = jump.arg;
        if self.refs.get(&l1) != Some(&1) || self.is_loop(l1) {
            return None;
        }
        let l1_pos = *self.label_pos.get(&l1)?;
        if l1_pos + 3 > end || l1_pos <= i {
            return None;
        }
        // The three instructions at the label: LABEL L1, CONST_BOOL,
        // LABEL L2, with the arm-skipping JMP L2 just before.
        let prev = &self.code[l1_pos - 1];
        let konst = &self.code[l1_pos + 1];
        let l2_label = &self.code[l1_pos + 2];
        if prev.op != Op::Jmp || konst.op != Op::ConstBool || l2_label.op != Op::Label {
            return None;
        }
        let l2 = l2_label.arg;
        if prev.arg != l2 || self.refs.get(&l2) != Some(&1) || self.is_loop(l2) {
            return None;
        }
        Some((l1, l2))
    }

    /// Recognize the short-circuit idiom and lower it to a typed
    /// `if/else`.
    fn try_if_idiom(&self, i: usize, end: usize, ctl: &mut Vec<Ctl>) -> Option<(Node, usize)> {
        let (l1, _) = self.match_if_idiom(i, end)?;
        let jump = &self.code[i];
        let l1_pos = self.label_pos[&l1];

        ctl.push(Ctl::If);
        let arm = self.linear(i + 1, l1_pos - 1, ctl);
        ctl.pop();
        let konst_node = vec![Node::Inst(l1_pos + 1)];

        // JMP_IF_NOT: fall-through computes the right-hand side, the
        // branch takes the constant. JMP_IF is the mirrored `||` shape.
        let node = if jump.op == Op::JmpIfNot {
            Node::If {
                then: arm,
                els: konst_node,
            }
        } else {
            Node::If {
                then: konst_node,
                els: arm,
            }
        };
        Some((node, l1_pos + 3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtg_ir::Inst;

    fn depths(pairs: &[(i64, i64)]) -> FxHashMap<i64, i64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_forward_branch_becomes_block() {
        // JMP_IF_NOT 1; CONST 5; DROP; LABEL 1; RETURN
        let code = vec![
            Inst::with_val(Op::ConstI64, 1),
            Inst::with_arg(Op::JmpIfNot, 1),
            Inst::with_val(Op::ConstI64, 5),
            Inst::new(Op::Drop),
            Inst::with_arg(Op::Label, 1),
            Inst::new(Op::Return),
        ];
        let tree = stackify(&code, &depths(&[(1, 0)]));
        // One block containing the conditional branch, then the return.
        assert!(matches!(tree[0], Node::Block { arity: 0, .. }));
        match &tree[0] {
            Node::Block { body, .. } => {
                assert!(body.iter().any(|n| matches!(n, Node::BrIfNot(0))));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_back_edge_becomes_loop() {
        // LABEL 1; CONST 1; JMP_IF_NOT 2; JMP 1; LABEL 2; RETURN
        let code = vec![
            Inst::with_arg(Op::Label, 1),
            Inst::with_val(Op::ConstI64, 1),
            Inst::with_arg(Op::JmpIfNot, 2),
            Inst::with_arg(Op::Jmp, 1),
            Inst::with_arg(Op::Label, 2),
            Inst::new(Op::Return),
        ];
        let tree = stackify(&code, &depths(&[(1, 0), (2, 0)]));
        // Outer block (for label 2) wrapping the loop.
        match &tree[0] {
            Node::Block { body, .. } => match &body[0] {
                Node::Loop { body } => {
                    // The back edge targets the loop itself: depth 0.
                    assert!(body.iter().any(|n| matches!(n, Node::Br(0))));
                    // The exit branch crosses the loop to the block: depth 1.
                    assert!(body.iter().any(|n| matches!(n, Node::BrIfNot(1))));
                }
                other => panic!("expected loop, got {:?}", other),
            },
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_short_circuit_idiom_recognized() {
        // a && b: CONSTB 1; JMP_IF_NOT 1; CONSTB 0; JMP 2; LABEL 1;
        // CONST_BOOL 0; LABEL 2
        let code = vec![
            Inst::with_val(Op::ConstBool, 1),
            Inst::with_arg(Op::JmpIfNot, 1),
            Inst::with_val(Op::ConstBool, 0),
            Inst::with_arg(Op::Jmp, 2),
            Inst::with_arg(Op::Label, 1),
            Inst::with_val(Op::ConstBool, 0),
            Inst::with_arg(Op::Label, 2),
            Inst::new(Op::Drop),
            Inst::new(Op::Return),
        ];
        let tree = stackify(&code, &depths(&[(1, 0), (2, 1)]));
        assert!(
            tree.iter().any(|n| matches!(n, Node::If { .. })),
            "no typed if/else in {:?}",
            tree
        );
        // No residual blocks for the idiom labels.
        assert!(!tree.iter().any(|n| matches!(n, Node::Block { .. })));
    }

    #[test]
    fn test_switch_tag_block_is_typed() {
        // Tag-carrying label gets a result-typed block.
        let code = vec![
            Inst::with_val(Op::ConstI64, 7),
            Inst::new(Op::Dup),
            Inst::with_val(Op::ConstI64, 1),
            Inst::new(Op::Eq),
            Inst::with_arg(Op::JmpIf, 1),
            Inst::with_arg(Op::Jmp, 1),
            Inst::with_arg(Op::Label, 1),
            Inst::new(Op::Drop),
            Inst::new(Op::Return),
        ];
        let tree = stackify(&code, &depths(&[(1, 1)]));
        assert!(matches!(tree[0], Node::Block { arity: 1, .. }));
    }
}
