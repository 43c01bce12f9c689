//! Basic well-formedness checks for the trace IR. These are intended both to help debugging
//! incorrectly formed IR and to provide guarantees about what IR code generators can expect.
//!
//! Specifically, after calling [Module::assert_well_formed] one can safely assume:
//!
//!   * Every block ends with a terminator and no other instruction in a block is a terminator.
//!   * Every operand is defined earlier in program order and produces a value.
//!   * Every use-list entry corresponds to an operand occurrence and vice versa.
//!   * Every exit and jump target refers to an existing snapshot or block.
//!   * Every instruction referenced by a snapshot is defined.
//!   * Every live constant pool entry is loaded by exactly one instruction in the entry block.

use super::{Inst, Module};
use vob::Vob;

impl Module {
    pub(crate) fn assert_well_formed(&self) {
        let mut defined = Vob::from_elem(false, self.insts_len());
        for bidx in self.blocks() {
            let insts = self.block(bidx).insts();
            match insts.last() {
                Some(x) if self.inst(*x).is_terminator() => (),
                _ => panic!("Block bb{bidx} does not end with a terminator"),
            }
            for (i, iidx) in insts.iter().enumerate() {
                let inst = self.inst(*iidx);
                if inst == Inst::Tombstone {
                    panic!("Tombstone %{iidx} is still part of block bb{bidx}");
                }
                if self.inst_block(*iidx) != bidx {
                    panic!("Instruction %{iidx} thinks it is in the wrong block");
                }
                if inst.is_terminator() && i + 1 != insts.len() {
                    panic!(
                        "Terminator in the middle of block bb{bidx}\n  {}",
                        inst.display(self, *iidx)
                    );
                }
                for op in self.operands(*iidx) {
                    if !defined.get(usize::from(op)).unwrap_or(false) {
                        panic!(
                            "Instruction %{iidx} uses %{op} before it is defined\n  {}",
                            inst.display(self, *iidx)
                        );
                    }
                    if !self.inst(op).defines_value() {
                        panic!(
                            "Instruction %{iidx} uses %{op} which does not define a value\n  {}",
                            inst.display(self, *iidx)
                        );
                    }
                    let n_ops = self.operands(*iidx).iter().filter(|x| **x == op).count();
                    let n_uses = self.uses(op).iter().filter(|x| *x == iidx).count();
                    if n_ops != n_uses {
                        panic!("%{op} has {n_uses} uses by %{iidx} but is used {n_ops} times");
                    }
                }
                if let Some(x) = inst.exit() {
                    if usize::from(x) >= self.snapshots.len() {
                        panic!("Instruction %{iidx} refers to non-existent exit {x}");
                    }
                }
                if let Inst::Jump { target } = inst {
                    if usize::from(target) >= self.blocks_len() {
                        panic!("Instruction %{iidx} jumps to non-existent block bb{target}");
                    }
                }
                defined.set(usize::from(*iidx), true);
            }
        }

        for (i, s) in self.snapshots.iter().enumerate() {
            for x in s.insts() {
                if !defined.get(usize::from(x)).unwrap_or(false) {
                    panic!("Exit {i} refers to undefined instruction %{x}");
                }
            }
        }

        let entry = self.block(self.entry_block()).insts();
        for iidx in entry {
            if let Inst::LoadConst(c) = self.inst(*iidx) {
                let n = entry
                    .iter()
                    .filter(|x| self.inst(**x) == Inst::LoadConst(c))
                    .count();
                if n != 1 {
                    panic!("Constant {} is loaded {n} times", self.const_literal(c));
                }
            }
        }
        for bidx in self.blocks().skip(1) {
            for iidx in self.block(bidx).insts() {
                if let Inst::LoadConst(_) | Inst::StackLoad { .. } = self.inst(*iidx) {
                    panic!("%{iidx} must be in the entry block");
                }
            }
        }
    }
}
