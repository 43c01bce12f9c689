//! The tjvm assembler.
//!
//! A program is a sequence of method definitions and classes, one item per line. `#` starts a
//! comment. Execution starts in the top-level method `main`.
//!
//! ```text
//! class Point            # a user class
//!     attr x             # defines the methods `x` and `x=`
//!     def norm1 0 0      # def NAME NARGS NLOCALS
//!         putself
//!         send x 0
//!         leave
//!     end
//! end
//!
//! def main 0 1
//! head:                  # labels are local to their method
//!     getlocal 0
//!     ...
//!     branchif head
//!     leave
//! end
//! ```
//!
//! Instructions map one-to-one onto [Insn]s; fast-path operators are written `opt_<op>` (e.g.
//! `opt_plus`, `opt_lt`, `opt_succ`, `opt_not`).

use super::{value::*, MethodDef, MethodKind, Vm};
use std::{collections::HashMap, error::Error, rc::Rc};
use tjit::host::{BinopKind, CallSite, Insn, MethodId, Pc, UnopKind, Value};

/// Each fast-path binary operator and the method it calls.
const BINOPS: [(BinopKind, &str); 16] = [
    (BinopKind::Plus, "+"),
    (BinopKind::Minus, "-"),
    (BinopKind::Mult, "*"),
    (BinopKind::Div, "/"),
    (BinopKind::Mod, "%"),
    (BinopKind::Eq, "=="),
    (BinopKind::Neq, "!="),
    (BinopKind::Lt, "<"),
    (BinopKind::Le, "<="),
    (BinopKind::Gt, ">"),
    (BinopKind::Ge, ">="),
    (BinopKind::Ltlt, "<<"),
    (BinopKind::Rshift, ">>"),
    (BinopKind::And, "&"),
    (BinopKind::Or, "|"),
    (BinopKind::Xor, "^"),
];

const UNOPS: [(UnopKind, &str); 2] = [(UnopKind::Succ, "succ"), (UnopKind::Not, "!")];

/// The method currently being assembled.
struct OpenMethod {
    labels: HashMap<String, usize>,
    /// Branches whose target is a label.
    fixups: Vec<(usize, String)>,
}

struct Assembler {
    vm: Vm,
    code: Vec<Insn>,
    class: Option<usize>,
    method: Option<OpenMethod>,
    main: Option<MethodId>,
}

/// Assemble `src` into a VM ready to run it.
pub fn load(src: &str) -> Result<Vm, Box<dyn Error>> {
    let mut asm = Assembler {
        vm: Vm::new(),
        code: Vec::new(),
        class: None,
        method: None,
        main: None,
    };
    let lines = src
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, strip_comment(l).trim()))
        .filter(|(_, l)| !l.is_empty())
        .collect::<Vec<_>>();
    // Classes can be referenced before they are defined.
    for (n, l) in &lines {
        if let Some(name) = l.strip_prefix("class ") {
            let name = name.trim();
            if asm.vm.class_by_name(name).is_some() {
                return Err(format!("line {n}: class {name} is already defined").into());
            }
            asm.vm.add_class(name);
        }
    }
    for (n, l) in lines {
        asm.line(l).map_err(|e| format!("line {n}: {e}"))?;
    }
    if asm.method.is_some() || asm.class.is_some() {
        return Err("unexpected end of input: missing `end`".into());
    }
    asm.vm.main = asm.main.ok_or("no `main` method")?;
    asm.vm.code = Rc::from(asm.code);
    Ok(asm.vm)
}

/// Remove a trailing comment from `l`, respecting string literals.
fn strip_comment(l: &str) -> &str {
    let mut in_str = false;
    let mut escaped = false;
    for (i, c) in l.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_str => escaped = true,
            '"' => in_str = !in_str,
            '#' if !in_str => return &l[..i],
            _ => (),
        }
    }
    l
}

fn parse_string(s: &str) -> Result<String, String> {
    let body = s
        .strip_prefix('"')
        .and_then(|x| x.strip_suffix('"'))
        .ok_or_else(|| format!("malformed string {s}"))?;
    let mut out = String::with_capacity(body.len());
    let mut cs = body.chars();
    while let Some(c) = cs.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match cs.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(x @ ('\\' | '"')) => out.push(x),
            x => return Err(format!("unknown escape {x:?}")),
        }
    }
    Ok(out)
}

fn num<T: std::str::FromStr>(tok: Option<&str>) -> Result<T, String> {
    let tok = tok.ok_or("missing operand")?;
    tok.parse().map_err(|_| format!("invalid operand {tok}"))
}

impl Assembler {
    fn line(&mut self, l: &str) -> Result<(), String> {
        let mut toks = l.split_whitespace();
        let Some(head) = toks.next() else {
            return Ok(());
        };
        match head {
            "class" => {
                if self.class.is_some() || self.method.is_some() {
                    return Err("classes can only be defined at the top level".into());
                }
                let name = toks.next().ok_or("missing class name")?;
                self.class = self.vm.class_by_name(name);
            }
            "attr" => {
                let class = match (self.class, &self.method) {
                    (Some(c), None) => c,
                    _ => return Err("attr outside a class".into()),
                };
                let name = toks.next().ok_or("missing attribute name")?;
                let sym = self.vm.intern(name);
                let writer = self.vm.intern(&format!("{name}="));
                let c = &mut self.vm.classes[class];
                if !c.layout.contains(&sym) {
                    c.layout.push(sym);
                }
                c.methods.insert(sym, MethodKind::AttrReader(sym));
                c.methods.insert(writer, MethodKind::AttrWriter(sym));
            }
            "def" => {
                if self.method.is_some() {
                    return Err("nested def".into());
                }
                let name = toks.next().ok_or("missing method name")?;
                let nargs = num::<u32>(toks.next())?;
                let nlocals = num::<u32>(toks.next())?;
                if nlocals < nargs {
                    return Err(format!("{name} has fewer locals than arguments"));
                }
                let id = MethodId(self.vm.methods.len() as u32);
                self.vm.methods.push(MethodDef {
                    name: name.to_owned(),
                    nargs,
                    nlocals,
                    entry: self.code.len(),
                });
                let sym = self.vm.intern(name);
                let class = self.class.unwrap_or(OBJECT);
                self.vm.classes[class]
                    .methods
                    .insert(sym, MethodKind::Bytecode(id));
                if name == "main" && self.class.is_none() {
                    self.main = Some(id);
                }
                self.method = Some(OpenMethod {
                    labels: HashMap::new(),
                    fixups: Vec::new(),
                });
            }
            "end" => match self.method.take() {
                Some(m) => self.close_method(m)?,
                None if self.class.is_some() => self.class = None,
                None => return Err("unmatched `end`".into()),
            },
            label if label.ends_with(':') && label.len() == l.len() => {
                let label = &label[..label.len() - 1];
                let pc = self.code.len();
                let m = self.method.as_mut().ok_or("label outside a method")?;
                if m.labels.insert(label.to_owned(), pc).is_some() {
                    return Err(format!("duplicate label {label}"));
                }
            }
            _ => {
                if self.method.is_none() {
                    return Err(format!("instruction {head} outside a method"));
                }
                let insn = self.insn(head, l[head.len()..].trim())?;
                self.code.push(insn);
            }
        }
        Ok(())
    }

    fn close_method(&mut self, m: OpenMethod) -> Result<(), String> {
        for (pc, label) in m.fixups {
            let target = Pc(*m
                .labels
                .get(&label)
                .ok_or_else(|| format!("undefined label {label}"))?);
            match &mut self.code[pc] {
                Insn::Jump { target: t }
                | Insn::BranchIf { target: t, .. }
                | Insn::BranchUnless { target: t, .. } => *t = target,
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    fn site(&mut self, name: &str) -> CallSite {
        let sym = self.vm.intern(name);
        self.vm.sites.push(sym);
        CallSite(self.vm.sites.len() as u32 - 1)
    }

    /// Record that the instruction about to be emitted branches to `label`.
    fn fixup(&mut self, label: Option<&str>) -> Result<Pc, String> {
        let label = label.ok_or("missing label")?;
        let pc = self.code.len();
        let m = self.method.as_mut().ok_or("instruction outside a method")?;
        m.fixups.push((pc, label.to_owned()));
        Ok(Pc(usize::MAX))
    }

    fn object(&mut self, tok: Option<&str>) -> Result<Value, String> {
        let tok = tok.ok_or("missing operand")?;
        match tok {
            "nil" => return Ok(QNIL),
            "true" => return Ok(QTRUE),
            "false" => return Ok(QFALSE),
            _ => (),
        }
        if tok.starts_with(|c: char| c.is_ascii_uppercase()) {
            let c = self
                .vm
                .class_by_name(tok)
                .ok_or_else(|| format!("unknown class {tok}"))?;
            return Ok(self.vm.classes[c].value);
        }
        if let Ok(x) = tok.parse::<i64>() {
            return fixnum(x).ok_or_else(|| format!("{tok} is too big for a fixnum"));
        }
        match tok.parse::<f64>() {
            Ok(x) => Ok(self.vm.alloc_float(x)),
            Err(_) => Err(format!("invalid object {tok}")),
        }
    }

    fn insn(&mut self, head: &str, rest: &str) -> Result<Insn, String> {
        let next = Pc(self.code.len() + 1);
        let mut toks = rest.split_whitespace();
        let insn = match head {
            "nop" => Insn::Nop,
            "getlocal" | "setlocal" => {
                let idx = num(toks.next())?;
                let level = match toks.next() {
                    Some(x) => num(Some(x))?,
                    None => 0,
                };
                if head == "getlocal" {
                    Insn::GetLocal { level, idx }
                } else {
                    Insn::SetLocal { level, idx }
                }
            }
            "getivar" | "setivar" => {
                let name = toks.next().ok_or("missing instance variable")?;
                let name = self.vm.intern(name.trim_start_matches('@'));
                if head == "getivar" {
                    Insn::GetInstanceVariable { name }
                } else {
                    Insn::SetInstanceVariable { name }
                }
            }
            "getglobal" | "setglobal" => {
                let name = self.vm.intern(toks.next().ok_or("missing global")?);
                if head == "getglobal" {
                    Insn::GetGlobal { name }
                } else {
                    Insn::SetGlobal { name }
                }
            }
            "putnil" => Insn::PutNil,
            "putself" => Insn::PutSelf,
            "putobject" => Insn::PutObject(self.object(toks.next())?),
            "putstring" => {
                let s = parse_string(rest)?;
                Insn::PutString(self.vm.alloc_str(s))
            }
            "concatstrings" => Insn::ConcatStrings(num(toks.next())?),
            "tostring" => Insn::ToString,
            "newarray" => Insn::NewArray(num(toks.next())?),
            "newhash" => {
                let n = num::<u32>(toks.next())?;
                if n % 2 != 0 {
                    return Err("newhash needs an even number of values".into());
                }
                Insn::NewHash(n)
            }
            "newrange" => Insn::NewRange {
                exclusive: match toks.next() {
                    None => false,
                    Some("exclusive") => true,
                    Some(x) => return Err(format!("invalid operand {x}")),
                },
            },
            "pop" => Insn::Pop,
            "dup" => Insn::Dup,
            "dupn" => Insn::DupN(num(toks.next())?),
            "swap" => Insn::Swap,
            "topn" => Insn::TopN(num(toks.next())?),
            "setn" => Insn::SetN(num(toks.next())?),
            "adjuststack" => Insn::AdjustStack(num(toks.next())?),
            "send" => {
                let name = toks.next().ok_or("missing method name")?;
                let argc = num(toks.next())?;
                Insn::Send {
                    site: self.site(name),
                    argc,
                    next,
                }
            }
            "leave" => Insn::Leave,
            "throw" => Insn::Throw,
            "jump" => Insn::Jump {
                target: self.fixup(toks.next())?,
            },
            "branchif" => Insn::BranchIf {
                target: self.fixup(toks.next())?,
                next,
            },
            "branchunless" => Insn::BranchUnless {
                target: self.fixup(toks.next())?,
                next,
            },
            "checkpoint" => Insn::Other { name: "checkpoint" },
            _ => match head.strip_prefix("opt_") {
                Some(op) => self.opt(op)?,
                None => return Err(format!("unknown instruction {head}")),
            },
        };
        if let Some(x) = toks.next() {
            if head != "putstring" {
                return Err(format!("unexpected operand {x}"));
            }
        }
        Ok(insn)
    }

    fn opt(&mut self, op: &str) -> Result<Insn, String> {
        if let Some((op, name)) = BINOPS.iter().find(|(k, _)| k.to_string() == op) {
            return Ok(Insn::OptBinop {
                op: *op,
                site: self.site(name),
            });
        }
        if let Some((op, name)) = UNOPS.iter().find(|(k, _)| k.to_string() == op) {
            return Ok(Insn::OptUnop {
                op: *op,
                site: self.site(name),
            });
        }
        Err(format!("unknown instruction opt_{op}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn assembles_labels_and_sites() {
        let vm = load(
            r#"
            # A comment.
            def main 0 1
            top:
                putstring "a # b"   # not part of the string
                pop
                getlocal 0
                opt_lt
                branchunless top
                putself
                send puts 0
                leave
            end
            "#,
        )
        .unwrap();
        assert_eq!(vm.code.len(), 8);
        assert_eq!(
            vm.code[4],
            Insn::BranchUnless {
                target: Pc(0),
                next: Pc(5)
            }
        );
        assert_eq!(
            vm.code[3],
            Insn::OptBinop {
                op: BinopKind::Lt,
                site: CallSite(0)
            }
        );
        assert_eq!(
            vm.code[6],
            Insn::Send {
                site: CallSite(1),
                argc: 0,
                next: Pc(7)
            }
        );
        let Insn::PutString(s) = vm.code[0] else {
            panic!()
        };
        assert_eq!(vm.str(s), Some("a # b"));
        assert_eq!(vm.sym_name(vm.sites[0]), "<");
    }

    #[test]
    fn classes_and_attrs() {
        let vm = load(
            "
            def main 0 0
                putobject Point
                leave
            end
            class Point
                attr x
                attr y
                def sum 0 0
                    putself
                    send x 0
                    leave
                end
            end
            ",
        )
        .unwrap();
        let c = vm.class_by_name("Point").unwrap();
        assert_eq!(vm.classes[c].layout.len(), 2);
        assert_eq!(vm.code[0], Insn::PutObject(vm.classes[c].value));
        assert_eq!(vm.methods.len(), 2);
        assert_eq!(vm.methods[1].entry, 2);
    }

    #[test]
    fn errors() {
        for (src, msg) in [
            ("def main 0 0\n jump nowhere\nend", "line 3: undefined label nowhere"),
            ("def main 0 0\n frob\nend", "line 2: unknown instruction frob"),
            ("def main 0 0\n", "unexpected end of input: missing `end`"),
            ("def foo 0 0\nend", "no `main` method"),
            ("def main 1 0\nend", "line 1: main has fewer locals than arguments"),
            ("def main 0 0\n putstring \"\\q\"\nend", "line 2: unknown escape Some('q')"),
            ("class Integer\nend", "line 1: class Integer is already defined"),
        ] {
            match load(src) {
                Err(e) => assert_eq!(e.to_string(), msg),
                Ok(_) => panic!("{src}"),
            }
        }
    }
}
