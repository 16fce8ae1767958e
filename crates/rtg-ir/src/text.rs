//! Textual IR form.
//!
//! The emitter is a pure function of the module records and the parser
//! reconstructs those records exactly, so emit → parse → emit is
//! byte-for-byte idempotent. The format is line-based: one record or
//! instruction per line, fields space-separated, string payloads quoted
//! and escaped.

use crate::module::{Inst, IrFunc, IrGlobal, IrLocal, IrModule, VariadicInfo};
use crate::op::Op;
use std::fmt::Write as _;
use thiserror::Error;

/// Errors produced while parsing textual IR.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A line did not match any record form.
    #[error("line {0}: malformed record: {1}")]
    Malformed(usize, String),
    /// An unknown opcode name.
    #[error("line {0}: unknown opcode {1}")]
    UnknownOp(usize, String),
    /// A field failed to parse as an integer.
    #[error("line {0}: bad integer in {1}")]
    BadInt(usize, String),
    /// An unterminated or badly escaped string payload.
    #[error("line {0}: bad string payload")]
    BadString(usize),
    /// An instruction outside a `func` block.
    #[error("line {0}: instruction outside function")]
    OutsideFunc(usize),
    /// A `func` block without a closing `end`.
    #[error("unterminated function {0}")]
    Unterminated(String),
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str, line: usize) -> Result<String, ParseError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('x') => {
                let hi = chars.next().ok_or(ParseError::BadString(line))?;
                let lo = chars.next().ok_or(ParseError::BadString(line))?;
                let byte = u32::from_str_radix(&format!("{}{}", hi, lo), 16)
                    .map_err(|_| ParseError::BadString(line))?;
                out.push(char::from_u32(byte).ok_or(ParseError::BadString(line))?);
            }
            _ => return Err(ParseError::BadString(line)),
        }
    }
    Ok(out)
}

fn emit_inst(out: &mut String, inst: &Inst) {
    out.push_str("  ");
    out.push_str(inst.op.name());
    if inst.arg != 0 {
        let _ = write!(out, " arg={}", inst.arg);
    }
    if inst.width != 0 {
        let _ = write!(out, " w={}", inst.width);
    }
    if inst.val != 0 {
        let _ = write!(out, " val={}", inst.val);
    }
    if !inst.name.is_empty() {
        let _ = write!(out, " name=\"{}\"", escape(&inst.name));
    }
    out.push('\n');
}

/// Render a module to its textual form.
pub fn emit_text(module: &IrModule) -> String {
    let mut out = String::new();
    out.push_str("module\n");
    for g in &module.globals {
        let _ = writeln!(out, "global {}", g.name);
    }
    for (name, id) in &module.type_ids {
        let _ = writeln!(out, "type {} {}", id, name);
    }
    for (key, func) in &module.methods {
        let _ = writeln!(out, "method {} {}", key, func);
    }
    for (name, methods) in &module.interfaces {
        let _ = write!(out, "interface {}", name);
        for m in methods {
            let _ = write!(out, " {}", m);
        }
        out.push('\n');
    }
    for f in &module.funcs {
        let _ = writeln!(out, "func {} params={} returns={}", f.name, f.params, f.returns);
        for l in &f.locals {
            let _ = write!(out, "  local {}", l.name);
            if l.width != 0 {
                let _ = write!(out, " width={}", l.width);
            }
            if l.wide {
                out.push_str(" wide");
            }
            out.push('\n');
        }
        if let Some(v) = &f.variadic {
            let _ = write!(out, "  variadic fixed={}", v.fixed);
            if v.elem_width != 0 {
                let _ = write!(out, " width={}", v.elem_width);
            }
            if v.boxed {
                out.push_str(" boxed");
            }
            out.push('\n');
        }
        for inst in &f.code {
            emit_inst(&mut out, inst);
        }
        out.push_str("end\n");
    }
    out
}

fn parse_kv(tok: &str, key: &str) -> Option<Result<i64, ()>> {
    tok.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix('='))
        .map(|v| v.parse::<i64>().map_err(|_| ()))
}

fn parse_inst(line: &str, lineno: usize) -> Result<Inst, ParseError> {
    let trimmed = line.trim();
    // Split off a trailing quoted payload first; names never contain '"'.
    let (head, name) = match trimmed.find(" name=\"") {
        Some(pos) => {
            let raw = &trimmed[pos + 7..];
            let payload = raw
                .strip_suffix('"')
                .ok_or(ParseError::BadString(lineno))?;
            (&trimmed[..pos], unescape(payload, lineno)?)
        }
        None => (trimmed, String::new()),
    };
    let mut toks = head.split_whitespace();
    let op_name = toks
        .next()
        .ok_or_else(|| ParseError::Malformed(lineno, line.to_string()))?;
    let op = Op::from_name(op_name)
        .ok_or_else(|| ParseError::UnknownOp(lineno, op_name.to_string()))?;
    let mut inst = Inst::new(op);
    inst.name = name;
    for tok in toks {
        if let Some(v) = parse_kv(tok, "arg") {
            inst.arg = v.map_err(|_| ParseError::BadInt(lineno, tok.to_string()))?;
        } else if let Some(v) = parse_kv(tok, "w") {
            inst.width =
                v.map_err(|_| ParseError::BadInt(lineno, tok.to_string()))? as u8;
        } else if let Some(v) = parse_kv(tok, "val") {
            inst.val = v.map_err(|_| ParseError::BadInt(lineno, tok.to_string()))?;
        } else {
            return Err(ParseError::Malformed(lineno, line.to_string()));
        }
    }
    Ok(inst)
}

/// Parse textual IR back into a module.
pub fn parse_text(text: &str) -> Result<IrModule, ParseError> {
    let mut module = IrModule::default();
    let mut current: Option<IrFunc> = None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim_end();
        if line.is_empty() || line == "module" {
            continue;
        }
        let trimmed = line.trim_start();

        if let Some(func) = current.as_mut() {
            if trimmed == "end" {
                let done = current.take().unwrap();
                module.add_func(done);
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("local ") {
                let mut toks = rest.split_whitespace();
                let name = toks
                    .next()
                    .ok_or_else(|| ParseError::Malformed(lineno, line.to_string()))?
                    .to_string();
                let mut local = IrLocal {
                    name,
                    wide: false,
                    width: 0,
                };
                for tok in toks {
                    if let Some(v) = parse_kv(tok, "width") {
                        local.width =
                            v.map_err(|_| ParseError::BadInt(lineno, tok.to_string()))? as u8;
                    } else if tok == "wide" {
                        local.wide = true;
                    } else {
                        return Err(ParseError::Malformed(lineno, line.to_string()));
                    }
                }
                func.locals.push(local);
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("variadic ") {
                let mut info = VariadicInfo {
                    fixed: 0,
                    elem_width: 0,
                    boxed: false,
                };
                for tok in rest.split_whitespace() {
                    if let Some(v) = parse_kv(tok, "fixed") {
                        info.fixed =
                            v.map_err(|_| ParseError::BadInt(lineno, tok.to_string()))? as usize;
                    } else if let Some(v) = parse_kv(tok, "width") {
                        info.elem_width =
                            v.map_err(|_| ParseError::BadInt(lineno, tok.to_string()))? as u8;
                    } else if tok == "boxed" {
                        info.boxed = true;
                    } else {
                        return Err(ParseError::Malformed(lineno, line.to_string()));
                    }
                }
                func.variadic = Some(info);
                continue;
            }
            func.code.push(parse_inst(trimmed, lineno)?);
            continue;
        }

        if let Some(rest) = line.strip_prefix("global ") {
            module.globals.push(IrGlobal {
                name: rest.trim().to_string(),
            });
        } else if let Some(rest) = line.strip_prefix("type ") {
            let mut toks = rest.split_whitespace();
            let id = toks
                .next()
                .and_then(|t| t.parse::<i64>().ok())
                .ok_or_else(|| ParseError::BadInt(lineno, line.to_string()))?;
            let name = toks
                .next()
                .ok_or_else(|| ParseError::Malformed(lineno, line.to_string()))?;
            module.type_ids.push((name.to_string(), id));
        } else if let Some(rest) = line.strip_prefix("method ") {
            let mut toks = rest.split_whitespace();
            let key = toks
                .next()
                .ok_or_else(|| ParseError::Malformed(lineno, line.to_string()))?;
            let func = toks
                .next()
                .ok_or_else(|| ParseError::Malformed(lineno, line.to_string()))?;
            module.methods.push((key.to_string(), func.to_string()));
        } else if let Some(rest) = line.strip_prefix("interface ") {
            let mut toks = rest.split_whitespace();
            let name = toks
                .next()
                .ok_or_else(|| ParseError::Malformed(lineno, line.to_string()))?;
            module
                .interfaces
                .push((name.to_string(), toks.map(|s| s.to_string()).collect()));
        } else if let Some(rest) = line.strip_prefix("func ") {
            let mut toks = rest.split_whitespace();
            let name = toks
                .next()
                .ok_or_else(|| ParseError::Malformed(lineno, line.to_string()))?
                .to_string();
            let mut params = 0usize;
            let mut returns = 0usize;
            for tok in toks {
                if let Some(v) = parse_kv(tok, "params") {
                    params = v.map_err(|_| ParseError::BadInt(lineno, tok.to_string()))? as usize;
                } else if let Some(v) = parse_kv(tok, "returns") {
                    returns = v.map_err(|_| ParseError::BadInt(lineno, tok.to_string()))? as usize;
                } else {
                    return Err(ParseError::Malformed(lineno, line.to_string()));
                }
            }
            current = Some(IrFunc {
                name,
                params,
                returns,
                locals: Vec::new(),
                variadic: None,
                code: Vec::new(),
            });
        } else {
            return Err(ParseError::Malformed(lineno, line.to_string()));
        }
    }

    if let Some(f) = current {
        return Err(ParseError::Unterminated(f.name));
    }
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Inst, IrFunc, IrModule};
    use crate::op::Op;

    fn sample_module() -> IrModule {
        let mut m = IrModule::new();
        m.add_global("main.counter");
        m.type_id("main.Point");
        m.add_method("main.Point.String", "main.Point.String");
        m.add_interface("fmt.Stringer", vec!["String".to_string()]);
        let mut f = IrFunc {
            name: "main.main".to_string(),
            params: 0,
            returns: 0,
            locals: vec![
                IrLocal {
                    name: "x".to_string(),
                    wide: false,
                    width: 0,
                },
                IrLocal {
                    name: "b".to_string(),
                    wide: true,
                    width: 8,
                },
            ],
            variadic: None,
            code: Vec::new(),
        };
        f.code.push(Inst::with_val(Op::ConstI64, 42));
        f.code.push(Inst::with_arg(Op::LocalSet, 0));
        f.code.push(Inst::with_name(Op::Call, "runtime.Print", 1));
        f.code.push(Inst {
            op: Op::ConstStr,
            arg: 0,
            width: 0,
            val: 0,
            name: "hi\n\"quoted\"".to_string(),
        });
        f.code.push(Inst::new(Op::Drop));
        f.code.push(Inst::new(Op::Return));
        m.add_func(f);
        m
    }

    #[test]
    fn test_roundtrip_is_idempotent() {
        let m = sample_module();
        let first = emit_text(&m);
        let parsed = parse_text(&first).unwrap();
        let second = emit_text(&parsed);
        assert_eq!(first, second);
    }

    #[test]
    fn test_escaped_payload_survives() {
        let m = sample_module();
        let parsed = parse_text(&emit_text(&m)).unwrap();
        assert_eq!(parsed.funcs[0].code[3].name, "hi\n\"quoted\"");
    }

    #[test]
    fn test_variadic_line() {
        let mut m = IrModule::new();
        let f = IrFunc {
            name: "main.printf".to_string(),
            params: 2,
            returns: 0,
            locals: Vec::new(),
            variadic: Some(VariadicInfo {
                fixed: 1,
                elem_width: 0,
                boxed: true,
            }),
            code: vec![Inst::new(Op::Return)],
        };
        m.add_func(f);
        let text = emit_text(&m);
        assert!(text.contains("variadic fixed=1 boxed"));
        let parsed = parse_text(&text).unwrap();
        assert_eq!(
            parsed.funcs[0].variadic,
            Some(VariadicInfo {
                fixed: 1,
                elem_width: 0,
                boxed: true
            })
        );
    }

    #[test]
    fn test_parse_rejects_unknown_op() {
        let text = "module\nfunc main.main params=0 returns=0\n  FROB\nend\n";
        assert!(matches!(
            parse_text(text),
            Err(ParseError::UnknownOp(3, _))
        ));
    }

    #[test]
    fn test_parse_rejects_unterminated_func() {
        let text = "module\nfunc main.main params=0 returns=0\n  RETURN\n";
        assert!(matches!(parse_text(text), Err(ParseError::Unterminated(_))));
    }
}
