//! Per-function size reporting.

use serde::Serialize;

/// Machine-code size of one emitted function.
#[derive(Debug, Clone, Serialize)]
pub struct FuncSize {
    /// Qualified function name.
    pub name: String,
    /// Emitted byte count.
    pub bytes: usize,
}

/// The optional size dump produced after code generation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SizeReport {
    /// Total text-section bytes.
    pub total: usize,
    /// Per-function sizes, largest first.
    pub funcs: Vec<FuncSize>,
}

impl SizeReport {
    /// Build a report from `(name, size)` pairs, sorting largest first with
    /// name as the tie-breaker so output is deterministic.
    pub fn from_sizes(sizes: Vec<(String, usize)>) -> Self {
        let total = sizes.iter().map(|(_, s)| s).sum();
        let mut funcs: Vec<FuncSize> = sizes
            .into_iter()
            .map(|(name, bytes)| FuncSize { name, bytes })
            .collect();
        funcs.sort_by(|a, b| b.bytes.cmp(&a.bytes).then(a.name.cmp(&b.name)));
        Self { total, funcs }
    }

    /// Plain-text rendering, one function per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for f in &self.funcs {
            out.push_str(&format!("{:8} {}\n", f.bytes, f.name));
        }
        out.push_str(&format!("{:8} total\n", self.total));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_largest_first() {
        let r = SizeReport::from_sizes(vec![
            ("main.small".to_string(), 10),
            ("main.big".to_string(), 100),
            ("main.mid".to_string(), 50),
        ]);
        assert_eq!(r.total, 160);
        assert_eq!(r.funcs[0].name, "main.big");
        assert_eq!(r.funcs[2].name, "main.small");
    }

    #[test]
    fn test_ties_break_by_name() {
        let r = SizeReport::from_sizes(vec![
            ("main.b".to_string(), 10),
            ("main.a".to_string(), 10),
        ]);
        assert_eq!(r.funcs[0].name, "main.a");
    }

    #[test]
    fn test_render_includes_total() {
        let r = SizeReport::from_sizes(vec![("main.main".to_string(), 42)]);
        let text = r.render();
        assert!(text.contains("main.main"));
        assert!(text.contains("total"));
    }
}
