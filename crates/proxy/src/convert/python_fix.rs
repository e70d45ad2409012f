//! Recovery of Python-style dict literals that some models emit in
//! tool-call arguments (`{'city': 'Paris', 'dry_run': True}`).
//!
//! This is a compatibility shim, gated per endpoint, not a core
//! invariant. The per-stream accumulator bounds its buffer so a
//! pathological stream cannot grow it without limit.

/// Maximum bytes the per-stream accumulator may hold.
const ACCUMULATOR_LIMIT: usize = 1024 * 1024;

/// Attempt to repair a Python-style dict into JSON. Returns the fixed
/// string only when the repair produces valid JSON.
pub fn repair_python_json(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return None;
    }
    // Already valid JSON: nothing to repair.
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return None;
    }

    let fixed = substitute_quotes(trimmed);
    serde_json::from_str::<serde_json::Value>(&fixed).ok().map(|_| fixed)
}

/// Structural quote substitution: single quotes delimiting keys/values
/// become double quotes, embedded double quotes inside them are escaped,
/// and Python literals (`True`, `False`, `None`) become JSON ones.
fn substitute_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' => {
                out.push(ch);
                escaped = true;
            }
            '"' if in_single => out.push_str("\\\""),
            '"' if !in_single => {
                in_double = !in_double;
                out.push(ch);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                out.push('"');
            }
            _ if in_double || in_single => out.push(ch),
            'T' if followed_by(&mut chars, "rue") => out.push_str("true"),
            'F' if followed_by(&mut chars, "alse") => out.push_str("false"),
            'N' if followed_by(&mut chars, "one") => out.push_str("null"),
            _ => out.push(ch),
        }
    }

    out
}

fn followed_by(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, rest: &str) -> bool {
    let lookahead: String = chars.clone().take(rest.len()).collect();
    if lookahead == rest {
        for _ in 0..rest.len() {
            chars.next();
        }
        true
    } else {
        false
    }
}

/// Per-stream accumulator for tool-call argument fragments, allowing a
/// repair to span SSE chunk boundaries.
#[derive(Debug, Default)]
pub struct PythonDictFixer {
    accumulator: String,
    overflowed: bool,
}

impl PythonDictFixer {
    /// An empty fixer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one argument fragment. Returns the repaired complete
    /// argument string once the accumulated input parses (with or
    /// without repair), clearing the accumulator.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        if self.overflowed {
            return Some(fragment.to_string());
        }

        if self.accumulator.len() + fragment.len() > ACCUMULATOR_LIMIT {
            log::warn!("python-dict fixer accumulator exceeded {ACCUMULATOR_LIMIT} bytes; passing through");
            self.overflowed = true;
            let mut rest = std::mem::take(&mut self.accumulator);
            rest.push_str(fragment);
            return Some(rest);
        }

        self.accumulator.push_str(fragment);

        if serde_json::from_str::<serde_json::Value>(&self.accumulator).is_ok() {
            return Some(std::mem::take(&mut self.accumulator));
        }

        if let Some(fixed) = repair_python_json(&self.accumulator) {
            self.accumulator.clear();
            return Some(fixed);
        }

        None
    }

    /// Whatever remains buffered, passed through unrepaired.
    pub fn flush(&mut self) -> Option<String> {
        if self.accumulator.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.accumulator))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repairs_single_quoted_dict() {
        let fixed = repair_python_json("{'city': 'Paris'}").unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&fixed).unwrap(), json!({"city": "Paris"}));
    }

    #[test]
    fn repairs_python_literals() {
        let fixed = repair_python_json("{'dry_run': True, 'limit': None, 'force': False}").unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&fixed).unwrap(),
            json!({"dry_run": true, "limit": null, "force": false})
        );
    }

    #[test]
    fn escapes_embedded_double_quotes() {
        let fixed = repair_python_json(r#"{'say': 'he said "hi"'}"#).unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&fixed).unwrap(),
            json!({"say": "he said \"hi\""})
        );
    }

    #[test]
    fn valid_json_is_left_alone() {
        assert!(repair_python_json(r#"{"already": "fine"}"#).is_none());
    }

    #[test]
    fn non_dict_input_is_left_alone() {
        assert!(repair_python_json("plain text").is_none());
    }

    #[test]
    fn fixer_spans_chunk_boundaries() {
        let mut fixer = PythonDictFixer::new();
        assert!(fixer.push("{'city': 'Pa").is_none());
        let fixed = fixer.push("ris'}").unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&fixed).unwrap(), json!({"city": "Paris"}));
        assert!(fixer.flush().is_none());
    }

    #[test]
    fn fixer_passes_valid_json_through() {
        let mut fixer = PythonDictFixer::new();
        let out = fixer.push(r#"{"a":1}"#).unwrap();
        assert_eq!(out, r#"{"a":1}"#);
    }

    #[test]
    fn overflow_falls_back_to_passthrough() {
        let mut fixer = PythonDictFixer::new();
        let big = "x".repeat(ACCUMULATOR_LIMIT + 1);
        let out = fixer.push(&big).unwrap();
        assert_eq!(out.len(), ACCUMULATOR_LIMIT + 1);
        // Subsequent fragments pass straight through.
        assert_eq!(fixer.push("tail").unwrap(), "tail");
    }
}
