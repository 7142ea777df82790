//! Textual `#define` expansion.
//!
//! Runs before the lexer. `#define NAME VALUE` lines are removed from the
//! output and every later whole-word occurrence of `NAME` is replaced by
//! `VALUE`. Longer macro names are substituted first so that `MAX` cannot
//! eat into `MAXSIZE`. `#include` lines pass through untouched; they are
//! resolved by the include pass in `lib.rs`.

use std::collections::HashMap;

/// Macro table carried across the lines of one file.
#[derive(Debug, Default)]
pub struct Preprocessor {
    defines: HashMap<String, String>,
}

impl Preprocessor {
    /// Fresh preprocessor with no definitions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand every `#define` in `source` and return the processed text.
    pub fn process(&mut self, source: &str) -> String {
        let mut out_lines = Vec::new();

        for line in source.lines() {
            let stripped = line.trim_start();
            if let Some(rest) = stripped.strip_prefix("#define") {
                self.parse_define(rest);
                // Keep the line count stable for diagnostics.
                out_lines.push(String::new());
            } else {
                out_lines.push(self.expand(line));
            }
        }

        out_lines.join("\n")
    }

    fn parse_define(&mut self, rest: &str) {
        let rest = rest.trim();
        let mut parts = rest.splitn(2, char::is_whitespace);
        let Some(name) = parts.next().filter(|n| !n.is_empty()) else {
            return;
        };
        let value = parts.next().unwrap_or("").trim().to_owned();
        tracing::debug!(name, value, "defined preprocessor macro");
        self.defines.insert(name.to_owned(), value);
    }

    fn expand(&self, line: &str) -> String {
        if self.defines.is_empty() {
            return line.to_owned();
        }

        let mut names: Vec<&String> = self.defines.keys().collect();
        names.sort_by_key(|n| std::cmp::Reverse(n.len()));

        let mut result = line.to_owned();
        for name in names {
            result = replace_word(&result, name, &self.defines[name]);
        }
        result
    }
}

/// Replace whole-word occurrences of `name` in `text`.
fn replace_word(text: &str, name: &str, value: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < text.len() {
        if text[i..].starts_with(name) {
            let before_ok = i == 0 || !is_word_byte(bytes[i - 1]);
            let after = i + name.len();
            let after_ok = after >= text.len() || !is_word_byte(bytes[after]);
            if before_ok && after_ok {
                out.push_str(value);
                i = after;
                continue;
            }
        }
        let ch = text[i..].chars().next().expect("in-bounds char");
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines_expand_by_whole_word() {
        let mut pre = Preprocessor::new();
        let out = pre.process("#define MAX 10\nint x = MAX; int y = MAXSIZE;");
        assert_eq!(out, "\nint x = 10; int y = MAXSIZE;");
    }

    #[test]
    fn longest_name_wins() {
        let mut pre = Preprocessor::new();
        let out = pre.process("#define LED 2\n#define LED_PIN 13\nHW_GPIO_INIT(LED_PIN, 1);");
        assert_eq!(out.trim(), "HW_GPIO_INIT(13, 1);");
    }

    #[test]
    fn valueless_define_expands_to_nothing() {
        let mut pre = Preprocessor::new();
        let out = pre.process("#define DEBUG_BUILD\nint DEBUG_BUILD x = 1;");
        assert_eq!(out.trim(), "int  x = 1;");
    }

    #[test]
    fn include_lines_pass_through() {
        let mut pre = Preprocessor::new();
        let out = pre.process("#include \"common.rtmc\"\nint x;");
        assert_eq!(out, "#include \"common.rtmc\"\nint x;");
    }
}
