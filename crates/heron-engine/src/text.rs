//! List quoting and name matching.

use regex::RegexBuilder;

use crate::error::{EngineError, EngineResult};

/// How a pattern is compared against a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    Exact,
    #[default]
    Glob,
    RegExp,
}

/// Compiled form of a pattern in a given mode.
#[derive(Debug)]
pub enum Matcher {
    Exact { pattern: String, no_case: bool },
    Glob { pattern: String, no_case: bool },
    RegExp(regex::Regex),
}

impl Matcher {
    pub fn new(mode: MatchMode, pattern: &str, no_case: bool) -> EngineResult<Self> {
        Ok(match mode {
            MatchMode::Exact => Matcher::Exact {
                pattern: pattern.to_string(),
                no_case,
            },
            MatchMode::Glob => Matcher::Glob {
                pattern: pattern.to_string(),
                no_case,
            },
            MatchMode::RegExp => Matcher::RegExp(
                RegexBuilder::new(pattern)
                    .case_insensitive(no_case)
                    .build()
                    .map_err(|e| EngineError::Pattern(e.to_string()))?,
            ),
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Exact {
                pattern,
                no_case: false,
            } => pattern == text,
            Matcher::Exact {
                pattern,
                no_case: true,
            } => pattern.to_lowercase() == text.to_lowercase(),
            Matcher::Glob { pattern, no_case } => glob_match(pattern, text, *no_case),
            Matcher::RegExp(re) => re.is_match(text),
        }
    }
}

/// Glob match supporting `*`, `?`, `[a-z]` classes and `\` escapes.
pub fn glob_match(pattern: &str, text: &str, no_case: bool) -> bool {
    let fold = |c: char| {
        if no_case {
            c.to_lowercase().next().unwrap_or(c)
        } else {
            c
        }
    };
    let pattern: Vec<char> = pattern.chars().map(fold).collect();
    let text: Vec<char> = text.chars().map(fold).collect();
    glob_match_at(&pattern, &text)
}

fn glob_match_at(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Backtrack point for the last `*` seen: (pattern index after it, text index).
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        let step = match pattern.get(p) {
            Some('*') => {
                star = Some((p + 1, t));
                p += 1;
                continue;
            }
            Some('?') => Some(1),
            Some('[') => match_class(&pattern[p..], text[t]),
            Some('\\') => match pattern.get(p + 1) {
                Some(&c) if c == text[t] => Some(2),
                _ => None,
            },
            Some(&c) if c == text[t] => Some(1),
            _ => None,
        };

        match step {
            Some(consumed) => {
                p += consumed;
                t += 1;
            }
            None => match star {
                Some((star_p, star_t)) => {
                    p = star_p;
                    t = star_t + 1;
                    star = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// Match a `[...]` class at the start of `pattern`. Returns the class length.
fn match_class(pattern: &[char], c: char) -> Option<usize> {
    let mut i = 1;
    let mut matched = false;
    while i < pattern.len() && pattern[i] != ']' {
        let lo = pattern[i];
        if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            let hi = pattern[i + 2];
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= lo == c;
            i += 1;
        }
    }
    if i >= pattern.len() || !matched {
        return None;
    }
    Some(i + 1)
}

fn needs_quoting(element: &str) -> bool {
    element.is_empty()
        || element.starts_with('#')
        || element
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | '[' | ']' | '$' | '"' | ';' | '\\'))
}

fn braces_balanced(element: &str) -> bool {
    let mut depth = 0i32;
    let mut chars = element.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0 && !element.ends_with('\\')
}

/// Quote one list element so that it survives list parsing unchanged.
pub fn quote_element(element: &str) -> String {
    if !needs_quoting(element) {
        return element.to_string();
    }
    if braces_balanced(element) {
        return format!("{{{}}}", element);
    }
    let mut out = String::with_capacity(element.len() * 2);
    for c in element.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c.is_whitespace()
                || matches!(c, '{' | '}' | '[' | ']' | '$' | '"' | ';' | '\\') =>
            {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Join elements into a well-formed list string.
pub fn make_list<I, S>(elements: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    elements
        .into_iter()
        .map(|e| quote_element(e.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "", false));
        assert!(glob_match("a*", "abc", false));
        assert!(glob_match("*c", "abc", false));
        assert!(glob_match("a?c", "abc", false));
        assert!(glob_match("[a-c]x", "bx", false));
        assert!(!glob_match("[a-c]x", "dx", false));
        assert!(glob_match("a*b*c", "axxbyyc", false));
        assert!(!glob_match("a*b", "axxbc", false));
        assert!(glob_match("\\*", "*", false));
        assert!(!glob_match("\\*", "x", false));
        assert!(glob_match("ABC", "abc", true));
        assert!(!glob_match("ABC", "abc", false));
    }

    #[test]
    fn test_matcher_modes() {
        let exact = Matcher::new(MatchMode::Exact, "Foo", true).unwrap();
        assert!(exact.is_match("foo"));
        assert!(!exact.is_match("foo2"));

        let re = Matcher::new(MatchMode::RegExp, "^k[0-9]+$", false).unwrap();
        assert!(re.is_match("k12"));
        assert!(!re.is_match("kx"));

        assert!(matches!(
            Matcher::new(MatchMode::RegExp, "(", false),
            Err(EngineError::Pattern(_))
        ));
    }

    #[test]
    fn test_make_list_quoting() {
        assert_eq!(make_list(["a", "b"]), "a b");
        assert_eq!(make_list(["a b", ""]), "{a b} {}");
        assert_eq!(make_list(["x{"]), "x\\{");
        assert_eq!(quote_element("#c"), "{#c}");
    }
}
