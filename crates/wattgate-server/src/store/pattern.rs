//! Redis-style glob patterns for the local store.

use regex::Regex;

/// Escapes glob metacharacters so `value` matches only itself.
pub fn escape_glob(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Compiles a Redis glob (`*`, `?`, `[...]`, `\x`) into an anchored regex.
pub fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    re.push_str(&regex::escape(&next.to_string()));
                }
            }
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    re.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if matches!(inner, '\\' | '[' | '&' | '~') {
                        re.push('\\');
                    }
                    re.push(inner);
                }
                re.push(']');
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }

    re.push('$');
    Regex::new(&re)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_and_question_mark() {
        let re = compile_glob("quota:*:2024-01-0?").unwrap();
        assert!(re.is_match("quota:user-1:/daily:cached:2024-01-05"));
        assert!(!re.is_match("quota:user-1:/daily:cached:2024-01-15"));
        assert!(!re.is_match("xquota:user-1:2024-01-05"));
    }

    #[test]
    fn test_character_class() {
        let re = compile_glob("day:[0-3]").unwrap();
        assert!(re.is_match("day:2"));
        assert!(!re.is_match("day:7"));

        let re = compile_glob("day:[^0-3]").unwrap();
        assert!(re.is_match("day:7"));
    }

    #[test]
    fn test_escaped_literals_match_only_themselves() {
        let literal = "weird*id?[x]";
        let pattern = format!("{}:*", escape_glob(literal));
        let re = compile_glob(&pattern).unwrap();

        assert!(re.is_match("weird*id?[x]:contract"));
        assert!(!re.is_match("weirdXXid![x]:contract"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let re = compile_glob("a.b+c:*").unwrap();
        assert!(re.is_match("a.b+c:1"));
        assert!(!re.is_match("axbbc:1"));
    }
}
