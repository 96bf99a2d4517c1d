use std::path::Path;

use crate::error::Result;
use crate::util;

/// How a line is selected for rewriting. First matching rule wins; a rule
/// set is expected to have at most one rule per line shape.
#[derive(Debug, Clone)]
pub enum LineMatch {
    Prefix(String),
    Contains(String),
}

impl LineMatch {
    fn matches(&self, line: &str) -> bool {
        match self {
            LineMatch::Prefix(p) => line.starts_with(p.as_str()),
            LineMatch::Contains(c) => line.contains(c.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Edit {
    /// Replace the whole line.
    ReplaceLine(String),
    /// Substitute a substring, leaving the rest of the line untouched.
    ReplaceWithin { needle: String, replacement: String },
    /// Like `ReplaceWithin`, additionally emitting an extra line after the
    /// edited one. The append is skipped when the following line already
    /// equals the extra text, which keeps repeated application stable.
    ReplaceWithinAppend {
        needle: String,
        replacement: String,
        extra: String,
    },
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub matcher: LineMatch,
    pub edit: Edit,
}

impl Rule {
    pub fn replace_line(matcher: LineMatch, line: impl Into<String>) -> Self {
        Self {
            matcher,
            edit: Edit::ReplaceLine(line.into()),
        }
    }

    pub fn replace_within(needle: impl Into<String>, replacement: impl Into<String>) -> Self {
        let needle = needle.into();
        Self {
            matcher: LineMatch::Contains(needle.clone()),
            edit: Edit::ReplaceWithin {
                needle,
                replacement: replacement.into(),
            },
        }
    }
}

/// Line-oriented rewrite: every line is tested against the rules in order
/// and either edited by the first match or copied through byte-identical.
/// Applying the same rule set twice yields the same output as once.
pub fn rewrite_lines(input: &str, rules: &[Rule]) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out = String::with_capacity(input.len());

    for (i, line) in lines.iter().enumerate() {
        let rule = rules.iter().find(|r| r.matcher.matches(line));
        match rule.map(|r| &r.edit) {
            Some(Edit::ReplaceLine(replacement)) => {
                out.push_str(replacement);
                out.push('\n');
            }
            Some(Edit::ReplaceWithin {
                needle,
                replacement,
            }) => {
                out.push_str(&line.replace(needle.as_str(), replacement));
                out.push('\n');
            }
            Some(Edit::ReplaceWithinAppend {
                needle,
                replacement,
                extra,
            }) => {
                out.push_str(&line.replace(needle.as_str(), replacement));
                out.push('\n');
                let next_is_extra = lines.get(i + 1).is_some_and(|n| *n == extra.as_str());
                if !next_is_extra {
                    out.push_str(extra);
                    out.push('\n');
                }
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

pub fn rewrite_file(path: &Path, rules: &[Rule]) -> Result<()> {
    let content = util::read_text(path)?;
    util::write_text(path, &rewrite_lines(&content, rules))
}
