use regex::Regex;
use std::ops::{BitOr, BitOrAssign};

/// Bitset of formatting problems detected in a document body.
///
/// `CONTAINS_CODE_BLOCK` is classifier context only: the determiner uses it
/// to tell "some code outside a block" apart from "all code outside a block",
/// but it never selects a message on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureFlags(u16);

impl FeatureFlags {
    pub const EMPTY: FeatureFlags = FeatureFlags(0);
    pub const CODE_OUTSIDE_OF_CODE_BLOCK: FeatureFlags = FeatureFlags(1);
    pub const MULTILINE_INLINE_CODE: FeatureFlags = FeatureFlags(2);
    pub const VERY_LONG_INLINE_CODE: FeatureFlags = FeatureFlags(4);
    pub const CONTAINS_CODE_BLOCK: FeatureFlags = FeatureFlags(8);
    pub const CODE_FENCE: FeatureFlags = FeatureFlags(16);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> FeatureFlags {
        FeatureFlags(bits)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit in `other` is set in `self`.
    pub fn contains(self, other: FeatureFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: FeatureFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for FeatureFlags {
    type Output = FeatureFlags;

    fn bitor(self, rhs: FeatureFlags) -> FeatureFlags {
        FeatureFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FeatureFlags {
    fn bitor_assign(&mut self, rhs: FeatureFlags) {
        self.0 |= rhs.0;
    }
}

// Structural PowerShell constructs sitting at an indent of three spaces or
// less, i.e. not formatted as a markdown code block. The original patterns
// used look-ahead for the `$`-variable requirements inside parentheses;
// these are rewritten as plain alternations since the regex crate has no
// look-around.
const CODE_OUTSIDE_PATTERN: &str = concat!(
    r"(?im)^ {0,3}(",
    r"(function|filter|workflow|class|enum) *[a-z_]\w* *\n?\{",
    r"|(if|switch) *\(.*\$.*\) *\n?\{ *",
    r"|foreach *\(.*\$.*in.*\) *\n?\{",
    r"|for *\([^;]*\$[^;]*;[^;]*-\w\w\b[^;]*;.*\) *\n?\{ *",
    r"|param *\(",
    r"|process *\n?\{",
    r#"|(PS [A-Z]:\\[-\w\\]*> )?\w{3,}-\w{2,} (-?\w+|@?'|@?"|\$[a-z]|[A-Z]:\\|\| *\w)"#,
    r"|\$[a-z_]\w* *[=\|]",
    r")",
);

const INLINE_CODE_LINE_PATTERN: &str = r"(?m)^ {0,3}`(.*)`[\t ]*$";
const CONSECUTIVE_INLINE_PATTERN: &str = r"(?m)^ {0,3}`(.*)`[\t ]*\n\n?`.*\n\n?`";
const CODE_FENCE_PATTERN: &str = r"(?ms)^```.*?\n(.*?)```";
const INDENTED_BLOCK_PATTERN: &str = r"(?m)^(\t| {4,}).+";

const VERY_LONG_INLINE_THRESHOLD: usize = 120;

/// Compiled patterns shared by the rule functions.
struct Patterns {
    code_outside: Regex,
    inline_code_line: Regex,
    consecutive_inline: Regex,
    code_fence: Regex,
    indented_block: Regex,
}

impl Patterns {
    fn compile() -> anyhow::Result<Patterns> {
        Ok(Patterns {
            code_outside: Regex::new(CODE_OUTSIDE_PATTERN)?,
            inline_code_line: Regex::new(INLINE_CODE_LINE_PATTERN)?,
            consecutive_inline: Regex::new(CONSECUTIVE_INLINE_PATTERN)?,
            code_fence: Regex::new(CODE_FENCE_PATTERN)?,
            indented_block: Regex::new(INDENTED_BLOCK_PATTERN)?,
        })
    }
}

struct Rule {
    name: &'static str,
    flag: FeatureFlags,
    test: fn(&Patterns, &str) -> bool,
}

/// The classifier: a fixed, immutable list of pattern rules evaluated
/// independently against a document body. Matching rules' flags are
/// OR-combined; no rule short-circuits another, so registration order never
/// affects the result.
pub struct RuleSet {
    patterns: Patterns,
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> anyhow::Result<RuleSet> {
        Ok(RuleSet {
            patterns: Patterns::compile()?,
            rules: default_rules(),
        })
    }

    pub fn classify(&self, text: &str) -> FeatureFlags {
        let mut flags = FeatureFlags::EMPTY;
        for rule in &self.rules {
            if (rule.test)(&self.patterns, text) {
                log::debug!("rule matched: {}", rule.name);
                flags |= rule.flag;
            }
        }
        flags
    }
}

fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "code_outside_of_code_block",
            flag: FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK,
            test: rule_code_outside,
        },
        Rule {
            name: "multiline_inline_code",
            flag: FeatureFlags::MULTILINE_INLINE_CODE,
            test: rule_multiline_inline,
        },
        Rule {
            name: "very_long_inline_code",
            flag: FeatureFlags::VERY_LONG_INLINE_CODE,
            test: rule_very_long_inline,
        },
        Rule {
            name: "contains_code_block",
            flag: FeatureFlags::CONTAINS_CODE_BLOCK,
            test: rule_indented_block,
        },
        Rule {
            name: "code_fence",
            flag: FeatureFlags::CODE_FENCE,
            test: rule_code_fence,
        },
    ]
}

fn rule_code_outside(p: &Patterns, text: &str) -> bool {
    p.code_outside.is_match(text)
}

fn rule_multiline_inline(p: &Patterns, text: &str) -> bool {
    if !p.consecutive_inline.is_match(text) {
        // Two short legitimate snippets on adjacent lines are not worth
        // flagging; require the consecutive-lines shape first.
        return false;
    }

    let line_count = p.inline_code_line.find_iter(text).count();
    if line_count < 3 {
        return false;
    }

    // Strip the backticks and see whether the uncovered text looks like
    // unblocked code.
    let stripped = p.inline_code_line.replace_all(text, "$1");
    p.code_outside.is_match(&stripped)
}

fn rule_very_long_inline(p: &Patterns, text: &str) -> bool {
    // Only the first inline span is inspected. A long-standing quirk of the
    // rule, kept on purpose.
    p.inline_code_line
        .captures_iter(text)
        .next()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().chars().count() > VERY_LONG_INLINE_THRESHOLD)
        .unwrap_or(false)
}

fn rule_code_fence(p: &Patterns, text: &str) -> bool {
    p.code_fence.is_match(text)
}

fn rule_indented_block(p: &Patterns, text: &str) -> bool {
    p.indented_block.is_match(text)
}
