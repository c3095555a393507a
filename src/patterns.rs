//! Chapter heading rules for plain-text novels.
//!
//! A [`PatternSet`] is an ordered list of whole-line regular expressions.
//! Rules are tried in priority order and the first match wins; there is no
//! longest-match arbitration between overlapping rules. Every rule caps the
//! free text after its marker at [`TRAILING_BUDGET`] characters so that long
//! prose lines starting with a marker-like token stay body text.

use std::sync::OnceLock;

use regex::Regex;

/// Maximum number of characters allowed after a heading marker.
pub const TRAILING_BUDGET: usize = 30;

/// Chinese and Arabic numerals accepted in ordinal markers.
const NUMERALS: &str = r"\d〇零一二两三四五六七八九十百千万壹贰叁肆伍陆柒捌玖拾佰仟";

/// Heading rules in priority order.
fn standard_rules() -> Vec<(&'static str, String)> {
    let tail = format!(".{{0,{TRAILING_BUDGET}}}");
    vec![
        // 第十二章 / 第3节 / 第一百回 / 第二卷
        ("ordinal", format!("^第[{NUMERALS}]+[章节回卷]{tail}$")),
        // 序章 / 楔子 / 引言 / 前言 / 后记 / 尾声 / 终章
        ("front-back-matter", format!("^[序终尾楔引前后][章言声子记]{tail}$")),
        ("body-or-extra", format!("^(正文|番外){tail}$")),
        // 上部 / 下篇 / 外卷
        ("part", format!("^[上中下外][部篇卷]{tail}$")),
        // 12 The Long Night (bare number then a short title)
        ("numbered", format!(r"^\d{{1,4}}[^\.：、&]{tail}$")),
        ("chapter-en", format!("^Chapter{tail}$")),
        ("bullet", format!("^[☆★]{tail}$")),
        // 卷三 / 卷12
        ("volume", format!("^卷[{NUMERALS}]+{tail}$")),
    ]
}

/// One named heading rule.
#[derive(Debug)]
pub struct HeadingRule {
    pub name: &'static str,
    regex: Regex,
}

/// Ordered collection of heading rules, evaluated short-circuit.
#[derive(Debug)]
pub struct PatternSet {
    rules: Vec<HeadingRule>,
}

impl PatternSet {
    /// Builds a set from `(name, pattern)` pairs, preserving their order.
    pub fn new<I, S>(rules: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (&'static str, S)>,
        S: AsRef<str>,
    {
        let rules = rules
            .into_iter()
            .map(|(name, pattern)| {
                Regex::new(pattern.as_ref()).map(|regex| HeadingRule { name, regex })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// The built-in rule set, compiled once per process.
    pub fn standard() -> &'static PatternSet {
        static STANDARD: OnceLock<PatternSet> = OnceLock::new();
        STANDARD.get_or_init(|| {
            let rules = standard_rules()
                .into_iter()
                .filter_map(|(name, pattern)| match Regex::new(&pattern) {
                    Ok(regex) => Some(HeadingRule { name, regex }),
                    Err(e) => {
                        tracing::error!(rule = name, "heading rule failed to compile: {e}");
                        None
                    }
                })
                .collect();
            PatternSet { rules }
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the first rule matching the whole of `line` once all
    /// whitespace is removed, so `第 一 章` reads as `第一章`. Blank lines
    /// never match.
    pub fn matching_rule(&self, line: &str) -> Option<&HeadingRule> {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return None;
        }
        self.rules.iter().find(|rule| rule.regex.is_match(&compact))
    }

    pub fn is_heading(&self, line: &str) -> bool {
        self.matching_rule(line).is_some()
    }
}
