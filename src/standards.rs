use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::Result;

/// The role a reference standard plays in a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum StandardQualifier {
    Base,
    Check,
    Cone,
}

impl fmt::Display for StandardQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Base => "base",
            Self::Check => "check",
            Self::Cone => "cone",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StandardMatch {
    pub number: u32,
    pub qualifier: StandardQualifier,
}

/// Classifies solution labels as reference standards
///
/// A label is a standard if it begins with the keyword (`RM` by default, optionally followed by
/// `-` or `_`), or if it names a CRM family such as `OREAS 258` or `STD 12`. Blanks such as
/// `STD BLANK` are not standards.
#[derive(Clone, Debug)]
pub struct StandardMatcher {
    keyword: Regex,
    qualifier: Regex,
    digits: Regex,
    generic: Regex,
    blank: Regex,
}

impl StandardMatcher {
    pub const DEFAULT_KEYWORD: &'static str = "RM";

    /// # Errors
    /// Returns an error if the keyword produces an invalid pattern.
    pub fn new(keyword: &str) -> Result<Self> {
        let insensitive = |pattern: &str| RegexBuilder::new(pattern).case_insensitive(true).build();
        Ok(Self {
            keyword: insensitive(&format!("^{}[-_]?", regex::escape(keyword)))?,
            qualifier: insensitive("check|chek|cone")?,
            digits: Regex::new(r"\d+")?,
            generic: insensitive(r"^(OREAS|SRM|CRM|STANDARD|STD)")?,
            blank: insensitive(r"^\s*BLANK")?,
        })
    }

    /// Classify a label against the keyword
    ///
    /// The qualifier is taken from the first `check`/`chek`/`cone` token after the keyword. The
    /// standard number is the last run of digits before that token, or zero.
    pub fn classify(&self, label: &str) -> Option<StandardMatch> {
        let label = label.trim();
        let prefix = self.keyword.find(label)?;
        let remainder = &label[prefix.end()..];

        let (qualifier, before) = match self.qualifier.find(remainder) {
            Some(token) => {
                let qualifier = if token.as_str().eq_ignore_ascii_case("cone") {
                    StandardQualifier::Cone
                } else {
                    StandardQualifier::Check
                };
                (qualifier, &remainder[..token.start()])
            }
            None => (StandardQualifier::Base, remainder),
        };

        Some(StandardMatch {
            number: self.last_number(before),
            qualifier,
        })
    }

    /// Match CRM-family labels that do not use the keyword
    pub fn classify_generic(&self, label: &str) -> Option<StandardMatch> {
        let label = label.trim();
        let family = self.generic.find(label)?;
        let rest = &label[family.end()..];
        if self.blank.is_match(rest) {
            return None;
        }
        let number = rest
            .trim_start()
            .chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .unwrap_or(0);
        Some(StandardMatch {
            number,
            qualifier: StandardQualifier::Base,
        })
    }

    pub fn is_generic_standard(&self, label: &str) -> bool {
        self.classify_generic(label).is_some()
    }

    fn last_number(&self, text: &str) -> u32 {
        self.digits
            .find_iter(text)
            .last()
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    }
}

impl Default for StandardMatcher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_KEYWORD).expect("default keyword is a valid pattern")
    }
}

#[cfg(test)]
mod tests {
    use super::{StandardMatch, StandardMatcher, StandardQualifier};

    fn matched(number: u32, qualifier: StandardQualifier) -> Option<StandardMatch> {
        Some(StandardMatch { number, qualifier })
    }

    #[test]
    fn keyword_labels_are_base_standards_with_trailing_number() {
        let matcher = StandardMatcher::default();
        assert_eq!(matcher.classify("RM1"), matched(1, StandardQualifier::Base));
        assert_eq!(matcher.classify("rm-12"), matched(12, StandardQualifier::Base));
        assert_eq!(matcher.classify("RM_3 run 7"), matched(7, StandardQualifier::Base));
        assert_eq!(matcher.classify("RM"), matched(0, StandardQualifier::Base));
    }

    #[test]
    fn qualifier_tokens_are_recognised() {
        let matcher = StandardMatcher::default();
        assert_eq!(matcher.classify("RM2 check"), matched(2, StandardQualifier::Check));
        assert_eq!(matcher.classify("RM-4-CHEK"), matched(4, StandardQualifier::Check));
        assert_eq!(matcher.classify("RM 5 Cone 9"), matched(5, StandardQualifier::Cone));
    }

    #[test]
    fn digits_after_the_qualifier_are_ignored() {
        let matcher = StandardMatcher::default();
        assert_eq!(matcher.classify("RM check 9"), matched(0, StandardQualifier::Check));
    }

    #[test]
    fn ordinary_samples_do_not_match() {
        let matcher = StandardMatcher::default();
        assert_eq!(matcher.classify("S1"), None);
        assert_eq!(matcher.classify("FARM 2"), None);
    }

    #[test]
    fn custom_keywords_are_escaped() {
        let matcher = StandardMatcher::new("Q.C").unwrap();
        assert_eq!(matcher.classify("Q.C-3"), matched(3, StandardQualifier::Base));
        assert_eq!(matcher.classify("QXC-3"), None);
    }

    #[test]
    fn crm_family_labels_are_generic_standards_unless_blank() {
        let matcher = StandardMatcher::default();
        assert_eq!(
            matcher.classify_generic("OREAS 258"),
            matched(258, StandardQualifier::Base)
        );
        assert_eq!(
            matcher.classify_generic("std12"),
            matched(12, StandardQualifier::Base)
        );
        assert!(matcher.is_generic_standard("CRM"));
        assert!(!matcher.is_generic_standard("STD BLANK"));
        assert!(!matcher.is_generic_standard("STDBLANK"));
        assert!(!matcher.is_generic_standard("Sample STD"));
    }
}
