//! Partition an ordered run into drift segments bounded by reference standards

use log::debug;
use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::standards::{StandardMatch, StandardMatcher, StandardQualifier};
use crate::Result;

/// A detected reference standard within the run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StandardRecord {
    pub label: String,
    pub number: u32,
    pub qualifier: StandardQualifier,
    /// Position of the standard in the pivoted sequence
    pub position: usize,
    /// Number of the base standard this reading is referenced to, cleared by a cone standard
    pub reference: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DriftSegment {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub start_label: String,
    pub end_label: String,
    pub length: usize,
    /// The segment opens on a cone standard and so begins a new logical run
    pub starts_run: bool,
    pub reference: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SegmentDetection {
    pub standards: Vec<StandardRecord>,
    pub segments: Vec<DriftSegment>,
}

/// Compiled patterns recognising standards in a run
#[derive(Clone, Debug)]
pub struct SegmentPatterns {
    base: Regex,
    cone: Option<Regex>,
    matcher: StandardMatcher,
}

impl SegmentPatterns {
    /// Patterns are matched case-insensitively against trimmed labels
    ///
    /// # Errors
    /// Returns an error if any pattern fails to compile.
    pub fn new(base: &str, cone: Option<&str>, keyword: &str) -> Result<Self> {
        let compile = |pattern: &str| RegexBuilder::new(pattern).case_insensitive(true).build();
        Ok(Self {
            base: compile(base)?,
            cone: cone.map(compile).transpose()?,
            matcher: StandardMatcher::new(keyword)?,
        })
    }

    pub const fn matcher(&self) -> &StandardMatcher {
        &self.matcher
    }

    /// Classify a label, checking the base pattern, then the cone pattern, then CRM families
    pub fn classify(&self, label: &str) -> Option<StandardMatch> {
        let label = label.trim();
        if self.base.is_match(label) {
            return Some(self.matcher.classify(label).unwrap_or(StandardMatch {
                number: 0,
                qualifier: StandardQualifier::Base,
            }));
        }
        if self.cone.as_ref().is_some_and(|cone| cone.is_match(label)) {
            let number = self.matcher.classify(label).map_or(0, |m| m.number);
            return Some(StandardMatch {
                number,
                qualifier: StandardQualifier::Cone,
            });
        }
        self.matcher.classify_generic(label)
    }
}

/// Find the standards in `labels` and build one segment between each consecutive pair
///
/// Runs with fewer than two standards still need boundaries, so they produce a single segment
/// spanning the whole sequence. An empty sequence has no segments.
pub fn detect_segments<'a>(
    labels: impl IntoIterator<Item = &'a str>,
    patterns: &SegmentPatterns,
) -> SegmentDetection {
    let labels: Vec<&str> = labels.into_iter().collect();
    let mut standards = vec![];
    let mut running: Option<u32> = None;

    for (position, label) in labels.iter().enumerate() {
        let Some(found) = patterns.classify(label) else {
            continue;
        };
        match found.qualifier {
            StandardQualifier::Cone => running = None,
            StandardQualifier::Base => {
                running.get_or_insert(found.number);
            }
            StandardQualifier::Check => {}
        }
        standards.push(StandardRecord {
            label: (*label).to_owned(),
            number: found.number,
            qualifier: found.qualifier,
            position,
            reference: running,
        });
    }

    let segments = if standards.len() < 2 {
        whole_run(&labels)
    } else {
        standards
            .windows(2)
            .enumerate()
            .map(|(index, pair)| DriftSegment {
                index,
                start: pair[0].position,
                end: pair[1].position,
                start_label: pair[0].label.clone(),
                end_label: pair[1].label.clone(),
                length: pair[1].position - pair[0].position + 1,
                starts_run: pair[0].qualifier == StandardQualifier::Cone,
                reference: pair[0].reference,
            })
            .collect()
    };

    debug!(
        "detected {} standards and {} segments over {} rows",
        standards.len(),
        segments.len(),
        labels.len()
    );

    SegmentDetection {
        standards,
        segments,
    }
}

fn whole_run(labels: &[&str]) -> Vec<DriftSegment> {
    match (labels.first(), labels.last()) {
        (Some(first), Some(last)) => vec![DriftSegment {
            index: 0,
            start: 0,
            end: labels.len() - 1,
            start_label: (*first).to_owned(),
            end_label: (*last).to_owned(),
            length: labels.len(),
            starts_run: false,
            reference: None,
        }],
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{detect_segments, SegmentPatterns};
    use crate::standards::StandardQualifier;

    fn patterns() -> SegmentPatterns {
        SegmentPatterns::new("^RM", None, "RM").unwrap()
    }

    #[test]
    fn two_standards_bound_a_single_segment() {
        let detection = detect_segments(["RM1", "S1", "S2", "RM2"], &patterns());

        assert_eq!(detection.standards.len(), 2);
        assert_eq!(detection.segments.len(), 1);
        let segment = &detection.segments[0];
        assert_eq!((segment.start, segment.end), (0, 3));
        assert_eq!(segment.length, 4);
        assert_eq!(segment.start_label, "RM1");
        assert_eq!(segment.end_label, "RM2");
    }

    #[test]
    fn consecutive_standards_form_consecutive_segments() {
        let labels = ["RM1", "S1", "RM1", "S2", "S3", "RM1"];
        let detection = detect_segments(labels, &patterns());

        let bounds = detection
            .segments
            .iter()
            .map(|s| (s.start, s.end))
            .collect::<Vec<_>>();
        assert_eq!(bounds, vec![(0, 2), (2, 5)]);
    }

    #[test]
    fn cone_standards_clear_the_running_reference() {
        let patterns = SegmentPatterns::new("^RM", Some("^CONE"), "RM").unwrap();
        let labels = ["RM4", "S1", "Cone 1", "S2", "RM5", "S3", "RM4 check"];
        let detection = detect_segments(labels, &patterns);

        let qualifiers = detection
            .standards
            .iter()
            .map(|s| (s.qualifier, s.reference))
            .collect::<Vec<_>>();
        assert_eq!(
            qualifiers,
            vec![
                (StandardQualifier::Base, Some(4)),
                (StandardQualifier::Cone, None),
                (StandardQualifier::Base, Some(5)),
                (StandardQualifier::Check, Some(5)),
            ]
        );
        assert!(detection.segments[1].starts_run);
        assert!(!detection.segments[0].starts_run);
    }

    #[test]
    fn crm_family_labels_act_as_standards() {
        let detection =
            detect_segments(["OREAS 258", "S1", "STD BLANK", "S2", "CRM 252"], &patterns());
        let positions = detection
            .standards
            .iter()
            .map(|s| s.position)
            .collect::<Vec<_>>();
        assert_eq!(positions, vec![0, 4]);
    }

    #[test]
    fn empty_runs_have_no_segments() {
        let detection = detect_segments(Vec::<&str>::new(), &patterns());
        assert!(detection.segments.is_empty());
    }

    proptest! {
        #[test]
        fn runs_with_fewer_than_two_standards_span_the_whole_sequence(
            n in 1usize..50,
            standard_at in proptest::option::of(0usize..50),
        ) {
            let labels = (0..n)
                .map(|ii| if Some(ii) == standard_at { "RM1".to_owned() } else { format!("S{ii}") })
                .collect::<Vec<_>>();
            let detection = detect_segments(labels.iter().map(String::as_str), &patterns());

            prop_assert_eq!(detection.segments.len(), 1);
            prop_assert_eq!(detection.segments[0].start, 0);
            prop_assert_eq!(detection.segments[0].end, n - 1);
        }
    }
}
