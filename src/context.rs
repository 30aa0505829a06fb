//! Context interval algebra.
//!
//! A context is a half-open interval `[begin, end)` of reverse-order
//! histories compared lexicographically, parsed from patterns of the form
//! `"b1 b2 ... : e1 e2 ..."`. Histories are right-padded with the back-off
//! label up to `hi_order - 1` before comparison.

use std::io::{BufRead, Write};

use crate::{Error, Label};

/// One half-open interval of reverse histories.
#[derive(Debug, Clone, PartialEq)]
pub struct NGramContext {
    /// Reverse-order begin boundary, padded to `hi_order - 1`.
    begin: Vec<Label>,
    /// Reverse-order end boundary, padded to `hi_order - 1`.
    end: Vec<Label>,
    hi_order: usize,
}

impl NGramContext {
    /// Builds a context from boundary label vectors given in natural
    /// (oldest-first) order, as they appear in a pattern.
    pub fn new(mut begin: Vec<Label>, mut end: Vec<Label>, hi_order: usize) -> Result<Self, Error> {
        if begin.is_empty() && end.is_empty() {
            return Ok(NGramContext {
                begin,
                end,
                hi_order,
            });
        }
        begin.reverse();
        end.reverse();
        let mut hi_order = hi_order;
        if begin.len() >= hi_order {
            hi_order = begin.len() + 1;
        }
        if end.len() >= hi_order {
            hi_order = end.len() + 1;
        }
        begin.resize(hi_order - 1, 0);
        end.resize(hi_order - 1, 0);
        if begin >= end {
            return Err(Error::BadContextInterval);
        }
        Ok(NGramContext {
            begin,
            end,
            hi_order,
        })
    }

    /// Parses `"b1 b2 ... : e1 e2 ..."`; an empty pattern is the null
    /// context accepting everything.
    pub fn from_pattern(pattern: &str, hi_order: usize) -> Result<Self, Error> {
        if pattern.trim().is_empty() {
            return Self::new(Vec::new(), Vec::new(), hi_order);
        }
        let parts: Vec<&str> = pattern.split(':').collect();
        if parts.len() != 2 {
            return Err(Error::BadContextInterval);
        }
        let parse = |side: &str| -> Result<Vec<Label>, Error> {
            side.split_whitespace()
                .map(|tok| tok.parse::<Label>().map_err(|_| Error::BadContextInterval))
                .collect()
        };
        Self::new(parse(parts[0])?, parse(parts[1])?, hi_order)
    }

    pub fn null_context(&self) -> bool {
        self.begin.is_empty() && self.end.is_empty()
    }

    pub fn hi_order(&self) -> usize {
        self.hi_order
    }

    pub fn set_hi_order(&mut self, hi_order: usize) {
        if self.null_context() || hi_order <= self.hi_order {
            self.hi_order = self.hi_order.max(hi_order);
            return;
        }
        self.hi_order = hi_order;
        self.begin.resize(hi_order - 1, 0);
        self.end.resize(hi_order - 1, 0);
    }

    /// Reverse-order begin boundary.
    pub fn reverse_begin(&self) -> &[Label] {
        &self.begin
    }

    /// Reverse-order end boundary.
    pub fn reverse_end(&self) -> &[Label] {
        &self.end
    }

    /// The interval as a parseable `"b1 ... : e1 ..."` pattern, with the
    /// back-off padding stripped.
    pub fn pattern(&self) -> String {
        let side = |labels: &[Label]| -> String {
            labels
                .iter()
                .rev()
                .skip_while(|&&label| label == 0)
                .map(|label| label.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        format!("{} : {}", side(&self.begin), side(&self.end))
    }

    /// Membership test for a reverse-order n-gram (most recent label first).
    ///
    /// The n-gram is implicitly padded with the back-off label up to
    /// `hi_order - 1`. With `include_all_suffixes` set, the begin comparison
    /// is truncated to the n-gram's own length so that shorter suffix
    /// histories of in-context states are also accepted.
    pub fn has_context(&self, ngram: &[Label], include_all_suffixes: bool) -> bool {
        if self.null_context() {
            return true;
        }
        let len = self.hi_order - 1;
        let padded: Vec<Label> = (0..len)
            .map(|i| ngram.get(i).copied().unwrap_or(0))
            .collect();
        // Truncating the begin comparison to the n-gram's own length lets
        // the shorter suffixes of in-context states match as well.
        let begin_len = if include_all_suffixes {
            ngram.len().min(self.begin.len())
        } else {
            self.begin.len()
        };
        let less_begin = padded.iter().lt(self.begin[..begin_len].iter());
        let less_end = padded.iter().lt(self.end.iter());
        !less_begin && less_end
    }
}

/// Sorted, non-overlapping sequence of context intervals.
#[derive(Debug, Clone, Default)]
pub struct NGramExtendedContext {
    contexts: Vec<NGramContext>,
}

impl NGramExtendedContext {
    /// Builds from parsed intervals: sorts them by reverse begin boundary,
    /// widens all to a shared `hi_order`, and rejects overlaps. With
    /// `merge_contexts`, runs of intervals where one's end boundary meets
    /// the next's begin boundary collapse into a single interval. A single
    /// null context collapses to the empty (accept-all) set.
    pub fn new(mut contexts: Vec<NGramContext>, merge_contexts: bool) -> Result<Self, Error> {
        contexts.sort_by(|a, b| a.begin.cmp(&b.begin));
        if contexts.is_empty() || (contexts.len() == 1 && contexts[0].null_context()) {
            return Ok(NGramExtendedContext {
                contexts: Vec::new(),
            });
        }
        let hi_order = contexts.iter().map(|c| c.hi_order).max().unwrap_or(1);
        for context in contexts.iter_mut() {
            if context.null_context() {
                tracing::warn!("null context inside an extended context set");
                return Err(Error::OverlappingContexts);
            }
            context.set_hi_order(hi_order);
        }
        for pair in contexts.windows(2) {
            if pair[1].begin < pair[0].end {
                return Err(Error::OverlappingContexts);
            }
        }
        if merge_contexts {
            let mut merged: Vec<NGramContext> = Vec::with_capacity(contexts.len());
            for context in contexts {
                match merged.last_mut() {
                    Some(prev) if prev.end == context.begin => prev.end = context.end,
                    _ => merged.push(context),
                }
            }
            contexts = merged;
        }
        Ok(NGramExtendedContext { contexts })
    }

    /// Parses a comma-separated list of patterns.
    pub fn from_patterns(
        patterns: &str,
        hi_order: usize,
        merge_contexts: bool,
    ) -> Result<Self, Error> {
        let contexts = patterns
            .split(',')
            .filter(|p| !p.trim().is_empty())
            .map(|p| NGramContext::from_pattern(p, hi_order))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(contexts, merge_contexts)
    }

    pub fn contexts(&self) -> &[NGramContext] {
        &self.contexts
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn has_context(&self, ngram: &[Label], include_all_suffixes: bool) -> bool {
        self.contexts.is_empty() || self.get_context(ngram, include_all_suffixes).is_some()
    }

    /// Index of the interval containing the reverse-order n-gram, located
    /// with an upper-bound probe over the sorted begin boundaries.
    pub fn get_context(&self, ngram: &[Label], include_all_suffixes: bool) -> Option<usize> {
        if self.contexts.is_empty() {
            return None;
        }
        let len = self.contexts[0].hi_order - 1;
        let mut probe: Vec<Label> = ngram.iter().copied().take(len).collect();
        probe.resize(len, 0);
        // upper_bound: first interval whose begin is > probe
        let upper = self.contexts.partition_point(|c| c.begin <= probe);
        if upper > 0 && self.contexts[upper - 1].has_context(ngram, include_all_suffixes) {
            return Some(upper - 1);
        }
        if include_all_suffixes
            && upper < self.contexts.len()
            && self.contexts[upper].has_context(ngram, include_all_suffixes)
        {
            return Some(upper);
        }
        None
    }
}

/// Reads one context pattern per line.
pub fn read_contexts<R: BufRead>(reader: R) -> Result<Vec<String>, Error> {
    let mut patterns = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            patterns.push(line);
        }
    }
    Ok(patterns)
}

pub fn write_contexts<W: Write>(writer: &mut W, patterns: &[String]) -> Result<(), Error> {
    for pattern in patterns {
        writeln!(writer, "{pattern}")?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_and_pads() {
        let ctx = NGramContext::from_pattern("1 2 : 3", 4).unwrap();
        assert_eq!(ctx.reverse_begin(), &[2, 1, 0]);
        assert_eq!(ctx.reverse_end(), &[3, 0, 0]);
    }

    #[test]
    fn rejects_empty_interval() {
        assert!(matches!(
            NGramContext::from_pattern("2 : 2", 3),
            Err(Error::BadContextInterval)
        ));
        assert!(matches!(
            NGramContext::from_pattern("3 : 2", 3),
            Err(Error::BadContextInterval)
        ));
    }

    #[test]
    fn widens_order_for_long_patterns() {
        let ctx = NGramContext::from_pattern("1 2 3 : 4", 2).unwrap();
        assert_eq!(ctx.hi_order(), 4);
        assert_eq!(ctx.reverse_begin(), &[3, 2, 1]);
    }

    #[test]
    fn membership_is_half_open() {
        let ctx = NGramContext::from_pattern("1 : 2", 2).unwrap();
        assert!(ctx.has_context(&[1], false));
        assert!(!ctx.has_context(&[2], false));
        assert!(!ctx.has_context(&[0], false));
    }

    #[test]
    fn null_context_accepts_everything() {
        let ctx = NGramContext::from_pattern("", 3).unwrap();
        assert!(ctx.has_context(&[5, 6], false));
        assert!(ctx.has_context(&[], false));
    }

    #[test]
    fn suffix_inclusion_truncates_begin() {
        // Interval [ (2 1), (3) ) at hi_order 3.
        let ctx = NGramContext::from_pattern("1 2 : 3", 3).unwrap();
        // The history (2) alone is below (2 1) in strict comparison but is
        // a suffix of in-context histories.
        assert!(!ctx.has_context(&[2], false));
        assert!(ctx.has_context(&[2], true));
        assert!(ctx.has_context(&[2, 1], false));
        assert!(ctx.has_context(&[2, 5], false));
    }

    #[test]
    fn extended_rejects_overlap() {
        let a = NGramContext::from_pattern("1 : 3", 2).unwrap();
        let b = NGramContext::from_pattern("2 : 4", 2).unwrap();
        assert!(matches!(
            NGramExtendedContext::new(vec![a, b], false),
            Err(Error::OverlappingContexts)
        ));
        // Overlap is an error with merging too; only touching boundaries
        // collapse.
        let a = NGramContext::from_pattern("1 : 3", 2).unwrap();
        let b = NGramContext::from_pattern("2 : 4", 2).unwrap();
        assert!(matches!(
            NGramExtendedContext::new(vec![a, b], true),
            Err(Error::OverlappingContexts)
        ));
    }

    #[test]
    fn extended_locates_interval() {
        let ext = NGramExtendedContext::from_patterns("1 : 2, 2 : 4", 2, false).unwrap();
        assert_eq!(ext.get_context(&[1], false), Some(0));
        assert_eq!(ext.get_context(&[2], false), Some(1));
        assert_eq!(ext.get_context(&[3], false), Some(1));
        assert_eq!(ext.get_context(&[4], false), None);
        assert!(ext.has_context(&[3], false));
        assert!(!ext.has_context(&[7], false));
    }

    #[test]
    fn touching_intervals_merge_into_one() {
        let ext = NGramExtendedContext::from_patterns("1 : 2, 2 : 4, 4 : 6", 2, true).unwrap();
        assert_eq!(ext.contexts().len(), 1);
        assert_eq!(ext.contexts()[0].reverse_begin(), &[1]);
        assert_eq!(ext.contexts()[0].reverse_end(), &[6]);
        assert_eq!(ext.get_context(&[1], false), Some(0));
        assert_eq!(ext.get_context(&[5], false), Some(0));
        assert_eq!(ext.get_context(&[6], false), None);
    }

    #[test]
    fn merging_leaves_gapped_intervals_alone() {
        let ext = NGramExtendedContext::from_patterns("1 : 2, 3 : 4", 2, true).unwrap();
        assert_eq!(ext.contexts().len(), 2);
        assert_eq!(ext.get_context(&[2], false), None);
        assert_eq!(ext.get_context(&[3], false), Some(1));
    }

    #[test]
    fn pattern_round_trips() {
        let ctx = NGramContext::from_pattern("1 2 : 3", 4).unwrap();
        assert_eq!(ctx.pattern(), "1 2 : 3");
        let back = NGramContext::from_pattern(&ctx.pattern(), 4).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn context_file_round_trip() {
        let patterns = vec!["1 : 2".to_string(), "2 : 4".to_string()];
        let mut buf = Vec::new();
        write_contexts(&mut buf, &patterns).unwrap();
        let back = read_contexts(buf.as_slice()).unwrap();
        assert_eq!(patterns, back);
    }
}
