//! Range-selection policy: the destination-side decision core.
//!
//! For each table the destination keeps a cursor that advances monotonically
//! from the start of the key space to the end. Every source reply carries a
//! hash (and row count) over a range starting at the cursor; this module
//! compares it with the destination's own hash and chooses the next
//! exchange:
//!
//! - hashes match → skip the range, probe the next block at twice the row
//!   count (the source's byte budget caps the growth);
//! - hashes differ over more than a row or two → subdivide, asking the
//!   source to hash the first half of the range's rows;
//! - hashes differ over a range either side estimates at one row or less →
//!   have the source send the rows themselves.
//!
//! Subdivision bookkeeping lives entirely here: `Outstanding` records the
//! outermost upper bound still unresolved and, where known, the source row
//! count between the cursor and the inner extent being bisected. The wire
//! protocol's `failed_last_key` fields always echo bounds this module chose,
//! so the responder stays stateless.

use crate::core::key::{upper_bound_lt, Key};
use crate::error::{Result, SyncError};

/// Next exchange chosen by the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Request a hash of `(prev, last]`, at most `row_limit` rows
    /// (0 = bounded by the source's byte budget only).
    RequestHash { prev: Key, last: Key, row_limit: u64 },
    /// Request the authoritative rows of `(prev, last]`.
    RequestRows { prev: Key, last: Key },
    /// The table is fully reconciled; no further message.
    TableComplete,
}

/// Unresolved region beyond the cursor.
#[derive(Debug, Clone)]
struct Outstanding {
    /// Outermost upper bound still to be resolved (empty = end of table).
    bound: Key,
    /// Extent within `bound` whose source row count is known.
    extent: Key,
    /// Source rows between the cursor and `extent`, when known.
    rows_to_extent: Option<u64>,
}

/// Per-(worker, table) policy state.
#[derive(Debug)]
pub struct RangeSelector {
    cursor: Key,
    outstanding: Option<Outstanding>,
}

impl RangeSelector {
    /// Fresh state with the cursor before the first row.
    pub fn new() -> Self {
        Self { cursor: Key::new(), outstanding: None }
    }

    /// Current cursor (verified-equal up to this key).
    pub fn cursor(&self) -> &Key {
        &self.cursor
    }

    /// Handle a hash reply over `(prev, last]` with the source's row count,
    /// given the destination's own hash and count over the same range.
    pub fn on_hash_reply(
        &mut self,
        prev: &Key,
        last: &Key,
        src_count: u64,
        src_hash: &[u8],
        own_hash: &[u8],
        own_count: u64,
    ) -> Result<Decision> {
        self.expect_cursor(prev)?;

        if src_hash == own_hash {
            self.cursor = last.clone();
            return Ok(self.advance_after_match(last, src_count));
        }

        // Mismatch: the difference lies within (prev, bound].
        let bound = match self.outstanding.take() {
            Some(out) => out.bound,
            None => last.clone(),
        };
        if src_count <= 1 || own_count <= 1 {
            // No point subdividing a range either side reads as a row or
            // less; fetch the whole unresolved region.
            return Ok(Decision::RequestRows { prev: prev.clone(), last: bound });
        }
        let row_limit = src_count.div_ceil(2);
        self.outstanding = Some(Outstanding {
            bound,
            extent: last.clone(),
            rows_to_extent: Some(src_count),
        });
        Ok(Decision::RequestHash { prev: prev.clone(), last: last.clone(), row_limit })
    }

    /// Handle a plain rows reply covering `(prev, last]`.
    pub fn on_rows_reply(&mut self, prev: &Key, last: &Key) -> Result<Decision> {
        self.expect_cursor(prev)?;
        self.cursor = last.clone();
        self.outstanding = None;
        if last.is_empty() {
            return Ok(Decision::TableComplete);
        }
        // Our responder always extends or combines instead, but a plain
        // bounded rows reply is well-formed: resume probing after it.
        Ok(Decision::RequestHash { prev: last.clone(), last: Key::new(), row_limit: 0 })
    }

    /// Handle a combined reply: rows over `(rows_prev, rows_last]` plus a
    /// hash over `(rows_last, next]`, with `failed` carrying the requested
    /// extent when the row payload was clamped short of it.
    ///
    /// Only the decision happens here; the caller sends the chosen command
    /// before applying the delivered rows (see spec pipelining note).
    #[allow(clippy::too_many_arguments)]
    pub fn on_combined_reply(
        &mut self,
        rows_prev: &Key,
        rows_last: &Key,
        next: &Key,
        failed: Option<&Key>,
        src_count: u64,
        src_hash: &[u8],
        own_hash: &[u8],
        own_count: u64,
    ) -> Result<Decision> {
        self.expect_cursor(rows_prev)?;
        // The delivered rows make (rows_prev, rows_last] equal by fiat.
        self.cursor = rows_last.clone();
        self.outstanding = failed.map(|f| Outstanding {
            bound: f.clone(),
            extent: f.clone(),
            rows_to_extent: None,
        });
        self.on_hash_reply(rows_last, next, src_count, src_hash, own_hash, own_count)
    }

    fn advance_after_match(&mut self, last: &Key, src_count: u64) -> Decision {
        match self.outstanding.take() {
            Some(out) if upper_bound_lt(last, &out.bound) => {
                if upper_bound_lt(last, &out.extent) {
                    // The matched range was a prefix of the counted extent,
                    // so the remainder up to the extent is known to differ.
                    let remainder = out.rows_to_extent.and_then(|n| n.checked_sub(src_count));
                    match remainder {
                        Some(r) if r <= 1 => {
                            Decision::RequestRows { prev: last.clone(), last: out.bound }
                        }
                        Some(r) => {
                            let row_limit = r.div_ceil(2);
                            let extent = out.extent.clone();
                            self.outstanding = Some(Outstanding {
                                bound: out.bound,
                                extent: extent.clone(),
                                rows_to_extent: Some(r),
                            });
                            Decision::RequestHash { prev: last.clone(), last: extent, row_limit }
                        }
                        None => self.probe_whole_region(last, out.bound),
                    }
                } else {
                    // Counted knowledge is exhausted; the rest of the region
                    // may or may not differ. Hash it whole.
                    self.probe_whole_region(last, out.bound)
                }
            }
            _ => {
                // Nothing left outstanding.
                if last.is_empty() {
                    Decision::TableComplete
                } else {
                    // Doubling on agreement; the source's byte budget is the
                    // ceiling, so an unbounded extent is safe. A zero-row
                    // match leaves sizing to the byte budget alone.
                    Decision::RequestHash {
                        prev: last.clone(),
                        last: Key::new(),
                        row_limit: src_count.saturating_mul(2),
                    }
                }
            }
        }
    }

    fn probe_whole_region(&mut self, from: &Key, bound: Key) -> Decision {
        self.outstanding = Some(Outstanding {
            bound: bound.clone(),
            extent: bound.clone(),
            rows_to_extent: None,
        });
        Decision::RequestHash { prev: from.clone(), last: bound, row_limit: 0 }
    }

    fn expect_cursor(&self, prev: &Key) -> Result<()> {
        if *prev != self.cursor {
            return Err(SyncError::protocol(format!(
                "reply range starts at {:?} but cursor is at {:?}",
                prev, self.cursor
            )));
        }
        Ok(())
    }
}

impl Default for RangeSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn key(n: i64) -> Key {
        vec![Value::Int(n)]
    }

    const A: &[u8] = b"aaaa";
    const B: &[u8] = b"bbbb";

    #[test]
    fn test_match_doubles_and_advances() {
        let mut sel = RangeSelector::new();
        let decision = sel.on_hash_reply(&Key::new(), &key(10), 4, A, A, 4).unwrap();
        assert_eq!(sel.cursor(), &key(10));
        assert_eq!(
            decision,
            Decision::RequestHash { prev: key(10), last: Key::new(), row_limit: 8 }
        );
    }

    #[test]
    fn test_match_at_end_completes_table() {
        let mut sel = RangeSelector::new();
        let decision = sel.on_hash_reply(&Key::new(), &Key::new(), 5, A, A, 5).unwrap();
        assert_eq!(decision, Decision::TableComplete);
    }

    #[test]
    fn test_mismatch_subdivides_by_half_the_count() {
        let mut sel = RangeSelector::new();
        let decision = sel.on_hash_reply(&Key::new(), &key(10), 5, A, B, 5).unwrap();
        assert_eq!(
            decision,
            Decision::RequestHash { prev: Key::new(), last: key(10), row_limit: 3 }
        );
        assert_eq!(sel.cursor(), &Key::new());
    }

    #[test]
    fn test_single_row_mismatch_requests_rows() {
        let mut sel = RangeSelector::new();
        let decision = sel.on_hash_reply(&Key::new(), &key(10), 1, A, B, 1).unwrap();
        assert_eq!(decision, Decision::RequestRows { prev: Key::new(), last: key(10) });
    }

    #[test]
    fn test_empty_destination_requests_rows_immediately() {
        let mut sel = RangeSelector::new();
        // Source has many rows, we have none: no subdivision will help.
        let decision = sel.on_hash_reply(&Key::new(), &Key::new(), 1000, A, B, 0).unwrap();
        assert_eq!(decision, Decision::RequestRows { prev: Key::new(), last: Key::new() });
    }

    #[test]
    fn test_matched_half_narrows_to_remainder() {
        let mut sel = RangeSelector::new();
        // Whole range of 4 rows mismatches: subdivide.
        let d1 = sel.on_hash_reply(&Key::new(), &key(8), 4, A, B, 4).unwrap();
        assert_eq!(d1, Decision::RequestHash { prev: Key::new(), last: key(8), row_limit: 2 });

        // First half (2 rows, clamped at key 4) matches: remainder has
        // 4 - 2 = 2 rows and is known to differ, so it gets subdivided.
        let d2 = sel.on_hash_reply(&Key::new(), &key(4), 2, A, A, 2).unwrap();
        assert_eq!(sel.cursor(), &key(4));
        assert_eq!(d2, Decision::RequestHash { prev: key(4), last: key(8), row_limit: 1 });
    }

    #[test]
    fn test_matched_half_with_one_row_remainder_requests_rows() {
        let mut sel = RangeSelector::new();
        let d1 = sel.on_hash_reply(&Key::new(), &key(8), 3, A, B, 3).unwrap();
        assert_eq!(d1, Decision::RequestHash { prev: Key::new(), last: key(8), row_limit: 2 });

        let d2 = sel.on_hash_reply(&Key::new(), &key(4), 2, A, A, 2).unwrap();
        assert_eq!(d2, Decision::RequestRows { prev: key(4), last: key(8) });
    }

    #[test]
    fn test_mismatched_half_keeps_outer_bound_for_rows() {
        let mut sel = RangeSelector::new();
        let d1 = sel.on_hash_reply(&Key::new(), &key(8), 4, A, B, 4).unwrap();
        assert_eq!(d1, Decision::RequestHash { prev: Key::new(), last: key(8), row_limit: 2 });

        // First half also mismatches with counts at the threshold: the rows
        // request spans the whole unresolved region up to key 8.
        let d2 = sel.on_hash_reply(&Key::new(), &key(4), 1, A, B, 1).unwrap();
        assert_eq!(d2, Decision::RequestRows { prev: Key::new(), last: key(8) });
    }

    #[test]
    fn test_combined_reply_advances_over_rows_then_decides() {
        let mut sel = RangeSelector::new();
        // Rows delivered for ([], 4]; hash for (4, 9] matches.
        let decision = sel
            .on_combined_reply(&Key::new(), &key(4), &key(9), None, 3, A, A, 3)
            .unwrap();
        assert_eq!(sel.cursor(), &key(9));
        assert_eq!(
            decision,
            Decision::RequestHash { prev: key(9), last: Key::new(), row_limit: 6 }
        );
    }

    #[test]
    fn test_combined_fail_reply_probes_remaining_region() {
        let mut sel = RangeSelector::new();
        // Rows delivered for ([], 4]; hash for (4, 9] matches but the
        // requested extent ran to key 20.
        let decision = sel
            .on_combined_reply(&Key::new(), &key(4), &key(9), Some(&key(20)), 3, A, A, 3)
            .unwrap();
        assert_eq!(
            decision,
            Decision::RequestHash { prev: key(9), last: key(20), row_limit: 0 }
        );
    }

    #[test]
    fn test_reply_not_at_cursor_is_protocol_error() {
        let mut sel = RangeSelector::new();
        sel.on_hash_reply(&Key::new(), &key(4), 2, A, A, 2).unwrap();
        let err = sel.on_hash_reply(&Key::new(), &key(8), 2, A, A, 2);
        assert!(matches!(err, Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_rows_reply_to_end_completes() {
        let mut sel = RangeSelector::new();
        sel.on_hash_reply(&Key::new(), &Key::new(), 5, A, B, 0).unwrap();
        let decision = sel.on_rows_reply(&Key::new(), &Key::new()).unwrap();
        assert_eq!(decision, Decision::TableComplete);
    }

    #[test]
    fn test_zero_count_match_probes_by_byte_budget() {
        let mut sel = RangeSelector::new();
        let decision = sel.on_hash_reply(&Key::new(), &key(5), 0, A, A, 0).unwrap();
        assert_eq!(
            decision,
            Decision::RequestHash { prev: key(5), last: Key::new(), row_limit: 0 }
        );
    }
}
