//! Incremental filter: select the fetched items that are newer than the cursor.

use crate::models::SyncItem;

/// Stable sort into canonical newest-first order.
///
/// Upstream order is never trusted; every batch passes through here before filtering.
pub fn sort_descending(items: &mut [SyncItem]) {
    items.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
}

/// Walk `candidates` (newest first) and keep items strictly newer than `boundary`.
///
/// The walk stops, excluding the current candidate, at the first item with the same
/// identity as the boundary (previously synced territory) or whose timestamp is not
/// strictly greater than the boundary's. Candidates carrying an adapter key never match
/// a boundary read back from the destination, so only the time rule bounds them.
///
/// A structurally invalid candidate also ends the walk and whatever was accumulated is
/// returned. Completeness is traded for availability here: the truncated tail is not
/// lost, because the cursor only advances to what was committed and the tail is
/// fetched again on the next run.
///
/// Without a boundary (first run) every candidate is returned.
#[tracing::instrument(level = "debug", skip_all, fields(candidates = candidates.len()))]
pub fn collect_until(candidates: &[SyncItem], boundary: Option<&SyncItem>) -> Vec<SyncItem> {
    let Some(boundary) = boundary else {
        return candidates.to_vec();
    };

    let mut out = Vec::new();
    for (index, item) in candidates.iter().enumerate() {
        if let Err(e) = item.validate() {
            tracing::error!(
                source_type = %item.source_type,
                index,
                key = %item.natural_key(),
                error = %e,
                "unexpected item while collecting; truncating batch here"
            );
            break;
        }
        if item.same_identity(boundary) {
            break;
        }
        if item.timestamp_ms <= boundary.timestamp_ms {
            break;
        }
        out.push(item.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(ts: i64, url: &str) -> SyncItem {
        SyncItem::new("Bluesky", format!("post {ts}"), ts).with_url(url)
    }

    #[test]
    fn no_boundary_is_identity_on_sorted_input() {
        let mut items = vec![item(1_000, "a"), item(3_000, "c"), item(2_000, "b")];
        sort_descending(&mut items);
        let out = collect_until(&items, None);
        assert_eq!(out, items);
        assert_eq!(
            out.iter().map(|i| i.timestamp_ms).collect::<Vec<_>>(),
            vec![3_000, 2_000, 1_000]
        );
    }

    #[test]
    fn stops_at_identical_boundary_item() {
        let items = vec![item(4_000, "d"), item(3_000, "c"), item(2_000, "b")];
        let boundary = item(3_000, "c");
        let out = collect_until(&items, Some(&boundary));
        assert_eq!(out, vec![item(4_000, "d")]);
    }

    #[test]
    fn stops_at_identity_match_even_if_newer() {
        // Edited upstream item re-timestamped after the cursor was taken.
        let items = vec![item(5_000, "e"), item(4_500, "c"), item(4_000, "d")];
        let boundary = item(3_000, "c");
        let out = collect_until(&items, Some(&boundary));
        assert_eq!(out, vec![item(5_000, "e")]);
    }

    #[test]
    fn stops_at_first_not_newer_item() {
        let items = vec![item(4_000, "d"), item(3_000, "x"), item(1_000, "a")];
        let boundary = item(3_000, "c");
        assert_eq!(collect_until(&items, Some(&boundary)), vec![item(4_000, "d")]);
    }

    #[test]
    fn invalid_item_truncates_instead_of_failing() {
        let items = vec![
            item(5_000, "e"),
            SyncItem::new("Bluesky", "broken", 0),
            item(4_000, "d"),
        ];
        let boundary = item(1_000, "a");
        assert_eq!(collect_until(&items, Some(&boundary)), vec![item(5_000, "e")]);
    }

    #[test]
    fn keyed_items_at_a_shared_url_are_bounded_by_time_only() {
        let place = "https://www.google.com/maps?q=35.6812,139.7671";
        let point = |ts: i64| {
            SyncItem::new("Location", "home", ts)
                .with_url(place)
                .with_key(format!("{ts}-35.6812-139.7671"))
        };
        let boundary = SyncItem::new("Location", "home", 10_000).with_url(place);
        let candidates = vec![point(11_800), point(11_000), point(10_000)];
        let out = collect_until(&candidates, Some(&boundary));
        assert_eq!(out, vec![point(11_800), point(11_000)]);
    }

    #[test]
    fn sort_is_stable_for_equal_timestamps() {
        let mut items = vec![item(1_000, "first"), item(1_000, "second")];
        sort_descending(&mut items);
        assert_eq!(items[0].url.as_deref(), Some("first"));
    }
}
