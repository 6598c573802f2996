//! Accept-header content negotiation
//!
//! Every endpoint negotiates its response body over a small list of offered
//! media types. An absent, empty, or unparseable `Accept` header selects the
//! endpoint's default; an `Accept` header that matches none of the offers
//! yields no selection and the handler decides between 404 and 406.

use std::str::FromStr;

use mime::Mime;

/// Pick the best offer for an `Accept` header
///
/// Quality values are honored; among offers of equal quality the one listed
/// first wins, so callers order their offer lists by preference. Wildcard
/// ranges (`*/*`, `text/*`) match accordingly and `q=0` excludes a range.
///
/// Returns `None` when the header parsed to a non-empty list of ranges and
/// none of them match an offer.
pub fn negotiate(header: Option<&str>, offers: &[&str], default: &str) -> Option<String> {
    let ranges = header.map(parse_accept).unwrap_or_default();
    if ranges.is_empty() {
        return Some(default.to_owned());
    }

    let mut best: Option<(&str, f32)> = None;
    for offer in offers {
        let Ok(offered) = Mime::from_str(offer) else {
            continue;
        };
        let quality = ranges
            .iter()
            .filter(|(range, _)| range_matches(range, &offered))
            .map(|(_, quality)| *quality)
            .fold(0.0_f32, f32::max);
        if quality > 0.0 && best.is_none_or(|(_, current)| quality > current) {
            best = Some((offer, quality));
        }
    }

    best.map(|(offer, _)| (*offer).to_owned())
}

/// Parse an `Accept` header into media ranges with quality values
///
/// Unparseable entries are dropped; an entirely unparseable header therefore
/// behaves like an absent one.
fn parse_accept(header: &str) -> Vec<(Mime, f32)> {
    header
        .split(',')
        .filter_map(|entry| {
            let range = Mime::from_str(entry.trim()).ok()?;
            let quality = range
                .get_param("q")
                .and_then(|q| q.as_str().parse::<f32>().ok())
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);
            Some((range, quality))
        })
        .collect()
}

/// Whether a client media range accepts an offered concrete type
fn range_matches(range: &Mime, offered: &Mime) -> bool {
    (range.type_() == mime::STAR || range.type_() == offered.type_())
        && (range.subtype() == mime::STAR || range.subtype() == offered.subtype())
}

#[cfg(test)]
mod tests {
    use super::negotiate;

    const MAIL_OFFERS: &[&str] = &["text/plain", "application/json", "message/rfc822"];

    #[test]
    fn absent_or_empty_header_selects_the_default() {
        for header in [None, Some(""), Some("   ")] {
            assert_eq!(
                negotiate(header, MAIL_OFFERS, "application/json").as_deref(),
                Some("application/json")
            );
        }
    }

    #[test]
    fn unmatched_header_yields_no_selection() {
        assert_eq!(negotiate(Some("none/plain"), MAIL_OFFERS, "application/json"), None);
    }

    #[test]
    fn wildcard_prefers_the_first_offer() {
        assert_eq!(
            negotiate(Some("*/*"), MAIL_OFFERS, "application/json").as_deref(),
            Some("text/plain")
        );
        assert_eq!(
            negotiate(Some("text/*"), MAIL_OFFERS, "application/json").as_deref(),
            Some("text/plain")
        );
    }

    #[test]
    fn quality_values_reorder_offers() {
        assert_eq!(
            negotiate(
                Some("text/plain;q=0.5, application/json"),
                MAIL_OFFERS,
                "application/json"
            )
            .as_deref(),
            Some("application/json")
        );
    }

    #[test]
    fn zero_quality_excludes_a_range() {
        assert_eq!(
            negotiate(Some("text/plain;q=0"), MAIL_OFFERS, "application/json"),
            None
        );
    }

    #[test]
    fn exact_type_wins_over_later_offers() {
        assert_eq!(
            negotiate(Some("message/rfc822"), MAIL_OFFERS, "application/json").as_deref(),
            Some("message/rfc822")
        );
    }
}
