//! Duplicate detection for candidate records.
//!
//! Keys are tried in a fixed order (email, phone, instagram, telegram,
//! website, then name within the locality). The first key that hits wins.
//! When one key hits several records the smallest id is taken, so the
//! result does not depend on the order records were loaded in.

use leadscout_shared::{CandidateRecord, Locality, PersistedRecord};
use tracing::warn;
use url::Url;

/// Minimum digits for a phone number to be usable as a match key.
const MIN_PHONE_DIGITS: usize = 6;

/// Finds the persisted record a candidate duplicates, if any.
pub trait RecordMatcher: Send + Sync {
    /// `existing` holds the records of `locality`.
    fn find_match<'a>(
        &self,
        candidate: &CandidateRecord,
        locality: &Locality,
        existing: &'a [PersistedRecord],
    ) -> Option<&'a PersistedRecord>;
}

/// Ordered identity-key matcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyMatcher;

impl RecordMatcher for KeyMatcher {
    fn find_match<'a>(
        &self,
        candidate: &CandidateRecord,
        locality: &Locality,
        existing: &'a [PersistedRecord],
    ) -> Option<&'a PersistedRecord> {
        let iso2 = locality.iso2.as_str();

        let keys: [(&str, Option<String>, KeyFn); 5] = [
            ("email", candidate.email.as_deref().and_then(normalize_email), |r, _| {
                r.email.as_deref().and_then(normalize_email)
            }),
            (
                "phone",
                candidate.phone.as_deref().and_then(|p| normalize_phone(p, iso2)),
                |r, iso2| r.phone.as_deref().and_then(|p| normalize_phone(p, iso2)),
            ),
            ("instagram", candidate.instagram.as_deref().and_then(normalize_handle), |r, _| {
                r.instagram.as_deref().and_then(normalize_handle)
            }),
            ("telegram", candidate.telegram.as_deref().and_then(normalize_handle), |r, _| {
                r.telegram.as_deref().and_then(normalize_handle)
            }),
            ("website", candidate.website.as_deref().and_then(normalize_website), |r, _| {
                r.website.as_deref().and_then(normalize_website)
            }),
        ];

        for (key, wanted, extract) in keys {
            let Some(wanted) = wanted else { continue };
            let hits = existing
                .iter()
                .filter(|r| extract(r, iso2).as_deref() == Some(wanted.as_str()));
            if let Some(found) = pick(key, hits) {
                return Some(found);
            }
        }

        let name = normalize_name(&candidate.name)?;
        let hits = existing.iter().filter(|r| {
            r.locality_id.as_deref() == Some(locality.id.as_str())
                && normalize_name(&r.name).as_deref() == Some(name.as_str())
        });
        pick("name", hits)
    }
}

type KeyFn = fn(&PersistedRecord, &str) -> Option<String>;

/// Smallest-id hit, warning when the key is ambiguous.
fn pick<'a>(
    key: &str,
    hits: impl Iterator<Item = &'a PersistedRecord>,
) -> Option<&'a PersistedRecord> {
    let mut hits: Vec<&PersistedRecord> = hits.collect();
    if hits.len() > 1 {
        warn!(
            key,
            count = hits.len(),
            "ambiguous match, using the oldest record"
        );
    }
    hits.sort_by(|a, b| a.id.cmp(&b.id));
    hits.into_iter().next()
}

// ---------------------------------------------------------------------------
// Key normalization
// ---------------------------------------------------------------------------

pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    (!email.is_empty()).then_some(email)
}

fn normalize_name(raw: &str) -> Option<String> {
    let name = raw.trim().to_lowercase();
    (!name.is_empty()).then_some(name)
}

/// Normalize a phone number to `+<country code><national number>`.
///
/// Numbers written with `+` or `00` are taken as international and work for
/// any country. Anything else is local to `iso2` and loses one trunk `0`.
/// Local numbers are only resolved for the countries in `calling_code`;
/// for any other locality they yield `None`, so the phone key is skipped and
/// matching falls through to the next key. Also `None` when too few digits
/// remain.
pub fn normalize_phone(raw: &str, iso2: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('(');
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();

    let international = if trimmed.starts_with('+') {
        Some(digits.as_str())
    } else {
        digits.strip_prefix("00")
    };

    let normalized = match international {
        Some(number) => {
            if number.len() < MIN_PHONE_DIGITS {
                return None;
            }
            format!("+{number}")
        }
        None => {
            let national = digits.strip_prefix('0').unwrap_or(&digits);
            if national.len() < MIN_PHONE_DIGITS {
                return None;
            }
            format!("+{}{national}", calling_code(iso2)?)
        }
    };
    Some(normalized)
}

/// Lowercase a social handle, dropping `@`, profile URL prefixes and any
/// trailing path or query.
pub fn normalize_handle(raw: &str) -> Option<String> {
    let mut handle = raw.trim().to_lowercase();
    for prefix in ["https://", "http://"] {
        if let Some(rest) = handle.strip_prefix(prefix) {
            handle = rest.to_string();
        }
    }
    if let Some(rest) = handle.strip_prefix("www.") {
        handle = rest.to_string();
    }
    for host in ["instagram.com/", "t.me/", "telegram.me/"] {
        if let Some(rest) = handle.strip_prefix(host) {
            handle = rest.to_string();
        }
    }

    let handle = handle
        .split(['?', '#', '/'])
        .next()
        .unwrap_or_default()
        .trim_start_matches('@')
        .trim();
    (!handle.is_empty()).then(|| handle.to_string())
}

/// Reduce a website to `host[/path][?query]` without scheme, `www.` or a
/// trailing slash.
pub fn normalize_website(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    let key = match Url::parse(&with_scheme) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default();
            let host = host.strip_prefix("www.").unwrap_or(host);
            let mut key = format!("{host}{}", url.path().trim_end_matches('/'));
            if let Some(query) = url.query() {
                key.push('?');
                key.push_str(query);
            }
            key
        }
        Err(_) => {
            let lower = raw.to_lowercase();
            let rest = lower.split_once("://").map_or(lower.as_str(), |(_, r)| r);
            let rest = rest.strip_prefix("www.").unwrap_or(rest);
            rest.trim_end_matches('/').to_string()
        }
    };
    (!key.is_empty()).then_some(key)
}

/// International calling code for an ISO 3166-1 alpha-2 country.
///
/// Covers the countries research is run for. Extend it when adding a
/// locality whose local phone numbers should become match keys.
fn calling_code(iso2: &str) -> Option<&'static str> {
    let code = match iso2.trim().to_ascii_uppercase().as_str() {
        "US" | "CA" => "1",
        "RU" | "KZ" => "7",
        "EG" => "20",
        "ZA" => "27",
        "GR" => "30",
        "NL" => "31",
        "BE" => "32",
        "FR" => "33",
        "ES" => "34",
        "HU" => "36",
        "IT" => "39",
        "RO" => "40",
        "CH" => "41",
        "AT" => "43",
        "GB" => "44",
        "DK" => "45",
        "SE" => "46",
        "NO" => "47",
        "PL" => "48",
        "DE" => "49",
        "MX" => "52",
        "AR" => "54",
        "BR" => "55",
        "AU" => "61",
        "ID" => "62",
        "NZ" => "64",
        "TH" => "66",
        "JP" => "81",
        "KR" => "82",
        "CN" => "86",
        "TR" => "90",
        "IN" => "91",
        "PT" => "351",
        "IE" => "353",
        "CY" => "357",
        "FI" => "358",
        "BG" => "359",
        "LT" => "370",
        "LV" => "371",
        "EE" => "372",
        "AM" => "374",
        "BY" => "375",
        "UA" => "380",
        "RS" => "381",
        "ME" => "382",
        "CZ" => "420",
        "AE" => "971",
        "IL" => "972",
        "AZ" => "994",
        "GE" => "995",
        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn berlin() -> Locality {
        Locality {
            id: "loc-berlin".into(),
            name: "Berlin".into(),
            country: "Germany".into(),
            iso2: "DE".into(),
        }
    }

    fn record(id: &str, name: &str) -> PersistedRecord {
        PersistedRecord {
            id: id.into(),
            name: name.into(),
            ..PersistedRecord::blank(Some("loc-berlin".into()))
        }
    }

    fn candidate(name: &str) -> CandidateRecord {
        CandidateRecord {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn email_matches_case_insensitively() {
        let mut existing = record("01", "");
        existing.email = Some("A@X.com ".into());
        let mut c = candidate("Foo");
        c.email = Some("a@x.com".into());

        let records = [existing];
        let found = KeyMatcher.find_match(&c, &berlin(), &records);
        assert_eq!(found.map(|r| r.id.as_str()), Some("01"));
    }

    #[test]
    fn email_wins_over_name() {
        let mut by_email = record("02", "Other");
        by_email.email = Some("a@x.com".into());
        let by_name = record("01", "Foo");
        let mut c = candidate("Foo");
        c.email = Some("a@x.com".into());

        let records = [by_name, by_email];
        let found = KeyMatcher.find_match(&c, &berlin(), &records);
        assert_eq!(found.map(|r| r.id.as_str()), Some("02"));
    }

    #[test]
    fn key_miss_falls_through_to_next_key() {
        let mut existing = record("01", "Unrelated");
        existing.instagram = Some("clubfoo".into());
        let mut c = candidate("Foo");
        c.email = Some("nobody@x.com".into());
        c.instagram = Some("@ClubFoo".into());

        let records = [existing];
        let found = KeyMatcher.find_match(&c, &berlin(), &records);
        assert_eq!(found.map(|r| r.id.as_str()), Some("01"));
    }

    #[test]
    fn local_and_international_phone_match() {
        let mut existing = record("01", "");
        existing.phone = Some("+49 30 1234567".into());
        let mut c = candidate("Foo");
        c.phone = Some("030 / 123 45 67".into());

        let records = [existing];
        let found = KeyMatcher.find_match(&c, &berlin(), &records);
        assert_eq!(found.map(|r| r.id.as_str()), Some("01"));
    }

    #[test]
    fn uncovered_country_skips_only_local_phone_numbers() {
        let ulaanbaatar = Locality {
            id: "loc-uln".into(),
            name: "Ulaanbaatar".into(),
            country: "Mongolia".into(),
            iso2: "MN".into(),
        };
        let existing = PersistedRecord {
            id: "01".into(),
            name: "Bar".into(),
            phone: Some("+976 11 123456".into()),
            ..PersistedRecord::blank(Some("loc-uln".into()))
        };
        let records = [existing];

        let mut international = candidate("Other");
        international.phone = Some("00976 11 123456".into());
        let found = KeyMatcher.find_match(&international, &ulaanbaatar, &records);
        assert_eq!(found.map(|r| r.id.as_str()), Some("01"));

        let mut local = candidate("Other");
        local.phone = Some("11 123456".into());
        assert!(KeyMatcher.find_match(&local, &ulaanbaatar, &records).is_none());

        local.name = "bar".into();
        let found = KeyMatcher.find_match(&local, &ulaanbaatar, &records);
        assert_eq!(found.map(|r| r.id.as_str()), Some("01"));
    }

    #[test]
    fn no_match_returns_none() {
        let existing = record("01", "Bar");
        let records = [existing];
        assert!(KeyMatcher.find_match(&candidate("Foo"), &berlin(), &records).is_none());
        assert!(KeyMatcher.find_match(&candidate("Foo"), &berlin(), &[]).is_none());
    }

    #[test]
    fn name_match_is_scoped_to_locality() {
        let mut elsewhere = record("01", "Foo");
        elsewhere.locality_id = Some("loc-rome".into());
        let records = [elsewhere];
        assert!(KeyMatcher.find_match(&candidate("foo"), &berlin(), &records).is_none());
    }

    #[test]
    fn ambiguous_key_is_deterministic_regardless_of_order() {
        let mut a = record("0190-b", "");
        a.website = Some("https://www.foo.de/".into());
        let mut b = record("0190-a", "");
        b.website = Some("http://foo.de".into());
        let mut c = candidate("Foo");
        c.website = Some("FOO.de".into());

        let forward = [a.clone(), b.clone()];
        let backward = [b, a];
        let first = KeyMatcher.find_match(&c, &berlin(), &forward).map(|r| r.id.clone());
        let second = KeyMatcher.find_match(&c, &berlin(), &backward).map(|r| r.id.clone());
        assert_eq!(first.as_deref(), Some("0190-a"));
        assert_eq!(first, second);
    }

    #[test]
    fn same_input_same_answer() {
        let mut existing = record("01", "Foo");
        existing.telegram = Some("https://t.me/foo_club".into());
        let mut c = candidate("Foo");
        c.telegram = Some("@foo_club".into());
        let records = [existing];

        let a = KeyMatcher.find_match(&c, &berlin(), &records).map(|r| r.id.clone());
        let b = KeyMatcher.find_match(&c, &berlin(), &records).map(|r| r.id.clone());
        assert_eq!(a, b);
        assert_eq!(a.as_deref(), Some("01"));
    }

    #[test]
    fn phone_normalization_rules() {
        assert_eq!(normalize_phone("+49 30 123456", "IT").as_deref(), Some("+4930123456"));
        assert_eq!(normalize_phone("0049 30 123456", "").as_deref(), Some("+4930123456"));
        assert_eq!(normalize_phone("030 123456", "DE").as_deref(), Some("+4930123456"));
        assert_eq!(normalize_phone("(+33) 1 23 45 67 89", "DE").as_deref(), Some("+33123456789"));
        // Unknown country for a local number.
        assert_eq!(normalize_phone("030 123456", "XX"), None);
        assert_eq!(normalize_phone("030 123456", ""), None);
        // Too short.
        assert_eq!(normalize_phone("112", "DE"), None);
        assert_eq!(normalize_phone("+4912", "DE"), None);
    }

    #[test]
    fn handle_normalization() {
        assert_eq!(normalize_handle("@Club.Foo").as_deref(), Some("club.foo"));
        assert_eq!(
            normalize_handle("https://www.instagram.com/club.foo/?hl=en").as_deref(),
            Some("club.foo")
        );
        assert_eq!(normalize_handle("t.me/FooBar").as_deref(), Some("foobar"));
        assert_eq!(normalize_handle(" @ "), None);
    }

    #[test]
    fn website_normalization() {
        assert_eq!(normalize_website("https://www.Foo.de/").as_deref(), Some("foo.de"));
        assert_eq!(normalize_website("foo.de/events/").as_deref(), Some("foo.de/events"));
        assert_eq!(normalize_website("http://foo.de?a=1").as_deref(), Some("foo.de?a=1"));
        assert_eq!(normalize_website("   "), None);
    }
}
