//! The match predicate deciding whether a [`Candidate`] satisfies a [`Query`].
//!
//! Matching is strictly boolean. A field the query leaves unspecified is a
//! wildcard; a field the query does specify must be present on the candidate
//! and agree with it, otherwise the candidate is rejected.
//!
//! | Field | Comparison |
//! |-------|------------|
//! | year | query's [`YearModifier`](crate::models::YearModifier) |
//! | extension, language | equality, ASCII case-insensitive |
//! | volume, number, pages | equality |
//! | ISBNs | set intersection (hyphens and spaces ignored) |
//! | title, series, publisher, journal, edition | case-insensitive substring |
//! | authors | case-insensitive set intersection |

use crate::models::{normalize_extension, Candidate, Exacts, NonExacts, Query};

/// Returns `true` if `candidate` has at least one URI and satisfies every
/// field `query` specifies.
pub fn matches(candidate: &Candidate, query: &Query) -> bool {
    if candidate.misc.uris.is_empty() {
        return false;
    }

    exacts_match(&candidate.exacts, query)
        && isbns_match(&candidate.misc.isbns, query.isbns())
        && nonexacts_match(&candidate.nonexacts, query.nonexacts())
}

fn exacts_match(have: &Exacts, query: &Query) -> bool {
    let want = query.exacts();

    if let Some(wanted_year) = want.year {
        match have.year {
            Some(year) if query.year_modifier().admits(year, wanted_year) => {}
            _ => return false,
        }
    }

    if let Some(ext) = &want.extension {
        match &have.extension {
            Some(h) if normalize_extension(h) == normalize_extension(ext) => {}
            _ => return false,
        }
    }

    equal_if_wanted(want.volume, have.volume)
        && equal_if_wanted(want.number, have.number)
        && equal_if_wanted(want.pages, have.pages)
        && match (&want.language, &have.language) {
            (None, _) => true,
            (Some(w), Some(h)) => w.trim().eq_ignore_ascii_case(h.trim()),
            (Some(_), None) => false,
        }
}

fn equal_if_wanted<T: PartialEq>(want: Option<T>, have: Option<T>) -> bool {
    match want {
        None => true,
        Some(w) => have.is_some_and(|h| h == w),
    }
}

fn isbns_match(have: &[String], want: &[String]) -> bool {
    if want.is_empty() {
        return true;
    }
    let want: Vec<String> = want.iter().map(|i| normalize_isbn(i)).collect();
    have.iter()
        .map(|i| normalize_isbn(i))
        .any(|h| want.contains(&h))
}

fn normalize_isbn(isbn: &str) -> String {
    isbn.chars()
        .filter(|c| !matches!(c, '-' | ' '))
        .collect::<String>()
        .to_ascii_uppercase()
}

fn nonexacts_match(have: &NonExacts, want: &NonExacts) -> bool {
    if !want.authors.is_empty() && !authors_intersect(&have.authors, &want.authors) {
        return false;
    }

    [
        (&want.title, &have.title),
        (&want.series, &have.series),
        (&want.publisher, &have.publisher),
        (&want.journal, &have.journal),
        (&want.edition, &have.edition),
    ]
    .into_iter()
    .all(|(w, h)| contains_if_wanted(w.as_deref(), h.as_deref()))
}

fn contains_if_wanted(want: Option<&str>, have: Option<&str>) -> bool {
    match (want, have) {
        (None, _) => true,
        (Some(w), Some(h)) => h.to_lowercase().contains(&w.to_lowercase()),
        (Some(_), None) => false,
    }
}

fn authors_intersect(have: &[String], want: &[String]) -> bool {
    have.iter().any(|h| {
        let h = h.trim().to_lowercase();
        want.iter().any(|w| w.trim().to_lowercase() == h)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Misc, YearSpec};

    fn candidate() -> Candidate {
        Candidate {
            misc: Misc {
                uris: vec!["https://example.org/book.pdf".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn with_year(year: i32) -> Candidate {
        let mut c = candidate();
        c.exacts.year = Some(year);
        c
    }

    fn year_query(input: &str) -> Query {
        Query::builder()
            .year(input.parse::<YearSpec>().unwrap())
            .build()
    }

    #[test]
    fn rejects_without_uris() {
        let mut c = candidate();
        c.misc.uris.clear();
        assert!(!matches(&c, &Query::default()));
    }

    #[test]
    fn empty_query_accepts_anything_with_a_uri() {
        let mut c = candidate();
        c.nonexacts.title = Some("Whatever".into());
        c.exacts.year = Some(1888);
        assert!(matches(&c, &Query::default()));
        assert!(matches(&candidate(), &Query::default()));
    }

    #[test]
    fn year_equal_boundaries() {
        let q = year_query("2000");
        assert!(matches(&with_year(2000), &q));
        assert!(!matches(&with_year(1999), &q));
        assert!(!matches(&with_year(2001), &q));
    }

    #[test]
    fn year_eq_gt_boundaries() {
        let q = year_query(">=2000");
        assert!(matches(&with_year(2000), &q));
        assert!(matches(&with_year(2001), &q));
        assert!(!matches(&with_year(1999), &q));
    }

    #[test]
    fn year_strict_modifiers() {
        assert!(!matches(&with_year(2000), &year_query(">2000")));
        assert!(matches(&with_year(2001), &year_query(">2000")));
        assert!(!matches(&with_year(2000), &year_query("<2000")));
        assert!(matches(&with_year(1999), &year_query("<2000")));
        assert!(matches(&with_year(2000), &year_query("<=2000")));
        assert!(!matches(&with_year(2001), &year_query("<=2000")));
    }

    #[test]
    fn year_required_when_specified() {
        assert!(!matches(&candidate(), &year_query("2000")));
    }

    #[test]
    fn extension_mismatch_rejects_despite_title_match() {
        let q = Query::builder()
            .title("Dune")
            .extension("pdf")
            .unwrap()
            .build();
        let mut c = candidate();
        c.nonexacts.title = Some("Dune".into());
        c.exacts.extension = Some("epub".into());
        assert!(!matches(&c, &q));

        c.exacts.extension = Some("PDF".into());
        assert!(matches(&c, &q));
    }

    #[test]
    fn numeric_exacts() {
        let q = Query::builder().volume(3).number(12).pages(200).build();
        let mut c = candidate();
        c.exacts.volume = Some(3);
        c.exacts.number = Some(12);
        c.exacts.pages = Some(200);
        assert!(matches(&c, &q));
        c.exacts.pages = Some(201);
        assert!(!matches(&c, &q));
    }

    #[test]
    fn language_case_insensitive() {
        let q = Query::builder().language("English").build();
        let mut c = candidate();
        c.exacts.language = Some("english".into());
        assert!(matches(&c, &q));
        c.exacts.language = Some("German".into());
        assert!(!matches(&c, &q));
    }

    #[test]
    fn isbn_intersection_ignores_hyphens() {
        let q = Query::builder()
            .isbn("978-0-441-17271-9")
            .isbn("0441013597")
            .build();
        let mut c = candidate();
        c.misc.isbns = vec!["1234567890".into(), "9780441172719".into()];
        assert!(matches(&c, &q));
        c.misc.isbns = vec!["1234567890".into()];
        assert!(!matches(&c, &q));
        c.misc.isbns.clear();
        assert!(!matches(&c, &q));
    }

    #[test]
    fn title_substring_case_insensitive() {
        let q = Query::builder().title("dune").build();
        let mut c = candidate();
        c.nonexacts.title = Some("Dune Messiah".into());
        assert!(matches(&c, &q));
        c.nonexacts.title = Some("Foundation".into());
        assert!(!matches(&c, &q));
        c.nonexacts.title = None;
        assert!(!matches(&c, &q));
    }

    #[test]
    fn other_nonexacts_substring() {
        let q = Query::builder()
            .series("foundation")
            .publisher("gnome")
            .journal("nature")
            .edition("2nd")
            .build();
        let mut c = candidate();
        c.nonexacts.series = Some("The Foundation Trilogy".into());
        c.nonexacts.publisher = Some("Gnome Press".into());
        c.nonexacts.journal = Some("Nature Physics".into());
        c.nonexacts.edition = Some("2nd revised".into());
        assert!(matches(&c, &q));
        c.nonexacts.journal = Some("Science".into());
        assert!(!matches(&c, &q));
    }

    #[test]
    fn authors_set_intersection() {
        let q = Query::builder()
            .authors(["Frank Herbert", "Brian Herbert"])
            .build();
        let mut c = candidate();
        c.nonexacts.authors = vec!["Kevin J. Anderson".into(), " brian herbert ".into()];
        assert!(matches(&c, &q));
        c.nonexacts.authors = vec!["Kevin J. Anderson".into()];
        assert!(!matches(&c, &q));
        c.nonexacts.authors.clear();
        assert!(!matches(&c, &q));
    }
}
