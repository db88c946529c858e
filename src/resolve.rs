//! Template mechanics for virtual tags.
//!
//! Composite formats are sequences of bracketed fields holding `<Tag>`
//! placeholders; conditional tags substitute placeholders into a condition
//! string before a regex test; rename templates add a `[start:end]` slice
//! syntax. Everything here is pure string work; the recursive resolution
//! against a file's cache lives in `data.rs`.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::EditStatus;

fn field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\[\]]*)\]").expect("field pattern"))
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([^<>]+)>").expect("placeholder pattern"))
}

fn rename_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<(?P<tag>[^<>\[\]]+)>(?:\[(?P<start>-?\d*):(?P<end>-?\d*)\])?")
            .expect("rename token pattern")
    })
}

/// The bracketed fields of a composite format template, in order.
pub fn format_fields(format: &str) -> Vec<&str> {
    field_re()
        .captures_iter(format)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// All `<Tag>` placeholder names in a template, in order of appearance.
pub fn placeholders(template: &str) -> Vec<&str> {
    placeholder_re()
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Substitute every `<Tag>` placeholder via `resolve`.
pub fn substitute(template: &str, mut resolve: impl FnMut(&str) -> String) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures| resolve(&caps[1]))
        .into_owned()
}

/// Render one bracketed field, reporting whether any placeholder resolved
/// non-empty. Fields where every placeholder came back empty are dropped by
/// the caller (the field-level "keep if any component present" rule).
pub fn render_field(field: &str, mut resolve: impl FnMut(&str) -> String) -> (String, bool) {
    let mut any_present = false;
    let rendered = substitute(field, |tag| {
        let value = resolve(tag);
        if !value.is_empty() {
            any_present = true;
        }
        value
    });
    (rendered, any_present)
}

/// Assemble a composite value from its fields: kept fields concatenate in
/// order, and a template where no field was kept resolves to absent.
pub fn compose(format: &str, mut resolve: impl FnMut(&str) -> String) -> Option<String> {
    let mut out = String::new();
    let mut kept_any = false;
    for field in format_fields(format) {
        let (rendered, keep) = render_field(field, &mut resolve);
        if keep {
            out.push_str(&rendered);
            kept_any = true;
        }
    }
    kept_any.then_some(out)
}

/// Group name a tag uses inside an inverse pattern: regex group names cannot
/// carry `:` or other punctuation, so tags are sanitized to `[A-Za-z0-9_]`.
pub fn group_name(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Split an edited composite value back into per-tag assignments.
///
/// The empty string bypasses the pattern (nothing non-trivial matches it)
/// and assigns every placeholder the empty string, i.e. delete-all.
/// A non-empty value that fails the pattern yields `None`.
pub fn decompose(
    format: &str,
    pattern: &Regex,
    value: &str,
) -> Option<Vec<(String, String)>> {
    let mut inner: Vec<&str> = Vec::new();
    for field in format_fields(format) {
        for tag in placeholders(field) {
            if !inner.contains(&tag) {
                inner.push(tag);
            }
        }
    }

    if value.is_empty() {
        return Some(inner.iter().map(|t| (t.to_string(), String::new())).collect());
    }

    let caps = pattern.captures(value)?;
    Some(
        inner
            .iter()
            .map(|tag| {
                let assigned = caps
                    .name(&group_name(tag))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                (tag.to_string(), assigned)
            })
            .collect(),
    )
}

/// Combine per-placeholder edit statuses: confirmed-failed is sticky,
/// indeterminate overrides confirmed-ok but never an established failure.
pub fn combine_status(statuses: impl IntoIterator<Item = EditStatus>) -> EditStatus {
    let mut result = Some(true);
    for status in statuses {
        match status {
            Some(false) => result = Some(false),
            None if result != Some(false) => result = None,
            _ => {}
        }
    }
    result
}

/// Render a rename template: `<Tag>` substitutes a value, `<Tag>[a:b]`
/// substitutes a character slice with Python-style bounds (negative indices
/// count from the end, empty bounds mean "from the start"/"to the end").
pub fn render_rename(template: &str, mut resolve: impl FnMut(&str) -> String) -> String {
    rename_token_re()
        .replace_all(template, |caps: &regex::Captures| {
            let value = resolve(&caps["tag"]);
            match (caps.name("start"), caps.name("end")) {
                (None, None) => value,
                (start, end) => slice_chars(
                    &value,
                    start.and_then(|m| m.as_str().parse().ok()),
                    end.and_then(|m| m.as_str().parse().ok()),
                ),
            }
        })
        .into_owned()
}

/// Python-style character slice.
fn slice_chars(s: &str, start: Option<isize>, end: Option<isize>) -> String {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as isize;
    let clamp = |i: isize| -> usize {
        let i = if i < 0 { len + i } else { i };
        i.clamp(0, len) as usize
    };
    let from = clamp(start.unwrap_or(0));
    let to = clamp(end.unwrap_or(len));
    if from >= to {
        return String::new();
    }
    chars[from..to].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver(values: &[(&str, &str)]) -> impl FnMut(&str) -> String {
        let map: HashMap<String, String> = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |tag: &str| map.get(tag).cloned().unwrap_or_default()
    }

    const FORMAT: &str =
        "[<EXIF:DateTimeOriginal>][.<EXIF:SubSecTimeOriginal>][<EXIF:OffsetTimeOriginal>]";

    #[test]
    fn compose_keeps_fields_with_any_present_placeholder() {
        let value = compose(
            FORMAT,
            resolver(&[
                ("EXIF:DateTimeOriginal", "2023:05:17 15:54:30"),
                ("EXIF:SubSecTimeOriginal", "123"),
                ("EXIF:OffsetTimeOriginal", "+08:00"),
            ]),
        );
        assert_eq!(value.as_deref(), Some("2023:05:17 15:54:30.123+08:00"));
    }

    #[test]
    fn compose_drops_empty_fields_with_their_literals() {
        // Only the second field resolves: no leading datetime, no stray dot
        // from the first field's literal text.
        let value = compose(FORMAT, resolver(&[("EXIF:SubSecTimeOriginal", "123")]));
        assert_eq!(value.as_deref(), Some(".123"));
    }

    #[test]
    fn compose_with_nothing_present_is_absent() {
        assert_eq!(compose(FORMAT, resolver(&[])), None);
    }

    #[test]
    fn decompose_extracts_named_groups() {
        let pattern = Regex::new(
            r"^(?P<EXIF_DateTimeOriginal>\d{4}:\d{2}:\d{2} \d{2}:\d{2}:\d{2})(?:\.(?P<EXIF_SubSecTimeOriginal>\d+))?(?P<EXIF_OffsetTimeOriginal>[-+]\d{2}:\d{2})?$",
        )
        .unwrap();
        let parts = decompose(FORMAT, &pattern, "2023:05:17 15:54:30.123+08:00").unwrap();
        assert_eq!(
            parts,
            vec![
                (
                    "EXIF:DateTimeOriginal".to_string(),
                    "2023:05:17 15:54:30".to_string()
                ),
                ("EXIF:SubSecTimeOriginal".to_string(), "123".to_string()),
                ("EXIF:OffsetTimeOriginal".to_string(), "+08:00".to_string()),
            ]
        );
    }

    #[test]
    fn decompose_missing_optional_groups_map_to_empty() {
        let pattern = Regex::new(
            r"^(?P<EXIF_DateTimeOriginal>\d{4}:\d{2}:\d{2} \d{2}:\d{2}:\d{2})(?:\.(?P<EXIF_SubSecTimeOriginal>\d+))?(?P<EXIF_OffsetTimeOriginal>[-+]\d{2}:\d{2})?$",
        )
        .unwrap();
        let parts = decompose(FORMAT, &pattern, "2023:05:17 15:54:30").unwrap();
        assert_eq!(parts[1].1, "");
        assert_eq!(parts[2].1, "");
    }

    #[test]
    fn decompose_empty_value_deletes_everything_without_matching() {
        let pattern = Regex::new(r"^x$").unwrap();
        let parts = decompose(FORMAT, &pattern, "").unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|(_, v)| v.is_empty()));
    }

    #[test]
    fn decompose_unmatched_value_is_none() {
        let pattern = Regex::new(r"^\d+$").unwrap();
        assert_eq!(decompose(FORMAT, &pattern, "not digits"), None);
    }

    #[test]
    fn status_false_is_sticky() {
        assert_eq!(
            combine_status([Some(true), Some(false), None]),
            Some(false)
        );
        assert_eq!(combine_status([None, Some(false)]), Some(false));
    }

    #[test]
    fn status_indeterminate_beats_true() {
        assert_eq!(combine_status([Some(true), None, Some(true)]), None);
        assert_eq!(combine_status([Some(true), Some(true)]), Some(true));
        assert_eq!(combine_status([]), Some(true));
    }

    #[test]
    fn rename_tokens_with_slices() {
        let out = render_rename(
            "<EXIF:Model>_<EXIF:DateTimeOriginal>[0:4]",
            resolver(&[
                ("EXIF:Model", "X100V"),
                ("EXIF:DateTimeOriginal", "2023:05:17 15:54:30"),
            ]),
        );
        assert_eq!(out, "X100V_2023");
    }

    #[test]
    fn rename_negative_slice() {
        let out = render_rename(
            "<File:FileName>[-3:]",
            resolver(&[("File:FileName", "IMG_0042")]),
        );
        assert_eq!(out, "042");
    }

    #[test]
    fn slice_bounds_clamp() {
        assert_eq!(slice_chars("abc", Some(0), Some(10)), "abc");
        assert_eq!(slice_chars("abc", Some(-10), None), "abc");
        assert_eq!(slice_chars("abc", Some(2), Some(1)), "");
        assert_eq!(slice_chars("", None, None), "");
    }
}
