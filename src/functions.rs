//! Batch operations over a file selection.
//!
//! Nothing here touches the gateway directly: every operation reads through
//! the cache's resolution layer and stages results with `edit`, so datetime
//! conventions, anti-duplicate renames and save reconciliation all apply
//! exactly as they would to a single interactive edit.

use chrono::Duration;

use crate::data::{FILENAME_TAG, MetadataCache};
use crate::datetime;
use crate::resolve;
use crate::tags;

/// Copy one tag's resolved value to one or more destination tags across a
/// selection. Datetime values are re-normalized per destination tag rather
/// than byte-copied. Returns the number of staged edits.
pub fn copy_value(
    cache: &MetadataCache,
    indexes: &[usize],
    from_tag: &str,
    to_tags: &[String],
    auto_save: bool,
) -> usize {
    let mut staged = 0;
    for &idx in indexes {
        let path = cache.file_path(idx).unwrap_or_default();
        let file = path.display().to_string();

        let datetime_source = cache.settings().is_datetime_tag(from_tag);
        let instant = datetime_source
            .then(|| cache.get_datetime(idx, from_tag))
            .flatten();

        for to_tag in to_tags {
            let value = match instant {
                Some(inst) => cache.format_for_tag(&file, to_tag, inst),
                None => {
                    let raw = cache.get(idx, from_tag, "");
                    if raw.is_empty() {
                        continue;
                    }
                    raw
                }
            };
            cache.edit(idx, to_tag, &value, auto_save);
            staged += 1;
        }
    }
    staged
}

/// Shift a datetime tag across a selection, either to line a reference file
/// up with `to_datetime` or by an explicit signed duration. Each file keeps
/// its own precision and timezone handling. Returns the number of staged
/// edits.
pub fn shift_datetime(
    cache: &MetadataCache,
    indexes: &[usize],
    reference: usize,
    tag: &str,
    to_datetime: Option<&str>,
    by_timedelta: Option<&str>,
    auto_save: bool,
) -> Result<usize, String> {
    let delta = match (to_datetime, by_timedelta) {
        (Some(to), _) => {
            let reference = cache
                .get_datetime(reference, tag)
                .ok_or_else(|| format!("reference file has no parsable {tag}"))?;
            let target = datetime::parse_instant(to)
                .ok_or_else(|| format!("unparsable target datetime: {to}"))?;
            Duration::microseconds(target.timestamp_micros() - reference.timestamp_micros())
        }
        (None, Some(by)) => {
            datetime::parse_timedelta(by).ok_or_else(|| format!("unparsable duration: {by}"))?
        }
        (None, None) => return Err("need a target datetime or a duration".to_string()),
    };

    let mut staged = 0;
    for &idx in indexes {
        // Unparsable or absent values are skipped, not errors; the cache
        // already logged the parse failure.
        let Some(instant) = cache.get_datetime(idx, tag) else {
            continue;
        };
        let path = cache.file_path(idx).unwrap_or_default();
        let value = cache.format_for_tag(&path.display().to_string(), tag, instant.shifted(delta));
        cache.edit(idx, tag, &value, auto_save);
        staged += 1;
    }
    Ok(staged)
}

/// Rename files from a template evaluated against each file's own tags.
/// `<Tag>` substitutes the resolved value, `<Tag>[a:b]` a character slice;
/// referencing the filename tag substitutes the stem only. Colons are
/// path-illegal on common filesystems and stripped; the original extension
/// is re-appended. Returns the number of staged renames.
pub fn rename(
    cache: &MetadataCache,
    indexes: &[usize],
    template: &str,
    auto_save: bool,
) -> usize {
    let mut staged = 0;
    for &idx in indexes {
        let current = cache.get(idx, FILENAME_TAG, "");
        if current.is_empty() {
            continue;
        }
        let (_, extension) = split_extension(&current);

        let stem = resolve::render_rename(template, |tag| {
            let value = cache.get(idx, tag, "");
            if tags::is_equal(tag, FILENAME_TAG) {
                split_extension(&value).0.to_string()
            } else {
                value
            }
        });
        let stem: String = stem.chars().filter(|&c| c != ':').collect();
        if stem.is_empty() {
            continue;
        }

        cache.edit(idx, FILENAME_TAG, &format!("{stem}{extension}"), auto_save);
        staged += 1;
    }
    staged
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    }
}

/// Selection sorted by a tag's value: datetime-aware when the tag is a
/// recognized datetime tag (unparsable values sort first), lexicographic
/// otherwise. The sort is stable.
pub fn sorted_by_tag(cache: &MetadataCache, indexes: &[usize], tag: &str) -> Vec<usize> {
    let mut order: Vec<usize> = indexes.to_vec();
    if cache.settings().is_datetime_tag(tag) {
        order.sort_by_key(|&idx| {
            cache
                .get_datetime(idx, tag)
                .map_or(i64::MIN, |inst| inst.timestamp_micros())
        });
    } else {
        order.sort_by_key(|&idx| cache.get(idx, tag, ""));
    }
    order
}

/// Reverse a selection's tag values across the sorted order: the first and
/// last file swap values, then the second and second-to-last, and so on.
/// File identity never moves, only the values.
pub fn reverse_order(cache: &MetadataCache, indexes: &[usize], tag: &str, auto_save: bool) {
    let order = sorted_by_tag(cache, indexes, tag);
    let n = order.len();
    for i in 0..n / 2 {
        let (a, b) = (order[i], order[n - 1 - i]);
        let value_a = cache.get(a, tag, "");
        let value_b = cache.get(b, tag, "");
        cache.edit(a, tag, &value_b, auto_save);
        cache.edit(b, tag, &value_a, auto_save);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::data::testkit::{basic_tags, seeded_cache};

    #[test]
    fn copy_verbatim_for_plain_tags() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg", "b.jpg"], basic_tags, |g| g);

        let staged = copy_value(
            &cache,
            &[0, 1],
            "EXIF:Artist",
            &["EXIF:Copyright".to_string()],
            false,
        );
        assert_eq!(staged, 2);
        for idx in 0..2 {
            cache
                .with_record(idx, |r| {
                    assert_eq!(crate::tags::to_display(&r.edited["exif:copyright"]), "Original");
                })
                .unwrap();
        }
    }

    #[test]
    fn copy_datetime_renormalizes_per_destination() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(
            &dir,
            &["a.jpg"],
            |path| {
                let mut map = basic_tags(path);
                map.insert("XMP:CreateDate".into(), json!("2023:05:17 15:54:30.75+08:00"));
                map
            },
            |g| g,
        );

        // QuickTime tags are implicitly UTC with no offset or sub-seconds:
        // the copied value is converted, not byte-copied.
        copy_value(
            &cache,
            &[0],
            "XMP:CreateDate",
            &["QuickTime:CreateDate".to_string()],
            false,
        );
        cache
            .with_record(0, |r| {
                assert_eq!(
                    crate::tags::to_display(&r.edited["quicktime:createdate"]),
                    "2023:05:17 07:54:31"
                );
            })
            .unwrap();
    }

    #[test]
    fn shift_by_explicit_duration() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg", "b.jpg"], basic_tags, |g| g);

        let staged = shift_datetime(
            &cache,
            &[0, 1],
            0,
            "EXIF:DateTimeOriginal",
            None,
            Some("01:00:00"),
            false,
        )
        .unwrap();
        assert_eq!(staged, 2);
        cache
            .with_record(0, |r| {
                assert_eq!(
                    crate::tags::to_display(&r.edited["exif:datetimeoriginal"]),
                    "2023:05:17 16:54:30"
                );
            })
            .unwrap();
    }

    #[test]
    fn shift_to_target_uses_reference_delta() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(
            &dir,
            &["a.jpg", "b.jpg"],
            |path| {
                let mut map = basic_tags(path);
                let value = if path.ends_with("a.jpg") {
                    "2023:05:17 10:00:00"
                } else {
                    "2023:05:17 11:30:00"
                };
                map.insert("EXIF:DateTimeOriginal".into(), json!(value));
                map
            },
            |g| g,
        );

        // Move the reference file to noon; the other file keeps its +1:30.
        shift_datetime(
            &cache,
            &[0, 1],
            0,
            "EXIF:DateTimeOriginal",
            Some("2023:05:17 12:00:00"),
            None,
            false,
        )
        .unwrap();
        cache
            .with_record(0, |r| {
                assert_eq!(
                    crate::tags::to_display(&r.edited["exif:datetimeoriginal"]),
                    "2023:05:17 12:00:00"
                );
            })
            .unwrap();
        cache
            .with_record(1, |r| {
                assert_eq!(
                    crate::tags::to_display(&r.edited["exif:datetimeoriginal"]),
                    "2023:05:17 13:30:00"
                );
            })
            .unwrap();
    }

    #[test]
    fn shift_requires_target_or_duration() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g);
        assert!(
            shift_datetime(&cache, &[0], 0, "EXIF:DateTimeOriginal", None, None, false).is_err()
        );
    }

    #[test]
    fn rename_from_template_strips_colons_and_keeps_extension() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(
            &dir,
            &["a.jpg"],
            |path| {
                let mut map = basic_tags(path);
                map.insert("EXIF:Model".into(), json!("X100V"));
                map
            },
            |g| g,
        );

        let staged = rename(&cache, &[0], "<EXIF:Model>_<EXIF:DateTimeOriginal>", false);
        assert_eq!(staged, 1);
        cache
            .with_record(0, |r| {
                // "2023:05:17 15:54:30" loses its colons in a filename.
                assert_eq!(
                    crate::tags::to_display(&r.edited["file:filename"]),
                    "X100V_20230517 155430.jpg"
                );
            })
            .unwrap();
    }

    #[test]
    fn rename_referencing_filename_uses_stem() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(&dir, &["a.jpg"], basic_tags, |g| g);

        rename(&cache, &[0], "copy_of_<File:FileName>", false);
        cache
            .with_record(0, |r| {
                assert_eq!(
                    crate::tags::to_display(&r.edited["file:filename"]),
                    "copy_of_a.jpg"
                );
            })
            .unwrap();
    }

    #[test]
    fn sort_is_datetime_aware_with_unparsable_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(
            &dir,
            &["a.jpg", "b.jpg", "c.jpg"],
            |path| {
                let mut map = basic_tags(path);
                let name = path.file_name().unwrap().to_str().unwrap();
                let value = match name {
                    "a.jpg" => "2023:09:01 00:00:00",
                    "b.jpg" => "not a date",
                    _ => "2023:01:01 00:00:00",
                };
                map.insert("EXIF:DateTimeOriginal".into(), json!(value));
                map
            },
            |g| g,
        );

        let order = sorted_by_tag(&cache, &[0, 1, 2], "EXIF:DateTimeOriginal");
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn reverse_order_swaps_values_not_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(
            &dir,
            &["a.jpg", "b.jpg", "c.jpg"],
            |path| {
                let mut map = basic_tags(path);
                let name = path.file_name().unwrap().to_str().unwrap();
                let value = match name {
                    "a.jpg" => "2023:01:01 00:00:00",
                    "b.jpg" => "2023:02:01 00:00:00",
                    _ => "2023:03:01 00:00:00",
                };
                map.insert("EXIF:DateTimeOriginal".into(), json!(value));
                map
            },
            |g| g,
        );

        reverse_order(&cache, &[0, 1, 2], "EXIF:DateTimeOriginal", false);

        // Earliest and latest swapped; the middle file keeps its value and
        // stages no edit at all.
        cache
            .with_record(0, |r| {
                assert_eq!(
                    crate::tags::to_display(&r.edited["exif:datetimeoriginal"]),
                    "2023:03:01 00:00:00"
                );
            })
            .unwrap();
        cache
            .with_record(1, |r| assert!(r.edited.is_empty()))
            .unwrap();
        cache
            .with_record(2, |r| {
                assert_eq!(
                    crate::tags::to_display(&r.edited["exif:datetimeoriginal"]),
                    "2023:01:01 00:00:00"
                );
            })
            .unwrap();
    }
}
