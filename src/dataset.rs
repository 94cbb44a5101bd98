//! Dataset variants and the cursor that walks them.
//!
//! A cursor hands out variants one at a time. Looping cursors wrap around;
//! non-looping cursors stop on the last variant and keep returning it
//! (sticky end). Tag lookups never move the sequential position.

use crate::config::DatasetConfig;
use crate::error::{EngineError, Result};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Anything that can be addressed by tag inside a dataset.
pub trait Tagged {
    fn tag(&self) -> Option<&str>;
}

/// One row of template variables, optionally tagged.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    pub tag: Option<String>,
    pub vars: Map<String, Value>,
}

impl Tagged for DatasetRow {
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl DatasetRow {
    /// Build a row from a JSON object, lifting its `tag` key out of the variables.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut vars) = value else {
            return Err(EngineError::config("dataset rows must be objects"));
        };
        let tag = match vars.remove("tag") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };
        Ok(Self { tag, vars })
    }
}

/// Load dataset rows from their configured source.
///
/// File paths are resolved against `base_dir` when relative.
pub fn load_rows(config: &DatasetConfig, base_dir: Option<&Path>) -> Result<Vec<DatasetRow>> {
    let values = match config {
        DatasetConfig::Inline(rows) => rows.clone(),
        DatasetConfig::File(path) => {
            let path = match base_dir {
                Some(dir) if Path::new(path).is_relative() => dir.join(path),
                _ => Path::new(path).to_path_buf(),
            };
            let content = std::fs::read_to_string(&path).map_err(|e| {
                EngineError::config(format!("failed to read dataset {}: {}", path.display(), e))
            })?;
            let is_json = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false);
            if is_json {
                serde_json::from_str::<Vec<Value>>(&content)
                    .map_err(|e| EngineError::config(format!("dataset {}: {}", path.display(), e)))?
            } else {
                serde_yaml::from_str::<Vec<Value>>(&content)
                    .map_err(|e| EngineError::config(format!("dataset {}: {}", path.display(), e)))?
            }
        }
    };

    let rows = values
        .into_iter()
        .map(DatasetRow::from_value)
        .collect::<Result<Vec<_>>>()?;
    if rows.is_empty() {
        return Err(EngineError::config("dataset must not be empty"));
    }
    check_tags(rows.iter().filter_map(|r| r.tag()), "dataset")?;
    Ok(rows)
}

/// Reject duplicate tags and tags containing commas.
pub fn check_tags<'a>(tags: impl IntoIterator<Item = &'a str>, owner: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for tag in tags {
        if tag.contains(',') {
            return Err(EngineError::config(format!(
                "{}: comma in tag {:?} is forbidden",
                owner, tag
            )));
        }
        if !seen.insert(tag) {
            return Err(EngineError::config(format!(
                "{}: duplicate tag {:?}",
                owner, tag
            )));
        }
    }
    Ok(())
}

/// Split a comma-separated tag hint into its tags, in order.
pub fn split_tags(hint: &str) -> Vec<String> {
    hint.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Stateful iterator over an ordered set of variants.
#[derive(Debug, Clone)]
pub struct DatasetCursor<T> {
    items: Arc<[T]>,
    looped: bool,
    position: usize,
}

impl<T: Tagged> DatasetCursor<T> {
    pub fn new(items: impl Into<Arc<[T]>>, looped: bool) -> Self {
        Self {
            items: items.into(),
            looped,
            position: 0,
        }
    }

    /// Return the next variant and its index, advancing the cursor.
    ///
    /// Returns `None` only for an empty set.
    pub fn next(&mut self) -> Option<(&T, usize)> {
        let len = self.items.len();
        if len == 0 {
            return None;
        }
        let index = if self.looped {
            let index = self.position % len;
            self.position = (index + 1) % len;
            index
        } else {
            let index = self.position.min(len - 1);
            self.position = (self.position + 1).min(len);
            index
        };
        Some((&self.items[index], index))
    }

    /// Find the variant tagged exactly `tag`. Does not move the cursor.
    pub fn by_tag(&self, tag: &str) -> Result<(&T, usize)> {
        self.items
            .iter()
            .enumerate()
            .find(|(_, item)| item.tag() == Some(tag))
            .map(|(index, item)| (item, index))
            .ok_or_else(|| EngineError::TagNotFound(tag.to_string()))
    }

    /// Try each tag in order and return the first variant found.
    pub fn by_tags<S: AsRef<str>>(&self, tags: &[S]) -> Result<(&T, usize)> {
        for tag in tags {
            if let Ok(found) = self.by_tag(tag.as_ref()) {
                return Ok(found);
            }
        }
        let joined = tags.iter().map(|t| t.as_ref()).collect::<Vec<_>>().join(",");
        Err(EngineError::TagNotFound(joined))
    }

    /// Rewind to the first variant.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Number of variants handed out since the last reset, capped for sticky sets.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_looped(&self) -> bool {
        self.looped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &Arc<[T]> {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq)]
    struct Item(&'static str, Option<&'static str>);

    impl Tagged for Item {
        fn tag(&self) -> Option<&str> {
            self.1
        }
    }

    fn abc(looped: bool) -> DatasetCursor<Item> {
        DatasetCursor::new(
            vec![Item("A", None), Item("B", Some("second")), Item("C", None)],
            looped,
        )
    }

    fn drain(cursor: &mut DatasetCursor<Item>, n: usize) -> Vec<&'static str> {
        (0..n).map(|_| cursor.next().unwrap().0 .0).collect()
    }

    #[test]
    fn test_non_looping_sticks_on_last() {
        let mut cursor = abc(false);
        assert_eq!(drain(&mut cursor, 5), vec!["A", "B", "C", "C", "C"]);
    }

    #[test]
    fn test_non_looping_sticky_for_any_length() {
        for n in 1..6 {
            let items: Vec<Item> = (0..n).map(|_| Item("x", None)).collect();
            let mut cursor = DatasetCursor::new(items, false);
            let indices: Vec<usize> = (0..n + 4).map(|_| cursor.next().unwrap().1).collect();
            let expected: Vec<usize> = (0..n + 4).map(|k| k.min(n - 1)).collect();
            assert_eq!(indices, expected);
        }
    }

    #[test]
    fn test_looping_wraps_around() {
        let mut cursor = abc(true);
        assert_eq!(
            drain(&mut cursor, 7),
            vec!["A", "B", "C", "A", "B", "C", "A"]
        );
    }

    #[test]
    fn test_looping_index_is_modulo() {
        let mut cursor = abc(true);
        for k in 1..=10usize {
            assert_eq!(cursor.next().unwrap().1, (k - 1) % 3);
        }
    }

    #[test]
    fn test_by_tag_does_not_advance() {
        let mut cursor = abc(false);
        cursor.next();
        let (item, index) = cursor.by_tag("second").unwrap();
        assert_eq!(item.0, "B");
        assert_eq!(index, 1);
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.next().unwrap().0 .0, "B");
    }

    #[test]
    fn test_by_tag_is_case_sensitive() {
        let cursor = abc(false);
        assert_eq!(
            cursor.by_tag("SECOND").unwrap_err(),
            EngineError::TagNotFound("SECOND".to_string())
        );
    }

    #[test]
    fn test_by_tags_first_match_wins() {
        let cursor = abc(false);
        let tags = split_tags("missing, second");
        assert_eq!(cursor.by_tags(&tags).unwrap().0 .0, "B");
        assert!(cursor.by_tags(&["nope"]).is_err());
    }

    #[test]
    fn test_reset() {
        let mut cursor = abc(false);
        drain(&mut cursor, 4);
        cursor.reset();
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.next().unwrap().0 .0, "A");
    }

    #[test]
    fn test_empty_cursor() {
        let mut cursor: DatasetCursor<Item> = DatasetCursor::new(Vec::new(), true);
        assert!(cursor.next().is_none());
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_row_lifts_tag() {
        let row = DatasetRow::from_value(json!({"tag": "first", "name": "Ada"})).unwrap();
        assert_eq!(row.tag.as_deref(), Some("first"));
        assert_eq!(row.vars.get("name"), Some(&json!("Ada")));
        assert!(!row.vars.contains_key("tag"));
    }

    #[test]
    fn test_check_tags_rejects_comma_and_duplicates() {
        assert!(check_tags(["a", "b"], "endpoint").is_ok());
        assert!(check_tags(["a,b"], "endpoint").is_err());
        assert!(check_tags(["a", "a"], "endpoint").is_err());
    }

    #[test]
    fn test_load_rows_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, r#"[{"name": "Ada"}, {"name": "Linus", "tag": "kernel"}]"#).unwrap();

        let rows = load_rows(&DatasetConfig::File("users.json".to_string()), Some(dir.path()))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].tag.as_deref(), Some("kernel"));
    }

    #[test]
    fn test_load_rows_rejects_empty() {
        assert!(load_rows(&DatasetConfig::Inline(vec![]), None).is_err());
    }
}
