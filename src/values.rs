use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Kind of mutation a test value drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestType {
    Integer,
    String,
    Double,
    Remove,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Integer => "INTEGER",
            TestType::String => "STRING",
            TestType::Double => "DOUBLE",
            TestType::Remove => "REMOVE",
        }
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, TestType::Remove)
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INTEGER" => Ok(TestType::Integer),
            "STRING" => Ok(TestType::String),
            "DOUBLE" => Ok(TestType::Double),
            "REMOVE" => Ok(TestType::Remove),
            other => Err(format!("unknown test type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestValue {
    pub test_type: TestType,
    pub value: String,
}

#[derive(Debug, Clone)]
enum ValueList {
    File(PathBuf),
    Inline(Vec<String>),
}

/// Ordered set of value lists, one per test type.
///
/// Iteration is lazy for file-backed lists (one line in memory at a time) and
/// can be restarted any number of times by calling [`ValueSource::iter`] again.
#[derive(Debug, Clone, Default)]
pub struct ValueSource {
    lists: Vec<(TestType, ValueList)>,
}

impl ValueSource {
    /// Loads a manifest: a JSON object mapping test type names to value files.
    /// Relative file paths resolve against the manifest's directory.
    pub fn from_manifest(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read value manifest {:?}: {}", path, e))?;
        let manifest: BTreeMap<String, PathBuf> = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid value manifest {:?}: {}", path, e))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut lists = Vec::with_capacity(manifest.len());
        for (name, file) in manifest {
            let test_type: TestType = name.parse().map_err(anyhow::Error::msg)?;
            let file = if file.is_absolute() {
                file
            } else {
                base.join(file)
            };
            if !file.is_file() {
                anyhow::bail!("value file for {} not found: {:?}", test_type, file);
            }
            lists.push((test_type, ValueList::File(file)));
        }
        debug!("Loaded {} value lists from {:?}", lists.len(), path);
        Ok(Self { lists })
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an in-memory list, iterated after the lists already present.
    pub fn with_values<I, S>(mut self, test_type: TestType, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lists.push((
            test_type,
            ValueList::Inline(values.into_iter().map(Into::into).collect()),
        ));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn iter(&self) -> TestValues<'_> {
        TestValues {
            lists: &self.lists,
            list_index: 0,
            cursor: Cursor::Idle,
        }
    }
}

enum Cursor {
    Idle,
    File(Lines<BufReader<File>>),
    Inline(usize),
}

pub struct TestValues<'a> {
    lists: &'a [(TestType, ValueList)],
    list_index: usize,
    cursor: Cursor,
}

impl TestValues<'_> {
    fn advance_list(&mut self) {
        self.list_index += 1;
        self.cursor = Cursor::Idle;
    }
}

impl Iterator for TestValues<'_> {
    type Item = TestValue;

    fn next(&mut self) -> Option<TestValue> {
        let lists = self.lists;
        loop {
            let (test_type, list) = lists.get(self.list_index)?;
            let test_type = *test_type;

            match &mut self.cursor {
                Cursor::Idle => match list {
                    ValueList::File(path) => match File::open(path) {
                        Ok(file) => self.cursor = Cursor::File(BufReader::new(file).lines()),
                        Err(e) => {
                            warn!("Skipping {} values, cannot open {:?}: {}", test_type, path, e);
                            self.advance_list();
                        }
                    },
                    ValueList::Inline(_) => self.cursor = Cursor::Inline(0),
                },
                Cursor::File(lines) => match lines.next() {
                    Some(Ok(line)) => {
                        if let Some(value) = parse_line(&line) {
                            return Some(TestValue { test_type, value });
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Stopped reading {} values: {}", test_type, e);
                        self.advance_list();
                    }
                    None => self.advance_list(),
                },
                Cursor::Inline(pos) => {
                    let values = match list {
                        ValueList::Inline(values) => values,
                        ValueList::File(_) => unreachable!("inline cursor on a file list"),
                    };
                    match values.get(*pos) {
                        Some(value) => {
                            *pos += 1;
                            return Some(TestValue {
                                test_type,
                                value: value.clone(),
                            });
                        }
                        None => self.advance_list(),
                    }
                }
            }
        }
    }
}

/// One value per line; blank lines and `#` comments are skipped.
fn parse_line(line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() || line.starts_with('#') {
        None
    } else {
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_line_skips_comments_and_blanks() {
        assert_eq!(parse_line("# header"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("\r"), None);
        assert_eq!(parse_line("  padded "), Some("  padded ".to_string()));
        assert_eq!(parse_line("42\r"), Some("42".to_string()));
    }

    #[test]
    fn test_manifest_iteration_is_lazy_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let mut strings = File::create(dir.path().join("strings.txt")).unwrap();
        writeln!(strings, "# strings\nFUZZ\n\n%00").unwrap();
        let mut ints = File::create(dir.path().join("ints.txt")).unwrap();
        writeln!(ints, "-1\n0").unwrap();
        std::fs::write(
            dir.path().join("manifest.json"),
            r#"{"STRING": "strings.txt", "INTEGER": "ints.txt"}"#,
        )
        .unwrap();

        let source = ValueSource::from_manifest(&dir.path().join("manifest.json")).unwrap();
        let first: Vec<TestValue> = source.iter().collect();
        assert_eq!(
            first
                .iter()
                .map(|v| (v.test_type, v.value.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (TestType::Integer, "-1"),
                (TestType::Integer, "0"),
                (TestType::String, "FUZZ"),
                (TestType::String, "%00"),
            ]
        );
        let second: Vec<TestValue> = source.iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_manifest_with_missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.json"), r#"{"STRING": "nope.txt"}"#).unwrap();
        assert!(ValueSource::from_manifest(&dir.path().join("manifest.json")).is_err());
    }

    #[test]
    fn test_manifest_with_unknown_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v.txt"), "1\n").unwrap();
        std::fs::write(dir.path().join("manifest.json"), r#"{"BOOLEAN": "v.txt"}"#).unwrap();
        assert!(ValueSource::from_manifest(&dir.path().join("manifest.json")).is_err());
    }

    #[test]
    fn test_inline_values() {
        let source = ValueSource::new()
            .with_values(TestType::String, ["a", "b"])
            .with_values(TestType::Remove, [""]);
        let values: Vec<TestValue> = source.iter().collect();
        assert_eq!(values.len(), 3);
        assert_eq!(values[2].test_type, TestType::Remove);
    }
}
