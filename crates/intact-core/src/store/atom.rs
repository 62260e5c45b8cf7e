use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, Visitor};
use serde_json::value::RawValue;

use crate::error::{Error, Result};
use crate::store::kv;

/// Fixed head and tail of the atom document. The importer accepts exactly
/// this token sequence, keeping the store wire-compatible with chkbit
/// atom files.
pub(crate) const ATOM_PREFIX: &str = r#"{"type":"chkbit","version":6,"data":{"#;
pub(crate) const ATOM_SUFFIX: &str = "}}";

const ATOM_TYPE: &str = "chkbit";
const ATOM_VERSION: u64 = 6;

/// Stream the entries of an atom document into `entry`, enforcing the
/// strict field order `type`, `version`, `data`.
pub(crate) fn parse_atom_document<'a, F>(text: &'a str, mut entry: F) -> Result<()>
where
    F: FnMut(&str, &'a RawValue) -> Result<()>,
{
    let mut failure: Option<Error> = None;
    let mut de = serde_json::Deserializer::from_str(text);
    let parsed = de.deserialize_map(DocVisitor {
        entry: &mut entry,
        failure: &mut failure,
    });
    match parsed {
        Ok(()) => {
            de.end()
                .map_err(|_| Error::Store("invalid atom document (trailing data)".to_string()))?;
            Ok(())
        }
        Err(e) => Err(failure
            .take()
            .unwrap_or_else(|| Error::Store(format!("invalid atom document ({e})")))),
    }
}

struct DocVisitor<'f, F> {
    entry: &'f mut F,
    failure: &'f mut Option<Error>,
}

impl<'de, F> Visitor<'de> for DocVisitor<'_, F>
where
    F: FnMut(&str, &'de RawValue) -> Result<()>,
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an atom document")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        expect_key(&mut map, "type")?;
        let doc_type: String = map.next_value()?;
        if doc_type != ATOM_TYPE {
            return Err(de::Error::custom(format!(
                "expected document type \"{ATOM_TYPE}\""
            )));
        }
        expect_key(&mut map, "version")?;
        let version: u64 = map.next_value()?;
        if version != ATOM_VERSION {
            return Err(de::Error::custom(format!(
                "expected document version {ATOM_VERSION}"
            )));
        }
        expect_key(&mut map, "data")?;
        map.next_value_seed(DataSeed {
            entry: self.entry,
            failure: self.failure,
        })?;
        if map.next_key::<IgnoredAny>()?.is_some() {
            return Err(de::Error::custom("unexpected field after data"));
        }
        Ok(())
    }
}

fn expect_key<'de, A: MapAccess<'de>>(map: &mut A, want: &str) -> std::result::Result<(), A::Error> {
    match map.next_key::<String>()? {
        Some(key) if key == want => Ok(()),
        _ => Err(de::Error::custom(format!("expected \"{want}\""))),
    }
}

struct DataSeed<'f, F> {
    entry: &'f mut F,
    failure: &'f mut Option<Error>,
}

impl<'de, F> DeserializeSeed<'de> for DataSeed<'_, F>
where
    F: FnMut(&str, &'de RawValue) -> Result<()>,
{
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(DataVisitor {
            entry: self.entry,
            failure: self.failure,
        })
    }
}

struct DataVisitor<'f, F> {
    entry: &'f mut F,
    failure: &'f mut Option<Error>,
}

impl<'de, F> Visitor<'de> for DataVisitor<'_, F>
where
    F: FnMut(&str, &'de RawValue) -> Result<()>,
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of directory keys to index blobs")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            let value: &'de RawValue = map.next_value()?;
            if let Err(e) = (self.entry)(&key, value) {
                *self.failure = Some(e);
                return Err(de::Error::custom("aborted"));
            }
        }
        Ok(())
    }
}

/// Serialise a KV cache back into an atom document at `out`, scanning keys
/// in order and stripping the index filename suffix off each key.
pub(crate) fn export_atom(cache: &Path, out: &Path, index_name: &str) -> Result<()> {
    let conn = kv::open(cache)?;
    let mut writer = BufWriter::new(File::create(out)?);
    writer.write_all(ATOM_PREFIX.as_bytes())?;

    let mut stmt = conn.prepare("SELECT key, value FROM data ORDER BY key")?;
    let mut rows = stmt.query([])?;
    let mut first = true;
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let value: Vec<u8> = row.get(1)?;
        if !first {
            writer.write_all(b",")?;
        }
        first = false;
        let dir_key = match key.rsplit_once('/') {
            Some((dir, _)) => dir,
            None => "",
        };
        serde_json::to_writer(&mut writer, dir_key)?;
        writer.write_all(b":")?;
        writer.write_all(&value)?;
    }

    writer.write_all(ATOM_SUFFIX.as_bytes())?;
    writer.flush()?;
    Ok(())
}
