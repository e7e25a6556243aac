//! Incremental JSON array reading and writing.
//!
//! Collections can be far larger than memory, so neither direction ever
//! materializes the whole array: elements are handed to the caller one at a
//! time while the underlying reader is consumed.

use anyhow::{Context, Result};
use serde::de::{self, SeqAccess, Visitor};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io::{Read, Write};

/// Stream every element of a top-level JSON array into `on_element`.
///
/// Returns the number of elements visited. An empty array is not special.
pub fn for_each_element<R, F>(reader: R, mut on_element: F) -> Result<u64>
where
    R: Read,
    F: FnMut(Value) -> Result<()>,
{
    let mut deserializer = serde_json::Deserializer::from_reader(reader);

    let count = de::Deserializer::deserialize_seq(
        &mut deserializer,
        ElementVisitor { on_element: &mut on_element },
    )
    .context("Invalid JSON array")?;

    deserializer.end().context("Trailing data after JSON array")?;

    Ok(count)
}

struct ElementVisitor<'a, F> {
    on_element: &'a mut F,
}

impl<'de, F> Visitor<'de> for ElementVisitor<'_, F>
where
    F: FnMut(Value) -> Result<()>,
{
    type Value = u64;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a JSON array")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<u64, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut count = 0u64;

        while let Some(value) = seq.next_element::<Value>()? {
            (self.on_element)(value).map_err(|e| de::Error::custom(format!("{:#}", e)))?;
            count += 1;
        }

        Ok(count)
    }
}

/// Writes a JSON array element by element
pub struct JsonArrayWriter<W: Write> {
    writer: W,
    count: u64,
}

impl<W: Write> JsonArrayWriter<W> {
    pub fn new(mut writer: W) -> Result<Self> {
        writer.write_all(b"[")?;
        Ok(Self { writer, count: 0 })
    }

    pub fn push<T: Serialize>(&mut self, value: &T) -> Result<()> {
        if self.count > 0 {
            self.writer.write_all(b",")?;
        }
        serde_json::to_writer(&mut self.writer, value)
            .context("Failed to serialize record")?;
        self.count += 1;
        Ok(())
    }

    /// Close the array. Always yields valid JSON, `[]` when nothing was pushed.
    pub fn finish(mut self) -> Result<(W, u64)> {
        self.writer.write_all(b"]")?;
        self.writer.flush()?;
        Ok((self.writer, self.count))
    }
}
