// Record Document Grammar
//
// Canonical files and increment files share one line-oriented format:
// a begin marker, one JSON line per entry, and an end marker carrying
// the entry count. A file without its end marker was cut short.

use std::collections::HashMap;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::record::RepositoryId;

/// Version written into every begin marker.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line {
    Begin { format: u32 },
    Put { id: RepositoryId, document: String },
    Delete { id: RepositoryId },
    End { count: usize },
}

/// One entry of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Full serialized record, replacing any earlier version.
    Put { id: RepositoryId, document: String },

    /// Deletion marker.
    Delete { id: RepositoryId },
}

impl Entry {
    pub fn id(&self) -> RepositoryId {
        match self {
            Entry::Put { id, .. } | Entry::Delete { id } => *id,
        }
    }

    fn to_line(&self) -> Line {
        match self {
            Entry::Put { id, document } => Line::Put {
                id: *id,
                document: document.clone(),
            },
            Entry::Delete { id } => Line::Delete { id: *id },
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document is empty")]
    Empty,

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// An ordered set of entries bracketed by begin/end markers on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    entries: Vec<Entry>,
}

impl Document {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn from_entries(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Entry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a complete document.
    ///
    /// Blank lines are ignored. Anything else must be a begin marker,
    /// entry lines, then an end marker whose count matches.
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        if text.trim().is_empty() {
            return Err(DocumentError::Empty);
        }

        let mut entries = Vec::new();
        let mut begun = false;
        let mut ended = false;
        let mut last_line = 0;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            if raw.trim().is_empty() {
                continue;
            }
            last_line = line_no;

            let malformed = |reason: String| DocumentError::Malformed {
                line: line_no,
                reason,
            };

            if ended {
                return Err(malformed("content after end marker".into()));
            }

            let line: Line = serde_json::from_str(raw)
                .map_err(|e| malformed(format!("not a document line: {e}")))?;

            match line {
                Line::Begin { format } => {
                    if begun {
                        return Err(malformed("unexpected second begin marker".into()));
                    }
                    if format != FORMAT_VERSION {
                        return Err(malformed(format!("unsupported format version {format}")));
                    }
                    begun = true;
                }
                Line::Put { .. } | Line::Delete { .. } if !begun => {
                    return Err(malformed("entry before begin marker".into()));
                }
                Line::Put { id, document } => entries.push(Entry::Put { id, document }),
                Line::Delete { id } => entries.push(Entry::Delete { id }),
                Line::End { count } => {
                    if !begun {
                        return Err(malformed("end marker before begin marker".into()));
                    }
                    if count != entries.len() {
                        return Err(malformed(format!(
                            "end marker counts {count} entries, found {}",
                            entries.len()
                        )));
                    }
                    ended = true;
                }
            }
        }

        if !ended {
            return Err(DocumentError::Malformed {
                line: last_line,
                reason: "missing end marker".into(),
            });
        }

        Ok(Self { entries })
    }

    /// Write the document, markers included.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_line(
            writer,
            &Line::Begin {
                format: FORMAT_VERSION,
            },
        )?;
        for entry in &self.entries {
            write_line(writer, &entry.to_line())?;
        }
        write_line(
            writer,
            &Line::End {
                count: self.entries.len(),
            },
        )
    }

    pub fn render(&self) -> io::Result<String> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Fold an increment into this document.
    ///
    /// A put replaces the entry with the same id in place, or is appended
    /// when the id is new. A delete removes the entry. Later entries win.
    pub fn apply(&mut self, increment: Document) {
        let mut slots: Vec<Option<Entry>> = self.entries.drain(..).map(Some).collect();
        let mut positions: HashMap<RepositoryId, usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (e.id(), i)))
            .collect();

        for entry in increment.entries {
            let id = entry.id();
            match entry {
                Entry::Put { .. } => match positions.get(&id) {
                    Some(&i) => slots[i] = Some(entry),
                    None => {
                        positions.insert(id, slots.len());
                        slots.push(Some(entry));
                    }
                },
                Entry::Delete { .. } => {
                    if let Some(i) = positions.remove(&id) {
                        slots[i] = None;
                    }
                }
            }
        }

        self.entries = slots.into_iter().flatten().collect();
    }
}

fn write_line<W: Write>(writer: &mut W, line: &Line) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, line)?;
    writer.write_all(b"\n")
}
