//! Streams a genesis document to disk as pretty-printed JSON.
//!
//! The output is byte-for-byte what `serde_json` produces with a four space
//! [`PrettyFormatter`](serde_json::ser::PrettyFormatter), but the storage map is emitted in
//! batches so a huge `top` never has to be serialized into one buffer.
use std::path::Path;

use serde_json::{map, Map, Value};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::error::GenesisError;
use crate::genesis::GenesisDocument;

const INDENT: &str = "    ";
/// Object keys leading from the root to the storage map.
const TOP_PATH: [&str; 3] = ["genesis", "raw", "top"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    /// An object on the way to the storage map; the index is the next step in `TOP_PATH`.
    Path(usize),
    /// The storage map itself.
    Top,
}

struct Frame<'a> {
    kind: FrameKind,
    entries: map::Iter<'a>,
    first: bool,
}

/// Yields the serialized document fragment by fragment.
///
/// Objects on the path to the storage map are opened lazily, every other subtree is serialized
/// in one piece, and the storage map yields up to `batch_size` entries per fragment.
pub struct GenesisFragments<'a> {
    stack: Vec<Frame<'a>>,
    top: &'a Map<String, Value>,
    batch_size: usize,
}

impl<'a> GenesisFragments<'a> {
    /// Creates the fragment iterator over `document`.
    pub fn new(document: &'a GenesisDocument, batch_size: usize) -> Self {
        Self {
            stack: vec![Frame {
                kind: FrameKind::Path(0),
                entries: document.fields().iter(),
                first: true,
            }],
            top: document.top(),
            batch_size: batch_size.max(1),
        }
    }

    fn step(&mut self, out: &mut String) -> Result<(), serde_json::Error> {
        let level = self.stack.len();
        let Some(frame) = self.stack.last_mut() else {
            return Ok(());
        };

        match frame.kind {
            FrameKind::Top => {
                for _ in 0..self.batch_size {
                    let Some((key, value)) = frame.entries.next() else {
                        close(out, frame.first, level - 1);
                        self.stack.pop();
                        break;
                    };
                    write_key(out, &mut frame.first, level, key)?;
                    write_value(out, value, level)?;
                }
            }
            FrameKind::Path(step) => {
                let Some((key, value)) = frame.entries.next() else {
                    close(out, frame.first, level - 1);
                    self.stack.pop();
                    return Ok(());
                };
                write_key(out, &mut frame.first, level, key)?;

                let next = if key == TOP_PATH[step] {
                    if step + 1 == TOP_PATH.len() {
                        Some((FrameKind::Top, self.top.iter()))
                    } else {
                        value
                            .as_object()
                            .map(|object| (FrameKind::Path(step + 1), object.iter()))
                    }
                } else {
                    None
                };

                match next {
                    Some((kind, entries)) => {
                        out.push('{');
                        self.stack.push(Frame {
                            kind,
                            entries,
                            first: true,
                        });
                    }
                    None => write_value(out, value, level)?,
                }
            }
        }
        Ok(())
    }
}

impl<'a> Iterator for GenesisFragments<'a> {
    type Item = Result<String, serde_json::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stack.is_empty() {
            return None;
        }
        let mut out = String::new();
        if self.stack.len() == 1 && self.stack[0].first {
            out.push('{');
        }
        Some(self.step(&mut out).map(|()| out))
    }
}

impl GenesisDocument {
    /// Serialized fragments of this document, see [`GenesisFragments`].
    pub fn fragments(&self, batch_size: usize) -> GenesisFragments<'_> {
        GenesisFragments::new(self, batch_size)
    }
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str(INDENT);
    }
}

fn write_key(
    out: &mut String,
    first: &mut bool,
    level: usize,
    key: &str,
) -> Result<(), serde_json::Error> {
    out.push_str(if *first { "\n" } else { ",\n" });
    *first = false;
    indent(out, level);
    out.push_str(&serde_json::to_string(key)?);
    out.push_str(": ");
    Ok(())
}

fn close(out: &mut String, empty: bool, level: usize) {
    if !empty {
        out.push('\n');
        indent(out, level);
    }
    out.push('}');
}

fn write_value(out: &mut String, value: &Value, level: usize) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(object) if !object.is_empty() => {
            out.push('{');
            let mut first = true;
            for (key, value) in object {
                write_key(out, &mut first, level + 1, key)?;
                write_value(out, value, level + 1)?;
            }
            close(out, false, level);
        }
        Value::Array(items) if !items.is_empty() => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                out.push_str(if index == 0 { "\n" } else { ",\n" });
                indent(out, level + 1);
                write_value(out, item, level + 1)?;
            }
            out.push('\n');
            indent(out, level);
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Writes every fragment to `sink`, waiting on the sink between fragments.
pub async fn write_fragments<W: AsyncWrite + Unpin>(
    fragments: GenesisFragments<'_>,
    sink: &mut W,
    path: &Path,
) -> Result<(), GenesisError> {
    for fragment in fragments {
        let fragment = fragment.map_err(GenesisError::Serialize)?;
        sink.write_all(fragment.as_bytes())
            .await
            .map_err(|source| GenesisError::Io {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

/// Writes `document` to `path`, emitting `batch_size` storage entries per write.
///
/// The file is always flushed and closed, also when writing fails. A failed write leaves an
/// incomplete file behind that must not be used.
pub async fn write_genesis(
    path: impl AsRef<Path>,
    document: &GenesisDocument,
    batch_size: usize,
) -> Result<(), GenesisError> {
    let path = path.as_ref();
    let io_error = |source| GenesisError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    let mut sink = BufWriter::new(File::create(path).await.map_err(io_error)?);

    debug!(?path, batch_size, "Writing genesis document");
    let written = write_fragments(document.fragments(batch_size), &mut sink, path).await;
    let closed = sink.shutdown().await.map_err(io_error);
    written?;
    closed?;

    info!(?path, entries = document.top().len(), "Wrote forked genesis");
    Ok(())
}
