//! Packed-file persistence over the radix tree.
//!
//! A store directory holds one file per contiguous key range. Each file is a
//! textual rendering of a radix subtree, one line per edge, with depth-stack
//! prefix compression: group lines (GS) push a shared prefix, record lines
//! (RS) store a value under the accumulated prefix. Files are named by the
//! smallest key they contain (percent-encoded), except the first file, which
//! is always `!`.
//!
//! Writes are staged into an in-memory batch tree and flushed on a short
//! coalesced timer owned by the caller; a flush merges the batch into the
//! candidate files and slices any file whose encoding would exceed the size
//! cap.

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, trace, warn};

use mesh_core::types::{fmt_state, Relation, Soul, State, Value};

use crate::radix::{KeyFilter, Radix};
use crate::StoreError;

/// Unit separator: starts every line and the key token.
const US: u8 = 0x1F;
/// Group marker: the line pushes a shared prefix.
const GS: u8 = 0x1D;
/// Record marker: separates the key segment from the value token.
const RS: u8 = 0x1E;
/// Precedes the state of a record.
const ETX: u8 = 0x03;

/// One stored cell: a value and, usually, its logical clock.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub state: Option<State>,
}

impl Entry {
    pub fn new(value: Value, state: Option<State>) -> Self {
        Entry { value, state }
    }
}

/// Tuning knobs for a store directory.
#[derive(Debug, Clone)]
pub struct RadiskOptions {
    /// Directory holding the packed files.
    pub dir: PathBuf,
    /// Maximum encoded bytes per file before slicing.
    pub size: usize,
    /// Staged-byte threshold that forces an early flush.
    pub batch: usize,
    /// Idle interval between flushes; the owning loop drives the timer.
    pub write: Duration,
    /// Keep decoded file trees in memory.
    pub cache: bool,
}

impl RadiskOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RadiskOptions {
            dir: dir.into(),
            size: 1024 * 1024,
            batch: 64 * 1024,
            write: Duration::from_millis(1),
            cache: true,
        }
    }
}

/// The persistence engine. Single mutator: exactly one owner stages and
/// flushes; there are no concurrent flushes by construction.
#[derive(Debug)]
pub struct Radisk {
    opts: RadiskOptions,
    batch: Radix<Entry>,
    batch_bytes: usize,
    /// Ordered start-key → file-name index of the directory.
    index: BTreeMap<String, String>,
    cache: HashMap<String, Radix<Entry>>,
}

impl Radisk {
    /// Open (or create) a store directory and build its file index.
    pub async fn open(opts: RadiskOptions) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&opts.dir).await?;
        let mut index = BTreeMap::new();
        let mut dir = tokio::fs::read_dir(&opts.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match decode_file_name(&name) {
                Some(start) => {
                    index.insert(start, name);
                }
                None => warn!(file = %name, "ignoring unrecognized file in store directory"),
            }
        }
        Ok(Radisk {
            opts,
            batch: Radix::new(),
            batch_bytes: 0,
            index,
            cache: HashMap::new(),
        })
    }

    pub fn options(&self) -> &RadiskOptions {
        &self.opts
    }

    /// Stage one write. It becomes visible to reads immediately and durable
    /// at the next flush.
    pub fn stage(&mut self, key: &str, value: Value, state: Option<State>) {
        self.batch_bytes += line_cost(key, &value);
        self.batch.set(key.as_bytes(), Entry::new(value, state));
    }

    pub fn has_pending(&self) -> bool {
        !self.batch.is_empty()
    }

    /// Whether the staged bytes crossed the early-flush threshold.
    pub fn batch_overflow(&self) -> bool {
        self.batch_bytes >= self.opts.batch
    }

    /// Read one key, batch first, then the candidate file.
    pub async fn read(&mut self, key: &str) -> Result<Option<Entry>, StoreError> {
        if let Some(entry) = self.batch.get(key.as_bytes()) {
            return Ok(Some(entry.clone()));
        }
        let Some(file) = self.candidate(key) else {
            return Ok(None);
        };
        let tree = self.load_file(&file).await?;
        Ok(tree.get(key.as_bytes()).cloned())
    }

    /// All (key, entry) pairs matching `filter`, in ascending key order.
    /// Staged writes shadow file contents.
    pub async fn scan(&mut self, filter: &KeyFilter) -> Result<Vec<(String, Entry)>, StoreError> {
        let mut merged: BTreeMap<String, Entry> = BTreeMap::new();

        for file in self.files_for(filter) {
            let tree = self.load_file(&file).await?;
            let _ = tree.scan(filter, &mut |key, entry| {
                if let Ok(key) = String::from_utf8(key.to_vec()) {
                    merged.insert(key, entry.clone());
                }
                ControlFlow::Continue(())
            });
        }
        let _ = self.batch.scan(filter, &mut |key, entry| {
            if let Ok(key) = String::from_utf8(key.to_vec()) {
                merged.insert(key, entry.clone());
            }
            ControlFlow::Continue(())
        });

        Ok(merged.into_iter().collect())
    }

    /// Flush the staged batch into the directory.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.batch).pairs();
        self.batch_bytes = 0;

        // Group staged keys by the file currently covering them.
        let mut groups: BTreeMap<String, Vec<(Vec<u8>, Entry)>> = BTreeMap::new();
        for (key, entry) in staged {
            let key_str = String::from_utf8_lossy(&key).into_owned();
            let file = self.candidate(&key_str).unwrap_or_else(|| "!".to_string());
            groups.entry(file).or_default().push((key, entry));
        }

        for (file, entries) in groups {
            let mut tree = self.load_file(&file).await.unwrap_or_else(|err| {
                // A corrupt file is reported but does not wedge the write
                // path; its salvageable half is the new data.
                warn!(%file, %err, "dropping unreadable file contents on flush");
                Radix::new()
            });
            for (key, entry) in entries {
                tree.set(&key, entry);
            }
            self.write_file(&file, tree).await?;
        }
        Ok(())
    }

    /// File currently covering `key`: the one whose start key is the largest
    /// ≤ `key`.
    fn candidate(&self, key: &str) -> Option<String> {
        self.index
            .range(..=key.to_string())
            .next_back()
            .map(|(_, name)| name.clone())
    }

    /// Files whose key range may intersect `filter`, in order.
    fn files_for(&self, filter: &KeyFilter) -> Vec<String> {
        let mut out = Vec::new();
        let starts: Vec<&String> = self.index.keys().collect();
        for (i, start) in starts.iter().enumerate() {
            if filter.past(start.as_bytes()) {
                break;
            }
            // Skip files that end before the filter begins.
            if let Some(next) = starts.get(i + 1) {
                if next.as_bytes() <= filter.lower_bound() {
                    continue;
                }
            }
            out.push(self.index[start.as_str()].clone());
        }
        out
    }

    async fn load_file(&mut self, name: &str) -> Result<Radix<Entry>, StoreError> {
        if let Some(tree) = self.cache.get(name) {
            return Ok(tree.clone());
        }
        let path = self.opts.dir.join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let tree = parse_tree(&bytes).map_err(|reason| StoreError::Parse {
            file: name.to_string(),
            reason,
        })?;
        if self.opts.cache {
            self.cache.insert(name.to_string(), tree.clone());
        }
        Ok(tree)
    }

    /// Write a tree under `name`, slicing into further files when the
    /// encoding exceeds the size cap.
    async fn write_file(&mut self, name: &str, tree: Radix<Entry>) -> Result<(), StoreError> {
        let encoded = encode_tree(&tree);
        if encoded.len() <= self.opts.size {
            return self.store_file(name, tree, encoded).await;
        }

        debug!(file = %name, bytes = encoded.len(), "slicing oversized file");
        let chunks = pack_chunks(tree.pairs(), self.opts.size);
        let mut first = true;
        for chunk in chunks {
            let mut chunk_tree = Radix::new();
            for (key, entry) in &chunk {
                chunk_tree.set(key, entry.clone());
            }
            let chunk_name = if first {
                // The original file keeps its name so existing smaller files
                // never need renames.
                first = false;
                name.to_string()
            } else {
                let start = String::from_utf8_lossy(&chunk[0].0).into_owned();
                encode_file_name(&start)
            };
            let encoded = encode_tree(&chunk_tree);
            self.store_file(&chunk_name, chunk_tree, encoded).await?;
        }
        Ok(())
    }

    async fn store_file(
        &mut self,
        name: &str,
        tree: Radix<Entry>,
        encoded: Vec<u8>,
    ) -> Result<(), StoreError> {
        tokio::fs::write(self.opts.dir.join(name), &encoded).await?;
        let start = decode_file_name(name).unwrap_or_default();
        self.index.insert(start, name.to_string());
        if self.opts.cache {
            self.cache.insert(name.to_string(), tree);
        } else {
            self.cache.remove(name);
        }
        trace!(file = %name, bytes = encoded.len(), "stored file");
        Ok(())
    }
}

/// Greedily pack ordered entries into chunks whose encoding fits `cap`,
/// bisecting any chunk the estimate got wrong. A single oversize entry still
/// gets its own chunk and is written inline.
fn pack_chunks(entries: Vec<(Vec<u8>, Entry)>, cap: usize) -> Vec<Vec<(Vec<u8>, Entry)>> {
    let mut chunks = Vec::new();
    let mut current: Vec<(Vec<u8>, Entry)> = Vec::new();
    let mut current_cost = 0usize;

    for (key, entry) in entries {
        let cost = line_cost(&String::from_utf8_lossy(&key), &entry.value);
        if !current.is_empty() && current_cost + cost > cap {
            chunks.push(std::mem::take(&mut current));
            current_cost = 0;
        }
        current_cost += cost;
        current.push((key, entry));
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // The estimate ignores group-line overhead; verify against the real
    // encoding and bisect any chunk that still overflows.
    let mut verified = Vec::new();
    for chunk in chunks {
        verify_chunk(chunk, cap, &mut verified);
    }
    verified
}

fn verify_chunk(chunk: Vec<(Vec<u8>, Entry)>, cap: usize, out: &mut Vec<Vec<(Vec<u8>, Entry)>>) {
    if chunk.len() <= 1 {
        out.push(chunk);
        return;
    }
    let mut tree = Radix::new();
    for (key, entry) in &chunk {
        tree.set(key, entry.clone());
    }
    if encode_tree(&tree).len() <= cap {
        out.push(chunk);
        return;
    }
    let mid = chunk.len() / 2;
    let mut chunk = chunk;
    let tail = chunk.split_off(mid);
    verify_chunk(chunk, cap, out);
    verify_chunk(tail, cap, out);
}

/// Worst-case encoded size of one record line, used for batch accounting and
/// chunk packing. Ignores prefix compression, so it only overestimates.
fn line_cost(key: &str, value: &Value) -> usize {
    let value_len = match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(n) => 1 + fmt_state(*n).len(),
        Value::Text(t) => 1 + esc_len(t.as_bytes()),
        Value::Link(r) => 1 + esc_len(r.soul.as_str().as_bytes()),
    };
    // US depth US key RS value ETX state LF
    1 + 6 + 1 + esc_len(key.as_bytes()) + 1 + value_len + 1 + 24 + 1
}

fn esc_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .map(|&b| match b {
            b'\\' => 2,
            b if b < 0x20 => 4,
            _ => 1,
        })
        .sum()
}

/// Escape a text segment: `\` and control bytes, which are all structural in
/// the line grammar, never appear raw.
fn esc_into(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b if b < 0x20 => {
                out.extend_from_slice(format!("\\x{b:02x}").as_bytes());
            }
            b => out.push(b),
        }
    }
}

fn unesc(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                match bytes.get(i + 1) {
                    Some(b'\\') => {
                        out.push(b'\\');
                        i += 2;
                    }
                    Some(b'x') => {
                        let hex = bytes
                            .get(i + 2..i + 4)
                            .ok_or_else(|| "truncated escape".to_string())?;
                        let hex = std::str::from_utf8(hex).map_err(|_| "bad escape".to_string())?;
                        let b = u8::from_str_radix(hex, 16).map_err(|_| "bad escape".to_string())?;
                        out.push(b);
                        i += 4;
                    }
                    _ => return Err("unknown escape".to_string()),
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Render a tree into the packed line format.
pub fn encode_tree(tree: &Radix<Entry>) -> Vec<u8> {
    let mut out = Vec::new();
    tree.visit(&mut |depth, label, value| {
        out.push(US);
        out.extend_from_slice(depth.to_string().as_bytes());
        match value {
            Some(entry) => {
                out.push(US);
                esc_into(label, &mut out);
                out.push(RS);
                encode_value(&entry.value, &mut out);
                out.push(ETX);
                if let Some(state) = entry.state {
                    out.extend_from_slice(fmt_state(state).as_bytes());
                }
            }
            None => {
                out.push(GS);
                esc_into(label, &mut out);
            }
        }
        out.push(b'\n');
    });
    out
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        // The tombstone: key present, value region empty.
        Value::Null => {}
        Value::Bool(true) => out.push(b'+'),
        Value::Bool(false) => out.push(b'-'),
        Value::Number(n) => {
            out.push(b'+');
            out.extend_from_slice(fmt_state(*n).as_bytes());
        }
        Value::Text(t) => {
            out.push(b'"');
            esc_into(t.as_bytes(), out);
        }
        Value::Link(r) => {
            out.push(b'#');
            esc_into(r.soul.as_str().as_bytes(), out);
        }
    }
}

/// Parse a packed file back into a tree. `undefined` value tokens (written
/// by older encoders for unencodable objects) drop their key.
pub fn parse_tree(bytes: &[u8]) -> Result<Radix<Entry>, String> {
    let mut tree = Radix::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();

    for (lineno, line) in bytes.split(|&b| b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let err = |msg: &str| format!("line {}: {msg}", lineno + 1);

        if line.first() != Some(&US) {
            return Err(err("missing unit separator"));
        }
        let rest = &line[1..];
        let marker_at = rest
            .iter()
            .position(|&b| b == US || b == GS)
            .ok_or_else(|| err("missing segment marker"))?;
        let depth: usize = std::str::from_utf8(&rest[..marker_at])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| err("bad depth"))?;
        if depth > stack.len() {
            return Err(err("depth skips a level"));
        }
        stack.truncate(depth);
        let marker = rest[marker_at];
        let body = &rest[marker_at + 1..];

        if marker == GS {
            stack.push(unesc(body).map_err(|e| err(&e))?);
            continue;
        }

        let rs = body
            .iter()
            .position(|&b| b == RS)
            .ok_or_else(|| err("missing record separator"))?;
        let segment = unesc(&body[..rs]).map_err(|e| err(&e))?;
        let value_region = &body[rs + 1..];
        let etx = value_region
            .iter()
            .position(|&b| b == ETX)
            .ok_or_else(|| err("missing state separator"))?;
        let token = &value_region[..etx];
        let state_text = &value_region[etx + 1..];

        stack.push(segment);
        let key: Vec<u8> = stack.concat();

        let state = if state_text.is_empty() {
            None
        } else {
            Some(
                std::str::from_utf8(state_text)
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| err("bad state"))?,
            )
        };
        match parse_value(token).map_err(|e| err(&e))? {
            Some(value) => {
                tree.set(&key, Entry::new(value, state));
            }
            None => trace!("skipping undefined value"),
        }
    }
    Ok(tree)
}

fn parse_value(token: &[u8]) -> Result<Option<Value>, String> {
    if token.is_empty() {
        return Ok(Some(Value::Null));
    }
    if token == b"undefined" {
        return Ok(None);
    }
    let body = &token[1..];
    match token[0] {
        b'"' => {
            let text = unesc(body)?;
            let text = String::from_utf8(text).map_err(|_| "bad utf-8 in value".to_string())?;
            Ok(Some(Value::Text(text)))
        }
        b'+' if body.is_empty() => Ok(Some(Value::Bool(true))),
        b'-' if body.is_empty() => Ok(Some(Value::Bool(false))),
        b'+' => {
            let n: f64 = std::str::from_utf8(body)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| "bad number".to_string())?;
            Ok(Some(Value::Number(n)))
        }
        b'#' => {
            let soul = unesc(body)?;
            let soul = String::from_utf8(soul).map_err(|_| "bad utf-8 in soul".to_string())?;
            Ok(Some(Value::Link(Relation {
                soul: Soul::from(soul),
            })))
        }
        _ => Err("unknown value token".to_string()),
    }
}

/// Percent-encode a start key into a file name; the empty key is the first
/// file, `!`.
pub fn encode_file_name(start: &str) -> String {
    if start.is_empty() {
        return "!".to_string();
    }
    let mut out = String::new();
    for b in start.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            b => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Invert [`encode_file_name`]. `None` for names this store never produces.
pub fn decode_file_name(name: &str) -> Option<String> {
    if name == "!" {
        return Some(String::new());
    }
    let bytes = name.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = std::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(bytes[i]);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}
