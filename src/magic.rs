//! Content-based (magic) matching.
//!
//! A magic database is a sequence of prioritized sections, each holding an
//! indented tree of byte-match records flattened into preorder. Evaluating a
//! section walks that flattened sequence comparing each record only to its
//! immediate neighbor, rather than building a pointer tree.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::str::{self, FromStr};
use std::sync::Mutex;

use mime::Mime;
use nom::bytes::complete::{tag, take, take_until, take_while};
use nom::character::complete::{char, line_ending};
use nom::combinator::{map_res, opt};
use nom::number::complete::be_u16;
use nom::sequence::tuple;
use nom::IResult;

use crate::error::MagicError;

const MAGIC_PREFIX: &[u8] = b"MIME-Magic\0\n";

fn is_digit(b: u8) -> bool {
    b.is_ascii_digit()
}

/// A single byte-match predicate, one node of a section's indent tree.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Record {
    indent: u8,
    offset: u32,
    value: Vec<u8>,
    mask: Option<Vec<u8>>,
    /// Parsed for format compatibility; never applied to transform `value`
    /// before comparison.
    #[allow(dead_code)]
    word_size: u8,
    range: u8,
}

struct Section {
    mime: Mime,
    /// Parsed and retained, but file order decides which section wins, not
    /// this value.
    #[allow(dead_code)]
    priority: u16,
    records: Vec<Record>,
}

/// Parsed magic database: sections in file order, plus the scratch buffer
/// used to stage bytes read from a stream during matching. The buffer only
/// grows; it never shrinks between lookups.
pub struct MagicDatabase {
    sections: Vec<Section>,
    scratch: Mutex<Vec<u8>>,
}

trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

fn to_u32(bytes: &[u8], default: u32) -> u32 {
    str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn to_u16(bytes: &[u8], default: u16) -> u16 {
    str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn to_u8(bytes: &[u8], default: u8) -> u8 {
    str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

// [<indent>] — optional decimal digits terminated by '>'.
fn indent(input: &[u8]) -> IResult<&[u8], u8> {
    let (input, digits) = take_while(is_digit)(input)?;
    Ok((input, to_u8(digits, 0)))
}

// [<offset>] — decimal digits terminated by '='.
fn offset(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, digits) = take_until("=")(input)?;
    Ok((input, to_u32(digits, 0)))
}

// '~' <decimal>
fn word_size(input: &[u8]) -> IResult<&[u8], Option<u8>> {
    opt(|i| {
        let (i, _) = char('~')(i)?;
        let (i, digits) = take_while(is_digit)(i)?;
        Ok((i, to_u8(digits, 1)))
    })(input)
}

// '+' <decimal>
fn range(input: &[u8]) -> IResult<&[u8], Option<u8>> {
    opt(|i| {
        let (i, _) = char('+')(i)?;
        let (i, digits) = take_while(is_digit)(i)?;
        Ok((i, to_u8(digits, 1)))
    })(input)
}

fn mask(input: &[u8], len: u16) -> IResult<&[u8], Option<Vec<u8>>> {
    let (input, res) = opt(tuple((char('&'), take(len))))(input)?;
    Ok((input, res.map(|(_, m): (char, &[u8])| m.to_vec())))
}

/// `[<indent>]>[<offset>]=<vlen><value>[&<mask>][~<wsize>][+<range>]\n`
fn record(input: &[u8]) -> IResult<&[u8], Record> {
    let (input, indent) = indent(input)?;
    let (input, _) = tag(">")(input)?;
    let (input, offset) = offset(input)?;
    let (input, _) = tag("=")(input)?;
    let (input, vlen) = be_u16(input)?;
    let (input, value) = take(vlen)(input)?;
    let (input, mask) = mask(input, vlen)?;
    let (input, word_size) = word_size(input)?;
    let (input, range) = range(input)?;
    let (input, _) = line_ending(input)?;

    Ok((
        input,
        Record {
            indent,
            offset,
            value: value.to_vec(),
            mask,
            word_size: word_size.unwrap_or(1),
            range: range.unwrap_or(1),
        },
    ))
}

fn mime_type(input: &[u8]) -> IResult<&[u8], Mime> {
    map_res(map_res(take_until("]"), str::from_utf8), Mime::from_str)(input)
}

// '[' <priority> ':' <mime> ']' '\n'
fn section_header(input: &[u8]) -> IResult<&[u8], (u16, Mime)> {
    let (input, _) = tag("[")(input)?;
    let (input, priority_digits) = take_until(":")(input)?;
    let (input, _) = tag(":")(input)?;
    let (input, mime) = mime_type(input)?;
    let (input, _) = tag("]")(input)?;
    let (input, _) = line_ending(input)?;
    Ok((input, (to_u16(priority_digits, 0), mime)))
}

/// Parses as many well-formed records as it can starting at `input`,
/// discarding and resynchronizing at the next newline on any parse error or
/// on an unrecognized trailing tag character. Stops at the next section
/// header or end of input.
fn section_records(mut input: &[u8]) -> (&[u8], Vec<Record>) {
    let mut records = Vec::new();
    loop {
        match input.first() {
            None => break,
            Some(b'[') => break,
            Some(b'\n') => {
                input = &input[1..];
                continue;
            }
            _ => {}
        }

        match record(input) {
            Ok((rest, rec)) => {
                records.push(rec);
                input = rest;
            }
            Err(_) => match input.iter().position(|&b| b == b'\n') {
                Some(pos) => input = &input[pos + 1..],
                None => {
                    input = &input[input.len()..];
                    break;
                }
            },
        }
    }
    (input, records)
}

fn sections(mut input: &[u8]) -> Vec<Section> {
    let mut out = Vec::new();
    loop {
        while input.first() == Some(&b'\n') {
            input = &input[1..];
        }
        if input.is_empty() {
            break;
        }
        match section_header(input) {
            Ok((rest, (priority, mime))) => {
                let (rest, records) = section_records(rest);
                out.push(Section {
                    mime,
                    priority,
                    records,
                });
                input = rest;
            }
            Err(_) => break,
        }
    }
    out
}

/// Reads `need` bytes starting at `offset` from `stream` into `scratch`,
/// growing it monotonically if it's too small. Returns the number of bytes
/// actually read (fewer than `need` at EOF).
fn fill_window(stream: &mut dyn ReadSeek, scratch: &mut Vec<u8>, offset: u64, need: usize) -> usize {
    if scratch.len() < need {
        scratch.resize(need, 0);
    }
    if stream.seek(SeekFrom::Start(offset)).is_err() {
        return 0;
    }
    let mut total = 0;
    while total < need {
        match stream.read(&mut scratch[total..need]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(_) => return total,
        }
    }
    total
}

fn record_matches(rec: &Record, stream: &mut dyn ReadSeek, scratch: &mut Vec<u8>) -> bool {
    let value_len = rec.value.len();
    if value_len == 0 {
        return false;
    }
    let need = value_len + (rec.range as usize).saturating_sub(1);
    let available = fill_window(stream, scratch, rec.offset as u64, need);
    if available < value_len {
        return false;
    }

    let tries = (rec.range as usize).min(available - value_len + 1);
    for start in 0..tries {
        let window = &scratch[start..start + value_len];
        let ok = match &rec.mask {
            Some(mask) => window
                .iter()
                .zip(rec.value.iter())
                .zip(mask.iter())
                .all(|((b, v), m)| (b & m) == (v & m)),
            None => window == rec.value.as_slice(),
        };
        if ok {
            return true;
        }
    }
    false
}

/// Evaluates a section's flattened indent tree against `stream`: true iff
/// there is a root-to-leaf path where every record on it succeeds. Each
/// record is compared only to its immediate neighbor — there is no
/// persistent "current depth": a failed record whose next sibling returns
/// to a shallower indent is simply skipped, so a later root-level
/// alternative still gets tried.
fn section_matches(records: &[Record], stream: &mut dyn ReadSeek, scratch: &mut Vec<u8>) -> bool {
    let mut i = 0;
    while i < records.len() {
        let rec = &records[i];
        let next = records.get(i + 1);

        if record_matches(rec, stream, scratch) {
            match next {
                None => return true,
                Some(next) if next.indent <= rec.indent => return true,
                _ => i += 1, // descend into the child that follows
            }
        } else {
            match next {
                None => return false,
                Some(next) if next.indent > rec.indent => return false,
                _ => i += 1, // try the next sibling or shallower alternative
            }
        }
    }
    false
}

impl MagicDatabase {
    /// Parses a magic database file. The `MIME-Magic\0\n` signature check is
    /// the one fatal error this parser can produce; every other malformed
    /// byte is absorbed per-record instead of failing the whole parse.
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<MagicDatabase, MagicError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|source| MagicError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|source| MagicError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if !bytes.starts_with(MAGIC_PREFIX) {
            return Err(MagicError::BadSignature {
                path: path.to_path_buf(),
            });
        }

        let sections = sections(&bytes[MAGIC_PREFIX.len()..]);
        tracing::debug!(sections = sections.len(), "parsed magic database");

        Ok(MagicDatabase {
            sections,
            scratch: Mutex::new(Vec::new()),
        })
    }

    /// Evaluates sections in file order against `stream`, returning the MIME
    /// type of the first one whose tree accepts.
    pub fn lookup<S: Read + Seek>(&self, stream: &mut S) -> Option<Mime> {
        let mut scratch = self.scratch.lock().expect("scratch buffer poisoned");
        for section in &self.sections {
            if section_matches(&section.records, stream, &mut scratch) {
                tracing::trace!(mime = %section.mime, "magic match");
                return Some(section.mime.clone());
            }
        }
        None
    }
}
