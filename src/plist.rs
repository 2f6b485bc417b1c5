//! Minimal XML property-list reader for the image directory
//!
//! The directory only needs the keyed path
//! `plist → dict → resource-fork → blkx → array of dicts`, where each dict
//! carries a base64 `Data` payload (the `mish` table) and a `Name` or
//! `CFName` string. Only dict, array, string and data values are
//! materialized; integers, reals, dates and booleans inside irrelevant
//! subtrees are ignored.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::Reader;

use crate::error::{DmgError, Result};

/// One `blkx` directory entry: a name and the raw `mish` table bytes
#[derive(Debug, Clone)]
pub struct BlkxEntry {
    pub name: String,
    pub table: Vec<u8>,
}

/// Property-list value, reduced to the subset the directory walk needs
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Dict(Vec<(String, Value)>),
    Array(Vec<Value>),
    String(String),
    Data(Vec<u8>),
    Ignored,
}

impl Value {
    fn as_dict(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Dict(pairs) => Some(pairs),
            _ => None,
        }
    }
}

fn dict_get<'a>(pairs: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn dict_get_string<'a>(pairs: &'a [(String, Value)], key: &str) -> Option<&'a str> {
    match dict_get(pairs, key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// Extract the `blkx` entries from an XML plist directory
pub fn parse_blkx(xml: &[u8]) -> Result<Vec<BlkxEntry>> {
    let root = parse_document(xml)?;
    let root_dict = root
        .as_dict()
        .ok_or_else(|| DmgError::InvalidStructure("missing root dict".into()))?;

    let resource_fork = dict_get(root_dict, "resource-fork")
        .and_then(Value::as_dict)
        .ok_or_else(|| DmgError::InvalidStructure("missing resource-fork dict".into()))?;

    let blkx = match dict_get(resource_fork, "blkx") {
        Some(Value::Array(items)) => items,
        _ => return Err(DmgError::InvalidStructure("missing blkx array".into())),
    };

    let mut entries = Vec::with_capacity(blkx.len());
    for item in blkx {
        let Some(pairs) = item.as_dict() else {
            continue;
        };

        let table = match dict_get(pairs, "Data") {
            Some(Value::Data(bytes)) => bytes.clone(),
            _ => return Err(DmgError::InvalidStructure("missing data in blkx entry".into())),
        };

        // Name, with CFName as the fallback when Name is absent or empty
        let mut name = dict_get_string(pairs, "Name").unwrap_or("");
        if name.is_empty() {
            name = dict_get_string(pairs, "CFName").unwrap_or("");
        }

        entries.push(BlkxEntry {
            name: name.to_string(),
            table,
        });
    }

    Ok(entries)
}

fn xml_err(e: quick_xml::Error) -> DmgError {
    DmgError::InvalidStructure(format!("xml: {e}"))
}

/// Parse a plist document down to its root dict
fn parse_document(xml: &[u8]) -> Result<Value> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => {
                if e.name().as_ref() != b"plist" {
                    return Err(DmgError::InvalidStructure("plist root element not found".into()));
                }
                return read_plist_children(&mut reader);
            }
            Event::Eof => {
                return Err(DmgError::InvalidStructure("empty plist document".into()));
            }
            // XML declaration, doctype, comments before the root
            _ => {}
        }
    }
}

/// Find the root dict among the children of `<plist>`
fn read_plist_children(reader: &mut Reader<&[u8]>) -> Result<Value> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if name == b"dict" {
                    return read_dict(reader).map(Value::Dict);
                }
                skip_element(reader, &name)?;
            }
            Event::Empty(e) => {
                if e.name().as_ref() == b"dict" {
                    return Ok(Value::Dict(Vec::new()));
                }
            }
            Event::End(_) | Event::Eof => {
                return Err(DmgError::InvalidStructure("missing root dict".into()));
            }
            _ => {}
        }
    }
}

/// Read a value whose opening tag (`tag`) has just been consumed
fn read_value(reader: &mut Reader<&[u8]>, tag: &[u8]) -> Result<Value> {
    match tag {
        b"dict" => read_dict(reader).map(Value::Dict),
        b"array" => read_array(reader).map(Value::Array),
        b"string" => read_text(reader).map(Value::String),
        b"data" => {
            let text = read_text(reader)?;
            decode_base64(&text).map(Value::Data)
        }
        _ => {
            skip_element(reader, tag)?;
            Ok(Value::Ignored)
        }
    }
}

/// Value for a self-closing element like `<dict/>` or `<data/>`
fn empty_value(tag: &[u8]) -> Value {
    match tag {
        b"dict" => Value::Dict(Vec::new()),
        b"array" => Value::Array(Vec::new()),
        b"string" => Value::String(String::new()),
        b"data" => Value::Data(Vec::new()),
        _ => Value::Ignored,
    }
}

fn read_dict(reader: &mut Reader<&[u8]>) -> Result<Vec<(String, Value)>> {
    let mut pairs = Vec::new();
    let mut pending_key: Option<String> = None;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if name == b"key" {
                    pending_key = Some(read_text(reader)?);
                } else if let Some(key) = pending_key.take() {
                    let value = read_value(reader, &name)?;
                    pairs.push((key, value));
                } else {
                    // value without a preceding key: ignore it
                    skip_element(reader, &name)?;
                }
            }
            Event::Empty(e) => {
                let name = e.name().as_ref().to_vec();
                if name == b"key" {
                    pending_key = Some(String::new());
                } else if let Some(key) = pending_key.take() {
                    pairs.push((key, empty_value(&name)));
                }
            }
            Event::End(_) => return Ok(pairs),
            Event::Eof => {
                return Err(DmgError::InvalidStructure("unterminated dict".into()));
            }
            _ => {}
        }
    }
}

fn read_array(reader: &mut Reader<&[u8]>) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                items.push(read_value(reader, &name)?);
            }
            Event::Empty(e) => {
                items.push(empty_value(e.name().as_ref()));
            }
            Event::End(_) => return Ok(items),
            Event::Eof => {
                return Err(DmgError::InvalidStructure("unterminated array".into()));
            }
            _ => {}
        }
    }
}

/// Collect the text content of a leaf element up to its closing tag
fn read_text(reader: &mut Reader<&[u8]>) -> Result<String> {
    let mut text = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Text(e) => {
                let piece = e.unescape().map_err(xml_err)?;
                text.push_str(&piece);
            }
            Event::CData(e) => {
                text.push_str(&String::from_utf8_lossy(&e));
            }
            Event::End(_) => return Ok(text),
            Event::Eof => {
                return Err(DmgError::InvalidStructure("unterminated element".into()));
            }
            Event::Start(_) => {
                return Err(DmgError::InvalidStructure("unexpected nested element".into()));
            }
            _ => {}
        }
    }
}

/// Consume everything up to the closing tag of `tag`
fn skip_element(reader: &mut Reader<&[u8]>, tag: &[u8]) -> Result<()> {
    let mut buf = Vec::new();
    reader
        .read_to_end_into(QName(tag), &mut buf)
        .map_err(xml_err)?;
    Ok(())
}

/// Base64 decode with embedded whitespace tolerated; plists wrap data
/// payloads across indented lines
fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let cleaned: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(&cleaned)
        .map_err(|e| DmgError::InvalidStructure(format!("base64: {e}")))
}
