//! Source-map lookups for rewriting error stacks.
//!
//! Supports flat maps and index maps with `sections`. Only what a stack
//! rewrite needs is kept: generated position, original position and
//! source name.

use serde_json::Value;

const VLQ_BASE_SHIFT: u32 = 5;
const VLQ_BASE_MASK: i32 = (1 << VLQ_BASE_SHIFT) - 1;
const VLQ_CONTINUATION_BIT: i32 = 1 << VLQ_BASE_SHIFT;

const FRAME_SEPARATOR: &str = "\n    at ";

#[derive(Debug, thiserror::Error)]
pub enum SourceMapError {
    #[error("source map is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("source map is not an object")]
    NotAnObject,

    #[error("invalid base64 VLQ digit at byte {0}")]
    InvalidVlq(usize),

    #[error("mapping ends inside a VLQ value")]
    UnexpectedEnd,

    #[error("source index {0} out of range")]
    SourceIndex(i64),

    #[error("mapping position overflows")]
    Overflow,
}

/// Zero-based line and column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Offset {
    pub line: i32,
    pub column: i32,
}

impl Offset {
    pub const fn new(line: i32, column: i32) -> Self {
        Self { line, column }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub generated: Offset,
    /// `None` for segments that only carry a generated column.
    pub original: Option<Offset>,
    pub source: String,
    pub name_index: i32,
}

impl Mapping {
    /// `source:line:column`, one-based, or empty when there is no original
    /// position.
    pub fn to_location_string(&self) -> String {
        match self.original {
            Some(original) => format!("{}:{}:{}", self.source, original.line + 1, original.column + 1),
            None => String::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SourceMap {
    mappings: Vec<Mapping>,
}

impl SourceMap {
    pub fn parse(json: &str) -> Result<Self, SourceMapError> {
        let payload: Value = serde_json::from_str(json)?;
        if !payload.is_object() {
            return Err(SourceMapError::NotAnObject);
        }

        let mut map = Self::default();
        match payload.get("sections") {
            Some(sections) if is_truthy(sections) => map.parse_sections(sections)?,
            _ => map.parse_map(&payload, Offset::new(0, 0))?,
        }
        map.mappings.sort_by_key(|mapping| mapping.generated);

        Ok(map)
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Greatest mapping whose generated position is `<=` the query.
    pub fn find_entry(&self, line: i32, column: i32) -> Option<&Mapping> {
        let query = Offset::new(line, column);
        let after = self.mappings.partition_point(|mapping| mapping.generated <= query);
        after.checked_sub(1).map(|index| &self.mappings[index])
    }

    fn parse_sections(&mut self, sections: &Value) -> Result<(), SourceMapError> {
        let Some(sections) = sections.as_array() else {
            return Ok(());
        };

        for section in sections {
            let (Some(map), Some(offset)) = (section.get("map"), section.get("offset")) else {
                continue;
            };
            let line = offset.get("line").and_then(as_i32);
            let column = offset.get("column").and_then(as_i32);
            let (Some(line), Some(column)) = (line, column) else {
                continue;
            };
            if line < 0 || column < 0 {
                continue;
            }
            self.parse_map(map, Offset::new(line, column))?;
        }
        Ok(())
    }

    fn parse_map(&mut self, map: &Value, start: Offset) -> Result<(), SourceMapError> {
        let Some(sources) = map.get("sources").and_then(Value::as_array) else {
            return Ok(());
        };
        let sources: Vec<String> = sources
            .iter()
            .map(|source| source.as_str().unwrap_or_default().to_string())
            .collect();

        let Some(mappings) = map.get("mappings").and_then(Value::as_str) else {
            return Ok(());
        };
        self.parse_mappings(mappings, &sources, start)
    }

    fn parse_mappings(&mut self, mappings: &str, sources: &[String], start: Offset) -> Result<(), SourceMapError> {
        let input = mappings.as_bytes();
        let mut pos = 0;
        let mut generated = start;
        let mut source_index: i64 = 0;
        let mut original = Offset::new(0, 0);
        let mut name_index = 0;

        let at_segment_end = |pos: usize| pos >= input.len() || input[pos] == b',' || input[pos] == b';';

        while pos < input.len() {
            if input[pos] == b',' {
                pos += 1;
            } else {
                while pos < input.len() && input[pos] == b';' {
                    generated.line = accumulate(generated.line, 1)?;
                    generated.column = 0;
                    pos += 1;
                }
                if pos == input.len() {
                    break;
                }
            }

            generated.column = accumulate(generated.column, decode_vlq(input, &mut pos)?)?;
            if at_segment_end(pos) {
                self.mappings.push(Mapping {
                    generated,
                    original: None,
                    source: String::new(),
                    name_index: -1,
                });
                continue;
            }

            source_index += i64::from(decode_vlq(input, &mut pos)?);
            original.line = accumulate(original.line, decode_vlq(input, &mut pos)?)?;
            original.column = accumulate(original.column, decode_vlq(input, &mut pos)?)?;
            if !at_segment_end(pos) {
                name_index = accumulate(name_index, decode_vlq(input, &mut pos)?)?;
            }

            let source = usize::try_from(source_index)
                .ok()
                .and_then(|index| sources.get(index))
                .ok_or(SourceMapError::SourceIndex(source_index))?;

            self.mappings.push(Mapping {
                generated,
                original: Some(original),
                source: source.clone(),
                name_index,
            });
        }
        Ok(())
    }
}

fn accumulate(total: i32, delta: i32) -> Result<i32, SourceMapError> {
    total.checked_add(delta).ok_or(SourceMapError::Overflow)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_i32(value: &Value) -> Option<i32> {
    value.as_i64().and_then(|n| i32::try_from(n).ok())
}

fn base64_digit(byte: u8) -> Option<i32> {
    let digit = match byte {
        b'A'..=b'Z' => byte - b'A',
        b'a'..=b'z' => byte - b'a' + 26,
        b'0'..=b'9' => byte - b'0' + 52,
        b'+' => 62,
        b'/' => 63,
        _ => return None,
    };
    Some(i32::from(digit))
}

/// Decodes one base64 VLQ value starting at `*pos`.
pub fn decode_vlq(input: &[u8], pos: &mut usize) -> Result<i32, SourceMapError> {
    let mut result: i32 = 0;
    let mut shift = 0;

    loop {
        let byte = *input.get(*pos).ok_or(SourceMapError::UnexpectedEnd)?;
        let digit = base64_digit(byte).ok_or(SourceMapError::InvalidVlq(*pos))?;
        *pos += 1;

        if shift >= 32 {
            return Err(SourceMapError::InvalidVlq(*pos - 1));
        }
        result = result.wrapping_add((digit & VLQ_BASE_MASK) << shift);
        shift += VLQ_BASE_SHIFT;

        if digit & VLQ_CONTINUATION_BIT == 0 {
            break;
        }
    }

    let negative = result & 1 != 0;
    let value = result >> 1;
    Ok(if negative { -value } else { value })
}

/// One frame of a captured stack.
#[derive(Clone, Debug, Default)]
pub struct CallSite {
    pub function_name: Option<String>,
    pub method_name: Option<String>,
    pub type_name: Option<String>,
    /// One-based, as reported by the engine.
    pub line: i32,
    pub column: i32,
    /// The frame as the engine would print it.
    pub raw: String,
}

impl CallSite {
    fn display_name(&self) -> String {
        let prefix = match self.type_name.as_deref() {
            Some(type_name) if type_name != "global" => format!("{}.", type_name),
            _ => String::new(),
        };
        let name = self
            .function_name
            .as_deref()
            .or(self.method_name.as_deref())
            .filter(|name| !name.is_empty())
            .unwrap_or("<anonymous>");
        format!("{}{}", prefix, name)
    }
}

/// Error string followed by the raw frames.
pub fn format_stack(error: &str, frames: &[CallSite]) -> String {
    let mut stack = error.to_string();
    for frame in frames {
        stack.push_str(FRAME_SEPARATOR);
        stack.push_str(&frame.raw);
    }
    stack
}

/// Rebuilds a stack with frames mapped back to original sources.
///
/// Frames without a mapping keep their raw text. An unparsable map yields
/// the unmapped stack.
pub fn rewrite_stack(error: &str, frames: &[CallSite], source_map: &str) -> String {
    let map = match SourceMap::parse(source_map) {
        Ok(map) => map,
        Err(e) => {
            log::debug!("ignoring source map: {}", e);
            return format_stack(error, frames);
        }
    };

    let mut stack = error.to_string();
    for frame in frames {
        let location = map
            .find_entry(frame.line.saturating_sub(1), frame.column.saturating_sub(1))
            .map(Mapping::to_location_string)
            .unwrap_or_default();

        stack.push_str(FRAME_SEPARATOR);
        if location.is_empty() {
            stack.push_str(&frame.raw);
        } else {
            stack.push_str(&format!("{} ({})", frame.display_name(), location));
        }
    }
    stack
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlq(s: &str) -> i32 {
        let mut pos = 0;
        let value = decode_vlq(s.as_bytes(), &mut pos).unwrap();
        assert_eq!(pos, s.len());
        value
    }

    #[test]
    fn test_decode_vlq() {
        assert_eq!(vlq("A"), 0);
        assert_eq!(vlq("C"), 1);
        assert_eq!(vlq("D"), -1);
        assert_eq!(vlq("gB"), 16);
        assert_eq!(vlq("2H"), 123);
        assert_eq!(vlq("//D"), -2047);
    }

    #[test]
    fn test_decode_vlq_errors() {
        let mut pos = 0;
        assert!(matches!(decode_vlq(b"g", &mut pos), Err(SourceMapError::UnexpectedEnd)));
        let mut pos = 0;
        assert!(matches!(decode_vlq(b"!", &mut pos), Err(SourceMapError::InvalidVlq(0))));
    }

    #[test]
    fn test_parse_flat_map() {
        // line 0: col 0 -> a.ts 0:0, col 4 -> a.ts 0:4; line 2: col 2 -> b.ts 4:0
        let map = SourceMap::parse(r#"{"version":3,"sources":["a.ts","b.ts"],"mappings":"AAAA,IAAI;;ECIJ"}"#)
            .unwrap();

        let got: Vec<_> = map.mappings().iter().map(Mapping::to_location_string).collect();
        assert_eq!(got, vec!["a.ts:1:1", "a.ts:1:5", "b.ts:5:1"]);
        assert_eq!(map.mappings()[2].generated, Offset::new(2, 2));
    }

    #[test]
    fn test_generated_only_segment() {
        let map = SourceMap::parse(r#"{"sources":["a.ts"],"mappings":"A,EAAA"}"#).unwrap();

        assert_eq!(map.mappings()[0].original, None);
        assert_eq!(map.mappings()[0].to_location_string(), "");
        assert_eq!(map.mappings()[1].to_location_string(), "a.ts:1:1");
    }

    #[test]
    fn test_find_entry() {
        let map = SourceMap::parse(r#"{"sources":["a.ts"],"mappings":"EAAA,IAAI;EACA"}"#).unwrap();

        assert!(map.find_entry(0, 0).is_none());
        assert_eq!(map.find_entry(0, 2).unwrap().generated, Offset::new(0, 2));
        assert_eq!(map.find_entry(0, 5).unwrap().generated, Offset::new(0, 2));
        assert_eq!(map.find_entry(0, 6).unwrap().generated, Offset::new(0, 6));
        assert_eq!(map.find_entry(0, 100).unwrap().generated, Offset::new(0, 6));
        assert_eq!(map.find_entry(7, 0).unwrap().generated, Offset::new(1, 2));
        assert!(SourceMap::default().find_entry(0, 0).is_none());
    }

    #[test]
    fn test_sections_apply_offsets() {
        let json = r#"{
            "version": 3,
            "sections": [
                {"offset": {"line": 10, "column": 5}, "map": {"sources": ["s.ts"], "mappings": "AAAA;AACA"}},
                {"offset": {"line": 1}, "map": {"sources": ["skipped.ts"], "mappings": "AAAA"}},
                {"offset": {"line": 0, "column": 0}, "map": {"sources": ["first.ts"], "mappings": "AAAA"}}
            ]
        }"#;
        let map = SourceMap::parse(json).unwrap();

        let generated: Vec<_> = map.mappings().iter().map(|m| m.generated).collect();
        assert_eq!(generated, vec![Offset::new(0, 0), Offset::new(10, 5), Offset::new(11, 0)]);
        assert_eq!(map.mappings()[0].source, "first.ts");
        assert_eq!(map.mappings()[2].to_location_string(), "s.ts:2:1");
    }

    #[test]
    fn test_bad_source_index() {
        assert!(matches!(
            SourceMap::parse(r#"{"sources":["a.ts"],"mappings":"ACAA"}"#),
            Err(SourceMapError::SourceIndex(1))
        ));
    }

    #[test]
    fn test_overflowing_positions_are_rejected() {
        // Each segment advances the column by 2^29.
        let columns = r#"{"sources":["a.js"],"mappings":"ggggggB,ggggggB,ggggggB,ggggggB,ggggggB"}"#;
        assert!(matches!(SourceMap::parse(columns), Err(SourceMapError::Overflow)));

        let lines = r#"{"sources":["a.js"],"mappings":"AAggggggBA,AAggggggBA,AAggggggBA,AAggggggBA"}"#;
        assert!(matches!(SourceMap::parse(lines), Err(SourceMapError::Overflow)));
    }

    #[test]
    fn test_rewrite_stack_survives_malformed_input() {
        let frame = CallSite {
            function_name: Some("f".into()),
            line: i32::MIN,
            column: i32::MIN,
            raw: "f (a.js:1:1)".into(),
            ..Default::default()
        };

        let overflowing = r#"{"sources":["a.js"],"mappings":"ggggggB,ggggggB,ggggggB,ggggggB,ggggggB"}"#;
        assert_eq!(
            rewrite_stack("Error: e", &[frame.clone()], overflowing),
            "Error: e\n    at f (a.js:1:1)"
        );

        let valid = r#"{"sources":["a.js"],"mappings":"AAAA"}"#;
        assert_eq!(rewrite_stack("Error: e", &[frame], valid), "Error: e\n    at f (a.js:1:1)");
    }

    #[test]
    fn test_non_string_sources_become_empty() {
        let map = SourceMap::parse(r#"{"sources":[null],"mappings":"AAAA"}"#).unwrap();
        assert_eq!(map.mappings()[0].to_location_string(), ":1:1");
    }

    #[test]
    fn test_rewrite_stack() {
        let map = r#"{"sources":["app.ts"],"mappings":"AAAA;;AAEE"}"#;
        let frames = vec![
            CallSite {
                function_name: Some("run".into()),
                type_name: Some("Job".into()),
                line: 3,
                column: 1,
                raw: "Job.run (bundle.js:3:1)".into(),
                ..Default::default()
            },
            CallSite {
                type_name: Some("global".into()),
                line: 1,
                column: 1,
                raw: "bundle.js:1:1".into(),
                ..Default::default()
            },
            CallSite {
                line: 0,
                column: 0,
                raw: "native".into(),
                ..Default::default()
            },
        ];

        assert_eq!(
            rewrite_stack("Error: boom", &frames, map),
            "Error: boom\n    at Job.run (app.ts:3:3)\n    at <anonymous> (app.ts:1:1)\n    at native"
        );
    }

    #[test]
    fn test_rewrite_stack_with_invalid_map() {
        let frames = vec![CallSite {
            raw: "f (x.js:1:1)".into(),
            ..Default::default()
        }];
        assert_eq!(
            rewrite_stack("TypeError: x", &frames, "not json"),
            "TypeError: x\n    at f (x.js:1:1)"
        );
        assert_eq!(format_stack("E", &[]), "E");
    }
}
