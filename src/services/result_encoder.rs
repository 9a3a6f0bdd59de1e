use std::fmt::Write as _;

use crate::api::middleware::AppError;
use crate::services::database::{ResultCursor, ResultRow};

/// How SQL NULL cells are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullEncoding {
    /// Bare `null`, distinguishable from an empty string
    JsonNull,
    /// `""`, indistinguishable from an empty string (legacy output)
    EmptyString,
}

/// Streams a result cursor into a JSONP document:
///
/// ```text
/// cb({ "columns" : [ "id", "name" ],
/// "results" : [ [ "1", "Ann" ],
/// [ "2", "O'Brien" ]]})
/// ```
///
/// The callback is written verbatim; callers decide whether it is trusted.
#[derive(Debug, Clone, Copy)]
pub struct ResultEncoder {
    nulls: NullEncoding,
}

impl ResultEncoder {
    pub fn new(nulls: NullEncoding) -> Self {
        Self { nulls }
    }

    /// Drain `cursor` into a complete document. Nothing is returned unless every
    /// row was fetched, so a failing cursor never yields half a payload.
    pub async fn encode(
        &self,
        callback: &str,
        cursor: &mut (dyn ResultCursor + '_),
    ) -> Result<String, AppError> {
        let mut document = JsonpDocument::begin(callback, cursor.columns(), self.nulls);
        while let Some(row) = cursor.next_row().await? {
            document.push_row(&row);
        }
        Ok(document.finish())
    }

    #[cfg(test)]
    fn encode_rows<I>(&self, callback: &str, columns: &[String], rows: I) -> String
    where
        I: IntoIterator<Item = ResultRow>,
    {
        let mut document = JsonpDocument::begin(callback, columns, self.nulls);
        for row in rows {
            document.push_row(&row);
        }
        document.finish()
    }

    /// `cb({"error":"<message>"})`
    pub fn encode_error(callback: &str, message: &str) -> String {
        let mut out = String::with_capacity(callback.len() + message.len() + 16);
        out.push_str(callback);
        out.push_str("({\"error\":\"");
        escape_into(message, &mut out);
        out.push_str("\"})");
        out
    }
}

struct JsonpDocument {
    out: String,
    rows: usize,
    nulls: NullEncoding,
}

impl JsonpDocument {
    fn begin(callback: &str, columns: &[String], nulls: NullEncoding) -> Self {
        let mut document = Self {
            out: String::with_capacity(256),
            rows: 0,
            nulls,
        };
        document.out.push_str(callback);
        document.out.push_str("({ \"columns\" : ");
        document.push_list(columns.iter().map(|c| Some(c.as_str())));
        document.out.push_str(",\n\"results\" : ");
        document
    }

    fn push_row(&mut self, row: &ResultRow) {
        self.out.push_str(if self.rows == 0 { "[ " } else { ",\n" });
        self.push_list(row.iter().map(|cell| cell.as_deref()));
        self.rows += 1;
    }

    fn finish(mut self) -> String {
        self.out.push_str(if self.rows == 0 { "[]" } else { "]" });
        self.out.push_str("})");
        self.out
    }

    fn push_list<'a, I>(&mut self, cells: I)
    where
        I: Iterator<Item = Option<&'a str>>,
    {
        let mut empty = true;
        for cell in cells {
            self.out.push_str(if empty { "[ " } else { ", " });
            empty = false;
            match (cell, self.nulls) {
                (Some(value), _) => {
                    self.out.push('"');
                    escape_into(value, &mut self.out);
                    self.out.push('"');
                }
                (None, NullEncoding::JsonNull) => self.out.push_str("null"),
                (None, NullEncoding::EmptyString) => self.out.push_str("\"\""),
            }
        }
        self.out.push_str(if empty { "[]" } else { " ]" });
    }
}

/// Escape `value` for a double-quoted string that is valid both as JSON and
/// inside an inline `<script>` block
pub fn escape_into(value: &str, out: &mut String) {
    let quoted = serde_json::Value::from(value).to_string();
    let inner = &quoted[1..quoted.len() - 1];
    for c in inner.chars() {
        match c {
            '<' | '>' | '&' | '\u{2028}' | '\u{2029}' => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::BufferedCursor;
    use serde_json::{json, Value};

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn row(cells: &[Option<&str>]) -> ResultRow {
        cells.iter().map(|c| c.map(str::to_string)).collect()
    }

    /// Parse the JSON object inside `callback( ... )`
    fn unwrap_jsonp(callback: &str, body: &str) -> Value {
        let inner = body
            .strip_prefix(callback)
            .and_then(|rest| rest.strip_prefix('('))
            .and_then(|rest| rest.strip_suffix(')'))
            .expect("jsonp wrapper");
        serde_json::from_str(inner).expect("valid json")
    }

    #[test]
    fn test_exact_layout() {
        let encoder = ResultEncoder::new(NullEncoding::JsonNull);
        let body = encoder.encode_rows(
            "cb",
            &cols(&["id", "name"]),
            vec![row(&[Some("1"), Some("Ann")]), row(&[Some("2"), Some("O'Brien")])],
        );
        assert_eq!(
            body,
            "cb({ \"columns\" : [ \"id\", \"name\" ],\n\"results\" : [ [ \"1\", \"Ann\" ],\n[ \"2\", \"O'Brien\" ]]})"
        );
    }

    #[test]
    fn test_zero_rows_gives_empty_results() {
        let encoder = ResultEncoder::new(NullEncoding::JsonNull);
        let body = encoder.encode_rows("cb", &cols(&["id"]), Vec::new());
        assert_eq!(body, "cb({ \"columns\" : [ \"id\" ],\n\"results\" : []})");
        assert_eq!(
            unwrap_jsonp("cb", &body),
            json!({ "columns": ["id"], "results": [] })
        );
    }

    #[test]
    fn test_single_row_has_no_dangling_separator() {
        let encoder = ResultEncoder::new(NullEncoding::JsonNull);
        let body = encoder.encode_rows("f", &cols(&["a"]), vec![row(&[Some("x")])]);
        assert_eq!(body, "f({ \"columns\" : [ \"a\" ],\n\"results\" : [ [ \"x\" ]]})");
        assert!(!body.contains(", ]"));
        assert!(!body.contains(",]"));
    }

    #[test]
    fn test_special_characters_round_trip_through_json() {
        let tricky = [
            "say \"hi\"",
            "back\\slash",
            "line\nbreak\r\n",
            "tab\tand\u{1}control",
            "</script><script>alert(1)</script>",
            "it's & more \u{2028}",
        ];
        let encoder = ResultEncoder::new(NullEncoding::JsonNull);
        let rows: Vec<ResultRow> = tricky.iter().map(|v| row(&[Some(v)])).collect();
        let body = encoder.encode_rows("cb", &cols(&["weird \"col\"\n"]), rows);

        assert!(!body.contains("</script>"));
        let parsed = unwrap_jsonp("cb", &body);
        assert_eq!(parsed["columns"][0], "weird \"col\"\n");
        for (i, expected) in tricky.iter().enumerate() {
            assert_eq!(parsed["results"][i][0], *expected);
        }
    }

    #[test]
    fn test_escape_table() {
        let mut out = String::new();
        escape_into("a\"b\\c\n\u{1}<&>\u{2028}'", &mut out);
        assert_eq!(out, "a\\\"b\\\\c\\n\\u0001\\u003c\\u0026\\u003e\\u2028'");
    }

    #[test]
    fn test_null_encoding_policies() {
        let rows = || vec![row(&[None, Some("")])];

        let hardened = ResultEncoder::new(NullEncoding::JsonNull)
            .encode_rows("cb", &cols(&["a", "b"]), rows());
        assert_eq!(
            unwrap_jsonp("cb", &hardened)["results"][0],
            json!([null, ""])
        );

        let legacy = ResultEncoder::new(NullEncoding::EmptyString)
            .encode_rows("cb", &cols(&["a", "b"]), rows());
        assert_eq!(unwrap_jsonp("cb", &legacy)["results"][0], json!(["", ""]));
    }

    #[test]
    fn test_callback_is_written_verbatim() {
        let encoder = ResultEncoder::new(NullEncoding::EmptyString);
        let body = encoder.encode_rows("alert(document.cookie);cb", &cols(&["a"]), Vec::new());
        assert!(body.starts_with("alert(document.cookie);cb({ \"columns\""));
    }

    #[test]
    fn test_error_payload() {
        let body = ResultEncoder::encode_error("cb", "Unknown database: \"x\"");
        assert_eq!(unwrap_jsonp("cb", &body), json!({ "error": "Unknown database: \"x\"" }));
    }

    #[tokio::test]
    async fn test_encode_drains_cursor() {
        let mut cursor = BufferedCursor::new(
            cols(&["id"]),
            vec![row(&[Some("1")]), row(&[Some("2")])],
        );
        let encoder = ResultEncoder::new(NullEncoding::JsonNull);
        let body = encoder.encode("cb", &mut cursor).await.unwrap();
        assert_eq!(
            unwrap_jsonp("cb", &body),
            json!({ "columns": ["id"], "results": [["1"], ["2"]] })
        );
        assert_eq!(cursor.next_row().await.unwrap(), None);
    }
}
