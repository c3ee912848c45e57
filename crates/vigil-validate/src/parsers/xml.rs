//! Streaming XML parsing.
//!
//! Emits one row per element matching the spec's `row_element`. A namespaced
//! `row_element` (`ns:Trade`) requires an exact namespace URI match; a bare
//! local name matches that name in any namespace. Field values are extracted
//! from child-element paths given by each field's `xpath`, matched by local
//! name, first occurrence wins.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use vigil_core::spec::SourceSpec;
use vigil_core::value::{row_to_json, Row, Value};

use crate::rowcheck::{check_row, RowVerdict};
use crate::rules::CompiledRule;

use super::{ParseError, ParseOutput, QuarantinedRow};

pub(super) fn parse(
    bytes: &[u8],
    spec: &SourceSpec,
    rules: &[CompiledRule],
    now: DateTime<Utc>,
) -> Result<ParseOutput, ParseError> {
    let row_element = spec.source.row_element.as_deref().ok_or_else(|| {
        ParseError::Malformed("XML source requires 'row_element' in source config".to_string())
    })?;
    let namespaces = spec
        .xml_config
        .as_ref()
        .map(|c| c.namespaces.clone())
        .unwrap_or_default();

    let (row_ns, row_local) = match row_element.split_once(':') {
        Some((prefix, local)) => {
            let uri = namespaces.get(prefix).ok_or_else(|| {
                ParseError::Malformed(format!(
                    "row_element references unknown namespace prefix '{prefix}'"
                ))
            })?;
            (Some(uri.clone()), local.to_string())
        }
        None => (None, row_element.to_string()),
    };

    let mut reader = NsReader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut output = ParseOutput::default();
    let mut buf = Vec::new();

    let mut in_row = false;
    let mut child_stack: Vec<String> = Vec::new();
    let mut captured: BTreeMap<String, String> = BTreeMap::new();
    let mut text = String::new();
    let mut row_num = 0usize;

    loop {
        match reader.read_resolved_event_into(&mut buf) {
            Ok((ns, Event::Start(e))) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if in_row {
                    child_stack.push(local);
                    text.clear();
                } else if local == row_local && namespace_matches(&row_ns, &ns) {
                    in_row = true;
                    captured.clear();
                    child_stack.clear();
                    text.clear();
                }
            }
            Ok((_, Event::Empty(e))) => {
                if in_row {
                    let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    let mut path = child_stack.join("/");
                    if !path.is_empty() {
                        path.push('/');
                    }
                    path.push_str(&local);
                    captured.entry(path).or_default();
                }
            }
            Ok((_, Event::Text(t))) => {
                if in_row && !child_stack.is_empty() {
                    let unescaped = t.unescape().map_err(|e| {
                        ParseError::Malformed(format!("XML text decode error: {e}"))
                    })?;
                    text.push_str(&unescaped);
                }
            }
            Ok((_, Event::End(_))) => {
                if in_row {
                    if child_stack.is_empty() {
                        // End of the row element itself.
                        row_num += 1;
                        emit_row(&captured, spec, rules, row_num, now, &mut output);
                        in_row = false;
                    } else {
                        let path = child_stack.join("/");
                        captured.entry(path).or_insert_with(|| text.clone());
                        child_stack.pop();
                        text.clear();
                    }
                }
            }
            Ok((_, Event::Eof)) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseError::Malformed(format!("XML parse error: {e}"))),
        }
        buf.clear();
    }

    Ok(output)
}

fn namespace_matches(expected: &Option<String>, resolved: &ResolveResult) -> bool {
    match expected {
        // Bare local names match in any namespace. Known trap: a spec that
        // needs namespace exactness must use a prefixed row_element.
        None => true,
        Some(uri) => match resolved {
            ResolveResult::Bound(ns) => ns.as_ref() == uri.as_bytes(),
            _ => false,
        },
    }
}

fn emit_row(
    captured: &BTreeMap<String, String>,
    spec: &SourceSpec,
    rules: &[CompiledRule],
    row_num: usize,
    now: DateTime<Utc>,
    output: &mut ParseOutput,
) {
    let raw: Row = spec
        .schema
        .iter()
        .map(|field| {
            let value = field
                .xpath
                .as_deref()
                .map(normalize_xpath)
                .and_then(|path| captured.get(&path))
                .filter(|text| !text.is_empty())
                .map(|text| Value::Str(text.clone()))
                .unwrap_or(Value::Null);
            (field.name.clone(), value)
        })
        .collect();

    match check_row(&raw, &spec.schema, rules, row_num, true, now) {
        RowVerdict::Accept(cleaned) => output.rows.push(cleaned),
        RowVerdict::Reject(reason) => output.quarantined.push(QuarantinedRow {
            row_number: row_num,
            raw_content: row_to_json(&raw),
            failure_reason: reason,
        }),
    }
}

/// Reduce a field xpath to a local-name child path: `./ns:Details/Price/text()`
/// becomes `Details/Price`.
fn normalize_xpath(xpath: &str) -> String {
    let path = xpath.trim().trim_start_matches("./").trim_start_matches('/');
    let path = path.strip_suffix("/text()").unwrap_or(path);
    path.split('/')
        .map(|segment| segment.rsplit_once(':').map(|(_, local)| local).unwrap_or(segment))
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(row_element: &str, ns: Option<(&str, &str)>) -> SourceSpec {
        let mut spec: SourceSpec = serde_yaml::from_str(&format!(
            r#"
name: fix_trades
source:
  path_pattern: "trades/*.xml"
  format: xml
  row_element: "{row_element}"
schema:
  - name: trade_id
    type: STRING
    nullable: false
    xpath: "TradeId"
  - name: price
    type: FLOAT64
    xpath: "Details/Price"
"#
        ))
        .unwrap();
        if let Some((prefix, uri)) = ns {
            let mut config = vigil_core::spec::XmlConfig::default();
            config.namespaces.insert(prefix.to_string(), uri.to_string());
            spec.xml_config = Some(config);
        }
        spec
    }

    #[test]
    fn extracts_nested_fields() {
        let xml = br#"<Trades>
            <Trade><TradeId>T1</TradeId><Details><Price>4.5</Price></Details></Trade>
            <Trade><TradeId>T2</TradeId><Details><Price>9.0</Price></Details></Trade>
        </Trades>"#;
        let out = parse(xml, &spec("Trade", None), &[], Utc::now()).unwrap();
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0]["price"], Value::Float(4.5));
    }

    #[test]
    fn missing_required_child_quarantines() {
        let xml = br#"<Trades><Trade><Details><Price>4.5</Price></Details></Trade></Trades>"#;
        let out = parse(xml, &spec("Trade", None), &[], Utc::now()).unwrap();
        assert!(out.rows.is_empty());
        assert_eq!(out.quarantined.len(), 1);
        assert_eq!(out.quarantined[0].row_number, 1);
    }

    #[test]
    fn namespaced_row_element_requires_exact_namespace() {
        let spec = spec("f:Trade", Some(("f", "urn:fix")));
        let wrong_ns = br#"<Trades xmlns="urn:other"><Trade><TradeId>T1</TradeId></Trade></Trades>"#;
        let out = parse(wrong_ns, &spec, &[], Utc::now()).unwrap();
        assert!(out.rows.is_empty());
        assert!(out.quarantined.is_empty());

        let right_ns = br#"<Trades xmlns="urn:fix"><Trade><TradeId>T1</TradeId><Details><Price>1</Price></Details></Trade></Trades>"#;
        let out = parse(right_ns, &spec, &[], Utc::now()).unwrap();
        assert_eq!(out.rows.len(), 1);
    }

    #[test]
    fn bare_local_name_matches_any_namespace() {
        let spec = spec("Trade", None);
        let xml = br#"<Trades xmlns="urn:whatever"><Trade><TradeId>T1</TradeId><Details><Price>1</Price></Details></Trade></Trades>"#;
        let out = parse(xml, &spec, &[], Utc::now()).unwrap();
        assert_eq!(out.rows.len(), 1);
    }

    #[test]
    fn first_occurrence_wins_for_repeated_children() {
        let xml = br#"<T><Trade><TradeId>first</TradeId><TradeId>second</TradeId><Details><Price>1</Price></Details></Trade></T>"#;
        let out = parse(xml, &spec("Trade", None), &[], Utc::now()).unwrap();
        assert_eq!(out.rows[0]["trade_id"], Value::Str("first".into()));
    }
}
