//! Control-file row count reconciliation.
//!
//! Producers declare how many rows a file should carry, either in a sidecar
//! object (XML or single-row CSV) or in a trailer record inside the data
//! itself. A mismatch against the count of accepted rows fails the file before
//! anything reaches staging. A configured sidecar that has not arrived yet is
//! not a failure; the count check is simply skipped.

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use vigil_core::spec::{ControlFileSpec, SourceSpec};
use vigil_core::storage::{Area, Storage};

/// Outcome of resolving the expected row count for one file.
#[derive(Debug, Default)]
pub struct ControlCheck {
    pub expected: Option<i64>,
    /// Sidecar object consumed for the count, if one was found.
    pub sidecar_rel: Option<String>,
}

/// Resolve the expected row count for a data file.
///
/// `trailer_count` is the count the parser already extracted when the spec
/// uses a trailer record.
pub async fn expected_row_count(
    storage: &Storage,
    spec: &SourceSpec,
    data_rel: &str,
    trailer_count: Option<i64>,
) -> Result<ControlCheck> {
    let Some(control) = &spec.control_file else {
        return Ok(ControlCheck::default());
    };

    match control {
        ControlFileSpec::Trailer { .. } => {
            let expected = trailer_count
                .ok_or_else(|| anyhow!("trailer control file requires a csv source"))?;
            Ok(ControlCheck {
                expected: Some(expected),
                sidecar_rel: None,
            })
        }
        ControlFileSpec::SidecarXml { pattern, xpath_row_count } => {
            let Some(sidecar_rel) = find_sidecar(storage, data_rel, pattern).await? else {
                debug!(data = data_rel, pattern, "control sidecar not present, skipping count check");
                return Ok(ControlCheck::default());
            };
            let bytes = storage
                .get(Area::Landing, &sidecar_rel)
                .await
                .with_context(|| format!("read control sidecar {sidecar_rel}"))?;
            let expected = xml_row_count(&bytes, xpath_row_count)
                .with_context(|| format!("parse control sidecar {sidecar_rel}"))?;
            Ok(ControlCheck {
                expected: Some(expected),
                sidecar_rel: Some(sidecar_rel),
            })
        }
        ControlFileSpec::SidecarCsv { pattern, row_count_field } => {
            let Some(sidecar_rel) = find_sidecar(storage, data_rel, pattern).await? else {
                debug!(data = data_rel, pattern, "control sidecar not present, skipping count check");
                return Ok(ControlCheck::default());
            };
            let bytes = storage
                .get(Area::Landing, &sidecar_rel)
                .await
                .with_context(|| format!("read control sidecar {sidecar_rel}"))?;
            let expected = csv_row_count(&bytes, row_count_field)
                .with_context(|| format!("parse control sidecar {sidecar_rel}"))?;
            Ok(ControlCheck {
                expected: Some(expected),
                sidecar_rel: Some(sidecar_rel),
            })
        }
    }
}

/// Find the sidecar for a data file among landing objects.
///
/// Candidates must match the configured glob; among those, the sidecar whose
/// stem shares the data file's identifier wins (`trades_20240115.csv` pairs
/// with `trades_20240115.ctl` or `trades_20240115_ctrl.xml`).
async fn find_sidecar(
    storage: &Storage,
    data_rel: &str,
    pattern: &str,
) -> Result<Option<String>> {
    let pattern = glob::Pattern::new(pattern)
        .with_context(|| format!("invalid control file pattern '{pattern}'"))?;
    let data_stem = stem(file_name(data_rel));

    let listed = storage.list(Area::Landing).await?;
    for meta in listed {
        let Some(rel) = storage.relative(Area::Landing, &meta.location) else {
            continue;
        };
        if rel == data_rel {
            continue;
        }
        let name = file_name(&rel);
        if !(pattern.matches(&rel) || pattern.matches(name)) {
            continue;
        }
        if sidecar_pairs(data_stem, stem(name)) {
            return Ok(Some(rel));
        }
    }
    Ok(None)
}

fn sidecar_pairs(data_stem: &str, candidate_stem: &str) -> bool {
    if candidate_stem == data_stem {
        return true;
    }
    if candidate_stem == format!("{data_stem}_ctrl") {
        return true;
    }
    // Fall back to comparing the trailing identifier (usually the date).
    match (data_stem.rsplit('_').next(), candidate_stem.rsplit('_').next()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn file_name(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

fn stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name)
}

/// Extract a row count from an XML sidecar via a local-name element path,
/// relative to the document root.
fn xml_row_count(bytes: &[u8], xpath: &str) -> Result<i64> {
    let wanted = xpath
        .trim()
        .trim_start_matches("./")
        .trim_start_matches('/')
        .split('/')
        .map(|seg| seg.rsplit_once(':').map(|(_, l)| l).unwrap_or(seg))
        .collect::<Vec<_>>()
        .join("/");

    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut depth = 0usize;
    let mut capture = false;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth > 1 {
                    path.push(String::from_utf8_lossy(e.local_name().as_ref()).to_string());
                    capture = path.join("/") == wanted;
                    if capture {
                        text.clear();
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if capture {
                    text.push_str(&t.unescape().map_err(|e| anyhow!("{e}"))?);
                }
            }
            Ok(Event::End(_)) => {
                if capture && path.join("/") == wanted && !text.is_empty() {
                    return text
                        .trim()
                        .parse::<i64>()
                        .with_context(|| format!("row count '{text}' is not an integer"));
                }
                if depth > 1 {
                    path.pop();
                }
                depth = depth.saturating_sub(1);
                capture = false;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => bail!("XML parse error: {e}"),
        }
        buf.clear();
    }

    bail!("row count element '{xpath}' not found in control file")
}

/// Extract a row count from a single-row CSV sidecar by column name.
fn csv_row_count(bytes: &[u8], field: &str) -> Result<i64> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let headers = reader.headers().context("control file header")?.clone();
    let column = headers
        .iter()
        .position(|h| h == field)
        .ok_or_else(|| anyhow!("column '{field}' not found in control file"))?;

    let record = reader
        .records()
        .next()
        .ok_or_else(|| anyhow!("control file has no data row"))?
        .context("control file row")?;
    let cell = record
        .get(column)
        .ok_or_else(|| anyhow!("control file row has no column '{field}'"))?;
    cell.trim()
        .parse::<i64>()
        .with_context(|| format!("row count '{cell}' is not an integer"))
}
