// Data paths and schema paths.
//
// A data path addresses a concrete node: `/ztp:devices/device=ABC/settings`.
// Its schema path is the same path with every `=key` predicate removed.

use crate::error::{DalError, Result};
use regex::Regex;
use std::sync::OnceLock;

pub const ROOT: &str = "/";

/// One component of a data path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub name: &'a str,
    pub key: Option<&'a str>,
}

impl<'a> Segment<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match raw.split_once('=') {
            Some((name, key)) => Segment { name, key: Some(key) },
            None => Segment { name: raw, key: None },
        }
    }
}

fn predicate_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("=[^/]*").expect("static regex"))
}

/// Check the shape of a data path: absolute, no trailing slash, no empty segments.
pub fn validate(data_path: &str) -> Result<()> {
    if data_path == ROOT {
        return Ok(());
    }
    if !data_path.starts_with('/') || data_path.ends_with('/') {
        return Err(DalError::InvalidTarget(format!(
            "'{data_path}' is not an absolute path without a trailing slash"
        )));
    }
    for raw in data_path[1..].split('/') {
        let seg = Segment::parse(raw);
        if seg.name.is_empty() || seg.key == Some("") {
            return Err(DalError::InvalidTarget(format!(
                "'{data_path}' contains an empty segment"
            )));
        }
    }
    Ok(())
}

/// Split a data path into segments. The root has none.
pub fn segments(data_path: &str) -> Result<Vec<Segment<'_>>> {
    validate(data_path)?;
    if data_path == ROOT {
        return Ok(Vec::new());
    }
    Ok(data_path[1..].split('/').map(Segment::parse).collect())
}

/// Strip list predicates from a data path.
pub fn schema_path(data_path: &str) -> String {
    predicate_regex().replace_all(data_path, "").into_owned()
}

pub fn join(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// `/a/b=1/c` -> (`/a/b=1`, `c`). `None` for the root.
pub fn split_last(data_path: &str) -> Option<(&str, &str)> {
    if data_path == ROOT {
        return None;
    }
    let (parent, last) = data_path.rsplit_once('/')?;
    Some((if parent.is_empty() { ROOT } else { parent }, last))
}

/// Drop a `module:` prefix from a member name.
pub fn local_name(name: &str) -> &str {
    match name.split_once(':') {
        Some((_, local)) => local,
        None => name,
    }
}

/// True when `path` equals `prefix` or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix == ROOT {
        return true;
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Segments of `descendant` below `ancestor`; both are schema paths.
pub fn relative_segments<'a>(ancestor: &str, descendant: &'a str) -> Vec<&'a str> {
    let rest = if ancestor == ROOT {
        &descendant[1..]
    } else {
        descendant
            .strip_prefix(ancestor)
            .map(|r| r.trim_start_matches('/'))
            .unwrap_or("")
    };
    if rest.is_empty() {
        Vec::new()
    } else {
        rest.split('/').collect()
    }
}
