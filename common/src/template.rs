use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use regex::Regex;
use tokio::fs::{read_to_string, write};
use tracing::{debug, warn};

use crate::{config::Template, error::BenchError, util::device_name};

/// Names bound per run that every workload file may reference.
pub const BUILTIN_KEYS: [&str; 3] = ["device", "device_name", "scheduler"];

const MARKER_PATTERN: &str = r"<%\s*([^%<>\s]+)\s*%>";
const TEMP_SUFFIX: &str = "__temp__";

/// One point of the template cross product, in template declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ParameterSet(pub Vec<(String, String)>);

impl ParameterSet {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }
        write!(
            f,
            "{{{}}}",
            self.0.iter().map(|(k, v)| format!("{k}={v}")).join(", ")
        )
    }
}

/// Expands the template section. The last declared key iterates fastest, so
/// `rw: a,b` + `iodepth: 1,2` yields (a,1) (a,2) (b,1) (b,2).
pub fn parameter_sets(template: &Template) -> Vec<ParameterSet> {
    if !template.enabled || template.settings.is_empty() {
        return vec![ParameterSet::default()];
    }
    let keys = template.settings.keys().collect::<Vec<_>>();
    template
        .settings
        .iter()
        .map(|(_, values)| values.iter())
        .multi_cartesian_product()
        .map(|values| {
            ParameterSet(
                keys.iter()
                    .zip(values)
                    .map(|(k, v)| ((*k).clone(), v.clone()))
                    .collect(),
            )
        })
        .collect()
}

/// Values visible to a workload file for one run.
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    pub device: &'a str,
    pub scheduler: &'a str,
    pub params: &'a ParameterSet,
}

impl<'a> Bindings<'a> {
    pub fn get(&self, name: &str) -> Option<&'a str> {
        match name {
            "device" => Some(self.device),
            "device_name" => Some(device_name(self.device)),
            "scheduler" => Some(self.scheduler),
            _ => self.params.get(name),
        }
    }
}

fn marker_regex() -> Result<Regex, BenchError> {
    Regex::new(MARKER_PATTERN).map_err(|err| BenchError::parse("marker pattern", err))
}

/// Distinct marker names in first-seen order.
pub fn markers_in(text: &str) -> Result<Vec<String>, BenchError> {
    let regex = marker_regex()?;
    let mut seen = HashSet::new();
    Ok(regex
        .captures_iter(text)
        .map(|caps| caps[1].to_owned())
        .filter(|name| seen.insert(name.clone()))
        .collect())
}

/// Fails if `file` references a name that is neither a built-in nor one of
/// `declared`.
pub async fn check_markers<S: AsRef<str>>(file: &Path, declared: &[S]) -> Result<(), BenchError> {
    let text = read_to_string(file)
        .await
        .map_err(|err| BenchError::io(file, err))?;
    for marker in markers_in(&text)? {
        let known = BUILTIN_KEYS.contains(&marker.as_str())
            || declared.iter().any(|d| d.as_ref() == marker);
        if !known {
            return Err(BenchError::Template {
                file: file.to_owned(),
                marker,
            });
        }
    }
    Ok(())
}

pub fn interpolate(text: &str, source: &Path, bindings: &Bindings) -> Result<String, BenchError> {
    let regex = marker_regex()?;
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in regex.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = bindings
            .get(name.as_str())
            .ok_or_else(|| BenchError::Template {
                file: source.to_owned(),
                marker: name.as_str().to_owned(),
            })?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// The workload file a run actually hands to the tool. When templating is on
/// this is an interpolated copy written next to the original, removed again
/// when the guard is dropped unless it is kept.
#[derive(Debug)]
pub struct TemplateFile {
    path: PathBuf,
    generated: bool,
    keep: bool,
}

impl TemplateFile {
    pub async fn materialize(
        source: &Path,
        bindings: &Bindings<'_>,
        enabled: bool,
        keep: bool,
    ) -> Result<Self, BenchError> {
        if !enabled {
            return Ok(Self {
                path: source.to_owned(),
                generated: false,
                keep,
            });
        }

        let text = read_to_string(source)
            .await
            .map_err(|err| BenchError::io(source, err))?;
        let contents = interpolate(&text, source, bindings)?;
        let digest = md5::compute(contents.as_bytes());
        let file_name = source
            .file_name()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workload".to_owned());
        let path = source.with_file_name(format!("{file_name}.{digest:x}{TEMP_SUFFIX}"));
        write(&path, contents)
            .await
            .map_err(|err| BenchError::io(&path, err))?;
        debug!("Wrote interpolated workload {}", path.display());

        Ok(Self {
            path,
            generated: true,
            keep,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TemplateFile {
    fn drop(&mut self) {
        if self.generated && !self.keep {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!("Could not remove {}: {err}", self.path.display());
            }
        }
    }
}
