use std::{collections::HashMap, fmt};

use itertools::Itertools;

/// Value of one CSV cell. Units are whatever the tool reported.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
    None,
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v}"),
            MetricValue::Text(v) => write!(f, "{v}"),
            MetricValue::None => write!(f, "NONE"),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Int(value)
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(MetricValue::Int)
            .unwrap_or(MetricValue::Float(value as f64))
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_owned())
    }
}

/// Everything one run produced, keyed by full metric name.
///
/// Groups hold the variable part of a run: a group name such as
/// `clat-percentile-read` maps to the columns it expanded to, in the order the
/// tool reported them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricRecord {
    values: HashMap<String, MetricValue>,
    groups: HashMap<String, Vec<(String, MetricValue)>>,
}

impl MetricRecord {
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<MetricValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn insert_group(&mut self, name: impl Into<String>, columns: Vec<(String, MetricValue)>) {
        self.groups.insert(name.into(), columns);
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.values.get(name)
    }

    pub fn group(&self, name: &str) -> Option<&[(String, MetricValue)]> {
        self.groups.get(name).map(|x| x.as_slice())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.groups.is_empty()
    }
}

/// Folds the rows of several repetitions into one, column by column.
///
/// Numeric columns become the mean of the values that are present, text
/// columns are kept when every repetition agrees and are otherwise joined
/// with `|`. A column with no values at all stays `NONE`.
pub fn aggregate(rows: &[Vec<MetricValue>]) -> Vec<MetricValue> {
    let width = rows.iter().map(|x| x.len()).max().unwrap_or(0);
    (0..width)
        .map(|i| aggregate_column(rows.iter().filter_map(|row| row.get(i))))
        .collect()
}

fn aggregate_column<'a>(values: impl Iterator<Item = &'a MetricValue>) -> MetricValue {
    let present = values
        .filter(|x| **x != MetricValue::None)
        .collect::<Vec<_>>();
    let Some(first) = present.first() else {
        return MetricValue::None;
    };
    if present.iter().all(|x| x == first) {
        return (*first).clone();
    }

    let numbers = present.iter().filter_map(|x| x.as_f64()).collect::<Vec<_>>();
    if numbers.len() == present.len() {
        return MetricValue::Float(numbers.iter().sum::<f64>() / numbers.len() as f64);
    }

    MetricValue::Text(present.iter().map(|x| x.to_string()).unique().join("|"))
}
