use std::{
    fmt,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use serde::{
    Deserialize, Deserializer, Serialize,
    de::{self, MapAccess, SeqAccess, Visitor},
};
use tokio::fs::read_to_string;

use crate::{
    error::BenchError,
    template::BUILTIN_KEYS,
    util::{cast_bool, try_split},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
    Fio,
    Filebench,
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadType::Fio => write!(f, "fio"),
            WorkloadType::Filebench => write!(f, "filebench"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub global: Global,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub template: Template,
    #[serde(default)]
    pub environment: Environment,
    pub workloads: Ordered<Workload>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Global {
    pub workload_type: WorkloadType,
    pub devices: CommaList,
    pub schedulers: CommaList,
    #[serde(default = "default_repetitions")]
    pub repetitions: usize,
    /// Seconds before a workload process is killed.
    pub timeout: Option<u64>,
    #[serde(default = "enabled", deserialize_with = "flag")]
    pub clear_caches: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Output {
    pub format: Option<CommaList>,
    #[serde(deserialize_with = "flag")]
    pub append_template: bool,
    #[serde(deserialize_with = "flag")]
    pub append_environment: bool,
    #[serde(deserialize_with = "flag")]
    pub append_blktrace: bool,
    #[serde(deserialize_with = "flag")]
    pub ignore_missing: bool,
    /// Percentile groups only produce columns when switched on.
    #[serde(deserialize_with = "flag")]
    pub include_clat_percentile: bool,
    #[serde(deserialize_with = "flag")]
    pub include_lat_percentile: bool,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            format: None,
            append_template: true,
            append_environment: true,
            append_blktrace: false,
            ignore_missing: false,
            include_clat_percentile: false,
            include_lat_percentile: false,
        }
    }
}

/// `enabled` plus any number of `name: value,value,...` settings, kept in
/// declaration order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Template {
    #[serde(deserialize_with = "flag")]
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: Ordered<CommaList>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Environment {
    #[serde(deserialize_with = "flag")]
    pub enabled: bool,
    pub nomerges: Option<CommaList>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workload {
    pub file: PathBuf,
    #[serde(default, deserialize_with = "flag")]
    pub enable_blktrace: bool,
}

/// One point of the environment cross product. `None` leaves the device's
/// merge policy untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EnvironmentSetting {
    pub nomerges: Option<u8>,
}

impl fmt::Display for EnvironmentSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.nomerges {
            Some(n) => write!(f, "nomerges={n}"),
            None => write!(f, "default"),
        }
    }
}

fn default_repetitions() -> usize {
    1
}

fn enabled() -> bool {
    true
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self, BenchError> {
        let text = read_to_string(path)
            .await
            .map_err(|err| BenchError::io(path, err))?;
        Self::from_yaml(&text, path.parent().unwrap_or(Path::new(".")))
    }

    /// Parses a config, resolving relative workload files against `base_dir`.
    pub fn from_yaml(text: &str, base_dir: &Path) -> Result<Self, BenchError> {
        let mut config: Config =
            serde_yml::from_str(text).map_err(|err| BenchError::config(err.to_string()))?;
        for (_, workload) in config.workloads.iter_mut() {
            if workload.file.is_relative() {
                workload.file = base_dir.join(&workload.file);
            }
        }
        Ok(config)
    }

    /// Checks everything that can be checked without touching devices.
    pub fn validate(&self) -> Result<(), BenchError> {
        if self.global.devices.is_empty() {
            return Err(BenchError::config("global.devices is empty"));
        }
        if self.global.schedulers.is_empty() {
            return Err(BenchError::config("global.schedulers is empty"));
        }
        if self.global.repetitions < 1 {
            return Err(BenchError::config("global.repetitions must be at least 1"));
        }
        if self.global.timeout == Some(0) {
            return Err(BenchError::config("global.timeout must be positive"));
        }
        if self.workloads.is_empty() {
            return Err(BenchError::config("no workload sections"));
        }
        for (name, workload) in self.workloads.iter() {
            if !workload.file.is_file() {
                return Err(BenchError::config(format!(
                    "workload {name}: file {} does not exist",
                    workload.file.display()
                )));
            }
        }
        for (key, values) in self.template.settings.iter() {
            if BUILTIN_KEYS.contains(&key.as_str()) {
                return Err(BenchError::config(format!(
                    "template setting {key} shadows a built-in value"
                )));
            }
            if values.is_empty() {
                return Err(BenchError::config(format!("template setting {key} has no values")));
            }
        }
        self.environment.permutations()?;
        Ok(())
    }
}

impl Environment {
    pub fn permutations(&self) -> Result<Vec<EnvironmentSetting>, BenchError> {
        let nomerges = match (&self.nomerges, self.enabled) {
            (Some(values), true) if !values.is_empty() => values,
            _ => return Ok(vec![EnvironmentSetting::default()]),
        };
        nomerges
            .iter()
            .map(|value| match value.parse::<u8>() {
                Ok(n) if n <= 2 => Ok(EnvironmentSetting { nomerges: Some(n) }),
                _ => Err(BenchError::config(format!(
                    "environment.nomerges value {value} is not one of 0, 1, 2"
                ))),
            })
            .collect()
    }
}

/// A list setting, written either as `"a,b,c"` or as a sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaList(pub Vec<String>);

impl std::ops::Deref for CommaList {
    type Target = Vec<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for CommaList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CommaListVisitor;

        impl<'de> Visitor<'de> for CommaListVisitor {
            type Value = CommaList;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a comma separated string or a list of values")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(CommaList(try_split(v, ',')))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(CommaList(vec![v.to_string()]))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(CommaList(vec![v.to_string()]))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(CommaList(vec![v.to_string()]))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(CommaList(vec![v.to_string()]))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut values = Vec::new();
                while let Some(CommaList(item)) = seq.next_element::<CommaList>()? {
                    values.extend(item);
                }
                Ok(CommaList(values))
            }
        }

        deserializer.deserialize_any(CommaListVisitor)
    }
}

/// A mapping that remembers the order its keys were written in.
#[derive(Debug, Clone, PartialEq)]
pub struct Ordered<V>(pub Vec<(String, V)>);

impl<V> Default for Ordered<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> Ordered<V> {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut V)> {
        self.0.iter_mut().map(|(k, v)| (&*k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.iter().map(|(k, _)| k)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for Ordered<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
            type Value = Ordered<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, V)> = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, V>()? {
                    if entries.iter().any(|(k, _)| *k == key) {
                        return Err(de::Error::custom(format!("duplicate key {key}")));
                    }
                    entries.push((key, value));
                }
                Ok(Ordered(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    struct FlagVisitor;

    impl<'de> Visitor<'de> for FlagVisitor {
        type Value = bool;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a boolean, 0/1 or true/false")
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<bool, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<bool, E> {
            Ok(v == 1)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<bool, E> {
            Ok(v == 1)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<bool, E> {
            Ok(cast_bool(v))
        }
    }

    deserializer.deserialize_any(FlagVisitor)
}
