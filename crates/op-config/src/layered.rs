//! Stacked settings files for pursuit runs.
//!
//! Layers apply in the order base → site → run → environment. File layers are
//! TOML or JSON by extension; the environment layer reads variables of the
//! form `PURSUIT_SET__pursuit__generator__z_dim=64`. Every leaf a layer
//! changes is recorded as a [`ConfigDiffEvent`].

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Prefix of environment overrides; path segments are separated by `__`.
pub const ENV_OVERRIDE_PREFIX: &str = "PURSUIT_SET__";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigLayer {
    Base,
    Site,
    Run,
    Env,
}

/// One leaf changed by a layer. `None` means absent before or after.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigDiffEvent {
    pub layer: ConfigLayer,
    pub path: String,
    pub previous: Option<Value>,
    pub current: Option<Value>,
}

/// Which files and overrides make up a run's configuration.
#[derive(Clone, Debug, Default)]
pub struct ConfigLayering {
    pub base: Option<PathBuf>,
    pub site: Option<PathBuf>,
    pub run: Option<PathBuf>,
    /// `(dotted path, raw value)` pairs applied last.
    pub overrides: Vec<(String, String)>,
}

impl ConfigLayering {
    /// `PURSUIT_CONFIG_{BASE,SITE,RUN}` name files directly; otherwise
    /// `base.toml`, `site.toml` and `run.json` are looked up under
    /// `PURSUIT_CONFIG_ROOT` (default `~/.object-pursuit`). Missing files are
    /// dropped. Overrides come from `PURSUIT_SET__*` variables.
    pub fn discover() -> Self {
        let root = std::env::var_os("PURSUIT_CONFIG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(default_root);
        let pick = |var: &str, fallback: &str| {
            std::env::var_os(var)
                .map(PathBuf::from)
                .unwrap_or_else(|| root.join(fallback))
        };
        Self {
            base: existing(pick("PURSUIT_CONFIG_BASE", "base.toml")),
            site: existing(pick("PURSUIT_CONFIG_SITE", "site.toml")),
            run: existing(pick("PURSUIT_CONFIG_RUN", "run.json")),
            overrides: env_overrides(std::env::vars()),
        }
    }

    pub fn with_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.base = Some(path.into());
        self
    }

    pub fn with_site(mut self, path: impl Into<PathBuf>) -> Self {
        self.site = Some(path.into());
        self
    }

    pub fn with_run(mut self, path: impl Into<PathBuf>) -> Self {
        self.run = Some(path.into());
        self
    }

    /// Adds `path = value`; `value` is read as a TOML scalar, falling back to a
    /// plain string (`"cuda:0"` needs no quotes).
    pub fn with_override(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((path.into(), value.into()));
        self
    }

    fn files(&self) -> impl Iterator<Item = (ConfigLayer, &Path)> {
        [
            (ConfigLayer::Base, self.base.as_deref()),
            (ConfigLayer::Site, self.site.as_deref()),
            (ConfigLayer::Run, self.run.as_deref()),
        ]
        .into_iter()
        .filter_map(|(layer, path)| path.map(|path| (layer, path)))
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".object-pursuit"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn env_overrides(vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut overrides: Vec<(String, String)> = vars
        .filter_map(|(key, value)| {
            let path = key.strip_prefix(ENV_OVERRIDE_PREFIX)?;
            let segments: Vec<&str> = path.split("__").filter(|s| !s.is_empty()).collect();
            (!segments.is_empty()).then(|| (segments.join("."), value))
        })
        .collect();
    overrides.sort();
    overrides
}

/// Merged view over every layer of a [`ConfigLayering`].
#[derive(Clone, Debug)]
pub struct LayeredConfig {
    layering: ConfigLayering,
    value: Value,
    events: Vec<ConfigDiffEvent>,
}

impl LayeredConfig {
    /// Reads and stacks the layers. Listed files that no longer exist are
    /// skipped; unreadable or malformed files are errors.
    pub fn load(layering: ConfigLayering) -> Result<Self, LayeredConfigError> {
        let mut value = Value::Object(Map::new());
        let mut events = Vec::new();
        for (layer, path) in layering.files() {
            if let Some(parsed) = read_layer(path)? {
                apply_layer(&mut value, &parsed, layer, &mut events);
            }
        }
        if !layering.overrides.is_empty() {
            let mut patch = Value::Object(Map::new());
            for (path, raw) in &layering.overrides {
                insert_path(&mut patch, path, parse_scalar(raw))?;
            }
            apply_layer(&mut value, &patch, ConfigLayer::Env, &mut events);
        }
        Ok(Self {
            layering,
            value,
            events,
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn layering(&self) -> &ConfigLayering {
        &self.layering
    }

    pub fn events(&self) -> &[ConfigDiffEvent] {
        &self.events
    }

    /// Deserializes the table at `path` (e.g. `&["pursuit"]`). `Ok(None)` when
    /// any key along the way is missing.
    pub fn section<T: DeserializeOwned>(&self, path: &[&str]) -> Result<Option<T>, serde_json::Error> {
        let node = path
            .iter()
            .try_fold(&self.value, |node, key| node.as_object()?.get(*key));
        node.map(|node| serde_json::from_value(node.clone()))
            .transpose()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayeredConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("override `{path}` conflicts with a non-table value")]
    Override { path: String },
}

fn read_layer(path: &Path) -> Result<Option<Value>, LayeredConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|source| LayeredConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let json_error = |source| LayeredConfigError::Json {
        path: path.to_path_buf(),
        source,
    };
    let value = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&text).map_err(json_error)?
    } else {
        let table: toml::Table = toml::from_str(&text).map_err(|source| LayeredConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::to_value(table).map_err(json_error)?
    };
    Ok(Some(value))
}

fn parse_scalar(raw: &str) -> Value {
    toml::from_str::<toml::Table>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .and_then(|value| serde_json::to_value(value).ok())
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

fn insert_path(root: &mut Value, dotted: &str, leaf: Value) -> Result<(), LayeredConfigError> {
    let conflict = || LayeredConfigError::Override {
        path: dotted.to_string(),
    };
    let mut keys = dotted.split('.').peekable();
    let mut node = root;
    while let Some(key) = keys.next() {
        let map = node.as_object_mut().ok_or_else(conflict)?;
        if keys.peek().is_none() {
            map.insert(key.to_string(), leaf);
            return Ok(());
        }
        node = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Err(conflict())
}

fn apply_layer(dest: &mut Value, layer: &Value, kind: ConfigLayer, events: &mut Vec<ConfigDiffEvent>) {
    let before = dest.clone();
    merge(dest, layer);
    diff(&before, dest, &mut Vec::new(), kind, events);
}

/// Tables merge key by key; any other value replaces what was there.
fn merge(dest: &mut Value, src: &Value) {
    match (dest, src) {
        (Value::Object(dest), Value::Object(src)) => {
            for (key, value) in src {
                match dest.get_mut(key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        dest.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

fn diff(
    before: &Value,
    after: &Value,
    path: &mut Vec<String>,
    layer: ConfigLayer,
    out: &mut Vec<ConfigDiffEvent>,
) {
    if before == after {
        return;
    }
    if let (Value::Object(old), Value::Object(new)) = (before, after) {
        let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            path.push(key.clone());
            diff(
                old.get(key).unwrap_or(&Value::Null),
                new.get(key).unwrap_or(&Value::Null),
                path,
                layer,
                out,
            );
            path.pop();
        }
        return;
    }
    out.push(ConfigDiffEvent {
        layer,
        path: path.join("."),
        previous: (!before.is_null()).then(|| before.clone()),
        current: (!after.is_null()).then(|| after.clone()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn later_layers_win_and_leave_a_trail() {
        let root = tempdir().unwrap();
        let base = root.path().join("base.toml");
        fs::write(
            &base,
            r#"
            [pursuit]
            device = "cpu"

            [pursuit.generator]
            z_dim = 100

            [pursuit.replay]
            coefficient = 0.1
            "#,
        )
        .unwrap();
        let site = root.path().join("site.toml");
        fs::write(&site, "[pursuit]\ndevice = \"cuda:0\"\n").unwrap();
        let run = root.path().join("run.json");
        fs::write(&run, r#"{"pursuit":{"replay":{"coefficient":0.5}}}"#).unwrap();

        let layering = ConfigLayering::default()
            .with_base(&base)
            .with_site(&site)
            .with_run(&run)
            .with_override("pursuit.generator.z_dim", "64");
        let stacked = LayeredConfig::load(layering).unwrap();

        let pursuit: Value = stacked.section(&["pursuit"]).unwrap().unwrap();
        assert_eq!(pursuit["generator"]["z_dim"], Value::from(64));
        assert_eq!(pursuit["device"], Value::from("cuda:0"));
        assert_eq!(pursuit["replay"]["coefficient"], Value::from(0.5));

        let events = stacked.events();
        assert!(events.iter().any(|event| event.layer == ConfigLayer::Site
            && event.path == "pursuit.device"
            && event.previous == Some(Value::from("cpu"))));
        assert!(events.iter().any(|event| event.layer == ConfigLayer::Env
            && event.path == "pursuit.generator.z_dim"
            && event.current == Some(Value::from(64))));
    }

    #[test]
    fn env_keys_become_dotted_paths() {
        let vars = vec![
            ("PURSUIT_SET__pursuit__device".to_string(), "cuda:1".to_string()),
            ("PURSUIT_SET__".to_string(), "ignored".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        assert_eq!(
            env_overrides(vars.into_iter()),
            vec![("pursuit.device".to_string(), "cuda:1".to_string())]
        );
        assert_eq!(parse_scalar("cuda:1"), Value::from("cuda:1"));
        assert_eq!(parse_scalar("true"), Value::from(true));
    }

    #[test]
    fn override_through_a_scalar_is_rejected() {
        let layering = ConfigLayering::default()
            .with_override("pursuit", "1")
            .with_override("pursuit.device", "cpu");
        assert!(matches!(
            LayeredConfig::load(layering),
            Err(LayeredConfigError::Override { .. })
        ));
    }

    #[test]
    fn missing_layers_are_skipped() {
        let root = tempdir().unwrap();
        let layering = ConfigLayering::default().with_base(root.path().join("absent.toml"));
        let stacked = LayeredConfig::load(layering).unwrap();
        assert!(stacked.events().is_empty());
        assert!(stacked.section::<Value>(&["pursuit"]).unwrap().is_none());
    }

    #[test]
    fn malformed_toml_is_reported() {
        let root = tempdir().unwrap();
        let base = root.path().join("base.toml");
        fs::write(&base, "[pursuit\nz_dim = ").unwrap();
        let err = LayeredConfig::load(ConfigLayering::default().with_base(&base)).unwrap_err();
        assert!(matches!(err, LayeredConfigError::Toml { .. }));
    }
}
