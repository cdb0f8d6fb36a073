//! Name keyed backbone registry.
//!
//! A model description selects its backbone by name and passes the component
//! configuration as JSON, so backbones can be swapped without code changes.
use alloc::{
    borrow::ToOwned,
    collections::BTreeMap,
    format,
    string::{String, ToString},
    vec::Vec,
};

use burn::{
    module::Module,
    tensor::{backend::Backend, Device, Tensor},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{MobileNetError, Result},
    model::mobilenet::{MobileNet, MobileNetConfig},
};

/// Registry name of the [MobileNet](MobileNet) backbone.
pub const MOBILENET: &str = "MobileNet";

/// Configuration keys MobileNet takes from the model wide shared values.
const MOBILENET_SHARED: &[&str] = &["norm_type", "weight_prefix_name"];

/// Builds a backbone from its JSON configuration.
pub type BackboneFactory<B> = fn(Value, &Device<B>) -> Result<Backbone<B>>;

/// Any backbone the registry can build.
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    MobileNet(MobileNet<B>),
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        match self {
            Backbone::MobileNet(model) => model.forward(x),
        }
    }

    pub fn out_channels(&self) -> Vec<usize> {
        match self {
            Backbone::MobileNet(model) => model.out_channels(),
        }
    }
}

/// Backbone selection: registered component name plus its configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackboneSpec {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

impl BackboneSpec {
    pub fn new(name: impl Into<String>, config: Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

struct Registration<B: Backend> {
    factory: BackboneFactory<B>,
    shared: &'static [&'static str],
}

pub struct BackboneRegistry<B: Backend> {
    components: BTreeMap<String, Registration<B>>,
    shared: Map<String, Value>,
}

impl<B: Backend> Default for BackboneRegistry<B> {
    /// Registry with every backbone of this crate.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(MOBILENET, MOBILENET_SHARED, build_mobilenet::<B>);
        registry
    }
}

impl<B: Backend> BackboneRegistry<B> {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            components: BTreeMap::new(),
            shared: Map::new(),
        }
    }

    /// Register a factory under `name`, returning the factory it replaces.
    ///
    /// `shared` lists the configuration keys the component takes from
    /// [shared values](BackboneRegistry::set_shared) when its own configuration omits them.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        shared: &'static [&'static str],
        factory: BackboneFactory<B>,
    ) -> Option<BackboneFactory<B>> {
        self.components
            .insert(name.into(), Registration { factory, shared })
            .map(|previous| previous.factory)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.components.keys().map(String::as_str)
    }

    /// Set a model wide value, e.g. `norm_type`, for every component that shares the key.
    pub fn set_shared(&mut self, key: impl Into<String>, value: Value) {
        self.shared.insert(key.into(), value);
    }

    pub fn build(&self, spec: &BackboneSpec, device: &Device<B>) -> Result<Backbone<B>> {
        let registration =
            self.components
                .get(spec.name.as_str())
                .ok_or_else(|| MobileNetError::UnknownBackbone {
                    name: spec.name.clone(),
                })?;

        let mut config = match &spec.config {
            Value::Null => Map::new(),
            Value::Object(config) => config.clone(),
            other => {
                return Err(MobileNetError::Config {
                    reason: format!("{} expects an object, got {other}", spec.name),
                })
            }
        };

        for &key in registration.shared {
            if config.contains_key(key) {
                continue;
            }
            if let Some(value) = self.shared.get(key) {
                config.insert(key.to_owned(), value.clone());
            }
        }

        log::info!("building backbone {} with {}", spec.name, Value::Object(config.clone()));
        (registration.factory)(Value::Object(config), device)
    }

    /// Build from a JSON encoded [BackboneSpec].
    pub fn build_json(&self, json: &str, device: &Device<B>) -> Result<Backbone<B>> {
        let spec: BackboneSpec = serde_json::from_str(json).map_err(config_error)?;
        self.build(&spec, device)
    }

    /// Build from a JSON file holding a [BackboneSpec].
    #[cfg(feature = "std")]
    pub fn build_file(
        &self,
        path: impl AsRef<std::path::Path>,
        device: &Device<B>,
    ) -> Result<Backbone<B>> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| MobileNetError::Config {
            reason: format!("could not read {}: {err}", path.display()),
        })?;
        self.build_json(&json, device)
    }
}

fn config_error(err: serde_json::Error) -> MobileNetError {
    MobileNetError::Config {
        reason: err.to_string(),
    }
}

fn build_mobilenet<B: Backend>(config: Value, device: &Device<B>) -> Result<Backbone<B>> {
    // Start from the defaults so the configuration only lists what it changes
    let mut merged = match serde_json::to_value(MobileNetConfig::new()).map_err(config_error)? {
        Value::Object(defaults) => defaults,
        _ => Map::new(),
    };
    if let Value::Object(overrides) = config {
        if let Some(key) = overrides.keys().find(|key| !merged.contains_key(*key)) {
            return Err(MobileNetError::Config {
                reason: format!("unknown MobileNet configuration key `{key}`"),
            });
        }
        merged.extend(overrides);
    }

    let config: MobileNetConfig =
        serde_json::from_value(Value::Object(merged)).map_err(config_error)?;
    Ok(Backbone::MobileNet(config.try_init(device)?))
}
