//! Style filter compilation and evaluation.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::tile::MAX_STYLE_ZOOM;

/// Filter function callable by name from a style document.
///
/// Functions must be pure: their result may only depend on the context.
pub type FilterFunction = Rc<dyn Fn(&MatchContext<'_>) -> Result<bool, FilterError>>;

/// Filter compilation and evaluation errors.
#[derive(thiserror::Error, Debug)]
pub enum FilterError {
    #[error("Unknown filter function {0:?}")]
    UnknownFunction(String),
    #[error("Invalid filter for {0:?}: {1}")]
    Invalid(String, Value),
    #[error("Filter function {0:?} failed: {1}")]
    Function(String, String),
}

/// Named filter functions available to style documents.
#[derive(Clone, Default)]
pub struct FilterFunctions {
    functions: HashMap<String, FilterFunction>,
}

impl FilterFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, replacing any previous function with the same name.
    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&MatchContext<'_>) -> Result<bool, FilterError> + 'static,
    {
        self.functions.insert(name.into(), Rc::new(function));
    }

    fn get(&self, name: &str) -> Result<FilterFunction, FilterError> {
        self.functions.get(name).cloned().ok_or_else(|| FilterError::UnknownFunction(name.into()))
    }
}

impl Debug for FilterFunctions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

/// Values a feature is matched against.
#[derive(Copy, Clone, Debug)]
pub struct MatchContext<'a> {
    pub properties: &'a Map<String, Value>,
    /// Current style zoom.
    pub zoom: f64,
    /// Geometry type of the feature, exposed as `$geometry`.
    pub geometry: &'a str,
    /// Source layer of the feature, exposed as `$layer`.
    pub layer: &'a str,
    /// Squared meters per pixel, used for `px2` area filters.
    pub meters_per_pixel_sq: f64,
    /// Additional `$`-prefixed context values.
    pub globals: Option<&'a Map<String, Value>>,
}

impl<'a> MatchContext<'a> {
    pub fn new(properties: &'a Map<String, Value>, zoom: f64) -> Self {
        Self {
            properties,
            zoom,
            meters_per_pixel_sq: 1.,
            geometry: Default::default(),
            layer: Default::default(),
            globals: Default::default(),
        }
    }

    /// Look up a feature property or context value.
    pub fn lookup(&self, key: &PropertyKey) -> Option<Cow<'a, Value>> {
        match key {
            PropertyKey::Feature(path) => {
                let (first, rest) = path.split_first()?;
                let mut value = self.properties.get(first)?;
                for segment in rest {
                    value = value.get(segment)?;
                }
                Some(Cow::Borrowed(value))
            },
            PropertyKey::Context(name) => match name.as_str() {
                "zoom" => Some(Cow::Owned(Value::from(self.zoom))),
                "geometry" => Some(Cow::Owned(Value::from(self.geometry))),
                "layer" => Some(Cow::Owned(Value::from(self.layer))),
                "meters_per_pixel_sq" => Some(Cow::Owned(Value::from(self.meters_per_pixel_sq))),
                name => self.globals?.get(name).map(Cow::Borrowed),
            },
        }
    }

    /// Integer zoom used for zoom range prefiltering.
    pub fn zoom_level(&self) -> u8 {
        self.zoom.floor().clamp(0., MAX_STYLE_ZOOM as f64) as u8
    }
}

/// Property referenced by a filter.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum PropertyKey {
    /// Feature property, nested objects are addressed with dots.
    Feature(Vec<String>),
    /// `$`-prefixed context value.
    Context(String),
}

impl PropertyKey {
    pub fn parse(key: &str) -> Self {
        match key.strip_prefix('$') {
            Some(name) => Self::Context(name.into()),
            None => Self::Feature(key.split('.').map(String::from).collect()),
        }
    }
}

/// Numeric range bound.
#[derive(PartialEq, Copy, Clone, Debug)]
pub struct Bound {
    pub value: f64,
    /// Bound is an area in square pixels.
    pub px2: bool,
}

impl Bound {
    fn parse(key: &str, value: &Value) -> Result<Self, FilterError> {
        let invalid = || FilterError::Invalid(key.into(), value.clone());
        match value {
            Value::Number(number) => {
                Ok(Self { value: number.as_f64().ok_or_else(invalid)?, px2: false })
            },
            Value::String(text) => {
                let number = text.trim().strip_suffix("px2").ok_or_else(invalid)?;
                let value = number.trim().parse().map_err(|_| invalid())?;
                Ok(Self { value, px2: true })
            },
            _ => Err(invalid()),
        }
    }

    fn resolve(&self, context: &MatchContext<'_>) -> f64 {
        if self.px2 { self.value * context.meters_per_pixel_sq } else { self.value }
    }
}

/// Compiled filter expression.
#[derive(Clone)]
pub enum Predicate {
    Equals(PropertyKey, Value),
    OneOf(PropertyKey, Vec<Value>),
    Exists(PropertyKey, bool),
    /// Numeric range, minimum inclusive and maximum exclusive.
    Range { key: PropertyKey, min: Option<Bound>, max: Option<Bound> },
    ZoomRange { min: Option<f64>, max: Option<f64> },
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Custom { name: String, function: FilterFunction },
}

impl Debug for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(key, value) => f.debug_tuple("Equals").field(key).field(value).finish(),
            Self::OneOf(key, values) => f.debug_tuple("OneOf").field(key).field(values).finish(),
            Self::Exists(key, exists) => f.debug_tuple("Exists").field(key).field(exists).finish(),
            Self::Range { key, min, max } => {
                let mut range = f.debug_struct("Range");
                range.field("key", key).field("min", min).field("max", max).finish()
            },
            Self::ZoomRange { min, max } => {
                f.debug_struct("ZoomRange").field("min", min).field("max", max).finish()
            },
            Self::All(predicates) => f.debug_tuple("All").field(predicates).finish(),
            Self::Any(predicates) => f.debug_tuple("Any").field(predicates).finish(),
            Self::Not(predicate) => f.debug_tuple("Not").field(predicate).finish(),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

impl Predicate {
    /// Compile a filter expression.
    ///
    /// Objects require all their entries to match, arrays require any of
    /// their elements to match and strings call a named filter function.
    pub fn compile(filter: &Value, functions: &FilterFunctions) -> Result<Self, FilterError> {
        match filter {
            Value::Null => Ok(Self::All(Vec::new())),
            Value::Bool(true) => Ok(Self::All(Vec::new())),
            Value::Bool(false) => Ok(Self::Any(Vec::new())),
            Value::Object(entries) => {
                let predicates =
                    entries.iter().map(|(key, value)| Self::entry(key, value, functions));
                Ok(Self::All(predicates.collect::<Result<_, _>>()?))
            },
            Value::Array(filters) => Ok(Self::Any(Self::compile_all(filters, functions)?)),
            Value::String(name) => {
                Ok(Self::Custom { name: name.clone(), function: functions.get(name)? })
            },
            Value::Number(_) => Err(FilterError::Invalid(String::new(), filter.clone())),
        }
    }

    /// Compile a single `key: value` filter entry.
    fn entry(key: &str, value: &Value, functions: &FilterFunctions) -> Result<Self, FilterError> {
        match key {
            "all" => Ok(Self::All(Self::compile_group(key, value, functions)?)),
            "any" => Ok(Self::Any(Self::compile_group(key, value, functions)?)),
            "none" => {
                let any = Self::Any(Self::compile_group(key, value, functions)?);
                Ok(Self::Not(Box::new(any)))
            },
            "not" => Ok(Self::Not(Box::new(Self::compile(value, functions)?))),
            _ => Self::property(key, value),
        }
    }

    /// Compile the operands of `all`, `any` and `none`.
    fn compile_group(
        key: &str,
        value: &Value,
        functions: &FilterFunctions,
    ) -> Result<Vec<Self>, FilterError> {
        match value {
            Value::Array(filters) => Self::compile_all(filters, functions),
            Value::Object(entries) => {
                entries.iter().map(|(key, value)| Self::entry(key, value, functions)).collect()
            },
            _ => Err(FilterError::Invalid(key.into(), value.clone())),
        }
    }

    fn compile_all(
        filters: &[Value],
        functions: &FilterFunctions,
    ) -> Result<Vec<Self>, FilterError> {
        filters.iter().map(|filter| Self::compile(filter, functions)).collect()
    }

    /// Compile a property comparison.
    fn property(key: &str, value: &Value) -> Result<Self, FilterError> {
        let property = PropertyKey::parse(key);
        match value {
            Value::String(_) | Value::Number(_) => Ok(Self::Equals(property, value.clone())),
            Value::Array(values) => Ok(Self::OneOf(property, values.clone())),
            Value::Bool(exists) => Ok(Self::Exists(property, *exists)),
            Value::Object(range) if range.contains_key("min") || range.contains_key("max") => {
                let min = range.get("min").map(|min| Bound::parse(key, min)).transpose()?;
                let max = range.get("max").map(|max| Bound::parse(key, max)).transpose()?;

                let px2 = min.iter().chain(&max).any(|bound| bound.px2);
                if property == PropertyKey::Context("zoom".into()) && !px2 {
                    Ok(Self::ZoomRange { min: min.map(|b| b.value), max: max.map(|b| b.value) })
                } else {
                    Ok(Self::Range { key: property, min, max })
                }
            },
            _ => Err(FilterError::Invalid(key.into(), value.clone())),
        }
    }

    /// Evaluate the predicate.
    pub fn matches(&self, context: &MatchContext<'_>) -> Result<bool, FilterError> {
        match self {
            Self::Equals(key, expected) => {
                Ok(context.lookup(key).is_some_and(|value| values_match(&value, expected)))
            },
            Self::OneOf(key, expected) => Ok(context.lookup(key).is_some_and(|value| {
                expected.iter().any(|expected| values_match(&value, expected))
            })),
            Self::Exists(key, exists) => {
                Ok(context.lookup(key).is_some_and(|value| !value.is_null()) == *exists)
            },
            Self::Range { key, min, max } => {
                let value = match context.lookup(key).and_then(|value| value.as_f64()) {
                    Some(value) => value,
                    None => return Ok(false),
                };
                let min = min.map(|bound| bound.resolve(context));
                let max = max.map(|bound| bound.resolve(context));
                Ok(in_range(value, min, max))
            },
            Self::ZoomRange { min, max } => Ok(in_range(context.zoom, *min, *max)),
            Self::All(predicates) => {
                for predicate in predicates {
                    if !predicate.matches(context)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            },
            Self::Any(predicates) => {
                for predicate in predicates {
                    if predicate.matches(context)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            },
            Self::Not(predicate) => Ok(!predicate.matches(context)?),
            Self::Custom { function, .. } => function(context),
        }
    }
}

/// Bitset of zoom levels a layer applies to.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct ZoomMask(u32);

impl Default for ZoomMask {
    fn default() -> Self {
        Self::all()
    }
}

impl ZoomMask {
    pub const fn all() -> Self {
        Self((1 << (MAX_STYLE_ZOOM + 1)) - 1)
    }

    /// Build a mask from a `$zoom` filter value.
    pub fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::Number(zoom) => Some(Self::level(zoom.as_f64()?)),
            Value::Array(zooms) => zooms.iter().try_fold(Self(0), |mask, zoom| {
                Some(Self(mask.0 | Self::level(zoom.as_f64()?).0))
            }),
            Value::Object(range) => {
                let min = match range.get("min") {
                    Some(min) => min.as_f64()?.ceil().max(0.) as u32,
                    None => 0,
                };
                let max = match range.get("max") {
                    Some(max) => max.as_f64()?.ceil().max(0.) as u32,
                    None => MAX_STYLE_ZOOM as u32 + 1,
                };

                let max = max.min(MAX_STYLE_ZOOM as u32 + 1);
                let mask = (min..max).fold(0, |mask, z| mask | (1 << z));
                Some(Self(mask))
            },
            _ => None,
        }
    }

    fn level(zoom: f64) -> Self {
        let zoom = zoom.floor().clamp(0., MAX_STYLE_ZOOM as f64) as u32;
        Self(1 << zoom)
    }

    pub fn contains(&self, zoom: u8) -> bool {
        zoom <= MAX_STYLE_ZOOM && self.0 & (1 << zoom) != 0
    }
}

/// Filter split into its fast rejection tests and the general predicate.
#[derive(Clone, Debug, Default)]
pub struct CompiledFilter {
    pub zoom: ZoomMask,
    /// Direct equality tests against feature properties.
    pub feature_props: Vec<(String, Vec<Value>)>,
    /// Direct equality tests against context values.
    pub context_props: Vec<(String, Vec<Value>)>,
    pub predicate: Option<Predicate>,
}

impl CompiledFilter {
    /// Compile a layer filter.
    ///
    /// Top-level `$zoom` and plain equality entries are extracted so they can
    /// be tested before the general predicate.
    pub fn compile(filter: &Value, functions: &FilterFunctions) -> Result<Self, FilterError> {
        let entries = match filter {
            Value::Object(entries) => entries,
            Value::Null => return Ok(Self::default()),
            filter => {
                let predicate = Predicate::compile(filter, functions)?;
                return Ok(Self { predicate: Some(predicate), ..Default::default() });
            },
        };

        let mut compiled = Self::default();
        let mut remaining = Map::new();
        for (key, value) in entries {
            if key == "$zoom" {
                compiled.zoom = ZoomMask::parse(value)
                    .ok_or_else(|| FilterError::Invalid(key.clone(), value.clone()))?;
                continue;
            }

            let values = match value {
                Value::String(_) | Value::Number(_) => vec![value.clone()],
                Value::Array(values) if values.iter().all(|v| v.is_string() || v.is_number()) => {
                    values.clone()
                },
                _ => {
                    remaining.insert(key.clone(), value.clone());
                    continue;
                },
            };

            match key.strip_prefix('$') {
                Some(name) => compiled.context_props.push((name.into(), values)),
                None if !key.contains('.') && !is_keyword(key) => {
                    compiled.feature_props.push((key.clone(), values))
                },
                None => {
                    remaining.insert(key.clone(), value.clone());
                },
            }
        }

        if !remaining.is_empty() {
            compiled.predicate = Some(Predicate::compile(&Value::Object(remaining), functions)?);
        }

        Ok(compiled)
    }

    /// Test the filter against a context.
    pub fn matches(&self, context: &MatchContext<'_>) -> Result<bool, FilterError> {
        if !self.zoom.contains(context.zoom_level()) {
            return Ok(false);
        }

        for (key, expected) in &self.feature_props {
            let value = match context.properties.get(key) {
                Some(value) => value,
                None => return Ok(false),
            };
            if !expected.iter().any(|expected| values_match(value, expected)) {
                return Ok(false);
            }
        }

        for (name, expected) in &self.context_props {
            let value = match context.lookup(&PropertyKey::Context(name.clone())) {
                Some(value) => value,
                None => return Ok(false),
            };
            if !expected.iter().any(|expected| values_match(&value, expected)) {
                return Ok(false);
            }
        }

        match &self.predicate {
            Some(predicate) => predicate.matches(context),
            None => Ok(true),
        }
    }
}

/// Check if a key is a filter operator rather than a property name.
fn is_keyword(key: &str) -> bool {
    matches!(key, "all" | "any" | "none" | "not")
}

/// Compare values, treating all numbers as floats.
fn values_match(value: &Value, expected: &Value) -> bool {
    match (value.as_f64(), expected.as_f64()) {
        (Some(value), Some(expected)) => value == expected,
        _ => value == expected,
    }
}

fn in_range(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
    min.is_none_or(|min| value >= min) && max.is_none_or(|max| value < max)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn matches(filter: Value, properties: Value, zoom: f64) -> bool {
        let properties = properties.as_object().cloned().unwrap_or_default();
        let context = MatchContext { geometry: "polygon", ..MatchContext::new(&properties, zoom) };
        let filter = CompiledFilter::compile(&filter, &FilterFunctions::new()).unwrap();
        filter.matches(&context).unwrap()
    }

    #[test]
    fn zoom_ranges() {
        let filter = json!({ "$zoom": { "min": 5 } });
        assert!(!matches(filter.clone(), json!({}), 3.));
        assert!(matches(filter.clone(), json!({}), 5.));
        assert!(matches(filter, json!({}), 6.5));

        let filter = json!({ "$zoom": { "min": 5, "max": 7 } });
        assert!(matches(filter.clone(), json!({}), 6.9));
        assert!(!matches(filter, json!({}), 7.));

        let filter = json!({ "$zoom": [3, 9] });
        assert!(matches(filter.clone(), json!({}), 9.));
        assert!(!matches(filter, json!({}), 4.));
    }

    #[test]
    fn zoom_mask() {
        assert_eq!(ZoomMask::parse(&json!({})), Some(ZoomMask::all()));
        assert_eq!(ZoomMask::parse(&json!(2)), Some(ZoomMask(0b100)));
        assert_eq!(ZoomMask::parse(&json!({ "min": 1, "max": 3 })), Some(ZoomMask(0b110)));
        assert_eq!(ZoomMask::parse(&json!("high")), None);
        assert!(ZoomMask::all().contains(MAX_STYLE_ZOOM));
        assert!(!ZoomMask::all().contains(MAX_STYLE_ZOOM + 1));
    }

    #[test]
    fn property_equality() {
        let filter = json!({ "kind": ["major_road", "highway"] });
        assert!(matches(filter.clone(), json!({ "kind": "highway" }), 10.));
        assert!(!matches(filter.clone(), json!({ "kind": "path" }), 10.));
        assert!(!matches(filter, json!({}), 10.));

        assert!(matches(json!({ "lanes": 2 }), json!({ "lanes": 2.0 }), 10.));
        assert!(matches(json!({ "$geometry": "polygon" }), json!({}), 10.));
        assert!(!matches(json!({ "$geometry": ["point", "line"] }), json!({}), 10.));
    }

    #[test]
    fn nested_and_boolean_operators() {
        let properties = json!({ "name": "Elbe", "names": { "de": "Elbe" }, "tunnel": true });
        assert!(matches(json!({ "names.de": "Elbe" }), properties.clone(), 10.));
        assert!(matches(json!({ "tunnel": true, "bridge": false }), properties.clone(), 10.));
        assert!(!matches(json!({ "not": { "name": "Elbe" } }), properties.clone(), 10.));
        let rivers = json!([{ "name": "Rhein" }, { "name": "Elbe" }]);
        assert!(matches(json!({ "any": rivers.clone() }), properties.clone(), 10.));
        assert!(!matches(json!({ "none": rivers }), properties.clone(), 10.));
        assert!(matches(json!([{ "name": "Rhein" }, { "tunnel": true }]), properties, 10.));
    }

    #[test]
    fn area_ranges() {
        let properties = json!({ "area": 500 });
        assert!(matches(json!({ "area": { "min": 100, "max": 1000 } }), properties.clone(), 10.));
        assert!(!matches(json!({ "area": { "max": 500 } }), properties.clone(), 10.));

        // Square pixels are scaled by the context's squared meters per pixel.
        let map = properties.as_object().cloned().unwrap();
        let context = MatchContext { meters_per_pixel_sq: 10., ..MatchContext::new(&map, 10.) };
        let filter = json!({ "area": { "min": "40px2" } });
        let filter = CompiledFilter::compile(&filter, &FilterFunctions::new()).unwrap();
        assert!(filter.matches(&context).unwrap());

        let context = MatchContext { meters_per_pixel_sq: 20., ..context };
        assert!(!filter.matches(&context).unwrap());
    }

    #[test]
    fn custom_functions() {
        let mut functions = FilterFunctions::new();
        functions.register("is_long", |context| {
            Ok(context.properties.get("length").and_then(Value::as_f64).is_some_and(|l| l > 100.))
        });
        functions
            .register("broken", |_| Err(FilterError::Function("broken".into(), "oops".into())));

        let properties = json!({ "length": 150 }).as_object().cloned().unwrap();
        let context = MatchContext::new(&properties, 10.);

        let filter = CompiledFilter::compile(&json!("is_long"), &functions).unwrap();
        assert!(filter.matches(&context).unwrap());

        let filter = json!({ "all": ["is_long", "broken"] });
        let filter = CompiledFilter::compile(&filter, &functions).unwrap();
        assert!(filter.matches(&context).is_err());

        let missing = CompiledFilter::compile(&json!("missing"), &functions);
        assert!(matches!(missing, Err(FilterError::UnknownFunction(_))));
    }

    #[test]
    fn context_globals() {
        let properties = Map::new();
        let globals = json!({ "language": "de" }).as_object().cloned().unwrap();
        let context =
            MatchContext { globals: Some(&globals), ..MatchContext::new(&properties, 1.) };
        let functions = FilterFunctions::new();

        let filter = CompiledFilter::compile(&json!({ "$language": "de" }), &functions);
        assert!(filter.unwrap().matches(&context).unwrap());

        let filter = CompiledFilter::compile(&json!({ "$language": "fr" }), &functions);
        assert!(!filter.unwrap().matches(&context).unwrap());
    }
}
