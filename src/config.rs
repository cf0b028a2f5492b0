//! The configuration store.
//!
//! [`Config`] is a flat, immutable mapping from option names to [`Value`]s.
//! It is created once at startup, either from the built-in definition or from
//! a TOML file, and then turned into typed [`Settings`] that every task reads.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ConfigError;

/// A single configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Bool(bool),
    Number(f64),
    List(Vec<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::String(_) => "a string",
            Value::Bool(_) => "a boolean",
            Value::Number(_) => "a number",
            Value::List(_) => "a list of strings",
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<&[&str]> for Value {
    fn from(value: &[&str]) -> Self {
        Value::List(value.iter().map(|s| s.to_string()).collect())
    }
}

/// Immutable key → value lookups for paths, globs and options.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: BTreeMap<String, Value>,
}

/// Browsers you care about for autoprefixing.
const BROWSERS_LIST: &[&str] = &[
    "last 2 version",
    "> 1%",
    "ie >= 11",
    "last 1 Android versions",
    "last 1 ChromeAndroid versions",
    "last 2 Chrome versions",
    "last 2 Firefox versions",
    "last 2 Safari versions",
    "last 2 iOS versions",
    "last 2 Edge versions",
    "last 2 Opera versions",
];

impl Config {
    /// The static definition used when no configuration file is present.
    pub fn builtin() -> Self {
        let values: [(&str, Value); 23] = [
            ("project_url", "localhost:3000".into()),
            ("browser_auto_open", false.into()),
            ("inject_changes", true.into()),
            ("style_src", "./assets/sass/main.scss".into()),
            ("style_destination", "./assets/css".into()),
            ("output_style", "compact".into()),
            ("precision", 10.0.into()),
            ("js_vendor_src", "./build/script/vendor/**/*.js".into()),
            ("js_custom_src", "./build/script/custom/*.js".into()),
            ("js_custom_destination", "./build/script/".into()),
            ("js_custom_file", "scripts".into()),
            ("img_src", "./images/img/raw/**/*".into()),
            ("img_dst", "./build/img/".into()),
            ("icon_src", "./images/icons/input/**/*".into()),
            ("icon_dst", "./build/img/icons/".into()),
            ("icon_sprite_file", "icons".into()),
            ("watch_styles", "./assets/sass/**/*.scss".into()),
            ("watch_js_vendor", "./build/script/vendor/*.js".into()),
            ("watch_js_custom", "./build/script/custom/*.js".into()),
            ("watch_templates", "./docs/templates/**/*.php".into()),
            ("browsers_list", BROWSERS_LIST.into()),
            ("max_line_len", 10.0.into()),
            ("cache_dir", ".cache/nagare".into()),
        ];

        Self {
            values: values
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        }
    }

    /// Parses a flat TOML table.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = text.parse()?;
        let mut values = BTreeMap::new();

        for (key, value) in table {
            let value = match value {
                toml::Value::String(s) => Value::String(s),
                toml::Value::Boolean(b) => Value::Bool(b),
                toml::Value::Integer(i) => Value::Number(i as f64),
                toml::Value::Float(f) => Value::Number(f),
                toml::Value::Array(items) => Value::List(
                    items
                        .into_iter()
                        .map(|item| match item {
                            toml::Value::String(s) => Ok(s),
                            _ => Err(ConfigError::Malformed {
                                key: key.clone(),
                                reason: "lists may only contain strings".into(),
                            }),
                        })
                        .collect::<Result<_, _>>()?,
                ),
                other => {
                    return Err(ConfigError::Malformed {
                        key,
                        reason: format!("unsupported value type '{}'", other.type_str()),
                    });
                }
            };

            values.insert(key, value);
        }

        Ok(Self { values })
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        Self::from_toml(&text)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn string(&self, key: &str) -> Result<&str, ConfigError> {
        match self.require(key)? {
            Value::String(s) => Ok(s),
            other => Err(wrong_type(key, "a string", other)),
        }
    }

    pub fn string_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str, ConfigError> {
        self.optional(key, default, |value| match value {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }, "a string")
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        self.optional(key, default, |value| match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }, "a boolean")
    }

    pub fn number_or(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        self.optional(key, default, |value| match value {
            Value::Number(n) => Some(*n),
            _ => None,
        }, "a number")
    }

    pub fn list(&self, key: &str) -> Result<&[String], ConfigError> {
        match self.require(key)? {
            Value::List(list) => Ok(list),
            other => Err(wrong_type(key, "a list of strings", other)),
        }
    }

    /// A glob setting may be a single pattern or a list of patterns.
    pub fn globs(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.require(key)? {
            Value::String(s) => Ok(vec![s.clone()]),
            Value::List(list) => Ok(list.clone()),
            other => Err(wrong_type(key, "a glob or a list of globs", other)),
        }
    }

    /// Like [`Config::globs`], but a missing key yields no patterns.
    pub fn globs_or_empty(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.get(key) {
            Some(_) => self.globs(key),
            None => Ok(Vec::new()),
        }
    }

    fn require(&self, key: &str) -> Result<&Value, ConfigError> {
        self.values
            .get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn optional<'a, T>(
        &'a self,
        key: &str,
        default: T,
        extract: impl Fn(&'a Value) -> Option<T>,
        expected: &'static str,
    ) -> Result<T, ConfigError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(value) => extract(value).ok_or_else(|| wrong_type(key, expected, value)),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str, found: &Value) -> ConfigError {
    tracing::debug!(key, found = found.kind(), "configuration type mismatch");
    ConfigError::WrongType {
        key: key.to_string(),
        expected,
    }
}

/// Sass output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputStyle {
    #[default]
    Compact,
    Compressed,
    Nested,
    Expanded,
}

impl FromStr for OutputStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compact" => Ok(Self::Compact),
            "compressed" => Ok(Self::Compressed),
            "nested" => Ok(Self::Nested),
            "expanded" => Ok(Self::Expanded),
            other => Err(format!(
                "'{other}' is not one of compact, compressed, nested, expanded"
            )),
        }
    }
}

impl fmt::Display for OutputStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Compact => "compact",
            Self::Compressed => "compressed",
            Self::Nested => "nested",
            Self::Expanded => "expanded",
        })
    }
}

/// Line terminator written by the line ending normalization stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl FromStr for LineEnding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lf" => Ok(Self::Lf),
            "crlf" => Ok(Self::CrLf),
            other => Err(format!("'{other}' is not one of lf, crlf")),
        }
    }
}

/// Typed view over [`Config`], resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_url: String,
    pub browser_auto_open: bool,
    pub inject_changes: bool,
    pub server_port: u16,
    pub reload_port: u16,
    /// Serve this directory instead of proxying `project_url`.
    pub server_root: Option<Utf8PathBuf>,

    pub style_src: Vec<String>,
    pub style_destination: Utf8PathBuf,
    pub output_style: OutputStyle,
    pub precision: u8,
    pub max_line_len: Option<usize>,
    pub line_ending: LineEnding,

    pub js_vendor_src: Vec<String>,
    pub js_custom_src: Vec<String>,
    pub js_custom_destination: Utf8PathBuf,
    pub js_custom_file: String,

    pub img_src: Vec<String>,
    pub img_dst: Utf8PathBuf,
    pub jpeg_quality: u8,

    pub icon_src: Vec<String>,
    pub icon_dst: Utf8PathBuf,
    pub icon_sprite_file: String,
    pub icon_strip_fill: bool,

    pub watch_styles: Vec<String>,
    pub watch_js_vendor: Vec<String>,
    pub watch_js_custom: Vec<String>,
    pub watch_templates: Vec<String>,

    pub browsers: Vec<String>,
    pub cache_dir: Utf8PathBuf,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let max_line_len = config.number_or("max_line_len", 0.0)?;

        Ok(Self {
            project_url: config.string_or("project_url", "localhost:3000")?.to_string(),
            browser_auto_open: config.bool_or("browser_auto_open", false)?,
            inject_changes: config.bool_or("inject_changes", true)?,
            server_port: bounded(config, "server_port", 8080.0, 1.0, u16::MAX as f64)? as u16,
            reload_port: bounded(config, "reload_port", 1337.0, 0.0, u16::MAX as f64)? as u16,
            server_root: config
                .get("server_root")
                .map(|_| config.string("server_root").map(Utf8PathBuf::from))
                .transpose()?,

            style_src: config.globs("style_src")?,
            style_destination: config.string("style_destination")?.into(),
            output_style: parse(config, "output_style", "compact")?,
            precision: bounded(config, "precision", 10.0, 0.0, 20.0)? as u8,
            max_line_len: (max_line_len >= 1.0).then_some(max_line_len as usize),
            line_ending: parse(config, "line_ending", "lf")?,

            js_vendor_src: config.globs_or_empty("js_vendor_src")?,
            js_custom_src: config.globs_or_empty("js_custom_src")?,
            js_custom_destination: config
                .string_or("js_custom_destination", "./build/script/")?
                .into(),
            js_custom_file: config.string_or("js_custom_file", "scripts")?.to_string(),

            img_src: config.globs("img_src")?,
            img_dst: config.string("img_dst")?.into(),
            jpeg_quality: bounded(config, "jpeg_quality", 85.0, 1.0, 100.0)? as u8,

            icon_src: config.globs_or_empty("icon_src")?,
            icon_dst: config.string_or("icon_dst", "./build/img/icons/")?.into(),
            icon_sprite_file: config.string_or("icon_sprite_file", "icons")?.to_string(),
            icon_strip_fill: config.bool_or("icon_strip_fill", false)?,

            watch_styles: config.globs("watch_styles")?,
            watch_js_vendor: config.globs_or_empty("watch_js_vendor")?,
            watch_js_custom: config.globs_or_empty("watch_js_custom")?,
            watch_templates: config.globs_or_empty("watch_templates")?,

            browsers: match config.get("browsers_list") {
                Some(_) => config.list("browsers_list")?.to_vec(),
                None => Vec::new(),
            },
            cache_dir: config.string_or("cache_dir", ".cache/nagare")?.into(),
        })
    }
}

fn parse<T>(config: &Config, key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = String>,
{
    config
        .string_or(key, default)?
        .parse()
        .map_err(|reason| ConfigError::Malformed {
            key: key.to_string(),
            reason,
        })
}

fn bounded(config: &Config, key: &str, default: f64, min: f64, max: f64) -> Result<f64, ConfigError> {
    let value = config.number_or(key, default)?;

    if value.fract() != 0.0 || value < min || value > max {
        return Err(ConfigError::Malformed {
            key: key.to_string(),
            reason: format!("expected a whole number between {min} and {max}, got {value}"),
        });
    }

    Ok(value)
}
