use std::sync::LazyLock;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use regex::{Captures, Regex};

use crate::config::OutputStyle;
use crate::pipeline::{Asset, Transform};

static RE_GLOB_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*@import\s+["']([^"']*[*?\[][^"']*)["']\s*;[ \t]*\r?\n?"#).unwrap()
});

static RE_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^\w.\-])(-?)(\d*)\.(\d+)").unwrap());

/// Quoted strings and `url(..)` bodies, which are never rounded.
static RE_VERBATIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:[^"\\\n]|\\.)*"|'(?:[^'\\\n]|\\.)*'|(?i:url)\([^)]*\)"#).unwrap()
});

/// Expands wildcard `@import` statements into one import per matching file.
///
/// Patterns are resolved relative to the importing file. Matches are sorted
/// so the expansion is stable; a pattern without matches drops the import.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobImports;

impl Transform for GlobImports {
    fn name(&self) -> &'static str {
        "glob-imports"
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset> {
        let dir = asset.origin.parent().unwrap_or(Utf8Path::new(""));
        let text = asset.text()?;

        if !RE_GLOB_IMPORT.is_match(text) {
            return Ok(asset);
        }

        let mut failure = None;
        let expanded = RE_GLOB_IMPORT
            .replace_all(text, |caps: &Captures| match expand_import(dir, &caps[1]) {
                Ok(lines) => lines,
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            })
            .into_owned();

        if let Some(e) = failure {
            return Err(e);
        }

        Ok(asset.with_text(expanded))
    }
}

fn expand_import(dir: &Utf8Path, pattern: &str) -> anyhow::Result<String> {
    let full = dir.join(pattern);
    let mut matches = Vec::new();

    for entry in glob::glob(full.as_str()).with_context(|| format!("bad import glob '{pattern}'"))? {
        let path = Utf8PathBuf::try_from(entry?)?;
        if path.is_file() {
            matches.push(path);
        }
    }
    matches.sort();

    let mut lines = String::new();
    for path in matches {
        let relative = path.strip_prefix(dir).unwrap_or(&path);
        lines.push_str(&format!("@import \"{relative}\";\n"));
    }

    Ok(lines)
}

/// Compiles Sass or SCSS to CSS with `grass`.
///
/// Partials are resolved relative to the source file. The output is renamed
/// to `.css`.
#[derive(Debug, Clone, Copy)]
pub struct Sass {
    pub style: OutputStyle,
    pub precision: u8,
}

impl Sass {
    pub fn new(style: OutputStyle, precision: u8) -> Self {
        Self { style, precision }
    }
}

impl Default for Sass {
    fn default() -> Self {
        Self::new(OutputStyle::default(), 10)
    }
}

impl Transform for Sass {
    fn name(&self) -> &'static str {
        "sass"
    }

    fn params(&self) -> String {
        format!("{}-p{}", self.style, self.precision)
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset> {
        let style = match self.style {
            OutputStyle::Compressed => grass::OutputStyle::Compressed,
            // grass only knows two styles
            OutputStyle::Compact | OutputStyle::Nested | OutputStyle::Expanded => {
                grass::OutputStyle::Expanded
            }
        };

        let syntax = match asset.origin.extension() {
            Some("sass") => grass::InputSyntax::Sass,
            _ => grass::InputSyntax::Scss,
        };

        let mut options = grass::Options::default().style(style).input_syntax(syntax);
        if let Some(dir) = asset.origin.parent() {
            options = options.load_path(dir);
        }

        let css = grass::from_string(asset.text()?, &options)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let css = if self.precision < 10 {
            round_decimals(&css, self.precision)
        } else {
            css
        };

        let path = asset.path.with_extension("css");
        Ok(asset.with_text(css).with_path(path))
    }
}

/// Rounds every decimal number in `css` to at most `precision` digits after
/// the point, dropping trailing zeros. Strings and `url(..)` stay as written.
pub(crate) fn round_decimals(css: &str, precision: u8) -> String {
    let mut out = String::with_capacity(css.len());
    let mut last = 0;

    for verbatim in RE_VERBATIM.find_iter(css) {
        out.push_str(&round_numbers(&css[last..verbatim.start()], precision));
        out.push_str(verbatim.as_str());
        last = verbatim.end();
    }
    out.push_str(&round_numbers(&css[last..], precision));

    out
}

fn round_numbers(css: &str, precision: u8) -> String {
    RE_DECIMAL
        .replace_all(css, |caps: &Captures| {
            let (prefix, sign, int, frac) = (&caps[1], &caps[2], &caps[3], &caps[4]);

            if frac.len() <= precision as usize {
                return caps[0].to_string();
            }

            let value: f64 = format!("{int}.{frac}").parse().unwrap_or_default();
            let mut rounded = format!("{value:.*}", precision as usize);

            if rounded.contains('.') {
                rounded = rounded.trim_end_matches('0').trim_end_matches('.').to_string();
            }
            if int.is_empty()
                && let Some(stripped) = rounded.strip_prefix('0')
                && !stripped.is_empty()
            {
                rounded = stripped.to_string();
            }

            let sign = if rounded.chars().all(|c| c == '0' || c == '.') {
                ""
            } else {
                sign
            };

            format!("{prefix}{sign}{rounded}")
        })
        .into_owned()
}
