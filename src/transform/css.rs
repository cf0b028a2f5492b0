//! CSS post-processing on top of `lightningcss`.

use lightningcss::rules::CssRule;
use lightningcss::rules::media::MediaRule;
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::targets::{Browsers, Targets};
use lightningcss::traits::ToCss;

use crate::error::PipelineError;
use crate::pipeline::{Asset, Transform};

/// Resolves a browserslist query into `lightningcss` targets.
pub fn targets(stage: &str, browsers: &[String]) -> Result<Targets, PipelineError> {
    if browsers.is_empty() {
        return Ok(Targets::default());
    }

    let browsers = Browsers::from_browserslist(browsers).map_err(|e| PipelineError::Option {
        stage: stage.to_string(),
        reason: e.to_string(),
    })?;

    Ok(browsers.map(Targets::from).unwrap_or_default())
}

fn parse(css: &str) -> anyhow::Result<StyleSheet<'_>> {
    StyleSheet::parse(css, ParserOptions::default()).map_err(|e| anyhow::anyhow!("{e}"))
}

/// Removes `/* */` comments outside of strings. `/*! */` comments stay.
#[derive(Debug, Default, Clone, Copy)]
pub struct StripComments;

impl Transform for StripComments {
    fn name(&self) -> &'static str {
        "strip-comments"
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset> {
        let css = strip_comments(asset.text()?);
        Ok(asset.with_text(css))
    }
}

pub(crate) fn strip_comments(css: &str) -> String {
    let bytes = css.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len);
    let mut i = 0;

    while i < len {
        match bytes[i] {
            quote @ (b'"' | b'\'') => {
                let start = i;
                i += 1;
                while i < len {
                    match bytes[i] {
                        b'\\' => i += 2,
                        b if b == quote => {
                            i += 1;
                            break;
                        }
                        _ => i += 1,
                    }
                }
                out.push_str(&css[start..i.min(len)]);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = css[i + 2..]
                    .find("*/")
                    .map_or(len, |offset| i + 2 + offset + 2);

                if bytes.get(i + 2) == Some(&b'!') {
                    out.push_str(&css[i..end]);
                }
                i = end;
            }
            _ => {
                let start = i;
                while i < len && !matches!(bytes[i], b'"' | b'\'' | b'/') {
                    i += 1;
                }
                if i == start {
                    i += 1;
                }
                out.push_str(&css[start..i]);
            }
        }
    }

    out
}

/// Adds and removes vendor prefixes for the configured browsers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Autoprefix {
    targets: Targets,
}

impl Autoprefix {
    pub fn new(targets: Targets) -> Self {
        Self { targets }
    }
}

impl Transform for Autoprefix {
    fn name(&self) -> &'static str {
        "autoprefix"
    }

    fn params(&self) -> String {
        format!("{:?}", self.targets)
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset> {
        let css = {
            let mut sheet = parse(asset.text()?)?;

            sheet
                .minify(MinifyOptions {
                    targets: self.targets,
                    ..MinifyOptions::default()
                })
                .map_err(|e| anyhow::anyhow!("{e}"))?;

            sheet
                .to_css(PrinterOptions {
                    targets: self.targets,
                    ..PrinterOptions::default()
                })
                .map_err(|e| anyhow::anyhow!("{e}"))?
                .code
        };

        Ok(asset.with_text(css))
    }
}

/// Moves every `@media` block after the plain rules and merges blocks that
/// share the same query, in order of first appearance.
///
/// Queries are printed for `targets`, so they keep the syntax the stylesheet
/// was compiled for.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeMediaQueries {
    targets: Targets,
}

impl MergeMediaQueries {
    pub fn new(targets: Targets) -> Self {
        Self { targets }
    }
}

impl Transform for MergeMediaQueries {
    fn name(&self) -> &'static str {
        "merge-media-queries"
    }

    fn params(&self) -> String {
        format!("{:?}", self.targets)
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset> {
        match merge_media(asset.text()?, self.targets)? {
            Some(css) => Ok(asset.with_text(css)),
            None => Ok(asset),
        }
    }
}

fn merge_media(css: &str, targets: Targets) -> anyhow::Result<Option<String>> {
    let printer = || PrinterOptions {
        targets,
        ..PrinterOptions::default()
    };

    let mut sheet = parse(css)?;

    let mut plain = Vec::new();
    let mut media: Vec<(String, MediaRule<'_>)> = Vec::new();

    for rule in std::mem::take(&mut sheet.rules.0) {
        match rule {
            CssRule::Media(rule) => {
                let query = rule
                    .query
                    .to_css_string(printer())
                    .map_err(|e| anyhow::anyhow!("{e}"))?;

                match media.iter().position(|(key, _)| *key == query) {
                    Some(i) => media[i].1.rules.0.extend(rule.rules.0),
                    None => media.push((query, rule)),
                }
            }
            other => plain.push(other),
        }
    }

    if media.is_empty() {
        return Ok(None);
    }

    plain.extend(media.into_iter().map(|(_, rule)| CssRule::Media(rule)));
    sheet.rules.0 = plain;

    let css = sheet
        .to_css(printer())
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .code;

    Ok(Some(css))
}

/// Minifies CSS, optionally breaking lines after a closing brace once a line
/// reaches `max_line_len` characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Minify {
    pub targets: Targets,
    pub max_line_len: Option<usize>,
}

impl Minify {
    pub fn new(targets: Targets, max_line_len: Option<usize>) -> Self {
        Self {
            targets,
            max_line_len,
        }
    }
}

impl Transform for Minify {
    fn name(&self) -> &'static str {
        "minify"
    }

    fn params(&self) -> String {
        format!("{:?}-{:?}", self.targets, self.max_line_len)
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset> {
        let css = {
            let mut sheet = parse(asset.text()?)?;

            sheet
                .minify(MinifyOptions {
                    targets: self.targets,
                    ..MinifyOptions::default()
                })
                .map_err(|e| anyhow::anyhow!("{e}"))?;

            sheet
                .to_css(PrinterOptions {
                    minify: true,
                    targets: self.targets,
                    ..PrinterOptions::default()
                })
                .map_err(|e| anyhow::anyhow!("{e}"))?
                .code
        };

        let css = match self.max_line_len {
            Some(max) => break_lines(&css, max),
            None => css,
        };

        Ok(asset.with_text(css))
    }
}

pub(crate) fn break_lines(css: &str, max: usize) -> String {
    let mut out = String::with_capacity(css.len() + css.len() / max.max(1));
    let mut quote = None;
    let mut escaped = false;
    let mut line = 0;

    for c in css.chars() {
        out.push(c);
        line += 1;

        match (quote, c) {
            (Some(_), _) if escaped => escaped = false,
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '\n') => line = 0,
            (None, '}') if line >= max => {
                out.push('\n');
                line = 0;
            }
            (None, _) => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_are_stripped_outside_strings() {
        let css = r#"a{}/* gone */b{content:"/* kept */"}/*! license */c{}"#;
        assert_eq!(
            strip_comments(css),
            r#"a{}b{content:"/* kept */"}/*! license */c{}"#
        );
    }

    #[test]
    fn unterminated_comment_runs_to_the_end() {
        assert_eq!(strip_comments("a{}/* open"), "a{}");
    }

    #[test]
    fn comments_keep_multibyte_text() {
        assert_eq!(strip_comments("a{content:'ő'}/*ű*/b/c"), "a{content:'ő'}b/c");
    }

    #[test]
    fn duplicate_media_blocks_are_merged() {
        let css = "\
@media (max-width: 500px) { .one { color: red } }
.plain { color: blue }
@media (max-width: 500px) { .two { color: green } }
@media print { .three { display: none } }
";
        let targets = targets("merge", &["ie >= 11".to_string()]).unwrap();
        let merged = merge_media(css, targets).unwrap().unwrap();

        assert_eq!(merged.matches("@media").count(), 2);
        assert!(!merged.contains("width <="), "{merged}");

        let plain = merged.find(".plain").unwrap();
        let first = merged.find("max-width").unwrap();
        let print = merged.find("print").unwrap();
        assert!(plain < first && first < print);
        assert!(merged.find(".one").unwrap() < merged.find(".two").unwrap());
        assert!(merged.find(".two").unwrap() < print);
    }

    #[test]
    fn no_media_leaves_input_alone() {
        assert_eq!(merge_media("a { color: red }", Targets::default()).unwrap(), None);
    }

    #[test]
    fn minifies() {
        let asset = Asset::new("a.css", "a {\n  color: red;\n}\n");
        let asset = Minify::default().apply(asset).unwrap();
        assert_eq!(asset.text().unwrap(), "a{color:red}");
    }

    #[test]
    fn minify_is_idempotent() {
        let css = ".a { margin: 0 0 0 0; }\n@media (min-width: 10px) { .b { color: #ff0000 } }";
        let once = Minify::default().apply(Asset::new("a.css", css)).unwrap();
        let twice = Minify::default().apply(once.clone()).unwrap();
        assert_eq!(once.data, twice.data);
    }

    #[test]
    fn binary_input_is_an_error() {
        let asset = Asset::new("a.css", vec![0xff, 0xfe, 0x00]);
        assert!(Minify::default().apply(asset.clone()).is_err());
        assert!(MergeMediaQueries::default().apply(asset).is_err());
    }

    #[test]
    fn long_lines_break_after_rules() {
        assert_eq!(break_lines("a{b:c}d{e:f}g{h:i}", 10), "a{b:c}d{e:f}\ng{h:i}");
        assert_eq!(break_lines("a{content:'}}}}}}}}}}'}", 3), "a{content:'}}}}}}}}}}'}\n");
    }

    #[test]
    fn prefixes_for_old_browsers() {
        let targets = targets("prefix", &["safari 13".to_string()]).unwrap();
        let asset = Asset::new("a.css", ".a { user-select: none }");
        let asset = Autoprefix::new(targets).apply(asset).unwrap();
        assert!(asset.text().unwrap().contains("-webkit-user-select"));
    }

    #[test]
    fn bad_browser_query_is_rejected() {
        assert!(targets("prefix", &["not a browser 99".to_string()]).is_err());
    }
}
