use std::sync::LazyLock;

use anyhow::{Context, bail};
use camino::Utf8PathBuf;
use regex::Regex;

use crate::pipeline::{Asset, Combine, Transform};

static RE_FILL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\sfill\s*=\s*("[^"]*"|'[^']*')"#).unwrap());

/// Turns a standalone SVG into a `<symbol>` named after the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Symbolize {
    /// Drop `fill` attributes so icons can be colored from CSS.
    pub strip_fill: bool,
}

impl Transform for Symbolize {
    fn name(&self) -> &'static str {
        "symbolize"
    }

    fn params(&self) -> String {
        format!("strip-fill={}", self.strip_fill)
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset> {
        let id = asset.path.file_stem().unwrap_or_default().to_string();
        let symbol = symbolize(asset.text()?, &id, self.strip_fill)?;
        Ok(asset.with_text(symbol))
    }
}

fn symbolize(svg: &str, id: &str, strip_fill: bool) -> anyhow::Result<String> {
    let doc = roxmltree::Document::parse(svg).context("invalid SVG")?;
    let root = doc.root_element();

    if root.tag_name().name() != "svg" {
        bail!("root element is <{}>, expected <svg>", root.tag_name().name());
    }

    let view_box = match root.attribute("viewBox") {
        Some(view_box) => view_box.to_string(),
        None => {
            let width = root.attribute("width").map(strip_unit);
            let height = root.attribute("height").map(strip_unit);
            match (width, height) {
                (Some(width), Some(height)) => format!("0 0 {width} {height}"),
                _ => bail!("SVG has neither a viewBox nor a width and height"),
            }
        }
    };

    let inner = match (root.first_child(), root.last_child()) {
        (Some(first), Some(last)) => &svg[first.range().start..last.range().end],
        _ => "",
    };

    let inner = if strip_fill {
        RE_FILL.replace_all(inner, "").into_owned()
    } else {
        inner.to_string()
    };

    Ok(format!(
        r#"<symbol id="{id}" viewBox="{view_box}">{}</symbol>"#,
        inner.trim()
    ))
}

fn strip_unit(value: &str) -> &str {
    value.trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '%')
}

/// Wraps every symbol into one hidden sprite sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sprite {
    pub file: Utf8PathBuf,
    pub class: String,
}

impl Sprite {
    pub fn new(file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            file: file.into(),
            class: "hidden".into(),
        }
    }
}

impl Combine for Sprite {
    fn name(&self) -> &'static str {
        "sprite"
    }

    fn combine(&self, assets: Vec<Asset>) -> anyhow::Result<Asset> {
        let mut svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" class="{}">"#,
            self.class
        );

        for asset in &assets {
            svg.push_str(asset.text()?);
        }
        svg.push_str("</svg>");

        Ok(Asset::new(self.file.clone(), svg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ICON: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 24 24"><path fill="#000" fill-rule="evenodd" d="M0 0h24v24H0z"/></svg>"##;

    #[test]
    fn symbol_takes_id_and_view_box() {
        let symbol = Symbolize::default()
            .apply(Asset::new("arrows/left.svg", ICON))
            .unwrap();

        assert_eq!(
            symbol.text().unwrap(),
            r##"<symbol id="left" viewBox="0 0 24 24"><path fill="#000" fill-rule="evenodd" d="M0 0h24v24H0z"/></symbol>"##
        );
    }

    #[test]
    fn fill_can_be_stripped() {
        let symbol = Symbolize { strip_fill: true }
            .apply(Asset::new("left.svg", ICON))
            .unwrap();

        let text = symbol.text().unwrap();
        assert!(!text.contains("fill=\"#000\""));
        assert!(text.contains("fill-rule=\"evenodd\""));
    }

    #[test]
    fn view_box_from_dimensions() {
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="16px" height="8"><g/></svg>"#;
        assert_eq!(
            symbolize(svg, "x", false).unwrap(),
            r#"<symbol id="x" viewBox="0 0 16 8"><g/></symbol>"#
        );
    }

    #[test]
    fn not_an_svg() {
        assert!(symbolize("<html/>", "x", false).is_err());
        assert!(symbolize("<svg", "x", false).is_err());
    }

    #[test]
    fn sprite_wraps_symbols() {
        let sprite = Sprite::new("icons.svg")
            .combine(vec![
                Asset::new("a.svg", r#"<symbol id="a"/>"#),
                Asset::new("b.svg", r#"<symbol id="b"/>"#),
            ])
            .unwrap();

        assert_eq!(sprite.path.as_str(), "icons.svg");
        let text = sprite.text().unwrap();
        assert!(text.contains(r#"class="hidden""#));
        assert!(text.ends_with(r#"<symbol id="a"/><symbol id="b"/></svg>"#));
    }
}
